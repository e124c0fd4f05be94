//! Managing ostree remotes: the `ostree remote` CLI plus direct edits of
//! the per-remote configuration files.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::BTreeMap;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use tokio::process::Command;
use tracing::debug;

use crate::cmdutils::AsyncCommandRunExt;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::keyfile::{self, Changes};

/// Something that can ask the daemon to re-read its configuration.
#[allow(async_fn_in_trait)]
pub trait ConfigReload {
    /// Best effort; failures are logged, not returned.
    async fn reload(&self);
}

/// Section holding the settings of remote `name`.
pub fn section_name(name: &str) -> String {
    format!("remote \"{name}\"")
}

fn output_lines(output: &str) -> impl Iterator<Item = &str> {
    output.trim().lines().map(|l| l.trim_end_matches('\r')).filter(|l| !l.is_empty())
}

#[derive(Debug, Clone)]
pub struct Remotes {
    ostree_bin: PathBuf,
    remotes_dir: PathBuf,
}

impl Remotes {
    pub fn new(config: &Config) -> Self {
        Self {
            ostree_bin: config.ostree_bin.clone(),
            remotes_dir: config.remotes_dir.clone(),
        }
    }

    fn remote_cmd(&self, verb: &str) -> Command {
        let mut c = Command::new(&self.ostree_bin);
        c.args(["remote", verb]);
        c
    }

    fn config_path(&self, name: &str) -> PathBuf {
        self.remotes_dir.join(format!("{name}.conf"))
    }

    /// Names of all configured remotes, sorted.
    pub async fn list_remotes(&self) -> Result<Vec<String>> {
        let output = self.remote_cmd("list").log_debug().run_get_string().await?;
        let mut r: Vec<String> = output_lines(&output).map(ToOwned::to_owned).collect();
        r.sort();
        Ok(r)
    }

    /// Branches available from `remote`, sorted.
    pub async fn list_branches(&self, remote: &str, sysroot: &impl ConfigReload) -> Result<Vec<String>> {
        sysroot.reload().await;
        let output = self
            .remote_cmd("refs")
            .arg(remote)
            .log_debug()
            .run_get_string()
            .await?;
        let mut r: Vec<String> = output_lines(&output)
            .map(|l| match l.split_once(':') {
                Some((_, branch)) => branch.to_string(),
                None => l.to_string(),
            })
            .collect();
        r.sort();
        Ok(r)
    }

    pub async fn add_remote(&self, name: &str, url: &str, trusted: bool) -> Result<()> {
        self.remote_cmd("add")
            .arg(format!("--set=gpg-verify={trusted}"))
            .args([name, url])
            .log_debug()
            .run()
            .await
    }

    pub async fn delete_remote(&self, name: &str) -> Result<()> {
        self.remote_cmd("delete").arg(name).log_debug().run().await
    }

    /// Import the armored `key` as trusted for `name`.
    pub async fn import_gpg_key(&self, name: &str, key: &str) -> Result<()> {
        self.remote_cmd("gpg-import")
            .args(["--stdin", name])
            .log_debug()
            .run_with_stdin(key.as_bytes())
            .await
    }

    fn read_config(&self, name: &str) -> Result<Option<String>> {
        match std::fs::read_to_string(self.config_path(name)) {
            Ok(s) => Ok(Some(s)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// The key/value pairs of the remote's configuration section.
    pub fn load_remote_settings(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let text = self.read_config(name)?;
        let data = keyfile::parse(text.as_deref());
        keyfile::section(&data, &section_name(name))
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("Configuration data for remote {name}")))
    }

    /// Apply `changes` to the remote's configuration section, creating
    /// the file or section as needed.  Everything else in the file is
    /// left alone.
    pub fn update_remote_settings(&self, name: &str, changes: &Changes) -> Result<()> {
        let path = self.config_path(name);
        let text = self.read_config(name)?;
        let updated = keyfile::rewrite(text.as_deref(), &section_name(name), changes);
        let perms = match std::fs::metadata(&path) {
            Ok(m) => m.permissions(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                std::fs::Permissions::from_mode(0o644)
            }
            Err(e) => return Err(e.into()),
        };
        debug!("Writing {}", path.display());
        let mut f = tempfile::NamedTempFile::new_in(&self.remotes_dir)?;
        f.as_file().set_permissions(perms)?;
        f.write_all(updated.as_bytes())?;
        f.as_file().sync_all()?;
        f.persist(&path).map_err(|e| e.error)?;
        Ok(())
    }
}
