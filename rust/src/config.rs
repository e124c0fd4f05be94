//! Runtime configuration.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use fn_error_context::context;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the configuration file read by the CLI.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/rpmostree-admin.yaml";
/// Environment variable overriding [`Config::client_id`].
pub const CLIENT_ID_ENV: &str = "RPMOSTREE_ADMIN_CLIENT_ID";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default, deny_unknown_fields)]
pub struct Config {
    /// Well-known bus name of the daemon.
    pub bus_name: String,
    /// Identifier passed to `RegisterClient`; choose something like a
    /// unit or binary name, not an English sentence.
    pub client_id: String,
    /// Directory holding one `<name>.conf` per ostree remote.
    pub remotes_dir: PathBuf,
    pub ostree_bin: PathBuf,
    pub rpm_bin: PathBuf,
    /// Window used to coalesce change notifications.
    pub change_coalesce_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bus_name: crate::client::BUS_NAME.to_string(),
            client_id: "rpmostree-admin".to_string(),
            remotes_dir: PathBuf::from("/etc/ostree/remotes.d"),
            ostree_bin: PathBuf::from("ostree"),
            rpm_bin: PathBuf::from("rpm"),
            change_coalesce_ms: 300,
        }
    }
}

impl Config {
    /// Parse a YAML configuration file; unset keys keep their defaults.
    #[context("Loading configuration from {}", path.display())]
    pub fn load(path: &Path) -> Result<Self> {
        let buf = std::fs::read_to_string(path)?;
        Self::from_yaml(&buf)
    }

    pub fn from_yaml(buf: &str) -> Result<Self> {
        let mut config: Config = if buf.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(buf).context("Parsing YAML")?
        };
        config.apply_env();
        Ok(config)
    }

    /// Load `path` if it exists, otherwise use defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!("{} not found, using defaults", path.display());
            let mut config = Config::default();
            config.apply_env();
            Ok(config)
        }
    }

    fn apply_env(&mut self) {
        if let Ok(id) = std::env::var(CLIENT_ID_ENV) {
            if !id.is_empty() {
                self.client_id = id;
            }
        }
    }

    pub fn change_coalesce(&self) -> Duration {
        Duration::from_millis(self.change_coalesce_ms)
    }
}
