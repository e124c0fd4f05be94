//! Helper logic for handling deployments.

// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::path::PathBuf;

use rpmostree_client::Deployment;
use tokio::process::Command;

use crate::cmdutils::AsyncCommandRunExt;
use crate::config::Config;
use crate::error::{Error, Result};

/// Key under which per-deployment data is cached: the deployment id, or
/// the checksum for a cached update which has none.
pub fn deployment_key(d: &Deployment) -> Option<&str> {
    d.id.as_deref()
        .filter(|id| !id.is_empty())
        .or(Some(d.checksum.as_str()).filter(|c| !c.is_empty()))
}

/// Identifies "the same" deployment across reconciliations.
// Two unrelated deployments sharing osname, id and checksum would collide;
// content addressing makes that practically impossible.
pub fn deployment_identity(d: &Deployment) -> String {
    format!(
        "{}{}{}",
        d.osname,
        d.id.as_deref().unwrap_or_default(),
        d.checksum
    )
}

fn deployment_index(d: &Deployment) -> Result<usize> {
    d.index.ok_or_else(|| {
        Error::Validation(format!(
            "Deployment {} is not installed on this host",
            deployment_identity(d)
        ))
    })
}

/// Pinning and removing deployments, by index, via `ostree admin`.
#[derive(Debug, Clone)]
pub struct DeploymentAdmin {
    ostree_bin: PathBuf,
}

impl DeploymentAdmin {
    pub fn new(config: &Config) -> Self {
        Self {
            ostree_bin: config.ostree_bin.clone(),
        }
    }

    fn admin(&self, verb: &str) -> Command {
        let mut c = Command::new(&self.ostree_bin);
        c.args(["admin", verb]);
        c
    }

    /// Keep `d` from being garbage collected.
    pub async fn pin(&self, d: &Deployment) -> Result<()> {
        let index = deployment_index(d)?;
        self.admin("pin")
            .arg(index.to_string())
            .log_debug()
            .run()
            .await
    }

    pub async fn unpin(&self, d: &Deployment) -> Result<()> {
        let index = deployment_index(d)?;
        self.admin("pin")
            .args(["--unpin", &index.to_string()])
            .log_debug()
            .run()
            .await
    }

    /// Delete `d` from the host.
    pub async fn undeploy(&self, d: &Deployment) -> Result<()> {
        let index = deployment_index(d)?;
        self.admin("undeploy")
            .arg(index.to_string())
            .log_debug()
            .run()
            .await
    }
}
