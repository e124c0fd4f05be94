//! Lazily fetched package information for a deployment.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use rpmostree_client::PackageSet;
use tokio::process::Command;
use tokio::sync::watch;

use crate::cmdutils::AsyncCommandRunExt;
use crate::error::Result;
use crate::notify::{ClientEvent, Notifier, Subscription};

/// Source of the booted system's installed package list.
#[allow(async_fn_in_trait)]
pub trait RpmDb {
    /// One package NEVRA per line.
    async fn installed_packages(&self) -> Result<String>;
}

/// Queries the rpm database with `rpm -qa`.
#[derive(Debug, Clone)]
pub struct RpmCli {
    bin: PathBuf,
}

impl RpmCli {
    pub fn new(bin: impl Into<PathBuf>) -> Self {
        Self { bin: bin.into() }
    }
}

impl Default for RpmCli {
    fn default() -> Self {
        Self::new("rpm")
    }
}

impl RpmDb for RpmCli {
    async fn installed_packages(&self) -> Result<String> {
        Command::new(&self.bin)
            .arg("-qa")
            .log_debug()
            .run_get_string()
            .await
    }
}

#[derive(Debug, Default)]
struct State {
    ready: bool,
    set: Option<PackageSet>,
    error: Option<String>,
}

/// Package list or diff for one deployment.
///
/// Starts out not ready and becomes ready exactly once, at which point
/// either [`Packages::set`] or [`Packages::error`] is populated.
/// Subscribers get a single [`ClientEvent::Changed`] at that point.
pub struct Packages {
    state: Mutex<State>,
    ready_tx: watch::Sender<bool>,
    notifier: Notifier,
}

impl std::fmt::Debug for Packages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Packages")
            .field("state", &*self.state.lock().unwrap())
            .finish()
    }
}

impl Packages {
    pub(crate) fn pending() -> Self {
        Self {
            state: Mutex::new(State::default()),
            ready_tx: watch::Sender::new(false),
            notifier: Notifier::new(Duration::ZERO),
        }
    }

    /// A handle that is ready from the start.
    pub(crate) fn resolved(r: Result<Option<PackageSet>>) -> Self {
        let p = Self::pending();
        p.complete(r);
        p
    }

    /// Record the outcome of the fetch.  Later calls are ignored.
    pub(crate) fn complete(&self, r: Result<Option<PackageSet>>) {
        {
            let mut state = self.state.lock().unwrap();
            if state.ready {
                return;
            }
            match r {
                Ok(set) => state.set = set,
                Err(e) => state.error = Some(e.to_string()),
            }
            state.ready = true;
        }
        self.ready_tx.send_replace(true);
        self.notifier.emit(ClientEvent::Changed);
    }

    pub fn is_ready(&self) -> bool {
        self.state.lock().unwrap().ready
    }

    /// Why fetching failed, if it did.
    pub fn error(&self) -> Option<String> {
        self.state.lock().unwrap().error.clone()
    }

    /// Ready, successful, and there is nothing to show.
    pub fn is_empty(&self) -> bool {
        let state = self.state.lock().unwrap();
        state.ready
            && state.error.is_none()
            && state.set.as_ref().map(PackageSet::is_empty).unwrap_or(true)
    }

    pub fn set(&self) -> Option<PackageSet> {
        self.state.lock().unwrap().set.clone()
    }

    pub async fn wait_ready(&self) {
        let mut rx = self.ready_tx.subscribe();
        // The sender lives as long as we do, so this can't fail
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Get notified once this becomes ready.
    pub fn subscribe(&self, f: impl Fn(&ClientEvent) + Send + Sync + 'static) -> Subscription {
        self.notifier.subscribe(f)
    }

}
