//! A live mirror of the daemon's Sysroot and OS objects, plus the derived
//! queries used to decide what to show about deployments and updates.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use rpmostree_client::{Deployment, InstalledPackages, Origin, PackageDiff, PackageSet, Signature};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::bus::{BusEvent, OsObject, Properties, SysrootBus};
use crate::config::Config;
use crate::dbus::GioBus;
use crate::error::{Error, Problem, Result};
use crate::notify::{ClientEvent, Notifier, Subscription};
use crate::packages::{Packages, RpmCli, RpmDb};
use crate::remotes::ConfigReload;
use crate::transaction::TransactionSlot;

/// The well-known bus name.
pub const BUS_NAME: &str = "org.projectatomic.rpmostree1";
/// Root of the daemon's object tree; also the ObjectManager.
pub const OBJECT_PATH: &str = "/org/projectatomic/rpmostree1";
/// The global sysroot path
pub const SYSROOT_PATH: &str = "/org/projectatomic/rpmostree1/Sysroot";
pub const SYSROOT_INTERFACE: &str = "org.projectatomic.rpmostree1.Sysroot";
pub const OS_INTERFACE: &str = "org.projectatomic.rpmostree1.OS";
pub const TRANSACTION_INTERFACE: &str = "org.projectatomic.rpmostree1.Transaction";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Phase {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

/// Deployment-valued properties of an OS object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyAttr {
    BootedDeployment,
    DefaultDeployment,
    RollbackDeployment,
    CachedUpdate,
}

/// Which field of a deployment to compare in [`Client::item_matches`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compare {
    #[default]
    Checksum,
    Id,
    Version,
    Origin,
}

impl Compare {
    fn get<'a>(&self, d: &'a Deployment) -> Option<&'a str> {
        match self {
            Compare::Checksum => Some(d.checksum.as_str()),
            Compare::Id => d.id.as_deref(),
            Compare::Version => d.version.as_deref(),
            Compare::Origin => d.effective_origin(),
        }
    }
}

/// Snapshot of one OS object's properties.
#[derive(Debug, Clone, Default)]
struct OsProxy {
    path: String,
    name: String,
    booted: Option<Deployment>,
    default: Option<Deployment>,
    rollback: Option<Deployment>,
    cached_update: Option<Deployment>,
}

impl OsProxy {
    fn from_object(obj: &OsObject) -> Result<Self> {
        let props = &obj.properties;
        let deployment = |k: &str| -> Result<Option<Deployment>> {
            Ok(Deployment::from_value(props.get(k).unwrap_or(&Value::Null))?)
        };
        Ok(Self {
            path: obj.path.clone(),
            name: props
                .get("Name")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            booted: deployment("BootedDeployment")?,
            default: deployment("DefaultDeployment")?,
            rollback: deployment("RollbackDeployment")?,
            cached_update: deployment("CachedUpdate")?,
        })
    }

    fn attr(&self, attr: ProxyAttr) -> Option<&Deployment> {
        match attr {
            ProxyAttr::BootedDeployment => self.booted.as_ref(),
            ProxyAttr::DefaultDeployment => self.default.as_ref(),
            ProxyAttr::RollbackDeployment => self.rollback.as_ref(),
            ProxyAttr::CachedUpdate => self.cached_update.as_ref(),
        }
    }
}

#[derive(Debug, Default)]
struct State {
    phase: Phase,
    connection_error: Option<(Problem, String)>,
    booted_path: Option<String>,
    deployments: Vec<Deployment>,
    active_transaction: Option<String>,
    os_proxies: BTreeMap<String, OsProxy>,
    /// OS name to object path.
    os_names: HashMap<String, String>,
    os_list: Vec<String>,
    update_cache: HashMap<String, Deployment>,
    packages_cache: HashMap<String, Arc<Packages>>,
    booted_id: Option<String>,
}

impl State {
    fn proxy(&self, os: &str) -> Option<&OsProxy> {
        self.os_names.get(os).and_then(|p| self.os_proxies.get(p))
    }

    fn booted_proxy(&self) -> Option<&OsProxy> {
        self.booted_path
            .as_ref()
            .and_then(|p| self.os_proxies.get(p))
    }

    fn os_origin(&self, os: &str) -> Option<String> {
        let Some(proxy) = self.proxy(os).or_else(|| self.booted_proxy()) else {
            debug!("get_os_origin {os}: no proxy");
            return None;
        };
        if let Some(origin) = proxy.booted.as_ref().and_then(Deployment::effective_origin) {
            debug!("get_os_origin {os} from BootedDeployment: {origin}");
            return Some(origin.to_string());
        }
        let origin = proxy.default.as_ref().and_then(Deployment::effective_origin);
        debug!("get_os_origin {os} from DefaultDeployment: {origin:?}");
        origin.map(ToOwned::to_owned)
    }

    fn default_origin(&self, os: &str) -> Option<Origin> {
        self.os_origin(os).map(|o| Origin::parse(&o))
    }

    fn change_refspec(&self, os: &str, remote: Option<&str>, branch: Option<&str>) -> Option<String> {
        let current = self.default_origin(os);
        let remote = remote
            .filter(|r| !r.is_empty())
            .or(current.as_ref().map(|o| o.remote.as_str()));
        let branch = branch
            .filter(|b| !b.is_empty())
            .or(current.as_ref().and_then(|o| o.branch.as_deref()));
        if let Some(current) = current.as_ref() {
            if Some(current.remote.as_str()) == remote && current.branch.as_deref() == branch {
                return None;
            }
        }
        match (remote, branch) {
            (Some(r), Some(b)) if !r.is_empty() && !b.is_empty() => Some(format!("{r}:{b}")),
            _ => None,
        }
    }

    fn item_matches(&self, d: &Deployment, attr: ProxyAttr, cmp: Compare) -> bool {
        if d.osname.is_empty() {
            return false;
        }
        let Some(proxy) = self.proxy(&d.osname) else {
            return false;
        };
        cmp.get(d) == proxy.attr(attr).and_then(|other| cmp.get(other))
    }

    /// Distinct OS names, in the order their deployments appear.
    fn build_os_list(&mut self) {
        let mut os_list: Vec<String> = Vec::new();
        for d in &self.deployments {
            if !os_list.contains(&d.osname) {
                os_list.push(d.osname.clone());
            }
        }
        self.os_list = os_list;
    }

    fn booted_id(&mut self) -> Option<String> {
        if self.booted_id.is_none() {
            self.booted_id = self
                .booted_proxy()
                .and_then(|p| p.booted.as_ref())
                .and_then(|d| d.id.clone());
        }
        self.booted_id.clone()
    }
}

/// Where a package set comes from.
enum PackageSource {
    Installed,
    Diff {
        path: String,
        method: &'static str,
        args: Vec<Value>,
    },
}

fn decode_diff(reply: &[Value]) -> Result<PackageSet> {
    let list = reply
        .first()
        .ok_or_else(|| Error::protocol("empty package diff reply"))?;
    Ok(PackageSet::Diff(PackageDiff::from_wire(list)?))
}

/// A [`Packages`] handle in the cache whose fetch hasn't finished.  If
/// the fetching future is dropped first, the handle is taken out of the
/// cache and completed with an error so nobody waits on it forever.
struct PendingFetch<'a> {
    state: &'a Mutex<State>,
    key: String,
    handle: Arc<Packages>,
    done: bool,
}

impl PendingFetch<'_> {
    fn finish(mut self, r: Result<Option<PackageSet>>) -> Arc<Packages> {
        self.done = true;
        self.handle.complete(r);
        Arc::clone(&self.handle)
    }
}

impl Drop for PendingFetch<'_> {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if let Ok(mut state) = self.state.lock() {
            let ours = state
                .packages_cache
                .get(&self.key)
                .is_some_and(|h| Arc::ptr_eq(h, &self.handle));
            if ours {
                state.packages_cache.remove(&self.key);
            }
        }
        self.handle.complete(Err(Error::Process(format!(
            "Fetching packages for {} was cancelled",
            self.key
        ))));
    }
}

/// The reconciliation client.
///
/// Constructed explicitly and owned by the caller; all state lives here.
/// Reads are synchronous snapshots of the last reconciliation; anything
/// that talks to the daemon is async.
pub struct Client<B: SysrootBus, R: RpmDb = RpmCli> {
    pub(crate) bus: B,
    rpm: R,
    client_id: String,
    state: Mutex<State>,
    connect_lock: tokio::sync::Mutex<()>,
    attempts: AtomicU64,
    pub(crate) notifier: Notifier,
    pub(crate) slot: TransactionSlot,
}

impl Client<GioBus, RpmCli> {
    /// A client talking to the system bus.
    pub fn from_config(config: &Config) -> Self {
        Self::new(
            GioBus::new(config.bus_name.as_str()),
            RpmCli::new(&config.rpm_bin),
            config,
        )
    }
}

impl<B: SysrootBus, R: RpmDb> Client<B, R> {
    pub fn new(bus: B, rpm: R, config: &Config) -> Self {
        Self {
            bus,
            rpm,
            client_id: config.client_id.clone(),
            state: Mutex::new(State::default()),
            connect_lock: tokio::sync::Mutex::new(()),
            attempts: AtomicU64::new(0),
            notifier: Notifier::new(config.change_coalesce()),
            slot: TransactionSlot::default(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.check_closed();
        self.state.lock().unwrap().phase
    }

    /// Why the last connection attempt failed or the connection was lost.
    pub fn connection_error(&self) -> Option<(Problem, String)> {
        self.state.lock().unwrap().connection_error.clone()
    }

    /// Connect and take the initial snapshot.  Does nothing if already
    /// connected; callers that arrive while an attempt is in flight get
    /// that attempt's outcome.
    pub async fn connect(&self) -> Result<()> {
        let seen = self.attempts.load(Ordering::SeqCst);
        let _guard = self.connect_lock.lock().await;
        if self.phase() == Phase::Connected {
            return Ok(());
        }
        // An attempt finished while we waited; its outcome is ours
        if self.attempts.load(Ordering::SeqCst) != seen {
            if let Some((problem, message)) = self.connection_error() {
                return Err(Error::Connection { problem, message });
            }
        }

        *self.state.lock().unwrap() = State {
            phase: Phase::Connecting,
            ..Default::default()
        };
        let r = self.establish().await;
        self.attempts.fetch_add(1, Ordering::SeqCst);
        match r {
            Ok(()) => {
                {
                    let mut state = self.state.lock().unwrap();
                    state.phase = Phase::Connected;
                    state.build_os_list();
                }
                self.notifier.trigger_changed();
                Ok(())
            }
            Err(e) => {
                let (problem, message) = match &e {
                    Error::Connection { problem, message } => (*problem, message.clone()),
                    o => (Problem::Other, o.to_string()),
                };
                debug!("connect failed: {e}");
                self.tear_down(problem, message);
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<()> {
        self.bus.open().await?;
        self.refresh_sysroot().await?;
        // The daemon exits when idle unless it knows about us
        let id = json!({ "id": self.client_id });
        if let Err(e) = self.bus.call_sysroot("RegisterClient", vec![id]).await {
            warn!("Failed to register client: {e}");
        }
        self.refresh_os().await
    }

    async fn refresh_sysroot(&self) -> Result<()> {
        let props = self.bus.sysroot_properties().await?;
        let deployments = decode_deployments(&props)?;
        let booted_path = props
            .get("Booted")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned);
        let active_transaction = props
            .get("ActiveTransaction")
            .and_then(|v| v.get(0))
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(ToOwned::to_owned);
        let mut state = self.state.lock().unwrap();
        state.deployments = deployments;
        state.booted_path = booted_path;
        state.active_transaction = active_transaction;
        Ok(())
    }

    async fn refresh_os(&self) -> Result<()> {
        let objects = self.bus.os_objects().await?;
        let proxies = objects
            .iter()
            .map(OsProxy::from_object)
            .collect::<Result<Vec<_>>>()?;
        let mut state = self.state.lock().unwrap();
        state.os_names = proxies
            .iter()
            .filter(|p| !p.name.is_empty())
            .map(|p| (p.name.clone(), p.path.clone()))
            .collect();
        state.os_proxies = proxies.into_iter().map(|p| (p.path.clone(), p)).collect();
        Ok(())
    }

    /// Re-read everything from the daemon.
    pub async fn refresh(&self) -> Result<()> {
        self.connect().await?;
        self.refresh_sysroot().await?;
        self.refresh_os().await?;
        self.state.lock().unwrap().build_os_list();
        self.notifier.trigger_changed();
        Ok(())
    }

    /// Keep the mirror current until the bus connection goes away.
    pub async fn watch(&self) -> Result<()> {
        self.connect().await?;
        while let Some(event) = self.bus.next_event().await {
            debug!("bus event: {event:?}");
            match event {
                BusEvent::SysrootChanged => {
                    if let Err(e) = self.refresh_sysroot().await {
                        warn!("Reading sysroot properties: {e}");
                        continue;
                    }
                    self.state.lock().unwrap().build_os_list();
                    self.notifier.trigger_changed();
                }
                BusEvent::OsChanged(_) => {
                    if let Err(e) = self.refresh_os().await {
                        warn!("Reading OS objects: {e}");
                        continue;
                    }
                    self.notifier.trigger_changed();
                }
                BusEvent::Closed { problem, message } => {
                    self.lost(problem, message.clone());
                    return Err(Error::connection(problem, message));
                }
            }
        }
        let message = "connection closed";
        self.lost(Problem::Disconnected, message.into());
        Err(Error::connection(Problem::Disconnected, message))
    }

    /// Collapse to [`Phase::Disconnected`] if the main connection
    /// closed since we last looked.
    fn check_closed(&self) {
        if let Some((problem, message)) = self.bus.closed() {
            self.lost(problem, message);
        }
    }

    /// The connection went away; reported once per connection.
    fn lost(&self, problem: Problem, message: String) {
        {
            let mut state = self.state.lock().unwrap();
            if state.phase != Phase::Connected {
                return;
            }
            *state = State {
                connection_error: Some((problem, message.clone())),
                ..Default::default()
            };
        }
        self.notifier
            .emit(ClientEvent::ConnectionLost { problem, message });
    }

    /// Drop everything cached and go back to [`Phase::Disconnected`].
    fn tear_down(&self, problem: Problem, message: String) {
        *self.state.lock().unwrap() = State {
            connection_error: Some((problem, message)),
            ..Default::default()
        };
    }

    /// OS names in the order their deployments appear.
    pub fn os_list(&self) -> Vec<String> {
        self.check_closed();
        self.state.lock().unwrap().os_list.clone()
    }

    /// Every deployment on the host, in host order.
    pub fn deployments(&self) -> Vec<Deployment> {
        self.check_closed();
        self.state.lock().unwrap().deployments.clone()
    }

    /// `method` of the transaction the daemon is currently running, if any.
    pub fn active_transaction(&self) -> Option<String> {
        self.state.lock().unwrap().active_transaction.clone()
    }

    /// Marker of the transaction this client is running, `Method:os`.
    pub fn local_running(&self) -> Option<String> {
        self.slot.running()
    }

    /// Current value of one of an OS object's deployment properties.
    pub fn os_deployment(&self, os: &str, attr: ProxyAttr) -> Option<Deployment> {
        let state = self.state.lock().unwrap();
        state.proxy(os).and_then(|p| p.attr(attr)).cloned()
    }

    pub(crate) fn os_path(&self, os: &str) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.proxy(os).map(|p| p.path.clone())
    }

    /// The deployments worth showing for `os`, including a cached update
    /// in front of the default deployment when one is pending.
    pub fn known_versions_for(
        &self,
        os: &str,
        remote: Option<&str>,
        branch: Option<&str>,
    ) -> Vec<Deployment> {
        let mut state = self.state.lock().unwrap();
        let alt_refspec = state.change_refspec(os, remote, branch);

        let live_update = state.proxy(os).and_then(|p| p.cached_update.clone());
        let cached_origin = live_update
            .as_ref()
            .and_then(|u| u.effective_origin())
            .map(ToOwned::to_owned);
        if let (Some(origin), Some(update)) = (cached_origin.as_ref(), live_update) {
            state.update_cache.insert(origin.clone(), update);
        }

        let update = alt_refspec
            .or(cached_origin)
            .and_then(|k| state.update_cache.get(&k).cloned());
        let upgrade_checksum = update.as_ref().map(|u| u.checksum.as_str());

        let mut list = Vec::new();
        for (i, d) in state.deployments.iter().enumerate() {
            if d.is_installed() && d.osname != os {
                continue;
            }
            let mut d = d.clone();
            if d.origin.is_none() {
                d.origin = d.container_image_reference.clone();
            }
            d.index = Some(i);

            if state.item_matches(&d, ProxyAttr::DefaultDeployment, Compare::Checksum) {
                if let Some(update) = update.as_ref() {
                    if update.checksum != d.checksum {
                        list.push(update.clone());
                    }
                }
                list.push(d);
            } else if upgrade_checksum != Some(d.checksum.as_str()) {
                list.push(d);
            }
        }
        debug!(
            "known_versions_for osname '{os}' remote '{remote:?}' branch '{branch:?}': {} entries",
            list.len()
        );
        list
    }

    /// Origin string of the booted (preferably) or default deployment.
    pub fn get_os_origin(&self, os: &str) -> Option<String> {
        self.state.lock().unwrap().os_origin(os)
    }

    pub fn get_default_origin(&self, os: &str) -> Option<Origin> {
        self.state.lock().unwrap().default_origin(os)
    }

    /// The refspec to rebase to, or `None` if `remote`/`branch` (each
    /// falling back to the current origin) don't describe a change.
    pub fn build_change_refspec(
        &self,
        os: &str,
        remote: Option<&str>,
        branch: Option<&str>,
    ) -> Option<String> {
        self.state.lock().unwrap().change_refspec(os, remote, branch)
    }

    /// Whether `d` is the deployment in `attr` of its OS, by `cmp`.
    pub fn item_matches(&self, d: &Deployment, attr: ProxyAttr, cmp: Compare) -> bool {
        self.state.lock().unwrap().item_matches(d, attr, cmp)
    }

    /// Package information for `d`, fetched once and kept for the
    /// lifetime of the connection.  The first caller for a deployment
    /// performs the fetch; others get the same handle right away.
    pub async fn packages(&self, d: &Deployment) -> Option<Arc<Packages>> {
        let key = crate::deployment_utils::deployment_key(d)?.to_string();
        let (handle, source) = {
            let mut state = self.state.lock().unwrap();
            let booted_id = state.booted_id()?;
            if let Some(h) = state.packages_cache.get(&key) {
                return Some(Arc::clone(h));
            }
            let proxy = state.proxy(&d.osname)?;
            let source = if d.id.as_deref() == Some(booted_id.as_str()) {
                PackageSource::Installed
            } else if let Some(id) = d.id.as_deref() {
                PackageSource::Diff {
                    path: proxy.path.clone(),
                    method: "GetDeploymentsRpmDiff",
                    args: vec![json!(booted_id), json!(id)],
                }
            } else if d.effective_origin().is_some()
                && d.effective_origin().map(ToOwned::to_owned) == state.os_origin(&proxy.name)
            {
                PackageSource::Diff {
                    path: proxy.path.clone(),
                    method: "GetCachedUpdateRpmDiff",
                    args: vec![json!("")],
                }
            } else {
                return None;
            };
            let handle = Arc::new(Packages::pending());
            state.packages_cache.insert(key.clone(), Arc::clone(&handle));
            (handle, source)
        };
        let fetch = PendingFetch {
            state: &self.state,
            key,
            handle,
            done: false,
        };

        let r = match source {
            PackageSource::Installed => self
                .rpm
                .installed_packages()
                .await
                .map(|out| InstalledPackages::from_rpm_output(&out).map(PackageSet::Installed)),
            PackageSource::Diff { path, method, args } => self
                .bus
                .call_os(&path, method, args)
                .await
                .and_then(|reply| decode_diff(&reply))
                .map(Some),
        };
        if let Err(e) = &r {
            debug!("packages for {}: {e}", fetch.key);
        }
        Some(fetch.finish(r))
    }

    /// The update that would result from rebasing `os` to
    /// `remote:branch`, or the OS's live cached update if that is not
    /// a change.
    pub async fn cache_update_for(
        &self,
        os: &str,
        remote: Option<&str>,
        branch: Option<&str>,
    ) -> Result<Option<Deployment>> {
        let (refspec, path, live) = {
            let state = self.state.lock().unwrap();
            let proxy = state
                .proxy(os)
                .ok_or_else(|| Error::NotFound(format!("OS {os}")))?;
            (
                state.change_refspec(os, remote, branch),
                proxy.path.clone(),
                proxy.cached_update.clone(),
            )
        };
        let Some(refspec) = refspec else {
            return Ok(live);
        };

        let reply = self
            .bus
            .call_os(&path, "GetCachedRebaseRpmDiff", vec![json!(refspec), json!([])])
            .await?;
        let [diff, details] = reply.as_slice() else {
            return Err(Error::protocol(format!(
                "GetCachedRebaseRpmDiff returned {} values",
                reply.len()
            )));
        };
        let item = Deployment::from_value(details)?
            .filter(|d| !d.checksum.is_empty())
            .ok_or_else(|| Error::protocol("GetCachedRebaseRpmDiff returned no update"))?;
        let diff = PackageDiff::from_wire(diff)?;

        let mut state = self.state.lock().unwrap();
        state.update_cache.insert(refspec, item.clone());
        state.packages_cache.insert(
            item.checksum.clone(),
            Arc::new(Packages::resolved(Ok(Some(PackageSet::Diff(diff))))),
        );
        Ok(Some(item))
    }

    /// Download update metadata for `os`, or for a rebase target when
    /// `remote`/`branch` describe one, and return the resulting update.
    pub async fn check_for_updates(
        &self,
        os: &str,
        remote: Option<&str>,
        branch: Option<&str>,
    ) -> Result<Option<Deployment>> {
        match self.build_change_refspec(os, remote, branch) {
            Some(refspec) => {
                self.run_transaction("DownloadRebaseRpmDiff", vec![json!(refspec), json!([])], os)
                    .await?;
                let slot = self.slot.acquire(format!("DownloadRebaseRpmDiff:{os}"))?;
                let r = self.cache_update_for(os, remote, branch).await;
                drop(slot);
                self.notifier.trigger_changed();
                r
            }
            None => {
                self.run_transaction("DownloadUpdateRpmDiff", Vec::new(), os)
                    .await?;
                self.refresh().await?;
                Ok(self.os_deployment(os, ProxyAttr::CachedUpdate))
            }
        }
    }

    /// Ask the daemon to re-read its configuration; failures are logged.
    pub async fn reload(&self) {
        if let Err(e) = self.bus.call_sysroot("ReloadConfig", Vec::new()).await {
            warn!("Error reloading config: {e}");
        }
    }

    /// Decode one of a deployment's raw signature records.
    pub fn signature(&self, raw: &Value) -> Result<Signature> {
        Ok(Signature::from_wire(raw)?)
    }

    pub fn subscribe(&self, f: impl Fn(&ClientEvent) + Send + Sync + 'static) -> Subscription {
        self.notifier.subscribe(f)
    }
}

impl<B: SysrootBus, R: RpmDb> ConfigReload for Client<B, R> {
    async fn reload(&self) {
        Client::reload(self).await
    }
}

fn decode_deployments(props: &Properties) -> Result<Vec<Deployment>> {
    let Some(list) = props.get("Deployments") else {
        return Ok(Vec::new());
    };
    let list = list
        .as_array()
        .ok_or_else(|| Error::protocol("Deployments is not a list"))?;
    let mut r = Vec::with_capacity(list.len());
    for v in list {
        if let Some(d) = Deployment::from_value(v)? {
            r.push(d);
        }
    }
    Ok(r)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutils::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    #[tokio::test]
    async fn connect() {
        let client = test_client(MockBus::fixture());
        assert_eq!(client.phase(), Phase::Disconnected);
        client.connect().await.unwrap();
        assert_eq!(client.phase(), Phase::Connected);
        assert_eq!(client.os_list(), vec!["fedora", "rhel"]);
        assert_eq!(client.deployments().len(), 3);
        assert_eq!(client.active_transaction(), None);
        let calls = client.bus.calls_to("RegisterClient");
        assert_eq!(calls, vec![vec![json!({"id": "rpmostree-admin"})]]);

        // Idempotent
        client.connect().await.unwrap();
        assert_eq!(client.bus.calls_to("RegisterClient").len(), 1);
    }

    #[tokio::test]
    async fn connect_denied() {
        let bus = MockBus::fixture();
        bus.fail_open(Problem::AccessDenied, "org.freedesktop.DBus.Error.AccessDenied");
        let client = test_client(bus);
        let e = client.connect().await.unwrap_err();
        assert_eq!(e.problem(), Some(Problem::AccessDenied));
        assert_eq!(e.to_string(), "Not authorized to update software on this system");
        assert_eq!(client.phase(), Phase::Disconnected);
        assert!(client.connection_error().is_some());
        assert!(client.os_list().is_empty());
    }

    #[tokio::test]
    async fn default_origin() {
        let client = connected(MockBus::fixture()).await;
        let o = client.get_default_origin("fedora").unwrap();
        assert_eq!(o.remote, "fedora");
        assert_eq!(o.branch.as_deref(), Some("fedora/39/x86_64/silverblue"));
        // Unknown OS falls back to the booted one
        assert_eq!(client.get_default_origin("nope"), Some(o));

        let client = connected(MockBus::fixture().with_origin("justremote")).await;
        let o = client.get_default_origin("fedora").unwrap();
        assert_eq!(o.remote, "justremote");
        assert_eq!(o.branch, None);
    }

    #[tokio::test]
    async fn change_refspec() {
        let client = connected(MockBus::fixture()).await;
        assert_eq!(client.build_change_refspec("fedora", None, None), None);
        assert_eq!(
            client.build_change_refspec("fedora", Some("fedora"), Some("fedora/39/x86_64/silverblue")),
            None
        );
        assert_eq!(
            client
                .build_change_refspec("fedora", None, Some("fedora/40/x86_64/silverblue"))
                .as_deref(),
            Some("fedora:fedora/40/x86_64/silverblue")
        );
        assert_eq!(
            client.build_change_refspec("fedora", Some("mirror"), Some("")).as_deref(),
            Some("mirror:fedora/39/x86_64/silverblue")
        );
    }

    fn checksums(list: &[Deployment]) -> Vec<&str> {
        list.iter().map(|d| d.checksum.as_str()).collect()
    }

    #[tokio::test]
    async fn known_versions() {
        let client = connected(MockBus::fixture()).await;
        let list = client.known_versions_for("fedora", None, None);
        assert_eq!(checksums(&list), vec!["aaa", "bbb"]);
        assert_eq!(list[0].index, Some(0));
        assert_eq!(list[1].index, Some(1));

        let list = client.known_versions_for("rhel", None, None);
        assert_eq!(checksums(&list), vec!["ccc"]);
        assert_eq!(list[0].index, Some(2));
    }

    #[tokio::test]
    async fn known_versions_with_update() {
        let bus = MockBus::fixture().with_cached_update("fedora", update("ddd"));
        let client = connected(bus).await;
        let list = client.known_versions_for("fedora", None, None);
        assert_eq!(checksums(&list), vec!["ddd", "aaa", "bbb"]);
        assert_eq!(list[0].index, None);
    }

    #[tokio::test]
    async fn known_versions_update_is_default() {
        let bus = MockBus::fixture().with_cached_update("fedora", update("aaa"));
        let client = connected(bus).await;
        let list = client.known_versions_for("fedora", None, None);
        assert_eq!(checksums(&list), vec!["aaa", "bbb"]);
        assert!(list[0].is_installed());
    }

    #[tokio::test]
    async fn known_versions_suppresses_duplicate() {
        let bus = MockBus::fixture().with_cached_update("fedora", update("bbb"));
        let client = connected(bus).await;
        let list = client.known_versions_for("fedora", None, None);
        assert_eq!(checksums(&list), vec!["bbb", "aaa"]);
        assert!(!list[0].is_installed());
    }

    #[tokio::test]
    async fn item_matches() {
        let client = connected(MockBus::fixture()).await;
        let list = client.known_versions_for("fedora", None, None);
        assert!(client.item_matches(&list[0], ProxyAttr::DefaultDeployment, Compare::Checksum));
        assert!(!client.item_matches(&list[1], ProxyAttr::DefaultDeployment, Compare::Checksum));
        assert!(client.item_matches(&list[1], ProxyAttr::BootedDeployment, Compare::Id));
        assert!(client.item_matches(&list[1], ProxyAttr::RollbackDeployment, Compare::Checksum));
        let mut orphan = list[0].clone();
        orphan.osname = String::new();
        assert!(!client.item_matches(&orphan, ProxyAttr::DefaultDeployment, Compare::Checksum));
    }

    #[tokio::test]
    async fn packages_memoized() {
        let bus = MockBus::fixture();
        bus.reply(
            "GetDeploymentsRpmDiff",
            vec![json!([["foo", 0, {"NewPackage": ["foo", "1.0-1", "x86_64"]}]])],
        );
        let client = connected(bus).await;
        let list = client.known_versions_for("fedora", None, None);

        let a = client.packages(&list[0]).await.unwrap();
        let b = client.packages(&list[0]).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(
            client.bus.calls_to("GetDeploymentsRpmDiff"),
            vec![vec![json!("fedora-bbb-1"), json!("fedora-aaa-0")]]
        );
        assert!(a.is_ready());
        match a.set() {
            Some(PackageSet::Diff(d)) => assert_eq!(d.adds[0].name, "foo"),
            o => panic!("unexpected {o:?}"),
        }

        // The booted deployment lists installed packages instead
        let booted = client.packages(&list[1]).await.unwrap();
        match booted.set() {
            Some(PackageSet::Installed(p)) => {
                assert_eq!(p.columns[0], vec!["bash-5.2-1.x86_64", "glibc-2.38-1.x86_64"]);
                assert_eq!(p.columns[1], vec!["kernel-6.5-1.x86_64"]);
            }
            o => panic!("unexpected {o:?}"),
        }
    }

    #[tokio::test]
    async fn packages_failure_recorded() {
        let client = connected(MockBus::fixture()).await;
        let list = client.known_versions_for("fedora", None, None);
        let p = client.packages(&list[0]).await.unwrap();
        assert!(p.is_ready());
        assert!(p.error().is_some());
        assert!(!p.is_empty());
    }

    #[tokio::test]
    async fn packages_for_unrelated_update() {
        let client = connected(MockBus::fixture()).await;
        let mut other = update("eee");
        other.origin = Some("elsewhere:some/branch".into());
        assert!(client.packages(&other).await.is_none());

        client.bus.reply("GetCachedUpdateRpmDiff", vec![json!([]), json!({})]);
        let same = update("fff");
        let p = client.packages(&same).await.unwrap();
        assert!(p.is_empty());
        assert_eq!(client.bus.calls_to("GetCachedUpdateRpmDiff"), vec![vec![json!("")]]);
    }

    #[tokio::test]
    async fn cache_update() {
        let bus = MockBus::fixture();
        bus.reply(
            "GetCachedRebaseRpmDiff",
            vec![
                json!([["foo", 2, {"NewPackage": ["foo", "2.0-1", "x86_64"]}]]),
                json!({"osname": "fedora", "checksum": "ggg", "origin": "fedora:fedora/40/x86_64/silverblue"}),
            ],
        );
        let client = connected(bus).await;

        // Not a change: the live cached update, which is empty here
        assert_eq!(client.cache_update_for("fedora", None, None).await.unwrap(), None);

        let branch = Some("fedora/40/x86_64/silverblue");
        let item = client
            .cache_update_for("fedora", None, branch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.checksum, "ggg");
        assert_eq!(
            client.bus.calls_to("GetCachedRebaseRpmDiff"),
            vec![vec![json!("fedora:fedora/40/x86_64/silverblue"), json!([])]]
        );
        // Now shown in front of the default deployment for that branch
        let list = client.known_versions_for("fedora", None, branch);
        assert_eq!(checksums(&list), vec!["ggg", "aaa", "bbb"]);
        // And its diff is already known
        let p = client.packages(&item).await.unwrap();
        assert!(p.is_ready());
        assert!(!p.is_empty());

        let e = client.cache_update_for("nope", None, branch).await.unwrap_err();
        assert!(matches!(e, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn cache_update_malformed() {
        let bus = MockBus::fixture();
        bus.reply("GetCachedRebaseRpmDiff", vec![json!([])]);
        let client = connected(bus).await;
        let e = client
            .cache_update_for("fedora", Some("mirror"), None)
            .await
            .unwrap_err();
        assert!(matches!(e, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn reload_is_best_effort() {
        let client = connected(MockBus::fixture()).await;
        // No reply registered, so the call fails
        client.reload().await;
        assert_eq!(client.bus.calls_to("ReloadConfig").len(), 1);
    }

    #[tokio::test]
    async fn connection_lost() {
        let bus = MockBus::fixture();
        bus.push_event(BusEvent::OsChanged("/org/projectatomic/rpmostree1/fedora".into()));
        bus.push_event(BusEvent::Closed {
            problem: Problem::Disconnected,
            message: "daemon exited".into(),
        });
        let client = connected(bus).await;

        let lost = Arc::new(AtomicUsize::new(0));
        let l = Arc::clone(&lost);
        let _sub = client.subscribe(move |ev| {
            if let ClientEvent::ConnectionLost { problem, .. } = ev {
                assert_eq!(*problem, Problem::Disconnected);
                l.fetch_add(1, Ordering::SeqCst);
            }
        });
        let e = client.watch().await.unwrap_err();
        assert_eq!(e.problem(), Some(Problem::Disconnected));
        assert_eq!(lost.load(Ordering::SeqCst), 1);
        assert_eq!(client.phase(), Phase::Disconnected);
        assert!(client.os_list().is_empty());
        assert!(client.known_versions_for("fedora", None, None).is_empty());
    }

    #[test]
    fn signature_arity() {
        let client = test_client(MockBus::fixture());
        let e = client.signature(&json!([true])).unwrap_err();
        assert!(matches!(e, Error::Protocol(_)));
    }

    #[tokio::test]
    async fn concurrent_connect_shares_attempt() {
        let client = test_client(MockBus::fixture());
        let (a, b) = tokio::join!(client.connect(), client.connect());
        a.unwrap();
        b.unwrap();
        assert_eq!(client.bus.opens(), 1);
        assert_eq!(client.bus.calls_to("RegisterClient").len(), 1);
    }

    #[tokio::test]
    async fn connect_queued_behind_failure() {
        let bus = MockBus::fixture();
        bus.fail_open(Problem::NotFound, "org.freedesktop.DBus.Error.ServiceUnknown");
        let client = test_client(bus);
        let (a, b) = tokio::join!(client.connect(), client.connect());
        assert_eq!(a.unwrap_err().problem(), Some(Problem::NotFound));
        assert_eq!(b.unwrap_err().problem(), Some(Problem::NotFound));
        assert_eq!(client.bus.opens(), 1);

        // A fresh call makes a fresh attempt
        assert!(client.connect().await.is_err());
        assert_eq!(client.bus.opens(), 2);
    }

    #[tokio::test]
    async fn watch_rebuilds_os_list() {
        let client = connected(MockBus::fixture()).await;
        assert_eq!(client.os_list(), vec!["fedora", "rhel"]);
        client.bus.drop_deployments("rhel");
        client.bus.push_event(BusEvent::SysrootChanged);

        // Runs until the bus closes, which it doesn't here
        let r = tokio::time::timeout(Duration::from_millis(100), client.watch()).await;
        assert!(r.is_err());
        assert_eq!(client.phase(), Phase::Connected);
        assert_eq!(client.os_list(), vec!["fedora"]);
        assert_eq!(client.deployments().len(), 2);
    }

    #[tokio::test]
    async fn closed_without_watch() {
        let client = connected(MockBus::fixture()).await;
        let lost = Arc::new(AtomicUsize::new(0));
        let l = Arc::clone(&lost);
        let _sub = client.subscribe(move |ev| {
            if matches!(ev, ClientEvent::ConnectionLost { .. }) {
                l.fetch_add(1, Ordering::SeqCst);
            }
        });

        client.bus.close(Problem::Disconnected, "daemon exited");
        assert_eq!(client.phase(), Phase::Disconnected);
        assert!(client.os_list().is_empty());
        assert_eq!(
            client.connection_error(),
            Some((Problem::Disconnected, "daemon exited".to_string()))
        );
        assert_eq!(lost.load(Ordering::SeqCst), 1);

        client.connect().await.unwrap();
        assert_eq!(client.phase(), Phase::Connected);
        assert_eq!(client.bus.opens(), 2);
        assert_eq!(client.os_list(), vec!["fedora", "rhel"]);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }

    /// An rpm database that never answers.
    struct HangingRpm;

    impl RpmDb for HangingRpm {
        async fn installed_packages(&self) -> Result<String> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn packages_fetch_abandoned() {
        let client = Client::new(MockBus::fixture(), HangingRpm, &Config::default());
        client.connect().await.unwrap();
        let booted = client
            .os_deployment("fedora", ProxyAttr::BootedDeployment)
            .unwrap();

        let mut fetch = Box::pin(client.packages(&booted));
        let r = tokio::time::timeout(Duration::from_millis(50), &mut fetch).await;
        assert!(r.is_err());
        // Meanwhile others see the pending handle
        let pending = client.packages(&booted).await.unwrap();
        assert!(!pending.is_ready());

        drop(fetch);
        assert!(pending.is_ready());
        assert!(pending.error().unwrap().contains("cancelled"));
        pending.wait_ready().await;
        assert!(!client
            .state
            .lock()
            .unwrap()
            .packages_cache
            .contains_key("fedora-bbb-1"));
    }
}
