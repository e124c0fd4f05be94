//! # Test utility functions
//!
//! An in-memory stand-in for the daemon, scripted per test.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rpmostree_client::Deployment;
use serde_json::{json, Value};

use crate::bus::{BusEvent, OsObject, Properties, SysrootBus, TransactionConnection, TransactionEvent};
use crate::client::{Client, OBJECT_PATH};
use crate::config::Config;
use crate::error::{Error, Problem, Result};
use crate::packages::RpmDb;

pub(crate) const FEDORA_ORIGIN: &str = "fedora:fedora/39/x86_64/silverblue";

#[derive(Debug, Default)]
struct MockState {
    open_error: Option<(Problem, String)>,
    sysroot: Properties,
    os_objects: Vec<OsObject>,
    replies: HashMap<String, Vec<Value>>,
    calls: Vec<(String, Vec<Value>)>,
    events: VecDeque<BusEvent>,
    closed: Option<(Problem, String)>,
    transactions: VecDeque<Vec<TransactionEvent>>,
    opened: Vec<String>,
    opens: usize,
}

/// Scripted daemon.  Methods without a registered reply fail like an
/// unknown method would.
#[derive(Debug, Default)]
pub(crate) struct MockBus {
    state: Mutex<MockState>,
    closes: Arc<AtomicUsize>,
}

fn deployment(osname: &str, index: usize, checksum: &str) -> Value {
    json!({
        "id": format!("{osname}-{checksum}-{index}"),
        "osname": osname,
        "checksum": checksum,
        "version": format!("39.{index}"),
        "timestamp": 1700000000u64 + index as u64,
        "origin": FEDORA_ORIGIN,
        "signatures": [],
    })
}

/// A cached update for fedora on its current origin.
pub(crate) fn update(checksum: &str) -> Deployment {
    Deployment {
        id: None,
        osname: "fedora".into(),
        checksum: checksum.into(),
        version: Some("39.20".into()),
        timestamp: 1700001000,
        origin: Some(FEDORA_ORIGIN.into()),
        container_image_reference: None,
        booted: false,
        pinned: false,
        staged: false,
        signatures: Vec::new(),
        index: None,
    }
}

pub(crate) fn signal(name: &str, args: Vec<Value>) -> TransactionEvent {
    TransactionEvent::Signal {
        name: name.into(),
        args,
    }
}

impl MockBus {
    /// Two fedora deployments (default `aaa`, booted `bbb`) and one rhel.
    pub(crate) fn fixture() -> Self {
        let d0 = deployment("fedora", 0, "aaa");
        let mut d1 = deployment("fedora", 1, "bbb");
        d1["booted"] = json!(true);
        d1["pinned"] = json!(true);
        let mut d2 = deployment("rhel", 2, "ccc");
        d2["origin"] = json!("rhel:rhel/9/x86_64/edge");

        let fedora = format!("{OBJECT_PATH}/fedora");
        let rhel = format!("{OBJECT_PATH}/rhel");
        let sysroot = json!({
            "Booted": fedora,
            "Deployments": [d0, d1, d2],
            "ActiveTransaction": ["", "", ""],
        });
        let os_objects = vec![
            OsObject {
                path: fedora,
                properties: object(json!({
                    "Name": "fedora",
                    "BootedDeployment": d1,
                    "DefaultDeployment": d0,
                    "RollbackDeployment": d1,
                    "CachedUpdate": {},
                })),
            },
            OsObject {
                path: rhel,
                properties: object(json!({
                    "Name": "rhel",
                    "BootedDeployment": {},
                    "DefaultDeployment": d2,
                    "RollbackDeployment": {},
                    "CachedUpdate": {},
                })),
            },
        ];
        Self {
            state: Mutex::new(MockState {
                sysroot: object(sysroot),
                os_objects,
                ..Default::default()
            }),
            closes: Default::default(),
        }
    }

    /// Replace the origin of every fedora deployment.
    pub(crate) fn with_origin(self, origin: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let fix = |d: &mut Value| {
                if d.get("osname") == Some(&json!("fedora")) {
                    d["origin"] = json!(origin);
                }
            };
            if let Some(Value::Array(list)) = state.sysroot.get_mut("Deployments") {
                list.iter_mut().for_each(fix);
            }
            for obj in state.os_objects.iter_mut() {
                for (_, v) in obj.properties.iter_mut() {
                    fix(v);
                }
            }
        }
        self
    }

    pub(crate) fn with_cached_update(self, os: &str, update: Deployment) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            let path = format!("{OBJECT_PATH}/{os}");
            if let Some(obj) = state.os_objects.iter_mut().find(|o| o.path == path) {
                let v = serde_json::to_value(&update).unwrap();
                obj.properties.insert("CachedUpdate".into(), v);
            }
        }
        self
    }

    pub(crate) fn fail_open(&self, problem: Problem, message: &str) {
        self.state.lock().unwrap().open_error = Some((problem, message.into()));
    }

    pub(crate) fn reply(&self, method: &str, reply: Vec<Value>) {
        let mut state = self.state.lock().unwrap();
        state.replies.insert(method.into(), reply);
    }

    pub(crate) fn push_event(&self, ev: BusEvent) {
        self.state.lock().unwrap().events.push_back(ev);
    }

    /// The main connection drops, as seen by the signal thread.
    pub(crate) fn close(&self, problem: Problem, message: &str) {
        let mut state = self.state.lock().unwrap();
        state.closed = Some((problem, message.into()));
        state.events.push_back(BusEvent::Closed {
            problem,
            message: message.into(),
        });
    }

    /// Forget every deployment of `os`, as after an undeploy.
    pub(crate) fn drop_deployments(&self, os: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(Value::Array(list)) = state.sysroot.get_mut("Deployments") {
            list.retain(|d| d.get("osname") != Some(&json!(os)));
        }
    }

    pub(crate) fn opens(&self) -> usize {
        self.state.lock().unwrap().opens
    }

    /// Signals delivered by the next transaction connection.
    pub(crate) fn push_transaction(&self, events: Vec<TransactionEvent>) {
        self.state.lock().unwrap().transactions.push_back(events);
    }

    /// Counts `close()` calls on transaction connections.
    pub(crate) fn transaction_closes(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.closes)
    }

    pub(crate) fn calls_to(&self, method: &str) -> Vec<Vec<Value>> {
        let state = self.state.lock().unwrap();
        state
            .calls
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, args)| args.clone())
            .collect()
    }

    pub(crate) fn opened_transactions(&self) -> Vec<String> {
        self.state.lock().unwrap().opened.clone()
    }

    fn call(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        let mut state = self.state.lock().unwrap();
        state.calls.push((method.into(), args));
        state.replies.get(method).cloned().ok_or_else(|| Error::Call {
            method: method.into(),
            message: "No such method".into(),
        })
    }
}

fn object(v: Value) -> Properties {
    match v {
        Value::Object(m) => m,
        _ => unreachable!(),
    }
}

impl SysrootBus for MockBus {
    type Transaction = MockTransaction;

    async fn open(&self) -> Result<()> {
        // Let concurrent callers pile up behind this attempt
        tokio::task::yield_now().await;
        let mut state = self.state.lock().unwrap();
        state.opens += 1;
        match state.open_error.clone() {
            Some((problem, message)) => Err(Error::connection(problem, message)),
            None => {
                state.closed = None;
                Ok(())
            }
        }
    }

    async fn sysroot_properties(&self) -> Result<Properties> {
        Ok(self.state.lock().unwrap().sysroot.clone())
    }

    async fn os_objects(&self) -> Result<Vec<OsObject>> {
        Ok(self.state.lock().unwrap().os_objects.clone())
    }

    async fn call_sysroot(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        self.call(method, args)
    }

    async fn call_os(&self, _path: &str, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        self.call(method, args)
    }

    /// Waits forever once the scripted events run out.
    async fn next_event(&self) -> Option<BusEvent> {
        let ev = self.state.lock().unwrap().events.pop_front();
        match ev {
            Some(ev) => Some(ev),
            None => std::future::pending().await,
        }
    }

    fn closed(&self) -> Option<(Problem, String)> {
        self.state.lock().unwrap().closed.clone()
    }

    async fn open_transaction(&self, address: &str) -> Result<MockTransaction> {
        let mut state = self.state.lock().unwrap();
        state.opened.push(address.into());
        Ok(MockTransaction {
            events: state.transactions.pop_front().unwrap_or_default().into(),
            started: false,
            closes: Arc::clone(&self.closes),
        })
    }
}

#[derive(Debug)]
pub(crate) struct MockTransaction {
    events: VecDeque<TransactionEvent>,
    started: bool,
    closes: Arc<AtomicUsize>,
}

impl TransactionConnection for MockTransaction {
    async fn start(&mut self) -> Result<()> {
        self.started = true;
        Ok(())
    }

    async fn next_event(&mut self) -> TransactionEvent {
        assert!(self.started, "signal awaited before Start");
        self.events
            .pop_front()
            .unwrap_or_else(|| TransactionEvent::Closed("peer closed the connection".into()))
    }

    async fn close(&mut self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// `rpm -qa` with a fixed answer.
#[derive(Debug, Default)]
pub(crate) struct MockRpm(pub(crate) String);

impl RpmDb for MockRpm {
    async fn installed_packages(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

pub(crate) fn test_client(bus: MockBus) -> Client<MockBus, MockRpm> {
    let rpm = MockRpm("kernel-6.5-1.x86_64\nglibc-2.38-1.x86_64\nbash-5.2-1.x86_64\n".into());
    Client::new(bus, rpm, &Config::default())
}

pub(crate) async fn connected(bus: MockBus) -> Client<MockBus, MockRpm> {
    let client = test_client(bus);
    client.connect().await.unwrap();
    client
}
