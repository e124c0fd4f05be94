//! gio-backed implementation of [`SysrootBus`].
//!
//! All calls use gio's synchronous API on the blocking pool.  Signals
//! need a main loop, so each connection we watch gets a small thread
//! iterating its own `glib::MainContext`, forwarding into a tokio channel.
// SPDX-License-Identifier: Apache-2.0 OR MIT

#![allow(deprecated)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use gio::prelude::*;
use glib::MainContext;
use serde_json::Value;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};
use tokio::sync::Notify;

use crate::bus::{BusEvent, OsObject, Properties, SysrootBus, TransactionConnection, TransactionEvent};
use crate::client::{OBJECT_PATH, OS_INTERFACE, SYSROOT_INTERFACE, SYSROOT_PATH, TRANSACTION_INTERFACE};
use crate::error::{Error, Problem, Result};
use crate::variant_utils::{args_to_variant, tuple_to_json};

const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const OBJECT_MANAGER_INTERFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Classify a failure to reach the daemon.
fn connect_error(e: glib::Error) -> Error {
    let problem = if let Some(k) = e.kind::<gio::DBusError>() {
        match k {
            gio::DBusError::AccessDenied | gio::DBusError::AuthFailed => Problem::AccessDenied,
            gio::DBusError::ServiceUnknown
            | gio::DBusError::NameHasNoOwner
            | gio::DBusError::UnknownObject => Problem::NotFound,
            gio::DBusError::Disconnected | gio::DBusError::NoServer => Problem::Disconnected,
            _ => Problem::Other,
        }
    } else if let Some(k) = e.kind::<gio::IOErrorEnum>() {
        match k {
            gio::IOErrorEnum::PermissionDenied => Problem::AccessDenied,
            gio::IOErrorEnum::NotFound => Problem::NotFound,
            gio::IOErrorEnum::Closed => Problem::Disconnected,
            _ => Problem::Other,
        }
    } else {
        Problem::Other
    };
    Error::connection(problem, e.message())
}

/// Classify a failed method call; only transport problems are
/// connection errors, anything the daemon itself reports is not.
fn call_error(method: &str, e: glib::Error) -> Error {
    match connect_error(e.clone()) {
        Error::Connection {
            problem: Problem::Other,
            ..
        } => Error::Call {
            method: method.to_string(),
            message: e.message().to_string(),
        },
        o => o,
    }
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::connection(Problem::Other, format!("bus worker failed: {e}")))?
}

/// A thread iterating a private main context until told to stop.
struct LoopThread {
    ctx: MainContext,
    quit: Arc<AtomicBool>,
}

impl LoopThread {
    /// Run `setup` with a fresh thread-default main context, then
    /// iterate that context until dropped.  `setup` returns the
    /// teardown to run once the loop exits.
    fn spawn<S>(name: &str, setup: S) -> Result<Self>
    where
        S: FnOnce() -> Option<Box<dyn FnOnce()>> + Send + 'static,
    {
        let ctx = MainContext::new();
        let quit = Arc::new(AtomicBool::new(false));
        let (thread_ctx, thread_quit) = (ctx.clone(), Arc::clone(&quit));
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                let r = thread_ctx.with_thread_default(|| {
                    let teardown = setup();
                    if teardown.is_some() {
                        while !thread_quit.load(Ordering::SeqCst) {
                            thread_ctx.iteration(true);
                        }
                    }
                    if let Some(teardown) = teardown {
                        teardown();
                    }
                });
                if let Err(e) = r {
                    tracing::warn!("Failed to acquire main context: {e}");
                }
            })?;
        Ok(Self { ctx, quit })
    }
}

impl Drop for LoopThread {
    fn drop(&mut self) {
        self.quit.store(true, Ordering::SeqCst);
        self.ctx.wakeup();
    }
}

#[derive(Debug, Default)]
struct PendingEvents {
    sysroot: bool,
    os: BTreeSet<String>,
    closed: Option<(Problem, String)>,
}

/// Change notifications from the watcher thread.  An event that is
/// already pending absorbs its repeats, so nothing piles up while
/// nobody is consuming.
#[derive(Debug, Default)]
struct EventQueue {
    pending: Mutex<PendingEvents>,
    notify: Notify,
}

impl EventQueue {
    fn push(&self, ev: BusEvent) {
        {
            let mut p = self.pending.lock().unwrap();
            match ev {
                BusEvent::SysrootChanged => p.sysroot = true,
                BusEvent::OsChanged(path) => {
                    p.os.insert(path);
                }
                BusEvent::Closed { problem, message } => {
                    p.closed.get_or_insert((problem, message));
                }
            }
        }
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<BusEvent> {
        let mut p = self.pending.lock().unwrap();
        // Nothing else matters once the connection is gone
        if let Some((problem, message)) = p.closed.clone() {
            return Some(BusEvent::Closed { problem, message });
        }
        if std::mem::take(&mut p.sysroot) {
            return Some(BusEvent::SysrootChanged);
        }
        p.os.pop_first().map(BusEvent::OsChanged)
    }

    async fn next(&self) -> BusEvent {
        loop {
            if let Some(ev) = self.pop() {
                return ev;
            }
            self.notify.notified().await;
        }
    }

    fn closed(&self) -> Option<(Problem, String)> {
        self.pending.lock().unwrap().closed.clone()
    }
}

struct Connected {
    conn: gio::DBusConnection,
    events: Arc<EventQueue>,
    _watcher: LoopThread,
}

/// Connection to the system bus speaking to rpm-ostreed.
pub struct GioBus {
    bus_name: String,
    state: Mutex<Option<Connected>>,
}

impl GioBus {
    pub fn new(bus_name: impl Into<String>) -> Self {
        Self {
            bus_name: bus_name.into(),
            state: Mutex::new(None),
        }
    }

    fn events(&self) -> Option<Arc<EventQueue>> {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| Arc::clone(&c.events))
    }

    fn conn(&self) -> Result<gio::DBusConnection> {
        self.state
            .lock()
            .unwrap()
            .as_ref()
            .map(|c| c.conn.clone())
            .ok_or_else(|| Error::connection(Problem::Disconnected, "Not connected"))
    }

    async fn call(
        &self,
        path: &str,
        interface: &'static str,
        method: &str,
        args: Vec<Value>,
        timeout_msec: i32,
    ) -> Result<Vec<Value>> {
        let conn = self.conn()?;
        let bus_name = self.bus_name.clone();
        let path = path.to_string();
        let method = method.to_string();
        blocking(move || {
            let params = args_to_variant(&args)?;
            tracing::debug!("calling {interface}.{method} on {path}");
            let reply = conn
                .call_sync(
                    Some(&bus_name),
                    &path,
                    interface,
                    &method,
                    Some(&params),
                    None,
                    gio::DBusCallFlags::NONE,
                    timeout_msec,
                    gio::Cancellable::NONE,
                )
                .map_err(|e| call_error(&method, e))?;
            Ok(tuple_to_json(&reply))
        })
        .await
    }
}

/// Subscribe to everything that means our view of the daemon is stale.
fn watch_bus(
    conn: gio::DBusConnection,
    bus_name: String,
    events: Arc<EventQueue>,
) -> Option<Box<dyn FnOnce()>> {
    let props_events = Arc::clone(&events);
    let props = conn.signal_subscribe(
        Some(&bus_name),
        Some(PROPERTIES_INTERFACE),
        Some("PropertiesChanged"),
        None,
        None,
        gio::DBusSignalFlags::NONE,
        move |_, _, path, _, _, _| {
            let ev = if path == SYSROOT_PATH {
                BusEvent::SysrootChanged
            } else {
                BusEvent::OsChanged(path.to_string())
            };
            props_events.push(ev);
        },
    );
    let objects_events = Arc::clone(&events);
    let objects = conn.signal_subscribe(
        Some(&bus_name),
        Some(OBJECT_MANAGER_INTERFACE),
        None,
        Some(OBJECT_PATH),
        None,
        gio::DBusSignalFlags::NONE,
        move |_, _, _, _, _, params| {
            if let Some(Value::String(path)) = tuple_to_json(params).into_iter().next() {
                objects_events.push(BusEvent::OsChanged(path));
            }
        },
    );
    // The daemon exits when idle; a new owner means new objects
    let owner_events = Arc::clone(&events);
    let owner = conn.signal_subscribe(
        Some("org.freedesktop.DBus"),
        Some("org.freedesktop.DBus"),
        Some("NameOwnerChanged"),
        Some("/org/freedesktop/DBus"),
        Some(&bus_name),
        gio::DBusSignalFlags::NONE,
        move |_, _, _, _, _, _| {
            owner_events.push(BusEvent::SysrootChanged);
        },
    );
    let closed = conn.connect_closed(move |_, vanished, err| {
        let message = match err {
            Some(e) => e.message().to_string(),
            None if vanished => "The system bus went away".to_string(),
            None => "Connection closed".to_string(),
        };
        events.push(BusEvent::Closed {
            problem: Problem::Disconnected,
            message,
        });
    });
    let teardown: Box<dyn FnOnce()> = Box::new(move || {
        for id in [props, objects, owner] {
            conn.signal_unsubscribe(id);
        }
        conn.disconnect(closed);
    });
    Some(teardown)
}

impl SysrootBus for GioBus {
    type Transaction = GioTransaction;

    async fn open(&self) -> Result<()> {
        if self.state.lock().unwrap().is_some() && self.closed().is_none() {
            return Ok(());
        }
        let bus_name = self.bus_name.clone();
        let (conn, events, watcher) = blocking(move || {
            let conn = gio::bus_get_sync(gio::BusType::System, gio::Cancellable::NONE)
                .map_err(connect_error)?;
            // Activates the daemon, and tells us whether it exists at all
            conn.call_sync(
                Some(&bus_name),
                OBJECT_PATH,
                "org.freedesktop.DBus.Peer",
                "Ping",
                None,
                None,
                gio::DBusCallFlags::NONE,
                -1,
                gio::Cancellable::NONE,
            )
            .map_err(connect_error)?;
            let events = Arc::new(EventQueue::default());
            let (watch_conn, watch_events) = (conn.clone(), Arc::clone(&events));
            let watcher = LoopThread::spawn("rpmostree-bus", move || {
                watch_bus(watch_conn, bus_name, watch_events)
            })?;
            Ok((conn, events, watcher))
        })
        .await?;
        *self.state.lock().unwrap() = Some(Connected {
            conn,
            events,
            _watcher: watcher,
        });
        Ok(())
    }

    async fn sysroot_properties(&self) -> Result<Properties> {
        let reply = self
            .call(
                SYSROOT_PATH,
                PROPERTIES_INTERFACE,
                "GetAll",
                vec![Value::from(SYSROOT_INTERFACE)],
                -1,
            )
            .await?;
        match reply.into_iter().next() {
            Some(Value::Object(m)) => Ok(m),
            o => Err(Error::protocol(format!("unexpected GetAll reply: {o:?}"))),
        }
    }

    async fn os_objects(&self) -> Result<Vec<OsObject>> {
        let reply = self
            .call(
                OBJECT_PATH,
                OBJECT_MANAGER_INTERFACE,
                "GetManagedObjects",
                Vec::new(),
                -1,
            )
            .await?;
        let objects = match reply.into_iter().next() {
            Some(Value::Object(m)) => m,
            o => {
                return Err(Error::protocol(format!(
                    "unexpected GetManagedObjects reply: {o:?}"
                )))
            }
        };
        Ok(objects
            .into_iter()
            .filter_map(|(path, mut interfaces)| match interfaces.get_mut(OS_INTERFACE) {
                Some(Value::Object(props)) => Some(OsObject {
                    path,
                    properties: std::mem::take(props),
                }),
                _ => None,
            })
            .collect())
    }

    async fn call_sysroot(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        self.call(SYSROOT_PATH, SYSROOT_INTERFACE, method, args, -1)
            .await
    }

    async fn call_os(&self, path: &str, method: &str, args: Vec<Value>) -> Result<Vec<Value>> {
        // Diffs and transaction setup may take a while; don't time out
        self.call(path, OS_INTERFACE, method, args, i32::MAX).await
    }

    async fn next_event(&self) -> Option<BusEvent> {
        let events = self.events()?;
        let ev = events.next().await;
        if matches!(ev, BusEvent::Closed { .. }) {
            let mut state = self.state.lock().unwrap();
            // Unless someone already reconnected
            if state.as_ref().is_some_and(|c| Arc::ptr_eq(&c.events, &events)) {
                *state = None;
            }
        }
        Some(ev)
    }

    fn closed(&self) -> Option<(Problem, String)> {
        self.events()?.closed()
    }

    async fn open_transaction(&self, address: &str) -> Result<GioTransaction> {
        let address = address.to_string();
        let (tx, rx) = unbounded_channel();
        let (ready_tx, ready_rx) = tokio::sync::oneshot::channel();
        let watcher = LoopThread::spawn("rpmostree-txn", move || {
            let conn = match gio::DBusConnection::for_address_sync(
                &address,
                gio::DBusConnectionFlags::AUTHENTICATION_CLIENT,
                None,
                gio::Cancellable::NONE,
            ) {
                Ok(c) => c,
                Err(e) => {
                    let _ = ready_tx.send(Err(connect_error(e)));
                    return None;
                }
            };
            let signal_tx = tx.clone();
            let sub = conn.signal_subscribe(
                None,
                None,
                None,
                Some("/"),
                None,
                gio::DBusSignalFlags::NONE,
                move |_, _, _, _, signal, params| {
                    let _ = signal_tx.send(TransactionEvent::Signal {
                        name: signal.to_string(),
                        args: tuple_to_json(params),
                    });
                },
            );
            let closed = conn.connect_closed(move |_, _, err| {
                let reason = err
                    .map(|e| e.message().to_string())
                    .unwrap_or_else(|| "Transaction connection closed".to_string());
                let _ = tx.send(TransactionEvent::Closed(reason));
            });
            let _ = ready_tx.send(Ok(conn.clone()));
            let teardown: Box<dyn FnOnce()> = Box::new(move || {
                conn.signal_unsubscribe(sub);
                conn.disconnect(closed);
            });
            Some(teardown)
        })?;
        let conn = ready_rx.await.map_err(|_| {
            Error::connection(Problem::Disconnected, "Transaction watcher exited")
        })??;
        Ok(GioTransaction {
            conn,
            events: rx,
            watcher: Some(watcher),
        })
    }
}

/// Peer connection to one transaction.
pub struct GioTransaction {
    conn: gio::DBusConnection,
    events: UnboundedReceiver<TransactionEvent>,
    watcher: Option<LoopThread>,
}

impl TransactionConnection for GioTransaction {
    async fn start(&mut self) -> Result<()> {
        let conn = self.conn.clone();
        blocking(move || {
            conn.call_sync(
                None,
                "/",
                TRANSACTION_INTERFACE,
                "Start",
                None,
                None,
                gio::DBusCallFlags::NONE,
                -1,
                gio::Cancellable::NONE,
            )
            .map_err(|e| call_error("Start", e))?;
            Ok(())
        })
        .await
    }

    async fn next_event(&mut self) -> TransactionEvent {
        self.events
            .recv()
            .await
            .unwrap_or_else(|| TransactionEvent::Closed("Transaction connection closed".into()))
    }

    async fn close(&mut self) {
        // Stop the loop first so we don't report our own close
        if self.watcher.take().is_none() {
            return;
        }
        let conn = self.conn.clone();
        let r = blocking(move || {
            conn.close_sync(gio::Cancellable::NONE)
                .map_err(|e| call_error("Close", e))
        })
        .await;
        if let Err(e) = r {
            tracing::debug!("closing transaction connection: {e}");
        }
    }
}
