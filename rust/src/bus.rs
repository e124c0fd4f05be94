//! The seam between the client and the daemon's DBus API.
//!
//! Everything crossing this boundary is rendered as JSON: dictionaries
//! become objects, tuples and arrays become arrays, and variants are
//! unwrapped.  The gio-backed implementation lives in [`crate::dbus`].
// SPDX-License-Identifier: Apache-2.0 OR MIT

use serde_json::Value;

use crate::error::{Problem, Result};

/// Cached properties of one DBus object.
pub type Properties = serde_json::Map<String, Value>;

/// An object implementing the OS interface.
#[derive(Debug, Clone, PartialEq)]
pub struct OsObject {
    pub path: String,
    pub properties: Properties,
}

/// Notifications from the main bus connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// Properties of the Sysroot object changed.
    SysrootChanged,
    /// An OS object changed, appeared or went away.
    OsChanged(String),
    /// The connection was closed.
    Closed { problem: Problem, message: String },
}

/// Notifications from a transaction's private connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionEvent {
    Signal { name: String, args: Vec<Value> },
    /// The peer went away, with the reason if known.
    Closed(String),
}

/// Connection to the daemon.
#[allow(async_fn_in_trait)]
pub trait SysrootBus {
    type Transaction: TransactionConnection;

    /// Establish (or re-establish) the main connection.
    async fn open(&self) -> Result<()>;

    /// Properties of the Sysroot object: `Booted`, `Deployments`,
    /// `ActiveTransaction` and friends.
    async fn sysroot_properties(&self) -> Result<Properties>;

    /// Every object implementing the OS interface.
    async fn os_objects(&self) -> Result<Vec<OsObject>>;

    /// Invoke a method on the Sysroot object.
    async fn call_sysroot(&self, method: &str, args: Vec<Value>) -> Result<Vec<Value>>;

    /// Invoke a method on the OS object at `path`.
    async fn call_os(&self, path: &str, method: &str, args: Vec<Value>) -> Result<Vec<Value>>;

    /// Wait for the next change notification; `None` once the
    /// connection is gone for good.
    async fn next_event(&self) -> Option<BusEvent>;

    /// Why the main connection closed, if it did since the last
    /// [`SysrootBus::open`].  Never waits.
    fn closed(&self) -> Option<(Problem, String)>;

    /// Open a peer connection to a transaction's private bus address and
    /// subscribe to its signals.
    async fn open_transaction(&self, address: &str) -> Result<Self::Transaction>;
}

/// A transaction's private peer connection.
#[allow(async_fn_in_trait)]
pub trait TransactionConnection {
    /// Tell the transaction to begin; signals follow.
    async fn start(&mut self) -> Result<()>;

    async fn next_event(&mut self) -> TransactionEvent;

    /// Unsubscribe and close.  Safe to call more than once.
    async fn close(&mut self);
}
