//! Running state-changing daemon methods as transactions.
//!
//! A transaction method returns the address of a private peer-to-peer
//! bus.  We connect to it, call `Start`, and follow its signals until
//! `Finished` arrives or the peer goes away.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::Mutex;

use rpmostree_client::DownloadProgress;
use serde_json::Value;
use tracing::debug;

use crate::bus::{SysrootBus, TransactionConnection, TransactionEvent};
use crate::client::Client;
use crate::error::{Error, Problem, Result};
use crate::notify::ClientEvent;
use crate::packages::RpmDb;

/// At most one transaction per client.  Holds the `Method:os` marker
/// of the one in flight.
#[derive(Debug, Default)]
pub(crate) struct TransactionSlot(Mutex<Option<String>>);

/// Releases the slot on drop.
#[derive(Debug)]
pub(crate) struct SlotGuard<'a>(&'a TransactionSlot);

impl TransactionSlot {
    pub(crate) fn acquire(&self, marker: String) -> Result<SlotGuard<'_>> {
        let mut slot = self.0.lock().unwrap();
        if let Some(running) = slot.as_ref() {
            return Err(Error::Busy {
                running: running.clone(),
            });
        }
        *slot = Some(marker);
        Ok(SlotGuard(self))
    }

    pub(crate) fn running(&self) -> Option<String> {
        self.0.lock().unwrap().clone()
    }
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.0 .0.lock().unwrap().take();
    }
}

/// A decoded signal from a running transaction.
#[derive(Debug, Clone, PartialEq)]
pub enum TransactionSignal {
    Message(String),
    DownloadProgress(DownloadProgress),
    Finished { success: bool, detail: Value },
    /// Anything else, e.g. `PercentProgress` or `TaskBegin`.
    Other { name: String, args: Vec<Value> },
}

impl TransactionSignal {
    pub fn decode(name: &str, args: Vec<Value>) -> Result<Self> {
        let r = match name {
            "Message" => match args.first().and_then(Value::as_str) {
                Some(text) => Self::Message(text.to_string()),
                None => return Err(Error::protocol("Message without text")),
            },
            "DownloadProgress" => Self::DownloadProgress(DownloadProgress::from_wire(&args)?),
            "Finished" => {
                let mut args = args.into_iter();
                match (args.next(), args.next()) {
                    (Some(Value::Bool(success)), Some(detail)) => Self::Finished { success, detail },
                    o => {
                        return Err(Error::protocol(format!(
                            "Unexpected transaction response: {o:?}"
                        )))
                    }
                }
            }
            _ => Self::Other {
                name: name.to_string(),
                args,
            },
        };
        Ok(r)
    }
}

/// The `reboot` option of the first argument dictionary carrying one.
fn reboot_requested(args: &[Value]) -> bool {
    args.iter()
        .find_map(|a| a.as_object().and_then(|m| m.get("reboot")))
        .and_then(Value::as_bool)
        .unwrap_or(false)
}

impl<B: SysrootBus, R: RpmDb> Client<B, R> {
    /// Run `method` on the OS object for `os`, resolving with the
    /// `Finished` detail.
    pub async fn run_transaction(&self, method: &str, args: Vec<Value>, os: &str) -> Result<Value> {
        self.run_transaction_with_progress(method, args, os, |_| {})
            .await
    }

    /// Like [`Client::run_transaction`], passing every non-terminal
    /// signal to `on_signal`.
    pub async fn run_transaction_with_progress<F>(
        &self,
        method: &str,
        args: Vec<Value>,
        os: &str,
        mut on_signal: F,
    ) -> Result<Value>
    where
        F: FnMut(&TransactionSignal),
    {
        let slot = self.slot.acquire(format!("{method}:{os}"))?;
        debug!("run_transaction {method} {args:?} {os}: start");

        let mut txn = None;
        let r = self
            .drive_transaction(method, args, os, &mut txn, &mut on_signal)
            .await;
        if let Some(mut txn) = txn {
            txn.close().await;
        }
        drop(slot);
        self.notifier.trigger_changed();
        debug!("run_transaction {method} {os}: done, ok={}", r.is_ok());
        r
    }

    async fn drive_transaction(
        &self,
        method: &str,
        args: Vec<Value>,
        os: &str,
        txn: &mut Option<B::Transaction>,
        on_signal: &mut dyn FnMut(&TransactionSignal),
    ) -> Result<Value> {
        let reboot = reboot_requested(&args);

        self.connect().await?;
        let path = self
            .os_path(os)
            .ok_or_else(|| Error::NotFound(format!("OS {os}")))?;
        self.reload().await;

        let reply = self.bus.call_os(&path, method, args).await?;
        let address = reply
            .first()
            .and_then(Value::as_str)
            .ok_or_else(|| Error::protocol(format!("{method} did not return a transaction address")))?;
        debug!("run_transaction address: {address}");

        if reboot {
            self.notifier.emit(ClientEvent::RestartExpected);
        }

        let conn = txn.insert(self.bus.open_transaction(address).await?);
        conn.start().await?;

        loop {
            match conn.next_event().await {
                TransactionEvent::Signal { name, args } => {
                    debug!("run_transaction {method} {os}: got {name} {args:?}");
                    match TransactionSignal::decode(&name, args)? {
                        TransactionSignal::Finished { success: true, detail } => return Ok(detail),
                        TransactionSignal::Finished {
                            success: false,
                            detail,
                        } => return Err(Error::Transaction(detail)),
                        signal => on_signal(&signal),
                    }
                }
                TransactionEvent::Closed(reason) => {
                    debug!("run_transaction {method} {os}: closed: {reason}");
                    return Err(Error::connection(Problem::Disconnected, reason));
                }
            }
        }
    }
}
