//! Change notifications with coalescing.
//!
//! The daemon tends to emit bursts of property changes (a transaction
//! touching several OS objects at once), so `Changed` is rate limited:
//! the first one in a window is delivered immediately, and any number of
//! further ones within the window collapse into a single trailing
//! delivery when it closes.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use crate::error::Problem;

/// Something observable happened to the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    /// Cached state may be different now; re-query what you display.
    Changed,
    /// The main bus connection went away.
    ConnectionLost { problem: Problem, message: String },
    /// A transaction was started that will reboot the host.
    RestartExpected,
}

type Callback = Arc<dyn Fn(&ClientEvent) + Send + Sync>;

#[derive(Default)]
struct Coalesce {
    timer_active: bool,
    skipped: bool,
}

struct Inner {
    window: Duration,
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(u64, Callback)>>,
    coalesce: Mutex<Coalesce>,
}

/// Fan-out of [`ClientEvent`]s to subscribers.
#[derive(Clone)]
pub struct Notifier(Arc<Inner>);

/// Handle returned by [`Notifier::subscribe`]; dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    inner: Weak<Inner>,
    id: u64,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.upgrade() {
            let mut subs = inner.subscribers.lock().unwrap();
            subs.retain(|(id, _)| *id != self.id);
        }
    }
}

impl Notifier {
    pub fn new(window: Duration) -> Self {
        Self(Arc::new(Inner {
            window,
            next_id: AtomicU64::new(0),
            subscribers: Default::default(),
            coalesce: Default::default(),
        }))
    }

    pub fn subscribe(&self, f: impl Fn(&ClientEvent) + Send + Sync + 'static) -> Subscription {
        let id = self.0.next_id.fetch_add(1, Ordering::Relaxed);
        self.0.subscribers.lock().unwrap().push((id, Arc::new(f)));
        Subscription {
            inner: Arc::downgrade(&self.0),
            id,
        }
    }

    /// Deliver an event to every subscriber right away.
    pub fn emit(&self, event: ClientEvent) {
        // Don't call out with the lock held, callbacks may (un)subscribe
        let subs: Vec<Callback> = {
            let subs = self.0.subscribers.lock().unwrap();
            subs.iter().map(|(_, f)| Arc::clone(f)).collect()
        };
        for f in subs {
            f(&event)
        }
    }

    /// Signal that state changed, subject to coalescing.
    pub fn trigger_changed(&self) {
        {
            let mut c = self.0.coalesce.lock().unwrap();
            if c.timer_active {
                c.skipped = true;
                return;
            }
            c.timer_active = true;
        }
        self.emit(ClientEvent::Changed);

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let this = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep(this.0.window).await;
                    this.window_closed();
                });
            }
            Err(_) => {
                // No runtime to time the window with; deliver everything.
                self.0.coalesce.lock().unwrap().timer_active = false;
            }
        }
    }

    fn window_closed(&self) {
        let fire = {
            let mut c = self.0.coalesce.lock().unwrap();
            c.timer_active = false;
            std::mem::take(&mut c.skipped)
        };
        if fire {
            self.emit(ClientEvent::Changed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter(n: &Notifier) -> (Arc<AtomicUsize>, Subscription) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let sub = n.subscribe(move |ev| {
            if *ev == ClientEvent::Changed {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });
        (count, sub)
    }

    async fn advance(ms: u64) {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        tokio::task::yield_now().await;
    }

    #[tokio::test(start_paused = true)]
    async fn leading_and_trailing() {
        let n = Notifier::new(Duration::from_millis(300));
        let (count, _sub) = counter(&n);

        n.trigger_changed();
        assert_eq!(count.load(Ordering::SeqCst), 1);
        for _ in 0..5 {
            n.trigger_changed();
        }
        assert_eq!(count.load(Ordering::SeqCst), 1);
        advance(301).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);

        // A quiet window produces no trailing event
        advance(1000).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
        n.trigger_changed();
        assert_eq!(count.load(Ordering::SeqCst), 3);
        advance(301).await;
        assert_eq!(count.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn unsubscribe() {
        let n = Notifier::new(Duration::from_millis(1));
        let (count, sub) = counter(&n);
        n.emit(ClientEvent::Changed);
        sub.unsubscribe();
        n.emit(ClientEvent::Changed);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let (count, _sub) = counter(&n);
        n.emit(ClientEvent::RestartExpected);
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn without_runtime() {
        let n = Notifier::new(Duration::from_secs(60));
        let (count, _sub) = counter(&n);
        n.trigger_changed();
        n.trigger_changed();
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
