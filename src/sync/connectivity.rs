//! Injected connectivity signal.
//!
//! The processor subscribes to an observer instead of a global flag, so tests
//! can drive offline/online transitions deterministically.

use std::sync::Arc;
use tokio::sync::watch;

pub trait ConnectivityObserver: Send + Sync {
    fn is_online(&self) -> bool;
    /// A receiver that yields whenever the online state changes.
    fn watch(&self) -> watch::Receiver<bool>;
}

/// A watch-channel backed connectivity signal. The host application (or a
/// test) flips it; the processor reacts.
pub struct ConnectivitySignal {
    tx: watch::Sender<bool>,
}

impl ConnectivitySignal {
    pub fn new(initially_online: bool) -> Arc<Self> {
        let (tx, _rx) = watch::channel(initially_online);
        Arc::new(Self { tx })
    }

    pub fn set_online(&self, online: bool) {
        // send_replace never fails; the sender owns the channel.
        self.tx.send_replace(online);
    }
}

impl ConnectivityObserver for ConnectivitySignal {
    fn is_online(&self) -> bool {
        *self.tx.borrow()
    }

    fn watch(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
