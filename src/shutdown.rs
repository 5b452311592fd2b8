//! Cancellation signals for engine tasks.
//!
//! A [`ShutdownSignal`] is the single root cancellation source of an engine.
//! Roles derive child signals from it so that leaving a role stops that
//! role's timers and in-flight RPCs without touching the rest of the engine,
//! while triggering the root stops everything.

use futures::future::select_all;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Cloneable cancellation signal with optional ancestors.
#[derive(Clone)]
pub struct ShutdownSignal {
    /// Sender for this signal's own watch channel.
    tx: Arc<watch::Sender<bool>>,
    /// Receivers for this signal and every ancestor, own receiver first.
    chain: Vec<watch::Receiver<bool>>,
    /// Flag indicating if this signal was triggered directly.
    triggered: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Create a new root signal.
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            chain: vec![rx],
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Derive a child that fires when either it or any ancestor is triggered.
    pub fn child(&self) -> Self {
        let (tx, rx) = watch::channel(false);
        let mut chain = Vec::with_capacity(self.chain.len() + 1);
        chain.push(rx);
        chain.extend(self.chain.iter().cloned());
        Self {
            tx: Arc::new(tx),
            chain,
            triggered: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Trigger this signal. Idempotent.
    pub fn trigger(&self) {
        if self
            .triggered
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            debug!("Cancellation signal triggered");
            self.tx.send_replace(true);
        }
    }

    /// Check if this signal or any ancestor has been triggered.
    pub fn is_triggered(&self) -> bool {
        self.chain.iter().any(|rx| *rx.borrow())
    }

    /// Wait until this signal or any ancestor is triggered (for use in `select!`).
    pub async fn cancelled(&self) {
        let waits = self
            .chain
            .iter()
            .cloned()
            .map(|rx| Box::pin(wait_for_trigger(rx)));
        select_all(waits).await;
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

async fn wait_for_trigger(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            // Sender dropped without triggering: never fires.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_root_trigger() {
        let signal = ShutdownSignal::new();
        assert!(!signal.is_triggered());

        let waiter = signal.clone();
        let handle = tokio::spawn(async move { waiter.cancelled().await });

        signal.trigger();
        signal.trigger();
        assert!(signal.is_triggered());
        timeout(Duration::from_secs(1), handle).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_parent_cancels_child() {
        let root = ShutdownSignal::new();
        let child = root.child();

        root.trigger();
        assert!(child.is_triggered());
        timeout(Duration::from_secs(1), child.cancelled()).await.unwrap();
    }

    #[tokio::test]
    async fn test_child_does_not_cancel_parent() {
        let root = ShutdownSignal::new();
        let child = root.child();

        child.trigger();
        assert!(child.is_triggered());
        assert!(!root.is_triggered());
        assert!(timeout(Duration::from_millis(50), root.cancelled()).await.is_err());
    }
}
