//! Global kill switch.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// A process-wide stop signal, owned by whoever constructs the engine.
///
/// Cloning yields another handle to the same switch. Readers can poll
/// [`is_engaged`](Self::is_engaged) or await changes through
/// [`subscribe`](Self::subscribe).
#[derive(Debug, Clone)]
pub struct KillSwitch {
    engaged: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl Default for KillSwitch {
    fn default() -> Self {
        Self::new()
    }
}

impl KillSwitch {
    /// Create a disengaged switch.
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            engaged: Arc::new(AtomicBool::new(false)),
            tx: Arc::new(tx),
        }
    }

    /// Engage the switch. Returns `true` if it was not engaged before.
    pub fn engage(&self) -> bool {
        let was = self.engaged.swap(true, Ordering::SeqCst);
        self.tx.send_replace(true);
        !was
    }

    /// Disengage the switch.
    pub fn disengage(&self) {
        self.engaged.store(false, Ordering::SeqCst);
        self.tx.send_replace(false);
    }

    /// Whether the switch is engaged.
    pub fn is_engaged(&self) -> bool {
        self.engaged.load(Ordering::SeqCst)
    }

    /// Watch the switch state.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_engage_is_shared_between_clones() {
        let switch = KillSwitch::new();
        let other = switch.clone();
        assert!(switch.engage());
        assert!(!switch.engage());
        assert!(other.is_engaged());
        other.disengage();
        assert!(!switch.is_engaged());
    }

    #[tokio::test]
    async fn test_subscribers_see_changes() {
        let switch = KillSwitch::new();
        let mut rx = switch.subscribe();
        assert!(!*rx.borrow());
        switch.engage();
        rx.changed().await.unwrap();
        assert!(*rx.borrow());
    }
}
