//! Network reachability as seen by the sync core.
//!
//! The host platform owns the actual reachability checks; it pushes changes into
//! [`SharedConnectivity`] and the engine only ever asks `is_online()`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub trait ConnectivityProbe: Send + Sync {
    fn is_online(&self) -> bool;
}

/// Connectivity flag updated from platform events.
#[derive(Debug, Clone)]
pub struct SharedConnectivity {
    online: Arc<AtomicBool>,
}

impl SharedConnectivity {
    pub fn new(online: bool) -> Self {
        Self {
            online: Arc::new(AtomicBool::new(online)),
        }
    }

    /// Record a reachability change. Returns true when the device just came back online.
    pub fn set_online(&self, online: bool) -> bool {
        let was_online = self.online.swap(online, Ordering::SeqCst);
        if was_online != online {
            tracing::info!(online, "Connectivity changed");
        }
        online && !was_online
    }
}

impl Default for SharedConnectivity {
    fn default() -> Self {
        Self::new(false)
    }
}

impl ConnectivityProbe for SharedConnectivity {
    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_online_reports_regained_connectivity() {
        let probe = SharedConnectivity::new(false);
        assert!(!probe.is_online());

        assert!(probe.set_online(true));
        assert!(probe.is_online());
        assert!(!probe.set_online(true));

        let clone = probe.clone();
        clone.set_online(false);
        assert!(!probe.is_online());
    }
}
