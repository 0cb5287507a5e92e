use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::broadcast;
use tracing::{info, warn};

/* ============================= RECOVERY GUARD ============================= */

/// Tracks a live fault claim. Armed before `inject()` is attempted and
/// disarmed only after `recover()` returns, so every exit path between the
/// two can see that recovery is still owed. A guard dropped while armed
/// means the process is dying without recovery (SIGKILL-class exits); that
/// leak is logged but cannot be repaired from here.
#[derive(Debug)]
pub struct RecoveryGuard {
    armed: Arc<AtomicBool>,
    label: String,
}

impl RecoveryGuard {
    pub fn arm(label: impl Into<String>) -> Self {
        let label = label.into();
        info!(fault = %label, "recovery_guard_armed");
        Self {
            armed: Arc::new(AtomicBool::new(true)),
            label,
        }
    }

    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::SeqCst)
    }

    /// Shared view of the fault-active flag, readable from other tasks.
    pub fn flag(&self) -> Arc<AtomicBool> {
        self.armed.clone()
    }

    pub fn disarm(&self) {
        if self.armed.swap(false, Ordering::SeqCst) {
            info!(fault = %self.label, "recovery_guard_disarmed");
        }
    }
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        if self.is_armed() {
            warn!(fault = %self.label, "fault_recovery_leaked_at_exit");
        }
    }
}

/* ============================= SHUTDOWN HANDLE ============================= */

/// Cooperative shutdown switch shared by the conductor, servers, and the
/// signal listener. `request_shutdown` is idempotent and safe from any task.
#[derive(Clone, Debug)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(4);
        Self {
            requested: Arc::new(AtomicBool::new(false)),
            tx,
        }
    }

    pub fn request_shutdown(&self) {
        if !self.requested.swap(true, Ordering::SeqCst) {
            info!("shutdown_requested");
            let _ = self.tx.send(());
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }
}

impl Default for ShutdownHandle {
    fn default() -> Self {
        Self::new()
    }
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_arm_disarm() {
        let guard = RecoveryGuard::arm("test-fault");
        assert!(guard.is_armed());
        guard.disarm();
        assert!(!guard.is_armed());
        // Disarming again is a no-op.
        guard.disarm();
        assert!(!guard.is_armed());
    }

    #[test]
    fn test_guard_flag_is_shared() {
        let guard = RecoveryGuard::arm("test-fault");
        let flag = guard.flag();
        assert!(flag.load(Ordering::SeqCst));
        guard.disarm();
        assert!(!flag.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let handle = ShutdownHandle::new();
        let mut rx = handle.subscribe();
        assert!(!handle.is_requested());

        handle.request_shutdown();
        handle.request_shutdown();
        handle.request_shutdown();

        assert!(handle.is_requested());
        // Only the first request broadcasts.
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_shutdown_wakes_subscribers() {
        let handle = ShutdownHandle::new();
        let mut rx = handle.subscribe();
        let waiter = tokio::spawn(async move { rx.recv().await.is_ok() });
        handle.request_shutdown();
        assert!(waiter.await.unwrap());
    }
}
