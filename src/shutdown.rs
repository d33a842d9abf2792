//! Cooperative shutdown shared by the relay loop, signal handler and
//! registration completions

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::{error, info};

#[derive(Debug, Default)]
struct Flags {
    stop: AtomicBool,
    failed: AtomicBool,
    wake: Notify,
}

/// Cloneable stop/failure flags with a wakeup for sleeping tasks
#[derive(Debug, Clone, Default)]
pub struct ShutdownContext {
    inner: Arc<Flags>,
}

impl ShutdownContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the loop to exit after its current iteration
    pub fn request_stop(&self) {
        self.inner.stop.store(true, Ordering::SeqCst);
        self.inner.wake.notify_waiters();
    }

    /// Record an out-of-band failure and stop
    pub fn fail(&self, reason: &str) {
        error!("{reason}");
        self.inner.failed.store(true, Ordering::SeqCst);
        self.request_stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop.load(Ordering::SeqCst)
    }

    pub fn has_failed(&self) -> bool {
        self.inner.failed.load(Ordering::SeqCst)
    }

    /// Resolve once a stop has been requested
    pub async fn stopped(&self) {
        loop {
            let notified = self.inner.wake.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    /// Route SIGINT, SIGTERM and SIGHUP to [`request_stop`](Self::request_stop)
    pub fn install_signal_handler(&self) -> Result<(), ctrlc::Error> {
        let ctx = self.clone();
        ctrlc::set_handler(move || {
            info!("Stop requested");
            ctx.request_stop();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_flags() {
        let ctx = ShutdownContext::new();
        assert!(!ctx.is_stopped());
        assert!(!ctx.has_failed());

        let clone = ctx.clone();
        clone.request_stop();
        assert!(ctx.is_stopped());
        assert!(!ctx.has_failed());

        let ctx = ShutdownContext::new();
        ctx.clone().fail("registration rejected");
        assert!(ctx.is_stopped());
        assert!(ctx.has_failed());
    }

    #[tokio::test]
    async fn test_stopped_wakes_waiter() {
        let ctx = ShutdownContext::new();
        let waiter = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.stopped().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        ctx.request_stop();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stopped_after_stop_returns_immediately() {
        let ctx = ShutdownContext::new();
        ctx.request_stop();
        tokio::time::timeout(Duration::from_millis(100), ctx.stopped())
            .await
            .unwrap();
    }
}
