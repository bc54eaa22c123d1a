//! Session bookkeeping: the "is a session active" flag and the teardown stack.

use crate::error::{VpnError, VpnResult};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// Whether a tunnel session is active. One instance is shared by everything
/// that starts or stops sessions in a process.
#[derive(Debug, Default)]
pub struct SessionState {
    active: AtomicBool,
}

impl SessionState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Mark a session active. The returned guard ends it on drop.
    pub fn try_begin(self: &Arc<Self>) -> VpnResult<SessionGuard> {
        self.active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| VpnError::AlreadyConnected)?;
        Ok(SessionGuard {
            state: Arc::clone(self),
        })
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    fn end(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Ends the session when dropped.
#[derive(Debug)]
pub struct SessionGuard {
    state: Arc<SessionState>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        self.state.end();
    }
}

type Cleanup = Box<dyn FnOnce() -> BoxFuture<'static, VpnResult<()>> + Send>;

/// Teardown callbacks, run newest first.
#[derive(Default)]
pub struct CleanupStack {
    tasks: Mutex<Vec<(String, Cleanup)>>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<F, Fut>(&self, name: impl Into<String>, f: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = VpnResult<()>> + Send + 'static,
    {
        let task: Cleanup = Box::new(move || f().boxed());
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push((name.into(), task));
        }
    }

    pub fn len(&self) -> usize {
        self.tasks.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every callback. Failures are logged and do not stop the rest.
    /// Returns how many failed.
    pub async fn run_all(&self) -> usize {
        let mut failed = 0;
        loop {
            let next = match self.tasks.lock() {
                Ok(mut tasks) => tasks.pop(),
                Err(_) => None,
            };
            let Some((name, task)) = next else { break };
            log::debug!("cleanup: {}", name);
            if let Err(e) = task().await {
                log::warn!("cleanup {} failed: {}", name, e);
                failed += 1;
            }
        }
        failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_active_session() {
        let state = SessionState::new();
        let guard = state.try_begin().unwrap();
        assert!(state.is_active());
        assert!(matches!(state.try_begin(), Err(VpnError::AlreadyConnected)));
        drop(guard);
        assert!(!state.is_active());
        let _again = state.try_begin().unwrap();
    }

    #[tokio::test]
    async fn test_cleanup_runs_lifo_and_tolerates_failures() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let stack = CleanupStack::new();
        for i in 0..3 {
            let order = order.clone();
            stack.push(format!("step {}", i), move || async move {
                order.lock().unwrap().push(i);
                if i == 1 {
                    Err(VpnError::ConnectionLost("boom".into()))
                } else {
                    Ok(())
                }
            });
        }
        assert_eq!(stack.len(), 3);
        assert_eq!(stack.run_all().await, 1);
        assert_eq!(*order.lock().unwrap(), vec![2, 1, 0]);
        assert!(stack.is_empty());
        assert_eq!(stack.run_all().await, 0);
    }
}
