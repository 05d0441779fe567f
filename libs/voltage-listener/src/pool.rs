//! Worker pool for the listener's background tasks
//!
//! A tracked set of tokio tasks sharing one shutdown token. Task failures go to
//! the exception handler; they never take the pool down.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use crate::error::{ExceptionHandler, ListenerError, Result};

pub struct WorkerPool {
    tracker: TaskTracker,
    shutdown: CancellationToken,
    runtime: Handle,
    exception_handler: Arc<dyn ExceptionHandler>,
}

impl WorkerPool {
    /// Pool on the caller's runtime
    pub fn new(exception_handler: Arc<dyn ExceptionHandler>) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| ListenerError::init(format!("No async runtime available: {}", e)))?;

        Ok(Self {
            tracker: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            runtime,
            exception_handler,
        })
    }

    /// Schedule a task; errors it returns are routed to the exception handler
    pub fn execute<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.tracker.is_closed() {
            return Err(ListenerError::init("Worker pool is shut down"));
        }

        let exception_handler = Arc::clone(&self.exception_handler);
        self.tracker.spawn_on(
            async move {
                if let Err(e) = task.await {
                    exception_handler.received_exception(&e);
                }
            },
            &self.runtime,
        );
        Ok(())
    }

    /// Token cancelled when the pool shuts down
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Cancel all tasks and wait up to `drain` for them to finish
    pub async fn shutdown(&self, drain: Duration) -> Result<()> {
        self.shutdown.cancel();
        self.tracker.close();

        match tokio::time::timeout(drain, self.tracker.wait()).await {
            Ok(()) => {
                debug!("Worker pool drained");
                Ok(())
            },
            Err(_) => Err(ListenerError::DrainTimeout(drain)),
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CollectingHandler {
        errors: Mutex<Vec<ListenerError>>,
    }

    impl ExceptionHandler for CollectingHandler {
        fn received_exception(&self, error: &ListenerError) {
            self.errors.lock().push(error.clone());
        }
    }

    #[test]
    fn test_requires_runtime() {
        let err = WorkerPool::new(Arc::new(CollectingHandler::default())).err().unwrap();
        assert!(matches!(err, ListenerError::Init(_)));
    }

    #[tokio::test]
    async fn test_task_errors_reach_handler() {
        let handler = Arc::new(CollectingHandler::default());
        let pool = WorkerPool::new(handler.clone()).unwrap();

        pool.execute(async { Err(ListenerError::init("bind failed")) }).unwrap();
        pool.shutdown(Duration::from_millis(300)).await.unwrap();

        assert_eq!(*handler.errors.lock(), vec![ListenerError::init("bind failed")]);
    }

    #[tokio::test]
    async fn test_shutdown_cancels_cooperative_tasks() {
        let pool = WorkerPool::new(Arc::new(CollectingHandler::default())).unwrap();
        let token = pool.shutdown_token();
        pool.execute(async move {
            token.cancelled().await;
            Ok(())
        })
        .unwrap();
        assert_eq!(pool.active_tasks(), 1);

        pool.shutdown(Duration::from_millis(300)).await.unwrap();
        assert_eq!(pool.active_tasks(), 0);
        assert!(pool.execute(async { Ok(()) }).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_timeout() {
        let pool = WorkerPool::new(Arc::new(CollectingHandler::default())).unwrap();
        pool.execute(async {
            tokio::time::sleep(Duration::from_secs(10)).await;
            Ok(())
        })
        .unwrap();

        let err = pool.shutdown(Duration::from_millis(300)).await.unwrap_err();
        assert_eq!(err, ListenerError::DrainTimeout(Duration::from_millis(300)));
    }
}
