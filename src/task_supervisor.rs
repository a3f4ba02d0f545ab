use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

#[derive(Debug, Default)]
struct SupervisorState {
    running: AtomicU64,
    stop: CancellationToken,
    stopped: CancellationToken,
}

/// Tracks the send/recv/accept loops of a session or server so shutdown can
/// wait for all of them to wind down.
#[derive(Debug)]
pub struct TaskSupervisor(Arc<SupervisorState>);

/// RAII guard for one supervised task; dropping it decrements the running
/// count and signals completion when it was the last one.
#[derive(Debug)]
pub struct TaskGuard(Arc<SupervisorState>);

/// Cloneable handle for starting supervised tasks from inside another task,
/// e.g. an accept loop spawning one task per connection.
#[derive(Debug, Clone)]
pub struct SupervisorHandle(Arc<SupervisorState>);

impl SupervisorHandle {
    #[must_use]
    pub fn start_task(&self) -> TaskGuard {
        self.0.running.fetch_add(1, Ordering::AcqRel);
        TaskGuard(self.0.clone())
    }
}

impl TaskSupervisor {
    #[must_use]
    pub fn create() -> Self {
        let supervisor = Self(Arc::default());

        // A sentinel task pinning the running count above zero until stop.
        let guard = supervisor.start_task();
        tokio::spawn(async move {
            guard.stopped().await;
        });

        supervisor
    }

    /// Requests every supervised task to stop.
    pub fn stop(&self) {
        self.0.stop.cancel();
    }

    /// Resolves once `stop` has been requested.
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }

    /// Resolves once every supervised task has finished.
    pub fn all_stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stopped.cancelled()
    }

    #[must_use]
    pub fn start_task(&self) -> TaskGuard {
        self.handle().start_task()
    }

    #[must_use]
    pub fn handle(&self) -> SupervisorHandle {
        SupervisorHandle(self.0.clone())
    }
}

impl Drop for TaskSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

impl TaskGuard {
    pub fn stopped(&self) -> WaitForCancellationFuture<'_> {
        self.0.stop.cancelled()
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        let running = self.0.running.fetch_sub(1, Ordering::AcqRel) - 1;
        if running == 0 {
            self.0.stopped.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_task_supervisor() {
        let supervisor = TaskSupervisor::create();
        assert_eq!(supervisor.0.running.load(Ordering::Acquire), 1);

        supervisor.stop();
        supervisor.stopped().await;
        supervisor.all_stopped().await;
        assert_eq!(supervisor.0.running.load(Ordering::Acquire), 0);
    }
}
