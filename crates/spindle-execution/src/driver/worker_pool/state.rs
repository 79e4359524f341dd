use tokio::time::Instant;

use crate::driver::coordinator::Coordinator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum WorkerState {
    Running,
    /// The worker is stopping and is no longer assigned any request.
    Draining,
}

pub(super) struct WorkerDescriptor {
    pub state: WorkerState,
    pub coordinator: Coordinator,
    /// The last time a request was assigned to or completed by the worker.
    pub updated_at: Instant,
}

impl WorkerDescriptor {
    pub fn new(coordinator: Coordinator) -> Self {
        Self {
            state: WorkerState::Running,
            coordinator,
            updated_at: Instant::now(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == WorkerState::Running
    }

    pub fn is_idle(&self) -> bool {
        self.is_running() && self.coordinator.running() == 0
    }

    pub fn touch(&mut self) {
        self.updated_at = Instant::now();
    }
}
