//! Run-wide synchronization: termination, worker slots and load phases

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info};

/// Terminate flag shared by the scheduler and its runners
#[derive(Clone)]
pub struct RunSignals {
    terminate: Arc<watch::Sender<bool>>,
}

impl Default for RunSignals {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSignals {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            terminate: Arc::new(tx),
        }
    }

    /// Raise the flag. Returns true for the call that raised it.
    pub fn terminate(&self) -> bool {
        self.terminate.send_if_modified(|flag| {
            if *flag {
                false
            } else {
                *flag = true;
                true
            }
        })
    }

    pub fn is_terminated(&self) -> bool {
        *self.terminate.borrow()
    }

    /// Resolves once the flag is raised
    pub async fn terminated(&self) {
        let mut rx = self.terminate.subscribe();
        let _ = rx.wait_for(|flag| *flag).await;
    }

    /// Sleep until `deadline`. Returns false if terminated first.
    pub async fn sleep_until(&self, deadline: Instant) -> bool {
        if self.is_terminated() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep_until(deadline.into()) => true,
            _ = self.terminated() => false,
        }
    }
}

/// Bounds how many tuples hold sessions at once
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a slot. None once the run is terminated or the pool shut down.
    pub async fn acquire(&self, signals: &RunSignals) -> Option<OwnedSemaphorePermit> {
        if signals.is_terminated() {
            return None;
        }
        tokio::select! {
            biased;
            _ = signals.terminated() => None,
            permit = self.semaphore.clone().acquire_owned() => permit.ok(),
        }
    }

    /// Refuse all further admissions
    pub fn shutdown(&self) {
        self.semaphore.close();
    }
}

/// Phase barriers for load tests.
///
/// Every runner arrives once it has finished ramp-up (or failed), which
/// releases the load-reached barrier when all have arrived. Runners then
/// report steady-state completion and hold their sessions until the
/// scheduler raises `done`.
pub struct LoadCoordinator {
    total: usize,
    arrived: AtomicUsize,
    completed: AtomicUsize,
    load_reached: watch::Sender<bool>,
    all_completed: watch::Sender<bool>,
    done: watch::Sender<bool>,
}

impl LoadCoordinator {
    pub fn new(total: usize) -> Arc<Self> {
        let flag = |initial| watch::channel(initial).0;
        Arc::new(Self {
            total,
            arrived: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            load_reached: flag(total == 0),
            all_completed: flag(total == 0),
            done: flag(false),
        })
    }

    pub fn ticket(self: &Arc<Self>) -> PhaseTicket {
        PhaseTicket {
            coordinator: Arc::clone(self),
            arrived: false,
            completed: false,
        }
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn arrived(&self) -> usize {
        self.arrived.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn is_load_reached(&self) -> bool {
        *self.load_reached.borrow()
    }

    fn arrive(&self) {
        let arrived = self.arrived.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("{}/{} runner(s) at load", arrived, self.total);
        if arrived == self.total {
            info!("Load reached with {} runner(s)", self.total);
            self.load_reached.send_replace(true);
        }
    }

    fn complete(&self) {
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if completed == self.total {
            info!("All {} runner(s) finished steady state", self.total);
            self.all_completed.send_replace(true);
        }
    }

    async fn wait(flag: &watch::Sender<bool>, signals: &RunSignals) -> bool {
        let mut rx = flag.subscribe();
        tokio::select! {
            biased;
            reached = rx.wait_for(|v| *v) => reached.is_ok(),
            _ = signals.terminated() => *flag.borrow(),
        }
    }

    /// Block until every runner has arrived. False if terminated first.
    pub async fn wait_load_reached(&self, signals: &RunSignals) -> bool {
        Self::wait(&self.load_reached, signals).await
    }

    /// Block until every runner has finished steady state
    pub async fn wait_all_completed(&self) {
        let mut rx = self.all_completed.subscribe();
        let _ = rx.wait_for(|v| *v).await;
    }

    /// Let runners release their sessions
    pub fn raise_done(&self) {
        self.done.send_replace(true);
    }

    pub async fn wait_done(&self, signals: &RunSignals) -> bool {
        Self::wait(&self.done, signals).await
    }
}

/// One runner's obligations to the load barriers.
///
/// Arrival and completion are counted once each; dropping an unsettled
/// ticket counts both so that no other runner waits on it forever.
pub struct PhaseTicket {
    coordinator: Arc<LoadCoordinator>,
    arrived: bool,
    completed: bool,
}

impl PhaseTicket {
    pub fn arrive(&mut self) {
        if !self.arrived {
            self.arrived = true;
            self.coordinator.arrive();
        }
    }

    pub fn complete(&mut self) {
        self.arrive();
        if !self.completed {
            self.completed = true;
            self.coordinator.complete();
        }
    }

    pub fn settle(&mut self) {
        self.complete();
    }

    pub fn coordinator(&self) -> &LoadCoordinator {
        &self.coordinator
    }
}

impl Drop for PhaseTicket {
    fn drop(&mut self) {
        self.settle();
    }
}
