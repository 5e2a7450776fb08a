use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

/// In-process counters and gauges maintained by the cache handlers.
///
/// Emission to an external metrics system is out of scope; these exist so the
/// admission and node paths can account for what they did.
#[derive(Debug, Default)]
pub struct CoreMetrics {
    applications_added: AtomicU64,
    applications_rejected: AtomicU64,
    applications_running: AtomicI64,
    applications_completed: AtomicU64,
    active_nodes: AtomicI64,
    failed_nodes: AtomicU64,
    scheduled_allocations: AtomicU64,
}

impl CoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_applications_added(&self) {
        self.applications_added.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_applications_rejected(&self) {
        self.applications_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_applications_running(&self) {
        self.applications_running.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sub_applications_running(&self, count: usize) {
        self.applications_running
            .fetch_sub(count as i64, Ordering::Relaxed);
    }

    pub fn add_applications_completed(&self, count: usize) {
        self.applications_completed
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_active_nodes(&self) {
        self.active_nodes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_active_nodes(&self) {
        self.active_nodes.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn add_failed_nodes(&self, count: usize) {
        self.failed_nodes.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn inc_scheduled_allocations(&self) {
        self.scheduled_allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn applications_added(&self) -> u64 {
        self.applications_added.load(Ordering::Relaxed)
    }

    pub fn applications_rejected(&self) -> u64 {
        self.applications_rejected.load(Ordering::Relaxed)
    }

    pub fn applications_running(&self) -> i64 {
        self.applications_running.load(Ordering::Relaxed)
    }

    pub fn applications_completed(&self) -> u64 {
        self.applications_completed.load(Ordering::Relaxed)
    }

    pub fn active_nodes(&self) -> i64 {
        self.active_nodes.load(Ordering::Relaxed)
    }

    pub fn failed_nodes(&self) -> u64 {
        self.failed_nodes.load(Ordering::Relaxed)
    }

    pub fn scheduled_allocations(&self) -> u64 {
        self.scheduled_allocations.load(Ordering::Relaxed)
    }
}
