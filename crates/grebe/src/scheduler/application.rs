use std::sync::Arc;

use parking_lot::Mutex;

use crate::AllocationKey;
use crate::cache::application::ApplicationInfo;
use crate::common::Map;
use crate::common::resources::Resource;
use crate::messages::AllocationAsk;

/// Scheduler-side view of one application: the cached application plus its
/// outstanding asks.
#[derive(Debug)]
pub struct SchedulingApplication {
    pub app: Arc<ApplicationInfo>,
    asks: Mutex<AskRepository>,
}

#[derive(Debug, Default)]
struct AskRepository {
    asks: Map<AllocationKey, AllocationAsk>,
    /// Sum over all asks of resource-per-ask times pending count.
    pending_total: Resource,
}

impl SchedulingApplication {
    pub fn new(app: Arc<ApplicationInfo>) -> SchedulingApplication {
        SchedulingApplication {
            app,
            asks: Mutex::new(AskRepository::default()),
        }
    }

    /// Insert or replace an ask; replacing first retracts the pending total
    /// of the previous version.
    pub fn add_ask(&self, ask: AllocationAsk) {
        let mut repo = self.asks.lock();
        if let Some(previous) = repo.asks.remove(&ask.allocation_key) {
            let retracted = ask_total(&previous);
            repo.pending_total.sub(&retracted);
        }
        let added = ask_total(&ask);
        repo.pending_total.add(&added);
        repo.asks.insert(ask.allocation_key.clone(), ask);
    }

    pub fn remove_ask(&self, allocation_key: &str) -> Option<AllocationAsk> {
        let mut repo = self.asks.lock();
        let ask = repo.asks.remove(allocation_key)?;
        let retracted = ask_total(&ask);
        repo.pending_total.sub(&retracted);
        debug_assert!(!repo.pending_total.has_negative());
        Some(ask)
    }

    pub fn remove_all_asks(&self) {
        let mut repo = self.asks.lock();
        repo.asks.clear();
        repo.pending_total = Resource::new();
    }

    pub fn get_ask(&self, allocation_key: &str) -> Option<AllocationAsk> {
        self.asks.lock().asks.get(allocation_key).cloned()
    }

    pub fn ask_count(&self) -> usize {
        self.asks.lock().asks.len()
    }

    pub fn pending_resource(&self) -> Resource {
        self.asks.lock().pending_total.clone()
    }
}

fn ask_total(ask: &AllocationAsk) -> Resource {
    ask.resource_per_ask.multiply(ask.pending_ask_count.max(0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::resources::MEMORY;

    fn app() -> Arc<ApplicationInfo> {
        Arc::new(ApplicationInfo::new("app1", "[rm1]default", "root.default"))
    }

    fn ask(key: &str, memory: i64, count: i32) -> AllocationAsk {
        AllocationAsk {
            allocation_key: key.to_string(),
            application_id: "app1".to_string(),
            partition_name: "[rm1]default".to_string(),
            queue_name: "root.default".to_string(),
            resource_per_ask: Resource::from_pairs([(MEMORY, memory)]),
            pending_ask_count: count,
        }
    }

    #[test]
    fn pending_total_tracks_asks() {
        let app = SchedulingApplication::new(app());
        app.add_ask(ask("a", 100, 2));
        app.add_ask(ask("b", 50, 1));
        assert_eq!(app.pending_resource().get(MEMORY), 250);
        assert_eq!(app.ask_count(), 2);

        // Replacing an ask retracts its previous total.
        app.add_ask(ask("a", 100, 1));
        assert_eq!(app.pending_resource().get(MEMORY), 150);

        app.remove_ask("b");
        assert_eq!(app.pending_resource().get(MEMORY), 100);
        assert!(app.remove_ask("b").is_none());

        app.remove_all_asks();
        assert!(app.pending_resource().is_zero());
        assert_eq!(app.ask_count(), 0);
    }
}
