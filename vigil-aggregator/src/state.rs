use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::Arc;

pub type Shared<T> = Arc<Mutex<T>>;

pub fn new_state<T>(value: T) -> Shared<T> {
    Arc::new(Mutex::new(value))
}

/// In-memory index of the identities currently online. Durable records are
/// never removed; only this index shrinks on disconnect.
#[derive(Clone, Default)]
pub struct ActiveIndex {
    ids: Shared<BTreeSet<String>>,
}

impl ActiveIndex {
    pub fn new() -> Self {
        Self { ids: new_state(BTreeSet::new()) }
    }

    pub fn insert(&self, agent_id: &str) -> bool {
        self.ids.lock().insert(agent_id.to_string())
    }

    pub fn remove(&self, agent_id: &str) -> bool {
        self.ids.lock().remove(agent_id)
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.ids.lock().contains(agent_id)
    }

    pub fn len(&self) -> usize {
        self.ids.lock().len()
    }

    /// Sorted snapshot
    pub fn list(&self) -> Vec<String> {
        self.ids.lock().iter().cloned().collect()
    }
}
