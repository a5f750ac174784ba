//! Accumulated single-item calls sharing one batch key.

use serde_json::Value;

use batchrpc_core::request::{BatchKey, ItemId};

use crate::handle::Responder;

/// Items waiting to be flushed as one backend call.
///
/// Holds at most `max_batch_size` items, in enqueue order.
pub(crate) struct PendingGroup {
    key: BatchKey,
    params: Value,
    max_batch_size: usize,
    generation: u64,
    items: Vec<(ItemId, Responder)>,
}

impl PendingGroup {
    pub(crate) fn new(key: BatchKey, params: Value, max_batch_size: usize, generation: u64) -> Self {
        Self {
            key,
            params,
            max_batch_size: max_batch_size.max(1),
            generation,
            items: Vec::new(),
        }
    }

    /// Append an item. Returns `true` once the group has reached capacity
    /// and must be sealed.
    pub(crate) fn push(&mut self, id: ItemId, responder: Responder) -> bool {
        debug_assert!(!self.is_full(), "push into a sealed group");
        self.items.push((id, responder));
        self.is_full()
    }

    pub(crate) fn is_full(&self) -> bool {
        self.items.len() >= self.max_batch_size
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn key(&self) -> &BatchKey {
        &self.key
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn into_parts(self) -> (BatchKey, Value, Vec<(ItemId, Responder)>) {
        (self.key, self.params, self.items)
    }
}

impl std::fmt::Debug for PendingGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingGroup")
            .field("key", &self.key)
            .field("items", &self.items.len())
            .field("max_batch_size", &self.max_batch_size)
            .field("generation", &self.generation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handle::channel;

    #[test]
    fn seals_at_capacity() {
        let mut group = PendingGroup::new(BatchKey::new("greetings", "get"), Value::Null, 2, 0);
        let (r1, _h1) = channel(None);
        let (r2, _h2) = channel(None);
        assert!(!group.push(1.into(), r1));
        assert!(group.push(2.into(), r2));
        assert_eq!(group.len(), 2);
    }

    #[test]
    fn keeps_enqueue_order() {
        let mut group = PendingGroup::new(BatchKey::new("greetings", "get"), Value::Null, 10, 0);
        let mut handles = Vec::new();
        for id in [3i64, 1, 3] {
            let (r, h) = channel(None);
            handles.push(h);
            group.push(id.into(), r);
        }
        let (_, _, items) = group.into_parts();
        let ids: Vec<ItemId> = items.into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![3.into(), 1.into(), 3.into()]);
    }

    #[test]
    fn zero_capacity_is_treated_as_one() {
        let mut group = PendingGroup::new(BatchKey::new("greetings", "get"), Value::Null, 0, 0);
        let (r, _h) = channel(None);
        assert!(group.push(1.into(), r));
    }
}
