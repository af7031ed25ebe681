//! Piggyback dissemination queue.
//!
//! Every accepted membership change is queued here and attached to
//! outgoing probe traffic. Each queued entry counts how many times it has
//! been sent; once the count reaches the transmit limit the entry is
//! retired.

use hive_core::NodeId;
use hive_wire::codec::entry_len;
use hive_wire::GossipEntry;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct Queued {
    entry: GossipEntry,
    transmits: u32,
    /// Insertion order, higher is newer
    order: u64,
}

/// Infection-counter queue of pending gossip
#[derive(Debug, Clone)]
pub struct BroadcastQueue {
    max_transmits: u32,
    queued: HashMap<NodeId, Queued>,
    next_order: u64,
}

impl BroadcastQueue {
    /// Create a queue retiring entries after `max_transmits` sends
    #[must_use]
    pub fn new(max_transmits: u32) -> Self {
        Self {
            max_transmits: max_transmits.max(1),
            queued: HashMap::new(),
            next_order: 0,
        }
    }

    /// Queue an entry, replacing any pending entry for the same node
    ///
    /// A pending entry that supersedes `entry` (higher incarnation, or the
    /// same one with a more severe state) is kept and `false` returned.
    pub fn push(&mut self, entry: GossipEntry) -> bool {
        if let Some(pending) = self.queued.get(&entry.node_id) {
            let held = (pending.entry.incarnation, pending.entry.state);
            if held > (entry.incarnation, entry.state) {
                return false;
            }
        }
        let order = self.next_order;
        self.next_order += 1;
        self.queued.insert(
            entry.node_id.clone(),
            Queued {
                entry,
                transmits: 0,
                order,
            },
        );
        true
    }

    /// Drop the pending entry for a node
    pub fn invalidate(&mut self, id: &NodeId) -> bool {
        self.queued.remove(id).is_some()
    }

    /// Number of pending entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.queued.len()
    }

    /// Whether nothing is pending
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queued.is_empty()
    }

    /// Take up to `max_entries` entries whose encoded size fits `byte_budget`
    ///
    /// Least-sent entries go first, newest first among equals. Selected
    /// entries have their counters bumped; entries that reach the limit are
    /// retired.
    pub fn select(&mut self, max_entries: usize, byte_budget: usize) -> Vec<GossipEntry> {
        let mut candidates: Vec<&Queued> = self.queued.values().collect();
        candidates.sort_by(|a, b| {
            a.transmits
                .cmp(&b.transmits)
                .then_with(|| b.order.cmp(&a.order))
        });

        let mut used = 0usize;
        let mut picked = Vec::new();
        for queued in candidates {
            if picked.len() >= max_entries {
                break;
            }
            let size = entry_len(&queued.entry);
            if used.saturating_add(size) > byte_budget {
                continue;
            }
            used += size;
            picked.push(queued.entry.clone());
        }

        for entry in &picked {
            let retire = match self.queued.get_mut(&entry.node_id) {
                Some(queued) => {
                    queued.transmits += 1;
                    queued.transmits >= self.max_transmits
                }
                None => false,
            };
            if retire {
                self.queued.remove(&entry.node_id);
            }
        }
        picked
    }
}
