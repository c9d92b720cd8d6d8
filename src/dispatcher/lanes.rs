//! Per-(trigger, partition key) execution lanes.
//!
//! A lane holds the executions of one stateful trigger for one key in entry
//! sequence order. Only the head may run; it stays the head through its
//! retries and the lane advances only when it is terminal.

use std::collections::{HashMap, VecDeque};

use crate::entry::PartitionKey;
use crate::execution::ExecutionKey;

type LaneId = (String, PartitionKey);

#[derive(Debug, Default)]
pub(crate) struct Lanes {
    lanes: HashMap<LaneId, VecDeque<ExecutionKey>>,
}

impl Lanes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `key`; returns true if it is now the head and may run.
    pub fn push(&mut self, partition: &PartitionKey, key: ExecutionKey) -> bool {
        let lane = self
            .lanes
            .entry((key.trigger.clone(), partition.clone()))
            .or_default();
        lane.push_back(key);
        lane.len() == 1
    }

    /// Removes `key` from its lane.
    ///
    /// Returns the new head if `key` was the head and another execution
    /// is waiting.
    pub fn remove(&mut self, partition: &PartitionKey, key: &ExecutionKey) -> Option<ExecutionKey> {
        let id = (key.trigger.clone(), partition.clone());
        let lane = self.lanes.get_mut(&id)?;
        let pos = lane.iter().position(|k| k == key)?;
        lane.remove(pos);
        let next = if pos == 0 { lane.front().cloned() } else { None };
        if lane.is_empty() {
            self.lanes.remove(&id);
        }
        next
    }

    #[cfg(test)]
    pub fn is_head(&self, partition: &PartitionKey, key: &ExecutionKey) -> bool {
        self.lanes
            .get(&(key.trigger.clone(), partition.clone()))
            .and_then(VecDeque::front)
            .is_some_and(|head| head == key)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.lanes.len()
    }

    pub fn clear(&mut self) {
        self.lanes.clear();
    }
}
