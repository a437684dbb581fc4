// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.

use std::collections::VecDeque;

use crate::compaction::partition::PartitionIdentifier;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordState {
    Running,
    Succeeded,
    Failed,
}

/// Immutable snapshot of one compaction attempt, kept for operators.
/// Timestamps are unix millis; zero means the stage was never reached.
#[derive(Clone, Debug)]
pub struct CompactionRecord {
    pub partition: PartitionIdentifier,
    pub txn_id: i64,
    pub start_ms: i64,
    pub commit_ms: i64,
    pub finish_ms: i64,
    pub tablet_count: usize,
    pub state: RecordState,
    pub fail_reason: Option<String>,
}

/// Bounded FIFO of records, oldest evicted first. Capacity follows the
/// config snapshot of each scheduler cycle and may shrink at runtime.
#[derive(Debug, Default)]
pub struct HistoryRing {
    capacity: usize,
    records: VecDeque<CompactionRecord>,
}

impl HistoryRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            records: VecDeque::new(),
        }
    }

    pub fn push(&mut self, record: CompactionRecord) {
        if self.capacity == 0 {
            return;
        }
        while self.records.len() >= self.capacity {
            self.records.pop_front();
        }
        self.records.push_back(record);
    }

    pub fn resize(&mut self, capacity: usize) {
        self.capacity = capacity;
        while self.records.len() > capacity {
            self.records.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Oldest first.
    pub fn records(&self) -> impl Iterator<Item = &CompactionRecord> {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(txn_id: i64) -> CompactionRecord {
        CompactionRecord {
            partition: PartitionIdentifier::new(1, 2, 3),
            txn_id,
            start_ms: txn_id * 10,
            commit_ms: 0,
            finish_ms: 0,
            tablet_count: 1,
            state: RecordState::Succeeded,
            fail_reason: None,
        }
    }

    #[test]
    fn push_evicts_oldest_at_capacity() {
        let mut ring = HistoryRing::new(2);
        ring.push(record(1));
        ring.push(record(2));
        ring.push(record(3));
        let txns: Vec<i64> = ring.records().map(|r| r.txn_id).collect();
        assert_eq!(txns, vec![2, 3]);
    }

    #[test]
    fn shrinking_resize_trims_oldest() {
        let mut ring = HistoryRing::new(4);
        for txn_id in 1..=4 {
            ring.push(record(txn_id));
        }
        ring.resize(2);
        let txns: Vec<i64> = ring.records().map(|r| r.txn_id).collect();
        assert_eq!(txns, vec![3, 4]);
        ring.resize(0);
        ring.push(record(9));
        assert!(ring.is_empty());
    }
}
