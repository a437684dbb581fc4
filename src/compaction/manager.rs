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

use std::collections::{BTreeMap, HashSet};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::compaction::partition::PartitionIdentifier;

struct ManagerInner {
    /// Candidate partition -> last reported compaction score.
    candidates: BTreeMap<PartitionIdentifier, f64>,
    cooldown_until: BTreeMap<PartitionIdentifier, Instant>,
}

/// Tracks partitions eligible for compaction and their cooldowns. Write
/// paths register partitions with a score after each publish; the
/// scheduler pulls candidates from here every cycle.
pub struct CompactionManager {
    inner: Mutex<ManagerInner>,
}

impl Default for CompactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CompactionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ManagerInner {
                candidates: BTreeMap::new(),
                cooldown_until: BTreeMap::new(),
            }),
        }
    }

    /// Register or refresh a candidate with the score from its latest
    /// publish. Keeps the highest score seen since the last compaction.
    pub fn update_partition(&self, partition: PartitionIdentifier, score: f64) {
        let mut inner = self.lock_inner();
        let entry = inner.candidates.entry(partition).or_insert(0.0);
        *entry = entry.max(score);
    }

    pub fn remove_partition(&self, partition: &PartitionIdentifier) {
        let mut inner = self.lock_inner();
        inner.candidates.remove(partition);
        inner.cooldown_until.remove(partition);
        tracing::info!(
            target: "lakemeta::compaction",
            partition = %partition,
            "COMPACTION removed partition from candidate set"
        );
    }

    pub fn all_partitions(&self) -> Vec<PartitionIdentifier> {
        self.lock_inner().candidates.keys().copied().collect()
    }

    /// Hold a partition back until `delay` elapses, after a success
    /// (short) or a failure (longer).
    pub fn enable_compaction_after(&self, partition: PartitionIdentifier, delay: Duration) {
        self.lock_inner()
            .cooldown_until
            .insert(partition, Instant::now() + delay);
    }

    /// Candidates ready to compact now: not excluded (already running),
    /// not cooling down, best score first.
    pub fn choose_partitions_to_compact(
        &self,
        exclude: &HashSet<PartitionIdentifier>,
    ) -> Vec<PartitionIdentifier> {
        let now = Instant::now();
        let inner = self.lock_inner();
        let mut ready: Vec<(PartitionIdentifier, f64)> = inner
            .candidates
            .iter()
            .filter(|(partition, _)| !exclude.contains(partition))
            .filter(|(partition, _)| {
                inner
                    .cooldown_until
                    .get(partition)
                    .is_none_or(|until| *until <= now)
            })
            .map(|(partition, score)| (*partition, *score))
            .collect();
        ready.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ready.into_iter().map(|(partition, _)| partition).collect()
    }

    fn lock_inner(&self) -> std::sync::MutexGuard<'_, ManagerInner> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
