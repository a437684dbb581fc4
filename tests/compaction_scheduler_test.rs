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
//! Scheduler loop tests with in-process fakes for the transaction
//! manager, worker client, and partition directory.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use lakemeta::common::config::{CompactionConfig, SharedCompactionConfig};
use lakemeta::common::error::Result;
use lakemeta::compaction::remote::{
    CompactResponse, PartitionDirectory, PartitionSnapshot, PartitionState, TabletCommitInfo,
    TaskFuture, TransactionManager, VisibleStateWaiter, WorkerClient,
};
use lakemeta::compaction::{
    CompactionManager, CompactionScheduler, PartitionIdentifier, RecordState,
};

#[derive(Default)]
struct FakeTxnManagerState {
    active: HashSet<i64>,
    committed: Vec<(i64, Vec<TabletCommitInfo>)>,
    aborted: Vec<(i64, String)>,
}

struct FakeTxnManager {
    next_txn_id: AtomicI64,
    state: Mutex<FakeTxnManagerState>,
    /// When set, commit makes the txn visible immediately.
    auto_visible: bool,
}

impl FakeTxnManager {
    fn new(first_txn_id: i64, auto_visible: bool) -> Self {
        Self {
            next_txn_id: AtomicI64::new(first_txn_id),
            state: Mutex::new(FakeTxnManagerState::default()),
            auto_visible,
        }
    }

    fn with_active(first_txn_id: i64, active: &[i64]) -> Self {
        let mgr = Self::new(first_txn_id, true);
        mgr.state.lock().unwrap().active.extend(active.iter().copied());
        mgr
    }

    fn committed_txns(&self) -> Vec<i64> {
        self.state.lock().unwrap().committed.iter().map(|(txn, _)| *txn).collect()
    }

    fn aborted_txns(&self) -> Vec<i64> {
        self.state.lock().unwrap().aborted.iter().map(|(txn, _)| *txn).collect()
    }

    fn finish_active(&self, txn_id: i64) {
        self.state.lock().unwrap().active.remove(&txn_id);
    }
}

impl TransactionManager for FakeTxnManager {
    fn begin(&self, _partition: &PartitionIdentifier, _label: &str, _timeout_sec: i64) -> Result<i64> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        self.state.lock().unwrap().active.insert(txn_id);
        Ok(txn_id)
    }

    fn commit(
        &self,
        _partition: &PartitionIdentifier,
        txn_id: i64,
        commit_infos: &[TabletCommitInfo],
    ) -> Result<VisibleStateWaiter> {
        let waiter = VisibleStateWaiter::new();
        let mut state = self.state.lock().unwrap();
        state.active.remove(&txn_id);
        state.committed.push((txn_id, commit_infos.to_vec()));
        if self.auto_visible {
            waiter.notify_visible();
        }
        Ok(waiter)
    }

    fn abort(&self, _partition: &PartitionIdentifier, txn_id: i64, reason: &str) {
        let mut state = self.state.lock().unwrap();
        state.active.remove(&txn_id);
        state.aborted.push((txn_id, reason.to_string()));
    }

    fn min_active_txn_id(&self) -> i64 {
        self.state
            .lock()
            .unwrap()
            .active
            .iter()
            .min()
            .copied()
            .unwrap_or(i64::MAX)
    }

    fn next_txn_id(&self) -> i64 {
        self.next_txn_id.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeWorkerClient {
    dispatched: Mutex<Vec<(i64, Vec<i64>, i64)>>,
    pending: Mutex<Vec<TaskFuture<CompactResponse>>>,
    /// Tablets every response reports as failed.
    fail_tablets: Vec<i64>,
    /// Complete futures immediately on dispatch.
    auto_complete: bool,
}

impl FakeWorkerClient {
    fn auto(fail_tablets: Vec<i64>) -> Self {
        Self {
            fail_tablets,
            auto_complete: true,
            ..Default::default()
        }
    }

    fn manual() -> Self {
        Self::default()
    }

    fn dispatch_count(&self) -> usize {
        self.dispatched.lock().unwrap().len()
    }

    fn complete_all(&self) {
        for future in self.pending.lock().unwrap().drain(..) {
            future.complete(CompactResponse::default());
        }
    }
}

impl WorkerClient for FakeWorkerClient {
    fn compact(
        &self,
        node_id: i64,
        tablet_ids: &[i64],
        _version: i64,
        txn_id: i64,
    ) -> Result<TaskFuture<CompactResponse>> {
        self.dispatched
            .lock()
            .unwrap()
            .push((node_id, tablet_ids.to_vec(), txn_id));
        let future = TaskFuture::new();
        if self.auto_complete {
            future.complete(CompactResponse {
                failed_tablets: self.fail_tablets.clone(),
                error: None,
            });
        } else {
            self.pending.lock().unwrap().push(future.clone());
        }
        Ok(future)
    }
}

struct FakeDirectory {
    partitions: Mutex<HashMap<PartitionIdentifier, Vec<(i64, Vec<i64>)>>>,
    schema_change: Mutex<HashSet<PartitionIdentifier>>,
    alive_nodes: usize,
}

impl FakeDirectory {
    fn new(alive_nodes: usize) -> Self {
        Self {
            partitions: Mutex::new(HashMap::new()),
            schema_change: Mutex::new(HashSet::new()),
            alive_nodes,
        }
    }

    fn add_partition(&self, partition: PartitionIdentifier, node_tablets: &[(i64, Vec<i64>)]) {
        self.partitions
            .lock()
            .unwrap()
            .insert(partition, node_tablets.to_vec());
    }

    fn drop_partition(&self, partition: &PartitionIdentifier) {
        self.partitions.lock().unwrap().remove(partition);
    }
}

impl PartitionDirectory for FakeDirectory {
    fn partition_state(&self, partition: &PartitionIdentifier) -> PartitionState {
        if self.schema_change.lock().unwrap().contains(partition) {
            return PartitionState::SchemaChange;
        }
        match self.partitions.lock().unwrap().get(partition) {
            Some(node_tablets) => PartitionState::Normal(PartitionSnapshot {
                visible_version: 5,
                node_tablets: node_tablets.iter().cloned().collect::<BTreeMap<_, _>>(),
            }),
            None => PartitionState::Missing,
        }
    }

    fn alive_node_count(&self) -> usize {
        self.alive_nodes
    }
}

fn test_config() -> SharedCompactionConfig {
    let cfg = CompactionConfig {
        visibility_poll_timeout_ms: 10,
        // Clean candidates on every cycle so tests need not wait.
        partition_clean_interval_sec: 0,
        ..CompactionConfig::default()
    };
    SharedCompactionConfig::new(cfg)
}

struct Fixture {
    txn_mgr: Arc<FakeTxnManager>,
    worker: Arc<FakeWorkerClient>,
    directory: Arc<FakeDirectory>,
    compaction_mgr: Arc<CompactionManager>,
    config: SharedCompactionConfig,
}

impl Fixture {
    fn scheduler(&self) -> CompactionScheduler {
        CompactionScheduler::new(
            Arc::clone(&self.txn_mgr) as Arc<dyn TransactionManager>,
            Arc::clone(&self.worker) as Arc<dyn WorkerClient>,
            Arc::clone(&self.directory) as Arc<dyn PartitionDirectory>,
            Arc::clone(&self.compaction_mgr),
            self.config.clone(),
        )
    }
}

fn fixture(txn_mgr: FakeTxnManager, worker: FakeWorkerClient) -> Fixture {
    Fixture {
        txn_mgr: Arc::new(txn_mgr),
        worker: Arc::new(worker),
        directory: Arc::new(FakeDirectory::new(3)),
        compaction_mgr: Arc::new(CompactionManager::new()),
        config: test_config(),
    }
}

#[test]
fn successful_job_commits_and_lands_in_history() {
    let fx = fixture(FakeTxnManager::new(100, true), FakeWorkerClient::auto(Vec::new()));
    let p1 = PartitionIdentifier::new(1, 10, 100);
    fx.directory.add_partition(p1, &[(1, vec![11, 12]), (2, vec![13])]);
    fx.compaction_mgr.update_partition(p1, 5.0);

    let mut scheduler = fx.scheduler();
    // Cycle 1: dispatch. Responses complete immediately.
    scheduler.run_one_cycle();
    assert_eq!(scheduler.running_partitions(), vec![p1]);
    assert_eq!(fx.worker.dispatch_count(), 2);

    // Cycle 2: commit and observe visibility.
    scheduler.run_one_cycle();
    assert!(scheduler.running_partitions().is_empty());
    assert_eq!(fx.txn_mgr.committed_txns(), vec![100]);

    let history = scheduler.get_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, RecordState::Succeeded);
    assert_eq!(history[0].tablet_count, 3);
    assert_eq!(history[0].txn_id, 100);

    // Success cooldown keeps the partition out of the next cycles.
    scheduler.run_one_cycle();
    assert!(scheduler.running_partitions().is_empty());
    assert_eq!(fx.worker.dispatch_count(), 2);
}

#[test]
fn failed_tablet_aborts_txn_and_records_failure() {
    let fx = fixture(FakeTxnManager::new(200, true), FakeWorkerClient::auto(vec![11]));
    let p1 = PartitionIdentifier::new(1, 10, 100);
    fx.directory.add_partition(p1, &[(1, vec![11])]);
    fx.compaction_mgr.update_partition(p1, 5.0);

    let mut scheduler = fx.scheduler();
    scheduler.run_one_cycle();
    scheduler.run_one_cycle();

    assert!(scheduler.running_partitions().is_empty());
    assert!(fx.txn_mgr.committed_txns().is_empty());
    assert_eq!(fx.txn_mgr.aborted_txns(), vec![200]);

    let history = scheduler.get_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, RecordState::Failed);
    let reason = history[0].fail_reason.as_deref().unwrap_or("");
    assert!(reason.contains("11"), "unexpected reason: {reason}");

    // Failure cooldown: nothing new is dispatched right away.
    scheduler.run_one_cycle();
    assert_eq!(fx.worker.dispatch_count(), 1);
}

#[test]
fn running_partition_is_not_scheduled_twice() {
    let fx = fixture(FakeTxnManager::new(300, true), FakeWorkerClient::manual());
    let p1 = PartitionIdentifier::new(1, 10, 100);
    fx.directory.add_partition(p1, &[(1, vec![11])]);
    fx.compaction_mgr.update_partition(p1, 5.0);

    let mut scheduler = fx.scheduler();
    scheduler.run_one_cycle();
    assert_eq!(scheduler.running_partitions(), vec![p1]);
    assert_eq!(fx.worker.dispatch_count(), 1);

    // Re-registering while running must not start a second context.
    fx.compaction_mgr.update_partition(p1, 9.0);
    scheduler.run_one_cycle();
    scheduler.run_one_cycle();
    assert_eq!(scheduler.running_partitions(), vec![p1]);
    assert_eq!(fx.worker.dispatch_count(), 1);

    // Worker finishes; the job completes on the following cycles.
    fx.worker.complete_all();
    scheduler.run_one_cycle();
    assert!(scheduler.running_partitions().is_empty());
    assert_eq!(fx.txn_mgr.committed_txns(), vec![300]);
}

#[test]
fn task_ceiling_bounds_concurrent_jobs() {
    let mut cfg = CompactionConfig {
        visibility_poll_timeout_ms: 10,
        partition_clean_interval_sec: 0,
        ..CompactionConfig::default()
    };
    cfg.max_tasks = 2;
    let fx = Fixture {
        txn_mgr: Arc::new(FakeTxnManager::new(400, true)),
        worker: Arc::new(FakeWorkerClient::manual()),
        directory: Arc::new(FakeDirectory::new(3)),
        compaction_mgr: Arc::new(CompactionManager::new()),
        config: SharedCompactionConfig::new(cfg),
    };
    // Three single-tablet partitions but room for only two tasks.
    for i in 0..3 {
        let partition = PartitionIdentifier::new(1, 10, 100 + i);
        fx.directory.add_partition(partition, &[(1, vec![20 + i])]);
        fx.compaction_mgr.update_partition(partition, 5.0 - i as f64);
    }

    let mut scheduler = fx.scheduler();
    scheduler.run_one_cycle();
    assert_eq!(scheduler.running_partitions().len(), 2);
    assert_eq!(fx.worker.dispatch_count(), 2);

    // Finish the running jobs; the third partition gets its turn once
    // capacity frees up (it was never cooled down).
    fx.worker.complete_all();
    scheduler.run_one_cycle();
    assert_eq!(scheduler.running_partitions().len(), 1);
    assert_eq!(fx.worker.dispatch_count(), 3);
}

#[test]
fn job_outliving_txn_timeout_is_aborted() {
    // A zero timeout expires the txn on the first poll after dispatch.
    let cfg = CompactionConfig {
        visibility_poll_timeout_ms: 10,
        partition_clean_interval_sec: 0,
        txn_timeout_sec: 0,
        ..CompactionConfig::default()
    };
    let fx = Fixture {
        txn_mgr: Arc::new(FakeTxnManager::new(450, true)),
        worker: Arc::new(FakeWorkerClient::manual()),
        directory: Arc::new(FakeDirectory::new(3)),
        compaction_mgr: Arc::new(CompactionManager::new()),
        config: SharedCompactionConfig::new(cfg),
    };
    let p1 = PartitionIdentifier::new(1, 10, 100);
    fx.directory.add_partition(p1, &[(1, vec![11])]);
    fx.compaction_mgr.update_partition(p1, 5.0);

    let mut scheduler = fx.scheduler();
    scheduler.run_one_cycle();
    assert_eq!(scheduler.running_partitions(), vec![p1]);

    // The worker never responds; the next poll times the txn out.
    scheduler.run_one_cycle();
    assert!(scheduler.running_partitions().is_empty());
    assert!(fx.txn_mgr.committed_txns().is_empty());
    assert_eq!(fx.txn_mgr.aborted_txns(), vec![450]);

    let history = scheduler.get_history();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].state, RecordState::Failed);
    let reason = history[0].fail_reason.as_deref().unwrap_or("");
    assert!(reason.contains("timeout"), "unexpected reason: {reason}");
}

#[test]
fn startup_barrier_defers_admission_until_old_txns_drain() {
    // Txn 40 from a prior incarnation is still active; scheduler starts
    // handing out ids at 500.
    let fx = fixture(
        FakeTxnManager::with_active(500, &[40]),
        FakeWorkerClient::auto(Vec::new()),
    );
    let p1 = PartitionIdentifier::new(1, 10, 100);
    fx.directory.add_partition(p1, &[(1, vec![11])]);
    fx.compaction_mgr.update_partition(p1, 5.0);

    let mut scheduler = fx.scheduler();
    scheduler.run_one_cycle();
    scheduler.run_one_cycle();
    assert_eq!(fx.worker.dispatch_count(), 0);
    assert!(scheduler.running_partitions().is_empty());

    // Old txn drains; admission resumes.
    fx.txn_mgr.finish_active(40);
    scheduler.run_one_cycle();
    assert_eq!(fx.worker.dispatch_count(), 1);
    assert_eq!(scheduler.running_partitions(), vec![p1]);
}

#[test]
fn dropped_partition_is_garbage_collected() {
    let fx = fixture(FakeTxnManager::new(600, true), FakeWorkerClient::auto(Vec::new()));
    let p1 = PartitionIdentifier::new(1, 10, 100);
    let p2 = PartitionIdentifier::new(1, 10, 101);
    fx.directory.add_partition(p1, &[(1, vec![11])]);
    fx.directory.add_partition(p2, &[(1, vec![12])]);
    fx.compaction_mgr.update_partition(p1, 5.0);
    fx.compaction_mgr.update_partition(p2, 4.0);

    // p2 disappears before the scheduler ever runs.
    fx.directory.drop_partition(&p2);

    let mut scheduler = fx.scheduler();
    scheduler.run_one_cycle();
    assert_eq!(fx.compaction_mgr.all_partitions(), vec![p1]);
    assert_eq!(scheduler.running_partitions(), vec![p1]);
}

#[test]
fn schema_change_partition_waits_without_failure_record() {
    let fx = fixture(FakeTxnManager::new(700, true), FakeWorkerClient::auto(Vec::new()));
    let p1 = PartitionIdentifier::new(1, 10, 100);
    fx.directory.add_partition(p1, &[(1, vec![11])]);
    fx.directory.schema_change.lock().unwrap().insert(p1);
    fx.compaction_mgr.update_partition(p1, 5.0);

    let mut scheduler = fx.scheduler();
    scheduler.run_one_cycle();
    assert!(scheduler.running_partitions().is_empty());
    assert_eq!(fx.worker.dispatch_count(), 0);
    assert!(scheduler.get_history().is_empty());
    // Still a candidate for later cycles.
    assert_eq!(fx.compaction_mgr.all_partitions(), vec![p1]);
}
