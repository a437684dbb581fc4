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

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::common::config::{CompactionConfig, SharedCompactionConfig};
use crate::common::error::{LakeError, Result};
use crate::compaction::context::{CompactionContext, now_ms};
use crate::compaction::manager::CompactionManager;
use crate::compaction::partition::PartitionIdentifier;
use crate::compaction::record::{CompactionRecord, HistoryRing, RecordState};
use crate::compaction::remote::{
    PartitionDirectory, PartitionState, TransactionManager, WorkerClient,
};

enum JobOutcome {
    Running,
    Succeeded,
    Failed(LakeError),
}

/// Periodic control loop driving per-partition compaction jobs. Single
/// owner of the running-job table: all mutation happens inside
/// [`run_one_cycle`], worker results arrive through polled futures.
///
/// [`run_one_cycle`]: CompactionScheduler::run_one_cycle
pub struct CompactionScheduler {
    txn_mgr: Arc<dyn TransactionManager>,
    worker_client: Arc<dyn WorkerClient>,
    directory: Arc<dyn PartitionDirectory>,
    compaction_mgr: Arc<CompactionManager>,
    config: SharedCompactionConfig,
    running: HashMap<PartitionIdentifier, CompactionContext>,
    history: HistoryRing,
    fail_history: HistoryRing,
    /// Startup txn barrier: negative = not yet captured, zero = passed,
    /// positive = waiting for txns below it to drain.
    wait_txn_id: i64,
    last_partition_clean: Instant,
}

impl CompactionScheduler {
    pub fn new(
        txn_mgr: Arc<dyn TransactionManager>,
        worker_client: Arc<dyn WorkerClient>,
        directory: Arc<dyn PartitionDirectory>,
        compaction_mgr: Arc<CompactionManager>,
        config: SharedCompactionConfig,
    ) -> Self {
        let cfg = config.snapshot();
        Self {
            txn_mgr,
            worker_client,
            directory,
            compaction_mgr,
            config,
            running: HashMap::new(),
            history: HistoryRing::new(cfg.history_size),
            fail_history: HistoryRing::new(cfg.fail_history_size),
            wait_txn_id: -1,
            last_partition_clean: Instant::now(),
        }
    }

    pub fn running_partitions(&self) -> Vec<PartitionIdentifier> {
        let mut partitions: Vec<_> = self.running.keys().copied().collect();
        partitions.sort_unstable();
        partitions
    }

    /// Running jobs first, then succeeded and failed records oldest first.
    pub fn get_history(&self) -> Vec<CompactionRecord> {
        let mut records = Vec::new();
        for partition in self.running_partitions() {
            if let Some(ctx) = self.running.get(&partition) {
                records.push(ctx.to_record(RecordState::Running, None));
            }
        }
        records.extend(self.history.records().cloned());
        records.extend(self.fail_history.records().cloned());
        records
    }

    /// One scheduling cycle. Per-partition failures are converted into
    /// state transitions here and never escape.
    pub fn run_one_cycle(&mut self) {
        let cfg = self.config.snapshot();
        self.history.resize(cfg.history_size);
        self.fail_history.resize(cfg.fail_history_size);

        self.clean_partitions_if_due(&cfg);
        self.poll_running_jobs(&cfg);
        if self.startup_barrier_passed() {
            self.admit_new_jobs(&cfg);
        }
    }

    /// Do not admit new jobs until every txn begun before this scheduler
    /// started has drained, so a restarted process cannot race compaction
    /// against in-flight work of its prior incarnation.
    fn startup_barrier_passed(&mut self) -> bool {
        if self.wait_txn_id < 0 {
            self.wait_txn_id = self.txn_mgr.next_txn_id().max(0);
            tracing::info!(
                target: "lakemeta::compaction",
                wait_txn_id = self.wait_txn_id,
                "COMPACTION captured startup txn barrier"
            );
        }
        if self.wait_txn_id == 0 {
            return true;
        }
        if self.txn_mgr.min_active_txn_id() >= self.wait_txn_id {
            tracing::info!(
                target: "lakemeta::compaction",
                wait_txn_id = self.wait_txn_id,
                "COMPACTION startup txn barrier passed"
            );
            self.wait_txn_id = 0;
            return true;
        }
        false
    }

    fn clean_partitions_if_due(&mut self, cfg: &CompactionConfig) {
        let interval = Duration::from_secs(cfg.partition_clean_interval_sec);
        if self.last_partition_clean.elapsed() < interval {
            return;
        }
        self.last_partition_clean = Instant::now();
        for partition in self.compaction_mgr.all_partitions() {
            if self.running.contains_key(&partition) {
                continue;
            }
            if matches!(
                self.directory.partition_state(&partition),
                PartitionState::Missing
            ) {
                self.compaction_mgr.remove_partition(&partition);
            }
        }
    }

    fn poll_running_jobs(&mut self, cfg: &CompactionConfig) {
        let partitions: Vec<_> = self.running.keys().copied().collect();
        for partition in partitions {
            let outcome = 'outcome: {
                let Some(ctx) = self.running.get_mut(&partition) else {
                    break 'outcome JobOutcome::Running;
                };
                if !ctx.committed {
                    if now_ms().saturating_sub(ctx.start_ms)
                        >= cfg.txn_timeout_sec.saturating_mul(1000)
                    {
                        break 'outcome JobOutcome::Failed(LakeError::Timeout(format!(
                            "compaction txn {} outlived its {}s transaction timeout",
                            ctx.txn_id, cfg.txn_timeout_sec
                        )));
                    }
                    if !ctx.all_responses_done() {
                        break 'outcome JobOutcome::Running;
                    }
                    let committed = ctx.check_responses().and_then(|()| {
                        self.txn_mgr
                            .commit(&partition, ctx.txn_id, &ctx.build_commit_infos())
                    });
                    match committed {
                        Ok(waiter) => {
                            ctx.committed = true;
                            ctx.commit_ms = now_ms();
                            ctx.waiter = Some(waiter);
                        }
                        Err(e) => break 'outcome JobOutcome::Failed(e),
                    }
                }
                let timeout = Duration::from_millis(cfg.visibility_poll_timeout_ms);
                if ctx
                    .waiter
                    .as_ref()
                    .is_some_and(|waiter| waiter.wait_visible(timeout))
                {
                    ctx.finish_ms = now_ms();
                    JobOutcome::Succeeded
                } else {
                    JobOutcome::Running
                }
            };

            match outcome {
                JobOutcome::Running => {}
                JobOutcome::Succeeded => {
                    if let Some(ctx) = self.running.remove(&partition) {
                        tracing::info!(
                            target: "lakemeta::compaction",
                            partition = %partition,
                            txn_id = ctx.txn_id,
                            tablets = ctx.tablet_count(),
                            cost_ms = ctx.finish_ms - ctx.start_ms,
                            "COMPACTION job finished"
                        );
                        self.history.push(ctx.to_record(RecordState::Succeeded, None));
                        self.compaction_mgr.enable_compaction_after(
                            partition,
                            Duration::from_millis(cfg.success_cooldown_ms),
                        );
                    }
                }
                JobOutcome::Failed(e) => self.fail_running_job(partition, e, cfg),
            }
        }
    }

    fn fail_running_job(
        &mut self,
        partition: PartitionIdentifier,
        error: LakeError,
        cfg: &CompactionConfig,
    ) {
        let Some(ctx) = self.running.remove(&partition) else {
            return;
        };
        let reason = error.to_string();
        tracing::warn!(
            target: "lakemeta::compaction",
            partition = %partition,
            txn_id = ctx.txn_id,
            reason,
            "COMPACTION job failed"
        );
        self.txn_mgr.abort(&partition, ctx.txn_id, &reason);
        let mut record = ctx.to_record(RecordState::Failed, Some(reason));
        record.finish_ms = now_ms();
        self.fail_history.push(record);
        self.compaction_mgr
            .enable_compaction_after(partition, Duration::from_millis(cfg.failure_cooldown_ms));
    }

    fn task_ceiling(&self, cfg: &CompactionConfig) -> usize {
        if cfg.max_tasks >= 0 {
            cfg.max_tasks as usize
        } else {
            self.directory.alive_node_count() * cfg.tasks_per_node.max(0) as usize
        }
    }

    fn admit_new_jobs(&mut self, cfg: &CompactionConfig) {
        let ceiling = self.task_ceiling(cfg);
        let mut task_count: usize = self.running.values().map(|ctx| ctx.tablet_count()).sum();
        if task_count >= ceiling {
            return;
        }
        let exclude: HashSet<_> = self.running.keys().copied().collect();
        for partition in self.compaction_mgr.choose_partitions_to_compact(&exclude) {
            if task_count >= ceiling {
                break;
            }
            match self.start_compaction(partition, cfg) {
                Ok(Some(ctx)) => {
                    task_count += ctx.tablet_count();
                    self.running.insert(partition, ctx);
                }
                Ok(None) => {
                    // Mid schema change; come back after a cooldown.
                    self.compaction_mgr.enable_compaction_after(
                        partition,
                        Duration::from_millis(cfg.failure_cooldown_ms),
                    );
                }
                Err(e) if e.is_not_found() => {
                    self.compaction_mgr.remove_partition(&partition);
                }
                Err(e) => self.fail_start_attempt(partition, e, cfg),
            }
        }
    }

    fn fail_start_attempt(
        &mut self,
        partition: PartitionIdentifier,
        error: LakeError,
        cfg: &CompactionConfig,
    ) {
        let reason = error.to_string();
        tracing::warn!(
            target: "lakemeta::compaction",
            partition = %partition,
            reason,
            "COMPACTION failed to start job"
        );
        self.fail_history.push(CompactionRecord {
            partition,
            txn_id: 0,
            start_ms: now_ms(),
            commit_ms: 0,
            finish_ms: now_ms(),
            tablet_count: 0,
            state: RecordState::Failed,
            fail_reason: Some(reason),
        });
        self.compaction_mgr
            .enable_compaction_after(partition, Duration::from_millis(cfg.failure_cooldown_ms));
    }

    /// Validate the partition, begin a txn, and dispatch one compact
    /// request per owning node. `Ok(None)` means the partition is mid
    /// schema change and should simply wait.
    fn start_compaction(
        &mut self,
        partition: PartitionIdentifier,
        cfg: &CompactionConfig,
    ) -> Result<Option<CompactionContext>> {
        let snapshot = match self.directory.partition_state(&partition) {
            PartitionState::Missing => {
                return Err(LakeError::NotFound(format!("partition {partition}")));
            }
            PartitionState::SchemaChange => return Ok(None),
            PartitionState::Normal(snapshot) => snapshot,
        };
        if snapshot.node_tablets.is_empty() {
            return Err(LakeError::Internal(format!(
                "no alive node hosts partition {partition}"
            )));
        }

        let label = format!("COMPACTION_{}_{}", partition, now_ms());
        let txn_id = self.txn_mgr.begin(&partition, &label, cfg.txn_timeout_sec)?;

        let mut responses = Vec::with_capacity(snapshot.node_tablets.len());
        for (node_id, tablets) in &snapshot.node_tablets {
            match self
                .worker_client
                .compact(*node_id, tablets, snapshot.visible_version, txn_id)
            {
                Ok(future) => responses.push(future),
                Err(e) => {
                    self.txn_mgr.abort(&partition, txn_id, &e.to_string());
                    return Err(e);
                }
            }
        }

        tracing::info!(
            target: "lakemeta::compaction",
            partition = %partition,
            txn_id,
            version = snapshot.visible_version,
            nodes = snapshot.node_tablets.len(),
            "COMPACTION dispatched job"
        );
        Ok(Some(CompactionContext::new(
            partition,
            txn_id,
            snapshot.node_tablets,
            responses,
        )))
    }

    /// Run the loop on a dedicated thread until the handle stops it.
    pub fn start(self) -> Result<CompactionSchedulerHandle> {
        let shared = Arc::new(Mutex::new(self));
        let stop = Arc::new(AtomicBool::new(false));
        let thread_shared = Arc::clone(&shared);
        let thread_stop = Arc::clone(&stop);
        let join = std::thread::Builder::new()
            .name("compaction_scheduler".to_string())
            .spawn(move || {
                while !thread_stop.load(Ordering::Acquire) {
                    let interval_ms = {
                        let mut scheduler = thread_shared
                            .lock()
                            .unwrap_or_else(|poisoned| poisoned.into_inner());
                        scheduler.run_one_cycle();
                        scheduler.config.snapshot().loop_interval_ms
                    };
                    std::thread::sleep(Duration::from_millis(interval_ms));
                }
            })
            .map_err(|e| {
                LakeError::Internal(format!("spawn compaction scheduler thread failed: {e}"))
            })?;
        Ok(CompactionSchedulerHandle {
            shared,
            stop,
            join: Some(join),
        })
    }
}

/// Owner handle of a started scheduler thread. Stops the loop on drop.
pub struct CompactionSchedulerHandle {
    shared: Arc<Mutex<CompactionScheduler>>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl CompactionSchedulerHandle {
    pub fn get_history(&self) -> Vec<CompactionRecord> {
        self.shared
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_history()
    }

    pub fn stop(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for CompactionSchedulerHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
