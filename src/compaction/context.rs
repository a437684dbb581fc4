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

use std::collections::BTreeMap;

use crate::common::error::{LakeError, Result};
use crate::compaction::partition::PartitionIdentifier;
use crate::compaction::record::{CompactionRecord, RecordState};
use crate::compaction::remote::{
    CompactResponse, TabletCommitInfo, TaskFuture, VisibleStateWaiter,
};

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// One in-flight compaction job for a partition. Lives in the scheduler's
/// running table from dispatch until the job lands in history or fails;
/// at most one exists per partition.
pub struct CompactionContext {
    pub partition: PartitionIdentifier,
    pub txn_id: i64,
    pub start_ms: i64,
    pub commit_ms: i64,
    pub finish_ms: i64,
    /// Worker node -> tablets it compacts for this job.
    pub node_tablets: BTreeMap<i64, Vec<i64>>,
    pub responses: Vec<TaskFuture<CompactResponse>>,
    pub committed: bool,
    pub waiter: Option<VisibleStateWaiter>,
}

impl CompactionContext {
    pub fn new(
        partition: PartitionIdentifier,
        txn_id: i64,
        node_tablets: BTreeMap<i64, Vec<i64>>,
        responses: Vec<TaskFuture<CompactResponse>>,
    ) -> Self {
        Self {
            partition,
            txn_id,
            start_ms: now_ms(),
            commit_ms: 0,
            finish_ms: 0,
            node_tablets,
            responses,
            committed: false,
            waiter: None,
        }
    }

    pub fn tablet_count(&self) -> usize {
        self.node_tablets.values().map(|tablets| tablets.len()).sum()
    }

    pub fn all_responses_done(&self) -> bool {
        self.responses.iter().all(|future| future.is_done())
    }

    /// Validate every worker's reply: transport errors and failed tablets
    /// both fail the job.
    pub fn check_responses(&self) -> Result<()> {
        for future in &self.responses {
            let response = future.peek().ok_or_else(|| {
                LakeError::Internal(format!(
                    "compact response polled before completion: partition={}, txn_id={}",
                    self.partition, self.txn_id
                ))
            })?;
            if let Some(error) = response.error {
                return Err(LakeError::RemoteTaskFailure(format!(
                    "compact request failed: partition={}, txn_id={}, error={error}",
                    self.partition, self.txn_id
                )));
            }
            if !response.failed_tablets.is_empty() {
                return Err(LakeError::RemoteTaskFailure(format!(
                    "compaction failed on tablets {:?}: partition={}, txn_id={}",
                    response.failed_tablets, self.partition, self.txn_id
                )));
            }
        }
        Ok(())
    }

    pub fn build_commit_infos(&self) -> Vec<TabletCommitInfo> {
        let mut infos = Vec::with_capacity(self.tablet_count());
        for (node_id, tablets) in &self.node_tablets {
            for tablet_id in tablets {
                infos.push(TabletCommitInfo {
                    tablet_id: *tablet_id,
                    node_id: *node_id,
                });
            }
        }
        infos
    }

    pub fn to_record(&self, state: RecordState, fail_reason: Option<String>) -> CompactionRecord {
        CompactionRecord {
            partition: self.partition,
            txn_id: self.txn_id,
            start_ms: self.start_ms,
            commit_ms: self.commit_ms,
            finish_ms: self.finish_ms,
            tablet_count: self.tablet_count(),
            state,
            fail_reason,
        }
    }
}
