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

//! Narrow contracts to the scheduler's external collaborators: the
//! transaction manager, the per-node compaction workers, and the
//! partition directory. The control loop only ever polls with bounded
//! waits, so a stalled collaborator delays one partition, not the loop.

use std::collections::BTreeMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::common::error::Result;
use crate::compaction::partition::PartitionIdentifier;

/// One worker's reply to a compact request.
#[derive(Clone, Debug, Default)]
pub struct CompactResponse {
    pub failed_tablets: Vec<i64>,
    /// Transport or execution error; `None` means the request ran.
    pub error: Option<String>,
}

struct FutureInner<T> {
    slot: Mutex<Option<T>>,
    cond: Condvar,
}

/// Completion slot for an asynchronous remote call. The scheduler polls
/// with [`peek`]/[`is_done`]; the producing side calls [`complete`] once
/// (later completions are ignored).
///
/// [`peek`]: TaskFuture::peek
/// [`is_done`]: TaskFuture::is_done
/// [`complete`]: TaskFuture::complete
pub struct TaskFuture<T> {
    inner: Arc<FutureInner<T>>,
}

impl<T> Clone for TaskFuture<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> Default for TaskFuture<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> TaskFuture<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(FutureInner {
                slot: Mutex::new(None),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn complete(&self, value: T) {
        let mut slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if slot.is_none() {
            *slot = Some(value);
            self.inner.cond.notify_all();
        }
    }

    pub fn is_done(&self) -> bool {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .is_some()
    }
}

impl<T: Clone> TaskFuture<T> {
    pub fn peek(&self) -> Option<T> {
        self.inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<T> {
        let slot = self
            .inner
            .slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let (slot, _timed_out) = self
            .inner
            .cond
            .wait_timeout_while(slot, timeout, |slot| slot.is_none())
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        slot.clone()
    }
}

/// Resolves when a committed transaction becomes visible. Bounded waits
/// only; the scheduler re-polls next cycle on timeout.
#[derive(Clone, Default)]
pub struct VisibleStateWaiter {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl VisibleStateWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify_visible(&self) {
        let (lock, cond) = &*self.state;
        *lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = true;
        cond.notify_all();
    }

    pub fn wait_visible(&self, timeout: Duration) -> bool {
        let (lock, cond) = &*self.state;
        let visible = lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (visible, _timed_out) = cond
            .wait_timeout_while(visible, timeout, |visible| !*visible)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *visible
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TabletCommitInfo {
    pub tablet_id: i64,
    pub node_id: i64,
}

pub trait TransactionManager: Send + Sync {
    fn begin(
        &self,
        partition: &PartitionIdentifier,
        label: &str,
        timeout_sec: i64,
    ) -> Result<i64>;

    fn commit(
        &self,
        partition: &PartitionIdentifier,
        txn_id: i64,
        commit_infos: &[TabletCommitInfo],
    ) -> Result<VisibleStateWaiter>;

    fn abort(&self, partition: &PartitionIdentifier, txn_id: i64, reason: &str);

    /// Smallest txn id still active, or `i64::MAX` when none are.
    fn min_active_txn_id(&self) -> i64;

    fn next_txn_id(&self) -> i64;
}

pub trait WorkerClient: Send + Sync {
    fn compact(
        &self,
        node_id: i64,
        tablet_ids: &[i64],
        version: i64,
        txn_id: i64,
    ) -> Result<TaskFuture<CompactResponse>>;
}

/// What the directory knows about a partition right now. A partition can
/// disappear or enter schema change between cycles; neither is fatal.
pub enum PartitionState {
    Missing,
    SchemaChange,
    Normal(PartitionSnapshot),
}

pub struct PartitionSnapshot {
    pub visible_version: i64,
    /// Owning worker node -> tablets hosted there.
    pub node_tablets: BTreeMap<i64, Vec<i64>>,
}

pub trait PartitionDirectory: Send + Sync {
    fn partition_state(&self, partition: &PartitionIdentifier) -> PartitionState;

    fn alive_node_count(&self) -> usize;
}
