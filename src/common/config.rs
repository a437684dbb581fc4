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

use std::path::Path;
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use serde::Deserialize;

fn default_log_level() -> String {
    "info".to_string()
}

fn default_loop_interval_ms() -> u64 {
    500
}

fn default_txn_timeout_sec() -> i64 {
    86_400
}

fn default_success_cooldown_ms() -> u64 {
    3_000
}

fn default_failure_cooldown_ms() -> u64 {
    6_000
}

fn default_partition_clean_interval_sec() -> u64 {
    30
}

fn default_visibility_poll_timeout_ms() -> u64 {
    100
}

fn default_max_tasks() -> i32 {
    -1
}

fn default_tasks_per_node() -> i32 {
    16
}

fn default_history_size() -> usize {
    12
}

#[derive(Clone, Deserialize)]
pub struct LakemetaConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub compaction: CompactionConfig,
}

impl LakemetaConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: LakemetaConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for LakemetaConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            compaction: CompactionConfig::default(),
        }
    }
}

/// Compaction scheduler tunables. The scheduler takes one consistent
/// snapshot of these at the start of every cycle, so updates through
/// [`SharedCompactionConfig::update`] become effective on the next cycle.
#[derive(Clone, Deserialize)]
pub struct CompactionConfig {
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,

    #[serde(default = "default_txn_timeout_sec")]
    pub txn_timeout_sec: i64,

    #[serde(default = "default_success_cooldown_ms")]
    pub success_cooldown_ms: u64,

    #[serde(default = "default_failure_cooldown_ms")]
    pub failure_cooldown_ms: u64,

    #[serde(default = "default_partition_clean_interval_sec")]
    pub partition_clean_interval_sec: u64,

    #[serde(default = "default_visibility_poll_timeout_ms")]
    pub visibility_poll_timeout_ms: u64,

    /// Global ceiling on in-flight compaction tasks. Negative means
    /// derive from the live worker-node count times `tasks_per_node`.
    #[serde(default = "default_max_tasks")]
    pub max_tasks: i32,

    #[serde(default = "default_tasks_per_node")]
    pub tasks_per_node: i32,

    #[serde(default = "default_history_size")]
    pub history_size: usize,

    #[serde(default = "default_history_size")]
    pub fail_history_size: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            loop_interval_ms: default_loop_interval_ms(),
            txn_timeout_sec: default_txn_timeout_sec(),
            success_cooldown_ms: default_success_cooldown_ms(),
            failure_cooldown_ms: default_failure_cooldown_ms(),
            partition_clean_interval_sec: default_partition_clean_interval_sec(),
            visibility_poll_timeout_ms: default_visibility_poll_timeout_ms(),
            max_tasks: default_max_tasks(),
            tasks_per_node: default_tasks_per_node(),
            history_size: default_history_size(),
            fail_history_size: default_history_size(),
        }
    }
}

/// Hot-reloadable handle around [`CompactionConfig`].
#[derive(Clone)]
pub struct SharedCompactionConfig {
    inner: Arc<RwLock<CompactionConfig>>,
}

impl SharedCompactionConfig {
    pub fn new(cfg: CompactionConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(cfg)),
        }
    }

    pub fn snapshot(&self) -> CompactionConfig {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn update(&self, cfg: CompactionConfig) {
        *self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = cfg;
    }
}

impl Default for SharedCompactionConfig {
    fn default() -> Self {
        Self::new(CompactionConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_scheduler_constants() {
        let cfg = CompactionConfig::default();
        assert_eq!(cfg.loop_interval_ms, 500);
        assert_eq!(cfg.success_cooldown_ms, 3_000);
        assert_eq!(cfg.failure_cooldown_ms, 6_000);
        assert_eq!(cfg.max_tasks, -1);
        assert_eq!(cfg.tasks_per_node, 16);
    }

    #[test]
    fn parse_partial_toml_fills_defaults() {
        let cfg: LakemetaConfig = toml::from_str(
            r#"
            log_level = "debug"

            [compaction]
            max_tasks = 4
            history_size = 3
            "#,
        )
        .expect("parse config");
        assert_eq!(cfg.log_level, "debug");
        assert_eq!(cfg.compaction.max_tasks, 4);
        assert_eq!(cfg.compaction.history_size, 3);
        assert_eq!(cfg.compaction.loop_interval_ms, 500);
    }

    #[test]
    fn shared_config_update_is_visible_in_next_snapshot() {
        let shared = SharedCompactionConfig::default();
        let mut cfg = shared.snapshot();
        cfg.max_tasks = 7;
        shared.update(cfg);
        assert_eq!(shared.snapshot().max_tasks, 7);
    }
}
