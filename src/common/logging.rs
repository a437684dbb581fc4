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

use std::sync::OnceLock;

use tracing_subscriber::EnvFilter;

use crate::common::config::LakemetaConfig;

static INIT: OnceLock<()> = OnceLock::new();

pub use tracing::{debug, error, info, trace, warn};

/// Initialize the global tracing subscriber once. Later calls are no-ops.
pub fn init(cfg: &LakemetaConfig) {
    let directive = cfg
        .log_filter
        .clone()
        .unwrap_or_else(|| format!("lakemeta={}", cfg.log_level));
    init_with_level(&directive);
}

pub fn init_with_level(directive: &str) {
    let directive = directive.to_string();
    INIT.get_or_init(|| {
        let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));
        // Ignore the error from a subscriber already installed by the host.
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .try_init();
    });
}
