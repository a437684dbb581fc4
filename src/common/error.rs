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

use thiserror::Error;

/// Error taxonomy for the lake metadata core.
///
/// `NotFound` and `AlreadyExists` are usually absorbed by callers
/// (skip/remove, idempotent return); the rest surface verbatim.
#[derive(Debug, Error)]
pub enum LakeError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("invalid version: {0}")]
    InvalidVersion(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("remote task failure: {0}")]
    RemoteTaskFailure(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, LakeError>;

impl LakeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, LakeError::NotFound(_))
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, LakeError::AlreadyExists(_))
    }
}

impl From<prost::DecodeError> for LakeError {
    fn from(e: prost::DecodeError) -> Self {
        LakeError::Corruption(format!("decode protobuf failed: {e}"))
    }
}
