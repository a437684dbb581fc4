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

use prost::Message;

use crate::common::error::{LakeError, Result};
use crate::lake::io::{delete_path_if_exists, read_bytes, write_bytes};
use crate::lake::layout::txn_log_file_path;
use crate::lake::metadata::RowsetMetadataPb;

#[derive(Clone, PartialEq, Message)]
pub struct OpWritePb {
    #[prost(message, optional, tag = "1")]
    pub rowset: Option<RowsetMetadataPb>,
    /// Encoded delete-key payloads (see `lake::segment::encode_delete_keys`).
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub dels: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OpCompactionPb {
    #[prost(uint32, repeated, tag = "1")]
    pub input_rowsets: Vec<u32>,
    #[prost(message, optional, tag = "2")]
    pub output_rowset: Option<RowsetMetadataPb>,
}

/// A pending mutation keyed by (tablet id, txn id). Created by a writer,
/// consumed exactly once by a successful publish, then deletable.
#[derive(Clone, PartialEq, Message)]
pub struct TxnLogPb {
    #[prost(int64, optional, tag = "1")]
    pub tablet_id: Option<i64>,
    #[prost(int64, optional, tag = "2")]
    pub txn_id: Option<i64>,
    #[prost(message, optional, tag = "3")]
    pub op_write: Option<OpWritePb>,
    #[prost(message, optional, tag = "4")]
    pub op_compaction: Option<OpCompactionPb>,
}

/// Closed dispatch over the txn-log op variants, exhaustively matched by
/// the publish path.
pub enum TxnLogOp<'a> {
    Write(&'a OpWritePb),
    Compaction(&'a OpCompactionPb),
    Empty,
}

pub fn dispatch_txn_log(txn_log: &TxnLogPb) -> TxnLogOp<'_> {
    if let Some(op_write) = txn_log.op_write.as_ref() {
        return TxnLogOp::Write(op_write);
    }
    if let Some(op_compaction) = txn_log.op_compaction.as_ref() {
        return TxnLogOp::Compaction(op_compaction);
    }
    TxnLogOp::Empty
}

pub fn write_txn_log_file(root: &Path, txn_log: &TxnLogPb) -> Result<()> {
    let tablet_id = txn_log
        .tablet_id
        .filter(|v| *v > 0)
        .ok_or_else(|| LakeError::InvalidArgument("txn log missing tablet_id".to_string()))?;
    let txn_id = txn_log
        .txn_id
        .filter(|v| *v > 0)
        .ok_or_else(|| LakeError::InvalidArgument("txn log missing txn_id".to_string()))?;
    let path = txn_log_file_path(root, tablet_id, txn_id);
    write_bytes(&path, &txn_log.encode_to_vec())
}

pub fn read_txn_log_file(root: &Path, tablet_id: i64, txn_id: i64) -> Result<TxnLogPb> {
    let path = txn_log_file_path(root, tablet_id, txn_id);
    let bytes = read_bytes(&path).map_err(|e| match e {
        LakeError::NotFound(_) => {
            LakeError::NotFound(format!("txn log tablet_id={tablet_id} txn_id={txn_id}"))
        }
        other => other,
    })?;
    let txn_log = TxnLogPb::decode(bytes.as_slice())?;
    if txn_log.tablet_id != Some(tablet_id) || txn_log.txn_id != Some(txn_id) {
        return Err(LakeError::Corruption(format!(
            "txn log key mismatch: expected tablet_id={tablet_id} txn_id={txn_id}, \
             actual tablet_id={:?} txn_id={:?}",
            txn_log.tablet_id, txn_log.txn_id
        )));
    }
    Ok(txn_log)
}

pub fn delete_txn_log_file(root: &Path, tablet_id: i64, txn_id: i64) -> Result<()> {
    delete_path_if_exists(&txn_log_file_path(root, tablet_id, txn_id))
}
