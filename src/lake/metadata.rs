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

use std::collections::HashMap;

use prost::Message;

/// Keys model of a tablet. A closed set: new variants require a publish
/// protocol review, so this stays an enum rather than open metadata.
#[derive(Clone, Copy, Debug, PartialEq, Eq, prost::Enumeration)]
#[repr(i32)]
pub enum KeysType {
    DupKeys = 0,
    PrimaryKeys = 1,
}

#[derive(Clone, PartialEq, Message)]
pub struct ColumnPb {
    #[prost(int32, tag = "1")]
    pub unique_id: i32,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub r#type: String,
    #[prost(bool, optional, tag = "4")]
    pub is_key: Option<bool>,
    #[prost(bool, optional, tag = "5")]
    pub is_nullable: Option<bool>,
}

#[derive(Clone, PartialEq, Message)]
pub struct TabletSchemaPb {
    #[prost(int64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(enumeration = "KeysType", optional, tag = "2")]
    pub keys_type: Option<i32>,
    #[prost(message, repeated, tag = "3")]
    pub column: Vec<ColumnPb>,
}

/// One immutable set of segment files produced by a write or a compaction.
#[derive(Clone, PartialEq, Message)]
pub struct RowsetMetadataPb {
    /// First rssid of this rowset; segment i within it has rssid `id + i`.
    #[prost(uint32, optional, tag = "1")]
    pub id: Option<u32>,
    #[prost(bool, optional, tag = "2")]
    pub overlapped: Option<bool>,
    #[prost(string, repeated, tag = "3")]
    pub segments: Vec<String>,
    #[prost(int64, optional, tag = "4")]
    pub num_rows: Option<i64>,
    #[prost(int64, optional, tag = "5")]
    pub data_size: Option<i64>,
}

/// Location of one segment's delete vector inside the delvec file of
/// `version`. Pages are superseded by later versions, never rewritten.
#[derive(Clone, PartialEq, Message)]
pub struct DelvecPagePb {
    #[prost(int64, optional, tag = "1")]
    pub version: Option<i64>,
    #[prost(uint64, optional, tag = "2")]
    pub offset: Option<u64>,
    #[prost(uint64, optional, tag = "3")]
    pub size: Option<u64>,
    #[prost(uint32, optional, tag = "4")]
    pub crc32c: Option<u32>,
    #[prost(int64, optional, tag = "5")]
    pub crc32c_gen_version: Option<i64>,
}

#[derive(Clone, PartialEq, Message)]
pub struct FileMetaPb {
    #[prost(string, optional, tag = "1")]
    pub name: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DelvecMetadataPb {
    /// rssid -> page within the delvec file of `page.version`.
    #[prost(map = "uint32, message", tag = "1")]
    pub delvecs: HashMap<u32, DelvecPagePb>,
    /// version -> delvec file holding pages written at that version.
    #[prost(map = "int64, message", tag = "2")]
    pub version_to_file: HashMap<i64, FileMetaPb>,
}

/// Versioned tablet metadata snapshot. Immutable once published: a given
/// (tablet, version) file is written exactly once with create-new
/// semantics, which is what makes concurrent publishes race-safe.
#[derive(Clone, PartialEq, Message)]
pub struct TabletMetadataPb {
    #[prost(int64, optional, tag = "1")]
    pub id: Option<i64>,
    #[prost(int64, optional, tag = "2")]
    pub version: Option<i64>,
    #[prost(message, optional, tag = "3")]
    pub schema: Option<TabletSchemaPb>,
    #[prost(message, repeated, tag = "4")]
    pub rowsets: Vec<RowsetMetadataPb>,
    #[prost(uint32, optional, tag = "5")]
    pub next_rowset_id: Option<u32>,
    #[prost(message, optional, tag = "6")]
    pub delvec_meta: Option<DelvecMetadataPb>,
    #[prost(int64, optional, tag = "7")]
    pub commit_time: Option<i64>,
    /// Rowset ids consumed by the most recent compaction, kept for
    /// vacuum-style bookkeeping.
    #[prost(uint32, repeated, tag = "8")]
    pub compaction_inputs: Vec<u32>,
}

pub fn is_primary_key(metadata: &TabletMetadataPb) -> bool {
    metadata
        .schema
        .as_ref()
        .and_then(|s| s.keys_type)
        .is_some_and(|kt| kt == KeysType::PrimaryKeys as i32)
}

/// Next free rssid when the counter is absent in older snapshots.
pub fn next_rowset_id(rowsets: &[RowsetMetadataPb]) -> u32 {
    rowsets
        .iter()
        .map(|rs| rs.id.unwrap_or(0).saturating_add(rs.segments.len().max(1) as u32))
        .max()
        .unwrap_or(1)
        .max(1)
}

pub fn tablet_row_count(metadata: &TabletMetadataPb) -> i64 {
    metadata
        .rowsets
        .iter()
        .map(|rowset| rowset.num_rows.unwrap_or(0))
        .sum()
}

/// Estimated useful work for compacting this tablet. Only the ordering
/// matters to the scheduler: more rowsets and more overlapping segments
/// mean a higher score, an empty tablet scores zero.
pub fn compaction_score(metadata: &TabletMetadataPb) -> f64 {
    let mut score = 0.0;
    for rowset in &metadata.rowsets {
        let segments = rowset.segments.len().max(1) as f64;
        score += if rowset.overlapped.unwrap_or(false) {
            segments
        } else {
            1.0
        };
    }
    score
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rowset(id: u32, segments: usize, overlapped: bool) -> RowsetMetadataPb {
        RowsetMetadataPb {
            id: Some(id),
            overlapped: Some(overlapped),
            segments: (0..segments).map(|i| format!("seg_{id}_{i}.dat")).collect(),
            num_rows: Some(10),
            data_size: Some(100),
        }
    }

    #[test]
    fn next_rowset_id_skips_past_widest_rowset() {
        let rowsets = vec![rowset(1, 2, false), rowset(3, 1, false)];
        assert_eq!(next_rowset_id(&rowsets), 4);
        assert_eq!(next_rowset_id(&[]), 1);
    }

    #[test]
    fn score_counts_overlapping_segments() {
        let meta = TabletMetadataPb {
            rowsets: vec![rowset(1, 3, true), rowset(4, 2, false)],
            ..Default::default()
        };
        assert_eq!(compaction_score(&meta), 4.0);
        assert_eq!(compaction_score(&TabletMetadataPb::default()), 0.0);
    }

    #[test]
    fn primary_key_detection_requires_schema() {
        let mut meta = TabletMetadataPb::default();
        assert!(!is_primary_key(&meta));
        meta.schema = Some(TabletSchemaPb {
            id: Some(1),
            keys_type: Some(KeysType::PrimaryKeys as i32),
            column: Vec::new(),
        });
        assert!(is_primary_key(&meta));
    }
}
