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

//! Directory layout under a tablet root:
//! `meta/` versioned metadata snapshots, `log/` pending txn logs,
//! `data/` segment and delvec files.

use std::path::{Path, PathBuf};

pub const META_DIR: &str = "meta";
pub const LOG_DIR: &str = "log";
pub const DATA_DIR: &str = "data";

pub fn metadata_file_path(root: &Path, tablet_id: i64, version: i64) -> PathBuf {
    root.join(META_DIR)
        .join(format!("{:016x}_{:016x}.meta", tablet_id as u64, version as u64))
}

pub fn txn_log_file_path(root: &Path, tablet_id: i64, txn_id: i64) -> PathBuf {
    root.join(LOG_DIR)
        .join(format!("{:016x}_{:016x}.log", tablet_id as u64, txn_id as u64))
}

pub fn data_file_path(root: &Path, file_name: &str) -> PathBuf {
    root.join(DATA_DIR).join(file_name)
}

/// Version encoded in a metadata file name, used to discover the latest
/// published version without a separate pointer file.
pub fn parse_metadata_version(file_name: &str, tablet_id: i64) -> Option<i64> {
    let stem = file_name.strip_suffix(".meta")?;
    let (tablet_part, version_part) = stem.split_once('_')?;
    let parsed_tablet = u64::from_str_radix(tablet_part, 16).ok()?;
    if parsed_tablet != tablet_id as u64 {
        return None;
    }
    let version = u64::from_str_radix(version_part, 16).ok()?;
    i64::try_from(version).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_file_name_round_trips_version() {
        let root = PathBuf::from("/tmp/tablet");
        let path = metadata_file_path(&root, 42, 7);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(parse_metadata_version(name, 42), Some(7));
        assert_eq!(parse_metadata_version(name, 43), None);
        assert_eq!(parse_metadata_version("garbage.meta", 42), None);
    }
}
