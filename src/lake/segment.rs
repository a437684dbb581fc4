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

//! Minimal segment payload. The real engine stores columnar segment
//! files; this core only needs encoded primary keys and opaque values,
//! consumed through the same narrow surface the publish path would use.

use std::path::Path;

use prost::Message;

use crate::common::error::{LakeError, Result};
use crate::lake::io::{read_bytes, write_bytes};
use crate::lake::layout::data_file_path;

#[derive(Clone, PartialEq, Message)]
pub struct SegmentDataPb {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub keys: Vec<Vec<u8>>,
    #[prost(bytes = "vec", repeated, tag = "2")]
    pub values: Vec<Vec<u8>>,
}

#[derive(Clone, PartialEq, Message)]
pub struct DeleteKeysPb {
    #[prost(bytes = "vec", repeated, tag = "1")]
    pub keys: Vec<Vec<u8>>,
}

pub fn write_segment_file(root: &Path, file_name: &str, segment: &SegmentDataPb) -> Result<()> {
    if segment.keys.len() != segment.values.len() {
        return Err(LakeError::InvalidArgument(format!(
            "segment key/value count mismatch: keys={} values={}",
            segment.keys.len(),
            segment.values.len()
        )));
    }
    write_bytes(&data_file_path(root, file_name), &segment.encode_to_vec())
}

pub fn read_segment_file(root: &Path, file_name: &str) -> Result<SegmentDataPb> {
    let bytes = read_bytes(&data_file_path(root, file_name))?;
    let segment = SegmentDataPb::decode(bytes.as_slice())?;
    if segment.keys.len() != segment.values.len() {
        return Err(LakeError::Corruption(format!(
            "segment key/value count mismatch in {file_name}: keys={} values={}",
            segment.keys.len(),
            segment.values.len()
        )));
    }
    Ok(segment)
}

pub fn encode_delete_keys(keys: &[Vec<u8>]) -> Vec<u8> {
    DeleteKeysPb {
        keys: keys.to_vec(),
    }
    .encode_to_vec()
}

pub fn decode_delete_keys(payload: &[u8]) -> Result<Vec<Vec<u8>>> {
    Ok(DeleteKeysPb::decode(payload)?.keys)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn segment_round_trips_and_validates_shape() {
        let tmp = tempdir().expect("create tempdir");
        let segment = SegmentDataPb {
            keys: vec![b"k1".to_vec(), b"k2".to_vec()],
            values: vec![b"v1".to_vec(), b"v2".to_vec()],
        };
        write_segment_file(tmp.path(), "seg_1.dat", &segment).expect("write segment");
        assert_eq!(read_segment_file(tmp.path(), "seg_1.dat").expect("read"), segment);

        let bad = SegmentDataPb {
            keys: vec![b"k1".to_vec()],
            values: Vec::new(),
        };
        let err = write_segment_file(tmp.path(), "seg_2.dat", &bad).expect_err("bad shape");
        assert!(matches!(err, LakeError::InvalidArgument(_)));
    }

    #[test]
    fn delete_keys_round_trip() {
        let keys = vec![b"a".to_vec(), b"b".to_vec()];
        let decoded = decode_delete_keys(&encode_delete_keys(&keys)).expect("decode");
        assert_eq!(decoded, keys);
    }
}
