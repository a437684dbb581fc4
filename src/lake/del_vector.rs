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

use std::io::Cursor;

use roaring::RoaringBitmap;

use crate::common::error::{LakeError, Result};

const DELVEC_FORMAT_VERSION_V1: u8 = 0x01;
const CRC32C_MASK_DELTA: u32 = 0xa282_ead8;

/// Per-segment bitmap of deleted row ordinals at a given version.
/// A delvec is superseded by later versions, never mutated in place.
#[derive(Clone, Debug, Default)]
pub struct DelVector {
    version: i64,
    bitmap: RoaringBitmap,
}

impl DelVector {
    pub fn new(version: i64) -> Self {
        Self {
            version,
            bitmap: RoaringBitmap::new(),
        }
    }

    pub fn with_bitmap(version: i64, bitmap: RoaringBitmap) -> Self {
        Self { version, bitmap }
    }

    pub fn version(&self) -> i64 {
        self.version
    }

    pub fn cardinality(&self) -> u64 {
        self.bitmap.len()
    }

    pub fn contains(&self, row_id: u32) -> bool {
        self.bitmap.contains(row_id)
    }

    pub fn insert(&mut self, row_id: u32) {
        self.bitmap.insert(row_id);
    }

    pub fn merge(&mut self, other: &RoaringBitmap) {
        self.bitmap |= other;
    }

    pub fn bitmap(&self) -> &RoaringBitmap {
        &self.bitmap
    }

    /// v1 payload: one format byte followed by the roaring serialization.
    pub fn save_to(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.push(DELVEC_FORMAT_VERSION_V1);
        self.bitmap
            .serialize_into(&mut out)
            .map_err(|e| LakeError::Io(format!("serialize delvec bitmap failed: {e}")))?;
        Ok(out)
    }

    pub fn load(version: i64, payload: &[u8]) -> Result<Self> {
        if payload.is_empty() {
            return Err(LakeError::Corruption(format!(
                "invalid delvec payload (empty): version={version}"
            )));
        }
        if payload[0] != DELVEC_FORMAT_VERSION_V1 {
            return Err(LakeError::Corruption(format!(
                "invalid delvec payload format: version={version}, flag={}",
                payload[0]
            )));
        }
        if payload.len() == 1 {
            return Ok(Self::new(version));
        }
        let mut cursor = Cursor::new(&payload[1..]);
        let bitmap = RoaringBitmap::deserialize_from(&mut cursor).map_err(|e| {
            LakeError::Corruption(format!(
                "decode delvec roaring bitmap failed: version={version}, error={e}"
            ))
        })?;
        Ok(Self { version, bitmap })
    }
}

pub fn crc32c_mask(crc: u32) -> u32 {
    crc.rotate_left(17).wrapping_add(CRC32C_MASK_DELTA)
}

pub fn crc32c_unmask(masked: u32) -> u32 {
    masked.wrapping_sub(CRC32C_MASK_DELTA).rotate_right(17)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_keeps_deleted_rows() {
        let mut delvec = DelVector::new(3);
        delvec.insert(1);
        delvec.insert(7);
        delvec.insert(100_000);
        let payload = delvec.save_to().expect("save delvec");
        let loaded = DelVector::load(3, &payload).expect("load delvec");
        assert_eq!(loaded.version(), 3);
        assert_eq!(loaded.cardinality(), 3);
        assert!(loaded.contains(7));
        assert!(!loaded.contains(8));
    }

    #[test]
    fn load_rejects_unknown_format_flag() {
        let err = DelVector::load(1, &[0x7f, 0, 0]).expect_err("bad flag");
        assert!(matches!(err, LakeError::Corruption(_)));
        let err = DelVector::load(1, &[]).expect_err("empty");
        assert!(matches!(err, LakeError::Corruption(_)));
    }

    #[test]
    fn crc_mask_round_trips() {
        for crc in [0u32, 1, 0xdead_beef, u32::MAX] {
            assert_eq!(crc32c_unmask(crc32c_mask(crc)), crc);
        }
    }
}
