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

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::Path;

use crate::common::error::{LakeError, Result};

pub fn write_bytes(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| LakeError::Io(format!("create parent dir failed: {e}")))?;
    }
    fs::write(path, bytes)
        .map_err(|e| LakeError::Io(format!("write file failed: {}: {e}", path.display())))
}

/// Create-new write. `AlreadyExists` here is the compare-and-swap signal
/// the publish protocol relies on: exactly one writer of a given
/// metadata version succeeds, everyone else sees the existing file.
pub fn write_bytes_if_absent(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| LakeError::Io(format!("create parent dir failed: {e}")))?;
    }
    let mut file = match OpenOptions::new().write(true).create_new(true).open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
            return Err(LakeError::AlreadyExists(format!("{}", path.display())));
        }
        Err(e) => {
            return Err(LakeError::Io(format!(
                "create file failed: {}: {e}",
                path.display()
            )));
        }
    };
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|e| LakeError::Io(format!("write file failed: {}: {e}", path.display())))
}

pub fn read_bytes(path: &Path) -> Result<Vec<u8>> {
    match fs::read(path) {
        Ok(bytes) => Ok(bytes),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(LakeError::NotFound(format!("{}", path.display())))
        }
        Err(e) => Err(LakeError::Io(format!(
            "read file failed: {}: {e}",
            path.display()
        ))),
    }
}

pub fn delete_path_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(LakeError::Io(format!(
            "remove file failed: {}: {e}",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn write_if_absent_rejects_second_writer() {
        let tmp = tempdir().expect("create tempdir");
        let path = tmp.path().join("meta").join("a.meta");
        write_bytes_if_absent(&path, b"first").expect("first write");
        let err = write_bytes_if_absent(&path, b"second").expect_err("second write");
        assert!(err.is_already_exists(), "unexpected error: {err}");
        assert_eq!(read_bytes(&path).expect("read"), b"first");
    }

    #[test]
    fn read_missing_file_is_not_found() {
        let tmp = tempdir().expect("create tempdir");
        let err = read_bytes(&tmp.path().join("missing")).expect_err("read");
        assert!(err.is_not_found());
        delete_path_if_exists(&tmp.path().join("missing")).expect("idempotent delete");
    }
}
