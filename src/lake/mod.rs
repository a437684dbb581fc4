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

//! Lake tablet core: immutable versioned metadata snapshots, txn logs
//! as the unit of pending change, and a publish protocol that applies
//! logs to produce the next version. Primary-key tablets additionally
//! maintain delete vectors and an in-memory key index.

pub mod del_vector;
pub mod delta_writer;
pub mod io;
pub mod layout;
pub mod meta_file;
pub mod metadata;
pub mod pk_index;
pub mod segment;
pub mod tablet_manager;
pub mod txn_log;

pub use delta_writer::DeltaWriter;
pub use tablet_manager::TabletManager;
