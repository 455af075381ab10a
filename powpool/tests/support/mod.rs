// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::{fs, path::PathBuf};

use libpowpool::Config;

pub const BIN: &str = env!("CARGO_BIN_EXE_powpool");

/// Write a config that redirects all runtime names into the test's
/// own directory, and return it both as a file for the binary and
/// as a struct for in-process clients.
pub fn write_config(dir: &tempfile::TempDir) -> (PathBuf, Config) {
    let shmem_prefix = format!("{}/run/batch-buffer-", dir.path().display());
    let fifo_prefix = format!("{}/run/batch-status-", dir.path().display());
    let config_path = dir.path().join("config.toml");
    fs::write(
        &config_path,
        format!(
            "shmem_prefix = \"{shmem_prefix}\"\nfifo_prefix = \"{fifo_prefix}\"\nattach_timeout_seconds = 5.0\n"
        ),
    )
    .expect("writing test config");
    let config = Config {
        shmem_prefix: Some(shmem_prefix),
        fifo_prefix: Some(fifo_prefix),
        attach_timeout_seconds: Some(5.0),
        ..Default::default()
    };
    (config_path, config)
}

/// The runtime dir the config points all names at.
pub fn runtime_dir(dir: &tempfile::TempDir) -> PathBuf {
    dir.path().join("run")
}

pub fn assert_no_leftover_names(dir: &tempfile::TempDir) {
    let leftover: Vec<_> = fs::read_dir(runtime_dir(dir))
        .expect("read runtime dir")
        .map(|entry| entry.expect("dir entry").file_name())
        .collect();
    assert!(leftover.is_empty(), "names leaked: {leftover:?}");
}
