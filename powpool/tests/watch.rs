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

use std::{fs, process::Command};

mod support;

#[test]
#[ntest::timeout(30000)]
fn watch_emits_monotonic_json_batches() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (config_path, _config) = support::write_config(&dir);
    let requests_path = dir.path().join("requests");
    fs::write(&requests_path, "TIME board 0\n").expect("writing request file");

    let output = Command::new(support::BIN)
        .arg("--config-file")
        .arg(&config_path)
        .args(["watch", "--count", "3", "--period", "0.05", "--json"])
        .arg(&requests_path)
        .output()
        .expect("running powpool watch");
    assert!(output.status.success(), "watch failed: {output:?}");

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut last = 0.0;
    let mut batches = 0;
    for line in stdout.lines() {
        let record: serde_json::Value = serde_json::from_str(line).expect("json batch line");
        let values = record["values"].as_array().expect("values array");
        assert_eq!(values.len(), 1);
        let time = values[0].as_f64().expect("numeric sample");
        assert!(time >= last);
        last = time;
        batches += 1;
    }
    assert_eq!(batches, 3);
    support::assert_no_leftover_names(&dir);
}

#[test]
fn watch_rejects_a_malformed_request_file() {
    let dir = tempfile::tempdir().expect("tmpdir");
    let (config_path, _config) = support::write_config(&dir);
    let requests_path = dir.path().join("requests");
    fs::write(&requests_path, "TIME nowhere 0\n").expect("writing request file");

    let output = Command::new(support::BIN)
        .arg("--config-file")
        .arg(&config_path)
        .args(["watch", "--count", "1"])
        .arg(&requests_path)
        .output()
        .expect("running powpool watch");
    assert!(!output.status.success());
}
