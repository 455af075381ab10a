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

use std::time;

// The shm and fifo path prefixes are part of the on-disk interface
// shared with clients, so they stay fixed even though the package
// name differs. Override them through the config file.
pub const SHMEM_PREFIX: &str = "/run/geopm/batch-buffer-";
pub const FIFO_PREFIX: &str = "/run/geopm-service/batch-status-";

pub const ATTACH_TIMEOUT: time::Duration = time::Duration::from_secs(1);
pub const ATTACH_POLL_DURATION: time::Duration = time::Duration::from_millis(10);

pub const WATCH_PERIOD: time::Duration = time::Duration::from_secs(1);

// Longest accepted signal or control name, one less than the
// filesystem NAME_MAX.
pub const NAME_MAX: usize = 255;
