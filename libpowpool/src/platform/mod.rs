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

use crate::error::Result;

mod sysfs;

pub use sysfs::SysfsPlatformIO;

/// The hardware access layer the batch server drives.
///
/// A request is pushed once at server startup and yields an opaque
/// handle; afterwards a batch is one `read_batch` followed by a
/// `sample` per signal handle, or one `adjust` per control handle
/// followed by a `write_batch`. Implementations are not expected to
/// be thread safe; the server calls them from a single event loop.
pub trait PlatformIO {
    /// Register a signal to be sampled. May fail if the signal is
    /// not supported on this node.
    fn push_signal(&mut self, name: &str, domain_type: i32, domain_idx: i32) -> Result<i32>;

    /// Register a control to be adjusted. May fail if the control
    /// is not supported on this node.
    fn push_control(&mut self, name: &str, domain_type: i32, domain_idx: i32) -> Result<i32>;

    /// Sample all pushed signals into an internal cache.
    fn read_batch(&mut self) -> Result<()>;

    /// The cached value for a pushed signal, in SI units. NaN when
    /// the signal could not be read.
    fn sample(&mut self, handle: i32) -> Result<f64>;

    /// Stage a setting for a pushed control.
    fn adjust(&mut self, handle: i32, setting: f64) -> Result<()>;

    /// Commit all staged settings to the hardware.
    fn write_batch(&mut self) -> Result<()>;
}
