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

use nix::{
    sys::stat,
    unistd::{Gid, Pid, Uid},
};

use crate::error::{Error, Result};

/// Resolve the real uid of a running process by stating its proc
/// entry. The server uses this to hand fifo and shm ownership to
/// the client.
pub fn pid_to_uid(pid: Pid) -> Result<Uid> {
    let info = stat_proc(pid)?;
    Ok(Uid::from_raw(info.st_uid))
}

/// Resolve the real gid of a running process.
pub fn pid_to_gid(pid: Pid) -> Result<Gid> {
    let info = stat_proc(pid)?;
    Ok(Gid::from_raw(info.st_gid))
}

fn stat_proc(pid: Pid) -> Result<stat::FileStat> {
    let path = format!("/proc/{pid}");
    stat::stat(path.as_str()).map_err(|errno| match errno {
        nix::errno::Errno::ENOENT => Error::NotFound(format!("no such process: {pid}")),
        errno => Error::sys("stat(2)")(errno),
    })
}
