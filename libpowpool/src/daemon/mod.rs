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

/*! The daemon side request surface for batch sessions.

The wider control plane (dbus or equivalent) is out of scope; what
lives here are the entry points it ultimately drives: start a batch
server for a client pid, stop one by pid, and the `powpool server`
command that does the same for a request list fed on stdin.
*/

use std::io::{self, Read};

use anyhow::{anyhow, Context};
use nix::unistd::{getpid, Pid};
use tracing::{info, instrument};

pub mod server;

pub use server::BatchServer;

use crate::{
    config::Config,
    error::Result,
    platform::{PlatformIO, SysfsPlatformIO},
    posix_signal,
    request::{self, Request},
    session::ServiceProxy,
    status,
};

/// Run a batch server for `client_pid`, with the signal and
/// control lists read from stdin in the read/write wire format.
/// Prints the server pid and key once the session is ready, then
/// lingers to reap the server process.
#[instrument(skip_all, fields(client_pid = client_pid))]
pub fn run_server(client_pid: i32, config: &Config) -> anyhow::Result<()> {
    let mut input = String::new();
    io::stdin().read_to_string(&mut input).context("reading request list from stdin")?;
    let (signal_config, control_config) =
        request::parse_rw_requests(&input).context("parsing request list")?;
    if signal_config.is_empty() && control_config.is_empty() {
        return Err(anyhow!("request list is empty"));
    }

    let mut platform = SysfsPlatformIO::new();
    let mut server = BatchServer::fork(
        Pid::from_raw(client_pid),
        signal_config,
        control_config,
        config,
        &mut platform,
    )
    .context("starting batch server")?;

    // The client watches for this line to know the buffers exist.
    println!("{} {}", server.server_pid(), server.server_key());

    let code = server.wait().context("waiting for batch server")?;
    if code != 0 {
        return Err(anyhow!("batch server exited with status {}", code));
    }
    Ok(())
}

/// Ask a running batch server to wind down. This is all the
/// daemon's stop entry point does; the server owns its teardown.
pub fn stop_server(server_pid: i32) -> anyhow::Result<()> {
    posix_signal::queue(
        Pid::from_raw(server_pid),
        libc::SIGTERM,
        status::MSG_TERMINATE as i32,
    )
    .context("queueing terminate to batch server")?;
    Ok(())
}

/// A control plane that forks batch servers in process, used when
/// the session layer and the privileged daemon are the same
/// process (single node tools, tests).
pub struct LocalService {
    config: Config,
    platform: Box<dyn PlatformIO>,
    servers: Vec<BatchServer>,
}

impl LocalService {
    pub fn new(config: Config, platform: Box<dyn PlatformIO>) -> LocalService {
        LocalService { config, platform, servers: Vec::new() }
    }
}

impl ServiceProxy for LocalService {
    fn start_batch(
        &mut self,
        signal_config: &[Request],
        control_config: &[Request],
    ) -> Result<(Pid, String)> {
        if self.config.session_save_restore() && !control_config.is_empty() {
            // The snapshotting itself belongs to the session
            // manager, which is not part of the batch layer.
            info!("session save/restore requested for {} controls", control_config.len());
        }
        let server = BatchServer::fork(
            getpid(),
            signal_config.to_vec(),
            control_config.to_vec(),
            &self.config,
            self.platform.as_mut(),
        )?;
        let result = (server.server_pid(), server.server_key().to_string());
        self.servers.push(server);
        Ok(result)
    }

    fn stop_batch(&mut self, server_pid: Pid) -> Result<()> {
        for server in self.servers.iter_mut() {
            if server.server_pid() == server_pid {
                server.stop()?;
            }
        }
        self.servers.retain(|server| server.server_pid() != server_pid);
        Ok(())
    }
}
