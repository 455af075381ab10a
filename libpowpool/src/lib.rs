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

/*! powpool: batch sampling of node power and performance telemetry.

A privileged daemon samples hardware signals and applies hardware
controls on behalf of unprivileged clients. Each client gets a
dedicated batch server process, a pair of shared memory buffers
and a pair of status fifos; the session's controls are restored
when the session ends.
*/

use std::{fs, io, sync::Mutex};

use anyhow::anyhow;
use clap::{Parser, Subcommand};
use tracing::error;
use tracing_subscriber::fmt::format::FmtSpan;

pub mod client;
pub mod config;
pub mod consts;
pub mod daemon;
pub mod error;
pub mod platform;
pub mod posix_signal;
pub mod request;
pub mod session;
pub mod shmem;
pub mod status;
pub mod topo;
pub mod user;
mod watch;

pub use client::BatchClient;
pub use config::Config;
pub use daemon::{BatchServer, LocalService};
pub use error::Error;
pub use request::Request;
pub use session::{ServiceProxy, Session};

/// The command line arguments that powpool expects. These can be
/// directly parsed with clap or manually constructed in order to
/// present some other user interface.
///
/// NOTE: You must check `version()` and handle it yourself if it
/// is set. Clap won't do a good job with its automatic version
/// support for a library.
#[derive(Parser, Debug)]
#[clap(author, about)]
pub struct Args {
    #[clap(
        short,
        long,
        action,
        long_help = "The file to write logs to

In most modes logs are discarded by default, but if powpool is
running a batch server, the logs will go to stderr by default."
    )]
    pub log_file: Option<String>,

    #[clap(
        short,
        long,
        action = clap::ArgAction::Count,
        help = "Show more in logs, may be provided multiple times",
    )]
    pub verbose: u8,

    #[clap(short, long, action, help = "a toml file containing configuration")]
    pub config_file: Option<String>,

    #[clap(subcommand)]
    pub command: Commands,
}

/// The subcommands that powpool supports.
#[derive(Subcommand, Debug)]
pub enum Commands {
    #[clap(about = "Print version")]
    Version,

    #[clap(about = "Runs a batch server for a client process

The signal and control request list is read from stdin, one request
per line in the form 'read|write <name> <domain-type> <domain-idx>',
terminated by an empty line or end of file. Once the session
resources exist, the server pid and server key are printed on
stdout for the client to pick up.")]
    Server {
        #[clap(long, help = "The pid of the client process the session belongs to")]
        client_pid: i32,
    },

    #[clap(about = "Samples a request list periodically until interrupted")]
    Watch {
        #[clap(long, help = "Seconds between batches, fractional allowed")]
        period: Option<f64>,
        #[clap(long, help = "Stop after this many batches")]
        count: Option<u64>,
        #[clap(long, help = "Emit one json object per batch instead of columns")]
        json: bool,
        #[clap(help = "A file with one '<name> <domain-name> <domain-idx>' request per line")]
        requests: String,
    },

    #[clap(about = "Asks a running batch server to wind down")]
    Stop {
        #[clap(long, help = "The pid of the batch server process")]
        server_pid: i32,
    },
}

impl Args {
    /// Version indicates if the wrapping binary must display the
    /// version then exit.
    pub fn version(&self) -> bool {
        matches!(self.command, Commands::Version)
    }
}

/// Run the powpool tool with the given arguments.
pub fn run(args: Args) -> anyhow::Result<()> {
    let trace_level = if args.verbose == 0 {
        tracing::Level::INFO
    } else if args.verbose == 1 {
        tracing::Level::DEBUG
    } else {
        tracing::Level::TRACE
    };
    if let Some(log_file) = args.log_file.clone() {
        let file = fs::File::create(log_file)?;
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(Mutex::new(file))
            .init();
    } else if let Commands::Server { .. } = args.command {
        tracing_subscriber::fmt()
            .with_max_level(trace_level)
            .with_thread_ids(true)
            .with_target(false)
            .with_span_events(FmtSpan::NEW | FmtSpan::CLOSE)
            .with_writer(io::stderr)
            .init();
    }

    let config = config::read_config(&args.config_file)?;

    let res: anyhow::Result<()> = match args.command {
        Commands::Version => return Err(anyhow!("wrapper binary must handle version")),
        Commands::Server { client_pid } => daemon::run_server(client_pid, &config),
        Commands::Watch { period, count, json, requests } => {
            watch::run(&requests, period, count, json, config)
        }
        Commands::Stop { server_pid } => daemon::stop_server(server_pid),
    };

    if let Err(err) = res {
        error!("{:?}", err);
        std::process::exit(1);
    }

    Ok(())
}
