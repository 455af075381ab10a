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

/*! The `powpool watch` command.

Reads a request file, runs a batch session against a locally forked
server and prints one line of samples per period until interrupted
or a batch count is reached.
*/

use std::{
    fs,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};

use anyhow::{bail, Context};
use serde_derive::Serialize;
use signal_hook::{consts::TERM_SIGNALS, flag};

use crate::{
    config::Config,
    consts,
    daemon::LocalService,
    platform::SysfsPlatformIO,
    request,
    session::Session,
};

#[derive(Serialize)]
struct BatchRecord {
    time: String,
    values: Vec<f64>,
}

pub fn run(
    requests_path: &str,
    period: Option<f64>,
    count: Option<u64>,
    json: bool,
    config: Config,
) -> anyhow::Result<()> {
    let text = fs::read_to_string(requests_path)
        .with_context(|| format!("reading request file {requests_path}"))?;
    let requests = request::parse_requests(&text).context("parsing request file")?;
    if requests.is_empty() {
        bail!("no requests in {}", requests_path);
    }
    let period = period.map(Duration::from_secs_f64).unwrap_or(consts::WATCH_PERIOD);

    let service = LocalService::new(config.clone(), Box::new(SysfsPlatformIO::new()));
    let mut session = Session::new(Box::new(service), config);
    let mut handles = Vec::with_capacity(requests.len());
    for request in &requests {
        handles.push(
            session
                .push_signal(&request.name, request.domain_type, request.domain_idx)
                .with_context(|| format!("pushing request {}", request.name))?,
        );
    }

    // This sets us up to shutdown immediately if someone mashes ^C
    // so we don't get stuck attempting a graceful shutdown.
    let stop = Arc::new(AtomicBool::new(false));
    for sig in TERM_SIGNALS {
        flag::register_conditional_shutdown(*sig, 1, Arc::clone(&stop))
            .context("registering shutdown handler")?;
        flag::register(*sig, Arc::clone(&stop)).context("registering shutdown flag")?;
    }

    if !json {
        let names: Vec<&str> = requests.iter().map(|r| r.name.as_str()).collect();
        println!("time {}", names.join(" "));
    }

    let mut remaining = count;
    while !stop.load(Ordering::Relaxed) {
        session.read_batch().context("sampling batch")?;
        let values = handles
            .iter()
            .map(|handle| session.sample(*handle))
            .collect::<crate::error::Result<Vec<f64>>>()
            .context("collecting samples")?;
        let time = chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f").to_string();
        if json {
            println!("{}", serde_json::to_string(&BatchRecord { time, values })?);
        } else {
            let formatted: Vec<String> = values.iter().map(|v| format!("{v:.6}")).collect();
            println!("{} {}", time, formatted.join(" "));
        }
        if let Some(remaining) = remaining.as_mut() {
            *remaining -= 1;
            if *remaining == 0 {
                break;
            }
        }
        thread::sleep(period);
    }

    session.stop().context("stopping batch session")?;
    Ok(())
}
