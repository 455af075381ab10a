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

/*! The consumer facing session layer.

A `Session` accumulates signal and control requests and only forks
a batch server on the first actual read or write, through whatever
control plane stands behind the `ServiceProxy` seam. Once the
server is running the request lists are frozen for its lifetime.

Settings for the next write batch live in a local buffer that
starts out as NaN sentinels; samples from the last read batch live
in a local buffer refreshed by `read_batch`.
*/

use nix::unistd::Pid;
use tracing::warn;

use crate::{
    client::BatchClient,
    config::Config,
    consts,
    error::{Error, Result},
    request::Request,
};

/// The control plane used to start and stop batch servers on this
/// client's behalf. In production this is the privileged daemon's
/// request surface; tests substitute their own.
pub trait ServiceProxy {
    /// Start a batch server for the calling process and return its
    /// pid and key.
    fn start_batch(
        &mut self,
        signal_config: &[Request],
        control_config: &[Request],
    ) -> Result<(Pid, String)>;

    /// Tear down a batch server previously started through this
    /// proxy.
    fn stop_batch(&mut self, server_pid: Pid) -> Result<()>;
}

pub struct Session {
    proxy: Box<dyn ServiceProxy>,
    config: Config,
    signal_requests: Vec<Request>,
    control_requests: Vec<Request>,
    client: Option<BatchClient>,
    server_pid: Option<Pid>,
    samples: Vec<f64>,
    settings: Vec<f64>,
}

impl Session {
    pub fn new(proxy: Box<dyn ServiceProxy>, config: Config) -> Session {
        Session {
            proxy,
            config,
            signal_requests: Vec::new(),
            control_requests: Vec::new(),
            client: None,
            server_pid: None,
            samples: Vec::new(),
            settings: Vec::new(),
        }
    }

    /// Add a signal to the session. Returns the handle to sample
    /// it by. Fails once the server has started.
    pub fn push_signal(&mut self, name: &str, domain_type: i32, domain_idx: i32) -> Result<i32> {
        self.check_push(name, domain_idx)?;
        self.signal_requests.push(Request {
            name: name.to_string(),
            domain_type,
            domain_idx,
        });
        Ok(self.signal_requests.len() as i32 - 1)
    }

    /// Add a control to the session. Returns the handle to adjust
    /// it by. Fails once the server has started.
    pub fn push_control(&mut self, name: &str, domain_type: i32, domain_idx: i32) -> Result<i32> {
        self.check_push(name, domain_idx)?;
        self.control_requests.push(Request {
            name: name.to_string(),
            domain_type,
            domain_idx,
        });
        Ok(self.control_requests.len() as i32 - 1)
    }

    fn check_push(&self, name: &str, domain_idx: i32) -> Result<()> {
        if self.client.is_some() {
            return Err(Error::Invalid(
                "cannot push requests once the batch session is started".to_string(),
            ));
        }
        if name.len() >= consts::NAME_MAX {
            return Err(Error::Invalid(format!("request name {name} is too long")));
        }
        if domain_idx < 0 {
            return Err(Error::Invalid(format!("negative domain index for {name}")));
        }
        Ok(())
    }

    // Fork the server on first use. No fork happens and no shared
    // memory exists until some batch io is requested.
    fn start_if_needed(&mut self) -> Result<()> {
        if self.client.is_some()
            || (self.signal_requests.is_empty() && self.control_requests.is_empty())
        {
            return Ok(());
        }
        let (server_pid, server_key) =
            self.proxy.start_batch(&self.signal_requests, &self.control_requests)?;
        self.server_pid = Some(server_pid);
        self.client = Some(BatchClient::attach(
            &server_key,
            self.config.attach_timeout(),
            self.signal_requests.len(),
            self.control_requests.len(),
            &self.config,
        )?);
        self.settings = vec![f64::NAN; self.control_requests.len()];
        Ok(())
    }

    /// Sample every pushed signal into the local buffer.
    pub fn read_batch(&mut self) -> Result<()> {
        self.start_if_needed()?;
        if let Some(client) = self.client.as_mut() {
            if !self.signal_requests.is_empty() {
                self.samples = client.read_batch()?;
            }
        }
        Ok(())
    }

    /// The value of a pushed signal as of the last `read_batch`.
    pub fn sample(&self, handle: i32) -> Result<f64> {
        if self.signal_requests.is_empty() {
            return Err(Error::Invalid(
                "sample() called prior to any calls to push_signal()".to_string(),
            ));
        }
        if self.samples.is_empty() {
            return Err(Error::Invalid(
                "sample() called prior to any calls to read_batch()".to_string(),
            ));
        }
        self.samples
            .get(handle as usize)
            .copied()
            .ok_or_else(|| Error::Invalid(format!("unknown signal handle {handle}")))
    }

    /// Stage a setting for a pushed control.
    pub fn adjust(&mut self, handle: i32, setting: f64) -> Result<()> {
        if self.control_requests.is_empty() {
            return Err(Error::Invalid(
                "adjust() called prior to any calls to push_control()".to_string(),
            ));
        }
        self.start_if_needed()?;
        let slot = self
            .settings
            .get_mut(handle as usize)
            .ok_or_else(|| Error::Invalid(format!("unknown control handle {handle}")))?;
        *slot = setting;
        Ok(())
    }

    /// Flush all staged settings to the hardware.
    pub fn write_batch(&mut self) -> Result<()> {
        if let Some(client) = self.client.as_mut() {
            if !self.control_requests.is_empty() {
                client.write_batch(&self.settings)?;
            }
        }
        Ok(())
    }

    /// Drain and tear down the batch session. A session that never
    /// did any io has nothing to tear down.
    pub fn stop(&mut self) -> Result<()> {
        if let Some(client) = self.client.as_mut() {
            client.stop_batch()?;
        }
        self.client = None;
        if let Some(server_pid) = self.server_pid.take() {
            self.proxy.stop_batch(server_pid)?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if self.client.is_some() || self.server_pid.is_some() {
            if let Err(err) = self.stop() {
                warn!("failed to stop batch session on drop: {}", err);
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    // A proxy that refuses to start anything, for exercising the
    // lazy paths that must not reach the control plane.
    struct PanickingProxy;

    impl ServiceProxy for PanickingProxy {
        fn start_batch(
            &mut self,
            _signal_config: &[Request],
            _control_config: &[Request],
        ) -> Result<(Pid, String)> {
            panic!("start_batch must not be called");
        }

        fn stop_batch(&mut self, _server_pid: Pid) -> Result<()> {
            panic!("stop_batch must not be called");
        }
    }

    #[test]
    fn no_requests_means_no_server() {
        let mut session = Session::new(Box::new(PanickingProxy), Config::default());
        session.read_batch().expect("empty read");
        session.write_batch().expect("empty write");
        session.stop().expect("stop");
    }

    #[test]
    fn push_handles_count_up_per_kind() {
        let mut session = Session::new(Box::new(PanickingProxy), Config::default());
        assert_eq!(session.push_signal("TIME", 0, 0).expect("push"), 0);
        assert_eq!(session.push_signal("BOARD_ENERGY", 0, 0).expect("push"), 1);
        assert_eq!(session.push_control("POWER_LIMIT", 0, 0).expect("push"), 0);
    }

    #[test]
    fn push_validation() {
        let mut session = Session::new(Box::new(PanickingProxy), Config::default());
        let long_name = "Y".repeat(consts::NAME_MAX);
        assert!(matches!(session.push_signal(&long_name, 0, 0), Err(Error::Invalid(_))));
        assert!(matches!(session.push_signal("TIME", 0, -1), Err(Error::Invalid(_))));
    }

    #[test]
    fn sample_without_read_is_invalid() {
        let mut session = Session::new(Box::new(PanickingProxy), Config::default());
        assert!(matches!(session.sample(0), Err(Error::Invalid(_))));
        session.push_signal("TIME", 0, 0).expect("push");
        assert!(matches!(session.sample(0), Err(Error::Invalid(_))));
    }

    #[test]
    fn adjust_without_push_is_invalid() {
        let mut session = Session::new(Box::new(PanickingProxy), Config::default());
        assert!(matches!(session.adjust(0, 1.0), Err(Error::Invalid(_))));
    }
}
