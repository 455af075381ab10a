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

/*! The unprivileged side of a batch session.

A client attaches to a running batch server by key and drives it
one transaction at a time: a read samples every configured signal
into the signal buffer, a write pushes every staged setting from
the control buffer into the hardware. Each transaction blocks until
the server acknowledges it, so a returned call means the hardware
side already happened.
*/

use std::time::Duration;

use crate::{
    config::Config,
    daemon::server,
    error::{Error, Result},
    shmem::SharedMemory,
    status::{self, BatchStatus, StatusClient},
};

pub struct BatchClient {
    num_signal: usize,
    num_control: usize,
    status: StatusClient,
    signal_shmem: Option<SharedMemory>,
    control_shmem: Option<SharedMemory>,
}

impl BatchClient {
    /// Attach to the server that was started for this client. The
    /// timeout bounds how long we poll for the buffers to appear.
    pub fn attach(
        server_key: &str,
        timeout: Duration,
        num_signal: usize,
        num_control: usize,
        config: &Config,
    ) -> Result<BatchClient> {
        let status = StatusClient::new(server_key, config.fifo_prefix());
        let signal_shmem = if num_signal == 0 {
            None
        } else {
            Some(SharedMemory::attach(
                server::signal_shmem_path(config.shmem_prefix(), server_key),
                num_signal * std::mem::size_of::<f64>(),
                false,
                timeout,
            )?)
        };
        let control_shmem = if num_control == 0 {
            None
        } else {
            Some(SharedMemory::attach(
                server::control_shmem_path(config.shmem_prefix(), server_key),
                num_control * std::mem::size_of::<f64>(),
                false,
                timeout,
            )?)
        };
        Ok(BatchClient { num_signal, num_control, status, signal_shmem, control_shmem })
    }

    /// Sample all configured signals. The returned vector is in
    /// push order. With no signals configured this is a no-op that
    /// touches neither the channel nor the buffers.
    pub fn read_batch(&mut self) -> Result<Vec<f64>> {
        if self.num_signal == 0 {
            return Ok(Vec::new());
        }
        self.status.send(status::MSG_READ)?;
        self.status.receive_expect(status::MSG_CONTINUE)?;
        let mut result = vec![0.0; self.num_signal];
        if let Some(region) = self.signal_shmem.as_ref() {
            region.copy_out_f64(&mut result)?;
        }
        Ok(result)
    }

    /// Apply all configured controls. `settings` must hold exactly
    /// one value per configured control, in push order. The length
    /// is validated before any channel traffic so a bad call cannot
    /// leave a half transaction behind.
    pub fn write_batch(&mut self, settings: &[f64]) -> Result<()> {
        if settings.len() != self.num_control {
            return Err(Error::Invalid(format!(
                "settings vector has length {} but {} controls are configured",
                settings.len(),
                self.num_control
            )));
        }
        if self.num_control == 0 {
            return Ok(());
        }
        if let Some(region) = self.control_shmem.as_mut() {
            region.copy_in_f64(settings)?;
        }
        self.status.send(status::MSG_WRITE)?;
        self.status.receive_expect(status::MSG_CONTINUE)?;
        Ok(())
    }

    /// End the session. Blocks until the server has acknowledged
    /// the quit, so the server side is fully drained on return.
    pub fn stop_batch(&mut self) -> Result<()> {
        self.status.send(status::MSG_QUIT)?;
        self.status.receive_expect(status::MSG_QUIT)?;
        Ok(())
    }
}
