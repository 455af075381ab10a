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

/*! The per-session batch server.

`BatchServer::fork` runs in the privileged daemon. It creates the
shared memory buffers and status fifos for one client, hands their
ownership to the client's uid, and forks a child that services the
client's read and write requests against the platform until the
client quits or the daemon queues a termination signal.

The parent keeps a handle used to stop the server and to guarantee
that no names survive the session, whatever way it ends.
*/

use std::{
    fs,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicU32, Ordering},
};

use nix::{
    errno::Errno,
    sys::wait::{waitpid, WaitStatus},
    unistd::{self, ForkResult, Pid},
};
use tracing::{error, info, warn};

use crate::{
    config::Config,
    error::{Error, Result},
    platform::PlatformIO,
    posix_signal,
    request::Request,
    shmem::SharedMemory,
    status::{self, BatchStatus, StatusServer},
    user,
};

// Bumped by the handler when the daemon queues a termination
// request at us. Observed at the top of every event loop turn.
static TERM_COUNT: AtomicU32 = AtomicU32::new(0);

extern "C" fn action_terminate(
    _signo: libc::c_int,
    info: *mut libc::siginfo_t,
    _context: *mut libc::c_void,
) {
    if info.is_null() {
        return;
    }
    // Safety: the action is installed with SA_SIGINFO, so info
    //         points at a populated siginfo record.
    let value = unsafe { (*info).si_value().sival_ptr as i32 };
    // A plain SIGTERM from elsewhere does not count, only the
    // tagged one the daemon queues.
    if value == status::MSG_TERMINATE as i32 {
        TERM_COUNT.fetch_add(1, Ordering::Relaxed);
    }
}

pub fn signal_shmem_path(shmem_prefix: &str, server_key: &str) -> PathBuf {
    PathBuf::from(format!("{shmem_prefix}{server_key}-signal"))
}

pub fn control_shmem_path(shmem_prefix: &str, server_key: &str) -> PathBuf {
    PathBuf::from(format!("{shmem_prefix}{server_key}-control"))
}

pub struct BatchServer {
    server_pid: Pid,
    server_key: String,
    signal_shmem: Option<SharedMemory>,
    control_shmem: Option<SharedMemory>,
    // Held so that the fifo names get a final cleanup attempt if
    // the child died before the client ever opened them.
    _status: StatusServer,
    active: bool,
}

impl BatchServer {
    /// Set up buffers and fifos for `client_pid` and fork the
    /// server process. Returns once the child is servicing the
    /// session; the child itself never returns from here.
    pub fn fork(
        client_pid: Pid,
        signal_config: Vec<Request>,
        control_config: Vec<Request>,
        config: &Config,
        platform: &mut dyn PlatformIO,
    ) -> Result<BatchServer> {
        let server_key = client_pid.to_string();
        ensure_prefix_dirs(config)?;

        TERM_COUNT.store(0, Ordering::Relaxed);
        let _action = posix_signal::install_action(libc::SIGTERM, action_terminate)?;

        let uid = user::pid_to_uid(client_pid)?;
        let gid = user::pid_to_gid(client_pid)?;
        let make_region = |path: PathBuf, count: usize| -> Result<Option<SharedMemory>> {
            if count == 0 {
                return Ok(None);
            }
            let region = SharedMemory::create(path, count * std::mem::size_of::<f64>(), false)?;
            region.chown(uid, gid)?;
            Ok(Some(region))
        };
        let signal_shmem = make_region(
            signal_shmem_path(config.shmem_prefix(), &server_key),
            signal_config.len(),
        )?;
        let control_shmem = make_region(
            control_shmem_path(config.shmem_prefix(), &server_key),
            control_config.len(),
        )?;

        let status = StatusServer::new(client_pid, &server_key, config.fifo_prefix())?;

        // Safety: the child only runs the single threaded event
        //         loop and leaves through process::exit.
        match unsafe { unistd::fork() }.map_err(Error::sys("fork(2)"))? {
            ForkResult::Child => {
                let mut worker = BatchWorker {
                    client_pid,
                    signal_config,
                    control_config,
                    signal_handle: Vec::new(),
                    control_handle: Vec::new(),
                    signal_shmem,
                    control_shmem,
                    status,
                    platform,
                    client_attached: false,
                    client_waiting: false,
                };
                let code = match worker.push_requests().and_then(|()| worker.run()) {
                    Ok(()) => 0,
                    Err(err) => {
                        error!("batch server for client {} failed: {}", client_pid, err);
                        1
                    }
                };
                // Exit without unwinding into the daemon's stack.
                process::exit(code);
            }
            ForkResult::Parent { child } => {
                info!("forked batch server {} for client {}", child, client_pid);
                Ok(BatchServer {
                    server_pid: child,
                    server_key,
                    signal_shmem,
                    control_shmem,
                    _status: status,
                    active: true,
                })
            }
        }
        // The parent's previous SIGTERM action comes back when
        // _action drops; the child keeps the termination handler.
    }

    pub fn server_pid(&self) -> Pid {
        self.server_pid
    }

    pub fn server_key(&self) -> &str {
        &self.server_key
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Ask the server process to wind down and reap it. Safe to
    /// call after the client already quit the session.
    pub fn stop(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        match posix_signal::queue(self.server_pid, libc::SIGTERM, status::MSG_TERMINATE as i32) {
            Ok(()) => {}
            // Already exited, all that is left is the reaping.
            Err(Error::System { errno: Errno::ESRCH, .. }) => {}
            Err(err) => return Err(err),
        }
        self.wait().map(|_| ())
    }

    /// Block until the server process exits and return its status.
    pub fn wait(&mut self) -> Result<i32> {
        let status = waitpid(self.server_pid, None).map_err(Error::sys("waitpid(2)"))?;
        self.active = false;
        match status {
            WaitStatus::Exited(pid, code) => {
                info!("batch server {} exited with status {}", pid, code);
                Ok(code)
            }
            WaitStatus::Signaled(pid, signal, _) => {
                warn!("batch server {} killed by signal {:?}", pid, signal);
                Ok(128 + signal as i32)
            }
            status => {
                warn!("batch server {} in unexpected state {:?}", self.server_pid, status);
                Ok(1)
            }
        }
    }
}

impl Drop for BatchServer {
    fn drop(&mut self) {
        for region in [&mut self.signal_shmem, &mut self.control_shmem].into_iter().flatten() {
            if let Err(err) = region.unlink() {
                warn!("failed to unlink batch buffer on teardown: {}", err);
            }
        }
    }
}

fn ensure_prefix_dirs(config: &Config) -> Result<()> {
    for prefix in [config.shmem_prefix(), config.fifo_prefix()] {
        if let Some(parent) = Path::new(prefix).parent() {
            fs::create_dir_all(parent).map_err(|e| Error::from_io("mkdir(2)", e))?;
        }
    }
    Ok(())
}

// The child side of the fork: the request/response event loop run
// against the platform and the shared buffers.
struct BatchWorker<'a> {
    client_pid: Pid,
    signal_config: Vec<Request>,
    control_config: Vec<Request>,
    signal_handle: Vec<i32>,
    control_handle: Vec<i32>,
    signal_shmem: Option<SharedMemory>,
    control_shmem: Option<SharedMemory>,
    status: StatusServer,
    platform: &'a mut dyn PlatformIO,
    client_attached: bool,
    client_waiting: bool,
}

impl BatchWorker<'_> {
    fn push_requests(&mut self) -> Result<()> {
        for request in &self.signal_config {
            self.signal_handle.push(self.platform.push_signal(
                &request.name,
                request.domain_type,
                request.domain_idx,
            )?);
        }
        for request in &self.control_config {
            self.control_handle.push(self.platform.push_control(
                &request.name,
                request.domain_type,
                request.domain_idx,
            )?);
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let result = self.event_loop();
        if let Err(err) = result {
            if self.client_waiting {
                // Do not leave the client blocked on its fifo read.
                warn!(
                    "batch server terminated while client {} was waiting, sending quit",
                    self.client_pid
                );
                if let Err(send_err) = self.status.send(status::MSG_QUIT) {
                    warn!("failed to send quit to waiting client: {}", send_err);
                }
                self.client_waiting = false;
            } else if matches!(err, Error::UnknownMessage(0)) {
                warn!(
                    "batch client {} exited while server {} was waiting",
                    self.client_pid,
                    unistd::getpid()
                );
            }
            return Err(err);
        }
        Ok(())
    }

    fn event_loop(&mut self) -> Result<()> {
        let mut out_message = status::MSG_CONTINUE;
        while out_message == status::MSG_CONTINUE && TERM_COUNT.load(Ordering::Relaxed) == 0 {
            let in_message = self.read_message()?;
            match in_message {
                status::MSG_READ => {
                    self.client_waiting = true;
                    self.read_and_update()?;
                }
                status::MSG_WRITE => {
                    self.client_waiting = true;
                    self.update_and_write()?;
                }
                status::MSG_QUIT => {
                    self.client_waiting = true;
                    out_message = status::MSG_QUIT;
                }
                status::MSG_TERMINATE => {
                    out_message = status::MSG_TERMINATE;
                }
                unknown => return Err(Error::UnknownMessage(unknown)),
            }
            // A terminate came from the daemon, not the client, so
            // there is nobody to answer.
            if in_message != status::MSG_TERMINATE {
                self.write_message(out_message)?;
            }
        }
        Ok(())
    }

    fn read_message(&mut self) -> Result<u8> {
        let message = match self.status.receive() {
            Ok(message) => message,
            Err(err) if err.is_interrupted() && TERM_COUNT.load(Ordering::Relaxed) > 0 => {
                status::MSG_TERMINATE
            }
            Err(err) => return Err(err),
        };
        if !self.client_attached {
            // The client holds its mappings now, so the names have
            // done their job. Removing them here covers a server
            // that later dies without a clean teardown.
            if let Some(region) = self.signal_shmem.as_mut() {
                region.unlink()?;
            }
            if let Some(region) = self.control_shmem.as_mut() {
                region.unlink()?;
            }
            self.client_attached = true;
        }
        Ok(message)
    }

    fn write_message(&mut self, message: u8) -> Result<()> {
        match self.status.send(message) {
            Ok(()) => {
                self.client_waiting = false;
                Ok(())
            }
            Err(err) if err.is_interrupted() && TERM_COUNT.load(Ordering::Relaxed) > 0 => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn read_and_update(&mut self) -> Result<()> {
        if self.signal_config.is_empty() {
            return Ok(());
        }
        self.platform.read_batch()?;
        let region = match self.signal_shmem.as_mut() {
            Some(region) => region,
            None => return Ok(()),
        };
        for (slot, handle) in self.signal_handle.iter().enumerate() {
            let sample = self.platform.sample(*handle)?;
            region.write_f64(slot, sample)?;
        }
        Ok(())
    }

    fn update_and_write(&mut self) -> Result<()> {
        if self.control_config.is_empty() {
            return Ok(());
        }
        let region = match self.control_shmem.as_ref() {
            Some(region) => region,
            None => return Ok(()),
        };
        for (slot, handle) in self.control_handle.iter().enumerate() {
            let setting = region.read_f64(slot)?;
            self.platform.adjust(*handle, setting)?;
        }
        self.platform.write_batch()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use nix::unistd::getpid;

    use super::*;
    use crate::status::StatusClient;

    #[derive(Default)]
    struct RecordingPlatform {
        pushed_signals: Vec<(String, i32, i32)>,
        pushed_controls: Vec<(String, i32, i32)>,
        adjustments: Vec<(i32, f64)>,
        read_batches: usize,
        write_batches: usize,
        fail_read_batch: bool,
    }

    impl PlatformIO for RecordingPlatform {
        fn push_signal(&mut self, name: &str, domain_type: i32, domain_idx: i32) -> Result<i32> {
            self.pushed_signals.push((name.to_string(), domain_type, domain_idx));
            Ok(self.pushed_signals.len() as i32 - 1)
        }

        fn push_control(&mut self, name: &str, domain_type: i32, domain_idx: i32) -> Result<i32> {
            self.pushed_controls.push((name.to_string(), domain_type, domain_idx));
            Ok(self.pushed_controls.len() as i32 - 1)
        }

        fn read_batch(&mut self) -> Result<()> {
            if self.fail_read_batch {
                return Err(Error::System {
                    call: "pread(2)",
                    errno: nix::errno::Errno::EIO,
                });
            }
            self.read_batches += 1;
            Ok(())
        }

        fn sample(&mut self, handle: i32) -> Result<f64> {
            // A value that encodes both the batch and the handle so
            // ordering mistakes show up in assertions.
            Ok(self.read_batches as f64 * 100.0 + handle as f64)
        }

        fn adjust(&mut self, handle: i32, setting: f64) -> Result<()> {
            self.adjustments.push((handle, setting));
            Ok(())
        }

        fn write_batch(&mut self) -> Result<()> {
            self.write_batches += 1;
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        shmem_prefix: String,
        fifo_prefix: String,
        key: &'static str,
    }

    impl Harness {
        fn new(key: &'static str) -> Harness {
            let dir = tempfile::tempdir().expect("tmpdir");
            let shmem_prefix = format!("{}/batch-buffer-", dir.path().display());
            let fifo_prefix = format!("{}/batch-status-", dir.path().display());
            Harness { _dir: dir, shmem_prefix, fifo_prefix, key }
        }

        fn request(name: &str) -> Request {
            Request { name: name.to_string(), domain_type: 0, domain_idx: 0 }
        }

        // Run a worker on its own thread, as the fork child would,
        // and hand back the recorded platform activity.
        fn spawn_worker(
            &self,
            signal_config: Vec<Request>,
            control_config: Vec<Request>,
            platform: RecordingPlatform,
        ) -> thread::JoinHandle<(RecordingPlatform, Result<()>)> {
            let signal_shmem = if signal_config.is_empty() {
                None
            } else {
                Some(
                    SharedMemory::create(
                        signal_shmem_path(&self.shmem_prefix, self.key),
                        signal_config.len() * 8,
                        false,
                    )
                    .expect("signal shmem"),
                )
            };
            let control_shmem = if control_config.is_empty() {
                None
            } else {
                Some(
                    SharedMemory::create(
                        control_shmem_path(&self.shmem_prefix, self.key),
                        control_config.len() * 8,
                        false,
                    )
                    .expect("control shmem"),
                )
            };
            let status =
                StatusServer::new(getpid(), self.key, &self.fifo_prefix).expect("status server");
            thread::spawn(move || {
                let mut platform = platform;
                let result = {
                    let mut worker = BatchWorker {
                        client_pid: getpid(),
                        signal_config,
                        control_config,
                        signal_handle: Vec::new(),
                        control_handle: Vec::new(),
                        signal_shmem,
                        control_shmem,
                        status,
                        platform: &mut platform,
                        client_attached: false,
                        client_waiting: false,
                    };
                    worker.push_requests().and_then(|()| worker.run())
                };
                (platform, result)
            })
        }

        fn client(&self) -> StatusClient {
            StatusClient::new(self.key, &self.fifo_prefix)
        }
    }

    #[test]
    #[ntest::timeout(10000)]
    fn read_transactions_fill_slots_in_order() {
        let harness = Harness::new("t-read");
        let worker = harness.spawn_worker(
            vec![Harness::request("SIG_A"), Harness::request("SIG_B")],
            vec![],
            RecordingPlatform::default(),
        );

        let shm_path = signal_shmem_path(&harness.shmem_prefix, harness.key);
        let mut client = harness.client();
        let shmem = SharedMemory::attach(&shm_path, 16, false, std::time::Duration::from_secs(1))
            .expect("attach");

        client.send(status::MSG_READ).expect("send r");
        client.receive_expect(status::MSG_CONTINUE).expect("continue");
        let mut samples = [0.0; 2];
        shmem.copy_out_f64(&mut samples).expect("copy out");
        assert_eq!(samples, [100.0, 101.0]);

        // buffer names must be gone once the first request landed
        assert!(!shm_path.exists());

        client.send(status::MSG_READ).expect("send r");
        client.receive_expect(status::MSG_CONTINUE).expect("continue");
        shmem.copy_out_f64(&mut samples).expect("copy out");
        assert_eq!(samples, [200.0, 201.0]);

        client.send(status::MSG_QUIT).expect("send q");
        client.receive_expect(status::MSG_QUIT).expect("quit ack");

        let (platform, result) = worker.join().expect("worker");
        result.expect("worker result");
        assert_eq!(platform.read_batches, 2);
        assert_eq!(platform.pushed_signals.len(), 2);
        assert!(platform.adjustments.is_empty());
    }

    #[test]
    #[ntest::timeout(10000)]
    fn write_transaction_adjusts_all_controls() {
        let harness = Harness::new("t-write");
        let worker = harness.spawn_worker(
            vec![],
            vec![Harness::request("POWER_LIMIT")],
            RecordingPlatform::default(),
        );

        let shm_path = control_shmem_path(&harness.shmem_prefix, harness.key);
        let mut client = harness.client();
        let mut shmem =
            SharedMemory::attach(&shm_path, 8, false, std::time::Duration::from_secs(1))
                .expect("attach");
        shmem.copy_in_f64(&[215.0]).expect("copy in");
        client.send(status::MSG_WRITE).expect("send w");
        client.receive_expect(status::MSG_CONTINUE).expect("continue");
        client.send(status::MSG_QUIT).expect("send q");
        client.receive_expect(status::MSG_QUIT).expect("quit ack");

        let (platform, result) = worker.join().expect("worker");
        result.expect("worker result");
        assert_eq!(platform.adjustments, vec![(0, 215.0)]);
        assert_eq!(platform.write_batches, 1);
        assert_eq!(platform.read_batches, 0);
    }

    #[test]
    #[ntest::timeout(10000)]
    fn empty_signal_config_still_continues() {
        let harness = Harness::new("t-empty");
        let worker = harness.spawn_worker(
            vec![],
            vec![Harness::request("POWER_LIMIT")],
            RecordingPlatform::default(),
        );

        let mut client = harness.client();
        client.send(status::MSG_READ).expect("send r");
        client.receive_expect(status::MSG_CONTINUE).expect("continue");
        client.send(status::MSG_QUIT).expect("send q");
        client.receive_expect(status::MSG_QUIT).expect("quit ack");

        let (platform, result) = worker.join().expect("worker");
        result.expect("worker result");
        assert_eq!(platform.read_batches, 0);
    }

    #[test]
    #[ntest::timeout(10000)]
    fn unknown_byte_fails_and_unlinks() {
        let harness = Harness::new("t-unknown");
        let worker = harness.spawn_worker(
            vec![Harness::request("SIG_A")],
            vec![],
            RecordingPlatform::default(),
        );

        let mut client = harness.client();
        client.send(0x00).expect("send bogus");

        let (_platform, result) = worker.join().expect("worker");
        match result {
            Err(Error::UnknownMessage(0)) => {}
            other => panic!("expected unknown message, got {other:?}"),
        }
        assert!(!signal_shmem_path(&harness.shmem_prefix, harness.key).exists());
        assert!(!status::in_fifo_path(&harness.fifo_prefix, harness.key).exists());
        assert!(!status::out_fifo_path(&harness.fifo_prefix, harness.key).exists());
    }

    #[test]
    #[ntest::timeout(10000)]
    fn platform_failure_relieves_waiting_client() {
        let harness = Harness::new("t-fail");
        let platform = RecordingPlatform { fail_read_batch: true, ..Default::default() };
        let worker =
            harness.spawn_worker(vec![Harness::request("SIG_A")], vec![], platform);

        let mut client = harness.client();
        client.send(status::MSG_READ).expect("send r");
        // The server could not service the read; the relief byte
        // shows up as a quit instead of the expected continue.
        match client.receive_expect(status::MSG_CONTINUE) {
            Err(Error::UnexpectedMessage { actual, .. }) => {
                assert_eq!(actual, status::MSG_QUIT);
            }
            other => panic!("expected relief quit, got {other:?}"),
        }

        let (_platform, result) = worker.join().expect("worker");
        assert!(matches!(result, Err(Error::System { .. })));
    }
}
