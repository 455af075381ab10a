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

/*! Error kinds for the batch protocol.

Most of the crate deals in these typed errors so that callers can
branch on what actually went wrong (a signal interrupting a blocked
read is routine during termination, a peer hangup ends the session,
and so on). The command entry points wrap them in `anyhow` for
reporting.
*/

use std::io;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// A bad argument: size mismatch, oversize name, malformed
    /// request line.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// A shared memory region or fifo could not be opened within
    /// the deadline.
    #[error("not found: {0}")]
    NotFound(String),

    /// A blocking syscall returned EINTR. Handled locally when a
    /// termination flag is set, propagated otherwise.
    #[error("interrupted: {0}")]
    Interrupted(Errno),

    /// The peer answered with the wrong status byte.
    #[error("expected status message {expected:#04x} but received {actual:#04x}")]
    UnexpectedMessage { expected: u8, actual: u8 },

    /// The status channel carried a byte outside the protocol set.
    #[error("received unknown status message: {0}")]
    UnknownMessage(u8),

    /// The other end of the session is gone.
    #[error("peer process is gone: {0}")]
    PeerGone(Errno),

    /// Any other syscall failure.
    #[error("system call {call} failed: {errno}")]
    System { call: &'static str, errno: Errno },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Classify an errno from a named syscall. EINTR and the
    /// peer-hangup errnos get their own kinds so that the event
    /// loop can tell a termination request from a dead client.
    pub fn sys(call: &'static str) -> impl FnOnce(Errno) -> Error {
        move |errno| match errno {
            Errno::EINTR => Error::Interrupted(errno),
            Errno::EPIPE | Errno::ECONNRESET => Error::PeerGone(errno),
            _ => Error::System { call, errno },
        }
    }

    /// Build an error from the calling thread's current errno.
    pub fn last_sys(call: &'static str) -> Error {
        Error::sys(call)(Errno::last())
    }

    pub fn from_io(call: &'static str, err: io::Error) -> Error {
        match err.raw_os_error() {
            Some(raw) => Error::sys(call)(Errno::from_raw(raw)),
            None => Error::System { call, errno: Errno::EIO },
        }
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, Error::Interrupted(_))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn errno_classification() {
        assert!(matches!(Error::sys("read(2)")(Errno::EINTR), Error::Interrupted(_)));
        assert!(matches!(Error::sys("write(2)")(Errno::EPIPE), Error::PeerGone(_)));
        assert!(matches!(
            Error::sys("open(2)")(Errno::EACCES),
            Error::System { call: "open(2)", errno: Errno::EACCES }
        ));
    }

    #[test]
    fn io_error_carries_errno() {
        let io_err = io::Error::from_raw_os_error(libc::ENOENT);
        match Error::from_io("open(2)", io_err) {
            Error::System { errno, .. } => assert_eq!(errno, Errno::ENOENT),
            other => panic!("unexpected error kind: {other:?}"),
        }
    }
}
