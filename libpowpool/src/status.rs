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

/*! The status channel between a batch server and its client.

A pair of named fifos carries single byte command codes in each
direction. Opening a fifo for reading blocks until a writer shows
up and vice versa, so the two sides open the two fifos in opposite
order: the server opens its write end first, the client its read
end first. Once both sides hold their descriptors the server
unlinks both names, so a crash of either peer leaves nothing in the
filesystem.

The reads and writes deliberately go through raw read(2)/write(2):
the server relies on a termination signal interrupting a blocked
read with EINTR, which the buffered std wrappers would retry away.
*/

use std::{
    fs,
    os::unix::io::AsRawFd,
    path::{Path, PathBuf},
};

use nix::{
    sys::stat::Mode,
    unistd::{self, Pid},
};

use crate::{
    error::{Error, Result},
    user,
};

pub const MSG_READ: u8 = b'r';
pub const MSG_WRITE: u8 = b'w';
pub const MSG_CONTINUE: u8 = b'c';
pub const MSG_QUIT: u8 = b'q';
pub const MSG_TERMINATE: u8 = b't';

/// The contract both channel roles obey: exactly one byte crosses
/// per call, and a call blocks until the peer is there.
pub trait BatchStatus {
    fn send(&mut self, msg: u8) -> Result<()>;
    fn receive(&mut self) -> Result<u8>;

    fn receive_expect(&mut self, expect: u8) -> Result<()> {
        let actual = self.receive()?;
        if actual != expect {
            return Err(Error::UnexpectedMessage { expected: expect, actual });
        }
        Ok(())
    }
}

pub fn in_fifo_path(fifo_prefix: &str, server_key: &str) -> PathBuf {
    PathBuf::from(format!("{fifo_prefix}{server_key}-in"))
}

pub fn out_fifo_path(fifo_prefix: &str, server_key: &str) -> PathBuf {
    PathBuf::from(format!("{fifo_prefix}{server_key}-out"))
}

/// The server side. Construction creates both fifos and hands their
/// ownership to the client so the unprivileged side may open them.
pub struct StatusServer {
    read_path: PathBuf,
    write_path: PathBuf,
    read_fifo: Option<fs::File>,
    write_fifo: Option<fs::File>,
}

impl StatusServer {
    pub fn new(client_pid: Pid, server_key: &str, fifo_prefix: &str) -> Result<StatusServer> {
        let read_path = in_fifo_path(fifo_prefix, server_key);
        let write_path = out_fifo_path(fifo_prefix, server_key);
        let uid = user::pid_to_uid(client_pid)?;
        let gid = user::pid_to_gid(client_pid)?;

        unistd::mkfifo(&read_path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(Error::sys("mkfifo(3)"))?;
        if let Err(err) = unistd::mkfifo(&write_path, Mode::S_IRUSR | Mode::S_IWUSR)
            .map_err(Error::sys("mkfifo(3)"))
        {
            let _ = fs::remove_file(&read_path);
            return Err(err);
        }

        for path in [&read_path, &write_path] {
            if let Err(err) =
                unistd::chown(path, Some(uid), Some(gid)).map_err(Error::sys("chown(2)"))
            {
                let _ = fs::remove_file(&read_path);
                let _ = fs::remove_file(&write_path);
                return Err(err);
            }
        }

        Ok(StatusServer { read_path, write_path, read_fifo: None, write_fifo: None })
    }

    // Lazy open on first use. The write end goes first: it blocks
    // until the client has opened its read end, after which the
    // read end open cannot block for long. Both names get unlinked
    // as soon as the descriptors exist.
    fn open_fifo(&mut self) -> Result<()> {
        if self.read_fifo.is_some() && self.write_fifo.is_some() {
            return Ok(());
        }
        let write_fifo = fs::OpenOptions::new()
            .write(true)
            .open(&self.write_path)
            .map_err(|e| Error::from_io("open(2)", e))?;
        let read_fifo = fs::OpenOptions::new()
            .read(true)
            .open(&self.read_path)
            .map_err(|e| Error::from_io("open(2)", e))?;
        for path in [&self.read_path, &self.write_path] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => return Err(Error::from_io("unlink(2)", err)),
            }
        }
        self.write_fifo = Some(write_fifo);
        self.read_fifo = Some(read_fifo);
        Ok(())
    }
}

impl BatchStatus for StatusServer {
    fn send(&mut self, msg: u8) -> Result<()> {
        self.open_fifo()?;
        write_byte(self.write_fifo.as_ref().unwrap(), msg)
    }

    fn receive(&mut self) -> Result<u8> {
        self.open_fifo()?;
        read_byte(self.read_fifo.as_ref().unwrap())
    }
}

impl Drop for StatusServer {
    fn drop(&mut self) {
        // Normally both names are gone by now; this covers a server
        // that dies before the client ever connected.
        let _ = fs::remove_file(&self.read_path);
        let _ = fs::remove_file(&self.write_path);
    }
}

/// The client side. Construction records the paths and nothing
/// else; the server is the one that makes and removes the fifos.
pub struct StatusClient {
    read_path: PathBuf,
    write_path: PathBuf,
    read_fifo: Option<fs::File>,
    write_fifo: Option<fs::File>,
}

impl StatusClient {
    pub fn new(server_key: &str, fifo_prefix: &str) -> StatusClient {
        StatusClient {
            read_path: out_fifo_path(fifo_prefix, server_key),
            write_path: in_fifo_path(fifo_prefix, server_key),
            read_fifo: None,
            write_fifo: None,
        }
    }

    // Mirror image of the server's open order.
    fn open_fifo(&mut self) -> Result<()> {
        if self.read_fifo.is_some() && self.write_fifo.is_some() {
            return Ok(());
        }
        let read_fifo = open_client_end(&self.read_path, false)?;
        let write_fifo = open_client_end(&self.write_path, true)?;
        self.read_fifo = Some(read_fifo);
        self.write_fifo = Some(write_fifo);
        Ok(())
    }
}

fn open_client_end(path: &Path, write: bool) -> Result<fs::File> {
    fs::OpenOptions::new().read(!write).write(write).open(path).map_err(|err| {
        if err.kind() == std::io::ErrorKind::NotFound {
            Error::NotFound(format!("status fifo {}", path.display()))
        } else {
            Error::from_io("open(2)", err)
        }
    })
}

impl BatchStatus for StatusClient {
    fn send(&mut self, msg: u8) -> Result<()> {
        self.open_fifo()?;
        write_byte(self.write_fifo.as_ref().unwrap(), msg)
    }

    fn receive(&mut self) -> Result<u8> {
        self.open_fifo()?;
        read_byte(self.read_fifo.as_ref().unwrap())
    }
}

fn write_byte(fifo: &fs::File, msg: u8) -> Result<()> {
    // Safety: pure ffi, the buffer outlives the call.
    let ret = unsafe {
        libc::write(fifo.as_raw_fd(), &msg as *const u8 as *const libc::c_void, 1)
    };
    if ret < 0 {
        return Err(Error::last_sys("write(2)"));
    }
    Ok(())
}

fn read_byte(fifo: &fs::File) -> Result<u8> {
    let mut buf = [0u8; 1];
    // Safety: pure ffi, the buffer outlives the call.
    let ret =
        unsafe { libc::read(fifo.as_raw_fd(), buf.as_mut_ptr() as *mut libc::c_void, 1) };
    if ret < 0 {
        return Err(Error::last_sys("read(2)"));
    }
    // A zero read means the peer closed its write end. Surfacing
    // byte zero lets the dispatch loop report the dead client.
    Ok(buf[0])
}
