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

/*! Named shared memory regions backed by files on a tmpfs.

The batch buffers live under a path prefix on a tmpfs (by default
/run/geopm), so a region is an ordinary file that gets mapped
MAP_SHARED by both the server and the client. The creating side
owns the region exclusively; the attaching side holds a borrowed
mapping that is released on drop. The filesystem name is a third,
independent resource: either side may unlink it and the mappings
stay alive.

A region can optionally embed a process shared mutex in a header
ahead of the payload. The batch buffers do not use it (every
visibility transition there is gated by a fifo syscall), but other
shared regions in the service do.
*/

use std::{
    fs,
    os::unix::{fs::OpenOptionsExt, io::AsRawFd},
    path::{Path, PathBuf},
    ptr, slice, thread,
    time::{Duration, Instant},
};

use byteorder::{ByteOrder, LittleEndian};
use nix::unistd::{self, Gid, Uid};
use tracing::warn;

use crate::{consts, error::{Error, Result}};

// One cache line, comfortably larger than a pthread_mutex_t.
const LOCK_SIZE: usize = 64;

pub struct SharedMemory {
    path: PathBuf,
    base: *mut u8,
    map_size: usize,
    size: usize,
    has_lock: bool,
    is_owner: bool,
    is_linked: bool,
}

// The raw base pointer keeps this from deriving Send. Regions move
// between threads in the daemon but are only touched by one process
// side at a time per the batch protocol.
unsafe impl Send for SharedMemory {}

impl SharedMemory {
    /// Create a new region of `size` payload bytes. Fails if the
    /// path already exists. Mode bits grant read and write to the
    /// creating uid only.
    pub fn create<P: AsRef<Path>>(path: P, size: usize, with_lock: bool) -> Result<SharedMemory> {
        let path = path.as_ref().to_path_buf();
        if size == 0 {
            return Err(Error::Invalid(format!(
                "refusing to create empty shared memory region {}",
                path.display()
            )));
        }
        let map_size = size + if with_lock { LOCK_SIZE } else { 0 };
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|err| {
                if err.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::Invalid(format!(
                        "shared memory region {} already exists",
                        path.display()
                    ))
                } else {
                    Error::from_io("open(2)", err)
                }
            })?;
        match Self::map_new(&file, map_size, with_lock) {
            Ok(base) => Ok(SharedMemory {
                path,
                base,
                map_size,
                size,
                has_lock: with_lock,
                is_owner: true,
                is_linked: true,
            }),
            Err(err) => {
                // Nothing may be left behind on a failed construction.
                let _ = fs::remove_file(&path);
                Err(err)
            }
        }
    }

    /// Attach to an existing region, polling until it shows up with
    /// its full size or the deadline expires.
    pub fn attach<P: AsRef<Path>>(
        path: P,
        size: usize,
        with_lock: bool,
        timeout: Duration,
    ) -> Result<SharedMemory> {
        let path = path.as_ref().to_path_buf();
        let map_size = size + if with_lock { LOCK_SIZE } else { 0 };
        let deadline = Instant::now() + timeout;
        let file = loop {
            match fs::OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => {
                    // The creator sizes the file right after the
                    // exclusive open, so a short file just means we
                    // raced it.
                    let len = file.metadata().map_err(|e| Error::from_io("fstat(2)", e))?.len();
                    if len as usize >= map_size {
                        break file;
                    }
                    if Instant::now() >= deadline {
                        return Err(Error::Invalid(format!(
                            "shared memory region {} has size {} but {} is needed",
                            path.display(),
                            len,
                            map_size
                        )));
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    if Instant::now() >= deadline {
                        return Err(Error::NotFound(format!(
                            "shared memory region {}",
                            path.display()
                        )));
                    }
                }
                Err(err) => return Err(Error::from_io("open(2)", err)),
            }
            thread::sleep(consts::ATTACH_POLL_DURATION);
        };
        let base = Self::map(&file, map_size)?;
        Ok(SharedMemory {
            path,
            base,
            map_size,
            size,
            has_lock: with_lock,
            is_owner: false,
            is_linked: true,
        })
    }

    fn map_new(file: &fs::File, map_size: usize, with_lock: bool) -> Result<*mut u8> {
        file.set_len(map_size as u64).map_err(|e| Error::from_io("ftruncate(2)", e))?;
        let base = Self::map(file, map_size)?;
        if with_lock {
            // Safety: the mapping starts with LOCK_SIZE private
            //         bytes reserved for the mutex.
            unsafe {
                let mut attr: libc::pthread_mutexattr_t = std::mem::zeroed();
                check_errnum(libc::pthread_mutexattr_init(&mut attr), "pthread_mutexattr_init(3)")?;
                check_errnum(
                    libc::pthread_mutexattr_setpshared(&mut attr, libc::PTHREAD_PROCESS_SHARED),
                    "pthread_mutexattr_setpshared(3)",
                )?;
                check_errnum(
                    libc::pthread_mutexattr_settype(&mut attr, libc::PTHREAD_MUTEX_ERRORCHECK),
                    "pthread_mutexattr_settype(3)",
                )?;
                check_errnum(
                    libc::pthread_mutex_init(base as *mut libc::pthread_mutex_t, &attr),
                    "pthread_mutex_init(3)",
                )?;
                libc::pthread_mutexattr_destroy(&mut attr);
            }
        }
        Ok(base)
    }

    fn map(file: &fs::File, map_size: usize) -> Result<*mut u8> {
        // Safety: pure ffi, the fd stays open for the whole call and
        //         map_size is nonzero.
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                map_size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::last_sys("mmap(2)"));
        }
        Ok(base as *mut u8)
    }

    /// The payload buffer, past the lock header when one exists.
    pub fn pointer(&self) -> *mut u8 {
        if self.has_lock {
            // Safety: the mapping is LOCK_SIZE + size bytes long.
            unsafe { self.base.add(LOCK_SIZE) }
        } else {
            self.base
        }
    }

    /// Payload size in bytes. The lock header is not counted.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn key(&self) -> &Path {
        &self.path
    }

    /// Remove the filesystem name while keeping the mapping alive.
    /// Calling this twice is a no-op, as is racing the peer for it.
    pub fn unlink(&mut self) -> Result<()> {
        if !self.is_linked {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                self.is_linked = false;
                Ok(())
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                self.is_linked = false;
                Ok(())
            }
            Err(err) => Err(Error::from_io("unlink(2)", err)),
        }
    }

    /// Hand ownership of the region to another user, so that an
    /// unprivileged client may attach to a region the privileged
    /// daemon created.
    pub fn chown(&self, uid: Uid, gid: Gid) -> Result<()> {
        unistd::chown(&self.path, Some(uid), Some(gid)).map_err(Error::sys("chown(2)"))
    }

    /// Take the embedded process shared mutex. The guard releases
    /// it on drop, including on panic paths.
    pub fn scoped_lock(&self) -> Result<ScopedLock<'_>> {
        if !self.has_lock {
            return Err(Error::Invalid(format!(
                "shared memory region {} has no lock",
                self.path.display()
            )));
        }
        let mutex = self.base as *mut libc::pthread_mutex_t;
        // Safety: the lock header was initialized by the creator
        //         before the region became attachable.
        check_errnum(unsafe { libc::pthread_mutex_lock(mutex) }, "pthread_mutex_lock(3)")?;
        Ok(ScopedLock { mutex, _region: std::marker::PhantomData })
    }

    /// Store one little endian binary64 slot.
    pub fn write_f64(&mut self, slot: usize, value: f64) -> Result<()> {
        let bytes = self.slot_bytes_mut(slot)?;
        LittleEndian::write_f64(bytes, value);
        Ok(())
    }

    /// Load one little endian binary64 slot.
    pub fn read_f64(&self, slot: usize) -> Result<f64> {
        let bytes = self.slot_bytes(slot)?;
        Ok(LittleEndian::read_f64(bytes))
    }

    /// Fill the leading slots of the region from `src`.
    pub fn copy_in_f64(&mut self, src: &[f64]) -> Result<()> {
        let len = src.len() * std::mem::size_of::<f64>();
        if len > self.size {
            return Err(Error::Invalid(format!(
                "{} settings do not fit in a {} byte region",
                src.len(),
                self.size
            )));
        }
        // Safety: pointer() is valid for size bytes and len is
        //         bounded by the check above.
        let bytes = unsafe { slice::from_raw_parts_mut(self.pointer(), len) };
        LittleEndian::write_f64_into(src, bytes);
        Ok(())
    }

    /// Read the leading slots of the region into `dst`.
    pub fn copy_out_f64(&self, dst: &mut [f64]) -> Result<()> {
        let len = dst.len() * std::mem::size_of::<f64>();
        if len > self.size {
            return Err(Error::Invalid(format!(
                "{} samples cannot come out of a {} byte region",
                dst.len(),
                self.size
            )));
        }
        // Safety: pointer() is valid for size bytes and len is
        //         bounded by the check above.
        let bytes = unsafe { slice::from_raw_parts(self.pointer(), len) };
        LittleEndian::read_f64_into(bytes, dst);
        Ok(())
    }

    fn slot_bytes(&self, slot: usize) -> Result<&[u8]> {
        let offset = self.slot_offset(slot)?;
        // Safety: offset + 8 is within the payload per slot_offset.
        Ok(unsafe { slice::from_raw_parts(self.pointer().add(offset), 8) })
    }

    fn slot_bytes_mut(&mut self, slot: usize) -> Result<&mut [u8]> {
        let offset = self.slot_offset(slot)?;
        // Safety: offset + 8 is within the payload per slot_offset.
        Ok(unsafe { slice::from_raw_parts_mut(self.pointer().add(offset), 8) })
    }

    fn slot_offset(&self, slot: usize) -> Result<usize> {
        let offset = slot * std::mem::size_of::<f64>();
        if offset + std::mem::size_of::<f64>() > self.size {
            return Err(Error::Invalid(format!(
                "slot {} is out of range for a {} byte region",
                slot, self.size
            )));
        }
        Ok(offset)
    }
}

impl Drop for SharedMemory {
    fn drop(&mut self) {
        if self.is_owner && self.is_linked {
            if let Err(err) = self.unlink() {
                warn!("failed to unlink shared memory region on drop: {}", err);
            }
        }
        // Safety: base and map_size came out of mmap unmodified.
        let ret = unsafe { libc::munmap(self.base as *mut libc::c_void, self.map_size) };
        if ret == -1 {
            warn!(
                "failed to unmap shared memory region {}: {}",
                self.path.display(),
                Error::last_sys("munmap(2)")
            );
        }
    }
}

pub struct ScopedLock<'a> {
    mutex: *mut libc::pthread_mutex_t,
    _region: std::marker::PhantomData<&'a SharedMemory>,
}

impl Drop for ScopedLock<'_> {
    fn drop(&mut self) {
        // Safety: the guard holds the lock it is releasing.
        let err = unsafe { libc::pthread_mutex_unlock(self.mutex) };
        if err != 0 {
            warn!("failed to unlock shared memory region: error {}", err);
        }
    }
}

fn check_errnum(err: libc::c_int, call: &'static str) -> Result<()> {
    if err != 0 {
        return Err(Error::sys(call)(nix::errno::Errno::from_raw(err)));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use std::os::unix::fs::MetadataExt;

    use super::*;

    #[test]
    fn create_attach_round_trip() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("batch-buffer-101-signal");

        let mut owner = SharedMemory::create(&path, 24, false).expect("create");
        assert_eq!(owner.size(), 24);
        assert_eq!(owner.key(), path);
        assert_eq!(fs::metadata(&path).expect("stat").len(), 24);
        owner.write_f64(0, 1.5).expect("write");
        owner.write_f64(1, -2.5).expect("write");
        owner.write_f64(2, f64::NAN).expect("write");

        let user =
            SharedMemory::attach(&path, 24, false, Duration::from_secs(1)).expect("attach");
        let mut values = [0.0; 3];
        user.copy_out_f64(&mut values).expect("copy out");
        assert_eq!(values[0], 1.5);
        assert_eq!(values[1], -2.5);
        assert!(values[2].is_nan());
        assert_eq!(user.read_f64(1).expect("read"), -2.5);
    }

    #[test]
    fn mode_is_owner_only() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("region");
        let _region = SharedMemory::create(&path, 8, false).expect("create");
        let mode = fs::metadata(&path).expect("stat").mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[test]
    fn create_fails_if_name_exists() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("region");
        let _region = SharedMemory::create(&path, 8, false).expect("create");
        assert!(matches!(SharedMemory::create(&path, 8, false), Err(Error::Invalid(_))));
    }

    #[test]
    fn unlink_is_idempotent_and_keeps_mapping() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("region");
        let mut region = SharedMemory::create(&path, 16, false).expect("create");
        region.unlink().expect("first unlink");
        assert!(!path.exists());
        region.unlink().expect("second unlink");
        // mapping survives the name
        region.write_f64(1, 7.25).expect("write after unlink");
        assert_eq!(region.read_f64(1).expect("read after unlink"), 7.25);
    }

    #[test]
    fn attach_times_out_with_not_found() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("missing");
        let start = Instant::now();
        let result = SharedMemory::attach(&path, 8, false, Duration::from_millis(50));
        assert!(matches!(result, Err(Error::NotFound(_))));
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn chown_to_self_is_allowed() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("region");
        let region = SharedMemory::create(&path, 8, false).expect("create");
        region.chown(unistd::getuid(), unistd::getgid()).expect("chown");
    }

    #[test]
    fn lock_header_is_not_payload() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("locked");
        let mut region = SharedMemory::create(&path, 24, true).expect("create");
        assert_eq!(region.size(), 24);
        assert_eq!(fs::metadata(&path).expect("stat").len() as usize, 24 + LOCK_SIZE);
        region.write_f64(0, 3.0).expect("write");
        {
            let _guard = region.scoped_lock().expect("lock");
        }
        // the drop released it, so it can be taken again
        let _guard = region.scoped_lock().expect("relock");
        assert_eq!(region.read_f64(0).expect("read"), 3.0);
    }

    #[test]
    fn out_of_range_slot_is_invalid() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("region");
        let mut region = SharedMemory::create(&path, 16, false).expect("create");
        assert!(matches!(region.write_f64(2, 0.0), Err(Error::Invalid(_))));
        assert!(matches!(region.read_f64(2), Err(Error::Invalid(_))));
        let mut too_many = [0.0; 3];
        assert!(matches!(region.copy_out_f64(&mut too_many), Err(Error::Invalid(_))));
    }
}
