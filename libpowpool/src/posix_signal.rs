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

/*! Thin wrappers over the POSIX realtime signal api.

The batch server's termination protocol rides on sigqueue(3) with an
integer payload, which the higher level signal crates don't expose,
so this module talks to libc directly. Every call that can fail
reports the underlying errno. `wait`, `wait_timeout` and `suspend`
are the only operations that block.
*/

use std::{mem, time::Duration};

use nix::unistd::Pid;
use tracing::warn;

use crate::error::{Error, Result};

/// The signature sigaction(2) expects for an SA_SIGINFO handler.
pub type Action = extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void);

/// A set of signal numbers in the kernel's representation.
#[derive(Clone, Copy)]
pub struct SigSet {
    raw: libc::sigset_t,
}

/// What a received signal carried, reduced to the fields the batch
/// protocol cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SigInfo {
    pub signo: i32,
    pub value: i32,
    pub sender_pid: i32,
}

impl SigInfo {
    fn reduce(info: &libc::siginfo_t) -> SigInfo {
        // Safety: si_value and si_pid are valid for queued signals,
        //         which is the only way these infos are produced.
        unsafe {
            SigInfo {
                signo: info.si_signo,
                value: info.si_value().sival_ptr as i32,
                sender_pid: info.si_pid(),
            }
        }
    }
}

pub fn make_sigset(signals: &[i32]) -> Result<SigSet> {
    // Safety: raw is a plain bitset, initialized by sigemptyset
    //         before any use.
    let mut raw: libc::sigset_t = unsafe { mem::zeroed() };
    check_return(unsafe { libc::sigemptyset(&mut raw) }, "sigemptyset(3)")?;
    for signo in signals {
        check_return(unsafe { libc::sigaddset(&mut raw, *signo) }, "sigaddset(3)")?;
    }
    Ok(SigSet { raw })
}

/// Block the given set on the calling thread. The returned guard
/// restores the previous mask when dropped.
pub fn block(set: &SigSet) -> Result<MaskGuard> {
    let mut prev: libc::sigset_t = unsafe { mem::zeroed() };
    // Safety: both sets are fully initialized sigset_t values.
    let err = unsafe { libc::pthread_sigmask(libc::SIG_BLOCK, &set.raw, &mut prev) };
    check_errnum(err, "pthread_sigmask(3)")?;
    Ok(MaskGuard { prev })
}

/// Unblock the given set on the calling thread.
pub fn unblock(set: &SigSet) -> Result<()> {
    // Safety: set.raw is a fully initialized sigset_t.
    let err =
        unsafe { libc::pthread_sigmask(libc::SIG_UNBLOCK, &set.raw, std::ptr::null_mut()) };
    check_errnum(err, "pthread_sigmask(3)")
}

pub struct MaskGuard {
    prev: libc::sigset_t,
}

impl Drop for MaskGuard {
    fn drop(&mut self) {
        // Safety: prev was produced by pthread_sigmask above.
        let err =
            unsafe { libc::pthread_sigmask(libc::SIG_SETMASK, &self.prev, std::ptr::null_mut()) };
        if err != 0 {
            warn!("failed to restore signal mask: {}", err);
        }
    }
}

/// Install an SA_SIGINFO action for a signal. SA_RESTART is left
/// off on purpose: a blocked read must fail with EINTR so the event
/// loop can observe the termination flag. The returned guard
/// restores the previous action when dropped.
pub fn install_action(signo: i32, handler: Action) -> Result<ActionGuard> {
    // Safety: sigaction is a plain C struct, all fields set below.
    let mut action: libc::sigaction = unsafe { mem::zeroed() };
    action.sa_mask = make_sigset(&[signo])?.raw;
    action.sa_flags = libc::SA_SIGINFO;
    action.sa_sigaction = handler as usize;
    let mut prev: libc::sigaction = unsafe { mem::zeroed() };
    check_return(
        // Safety: action is initialized, prev is written by the kernel.
        unsafe { libc::sigaction(signo, &action, &mut prev) },
        "sigaction(2)",
    )?;
    Ok(ActionGuard { signo, prev })
}

pub struct ActionGuard {
    signo: i32,
    prev: libc::sigaction,
}

impl Drop for ActionGuard {
    fn drop(&mut self) {
        // Safety: prev came out of sigaction(2) unmodified.
        let ret = unsafe { libc::sigaction(self.signo, &self.prev, std::ptr::null_mut()) };
        if ret == -1 {
            warn!("failed to restore action for signal {}: {}", self.signo, Error::last_sys("sigaction(2)"));
        }
    }
}

/// Queue a signal carrying an integer payload to a process.
pub fn queue(pid: Pid, signo: i32, value: i32) -> Result<()> {
    let payload = libc::sigval { sival_ptr: value as isize as *mut libc::c_void };
    // Safety: pure ffi, payload is a value type.
    check_return(unsafe { libc::sigqueue(pid.as_raw(), signo, payload) }, "sigqueue(3)")
}

/// Wait indefinitely for a signal in the set. The set must be
/// blocked on the calling thread or delivery may bypass the wait.
pub fn wait(set: &SigSet) -> Result<SigInfo> {
    // Safety: info is written by the kernel before it is read.
    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
    check_return(unsafe { libc::sigwaitinfo(&set.raw, &mut info) }, "sigwaitinfo(2)")?;
    Ok(SigInfo::reduce(&info))
}

/// As `wait`, but give up after the timeout with EAGAIN.
pub fn wait_timeout(set: &SigSet, timeout: Duration) -> Result<SigInfo> {
    let timeout = libc::timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    };
    // Safety: info is written by the kernel before it is read.
    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
    check_return(unsafe { libc::sigtimedwait(&set.raw, &mut info, &timeout) }, "sigtimedwait(2)")?;
    Ok(SigInfo::reduce(&info))
}

/// Replace the thread mask with the given one and sleep until a
/// signal outside of it is delivered. Returns Ok once the handler
/// has run.
pub fn suspend(mask: &SigSet) -> Result<()> {
    // Safety: mask.raw is a fully initialized sigset_t.
    unsafe { libc::sigsuspend(&mask.raw) };
    if nix::errno::Errno::last() != nix::errno::Errno::EINTR {
        return Err(Error::last_sys("sigsuspend(2)"));
    }
    nix::errno::Errno::clear();
    Ok(())
}

fn check_return(ret: libc::c_int, call: &'static str) -> Result<()> {
    if ret == -1 {
        return Err(Error::last_sys(call));
    }
    Ok(())
}

// The pthread calls hand back an error number instead of touching
// errno.
fn check_errnum(err: libc::c_int, call: &'static str) -> Result<()> {
    if err != 0 {
        return Err(Error::sys(call)(nix::errno::Errno::from_raw(err)));
    }
    Ok(())
}
