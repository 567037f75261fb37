//! Interruptible subprocess execution.
//!
//! Hybrid execution may need to abandon a background compile whose result
//! the interpreter has already made irrelevant.  An [`InterruptableJob`]
//! polls an eventfd (the interruption signal, writable from any thread)
//! together with a pidfd (child completion); whichever becomes readable
//! first decides the outcome.  On interruption the child's process group is
//! SIGKILLed and reaped.

use std::os::unix::process::CommandExt;
use std::process::Command;

use inkfuse_error::{InkFuseError, Result};

/// Outcome of waiting on an interruptible job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Change {
    Interrupted,
    JobDone,
}

/// Cancellation handle shared between the waiting thread and whoever may
/// want to interrupt it.
#[derive(Debug)]
pub struct InterruptableJob {
    fd_event: i32,
}

// The eventfd is safe to write from any thread.
unsafe impl Send for InterruptableJob {}
unsafe impl Sync for InterruptableJob {}

impl InterruptableJob {
    pub fn new() -> Result<InterruptableJob> {
        let fd_event = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK) };
        if fd_event == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        Ok(InterruptableJob { fd_event })
    }

    /// Signal interruption.  Interrupting a job that already completed is a
    /// no-op.
    pub fn interrupt(&self) {
        let update: u64 = 1;
        unsafe {
            libc::write(self.fd_event, std::ptr::addr_of!(update).cast(), 8);
        }
    }

    /// Block until either the child identified by `pid` exits or the job is
    /// interrupted.
    fn await_change(&self, pid: i32) -> Result<Change> {
        let fd_process = unsafe { libc::syscall(libc::SYS_pidfd_open, pid, 0) } as i32;
        if fd_process == -1 {
            return Err(std::io::Error::last_os_error().into());
        }
        let mut fds = [
            libc::pollfd {
                fd: self.fd_event,
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: fd_process,
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        let change = loop {
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), 2, -1) };
            if ready == -1 {
                let err = std::io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                unsafe { libc::close(fd_process) };
                return Err(err.into());
            }
            if fds[0].revents != 0 {
                break Change::Interrupted;
            }
            if fds[1].revents != 0 {
                break Change::JobDone;
            }
        };
        unsafe { libc::close(fd_process) };
        Ok(change)
    }

    /// Run `command` to completion under this job.
    ///
    /// Returns the exit code, or [`InkFuseError::Interrupted`] if the job
    /// was cancelled; the child's process group is killed and reaped before
    /// returning.
    pub fn run_command(&self, command: &mut Command) -> Result<i32> {
        // Own process group so an interrupt can kill compiler sub-processes
        // (cc forks cc1 and ld).
        command.process_group(0);
        let mut child = command.spawn()?;
        let pid = child.id() as i32;
        match self.await_change(pid)? {
            Change::Interrupted => {
                unsafe {
                    libc::kill(-pid, libc::SIGKILL);
                }
                let _ = child.wait();
                tracing::debug!(pid, "background job interrupted");
                Err(InkFuseError::Interrupted)
            }
            Change::JobDone => {
                let status = child.wait()?;
                Ok(status.code().unwrap_or(-1))
            }
        }
    }
}

impl Drop for InterruptableJob {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd_event);
        }
    }
}
