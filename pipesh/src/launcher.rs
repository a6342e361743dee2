//! Process creation for a single pipeline stage.
//!
//! [`StageSpawner`] is the seam between the coordinator and the host OS. The
//! real implementation, [`ForkSpawner`], forks, rewires stdin/stdout with
//! `dup2` and `execvp`s the program. Everything the child touches between
//! `fork` and `exec` is prepared in the parent first, so the child only makes
//! async-signal-safe calls.

use std::ffi::{c_char, CString};
use std::os::fd::{AsRawFd, BorrowedFd, RawFd};
use std::ptr;

use nix::errno::Errno;
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{close, dup2, fork, ForkResult, Pid};
use tracing::debug;

use crate::error::{ExecError, Result};
use crate::pipeline::Stage;
use crate::stage_io::StageIo;
use crate::FAILURE_STATUS;

/// Exit status of a child whose program is not on `PATH`.
pub const EXIT_NOT_FOUND: i32 = 127;
/// Exit status of a child whose program exists but could not be executed.
pub const EXIT_CANNOT_EXECUTE: i32 = 126;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageExit {
    Exited(i32),
    Signaled(i32),
}

impl StageExit {
    /// Shell status: the exit code, or [`FAILURE_STATUS`] after a signal.
    pub fn status(self) -> i32 {
        match self {
            StageExit::Exited(code) => code,
            StageExit::Signaled(_) => FAILURE_STATUS,
        }
    }
}

/// Starts and reaps the process behind one stage.
pub trait StageSpawner {
    type Handle;

    /// Starts `stage` with the resolved descriptors.
    ///
    /// `io` is consumed: once the child holds its own copies the parent's are
    /// closed. `downstream` is the read end this stage's output pipe retains
    /// for the next stage; the child must not keep it open.
    fn spawn(
        &mut self,
        index: usize,
        stage: &Stage,
        io: StageIo,
        downstream: Option<BorrowedFd<'_>>,
    ) -> Result<Self::Handle>;

    /// Blocks until the process behind `handle` terminates.
    fn wait(&mut self, index: usize, handle: Self::Handle) -> Result<StageExit>;
}

/// Spawner backed by `fork(2)` and `execvp(3)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ForkSpawner;

/// Everything the forked child needs, built before the fork.
struct ChildPlan {
    // owns the strings `argv_ptrs` points into
    _argv: Vec<CString>,
    /// NULL-terminated, ready for `execvp(3)`.
    argv_ptrs: Vec<*const c_char>,
    stdin: Option<RawFd>,
    stdout: Option<RawFd>,
    downstream: Option<RawFd>,
    not_found: Vec<u8>,
    exec_failed: Vec<u8>,
}

impl ChildPlan {
    fn new(index: usize, stage: &Stage, io: &StageIo, downstream: Option<BorrowedFd<'_>>) -> Result<Self> {
        if stage.argv().is_empty() {
            return Err(ExecError::EmptyArgv { stage: index });
        }
        let argv = stage.c_argv().map_err(|arg| ExecError::NulInArgument { stage: index, arg })?;
        let argv_ptrs = argv.iter().map(|a| a.as_ptr()).chain([ptr::null()]).collect();
        let program = stage.program();
        Ok(ChildPlan {
            _argv: argv,
            argv_ptrs,
            stdin: io.stdin.raw(),
            stdout: io.stdout.raw(),
            downstream: downstream.map(|fd| fd.as_raw_fd()),
            not_found: format!("pipesh: command not found: {program}\n").into_bytes(),
            exec_failed: format!("pipesh: {program}: ").into_bytes(),
        })
    }

    /// Runs in the child. Never returns.
    fn exec(&self) -> ! {
        // Rust ignores SIGPIPE at startup and ignored signals survive exec.
        unsafe { libc::signal(libc::SIGPIPE, libc::SIG_DFL) };

        if let Some(fd) = self.downstream {
            let _ = close(fd);
        }
        for (fd, target) in [(self.stdin, libc::STDIN_FILENO), (self.stdout, libc::STDOUT_FILENO)] {
            let Some(fd) = fd else { continue };
            if fd == target {
                continue;
            }
            if let Err(errno) = dup2(fd, target) {
                self.fail(errno, EXIT_CANNOT_EXECUTE);
            }
            let _ = close(fd);
        }

        // only returns on failure
        unsafe { libc::execvp(self.argv_ptrs[0], self.argv_ptrs.as_ptr()) };
        let errno = Errno::last();
        if errno == Errno::ENOENT {
            let _ = write_all_fd(libc::STDERR_FILENO, &self.not_found);
            unsafe { libc::_exit(EXIT_NOT_FOUND) }
        }
        self.fail(errno, EXIT_CANNOT_EXECUTE)
    }

    fn fail(&self, errno: Errno, code: i32) -> ! {
        let _ = write_all_fd(libc::STDERR_FILENO, &self.exec_failed);
        let _ = write_all_fd(libc::STDERR_FILENO, errno.desc().as_bytes());
        let _ = write_all_fd(libc::STDERR_FILENO, b"\n");
        unsafe { libc::_exit(code) }
    }
}

impl StageSpawner for ForkSpawner {
    type Handle = Pid;

    fn spawn(
        &mut self,
        index: usize,
        stage: &Stage,
        io: StageIo,
        downstream: Option<BorrowedFd<'_>>,
    ) -> Result<Pid> {
        let plan = ChildPlan::new(index, stage, &io, downstream)?;
        // SAFETY: the child branch only runs ChildPlan::exec, which sticks to
        // async-signal-safe calls on memory allocated before the fork.
        match unsafe { fork() } {
            Ok(ForkResult::Child) => plan.exec(),
            Ok(ForkResult::Parent { child }) => {
                debug!(
                    stage = index,
                    pid = child.as_raw(),
                    program = stage.program(),
                    stdin = ?plan.stdin,
                    stdout = ?plan.stdout,
                    "spawned stage"
                );
                // the child has its own copies now
                drop(io);
                Ok(child)
            }
            Err(source) => Err(ExecError::Fork { stage: index, source }),
        }
    }

    fn wait(&mut self, index: usize, pid: Pid) -> Result<StageExit> {
        loop {
            match waitpid(pid, None) {
                Ok(WaitStatus::Exited(_, code)) => return Ok(StageExit::Exited(code)),
                Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(StageExit::Signaled(signal as i32)),
                Ok(_) | Err(Errno::EINTR) => continue,
                Err(source) => return Err(ExecError::Wait { stage: index, source }),
            }
        }
    }
}

fn write_all_fd(fd: RawFd, mut buf: &[u8]) -> nix::Result<()> {
    while !buf.is_empty() {
        let rc = unsafe { libc::write(fd, buf.as_ptr() as *const _, buf.len()) };
        if rc < 0 {
            let errno = Errno::last();
            if errno == Errno::EINTR {
                continue;
            }
            return Err(errno);
        }
        if rc == 0 {
            return Err(Errno::EIO);
        }
        buf = &buf[rc as usize..];
    }
    Ok(())
}
