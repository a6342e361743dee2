//! Per-stage descriptor resolution.
//!
//! Every descriptor produced here is an [`OwnedFd`], so it is closed exactly
//! once when its owner drops it. The coordinator moves a stage's
//! [`StageIo`] into the spawner, which drops it in the parent right after the
//! fork; the read end of an outgoing pipe comes back separately as
//! [`ResolvedIo::downstream`] and becomes the next stage's upstream.

use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::pipe;
use tracing::debug;

use crate::error::{ExecError, Result};
use crate::pipeline::{OutputMode, Stage};

const OUTPUT_FILE_MODE: u32 = 0o644;

/// One direction of a stage's standard I/O.
#[derive(Debug)]
pub enum StageFd {
    /// Keep whatever the shell itself has on that stream.
    Inherit,
    /// An end of a pipe shared with a neighbouring stage.
    Pipe(OwnedFd),
    /// A redirection file.
    File(OwnedFd),
}

impl StageFd {
    /// Descriptor to `dup2` in the child, `None` when inherited.
    pub fn raw(&self) -> Option<RawFd> {
        match self {
            StageFd::Inherit => None,
            StageFd::Pipe(fd) | StageFd::File(fd) => Some(fd.as_raw_fd()),
        }
    }
}

#[derive(Debug)]
pub struct StageIo {
    pub stdin: StageFd,
    pub stdout: StageFd,
}

#[derive(Debug)]
pub struct ResolvedIo {
    pub io: StageIo,
    /// Read end of this stage's outgoing pipe; the next stage's input.
    pub downstream: Option<OwnedFd>,
}

fn set_cloexec(fd: &OwnedFd) -> nix::Result<()> {
    fcntl(fd.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC)).map(drop)
}

fn open_input(path: &Path) -> Result<OwnedFd> {
    File::open(path)
        .map(OwnedFd::from)
        .map_err(|source| ExecError::OpenInput { path: path.to_path_buf(), source })
}

fn open_output(path: &Path, append: bool) -> Result<OwnedFd> {
    let mut opts = OpenOptions::new();
    opts.write(true).create(true).mode(OUTPUT_FILE_MODE);
    if append {
        opts.append(true);
    } else {
        opts.truncate(true);
    }
    opts.open(path)
        .map(OwnedFd::from)
        .map_err(|source| ExecError::OpenOutput { path: path.to_path_buf(), source })
}

/// Creates a pipe whose two ends are both close-on-exec.
pub fn cloexec_pipe(stage: usize) -> Result<(OwnedFd, OwnedFd)> {
    let (r, w) = pipe().map_err(|source| ExecError::Pipe { stage, source })?;
    set_cloexec(&r)
        .and_then(|_| set_cloexec(&w))
        .map_err(|source| ExecError::Pipe { stage, source })?;
    Ok((r, w))
}

/// Resolves the descriptors for stage `index`.
///
/// `upstream` is the read end left by the previous stage, if it piped into
/// this one. An explicit input file takes precedence; the unused upstream is
/// then closed here so the previous stage is not left writing into a pipe
/// nobody will read.
///
/// On error every descriptor acquired so far, `upstream` included, is closed
/// before returning.
pub fn resolve(index: usize, stage: &Stage, upstream: Option<OwnedFd>) -> Result<ResolvedIo> {
    let stdin = match (stage.input(), upstream) {
        (Some(path), upstream) => {
            if upstream.is_some() {
                debug!(stage = index, path = %path.display(), "input file overrides incoming pipe");
            }
            drop(upstream);
            StageFd::File(open_input(path)?)
        }
        (None, Some(fd)) => StageFd::Pipe(fd),
        (None, None) => StageFd::Inherit,
    };

    let (stdout, downstream) = match stage.output() {
        OutputMode::Inherit => (StageFd::Inherit, None),
        OutputMode::Truncate(path) => (StageFd::File(open_output(path, false)?), None),
        OutputMode::Append(path) => (StageFd::File(open_output(path, true)?), None),
        OutputMode::Pipe => {
            let (r, w) = cloexec_pipe(index)?;
            (StageFd::Pipe(w), Some(r))
        }
    };

    Ok(ResolvedIo { io: StageIo { stdin, stdout }, downstream })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};

    #[test]
    fn inherits_by_default() {
        let r = resolve(0, &Stage::new(["ls"]), None).unwrap();
        assert!(matches!(r.io.stdin, StageFd::Inherit));
        assert!(matches!(r.io.stdout, StageFd::Inherit));
        assert!(r.downstream.is_none());
    }

    #[test]
    fn pipe_output_carries_bytes_to_downstream() {
        let stage = Stage::new(["echo"]).with_output(OutputMode::Pipe);
        let ResolvedIo { io, downstream } = resolve(0, &stage, None).unwrap();
        let StageFd::Pipe(w) = io.stdout else { panic!("expected pipe") };
        let flags = fcntl(w.as_raw_fd(), FcntlArg::F_GETFD).unwrap();
        assert!(FdFlag::from_bits_truncate(flags).contains(FdFlag::FD_CLOEXEC));

        let mut writer = File::from(w);
        writer.write_all(b"through the pipe").unwrap();
        drop(writer);
        let mut out = String::new();
        File::from(downstream.unwrap()).read_to_string(&mut out).unwrap();
        assert_eq!(out, "through the pipe");
    }

    #[test]
    fn upstream_becomes_stdin() {
        let (r, _w) = cloexec_pipe(0).unwrap();
        let raw = r.as_raw_fd();
        let resolved = resolve(1, &Stage::new(["wc"]), Some(r)).unwrap();
        assert!(matches!(resolved.io.stdin, StageFd::Pipe(_)));
        assert_eq!(resolved.io.stdin.raw(), Some(raw));
    }

    #[test]
    fn input_file_wins_over_upstream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("in.txt");
        std::fs::write(&path, b"data").unwrap();
        let (r, w) = cloexec_pipe(0).unwrap();
        let resolved = resolve(1, &Stage::new(["wc"]).with_input(&path), Some(r)).unwrap();
        assert!(matches!(resolved.io.stdin, StageFd::File(_)));
        // the pipe's read end is gone, so writing into it fails
        let mut writer = File::from(w);
        assert!(writer.write_all(b"x").is_err());
    }

    #[test]
    fn missing_input_is_reported_with_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        let err = resolve(0, &Stage::new(["cat"]).with_input(&path), None).unwrap_err();
        match &err {
            ExecError::OpenInput { path: p, source } => {
                assert_eq!(p, &path);
                assert_eq!(source.kind(), std::io::ErrorKind::NotFound);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains("missing.txt"));
    }

    #[test]
    fn truncate_and_append_open_modes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.txt");
        std::fs::write(&path, b"old contents\n").unwrap();

        let stage = Stage::new(["echo"]).with_output(OutputMode::Truncate(path.clone()));
        let StageFd::File(fd) = resolve(0, &stage, None).unwrap().io.stdout else { panic!("expected file") };
        File::from(fd).write_all(b"new\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\n");

        let stage = Stage::new(["echo"]).with_output(OutputMode::Append(path.clone()));
        let StageFd::File(fd) = resolve(0, &stage, None).unwrap().io.stdout else { panic!("expected file") };
        File::from(fd).write_all(b"more\n").unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "new\nmore\n");
    }

    #[test]
    fn unwritable_output_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("no/such/dir/out.txt");
        let stage = Stage::new(["echo"]).with_output(OutputMode::Truncate(path));
        assert!(matches!(resolve(0, &stage, None), Err(ExecError::OpenOutput { .. })));
    }
}
