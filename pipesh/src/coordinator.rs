//! Stage-by-stage launch loop for a whole pipeline.
//!
//! Stages are started left to right. The only descriptor carried from one
//! iteration to the next is the read end of the pipe the previous stage
//! writes into; everything else a stage needs is owned by its [`StageIo`]
//! and closed in the parent as soon as the child has been created. After the
//! launch loop every started child is reaped, and the pipeline's status is
//! the last stage's, picked by position rather than by wait order.
//!
//! [`StageIo`]: crate::stage_io::StageIo

use std::os::fd::{AsFd, OwnedFd};

use tracing::{debug, warn};

use crate::error::Result;
use crate::launcher::StageSpawner;
use crate::pipeline::{Pipeline, Stage};
use crate::stage_io::{self, ResolvedIo};
use crate::FAILURE_STATUS;

pub struct Coordinator<S> {
    spawner: S,
}

impl<S: StageSpawner> Coordinator<S> {
    pub fn new(spawner: S) -> Self {
        Coordinator { spawner }
    }

    pub fn spawner(&self) -> &S {
        &self.spawner
    }

    /// Runs `pipeline` to completion and returns the last stage's status.
    ///
    /// A resource or fork failure stops the launch loop: later stages are
    /// never started, but the ones already running are still waited on
    /// before the error is returned.
    pub fn run(&mut self, pipeline: &Pipeline) -> Result<i32> {
        let mut launched = Vec::with_capacity(pipeline.len());
        let mut upstream: Option<OwnedFd> = None;
        let mut launch_error = None;

        for (index, stage) in pipeline.stages().iter().enumerate() {
            match self.launch(index, stage, upstream.take()) {
                Ok((handle, downstream)) => {
                    launched.push((index, handle));
                    upstream = downstream;
                }
                Err(err) => {
                    warn!(stage = index, program = stage.program(), error = %err, "aborting pipeline");
                    launch_error = Some(err);
                    break;
                }
            }
        }
        // Only non-empty if the stage meant to read it never started. Close it
        // before waiting so the writer sees EPIPE instead of blocking.
        drop(upstream);

        let last = pipeline.len() - 1;
        let mut status = FAILURE_STATUS;
        let mut wait_error = None;
        for (index, handle) in launched {
            match self.spawner.wait(index, handle) {
                Ok(exit) => {
                    debug!(stage = index, ?exit, "stage finished");
                    if index == last {
                        status = exit.status();
                    }
                }
                Err(err) if index == last => wait_error = Some(err),
                Err(err) => warn!(stage = index, error = %err, "could not reap stage"),
            }
        }

        match launch_error.or(wait_error) {
            Some(err) => Err(err),
            None => Ok(status),
        }
    }

    fn launch(
        &mut self,
        index: usize,
        stage: &Stage,
        upstream: Option<OwnedFd>,
    ) -> Result<(S::Handle, Option<OwnedFd>)> {
        let ResolvedIo { io, downstream } = stage_io::resolve(index, stage, upstream)?;
        let handle = self.spawner.spawn(index, stage, io, downstream.as_ref().map(|fd| fd.as_fd()))?;
        Ok((handle, downstream))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::os::fd::{AsRawFd, BorrowedFd, RawFd};

    use nix::errno::Errno;

    use super::*;
    use crate::error::ExecError;
    use crate::launcher::StageExit;
    use crate::pipeline::OutputMode;
    use crate::stage_io::{StageFd, StageIo};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Wiring {
        Inherit,
        Pipe(RawFd),
        File,
    }

    impl From<&StageFd> for Wiring {
        fn from(fd: &StageFd) -> Self {
            match fd {
                StageFd::Inherit => Wiring::Inherit,
                StageFd::Pipe(fd) => Wiring::Pipe(fd.as_raw_fd()),
                StageFd::File(_) => Wiring::File,
            }
        }
    }

    #[derive(Debug, Clone)]
    pub struct Spawned {
        pub argv: Vec<String>,
        pub stdin: Wiring,
        pub stdout: Wiring,
        pub downstream: Option<RawFd>,
    }

    /// In-memory spawner: records what it was asked to start and replays
    /// scripted exits.
    #[derive(Debug, Default)]
    pub struct FakeSpawner {
        pub exits: Vec<StageExit>,
        pub fail_fork_at: Option<usize>,
        pub spawned: Vec<Spawned>,
        pub waited: Vec<usize>,
    }

    impl FakeSpawner {
        pub fn with_exits(exits: impl IntoIterator<Item = StageExit>) -> Self {
            FakeSpawner { exits: exits.into_iter().collect(), ..Default::default() }
        }
    }

    impl StageSpawner for FakeSpawner {
        type Handle = usize;

        fn spawn(
            &mut self,
            index: usize,
            stage: &Stage,
            io: StageIo,
            downstream: Option<BorrowedFd<'_>>,
        ) -> Result<usize> {
            if self.fail_fork_at == Some(index) {
                return Err(ExecError::Fork { stage: index, source: Errno::EAGAIN });
            }
            self.spawned.push(Spawned {
                argv: stage.argv().to_vec(),
                stdin: Wiring::from(&io.stdin),
                stdout: Wiring::from(&io.stdout),
                downstream: downstream.map(|fd| fd.as_raw_fd()),
            });
            Ok(index)
        }

        fn wait(&mut self, _index: usize, handle: usize) -> Result<StageExit> {
            self.waited.push(handle);
            Ok(self.exits.get(handle).copied().unwrap_or(StageExit::Exited(0)))
        }
    }

    fn piped(commands: &[&[&str]]) -> Pipeline {
        Pipeline::from_commands(commands.iter().map(|c| c.to_vec())).unwrap()
    }

    #[test]
    fn single_stage_status_is_its_exit_code() {
        let mut c = Coordinator::new(FakeSpawner::with_exits([StageExit::Exited(42)]));
        assert_eq!(c.run(&piped(&[&["prog"]])).unwrap(), 42);
        let s = &c.spawner().spawned[0];
        assert_eq!(s.stdin, Wiring::Inherit);
        assert_eq!(s.stdout, Wiring::Inherit);
        assert_eq!(s.downstream, None);
    }

    #[test]
    fn status_comes_from_last_stage_only() {
        let exits = [StageExit::Exited(1), StageExit::Exited(0)];
        let mut c = Coordinator::new(FakeSpawner::with_exits(exits));
        assert_eq!(c.run(&piped(&[&["false"], &["true"]])).unwrap(), 0);

        let exits = [StageExit::Exited(0), StageExit::Signaled(9), StageExit::Exited(3)];
        let mut c = Coordinator::new(FakeSpawner::with_exits(exits));
        assert_eq!(c.run(&piped(&[&["a"], &["b"], &["c"]])).unwrap(), 3);
        assert_eq!(c.spawner().waited, vec![0, 1, 2]);
    }

    #[test]
    fn signaled_last_stage_is_failure() {
        let exits = [StageExit::Exited(0), StageExit::Signaled(15)];
        let mut c = Coordinator::new(FakeSpawner::with_exits(exits));
        assert_eq!(c.run(&piped(&[&["a"], &["b"]])).unwrap(), FAILURE_STATUS);
    }

    #[test]
    fn read_end_is_handed_to_next_stage() {
        let mut c = Coordinator::new(FakeSpawner::default());
        c.run(&piped(&[&["echo", "hi"], &["tr", "h", "H"], &["cat"]])).unwrap();
        let spawned = &c.spawner().spawned;
        assert_eq!(spawned.len(), 3);

        assert_eq!(spawned[0].stdin, Wiring::Inherit);
        assert!(matches!(spawned[0].stdout, Wiring::Pipe(_)));
        let first_read = spawned[0].downstream.expect("stage 0 retains a read end");
        assert_eq!(spawned[1].stdin, Wiring::Pipe(first_read));

        assert!(matches!(spawned[1].stdout, Wiring::Pipe(_)));
        let second_read = spawned[1].downstream.expect("stage 1 retains a read end");
        assert_eq!(spawned[2].stdin, Wiring::Pipe(second_read));
        assert_eq!(spawned[2].stdout, Wiring::Inherit);
        assert_eq!(spawned[2].downstream, None);
        assert_eq!(spawned[1].argv, ["tr", "h", "H"]);
    }

    #[test]
    fn missing_input_stops_launch_but_waits_for_started_stages() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.txt");
        let pipeline = Pipeline::new(vec![
            Stage::new(["producer"]).with_output(OutputMode::Pipe),
            Stage::new(["middle"]).with_input(&missing).with_output(OutputMode::Pipe),
            Stage::new(["consumer"]),
        ])
        .unwrap();

        let mut c = Coordinator::new(FakeSpawner::default());
        let err = c.run(&pipeline).unwrap_err();
        assert!(matches!(err, ExecError::OpenInput { ref path, .. } if path == &missing));
        assert_eq!(c.spawner().spawned.len(), 1);
        assert_eq!(c.spawner().waited, vec![0]);
    }

    #[test]
    fn explicit_input_file_beats_pipe() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("in.txt");
        std::fs::write(&input, b"x").unwrap();
        let pipeline = Pipeline::new(vec![
            Stage::new(["producer"]).with_output(OutputMode::Pipe),
            Stage::new(["consumer"]).with_input(&input),
        ])
        .unwrap();

        let mut c = Coordinator::new(FakeSpawner::default());
        c.run(&pipeline).unwrap();
        assert_eq!(c.spawner().spawned[1].stdin, Wiring::File);
    }

    #[test]
    fn fork_failure_is_fatal_after_reaping() {
        let mut spawner = FakeSpawner::default();
        spawner.fail_fork_at = Some(1);
        let mut c = Coordinator::new(spawner);
        let err = c.run(&piped(&[&["a"], &["b"], &["c"]])).unwrap_err();
        assert!(matches!(err, ExecError::Fork { stage: 1, .. }));
        assert_eq!(c.spawner().spawned.len(), 1);
        assert_eq!(c.spawner().waited, vec![0]);
    }

    #[test]
    fn output_file_error_on_first_stage_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let bad = dir.path().join("missing-dir/out.txt");
        let pipeline = Pipeline::new(vec![Stage::new(["echo"]).with_output(OutputMode::Truncate(bad))]).unwrap();
        let mut c = Coordinator::new(FakeSpawner::default());
        assert!(matches!(c.run(&pipeline), Err(ExecError::OpenOutput { .. })));
        assert!(c.spawner().spawned.is_empty());
        assert!(c.spawner().waited.is_empty());
    }
}
