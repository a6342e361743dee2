//! The shell's single entry point: one input line in, one status out.

use tracing::debug;

use crate::builtins::BuiltinRegistry;
use crate::coordinator::Coordinator;
use crate::launcher::{ForkSpawner, StageSpawner};
use crate::parser::{CommandParser, LineParser};
use crate::pipeline::Pipeline;
use crate::FAILURE_STATUS;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchOutcome {
    pub status: i32,
    /// Set by builtins such as `exit`.
    pub exit_requested: bool,
}

pub struct Dispatcher<P = LineParser, S = ForkSpawner> {
    parser: P,
    builtins: BuiltinRegistry,
    coordinator: Coordinator<S>,
}

impl Dispatcher {
    /// Dispatcher with the default parser and real process spawning.
    pub fn new(builtins: BuiltinRegistry) -> Self {
        Dispatcher::with_parts(LineParser, builtins, ForkSpawner)
    }
}

impl<P: CommandParser, S: StageSpawner> Dispatcher<P, S> {
    pub fn with_parts(parser: P, builtins: BuiltinRegistry, spawner: S) -> Self {
        Dispatcher { parser, builtins, coordinator: Coordinator::new(spawner) }
    }

    pub fn spawner(&self) -> &S {
        self.coordinator.spawner()
    }

    /// Parses and runs `line`. `last_status` is what the previous dispatch
    /// returned; blank lines hand it back unchanged.
    pub fn dispatch(&mut self, line: &str, last_status: i32) -> DispatchOutcome {
        let mut exit_requested = false;
        let status = match self.parser.parse(line) {
            Err(err) => {
                eprintln!("pipesh: input parse error: {err}");
                FAILURE_STATUS
            }
            Ok(None) => last_status,
            Ok(Some(pipeline)) => self.dispatch_parsed(&pipeline, last_status, &mut exit_requested),
        };
        DispatchOutcome { status, exit_requested }
    }

    fn dispatch_parsed(&mut self, pipeline: &Pipeline, last_status: i32, exit_requested: &mut bool) -> i32 {
        let first = pipeline.first();
        if let Some(handler) = self.builtins.lookup(first.program()) {
            if pipeline.len() > 1 || pipeline.has_redirections() {
                eprintln!("pipesh: {}: builtins cannot be piped or redirected", first.program());
                return FAILURE_STATUS;
            }
            debug!(builtin = first.program(), "running builtin");
            return handler(first.argv(), last_status, exit_requested);
        }

        debug!(stages = pipeline.len(), program = first.program(), "running pipeline");
        match self.coordinator.run(pipeline) {
            Ok(status) => status,
            Err(err) => {
                eprintln!("pipesh: {err}");
                FAILURE_STATUS
            }
        }
    }
}
