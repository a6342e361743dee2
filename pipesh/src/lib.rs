//! Command-execution core of a small interactive shell.
//!
//! A line of input is parsed into a [`Pipeline`], then the [`Dispatcher`]
//! either runs a builtin in-process or starts one OS process per stage,
//! wiring them together with pipes and redirection files, and reports the
//! last stage's exit status.
//!
//! ```no_run
//! use pipesh::{BuiltinRegistry, Dispatcher, History};
//!
//! let mut shell = Dispatcher::new(BuiltinRegistry::standard(History::default()));
//! let outcome = shell.dispatch("echo hi | tr h H", 0);
//! assert_eq!(outcome.status, 0);
//! ```

pub mod builtins;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod error;
pub mod launcher;
pub mod parser;
pub mod pipeline;
pub mod stage_io;

pub use builtins::{BuiltinHandler, BuiltinRegistry, History};
pub use config::ShellConfig;
pub use coordinator::Coordinator;
pub use dispatcher::{DispatchOutcome, Dispatcher};
pub use error::ExecError;
pub use launcher::{ForkSpawner, StageExit, StageSpawner};
pub use parser::{CommandParser, LineParser, ParseError};
pub use pipeline::{OutputMode, Pipeline, PipelineError, Stage};

/// Status reported for dispatch-level failures and signal deaths.
pub const FAILURE_STATUS: i32 = -1;
