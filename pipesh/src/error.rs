use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Dispatch-level failures while running a pipeline.
///
/// A program that fails to start inside an already forked child is *not* an
/// `ExecError`; that shows up as the child's exit status.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("cannot open input file {}: {source}", path.display())]
    OpenInput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("cannot open output file {}: {source}", path.display())]
    OpenOutput {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("stage {stage}: cannot create pipe: {source}")]
    Pipe {
        stage: usize,
        #[source]
        source: nix::Error,
    },
    #[error("stage {stage}: cannot fork: {source}")]
    Fork {
        stage: usize,
        #[source]
        source: nix::Error,
    },
    #[error("waiting for stage {stage}: {source}")]
    Wait {
        stage: usize,
        #[source]
        source: nix::Error,
    },
    #[error("stage {stage}: empty argument list")]
    EmptyArgv { stage: usize },
    #[error("stage {stage}: argument contains a NUL byte: {arg:?}")]
    NulInArgument { stage: usize, arg: String },
}

pub type Result<T> = std::result::Result<T, ExecError>;
