//! Parsed representation of one input line: an ordered chain of stages.
//!
//! A [`Pipeline`] owns its stages outright. The "next stage" of stage `i` is
//! simply stage `i + 1`, so the chain is forward-only and acyclic by
//! construction. [`Pipeline::new`] enforces the wiring invariant: every stage
//! except the last pipes onward, and the last one never does.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use serde::Serialize;
use thiserror::Error;

/// Where a stage's standard output goes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "path", rename_all = "snake_case")]
pub enum OutputMode {
    /// The shell's own standard output.
    Inherit,
    /// Create or truncate the file.
    Truncate(PathBuf),
    /// Create or append to the file.
    Append(PathBuf),
    /// Write end of a pipe whose read end feeds the following stage.
    Pipe,
}

impl OutputMode {
    pub fn target(&self) -> Option<&Path> {
        match self {
            OutputMode::Truncate(p) | OutputMode::Append(p) => Some(p),
            OutputMode::Inherit | OutputMode::Pipe => None,
        }
    }

    pub fn is_pipe(&self) -> bool {
        matches!(self, OutputMode::Pipe)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    argv: Vec<String>,
    input: Option<PathBuf>,
    output: OutputMode,
}

impl Stage {
    /// Builds a stage that reads inherited stdin and writes inherited stdout.
    pub fn new<I, S>(argv: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Stage { argv: argv.into_iter().map(Into::into).collect(), input: None, output: OutputMode::Inherit }
    }

    pub fn with_input(mut self, path: impl Into<PathBuf>) -> Self {
        self.input = Some(path.into());
        self
    }

    pub fn with_output(mut self, mode: OutputMode) -> Self {
        self.output = mode;
        self
    }

    pub fn argv(&self) -> &[String] {
        &self.argv
    }

    /// First argv element. Empty only for a stage that never made it into a
    /// [`Pipeline`].
    pub fn program(&self) -> &str {
        self.argv.first().map(String::as_str).unwrap_or("")
    }

    pub fn input(&self) -> Option<&Path> {
        self.input.as_deref()
    }

    pub fn output(&self) -> &OutputMode {
        &self.output
    }

    /// Converts argv for `execvp`. Fails on the first argument carrying an
    /// interior NUL byte and returns it.
    pub fn c_argv(&self) -> Result<Vec<CString>, String> {
        self.argv.iter().map(|a| CString::new(a.as_bytes()).map_err(|_| a.clone())).collect()
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PipelineError {
    #[error("pipeline has no stages")]
    Empty,
    #[error("stage {0} has an empty argument list")]
    EmptyArgv(usize),
    #[error("last stage {0} pipes to a stage that does not exist")]
    DanglingPipe(usize),
    #[error("stage {0} is followed by another stage but does not pipe into it")]
    Unconnected(usize),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    pub fn new(stages: Vec<Stage>) -> Result<Self, PipelineError> {
        if stages.is_empty() {
            return Err(PipelineError::Empty);
        }
        let last = stages.len() - 1;
        for (i, stage) in stages.iter().enumerate() {
            if stage.argv.is_empty() {
                return Err(PipelineError::EmptyArgv(i));
            }
            match (i == last, stage.output.is_pipe()) {
                (true, true) => return Err(PipelineError::DanglingPipe(i)),
                (false, false) => return Err(PipelineError::Unconnected(i)),
                _ => {}
            }
        }
        Ok(Pipeline { stages })
    }

    /// Joins plain commands with pipes; the last stage inherits stdout.
    pub fn from_commands<I, C, S>(commands: I) -> Result<Self, PipelineError>
    where
        I: IntoIterator<Item = C>,
        C: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut stages: Vec<Stage> = commands.into_iter().map(Stage::new).collect();
        let n = stages.len();
        for stage in stages.iter_mut().take(n.saturating_sub(1)) {
            stage.output = OutputMode::Pipe;
        }
        Pipeline::new(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn first(&self) -> &Stage {
        // non-empty by construction
        &self.stages[0]
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn has_redirections(&self) -> bool {
        self.stages.iter().any(|s| s.input.is_some() || s.output.target().is_some())
    }
}
