use clap::Parser;

/// Environment variable holding the `tracing` filter directive.
pub const LOG_ENV: &str = "PIPESH_LOG";
pub const DEFAULT_LOG_FILTER: &str = "warn";

/// Command-line configuration of the `pipesh` binary.
#[derive(Debug, Clone, Parser)]
#[command(name = "pipesh", version, about = "A small shell that runs pipelines of external programs")]
pub struct ShellConfig {
    /// Run LINE and exit with its status instead of reading standard input
    #[arg(short = 'c', long = "command", value_name = "LINE")]
    pub command: Option<String>,

    /// Print each parsed pipeline as JSON instead of running it
    #[arg(long)]
    pub explain: bool,

    /// Prompt printed before each line when standard input is a terminal
    #[arg(long, env = "PIPESH_PROMPT", default_value = "pipesh$ ")]
    pub prompt: String,
}
