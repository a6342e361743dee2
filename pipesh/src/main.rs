use anyhow::Result;
use clap::Parser;
use std::io::{self, BufRead, Write};
use tracing_subscriber::EnvFilter;

use pipesh::config::{DEFAULT_LOG_FILTER, LOG_ENV};
use pipesh::{
    BuiltinRegistry, CommandParser, DispatchOutcome, Dispatcher, History, LineParser, ShellConfig, FAILURE_STATUS,
};

fn init_logging() {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

/// Parse-only mode: show what the dispatcher would be handed.
fn explain(line: &str, last_status: i32) -> Result<DispatchOutcome> {
    let status = match LineParser.parse(line) {
        Ok(Some(pipeline)) => {
            println!("{}", serde_json::to_string_pretty(&pipeline)?);
            0
        }
        Ok(None) => last_status,
        Err(err) => {
            eprintln!("pipesh: input parse error: {err}");
            FAILURE_STATUS
        }
    };
    Ok(DispatchOutcome { status, exit_requested: false })
}

fn run_interactive(config: &ShellConfig, shell: &mut Dispatcher, history: &History) -> Result<i32> {
    let show_prompt = atty::is(atty::Stream::Stdin);
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut status = 0;
    let mut line = Vec::new();
    loop {
        if show_prompt {
            write!(stdout, "{}", config.prompt)?;
            stdout.flush()?;
        }
        line.clear();
        // raw bytes: a line that is not UTF-8 must not end the session
        if stdin.lock().read_until(b'\n', &mut line)? == 0 {
            if show_prompt {
                writeln!(stdout)?;
            }
            break;
        }
        let text = String::from_utf8_lossy(&line);
        let input = text.trim_end_matches(['\n', '\r']);
        if !input.trim().is_empty() {
            history.push(input);
        }
        let outcome = if config.explain { explain(input, status)? } else { shell.dispatch(input, status) };
        status = outcome.status;
        if outcome.exit_requested {
            break;
        }
    }
    Ok(status)
}

fn main() -> Result<()> {
    init_logging();
    let config = ShellConfig::parse();
    let history = History::default();
    let mut shell = Dispatcher::new(BuiltinRegistry::standard(history.clone()));

    let status = match &config.command {
        Some(line) if config.explain => explain(line, 0)?.status,
        Some(line) => {
            history.push(line.as_str());
            shell.dispatch(line, 0).status
        }
        None => run_interactive(&config, &mut shell, &history)?,
    };
    io::stdout().flush()?;
    std::process::exit(status);
}
