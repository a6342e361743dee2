//! Commands that run inside the shell process.
//!
//! A [`BuiltinRegistry`] is an ordered list of `(name, handler)` pairs handed
//! to the dispatcher at construction time. Handlers receive the full argv
//! (name included), the previous status, and a flag they set to ask the shell
//! to exit.

use std::cell::RefCell;
use std::fmt::{self, Write as _};
use std::io::Write;
use std::path::PathBuf;
use std::rc::Rc;

pub type BuiltinHandler = Box<dyn Fn(&[String], i32, &mut bool) -> i32>;

#[derive(Default)]
pub struct BuiltinRegistry {
    entries: Vec<(String, BuiltinHandler)>,
}

impl fmt::Debug for BuiltinRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl BuiltinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a builtin. An earlier entry with the same name shadows it.
    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&[String], i32, &mut bool) -> i32 + 'static,
    {
        self.entries.push((name.into(), Box::new(handler)));
        self
    }

    pub fn lookup(&self, name: &str) -> Option<&BuiltinHandler> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, h)| h)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// The shell's default builtins. `history` is shared with the input loop,
    /// which records each line it reads.
    pub fn standard(history: History) -> Self {
        BuiltinRegistry::new()
            .register("exit", builtin_exit)
            .register("cd", builtin_cd)
            .register("pwd", builtin_pwd)
            .register("status", builtin_status)
            .register("history", move |_: &[String], _: i32, _: &mut bool| {
                print!("{}", history.render());
                let _ = std::io::stdout().flush();
                0
            })
            .register("help", builtin_help)
    }
}

/// Input lines seen by the interactive loop, oldest first.
#[derive(Debug, Clone, Default)]
pub struct History(Rc<RefCell<Vec<String>>>);

impl History {
    pub fn push(&self, line: impl Into<String>) {
        self.0.borrow_mut().push(line.into());
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (i, line) in self.0.borrow().iter().enumerate() {
            let _ = writeln!(out, "{:>5}  {}", i + 1, line);
        }
        out
    }
}

fn builtin_exit(args: &[String], last: i32, should_exit: &mut bool) -> i32 {
    match args {
        [_] => {
            *should_exit = true;
            last
        }
        [_, code] => match code.parse::<i32>() {
            Ok(code) => {
                *should_exit = true;
                code
            }
            Err(_) => {
                eprintln!("pipesh: exit: {code}: numeric argument required");
                2
            }
        },
        _ => {
            eprintln!("pipesh: exit: too many arguments");
            1
        }
    }
}

fn builtin_cd(args: &[String], _last: i32, _should_exit: &mut bool) -> i32 {
    let target = match args.get(1) {
        Some(dir) => PathBuf::from(dir),
        None => match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home),
            None => {
                eprintln!("pipesh: cd: HOME not set");
                return 1;
            }
        },
    };
    if args.len() > 2 {
        eprintln!("pipesh: cd: too many arguments");
        return 1;
    }
    match std::env::set_current_dir(&target) {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("pipesh: cd: {}: {e}", target.display());
            1
        }
    }
}

fn builtin_pwd(_args: &[String], _last: i32, _should_exit: &mut bool) -> i32 {
    match std::env::current_dir() {
        Ok(dir) => {
            println!("{}", dir.display());
            0
        }
        Err(e) => {
            eprintln!("pipesh: pwd: {e}");
            1
        }
    }
}

fn builtin_status(_args: &[String], last: i32, _should_exit: &mut bool) -> i32 {
    println!("{last}");
    last
}

struct HelpEntry {
    name: &'static str,
    usage: &'static str,
    desc: &'static str,
}

static HELP_ENTRIES: &[HelpEntry] = &[
    HelpEntry { name: "cd", usage: "cd [dir]", desc: "change the working directory (default $HOME)" },
    HelpEntry { name: "exit", usage: "exit [status]", desc: "leave the shell with status, or the last status" },
    HelpEntry { name: "help", usage: "help [command...]", desc: "list builtins or describe the named ones" },
    HelpEntry { name: "history", usage: "history", desc: "print the lines entered so far" },
    HelpEntry { name: "pwd", usage: "pwd", desc: "print the working directory" },
    HelpEntry { name: "status", usage: "status", desc: "print the status of the previous command" },
];

fn find_help(name: &str) -> Option<&'static HelpEntry> {
    HELP_ENTRIES.iter().find(|e| e.name == name)
}

fn format_entry(e: &HelpEntry) -> String {
    format!("{} - {}\nusage: {}\n", e.name, e.desc, e.usage)
}

fn format_listing() -> String {
    let mut s = String::from("pipesh builtins:\n");
    for e in HELP_ENTRIES {
        let _ = writeln!(s, "    {:<10}{}", e.name, e.desc);
    }
    s.push_str("\nAnything else runs as an external program. Use: help <command>\n");
    s
}

fn builtin_help(args: &[String], _last: i32, _should_exit: &mut bool) -> i32 {
    let mut stdout = std::io::stdout();
    if args.len() <= 1 {
        let _ = write!(stdout, "{}", format_listing());
        let _ = stdout.flush();
        return 0;
    }
    let mut status = 0;
    for name in &args[1..] {
        match find_help(name) {
            Some(e) => {
                let _ = write!(stdout, "{}", format_entry(e));
            }
            None => {
                eprintln!("pipesh: help: no help for {name}");
                status = 2;
            }
        }
    }
    let _ = stdout.flush();
    status
}
