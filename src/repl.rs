// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 The lathe Authors

//! Interactive REPL (Read-Eval-Print Loop) for the lathe engine.

use std::path::PathBuf;

use lathe_engine::{Engine, Value};
use owo_colors::OwoColorize;
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;

/// REPL configuration constants
const HISTORY_FILE: &str = ".lathe_history";

/// REPL commands that can be executed with a dot prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplCommand {
    Help,
    Exit,
    Clear,
    Version,
    Load,
}

impl ReplCommand {
    /// Parse a REPL command from input string
    pub fn parse(input: &str) -> Option<(Self, Option<&str>)> {
        let input = input.trim();
        if !input.starts_with('.') {
            return None;
        }

        let parts: Vec<&str> = input[1..].splitn(2, char::is_whitespace).collect();
        let cmd = parts.first()?.to_lowercase();
        let arg = parts.get(1).copied();

        match cmd.as_str() {
            "help" | "h" | "?" => Some((ReplCommand::Help, arg)),
            "exit" | "quit" | "q" => Some((ReplCommand::Exit, arg)),
            "clear" | "cls" => Some((ReplCommand::Clear, arg)),
            "version" | "v" => Some((ReplCommand::Version, arg)),
            "load" | "l" => Some((ReplCommand::Load, arg)),
            _ => None,
        }
    }

    /// Get all available commands for the help screen
    pub fn all_commands() -> &'static [(&'static str, &'static str)] {
        &[
            (".help", "Show this help message"),
            (".exit", "Exit the REPL"),
            (".clear", "Clear the screen"),
            (".version", "Show version information"),
            (".load <file>", "Load and run a script file"),
        ]
    }
}

/// Result of executing a REPL command
enum CommandResult {
    Continue,
    Exit,
}

/// The interactive REPL for the lathe engine
pub struct Repl {
    engine: Engine,
    editor: DefaultEditor,
    history_path: PathBuf,
}

impl Repl {
    /// Create a new REPL instance
    pub fn new() -> rustyline::Result<Self> {
        let mut editor = DefaultEditor::new()?;

        let history_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("lathe")
            .join(HISTORY_FILE);
        if let Some(parent) = history_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = editor.load_history(&history_path);

        Ok(Self {
            engine: Engine::new(),
            editor,
            history_path,
        })
    }

    /// Run the REPL main loop
    pub fn run(&mut self) -> rustyline::Result<()> {
        self.print_banner();

        loop {
            let prompt = format!("{} ", "lathe>".bright_green().bold());
            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let _ = self.editor.add_history_entry(trimmed);

                    if let Some((cmd, arg)) = ReplCommand::parse(trimmed) {
                        match self.execute_command(cmd, arg) {
                            CommandResult::Continue => continue,
                            CommandResult::Exit => break,
                        }
                    }

                    // A bare expression is echoed; statements run as-is.
                    let source = if trimmed.ends_with(';') || trimmed.ends_with('}') {
                        trimmed.to_string()
                    } else {
                        format!("echo({trimmed});")
                    };
                    self.eval_and_print(&source);
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".dimmed());
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "^D".dimmed());
                    break;
                }
                Err(err) => {
                    eprintln!("{}: {:?}", "Error".red().bold(), err);
                    break;
                }
            }
        }

        let _ = self.editor.save_history(&self.history_path);
        println!("{}", "Goodbye!".bright_cyan());
        Ok(())
    }

    fn print_banner(&self) {
        let version = env!("CARGO_PKG_VERSION");
        println!();
        println!(
            "  {} {} {}",
            "lathe".white().bold(),
            "v".dimmed(),
            version.bright_yellow()
        );
        println!(
            "  {}",
            "A compiler and stack VM for a small modelling language".dimmed()
        );
        println!();
        println!(
            "  {} {} {}",
            "Type".dimmed(),
            ".help".cyan(),
            "for available commands".dimmed()
        );
        println!();
    }

    fn execute_command(&mut self, cmd: ReplCommand, arg: Option<&str>) -> CommandResult {
        match cmd {
            ReplCommand::Help => {
                println!();
                println!("{}", "REPL Commands:".white().bold());
                println!();
                for (name, desc) in ReplCommand::all_commands() {
                    println!("  {:16} {}", name.cyan(), desc.dimmed());
                }
                println!();
                CommandResult::Continue
            }
            ReplCommand::Exit => CommandResult::Exit,
            ReplCommand::Clear => {
                print!("\x1B[2J\x1B[H");
                CommandResult::Continue
            }
            ReplCommand::Version => {
                println!(
                    "{}: {}",
                    "lathe".bright_cyan().bold(),
                    env!("CARGO_PKG_VERSION").yellow()
                );
                CommandResult::Continue
            }
            ReplCommand::Load => {
                match arg {
                    Some(path) => self.load_file(path),
                    None => eprintln!(
                        "{}: {} {}",
                        "Error".red().bold(),
                        ".load".cyan(),
                        "requires a file path".dimmed()
                    ),
                }
                CommandResult::Continue
            }
        }
    }

    fn load_file(&mut self, path: &str) {
        match std::fs::read_to_string(path.trim()) {
            Ok(source) => self.eval_and_print(&source),
            Err(e) => eprintln!("{}: {e}", "Error".red().bold()),
        }
    }

    fn eval_and_print(&mut self, source: &str) {
        match self.engine.eval(source) {
            Ok(outcome) => {
                for warning in &outcome.warnings {
                    eprintln!("{}: {warning}", "warning".yellow().bold());
                }
                print!("{}", outcome.output);
                if !matches!(outcome.value, Value::Undef) {
                    println!("{}", format_value(&outcome.value));
                }
            }
            Err(e) => eprintln!("{}: {e}", "Error".red().bold()),
        }
    }
}

/// Format a value for display with syntax coloring
fn format_value(value: &Value) -> String {
    match value {
        Value::Undef => "undef".blue().dimmed().to_string(),
        Value::Boolean(_) | Value::Number(_) | Value::Range(_) => {
            value.to_string().yellow().to_string()
        }
        Value::Str(s) => format!("\"{s}\"").green().to_string(),
        Value::Vector(_) => value.to_string().cyan().to_string(),
        Value::Geometry(_) => value.to_string().magenta().to_string(),
    }
}
