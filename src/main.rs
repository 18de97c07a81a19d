// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 The lathe Authors

//! Lathe - a compiler and interpreter for a small OpenSCAD-family
//! modelling language.
//!
//! This is the main entry point for the lathe CLI/REPL driver.

mod repl;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use clap::Parser;
use lathe_engine::frontend::{SourceError, Sources};
use lathe_engine::{Engine, FileHandle, Frontend};
use tracing_subscriber::EnvFilter;

/// Command-line options.
#[derive(Debug, Parser)]
#[command(name = "lathe", version, about = "Run lathe modelling scripts")]
struct Cli {
    /// Script files to run; with none, an interactive REPL starts.
    files: Vec<PathBuf>,

    /// Print the generated bytecode instead of running it.
    #[arg(long)]
    disasm: bool,

    /// Print the parsed and transformed translation units instead of
    /// running them.
    #[arg(long)]
    ast: bool,
}

/// Filesystem-backed host callbacks: `include<…>`/`use<…>` names resolve
/// relative to the directory of the including file.
struct FsSources {
    paths: Vec<PathBuf>,
    interned: HashMap<PathBuf, FileHandle>,
}

impl FsSources {
    fn new() -> Self {
        Self {
            paths: Vec::new(),
            interned: HashMap::new(),
        }
    }

    fn add_root(&mut self, path: &Path) -> Result<FileHandle, SourceError> {
        let canonical = path
            .canonicalize()
            .map_err(|e| SourceError::Io(format!("{}: {e}", path.display())))?;
        Ok(self.intern(canonical))
    }

    fn intern(&mut self, path: PathBuf) -> FileHandle {
        if let Some(&handle) = self.interned.get(&path) {
            return handle;
        }
        let handle = self.paths.len() as FileHandle;
        self.paths.push(path.clone());
        self.interned.insert(path, handle);
        handle
    }

    fn path_of(&self, file: FileHandle) -> Option<&Path> {
        self.paths.get(file as usize).map(PathBuf::as_path)
    }
}

impl Sources for FsSources {
    fn resolve(&mut self, name: &str, from: FileHandle) -> Result<FileHandle, SourceError> {
        let base = self
            .path_of(from)
            .ok_or(SourceError::Unavailable(from))?
            .to_path_buf();
        let dir = base.parent().unwrap_or_else(|| Path::new("."));
        let canonical = dir
            .join(name)
            .canonicalize()
            .map_err(|_| SourceError::Unresolved(name.to_string()))?;
        Ok(self.intern(canonical))
    }

    fn open(&mut self, file: FileHandle) -> Result<String, SourceError> {
        let path = self
            .path_of(file)
            .ok_or(SourceError::Unavailable(file))?
            .to_path_buf();
        std::fs::read_to_string(&path)
            .map_err(|e| SourceError::Io(format!("{}: {e}", path.display())))
    }
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_target(false)
        .init();

    let cli = Cli::parse();

    if cli.files.is_empty() {
        match repl::Repl::new() {
            Ok(mut repl) => {
                if let Err(e) = repl.run() {
                    tracing::error!("repl failed: {e}");
                    std::process::exit(1);
                }
            }
            Err(e) => {
                tracing::error!("cannot start repl: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let mut failed = false;
    for file in &cli.files {
        if let Err(e) = run_file(file, cli.disasm, cli.ast) {
            tracing::error!("{}: {e}", file.display());
            failed = true;
        }
    }
    if failed {
        std::process::exit(1);
    }
}

fn run_file(path: &Path, disasm: bool, ast: bool) -> Result<(), Box<dyn std::error::Error>> {
    let mut sources = FsSources::new();
    let root = sources.add_root(path)?;

    if ast {
        let mut frontend = Frontend::new(sources);
        frontend.parse(root)?;
        lathe_engine::transform::ConstEvaluator::transform_units(frontend.units_mut());
        let mut files: Vec<FileHandle> = frontend.units().keys().copied().collect();
        files.sort_unstable();
        for file in files {
            if let Some(unit) = frontend.unit(file) {
                println!("{unit:#?}");
            }
        }
        return Ok(());
    }

    if disasm {
        let (program, warnings) = Engine::compile_sources(sources, root)?;
        for warning in &warnings {
            tracing::warn!("{warning}");
        }
        print!("{}", program.listing()?);
        return Ok(());
    }

    let outcome = Engine::run_sources(sources, root)?;
    for warning in &outcome.warnings {
        tracing::warn!("{warning}");
    }
    print!("{}", outcome.output);
    Ok(())
}
