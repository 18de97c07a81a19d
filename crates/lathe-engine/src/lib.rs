// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 The lathe Authors

//! # lathe-engine
//!
//! A compiler-and-interpreter pipeline for a small 3D-modelling scripting
//! language in the OpenSCAD family.
//!
//! ## Overview
//!
//! Source text flows through three stages:
//! - a frontend that lexes (Unicode grapheme-aware, with include-stack
//!   management) and parses each translation unit;
//! - static transforms over the AST: scope-aware constant folding and
//!   duplicate-assignment normalisation;
//! - a bytecode generator lowering to basic blocks and a stack VM with
//!   reference-counted values and tail-call optimisation.
//!
//! File access is abstracted behind two host callbacks (see
//! [`frontend::Sources`]): a resolver mapping directive names to file
//! handles and a provider yielding each file's text.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use lathe_engine::Engine;
//!
//! let mut engine = Engine::new();
//! let outcome = engine.eval("echo(1 + 2 * 3);")?;
//! assert_eq!(outcome.output, "7\n");
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod ast;
pub mod compiler;
pub mod diag;
pub mod frontend;
pub mod lexer;
pub mod parser;
pub mod transform;
pub mod vm;

// Re-exports for convenience
pub use compiler::{GenError, Program};
pub use diag::{SyntaxError, Warning};
pub use frontend::{Frontend, MemorySources, SourceError, Sources};
pub use lexer::{FileHandle, Location};
pub use vm::{EvalError, Evaluator, Value};

use thiserror::Error;

/// Any fatal failure along the pipeline.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Lexing or parsing failed; carries the offending location.
    #[error("syntax error at {0}")]
    Syntax(#[from] SyntaxError),
    /// Code generation hit an unsupported construct or unknown callee.
    #[error("{0}")]
    Codegen(#[from] GenError),
    /// The evaluator failed (invalid bytecode or supervisor stop).
    #[error("{0}")]
    Runtime(#[from] EvalError),
}

/// The result of evaluating a program.
#[derive(Debug)]
pub struct EvalOutcome {
    /// Value returned by the root entry (normally `undef`).
    pub value: Value,
    /// Everything `echo` printed, one value per line.
    pub output: String,
    /// Non-fatal diagnostics from every stage.
    pub warnings: Vec<Warning>,
}

/// The whole pipeline behind one façade.
#[derive(Debug, Default)]
pub struct Engine {
    _private: (),
}

impl Engine {
    /// Creates a new engine instance.
    pub fn new() -> Self {
        Self::default()
    }

    /// Evaluates a single in-memory source text.
    pub fn eval(&mut self, source: &str) -> Result<EvalOutcome, EngineError> {
        let mut sources = MemorySources::new();
        let root = sources.add("input", source);
        Engine::run_sources(sources, root)
    }

    /// Compiles `root` (and its `use`/`include` closure) through parsing,
    /// transformation and code generation.
    pub fn compile_sources<S: Sources>(
        sources: S,
        root: FileHandle,
    ) -> Result<(Program, Vec<Warning>), EngineError> {
        let mut frontend = Frontend::new(sources);
        frontend.parse(root)?;
        transform::ConstEvaluator::transform_units(frontend.units_mut());

        let mut warnings: Vec<Warning> = Vec::new();
        let mut files: Vec<FileHandle> = frontend.units().keys().copied().collect();
        files.sort_unstable();
        for file in files {
            if let Some(unit) = frontend.unit(file) {
                warnings.extend(unit.warnings.iter().cloned());
            }
        }

        let program = compiler::Generator::generate(frontend.units(), root)?;
        warnings.extend(program.warnings.iter().cloned());
        Ok((program, warnings))
    }

    /// Compiles and runs `root`, capturing echo output.
    pub fn run_sources<S: Sources>(
        sources: S,
        root: FileHandle,
    ) -> Result<EvalOutcome, EngineError> {
        let (program, warnings) = Engine::compile_sources(sources, root)?;
        let mut out = Vec::new();
        let mut evaluator = Evaluator::new(&program);
        let value = evaluator.eval(program.entry, &mut out)?;
        Ok(EvalOutcome {
            value,
            output: String::from_utf8_lossy(&out).into_owned(),
            warnings,
        })
    }
}
