//! Per-file translation units and the parsing frontend.
//!
//! The frontend owns the host callbacks (a *resolver* mapping textual names
//! to file handles and a *provider* yielding a file's character stream) and
//! the registry of parsed translation units. `parse` is idempotent: a file
//! handle is parsed at most once, and its transitive `use` set is parsed
//! right after it.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::ast::{Assign, FunctionDecl, ModuleDecl, ModuleItem};
use crate::diag::{SyntaxError, Warning};
use crate::lexer::{FileHandle, Scanner};
use crate::parser::Parser;

/// Failure of a host callback. Treated as fatal by the frontend.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    /// The resolver could not map a name to a file handle.
    #[error("cannot resolve \"{0}\"")]
    Unresolved(String),
    /// The provider could not produce a stream for a handle.
    #[error("cannot open file #{0}")]
    Unavailable(FileHandle),
    /// Underlying I/O failure.
    #[error("{0}")]
    Io(String),
}

/// Host callbacks that supply source text.
pub trait Sources {
    /// Maps `name` (as written in `include<…>`/`use<…>`) to a file handle.
    /// `from` is the file the directive appeared in.
    fn resolve(&mut self, name: &str, from: FileHandle) -> Result<FileHandle, SourceError>;

    /// Yields the full source text for `file`.
    fn open(&mut self, file: FileHandle) -> Result<String, SourceError>;
}

/// The compiled form of a single source file.
///
/// Immutable after parsing and transformation; `warnings` collects the
/// non-fatal diagnostics attached to this unit.
#[derive(Debug, Default)]
pub struct TranslationUnit {
    /// The file this unit was parsed from.
    pub file: FileHandle,
    /// Files pulled in via `use<…>` (directly; the frontend parses the
    /// transitive closure).
    pub uses: BTreeSet<FileHandle>,
    /// Module declarations, in source order.
    pub modules: Vec<ModuleDecl>,
    /// Function declarations, in source order.
    pub functions: Vec<FunctionDecl>,
    /// File-scope assignments, in source order.
    pub assignments: Vec<Assign>,
    /// Top-level module calls, in source order.
    pub module_calls: Vec<ModuleItem>,
    /// Accumulated non-fatal diagnostics.
    pub warnings: Vec<Warning>,
}

impl TranslationUnit {
    /// An empty unit for `file`.
    pub fn new(file: FileHandle) -> Self {
        Self {
            file,
            ..Self::default()
        }
    }
}

/// In-memory source set, used by the engine facade and tests.
#[derive(Debug, Default)]
pub struct MemorySources {
    files: Vec<(String, String)>,
}

impl MemorySources {
    /// An empty source set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a named source text, returning its handle.
    pub fn add(&mut self, name: impl Into<String>, text: impl Into<String>) -> FileHandle {
        self.files.push((name.into(), text.into()));
        (self.files.len() - 1) as FileHandle
    }
}

impl Sources for MemorySources {
    fn resolve(&mut self, name: &str, _from: FileHandle) -> Result<FileHandle, SourceError> {
        self.files
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| i as FileHandle)
            .ok_or_else(|| SourceError::Unresolved(name.to_string()))
    }

    fn open(&mut self, file: FileHandle) -> Result<String, SourceError> {
        self.files
            .get(file as usize)
            .map(|(_, text)| text.clone())
            .ok_or(SourceError::Unavailable(file))
    }
}

/// Parser frontend: keeps the `file handle → TranslationUnit` registry.
pub struct Frontend<S: Sources> {
    sources: S,
    units: HashMap<FileHandle, TranslationUnit>,
}

impl<S: Sources> Frontend<S> {
    /// Creates a frontend over the given host callbacks.
    pub fn new(sources: S) -> Self {
        Self {
            sources,
            units: HashMap::new(),
        }
    }

    /// Parses `file` (and, recursively, everything it `use`s) unless it is
    /// already registered, then returns the unit.
    pub fn parse(&mut self, file: FileHandle) -> Result<&TranslationUnit, SyntaxError> {
        if !self.units.contains_key(&file) {
            let mut unit = TranslationUnit::new(file);
            let scanner = Scanner::new(&mut self.sources, file)?;
            Parser::new(scanner)?.parse_unit(&mut unit)?;
            let uses: Vec<FileHandle> = unit.uses.iter().copied().collect();
            self.units.insert(file, unit);
            for used in uses {
                self.parse(used)?;
            }
        }
        Ok(&self.units[&file])
    }

    /// The registered unit for `file`, if parsed.
    pub fn unit(&self, file: FileHandle) -> Option<&TranslationUnit> {
        self.units.get(&file)
    }

    /// All registered units.
    pub fn units(&self) -> &HashMap<FileHandle, TranslationUnit> {
        &self.units
    }

    /// Mutable access to the registered units, used by the AST transforms.
    pub fn units_mut(&mut self) -> &mut HashMap<FileHandle, TranslationUnit> {
        &mut self.units
    }
}
