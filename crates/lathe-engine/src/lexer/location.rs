//! Source positions with include-chain tracking.

use std::fmt;
use std::rc::Rc;

/// Opaque identifier for a source file, assigned by the host resolver.
pub type FileHandle = u64;

/// Synthetic file handle under which config variables (`$fn` etc.) are
/// registered so they are visible across translation units.
pub const CONFIG_FILE: FileHandle = FileHandle::MAX;

/// A point in a source file.
///
/// `parent` points at the location of the `include` directive that pulled
/// this file in; walking the chain reconstructs the full include path. The
/// chain is acyclic because the scanner refuses recursive includes.
#[derive(Debug, Clone, PartialEq)]
pub struct Position {
    /// Include-site location of the file that included this one.
    pub parent: Option<Rc<Location>>,
    /// The file this position lives in.
    pub src: FileHandle,
    /// 1-based line number.
    pub line: u32,
    /// 1-based column number.
    pub column: u32,
}

impl Position {
    /// Position at the start of a file.
    pub fn start_of(src: FileHandle, parent: Option<Rc<Location>>) -> Self {
        Self {
            parent,
            src,
            line: 1,
            column: 1,
        }
    }
}

/// A half-open span between two positions, attached to tokens and AST nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Location {
    /// First character of the span.
    pub begin: Position,
    /// One past the last character of the span.
    pub end: Position,
}

impl Location {
    /// A span covering the start of a file.
    pub fn start_of(src: FileHandle, parent: Option<Rc<Location>>) -> Self {
        let pos = Position::start_of(src, parent);
        Self {
            begin: pos.clone(),
            end: pos,
        }
    }

    /// Commits the current end as the new begin; called before each token.
    pub fn step(&mut self) {
        self.begin = self.end.clone();
    }

    /// Advances the end column by `count`.
    pub fn columns(&mut self, count: u32) {
        self.end.column += count;
    }

    /// Advances the end position over `text`, counting line terminators.
    /// CRLF counts as a single newline; any newline resets the column.
    pub fn lines_by_text(&mut self, text: &str) {
        let bytes = text.as_bytes();
        let mut i = 0;
        let mut newlines = 0u32;
        while i < bytes.len() {
            match bytes[i] {
                b'\r' => {
                    newlines += 1;
                    if i + 1 < bytes.len() && bytes[i + 1] == b'\n' {
                        i += 1;
                    }
                }
                b'\n' => newlines += 1,
                _ => {}
            }
            i += 1;
        }
        if newlines > 0 {
            self.end.line += newlines;
            self.end.column = 1;
        }
    }

    /// Walks the include chain looking for `file`; used to refuse recursive
    /// includes.
    pub fn include_chain_contains(&self, file: FileHandle) -> bool {
        if self.begin.src == file {
            return true;
        }
        let mut link = self.begin.parent.clone();
        while let Some(loc) = link {
            if loc.begin.src == file {
                return true;
            }
            link = loc.begin.parent.clone();
        }
        false
    }
}

impl Default for Location {
    fn default() -> Self {
        Location::start_of(0, None)
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.src, self.line, self.column)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} - {}", self.begin, self.end)
    }
}
