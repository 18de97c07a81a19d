//! Lookup frames for variable resolution during code generation.
//!
//! A *frame* corresponds to one VM call frame (a function, module or
//! children-block entry); within a frame, lexical *scopes* (loop bodies,
//! `let` bindings, comprehension generators) nest. Slots are stack indices
//! relative to the frame base, so a name resolved in the current frame
//! becomes `GetI slot`, and a name from an enclosing frame becomes
//! `GetParentI depth, slot`.

use std::collections::HashMap;

/// The stack of lookup frames.
#[derive(Debug, Default)]
pub struct ScopeStack {
    frames: Vec<Frame>,
}

#[derive(Debug, Default)]
struct Frame {
    scopes: Vec<HashMap<String, usize>>,
}

impl ScopeStack {
    /// An empty stack.
    pub fn new() -> Self {
        Self::default()
    }

    /// Enters a new call frame with one root scope.
    pub fn push_frame(&mut self) {
        self.frames.push(Frame {
            scopes: vec![HashMap::new()],
        });
    }

    /// Leaves the current call frame.
    pub fn pop_frame(&mut self) {
        self.frames.pop();
    }

    /// Enters a lexical scope within the current frame.
    pub fn push_scope(&mut self) {
        if let Some(frame) = self.frames.last_mut() {
            frame.scopes.push(HashMap::new());
        }
    }

    /// Leaves the innermost lexical scope, returning how many slots it
    /// declared.
    pub fn pop_scope(&mut self) -> usize {
        match self.frames.last_mut().and_then(|f| f.scopes.pop()) {
            Some(scope) => scope.len(),
            None => 0,
        }
    }

    /// Binds `name` to a frame-relative slot in the innermost scope.
    pub fn declare(&mut self, name: impl Into<String>, slot: usize) {
        if let Some(scope) = self
            .frames
            .last_mut()
            .and_then(|frame| frame.scopes.last_mut())
        {
            scope.insert(name.into(), slot);
        }
    }

    /// Resolves `name` in the current frame, innermost scope first.
    pub fn resolve_local(&self, name: &str) -> Option<usize> {
        let frame = self.frames.last()?;
        frame
            .scopes
            .iter()
            .rev()
            .find_map(|scope| scope.get(name))
            .copied()
    }

    /// Resolves `name` in enclosing frames; depth 1 is the immediately
    /// enclosing frame. The file scope is not a frame and is never
    /// searched here.
    pub fn resolve_parent(&self, name: &str) -> Option<(u8, usize)> {
        for (distance, frame) in self.frames.iter().rev().skip(1).enumerate() {
            let found = frame
                .scopes
                .iter()
                .rev()
                .find_map(|scope| scope.get(name))
                .copied();
            if let Some(slot) = found {
                return Some(((distance + 1) as u8, slot));
            }
        }
        None
    }

    /// Number of active frames.
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_resolution_innermost_first() {
        let mut scopes = ScopeStack::new();
        scopes.push_frame();
        scopes.declare("x", 0);
        scopes.push_scope();
        scopes.declare("x", 3);
        assert_eq!(scopes.resolve_local("x"), Some(3));
        assert_eq!(scopes.pop_scope(), 1);
        assert_eq!(scopes.resolve_local("x"), Some(0));
    }

    #[test]
    fn test_parent_resolution_reports_depth() {
        let mut scopes = ScopeStack::new();
        scopes.push_frame();
        scopes.declare("a", 2);
        scopes.push_frame();
        scopes.declare("b", 0);
        scopes.push_frame();
        assert_eq!(scopes.resolve_local("a"), None);
        assert_eq!(scopes.resolve_parent("b"), Some((1, 0)));
        assert_eq!(scopes.resolve_parent("a"), Some((2, 2)));
        assert_eq!(scopes.resolve_parent("missing"), None);
    }

    #[test]
    fn test_pop_frame_hides_locals() {
        let mut scopes = ScopeStack::new();
        scopes.push_frame();
        scopes.declare("x", 1);
        scopes.push_frame();
        scopes.pop_frame();
        assert_eq!(scopes.resolve_local("x"), Some(1));
        assert_eq!(scopes.frame_count(), 1);
    }
}
