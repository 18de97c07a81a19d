//! Code generation from AST to bytecode.
//!
//! Each function, module body or children block lowers first into a list of
//! basic blocks (`{bytes, jump_false, iter, next}`), which a final pass
//! linearises into one byte vector with resolved relative offsets. Jump
//! offsets always use the wide immediate form so block sizes are known
//! up front.
//!
//! Variable resolution searches, in order: the shared config-variable table
//! (leading `$`), the current lookup frame, enclosing frames (emitting a
//! parent-frame get), and finally the file's global scope. A miss records
//! an "undefined variable" warning and pushes `undef`.

mod scope;

#[cfg(test)]
mod tests;

pub use scope::ScopeStack;

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use super::instructions::*;
use super::{FunctionEntry, Program};
use crate::ast::*;
use crate::diag::Warning;
use crate::frontend::TranslationUnit;
use crate::lexer::{CONFIG_FILE, FileHandle, Location};
use crate::vm::Value;

/// A fatal code-generation error: unsupported construct or unknown callee.
#[derive(Debug, Clone, Error)]
#[error("{loc}: {message}")]
pub struct GenError {
    /// Where the offending construct sits.
    pub loc: Location,
    /// What went wrong.
    pub message: String,
}

impl GenError {
    fn new(loc: Location, message: impl Into<String>) -> Self {
        Self {
            loc,
            message: message.into(),
        }
    }
}

/// One basic block: straight-line bytes plus structured exits.
#[derive(Debug, Default)]
struct BasicBlock {
    code: Vec<u8>,
    /// Conditional exit: `JumpFalseI` to this block.
    jump_false: Option<usize>,
    /// Iteration exit: `Iter` branches here while elements remain.
    iter: Option<usize>,
    /// Fallthrough block; `None` marks a terminal block (ends in `Ret` or
    /// a tail call).
    next: Option<usize>,
}

/// Per-function lowering state. `depth` tracks the simulated operand-stack
/// height relative to the frame base, which is what slot indices mean.
struct FnBody {
    blocks: Vec<BasicBlock>,
    current: usize,
    depth: usize,
}

impl FnBody {
    fn new(parameters: usize) -> Self {
        Self {
            blocks: vec![BasicBlock::default()],
            current: 0,
            depth: parameters,
        }
    }

    fn code(&mut self) -> &mut Vec<u8> {
        &mut self.blocks[self.current].code
    }

    fn new_block(&mut self) -> usize {
        self.blocks.push(BasicBlock::default());
        self.blocks.len() - 1
    }
}

/// Lowers transformed translation units into a bytecode program.
pub struct Generator<'u> {
    units: &'u HashMap<FileHandle, TranslationUnit>,
    functions: Vec<FunctionEntry>,
    /// Declared parameters per function id, used to arrange call arguments.
    params: Vec<Vec<Assign>>,
    function_map: HashMap<(FileHandle, String), usize>,
    module_map: HashMap<(FileHandle, String), usize>,
    unit_entries: HashMap<FileHandle, usize>,
    global_map: HashMap<(FileHandle, String), usize>,
    globals: Vec<Value>,
    global_names: Vec<String>,
    string_pool: HashMap<String, usize>,
    /// Name-resolution order per unit: the unit itself, then its transitive
    /// `use` set breadth-first.
    resolution_order: HashMap<FileHandle, Vec<FileHandle>>,
    scopes: ScopeStack,
    warnings: Vec<Warning>,
    current_file: FileHandle,
}

impl<'u> Generator<'u> {
    /// Generates the program rooted at `root` from transformed units.
    pub fn generate(
        units: &'u HashMap<FileHandle, TranslationUnit>,
        root: FileHandle,
    ) -> Result<Program, GenError> {
        let mut generator = Generator {
            units,
            functions: Vec::new(),
            params: Vec::new(),
            function_map: HashMap::new(),
            module_map: HashMap::new(),
            unit_entries: HashMap::new(),
            global_map: HashMap::new(),
            globals: Vec::new(),
            global_names: Vec::new(),
            string_pool: HashMap::new(),
            resolution_order: HashMap::new(),
            scopes: ScopeStack::new(),
            warnings: Vec::new(),
            current_file: root,
        };
        generator.assign_ids();
        generator.register_globals();

        let files = generator.sorted_files();
        for file in files {
            generator.current_file = file;
            let unit = &generator.units[&file];

            for decl in &unit.functions {
                let id = generator.function_map[&(file, decl.name.clone())];
                generator.compile_function(id, decl)?;
            }
            for decl in &unit.modules {
                let id = generator.module_map[&(file, decl.name.clone())];
                let params = decl.params.clone();
                generator.compile_entry(id, &params, &decl.body, false, &[])?;
            }

            let entry_id = generator.unit_entries[&file];
            let prologue = if file == root {
                generator.init_order(root)
            } else {
                Vec::new()
            };
            generator.compile_entry(entry_id, &[], &unit_body(unit), true, &prologue)?;
        }

        let entry = generator.unit_entries[&root];
        Ok(Program {
            functions: generator.functions,
            globals: generator.globals,
            global_names: generator.global_names,
            entry,
            warnings: generator.warnings,
        })
    }

    fn sorted_files(&self) -> Vec<FileHandle> {
        let mut files: Vec<FileHandle> = self.units.keys().copied().collect();
        files.sort_unstable();
        files
    }

    /// Pre-assigns ids for every declared function, module and unit entry,
    /// so call sites can reference entries not yet compiled.
    fn assign_ids(&mut self) {
        for file in self.sorted_files() {
            let unit = &self.units[&file];
            for decl in &unit.functions {
                let id = self.alloc_function(decl.params.clone());
                self.function_map.insert((file, decl.name.clone()), id);
            }
            for decl in &unit.modules {
                let id = self.alloc_function(decl.params.clone());
                self.module_map.insert((file, decl.name.clone()), id);
            }
            let entry = self.alloc_function(Vec::new());
            self.unit_entries.insert(file, entry);

            let mut order = vec![file];
            let mut seen: BTreeSet<FileHandle> = BTreeSet::new();
            seen.insert(file);
            let mut queue: Vec<FileHandle> = unit.uses.iter().copied().collect();
            while let Some(used) = queue.pop() {
                if seen.insert(used) {
                    order.push(used);
                    if let Some(used_unit) = self.units.get(&used) {
                        queue.extend(used_unit.uses.iter().copied());
                    }
                }
            }
            self.resolution_order.insert(file, order);
        }
    }

    /// Registers a global slot for every file-scope assignment.
    fn register_globals(&mut self) {
        for file in self.sorted_files() {
            let unit = &self.units[&file];
            for assign in &unit.assignments {
                let key = global_key(file, &assign.ident);
                self.ensure_global(key);
            }
        }
    }

    fn alloc_function(&mut self, params: Vec<Assign>) -> usize {
        self.functions.push(FunctionEntry::default());
        self.params.push(params);
        self.functions.len() - 1
    }

    fn ensure_global(&mut self, key: (FileHandle, String)) -> usize {
        if let Some(&slot) = self.global_map.get(&key) {
            return slot;
        }
        let slot = self.globals.len();
        self.globals.push(Value::Undef);
        self.global_names.push(if key.0 == CONFIG_FILE {
            key.1.clone()
        } else {
            format!("{}:{}", key.0, key.1)
        });
        self.global_map.insert(key, slot);
        slot
    }

    fn intern_string(&mut self, text: &str) -> usize {
        if let Some(&slot) = self.string_pool.get(text) {
            return slot;
        }
        let slot = self.globals.len();
        self.globals.push(Value::string(text));
        self.global_names.push(format!("{text:?}"));
        self.string_pool.insert(text.to_string(), slot);
        slot
    }

    /// Unit-initialisation order for the root: dependencies before
    /// dependents, each exactly once, the root excluded.
    fn init_order(&self, root: FileHandle) -> Vec<usize> {
        let mut order = Vec::new();
        let mut seen: BTreeSet<FileHandle> = BTreeSet::new();
        seen.insert(root);
        self.init_order_visit(root, &mut seen, &mut order);
        order
    }

    fn init_order_visit(
        &self,
        file: FileHandle,
        seen: &mut BTreeSet<FileHandle>,
        order: &mut Vec<usize>,
    ) {
        let Some(unit) = self.units.get(&file) else {
            return;
        };
        for &used in &unit.uses {
            if seen.insert(used) {
                self.init_order_visit(used, seen, order);
                if let Some(&entry) = self.unit_entries.get(&used) {
                    order.push(entry);
                }
            }
        }
    }

    fn resolve_function(&self, name: &str) -> Option<usize> {
        let order = self.resolution_order.get(&self.current_file)?;
        order
            .iter()
            .find_map(|&file| self.function_map.get(&(file, name.to_string())))
            .copied()
    }

    fn resolve_module(&self, name: &str) -> Option<usize> {
        let order = self.resolution_order.get(&self.current_file)?;
        order
            .iter()
            .find_map(|&file| self.module_map.get(&(file, name.to_string())))
            .copied()
    }

    // ========================================================================
    // Function compilation
    // ========================================================================

    fn compile_function(&mut self, id: usize, decl: &FunctionDecl) -> Result<(), GenError> {
        self.scopes.push_frame();
        let mut body = FnBody::new(decl.params.len());
        for (i, param) in decl.params.iter().enumerate() {
            self.scopes.declare(&param.ident, i);
        }
        self.gen_expr_tail(&mut body, &decl.body)?;
        self.scopes.pop_frame();
        self.functions[id] = FunctionEntry {
            code: linearize(&body.blocks),
            parameters: decl.params.len() as u32,
            is_module: false,
        };
        Ok(())
    }

    /// Compiles a module-shaped entry: a module declaration, a unit's init
    /// entry (`file_scope`), or a children block. `prologue` lists unit
    /// entries to call first.
    fn compile_entry(
        &mut self,
        id: usize,
        params: &[Assign],
        mbody: &ModuleBody,
        file_scope: bool,
        prologue: &[usize],
    ) -> Result<(), GenError> {
        self.scopes.push_frame();
        let mut body = FnBody::new(params.len());
        for (i, param) in params.iter().enumerate() {
            self.scopes.declare(&param.ident, i);
        }

        for &init in prologue {
            add_inst_imm(body.code(), Opcode::CallI, init as i32);
            body.depth += 1;
            add_inst(body.code(), Opcode::Pop);
            body.depth -= 1;
        }

        for assign in &mbody.assignments {
            let Some(expr) = &assign.expr else { continue };
            self.gen_expr(&mut body, expr)?;
            if file_scope || is_config_var(&assign.ident) {
                let key = global_key(self.current_file, &assign.ident);
                let slot = self.ensure_global(key);
                add_inst_imm(body.code(), Opcode::SetGlobalI, slot as i32);
                body.depth -= 1;
            } else {
                self.scopes.declare(&assign.ident, body.depth - 1);
            }
        }

        for child in &mbody.children {
            self.gen_module_item(&mut body, child)?;
        }

        add_const_misc(body.code(), 2);
        body.depth += 1;
        add_inst(body.code(), Opcode::Ret);

        self.scopes.pop_frame();
        self.functions[id] = FunctionEntry {
            code: linearize(&body.blocks),
            parameters: params.len() as u32,
            is_module: true,
        };
        Ok(())
    }

    // ========================================================================
    // Statements
    // ========================================================================

    fn gen_module_item(&mut self, body: &mut FnBody, item: &ModuleItem) -> Result<(), GenError> {
        match item {
            ModuleItem::Single(call) => self.gen_module_call(body, call),
            ModuleItem::If(ifm) => self.gen_if_module(body, ifm),
            ModuleItem::Modifier(modifier) => {
                // `*` disables the wrapped subtree; the viewer hints
                // `!`, `#`, `%` have no backend here and compile through.
                if modifier.tag == '*' {
                    Ok(())
                } else {
                    self.gen_module_item(body, &modifier.inner)
                }
            }
        }
    }

    fn gen_module_call(
        &mut self,
        body: &mut FnBody,
        call: &SingleModuleCall,
    ) -> Result<(), GenError> {
        match call.name.as_str() {
            "echo" => {
                for arg in &call.args {
                    let Some(expr) = &arg.expr else { continue };
                    self.gen_expr(body, expr)?;
                    add_inst(body.code(), Opcode::Echo);
                    add_inst(body.code(), Opcode::Pop);
                    body.depth -= 1;
                }
                Ok(())
            }
            "children" => {
                self.warnings.push(Warning::new(
                    call.loc.clone(),
                    "children() not supported".to_string(),
                ));
                Ok(())
            }
            "for" | "intersection_for" => self.gen_for_level(body, &call.args, 0, &call.body),
            _ => {
                let Some(module_id) = self.resolve_module(&call.name) else {
                    return Err(GenError::new(
                        call.loc.clone(),
                        format!("unknown module \"{}\"", call.name),
                    ));
                };
                self.gen_call_args(body, &call.args, module_id, &call.loc)?;
                let arity = self.params[module_id].len();
                add_inst_imm(body.code(), Opcode::CallI, module_id as i32);
                body.depth = body.depth - arity + 1;
                add_inst(body.code(), Opcode::Pop);
                body.depth -= 1;

                if !call.body.is_empty() {
                    // The trailing block becomes its own module entry,
                    // invoked right after the call; enclosing-frame
                    // variables inside it resolve through GetParentI.
                    let child_id = self.alloc_function(Vec::new());
                    self.compile_entry(child_id, &[], &call.body, false, &[])?;
                    add_inst_imm(body.code(), Opcode::CallI, child_id as i32);
                    body.depth += 1;
                    add_inst(body.code(), Opcode::Pop);
                    body.depth -= 1;
                }
                Ok(())
            }
        }
    }

    fn gen_if_module(&mut self, body: &mut FnBody, ifm: &IfModule) -> Result<(), GenError> {
        // A literal condition (possibly the result of constant folding)
        // selects its branch here; JumpFalseI only ever sees booleans.
        match &ifm.cond.kind {
            ExprKind::Number(n) => {
                let chosen = if n.abs() == 0.0 {
                    &ifm.else_body
                } else {
                    &ifm.then_body
                };
                return self.gen_branch_body(body, chosen);
            }
            ExprKind::Bool(b) => {
                let chosen = if *b { &ifm.then_body } else { &ifm.else_body };
                return self.gen_branch_body(body, chosen);
            }
            ExprKind::Undef => return self.gen_branch_body(body, &ifm.else_body),
            _ => {}
        }

        self.gen_expr(body, &ifm.cond)?;
        let entry_depth = body.depth - 1;

        let then_block = body.new_block();
        let else_block = body.new_block();
        let tail_block = body.new_block();
        body.blocks[body.current].jump_false = Some(else_block);
        body.blocks[body.current].next = Some(then_block);

        body.current = then_block;
        body.depth = entry_depth;
        self.gen_branch_body(body, &ifm.then_body)?;
        body.blocks[body.current].next = Some(tail_block);

        body.current = else_block;
        body.depth = entry_depth;
        self.gen_branch_body(body, &ifm.else_body)?;
        body.blocks[body.current].next = Some(tail_block);

        body.current = tail_block;
        body.depth = entry_depth;
        Ok(())
    }

    /// A nested statement body: assignments become scoped locals, children
    /// run in order, locals pop at the end.
    fn gen_branch_body(&mut self, body: &mut FnBody, mbody: &ModuleBody) -> Result<(), GenError> {
        self.scopes.push_scope();
        let mut declared = 0usize;
        for assign in &mbody.assignments {
            let Some(expr) = &assign.expr else { continue };
            self.gen_expr(body, expr)?;
            if is_config_var(&assign.ident) {
                let key = global_key(self.current_file, &assign.ident);
                let slot = self.ensure_global(key);
                add_inst_imm(body.code(), Opcode::SetGlobalI, slot as i32);
                body.depth -= 1;
            } else {
                self.scopes.declare(&assign.ident, body.depth - 1);
                declared += 1;
            }
        }
        for child in &mbody.children {
            self.gen_module_item(body, child)?;
        }
        for _ in 0..declared {
            add_inst(body.code(), Opcode::Pop);
            body.depth -= 1;
        }
        self.scopes.pop_scope();
        Ok(())
    }

    /// One nesting level of a `for` statement; the innermost level runs the
    /// loop body.
    fn gen_for_level(
        &mut self,
        body: &mut FnBody,
        bindings: &[Assign],
        index: usize,
        mbody: &ModuleBody,
    ) -> Result<(), GenError> {
        if index == bindings.len() {
            return self.gen_branch_body(body, mbody);
        }
        let binding = &bindings[index];
        let (Some(expr), false) = (&binding.expr, binding.ident.is_empty()) else {
            return Err(GenError::new(
                binding.loc.clone(),
                "for loop requires named bindings".to_string(),
            ));
        };

        self.gen_expr(body, expr)?;
        add_double(body.code(), -1.0);
        body.depth += 1;
        let loop_depth = body.depth;

        let head = body.new_block();
        let loop_body = body.new_block();
        let after = body.new_block();
        body.blocks[body.current].next = Some(head);
        body.blocks[head].iter = Some(loop_body);
        body.blocks[head].next = Some(after);

        body.current = loop_body;
        body.depth = loop_depth + 1;
        self.scopes.push_scope();
        self.scopes.declare(&binding.ident, body.depth - 1);
        self.gen_for_level(body, bindings, index + 1, mbody)?;
        self.scopes.pop_scope();
        add_inst(body.code(), Opcode::Pop);
        body.depth -= 1;
        body.blocks[body.current].next = Some(head);

        body.current = after;
        body.depth = loop_depth - 2;
        Ok(())
    }

    // ========================================================================
    // Expressions
    // ========================================================================

    /// Lowers `expr`, leaving exactly one more value on the stack.
    fn gen_expr(&mut self, body: &mut FnBody, expr: &ExprRef) -> Result<(), GenError> {
        match &expr.kind {
            ExprKind::Number(value) => {
                add_double(body.code(), *value);
                body.depth += 1;
            }
            ExprKind::Str(text) => {
                let slot = self.intern_string(text);
                add_inst_imm(body.code(), Opcode::GetGlobalI, slot as i32);
                body.depth += 1;
            }
            ExprKind::Bool(value) => {
                add_const_misc(body.code(), u8::from(*value));
                body.depth += 1;
            }
            ExprKind::Undef => {
                add_const_misc(body.code(), 2);
                body.depth += 1;
            }
            ExprKind::Ident(name) => self.gen_ident(body, name, &expr.loc),
            ExprKind::Unary { op, operand } => {
                self.gen_expr(body, operand)?;
                let builtin = match op {
                    UnaryOp::Neg => BuiltinUnary::Neg,
                    UnaryOp::Not => BuiltinUnary::Not,
                };
                add_unary_op(body.code(), builtin);
            }
            ExprKind::Binary { op, lhs, rhs } => {
                self.gen_expr(body, lhs)?;
                self.gen_expr(body, rhs)?;
                add_bin_op(body.code(), (*op).into());
                body.depth -= 1;
            }
            ExprKind::Call { callee, args } => {
                self.gen_call(body, callee, args, &expr.loc, false)?;
            }
            ExprKind::If {
                cond,
                then_expr,
                else_expr,
            } => {
                self.gen_expr(body, cond)?;
                let entry_depth = body.depth - 1;

                let then_block = body.new_block();
                let else_block = body.new_block();
                let tail_block = body.new_block();
                body.blocks[body.current].jump_false = Some(else_block);
                body.blocks[body.current].next = Some(then_block);

                body.current = then_block;
                body.depth = entry_depth;
                self.gen_expr(body, then_expr)?;
                body.blocks[body.current].next = Some(tail_block);

                body.current = else_block;
                body.depth = entry_depth;
                self.gen_expr(body, else_expr)?;
                body.blocks[body.current].next = Some(tail_block);

                body.current = tail_block;
                body.depth = entry_depth + 1;
            }
            ExprKind::List { elems } => {
                add_inst(body.code(), Opcode::MakeList);
                body.depth += 1;
                for elem in elems {
                    self.gen_expr(body, &elem.expr)?;
                    let op = if elem.splat {
                        VmBinOp::Concat
                    } else {
                        VmBinOp::Append
                    };
                    add_bin_op(body.code(), op);
                    body.depth -= 1;
                }
            }
            ExprKind::Range { start, step, end } => {
                match step {
                    Some(step) => self.gen_expr(body, step)?,
                    None => {
                        add_double(body.code(), 1.0);
                        body.depth += 1;
                    }
                }
                self.gen_expr(body, start)?;
                self.gen_expr(body, end)?;
                add_inst(body.code(), Opcode::MakeRange);
                body.depth -= 2;
            }
            ExprKind::ListComp {
                bindings,
                generators,
            } => {
                add_inst(body.code(), Opcode::MakeList);
                body.depth += 1;
                let result_slot = body.depth - 1;
                self.gen_comp_level(body, bindings, 0, generators, result_slot)?;
            }
            ExprKind::ListCompC {
                init,
                cond,
                update,
                generators,
            } => {
                self.gen_list_comp_c(body, init, cond, update, generators)?;
            }
            ExprKind::Index { list, index } => {
                self.gen_expr(body, list)?;
                self.gen_expr(body, index)?;
                add_bin_op(body.code(), VmBinOp::Index);
                body.depth -= 1;
            }
            ExprKind::Let { bindings, body: inner } => {
                self.gen_let(body, bindings, inner, false)?;
            }
            ExprKind::Lambda { .. } => {
                return Err(GenError::new(
                    expr.loc.clone(),
                    "lambda not supported".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Lowers `expr` in tail position: every control path either tail-calls
    /// or ends the function with `Ret`.
    fn gen_expr_tail(&mut self, body: &mut FnBody, expr: &ExprRef) -> Result<(), GenError> {
        match &expr.kind {
            ExprKind::If {
                cond,
                then_expr,
                else_expr,
            } => {
                self.gen_expr(body, cond)?;
                let entry_depth = body.depth - 1;

                let then_block = body.new_block();
                let else_block = body.new_block();
                body.blocks[body.current].jump_false = Some(else_block);
                body.blocks[body.current].next = Some(then_block);

                body.current = then_block;
                body.depth = entry_depth;
                self.gen_expr_tail(body, then_expr)?;

                body.current = else_block;
                body.depth = entry_depth;
                self.gen_expr_tail(body, else_expr)?;
                Ok(())
            }
            ExprKind::Let { bindings, body: inner } => {
                self.gen_let(body, bindings, inner, true)?;
                Ok(())
            }
            ExprKind::Call { callee, args } => {
                let user_target = match &callee.kind {
                    ExprKind::Ident(name) => self.resolve_function(name),
                    _ => None,
                };
                if user_target.is_some() {
                    self.gen_call(body, callee, args, &expr.loc, true)
                } else {
                    self.gen_expr(body, expr)?;
                    add_inst(body.code(), Opcode::Ret);
                    Ok(())
                }
            }
            _ => {
                self.gen_expr(body, expr)?;
                add_inst(body.code(), Opcode::Ret);
                Ok(())
            }
        }
    }

    fn gen_ident(&mut self, body: &mut FnBody, name: &str, loc: &Location) {
        if is_config_var(name) {
            let slot = self.ensure_global((CONFIG_FILE, name.to_string()));
            add_inst_imm(body.code(), Opcode::GetGlobalI, slot as i32);
            body.depth += 1;
            return;
        }
        if let Some(slot) = self.scopes.resolve_local(name) {
            add_inst_imm(body.code(), Opcode::GetI, slot as i32);
            body.depth += 1;
            return;
        }
        if let Some((depth, slot)) = self.scopes.resolve_parent(name) {
            add_get_parent(body.code(), depth, slot as i32);
            body.depth += 1;
            return;
        }
        if let Some(&slot) = self
            .global_map
            .get(&(self.current_file, name.to_string()))
        {
            add_inst_imm(body.code(), Opcode::GetGlobalI, slot as i32);
            body.depth += 1;
            return;
        }
        self.warnings
            .push(Warning::new(loc.clone(), "undefined variable".to_string()));
        add_const_misc(body.code(), 2);
        body.depth += 1;
    }

    fn gen_call(
        &mut self,
        body: &mut FnBody,
        callee: &ExprRef,
        args: &[Assign],
        loc: &Location,
        tail: bool,
    ) -> Result<(), GenError> {
        let ExprKind::Ident(name) = &callee.kind else {
            return Err(GenError::new(
                callee.loc.clone(),
                "lambda not supported".to_string(),
            ));
        };

        if let Some(function_id) = self.resolve_function(name) {
            self.gen_call_args(body, args, function_id, loc)?;
            let arity = self.params[function_id].len();
            if tail {
                add_inst_imm(body.code(), Opcode::TailCallI, function_id as i32);
            } else {
                add_inst_imm(body.code(), Opcode::CallI, function_id as i32);
                body.depth = body.depth - arity + 1;
            }
            return Ok(());
        }

        if let Some(builtin) = BuiltinUnary::from_name(name) {
            if args.len() != 1 || !args[0].ident.is_empty() {
                return Err(GenError::new(
                    loc.clone(),
                    format!("builtin \"{name}\" expects one positional argument"),
                ));
            }
            let Some(arg) = &args[0].expr else {
                return Err(GenError::new(loc.clone(), "missing argument".to_string()));
            };
            self.gen_expr(body, arg)?;
            add_unary_op(body.code(), builtin);
            if tail {
                add_inst(body.code(), Opcode::Ret);
            }
            return Ok(());
        }

        Err(GenError::new(
            loc.clone(),
            format!("unknown function \"{name}\""),
        ))
    }

    /// Pushes call arguments in parameter order: positional by position,
    /// named by name, declaration defaults for the rest, `undef` when
    /// nothing applies.
    fn gen_call_args(
        &mut self,
        body: &mut FnBody,
        args: &[Assign],
        callee_id: usize,
        loc: &Location,
    ) -> Result<(), GenError> {
        let params = self.params[callee_id].clone();
        let positional: Vec<&Assign> = args.iter().filter(|a| a.ident.is_empty()).collect();
        if positional.len() > params.len() {
            self.warnings
                .push(Warning::new(loc.clone(), "too many arguments".to_string()));
        }
        for named in args.iter().filter(|a| !a.ident.is_empty()) {
            if !params.iter().any(|p| p.ident == named.ident) {
                self.warnings.push(Warning::new(
                    named.loc.clone(),
                    format!("unknown argument \"{}\"", named.ident),
                ));
            }
        }

        for (i, param) in params.iter().enumerate() {
            let named = args.iter().find(|a| a.ident == param.ident);
            let chosen = named
                .and_then(|a| a.expr.as_ref())
                .or_else(|| positional.get(i).and_then(|a| a.expr.as_ref()))
                .or(param.expr.as_ref());
            match chosen {
                Some(expr) => {
                    let expr = expr.clone();
                    self.gen_expr(body, &expr)?;
                }
                None => {
                    add_const_misc(body.code(), 2);
                    body.depth += 1;
                }
            }
        }
        Ok(())
    }

    fn gen_let(
        &mut self,
        body: &mut FnBody,
        bindings: &[Assign],
        inner: &ExprRef,
        tail: bool,
    ) -> Result<(), GenError> {
        self.scopes.push_scope();
        let first_slot = body.depth;
        let mut declared = 0usize;
        for binding in bindings {
            match &binding.expr {
                Some(expr) => self.gen_expr(body, expr)?,
                None => {
                    add_const_misc(body.code(), 2);
                    body.depth += 1;
                }
            }
            self.scopes.declare(&binding.ident, body.depth - 1);
            declared += 1;
        }

        if tail {
            // A tail call (or Ret) unwinds the whole frame; no cleanup.
            self.gen_expr_tail(body, inner)?;
        } else {
            self.gen_expr(body, inner)?;
            if declared > 0 {
                add_inst_imm(body.code(), Opcode::SetI, first_slot as i32);
                body.depth -= 1;
                for _ in 0..declared - 1 {
                    add_inst(body.code(), Opcode::Pop);
                    body.depth -= 1;
                }
            }
        }
        self.scopes.pop_scope();
        Ok(())
    }

    /// One nesting level of a comprehension; the innermost level appends
    /// the generator expressions.
    fn gen_comp_level(
        &mut self,
        body: &mut FnBody,
        bindings: &[Assign],
        index: usize,
        generators: &[ListElem],
        result_slot: usize,
    ) -> Result<(), GenError> {
        if index == bindings.len() {
            return self.gen_comp_generators(body, generators, result_slot);
        }
        let binding = &bindings[index];
        let (Some(expr), false) = (&binding.expr, binding.ident.is_empty()) else {
            return Err(GenError::new(
                binding.loc.clone(),
                "comprehension requires named bindings".to_string(),
            ));
        };

        self.gen_expr(body, expr)?;
        add_double(body.code(), -1.0);
        body.depth += 1;
        let loop_depth = body.depth;

        let head = body.new_block();
        let loop_body = body.new_block();
        let after = body.new_block();
        body.blocks[body.current].next = Some(head);
        body.blocks[head].iter = Some(loop_body);
        body.blocks[head].next = Some(after);

        body.current = loop_body;
        body.depth = loop_depth + 1;
        self.scopes.push_scope();
        self.scopes.declare(&binding.ident, body.depth - 1);
        self.gen_comp_level(body, bindings, index + 1, generators, result_slot)?;
        self.scopes.pop_scope();
        add_inst(body.code(), Opcode::Pop);
        body.depth -= 1;
        body.blocks[body.current].next = Some(head);

        body.current = after;
        body.depth = loop_depth - 2;
        Ok(())
    }

    /// Appends each generator value to the result vector. The result is
    /// stolen out of its slot around the append so the vector stays
    /// uniquely held and mutates in place.
    fn gen_comp_generators(
        &mut self,
        body: &mut FnBody,
        generators: &[ListElem],
        result_slot: usize,
    ) -> Result<(), GenError> {
        for generator in generators {
            add_inst_imm(body.code(), Opcode::GetI, result_slot as i32);
            body.depth += 1;
            add_const_misc(body.code(), 2);
            body.depth += 1;
            add_inst_imm(body.code(), Opcode::SetI, result_slot as i32);
            body.depth -= 1;

            self.gen_expr(body, &generator.expr)?;
            let op = if generator.splat {
                VmBinOp::Concat
            } else {
                VmBinOp::Append
            };
            add_bin_op(body.code(), op);
            body.depth -= 1;

            add_inst_imm(body.code(), Opcode::SetI, result_slot as i32);
            body.depth -= 1;
        }
        Ok(())
    }

    fn gen_list_comp_c(
        &mut self,
        body: &mut FnBody,
        init: &[Assign],
        cond: &ExprRef,
        update: &[Assign],
        generators: &[ListElem],
    ) -> Result<(), GenError> {
        add_inst(body.code(), Opcode::MakeList);
        body.depth += 1;
        let result_slot = body.depth - 1;

        self.scopes.push_scope();
        for binding in init {
            let (Some(expr), false) = (&binding.expr, binding.ident.is_empty()) else {
                return Err(GenError::new(
                    binding.loc.clone(),
                    "comprehension requires named bindings".to_string(),
                ));
            };
            self.gen_expr(body, expr)?;
            self.scopes.declare(&binding.ident, body.depth - 1);
        }
        let loop_depth = body.depth;

        let head = body.new_block();
        body.blocks[body.current].next = Some(head);
        body.current = head;
        self.gen_expr(body, cond)?;
        let loop_body = body.new_block();
        let done = body.new_block();
        body.blocks[body.current].jump_false = Some(done);
        body.blocks[body.current].next = Some(loop_body);

        body.current = loop_body;
        body.depth = loop_depth;
        self.gen_comp_generators(body, generators, result_slot)?;
        for binding in update {
            let Some(expr) = &binding.expr else { continue };
            let Some(slot) = self.scopes.resolve_local(&binding.ident) else {
                return Err(GenError::new(
                    binding.loc.clone(),
                    format!("assignment to undeclared loop variable \"{}\"", binding.ident),
                ));
            };
            self.gen_expr(body, expr)?;
            add_inst_imm(body.code(), Opcode::SetI, slot as i32);
            body.depth -= 1;
        }
        body.blocks[body.current].next = Some(head);

        body.current = done;
        body.depth = loop_depth;
        let init_count = init.len();
        for _ in 0..init_count {
            add_inst(body.code(), Opcode::Pop);
            body.depth -= 1;
        }
        self.scopes.pop_scope();
        Ok(())
    }
}

fn unit_body(unit: &TranslationUnit) -> ModuleBody {
    ModuleBody {
        assignments: unit.assignments.clone(),
        children: unit.module_calls.clone(),
    }
}

fn global_key(file: FileHandle, ident: &str) -> (FileHandle, String) {
    if is_config_var(ident) {
        (CONFIG_FILE, ident.to_string())
    } else {
        (file, ident.to_string())
    }
}

/// Lays blocks out in creation order and resolves the structured exits into
/// relative jumps. Jump immediates always use the wide form, so every
/// block's size is known before offsets are assigned.
fn linearize(blocks: &[BasicBlock]) -> Vec<u8> {
    let count = blocks.len();
    let mut sizes = Vec::with_capacity(count);
    for (i, block) in blocks.iter().enumerate() {
        let mut size = block.code.len();
        if block.iter.is_some() {
            size += 6;
        }
        if block.jump_false.is_some() {
            size += 6;
        }
        if needs_jump(block, i) {
            size += 6;
        }
        sizes.push(size);
    }
    let mut offsets = vec![0usize; count];
    for i in 1..count {
        offsets[i] = offsets[i - 1] + sizes[i - 1];
    }

    let mut code = Vec::new();
    for (i, block) in blocks.iter().enumerate() {
        code.extend_from_slice(&block.code);
        if let Some(target) = block.iter {
            emit_wide_jump(&mut code, Opcode::Iter, offsets[target]);
        }
        if let Some(target) = block.jump_false {
            emit_wide_jump(&mut code, Opcode::JumpFalseI, offsets[target]);
        }
        if needs_jump(block, i) {
            if let Some(target) = block.next {
                emit_wide_jump(&mut code, Opcode::JumpI, offsets[target]);
            }
        }
    }
    code
}

fn needs_jump(block: &BasicBlock, index: usize) -> bool {
    matches!(block.next, Some(next) if next != index + 1)
}

fn emit_wide_jump(code: &mut Vec<u8>, opcode: Opcode, target: usize) {
    let at = code.len() as i64;
    let rel = target as i64 - at;
    code.push(opcode as u8);
    code.push(WIDE_IMM);
    code.extend_from_slice(&(rel as i32).to_le_bytes());
}
