//! Polymorphic AST traversal: a read-only visitor and an expression mapper.
//!
//! `Visitor` dispatches on the runtime variant with per-variant hooks whose
//! defaults recurse into children; passes override only the hooks they care
//! about. `ExprMap` is the expression-only rewriting counterpart: every hook
//! returns a (possibly shared) replacement node, so rewrites may alias
//! common subexpressions.

use crate::ast::*;
use crate::frontend::TranslationUnit;
use crate::lexer::Location;

/// Read-only traversal with per-variant hooks.
pub trait Visitor: Sized {
    /// Visits a whole translation unit.
    fn visit_unit(&mut self, unit: &TranslationUnit) {
        walk_unit(self, unit)
    }

    /// Visits an assignment (statement, argument or parameter).
    fn visit_assign(&mut self, assign: &Assign) {
        walk_assign(self, assign)
    }

    /// Visits a module body.
    fn visit_module_body(&mut self, body: &ModuleBody) {
        walk_module_body(self, body)
    }

    /// Visits a statement-position module item.
    fn visit_module_item(&mut self, item: &ModuleItem) {
        walk_module_item(self, item)
    }

    /// Visits a module declaration.
    fn visit_module_decl(&mut self, decl: &ModuleDecl) {
        walk_module_decl(self, decl)
    }

    /// Visits a function declaration.
    fn visit_function_decl(&mut self, decl: &FunctionDecl) {
        walk_function_decl(self, decl)
    }

    /// Visits an expression.
    fn visit_expr(&mut self, expr: &ExprRef) {
        walk_expr(self, expr)
    }
}

/// Default unit traversal: modules, functions, assignments, then calls.
pub fn walk_unit<V: Visitor>(visitor: &mut V, unit: &TranslationUnit) {
    for module in &unit.modules {
        visitor.visit_module_decl(module);
    }
    for function in &unit.functions {
        visitor.visit_function_decl(function);
    }
    for assign in &unit.assignments {
        visitor.visit_assign(assign);
    }
    for call in &unit.module_calls {
        visitor.visit_module_item(call);
    }
}

/// Default assignment traversal.
pub fn walk_assign<V: Visitor>(visitor: &mut V, assign: &Assign) {
    if let Some(expr) = &assign.expr {
        visitor.visit_expr(expr);
    }
}

/// Default body traversal: assignments then children.
pub fn walk_module_body<V: Visitor>(visitor: &mut V, body: &ModuleBody) {
    for assign in &body.assignments {
        visitor.visit_assign(assign);
    }
    for child in &body.children {
        visitor.visit_module_item(child);
    }
}

/// Default module-item traversal.
pub fn walk_module_item<V: Visitor>(visitor: &mut V, item: &ModuleItem) {
    match item {
        ModuleItem::Single(call) => {
            for arg in &call.args {
                visitor.visit_assign(arg);
            }
            visitor.visit_module_body(&call.body);
        }
        ModuleItem::If(ifm) => {
            visitor.visit_expr(&ifm.cond);
            visitor.visit_module_body(&ifm.then_body);
            visitor.visit_module_body(&ifm.else_body);
        }
        ModuleItem::Modifier(modifier) => visitor.visit_module_item(&modifier.inner),
    }
}

/// Default module-declaration traversal.
pub fn walk_module_decl<V: Visitor>(visitor: &mut V, decl: &ModuleDecl) {
    for param in &decl.params {
        visitor.visit_assign(param);
    }
    visitor.visit_module_body(&decl.body);
}

/// Default function-declaration traversal.
pub fn walk_function_decl<V: Visitor>(visitor: &mut V, decl: &FunctionDecl) {
    for param in &decl.params {
        visitor.visit_assign(param);
    }
    visitor.visit_expr(&decl.body);
}

/// Default expression traversal.
pub fn walk_expr<V: Visitor>(visitor: &mut V, expr: &ExprRef) {
    match &expr.kind {
        ExprKind::Number(_)
        | ExprKind::Str(_)
        | ExprKind::Bool(_)
        | ExprKind::Undef
        | ExprKind::Ident(_) => {}
        ExprKind::Unary { operand, .. } => visitor.visit_expr(operand),
        ExprKind::Binary { lhs, rhs, .. } => {
            visitor.visit_expr(lhs);
            visitor.visit_expr(rhs);
        }
        ExprKind::Call { callee, args } => {
            visitor.visit_expr(callee);
            for arg in args {
                visitor.visit_assign(arg);
            }
        }
        ExprKind::If {
            cond,
            then_expr,
            else_expr,
        } => {
            visitor.visit_expr(cond);
            visitor.visit_expr(then_expr);
            visitor.visit_expr(else_expr);
        }
        ExprKind::List { elems } => {
            for elem in elems {
                visitor.visit_expr(&elem.expr);
            }
        }
        ExprKind::Range { start, step, end } => {
            visitor.visit_expr(start);
            if let Some(step) = step {
                visitor.visit_expr(step);
            }
            visitor.visit_expr(end);
        }
        ExprKind::ListComp {
            bindings,
            generators,
        } => {
            for binding in bindings {
                visitor.visit_assign(binding);
            }
            for generator in generators {
                visitor.visit_expr(&generator.expr);
            }
        }
        ExprKind::ListCompC {
            init,
            cond,
            update,
            generators,
        } => {
            for binding in init {
                visitor.visit_assign(binding);
            }
            visitor.visit_expr(cond);
            for binding in update {
                visitor.visit_assign(binding);
            }
            for generator in generators {
                visitor.visit_expr(&generator.expr);
            }
        }
        ExprKind::Index { list, index } => {
            visitor.visit_expr(list);
            visitor.visit_expr(index);
        }
        ExprKind::Let { bindings, body } => {
            for binding in bindings {
                visitor.visit_assign(binding);
            }
            visitor.visit_expr(body);
        }
        ExprKind::Lambda { params, body } => {
            for param in params {
                visitor.visit_assign(param);
            }
            visitor.visit_expr(body);
        }
    }
}

/// Expression rewriting with per-variant hooks.
///
/// The default hooks rebuild nodes around mapped children, reusing the
/// original node untouched for leaves. Implementations override individual
/// hooks to rewrite the variants they understand.
pub trait ExprMap: Sized {
    /// Maps one expression, dispatching to the per-variant hook.
    fn map_expr(&mut self, expr: &ExprRef) -> ExprRef {
        dispatch_map(self, expr)
    }

    /// Maps an assignment's bound expression in place.
    fn map_assign(&mut self, assign: &mut Assign) {
        if let Some(expr) = &assign.expr {
            assign.expr = Some(self.map_expr(expr));
        }
    }

    /// Leaf literals: numbers, strings, booleans, `undef`.
    fn map_leaf(&mut self, expr: &ExprRef) -> ExprRef {
        expr.clone()
    }

    /// Identifier references.
    fn map_ident(&mut self, expr: &ExprRef, _name: &str) -> ExprRef {
        expr.clone()
    }

    /// Unary operations.
    fn map_unary(&mut self, op: UnaryOp, operand: &ExprRef, loc: &Location) -> ExprRef {
        let operand = self.map_expr(operand);
        Expr::new(ExprKind::Unary { op, operand }, loc.clone())
    }

    /// Binary operations.
    fn map_binary(&mut self, op: BinOp, lhs: &ExprRef, rhs: &ExprRef, loc: &Location) -> ExprRef {
        let lhs = self.map_expr(lhs);
        let rhs = self.map_expr(rhs);
        Expr::new(ExprKind::Binary { op, lhs, rhs }, loc.clone())
    }

    /// Conditional expressions.
    fn map_if(
        &mut self,
        cond: &ExprRef,
        then_expr: &ExprRef,
        else_expr: &ExprRef,
        loc: &Location,
    ) -> ExprRef {
        let cond = self.map_expr(cond);
        let then_expr = self.map_expr(then_expr);
        let else_expr = self.map_expr(else_expr);
        Expr::new(
            ExprKind::If {
                cond,
                then_expr,
                else_expr,
            },
            loc.clone(),
        )
    }

    /// Call expressions.
    fn map_call(&mut self, callee: &ExprRef, args: &[Assign], loc: &Location) -> ExprRef {
        let callee = self.map_expr(callee);
        let args = self.map_assign_list(args);
        Expr::new(ExprKind::Call { callee, args }, loc.clone())
    }

    /// List literals.
    fn map_list(&mut self, elems: &[ListElem], loc: &Location) -> ExprRef {
        let elems = self.map_elem_list(elems);
        Expr::new(ExprKind::List { elems }, loc.clone())
    }

    /// Range literals.
    fn map_range(
        &mut self,
        start: &ExprRef,
        step: Option<&ExprRef>,
        end: &ExprRef,
        loc: &Location,
    ) -> ExprRef {
        let start = self.map_expr(start);
        let step = step.map(|s| self.map_expr(s));
        let end = self.map_expr(end);
        Expr::new(ExprKind::Range { start, step, end }, loc.clone())
    }

    /// Plain comprehensions.
    fn map_list_comp(
        &mut self,
        bindings: &[Assign],
        generators: &[ListElem],
        loc: &Location,
    ) -> ExprRef {
        let bindings = self.map_assign_list(bindings);
        let generators = self.map_elem_list(generators);
        Expr::new(
            ExprKind::ListComp {
                bindings,
                generators,
            },
            loc.clone(),
        )
    }

    /// C-style comprehensions.
    fn map_list_comp_c(
        &mut self,
        init: &[Assign],
        cond: &ExprRef,
        update: &[Assign],
        generators: &[ListElem],
        loc: &Location,
    ) -> ExprRef {
        let init = self.map_assign_list(init);
        let cond = self.map_expr(cond);
        let update = self.map_assign_list(update);
        let generators = self.map_elem_list(generators);
        Expr::new(
            ExprKind::ListCompC {
                init,
                cond,
                update,
                generators,
            },
            loc.clone(),
        )
    }

    /// Index expressions.
    fn map_index(&mut self, list: &ExprRef, index: &ExprRef, loc: &Location) -> ExprRef {
        let list = self.map_expr(list);
        let index = self.map_expr(index);
        Expr::new(ExprKind::Index { list, index }, loc.clone())
    }

    /// `let` expressions.
    fn map_let(&mut self, bindings: &[Assign], body: &ExprRef, loc: &Location) -> ExprRef {
        let bindings = self.map_assign_list(bindings);
        let body = self.map_expr(body);
        Expr::new(ExprKind::Let { bindings, body }, loc.clone())
    }

    /// Lambda literals.
    fn map_lambda(&mut self, params: &[Assign], body: &ExprRef, loc: &Location) -> ExprRef {
        let params = self.map_assign_list(params);
        let body = self.map_expr(body);
        Expr::new(ExprKind::Lambda { params, body }, loc.clone())
    }

    /// Maps a slice of assignments into a fresh vector.
    fn map_assign_list(&mut self, assigns: &[Assign]) -> Vec<Assign> {
        assigns
            .iter()
            .map(|a| {
                let mut a = a.clone();
                self.map_assign(&mut a);
                a
            })
            .collect()
    }

    /// Maps a slice of list elements into a fresh vector.
    fn map_elem_list(&mut self, elems: &[ListElem]) -> Vec<ListElem> {
        elems
            .iter()
            .map(|e| ListElem {
                expr: self.map_expr(&e.expr),
                splat: e.splat,
            })
            .collect()
    }
}

/// Dispatches `map_expr` to the matching per-variant hook.
pub fn dispatch_map<M: ExprMap>(mapper: &mut M, expr: &ExprRef) -> ExprRef {
    match &expr.kind {
        ExprKind::Number(_) | ExprKind::Str(_) | ExprKind::Bool(_) | ExprKind::Undef => {
            mapper.map_leaf(expr)
        }
        ExprKind::Ident(name) => mapper.map_ident(expr, name),
        ExprKind::Unary { op, operand } => mapper.map_unary(*op, operand, &expr.loc),
        ExprKind::Binary { op, lhs, rhs } => mapper.map_binary(*op, lhs, rhs, &expr.loc),
        ExprKind::If {
            cond,
            then_expr,
            else_expr,
        } => mapper.map_if(cond, then_expr, else_expr, &expr.loc),
        ExprKind::Call { callee, args } => mapper.map_call(callee, args, &expr.loc),
        ExprKind::List { elems } => mapper.map_list(elems, &expr.loc),
        ExprKind::Range { start, step, end } => {
            mapper.map_range(start, step.as_ref(), end, &expr.loc)
        }
        ExprKind::ListComp {
            bindings,
            generators,
        } => mapper.map_list_comp(bindings, generators, &expr.loc),
        ExprKind::ListCompC {
            init,
            cond,
            update,
            generators,
        } => mapper.map_list_comp_c(init, cond, update, generators, &expr.loc),
        ExprKind::Index { list, index } => mapper.map_index(list, index, &expr.loc),
        ExprKind::Let { bindings, body } => mapper.map_let(bindings, body, &expr.loc),
        ExprKind::Lambda { params, body } => mapper.map_lambda(params, body, &expr.loc),
    }
}
