//! Constant evaluation and assignment normalisation.
//!
//! A bottom-up rewrite over every expression of a translation unit: unary
//! and binary operators on number literals fold, conditionals with literal
//! conditions collapse to the chosen branch, and duplicated assignments in
//! one scope are normalised (later expression, earlier position) with a
//! warning. Each scope keeps an `ident → Option<expr>` lookup where `Some`
//! holds the bound expression only when it is a constant literal, which
//! bounds how much inlining can grow the tree.

use std::collections::HashMap;

use super::visit::ExprMap;
use crate::ast::*;
use crate::diag::Warning;
use crate::frontend::TranslationUnit;
use crate::lexer::{FileHandle, Location};

/// The constant evaluator pass.
#[derive(Default)]
pub struct ConstEvaluator {
    scopes: Vec<HashMap<String, Option<ExprRef>>>,
    warnings: Vec<Warning>,
}

impl ConstEvaluator {
    /// A fresh pass.
    pub fn new() -> Self {
        Self::default()
    }

    /// Rewrites every unit in the registry.
    pub fn transform_units(units: &mut HashMap<FileHandle, TranslationUnit>) {
        for unit in units.values_mut() {
            ConstEvaluator::new().transform_unit(unit);
        }
    }

    /// Rewrites one translation unit in place; warnings accumulate on the
    /// unit.
    pub fn transform_unit(&mut self, unit: &mut TranslationUnit) {
        let mut assignments = std::mem::take(&mut unit.assignments);
        self.fix_assignments(&mut assignments, &[]);
        unit.assignments = assignments;

        let mut modules = std::mem::take(&mut unit.modules);
        for module in &mut modules {
            self.transform_module(module);
        }
        unit.modules = modules;

        let mut functions = std::mem::take(&mut unit.functions);
        for function in &mut functions {
            self.transform_function(function);
        }
        unit.functions = functions;

        let mut calls = std::mem::take(&mut unit.module_calls);
        for call in &mut calls {
            self.transform_item(call);
        }
        unit.module_calls = calls;

        self.pop_scope();
        unit.warnings.append(&mut self.warnings);
    }

    /// Folds a single expression; used by tests and the REPL.
    pub fn fold_expr(&mut self, expr: &ExprRef) -> ExprRef {
        self.map_expr(expr)
    }

    fn transform_module(&mut self, decl: &mut ModuleDecl) {
        // Parameter defaults fold in the enclosing scope.
        for param in &mut decl.params {
            self.map_assign(param);
        }
        let params = decl.params.clone();
        self.transform_body(&mut decl.body, &params);
    }

    fn transform_function(&mut self, decl: &mut FunctionDecl) {
        for param in &mut decl.params {
            self.map_assign(param);
        }
        self.scopes.push(HashMap::new());
        for param in &decl.params {
            self.scope_insert(&param.ident, None);
        }
        decl.body = self.map_expr(&decl.body);
        self.pop_scope();
    }

    fn transform_item(&mut self, item: &mut ModuleItem) {
        match item {
            ModuleItem::Single(call) => {
                for arg in &mut call.args {
                    self.map_assign(arg);
                }
                // Loop variables of `for` mask outer constants in the body.
                let mask = if call.name == "for" || call.name == "intersection_for" {
                    call.args.clone()
                } else {
                    Vec::new()
                };
                self.transform_body(&mut call.body, &mask);
            }
            ModuleItem::If(ifm) => {
                ifm.cond = self.map_expr(&ifm.cond);
                self.transform_body(&mut ifm.then_body, &[]);
                self.transform_body(&mut ifm.else_body, &[]);
            }
            ModuleItem::Modifier(modifier) => self.transform_item(&mut modifier.inner),
        }
    }

    fn transform_body(&mut self, body: &mut ModuleBody, mask: &[Assign]) {
        let mut assignments = std::mem::take(&mut body.assignments);
        self.fix_assignments(&mut assignments, mask);
        body.assignments = assignments;
        for child in &mut body.children {
            self.transform_item(child);
        }
        self.pop_scope();
    }

    /// Removes duplicates (keeping the later expression at the earlier
    /// position), then maps each assignment and records constant bindings in
    /// a freshly pushed scope. The caller pops the scope.
    fn fix_assignments(&mut self, assignments: &mut Vec<Assign>, mask: &[Assign]) {
        let mut indices: HashMap<String, usize> = HashMap::new();
        let mut i = 0;
        while i < assignments.len() {
            match indices.get(&assignments[i].ident) {
                Some(&first) => {
                    let earlier = assignments[first].loc.clone();
                    let later = assignments.remove(i);
                    self.warnings.push(Warning::with_other(
                        later.loc.clone(),
                        earlier,
                        "duplicated variable declaration",
                    ));
                    assignments[first] = later;
                }
                None => {
                    indices.insert(assignments[i].ident.clone(), i);
                    i += 1;
                }
            }
        }

        self.scopes.push(HashMap::new());
        for masked in mask {
            self.scope_insert(&masked.ident, None);
        }
        for assign in assignments.iter_mut() {
            self.map_assign(assign);
            let binding = assign
                .expr
                .as_ref()
                .filter(|expr| expr.is_const_value())
                .cloned();
            self.scope_insert(&assign.ident, binding);
        }
    }

    fn scope_insert(&mut self, ident: &str, binding: Option<ExprRef>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert(ident.to_string(), binding);
        }
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn lookup(&self, ident: &str) -> Option<&Option<ExprRef>> {
        self.scopes.iter().rev().find_map(|scope| scope.get(ident))
    }
}

fn truth(value: bool) -> f64 {
    if value { 1.0 } else { 0.0 }
}

/// Folds one binary operator over two number literals. Comparisons and
/// logic yield 0/1; division and modulo by zero yield NaN.
fn fold_binary(op: BinOp, lhs: f64, rhs: f64) -> f64 {
    match op {
        BinOp::Add => lhs + rhs,
        BinOp::Sub => lhs - rhs,
        BinOp::Mul => lhs * rhs,
        BinOp::Div => {
            if rhs.abs() == 0.0 {
                f64::NAN
            } else {
                lhs / rhs
            }
        }
        BinOp::Mod => {
            if rhs.abs() == 0.0 {
                f64::NAN
            } else {
                lhs % rhs
            }
        }
        BinOp::Exp => lhs.powf(rhs),
        BinOp::Lt => truth(lhs < rhs),
        BinOp::Le => truth(lhs <= rhs),
        BinOp::Gt => truth(lhs > rhs),
        BinOp::Ge => truth(lhs >= rhs),
        BinOp::Eq => truth(lhs == rhs),
        BinOp::Ne => truth(lhs != rhs),
        BinOp::And => truth(lhs != 0.0 && rhs != 0.0),
        BinOp::Or => truth(lhs != 0.0 || rhs != 0.0),
    }
}

impl ExprMap for ConstEvaluator {
    fn map_ident(&mut self, expr: &ExprRef, name: &str) -> ExprRef {
        match self.lookup(name) {
            Some(Some(constant)) => constant.clone(),
            _ => expr.clone(),
        }
    }

    fn map_unary(&mut self, op: UnaryOp, operand: &ExprRef, loc: &Location) -> ExprRef {
        let operand = self.map_expr(operand);
        if let ExprKind::Number(value) = operand.kind {
            let folded = match op {
                UnaryOp::Neg => -value,
                UnaryOp::Not => truth(value == 0.0),
            };
            return Expr::new(ExprKind::Number(folded), loc.clone());
        }
        Expr::new(ExprKind::Unary { op, operand }, loc.clone())
    }

    fn map_binary(&mut self, op: BinOp, lhs: &ExprRef, rhs: &ExprRef, loc: &Location) -> ExprRef {
        let lhs = self.map_expr(lhs);
        let rhs = self.map_expr(rhs);
        if let (ExprKind::Number(l), ExprKind::Number(r)) = (&lhs.kind, &rhs.kind) {
            return Expr::new(ExprKind::Number(fold_binary(op, *l, *r)), loc.clone());
        }
        Expr::new(ExprKind::Binary { op, lhs, rhs }, loc.clone())
    }

    fn map_if(
        &mut self,
        cond: &ExprRef,
        then_expr: &ExprRef,
        else_expr: &ExprRef,
        loc: &Location,
    ) -> ExprRef {
        let cond = self.map_expr(cond);
        match cond.kind {
            ExprKind::Number(value) => {
                if value.abs() == 0.0 {
                    self.map_expr(else_expr)
                } else {
                    self.map_expr(then_expr)
                }
            }
            ExprKind::Bool(value) => {
                if value {
                    self.map_expr(then_expr)
                } else {
                    self.map_expr(else_expr)
                }
            }
            _ => {
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
        }
    }

    fn map_let(&mut self, bindings: &[Assign], body: &ExprRef, loc: &Location) -> ExprRef {
        self.scopes.push(HashMap::new());
        let mut mapped = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let mut binding = binding.clone();
            self.map_assign(&mut binding);
            let constant = binding
                .expr
                .as_ref()
                .filter(|expr| expr.is_const_value())
                .cloned();
            self.scope_insert(&binding.ident, constant);
            mapped.push(binding);
        }
        let body = self.map_expr(body);
        self.pop_scope();
        Expr::new(
            ExprKind::Let {
                bindings: mapped,
                body,
            },
            loc.clone(),
        )
    }

    fn map_lambda(&mut self, params: &[Assign], body: &ExprRef, loc: &Location) -> ExprRef {
        let params = self.map_assign_list(params);
        self.scopes.push(HashMap::new());
        for param in &params {
            self.scope_insert(&param.ident, None);
        }
        let body = self.map_expr(body);
        self.pop_scope();
        Expr::new(ExprKind::Lambda { params, body }, loc.clone())
    }

    fn map_list_comp(
        &mut self,
        bindings: &[Assign],
        generators: &[ListElem],
        loc: &Location,
    ) -> ExprRef {
        self.scopes.push(HashMap::new());
        let mut mapped = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let mut binding = binding.clone();
            self.map_assign(&mut binding);
            self.scope_insert(&binding.ident, None);
            mapped.push(binding);
        }
        let generators = self.map_elem_list(generators);
        self.pop_scope();
        Expr::new(
            ExprKind::ListComp {
                bindings: mapped,
                generators,
            },
            loc.clone(),
        )
    }

    fn map_list_comp_c(
        &mut self,
        init: &[Assign],
        cond: &ExprRef,
        update: &[Assign],
        generators: &[ListElem],
        loc: &Location,
    ) -> ExprRef {
        let init = self.map_assign_list(init);
        self.scopes.push(HashMap::new());
        for binding in &init {
            self.scope_insert(&binding.ident, None);
        }
        let cond = self.map_expr(cond);
        let update = self.map_assign_list(update);
        let generators = self.map_elem_list(generators);
        self.pop_scope();
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
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::MemorySources;
    use crate::lexer::Scanner;
    use crate::parser::Parser;

    fn parse(source: &str) -> TranslationUnit {
        let mut sources = MemorySources::new();
        let root = sources.add("root", source);
        let mut unit = TranslationUnit::new(root);
        let scanner = Scanner::new(&mut sources, root).unwrap();
        Parser::new(scanner).unwrap().parse_unit(&mut unit).unwrap();
        unit
    }

    fn transformed(source: &str) -> TranslationUnit {
        let mut unit = parse(source);
        ConstEvaluator::new().transform_unit(&mut unit);
        unit
    }

    fn assigned_number(unit: &TranslationUnit, ident: &str) -> f64 {
        let assign = unit
            .assignments
            .iter()
            .find(|a| a.ident == ident)
            .unwrap_or_else(|| panic!("no assignment to {ident}"));
        match assign.expr.as_ref().map(|e| &e.kind) {
            Some(ExprKind::Number(n)) => *n,
            other => panic!("{ident} did not fold to a number: {other:?}"),
        }
    }

    #[test]
    fn test_arithmetic_folds() {
        let unit = transformed("x = 1 + 2 * 3;");
        assert_eq!(assigned_number(&unit, "x"), 7.0);
    }

    #[test]
    fn test_unary_folds() {
        let unit = transformed("a = -(2 + 3); b = !0; c = !7;");
        assert_eq!(assigned_number(&unit, "a"), -5.0);
        assert_eq!(assigned_number(&unit, "b"), 1.0);
        assert_eq!(assigned_number(&unit, "c"), 0.0);
    }

    #[test]
    fn test_division_by_zero_folds_to_nan() {
        let unit = transformed("x = 1 / 0; y = 5 % 0;");
        assert!(assigned_number(&unit, "x").is_nan());
        assert!(assigned_number(&unit, "y").is_nan());
    }

    #[test]
    fn test_comparison_and_logic_fold_to_zero_one() {
        let unit = transformed("a = 1 == 1; b = 2 < 1; c = 3 && 0; d = 3 || 0;");
        assert_eq!(assigned_number(&unit, "a"), 1.0);
        assert_eq!(assigned_number(&unit, "b"), 0.0);
        assert_eq!(assigned_number(&unit, "c"), 0.0);
        assert_eq!(assigned_number(&unit, "d"), 1.0);
    }

    #[test]
    fn test_conditional_with_literal_condition_collapses() {
        let unit = transformed("x = 1 == 1 ? 10 : 20; y = 0 ? 1 : 2;");
        assert_eq!(assigned_number(&unit, "x"), 10.0);
        assert_eq!(assigned_number(&unit, "y"), 2.0);
    }

    #[test]
    fn test_constant_ident_inlines() {
        let unit = transformed("a = 4; x = a * 2;");
        assert_eq!(assigned_number(&unit, "x"), 8.0);
    }

    #[test]
    fn test_non_constant_ident_stays() {
        let unit = transformed("x = y + 1;");
        let expr = unit.assignments[0].expr.as_ref().unwrap();
        assert!(matches!(expr.kind, ExprKind::Binary { .. }));
    }

    #[test]
    fn test_duplicate_assignment_normalised() {
        let unit = transformed("a = 1;\nb = a;\na = 2;\nc = a;");
        // The later expression wins, placed at the earlier position.
        assert_eq!(unit.assignments[0].ident, "a");
        assert_eq!(assigned_number(&unit, "a"), 2.0);
        // Normalisation runs before folding, so every dependent expression
        // in the scope sees the surviving (later) value.
        assert_eq!(assigned_number(&unit, "b"), 2.0);
        assert_eq!(assigned_number(&unit, "c"), 2.0);
        assert_eq!(unit.warnings.len(), 1);
        let warning = &unit.warnings[0];
        assert!(warning.message.contains("duplicated variable declaration"));
        assert_eq!(warning.loc.begin.line, 3);
        assert_eq!(warning.other_loc.as_ref().map(|l| l.begin.line), Some(1));
    }

    #[test]
    fn test_module_parameter_shadows_file_constant() {
        let unit = transformed("x = 5; module m(x) { y = x + 1; echo(y); }");
        let module = &unit.modules[0];
        // `x` is a parameter inside the body, so `y` must not fold to 6.
        let y = module.body.assignments[0].expr.as_ref().unwrap();
        assert!(matches!(y.kind, ExprKind::Binary { .. }));
    }

    #[test]
    fn test_echo_argument_folds_but_call_survives() {
        let unit = transformed("echo(1 + 2 * 3);");
        let ModuleItem::Single(call) = &unit.module_calls[0] else {
            panic!("expected echo call")
        };
        assert_eq!(call.name, "echo");
        let arg = call.args[0].expr.as_ref().unwrap();
        assert!(matches!(arg.kind, ExprKind::Number(n) if n == 7.0));
    }

    #[test]
    fn test_let_binding_folds_into_body() {
        let unit = transformed("x = let (a = 2) a * 3;");
        let expr = unit.assignments[0].expr.as_ref().unwrap();
        let ExprKind::Let { body, .. } = &expr.kind else {
            panic!("let disappeared")
        };
        assert!(matches!(body.kind, ExprKind::Number(n) if n == 6.0));
    }

    #[test]
    fn test_comprehension_variable_not_inlined() {
        let unit = transformed("v = [for (i = [0:3]) i * 2];");
        let expr = unit.assignments[0].expr.as_ref().unwrap();
        let ExprKind::ListComp { generators, .. } = &expr.kind else {
            panic!("comprehension disappeared")
        };
        assert!(matches!(generators[0].expr.kind, ExprKind::Binary { .. }));
    }

    #[test]
    fn test_fold_preserves_nan_propagation() {
        let unit = transformed("x = (1 / 0) + 1;");
        assert!(assigned_number(&unit, "x").is_nan());
    }

    #[test]
    fn test_exponent_folds() {
        let unit = transformed("x = 2 ^ 10;");
        assert_eq!(assigned_number(&unit, "x"), 1024.0);
    }
}
