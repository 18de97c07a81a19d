//! The main parser implementation.
//!
//! A recursive descent parser over the scanner's token stream. One syntax
//! error aborts the file; there is no panic-mode recovery.

use crate::ast::*;
use crate::diag::SyntaxError;
use crate::frontend::TranslationUnit;
use crate::lexer::{Location, Scanner, Token, TokenKind};

/// A recursive descent parser for the modelling language.
pub struct Parser<'a> {
    scanner: Scanner<'a>,
    current: Token,
    previous: Token,
    lookahead: Option<Token>,
    /// A scanner error hit while peeking, replayed on the next advance.
    pending_error: Option<SyntaxError>,
}

impl<'a> Parser<'a> {
    /// Creates a parser over an initialised scanner.
    pub fn new(mut scanner: Scanner<'a>) -> Result<Self, SyntaxError> {
        let current = scanner.next_token()?;
        let previous = Token::new(TokenKind::Eof, current.loc.clone());
        Ok(Self {
            scanner,
            current,
            previous,
            lookahead: None,
            pending_error: None,
        })
    }

    /// Parses a whole file into `unit`.
    ///
    /// The scanner's recorded `use<…>` targets are merged into the unit when
    /// the file is fully consumed.
    pub fn parse_unit(mut self, unit: &mut TranslationUnit) -> Result<(), SyntaxError> {
        while !self.check(&TokenKind::Eof) {
            self.parse_item(unit)?;
        }
        unit.uses.extend(self.scanner.into_uses());
        Ok(())
    }

    fn parse_item(&mut self, unit: &mut TranslationUnit) -> Result<(), SyntaxError> {
        if self.check(&TokenKind::Module) {
            let module = self.parse_module_decl()?;
            unit.modules.push(module);
        } else if self.check(&TokenKind::Function) && !self.peek_is(&TokenKind::LParen) {
            let function = self.parse_function_decl()?;
            unit.functions.push(function);
        } else if self.at_assignment() {
            let assign = self.parse_assignment()?;
            unit.assignments.push(assign);
        } else {
            let item = self.parse_module_item()?;
            unit.module_calls.push(item);
        }
        Ok(())
    }

    /// True at `name = …`, the start of an assignment statement.
    fn at_assignment(&mut self) -> bool {
        matches!(self.current.kind, TokenKind::Ident(_)) && self.peek_is(&TokenKind::Assign)
    }

    // ========================================================================
    // Declarations and statements
    // ========================================================================

    /// `name = expr ;`
    fn parse_assignment(&mut self) -> Result<Assign, SyntaxError> {
        let start = self.current.loc.clone();
        let ident = self.expect_identifier()?;
        self.expect(&TokenKind::Assign)?;
        let expr = self.parse_expression()?;
        let end = self.current.loc.clone();
        self.expect(&TokenKind::Semicolon)?;
        Ok(Assign::new(ident, Some(expr), span(&start, &end)))
    }

    /// `module name(params) body`
    fn parse_module_decl(&mut self) -> Result<ModuleDecl, SyntaxError> {
        let start = self.current.loc.clone();
        self.advance()?; // 'module'
        let name = self.expect_identifier()?;
        self.expect(&TokenKind::LParen)?;
        let params = self.parse_parameters()?;
        self.expect(&TokenKind::RParen)?;
        let body = self.parse_child_body()?;
        let loc = span(&start, &self.previous_loc());
        Ok(ModuleDecl {
            name,
            params,
            body,
            loc,
        })
    }

    /// `function name(params) = expr ;`
    fn parse_function_decl(&mut self) -> Result<FunctionDecl, SyntaxError> {
        let start = self.current.loc.clone();
        self.advance()?; // 'function'
        let name = self.expect_identifier()?;
        self.expect(&TokenKind::LParen)?;
        let params = self.parse_parameters()?;
        self.expect(&TokenKind::RParen)?;
        self.expect(&TokenKind::Assign)?;
        let body = self.parse_expression()?;
        let end = self.current.loc.clone();
        self.expect(&TokenKind::Semicolon)?;
        Ok(FunctionDecl {
            name,
            params,
            body,
            loc: span(&start, &end),
        })
    }

    /// A statement-position module construct.
    fn parse_module_item(&mut self) -> Result<ModuleItem, SyntaxError> {
        match &self.current.kind {
            TokenKind::Star | TokenKind::Not | TokenKind::Hash | TokenKind::Percent => {
                let start = self.current.loc.clone();
                let tag = match self.current.kind {
                    TokenKind::Star => '*',
                    TokenKind::Not => '!',
                    TokenKind::Hash => '#',
                    _ => '%',
                };
                self.advance()?;
                let inner = Box::new(self.parse_module_item()?);
                let loc = span(&start, inner.loc());
                Ok(ModuleItem::Modifier(ModuleModifier { tag, inner, loc }))
            }
            TokenKind::If => self.parse_if_module(),
            TokenKind::For => {
                // `for` is a module call with the builtin name.
                let start = self.current.loc.clone();
                self.advance()?;
                self.expect(&TokenKind::LParen)?;
                let args = self.parse_arguments()?;
                self.expect(&TokenKind::RParen)?;
                let body = self.parse_child_body()?;
                let loc = span(&start, &self.previous_loc());
                Ok(ModuleItem::Single(SingleModuleCall {
                    name: "for".to_string(),
                    args,
                    body,
                    loc,
                }))
            }
            TokenKind::Ident(_) => {
                let start = self.current.loc.clone();
                let name = self.expect_identifier()?;
                self.expect(&TokenKind::LParen)?;
                let args = self.parse_arguments()?;
                self.expect(&TokenKind::RParen)?;
                let body = self.parse_child_body()?;
                let loc = span(&start, &self.previous_loc());
                Ok(ModuleItem::Single(SingleModuleCall {
                    name,
                    args,
                    body,
                    loc,
                }))
            }
            _ => Err(self.unexpected("a statement")),
        }
    }

    /// `if (cond) child [else child]` at statement position.
    fn parse_if_module(&mut self) -> Result<ModuleItem, SyntaxError> {
        let start = self.current.loc.clone();
        self.advance()?; // 'if'
        self.expect(&TokenKind::LParen)?;
        let cond = self.parse_expression()?;
        self.expect(&TokenKind::RParen)?;
        let then_body = self.parse_child_body()?;
        let else_body = if self.check(&TokenKind::Else) {
            self.advance()?;
            self.parse_child_body()?
        } else {
            ModuleBody::empty()
        };
        let loc = span(&start, &self.previous_loc());
        Ok(ModuleItem::If(IfModule {
            cond,
            then_body,
            else_body,
            loc,
        }))
    }

    /// The trailing body of a module call or declaration: `;`, a brace
    /// block, or a single nested statement.
    fn parse_child_body(&mut self) -> Result<ModuleBody, SyntaxError> {
        match &self.current.kind {
            TokenKind::Semicolon => {
                self.advance()?;
                Ok(ModuleBody::empty())
            }
            TokenKind::LBrace => {
                self.advance()?;
                let mut body = ModuleBody::empty();
                while !self.check(&TokenKind::RBrace) {
                    if self.check(&TokenKind::Eof) {
                        return Err(self.unexpected("'}'"));
                    }
                    if matches!(self.current.kind, TokenKind::Ident(_))
                        && self.peek_is(&TokenKind::Assign)
                    {
                        body.assignments.push(self.parse_assignment()?);
                    } else {
                        body.children.push(self.parse_module_item()?);
                    }
                }
                self.advance()?; // '}'
                Ok(body)
            }
            _ => {
                let child = self.parse_module_item()?;
                Ok(ModuleBody {
                    assignments: Vec::new(),
                    children: vec![child],
                })
            }
        }
    }

    /// Call arguments: `expr` (positional) or `name = expr` (named).
    fn parse_arguments(&mut self) -> Result<Vec<Assign>, SyntaxError> {
        let mut args = Vec::new();
        if self.check(&TokenKind::RParen) {
            return Ok(args);
        }
        loop {
            let start = self.current.loc.clone();
            if matches!(self.current.kind, TokenKind::Ident(_)) && self.peek_is(&TokenKind::Assign)
            {
                let ident = self.expect_identifier()?;
                self.advance()?; // '='
                let expr = self.parse_expression()?;
                let loc = span(&start, &expr.loc);
                args.push(Assign::new(ident, Some(expr), loc));
            } else {
                let expr = self.parse_expression()?;
                let loc = span(&start, &expr.loc);
                args.push(Assign::positional(expr, loc));
            }
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance()?;
        }
        Ok(args)
    }

    /// Declaration parameters: `name` or `name = default`.
    fn parse_parameters(&mut self) -> Result<Vec<Assign>, SyntaxError> {
        let mut params = Vec::new();
        if self.check(&TokenKind::RParen) {
            return Ok(params);
        }
        loop {
            let start = self.current.loc.clone();
            let ident = self.expect_identifier()?;
            let expr = if self.check(&TokenKind::Assign) {
                self.advance()?;
                Some(self.parse_expression()?)
            } else {
                None
            };
            let end = expr
                .as_ref()
                .map(|e| e.loc.clone())
                .unwrap_or_else(|| start.clone());
            params.push(Assign::new(ident, expr, span(&start, &end)));
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance()?;
        }
        Ok(params)
    }

    // ========================================================================
    // Expressions, lowest to highest precedence
    // ========================================================================

    /// Parses a full expression (entry point: the ternary conditional).
    pub fn parse_expression(&mut self) -> Result<ExprRef, SyntaxError> {
        let cond = self.parse_or()?;
        if self.check(&TokenKind::Question) {
            self.advance()?;
            let then_expr = self.parse_expression()?;
            self.expect(&TokenKind::Colon)?;
            let else_expr = self.parse_expression()?;
            let loc = span(&cond.loc, &else_expr.loc);
            return Ok(Expr::new(
                ExprKind::If {
                    cond,
                    then_expr,
                    else_expr,
                },
                loc,
            ));
        }
        Ok(cond)
    }

    fn parse_or(&mut self) -> Result<ExprRef, SyntaxError> {
        let mut lhs = self.parse_and()?;
        while self.check(&TokenKind::OrOr) {
            self.advance()?;
            let rhs = self.parse_and()?;
            lhs = binary(BinOp::Or, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<ExprRef, SyntaxError> {
        let mut lhs = self.parse_equality()?;
        while self.check(&TokenKind::AndAnd) {
            self.advance()?;
            let rhs = self.parse_equality()?;
            lhs = binary(BinOp::And, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_equality(&mut self) -> Result<ExprRef, SyntaxError> {
        let mut lhs = self.parse_relational()?;
        loop {
            let op = match self.current.kind {
                TokenKind::EqEq => BinOp::Eq,
                TokenKind::Ne => BinOp::Ne,
                _ => break,
            };
            self.advance()?;
            let rhs = self.parse_relational()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_relational(&mut self) -> Result<ExprRef, SyntaxError> {
        let mut lhs = self.parse_additive()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Lt => BinOp::Lt,
                TokenKind::Le => BinOp::Le,
                TokenKind::Gt => BinOp::Gt,
                TokenKind::Ge => BinOp::Ge,
                _ => break,
            };
            self.advance()?;
            let rhs = self.parse_additive()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_additive(&mut self) -> Result<ExprRef, SyntaxError> {
        let mut lhs = self.parse_multiplicative()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Plus => BinOp::Add,
                TokenKind::Minus => BinOp::Sub,
                _ => break,
            };
            self.advance()?;
            let rhs = self.parse_multiplicative()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    fn parse_multiplicative(&mut self) -> Result<ExprRef, SyntaxError> {
        let mut lhs = self.parse_exponent()?;
        loop {
            let op = match self.current.kind {
                TokenKind::Star => BinOp::Mul,
                TokenKind::Slash => BinOp::Div,
                TokenKind::Percent => BinOp::Mod,
                _ => break,
            };
            self.advance()?;
            let rhs = self.parse_exponent()?;
            lhs = binary(op, lhs, rhs);
        }
        Ok(lhs)
    }

    /// `^` is right-associative.
    fn parse_exponent(&mut self) -> Result<ExprRef, SyntaxError> {
        let lhs = self.parse_unary()?;
        if self.check(&TokenKind::Caret) {
            self.advance()?;
            let rhs = self.parse_exponent()?;
            return Ok(binary(BinOp::Exp, lhs, rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<ExprRef, SyntaxError> {
        let op = match self.current.kind {
            TokenKind::Minus => Some(UnaryOp::Neg),
            TokenKind::Not => Some(UnaryOp::Not),
            _ => None,
        };
        if let Some(op) = op {
            let start = self.current.loc.clone();
            self.advance()?;
            let operand = self.parse_unary()?;
            let loc = span(&start, &operand.loc);
            return Ok(Expr::new(ExprKind::Unary { op, operand }, loc));
        }
        self.parse_postfix()
    }

    /// Postfix call `f(args)` and index `v[i]`.
    fn parse_postfix(&mut self) -> Result<ExprRef, SyntaxError> {
        let mut expr = self.parse_primary()?;
        loop {
            match self.current.kind {
                TokenKind::LParen => {
                    self.advance()?;
                    let args = self.parse_arguments()?;
                    let end = self.current.loc.clone();
                    self.expect(&TokenKind::RParen)?;
                    let loc = span(&expr.loc, &end);
                    expr = Expr::new(ExprKind::Call { callee: expr, args }, loc);
                }
                TokenKind::LBracket => {
                    self.advance()?;
                    let index = self.parse_expression()?;
                    let end = self.current.loc.clone();
                    self.expect(&TokenKind::RBracket)?;
                    let loc = span(&expr.loc, &end);
                    expr = Expr::new(ExprKind::Index { list: expr, index }, loc);
                }
                _ => break,
            }
        }
        Ok(expr)
    }

    fn parse_primary(&mut self) -> Result<ExprRef, SyntaxError> {
        let loc = self.current.loc.clone();
        match self.current.kind.clone() {
            TokenKind::Number(value) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Number(value), loc))
            }
            TokenKind::Str(value) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Str(value), loc))
            }
            TokenKind::True => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Bool(true), loc))
            }
            TokenKind::False => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Bool(false), loc))
            }
            TokenKind::Undef => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Undef, loc))
            }
            TokenKind::Ident(name) => {
                self.advance()?;
                Ok(Expr::new(ExprKind::Ident(name), loc))
            }
            TokenKind::LParen => {
                self.advance()?;
                let expr = self.parse_expression()?;
                self.expect(&TokenKind::RParen)?;
                Ok(expr)
            }
            TokenKind::Let => {
                self.advance()?;
                self.expect(&TokenKind::LParen)?;
                let bindings = self.parse_arguments()?;
                self.expect(&TokenKind::RParen)?;
                let body = self.parse_expression()?;
                let full = span(&loc, &body.loc);
                Ok(Expr::new(ExprKind::Let { bindings, body }, full))
            }
            TokenKind::Function => {
                // `function (params) body` is a lambda in expression position.
                self.advance()?;
                self.expect(&TokenKind::LParen)?;
                let params = self.parse_parameters()?;
                self.expect(&TokenKind::RParen)?;
                let body = self.parse_expression()?;
                let full = span(&loc, &body.loc);
                Ok(Expr::new(ExprKind::Lambda { params, body }, full))
            }
            TokenKind::LBracket => self.parse_bracket_construct(),
            _ => Err(self.unexpected("an expression")),
        }
    }

    /// Everything starting with `[`: empty list, list literal, range, or a
    /// list comprehension (plain or C-style).
    fn parse_bracket_construct(&mut self) -> Result<ExprRef, SyntaxError> {
        let start = self.current.loc.clone();
        self.advance()?; // '['

        if self.check(&TokenKind::RBracket) {
            let end = self.current.loc.clone();
            self.advance()?;
            return Ok(Expr::new(
                ExprKind::List { elems: Vec::new() },
                span(&start, &end),
            ));
        }

        if self.check(&TokenKind::For) {
            return self.parse_comprehension(start);
        }

        if self.check(&TokenKind::Each) {
            // A leading splat settles list-vs-range immediately.
            let elems = self.parse_list_elements()?;
            let end = self.current.loc.clone();
            self.expect(&TokenKind::RBracket)?;
            return Ok(Expr::new(ExprKind::List { elems }, span(&start, &end)));
        }

        let first = self.parse_expression()?;
        if self.check(&TokenKind::Colon) {
            self.advance()?;
            let second = self.parse_expression()?;
            let (step, end_expr) = if self.check(&TokenKind::Colon) {
                self.advance()?;
                (Some(second), self.parse_expression()?)
            } else {
                (None, second)
            };
            let end = self.current.loc.clone();
            self.expect(&TokenKind::RBracket)?;
            return Ok(Expr::new(
                ExprKind::Range {
                    start: first,
                    step,
                    end: end_expr,
                },
                span(&start, &end),
            ));
        }

        let mut elems = vec![ListElem {
            expr: first,
            splat: false,
        }];
        if self.check(&TokenKind::Comma) {
            self.advance()?;
            if !self.check(&TokenKind::RBracket) {
                elems.extend(self.parse_list_elements()?);
            }
        }
        let end = self.current.loc.clone();
        self.expect(&TokenKind::RBracket)?;
        Ok(Expr::new(ExprKind::List { elems }, span(&start, &end)))
    }

    /// Comma-separated list elements, each optionally `each`-splatted.
    /// A trailing comma is allowed.
    fn parse_list_elements(&mut self) -> Result<Vec<ListElem>, SyntaxError> {
        let mut elems = Vec::new();
        loop {
            let splat = if self.check(&TokenKind::Each) {
                self.advance()?;
                true
            } else {
                false
            };
            let expr = self.parse_expression()?;
            elems.push(ListElem { expr, splat });
            if !self.check(&TokenKind::Comma) {
                break;
            }
            self.advance()?;
            if self.check(&TokenKind::RBracket) {
                break;
            }
        }
        Ok(elems)
    }

    /// `[for (…) …]` after the opening bracket, `for` still current.
    fn parse_comprehension(&mut self, start: Location) -> Result<ExprRef, SyntaxError> {
        self.advance()?; // 'for'
        self.expect(&TokenKind::LParen)?;
        let bindings = self.parse_arguments()?;

        if self.check(&TokenKind::Semicolon) {
            // C-style: init; cond; update
            self.advance()?;
            let cond = self.parse_expression()?;
            self.expect(&TokenKind::Semicolon)?;
            let update = self.parse_arguments()?;
            self.expect(&TokenKind::RParen)?;
            let generators = self.parse_list_elements()?;
            let end = self.current.loc.clone();
            self.expect(&TokenKind::RBracket)?;
            return Ok(Expr::new(
                ExprKind::ListCompC {
                    init: bindings,
                    cond,
                    update,
                    generators,
                },
                span(&start, &end),
            ));
        }

        self.expect(&TokenKind::RParen)?;
        let generators = self.parse_list_elements()?;
        let end = self.current.loc.clone();
        self.expect(&TokenKind::RBracket)?;
        Ok(Expr::new(
            ExprKind::ListComp {
                bindings,
                generators,
            },
            span(&start, &end),
        ))
    }

    // ========================================================================
    // Token plumbing
    // ========================================================================

    fn advance(&mut self) -> Result<(), SyntaxError> {
        if let Some(error) = self.pending_error.take() {
            return Err(error);
        }
        let next = match self.lookahead.take() {
            Some(token) => token,
            None => self.scanner.next_token()?,
        };
        self.previous = std::mem::replace(&mut self.current, next);
        Ok(())
    }

    fn check(&self, kind: &TokenKind) -> bool {
        &self.current.kind == kind
    }

    /// One-token lookahead, used to tell `name = …` from `name(...)`.
    fn peek_is(&mut self, kind: &TokenKind) -> bool {
        if self.lookahead.is_none() && self.pending_error.is_none() {
            match self.scanner.next_token() {
                Ok(token) => self.lookahead = Some(token),
                Err(error) => {
                    self.pending_error = Some(error);
                    return false;
                }
            }
        }
        self.lookahead.as_ref().is_some_and(|t| &t.kind == kind)
    }

    fn expect(&mut self, kind: &TokenKind) -> Result<(), SyntaxError> {
        if self.check(kind) {
            self.advance()
        } else {
            Err(SyntaxError::new(
                self.current.loc.clone(),
                format!(
                    "expected {}, found {}",
                    kind.describe(),
                    self.current.kind.describe()
                ),
            ))
        }
    }

    fn expect_identifier(&mut self) -> Result<String, SyntaxError> {
        if let TokenKind::Ident(name) = self.current.kind.clone() {
            self.advance()?;
            Ok(name)
        } else {
            Err(self.unexpected("an identifier"))
        }
    }

    fn unexpected(&self, wanted: &str) -> SyntaxError {
        SyntaxError::new(
            self.current.loc.clone(),
            format!("expected {wanted}, found {}", self.current.kind.describe()),
        )
    }

    fn previous_loc(&self) -> Location {
        self.previous.loc.clone()
    }
}

fn binary(op: BinOp, lhs: ExprRef, rhs: ExprRef) -> ExprRef {
    let loc = span(&lhs.loc, &rhs.loc);
    Expr::new(ExprKind::Binary { op, lhs, rhs }, loc)
}

fn span(start: &Location, end: &Location) -> Location {
    Location {
        begin: start.begin.clone(),
        end: end.end.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontend::MemorySources;

    fn parse_source(source: &str) -> TranslationUnit {
        let mut sources = MemorySources::new();
        let root = sources.add("root", source);
        let mut unit = TranslationUnit::new(root);
        let scanner = Scanner::new(&mut sources, root).unwrap();
        Parser::new(scanner).unwrap().parse_unit(&mut unit).unwrap();
        unit
    }

    fn parse_error(source: &str) -> SyntaxError {
        let mut sources = MemorySources::new();
        let root = sources.add("root", source);
        let mut unit = TranslationUnit::new(root);
        let scanner = Scanner::new(&mut sources, root).unwrap();
        Parser::new(scanner)
            .unwrap()
            .parse_unit(&mut unit)
            .unwrap_err()
    }

    fn single_assignment(source: &str) -> Assign {
        let mut unit = parse_source(source);
        assert_eq!(unit.assignments.len(), 1);
        unit.assignments.remove(0)
    }

    #[test]
    fn test_precedence_mul_over_add() {
        let assign = single_assignment("x = 1 + 2 * 3;");
        let Some(expr) = assign.expr else {
            panic!("assignment without expression")
        };
        let ExprKind::Binary { op: BinOp::Add, rhs, .. } = &expr.kind else {
            panic!("expected + at the top, got {:?}", expr.kind)
        };
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Mul, .. }));
    }

    #[test]
    fn test_exponent_right_assoc() {
        let assign = single_assignment("x = 2 ^ 3 ^ 4;");
        let expr = assign.expr.unwrap();
        let ExprKind::Binary { op: BinOp::Exp, lhs, rhs } = &expr.kind else {
            panic!("expected ^ at the top")
        };
        assert!(matches!(lhs.kind, ExprKind::Number(n) if n == 2.0));
        assert!(matches!(rhs.kind, ExprKind::Binary { op: BinOp::Exp, .. }));
    }

    #[test]
    fn test_ternary_expression() {
        let assign = single_assignment("x = a == 1 ? 10 : 20;");
        let expr = assign.expr.unwrap();
        let ExprKind::If { cond, .. } = &expr.kind else {
            panic!("expected conditional")
        };
        assert!(matches!(cond.kind, ExprKind::Binary { op: BinOp::Eq, .. }));
    }

    #[test]
    fn test_call_with_named_and_positional_args() {
        let assign = single_assignment("x = f(1, a = 2);");
        let expr = assign.expr.unwrap();
        let ExprKind::Call { callee, args } = &expr.kind else {
            panic!("expected call")
        };
        assert!(matches!(&callee.kind, ExprKind::Ident(name) if name == "f"));
        assert_eq!(args.len(), 2);
        assert!(args[0].ident.is_empty());
        assert_eq!(args[1].ident, "a");
    }

    #[test]
    fn test_index_and_chained_postfix() {
        let assign = single_assignment("x = v[0][1];");
        let expr = assign.expr.unwrap();
        let ExprKind::Index { list, .. } = &expr.kind else {
            panic!("expected index")
        };
        assert!(matches!(list.kind, ExprKind::Index { .. }));
    }

    #[test]
    fn test_list_range_and_comprehension() {
        let assign = single_assignment("x = [1, 2, each v];");
        let expr = assign.expr.unwrap();
        let ExprKind::List { elems } = &expr.kind else {
            panic!("expected list")
        };
        assert_eq!(elems.len(), 3);
        assert!(elems[2].splat);

        let assign = single_assignment("x = [0 : 2 : 10];");
        let expr = assign.expr.unwrap();
        assert!(matches!(
            &expr.kind,
            ExprKind::Range { step: Some(_), .. }
        ));

        let assign = single_assignment("x = [for (i = [0:5]) i * i];");
        let expr = assign.expr.unwrap();
        let ExprKind::ListComp { bindings, generators } = &expr.kind else {
            panic!("expected comprehension")
        };
        assert_eq!(bindings.len(), 1);
        assert_eq!(bindings[0].ident, "i");
        assert_eq!(generators.len(), 1);
    }

    #[test]
    fn test_c_style_comprehension() {
        let assign = single_assignment("x = [for (i = 0; i < 5; i = i + 1) i];");
        let expr = assign.expr.unwrap();
        let ExprKind::ListCompC { init, update, .. } = &expr.kind else {
            panic!("expected C-style comprehension")
        };
        assert_eq!(init.len(), 1);
        assert_eq!(update.len(), 1);
    }

    #[test]
    fn test_let_and_lambda() {
        let assign = single_assignment("x = let (a = 1, b = 2) a + b;");
        let expr = assign.expr.unwrap();
        let ExprKind::Let { bindings, .. } = &expr.kind else {
            panic!("expected let")
        };
        assert_eq!(bindings.len(), 2);

        let assign = single_assignment("f = function (x) x + 1;");
        let expr = assign.expr.unwrap();
        assert!(matches!(expr.kind, ExprKind::Lambda { .. }));
    }

    #[test]
    fn test_module_declaration() {
        let unit = parse_source("module ring(r, w = 1) { echo(r); }");
        assert_eq!(unit.modules.len(), 1);
        let module = &unit.modules[0];
        assert_eq!(module.name, "ring");
        assert_eq!(module.params.len(), 2);
        assert!(module.params[0].expr.is_none());
        assert!(module.params[1].expr.is_some());
        assert_eq!(module.body.children.len(), 1);
    }

    #[test]
    fn test_function_declaration() {
        let unit = parse_source("function twice(x) = x * 2;");
        assert_eq!(unit.functions.len(), 1);
        assert_eq!(unit.functions[0].name, "twice");
    }

    #[test]
    fn test_module_call_with_block_body() {
        let unit = parse_source("translate(1) { a = 2; cube(a); }");
        assert_eq!(unit.module_calls.len(), 1);
        let ModuleItem::Single(call) = &unit.module_calls[0] else {
            panic!("expected a module call")
        };
        assert_eq!(call.name, "translate");
        assert_eq!(call.body.assignments.len(), 1);
        assert_eq!(call.body.children.len(), 1);
    }

    #[test]
    fn test_module_call_with_single_child() {
        let unit = parse_source("translate(1) cube(2);");
        let ModuleItem::Single(call) = &unit.module_calls[0] else {
            panic!("expected a module call")
        };
        assert_eq!(call.body.children.len(), 1);
    }

    #[test]
    fn test_if_module_with_else() {
        let unit = parse_source("if (1 == 1) { a(); } else { b(); }");
        let ModuleItem::If(ifm) = &unit.module_calls[0] else {
            panic!("expected if")
        };
        assert_eq!(ifm.then_body.children.len(), 1);
        assert_eq!(ifm.else_body.children.len(), 1);
    }

    #[test]
    fn test_modifier_wraps_call() {
        let unit = parse_source("#cube(1); *sphere(2);");
        assert_eq!(unit.module_calls.len(), 2);
        let ModuleItem::Modifier(m) = &unit.module_calls[0] else {
            panic!("expected modifier")
        };
        assert_eq!(m.tag, '#');
        let ModuleItem::Modifier(m) = &unit.module_calls[1] else {
            panic!("expected modifier")
        };
        assert_eq!(m.tag, '*');
    }

    #[test]
    fn test_for_statement_is_module_call() {
        let unit = parse_source("for (i = [0:10]) echo(i);");
        let ModuleItem::Single(call) = &unit.module_calls[0] else {
            panic!("expected for as a module call")
        };
        assert_eq!(call.name, "for");
        assert_eq!(call.args.len(), 1);
        assert_eq!(call.args[0].ident, "i");
        assert_eq!(call.body.children.len(), 1);
    }

    #[test]
    fn test_syntax_error_has_location() {
        let err = parse_error("x = ;");
        assert_eq!(err.loc.begin.line, 1);
        assert!(err.message.contains("expected an expression"));
    }

    #[test]
    fn test_error_aborts_file() {
        let err = parse_error("x = 1 +;\ny = 2;");
        assert!(err.message.contains("expected an expression"));
    }
}
