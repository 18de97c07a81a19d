//! Abstract syntax tree for the modelling language.
//!
//! Expressions are reference-counted and immutable after parsing; the
//! constant evaluator may share subtrees, so the expression "tree" is really
//! a DAG. Statements own their children directly.

use std::fmt;
use std::rc::Rc;

use crate::lexer::Location;

/// Shared handle to an expression node.
pub type ExprRef = Rc<Expr>;

/// Unary operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation
    Neg,
    /// Logical not
    Not,
}

/// Binary operators, in source-language surface order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    /// `+`
    Add,
    /// `-`
    Sub,
    /// `*`
    Mul,
    /// `/`
    Div,
    /// `%`
    Mod,
    /// `^`
    Exp,
    /// `<`
    Lt,
    /// `<=`
    Le,
    /// `>`
    Gt,
    /// `>=`
    Ge,
    /// `==`
    Eq,
    /// `!=`
    Ne,
    /// `&&`
    And,
    /// `||`
    Or,
}

impl fmt::Display for UnaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnaryOp::Neg => f.write_str("-"),
            UnaryOp::Not => f.write_str("!"),
        }
    }
}

impl fmt::Display for BinOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Mod => "%",
            BinOp::Exp => "^",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::And => "&&",
            BinOp::Or => "||",
        };
        f.write_str(s)
    }
}

/// An expression together with its source span.
#[derive(Debug, Clone, PartialEq)]
pub struct Expr {
    /// The expression variant.
    pub kind: ExprKind,
    /// Source span of the whole expression.
    pub loc: Location,
}

impl Expr {
    /// Wraps a kind and location into a shared expression node.
    pub fn new(kind: ExprKind, loc: Location) -> ExprRef {
        Rc::new(Expr { kind, loc })
    }

    /// True when the node is a literal the constant evaluator may inline.
    pub fn is_const_value(&self) -> bool {
        matches!(
            self.kind,
            ExprKind::Number(_) | ExprKind::Str(_) | ExprKind::Bool(_) | ExprKind::Undef
        )
    }
}

/// One element of a list literal or comprehension output.
#[derive(Debug, Clone, PartialEq)]
pub struct ListElem {
    /// The element expression.
    pub expr: ExprRef,
    /// True for `each expr`, splicing a vector into the enclosing list.
    pub splat: bool,
}

/// Expression variants.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprKind {
    /// Numeric literal
    Number(f64),
    /// String literal
    Str(String),
    /// `true` / `false` literal
    Bool(bool),
    /// The `undef` literal
    Undef,
    /// Identifier reference; a leading `$` marks a config variable
    Ident(String),
    /// Unary operation
    Unary {
        /// Operator
        op: UnaryOp,
        /// Operand
        operand: ExprRef,
    },
    /// Binary operation
    Binary {
        /// Operator
        op: BinOp,
        /// Left operand
        lhs: ExprRef,
        /// Right operand
        rhs: ExprRef,
    },
    /// Function call; the callee is an arbitrary expression, arguments reuse
    /// the assignment shape (positional arguments have an empty identifier)
    Call {
        /// Called expression
        callee: ExprRef,
        /// Arguments
        args: Vec<Assign>,
    },
    /// Ternary conditional `cond ? a : b`
    If {
        /// Condition
        cond: ExprRef,
        /// Value when true
        then_expr: ExprRef,
        /// Value when false
        else_expr: ExprRef,
    },
    /// List literal `[a, b, each c]`
    List {
        /// Elements, each optionally splatted
        elems: Vec<ListElem>,
    },
    /// Range literal `[start : end]` or `[start : step : end]`
    Range {
        /// First value
        start: ExprRef,
        /// Step, defaulting to 1
        step: Option<ExprRef>,
        /// Inclusive upper bound
        end: ExprRef,
    },
    /// List comprehension `[for (i = it, j = it2) expr, …]`
    ListComp {
        /// Iteration bindings, evaluated as nested loops left to right
        bindings: Vec<Assign>,
        /// Produced elements per innermost iteration
        generators: Vec<ListElem>,
    },
    /// C-style comprehension `[for (init; cond; update) expr, …]`
    ListCompC {
        /// Initial bindings
        init: Vec<Assign>,
        /// Loop condition
        cond: ExprRef,
        /// Per-iteration reassignments
        update: Vec<Assign>,
        /// Produced elements per iteration
        generators: Vec<ListElem>,
    },
    /// Indexing `list[index]`
    Index {
        /// Indexed expression
        list: ExprRef,
        /// Index expression
        index: ExprRef,
    },
    /// `let (bindings) body`
    Let {
        /// Bindings introduced for the body
        bindings: Vec<Assign>,
        /// Body expression
        body: ExprRef,
    },
    /// `function (params) body` literal
    Lambda {
        /// Parameters; those without defaults have `expr: None`
        params: Vec<Assign>,
        /// Body expression
        body: ExprRef,
    },
}

/// A named binding: statement-level assignment, call argument or parameter.
///
/// Positional call arguments use an empty identifier; parameters without a
/// default and bodyless declarations have `expr: None`.
#[derive(Debug, Clone, PartialEq)]
pub struct Assign {
    /// Bound name, empty for positional arguments.
    pub ident: String,
    /// Bound expression, absent for defaultless parameters.
    pub expr: Option<ExprRef>,
    /// Source span.
    pub loc: Location,
}

impl Assign {
    /// Creates a named assignment.
    pub fn new(ident: impl Into<String>, expr: Option<ExprRef>, loc: Location) -> Self {
        Self {
            ident: ident.into(),
            expr,
            loc,
        }
    }

    /// Creates a positional (unnamed) argument.
    pub fn positional(expr: ExprRef, loc: Location) -> Self {
        Self {
            ident: String::new(),
            expr: Some(expr),
            loc,
        }
    }
}

/// The ordered contents of a braced module body: assignments plus children.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ModuleBody {
    /// Assignments, in source order (normalised by the constant evaluator).
    pub assignments: Vec<Assign>,
    /// Module-call children, including `echo` and `for`.
    pub children: Vec<ModuleItem>,
}

impl ModuleBody {
    /// An empty body.
    pub fn empty() -> Self {
        Self::default()
    }

    /// True when the body has neither assignments nor children.
    pub fn is_empty(&self) -> bool {
        self.assignments.is_empty() && self.children.is_empty()
    }
}

/// A statement-position module construct.
#[derive(Debug, Clone, PartialEq)]
pub enum ModuleItem {
    /// An ordinary module call with an optional trailing body.
    Single(SingleModuleCall),
    /// `if (cond) … [else …]` at statement position.
    If(IfModule),
    /// A modifier-prefixed call (`*`, `!`, `#`, `%`).
    Modifier(ModuleModifier),
}

impl ModuleItem {
    /// The source span of the item.
    pub fn loc(&self) -> &Location {
        match self {
            ModuleItem::Single(call) => &call.loc,
            ModuleItem::If(ifm) => &ifm.loc,
            ModuleItem::Modifier(modifier) => &modifier.loc,
        }
    }
}

/// A module call statement, e.g. `translate(v) cube();`. Note that `for`
/// and `intersection_for` parse as calls with those builtin names.
#[derive(Debug, Clone, PartialEq)]
pub struct SingleModuleCall {
    /// Called module name.
    pub name: String,
    /// Arguments (positional arguments have empty identifiers).
    pub args: Vec<Assign>,
    /// Trailing child body; empty when the call ends with `;`.
    pub body: ModuleBody,
    /// Source span.
    pub loc: Location,
}

/// A statement-position conditional.
#[derive(Debug, Clone, PartialEq)]
pub struct IfModule {
    /// Condition expression.
    pub cond: ExprRef,
    /// Body when the condition holds.
    pub then_body: ModuleBody,
    /// Body otherwise; empty when there is no `else`.
    pub else_body: ModuleBody,
    /// Source span.
    pub loc: Location,
}

/// A modifier character wrapping a single module item.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleModifier {
    /// One of `*`, `!`, `#`, `%`.
    pub tag: char,
    /// The wrapped item.
    pub inner: Box<ModuleItem>,
    /// Source span.
    pub loc: Location,
}

/// A `module name(params) { … }` declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleDecl {
    /// Declared name.
    pub name: String,
    /// Parameters; defaultless parameters have `expr: None`.
    pub params: Vec<Assign>,
    /// Body.
    pub body: ModuleBody,
    /// Source span.
    pub loc: Location,
}

/// A `function name(params) = expr;` declaration.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionDecl {
    /// Declared name.
    pub name: String,
    /// Parameters; defaultless parameters have `expr: None`.
    pub params: Vec<Assign>,
    /// Body expression.
    pub body: ExprRef,
    /// Source span.
    pub loc: Location,
}

/// True when `name` denotes a config variable (leading `$`).
pub fn is_config_var(name: &str) -> bool {
    name.starts_with('$')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_const_value_detection() {
        let loc = Location::default();
        assert!(Expr::new(ExprKind::Number(1.0), loc.clone()).is_const_value());
        assert!(Expr::new(ExprKind::Undef, loc.clone()).is_const_value());
        assert!(!Expr::new(ExprKind::Ident("x".into()), loc).is_const_value());
    }

    #[test]
    fn test_config_var_names() {
        assert!(is_config_var("$fn"));
        assert!(!is_config_var("fn"));
        assert!(!is_config_var(""));
    }

    #[test]
    fn test_binop_display() {
        assert_eq!(BinOp::Le.to_string(), "<=");
        assert_eq!(BinOp::Exp.to_string(), "^");
        assert_eq!(UnaryOp::Not.to_string(), "!");
    }
}
