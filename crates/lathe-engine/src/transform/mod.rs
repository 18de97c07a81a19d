//! AST transformations: traversal skeleton and constant evaluation.

mod const_eval;
mod visit;

pub use const_eval::ConstEvaluator;
pub use visit::{
    ExprMap, Visitor, dispatch_map, walk_assign, walk_expr, walk_function_decl, walk_module_body,
    walk_module_decl, walk_module_item, walk_unit,
};
