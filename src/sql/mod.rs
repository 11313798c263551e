//! SQL surface: normalized AST and the parse adapter.

pub mod ast;
pub mod parse;

pub use ast::{Expr, SelectStmt, Statement};
pub use parse::parse;
