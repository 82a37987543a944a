pub mod analysis;
pub mod ast;
pub mod binder;
pub mod diagnostics;
pub mod lexer;
pub mod parser;
pub mod resolver;
pub mod symbols;

pub use analysis::{CompletionContext, ParsedFile, SymbolEntry, SymbolEntryKind};
pub use ast::{Ast, Expr, ExprId, PosIdx, VarBinding};
pub use diagnostics::{render_diagnostics, Diagnostic, Position, Span};
pub use parser::{parse, Parse};
pub use resolver::{
    collect_symbols, definition_of, displacement_of, is_env_created, ParentMap, ResolveError,
};
pub use symbols::{Symbol, SymbolTable};
