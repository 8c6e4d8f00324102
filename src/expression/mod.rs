//! Numeric/boolean expression language used by animation modules.
//!
//! Source text is lexed, parsed, resolved against a [`compile::Scope`] and lowered to a flat
//! stack bytecode. The VM has no access to anything but the values it is handed, which is what
//! makes evaluating untrusted module expressions safe.

mod ast;
pub(crate) mod bytecode;
pub(crate) mod compile;
pub mod error;
mod lexer;
mod parser;
pub(crate) mod vm;

pub use compile::ExprCompileError;
