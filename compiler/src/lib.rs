// pgc: Pattern Graph Compiler
//
// Library root. Loads pattern graph descriptions, lowers them to LIR, emits
// C++ render procedures, and verifies emitted artifacts against a reference
// simulator.

pub mod codegen;
pub mod diag;
pub mod dot;
pub mod error;
pub mod frame;
pub mod graph;
pub mod id;
pub mod lexer;
pub mod lir;
pub mod lower;
pub mod parser;
pub mod pass;
pub mod pipeline;
pub mod registry;
pub mod sim;
pub mod state;
pub mod verify;

pub use error::{PgcError, PgcResult};
