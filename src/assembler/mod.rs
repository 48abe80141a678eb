//! The two-pass assembler.

pub mod argument;
pub mod program;

pub use argument::{Argument, BinOp};
pub use program::Program;
