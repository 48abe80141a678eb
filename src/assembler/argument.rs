//! The assembler's argument sum type.
//!
//! BasicCPU's own C++ implementation represents this with a polymorphic
//! `Argument*` base class and `dynamic_cast` at every use site. Here it is a
//! single tagged union and `Program::resolve` is an exhaustive match over it.

use crate::isa::Register;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
}

#[derive(Debug, Clone)]
pub enum Argument {
    Symbol(String),
    Register(Register),
    Integer(i64),
    Data(Vec<u8>),
    BinaryOp(BinOp, Box<Argument>, Box<Argument>),
}

impl Argument {
    pub fn symbol(name: impl Into<String>) -> Self {
        Argument::Symbol(name.into())
    }

    pub fn difference(lhs: impl Into<String>, rhs: impl Into<String>) -> Self {
        Argument::BinaryOp(
            BinOp::Sub,
            Box::new(Argument::Symbol(lhs.into())),
            Box::new(Argument::Symbol(rhs.into())),
        )
    }

    /// Pads `bytes` to a 4-byte boundary and optionally ensures a trailing
    /// NUL, mirroring BasicCPU's `stringToVector` helper used to assemble
    /// `db "..."` directives.
    pub fn string_data(text: &str, ensure_null: bool) -> Self {
        let mut bytes: Vec<u8> = text.bytes().collect();
        if ensure_null {
            bytes.push(0);
        }
        let padding = (4 - bytes.len() % 4) % 4;
        bytes.extend(std::iter::repeat(0u8).take(padding));
        Argument::Data(bytes)
    }

    pub fn is_register(&self) -> bool {
        matches!(self, Argument::Register(_))
    }
}
