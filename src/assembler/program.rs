//! The assembler program model and two-pass assembler. `Program` is a value-owning builder: callers construct
//! instructions and arguments by calling methods on it, mirroring how
//! BasicCPU's own C++ `main()` builds a program instruction by instruction,
//! rather than by parsing assembly text.

use std::collections::HashMap;

use crate::assembler::argument::{Argument, BinOp};
use crate::error::AssemblerError;
use crate::fields::AddressingMode;
use crate::isa::{self, Register, SizeClass};

/// Either a label bound to an instruction's eventual address, or an equate
/// bound to a literal word.
#[derive(Debug, Clone, Copy)]
enum Symbol {
    Label(usize),
    Equate(i64),
}

/// A single assembler instruction before Pass 1 has assigned it an address.
#[derive(Debug, Clone)]
pub struct Instruction {
    pub mnemonic: String,
    pub args: Vec<Argument>,
    pub address: Option<u32>,
}

/// The two-pass assembler's value-owning builder.
pub struct Program {
    base_offset: u32,
    instructions: Vec<Instruction>,
    symbols: HashMap<String, Symbol>,
    pending_labels: Vec<String>,
}

impl Program {
    pub fn new(base_offset: u32) -> Self {
        Program { base_offset, instructions: Vec::new(), symbols: HashMap::new(), pending_labels: Vec::new() }
    }

    /// Queue a label to be bound to the next constructed instruction
    ///. Several labels may point at the
    /// same instruction, e.g. a string symbol and its length symbol.
    pub fn add_label(&mut self, name: impl Into<String>) {
        self.pending_labels.push(name.into());
    }

    /// Bind `name` directly to a literal word (an "equate"), independent of
    /// any instruction.
    pub fn set_symbol_value(&mut self, name: impl Into<String>, value: i64) -> Result<(), AssemblerError> {
        let name = name.into();
        if self.symbols.contains_key(&name) {
            return Err(AssemblerError::DuplicateSymbol { name });
        }
        self.symbols.insert(name, Symbol::Equate(value));
        Ok(())
    }

    /// Construct an instruction, consuming any labels queued since the last
    /// call. Returns the instruction's index, used to attach arguments or to
    /// bind further symbols directly to it (e.g. the `S1_LENGTH` label in
    /// the hello-world scenario, which names the instruction *following*
    /// the string data).
    pub fn create_instruction(&mut self, mnemonic: &str) -> usize {
        let index = self.instructions.len();
        self.instructions.push(Instruction { mnemonic: mnemonic.to_string(), args: Vec::new(), address: None });
        for label in self.pending_labels.drain(..) {
            self.symbols.insert(label, Symbol::Label(index));
        }
        index
    }

    /// Bind `name` to the address of an already-created instruction, e.g. to
    /// name the instruction that follows a data directive.
    pub fn set_symbol_label(&mut self, name: impl Into<String>, instruction: usize) -> Result<(), AssemblerError> {
        let name = name.into();
        if self.symbols.contains_key(&name) {
            return Err(AssemblerError::DuplicateSymbol { name });
        }
        self.symbols.insert(name, Symbol::Label(instruction));
        Ok(())
    }

    pub fn add_argument(&mut self, instruction: usize, arg: Argument) {
        self.instructions[instruction].args.push(arg);
    }

    /// Resolve an argument to a single word. Only
    /// valid once Pass 1 has assigned addresses to every instruction.
    fn resolve(&self, arg: &Argument) -> Result<i64, AssemblerError> {
        match arg {
            Argument::Integer(v) => Ok(*v),
            Argument::Symbol(name) => match self.symbols.get(name) {
                Some(Symbol::Equate(v)) => Ok(*v),
                Some(Symbol::Label(index)) => self.instructions[*index]
                    .address
                    .map(|a| a as i64)
                    .ok_or_else(|| AssemblerError::UnknownSymbol { name: name.clone() }),
                None => Err(AssemblerError::UnknownSymbol { name: name.clone() }),
            },
            Argument::BinaryOp(op, lhs, rhs) => {
                let lhs = self.resolve(lhs)?;
                let rhs = self.resolve(rhs)?;
                Ok(match op {
                    BinOp::Add => lhs + rhs,
                    BinOp::Sub => lhs - rhs,
                    BinOp::Mul => lhs * rhs,
                })
            }
            Argument::Data(_) => Err(AssemblerError::InvalidArgumentType { mnemonic: "<data>".to_string() }),
            Argument::Register(_) => Err(AssemblerError::InvalidArgumentType { mnemonic: "<register>".to_string() }),
        }
    }

    fn size_of(&self, instr: &Instruction) -> Result<u32, AssemblerError> {
        if is_data_directive(&instr.mnemonic) {
            let bytes: usize = instr.args.iter().map(data_len).sum();
            return Ok(bytes as u32);
        }
        match isa::size_class(&instr.mnemonic)? {
            SizeClass::Fixed(n) => Ok(n),
            SizeClass::Dynamic => {
                let last = instr.args.last().ok_or_else(|| AssemblerError::MissingArgument { mnemonic: instr.mnemonic.clone() })?;
                if last.is_register() {
                    Ok(4)
                } else {
                    Ok(8)
                }
            }
        }
    }

    /// Pass 1: assign every instruction's address given the base offset.
    fn assign_addresses(&mut self) -> Result<(), AssemblerError> {
        let mut ip = self.base_offset;
        for i in 0..self.instructions.len() {
            let size = self.size_of(&self.instructions[i])?;
            self.instructions[i].address = Some(ip);
            ip += size;
            ip = align4(ip);
        }
        Ok(())
    }

    /// Pass 2: resolve symbols and emit the big-endian byte image.
    fn emit(&self) -> Result<Vec<u8>, AssemblerError> {
        let mut out = Vec::new();
        for instr in &self.instructions {
            if is_data_directive(&instr.mnemonic) {
                for arg in &instr.args {
                    match arg {
                        Argument::Data(bytes) => out.extend_from_slice(bytes),
                        other => return Err(AssemblerError::InvalidArgumentType { mnemonic: format!("{:?}", other) }),
                    }
                }
                continue;
            }
            for word in self.encode_instruction(instr)? {
                out.extend_from_slice(&word.to_be_bytes());
            }
        }
        let padding = (4 - out.len() % 4) % 4;
        out.extend(std::iter::repeat(0u8).take(padding));
        Ok(out)
    }

    pub fn assemble(&mut self) -> Result<Vec<u8>, AssemblerError> {
        self.assign_addresses()?;
        self.emit()
    }

    /// The final address of `name`, for callers that need to know where a
    /// label landed without re-resolving a fresh argument (e.g. to set an
    /// interrupt vector slot before boot).
    pub fn address_of(&self, name: &str) -> Result<u32, AssemblerError> {
        self.resolve(&Argument::Symbol(name.to_string())).map(|v| v as u32)
    }

    fn encode_instruction(&self, instr: &Instruction) -> Result<Vec<u32>, AssemblerError> {
        let opcode = isa::opcode_of(&instr.mnemonic)?;
        let address = instr.address.expect("Pass 1 assigns every instruction an address before Pass 2 emits it");
        encode_by_shape(opcode, &instr.mnemonic, &instr.args, address, |arg| self.resolve(arg))
    }
}

fn align4(value: u32) -> u32 {
    (value + 3) & !3
}

fn is_data_directive(mnemonic: &str) -> bool {
    matches!(mnemonic, "db" | "dw" | "dd")
}

fn data_len(arg: &Argument) -> usize {
    match arg {
        Argument::Data(bytes) => bytes.len(),
        _ => 0,
    }
}

/// Dispatches each mnemonic to its word-encoding shape, mirroring
/// BasicCPU's per-opcode `generateInstructions` switch. `resolve` is
/// threaded in as a closure so this free function can be unit-tested
/// without a full `Program`.
fn encode_by_shape(
    opcode: u8,
    mnemonic: &str,
    args: &[Argument],
    address: u32,
    resolve: impl Fn(&Argument) -> Result<i64, AssemblerError>,
) -> Result<Vec<u32>, AssemblerError> {
    use isa::DecodedWord as W;

    match mnemonic {
        // No operands at all.
        "halt" | "idle" | "cli" | "sti" | "rti" | "ret" => Ok(vec![W::encode(opcode, AddressingMode::Absolute, 0, 0)]),

        // A single destination register, no other operand.
        "rstr" | "tst" | "inc" | "dec" | "pop" | "popw" | "popb" => {
            let dest = register_arg(mnemonic, args, 0)?;
            Ok(vec![W::encode(opcode, AddressingMode::Register, dest.index(), 0)])
        }

        // Relative branches and call: destination field unused, low16 carries
        // the signed offset resolved against this instruction's own address.
        "jmp" | "je" | "jne" | "jge" | "jg" | "jle" | "jl" | "call" => {
            let target = resolve(&args[0])?;
            let offset = target - address as i64;
            if !(-0xFFFF..=0xFFFF).contains(&offset) {
                return Err(AssemblerError::JumpOutOfRange { from: address, to: target as u32, offset });
            }
            if offset % 4 != 0 {
                return Err(AssemblerError::JumpOutOfRange { from: address, to: target as u32, offset });
            }
            Ok(vec![W::encode(opcode, AddressingMode::Relative, 0, offset as i16 as u16)])
        }

        // `read r, port`: port is always a small immediate, fits directly in
        // low16; no trailing word is ever needed.
        "read" => {
            let dest = register_arg(mnemonic, args, 0)?;
            let port = resolve(&args[1])?;
            if !(0..=0xFFFF).contains(&port) {
                return Err(AssemblerError::PortOutOfRange { port: port as u32 });
            }
            Ok(vec![W::encode(opcode, AddressingMode::Immediate, dest.index(), port as u16)])
        }

        // `write port, x`: the port occupies low16; the value x determines
        // whether a trailing word is needed, and when it is a register its
        // index is carried in the otherwise-unused destination field.
        "write" => {
            let port = resolve(&args[0])?;
            if !(0..=0xFFFF).contains(&port) {
                return Err(AssemblerError::PortOutOfRange { port: port as u32 });
            }
            match &args[1] {
                Argument::Register(r) => Ok(vec![W::encode(opcode, AddressingMode::Register, r.index(), port as u16)]),
                other => {
                    let value = resolve(other)? as u32;
                    Ok(vec![
                        W::encode(opcode, AddressingMode::Immediate, 0, port as u16),
                        value,
                    ])
                }
            }
        }

        // Three-register-operand opcodes: dest, src1, src2 all packed into
        // the instruction word, always 4 bytes.
        "memcpy" | "memset" => {
            let dest = register_arg(mnemonic, args, 0)?;
            let src1 = register_arg(mnemonic, args, 1)?;
            let src2 = register_arg(mnemonic, args, 2)?;
            let low16 = (src1.index() as u16) << 8 | src2.index() as u16;
            Ok(vec![W::encode(opcode, AddressingMode::Register, dest.index(), low16)])
        }

        // `mulw r, imm16`: the immediate lives directly in low16, never in a
        // trailing word.
        "mulw" => {
            let dest = register_arg(mnemonic, args, 0)?;
            let imm = resolve(&args[1])?;
            Ok(vec![W::encode(opcode, AddressingMode::Immediate, dest.index(), imm as u16)])
        }

        // `load`/`loadb`/`loadw`: dest register receives the value; the
        // address operand is either an indirect register or an absolute
        // address requiring a trailing word.
        "load" | "loadw" | "loadb" => {
            let dest = register_arg(mnemonic, args, 0)?;
            match &args[1] {
                Argument::Register(r) => Ok(vec![W::encode(opcode, AddressingMode::Indirect, dest.index(), r.index() as u16)]),
                other => {
                    let addr = resolve(other)? as u32;
                    Ok(vec![W::encode(opcode, AddressingMode::Absolute, dest.index(), 0), addr])
                }
            }
        }

        // `str`/`strw`/`strb`: dest register is the pointer (base address);
        // the value operand is register or immediate, dynamically sized.
        "str" | "strw" | "strb" => {
            let dest = register_arg(mnemonic, args, 0)?;
            match &args[1] {
                Argument::Register(r) => Ok(vec![W::encode(opcode, AddressingMode::Register, dest.index(), r.index() as u16)]),
                other => {
                    let value = resolve(other)? as u32;
                    Ok(vec![W::encode(opcode, AddressingMode::Indirect, dest.index(), 0), value])
                }
            }
        }

        // `push`/`pushw`/`pushb`: no destination register, value only.
        "push" | "pushw" | "pushb" => match &args[0] {
            Argument::Register(r) => Ok(vec![W::encode(opcode, AddressingMode::Register, r.index(), 0)]),
            other => {
                let value = resolve(other)? as u32;
                Ok(vec![W::encode(opcode, AddressingMode::Immediate, 0, 0), value])
            }
        },

        // `clrset`/`clrsetv x`: single raster-color operand, dynamic size.
        "clrset" | "clrsetv" => match &args[0] {
            Argument::Register(r) => Ok(vec![W::encode(opcode, AddressingMode::Register, r.index(), 0)]),
            other => {
                let value = resolve(other)? as u32;
                Ok(vec![W::encode(opcode, AddressingMode::Immediate, 0, 0), value])
            }
        },

        // The general two-operand family: `mov`/arithmetic/shift/cmp. dest
        // register plus a register-or-immediate source.
        "mov" | "cmp" | "add" | "sub" | "mul" | "and" | "or" | "shr" | "shl" => {
            let dest = register_arg(mnemonic, args, 0)?;
            match &args[1] {
                Argument::Register(r) => Ok(vec![W::encode(opcode, AddressingMode::Register, dest.index(), r.index() as u16)]),
                other => {
                    let value = resolve(other)?;
                    if mnemonic == "shr" || mnemonic == "shl" {
                        if !(0..=32).contains(&value) {
                            return Err(AssemblerError::ShiftOutOfRange { amount: value as u32 });
                        }
                        Ok(vec![W::encode(opcode, AddressingMode::Immediate, dest.index(), value as u16 & 0x3f)])
                    } else {
                        Ok(vec![W::encode(opcode, AddressingMode::Immediate, dest.index(), 0), value as u32])
                    }
                }
            }
        }

        "not" => {
            let dest = register_arg(mnemonic, args, 0)?;
            Ok(vec![W::encode(opcode, AddressingMode::Register, dest.index(), 0)])
        }

        other => Err(AssemblerError::UnknownMnemonic { mnemonic: other.to_string() }),
    }
}

fn register_arg(mnemonic: &str, args: &[Argument], index: usize) -> Result<Register, AssemblerError> {
    match args.get(index) {
        Some(Argument::Register(r)) => Ok(*r),
        Some(_) => Err(AssemblerError::InvalidArgumentType { mnemonic: mnemonic.to_string() }),
        None => Err(AssemblerError::MissingArgument { mnemonic: mnemonic.to_string() }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isa::Register;

    fn word_at(image: &[u8], offset: usize) -> u32 {
        u32::from_be_bytes([image[offset], image[offset + 1], image[offset + 2], image[offset + 3]])
    }

    #[test]
    fn hello_world_assembles_and_resolves_length() {
        let mut program = Program::new(7_000_000);

        let jmp_main = program.create_instruction("jmp");
        program.add_argument(jmp_main, Argument::symbol("main"));

        program.add_label("S1");
        let db_hello = program.create_instruction("db");
        program.add_argument(db_hello, Argument::string_data("Hello World!\n", true));

        program.add_label("S1_LENGTH");
        program.add_label("main");
        let mov_r1 = program.create_instruction("mov");
        program.add_argument(mov_r1, Argument::Register(Register::R1));
        program.add_argument(mov_r1, Argument::symbol("S1"));

        let mov_r2 = program.create_instruction("mov");
        program.add_argument(mov_r2, Argument::Register(Register::R2));
        program.add_argument(mov_r2, Argument::difference("S1_LENGTH", "S1"));

        let memcpy = program.create_instruction("memcpy");
        program.add_argument(memcpy, Argument::Register(Register::R1));
        program.add_argument(memcpy, Argument::Register(Register::R1));
        program.add_argument(memcpy, Argument::Register(Register::R2));

        let write = program.create_instruction("write");
        program.add_argument(write, Argument::Integer(1));
        program.add_argument(write, Argument::Integer(1));

        program.create_instruction("halt");

        let image = program.assemble().expect("hello world assembles");
        assert_eq!(image.len() % 4, 0);

        let s1_length = program.address_of("S1_LENGTH").unwrap();
        let s1 = program.address_of("S1").unwrap();
        assert_eq!(s1_length - s1, 16); // "Hello World!\n\0" padded to 16 bytes
    }

    #[test]
    fn call_ret_round_trip_addresses() {
        let mut program = Program::new(0);
        let call = program.create_instruction("call");
        program.add_argument(call, Argument::symbol("f"));
        program.create_instruction("halt");
        program.add_label("f");
        let mov = program.create_instruction("mov");
        program.add_argument(mov, Argument::Register(Register::R1));
        program.add_argument(mov, Argument::Integer(0x2A));
        program.create_instruction("ret");

        let image = program.assemble().unwrap();
        let f_addr = program.address_of("f").unwrap();
        assert_eq!(f_addr, 8); // call (4) + halt (4)
        assert_eq!(word_at(&image, 0) >> 24, isa::opcode_of("call").unwrap() as u32);
    }

    #[test]
    fn jump_out_of_range_is_rejected() {
        let mut program = Program::new(0);
        let jmp = program.create_instruction("jmp");
        program.add_argument(jmp, Argument::symbol("far"));
        for _ in 0..20_000 {
            program.create_instruction("halt");
        }
        program.add_label("far");
        program.create_instruction("halt");

        let err = program.assemble().unwrap_err();
        assert!(matches!(err, AssemblerError::JumpOutOfRange { .. }));
    }

    #[test]
    fn duplicate_symbol_is_rejected() {
        let mut program = Program::new(0);
        program.set_symbol_value("K", 1).unwrap();
        let err = program.set_symbol_value("K", 2).unwrap_err();
        assert!(matches!(err, AssemblerError::DuplicateSymbol { .. }));
    }

    #[test]
    fn arithmetic_and_branch_sizes_agree() {
        let mut program = Program::new(0);
        let mov1 = program.create_instruction("mov");
        program.add_argument(mov1, Argument::Register(Register::R1));
        program.add_argument(mov1, Argument::Integer(3));
        let mov2 = program.create_instruction("mov");
        program.add_argument(mov2, Argument::Register(Register::R2));
        program.add_argument(mov2, Argument::Integer(5));
        let cmp = program.create_instruction("cmp");
        program.add_argument(cmp, Argument::Register(Register::R1));
        program.add_argument(cmp, Argument::Register(Register::R2));
        let jge = program.create_instruction("jge");
        program.add_argument(jge, Argument::symbol("skip"));
        let mov3 = program.create_instruction("mov");
        program.add_argument(mov3, Argument::Register(Register::R3));
        program.add_argument(mov3, Argument::Integer(1));
        program.add_label("skip");
        program.create_instruction("halt");

        let image = program.assemble().unwrap();
        // mov immediate (8) + mov immediate (8) + cmp register (4) + jge (4) + mov immediate (8) + halt (4)
        assert_eq!(image.len(), 8 + 8 + 4 + 4 + 8 + 4);
    }
}
