//! The CPU core: register file, status
//! flags, interrupt dispatch and the fetch-decode-execute loop over the ISA.
//!
//! Grounded on `em68k`'s own `processor.rs`, which plays the analogous role
//! for the m68k: a single struct owning the register file and a loop that
//! fetches, decodes and dispatches one instruction at a time. The
//! addressing-mode dispatch table shape (a `match` on mnemonic rather than
//! bitmasks scattered through execute arms) keeps bit twiddling confined to
//! `isa`/`fields`.

use std::sync::Arc;
use std::time::Duration;

use log::{trace, warn};

use crate::board::PortBus;
use crate::devices::SharedMemory;
use crate::error::EmulatorError;
use crate::fields::{AddressingMode, Flags};
use crate::interrupt::{InterruptController, InterruptLines};
use crate::isa::{self, DecodedWord, Register};

/// The initial `dl` (delay) register value at boot.
const INITIAL_DELAY: u32 = 100_000;

/// Bit 31 of `st`: interrupts are dispatched only while this is set.
const INTERRUPT_ENABLE_BIT: u32 = 1 << 31;

/// Context threaded through every `execute` call: the shared resources a
/// running instruction may need beyond the register file itself. Bundled so
/// `execute`'s signature does not grow a parameter per opcode family.
struct Context<'a> {
    memory: &'a SharedMemory,
    lines: &'a Arc<InterruptLines>,
    interrupt_controller: Option<&'a Arc<InterruptController>>,
    ports: &'a PortBus,
    memory_size: usize,
    framebuffer: Option<(usize, u32, u32)>,
}

/// The eleven architectural registers plus the transient
/// comparison state `cmp`/`tst` leave behind for the `j*` family.
pub struct Cpu {
    gp: [u32; 8], // index 1..=7 used; 0 is a dead slot so `Register::index()` can address directly.
    sp: u32,
    lr: u32,
    ip: u32,
    dl: u32,
    st: u32,
    before: u32,
    result: u32,
    carry: bool,
    halted: bool,
}

impl Cpu {
    pub fn new() -> Self {
        Cpu { gp: [0; 8], sp: 0, lr: 0, ip: 0, dl: 0, st: 0, before: 0, result: 0, carry: false, halted: false }
    }

    /// Reads a register's current value. Exposed for callers that boot a
    /// CPU to completion and then inspect the final state, e.g. the
    /// end-to-end integration tests.
    pub fn register(&self, r: Register) -> u32 {
        self.reg(r.index())
    }

    fn reg(&self, index: u8) -> u32 {
        match index {
            1..=7 => self.gp[index as usize],
            11 => self.sp,
            12 => self.lr,
            13 => self.ip,
            14 => self.dl,
            15 => self.st,
            _ => 0,
        }
    }

    fn set_reg(&mut self, index: u8, value: u32) {
        match index {
            1..=7 => self.gp[index as usize] = value,
            11 => self.sp = value,
            12 => self.lr = value,
            13 => self.ip = value,
            14 => self.dl = value,
            15 => self.st = value,
            _ => {}
        }
    }

    fn flags(&self) -> Flags {
        Flags::from_comparison(self.before, self.result, self.carry)
    }

    fn set_flags(&mut self, before: u32, result: u32, carry: bool) {
        self.before = before;
        self.result = result;
        self.carry = carry;
    }

    /// Boot and run to completion. Consumes the
    /// resources it needs directly rather than borrowing a `Motherboard`, so
    /// the CPU has no dependency on the bus that owns it.
    pub fn start(
        &mut self,
        memory: SharedMemory,
        lines: Arc<InterruptLines>,
        interrupt_controller: Option<Arc<InterruptController>>,
        ports: PortBus,
        memory_size: usize,
        entry_ip: u32,
    ) -> Result<(), EmulatorError> {
        self.ip = entry_ip;
        self.sp = ((memory_size as u32).saturating_sub(1)) & !3;
        self.st = 0;
        self.dl = INITIAL_DELAY;
        self.halted = false;

        let framebuffer = ports.framebuffer_region();
        let ctx = Context {
            memory: &memory,
            lines: &lines,
            interrupt_controller: interrupt_controller.as_ref(),
            ports: &ports,
            memory_size,
            framebuffer,
        };

        while !self.halted {
            if self.st & INTERRUPT_ENABLE_BIT != 0 {
                if let Some(line) = lines.lowest_pending() {
                    self.dispatch_interrupt(line, &ctx)?;
                    continue;
                }
            }

            if self.ip as usize + 4 > memory_size {
                break;
            }

            let instr_addr = self.ip;
            let word = read_u32(&memory, self.ip as usize, memory_size)?;
            self.ip += 4;
            let decoded = DecodedWord::decode(word).ok_or_else(|| EmulatorError::InstructionFault {
                address: instr_addr,
                reason: format!("undefined opcode/addressing mode in word {:#010x}", word),
            })?;
            trace!("{:#010x}: {:#010x}", instr_addr, word);
            self.execute(instr_addr, decoded, &ctx)?;
        }
        Ok(())
    }

    /// Step 1 of the main loop: save all registers, jump to the handler, and
    /// clear the serviced line.
    fn dispatch_interrupt(&mut self, line: u32, ctx: &Context) -> Result<(), EmulatorError> {
        let ic = ctx.interrupt_controller.ok_or_else(|| EmulatorError::InstructionFault {
            address: self.ip,
            reason: "interrupt line raised with no interrupt controller installed".to_string(),
        })?;
        let handler = read_u32(ctx.memory, ic.vector_address() + 4 * line as usize, ctx.memory_size)?;
        if handler == 0 {
            ctx.lines.clear(line);
            return Ok(());
        }
        self.save_registers(ctx)?;
        self.ip = handler;
        ctx.lines.clear(line);
        Ok(())
    }

    /// Push order: `st, dl, ip, lr, sp`, three zero
    /// placeholders, then `r7..r1` — 5 + 3 + 7 = 15 words.
    fn save_registers(&mut self, ctx: &Context) -> Result<(), EmulatorError> {
        let sp0 = self.sp;
        let values = [
            self.st,
            self.dl,
            self.ip,
            self.lr,
            sp0,
            0,
            0,
            0,
            self.gp[7],
            self.gp[6],
            self.gp[5],
            self.gp[4],
            self.gp[3],
            self.gp[2],
            self.gp[1],
        ];
        for value in values {
            self.sp = self.sp.wrapping_sub(4);
            write_u32(ctx.memory, self.sp as usize, value, ctx.memory_size)?;
        }
        Ok(())
    }

    /// `rti`: inverse of [`Cpu::save_registers`]. The lowest address of the
    /// save block holds `r1`, ascending through `r7`; discards the saved
    /// `sp` slot (the pop arithmetic already restores `sp` correctly) and
    /// the three placeholders.
    fn restore_registers(&mut self, ctx: &Context) -> Result<(), EmulatorError> {
        for idx in 1..=7 {
            let value = read_u32(ctx.memory, self.sp as usize, ctx.memory_size)?;
            self.sp = self.sp.wrapping_add(4);
            self.gp[idx] = value;
        }
        self.sp = self.sp.wrapping_add(4 * 3); // three zero placeholders
        self.sp = self.sp.wrapping_add(4); // saved sp, discarded
        self.lr = read_u32(ctx.memory, self.sp as usize, ctx.memory_size)?;
        self.sp = self.sp.wrapping_add(4);
        self.ip = read_u32(ctx.memory, self.sp as usize, ctx.memory_size)?;
        self.sp = self.sp.wrapping_add(4);
        self.dl = read_u32(ctx.memory, self.sp as usize, ctx.memory_size)?;
        self.sp = self.sp.wrapping_add(4);
        self.st = read_u32(ctx.memory, self.sp as usize, ctx.memory_size)?;
        self.sp = self.sp.wrapping_add(4);
        Ok(())
    }

    /// `rstr`: reload `r1..r7` from the first seven words of a save block
    /// produced by [`Cpu::save_registers`] and addressed by `ptr`
    ///. The trailing placeholder, `sp`, `lr`, `ip`,
    /// `dl` and `st` slots are left untouched; only "all general-purpose
    /// registers" are named.
    fn restore_general_purpose(&mut self, ptr: u32, ctx: &Context) -> Result<(), EmulatorError> {
        for (i, idx) in (1..=7).enumerate() {
            let value = read_u32(ctx.memory, ptr as usize + i * 4, ctx.memory_size)?;
            self.gp[idx] = value;
        }
        Ok(())
    }

    fn execute(&mut self, instr_addr: u32, d: DecodedWord, ctx: &Context) -> Result<(), EmulatorError> {
        let mnemonic = isa::mnemonic_of(d.opcode).ok_or_else(|| EmulatorError::InstructionFault {
            address: instr_addr,
            reason: format!("opcode {:#04x} is not assigned", d.opcode),
        })?;

        match mnemonic {
            "halt" => self.halted = true,
            "idle" => std::thread::sleep(Duration::from_micros(self.dl as u64)),
            "cli" => self.st &= !INTERRUPT_ENABLE_BIT,
            "sti" => self.st |= INTERRUPT_ENABLE_BIT,
            "rstr" => self.restore_general_purpose(self.reg(d.dest), ctx)?,
            "rti" => self.restore_registers(ctx)?,

            "cmp" => {
                let x = self.operand_value(d, ctx)?;
                let r = self.reg(d.dest);
                self.set_flags(r, r.wrapping_sub(x), (r as u64) < (x as u64));
            }
            "tst" => {
                let r = self.reg(d.dest);
                self.set_flags(r, r, false);
            }

            "jmp" => self.branch(instr_addr, d.imm16(), true),
            "je" => self.branch(instr_addr, d.imm16(), self.flags().zero),
            "jne" => self.branch(instr_addr, d.imm16(), !self.flags().zero),
            "jge" => self.branch(instr_addr, d.imm16(), !self.flags().negative),
            "jg" => self.branch(instr_addr, d.imm16(), !self.flags().zero && !self.flags().negative),
            "jle" => self.branch(instr_addr, d.imm16(), self.flags().zero || self.flags().negative),
            "jl" => self.branch(instr_addr, d.imm16(), self.flags().negative),

            "call" => {
                self.sp = self.sp.wrapping_sub(4);
                write_u32(ctx.memory, self.sp as usize, self.lr, ctx.memory_size)?;
                self.lr = self.ip;
                self.branch(instr_addr, d.imm16(), true);
            }
            "ret" => {
                self.ip = self.lr;
                self.lr = read_u32(ctx.memory, self.sp as usize, ctx.memory_size)?;
                self.sp = self.sp.wrapping_add(4);
            }

            "mov" => {
                let x = self.operand_value(d, ctx)?;
                self.set_reg(d.dest, x);
            }

            "load" | "loadw" | "loadb" => {
                let addr = self.address_operand(d, ctx)?;
                let width = width_of(mnemonic);
                let value = read_width(ctx.memory, addr as usize, width, ctx.memory_size)?;
                self.set_reg(d.dest, value);
            }
            "str" | "strw" | "strb" => {
                let addr = self.reg(d.dest);
                let value = self.store_value_operand(d, ctx)?;
                let width = width_of(mnemonic);
                write_width(ctx.memory, addr as usize, value, width, ctx.memory_size)?;
            }

            "push" | "pushw" | "pushb" => {
                let value = self.push_pop_value_operand(d, ctx)?;
                match mnemonic {
                    "push" => {
                        self.sp = self.sp.wrapping_sub(4);
                        write_u32(ctx.memory, self.sp as usize, value, ctx.memory_size)?;
                    }
                    _ => {
                        self.sp = self.sp.wrapping_sub(2);
                        write_u16(ctx.memory, self.sp as usize, value as u16, ctx.memory_size)?;
                    }
                }
            }
            "pop" | "popw" | "popb" => {
                let value = match mnemonic {
                    "pop" => {
                        let v = read_u32(ctx.memory, self.sp as usize, ctx.memory_size)?;
                        self.sp = self.sp.wrapping_add(4);
                        v
                    }
                    _ => {
                        let v = read_u16(ctx.memory, self.sp as usize, ctx.memory_size)? as u32;
                        self.sp = self.sp.wrapping_add(2);
                        v
                    }
                };
                self.set_reg(d.dest, value);
            }

            "memcpy" => {
                let (src, dst) = (self.reg(src_from_packed(d).0), self.reg(d.dest));
                let len = self.reg(src_from_packed(d).1);
                copy_bytes(ctx.memory, src as usize, dst as usize, len as usize, ctx.memory_size)?;
            }
            "memset" => {
                let (val_reg, len_reg) = src_from_packed(d);
                let val = self.reg(val_reg) as u8;
                let len = self.reg(len_reg);
                fill_bytes(ctx.memory, self.reg(d.dest) as usize, val, len as usize, ctx.memory_size)?;
            }

            "clrset" | "clrsetv" => self.clrset(mnemonic, d, ctx)?,

            "read" => {
                let value = ctx.interrupt_controller.map(|ic| ic.get_pin(d.uimm16() as u32)).unwrap_or(0);
                self.set_reg(d.dest, value);
            }
            "write" => {
                let port = d.uimm16();
                let value = self.write_value_operand(d, ctx)?;
                if let Err(e) = ctx.ports.write(port, value) {
                    warn!("write to port {}: {}", port, e);
                }
            }

            "add" | "sub" | "mul" | "and" | "or" => {
                let x = self.operand_value(d, ctx)?;
                let r = self.reg(d.dest);
                let result = match mnemonic {
                    "add" => r.wrapping_add(x),
                    "sub" => r.wrapping_sub(x),
                    "mul" => r.wrapping_mul(x),
                    "and" => r & x,
                    "or" => r | x,
                    _ => unreachable!(),
                };
                let carry = match mnemonic {
                    "add" => result < r,
                    "sub" => (r as u64) < (x as u64),
                    "mul" => ((r as u64) * (x as u64)) >> 32 != 0,
                    _ => false,
                };
                self.set_reg(d.dest, result);
                self.set_flags(r, result, carry);
            }
            "not" => {
                let r = self.reg(d.dest);
                let result = !r;
                self.set_reg(d.dest, result);
                self.set_flags(r, result, false);
            }
            "inc" | "dec" => {
                let r = self.reg(d.dest);
                let result = if mnemonic == "inc" { r.wrapping_add(1) } else { r.wrapping_sub(1) };
                self.set_reg(d.dest, result);
                self.set_flags(r, result, mnemonic == "dec" && r == 0);
            }
            "mulw" => {
                let r = self.reg(d.dest);
                let result = r.wrapping_mul(d.uimm16() as u32);
                self.set_reg(d.dest, result);
                self.set_flags(r, result, false);
            }
            "shr" | "shl" => {
                let amount = self.shift_amount(d, ctx)?;
                let r = self.reg(d.dest);
                let result = if mnemonic == "shr" { r.wrapping_shr(amount) } else { r.wrapping_shl(amount) };
                self.set_reg(d.dest, result);
                self.set_flags(r, result, false);
            }

            other => {
                return Err(EmulatorError::InstructionFault {
                    address: instr_addr,
                    reason: format!("mnemonic `{}` has no execute arm", other),
                })
            }
        }
        Ok(())
    }

    /// Relative branch: target = `instr_addr + offset`. The effective new
    /// `ip` is `instr_addr + offset`, which already accounts for the
    /// post-fetch increment since `instr_addr` is the branch instruction's
    /// own address, not the incremented `ip`.
    fn branch(&mut self, instr_addr: u32, offset: i16, taken: bool) {
        if taken {
            self.ip = (instr_addr as i64 + offset as i64) as u32;
        }
    }

    /// The general two-operand family's source: a source register (mode
    /// `Register`, full index in the operand field) or a trailing immediate
    /// word (mode `Immediate`).
    fn operand_value(&mut self, d: DecodedWord, ctx: &Context) -> Result<u32, EmulatorError> {
        match d.mode {
            AddressingMode::Register => Ok(self.reg(d.uimm16() as u8)),
            AddressingMode::Immediate => {
                let value = read_u32(ctx.memory, self.ip as usize, ctx.memory_size)?;
                self.consume_trailing_word();
                Ok(value)
            }
            other => Err(EmulatorError::InstructionFault {
                address: self.ip,
                reason: format!("unsupported addressing mode {:?} for this opcode", other),
            }),
        }
    }

    /// Advances `ip` past a trailing word once it has been consumed. Used
    /// wherever a long form's extra word must be skipped after reading it.
    fn consume_trailing_word(&mut self) {
        self.ip += 4;
    }

    /// `load`'s address operand: an indirect register (mode `Indirect`,
    /// register index in the operand field) or an absolute trailing word
    /// (mode `Absolute`).
    fn address_operand(&mut self, d: DecodedWord, ctx: &Context) -> Result<u32, EmulatorError> {
        match d.mode {
            AddressingMode::Indirect => Ok(self.reg(d.uimm16() as u8)),
            AddressingMode::Absolute => {
                let addr = read_u32(ctx.memory, self.ip as usize, ctx.memory_size)?;
                self.consume_trailing_word();
                Ok(addr)
            }
            other => Err(EmulatorError::InstructionFault {
                address: self.ip,
                reason: format!("unsupported addressing mode {:?} for load", other),
            }),
        }
    }

    /// `str`'s value operand: the destination field already carries the
    /// pointer register, so a source register (mode `Register`) is packed
    /// into the low byte of the operand field instead; otherwise a trailing
    /// immediate word (mode `Indirect`).
    fn store_value_operand(&mut self, d: DecodedWord, ctx: &Context) -> Result<u32, EmulatorError> {
        match d.mode {
            AddressingMode::Register => Ok(self.reg(d.uimm16() as u8)),
            AddressingMode::Indirect => {
                let value = read_u32(ctx.memory, self.ip as usize, ctx.memory_size)?;
                self.consume_trailing_word();
                Ok(value)
            }
            other => Err(EmulatorError::InstructionFault {
                address: self.ip,
                reason: format!("unsupported addressing mode {:?} for store", other),
            }),
        }
    }

    /// `write`'s value operand: the operand field already carries the port
    /// number, so a source register (mode `Register`) rides in the
    /// destination field instead, exactly like `push`'s register form;
    /// otherwise a trailing immediate word (mode `Immediate`).
    fn write_value_operand(&mut self, d: DecodedWord, ctx: &Context) -> Result<u32, EmulatorError> {
        match d.mode {
            AddressingMode::Register => Ok(self.reg(d.dest)),
            AddressingMode::Immediate => {
                let value = read_u32(ctx.memory, self.ip as usize, ctx.memory_size)?;
                self.consume_trailing_word();
                Ok(value)
            }
            other => Err(EmulatorError::InstructionFault {
                address: self.ip,
                reason: format!("unsupported addressing mode {:?} for write", other),
            }),
        }
    }

    /// `push`/`clrset`'s value operand: the source register's value when
    /// the register index rides in the destination field, or a trailing
    /// immediate word.
    fn push_pop_value_operand(&mut self, d: DecodedWord, ctx: &Context) -> Result<u32, EmulatorError> {
        match d.mode {
            AddressingMode::Register => Ok(self.reg(d.dest)),
            AddressingMode::Immediate => {
                let value = read_u32(ctx.memory, self.ip as usize, ctx.memory_size)?;
                self.consume_trailing_word();
                Ok(value)
            }
            other => Err(EmulatorError::InstructionFault {
                address: self.ip,
                reason: format!("unsupported addressing mode {:?} for push", other),
            }),
        }
    }

    fn shift_amount(&mut self, d: DecodedWord, ctx: &Context) -> Result<u32, EmulatorError> {
        match d.mode {
            AddressingMode::Register => Ok(self.reg(d.uimm16() as u8)),
            AddressingMode::Immediate => Ok((d.uimm16() & 0x3f) as u32),
            other => Err(EmulatorError::InstructionFault {
                address: self.ip,
                reason: format!("unsupported addressing mode {:?} for shift", other),
            }),
        }
    }

    /// Paints the framebuffer device's pixel region, if one was negotiated
    /// during boot. `clrset` decomposes `x`'s low 24 bits into an R,G,B
    /// triplet repeated across every pixel; `clrsetv` instead repeats `x`'s
    /// low byte raw, useful for fast test patterns.
    fn clrset(&mut self, mnemonic: &str, d: DecodedWord, ctx: &Context) -> Result<(), EmulatorError> {
        let value = self.push_pop_value_operand(d, ctx)?;
        let Some((base, width, height)) = ctx.framebuffer else { return Ok(()) };
        let pixels = width as usize * height as usize;
        let start = base + 4;
        let mut memory = ctx.memory.lock().unwrap();
        if start + pixels * 3 > memory.len() {
            return Err(EmulatorError::MemoryOutOfBounds { address: start as u32, memory_size: ctx.memory_size });
        }
        if mnemonic == "clrset" {
            let rgb = [(value >> 16) as u8, (value >> 8) as u8, value as u8];
            for i in 0..pixels {
                memory[start + i * 3..start + i * 3 + 3].copy_from_slice(&rgb);
            }
        } else {
            let byte = value as u8;
            memory[start..start + pixels * 3].fill(byte);
        }
        Ok(())
    }
}

fn width_of(mnemonic: &str) -> usize {
    match mnemonic {
        "load" | "str" => 4,
        "loadw" | "strw" => 2,
        "loadb" | "strb" => 1,
        _ => unreachable!(),
    }
}

/// `memcpy`/`memset`'s packed `(src1, src2)` operand fields.
fn src_from_packed(d: DecodedWord) -> (u8, u8) {
    d.src_registers()
}

fn bounds_check(addr: usize, len: usize, memory_size: usize) -> Result<(), EmulatorError> {
    if addr + len > memory_size {
        Err(EmulatorError::MemoryOutOfBounds { address: addr as u32, memory_size })
    } else {
        Ok(())
    }
}

fn read_u32(memory: &SharedMemory, addr: usize, memory_size: usize) -> Result<u32, EmulatorError> {
    bounds_check(addr, 4, memory_size)?;
    let mem = memory.lock().unwrap();
    Ok(u32::from_be_bytes([mem[addr], mem[addr + 1], mem[addr + 2], mem[addr + 3]]))
}

fn read_u16(memory: &SharedMemory, addr: usize, memory_size: usize) -> Result<u16, EmulatorError> {
    bounds_check(addr, 2, memory_size)?;
    let mem = memory.lock().unwrap();
    Ok(u16::from_be_bytes([mem[addr], mem[addr + 1]]))
}

fn read_width(memory: &SharedMemory, addr: usize, width: usize, memory_size: usize) -> Result<u32, EmulatorError> {
    bounds_check(addr, width, memory_size)?;
    let mem = memory.lock().unwrap();
    Ok(match width {
        4 => u32::from_be_bytes([mem[addr], mem[addr + 1], mem[addr + 2], mem[addr + 3]]),
        2 => u16::from_be_bytes([mem[addr], mem[addr + 1]]) as u32,
        _ => mem[addr] as u32,
    })
}

fn write_u32(memory: &SharedMemory, addr: usize, value: u32, memory_size: usize) -> Result<(), EmulatorError> {
    bounds_check(addr, 4, memory_size)?;
    let mut mem = memory.lock().unwrap();
    mem[addr..addr + 4].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

fn write_u16(memory: &SharedMemory, addr: usize, value: u16, memory_size: usize) -> Result<(), EmulatorError> {
    bounds_check(addr, 2, memory_size)?;
    let mut mem = memory.lock().unwrap();
    mem[addr..addr + 2].copy_from_slice(&value.to_be_bytes());
    Ok(())
}

fn write_width(memory: &SharedMemory, addr: usize, value: u32, width: usize, memory_size: usize) -> Result<(), EmulatorError> {
    bounds_check(addr, width, memory_size)?;
    let mut mem = memory.lock().unwrap();
    match width {
        4 => mem[addr..addr + 4].copy_from_slice(&value.to_be_bytes()),
        2 => mem[addr..addr + 2].copy_from_slice(&(value as u16).to_be_bytes()),
        _ => mem[addr] = value as u8,
    }
    Ok(())
}

fn copy_bytes(memory: &SharedMemory, src: usize, dst: usize, len: usize, memory_size: usize) -> Result<(), EmulatorError> {
    bounds_check(src, len, memory_size)?;
    bounds_check(dst, len, memory_size)?;
    let mut mem = memory.lock().unwrap();
    let data: Vec<u8> = mem[src..src + len].to_vec();
    mem[dst..dst + len].copy_from_slice(&data);
    Ok(())
}

fn fill_bytes(memory: &SharedMemory, dst: usize, value: u8, len: usize, memory_size: usize) -> Result<(), EmulatorError> {
    bounds_check(dst, len, memory_size)?;
    let mut mem = memory.lock().unwrap();
    mem[dst..dst + len].fill(value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::PortBus;
    use std::sync::Mutex;

    fn harness(memory_size: usize) -> (SharedMemory, Arc<InterruptLines>, PortBus) {
        (Arc::new(Mutex::new(vec![0u8; memory_size])), InterruptLines::new(), PortBus::empty())
    }

    fn run(program: &[u8], memory_size: usize, entry: u32) -> (Cpu, SharedMemory) {
        let (memory, lines, ports) = harness(memory_size);
        {
            let mut mem = memory.lock().unwrap();
            mem[entry as usize..entry as usize + program.len()].copy_from_slice(program);
        }
        let mut cpu = Cpu::new();
        cpu.start(Arc::clone(&memory), lines, None, ports, memory_size, entry).unwrap();
        (cpu, memory)
    }

    fn word(opcode: &str, mode: AddressingMode, dest: u8, operand: u16) -> [u8; 4] {
        DecodedWord::encode(isa::opcode_of(opcode).unwrap(), mode, dest, operand).to_be_bytes()
    }

    #[test]
    fn call_ret_round_trip() {
        // call +8 (to f at entry+8); halt; f: mov r1, imm(0x2A); ret
        let mut program = Vec::new();
        program.extend(word("call", AddressingMode::Relative, 0, 8u16));
        program.extend(word("halt", AddressingMode::Absolute, 0, 0));
        program.extend(word("mov", AddressingMode::Immediate, Register::R1.index(), 0));
        program.extend(0x2Au32.to_be_bytes());
        program.extend(word("ret", AddressingMode::Absolute, 0, 0));

        let (cpu, _) = run(&program, 4096, 0);
        assert_eq!(cpu.reg(Register::R1.index()), 0x2A);
        assert_eq!(cpu.sp, (4096u32 - 1) & !3);
    }

    #[test]
    fn arithmetic_and_branch() {
        // mov r1,#3; mov r2,#5; cmp r1,r2; jge skip(+8); mov r3,#1; skip: halt
        let mut program = Vec::new();
        program.extend(word("mov", AddressingMode::Immediate, Register::R1.index(), 0));
        program.extend(3u32.to_be_bytes());
        program.extend(word("mov", AddressingMode::Immediate, Register::R2.index(), 0));
        program.extend(5u32.to_be_bytes());
        program.extend(word("cmp", AddressingMode::Register, Register::R1.index(), Register::R2.index() as u16));
        let jge_offset = 8i16; // skip over the `mov r3,#1` (8 bytes)
        program.extend(word("jge", AddressingMode::Relative, 0, jge_offset as u16));
        program.extend(word("mov", AddressingMode::Immediate, Register::R3.index(), 0));
        program.extend(1u32.to_be_bytes());
        program.extend(word("halt", AddressingMode::Absolute, 0, 0));

        let (cpu, _) = run(&program, 4096, 0);
        assert_eq!(cpu.reg(Register::R3.index()), 1); // 3 - 5 < 0, jge not taken
    }

    #[test]
    fn interrupt_save_restore_round_trips_registers() {
        // Each general-purpose register gets a distinct value before `sti`
        // so a transposed save/restore (e.g. r1 and r7 swapped) shows up as
        // a mismatch rather than silently passing.
        let (memory, lines, ports) = harness(4096);
        let vector_base = 16usize;
        write_u32(&memory, vector_base, 200, 4096).unwrap(); // handler at 200
        let ic = Arc::new(InterruptController::new(vector_base, Arc::clone(&lines)));

        let mut program = Vec::new();
        let values: [(u8, u16); 7] = [
            (Register::R1.index(), 0x11),
            (Register::R2.index(), 0x22),
            (Register::R3.index(), 0x33),
            (Register::R4.index(), 0x44),
            (Register::R5.index(), 0x55),
            (Register::R6.index(), 0x66),
            (Register::R7.index(), 0x77),
        ];
        for (reg, v) in values {
            program.extend(word("mov", AddressingMode::Immediate, reg, 0));
            program.extend((v as u32).to_be_bytes());
        }
        program.extend(word("sti", AddressingMode::Absolute, 0, 0));
        program.extend(word("halt", AddressingMode::Absolute, 0, 0));

        {
            let mut mem = memory.lock().unwrap();
            mem[0..program.len()].copy_from_slice(&program);
            // handler at 200: rti with no register modifications, so any
            // mismatch on return is purely a save/restore bug.
            let rti = word("rti", AddressingMode::Absolute, 0, 0);
            mem[200..204].copy_from_slice(&rti);
        }
        lines.raise(0);
        let mut cpu = Cpu::new();
        cpu.start(Arc::clone(&memory), lines, Some(ic), ports, 4096, 0).unwrap();
        for (reg, v) in values {
            assert_eq!(cpu.reg(reg), v as u32, "register {} did not round-trip", reg);
        }
        assert_eq!(cpu.sp, (4096u32 - 1) & !3);
    }
}
