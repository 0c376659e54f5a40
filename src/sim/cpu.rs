//! The per-instruction state transition of the virtual CPU.
//!
//! The key function here is [`execute`], which maps a [`CpuState`] and one
//! [`Instruction`] to the successor state. It is pure: it never mutates its
//! inputs, and any failure (bad operand, out-of-bounds memory, division by
//! zero, unknown label, stack overflow) is folded into the returned state as
//! `halted = true` plus an error message, with everything else preserved
//! from before the failing instruction.

use crate::asm::{Instruction, LabelMap, MemRef, Opcode, Operand};

use super::mem::{vector_addr, Flag, Flags, Mem, Reg, RegFile};
use super::{CoreConfig, RuntimeErr};

/// The complete machine state.
#[derive(Debug, PartialEq, Eq, Clone, serde::Serialize)]
pub struct CpuState {
    /// The register file (eight general registers, `IP`, `FLAGS`).
    pub regs: RegFile,
    /// The flat RAM.
    pub mem: Mem,
    /// Whether the machine is halted. Once set, the state is frozen.
    pub halted: bool,
    /// The runtime failure that halted the machine, if any.
    pub error: Option<String>,
}
impl CpuState {
    /// Creates the reset state for the given configuration:
    /// `SP` at the stack top, everything else zero, RAM per the fill
    /// strategy.
    pub fn new(config: &CoreConfig) -> Self {
        CpuState {
            regs: RegFile::new(config.stack_top),
            mem: Mem::new(config.memory_size_bytes, &mut config.fill.filler()),
            halted: false,
            error: None,
        }
    }
}

/// Executes one instruction, returning the successor state.
///
/// A halted state is frozen: executing anything on it returns it unchanged.
///
/// # Example
/// ```
/// use micro86::asm::assemble;
/// use micro86::sim::cpu::{execute, CpuState};
/// use micro86::sim::mem::Reg;
/// use micro86::sim::CoreConfig;
///
/// let program = assemble("MOV AX, 7\nHLT");
/// let state = CpuState::new(&CoreConfig::default());
/// let state = execute(&state, &program.instructions[0], &program.labels);
/// assert_eq!(state.regs[Reg::Ax], 7);
/// assert_eq!(state.regs.ip, 1);
/// ```
pub fn execute(state: &CpuState, instr: &Instruction, labels: &LabelMap) -> CpuState {
    if state.halted {
        return state.clone();
    }

    let mut next = state.clone();
    match exec_inner(&mut next, instr, labels) {
        Ok(()) => next,
        Err(e) => {
            let mut failed = state.clone();
            failed.halted = true;
            failed.error = Some(e.to_string());
            failed
        }
    }
}

fn exec_inner(state: &mut CpuState, instr: &Instruction, labels: &LabelMap) -> Result<(), RuntimeErr> {
    use Opcode::*;

    let opcode = instr.opcode;
    match opcode {
        MOV => {
            let value = value_of(state, operand(instr, 1)?, labels)?;
            write_operand(state, operand(instr, 0)?, value)?;
        }
        ADD | ADC => {
            let dst = dst_reg(instr)?;
            let a = state.regs[dst];
            let mut b = value_of(state, operand(instr, 1)?, labels)?;
            if opcode == ADC && state.regs.flags.get(Flag::Cf) {
                // Carry-in is folded into b before flag computation, so AF,
                // OF, and CF are calculated against b+1. This deviates from
                // canonical 8086 ADC and matches this VM's definition.
                b = b.wrapping_add(1);
            }
            let raw = u32::from(a) + u32::from(b);
            flags_add(&mut state.regs.flags, a, b, raw);
            state.regs[dst] = raw as u16;
        }
        SUB | SBB | CMP => {
            let dst = dst_reg(instr)?;
            let a = state.regs[dst];
            let mut b = value_of(state, operand(instr, 1)?, labels)?;
            if opcode == SBB && state.regs.flags.get(Flag::Cf) {
                // Same carry fold as ADC; see above.
                b = b.wrapping_add(1);
            }
            let r = flags_sub(&mut state.regs.flags, a, b);
            if opcode != CMP {
                state.regs[dst] = r;
            }
        }
        AND | OR | XOR => {
            let dst = dst_reg(instr)?;
            let a = state.regs[dst];
            let b = value_of(state, operand(instr, 1)?, labels)?;
            let r = match opcode {
                AND => a & b,
                OR  => a | b,
                _   => a ^ b,
            };
            flags_logical(&mut state.regs.flags, r);
            state.regs[dst] = r;
        }
        NOT => {
            let dst = dst_reg(instr)?;
            let r = !state.regs[dst];
            flags_logical(&mut state.regs.flags, r);
            state.regs[dst] = r;
        }
        NEG => {
            let dst = dst_reg(instr)?;
            let v = state.regs[dst];
            let r = flags_sub(&mut state.regs.flags, 0, v);
            state.regs[dst] = r;
        }
        INC | DEC => {
            let dst = dst_reg(instr)?;
            let a = state.regs[dst];
            // Computed as add/sub of 1, but CF is preserved.
            let saved_cf = state.regs.flags.get(Flag::Cf);
            let r = match opcode {
                INC => {
                    let raw = u32::from(a) + 1;
                    flags_add(&mut state.regs.flags, a, 1, raw);
                    raw as u16
                }
                _ => flags_sub(&mut state.regs.flags, a, 1),
            };
            state.regs.flags.set(Flag::Cf, saved_cf);
            state.regs[dst] = r;
        }
        MUL => {
            let src = value_of(state, operand(instr, 0)?, labels)?;
            let product = u32::from(state.regs[Reg::Ax]) * u32::from(src);
            state.regs[Reg::Ax] = product as u16;
            state.regs[Reg::Dx] = (product >> 16) as u16;
            let wide = state.regs[Reg::Dx] != 0;
            state.regs.flags.set(Flag::Cf, wide);
            state.regs.flags.set(Flag::Of, wide);
        }
        DIV => {
            let divisor = value_of(state, operand(instr, 0)?, labels)?;
            if divisor == 0 {
                return Err(RuntimeErr::DivideByZero);
            }
            let dividend = (u32::from(state.regs[Reg::Dx]) << 16) | u32::from(state.regs[Reg::Ax]);
            let quotient = dividend / u32::from(divisor);
            if quotient > 0xFFFF {
                return Err(RuntimeErr::DivideOverflow);
            }
            state.regs[Reg::Ax] = quotient as u16;
            state.regs[Reg::Dx] = (dividend % u32::from(divisor)) as u16;
        }
        MOD => {
            let divisor = value_of(state, operand(instr, 0)?, labels)?;
            if divisor == 0 {
                return Err(RuntimeErr::DivideByZero);
            }
            state.regs[Reg::Ax] %= divisor;
        }
        SHL | SAL | SHR | SAR => {
            let dst = dst_reg(instr)?;
            let count = match instr.operands.get(1) {
                Some(op) => value_of(state, op, labels)?,
                None => 1,
            } & 0x1F;
            let v = state.regs[dst];
            state.regs[dst] = shift(&mut state.regs.flags, opcode, v, count);
        }
        PUSH => {
            let value = value_of(state, operand(instr, 0)?, labels)?;
            push(state, value)?;
        }
        POP => {
            let value = pop(state)?;
            write_operand(state, operand(instr, 0)?, value)?;
        }
        JMP => {
            state.regs.ip = jump_target(operand(instr, 0)?, labels, true)?;
            return Ok(());
        }
        CALL => {
            let target = jump_target(operand(instr, 0)?, labels, false)?;
            push(state, state.regs.ip.wrapping_add(1))?;
            state.regs.ip = target;
            return Ok(());
        }
        RET => {
            state.regs.ip = pop(state)?;
            return Ok(());
        }
        INT => {
            let vector = match operand(instr, 0)? {
                Operand::Imm(v) => *v,
                Operand::Label(name) => *labels.get(name)
                    .ok_or_else(|| RuntimeErr::UnknownLabel(name.clone()))?,
                op => return Err(RuntimeErr::BadOperand(op.to_string())),
            };
            let handler = state.mem.read_word(vector_addr(vector))?;
            push(state, state.regs.flags.0)?;
            push(state, state.regs.ip.wrapping_add(1))?;
            state.regs.ip = handler;
            return Ok(());
        }
        IRET => {
            state.regs.ip = pop(state)?;
            state.regs.flags = Flags(pop(state)?);
            return Ok(());
        }
        IN => {
            let dst = dst_reg(instr)?;
            let port = imm_of(operand(instr, 1)?)?;
            state.regs[dst] = state.mem.read_port(port)?;
        }
        OUTP => {
            let port = imm_of(operand(instr, 0)?)?;
            let src = match operand(instr, 1)? {
                Operand::Reg(r) => state.regs[*r],
                op => return Err(RuntimeErr::BadOperand(op.to_string())),
            };
            state.mem.write_port(port, src)?;
        }
        OUT | OUTC => {
            // Emission is observed by the stepper before execution;
            // the transition itself only advances IP.
            dst_reg(instr)?;
        }
        HLT => {
            state.halted = true;
            return Ok(());
        }
        NOP => {}
        CLC => state.regs.flags.set(Flag::Cf, false),
        STC => state.regs.flags.set(Flag::Cf, true),
        CMC => {
            let cf = state.regs.flags.get(Flag::Cf);
            state.regs.flags.set(Flag::Cf, !cf);
        }
        op if op.is_cond_jump() => {
            match condition(op, state.regs.flags) {
                true  => state.regs.ip = jump_target(operand(instr, 0)?, labels, false)?,
                false => state.regs.ip = state.regs.ip.wrapping_add(1),
            }
            return Ok(());
        }
        op => unreachable!("opcode {op} not covered by executor"),
    }

    state.regs.ip = state.regs.ip.wrapping_add(1);
    Ok(())
}

fn operand<'i>(instr: &'i Instruction, index: usize) -> Result<&'i Operand, RuntimeErr> {
    instr.operands.get(index)
        .ok_or_else(|| RuntimeErr::BadOperand(format!("{} is missing operand {}", instr.opcode, index + 1)))
}

fn dst_reg(instr: &Instruction) -> Result<Reg, RuntimeErr> {
    match operand(instr, 0)? {
        Operand::Reg(r) => Ok(*r),
        op => Err(RuntimeErr::BadOperand(op.to_string())),
    }
}

fn imm_of(op: &Operand) -> Result<u16, RuntimeErr> {
    match op {
        Operand::Imm(i) => Ok(*i),
        op => Err(RuntimeErr::BadOperand(op.to_string())),
    }
}

/// Computes a memory operand's effective address against the current state.
pub fn effective_addr(regs: &RegFile, mem_ref: &MemRef) -> u16 {
    let base = mem_ref.base.map_or(0, |r| regs[r]);
    base.wrapping_add(mem_ref.disp)
}

/// Resolves an operand to its runtime value.
///
/// A label bareword resolves to its instruction index (this is how code
/// takes the address of a handler, e.g. `MOV AX, ISR`), falling back to
/// an immediate spelling before failing.
pub fn value_of(state: &CpuState, op: &Operand, labels: &LabelMap) -> Result<u16, RuntimeErr> {
    match op {
        Operand::Reg(r) => Ok(state.regs[*r]),
        Operand::Imm(i) => Ok(*i),
        Operand::Mem(m) => state.mem.read_word(effective_addr(&state.regs, m)),
        Operand::Label(name) => match labels.get(name) {
            Some(&index) => Ok(index),
            None => crate::asm::parse_imm(name)
                .ok_or_else(|| RuntimeErr::UnknownLabel(name.clone())),
        },
    }
}

fn write_operand(state: &mut CpuState, op: &Operand, value: u16) -> Result<(), RuntimeErr> {
    match op {
        Operand::Reg(r) => {
            state.regs[*r] = value;
            Ok(())
        }
        Operand::Mem(m) => {
            let addr = effective_addr(&state.regs, m);
            state.mem.write_word(addr, value)
        }
        op => Err(RuntimeErr::BadOperand(op.to_string())),
    }
}

fn push(state: &mut CpuState, value: u16) -> Result<(), RuntimeErr> {
    let sp = state.regs[Reg::Sp];
    if sp < 2 {
        return Err(RuntimeErr::StackOverflow);
    }
    let new_sp = sp - 2;
    state.mem.write_word(new_sp, value)?;
    state.regs[Reg::Sp] = new_sp;
    Ok(())
}

fn pop(state: &mut CpuState) -> Result<u16, RuntimeErr> {
    let sp = state.regs[Reg::Sp];
    let value = state.mem.read_word(sp)?;
    state.regs[Reg::Sp] = sp.wrapping_add(2);
    Ok(value)
}

/// Resolves a jump target operand.
///
/// Immediates are instruction indices directly. Labels resolve through the
/// label map; for `JMP` only, an unknown label is re-tried as an immediate
/// spelling (`0FFh`-style barewords) before failing.
fn jump_target(op: &Operand, labels: &LabelMap, imm_fallback: bool) -> Result<u16, RuntimeErr> {
    match op {
        Operand::Imm(i) => Ok(*i),
        Operand::Label(name) => match labels.get(name) {
            Some(&index) => Ok(index),
            None if imm_fallback => crate::asm::parse_imm(name)
                .ok_or_else(|| RuntimeErr::UnknownLabel(name.clone())),
            None => Err(RuntimeErr::UnknownLabel(name.clone())),
        },
        op => Err(RuntimeErr::BadOperand(op.to_string())),
    }
}

/// Evaluates a conditional jump's flag condition.
pub fn condition(op: Opcode, f: Flags) -> bool {
    use Opcode::*;

    let cf = f.get(Flag::Cf);
    let zf = f.get(Flag::Zf);
    let sf = f.get(Flag::Sf);
    let of = f.get(Flag::Of);
    match op {
        JE | JZ          => zf,
        JNE | JNZ        => !zf,
        JL | JNGE        => sf != of,
        JG | JNLE        => !zf && sf == of,
        JLE | JNG        => zf || sf != of,
        JGE | JNL        => sf == of,
        JC | JB | JNAE   => cf,
        JNC | JAE | JNB  => !cf,
        JS               => sf,
        JNS              => !sf,
        JO               => of,
        JNO              => !of,
        op => unreachable!("{op} is not a conditional jump"),
    }
}

/// Sets ZF, SF, and PF from a 16-bit result.
fn base_flags(flags: &mut Flags, r: u16) {
    flags.set(Flag::Zf, r == 0);
    flags.set(Flag::Sf, r & 0x8000 != 0);
    flags.set(Flag::Pf, (r as u8).count_ones() % 2 == 0);
}

fn sign(v: u16) -> bool {
    v & 0x8000 != 0
}

/// Full flag update for an addition with raw (unmasked) result `raw`.
fn flags_add(flags: &mut Flags, a: u16, b: u16, raw: u32) {
    let r = raw as u16;
    base_flags(flags, r);
    flags.set(Flag::Cf, raw > 0xFFFF);
    flags.set(Flag::Af, (a ^ b ^ r) & 0x10 != 0);
    flags.set(Flag::Of, sign(a) == sign(b) && sign(r) != sign(a));
}

/// Full flag update for a subtraction `a - b`; returns the masked result.
fn flags_sub(flags: &mut Flags, a: u16, b: u16) -> u16 {
    let r = a.wrapping_sub(b);
    base_flags(flags, r);
    flags.set(Flag::Cf, a < b);
    flags.set(Flag::Af, (a ^ b ^ r) & 0x10 != 0);
    flags.set(Flag::Of, sign(a) != sign(b) && sign(r) != sign(a));
    r
}

/// Flag update for a logical result: base flags, CF and OF cleared.
fn flags_logical(flags: &mut Flags, r: u16) {
    base_flags(flags, r);
    flags.set(Flag::Cf, false);
    flags.set(Flag::Of, false);
}

/// Applies a shift, updating flags per the shift rules.
///
/// The count is already masked to 5 bits. A zero count changes nothing.
/// `CF` receives the last bit shifted out; `OF` is only defined for a
/// count of one and is preserved otherwise.
fn shift(flags: &mut Flags, opcode: Opcode, v: u16, count: u16) -> u16 {
    if count == 0 {
        return v;
    }
    let c = u32::from(count);
    let msb_before = sign(v);

    let (result, carry_out) = match opcode {
        Opcode::SHL | Opcode::SAL => {
            let wide = u64::from(v) << c;
            (wide as u16, wide & (1 << 16) != 0)
        }
        Opcode::SHR => {
            let result = if c >= 16 { 0 } else { v >> c };
            let carry = if c > 16 { false } else { (v >> (c - 1)) & 1 != 0 };
            (result, carry)
        }
        _ => {
            // SAR: the sign bit backfills, so counts past 15 saturate.
            let wide = i32::from(v as i16);
            let result = (wide >> c.min(15)) as u16;
            let carry = (wide >> (c - 1).min(15)) & 1 != 0;
            (result, carry)
        }
    };

    base_flags(flags, result);
    flags.set(Flag::Cf, carry_out);
    if count == 1 {
        let of = match opcode {
            Opcode::SHL | Opcode::SAL => msb_before != sign(result),
            Opcode::SHR => msb_before,
            _ => false,
        };
        flags.set(Flag::Of, of);
    }
    result
}
