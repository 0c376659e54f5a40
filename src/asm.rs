//! Assembling assembly source text into runnable programs.
//!
//! This module is used to convert assembly text (written by hand or emitted
//! by [`crate::codegen`]) into a [`Program`] that can be executed by the
//! simulator.
//!
//! The assembler module notably consists of:
//! - [`assemble`]: The main function, which runs both assembler passes.
//! - [`Program`]: The output: instructions, the label map, and diagnostics.
//! - [`Opcode`] and [`Operand`]: The pre-parsed instruction model.
//! - [`SourceMap`]: The mapping between source lines and instruction ranges.

use std::collections::hash_map::Entry;
use std::collections::HashMap;

use crate::err::Diagnostic;
use crate::sim::mem::Reg;

macro_rules! opcode_enum {
    ($($op:ident),+ $(,)?) => {
        /// An instruction mnemonic of the VM ISA.
        ///
        /// Mnemonics are case-insensitive in source.
        #[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
        pub enum Opcode {
            $(
                #[allow(missing_docs)]
                $op
            ),+
        }

        impl Opcode {
            /// Parses a mnemonic, case-insensitively.
            /// Returns `None` for anything outside the ISA.
            pub fn parse(s: &str) -> Option<Self> {
                match &*s.to_uppercase() {
                    $(stringify!($op) => Some(Self::$op)),+,
                    _ => None
                }
            }
        }

        impl std::fmt::Display for Opcode {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                match self {
                    $(Self::$op => f.write_str(stringify!($op))),+
                }
            }
        }
    };
}
opcode_enum! {
    MOV, ADD, ADC, SUB, SBB, CMP, AND, OR, XOR,
    MUL, DIV, MOD, NEG, NOT, INC, DEC,
    SHL, SAL, SHR, SAR,
    PUSH, POP,
    JMP, JE, JZ, JNE, JNZ, JL, JNGE, JG, JNLE, JLE, JNG, JGE, JNL,
    JC, JB, JNAE, JNC, JAE, JNB, JS, JNS, JO, JNO,
    CALL, RET, INT, IRET,
    IN, OUT, OUTC, OUTP,
    HLT, NOP, CLC, STC, CMC,
}

impl Opcode {
    /// Whether this is a conditional jump.
    pub fn is_cond_jump(self) -> bool {
        use Opcode::*;
        matches!(self,
            JE | JZ | JNE | JNZ | JL | JNGE | JG | JNLE | JLE | JNG
            | JGE | JNL | JC | JB | JNAE | JNC | JAE | JNB | JS | JNS | JO | JNO)
    }

    /// Whether this is any jump (conditional or not).
    pub fn is_jump(self) -> bool {
        self == Opcode::JMP || self.is_cond_jump()
    }

    /// Estimated cycle cost of this opcode.
    ///
    /// The numbers are a teaching-scale approximation, not real 8086 timing.
    pub fn cycles(self) -> u32 {
        use Opcode::*;
        match self {
            MOV => 2,
            ADD | ADC | SUB | SBB | CMP => 3,
            MUL => 12,
            DIV => 18,
            MOD => 10,
            NEG => 3,
            INC | DEC => 2,
            AND | OR | XOR | NOT => 2,
            SHL | SAL | SHR | SAR => 4,
            PUSH => 4,
            POP => 5,
            CALL => 7,
            RET => 8,
            INT => 14,
            IRET => 16,
            IN | OUTP => 8,
            OUT | OUTC => 5,
            CLC | STC | CMC => 2,
            NOP => 1,
            HLT => 1,
            op if op.is_jump() => 4,
            _ => 3,
        }
    }
}

/// A memory operand: `[base + disp]`, `[base - disp]`, `[base]`, or `[disp]`.
///
/// The effective address is `(base + disp) & 0xFFFF`, where a missing base
/// contributes zero. Negative displacements are stored pre-wrapped.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy)]
pub struct MemRef {
    /// Base register, if any.
    pub base: Option<Reg>,
    /// Displacement, wrapped to a word.
    pub disp: u16,
}
impl std::fmt::Display for MemRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.base {
            Some(base) if self.disp == 0 => write!(f, "[{base}]"),
            Some(base) if self.disp >= 0x8000 => write!(f, "[{base} - {}]", self.disp.wrapping_neg()),
            Some(base) => write!(f, "[{base} + {}]", self.disp),
            None => write!(f, "[0x{:04X}]", self.disp),
        }
    }
}

/// A pre-parsed instruction operand.
///
/// Operands are classified once at assembly time so the hot execution path
/// never re-parses strings. The raw operand text is kept on the
/// [`Instruction`] for display.
#[derive(Debug, PartialEq, Eq, Hash, Clone)]
pub enum Operand {
    /// A register name.
    Reg(Reg),
    /// An immediate value, masked to a word.
    Imm(u16),
    /// A memory reference.
    Mem(MemRef),
    /// A bareword, resolved against the label map at execution time.
    Label(String),
}
impl Operand {
    /// Classifies one operand text.
    ///
    /// Order matters: registers win over labels, memory forms win over
    /// immediates, and anything identifier-shaped falls through to a label.
    pub fn parse(text: &str) -> Result<Operand, BadOperand> {
        let text = text.trim();
        if text.is_empty() {
            return Err(BadOperand::Empty);
        }
        if let Some(reg) = Reg::parse(text) {
            return Ok(Operand::Reg(reg));
        }
        if let Some(inner) = text.strip_prefix('[') {
            let inner = inner.strip_suffix(']').ok_or_else(|| BadOperand::Malformed(text.to_string()))?;
            return parse_mem_ref(inner)
                .map(Operand::Mem)
                .ok_or_else(|| BadOperand::Malformed(text.to_string()));
        }
        if let Some(value) = parse_imm(text) {
            return Ok(Operand::Imm(value));
        }
        if is_label_name(text) {
            return Ok(Operand::Label(text.to_uppercase()));
        }
        Err(BadOperand::Malformed(text.to_string()))
    }

    fn kind(&self) -> OperandKind {
        match self {
            Operand::Reg(_)   => OperandKind::Reg,
            Operand::Imm(_)   => OperandKind::Imm,
            Operand::Mem(_)   => OperandKind::Mem,
            Operand::Label(_) => OperandKind::Label,
        }
    }
}
impl std::fmt::Display for Operand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Operand::Reg(r)   => r.fmt(f),
            Operand::Imm(i)   => i.fmt(f),
            Operand::Mem(m)   => m.fmt(f),
            Operand::Label(l) => f.write_str(l),
        }
    }
}

/// Why an operand failed to parse.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BadOperand {
    /// The operand text was empty (e.g., a trailing comma).
    Empty,
    /// The operand matched no legal form.
    Malformed(String),
}
impl std::fmt::Display for BadOperand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BadOperand::Empty        => f.write_str("empty operand"),
            BadOperand::Malformed(t) => write!(f, "malformed operand '{t}'"),
        }
    }
}
impl std::error::Error for BadOperand {}
impl crate::err::Error for BadOperand {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match self {
            BadOperand::Empty => Some("remove the extra comma".into()),
            BadOperand::Malformed(_) => {
                Some("operands are a register, an immediate, a [memory] reference, or a label".into())
            }
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
enum OperandKind {
    Reg,
    Imm,
    Mem,
    Label,
}
impl std::fmt::Display for OperandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperandKind::Reg   => f.write_str("register"),
            OperandKind::Imm   => f.write_str("immediate"),
            OperandKind::Mem   => f.write_str("memory reference"),
            OperandKind::Label => f.write_str("label"),
        }
    }
}

/// Parses an immediate literal: optional sign, then decimal, `0x…`, `…h`,
/// or `0b…`. The value is wrapped to a word.
pub fn parse_imm(text: &str) -> Option<u16> {
    let text = text.trim();
    let (neg, digits) = match text.strip_prefix('-') {
        Some(rest) => (true, rest.trim()),
        None => (false, text.strip_prefix('+').unwrap_or(text)),
    };
    if digits.is_empty() {
        return None;
    }

    let value = if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()?
    } else if let Some(bin) = digits.strip_prefix("0b").or_else(|| digits.strip_prefix("0B")) {
        i64::from_str_radix(bin, 2).ok()?
    } else if let Some(hex) = digits.strip_suffix(['h', 'H']) {
        // A bare "h" is not a number.
        if hex.is_empty() { return None; }
        i64::from_str_radix(hex, 16).ok()?
    } else {
        digits.parse::<i64>().ok()?
    };

    let signed = if neg { -value } else { value };
    Some(signed as u16)
}

/// Whether the text is a legal label name (`[A-Za-z_][A-Za-z0-9_]*`).
pub fn is_label_name(text: &str) -> bool {
    let mut chars = text.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Parses the inside of a `[...]` operand after whitespace removal.
///
/// Legal inner forms are `REG`, `REG±offset` (offset an immediate), or a
/// bare immediate. Nothing else.
fn parse_mem_ref(inner: &str) -> Option<MemRef> {
    let inner: String = inner.chars().filter(|c| !c.is_whitespace()).collect();
    if inner.is_empty() {
        return None;
    }

    if let Some(reg) = Reg::parse(&inner) {
        return Some(MemRef { base: Some(reg), disp: 0 });
    }

    // REG+off / REG-off: the sign cannot be the leading character
    // (that would make it part of a bare immediate).
    if let Some(split) = inner[1..].find(['+', '-']).map(|i| i + 1) {
        let (reg_text, rest) = inner.split_at(split);
        if let Some(reg) = Reg::parse(reg_text) {
            let disp = parse_imm(rest)?;
            return Some(MemRef { base: Some(reg), disp });
        }
        return None;
    }

    let disp = parse_imm(&inner)?;
    Some(MemRef { base: None, disp })
}

/// One assembled instruction.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Instruction {
    /// The mnemonic.
    pub opcode: Opcode,
    /// Pre-parsed operands, in source order.
    pub operands: Vec<Operand>,
    /// The raw operand texts, in source order.
    pub operand_text: Vec<String>,
    /// This instruction's index in the program.
    pub addr: u16,
    /// The source line, trimmed, comments stripped.
    pub raw: String,
}
impl std::fmt::Display for Instruction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

/// A mapping from (upper-cased) label names to instruction indices.
pub type LabelMap = HashMap<String, u16>;

/// The assembler's output.
///
/// Instructions and the label map are immutable after assembly. A program
/// holding any `error`-severity diagnostic must not be executed; the
/// pipeline discards it.
#[derive(Debug, Clone, Default)]
pub struct Program {
    /// The instruction sequence. `IP` indexes into this.
    pub instructions: Vec<Instruction>,
    /// Label name (upper-cased) to instruction index.
    pub labels: LabelMap,
    /// Ordered assembly diagnostics.
    pub diagnostics: Vec<Diagnostic>,
    /// Reserved for a future byte-level encoding stage. Always empty.
    pub bytecode: Vec<u8>,
}
impl Program {
    /// Whether any diagnostic is an error.
    pub fn has_errors(&self) -> bool {
        crate::err::any_errors(&self.diagnostics)
    }

    /// Builds the source line map from `_SRC_` labels.
    pub fn source_map(&self) -> SourceMap {
        SourceMap::from_labels(&self.labels, self.instructions.len() as u16)
    }
}

/// Assembles assembly text into a [`Program`].
///
/// Two passes: the first collects labels, the second parses and validates
/// instructions. Unknown opcodes still occupy an instruction slot so that
/// label indices collected in pass 1 stay valid. If the last emitted
/// instruction is not `HLT`, an implicit `HLT` is appended.
///
/// # Example
/// ```
/// use micro86::asm::assemble;
///
/// let program = assemble("
///     MOV AX, 5
/// LOOP:
///     DEC AX
///     JNZ LOOP
///     HLT
/// ");
/// assert!(!program.has_errors());
/// assert_eq!(program.labels.get("LOOP"), Some(&1));
/// assert_eq!(program.instructions.len(), 4);
/// ```
pub fn assemble(asm: &str) -> Program {
    let mut diagnostics = Vec::new();

    // Pass 1: collect labels.
    let mut labels: LabelMap = HashMap::new();
    let mut index: u16 = 0;
    for (lineno, line) in asm.lines().enumerate() {
        let lineno = lineno + 1;
        let Some(body) = instruction_body(line, &mut labels, index, lineno, &mut diagnostics) else {
            continue;
        };
        if !body.is_empty() {
            index = index.wrapping_add(1);
        }
    }

    // Pass 2: parse instructions.
    let mut instructions = Vec::with_capacity(usize::from(index));
    for (lineno, line) in asm.lines().enumerate() {
        let lineno = lineno + 1;
        let Some(body) = strip_labels(line) else { continue };
        if body.is_empty() {
            continue;
        }

        let addr = instructions.len() as u16;
        instructions.push(parse_instruction(body, addr, lineno, &mut diagnostics));
    }

    if instructions.is_empty() {
        diagnostics.push(Diagnostic::warning(1, "empty program; only the implicit HLT will run"));
    }
    if instructions.last().map_or(true, |i| i.opcode != Opcode::HLT) {
        let addr = instructions.len() as u16;
        instructions.push(Instruction {
            opcode: Opcode::HLT,
            operands: vec![],
            operand_text: vec![],
            addr,
            raw: "HLT".to_string(),
        });
    }

    Program { instructions, labels, diagnostics, bytecode: Vec::new() }
}

/// Strips the comment and any leading labels from a line, registering the
/// labels. Returns `None` for blank/comment-only lines and the remaining
/// instruction text otherwise (possibly empty, for label-only lines).
fn instruction_body<'l>(
    line: &'l str,
    labels: &mut LabelMap,
    index: u16,
    lineno: usize,
    diagnostics: &mut Vec<Diagnostic>,
) -> Option<&'l str> {
    let body = line.split(';').next().unwrap_or("").trim();
    if body.is_empty() {
        return None;
    }

    let mut rest = body;
    while let Some((head, tail)) = rest.split_once(':') {
        let name = head.trim();
        if !is_label_name(name) {
            break;
        }
        match labels.entry(name.to_uppercase()) {
            Entry::Occupied(_) => {
                diagnostics.push(Diagnostic::error(lineno, format!("duplicate label '{name}'")));
            }
            Entry::Vacant(e) => {
                e.insert(index);
            }
        }
        rest = tail.trim();
    }
    Some(rest)
}

/// Pass-2 twin of [`instruction_body`]: same stripping, no side effects.
fn strip_labels(line: &str) -> Option<&str> {
    let body = line.split(';').next().unwrap_or("").trim();
    if body.is_empty() {
        return None;
    }
    let mut rest = body;
    while let Some((head, tail)) = rest.split_once(':') {
        if !is_label_name(head.trim()) {
            break;
        }
        rest = tail.trim();
    }
    Some(rest)
}

/// Parses one instruction body (mnemonic plus operand list).
///
/// Unknown opcodes and operand violations produce `error` diagnostics but
/// still emit an instruction (as a `NOP` placeholder for unknown opcodes)
/// so the address space stays aligned with pass 1.
fn parse_instruction(
    body: &str,
    addr: u16,
    lineno: usize,
    diagnostics: &mut Vec<Diagnostic>,
) -> Instruction {
    let (mnemonic, operand_part) = match body.split_once(char::is_whitespace) {
        Some((m, rest)) => (m, rest.trim()),
        None => (body, ""),
    };

    let Some(opcode) = Opcode::parse(mnemonic) else {
        diagnostics.push(Diagnostic::error(lineno, format!("unknown opcode '{mnemonic}'")));
        return Instruction {
            opcode: Opcode::NOP,
            operands: vec![],
            operand_text: vec![],
            addr,
            raw: body.to_string(),
        };
    };

    let operand_text: Vec<String> = match operand_part.is_empty() {
        true => vec![],
        false => operand_part.split(',').map(|s| s.trim().to_string()).collect(),
    };

    let mut operands = Vec::with_capacity(operand_text.len());
    for text in &operand_text {
        match Operand::parse(text) {
            Ok(op) => operands.push(op),
            Err(e) => {
                diagnostics.push(Diagnostic::error(lineno, format!("{opcode}: {e}")));
            }
        }
    }

    if operands.len() == operand_text.len() {
        if let Err(message) = validate_operands(opcode, &operands) {
            diagnostics.push(Diagnostic::error(lineno, format!("{opcode}: {message}")));
        }
    }

    Instruction { opcode, operands, operand_text, addr, raw: body.to_string() }
}

/// Per-opcode operand validation.
fn validate_operands(opcode: Opcode, operands: &[Operand]) -> Result<(), String> {
    use Opcode::*;
    use OperandKind as K;

    fn arity(expected: usize, operands: &[Operand]) -> Result<(), String> {
        match operands.len() == expected {
            true  => Ok(()),
            false => Err(format!("expected {expected} operand(s), found {}", operands.len())),
        }
    }
    fn kind_in(which: &str, op: &Operand, allowed: &[OperandKind]) -> Result<(), String> {
        match allowed.contains(&op.kind()) {
            true  => Ok(()),
            false => Err(format!("{which} cannot be a {}", op.kind())),
        }
    }

    match opcode {
        // A label bareword is legal wherever an immediate is: it stands
        // for its instruction index (`MOV AX, ISR` takes a handler's
        // address).
        MOV => {
            arity(2, operands)?;
            kind_in("destination", &operands[0], &[K::Reg, K::Mem])?;
            kind_in("source", &operands[1], &[K::Reg, K::Mem, K::Imm, K::Label])?;
            match (&operands[0], &operands[1]) {
                (Operand::Mem(_), Operand::Mem(_)) => Err("memory-to-memory is not allowed".to_string()),
                _ => Ok(()),
            }
        }
        ADD | ADC | SUB | SBB | CMP | AND | OR | XOR => {
            arity(2, operands)?;
            kind_in("destination", &operands[0], &[K::Reg])?;
            kind_in("source", &operands[1], &[K::Reg, K::Mem, K::Imm, K::Label])
        }
        MUL | DIV | MOD => {
            arity(1, operands)?;
            kind_in("operand", &operands[0], &[K::Reg, K::Mem, K::Imm, K::Label])
        }
        NEG | NOT | INC | DEC | OUT | OUTC => {
            arity(1, operands)?;
            kind_in("operand", &operands[0], &[K::Reg])
        }
        SHL | SAL | SHR | SAR => {
            if operands.is_empty() || operands.len() > 2 {
                return Err(format!("expected 1 or 2 operands, found {}", operands.len()));
            }
            kind_in("destination", &operands[0], &[K::Reg])?;
            match operands.get(1) {
                Some(count) => kind_in("shift count", count, &[K::Reg, K::Imm]),
                None => Ok(()),
            }
        }
        PUSH | POP => {
            arity(1, operands)?;
            kind_in("operand", &operands[0], &[K::Reg, K::Mem])
        }
        JMP | CALL => {
            arity(1, operands)?;
            kind_in("target", &operands[0], &[K::Label, K::Imm])
        }
        op if op.is_cond_jump() => {
            arity(1, operands)?;
            kind_in("target", &operands[0], &[K::Label, K::Imm])
        }
        RET | IRET | HLT | NOP | CLC | STC | CMC => arity(0, operands),
        INT => {
            arity(1, operands)?;
            kind_in("vector", &operands[0], &[K::Imm, K::Label])
        }
        IN => {
            arity(2, operands)?;
            kind_in("destination", &operands[0], &[K::Reg])?;
            kind_in("port", &operands[1], &[K::Imm])
        }
        OUTP => {
            arity(2, operands)?;
            kind_in("port", &operands[0], &[K::Imm])?;
            kind_in("source", &operands[1], &[K::Reg])
        }
        _ => Ok(()),
    }
}

/// A mapping between source lines and instruction ranges, derived from
/// generated `_SRC_<line>[_<dup>]` labels.
///
/// Each pair spans from its label's instruction index through the
/// instruction just before the next such label (or the end of the program).
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct SourceMap {
    /// (source line, instruction range) pairs, sorted by range start.
    spans: Vec<(usize, std::ops::Range<u16>)>,
}
impl SourceMap {
    /// Extracts the map from a program's label map.
    pub fn from_labels(labels: &LabelMap, program_len: u16) -> Self {
        let mut spans: Vec<(usize, u16)> = labels.iter()
            .filter_map(|(name, &addr)| Some((parse_src_label(name)?, addr)))
            .collect();
        spans.sort_by_key(|&(_, addr)| addr);

        let spans = spans.iter()
            .enumerate()
            .map(|(i, &(line, start))| {
                let end = spans.get(i + 1).map_or(program_len, |&(_, next)| next);
                (line, start..end)
            })
            .collect();

        SourceMap { spans }
    }

    /// The source line the given instruction index belongs to.
    pub fn line_of(&self, addr: u16) -> Option<usize> {
        let i = self.spans.partition_point(|(_, range)| range.start <= addr);
        let (line, range) = self.spans.get(i.checked_sub(1)?)?;
        range.contains(&addr).then_some(*line)
    }

    /// The first instruction index of the given source line.
    pub fn addr_of(&self, line: usize) -> Option<u16> {
        self.spans.iter()
            .find(|&&(l, _)| l == line)
            .map(|(_, range)| range.start)
    }

    /// Iterates the (line, range) pairs in instruction order.
    pub fn iter(&self) -> impl Iterator<Item = (usize, std::ops::Range<u16>)> + '_ {
        self.spans.iter().cloned()
    }
}

fn parse_src_label(name: &str) -> Option<usize> {
    let rest = name.strip_prefix("_SRC_")?;
    let digits = match rest.split_once('_') {
        Some((line, dup)) => {
            if dup.is_empty() || !dup.bytes().all(|b| b.is_ascii_digit()) {
                return None;
            }
            line
        }
        None => rest,
    };
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}
