//! Memory and register handling for the Micro-86 simulator.
//!
//! This module consists of:
//! - [`Mem`]: The flat 4 KiB RAM with little-endian word access.
//! - [`RegFile`]: The register file (eight general registers, `IP`, `FLAGS`).
//! - [`Reg`]: A general/pointer register name.
//! - [`Flags`]: The packed FLAGS word with typed accessors per flag bit.
//! - [`FillStrategy`]: Strategy used to fill RAM on reset.

use rand::rngs::StdRng;
use rand::Rng;

use super::RuntimeErr;

/// Address of the first memory-mapped port word.
///
/// Port `p` lives at `PORT_BASE + p*2` for `p` in `[0, 256)`. Ports share
/// the RAM; there is no separate address space.
pub const PORT_BASE: u16 = 0x0300;

/// Computes the RAM address backing the given port number.
///
/// The address wraps like any other effective address; out-of-range ports
/// simply produce out-of-range addresses and fail at access time.
pub const fn port_addr(port: u16) -> u16 {
    PORT_BASE.wrapping_add(port.wrapping_mul(2))
}

/// Computes the RAM address of the given interrupt vector's handler word.
pub const fn vector_addr(vector: u16) -> u16 {
    vector.wrapping_mul(2)
}

/// A general or pointer register.
///
/// `IP` and `FLAGS` are not `Reg`s: they are never legal instruction
/// operands and are accessed through their dedicated [`RegFile`] fields.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, serde::Serialize)]
pub enum Reg {
    #[allow(missing_docs)] Ax,
    #[allow(missing_docs)] Bx,
    #[allow(missing_docs)] Cx,
    #[allow(missing_docs)] Dx,
    #[allow(missing_docs)] Si,
    #[allow(missing_docs)] Di,
    #[allow(missing_docs)] Sp,
    #[allow(missing_docs)] Bp,
}
impl Reg {
    /// Every register, in register-file order.
    pub const ALL: [Reg; 8] = [
        Reg::Ax, Reg::Bx, Reg::Cx, Reg::Dx,
        Reg::Si, Reg::Di, Reg::Sp, Reg::Bp,
    ];

    /// The register's conventional upper-case name.
    pub fn name(self) -> &'static str {
        match self {
            Reg::Ax => "AX", Reg::Bx => "BX", Reg::Cx => "CX", Reg::Dx => "DX",
            Reg::Si => "SI", Reg::Di => "DI", Reg::Sp => "SP", Reg::Bp => "BP",
        }
    }

    /// Parses a register name, case-insensitively.
    pub fn parse(s: &str) -> Option<Reg> {
        match &*s.trim().to_uppercase() {
            "AX" => Some(Reg::Ax), "BX" => Some(Reg::Bx),
            "CX" => Some(Reg::Cx), "DX" => Some(Reg::Dx),
            "SI" => Some(Reg::Si), "DI" => Some(Reg::Di),
            "SP" => Some(Reg::Sp), "BP" => Some(Reg::Bp),
            _ => None,
        }
    }
}
impl std::fmt::Display for Reg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}
impl From<Reg> for usize {
    // Used for indexing the reg file.
    fn from(value: Reg) -> Self {
        value as usize
    }
}

/// A flag bit inside the packed FLAGS word.
///
/// Positions are compatible with the 8086 encoding.
#[derive(Debug, PartialEq, Eq, Hash, Clone, Copy, PartialOrd, Ord, serde::Serialize)]
pub enum Flag {
    /// Carry.
    Cf,
    /// Parity (even parity of the result's low byte).
    Pf,
    /// Auxiliary carry (carry out of bit 3).
    Af,
    /// Zero.
    Zf,
    /// Sign (bit 15 of the result).
    Sf,
    /// Overflow (signed).
    Of,
}
impl Flag {
    /// Every flag, in bit-position order.
    pub const ALL: [Flag; 6] = [Flag::Cf, Flag::Pf, Flag::Af, Flag::Zf, Flag::Sf, Flag::Of];

    /// The flag's bit mask within the FLAGS word.
    pub const fn mask(self) -> u16 {
        match self {
            Flag::Cf => 0x0001,
            Flag::Pf => 0x0004,
            Flag::Af => 0x0010,
            Flag::Zf => 0x0040,
            Flag::Sf => 0x0080,
            Flag::Of => 0x0800,
        }
    }

    /// The flag's conventional name.
    pub fn name(self) -> &'static str {
        match self {
            Flag::Cf => "CF", Flag::Pf => "PF", Flag::Af => "AF",
            Flag::Zf => "ZF", Flag::Sf => "SF", Flag::Of => "OF",
        }
    }
}
impl std::fmt::Display for Flag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A wrapper over `u16` in order to facilitate the FLAGS word.
///
/// The six logical flags live at fixed positions (see [`Flag::mask`]);
/// all other bits are reserved zero but are preserved by the masked
/// accessors, so whole-word loads (`IRET`) round-trip exactly.
#[derive(PartialEq, Eq, Clone, Copy, Default, serde::Serialize)]
#[serde(transparent)]
#[repr(transparent)]
pub struct Flags(pub u16);

impl Flags {
    /// Creates an all-clear FLAGS word.
    pub fn new() -> Self {
        Flags(0)
    }

    /// Reads a single flag.
    pub fn get(self, flag: Flag) -> bool {
        self.0 & flag.mask() != 0
    }
    /// Writes a single flag, preserving every other bit.
    pub fn set(&mut self, flag: Flag, value: bool) {
        match value {
            true  => self.0 |= flag.mask(),
            false => self.0 &= !flag.mask(),
        }
    }
}
impl std::fmt::Debug for Flags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use std::fmt::Write;

        write!(f, "Flags(x{:04X}: ", self.0)?;
        let mut any = false;
        for flag in Flag::ALL {
            if self.get(flag) {
                if any { f.write_char(' ')?; }
                f.write_str(flag.name())?;
                any = true;
            }
        }
        if !any { f.write_char('-')?; }
        f.write_char(')')
    }
}

/// The register file.
///
/// The eight general/pointer registers are indexed with a [`Reg`];
/// `ip` and `flags` are dedicated fields since they are not instruction
/// operands.
///
/// # Example
///
/// ```
/// use micro86::sim::mem::{RegFile, Reg};
///
/// let mut regs = RegFile::new(4094);
/// regs[Reg::Ax] = 11;
/// assert_eq!(regs[Reg::Ax], 11);
/// assert_eq!(regs[Reg::Sp], 4094);
/// ```
#[derive(Debug, PartialEq, Eq, Clone, serde::Serialize)]
pub struct RegFile {
    gp: [u16; 8],
    /// The instruction pointer. An index into the instruction sequence,
    /// not a byte address.
    pub ip: u16,
    /// The packed FLAGS word.
    pub flags: Flags,
}
impl RegFile {
    /// Creates a register file in the reset state, with `SP` set to the
    /// given stack top and everything else zero.
    pub fn new(stack_top: u16) -> Self {
        let mut rf = RegFile { gp: [0; 8], ip: 0, flags: Flags::new() };
        rf[Reg::Sp] = stack_top;
        rf
    }
}
impl std::ops::Index<Reg> for RegFile {
    type Output = u16;

    fn index(&self, index: Reg) -> &Self::Output {
        &self.gp[usize::from(index)]
    }
}
impl std::ops::IndexMut<Reg> for RegFile {
    fn index_mut(&mut self, index: Reg) -> &mut Self::Output {
        &mut self.gp[usize::from(index)]
    }
}

/// Trait that describes types that can produce the fill bytes for RAM.
///
/// This is used with [`Mem::new`] to decide what resides in memory
/// before the program writes to it.
pub trait MemFiller {
    /// Generate one fill byte.
    fn generate(&mut self) -> u8;
}
impl MemFiller for u8 {
    /// Fills each byte with the given value.
    fn generate(&mut self) -> u8 {
        *self
    }
}
impl MemFiller for StdRng {
    /// Fills bytes from a seeded random number generator.
    ///
    /// Useful for checking that a program does not depend on RAM
    /// starting out zeroed.
    fn generate(&mut self) -> u8 {
        self.gen()
    }
}

/// Strategy used to fill RAM when the machine is created or reset.
///
/// The default is all-zeroes, which keeps resets fully deterministic.
#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub enum FillStrategy {
    /// Every byte starts at zero.
    #[default]
    Zero,
    /// Every byte starts at a known value.
    Known {
        /// The value to fill each byte with.
        value: u8
    },
    /// Bytes start at seeded pseudo-random values.
    ///
    /// Two machines created with the same seed have identical RAM.
    Seeded {
        /// The seed the RNG is initialized with.
        seed: u64
    },
}
impl FillStrategy {
    pub(crate) fn filler(&self) -> impl MemFiller {
        use rand::SeedableRng;

        match *self {
            FillStrategy::Zero            => MemFill::Known(0),
            FillStrategy::Known { value } => MemFill::Known(value),
            FillStrategy::Seeded { seed } => MemFill::Seeded(Box::new(StdRng::seed_from_u64(seed))),
        }
    }
}

enum MemFill {
    Known(u8),
    Seeded(Box<StdRng>),
}
impl MemFiller for MemFill {
    fn generate(&mut self) -> u8 {
        match self {
            MemFill::Known(v)  => v.generate(),
            MemFill::Seeded(r) => r.generate(),
        }
    }
}

/// The simulator's RAM: a flat byte array with little-endian word access.
///
/// Every access is bounds-checked; an address outside the array fails the
/// access (and with it, the current instruction). Word access at the last
/// byte of memory is out of range, since the high byte would not fit.
///
/// # Example
///
/// ```
/// use micro86::sim::mem::Mem;
///
/// let mut mem = Mem::new(4096, &mut 0u8);
/// mem.write_word(0x0100, 0xBEEF).unwrap();
/// assert_eq!(mem.read_word(0x0100).unwrap(), 0xBEEF);
/// // Little-endian: low byte at the lower address.
/// assert_eq!(mem.read_byte(0x0100).unwrap(), 0xEF);
/// assert_eq!(mem.read_byte(0x0101).unwrap(), 0xBE);
/// ```
#[derive(PartialEq, Eq, Clone, serde::Serialize)]
#[serde(transparent)]
pub struct Mem {
    data: Box<[u8]>,
}
impl Mem {
    /// Creates a new memory of the given size, filled by the provided filler.
    pub fn new(size: usize, filler: &mut impl MemFiller) -> Self {
        Self {
            data: std::iter::repeat_with(|| filler.generate())
                .take(size)
                .collect(),
        }
    }

    /// The size of this memory in bytes.
    pub fn len(&self) -> usize {
        self.data.len()
    }
    /// Whether this memory is zero-sized.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Direct access to the underlying bytes (for diffing and serialization).
    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Builds a memory directly from bytes (the replay import path).
    pub(crate) fn from_vec(bytes: Vec<u8>) -> Self {
        Self { data: bytes.into_boxed_slice() }
    }

    /// Reads one byte.
    pub fn read_byte(&self, addr: u16) -> Result<u8, RuntimeErr> {
        self.data.get(usize::from(addr))
            .copied()
            .ok_or(RuntimeErr::MemOutOfBounds { addr })
    }

    /// Writes one byte.
    pub fn write_byte(&mut self, addr: u16, value: u8) -> Result<(), RuntimeErr> {
        match self.data.get_mut(usize::from(addr)) {
            Some(b) => {
                *b = value;
                Ok(())
            }
            None => Err(RuntimeErr::MemOutOfBounds { addr }),
        }
    }

    /// Reads one little-endian word.
    pub fn read_word(&self, addr: u16) -> Result<u16, RuntimeErr> {
        let lo = self.read_byte(addr)?;
        let hi = self.read_byte(addr.wrapping_add(1))?;
        Ok(u16::from_le_bytes([lo, hi]))
    }

    /// Writes one little-endian word.
    ///
    /// Both bytes are bounds-checked up front, so a failing write leaves
    /// memory untouched.
    pub fn write_word(&mut self, addr: u16, value: u16) -> Result<(), RuntimeErr> {
        let hi_addr = addr.wrapping_add(1);
        if usize::from(addr) >= self.data.len() || usize::from(hi_addr) >= self.data.len() {
            return Err(RuntimeErr::MemOutOfBounds { addr });
        }
        let [lo, hi] = value.to_le_bytes();
        self.write_byte(addr, lo)?;
        self.write_byte(hi_addr, hi)
    }

    /// Reads the port word for the given port number.
    pub fn read_port(&self, port: u16) -> Result<u16, RuntimeErr> {
        self.read_word(port_addr(port))
    }

    /// Writes the port word for the given port number.
    pub fn write_port(&mut self, port: u16, value: u16) -> Result<(), RuntimeErr> {
        self.write_word(port_addr(port), value)
    }
}
impl std::fmt::Debug for Mem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mem")
            .field("len", &self.data.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_access_is_little_endian() {
        let mut mem = Mem::new(4096, &mut 0u8);
        mem.write_word(0x0010, 0x1234).unwrap();
        assert_eq!(mem.read_byte(0x0010).unwrap(), 0x34);
        assert_eq!(mem.read_byte(0x0011).unwrap(), 0x12);
        assert_eq!(mem.read_word(0x0010).unwrap(), 0x1234);
    }

    #[test]
    fn out_of_range_fails() {
        let mut mem = Mem::new(4096, &mut 0u8);
        assert!(mem.read_byte(4096).is_err());
        assert!(mem.read_word(4095).is_err());
        assert!(mem.write_word(4095, 0x0101).is_err());
        // A failing word write leaves memory untouched.
        assert_eq!(mem.read_byte(4095).unwrap(), 0);
        assert!(mem.write_word(4094, 1).is_ok());
    }

    #[test]
    fn port_addressing() {
        let mut mem = Mem::new(4096, &mut 0u8);
        mem.write_port(0, 42).unwrap();
        mem.write_port(3, 7).unwrap();
        assert_eq!(mem.read_word(0x0300).unwrap(), 42);
        assert_eq!(mem.read_word(0x0306).unwrap(), 7);
        assert_eq!(mem.read_port(3).unwrap(), 7);
    }

    #[test]
    fn seeded_fill_is_deterministic() {
        let a = Mem::new(64, &mut FillStrategy::Seeded { seed: 9 }.filler());
        let b = Mem::new(64, &mut FillStrategy::Seeded { seed: 9 }.filler());
        let c = Mem::new(64, &mut FillStrategy::Seeded { seed: 10 }.filler());
        assert_eq!(a.bytes(), b.bytes());
        assert_ne!(a.bytes(), c.bytes());
    }

    #[test]
    fn flags_preserve_reserved_bits() {
        let mut flags = Flags(0x0002);
        flags.set(Flag::Cf, true);
        flags.set(Flag::Zf, true);
        assert_eq!(flags.0, 0x0043);
        flags.set(Flag::Cf, false);
        assert_eq!(flags.0, 0x0042);
        assert!(flags.get(Flag::Zf));
        assert!(!flags.get(Flag::Of));
    }

    #[test]
    fn reg_parse_round_trip() {
        for reg in Reg::ALL {
            assert_eq!(Reg::parse(reg.name()), Some(reg));
            assert_eq!(Reg::parse(&reg.name().to_lowercase()), Some(reg));
        }
        assert_eq!(Reg::parse("IP"), None);
        assert_eq!(Reg::parse("R0"), None);
    }
}
