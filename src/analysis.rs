//! Pedagogical analyzers that consume finished execution traces.
//!
//! Everything here is a pure function of an ordered [`TraceEntry`]
//! sequence; none of it lives inside the stepper. The analyzers are:
//! - [`CycleBreakdown`]: per-opcode instruction and cycle totals.
//! - [`predict_branches`]: a 2-bit saturating branch predictor.
//! - [`CacheSim`]: a direct-mapped cache fed from the memory access sets.
//! - [`count_hazards`]: read-after-write hazards between adjacent steps.
//! - [`execution_stats`]: overall execution analytics.
//!
//! The assertion mini-language lives in the [`check`] submodule.

pub mod check;

use std::collections::{BTreeMap, HashMap};

use crate::asm::Opcode;
use crate::sim::TraceEntry;

/// The opcode a trace entry executed, recovered from its text.
fn entry_opcode(entry: &TraceEntry) -> Option<Opcode> {
    let mnemonic = entry.instruction_text.split_whitespace().next()?;
    Opcode::parse(mnemonic)
}

/// Whether a trace entry took its branch (fell anywhere but straight
/// through).
fn entry_taken(entry: &TraceEntry) -> bool {
    entry.ip_after != entry.ip_before.wrapping_add(1)
}

/// Per-opcode instruction and cycle totals.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleBreakdown {
    rows: BTreeMap<String, OpcodeCycles>,
}

/// One row of a [`CycleBreakdown`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct OpcodeCycles {
    /// How many times the opcode executed.
    pub count: u64,
    /// Total cycles attributed to it.
    pub cycles: u64,
}

impl CycleBreakdown {
    /// Tallies a trace.
    pub fn from_trace<'t>(trace: impl IntoIterator<Item = &'t TraceEntry>) -> Self {
        let mut rows: BTreeMap<String, OpcodeCycles> = BTreeMap::new();
        for entry in trace {
            let mnemonic = entry.instruction_text
                .split_whitespace()
                .next()
                .unwrap_or("?")
                .to_uppercase();
            let row = rows.entry(mnemonic).or_default();
            row.count += 1;
            row.cycles += u64::from(entry.cycles);
        }
        Self { rows }
    }

    /// Rows, sorted by mnemonic.
    pub fn rows(&self) -> impl Iterator<Item = (&str, OpcodeCycles)> + '_ {
        self.rows.iter().map(|(op, &row)| (op.as_str(), row))
    }

    /// Total cycles across all rows.
    pub fn total_cycles(&self) -> u64 {
        self.rows.values().map(|row| row.cycles).sum()
    }
}

/// The outcome of running the 2-bit branch predictor over a trace.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BranchStats {
    /// Branch instructions seen (conditional and unconditional).
    pub branches: u64,
    /// How many of them were taken.
    pub taken: u64,
    /// How many the predictor got right.
    pub hits: u64,
}
impl BranchStats {
    /// Prediction accuracy in `[0, 1]`; 1.0 for a branch-free trace.
    pub fn accuracy(&self) -> f64 {
        match self.branches {
            0 => 1.0,
            n => self.hits as f64 / n as f64,
        }
    }
}

/// Runs a classic 2-bit saturating counter predictor, one counter per
/// branch address, initialized to weakly-not-taken.
pub fn predict_branches<'t>(trace: impl IntoIterator<Item = &'t TraceEntry>) -> BranchStats {
    let mut counters: HashMap<u16, u8> = HashMap::new();
    let mut stats = BranchStats::default();

    for entry in trace {
        if !entry_opcode(entry).is_some_and(Opcode::is_jump) {
            continue;
        }
        let taken = entry_taken(entry);
        let counter = counters.entry(entry.instruction_address).or_insert(1);

        stats.branches += 1;
        if taken {
            stats.taken += 1;
        }
        if (*counter >= 2) == taken {
            stats.hits += 1;
        }
        *counter = match taken {
            true => (*counter + 1).min(3),
            false => counter.saturating_sub(1),
        };
    }
    stats
}

/// Hit/miss counts from a cache simulation.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    #[allow(missing_docs)] pub read_hits: u64,
    #[allow(missing_docs)] pub read_misses: u64,
    #[allow(missing_docs)] pub write_hits: u64,
    #[allow(missing_docs)] pub write_misses: u64,
}
impl CacheStats {
    /// All accesses.
    pub fn accesses(&self) -> u64 {
        self.read_hits + self.read_misses + self.write_hits + self.write_misses
    }
    /// Hit rate in `[0, 1]`; 1.0 for a memory-free trace.
    pub fn hit_rate(&self) -> f64 {
        match self.accesses() {
            0 => 1.0,
            n => (self.read_hits + self.write_hits) as f64 / n as f64,
        }
    }
}

/// A direct-mapped, write-allocate cache model fed from the per-step
/// memory access sets.
#[derive(Debug, Clone)]
pub struct CacheSim {
    block_bytes: u16,
    tags: Vec<Option<u16>>,
}
impl CacheSim {
    /// Creates a cache with the given line count and block size (both
    /// powers of two make the arithmetic honest, but any values work).
    pub fn new(lines: usize, block_bytes: u16) -> Self {
        Self {
            block_bytes: block_bytes.max(2),
            tags: vec![None; lines.max(1)],
        }
    }

    /// A small teaching cache: 16 lines of 16 bytes.
    pub fn default_shape() -> Self {
        Self::new(16, 16)
    }

    fn access(&mut self, addr: u16) -> bool {
        let block = addr / self.block_bytes;
        let line = usize::from(block) % self.tags.len();
        let hit = self.tags[line] == Some(block);
        self.tags[line] = Some(block);
        hit
    }

    /// Feeds a whole trace through the cache.
    pub fn run<'t>(mut self, trace: impl IntoIterator<Item = &'t TraceEntry>) -> CacheStats {
        let mut stats = CacheStats::default();
        for entry in trace {
            for &addr in &entry.memory_reads {
                match self.access(addr) {
                    true => stats.read_hits += 1,
                    false => stats.read_misses += 1,
                }
            }
            for &addr in &entry.memory_writes {
                match self.access(addr) {
                    true => stats.write_hits += 1,
                    false => stats.write_misses += 1,
                }
            }
        }
        stats
    }
}

/// Read-after-write hazard counts between adjacent trace entries.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HazardStats {
    /// Pairs where the next instruction references a register the
    /// previous one wrote.
    pub reg_raw: u64,
    /// Pairs where the next instruction reads a word the previous one
    /// wrote.
    pub mem_raw: u64,
}
impl HazardStats {
    /// All hazard pairs.
    pub fn total(&self) -> u64 {
        self.reg_raw + self.mem_raw
    }
}

/// Counts RAW hazards between each pair of consecutive steps.
pub fn count_hazards<'t>(trace: impl IntoIterator<Item = &'t TraceEntry>) -> HazardStats {
    let mut stats = HazardStats::default();
    let mut prev: Option<&TraceEntry> = None;

    for entry in trace {
        if let Some(prev) = prev {
            let text = entry.instruction_text.to_uppercase();
            let references_reg = prev.changed_registers.iter()
                .filter(|name| *name != "IP" && *name != "FLAGS")
                .any(|name| {
                    text.split(|c: char| !c.is_ascii_alphanumeric())
                        .any(|word| word == name)
                });
            if references_reg {
                stats.reg_raw += 1;
            }
            if prev.memory_writes.iter().any(|w| entry.memory_reads.contains(w)) {
                stats.mem_raw += 1;
            }
        }
        prev = Some(entry);
    }
    stats
}

/// Overall execution analytics.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ExecutionStats {
    /// Instructions executed.
    pub instructions: u64,
    /// Total estimated cycles.
    pub total_cycles: u64,
    /// Instruction mix by mnemonic.
    pub instruction_mix: BTreeMap<String, u64>,
    /// The most-executed instruction addresses, hottest first (top 10).
    pub hot_addresses: Vec<(u16, u64)>,
    /// Branches seen / taken.
    pub branches: u64,
    #[allow(missing_docs)]
    pub branches_taken: u64,
    /// Words read from / written to memory.
    pub words_read: u64,
    #[allow(missing_docs)]
    pub words_written: u64,
}
impl ExecutionStats {
    /// Average cycles per instruction; 0.0 for an empty trace.
    pub fn cycles_per_instruction(&self) -> f64 {
        match self.instructions {
            0 => 0.0,
            n => self.total_cycles as f64 / n as f64,
        }
    }
}

/// Computes analytics over a whole trace.
pub fn execution_stats<'t>(trace: impl IntoIterator<Item = &'t TraceEntry>) -> ExecutionStats {
    let mut stats = ExecutionStats::default();
    let mut address_heat: HashMap<u16, u64> = HashMap::new();

    for entry in trace {
        stats.instructions += 1;
        stats.total_cycles += u64::from(entry.cycles);
        stats.words_read += entry.memory_reads.len() as u64;
        stats.words_written += entry.memory_writes.len() as u64;

        let mnemonic = entry.instruction_text
            .split_whitespace()
            .next()
            .unwrap_or("?")
            .to_uppercase();
        *stats.instruction_mix.entry(mnemonic).or_insert(0) += 1;
        *address_heat.entry(entry.instruction_address).or_insert(0) += 1;

        if entry_opcode(entry).is_some_and(Opcode::is_jump) {
            stats.branches += 1;
            if entry_taken(entry) {
                stats.branches_taken += 1;
            }
        }
    }

    let mut heat: Vec<(u16, u64)> = address_heat.into_iter().collect();
    heat.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    heat.truncate(10);
    stats.hot_addresses = heat;

    stats
}
