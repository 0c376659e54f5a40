//! Simulation and time-travel execution for assembled programs.
//!
//! This module is focused on executing fully assembled code (i.e., [`Program`]).
//!
//! This module consists of:
//! - [`Simulator`]: The stepper that drives the CPU core and records history.
//! - [`cpu`]: The module holding the pure per-instruction transition.
//! - [`mem`]: The module handling RAM, registers, and flags.
//! - [`io`]: The module handling program output events.
//! - [`debug`]: The module handling watchpoints for the simulator.
//!
//! Every executed instruction produces one immutable [`TraceEntry`] and one
//! [`Snapshot`], so any point of the execution can be revisited with
//! [`Simulator::seek`] and execution can be re-branched from there.

pub mod cpu;
pub mod debug;
pub mod io;
pub mod mem;

use std::collections::BTreeSet;
use std::time::Instant;

use crate::asm::{Opcode, Operand, Program};

use self::cpu::{effective_addr, CpuState};
use self::debug::WatchpointList;
use self::io::OutputEvent;
use self::mem::{vector_addr, FillStrategy, Flag, Reg};

/// Errors that can occur while executing an instruction.
///
/// These never escape as control flow: the CPU core folds them into the
/// returned state as `halted = true` plus the error message.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum RuntimeErr {
    /// A memory access fell outside RAM.
    MemOutOfBounds {
        /// The offending address.
        addr: u16
    },
    /// `DIV` or `MOD` with a zero divisor.
    DivideByZero,
    /// `DIV` whose quotient does not fit a word.
    DivideOverflow,
    /// A jump or `INT` referenced a label the program does not define.
    UnknownLabel(String),
    /// A push with no room below `SP`.
    StackOverflow,
    /// An operand that cannot be used in this position at runtime.
    BadOperand(String),
}
impl std::fmt::Display for RuntimeErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RuntimeErr::MemOutOfBounds { addr } => write!(f, "memory access out of bounds at address 0x{addr:04X}"),
            RuntimeErr::DivideByZero      => f.write_str("division by zero"),
            RuntimeErr::DivideOverflow    => f.write_str("division overflow"),
            RuntimeErr::UnknownLabel(l)   => write!(f, "unknown label '{l}'"),
            RuntimeErr::StackOverflow     => f.write_str("stack overflow"),
            RuntimeErr::BadOperand(op)    => write!(f, "operand '{op}' cannot be used here"),
        }
    }
}
impl std::error::Error for RuntimeErr {}
impl crate::err::Error for RuntimeErr {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match self {
            RuntimeErr::MemOutOfBounds { .. } => Some("RAM spans addresses 0x0000 to 0x0FFF".into()),
            RuntimeErr::DivideByZero          => Some("check the divisor before dividing".into()),
            RuntimeErr::DivideOverflow        => Some("the quotient of DX:AX / divisor must fit 16 bits; clear DX for plain word division".into()),
            RuntimeErr::UnknownLabel(_)       => Some("labels are case-insensitive and must be defined somewhere in the program".into()),
            RuntimeErr::StackOverflow         => Some("the stack grows down from 0x0FFE; deep recursion or a missing RET can exhaust it".into()),
            RuntimeErr::BadOperand(_)         => None,
        }
    }
}

/// Tunables of the core, collected in one place.
///
/// The defaults describe the standard teaching machine: 4 KiB of RAM,
/// stack top at `0x0FFE`, variables from `0x0100`, ports from `0x0300`.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct CoreConfig {
    /// RAM size in bytes.
    pub memory_size_bytes: usize,
    /// Initial `SP` on reset.
    pub stack_top: u16,
    /// First address used for compiled variable slots.
    pub var_base: u16,
    /// First address of the memory-mapped port window.
    pub port_base: u16,
    /// Instruction budget for a single `resume`/`step_over` call.
    pub max_steps_per_continue: u32,
    /// Cap on `changed_memory_words` entries per trace entry (display only).
    pub memory_diff_cap: usize,
    /// How RAM is filled on reset.
    pub fill: FillStrategy,
}
impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            memory_size_bytes: 4096,
            stack_top: 4094,
            var_base: 0x0100,
            port_base: 0x0300,
            max_steps_per_continue: 10_000,
            memory_diff_cap: 24,
            fill: FillStrategy::default(),
        }
    }
}

/// An immutable record of one executed instruction.
///
/// Entries are append-only: once recorded, a trace entry is never modified.
/// Downstream analyzers consume these as an ordered stream.
#[derive(Debug, PartialEq, Clone, serde::Serialize)]
pub struct TraceEntry {
    /// 1-based step number.
    pub step: usize,
    /// The executed instruction's index in the program.
    pub instruction_address: u16,
    /// The executed instruction's text.
    pub instruction_text: String,
    /// `IP` before the step.
    pub ip_before: u16,
    /// `IP` after the step.
    pub ip_after: u16,
    /// Names of registers whose value changed (of all ten, `IP` and
    /// `FLAGS` included), in register-file order.
    pub changed_registers: Vec<String>,
    /// Names of flags whose value changed, in bit order.
    pub changed_flags: Vec<String>,
    /// Even word addresses whose contents changed, sorted, capped for
    /// display.
    pub changed_memory_words: Vec<u16>,
    /// Word addresses this instruction read, sorted.
    pub memory_reads: Vec<u16>,
    /// Word addresses this instruction wrote, sorted.
    pub memory_writes: Vec<u16>,
    /// Output captured from this step (before execution).
    pub output: Vec<OutputEvent>,
    /// Estimated cycle cost.
    pub cycles: u32,
    /// Milliseconds since the simulator was created. Advisory only.
    pub timestamp_ms: u64,
}

/// Aggregate performance estimates, updated once per step.
#[derive(Debug, PartialEq, Clone, Copy, serde::Serialize)]
pub struct PerfStats {
    /// Instructions executed since reset.
    pub instructions_executed: u64,
    /// Total estimated cycles since reset.
    pub total_cycles: u64,
    /// Simulated load in `[0, 100]`, an EMA over per-step pressure.
    pub simulated_load: f64,
}
impl Default for PerfStats {
    fn default() -> Self {
        PerfStats { instructions_executed: 0, total_cycles: 0, simulated_load: 0.0 }
    }
}
impl PerfStats {
    /// Folds one step into the stats.
    ///
    /// The load sample blends cycle pressure (18 cycles = 100%) with
    /// churn pressure (one changed signal = 12%), then feeds an EMA with
    /// coefficient 0.35.
    fn record(&mut self, cycles: u32, changed_signals: usize) {
        self.instructions_executed += 1;
        self.total_cycles += u64::from(cycles);

        let cycle_pressure = (f64::from(cycles) / 18.0 * 100.0).round().min(100.0);
        let churn_pressure = ((changed_signals * 12) as f64).min(100.0);
        let sample = (0.7 * cycle_pressure + 0.3 * churn_pressure).round().min(100.0);
        self.simulated_load += 0.35 * (sample - self.simulated_load);
    }
}

/// A deep copy of everything observable at one point of the timeline.
///
/// Snapshots are referentially independent: cloning one deep-copies the
/// RAM, so editing a later state can never corrupt an earlier one.
#[derive(Debug, PartialEq, Clone, serde::Serialize)]
pub struct Snapshot {
    /// The machine state at this point.
    pub state: CpuState,
    /// All output accumulated up to this point.
    pub output: Vec<OutputEvent>,
    /// How long the trace was when this snapshot was taken.
    pub trace_len: usize,
    /// Performance stats at this point.
    pub perf: PerfStats,
    /// Milliseconds since the simulator was created. Advisory only.
    pub created_at_ms: u64,
}

/// What a single [`Simulator::step_into`] call did.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StepEvent {
    /// One instruction was executed and recorded.
    Stepped,
    /// The machine is halted; nothing happened.
    Idle,
    /// `IP` pointed outside the program; the machine was halted in place.
    Fault,
}

/// Why a multi-step call ([`Simulator::resume`], [`Simulator::step_over`])
/// returned.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum StopReason {
    /// The call's own goal was reached (step-over returned to its target).
    Done,
    /// The machine halted (`HLT`, a runtime error, or a fetch fault).
    Halted,
    /// Paused before executing an address in the breakpoint set.
    Breakpoint,
    /// A watchpoint matched the last step's memory activity.
    Watchpoint,
    /// The per-call step budget ran out; the machine was halted with an
    /// error.
    StepCap,
}

const STEP_CAP_MSG: &str = "Maximum steps exceeded (infinite loop?)";

/// Executes assembled code step by step, recording a seekable history.
///
/// The simulator owns the snapshot timeline and the trace exclusively.
/// Every step appends exactly one [`TraceEntry`] and one [`Snapshot`], so
/// `snapshots.len() == trace.len() + 1` always holds (the first snapshot
/// is the reset state).
///
/// # Example
/// ```
/// use micro86::asm::assemble;
/// use micro86::sim::{Simulator, StopReason};
/// use micro86::sim::mem::Reg;
///
/// let program = assemble("
///     MOV AX, 10
///     MOV BX, 0
/// LOOP:
///     ADD BX, AX
///     DEC AX
///     JNZ LOOP
///     OUT BX
///     HLT
/// ");
/// let mut sim = Simulator::new(program);
/// assert_eq!(sim.resume(), StopReason::Halted);
/// assert_eq!(sim.state().regs[Reg::Bx], 55);
/// ```
#[derive(Debug)]
pub struct Simulator {
    program: Program,

    // ------------------ TIMELINE ------------------
    // `snapshots[cursor]` is the state the next step starts from.
    snapshots: Vec<Snapshot>,
    trace: Vec<TraceEntry>,
    cursor: usize,

    // ------------------ CONFIG/DEBUG ------------------
    // `reset` preserves these.

    /// Configuration settings for the simulator.
    pub config: CoreConfig,
    /// Instruction addresses to pause at during multi-step calls.
    pub breakpoints: BTreeSet<u16>,
    /// Watchpoints over memory activity.
    pub watchpoints: WatchpointList,

    epoch: Instant,
}

impl Simulator {
    /// Creates a simulator for the given program with default configuration.
    pub fn new(program: Program) -> Self {
        Self::with_config(program, CoreConfig::default())
    }

    /// Creates a simulator with an explicit configuration.
    pub fn with_config(program: Program, config: CoreConfig) -> Self {
        let epoch = Instant::now();
        Simulator {
            snapshots: vec![Self::reset_snapshot(&config)],
            trace: Vec::new(),
            cursor: 0,
            program,
            config,
            breakpoints: BTreeSet::new(),
            watchpoints: WatchpointList::new(),
            epoch,
        }
    }

    /// Rebuilds a simulator from previously recorded history (the replay
    /// import path). The cursor lands on the last snapshot.
    pub(crate) fn restore(
        program: Program,
        config: CoreConfig,
        snapshots: Vec<Snapshot>,
        trace: Vec<TraceEntry>,
        breakpoints: BTreeSet<u16>,
    ) -> Self {
        let snapshots = match snapshots.is_empty() {
            true => vec![Self::reset_snapshot(&config)],
            false => snapshots,
        };
        Simulator {
            cursor: snapshots.len() - 1,
            snapshots,
            trace,
            program,
            config,
            breakpoints,
            watchpoints: WatchpointList::new(),
            epoch: Instant::now(),
        }
    }

    fn reset_snapshot(config: &CoreConfig) -> Snapshot {
        Snapshot {
            state: CpuState::new(config),
            output: Vec::new(),
            trace_len: 0,
            perf: PerfStats::default(),
            created_at_ms: 0,
        }
    }

    /// Resets the timeline back to the reset state.
    ///
    /// Configuration, breakpoints, and watchpoints are preserved.
    pub fn reset(&mut self) {
        self.snapshots = vec![Self::reset_snapshot(&self.config)];
        self.trace.clear();
        self.cursor = 0;
    }

    /// The program being executed.
    pub fn program(&self) -> &Program {
        &self.program
    }

    /// The machine state at the cursor.
    pub fn state(&self) -> &CpuState {
        &self.snapshots[self.cursor].state
    }

    /// The machine state one position before the cursor, if any.
    pub fn previous_state(&self) -> Option<&CpuState> {
        Some(&self.snapshots[self.cursor.checked_sub(1)?].state)
    }

    /// All output accumulated up to the cursor.
    pub fn output(&self) -> &[OutputEvent] {
        &self.snapshots[self.cursor].output
    }

    /// The full recorded trace (past the cursor included).
    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// The full snapshot timeline.
    pub fn snapshots(&self) -> &[Snapshot] {
        &self.snapshots
    }

    /// The cursor's position in the snapshot timeline.
    pub fn cursor(&self) -> usize {
        self.cursor
    }

    /// Whether the cursor is at the newest snapshot.
    pub fn at_tip(&self) -> bool {
        self.cursor + 1 == self.snapshots.len()
    }

    /// Performance stats at the cursor.
    pub fn perf(&self) -> &PerfStats {
        &self.snapshots[self.cursor].perf
    }

    /// Seeks the cursor to an arbitrary snapshot index.
    ///
    /// Returns false (and does nothing) if the index is out of range.
    /// No state is produced or destroyed; stepping from a rewound cursor
    /// is what truncates the abandoned future.
    pub fn seek(&mut self, index: usize) -> bool {
        match index < self.snapshots.len() {
            true => {
                self.cursor = index;
                true
            }
            false => false,
        }
    }

    /// Moves the cursor one snapshot earlier. Returns false at the start.
    pub fn step_back(&mut self) -> bool {
        match self.cursor {
            0 => false,
            _ => {
                self.cursor -= 1;
                true
            }
        }
    }

    /// Executes exactly one instruction and records it.
    ///
    /// If the cursor is not at the tip, the abandoned future is truncated
    /// first so the timeline stays consistent. A halted machine is frozen:
    /// stepping it is a no-op.
    pub fn step_into(&mut self) -> StepEvent {
        self.rewind_branch();

        if self.state().halted {
            return StepEvent::Idle;
        }
        let ip = self.state().regs.ip;
        let Some(instr) = self.program.instructions.get(usize::from(ip)).cloned() else {
            self.mark_fault(format!("instruction pointer out of range (0x{ip:04X})"));
            return StepEvent::Fault;
        };

        let before = self.snapshots[self.cursor].state.clone();

        // Memory access sets are static facts about the instruction and
        // the pre-state; compute them before anything moves.
        let (memory_reads, memory_writes) = access_sets(&before, &instr, &self.config);

        // Output is captured *before* execution: a step that fails still
        // records its emission.
        let output = capture_output(&before, &instr);

        let after = cpu::execute(&before, &instr, &self.program.labels);

        let changed_registers = diff_registers(&before, &after);
        let changed_flags = diff_flags(&before, &after);
        let changed_memory_words = diff_memory(&before, &after, self.config.memory_diff_cap);
        let changed_signals =
            changed_registers.len() + changed_flags.len() + changed_memory_words.len();

        let cycles = instr.opcode.cycles();
        let now = self.elapsed_ms();

        let entry = TraceEntry {
            step: self.trace.len() + 1,
            instruction_address: instr.addr,
            instruction_text: instr.raw.clone(),
            ip_before: ip,
            ip_after: after.regs.ip,
            changed_registers,
            changed_flags,
            changed_memory_words,
            memory_reads,
            memory_writes,
            output: output.clone(),
            cycles,
            timestamp_ms: now,
        };

        let tip = &self.snapshots[self.cursor];
        let mut accumulated = tip.output.clone();
        accumulated.extend(output);
        let mut perf = tip.perf;
        perf.record(cycles, changed_signals);

        self.trace.push(entry);
        self.snapshots.push(Snapshot {
            state: after,
            output: accumulated,
            trace_len: self.trace.len(),
            perf,
            created_at_ms: now,
        });
        self.cursor = self.snapshots.len() - 1;

        StepEvent::Stepped
    }

    /// Runs until the tripwire returns false or any of the typical breaks
    /// occur.
    ///
    /// The typical break conditions are:
    /// - the machine halts (or faults),
    /// - an address in the breakpoint set is about to execute
    ///   (checked only after at least one step, so resuming *from* a
    ///   breakpoint makes progress),
    /// - a watchpoint matches the step that just ran,
    /// - the per-call step budget runs out.
    fn run_while(&mut self, mut tripwire: impl FnMut(&Simulator) -> bool) -> StopReason {
        let mut steps: u32 = 0;
        let mut first = Some(());

        loop {
            if self.state().halted {
                return StopReason::Halted;
            }
            if first.take().is_none() {
                if self.breakpoints.contains(&self.state().regs.ip) {
                    return StopReason::Breakpoint;
                }
                if !tripwire(self) {
                    return StopReason::Done;
                }
            }
            if steps >= self.config.max_steps_per_continue {
                self.mark_fault(STEP_CAP_MSG.to_string());
                return StopReason::StepCap;
            }

            match self.step_into() {
                StepEvent::Stepped => {}
                StepEvent::Idle | StepEvent::Fault => return StopReason::Halted,
            }
            steps += 1;

            if let Some(entry) = self.trace.last() {
                if self.watchpoints.find_match(entry).is_some() {
                    return StopReason::Watchpoint;
                }
            }
        }
    }

    /// Runs until a halt, breakpoint, watchpoint, or the step cap.
    pub fn resume(&mut self) -> StopReason {
        self.run_while(|_| true)
    }

    /// Executes one source-level step, running through an entire `CALL` as
    /// a single step.
    ///
    /// For a `CALL`, this runs until `IP` lands on the instruction after
    /// the call at call depth zero (tracking a local depth counter:
    /// `CALL` increments, `RET` decrements, clamped at zero), or until any
    /// of the usual breaks. For anything else it is identical to
    /// [`Simulator::step_into`].
    pub fn step_over(&mut self) -> StopReason {
        let ip = self.state().regs.ip;
        let is_call = self.program.instructions.get(usize::from(ip))
            .is_some_and(|instr| instr.opcode == Opcode::CALL);

        if !is_call {
            return match self.step_into() {
                StepEvent::Stepped => StopReason::Done,
                StepEvent::Idle | StepEvent::Fault => StopReason::Halted,
            };
        }

        let target = ip.wrapping_add(1);
        let mut depth: u32 = 0;
        let mut seen: usize = self.trace.len();
        self.run_while(move |sim| {
            // Fold in the steps executed since the last check.
            for entry in &sim.trace[seen..] {
                let opcode = sim.program.instructions
                    .get(usize::from(entry.instruction_address))
                    .map(|instr| instr.opcode);
                match opcode {
                    Some(Opcode::CALL) => depth += 1,
                    Some(Opcode::RET)  => depth = depth.saturating_sub(1),
                    _ => {}
                }
            }
            seen = sim.trace.len();

            !(depth == 0 && sim.state().regs.ip == target)
        })
    }

    /// Truncates the timeline down to the cursor, abandoning any future.
    fn rewind_branch(&mut self) {
        if !self.at_tip() {
            self.snapshots.truncate(self.cursor + 1);
            self.trace.truncate(self.snapshots[self.cursor].trace_len);
        }
    }

    /// Halts the machine at the cursor in place, without a trace entry.
    ///
    /// Used for conditions that are not an instruction's doing: a fetch
    /// from outside the program, or the step cap.
    fn mark_fault(&mut self, message: String) {
        let state = &mut self.snapshots[self.cursor].state;
        state.halted = true;
        state.error = Some(message);
    }

    fn elapsed_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }
}

fn capture_output(state: &CpuState, instr: &crate::asm::Instruction) -> Vec<OutputEvent> {
    match (instr.opcode, instr.operands.first()) {
        (Opcode::OUT, Some(Operand::Reg(r)))  => vec![OutputEvent::Number(state.regs[*r])],
        (Opcode::OUTC, Some(Operand::Reg(r))) => vec![OutputEvent::Char((state.regs[*r] & 0xFF) as u8)],
        _ => vec![],
    }
}

/// Determines the word addresses an instruction reads and writes, from its
/// opcode and operands alone (plus the pre-state for effective addresses).
fn access_sets(
    state: &CpuState,
    instr: &crate::asm::Instruction,
    config: &CoreConfig,
) -> (Vec<u16>, Vec<u16>) {
    use Opcode::*;

    let mut reads = BTreeSet::new();
    let mut writes = BTreeSet::new();
    let sp = state.regs[Reg::Sp];

    let mem_addr = |op: Option<&Operand>| match op {
        Some(Operand::Mem(m)) => Some(effective_addr(&state.regs, m)),
        _ => None,
    };
    let imm = |op: Option<&Operand>| match op {
        Some(Operand::Imm(i)) => Some(*i),
        _ => None,
    };

    match instr.opcode {
        MOV => {
            reads.extend(mem_addr(instr.operands.get(1)));
            writes.extend(mem_addr(instr.operands.first()));
        }
        ADD | ADC | SUB | SBB | CMP | AND | OR | XOR => {
            reads.extend(mem_addr(instr.operands.get(1)));
        }
        MUL | DIV | MOD => {
            reads.extend(mem_addr(instr.operands.first()));
        }
        PUSH => {
            reads.extend(mem_addr(instr.operands.first()));
            writes.insert(sp.wrapping_sub(2));
        }
        POP => {
            reads.insert(sp);
            writes.extend(mem_addr(instr.operands.first()));
        }
        CALL => {
            writes.insert(sp.wrapping_sub(2));
        }
        RET => {
            reads.insert(sp);
        }
        INT => {
            if let Some(vector) = imm(instr.operands.first()) {
                reads.insert(vector_addr(vector));
            }
            writes.insert(sp.wrapping_sub(2));
            writes.insert(sp.wrapping_sub(4));
        }
        IRET => {
            reads.insert(sp);
            reads.insert(sp.wrapping_add(2));
        }
        IN => {
            if let Some(port) = imm(instr.operands.get(1)) {
                reads.insert(config.port_base.wrapping_add(port.wrapping_mul(2)));
            }
        }
        OUTP => {
            if let Some(port) = imm(instr.operands.first()) {
                writes.insert(config.port_base.wrapping_add(port.wrapping_mul(2)));
            }
        }
        _ => {}
    }

    (reads.into_iter().collect(), writes.into_iter().collect())
}

fn diff_registers(before: &CpuState, after: &CpuState) -> Vec<String> {
    let mut changed = Vec::new();
    for reg in Reg::ALL {
        if before.regs[reg] != after.regs[reg] {
            changed.push(reg.name().to_string());
        }
    }
    if before.regs.ip != after.regs.ip {
        changed.push("IP".to_string());
    }
    if before.regs.flags != after.regs.flags {
        changed.push("FLAGS".to_string());
    }
    changed
}

fn diff_flags(before: &CpuState, after: &CpuState) -> Vec<String> {
    Flag::ALL.iter()
        .filter(|&&flag| before.regs.flags.get(flag) != after.regs.flags.get(flag))
        .map(|flag| flag.name().to_string())
        .collect()
}

fn diff_memory(before: &CpuState, after: &CpuState, cap: usize) -> Vec<u16> {
    let mut words = Vec::new();
    let mut last: Option<u16> = None;

    for (i, (b, a)) in before.mem.bytes().iter().zip(after.mem.bytes()).enumerate() {
        if b != a {
            let word = (i & !1) as u16;
            if last != Some(word) {
                if words.len() == cap {
                    break;
                }
                words.push(word);
                last = Some(word);
            }
        }
    }
    words
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::sim::debug::{AccessKind, Watchpoint};
    use crate::sim::io::numbers;

    fn countdown() -> Program {
        assemble("
    MOV AX, 3
LOOP:
    OUT AX
    DEC AX
    JNZ LOOP
    HLT
        ")
    }

    #[test]
    fn snapshots_track_trace() {
        let mut sim = Simulator::new(countdown());
        assert_eq!(sim.snapshots().len(), 1);
        for _ in 0..4 {
            assert_eq!(sim.step_into(), StepEvent::Stepped);
        }
        assert_eq!(sim.snapshots().len(), 5);
        assert_eq!(sim.trace().len(), 4);
        for (i, entry) in sim.trace().iter().enumerate() {
            assert_eq!(entry.step, i + 1);
            assert_eq!(sim.snapshots()[i + 1].trace_len, i + 1);
        }
    }

    #[test]
    fn run_to_halt_collects_output() {
        let mut sim = Simulator::new(countdown());
        assert_eq!(sim.resume(), StopReason::Halted);
        assert_eq!(numbers(sim.output()), [3, 2, 1]);
        assert!(sim.state().halted);
        assert_eq!(sim.state().error, None);
    }

    #[test]
    fn halted_machine_is_frozen() {
        let mut sim = Simulator::new(countdown());
        sim.resume();
        let snapshots = sim.snapshots().len();
        assert_eq!(sim.step_into(), StepEvent::Idle);
        assert_eq!(sim.resume(), StopReason::Halted);
        assert_eq!(sim.snapshots().len(), snapshots);
    }

    #[test]
    fn breakpoint_pauses_before_address() {
        let mut sim = Simulator::new(countdown());
        sim.breakpoints.insert(2); // DEC AX
        assert_eq!(sim.resume(), StopReason::Breakpoint);
        assert_eq!(sim.state().regs.ip, 2);
        assert_eq!(sim.trace().len(), 2);

        // Resuming from the breakpoint makes progress before re-checking.
        assert_eq!(sim.resume(), StopReason::Breakpoint);
        assert_eq!(sim.state().regs.ip, 2);
        assert!(sim.trace().len() > 2);
    }

    #[test]
    fn step_over_runs_through_calls() {
        let program = assemble("
    MOV AX, 1
    CALL DOUBLE
    OUT AX
    HLT
DOUBLE:
    ADD AX, AX
    CALL NOTHING
    RET
NOTHING:
    RET
        ");
        let mut sim = Simulator::new(program);
        sim.step_into(); // MOV
        assert_eq!(sim.state().regs.ip, 1);
        assert_eq!(sim.step_over(), StopReason::Done);
        // The whole call (including the nested one) ran as one step.
        assert_eq!(sim.state().regs.ip, 2);
        assert_eq!(sim.state().regs[Reg::Ax], 2);
    }

    #[test]
    fn step_over_plain_instruction_is_one_step() {
        let mut sim = Simulator::new(countdown());
        assert_eq!(sim.step_over(), StopReason::Done);
        assert_eq!(sim.trace().len(), 1);
    }

    #[test]
    fn step_cap_halts_with_error() {
        let program = assemble("LOOP:\nJMP LOOP\nHLT");
        let config = CoreConfig { max_steps_per_continue: 50, ..Default::default() };
        let mut sim = Simulator::with_config(program, config);
        assert_eq!(sim.resume(), StopReason::StepCap);
        assert!(sim.state().halted);
        assert_eq!(sim.state().error.as_deref(), Some(STEP_CAP_MSG));
        assert_eq!(sim.trace().len(), 50);
    }

    #[test]
    fn watchpoint_pauses_after_matching_step() {
        let program = assemble("
    MOV AX, 1
    MOV [0x0200], AX
    MOV AX, 2
    HLT
        ");
        let mut sim = Simulator::new(program);
        sim.watchpoints.insert(Watchpoint { addr: 0x0200, size: 2, kind: AccessKind::Write });
        assert_eq!(sim.resume(), StopReason::Watchpoint);
        assert_eq!(sim.trace().len(), 2);
        assert_eq!(sim.state().regs[Reg::Ax], 1);
        // Resuming continues past the match.
        assert_eq!(sim.resume(), StopReason::Halted);
    }

    #[test]
    fn seek_and_branch_truncate() {
        let mut sim = Simulator::new(countdown());
        sim.resume();
        let total = sim.snapshots().len();
        assert!(total > 4);

        assert!(sim.seek(2));
        assert_eq!(sim.cursor(), 2);
        assert!(!sim.at_tip());
        // Seeking alone destroys nothing.
        assert_eq!(sim.snapshots().len(), total);

        // Stepping from the rewound cursor truncates the future.
        assert_eq!(sim.step_into(), StepEvent::Stepped);
        assert_eq!(sim.snapshots().len(), 4);
        assert_eq!(sim.trace().len(), 3);
        assert!(sim.at_tip());
    }

    #[test]
    fn step_back_moves_cursor_only() {
        let mut sim = Simulator::new(countdown());
        sim.step_into();
        sim.step_into();
        assert!(sim.step_back());
        assert_eq!(sim.cursor(), 1);
        assert_eq!(sim.snapshots().len(), 3);
        assert!(sim.step_back());
        assert!(!sim.step_back());
    }

    #[test]
    fn replayed_timeline_is_identical() {
        // Run 7 steps, rewind to 3, step forward 4: states must match the
        // straight run byte for byte.
        let mut straight = Simulator::new(countdown());
        let mut rewound = Simulator::new(countdown());
        for _ in 0..5 {
            straight.step_into();
            rewound.step_into();
        }
        let expected = straight.state().clone();

        rewound.seek(2);
        for _ in 0..3 {
            rewound.step_into();
        }
        assert_eq!(rewound.state(), &expected);
        assert_eq!(rewound.state().mem.bytes(), expected.mem.bytes());
    }

    #[test]
    fn trace_diffs_match_state_changes() {
        let program = assemble("
    MOV AX, 5
    ADD AX, 0xFFFF
    MOV [0x0100], AX
    HLT
        ");
        let mut sim = Simulator::new(program);
        sim.resume();

        let trace = sim.trace();
        // MOV AX: AX and IP changed, flags untouched.
        assert_eq!(trace[0].changed_registers, ["AX", "IP"]);
        assert!(trace[0].changed_flags.is_empty());
        // ADD changed FLAGS too.
        assert!(trace[1].changed_registers.contains(&"FLAGS".to_string()));
        assert!(trace[1].changed_flags.contains(&"CF".to_string()));
        // The store shows up in writes and in the changed-memory diff.
        assert_eq!(trace[2].memory_writes, [0x0100]);
        assert_eq!(trace[2].changed_memory_words, [0x0100]);
        assert!(trace[2].memory_reads.is_empty());
    }

    #[test]
    fn stack_ops_report_implicit_slots() {
        let program = assemble("PUSH AX\nPOP BX\nHLT");
        let mut sim = Simulator::new(program);
        sim.resume();

        let trace = sim.trace();
        assert_eq!(trace[0].memory_writes, [4092]);
        assert_eq!(trace[1].memory_reads, [4092]);
    }

    #[test]
    fn out_records_before_execution() {
        let program = assemble("OUT AX\nHLT");
        let mut sim = Simulator::new(program);
        sim.step_into();
        assert_eq!(sim.trace()[0].output, [OutputEvent::Number(0)]);
    }

    #[test]
    fn runtime_error_freezes_but_allows_reset() {
        let program = assemble("
    MOV AX, 9
    MOV SP, 0x2000
    POP BX
    HLT
        ");
        let mut sim = Simulator::new(program);
        sim.breakpoints.insert(1);
        assert_eq!(sim.resume(), StopReason::Breakpoint);
        assert_eq!(sim.resume(), StopReason::Halted);
        assert!(sim.state().halted);
        assert!(sim.state().error.is_some());

        // A halted program can still be stepped back and reset.
        assert!(sim.step_back());
        sim.reset();
        assert_eq!(sim.snapshots().len(), 1);
        assert_eq!(sim.trace().len(), 0);
        assert!(!sim.state().halted);
        // Breakpoints survive the reset.
        assert!(sim.breakpoints.contains(&1));
        assert_eq!(sim.resume(), StopReason::Breakpoint);
    }

    #[test]
    fn perf_accumulates() {
        let mut sim = Simulator::new(countdown());
        sim.resume();
        let perf = sim.perf();
        assert_eq!(perf.instructions_executed, sim.trace().len() as u64);
        let expected: u64 = sim.trace().iter().map(|e| u64::from(e.cycles)).sum();
        assert_eq!(perf.total_cycles, expected);
        assert!(perf.simulated_load > 0.0 && perf.simulated_load <= 100.0);
    }

    #[test]
    fn fetch_fault_freezes_machine() {
        let program = assemble("JMP 99\nHLT");
        let mut sim = Simulator::new(program);
        assert_eq!(sim.step_into(), StepEvent::Stepped);
        assert_eq!(sim.step_into(), StepEvent::Fault);
        assert!(sim.state().halted);
        assert!(sim.state().error.as_deref().unwrap().contains("out of range"));
    }
}
