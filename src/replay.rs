//! Saving and restoring debugging sessions.
//!
//! A replay session is a structured text payload holding the whole
//! timeline: trace, snapshots, breakpoints, and the original source and
//! assembly. Export is a plain serde serialization; import is
//! deliberately lenient, because payloads may come from older versions or
//! foreign tools:
//! - unknown fields are tolerated,
//! - every numeric field is masked to 16 bits,
//! - memory may arrive as a byte array, a sparse index map, or a
//!   comma-separated byte string, and is normalized to the machine size,
//! - the program itself is never trusted from the payload: it is
//!   reassembled from `asm_code` (or recompiled from `source_code` when
//!   the assembly is absent or broken).

use std::collections::BTreeSet;

use serde_json::Value;

use crate::asm::assemble;
use crate::pipeline::build;
use crate::sim::cpu::CpuState;
use crate::sim::io::OutputEvent;
use crate::sim::mem::{Flags, Mem, Reg, RegFile};
use crate::sim::{CoreConfig, PerfStats, Simulator, Snapshot, TraceEntry};

/// The payload version this crate writes.
///
/// Unknown versions are accepted on import with a best-effort decode.
pub const REPLAY_VERSION: &str = "1.0.0";

/// Errors that fail a replay import.
///
/// Everything else is decoded best-effort.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ReplayErr {
    /// The payload is not a JSON object.
    NotAnObject,
    /// A required sequence field is absent or not a sequence.
    MissingField(&'static str),
    /// Neither the embedded assembly nor the embedded source produces a
    /// runnable program.
    BadProgram,
}
impl std::fmt::Display for ReplayErr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReplayErr::NotAnObject     => f.write_str("replay payload is not an object"),
            ReplayErr::MissingField(s) => write!(f, "replay payload field '{s}' is missing or not a sequence"),
            ReplayErr::BadProgram      => f.write_str("embedded source does not reassemble"),
        }
    }
}
impl std::error::Error for ReplayErr {}
impl crate::err::Error for ReplayErr {
    fn help(&self) -> Option<std::borrow::Cow<str>> {
        match self {
            ReplayErr::NotAnObject     => Some("the payload should be the JSON object produced by export_session".into()),
            ReplayErr::MissingField(_) => Some("'trace', 'snapshots', and 'breakpoints' are required sequences".into()),
            ReplayErr::BadProgram      => Some("check 'asm_code' (or 'source_code') for assembler errors".into()),
        }
    }
}

#[derive(serde::Serialize)]
struct SessionOut<'a> {
    version: &'a str,
    created_at_ms: u64,
    trace: &'a [TraceEntry],
    snapshots: &'a [Snapshot],
    saved_snapshots: &'a [Snapshot],
    breakpoints: &'a BTreeSet<u16>,
    source_code: &'a str,
    asm_code: &'a str,
}

/// A successfully imported session.
#[derive(Debug)]
pub struct ImportedSession {
    /// A simulator positioned at the end of the recorded timeline.
    pub simulator: Simulator,
    /// The payload's version string.
    pub version: String,
    /// When the payload was exported (wall clock, ms since the epoch).
    pub created_at_ms: u64,
    /// User-pinned snapshots carried alongside the timeline.
    pub saved_snapshots: Vec<Snapshot>,
    /// The embedded source code.
    pub source_code: String,
    /// The embedded assembly code.
    pub asm_code: String,
}

/// Serializes a session to its textual payload.
///
/// # Example
/// ```
/// use micro86::pipeline::build;
/// use micro86::replay::{export_session, import_session};
/// use micro86::sim::Simulator;
///
/// let source = "print 6 * 7";
/// let output = build(source);
/// let mut sim = Simulator::new(output.program.unwrap());
/// sim.resume();
///
/// let payload = export_session(&sim, source, &output.asm_code, &[]);
/// let imported = import_session(&payload).unwrap();
/// assert_eq!(imported.simulator.trace().len(), sim.trace().len());
/// ```
pub fn export_session(
    sim: &Simulator,
    source_code: &str,
    asm_code: &str,
    saved_snapshots: &[Snapshot],
) -> String {
    let session = SessionOut {
        version: REPLAY_VERSION,
        created_at_ms: wall_clock_ms(),
        trace: sim.trace(),
        snapshots: sim.snapshots(),
        saved_snapshots,
        breakpoints: &sim.breakpoints,
        source_code,
        asm_code,
    };
    serde_json::to_string_pretty(&session)
        .unwrap_or_else(|_| unreachable!("session serialization is infallible"))
}

/// Deserializes a session payload into a ready-to-use simulator.
///
/// Import fails only when the payload is not an object, when `trace`,
/// `snapshots`, or `breakpoints` is absent or not a sequence, or when the
/// embedded program cannot be rebuilt. Everything else decodes
/// best-effort.
pub fn import_session(payload: &str) -> Result<ImportedSession, ReplayErr> {
    let value: Value = serde_json::from_str(payload).map_err(|_| ReplayErr::NotAnObject)?;
    let obj = value.as_object().ok_or(ReplayErr::NotAnObject)?;

    let trace_val = obj.get("trace")
        .and_then(Value::as_array)
        .ok_or(ReplayErr::MissingField("trace"))?;
    let snapshots_val = obj.get("snapshots")
        .and_then(Value::as_array)
        .ok_or(ReplayErr::MissingField("snapshots"))?;
    let breakpoints_val = obj.get("breakpoints")
        .and_then(Value::as_array)
        .ok_or(ReplayErr::MissingField("breakpoints"))?;

    let source_code = str_field(obj.get("source_code"));
    let asm_code = str_field(obj.get("asm_code"));

    // The program is rebuilt, never trusted from the payload: assembly
    // first, source as the fallback.
    let program = rebuild_program(&asm_code, &source_code)?;

    let config = CoreConfig::default();
    let trace: Vec<TraceEntry> = trace_val.iter()
        .enumerate()
        .map(|(i, v)| decode_trace_entry(i, v))
        .collect();
    let snapshots: Vec<Snapshot> = snapshots_val.iter()
        .map(|v| decode_snapshot(v, &config))
        .collect();
    let saved_snapshots: Vec<Snapshot> = obj.get("saved_snapshots")
        .and_then(Value::as_array)
        .map(|arr| arr.iter().map(|v| decode_snapshot(v, &config)).collect())
        .unwrap_or_default();
    let breakpoints: BTreeSet<u16> = breakpoints_val.iter()
        .filter_map(as_word)
        .collect();

    let simulator = Simulator::restore(program, config, snapshots, trace, breakpoints);

    Ok(ImportedSession {
        simulator,
        version: obj.get("version")
            .and_then(Value::as_str)
            .unwrap_or("unknown")
            .to_string(),
        created_at_ms: obj.get("created_at_ms").and_then(Value::as_u64).unwrap_or(0),
        saved_snapshots,
        source_code,
        asm_code,
    })
}

fn rebuild_program(asm_code: &str, source_code: &str) -> Result<crate::asm::Program, ReplayErr> {
    if !asm_code.trim().is_empty() {
        let program = assemble(asm_code);
        if !program.has_errors() {
            return Ok(program);
        }
    }
    build(source_code).program.ok_or(ReplayErr::BadProgram)
}

fn wall_clock_ms() -> u64 {
    use std::time::{SystemTime, UNIX_EPOCH};

    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ---- lenient decoding helpers ----

/// Reads any JSON number as a word, masked to 16 bits.
fn as_word(v: &Value) -> Option<u16> {
    if let Some(u) = v.as_u64() {
        return Some((u & 0xFFFF) as u16);
    }
    if let Some(i) = v.as_i64() {
        return Some((i & 0xFFFF) as u16);
    }
    v.as_f64().map(|f| (f as i64 & 0xFFFF) as u16)
}

fn word_field(v: Option<&Value>) -> u16 {
    v.and_then(as_word).unwrap_or(0)
}

fn usize_field(v: Option<&Value>) -> usize {
    v.and_then(Value::as_u64).unwrap_or(0) as usize
}

fn str_field(v: Option<&Value>) -> String {
    v.and_then(Value::as_str).unwrap_or("").to_string()
}

fn word_list(v: Option<&Value>) -> Vec<u16> {
    v.and_then(Value::as_array)
        .map(|arr| arr.iter().filter_map(as_word).collect())
        .unwrap_or_default()
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn decode_output_event(v: &Value) -> Option<OutputEvent> {
    let obj = v.as_object()?;
    let value = word_field(obj.get("value"));
    match obj.get("type")?.as_str()? {
        "number" => Some(OutputEvent::Number(value)),
        "char"   => Some(OutputEvent::Char((value & 0xFF) as u8)),
        _ => None,
    }
}

fn decode_trace_entry(index: usize, v: &Value) -> TraceEntry {
    let empty = serde_json::Map::new();
    let obj = v.as_object().unwrap_or(&empty);

    TraceEntry {
        step: obj.get("step")
            .and_then(Value::as_u64)
            .map(|s| s as usize)
            .unwrap_or(index + 1),
        instruction_address: word_field(obj.get("instruction_address")),
        instruction_text: str_field(obj.get("instruction_text")),
        ip_before: word_field(obj.get("ip_before")),
        ip_after: word_field(obj.get("ip_after")),
        changed_registers: string_list(obj.get("changed_registers")),
        changed_flags: string_list(obj.get("changed_flags")),
        changed_memory_words: word_list(obj.get("changed_memory_words")),
        memory_reads: word_list(obj.get("memory_reads")),
        memory_writes: word_list(obj.get("memory_writes")),
        output: obj.get("output")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(decode_output_event).collect())
            .unwrap_or_default(),
        cycles: obj.get("cycles").and_then(Value::as_u64).unwrap_or(0) as u32,
        timestamp_ms: obj.get("timestamp_ms").and_then(Value::as_u64).unwrap_or(0),
    }
}

fn decode_snapshot(v: &Value, config: &CoreConfig) -> Snapshot {
    let empty = serde_json::Map::new();
    let obj = v.as_object().unwrap_or(&empty);

    Snapshot {
        state: decode_state(obj.get("state"), config),
        output: obj.get("output")
            .and_then(Value::as_array)
            .map(|arr| arr.iter().filter_map(decode_output_event).collect())
            .unwrap_or_default(),
        trace_len: usize_field(obj.get("trace_len")),
        perf: decode_perf(obj.get("perf")),
        created_at_ms: obj.get("created_at_ms").and_then(Value::as_u64).unwrap_or(0),
    }
}

fn decode_perf(v: Option<&Value>) -> PerfStats {
    let empty = serde_json::Map::new();
    let obj = v.and_then(Value::as_object).unwrap_or(&empty);

    PerfStats {
        instructions_executed: obj.get("instructions_executed").and_then(Value::as_u64).unwrap_or(0),
        total_cycles: obj.get("total_cycles").and_then(Value::as_u64).unwrap_or(0),
        simulated_load: obj.get("simulated_load").and_then(Value::as_f64).unwrap_or(0.0),
    }
}

fn decode_state(v: Option<&Value>, config: &CoreConfig) -> CpuState {
    let Some(obj) = v.and_then(Value::as_object) else {
        return CpuState::new(config);
    };

    CpuState {
        regs: decode_regs(obj.get("regs"), config),
        mem: decode_mem(obj.get("mem"), config),
        halted: obj.get("halted").and_then(Value::as_bool).unwrap_or(false),
        error: obj.get("error").and_then(Value::as_str).map(str::to_string),
    }
}

fn decode_regs(v: Option<&Value>, config: &CoreConfig) -> RegFile {
    let mut regs = RegFile::new(config.stack_top);
    let Some(obj) = v.and_then(Value::as_object) else {
        return regs;
    };

    if let Some(gp) = obj.get("gp").and_then(Value::as_array) {
        for (reg, value) in Reg::ALL.into_iter().zip(gp) {
            regs[reg] = as_word(value).unwrap_or(0);
        }
    }
    regs.ip = word_field(obj.get("ip"));
    regs.flags = Flags(word_field(obj.get("flags")));
    regs
}

/// Decodes memory from any of the accepted shapes and normalizes it to
/// the machine size (respecting trailing bytes past it).
fn decode_mem(v: Option<&Value>, config: &CoreConfig) -> Mem {
    let mut bytes = vec![0u8; config.memory_size_bytes];

    let mut put = |bytes: &mut Vec<u8>, index: usize, value: u8| {
        if index >= bytes.len() {
            bytes.resize(index + 1, 0);
        }
        bytes[index] = value;
    };

    match v {
        Some(Value::Array(arr)) => {
            for (i, b) in arr.iter().enumerate() {
                put(&mut bytes, i, (word_field(Some(b)) & 0xFF) as u8);
            }
        }
        Some(Value::Object(map)) => {
            for (key, b) in map {
                if let Ok(index) = key.parse::<usize>() {
                    put(&mut bytes, index, (word_field(Some(b)) & 0xFF) as u8);
                }
            }
        }
        Some(Value::String(s)) => {
            for (i, part) in s.split(',').enumerate() {
                if let Ok(value) = part.trim().parse::<i64>() {
                    put(&mut bytes, i, (value & 0xFF) as u8);
                }
            }
        }
        _ => {}
    }

    Mem::from_vec(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session_after(source: &str, steps: usize) -> (Simulator, String, String) {
        let output = build(source);
        let mut sim = Simulator::new(output.program.expect("build failed"));
        for _ in 0..steps {
            sim.step_into();
        }
        let payload = export_session(&sim, source, &output.asm_code, &[]);
        (sim, output.asm_code, payload)
    }

    #[test]
    fn round_trip_preserves_timeline() {
        let (sim, _, payload) = session_after("x = 3\nprint x * 2", 6);
        let imported = import_session(&payload).unwrap();

        assert_eq!(imported.version, REPLAY_VERSION);
        assert_eq!(imported.simulator.trace(), sim.trace());
        assert_eq!(imported.simulator.snapshots(), sim.snapshots());
        assert_eq!(imported.simulator.state(), sim.state());
    }

    #[test]
    fn imported_simulator_keeps_running() {
        let (mut sim, _, payload) = session_after("
x = 10
while x > 0
  print x
  x = x - 1
end
        ", 5);
        let mut imported = import_session(&payload).unwrap().simulator;

        sim.resume();
        imported.resume();
        assert_eq!(imported.state(), sim.state());
        assert_eq!(imported.output(), sim.output());
    }

    #[test]
    fn breakpoints_survive() {
        let output = build("print 1");
        let mut sim = Simulator::new(output.program.unwrap());
        sim.breakpoints.insert(3);
        sim.breakpoints.insert(1);
        let payload = export_session(&sim, "print 1", &output.asm_code, &[]);

        let imported = import_session(&payload).unwrap();
        assert_eq!(
            imported.simulator.breakpoints.iter().copied().collect::<Vec<_>>(),
            [1, 3]
        );
    }

    #[test]
    fn unknown_fields_and_versions_are_tolerated() {
        let payload = json!({
            "version": "9.9.9",
            "some_future_field": { "nested": true },
            "trace": [],
            "snapshots": [],
            "breakpoints": [],
            "asm_code": "HLT"
        });
        let imported = import_session(&payload.to_string()).unwrap();
        assert_eq!(imported.version, "9.9.9");
        assert_eq!(imported.simulator.snapshots().len(), 1);
    }

    #[test]
    fn numbers_are_masked_on_import() {
        let payload = json!({
            "version": "1.0.0",
            "trace": [],
            "snapshots": [{
                "state": {
                    "regs": { "gp": [0x1_0005, 0, 0, 0, 0, 0, 0, 0], "ip": -1, "flags": 0 },
                    "mem": [300, 1],
                    "halted": false
                },
                "trace_len": 0,
            }],
            "breakpoints": [0x2_0003],
            "asm_code": "HLT"
        });
        let imported = import_session(&payload.to_string()).unwrap();
        let state = imported.simulator.state();
        assert_eq!(state.regs[crate::sim::mem::Reg::Ax], 5);
        assert_eq!(state.regs.ip, 0xFFFF);
        assert_eq!(state.mem.read_byte(0).unwrap(), 300u16 as u8);
        assert!(imported.simulator.breakpoints.contains(&3));
    }

    #[test]
    fn sparse_and_string_memory_shapes() {
        let payload = json!({
            "trace": [],
            "snapshots": [
                { "state": { "mem": { "16": 255, "17": 1 } }, "trace_len": 0 },
                { "state": { "mem": "1, 2, 3" }, "trace_len": 0 },
            ],
            "breakpoints": [],
            "asm_code": "HLT"
        });
        let imported = import_session(&payload.to_string()).unwrap();
        let snaps = imported.simulator.snapshots();
        assert_eq!(snaps[0].state.mem.read_word(16).unwrap(), 0x01FF);
        assert_eq!(snaps[0].state.mem.len(), 4096);
        assert_eq!(snaps[1].state.mem.read_byte(2).unwrap(), 3);
    }

    #[test]
    fn oversized_memory_is_respected() {
        let mem: Vec<u8> = vec![7; 5000];
        let payload = json!({
            "trace": [],
            "snapshots": [{ "state": { "mem": mem }, "trace_len": 0 }],
            "breakpoints": [],
            "asm_code": "HLT"
        });
        let imported = import_session(&payload.to_string()).unwrap();
        let mem = &imported.simulator.snapshots()[0].state.mem;
        assert_eq!(mem.len(), 5000);
        assert_eq!(mem.read_byte(4999).unwrap(), 7);
    }

    #[test]
    fn asm_preferred_source_fallback() {
        // Broken assembly, valid source: the source wins.
        let payload = json!({
            "trace": [],
            "snapshots": [],
            "breakpoints": [],
            "asm_code": "FROB AX",
            "source_code": "print 5",
        });
        let imported = import_session(&payload.to_string()).unwrap();
        let mut sim = imported.simulator;
        sim.resume();
        assert_eq!(crate::sim::io::numbers(sim.output()), [5]);
    }

    #[test]
    fn import_failures() {
        // Not an object (or not JSON at all).
        assert_eq!(import_session("[1, 2]").err(), Some(ReplayErr::NotAnObject));
        assert_eq!(import_session("not json").err(), Some(ReplayErr::NotAnObject));

        // Required sequences absent or mistyped.
        let payload = json!({ "snapshots": [], "breakpoints": [] });
        assert_eq!(import_session(&payload.to_string()).err(), Some(ReplayErr::MissingField("trace")));
        let payload = json!({ "trace": [], "snapshots": "nope", "breakpoints": [] });
        assert_eq!(import_session(&payload.to_string()).err(), Some(ReplayErr::MissingField("snapshots")));

        // Neither assembly nor source rebuilds.
        let payload = json!({
            "trace": [], "snapshots": [], "breakpoints": [],
            "asm_code": "FROB", "source_code": "x = "
        });
        assert_eq!(import_session(&payload.to_string()).err(), Some(ReplayErr::BadProgram));
    }
}
