//! End-to-end scenarios: source programs and assembly programs run to
//! completion, with the decisive observations checked on output, final
//! state, and the recorded timeline.

use micro86::asm::assemble;
use micro86::pipeline::build;
use micro86::replay::{export_session, import_session};
use micro86::sim::cpu::execute;
use micro86::sim::io::numbers;
use micro86::sim::mem::{Flag, Reg};
use micro86::sim::{Simulator, StopReason};

const COUNTDOWN_SRC: &str = "
x = 10
while x > 0
  print x
  x = x - 1
end
print 0
";

fn build_sim(source: &str) -> Simulator {
    let output = build(source);
    let program = output.program.unwrap_or_else(|| {
        panic!("build failed: {:?}", output.stages);
    });
    Simulator::new(program)
}

fn asm_sim(asm: &str) -> Simulator {
    let program = assemble(asm);
    assert!(!program.has_errors(), "assembly diagnostics: {:?}", program.diagnostics);
    Simulator::new(program)
}

#[test]
fn scenario_a_countdown_print() {
    let mut sim = build_sim(COUNTDOWN_SRC);
    assert_eq!(sim.resume(), StopReason::Halted);

    assert_eq!(numbers(sim.output()), [10, 9, 8, 7, 6, 5, 4, 3, 2, 1, 0]);
    assert!(sim.state().halted);
    assert_eq!(sim.state().error, None);
}

#[test]
fn scenario_b_sum_in_assembly() {
    let mut sim = asm_sim("
    MOV AX, 10
    MOV BX, 0
LOOP:
    ADD BX, AX
    DEC AX
    JNZ LOOP
    OUT BX
    HLT
    ");
    sim.resume();

    assert!(numbers(sim.output()).contains(&55));
    assert_eq!(sim.state().regs[Reg::Ax], 0);
    assert_eq!(sim.state().regs[Reg::Bx], 55);
    assert!(sim.state().regs.flags.get(Flag::Zf));
}

#[test]
fn scenario_c_memory_swap() {
    let mut sim = asm_sim("
    MOV AX, 3
    MOV [0x0100], AX
    MOV AX, 9
    MOV [0x0102], AX
    MOV AX, [0x0100]
    MOV BX, [0x0102]
    MOV [0x0100], BX
    MOV [0x0102], AX
    HLT
    ");
    sim.resume();

    let mem = &sim.state().mem;
    assert_eq!(mem.read_word(0x0100).unwrap(), 9);
    assert_eq!(mem.read_word(0x0102).unwrap(), 3);
}

#[test]
fn scenario_d_division_with_remainder() {
    let mut sim = asm_sim("
    MOV DX, 0
    MOV AX, 100
    MOV BX, 7
    DIV BX
    OUT AX
    OUT DX
    HLT
    ");
    sim.resume();

    assert_eq!(numbers(sim.output()), [14, 2]);
}

#[test]
fn scenario_e_interrupt_roundtrip() {
    let mut sim = asm_sim("
    MOV AX, ISR
    MOV [0x0002], AX
    INT 1
    OUT AX
    HLT
ISR:
    MOV AX, 123
    IRET
    ");

    // Capture FLAGS and the would-be return IP just before the INT.
    sim.step_into();
    sim.step_into();
    let flags_before = sim.state().regs.flags;
    let return_ip = sim.state().regs.ip + 1;

    sim.resume();

    assert!(numbers(sim.output()).contains(&123));
    assert_eq!(sim.state().regs.flags, flags_before);

    // The IRET step restored IP to the instruction after the INT.
    let iret = sim.trace().iter()
        .find(|e| e.instruction_text.starts_with("IRET"))
        .expect("IRET never executed");
    assert_eq!(iret.ip_after, return_ip);
}

#[test]
fn scenario_f_time_travel_consistency() {
    let mut straight = build_sim(COUNTDOWN_SRC);
    for _ in 0..7 {
        straight.step_into();
    }

    let mut rewound = build_sim(COUNTDOWN_SRC);
    for _ in 0..7 {
        rewound.step_into();
    }
    rewound.seek(3);
    for _ in 0..4 {
        rewound.step_into();
    }

    assert_eq!(rewound.state(), straight.state());
    assert_eq!(rewound.state().mem.bytes(), straight.state().mem.bytes());
}

// ---- universal invariants ----

#[test]
fn snapshot_chain_replays_through_execute() {
    let mut sim = build_sim(COUNTDOWN_SRC);
    for _ in 0..20 {
        sim.step_into();
    }

    let snapshots = sim.snapshots();
    let trace = sim.trace();
    assert_eq!(snapshots.len(), trace.len() + 1);

    let program = sim.program();
    for window in snapshots.windows(2) {
        let before = &window[0].state;
        let instr = &program.instructions[usize::from(before.regs.ip)];
        let replayed = execute(before, instr, &program.labels);
        assert_eq!(replayed, window[1].state);
    }
}

#[test]
fn trace_diffs_equal_snapshot_diffs() {
    let mut sim = build_sim(COUNTDOWN_SRC);
    sim.resume();

    let snapshots = sim.snapshots();
    for entry in sim.trace() {
        let before = &snapshots[entry.step - 1].state;
        let after = &snapshots[entry.step].state;

        let mut expected_regs = Vec::new();
        for reg in Reg::ALL {
            if before.regs[reg] != after.regs[reg] {
                expected_regs.push(reg.name().to_string());
            }
        }
        if before.regs.ip != after.regs.ip {
            expected_regs.push("IP".to_string());
        }
        if before.regs.flags != after.regs.flags {
            expected_regs.push("FLAGS".to_string());
        }
        assert_eq!(entry.changed_registers, expected_regs, "at step {}", entry.step);

        let expected_flags: Vec<String> = Flag::ALL.iter()
            .filter(|&&f| before.regs.flags.get(f) != after.regs.flags.get(f))
            .map(|f| f.name().to_string())
            .collect();
        assert_eq!(entry.changed_flags, expected_flags, "at step {}", entry.step);
    }
}

#[test]
fn push_pop_is_word_faithful() {
    let mut sim = asm_sim("
    MOV AX, 0xABCD
    PUSH AX
    POP BX
    HLT
    ");
    sim.step_into();
    let mem_before = sim.state().mem.bytes().to_vec();
    let sp_before = sim.state().regs[Reg::Sp];

    sim.step_into(); // PUSH
    sim.step_into(); // POP

    assert_eq!(sim.state().regs[Reg::Bx], 0xABCD);
    assert_eq!(sim.state().regs[Reg::Sp], sp_before);

    // Memory is byte-identical except possibly the two stack bytes.
    let stack_slot = usize::from(sp_before) - 2;
    for (i, (b, a)) in mem_before.iter().zip(sim.state().mem.bytes()).enumerate() {
        if i == stack_slot || i == stack_slot + 1 {
            continue;
        }
        assert_eq!(b, a, "byte 0x{i:04X} changed");
    }
}

#[test]
fn mov_then_read_back() {
    let mut sim = asm_sim("STC\nMOV CX, 0x1234\nHLT");
    sim.step_into();
    let flags_before = sim.state().regs.flags;
    sim.step_into();
    assert_eq!(sim.state().regs[Reg::Cx], 0x1234);
    assert_eq!(sim.state().regs.flags, flags_before);
}

#[test]
fn reruns_are_deterministic() {
    let run = || {
        let mut sim = build_sim(COUNTDOWN_SRC);
        sim.resume();
        (
            sim.state().clone(),
            numbers(sim.output()),
            sim.trace().len(),
        )
    };

    let (state_a, out_a, len_a) = run();
    let (state_b, out_b, len_b) = run();
    assert_eq!(state_a, state_b);
    assert_eq!(state_a.mem.bytes(), state_b.mem.bytes());
    assert_eq!(out_a, out_b);
    assert_eq!(len_a, len_b);
}

#[test]
fn exported_session_reimports_equal() {
    let output = build(COUNTDOWN_SRC);
    let mut sim = Simulator::new(output.program.unwrap());
    sim.breakpoints.insert(4);
    for _ in 0..9 {
        sim.step_into();
    }

    let payload = export_session(&sim, COUNTDOWN_SRC, &output.asm_code, &[]);
    let imported = import_session(&payload).expect("import failed");

    assert_eq!(imported.simulator.trace(), sim.trace());
    assert_eq!(imported.simulator.snapshots(), sim.snapshots());
    assert_eq!(imported.simulator.breakpoints, sim.breakpoints);
    assert_eq!(imported.source_code, COUNTDOWN_SRC);
}

// ---- flag laws ----

fn run_asm(asm: &str) -> Simulator {
    let mut sim = asm_sim(asm);
    sim.resume();
    sim
}

#[test]
fn cmp_flags_match_sub() {
    for (a, b) in [(5u16, 9u16), (9, 5), (7, 7), (0x8000, 1), (0, 0xFFFF)] {
        let cmp = run_asm(&format!("MOV AX, {a}\nCMP AX, {b}\nHLT"));
        let sub = run_asm(&format!("MOV AX, {a}\nSUB AX, {b}\nHLT"));
        assert_eq!(cmp.state().regs.flags, sub.state().regs.flags, "flags for {a} ? {b}");
        assert_eq!(cmp.state().regs[Reg::Ax], a, "CMP must not write");
    }
}

#[test]
fn sub_of_equals_clears_cf_sf_of_sets_zf() {
    let sim = run_asm("MOV AX, 1234\nSUB AX, 1234\nHLT");
    let flags = sim.state().regs.flags;
    assert!(flags.get(Flag::Zf));
    assert!(!flags.get(Flag::Cf));
    assert!(!flags.get(Flag::Sf));
    assert!(!flags.get(Flag::Of));
}

#[test]
fn add_8000_8000_flag_pattern() {
    let sim = run_asm("MOV AX, 0x8000\nADD AX, 0x8000\nHLT");
    let flags = sim.state().regs.flags;
    assert!(flags.get(Flag::Cf));
    assert!(flags.get(Flag::Of));
    assert!(flags.get(Flag::Zf));
    assert!(!flags.get(Flag::Sf));
}

#[test]
fn shl_by_one_carries_old_msb() {
    for value in [0x8001u16, 0x4000, 0xC000, 0x0001] {
        let sim = run_asm(&format!("MOV AX, 0x{value:04X}\nSHL AX, 1\nHLT"));
        let flags = sim.state().regs.flags;
        let msb_before = value & 0x8000 != 0;
        let msb_after = (value << 1) & 0x8000 != 0;
        assert_eq!(flags.get(Flag::Cf), msb_before, "CF for 0x{value:04X}");
        assert_eq!(flags.get(Flag::Of), msb_before != msb_after, "OF for 0x{value:04X}");
    }
}

#[test]
fn inc_dec_leave_carry_alone() {
    let sim = run_asm("STC\nMOV AX, 0xFFFF\nINC AX\nHLT");
    assert!(sim.state().regs.flags.get(Flag::Cf));
    assert!(sim.state().regs.flags.get(Flag::Zf));

    let sim = run_asm("CLC\nMOV AX, 0\nDEC AX\nHLT");
    assert!(!sim.state().regs.flags.get(Flag::Cf));
    assert!(sim.state().regs.flags.get(Flag::Sf));
}
