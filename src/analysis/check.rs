//! The assertion mini-language for checking final machine states.
//!
//! Line-oriented; comments begin with `#` or `;`. Statements:
//!
//! ```text
//! REG AX = 55        ; register equals literal (mod 2^16)
//! MEM [0x0100] = 9   ; word at address equals literal
//! OUT 42             ; the numeric output sequence contains 42
//! HALTED true        ; halt state
//! ```
//!
//! Literal forms are the same as the lexer's numbers. Checks never panic:
//! a malformed line becomes a failed [`CheckOutcome`] with a message.

use crate::asm::parse_imm;
use crate::sim::cpu::CpuState;
use crate::sim::io::{numbers, OutputEvent};
use crate::sim::mem::Reg;

/// The result of one script line.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CheckOutcome {
    /// 1-based script line.
    pub line: usize,
    /// The line's text, trimmed.
    pub text: String,
    /// Whether the check held.
    pub passed: bool,
    /// What actually happened (for failures and malformed lines).
    pub detail: Option<String>,
}

/// The result of running a whole script.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct CheckReport {
    /// One outcome per non-blank, non-comment line.
    pub outcomes: Vec<CheckOutcome>,
}
impl CheckReport {
    /// Whether every check held.
    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    /// The failed outcomes.
    pub fn failures(&self) -> impl Iterator<Item = &CheckOutcome> {
        self.outcomes.iter().filter(|o| !o.passed)
    }
}

/// Runs an assertion script against a final state and its output.
///
/// # Example
/// ```
/// use micro86::analysis::check::run_script;
/// use micro86::asm::assemble;
/// use micro86::sim::Simulator;
///
/// let mut sim = Simulator::new(assemble("MOV AX, 55\nOUT AX\nHLT"));
/// sim.resume();
///
/// let report = run_script("
///     REG AX = 55
///     OUT 55
///     HALTED true
/// ", sim.state(), sim.output());
/// assert!(report.passed());
/// ```
pub fn run_script(script: &str, state: &CpuState, output: &[OutputEvent]) -> CheckReport {
    let out_numbers = numbers(output);
    let mut report = CheckReport::default();

    for (lineno, raw) in script.lines().enumerate() {
        let lineno = lineno + 1;
        let text = raw.split(['#', ';']).next().unwrap_or("").trim();
        if text.is_empty() {
            continue;
        }

        let (passed, detail) = match eval_line(text, state, &out_numbers) {
            Ok(None) => (true, None),
            Ok(Some(actual)) => (false, Some(actual)),
            Err(message) => (false, Some(message)),
        };
        report.outcomes.push(CheckOutcome { line: lineno, text: text.to_string(), passed, detail });
    }
    report
}

/// Evaluates one statement. `Ok(None)` = held, `Ok(Some(actual))` =
/// failed with the observed value, `Err` = malformed line.
fn eval_line(text: &str, state: &CpuState, out_numbers: &[u16]) -> Result<Option<String>, String> {
    let mut parts = text.split_whitespace();
    let keyword = parts.next().unwrap_or("").to_uppercase();
    let rest: Vec<&str> = parts.collect();

    match keyword.as_str() {
        "REG" => {
            let (name, value) = parse_equality(&rest)?;
            let actual = read_register(state, &name)?;
            Ok((actual != value).then(|| format!("{name} is {actual}")))
        }
        "MEM" => {
            let (addr_text, value) = parse_equality(&rest)?;
            let inner = addr_text.strip_prefix('[')
                .and_then(|t| t.strip_suffix(']'))
                .ok_or_else(|| "expected MEM [address] = value".to_string())?;
            let addr = parse_imm(inner).ok_or_else(|| format!("bad address '{inner}'"))?;
            let actual = state.mem.read_word(addr).map_err(|e| e.to_string())?;
            Ok((actual != value).then(|| format!("word at [{inner}] is {actual}")))
        }
        "OUT" => {
            let literal = rest.first().ok_or_else(|| "expected OUT value".to_string())?;
            let value = parse_imm(literal).ok_or_else(|| format!("bad literal '{literal}'"))?;
            Ok((!out_numbers.contains(&value))
                .then(|| format!("output was {out_numbers:?}")))
        }
        "HALTED" => {
            let expected = match rest.first().map(|s| s.to_lowercase()).as_deref() {
                Some("true") => true,
                Some("false") => false,
                _ => return Err("expected HALTED true|false".to_string()),
            };
            Ok((state.halted != expected).then(|| format!("halted is {}", state.halted)))
        }
        other => Err(format!("unknown check '{other}'")),
    }
}

/// Splits `NAME = literal` operands (the `=` may be glued or spaced).
fn parse_equality(rest: &[&str]) -> Result<(String, u16), String> {
    let joined = rest.join(" ");
    let (lhs, rhs) = joined.split_once('=')
        .ok_or_else(|| "expected '='".to_string())?;
    let value = parse_imm(rhs.trim())
        .ok_or_else(|| format!("bad literal '{}'", rhs.trim()))?;
    Ok((lhs.trim().to_uppercase(), value))
}

fn read_register(state: &CpuState, name: &str) -> Result<u16, String> {
    if let Some(reg) = Reg::parse(name) {
        return Ok(state.regs[reg]);
    }
    match name {
        "IP" => Ok(state.regs.ip),
        "FLAGS" => Ok(state.regs.flags.0),
        _ => Err(format!("unknown register '{name}'")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asm::assemble;
    use crate::sim::Simulator;

    fn final_state() -> Simulator {
        let mut sim = Simulator::new(assemble("
    MOV AX, 55
    MOV [0x0100], AX
    OUT AX
    HLT
        "));
        sim.resume();
        sim
    }

    #[test]
    fn passing_script() {
        let sim = final_state();
        let report = run_script("
# everything about the final state
REG AX = 55
REG BX = 0
MEM [0x0100] = 55   ; the stored copy
OUT 55
HALTED true
        ", sim.state(), sim.output());
        assert!(report.passed(), "failures: {:?}", report.failures().collect::<Vec<_>>());
        assert_eq!(report.outcomes.len(), 5);
    }

    #[test]
    fn failures_carry_actuals() {
        let sim = final_state();
        let report = run_script("REG AX = 54\nOUT 1\nHALTED false", sim.state(), sim.output());
        assert!(!report.passed());
        let failures: Vec<_> = report.failures().collect();
        assert_eq!(failures.len(), 3);
        assert_eq!(failures[0].detail.as_deref(), Some("AX is 55"));
    }

    #[test]
    fn literal_forms() {
        let sim = final_state();
        let report = run_script("
REG AX = 0x37
REG AX = 37h
REG AX = 0b110111
        ", sim.state(), sim.output());
        assert!(report.passed());
    }

    #[test]
    fn malformed_lines_fail_gracefully() {
        let sim = final_state();
        let report = run_script("
REG AX 55
MEM 0x0100 = 9
FROB 1
HALTED maybe
        ", sim.state(), sim.output());
        assert_eq!(report.outcomes.len(), 4);
        assert!(report.outcomes.iter().all(|o| !o.passed));
        assert!(report.outcomes[2].detail.as_deref().unwrap().contains("FROB"));
    }

    #[test]
    fn ip_and_flags_are_checkable() {
        let sim = final_state();
        // HLT leaves IP at its own index.
        let report = run_script("REG IP = 3", sim.state(), sim.output());
        assert!(report.passed());
    }
}
