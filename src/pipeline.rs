//! The staged build driver: source text to a runnable [`Program`].
//!
//! Each stage runs to its defined stopping point and contributes an
//! ordered diagnostic list; an error in a stage stops the pipeline before
//! the next stage runs. Nothing here raises control-flow errors — callers
//! inspect the [`BuildOutput`].

use crate::asm::{assemble, Program};
use crate::codegen::generate_with_config;
use crate::err::{any_errors, Diagnostic, Stage};
use crate::parse::parse_tokens;
use crate::sim::CoreConfig;

/// Diagnostics from one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageReport {
    /// Which stage produced these.
    pub stage: Stage,
    /// The stage's diagnostics, in order.
    pub diagnostics: Vec<Diagnostic>,
}
impl StageReport {
    /// Whether this stage produced any error.
    pub fn failed(&self) -> bool {
        any_errors(&self.diagnostics)
    }
}

/// Everything the pipeline produced.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    /// One report per stage that ran, in pipeline order.
    pub stages: Vec<StageReport>,
    /// The generated assembly text (empty if the pipeline stopped before
    /// code generation).
    pub asm_code: String,
    /// The assembled program, if every stage succeeded.
    pub program: Option<Program>,
}
impl BuildOutput {
    /// Whether the build produced a runnable program.
    pub fn succeeded(&self) -> bool {
        self.program.is_some()
    }

    /// All diagnostics across stages, with their stage attached.
    pub fn all_diagnostics(&self) -> impl Iterator<Item = (Stage, &Diagnostic)> {
        self.stages.iter()
            .flat_map(|report| {
                report.diagnostics.iter().map(|d| (report.stage, d))
            })
    }
}

/// Compiles source text through every stage: lex, parse, generate,
/// assemble.
///
/// # Example
/// ```
/// use micro86::pipeline::build;
/// use micro86::sim::Simulator;
///
/// let output = build("print 6 * 7");
/// let program = output.program.expect("build failed");
/// let mut sim = Simulator::new(program);
/// sim.resume();
/// ```
pub fn build(source: &str) -> BuildOutput {
    build_with_config(source, &CoreConfig::default())
}

/// Compiles source text with an explicit configuration.
pub fn build_with_config(source: &str, config: &CoreConfig) -> BuildOutput {
    let mut output = BuildOutput::default();

    let (tokens, lex_diags) = crate::parse::lex::lex(source);
    let lex_failed = any_errors(&lex_diags);
    output.stages.push(StageReport { stage: Stage::Lex, diagnostics: lex_diags });
    if lex_failed {
        return output;
    }

    let (ast, parse_diags) = parse_tokens(tokens);
    let parse_failed = any_errors(&parse_diags);
    output.stages.push(StageReport { stage: Stage::Parse, diagnostics: parse_diags });
    if parse_failed {
        return output;
    }

    let generated = generate_with_config(&ast, config);
    let codegen_failed = generated.has_errors();
    output.stages.push(StageReport { stage: Stage::CodeGen, diagnostics: generated.diagnostics });
    output.asm_code = generated.asm;
    if codegen_failed {
        return output;
    }

    assemble_stage(&mut output);
    output
}

/// Assembles already-generated (or hand-written) assembly text as the
/// final pipeline stage.
///
/// Used directly when the user edits assembly instead of source.
pub fn build_asm(asm: &str) -> BuildOutput {
    let mut output = BuildOutput {
        asm_code: asm.to_string(),
        ..Default::default()
    };
    assemble_stage(&mut output);
    output
}

fn assemble_stage(output: &mut BuildOutput) {
    let program = assemble(&output.asm_code);
    let report = StageReport { stage: Stage::Assembly, diagnostics: program.diagnostics.clone() };
    let failed = report.failed();
    output.stages.push(report);
    // A program with assembly errors is discarded; its label offsets are
    // still self-consistent, but the caller must not run it.
    if !failed {
        output.program = Some(program);
    }
}
