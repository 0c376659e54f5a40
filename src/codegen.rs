//! Generating assembly text from a source AST.
//!
//! The code generator lowers the surface language onto the VM ISA with a
//! fixed set of conventions:
//! - Expression results land in `AX`; binary operations evaluate the left
//!   side first, park it on the stack, evaluate the right side, and apply
//!   the operation as `AX op BX`.
//! - Variables live one word each in RAM starting at the configured
//!   variable base, allocated in first-use order.
//! - Structured statements claim uniquely numbered labels from one
//!   monotonic counter (`_else_N`, `_endif_N`, `_while_N`, `_endwhile_N`,
//!   `_for_N`, `_endfor_N`), with a trailing `NOP` at every end label.
//! - Each source line that produces instructions is prefixed with a
//!   `_SRC_<line>` label, which the assembler keeps for the source map.

use std::collections::HashMap;

use crate::ast::{BinOp, Expr, PrintArg, SourceProgram, Stmt, UnOp};
use crate::err::Diagnostic;
use crate::sim::CoreConfig;

/// The code generator's output.
#[derive(Debug, Clone, Default)]
pub struct CodeGenOutput {
    /// The generated assembly text.
    pub asm: String,
    /// Ordered code-generation diagnostics.
    pub diagnostics: Vec<Diagnostic>,
}
impl CodeGenOutput {
    /// Whether any diagnostic is an error.
    pub fn has_errors(&self) -> bool {
        crate::err::any_errors(&self.diagnostics)
    }
}

/// Generates assembly for a parsed program with the default configuration.
///
/// # Example
/// ```
/// use micro86::parse::parse;
/// use micro86::codegen::generate;
///
/// let (ast, _) = parse("x = 2 + 3\nprint x");
/// let out = generate(&ast);
/// assert!(!out.has_errors());
/// assert!(out.asm.contains("ADD AX, BX"));
/// assert!(out.asm.trim_end().ends_with("HLT"));
/// ```
pub fn generate(program: &SourceProgram) -> CodeGenOutput {
    generate_with_config(program, &CoreConfig::default())
}

/// Generates assembly with an explicit configuration (variable base and
/// memory size).
pub fn generate_with_config(program: &SourceProgram, config: &CoreConfig) -> CodeGenOutput {
    let mut cg = CodeGen {
        out: Vec::new(),
        vars: HashMap::new(),
        label_counter: 0,
        src_dups: HashMap::new(),
        pending_src: None,
        diagnostics: Vec::new(),
        var_base: config.var_base,
        memory_size: config.memory_size_bytes,
        exhausted: false,
    };

    for stmt in &program.body {
        cg.gen_stmt(stmt);
    }
    cg.pending_src = None;
    cg.out.push("    HLT".to_string());

    let mut asm = cg.out.join("\n");
    asm.push('\n');
    CodeGenOutput { asm, diagnostics: cg.diagnostics }
}

struct CodeGen {
    out: Vec<String>,
    /// Variable name (lower case) to slot address, in first-use order.
    vars: HashMap<String, u16>,
    label_counter: u32,
    /// How many statements have already claimed each source line.
    src_dups: HashMap<usize, u32>,
    /// Source line awaiting its `_SRC_` label (flushed by the first
    /// instruction it produces).
    pending_src: Option<String>,
    diagnostics: Vec<Diagnostic>,
    var_base: u16,
    memory_size: usize,
    exhausted: bool,
}

impl CodeGen {
    /// Emits one instruction, flushing any pending source-line label.
    fn emit(&mut self, instr: impl Into<String>) {
        if let Some(label) = self.pending_src.take() {
            self.out.push(format!("{label}:"));
        }
        self.out.push(format!("    {}", instr.into()));
    }

    fn emit_label(&mut self, label: String) {
        if let Some(src) = self.pending_src.take() {
            self.out.push(format!("{src}:"));
        }
        self.out.push(format!("{label}:"));
    }

    /// Claims the next structured-construct id.
    fn claim(&mut self) -> u32 {
        self.label_counter += 1;
        self.label_counter
    }

    /// Marks the start of a statement on the given source line.
    fn begin_line(&mut self, line: usize) {
        let dup = self.src_dups.entry(line).or_insert(0);
        let label = match *dup {
            0 => format!("_SRC_{line}"),
            n => format!("_SRC_{line}_{n}"),
        };
        *dup += 1;
        self.pending_src = Some(label);
    }

    /// Looks up (or allocates) the slot backing a variable.
    fn slot(&mut self, name: &str, line: usize) -> u16 {
        if let Some(&addr) = self.vars.get(name) {
            return addr;
        }
        let index = self.vars.len() as u16;
        let addr = self.var_base.wrapping_add(index * 2);
        self.vars.insert(name.to_string(), addr);

        let used = usize::from(self.var_base) + self.vars.len() * 2;
        if used >= self.memory_size - 1 && !self.exhausted {
            self.exhausted = true;
            self.diagnostics.push(Diagnostic::error(
                line,
                "out of variable memory; too many variables for the data region",
            ));
        }
        addr
    }

    fn slot_text(&mut self, name: &str, line: usize) -> String {
        format!("[0x{:04X}]", self.slot(name, line))
    }

    fn gen_stmt(&mut self, stmt: &Stmt) {
        self.begin_line(stmt.line());

        match stmt {
            Stmt::Assign { name, value, line } => {
                self.gen_expr(value, *line);
                let slot = self.slot_text(name, *line);
                self.emit(format!("MOV {slot}, AX"));
            }
            Stmt::VarDecl { name, init, line } => {
                self.slot(name, *line);
                if let Some(init) = init {
                    self.gen_expr(init, *line);
                    let slot = self.slot_text(name, *line);
                    self.emit(format!("MOV {slot}, AX"));
                }
            }
            Stmt::Print { arg: PrintArg::Str(s), .. } => {
                for c in s.chars() {
                    self.emit(format!("MOV AX, {}", c as u32 as u16));
                    self.emit("OUTC AX");
                }
            }
            Stmt::Print { arg: PrintArg::Expr(e), line } => {
                self.gen_expr(e, *line);
                self.emit("OUT AX");
            }
            Stmt::Input { name, line } => {
                self.emit("IN AX, 0");
                let slot = self.slot_text(name, *line);
                self.emit(format!("MOV {slot}, AX"));
            }
            Stmt::If { cond, then_body, else_body, line } => {
                let id = self.claim();
                let has_else = !else_body.is_empty();
                let false_label = match has_else {
                    true => format!("_else_{id}"),
                    false => format!("_endif_{id}"),
                };

                self.gen_condition(cond, &false_label, *line);
                for stmt in then_body {
                    self.gen_stmt(stmt);
                }
                if has_else {
                    self.emit(format!("JMP _endif_{id}"));
                    self.emit_label(format!("_else_{id}"));
                    for stmt in else_body {
                        self.gen_stmt(stmt);
                    }
                }
                self.emit_label(format!("_endif_{id}"));
                self.emit("NOP");
            }
            Stmt::While { cond, body, line } => {
                let id = self.claim();
                self.emit_label(format!("_while_{id}"));
                self.gen_condition(cond, &format!("_endwhile_{id}"), *line);
                for stmt in body {
                    self.gen_stmt(stmt);
                }
                self.emit(format!("JMP _while_{id}"));
                self.emit_label(format!("_endwhile_{id}"));
                self.emit("NOP");
            }
            Stmt::For { var, from, to, step, body, line } => {
                let id = self.claim();
                let slot = self.slot_text(var, *line);

                self.gen_expr(from, *line);
                self.emit(format!("MOV {slot}, AX"));

                self.emit_label(format!("_for_{id}"));
                self.gen_expr(to, *line);
                self.emit(format!("MOV BX, {slot}"));
                self.emit("CMP BX, AX");
                // The exit branch direction is a compile-time decision:
                // counting down is assumed only for a negative step literal.
                let exit_jcc = match step_is_non_negative_literal(step.as_ref()) {
                    true => "JG",
                    false => "JL",
                };
                self.emit(format!("{exit_jcc} _endfor_{id}"));

                for stmt in body {
                    self.gen_stmt(stmt);
                }

                match step {
                    Some(step) => self.gen_expr(step, *line),
                    None => self.emit("MOV AX, 1".to_string()),
                }
                self.emit(format!("MOV BX, {slot}"));
                self.emit("ADD BX, AX");
                self.emit(format!("MOV {slot}, BX"));
                self.emit(format!("JMP _for_{id}"));
                self.emit_label(format!("_endfor_{id}"));
                self.emit("NOP");
            }
        }
    }

    /// Generates an expression; the result lands in `AX`.
    fn gen_expr(&mut self, expr: &Expr, line: usize) {
        self.gen_expr_into(expr, "AX", line)
    }

    /// Generates an expression into the requested register.
    fn gen_expr_into(&mut self, expr: &Expr, reg: &str, line: usize) {
        match expr {
            Expr::Num(n) => {
                self.emit(format!("MOV {reg}, {n}"));
                return;
            }
            Expr::Var(name) => {
                let slot = self.slot_text(name, line);
                self.emit(format!("MOV {reg}, {slot}"));
                return;
            }
            _ => {}
        }

        // Everything else computes in AX first.
        match expr {
            Expr::Str(_) => {
                self.diagnostics.push(Diagnostic::error(
                    line,
                    "string literal is only allowed directly after 'print'",
                ));
                self.emit("MOV AX, 0");
            }
            Expr::Unary { op: UnOp::Neg, expr } => {
                self.gen_expr(expr, line);
                self.emit("NEG AX");
            }
            Expr::Unary { op: UnOp::Not, expr } => {
                self.gen_expr(expr, line);
                self.emit("CMP AX, 0");
                self.gen_bool_result("JE");
            }
            Expr::Binary { op, lhs, rhs } => {
                self.gen_expr(lhs, line);
                self.emit("PUSH AX");
                self.gen_expr(rhs, line);
                self.emit("MOV BX, AX");
                self.emit("POP AX");
                self.apply_binop(*op);
            }
            Expr::Num(_) | Expr::Var(_) => unreachable!("handled above"),
        }

        if reg != "AX" {
            self.emit(format!("MOV {reg}, AX"));
        }
    }

    /// Applies a binary operator to `AX op BX`, leaving the result in `AX`.
    fn apply_binop(&mut self, op: BinOp) {
        match op {
            BinOp::Add => self.emit("ADD AX, BX"),
            BinOp::Sub => self.emit("SUB AX, BX"),
            BinOp::Mul => self.emit("MUL BX"),
            BinOp::Div => {
                self.emit("MOV DX, 0");
                self.emit("DIV BX");
            }
            BinOp::Mod => self.emit("MOD BX"),
            // In expression context, and/or are bitwise.
            BinOp::And => self.emit("AND AX, BX"),
            BinOp::Or => self.emit("OR AX, BX"),
            op => {
                self.emit("CMP AX, BX");
                self.gen_bool_result(comparison_jcc(op));
            }
        }
    }

    /// Emits the `0/1` materialization idiom: a conditional jump to the
    /// "true" arm over a `MOV AX, 0`.
    fn gen_bool_result(&mut self, true_jcc: &str) {
        let id = self.claim();
        self.emit(format!("{true_jcc} _cmp_{id}"));
        self.emit("MOV AX, 0");
        self.emit(format!("JMP _endcmp_{id}"));
        self.emit_label(format!("_cmp_{id}"));
        self.emit("MOV AX, 1");
        self.emit_label(format!("_endcmp_{id}"));
    }

    /// Generates a condition that falls through when true and jumps to
    /// `false_label` when false.
    ///
    /// `and`/`or` short-circuit here (and only here); comparisons branch
    /// directly instead of materializing a 0/1.
    fn gen_condition(&mut self, cond: &Expr, false_label: &str, line: usize) {
        match cond {
            Expr::Binary { op: BinOp::And, lhs, rhs } => {
                self.gen_condition(lhs, false_label, line);
                self.gen_condition(rhs, false_label, line);
            }
            Expr::Binary { op: BinOp::Or, lhs, rhs } => {
                let id = self.claim();
                self.gen_expr(lhs, line);
                self.emit("CMP AX, 0");
                self.emit(format!("JNE _or_{id}"));
                self.gen_condition(rhs, false_label, line);
                self.emit_label(format!("_or_{id}"));
            }
            Expr::Binary { op, lhs, rhs } if op.is_comparison() => {
                self.gen_expr(lhs, line);
                self.emit("PUSH AX");
                self.gen_expr(rhs, line);
                self.emit("MOV BX, AX");
                self.emit("POP AX");
                self.emit("CMP AX, BX");
                self.emit(format!("{} {false_label}", inverse_jcc(*op)));
            }
            Expr::Unary { op: UnOp::Not, expr } => {
                self.gen_expr(expr, line);
                self.emit("CMP AX, 0");
                self.emit(format!("JNE {false_label}"));
            }
            _ => {
                self.gen_expr(cond, line);
                self.emit("CMP AX, 0");
                self.emit(format!("JE {false_label}"));
            }
        }
    }
}

/// The branch taken when a comparison holds (signed comparisons).
fn comparison_jcc(op: BinOp) -> &'static str {
    match op {
        BinOp::Eq => "JE",
        BinOp::Ne => "JNE",
        BinOp::Lt => "JL",
        BinOp::Gt => "JG",
        BinOp::Le => "JLE",
        BinOp::Ge => "JGE",
        op => unreachable!("{op:?} is not a comparison"),
    }
}

/// The branch taken when a comparison fails.
fn inverse_jcc(op: BinOp) -> &'static str {
    match op {
        BinOp::Eq => "JNE",
        BinOp::Ne => "JE",
        BinOp::Lt => "JGE",
        BinOp::Gt => "JLE",
        BinOp::Le => "JG",
        BinOp::Ge => "JL",
        op => unreachable!("{op:?} is not a comparison"),
    }
}

fn step_is_non_negative_literal(step: Option<&Expr>) -> bool {
    match step {
        None => true,
        Some(Expr::Num(_)) => true,
        Some(_) => false,
    }
}
