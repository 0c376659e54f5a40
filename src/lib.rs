//! A compiler, assembler, and time-travel simulator for the Micro-86
//! teaching VM.
//!
//! This is a general suite for a small imperative surface language that
//! compiles to a virtual 8086-style assembly, which runs on a
//! deterministic 16-bit machine with full execution history.
//!
//! # Usage
//!
//! Source code runs through the staged pipeline (lex, parse, generate,
//! assemble):
//! ```
//! use micro86::pipeline::build;
//!
//! let output = build("
//!     x = 10
//!     while x > 0
//!         print x
//!         x = x - 1
//!     end
//! ");
//! let program = output.program.expect("build failed");
//! ```
//!
//! Hand-written assembly skips straight to the assembler:
//! ```
//! use micro86::asm::assemble;
//!
//! let program = assemble("
//!     MOV AX, 10
//!     MOV BX, 0
//! LOOP:
//!     ADD BX, AX
//!     DEC AX
//!     JNZ LOOP
//!     OUT BX
//!     HLT
//! ");
//! assert!(!program.has_errors());
//! ```
//!
//! Once a program exists, the simulator executes it while recording a
//! seekable history:
//! ```
//! # use micro86::asm::assemble;
//! # let program = assemble("MOV AX, 1\nHLT");
//! use micro86::sim::Simulator;
//!
//! let mut sim = Simulator::new(program);
//! sim.resume();             // run to completion (or breakpoint)
//! sim.seek(0);              // time-travel back to the reset state
//! sim.step_into();          // re-execute from there
//! ```
//!
//! Finished traces feed the analyzers in [`analysis`], and whole sessions
//! round-trip through [`replay`].
#![warn(missing_docs)]

pub mod analysis;
pub mod asm;
pub mod ast;
pub mod codegen;
pub mod err;
pub mod parse;
pub mod pipeline;
pub mod replay;
pub mod sim;
