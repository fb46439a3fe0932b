//! SCM Script Recompiler Core
//!
//! This crate ingests a raw SCM bytecode image, reconstructs the instruction
//! stream, builds the procedure/call/spawn graph and per-procedure control
//! flow, and emits IA-32 machine code for the analyzed scripts.
//!
//! The pipeline, in dependency order:
//! 1. **Disassembly**: explore the byte image from known entry points and
//!    materialize a typed sequence of pseudo-instructions.
//! 2. **Flow reconstruction**: basic blocks, CFG edges, procedure entries,
//!    call/spawn cross-references, dominators, natural loops, and a
//!    structured statement tree per procedure.
//! 3. **Code generation**: opcode-dispatched emission through an action-list
//!    assembler with call-site linkage to host runtime imports.

pub mod recompiler;
