//! IA-32 Code Generator
//!
//! Lowers the decompiled stream and the structured statement tree into
//! native machine code. Every command id (masked with `0x7FFF`) dispatches
//! through a generator table; an id without a generator is an error.
//!
//! Calling conventions of emitted code:
//! - [`CodeGeneratorIA32::emit_ccall`]: arguments pushed in reverse order,
//!   caller cleans the stack (`add esp, 4·argc`);
//! - [`CodeGeneratorIA32::emit_stdcall`]: callee cleanup, no adjustment;
//! - [`CodeGeneratorIA32::emit_thiscall`]: this-pointer in `ecx`, remaining
//!   arguments on the stack.
//!
//! The running-thread base lives in `ebp`; globals are addressed absolutely
//! off the global-variable storage, locals off the thread's TLS area.

pub mod asm;

use crate::recompiler::analysis::{BlockList, SegType};
use crate::recompiler::codegen::asm::{Assembler, LabelId};
use crate::recompiler::commands::Commands;
use crate::recompiler::disassembler::{
    ArgValue, DataBody, DecompiledCommand, DecompiledData, DecompiledVar,
};
use crate::recompiler::error::RecompilerError;
use crate::recompiler::structure::{StatementId, StatementKind, StatementTree};
use crate::recompiler::thread::{THREAD_COND_RESULT_OFFSET, THREAD_TLS_OFFSET};
use std::collections::HashMap;

/// IA-32 general-purpose registers; ids match the machine encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

/// One argument of an emitted runtime call.
#[derive(Debug, Clone, Copy)]
pub enum CallArg<'v> {
    /// The running-thread base register.
    Thread,
    Imm(i32),
    /// An argument from the decompiled stream (immediate or variable).
    Value(&'v ArgValue),
}

type OpGen = fn(&mut CodeGeneratorIA32<'_>, &DecompiledCommand, usize) -> Result<usize, RecompilerError>;

/// Code generator for one segment's decompiled stream.
pub struct CodeGeneratorIA32<'a> {
    commands: &'a Commands,
    decompiled: &'a [DecompiledData],
    asm: Assembler,
    /// Label operand (32-bit key) to assembler label. Negative keys denote
    /// cross-segment (main) references.
    pcmap: HashMap<i32, LabelId>,
    /// Address of the global-variable storage on the host.
    globals_base: u32,
    externs: HashMap<String, u32>,
    generators: HashMap<u16, OpGen>,
}

impl<'a> CodeGeneratorIA32<'a> {
    pub fn new(commands: &'a Commands, decompiled: &'a [DecompiledData]) -> Self {
        let mut codegen = Self {
            commands,
            decompiled,
            asm: Assembler::new(),
            pcmap: HashMap::new(),
            globals_base: 0,
            externs: HashMap::new(),
            generators: HashMap::new(),
        };
        codegen.init_generators();
        codegen
    }

    pub fn set_globals_base(&mut self, address: u32) {
        self.globals_base = address;
    }

    /// Registers a host runtime import.
    pub fn register_extern(&mut self, name: impl Into<String>, address: u32) {
        self.externs.insert(name.into(), address);
    }

    /// Maps a symbolic import name to an absolute address. Unknown names are
    /// fatal.
    pub fn resolve_extern(&self, name: &str) -> Result<u32, RecompilerError> {
        self.externs
            .get(name)
            .copied()
            .ok_or_else(|| RecompilerError::UnknownImport(name.to_string()))
    }

    /// The assembler label for an integer label key, growing the pc table on
    /// first use.
    pub fn add_label(&mut self, key: i32) -> LabelId {
        if let Some(&label) = self.pcmap.get(&key) {
            return label;
        }
        let label = self.asm.new_label();
        self.pcmap.insert(key, label);
        label
    }

    /// The assembler label for a label operand from the stream.
    pub fn add_label_arg(&mut self, arg: &ArgValue) -> Result<LabelId, RecompilerError> {
        let key = arg.imm32().ok_or_else(|| {
            RecompilerError::CodeGenError("label operand is not an immediate".to_string())
        })?;
        Ok(self.add_label(key))
    }

    fn add_generator(&mut self, opcode: u16, gen: OpGen) {
        debug_assert_eq!(opcode & 0x8000, 0);
        let previous = self.generators.insert(opcode, gen);
        debug_assert!(previous.is_none(), "generator 0x{opcode:04X} registered twice");
    }

    fn init_generators(&mut self) {
        let table: &[(&str, OpGen)] = &[
            ("NOP", gen_nop),
            ("WAIT", gen_wait),
            ("GOTO", gen_goto),
            ("GOTO_IF_FALSE", gen_goto_if_false),
            ("SET_VAR_INT", gen_set),
            ("SET_VAR_FLOAT", gen_set),
            ("SET_LVAR_INT", gen_set),
            ("SET_LVAR_FLOAT", gen_set),
            ("GOSUB", gen_gosub),
            ("RETURN", gen_return),
            ("TERMINATE_THIS_SCRIPT", gen_terminate),
            ("START_NEW_SCRIPT", gen_start_new_script),
            ("ANDOR", gen_andor),
        ];
        for &(name, gen) in table {
            if let Some(id) = self.commands.id_of(name) {
                self.add_generator(id, gen);
            }
        }
    }

    /// Dispatches one command to its generator, returning the next stream
    /// index.
    pub fn run_generator(
        &mut self,
        cmd: &DecompiledCommand,
        it: usize,
    ) -> Result<usize, RecompilerError> {
        let gen = self
            .generators
            .get(&cmd.command_id())
            .copied()
            .ok_or(RecompilerError::UnsupportedOpcode(cmd.command_id()))?;
        gen(self, cmd, it)
    }

    /// Emits one stream element: commands dispatch, label definitions flush
    /// and bind, hex runs emit nothing.
    pub fn generate_data(&mut self, index: usize) -> Result<usize, RecompilerError> {
        let decompiled = self.decompiled;
        match &decompiled[index].data {
            DataBody::Command(cmd) => self.run_generator(cmd, index),
            DataBody::Label(def) => {
                // The start of a label must have the whole context in the
                // thread structure.
                let label = self.add_label(def.offset as i32);
                self.emit_flush();
                self.asm.bind(label);
                Ok(index + 1)
            }
            DataBody::Hex(bytes) => {
                log::debug!(
                    "skipping {} bytes of non-code at 0x{:X}",
                    bytes.len(),
                    decompiled[index].offset
                );
                Ok(index + 1)
            }
        }
    }

    /// Emits the whole stream in offset order.
    pub fn generate_all(&mut self) -> Result<(), RecompilerError> {
        let mut index = 0;
        while index < self.decompiled.len() {
            index = self.generate_data(index)?;
        }
        Ok(())
    }

    /// Asks the assembler for the final code size, verifying that every
    /// referenced label is bound.
    pub fn link(&mut self) -> Result<usize, RecompilerError> {
        self.asm.link()
    }

    /// Serializes the linked code against the load address `base`.
    pub fn encode(&self, base: u32) -> Result<Vec<u8>, RecompilerError> {
        self.asm.encode(base)
    }

    pub fn num_labels(&self) -> usize {
        self.asm.num_labels()
    }

    // --- emission primitives ---

    /// Writes register-cached pieces of the thread context (instruction
    /// pointer, condition result, logical-op, flags) back to the thread
    /// structure. Invoked at every label and before every control transfer;
    /// this generator keeps no context in registers, so the full context is
    /// already in memory and nothing is emitted.
    pub fn emit_flush(&mut self) {}

    /// Pushes the running-thread base register.
    pub fn emit_push_thread(&mut self) {
        self.asm.raw(&[0x55]); // push ebp
    }

    pub fn emit_pushi32_imm(&mut self, imm32: i32) {
        self.asm.raw(&[0x68]);
        self.asm.raw(&imm32.to_le_bytes());
    }

    pub fn emit_pushi32_var(&mut self, var: &DecompiledVar) {
        if var.global {
            let address = self.globals_base.wrapping_add(var.offset);
            self.asm.raw(&[0xFF, 0x35]); // push dword [abs32]
            self.asm.raw(&address.to_le_bytes());
        } else {
            let disp = THREAD_TLS_OFFSET + var.offset * 4;
            self.asm.raw(&[0xFF, 0xB5]); // push dword [ebp+disp32]
            self.asm.raw(&disp.to_le_bytes());
        }
    }

    /// Pushes an immediate, a global variable, or a thread-local. Array
    /// pushes are reserved.
    pub fn emit_pushi32(&mut self, arg: &ArgValue) -> Result<(), RecompilerError> {
        if let Some(imm32) = arg.imm32() {
            self.emit_pushi32_imm(imm32);
            return Ok(());
        }
        match arg {
            ArgValue::Var(var) => {
                self.emit_pushi32_var(var);
                Ok(())
            }
            ArgValue::VarArray(_) => Err(RecompilerError::CodeGenError(
                "variable-array pushes are reserved".to_string(),
            )),
            other => Err(RecompilerError::CodeGenError(format!(
                "cannot push argument {other:?}"
            ))),
        }
    }

    pub fn emit_movi32_reg_imm(&mut self, dst: Reg, imm32: i32) {
        self.asm.raw(&[0xB8 + dst as u8]);
        self.asm.raw(&imm32.to_le_bytes());
    }

    pub fn emit_movi32_reg_var(&mut self, dst: Reg, src: &DecompiledVar) {
        if src.global {
            let address = self.globals_base.wrapping_add(src.offset);
            self.asm.raw(&[0x8B, 0x05 | (dst as u8) << 3]); // mov r32, [abs32]
            self.asm.raw(&address.to_le_bytes());
        } else {
            let disp = THREAD_TLS_OFFSET + src.offset * 4;
            self.asm.raw(&[0x8B, 0x85 | (dst as u8) << 3]); // mov r32, [ebp+disp32]
            self.asm.raw(&disp.to_le_bytes());
        }
    }

    pub fn emit_movi32_var_imm(&mut self, dst: &DecompiledVar, imm32: i32) {
        if dst.global {
            let address = self.globals_base.wrapping_add(dst.offset);
            self.asm.raw(&[0xC7, 0x05]); // mov dword [abs32], imm32
            self.asm.raw(&address.to_le_bytes());
        } else {
            let disp = THREAD_TLS_OFFSET + dst.offset * 4;
            self.asm.raw(&[0xC7, 0x85]); // mov dword [ebp+disp32], imm32
            self.asm.raw(&disp.to_le_bytes());
        }
        self.asm.raw(&imm32.to_le_bytes());
    }

    pub fn emit_movi32_var_reg(&mut self, dst: &DecompiledVar, src: Reg) {
        if dst.global {
            let address = self.globals_base.wrapping_add(dst.offset);
            self.asm.raw(&[0x89, 0x05 | (src as u8) << 3]); // mov [abs32], r32
            self.asm.raw(&address.to_le_bytes());
        } else {
            let disp = THREAD_TLS_OFFSET + dst.offset * 4;
            self.asm.raw(&[0x89, 0x85 | (src as u8) << 3]); // mov [ebp+disp32], r32
            self.asm.raw(&disp.to_le_bytes());
        }
    }

    /// `dst = src`, with `dst` a variable and `src` an immediate or
    /// variable. Variable-to-variable moves stage through `eax`.
    pub fn emit_movi32(&mut self, dst: &ArgValue, src: &ArgValue) -> Result<(), RecompilerError> {
        let dst_var = match dst {
            ArgValue::Var(var) => var,
            ArgValue::VarArray(_) => {
                return Err(RecompilerError::CodeGenError(
                    "variable-array destinations are reserved".to_string(),
                ))
            }
            other => {
                return Err(RecompilerError::CodeGenError(format!(
                    "unexpected move destination {other:?}"
                )))
            }
        };

        if let Some(imm32) = src.imm32() {
            self.emit_movi32_var_imm(dst_var, imm32);
            return Ok(());
        }
        match src {
            ArgValue::Var(src_var) => {
                self.emit_movi32_reg_var(Reg::Eax, src_var);
                self.emit_movi32_var_reg(dst_var, Reg::Eax);
                Ok(())
            }
            ArgValue::VarArray(_) => Err(RecompilerError::CodeGenError(
                "variable-array sources are reserved".to_string(),
            )),
            other => Err(RecompilerError::CodeGenError(format!(
                "unexpected move source {other:?}"
            ))),
        }
    }

    fn emit_push_call_arg(&mut self, arg: CallArg<'_>) -> Result<(), RecompilerError> {
        match arg {
            CallArg::Thread => {
                self.emit_push_thread();
                Ok(())
            }
            CallArg::Imm(imm32) => {
                self.emit_pushi32_imm(imm32);
                Ok(())
            }
            CallArg::Value(value) => self.emit_pushi32(value),
        }
    }

    fn emit_rpushes(&mut self, args: &[CallArg<'_>]) -> Result<(), RecompilerError> {
        for &arg in args.iter().rev() {
            self.emit_push_call_arg(arg)?;
        }
        Ok(())
    }

    /// C-ABI call to a resolved import: arguments pushed in reverse, caller
    /// cleanup of `4 · argc` bytes.
    pub fn emit_ccall(
        &mut self,
        extern_name: &str,
        args: &[CallArg<'_>],
    ) -> Result<(), RecompilerError> {
        let target = self.resolve_extern(extern_name)?;
        self.emit_rpushes(args)?;
        self.asm.raw(&[0xE8]); // call rel32
        self.asm.abs_rel32(target);
        self.asm.raw(&[0x81, 0xC4]); // add esp, imm32
        self.asm.raw(&(args.len() as u32 * 4).to_le_bytes());
        Ok(())
    }

    /// Stdcall to a resolved import: callee cleanup.
    pub fn emit_stdcall(
        &mut self,
        extern_name: &str,
        args: &[CallArg<'_>],
    ) -> Result<(), RecompilerError> {
        let target = self.resolve_extern(extern_name)?;
        self.emit_rpushes(args)?;
        self.asm.raw(&[0xE8]);
        self.asm.abs_rel32(target);
        Ok(())
    }

    /// Thiscall to a resolved import: `this` in `ecx`, remaining arguments
    /// pushed in reverse, callee cleanup.
    pub fn emit_thiscall(
        &mut self,
        extern_name: &str,
        this_ptr: u32,
        args: &[CallArg<'_>],
    ) -> Result<(), RecompilerError> {
        let target = self.resolve_extern(extern_name)?;
        self.emit_rpushes(args)?;
        self.asm.raw(&[0xB9]); // mov ecx, imm32
        self.asm.raw(&this_ptr.to_le_bytes());
        self.asm.raw(&[0xE8]);
        self.asm.abs_rel32(target);
        Ok(())
    }

    fn emit_jmp_label(&mut self, label: LabelId) {
        self.asm.raw(&[0xE9]);
        self.asm.label_rel32(label);
    }

    fn emit_call_label(&mut self, label: LabelId) {
        self.asm.raw(&[0xE8]);
        self.asm.label_rel32(label);
    }

    /// Conditional jump on the stored condition result: `jz` when branching
    /// on false, `jnz` when the command carries the not-flag.
    fn emit_branch_on_cond(&mut self, jump_if_true: bool, label: LabelId) {
        self.asm.raw(&[0x80, 0xBD]); // cmp byte [ebp+disp32], imm8
        self.asm.raw(&THREAD_COND_RESULT_OFFSET.to_le_bytes());
        self.asm.raw(&[0x00]);
        self.asm
            .raw(&[0x0F, if jump_if_true { 0x85 } else { 0x84 }]); // jnz / jz rel32
        self.asm.label_rel32(label);
    }

    // --- statement-tree emission ---

    /// Emits the structured statement tree in depth-first order. Trimmed
    /// back-jumps are re-synthesized as jumps to the loop head; blocks
    /// flagged break/continue replace their trailing branch with the
    /// structural jump.
    pub fn generate_statements(
        &mut self,
        block_list: &BlockList<'_>,
        tree: &StatementTree,
        entry: StatementId,
    ) -> Result<(), RecompilerError> {
        let mut ctx = EmitCtx {
            emitted: vec![false; tree.len()],
            loops: Vec::new(),
        };
        self.emit_statement(block_list, tree, entry, &mut ctx)
    }

    fn emit_statement(
        &mut self,
        block_list: &BlockList<'_>,
        tree: &StatementTree,
        id: StatementId,
        ctx: &mut EmitCtx,
    ) -> Result<(), RecompilerError> {
        if ctx.emitted[id] {
            return Ok(());
        }
        ctx.emitted[id] = true;

        match tree.node(id).kind {
            StatementKind::Block {
                block,
                trim_from,
                trim_until,
                goto_break,
                goto_continue,
            } => {
                let info = block_list.block(block);
                match info.block_begin.segtype {
                    SegType::ExitNode => return Ok(()),
                    SegType::Main => {}
                    SegType::Mission => {
                        return Err(RecompilerError::CodeGenError(
                            "statement emission crosses into a mission segment".to_string(),
                        ))
                    }
                }

                let decompiled = self.decompiled;
                let block_start = info.block_begin.data_index as usize;
                let start = block_start + trim_from as usize;
                let mut end = block_start + info.length - trim_until as usize;

                // Bind the block's entry label even without a label-def
                // element, so synthesized jumps can target any block.
                if let Some(first) = decompiled.get(block_start) {
                    if !matches!(first.data, DataBody::Label(_)) {
                        let label = self.add_label(first.offset as i32);
                        self.emit_flush();
                        self.asm.bind(label);
                    }
                }

                // A break/continue flag replaces the trailing branch with
                // the structural jump.
                let synthesized: Option<i32> = if goto_continue {
                    Some(ctx.innermost()?.continue_key)
                } else if goto_break {
                    Some(ctx.innermost()?.break_key.ok_or_else(|| {
                        RecompilerError::CodeGenError("break outside of a loop exit".to_string())
                    })?)
                } else {
                    ctx.frame_of_tail(id).map(|frame| frame.continue_key)
                };

                if (goto_break || goto_continue) && end > start {
                    if let DataBody::Command(cmd) = &decompiled[end - 1].data {
                        if self.commands.is_unconditional_branch(cmd.command_id()) {
                            end -= 1;
                        }
                    }
                }

                let mut index = start;
                while index < end {
                    index = self.generate_data(index)?;
                }

                if let Some(key) = synthesized {
                    let label = self.add_label(key);
                    self.emit_flush();
                    self.emit_jmp_label(label);
                    self.asm.align(16);
                }

                // Successors: fall-through side first so physical adjacency
                // holds; an already-emitted fall-through needs an explicit
                // jump.
                let succ = tree.node(id).succ.clone();
                let terminator = block_list.block_terminator(block);
                let falls_through = synthesized.is_none()
                    && terminator
                        .map(|cmd| {
                            !self.commands.is_unconditional_branch(cmd.command_id())
                                && !self.commands.is_proc_terminator(cmd.command_id())
                        })
                        .unwrap_or(true);

                let is_conditional = terminator
                    .map(|cmd| self.commands.is_conditional_branch(cmd.command_id()))
                    .unwrap_or(false);

                let order: Vec<StatementId> = if is_conditional && succ.len() == 2 {
                    vec![succ[1], succ[0]]
                } else {
                    succ.clone()
                };

                if falls_through {
                    if let Some(&fall) = order.first() {
                        if ctx.emitted[fall] {
                            if let Some(key) = stmt_entry_key(block_list, tree, fall) {
                                let label = self.add_label(key);
                                self.emit_flush();
                                self.emit_jmp_label(label);
                                self.asm.align(16);
                            }
                        }
                    }
                }

                for next in order {
                    self.emit_statement(block_list, tree, next, ctx)?;
                }
                Ok(())
            }

            StatementKind::While { head, tail } => {
                let continue_key = stmt_entry_key(block_list, tree, head).ok_or_else(|| {
                    RecompilerError::CodeGenError("loop head without an entry offset".to_string())
                })?;
                let break_stmt = tree.node(id).succ.first().copied();
                let break_key =
                    break_stmt.and_then(|s| stmt_entry_key(block_list, tree, s));

                ctx.loops.push(LoopFrame {
                    tail,
                    continue_key,
                    break_key,
                });
                self.emit_statement(block_list, tree, head, ctx)?;
                ctx.loops.pop();

                if let Some(next) = break_stmt {
                    self.emit_statement(block_list, tree, next, ctx)?;
                }
                Ok(())
            }

            StatementKind::If { cond, then_head } => {
                self.emit_statement(block_list, tree, cond, ctx)?;
                self.emit_statement(block_list, tree, then_head, ctx)?;
                for next in tree.node(id).succ.clone() {
                    self.emit_statement(block_list, tree, next, ctx)?;
                }
                Ok(())
            }

            StatementKind::IfElse {
                cond,
                then_head,
                else_head,
            } => {
                self.emit_statement(block_list, tree, cond, ctx)?;
                self.emit_statement(block_list, tree, then_head, ctx)?;
                self.emit_statement(block_list, tree, else_head, ctx)?;
                for next in tree.node(id).succ.clone() {
                    self.emit_statement(block_list, tree, next, ctx)?;
                }
                Ok(())
            }

            // The conditional branch that leads into a Break already jumps
            // to the loop's exit label; the node itself emits nothing.
            StatementKind::Break => Ok(()),
        }
    }
}

struct LoopFrame {
    tail: StatementId,
    continue_key: i32,
    break_key: Option<i32>,
}

struct EmitCtx {
    emitted: Vec<bool>,
    loops: Vec<LoopFrame>,
}

impl EmitCtx {
    fn innermost(&self) -> Result<&LoopFrame, RecompilerError> {
        self.loops.last().ok_or_else(|| {
            RecompilerError::CodeGenError("structural jump outside of a loop".to_string())
        })
    }

    fn frame_of_tail(&self, id: StatementId) -> Option<&LoopFrame> {
        self.loops.iter().rev().find(|f| f.tail == id)
    }
}

/// The label key of a statement's entry point (the local offset of the
/// first instruction it leads with).
fn stmt_entry_key(
    block_list: &BlockList<'_>,
    tree: &StatementTree,
    id: StatementId,
) -> Option<i32> {
    match tree.node(id).kind {
        StatementKind::Block { block, .. } => block_list
            .block_data(block)
            .first()
            .map(|d| d.offset as i32),
        StatementKind::While { head, .. } => stmt_entry_key(block_list, tree, head),
        StatementKind::If { cond, .. } | StatementKind::IfElse { cond, .. } => {
            stmt_entry_key(block_list, tree, cond)
        }
        StatementKind::Break => None,
    }
}

fn expect_args(cmd: &DecompiledCommand, count: usize) -> Result<(), RecompilerError> {
    if cmd.args.len() != count {
        return Err(RecompilerError::CodeGenError(format!(
            "command 0x{:04X} expects {} arguments, found {}",
            cmd.command_id(),
            count,
            cmd.args.len()
        )));
    }
    Ok(())
}

// --- per-opcode generators ---

fn gen_nop(
    _codegen: &mut CodeGeneratorIA32<'_>,
    _cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    Ok(it + 1)
}

fn gen_wait(
    codegen: &mut CodeGeneratorIA32<'_>,
    cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    expect_args(cmd, 1)?;
    codegen.emit_ccall(
        "DYNAREC_RTL_Wait",
        &[CallArg::Thread, CallArg::Value(&cmd.args[0])],
    )?;
    Ok(it + 1)
}

fn gen_goto(
    codegen: &mut CodeGeneratorIA32<'_>,
    cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    expect_args(cmd, 1)?;
    let label = codegen.add_label_arg(&cmd.args[0])?;
    // Flush context before jumping into a label.
    codegen.emit_flush();
    codegen.emit_jmp_label(label);
    codegen.asm.align(16);
    Ok(it + 1)
}

fn gen_goto_if_false(
    codegen: &mut CodeGeneratorIA32<'_>,
    cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    expect_args(cmd, 1)?;
    let label = codegen.add_label_arg(&cmd.args[0])?;
    codegen.emit_flush();
    // Branch when the stored condition is false; the not-flag inverts.
    codegen.emit_branch_on_cond(cmd.not_flag(), label);
    Ok(it + 1)
}

fn gen_set(
    codegen: &mut CodeGeneratorIA32<'_>,
    cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    expect_args(cmd, 2)?;
    codegen.emit_movi32(&cmd.args[0], &cmd.args[1])?;
    Ok(it + 1)
}

fn gen_gosub(
    codegen: &mut CodeGeneratorIA32<'_>,
    cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    expect_args(cmd, 1)?;
    let label = codegen.add_label_arg(&cmd.args[0])?;
    codegen.emit_flush();
    codegen.emit_call_label(label);
    Ok(it + 1)
}

fn gen_return(
    codegen: &mut CodeGeneratorIA32<'_>,
    cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    expect_args(cmd, 0)?;
    codegen.emit_flush();
    codegen.asm.raw(&[0xC3]); // ret
    Ok(it + 1)
}

fn gen_terminate(
    codegen: &mut CodeGeneratorIA32<'_>,
    cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    expect_args(cmd, 0)?;
    codegen.emit_ccall("DYNAREC_RTL_TerminateThisScript", &[CallArg::Thread])?;
    codegen.asm.raw(&[0xC3]);
    Ok(it + 1)
}

fn gen_start_new_script(
    codegen: &mut CodeGeneratorIA32<'_>,
    cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    if cmd.args.is_empty() {
        return Err(RecompilerError::CodeGenError(
            "START_NEW_SCRIPT without a target".to_string(),
        ));
    }
    let target = cmd.args[0].imm32().ok_or_else(|| {
        RecompilerError::CodeGenError("START_NEW_SCRIPT target is not an immediate".to_string())
    })?;
    let mut args = vec![CallArg::Thread, CallArg::Imm(target)];
    args.extend(cmd.args[1..].iter().map(CallArg::Value));
    codegen.emit_ccall("DYNAREC_RTL_StartNewScript", &args)?;
    Ok(it + 1)
}

fn gen_andor(
    codegen: &mut CodeGeneratorIA32<'_>,
    cmd: &DecompiledCommand,
    it: usize,
) -> Result<usize, RecompilerError> {
    expect_args(cmd, 1)?;
    codegen.emit_ccall(
        "DYNAREC_RTL_AndOr",
        &[CallArg::Thread, CallArg::Value(&cmd.args[0])],
    )?;
    Ok(it + 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompiler::disassembler::DecompiledLabelDef;

    fn command(id: u16, args: Vec<ArgValue>) -> DecompiledData {
        DecompiledData {
            offset: 0,
            data: DataBody::Command(DecompiledCommand {
                id,
                args: args.into_iter().collect(),
            }),
        }
    }

    #[test]
    fn ccall_pushes_reversed_and_cleans_stack() {
        let commands = Commands::default_table();
        let stream = [command(0x0001, vec![ArgValue::I32(500)])]; // WAIT 500
        let mut codegen = CodeGeneratorIA32::new(&commands, &stream);
        codegen.register_extern("DYNAREC_RTL_Wait", 0x7000);

        codegen.generate_all().unwrap();
        codegen.link().unwrap();
        let code = codegen.encode(0).unwrap();

        // push 500; push ebp; call rel32; add esp, 8
        assert_eq!(&code[..5], &[0x68, 0xF4, 0x01, 0x00, 0x00]);
        assert_eq!(code[5], 0x55);
        assert_eq!(code[6], 0xE8);
        assert_eq!(&code[11..13], &[0x81, 0xC4]);
        assert_eq!(&code[13..17], &8u32.to_le_bytes());
    }

    #[test]
    fn unknown_import_is_fatal() {
        let commands = Commands::default_table();
        let stream = [command(0x0001, vec![ArgValue::I32(0)])];
        let mut codegen = CodeGeneratorIA32::new(&commands, &stream);
        assert!(matches!(
            codegen.generate_all(),
            Err(RecompilerError::UnknownImport(_))
        ));
    }

    #[test]
    fn unknown_opcode_is_fatal() {
        let commands = Commands::default_table();
        let stream = [command(0x7ABC, vec![])];
        let mut codegen = CodeGeneratorIA32::new(&commands, &stream);
        assert_eq!(
            codegen.generate_all(),
            Err(RecompilerError::UnsupportedOpcode(0x7ABC))
        );
    }

    #[test]
    fn forward_goto_binds_when_label_def_arrives() {
        let commands = Commands::default_table();
        let stream = [
            command(0x0002, vec![ArgValue::I32(7)]), // GOTO 7
            DecompiledData {
                offset: 7,
                data: DataBody::Label(DecompiledLabelDef { offset: 7 }),
            },
            command(0x0051, vec![]), // RETURN
        ];
        let mut codegen = CodeGeneratorIA32::new(&commands, &stream);
        codegen.generate_all().unwrap();
        assert_eq!(codegen.num_labels(), 1, "one pc label allocated for key 7");
        let size = codegen.link().expect("label must be bound");
        assert!(size > 0);
    }

    #[test]
    fn goto_with_unbound_label_fails_link() {
        let commands = Commands::default_table();
        let stream = [command(0x0002, vec![ArgValue::I32(100)])];
        let mut codegen = CodeGeneratorIA32::new(&commands, &stream);
        codegen.generate_all().unwrap();
        assert!(matches!(
            codegen.link(),
            Err(RecompilerError::UnboundLabel(_))
        ));
    }

    #[test]
    fn assign_global_from_immediate() {
        let commands = Commands::default_table();
        let stream = [command(
            0x0004, // SET_VAR_INT
            vec![
                ArgValue::Var(DecompiledVar {
                    global: true,
                    offset: 4,
                }),
                ArgValue::I32(100),
            ],
        )];
        let mut codegen = CodeGeneratorIA32::new(&commands, &stream);
        codegen.set_globals_base(0x2000);
        codegen.generate_all().unwrap();
        codegen.link().unwrap();
        let code = codegen.encode(0).unwrap();

        // mov dword [0x2004], 100
        assert_eq!(&code[..2], &[0xC7, 0x05]);
        assert_eq!(&code[2..6], &0x2004u32.to_le_bytes());
        assert_eq!(&code[6..10], &100i32.to_le_bytes());
    }

    #[test]
    fn assign_local_addresses_tls() {
        let commands = Commands::default_table();
        let stream = [command(
            0x0006, // SET_LVAR_INT
            vec![
                ArgValue::Var(DecompiledVar {
                    global: false,
                    offset: 2,
                }),
                ArgValue::I32(-1),
            ],
        )];
        let mut codegen = CodeGeneratorIA32::new(&commands, &stream);
        codegen.generate_all().unwrap();
        codegen.link().unwrap();
        let code = codegen.encode(0).unwrap();

        // mov dword [ebp + 0x3C + 2*4], -1
        assert_eq!(&code[..2], &[0xC7, 0x85]);
        assert_eq!(&code[2..6], &(THREAD_TLS_OFFSET + 8).to_le_bytes());
        assert_eq!(&code[6..10], &(-1i32).to_le_bytes());
    }

    #[test]
    fn float_assignment_transfers_bits_exactly() {
        let commands = Commands::default_table();
        let stream = [command(
            0x0005, // SET_VAR_FLOAT
            vec![
                ArgValue::Var(DecompiledVar {
                    global: true,
                    offset: 0,
                }),
                ArgValue::F32(1.5),
            ],
        )];
        let mut codegen = CodeGeneratorIA32::new(&commands, &stream);
        codegen.generate_all().unwrap();
        codegen.link().unwrap();
        let code = codegen.encode(0).unwrap();
        assert_eq!(&code[6..10], &1.5f32.to_bits().to_le_bytes());
    }

    #[test]
    fn thiscall_loads_this_into_ecx() {
        let commands = Commands::default_table();
        let stream: [DecompiledData; 0] = [];
        let mut codegen = CodeGeneratorIA32::new(&commands, &stream);
        codegen.register_extern("CTheScripts_Process", 0x8000);
        codegen
            .emit_thiscall("CTheScripts_Process", 0x1234, &[CallArg::Imm(7)])
            .unwrap();
        codegen.link().unwrap();
        let code = codegen.encode(0).unwrap();

        // push 7; mov ecx, 0x1234; call rel32
        assert_eq!(&code[..5], &[0x68, 0x07, 0x00, 0x00, 0x00]);
        assert_eq!(code[5], 0xB9);
        assert_eq!(&code[6..10], &0x1234u32.to_le_bytes());
        assert_eq!(code[10], 0xE8);
    }
}
