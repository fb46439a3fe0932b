//! SCM Disassembler
//!
//! Converts an opaque bytecode image into a typed sequence of
//! pseudo-instructions ([`DecompiledData`]) that the flow analyzer and code
//! generator consume.
//!
//! # Exploration Algorithm
//! The analyzer is a depth-first walk over offsets that are mostly confirmed
//! to be code:
//! 1. Seed the work stack with the segment entry (offset 0).
//! 2. Pop an offset, read the 16-bit opcode (bit 15 is the not-flag) and walk
//!    the command's argument schema to find its byte span.
//! 3. Record label targets; push in-segment targets and, unless the command
//!    transfers control unconditionally, the fall-through offset.
//! 4. Offsets already explored are skipped; offsets that fail to decode are
//!    left unexplored and later materialize as hex runs.
//!
//! Exploration never aborts on malformed input. Truncated arguments, unknown
//! opcodes and tags, and out-of-range labels degrade to hex and record an
//! [`Advisory`].
//!
//! # Three-phase contract
//! [`Disassembler::run_analyzer`] marks reachable code,
//! [`Disassembler::disassembly`] materializes the instruction stream, and
//! [`Disassembler::get_data`] / [`Disassembler::get_dataindex`] query the
//! result.

use crate::recompiler::commands::{ArgSchema, ArgType, CommandDef, Commands};
use crate::recompiler::error::{Advisory, AdvisoryKind};
use crate::recompiler::fetcher::BinaryFetcher;
use bitvec::prelude::*;
use smallvec::SmallVec;
use std::collections::BTreeSet;

/// Argument type tags inside the instruction stream.
pub const TAG_EOAL: u8 = 0x00;
pub const TAG_I32: u8 = 0x01;
pub const TAG_GLOBAL_VAR: u8 = 0x02;
pub const TAG_LOCAL_VAR: u8 = 0x03;
pub const TAG_I8: u8 = 0x04;
pub const TAG_I16: u8 = 0x05;
pub const TAG_F32: u8 = 0x06;
pub const TAG_STRING8: u8 = 0x09;
pub const TAG_STRING_VARLEN: u8 = 0x0E;

/// A variable reference. Global offsets are byte offsets into the shared
/// global area; local offsets are slot indices from the thread base.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecompiledVar {
    pub global: bool,
    pub offset: u32,
}

/// An array element reference: base variable indexed by another variable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecompiledVarArray {
    pub base: DecompiledVar,
    pub index: DecompiledVar,
}

/// Storage class of a string argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StringKind {
    /// Fixed 8-byte storage, zero padded.
    Fixed8,
    /// Length-prefixed storage.
    Varlen,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecompiledString {
    pub kind: StringKind,
    pub storage: Vec<u8>,
}

/// One decoded argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// End-of-argument-list marker.
    End,
    I8(i8),
    I16(i16),
    I32(i32),
    F32(f32),
    Var(DecompiledVar),
    VarArray(DecompiledVarArray),
    String(DecompiledString),
}

impl ArgValue {
    /// The immediate 32-bit value of this argument, if it has one.
    ///
    /// Integer widths widen; floats transfer their IEEE-754 bit pattern
    /// exactly.
    pub fn imm32(&self) -> Option<i32> {
        match *self {
            ArgValue::I8(v) => Some(i32::from(v)),
            ArgValue::I16(v) => Some(i32::from(v)),
            ArgValue::I32(v) => Some(v),
            ArgValue::F32(v) => Some(v.to_bits() as i32),
            _ => None,
        }
    }

    /// The text of a string argument, truncated at the first NUL.
    pub fn immstr(&self) -> Option<String> {
        match self {
            ArgValue::String(s) => {
                let end = s
                    .storage
                    .iter()
                    .position(|&b| b == 0)
                    .unwrap_or(s.storage.len());
                Some(String::from_utf8_lossy(&s.storage[..end]).into_owned())
            }
            _ => None,
        }
    }
}

/// A decoded command: 16-bit opcode (bit 15 is the not-flag) plus its
/// ordered argument list.
#[derive(Debug, Clone, PartialEq)]
pub struct DecompiledCommand {
    pub id: u16,
    pub args: SmallVec<[ArgValue; 4]>,
}

impl DecompiledCommand {
    pub fn not_flag(&self) -> bool {
        self.id & 0x8000 != 0
    }

    pub fn command_id(&self) -> u16 {
        self.id & 0x7FFF
    }
}

/// A branch target definition at a local offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecompiledLabelDef {
    pub offset: u32,
}

/// Body of one element of the disassembled stream.
#[derive(Debug, Clone, PartialEq)]
pub enum DataBody {
    Label(DecompiledLabelDef),
    Command(DecompiledCommand),
    /// A byte run that failed exploration, preserved verbatim.
    Hex(Vec<u8>),
}

/// One element of the disassembled stream: a local offset plus its body.
/// Offsets strictly increase within a segment; a label definition shares its
/// offset with the instruction it precedes.
#[derive(Debug, Clone, PartialEq)]
pub struct DecompiledData {
    pub offset: u32,
    pub data: DataBody,
}

enum ArgError {
    Truncated,
    UnknownTag(u8),
    UnexpectedEnd,
    UnterminatedVariadic,
}

/// Disassembler for one code segment (the main segment or one mission).
///
/// The byte buffer is borrowed and must outlive the disassembler; the
/// analysis result is undefined if the buffer changes while this object is
/// alive.
pub struct Disassembler<'a> {
    commands: &'a Commands,
    bf: BinaryFetcher<'a>,

    /// Local offsets of labels in the analyzed bytecode.
    label_offsets: BTreeSet<u32>,
    /// Offsets confirmed to be code.
    offset_explored: BitVec,
    /// LIFO structure of offsets which still need to be explored.
    to_explore: Vec<u32>,
    /// Pending case count while walking SWITCH_START/SWITCH_CONTINUED runs.
    switch_cases_left: u32,
    /// Allocation hint for the materialized stream.
    hint_num_ops: usize,

    /// `None` when this disassembler is the main code segment; otherwise the
    /// size of the main segment, used to validate cross-segment references.
    main_size: Option<u32>,
    /// Main-segment offsets referenced from this mission via negative label
    /// operands. The pipeline feeds these back into the main disassembler.
    cross_segment_refs: BTreeSet<u32>,

    advisories: Vec<Advisory>,
    decompiled: Vec<DecompiledData>,
}

impl<'a> Disassembler<'a> {
    /// Constructs the disassembler of the main code segment.
    pub fn new_main(bytecode: &'a [u8], commands: &'a Commands) -> Self {
        Self::new(bytecode, commands, None)
    }

    /// Constructs the disassembler of a mission segment. `main_size` bounds
    /// the cross-segment references a mission may make into the main
    /// segment.
    pub fn new_mission(bytecode: &'a [u8], commands: &'a Commands, main_size: u32) -> Self {
        Self::new(bytecode, commands, Some(main_size))
    }

    fn new(bytecode: &'a [u8], commands: &'a Commands, main_size: Option<u32>) -> Self {
        let bf = BinaryFetcher::new(bytecode);
        Self {
            commands,
            offset_explored: bitvec![0; bf.size()],
            bf,
            label_offsets: BTreeSet::new(),
            to_explore: Vec::new(),
            switch_cases_left: 0,
            hint_num_ops: 0,
            main_size,
            cross_segment_refs: BTreeSet::new(),
            advisories: Vec::new(),
            decompiled: Vec::new(),
        }
    }

    /// Is this disassembler the main code segment?
    pub fn is_main_segment(&self) -> bool {
        self.main_size.is_none()
    }

    /// Step 1. Analyze the code, marking reachable instruction offsets.
    pub fn run_analyzer(&mut self) {
        self.push_to_explore(0);
        self.analyze();
    }

    /// Marks an additional entry as a label and explores from it. Used by
    /// the pipeline to feed a mission's main-segment references back into
    /// the main disassembler before materialization.
    pub fn add_external_label(&mut self, offset: u32) {
        if (offset as usize) < self.bf.size() {
            self.label_offsets.insert(offset);
            self.push_to_explore(offset);
            self.analyze();
        } else {
            self.advisories.push(Advisory::new(
                offset,
                AdvisoryKind::UnresolvedLabel,
                format!("external label 0x{offset:X} outside segment"),
            ));
        }
    }

    /// Step 2. After analysis, materialize the stream of pseudo-instructions.
    pub fn disassembly(&mut self) {
        let size = self.bf.size();
        let mut out: Vec<DecompiledData> =
            Vec::with_capacity(self.hint_num_ops + self.label_offsets.len());
        let mut emitted_labels: BTreeSet<u32> = BTreeSet::new();

        let mut offset = 0usize;
        while offset < size {
            if self.offset_explored[offset] {
                let local = offset as u32;
                if self.label_offsets.contains(&local) {
                    out.push(DecompiledData {
                        offset: local,
                        data: DataBody::Label(DecompiledLabelDef { offset: local }),
                    });
                    emitted_labels.insert(local);
                }
                match self.opcode_to_data(&mut offset) {
                    Some(data) => out.push(data),
                    None => {
                        // Exploration marked this span; failing to re-decode
                        // it breaks an internal invariant.
                        log::error!("explored opcode at 0x{offset:X} failed to re-decode");
                        let byte = self.bf.fetch_u8(offset).unwrap_or(0);
                        out.push(DecompiledData {
                            offset: local,
                            data: DataBody::Hex(vec![byte]),
                        });
                        offset += 1;
                    }
                }
            } else {
                let start = offset;
                while offset < size && !self.offset_explored[offset] {
                    offset += 1;
                }
                let bytes = self
                    .bf
                    .fetch_bytes(start, offset - start)
                    .unwrap_or(&[])
                    .to_vec();
                out.push(DecompiledData {
                    offset: start as u32,
                    data: DataBody::Hex(bytes),
                });
            }
        }

        // Labels that fell inside hex runs or mid-instruction never got a
        // definition; the segment is ill-formed there.
        for &label in &self.label_offsets {
            if !emitted_labels.contains(&label) {
                self.advisories.push(Advisory::new(
                    label,
                    AdvisoryKind::UnresolvedLabel,
                    format!("label 0x{label:X} does not fall on an instruction boundary"),
                ));
            }
        }

        self.decompiled = out;
    }

    /// Step 3. The disassembled stream, in strictly ascending offset order.
    pub fn get_data(&self) -> &[DecompiledData] {
        &self.decompiled
    }

    /// Index into [`Self::get_data`] for a local offset, or `None` when the
    /// offset is not an element boundary. When a label definition and an
    /// instruction share the offset, the label's index is returned.
    pub fn get_dataindex(&self, local_offset: u32) -> Option<usize> {
        let index = self
            .decompiled
            .partition_point(|d| d.offset < local_offset);
        (self.decompiled.get(index)?.offset == local_offset).then_some(index)
    }

    /// Advisories recorded while analyzing this segment.
    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    /// Main-segment offsets this mission references via negative label
    /// operands.
    pub fn cross_segment_refs(&self) -> impl Iterator<Item = u32> + '_ {
        self.cross_segment_refs.iter().copied()
    }

    fn push_to_explore(&mut self, offset: u32) {
        if (offset as usize) < self.bf.size() && !self.offset_explored[offset as usize] {
            self.to_explore.push(offset);
        }
    }

    fn analyze(&mut self) {
        while let Some(offset) = self.to_explore.pop() {
            self.explore(offset);
        }
    }

    fn explore(&mut self, offset: u32) {
        let at = offset as usize;
        if at >= self.bf.size() || self.offset_explored[at] {
            return;
        }

        let Some(opcode) = self.bf.fetch_u16(at) else {
            self.advisories.push(Advisory::new(
                offset,
                AdvisoryKind::Truncated,
                format!("opcode fetch at 0x{offset:X} runs past end of segment"),
            ));
            return;
        };

        let not_flag = opcode & 0x8000 != 0;
        let id = opcode & 0x7FFF;
        let commands = self.commands;
        let Some(command) = commands.get(id) else {
            self.advisories.push(Advisory::new(
                offset,
                AdvisoryKind::UnknownOpcode,
                format!("unknown opcode 0x{id:04X} at 0x{offset:X}"),
            ));
            return;
        };

        if let Some(len) = self.explore_opcode(offset, command, not_flag) {
            for i in at..at + len {
                self.offset_explored.set(i, true);
            }
            self.hint_num_ops += 1;

            // No fall-through after an unconditional transfer.
            if !self.commands.is_unconditional_branch(id) && !self.commands.is_proc_terminator(id)
            {
                self.push_to_explore(offset + len as u32);
            }
        }
    }

    /// Tries to explore `offset` assuming it contains `command`. Returns the
    /// byte span of the compiled command, or `None` if this opcode cannot be
    /// explored here.
    fn explore_opcode(&mut self, offset: u32, command: &CommandDef, _not_flag: bool) -> Option<usize> {
        let id = command.id;

        if self.commands.is_switch_continued(id) && self.switch_cases_left == 0 {
            log::debug!("SWITCH_CONTINUED at 0x{offset:X} without pending cases");
            return None;
        }

        let mut label_targets: SmallVec<[i32; 4]> = SmallVec::new();
        let mut case_count_arg: Option<i32> = None;
        let mut arg_index = 0usize;

        let end = match self.walk_command_args(command, offset as usize + 2, |arg_type, value| {
            if arg_type == ArgType::Label {
                if let Some(target) = value.imm32() {
                    label_targets.push(target);
                }
            }
            if arg_index == 1 {
                case_count_arg = value.imm32();
            }
            arg_index += 1;
        }) {
            Ok(end) => end,
            Err(err) => {
                let advisory = arg_error_advisory(offset, command, err);
                self.advisories.push(advisory);
                return None;
            }
        };

        let num_case_labels = label_targets.len() as u32;
        if self.commands.is_switch_start(id) {
            // Case count from the command; labels carried here (including
            // the default) are already recorded.
            let total = case_count_arg.unwrap_or(0).max(0) as u32;
            let here = num_case_labels.saturating_sub(1); // minus the default label
            self.switch_cases_left = total.saturating_sub(here);
        } else if self.commands.is_switch_continued(id) {
            self.switch_cases_left = self.switch_cases_left.saturating_sub(num_case_labels);
        }

        for target in label_targets {
            self.record_label(offset, target);
        }

        Some(end - offset as usize)
    }

    /// Records a label operand, pushing in-segment targets for exploration.
    /// Negative targets reference the main segment from a mission.
    fn record_label(&mut self, at: u32, target: i32) {
        if target >= 0 {
            let local = target as u32;
            if (local as usize) < self.bf.size() {
                self.label_offsets.insert(local);
                self.push_to_explore(local);
            } else {
                self.advisories.push(Advisory::new(
                    at,
                    AdvisoryKind::UnresolvedLabel,
                    format!("label target 0x{local:X} outside segment"),
                ));
            }
        } else {
            let main_offset = target.unsigned_abs();
            match self.main_size {
                None => {
                    // Already the main segment; a negative reference is a
                    // self-reference.
                    if (main_offset as usize) < self.bf.size() {
                        self.label_offsets.insert(main_offset);
                        self.push_to_explore(main_offset);
                    } else {
                        self.advisories.push(Advisory::new(
                            at,
                            AdvisoryKind::UnresolvedLabel,
                            format!("label target 0x{main_offset:X} outside main segment"),
                        ));
                    }
                }
                Some(main_size) => {
                    if main_offset < main_size {
                        self.cross_segment_refs.insert(main_offset);
                    } else {
                        self.advisories.push(Advisory::new(
                            at,
                            AdvisoryKind::UnresolvedLabel,
                            format!("main-segment reference 0x{main_offset:X} outside main segment"),
                        ));
                    }
                }
            }
        }
    }

    /// Walks a command's argument list starting right after the opcode,
    /// invoking `on_arg` for every decoded value. Returns the end offset.
    fn walk_command_args(
        &self,
        command: &CommandDef,
        mut cursor: usize,
        mut on_arg: impl FnMut(ArgType, &ArgValue),
    ) -> Result<usize, ArgError> {
        let split = command
            .args
            .iter()
            .position(|a| a.optional)
            .unwrap_or(command.args.len());
        let (required, repeated): (&[ArgSchema], &[ArgSchema]) = command.args.split_at(split);

        for schema in required {
            let (value, next) = self.read_arg(cursor)?;
            if matches!(value, ArgValue::End) {
                return Err(ArgError::UnexpectedEnd);
            }
            on_arg(schema.arg_type, &value);
            cursor = next;
        }

        if !repeated.is_empty() {
            'groups: loop {
                for (i, schema) in repeated.iter().enumerate() {
                    let (value, next) = self.read_arg(cursor).map_err(|e| match e {
                        ArgError::Truncated => ArgError::UnterminatedVariadic,
                        other => other,
                    })?;
                    if matches!(value, ArgValue::End) {
                        if i == 0 {
                            cursor = next;
                            break 'groups;
                        }
                        // End marker tearing a repeated group apart.
                        return Err(ArgError::UnexpectedEnd);
                    }
                    on_arg(schema.arg_type, &value);
                    cursor = next;
                }
            }
        }

        Ok(cursor)
    }

    /// Reads one type-tagged argument at `cursor`.
    fn read_arg(&self, cursor: usize) -> Result<(ArgValue, usize), ArgError> {
        let tag = self.bf.fetch_u8(cursor).ok_or(ArgError::Truncated)?;
        let cursor = cursor + 1;
        match tag {
            TAG_EOAL => Ok((ArgValue::End, cursor)),
            TAG_I32 => self
                .bf
                .fetch_i32(cursor)
                .map(|v| (ArgValue::I32(v), cursor + 4))
                .ok_or(ArgError::Truncated),
            TAG_GLOBAL_VAR => self
                .bf
                .fetch_u16(cursor)
                .map(|v| {
                    (
                        ArgValue::Var(DecompiledVar {
                            global: true,
                            offset: u32::from(v),
                        }),
                        cursor + 2,
                    )
                })
                .ok_or(ArgError::Truncated),
            TAG_LOCAL_VAR => self
                .bf
                .fetch_u16(cursor)
                .map(|v| {
                    (
                        ArgValue::Var(DecompiledVar {
                            global: false,
                            offset: u32::from(v),
                        }),
                        cursor + 2,
                    )
                })
                .ok_or(ArgError::Truncated),
            TAG_I8 => self
                .bf
                .fetch_i8(cursor)
                .map(|v| (ArgValue::I8(v), cursor + 1))
                .ok_or(ArgError::Truncated),
            TAG_I16 => self
                .bf
                .fetch_i16(cursor)
                .map(|v| (ArgValue::I16(v), cursor + 2))
                .ok_or(ArgError::Truncated),
            TAG_F32 => self
                .bf
                .fetch_u32(cursor)
                .map(|v| (ArgValue::F32(f32::from_bits(v)), cursor + 4))
                .ok_or(ArgError::Truncated),
            TAG_STRING8 => self
                .bf
                .fetch_bytes(cursor, 8)
                .map(|bytes| {
                    (
                        ArgValue::String(DecompiledString {
                            kind: StringKind::Fixed8,
                            storage: bytes.to_vec(),
                        }),
                        cursor + 8,
                    )
                })
                .ok_or(ArgError::Truncated),
            TAG_STRING_VARLEN => {
                let len = self.bf.fetch_u8(cursor).ok_or(ArgError::Truncated)? as usize;
                let bytes = self
                    .bf
                    .fetch_bytes(cursor + 1, len)
                    .ok_or(ArgError::Truncated)?;
                Ok((
                    ArgValue::String(DecompiledString {
                        kind: StringKind::Varlen,
                        storage: bytes.to_vec(),
                    }),
                    cursor + 1 + len,
                ))
            }
            other => Err(ArgError::UnknownTag(other)),
        }
    }

    /// Reconstructs a [`DecompiledCommand`] at `*offset`, advancing the
    /// offset past its byte span. The offset must have been explored; the
    /// walk re-runs the schema over the same bytes.
    fn opcode_to_data(&self, offset: &mut usize) -> Option<DecompiledData> {
        let at = *offset;
        let opcode = self.bf.fetch_u16(at)?;
        let command = self.commands.get(opcode & 0x7FFF)?;

        let mut args: SmallVec<[ArgValue; 4]> = SmallVec::new();
        let end = self
            .walk_command_args(command, at + 2, |_, value| args.push(value.clone()))
            .ok()?;

        let data = DecompiledData {
            offset: at as u32,
            data: DataBody::Command(DecompiledCommand { id: opcode, args }),
        };
        *offset = end;
        Some(data)
    }

}

fn arg_error_advisory(offset: u32, command: &CommandDef, err: ArgError) -> Advisory {
    match err {
        ArgError::Truncated => Advisory::new(
            offset,
            AdvisoryKind::Truncated,
            format!("{} at 0x{offset:X}: arguments run past end of segment", command.name),
        ),
        ArgError::UnknownTag(tag) => Advisory::new(
            offset,
            AdvisoryKind::UnknownArgTag,
            format!("{} at 0x{offset:X}: unknown argument tag 0x{tag:02X}", command.name),
        ),
        ArgError::UnexpectedEnd => Advisory::new(
            offset,
            AdvisoryKind::UnknownArgTag,
            format!("{} at 0x{offset:X}: unexpected end-of-argument marker", command.name),
        ),
        ArgError::UnterminatedVariadic => Advisory::new(
            offset,
            AdvisoryKind::UnterminatedVariadic,
            format!("{} at 0x{offset:X}: unterminated variadic argument list", command.name),
        ),
    }
}
