//! Control Flow Reconstruction
//!
//! Builds the global [`BlockList`] over the disassembled segments: basic
//! blocks, CFG edges, procedure entries, and call/spawn cross-references.
//!
//! # Block Construction Algorithm
//! A new block starts at (a) a segment's first instruction, (b) any label
//! definition, and (c) the instruction following a branching command. Hex
//! runs never open a block; they attach to the block that is open when they
//! appear. Blocks are appended in segment emission order, so the non-dummy
//! range is sorted by [`SegReference`]. One dummy exit block per procedure
//! is reserved at the end of the vector.
//!
//! # Edge Rules
//! - unconditional branch: target only;
//! - conditional branch: target, then fall-through (order preserved; the
//!   target is the falsy exit);
//! - procedure terminator: the dummy exit block of the enclosing procedure;
//! - anything else: fall-through.

use crate::recompiler::commands::Commands;
use crate::recompiler::disassembler::{DataBody, DecompiledCommand, DecompiledData, Disassembler};
use crate::recompiler::error::RecompilerError;
use bitflags::bitflags;
use bitvec::prelude::*;
use smallvec::SmallVec;

pub type BlockId = usize;
pub type ProcId = usize;

/// Half-open `[start, end)` range of block ids.
pub type BlockRange = (BlockId, BlockId);

bitflags! {
    /// Role of a procedure entry. Flags combine when the same entry is
    /// reachable through multiple roles.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ProcType: u8 {
        /// Main entry point.
        const MAIN = 0x01;
        /// Called with GOSUB or GOSUB_FILE.
        const GOSUB = 0x02;
        /// Spawned with START_NEW_SCRIPT.
        const SCRIPT = 0x04;
        /// Spawned with LAUNCH_MISSION.
        const SUBSCRIPT = 0x08;
        /// Spawned with LOAD_AND_LAUNCH_MISSION.
        const MISSION = 0x10;
    }
}

/// Segment kind a block belongs to. `ExitNode` is last so the dummy exit
/// blocks sort after every real block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum SegType {
    Main = 0,
    Mission = 1,
    ExitNode = 2,
}

/// Locates a [`DecompiledData`] element within a segment. Ordered
/// lexicographically by (segtype, segindex, data_index).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SegReference {
    pub segtype: SegType,
    /// Index on the specific segment array (mission number for missions).
    pub segindex: u16,
    /// Index into the segment's `DecompiledData` vector.
    pub data_index: u32,
}

/// A cross-reference between a procedure and the block that references it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XRefInfo {
    pub block_id: BlockId,
    pub proc_id: ProcId,
}

/// A procedure: a code region reachable via call/spawn as an entry point.
#[derive(Debug, Clone)]
pub struct ProcEntry {
    pub proc_type: ProcType,
    pub block_id: BlockId,
    /// The dummy exit block, recorded once an edge links to it.
    pub exit_block: Option<BlockId>,

    pub calls_into: Vec<XRefInfo>,
    pub called_from: Vec<XRefInfo>,
    pub spawns_script: Vec<XRefInfo>,
    pub spawned_from: Vec<XRefInfo>,
}

impl ProcEntry {
    fn new(proc_type: ProcType, block_id: BlockId) -> Self {
        Self {
            proc_type,
            block_id,
            exit_block: None,
            calls_into: Vec::new(),
            called_from: Vec::new(),
            spawns_script: Vec::new(),
            spawned_from: Vec::new(),
        }
    }
}

/// A maximal straight-line run of stream elements.
#[derive(Debug, Clone)]
pub struct Block {
    pub block_begin: SegReference,
    /// Number of stream elements in this block.
    pub length: usize,

    /// Predecessor blocks, in insertion order.
    pub pred: SmallVec<[BlockId; 2]>,
    /// Successor blocks, in insertion order.
    pub succ: SmallVec<[BlockId; 2]>,

    /// Which blocks dominate this block. Available after
    /// [`compute_dominators`](crate::recompiler::analysis::compute_dominators).
    pub dominators: BitVec,
    /// Which blocks post-dominate this block.
    pub post_dominators: BitVec,
}

impl Block {
    fn new(block_begin: SegReference, length: usize) -> Self {
        Self {
            block_begin,
            length,
            pred: SmallVec::new(),
            succ: SmallVec::new(),
            dominators: BitVec::new(),
            post_dominators: BitVec::new(),
        }
    }

    pub fn dominated_by(&self, block_id: BlockId) -> bool {
        self.dominators.get(block_id).map(|b| *b).unwrap_or(false)
    }

    pub fn postdominated_by(&self, block_id: BlockId) -> bool {
        self.post_dominators
            .get(block_id)
            .map(|b| *b)
            .unwrap_or(false)
    }
}

/// The global result of flow analysis.
///
/// Borrows the disassembled streams; it must not outlive them.
pub struct BlockList<'a> {
    /// All blocks. The dummy exit blocks at the end are not offset-sorted;
    /// use the ranges below for the sorted sub-ranges.
    pub blocks: Vec<Block>,

    /// Range of real (non-dummy) blocks, sorted by offset.
    pub non_dummy_blocks: BlockRange,
    /// Range of the main segment's blocks.
    pub main_blocks: BlockRange,
    /// Range of each mission's blocks, indexed by mission number.
    pub mission_blocks: Vec<BlockRange>,

    /// Procedure entries, sorted by entry block id.
    pub proc_entries: Vec<ProcEntry>,

    main_segment: &'a Disassembler<'a>,
    mission_segments: &'a [Disassembler<'a>],
}

impl<'a> BlockList<'a> {
    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id]
    }

    pub fn proc(&self, id: ProcId) -> &ProcEntry {
        &self.proc_entries[id]
    }

    /// The procedure whose entry is `block_id`, if any.
    pub fn find_proc_by_entry(&self, block_id: BlockId) -> Option<ProcId> {
        self.proc_entries.iter().position(|p| p.block_id == block_id)
    }

    /// The stream slice a block covers. Empty for dummy exit blocks.
    pub fn block_data(&self, id: BlockId) -> &'a [DecompiledData] {
        let block = &self.blocks[id];
        let segref = block.block_begin;
        let data: &'a [DecompiledData] = match segref.segtype {
            SegType::Main => self.main_segment.get_data(),
            SegType::Mission => self.mission_segments[segref.segindex as usize].get_data(),
            SegType::ExitNode => return &[],
        };
        let start = segref.data_index as usize;
        &data[start..start + block.length]
    }

    /// The last command of a block, skipping trailing label/hex elements.
    pub fn block_terminator(&self, id: BlockId) -> Option<&'a DecompiledCommand> {
        self.block_data(id).iter().rev().find_map(|d| match &d.data {
            DataBody::Command(cmd) => Some(cmd),
            _ => None,
        })
    }

    /// Whether this block flows into a procedure's dummy exit (i.e. it ends
    /// with a RETURN-like terminator).
    pub fn is_pre_end_block(&self, id: BlockId) -> bool {
        self.blocks[id]
            .succ
            .iter()
            .any(|&s| self.blocks[s].block_begin.segtype == SegType::ExitNode)
    }

    pub fn link_blocks(&mut self, link_from: BlockId, link_to: BlockId) {
        self.blocks[link_from].succ.push(link_to);
        self.blocks[link_to].pred.push(link_from);
    }

    pub fn link_call(&mut self, caller_block: BlockId, caller: ProcId, called: ProcId) {
        self.proc_entries[caller].calls_into.push(XRefInfo {
            block_id: caller_block,
            proc_id: called,
        });
        self.proc_entries[called].called_from.push(XRefInfo {
            block_id: caller_block,
            proc_id: caller,
        });
    }

    pub fn link_script_spawn(&mut self, spawner_block: BlockId, spawner: ProcId, spawned: ProcId) {
        self.proc_entries[spawner].spawns_script.push(XRefInfo {
            block_id: spawner_block,
            proc_id: spawned,
        });
        self.proc_entries[spawned].spawned_from.push(XRefInfo {
            block_id: spawner_block,
            proc_id: spawner,
        });
    }

    /// Resolves a label operand seen inside `current_seg` to the block that
    /// starts at its target. Negative operands reference the main segment.
    pub fn block_from_label(&self, current_seg: SegReference, target: i32) -> Option<BlockId> {
        let (segtype, segindex, disasm): (SegType, u16, &Disassembler<'_>) = if target >= 0 {
            match current_seg.segtype {
                SegType::Main => (SegType::Main, 0, self.main_segment),
                SegType::Mission => (
                    SegType::Mission,
                    current_seg.segindex,
                    &self.mission_segments[current_seg.segindex as usize],
                ),
                SegType::ExitNode => return None,
            }
        } else {
            (SegType::Main, 0, self.main_segment)
        };

        let offset = target.unsigned_abs();
        let data_index = disasm.get_dataindex(offset)? as u32;
        self.block_at(SegReference {
            segtype,
            segindex,
            data_index,
        })
    }

    /// The entry block of a mission segment.
    pub fn block_from_mission(&self, mission_id: i32) -> Option<BlockId> {
        let range = self.mission_blocks.get(usize::try_from(mission_id).ok()?)?;
        (range.0 < range.1).then_some(range.0)
    }

    pub fn get_block_range(&self, segtype: SegType, segindex: u16) -> Option<BlockRange> {
        match segtype {
            SegType::Main => Some(self.main_blocks),
            SegType::Mission => self.mission_blocks.get(segindex as usize).copied(),
            SegType::ExitNode => Some((self.non_dummy_blocks.1, self.blocks.len())),
        }
    }

    /// Binary search for the block beginning exactly at `segref` within the
    /// sorted non-dummy range.
    fn block_at(&self, segref: SegReference) -> Option<BlockId> {
        let (start, end) = self.non_dummy_blocks;
        let slice = &self.blocks[start..end];
        let index = slice.partition_point(|b| b.block_begin < segref);
        (slice.get(index)?.block_begin == segref).then_some(start + index)
    }

    /// The procedure enclosing `block_id`: the one with the greatest entry
    /// block id not above it. Every segment starts with a procedure entry,
    /// so this is always segment-consistent for real blocks.
    pub fn enclosing_proc(&self, block_id: BlockId) -> Option<ProcId> {
        let index = self
            .proc_entries
            .partition_point(|p| p.block_id <= block_id);
        index.checked_sub(1)
    }

    /// Dummy exit block reserved for a procedure.
    pub fn exit_block_of(&self, proc_id: ProcId) -> BlockId {
        self.non_dummy_blocks.1 + proc_id
    }

    /// Depth-first walk over the CFG. `forward` follows successors,
    /// otherwise predecessors. The visitor returns `false` to stop early.
    pub fn depth_first(
        &self,
        start_block: BlockId,
        forward: bool,
        mut visitor: impl FnMut(BlockId) -> bool,
    ) {
        let mut visited = bitvec![0; self.blocks.len()];
        self.depth_first_rec(&mut visited, start_block, forward, &mut visitor);
    }

    fn depth_first_rec(
        &self,
        visited: &mut BitVec,
        block: BlockId,
        forward: bool,
        visitor: &mut impl FnMut(BlockId) -> bool,
    ) -> bool {
        visited.set(block, true);
        if !visitor(block) {
            return false;
        }
        let next_list = if forward {
            &self.blocks[block].succ
        } else {
            &self.blocks[block].pred
        };
        for &next in next_list {
            if !visited[next] && !self.depth_first_rec(visited, next, forward, visitor) {
                return false;
            }
        }
        true
    }

    /// Depth-first walk over the call graph (GOSUB edges).
    pub fn depth_first_calls(
        &self,
        start_proc: ProcId,
        forward: bool,
        mut visitor: impl FnMut(ProcId) -> bool,
    ) {
        self.depth_first_procs(start_proc, &mut visitor, &|p| {
            if forward {
                &p.calls_into
            } else {
                &p.called_from
            }
        });
    }

    /// Depth-first walk over the spawn graph (script/mission spawn edges).
    pub fn depth_first_spawns(
        &self,
        start_proc: ProcId,
        forward: bool,
        mut visitor: impl FnMut(ProcId) -> bool,
    ) {
        self.depth_first_procs(start_proc, &mut visitor, &|p| {
            if forward {
                &p.spawns_script
            } else {
                &p.spawned_from
            }
        });
    }

    fn depth_first_procs(
        &self,
        start_proc: ProcId,
        visitor: &mut impl FnMut(ProcId) -> bool,
        edges: &impl Fn(&ProcEntry) -> &Vec<XRefInfo>,
    ) {
        let mut visited = bitvec![0; self.proc_entries.len()];
        let mut stack = vec![start_proc];
        while let Some(proc_id) = stack.pop() {
            if visited[proc_id] {
                continue;
            }
            visited.set(proc_id, true);
            if !visitor(proc_id) {
                return;
            }
            for xref in edges(&self.proc_entries[proc_id]).iter().rev() {
                if !visited[xref.proc_id] {
                    stack.push(xref.proc_id);
                }
            }
        }
    }

}

fn segment_table<'a>(
    main_segment: &'a Disassembler<'a>,
    mission_segments: &'a [Disassembler<'a>],
) -> Vec<(SegType, u16, &'a [DecompiledData])> {
    let mut segments = Vec::with_capacity(1 + mission_segments.len());
    segments.push((SegType::Main, 0u16, main_segment.get_data()));
    for (index, mission) in mission_segments.iter().enumerate() {
        segments.push((SegType::Mission, index as u16, mission.get_data()));
    }
    segments
}

/// Builds the block list over the disassembled segments: basic blocks in
/// offset order, procedure entries (Main, missions, call/spawn targets), and
/// the trailing dummy exit range.
pub fn find_basic_blocks<'a>(
    commands: &Commands,
    main_segment: &'a Disassembler<'a>,
    mission_segments: &'a [Disassembler<'a>],
) -> BlockList<'a> {
    let segments = segment_table(main_segment, mission_segments);

    // Collect real blocks, per segment, in emission order.
    let mut blocks: Vec<Block> = Vec::new();
    for &(segtype, segindex, data) in &segments {
        collect_segment_blocks(commands, segtype, segindex, data, &mut blocks);
    }

    let non_dummy_blocks = (0, blocks.len());
    let (main_blocks, mission_blocks) = find_ranges(&blocks, mission_segments.len());

    let mut block_list = BlockList {
        blocks,
        non_dummy_blocks,
        main_blocks,
        mission_blocks,
        proc_entries: Vec::new(),
        main_segment,
        mission_segments,
    };

    // Procedure entries: the main entry, each mission entry, and every
    // call/spawn target.
    if block_list.main_blocks.0 < block_list.main_blocks.1 {
        add_proc(&mut block_list.proc_entries, ProcType::MAIN, block_list.main_blocks.0);
    }
    for range in block_list.mission_blocks.clone() {
        if range.0 < range.1 {
            add_proc(&mut block_list.proc_entries, ProcType::MISSION, range.0);
        }
    }

    for block_id in block_list.non_dummy_blocks.0..block_list.non_dummy_blocks.1 {
        let segref = block_list.blocks[block_id].block_begin;
        for element in block_list.block_data(block_id) {
            let DataBody::Command(cmd) = &element.data else {
                continue;
            };
            let id = cmd.command_id();
            let proc_type = if commands.is_call(id) {
                ProcType::GOSUB
            } else if Some(id) == commands.start_new_script() {
                ProcType::SCRIPT
            } else if Some(id) == commands.launch_mission() {
                ProcType::SUBSCRIPT
            } else if commands.is_mission_spawn(id) {
                ProcType::MISSION
            } else {
                continue;
            };

            let target_block = if commands.is_mission_spawn(id) {
                cmd.args
                    .first()
                    .and_then(|a| a.imm32())
                    .and_then(|m| block_list.block_from_mission(m))
            } else {
                cmd.args
                    .first()
                    .and_then(|a| a.imm32())
                    .and_then(|t| block_list.block_from_label(segref, t))
            };

            match target_block {
                Some(entry) => add_proc(&mut block_list.proc_entries, proc_type, entry),
                None => log::warn!(
                    "{:?} target of command 0x{:04X} at 0x{:X} does not resolve to a block",
                    proc_type,
                    id,
                    element.offset
                ),
            }
        }
    }

    block_list.proc_entries.sort_by_key(|p| p.block_id);

    // Reserve one dummy exit block per procedure.
    for proc_index in 0..block_list.proc_entries.len() {
        block_list.blocks.push(Block::new(
            SegReference {
                segtype: SegType::ExitNode,
                segindex: proc_index as u16,
                data_index: 0,
            },
            0,
        ));
    }

    block_list
}

fn collect_segment_blocks(
    commands: &Commands,
    segtype: SegType,
    segindex: u16,
    data: &[DecompiledData],
    blocks: &mut Vec<Block>,
) {
    // Leader set: segment start, label definitions, and the element after a
    // branching command. Hex never leads a block.
    let mut leaders = bitvec![0; data.len()];
    let mut want_leader = true;
    for (index, element) in data.iter().enumerate() {
        match &element.data {
            DataBody::Label(_) => {
                leaders.set(index, true);
                want_leader = false;
            }
            DataBody::Command(cmd) => {
                if want_leader {
                    leaders.set(index, true);
                    want_leader = false;
                }
                if commands.ends_block(cmd.command_id()) {
                    want_leader = true;
                }
            }
            DataBody::Hex(_) => {}
        }
    }

    let mut current: Option<(usize, usize)> = None;
    for index in 0..data.len() {
        if leaders[index] {
            if let Some((start, len)) = current.take() {
                blocks.push(Block::new(
                    SegReference {
                        segtype,
                        segindex,
                        data_index: start as u32,
                    },
                    len,
                ));
            }
            current = Some((index, 1));
        } else if let Some((start, _)) = current {
            current = Some((start, index - start + 1));
        }
    }
    if let Some((start, len)) = current {
        blocks.push(Block::new(
            SegReference {
                segtype,
                segindex,
                data_index: start as u32,
            },
            len,
        ));
    }
}

/// Records the offset-sorted sub-ranges of the block vector.
fn find_ranges(blocks: &[Block], num_missions: usize) -> (BlockRange, Vec<BlockRange>) {
    let mut main_blocks = (0, 0);
    let mut mission_blocks = vec![(0, 0); num_missions];

    let mut index = 0;
    while index < blocks.len() {
        let begin = blocks[index].block_begin;
        let start = index;
        while index < blocks.len()
            && blocks[index].block_begin.segtype == begin.segtype
            && blocks[index].block_begin.segindex == begin.segindex
        {
            index += 1;
        }
        match begin.segtype {
            SegType::Main => main_blocks = (start, index),
            SegType::Mission => mission_blocks[begin.segindex as usize] = (start, index),
            SegType::ExitNode => {}
        }
    }

    (main_blocks, mission_blocks)
}

fn add_proc(proc_entries: &mut Vec<ProcEntry>, proc_type: ProcType, block_id: BlockId) {
    match proc_entries.iter_mut().find(|p| p.block_id == block_id) {
        Some(existing) => existing.proc_type |= proc_type,
        None => proc_entries.push(ProcEntry::new(proc_type, block_id)),
    }
}

/// Links every block to its successors following the edge rules, recording
/// each procedure's exit block as terminators are seen.
pub fn find_edges(block_list: &mut BlockList<'_>, commands: &Commands) {
    let (start, end) = block_list.non_dummy_blocks;
    for block_id in start..end {
        let segref = block_list.blocks[block_id].block_begin;
        let terminator = block_list.block_terminator(block_id).cloned();

        let next = block_id + 1;
        let fall_through: Option<BlockId> = (next < end
            && block_list.blocks[next].block_begin.segtype == segref.segtype
            && block_list.blocks[next].block_begin.segindex == segref.segindex)
            .then_some(next);

        match terminator {
            Some(cmd) if commands.is_unconditional_branch(cmd.command_id()) => {
                let target = cmd.args.first().and_then(|a| a.imm32());
                match target.and_then(|t| block_list.block_from_label(segref, t)) {
                    Some(target_block) => block_list.link_blocks(block_id, target_block),
                    None => log::warn!(
                        "branch target of block {block_id} does not resolve; no edge created"
                    ),
                }
            }
            Some(cmd) if commands.is_conditional_branch(cmd.command_id()) => {
                let target = cmd.args.first().and_then(|a| a.imm32());
                match target.and_then(|t| block_list.block_from_label(segref, t)) {
                    Some(target_block) => block_list.link_blocks(block_id, target_block),
                    None => log::warn!(
                        "branch target of block {block_id} does not resolve; no edge created"
                    ),
                }
                if let Some(next) = fall_through {
                    block_list.link_blocks(block_id, next);
                }
            }
            Some(cmd) if commands.is_proc_terminator(cmd.command_id()) => {
                if let Some(proc_id) = block_list.enclosing_proc(block_id) {
                    let exit = block_list.exit_block_of(proc_id);
                    block_list.link_blocks(block_id, exit);
                    block_list.proc_entries[proc_id].exit_block = Some(exit);
                }
            }
            _ => {
                if let Some(next) = fall_through {
                    block_list.link_blocks(block_id, next);
                }
            }
        }
    }
}

/// Records call and spawn cross-references in both directions. The target
/// procedure entry must already exist; a resolvable target without one is a
/// graph inconsistency and fails the build.
pub fn find_call_edges(
    block_list: &mut BlockList<'_>,
    commands: &Commands,
) -> Result<(), RecompilerError> {
    let (start, end) = block_list.non_dummy_blocks;
    for block_id in start..end {
        let segref = block_list.blocks[block_id].block_begin;

        // Indexes into the block's elements are collected first; linking
        // mutates the proc entries.
        let mut links: SmallVec<[(bool, BlockId); 2]> = SmallVec::new();
        for element in block_list.block_data(block_id) {
            let DataBody::Command(cmd) = &element.data else {
                continue;
            };
            let id = cmd.command_id();
            let is_call = commands.is_call(id);
            let is_spawn = commands.is_label_spawn(id) || commands.is_mission_spawn(id);
            if !is_call && !is_spawn {
                continue;
            }

            let target_block = if commands.is_mission_spawn(id) {
                cmd.args
                    .first()
                    .and_then(|a| a.imm32())
                    .and_then(|m| block_list.block_from_mission(m))
            } else {
                cmd.args
                    .first()
                    .and_then(|a| a.imm32())
                    .and_then(|t| block_list.block_from_label(segref, t))
            };

            let Some(target_block) = target_block else {
                log::warn!(
                    "call/spawn target at 0x{:X} does not resolve; no cross-reference",
                    element.offset
                );
                continue;
            };

            links.push((is_call, target_block));
        }

        for (is_call, target_block) in links {
            let called = block_list.find_proc_by_entry(target_block).ok_or_else(|| {
                RecompilerError::GraphError(format!(
                    "no procedure entry for call/spawn target block {target_block}"
                ))
            })?;
            let caller = block_list.enclosing_proc(block_id).ok_or_else(|| {
                RecompilerError::GraphError(format!("block {block_id} has no enclosing procedure"))
            })?;
            if is_call {
                block_list.link_call(block_id, caller, called);
            } else {
                block_list.link_script_spawn(block_id, caller, called);
            }
        }
    }
    Ok(())
}

/// Recovers the name a script gives itself: walks the procedure's blocks for
/// a SCRIPT_NAME command and returns its string operand.
pub fn find_script_name(
    commands: &Commands,
    block_list: &BlockList<'_>,
    start_block: BlockId,
) -> Option<String> {
    let mut result = None;
    block_list.depth_first(start_block, true, |block_id| {
        for element in block_list.block_data(block_id) {
            if let DataBody::Command(cmd) = &element.data {
                if commands.is_script_name(cmd.command_id()) {
                    result = cmd.args.first().and_then(|a| a.immstr());
                    return false;
                }
            }
        }
        true
    });
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompiler::commands::Commands;

    fn analyzed<'a>(bytes: &'a [u8], commands: &'a Commands) -> Disassembler<'a> {
        let mut disasm = Disassembler::new_main(bytes, commands);
        disasm.run_analyzer();
        disasm.disassembly();
        disasm
    }

    #[test]
    fn straight_line_code_is_one_block() {
        let commands = Commands::default_table();
        let bytes = [
            0x01, 0x00, 0x01, 0x0A, 0x00, 0x00, 0x00, // WAIT 10
            0x4E, 0x00, // TERMINATE_THIS_SCRIPT
        ];
        let disasm = analyzed(&bytes, &commands);
        let block_list = find_basic_blocks(&commands, &disasm, &[]);

        assert_eq!(block_list.non_dummy_blocks, (0, 1));
        assert_eq!(block_list.blocks[0].length, 2);
        assert_eq!(block_list.proc_entries.len(), 1);
        assert_eq!(block_list.proc_entries[0].proc_type, ProcType::MAIN);
        // One dummy exit reserved for Main.
        assert_eq!(block_list.blocks.len(), 2);
    }

    #[test]
    fn conditional_branch_splits_blocks_and_orders_successors() {
        let commands = Commands::default_table();
        let bytes = [
            0x4D, 0x00, 0x01, 0x0E, 0x00, 0x00, 0x00, // 0: GOTO_IF_FALSE 14
            0x01, 0x00, 0x01, 0x0A, 0x00, 0x00, 0x00, // 7: WAIT 10
            0x4E, 0x00, // 14: TERMINATE_THIS_SCRIPT
        ];
        let disasm = analyzed(&bytes, &commands);
        let mut block_list = find_basic_blocks(&commands, &disasm, &[]);
        find_edges(&mut block_list, &commands);

        // Block 0 = branch, block 1 = fall-through, block 2 = target.
        assert_eq!(block_list.non_dummy_blocks, (0, 3));
        // Target first, then fall-through: the target edge is the falsy exit.
        assert_eq!(block_list.blocks[0].succ.as_slice(), &[2, 1]);
        assert_eq!(block_list.blocks[1].succ.as_slice(), &[2]);
        assert!(block_list.is_pre_end_block(2));
        // Symmetry of pred/succ.
        for (id, block) in block_list.blocks.iter().enumerate() {
            for &s in &block.succ {
                assert!(block_list.blocks[s].pred.contains(&id));
            }
            for &p in &block.pred {
                assert!(block_list.blocks[p].succ.contains(&id));
            }
        }
    }

    #[test]
    fn gosub_creates_procedure_and_call_edges() {
        let commands = Commands::default_table();
        let bytes = [
            0x50, 0x00, 0x01, 0x10, 0x00, 0x00, 0x00, // 0: GOSUB 16
            0x4E, 0x00, // 7: TERMINATE_THIS_SCRIPT
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // 9..15: unreachable
            0x51, 0x00, // 16: RETURN
        ];
        let disasm = analyzed(&bytes, &commands);
        let mut block_list = find_basic_blocks(&commands, &disasm, &[]);
        find_edges(&mut block_list, &commands);
        find_call_edges(&mut block_list, &commands).unwrap();

        assert_eq!(block_list.proc_entries.len(), 2);
        let main = &block_list.proc_entries[0];
        let sub = &block_list.proc_entries[1];
        assert_eq!(main.proc_type, ProcType::MAIN);
        assert_eq!(sub.proc_type, ProcType::GOSUB);
        assert_eq!(main.calls_into.len(), 1);
        assert_eq!(sub.called_from.len(), 1);
        assert_eq!(main.calls_into[0].proc_id, 1);
        assert_eq!(sub.called_from[0].proc_id, 0);

        // RETURN links the gosub body to its own exit, not Main's.
        assert_eq!(sub.exit_block, Some(block_list.exit_block_of(1)));
    }

    #[test]
    fn trailing_hex_stays_in_the_goto_block() {
        let commands = Commands::default_table();
        // GOTO 0 (self loop) followed by garbage that never decodes.
        let bytes = [
            0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // GOTO 0
            0xEE, 0xEE, 0xEE, // garbage
        ];
        let disasm = analyzed(&bytes, &commands);
        let block_list = find_basic_blocks(&commands, &disasm, &[]);

        // Label def + GOTO + hex in a single block.
        assert_eq!(block_list.non_dummy_blocks, (0, 1));
        assert_eq!(block_list.blocks[0].length, 3);
    }

    #[test]
    fn script_name_is_recovered() {
        let commands = Commands::default_table();
        let mut bytes = vec![
            0xA4, 0x03, 0x09, // SCRIPT_NAME, fixed-8 string
        ];
        bytes.extend_from_slice(b"intro\0\0\0");
        bytes.extend_from_slice(&[0x4E, 0x00]); // TERMINATE_THIS_SCRIPT
        let disasm = analyzed(&bytes, &commands);
        let mut block_list = find_basic_blocks(&commands, &disasm, &[]);
        find_edges(&mut block_list, &commands);

        let entry = block_list.proc_entries[0].block_id;
        assert_eq!(
            find_script_name(&commands, &block_list, entry).as_deref(),
            Some("intro")
        );
    }
}
