//! Dominator and Natural Loop Analysis
//!
//! Classical iterative dataflow over the block list, once per procedure:
//! `dom(entry) = {entry}`, and for every other reachable block
//! `dom(b) = {b} ∪ ⋂ dom(p)` over its reachable predecessors, iterated to a
//! fixed point. Post-dominators are the dual, seeded at the procedure's exit
//! block. Natural loops are the back edges `tail → head` where the head
//! dominates the tail; a loop body grows by reverse reachability from the
//! tail staying within blocks the head dominates.

use crate::recompiler::analysis::control_flow::{BlockId, BlockList, BlockRange};
use bitvec::prelude::*;

/// A natural loop identified by its back edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Loop {
    /// Target of the back edge; dominates every block of the loop.
    pub head: BlockId,
    /// Source of the back edge.
    pub tail: BlockId,
    /// Blocks forming the loop body, including head and tail.
    pub blocks: Vec<BlockId>,
}

impl Loop {
    pub fn contains(&self, block_id: BlockId) -> bool {
        self.blocks.contains(&block_id)
    }
}

/// Computes dominator and post-dominator bitsets for every block, one
/// procedure at a time.
pub fn compute_dominators(block_list: &mut BlockList<'_>) {
    let total = block_list.blocks.len();

    for proc_id in 0..block_list.proc_entries.len() {
        let entry = block_list.proc_entries[proc_id].block_id;
        let forward = solve_dataflow(block_list, entry, total, true);
        for (block_id, dom) in forward {
            block_list.blocks[block_id].dominators = dom;
        }

        if let Some(exit) = block_list.proc_entries[proc_id].exit_block {
            let backward = solve_dataflow(block_list, exit, total, false);
            for (block_id, dom) in backward {
                block_list.blocks[block_id].post_dominators = dom;
            }
        }
    }
}

/// Iterative dominance solver. `forward` computes dominators from `entry`
/// over successor edges; otherwise post-dominators over predecessor edges.
fn solve_dataflow(
    block_list: &BlockList<'_>,
    entry: BlockId,
    total: usize,
    forward: bool,
) -> Vec<(BlockId, BitVec)> {
    // Membership: blocks reachable from the entry along the walked
    // direction. The dataflow is restricted to them.
    let mut members = bitvec![0; total];
    block_list.depth_first(entry, forward, |b| {
        members.set(b, true);
        true
    });

    let member_ids: Vec<BlockId> = members.iter_ones().collect();
    let mut sets: Vec<BitVec> = vec![BitVec::new(); total];
    for &b in &member_ids {
        if b == entry {
            let mut set = bitvec![0; total];
            set.set(entry, true);
            sets[b] = set;
        } else {
            sets[b] = members.clone();
        }
    }

    let mut changed = true;
    while changed {
        changed = false;
        for &b in &member_ids {
            if b == entry {
                continue;
            }
            // Meet over the incoming edges of the walked direction.
            let incoming = if forward {
                &block_list.blocks[b].pred
            } else {
                &block_list.blocks[b].succ
            };
            let mut new_set = members.clone();
            for &p in incoming.iter().filter(|&&p| members[p]) {
                let other = &sets[p];
                for i in 0..total {
                    if new_set[i] && !other[i] {
                        new_set.set(i, false);
                    }
                }
            }
            new_set.set(b, true);
            if new_set != sets[b] {
                sets[b] = new_set;
                changed = true;
            }
        }
    }

    member_ids.into_iter().map(|b| (b, sets[b].clone())).collect()
}

/// Finds every natural loop among the non-dummy blocks.
pub fn find_natural_loops(block_list: &BlockList<'_>) -> Vec<Loop> {
    find_natural_loops_in_range(block_list, block_list.non_dummy_blocks)
}

/// Finds the natural loops whose back edge lies within `range`.
pub fn find_natural_loops_in_range(block_list: &BlockList<'_>, range: BlockRange) -> Vec<Loop> {
    let mut loops = Vec::new();
    for tail in range.0..range.1 {
        for &head in &block_list.blocks[tail].succ {
            if !block_list.blocks[tail].dominated_by(head) {
                continue;
            }

            // Grow the body by reverse reachability from the tail, staying
            // within blocks dominated by the head.
            let mut body = bitvec![0; block_list.blocks.len()];
            body.set(head, true);
            body.set(tail, true);
            let mut stack = vec![tail];
            while let Some(block) = stack.pop() {
                for &p in &block_list.blocks[block].pred {
                    if !body[p] && block_list.blocks[p].dominated_by(head) {
                        body.set(p, true);
                        stack.push(p);
                    }
                }
            }

            loops.push(Loop {
                head,
                tail,
                blocks: body.iter_ones().collect(),
            });
        }
    }
    loops
}

/// Orders loops so that inner loops precede their enclosing loops: `A`
/// precedes `B` when `A`'s head is dominated by `B`'s head. Ties break on
/// head block id.
pub fn sort_natural_loops(block_list: &BlockList<'_>, loops: &mut [Loop]) {
    loops.sort_by(|a, b| {
        use std::cmp::Ordering;
        if a.head == b.head {
            return a.tail.cmp(&b.tail);
        }
        if block_list.blocks[a.head].dominated_by(b.head) {
            Ordering::Less
        } else if block_list.blocks[b.head].dominated_by(a.head) {
            Ordering::Greater
        } else {
            a.head.cmp(&b.head)
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recompiler::analysis::control_flow::{find_basic_blocks, find_edges};
    use crate::recompiler::commands::Commands;
    use crate::recompiler::disassembler::Disassembler;

    fn dom_ids(block_list: &BlockList<'_>, block: BlockId) -> Vec<BlockId> {
        block_list.blocks[block].dominators.iter_ones().collect()
    }

    #[test]
    fn diamond_dominators() {
        let commands = Commands::default_table();
        let bytes = [
            0x4D, 0x00, 0x01, 0x0E, 0x00, 0x00, 0x00, // A  0: GOTO_IF_FALSE 14
            0x02, 0x00, 0x01, 0x15, 0x00, 0x00, 0x00, // B  7: GOTO 21
            0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // C 14: WAIT 0
            0x4E, 0x00, // D 21: TERMINATE_THIS_SCRIPT
        ];
        let mut disasm = Disassembler::new_main(&bytes, &commands);
        disasm.run_analyzer();
        disasm.disassembly();
        let mut block_list = find_basic_blocks(&commands, &disasm, &[]);
        find_edges(&mut block_list, &commands);
        compute_dominators(&mut block_list);

        // A=0, B=1, C=2, D=3 by layout order.
        assert_eq!(dom_ids(&block_list, 0), vec![0]);
        assert_eq!(dom_ids(&block_list, 1), vec![0, 1]);
        assert_eq!(dom_ids(&block_list, 2), vec![0, 2]);
        assert_eq!(dom_ids(&block_list, 3), vec![0, 3], "join is dominated only by the fork");

        // The join post-dominates both arms.
        assert!(block_list.blocks[1].postdominated_by(3));
        assert!(block_list.blocks[2].postdominated_by(3));
    }

    #[test]
    fn single_back_edge_is_one_natural_loop() {
        let commands = Commands::default_table();
        let bytes = [
            0x4D, 0x00, 0x01, 0x15, 0x00, 0x00, 0x00, // H  0: GOTO_IF_FALSE 21
            0x01, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // T  7: WAIT 0
            0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, //   14: GOTO 0
            0x4E, 0x00, // E 21: TERMINATE_THIS_SCRIPT
        ];
        let mut disasm = Disassembler::new_main(&bytes, &commands);
        disasm.run_analyzer();
        disasm.disassembly();
        let mut block_list = find_basic_blocks(&commands, &disasm, &[]);
        find_edges(&mut block_list, &commands);
        compute_dominators(&mut block_list);

        let loops = find_natural_loops(&block_list);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].head, 0);
        assert_eq!(loops[0].tail, 1);
        assert_eq!(loops[0].blocks, vec![0, 1]);
        assert!(
            block_list.blocks[loops[0].tail].dominated_by(loops[0].head),
            "every natural-loop head dominates its tail"
        );
    }

    #[test]
    fn self_loop_has_single_block_body() {
        let commands = Commands::default_table();
        let bytes = [
            0x02, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, // GOTO 0
        ];
        let mut disasm = Disassembler::new_main(&bytes, &commands);
        disasm.run_analyzer();
        disasm.disassembly();
        let mut block_list = find_basic_blocks(&commands, &disasm, &[]);
        find_edges(&mut block_list, &commands);
        compute_dominators(&mut block_list);

        let loops = find_natural_loops(&block_list);
        assert_eq!(loops.len(), 1);
        assert_eq!(loops[0].head, loops[0].tail);
        assert_eq!(loops[0].blocks, vec![0]);
    }
}
