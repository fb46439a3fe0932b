//! Structured Statement Tree
//!
//! Reduces a procedure's CFG into a tree of typed structured statements:
//! plain blocks, while loops with explicit breaks, and if/if-else regions.
//!
//! Statement nodes live in an arena addressed by [`StatementId`]; successor
//! and predecessor links are id lists, so the loops that would create
//! reference cycles under shared ownership are just indices here. Strong
//! traversal flows head-to-tail through `succ`; `pred` is the back-reference
//! side.
//!
//! Reduction order matters: [`structure_dowhile`] consumes the loop list
//! sorted inner-first, then [`structure_conditionals`] runs to a fixed point
//! over the remaining conditional blocks, then [`mark_break_continue`] flags
//! blocks whose trailing branch re-enters or exits an enclosing loop.

use crate::recompiler::analysis::{BlockId, BlockList, Loop};
use crate::recompiler::commands::Commands;
use crate::recompiler::error::RecompilerError;
use std::collections::HashMap;

pub type StatementId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// A basic block. `trim_from`/`trim_until` cut elements off the head and
    /// tail at emission time so loop reduction can elide the back-jump
    /// without duplicating instructions.
    Block {
        block: BlockId,
        trim_from: u16,
        trim_until: u16,
        goto_break: bool,
        goto_continue: bool,
    },
    /// A reduced natural loop. `head` carries the loop condition; `tail`
    /// ends with the (trimmed) back edge. Both stay reachable through these
    /// ids only once every outside predecessor is rerouted to the `While`.
    While {
        head: StatementId,
        tail: StatementId,
    },
    If {
        cond: StatementId,
        then_head: StatementId,
    },
    IfElse {
        cond: StatementId,
        then_head: StatementId,
        else_head: StatementId,
    },
    Break,
}

#[derive(Debug, Clone)]
pub struct Statement {
    pub kind: StatementKind,
    pub pred: Vec<StatementId>,
    pub succ: Vec<StatementId>,
}

/// Arena of statement nodes for one procedure.
#[derive(Debug, Default)]
pub struct StatementTree {
    nodes: Vec<Statement>,
    block_nodes: HashMap<BlockId, StatementId>,
}

impl StatementTree {
    pub fn node(&self, id: StatementId) -> &Statement {
        &self.nodes[id]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// The statement created for a CFG block, if any.
    pub fn statement_of_block(&self, block: BlockId) -> Option<StatementId> {
        self.block_nodes.get(&block).copied()
    }

    fn push(&mut self, kind: StatementKind) -> StatementId {
        self.nodes.push(Statement {
            kind,
            pred: Vec::new(),
            succ: Vec::new(),
        });
        self.nodes.len() - 1
    }

    pub fn add_successor(&mut self, node: StatementId, succ: StatementId) {
        self.nodes[node].succ.push(succ);
        self.nodes[succ].pred.push(node);
    }

    fn remove_edge(&mut self, from: StatementId, to: StatementId) {
        if let Some(pos) = self.nodes[from].succ.iter().position(|&s| s == to) {
            self.nodes[from].succ.remove(pos);
        }
        if let Some(pos) = self.nodes[to].pred.iter().position(|&p| p == from) {
            self.nodes[to].pred.remove(pos);
        }
    }

    fn replace_successor(&mut self, node: StatementId, old: StatementId, new: StatementId) {
        let slots = self.nodes[node].succ.iter().filter(|&&s| s == old).count();
        for s in self.nodes[node].succ.iter_mut() {
            if *s == old {
                *s = new;
            }
        }
        for _ in 0..slots {
            if let Some(pos) = self.nodes[old].pred.iter().position(|&p| p == node) {
                self.nodes[old].pred.remove(pos);
            }
            self.nodes[new].pred.push(node);
        }
    }

    /// Reroutes every predecessor of `node` (but `except`) to `new_succ`.
    fn unlink_preds(
        &mut self,
        node: StatementId,
        new_succ: StatementId,
        except: Option<StatementId>,
    ) {
        let preds = std::mem::take(&mut self.nodes[node].pred);
        let mut kept = Vec::new();
        for p in preds {
            if Some(p) == except {
                kept.push(p);
                continue;
            }
            for s in self.nodes[p].succ.iter_mut() {
                if *s == node {
                    *s = new_succ;
                }
            }
            self.nodes[new_succ].pred.push(p);
        }
        self.nodes[node].pred = kept;
    }

    /// Pre-order depth-first walk over successor links. The visitor returns
    /// `false` to stop.
    pub fn depth_first(&self, start: StatementId, mut visitor: impl FnMut(StatementId) -> bool) {
        let mut visited = vec![false; self.nodes.len()];
        self.depth_first_rec(&mut visited, start, &mut visitor);
    }

    fn depth_first_rec(
        &self,
        visited: &mut Vec<bool>,
        node: StatementId,
        visitor: &mut impl FnMut(StatementId) -> bool,
    ) -> bool {
        visited[node] = true;
        if !visitor(node) {
            return false;
        }
        let succ = self.nodes[node].succ.clone();
        for next in succ {
            if !visited[next] && !self.depth_first_rec(visited, next, visitor) {
                return false;
            }
        }
        true
    }
}

/// Builds the statement DAG for the CFG reachable from `entry_block`:
/// exactly one `Block` statement per reachable block, with shared successors
/// collapsed into re-used nodes.
pub fn to_statements(block_list: &BlockList<'_>, entry_block: BlockId) -> (StatementTree, StatementId) {
    let mut tree = StatementTree::default();
    let entry = to_statements_internal(&mut tree, block_list, entry_block);
    (tree, entry)
}

fn to_statements_internal(
    tree: &mut StatementTree,
    block_list: &BlockList<'_>,
    block_id: BlockId,
) -> StatementId {
    let node = tree.push(StatementKind::Block {
        block: block_id,
        trim_from: 0,
        trim_until: 0,
        goto_break: false,
        goto_continue: false,
    });
    tree.block_nodes.insert(block_id, node);

    for &succ in &block_list.block(block_id).succ {
        let next = match tree.block_nodes.get(&succ) {
            Some(&existing) => existing,
            None => to_statements_internal(tree, block_list, succ),
        };
        tree.add_successor(node, next);
    }

    node
}

/// Reduces each loop of the sorted list into a `While` node:
/// 1. reroute every predecessor of the loop head (except the tail) to the
///    new node;
/// 2. replace the head's falsy exit edge with a `Break` and adopt the old
///    break target as the `While`'s sole successor;
/// 3. advance the tail's trim counter so the back-jump is elided;
/// 4. if the entry was the loop head, the `While` becomes the entry.
///
/// Loops whose head is no longer reachable from the entry are skipped.
pub fn structure_dowhile(
    tree: &mut StatementTree,
    entry: StatementId,
    loops: &[Loop],
) -> Result<StatementId, RecompilerError> {
    let mut entry = entry;

    for loop_ in loops {
        let mut stmt_head: Option<StatementId> = None;
        let mut stmt_tail: Option<StatementId> = None;
        tree.depth_first(entry, |id| {
            if let StatementKind::Block { block, .. } = tree.node(id).kind {
                if block == loop_.head {
                    stmt_head = Some(id);
                }
                if block == loop_.tail {
                    stmt_tail = Some(id);
                }
                return !(stmt_head.is_some() && stmt_tail.is_some());
            }
            true
        });

        // Statements for this loop are not in the entry tree (e.g. its head
        // was swallowed by a previous reduction sharing it).
        let (Some(head), Some(tail)) = (stmt_head, stmt_tail) else {
            continue;
        };

        if tree.node(head).succ.len() != 2 {
            return Err(RecompilerError::GraphError(format!(
                "loop head block {} has {} successors, expected 2",
                loop_.head,
                tree.node(head).succ.len()
            )));
        }
        let break_target = tree.node(head).succ[0];

        let node_while = tree.push(StatementKind::While { head, tail });
        tree.unlink_preds(head, node_while, Some(tail));

        let node_break = tree.push(StatementKind::Break);
        tree.replace_successor(head, break_target, node_break);
        tree.add_successor(node_while, break_target);

        if let StatementKind::Block { trim_until, .. } = &mut tree.nodes[tail].kind {
            *trim_until += 1;
        }

        if entry == head {
            entry = node_while;
        }
    }

    Ok(entry)
}

/// Introduces `If`/`IfElse` nodes at conditional-branch blocks whose arms
/// re-converge, repeating until no reducible shape remains. The falsy edge
/// (`succ[0]`) is the else/exit side.
pub fn structure_conditionals(
    tree: &mut StatementTree,
    block_list: &BlockList<'_>,
    commands: &Commands,
    entry: StatementId,
) -> StatementId {
    let mut entry = entry;

    loop {
        let mut candidate: Option<(StatementId, bool)> = None;
        tree.depth_first(entry, |id| {
            let node = tree.node(id);
            let StatementKind::Block { block, .. } = node.kind else {
                return true;
            };
            if node.succ.len() != 2 {
                return true;
            }
            let is_conditional = block_list
                .block_terminator(block)
                .map(|cmd| commands.is_conditional_branch(cmd.command_id()))
                .unwrap_or(false);
            if !is_conditional {
                return true;
            }

            let else_t = node.succ[0];
            let then_t = node.succ[1];
            if else_t == id || then_t == id || else_t == then_t {
                return true;
            }

            // If-else: both arms are single-entry and converge on a join.
            let single_arm = |arm: StatementId| {
                tree.node(arm).pred.len() == 1 && tree.node(arm).succ.len() == 1
            };
            if single_arm(then_t)
                && single_arm(else_t)
                && tree.node(then_t).succ[0] == tree.node(else_t).succ[0]
                && tree.node(then_t).succ[0] != id
            {
                candidate = Some((id, true));
                return false;
            }

            // If without else: the then arm flows straight into the falsy
            // target, which is the join.
            if tree.node(then_t).pred.len() == 1
                && tree.node(then_t).succ.len() == 1
                && tree.node(then_t).succ[0] == else_t
            {
                candidate = Some((id, false));
                return false;
            }

            true
        });

        let Some((cond, has_else)) = candidate else {
            return entry;
        };

        let else_t = tree.node(cond).succ[0];
        let then_t = tree.node(cond).succ[1];

        if has_else {
            let join = tree.node(then_t).succ[0];
            let node_ifelse = tree.push(StatementKind::IfElse {
                cond,
                then_head: then_t,
                else_head: else_t,
            });
            tree.unlink_preds(cond, node_ifelse, None);
            tree.remove_edge(cond, then_t);
            tree.remove_edge(cond, else_t);
            tree.remove_edge(then_t, join);
            tree.remove_edge(else_t, join);
            tree.add_successor(node_ifelse, join);
            if entry == cond {
                entry = node_ifelse;
            }
        } else {
            let join = else_t;
            let node_if = tree.push(StatementKind::If {
                cond,
                then_head: then_t,
            });
            tree.unlink_preds(cond, node_if, None);
            tree.remove_edge(cond, then_t);
            tree.remove_edge(cond, join);
            tree.remove_edge(then_t, join);
            tree.add_successor(node_if, join);
            if entry == cond {
                entry = node_if;
            }
        }
    }
}

/// Flags blocks whose trailing unconditional branch targets a loop's head
/// (continue) or break target (break). Emission replaces the branch with the
/// structural form.
pub fn mark_break_continue(
    tree: &mut StatementTree,
    block_list: &BlockList<'_>,
    commands: &Commands,
) {
    let whiles: Vec<StatementId> = (0..tree.len())
        .filter(|&id| matches!(tree.node(id).kind, StatementKind::While { .. }))
        .collect();

    for while_id in whiles {
        let StatementKind::While { head, tail } = tree.node(while_id).kind else {
            continue;
        };
        let StatementKind::Block { block: head_block, .. } = tree.node(head).kind else {
            continue;
        };
        let continue_offset = block_entry_offset(block_list, head_block);
        let break_offset = tree
            .node(while_id)
            .succ
            .first()
            .and_then(|&s| match tree.node(s).kind {
                StatementKind::Block { block, .. } => Some(block_entry_offset(block_list, block)),
                _ => None,
            });

        let mut interior: Vec<StatementId> = Vec::new();
        tree.depth_first(head, |id| {
            interior.push(id);
            true
        });

        for id in interior {
            let StatementKind::Block { block, .. } = tree.node(id).kind else {
                continue;
            };
            if id == tail {
                // The tail's back-jump is already elided by its trim.
                continue;
            }
            let Some(terminator) = block_list.block_terminator(block) else {
                continue;
            };
            if !commands.is_unconditional_branch(terminator.command_id()) {
                continue;
            }
            let target = terminator.args.first().and_then(|a| a.imm32());
            let StatementKind::Block {
                goto_break,
                goto_continue,
                ..
            } = &mut tree.nodes[id].kind
            else {
                continue;
            };
            if target.is_some() && target == continue_offset.map(|o| o as i32) {
                *goto_continue = true;
            } else if target.is_some() && target == break_offset.flatten().map(|o| o as i32) {
                *goto_break = true;
            }
        }
    }
}

fn block_entry_offset(block_list: &BlockList<'_>, block: BlockId) -> Option<u32> {
    block_list.block_data(block).first().map(|d| d.offset)
}
