//! Action-List Assembler
//!
//! A small IA-32 assembler with the primitives the code generator needs:
//! raw byte runs, program-counter labels, label-relative rel32 fields,
//! base-relative call fields for imported symbols, and 16-byte alignment
//! pads. Emission appends actions; [`Assembler::link`] assigns every action
//! a position and verifies that all referenced labels are bound;
//! [`Assembler::encode`] serializes the actions into final bytes, patching
//! the relative fields against the given load base.

use crate::recompiler::error::RecompilerError;

pub type LabelId = usize;

#[derive(Debug, Clone)]
enum Action {
    /// Literal bytes.
    Raw(Vec<u8>),
    /// Bind a label at the current position.
    Bind(LabelId),
    /// A 4-byte field holding `label_pos - (field_pos + 4)`.
    LabelRel32(LabelId),
    /// A 4-byte field holding `target - (base + field_pos + 4)`, used for
    /// near calls/jumps to absolute import addresses.
    AbsRel32(u32),
    /// Pad with NOPs to the next multiple of the given power of two.
    Align(usize),
}

impl Action {
    /// Encoded size given the position the action starts at.
    fn size_at(&self, pos: usize) -> usize {
        match *self {
            Action::Raw(ref bytes) => bytes.len(),
            Action::Bind(_) => 0,
            Action::LabelRel32(_) | Action::AbsRel32(_) => 4,
            Action::Align(alignment) => pos.next_multiple_of(alignment) - pos,
        }
    }
}

/// Accumulates emitted actions and serializes them once linked.
#[derive(Debug, Default)]
pub struct Assembler {
    actions: Vec<Action>,
    num_labels: usize,
    /// Filled by `link`: byte position of every bound label.
    label_positions: Vec<Option<usize>>,
    linked_size: Option<usize>,
}

impl Assembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocates a fresh program-counter label. Labels are patchable until
    /// `link` runs: references may precede the bind.
    pub fn new_label(&mut self) -> LabelId {
        self.num_labels += 1;
        self.invalidate();
        self.num_labels - 1
    }

    pub fn num_labels(&self) -> usize {
        self.num_labels
    }

    /// Binds `label` at the current emission position.
    pub fn bind(&mut self, label: LabelId) {
        self.invalidate();
        self.actions.push(Action::Bind(label));
    }

    pub fn raw(&mut self, bytes: &[u8]) {
        self.invalidate();
        // Coalesce adjacent raw runs to keep the action list short.
        if let Some(Action::Raw(last)) = self.actions.last_mut() {
            last.extend_from_slice(bytes);
            return;
        }
        self.actions.push(Action::Raw(bytes.to_vec()));
    }

    /// Emits a 4-byte label-relative field (the displacement of a jump or
    /// call whose opcode bytes were just emitted).
    pub fn label_rel32(&mut self, label: LabelId) {
        self.invalidate();
        self.actions.push(Action::LabelRel32(label));
    }

    /// Emits a 4-byte field relative to an absolute target, patched against
    /// the load base at encode time.
    pub fn abs_rel32(&mut self, target: u32) {
        self.invalidate();
        self.actions.push(Action::AbsRel32(target));
    }

    /// Pads with NOPs to an `alignment`-byte boundary.
    pub fn align(&mut self, alignment: usize) {
        debug_assert!(alignment.is_power_of_two());
        self.invalidate();
        self.actions.push(Action::Align(alignment));
    }

    fn invalidate(&mut self) {
        self.linked_size = None;
    }

    /// Assigns positions, verifies every referenced label is bound, and
    /// returns the final code size.
    pub fn link(&mut self) -> Result<usize, RecompilerError> {
        let mut positions = vec![None; self.num_labels];
        let mut pos = 0usize;
        for action in &self.actions {
            if let Action::Bind(label) = *action {
                positions[label] = Some(pos);
            }
            pos += action.size_at(pos);
        }

        for action in &self.actions {
            if let Action::LabelRel32(label) = *action {
                if positions[label].is_none() {
                    return Err(RecompilerError::UnboundLabel(label));
                }
            }
        }

        self.label_positions = positions;
        self.linked_size = Some(pos);
        Ok(pos)
    }

    /// Serializes the linked actions against the load address `base`.
    pub fn encode(&self, base: u32) -> Result<Vec<u8>, RecompilerError> {
        let size = self.linked_size.ok_or_else(|| {
            RecompilerError::CodeGenError("encode called before link".to_string())
        })?;

        let mut buf = Vec::with_capacity(size);
        for action in &self.actions {
            let pos = buf.len();
            match *action {
                Action::Raw(ref bytes) => buf.extend_from_slice(bytes),
                Action::Bind(_) => {}
                Action::LabelRel32(label) => {
                    let dest = self.label_positions[label]
                        .ok_or(RecompilerError::UnboundLabel(label))?;
                    let rel = dest as i64 - (pos as i64 + 4);
                    buf.extend_from_slice(&(rel as i32).to_le_bytes());
                }
                Action::AbsRel32(target) => {
                    let rel = i64::from(target) - (i64::from(base) + pos as i64 + 4);
                    buf.extend_from_slice(&(rel as i32).to_le_bytes());
                }
                Action::Align(alignment) => {
                    let pad = pos.next_multiple_of(alignment) - pos;
                    buf.resize(pos + pad, 0x90);
                }
            }
        }

        debug_assert_eq!(buf.len(), size);
        Ok(buf)
    }
}
