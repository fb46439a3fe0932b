//! Error Handling
//!
//! Typed errors for the recompiler using `thiserror`, plus the advisory
//! machinery for the forgiving stages. Disassembly never aborts on malformed
//! input; it degrades the affected bytes to hex runs and records an
//! [`Advisory`]. Flow analysis and code generation are strict and surface
//! [`RecompilerError`] values.

use thiserror::Error;

/// Recompiler error types.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RecompilerError {
    /// SCM header parsing error (truncated structure or sentinel mismatch).
    #[error("header parse error: {0}")]
    HeaderParseError(String),

    /// Control flow graph inconsistency (e.g. call target without a
    /// procedure entry). Fatal to the whole block list build.
    #[error("graph error: {0}")]
    GraphError(String),

    /// Code generation failure (unsupported argument shape, malformed
    /// statement tree).
    #[error("code generation error: {0}")]
    CodeGenError(String),

    /// No emitter registered for a command id.
    #[error("unsupported opcode 0x{0:04X}")]
    UnsupportedOpcode(u16),

    /// An imported runtime symbol could not be resolved.
    #[error("unknown import: {0}")]
    UnknownImport(String),

    /// A referenced assembler label was never bound when linking.
    #[error("unbound assembler label {0}")]
    UnboundLabel(usize),
}

/// Kind of a non-fatal disassembly advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvisoryKind {
    /// A fetch ran past the end of the segment.
    Truncated,
    /// The 16-bit opcode selects no known command.
    UnknownOpcode,
    /// An argument type tag is not part of the encoding.
    UnknownArgTag,
    /// A variadic argument list ran out of bytes before its end marker.
    UnterminatedVariadic,
    /// A label operand points outside the addressable range.
    UnresolvedLabel,
}

/// A non-fatal finding recorded while exploring a segment.
///
/// The offending bytes are preserved as hex in the output stream; the
/// advisory carries enough context for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advisory {
    /// Local offset the finding is anchored to.
    pub offset: u32,
    pub kind: AdvisoryKind,
    pub message: String,
}

impl Advisory {
    pub fn new(offset: u32, kind: AdvisoryKind, message: impl Into<String>) -> Self {
        Self {
            offset,
            kind,
            message: message.into(),
        }
    }
}

/// Aggregates advisories from every analyzed segment.
///
/// The context distinguishes fatal from non-fatal: advisories accumulate,
/// while fatal conditions are returned as [`RecompilerError`] by the stage
/// that hit them.
#[derive(Debug, Default)]
pub struct ProgramContext {
    advisories: Vec<Advisory>,
}

impl ProgramContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&mut self, advisory: Advisory) {
        log::warn!(
            "advisory at offset 0x{:X}: {}",
            advisory.offset,
            advisory.message
        );
        self.advisories.push(advisory);
    }

    pub fn extend(&mut self, advisories: impl IntoIterator<Item = Advisory>) {
        for advisory in advisories {
            self.report(advisory);
        }
    }

    pub fn advisories(&self) -> &[Advisory] {
        &self.advisories
    }

    pub fn has_advisories(&self) -> bool {
        !self.advisories.is_empty()
    }
}
