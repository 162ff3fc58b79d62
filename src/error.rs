use crate::log::*;
use crate::register::Addr;
use thiserror::Error;

/// Failures raised while slicing. Most variants are decoder coverage gaps: shapes of micro-ops
/// that slicing has no rule for. See [`SliceError::report`] for how those are surfaced.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SliceError {
    #[error("Micro-op {idx} at {pc:#x} has {count} source operands, which is not handled for its opcode")]
    UnexpectedOperandCount { pc: Addr, idx: i32, count: usize },
    #[error("Micro-op {idx} at {pc:#x} has no resolved value for source operand {operand}")]
    MissingOperand { pc: Addr, idx: i32, operand: usize },
    #[error("Micro-op {idx} at {pc:#x} uses register {reg}, whose class is not modeled")]
    UnexpectedRegisterClass { pc: Addr, idx: i32, reg: String },
    #[error("Micro-op {idx} at {pc:#x} defines a value from no registers but is not a move")]
    NonMoveWithoutSources { pc: Addr, idx: i32 },
    #[error("Load micro-op {idx} at {pc:#x} has no pending value")]
    MissingLoadValue { pc: Addr, idx: i32 },
    #[error("Micro-op {idx} at {pc:#x} closes a value cycle without reading the tracked register")]
    CycleWithoutTrackedRegister { pc: Addr, idx: i32 },
    #[error("Micro-op {idx} at {pc:#x} was reached outside of the single-iteration window")]
    OutsideIterationWindow { pc: Addr, idx: i32 },
    #[error("Loop {marker} has parent {parent}, but enclosing loops must have smaller markers")]
    BadLoopParent { marker: u32, parent: u32 },
    #[error("No cyclic path found through block {block} for loop marker {marker}")]
    NoCyclicPath { block: usize, marker: u32 },
    #[error("Micro-op {idx} at {pc:#x} has no memory operand")]
    MissingMemoryOperand { pc: Addr, idx: i32 },
    #[error("Base address of memory operand {opidx} at {pc:#x} has not been computed yet")]
    MissingBaseFormula { pc: Addr, opidx: i32 },
    #[error("Memory operand {opidx} at {pc:#x} already has {found} strides recorded, expected {expected}")]
    StrideCountMismatch {
        pc: Addr,
        opidx: i32,
        expected: usize,
        found: usize,
    },
}

pub type SliceResult<T> = Result<T, SliceError>;

impl SliceError {
    /// Whether this is a gap in the modeled micro-op grammar, as opposed to a structural failure
    /// of the analysis itself.
    pub fn is_coverage_gap(&self) -> bool {
        !matches!(
            self,
            SliceError::NoCyclicPath { .. }
                | SliceError::BadLoopParent { .. }
                | SliceError::MissingMemoryOperand { .. }
                | SliceError::MissingBaseFormula { .. }
                | SliceError::StrideCountMismatch { .. }
        )
    }

    /// Log the error. Coverage gaps are only propagated when `strict` is set; callers recover from
    /// a non-propagated gap by substituting an opaque term. Structural failures always propagate.
    pub fn report(self, strict: bool) -> SliceResult<()> {
        error!("{}", self; "coverage_gap" => self.is_coverage_gap());
        if strict || !self.is_coverage_gap() {
            Err(self)
        } else {
            Ok(())
        }
    }
}

/// Failures while reading a textual CFG description
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LiftError {
    #[error("Line {line}: unknown register `{name}`")]
    UnknownRegister { line: usize, name: String },
    #[error("Line {line}: could not parse operand `{text}`")]
    BadOperand { line: usize, text: String },
    #[error("Line {line}: could not parse number `{text}`")]
    BadNumber { line: usize, text: String },
    #[error("Line {line}: unknown {what} `{text}`")]
    UnknownKeyword {
        line: usize,
        what: &'static str,
        text: String,
    },
    #[error("Line {line}: reference to undeclared block {id}")]
    UnknownBlock { line: usize, id: usize },
    #[error("Line {line}: micro-op outside of any block")]
    OrphanMicroOp { line: usize },
    #[error("Line {line}: malformed line `{text}`")]
    Malformed { line: usize, text: String },
    #[error("Line {line}: {source}")]
    LoopTree { line: usize, source: SliceError },
}
