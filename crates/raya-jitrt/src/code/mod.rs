//! Compiled code: units, their side tables, and the repository that owns them

pub mod cache;
pub mod unit;

pub use cache::{CodeRepository, SweepReport, CODE_HEAP_BASE};
pub use unit::{
    Activation, CompiledUnit, DeoptSite, ExceptionRange, ExceptionTable, ObjectRef, PointerLocation,
    StackMapEntry, UnitCandidate, UnitState, STUB_SIZE,
};
