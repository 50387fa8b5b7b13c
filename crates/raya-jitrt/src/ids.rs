//! Identifiers shared across the runtime
//!
//! Klass and method ids name entities owned by the type system. Unit and
//! mirror ids are arena handles: an index plus a generation, so a slot that is
//! reused after a sweep never aliases an identifier handed out earlier.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of a klass (type) in the type system
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct KlassId(u32);

impl KlassId {
    /// Create a KlassId from a raw value
    pub const fn new(id: u32) -> Self {
        KlassId(id)
    }

    /// Get the numeric ID value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Identifier of a method in the type system
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodId(u32);

impl MethodId {
    /// Create a MethodId from a raw value
    pub const fn new(id: u32) -> Self {
        MethodId(id)
    }

    /// Get the numeric ID value
    pub fn as_u32(self) -> u32 {
        self.0
    }
}

/// Handle of a compiled unit in the code repository
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitId {
    index: u32,
    generation: u32,
}

impl UnitId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        UnitId { index, generation }
    }

    /// Arena slot index
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation this id was issued for
    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// Handle of an installed-code mirror in the mirror table
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MirrorId {
    index: u32,
    generation: u32,
}

impl MirrorId {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        MirrorId { index, generation }
    }

    /// Arena slot index
    pub fn index(self) -> u32 {
        self.index
    }

    /// Slot generation this id was issued for
    pub fn generation(self) -> u32 {
        self.generation
    }
}

/// An address in the code heap
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CodeAddress(usize);

impl CodeAddress {
    /// Wrap a raw address
    pub const fn new(addr: usize) -> Self {
        CodeAddress(addr)
    }

    /// Raw address value
    pub fn as_usize(self) -> usize {
        self.0
    }

    /// Address `offset` bytes past this one
    pub fn offset(self, offset: usize) -> Self {
        CodeAddress(self.0 + offset)
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for MirrorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mirror#{}.{}", self.index, self.generation)
    }
}

impl fmt::Display for CodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Display for KlassId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "klass#{}", self.0)
    }
}

impl fmt::Display for MethodId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unit_id_generations_differ() {
        let a = UnitId::new(3, 0);
        let b = UnitId::new(3, 1);
        assert_ne!(a, b);
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn test_code_address_offset() {
        let base = CodeAddress::new(0x1000);
        assert_eq!(base.offset(0x20).as_usize(), 0x1020);
        assert_eq!(format!("{}", base), "0x1000");
    }

    #[test]
    fn test_klass_id_roundtrip() {
        let id = KlassId::new(42);
        assert_eq!(id.as_u32(), 42);
        assert_eq!(format!("{}", id), "klass#42");
    }
}
