//! Installed-code mirrors
//!
//! A mirror is the managed program's view of a compiled unit. It carries two
//! fields: `address`, the identity link to the unit, and `entry_point`, the
//! address calls through the mirror jump to. The link is weak in both
//! directions and recorded in a back-reference table (unit -> mirror), so
//! invalidating a unit is a table update.
//!
//! Clearing happens in two phases. When a unit stops being entrant the entry
//! point is cleared, so invocation fails fast, while the identity stays so
//! frames still running the unit can be found and deoptimized. Only when the
//! unit is dead is the identity cleared as well.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::code::{CompiledUnit, UnitState};
use crate::error::{FatalError, MirrorError};
use crate::ids::{CodeAddress, MirrorId, UnitId};

#[derive(Debug, Default)]
struct MirrorState {
    name: Option<String>,
    address: Option<UnitId>,
    entry_point: Option<CodeAddress>,
    bound: bool,
}

#[derive(Debug, Default)]
struct MirrorSlot {
    generation: u32,
    mirror: Option<MirrorState>,
}

#[derive(Debug, Default)]
struct MirrorInner {
    slots: Vec<MirrorSlot>,
    free: Vec<u32>,
    back_refs: FxHashMap<UnitId, MirrorId>,
}

impl MirrorInner {
    fn get(&self, id: MirrorId) -> Option<&MirrorState> {
        self.slots
            .get(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.mirror.as_ref())
    }

    fn get_mut(&mut self, id: MirrorId) -> Option<&mut MirrorState> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|s| s.generation == id.generation())
            .and_then(|s| s.mirror.as_mut())
    }
}

/// Table of installed-code mirrors
#[derive(Debug, Default)]
pub struct MirrorTable {
    inner: RwLock<MirrorInner>,
}

impl MirrorTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an unbound mirror
    pub fn create(&self, name: Option<&str>) -> MirrorId {
        let mut inner = self.inner.write();
        let index = match inner.free.pop() {
            Some(index) => index,
            None => {
                inner.slots.push(MirrorSlot::default());
                (inner.slots.len() - 1) as u32
            }
        };
        let slot = &mut inner.slots[index as usize];
        slot.mirror = Some(MirrorState {
            name: name.map(str::to_string),
            ..MirrorState::default()
        });
        MirrorId::new(index, slot.generation)
    }

    /// Link `mirror` to `unit`. A mirror can be bound once in its lifetime.
    pub fn bind(&self, unit: &CompiledUnit, mirror: MirrorId) -> Result<(), FatalError> {
        let mut inner = self.inner.write();
        let state = inner.get_mut(mirror).ok_or(FatalError::StaleMirror {
            mirror,
            unit: unit.id(),
        })?;
        if state.bound {
            return Err(FatalError::DoubleBind {
                mirror,
                unit: unit.id(),
                existing: state.address,
            });
        }
        state.bound = true;
        state.address = Some(unit.id());
        state.entry_point = unit.is_in_use().then(|| unit.entry_point());
        inner.back_refs.insert(unit.id(), mirror);
        tracing::trace!(target: "raya_jitrt::mirror", %mirror, unit = %unit.id(), "bound");
        Ok(())
    }

    /// Mirror bound to `unit`, if any
    pub fn resolve(&self, unit: UnitId) -> Option<MirrorId> {
        self.inner.read().back_refs.get(&unit).copied()
    }

    /// Propagate a unit state change to its mirror.
    ///
    /// Clears the entry point whenever the mirror still refers to the unit;
    /// clears the identity link and the back reference only once the unit is
    /// dead. Returns the mirror that was touched.
    pub fn invalidate(&self, unit: UnitId, state: UnitState) -> Option<MirrorId> {
        let mut inner = self.inner.write();
        let mirror = *inner.back_refs.get(&unit)?;
        let dead = !state.is_alive();
        match inner.get_mut(mirror) {
            Some(m) if m.address == Some(unit) => {
                m.entry_point = None;
                if dead {
                    m.address = None;
                }
            }
            _ => {}
        }
        if dead {
            inner.back_refs.remove(&unit);
        }
        tracing::trace!(target: "raya_jitrt::mirror", %mirror, %unit, ?state, "invalidated");
        Some(mirror)
    }

    /// Identity link of a mirror (None once cleared or never bound)
    pub fn address(&self, mirror: MirrorId) -> Result<Option<UnitId>, MirrorError> {
        self.inner
            .read()
            .get(mirror)
            .map(|m| m.address)
            .ok_or(MirrorError::UnknownMirror(mirror))
    }

    /// Entry point of a mirror (None once cleared or never bound)
    pub fn entry_point(&self, mirror: MirrorId) -> Result<Option<CodeAddress>, MirrorError> {
        self.inner
            .read()
            .get(mirror)
            .map(|m| m.entry_point)
            .ok_or(MirrorError::UnknownMirror(mirror))
    }

    /// Name given at creation
    pub fn name(&self, mirror: MirrorId) -> Option<String> {
        self.inner.read().get(mirror).and_then(|m| m.name.clone())
    }

    /// Address to jump to when the managed program calls through the mirror
    pub fn invoke_target(&self, mirror: MirrorId) -> Result<CodeAddress, MirrorError> {
        let inner = self.inner.read();
        let m = inner.get(mirror).ok_or(MirrorError::UnknownMirror(mirror))?;
        m.entry_point.ok_or_else(|| MirrorError::InvalidInstalledCode {
            name: m.name.clone(),
        })
    }

    /// Drop a mirror the managed program no longer references
    pub fn release(&self, mirror: MirrorId) -> bool {
        let mut inner = self.inner.write();
        let Some(address) = inner.get(mirror).map(|m| m.address) else {
            return false;
        };
        if let Some(unit) = address {
            if inner.back_refs.get(&unit) == Some(&mirror) {
                inner.back_refs.remove(&unit);
            }
        }
        let slot = &mut inner.slots[mirror.index() as usize];
        slot.mirror = None;
        slot.generation = slot.generation.wrapping_add(1);
        inner.free.push(mirror.index());
        true
    }

    /// Number of live mirrors
    pub fn len(&self) -> usize {
        self.inner.read().slots.iter().filter(|s| s.mirror.is_some()).count()
    }

    /// Whether no mirrors are live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::code::{CodeRepository, UnitCandidate};
    use crate::ids::MethodId;
    use std::sync::Arc;

    fn unit(repo: &CodeRepository) -> Arc<CompiledUnit> {
        repo.materialize(UnitCandidate::new(MethodId::new(1), vec![0; 16]), vec![0])
            .unwrap()
    }

    #[test]
    fn test_bind_then_resolve() {
        let repo = CodeRepository::new(4096, 32, 4);
        let table = MirrorTable::new();
        let u = unit(&repo);
        let m = table.create(Some("fib"));
        table.bind(&u, m).unwrap();
        assert_eq!(table.resolve(u.id()), Some(m));
        assert_eq!(table.address(m).unwrap(), Some(u.id()));
        assert_eq!(table.invoke_target(m).unwrap(), u.entry_point());
    }

    #[test]
    fn test_double_bind_is_fatal() {
        let repo = CodeRepository::new(4096, 32, 4);
        let table = MirrorTable::new();
        let (a, b) = (unit(&repo), unit(&repo));
        let m = table.create(None);
        table.bind(&a, m).unwrap();
        let err = table.bind(&b, m).unwrap_err();
        assert_eq!(
            err,
            FatalError::DoubleBind {
                mirror: m,
                unit: b.id(),
                existing: Some(a.id())
            }
        );
    }

    #[test]
    fn test_rebind_after_clear_is_fatal() {
        let repo = CodeRepository::new(4096, 32, 4);
        let table = MirrorTable::new();
        let (a, b) = (unit(&repo), unit(&repo));
        let m = table.create(None);
        table.bind(&a, m).unwrap();
        table.invalidate(a.id(), UnitState::Unloaded);
        assert_eq!(table.address(m).unwrap(), None);
        assert!(matches!(
            table.bind(&b, m),
            Err(FatalError::DoubleBind { existing: None, .. })
        ));
    }

    #[test]
    fn test_two_phase_clearing() {
        let repo = CodeRepository::new(4096, 32, 4);
        let table = MirrorTable::new();
        let u = unit(&repo);
        let m = table.create(Some("loop"));
        table.bind(&u, m).unwrap();

        table.invalidate(u.id(), UnitState::NotEntrant);
        assert_eq!(table.entry_point(m).unwrap(), None);
        assert_eq!(table.address(m).unwrap(), Some(u.id()));
        assert_eq!(table.resolve(u.id()), Some(m));
        assert_eq!(
            table.invoke_target(m).unwrap_err().to_string(),
            "invalid installed code 'loop'"
        );

        table.invalidate(u.id(), UnitState::Zombie);
        assert_eq!(table.address(m).unwrap(), None);
        assert_eq!(table.resolve(u.id()), None);
    }

    #[test]
    fn test_release_recycles_slot() {
        let repo = CodeRepository::new(4096, 32, 4);
        let table = MirrorTable::new();
        let u = unit(&repo);
        let m = table.create(None);
        table.bind(&u, m).unwrap();
        assert!(table.release(m));
        assert!(!table.release(m));
        assert_eq!(table.resolve(u.id()), None);
        assert_eq!(table.address(m), Err(MirrorError::UnknownMirror(m)));
        let fresh = table.create(None);
        assert_eq!(fresh.index(), m.index());
        assert_ne!(fresh, m);
        assert!(matches!(table.bind(&u, m), Err(FatalError::StaleMirror { .. })));
    }
}
