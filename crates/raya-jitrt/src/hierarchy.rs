//! Type-system collaborator
//!
//! The runtime only reads the type hierarchy: it asks whether the world has
//! changed (the modification counter) and whether recorded assumptions still
//! hold. Mutation happens elsewhere, but always under the compile lock that
//! the installer also holds, so "validate" and "publish" cannot interleave
//! with a hierarchy change.
//!
//! `ClassHierarchy` is a self-contained implementation used by embedders that
//! have no type system of their own, and by the tests.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::ids::{KlassId, MethodId};

/// Lock serializing code installation with type-hierarchy mutation
pub type CompileLock = Arc<Mutex<()>>;

/// Shape of a klass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KlassKind {
    /// An ordinary class or interface
    Instance,
    /// An array of references with the given element klass
    ObjArray(KlassId),
    /// An array of primitives
    TypeArray,
}

/// Read-only view of the type hierarchy used by the runtime
pub trait TypeSystem: Send + Sync {
    /// Counter bumped by every hierarchy mutation
    fn modification_counter(&self) -> u64;

    /// Lock held by hierarchy mutation and by code installation
    fn compile_lock(&self) -> &CompileLock;

    /// Shape of `klass`
    fn klass_kind(&self, klass: KlassId) -> KlassKind;

    /// Access check between two instance klasses
    fn is_klass_accessible(&self, accessor: KlassId, target: KlassId) -> bool;

    /// Whether `sub` is `sup` or one of its transitive subtypes
    fn is_subtype(&self, sub: KlassId, sup: KlassId) -> bool;

    /// All proper transitive subtypes of `klass`
    fn subtypes_of(&self, klass: KlassId) -> Vec<KlassId>;

    /// Whether `klass` cannot be instantiated
    fn is_abstract(&self, klass: KlassId) -> bool;

    /// Whether `klass` itself declares an implementation of `method`
    fn declares_method(&self, klass: KlassId, method: MethodId) -> bool;
}

/// Description of a klass added to a `ClassHierarchy`
#[derive(Debug, Clone)]
pub struct KlassSpec {
    /// Human-readable name
    pub name: String,
    /// Package for access checks
    pub package: String,
    /// Direct supertype
    pub super_klass: Option<KlassId>,
    /// Shape
    pub kind: KlassKind,
    /// Publicly accessible from other packages
    pub is_public: bool,
    /// Cannot be instantiated
    pub is_abstract: bool,
    /// Methods this klass declares or overrides
    pub methods: Vec<MethodId>,
}

impl KlassSpec {
    /// A public, concrete instance klass with no methods
    pub fn instance(name: &str, super_klass: Option<KlassId>) -> Self {
        KlassSpec {
            name: name.to_string(),
            package: String::new(),
            super_klass,
            kind: KlassKind::Instance,
            is_public: true,
            is_abstract: false,
            methods: Vec::new(),
        }
    }

    /// Set the package
    pub fn in_package(mut self, package: &str) -> Self {
        self.package = package.to_string();
        self
    }

    /// Mark the klass package-private
    pub fn private(mut self) -> Self {
        self.is_public = false;
        self
    }

    /// Mark the klass abstract
    pub fn abstract_klass(mut self) -> Self {
        self.is_abstract = true;
        self
    }

    /// Declare (or override) a method
    pub fn with_method(mut self, method: MethodId) -> Self {
        self.methods.push(method);
        self
    }
}

struct KlassInfo {
    spec: KlassSpec,
    subklasses: Vec<KlassId>,
    methods: FxHashSet<MethodId>,
}

/// In-memory class hierarchy
pub struct ClassHierarchy {
    klasses: RwLock<Vec<KlassInfo>>,
    by_name: RwLock<FxHashMap<String, KlassId>>,
    modifications: AtomicU64,
    compile_lock: CompileLock,
}

impl ClassHierarchy {
    /// Create an empty hierarchy with its own compile lock
    pub fn new() -> Self {
        ClassHierarchy {
            klasses: RwLock::new(Vec::new()),
            by_name: RwLock::new(FxHashMap::default()),
            modifications: AtomicU64::new(0),
            compile_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Add a klass. Takes the compile lock and bumps the modification counter.
    pub fn add_klass(&self, spec: KlassSpec) -> KlassId {
        let _compile = self.compile_lock.lock();
        self.add_klass_locked(spec)
    }

    /// Add a klass while the caller already holds the compile lock
    pub fn add_klass_locked(&self, spec: KlassSpec) -> KlassId {
        let mut klasses = self.klasses.write();
        let id = KlassId::new(klasses.len() as u32);
        if let Some(sup) = spec.super_klass {
            if let Some(info) = klasses.get_mut(sup.as_u32() as usize) {
                info.subklasses.push(id);
            }
        }
        self.by_name.write().insert(spec.name.clone(), id);
        let methods = spec.methods.iter().copied().collect();
        klasses.push(KlassInfo {
            spec,
            subklasses: Vec::new(),
            methods,
        });
        self.modifications.fetch_add(1, Ordering::AcqRel);
        tracing::debug!(target: "raya_jitrt::hierarchy", klass = %id, "klass added");
        id
    }

    /// Add a method override to an existing klass (e.g. class redefinition)
    pub fn add_method(&self, klass: KlassId, method: MethodId) {
        let _compile = self.compile_lock.lock();
        if let Some(info) = self.klasses.write().get_mut(klass.as_u32() as usize) {
            info.methods.insert(method);
        }
        self.modifications.fetch_add(1, Ordering::AcqRel);
    }

    /// Look up a klass by name
    pub fn lookup(&self, name: &str) -> Option<KlassId> {
        self.by_name.read().get(name).copied()
    }

    /// Name of a klass
    pub fn name_of(&self, klass: KlassId) -> Option<String> {
        self.klasses
            .read()
            .get(klass.as_u32() as usize)
            .map(|k| k.spec.name.clone())
    }

    fn with_klass<R>(&self, klass: KlassId, default: R, f: impl FnOnce(&KlassInfo) -> R) -> R {
        self.klasses
            .read()
            .get(klass.as_u32() as usize)
            .map(f)
            .unwrap_or(default)
    }
}

impl Default for ClassHierarchy {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeSystem for ClassHierarchy {
    fn modification_counter(&self) -> u64 {
        self.modifications.load(Ordering::Acquire)
    }

    fn compile_lock(&self) -> &CompileLock {
        &self.compile_lock
    }

    fn klass_kind(&self, klass: KlassId) -> KlassKind {
        self.with_klass(klass, KlassKind::Instance, |k| k.spec.kind)
    }

    fn is_klass_accessible(&self, accessor: KlassId, target: KlassId) -> bool {
        let klasses = self.klasses.read();
        let (Some(from), Some(to)) = (
            klasses.get(accessor.as_u32() as usize),
            klasses.get(target.as_u32() as usize),
        ) else {
            return false;
        };
        to.spec.is_public || from.spec.package == to.spec.package
    }

    fn is_subtype(&self, sub: KlassId, sup: KlassId) -> bool {
        let klasses = self.klasses.read();
        let mut current = Some(sub);
        while let Some(k) = current {
            if k == sup {
                return true;
            }
            current = klasses
                .get(k.as_u32() as usize)
                .and_then(|info| info.spec.super_klass);
        }
        false
    }

    fn subtypes_of(&self, klass: KlassId) -> Vec<KlassId> {
        let klasses = self.klasses.read();
        let mut out = Vec::new();
        let mut stack = vec![klass];
        while let Some(k) = stack.pop() {
            if let Some(info) = klasses.get(k.as_u32() as usize) {
                for &sub in &info.subklasses {
                    out.push(sub);
                    stack.push(sub);
                }
            }
        }
        out
    }

    fn is_abstract(&self, klass: KlassId) -> bool {
        self.with_klass(klass, false, |k| k.spec.is_abstract)
    }

    fn declares_method(&self, klass: KlassId, method: MethodId) -> bool {
        self.with_klass(klass, false, |k| k.methods.contains(&method))
    }
}
