//! Compile-time dependencies and their validation
//!
//! A dependency is an assumption about the type hierarchy that a compiled
//! unit relies on. The list is encoded into the unit's side table at install
//! time so it can be re-checked whenever the hierarchy changes later.
//!
//! Side-table format: a sequence of records terminated by `TAG_END`.
//! Each record is a tag byte followed by little-endian u32 operands.

use std::fmt;

use crate::compile_state::CompileState;
use crate::error::CodeInstallResult;
use crate::hierarchy::TypeSystem;
use crate::ids::{KlassId, MethodId};
use crate::instrumentation::Instrumentation;

const TAG_END: u8 = 0x00;
const TAG_LEAF_TYPE: u8 = 0x01;
const TAG_SUBTYPES_LIMITED_TO: u8 = 0x02;
const TAG_UNIQUE_CONCRETE_METHOD: u8 = 0x03;

/// A type-hierarchy assumption
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dependency {
    /// `context` has no subtypes
    LeafType {
        /// Klass assumed to be a leaf
        context: KlassId,
    },
    /// Every proper subtype of `context` is one of `allowed`
    SubtypesLimitedTo {
        /// Root of the assumption
        context: KlassId,
        /// Subtypes known at compile time
        allowed: Vec<KlassId>,
    },
    /// No proper subtype of `context` overrides `method`
    UniqueConcreteMethod {
        /// Receiver klass
        context: KlassId,
        /// Method assumed not overridden
        method: MethodId,
    },
}

impl Dependency {
    /// Klass the assumption is rooted at
    pub fn context(&self) -> KlassId {
        match self {
            Dependency::LeafType { context }
            | Dependency::SubtypesLimitedTo { context, .. }
            | Dependency::UniqueConcreteMethod { context, .. } => *context,
        }
    }

    /// Check against the live hierarchy, returning the klass that breaks the
    /// assumption
    pub fn find_witness(&self, ts: &dyn TypeSystem) -> Option<KlassId> {
        match self {
            Dependency::LeafType { context } => ts.subtypes_of(*context).into_iter().next(),
            Dependency::SubtypesLimitedTo { context, allowed } => ts
                .subtypes_of(*context)
                .into_iter()
                .find(|k| !allowed.contains(k)),
            Dependency::UniqueConcreteMethod { context, method } => ts
                .subtypes_of(*context)
                .into_iter()
                .find(|k| ts.declares_method(*k, *method)),
        }
    }

    fn encode_into(&self, out: &mut Vec<u8>) {
        match self {
            Dependency::LeafType { context } => {
                out.push(TAG_LEAF_TYPE);
                put_u32(out, context.as_u32());
            }
            Dependency::SubtypesLimitedTo { context, allowed } => {
                out.push(TAG_SUBTYPES_LIMITED_TO);
                put_u32(out, context.as_u32());
                put_u32(out, allowed.len() as u32);
                for k in allowed {
                    put_u32(out, k.as_u32());
                }
            }
            Dependency::UniqueConcreteMethod { context, method } => {
                out.push(TAG_UNIQUE_CONCRETE_METHOD);
                put_u32(out, context.as_u32());
                put_u32(out, method.as_u32());
            }
        }
    }
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dependency::LeafType { context } => write!(f, "leaf_type {}", context),
            Dependency::SubtypesLimitedTo { context, allowed } => {
                write!(f, "subtypes_limited_to {} {{", context)?;
                for (i, k) in allowed.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", k)?;
                }
                write!(f, "}}")
            }
            Dependency::UniqueConcreteMethod { context, method } => {
                write!(f, "unique_concrete_method {} {}", context, method)
            }
        }
    }
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn u8(&mut self) -> Result<u8, String> {
        let b = *self
            .bytes
            .get(self.pos)
            .ok_or_else(|| format!("truncated at byte {}", self.pos))?;
        self.pos += 1;
        Ok(b)
    }

    fn u32(&mut self) -> Result<u32, String> {
        let end = self.pos + 4;
        let chunk = self
            .bytes
            .get(self.pos..end)
            .ok_or_else(|| format!("truncated operand at byte {}", self.pos))?;
        self.pos = end;
        Ok(u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
    }
}

/// Ordered dependency list recorded by the compiler
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dependencies {
    deps: Vec<Dependency>,
}

impl Dependencies {
    /// Empty list
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an assumption
    pub fn push(&mut self, dep: Dependency) {
        self.deps.push(dep);
    }

    /// Builder-style `push`
    pub fn with(mut self, dep: Dependency) -> Self {
        self.push(dep);
        self
    }

    /// Recorded assumptions in order
    pub fn iter(&self) -> impl Iterator<Item = &Dependency> {
        self.deps.iter()
    }

    /// Number of assumptions
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    /// Whether nothing was assumed
    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }

    /// Encode into side-table bytes
    pub fn encode_content_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.deps.len() * 9 + 1);
        for dep in &self.deps {
            dep.encode_into(&mut out);
        }
        out.push(TAG_END);
        out
    }

    /// Decode side-table bytes produced by `encode_content_bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, String> {
        let mut r = Reader { bytes, pos: 0 };
        let mut deps = Vec::new();
        loop {
            let tag = r.u8()?;
            let dep = match tag {
                TAG_END => break,
                TAG_LEAF_TYPE => Dependency::LeafType {
                    context: KlassId::new(r.u32()?),
                },
                TAG_SUBTYPES_LIMITED_TO => {
                    let context = KlassId::new(r.u32()?);
                    let count = r.u32()? as usize;
                    let mut allowed = Vec::with_capacity(count.min(64));
                    for _ in 0..count {
                        allowed.push(KlassId::new(r.u32()?));
                    }
                    Dependency::SubtypesLimitedTo { context, allowed }
                }
                TAG_UNIQUE_CONCRETE_METHOD => Dependency::UniqueConcreteMethod {
                    context: KlassId::new(r.u32()?),
                    method: MethodId::new(r.u32()?),
                },
                other => return Err(format!("unknown dependency tag {:#04x} at byte {}", other, r.pos - 1)),
            };
            deps.push(dep);
        }
        if r.pos != bytes.len() {
            return Err(format!("{} trailing bytes after end marker", bytes.len() - r.pos));
        }
        Ok(Dependencies { deps })
    }

    /// First assumption that no longer holds, with a description of why
    pub fn first_violation(&self, ts: &dyn TypeSystem) -> Option<(&Dependency, String)> {
        self.deps.iter().find_map(|dep| {
            dep.find_witness(ts)
                .map(|witness| (dep, format!("{} violated by {}", dep, witness)))
        })
    }
}

impl FromIterator<Dependency> for Dependencies {
    fn from_iter<I: IntoIterator<Item = Dependency>>(iter: I) -> Self {
        Dependencies {
            deps: iter.into_iter().collect(),
        }
    }
}

/// Result of dependency validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Validation {
    /// `Ok`, `DependenciesFailed` or `DependenciesInvalid`
    pub result: CodeInstallResult,
    /// Why validation failed
    pub failure_detail: Option<String>,
}

impl Validation {
    fn ok() -> Self {
        Validation {
            result: CodeInstallResult::Ok,
            failure_detail: None,
        }
    }

    fn failed(result: CodeInstallResult, detail: String) -> Self {
        Validation {
            result,
            failure_detail: Some(detail),
        }
    }
}

/// Check that the assumptions of a compilation still hold.
///
/// Must be called with the compile lock held.
pub fn validate_dependencies(
    dependencies: &Dependencies,
    compile_state: Option<&CompileState>,
    type_system: &dyn TypeSystem,
    instrumentation: &Instrumentation,
) -> Validation {
    if let Some(state) = compile_state {
        if state.instrumentation_state_changed(instrumentation) {
            return Validation::failed(
                CodeInstallResult::DependenciesFailed,
                "Instrumentation state change during compilation invalidated dependencies"
                    .to_string(),
            );
        }
    }

    // No compile state means we cannot know whether the world changed
    let counter_changed = compile_state
        .map_or(true, |s| s.modification_counter() != type_system.modification_counter());

    match dependencies.first_violation(type_system) {
        None => Validation::ok(),
        Some((_, detail)) if counter_changed => {
            Validation::failed(CodeInstallResult::DependenciesFailed, detail)
        }
        Some((_, detail)) => Validation::failed(CodeInstallResult::DependenciesInvalid, detail),
    }
}
