//! Compiled-unit installation
//!
//! Everything between "the compiler produced a unit" and "the unit is
//! callable" happens under the type system's compile lock, so validating the
//! recorded dependencies and publishing the unit are atomic with respect to
//! hierarchy changes. Publication order is heap -> side tables -> dispatch
//! slot -> mirror binding; a mirror never names a unit that cannot be invoked
//! yet.

use crate::code::UnitCandidate;
use crate::compile_state::CompileState;
use crate::deps::{validate_dependencies, Dependencies};
use crate::error::{CodeInstallResult, FatalError};
use crate::events::{CodeEvent, InvalidationReason};
use crate::ids::{MirrorId, UnitId};
use crate::runtime::JitRuntime;

/// Everything needed to install one compiled unit
#[derive(Debug)]
pub struct InstallRequest<'a> {
    /// Code and side tables
    pub candidate: UnitCandidate,
    /// Assumptions the code relies on
    pub dependencies: Dependencies,
    /// State captured when compilation began
    pub compile_state: Option<&'a CompileState>,
    /// Mirror to bind once the unit is published
    pub mirror: Option<MirrorId>,
}

impl<'a> InstallRequest<'a> {
    /// Request without compile state or mirror
    pub fn new(candidate: UnitCandidate, dependencies: Dependencies) -> Self {
        InstallRequest {
            candidate,
            dependencies,
            compile_state: None,
            mirror: None,
        }
    }

    /// Attach the compile state captured at compile start
    pub fn with_compile_state(mut self, state: &'a CompileState) -> Self {
        self.compile_state = Some(state);
        self
    }

    /// Bind `mirror` to the installed unit
    pub fn with_mirror(mut self, mirror: MirrorId) -> Self {
        self.mirror = Some(mirror);
        self
    }
}

/// Result of an install attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOutcome {
    /// Which of the four outcomes occurred
    pub result: CodeInstallResult,
    /// Installed unit, present iff `result` is `Ok`
    pub unit: Option<UnitId>,
    /// Why the install was refused
    pub failure_detail: Option<String>,
}

impl InstallOutcome {
    fn installed(unit: UnitId) -> Self {
        InstallOutcome {
            result: CodeInstallResult::Ok,
            unit: Some(unit),
            failure_detail: None,
        }
    }

    fn refused(result: CodeInstallResult, detail: impl Into<String>) -> Self {
        InstallOutcome {
            result,
            unit: None,
            failure_detail: Some(detail.into()),
        }
    }

    /// Whether the unit was published
    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }
}

impl JitRuntime {
    /// Validate and publish a compiled unit.
    ///
    /// Non-fatal refusals come back in the outcome; `Err` means runtime
    /// state is corrupt and the process must terminate.
    pub fn install(&self, request: InstallRequest<'_>) -> Result<InstallOutcome, FatalError> {
        let method = request.candidate.method;
        let entry_bci = request.candidate.entry_bci;
        let compile_state = request.compile_state;
        let mut events = Vec::new();
        let mut code_heap_full = false;

        let outcome = {
            let _compile = self.types.compile_lock().lock();
            self.install_locked(request, &mut events, &mut code_heap_full)?
        };

        if code_heap_full {
            self.reclaim();
        }

        match (&outcome.unit, &outcome.failure_detail) {
            (Some(unit), _) => {
                if let Some(state) = compile_state {
                    state.set_installed(*unit);
                }
            }
            (None, detail) => {
                let reason = detail.clone().unwrap_or_else(|| outcome.result.name().to_string());
                if let Some(state) = compile_state {
                    state.set_failure(outcome.result.is_retryable(), reason.clone());
                }
                events.push(CodeEvent::CompilationFailed {
                    method,
                    entry_bci,
                    reason,
                    retryable: outcome.result.is_retryable(),
                });
            }
        }
        self.post_events(events);
        Ok(outcome)
    }

    fn install_locked(
        &self,
        request: InstallRequest<'_>,
        events: &mut Vec<CodeEvent>,
        code_heap_full: &mut bool,
    ) -> Result<InstallOutcome, FatalError> {
        let InstallRequest {
            candidate,
            dependencies,
            compile_state,
            mirror,
        } = request;
        let method = candidate.method;

        if let Err(detail) = candidate.check_offsets() {
            tracing::warn!(target: "raya_jitrt::install", %method, "malformed unit: {}", detail);
            return Ok(InstallOutcome::refused(CodeInstallResult::DependenciesInvalid, detail));
        }

        let Some(counters) = self.counters.get_or_create(method) else {
            return Ok(InstallOutcome::refused(
                CodeInstallResult::CacheFull,
                "can't create method counters",
            ));
        };

        // Encoded up front: the side table outlives this attempt
        let encoded = dependencies.encode_content_bytes();
        if self.config.log_dependencies {
            for dep in dependencies.iter() {
                tracing::info!(target: "raya_jitrt::deps", %method, dependency = %dep, "recorded");
            }
        }

        let validation = validate_dependencies(&dependencies, compile_state, &*self.types, &self.instrumentation);
        if !validation.result.is_ok() {
            let decompiles = counters.record_decompile();
            if decompiles > self.config.per_method_recompilation_cutoff && !counters.is_not_compilable() {
                counters.set_not_compilable();
                tracing::warn!(
                    target: "raya_jitrt::install",
                    %method,
                    decompiles,
                    "exceeded recompilation cutoff, method is no longer compiled"
                );
            }
            let detail = validation
                .failure_detail
                .unwrap_or_else(|| validation.result.name().to_string());
            tracing::debug!(target: "raya_jitrt::install", %method, result = validation.result.name(), "{}", detail);
            return Ok(InstallOutcome::refused(validation.result, detail));
        }

        if candidate.entry_bci.is_none() {
            if let Some(state) = compile_state {
                if state.dispatch_version() != self.code.dispatch_version(method) {
                    return Ok(InstallOutcome::refused(
                        CodeInstallResult::DependenciesFailed,
                        "method code was replaced during compilation",
                    ));
                }
            }
        }

        let Some(unit) = self.code.materialize(candidate, encoded) else {
            *code_heap_full = true;
            tracing::warn!(
                target: "raya_jitrt::install",
                %method,
                used = self.code.used_bytes(),
                capacity = self.code.capacity(),
                "code cache is full"
            );
            return Ok(InstallOutcome::refused(CodeInstallResult::CacheFull, "code cache is full"));
        };

        match unit.entry_bci() {
            None => {
                if let Some(old) = self.code.active_code(method) {
                    if self.config.trace_method_replacement {
                        tracing::info!(
                            target: "raya_jitrt::install",
                            %method,
                            old = %old.id(),
                            new = %unit.id(),
                            "replacing method code"
                        );
                    }
                    self.retire(&old, InvalidationReason::Replaced, events);
                }
                self.code.publish_standard(&unit);
            }
            Some(bci) => {
                if let Some(old) = self.code.osr_code(method, bci) {
                    self.retire(&old, InvalidationReason::OsrReplaced, events);
                }
                self.code.publish_osr(&unit, bci);
            }
        }

        if self.config.scavenge_roots_in_code && unit.has_scavengable_oops() {
            self.gc.register_roots_in(&unit);
        }

        if let Some(mirror) = mirror {
            self.mirrors.bind(&unit, mirror)?;
        }

        if self.config.trace_installs {
            tracing::info!(
                target: "raya_jitrt::install",
                %method,
                unit = %unit.id(),
                entry_bci = ?unit.entry_bci(),
                address = %unit.start(),
                size = unit.size(),
                "installed"
            );
        }
        events.push(CodeEvent::Installed {
            unit: unit.id(),
            method,
            entry_bci: unit.entry_bci(),
            address: unit.start(),
            size: unit.size(),
            name: unit.name().map(str::to_string),
        });
        Ok(InstallOutcome::installed(unit.id()))
    }
}
