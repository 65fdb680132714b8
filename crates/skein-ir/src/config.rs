//! Target configuration consumed by the parallel lowering pass.

/// How many locales the compiled program targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocaleMode {
    /// Single-locale execution; no communication machinery is emitted.
    Single,
    Multi,
}

/// Communication layer linked into the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommLayer {
    None,
    Gasnet,
    /// Registers the full memory segment; locals need no heap relocation.
    Ugni,
}

/// Gasnet segment configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GasnetSegment {
    /// The whole address space is registered.
    Everything,
    Fast,
    Large,
}

/// Runtime/communication configuration for one compilation.
#[derive(Debug, Clone, Copy)]
pub struct TargetConfig {
    pub locales: LocaleMode,
    pub comm: CommLayer,
    pub gasnet_segment: GasnetSegment,
    /// Suppress `local_check` assertions.
    pub no_local_checks: bool,
}

impl TargetConfig {
    pub fn single_locale() -> TargetConfig {
        TargetConfig {
            locales: LocaleMode::Single,
            comm: CommLayer::None,
            gasnet_segment: GasnetSegment::Fast,
            no_local_checks: false,
        }
    }

    pub fn multi_locale(comm: CommLayer, gasnet_segment: GasnetSegment) -> TargetConfig {
        TargetConfig {
            locales: LocaleMode::Multi,
            comm,
            gasnet_segment,
            no_local_checks: false,
        }
    }

    pub fn is_local(&self) -> bool {
        self.locales == LocaleMode::Single
    }

    /// Whether locals reachable from remote tasks must move to the heap.
    /// False when single-locale, when the comm layer registers all memory
    /// (`ugni`), or when gasnet registers the full segment.
    pub fn need_heap_vars(&self) -> bool {
        if self.is_local() {
            return false;
        }
        match (self.comm, self.gasnet_segment) {
            (CommLayer::Ugni, _) => false,
            (CommLayer::Gasnet, GasnetSegment::Everything) => false,
            _ => true,
        }
    }

    /// Whether class references and refs must carry a locator.
    pub fn require_wide_references(&self) -> bool {
        !self.is_local()
    }
}
