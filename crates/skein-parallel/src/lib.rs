//! Parallel lowering for the Skein compiler.
//!
//! Rewrites the resolved IR so that task invocations conform to the runtime's
//! one-pointer spawn ABI, captured storage outlives its frame, and, under
//! distributed execution, class references and refs carry a node locator.
//!
//! The pipeline is two entry points run in order:
//! [`lower_parallel`] (task bundling, heap promotion, end counts) and
//! [`insert_wide_references`] (widening, global heap init, local blocks).

pub mod bundle;
pub mod endcount;
pub mod globals;
pub mod heap;
pub mod local;
pub mod reprivatize;
mod runtime;
pub mod wide;

use miette::SourceSpan;
use skein_ir::{Program, SymbolId, TargetConfig};

pub use bundle::pass_args_to_nested_fns;
pub use endcount::insert_end_counts;
pub use heap::make_heap_allocations;
pub use local::handle_local_blocks;
pub use reprivatize::reprivatize_iterators;

/// Internal-compiler-error conditions. Any of these aborts the compilation;
/// there is no partial success.
#[derive(Debug, thiserror::Error)]
pub enum LowerError {
    #[error("internal: task function {0} is not defined at module level")]
    TaskFnNotGlobal(String),

    #[error("internal: expected a symbol reference actual in {context}")]
    ExpectedSymActual { context: String },

    #[error("internal: bundling state out of sync for task function {0}")]
    WrapperState(String),

    #[error("internal: no auto-copy/auto-destroy hook registered for type {0}")]
    MissingAutoHook(String),

    #[error("internal: unexpected definition form for {sym} at {span:?}")]
    UnexpectedDefForm { sym: String, span: Option<SourceSpan> },

    #[error("internal: unexpected use form for {sym} at {span:?}")]
    UnexpectedUseForm { sym: String, span: Option<SourceSpan> },

    #[error("internal: cannot find a block that contains all uses of {0}")]
    NoDominatingBlock(String),

    #[error("internal: module-level const {0} does not have exactly one definition")]
    ConstDefCount(String),

    #[error("internal: cannot locate the initialization of record-wrapped global {0}")]
    ReplicationTargetNotFound(String),

    #[error("internal: end-count primitive outside any function")]
    EndCountOutsideFn,

    #[error("internal: wide type maps are already populated")]
    WideMapsNotEmpty,

    #[error("internal: created two wide string types")]
    DuplicateWideString,

    #[error("internal: no wide form recorded for type {0}")]
    NoWideType(String),

    #[error("internal: actual has no matching formal in call to {0}")]
    NoMatchingFormal(String),

    #[error("internal: unexpected access to privatized field {0}")]
    UnexpectedPrivatizedAccess(String),

    #[error("internal: unexpected IR shape in {context}")]
    UnexpectedShape { context: String },
}

/// Collects every task function, checking each is module-level.
fn collect_task_fns(p: &Program) -> Result<Vec<SymbolId>, LowerError> {
    let mut task_fns = Vec::new();
    for s in p.symbol_ids() {
        if p.sym(s).is_fn() && p.is_task_fn(s) {
            if p.sym(s).parent_module.is_none() {
                return Err(LowerError::TaskFnNotGlobal(p.sym(s).name.clone()));
            }
            task_fns.push(s);
        }
    }
    Ok(task_fns)
}

/// First half of the lowering: iterator re-privatization, heap promotion,
/// end-count threading, and task-argument bundling.
pub fn lower_parallel(p: &mut Program, cfg: &TargetConfig) -> Result<(), LowerError> {
    let task_fns = collect_task_fns(p)?;
    log::debug!("parallel lowering: {} task functions", task_fns.len());

    reprivatize_iterators(p, cfg)?;
    make_heap_allocations(p, cfg)?;
    insert_end_counts(p)?;
    pass_args_to_nested_fns(p, &task_fns)?;
    Ok(())
}

/// Second half of the lowering: converts class references and refs to wide
/// forms, emits the global heap initializer, and specializes local blocks.
/// The `heapAllocateGlobals` stub is emitted even when widening is disabled.
pub fn insert_wide_references(p: &mut Program, cfg: &TargetConfig) -> Result<(), LowerError> {
    let heap_globals_fn = globals::heap_allocate_globals_head(p, cfg);

    if !cfg.require_wide_references() {
        return Ok(());
    }

    if !p.wide_class_map.is_empty() || !p.wide_ref_map.is_empty() {
        return Err(LowerError::WideMapsNotEmpty);
    }

    let heap_vars = globals::get_heap_vars(p);

    wide::convert_nil_to_object(p);
    wide::build_wide_classes(p)?;
    wide::widen_classes(p);
    wide::build_wide_ref_map(p);
    wide::widen_refs(p);
    wide::insert_element_access_temps(p)?;
    wide::narrow_wide_classes_through_calls(p, cfg)?;
    wide::insert_wide_class_temps_for_nil(p)?;
    wide::insert_wide_cast_temps(p);
    wide::deref_wide_string_actuals(p);
    wide::deref_wide_refs_to_wide_classes(p);
    wide::widen_get_priv_class(p)?;
    globals::heap_allocate_globals_tail(p, heap_globals_fn, &heap_vars);
    handle_local_blocks(p, cfg)?;
    wide::move_address_sources_to_temp(p);
    Ok(())
}
