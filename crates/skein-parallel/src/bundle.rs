//! Task-argument bundling.
//!
//! The runtime's spawn interface takes a single opaque pointer. For each task
//! function we synthesize a bundle class with one field per formal, a wrapper
//! that unpacks the bundle and calls the task body, and rewrite every call
//! site to allocate, fill, and hand off a bundle instance.
//!
//! The bundle class, the wrapper, and the auto-destroy hooks are synthesized
//! while processing a task function's first call site; later sites reuse
//! them. Call sites are visited in IR traversal order, so "first" is
//! deterministic.

use skein_ir::{
    formal_at, CallSites, FnFlags, Intent, NodeId, Prim, Program, SymFlags, SymbolId, Type,
    TypeFlags, TypeId, TypeKind,
};

use crate::runtime::{here_free_call, insert_here_alloc};
use crate::LowerError;

/// Per-task-function bundling state, threaded across that function's call
/// sites.
struct BundleState {
    first_call: bool,
    bundle_type: Option<TypeId>,
    wrapper: Option<SymbolId>,
}

/// Bundles the arguments of every call to every task function, then strips
/// the dummy locale formal from each `on` body.
pub fn pass_args_to_nested_fns(p: &mut Program, task_fns: &[SymbolId]) -> Result<(), LowerError> {
    let sites = CallSites::build(p);
    for &task in task_fns {
        let mut state = BundleState { first_call: true, bundle_type: None, wrapper: None };
        for &call in sites.of(task) {
            bundle_args(p, call, task, &mut state)?;
        }
        if p.fn_flags(task).contains(FnFlags::ON) {
            remove_dummy_locale_formal(p, task);
        }
    }
    Ok(())
}

/// Synthesizes the bundle class for `task` from the shape of its first call.
/// The class lands at the head of the calling module's block.
fn create_arg_bundle_class(
    p: &mut Program,
    task: SymbolId,
    fcall: NodeId,
) -> Result<TypeId, LowerError> {
    let task_name = p.sym(task).name.clone();
    let ctype = p.add_type(Type {
        name: format!("_class_locals_{}", task_name),
        kind: TypeKind::Class,
        flags: TypeFlags::NO_OBJECT | TypeFlags::NO_WIDE_CLASS,
        fields: Vec::new(),
        elem_type: None,
        ref_type: None,
    });

    for (i, arg) in p.call_args(fcall).iter().enumerate() {
        let var = p.sym_of(*arg).ok_or_else(|| LowerError::ExpectedSymActual {
            context: format!("call to task function {}", task_name),
        })?;
        p.sym_mut(var).flags |= SymFlags::CONCURRENTLY_ACCESSED;
        let field_name = format!("_{}_{}", i, p.sym(var).name);
        let field_ty = p.sym(var).ty;
        p.add_field(ctype, field_name, field_ty);
    }

    // The calling module may differ from the task function's own module.
    let ts = p.type_sym(ctype);
    let def = p.def(ts);
    match p.module_of(fcall) {
        Some(m) => {
            let body = p.module_data(m).body;
            p.insert_at_head(body, def);
        }
        None => {
            let block = p.program_block;
            p.insert_at_head(block, def);
        }
    }
    Ok(ctype)
}

/// Inserts auto-copy/auto-destroy calls for one actual of an asynchronous
/// task invocation, returning the symbol to store in the bundle.
///
/// Reference-counted values get their count bumped before the spawn and
/// released just ahead of the task's end-count decrement; user records passed
/// by value get a copy the task owns. The destroy side is synthesized only
/// while processing the first call site.
fn insert_auto_copy_destroy_for_task_arg(
    p: &mut Program,
    fcall: NodeId,
    arg_idx: usize,
    task: SymbolId,
    first_call: bool,
) -> Result<SymbolId, LowerError> {
    let arg = p.call_args(fcall)[arg_idx];
    let var = p.sym_of(arg).ok_or_else(|| LowerError::ExpectedSymActual {
        context: format!("call to task function {}", p.sym(task).name),
    })?;

    let flags = p.fn_flags(task);
    let is_async = flags.contains(FnFlags::BEGIN)
        || (flags.contains(FnFlags::ON) && flags.contains(FnFlags::NON_BLOCKING));
    if !is_async {
        return Ok(var);
    }

    let arg_ty = p.sym(var).ty;
    let base_ty = p.value_type(arg_ty);
    let by_ref = arg_ty != base_ty;

    if p.ty(base_ty).flags.contains(TypeFlags::REFCOUNTED) {
        let copy_fn = p
            .auto_copy_fn(base_ty)
            .ok_or_else(|| LowerError::MissingAutoHook(p.ty(base_ty).name.clone()))?;
        let destroy_fn = p
            .auto_destroy_fn(base_ty)
            .ok_or_else(|| LowerError::MissingAutoHook(p.ty(base_ty).name.clone()))?;

        let stored = if by_ref {
            // Punch through the reference to bump the count; the copy result
            // is dropped and the original reference goes into the bundle.
            let deref_tmp = p.new_temp("_deref_tmp", base_ty);
            let d = p.def(deref_tmp);
            p.insert_before(fcall, d);
            let vr = p.sym_ref(var);
            let deref = p.call_prim(Prim::Deref, vec![vr], base_ty);
            let mv = p.move_into(deref_tmp, deref);
            p.insert_before(fcall, mv);
            let tr = p.sym_ref(deref_tmp);
            let copy = p.call_fn(copy_fn, vec![tr]);
            p.insert_before(fcall, copy);
            var
        } else {
            let val_tmp = p.new_temp("_copy_tmp", base_ty);
            let d = p.def(val_tmp);
            p.insert_before(fcall, d);
            let vr = p.sym_ref(var);
            let copy = p.call_fn(copy_fn, vec![vr]);
            let mv = p.move_into(val_tmp, copy);
            p.insert_before(fcall, mv);
            val_tmp
        };

        if first_call {
            let formal = formal_at(p, fcall, arg_idx)
                .ok_or_else(|| LowerError::NoMatchingFormal(p.sym(task).name.clone()))?;
            let mut target = formal;
            if by_ref {
                let deref_tmp = p.new_temp("_deref_tmp", base_ty);
                let d = p.def(deref_tmp);
                p.insert_before_down_end_count(task, d);
                let fr = p.sym_ref(formal);
                let deref = p.call_prim(Prim::Deref, vec![fr], base_ty);
                let mv = p.move_into(deref_tmp, deref);
                p.insert_before_down_end_count(task, mv);
                target = deref_tmp;
            }
            let tr = p.sym_ref(target);
            let destroy = p.call_fn(destroy_fn, vec![tr]);
            p.insert_before_down_end_count(task, destroy);
        }
        return Ok(stored);
    }

    if p.is_record(base_ty) && !by_ref {
        // Runtime-type-info records carry no auto-copy hook; pass unchanged.
        let copy_fn = match p.auto_copy_fn(base_ty) {
            Some(f) => f,
            None => return Ok(var),
        };
        let val_tmp = p.new_temp("_copy_tmp", base_ty);
        let d = p.def(val_tmp);
        p.insert_before(fcall, d);
        let vr = p.sym_ref(var);
        let copy = p.call_fn(copy_fn, vec![vr]);
        let mv = p.move_into(val_tmp, copy);
        p.insert_before(fcall, mv);

        if first_call {
            if let Some(destroy_fn) = p.auto_destroy_fn(base_ty) {
                let formal = formal_at(p, fcall, arg_idx)
                    .ok_or_else(|| LowerError::NoMatchingFormal(p.sym(task).name.clone()))?;
                let fr = p.sym_ref(formal);
                let destroy = p.call_fn(destroy_fn, vec![fr]);
                p.insert_before_down_end_count(task, destroy);
            }
        }
        return Ok(val_tmp);
    }

    Ok(var)
}

/// Rewrites one call site: allocates a bundle, fills its fields, and swaps
/// the call for a wrapper invocation.
fn bundle_args(
    p: &mut Program,
    fcall: NodeId,
    task: SymbolId,
    state: &mut BundleState,
) -> Result<(), LowerError> {
    let first_call = state.first_call;
    if first_call != state.wrapper.is_none() {
        return Err(LowerError::WrapperState(p.sym(task).name.clone()));
    }
    if first_call {
        state.bundle_type = Some(create_arg_bundle_class(p, task, fcall)?);
    }
    let ctype = state
        .bundle_type
        .ok_or_else(|| LowerError::WrapperState(p.sym(task).name.clone()))?;

    let task_name = p.sym(task).name.clone();
    let tempc = p.new_temp(format!("_args_for_{}", task_name), ctype);
    let d = p.def(tempc);
    p.insert_before(fcall, d);
    insert_here_alloc(p, fcall, false, tempc, ctype, "bundled args");

    let t_void = p.builtins.t_void;
    let n_args = p.call_args(fcall).len();
    for i in 0..n_args {
        let var = insert_auto_copy_destroy_for_task_arg(p, fcall, i, task, first_call)?;
        let field = p.ty(ctype).fields[i];
        let base = p.sym_ref(tempc);
        let fref = p.sym_ref(field);
        let vref = p.sym_ref(var);
        let setc = p.call_prim(Prim::SetMember, vec![base, fref, vref], t_void);
        p.insert_before(fcall, setc);
    }

    create_block_fn_wrapper(p, task, fcall, state)?;
    let wrapper = state
        .wrapper
        .ok_or_else(|| LowerError::WrapperState(task_name))?;
    call_block_fn_wrapper(p, task, fcall, tempc, wrapper);
    state.first_call = false;
    Ok(())
}

/// Synthesizes the wrapper for `task` on the first call: one bundle formal
/// (preceded by a locale formal for `on` tasks), a body that unpacks every
/// field into a temp and calls the task, and a trailing free for tasks whose
/// caller does not own the bundle.
fn create_block_fn_wrapper(
    p: &mut Program,
    task: SymbolId,
    fcall: NodeId,
    state: &mut BundleState,
) -> Result<(), LowerError> {
    if !state.first_call {
        if state.wrapper.is_none() {
            return Err(LowerError::WrapperState(p.sym(task).name.clone()));
        }
        return Ok(());
    }
    let ctype = state
        .bundle_type
        .ok_or_else(|| LowerError::WrapperState(p.sym(task).name.clone()))?;

    let task_flags = p.fn_flags(task);
    let mut wrap_flags = FnFlags::empty();
    if task_flags.contains(FnFlags::ON) {
        wrap_flags |= FnFlags::ON_BLOCK;
    }
    if task_flags.contains(FnFlags::NON_BLOCKING) {
        wrap_flags |= FnFlags::NON_BLOCKING;
    }
    if task_flags.contains(FnFlags::COBEGIN_OR_COFORALL) {
        wrap_flags |= FnFlags::COBEGIN_OR_COFORALL_BLOCK;
    }
    if task_flags.contains(FnFlags::BEGIN) {
        wrap_flags |= FnFlags::BEGIN_BLOCK;
    }

    let t_void = p.builtins.t_void;
    let module = p.module_of(fcall);
    let task_name = p.sym(task).name.clone();
    let wrap_fn = p.add_fn(format!("wrap_{}", task_name), module, t_void, wrap_flags);

    if task_flags.contains(FnFlags::ON) {
        // The leading locale formal is consumed by the runtime's fork; the
        // task body itself never sees it.
        let locale_formal = p.fn_data(task).formals[0];
        let name = p.sym(locale_formal).name.clone();
        let ty = p.sym(locale_formal).ty;
        let intent = p
            .sym(locale_formal)
            .intent()
            .ok_or_else(|| LowerError::UnexpectedShape {
                context: format!("locale formal of {}", task_name),
            })?;
        p.add_formal(wrap_fn, name, ty, intent);
    }
    let wrap_c = p.add_formal(wrap_fn, "c", ctype, Intent::ConstRef);

    let wrap_def = p.def(wrap_fn);
    match module {
        Some(m) => {
            let mbody = p.module_data(m).body;
            p.insert_at_tail(mbody, wrap_def);
        }
        None => {
            let block = p.program_block;
            p.insert_at_tail(block, wrap_def);
        }
    }

    let body = p.fn_data(wrap_fn).body;
    let fields = p.ty(ctype).fields.clone();
    let mut forwarded = Vec::new();
    for (i, &field) in fields.iter().enumerate() {
        let fname = p.sym(field).name.clone();
        let fty = p.sym(field).ty;
        let tmp = p.new_temp(fname, fty);
        let d = p.def(tmp);
        p.insert_at_tail(body, d);
        let cref = p.sym_ref(wrap_c);
        let fref = p.sym_ref(field);
        let get = p.call_prim(Prim::GetMemberValue, vec![cref, fref], fty);
        let mv = p.move_into(tmp, get);
        p.insert_at_tail(body, mv);
        // The first field of an `on` bundle holds the target locale; it is
        // not forwarded into the task body.
        if !(i == 0 && task_flags.contains(FnFlags::ON)) {
            forwarded.push(tmp);
        }
    }

    let call_args: Vec<NodeId> = forwarded.iter().map(|&t| p.sym_ref(t)).collect();
    let call_orig = p.call_fn(task, call_args);
    p.insert_at_tail(body, call_orig);

    if !task_flags.contains(FnFlags::ON) {
        let cref = p.sym_ref(wrap_c);
        let free = here_free_call(p, cref);
        p.insert_at_tail(body, free);
    }

    let g_void = p.builtins.g_void;
    let vref = p.sym_ref(g_void);
    let ret = p.call_prim(Prim::Return, vec![vref], t_void);
    p.insert_at_tail(body, ret);

    state.wrapper = Some(wrap_fn);
    Ok(())
}

/// Replaces the original task call with a wrapper call. `on` calls forward
/// the locale actual directly and free the bundle on the caller's side.
fn call_block_fn_wrapper(
    p: &mut Program,
    task: SymbolId,
    fcall: NodeId,
    tempc: SymbolId,
    wrap_fn: SymbolId,
) {
    if p.fn_flags(task).contains(FnFlags::ON) {
        let locale_actual = p.call_remove_arg(fcall, 0);
        let tref = p.sym_ref(tempc);
        let wcall = p.call_fn(wrap_fn, vec![locale_actual, tref]);
        p.insert_before(fcall, wcall);
        let tref2 = p.sym_ref(tempc);
        let free = here_free_call(p, tref2);
        p.insert_after(fcall, free);
    } else {
        let tref = p.sym_ref(tempc);
        let wcall = p.call_fn(wrap_fn, vec![tref]);
        p.insert_before(fcall, wcall);
    }
    p.remove(fcall);
}

/// Drops the dummy locale formal from an `on` body, along with every
/// (now dead) statement that still references it.
fn remove_dummy_locale_formal(p: &mut Program, task: SymbolId) {
    let formal = p.fn_data(task).formals[0];
    let body = p.fn_data(task).body;
    for se in skein_ir::collect_sym_refs_in(p, body) {
        if p.sym_of(se) == Some(formal) {
            let stmt = p.stmt_of(se);
            if p.parent(stmt).is_some() {
                p.remove(stmt);
            }
        }
    }
    p.fn_data_mut(task).formals.remove(0);
}
