//! Heap promotion.
//!
//! Storage reachable from an asynchronous task must outlive the frame that
//! declared it. This pass computes the closure of variables and references
//! that may flow into a task, replaces their storage with single-field heap
//! cells, reroutes every def and use through the cell, and frees the cells
//! that provably never escape.
//!
//! Module-level variables get the same treatment under distributed execution
//! so their addresses can be broadcast at startup. Replicable constants are
//! exempt: those are re-materialized on every node instead.

use std::collections::{HashMap, HashSet};

use skein_ir::{
    actual_to_formal, all_defs, classify_sym_ref, CallSites, DefUseMap, FnFlags, Node, NodeId,
    Prim, Program, SymFlags, SymbolId, TargetConfig, TypeFlags,
};

use crate::runtime::{here_free_call, insert_here_alloc};
use crate::LowerError;

/// Worklist with a membership set; iteration order is insertion order.
#[derive(Default)]
struct SymWorklist {
    vec: Vec<SymbolId>,
    set: HashSet<SymbolId>,
}

impl SymWorklist {
    fn add(&mut self, sym: SymbolId) {
        if self.set.insert(sym) {
            self.vec.push(sym);
        }
    }

    fn contains(&self, sym: SymbolId) -> bool {
        self.set.contains(&sym)
    }
}

/// Entry point: promote captured and (when distributed) module-level storage
/// to heap cells.
pub fn make_heap_allocations(p: &mut Program, cfg: &TargetConfig) -> Result<(), LowerError> {
    let mut du = DefUseMap::build(p);
    let sites = CallSites::build(p);
    let formal_owner = build_formal_owner_map(p);

    let mut refs = SymWorklist::default();
    let mut vars = SymWorklist::default();

    find_block_ref_actuals(p, cfg, &mut refs);
    find_heap_vars_and_refs(p, cfg, &du, &mut refs, &mut vars)?;

    // Closure over the reference worklist: a captured ref drags in whatever
    // it can alias.
    let mut i = 0;
    while i < refs.vec.len() {
        let r = refs.vec[i];
        i += 1;
        if p.sym(r).is_formal() {
            let f = formal_owner[&r];
            let slot = p
                .fn_data(f)
                .formals
                .iter()
                .position(|&x| x == r)
                .ok_or_else(|| LowerError::UnexpectedShape {
                    context: format!("formal {} missing from {}", p.sym(r).name, p.sym(f).name),
                })?;
            for &call in sites.of(f) {
                let actual = p.call_args(call)[slot];
                let sym = p.sym_of(actual).ok_or_else(|| LowerError::ExpectedSymActual {
                    context: format!("ref actual of {}", p.sym(f).name),
                })?;
                if !p.is_ref(p.sym(sym).ty) {
                    return Err(LowerError::UnexpectedUseForm {
                        sym: p.sym(sym).name.clone(),
                        span: p.span_of(sym),
                    });
                }
                refs.add(sym);
            }
        } else {
            trace_ref_var_defs(p, r, &du, &mut refs, &mut vars)?;
        }
    }

    // Promotion proper. The vector grows as formals spawn entry temps.
    let mut heap_allocated: Vec<SymbolId> = Vec::new();
    let mut i = 0;
    while i < vars.vec.len() {
        let var = vars.vec[i];
        i += 1;

        if p.is_ref(p.sym(var).ty) {
            return Err(LowerError::UnexpectedDefForm {
                sym: p.sym(var).name.clone(),
                span: p.span_of(var),
            });
        }
        if p.sym(var).flags.intersects(SymFlags::EXTERN | SymFlags::DEBUG_ONLY) {
            continue;
        }
        if p.is_module_level_var(var) && !cfg.require_wide_references() {
            continue;
        }

        if p.sym(var).is_formal() {
            promote_formal(p, var, &formal_owner, &mut du, &mut vars);
            continue;
        }

        let var_ty = p.sym(var).ty;
        let heap_ty = p.build_heap_type(var_ty);

        // Locals are allocated at their def point; globals wait for the
        // startup initializer.
        let has_flow = !du.defs(var).is_empty() || !du.uses(var).is_empty();
        if !p.is_module_level_var(var) && has_flow {
            let def_node = p.sym(var).def_node.ok_or_else(|| LowerError::UnexpectedDefForm {
                sym: p.sym(var).name.clone(),
                span: p.span_of(var),
            })?;
            insert_here_alloc(p, def_node, true, var, heap_ty, "local heap-converted data");
            heap_allocated.push(var);
        }

        rewrite_defs(p, var, heap_ty, &du)?;
        rewrite_uses(p, var, heap_ty, &du)?;
        p.sym_mut(var).ty = heap_ty;
    }

    free_heap_allocated_vars(p, &heap_allocated)
}

fn build_formal_owner_map(p: &Program) -> HashMap<SymbolId, SymbolId> {
    let mut map = HashMap::new();
    for s in p.symbol_ids() {
        if p.sym(s).is_fn() {
            for &formal in &p.fn_data(s).formals {
                map.insert(formal, s);
            }
        }
    }
    map
}

/// Seeds the reference set: every ref formal of a `begin` body, or of an
/// `on` body when the target may need heap storage or runs non-blocking.
fn find_block_ref_actuals(p: &Program, cfg: &TargetConfig, refs: &mut SymWorklist) {
    for f in p.symbol_ids() {
        if !p.sym(f).is_fn() {
            continue;
        }
        let flags = p.fn_flags(f);
        let wanted = flags.contains(FnFlags::BEGIN)
            || (flags.contains(FnFlags::ON)
                && (cfg.need_heap_vars() || flags.contains(FnFlags::NON_BLOCKING)));
        if wanted {
            for &formal in &p.fn_data(f).formals {
                if p.is_ref(p.sym(formal).ty) {
                    refs.add(formal);
                }
            }
        }
    }
}

/// Seeds the variable set from every definition: coforall indices, and
/// module-level variables under distributed execution. Replicable constants
/// are broadcast instead; record-wrapped globals get their own replication.
fn find_heap_vars_and_refs(
    p: &mut Program,
    cfg: &TargetConfig,
    du: &DefUseMap,
    refs: &mut SymWorklist,
    vars: &mut SymWorklist,
) -> Result<(), LowerError> {
    for def_node in all_defs(p) {
        let sym = match *p.node(def_node) {
            Node::Def { sym } => sym,
            _ => continue,
        };
        let ty = p.sym(sym).ty;
        if p.sym(sym).flags.contains(SymFlags::COFORALL_INDEX) {
            if p.is_ref(ty) {
                refs.add(sym);
            } else {
                let ret_by_ref = p
                    .fn_of(def_node)
                    .map(|f| p.fn_data(f).ret_by_ref)
                    .unwrap_or(false);
                if !p.is_primitive_type(ty) || ret_by_ref {
                    vars.add(sym);
                }
            }
        } else if !cfg.is_local()
            && p.is_module_level_var(sym)
            && !p.sym(sym).flags.intersects(SymFlags::PRIVATE | SymFlags::EXTERN)
        {
            let replicable_const = p.sym(sym).flags.contains(SymFlags::CONST)
                && (p.is_broadcastable_scalar(ty)
                    || (p.is_record(ty)
                        && !p
                            .ty(ty)
                            .flags
                            .intersects(TypeFlags::RECORD_WRAPPED | TypeFlags::SYNC)));
            if replicable_const {
                let defs = du.defs(sym).to_vec();
                if defs.len() != 1 {
                    return Err(LowerError::ConstDefCount(p.sym(sym).name.clone()));
                }
                for se in defs {
                    let stmt = p.stmt_of(se);
                    let sr = p.sym_ref(sym);
                    let t_void = p.builtins.t_void;
                    let bc = p.call_prim(Prim::PrivateBroadcast, vec![sr], t_void);
                    p.insert_after(stmt, bc);
                }
            } else if p.ty(ty).flags.contains(TypeFlags::RECORD_WRAPPED) {
                replicate_global_record_wrapped_var(p, sym, def_node)?;
            } else {
                vars.add(sym);
            }
        }
    }
    Ok(())
}

/// Replicates the address of a record-wrapped global (array, domain,
/// distribution) by broadcasting after the statement that builds its
/// initializing expression, found by scanning the module's init function
/// past the first use of the captured reference.
fn replicate_global_record_wrapped_var(
    p: &mut Program,
    sym: SymbolId,
    def_node: NodeId,
) -> Result<(), LowerError> {
    let not_found = || LowerError::ReplicationTargetNotFound(p.sym(sym).name.clone());
    let module = p.module_of(def_node).ok_or_else(not_found)?;
    let init_fn = p.module_data(module).init_fn.ok_or_else(not_found)?;
    let body = p.fn_data(init_fn).body;
    let stmts = p.children(body);

    let mut anchor = *stmts.first().ok_or_else(not_found)?;
    let mut cur_sym = sym;
    let mut use_first: Option<NodeId> = None;
    let mut found = false;

    'walk: for &stmt in stmts.iter().skip(1) {
        anchor = stmt;
        for se in skein_ir::collect_sym_refs_in(p, stmt) {
            if p.sym_of(se) != Some(cur_sym) {
                continue;
            }
            let du = classify_sym_ref(p, se);
            if du.is_def {
                // First flow for the variable is a def: the normal case.
                if use_first.is_some() {
                    return Err(not_found());
                }
                found = true;
                break 'walk;
            }
            if use_first.is_none() {
                // A reference to the variable is captured and handed to the
                // function that builds the initializing expression; chase
                // the captured reference instead.
                let addr = p.parent(se).ok_or_else(not_found)?;
                if !p.is_prim(addr, Prim::AddrOf) {
                    return Err(not_found());
                }
                let outer = p.parent(addr).ok_or_else(not_found)?;
                if !matches!(p.node(outer), Node::Call { .. }) {
                    return Err(not_found());
                }
                let first_arg = *p.call_args(outer).first().ok_or_else(not_found)?;
                cur_sym = p.sym_of(first_arg).ok_or_else(not_found)?;
                use_first = Some(stmt);
            } else {
                // This statement builds the initializing expression.
                if p.resolved_callee(stmt).is_none() {
                    return Err(not_found());
                }
                found = true;
                break 'walk;
            }
        }
    }
    let _ = found;

    let sr = p.sym_ref(sym);
    let t_void = p.builtins.t_void;
    let bc = p.call_prim(Prim::PrivateBroadcast, vec![sr], t_void);
    p.insert_after(anchor, bc);
    Ok(())
}

/// Follows the definitions of a ref-typed local to the storage it can alias.
fn trace_ref_var_defs(
    p: &mut Program,
    r: SymbolId,
    du: &DefUseMap,
    refs: &mut SymWorklist,
    vars: &mut SymWorklist,
) -> Result<(), LowerError> {
    for &def in du.defs(r) {
        let call = match p.parent(def) {
            Some(c) if matches!(p.node(c), Node::Call { .. }) => c,
            _ => {
                return Err(LowerError::UnexpectedDefForm {
                    sym: p.sym(r).name.clone(),
                    span: p.span_of(r),
                })
            }
        };
        if !p.is_prim(call, Prim::Move) {
            // Defined by passing to a ref/out/inout formal: the alias was
            // established elsewhere or shows up in another def.
            continue;
        }
        let rhs = p.call_args(call)[1];
        match p.node(rhs).clone() {
            Node::Call { .. } if p.is_prim(rhs, Prim::AddrOf) => {
                let base = p.call_args(rhs)[0];
                let sym = p.sym_of(base).ok_or_else(|| LowerError::UnexpectedDefForm {
                    sym: p.sym(r).name.clone(),
                    span: p.span_of(r),
                })?;
                vars.add(sym);
            }
            Node::Call { target, .. }
                if matches!(
                    target,
                    skein_ir::CallTarget::Prim(
                        Prim::GetMember
                            | Prim::GetMemberValue
                            | Prim::GetSvecMember
                            | Prim::GetSvecMemberValue
                    )
                ) =>
            {
                let base = p.call_args(rhs)[0];
                let sym = p.sym_of(base).ok_or_else(|| LowerError::UnexpectedDefForm {
                    sym: p.sym(r).name.clone(),
                    span: p.span_of(r),
                })?;
                if p.is_ref(p.sym(sym).ty) {
                    refs.add(sym);
                } else {
                    vars.add(sym);
                }
            }
            Node::Call { .. } => {
                // A ref produced by a function return is assumed to point at
                // storage that already lives on the heap. This is not sound
                // in general; see the design notes.
                log::warn!(
                    "assuming ref {} produced by a call refers to heap storage",
                    p.sym(r).name
                );
            }
            Node::Sym { sym } => {
                if !p.is_ref(p.sym(sym).ty) {
                    return Err(LowerError::UnexpectedDefForm {
                        sym: p.sym(sym).name.clone(),
                        span: p.span_of(sym),
                    });
                }
                refs.add(sym);
            }
            _ => {
                return Err(LowerError::UnexpectedDefForm {
                    sym: p.sym(r).name.clone(),
                    span: p.span_of(r),
                })
            }
        }
    }
    Ok(())
}

/// A promoted formal is copied into an entry-block temp; the temp joins the
/// promotion set and the formal's defs and uses are retargeted onto it.
fn promote_formal(
    p: &mut Program,
    formal: SymbolId,
    formal_owner: &HashMap<SymbolId, SymbolId>,
    du: &mut DefUseMap,
    vars: &mut SymWorklist,
) {
    let f = formal_owner[&formal];
    let ty = p.sym(formal).ty;
    let tmp = p.new_temp(format!("_{}_tmp", p.sym(formal).name), ty);
    vars.add(tmp);

    let body = p.fn_data(f).body;
    let first_def = p.sym_ref(tmp);
    let fr = p.sym_ref(formal);
    let t_void = p.builtins.t_void;
    let mv = p.call_prim(Prim::Move, vec![first_def, fr], t_void);
    p.insert_at_head(body, mv);
    let d = p.def(tmp);
    p.insert_at_head(body, d);
    du.add_def(tmp, first_def);

    for &def in du.defs(formal).to_vec().iter() {
        if let Node::Sym { sym } = p.node_mut(def) {
            *sym = tmp;
        }
    }
    for &u in du.uses(formal).to_vec().iter() {
        if let Node::Sym { sym } = p.node_mut(u) {
            *sym = tmp;
        }
    }
    du.retarget(formal, tmp);
}

/// Every def of a promoted variable becomes a store into its heap cell.
fn rewrite_defs(
    p: &mut Program,
    var: SymbolId,
    heap_ty: skein_ir::TypeId,
    du: &DefUseMap,
) -> Result<(), LowerError> {
    let value_field = p.ty(heap_ty).fields[0];
    let var_ty = p.sym(var).ty;
    let t_void = p.builtins.t_void;

    for &def in du.defs(var).to_vec().iter() {
        let call = match p.parent(def) {
            Some(c) if matches!(p.node(c), Node::Call { .. }) => c,
            _ => {
                return Err(LowerError::UnexpectedDefForm {
                    sym: p.sym(var).name.clone(),
                    span: p.span_of(var),
                })
            }
        };
        if p.is_prim(call, Prim::Move) {
            let tmp = p.new_temp("_heap_tmp", var_ty);
            let d = p.def(tmp);
            p.insert_before(call, d);
            let rhs = p.call_remove_arg(call, 1);
            let mv = p.move_into(tmp, rhs);
            p.insert_before(call, mv);

            let base = p.sym_ref(var);
            let fref = p.sym_ref(value_field);
            let tref = p.sym_ref(tmp);
            let setc = p.call_prim(Prim::SetMember, vec![base, fref, tref], t_void);
            p.replace(call, setc);
        } else if p
            .resolved_callee(call)
            .map(|f| p.fn_flags(f).contains(FnFlags::AUTO_DESTROY_FN))
            .unwrap_or(false)
        {
            p.remove(call);
        } else {
            let tmp = p.new_temp("_heap_tmp", var_ty);
            let stmt = p.stmt_of(call);
            let d = p.def(tmp);
            p.insert_before(stmt, d);
            let base = p.sym_ref(var);
            let fref = p.sym_ref(value_field);
            let get = p.call_prim(Prim::GetMemberValue, vec![base, fref], var_ty);
            let mv = p.move_into(tmp, get);
            p.insert_before(stmt, mv);
            let tref = p.sym_ref(tmp);
            p.replace(def, tref);
        }
    }
    Ok(())
}

/// Every use of a promoted variable reads through its heap cell, except
/// actuals whose formal already expects the cell type.
fn rewrite_uses(
    p: &mut Program,
    var: SymbolId,
    heap_ty: skein_ir::TypeId,
    du: &DefUseMap,
) -> Result<(), LowerError> {
    let value_field = p.ty(heap_ty).fields[0];
    let var_ty = p.sym(var).ty;

    for &use_n in du.uses(var).to_vec().iter() {
        let parent = match p.parent(use_n) {
            Some(pa) => pa,
            None => continue,
        };
        let call = match p.node(parent) {
            Node::Call { .. } => parent,
            _ => {
                return Err(LowerError::UnexpectedUseForm {
                    sym: p.sym(var).name.clone(),
                    span: p.span_of(var),
                })
            }
        };

        if p.is_prim(call, Prim::AddrOf) {
            let mv = match p.parent(call) {
                Some(m) if p.is_prim(m, Prim::Move) => m,
                _ => {
                    return Err(LowerError::UnexpectedUseForm {
                        sym: p.sym(var).name.clone(),
                        span: p.span_of(var),
                    })
                }
            };
            let lhs = p.call_args(mv)[0];
            if p.node_type(lhs) == heap_ty {
                let copy = p.sym_ref(var);
                p.replace(call, copy);
            } else {
                let base = p.sym_ref(var);
                let fref = p.sym_ref(value_field);
                let ref_ty = p.ensure_ref_type(var_ty);
                let get = p.call_prim(Prim::GetMember, vec![base, fref], ref_ty);
                p.replace(call, get);
            }
        } else if let Some(callee) = p.resolved_callee(call) {
            if p.fn_flags(callee).contains(FnFlags::AUTO_DESTROY_FN_SYNC) {
                // Sync variables stay alive; freeing them here could race a
                // task that still holds the variable. Known leak.
                p.remove(call);
            } else if actual_to_formal(p, use_n).map(|f| p.sym(f).ty) == Some(heap_ty) {
                // The callee expects the cell itself.
            } else {
                rewrite_use_through_value_temp(p, var, var_ty, value_field, call, use_n);
            }
        } else if is_accessor_with_base(p, call, use_n) {
            let ref_ty = p.ensure_ref_type(var_ty);
            let tmp = p.new_temp("_heap_tmp", ref_ty);
            let stmt = p.stmt_of(call);
            let d = p.def(tmp);
            p.insert_before(stmt, d);
            let base = p.sym_ref(var);
            let fref = p.sym_ref(value_field);
            let get = p.call_prim(Prim::GetMember, vec![base, fref], ref_ty);
            let mv = p.move_into(tmp, get);
            p.insert_before(stmt, mv);
            let tref = p.sym_ref(tmp);
            p.replace(use_n, tref);
        } else {
            rewrite_use_through_value_temp(p, var, var_ty, value_field, call, use_n);
        }
    }
    Ok(())
}

fn rewrite_use_through_value_temp(
    p: &mut Program,
    var: SymbolId,
    var_ty: skein_ir::TypeId,
    value_field: SymbolId,
    call: NodeId,
    use_n: NodeId,
) {
    let tmp = p.new_temp("_heap_tmp", var_ty);
    let stmt = p.stmt_of(call);
    let d = p.def(tmp);
    p.insert_before(stmt, d);
    let base = p.sym_ref(var);
    let fref = p.sym_ref(value_field);
    let get = p.call_prim(Prim::GetMemberValue, vec![base, fref], var_ty);
    let mv = p.move_into(tmp, get);
    p.insert_before(stmt, mv);
    let tref = p.sym_ref(tmp);
    p.replace(use_n, tref);
}

/// Member and wide accessors whose base operand is the given use.
fn is_accessor_with_base(p: &Program, call: NodeId, use_n: NodeId) -> bool {
    let is_accessor = [
        Prim::GetMember,
        Prim::GetSvecMember,
        Prim::GetMemberValue,
        Prim::GetSvecMemberValue,
        Prim::WideGetLocale,
        Prim::WideGetNode,
        Prim::SetSvecMember,
        Prim::SetMember,
    ]
    .iter()
    .any(|&pr| p.is_prim(call, pr));
    is_accessor && p.call_args(call).first() == Some(&use_n)
}

/// Frees heap cells that cannot reach any task, at the innermost block
/// covering all their uses. Escaping cells are left for the runtime.
fn free_heap_allocated_vars(p: &mut Program, heap_allocated: &[SymbolId]) -> Result<(), LowerError> {
    // Functions that may carry a task: task bodies plus all their transitive
    // callers.
    let mut task_fns: Vec<SymbolId> = Vec::new();
    let mut task_set: HashSet<SymbolId> = HashSet::new();
    for f in p.symbol_ids() {
        if p.sym(f).is_fn()
            && p.fn_flags(f).intersects(
                FnFlags::BEGIN | FnFlags::COBEGIN_OR_COFORALL | FnFlags::NON_BLOCKING,
            )
            && task_set.insert(f)
        {
            task_fns.push(f);
        }
    }
    let sites = CallSites::build(p);
    let mut i = 0;
    while i < task_fns.len() {
        let f = task_fns[i];
        i += 1;
        for &call in sites.of(f) {
            if let Some(caller) = p.fn_of(call) {
                if task_set.insert(caller) {
                    task_fns.push(caller);
                }
            }
        }
    }

    let du = DefUseMap::build(p);

    for &var in heap_allocated {
        if du.defs(var).len() != 1 {
            continue;
        }

        // Track the variable through aliases created by moves; any path into
        // a task-carrying function keeps the cell alive.
        let mut free_var = true;
        let mut tracked: Vec<SymbolId> = vec![var];
        let mut seen: HashSet<SymbolId> = tracked.iter().copied().collect();
        let mut ti = 0;
        'track: while ti < tracked.len() {
            let v = tracked[ti];
            ti += 1;
            for &use_n in du.uses(v) {
                let mut call = match p.parent(use_n) {
                    Some(c) if matches!(p.node(c), Node::Call { .. }) => c,
                    _ => continue,
                };
                let is_alias_prim = [
                    Prim::AddrOf,
                    Prim::GetMember,
                    Prim::GetSvecMember,
                    Prim::WideGetLocale,
                    Prim::WideGetNode,
                ]
                .iter()
                .any(|&pr| p.is_prim(call, pr));
                if is_alias_prim {
                    call = match p.parent(call) {
                        Some(c) if matches!(p.node(c), Node::Call { .. }) => c,
                        _ => continue,
                    };
                }
                if p.is_prim(call, Prim::Move) || p.is_prim(call, Prim::Assign) {
                    if let Some(lhs) = p.sym_of(p.call_args(call)[0]) {
                        if seen.insert(lhs) {
                            tracked.push(lhs);
                        }
                    }
                } else if let Some(callee) = p.resolved_callee(call) {
                    if task_set.contains(&callee) {
                        free_var = false;
                        break 'track;
                    }
                }
            }
        }
        if !free_var {
            continue;
        }

        let uses = du.uses(var);
        if uses.is_empty() {
            return Err(LowerError::NoDominatingBlock(p.sym(var).name.clone()));
        }
        let innermost = innermost_covering_block(p, uses)
            .ok_or_else(|| LowerError::NoDominatingBlock(p.sym(var).name.clone()))?;

        let def_se = du.defs(var)[0];
        let alloc_move = p.parent(def_se).ok_or_else(|| LowerError::UnexpectedDefForm {
            sym: p.sym(var).name.clone(),
            span: p.span_of(var),
        })?;
        let owner = p.fn_of(alloc_move);
        let vr = p.sym_ref(var);
        let free = here_free_call(p, vr);
        match owner {
            Some(f) if p.fn_data(f).body == innermost => p.insert_before_return(f, free),
            _ => p.insert_at_tail(innermost, free),
        }
    }
    Ok(())
}

/// Deepest block that encloses every given use.
fn innermost_covering_block(p: &Program, uses: &[NodeId]) -> Option<NodeId> {
    let chain = |n: NodeId| -> Vec<NodeId> {
        let mut blocks = Vec::new();
        let mut cur = p.enclosing_block(n);
        while let Some(b) = cur {
            blocks.push(b);
            cur = p.enclosing_block(b);
        }
        blocks
    };
    let first = chain(uses[0]);
    let rest: Vec<HashSet<NodeId>> = uses[1..]
        .iter()
        .map(|&u| chain(u).into_iter().collect())
        .collect();
    first
        .into_iter()
        .find(|b| rest.iter().all(|set| set.contains(b)))
}
