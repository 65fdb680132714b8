//! Local-block specialization.
//!
//! Inside an explicitly-local region the programmer asserts no communication
//! happens. A breadth-first walk from every local block narrows wide
//! operands at communicating primitives (with a runtime `local_check` unless
//! suppressed) and clones every resolved, non-extern callee into a
//! `_local_`-prefixed copy specialized the same way. A per-function cache
//! keeps recursion from cloning twice.

use std::collections::HashMap;

use skein_ir::{
    collect_calls_in, BlockKind, CallTarget, FnFlags, Node, NodeId, Prim, Program, SymFlags,
    SymbolId, TargetConfig,
};

use crate::LowerError;

/// Specializes all code reachable from local blocks.
pub fn handle_local_blocks(p: &mut Program, cfg: &TargetConfig) -> Result<(), LowerError> {
    let mut cache: HashMap<SymbolId, SymbolId> = HashMap::new();
    let mut queue: Vec<NodeId> = Vec::new();

    for root in p.roots() {
        for n in p.collect_preorder(root) {
            if matches!(p.node(n), Node::Block { kind: BlockKind::Local, .. }) {
                queue.push(n);
            }
        }
    }

    let mut i = 0;
    while i < queue.len() {
        let block = queue[i];
        i += 1;
        for call in collect_calls_in(p, block) {
            localize_call(p, call, cfg)?;
            let f = match p.resolved_callee(call) {
                Some(f) => f,
                None => continue,
            };
            if let Some(&already) = cache.get(&f) {
                p.set_call_target(call, CallTarget::Fn(already));
                continue;
            }
            if p.fn_flags(f).contains(FnFlags::EXTERN) {
                continue;
            }

            let local = p.clone_fn(f);
            p.fn_data_mut(local).flags |= FnFlags::LOCAL_FN;
            let name = format!("_local_{}", p.sym(f).name);
            p.sym_mut(local).name = name;
            match p.sym(f).def_node.filter(|&d| p.parent(d).is_some()) {
                Some(orig_def) => {
                    let nd = p.def(local);
                    p.insert_before(orig_def, nd);
                }
                None => {
                    let nd = p.def(local);
                    let block = p.program_block;
                    p.insert_at_tail(block, nd);
                }
            }
            p.set_call_target(call, CallTarget::Fn(local));
            queue.push(p.fn_data(local).body);
            cache.insert(f, local);
            // The clone maps to itself so recursive calls stay put.
            cache.insert(local, local);

            let ret_ty = p.fn_data(local).ret_type;
            if p.is_wide(ret_ty) {
                narrow_clone_return(p, local, cfg)?;
            }
        }
    }
    Ok(())
}

/// Rewrites a clone's trailing return through a local temp so its declared
/// return type becomes narrow.
fn narrow_clone_return(
    p: &mut Program,
    local: SymbolId,
    cfg: &TargetConfig,
) -> Result<(), LowerError> {
    let body = p.fn_data(local).body;
    let last = p
        .children(body)
        .last()
        .copied()
        .filter(|&s| p.is_prim(s, Prim::Return))
        .ok_or_else(|| LowerError::UnexpectedShape {
            context: format!("return of local clone {}", p.sym(local).name),
        })?;
    let ret_arg = p.call_args(last)[0];
    insert_local_temp(p, ret_arg, cfg)?;
    let new_arg = p.call_args(last)[0];
    let narrow_ty = p.node_type(new_arg);
    p.fn_data_mut(local).ret_type = narrow_ty;
    p.sym_mut(local).ty = narrow_ty;
    Ok(())
}

/// Asserts that the wide operand is local, then drops its wideness by moving
/// the address into a narrow temp and using that instead.
fn insert_local_temp(
    p: &mut Program,
    node: NodeId,
    cfg: &TargetConfig,
) -> Result<SymbolId, LowerError> {
    let sym = p.sym_of(node).ok_or_else(|| LowerError::ExpectedSymActual {
        context: "local-block narrowing".to_string(),
    })?;
    let stmt = p.stmt_of(node);
    let wide_ty = p.sym(sym).ty;
    let narrow_ty = p
        .field_named(wide_ty, "addr")
        .map(|f| p.sym(f).ty)
        .ok_or_else(|| LowerError::UnexpectedShape {
            context: format!("narrowing non-wide symbol {}", p.sym(sym).name),
        })?;
    let var = p.new_temp(format!("local_{}", p.sym(sym).name), narrow_ty);
    if !cfg.no_local_checks {
        let sr = p.sym_ref(sym);
        let t_void = p.builtins.t_void;
        let chk = p.call_prim(Prim::LocalCheck, vec![sr], t_void);
        p.insert_before(stmt, chk);
    }
    let d = p.def(var);
    p.insert_before(stmt, d);
    let sr = p.sym_ref(sym);
    let mv = p.move_into(var, sr);
    p.insert_before(stmt, mv);
    let r = p.sym_ref(var);
    p.replace(node, r);
    Ok(var)
}

/// Narrows wide operands of primitives that would otherwise communicate.
/// The cases follow the backend's lowering of each primitive; primitives
/// that never touch remote memory are left alone.
fn localize_call(p: &mut Program, call: NodeId, cfg: &TargetConfig) -> Result<(), LowerError> {
    let prim = match p.call_target(call) {
        Some(CallTarget::Prim(pr)) => pr,
        _ => return Ok(()),
    };
    match prim {
        Prim::ArraySet | Prim::ArraySetFirst => {
            let a0 = p.call_args(call)[0];
            if p.is_wide_class(p.node_type(a0)) {
                insert_local_temp(p, a0, cfg)?;
            }
        }
        Prim::Move | Prim::Assign => {
            let args = p.call_args(call);
            let rhs = args[1];
            if matches!(p.node(rhs), Node::Call { .. }) {
                if p.is_prim(rhs, Prim::Deref) {
                    let a = p.call_args(rhs)[0];
                    if p.is_wide(p.node_type(a)) {
                        let v = insert_local_temp(p, a, cfg)?;
                        let narrow_ty = p.sym(v).ty;
                        if !p.is_ref(narrow_ty) {
                            if !p.is_string(narrow_ty) {
                                return Err(LowerError::UnexpectedShape {
                                    context: "deref of non-ref narrow operand".to_string(),
                                });
                            }
                            // A narrow string needs no deref at all.
                            let inner = p.call_remove_arg(rhs, 0);
                            p.replace(rhs, inner);
                        }
                    }
                    return Ok(());
                }
                if [
                    Prim::GetMember,
                    Prim::GetSvecMember,
                    Prim::GetMemberValue,
                    Prim::GetSvecMemberValue,
                ]
                .iter()
                .any(|&pr| p.is_prim(rhs, pr))
                {
                    let rargs = p.call_args(rhs);
                    if p.is_wide(p.node_type(rargs[0])) {
                        let field = p.sym_of(rargs[1]).ok_or_else(|| {
                            LowerError::UnexpectedShape {
                                context: "member primitive field operand".to_string(),
                            }
                        })?;
                        if !p.sym(field).flags.contains(SymFlags::SUPER_CLASS) {
                            insert_local_temp(p, rargs[0], cfg)?;
                        }
                    }
                    return Ok(());
                }
                if p.is_prim(rhs, Prim::ArrayGet) || p.is_prim(rhs, Prim::ArrayGetValue) {
                    let rargs = p.call_args(rhs);
                    if p.is_wide_class(p.node_type(rargs[0])) {
                        let lhs = args[0];
                        let lhs_sym =
                            p.sym_of(lhs).ok_or_else(|| LowerError::ExpectedSymActual {
                                context: "array get destination".to_string(),
                            })?;
                        let stmt = p.stmt_of(call);
                        insert_local_temp(p, rargs[0], cfg)?;
                        let lhs_ty = p.sym(lhs_sym).ty;
                        let local_ty = if p.is_prim(rhs, Prim::ArrayGet) {
                            p.field_named(lhs_ty, "addr")
                                .map(|f| p.sym(f).ty)
                                .ok_or_else(|| LowerError::UnexpectedShape {
                                    context: "array get with narrow destination".to_string(),
                                })?
                        } else {
                            lhs_ty
                        };
                        let local_var =
                            p.new_temp(format!("local_{}", p.sym(lhs_sym).name), local_ty);
                        let d = p.def(local_var);
                        p.insert_before(stmt, d);
                        let lr = p.sym_ref(local_var);
                        p.replace(lhs, lr);
                        let lr2 = p.sym_ref(local_var);
                        let back = p.move_into(lhs_sym, lr2);
                        p.insert_after(stmt, back);
                    }
                    return Ok(());
                }
                if p.is_prim(rhs, Prim::GetUnionId) {
                    let a = p.call_args(rhs)[0];
                    if p.is_wide_ref(p.node_type(a)) {
                        insert_local_temp(p, a, cfg)?;
                    }
                    return Ok(());
                }
                if p.is_prim(rhs, Prim::TestCid) || p.is_prim(rhs, Prim::GetCid) {
                    let a = p.call_args(rhs)[0];
                    if p.is_wide_class(p.node_type(a)) {
                        insert_local_temp(p, a, cfg)?;
                    }
                    return Ok(());
                }
            }
            let lhs_ty = p.node_type(args[0]);
            let rhs_ty = p.node_type(args[1]);
            if p.is_wide_class(lhs_ty) && !p.is_wide_class(rhs_ty) {
                // Widening assignment into a wide class; no communication.
                return Ok(());
            }
            if p.is_wide_ref(lhs_ty) && !p.is_wide_ref(rhs_ty) && !p.is_ref(rhs_ty) {
                insert_local_temp(p, args[0], cfg)?;
            }
        }
        Prim::DynamicCast => {
            let args = p.call_args(call);
            if p.is_wide_class(p.node_type(args[1])) {
                insert_local_temp(p, args[1], cfg)?;
                let target_ty = p.node_type(args[0]);
                if p.is_wide(target_ty) {
                    if let Some(sym) = p.sym_of(args[0]) {
                        let narrow = p.wide_addr_type(target_ty);
                        p.sym_mut(sym).ty = narrow;
                    }
                }
            }
        }
        Prim::SetCid => {
            let a0 = p.call_args(call)[0];
            if p.is_wide_class(p.node_type(a0)) {
                insert_local_temp(p, a0, cfg)?;
            }
        }
        Prim::SetUnionId => {
            let a0 = p.call_args(call)[0];
            if p.is_wide_ref(p.node_type(a0)) {
                insert_local_temp(p, a0, cfg)?;
            }
        }
        Prim::SetMember | Prim::SetSvecMember => {
            let a0 = p.call_args(call)[0];
            if p.is_wide(p.node_type(a0)) {
                insert_local_temp(p, a0, cfg)?;
            }
        }
        _ => {}
    }
    Ok(())
}
