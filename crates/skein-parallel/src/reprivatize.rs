//! Iterator-field re-privatization.
//!
//! An iterator's state class may capture a privatized class (one with a
//! per-node copy addressed by a privatization id). Storing a pointer to one
//! node's copy would leak that node's address into iterators running
//! elsewhere, so the field is demoted to the pid and every access is routed
//! through `get_priv_class`, which resolves the pid against the executing
//! node's table.

use std::collections::HashSet;

use skein_ir::{
    all_sym_refs, Node, Prim, Program, SymbolId, TargetConfig, TypeFlags,
};

use crate::LowerError;

/// Demotes privatized iterator-class fields to pids and rewrites accesses.
pub fn reprivatize_iterators(p: &mut Program, cfg: &TargetConfig) -> Result<(), LowerError> {
    if cfg.is_local() {
        return Ok(());
    }

    let mut priv_fields: Vec<SymbolId> = Vec::new();
    let mut priv_set: HashSet<SymbolId> = HashSet::new();
    for t in p.type_ids() {
        if !p.ty(t).flags.contains(TypeFlags::ITERATOR_CLASS) {
            continue;
        }
        for &field in p.ty(t).fields.clone().iter() {
            let fty = p.sym(field).ty;
            if p.ty(fty).flags.contains(TypeFlags::PRIVATIZED_CLASS) && priv_set.insert(field) {
                priv_fields.push(field);
            }
        }
    }
    if priv_fields.is_empty() {
        return Ok(());
    }

    for se in all_sym_refs(p) {
        let field = match p.sym_of(se) {
            Some(s) if priv_set.contains(&s) => s,
            _ => continue,
        };
        let call = match p.parent(se) {
            Some(c) if matches!(p.node(c), Node::Call { .. }) => c,
            _ => {
                return Err(LowerError::UnexpectedPrivatizedAccess(
                    p.sym(field).name.clone(),
                ))
            }
        };
        let priv_class = p.sym(field).ty;
        let pid_field = p.field_named(priv_class, "pid").ok_or_else(|| {
            LowerError::UnexpectedPrivatizedAccess(p.sym(field).name.clone())
        })?;
        let pid_ty = p.sym(pid_field).ty;

        if p.is_prim(call, Prim::GetMemberValue) {
            let mv = match p.parent(call) {
                Some(m) if p.is_prim(m, Prim::Move) => m,
                _ => {
                    return Err(LowerError::UnexpectedPrivatizedAccess(
                        p.sym(field).name.clone(),
                    ))
                }
            };
            let lhs = p.call_args(mv)[0];
            let lhs_sym = p.sym_of(lhs).ok_or_else(|| {
                LowerError::UnexpectedPrivatizedAccess(p.sym(field).name.clone())
            })?;
            let tmp = p.new_temp("_pid_tmp", pid_ty);
            let d = p.def(tmp);
            p.insert_before(mv, d);
            let tr = p.sym_ref(tmp);
            p.replace(lhs, tr);
            let cls_ty = p.sym(lhs_sym).ty;
            let ts = p.type_sym(cls_ty);
            let tsr = p.sym_ref(ts);
            let pr = p.sym_ref(tmp);
            let gp = p.call_prim(Prim::GetPrivClass, vec![tsr, pr], cls_ty);
            let back = p.move_into(lhs_sym, gp);
            p.insert_after(mv, back);
        } else if p.is_prim(call, Prim::GetMember) {
            let mv = match p.parent(call) {
                Some(m) if p.is_prim(m, Prim::Move) => m,
                _ => {
                    return Err(LowerError::UnexpectedPrivatizedAccess(
                        p.sym(field).name.clone(),
                    ))
                }
            };
            let lhs = p.call_args(mv)[0];
            let lhs_sym = p.sym_of(lhs).ok_or_else(|| {
                LowerError::UnexpectedPrivatizedAccess(p.sym(field).name.clone())
            })?;
            let tmp = p.new_temp("_pid_tmp", pid_ty);
            let d = p.def(tmp);
            p.insert_before(mv, d);
            let tr = p.sym_ref(tmp);
            p.replace(lhs, tr);
            // The member read now produces the pid by value.
            p.set_call_target(call, skein_ir::CallTarget::Prim(Prim::GetMemberValue));
            if let Node::Call { ty, .. } = p.node_mut(call) {
                *ty = pid_ty;
            }
            let val_ty = p.value_type(p.sym(lhs_sym).ty);
            let val_tmp = p.new_temp("_priv_tmp", val_ty);
            let vd = p.def(val_tmp);
            p.insert_before(mv, vd);
            // Inserted in reverse so the resolved class lands before the
            // address is retaken.
            let vr = p.sym_ref(val_tmp);
            let lhs_ty = p.sym(lhs_sym).ty;
            let addr = p.call_prim(Prim::AddrOf, vec![vr], lhs_ty);
            let back_ref = p.move_into(lhs_sym, addr);
            p.insert_after(mv, back_ref);
            let ts = p.type_sym(val_ty);
            let tsr = p.sym_ref(ts);
            let pr = p.sym_ref(tmp);
            let gp = p.call_prim(Prim::GetPrivClass, vec![tsr, pr], val_ty);
            let resolve = p.move_into(val_tmp, gp);
            p.insert_after(mv, resolve);
        } else if p.is_prim(call, Prim::SetMember) {
            let tmp = p.new_temp("_pid_tmp", pid_ty);
            let d = p.def(tmp);
            p.insert_before(call, d);
            let value = p.call_remove_arg(call, 2);
            let pf = p.sym_ref(pid_field);
            let get = p.call_prim(Prim::GetMemberValue, vec![value, pf], pid_ty);
            let mv = p.move_into(tmp, get);
            p.insert_before(call, mv);
            let tr = p.sym_ref(tmp);
            p.call_push_arg(call, tr);
        } else {
            return Err(LowerError::UnexpectedPrivatizedAccess(
                p.sym(field).name.clone(),
            ));
        }
    }

    let t_int = p.builtins.t_int;
    for &field in &priv_fields {
        p.sym_mut(field).ty = t_int;
    }
    Ok(())
}
