//! Wide-reference insertion.
//!
//! Under distributed execution a class reference or ref may point at another
//! node's memory, so its representation carries a locator next to the local
//! address. These sub-steps build the wide types, retype every eligible
//! symbol, and patch the primitives and call boundaries that care about the
//! difference between narrow and wide operands. Each step is a single sweep;
//! none iterates to a fixed point.

use skein_ir::{
    actual_to_formal, all_calls, all_defs, all_sym_refs, FnFlags, Immediate, Node, NodeId, Prim,
    Program, SymFlags, SymbolId, SymbolKind, TargetConfig, Type, TypeFlags, TypeId, TypeKind,
};

use crate::LowerError;

/// Replaces every nil-typed symbol with the unique nil sentinel (typed
/// `object`) and deletes the moves that targeted nil-typed variables.
pub fn convert_nil_to_object(p: &mut Program) {
    let t_nil = p.builtins.t_nil;
    let t_object = p.builtins.t_object;
    let g_nil = p.builtins.g_nil;

    for s in p.symbol_ids() {
        if p.sym(s).is_fn() && p.fn_data(s).ret_type == t_nil {
            p.fn_data_mut(s).ret_type = t_object;
            p.sym_mut(s).ty = t_object;
        }
    }

    for def_node in all_defs(p) {
        let sym = match *p.node(def_node) {
            Node::Def { sym } => sym,
            _ => continue,
        };
        if p.sym(sym).is_var() && p.sym(sym).ty == t_nil && sym != g_nil {
            if p.parent(def_node).is_some() {
                p.remove(def_node);
            }
        }
    }

    for se in all_sym_refs(p) {
        let sym = match p.sym_of(se) {
            Some(s) => s,
            None => continue,
        };
        if p.sym(sym).ty != t_nil {
            continue;
        }
        if let Node::Sym { sym: slot } = p.node_mut(se) {
            *slot = g_nil;
        }
        if let Some(parent) = p.parent(se) {
            if p.is_prim(parent, Prim::Move)
                && p.call_args(parent).first() == Some(&se)
                && p.parent(parent).is_some()
            {
                p.remove(parent);
            }
        }
    }

    p.sym_mut(g_nil).ty = t_object;
}

/// Builds a wide form for every class type that has not opted out, plus the
/// string type, which also carries its length.
pub fn build_wide_classes(p: &mut Program) -> Result<(), LowerError> {
    for t in p.type_ids() {
        if p.is_class_like(t) && !p.ty(t).flags.contains(TypeFlags::NO_WIDE_CLASS) {
            build_wide_class(p, t)?;
        }
    }
    let t_string = p.builtins.t_string;
    build_wide_class(p, t_string)?;
    Ok(())
}

fn build_wide_class(p: &mut Program, t: TypeId) -> Result<TypeId, LowerError> {
    let name = format!("__wide_{}", p.ty(t).name);
    let w = p.add_type(Type {
        name,
        kind: TypeKind::WideClass,
        flags: TypeFlags::empty(),
        fields: Vec::new(),
        elem_type: None,
        ref_type: None,
    });
    let t_locale_id = p.builtins.t_locale_id;
    p.add_field(w, "locale", t_locale_id);
    p.add_field(w, "addr", t);
    if t == p.builtins.t_string {
        let t_int = p.builtins.t_int;
        p.add_field(w, "size", t_int);
        if p.wide_string.is_some() {
            return Err(LowerError::DuplicateWideString);
        }
        p.wide_string = Some(w);
    }
    // The wide form will stand in for the class wherever its ref type
    // pointed, so it inherits the ref type.
    if let Some(r) = p.ty(t).ref_type {
        p.ty_mut(w).ref_type = Some(r);
    }
    let ts = p.type_sym(w);
    let def = p.def(ts);
    let block = p.program_block;
    p.insert_at_tail(block, def);

    if p.wide_class_map.insert(t, w).is_some() {
        return Err(LowerError::WideMapsNotEmpty);
    }
    Ok(w)
}

/// Which widening bucket a symbol falls into.
enum WidenKind {
    Fn,
    Value,
    Field { owner: TypeId },
    Skip,
}

fn widen_kind(p: &Program, s: SymbolId, exempt_local_args: bool, formal_owner: &std::collections::HashMap<SymbolId, SymbolId>) -> WidenKind {
    match &p.sym(s).kind {
        SymbolKind::Fn(_) => WidenKind::Fn,
        SymbolKind::Var { immediate } => {
            if immediate.is_some() {
                WidenKind::Skip
            } else {
                WidenKind::Value
            }
        }
        SymbolKind::Formal { .. } => {
            let exempt = exempt_local_args
                && formal_owner
                    .get(&s)
                    .map(|&f| p.fn_flags(f).intersects(FnFlags::EXTERN | FnFlags::LOCAL_ARGS))
                    .unwrap_or(false);
            if exempt {
                WidenKind::Skip
            } else {
                WidenKind::Value
            }
        }
        SymbolKind::Field { owner } => WidenKind::Field { owner: *owner },
        _ => WidenKind::Skip,
    }
}

/// Retypes every eligible class-typed symbol to its wide form.
pub fn widen_classes(p: &mut Program) {
    let formal_owner = formal_owner_map(p);
    for s in p.symbol_ids() {
        match widen_kind(p, s, true, &formal_owner) {
            WidenKind::Fn => {
                let flags = p.fn_flags(s);
                if !flags.intersects(FnFlags::EXTERN | FnFlags::LOCAL_ARGS) {
                    if let Some(&w) = p.wide_class_map.get(&p.fn_data(s).ret_type) {
                        p.fn_data_mut(s).ret_type = w;
                        p.sym_mut(s).ty = w;
                    }
                }
            }
            WidenKind::Value => {
                if let Some(&w) = p.wide_class_map.get(&p.sym(s).ty) {
                    p.sym_mut(s).ty = w;
                }
            }
            WidenKind::Field { owner } => {
                // The pointer inside a wide layout stays narrow, and super
                // fields are embedded records, not pointers.
                if p.is_wide(owner) || p.sym(s).flags.contains(SymFlags::SUPER_CLASS) {
                    continue;
                }
                if let Some(&w) = p.wide_class_map.get(&p.sym(s).ty) {
                    p.sym_mut(s).ty = w;
                }
            }
            WidenKind::Skip => {}
        }
    }

    // Arrays of classes become arrays of wide classes.
    for t in p.type_ids() {
        if p.ty(t).flags.contains(TypeFlags::DATA_CLASS) {
            if let Some(elem) = p.ty(t).elem_type {
                if let Some(&w) = p.wide_class_map.get(&elem) {
                    p.ty_mut(t).elem_type = Some(w);
                }
            }
        }
    }
}

/// Builds a wide form for every reference type.
pub fn build_wide_ref_map(p: &mut Program) {
    for t in p.type_ids() {
        if !p.is_ref(t) {
            continue;
        }
        let name = format!("__wide_{}", p.ty(t).name);
        let w = p.add_type(Type {
            name,
            kind: TypeKind::WideRef,
            flags: TypeFlags::empty(),
            fields: Vec::new(),
            elem_type: None,
            ref_type: None,
        });
        let t_locale_id = p.builtins.t_locale_id;
        p.add_field(w, "locale", t_locale_id);
        p.add_field(w, "addr", t);
        let ts = p.type_sym(w);
        let def = p.def(ts);
        let block = p.program_block;
        p.insert_at_tail(block, def);
        p.wide_ref_map.insert(t, w);
    }
}

/// Retypes every ref-typed symbol to its wide form.
pub fn widen_refs(p: &mut Program) {
    let formal_owner = formal_owner_map(p);
    for s in p.symbol_ids() {
        match widen_kind(p, s, false, &formal_owner) {
            WidenKind::Fn => {
                if let Some(&w) = p.wide_ref_map.get(&p.fn_data(s).ret_type) {
                    p.fn_data_mut(s).ret_type = w;
                    p.sym_mut(s).ty = w;
                }
            }
            WidenKind::Value => {
                if let Some(&w) = p.wide_ref_map.get(&p.sym(s).ty) {
                    p.sym_mut(s).ty = w;
                }
            }
            WidenKind::Field { owner } => {
                if p.is_wide(owner) || p.sym(s).flags.contains(SymFlags::SUPER_CLASS) {
                    continue;
                }
                if let Some(&w) = p.wide_ref_map.get(&p.sym(s).ty) {
                    p.sym_mut(s).ty = w;
                }
            }
            WidenKind::Skip => {}
        }
    }
}

/// Pushes `se` (an actual) through a fresh temp of the given type.
fn push_through_temp(p: &mut Program, se: NodeId, ty: TypeId) {
    let tmp = p.new_temp("_wide_tmp", ty);
    let stmt = p.stmt_of(se);
    let d = p.def(tmp);
    p.insert_before(stmt, d);
    let r = p.sym_ref(tmp);
    p.replace(se, r);
    let mv = p.move_into(tmp, se);
    p.insert_before(stmt, mv);
}

/// String literals are narrow; when one feeds a callee or store that now
/// expects a wide string, route it through a temp of the expected type.
pub fn insert_element_access_temps(p: &mut Program) -> Result<(), LowerError> {
    let t_string = p.builtins.t_string;
    for se in all_sym_refs(p) {
        let sym = match p.sym_of(se) {
            Some(s) => s,
            None => continue,
        };
        if p.sym(sym).ty != t_string
            || !matches!(p.sym(sym).immediate(), Some(Immediate::Str(_)))
        {
            continue;
        }
        let call = match p.parent(se) {
            Some(c) if matches!(p.node(c), Node::Call { .. }) => c,
            _ => continue,
        };

        if let Some(callee) = p.resolved_callee(call) {
            if p.fn_flags(callee).intersects(FnFlags::EXTERN | FnFlags::LOCAL_ARGS) {
                continue;
            }
            if let Some(formal) = actual_to_formal(p, se) {
                let ty = p.sym(formal).ty;
                push_through_temp(p, se, ty);
            }
        } else if p.is_prim(call, Prim::VmtCall) {
            // A vmt call names the target function in its first actual; the
            // literal maps to the formal one slot over.
            let args = p.call_args(call);
            let fsym = args.first().and_then(|&a| p.sym_of(a));
            let idx = args.iter().position(|&a| a == se);
            if let (Some(f), Some(idx)) = (fsym, idx) {
                if p.sym(f).is_fn() && idx >= 1 {
                    if let Some(&formal) = p.fn_data(f).formals.get(idx - 1) {
                        let ty = p.sym(formal).ty;
                        push_through_temp(p, se, ty);
                    }
                }
            }
        } else if p.is_prim(call, Prim::SetMember) {
            let args = p.call_args(call);
            if args.get(2) == Some(&se) {
                let field = p.sym_of(args[1]).ok_or_else(|| LowerError::UnexpectedShape {
                    context: "set_member field operand".to_string(),
                })?;
                let ty = p.sym(field).ty;
                push_through_temp(p, se, ty);
            }
        } else if p.is_prim(call, Prim::SetSvecMember) {
            let args = p.call_args(call);
            let base_ty = p.value_type(p.node_type(args[0]));
            if let Some(x1) = p.field_named(base_ty, "x1") {
                let comp_ty = p.sym(x1).ty;
                if p.is_wide_class(comp_ty) {
                    push_through_temp(p, se, comp_ty);
                }
            }
        } else if p.is_prim(call, Prim::ArraySetFirst) {
            let args = p.call_args(call);
            if args.get(2) == Some(&se) {
                let wide = p
                    .wide_class_map
                    .get(&t_string)
                    .copied()
                    .ok_or_else(|| LowerError::NoWideType("string".to_string()))?;
                push_through_temp(p, se, wide);
            }
        }
    }
    Ok(())
}

/// True when `t` is a narrow ref whose value is the wide string.
fn is_ref_wide_string(p: &Program, t: TypeId) -> bool {
    p.is_ref(t) && p.field_named(t, "_val").map(|f| Some(p.sym(f).ty)) == Some(p.wide_string)
}

/// Calls to `local_args` callees get each wide actual dereferenced into a
/// narrow temp before the call, with the result copied back afterwards.
pub fn narrow_wide_classes_through_calls(
    p: &mut Program,
    cfg: &TargetConfig,
) -> Result<(), LowerError> {
    for call in all_calls(p) {
        let callee = match p.resolved_callee(call) {
            Some(f) if p.fn_flags(f).contains(FnFlags::LOCAL_ARGS) => f,
            _ => continue,
        };
        for arg in p.call_args(call) {
            let sym = p.sym_of(arg).ok_or_else(|| LowerError::ExpectedSymActual {
                context: format!("call to local-args function {}", p.sym(callee).name),
            })?;
            let sym_ty = p.sym(sym).ty;
            if !p.is_wide(sym_ty) {
                continue;
            }
            let narrow = p.wide_addr_type(sym_ty);
            let tmp = p.new_temp("_narrow_tmp", narrow);
            let d = p.def(tmp);
            p.insert_before(call, d);

            let extern_class =
                p.is_wide_class(sym_ty) && p.ty(narrow).flags.contains(TypeFlags::EXTERN);
            if extern_class || is_ref_wide_string(p, narrow) {
                // Changes made through an extern class cannot be written back
                // to a remote copy, so the operand must already be local.
                if !cfg.no_local_checks {
                    let sr = p.sym_ref(sym);
                    let t_void = p.builtins.t_void;
                    let chk = p.call_prim(Prim::LocalCheck, vec![sr], t_void);
                    p.insert_before(call, chk);
                }
                let sr = p.sym_ref(sym);
                let mv = p.move_into(tmp, sr);
                p.insert_before(call, mv);
            } else if p.is_ref(narrow) || p.ty(narrow).flags.contains(TypeFlags::DATA_CLASS) {
                let sr = p.sym_ref(sym);
                let mv = p.move_into(tmp, sr);
                p.insert_before(call, mv);
            } else {
                let sr = p.sym_ref(sym);
                let deref = p.call_prim(Prim::Deref, vec![sr], narrow);
                let mv = p.move_into(tmp, deref);
                p.insert_before(call, mv);
            }

            // Copy back to cover out/inout semantics.
            let sr = p.sym_ref(sym);
            let tr = p.sym_ref(tmp);
            let t_void = p.builtins.t_void;
            let back = p.call_prim(Prim::Move, vec![sr, tr], t_void);
            p.insert_after(call, back);

            let r = p.sym_ref(tmp);
            p.replace(arg, r);
        }
    }
    Ok(())
}

/// Boxes the nil sentinel into a fresh wide temp wherever a wide class value
/// is expected.
pub fn insert_wide_class_temps_for_nil(p: &mut Program) -> Result<(), LowerError> {
    let g_nil = p.builtins.g_nil;
    for se in all_sym_refs(p) {
        if p.sym_of(se) != Some(g_nil) {
            continue;
        }
        let call = match p.parent(se) {
            Some(c) if matches!(p.node(c), Node::Call { .. }) => c,
            _ => continue,
        };

        if p.resolved_callee(call).is_some() {
            if let Some(formal) = actual_to_formal(p, se) {
                let ty = p.sym(formal).ty;
                if p.is_wide_class(ty) {
                    push_through_temp(p, se, ty);
                }
            }
        } else if p.is_prim(call, Prim::Move) {
            let lhs_ty = p.node_type(p.call_args(call)[0]);
            if p.is_wide_ref(lhs_ty) {
                let addr = p.wide_addr_type(lhs_ty);
                if p.is_ref(addr) {
                    let val = p.field_type(addr, "_val");
                    if p.is_wide_class(val) {
                        push_through_temp(p, se, val);
                    }
                }
            }
        } else if p.is_prim(call, Prim::SetMember) {
            let args = p.call_args(call);
            if args.get(2) == Some(&se) {
                let field_ty = p.node_type(args[1]);
                if p.is_wide(field_ty) {
                    push_through_temp(p, se, field_ty);
                }
            }
        } else if p.is_prim(call, Prim::SetSvecMember) {
            let base_ty = p.value_type(p.node_type(p.call_args(call)[0]));
            if let Some(x1) = p.field_named(base_ty, "x1") {
                let comp_ty = p.sym(x1).ty;
                if p.is_wide(comp_ty) {
                    push_through_temp(p, se, comp_ty);
                }
            }
        } else if p.is_prim(call, Prim::Return) {
            let f = p.fn_of(call).ok_or(LowerError::EndCountOutsideFn)?;
            let ret_ty = p.fn_data(f).ret_type;
            let tmp = p.new_temp("_nil_tmp", ret_ty);
            let d = p.def(tmp);
            p.insert_before(call, d);
            let nr = p.sym_ref(g_nil);
            let mv = p.move_into(tmp, nr);
            p.insert_before(call, mv);
            if let Node::Sym { sym } = p.node_mut(se) {
                *sym = tmp;
            }
        }
    }
    Ok(())
}

/// Splits a cast from the move it feeds whenever the destination type
/// differs, so a remote store is separated from the cast itself.
pub fn insert_wide_cast_temps(p: &mut Program) {
    for call in all_calls(p) {
        if !p.is_prim(call, Prim::Cast) {
            continue;
        }
        let mv = match p.parent(call) {
            Some(m) if p.is_prim(m, Prim::Move) || p.is_prim(m, Prim::Assign) => m,
            _ => continue,
        };
        let lhs_ty = p.node_type(p.call_args(mv)[0]);
        let cast_ty = p.node_type(call);
        if lhs_ty != cast_ty {
            let tmp = p.new_temp("_cast_tmp", cast_ty);
            let d = p.def(tmp);
            p.insert_before(mv, d);
            let r = p.sym_ref(tmp);
            p.replace(call, r);
            let mv2 = p.move_into(tmp, call);
            p.insert_before(mv, mv2);
        }
    }
}

/// Wide-string actuals to backend-opaque primitives are dereferenced to
/// local strings.
pub fn deref_wide_string_actuals(p: &mut Program) {
    let t_string = p.builtins.t_string;
    for call in all_calls(p) {
        if p.parent(call).is_none() && p.fn_of(call).is_none() {
            continue;
        }
        if !(p.is_prim(call, Prim::Unknown) || p.is_prim(call, Prim::Cast)) {
            continue;
        }
        for arg in p.call_args(call) {
            let ty = p.node_type(arg);
            if p.is_wide_class(ty) && p.wide_addr_type(ty) == t_string {
                let tmp = p.new_temp("_str_tmp", t_string);
                let stmt = p.stmt_of(call);
                let d = p.def(tmp);
                p.insert_before(stmt, d);
                let r = p.sym_ref(tmp);
                p.replace(arg, r);
                let deref = p.call_prim(Prim::Deref, vec![arg], t_string);
                let mv = p.move_into(tmp, deref);
                p.insert_before(stmt, mv);
            }
        }
    }
}

/// A wide ref to a wide class is dereferenced through a temp in member
/// primitives, so the primitive only ever sees one level of wideness.
pub fn deref_wide_refs_to_wide_classes(p: &mut Program) {
    let member_prims = [
        Prim::GetMember,
        Prim::GetMemberValue,
        Prim::WideGetLocale,
        Prim::WideGetNode,
        Prim::WideGetAddr,
        Prim::SetMember,
    ];
    for call in all_calls(p) {
        if !member_prims.iter().any(|&pr| p.is_prim(call, pr)) {
            continue;
        }
        let arg0 = p.call_args(call)[0];
        let ty = p.node_type(arg0);
        if p.is_wide_ref(ty) && p.is_wide_class(p.value_type(ty)) {
            let val_ty = p.value_type(ty);
            let tmp = p.new_temp("_deref_tmp", val_ty);
            let stmt = p.stmt_of(call);
            let d = p.def(tmp);
            p.insert_before(stmt, d);
            let old = p.call_remove_arg(call, 0);
            let deref = p.call_prim(Prim::Deref, vec![old], val_ty);
            let mv = p.move_into(tmp, deref);
            p.insert_before(stmt, mv);
            let r = p.sym_ref(tmp);
            p.call_insert_arg(call, 0, r);
        }
    }
}

/// The type-symbol operand of `get_priv_class` is swapped for its wide form.
pub fn widen_get_priv_class(p: &mut Program) -> Result<(), LowerError> {
    for call in all_calls(p) {
        if !p.is_prim(call, Prim::GetPrivClass) {
            continue;
        }
        let arg0 = p.call_args(call)[0];
        let ty = p.node_type(arg0);
        if !p.is_wide_class(ty) {
            let w = p
                .wide_class_map
                .get(&ty)
                .copied()
                .ok_or_else(|| LowerError::NoWideType(p.ty(ty).name.clone()))?;
            let ws = p.type_sym(w);
            let r = p.sym_ref(ws);
            p.replace(arg0, r);
        }
    }
    Ok(())
}

/// In `move lhs, rhs` where `lhs` holds a wide class behind a (wide) ref and
/// `rhs` is the narrow address type, the widening is sequenced through a
/// temp so the remote store sees a fully-formed wide value.
pub fn move_address_sources_to_temp(p: &mut Program) {
    for call in all_calls(p) {
        if !p.is_prim(call, Prim::Move) {
            continue;
        }
        let args = p.call_args(call);
        let lhs_ty = p.node_type(args[0]);
        if !(p.is_wide_ref(lhs_ty) || p.is_ref(lhs_ty)) {
            continue;
        }
        let val_ty = p.value_type(lhs_ty);
        if !p.is_wide_class(val_ty) {
            continue;
        }
        let rhs_ty = p.node_type(args[1]);
        if rhs_ty == p.wide_addr_type(val_ty) {
            let tmp = p.new_temp("_wide_tmp", val_ty);
            let d = p.def(tmp);
            p.insert_before(call, d);
            let rhs = p.call_remove_arg(call, 1);
            let mv = p.move_into(tmp, rhs);
            p.insert_before(call, mv);
            let r = p.sym_ref(tmp);
            p.call_push_arg(call, r);
        }
    }
}

fn formal_owner_map(p: &Program) -> std::collections::HashMap<SymbolId, SymbolId> {
    let mut map = std::collections::HashMap::new();
    for s in p.symbol_ids() {
        if p.sym(s).is_fn() {
            for &formal in &p.fn_data(s).formals {
                map.insert(formal, s);
            }
        }
    }
    map
}
