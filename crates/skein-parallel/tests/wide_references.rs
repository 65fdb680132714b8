// Wide-reference insertion: wide types, symbol widening, narrowing at
// local-args boundaries, nil conversion, and the global heap initializer.

mod common;

use common::*;
use skein_ir::{
    CommLayer, FnFlags, GasnetSegment, Intent, Node, Prim, TargetConfig, TypeFlags, TypeKind,
};
use skein_parallel::{insert_wide_references, make_heap_allocations};

#[test]
fn class_symbols_are_widened_and_extern_calls_narrowed() {
    let Fixture { mut p, module, main } = fixture();
    let c_ty = class_type(&mut p, "conn", &["n"]);
    p.ty_mut(c_ty).flags |= TypeFlags::EXTERN;

    // An extern callee with local-args semantics.
    let t_void = p.builtins.t_void;
    let ext = p.add_fn("conn_poke", Some(module), t_void, FnFlags::EXTERN | FnFlags::LOCAL_ARGS);
    p.add_formal(ext, "cc", c_ty, Intent::In);
    let ed = p.def(ext);
    let mbody = p.module_data(module).body;
    p.insert_at_tail(mbody, ed);

    let c = local_var(&mut p, main, "c", c_ty);
    let cr = p.sym_ref(c);
    let call = p.call_fn(ext, vec![cr]);
    add_stmt(&mut p, main, call);
    // A member read of c.n.
    let t_int = p.builtins.t_int;
    let n_field = p.field_named(c_ty, "n").unwrap();
    let t = local_var(&mut p, main, "t", t_int);
    let cr2 = p.sym_ref(c);
    let fr = p.sym_ref(n_field);
    let get = p.call_prim(Prim::GetMemberValue, vec![cr2, fr], t_int);
    let mv = p.move_into(t, get);
    add_stmt(&mut p, main, mv);
    ret_void(&mut p, main);

    let cfg = TargetConfig::multi_locale(CommLayer::Gasnet, GasnetSegment::Fast);
    insert_wide_references(&mut p, &cfg).unwrap();

    // A wide form with (locale, addr) exists and c now carries it.
    let wide = *p.wide_class_map.get(&c_ty).expect("no wide class built");
    assert_eq!(p.ty(wide).kind, TypeKind::WideClass);
    assert_eq!(p.field_type(wide, "addr"), c_ty);
    assert_eq!(p.sym(c).ty, wide);
    // The extern formal stays narrow.
    let cc = p.fn_data(ext).formals[0];
    assert_eq!(p.sym(cc).ty, c_ty);

    // The call narrows through a temp, guarded by a local check, and copies
    // the value back afterwards.
    let main_body = p.fn_data(main).body;
    assert_eq!(count_prim_calls(&p, main_body, Prim::LocalCheck), 1);
    let ext_calls = calls_in_fn(&p, main, |p, c| is_call_to(p, c, ext));
    let narrow_arg = p.sym_of(p.call_args(ext_calls[0])[0]).unwrap();
    assert_ne!(narrow_arg, c);
    assert_eq!(p.sym(narrow_arg).ty, c_ty);
    let stmts = body_stmts(&p, main);
    let call_pos = stmts.iter().position(|&s| s == ext_calls[0]).unwrap();
    let after = stmts[call_pos + 1];
    assert!(p.is_prim(after, Prim::Move));
    assert_eq!(p.sym_of(p.call_args(after)[0]), Some(c));
}

#[test]
fn local_checks_can_be_suppressed() {
    let Fixture { mut p, module, main } = fixture();
    let c_ty = class_type(&mut p, "conn", &["n"]);
    p.ty_mut(c_ty).flags |= TypeFlags::EXTERN;
    let t_void = p.builtins.t_void;
    let ext = p.add_fn("conn_poke", Some(module), t_void, FnFlags::EXTERN | FnFlags::LOCAL_ARGS);
    p.add_formal(ext, "cc", c_ty, Intent::In);
    let ed = p.def(ext);
    let mbody = p.module_data(module).body;
    p.insert_at_tail(mbody, ed);

    let c = local_var(&mut p, main, "c", c_ty);
    let cr = p.sym_ref(c);
    let call = p.call_fn(ext, vec![cr]);
    add_stmt(&mut p, main, call);
    ret_void(&mut p, main);

    let mut cfg = TargetConfig::multi_locale(CommLayer::Gasnet, GasnetSegment::Fast);
    cfg.no_local_checks = true;
    insert_wide_references(&mut p, &cfg).unwrap();

    let main_body = p.fn_data(main).body;
    assert_eq!(count_prim_calls(&p, main_body, Prim::LocalCheck), 0);
}

#[test]
fn single_locale_emits_only_the_stub() {
    let Fixture { mut p, module, main } = fixture();
    let c_ty = class_type(&mut p, "conn", &["n"]);
    let c = local_var(&mut p, main, "c", c_ty);
    ret_void(&mut p, main);
    let _ = module;

    let cfg = TargetConfig::single_locale();
    insert_wide_references(&mut p, &cfg).unwrap();

    // No widening at all, and the initializer is a bare return.
    assert!(p.wide_class_map.is_empty());
    assert!(p.wide_ref_map.is_empty());
    assert_eq!(p.sym(c).ty, c_ty);
    let init = find_fn(&p, "heapAllocateGlobals").expect("stub missing");
    assert!(p.fn_flags(init).contains(FnFlags::EXPORT | FnFlags::LOCAL_ARGS));
    let stmts = body_stmts(&p, init);
    assert_eq!(stmts.len(), 1);
    assert!(p.is_prim(stmts[0], Prim::Return));
}

#[test]
fn promoted_globals_are_allocated_registered_and_broadcast() {
    let Fixture { mut p, module, .. } = fixture();
    let t_int = p.builtins.t_int;

    let g = p.add_var("counter", t_int);
    let d = p.def(g);
    let mbody = p.module_data(module).body;
    p.insert_at_tail(mbody, d);
    let zero = p.int_imm(0);
    let zr = p.sym_ref(zero);
    let mv = p.move_into(g, zr);
    p.insert_at_tail(mbody, mv);

    let cfg = TargetConfig::multi_locale(CommLayer::Gasnet, GasnetSegment::Fast);
    make_heap_allocations(&mut p, &cfg).unwrap();
    insert_wide_references(&mut p, &cfg).unwrap();

    // The global's heap cell was widened, and startup handles allocation.
    assert!(p.is_wide_class(p.sym(g).ty));
    assert!(p.is_heap_cell(p.wide_addr_type(p.sym(g).ty)));

    let init = find_fn(&p, "heapAllocateGlobals").expect("initializer missing");
    let body = p.fn_data(init).body;
    assert_eq!(p.globals_on_heap, 1);
    assert_eq!(count_prim_calls(&p, body, Prim::HeapRegisterGlobalVar), 1);
    assert_eq!(count_prim_calls(&p, body, Prim::HeapBroadcastGlobalVars), 1);
    // The allocation is conditional on being node 0.
    let cond = skein_ir::collect_calls_in(&p, body);
    let _ = cond;
    let has_cond = p
        .children(body)
        .iter()
        .any(|&s| matches!(p.node(s), Node::Cond { .. }));
    assert!(has_cond);
    assert_eq!(count_prim_calls(&p, body, Prim::HereAlloc), 1);
}

#[test]
fn nil_typed_symbols_collapse_to_the_sentinel() {
    let Fixture { mut p, module, main } = fixture();
    let t_nil = p.builtins.t_nil;
    let t_object = p.builtins.t_object;

    // A function that returns nil, and a nil-typed local.
    let f = p.add_fn("give_nil", Some(module), t_nil, FnFlags::empty());
    let fd = p.def(f);
    let mbody = p.module_data(module).body;
    p.insert_at_tail(mbody, fd);
    ret_void(&mut p, f);

    let nv = local_var(&mut p, main, "nv", t_nil);
    let g_nil = p.builtins.g_nil;
    let nr = p.sym_ref(g_nil);
    let mv = p.move_into(nv, nr);
    add_stmt(&mut p, main, mv);
    ret_void(&mut p, main);

    let cfg = TargetConfig::multi_locale(CommLayer::Gasnet, GasnetSegment::Fast);
    insert_wide_references(&mut p, &cfg).unwrap();

    assert_eq!(p.fn_data(f).ret_type, t_object);
    assert_eq!(p.sym(g_nil).ty, t_object);
    // The nil-typed local's def and its initializing move are both gone.
    let main_body = p.fn_data(main).body;
    for s in p.children(main_body) {
        if let Node::Def { sym } = *p.node(s) {
            assert_ne!(sym, nv);
        }
    }
    for se in skein_ir::collect_sym_refs_in(&p, main_body) {
        assert_ne!(p.sym_of(se), Some(nv));
    }
}

#[test]
fn wide_string_gets_a_size_field_and_stays_unique() {
    let Fixture { mut p, .. } = fixture();
    let t_string = p.builtins.t_string;

    let cfg = TargetConfig::multi_locale(CommLayer::Gasnet, GasnetSegment::Fast);
    insert_wide_references(&mut p, &cfg).unwrap();

    let ws = p.wide_string.expect("wide string not built");
    assert_eq!(p.ty(ws).kind, TypeKind::WideClass);
    assert_eq!(p.field_type(ws, "addr"), t_string);
    assert!(p.field_named(ws, "size").is_some());
    assert_eq!(p.wide_class_map.get(&t_string), Some(&ws));
}

#[test]
fn refs_are_widened_alongside_classes() {
    let Fixture { mut p, module, main } = fixture();
    let t_int = p.builtins.t_int;
    let int_ref = p.ensure_ref_type(t_int);
    let _ = module;

    let r = local_var(&mut p, main, "r", int_ref);
    ret_void(&mut p, main);

    let cfg = TargetConfig::multi_locale(CommLayer::Gasnet, GasnetSegment::Fast);
    insert_wide_references(&mut p, &cfg).unwrap();

    let wide = *p.wide_ref_map.get(&int_ref).expect("no wide ref built");
    assert_eq!(p.ty(wide).kind, TypeKind::WideRef);
    assert_eq!(p.sym(r).ty, wide);
    // The addr inside the wide layout stays the narrow ref.
    assert_eq!(p.field_type(wide, "addr"), int_ref);
}
