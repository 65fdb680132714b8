// Heap promotion: captured locals, coforall indices, module-level variables,
// replicable constants, and cell reclamation.

mod common;

use common::*;
use skein_ir::{
    CommLayer, FnFlags, GasnetSegment, Intent, Prim, SymFlags, TargetConfig, TypeFlags,
};
use skein_parallel::make_heap_allocations;

#[test]
fn local_captured_by_ref_moves_to_heap_and_is_not_freed() {
    let Fixture { mut p, module, main } = fixture();
    let t_int = p.builtins.t_int;
    let int_ref = p.ensure_ref_type(t_int);

    let beg = task_fn(&mut p, module, "beg", FnFlags::BEGIN, &[("rx", int_ref, Intent::ConstRef)]);
    add_down_end_count(&mut p, beg);
    ret_void(&mut p, beg);

    let x = local_var(&mut p, main, "x", t_int);
    move_imm(&mut p, main, x, 3);
    let rx = local_var(&mut p, main, "rx", int_ref);
    let xr = p.sym_ref(x);
    let addr = p.call_prim(Prim::AddrOf, vec![xr], int_ref);
    let mv = p.move_into(rx, addr);
    add_stmt(&mut p, main, mv);
    let rxr = p.sym_ref(rx);
    let call = p.call_fn(beg, vec![rxr]);
    add_stmt(&mut p, main, call);
    ret_void(&mut p, main);

    let cfg = TargetConfig::single_locale();
    make_heap_allocations(&mut p, &cfg).unwrap();

    // x now lives in a heap cell allocated at its def point.
    assert!(p.is_heap_cell(p.sym(x).ty));
    assert_eq!(p.field_type(p.sym(x).ty, "value"), t_int);
    let main_body = p.fn_data(main).body;
    assert_eq!(count_prim_calls(&p, main_body, Prim::HereAlloc), 1);

    // Its def became a store into the cell and the address-taking became a
    // member access.
    assert_eq!(count_prim_calls(&p, main_body, Prim::SetMember), 1);
    assert_eq!(count_prim_calls(&p, main_body, Prim::AddrOf), 0);
    assert!(count_prim_calls(&p, main_body, Prim::GetMember) >= 1);

    // The cell escapes into the task, so nothing frees it.
    assert_eq!(count_prim_calls(&p, main_body, Prim::HereFree), 0);
}

#[test]
fn non_escaping_promoted_index_is_freed_before_return() {
    let Fixture { mut p, module, main } = fixture();
    let rec = record_type(&mut p, "elem", TypeFlags::empty());
    let sink = extern_sink(&mut p, module, "consume", rec);

    let y = local_var(&mut p, main, "y", rec);
    p.sym_mut(y).flags |= SymFlags::COFORALL_INDEX;
    let yr = p.sym_ref(y);
    let call = p.call_fn(sink, vec![yr]);
    add_stmt(&mut p, main, call);
    ret_void(&mut p, main);

    let cfg = TargetConfig::single_locale();
    make_heap_allocations(&mut p, &cfg).unwrap();

    assert!(p.is_heap_cell(p.sym(y).ty));
    let stmts = body_stmts(&p, main);
    // The free lands immediately before the trailing return.
    let n = stmts.len();
    assert!(p.is_prim(stmts[n - 1], Prim::Return));
    assert!(p.is_prim(stmts[n - 2], Prim::HereFree));
    let freed = p.sym_of(p.call_args(stmts[n - 2])[0]);
    assert_eq!(freed, Some(y));

    // The use itself was rerouted through the cell's value.
    let main_body = p.fn_data(main).body;
    assert!(count_prim_calls(&p, main_body, Prim::GetMemberValue) >= 1);
    let sink_calls = calls_in_fn(&p, main, |p, c| is_call_to(p, c, sink));
    assert_ne!(p.sym_of(p.call_args(sink_calls[0])[0]), Some(y));
}

#[test]
fn primitive_coforall_index_is_left_alone() {
    let Fixture { mut p, module, main } = fixture();
    let t_int = p.builtins.t_int;
    let sink = extern_sink(&mut p, module, "consume", t_int);

    let i = local_var(&mut p, main, "i", t_int);
    p.sym_mut(i).flags |= SymFlags::COFORALL_INDEX;
    let ir = p.sym_ref(i);
    let call = p.call_fn(sink, vec![ir]);
    add_stmt(&mut p, main, call);
    ret_void(&mut p, main);

    let cfg = TargetConfig::single_locale();
    make_heap_allocations(&mut p, &cfg).unwrap();

    assert_eq!(p.sym(i).ty, t_int);
}

#[test]
fn replicable_const_is_broadcast_not_promoted() {
    let Fixture { mut p, module, .. } = fixture();
    let t_real = p.builtins.t_real;

    let pi = p.add_var("pi", t_real);
    p.sym_mut(pi).flags |= SymFlags::CONST;
    let d = p.def(pi);
    let mbody = p.module_data(module).body;
    p.insert_at_tail(mbody, d);
    let three = p.int_imm(3);
    let tr = p.sym_ref(three);
    let mv = p.move_into(pi, tr);
    p.insert_at_tail(mbody, mv);

    let cfg = TargetConfig::multi_locale(CommLayer::Gasnet, GasnetSegment::Fast);
    make_heap_allocations(&mut p, &cfg).unwrap();

    // Type unchanged; a broadcast sits right after the initializing def.
    assert_eq!(p.sym(pi).ty, t_real);
    let stmts = p.children(mbody);
    let mv_pos = stmts.iter().position(|&s| s == mv).unwrap();
    let next = stmts[mv_pos + 1];
    assert!(p.is_prim(next, Prim::PrivateBroadcast));
    assert_eq!(p.sym_of(p.call_args(next)[0]), Some(pi));
}

#[test]
fn module_level_var_is_promoted_without_local_alloc() {
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

    // Promoted, def rewritten, but allocation is deferred to startup.
    assert!(p.is_heap_cell(p.sym(g).ty));
    assert_eq!(count_prim_calls(&p, mbody, Prim::SetMember), 1);
    assert_eq!(count_prim_calls(&p, mbody, Prim::HereAlloc), 0);
}

#[test]
fn single_locale_leaves_globals_alone() {
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

    let cfg = TargetConfig::single_locale();
    make_heap_allocations(&mut p, &cfg).unwrap();

    assert_eq!(p.sym(g).ty, t_int);
}

#[test]
fn promoted_formal_is_copied_into_entry_temp() {
    let Fixture { mut p, module, main } = fixture();
    let t_int = p.builtins.t_int;
    let int_ref = p.ensure_ref_type(t_int);

    let beg = task_fn(&mut p, module, "beg", FnFlags::BEGIN, &[("rx", int_ref, Intent::ConstRef)]);
    add_down_end_count(&mut p, beg);
    ret_void(&mut p, beg);

    // The captured variable is a formal of an intermediate function.
    let t_void = p.builtins.t_void;
    let mid = p.add_fn("mid", Some(module), t_void, FnFlags::empty());
    let w = p.add_formal(mid, "w", t_int, Intent::In);
    let md = p.def(mid);
    let mbody = p.module_data(module).body;
    p.insert_at_tail(mbody, md);
    let rw = local_var(&mut p, mid, "rw", int_ref);
    let wr = p.sym_ref(w);
    let addr = p.call_prim(Prim::AddrOf, vec![wr], int_ref);
    let mv = p.move_into(rw, addr);
    add_stmt(&mut p, mid, mv);
    let rwr = p.sym_ref(rw);
    let call = p.call_fn(beg, vec![rwr]);
    add_stmt(&mut p, mid, call);
    ret_void(&mut p, mid);

    let five = p.int_imm(5);
    let fr = p.sym_ref(five);
    let outer = p.call_fn(mid, vec![fr]);
    add_stmt(&mut p, main, outer);
    ret_void(&mut p, main);

    let cfg = TargetConfig::single_locale();
    make_heap_allocations(&mut p, &cfg).unwrap();

    // The formal keeps its type; a heap-promoted temp takes over its uses.
    assert_eq!(p.sym(w).ty, t_int);
    let mid_body = p.fn_data(mid).body;
    let stmts = p.children(mid_body);
    // Entry sequence: the temp is defined and heap-allocated at the top.
    assert!(matches!(p.node(stmts[0]), skein_ir::Node::Def { .. }));
    let tmp = match *p.node(stmts[0]) {
        skein_ir::Node::Def { sym } => sym,
        _ => unreachable!(),
    };
    assert!(p.is_heap_cell(p.sym(tmp).ty));
    assert!(p.is_prim(stmts[1], Prim::Move));
    assert_eq!(p.sym_of(p.call_args(stmts[1])[0]), Some(tmp));
    assert_eq!(count_prim_calls(&p, mid_body, Prim::HereAlloc), 1);
    // The formal's value is read exactly once (the entry copy); its cell
    // carries it everywhere else.
    let w_refs = skein_ir::collect_sym_refs_in(&p, mid_body)
        .into_iter()
        .filter(|&se| p.sym_of(se) == Some(w))
        .count();
    assert_eq!(w_refs, 1);
    // The entry copy lands in the cell via a member store.
    assert!(count_prim_calls(&p, mid_body, Prim::SetMember) >= 1);
}
