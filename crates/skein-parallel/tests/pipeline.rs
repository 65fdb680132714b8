// The two pass halves run back to back on a begin that captures a local by
// reference, under a distributed configuration.

mod common;

use common::*;
use skein_ir::{
    CommLayer, FnFlags, GasnetSegment, Intent, Prim, TargetConfig,
};
use skein_parallel::{insert_wide_references, lower_parallel};

#[test]
fn begin_capture_survives_the_full_pipeline() {
    let Fixture { mut p, module, main } = fixture();
    let t_int = p.builtins.t_int;
    let int_ref = p.ensure_ref_type(t_int);

    let beg = task_fn(&mut p, module, "beg", FnFlags::BEGIN, &[("rx", int_ref, Intent::ConstRef)]);
    let rxf = p.fn_data(beg).formals[0];
    let t = local_var(&mut p, beg, "t", t_int);
    let rr = p.sym_ref(rxf);
    let deref = p.call_prim(Prim::Deref, vec![rr], t_int);
    let mv = p.move_into(t, deref);
    add_stmt(&mut p, beg, mv);
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

    let cfg = TargetConfig::multi_locale(CommLayer::Gasnet, GasnetSegment::Fast);
    lower_parallel(&mut p, &cfg).unwrap();
    insert_wide_references(&mut p, &cfg).unwrap();

    // The captured local sits in a heap cell, itself widened.
    assert!(p.is_wide_class(p.sym(x).ty));
    assert!(p.is_heap_cell(p.wide_addr_type(p.sym(x).ty)));

    // The spawn goes through the wrapper, never the task body directly.
    let wrap = find_fn(&p, "wrap_beg").expect("wrapper missing");
    let main_body = p.fn_data(main).body;
    let direct: Vec<_> = skein_ir::collect_calls_in(&p, main_body)
        .into_iter()
        .filter(|&c| p.resolved_callee(c) == Some(beg))
        .collect();
    assert!(direct.is_empty());
    let via_wrap: Vec<_> = skein_ir::collect_calls_in(&p, main_body)
        .into_iter()
        .filter(|&c| p.resolved_callee(c) == Some(wrap))
        .collect();
    assert_eq!(via_wrap.len(), 1);

    // The bundle's captured reference was widened with everything else.
    let bundle_ty = p.sym(p.fn_data(wrap).formals[0]).ty;
    let field = p.ty(bundle_ty).fields[0];
    assert!(p.is_wide_ref(p.sym(field).ty));

    // The startup initializer exists and registers no locals.
    let init = find_fn(&p, "heapAllocateGlobals").expect("initializer missing");
    assert_eq!(p.globals_on_heap, 0);
    let body = p.fn_data(init).body;
    assert_eq!(count_prim_calls(&p, body, Prim::HereAlloc), 0);

    // Nothing freed the escaping cell.
    assert_eq!(count_prim_calls(&p, main_body, Prim::HereFree), 0);
}
