// Shared program-construction helpers for the lowering integration tests.
// Not every test binary uses every helper.
#![allow(dead_code)]

use skein_ir::{
    BlockKind, FnFlags, Intent, NodeId, Prim, Program, SymbolId, Type, TypeFlags, TypeId,
    TypeKind,
};

/// A program with one module and an entry function.
pub struct Fixture {
    pub p: Program,
    pub module: SymbolId,
    pub main: SymbolId,
}

pub fn fixture() -> Fixture {
    let mut p = Program::new();
    let module = p.add_module("test_module");
    let t_void = p.builtins.t_void;
    let main = p.add_fn("main", Some(module), t_void, FnFlags::empty());
    let d = p.def(main);
    let mbody = p.module_data(module).body;
    p.insert_at_tail(mbody, d);
    p.main_fn = Some(main);
    Fixture { p, module, main }
}

/// Appends a statement to a function's body.
pub fn add_stmt(p: &mut Program, f: SymbolId, stmt: NodeId) {
    let body = p.fn_data(f).body;
    p.insert_at_tail(body, stmt);
}

/// Declares a local variable in `f` and returns it.
pub fn local_var(p: &mut Program, f: SymbolId, name: &str, ty: TypeId) -> SymbolId {
    let v = p.add_var(name, ty);
    let d = p.def(v);
    add_stmt(p, f, d);
    v
}

/// `move lhs, <int literal>`.
pub fn move_imm(p: &mut Program, f: SymbolId, lhs: SymbolId, value: i64) {
    let imm = p.int_imm(value);
    let ir = p.sym_ref(imm);
    let mv = p.move_into(lhs, ir);
    add_stmt(p, f, mv);
}

/// Appends `return void`.
pub fn ret_void(p: &mut Program, f: SymbolId) {
    let g_void = p.builtins.g_void;
    let vr = p.sym_ref(g_void);
    let t_void = p.builtins.t_void;
    let ret = p.call_prim(Prim::Return, vec![vr], t_void);
    add_stmt(p, f, ret);
}

/// An extern sink the tests use to create uses of values.
pub fn extern_sink(p: &mut Program, module: SymbolId, name: &str, arg_ty: TypeId) -> SymbolId {
    let t_void = p.builtins.t_void;
    let f = p.add_fn(name, Some(module), t_void, FnFlags::EXTERN);
    p.add_formal(f, "x", arg_ty, Intent::In);
    let d = p.def(f);
    let mbody = p.module_data(module).body;
    p.insert_at_tail(mbody, d);
    f
}

/// A task function: given flags, formals, and a body ending in a down-end-
/// count and a return.
pub fn task_fn(
    p: &mut Program,
    module: SymbolId,
    name: &str,
    flags: FnFlags,
    formals: &[(&str, TypeId, Intent)],
) -> SymbolId {
    let t_void = p.builtins.t_void;
    let f = p.add_fn(name, Some(module), t_void, flags);
    for (fname, fty, intent) in formals {
        p.add_formal(f, *fname, *fty, *intent);
    }
    let d = p.def(f);
    let mbody = p.module_data(module).body;
    p.insert_at_tail(mbody, d);
    f
}

/// Appends the end-count decrement that closes a task body.
pub fn add_down_end_count(p: &mut Program, f: SymbolId) {
    let t_void = p.builtins.t_void;
    let down = p.call_prim(Prim::DownEndCount, vec![], t_void);
    add_stmt(p, f, down);
}

/// A class type with the given int-typed fields.
pub fn class_type(p: &mut Program, name: &str, fields: &[&str]) -> TypeId {
    let t = p.add_type(Type {
        name: name.to_string(),
        kind: TypeKind::Class,
        flags: TypeFlags::empty(),
        fields: Vec::new(),
        elem_type: None,
        ref_type: None,
    });
    let t_int = p.builtins.t_int;
    for f in fields {
        p.add_field(t, *f, t_int);
    }
    t
}

/// A record type with the given flags.
pub fn record_type(p: &mut Program, name: &str, flags: TypeFlags) -> TypeId {
    p.add_type(Type {
        name: name.to_string(),
        kind: TypeKind::Record,
        flags,
        fields: Vec::new(),
        elem_type: None,
        ref_type: None,
    })
}

/// Finds the unique function with the given name.
pub fn find_fn(p: &Program, name: &str) -> Option<SymbolId> {
    p.symbol_ids()
        .into_iter()
        .find(|&s| p.sym(s).is_fn() && p.sym(s).name == name)
}

/// All calls in `f`'s body matching the predicate.
pub fn calls_in_fn(p: &Program, f: SymbolId, pred: impl Fn(&Program, NodeId) -> bool) -> Vec<NodeId> {
    let body = p.fn_data(f).body;
    skein_ir::collect_calls_in(p, body)
        .into_iter()
        .filter(|&c| pred(p, c))
        .collect()
}

/// Count of calls to `prim` anywhere under `root`.
pub fn count_prim_calls(p: &Program, root: NodeId, prim: Prim) -> usize {
    skein_ir::collect_calls_in(p, root)
        .iter()
        .filter(|&&c| p.is_prim(c, prim))
        .count()
}

/// Statements (direct children) of a function body.
pub fn body_stmts(p: &Program, f: SymbolId) -> Vec<NodeId> {
    p.children(p.fn_data(f).body)
}

/// A local block wrapping the given statements, appended to `f`.
pub fn local_block(p: &mut Program, f: SymbolId, stmts: Vec<NodeId>) -> NodeId {
    let b = p.block(BlockKind::Local, stmts);
    add_stmt(p, f, b);
    b
}

/// True when the node is a resolved call to `callee`.
pub fn is_call_to(p: &Program, node: NodeId, callee: SymbolId) -> bool {
    p.resolved_callee(node) == Some(callee)
}

/// Convenience: the unique argument symbol of a one-argument call.
pub fn only_arg_sym(p: &Program, call: NodeId) -> Option<SymbolId> {
    let args = p.call_args(call);
    if args.len() == 1 {
        p.sym_of(args[0])
    } else {
        None
    }
}
