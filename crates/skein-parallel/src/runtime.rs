//! Helpers for emitting runtime ABI calls.

use skein_ir::{NodeId, Prim, Program, SymbolId, TypeId};

/// Builds `move var, here_alloc(type, "<desc>")` without inserting it.
pub(crate) fn here_alloc_move(p: &mut Program, var: SymbolId, ty: TypeId, desc: &str) -> NodeId {
    let ts = p.type_sym(ty);
    let ts_ref = p.sym_ref(ts);
    let desc_sym = p.str_imm(desc);
    let desc_ref = p.sym_ref(desc_sym);
    let alloc = p.call_prim(Prim::HereAlloc, vec![ts_ref, desc_ref], ty);
    p.move_into(var, alloc)
}

/// Inserts a heap allocation for `var` before or after `anchor`.
pub(crate) fn insert_here_alloc(
    p: &mut Program,
    anchor: NodeId,
    insert_after: bool,
    var: SymbolId,
    ty: TypeId,
    desc: &str,
) {
    let mv = here_alloc_move(p, var, ty, desc);
    if insert_after {
        p.insert_after(anchor, mv);
    } else {
        p.insert_before(anchor, mv);
    }
}

/// Builds `here_free(<operand>)` without inserting it.
pub(crate) fn here_free_call(p: &mut Program, operand: NodeId) -> NodeId {
    let t_void = p.builtins.t_void;
    p.call_prim(Prim::HereFree, vec![operand], t_void)
}
