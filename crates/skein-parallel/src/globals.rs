//! Startup allocation of promoted globals.
//!
//! Emits `heapAllocateGlobals`: on node 0 it heap-allocates every promoted
//! module-level variable, then every node registers the cells and broadcasts
//! their addresses.

use skein_ir::{
    all_defs, BlockKind, FnFlags, Node, Prim, Program, SymbolId, TargetConfig,
};

use crate::runtime::here_alloc_move;

/// Module-level variables whose type became a heap cell, in traversal order.
pub fn get_heap_vars(p: &Program) -> Vec<SymbolId> {
    let mut vars = Vec::new();
    for def_node in all_defs(p) {
        let sym = match *p.node(def_node) {
            Node::Def { sym } => sym,
            _ => continue,
        };
        if p.is_module_level_var(sym) && p.is_heap_cell(p.sym(sym).ty) {
            vars.push(sym);
        }
    }
    vars
}

/// Emits the `heapAllocateGlobals` stub. Without wide references it is just
/// `return void`; otherwise [`heap_allocate_globals_tail`] completes it.
pub fn heap_allocate_globals_head(p: &mut Program, cfg: &TargetConfig) -> SymbolId {
    let t_void = p.builtins.t_void;
    let f = p.add_fn(
        "heapAllocateGlobals",
        None,
        t_void,
        FnFlags::EXPORT | FnFlags::LOCAL_ARGS,
    );
    let def = p.def(f);
    let block = p.program_block;
    p.insert_at_tail(block, def);

    if !cfg.require_wide_references() {
        let body = p.fn_data(f).body;
        let g_void = p.builtins.g_void;
        let vr = p.sym_ref(g_void);
        let ret = p.call_prim(Prim::Return, vec![vr], t_void);
        p.insert_at_tail(body, ret);
    }
    f
}

/// Fills in the allocation, registration, and broadcast sequence.
pub fn heap_allocate_globals_tail(p: &mut Program, f: SymbolId, heap_vars: &[SymbolId]) {
    let body = p.fn_data(f).body;
    let t_void = p.builtins.t_void;
    let t_bool = p.builtins.t_bool;
    let g_node_id = p.builtins.g_node_id;
    let node_ty = p.sym(g_node_id).ty;

    let tmp = p.new_temp("_node", node_ty);
    let tmp_bool = p.new_temp("_is_node0", t_bool);
    let d1 = p.def(tmp);
    p.insert_at_tail(body, d1);
    let d2 = p.def(tmp_bool);
    p.insert_at_tail(body, d2);
    let nref = p.sym_ref(g_node_id);
    let mv = p.move_into(tmp, nref);
    p.insert_at_tail(body, mv);
    let zero = p.int_imm(0);
    let zr = p.sym_ref(zero);
    let tr = p.sym_ref(tmp);
    let eq = p.call_prim(Prim::Equal, vec![tr, zr], t_bool);
    let mvb = p.move_into(tmp_bool, eq);
    p.insert_at_tail(body, mvb);

    // Allocation happens on node 0 only; by this point the globals are wide,
    // so the allocated type is the `addr` side of the wide layout.
    let alloc_block = p.block(BlockKind::Normal, Vec::new());
    for &sym in heap_vars {
        let sym_ty = p.sym(sym).ty;
        let alloc_ty = if p.is_wide(sym_ty) {
            p.wide_addr_type(sym_ty)
        } else {
            sym_ty
        };
        let mv = here_alloc_move(p, sym, alloc_ty, "global heap-converted data");
        p.insert_at_tail(alloc_block, mv);
    }
    let cref = p.sym_ref(tmp_bool);
    let cond = p.add_node(Node::Cond { cond: cref, then_blk: alloc_block, else_blk: None });
    p.insert_at_tail(body, cond);

    let mut count = 0i64;
    for &sym in heap_vars {
        let idx = p.int_imm(count);
        let ir = p.sym_ref(idx);
        let sr = p.sym_ref(sym);
        let reg = p.call_prim(Prim::HeapRegisterGlobalVar, vec![ir, sr], t_void);
        p.insert_at_tail(body, reg);
        count += 1;
    }
    let n = p.int_imm(count);
    let nr = p.sym_ref(n);
    let bc = p.call_prim(Prim::HeapBroadcastGlobalVars, vec![nr], t_void);
    p.insert_at_tail(body, bc);
    let g_void = p.builtins.g_void;
    let vr = p.sym_ref(g_void);
    let ret = p.call_prim(Prim::Return, vec![vr], t_void);
    p.insert_at_tail(body, ret);

    p.globals_on_heap = count as usize;
}
