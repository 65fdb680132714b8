//! End-count threading.
//!
//! Structured-concurrency waits read and write a completion counter through
//! `get_end_count`/`set_end_count` primitives. This pass gives every function
//! that touches the counter a concrete symbol for it (a local temp in the
//! program entry, a threaded formal everywhere else) and then walks the call
//! graph backwards so every transitive caller passes the counter down.

use std::collections::HashMap;

use skein_ir::{all_calls, CallSites, Intent, Prim, Program, SymbolId, TypeId};

use crate::LowerError;

/// Threads the end count through every function that needs one.
pub fn insert_end_counts(p: &mut Program) -> Result<(), LowerError> {
    let mut queue: Vec<SymbolId> = Vec::new();
    let mut end_counts: HashMap<SymbolId, SymbolId> = HashMap::new();

    for call in all_calls(p) {
        if p.is_prim(call, Prim::GetEndCount) {
            let pfn = p.fn_of(call).ok_or(LowerError::EndCountOutsideFn)?;
            if !end_counts.contains_key(&pfn) {
                let ty = p.node_type(call);
                insert_end_count(p, pfn, ty, &mut queue, &mut end_counts);
            }
            let r = p.sym_ref(end_counts[&pfn]);
            p.replace(call, r);
        } else if p.is_prim(call, Prim::SetEndCount) {
            let pfn = p.fn_of(call).ok_or(LowerError::EndCountOutsideFn)?;
            if !end_counts.contains_key(&pfn) {
                let ty = p.node_type(p.call_args(call)[0]);
                insert_end_count(p, pfn, ty, &mut queue, &mut end_counts);
            }
            let rhs = p.call_remove_arg(call, 0);
            let mv = p.move_into(end_counts[&pfn], rhs);
            p.replace(call, mv);
        }
    }

    // Backward propagation: every caller of a counted function carries the
    // counter too and appends it to the call.
    let sites = CallSites::build(p);
    let mut i = 0;
    while i < queue.len() {
        let f = queue[i];
        i += 1;
        let ect = p.sym(end_counts[&f]).ty;
        for &call in sites.of(f) {
            let pfn = p.fn_of(call).ok_or(LowerError::EndCountOutsideFn)?;
            if !end_counts.contains_key(&pfn) {
                insert_end_count(p, pfn, ect, &mut queue, &mut end_counts);
            }
            let r = p.sym_ref(end_counts[&pfn]);
            p.call_push_arg(call, r);
        }
    }
    Ok(())
}

/// Gives `f` an end-count symbol: a fresh temp at the head of the program
/// entry, or a const-ref formal copied into a temp elsewhere.
fn insert_end_count(
    p: &mut Program,
    f: SymbolId,
    end_count_ty: TypeId,
    queue: &mut Vec<SymbolId>,
    end_counts: &mut HashMap<SymbolId, SymbolId>,
) {
    let body = p.fn_data(f).body;
    if Some(f) == p.main_fn {
        let var = p.new_temp("_endCount", end_count_ty);
        let d = p.def(var);
        p.insert_at_head(body, d);
        end_counts.insert(f, var);
    } else {
        let arg = p.add_formal(f, "_endCount", end_count_ty, Intent::ConstRef);
        let var = p.new_temp("_endCount", end_count_ty);
        let ar = p.sym_ref(arg);
        let mv = p.move_into(var, ar);
        p.insert_at_head(body, mv);
        let d = p.def(var);
        p.insert_at_head(body, d);
        end_counts.insert(f, var);
    }
    queue.push(f);
}
