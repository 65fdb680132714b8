//! Whole-program analyses: def/use maps and the call-site index.
//!
//! Both are snapshots. A sub-pass that rewrites defs or call sites rebuilds
//! the index it needs rather than trusting a stale one.

use std::collections::HashMap;

use crate::ir::{CallTarget, Node, NodeId, Program};
use crate::prim::Prim;
use crate::symbol::{Intent, SymbolId};

/// How a symbol reference participates in dataflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefUse {
    pub is_def: bool,
    pub is_use: bool,
}

/// Classifies one symbol-reference node as a def, a use, or both.
///
/// A reference is a def when it is the destination of a move/assign, or when
/// it is passed to an `out`/`inout`/`ref` formal. `inout` and `ref` also
/// count as uses.
pub fn classify_sym_ref(p: &Program, node: NodeId) -> DefUse {
    let parent = match p.parent(node) {
        Some(parent) => parent,
        None => return DefUse { is_def: false, is_use: true },
    };
    if let Node::Call { target, args, .. } = p.node(parent) {
        match target {
            CallTarget::Prim(Prim::Move) | CallTarget::Prim(Prim::Assign) => {
                if args.first() == Some(&node) {
                    return DefUse { is_def: true, is_use: false };
                }
            }
            CallTarget::Fn(f) => {
                if let Some(idx) = args.iter().position(|&a| a == node) {
                    let formals = &p.fn_data(*f).formals;
                    if let Some(&formal) = formals.get(idx) {
                        match p.sym(formal).intent() {
                            Some(Intent::Out) => {
                                return DefUse { is_def: true, is_use: false }
                            }
                            Some(Intent::InOut) | Some(Intent::Ref) => {
                                return DefUse { is_def: true, is_use: true }
                            }
                            _ => {}
                        }
                    }
                }
            }
            _ => {}
        }
    }
    DefUse { is_def: false, is_use: true }
}

/// Def/use map over every symbol reference in the program.
#[derive(Debug, Default)]
pub struct DefUseMap {
    defs: HashMap<SymbolId, Vec<NodeId>>,
    uses: HashMap<SymbolId, Vec<NodeId>>,
}

impl DefUseMap {
    pub fn build(p: &Program) -> DefUseMap {
        let mut map = DefUseMap::default();
        for root in p.roots() {
            for node in p.collect_preorder(root) {
                if let Some(sym) = p.sym_of(node) {
                    let du = classify_sym_ref(p, node);
                    if du.is_def {
                        map.defs.entry(sym).or_default().push(node);
                    }
                    if du.is_use {
                        map.uses.entry(sym).or_default().push(node);
                    }
                }
            }
        }
        map
    }

    pub fn defs(&self, sym: SymbolId) -> &[NodeId] {
        self.defs.get(&sym).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn uses(&self, sym: SymbolId) -> &[NodeId] {
        self.uses.get(&sym).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn add_def(&mut self, sym: SymbolId, node: NodeId) {
        self.defs.entry(sym).or_default().push(node);
    }

    pub fn add_use(&mut self, sym: SymbolId, node: NodeId) {
        self.uses.entry(sym).or_default().push(node);
    }

    /// Moves every recorded def and use of `from` onto `to`, for promotions
    /// that retarget a formal to an entry-block temporary.
    pub fn retarget(&mut self, from: SymbolId, to: SymbolId) {
        let defs = self.defs.remove(&from).unwrap_or_default();
        self.defs.entry(to).or_default().extend(defs);
        let uses = self.uses.remove(&from).unwrap_or_default();
        self.uses.entry(to).or_default().extend(uses);
    }
}

/// Call-site index: function symbol -> resolved calls targeting it, in
/// deterministic traversal order.
#[derive(Debug, Default)]
pub struct CallSites {
    sites: HashMap<SymbolId, Vec<NodeId>>,
}

impl CallSites {
    pub fn build(p: &Program) -> CallSites {
        let mut sites: HashMap<SymbolId, Vec<NodeId>> = HashMap::new();
        for root in p.roots() {
            for node in p.collect_preorder(root) {
                if let Some(f) = p.resolved_callee(node) {
                    sites.entry(f).or_default().push(node);
                }
            }
        }
        CallSites { sites }
    }

    pub fn of(&self, f: SymbolId) -> &[NodeId] {
        self.sites.get(&f).map(Vec::as_slice).unwrap_or(&[])
    }
}

/// The formal matching the `idx`-th actual of a resolved call.
pub fn formal_at(p: &Program, call: NodeId, idx: usize) -> Option<SymbolId> {
    let f = p.resolved_callee(call)?;
    p.fn_data(f).formals.get(idx).copied()
}

/// The formal a given actual node is bound to.
pub fn actual_to_formal(p: &Program, actual: NodeId) -> Option<SymbolId> {
    let call = p.parent(actual)?;
    let idx = p.call_args(call).iter().position(|&a| a == actual)?;
    formal_at(p, call, idx)
}

/// All call nodes in the subtree rooted at `root`, preorder.
pub fn collect_calls_in(p: &Program, root: NodeId) -> Vec<NodeId> {
    p.collect_preorder(root)
        .into_iter()
        .filter(|&n| matches!(p.node(n), Node::Call { .. }))
        .collect()
}

/// All symbol-reference nodes in the subtree rooted at `root`, preorder.
pub fn collect_sym_refs_in(p: &Program, root: NodeId) -> Vec<NodeId> {
    p.collect_preorder(root)
        .into_iter()
        .filter(|&n| matches!(p.node(n), Node::Sym { .. }))
        .collect()
}

/// All call nodes in the whole program, preorder per root.
pub fn all_calls(p: &Program) -> Vec<NodeId> {
    let mut out = Vec::new();
    for root in p.roots() {
        out.extend(collect_calls_in(p, root));
    }
    out
}

/// All symbol-reference nodes in the whole program, preorder per root.
pub fn all_sym_refs(p: &Program) -> Vec<NodeId> {
    let mut out = Vec::new();
    for root in p.roots() {
        out.extend(collect_sym_refs_in(p, root));
    }
    out
}

/// All `Def` nodes in the whole program, preorder per root.
pub fn all_defs(p: &Program) -> Vec<NodeId> {
    let mut out = Vec::new();
    for root in p.roots() {
        out.extend(
            p.collect_preorder(root)
                .into_iter()
                .filter(|&n| matches!(p.node(n), Node::Def { .. })),
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::symbol::FnFlags;

    #[test]
    fn move_lhs_is_def_rhs_is_use() {
        let mut p = Program::new();
        let t = p.builtins.t_int;
        let f = p.add_fn("f", None, p.builtins.t_void, FnFlags::empty());
        let x = p.add_var("x", t);
        let y = p.add_var("y", t);
        let xd = p.def(x);
        let yd = p.def(y);
        let xr = p.sym_ref(x);
        let yr = p.sym_ref(y);
        let mv = p.call_prim(Prim::Move, vec![xr, yr], p.builtins.t_void);
        let body = p.fn_data(f).body;
        for n in [xd, yd, mv] {
            p.insert_at_tail(body, n);
        }

        let du = DefUseMap::build(&p);
        assert_eq!(du.defs(x), &[xr]);
        assert_eq!(du.uses(x), &[] as &[NodeId]);
        assert_eq!(du.uses(y), &[yr]);
    }

    #[test]
    fn ref_intent_actual_is_def_and_use() {
        let mut p = Program::new();
        let t = p.builtins.t_int;
        let callee = p.add_fn("g", None, p.builtins.t_void, FnFlags::empty());
        let rt = p.ensure_ref_type(t);
        p.add_formal(callee, "a", rt, Intent::Ref);

        let f = p.add_fn("f", None, p.builtins.t_void, FnFlags::empty());
        let x = p.add_var("x", rt);
        let xd = p.def(x);
        let xr = p.sym_ref(x);
        let call = p.call_fn(callee, vec![xr]);
        let body = p.fn_data(f).body;
        p.insert_at_tail(body, xd);
        p.insert_at_tail(body, call);

        let du = DefUseMap::build(&p);
        assert_eq!(du.defs(x), &[xr]);
        assert_eq!(du.uses(x), &[xr]);
    }

    #[test]
    fn call_sites_index_in_order() {
        let mut p = Program::new();
        let callee = p.add_fn("g", None, p.builtins.t_void, FnFlags::empty());
        let f = p.add_fn("f", None, p.builtins.t_void, FnFlags::empty());
        let c1 = p.call_fn(callee, vec![]);
        let c2 = p.call_fn(callee, vec![]);
        let body = p.fn_data(f).body;
        p.insert_at_tail(body, c1);
        p.insert_at_tail(body, c2);

        let cs = CallSites::build(&p);
        assert_eq!(cs.of(callee), &[c1, c2]);
    }
}
