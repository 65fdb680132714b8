//! Resolved intermediate representation for the Skein compiler.
//!
//! Upstream passes hand the parallel lowering a fully resolved [`Program`]:
//! every call knows its callee, every symbol its type, every task body is
//! outlined at module scope. This crate owns that representation and the
//! analyses the lowering sub-passes share.

pub mod analysis;
pub mod config;
pub mod ir;
pub mod prim;
pub mod symbol;
pub mod ty;

pub use analysis::{
    actual_to_formal, all_calls, all_defs, all_sym_refs, classify_sym_ref, collect_calls_in,
    collect_sym_refs_in, formal_at, CallSites, DefUseMap,
};
pub use config::{CommLayer, GasnetSegment, LocaleMode, TargetConfig};
pub use ir::{BlockKind, Builtins, CallTarget, Node, NodeId, Program};
pub use prim::Prim;
pub use symbol::{
    FnData, FnFlags, Immediate, Intent, ModuleData, SymFlags, Symbol, SymbolId, SymbolKind,
};
pub use ty::{PrimTy, Type, TypeFlags, TypeId, TypeKind};
