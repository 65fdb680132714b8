//! Symbols: variables, formals, functions, fields, type symbols, and modules.
//!
//! All named entities in the resolved IR are symbols of disjoint kinds, stored
//! in one arena on [`crate::Program`] and addressed by [`SymbolId`].

use bitflags::bitflags;
use miette::SourceSpan;

use crate::ir::NodeId;
use crate::ty::TypeId;

/// Unique identifier for a symbol within a [`crate::Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymbolId(pub u32);

bitflags! {
    /// Flags on function symbols.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FnFlags: u32 {
        /// Body outlined from a `begin` statement.
        const BEGIN = 1 << 0;
        /// Body outlined from an `on` statement.
        const ON = 1 << 1;
        /// Fire-and-forget variant of an `on` body.
        const NON_BLOCKING = 1 << 2;
        /// Body outlined from a `cobegin` or `coforall` statement.
        const COBEGIN_OR_COFORALL = 1 << 3;
        /// ABI boundary; never rewritten.
        const EXTERN = 1 << 4;
        /// Exported entry point; never rewritten.
        const EXPORT = 1 << 5;
        /// Callee requires narrow (local) actuals.
        const LOCAL_ARGS = 1 << 6;
        /// Clone specialized for an explicitly-local region.
        const LOCAL_FN = 1 << 7;
        /// Per-type ownership-release hook.
        const AUTO_DESTROY_FN = 1 << 8;
        /// Release hook for a sync type; conservatively never reordered.
        const AUTO_DESTROY_FN_SYNC = 1 << 9;
        /// Wrapper generated for an `on` task.
        const ON_BLOCK = 1 << 10;
        /// Wrapper generated for a `begin` task.
        const BEGIN_BLOCK = 1 << 11;
        /// Wrapper generated for a `cobegin`/`coforall` task.
        const COBEGIN_OR_COFORALL_BLOCK = 1 << 12;
    }
}

bitflags! {
    /// Flags on variable, formal, and field symbols.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SymFlags: u32 {
        /// Immutable after initialization.
        const CONST = 1 << 0;
        /// Defined outside the compiled program.
        const EXTERN = 1 << 1;
        /// Module-level but visible on a single node only.
        const PRIVATE = 1 << 2;
        /// Index variable of a `coforall` loop.
        const COFORALL_INDEX = 1 << 3;
        /// May be read or written by more than one task.
        const CONCURRENTLY_ACCESSED = 1 << 4;
        /// Field standing in for a superclass; layout, not a pointer.
        const SUPER_CLASS = 1 << 5;
        /// Compiler-internal bookkeeping variable; never relocated.
        const DEBUG_ONLY = 1 << 6;
        /// Compiler-introduced temporary.
        const TEMP = 1 << 7;
    }
}

/// Argument-passing intent of a formal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    ConstRef,
    Ref,
    In,
    Out,
    InOut,
}

/// Compile-time literal payload carried by immediate variables.
#[derive(Debug, Clone, PartialEq)]
pub enum Immediate {
    Int(i64),
    Uint(u64),
    Real(f64),
    Bool(bool),
    Str(String),
}

/// Function-specific symbol data.
#[derive(Debug, Clone)]
pub struct FnData {
    /// Ordered formals.
    pub formals: Vec<SymbolId>,
    /// Body block node.
    pub body: NodeId,
    pub ret_type: TypeId,
    /// True when the function returns by reference.
    pub ret_by_ref: bool,
    pub flags: FnFlags,
}

/// Module-specific symbol data.
#[derive(Debug, Clone)]
pub struct ModuleData {
    /// Module-level statement block.
    pub body: NodeId,
    /// Function holding the module's outlined initialization statements.
    pub init_fn: Option<SymbolId>,
}

/// The disjoint symbol kinds.
#[derive(Debug, Clone)]
pub enum SymbolKind {
    Var {
        /// Literal payload; immediates are never widened or promoted.
        immediate: Option<Immediate>,
    },
    Formal {
        intent: Intent,
    },
    /// A field of a class/record/ref/heap/wide type.
    Field {
        owner: TypeId,
    },
    Fn(FnData),
    /// Names a type, e.g. as an actual to allocation or cast primitives.
    TypeSym {
        ty: TypeId,
    },
    Module(ModuleData),
}

/// A symbol in the program.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub name: String,
    pub kind: SymbolKind,
    /// Declared type. For functions this is the return type mirror; the
    /// authoritative return type lives in [`FnData::ret_type`].
    pub ty: TypeId,
    pub flags: SymFlags,
    pub span: Option<SourceSpan>,
    /// The `Def` node introducing this symbol, once inserted into the tree.
    pub def_node: Option<NodeId>,
    /// Owning module, for functions and module-level symbols.
    pub parent_module: Option<SymbolId>,
}

impl Symbol {
    pub fn is_var(&self) -> bool {
        matches!(self.kind, SymbolKind::Var { .. })
    }

    pub fn is_formal(&self) -> bool {
        matches!(self.kind, SymbolKind::Formal { .. })
    }

    pub fn is_fn(&self) -> bool {
        matches!(self.kind, SymbolKind::Fn(_))
    }

    pub fn is_field(&self) -> bool {
        matches!(self.kind, SymbolKind::Field { .. })
    }

    pub fn immediate(&self) -> Option<&Immediate> {
        match &self.kind {
            SymbolKind::Var { immediate } => immediate.as_ref(),
            _ => None,
        }
    }

    pub fn intent(&self) -> Option<Intent> {
        match self.kind {
            SymbolKind::Formal { intent } => Some(intent),
            _ => None,
        }
    }
}
