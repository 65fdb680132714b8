//! The resolved IR tree: an arena of nodes with parent links stored as
//! indices, plus the symbol and type arenas and the mutation API the lowering
//! sub-passes are written against.
//!
//! Ownership is flat: every node lives in the arena and is addressed by
//! [`NodeId`]. Parent pointers are `Option<NodeId>`, so relocating a node
//! means updating the old parent's child list, the new parent's child list,
//! and the node's parent index. [`Program::insert_before`],
//! [`Program::replace`], and friends keep all three in sync.

use std::collections::HashMap;

use miette::SourceSpan;

use crate::prim::Prim;
use crate::symbol::{
    FnData, FnFlags, Immediate, Intent, ModuleData, SymFlags, Symbol, SymbolId, SymbolKind,
};
use crate::ty::{PrimTy, Type, TypeId};

/// Unique identifier for a node within a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

/// Statement-block kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Normal,
    /// An explicitly-local region: the programmer asserts no communication.
    Local,
}

/// Callee of a call node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallTarget {
    /// Resolved call to a function symbol.
    Fn(SymbolId),
    Prim(Prim),
}

/// A node in the IR tree.
#[derive(Debug, Clone)]
pub enum Node {
    /// Introduces a symbol at this point in the tree.
    Def { sym: SymbolId },
    /// A reference to a symbol.
    Sym { sym: SymbolId },
    /// A resolved or primitive call. `ty` is the result type.
    Call {
        target: CallTarget,
        args: Vec<NodeId>,
        ty: TypeId,
    },
    Block { kind: BlockKind, body: Vec<NodeId> },
    Cond {
        cond: NodeId,
        then_blk: NodeId,
        else_blk: Option<NodeId>,
    },
}

#[derive(Debug, Clone)]
struct NodeData {
    node: Node,
    parent: Option<NodeId>,
}

/// Well-known types and symbols every program carries.
#[derive(Debug, Clone)]
pub struct Builtins {
    pub t_void: TypeId,
    pub t_bool: TypeId,
    pub t_int: TypeId,
    pub t_real: TypeId,
    pub t_string: TypeId,
    pub t_nil: TypeId,
    pub t_object: TypeId,
    pub t_locale_id: TypeId,
    /// The unique nil sentinel, typed `object` after nil conversion.
    pub g_nil: SymbolId,
    /// The void value returned by wrappers and init functions.
    pub g_void: SymbolId,
    /// The executing node's id.
    pub g_node_id: SymbolId,
}

/// A whole resolved program: arenas, indices, and widening caches.
#[derive(Debug, Clone)]
pub struct Program {
    nodes: Vec<NodeData>,
    symbols: Vec<Symbol>,
    types: Vec<Type>,

    pub modules: Vec<SymbolId>,
    pub main_fn: Option<SymbolId>,
    /// Top-level block holding synthesized type definitions.
    pub program_block: NodeId,

    fn_of_body: HashMap<NodeId, SymbolId>,
    module_of_body: HashMap<NodeId, SymbolId>,

    /// Class type -> its wide form. Bijective once populated.
    pub wide_class_map: HashMap<TypeId, TypeId>,
    /// Ref type -> its wide form. Bijective once populated.
    pub wide_ref_map: HashMap<TypeId, TypeId>,
    pub(crate) heap_type_map: HashMap<TypeId, TypeId>,
    pub(crate) type_syms: HashMap<TypeId, SymbolId>,
    auto_copy: HashMap<TypeId, SymbolId>,
    auto_destroy: HashMap<TypeId, SymbolId>,
    /// The unique wide string type, once built.
    pub wide_string: Option<TypeId>,
    /// Count of globals registered by the heap initializer.
    pub globals_on_heap: usize,

    pub builtins: Builtins,
}

impl Program {
    pub fn new() -> Program {
        let mut nodes = Vec::new();
        nodes.push(NodeData {
            node: Node::Block { kind: BlockKind::Normal, body: Vec::new() },
            parent: None,
        });
        let program_block = NodeId(0);

        let mut types = Vec::new();
        let mut prim_ty = |p: PrimTy, name: &str| {
            let id = TypeId(types.len() as u32);
            types.push(Type::primitive(name, p));
            id
        };
        let t_void = prim_ty(PrimTy::Void, "void");
        let t_bool = prim_ty(PrimTy::Bool, "bool");
        let t_int = prim_ty(PrimTy::Int, "int");
        let t_real = prim_ty(PrimTy::Real, "real");
        let t_string = prim_ty(PrimTy::Str, "string");
        let t_nil = prim_ty(PrimTy::Nil, "nil");
        let t_object = prim_ty(PrimTy::Object, "object");
        let t_locale_id = prim_ty(PrimTy::LocaleId, "locale_id");

        let mut symbols = Vec::new();
        let mut builtin_var = |name: &str, ty: TypeId| {
            let id = SymbolId(symbols.len() as u32);
            symbols.push(Symbol {
                name: name.to_string(),
                kind: SymbolKind::Var { immediate: None },
                ty,
                flags: SymFlags::empty(),
                span: None,
                def_node: None,
                parent_module: None,
            });
            id
        };
        let g_nil = builtin_var("nil", t_nil);
        let g_void = builtin_var("_void", t_void);
        let g_node_id = builtin_var("_node_id", t_int);

        Program {
            nodes,
            symbols,
            types,
            modules: Vec::new(),
            main_fn: None,
            program_block,
            fn_of_body: HashMap::new(),
            module_of_body: HashMap::new(),
            wide_class_map: HashMap::new(),
            wide_ref_map: HashMap::new(),
            heap_type_map: HashMap::new(),
            type_syms: HashMap::new(),
            auto_copy: HashMap::new(),
            auto_destroy: HashMap::new(),
            wide_string: None,
            globals_on_heap: 0,
            builtins: Builtins {
                t_void,
                t_bool,
                t_int,
                t_real,
                t_string,
                t_nil,
                t_object,
                t_locale_id,
                g_nil,
                g_void,
                g_node_id,
            },
        }
    }

    // ----- node arena -----

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0 as usize].node
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.0 as usize].node
    }

    pub fn parent(&self, id: NodeId) -> Option<NodeId> {
        self.nodes[id.0 as usize].parent
    }

    fn set_parent(&mut self, child: NodeId, parent: Option<NodeId>) {
        self.nodes[child.0 as usize].parent = parent;
    }

    /// Adds a node to the arena, wiring up the parent index of its children.
    /// A `Def` node also records itself as its symbol's definition point.
    pub fn add_node(&mut self, node: Node) -> NodeId {
        let id = NodeId(self.nodes.len() as u32);
        let children = Self::node_children(&node);
        if let Node::Def { sym } = &node {
            self.symbols[sym.0 as usize].def_node = Some(id);
        }
        self.nodes.push(NodeData { node, parent: None });
        for child in children {
            self.set_parent(child, Some(id));
        }
        id
    }

    fn node_children(node: &Node) -> Vec<NodeId> {
        match node {
            Node::Def { .. } | Node::Sym { .. } => Vec::new(),
            Node::Call { args, .. } => args.clone(),
            Node::Block { body, .. } => body.clone(),
            Node::Cond { cond, then_blk, else_blk } => {
                let mut v = vec![*cond, *then_blk];
                if let Some(e) = else_blk {
                    v.push(*e);
                }
                v
            }
        }
    }

    pub fn children(&self, id: NodeId) -> Vec<NodeId> {
        Self::node_children(self.node(id))
    }

    /// Preorder traversal of the subtree rooted at `root`.
    pub fn collect_preorder(&self, root: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            let mut kids = self.children(id);
            kids.reverse();
            stack.extend(kids);
        }
        out
    }

    /// Every tree root: the program block, module bodies, and function bodies.
    pub fn roots(&self) -> Vec<NodeId> {
        let mut roots = vec![self.program_block];
        for &m in &self.modules {
            roots.push(self.module_data(m).body);
        }
        for s in &self.symbols {
            if let SymbolKind::Fn(f) = &s.kind {
                roots.push(f.body);
            }
        }
        roots
    }

    /// The enclosing statement of `id`: the ancestor (or `id` itself) whose
    /// parent is a block.
    pub fn stmt_of(&self, id: NodeId) -> NodeId {
        let mut cur = id;
        while let Some(p) = self.parent(cur) {
            if matches!(self.node(p), Node::Block { .. }) {
                return cur;
            }
            cur = p;
        }
        cur
    }

    /// Nearest enclosing block of `id`, excluding `id` itself.
    pub fn enclosing_block(&self, id: NodeId) -> Option<NodeId> {
        let mut cur = self.parent(id);
        while let Some(p) = cur {
            if matches!(self.node(p), Node::Block { .. }) {
                return Some(p);
            }
            cur = self.parent(p);
        }
        None
    }

    /// The function whose body contains `id`, if any.
    pub fn fn_of(&self, id: NodeId) -> Option<SymbolId> {
        let mut cur = id;
        loop {
            match self.parent(cur) {
                Some(p) => cur = p,
                None => return self.fn_of_body.get(&cur).copied(),
            }
        }
    }

    /// The module that lexically contains `id`: directly, or through the
    /// function whose body contains it.
    pub fn module_of(&self, id: NodeId) -> Option<SymbolId> {
        let mut cur = id;
        loop {
            match self.parent(cur) {
                Some(p) => cur = p,
                None => break,
            }
        }
        if let Some(&m) = self.module_of_body.get(&cur) {
            return Some(m);
        }
        self.fn_of_body
            .get(&cur)
            .and_then(|&f| self.sym(f).parent_module)
    }

    // ----- tree mutation -----

    fn block_body_mut(&mut self, block: NodeId) -> &mut Vec<NodeId> {
        match self.node_mut(block) {
            Node::Block { body, .. } => body,
            _ => panic!("expected a block node"),
        }
    }

    fn position_in_block(&self, block: NodeId, child: NodeId) -> usize {
        match self.node(block) {
            Node::Block { body, .. } => body
                .iter()
                .position(|&n| n == child)
                .expect("child not in parent block"),
            _ => panic!("expected a block node"),
        }
    }

    /// Inserts `new` immediately before `anchor` in the enclosing block.
    pub fn insert_before(&mut self, anchor: NodeId, new: NodeId) {
        let stmt = self.stmt_of(anchor);
        let block = self.parent(stmt).expect("statement has no parent block");
        let pos = self.position_in_block(block, stmt);
        self.block_body_mut(block).insert(pos, new);
        self.set_parent(new, Some(block));
    }

    /// Inserts `new` immediately after `anchor` in the enclosing block.
    pub fn insert_after(&mut self, anchor: NodeId, new: NodeId) {
        let stmt = self.stmt_of(anchor);
        let block = self.parent(stmt).expect("statement has no parent block");
        let pos = self.position_in_block(block, stmt);
        self.block_body_mut(block).insert(pos + 1, new);
        self.set_parent(new, Some(block));
    }

    pub fn insert_at_head(&mut self, block: NodeId, new: NodeId) {
        self.block_body_mut(block).insert(0, new);
        self.set_parent(new, Some(block));
    }

    pub fn insert_at_tail(&mut self, block: NodeId, new: NodeId) {
        self.block_body_mut(block).push(new);
        self.set_parent(new, Some(block));
    }

    /// Replaces `old` with `new` in `old`'s parent; `old` is detached.
    pub fn replace(&mut self, old: NodeId, new: NodeId) {
        let parent = self.parent(old).expect("cannot replace a root node");
        match self.node_mut(parent) {
            Node::Block { body, .. } => {
                let pos = body.iter().position(|&n| n == old).expect("child not found");
                body[pos] = new;
            }
            Node::Call { args, .. } => {
                let pos = args.iter().position(|&n| n == old).expect("child not found");
                args[pos] = new;
            }
            Node::Cond { cond, then_blk, else_blk } => {
                if *cond == old {
                    *cond = new;
                } else if *then_blk == old {
                    *then_blk = new;
                } else if *else_blk == Some(old) {
                    *else_blk = Some(new);
                } else {
                    panic!("child not found in cond");
                }
            }
            _ => panic!("parent cannot hold children"),
        }
        self.set_parent(new, Some(parent));
        self.set_parent(old, None);
    }

    /// Detaches `node` from its parent's child list.
    pub fn remove(&mut self, node: NodeId) {
        let parent = self.parent(node).expect("cannot remove a root node");
        match self.node_mut(parent) {
            Node::Block { body, .. } => body.retain(|&n| n != node),
            Node::Call { args, .. } => args.retain(|&n| n != node),
            _ => panic!("cannot remove a child of this node kind"),
        }
        self.set_parent(node, None);
    }

    /// Detaches and returns the `idx`-th argument of a call.
    pub fn call_remove_arg(&mut self, call: NodeId, idx: usize) -> NodeId {
        let arg = match self.node_mut(call) {
            Node::Call { args, .. } => args.remove(idx),
            _ => panic!("expected a call node"),
        };
        self.set_parent(arg, None);
        arg
    }

    pub fn call_insert_arg(&mut self, call: NodeId, idx: usize, arg: NodeId) {
        match self.node_mut(call) {
            Node::Call { args, .. } => args.insert(idx, arg),
            _ => panic!("expected a call node"),
        }
        self.set_parent(arg, Some(call));
    }

    pub fn call_push_arg(&mut self, call: NodeId, arg: NodeId) {
        match self.node_mut(call) {
            Node::Call { args, .. } => args.push(arg),
            _ => panic!("expected a call node"),
        }
        self.set_parent(arg, Some(call));
    }

    pub fn call_args(&self, call: NodeId) -> Vec<NodeId> {
        match self.node(call) {
            Node::Call { args, .. } => args.clone(),
            _ => panic!("expected a call node"),
        }
    }

    pub fn call_target(&self, call: NodeId) -> Option<CallTarget> {
        match self.node(call) {
            Node::Call { target, .. } => Some(*target),
            _ => None,
        }
    }

    pub fn set_call_target(&mut self, call: NodeId, target: CallTarget) {
        match self.node_mut(call) {
            Node::Call { target: t, .. } => *t = target,
            _ => panic!("expected a call node"),
        }
    }

    /// True when `node` is a call to the given primitive.
    pub fn is_prim(&self, node: NodeId, prim: Prim) -> bool {
        matches!(self.node(node), Node::Call { target: CallTarget::Prim(p), .. } if *p == prim)
    }

    /// The resolved callee of `node`, if it is a resolved call.
    pub fn resolved_callee(&self, node: NodeId) -> Option<SymbolId> {
        match self.node(node) {
            Node::Call { target: CallTarget::Fn(f), .. } => Some(*f),
            _ => None,
        }
    }

    /// The symbol referenced by `node`, if it is a symbol reference.
    pub fn sym_of(&self, node: NodeId) -> Option<SymbolId> {
        match self.node(node) {
            Node::Sym { sym } => Some(*sym),
            _ => None,
        }
    }

    /// Static type of an expression node. Resolved calls read the callee's
    /// current return type, so retyping a function retypes its call sites.
    pub fn node_type(&self, node: NodeId) -> TypeId {
        match self.node(node) {
            Node::Sym { sym } => self.sym(*sym).ty,
            Node::Call { target: CallTarget::Fn(f), .. } => self.fn_data(*f).ret_type,
            Node::Call { ty, .. } => *ty,
            _ => self.builtins.t_void,
        }
    }

    // ----- builders -----

    pub fn sym_ref(&mut self, sym: SymbolId) -> NodeId {
        self.add_node(Node::Sym { sym })
    }

    pub fn def(&mut self, sym: SymbolId) -> NodeId {
        self.add_node(Node::Def { sym })
    }

    pub fn block(&mut self, kind: BlockKind, body: Vec<NodeId>) -> NodeId {
        self.add_node(Node::Block { kind, body })
    }

    pub fn call_prim(&mut self, prim: Prim, args: Vec<NodeId>, ty: TypeId) -> NodeId {
        self.add_node(Node::Call { target: CallTarget::Prim(prim), args, ty })
    }

    pub fn call_fn(&mut self, f: SymbolId, args: Vec<NodeId>) -> NodeId {
        let ret = self.fn_data(f).ret_type;
        self.add_node(Node::Call { target: CallTarget::Fn(f), args, ty: ret })
    }

    /// `move lhs, rhs` with a fresh reference to `lhs`.
    pub fn move_into(&mut self, lhs: SymbolId, rhs: NodeId) -> NodeId {
        let lhs_ref = self.sym_ref(lhs);
        let t_void = self.builtins.t_void;
        self.call_prim(Prim::Move, vec![lhs_ref, rhs], t_void)
    }

    // ----- symbols -----

    pub fn sym(&self, id: SymbolId) -> &Symbol {
        &self.symbols[id.0 as usize]
    }

    pub fn sym_mut(&mut self, id: SymbolId) -> &mut Symbol {
        &mut self.symbols[id.0 as usize]
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }

    /// All symbol ids, in creation order.
    pub fn symbol_ids(&self) -> Vec<SymbolId> {
        (0..self.symbols.len() as u32).map(SymbolId).collect()
    }

    fn push_symbol(&mut self, sym: Symbol) -> SymbolId {
        let id = SymbolId(self.symbols.len() as u32);
        self.symbols.push(sym);
        id
    }

    pub fn add_var(&mut self, name: impl Into<String>, ty: TypeId) -> SymbolId {
        self.push_symbol(Symbol {
            name: name.into(),
            kind: SymbolKind::Var { immediate: None },
            ty,
            flags: SymFlags::empty(),
            span: None,
            def_node: None,
            parent_module: None,
        })
    }

    pub fn new_temp(&mut self, name: impl Into<String>, ty: TypeId) -> SymbolId {
        let id = self.add_var(name, ty);
        self.sym_mut(id).flags |= SymFlags::TEMP;
        id
    }

    pub fn int_imm(&mut self, value: i64) -> SymbolId {
        let t_int = self.builtins.t_int;
        let id = self.add_var(format!("{}", value), t_int);
        match &mut self.sym_mut(id).kind {
            SymbolKind::Var { immediate } => *immediate = Some(Immediate::Int(value)),
            _ => unreachable!(),
        }
        id
    }

    pub fn str_imm(&mut self, value: impl Into<String>) -> SymbolId {
        let value = value.into();
        let t_string = self.builtins.t_string;
        let id = self.add_var(format!("\"{}\"", value), t_string);
        match &mut self.sym_mut(id).kind {
            SymbolKind::Var { immediate } => *immediate = Some(Immediate::Str(value)),
            _ => unreachable!(),
        }
        id
    }

    pub fn add_formal(&mut self, f: SymbolId, name: impl Into<String>, ty: TypeId, intent: Intent) -> SymbolId {
        let id = self.push_symbol(Symbol {
            name: name.into(),
            kind: SymbolKind::Formal { intent },
            ty,
            flags: SymFlags::empty(),
            span: None,
            def_node: None,
            parent_module: None,
        });
        self.fn_data_mut(f).formals.push(id);
        id
    }

    pub fn add_module(&mut self, name: impl Into<String>) -> SymbolId {
        let body = self.block(BlockKind::Normal, Vec::new());
        let t_void = self.builtins.t_void;
        let id = self.push_symbol(Symbol {
            name: name.into(),
            kind: SymbolKind::Module(ModuleData { body, init_fn: None }),
            ty: t_void,
            flags: SymFlags::empty(),
            span: None,
            def_node: None,
            parent_module: None,
        });
        self.module_of_body.insert(body, id);
        self.modules.push(id);
        id
    }

    /// Creates a function with an empty body block. The caller is responsible
    /// for inserting a `Def` node where the function should live.
    pub fn add_fn(
        &mut self,
        name: impl Into<String>,
        module: Option<SymbolId>,
        ret_type: TypeId,
        flags: FnFlags,
    ) -> SymbolId {
        let body = self.block(BlockKind::Normal, Vec::new());
        let id = self.push_symbol(Symbol {
            name: name.into(),
            kind: SymbolKind::Fn(FnData {
                formals: Vec::new(),
                body,
                ret_type,
                ret_by_ref: false,
                flags,
            }),
            ty: ret_type,
            flags: SymFlags::empty(),
            span: None,
            def_node: None,
            parent_module: module,
        });
        self.fn_of_body.insert(body, id);
        id
    }

    pub fn fn_data(&self, id: SymbolId) -> &FnData {
        match &self.sym(id).kind {
            SymbolKind::Fn(d) => d,
            _ => panic!("symbol {:?} is not a function", id),
        }
    }

    pub fn fn_data_mut(&mut self, id: SymbolId) -> &mut FnData {
        match &mut self.sym_mut(id).kind {
            SymbolKind::Fn(d) => d,
            _ => panic!("symbol {:?} is not a function", id),
        }
    }

    pub fn fn_flags(&self, id: SymbolId) -> FnFlags {
        self.fn_data(id).flags
    }

    pub fn module_data(&self, id: SymbolId) -> &ModuleData {
        match &self.sym(id).kind {
            SymbolKind::Module(d) => d,
            _ => panic!("symbol {:?} is not a module", id),
        }
    }

    pub fn set_module_init_fn(&mut self, module: SymbolId, init_fn: SymbolId) {
        match &mut self.sym_mut(module).kind {
            SymbolKind::Module(d) => d.init_fn = Some(init_fn),
            _ => panic!("symbol {:?} is not a module", module),
        }
    }

    /// Is this a task function: outlined from begin/cobegin/coforall/on?
    pub fn is_task_fn(&self, id: SymbolId) -> bool {
        let flags = self.fn_flags(id);
        flags.intersects(FnFlags::BEGIN | FnFlags::COBEGIN_OR_COFORALL | FnFlags::ON)
    }

    /// Is this a module-level variable definition (not nested in a function)?
    pub fn is_module_level_var(&self, sym: SymbolId) -> bool {
        if !self.sym(sym).is_var() {
            return false;
        }
        match self.sym(sym).def_node {
            Some(def) => self.fn_of(def).is_none() && self.module_of(def).is_some(),
            None => false,
        }
    }

    pub(crate) fn type_at(&self, id: TypeId) -> &Type {
        &self.types[id.0 as usize]
    }

    pub(crate) fn type_at_mut(&mut self, id: TypeId) -> &mut Type {
        &mut self.types[id.0 as usize]
    }

    pub(crate) fn types_len(&self) -> usize {
        self.types.len()
    }

    pub(crate) fn push_type(&mut self, ty: Type) -> TypeId {
        let id = TypeId(self.types.len() as u32);
        self.types.push(ty);
        id
    }

    pub(crate) fn push_field_symbol(&mut self, sym: Symbol) -> SymbolId {
        self.push_symbol(sym)
    }

    pub fn register_auto_copy(&mut self, ty: TypeId, f: SymbolId) {
        self.auto_copy.insert(ty, f);
    }

    pub fn register_auto_destroy(&mut self, ty: TypeId, f: SymbolId) {
        self.auto_destroy.insert(ty, f);
    }

    pub fn auto_copy_fn(&self, ty: TypeId) -> Option<SymbolId> {
        self.auto_copy.get(&ty).copied()
    }

    pub fn auto_destroy_fn(&self, ty: TypeId) -> Option<SymbolId> {
        self.auto_destroy.get(&ty).copied()
    }

    /// Span of a symbol, for error reporting.
    pub fn span_of(&self, sym: SymbolId) -> Option<SourceSpan> {
        self.sym(sym).span
    }

    // ----- function cloning -----

    /// Deep-copies a function: fresh formals, fresh locals, fresh body tree.
    /// References to symbols defined outside the function are shared.
    pub fn clone_fn(&mut self, f: SymbolId) -> SymbolId {
        let src = self.fn_data(f).clone();
        let name = self.sym(f).name.clone();
        let module = self.sym(f).parent_module;

        let clone = self.add_fn(name, module, src.ret_type, src.flags);
        self.fn_data_mut(clone).ret_by_ref = src.ret_by_ref;

        let mut sym_map: HashMap<SymbolId, SymbolId> = HashMap::new();
        for &formal in &src.formals {
            let s = self.sym(formal).clone();
            let intent = s.intent().expect("formal without intent");
            let new_formal = self.add_formal(clone, s.name.clone(), s.ty, intent);
            self.sym_mut(new_formal).flags = s.flags;
            sym_map.insert(formal, new_formal);
        }
        // Locals defined inside the body get fresh symbols.
        for node in self.collect_preorder(src.body) {
            if let Node::Def { sym } = *self.node(node) {
                let s = self.sym(sym).clone();
                let fresh = self.push_symbol(Symbol { def_node: None, ..s });
                sym_map.insert(sym, fresh);
            }
        }

        let new_body = self.clone_subtree(src.body, &sym_map);
        // `add_fn` made a placeholder body; swap in the cloned tree.
        let placeholder = self.fn_data(clone).body;
        self.fn_of_body.remove(&placeholder);
        self.fn_of_body.insert(new_body, clone);
        self.fn_data_mut(clone).body = new_body;
        clone
    }

    fn clone_subtree(&mut self, root: NodeId, sym_map: &HashMap<SymbolId, SymbolId>) -> NodeId {
        let node = self.node(root).clone();
        match node {
            Node::Def { sym } => {
                let sym = sym_map.get(&sym).copied().unwrap_or(sym);
                self.def(sym)
            }
            Node::Sym { sym } => {
                let sym = sym_map.get(&sym).copied().unwrap_or(sym);
                self.sym_ref(sym)
            }
            Node::Call { target, args, ty } => {
                let args = args.iter().map(|&a| self.clone_subtree(a, sym_map)).collect();
                self.add_node(Node::Call { target, args, ty })
            }
            Node::Block { kind, body } => {
                let body = body.iter().map(|&b| self.clone_subtree(b, sym_map)).collect();
                self.add_node(Node::Block { kind, body })
            }
            Node::Cond { cond, then_blk, else_blk } => {
                let cond = self.clone_subtree(cond, sym_map);
                let then_blk = self.clone_subtree(then_blk, sym_map);
                let else_blk = else_blk.map(|e| self.clone_subtree(e, sym_map));
                self.add_node(Node::Cond { cond, then_blk, else_blk })
            }
        }
    }

    // ----- function-body anchors -----

    /// Inserts `node` before the trailing return of `f`, or at the body tail
    /// when the function has no explicit return.
    pub fn insert_before_return(&mut self, f: SymbolId, node: NodeId) {
        let body = self.fn_data(f).body;
        let last_return = match self.node(body) {
            Node::Block { body: stmts, .. } => stmts
                .iter()
                .rev()
                .copied()
                .find(|&s| self.is_prim(s, Prim::Return)),
            _ => None,
        };
        match last_return {
            Some(ret) => self.insert_before(ret, node),
            None => self.insert_at_tail(body, node),
        }
    }

    /// Inserts `node` before the end-count decrement of a task body, falling
    /// back to before the return.
    pub fn insert_before_down_end_count(&mut self, f: SymbolId, node: NodeId) {
        let body = self.fn_data(f).body;
        let down = self
            .collect_preorder(body)
            .into_iter()
            .find(|&n| self.is_prim(n, Prim::DownEndCount));
        match down {
            Some(d) => {
                let stmt = self.stmt_of(d);
                self.insert_before(stmt, node);
            }
            None => self.insert_before_return(f, node),
        }
    }
}

impl Default for Program {
    fn default() -> Self {
        Program::new()
    }
}
