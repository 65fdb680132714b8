//! Types: primitives, classes, records, refs, heap cells, and wide layouts.
//!
//! Fields are symbols (kind [`crate::symbol::SymbolKind::Field`]) so that
//! member-access primitives can name them the same way they name variables.

use bitflags::bitflags;

use crate::ir::Program;
use crate::symbol::{SymFlags, Symbol, SymbolId, SymbolKind};

/// Unique identifier for a type within a [`Program`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TypeId(pub u32);

/// Built-in scalar types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrimTy {
    Bool,
    Int,
    Uint,
    Real,
    Imag,
    Complex,
    Enum,
    /// The nil literal's type; converted to `Object` before widening.
    Nil,
    /// Root class type; the type of the nil sentinel after conversion.
    Object,
    Str,
    LocaleId,
    Void,
    Unknown,
}

bitflags! {
    /// Flags on type definitions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TypeFlags: u32 {
        /// Synthesized bookkeeping class with no object header.
        const NO_OBJECT = 1 << 0;
        /// Class type that opts out of widening.
        const NO_WIDE_CLASS = 1 << 1;
        /// Value has internal refcount semantics.
        const REFCOUNTED = 1 << 2;
        /// Sync/single type; auto-destroys are conservatively suppressed.
        const SYNC = 1 << 3;
        /// Record-wrapped value (array/domain/distribution handle).
        const RECORD_WRAPPED = 1 << 4;
        /// Runtime array-of-elements class; `elem_type` is the element.
        const DATA_CLASS = 1 << 5;
        /// Class generated for an iterator's state.
        const ITERATOR_CLASS = 1 << 6;
        /// Class with per-node privatized copies addressed by pid.
        const PRIVATIZED_CLASS = 1 << 7;
        /// Defined outside the compiled program.
        const EXTERN = 1 << 8;
    }
}

/// The disjoint type kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TypeKind {
    Primitive(PrimTy),
    /// Reference semantics.
    Class,
    /// Value semantics.
    Record,
    /// Pointer to a single `_val` field.
    Ref,
    /// Single-field `value` cell on the shared heap.
    HeapCell,
    /// `(locale, addr)` layout pointing at a class; wide strings add `size`.
    WideClass,
    /// `(locale, addr)` layout pointing at a ref.
    WideRef,
}

/// A type definition.
#[derive(Debug, Clone)]
pub struct Type {
    pub name: String,
    pub kind: TypeKind,
    pub flags: TypeFlags,
    /// Field symbols, in declaration order. Empty for primitives.
    pub fields: Vec<SymbolId>,
    /// Element type of a data class.
    pub elem_type: Option<TypeId>,
    /// Cached ref-to-this type.
    pub ref_type: Option<TypeId>,
}

impl Type {
    pub fn primitive(name: &str, p: PrimTy) -> Type {
        Type {
            name: name.to_string(),
            kind: TypeKind::Primitive(p),
            flags: TypeFlags::empty(),
            fields: Vec::new(),
            elem_type: None,
            ref_type: None,
        }
    }
}

impl Program {
    pub fn ty(&self, id: TypeId) -> &Type {
        self.type_at(id)
    }

    pub fn ty_mut(&mut self, id: TypeId) -> &mut Type {
        self.type_at_mut(id)
    }

    pub fn type_count(&self) -> usize {
        self.types_len()
    }

    /// All type ids, in creation order.
    pub fn type_ids(&self) -> Vec<TypeId> {
        (0..self.types_len() as u32).map(TypeId).collect()
    }

    pub fn add_type(&mut self, ty: Type) -> TypeId {
        self.push_type(ty)
    }

    /// Creates a field symbol owned by `owner`.
    pub fn add_field(&mut self, owner: TypeId, name: impl Into<String>, ty: TypeId) -> SymbolId {
        let field = self.push_field_symbol(Symbol {
            name: name.into(),
            kind: SymbolKind::Field { owner },
            ty,
            flags: SymFlags::empty(),
            span: None,
            def_node: None,
            parent_module: None,
        });
        self.ty_mut(owner).fields.push(field);
        field
    }

    pub fn field_named(&self, ty: TypeId, name: &str) -> Option<SymbolId> {
        self.ty(ty)
            .fields
            .iter()
            .copied()
            .find(|&f| self.sym(f).name == name)
    }

    /// Type of the named field; panics when absent.
    pub fn field_type(&self, ty: TypeId, name: &str) -> TypeId {
        let f = self
            .field_named(ty, name)
            .unwrap_or_else(|| panic!("type {} has no field {}", self.ty(ty).name, name));
        self.sym(f).ty
    }

    pub fn is_class_like(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty).kind, TypeKind::Class | TypeKind::HeapCell)
    }

    pub fn is_record(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty).kind, TypeKind::Record)
    }

    pub fn is_ref(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty).kind, TypeKind::Ref)
    }

    pub fn is_wide_class(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty).kind, TypeKind::WideClass)
    }

    pub fn is_wide_ref(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty).kind, TypeKind::WideRef)
    }

    pub fn is_wide(&self, ty: TypeId) -> bool {
        self.is_wide_class(ty) || self.is_wide_ref(ty)
    }

    pub fn is_heap_cell(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty).kind, TypeKind::HeapCell)
    }

    pub fn is_primitive_type(&self, ty: TypeId) -> bool {
        matches!(self.ty(ty).kind, TypeKind::Primitive(_))
    }

    pub fn is_string(&self, ty: TypeId) -> bool {
        ty == self.builtins.t_string
    }

    /// Scalar types whose module-level consts are broadcast, not promoted.
    pub fn is_broadcastable_scalar(&self, ty: TypeId) -> bool {
        matches!(
            self.ty(ty).kind,
            TypeKind::Primitive(
                PrimTy::Bool
                    | PrimTy::Int
                    | PrimTy::Uint
                    | PrimTy::Real
                    | PrimTy::Imag
                    | PrimTy::Complex
                    | PrimTy::Enum
            )
        )
    }

    /// Value type: dereferences ref and wide-ref layers.
    pub fn value_type(&self, ty: TypeId) -> TypeId {
        match self.ty(ty).kind {
            TypeKind::Ref => self.field_type(ty, "_val"),
            TypeKind::WideRef => {
                let addr = self.field_type(ty, "addr");
                self.value_type(addr)
            }
            _ => ty,
        }
    }

    /// The `addr` field type of a wide layout.
    pub fn wide_addr_type(&self, ty: TypeId) -> TypeId {
        self.field_type(ty, "addr")
    }

    /// Returns the cached ref-to-`ty`, creating it on first use. The new type
    /// is registered in the top-level program block.
    pub fn ensure_ref_type(&mut self, ty: TypeId) -> TypeId {
        if let Some(r) = self.ty(ty).ref_type {
            return r;
        }
        let name = format!("_ref_{}", self.ty(ty).name);
        let r = self.add_type(Type {
            name,
            kind: TypeKind::Ref,
            flags: TypeFlags::NO_OBJECT,
            fields: Vec::new(),
            elem_type: None,
            ref_type: None,
        });
        self.add_field(r, "_val", ty);
        self.ty_mut(ty).ref_type = Some(r);
        let def = self.type_def_node(r);
        let program_block = self.program_block;
        self.insert_at_tail(program_block, def);
        r
    }

    /// Returns the cached single-field heap cell for `ty`, creating it on
    /// first use. The new type is registered in the top-level program block.
    pub fn build_heap_type(&mut self, ty: TypeId) -> TypeId {
        if let Some(&h) = self.heap_type_map.get(&ty) {
            return h;
        }
        let name = format!("heap_{}", self.ty(ty).name);
        let h = self.add_type(Type {
            name,
            kind: TypeKind::HeapCell,
            flags: TypeFlags::NO_OBJECT,
            fields: Vec::new(),
            elem_type: None,
            ref_type: None,
        });
        self.add_field(h, "value", ty);
        self.heap_type_map.insert(ty, h);
        let def = self.type_def_node(h);
        let program_block = self.program_block;
        self.insert_at_tail(program_block, def);
        h
    }

    /// The interned type symbol naming `ty`, for use as a call actual.
    pub fn type_sym(&mut self, ty: TypeId) -> SymbolId {
        if let Some(&s) = self.type_syms.get(&ty) {
            return s;
        }
        let name = self.ty(ty).name.clone();
        let s = self.push_field_symbol(Symbol {
            name,
            kind: SymbolKind::TypeSym { ty },
            ty,
            flags: SymFlags::empty(),
            span: None,
            def_node: None,
            parent_module: None,
        });
        self.type_syms.insert(ty, s);
        s
    }

    /// A `Def` node for a type's symbol, used to anchor synthesized types in
    /// the tree.
    fn type_def_node(&mut self, ty: TypeId) -> crate::ir::NodeId {
        let s = self.type_sym(ty);
        self.def(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ensure_ref_type_is_cached() {
        let mut p = Program::new();
        let t = p.builtins.t_int;
        let r1 = p.ensure_ref_type(t);
        let r2 = p.ensure_ref_type(t);
        assert_eq!(r1, r2);
        assert!(p.is_ref(r1));
        assert_eq!(p.value_type(r1), t);
    }

    #[test]
    fn build_heap_type_is_cached() {
        let mut p = Program::new();
        let t = p.builtins.t_int;
        let h1 = p.build_heap_type(t);
        let h2 = p.build_heap_type(t);
        assert_eq!(h1, h2);
        assert!(p.is_heap_cell(h1));
        assert_eq!(p.field_type(h1, "value"), t);
    }

    #[test]
    fn value_type_unwraps_wide_refs() {
        let mut p = Program::new();
        let t = p.builtins.t_int;
        let r = p.ensure_ref_type(t);
        let w = p.add_type(Type {
            name: "__wide__ref_int".to_string(),
            kind: TypeKind::WideRef,
            flags: TypeFlags::empty(),
            fields: Vec::new(),
            elem_type: None,
            ref_type: None,
        });
        let locale_id = p.builtins.t_locale_id;
        p.add_field(w, "locale", locale_id);
        p.add_field(w, "addr", r);
        assert_eq!(p.value_type(w), t);
    }
}
