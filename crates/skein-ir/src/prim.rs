//! Primitive operations.
//!
//! Moves, returns, member accesses, and the runtime ABI are all primitive
//! calls, so the lowering sub-passes rewrite one node shape everywhere.

/// The primitive vocabulary of the resolved IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Prim {
    Move,
    Assign,
    Deref,
    AddrOf,
    Return,

    GetMember,
    GetMemberValue,
    GetSvecMember,
    GetSvecMemberValue,
    SetMember,
    SetSvecMember,

    ArrayGet,
    ArrayGetValue,
    ArraySet,
    ArraySetFirst,

    Cast,
    DynamicCast,
    GetUnionId,
    SetUnionId,
    TestCid,
    GetCid,
    SetCid,
    VmtCall,

    WideGetLocale,
    WideGetNode,
    WideGetAddr,

    GetEndCount,
    SetEndCount,
    /// End-count decrement at the tail of a task body.
    DownEndCount,

    GetPrivClass,
    Equal,

    /// Runtime assertion that the operand's locator is the current node.
    LocalCheck,
    /// Replicate a value to every node at init time.
    PrivateBroadcast,
    /// Register a promoted global for later address broadcast.
    HeapRegisterGlobalVar,
    /// Publish registered global addresses.
    HeapBroadcastGlobalVars,
    /// Task-local heap allocation; takes a type symbol and a descriptor.
    HereAlloc,
    /// Task-local heap deallocation.
    HereFree,

    /// Backend-opaque primitive; operands must be locally addressable.
    Unknown,
}

impl Prim {
    /// Member-access primitives that read through their first operand.
    pub fn is_member_get(self) -> bool {
        matches!(
            self,
            Prim::GetMember
                | Prim::GetMemberValue
                | Prim::GetSvecMember
                | Prim::GetSvecMemberValue
        )
    }

    /// Primitives whose first operand must be a (possibly wide) base pointer.
    pub fn is_member_access(self) -> bool {
        self.is_member_get()
            || matches!(
                self,
                Prim::SetMember
                    | Prim::SetSvecMember
                    | Prim::WideGetLocale
                    | Prim::WideGetNode
                    | Prim::WideGetAddr
            )
    }
}
