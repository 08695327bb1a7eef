/// Bytecode opcodes.
///
/// Every instruction starts with one opcode byte. Multi-byte operands are
/// little-endian. Operand kinds:
///
/// - `ty:num` is a [`NumTy`](crate::NumTy) byte, `ty:mem` a
///   [`MemTy`](crate::MemTy) byte, `to:conv` a [`ConvTy`](crate::ConvTy)
///   byte and `cond` a [`Cond`](crate::Cond) byte.
/// - `item:u16` indexes the method's data-item pool.
/// - `disp` is a signed displacement measured from the first byte of the
///   branching instruction. Short forms carry `i16`, wide forms `i32`.
///
/// Several opcodes decode to the same [`Instruction`](crate::Instruction)
/// variant (checked/unchecked pairs, short/wide branches) so the interpreter
/// handles them with one arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Op {
    // ── misc ───────────────────────────────────────────────────────
    Nop = 0x00,

    /// User breakpoint (`break` in source). Fires the user-break hook.
    Break,

    /// Debugger breakpoint. Always fires the breakpoint hook.
    Breakpoint,

    /// Sequence point. Fires the step hook only while single-stepping.
    SeqPoint,

    /// Interruption checkpoint.
    Safepoint,

    /// Zero a slice of the locals area.
    /// Operands: `start:u16`, `size:u16`
    InitLocals,

    LdNull,
    Dup,

    /// Duplicate a value-type cell together with its vt-stack storage.
    /// Operands: `size:u16`
    DupVt,

    Pop,

    /// Pop a value-type cell and release its vt-stack storage.
    /// Operands: `size:u16`
    PopVt,

    // ── constants ──────────────────────────────────────────────────
    /// Operands: `value:i8`
    LdcI4S,
    /// Operands: `value:i32`
    LdcI4,
    /// Operands: `value:i64`
    LdcI8,
    /// Operands: `bits:u32`
    LdcR4,
    /// Operands: `bits:u64`
    LdcR8,
    /// Push an interned string object.
    /// Operands: `item:u16`
    LdStr,
    /// Push a raw pointer data item.
    /// Operands: `item:u16`
    LdPtr,
    /// Push a runtime handle for a type, method or field token.
    /// Operands: `item:u16`
    LdToken,

    // ── arguments & locals ─────────────────────────────────────────
    /// Operands: `n:u16`
    LdArg,
    /// Operands: `n:u16`, `size:u16`
    LdArgVt,
    /// Operands: `n:u16`
    StArg,
    /// Operands: `n:u16`, `size:u16`
    StArgVt,
    /// Address of an argument cell.
    /// Operands: `n:u16`
    LdArgA,
    /// Address of a value-type argument's storage.
    /// Operands: `n:u16`
    LdArgAVt,
    /// Operands: `ty:mem`, `offset:u16`
    LdLoc,
    /// Operands: `offset:u16`, `size:u16`
    LdLocVt,
    /// Operands: `ty:mem`, `offset:u16`
    StLoc,
    /// Operands: `offset:u16`, `size:u16`
    StLocVt,
    /// Operands: `offset:u16`
    LdLocA,

    // ── indirect access ────────────────────────────────────────────
    /// Operands: `ty:mem`
    LdInd,
    /// Like [`LdInd`](Op::LdInd) but raises null-reference on a null address.
    /// Operands: `ty:mem`
    LdIndChecked,
    /// Operands: `ty:mem`
    StInd,
    /// Copy a value type from an address onto the vt stack.
    /// Operands: `size:u16`
    LdObj,
    /// Operands: `size:u16`
    StObj,
    /// Operands: `size:u16`
    CpObj,
    /// Operands: `size:u16`
    InitObj,

    // ── arithmetic (operand: ty:num) ───────────────────────────────
    Add,
    Sub,
    Mul,
    Div,
    DivUn,
    Rem,
    RemUn,
    And,
    Or,
    Xor,
    Shl,
    Shr,
    ShrUn,
    AddOvf,
    AddOvfUn,
    SubOvf,
    SubOvfUn,
    MulOvf,
    MulOvfUn,
    Neg,
    Not,
    /// Raise arithmetic on NaN or infinity.
    CkFinite,

    // ── compare & convert ──────────────────────────────────────────
    /// Operands: `cond`, `ty:num`
    Compare,
    /// Operands: `from:num`, `to:conv`
    Conv,
    /// Operands: `from:num`, `to:conv`
    ConvOvf,
    /// Source is treated as unsigned.
    /// Operands: `from:num`, `to:conv`
    ConvOvfUn,

    // ── branches ───────────────────────────────────────────────────
    /// Operands: `disp:i32`
    Br,
    /// Operands: `disp:i16`
    BrS,
    /// Operands: `ty:num`, `disp:i32`
    BrTrue,
    /// Operands: `ty:num`, `disp:i16`
    BrTrueS,
    /// Operands: `ty:num`, `disp:i32`
    BrFalse,
    /// Operands: `ty:num`, `disp:i16`
    BrFalseS,
    /// Operands: `cond`, `ty:num`, `disp:i32`
    BrCmp,
    /// Operands: `cond`, `ty:num`, `disp:i16`
    BrCmpS,
    /// Operands: `count:u32`, then `count` × `disp:i32`
    Switch,

    // ── fields ─────────────────────────────────────────────────────
    /// Operands: `ty:mem`, `offset:u16`
    LdFld,
    /// Operands: `offset:u16`, `size:u16`
    LdFldVt,
    /// Operands: `ty:mem`, `offset:u16`
    StFld,
    /// Operands: `offset:u16`, `size:u16`
    StFldVt,
    /// Operands: `offset:u16`
    LdFldA,
    /// Operands: `ty:mem`, `item:u16`
    LdSFld,
    /// Operands: `item:u16`, `size:u16`
    LdSFldVt,
    /// Operands: `ty:mem`, `item:u16`
    StSFld,
    /// Operands: `item:u16`, `size:u16`
    StSFldVt,
    /// Operands: `item:u16`
    LdSFldA,

    // ── arrays ─────────────────────────────────────────────────────
    /// Operands: `item:u16` (array class)
    NewArr,
    /// Pops `params` lengths, or lower bounds followed by lengths.
    /// Operands: `item:u16`, `params:u8`
    NewArrMulti,
    LdLen,
    /// Operands: `ty:mem`
    LdElem,
    /// Operands: `ty:mem`
    LdElemUnchecked,
    /// Operands: `size:u16`
    LdElemVt,
    /// Operands: `ty:mem`
    StElem,
    /// Operands: `ty:mem`
    StElemUnchecked,
    /// Store a reference with an array-type-mismatch check.
    StElemRef,
    /// Operands: `size:u16`
    StElemVt,
    /// Operands: `size:u16`
    LdElemA,
    /// Element address with an exact element-class check.
    /// Operands: `item:u16`
    LdElemATc,
    /// Operands: `rank:u8`, `ty:mem`
    MdArrayGet,
    /// Operands: `rank:u8`, `ty:mem`
    MdArrayGetUnchecked,
    /// Operands: `rank:u8`, `ty:mem`
    MdArraySet,
    /// Operands: `rank:u8`
    MdArrayAddr,
    /// Operands: `rank:u8`, `item:u16`
    MdArrayAddrTc,

    // ── objects ────────────────────────────────────────────────────
    /// Operands: `item:u16` (constructor)
    NewObj,
    /// Operands: `item:u16` (constructor), `size:u16`
    NewObjVt,
    /// Operands: `item:u16` (class)
    Box,
    /// Operands: `item:u16` (class)
    Unbox,
    /// Operands: `item:u16` (class)
    CastClass,
    /// Operands: `item:u16` (class)
    IsInst,
    /// Operands: `item:u16` (method)
    LdFtn,
    /// Operands: `item:u16` (method)
    LdVirtFtn,
    LocAlloc,
    CpBlk,
    InitBlk,
    /// Operands: `item:u16` (class)
    MkRefAny,
    /// Operands: `item:u16` (class)
    RefAnyVal,
    RefAnyType,
    ArgList,

    // ── calls ──────────────────────────────────────────────────────
    /// Operands: `item:u16` (method)
    Call,
    /// Operands: `item:u16` (method)
    CallVirt,
    /// Pops a method handle after the arguments.
    /// Operands: `item:u16` (signature)
    CallI,
    /// Pops a native function address after the arguments.
    /// Operands: `item:u16` (signature)
    CallINat,
    /// Operands: `item:u16` (method), `sig:u16` (call-site signature)
    CallVararg,
    /// Operands: `item:u16` (method)
    JitCall,
    /// Operands: `item:u16` (method)
    Jmp,
    Ret,
    RetVoid,
    /// Operands: `size:u16`
    RetVt,
    /// Operands: `ret_size:u16`, `args_size:u16`
    VtResult,

    // ── exception control ──────────────────────────────────────────
    Throw,
    /// Operands: `offset:u16` (exception-variable local)
    Rethrow,
    /// Operands: `disp:i32`
    Leave,
    /// Operands: `disp:i16`
    LeaveS,
    /// Operands: `disp:i32`
    LeaveCheck,
    /// Operands: `clause:u16`
    EndFinally,
    EndFilter,
}

impl Op {
    /// Total number of opcodes.
    pub const COUNT: usize = Op::EndFilter as usize + 1;

    /// Convert a raw byte to an opcode without a bounds check.
    ///
    /// # Safety
    ///
    /// `byte` must be a valid opcode value (`< Op::COUNT`).
    #[inline(always)]
    pub unsafe fn from_u8_unchecked(byte: u8) -> Self {
        debug_assert!(
            (byte as usize) < Self::COUNT,
            "invalid opcode: 0x{byte:02x}"
        );
        unsafe { core::mem::transmute::<u8, Op>(byte) }
    }

    /// Number of operand bytes following the opcode, or `None` for
    /// [`Switch`](Op::Switch) whose length depends on its count.
    pub const fn operand_len(self) -> Option<usize> {
        use Op::*;
        Some(match self {
            Nop | Break | Breakpoint | SeqPoint | Safepoint | LdNull | Dup
            | Pop | LdLen | StElemRef | LocAlloc | CpBlk | InitBlk
            | RefAnyType | ArgList | Ret | RetVoid | Throw | EndFilter => 0,

            LdcI4S | LdInd | LdIndChecked | StInd | Add | Sub | Mul | Div
            | DivUn | Rem | RemUn | And | Or | Xor | Shl | Shr | ShrUn
            | AddOvf | AddOvfUn | SubOvf | SubOvfUn | MulOvf | MulOvfUn
            | Neg | Not | CkFinite | LdElem | LdElemUnchecked | StElem
            | StElemUnchecked | MdArrayAddr => 1,

            DupVt | PopVt | LdStr | LdPtr | LdToken | LdArg | StArg
            | LdArgA | LdArgAVt | LdLocA | LdObj | StObj | CpObj | InitObj
            | Compare | Conv | ConvOvf | ConvOvfUn | BrS | LdFldA
            | LdSFldA | NewArr | LdElemVt | StElemVt | LdElemA | LdElemATc
            | MdArrayGet | MdArrayGetUnchecked | MdArraySet | NewObj | Box
            | Unbox | CastClass | IsInst | LdFtn | LdVirtFtn | MkRefAny
            | RefAnyVal | Call | CallVirt | CallI | CallINat | JitCall
            | Jmp | RetVt | Rethrow | LeaveS | EndFinally => 2,

            LdLoc | StLoc | BrTrueS | BrFalseS | LdFld | StFld | LdSFld
            | StSFld | NewArrMulti | MdArrayAddrTc => 3,

            LdcI4 | LdcR4 | InitLocals | LdArgVt | StArgVt | LdLocVt
            | StLocVt | Br | BrCmpS | LdFldVt | StFldVt | LdSFldVt
            | StSFldVt | NewObjVt | CallVararg | VtResult | Leave
            | LeaveCheck => 4,

            BrTrue | BrFalse => 5,
            BrCmp => 6,
            LdcI8 | LdcR8 => 8,
            Switch => return None,
        })
    }

    /// Whether control may continue at the next instruction.
    pub const fn falls_through(self) -> bool {
        !matches!(
            self,
            Op::Br
                | Op::BrS
                | Op::Ret
                | Op::RetVoid
                | Op::RetVt
                | Op::Throw
                | Op::Rethrow
                | Op::Leave
                | Op::LeaveS
                | Op::LeaveCheck
                | Op::EndFinally
                | Op::EndFilter
                | Op::Jmp
        )
    }
}

impl TryFrom<u8> for Op {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        if (byte as usize) < Self::COUNT {
            // SAFETY: Op is repr(u8) with contiguous variants starting at 0.
            Ok(unsafe { core::mem::transmute::<u8, Op>(byte) })
        } else {
            Err(byte)
        }
    }
}
