use core::fmt;

use crate::operand::{Cond, ConvTy, MemTy, NumTy};

/// Binary arithmetic and bitwise operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinOp {
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
}

impl BinOp {
    pub const fn mnemonic(self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::DivUn => "div.un",
            BinOp::Rem => "rem",
            BinOp::RemUn => "rem.un",
            BinOp::And => "and",
            BinOp::Or => "or",
            BinOp::Xor => "xor",
            BinOp::Shl => "shl",
            BinOp::Shr => "shr",
            BinOp::ShrUn => "shr.un",
            BinOp::AddOvf => "add.ovf",
            BinOp::AddOvfUn => "add.ovf.un",
            BinOp::SubOvf => "sub.ovf",
            BinOp::SubOvfUn => "sub.ovf.un",
            BinOp::MulOvf => "mul.ovf",
            BinOp::MulOvfUn => "mul.ovf.un",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnOp {
    Neg,
    Not,
}

/// Overflow checking applied by a conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvCheck {
    None,
    /// Range-check, source read as signed.
    Signed,
    /// Range-check, source read as unsigned.
    Unsigned,
}

/// A decoded instruction.
///
/// Short and wide encodings decode to the same variant with the operand
/// widened (`LdcI4S` → [`LdcI4`](Instruction::LdcI4), `BrS` →
/// [`Br`](Instruction::Br)), and checked/unchecked opcode pairs carry a
/// `checked` flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instruction {
    Nop,
    Break,
    Breakpoint,
    SeqPoint,
    Safepoint,
    InitLocals { start: u16, size: u16 },
    LdNull,
    Dup,
    DupVt { size: u16 },
    Pop,
    PopVt { size: u16 },

    LdcI4 { value: i32 },
    LdcI8 { value: i64 },
    LdcR4 { bits: u32 },
    LdcR8 { bits: u64 },
    LdStr { item: u16 },
    LdPtr { item: u16 },
    LdToken { item: u16 },

    LdArg { n: u16 },
    LdArgVt { n: u16, size: u16 },
    StArg { n: u16 },
    StArgVt { n: u16, size: u16 },
    LdArgA { n: u16 },
    LdArgAVt { n: u16 },
    LdLoc { ty: MemTy, offset: u16 },
    LdLocVt { offset: u16, size: u16 },
    StLoc { ty: MemTy, offset: u16 },
    StLocVt { offset: u16, size: u16 },
    LdLocA { offset: u16 },

    LdInd { ty: MemTy, checked: bool },
    StInd { ty: MemTy },
    LdObj { size: u16 },
    StObj { size: u16 },
    CpObj { size: u16 },
    InitObj { size: u16 },

    Binary { op: BinOp, ty: NumTy },
    Unary { op: UnOp, ty: NumTy },
    CkFinite { ty: NumTy },
    Compare { cond: Cond, ty: NumTy },
    Conv { from: NumTy, to: ConvTy, check: ConvCheck },

    Br { disp: i32 },
    BrTrue { ty: NumTy, disp: i32 },
    BrFalse { ty: NumTy, disp: i32 },
    BrCmp { cond: Cond, ty: NumTy, disp: i32 },
    /// The `count` targets follow the instruction header; read them with
    /// [`switch_target`](crate::switch_target).
    Switch { count: u32 },

    LdFld { ty: MemTy, offset: u16 },
    LdFldVt { offset: u16, size: u16 },
    StFld { ty: MemTy, offset: u16 },
    StFldVt { offset: u16, size: u16 },
    LdFldA { offset: u16 },
    LdSFld { ty: MemTy, item: u16 },
    LdSFldVt { item: u16, size: u16 },
    StSFld { ty: MemTy, item: u16 },
    StSFldVt { item: u16, size: u16 },
    LdSFldA { item: u16 },

    NewArr { item: u16 },
    NewArrMulti { item: u16, params: u8 },
    LdLen,
    LdElem { ty: MemTy, checked: bool },
    LdElemVt { size: u16 },
    StElem { ty: MemTy, checked: bool },
    StElemRef,
    StElemVt { size: u16 },
    LdElemA { size: u16 },
    LdElemATc { item: u16 },
    MdArrayGet { rank: u8, ty: MemTy, checked: bool },
    MdArraySet { rank: u8, ty: MemTy },
    MdArrayAddr { rank: u8, typecheck: Option<u16> },

    NewObj { item: u16 },
    NewObjVt { item: u16, size: u16 },
    Box { item: u16 },
    Unbox { item: u16 },
    CastClass { item: u16 },
    IsInst { item: u16 },
    LdFtn { item: u16 },
    LdVirtFtn { item: u16 },
    LocAlloc,
    CpBlk,
    InitBlk,
    MkRefAny { item: u16 },
    RefAnyVal { item: u16 },
    RefAnyType,
    ArgList,

    Call { item: u16 },
    CallVirt { item: u16 },
    CallI { sig: u16 },
    CallINat { sig: u16 },
    CallVararg { item: u16, sig: u16 },
    JitCall { item: u16 },
    Jmp { item: u16 },
    Ret,
    RetVoid,
    RetVt { size: u16 },
    VtResult { ret_size: u16, args_size: u16 },

    Throw,
    Rethrow { offset: u16 },
    Leave { disp: i32, check: bool },
    EndFinally { clause: u16 },
    EndFilter,
}

impl Instruction {
    /// Whether this is one of the return forms.
    pub const fn is_return(&self) -> bool {
        matches!(
            self,
            Instruction::Ret | Instruction::RetVoid | Instruction::RetVt { .. }
        )
    }

    /// Branch displacement for single-target branches and leaves.
    pub const fn branch_disp(&self) -> Option<i32> {
        match *self {
            Instruction::Br { disp }
            | Instruction::BrTrue { disp, .. }
            | Instruction::BrFalse { disp, .. }
            | Instruction::BrCmp { disp, .. }
            | Instruction::Leave { disp, .. } => Some(disp),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Instruction::*;
        match *self {
            Nop => write!(f, "nop"),
            Break => write!(f, "break"),
            Breakpoint => write!(f, "breakpoint"),
            SeqPoint => write!(f, "seq_point"),
            Safepoint => write!(f, "safepoint"),
            InitLocals { start, size } => {
                write!(f, "initlocals {start}, {size}")
            }
            LdNull => write!(f, "ldnull"),
            Dup => write!(f, "dup"),
            DupVt { size } => write!(f, "dup.vt {size}"),
            Pop => write!(f, "pop"),
            PopVt { size } => write!(f, "pop.vt {size}"),

            LdcI4 { value } => write!(f, "ldc.i4 {value}"),
            LdcI8 { value } => write!(f, "ldc.i8 {value}"),
            LdcR4 { bits } => write!(f, "ldc.r4 {}", f32::from_bits(bits)),
            LdcR8 { bits } => write!(f, "ldc.r8 {}", f64::from_bits(bits)),
            LdStr { item } => write!(f, "ldstr #{item}"),
            LdPtr { item } => write!(f, "ldptr #{item}"),
            LdToken { item } => write!(f, "ldtoken #{item}"),

            LdArg { n } => write!(f, "ldarg {n}"),
            LdArgVt { n, size } => write!(f, "ldarg.vt {n}, {size}"),
            StArg { n } => write!(f, "starg {n}"),
            StArgVt { n, size } => write!(f, "starg.vt {n}, {size}"),
            LdArgA { n } => write!(f, "ldarga {n}"),
            LdArgAVt { n } => write!(f, "ldarga.vt {n}"),
            LdLoc { ty, offset } => write!(f, "ldloc.{ty} {offset}"),
            LdLocVt { offset, size } => write!(f, "ldloc.vt {offset}, {size}"),
            StLoc { ty, offset } => write!(f, "stloc.{ty} {offset}"),
            StLocVt { offset, size } => write!(f, "stloc.vt {offset}, {size}"),
            LdLocA { offset } => write!(f, "ldloca {offset}"),

            LdInd { ty, checked: true } => write!(f, "ldind.{ty}.check"),
            LdInd { ty, checked: false } => write!(f, "ldind.{ty}"),
            StInd { ty } => write!(f, "stind.{ty}"),
            LdObj { size } => write!(f, "ldobj {size}"),
            StObj { size } => write!(f, "stobj {size}"),
            CpObj { size } => write!(f, "cpobj {size}"),
            InitObj { size } => write!(f, "initobj {size}"),

            Binary { op, ty } => write!(f, "{}.{ty}", op.mnemonic()),
            Unary { op: UnOp::Neg, ty } => write!(f, "neg.{ty}"),
            Unary { op: UnOp::Not, ty } => write!(f, "not.{ty}"),
            CkFinite { ty } => write!(f, "ckfinite.{ty}"),
            Compare { cond, ty } => write!(f, "c{cond}.{ty}"),
            Conv { from, to, check: ConvCheck::None } => {
                write!(f, "conv.{to}.{from}")
            }
            Conv { from, to, check: ConvCheck::Signed } => {
                write!(f, "conv.ovf.{to}.{from}")
            }
            Conv { from, to, check: ConvCheck::Unsigned } => {
                write!(f, "conv.ovf.{to}.un.{from}")
            }

            Br { disp } => write!(f, "br {disp:+}"),
            BrTrue { ty, disp } => write!(f, "brtrue.{ty} {disp:+}"),
            BrFalse { ty, disp } => write!(f, "brfalse.{ty} {disp:+}"),
            BrCmp { cond, ty, disp } => write!(f, "b{cond}.{ty} {disp:+}"),
            Switch { count } => write!(f, "switch ({count} targets)"),

            LdFld { ty, offset } => write!(f, "ldfld.{ty} {offset}"),
            LdFldVt { offset, size } => write!(f, "ldfld.vt {offset}, {size}"),
            StFld { ty, offset } => write!(f, "stfld.{ty} {offset}"),
            StFldVt { offset, size } => write!(f, "stfld.vt {offset}, {size}"),
            LdFldA { offset } => write!(f, "ldflda {offset}"),
            LdSFld { ty, item } => write!(f, "ldsfld.{ty} #{item}"),
            LdSFldVt { item, size } => write!(f, "ldsfld.vt #{item}, {size}"),
            StSFld { ty, item } => write!(f, "stsfld.{ty} #{item}"),
            StSFldVt { item, size } => write!(f, "stsfld.vt #{item}, {size}"),
            LdSFldA { item } => write!(f, "ldsflda #{item}"),

            NewArr { item } => write!(f, "newarr #{item}"),
            NewArrMulti { item, params } => {
                write!(f, "newarr.multi #{item}, {params}")
            }
            LdLen => write!(f, "ldlen"),
            LdElem { ty, checked: true } => write!(f, "ldelem.{ty}"),
            LdElem { ty, checked: false } => write!(f, "ldelem.{ty}.nc"),
            LdElemVt { size } => write!(f, "ldelem.vt {size}"),
            StElem { ty, checked: true } => write!(f, "stelem.{ty}"),
            StElem { ty, checked: false } => write!(f, "stelem.{ty}.nc"),
            StElemRef => write!(f, "stelem.ref.tc"),
            StElemVt { size } => write!(f, "stelem.vt {size}"),
            LdElemA { size } => write!(f, "ldelema {size}"),
            LdElemATc { item } => write!(f, "ldelema.tc #{item}"),
            MdArrayGet { rank, ty, checked } => {
                let nc = if checked { "" } else { ".nc" };
                write!(f, "array.get.{ty}{nc} rank {rank}")
            }
            MdArraySet { rank, ty } => write!(f, "array.set.{ty} rank {rank}"),
            MdArrayAddr { rank, typecheck: None } => {
                write!(f, "array.addr rank {rank}")
            }
            MdArrayAddr { rank, typecheck: Some(item) } => {
                write!(f, "array.addr.tc rank {rank}, #{item}")
            }

            NewObj { item } => write!(f, "newobj #{item}"),
            NewObjVt { item, size } => write!(f, "newobj.vt #{item}, {size}"),
            Box { item } => write!(f, "box #{item}"),
            Unbox { item } => write!(f, "unbox #{item}"),
            CastClass { item } => write!(f, "castclass #{item}"),
            IsInst { item } => write!(f, "isinst #{item}"),
            LdFtn { item } => write!(f, "ldftn #{item}"),
            LdVirtFtn { item } => write!(f, "ldvirtftn #{item}"),
            LocAlloc => write!(f, "localloc"),
            CpBlk => write!(f, "cpblk"),
            InitBlk => write!(f, "initblk"),
            MkRefAny { item } => write!(f, "mkrefany #{item}"),
            RefAnyVal { item } => write!(f, "refanyval #{item}"),
            RefAnyType => write!(f, "refanytype"),
            ArgList => write!(f, "arglist"),

            Call { item } => write!(f, "call #{item}"),
            CallVirt { item } => write!(f, "callvirt #{item}"),
            CallI { sig } => write!(f, "calli #{sig}"),
            CallINat { sig } => write!(f, "calli.nat #{sig}"),
            CallVararg { item, sig } => write!(f, "call.vararg #{item}, #{sig}"),
            JitCall { item } => write!(f, "jit_call #{item}"),
            Jmp { item } => write!(f, "jmp #{item}"),
            Ret => write!(f, "ret"),
            RetVoid => write!(f, "ret.void"),
            RetVt { size } => write!(f, "ret.vt {size}"),
            VtResult { ret_size, args_size } => {
                write!(f, "vtresult {ret_size}, {args_size}")
            }

            Throw => write!(f, "throw"),
            Rethrow { offset } => write!(f, "rethrow {offset}"),
            Leave { disp, check: false } => write!(f, "leave {disp:+}"),
            Leave { disp, check: true } => write!(f, "leave.check {disp:+}"),
            EndFinally { clause } => write!(f, "endfinally {clause}"),
            EndFilter => write!(f, "endfilter"),
        }
    }
}
