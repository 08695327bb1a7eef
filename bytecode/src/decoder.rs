use core::fmt;

use crate::instruction::{BinOp, ConvCheck, Instruction, UnOp};
use crate::op::Op;
use crate::operand::{Cond, ConvTy, MemTy, NumTy};

/// Reasons a byte sequence does not decode.
///
/// Bytecode comes from the transform step and is trusted, so the
/// interpreter treats any of these as an execution-environment fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    InvalidOpcode { offset: usize, byte: u8 },
    InvalidOperand { offset: usize, op: Op, byte: u8 },
    Truncated { offset: usize, op: Op },
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DecodeError::InvalidOpcode { offset, byte } => {
                write!(f, "invalid opcode 0x{byte:02x} at {offset:04x}")
            }
            DecodeError::InvalidOperand { offset, op, byte } => {
                write!(f, "invalid operand 0x{byte:02x} for {op:?} at {offset:04x}")
            }
            DecodeError::Truncated { offset, op } => {
                write!(f, "truncated {op:?} at {offset:04x}")
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Decodes a bytecode byte slice into [`Instruction`]s.
///
/// Unlike the instruction stream's producer, the decoder does not trust its
/// input: opcode and operand bytes are validated and running off the end is
/// reported as [`DecodeError::Truncated`].
pub struct BytecodeDecoder<'a> {
    bytes: &'a [u8],
    pos: usize,
    /// Offset of the instruction being decoded.
    start: usize,
    op: Op,
}

impl<'a> BytecodeDecoder<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        Self::at(bytes, 0)
    }

    /// A decoder positioned at `pos`.
    pub fn at(bytes: &'a [u8], pos: usize) -> Self {
        Self {
            bytes,
            pos,
            start: pos,
            op: Op::Nop,
        }
    }

    /// Current byte offset in the stream.
    #[inline(always)]
    pub fn offset(&self) -> usize {
        self.pos
    }

    /// Whether the decoder has reached the end of the bytecode.
    #[inline(always)]
    pub fn is_at_end(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    /// Decode the next instruction, or `None` at end-of-stream.
    pub fn decode_next(&mut self) -> Option<Result<Instruction, DecodeError>> {
        if self.is_at_end() {
            return None;
        }
        Some(self.decode())
    }

    /// Decode one instruction at the current position.
    pub fn decode(&mut self) -> Result<Instruction, DecodeError> {
        self.start = self.pos;
        let byte = self.bytes.get(self.pos).copied().ok_or(
            DecodeError::Truncated {
                offset: self.pos,
                op: Op::Nop,
            })?;
        self.op = Op::try_from(byte).map_err(|byte| DecodeError::InvalidOpcode {
            offset: self.pos,
            byte,
        })?;
        self.pos += 1;
        self.decode_op(self.op)
    }

    fn decode_op(&mut self, op: Op) -> Result<Instruction, DecodeError> {
        use Instruction as I;

        let instr = match op {
            Op::Nop => I::Nop,
            Op::Break => I::Break,
            Op::Breakpoint => I::Breakpoint,
            Op::SeqPoint => I::SeqPoint,
            Op::Safepoint => I::Safepoint,
            Op::InitLocals => I::InitLocals {
                start: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::LdNull => I::LdNull,
            Op::Dup => I::Dup,
            Op::DupVt => I::DupVt { size: self.read_u16()? },
            Op::Pop => I::Pop,
            Op::PopVt => I::PopVt { size: self.read_u16()? },

            Op::LdcI4S => I::LdcI4 { value: self.read_u8()? as i8 as i32 },
            Op::LdcI4 => I::LdcI4 { value: self.read_u32()? as i32 },
            Op::LdcI8 => I::LdcI8 { value: self.read_u64()? as i64 },
            Op::LdcR4 => I::LdcR4 { bits: self.read_u32()? },
            Op::LdcR8 => I::LdcR8 { bits: self.read_u64()? },
            Op::LdStr => I::LdStr { item: self.read_u16()? },
            Op::LdPtr => I::LdPtr { item: self.read_u16()? },
            Op::LdToken => I::LdToken { item: self.read_u16()? },

            Op::LdArg => I::LdArg { n: self.read_u16()? },
            Op::LdArgVt => I::LdArgVt {
                n: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::StArg => I::StArg { n: self.read_u16()? },
            Op::StArgVt => I::StArgVt {
                n: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::LdArgA => I::LdArgA { n: self.read_u16()? },
            Op::LdArgAVt => I::LdArgAVt { n: self.read_u16()? },
            Op::LdLoc => I::LdLoc {
                ty: self.read_mem()?,
                offset: self.read_u16()?,
            },
            Op::LdLocVt => I::LdLocVt {
                offset: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::StLoc => I::StLoc {
                ty: self.read_mem()?,
                offset: self.read_u16()?,
            },
            Op::StLocVt => I::StLocVt {
                offset: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::LdLocA => I::LdLocA { offset: self.read_u16()? },

            Op::LdInd => I::LdInd {
                ty: self.read_mem()?,
                checked: false,
            },
            Op::LdIndChecked => I::LdInd {
                ty: self.read_mem()?,
                checked: true,
            },
            Op::StInd => I::StInd { ty: self.read_mem()? },
            Op::LdObj => I::LdObj { size: self.read_u16()? },
            Op::StObj => I::StObj { size: self.read_u16()? },
            Op::CpObj => I::CpObj { size: self.read_u16()? },
            Op::InitObj => I::InitObj { size: self.read_u16()? },

            Op::Add => self.binary(BinOp::Add)?,
            Op::Sub => self.binary(BinOp::Sub)?,
            Op::Mul => self.binary(BinOp::Mul)?,
            Op::Div => self.binary(BinOp::Div)?,
            Op::DivUn => self.binary(BinOp::DivUn)?,
            Op::Rem => self.binary(BinOp::Rem)?,
            Op::RemUn => self.binary(BinOp::RemUn)?,
            Op::And => self.binary(BinOp::And)?,
            Op::Or => self.binary(BinOp::Or)?,
            Op::Xor => self.binary(BinOp::Xor)?,
            Op::Shl => self.binary(BinOp::Shl)?,
            Op::Shr => self.binary(BinOp::Shr)?,
            Op::ShrUn => self.binary(BinOp::ShrUn)?,
            Op::AddOvf => self.binary(BinOp::AddOvf)?,
            Op::AddOvfUn => self.binary(BinOp::AddOvfUn)?,
            Op::SubOvf => self.binary(BinOp::SubOvf)?,
            Op::SubOvfUn => self.binary(BinOp::SubOvfUn)?,
            Op::MulOvf => self.binary(BinOp::MulOvf)?,
            Op::MulOvfUn => self.binary(BinOp::MulOvfUn)?,
            Op::Neg => I::Unary {
                op: UnOp::Neg,
                ty: self.read_num()?,
            },
            Op::Not => I::Unary {
                op: UnOp::Not,
                ty: self.read_num()?,
            },
            Op::CkFinite => I::CkFinite { ty: self.read_num()? },

            Op::Compare => I::Compare {
                cond: self.read_cond()?,
                ty: self.read_num()?,
            },
            Op::Conv => self.conv(ConvCheck::None)?,
            Op::ConvOvf => self.conv(ConvCheck::Signed)?,
            Op::ConvOvfUn => self.conv(ConvCheck::Unsigned)?,

            Op::Br => I::Br { disp: self.read_i32()? },
            Op::BrS => I::Br { disp: self.read_i16()? as i32 },
            Op::BrTrue => I::BrTrue {
                ty: self.read_num()?,
                disp: self.read_i32()?,
            },
            Op::BrTrueS => I::BrTrue {
                ty: self.read_num()?,
                disp: self.read_i16()? as i32,
            },
            Op::BrFalse => I::BrFalse {
                ty: self.read_num()?,
                disp: self.read_i32()?,
            },
            Op::BrFalseS => I::BrFalse {
                ty: self.read_num()?,
                disp: self.read_i16()? as i32,
            },
            Op::BrCmp => I::BrCmp {
                cond: self.read_cond()?,
                ty: self.read_num()?,
                disp: self.read_i32()?,
            },
            Op::BrCmpS => I::BrCmp {
                cond: self.read_cond()?,
                ty: self.read_num()?,
                disp: self.read_i16()? as i32,
            },
            Op::Switch => {
                let count = self.read_u32()?;
                let table = (count as usize)
                    .checked_mul(4)
                    .ok_or(self.truncated())?;
                if self.bytes.len() - self.pos < table {
                    return Err(self.truncated());
                }
                self.pos += table;
                I::Switch { count }
            }

            Op::LdFld => I::LdFld {
                ty: self.read_mem()?,
                offset: self.read_u16()?,
            },
            Op::LdFldVt => I::LdFldVt {
                offset: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::StFld => I::StFld {
                ty: self.read_mem()?,
                offset: self.read_u16()?,
            },
            Op::StFldVt => I::StFldVt {
                offset: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::LdFldA => I::LdFldA { offset: self.read_u16()? },
            Op::LdSFld => I::LdSFld {
                ty: self.read_mem()?,
                item: self.read_u16()?,
            },
            Op::LdSFldVt => I::LdSFldVt {
                item: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::StSFld => I::StSFld {
                ty: self.read_mem()?,
                item: self.read_u16()?,
            },
            Op::StSFldVt => I::StSFldVt {
                item: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::LdSFldA => I::LdSFldA { item: self.read_u16()? },

            Op::NewArr => I::NewArr { item: self.read_u16()? },
            Op::NewArrMulti => I::NewArrMulti {
                item: self.read_u16()?,
                params: self.read_u8()?,
            },
            Op::LdLen => I::LdLen,
            Op::LdElem => I::LdElem {
                ty: self.read_mem()?,
                checked: true,
            },
            Op::LdElemUnchecked => I::LdElem {
                ty: self.read_mem()?,
                checked: false,
            },
            Op::LdElemVt => I::LdElemVt { size: self.read_u16()? },
            Op::StElem => I::StElem {
                ty: self.read_mem()?,
                checked: true,
            },
            Op::StElemUnchecked => I::StElem {
                ty: self.read_mem()?,
                checked: false,
            },
            Op::StElemRef => I::StElemRef,
            Op::StElemVt => I::StElemVt { size: self.read_u16()? },
            Op::LdElemA => I::LdElemA { size: self.read_u16()? },
            Op::LdElemATc => I::LdElemATc { item: self.read_u16()? },
            Op::MdArrayGet => I::MdArrayGet {
                rank: self.read_u8()?,
                ty: self.read_mem()?,
                checked: true,
            },
            Op::MdArrayGetUnchecked => I::MdArrayGet {
                rank: self.read_u8()?,
                ty: self.read_mem()?,
                checked: false,
            },
            Op::MdArraySet => I::MdArraySet {
                rank: self.read_u8()?,
                ty: self.read_mem()?,
            },
            Op::MdArrayAddr => I::MdArrayAddr {
                rank: self.read_u8()?,
                typecheck: None,
            },
            Op::MdArrayAddrTc => I::MdArrayAddr {
                rank: self.read_u8()?,
                typecheck: Some(self.read_u16()?),
            },

            Op::NewObj => I::NewObj { item: self.read_u16()? },
            Op::NewObjVt => I::NewObjVt {
                item: self.read_u16()?,
                size: self.read_u16()?,
            },
            Op::Box => I::Box { item: self.read_u16()? },
            Op::Unbox => I::Unbox { item: self.read_u16()? },
            Op::CastClass => I::CastClass { item: self.read_u16()? },
            Op::IsInst => I::IsInst { item: self.read_u16()? },
            Op::LdFtn => I::LdFtn { item: self.read_u16()? },
            Op::LdVirtFtn => I::LdVirtFtn { item: self.read_u16()? },
            Op::LocAlloc => I::LocAlloc,
            Op::CpBlk => I::CpBlk,
            Op::InitBlk => I::InitBlk,
            Op::MkRefAny => I::MkRefAny { item: self.read_u16()? },
            Op::RefAnyVal => I::RefAnyVal { item: self.read_u16()? },
            Op::RefAnyType => I::RefAnyType,
            Op::ArgList => I::ArgList,

            Op::Call => I::Call { item: self.read_u16()? },
            Op::CallVirt => I::CallVirt { item: self.read_u16()? },
            Op::CallI => I::CallI { sig: self.read_u16()? },
            Op::CallINat => I::CallINat { sig: self.read_u16()? },
            Op::CallVararg => I::CallVararg {
                item: self.read_u16()?,
                sig: self.read_u16()?,
            },
            Op::JitCall => I::JitCall { item: self.read_u16()? },
            Op::Jmp => I::Jmp { item: self.read_u16()? },
            Op::Ret => I::Ret,
            Op::RetVoid => I::RetVoid,
            Op::RetVt => I::RetVt { size: self.read_u16()? },
            Op::VtResult => I::VtResult {
                ret_size: self.read_u16()?,
                args_size: self.read_u16()?,
            },

            Op::Throw => I::Throw,
            Op::Rethrow => I::Rethrow { offset: self.read_u16()? },
            Op::Leave => I::Leave {
                disp: self.read_i32()?,
                check: false,
            },
            Op::LeaveS => I::Leave {
                disp: self.read_i16()? as i32,
                check: false,
            },
            Op::LeaveCheck => I::Leave {
                disp: self.read_i32()?,
                check: true,
            },
            Op::EndFinally => I::EndFinally { clause: self.read_u16()? },
            Op::EndFilter => I::EndFilter,
        };
        Ok(instr)
    }

    fn binary(&mut self, op: BinOp) -> Result<Instruction, DecodeError> {
        Ok(Instruction::Binary {
            op,
            ty: self.read_num()?,
        })
    }

    fn conv(&mut self, check: ConvCheck) -> Result<Instruction, DecodeError> {
        Ok(Instruction::Conv {
            from: self.read_num()?,
            to: self.read_conv()?,
            check,
        })
    }

    // ── raw reads ──────────────────────────────────────────────────

    fn truncated(&self) -> DecodeError {
        DecodeError::Truncated {
            offset: self.start,
            op: self.op,
        }
    }

    fn read_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let end = self.pos + N;
        let bytes = self
            .bytes
            .get(self.pos..end)
            .ok_or(self.truncated())?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    #[inline(always)]
    fn read_u8(&mut self) -> Result<u8, DecodeError> {
        Ok(self.read_array::<1>()?[0])
    }

    #[inline(always)]
    fn read_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.read_array()?))
    }

    #[inline(always)]
    fn read_i16(&mut self) -> Result<i16, DecodeError> {
        Ok(i16::from_le_bytes(self.read_array()?))
    }

    #[inline(always)]
    fn read_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.read_array()?))
    }

    #[inline(always)]
    fn read_i32(&mut self) -> Result<i32, DecodeError> {
        Ok(i32::from_le_bytes(self.read_array()?))
    }

    #[inline(always)]
    fn read_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.read_array()?))
    }

    fn invalid_operand(&self, byte: u8) -> DecodeError {
        DecodeError::InvalidOperand {
            offset: self.start,
            op: self.op,
            byte,
        }
    }

    fn read_num(&mut self) -> Result<NumTy, DecodeError> {
        let byte = self.read_u8()?;
        NumTy::try_from(byte).map_err(|b| self.invalid_operand(b))
    }

    fn read_mem(&mut self) -> Result<MemTy, DecodeError> {
        let byte = self.read_u8()?;
        MemTy::try_from(byte).map_err(|b| self.invalid_operand(b))
    }

    fn read_conv(&mut self) -> Result<ConvTy, DecodeError> {
        let byte = self.read_u8()?;
        ConvTy::try_from(byte).map_err(|b| self.invalid_operand(b))
    }

    fn read_cond(&mut self) -> Result<Cond, DecodeError> {
        let byte = self.read_u8()?;
        Cond::try_from(byte).map_err(|b| self.invalid_operand(b))
    }
}

impl Iterator for BytecodeDecoder<'_> {
    type Item = Result<Instruction, DecodeError>;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.decode_next()?;
        if item.is_err() {
            // Stop after the first error; the position is no longer
            // meaningful.
            self.pos = self.bytes.len();
        }
        Some(item)
    }
}

/// Decode the instruction at `pos`, returning it with the offset of the
/// following instruction.
#[inline]
pub fn decode_at(bytes: &[u8], pos: usize) -> Result<(Instruction, usize), DecodeError> {
    let mut decoder = BytecodeDecoder::at(bytes, pos);
    let instr = decoder.decode()?;
    Ok((instr, decoder.offset()))
}

/// Displacement of target `index` of the `Switch` instruction at `pos`.
///
/// The instruction must already have been decoded successfully, which
/// guarantees the table is in bounds.
pub fn switch_target(bytes: &[u8], pos: usize, index: u32) -> i32 {
    let at = pos + 5 + index as usize * 4;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    i32::from_le_bytes(raw)
}

/// Render `bytes` as one instruction per line, prefixed with its offset.
pub fn disassemble(bytes: &[u8]) -> String {
    use fmt::Write;

    let mut out = String::new();
    let mut decoder = BytecodeDecoder::new(bytes);
    while !decoder.is_at_end() {
        let at = decoder.offset();
        match decoder.decode() {
            Ok(Instruction::Switch { count }) => {
                let _ = writeln!(out, "{at:04x}: switch");
                for i in 0..count {
                    let disp = switch_target(bytes, at, i);
                    let _ = writeln!(out, "        {i}: {disp:+}");
                }
            }
            Ok(instr) => {
                let _ = writeln!(out, "{at:04x}: {instr}");
            }
            Err(err) => {
                let _ = writeln!(out, "{at:04x}: <{err}>");
                break;
            }
        }
    }
    out
}
