use core::fmt;

use crate::op::Op;
use crate::operand::{Cond, ConvTy, MemTy, NumTy};

/// A branch target. Create with [`BytecodeBuilder::label`], resolve with
/// [`BytecodeBuilder::bind`]. Labels may be referenced before or after
/// they are bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(usize);

#[derive(Debug)]
struct Fixup {
    label: usize,
    /// Position of the displacement bytes in the buffer.
    disp_pos: usize,
    /// Start of the branching instruction (base for the displacement).
    base: usize,
    short: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildError {
    UnboundLabel { label: usize },
    DisplacementOutOfRange { at: usize, disp: i64 },
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BuildError::UnboundLabel { label } => {
                write!(f, "label {label} was never bound")
            }
            BuildError::DisplacementOutOfRange { at, disp } => {
                write!(f, "short branch at {at:04x} cannot reach {disp:+}")
            }
        }
    }
}

impl std::error::Error for BuildError {}

/// Builds a bytecode byte sequence.
///
/// Branch displacements are patched in [`finish`](Self::finish) once all
/// labels are bound.
#[derive(Default)]
pub struct BytecodeBuilder {
    buf: Vec<u8>,
    labels: Vec<Option<usize>>,
    fixups: Vec<Fixup>,
}

impl BytecodeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Current byte offset in the bytecode stream.
    pub fn current_offset(&self) -> usize {
        self.buf.len()
    }

    pub fn label(&mut self) -> Label {
        self.labels.push(None);
        Label(self.labels.len() - 1)
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: Label) {
        debug_assert!(self.labels[label.0].is_none(), "label bound twice");
        self.labels[label.0] = Some(self.buf.len());
    }

    /// Offset a label was bound to.
    pub fn label_offset(&self, label: Label) -> Option<usize> {
        self.labels.get(label.0).copied().flatten()
    }

    /// Patch every branch and return the finished bytecode.
    pub fn finish(mut self) -> Result<Vec<u8>, BuildError> {
        for fixup in &self.fixups {
            let target = self.labels[fixup.label]
                .ok_or(BuildError::UnboundLabel { label: fixup.label })?;
            let disp = target as i64 - fixup.base as i64;
            if fixup.short {
                let short = i16::try_from(disp).map_err(|_| {
                    BuildError::DisplacementOutOfRange { at: fixup.base, disp }
                })?;
                self.buf[fixup.disp_pos..fixup.disp_pos + 2]
                    .copy_from_slice(&short.to_le_bytes());
            } else {
                let wide = i32::try_from(disp).map_err(|_| {
                    BuildError::DisplacementOutOfRange { at: fixup.base, disp }
                })?;
                self.buf[fixup.disp_pos..fixup.disp_pos + 4]
                    .copy_from_slice(&wide.to_le_bytes());
            }
        }
        Ok(self.buf)
    }

    // ── emit helpers ───────────────────────────────────────────────

    fn emit_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn emit_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    fn emit_op(&mut self, op: Op) {
        self.buf.push(op as u8);
    }

    fn emit_op_u16(&mut self, op: Op, v: u16) {
        self.emit_op(op);
        self.emit_u16(v);
    }

    fn emit_op_u16_u16(&mut self, op: Op, a: u16, b: u16) {
        self.emit_op(op);
        self.emit_u16(a);
        self.emit_u16(b);
    }

    fn emit_op_mem_u16(&mut self, op: Op, ty: MemTy, v: u16) {
        self.emit_op(op);
        self.emit_u8(ty as u8);
        self.emit_u16(v);
    }

    /// Emit a placeholder displacement for `label`. `base` is the start of
    /// the branching instruction.
    fn emit_disp(&mut self, label: Label, base: usize, short: bool) {
        self.fixups.push(Fixup {
            label: label.0,
            disp_pos: self.buf.len(),
            base,
            short,
        });
        if short {
            self.emit_u16(0);
        } else {
            self.emit_u32(0);
        }
    }

    /// Emit an opcode that takes no operands.
    pub fn simple(&mut self, op: Op) {
        debug_assert_eq!(op.operand_len(), Some(0), "{op:?} takes operands");
        self.emit_op(op);
    }

    // ── misc & constants ───────────────────────────────────────────

    pub fn nop(&mut self) {
        self.emit_op(Op::Nop);
    }

    pub fn init_locals(&mut self, start: u16, size: u16) {
        self.emit_op_u16_u16(Op::InitLocals, start, size);
    }

    pub fn dup_vt(&mut self, size: u16) {
        self.emit_op_u16(Op::DupVt, size);
    }

    pub fn pop_vt(&mut self, size: u16) {
        self.emit_op_u16(Op::PopVt, size);
    }

    /// Push an `i32`, using the one-byte form when it fits.
    pub fn ldc_i4(&mut self, value: i32) {
        if let Ok(v) = i8::try_from(value) {
            self.emit_op(Op::LdcI4S);
            self.emit_u8(v as u8);
        } else {
            self.emit_op(Op::LdcI4);
            self.emit_u32(value as u32);
        }
    }

    pub fn ldc_i8(&mut self, value: i64) {
        self.emit_op(Op::LdcI8);
        self.emit_u64(value as u64);
    }

    pub fn ldc_r4(&mut self, value: f32) {
        self.emit_op(Op::LdcR4);
        self.emit_u32(value.to_bits());
    }

    pub fn ldc_r8(&mut self, value: f64) {
        self.emit_op(Op::LdcR8);
        self.emit_u64(value.to_bits());
    }

    pub fn ldstr(&mut self, item: u16) {
        self.emit_op_u16(Op::LdStr, item);
    }

    pub fn ldptr(&mut self, item: u16) {
        self.emit_op_u16(Op::LdPtr, item);
    }

    pub fn ldtoken(&mut self, item: u16) {
        self.emit_op_u16(Op::LdToken, item);
    }

    // ── arguments & locals ─────────────────────────────────────────

    pub fn ldarg(&mut self, n: u16) {
        self.emit_op_u16(Op::LdArg, n);
    }

    pub fn ldarg_vt(&mut self, n: u16, size: u16) {
        self.emit_op_u16_u16(Op::LdArgVt, n, size);
    }

    pub fn starg(&mut self, n: u16) {
        self.emit_op_u16(Op::StArg, n);
    }

    pub fn starg_vt(&mut self, n: u16, size: u16) {
        self.emit_op_u16_u16(Op::StArgVt, n, size);
    }

    pub fn ldarga(&mut self, n: u16) {
        self.emit_op_u16(Op::LdArgA, n);
    }

    pub fn ldarga_vt(&mut self, n: u16) {
        self.emit_op_u16(Op::LdArgAVt, n);
    }

    pub fn ldloc(&mut self, ty: MemTy, offset: u16) {
        self.emit_op_mem_u16(Op::LdLoc, ty, offset);
    }

    pub fn ldloc_vt(&mut self, offset: u16, size: u16) {
        self.emit_op_u16_u16(Op::LdLocVt, offset, size);
    }

    pub fn stloc(&mut self, ty: MemTy, offset: u16) {
        self.emit_op_mem_u16(Op::StLoc, ty, offset);
    }

    pub fn stloc_vt(&mut self, offset: u16, size: u16) {
        self.emit_op_u16_u16(Op::StLocVt, offset, size);
    }

    pub fn ldloca(&mut self, offset: u16) {
        self.emit_op_u16(Op::LdLocA, offset);
    }

    // ── indirect access ────────────────────────────────────────────

    pub fn ldind(&mut self, ty: MemTy, checked: bool) {
        self.emit_op(if checked { Op::LdIndChecked } else { Op::LdInd });
        self.emit_u8(ty as u8);
    }

    pub fn stind(&mut self, ty: MemTy) {
        self.emit_op(Op::StInd);
        self.emit_u8(ty as u8);
    }

    pub fn ldobj(&mut self, size: u16) {
        self.emit_op_u16(Op::LdObj, size);
    }

    pub fn stobj(&mut self, size: u16) {
        self.emit_op_u16(Op::StObj, size);
    }

    pub fn cpobj(&mut self, size: u16) {
        self.emit_op_u16(Op::CpObj, size);
    }

    pub fn initobj(&mut self, size: u16) {
        self.emit_op_u16(Op::InitObj, size);
    }

    // ── arithmetic, compare, convert ───────────────────────────────

    /// Emit an arithmetic opcode (`Add` ..= `CkFinite`) with its stack type.
    pub fn arith(&mut self, op: Op, ty: NumTy) {
        debug_assert!(
            (Op::Add as u8..=Op::CkFinite as u8).contains(&(op as u8)),
            "{op:?} is not an arithmetic opcode"
        );
        self.emit_op(op);
        self.emit_u8(ty as u8);
    }

    pub fn compare(&mut self, cond: Cond, ty: NumTy) {
        self.emit_op(Op::Compare);
        self.emit_u8(cond as u8);
        self.emit_u8(ty as u8);
    }

    pub fn conv(&mut self, from: NumTy, to: ConvTy) {
        self.emit_op(Op::Conv);
        self.emit_u8(from as u8);
        self.emit_u8(to as u8);
    }

    pub fn conv_ovf(&mut self, from: NumTy, to: ConvTy, unsigned_source: bool) {
        self.emit_op(if unsigned_source { Op::ConvOvfUn } else { Op::ConvOvf });
        self.emit_u8(from as u8);
        self.emit_u8(to as u8);
    }

    // ── branches ───────────────────────────────────────────────────

    pub fn br(&mut self, target: Label) {
        let base = self.current_offset();
        self.emit_op(Op::Br);
        self.emit_disp(target, base, false);
    }

    pub fn br_s(&mut self, target: Label) {
        let base = self.current_offset();
        self.emit_op(Op::BrS);
        self.emit_disp(target, base, true);
    }

    pub fn brtrue(&mut self, ty: NumTy, target: Label, short: bool) {
        let base = self.current_offset();
        self.emit_op(if short { Op::BrTrueS } else { Op::BrTrue });
        self.emit_u8(ty as u8);
        self.emit_disp(target, base, short);
    }

    pub fn brfalse(&mut self, ty: NumTy, target: Label, short: bool) {
        let base = self.current_offset();
        self.emit_op(if short { Op::BrFalseS } else { Op::BrFalse });
        self.emit_u8(ty as u8);
        self.emit_disp(target, base, short);
    }

    pub fn bcmp(&mut self, cond: Cond, ty: NumTy, target: Label, short: bool) {
        let base = self.current_offset();
        self.emit_op(if short { Op::BrCmpS } else { Op::BrCmp });
        self.emit_u8(cond as u8);
        self.emit_u8(ty as u8);
        self.emit_disp(target, base, short);
    }

    /// `Switch <count:u32> <disp:i32>*`. Execution falls through to the
    /// next instruction when the index is out of range.
    pub fn switch(&mut self, targets: &[Label]) {
        let base = self.current_offset();
        self.emit_op(Op::Switch);
        self.emit_u32(targets.len() as u32);
        for &target in targets {
            self.emit_disp(target, base, false);
        }
    }

    // ── fields ─────────────────────────────────────────────────────

    pub fn ldfld(&mut self, ty: MemTy, offset: u16) {
        self.emit_op_mem_u16(Op::LdFld, ty, offset);
    }

    pub fn ldfld_vt(&mut self, offset: u16, size: u16) {
        self.emit_op_u16_u16(Op::LdFldVt, offset, size);
    }

    pub fn stfld(&mut self, ty: MemTy, offset: u16) {
        self.emit_op_mem_u16(Op::StFld, ty, offset);
    }

    pub fn stfld_vt(&mut self, offset: u16, size: u16) {
        self.emit_op_u16_u16(Op::StFldVt, offset, size);
    }

    pub fn ldflda(&mut self, offset: u16) {
        self.emit_op_u16(Op::LdFldA, offset);
    }

    pub fn ldsfld(&mut self, ty: MemTy, item: u16) {
        self.emit_op_mem_u16(Op::LdSFld, ty, item);
    }

    pub fn ldsfld_vt(&mut self, item: u16, size: u16) {
        self.emit_op_u16_u16(Op::LdSFldVt, item, size);
    }

    pub fn stsfld(&mut self, ty: MemTy, item: u16) {
        self.emit_op_mem_u16(Op::StSFld, ty, item);
    }

    pub fn stsfld_vt(&mut self, item: u16, size: u16) {
        self.emit_op_u16_u16(Op::StSFldVt, item, size);
    }

    pub fn ldsflda(&mut self, item: u16) {
        self.emit_op_u16(Op::LdSFldA, item);
    }

    // ── arrays ─────────────────────────────────────────────────────

    pub fn newarr(&mut self, item: u16) {
        self.emit_op_u16(Op::NewArr, item);
    }

    pub fn newarr_multi(&mut self, item: u16, params: u8) {
        self.emit_op_u16(Op::NewArrMulti, item);
        self.emit_u8(params);
    }

    pub fn ldelem(&mut self, ty: MemTy, checked: bool) {
        self.emit_op(if checked { Op::LdElem } else { Op::LdElemUnchecked });
        self.emit_u8(ty as u8);
    }

    pub fn ldelem_vt(&mut self, size: u16) {
        self.emit_op_u16(Op::LdElemVt, size);
    }

    pub fn stelem(&mut self, ty: MemTy, checked: bool) {
        self.emit_op(if checked { Op::StElem } else { Op::StElemUnchecked });
        self.emit_u8(ty as u8);
    }

    pub fn stelem_vt(&mut self, size: u16) {
        self.emit_op_u16(Op::StElemVt, size);
    }

    pub fn ldelema(&mut self, size: u16) {
        self.emit_op_u16(Op::LdElemA, size);
    }

    pub fn ldelema_tc(&mut self, item: u16) {
        self.emit_op_u16(Op::LdElemATc, item);
    }

    pub fn md_array_get(&mut self, rank: u8, ty: MemTy, checked: bool) {
        self.emit_op(if checked {
            Op::MdArrayGet
        } else {
            Op::MdArrayGetUnchecked
        });
        self.emit_u8(rank);
        self.emit_u8(ty as u8);
    }

    pub fn md_array_set(&mut self, rank: u8, ty: MemTy) {
        self.emit_op(Op::MdArraySet);
        self.emit_u8(rank);
        self.emit_u8(ty as u8);
    }

    pub fn md_array_addr(&mut self, rank: u8, typecheck: Option<u16>) {
        match typecheck {
            None => {
                self.emit_op(Op::MdArrayAddr);
                self.emit_u8(rank);
            }
            Some(item) => {
                self.emit_op(Op::MdArrayAddrTc);
                self.emit_u8(rank);
                self.emit_u16(item);
            }
        }
    }

    // ── objects ────────────────────────────────────────────────────

    pub fn newobj(&mut self, item: u16) {
        self.emit_op_u16(Op::NewObj, item);
    }

    pub fn newobj_vt(&mut self, item: u16, size: u16) {
        self.emit_op_u16_u16(Op::NewObjVt, item, size);
    }

    pub fn box_(&mut self, item: u16) {
        self.emit_op_u16(Op::Box, item);
    }

    pub fn unbox(&mut self, item: u16) {
        self.emit_op_u16(Op::Unbox, item);
    }

    pub fn castclass(&mut self, item: u16) {
        self.emit_op_u16(Op::CastClass, item);
    }

    pub fn isinst(&mut self, item: u16) {
        self.emit_op_u16(Op::IsInst, item);
    }

    pub fn ldftn(&mut self, item: u16) {
        self.emit_op_u16(Op::LdFtn, item);
    }

    pub fn ldvirtftn(&mut self, item: u16) {
        self.emit_op_u16(Op::LdVirtFtn, item);
    }

    pub fn mkrefany(&mut self, item: u16) {
        self.emit_op_u16(Op::MkRefAny, item);
    }

    pub fn refanyval(&mut self, item: u16) {
        self.emit_op_u16(Op::RefAnyVal, item);
    }

    // ── calls ──────────────────────────────────────────────────────

    pub fn call(&mut self, item: u16) {
        self.emit_op_u16(Op::Call, item);
    }

    pub fn callvirt(&mut self, item: u16) {
        self.emit_op_u16(Op::CallVirt, item);
    }

    pub fn calli(&mut self, sig: u16) {
        self.emit_op_u16(Op::CallI, sig);
    }

    pub fn calli_nat(&mut self, sig: u16) {
        self.emit_op_u16(Op::CallINat, sig);
    }

    pub fn call_vararg(&mut self, item: u16, sig: u16) {
        self.emit_op_u16_u16(Op::CallVararg, item, sig);
    }

    pub fn jit_call(&mut self, item: u16) {
        self.emit_op_u16(Op::JitCall, item);
    }

    pub fn jmp(&mut self, item: u16) {
        self.emit_op_u16(Op::Jmp, item);
    }

    pub fn ret_vt(&mut self, size: u16) {
        self.emit_op_u16(Op::RetVt, size);
    }

    pub fn vt_result(&mut self, ret_size: u16, args_size: u16) {
        self.emit_op_u16_u16(Op::VtResult, ret_size, args_size);
    }

    // ── exception control ──────────────────────────────────────────

    pub fn rethrow(&mut self, exvar_offset: u16) {
        self.emit_op_u16(Op::Rethrow, exvar_offset);
    }

    pub fn leave(&mut self, target: Label) {
        let base = self.current_offset();
        self.emit_op(Op::Leave);
        self.emit_disp(target, base, false);
    }

    pub fn leave_s(&mut self, target: Label) {
        let base = self.current_offset();
        self.emit_op(Op::LeaveS);
        self.emit_disp(target, base, true);
    }

    /// A leave that polls for interruption when no finally runs.
    pub fn leave_check(&mut self, target: Label) {
        let base = self.current_offset();
        self.emit_op(Op::LeaveCheck);
        self.emit_disp(target, base, false);
    }

    pub fn endfinally(&mut self, clause: u16) {
        self.emit_op_u16(Op::EndFinally, clause);
    }
}
