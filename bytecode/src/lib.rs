mod op;
mod operand;
mod instruction;
mod builder;
mod decoder;

pub use op::Op;
pub use operand::{Cond, ConvTy, MemTy, NumTy};
pub use instruction::{BinOp, ConvCheck, Instruction, UnOp};
pub use builder::{BuildError, BytecodeBuilder, Label};
pub use decoder::{
    BytecodeDecoder, DecodeError, decode_at, disassemble, switch_target,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(bytes: &[u8]) -> Vec<Instruction> {
        BytecodeDecoder::new(bytes)
            .collect::<Result<Vec<_>, _>>()
            .unwrap()
    }

    #[test]
    fn round_trip_basic() {
        let mut b = BytecodeBuilder::new();
        b.ldc_i4(2);
        b.ldc_i4(3);
        b.arith(Op::Add, NumTy::I4);
        b.simple(Op::Ret);

        assert_eq!(decode_all(&b.finish().unwrap()), vec![
            Instruction::LdcI4 { value: 2 },
            Instruction::LdcI4 { value: 3 },
            Instruction::Binary { op: BinOp::Add, ty: NumTy::I4 },
            Instruction::Ret,
        ]);
    }

    #[test]
    fn ldc_i4_picks_short_form() {
        let mut b = BytecodeBuilder::new();
        b.ldc_i4(-128);
        assert_eq!(b.current_offset(), 2);
        b.ldc_i4(128);
        assert_eq!(b.current_offset(), 7);

        assert_eq!(decode_all(&b.finish().unwrap()), vec![
            Instruction::LdcI4 { value: -128 },
            Instruction::LdcI4 { value: 128 },
        ]);
    }

    #[test]
    fn wide_constants() {
        let mut b = BytecodeBuilder::new();
        b.ldc_i8(i64::MIN);
        b.ldc_r4(1.5);
        b.ldc_r8(f64::NAN);

        let decoded = decode_all(&b.finish().unwrap());
        assert_eq!(decoded[0], Instruction::LdcI8 { value: i64::MIN });
        assert_eq!(decoded[1], Instruction::LdcR4 { bits: 1.5f32.to_bits() });
        match decoded[2] {
            Instruction::LdcR8 { bits } => assert!(f64::from_bits(bits).is_nan()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn typed_operands() {
        let mut b = BytecodeBuilder::new();
        b.ldloc(MemTy::U2, 16);
        b.stloc(MemTy::Ref, 24);
        b.ldind(MemTy::I1, true);
        b.compare(Cond::LtUn, NumTy::R8);
        b.conv_ovf(NumTy::I8, ConvTy::U1, true);

        assert_eq!(decode_all(&b.finish().unwrap()), vec![
            Instruction::LdLoc { ty: MemTy::U2, offset: 16 },
            Instruction::StLoc { ty: MemTy::Ref, offset: 24 },
            Instruction::LdInd { ty: MemTy::I1, checked: true },
            Instruction::Compare { cond: Cond::LtUn, ty: NumTy::R8 },
            Instruction::Conv {
                from: NumTy::I8,
                to: ConvTy::U1,
                check: ConvCheck::Unsigned,
            },
        ]);
    }

    // ── branches ───────────────────────────────────────────────────

    #[test]
    fn forward_branch_is_relative_to_instruction_start() {
        let mut b = BytecodeBuilder::new();
        let done = b.label();
        b.ldc_i4(0);
        b.brfalse(NumTy::I4, done, true);
        b.ldc_i4(1);
        b.bind(done);
        b.simple(Op::Ret);

        // brfalse.s at 2 (4 bytes), ldc.i4.s at 6 (2 bytes), ret at 8.
        assert_eq!(decode_all(&b.finish().unwrap()), vec![
            Instruction::LdcI4 { value: 0 },
            Instruction::BrFalse { ty: NumTy::I4, disp: 6 },
            Instruction::LdcI4 { value: 1 },
            Instruction::Ret,
        ]);
    }

    #[test]
    fn backward_branch() {
        let mut b = BytecodeBuilder::new();
        let top = b.label();
        b.bind(top);
        b.simple(Op::Nop);
        b.bcmp(Cond::Lt, NumTy::I4, top, false);

        assert_eq!(decode_all(&b.finish().unwrap()), vec![
            Instruction::Nop,
            Instruction::BrCmp { cond: Cond::Lt, ty: NumTy::I4, disp: -1 },
        ]);
    }

    #[test]
    fn short_and_wide_forms_decode_alike() {
        let mut b = BytecodeBuilder::new();
        let target = b.label();
        b.br_s(target);
        b.br(target);
        b.leave_s(target);
        b.leave(target);
        b.bind(target);

        assert_eq!(decode_all(&b.finish().unwrap()), vec![
            Instruction::Br { disp: 16 },
            Instruction::Br { disp: 13 },
            Instruction::Leave { disp: 8, check: false },
            Instruction::Leave { disp: 5, check: false },
        ]);
    }

    #[test]
    fn short_branch_out_of_range() {
        let mut b = BytecodeBuilder::new();
        let far = b.label();
        b.br_s(far);
        for _ in 0..40_000 {
            b.simple(Op::Nop);
        }
        b.bind(far);

        assert!(matches!(
            b.finish(),
            Err(BuildError::DisplacementOutOfRange { at: 0, .. })
        ));
    }

    #[test]
    fn unbound_label_is_an_error() {
        let mut b = BytecodeBuilder::new();
        let nowhere = b.label();
        b.br(nowhere);
        assert_eq!(b.finish(), Err(BuildError::UnboundLabel { label: 0 }));
    }

    #[test]
    fn switch_table() {
        let mut b = BytecodeBuilder::new();
        let (a, c) = (b.label(), b.label());
        b.switch(&[a, c, a]);
        b.bind(a);
        b.simple(Op::Nop);
        b.bind(c);
        b.simple(Op::RetVoid);
        let bytes = b.finish().unwrap();

        let (instr, next) = decode_at(&bytes, 0).unwrap();
        assert_eq!(instr, Instruction::Switch { count: 3 });
        assert_eq!(next, 17);
        assert_eq!(switch_target(&bytes, 0, 0), 17);
        assert_eq!(switch_target(&bytes, 0, 1), 18);
        assert_eq!(switch_target(&bytes, 0, 2), 17);
    }

    // ── decoding errors ────────────────────────────────────────────

    #[test]
    fn invalid_opcode() {
        let bytes = [Op::Nop as u8, 0xff];
        let mut decoder = BytecodeDecoder::new(&bytes);
        assert_eq!(decoder.next(), Some(Ok(Instruction::Nop)));
        assert_eq!(
            decoder.next(),
            Some(Err(DecodeError::InvalidOpcode { offset: 1, byte: 0xff }))
        );
        assert_eq!(decoder.next(), None);
    }

    #[test]
    fn invalid_operand_byte() {
        let bytes = [Op::Add as u8, 9];
        assert_eq!(
            decode_at(&bytes, 0),
            Err(DecodeError::InvalidOperand { offset: 0, op: Op::Add, byte: 9 })
        );
    }

    #[test]
    fn truncated_operand() {
        let bytes = [Op::LdcI4 as u8, 1, 2];
        assert_eq!(
            decode_at(&bytes, 0),
            Err(DecodeError::Truncated { offset: 0, op: Op::LdcI4 })
        );
    }

    #[test]
    fn truncated_switch_table() {
        let mut bytes = vec![Op::Switch as u8];
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&0i32.to_le_bytes());
        assert!(matches!(
            decode_at(&bytes, 0),
            Err(DecodeError::Truncated { op: Op::Switch, .. })
        ));
    }

    #[test]
    fn every_opcode_has_an_operand_length() {
        for byte in 0..Op::COUNT as u8 {
            let op = Op::try_from(byte).unwrap();
            if op != Op::Switch {
                assert!(op.operand_len().is_some(), "{op:?}");
            }
        }
        assert_eq!(Op::try_from(Op::COUNT as u8), Err(Op::COUNT as u8));
    }

    #[test]
    fn operand_lengths_match_decoder() {
        let mut b = BytecodeBuilder::new();
        b.ldarg_vt(1, 24);
        b.newarr_multi(3, 4);
        b.md_array_addr(2, Some(7));
        b.call_vararg(1, 2);
        b.vt_result(16, 8);
        let bytes = b.finish().unwrap();

        let mut pos = 0;
        while pos < bytes.len() {
            let op = Op::try_from(bytes[pos]).unwrap();
            let (_, next) = decode_at(&bytes, pos).unwrap();
            assert_eq!(next - pos, 1 + op.operand_len().unwrap(), "{op:?}");
            pos = next;
        }
    }

    // ── display ────────────────────────────────────────────────────

    #[test]
    fn display_instructions() {
        assert_eq!(
            Instruction::Binary { op: BinOp::AddOvfUn, ty: NumTy::I8 }.to_string(),
            "add.ovf.un.i8"
        );
        assert_eq!(
            Instruction::BrCmp { cond: Cond::GeUn, ty: NumTy::R4, disp: -7 }.to_string(),
            "bge.un.r4 -7"
        );
        assert_eq!(
            Instruction::LdLoc { ty: MemTy::Ref, offset: 8 }.to_string(),
            "ldloc.ref 8"
        );
    }

    #[test]
    fn disassemble_lists_offsets() {
        let mut b = BytecodeBuilder::new();
        b.ldc_i4(5);
        b.simple(Op::Ret);
        let text = disassemble(&b.finish().unwrap());
        assert_eq!(text, "0000: ldc.i4 5\n0002: ret\n");
    }
}
