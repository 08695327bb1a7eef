//! Arithmetic, bitwise and conversion semantics on cells.
//!
//! Every function checks its failure condition before producing a value,
//! so callers can leave the operand stack untouched on error.

use bytecode::{BinOp, ConvCheck, ConvTy, NumTy, UnOp};
use object::ExceptionKind;

use crate::stackval::StackVal;

type ArithResult = Result<StackVal, ExceptionKind>;

pub(crate) fn binary(op: BinOp, ty: NumTy, a: StackVal, b: StackVal) -> ArithResult {
    match ty {
        NumTy::I4 => binary_i4(op, a.as_i32(), b.as_i32()),
        NumTy::I8 => binary_i8(op, a.as_i64(), b.as_i32(), b.as_i64()),
        NumTy::R4 => {
            binary_float(op, a.as_f32() as f64, b.as_f32() as f64).map(|r| StackVal::from_f32(r as f32))
        }
        NumTy::R8 => binary_float(op, a.as_f64(), b.as_f64()).map(StackVal::from_f64),
    }
}

fn binary_i4(op: BinOp, a: i32, b: i32) -> ArithResult {
    let (ua, ub) = (a as u32, b as u32);
    let result = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(ExceptionKind::DivideByZero);
            }
            a.checked_div(b).ok_or(ExceptionKind::Overflow)?
        }
        BinOp::DivUn => {
            if ub == 0 {
                return Err(ExceptionKind::DivideByZero);
            }
            (ua / ub) as i32
        }
        BinOp::Rem => {
            if b == 0 {
                return Err(ExceptionKind::DivideByZero);
            }
            a.checked_rem(b).ok_or(ExceptionKind::Overflow)?
        }
        BinOp::RemUn => {
            if ub == 0 {
                return Err(ExceptionKind::DivideByZero);
            }
            (ua % ub) as i32
        }
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(ub & 31),
        BinOp::Shr => a.wrapping_shr(ub & 31),
        BinOp::ShrUn => ua.wrapping_shr(ub & 31) as i32,
        BinOp::AddOvf => a.checked_add(b).ok_or(ExceptionKind::Overflow)?,
        BinOp::AddOvfUn => ua.checked_add(ub).ok_or(ExceptionKind::Overflow)? as i32,
        BinOp::SubOvf => a.checked_sub(b).ok_or(ExceptionKind::Overflow)?,
        BinOp::SubOvfUn => ua.checked_sub(ub).ok_or(ExceptionKind::Overflow)? as i32,
        BinOp::MulOvf => a.checked_mul(b).ok_or(ExceptionKind::Overflow)?,
        BinOp::MulOvfUn => ua.checked_mul(ub).ok_or(ExceptionKind::Overflow)? as i32,
    };
    Ok(StackVal::from_i32(result))
}

/// `shift` is the count operand read as a 32-bit integer; shifts of 64-bit
/// values take an `int32` count.
fn binary_i8(op: BinOp, a: i64, shift: i32, b: i64) -> ArithResult {
    let (ua, ub) = (a as u64, b as u64);
    let count = shift as u32 & 63;
    let result = match op {
        BinOp::Add => a.wrapping_add(b),
        BinOp::Sub => a.wrapping_sub(b),
        BinOp::Mul => a.wrapping_mul(b),
        BinOp::Div => {
            if b == 0 {
                return Err(ExceptionKind::DivideByZero);
            }
            a.checked_div(b).ok_or(ExceptionKind::Overflow)?
        }
        BinOp::DivUn => {
            if ub == 0 {
                return Err(ExceptionKind::DivideByZero);
            }
            (ua / ub) as i64
        }
        BinOp::Rem => {
            if b == 0 {
                return Err(ExceptionKind::DivideByZero);
            }
            a.checked_rem(b).ok_or(ExceptionKind::Overflow)?
        }
        BinOp::RemUn => {
            if ub == 0 {
                return Err(ExceptionKind::DivideByZero);
            }
            (ua % ub) as i64
        }
        BinOp::And => a & b,
        BinOp::Or => a | b,
        BinOp::Xor => a ^ b,
        BinOp::Shl => a.wrapping_shl(count),
        BinOp::Shr => a.wrapping_shr(count),
        BinOp::ShrUn => ua.wrapping_shr(count) as i64,
        BinOp::AddOvf => a.checked_add(b).ok_or(ExceptionKind::Overflow)?,
        BinOp::AddOvfUn => ua.checked_add(ub).ok_or(ExceptionKind::Overflow)? as i64,
        BinOp::SubOvf => a.checked_sub(b).ok_or(ExceptionKind::Overflow)?,
        BinOp::SubOvfUn => ua.checked_sub(ub).ok_or(ExceptionKind::Overflow)? as i64,
        BinOp::MulOvf => a.checked_mul(b).ok_or(ExceptionKind::Overflow)?,
        BinOp::MulOvfUn => ua.checked_mul(ub).ok_or(ExceptionKind::Overflow)? as i64,
    };
    Ok(StackVal::from_i64(result))
}

fn binary_float(op: BinOp, a: f64, b: f64) -> Result<f64, ExceptionKind> {
    match op {
        BinOp::Add => Ok(a + b),
        BinOp::Sub => Ok(a - b),
        BinOp::Mul => Ok(a * b),
        BinOp::Div => Ok(a / b),
        // fmod semantics, like C.
        BinOp::Rem => Ok(a % b),
        _ => Err(ExceptionKind::InvalidProgram),
    }
}

pub(crate) fn unary(op: UnOp, ty: NumTy, a: StackVal) -> ArithResult {
    match (op, ty) {
        (UnOp::Neg, NumTy::I4) => Ok(StackVal::from_i32(a.as_i32().wrapping_neg())),
        (UnOp::Neg, NumTy::I8) => Ok(StackVal::from_i64(a.as_i64().wrapping_neg())),
        (UnOp::Neg, NumTy::R4) => Ok(StackVal::from_f32(-a.as_f32())),
        (UnOp::Neg, NumTy::R8) => Ok(StackVal::from_f64(-a.as_f64())),
        (UnOp::Not, NumTy::I4) => Ok(StackVal::from_i32(!a.as_i32())),
        (UnOp::Not, NumTy::I8) => Ok(StackVal::from_i64(!a.as_i64())),
        (UnOp::Not, _) => Err(ExceptionKind::InvalidProgram),
    }
}

/// Raises arithmetic for NaN and infinities; the value is left in place.
pub(crate) fn ckfinite(ty: NumTy, a: StackVal) -> Result<(), ExceptionKind> {
    let finite = match ty {
        NumTy::R4 => a.as_f32().is_finite(),
        NumTy::R8 => a.as_f64().is_finite(),
        NumTy::I4 | NumTy::I8 => return Err(ExceptionKind::InvalidProgram),
    };
    if finite {
        Ok(())
    } else {
        Err(ExceptionKind::Arithmetic)
    }
}

/// Inclusive value range of an integer conversion target.
fn int_range(to: ConvTy) -> Option<(i128, i128)> {
    Some(match to {
        ConvTy::I1 => (i8::MIN as i128, i8::MAX as i128),
        ConvTy::U1 => (0, u8::MAX as i128),
        ConvTy::I2 => (i16::MIN as i128, i16::MAX as i128),
        ConvTy::U2 => (0, u16::MAX as i128),
        ConvTy::I4 => (i32::MIN as i128, i32::MAX as i128),
        ConvTy::U4 => (0, u32::MAX as i128),
        ConvTy::I8 | ConvTy::I => (i64::MIN as i128, i64::MAX as i128),
        ConvTy::U8 | ConvTy::U => (0, u64::MAX as i128),
        ConvTy::R4 | ConvTy::R8 | ConvTy::RUn => return None,
    })
}

/// Store an integer already known to be in range (or to be truncated) as
/// a cell of the target's stack type.
fn int_to_cell(to: ConvTy, v: i128) -> StackVal {
    match to {
        ConvTy::I1 => StackVal::from_i32(v as i8 as i32),
        ConvTy::U1 => StackVal::from_i32(v as u8 as i32),
        ConvTy::I2 => StackVal::from_i32(v as i16 as i32),
        ConvTy::U2 => StackVal::from_i32(v as u16 as i32),
        ConvTy::I4 | ConvTy::U4 => StackVal::from_i32(v as i32),
        ConvTy::I8 | ConvTy::U8 | ConvTy::I | ConvTy::U => StackVal::from_i64(v as i64),
        ConvTy::R4 => StackVal::from_f32(v as f32),
        ConvTy::R8 | ConvTy::RUn => StackVal::from_f64(v as f64),
    }
}

fn float_to_cell(to: ConvTy, x: f64) -> StackVal {
    // `as` saturates and maps NaN to zero, which is as good as any choice
    // for the unspecified out-of-range cases.
    match to {
        ConvTy::I1 => StackVal::from_i32(x as i32 as i8 as i32),
        ConvTy::U1 => StackVal::from_i32(x as i32 as u8 as i32),
        ConvTy::I2 => StackVal::from_i32(x as i32 as i16 as i32),
        ConvTy::U2 => StackVal::from_i32(x as i32 as u16 as i32),
        ConvTy::I4 => StackVal::from_i32(x as i32),
        ConvTy::U4 => StackVal::from_i32(x as u32 as i32),
        ConvTy::I8 | ConvTy::I => StackVal::from_i64(x as i64),
        ConvTy::U8 | ConvTy::U => StackVal::from_i64(x as u64 as i64),
        ConvTy::R4 => StackVal::from_f32(x as f32),
        ConvTy::R8 | ConvTy::RUn => StackVal::from_f64(x),
    }
}

pub(crate) fn convert(from: NumTy, to: ConvTy, check: ConvCheck, v: StackVal) -> ArithResult {
    match from {
        NumTy::I4 | NumTy::I8 => {
            let signed = match from {
                NumTy::I4 => v.as_i32() as i128,
                _ => v.as_i64() as i128,
            };
            let unsigned = match from {
                NumTy::I4 => v.as_i32() as u32 as i128,
                _ => v.as_i64() as u64 as i128,
            };
            let source = match (check, to) {
                (ConvCheck::Unsigned, _) | (ConvCheck::None, ConvTy::RUn) => unsigned,
                // conv.u8 and conv.u of an int32 zero-extend.
                (ConvCheck::None, ConvTy::U8 | ConvTy::U) if from == NumTy::I4 => unsigned,
                _ => signed,
            };
            if check != ConvCheck::None {
                if let Some((min, max)) = int_range(to) {
                    if source < min || source > max {
                        return Err(ExceptionKind::Overflow);
                    }
                }
            }
            Ok(int_to_cell(to, source))
        }
        NumTy::R4 | NumTy::R8 => {
            let x = match from {
                NumTy::R4 => v.as_f32() as f64,
                _ => v.as_f64(),
            };
            if check != ConvCheck::None {
                if let Some((min, max)) = int_range(to) {
                    let t = x.trunc();
                    if x.is_nan() || t < min as f64 || t >= max as f64 + 1.0 {
                        return Err(ExceptionKind::Overflow);
                    }
                }
            }
            Ok(float_to_cell(to, x))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i4(v: i32) -> StackVal {
        StackVal::from_i32(v)
    }

    fn i8v(v: i64) -> StackVal {
        StackVal::from_i64(v)
    }

    const I4_SAMPLES: [i32; 9] = [0, 1, -1, 2, 7, i32::MAX, i32::MIN, i32::MAX - 1, i32::MIN + 1];
    const I8_SAMPLES: [i64; 8] = [0, 1, -1, 3, i64::MAX, i64::MIN, 1 << 32, -(1 << 40)];

    /// `op` overflows exactly when the widened result is out of range, and
    /// otherwise agrees bit for bit with `plain`.
    fn check_ovf_i4(op: BinOp, plain: BinOp, exact: fn(i128, i128) -> i128, unsigned: bool) {
        for &a in &I4_SAMPLES {
            for &b in &I4_SAMPLES {
                let (wa, wb) = if unsigned {
                    (a as u32 as i128, b as u32 as i128)
                } else {
                    (a as i128, b as i128)
                };
                let r = exact(wa, wb);
                let fits = if unsigned {
                    (0..=u32::MAX as i128).contains(&r)
                } else {
                    (i32::MIN as i128..=i32::MAX as i128).contains(&r)
                };
                let got = binary(op, NumTy::I4, i4(a), i4(b));
                if fits {
                    assert_eq!(got, binary(plain, NumTy::I4, i4(a), i4(b)), "{op:?} {a} {b}");
                } else {
                    assert_eq!(got, Err(ExceptionKind::Overflow), "{op:?} {a} {b}");
                }
            }
        }
    }

    fn check_ovf_i8(op: BinOp, plain: BinOp, exact: fn(i128, i128) -> Option<i128>, unsigned: bool) {
        for &a in &I8_SAMPLES {
            for &b in &I8_SAMPLES {
                let (wa, wb) = if unsigned {
                    (a as u64 as i128, b as u64 as i128)
                } else {
                    (a as i128, b as i128)
                };
                let fits = exact(wa, wb).is_some_and(|r| {
                    if unsigned {
                        (0..=u64::MAX as i128).contains(&r)
                    } else {
                        (i64::MIN as i128..=i64::MAX as i128).contains(&r)
                    }
                });
                let got = binary(op, NumTy::I8, i8v(a), i8v(b));
                if fits {
                    assert_eq!(got, binary(plain, NumTy::I8, i8v(a), i8v(b)), "{op:?} {a} {b}");
                } else {
                    assert_eq!(got, Err(ExceptionKind::Overflow), "{op:?} {a} {b}");
                }
            }
        }
    }

    #[test]
    fn overflow_ops_32bit() {
        check_ovf_i4(BinOp::AddOvf, BinOp::Add, |a, b| a + b, false);
        check_ovf_i4(BinOp::AddOvfUn, BinOp::Add, |a, b| a + b, true);
        check_ovf_i4(BinOp::SubOvf, BinOp::Sub, |a, b| a - b, false);
        check_ovf_i4(BinOp::SubOvfUn, BinOp::Sub, |a, b| a - b, true);
        check_ovf_i4(BinOp::MulOvf, BinOp::Mul, |a, b| a * b, false);
        check_ovf_i4(BinOp::MulOvfUn, BinOp::Mul, |a, b| a * b, true);
    }

    #[test]
    fn overflow_ops_64bit() {
        check_ovf_i8(BinOp::AddOvf, BinOp::Add, |a, b| a.checked_add(b), false);
        check_ovf_i8(BinOp::AddOvfUn, BinOp::Add, |a, b| a.checked_add(b), true);
        check_ovf_i8(BinOp::SubOvf, BinOp::Sub, |a, b| a.checked_sub(b), false);
        check_ovf_i8(BinOp::SubOvfUn, BinOp::Sub, |a, b| a.checked_sub(b), true);
        check_ovf_i8(BinOp::MulOvf, BinOp::Mul, |a, b| a.checked_mul(b), false);
        check_ovf_i8(BinOp::MulOvfUn, BinOp::Mul, |a, b| a.checked_mul(b), true);
    }

    #[test]
    fn division_faults() {
        assert_eq!(binary(BinOp::Div, NumTy::I4, i4(1), i4(0)), Err(ExceptionKind::DivideByZero));
        assert_eq!(binary(BinOp::RemUn, NumTy::I4, i4(1), i4(0)), Err(ExceptionKind::DivideByZero));
        assert_eq!(
            binary(BinOp::Div, NumTy::I4, i4(i32::MIN), i4(-1)),
            Err(ExceptionKind::Overflow)
        );
        assert_eq!(
            binary(BinOp::Rem, NumTy::I4, i4(i32::MIN), i4(-1)),
            Err(ExceptionKind::Overflow)
        );
        assert_eq!(
            binary(BinOp::Div, NumTy::I8, i8v(i64::MIN), i8v(-1)),
            Err(ExceptionKind::Overflow)
        );
        assert_eq!(binary(BinOp::DivUn, NumTy::I4, i4(-2), i4(2)), Ok(i4(i32::MAX)));
        assert_eq!(binary(BinOp::Rem, NumTy::I4, i4(-7), i4(2)), Ok(i4(-1)));
    }

    #[test]
    fn float_division_never_faults() {
        let r = binary(BinOp::Div, NumTy::R8, StackVal::from_f64(1.0), StackVal::from_f64(0.0));
        assert_eq!(r.unwrap().as_f64(), f64::INFINITY);
        let r = binary(BinOp::Rem, NumTy::R8, StackVal::from_f64(5.5), StackVal::from_f64(2.0));
        assert_eq!(r.unwrap().as_f64(), 1.5);
    }

    #[test]
    fn shifts_mask_their_count() {
        assert_eq!(binary(BinOp::Shl, NumTy::I4, i4(1), i4(33)), Ok(i4(2)));
        assert_eq!(binary(BinOp::Shr, NumTy::I4, i4(-8), i4(1)), Ok(i4(-4)));
        assert_eq!(binary(BinOp::ShrUn, NumTy::I4, i4(-8), i4(28)), Ok(i4(0xf)));
        assert_eq!(binary(BinOp::Shl, NumTy::I8, i8v(1), i4(65)), Ok(i8v(2)));
        assert_eq!(binary(BinOp::ShrUn, NumTy::I8, i8v(-1), i4(60)), Ok(i8v(0xf)));
    }

    #[test]
    fn r4_arithmetic_stays_single_precision() {
        let r = binary(BinOp::Add, NumTy::R4, StackVal::from_f32(0.1), StackVal::from_f32(0.2));
        assert_eq!(r.unwrap().as_f32(), 0.1f32 + 0.2f32);
    }

    #[test]
    fn ckfinite_rejects_nan_and_infinity() {
        assert_eq!(ckfinite(NumTy::R8, StackVal::from_f64(1.0)), Ok(()));
        assert_eq!(
            ckfinite(NumTy::R8, StackVal::from_f64(f64::NAN)),
            Err(ExceptionKind::Arithmetic)
        );
        assert_eq!(
            ckfinite(NumTy::R4, StackVal::from_f32(f32::NEG_INFINITY)),
            Err(ExceptionKind::Arithmetic)
        );
    }

    #[test]
    fn unchecked_conversions_truncate() {
        assert_eq!(convert(NumTy::I4, ConvTy::I1, ConvCheck::None, i4(0x1ff)), Ok(i4(-1)));
        assert_eq!(convert(NumTy::I4, ConvTy::U2, ConvCheck::None, i4(-1)), Ok(i4(0xffff)));
        assert_eq!(convert(NumTy::I4, ConvTy::I8, ConvCheck::None, i4(-1)), Ok(i8v(-1)));
        assert_eq!(
            convert(NumTy::I4, ConvTy::U8, ConvCheck::None, i4(-1)),
            Ok(i8v(u32::MAX as i64))
        );
        assert_eq!(convert(NumTy::I8, ConvTy::I4, ConvCheck::None, i8v(1 << 32 | 5)), Ok(i4(5)));
        let r = convert(NumTy::I4, ConvTy::RUn, ConvCheck::None, i4(-1)).unwrap();
        assert_eq!(r.as_f64(), u32::MAX as f64);
        let r = convert(NumTy::R8, ConvTy::I4, ConvCheck::None, StackVal::from_f64(-2.9)).unwrap();
        assert_eq!(r, i4(-2));
    }

    #[test]
    fn checked_conversions() {
        assert_eq!(
            convert(NumTy::I4, ConvTy::U1, ConvCheck::Signed, i4(256)),
            Err(ExceptionKind::Overflow)
        );
        assert_eq!(convert(NumTy::I4, ConvTy::U1, ConvCheck::Signed, i4(255)), Ok(i4(255)));
        assert_eq!(
            convert(NumTy::I4, ConvTy::U4, ConvCheck::Signed, i4(-1)),
            Err(ExceptionKind::Overflow)
        );
        // Read as unsigned, -1 is u32::MAX which does not fit an int32.
        assert_eq!(
            convert(NumTy::I4, ConvTy::I4, ConvCheck::Unsigned, i4(-1)),
            Err(ExceptionKind::Overflow)
        );
        assert_eq!(
            convert(NumTy::I4, ConvTy::U4, ConvCheck::Unsigned, i4(-1)),
            Ok(i4(-1))
        );
        assert_eq!(
            convert(NumTy::I8, ConvTy::I4, ConvCheck::Signed, i8v(i32::MIN as i64)),
            Ok(i4(i32::MIN))
        );
    }

    #[test]
    fn checked_float_conversions() {
        let f = StackVal::from_f64;
        assert_eq!(convert(NumTy::R8, ConvTy::I4, ConvCheck::Signed, f(2147483647.9)), Ok(i4(i32::MAX)));
        assert_eq!(
            convert(NumTy::R8, ConvTy::I4, ConvCheck::Signed, f(2147483648.0)),
            Err(ExceptionKind::Overflow)
        );
        assert_eq!(convert(NumTy::R8, ConvTy::U1, ConvCheck::Signed, f(-0.5)), Ok(i4(0)));
        assert_eq!(
            convert(NumTy::R8, ConvTy::I8, ConvCheck::Signed, f(9.223372036854775807e18)),
            Err(ExceptionKind::Overflow)
        );
        assert_eq!(
            convert(NumTy::R8, ConvTy::I8, ConvCheck::Signed, f(-9.223372036854775808e18)),
            Ok(i8v(i64::MIN))
        );
        assert_eq!(
            convert(NumTy::R8, ConvTy::I4, ConvCheck::Signed, f(f64::NAN)),
            Err(ExceptionKind::Overflow)
        );
    }
}
