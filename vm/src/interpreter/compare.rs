use bytecode::{Cond, NumTy};

use crate::stackval::StackVal;

/// Evaluate `a <cond> b` on two cells of stack type `ty`.
///
/// Float comparisons with a NaN operand yield the condition's unordered
/// result: true for the `Un` forms, false otherwise.
pub(crate) fn compare(cond: Cond, ty: NumTy, a: StackVal, b: StackVal) -> bool {
    match ty {
        NumTy::I4 => {
            if cond.is_unsigned() {
                ordered(cond, &(a.as_i32() as u32), &(b.as_i32() as u32))
            } else {
                ordered(cond, &a.as_i32(), &b.as_i32())
            }
        }
        NumTy::I8 => {
            if cond.is_unsigned() {
                ordered(cond, &(a.as_i64() as u64), &(b.as_i64() as u64))
            } else {
                ordered(cond, &a.as_i64(), &b.as_i64())
            }
        }
        NumTy::R4 => float(cond, a.as_f32() as f64, b.as_f32() as f64),
        NumTy::R8 => float(cond, a.as_f64(), b.as_f64()),
    }
}

fn float(cond: Cond, a: f64, b: f64) -> bool {
    if a.is_nan() || b.is_nan() {
        return cond.unordered_result();
    }
    ordered(cond, &a, &b)
}

fn ordered<T: PartialOrd>(cond: Cond, a: &T, b: &T) -> bool {
    match cond {
        Cond::Eq => a == b,
        Cond::NeUn => a != b,
        Cond::Gt | Cond::GtUn => a > b,
        Cond::Ge | Cond::GeUn => a >= b,
        Cond::Lt | Cond::LtUn => a < b,
        Cond::Le | Cond::LeUn => a <= b,
    }
}

/// Truth of a single cell for `brtrue`/`brfalse`.
pub(crate) fn is_true(ty: NumTy, v: StackVal) -> bool {
    match ty {
        NumTy::I4 => v.as_i32() != 0,
        NumTy::I8 => v.as_i64() != 0,
        NumTy::R4 => v.as_f32() != 0.0,
        NumTy::R8 => v.as_f64() != 0.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nan_comparisons_follow_the_unordered_rule() {
        let nan = StackVal::from_f64(f64::NAN);
        let one = StackVal::from_f64(1.0);
        for &cond in Cond::ALL {
            assert_eq!(compare(cond, NumTy::R8, nan, one), cond.unordered_result(), "{cond:?}");
            assert_eq!(compare(cond, NumTy::R8, one, nan), cond.unordered_result(), "{cond:?}");
        }
        let nan4 = StackVal::from_f32(f32::NAN);
        assert!(!compare(Cond::Eq, NumTy::R4, nan4, nan4));
        assert!(compare(Cond::NeUn, NumTy::R4, nan4, nan4));
    }

    #[test]
    fn unsigned_integer_comparisons() {
        let minus_one = StackVal::from_i32(-1);
        let one = StackVal::from_i32(1);
        assert!(compare(Cond::Lt, NumTy::I4, minus_one, one));
        assert!(compare(Cond::GtUn, NumTy::I4, minus_one, one));
        assert!(!compare(Cond::LtUn, NumTy::I8, StackVal::from_i64(-1), StackVal::from_i64(1)));
        assert!(compare(Cond::NeUn, NumTy::I4, minus_one, one));
    }

    #[test]
    fn ordered_float_comparisons() {
        let a = StackVal::from_f64(-0.0);
        let b = StackVal::from_f64(0.0);
        assert!(compare(Cond::Eq, NumTy::R8, a, b));
        assert!(compare(Cond::LeUn, NumTy::R8, a, b));
        assert!(!compare(Cond::Gt, NumTy::R8, a, b));
    }

    #[test]
    fn truth_of_cells() {
        assert!(!is_true(NumTy::I4, StackVal::from_i64(1 << 32)));
        assert!(is_true(NumTy::I8, StackVal::from_i64(1 << 32)));
        assert!(!is_true(NumTy::R8, StackVal::from_f64(-0.0)));
        assert!(is_true(NumTy::R4, StackVal::from_f32(f32::NAN)));
    }
}
