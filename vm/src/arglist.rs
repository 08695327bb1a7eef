//! The variable-argument block of vararg calls.
//!
//! A vararg call site copies its variable arguments into a block on the
//! caller's vt stack and passes the block's address as a hidden last
//! argument. The block starts with a pointer to the call-site signature,
//! followed by each variable argument as native data, every value padded
//! to 8 bytes.

use std::sync::Arc;

use object::{Metadata, MetadataError, Signature, TypeRef};

use crate::marshal::ValueRepr;
use crate::stackval::StackVal;

const HEADER_SIZE: usize = 8;

/// Bytes the block of `sig` occupies.
pub(crate) fn block_size(meta: &Metadata, sig: &Signature) -> Result<usize, MetadataError> {
    sig.var_params().iter().try_fold(HEADER_SIZE, |size, ty| {
        Ok(size + ValueRepr::of(meta, ty, false)?.size().next_multiple_of(8))
    })
}

/// Write the block for `values`, the variable arguments of a call through
/// `sig`, at `dst`.
///
/// # Safety
///
/// `dst` must be 8-aligned and writable for [`block_size`] bytes, and value
/// type cells in `values` must point at readable values.
pub(crate) unsafe fn write_block(
    meta: &Metadata,
    sig: &Arc<Signature>,
    values: &[StackVal],
    dst: *mut u8,
) -> Result<(), MetadataError> {
    unsafe {
        dst.cast::<*const Signature>().write(Arc::as_ptr(sig));
        let mut cursor = dst.add(HEADER_SIZE);
        for (ty, value) in sig.var_params().iter().zip(values) {
            let repr = ValueRepr::of(meta, ty, false)?;
            repr.store(value, cursor);
            cursor = cursor.add(repr.size().next_multiple_of(8));
        }
    }
    Ok(())
}

/// Reads the variable arguments of the running vararg method, as pushed by
/// `ARGLIST`.
#[derive(Debug)]
pub struct ArgIterator {
    sig: *const Signature,
    cursor: *const u8,
    index: usize,
}

impl ArgIterator {
    /// # Safety
    ///
    /// `handle` must be the cell `ARGLIST` pushed, and the vararg call it
    /// belongs to must still be running.
    pub unsafe fn new(handle: StackVal) -> Self {
        let block = handle.as_ptr::<u8>();
        Self {
            sig: unsafe { block.cast::<*const Signature>().read() },
            cursor: block.wrapping_add(HEADER_SIZE),
            index: 0,
        }
    }

    /// The call-site signature of the running call.
    pub fn signature(&self) -> &Signature {
        // SAFETY: the call site keeps its signature alive while the call
        // runs.
        unsafe { &*self.sig }
    }

    pub fn remaining(&self) -> usize {
        self.signature().var_params().len() - self.index
    }

    /// The next variable argument and its type. Value-type arguments come
    /// back as a cell pointing into the block.
    pub fn next_arg(&mut self, meta: &Metadata) -> Option<Result<(TypeRef, StackVal), MetadataError>> {
        let ty = *self.signature().var_params().get(self.index)?;
        let repr = match ValueRepr::of(meta, &ty, false) {
            Ok(repr) => repr,
            Err(err) => return Some(Err(err)),
        };
        let mut value = StackVal::ZERO;
        if repr.is_value_type() {
            value = StackVal::from_ptr(self.cursor);
        } else {
            // SAFETY: the block holds a value of this type at the cursor.
            unsafe { repr.load(&mut value, self.cursor) };
        }
        self.cursor = self.cursor.wrapping_add(repr.size().next_multiple_of(8));
        self.index += 1;
        Some(Ok((ty, value)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trips_variable_arguments() {
        let meta = Metadata::new().unwrap();
        let sig = Arc::new(
            Signature::new(vec![TypeRef::I4, TypeRef::I1, TypeRef::R8, TypeRef::I8], TypeRef::VOID)
                .vararg_call(1),
        );
        let size = block_size(&meta, &sig).unwrap();
        assert_eq!(size, 8 + 3 * 8);

        let mut block = vec![0u64; size / 8];
        let values = [
            StackVal::from_i32(-3),
            StackVal::from_f64(2.5),
            StackVal::from_i64(1 << 40),
        ];
        unsafe { write_block(&meta, &sig, &values, block.as_mut_ptr().cast()).unwrap() };

        let mut args = unsafe { ArgIterator::new(StackVal::from_ptr(block.as_ptr())) };
        assert_eq!(args.remaining(), 3);
        let (ty, value) = args.next_arg(&meta).unwrap().unwrap();
        assert_eq!(ty, TypeRef::I1);
        assert_eq!(value.as_i32(), -3);
        let (_, value) = args.next_arg(&meta).unwrap().unwrap();
        assert_eq!(value.as_f64(), 2.5);
        let (_, value) = args.next_arg(&meta).unwrap().unwrap();
        assert_eq!(value.as_i64(), 1 << 40);
        assert!(args.next_arg(&meta).is_none());
        assert_eq!(args.remaining(), 0);
    }
}
