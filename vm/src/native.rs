//! Calls from interpreted code into native functions.

use crate::error::NativeFault;
use crate::marshal::ValueRepr;

/// Calls a native function through the platform C ABI.
pub trait NativeBridge: Send + Sync {
    /// Call the function at `addr`. `args` holds one pointer to native
    /// argument data per entry of `params`; the result is written to `ret`.
    ///
    /// # Safety
    ///
    /// `addr` must be a C function taking `params` and returning `ret_repr`,
    /// every argument pointer must be readable for its parameter's size and
    /// `ret` must be writable for at least 8 bytes and the return size.
    unsafe fn call(
        &self,
        addr: usize,
        params: &[ValueRepr],
        ret_repr: ValueRepr,
        args: &[*mut u8],
        ret: *mut u8,
    ) -> Result<(), NativeFault>;
}

/// The bridge of builds without native call support.
#[derive(Debug, Default)]
pub struct NoNativeBridge;

impl NativeBridge for NoNativeBridge {
    unsafe fn call(
        &self,
        _addr: usize,
        _params: &[ValueRepr],
        _ret_repr: ValueRepr,
        _args: &[*mut u8],
        _ret: *mut u8,
    ) -> Result<(), NativeFault> {
        Err(NativeFault::Unavailable)
    }
}

/// The default bridge for this build.
pub fn default_bridge() -> Box<dyn NativeBridge> {
    #[cfg(feature = "ffi")]
    {
        Box::new(ffi::FfiBridge)
    }
    #[cfg(not(feature = "ffi"))]
    {
        Box::new(NoNativeBridge)
    }
}

#[cfg(feature = "ffi")]
pub use ffi::FfiBridge;

#[cfg(feature = "ffi")]
mod ffi {
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::ffi::c_void;

    use libffi::middle::{Cif, CodePtr, Type};
    use libffi::raw;

    use super::NativeBridge;
    use crate::error::NativeFault;
    use crate::marshal::ValueRepr;

    type CifCacheKey = (Vec<ValueRepr>, ValueRepr);

    thread_local! {
        static TLS_CIF_CACHE: RefCell<HashMap<CifCacheKey, Cif>> = RefCell::new(HashMap::new());
    }

    fn with_thread_local_cif<R>(
        key: CifCacheKey,
        build: impl FnOnce() -> Cif,
        use_cif: impl FnOnce(&Cif) -> R,
    ) -> R {
        TLS_CIF_CACHE.with(|cache| {
            let mut map = cache.borrow_mut();
            let cif = map.entry(key).or_insert_with(build);
            use_cif(cif)
        })
    }

    fn ffi_type(repr: ValueRepr) -> Result<Type, NativeFault> {
        Ok(match repr {
            ValueRepr::Void => Type::void(),
            ValueRepr::Bool | ValueRepr::U1 => Type::u8(),
            ValueRepr::I1 => Type::i8(),
            ValueRepr::I2 => Type::i16(),
            ValueRepr::U2 => Type::u16(),
            ValueRepr::I4 => Type::i32(),
            ValueRepr::U4 => Type::u32(),
            ValueRepr::I8 => Type::i64(),
            ValueRepr::R4 => Type::f32(),
            ValueRepr::R8 => Type::f64(),
            ValueRepr::Ptr | ValueRepr::Object => Type::pointer(),
            ValueRepr::ValueType(size) => {
                return Err(NativeFault::Unmarshalable {
                    ty: format!("a {size}-byte struct"),
                });
            }
        })
    }

    /// Native calls through libffi.
    #[derive(Debug, Default)]
    pub struct FfiBridge;

    impl NativeBridge for FfiBridge {
        unsafe fn call(
            &self,
            addr: usize,
            params: &[ValueRepr],
            ret_repr: ValueRepr,
            args: &[*mut u8],
            ret: *mut u8,
        ) -> Result<(), NativeFault> {
            let param_types = params
                .iter()
                .map(|&repr| ffi_type(repr))
                .collect::<Result<Vec<_>, _>>()?;
            let ret_type = ffi_type(ret_repr)?;
            let code = CodePtr(addr as *mut c_void);
            let mut raw_args: Vec<*mut c_void> = args.iter().map(|&arg| arg.cast()).collect();
            with_thread_local_cif(
                (params.to_vec(), ret_repr),
                || Cif::new(param_types, ret_type),
                |cif| unsafe {
                    raw::ffi_call(
                        cif.as_raw_ptr(),
                        Some(*code.as_safe_fun()),
                        ret.cast::<c_void>(),
                        raw_args.as_mut_ptr(),
                    );
                },
            );
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::stackval::StackVal;

        extern "C" fn add3(a: i32, b: i8, c: f64) -> f64 {
            a as f64 + b as f64 + c
        }

        #[test]
        fn calls_a_c_function() {
            let mut a = StackVal::from_i32(40);
            let mut b = StackVal::from_i32(-2);
            let mut c = StackVal::from_f64(0.5);
            let args = [
                ValueRepr::I4.data_addr(&mut a),
                ValueRepr::I1.data_addr(&mut b),
                ValueRepr::R8.data_addr(&mut c),
            ];
            let mut ret = StackVal::ZERO;
            unsafe {
                FfiBridge
                    .call(
                        add3 as usize,
                        &[ValueRepr::I4, ValueRepr::I1, ValueRepr::R8],
                        ValueRepr::R8,
                        &args,
                        std::ptr::from_mut(&mut ret).cast(),
                    )
                    .unwrap();
            }
            assert_eq!(ret.as_f64(), 38.5);
        }

        #[test]
        fn structs_are_rejected() {
            let err = unsafe {
                FfiBridge.call(0, &[ValueRepr::ValueType(12)], ValueRepr::Void, &[], std::ptr::null_mut())
            };
            assert!(matches!(err, Err(NativeFault::Unmarshalable { .. })));
        }
    }
}
