//! Entry into managed code from Rust and from native code.

use std::slice;

use object::{ExceptionKind, MethodId};

use crate::Domain;
use crate::context::{ResumeState, ResumeTarget, ThreadContext, with_context};
use crate::error::{InvokeError, fatal};
use crate::interpreter::invoke_target;
use crate::marshal::ValueRepr;
use crate::method::InterpMethod;
use crate::stackval::StackVal;

impl Domain {
    /// Run `method` on the current thread with `args` (`this` first) and
    /// return its result. Value-type results come back boxed.
    pub fn invoke(&self, method: MethodId, args: &[StackVal]) -> Result<StackVal, InvokeError> {
        let target = self.interp_method(method)?;
        if args.len() != target.arg_cells() {
            return Err(InvokeError::ArgumentCount {
                expected: target.arg_cells(),
                found: args.len(),
            });
        }
        with_context(|ctx| {
            let _domain = ctx.enter_domain(self);
            let mut cells = args.to_vec();
            let mut storage = Vec::new();
            let mut retval = StackVal::ZERO;
            if let ValueRepr::ValueType(size) = target.ret_repr {
                storage = vec![0u64; size.div_ceil(8).max(1)];
                retval = StackVal::from_ptr(storage.as_mut_ptr());
            }
            self.run_entry(ctx, &target, cells.as_mut_ptr(), &mut retval)?;
            if !target.ret_repr.is_value_type() {
                return Ok(retval);
            }

            let meta = self.metadata();
            let Some(class) = meta
                .class_of(&target.sig.ret)
                .and_then(|id| meta.class(id).ok())
            else {
                return Err(InvokeError::Exception(
                    self.create_exception(ExceptionKind::NotSupported),
                ));
            };
            // SAFETY: storage holds the returned value of this class.
            let boxed = unsafe { self.heap().box_value(&class, storage.as_ptr().cast()) }
                .map_err(|_| InvokeError::Exception(self.oom))?;
            Ok(StackVal::from_obj(boxed))
        })
    }

    /// Run `method` with arguments and result in native layout, as compiled
    /// code and native callbacks hold them.
    ///
    /// # Safety
    ///
    /// Each pointer in `args` must point at a value of the corresponding
    /// argument's type, and `ret` must be writable for the return type
    /// (ignored for void methods).
    pub unsafe fn interp_entry(
        &self,
        method: MethodId,
        args: &[*mut u8],
        ret: *mut u8,
    ) -> Result<(), InvokeError> {
        let target = self.interp_method(method)?;
        if args.len() != target.arg_cells() {
            return Err(InvokeError::ArgumentCount {
                expected: target.arg_cells(),
                found: args.len(),
            });
        }
        with_context(|ctx| {
            let _domain = ctx.enter_domain(self);
            let mut cells: Vec<StackVal> = target
                .arg_reprs
                .iter()
                .zip(args)
                .map(|(repr, &data)| {
                    let mut cell = StackVal::ZERO;
                    if repr.is_value_type() {
                        cell = StackVal::from_ptr(data);
                    } else {
                        unsafe { repr.load(&mut cell, data) };
                    }
                    cell
                })
                .collect();
            let mut retval = StackVal::ZERO;
            if target.ret_repr.is_value_type() {
                retval = StackVal::from_ptr(ret);
            }
            self.run_entry(ctx, &target, cells.as_mut_ptr(), &mut retval)?;
            if target.returns_value() && !target.ret_repr.is_value_type() {
                unsafe { target.ret_repr.store(&retval, ret) };
            }
            Ok(())
        })
    }

    /// Call `target` as the outermost frame of a new entry and turn an
    /// exception that nothing handled into an error.
    fn run_entry(
        &self,
        ctx: &ThreadContext,
        target: &std::sync::Arc<InterpMethod>,
        args: *mut StackVal,
        retval: *mut StackVal,
    ) -> Result<(), InvokeError> {
        if let Err(raise) = invoke_target(ctx, self, None, target, args, retval, true) {
            return Err(InvokeError::Exception(self.materialize(raise)));
        }
        match ctx.take_resume_state() {
            None => Ok(()),
            Some(ResumeState {
                target: ResumeTarget::Unhandled,
                exception,
            }) => {
                log::debug!(
                    "{} ended with unhandled exception {exception:?}",
                    target.full_name()
                );
                Err(InvokeError::Exception(exception))
            }
            Some(state) => fatal(format_args!(
                "entry to {} returned with resume state {state:?}",
                target.full_name()
            )),
        }
    }
}

/// Re-enter the interpreter from native code that interpreted code called
/// on this thread, using the domain that code runs in.
///
/// # Safety
///
/// `args` must point at one native data pointer per argument of `method`
/// (`this` first), each valid as for [`Domain::interp_entry`], and `ret`
/// must be writable for the return type.
pub unsafe fn reenter(
    method: MethodId,
    args: *const *mut u8,
    ret: *mut u8,
) -> Result<(), InvokeError> {
    with_context(|ctx| {
        let Some(domain) = ctx.current_domain() else {
            return Err(InvokeError::NoDomain);
        };
        let count = domain.interp_method(method)?.arg_cells();
        let args = if count == 0 {
            &[][..]
        } else {
            unsafe { slice::from_raw_parts(args, count) }
        };
        unsafe { domain.interp_entry(method, args, ret) }
    })
}
