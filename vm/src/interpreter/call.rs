//! Calls: managed, compiled, native and internal targets.

use std::{ptr, slice, sync::Arc};

use object::{CompiledEntry, ExceptionKind, ObjRef};

use super::{Interp, align8, alloc_memory, exec_method_full, non_null};
use crate::Domain;
use crate::arglist;
use crate::context::ThreadContext;
use crate::dispatch::resolve_virtual;
use crate::error::NativeFault;
use crate::exception::Raise;
use crate::frame::InterpFrame;
use crate::marshal::ValueRepr;
use crate::method::{InterpMethod, MethodKind};
use crate::monitor::MonitorGuard;
use crate::stackval::StackVal;

/// Run `f` with `parent` registered as a transition frame, so frame walks
/// from code that does not run on the interpreter still find it.
fn with_transition<R>(
    ctx: &ThreadContext,
    parent: Option<&InterpFrame<'_>>,
    f: impl FnOnce() -> R,
) -> R {
    if let Some(parent) = parent {
        ctx.push_transition(parent);
    }
    let result = f();
    if parent.is_some() {
        ctx.pop_transition();
    }
    result
}

fn enter_monitor(
    domain: &Domain,
    target: &InterpMethod,
    args: *mut StackVal,
) -> Result<MonitorGuard, Raise> {
    let monitor = if target.hasthis && !target.class.is_valuetype() {
        let this = non_null(unsafe { *args }.as_obj())?;
        // SAFETY: non-null receivers are live objects.
        unsafe { domain.monitors.for_object(this) }
    } else {
        domain.monitors.for_class(target.class.id)
    };
    Ok(MonitorGuard::enter(monitor))
}

/// Call `target` with the argument cells at `args`, writing the result to
/// `retval`. For value-type results `retval` must already point at storage
/// for the value.
///
/// A managed exception that nothing in the callee handles does not come
/// back as an error: it leaves a resume state for the caller's frames.
pub(crate) fn invoke_target(
    ctx: &ThreadContext,
    domain: &Domain,
    parent: Option<&InterpFrame<'_>>,
    target: &Arc<InterpMethod>,
    args: *mut StackVal,
    retval: *mut StackVal,
    boundary: bool,
) -> Result<(), Raise> {
    domain
        .stats()
        .calls
        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    let _monitor = if target.is_synchronized() {
        Some(enter_monitor(domain, target, args)?)
    } else {
        None
    };

    match target.kind {
        MethodKind::Interpreted => {
            if let Err(err) = domain.transformed(target) {
                log::warn!("{err}");
                return Err(Raise::Kind(ExceptionKind::InvalidProgram));
            }
            let frame = InterpFrame::new(
                ctx.next_frame_id(),
                target.clone(),
                parent,
                args,
                retval,
                boundary,
            );
            exec_method_full(&frame, ctx, domain, None);
            Ok(())
        }
        MethodKind::Compiled(entry) => call_compiled(ctx, parent, target, entry, args, retval),
        MethodKind::Pinvoke(addr) => call_pinvoke(ctx, domain, parent, target, addr, args, retval),
        MethodKind::Internal => {
            let Some(internal) = domain.internal(target.id()) else {
                log::warn!("no internal implementation for {}", target.full_name());
                return Err(Raise::Kind(ExceptionKind::NotSupported));
            };
            // SAFETY: the caller passes arg_cells cells, and the return cell
            // lies outside them.
            let (args, retval) = unsafe {
                (slice::from_raw_parts(args, target.arg_cells()), &mut *retval)
            };
            with_transition(ctx, parent, || internal(domain, args, retval))
        }
        MethodKind::Abstract => {
            log::warn!("call to abstract method {}", target.full_name());
            Err(Raise::Kind(ExceptionKind::ExecutionEngine))
        }
    }
}

fn call_compiled(
    ctx: &ThreadContext,
    parent: Option<&InterpFrame<'_>>,
    target: &InterpMethod,
    entry: CompiledEntry,
    args: *mut StackVal,
    retval: *mut StackVal,
) -> Result<(), Raise> {
    let arg_ptrs: Vec<*mut u8> = target
        .arg_reprs
        .iter()
        .enumerate()
        .map(|(i, repr)| repr.data_addr(unsafe { &*args.add(i) }))
        .collect();
    let mut buffer = StackVal::ZERO;
    let ret: *mut u8 = if target.ret_repr.is_value_type() {
        unsafe { (*retval).as_ptr() }
    } else {
        ptr::from_mut(&mut buffer).cast()
    };
    let mut exception = ObjRef::NULL;
    with_transition(ctx, parent, || unsafe {
        entry(arg_ptrs.as_ptr(), ret, &mut exception)
    });
    if !exception.is_null() {
        return Err(Raise::Object(exception));
    }
    if target.returns_value() && !target.ret_repr.is_value_type() {
        // SAFETY: the entry wrote a value of the return type to the buffer.
        unsafe { target.ret_repr.load(&mut *retval, ret) };
    }
    Ok(())
}

/// Call a native function through the domain's bridge.
///
/// # Safety
///
/// `args` must hold one cell per entry of `params`, and `retval` must point
/// at value storage when `ret_repr` is a value type.
#[allow(clippy::too_many_arguments)]
unsafe fn call_native(
    ctx: &ThreadContext,
    domain: &Domain,
    parent: Option<&InterpFrame<'_>>,
    addr: usize,
    params: &[ValueRepr],
    ret_repr: ValueRepr,
    args: *mut StackVal,
    retval: *mut StackVal,
) -> Result<(), Raise> {
    let arg_ptrs: Vec<*mut u8> = params
        .iter()
        .enumerate()
        .map(|(i, repr)| repr.data_addr(unsafe { &*args.add(i) }))
        .collect();
    let mut buffer = StackVal::ZERO;
    let ret: *mut u8 = if ret_repr.is_value_type() {
        unsafe { (*retval).as_ptr() }
    } else {
        ptr::from_mut(&mut buffer).cast()
    };
    with_transition(ctx, parent, || unsafe {
        domain.bridge().call(addr, params, ret_repr, &arg_ptrs, ret)
    })
    .map_err(|fault| {
        log::warn!("{fault}");
        Raise::Kind(ExceptionKind::NotSupported)
    })?;
    if ret_repr != ValueRepr::Void && !ret_repr.is_value_type() {
        unsafe { ret_repr.load(&mut *retval, ret) };
    }
    Ok(())
}

fn call_pinvoke(
    ctx: &ThreadContext,
    domain: &Domain,
    parent: Option<&InterpFrame<'_>>,
    target: &InterpMethod,
    addr: Option<usize>,
    args: *mut StackVal,
    retval: *mut StackVal,
) -> Result<(), Raise> {
    let Some(addr) = addr.or_else(|| target.method.native_addr()) else {
        log::warn!(
            "{}",
            NativeFault::Unbound {
                method: target.full_name()
            }
        );
        return Err(Raise::Kind(ExceptionKind::NotSupported));
    };
    let mut params = Vec::with_capacity(target.arg_cells());
    if target.hasthis {
        params.push(target.arg_reprs[0]);
    }
    params.extend_from_slice(&target.native_arg_reprs);
    // SAFETY: the caller passes one cell per argument.
    unsafe {
        call_native(
            ctx,
            domain,
            parent,
            addr,
            &params,
            target.native_ret_repr,
            args,
            retval,
        )
    }
}

impl<'a> Interp<'a> {
    /// Call `target` with the top `arg_cells` cells, replacing them with the
    /// result. `compiled` forces the call through a compiled entry.
    ///
    /// Returns whether an unwind is pending once the call is back.
    pub(super) fn call(
        &mut self,
        target: &Arc<InterpMethod>,
        arg_cells: usize,
        compiled: Option<CompiledEntry>,
    ) -> Result<bool, Raise> {
        let args_start = self.sp - arg_cells;
        let args = self.cell(args_start);
        let retval = self.cell(self.sp);
        if target.ret_repr.is_value_type() {
            unsafe { *retval = StackVal::from_ptr(self.vt_top()) };
        }
        self.frame.set_ip(self.ip);

        match compiled {
            Some(entry) => {
                self.domain
                    .stats()
                    .calls
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                call_compiled(self.ctx, Some(self.frame), target, entry, args, retval)?;
            }
            None => invoke_target(
                self.ctx,
                self.domain,
                Some(self.frame),
                target,
                args,
                retval,
                false,
            )?,
        }

        self.sp = args_start;
        if target.returns_value() {
            let value = unsafe { *retval };
            self.push(value);
        }
        Ok(self.ctx.has_resume_state())
    }

    pub(super) fn call_virtual(&mut self, item: u16) -> Result<bool, Raise> {
        let target = self.data_method(item);
        let arg_cells = target.arg_cells();
        let this_cell = self.cell(self.sp - arg_cells);
        let this = non_null(unsafe { *this_cell }.as_obj())?;
        // SAFETY: non-null receivers are live objects.
        let receiver = unsafe { this.class() };
        let resolved = resolve_virtual(self.domain, target, receiver)?;
        if receiver.is_valuetype() && resolved.class.is_valuetype() {
            // Value-type methods take `this` by reference into the box.
            unsafe { *this_cell = StackVal::from_ptr(this.data()) };
        }
        self.call(&resolved, arg_cells, None)
    }

    /// `CALLI` on a method handle pushed by `LDFTN`/`LDVIRTFTN`.
    pub(super) fn call_indirect(&mut self, sig: u16) -> Result<bool, Raise> {
        let sig = self.data_signature(sig);
        let handle = self.peek(0).as_ptr::<InterpMethod>();
        if handle.is_null() {
            return Err(Raise::Kind(ExceptionKind::NullReference));
        }
        // SAFETY: method handles point at descriptors the domain keeps alive.
        let id = unsafe { &*handle }.id();
        let target = self
            .domain
            .interp_method(id)
            .map_err(|_| Raise::Kind(ExceptionKind::ExecutionEngine))?;
        if target.param_count != sig.params.len() {
            log::warn!("calli signature does not match {}", target.full_name());
            return Err(Raise::Kind(ExceptionKind::InvalidProgram));
        }
        self.sp -= 1;
        self.call(&target, target.arg_cells(), None)
    }

    /// `CALLI` on a native function pointer.
    pub(super) fn call_native_indirect(&mut self, sig: u16) -> Result<bool, Raise> {
        let sig = self.data_signature(sig);
        let meta = self.domain.metadata();
        let addr = self.peek(0).as_ptr::<u8>() as usize;
        if addr == 0 {
            return Err(Raise::Kind(ExceptionKind::NullReference));
        }
        let mut params = Vec::with_capacity(sig.params.len() + 1);
        if sig.hasthis {
            params.push(ValueRepr::Ptr);
        }
        for param in &sig.params {
            params.push(
                ValueRepr::of(meta, param, true)
                    .map_err(|_| Raise::Kind(ExceptionKind::ExecutionEngine))?,
            );
        }
        let ret_repr = ValueRepr::of(meta, &sig.ret, true)
            .map_err(|_| Raise::Kind(ExceptionKind::ExecutionEngine))?;

        self.sp -= 1;
        let args_start = self.sp - params.len();
        let retval = self.cell(self.sp);
        if ret_repr.is_value_type() {
            unsafe { *retval = StackVal::from_ptr(self.vt_top()) };
        }
        self.frame.set_ip(self.ip);
        unsafe {
            call_native(
                self.ctx,
                self.domain,
                Some(self.frame),
                addr,
                &params,
                ret_repr,
                self.cell(args_start),
                retval,
            )?;
        }
        self.sp = args_start;
        if ret_repr != ValueRepr::Void {
            let value = unsafe { *retval };
            self.push(value);
        }
        Ok(self.ctx.has_resume_state())
    }

    /// Call a vararg method: the variable arguments move into a block on
    /// the vt stack whose address is passed as a hidden last argument.
    pub(super) fn call_vararg(&mut self, item: u16, sig: u16) -> Result<bool, Raise> {
        let target = self.data_method(item);
        let sig = self.data_signature(sig);
        let meta = self.domain.metadata();
        let var_count = sig.var_params().len();
        let size = arglist::block_size(meta, sig)
            .map_err(|_| Raise::Kind(ExceptionKind::ExecutionEngine))?;

        let values_start = self.sp - var_count;
        let block = self.vt_top();
        unsafe {
            let values = slice::from_raw_parts(self.cell(values_start), var_count);
            arglist::write_block(meta, sig, values, block)
                .map_err(|_| Raise::Kind(ExceptionKind::ExecutionEngine))?;
        }
        self.vt_sp += size;
        self.sp = values_start;
        self.push(StackVal::from_ptr(block));

        let resume = self.call(target, target.arg_cells() + 1, None)?;

        // Release the block; a value-type result sits right above it.
        self.vt_sp -= size;
        if target.ret_repr.is_value_type() && !resume {
            let result = self.peek(0).as_ptr::<u8>();
            unsafe { ptr::copy(result, block, target.ret_repr.size()) };
            self.set_top(StackVal::from_ptr(block));
        }
        Ok(resume)
    }

    /// `JMP`: replace the running method with `item`, keeping the
    /// arguments.
    pub(super) fn jump_to(&mut self, item: u16) -> Result<(), Raise> {
        let target = self.data_method(item).clone();
        if self.clause.is_some() {
            self.fatal(format_args!("jmp inside an exception clause"));
        }
        if target.kind != MethodKind::Interpreted {
            log::warn!("jmp to non-interpreted method {}", target.full_name());
            return Err(Raise::Kind(ExceptionKind::NotSupported));
        }
        let code = match self.domain.transformed(&target) {
            Ok(code) => ptr::from_ref(code),
            Err(err) => {
                log::warn!("{err}");
                return Err(Raise::Kind(ExceptionKind::InvalidProgram));
            }
        };
        let Some(mark) = self.arena_mark else {
            self.fatal(format_args!("jmp from a frame without its own memory"));
        };
        log::trace!("jmp {} -> {}", self.imethod.full_name(), target.full_name());

        self.ctx.arena.borrow_mut().release(mark);
        // SAFETY: the descriptor keeps its code for the domain's lifetime.
        let memory = alloc_memory(self.ctx, self.domain, unsafe { &*code });
        self.frame.replace_method(target.clone());
        self.frame.set_memory(Some(memory));
        self.imethod = target;
        self.code = code;
        self.memory = memory;
        self.ip = 0;
        self.sp = 0;
        self.vt_sp = 0;
        self.finally_ips.clear();
        Ok(())
    }

    /// `NEWOBJ`: allocate, insert the object below the constructor
    /// arguments, run the constructor and leave the object.
    pub(super) fn new_object(&mut self, item: u16) -> Result<bool, Raise> {
        let ctor = self.data_method(item);
        let params = ctor.param_count;
        let obj = self
            .domain
            .heap()
            .alloc_object(&ctor.class)
            .map_err(|_| Raise::Kind(ExceptionKind::OutOfMemory))?;
        let args_start = self.sp - params;
        unsafe {
            ptr::copy(self.cell(args_start), self.cell(args_start + 1), params);
            *self.cell(args_start) = StackVal::from_obj(obj);
        }
        self.sp += 1;
        let resume = self.call(ctor, params + 1, None)?;
        self.push(StackVal::from_obj(obj));
        Ok(resume)
    }

    /// `NEWOBJ_VT`: as `NEWOBJ`, with zeroed vt stack storage as `this`.
    pub(super) fn new_value_object(&mut self, item: u16, size: u16) -> Result<bool, Raise> {
        let ctor = self.data_method(item);
        let params = ctor.param_count;
        let storage = self.vt_top();
        unsafe { ptr::write_bytes(storage, 0, size as usize) };
        self.vt_sp += align8(size);
        let args_start = self.sp - params;
        unsafe {
            ptr::copy(self.cell(args_start), self.cell(args_start + 1), params);
            *self.cell(args_start) = StackVal::from_ptr(storage);
        }
        self.sp += 1;
        let resume = self.call(ctor, params + 1, None)?;
        self.push(StackVal::from_ptr(storage));
        Ok(resume)
    }

    pub(super) fn load_virtual_ftn(&mut self, item: u16) -> Result<(), Raise> {
        let target = self.data_method(item);
        let obj = non_null(self.peek(0).as_obj())?;
        // SAFETY: non-null receivers are live objects.
        let resolved = resolve_virtual(self.domain, target, unsafe { obj.class() })?;
        // The table keeps the descriptor alive, so the handle stays valid.
        self.set_top(StackVal::from_ptr(Arc::as_ptr(&resolved)));
        Ok(())
    }
}
