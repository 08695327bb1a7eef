//! The interpreter proper: runs the transformed code of one frame.
//!
//! Every managed call nests a Rust call to [`exec_method_full`]. Finally,
//! fault and filter clauses run through the same function with
//! [`FrameClauseArgs`] restricting it to part of the code, sharing (or for
//! filters, duplicating) the frame's memory.

mod arith;
mod array;
mod call;
mod compare;
mod objects;
#[cfg(test)]
mod tests;

use std::{
    fmt::{self, Write},
    ptr,
    sync::Arc,
};

use bytecode::{Instruction, MemTy, decode_at, switch_target};
use object::{Class, ClauseKind, ExceptionKind, ObjRef, Signature};

use crate::Domain;
use crate::context::{ArenaMark, ResumeState, ResumeTarget, ThreadContext};
use crate::error;
use crate::exception::Raise;
use crate::frame::{FrameClauseArgs, FrameMemory, InterpFrame};
use crate::method::{DataItem, InterpMethod, MethodCode};
use crate::stackval::StackVal;
use crate::unwind::ThrowSite;

pub(crate) use call::invoke_target;

/// What the main loop does after an instruction.
enum Flow {
    Continue,
    /// Leave this invocation.
    Exit,
    /// A call returned with an unwind in progress.
    CheckResume,
}

type Step = Result<Flow, Raise>;

#[inline(always)]
fn align8(size: u16) -> usize {
    (size as usize).next_multiple_of(8)
}

#[inline(always)]
fn branch_target(ip: usize, disp: i32) -> usize {
    (ip as isize + disp as isize) as usize
}

#[inline(always)]
fn non_null(obj: ObjRef) -> Result<ObjRef, Raise> {
    if obj.is_null() {
        Err(Raise::Kind(ExceptionKind::NullReference))
    } else {
        Ok(obj)
    }
}

fn alloc_memory(ctx: &ThreadContext, domain: &Domain, code: &MethodCode) -> FrameMemory {
    let base = ctx
        .arena
        .borrow_mut()
        .alloc(code.frame_cells(), domain.arena_chunk_cells)
        .as_ptr();
    // SAFETY: the reservation covers stack, vt stack and locals.
    unsafe {
        let vt = base.add(code.stack_cells).cast::<u8>();
        FrameMemory {
            stack: base.cast::<StackVal>(),
            vt,
            locals: vt.add(code.vt_stack_size),
        }
    }
}

/// Run `frame`'s method, or the clause `clause` describes, until it
/// returns or an exception leaves it.
///
/// The method must already be transformed. On exit a pending resume state
/// that targets an outer frame (or no frame) is left for the caller.
pub(crate) fn exec_method_full(
    frame: &InterpFrame<'_>,
    ctx: &ThreadContext,
    domain: &Domain,
    clause: Option<FrameClauseArgs<'_>>,
) {
    let imethod = frame.method();
    let code: *const MethodCode = match imethod.code() {
        Some(code) => code,
        None => error::fatal(format_args!(
            "{} executed before it was transformed",
            imethod.full_name()
        )),
    };
    // SAFETY: descriptors, and so their code, live as long as the domain.
    let code_ref = unsafe { &*code };

    let mut arena_mark = None;
    let memory = match clause {
        None => {
            arena_mark = Some(ctx.arena.borrow().mark());
            alloc_memory(ctx, domain, code_ref)
        }
        Some(FrameClauseArgs {
            base_frame: Some(base),
            ..
        }) => {
            arena_mark = Some(ctx.arena.borrow().mark());
            let memory = alloc_memory(ctx, domain, code_ref);
            let Some(base_memory) = base.memory() else {
                error::fatal(format_args!("filter base frame of {} is not running", imethod.full_name()))
            };
            // SAFETY: both regions are frame_cells long and distinct.
            unsafe {
                ptr::copy_nonoverlapping(
                    base_memory.stack,
                    memory.stack,
                    code_ref.frame_cells(),
                );
            }
            memory
        }
        Some(_) => match frame.memory() {
            Some(memory) => memory,
            None => error::fatal(format_args!(
                "clause of {} runs on a frame without memory",
                imethod.full_name()
            )),
        },
    };
    let previous_memory = frame.memory();
    frame.set_memory(Some(memory));

    let mut interp = Interp {
        frame,
        ctx,
        domain,
        clause,
        imethod,
        code,
        memory,
        ip: clause.map_or(0, |c| c.start_with_ip),
        sp: 0,
        vt_sp: 0,
        finally_ips: Vec::new(),
        arena_mark,
        count_ops: domain.options().count_ops,
    };
    if let Some(exception) = clause.and_then(|c| c.filter_exception) {
        interp.push(StackVal::from_obj(exception));
    }

    if clause.is_none() {
        domain.hooks().method_enter(frame);
    }
    interp.run();
    if clause.is_none() {
        domain.hooks().method_exit(frame);
    }

    if let Some(base) = clause.and_then(|c| c.base_frame) {
        if let Some(base_memory) = base.memory() {
            // SAFETY: as above, in the other direction.
            unsafe {
                ptr::copy_nonoverlapping(
                    interp.memory.stack,
                    base_memory.stack,
                    interp.code().frame_cells(),
                );
            }
        }
    }
    if let Some(mark) = interp.arena_mark {
        frame.set_memory(previous_memory);
        ctx.arena.borrow_mut().release(mark);
    }
}

/// Run finally or fault clause `index` of a frame that is unwinding.
/// Returns whether an exception thrown inside the clause superseded the
/// current unwind.
pub(crate) fn run_finally(
    frame: &InterpFrame<'_>,
    ctx: &ThreadContext,
    domain: &Domain,
    index: usize,
) -> bool {
    let imethod = frame.method();
    let Some(clause) = imethod.code().and_then(|code| code.clauses.get(index)).copied() else {
        error::fatal(format_args!("{} has no clause {index}", imethod.full_name()))
    };
    let old_ip = frame.ip();
    log::trace!("running finally clause {index} of {}", imethod.full_name());
    ctx.begin_abort_protected();
    exec_method_full(
        frame,
        ctx,
        domain,
        Some(FrameClauseArgs {
            start_with_ip: clause.handler_start as usize,
            end_at_ip: clause.handler_end as usize,
            exit_clause: Some(index),
            base_frame: None,
            filter_exception: None,
        }),
    );
    if ctx.has_resume_state() {
        true
    } else {
        frame.set_ip(old_ip);
        false
    }
}

/// Evaluate filter clause `index` of `frame` for `exception`.
pub(crate) fn run_filter(
    frame: &InterpFrame<'_>,
    ctx: &ThreadContext,
    domain: &Domain,
    index: usize,
    exception: ObjRef,
) -> bool {
    let imethod = frame.method();
    let clause = imethod.code().and_then(|code| code.clauses.get(index)).copied();
    let Some((filter_start, handler_start)) = clause.and_then(|clause| match clause.kind {
        ClauseKind::Filter { filter_start } => {
            Some((filter_start as usize, clause.handler_start as usize))
        }
        _ => None,
    }) else {
        error::fatal(format_args!("clause {index} of {} is not a filter", imethod.full_name()))
    };

    let mut retval = StackVal::ZERO;
    let filter_frame = InterpFrame::new(
        ctx.next_frame_id(),
        imethod,
        Some(frame),
        frame.args_ptr(),
        ptr::from_mut(&mut retval),
        true,
    );
    filter_frame.set_ip(filter_start);
    exec_method_full(
        &filter_frame,
        ctx,
        domain,
        Some(FrameClauseArgs {
            start_with_ip: filter_start,
            end_at_ip: handler_start,
            exit_clause: None,
            base_frame: Some(frame),
            filter_exception: Some(exception),
        }),
    );
    // An exception escaping the filter makes it evaluate to false.
    if let Some(state) = ctx.resume_state() {
        log::debug!("exception {:?} escaped a filter; treating it as false", state.exception);
        ctx.clear_resume_state();
        return false;
    }
    retval.as_i32() != 0
}

struct Interp<'a> {
    frame: &'a InterpFrame<'a>,
    ctx: &'a ThreadContext,
    domain: &'a Domain,
    clause: Option<FrameClauseArgs<'a>>,
    imethod: Arc<InterpMethod>,
    code: *const MethodCode,
    memory: FrameMemory,
    /// Start of the executing instruction.
    ip: usize,
    sp: usize,
    vt_sp: usize,
    /// Targets queued by `LEAVE`: finally handlers to run, innermost last,
    /// under the final destination.
    finally_ips: Vec<usize>,
    /// Set when this invocation owns its memory.
    arena_mark: Option<ArenaMark>,
    count_ops: bool,
}

impl<'a> Interp<'a> {
    #[inline(always)]
    fn code(&self) -> &'a MethodCode {
        // SAFETY: the domain keeps every descriptor alive, and the domain
        // outlives the invocation.
        unsafe { &*self.code }
    }

    // ── stacks ─────────────────────────────────────────────────────

    #[inline(always)]
    fn cell(&self, index: usize) -> *mut StackVal {
        self.memory.stack.wrapping_add(index)
    }

    #[inline(always)]
    fn push(&mut self, value: StackVal) {
        // SAFETY: transformed code stays within its declared stack depth.
        unsafe { *self.cell(self.sp) = value };
        self.sp += 1;
    }

    #[inline(always)]
    fn pop(&mut self) -> StackVal {
        self.sp -= 1;
        unsafe { *self.cell(self.sp) }
    }

    /// The cell `depth` below the top; 0 is the top.
    #[inline(always)]
    fn peek(&self, depth: usize) -> StackVal {
        unsafe { *self.cell(self.sp - 1 - depth) }
    }

    #[inline(always)]
    fn set_top(&mut self, value: StackVal) {
        unsafe { *self.cell(self.sp - 1) = value };
    }

    #[inline(always)]
    fn vt_top(&self) -> *mut u8 {
        self.memory.vt.wrapping_add(self.vt_sp)
    }

    /// Copy `size` bytes at `src` onto the vt stack and push a cell
    /// pointing at the copy.
    fn push_vt(&mut self, src: *const u8, size: u16) {
        let dst = self.vt_top();
        // SAFETY: the vt stack is sized for the deepest nesting; src may
        // alias vt storage (DUP_VT), hence copy.
        unsafe { ptr::copy(src, dst, size as usize) };
        self.vt_sp += align8(size);
        self.push(StackVal::from_ptr(dst));
    }

    #[inline(always)]
    fn local(&self, offset: u16) -> *mut u8 {
        self.memory.locals.wrapping_add(offset as usize)
    }

    #[inline(always)]
    fn arg(&self, n: u16) -> *mut StackVal {
        self.frame.args_ptr().wrapping_add(n as usize)
    }

    // ── data items ─────────────────────────────────────────────────

    fn data(&self, item: u16) -> &'a DataItem {
        match self.code().data.get(item as usize) {
            Some(data) => data,
            None => self.fatal(format_args!("data item {item} out of range")),
        }
    }

    fn data_class(&self, item: u16) -> &'a Arc<Class> {
        match self.data(item) {
            DataItem::Class(class) => class,
            other => self.fatal(format_args!("data item {item} is not a class: {other:?}")),
        }
    }

    fn data_method(&self, item: u16) -> &'a Arc<InterpMethod> {
        match self.data(item) {
            DataItem::Method(method) => method,
            other => self.fatal(format_args!("data item {item} is not a method: {other:?}")),
        }
    }

    fn data_signature(&self, item: u16) -> &'a Arc<Signature> {
        match self.data(item) {
            DataItem::Signature(sig) => sig,
            other => self.fatal(format_args!("data item {item} is not a signature: {other:?}")),
        }
    }

    fn data_address(&self, item: u16) -> *mut u8 {
        match self.data(item) {
            DataItem::StaticField(addr) | DataItem::Pointer(addr) => *addr as *mut u8,
            other => self.fatal(format_args!("data item {item} is not an address: {other:?}")),
        }
    }

    // ── main loop ──────────────────────────────────────────────────

    fn run(&mut self) {
        loop {
            let flow = match self.step() {
                Ok(flow) => flow,
                Err(raise) => {
                    self.throw(raise);
                    Flow::CheckResume
                }
            };
            match flow {
                Flow::Continue => {}
                Flow::Exit => return,
                Flow::CheckResume => {
                    if !self.try_resume() {
                        return;
                    }
                }
            }
        }
    }

    /// Throw from the current instruction: run the unwinder, which always
    /// leaves a resume state behind.
    fn throw(&mut self, raise: Raise) {
        let exception = self.domain.materialize(raise);
        self.frame.set_ip(self.ip);
        self.domain
            .stats()
            .exceptions
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.domain.hooks().exception_thrown(self.frame, exception);
        log::debug!(
            "throw {exception:?} in {} at {:04x}",
            self.imethod.full_name(),
            self.ip
        );

        self.ctx.push_transition(self.frame);
        let site = ThrowSite::new(self.frame, exception, self.ctx, self.domain);
        self.domain.unwinder().unwind(&site);
        self.ctx.pop_transition();

        if !self.ctx.has_resume_state() {
            self.fatal(format_args!("unwinder returned without a resume state"));
        }
    }

    /// Continue at a handler in this frame if the pending resume state
    /// targets one; otherwise the invocation must exit.
    fn try_resume(&mut self) -> bool {
        let Some(ResumeState {
            target:
                ResumeTarget::Frame {
                    frame,
                    handler_ip,
                    clause,
                },
            exception,
        }) = self.ctx.resume_state()
        else {
            return false;
        };
        if frame != self.frame.id() {
            return false;
        }
        if self.clause.is_some_and(|c| handler_ip >= c.end_at_ip) {
            return false;
        }
        let Some(handler) = self.code().clauses.get(clause).copied() else {
            self.fatal(format_args!("resume into missing clause {clause}"));
        };
        self.ctx.clear_resume_state();
        self.sp = 0;
        self.vt_sp = 0;
        self.push(StackVal::from_obj(exception));
        self.finally_ips.retain(|&ip| !handler.try_contains(ip));
        self.ip = handler_ip;
        true
    }

    /// Raise a pending interruption, unless a finally is protecting the
    /// thread.
    fn checkpoint(&self) -> Result<(), Raise> {
        if self.ctx.take_interruption() {
            log::debug!("interruption raised in {}", self.imethod.full_name());
            Err(Raise::Kind(ExceptionKind::ThreadInterrupted))
        } else {
            Ok(())
        }
    }

    fn step(&mut self) -> Step {
        let code = self.code();
        let bytes = &code.bytes[..];
        if self.count_ops {
            if let Some(&byte) = bytes.get(self.ip) {
                self.domain.stats().count_op(byte);
            }
        }
        let (instruction, next) = match decode_at(bytes, self.ip) {
            Ok(decoded) => decoded,
            Err(err) => self.fatal(format_args!("{err}")),
        };

        match instruction {
            Instruction::Nop => {}
            Instruction::Break => {
                self.frame.set_ip(self.ip);
                self.domain.hooks().user_break(self.frame);
            }
            Instruction::Breakpoint => {
                self.frame.set_ip(self.ip);
                self.domain.hooks().breakpoint(self.frame);
            }
            Instruction::SeqPoint => {
                if self.ctx.is_single_stepping() {
                    self.frame.set_ip(self.ip);
                    self.domain.hooks().sequence_point(self.frame);
                }
            }
            Instruction::Safepoint => self.checkpoint()?,
            Instruction::InitLocals { start, size } => unsafe {
                ptr::write_bytes(self.local(start), 0, size as usize);
            },
            Instruction::LdNull => self.push(StackVal::ZERO),
            Instruction::Dup => self.push(self.peek(0)),
            Instruction::DupVt { size } => self.push_vt(self.peek(0).as_ptr(), size),
            Instruction::Pop => self.sp -= 1,
            Instruction::PopVt { size } => {
                self.sp -= 1;
                self.vt_sp -= align8(size);
            }

            // ── constants ──
            Instruction::LdcI4 { value } => self.push(StackVal::from_i32(value)),
            Instruction::LdcI8 { value } => self.push(StackVal::from_i64(value)),
            Instruction::LdcR4 { bits } => self.push(StackVal::from_f32(f32::from_bits(bits))),
            Instruction::LdcR8 { bits } => self.push(StackVal::from_raw(bits)),
            Instruction::LdStr { item } => match self.data(item) {
                DataItem::String(string) => self.push(StackVal::from_obj(*string)),
                other => self.fatal(format_args!("data item {item} is not a string: {other:?}")),
            },
            Instruction::LdPtr { item } => self.push(StackVal::from_ptr(self.data_address(item))),
            Instruction::LdToken { item } => {
                let token = self.token(item);
                self.push(StackVal::from_raw(token as u64));
            }

            // ── arguments and locals ──
            Instruction::LdArg { n } => self.push(unsafe { *self.arg(n) }),
            Instruction::LdArgVt { n, size } => {
                let src = unsafe { *self.arg(n) }.as_ptr::<u8>();
                self.push_vt(src, size);
            }
            Instruction::StArg { n } => {
                let value = self.pop();
                unsafe { *self.arg(n) = value };
            }
            Instruction::StArgVt { n, size } => {
                let value = self.pop();
                unsafe {
                    ptr::copy(value.as_ptr::<u8>(), (*self.arg(n)).as_ptr::<u8>(), size as usize);
                }
                self.vt_sp -= align8(size);
            }
            Instruction::LdArgA { n } => self.push(StackVal::from_ptr(self.arg(n))),
            Instruction::LdArgAVt { n } => self.push(unsafe { *self.arg(n) }),
            Instruction::LdLoc { ty, offset } => {
                self.push(unsafe { StackVal::load(ty, self.local(offset)) });
            }
            Instruction::LdLocVt { offset, size } => self.push_vt(self.local(offset), size),
            Instruction::StLoc { ty, offset } => {
                let value = self.pop();
                unsafe { value.store(ty, self.local(offset)) };
            }
            Instruction::StLocVt { offset, size } => {
                let value = self.pop();
                unsafe { ptr::copy(value.as_ptr::<u8>(), self.local(offset), size as usize) };
                self.vt_sp -= align8(size);
            }
            Instruction::LdLocA { offset } => self.push(StackVal::from_ptr(self.local(offset))),

            // ── indirect access ──
            Instruction::LdInd { ty, checked } => {
                let addr = self.peek(0).as_ptr::<u8>();
                if checked && addr.is_null() {
                    return Err(Raise::Kind(ExceptionKind::NullReference));
                }
                self.set_top(unsafe { StackVal::load(ty, addr) });
            }
            Instruction::StInd { ty } => {
                let addr = self.peek(1).as_ptr::<u8>();
                if addr.is_null() {
                    return Err(Raise::Kind(ExceptionKind::NullReference));
                }
                let value = self.pop();
                self.sp -= 1;
                unsafe { value.store(ty, addr) };
            }
            Instruction::LdObj { size } => {
                let addr = self.peek(0).as_ptr::<u8>();
                if addr.is_null() {
                    return Err(Raise::Kind(ExceptionKind::NullReference));
                }
                self.sp -= 1;
                self.push_vt(addr, size);
            }
            Instruction::StObj { size } => {
                let addr = self.peek(1).as_ptr::<u8>();
                if addr.is_null() {
                    return Err(Raise::Kind(ExceptionKind::NullReference));
                }
                let value = self.pop();
                self.sp -= 1;
                unsafe { ptr::copy(value.as_ptr::<u8>(), addr, size as usize) };
                self.vt_sp -= align8(size);
            }
            Instruction::CpObj { size } => {
                let src = self.peek(0).as_ptr::<u8>();
                let dst = self.peek(1).as_ptr::<u8>();
                if src.is_null() || dst.is_null() {
                    return Err(Raise::Kind(ExceptionKind::NullReference));
                }
                self.sp -= 2;
                unsafe { ptr::copy(src, dst, size as usize) };
            }
            Instruction::InitObj { size } => {
                let addr = self.peek(0).as_ptr::<u8>();
                if addr.is_null() {
                    return Err(Raise::Kind(ExceptionKind::NullReference));
                }
                self.sp -= 1;
                unsafe { ptr::write_bytes(addr, 0, size as usize) };
            }

            // ── arithmetic ──
            Instruction::Binary { op, ty } => {
                let result = arith::binary(op, ty, self.peek(1), self.peek(0))?;
                self.sp -= 1;
                self.set_top(result);
            }
            Instruction::Unary { op, ty } => {
                let result = arith::unary(op, ty, self.peek(0))?;
                self.set_top(result);
            }
            Instruction::CkFinite { ty } => arith::ckfinite(ty, self.peek(0))?,
            Instruction::Compare { cond, ty } => {
                let result = compare::compare(cond, ty, self.peek(1), self.peek(0));
                self.sp -= 1;
                self.set_top(StackVal::from_bool(result));
            }
            Instruction::Conv { from, to, check } => {
                let result = arith::convert(from, to, check, self.peek(0))?;
                self.set_top(result);
            }

            // ── branches ──
            Instruction::Br { disp } => {
                self.ip = branch_target(self.ip, disp);
                return Ok(Flow::Continue);
            }
            Instruction::BrTrue { ty, disp } => {
                if compare::is_true(ty, self.pop()) {
                    self.ip = branch_target(self.ip, disp);
                    return Ok(Flow::Continue);
                }
            }
            Instruction::BrFalse { ty, disp } => {
                if !compare::is_true(ty, self.pop()) {
                    self.ip = branch_target(self.ip, disp);
                    return Ok(Flow::Continue);
                }
            }
            Instruction::BrCmp { cond, ty, disp } => {
                let b = self.pop();
                let a = self.pop();
                if compare::compare(cond, ty, a, b) {
                    self.ip = branch_target(self.ip, disp);
                    return Ok(Flow::Continue);
                }
            }
            Instruction::Switch { count } => {
                let index = self.pop().as_i32() as u32;
                if index < count {
                    self.ip = branch_target(self.ip, switch_target(bytes, self.ip, index));
                    return Ok(Flow::Continue);
                }
            }

            // ── fields ──
            Instruction::LdFld { ty, offset } => {
                let obj = non_null(self.peek(0).as_obj())?;
                self.set_top(unsafe { StackVal::load(ty, obj.as_ptr().add(offset as usize)) });
            }
            Instruction::LdFldVt { offset, size } => {
                let obj = non_null(self.peek(0).as_obj())?;
                self.sp -= 1;
                self.push_vt(obj.as_ptr().wrapping_add(offset as usize), size);
            }
            Instruction::StFld { ty, offset } => {
                let obj = non_null(self.peek(1).as_obj())?;
                let value = self.pop();
                self.sp -= 1;
                unsafe { value.store(ty, obj.as_ptr().add(offset as usize)) };
            }
            Instruction::StFldVt { offset, size } => {
                let obj = non_null(self.peek(1).as_obj())?;
                let value = self.pop();
                self.sp -= 1;
                unsafe {
                    ptr::copy(
                        value.as_ptr::<u8>(),
                        obj.as_ptr().add(offset as usize),
                        size as usize,
                    );
                }
                self.vt_sp -= align8(size);
            }
            Instruction::LdFldA { offset } => {
                let obj = non_null(self.peek(0).as_obj())?;
                self.set_top(StackVal::from_ptr(obj.as_ptr().wrapping_add(offset as usize)));
            }
            Instruction::LdSFld { ty, item } => {
                self.push(unsafe { StackVal::load(ty, self.data_address(item)) });
            }
            Instruction::LdSFldVt { item, size } => self.push_vt(self.data_address(item), size),
            Instruction::StSFld { ty, item } => {
                let value = self.pop();
                unsafe { value.store(ty, self.data_address(item)) };
            }
            Instruction::StSFldVt { item, size } => {
                let value = self.pop();
                unsafe {
                    ptr::copy(value.as_ptr::<u8>(), self.data_address(item), size as usize);
                }
                self.vt_sp -= align8(size);
            }
            Instruction::LdSFldA { item } => self.push(StackVal::from_ptr(self.data_address(item))),

            // ── arrays ──
            Instruction::NewArr { item } => self.new_array(item)?,
            Instruction::NewArrMulti { item, params } => self.new_md_array(item, params)?,
            Instruction::LdLen => {
                let array = non_null(self.peek(0).as_obj())?;
                self.set_top(StackVal::from_i64(unsafe { array.array_len() } as i64));
            }
            Instruction::LdElem { ty, checked } => {
                let addr = self.element_addr(ty.size(), checked)?;
                self.sp -= 1;
                self.set_top(unsafe { StackVal::load(ty, addr) });
            }
            Instruction::LdElemVt { size } => {
                let addr = self.element_addr(size as usize, true)?;
                self.sp -= 2;
                self.push_vt(addr, size);
            }
            Instruction::StElem { ty, checked } => self.store_element(ty, checked)?,
            Instruction::StElemRef => self.store_element_ref()?,
            Instruction::StElemVt { size } => {
                let value = self.pop();
                let addr = match self.element_addr(size as usize, true) {
                    Ok(addr) => addr,
                    Err(raise) => {
                        self.sp += 1;
                        return Err(raise);
                    }
                };
                self.sp -= 2;
                unsafe { ptr::copy(value.as_ptr::<u8>(), addr, size as usize) };
                self.vt_sp -= align8(size);
            }
            Instruction::LdElemA { size } => {
                let addr = self.element_addr(size as usize, true)?;
                self.sp -= 1;
                self.set_top(StackVal::from_ptr(addr));
            }
            Instruction::LdElemATc { item } => self.element_addr_typechecked(item)?,
            Instruction::MdArrayGet { rank, ty, checked } => {
                let addr = self.md_element_addr(rank, 0, checked)?;
                self.sp -= rank as usize + 1;
                self.push(unsafe { StackVal::load(ty, addr) });
            }
            Instruction::MdArraySet { rank, ty } => {
                let addr = self.md_element_addr(rank, 1, true)?;
                let value = self.pop();
                self.sp -= rank as usize + 1;
                unsafe { value.store(ty, addr) };
            }
            Instruction::MdArrayAddr { rank, typecheck } => {
                if let Some(item) = typecheck {
                    self.check_element_class(self.peek(rank as usize).as_obj(), item)?;
                }
                let addr = self.md_element_addr(rank, 0, true)?;
                self.sp -= rank as usize + 1;
                self.push(StackVal::from_ptr(addr));
            }

            // ── objects ──
            Instruction::NewObj { item } => {
                if self.new_object(item)? {
                    self.ip = next;
                    return Ok(Flow::CheckResume);
                }
            }
            Instruction::NewObjVt { item, size } => {
                if self.new_value_object(item, size)? {
                    self.ip = next;
                    return Ok(Flow::CheckResume);
                }
            }
            Instruction::Box { item } => self.box_value(item)?,
            Instruction::Unbox { item } => self.unbox(item)?,
            Instruction::CastClass { item } => self.cast(item, true)?,
            Instruction::IsInst { item } => self.cast(item, false)?,
            Instruction::LdFtn { item } => {
                let method = Arc::as_ptr(self.data_method(item));
                self.push(StackVal::from_ptr(method));
            }
            Instruction::LdVirtFtn { item } => self.load_virtual_ftn(item)?,
            Instruction::LocAlloc => self.local_alloc(),
            Instruction::CpBlk => self.copy_block()?,
            Instruction::InitBlk => self.init_block()?,
            Instruction::MkRefAny { item } => self.make_typed_ref(item),
            Instruction::RefAnyVal { item } => self.typed_ref_value(item)?,
            Instruction::RefAnyType => self.typed_ref_type(),
            Instruction::ArgList => {
                let handle = unsafe { *self.frame.args_ptr().add(self.imethod.arg_cells()) };
                self.push(handle);
            }

            // ── calls ──
            Instruction::Call { item }
            | Instruction::CallVirt { item }
            | Instruction::CallI { sig: item }
            | Instruction::CallINat { sig: item }
            | Instruction::JitCall { item } => {
                let resume = match instruction {
                    Instruction::Call { .. } => {
                        let target = self.data_method(item);
                        self.call(target, target.arg_cells(), None)?
                    }
                    Instruction::CallVirt { .. } => self.call_virtual(item)?,
                    Instruction::CallI { .. } => self.call_indirect(item)?,
                    Instruction::CallINat { .. } => self.call_native_indirect(item)?,
                    _ => {
                        let target = self.data_method(item);
                        self.call(target, target.arg_cells(), target.method.compiled())?
                    }
                };
                if resume {
                    self.ip = next;
                    return Ok(Flow::CheckResume);
                }
            }
            Instruction::CallVararg { item, sig } => {
                if self.call_vararg(item, sig)? {
                    self.ip = next;
                    return Ok(Flow::CheckResume);
                }
            }
            Instruction::Jmp { item } => {
                self.jump_to(item)?;
                return Ok(Flow::Continue);
            }
            Instruction::Ret => {
                let value = self.pop();
                unsafe { *self.frame.retval_ptr() = value };
                return Ok(Flow::Exit);
            }
            Instruction::RetVoid => return Ok(Flow::Exit),
            Instruction::RetVt { size } => {
                let value = self.pop();
                unsafe {
                    let dst = (*self.frame.retval_ptr()).as_ptr::<u8>();
                    ptr::copy(value.as_ptr::<u8>(), dst, size as usize);
                }
                return Ok(Flow::Exit);
            }
            Instruction::VtResult { ret_size, args_size } => {
                let src = self.vt_top();
                self.vt_sp -= args_size as usize;
                let dst = self.vt_top();
                unsafe { ptr::copy(src, dst, ret_size as usize) };
                self.set_top(StackVal::from_ptr(dst));
                self.vt_sp += align8(ret_size);
            }

            // ── exceptions ──
            Instruction::Throw => return Err(Raise::Object(self.peek(0).as_obj())),
            Instruction::Rethrow { offset } => {
                let exception = unsafe { StackVal::load(MemTy::Ref, self.local(offset)) };
                return Err(Raise::Object(exception.as_obj()));
            }
            Instruction::Leave { disp, check } => return self.leave(disp, check),
            Instruction::EndFinally { clause } => return self.end_finally(clause as usize),
            Instruction::EndFilter => {
                let value = self.pop();
                unsafe { *self.frame.retval_ptr() = value };
                return Ok(Flow::Exit);
            }
        }

        self.ip = next;
        Ok(Flow::Continue)
    }

    /// `LEAVE`: queue every finally between here and the target, then run
    /// the first of them (or jump straight to the target).
    fn leave(&mut self, disp: i32, check: bool) -> Step {
        let target = branch_target(self.ip, disp);
        let queued = self.finally_ips.len();
        self.finally_ips.push(target);
        for clause in self.code().clauses.iter().rev() {
            if clause.kind == ClauseKind::Finally
                && clause.try_contains(self.ip)
                && !clause.try_contains(target)
            {
                self.finally_ips.push(clause.handler_start as usize);
                self.ctx.begin_abort_protected();
            }
        }
        if check && self.finally_ips.len() == queued + 1 {
            if let Err(raise) = self.checkpoint() {
                self.finally_ips.truncate(queued);
                return Err(raise);
            }
        }
        self.sp = 0;
        self.vt_sp = 0;
        self.ip = self.finally_ips.pop().unwrap_or(target);
        Ok(Flow::Continue)
    }

    /// `ENDFINALLY`: continue with the next queued target, or leave the
    /// invocation that was started to run this clause.
    fn end_finally(&mut self, clause: usize) -> Step {
        let pending = self.ctx.end_abort_protected();
        if self.clause.is_some_and(|c| c.exit_clause == Some(clause)) {
            return Ok(Flow::Exit);
        }
        self.sp = 0;
        self.vt_sp = 0;
        let Some(target) = self.finally_ips.pop() else {
            self.fatal(format_args!("endfinally with nothing queued"));
        };
        self.ip = target;
        // Interruptions wait until the last finally of the leave is done.
        if pending && self.finally_ips.is_empty() {
            self.checkpoint()?;
        }
        Ok(Flow::Continue)
    }

    // ── diagnostics ────────────────────────────────────────────────

    #[cold]
    fn fatal(&self, what: fmt::Arguments<'_>) -> ! {
        let mut dump = String::new();
        let _ = writeln!(dump, "{what}");
        let instruction = decode_at(&self.code().bytes, self.ip)
            .map(|(instruction, _)| instruction.to_string())
            .unwrap_or_else(|_| "<undecodable>".to_owned());
        let _ = writeln!(
            dump,
            "  at {:04x}: {instruction} in {} (sp {}, vt_sp {})",
            self.ip,
            self.imethod.full_name(),
            self.sp,
            self.vt_sp
        );
        let mut caller = self.frame.parent();
        while let Some(frame) = caller {
            let _ = writeln!(
                dump,
                "  called from {:04x} in {}",
                frame.ip(),
                frame.method_ref().full_name()
            );
            caller = frame.parent();
        }
        error::fatal(format_args!("{dump}"))
    }
}
