use std::{
    cell::{Cell, Ref, RefCell},
    sync::Arc,
};

use object::ObjRef;

use crate::method::InterpMethod;
use crate::stackval::StackVal;

/// Identity of a frame on its thread. Ids grow monotonically, so a frame
/// always has a larger id than every frame that was live when it was
/// created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FrameId(pub(crate) u64);

/// Base pointers of a frame's private memory while it executes:
/// `[operand stack | vt stack | locals]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FrameMemory {
    pub(crate) stack: *mut StackVal,
    pub(crate) vt: *mut u8,
    pub(crate) locals: *mut u8,
}

/// One activation of a method.
///
/// Frames live on the native stack of the code that runs them and link to
/// their caller through `parent`. Everything that changes while the frame
/// runs sits in a `Cell`, so nested invocations (finally and filter
/// clauses, the unwinder) share the frame by reference.
pub struct InterpFrame<'a> {
    id: FrameId,
    imethod: RefCell<Arc<InterpMethod>>,
    parent: Option<&'a InterpFrame<'a>>,
    ip: Cell<usize>,
    args: *mut StackVal,
    retval: *mut StackVal,
    memory: Cell<Option<FrameMemory>>,
    /// Entered from native code (or a filter); the unwinder does not look
    /// past it.
    boundary: bool,
}

impl<'a> InterpFrame<'a> {
    pub(crate) fn new(
        id: FrameId,
        imethod: Arc<InterpMethod>,
        parent: Option<&'a InterpFrame<'a>>,
        args: *mut StackVal,
        retval: *mut StackVal,
        boundary: bool,
    ) -> Self {
        Self {
            id,
            imethod: RefCell::new(imethod),
            parent,
            ip: Cell::new(0),
            args,
            retval,
            memory: Cell::new(None),
            boundary,
        }
    }

    pub fn id(&self) -> FrameId {
        self.id
    }

    /// Offset of the instruction the frame is executing (or, in callers,
    /// the call it is waiting on).
    pub fn ip(&self) -> usize {
        self.ip.get()
    }

    pub(crate) fn set_ip(&self, ip: usize) {
        self.ip.set(ip);
    }

    pub fn method(&self) -> Arc<InterpMethod> {
        self.imethod.borrow().clone()
    }

    pub(crate) fn method_ref(&self) -> Ref<'_, Arc<InterpMethod>> {
        self.imethod.borrow()
    }

    /// Switch the frame to another method (`JMP`).
    pub(crate) fn replace_method(&self, imethod: Arc<InterpMethod>) {
        *self.imethod.borrow_mut() = imethod;
    }

    pub fn parent(&self) -> Option<&'a InterpFrame<'a>> {
        self.parent
    }

    pub fn is_boundary(&self) -> bool {
        self.boundary
    }

    pub(crate) fn args_ptr(&self) -> *mut StackVal {
        self.args
    }

    pub(crate) fn retval_ptr(&self) -> *mut StackVal {
        self.retval
    }

    pub(crate) fn memory(&self) -> Option<FrameMemory> {
        self.memory.get()
    }

    pub(crate) fn set_memory(&self, memory: Option<FrameMemory>) {
        self.memory.set(memory);
    }

    /// Argument cell `n` (`this` is argument 0 of instance methods).
    ///
    /// # Safety
    ///
    /// `n` must be below the method's argument count.
    pub unsafe fn arg(&self, n: usize) -> StackVal {
        unsafe { *self.args.add(n) }
    }

    /// The receiver of an instance method.
    pub fn this(&self) -> Option<ObjRef> {
        if self.imethod.borrow().hasthis {
            // SAFETY: instance methods always receive `this` in cell 0.
            Some(unsafe { self.arg(0) }.as_obj())
        } else {
            None
        }
    }

    /// Address of the local at byte `offset`, while the frame executes.
    pub fn local_ptr(&self, offset: usize) -> Option<*mut u8> {
        self.memory
            .get()
            .map(|memory| memory.locals.wrapping_add(offset))
    }

    /// The return cell.
    ///
    /// # Safety
    ///
    /// Only meaningful after the method returned a value.
    pub unsafe fn retval(&self) -> StackVal {
        unsafe { *self.retval }
    }

    /// Whether the frame is currently executing.
    pub fn is_active(&self) -> bool {
        self.memory.get().is_some()
    }
}

impl std::fmt::Debug for InterpFrame<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpFrame")
            .field("id", &self.id)
            .field("method", &self.imethod.borrow().name())
            .field("ip", &self.ip.get())
            .field("boundary", &self.boundary)
            .finish()
    }
}

/// Arguments for running part of a frame's code: a finally, fault or
/// filter clause.
#[derive(Clone, Copy)]
pub(crate) struct FrameClauseArgs<'a> {
    pub(crate) start_with_ip: usize,
    /// Exclusive end of the clause; a resume target past it belongs to an
    /// enclosing invocation.
    pub(crate) end_at_ip: usize,
    /// `ENDFINALLY` of this clause leaves the invocation.
    pub(crate) exit_clause: Option<usize>,
    /// Memory to duplicate before running and to copy back afterwards.
    pub(crate) base_frame: Option<&'a InterpFrame<'a>>,
    /// Seeded as the only stack cell (filters).
    pub(crate) filter_exception: Option<ObjRef>,
}
