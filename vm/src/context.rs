//! Per-thread execution state.

use std::{
    cell::{Cell, RefCell},
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use object::ObjRef;

use crate::Domain;
use crate::frame::{FrameId, InterpFrame};

/// Where a pending unwind resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumeTarget {
    /// The handler of clause `clause` in frame `frame`.
    Frame {
        frame: FrameId,
        handler_ip: usize,
        clause: usize,
    },
    /// No interpreted handler; the exception leaves through the innermost
    /// native boundary.
    Unhandled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResumeState {
    pub target: ResumeTarget,
    pub exception: ObjRef,
}

/// Requests an interruption of one thread's managed execution.
///
/// The request is observed at the next safepoint that is not inside an
/// abort-protected finally run, and raised there as a thread-interrupted
/// exception.
#[derive(Debug, Clone)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn interrupt(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }

    pub fn is_pending(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A position in the frame arena to release back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ArenaMark {
    chunk: usize,
    top: usize,
}

/// Chunked bump storage for frame memory.
///
/// Chunks never move once allocated, so pointers into them stay valid
/// until released. Release is LIFO.
pub(crate) struct FrameArena {
    chunks: Vec<(NonNull<u64>, usize)>,
    current: usize,
    top: usize,
}

impl FrameArena {
    fn new() -> Self {
        Self {
            chunks: Vec::new(),
            current: 0,
            top: 0,
        }
    }

    pub(crate) fn mark(&self) -> ArenaMark {
        ArenaMark {
            chunk: self.current,
            top: self.top,
        }
    }

    pub(crate) fn release(&mut self, mark: ArenaMark) {
        self.current = mark.chunk;
        self.top = mark.top;
    }

    /// Reserve `cells` cells. Memory handed out is not zeroed.
    pub(crate) fn alloc(&mut self, cells: usize, chunk_cells: usize) -> NonNull<u64> {
        if let Some(&(base, len)) = self.chunks.get(self.current) {
            if len - self.top >= cells {
                // SAFETY: top + cells <= len.
                let ptr = unsafe { base.add(self.top) };
                self.top += cells;
                return ptr;
            }
        }
        let next = if self.chunks.is_empty() {
            0
        } else {
            self.current + 1
        };
        if self.chunks.get(next).is_none_or(|&(_, len)| len < cells) {
            for (base, len) in self.chunks.drain(next..) {
                free_chunk(base, len);
            }
            let len = cells.max(chunk_cells).max(1);
            let chunk = Box::into_raw(vec![0u64; len].into_boxed_slice());
            // SAFETY: Box::into_raw never returns null.
            let base = unsafe { NonNull::new_unchecked(chunk.cast::<u64>()) };
            self.chunks.push((base, len));
            log::debug!("frame arena grew to {} chunks", self.chunks.len());
        }
        self.current = next;
        self.top = cells;
        self.chunks[next].0
    }

    pub(crate) fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

fn free_chunk(base: NonNull<u64>, len: usize) {
    // SAFETY: every chunk came from Box::into_raw of a boxed slice of
    // exactly `len` cells.
    unsafe {
        drop(Box::from_raw(std::ptr::slice_from_raw_parts_mut(base.as_ptr(), len)));
    }
}

impl Drop for FrameArena {
    fn drop(&mut self) {
        for (base, len) in self.chunks.drain(..) {
            free_chunk(base, len);
        }
    }
}

/// Execution state of one OS thread.
///
/// Created on first use of [`with_context`] and dropped when the thread
/// exits. Everything in here is only touched by its own thread, except the
/// interruption flag.
pub struct ThreadContext {
    resume: Cell<Option<ResumeState>>,
    pub(crate) arena: RefCell<FrameArena>,
    /// Frames that handed control to native code or to the unwinder,
    /// innermost last.
    transitions: RefCell<Vec<*const InterpFrame<'static>>>,
    abort_protected: Cell<u32>,
    interrupt: Arc<AtomicBool>,
    single_step: Cell<bool>,
    domain: Cell<*const Domain>,
    next_frame: Cell<u64>,
}

thread_local! {
    static CONTEXT: ThreadContext = ThreadContext::new();
}

/// Run `f` with the current thread's context.
pub fn with_context<R>(f: impl FnOnce(&ThreadContext) -> R) -> R {
    CONTEXT.with(f)
}

impl ThreadContext {
    fn new() -> Self {
        log::debug!("thread context created for {:?}", std::thread::current().id());
        Self {
            resume: Cell::new(None),
            arena: RefCell::new(FrameArena::new()),
            transitions: RefCell::new(Vec::new()),
            abort_protected: Cell::new(0),
            interrupt: Arc::new(AtomicBool::new(false)),
            single_step: Cell::new(false),
            domain: Cell::new(std::ptr::null()),
            next_frame: Cell::new(1),
        }
    }

    // ── resume state ───────────────────────────────────────────────

    pub fn resume_state(&self) -> Option<ResumeState> {
        self.resume.get()
    }

    pub fn has_resume_state(&self) -> bool {
        self.resume.get().is_some()
    }

    pub(crate) fn set_resume_state(&self, state: ResumeState) {
        log::debug!("resume state set: {:?}", state.target);
        self.resume.set(Some(state));
    }

    pub(crate) fn take_resume_state(&self) -> Option<ResumeState> {
        self.resume.take()
    }

    pub(crate) fn clear_resume_state(&self) {
        self.resume.set(None);
    }

    // ── interruption ───────────────────────────────────────────────

    pub fn interrupt_handle(&self) -> InterruptHandle {
        InterruptHandle(self.interrupt.clone())
    }

    /// Enter a finally block that interruption must not tear.
    pub(crate) fn begin_abort_protected(&self) {
        self.abort_protected.set(self.abort_protected.get() + 1);
    }

    /// Leave a protected finally block; returns whether an interruption
    /// is waiting.
    pub(crate) fn end_abort_protected(&self) -> bool {
        self.abort_protected
            .set(self.abort_protected.get().saturating_sub(1));
        self.interrupt.load(Ordering::Acquire)
    }

    pub fn is_abort_protected(&self) -> bool {
        self.abort_protected.get() > 0
    }

    /// Consume a pending interruption unless inside a protected finally.
    pub(crate) fn take_interruption(&self) -> bool {
        if self.is_abort_protected() {
            return false;
        }
        self.interrupt.swap(false, Ordering::AcqRel)
    }

    // ── debugging ──────────────────────────────────────────────────

    pub fn set_single_step(&self, enabled: bool) {
        self.single_step.set(enabled);
    }

    pub fn is_single_stepping(&self) -> bool {
        self.single_step.get()
    }

    // ── frames ─────────────────────────────────────────────────────

    pub(crate) fn next_frame_id(&self) -> FrameId {
        let id = self.next_frame.get();
        self.next_frame.set(id + 1);
        FrameId(id)
    }

    pub(crate) fn push_transition(&self, frame: &InterpFrame<'_>) {
        let erased = std::ptr::from_ref(frame).cast::<InterpFrame<'static>>();
        self.transitions.borrow_mut().push(erased);
    }

    pub(crate) fn pop_transition(&self) {
        self.transitions.borrow_mut().pop();
    }

    /// Visit every live interpreted frame, innermost first, that can be
    /// reached from a transition marker. Stops early when `visit` returns
    /// `false`.
    pub fn walk_frames(&self, mut visit: impl FnMut(&InterpFrame<'_>) -> bool) {
        let transitions = self.transitions.borrow().clone();
        let mut limit = None;
        for &marker in transitions.iter().rev() {
            // SAFETY: a frame removes its marker before it is dropped.
            let mut frame = unsafe { &*marker };
            if limit.is_some_and(|limit| frame.id() >= limit) {
                continue;
            }
            loop {
                if !visit(frame) {
                    return;
                }
                limit = Some(frame.id());
                if frame.is_boundary() {
                    break;
                }
                match frame.parent() {
                    Some(parent) => frame = parent,
                    None => break,
                }
            }
        }
    }

    // ── domain ─────────────────────────────────────────────────────

    /// Make `domain` the thread's current domain until the guard drops.
    pub(crate) fn enter_domain(&self, domain: &Domain) -> DomainGuard<'_> {
        let previous = self.domain.replace(std::ptr::from_ref(domain));
        DomainGuard {
            ctx: self,
            previous,
        }
    }

    /// The domain of the innermost active entry on this thread.
    pub(crate) fn current_domain(&self) -> Option<&Domain> {
        let domain = self.domain.get();
        // SAFETY: set only for the extent of a DomainGuard, which borrows
        // the domain.
        unsafe { domain.as_ref() }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        log::debug!(
            "thread context destroyed ({} arena chunks)",
            self.arena.get_mut().chunk_count()
        );
    }
}

pub(crate) struct DomainGuard<'a> {
    ctx: &'a ThreadContext,
    previous: *const Domain,
}

impl Drop for DomainGuard<'_> {
    fn drop(&mut self) {
        self.ctx.domain.set(self.previous);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arena_is_lifo_and_reuses_chunks() {
        let mut arena = FrameArena::new();
        let mark = arena.mark();
        let a = arena.alloc(10, 16);
        let b = arena.alloc(4, 16);
        assert_eq!(unsafe { a.add(10) }, b);
        // Does not fit the first chunk any more.
        let c = arena.alloc(8, 16);
        assert_eq!(arena.chunk_count(), 2);
        arena.release(mark);
        let again = arena.alloc(10, 16);
        assert_eq!(again, a);
        let _ = c;
    }

    #[test]
    fn arena_replaces_too_small_chunks() {
        let mut arena = FrameArena::new();
        let mark = arena.mark();
        arena.alloc(16, 16);
        arena.alloc(16, 16);
        assert_eq!(arena.chunk_count(), 2);
        arena.release(mark);
        arena.alloc(16, 16);
        arena.alloc(100, 16);
        assert_eq!(arena.chunk_count(), 2);
    }

    #[test]
    fn abort_protection_defers_interruption() {
        with_context(|ctx| {
            let handle = ctx.interrupt_handle();
            ctx.begin_abort_protected();
            handle.interrupt();
            assert!(!ctx.take_interruption());
            assert!(ctx.end_abort_protected());
            assert!(ctx.take_interruption());
            assert!(!handle.is_pending());
        });
    }

    #[test]
    fn resume_state_is_taken_once() {
        with_context(|ctx| {
            let state = ResumeState {
                target: ResumeTarget::Unhandled,
                exception: ObjRef::NULL,
            };
            ctx.set_resume_state(state);
            assert!(ctx.has_resume_state());
            assert_eq!(ctx.take_resume_state(), Some(state));
            assert!(!ctx.has_resume_state());
        });
    }
}
