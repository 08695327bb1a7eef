//! Debugger, tracer and profiler notifications.
//!
//! Hooks are fire-and-forget: they observe the frame but cannot change
//! what the interpreter does next.

use object::ObjRef;

use crate::frame::InterpFrame;

pub trait ExecutionHooks: Send + Sync {
    fn method_enter(&self, _frame: &InterpFrame<'_>) {}

    fn method_exit(&self, _frame: &InterpFrame<'_>) {}

    /// `BREAK`: a user-requested break.
    fn user_break(&self, _frame: &InterpFrame<'_>) {}

    /// `BREAKPOINT`: a debugger-installed breakpoint.
    fn breakpoint(&self, _frame: &InterpFrame<'_>) {}

    /// `SEQ_POINT` while the thread is single-stepping.
    fn sequence_point(&self, _frame: &InterpFrame<'_>) {}

    fn exception_thrown(&self, _frame: &InterpFrame<'_>, _exception: ObjRef) {}
}

#[derive(Debug, Default)]
pub struct NoHooks;

impl ExecutionHooks for NoHooks {}

/// Logs calls at `trace` level.
#[derive(Debug, Default)]
pub struct TraceHooks {
    filter: Option<String>,
}

impl TraceHooks {
    pub fn new(filter: Option<String>) -> Self {
        Self { filter }
    }

    fn wants(&self, frame: &InterpFrame<'_>) -> bool {
        self.filter
            .as_deref()
            .is_none_or(|filter| frame.method_ref().name().contains(filter))
    }
}

impl ExecutionHooks for TraceHooks {
    fn method_enter(&self, frame: &InterpFrame<'_>) {
        if self.wants(frame) {
            log::trace!("enter {} (frame {:?})", frame.method_ref().full_name(), frame.id());
        }
    }

    fn method_exit(&self, frame: &InterpFrame<'_>) {
        if self.wants(frame) {
            log::trace!("leave {} (frame {:?})", frame.method_ref().full_name(), frame.id());
        }
    }

    fn breakpoint(&self, frame: &InterpFrame<'_>) {
        log::trace!("breakpoint in {} at {:04x}", frame.method_ref().full_name(), frame.ip());
    }

    fn exception_thrown(&self, frame: &InterpFrame<'_>, exception: ObjRef) {
        log::trace!(
            "throw {:?} in {} at {:04x}",
            exception,
            frame.method_ref().full_name(),
            frame.ip()
        );
    }
}
