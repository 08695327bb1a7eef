//! Exception dispatch over interpreted frames.
//!
//! When an instruction throws, the interpreter hands the exception to the
//! domain's [`Unwinder`]. The unwinder finds the handler, runs the finally
//! and fault clauses it passes and records where execution resumes. The
//! interpreter then unwinds its own nested invocations until it reaches the
//! frame named by the resume state.

use object::{ClauseKind, ObjRef};

use crate::Domain;
use crate::context::{ResumeState, ResumeTarget, ThreadContext};
use crate::frame::InterpFrame;
use crate::interpreter;

/// Finds handlers for a thrown exception.
///
/// `unwind` must leave a resume state behind, through
/// [`ThrowSite::resume_at`] or [`ThrowSite::resume_unhandled`], unless a
/// clause it ran already superseded the exception with another one.
pub trait Unwinder: Send + Sync {
    fn unwind(&self, site: &ThrowSite<'_>);
}

/// A throw in progress.
pub struct ThrowSite<'a> {
    /// The throwing frame; its `ip` is at the throwing instruction.
    pub frame: &'a InterpFrame<'a>,
    pub exception: ObjRef,
    ctx: &'a ThreadContext,
    domain: &'a Domain,
}

impl<'a> ThrowSite<'a> {
    pub(crate) fn new(
        frame: &'a InterpFrame<'a>,
        exception: ObjRef,
        ctx: &'a ThreadContext,
        domain: &'a Domain,
    ) -> Self {
        Self {
            frame,
            exception,
            ctx,
            domain,
        }
    }

    pub fn domain(&self) -> &Domain {
        self.domain
    }

    pub fn context(&self) -> &ThreadContext {
        self.ctx
    }

    /// Run finally or fault clause `clause` of `frame`. Returns `true` when
    /// an exception escaping the clause replaced this one; the unwind is
    /// then over.
    pub fn run_finally(&self, frame: &InterpFrame<'_>, clause: usize) -> bool {
        interpreter::run_finally(frame, self.ctx, self.domain, clause)
    }

    /// Evaluate filter clause `clause` of `frame` for this exception.
    pub fn run_filter(&self, frame: &InterpFrame<'_>, clause: usize) -> bool {
        interpreter::run_filter(frame, self.ctx, self.domain, clause, self.exception)
    }

    /// Resume at the handler of `clause` in `frame`, storing the exception
    /// in the clause's exception variable.
    pub fn resume_at(&self, frame: &InterpFrame<'_>, clause: usize) {
        let imethod = frame.method();
        let Some(handler) = imethod.code().and_then(|code| code.clauses.get(clause)) else {
            crate::fatal(format_args!("{} has no clause {clause}", imethod.full_name()))
        };
        if let Some(slot) = handler
            .exvar_offset
            .and_then(|offset| frame.local_ptr(offset as usize))
        {
            // SAFETY: the variable is a reference-sized local of the
            // running frame.
            unsafe { slot.cast::<ObjRef>().write(self.exception) };
        }
        self.ctx.set_resume_state(ResumeState {
            target: ResumeTarget::Frame {
                frame: frame.id(),
                handler_ip: handler.handler_start as usize,
                clause,
            },
            exception: self.exception,
        });
    }

    /// Let the exception leave through the innermost boundary.
    pub fn resume_unhandled(&self) {
        self.ctx.set_resume_state(ResumeState {
            target: ResumeTarget::Unhandled,
            exception: self.exception,
        });
    }
}

/// Two-pass dispatch over exception clauses.
///
/// The first pass walks from the throwing frame towards the nearest
/// boundary and picks the first catch whose class the exception is
/// assignable to, or the first filter that accepts it. The second pass runs
/// the finally and fault clauses between the throw and that handler, in
/// order.
#[derive(Debug, Default)]
pub struct ClauseUnwinder;

impl ClauseUnwinder {
    fn find_handler<'a>(&self, site: &ThrowSite<'a>) -> Option<(&'a InterpFrame<'a>, usize)> {
        let meta = site.domain.metadata();
        // SAFETY: thrown objects are live.
        let thrown = unsafe { site.exception.class() }.id;
        let mut frame = site.frame;
        loop {
            let imethod = frame.method();
            let ip = frame.ip();
            if let Some(code) = imethod.code() {
                for (index, clause) in code.clauses.iter().enumerate() {
                    if !clause.try_contains(ip) {
                        continue;
                    }
                    let caught = match clause.kind {
                        ClauseKind::Catch(class) => meta.is_assignable(thrown, class),
                        ClauseKind::Filter { .. } => site.run_filter(frame, index),
                        ClauseKind::Finally | ClauseKind::Fault => false,
                    };
                    if caught {
                        return Some((frame, index));
                    }
                }
            }
            if frame.is_boundary() {
                return None;
            }
            frame = frame.parent()?;
        }
    }
}

impl Unwinder for ClauseUnwinder {
    fn unwind(&self, site: &ThrowSite<'_>) {
        let handler = self.find_handler(site);
        match handler {
            Some((frame, clause)) => log::debug!(
                "{:?} caught by clause {clause} of {}",
                site.exception,
                frame.method_ref().full_name()
            ),
            None => log::debug!("{:?} is unhandled", site.exception),
        }

        let mut frame = site.frame;
        loop {
            let in_handler_frame = handler.is_some_and(|(handler, _)| handler.id() == frame.id());
            let imethod = frame.method();
            let ip = frame.ip();
            if let Some(code) = imethod.code() {
                let limit = match handler {
                    Some((_, clause)) if in_handler_frame => clause,
                    _ => code.clauses.len(),
                };
                for (index, clause) in code.clauses[..limit].iter().enumerate() {
                    if matches!(clause.kind, ClauseKind::Finally | ClauseKind::Fault)
                        && clause.try_contains(ip)
                        && site.run_finally(frame, index)
                    {
                        return;
                    }
                }
            }
            if in_handler_frame || frame.is_boundary() {
                break;
            }
            match frame.parent() {
                Some(parent) => frame = parent,
                None => break,
            }
        }

        match handler {
            Some((frame, clause)) => site.resume_at(frame, clause),
            None => site.resume_unhandled(),
        }
    }
}
