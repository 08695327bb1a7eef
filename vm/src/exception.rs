//! Managed exceptions created by the runtime itself.

use object::{EXCEPTION_MESSAGE_OFFSET, ExceptionKind, ObjRef};

use crate::Domain;

/// An exception on its way to being thrown.
///
/// Runtime checks name the kind and let the thrower allocate the object,
/// so helpers that detect a fault never need the heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Raise {
    Kind(ExceptionKind),
    /// A managed exception object; null is thrown as a null reference.
    Object(ObjRef),
}

impl From<ExceptionKind> for Raise {
    fn from(kind: ExceptionKind) -> Self {
        Raise::Kind(kind)
    }
}

fn default_message(kind: ExceptionKind) -> &'static str {
    match kind {
        ExceptionKind::NullReference => "Object reference not set to an instance of an object.",
        ExceptionKind::IndexOutOfRange => "Index was outside the bounds of the array.",
        ExceptionKind::ArrayTypeMismatch => {
            "Attempted to access an element as a type incompatible with the array."
        }
        ExceptionKind::DivideByZero => "Attempted to divide by zero.",
        ExceptionKind::Arithmetic => "Overflow or underflow in the arithmetic operation.",
        ExceptionKind::Overflow => "Arithmetic operation resulted in an overflow.",
        ExceptionKind::InvalidCast => "Specified cast is not valid.",
        ExceptionKind::OutOfMemory => "Insufficient memory to continue the execution of the program.",
        ExceptionKind::ThreadInterrupted => "Thread was interrupted from a waiting state.",
        ExceptionKind::InvalidProgram => "Common Language Runtime detected an invalid program.",
        ExceptionKind::NotSupported => "Specified method is not supported.",
        ExceptionKind::ExecutionEngine => "Internal error in the runtime.",
    }
}

impl Domain {
    /// Allocate a fresh exception of `kind` with its default message.
    ///
    /// Falls back to the preallocated out-of-memory exception when the heap
    /// is exhausted.
    pub fn create_exception(&self, kind: ExceptionKind) -> ObjRef {
        let meta = self.metadata();
        let class = match meta.class(meta.special().exception_class(kind)) {
            Ok(class) => class,
            Err(err) => {
                log::error!("exception class for {kind:?} is missing: {err}");
                return self.oom;
            }
        };
        let Ok(exception) = self.heap().alloc_object(&class) else {
            return self.oom;
        };
        if let Ok(message) = self.new_string(default_message(kind)) {
            // SAFETY: exception classes keep the message slot at this offset.
            unsafe {
                exception
                    .as_ptr()
                    .add(EXCEPTION_MESSAGE_OFFSET)
                    .cast::<ObjRef>()
                    .write(message);
            }
        }
        exception
    }

    /// Turn a raise into the object that gets thrown.
    pub(crate) fn materialize(&self, raise: Raise) -> ObjRef {
        match raise {
            Raise::Kind(kind) => self.create_exception(kind),
            Raise::Object(obj) if obj.is_null() => {
                self.create_exception(ExceptionKind::NullReference)
            }
            Raise::Object(obj) => obj,
        }
    }

    /// The runtime exception kind `exception` is an instance of, if any.
    pub fn exception_kind(&self, exception: ObjRef) -> Option<ExceptionKind> {
        if exception.is_null() {
            return None;
        }
        // SAFETY: non-null exception references are live objects.
        let class = unsafe { exception.class() };
        let special = self.metadata().special();
        ExceptionKind::ALL
            .into_iter()
            .find(|&kind| special.exception_class(kind) == class.id)
    }

    /// The message of a runtime-created exception.
    pub fn exception_message(&self, exception: ObjRef) -> Option<String> {
        if exception.is_null() {
            return None;
        }
        // SAFETY: exception objects carry the message slot at this offset.
        let message = unsafe {
            exception
                .as_ptr()
                .add(EXCEPTION_MESSAGE_OFFSET)
                .cast::<ObjRef>()
                .read()
        };
        if message.is_null() {
            None
        } else {
            // SAFETY: the message slot only ever holds strings.
            Some(unsafe { message.to_rust_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DomainCreateInfo;

    #[test]
    fn created_exceptions_know_their_kind() {
        let domain = Domain::new(DomainCreateInfo::default()).unwrap();
        for kind in ExceptionKind::ALL {
            let exception = domain.create_exception(kind);
            assert_eq!(domain.exception_kind(exception), Some(kind));
        }
        let exception = domain.create_exception(ExceptionKind::DivideByZero);
        assert_eq!(
            domain.exception_message(exception).as_deref(),
            Some("Attempted to divide by zero.")
        );
    }

    #[test]
    fn null_raises_become_null_reference() {
        let domain = Domain::new(DomainCreateInfo::default()).unwrap();
        let thrown = domain.materialize(Raise::Object(ObjRef::NULL));
        assert_eq!(domain.exception_kind(thrown), Some(ExceptionKind::NullReference));
        let overflow = domain.create_exception(ExceptionKind::Overflow);
        assert_eq!(domain.materialize(Raise::Object(overflow)), overflow);
    }

    #[test]
    fn exhausted_heap_yields_the_preallocated_exception() {
        let info = DomainCreateInfo {
            heap: object::HeapSettings { max_bytes: 4096 },
            ..DomainCreateInfo::default()
        };
        let domain = Domain::new(info).unwrap();
        let mut last = ObjRef::NULL;
        for _ in 0..1000 {
            last = domain.create_exception(ExceptionKind::Overflow);
        }
        assert_eq!(domain.exception_kind(last), Some(ExceptionKind::OutOfMemory));
    }
}
