use std::fmt;

use bytecode::DecodeError;
use object::{AllocError, MetadataError, ObjRef};

/// Failure of the transform step. Thrown at the call site as
/// invalid-program.
#[derive(Debug, Clone, PartialEq)]
pub enum TransformError {
    NoBody { method: String },
    Decode { method: String, error: DecodeError },
    ClauseOutOfRange { method: String, clause: usize },
    Metadata(MetadataError),
    Alloc(AllocError),
}

impl fmt::Display for TransformError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransformError::NoBody { method } => {
                write!(f, "method {method} has no body")
            }
            TransformError::Decode { method, error } => {
                write!(f, "invalid bytecode in {method}: {error}")
            }
            TransformError::ClauseOutOfRange { method, clause } => {
                write!(f, "clause {clause} of {method} lies outside its code")
            }
            TransformError::Metadata(err) => write!(f, "{err}"),
            TransformError::Alloc(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for TransformError {}

impl From<MetadataError> for TransformError {
    fn from(err: MetadataError) -> Self {
        TransformError::Metadata(err)
    }
}

impl From<AllocError> for TransformError {
    fn from(err: AllocError) -> Self {
        TransformError::Alloc(err)
    }
}

/// Failure crossing into native code. Thrown as not-supported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeFault {
    /// No native bridge is compiled in.
    Unavailable,
    /// A pinvoke method without a native address.
    Unbound { method: String },
    /// A parameter or return type the bridge cannot pass.
    Unmarshalable { ty: String },
}

impl fmt::Display for NativeFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NativeFault::Unavailable => {
                f.write_str("native calls are not available in this build")
            }
            NativeFault::Unbound { method } => {
                write!(f, "pinvoke method {method} has no native address")
            }
            NativeFault::Unmarshalable { ty } => {
                write!(f, "cannot pass {ty} to native code")
            }
        }
    }
}

impl std::error::Error for NativeFault {}

/// Failure of an entry point.
#[derive(Debug, Clone, PartialEq)]
pub enum InvokeError {
    /// The managed code threw and nothing caught it.
    Exception(ObjRef),
    Transform(TransformError),
    Metadata(MetadataError),
    ArgumentCount { expected: usize, found: usize },
    /// Re-entry was requested on a thread that is not executing managed
    /// code.
    NoDomain,
}

impl fmt::Display for InvokeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvokeError::Exception(exc) => write!(f, "unhandled exception {exc:?}"),
            InvokeError::Transform(err) => write!(f, "{err}"),
            InvokeError::Metadata(err) => write!(f, "{err}"),
            InvokeError::ArgumentCount { expected, found } => {
                write!(f, "expected {expected} arguments, got {found}")
            }
            InvokeError::NoDomain => {
                f.write_str("no domain is active on this thread")
            }
        }
    }
}

impl std::error::Error for InvokeError {}

impl From<TransformError> for InvokeError {
    fn from(err: TransformError) -> Self {
        InvokeError::Transform(err)
    }
}

impl From<MetadataError> for InvokeError {
    fn from(err: MetadataError) -> Self {
        InvokeError::Metadata(err)
    }
}

/// Failure creating a domain.
#[derive(Debug, Clone, PartialEq)]
pub enum DomainError {
    Metadata(MetadataError),
    Alloc(AllocError),
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DomainError::Metadata(err) => write!(f, "{err}"),
            DomainError::Alloc(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DomainError {}

impl From<MetadataError> for DomainError {
    fn from(err: MetadataError) -> Self {
        DomainError::Metadata(err)
    }
}

impl From<AllocError> for DomainError {
    fn from(err: AllocError) -> Self {
        DomainError::Alloc(err)
    }
}

/// Report an execution-environment fault and abort the process.
///
/// These are broken invariants (corrupt bytecode, a broken resume
/// protocol), never managed exceptions.
#[cold]
pub fn fatal(dump: fmt::Arguments<'_>) -> ! {
    log::error!("fatal execution engine error\n{dump}");
    if !log::log_enabled!(log::Level::Error) {
        eprintln!("fatal execution engine error\n{dump}");
    }
    std::process::abort()
}
