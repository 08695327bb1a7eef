use std::{fmt, sync::Arc, sync::OnceLock};

use bitflags::bitflags;

use crate::header::ObjRef;
use crate::types::{ClassId, FieldId, MethodId, Signature, TypeRef};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct MethodFlags: u16 {
        const STATIC = 1 << 0;
        const VIRTUAL = 1 << 1;
        const FINAL = 1 << 2;
        const ABSTRACT = 1 << 3;
        /// Never overrides an inherited slot.
        const NEW_SLOT = 1 << 4;
        /// Runs under the receiver's (or class's) monitor.
        const SYNCHRONIZED = 1 << 5;
        /// Calls a native function through the platform C ABI.
        const PINVOKE = 1 << 6;
        /// Implemented by the runtime itself.
        const INTERNAL_CALL = 1 << 7;
        const CTOR = 1 << 8;
    }
}

/// Entry point of natively compiled code.
///
/// `args` holds one data address per argument (`this` first), `ret` points
/// at storage for the return value and `exc` receives an exception object
/// when the callee fails.
pub type CompiledEntry =
    unsafe extern "C" fn(args: *const *mut u8, ret: *mut u8, exc: *mut ObjRef);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClauseKind {
    /// Catches exceptions assignable to the class.
    Catch(ClassId),
    /// Runs the filter block starting at `filter_start`; it ends right
    /// where the handler starts.
    Filter { filter_start: u32 },
    Finally,
    Fault,
}

/// One row of a method's exception-clause table. Ranges are half-open
/// bytecode offsets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExceptionClause {
    pub try_start: u32,
    pub try_end: u32,
    pub handler_start: u32,
    pub handler_end: u32,
    pub kind: ClauseKind,
    /// Local that receives the caught exception, for catch and filter
    /// clauses.
    pub exvar_offset: Option<u16>,
}

impl ExceptionClause {
    pub fn try_contains(&self, ip: usize) -> bool {
        (self.try_start as usize) <= ip && ip < self.try_end as usize
    }

    pub fn handler_contains(&self, ip: usize) -> bool {
        (self.handler_start as usize) <= ip && ip < self.handler_end as usize
    }
}

/// An unresolved data-item reference in a lowered body. The transform step
/// resolves these into runtime items.
#[derive(Debug, Clone, PartialEq)]
pub enum DataRef {
    Class(ClassId),
    Method(MethodId),
    Signature(Arc<Signature>),
    String(String),
    StaticField(FieldId),
    Pointer(usize),
    Type(TypeRef),
}

/// Bytecode produced by the lowering step, ready for transformation.
#[derive(Debug, Clone, Default)]
pub struct LoweredBody {
    pub code: Vec<u8>,
    /// Operand stack depth in cells.
    pub max_stack: u32,
    /// Bytes of value-type stack.
    pub vt_stack_size: u32,
    /// Bytes of locals.
    pub locals_size: u32,
    pub clauses: Vec<ExceptionClause>,
    pub data: Vec<DataRef>,
}

/// A method definition.
pub struct MethodDef {
    pub id: MethodId,
    pub name: String,
    pub class: ClassId,
    pub sig: Arc<Signature>,
    pub flags: MethodFlags,
    /// Vtable slot of virtual methods; for interface methods, the index
    /// within the interface's region.
    pub slot: Option<u16>,
    pub generic_param_count: u16,
    /// Set on inflated methods.
    pub method_inst: Option<Arc<[TypeRef]>>,
    pub generic_def: Option<MethodId>,
    pub(crate) body: OnceLock<Arc<LoweredBody>>,
    pub(crate) compiled: OnceLock<CompiledEntry>,
    pub(crate) native: OnceLock<usize>,
}

impl MethodDef {
    pub fn is_static(&self) -> bool {
        self.flags.contains(MethodFlags::STATIC)
    }

    pub fn is_virtual(&self) -> bool {
        self.flags.contains(MethodFlags::VIRTUAL)
    }

    pub fn is_final(&self) -> bool {
        self.flags.contains(MethodFlags::FINAL)
    }

    pub fn is_synchronized(&self) -> bool {
        self.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    pub fn is_pinvoke(&self) -> bool {
        self.flags.contains(MethodFlags::PINVOKE)
    }

    pub fn is_generic_definition(&self) -> bool {
        self.generic_param_count > 0 && self.method_inst.is_none()
    }

    /// Natively compiled code, when some has been installed.
    pub fn compiled(&self) -> Option<CompiledEntry> {
        self.compiled.get().copied()
    }

    /// Address of the native function behind a pinvoke method.
    pub fn native_addr(&self) -> Option<usize> {
        self.native.get().copied()
    }
}

impl fmt::Debug for MethodDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MethodDef")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("class", &self.class)
            .field("flags", &self.flags)
            .finish_non_exhaustive()
    }
}
