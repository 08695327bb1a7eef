use std::sync::{Arc, OnceLock};

use ahash::AHashMap;
use object::{
    Class, CompiledEntry, ExceptionClause, MethodDef, MethodFlags, MethodId, ObjRef, Signature,
    TypeRef,
};
use parking_lot::Mutex;

use crate::marshal::ValueRepr;

/// How calls to a method are carried out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// Run by the interpreter from its transformed code.
    Interpreted,
    /// Natively compiled code.
    Compiled(CompiledEntry),
    /// A C function reached through the native bridge.
    Pinvoke(Option<usize>),
    /// Implemented by a Rust function registered on the domain.
    Internal,
    /// No implementation; only reachable through virtual dispatch.
    Abstract,
}

/// A resolved data item of transformed code.
#[derive(Debug, Clone)]
pub enum DataItem {
    Class(Arc<Class>),
    Method(Arc<InterpMethod>),
    Signature(Arc<Signature>),
    String(ObjRef),
    /// Address of a static field.
    StaticField(usize),
    Pointer(usize),
    Type(TypeRef),
}

/// Transformed code of an interpreted method.
#[derive(Debug, Clone)]
pub struct MethodCode {
    pub bytes: Vec<u8>,
    /// Operand stack cells, including spare cells for the return value of
    /// a call and the receiver `NEWOBJ` inserts.
    pub stack_cells: usize,
    /// Bytes of value-type stack, a multiple of 8.
    pub vt_stack_size: usize,
    /// Bytes of locals, a multiple of 8.
    pub locals_size: usize,
    pub clauses: Vec<ExceptionClause>,
    pub data: Vec<DataItem>,
}

impl MethodCode {
    /// Cells of frame memory a running activation needs.
    pub fn frame_cells(&self) -> usize {
        self.stack_cells + self.vt_stack_size / 8 + self.locals_size / 8
    }
}

/// Per-method interpreter descriptor.
///
/// Created once per method and shared; only `code` is filled in later, by
/// the transform step, and it never changes afterwards.
pub struct InterpMethod {
    pub method: Arc<MethodDef>,
    pub class: Arc<Class>,
    pub sig: Arc<Signature>,
    pub hasthis: bool,
    pub vararg: bool,
    /// Declared parameters, `this` excluded.
    pub param_count: usize,
    pub kind: MethodKind,
    /// Managed representation of each argument cell, `this` first.
    pub(crate) arg_reprs: Vec<ValueRepr>,
    pub(crate) ret_repr: ValueRepr,
    /// Native representations, for pinvoke methods.
    pub(crate) native_arg_reprs: Vec<ValueRepr>,
    pub(crate) native_ret_repr: ValueRepr,
    pub(crate) code: OnceLock<MethodCode>,
}

impl InterpMethod {
    pub fn id(&self) -> MethodId {
        self.method.id
    }

    pub fn name(&self) -> &str {
        &self.method.name
    }

    /// `Class::Method`, for diagnostics.
    pub fn full_name(&self) -> String {
        format!("{}::{}", self.class.name, self.method.name)
    }

    pub fn is_synchronized(&self) -> bool {
        self.method.flags.contains(MethodFlags::SYNCHRONIZED)
    }

    /// Number of argument cells, `this` included.
    pub fn arg_cells(&self) -> usize {
        self.param_count + self.hasthis as usize
    }

    pub fn returns_value(&self) -> bool {
        self.ret_repr != ValueRepr::Void
    }

    /// The transformed code, once available.
    pub fn code(&self) -> Option<&MethodCode> {
        self.code.get()
    }

    pub fn is_transformed(&self) -> bool {
        self.code.get().is_some()
    }
}

impl std::fmt::Debug for InterpMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InterpMethod")
            .field("method", &self.full_name())
            .field("kind", &self.kind)
            .field("transformed", &self.is_transformed())
            .finish()
    }
}

/// Descriptors by method identity.
#[derive(Default)]
pub(crate) struct MethodTable {
    map: Mutex<AHashMap<MethodId, Arc<InterpMethod>>>,
}

impl MethodTable {
    pub(crate) fn get(&self, id: MethodId) -> Option<Arc<InterpMethod>> {
        self.map.lock().get(&id).cloned()
    }

    /// Insert `imethod` unless another thread got there first; returns the
    /// descriptor that ends up in the table.
    pub(crate) fn insert(&self, imethod: InterpMethod) -> Arc<InterpMethod> {
        self.map
            .lock()
            .entry(imethod.id())
            .or_insert_with(|| Arc::new(imethod))
            .clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.map.lock().len()
    }
}
