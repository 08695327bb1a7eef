use std::{any::Any, cell::UnsafeCell, fmt, sync::OnceLock};

use bitflags::bitflags;

use crate::types::{ClassId, MethodId, TypeKind, TypeRef};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct ClassFlags: u16 {
        const SEALED = 1 << 0;
        const ABSTRACT = 1 << 1;
        /// Layout follows native rules when marshaled (explicit
        /// `native_size`).
        const EXPLICIT_NATIVE_LAYOUT = 1 << 2;
        /// Subclass of the exception root.
        const EXCEPTION = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variance {
    Invariant,
    /// `out T`
    Covariant,
    /// `in T`
    Contravariant,
}

/// Instantiation info of a closed generic class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenericInst {
    /// The open definition. Instantiations of the same definition are
    /// compared argument by argument under `variance`.
    pub definition: ClassId,
    pub args: Vec<TypeRef>,
    pub variance: Vec<Variance>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClassKind {
    Class,
    Interface,
    /// User-defined struct.
    Struct,
    /// Built-in value class whose values are the given primitive.
    Primitive(TypeKind),
    Enum { underlying: TypeKind },
    String,
    Array {
        element: TypeRef,
        rank: u8,
        /// Single-dimension, zero-based (`T[]`), as opposed to `T[*]`.
        szarray: bool,
        element_size: usize,
    },
}

#[derive(Debug, Clone)]
pub struct FieldDef {
    pub name: String,
    pub ty: TypeRef,
    /// Instance fields of reference classes: offset from the object start
    /// (after the header). Value-type fields: offset from the start of the
    /// value. Static fields: offset into the class's static storage.
    pub offset: usize,
    pub is_static: bool,
}

/// Backing storage of a class's static fields.
pub struct StaticStorage(UnsafeCell<Box<[u64]>>);

// SAFETY: static field access is synchronized by the executing program, as
// for any other field; the storage itself never moves.
unsafe impl Send for StaticStorage {}
unsafe impl Sync for StaticStorage {}

impl StaticStorage {
    pub(crate) fn new(bytes: usize) -> Self {
        Self(UnsafeCell::new(vec![0u64; bytes.div_ceil(8)].into_boxed_slice()))
    }

    /// Address of the static field at `offset`.
    pub fn addr(&self, offset: usize) -> *mut u8 {
        // SAFETY: only the base pointer is taken, no reference escapes.
        unsafe { (*self.0.get()).as_mut_ptr().cast::<u8>().add(offset) }
    }
}

/// A loaded class.
///
/// Classes are registered once in [`Metadata`](crate::Metadata) and never
/// freed, so object headers can point at them directly.
pub struct Class {
    pub id: ClassId,
    pub name: String,
    pub kind: ClassKind,
    pub flags: ClassFlags,
    pub parent: Option<ClassId>,
    /// Every implemented interface, including inherited ones.
    pub interfaces: Vec<ClassId>,
    /// Start of each interface's method region in `vtable`.
    pub interface_offsets: Vec<(ClassId, usize)>,
    pub fields: Vec<FieldDef>,
    pub methods: Vec<MethodId>,
    /// Virtual slots followed by the interface regions.
    pub vtable: Vec<MethodId>,
    /// Number of class (non-interface) virtual slots at the front of
    /// `vtable`.
    pub virtual_count: usize,
    /// Allocation size of an instance, header included.
    pub instance_size: usize,
    /// Size of a value of this type when stored in a field or local; the
    /// pointer size for reference types.
    pub value_size: usize,
    /// Marshaled size for native calls.
    pub native_size: usize,
    pub align: usize,
    pub generic: Option<GenericInst>,
    pub statics: StaticStorage,
    /// Interpreter-owned per-class state, installed on first use.
    pub interp_vtable: OnceLock<Box<dyn Any + Send + Sync>>,
}

impl Class {
    pub fn is_valuetype(&self) -> bool {
        matches!(
            self.kind,
            ClassKind::Struct | ClassKind::Primitive(_) | ClassKind::Enum { .. }
        )
    }

    pub fn is_interface(&self) -> bool {
        matches!(self.kind, ClassKind::Interface)
    }

    pub fn is_array(&self) -> bool {
        matches!(self.kind, ClassKind::Array { .. })
    }

    pub fn is_exception(&self) -> bool {
        self.flags.contains(ClassFlags::EXCEPTION)
    }

    /// The type of a value of this class as stored in a field or local.
    pub fn byval_type(&self) -> TypeRef {
        TypeRef::new(match &self.kind {
            ClassKind::Primitive(kind) => *kind,
            ClassKind::Struct | ClassKind::Enum { .. } => TypeKind::ValueType(self.id),
            ClassKind::String => TypeKind::String,
            ClassKind::Array { szarray: true, .. } => TypeKind::SzArray(self.id),
            ClassKind::Array { .. } => TypeKind::Array(self.id),
            ClassKind::Class | ClassKind::Interface => TypeKind::Class(self.id),
        })
    }

    /// Rank of an array class, zero otherwise.
    pub fn rank(&self) -> u8 {
        match self.kind {
            ClassKind::Array { rank, .. } => rank,
            _ => 0,
        }
    }

    pub fn element_size(&self) -> usize {
        match self.kind {
            ClassKind::Array { element_size, .. } => element_size,
            _ => 0,
        }
    }

    pub fn element_type(&self) -> Option<TypeRef> {
        match self.kind {
            ClassKind::Array { element, .. } => Some(element),
            _ => None,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Exact interface region lookup, without variance.
    pub fn interface_offset(&self, iface: ClassId) -> Option<usize> {
        self.interface_offsets
            .iter()
            .find(|(id, _)| *id == iface)
            .map(|(_, offset)| *offset)
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
