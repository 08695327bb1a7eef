use core::fmt;

/// Identity of a registered class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClassId(pub u32);

/// Identity of a registered method. Inflated generic methods get their own
/// identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MethodId(pub u32);

/// A field of a class, by declaration index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldId {
    pub class: ClassId,
    pub index: u16,
}

/// Element type of a [`TypeRef`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeKind {
    Void,
    Boolean,
    Char,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    U8,
    R4,
    R8,
    /// Native-sized signed integer.
    I,
    /// Native-sized unsigned integer.
    U,
    /// Unmanaged pointer.
    Ptr,
    FnPtr,
    String,
    Object,
    /// Reference type (class or interface).
    Class(ClassId),
    /// Struct, primitive wrapper or enum.
    ValueType(ClassId),
    /// Single-dimension, zero-based array; the id is the array class.
    SzArray(ClassId),
    /// General array; the id is the array class.
    Array(ClassId),
    /// A closed generic instantiation; the id is the instantiated class,
    /// which may be a value type or a reference type.
    GenericInst(ClassId),
    TypedByRef,
}

/// A type as it appears in a signature, field or local.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct TypeRef {
    pub kind: TypeKind,
    pub byref: bool,
}

macro_rules! type_consts {
    ($($name:ident => $kind:ident),+ $(,)?) => {
        $(pub const $name: TypeRef = TypeRef::new(TypeKind::$kind);)+
    };
}

impl TypeRef {
    type_consts! {
        VOID => Void,
        BOOLEAN => Boolean,
        CHAR => Char,
        I1 => I1,
        U1 => U1,
        I2 => I2,
        U2 => U2,
        I4 => I4,
        U4 => U4,
        I8 => I8,
        U8 => U8,
        R4 => R4,
        R8 => R8,
        I => I,
        U => U,
        PTR => Ptr,
        STRING => String,
        OBJECT => Object,
        TYPED_BY_REF => TypedByRef,
    }

    pub const fn new(kind: TypeKind) -> Self {
        Self { kind, byref: false }
    }

    pub const fn class(id: ClassId) -> Self {
        Self::new(TypeKind::Class(id))
    }

    pub const fn value_type(id: ClassId) -> Self {
        Self::new(TypeKind::ValueType(id))
    }

    /// The by-reference form of this type (`T&`).
    pub const fn by_ref(self) -> Self {
        Self {
            kind: self.kind,
            byref: true,
        }
    }

    pub const fn is_void(&self) -> bool {
        matches!(self.kind, TypeKind::Void) && !self.byref
    }

    /// Size of a primitive (non-struct) value, or `None` for value types
    /// whose size depends on their class.
    pub const fn primitive_size(&self) -> Option<usize> {
        if self.byref {
            return Some(8);
        }
        Some(match self.kind {
            TypeKind::Void => 0,
            TypeKind::Boolean | TypeKind::I1 | TypeKind::U1 => 1,
            TypeKind::Char | TypeKind::I2 | TypeKind::U2 => 2,
            TypeKind::I4 | TypeKind::U4 | TypeKind::R4 => 4,
            TypeKind::I8
            | TypeKind::U8
            | TypeKind::R8
            | TypeKind::I
            | TypeKind::U
            | TypeKind::Ptr
            | TypeKind::FnPtr
            | TypeKind::String
            | TypeKind::Object
            | TypeKind::Class(_)
            | TypeKind::SzArray(_)
            | TypeKind::Array(_) => 8,
            TypeKind::ValueType(_)
            | TypeKind::GenericInst(_)
            | TypeKind::TypedByRef => return None,
        })
    }

    /// Whether a value of this type is an object reference. Generic
    /// instantiations need the class to decide and report `false` here.
    pub const fn is_object_reference(&self) -> bool {
        !self.byref
            && matches!(
                self.kind,
                TypeKind::String
                    | TypeKind::Object
                    | TypeKind::Class(_)
                    | TypeKind::SzArray(_)
                    | TypeKind::Array(_)
            )
    }
}

impl fmt::Debug for TypeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if self.byref {
            f.write_str("&")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallConv {
    Default,
    /// Managed varargs; arguments from [`Signature::sentinel`] on are
    /// variable.
    VarArg,
    /// Unmanaged C calling convention.
    C,
}

/// A method or call-site signature.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Signature {
    pub hasthis: bool,
    pub params: Vec<TypeRef>,
    pub ret: TypeRef,
    pub call_conv: CallConv,
    /// For call-site vararg signatures: index of the first variable
    /// argument in `params`.
    pub sentinel: Option<usize>,
}

impl Signature {
    pub fn new(params: Vec<TypeRef>, ret: TypeRef) -> Self {
        Self {
            hasthis: false,
            params,
            ret,
            call_conv: CallConv::Default,
            sentinel: None,
        }
    }

    pub fn instance(params: Vec<TypeRef>, ret: TypeRef) -> Self {
        Self {
            hasthis: true,
            ..Self::new(params, ret)
        }
    }

    pub fn native(params: Vec<TypeRef>, ret: TypeRef) -> Self {
        Self {
            call_conv: CallConv::C,
            ..Self::new(params, ret)
        }
    }

    /// A call-site signature whose parameters from `sentinel` on are
    /// variable arguments.
    pub fn vararg_call(mut self, sentinel: usize) -> Self {
        self.call_conv = CallConv::VarArg;
        self.sentinel = Some(sentinel);
        self
    }

    /// Parameter count excluding `this`.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Fixed (non-variable) parameter types.
    pub fn fixed_params(&self) -> &[TypeRef] {
        &self.params[..self.sentinel.unwrap_or(self.params.len())]
    }

    /// Variable parameter types of a vararg call site.
    pub fn var_params(&self) -> &[TypeRef] {
        match self.sentinel {
            Some(at) => &self.params[at..],
            None => &[],
        }
    }

    /// Signatures match for overriding: same parameters and return type.
    pub fn same_shape(&self, other: &Signature) -> bool {
        self.params == other.params && self.ret == other.ret
    }
}
