use core::fmt;

use crate::class::{ClassFlags, ClassKind};
use crate::metadata::{ClassBuilder, Metadata, MetadataError};
use crate::types::{ClassId, TypeKind, TypeRef};

/// Catchable runtime exceptions raised by the execution core itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ExceptionKind {
    NullReference,
    IndexOutOfRange,
    ArrayTypeMismatch,
    DivideByZero,
    /// Non-finite floating-point result (`ckfinite`).
    Arithmetic,
    Overflow,
    InvalidCast,
    OutOfMemory,
    ThreadInterrupted,
    /// A method body failed to transform.
    InvalidProgram,
    /// Native call bridge unavailable.
    NotSupported,
    ExecutionEngine,
}

impl ExceptionKind {
    pub const COUNT: usize = ExceptionKind::ExecutionEngine as usize + 1;

    pub const ALL: [ExceptionKind; Self::COUNT] = [
        ExceptionKind::NullReference,
        ExceptionKind::IndexOutOfRange,
        ExceptionKind::ArrayTypeMismatch,
        ExceptionKind::DivideByZero,
        ExceptionKind::Arithmetic,
        ExceptionKind::Overflow,
        ExceptionKind::InvalidCast,
        ExceptionKind::OutOfMemory,
        ExceptionKind::ThreadInterrupted,
        ExceptionKind::InvalidProgram,
        ExceptionKind::NotSupported,
        ExceptionKind::ExecutionEngine,
    ];

    pub const fn class_name(self) -> &'static str {
        match self {
            ExceptionKind::NullReference => "System.NullReferenceException",
            ExceptionKind::IndexOutOfRange => "System.IndexOutOfRangeException",
            ExceptionKind::ArrayTypeMismatch => "System.ArrayTypeMismatchException",
            ExceptionKind::DivideByZero => "System.DivideByZeroException",
            ExceptionKind::Arithmetic => "System.ArithmeticException",
            ExceptionKind::Overflow => "System.OverflowException",
            ExceptionKind::InvalidCast => "System.InvalidCastException",
            ExceptionKind::OutOfMemory => "System.OutOfMemoryException",
            ExceptionKind::ThreadInterrupted => "System.Threading.ThreadInterruptedException",
            ExceptionKind::InvalidProgram => "System.InvalidProgramException",
            ExceptionKind::NotSupported => "System.NotSupportedException",
            ExceptionKind::ExecutionEngine => "System.ExecutionEngineException",
        }
    }

    /// Arithmetic-family exceptions derive from the arithmetic exception,
    /// everything else from the system exception.
    const fn is_arithmetic_family(self) -> bool {
        matches!(self, ExceptionKind::DivideByZero | ExceptionKind::Overflow)
    }
}

impl fmt::Display for ExceptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.class_name())
    }
}

/// Well-known classes.
///
/// Created once by [`Metadata::new`] and looked up by the execution core
/// for boxing primitives, allocating strings and arrays, and raising its
/// own exceptions.
#[derive(Debug, Clone)]
pub struct SpecialClasses {
    // ── Roots ──────────────────────────────────────────────────────
    pub object: ClassId,
    pub value_type: ClassId,
    pub enum_: ClassId,
    pub string: ClassId,
    /// Base class of every array class.
    pub array: ClassId,

    // ── Primitive value classes ────────────────────────────────────
    pub boolean: ClassId,
    pub char: ClassId,
    pub sbyte: ClassId,
    pub byte: ClassId,
    pub int16: ClassId,
    pub uint16: ClassId,
    pub int32: ClassId,
    pub uint32: ClassId,
    pub int64: ClassId,
    pub uint64: ClassId,
    pub single: ClassId,
    pub double: ClassId,
    pub intptr: ClassId,
    pub uintptr: ClassId,

    /// `{ value: ptr, type: class handle, klass: class handle }`
    pub typed_reference: ClassId,

    // ── Exceptions ─────────────────────────────────────────────────
    pub exception: ClassId,
    pub system_exception: ClassId,
    exceptions: [ClassId; ExceptionKind::COUNT],
}

/// Offset of the message field in every exception object.
pub const EXCEPTION_MESSAGE_OFFSET: usize = 16;
/// Offset of the inner-exception field in every exception object.
pub const EXCEPTION_INNER_OFFSET: usize = 24;

impl SpecialClasses {
    pub(crate) fn bootstrap(meta: &Metadata) -> Result<Self, MetadataError> {
        let object = meta.define_class(ClassBuilder::class("System.Object"))?.id;
        let value_type = meta
            .define_class(
                ClassBuilder::class("System.ValueType")
                    .parent(object)
                    .flags(ClassFlags::ABSTRACT),
            )?
            .id;
        let enum_ = meta
            .define_class(
                ClassBuilder::class("System.Enum")
                    .parent(value_type)
                    .flags(ClassFlags::ABSTRACT),
            )?
            .id;
        let string = meta
            .define_class(
                ClassBuilder::new("System.String", ClassKind::String)
                    .parent(object)
                    .flags(ClassFlags::SEALED),
            )?
            .id;
        let array = meta
            .define_class(
                ClassBuilder::class("System.Array")
                    .parent(object)
                    .flags(ClassFlags::ABSTRACT),
            )?
            .id;

        let primitive = |name: &str, kind: TypeKind| {
            meta.define_class(
                ClassBuilder::new(name, ClassKind::Primitive(kind))
                    .parent(value_type)
                    .flags(ClassFlags::SEALED),
            )
            .map(|c| c.id)
        };
        let boolean = primitive("System.Boolean", TypeKind::Boolean)?;
        let char = primitive("System.Char", TypeKind::Char)?;
        let sbyte = primitive("System.SByte", TypeKind::I1)?;
        let byte = primitive("System.Byte", TypeKind::U1)?;
        let int16 = primitive("System.Int16", TypeKind::I2)?;
        let uint16 = primitive("System.UInt16", TypeKind::U2)?;
        let int32 = primitive("System.Int32", TypeKind::I4)?;
        let uint32 = primitive("System.UInt32", TypeKind::U4)?;
        let int64 = primitive("System.Int64", TypeKind::I8)?;
        let uint64 = primitive("System.UInt64", TypeKind::U8)?;
        let single = primitive("System.Single", TypeKind::R4)?;
        let double = primitive("System.Double", TypeKind::R8)?;
        let intptr = primitive("System.IntPtr", TypeKind::I)?;
        let uintptr = primitive("System.UIntPtr", TypeKind::U)?;

        let typed_reference = meta
            .define_class(
                ClassBuilder::structure("System.TypedReference")
                    .parent(value_type)
                    .field("value", TypeRef::PTR)
                    .field("type", TypeRef::I)
                    .field("klass", TypeRef::I),
            )?
            .id;

        let exception = meta
            .define_class(
                ClassBuilder::class("System.Exception")
                    .parent(object)
                    .flags(ClassFlags::EXCEPTION)
                    .field("message", TypeRef::STRING)
                    .field("inner", TypeRef::OBJECT),
            )?
            .id;
        let system_exception = meta
            .define_class(
                ClassBuilder::class("System.SystemException").parent(exception),
            )?
            .id;
        let arithmetic = meta
            .define_class(
                ClassBuilder::class(ExceptionKind::Arithmetic.class_name())
                    .parent(system_exception),
            )?
            .id;

        let mut exceptions = [arithmetic; ExceptionKind::COUNT];
        for kind in ExceptionKind::ALL {
            if kind == ExceptionKind::Arithmetic {
                continue;
            }
            let parent = if kind.is_arithmetic_family() {
                arithmetic
            } else {
                system_exception
            };
            exceptions[kind as usize] = meta
                .define_class(ClassBuilder::class(kind.class_name()).parent(parent))?
                .id;
        }

        Ok(Self {
            object,
            value_type,
            enum_,
            string,
            array,
            boolean,
            char,
            sbyte,
            byte,
            int16,
            uint16,
            int32,
            uint32,
            int64,
            uint64,
            single,
            double,
            intptr,
            uintptr,
            typed_reference,
            exception,
            system_exception,
            exceptions,
        })
    }

    pub fn exception_class(&self, kind: ExceptionKind) -> ClassId {
        self.exceptions[kind as usize]
    }

    /// The value class boxing a primitive of `kind`.
    pub fn primitive_class(&self, kind: TypeKind) -> Option<ClassId> {
        Some(match kind {
            TypeKind::Boolean => self.boolean,
            TypeKind::Char => self.char,
            TypeKind::I1 => self.sbyte,
            TypeKind::U1 => self.byte,
            TypeKind::I2 => self.int16,
            TypeKind::U2 => self.uint16,
            TypeKind::I4 => self.int32,
            TypeKind::U4 => self.uint32,
            TypeKind::I8 => self.int64,
            TypeKind::U8 => self.uint64,
            TypeKind::R4 => self.single,
            TypeKind::R8 => self.double,
            TypeKind::I | TypeKind::Ptr | TypeKind::FnPtr => self.intptr,
            TypeKind::U => self.uintptr,
            _ => return None,
        })
    }
}
