//! Conversion between cells and native data.
//!
//! Cells hold widened integers, exact float bits, pointers and object
//! references; value types live out of line and the cell points at them.
//! Native data is the value as it is laid out in memory or passed to a C
//! function. The two directions are exact inverses.

use std::ptr;

use object::{ClassKind, Metadata, MetadataError, TYPED_REF_SIZE, TypeKind, TypeRef};

use crate::stackval::StackVal;

/// How values of one type move between a cell and native data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueRepr {
    Void,
    Bool,
    I1,
    U1,
    I2,
    U2,
    I4,
    U4,
    I8,
    R4,
    R8,
    /// Native ints, unmanaged and managed pointers.
    Ptr,
    Object,
    /// Out-of-line value of the given size.
    ValueType(usize),
}

impl ValueRepr {
    /// The representation of `ty`. Native (pinvoke) marshaling sizes
    /// structs by their native layout, managed code by their value size.
    pub fn of(meta: &Metadata, ty: &TypeRef, pinvoke: bool) -> Result<Self, MetadataError> {
        if ty.byref {
            return Ok(ValueRepr::Ptr);
        }
        Ok(match ty.kind {
            TypeKind::Void => ValueRepr::Void,
            TypeKind::Boolean => ValueRepr::Bool,
            TypeKind::I1 => ValueRepr::I1,
            TypeKind::U1 => ValueRepr::U1,
            TypeKind::I2 => ValueRepr::I2,
            TypeKind::U2 | TypeKind::Char => ValueRepr::U2,
            TypeKind::I4 => ValueRepr::I4,
            TypeKind::U4 => ValueRepr::U4,
            TypeKind::I8 | TypeKind::U8 => ValueRepr::I8,
            TypeKind::R4 => ValueRepr::R4,
            TypeKind::R8 => ValueRepr::R8,
            TypeKind::I | TypeKind::U | TypeKind::Ptr | TypeKind::FnPtr => ValueRepr::Ptr,
            TypeKind::String
            | TypeKind::Object
            | TypeKind::Class(_)
            | TypeKind::SzArray(_)
            | TypeKind::Array(_) => ValueRepr::Object,
            TypeKind::TypedByRef => ValueRepr::ValueType(TYPED_REF_SIZE),
            TypeKind::ValueType(id) | TypeKind::GenericInst(id) => {
                let class = meta.class(id)?;
                match class.kind {
                    ClassKind::Enum { underlying } => {
                        return Self::of(meta, &TypeRef::new(underlying), pinvoke);
                    }
                    ClassKind::Primitive(kind) => {
                        return Self::of(meta, &TypeRef::new(kind), pinvoke);
                    }
                    ClassKind::Struct => ValueRepr::ValueType(if pinvoke {
                        class.native_size
                    } else {
                        class.value_size
                    }),
                    _ => ValueRepr::Object,
                }
            }
        })
    }

    pub fn is_value_type(self) -> bool {
        matches!(self, ValueRepr::ValueType(_))
    }

    /// Bytes of native data.
    pub fn size(self) -> usize {
        match self {
            ValueRepr::Void => 0,
            ValueRepr::Bool | ValueRepr::I1 | ValueRepr::U1 => 1,
            ValueRepr::I2 | ValueRepr::U2 => 2,
            ValueRepr::I4 | ValueRepr::U4 | ValueRepr::R4 => 4,
            ValueRepr::I8 | ValueRepr::R8 | ValueRepr::Ptr | ValueRepr::Object => 8,
            ValueRepr::ValueType(size) => size,
        }
    }

    /// Load native data at `data` into `result`. For value types `result`
    /// must already point at storage for the value.
    ///
    /// # Safety
    ///
    /// `data` must be readable for [`size`](Self::size) bytes.
    pub unsafe fn load(self, result: &mut StackVal, data: *const u8) {
        unsafe {
            *result = match self {
                ValueRepr::Void => return,
                ValueRepr::Bool => StackVal::from_bool(data.read() != 0),
                ValueRepr::I1 => StackVal::from_i32(data.cast::<i8>().read() as i32),
                ValueRepr::U1 => StackVal::from_i32(data.read() as i32),
                ValueRepr::I2 => StackVal::from_i32(data.cast::<i16>().read_unaligned() as i32),
                ValueRepr::U2 => StackVal::from_i32(data.cast::<u16>().read_unaligned() as i32),
                ValueRepr::I4 | ValueRepr::U4 => {
                    StackVal::from_i32(data.cast::<i32>().read_unaligned())
                }
                ValueRepr::R4 => StackVal::from_f32(data.cast::<f32>().read_unaligned()),
                ValueRepr::I8 | ValueRepr::R8 | ValueRepr::Ptr | ValueRepr::Object => {
                    StackVal::from_raw(data.cast::<u64>().read_unaligned())
                }
                ValueRepr::ValueType(size) => {
                    ptr::copy(data, result.as_ptr::<u8>(), size);
                    return;
                }
            };
        }
    }

    /// Store `val` as native data at `data`, narrowing small integers.
    ///
    /// # Safety
    ///
    /// `data` must be writable for [`size`](Self::size) bytes; for value
    /// types `val` must point at a readable value.
    pub unsafe fn store(self, val: &StackVal, data: *mut u8) {
        unsafe {
            match self {
                ValueRepr::Void => {}
                ValueRepr::Bool => data.write((val.as_i32() != 0) as u8),
                ValueRepr::I1 | ValueRepr::U1 => data.write(val.as_i32() as u8),
                ValueRepr::I2 | ValueRepr::U2 => {
                    data.cast::<u16>().write_unaligned(val.as_i32() as u16)
                }
                ValueRepr::I4 | ValueRepr::U4 => {
                    data.cast::<i32>().write_unaligned(val.as_i32())
                }
                ValueRepr::R4 => data.cast::<f32>().write_unaligned(val.as_f32()),
                ValueRepr::I8 | ValueRepr::R8 | ValueRepr::Ptr | ValueRepr::Object => {
                    data.cast::<u64>().write_unaligned(val.raw())
                }
                ValueRepr::ValueType(size) => ptr::copy(val.as_ptr::<u8>(), data, size),
            }
        }
    }

    /// Address of the native data a cell stands for: the out-of-line
    /// storage of a value type, otherwise the cell itself.
    pub fn data_addr(self, val: &StackVal) -> *mut u8 {
        match self {
            ValueRepr::ValueType(_) => val.as_ptr(),
            _ => ptr::from_ref(val).cast_mut().cast(),
        }
    }
}

/// Load a value of type `ty` from native data.
///
/// # Safety
///
/// See [`ValueRepr::load`].
pub unsafe fn stackval_from_data(
    meta: &Metadata,
    ty: &TypeRef,
    result: &mut StackVal,
    data: *const u8,
    pinvoke: bool,
) -> Result<(), MetadataError> {
    let repr = ValueRepr::of(meta, ty, pinvoke)?;
    unsafe { repr.load(result, data) };
    Ok(())
}

/// Store a value of type `ty` as native data.
///
/// # Safety
///
/// See [`ValueRepr::store`].
pub unsafe fn stackval_to_data(
    meta: &Metadata,
    ty: &TypeRef,
    val: &StackVal,
    data: *mut u8,
    pinvoke: bool,
) -> Result<(), MetadataError> {
    let repr = ValueRepr::of(meta, ty, pinvoke)?;
    unsafe { repr.store(val, data) };
    Ok(())
}

/// Address of the native data for a cell of type `ty`.
pub fn stackval_to_data_addr(
    meta: &Metadata,
    ty: &TypeRef,
    val: &StackVal,
) -> Result<*mut u8, MetadataError> {
    Ok(ValueRepr::of(meta, ty, false)?.data_addr(val))
}

#[cfg(test)]
mod tests {
    use super::*;
    use object::{ClassBuilder, ClassFlags};

    fn meta() -> Metadata {
        Metadata::new().unwrap()
    }

    fn round_trip(meta: &Metadata, ty: TypeRef, bytes: &[u8]) -> Vec<u8> {
        let mut cell = StackVal::ZERO;
        let mut out = vec![0u8; bytes.len()];
        unsafe {
            stackval_from_data(meta, &ty, &mut cell, bytes.as_ptr(), false).unwrap();
            stackval_to_data(meta, &ty, &cell, out.as_mut_ptr(), false).unwrap();
        }
        out
    }

    #[test]
    fn primitives_round_trip() {
        let meta = meta();
        for (ty, bytes) in [
            (TypeRef::I1, vec![0x80]),
            (TypeRef::U1, vec![0xff]),
            (TypeRef::I2, vec![0x00, 0x80]),
            (TypeRef::CHAR, vec![0x41, 0x00]),
            (TypeRef::I4, (-7i32).to_le_bytes().to_vec()),
            (TypeRef::U4, u32::MAX.to_le_bytes().to_vec()),
            (TypeRef::I8, i64::MIN.to_le_bytes().to_vec()),
            (TypeRef::R4, 0x7fc0_0001u32.to_le_bytes().to_vec()),
            (TypeRef::R8, (-0.0f64).to_bits().to_le_bytes().to_vec()),
            (TypeRef::I, 0xdead_beefusize.to_le_bytes().to_vec()),
        ] {
            assert_eq!(round_trip(&meta, ty, &bytes), bytes, "{ty:?}");
        }
    }

    #[test]
    fn small_integers_widen_in_cells() {
        let meta = meta();
        let mut cell = StackVal::ZERO;
        unsafe {
            stackval_from_data(&meta, &TypeRef::I1, &mut cell, [0xfeu8].as_ptr(), false).unwrap();
        }
        assert_eq!(cell.as_i64(), -2);
        unsafe {
            stackval_from_data(&meta, &TypeRef::U2, &mut cell, [0xff, 0xff].as_ptr(), false)
                .unwrap();
        }
        assert_eq!(cell.as_i32(), 0xffff);
    }

    #[test]
    fn booleans_store_nonzero_as_one() {
        let meta = meta();
        let mut out = [0u8; 1];
        unsafe {
            stackval_to_data(&meta, &TypeRef::BOOLEAN, &StackVal::from_i32(42), out.as_mut_ptr(), false)
                .unwrap();
        }
        assert_eq!(out, [1]);
    }

    #[test]
    fn enums_use_their_underlying_type() {
        let meta = meta();
        let color = meta
            .define_class(ClassBuilder::enumeration("Color", TypeKind::U1))
            .unwrap()
            .id;
        let ty = TypeRef::value_type(color);
        assert_eq!(ValueRepr::of(&meta, &ty, false).unwrap(), ValueRepr::U1);
        assert_eq!(round_trip(&meta, ty, &[200]), vec![200]);
    }

    #[test]
    fn structs_copy_through_their_storage() {
        let meta = meta();
        let point = meta
            .define_class(
                ClassBuilder::structure("Point")
                    .field("x", TypeRef::I4)
                    .field("y", TypeRef::I4),
            )
            .unwrap()
            .id;
        let ty = TypeRef::value_type(point);
        let mut storage = [0u8; 8];
        let mut cell = StackVal::from_ptr(storage.as_mut_ptr());
        let data: Vec<u8> = [1i32, -1].iter().flat_map(|v| v.to_le_bytes()).collect();
        let mut out = [0u8; 8];
        unsafe {
            stackval_from_data(&meta, &ty, &mut cell, data.as_ptr(), false).unwrap();
            assert_eq!(cell.as_ptr::<u8>(), storage.as_mut_ptr());
            stackval_to_data(&meta, &ty, &cell, out.as_mut_ptr(), false).unwrap();
        }
        assert_eq!(&storage[..], &data[..]);
        assert_eq!(&out[..], &data[..]);
        assert_eq!(
            stackval_to_data_addr(&meta, &ty, &cell).unwrap(),
            storage.as_mut_ptr()
        );
    }

    #[test]
    fn pinvoke_uses_native_size() {
        let meta = meta();
        let packed = meta
            .define_class(
                ClassBuilder::structure("Packed")
                    .flags(ClassFlags::EXPLICIT_NATIVE_LAYOUT)
                    .field("a", TypeRef::I4)
                    .field("b", TypeRef::U1)
                    .native_size(5),
            )
            .unwrap()
            .id;
        let ty = TypeRef::value_type(packed);
        assert_eq!(ValueRepr::of(&meta, &ty, false).unwrap(), ValueRepr::ValueType(8));
        assert_eq!(ValueRepr::of(&meta, &ty, true).unwrap(), ValueRepr::ValueType(5));
    }

    #[test]
    fn byref_and_references_are_pointers() {
        let meta = meta();
        assert_eq!(
            ValueRepr::of(&meta, &TypeRef::I4.by_ref(), false).unwrap(),
            ValueRepr::Ptr
        );
        assert_eq!(ValueRepr::of(&meta, &TypeRef::STRING, false).unwrap(), ValueRepr::Object);
        let cell = StackVal::from_i32(9);
        let addr = stackval_to_data_addr(&meta, &TypeRef::I4, &cell).unwrap();
        assert_eq!(unsafe { addr.cast::<i32>().read() }, 9);
    }
}
