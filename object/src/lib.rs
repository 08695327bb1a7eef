mod types;
mod class;
mod method;
mod header;
mod heap;
mod metadata;
mod special;

pub use types::{CallConv, ClassId, FieldId, MethodId, Signature, TypeKind, TypeRef};
pub use class::{
    Class, ClassFlags, ClassKind, FieldDef, GenericInst, StaticStorage, Variance,
};
pub use method::{
    ClauseKind, CompiledEntry, DataRef, ExceptionClause, LoweredBody, MethodDef,
    MethodFlags,
};
pub use header::{
    ARRAY_DATA_OFFSET, ArrayBounds, ArrayObject, HEADER_SIZE, ObjRef,
    ObjectHeader, STRING_DATA_OFFSET, StringObject,
};
pub use heap::{AllocError, Heap, HeapSettings};
pub use metadata::{
    ClassBuilder, DefinedClass, Metadata, MetadataError, MethodSpec,
    TYPED_REF_SIZE,
};
pub use special::{
    EXCEPTION_INNER_OFFSET, EXCEPTION_MESSAGE_OFFSET, ExceptionKind,
    SpecialClasses,
};

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> Metadata {
        Metadata::new().unwrap()
    }

    fn virt(name: &str) -> MethodSpec {
        MethodSpec::new(
            name,
            Signature::instance(vec![], TypeRef::I4),
            MethodFlags::VIRTUAL,
        )
    }

    // ── Well-known classes ─────────────────────────────────────────

    #[test]
    fn bootstrap_defines_exception_taxonomy() {
        let meta = meta();
        let special = meta.special();
        let exception = meta.class(special.exception).unwrap();
        assert_eq!(
            exception.field("message").unwrap().offset,
            EXCEPTION_MESSAGE_OFFSET
        );
        assert_eq!(
            exception.field("inner").unwrap().offset,
            EXCEPTION_INNER_OFFSET
        );

        for kind in ExceptionKind::ALL {
            let id = special.exception_class(kind);
            let class = meta.class(id).unwrap();
            assert_eq!(class.name, kind.class_name());
            assert!(class.is_exception());
            assert!(meta.is_assignable(id, special.exception));
        }
        assert!(meta.is_assignable(
            special.exception_class(ExceptionKind::DivideByZero),
            special.exception_class(ExceptionKind::Arithmetic),
        ));
        assert!(!meta.is_assignable(
            special.exception_class(ExceptionKind::NullReference),
            special.exception_class(ExceptionKind::Arithmetic),
        ));
    }

    #[test]
    fn primitive_classes_are_boxable_value_types() {
        let meta = meta();
        let int32 = meta.class(meta.special().int32).unwrap();
        assert!(int32.is_valuetype());
        assert_eq!(int32.value_size, 4);
        assert_eq!(int32.instance_size, HEADER_SIZE + 8);
        assert_eq!(int32.byval_type(), TypeRef::I4);
        assert!(meta.is_assignable(int32.id, meta.special().value_type));
        assert_eq!(meta.class_of(&TypeRef::R8), Some(meta.special().double));
    }

    // ── Layout ─────────────────────────────────────────────────────

    #[test]
    fn struct_layout_aligns_fields() {
        let meta = meta();
        let point = meta
            .define_class(
                ClassBuilder::structure("Sample.Mixed")
                    .field("a", TypeRef::U1)
                    .field("b", TypeRef::I4)
                    .field("c", TypeRef::I8)
                    .field("d", TypeRef::I2),
            )
            .unwrap()
            .id;
        let class = meta.class(point).unwrap();
        let offsets: Vec<_> = class.fields.iter().map(|f| f.offset).collect();
        assert_eq!(offsets, vec![0, 4, 8, 16]);
        assert_eq!(class.value_size, 24);
        assert_eq!(class.align, 8);
        assert_eq!(class.native_size, 24);
        assert_eq!(meta.value_size(&TypeRef::value_type(point)).unwrap(), 24);
    }

    #[test]
    fn native_size_override_only_affects_marshaling() {
        let meta = meta();
        let id = meta
            .define_class(
                ClassBuilder::structure("Sample.Packed")
                    .field("a", TypeRef::U1)
                    .field("b", TypeRef::I4)
                    .native_size(5),
            )
            .unwrap()
            .id;
        let ty = TypeRef::value_type(id);
        assert_eq!(meta.value_size(&ty).unwrap(), 8);
        assert_eq!(meta.native_size(&ty).unwrap(), 5);
    }

    #[test]
    fn subclass_fields_follow_parent_fields() {
        let meta = meta();
        let base = meta
            .define_class(ClassBuilder::class("Sample.Base").field("x", TypeRef::I4))
            .unwrap()
            .id;
        let derived = meta
            .define_class(
                ClassBuilder::class("Sample.Derived")
                    .parent(base)
                    .field("y", TypeRef::OBJECT)
                    .static_field("count", TypeRef::I8),
            )
            .unwrap()
            .id;
        let class = meta.class(derived).unwrap();
        assert_eq!(class.field("y").unwrap().offset, HEADER_SIZE + 8);
        assert_eq!(class.instance_size, HEADER_SIZE + 16);
        assert!(class.field("count").unwrap().is_static);
    }

    #[test]
    fn cannot_derive_from_sealed_or_value_types() {
        let meta = meta();
        let string = meta.special().string;
        assert!(matches!(
            meta.define_class(ClassBuilder::class("Sample.Bad").parent(string)),
            Err(MetadataError::InvalidParent { .. })
        ));
    }

    // ── Vtables ────────────────────────────────────────────────────

    #[test]
    fn overrides_reuse_the_parent_slot() {
        let meta = meta();
        let base = meta
            .define_class(
                ClassBuilder::class("Sample.Animal")
                    .method(virt("Speak"))
                    .method(virt("Legs")),
            )
            .unwrap();
        let derived = meta
            .define_class(
                ClassBuilder::class("Sample.Dog")
                    .parent(base.id)
                    .method(virt("Legs"))
                    .method(MethodSpec::new(
                        "Speak",
                        Signature::instance(vec![], TypeRef::I4),
                        MethodFlags::VIRTUAL | MethodFlags::NEW_SLOT,
                    )),
            )
            .unwrap();
        let class = meta.class(derived.id).unwrap();
        assert_eq!(
            class.vtable,
            vec![base.methods[0], derived.methods[0], derived.methods[1]]
        );
        assert_eq!(meta.method(derived.methods[0]).unwrap().slot, Some(1));
        assert_eq!(meta.method(derived.methods[1]).unwrap().slot, Some(2));
    }

    #[test]
    fn interface_regions_follow_class_slots() {
        let meta = meta();
        let iface = meta
            .define_class(
                ClassBuilder::interface("Sample.IShape")
                    .method(virt("Area"))
                    .method(virt("Sides")),
            )
            .unwrap();
        let square = meta
            .define_class(
                ClassBuilder::class("Sample.Square")
                    .implements(iface.id)
                    .method(virt("Sides"))
                    .method(virt("ComputeArea"))
                    .explicit_impl(iface.methods[0], 1),
            )
            .unwrap();
        let class = meta.class(square.id).unwrap();
        assert_eq!(class.virtual_count, 2);
        assert_eq!(class.interface_offset(iface.id), Some(2));
        assert_eq!(&class.vtable[2..], &[square.methods[1], square.methods[0]]);
        assert!(meta.is_assignable(square.id, iface.id));
    }

    #[test]
    fn covariant_interfaces_match_by_argument() {
        let meta = meta();
        let special = meta.special().clone();
        let open = meta
            .define_class(ClassBuilder::interface("Sample.IProducer`1"))
            .unwrap()
            .id;
        let instance = |arg: TypeRef, name: &str| {
            meta.define_class(
                ClassBuilder::interface(name)
                    .method(virt("Produce"))
                    .generic(GenericInst {
                        definition: open,
                        args: vec![arg],
                        variance: vec![Variance::Covariant],
                    }),
            )
            .unwrap()
            .id
        };
        let of_string = instance(TypeRef::STRING, "Sample.IProducer<String>");
        let of_object = instance(TypeRef::OBJECT, "Sample.IProducer<Object>");
        let of_int = instance(TypeRef::I4, "Sample.IProducer<Int32>");
        let producer = meta
            .define_class(
                ClassBuilder::class("Sample.Words")
                    .implements(of_string)
                    .method(virt("Produce")),
            )
            .unwrap()
            .id;

        let class = meta.class(producer).unwrap();
        let target = meta.class(of_object).unwrap();
        assert_eq!(meta.interface_offset(&class, &target), Some(1));
        assert!(meta.is_assignable(producer, of_object));
        assert!(!meta.is_assignable(producer, of_int));
        assert!(!meta.is_assignable(special.string, of_object));
    }

    // ── Arrays & generics ──────────────────────────────────────────

    #[test]
    fn array_classes_are_memoized_and_covariant() {
        let meta = meta();
        let strings = meta.array_class(TypeRef::STRING, 1, true).unwrap();
        assert_eq!(meta.array_class(TypeRef::STRING, 1, true).unwrap(), strings);
        let objects = meta.array_class(TypeRef::OBJECT, 1, true).unwrap();
        let ints = meta.array_class(TypeRef::I4, 1, true).unwrap();
        let matrix = meta.array_class(TypeRef::I4, 2, false).unwrap();

        assert!(meta.is_assignable(strings, objects));
        assert!(!meta.is_assignable(objects, strings));
        assert!(!meta.is_assignable(ints, objects));
        assert!(meta.is_assignable(matrix, meta.special().array));

        let class = meta.class(matrix).unwrap();
        assert_eq!(class.name, "System.Int32[,]");
        assert_eq!(class.rank(), 2);
        assert_eq!(class.element_size(), 4);
    }

    #[test]
    fn inflation_is_memoized_and_shares_the_body() {
        let meta = meta();
        let holder = meta
            .define_class(
                ClassBuilder::class("Sample.Util").method(
                    MethodSpec::new(
                        "Identity",
                        Signature::new(vec![TypeRef::OBJECT], TypeRef::OBJECT),
                        MethodFlags::STATIC,
                    )
                    .generic(1),
                ),
            )
            .unwrap();
        let def = holder.methods[0];
        meta.set_body(def, LoweredBody {
            code: vec![0],
            ..LoweredBody::default()
        })
        .unwrap();

        let a = meta.inflate_method(def, &[TypeRef::STRING]).unwrap();
        let b = meta.inflate_method(def, &[TypeRef::STRING]).unwrap();
        let c = meta.inflate_method(def, &[TypeRef::I4]).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);

        let inflated = meta.method(a).unwrap();
        assert!(!inflated.is_generic_definition());
        assert_eq!(meta.lowered_body(&inflated).unwrap().code, vec![0]);
        assert!(matches!(
            meta.inflate_method(def, &[]),
            Err(MetadataError::GenericArity { expected: 1, found: 0, .. })
        ));
        assert_eq!(
            meta.set_body(def, LoweredBody::default()),
            Err(MetadataError::BodyAlreadySet(def))
        );
    }

    // ── Heap ───────────────────────────────────────────────────────

    #[test]
    fn objects_point_at_their_class() {
        let meta = meta();
        let heap = Heap::new(HeapSettings::default());
        let class = meta.class(meta.special().exception).unwrap();
        let obj = heap.alloc_object(&class).unwrap();
        assert!(!obj.is_null());
        unsafe {
            assert_eq!(obj.class().id, class.id);
            assert_eq!(obj.header().sync(), 0);
            assert_eq!(obj.header().init_sync(3), 3);
            assert_eq!(obj.header().init_sync(9), 3);
        }
    }

    #[test]
    fn heap_limit_raises_out_of_memory() {
        let meta = meta();
        let heap = Heap::new(HeapSettings { max_bytes: 64 });
        let ints = meta.class(meta.array_class(TypeRef::I4, 1, true).unwrap()).unwrap();
        assert!(heap.alloc_vector(&ints, 4).is_ok());
        assert_eq!(heap.used_bytes(), 48);
        assert_eq!(
            heap.alloc_vector(&ints, 4),
            Err(AllocError::OutOfMemory { requested: 48 })
        );
        assert_eq!(heap.peak_bytes(), 48);
    }

    #[test]
    fn multi_dimensional_arrays_carry_bounds() {
        let meta = meta();
        let heap = Heap::new(HeapSettings::default());
        let class = meta.class(meta.array_class(TypeRef::I8, 2, false).unwrap()).unwrap();
        let array = heap.alloc_array(&class, &[2, 3], Some(&[1, -1])).unwrap();
        unsafe {
            assert_eq!(array.array_len(), 6);
            let bounds = array.array_bounds().unwrap();
            assert_eq!(bounds[0], ArrayBounds { length: 2, lower_bound: 1 });
            assert_eq!(bounds[1], ArrayBounds { length: 3, lower_bound: -1 });
            assert_eq!(array.array_data(), array.as_ptr().add(ARRAY_DATA_OFFSET));
        }
        assert_eq!(
            heap.alloc_array(&class, &[2], None),
            Err(AllocError::InvalidLength)
        );
    }

    #[test]
    fn strings_and_boxes() {
        let meta = meta();
        let heap = Heap::new(HeapSettings::default());
        let string = meta.class(meta.special().string).unwrap();
        let s = heap.alloc_string(&string, "héllo").unwrap();
        unsafe {
            assert_eq!(s.string_chars().len(), 5);
            assert_eq!(s.to_rust_string(), "héllo");
        }

        let int64 = meta.class(meta.special().int64).unwrap();
        let value = -7i64;
        let boxed = unsafe { heap.box_value(&int64, (&value as *const i64).cast()) }.unwrap();
        unsafe {
            assert_eq!(boxed.data().cast::<i64>().read(), -7);
            assert!(boxed.class().is_valuetype());
        }
    }
}
