use std::{
    fmt,
    sync::{Arc, OnceLock},
};

use ahash::AHashMap;
use parking_lot::{Mutex, RwLock};

use crate::class::{
    Class, ClassFlags, ClassKind, FieldDef, GenericInst, StaticStorage, Variance,
};
use crate::header::HEADER_SIZE;
use crate::method::{CompiledEntry, LoweredBody, MethodDef, MethodFlags};
use crate::special::SpecialClasses;
use crate::types::{ClassId, FieldId, MethodId, Signature, TypeKind, TypeRef};

/// Size of a `TypedReference` value.
pub const TYPED_REF_SIZE: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MetadataError {
    UnknownClass(ClassId),
    UnknownMethod(MethodId),
    /// Parent is an interface, a value type or sealed.
    InvalidParent { class: String, parent: String },
    NotAnInterface { class: String, iface: String },
    /// A value-type field of a class that is still being defined.
    RecursiveLayout { class: String },
    BodyAlreadySet(MethodId),
    GenericArity { method: MethodId, expected: u16, found: usize },
}

impl fmt::Display for MetadataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataError::UnknownClass(id) => write!(f, "unknown class {}", id.0),
            MetadataError::UnknownMethod(id) => write!(f, "unknown method {}", id.0),
            MetadataError::InvalidParent { class, parent } => {
                write!(f, "{class} cannot derive from {parent}")
            }
            MetadataError::NotAnInterface { class, iface } => {
                write!(f, "{class} implements {iface}, which is not an interface")
            }
            MetadataError::RecursiveLayout { class } => {
                write!(f, "{class} contains itself by value")
            }
            MetadataError::BodyAlreadySet(id) => {
                write!(f, "method {} already has a body", id.0)
            }
            MetadataError::GenericArity { method, expected, found } => write!(
                f,
                "method {} takes {expected} type arguments, got {found}",
                method.0
            ),
        }
    }
}

impl std::error::Error for MetadataError {}

/// A method to be declared by a [`ClassBuilder`].
#[derive(Debug, Clone)]
pub struct MethodSpec {
    pub name: String,
    pub sig: Signature,
    pub flags: MethodFlags,
    pub generic_param_count: u16,
}

impl MethodSpec {
    pub fn new(name: &str, sig: Signature, flags: MethodFlags) -> Self {
        Self {
            name: name.to_owned(),
            sig,
            flags,
            generic_param_count: 0,
        }
    }

    pub fn generic(mut self, params: u16) -> Self {
        self.generic_param_count = params;
        self
    }
}

#[derive(Debug, Clone)]
struct FieldSpec {
    name: String,
    ty: TypeRef,
    is_static: bool,
}

/// Declarative description of a class handed to
/// [`Metadata::define_class`].
#[derive(Debug, Clone)]
pub struct ClassBuilder {
    name: String,
    kind: ClassKind,
    flags: ClassFlags,
    parent: Option<ClassId>,
    interfaces: Vec<ClassId>,
    fields: Vec<FieldSpec>,
    methods: Vec<MethodSpec>,
    /// Explicit interface implementations: interface method → index into
    /// `methods`.
    impls: Vec<(MethodId, usize)>,
    native_size: Option<usize>,
    generic: Option<GenericInst>,
}

impl ClassBuilder {
    pub fn new(name: &str, kind: ClassKind) -> Self {
        Self {
            name: name.to_owned(),
            kind,
            flags: ClassFlags::empty(),
            parent: None,
            interfaces: Vec::new(),
            fields: Vec::new(),
            methods: Vec::new(),
            impls: Vec::new(),
            native_size: None,
            generic: None,
        }
    }

    pub fn class(name: &str) -> Self {
        Self::new(name, ClassKind::Class)
    }

    pub fn interface(name: &str) -> Self {
        Self::new(name, ClassKind::Interface).flags(ClassFlags::ABSTRACT)
    }

    pub fn structure(name: &str) -> Self {
        Self::new(name, ClassKind::Struct).flags(ClassFlags::SEALED)
    }

    pub fn enumeration(name: &str, underlying: TypeKind) -> Self {
        Self::new(name, ClassKind::Enum { underlying }).flags(ClassFlags::SEALED)
    }

    pub fn parent(mut self, parent: ClassId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn flags(mut self, flags: ClassFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn implements(mut self, iface: ClassId) -> Self {
        self.interfaces.push(iface);
        self
    }

    pub fn field(mut self, name: &str, ty: TypeRef) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_owned(),
            ty,
            is_static: false,
        });
        self
    }

    pub fn static_field(mut self, name: &str, ty: TypeRef) -> Self {
        self.fields.push(FieldSpec {
            name: name.to_owned(),
            ty,
            is_static: true,
        });
        self
    }

    pub fn method(mut self, spec: MethodSpec) -> Self {
        self.methods.push(spec);
        self
    }

    /// Implement `iface_method` with the `index`-th declared method,
    /// regardless of names.
    pub fn explicit_impl(mut self, iface_method: MethodId, index: usize) -> Self {
        self.impls.push((iface_method, index));
        self
    }

    /// Marshaled size override for value types.
    pub fn native_size(mut self, size: usize) -> Self {
        self.native_size = Some(size);
        self.flags |= ClassFlags::EXPLICIT_NATIVE_LAYOUT;
        self
    }

    pub fn generic(mut self, inst: GenericInst) -> Self {
        self.generic = Some(inst);
        self
    }
}

/// Identities assigned to a freshly defined class, in declaration order.
#[derive(Debug, Clone)]
pub struct DefinedClass {
    pub id: ClassId,
    pub methods: Vec<MethodId>,
    pub fields: Vec<FieldId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ArrayKey {
    element: TypeRef,
    rank: u8,
    szarray: bool,
}

/// The class and method registry.
///
/// Tables only grow. Entries are handed out as `Arc`s and stay valid for the
/// registry's lifetime.
pub struct Metadata {
    classes: RwLock<Vec<Arc<Class>>>,
    methods: RwLock<Vec<Arc<MethodDef>>>,
    array_classes: Mutex<AHashMap<ArrayKey, ClassId>>,
    inflated: Mutex<AHashMap<(MethodId, Vec<TypeRef>), MethodId>>,
    special: OnceLock<SpecialClasses>,
}

impl Metadata {
    /// Create a registry holding the well-known classes.
    pub fn new() -> Result<Self, MetadataError> {
        let meta = Self {
            classes: RwLock::new(Vec::new()),
            methods: RwLock::new(Vec::new()),
            array_classes: Mutex::new(AHashMap::new()),
            inflated: Mutex::new(AHashMap::new()),
            special: OnceLock::new(),
        };
        let special = SpecialClasses::bootstrap(&meta)?;
        let _ = meta.special.set(special);
        log::debug!("metadata bootstrapped with {} classes", meta.class_count());
        Ok(meta)
    }

    /// Well-known classes.
    pub fn special(&self) -> &SpecialClasses {
        match self.special.get() {
            Some(special) => special,
            None => unreachable!("well-known classes are installed by Metadata::new"),
        }
    }

    pub fn class_count(&self) -> usize {
        self.classes.read().len()
    }

    pub fn class(&self, id: ClassId) -> Result<Arc<Class>, MetadataError> {
        self.classes
            .read()
            .get(id.0 as usize)
            .cloned()
            .ok_or(MetadataError::UnknownClass(id))
    }

    pub fn method(&self, id: MethodId) -> Result<Arc<MethodDef>, MetadataError> {
        self.methods
            .read()
            .get(id.0 as usize)
            .cloned()
            .ok_or(MetadataError::UnknownMethod(id))
    }

    pub fn find_class(&self, name: &str) -> Option<ClassId> {
        self.classes
            .read()
            .iter()
            .find(|c| c.name == name)
            .map(|c| c.id)
    }

    /// Find a method by name on `class` or its ancestors.
    pub fn find_method(&self, class: ClassId, name: &str) -> Option<MethodId> {
        let mut current = self.class(class).ok();
        while let Some(c) = current {
            let found = c
                .methods
                .iter()
                .copied()
                .find(|&id| self.method(id).is_ok_and(|m| m.name == name));
            if found.is_some() {
                return found;
            }
            current = c.parent.and_then(|p| self.class(p).ok());
        }
        None
    }

    pub fn field_id(&self, class: ClassId, name: &str) -> Option<FieldId> {
        let class_ref = self.class(class).ok()?;
        let index = class_ref.fields.iter().position(|f| f.name == name)?;
        Some(FieldId {
            class,
            index: index as u16,
        })
    }

    pub fn field(&self, id: FieldId) -> Result<(Arc<Class>, FieldDef), MetadataError> {
        let class = self.class(id.class)?;
        let field = class
            .fields
            .get(id.index as usize)
            .cloned()
            .ok_or(MetadataError::UnknownClass(id.class))?;
        Ok((class, field))
    }

    // ── bodies ─────────────────────────────────────────────────────

    pub fn set_body(&self, id: MethodId, body: LoweredBody) -> Result<(), MetadataError> {
        self.method(id)?
            .body
            .set(Arc::new(body))
            .map_err(|_| MetadataError::BodyAlreadySet(id))
    }

    pub fn set_compiled(
        &self,
        id: MethodId,
        entry: CompiledEntry,
    ) -> Result<(), MetadataError> {
        self.method(id)?
            .compiled
            .set(entry)
            .map_err(|_| MetadataError::BodyAlreadySet(id))
    }

    pub fn set_native(&self, id: MethodId, addr: usize) -> Result<(), MetadataError> {
        self.method(id)?
            .native
            .set(addr)
            .map_err(|_| MetadataError::BodyAlreadySet(id))
    }

    /// The lowered body of `method`, falling back to the generic definition
    /// for inflated methods.
    pub fn lowered_body(&self, method: &MethodDef) -> Option<Arc<LoweredBody>> {
        if let Some(body) = method.body.get() {
            return Some(body.clone());
        }
        let def = self.method(method.generic_def?).ok()?;
        def.body.get().cloned()
    }

    // ── class definition ───────────────────────────────────────────

    pub fn define_class(&self, builder: ClassBuilder) -> Result<DefinedClass, MetadataError> {
        let mut classes = self.classes.write();
        let mut methods = self.methods.write();

        let parent = match builder.parent {
            Some(id) => Some(id),
            None => self.default_parent(&builder.kind),
        };
        let parent = match parent {
            Some(id) => {
                let p = classes
                    .get(id.0 as usize)
                    .cloned()
                    .ok_or(MetadataError::UnknownClass(id))?;
                if p.is_interface()
                    || p.is_valuetype()
                    || p.flags.contains(ClassFlags::SEALED)
                {
                    return Err(MetadataError::InvalidParent {
                        class: builder.name,
                        parent: p.name.clone(),
                    });
                }
                Some(p)
            }
            None => None,
        };

        let id = ClassId(classes.len() as u32);
        let is_interface = matches!(builder.kind, ClassKind::Interface);

        // Interfaces, flattened: inherited first, then declared ones with
        // everything they extend.
        let mut interfaces: Vec<ClassId> =
            parent.as_ref().map(|p| p.interfaces.clone()).unwrap_or_default();
        for &iface_id in &builder.interfaces {
            let iface = classes
                .get(iface_id.0 as usize)
                .ok_or(MetadataError::UnknownClass(iface_id))?;
            if !iface.is_interface() {
                return Err(MetadataError::NotAnInterface {
                    class: builder.name,
                    iface: iface.name.clone(),
                });
            }
            for &inherited in iface.interfaces.iter().chain(Some(&iface_id)) {
                if !interfaces.contains(&inherited) {
                    interfaces.push(inherited);
                }
            }
        }

        // ── fields ──
        let flags = builder.flags
            | parent
                .as_ref()
                .map_or(ClassFlags::empty(), |p| p.flags & ClassFlags::EXCEPTION);
        let is_value = matches!(
            builder.kind,
            ClassKind::Struct | ClassKind::Primitive(_) | ClassKind::Enum { .. }
        );
        let mut offset = if is_value {
            0
        } else {
            parent.as_ref().map_or(HEADER_SIZE, |p| p.instance_size)
        };
        let mut align = 1usize;
        let mut static_offset = 0usize;
        let mut fields = Vec::with_capacity(builder.fields.len());
        for spec in &builder.fields {
            let (size, field_align) = field_layout(&classes, &spec.ty, false)
                .ok_or_else(|| MetadataError::RecursiveLayout {
                    class: builder.name.clone(),
                })?;
            let slot = if spec.is_static {
                &mut static_offset
            } else {
                align = align.max(field_align);
                &mut offset
            };
            *slot = slot.next_multiple_of(field_align);
            fields.push(FieldDef {
                name: spec.name.clone(),
                ty: spec.ty,
                offset: *slot,
                is_static: spec.is_static,
            });
            *slot += size;
        }

        let (instance_size, value_size, class_align) = match builder.kind {
            ClassKind::Primitive(kind) | ClassKind::Enum { underlying: kind } => {
                let size = TypeRef::new(kind).primitive_size().unwrap_or(8);
                (HEADER_SIZE + size.next_multiple_of(8), size, size.max(1))
            }
            ClassKind::Struct => {
                let size = offset.next_multiple_of(align).max(1);
                (HEADER_SIZE + size.next_multiple_of(8), size, align)
            }
            _ => (offset.next_multiple_of(8), 8, 8),
        };
        let native_size = builder.native_size.unwrap_or(if is_value {
            value_size
        } else {
            instance_size - HEADER_SIZE
        });

        // ── methods & vtable ──
        let first_method = methods.len() as u32;
        let local_id = |index: usize| MethodId(first_method + index as u32);
        let shape = |mid: MethodId| -> Option<(&str, &Signature)> {
            let local = mid.0.checked_sub(first_method).map(|i| i as usize);
            match local.and_then(|i| builder.methods.get(i)) {
                Some(spec) => Some((spec.name.as_str(), &spec.sig)),
                None => methods
                    .get(mid.0 as usize)
                    .map(|m| (m.name.as_str(), &*m.sig)),
            }
        };

        let mut vtable: Vec<MethodId> = parent
            .as_ref()
            .map(|p| p.vtable[..p.virtual_count].to_vec())
            .unwrap_or_default();
        let mut slots = vec![None; builder.methods.len()];
        for (index, spec) in builder.methods.iter().enumerate() {
            if !spec.flags.contains(MethodFlags::VIRTUAL) {
                continue;
            }
            let overridden = if is_interface || spec.flags.contains(MethodFlags::NEW_SLOT) {
                None
            } else {
                vtable.iter().rposition(|&m| {
                    shape(m).is_some_and(|(name, sig)| {
                        name == spec.name && sig.same_shape(&spec.sig)
                    })
                })
            };
            let slot = match overridden {
                Some(slot) => {
                    vtable[slot] = local_id(index);
                    slot
                }
                None => {
                    vtable.push(local_id(index));
                    vtable.len() - 1
                }
            };
            slots[index] = Some(slot as u16);
        }
        let virtual_count = vtable.len();

        let mut interface_offsets = Vec::with_capacity(interfaces.len());
        if !is_interface {
            for &iface_id in &interfaces {
                let iface = &classes[iface_id.0 as usize];
                interface_offsets.push((iface_id, vtable.len()));
                for &iface_method in &iface.vtable[..iface.virtual_count] {
                    let explicit = builder
                        .impls
                        .iter()
                        .find(|(m, _)| *m == iface_method)
                        .map(|&(_, index)| local_id(index));
                    let implicit = || {
                        let (name, sig) = shape(iface_method)?;
                        vtable[..virtual_count]
                            .iter()
                            .rev()
                            .copied()
                            .find(|&m| {
                                shape(m).is_some_and(|(n, s)| n == name && s.same_shape(sig))
                            })
                    };
                    let entry = explicit.or_else(implicit).unwrap_or(iface_method);
                    vtable.push(entry);
                }
            }
        }

        let method_ids: Vec<MethodId> =
            (0..builder.methods.len()).map(local_id).collect();
        for (index, spec) in builder.methods.into_iter().enumerate() {
            let mut sig = spec.sig;
            sig.hasthis = !spec.flags.contains(MethodFlags::STATIC);
            methods.push(Arc::new(MethodDef {
                id: local_id(index),
                name: spec.name,
                class: id,
                sig: Arc::new(sig),
                flags: spec.flags,
                slot: slots[index],
                generic_param_count: spec.generic_param_count,
                method_inst: None,
                generic_def: None,
                body: OnceLock::new(),
                compiled: OnceLock::new(),
                native: OnceLock::new(),
            }));
        }

        let field_ids = (0..fields.len())
            .map(|index| FieldId {
                class: id,
                index: index as u16,
            })
            .collect();

        log::debug!(
            "defined class {} ({}): {} bytes, {} vtable slots",
            builder.name,
            id.0,
            instance_size,
            vtable.len()
        );

        classes.push(Arc::new(Class {
            id,
            name: builder.name,
            kind: builder.kind,
            flags,
            parent: parent.map(|p| p.id),
            interfaces,
            interface_offsets,
            fields,
            methods: method_ids.clone(),
            vtable,
            virtual_count,
            instance_size,
            value_size,
            native_size,
            align: class_align,
            generic: builder.generic,
            statics: StaticStorage::new(static_offset),
            interp_vtable: OnceLock::new(),
        }));

        Ok(DefinedClass {
            id,
            methods: method_ids,
            fields: field_ids,
        })
    }

    fn default_parent(&self, kind: &ClassKind) -> Option<ClassId> {
        let special = self.special.get()?;
        match kind {
            ClassKind::Interface => None,
            ClassKind::Struct | ClassKind::Primitive(_) => Some(special.value_type),
            ClassKind::Enum { .. } => Some(special.enum_),
            ClassKind::Array { .. } => Some(special.array),
            ClassKind::Class | ClassKind::String => Some(special.object),
        }
    }

    /// The array class for `element`, created on first request.
    pub fn array_class(
        &self,
        element: TypeRef,
        rank: u8,
        szarray: bool,
    ) -> Result<ClassId, MetadataError> {
        let key = ArrayKey {
            element,
            rank,
            szarray,
        };
        if let Some(&id) = self.array_classes.lock().get(&key) {
            return Ok(id);
        }
        let element_size = self.value_size(&element)?;
        let suffix = if szarray {
            "[]".to_owned()
        } else if rank == 1 {
            "[*]".to_owned()
        } else {
            format!("[{}]", ",".repeat(rank as usize - 1))
        };
        let name = format!("{}{}", self.type_name(&element), suffix);
        let kind = ClassKind::Array {
            element,
            rank,
            szarray,
            element_size,
        };

        let mut memo = self.array_classes.lock();
        if let Some(&id) = memo.get(&key) {
            return Ok(id);
        }
        let id = self
            .define_class(ClassBuilder::new(&name, kind).flags(ClassFlags::SEALED))?
            .id;
        memo.insert(key, id);
        Ok(id)
    }

    /// The instantiation of generic method `def` with `inst`, created on
    /// first request. Inflated methods share the definition's body.
    pub fn inflate_method(
        &self,
        def: MethodId,
        inst: &[TypeRef],
    ) -> Result<MethodId, MetadataError> {
        let def_method = self.method(def)?;
        if def_method.generic_param_count as usize != inst.len() {
            return Err(MetadataError::GenericArity {
                method: def,
                expected: def_method.generic_param_count,
                found: inst.len(),
            });
        }
        let mut memo = self.inflated.lock();
        if let Some(&id) = memo.get(&(def, inst.to_vec())) {
            return Ok(id);
        }
        let mut methods = self.methods.write();
        let id = MethodId(methods.len() as u32);
        methods.push(Arc::new(MethodDef {
            id,
            name: def_method.name.clone(),
            class: def_method.class,
            sig: def_method.sig.clone(),
            flags: def_method.flags,
            slot: def_method.slot,
            generic_param_count: def_method.generic_param_count,
            method_inst: Some(inst.into()),
            generic_def: Some(def),
            body: OnceLock::new(),
            compiled: OnceLock::new(),
            native: OnceLock::new(),
        }));
        memo.insert((def, inst.to_vec()), id);
        log::debug!("inflated {} as method {} with {:?}", def_method.name, id.0, inst);
        Ok(id)
    }

    // ── type queries ───────────────────────────────────────────────

    /// The class of a value of type `ty`, boxing primitives.
    pub fn class_of(&self, ty: &TypeRef) -> Option<ClassId> {
        let special = self.special();
        match ty.kind {
            TypeKind::String => Some(special.string),
            TypeKind::Object => Some(special.object),
            TypeKind::Class(id)
            | TypeKind::ValueType(id)
            | TypeKind::SzArray(id)
            | TypeKind::Array(id)
            | TypeKind::GenericInst(id) => Some(id),
            TypeKind::TypedByRef => Some(special.typed_reference),
            kind => special.primitive_class(kind),
        }
    }

    /// Whether values of `ty` are object references.
    pub fn is_reference(&self, ty: &TypeRef) -> bool {
        if ty.byref {
            return false;
        }
        match ty.kind {
            TypeKind::GenericInst(id) => self.class(id).is_ok_and(|c| !c.is_valuetype()),
            _ => ty.is_object_reference(),
        }
    }

    /// Storage size of a value of `ty` in managed memory.
    pub fn value_size(&self, ty: &TypeRef) -> Result<usize, MetadataError> {
        self.sized(ty, false)
    }

    /// Storage size of a value of `ty` when marshaled to native code.
    pub fn native_size(&self, ty: &TypeRef) -> Result<usize, MetadataError> {
        self.sized(ty, true)
    }

    fn sized(&self, ty: &TypeRef, native: bool) -> Result<usize, MetadataError> {
        let classes = self.classes.read();
        match field_layout(&classes, ty, native) {
            Some((size, _)) => Ok(size),
            None => Err(match ty.kind {
                TypeKind::ValueType(id) | TypeKind::GenericInst(id) => {
                    MetadataError::UnknownClass(id)
                }
                _ => MetadataError::UnknownClass(ClassId(u32::MAX)),
            }),
        }
    }

    pub fn type_name(&self, ty: &TypeRef) -> String {
        let base = match ty.kind {
            TypeKind::Void => "System.Void".to_owned(),
            TypeKind::String => "System.String".to_owned(),
            TypeKind::Object => "System.Object".to_owned(),
            TypeKind::Ptr => "System.Void*".to_owned(),
            TypeKind::FnPtr => "method*".to_owned(),
            _ => match self.class_of(ty).and_then(|id| self.class(id).ok()) {
                Some(class) => class.name.clone(),
                None => format!("{:?}", ty.kind),
            },
        };
        if ty.byref { format!("{base}&") } else { base }
    }

    /// Whether an instance of `src` may be stored where `target` is
    /// expected.
    pub fn is_assignable(&self, src: ClassId, target: ClassId) -> bool {
        if src == target || target == self.special().object {
            return true;
        }
        let (Ok(src_class), Ok(target_class)) = (self.class(src), self.class(target)) else {
            return false;
        };
        if target_class.is_interface() {
            return self.interface_offset(&src_class, &target_class).is_some()
                || (src_class.is_interface() && src_class.interfaces.contains(&target));
        }
        if let (
            ClassKind::Array { element: s, rank: r1, szarray: sz1, .. },
            ClassKind::Array { element: t, rank: r2, szarray: sz2, .. },
        ) = (&src_class.kind, &target_class.kind)
        {
            return r1 == r2 && sz1 == sz2 && self.element_compatible(s, t);
        }
        let mut current = src_class.parent;
        while let Some(id) = current {
            if id == target {
                return true;
            }
            current = self.class(id).ok().and_then(|c| c.parent);
        }
        false
    }

    fn element_compatible(&self, src: &TypeRef, target: &TypeRef) -> bool {
        if src == target {
            return true;
        }
        if !(self.is_reference(src) && self.is_reference(target)) {
            return false;
        }
        match (self.class_of(src), self.class_of(target)) {
            (Some(s), Some(t)) => self.is_assignable(s, t),
            _ => false,
        }
    }

    /// Start of `iface`'s region in `class`'s vtable, accepting variant
    /// instantiations of generic interfaces.
    pub fn interface_offset(&self, class: &Class, iface: &Class) -> Option<usize> {
        if let Some(offset) = class.interface_offset(iface.id) {
            return Some(offset);
        }
        let wanted = iface.generic.as_ref()?;
        if wanted.variance.iter().all(|v| *v == Variance::Invariant) {
            return None;
        }
        class.interface_offsets.iter().find_map(|&(impl_id, offset)| {
            let implemented = self.class(impl_id).ok()?;
            let have = implemented.generic.as_ref()?;
            let compatible = have.definition == wanted.definition
                && have.args.len() == wanted.args.len()
                && wanted.variance.iter().enumerate().all(|(i, variance)| {
                    let (s, t) = (&have.args[i], &wanted.args[i]);
                    match variance {
                        Variance::Invariant => s == t,
                        Variance::Covariant => self.element_compatible(s, t),
                        Variance::Contravariant => self.element_compatible(t, s),
                    }
                });
            compatible.then_some(offset)
        })
    }
}

/// Size and alignment of a field of type `ty`; `None` if it names an
/// unknown class.
fn field_layout(classes: &[Arc<Class>], ty: &TypeRef, native: bool) -> Option<(usize, usize)> {
    if let Some(size) = ty.primitive_size() {
        return Some((size, size.clamp(1, 8)));
    }
    match ty.kind {
        TypeKind::TypedByRef => Some((TYPED_REF_SIZE, 8)),
        TypeKind::ValueType(id) | TypeKind::GenericInst(id) => {
            let class = classes.get(id.0 as usize)?;
            if !class.is_valuetype() {
                return Some((8, 8));
            }
            let size = if native { class.native_size } else { class.value_size };
            Some((size, class.align))
        }
        _ => Some((8, 8)),
    }
}
