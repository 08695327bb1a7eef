//! Boxing, casts, typed references, tokens and raw memory blocks.

use std::{ptr, sync::Arc};

use object::{Class, ClassKind, ExceptionKind, TYPED_REF_SIZE};

use super::{Interp, non_null};
use crate::exception::Raise;
use crate::marshal::ValueRepr;
use crate::method::DataItem;
use crate::stackval::StackVal;

const TYPED_REF_TYPE: usize = 8;
const TYPED_REF_KLASS: usize = 16;

/// Whether a box of `boxed` may be unboxed as `target`: the same class, or
/// an enum and its underlying primitive in either direction.
fn unbox_compatible(boxed: &Class, target: &Class) -> bool {
    if boxed.id == target.id {
        return true;
    }
    let primitive = |class: &Class| match class.kind {
        ClassKind::Primitive(kind) | ClassKind::Enum { underlying: kind } => Some(kind),
        _ => None,
    };
    primitive(boxed).is_some_and(|kind| primitive(target) == Some(kind))
}

impl Interp<'_> {
    /// The runtime handle `LDTOKEN` pushes for data item `item`.
    pub(super) fn token(&self, item: u16) -> usize {
        match self.data(item) {
            DataItem::Class(class) => Arc::as_ptr(class) as usize,
            DataItem::Method(method) => Arc::as_ptr(method) as usize,
            DataItem::Signature(sig) => Arc::as_ptr(sig) as usize,
            DataItem::Type(ty) => {
                let meta = self.domain.metadata();
                match meta.class_of(ty).and_then(|id| meta.class(id).ok()) {
                    // Classes are never freed, so the pointer outlives the Arc.
                    Some(class) => Arc::as_ptr(&class) as usize,
                    None => self.fatal(format_args!("no class for type token {ty:?}")),
                }
            }
            DataItem::StaticField(addr) | DataItem::Pointer(addr) => *addr,
            DataItem::String(string) => string.addr(),
        }
    }

    pub(super) fn box_value(&mut self, item: u16) -> Result<(), Raise> {
        let class = self.data_class(item);
        if !class.is_valuetype() {
            return Ok(());
        }
        let heap = self.domain.heap();
        let oom = |_| Raise::Kind(ExceptionKind::OutOfMemory);
        let boxed = if matches!(class.kind, ClassKind::Struct) {
            let value = self.peek(0).as_ptr::<u8>();
            // SAFETY: struct cells point at value_size bytes of vt storage.
            let boxed = unsafe { heap.box_value(class, value) }.map_err(oom)?;
            self.vt_sp -= class.value_size.next_multiple_of(8);
            boxed
        } else {
            let repr = ValueRepr::of(self.domain.metadata(), &class.byval_type(), false)
                .map_err(|_| Raise::Kind(ExceptionKind::ExecutionEngine))?;
            let mut data = 0u64;
            let data_ptr = ptr::from_mut(&mut data).cast::<u8>();
            unsafe {
                repr.store(&self.peek(0), data_ptr);
                heap.box_value(class, data_ptr)
            }
            .map_err(oom)?
        };
        self.set_top(StackVal::from_obj(boxed));
        Ok(())
    }

    /// `UNBOX`: the address of the value inside a box of exactly `item`.
    pub(super) fn unbox(&mut self, item: u16) -> Result<(), Raise> {
        let target = self.data_class(item);
        let obj = non_null(self.peek(0).as_obj())?;
        // SAFETY: non-null references are live objects.
        if !unbox_compatible(unsafe { obj.class() }, target) {
            return Err(Raise::Kind(ExceptionKind::InvalidCast));
        }
        self.set_top(StackVal::from_ptr(obj.data()));
        Ok(())
    }

    /// `CASTCLASS` (`throws`) or `ISINST`. Null passes both.
    pub(super) fn cast(&mut self, item: u16, throws: bool) -> Result<(), Raise> {
        let target = self.data_class(item).id;
        let obj = self.peek(0).as_obj();
        if obj.is_null() {
            return Ok(());
        }
        // SAFETY: non-null references are live objects.
        let class = unsafe { obj.class() };
        if self.domain.metadata().is_assignable(class.id, target) {
            return Ok(());
        }
        if throws {
            Err(Raise::Kind(ExceptionKind::InvalidCast))
        } else {
            self.set_top(StackVal::ZERO);
            Ok(())
        }
    }

    /// `LOCALLOC`: zeroed memory that lives until the frame returns.
    pub(super) fn local_alloc(&mut self) {
        let size = self.peek(0).as_i64().max(0) as usize;
        let cells = size.div_ceil(8).max(1);
        let block = self
            .ctx
            .arena
            .borrow_mut()
            .alloc(cells, self.domain.arena_chunk_cells)
            .as_ptr();
        unsafe { ptr::write_bytes(block, 0, cells) };
        self.set_top(StackVal::from_ptr(block));
    }

    pub(super) fn copy_block(&mut self) -> Result<(), Raise> {
        let size = self.peek(0).as_i64() as usize;
        let src = self.peek(1).as_ptr::<u8>();
        let dst = self.peek(2).as_ptr::<u8>();
        if size > 0 && (src.is_null() || dst.is_null()) {
            return Err(Raise::Kind(ExceptionKind::NullReference));
        }
        self.sp -= 3;
        unsafe { ptr::copy(src, dst, size) };
        Ok(())
    }

    pub(super) fn init_block(&mut self) -> Result<(), Raise> {
        let size = self.peek(0).as_i64() as usize;
        let value = self.peek(1).as_i32() as u8;
        let dst = self.peek(2).as_ptr::<u8>();
        if size > 0 && dst.is_null() {
            return Err(Raise::Kind(ExceptionKind::NullReference));
        }
        self.sp -= 3;
        unsafe { ptr::write_bytes(dst, value, size) };
        Ok(())
    }

    /// `MKREFANY`: a typed reference `{value, type, klass}` on the vt
    /// stack.
    pub(super) fn make_typed_ref(&mut self, item: u16) {
        let class = Arc::as_ptr(self.data_class(item));
        let value = self.peek(0).as_ptr::<u8>();
        let typed_ref = self.vt_top();
        unsafe {
            typed_ref.cast::<*mut u8>().write(value);
            typed_ref.add(TYPED_REF_TYPE).cast::<*const Class>().write(class);
            typed_ref.add(TYPED_REF_KLASS).cast::<*const Class>().write(class);
        }
        self.vt_sp += TYPED_REF_SIZE;
        self.set_top(StackVal::from_ptr(typed_ref));
    }

    /// `REFANYVAL`: the address in a typed reference of class `item`.
    pub(super) fn typed_ref_value(&mut self, item: u16) -> Result<(), Raise> {
        let expected = Arc::as_ptr(self.data_class(item));
        let typed_ref = self.peek(0).as_ptr::<u8>();
        let (value, klass) = unsafe {
            (
                typed_ref.cast::<*mut u8>().read(),
                typed_ref.add(TYPED_REF_KLASS).cast::<*const Class>().read(),
            )
        };
        if klass != expected {
            return Err(Raise::Kind(ExceptionKind::InvalidCast));
        }
        self.vt_sp -= TYPED_REF_SIZE;
        self.set_top(StackVal::from_ptr(value));
        Ok(())
    }

    pub(super) fn typed_ref_type(&mut self) {
        let typed_ref = self.peek(0).as_ptr::<u8>();
        let ty = unsafe { typed_ref.add(TYPED_REF_TYPE).cast::<usize>().read() };
        self.vt_sp -= TYPED_REF_SIZE;
        self.set_top(StackVal::from_raw(ty as u64));
    }
}
