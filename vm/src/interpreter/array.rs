//! Array allocation and element access.
//!
//! Every check (null, bounds, element type) happens before memory is
//! touched, and on failure the operand stack is left as it was.

use bytecode::MemTy;
use object::{AllocError, ClassId, ExceptionKind, ObjRef};

use super::{Interp, non_null};
use crate::exception::Raise;
use crate::stackval::StackVal;

fn alloc_failed(_: AllocError) -> Raise {
    Raise::Kind(ExceptionKind::OutOfMemory)
}

impl Interp<'_> {
    /// Address of element `index` of the vector at `array`.
    fn vector_addr(
        &self,
        array: ObjRef,
        index: i64,
        size: usize,
        checked: bool,
    ) -> Result<*mut u8, Raise> {
        let array = non_null(array)?;
        // SAFETY: non-null array references are live arrays.
        unsafe {
            if checked && index as u64 >= array.array_len() as u64 {
                return Err(Raise::Kind(ExceptionKind::IndexOutOfRange));
            }
            Ok(array
                .array_data()
                .wrapping_offset(index as isize * size as isize))
        }
    }

    /// Element address for the `[array, index]` pair on top of the stack.
    pub(super) fn element_addr(&self, size: usize, checked: bool) -> Result<*mut u8, Raise> {
        self.vector_addr(self.peek(1).as_obj(), self.peek(0).as_i64(), size, checked)
    }

    pub(super) fn store_element(&mut self, ty: MemTy, checked: bool) -> Result<(), Raise> {
        let addr = self.vector_addr(
            self.peek(2).as_obj(),
            self.peek(1).as_i64(),
            ty.size(),
            checked,
        )?;
        let value = self.peek(0);
        self.sp -= 3;
        unsafe { value.store(ty, addr) };
        Ok(())
    }

    /// `STELEM_REF`: a reference store that checks the value against the
    /// array's element type.
    pub(super) fn store_element_ref(&mut self) -> Result<(), Raise> {
        let array = self.peek(2).as_obj();
        let addr = self.vector_addr(array, self.peek(1).as_i64(), 8, true)?;
        let value = self.peek(0).as_obj();
        if !value.is_null() {
            let meta = self.domain.metadata();
            // SAFETY: both are live objects.
            let (array_class, value_class) = unsafe { (array.class(), value.class()) };
            let element = array_class
                .element_type()
                .and_then(|ty| meta.class_of(&ty));
            if !element.is_some_and(|element| meta.is_assignable(value_class.id, element)) {
                return Err(Raise::Kind(ExceptionKind::ArrayTypeMismatch));
            }
        }
        self.sp -= 3;
        unsafe { addr.cast::<ObjRef>().write(value) };
        Ok(())
    }

    /// Fails unless the elements of `array` are exactly the class of data
    /// item `item`.
    pub(super) fn check_element_class(&self, array: ObjRef, item: u16) -> Result<(), Raise> {
        let expected = self.data_class(item).id;
        let array = non_null(array)?;
        let meta = self.domain.metadata();
        // SAFETY: non-null array references are live arrays.
        let element: Option<ClassId> = unsafe { array.class() }
            .element_type()
            .and_then(|ty| meta.class_of(&ty));
        if element == Some(expected) {
            Ok(())
        } else {
            Err(Raise::Kind(ExceptionKind::ArrayTypeMismatch))
        }
    }

    /// `LDELEMA` with an exact element type check, as needed before handing
    /// out a writable element address of a covariant array.
    pub(super) fn element_addr_typechecked(&mut self, item: u16) -> Result<(), Raise> {
        let array = self.peek(1).as_obj();
        self.check_element_class(array, item)?;
        // SAFETY: checked non-null above.
        let size = unsafe { array.class() }.element_size();
        let addr = self.element_addr(size, true)?;
        self.sp -= 1;
        self.set_top(StackVal::from_ptr(addr));
        Ok(())
    }

    /// Element address of a multi-dimensional access whose array and
    /// `rank` indices sit below `above` other cells.
    pub(super) fn md_element_addr(&self, rank: u8, above: usize, checked: bool) -> Result<*mut u8, Raise> {
        let rank = rank as usize;
        let base = self.sp - above - rank - 1;
        let array = non_null(unsafe { *self.cell(base) }.as_obj())?;
        // SAFETY: non-null array references are live arrays.
        let (class, bounds, len) = unsafe { (array.class(), array.array_bounds(), array.array_len()) };
        if class.rank() as usize != rank {
            self.fatal(format_args!("rank {rank} access to a rank {} array", class.rank()));
        }

        let mut position: i128 = 0;
        for dim in 0..rank {
            let index = unsafe { *self.cell(base + 1 + dim) }.as_i64() as i128;
            let (lower, length) = match bounds.and_then(|bounds| bounds.get(dim)) {
                Some(bound) => (bound.lower_bound as i128, bound.length as i128),
                None => (0, len as i128),
            };
            let relative = index - lower;
            if checked && !(0..length).contains(&relative) {
                return Err(Raise::Kind(ExceptionKind::IndexOutOfRange));
            }
            position = position * length + relative;
        }
        let offset = position * class.element_size() as i128;
        // SAFETY: checked accesses stay inside the array data.
        Ok(unsafe { array.array_data() }.wrapping_offset(offset as isize))
    }

    /// `NEWARR`: a zero-based vector of the length on top of the stack.
    pub(super) fn new_array(&mut self, item: u16) -> Result<(), Raise> {
        let class = self.data_class(item);
        let length = self.peek(0).as_i64();
        if length < 0 {
            return Err(Raise::Kind(ExceptionKind::Overflow));
        }
        let array = self
            .domain
            .heap()
            .alloc_vector(class, length as usize)
            .map_err(alloc_failed)?;
        self.set_top(StackVal::from_obj(array));
        Ok(())
    }

    /// `NEWARR` of a multi-dimensional array. With one operand per
    /// dimension they are the lengths; with two, lower bounds come first.
    pub(super) fn new_md_array(&mut self, item: u16, params: u8) -> Result<(), Raise> {
        let class = self.data_class(item);
        let rank = class.rank() as usize;
        let params = params as usize;
        let operands: Vec<i64> = (0..params)
            .map(|i| unsafe { *self.cell(self.sp - params + i) }.as_i64())
            .collect();
        let (lower_bounds, lengths) = if params == rank {
            (None, &operands[..])
        } else if params == 2 * rank {
            let (lower, lengths) = operands.split_at(rank);
            (Some(lower.iter().map(|&b| b as isize).collect::<Vec<_>>()), lengths)
        } else {
            self.fatal(format_args!("{params} operands for a rank {rank} array"));
        };
        if lengths.iter().any(|&len| len < 0) {
            return Err(Raise::Kind(ExceptionKind::Overflow));
        }
        let lengths: Vec<usize> = lengths.iter().map(|&len| len as usize).collect();
        let array = self
            .domain
            .heap()
            .alloc_array(class, &lengths, lower_bounds.as_deref())
            .map_err(alloc_failed)?;
        self.sp -= params;
        self.push(StackVal::from_obj(array));
        Ok(())
    }
}
