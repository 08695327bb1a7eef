use std::{alloc::Layout, fmt, ptr::NonNull};

use parking_lot::Mutex;

use crate::class::Class;
use crate::header::{
    ARRAY_DATA_OFFSET, ArrayBounds, ArrayObject, HEADER_SIZE, ObjRef,
    ObjectHeader, STRING_DATA_OFFSET, StringObject,
};

#[derive(Debug, Clone)]
pub struct HeapSettings {
    /// Allocation fails with [`AllocError::OutOfMemory`] once live bytes
    /// would exceed this.
    pub max_bytes: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            max_bytes: 256 * 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    OutOfMemory { requested: usize },
    /// Negative or overflowing length.
    InvalidLength,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AllocError::OutOfMemory { requested } => {
                write!(f, "out of memory allocating {requested} bytes")
            }
            AllocError::InvalidLength => f.write_str("invalid allocation length"),
        }
    }
}

impl std::error::Error for AllocError {}

struct Block {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: blocks are only touched under the heap mutex or on drop.
unsafe impl Send for Block {}

#[derive(Default)]
struct HeapState {
    blocks: Vec<Block>,
    used: usize,
    peak: usize,
}

/// Object storage.
///
/// Every object is a separate zeroed allocation that lives until the heap is
/// dropped; there is no collector. The registry exists so the heap can
/// enforce its byte limit and release everything at the end.
pub struct Heap {
    settings: HeapSettings,
    state: Mutex<HeapState>,
}

impl Heap {
    pub fn new(settings: HeapSettings) -> Self {
        Self {
            settings,
            state: Mutex::new(HeapState::default()),
        }
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub fn used_bytes(&self) -> usize {
        self.state.lock().used
    }

    pub fn peak_bytes(&self) -> usize {
        self.state.lock().peak
    }

    fn alloc_zeroed(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let size = size
            .checked_next_multiple_of(8)
            .ok_or(AllocError::InvalidLength)?;
        let mut state = self.state.lock();
        if state.used.saturating_add(size) > self.settings.max_bytes {
            log::debug!(
                "heap limit reached: {} used, {} requested",
                state.used,
                size
            );
            return Err(AllocError::OutOfMemory { requested: size });
        }
        let layout = Layout::from_size_align(size, 8)
            .map_err(|_| AllocError::InvalidLength)?;
        // SAFETY: layout has non-zero size (every object has a header).
        let raw = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw)
            .ok_or(AllocError::OutOfMemory { requested: size })?;
        state.used += size;
        state.peak = state.peak.max(state.used);
        state.blocks.push(Block { ptr, layout });
        Ok(ptr)
    }

    /// Allocate a zeroed instance of a reference class (or a box of a value
    /// class).
    pub fn alloc_object(&self, class: &Class) -> Result<ObjRef, AllocError> {
        let size = class.instance_size.max(HEADER_SIZE);
        let ptr = self.alloc_zeroed(size)?;
        // SAFETY: fresh allocation of at least HEADER_SIZE bytes.
        unsafe {
            ptr.as_ptr()
                .cast::<ObjectHeader>()
                .write(ObjectHeader::new(class));
        }
        Ok(ObjRef::from_raw(ptr.as_ptr()))
    }

    /// Box a value-type value copied from `value`.
    ///
    /// # Safety
    ///
    /// `value` must be readable for `class.value_size` bytes.
    pub unsafe fn box_value(
        &self,
        class: &Class,
        value: *const u8,
    ) -> Result<ObjRef, AllocError> {
        let obj = self.alloc_object(class)?;
        unsafe {
            std::ptr::copy_nonoverlapping(value, obj.data(), class.value_size);
        }
        Ok(obj)
    }

    /// Allocate a single-dimension zero-based array.
    pub fn alloc_vector(
        &self,
        class: &Class,
        length: usize,
    ) -> Result<ObjRef, AllocError> {
        let bytes = length
            .checked_mul(class.element_size())
            .and_then(|b| b.checked_add(ARRAY_DATA_OFFSET))
            .ok_or(AllocError::InvalidLength)?;
        let ptr = self.alloc_zeroed(bytes)?;
        // SAFETY: fresh allocation of at least ARRAY_DATA_OFFSET bytes.
        unsafe {
            ptr.as_ptr().cast::<ArrayObject>().write(ArrayObject {
                header: ObjectHeader::new(class),
                bounds: std::ptr::null_mut(),
                max_length: length,
            });
        }
        Ok(ObjRef::from_raw(ptr.as_ptr()))
    }

    /// Allocate an array with explicit per-dimension lengths and optional
    /// lower bounds.
    pub fn alloc_array(
        &self,
        class: &Class,
        lengths: &[usize],
        lower_bounds: Option<&[isize]>,
    ) -> Result<ObjRef, AllocError> {
        let rank = class.rank() as usize;
        if lengths.len() != rank
            || lower_bounds.is_some_and(|lb| lb.len() != rank)
        {
            return Err(AllocError::InvalidLength);
        }
        let total = lengths
            .iter()
            .try_fold(1usize, |acc, &len| acc.checked_mul(len))
            .ok_or(AllocError::InvalidLength)?;
        let data_bytes = total
            .checked_mul(class.element_size())
            .and_then(|b| b.checked_next_multiple_of(8))
            .ok_or(AllocError::InvalidLength)?;
        let bounds_at = ARRAY_DATA_OFFSET + data_bytes;
        let bytes = bounds_at
            .checked_add(rank * size_of::<ArrayBounds>())
            .ok_or(AllocError::InvalidLength)?;
        let ptr = self.alloc_zeroed(bytes)?;
        // SAFETY: the allocation covers the header, data and bounds.
        unsafe {
            let bounds = ptr.as_ptr().add(bounds_at).cast::<ArrayBounds>();
            for (i, &length) in lengths.iter().enumerate() {
                bounds.add(i).write(ArrayBounds {
                    length,
                    lower_bound: lower_bounds.map_or(0, |lb| lb[i]),
                });
            }
            ptr.as_ptr().cast::<ArrayObject>().write(ArrayObject {
                header: ObjectHeader::new(class),
                bounds,
                max_length: total,
            });
        }
        Ok(ObjRef::from_raw(ptr.as_ptr()))
    }

    pub fn alloc_string(
        &self,
        class: &Class,
        value: &str,
    ) -> Result<ObjRef, AllocError> {
        let units: Vec<u16> = value.encode_utf16().collect();
        let ptr = self.alloc_zeroed(STRING_DATA_OFFSET + units.len() * 2)?;
        // SAFETY: the allocation covers the header and every code unit.
        unsafe {
            ptr.as_ptr().cast::<StringObject>().write(StringObject {
                header: ObjectHeader::new(class),
                length: units.len(),
            });
            std::ptr::copy_nonoverlapping(
                units.as_ptr(),
                ptr.as_ptr().add(STRING_DATA_OFFSET).cast::<u16>(),
                units.len(),
            );
        }
        Ok(ObjRef::from_raw(ptr.as_ptr()))
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        for block in state.blocks.drain(..) {
            // SAFETY: allocated with this layout in alloc_zeroed.
            unsafe { std::alloc::dealloc(block.ptr.as_ptr(), block.layout) };
        }
    }
}
