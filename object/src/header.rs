use std::{
    fmt,
    mem::size_of,
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::class::Class;

/// The 16-byte header at the start of every heap object.
///
/// ```text
/// bytes 0‥7:  class pointer
/// bytes 8‥15: sync word (atomic); monitor index + 1, zero when the
///             object was never locked
/// ```
#[repr(C)]
pub struct ObjectHeader {
    class: *const Class,
    sync: AtomicUsize,
}

pub const HEADER_SIZE: usize = size_of::<ObjectHeader>();
const _: () = assert!(HEADER_SIZE == 16);

impl ObjectHeader {
    pub fn new(class: &Class) -> Self {
        Self {
            class: class as *const Class,
            sync: AtomicUsize::new(0),
        }
    }

    #[inline(always)]
    pub fn class_ptr(&self) -> *const Class {
        self.class
    }

    #[inline(always)]
    pub fn sync(&self) -> usize {
        self.sync.load(Ordering::Acquire)
    }

    /// Install `value` if the sync word is still zero; returns the word now
    /// in place.
    pub fn init_sync(&self, value: usize) -> usize {
        match self
            .sync
            .compare_exchange(0, value, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => value,
            Err(existing) => existing,
        }
    }
}

/// Bounds of one array dimension.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArrayBounds {
    pub length: usize,
    pub lower_bound: isize,
}

/// Array object layout.
///
/// ```text
/// header | bounds ptr | max_length | elements… | bounds[rank]
/// ```
///
/// Elements always start at [`ARRAY_DATA_OFFSET`]. `bounds` is null for
/// single-dimension zero-based arrays and otherwise points at the per
/// dimension bounds stored after the elements.
#[repr(C)]
pub struct ArrayObject {
    pub header: ObjectHeader,
    pub bounds: *mut ArrayBounds,
    /// Total element count.
    pub max_length: usize,
}

pub const ARRAY_DATA_OFFSET: usize = size_of::<ArrayObject>();
const _: () = assert!(ARRAY_DATA_OFFSET == 32);

/// String layout: header, UTF-16 length, then the code units.
#[repr(C)]
pub struct StringObject {
    pub header: ObjectHeader,
    pub length: usize,
}

pub const STRING_DATA_OFFSET: usize = size_of::<StringObject>();

/// A reference to a heap object, or null.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObjRef(*mut ObjectHeader);

// SAFETY: an ObjRef is an address; dereferencing it is unsafe regardless of
// the thread doing it.
unsafe impl Send for ObjRef {}
unsafe impl Sync for ObjRef {}

impl ObjRef {
    pub const NULL: ObjRef = ObjRef(std::ptr::null_mut());

    #[inline(always)]
    pub fn from_raw(ptr: *mut u8) -> Self {
        Self(ptr.cast())
    }

    #[inline(always)]
    pub fn from_addr(addr: usize) -> Self {
        Self(addr as *mut ObjectHeader)
    }

    #[inline(always)]
    pub fn as_ptr(self) -> *mut u8 {
        self.0.cast()
    }

    #[inline(always)]
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    #[inline(always)]
    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// # Safety
    ///
    /// `self` must be a live, non-null object.
    #[inline(always)]
    pub unsafe fn header<'a>(self) -> &'a ObjectHeader {
        unsafe { &*self.0 }
    }

    /// # Safety
    ///
    /// `self` must be a live, non-null object. Classes are never freed, so
    /// the returned reference outlives the object.
    #[inline(always)]
    pub unsafe fn class<'a>(self) -> &'a Class {
        unsafe { &*(*self.0).class }
    }

    /// Start of the payload after the header; for boxed value types this is
    /// the value itself.
    #[inline(always)]
    pub fn data(self) -> *mut u8 {
        self.as_ptr().wrapping_add(HEADER_SIZE)
    }

    // ── arrays ─────────────────────────────────────────────────────

    /// # Safety
    ///
    /// `self` must be a live array.
    #[inline(always)]
    pub unsafe fn array_len(self) -> usize {
        unsafe { (*self.0.cast::<ArrayObject>()).max_length }
    }

    /// # Safety
    ///
    /// `self` must be a live array.
    #[inline(always)]
    pub unsafe fn array_data(self) -> *mut u8 {
        self.as_ptr().wrapping_add(ARRAY_DATA_OFFSET)
    }

    /// Per-dimension bounds, or `None` for a zero-based vector.
    ///
    /// # Safety
    ///
    /// `self` must be a live array.
    pub unsafe fn array_bounds<'a>(self) -> Option<&'a [ArrayBounds]> {
        unsafe {
            let array = &*self.0.cast::<ArrayObject>();
            if array.bounds.is_null() {
                None
            } else {
                let rank = self.class().rank() as usize;
                Some(std::slice::from_raw_parts(array.bounds, rank))
            }
        }
    }

    // ── strings ────────────────────────────────────────────────────

    /// # Safety
    ///
    /// `self` must be a live string.
    pub unsafe fn string_chars<'a>(self) -> &'a [u16] {
        unsafe {
            let string = &*self.0.cast::<StringObject>();
            std::slice::from_raw_parts(
                self.as_ptr().add(STRING_DATA_OFFSET).cast::<u16>(),
                string.length,
            )
        }
    }

    /// # Safety
    ///
    /// `self` must be a live string.
    pub unsafe fn to_rust_string(self) -> String {
        String::from_utf16_lossy(unsafe { self.string_chars() })
    }
}

impl fmt::Debug for ObjRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("ObjRef(null)")
        } else {
            write!(f, "ObjRef({:p})", self.0)
        }
    }
}
