use std::fmt;

use bytecode::MemTy;
use object::ObjRef;

/// One operand-stack, argument or return cell.
///
/// Cells carry no tag; the instruction reading a cell decides what it
/// holds. 32-bit integers are kept sign-extended, `R4` values keep their
/// `f32` bits in the low half and value types are represented by a pointer
/// to their out-of-line storage.
#[repr(transparent)]
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct StackVal(u64);

const _: () = assert!(size_of::<StackVal>() == 8);

impl StackVal {
    pub const ZERO: StackVal = StackVal(0);

    #[inline(always)]
    pub const fn from_raw(bits: u64) -> Self {
        Self(bits)
    }

    #[inline(always)]
    pub const fn raw(self) -> u64 {
        self.0
    }

    #[inline(always)]
    pub const fn from_i32(v: i32) -> Self {
        Self(v as i64 as u64)
    }

    #[inline(always)]
    pub const fn as_i32(self) -> i32 {
        self.0 as u32 as i32
    }

    #[inline(always)]
    pub const fn from_bool(v: bool) -> Self {
        Self(v as u64)
    }

    #[inline(always)]
    pub const fn from_i64(v: i64) -> Self {
        Self(v as u64)
    }

    #[inline(always)]
    pub const fn as_i64(self) -> i64 {
        self.0 as i64
    }

    #[inline(always)]
    pub fn from_f32(v: f32) -> Self {
        Self(v.to_bits() as u64)
    }

    #[inline(always)]
    pub fn as_f32(self) -> f32 {
        f32::from_bits(self.0 as u32)
    }

    #[inline(always)]
    pub fn from_f64(v: f64) -> Self {
        Self(v.to_bits())
    }

    #[inline(always)]
    pub fn as_f64(self) -> f64 {
        f64::from_bits(self.0)
    }

    #[inline(always)]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline(always)]
    pub fn as_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }

    #[inline(always)]
    pub fn from_obj(obj: ObjRef) -> Self {
        Self(obj.addr() as u64)
    }

    #[inline(always)]
    pub fn as_obj(self) -> ObjRef {
        ObjRef::from_addr(self.0 as usize)
    }

    /// Read a value of memory type `ty` from `addr`, widening small
    /// integers to a full cell.
    ///
    /// # Safety
    ///
    /// `addr` must be readable for `ty.size()` bytes.
    #[inline]
    pub unsafe fn load(ty: MemTy, addr: *const u8) -> Self {
        unsafe {
            match ty {
                MemTy::I1 => Self::from_i32(addr.cast::<i8>().read_unaligned() as i32),
                MemTy::U1 => Self::from_i32(addr.read() as i32),
                MemTy::I2 => Self::from_i32(addr.cast::<i16>().read_unaligned() as i32),
                MemTy::U2 => Self::from_i32(addr.cast::<u16>().read_unaligned() as i32),
                MemTy::I4 | MemTy::U4 => {
                    Self::from_i32(addr.cast::<i32>().read_unaligned())
                }
                MemTy::R4 => Self::from_f32(addr.cast::<f32>().read_unaligned()),
                MemTy::I8 | MemTy::R8 | MemTy::I | MemTy::Ref => {
                    Self(addr.cast::<u64>().read_unaligned())
                }
            }
        }
    }

    /// Write the low `ty.size()` bytes of the cell to `addr`.
    ///
    /// # Safety
    ///
    /// `addr` must be writable for `ty.size()` bytes.
    #[inline]
    pub unsafe fn store(self, ty: MemTy, addr: *mut u8) {
        unsafe {
            match ty {
                MemTy::I1 | MemTy::U1 => addr.write(self.0 as u8),
                MemTy::I2 | MemTy::U2 => {
                    addr.cast::<u16>().write_unaligned(self.0 as u16)
                }
                MemTy::I4 | MemTy::U4 | MemTy::R4 => {
                    addr.cast::<u32>().write_unaligned(self.0 as u32)
                }
                MemTy::I8 | MemTy::R8 | MemTy::I | MemTy::Ref => {
                    addr.cast::<u64>().write_unaligned(self.0)
                }
            }
        }
    }
}

impl fmt::Debug for StackVal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "StackVal({:#x})", self.0)
    }
}
