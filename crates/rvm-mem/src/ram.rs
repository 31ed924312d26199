use std::cell::UnsafeCell;
use std::ptr;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RamError {
    #[error("guest RAM region is empty")]
    Empty,
    #[error("guest RAM region {begin:#x}+{size:#x} wraps the physical address space")]
    AddressWrap { begin: u64, size: u64 },
    #[error("range {addr:#x}+{len:#x} is outside guest RAM {begin:#x}..{end:#x}")]
    OutOfBounds {
        addr: u64,
        len: u64,
        begin: u64,
        end: u64,
    },
}

/// Contiguous byte-addressable guest RAM.
///
/// Every access is bounds-checked against the whole range up front; a failed
/// call has no partial effect. Byte granularity only; alignment is the
/// caller's concern.
///
/// RAM is shared by hart threads and device DMA threads without any
/// machine-level locking. Accesses through `&self` may race; the contents
/// observed by overlapping concurrent accesses are whatever the host gives
/// for non-atomic memory, and any stronger ordering is the guest's job
/// (fences in guest code).
pub struct GuestRam {
    begin: u64,
    bytes: Box<[UnsafeCell<u8>]>,
}

// SAFETY: all access goes through raw-pointer copies below; data races on the
// byte buffer are permitted by the type's contract (guest-visible memory).
unsafe impl Send for GuestRam {}
unsafe impl Sync for GuestRam {}

impl GuestRam {
    pub fn new(begin: u64, size: u64) -> Result<Self, RamError> {
        if size == 0 {
            return Err(RamError::Empty);
        }
        if begin.checked_add(size).is_none() {
            return Err(RamError::AddressWrap { begin, size });
        }
        let bytes = vec![0u8; size as usize].into_boxed_slice();
        // SAFETY: `UnsafeCell<u8>` is `repr(transparent)` over `u8`.
        let bytes = unsafe { std::mem::transmute::<Box<[u8]>, Box<[UnsafeCell<u8>]>>(bytes) };
        Ok(Self { begin, bytes })
    }

    pub fn begin(&self) -> u64 {
        self.begin
    }

    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }

    /// One past the last valid physical address.
    pub fn end(&self) -> u64 {
        self.begin + self.size()
    }

    pub fn contains(&self, addr: u64, len: u64) -> bool {
        addr >= self.begin && addr.checked_add(len).is_some_and(|e| e <= self.end())
    }

    fn offset(&self, addr: u64, len: usize) -> Result<usize, RamError> {
        if self.contains(addr, len as u64) {
            Ok((addr - self.begin) as usize)
        } else {
            Err(RamError::OutOfBounds {
                addr,
                len: len as u64,
                begin: self.begin,
                end: self.end(),
            })
        }
    }

    /// Copy `dst.len()` bytes out of guest RAM starting at `addr`.
    pub fn read_into(&self, addr: u64, dst: &mut [u8]) -> Result<(), RamError> {
        let off = self.offset(addr, dst.len())?;
        // SAFETY: range checked above; concurrent overlapping guest accesses
        // are allowed to race per the type contract.
        unsafe {
            ptr::copy_nonoverlapping(
                self.bytes.as_ptr().cast::<u8>().add(off),
                dst.as_mut_ptr(),
                dst.len(),
            );
        }
        Ok(())
    }

    /// Copy `src.len()` bytes into guest RAM starting at `addr`.
    pub fn write_from(&self, addr: u64, src: &[u8]) -> Result<(), RamError> {
        let off = self.offset(addr, src.len())?;
        // SAFETY: as in `read_into`; writing through the shared buffer is the
        // point of `UnsafeCell` here.
        unsafe {
            ptr::copy_nonoverlapping(
                src.as_ptr(),
                (self.bytes.as_ptr() as *mut UnsafeCell<u8>).cast::<u8>().add(off),
                src.len(),
            );
        }
        Ok(())
    }

    /// Little-endian 32-bit load, used for instruction fetch.
    pub fn read_u32(&self, addr: u64) -> Result<u32, RamError> {
        let mut word = [0u8; 4];
        self.read_into(addr, &mut word)?;
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), RamError> {
        self.write_from(addr, &value.to_le_bytes())
    }
}

impl std::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRam")
            .field("begin", &format_args!("{:#x}", self.begin))
            .field("size", &format_args!("{:#x}", self.size()))
            .finish()
    }
}
