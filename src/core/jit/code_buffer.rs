//! Code Buffer.
//!
//! A single fixed-capacity arena holding translated code. Space is handed out
//! append-only; the only way to reclaim it is [`CodeBuffer::reset`], which
//! the block cache calls when it flushes every block. The arena is an
//! anonymous private mapping so its size never changes and offsets handed
//! out stay valid until the next reset.

use std::io;
use std::ptr::NonNull;

use crate::common::error::JitError;

/// Anonymous read/write mapping backing a [`CodeBuffer`].
struct Region {
    ptr: NonNull<u8>,
    len: usize,
}

impl Region {
    fn map(len: usize) -> Result<Self, JitError> {
        // SAFETY: anonymous private mapping with no address hint; the result
        // is checked against MAP_FAILED before use.
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANON | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(JitError::CodeBufferAlloc(io::Error::last_os_error()));
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| JitError::CodeBufferAlloc(io::Error::from(io::ErrorKind::OutOfMemory)))?;
        Ok(Self { ptr, len })
    }

    fn as_slice(&self) -> &[u8] {
        // SAFETY: the mapping is `len` bytes, readable, and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: unmapping exactly the range returned by mmap.
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len);
        }
    }
}

// SAFETY: the region is uniquely owned and only reached through `&`/`&mut`.
unsafe impl Send for Region {}

/// Host page size, falling back to 4 KiB if the query fails.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
}

pub struct CodeBuffer {
    region: Region,
    used: usize,
}

impl CodeBuffer {
    /// Maps an arena of at least `capacity` bytes, rounded up to whole pages.
    pub fn new(capacity: usize) -> Result<Self, JitError> {
        let page = page_size();
        let len = capacity.max(1).div_ceil(page) * page;
        Ok(Self {
            region: Region::map(len)?,
            used: 0,
        })
    }

    pub fn capacity(&self) -> usize {
        self.region.len
    }

    pub fn used(&self) -> usize {
        self.used
    }

    pub fn remaining(&self) -> usize {
        self.region.len - self.used
    }

    pub fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Appends `bytes` and returns the offset they were written at.
    pub fn emit(&mut self, bytes: &[u8]) -> Result<usize, JitError> {
        if bytes.len() > self.remaining() {
            return Err(JitError::CodeBufferFull {
                requested: bytes.len(),
                remaining: self.remaining(),
            });
        }
        let offset = self.used;
        self.region.as_mut_slice()[offset..offset + bytes.len()].copy_from_slice(bytes);
        self.used += bytes.len();
        Ok(offset)
    }

    /// Overwrites already emitted bytes, e.g. to link an exit.
    pub fn patch(&mut self, offset: usize, bytes: &[u8]) -> Result<(), JitError> {
        let end = offset
            .checked_add(bytes.len())
            .filter(|&end| end <= self.used)
            .ok_or(JitError::CorruptCode(offset))?;
        self.region.as_mut_slice()[offset..end].copy_from_slice(bytes);
        Ok(())
    }

    /// Returns `len` emitted bytes starting at `offset`.
    pub fn read(&self, offset: usize, len: usize) -> Option<&[u8]> {
        let end = offset.checked_add(len)?;
        if end > self.used {
            return None;
        }
        self.region.as_slice().get(offset..end)
    }

    /// Forgets everything emitted so far.
    pub fn reset(&mut self) {
        self.region.as_mut_slice()[..self.used].fill(0);
        self.used = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emit_until_full_then_reset() {
        let mut buf = CodeBuffer::new(1).unwrap();
        let cap = buf.capacity();
        assert_eq!(cap % page_size(), 0);

        let chunk = vec![0xAB; cap / 2];
        assert_eq!(buf.emit(&chunk).unwrap(), 0);
        assert_eq!(buf.emit(&chunk).unwrap(), cap / 2);
        assert!(matches!(
            buf.emit(&[1]),
            Err(JitError::CodeBufferFull { remaining: 0, .. })
        ));

        buf.reset();
        assert!(buf.is_empty());
        assert!(buf.read(0, 1).is_none());
    }

    #[test]
    fn patch_stays_within_emitted_bytes() {
        let mut buf = CodeBuffer::new(64).unwrap();
        buf.emit(&[0; 8]).unwrap();
        buf.patch(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(buf.read(4, 4), Some(&[1, 2, 3, 4][..]));
        assert!(buf.patch(6, &[0; 4]).is_err());
    }
}
