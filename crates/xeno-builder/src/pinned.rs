//! Scoped memory pinning for buffers the hypervisor reads directly.
//!
//! A privileged call hands the hypervisor the address of a buffer in this
//! process.  The buffer must stay resident for the whole call, so it is
//! locked with `mlock` on construction of a [`Pinned`] guard and unlocked
//! when the guard drops, on success and error paths alike.

use std::io;
use std::marker::PhantomData;
use std::mem;

use log::warn;

/// A mutably borrowed slice locked into physical memory.
#[derive(Debug)]
pub struct Pinned<'a, T> {
    ptr: *mut T,
    len: usize,
    _borrow: PhantomData<&'a mut [T]>,
}

impl<'a, T> Pinned<'a, T> {
    /// Lock `buf` into memory for the lifetime of the returned guard.
    pub fn new(buf: &'a mut [T]) -> io::Result<Self> {
        let len = buf.len();
        let ptr = buf.as_mut_ptr();
        if len > 0 {
            // SAFETY: `ptr..ptr+len` is a live, exclusively borrowed allocation.
            let rc = unsafe { libc::mlock(ptr as *const libc::c_void, len * mem::size_of::<T>()) };
            if rc != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(Self {
            ptr,
            len,
            _borrow: PhantomData,
        })
    }

    /// Address of the first element, as passed across the privileged boundary.
    #[inline]
    pub fn addr(&self) -> u64 {
        self.ptr as u64
    }

    /// Number of elements.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read access to the pinned elements, e.g. a reply the callee wrote.
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the guard holds the exclusive borrow of this slice.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl<T> Drop for Pinned<'_, T> {
    fn drop(&mut self) {
        if self.len == 0 {
            return;
        }
        // SAFETY: same region that was successfully locked in `new`.
        let rc = unsafe {
            libc::munlock(
                self.ptr as *const libc::c_void,
                self.len * mem::size_of::<T>(),
            )
        };
        if rc != 0 {
            warn!(
                "munlock of {} byte buffer failed: {}",
                self.len * mem::size_of::<T>(),
                io::Error::last_os_error()
            );
        }
    }
}
