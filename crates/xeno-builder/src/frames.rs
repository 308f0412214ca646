//! Transient access to the domain's machine frames.
//!
//! The builder never sees guest memory as a whole.  It maps one machine
//! frame at a time into its own address space, writes it, and unmaps it
//! again.  A [`FrameMapper::map`] call borrows the mapper mutably, so at
//! most one frame view is alive at any moment and views cannot alias.

use std::fs::{File, OpenOptions};
use std::io;
use std::marker::PhantomData;
use std::ops::{Deref, DerefMut};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use log::{debug, trace};
use xeno_abi::PAGE_SIZE;

use crate::error::{MapError, Result};
use crate::layout::Mfn;

/// Bytes in one page, as a buffer length.
pub const PAGE_BYTES: usize = PAGE_SIZE as usize;

/// One page of data.
pub type Page = [u8; PAGE_BYTES];

/// Maps machine frames into the builder one at a time.
pub trait FrameMapper {
    /// A writable window onto exactly one frame.  Dropping it unmaps.
    type View<'a>: DerefMut<Target = [u8]>
    where
        Self: 'a;

    /// Map `mfn` for reading and writing.
    fn map(&mut self, mfn: Mfn) -> Result<Self::View<'_>>;

    /// Fill `mfn` with zeroes.
    fn zero(&mut self, mfn: Mfn) -> Result<()> {
        let mut view = self.map(mfn)?;
        view.fill(0);
        trace!("Zeroed frame {}", mfn);
        Ok(())
    }

    /// Overwrite all of `mfn` with `page`.
    fn copy_in(&mut self, mfn: Mfn, page: &Page) -> Result<()> {
        let mut view = self.map(mfn)?;
        view.copy_from_slice(page);
        trace!("Copied one page into frame {}", mfn);
        Ok(())
    }
}

/// [`FrameMapper`] over a physical-memory device such as `/dev/mem`.
///
/// Frame `n` lives at byte offset `n * PAGE_SIZE` of the device.  The
/// device handle is opened once and closed when the value drops.
#[derive(Debug)]
pub struct DevMem {
    file: File,
    path: PathBuf,
}

impl DevMem {
    /// Open the physical-memory device at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| MapError::OpenDevice {
                path: path.clone(),
                source,
            })?;
        debug!("Opened frame device {}", path.display());
        Ok(Self { file, path })
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameMapper for DevMem {
    type View<'a> = MappedFrame<'a>;

    fn map(&mut self, mfn: Mfn) -> Result<MappedFrame<'_>> {
        let offset = libc::off_t::try_from(mfn.addr()).map_err(|_| MapError::Map {
            mfn,
            source: io::Error::new(io::ErrorKind::InvalidInput, "frame offset overflows off_t"),
        })?;

        // SAFETY: a fresh shared mapping of one page; the kernel chooses the
        // address and the result is checked before use.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                PAGE_BYTES,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                self.file.as_raw_fd(),
                offset,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(MapError::Map {
                mfn,
                source: io::Error::last_os_error(),
            }
            .into());
        }
        let ptr = NonNull::new(addr.cast::<u8>()).ok_or_else(|| MapError::Map {
            mfn,
            source: io::Error::new(io::ErrorKind::Other, "mmap returned a null mapping"),
        })?;

        Ok(MappedFrame {
            ptr,
            mfn,
            _device: PhantomData,
        })
    }
}

/// One frame mapped from a [`DevMem`] device.
#[derive(Debug)]
pub struct MappedFrame<'a> {
    ptr: NonNull<u8>,
    mfn: Mfn,
    _device: PhantomData<&'a mut DevMem>,
}

impl MappedFrame<'_> {
    /// The frame this view maps.
    pub fn mfn(&self) -> Mfn {
        self.mfn
    }
}

impl Deref for MappedFrame<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `ptr` maps PAGE_BYTES readable bytes until drop.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), PAGE_BYTES) }
    }
}

impl DerefMut for MappedFrame<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: `ptr` maps PAGE_BYTES writable bytes until drop, and the
        // mutable borrow of the device rules out a second view.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), PAGE_BYTES) }
    }
}

impl Drop for MappedFrame<'_> {
    fn drop(&mut self) {
        // SAFETY: unmaps exactly the region mapped in `DevMem::map`.
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast::<libc::c_void>(), PAGE_BYTES);
        }
    }
}
