//! In-memory stand-ins for the hypervisor and machine memory.

use std::collections::HashMap;
use std::io;

use xeno_abi::{
    DomainLaunch, PageUpdateRequest, PAGE_SIZE, PGREQ_NORMAL, PTE_FLAGS_MASK, PTE_SIZE,
};

use crate::control::ControlPlane;
use crate::error::{ControlPlaneError, MapError, Result};
use crate::frames::{FrameMapper, Page, PAGE_BYTES};
use crate::layout::{l1_table_offset, l2_table_offset, Mfn};

/// Fill byte of frames nobody has written yet.
pub(crate) const POISON: u8 = 0xAA;

/// Machine memory holding only the frames that were touched.
#[derive(Default)]
pub(crate) struct SparseMemory {
    frames: HashMap<Mfn, Box<Page>>,
    /// Frame whose mapping fails.
    pub fail_on: Option<Mfn>,
    /// Number of successful `map` calls.
    pub maps: usize,
}

impl SparseMemory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Contents of `mfn`, if it was ever mapped.
    pub fn frame(&self, mfn: Mfn) -> Option<&Page> {
        self.frames.get(&mfn).map(|page| &**page)
    }

    /// Number of distinct frames touched.
    pub fn touched(&self) -> usize {
        self.frames.len()
    }

    fn page_mut(&mut self, mfn: Mfn) -> &mut Page {
        self.frames
            .entry(mfn)
            .or_insert_with(|| Box::new([POISON; PAGE_BYTES]))
    }

    /// Read the 32-bit table entry at physical address `addr`.
    pub fn read_entry(&self, addr: u64) -> u32 {
        let page = self
            .frame(Mfn(addr / PAGE_SIZE))
            .unwrap_or_else(|| panic!("read from untouched frame at {addr:#x}"));
        let at = (addr % PAGE_SIZE) as usize;
        u32::from_le_bytes(page[at..at + PTE_SIZE as usize].try_into().unwrap())
    }

    /// Apply the entry writes of a submitted batch, as the hypervisor would.
    pub fn apply(&mut self, requests: &[PageUpdateRequest]) {
        for request in requests.iter().filter(|r| r.tag() == PGREQ_NORMAL) {
            let addr = request.address();
            let at = (addr % PAGE_SIZE) as usize;
            let page = self.page_mut(Mfn(addr / PAGE_SIZE));
            page[at..at + PTE_SIZE as usize].copy_from_slice(&(request.val as u32).to_le_bytes());
        }
    }

    /// Translate `va` through the two-level tables rooted at `root`.
    ///
    /// Returns the leaf entry, or `None` if either level is not present.
    pub fn walk(&self, root: u64, va: u64) -> Option<u32> {
        let root_entry = self.read_entry(root + l2_table_offset(va) * PTE_SIZE);
        if root_entry & 1 == 0 {
            return None;
        }
        let leaf = u64::from(root_entry) & !PTE_FLAGS_MASK;
        let entry = self.read_entry(leaf + l1_table_offset(va) * PTE_SIZE);
        (entry & 1 != 0).then_some(entry)
    }
}

impl FrameMapper for SparseMemory {
    type View<'a> = &'a mut [u8];

    fn map(&mut self, mfn: Mfn) -> Result<&mut [u8]> {
        if self.fail_on == Some(mfn) {
            return Err(MapError::Map {
                mfn,
                source: io::Error::from_raw_os_error(libc::EFAULT),
            }
            .into());
        }
        self.maps += 1;
        Ok(&mut self.page_mut(mfn)[..])
    }
}

/// Scripted hypervisor owning a single domain.
pub(crate) struct FakeControlPlane {
    pub domain: u32,
    pub frames: Vec<u64>,
    /// Report this domain size instead of the number of frames.
    pub reported_pages: Option<u64>,
    /// Report this many frames from the frame-list query instead of all.
    pub short_frame_list: Option<u64>,
    /// Fail the update submission.
    pub reject_updates: bool,
    /// Last accepted update batch.
    pub submitted: Option<Vec<PageUpdateRequest>>,
    /// Launch descriptor passed to `start_domain`.
    pub launched: Option<DomainLaunch>,
    /// Operations in the order they were called.
    pub calls: Vec<&'static str>,
}

impl FakeControlPlane {
    pub fn new(domain: u32, frames: Vec<u64>) -> Self {
        Self {
            domain,
            frames,
            reported_pages: None,
            short_frame_list: None,
            reject_updates: false,
            submitted: None,
            launched: None,
            calls: Vec::new(),
        }
    }

    /// A domain whose frames are `first..first + pages`, reversed so the
    /// list is visibly not the identity.
    pub fn with_pages(domain: u32, first: u64, pages: u64) -> Self {
        Self::new(domain, (first..first + pages).rev().collect())
    }

    fn check_domain(&self, op: &'static str, domain: u32) -> Result<()> {
        if domain != self.domain {
            return Err(ControlPlaneError::Call {
                op,
                domain,
                source: io::Error::from_raw_os_error(libc::ESRCH),
            }
            .into());
        }
        Ok(())
    }
}

impl ControlPlane for FakeControlPlane {
    fn domain_pages(&mut self, domain: u32) -> Result<u64> {
        self.calls.push("domain_pages");
        self.check_domain("GETDOMAININFO", domain)?;
        Ok(self.reported_pages.unwrap_or(self.frames.len() as u64))
    }

    fn frame_list(&mut self, domain: u32, frames: &mut [u64]) -> Result<u64> {
        self.calls.push("frame_list");
        self.check_domain("GETMEMLIST", domain)?;
        let reported = self
            .short_frame_list
            .map_or(self.frames.len(), |n| n as usize)
            .min(frames.len())
            .min(self.frames.len());
        frames[..reported].copy_from_slice(&self.frames[..reported]);
        Ok(reported as u64)
    }

    fn submit_updates(&mut self, requests: &mut [PageUpdateRequest]) -> Result<()> {
        self.calls.push("submit_updates");
        if self.reject_updates {
            return Err(ControlPlaneError::UpdatesRejected {
                count: requests.len(),
                source: io::Error::from_raw_os_error(libc::EINVAL),
            }
            .into());
        }
        self.submitted = Some(requests.to_vec());
        Ok(())
    }

    fn start_domain(&mut self, launch: &DomainLaunch) -> Result<()> {
        self.calls.push("start_domain");
        self.check_domain("BUILDDOMAIN", launch.domain)?;
        self.launched = Some(launch.clone());
        Ok(())
    }
}
