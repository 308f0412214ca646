//! Guest memory image and page-table construction.
//!
//! [`AddressSpaceBuilder`] runs in two phases over the domain's frame list:
//!
//! 1. **Load**: the kernel payload, then the ramdisk, are copied page by
//!    page into frames `0..data_pages`, each mapped transiently.
//! 2. **Tables**: table frames are taken from the end of the frame list
//!    (root first, then one per leaf table), zeroed, and filled by
//!    emitting [`PageUpdate`] requests.  The builder never writes table
//!    contents directly; the hypervisor applies the batch.
//!
//! The result is the guest layout plus an [`UpdateBatch`] whose first
//! request pins the root table and in which every leaf table is installed
//! in the root before any entry is written into it.

use std::io::Read;

use log::{debug, info};
use serde::Serialize;
use xeno_abi::{PageUpdateRequest, PAGE_SIZE, PGEXT_PIN_L2_TABLE};

use crate::error::{Result, SizeError};
use crate::frames::{FrameMapper, PAGE_BYTES};
use crate::image::Payload;
use crate::layout::{
    l1_table_offset, l2_table_offset, leaf_entry, root_entry, table_slot, AllocCursor, Mfn,
    TablePlan,
};

// ═══════════════════════════════════════════════════════════════════════
//  Update requests
// ═══════════════════════════════════════════════════════════════════════

/// One page-table update, before encoding for the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageUpdate {
    /// Pin `table` as a root (second-level) table.
    PinRootTable { table: Mfn },
    /// Write `entry` into the table slot at physical address `slot`.
    WriteEntry { slot: u64, entry: u64 },
    /// Record that machine frame `frame` backs guest pfn `pfn`.
    RecordMapping { frame: Mfn, pfn: u64 },
}

impl PageUpdate {
    /// Wire form of this update.
    pub const fn encode(&self) -> PageUpdateRequest {
        match *self {
            PageUpdate::PinRootTable { table } => {
                PageUpdateRequest::extended(table.addr(), PGEXT_PIN_L2_TABLE)
            }
            PageUpdate::WriteEntry { slot, entry } => PageUpdateRequest::entry_write(slot, entry),
            PageUpdate::RecordMapping { frame, pfn } => {
                PageUpdateRequest::mpt_update(frame.addr(), pfn)
            }
        }
    }
}

/// Ordered page-table updates with a fixed capacity.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    updates: Vec<PageUpdate>,
    capacity: usize,
}

impl UpdateBatch {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            updates: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append `update`.
    ///
    /// # Errors
    ///
    /// [`SizeError::RequestBatchFull`] if the batch is already at capacity.
    pub fn push(&mut self, update: PageUpdate) -> std::result::Result<(), SizeError> {
        if self.updates.len() >= self.capacity {
            return Err(SizeError::RequestBatchFull {
                capacity: self.capacity,
            });
        }
        self.updates.push(update);
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.updates.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_slice(&self) -> &[PageUpdate] {
        &self.updates
    }

    /// Encode every update for submission.
    pub fn encode(&self) -> Vec<PageUpdateRequest> {
        self.updates.iter().map(PageUpdate::encode).collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Layout
// ═══════════════════════════════════════════════════════════════════════

/// Guest region holding the ramdisk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ModuleRegion {
    /// Guest virtual address of the first ramdisk byte.
    pub addr: u64,
    /// Ramdisk length in bytes.
    pub len: u64,
}

/// Addresses the domain is started with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GuestLayout {
    /// Physical address of the root table.
    pub root_table: u64,
    /// Guest virtual address of the kernel's first byte.
    pub load_addr: u64,
    /// Guest virtual address of the shared-info page, one page past the
    /// last mapped frame.
    pub shared_info_addr: u64,
    /// Guest virtual address of the start-info page.
    pub start_info_addr: u64,
    /// Ramdisk placement, if one was loaded.
    pub module: Option<ModuleRegion>,
    /// Table budget the layout was built with.
    pub plan: TablePlan,
}

// ═══════════════════════════════════════════════════════════════════════
//  Builder
// ═══════════════════════════════════════════════════════════════════════

/// Builds a domain's initial address space over its frame list.
pub struct AddressSpaceBuilder<'a, M> {
    mapper: &'a mut M,
    frames: &'a [Mfn],
    load_addr: u64,
    plan: TablePlan,
}

impl<'a, M: FrameMapper> AddressSpaceBuilder<'a, M> {
    /// Plan the tables for `frames` mapped from `load_addr`.
    pub fn new(mapper: &'a mut M, frames: &'a [Mfn], load_addr: u64) -> Result<Self> {
        let plan = TablePlan::new(load_addr, frames.len() as u64)?;
        info!(
            "Table plan: {} pages, {} leaf tables, tables from frame index {}",
            plan.total_pages, plan.leaf_tables, plan.pt_start
        );
        Ok(Self {
            mapper,
            frames,
            load_addr,
            plan,
        })
    }

    pub fn plan(&self) -> &TablePlan {
        &self.plan
    }

    /// Load `kernel` and the optional `ramdisk`, then emit the table batch.
    ///
    /// The images must end below the start-info page; this is checked
    /// before any frame is touched.
    pub fn build<K: Read, D: Read>(
        mut self,
        kernel: Payload<K>,
        ramdisk: Option<Payload<D>>,
    ) -> Result<(GuestLayout, UpdateBatch)> {
        let kernel_pages = kernel.pages();
        let ramdisk_pages = ramdisk.as_ref().map_or(0, Payload::pages);
        let start_info_index = self.plan.check_data_fits(kernel_pages + ramdisk_pages)?;

        let kernel_len = kernel.len();
        let loaded = self.load(kernel, 0)?;
        debug_assert_eq!(loaded, kernel_pages);
        info!("Loaded kernel: {} bytes in {} pages", kernel_len, loaded);

        let module = match ramdisk {
            Some(ramdisk) => {
                let len = ramdisk.len();
                let loaded = self.load(ramdisk, kernel_pages)?;
                debug_assert_eq!(loaded, ramdisk_pages);
                let addr = self.load_addr + kernel_pages * PAGE_SIZE;
                info!("Loaded initrd: {} bytes at {:#x}", len, addr);
                Some(ModuleRegion { addr, len })
            }
            None => None,
        };

        let (root, batch) = self.emit_tables()?;

        let layout = GuestLayout {
            root_table: root.addr(),
            load_addr: self.load_addr,
            shared_info_addr: self.load_addr + self.plan.total_pages * PAGE_SIZE,
            start_info_addr: self.load_addr + start_info_index * PAGE_SIZE,
            module,
            plan: self.plan,
        };
        info!(
            "Guest layout: root table {:#x}, start info {:#x}, shared info {:#x}",
            layout.root_table, layout.start_info_addr, layout.shared_info_addr
        );
        Ok((layout, batch))
    }

    /// Copy `payload` into consecutive frames starting at index `first`.
    fn load<R: Read>(&mut self, mut payload: Payload<R>, first: u64) -> Result<u64> {
        let mut page = [0u8; PAGE_BYTES];
        let mut index = first;
        while payload.next_page(&mut page)? {
            self.mapper.copy_in(self.frames[index as usize], &page)?;
            index += 1;
        }
        Ok(index - first)
    }

    /// Take the next table frame from the end of the list and zero it.
    fn alloc_table(&mut self, cursor: &mut AllocCursor) -> Result<Mfn> {
        let index = cursor.alloc()?;
        let table = self.frames[index as usize];
        self.mapper.zero(table)?;
        debug!("Table frame index {} is {}", index, table);
        Ok(table)
    }

    /// Allocate the root and leaf tables and emit every mapping request.
    fn emit_tables(&mut self) -> Result<(Mfn, UpdateBatch)> {
        let plan = self.plan;
        let mut batch = UpdateBatch::with_capacity(plan.request_capacity());
        let mut cursor = AllocCursor::new(&plan);

        let root = self.alloc_table(&mut cursor)?;
        batch.push(PageUpdate::PinRootTable { table: root })?;

        // One pass over every data page plus the shared-info slot, which
        // gets a leaf table but no entry.
        let mut leaf: Option<Mfn> = None;
        for count in 0..=plan.total_pages {
            let va = self.load_addr + count * PAGE_SIZE;
            let table = match leaf {
                Some(table) if l1_table_offset(va) != 0 => table,
                _ => {
                    let table = self.alloc_table(&mut cursor)?;
                    batch.push(PageUpdate::WriteEntry {
                        slot: table_slot(root, l2_table_offset(va)),
                        entry: root_entry(table),
                    })?;
                    leaf = Some(table);
                    table
                }
            };
            if count == plan.total_pages {
                break;
            }

            let frame = self.frames[count as usize];
            batch.push(PageUpdate::WriteEntry {
                slot: table_slot(table, l1_table_offset(va)),
                entry: leaf_entry(frame, plan.role(count)),
            })?;
            batch.push(PageUpdate::RecordMapping { frame, pfn: count })?;
        }

        debug_assert_eq!(cursor.allocated(plan.total_pages), plan.table_pages);
        debug_assert_eq!(batch.len(), batch.capacity());
        debug!("Emitted {} page-table updates", batch.len());
        Ok((root, batch))
    }
}
