//! Pure table geometry and page-budget arithmetic.
//!
//! Every function in this module is:
//! - **Pure**: no I/O, no frame access, no privileged calls.
//! - **Deterministic**: same inputs always produce the same outputs.
//! - **Assertion-guarded**: `debug_assert!` postconditions on the
//!   non-trivial computations.
//!
//! The guest frame sequence is split into two regions by
//! [`TablePlan::pt_start`]:
//!
//! ```text
//! index 0                         pt_start                 total_pages
//!   ┌──────────────────────────────┬──────────────────────────┐
//!   │ data frames (kernel, initrd, │ table frames (leaf tables │
//!   │ free guest memory)           │ then root, growing down)  │
//!   └──────────────────────────────┴──────────────────────────┘
//!                                   ◄── AllocCursor walks down
//! ```

use std::fmt;

use serde::Serialize;
use xeno_abi::{
    ENTRIES_PER_TABLE, GUEST_VIRT_LIMIT, L1_PROT, L2_PAGETABLE_SHIFT, L2_PROT, PAGE_RW,
    PAGE_SHIFT, PAGE_SIZE, PTE_SIZE,
};

use crate::error::{ConfigError, SizeError};

// Leaf entries for table pages must differ from data pages only in RW.
const _: () = assert!(L1_PROT & PAGE_RW != 0);
const _: () = assert!(ENTRIES_PER_TABLE.is_power_of_two());

/// A machine frame number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Mfn(pub u64);

impl Mfn {
    /// Physical address of the first byte of the frame.
    #[inline]
    pub const fn addr(self) -> u64 {
        self.0 << PAGE_SHIFT
    }
}

impl fmt::Display for Mfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Index of `va` within its leaf table.
#[inline]
pub const fn l1_table_offset(va: u64) -> u64 {
    (va >> PAGE_SHIFT) & (ENTRIES_PER_TABLE - 1)
}

/// Index of `va` within the root table.
#[inline]
pub const fn l2_table_offset(va: u64) -> u64 {
    (va >> L2_PAGETABLE_SHIFT) & (ENTRIES_PER_TABLE - 1)
}

/// Pages needed to hold `bytes`, rounding up.
#[inline]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

/// Bytes spanned by a domain of `total_pages`.
///
/// # Errors
///
/// [`SizeError::DomainTooLarge`] if the byte count does not fit in a `u64`.
pub fn domain_bytes(total_pages: u64) -> Result<u64, SizeError> {
    total_pages
        .checked_mul(PAGE_SIZE)
        .ok_or(SizeError::DomainTooLarge { total_pages })
}

/// Physical address of slot `index` in the table held by `table`.
#[inline]
pub const fn table_slot(table: Mfn, index: u64) -> u64 {
    table.addr() + index * PTE_SIZE
}

/// Root-table entry installing the leaf table held by `leaf`.
#[inline]
pub const fn root_entry(leaf: Mfn) -> u64 {
    leaf.addr() | L2_PROT
}

/// Leaf entry mapping `frame` with the protection its role demands.
#[inline]
pub const fn leaf_entry(frame: Mfn, role: FrameRole) -> u64 {
    frame.addr() | role.leaf_flags()
}

// ═══════════════════════════════════════════════════════════════════════
//  Frame roles
// ═══════════════════════════════════════════════════════════════════════

/// What a guest frame is used for once the domain starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRole {
    /// Ordinary guest memory: mapped writable.
    Data,
    /// Holds a page table: mapped read-only so the guest can never write
    /// its own tables directly.
    TablePage,
}

impl FrameRole {
    /// Role of the frame at `index` given the table boundary `pt_start`.
    #[inline]
    pub const fn of(index: u64, pt_start: u64) -> Self {
        if index < pt_start {
            FrameRole::Data
        } else {
            FrameRole::TablePage
        }
    }

    /// Flags of the leaf entry mapping a frame with this role.
    #[inline]
    pub const fn leaf_flags(self) -> u64 {
        match self {
            FrameRole::Data => L1_PROT,
            FrameRole::TablePage => L1_PROT & !PAGE_RW,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Table budget
// ═══════════════════════════════════════════════════════════════════════

/// How many table pages a domain needs and where they live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TablePlan {
    /// Pages owned by the domain.
    pub total_pages: u64,
    /// Leaf tables covering the data pages plus the shared-info slot.
    pub leaf_tables: u64,
    /// Leaf tables plus the root table.
    pub table_pages: u64,
    /// First frame index holding a table page.
    pub pt_start: u64,
}

impl TablePlan {
    /// Compute the table budget for `total_pages` mapped from `load_addr`.
    ///
    /// The mapping covers `total_pages` data pages plus one slot for the
    /// shared-info page.  The first leaf table starts at the leaf offset of
    /// `load_addr`, so the entries below it count against that table.
    ///
    /// # Errors
    ///
    /// - [`SizeError::AddressSpace`] if the mapped range would run past the
    ///   guest virtual address space.
    /// - [`SizeError::DomainTooSmall`] if the tables alone exceed the
    ///   domain.
    pub fn new(load_addr: u64, total_pages: u64) -> Result<Self, SizeError> {
        let end = total_pages
            .checked_add(1)
            .and_then(|pages| pages.checked_mul(PAGE_SIZE))
            .and_then(|span| load_addr.checked_add(span));
        if end.map_or(true, |end| end > GUEST_VIRT_LIMIT) {
            return Err(SizeError::AddressSpace {
                load_addr,
                pages: total_pages.saturating_add(1),
            });
        }

        let leaf_tables =
            (l1_table_offset(load_addr) + total_pages + ENTRIES_PER_TABLE) / ENTRIES_PER_TABLE;
        let table_pages = leaf_tables + 1;
        if table_pages > total_pages {
            return Err(SizeError::DomainTooSmall { total_pages });
        }

        let plan = Self {
            total_pages,
            leaf_tables,
            table_pages,
            pt_start: total_pages - table_pages,
        };

        // Postcondition: enough leaf entries for every page plus shared info.
        debug_assert!(
            plan.leaf_tables * ENTRIES_PER_TABLE
                >= l1_table_offset(load_addr) + total_pages + 1
        );
        // Postcondition: one fewer leaf table would not be enough.
        debug_assert!(
            (plan.leaf_tables - 1) * ENTRIES_PER_TABLE
                < l1_table_offset(load_addr) + total_pages + 1
        );
        Ok(plan)
    }

    /// Role of the frame at `index`.
    #[inline]
    pub const fn role(&self, index: u64) -> FrameRole {
        FrameRole::of(index, self.pt_start)
    }

    /// Frame index of the start-info page: just below the last two table
    /// allocations, or `None` if the domain has no room below its tables.
    #[inline]
    pub const fn start_info_index(&self) -> Option<u64> {
        self.pt_start.checked_sub(2)
    }

    /// Exact number of update requests the build emits: the root pin, one
    /// root entry per leaf table, and a leaf entry plus a machine-to-physical
    /// record per data page.
    #[inline]
    pub const fn request_capacity(&self) -> usize {
        (1 + self.leaf_tables + 2 * self.total_pages) as usize
    }

    /// Check that `data_pages` loaded image pages stay clear of the
    /// start-info page and the table region.
    ///
    /// Returns the start-info frame index.
    pub fn check_data_fits(&self, data_pages: u64) -> Result<u64, ConfigError> {
        match self.start_info_index() {
            Some(start_info_index) if data_pages <= start_info_index => Ok(start_info_index),
            start_info_index => Err(ConfigError::LayoutOverlap {
                data_pages,
                start_info_index: start_info_index.unwrap_or(0),
            }),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Backward allocation cursor
// ═══════════════════════════════════════════════════════════════════════

/// Hands out table-frame indices from the end of the frame sequence,
/// one at a time, never crossing below the table boundary.
#[derive(Debug, Clone)]
pub struct AllocCursor {
    /// One past the index the next allocation returns.
    next: u64,
    /// Lowest index the cursor may return.
    floor: u64,
}

impl AllocCursor {
    /// Start a cursor at `plan.total_pages - 1`.
    pub const fn new(plan: &TablePlan) -> Self {
        Self {
            next: plan.total_pages,
            floor: plan.pt_start,
        }
    }

    /// Take the next frame index, walking downward.
    ///
    /// # Errors
    ///
    /// [`SizeError::TableFramesExhausted`] once every frame at or above the
    /// boundary has been handed out.
    pub fn alloc(&mut self) -> Result<u64, SizeError> {
        if self.next <= self.floor {
            return Err(SizeError::TableFramesExhausted {
                pt_start: self.floor,
            });
        }
        self.next -= 1;
        Ok(self.next)
    }

    /// Number of frames handed out so far, given the starting total.
    pub const fn allocated(&self, total_pages: u64) -> u64 {
        total_pages - self.next
    }
}
