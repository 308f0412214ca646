//! Wire layout of the privileged domain-building interface.
//!
//! This crate fixes every number and structure that crosses the boundary
//! between the builder running in the control domain and the hypervisor:
//! page-table geometry and entry flags, the tagged page-table update
//! request, hypercall and control-operation numbers, and the fixed-offset
//! payloads of the control operations.  It is `no_std` with zero
//! dependencies.
//!
//! # Transport
//!
//! Every privileged operation is a synchronous hypercall issued through
//! the privileged-command device:
//!
//! 1. The caller fills a [`PrivcmdHypercall`] with an operation number
//!    and up to five word-sized arguments.
//! 2. Pointer arguments name buffers in the caller's address space which
//!    the hypervisor reads (or writes) directly.  The caller must keep
//!    those buffers resident for the whole call.
//! 3. `ioctl(fd, IOCTL_PRIVCMD_HYPERCALL, &call)` returns the hypervisor
//!    status; negative means the whole operation was rejected.
//!
//! Control operations ([`HYPERVISOR_DOM0_OP`]) carry a [`Dom0Op`]
//! envelope whose payload is one of the encoded structures below.

#![no_std]

// ═══════════════════════════════════════════════════════════════════════
//  Page and table geometry
// ═══════════════════════════════════════════════════════════════════════

/// log2 of the page size.
pub const PAGE_SHIFT: u32 = 12;

/// Size of one page (and one machine frame) in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Size of one page-table entry in bytes (two-level, non-PAE).
pub const PTE_SIZE: u64 = 4;

/// Entries held by one root or leaf table page.
pub const ENTRIES_PER_TABLE: u64 = PAGE_SIZE / PTE_SIZE;

/// Virtual address bits translated by one root-table entry.
pub const L2_PAGETABLE_SHIFT: u32 = 22;

/// Bytes of virtual address space covered by one leaf table.
pub const LEAF_TABLE_SPAN: u64 = 1 << L2_PAGETABLE_SHIFT;

/// Exclusive upper bound of the guest virtual address space.
pub const GUEST_VIRT_LIMIT: u64 = 1 << 32;

const _: () = assert!(ENTRIES_PER_TABLE == 1024);
const _: () = assert!(LEAF_TABLE_SPAN == ENTRIES_PER_TABLE * PAGE_SIZE);
const _: () = assert!(GUEST_VIRT_LIMIT == ENTRIES_PER_TABLE * LEAF_TABLE_SPAN);

// ═══════════════════════════════════════════════════════════════════════
//  Page-table entry flags
// ═══════════════════════════════════════════════════════════════════════

/// Entry maps a present page (or table).
pub const PAGE_PRESENT: u64 = 0x001;

/// Page is writable.
pub const PAGE_RW: u64 = 0x002;

/// Page is accessible from guest user mode.
pub const PAGE_USER: u64 = 0x004;

/// Page has been accessed.
pub const PAGE_ACCESSED: u64 = 0x020;

/// Page has been written.
pub const PAGE_DIRTY: u64 = 0x040;

/// Protection of a leaf entry mapping an ordinary data page.
pub const L1_PROT: u64 = PAGE_PRESENT | PAGE_RW | PAGE_ACCESSED;

/// Protection of a root entry installing a leaf table.
pub const L2_PROT: u64 = PAGE_PRESENT | PAGE_RW | PAGE_ACCESSED | PAGE_DIRTY | PAGE_USER;

/// Mask of the flag bits within an entry; the rest is the frame address.
pub const PTE_FLAGS_MASK: u64 = PAGE_SIZE - 1;

// ═══════════════════════════════════════════════════════════════════════
//  Page-table update requests
// ═══════════════════════════════════════════════════════════════════════

/// Request tag: plain write of `val` into the table slot at `ptr`.
pub const PGREQ_NORMAL: u64 = 0;

/// Request tag: record that machine frame `ptr` is guest pfn `val`.
pub const PGREQ_MPT_UPDATE: u64 = 1;

/// Request tag: extended command `val` applied to the page at `ptr`.
pub const PGREQ_EXTENDED_COMMAND: u64 = 2;

/// Bits of `ptr` that carry the request tag.
pub const PGREQ_TAG_MASK: u64 = 3;

/// Extended command: pin a page as the root table.
pub const PGEXT_PIN_L2_TABLE: u64 = 1;

/// One entry of the page-table update batch.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────
/// 0x00    8     ptr   target physical address | request tag
/// 0x08    8     val   entry value, pfn, or extended command code
/// ```
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PageUpdateRequest {
    pub ptr: u64,
    pub val: u64,
}

const _: () = assert!(core::mem::size_of::<PageUpdateRequest>() == 16);

impl PageUpdateRequest {
    /// Write `value` into the table slot at physical address `slot`.
    pub const fn entry_write(slot: u64, value: u64) -> Self {
        Self {
            ptr: (slot & !PGREQ_TAG_MASK) | PGREQ_NORMAL,
            val: value,
        }
    }

    /// Record machine frame address `frame_addr` as guest pfn `pfn`.
    pub const fn mpt_update(frame_addr: u64, pfn: u64) -> Self {
        Self {
            ptr: (frame_addr & !PGREQ_TAG_MASK) | PGREQ_MPT_UPDATE,
            val: pfn,
        }
    }

    /// Apply extended command `command` to the page at `page_addr`.
    pub const fn extended(page_addr: u64, command: u64) -> Self {
        Self {
            ptr: (page_addr & !PGREQ_TAG_MASK) | PGREQ_EXTENDED_COMMAND,
            val: command,
        }
    }

    /// The request tag carried in the low bits of `ptr`.
    pub const fn tag(&self) -> u64 {
        self.ptr & PGREQ_TAG_MASK
    }

    /// Target physical address with the tag stripped.
    pub const fn address(&self) -> u64 {
        self.ptr & !PGREQ_TAG_MASK
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Kernel image format
// ═══════════════════════════════════════════════════════════════════════

/// Signature every loadable kernel image starts with.
pub const GUEST_SIG: [u8; 8] = *b"XenoGues";

/// Length of the signature.
pub const SIG_LEN: usize = GUEST_SIG.len();

/// Size of the little-endian load address following the signature.
pub const LOAD_ADDR_LEN: usize = 8;

/// Bytes preceding the kernel payload.
pub const KERNEL_HEADER_LEN: usize = SIG_LEN + LOAD_ADDR_LEN;

const _: () = assert!(KERNEL_HEADER_LEN == 16);

// ═══════════════════════════════════════════════════════════════════════
//  Hypercalls and control operations
// ═══════════════════════════════════════════════════════════════════════

/// Hypercall: apply a batch of [`PageUpdateRequest`]s.
///
/// `arg[0]` = address of the request array, `arg[1]` = request count.
pub const HYPERVISOR_PT_UPDATE: u64 = 1;

/// Hypercall: execute a control operation.
///
/// `arg[0]` = address of a [`Dom0Op`].
pub const HYPERVISOR_DOM0_OP: u64 = 10;

/// Control operation: fetch the frame list of a domain.
pub const DOM0_GETMEMLIST: u32 = 2;

/// Control operation: fetch domain information.
pub const DOM0_GETDOMAININFO: u32 = 12;

/// Control operation: finish building a domain and make it runnable.
pub const DOM0_BUILDDOMAIN: u32 = 13;

/// Maximum kernel command line, including the NUL terminator.
pub const MAX_CMD_LEN: usize = 256;

/// Hypercall descriptor passed to the privileged-command device.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PrivcmdHypercall {
    pub op: u64,
    pub arg: [u64; 5],
}

const _: () = assert!(core::mem::size_of::<PrivcmdHypercall>() == 48);

const IOC_NRSHIFT: u32 = 0;
const IOC_TYPESHIFT: u32 = 8;
const IOC_SIZESHIFT: u32 = 16;
const IOC_DIRSHIFT: u32 = 30;
const IOC_NONE: u32 = 0;

/// Encode an ioctl request number the way the Linux `_IOC` macro does.
pub const fn ioc(dir: u32, ty: u8, nr: u8, size: usize) -> u32 {
    (dir << IOC_DIRSHIFT)
        | ((ty as u32) << IOC_TYPESHIFT)
        | ((nr as u32) << IOC_NRSHIFT)
        | ((size as u32) << IOC_SIZESHIFT)
}

/// `ioctl` request issuing one hypercall through the privileged device.
pub const IOCTL_PRIVCMD_HYPERCALL: u32 =
    ioc(IOC_NONE, b'P', 0, core::mem::size_of::<PrivcmdHypercall>());

/// Size of the payload area of a [`Dom0Op`].
pub const DOM0_PAYLOAD_MAX: usize = 504;

/// Control-operation envelope.
///
/// ```text
/// Offset  Size  Field
/// ──────  ────  ─────────────
/// 0x00    4     cmd           one of the DOM0_* constants
/// 0x04    4     (reserved)
/// 0x08    504   payload       encoded request, overwritten with the reply
/// ```
#[repr(C, align(8))]
#[derive(Clone)]
pub struct Dom0Op {
    pub cmd: u32,
    pub _reserved: u32,
    pub payload: [u8; DOM0_PAYLOAD_MAX],
}

const _: () = assert!(core::mem::size_of::<Dom0Op>() == 512);

impl Dom0Op {
    /// Create an operation with a zeroed payload.
    pub const fn new(cmd: u32) -> Self {
        Self {
            cmd,
            _reserved: 0,
            payload: [0; DOM0_PAYLOAD_MAX],
        }
    }
}

impl Dom0Op {
    /// `DOM0_GETDOMAININFO` request for `domain`.
    pub fn get_domain_info(domain: u32) -> Self {
        let mut op = Self::new(DOM0_GETDOMAININFO);
        let written = GetDomainInfo {
            domain,
            tot_pages: 0,
        }
        .encode(&mut op.payload);
        debug_assert_eq!(written, Some(GetDomainInfo::ENCODED_LEN));
        op
    }

    /// `DOM0_GETMEMLIST` request filling up to `max_pfns` entries at `buffer`.
    pub fn get_mem_list(domain: u32, max_pfns: u64, buffer: u64) -> Self {
        let mut op = Self::new(DOM0_GETMEMLIST);
        let written = GetMemList {
            domain,
            max_pfns,
            buffer,
            num_pfns: 0,
        }
        .encode(&mut op.payload);
        debug_assert_eq!(written, Some(GetMemList::ENCODED_LEN));
        op
    }

    /// `DOM0_BUILDDOMAIN` request carrying `launch`.
    pub fn build_domain(launch: &DomainLaunch) -> Self {
        let mut op = Self::new(DOM0_BUILDDOMAIN);
        let written = launch.encode(&mut op.payload);
        debug_assert_eq!(written, Some(DomainLaunch::ENCODED_LEN));
        op
    }

    /// The payload read back as a `DOM0_GETDOMAININFO` reply.
    pub fn domain_info(&self) -> GetDomainInfo {
        GetDomainInfo::decode(&self.payload).unwrap_or_default()
    }

    /// The payload read back as a `DOM0_GETMEMLIST` reply.
    pub fn mem_list(&self) -> GetMemList {
        GetMemList::decode(&self.payload).unwrap_or_default()
    }
}

const _: () = assert!(GetDomainInfo::ENCODED_LEN <= DOM0_PAYLOAD_MAX);
const _: () = assert!(GetMemList::ENCODED_LEN <= DOM0_PAYLOAD_MAX);

// ═══════════════════════════════════════════════════════════════════════
//  Payload encoding / decoding
// ═══════════════════════════════════════════════════════════════════════

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// `DOM0_GETDOMAININFO` payload.
///
/// ```text
/// Offset  Size  Field
/// 0x00    4     domain
/// 0x08    8     tot_pages    ← written by the hypervisor
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetDomainInfo {
    pub domain: u32,
    pub tot_pages: u64,
}

impl GetDomainInfo {
    pub const ENCODED_LEN: usize = 16;

    /// Encode into `buf`, returning the bytes written or `None` if short.
    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        put_u32(buf, 0, self.domain);
        put_u64(buf, 8, self.tot_pages);
        Some(Self::ENCODED_LEN)
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            domain: get_u32(buf, 0),
            tot_pages: get_u64(buf, 8),
        })
    }
}

/// `DOM0_GETMEMLIST` payload.
///
/// ```text
/// Offset  Size  Field
/// 0x00    4     domain
/// 0x08    8     max_pfns
/// 0x10    8     buffer       address of a u64 array of max_pfns entries
/// 0x18    8     num_pfns     ← written by the hypervisor
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GetMemList {
    pub domain: u32,
    pub max_pfns: u64,
    pub buffer: u64,
    pub num_pfns: u64,
}

impl GetMemList {
    pub const ENCODED_LEN: usize = 32;

    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        put_u32(buf, 0, self.domain);
        put_u64(buf, 8, self.max_pfns);
        put_u64(buf, 16, self.buffer);
        put_u64(buf, 24, self.num_pfns);
        Some(Self::ENCODED_LEN)
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        Some(Self {
            domain: get_u32(buf, 0),
            max_pfns: get_u64(buf, 8),
            buffer: get_u64(buf, 16),
            num_pfns: get_u64(buf, 24),
        })
    }
}

/// `DOM0_BUILDDOMAIN` payload: the memory layout handed to the
/// hypervisor when the domain is started.
///
/// ```text
/// Offset  Size  Field
/// 0x000   4     domain
/// 0x008   8     l2_pgt_addr          root table physical address
/// 0x010   8     virt_load_addr
/// 0x018   8     virt_shinfo_addr
/// 0x020   8     virt_startinfo_addr
/// 0x028   4     num_vifs
/// 0x02C   256   cmd_line             NUL-terminated
/// 0x130   8     virt_mod_addr
/// 0x138   8     virt_mod_len
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainLaunch {
    pub domain: u32,
    pub l2_pgt_addr: u64,
    pub virt_load_addr: u64,
    pub virt_shinfo_addr: u64,
    pub virt_startinfo_addr: u64,
    pub num_vifs: u32,
    pub cmd_line: [u8; MAX_CMD_LEN],
    pub virt_mod_addr: u64,
    pub virt_mod_len: u64,
}

const LAUNCH_CMD_LINE_OFFSET: usize = 0x2c;
const LAUNCH_CMD_LINE_END: usize = LAUNCH_CMD_LINE_OFFSET + MAX_CMD_LEN;
const LAUNCH_MOD_ADDR_OFFSET: usize = 0x130;

// The module fields are word aligned after the command line.
const _: () = assert!(LAUNCH_CMD_LINE_END <= LAUNCH_MOD_ADDR_OFFSET);
const _: () = assert!(LAUNCH_MOD_ADDR_OFFSET % 8 == 0);
const _: () = assert!(DomainLaunch::ENCODED_LEN <= DOM0_PAYLOAD_MAX);

impl Default for DomainLaunch {
    fn default() -> Self {
        Self {
            domain: 0,
            l2_pgt_addr: 0,
            virt_load_addr: 0,
            virt_shinfo_addr: 0,
            virt_startinfo_addr: 0,
            num_vifs: 0,
            cmd_line: [0; MAX_CMD_LEN],
            virt_mod_addr: 0,
            virt_mod_len: 0,
        }
    }
}

impl DomainLaunch {
    pub const ENCODED_LEN: usize = LAUNCH_MOD_ADDR_OFFSET + 16;

    pub fn encode(&self, buf: &mut [u8]) -> Option<usize> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        put_u32(buf, 0x00, self.domain);
        put_u64(buf, 0x08, self.l2_pgt_addr);
        put_u64(buf, 0x10, self.virt_load_addr);
        put_u64(buf, 0x18, self.virt_shinfo_addr);
        put_u64(buf, 0x20, self.virt_startinfo_addr);
        put_u32(buf, 0x28, self.num_vifs);
        buf[LAUNCH_CMD_LINE_OFFSET..LAUNCH_CMD_LINE_END].copy_from_slice(&self.cmd_line);
        put_u64(buf, LAUNCH_MOD_ADDR_OFFSET, self.virt_mod_addr);
        put_u64(buf, LAUNCH_MOD_ADDR_OFFSET + 8, self.virt_mod_len);
        Some(Self::ENCODED_LEN)
    }

    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < Self::ENCODED_LEN {
            return None;
        }
        let mut cmd_line = [0u8; MAX_CMD_LEN];
        cmd_line.copy_from_slice(&buf[LAUNCH_CMD_LINE_OFFSET..LAUNCH_CMD_LINE_END]);
        Some(Self {
            domain: get_u32(buf, 0x00),
            l2_pgt_addr: get_u64(buf, 0x08),
            virt_load_addr: get_u64(buf, 0x10),
            virt_shinfo_addr: get_u64(buf, 0x18),
            virt_startinfo_addr: get_u64(buf, 0x20),
            num_vifs: get_u32(buf, 0x28),
            cmd_line,
            virt_mod_addr: get_u64(buf, LAUNCH_MOD_ADDR_OFFSET),
            virt_mod_len: get_u64(buf, LAUNCH_MOD_ADDR_OFFSET + 8),
        })
    }

    /// The command line up to (not including) its NUL terminator.
    pub fn cmd_line_bytes(&self) -> &[u8] {
        let end = self
            .cmd_line
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(MAX_CMD_LEN);
        &self.cmd_line[..end]
    }
}
