//! Error taxonomy for domain building.
//!
//! Every failure is fatal to the build.  The variants of [`BuildError`]
//! name the class of failure; the inner enums carry the structured detail.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::layout::Mfn;

/// Result type alias using the builder's error type.
pub type Result<T> = std::result::Result<T, BuildError>;

/// Errors that abort a domain build.
#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Io(#[from] IoError),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    Size(#[from] SizeError),

    #[error(transparent)]
    Map(#[from] MapError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Open, read, or stat failures on kernel and ramdisk images.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("Cannot open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Cannot stat {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The image ended (or the read failed) before the expected byte count.
    #[error("Error reading {what}: expected {expected} bytes at offset {offset}: {source}")]
    Read {
        what: &'static str,
        offset: u64,
        expected: usize,
        #[source]
        source: io::Error,
    },

    #[error("Cannot write layout to {path}: {source}")]
    WriteLayout {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// The kernel image header is malformed.
#[derive(Error, Debug)]
pub enum FormatError {
    #[error("Kernel image does not contain required signature (found {found:02x?})")]
    BadSignature { found: [u8; 8] },

    #[error("Kernel load address {load_addr:#x} is not page aligned")]
    UnalignedLoadAddress { load_addr: u64 },
}

/// An image (or the structures derived from it) does not fit the domain.
#[derive(Error, Debug)]
pub enum SizeError {
    #[error("Kernel image size {image_bytes} larger than half the domain size {domain_bytes}")]
    KernelTooLarge { image_bytes: u64, domain_bytes: u64 },

    #[error(
        "Kernel + initrd too big to safely fit in domain memory \
         ({kernel_bytes} + {ramdisk_bytes} bytes, domain {domain_bytes} bytes)"
    )]
    RamdiskTooLarge {
        kernel_bytes: u64,
        ramdisk_bytes: u64,
        domain_bytes: u64,
    },

    #[error("Guest range {load_addr:#x} + {pages} pages exceeds the guest address space")]
    AddressSpace { load_addr: u64, pages: u64 },

    #[error("Domain of {total_pages} pages exceeds the addressable byte range")]
    DomainTooLarge { total_pages: u64 },

    #[error("Domain of {total_pages} pages cannot hold its own page tables")]
    DomainTooSmall { total_pages: u64 },

    #[error("Page-table update buffer full ({capacity} requests)")]
    RequestBatchFull { capacity: usize },

    #[error("Table-page allocation crossed into data frames (boundary index {pt_start})")]
    TableFramesExhausted { pt_start: u64 },
}

/// A machine frame could not be mapped into the builder.
#[derive(Error, Debug)]
pub enum MapError {
    #[error("Could not open {path}: {source}")]
    OpenDevice {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not map domain frame {mfn}: {source}")]
    Map {
        mfn: Mfn,
        #[source]
        source: io::Error,
    },
}

/// A privileged call failed or replied with something unusable.
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    #[error("Could not open privileged command interface {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("Could not lock {what} buffer in memory: {source}")]
    Pin {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("{op} failed for domain {domain}: {source}")]
    Call {
        op: &'static str,
        domain: u32,
        #[source]
        source: io::Error,
    },

    #[error("Domain {domain} reported no pages")]
    EmptyDomain { domain: u32 },

    #[error("Could not get the page frame list: got {got} frames, domain has {expected}")]
    ShortFrameList { got: u64, expected: u64 },

    #[error("Hypervisor rejected the page-table update batch ({count} requests): {source}")]
    UpdatesRejected {
        count: usize,
        #[source]
        source: io::Error,
    },

    #[error("Update batch malformed at request {index}: {reason}")]
    MalformedBatch { index: usize, reason: &'static str },
}

/// Invalid build request.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Refusing to build domain 0")]
    ReservedDomain,

    #[error("Size of image boot params too big: {needed} bytes exceeds maximum of {max}")]
    CmdlineTooLong { needed: usize, max: usize },

    #[error(
        "Start-info page {start_info_index} overlaps loaded image pages (0..{data_pages}); \
         domain too small for kernel and initrd"
    )]
    LayoutOverlap {
        data_pages: u64,
        start_info_index: u64,
    },
}
