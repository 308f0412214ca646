//! Kernel and ramdisk image validation.
//!
//! A kernel image is a 16-byte header followed by the payload copied
//! verbatim into the guest:
//!
//! ```text
//! Offset  Size  Field
//! ──────  ────  ─────
//! 0x00    8     signature  "XenoGues"
//! 0x08    8     load_addr  little-endian guest virtual load address
//! 0x10    ...   payload    file length - 16 bytes
//! ```
//!
//! A ramdisk is opaque; only its length matters.  Both images must leave
//! at least half of the domain free.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::{debug, info};
use xeno_abi::{GUEST_SIG, KERNEL_HEADER_LEN, LOAD_ADDR_LEN, PAGE_SIZE, SIG_LEN};

use crate::error::{FormatError, IoError, Result, SizeError};
use crate::frames::Page;
use crate::layout::pages_for;

/// Parsed kernel image header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelHeader {
    /// Guest virtual address the payload is loaded at.
    pub load_addr: u64,
    /// Payload bytes following the header.
    pub payload_len: u64,
}

impl KernelHeader {
    /// Check that the payload takes at most half of `domain_bytes`.
    pub fn check_fits(&self, domain_bytes: u64) -> std::result::Result<(), SizeError> {
        if self.payload_len.saturating_mul(2) > domain_bytes {
            return Err(SizeError::KernelTooLarge {
                image_bytes: self.payload_len,
                domain_bytes,
            });
        }
        Ok(())
    }
}

/// Read and validate the header at the current position of `reader`.
///
/// `file_len` is the length of the whole image; the payload length is
/// derived from it.  On success `reader` is positioned at the first
/// payload byte.
pub fn read_kernel_header(reader: &mut impl Read, file_len: u64) -> Result<KernelHeader> {
    let mut signature = [0u8; SIG_LEN];
    read_exact_at(reader, &mut signature, "kernel signature", 0)?;
    if signature != GUEST_SIG {
        return Err(FormatError::BadSignature { found: signature }.into());
    }

    let mut load_addr = [0u8; LOAD_ADDR_LEN];
    read_exact_at(reader, &mut load_addr, "kernel load address", SIG_LEN as u64)?;
    let load_addr = u64::from_le_bytes(load_addr);
    if load_addr % PAGE_SIZE != 0 {
        return Err(FormatError::UnalignedLoadAddress { load_addr }.into());
    }

    let payload_len = file_len
        .checked_sub(KERNEL_HEADER_LEN as u64)
        .ok_or_else(|| IoError::Read {
            what: "kernel header",
            offset: 0,
            expected: KERNEL_HEADER_LEN,
            source: io::Error::from(io::ErrorKind::UnexpectedEof),
        })?;

    Ok(KernelHeader {
        load_addr,
        payload_len,
    })
}

/// Read and validate the header, then check the payload against the domain.
pub fn load_kernel_header(
    reader: &mut impl Read,
    file_len: u64,
    domain_bytes: u64,
) -> Result<KernelHeader> {
    let header = read_kernel_header(reader, file_len)?;
    header.check_fits(domain_bytes)?;
    Ok(header)
}

/// Check that kernel payload and ramdisk together take at most half of
/// `domain_bytes`.
pub fn check_ramdisk_fits(
    kernel_bytes: u64,
    ramdisk_bytes: u64,
    domain_bytes: u64,
) -> std::result::Result<(), SizeError> {
    let combined = kernel_bytes.saturating_add(ramdisk_bytes);
    if combined.saturating_mul(2) > domain_bytes {
        return Err(SizeError::RamdiskTooLarge {
            kernel_bytes,
            ramdisk_bytes,
            domain_bytes,
        });
    }
    Ok(())
}

fn read_exact_at(
    reader: &mut impl Read,
    buf: &mut [u8],
    what: &'static str,
    offset: u64,
) -> Result<()> {
    reader.read_exact(buf).map_err(|source| IoError::Read {
        what,
        offset,
        expected: buf.len(),
        source,
    })?;
    Ok(())
}

fn open_with_len(path: &Path) -> Result<(File, u64)> {
    let file = File::open(path).map_err(|source| IoError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let len = file
        .metadata()
        .map_err(|source| IoError::Stat {
            path: path.to_path_buf(),
            source,
        })?
        .len();
    Ok((file, len))
}

// ═══════════════════════════════════════════════════════════════════════
//  Image handles
// ═══════════════════════════════════════════════════════════════════════

/// A validated kernel image, positioned at its payload.
#[derive(Debug)]
pub struct KernelImage<R = File> {
    reader: R,
    header: KernelHeader,
}

impl KernelImage<File> {
    /// Open the kernel at `path` and validate it against a domain of
    /// `domain_bytes`.
    pub fn open(path: impl AsRef<Path>, domain_bytes: u64) -> Result<Self> {
        let path = path.as_ref();
        let (file, len) = open_with_len(path)?;
        let image = Self::from_reader(file, len, domain_bytes)?;
        info!(
            "Kernel {}: load address {:#x}, {} payload bytes",
            path.display(),
            image.header.load_addr,
            image.header.payload_len
        );
        Ok(image)
    }

    /// Open and parse the kernel header without checking it against a domain.
    pub fn inspect(path: impl AsRef<Path>) -> Result<KernelHeader> {
        let (mut file, len) = open_with_len(path.as_ref())?;
        read_kernel_header(&mut file, len)
    }
}

impl<R: Read> KernelImage<R> {
    /// Validate the image read from `reader`, `file_len` bytes long.
    pub fn from_reader(mut reader: R, file_len: u64, domain_bytes: u64) -> Result<Self> {
        let header = load_kernel_header(&mut reader, file_len, domain_bytes)?;
        Ok(Self { reader, header })
    }

    pub fn header(&self) -> KernelHeader {
        self.header
    }

    /// The payload stream, to be copied into guest frames.
    pub fn into_payload(self) -> Payload<R> {
        Payload::new(self.reader, self.header.payload_len, "kernel image")
    }
}

/// A ramdisk validated against the domain and the kernel it accompanies.
#[derive(Debug)]
pub struct RamdiskImage<R = File> {
    reader: R,
    len: u64,
    path: Option<PathBuf>,
}

impl RamdiskImage<File> {
    /// Open the ramdisk at `path` and check it fits alongside a kernel
    /// payload of `kernel_bytes`.
    pub fn open(path: impl AsRef<Path>, domain_bytes: u64, kernel_bytes: u64) -> Result<Self> {
        let path = path.as_ref();
        let (file, len) = open_with_len(path)?;
        let mut image = Self::from_reader(file, len, domain_bytes, kernel_bytes)?;
        info!("Initrd {}: {} bytes", path.display(), len);
        image.path = Some(path.to_path_buf());
        Ok(image)
    }
}

impl<R: Read> RamdiskImage<R> {
    pub fn from_reader(reader: R, len: u64, domain_bytes: u64, kernel_bytes: u64) -> Result<Self> {
        check_ramdisk_fits(kernel_bytes, len, domain_bytes)?;
        Ok(Self {
            reader,
            len,
            path: None,
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn into_payload(self) -> Payload<R> {
        Payload::new(self.reader, self.len, "initrd image")
    }
}

/// A byte stream of known length, read one page at a time.
#[derive(Debug)]
pub struct Payload<R> {
    reader: R,
    len: u64,
    offset: u64,
    what: &'static str,
}

impl<R: Read> Payload<R> {
    pub fn new(reader: R, len: u64, what: &'static str) -> Self {
        Self {
            reader,
            len,
            offset: 0,
            what,
        }
    }

    /// Total payload bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Guest pages the payload occupies.
    pub fn pages(&self) -> u64 {
        pages_for(self.len)
    }

    /// Fill `page` with the next page of payload, zero-padding past the end.
    ///
    /// Returns `false` once the whole payload has been read.  A stream
    /// that ends early is an [`IoError::Read`].
    pub fn next_page(&mut self, page: &mut Page) -> Result<bool> {
        let remaining = self.len - self.offset;
        if remaining == 0 {
            return Ok(false);
        }
        let chunk = remaining.min(PAGE_SIZE) as usize;
        page[chunk..].fill(0);
        read_exact_at(&mut self.reader, &mut page[..chunk], self.what, self.offset)?;
        self.offset += chunk as u64;
        debug!("Read {} bytes of {} at offset {}", chunk, self.what, self.offset - chunk as u64);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use crate::frames::PAGE_BYTES;
    use std::io::{Cursor, Write};

    const LOAD: u64 = 0xC000_0000;

    fn kernel_bytes(load_addr: u64, payload: &[u8]) -> Vec<u8> {
        let mut image = GUEST_SIG.to_vec();
        image.extend_from_slice(&load_addr.to_le_bytes());
        image.extend_from_slice(payload);
        image
    }

    fn parse(image: &[u8]) -> Result<KernelHeader> {
        read_kernel_header(&mut Cursor::new(image), image.len() as u64)
    }

    // ─── Header ──────────────────────────────────────────────────────

    #[test]
    fn valid_header_yields_load_address_and_payload_size() {
        let header = parse(&kernel_bytes(LOAD, &[7u8; 100])).unwrap();
        assert_eq!(
            header,
            KernelHeader {
                load_addr: LOAD,
                payload_len: 100
            }
        );
    }

    #[test]
    fn header_then_payload_consumes_file_exactly() {
        let image = kernel_bytes(LOAD, &[3u8; 5000]);
        let mut reader = Cursor::new(&image[..]);
        let header = read_kernel_header(&mut reader, image.len() as u64).unwrap();
        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).unwrap();
        assert_eq!(rest.len() as u64, header.payload_len);
    }

    #[test]
    fn wrong_signature_is_format_error() {
        let mut image = kernel_bytes(LOAD, &[0u8; 64]);
        image[0] = b'L';
        match parse(&image) {
            Err(BuildError::Format(FormatError::BadSignature { found })) => {
                assert_eq!(&found, b"LenoGues");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn file_shorter_than_header_is_io_error() {
        let image = kernel_bytes(LOAD, &[]);
        let err = parse(&image[..10]).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Io(IoError::Read { what: "kernel load address", offset: 8, expected: 8, .. })
        ));

        let err = parse(&image[..5]).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Io(IoError::Read { what: "kernel signature", offset: 0, expected: 8, .. })
        ));
    }

    #[test]
    fn claimed_length_shorter_than_header_is_io_error() {
        let image = kernel_bytes(LOAD, &[0u8; 32]);
        let err = read_kernel_header(&mut Cursor::new(&image), 10).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Io(IoError::Read { what: "kernel header", offset: 0, expected: 16, .. })
        ));
    }

    #[test]
    fn header_only_image_has_empty_payload() {
        let header = parse(&kernel_bytes(LOAD, &[])).unwrap();
        assert_eq!(header.payload_len, 0);
    }

    #[test]
    fn unaligned_load_address_is_rejected() {
        let err = parse(&kernel_bytes(LOAD + 0x10, &[0u8; 8])).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Format(FormatError::UnalignedLoadAddress { load_addr }) if load_addr == LOAD + 0x10
        ));
    }

    #[test]
    fn stream_shorter_than_claimed_length_is_io_error() {
        let image = kernel_bytes(LOAD, &[]);
        let err = read_kernel_header(&mut Cursor::new(&image[..12]), 64).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Io(IoError::Read { what: "kernel load address", offset: 8, expected: 8, .. })
        ));
    }

    // ─── Size checks ─────────────────────────────────────────────────

    #[test]
    fn kernel_up_to_half_the_domain_fits() {
        let domain = 16 * PAGE_SIZE;
        let image = kernel_bytes(LOAD, &vec![0u8; (domain / 2) as usize]);
        let header =
            load_kernel_header(&mut Cursor::new(&image), image.len() as u64, domain).unwrap();
        assert_eq!(header.payload_len, domain / 2);
    }

    #[test]
    fn kernel_over_half_the_domain_is_size_error() {
        // 3 pages of payload against a 4-page domain.
        let image = kernel_bytes(LOAD, &vec![0u8; 3 * PAGE_BYTES]);
        let err = load_kernel_header(&mut Cursor::new(&image), image.len() as u64, 4 * PAGE_SIZE)
            .unwrap_err();
        assert!(matches!(
            err,
            BuildError::Size(SizeError::KernelTooLarge { image_bytes, domain_bytes })
                if image_bytes == 3 * PAGE_SIZE && domain_bytes == 4 * PAGE_SIZE
        ));
    }

    #[test]
    fn ramdisk_counts_against_the_same_half() {
        let domain = 16 * PAGE_SIZE;
        assert!(check_ramdisk_fits(4 * PAGE_SIZE, 4 * PAGE_SIZE, domain).is_ok());
        assert!(matches!(
            check_ramdisk_fits(4 * PAGE_SIZE, 4 * PAGE_SIZE + 1, domain),
            Err(SizeError::RamdiskTooLarge { .. })
        ));
    }

    // ─── Files and payload streaming ─────────────────────────────────

    #[test]
    fn open_reads_kernel_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&kernel_bytes(LOAD, &[1u8; 300])).unwrap();
        file.flush().unwrap();

        let image = KernelImage::open(file.path(), 16 * PAGE_SIZE).unwrap();
        assert_eq!(image.header().payload_len, 300);
        assert_eq!(KernelImage::inspect(file.path()).unwrap(), image.header());
    }

    #[test]
    fn open_missing_kernel_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = KernelImage::open(dir.path().join("vmlinux"), 16 * PAGE_SIZE).unwrap_err();
        assert!(matches!(err, BuildError::Io(IoError::Open { .. })));
    }

    #[test]
    fn open_ramdisk_records_path_and_length() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&[9u8; 1000]).unwrap();
        file.flush().unwrap();

        let ramdisk = RamdiskImage::open(file.path(), 16 * PAGE_SIZE, 100).unwrap();
        assert_eq!(ramdisk.len(), 1000);
        assert_eq!(ramdisk.path(), Some(file.path()));
    }

    #[test]
    fn payload_pages_are_zero_padded() {
        let payload = vec![0x5Au8; PAGE_BYTES + 10];
        let image = kernel_bytes(LOAD, &payload);
        let kernel = KernelImage::from_reader(Cursor::new(image), (PAGE_BYTES + 26) as u64, 1 << 20)
            .unwrap();
        let mut stream = kernel.into_payload();
        assert_eq!(stream.pages(), 2);

        let mut page = [0xFFu8; PAGE_BYTES];
        assert!(stream.next_page(&mut page).unwrap());
        assert!(page.iter().all(|&b| b == 0x5A));

        page.fill(0xFF);
        assert!(stream.next_page(&mut page).unwrap());
        assert!(page[..10].iter().all(|&b| b == 0x5A));
        assert!(page[10..].iter().all(|&b| b == 0));

        assert!(!stream.next_page(&mut page).unwrap());
    }

    #[test]
    fn payload_ending_early_is_io_error() {
        let mut stream = Payload::new(Cursor::new(vec![1u8; 100]), 200, "initrd image");
        let mut page = [0u8; PAGE_BYTES];
        let err = stream.next_page(&mut page).unwrap_err();
        assert!(matches!(
            err,
            BuildError::Io(IoError::Read { what: "initrd image", offset: 0, expected: 200, .. })
        ));
    }
}
