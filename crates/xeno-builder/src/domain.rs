//! End-to-end domain build.
//!
//! ```text
//! validate request ─► domain size ─► kernel / initrd checks ─► frame list
//!        ─► load + tables ─► submit batch ─► command line ─► start domain
//! ```
//!
//! Every failure before the final call leaves the domain unstarted.  The
//! only non-fatal condition is an over-long command line, which is
//! truncated and reported.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use log::{error, info};
use xeno_abi::DomainLaunch;

use crate::builder::{AddressSpaceBuilder, GuestLayout};
use crate::config::DomainRequest;
use crate::control::ControlPlane;
use crate::error::{IoError, Result};
use crate::frames::FrameMapper;
use crate::image::{KernelImage, RamdiskImage};
use crate::inventory;
use crate::launch::{launch_descriptor, CommandLine};
use crate::layout::domain_bytes;
use crate::submit::submit;

/// What a successful build produced.
#[derive(Debug, Clone)]
pub struct BuiltDomain {
    pub layout: GuestLayout,
    pub launch: DomainLaunch,
    /// Page-table update requests submitted.
    pub updates: usize,
}

/// Build and start the domain described by `request`.
pub fn build_domain<C, M>(
    control: &mut C,
    mapper: &mut M,
    request: &DomainRequest,
) -> Result<BuiltDomain>
where
    C: ControlPlane,
    M: FrameMapper,
{
    request.validate()?;
    let domain = request.domain;

    let total_pages = inventory::total_pages(control, domain)?;
    let domain_bytes = domain_bytes(total_pages)?;

    let kernel = KernelImage::open(&request.kernel, domain_bytes)?;
    let header = kernel.header();
    let ramdisk = request
        .initrd
        .as_ref()
        .map(|path| RamdiskImage::open(path, domain_bytes, header.payload_len))
        .transpose()?;

    let frames = inventory::frame_list(control, domain, total_pages)?;

    let builder = AddressSpaceBuilder::new(mapper, &frames, header.load_addr)?;
    let (layout, batch) = builder.build(
        kernel.into_payload(),
        ramdisk.map(RamdiskImage::into_payload),
    )?;

    let updates = submit(control, &batch)?;

    let (cmd_line, overflow) = CommandLine::compose(&request.boot_params);
    if let Some(overflow) = overflow {
        error!("{}; using truncated command line {:?}", overflow, cmd_line);
    }

    let launch = launch_descriptor(domain, &layout, request.num_vifs, &cmd_line);
    control.start_domain(&launch)?;
    info!("Domain {} built and started", domain);

    Ok(BuiltDomain {
        layout,
        launch,
        updates,
    })
}

/// Write `layout` as pretty-printed JSON to `path`.
pub fn save_layout(layout: &GuestLayout, path: &Path) -> Result<()> {
    let write_err = |source: io::Error| IoError::WriteLayout {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(write_err)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, layout).map_err(|e| write_err(e.into()))?;
    writer.flush().map_err(write_err)?;
    info!("Guest layout written to {}", path.display());
    Ok(())
}
