//! Synchronous privileged calls into the hypervisor.
//!
//! [`ControlPlane`] is the seam between the builder and the hypervisor:
//! the four request/response operations the build needs, nothing more.
//! [`Privcmd`] implements it over the privileged-command device; tests
//! substitute a scripted fake.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use log::debug;
use xeno_abi::{
    Dom0Op, DomainLaunch, PageUpdateRequest, PrivcmdHypercall, HYPERVISOR_DOM0_OP,
    HYPERVISOR_PT_UPDATE, IOCTL_PRIVCMD_HYPERCALL,
};

use crate::error::{ControlPlaneError, Result};
use crate::pinned::Pinned;

/// The privileged operations consumed by the builder.
///
/// Every call is synchronous and all-or-nothing: an `Err` means the
/// hypervisor applied nothing.
pub trait ControlPlane {
    /// `QueryDomainInfo`: total pages owned by `domain`.
    fn domain_pages(&mut self, domain: u32) -> Result<u64>;

    /// `QueryFrameList`: fill `frames` with the domain's machine frame
    /// numbers in guest-physical order, returning how many the hypervisor
    /// reported.
    fn frame_list(&mut self, domain: u32, frames: &mut [u64]) -> Result<u64>;

    /// `SubmitPageTableUpdates`: apply the whole batch or nothing.
    fn submit_updates(&mut self, requests: &mut [PageUpdateRequest]) -> Result<()>;

    /// `StartDomain`: hand over the final layout and make the domain runnable.
    fn start_domain(&mut self, launch: &DomainLaunch) -> Result<()>;
}

/// [`ControlPlane`] over the privileged-command device.
///
/// The device handle is opened once and closed when the value drops.
#[derive(Debug)]
pub struct Privcmd {
    file: File,
    path: PathBuf,
}

impl Privcmd {
    /// Open the privileged-command device at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| ControlPlaneError::Open {
                path: path.clone(),
                source,
            })?;
        debug!("Opened privileged command interface {}", path.display());
        Ok(Self { file, path })
    }

    /// Path the device was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Issue one hypercall.  Buffers named by `args` must already be pinned.
    fn hypercall(&self, op: u64, args: [u64; 5]) -> io::Result<i64> {
        let mut call = PrivcmdHypercall { op, arg: args };
        // SAFETY: `call` is a valid `privcmd_hypercall` for the duration of
        // the ioctl; the kernel does not retain the pointer.
        let rc = unsafe {
            libc::ioctl(
                self.file.as_raw_fd(),
                IOCTL_PRIVCMD_HYPERCALL as libc::c_ulong,
                &mut call as *mut PrivcmdHypercall,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(i64::from(rc))
    }

    /// Run a control operation, pinning the envelope across the call.
    fn dom0_op(&self, op: &mut Dom0Op, name: &'static str, domain: u32) -> Result<()> {
        let pinned = Pinned::new(std::slice::from_mut(op)).map_err(|source| {
            ControlPlaneError::Pin {
                what: "control operation",
                source,
            }
        })?;
        self.hypercall(HYPERVISOR_DOM0_OP, [pinned.addr(), 0, 0, 0, 0])
            .map_err(|source| ControlPlaneError::Call {
                op: name,
                domain,
                source,
            })?;
        Ok(())
    }
}

impl ControlPlane for Privcmd {
    fn domain_pages(&mut self, domain: u32) -> Result<u64> {
        let mut op = Dom0Op::get_domain_info(domain);
        self.dom0_op(&mut op, "GETDOMAININFO", domain)?;
        Ok(op.domain_info().tot_pages)
    }

    fn frame_list(&mut self, domain: u32, frames: &mut [u64]) -> Result<u64> {
        let pinned = Pinned::new(frames).map_err(|source| ControlPlaneError::Pin {
            what: "pfn list",
            source,
        })?;
        let mut op = Dom0Op::get_mem_list(domain, pinned.len() as u64, pinned.addr());
        self.dom0_op(&mut op, "GETMEMLIST", domain)?;
        drop(pinned);
        Ok(op.mem_list().num_pfns)
    }

    fn submit_updates(&mut self, requests: &mut [PageUpdateRequest]) -> Result<()> {
        let count = requests.len();
        let pinned = Pinned::new(requests).map_err(|source| ControlPlaneError::Pin {
            what: "pagetable update array",
            source,
        })?;
        self.hypercall(HYPERVISOR_PT_UPDATE, [pinned.addr(), count as u64, 0, 0, 0])
            .map_err(|source| ControlPlaneError::UpdatesRejected { count, source })?;
        Ok(())
    }

    fn start_domain(&mut self, launch: &DomainLaunch) -> Result<()> {
        let mut op = Dom0Op::build_domain(launch);
        self.dom0_op(&mut op, "BUILDDOMAIN", launch.domain)
    }
}
