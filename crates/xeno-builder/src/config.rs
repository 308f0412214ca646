//! Build configuration and the per-domain build request.

use std::path::PathBuf;

use crate::error::ConfigError;

/// Default path of the privileged-command device.
pub const DEFAULT_PRIVCMD_PATH: &str = "/proc/xeno/privcmd";

/// Default path of the physical-memory device.
pub const DEFAULT_MEM_DEVICE_PATH: &str = "/dev/mem";

/// Boot parameter prefix naming an initial ramdisk.
pub const INITRD_PARAM: &str = "initrd=";

/// Where the builder finds its devices and writes its report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildConfig {
    pub privcmd_path: PathBuf,
    pub mem_device_path: PathBuf,
    /// Write the final guest layout as JSON here.
    pub layout_json: Option<PathBuf>,
}

impl Default for BuildConfig {
    fn default() -> Self {
        Self {
            privcmd_path: PathBuf::from(DEFAULT_PRIVCMD_PATH),
            mem_device_path: PathBuf::from(DEFAULT_MEM_DEVICE_PATH),
            layout_json: None,
        }
    }
}

/// One domain to build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DomainRequest {
    pub domain: u32,
    pub kernel: PathBuf,
    pub initrd: Option<PathBuf>,
    pub num_vifs: u32,
    /// Words of the guest command line, in order.
    pub boot_params: Vec<String>,
}

impl DomainRequest {
    /// Build a request from command-line words.
    ///
    /// A leading `initrd=<path>` names the ramdisk and is not passed to the
    /// guest; everything else becomes the guest command line.
    pub fn new(domain: u32, kernel: PathBuf, num_vifs: u32, mut params: Vec<String>) -> Self {
        let initrd = params
            .first()
            .and_then(|p| p.strip_prefix(INITRD_PARAM))
            .map(PathBuf::from);
        if initrd.is_some() {
            params.remove(0);
        }
        Self {
            domain,
            kernel,
            initrd,
            num_vifs,
            boot_params: params,
        }
    }

    /// Reject requests the builder must never act on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain == 0 {
            return Err(ConfigError::ReservedDomain);
        }
        Ok(())
    }
}
