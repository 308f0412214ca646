//! Guest command line and the final launch descriptor.

use std::fmt;

use xeno_abi::{DomainLaunch, MAX_CMD_LEN};

use crate::builder::GuestLayout;
use crate::error::ConfigError;

/// A NUL-terminated guest command line of at most `MAX_CMD_LEN` bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct CommandLine {
    bytes: [u8; MAX_CMD_LEN],
    len: usize,
}

impl CommandLine {
    /// Longest command line, excluding the terminator.
    pub const MAX_LEN: usize = MAX_CMD_LEN - 1;

    pub const fn empty() -> Self {
        Self {
            bytes: [0; MAX_CMD_LEN],
            len: 0,
        }
    }

    /// Join `params`, each followed by a single space.
    ///
    /// Composition stops at the first parameter that would not fit; the
    /// parameters before it are kept.  The overflow is returned alongside
    /// the truncated line so the caller can report it without aborting.
    pub fn compose<S: AsRef<str>>(params: &[S]) -> (Self, Option<ConfigError>) {
        let mut line = Self::empty();
        for param in params {
            let param = param.as_ref().as_bytes();
            let needed = line.len + param.len() + 1;
            if needed > Self::MAX_LEN {
                let overflow = ConfigError::CmdlineTooLong {
                    needed,
                    max: Self::MAX_LEN,
                };
                return (line, Some(overflow));
            }
            line.bytes[line.len..line.len + param.len()].copy_from_slice(param);
            line.bytes[line.len + param.len()] = b' ';
            line.len = needed;
        }
        (line, None)
    }

    /// The line without its terminator.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The fixed-size, NUL-padded form carried in the launch descriptor.
    pub fn to_array(&self) -> [u8; MAX_CMD_LEN] {
        self.bytes
    }
}

impl Default for CommandLine {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CommandLine")
            .field(&String::from_utf8_lossy(self.as_bytes()))
            .finish()
    }
}

/// Launch descriptor for `domain` started from `layout`.
pub fn launch_descriptor(
    domain: u32,
    layout: &GuestLayout,
    num_vifs: u32,
    cmd_line: &CommandLine,
) -> DomainLaunch {
    let (virt_mod_addr, virt_mod_len) = layout.module.map_or((0, 0), |m| (m.addr, m.len));
    DomainLaunch {
        domain,
        l2_pgt_addr: layout.root_table,
        virt_load_addr: layout.load_addr,
        virt_shinfo_addr: layout.shared_info_addr,
        virt_startinfo_addr: layout.start_info_addr,
        num_vifs,
        cmd_line: cmd_line.to_array(),
        virt_mod_addr,
        virt_mod_len,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::ModuleRegion;
    use crate::layout::TablePlan;

    #[test]
    fn params_are_joined_with_trailing_spaces() {
        let (line, overflow) = CommandLine::compose(&["root=/dev/ram0", "quiet"]);
        assert!(overflow.is_none());
        assert_eq!(line.as_bytes(), b"root=/dev/ram0 quiet ");
        assert_eq!(line.to_array()[line.len()], 0);
    }

    #[test]
    fn no_params_is_empty_line() {
        let (line, overflow) = CommandLine::compose::<&str>(&[]);
        assert!(overflow.is_none());
        assert!(line.is_empty());
        assert_eq!(line.to_array(), [0u8; MAX_CMD_LEN]);
    }

    #[test]
    fn exactly_full_line_fits() {
        // 254 bytes + space = 255, leaving room for the terminator.
        let param = "x".repeat(254);
        let (line, overflow) = CommandLine::compose(&[param.as_str()]);
        assert!(overflow.is_none());
        assert_eq!(line.len(), CommandLine::MAX_LEN);
    }

    #[test]
    fn overflow_keeps_the_prefix_and_reports() {
        let long = "y".repeat(250);
        let (line, overflow) = CommandLine::compose(&["console=hvc0", long.as_str(), "quiet"]);
        assert_eq!(line.as_bytes(), b"console=hvc0 ");
        assert_eq!(
            overflow,
            Some(ConfigError::CmdlineTooLong {
                needed: 13 + 251,
                max: 255
            })
        );
    }

    #[test]
    fn descriptor_carries_layout_and_module() {
        let plan = TablePlan::new(0xC000_0000, 16).unwrap();
        let layout = GuestLayout {
            root_table: 0x7_F000,
            load_addr: 0xC000_0000,
            shared_info_addr: 0xC001_0000,
            start_info_addr: 0xC000_C000,
            module: Some(ModuleRegion {
                addr: 0xC000_2000,
                len: 300,
            }),
            plan,
        };
        let (line, _) = CommandLine::compose(&["quiet"]);
        let launch = launch_descriptor(4, &layout, 2, &line);

        assert_eq!(launch.domain, 4);
        assert_eq!(launch.l2_pgt_addr, 0x7_F000);
        assert_eq!(launch.virt_load_addr, 0xC000_0000);
        assert_eq!(launch.virt_shinfo_addr, 0xC001_0000);
        assert_eq!(launch.virt_startinfo_addr, 0xC000_C000);
        assert_eq!(launch.num_vifs, 2);
        assert_eq!(launch.cmd_line_bytes(), b"quiet ");
        assert_eq!((launch.virt_mod_addr, launch.virt_mod_len), (0xC000_2000, 300));
    }

    #[test]
    fn descriptor_without_module_zeroes_module_fields() {
        let plan = TablePlan::new(0xC000_0000, 16).unwrap();
        let layout = GuestLayout {
            root_table: 0,
            load_addr: 0xC000_0000,
            shared_info_addr: 0,
            start_info_addr: 0,
            module: None,
            plan,
        };
        let launch = launch_descriptor(1, &layout, 0, &CommandLine::empty());
        assert_eq!((launch.virt_mod_addr, launch.virt_mod_len), (0, 0));
        assert!(launch.cmd_line_bytes().is_empty());
    }
}
