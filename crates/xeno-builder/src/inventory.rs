//! Frame inventory of a domain: how many pages it owns and which frames.

use log::info;

use crate::control::ControlPlane;
use crate::error::{ControlPlaneError, Result};
use crate::layout::Mfn;

/// Total pages owned by `domain`.
///
/// A domain reporting zero pages cannot be built and is treated as a
/// failed query.
pub fn total_pages(control: &mut impl ControlPlane, domain: u32) -> Result<u64> {
    let pages = control.domain_pages(domain)?;
    if pages == 0 {
        return Err(ControlPlaneError::EmptyDomain { domain }.into());
    }
    info!(
        "Domain {} owns {} pages ({} KiB)",
        domain,
        pages,
        pages.saturating_mul(xeno_abi::PAGE_SIZE / 1024)
    );
    Ok(pages)
}

/// The ordered machine frames of `domain`, at most `max_frames` of them.
///
/// The hypervisor must report exactly `max_frames` frames; a short list
/// means the domain is inconsistent and the build aborts.
pub fn frame_list(
    control: &mut impl ControlPlane,
    domain: u32,
    max_frames: u64,
) -> Result<Vec<Mfn>> {
    let mut raw = vec![0u64; max_frames as usize];
    let got = control.frame_list(domain, &mut raw)?;
    if got != max_frames {
        return Err(ControlPlaneError::ShortFrameList {
            got,
            expected: max_frames,
        }
        .into());
    }
    info!("Received frame list for domain {}: {} frames", domain, got);
    Ok(raw.into_iter().map(Mfn).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BuildError;
    use crate::testing::FakeControlPlane;

    #[test]
    fn total_pages_passes_through_domain_info() {
        let mut control = FakeControlPlane::new(5, vec![10, 11, 12]);
        assert_eq!(total_pages(&mut control, 5).unwrap(), 3);
    }

    #[test]
    fn unknown_domain_is_control_plane_error() {
        let mut control = FakeControlPlane::new(5, vec![10, 11, 12]);
        let err = total_pages(&mut control, 6).unwrap_err();
        assert!(matches!(err, BuildError::ControlPlane(ControlPlaneError::Call { .. })));
    }

    #[test]
    fn empty_domain_is_rejected() {
        let mut control = FakeControlPlane::new(5, vec![]);
        let err = total_pages(&mut control, 5).unwrap_err();
        assert!(matches!(
            err,
            BuildError::ControlPlane(ControlPlaneError::EmptyDomain { domain: 5 })
        ));
    }

    #[test]
    fn frame_list_preserves_hypervisor_order() {
        let mut control = FakeControlPlane::new(5, vec![0x900, 0x100, 0x500]);
        let frames = frame_list(&mut control, 5, 3).unwrap();
        assert_eq!(frames, vec![Mfn(0x900), Mfn(0x100), Mfn(0x500)]);
    }

    #[test]
    fn short_frame_list_aborts() {
        let mut control = FakeControlPlane::new(5, vec![1, 2, 3, 4]);
        control.short_frame_list = Some(2);
        let err = frame_list(&mut control, 5, 4).unwrap_err();
        assert!(matches!(
            err,
            BuildError::ControlPlane(ControlPlaneError::ShortFrameList {
                got: 2,
                expected: 4
            })
        ));
    }
}
