//! Xeno domain builder: the control-domain side of guest construction.
//!
//! Given an empty domain the hypervisor has already created, the builder
//! loads a kernel (and optionally an initrd) into the domain's machine
//! frames, lays out a two-level page table mapping every frame from the
//! kernel's load address, asks the hypervisor to install those tables,
//! and finally starts the domain.
//!
//! # Architecture
//!
//! - [`image`]: kernel header parsing and image size checks
//! - [`control`]: the privileged call interface ([`control::ControlPlane`])
//! - [`inventory`]: domain size and frame list queries
//! - [`frames`]: one-at-a-time mapping of machine frames
//! - [`layout`]: pure table geometry and page budgeting
//! - [`builder`]: image loading and page-table request generation
//! - [`submit`]: batch ordering checks and submission
//! - [`launch`]: guest command line and launch descriptor
//! - [`domain`]: the end-to-end build

pub mod builder;
pub mod config;
pub mod control;
pub mod domain;
pub mod error;
pub mod frames;
pub mod image;
pub mod inventory;
pub mod launch;
pub mod layout;
pub mod pinned;
pub mod submit;

#[cfg(test)]
mod testing;
