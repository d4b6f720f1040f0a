//! Provisioning step actions.
//!
//! Each action talks to the collaborators on the context and hands data to
//! later steps through the context's data bag under the keys below.

mod bios;
mod commission;
mod discover;
mod finalize;
mod firmware;
mod ipmi;

pub use bios::{BiosEditStep, BiosPullStep, BiosPushStep};
pub use commission::CommissionStep;
pub use discover::DiscoverStep;
pub use finalize::FinalizeStep;
pub use firmware::FirmwareUpdateStep;
pub use ipmi::IpmiConfigureStep;

pub use crate::engine::context::IP_ADDRESS_KEY;

/// Machine record returned by the commissioning service.
pub const MACHINE_KEY: &str = "machine";
pub const SERIAL_KEY: &str = "serial";
/// BIOS attributes read by `bios_pull`.
pub const BIOS_CURRENT_KEY: &str = "bios_current";
/// BIOS attributes `bios_edit` decided to change.
pub const BIOS_CHANGES_KEY: &str = "bios_changes";
pub const FIRMWARE_UPDATED_KEY: &str = "firmware_updated";
pub const BMC_APPLIED_KEY: &str = "bmc_applied";
