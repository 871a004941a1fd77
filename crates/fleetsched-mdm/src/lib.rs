//! `fleetsched-mdm`: the remote device-management API as seen by the execution engine.
//!
//! * [`client`]: the [`DeviceManagement`] seam and its bearer-token HTTP implementation.
//! * [`filter`]: interpreter for a job's stored device filter.
//! * [`resolver`]: filter + directory → target devices; never fails.
//! * [`pusher`]: bounded, per-device apply-profile fan-out.

pub mod client;
pub mod error;
pub mod filter;
pub mod pusher;
pub mod resolver;
pub mod types;

pub use client::{DeviceManagement, HttpDeviceManagement};
pub use error::{FilterError, MdmError, Result};
pub use filter::{DeviceFilter, Predicate};
pub use pusher::{push_profile, push_to_devices};
pub use resolver::{resolve_devices, Resolution};
pub use types::{Device, DeviceOutcome};
