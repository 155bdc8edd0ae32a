//! Host-side BLE multi-advertising manager.
//!
//! `btadv` drives the LE extended advertising feature set of a Bluetooth
//! controller over its HCI command interface: multiple concurrent
//! advertising sets, periodic advertising, payload fragmentation, Encrypted
//! Advertising Data (AES-128-CCM), resolvable-private-address rotation and
//! Broadcast Isochronous Groups.
//!
//! The controller transport, feature probes, key material and ACL hooks are
//! injected as traits; see [`advertiser::AdvertiseManager`] for the entry
//! point and the `mocks` module for the test doubles.

pub mod address;
pub mod adv_data;
pub mod advertiser;
pub mod alarm;
pub mod controller;
pub mod enc_data;
pub mod fragment;
pub mod hci;
pub mod logging;
pub mod mocks;
pub mod uuid;

pub use address::RawAddress;
pub use advertiser::{AdvManagerConfig, AdvertiseManager};
