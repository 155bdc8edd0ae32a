//! Controller capability probes and adjacent stack hooks consumed by the
//! advertising manager.

use crate::address::RawAddress;

/// Read-only view of controller state and feature bits.
pub trait ControllerInterface: Send {
    /// The controller's public device address.
    fn read_local_addr(&self) -> RawAddress;

    /// Whether periodic advertising ADI (AdvDataInfo) is supported.
    fn supports_ble_periodic_advertising_adi(&self) -> bool;

    /// Whether the controller can act as an isochronous broadcaster.
    fn supports_ble_iso_broadcaster(&self) -> bool;

    /// Whether LE local privacy (RPA use for own address) is enabled.
    fn le_local_privacy_enabled(&self) -> bool;
}

/// Receives own-address refreshes for connections formed from an advertising
/// set, so the ACL layer resolves the peer against the address actually used
/// on air.
pub trait AclAddressTracker: Send {
    fn update_conn_addr(&self, conn_handle: u16, address: RawAddress);
}
