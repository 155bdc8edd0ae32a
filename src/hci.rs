//! Asynchronous gateway to the controller's LE extended advertising commands.
//!
//! Every method issues one HCI command and hands the Command Complete status
//! to the supplied continuation. Implementations must serialize commands per
//! advertising handle and must never invoke a continuation or the callbacks
//! dispatcher synchronously from within a command call; completions are
//! delivered later, from the transport context.

use std::sync::{Arc, Mutex};

use num_derive::{FromPrimitive, ToPrimitive};
use num_traits::ToPrimitive;

use crate::address::RawAddress;
use crate::fragment::DataOperation;

// Host-visible multi-advertising status codes.
pub const MULTI_ADV_SUCCESS: u8 = 0x00;
pub const MULTI_ADV_FAILURE: u8 = 0x01;
pub const ADVERTISE_FAILED_TOO_MANY_ADVERTISERS: u8 = 0x02;
pub const ADVERTISE_FAILED_FEATURE_UNSUPPORTED: u8 = 0x05;

// HCI error codes surfaced by the controller.
pub const HCI_ERR_ILLEGAL_COMMAND: u8 = 0x01;
pub const HCI_ERR_CONN_CAUSE_LOCAL_HOST: u8 = 0x16;
pub const HCI_ERR_ADVERTISING_TIMEOUT: u8 = 0x3C;
pub const HCI_ERR_LIMIT_REACHED: u8 = 0x43;

pub const INVALID_BIG_HANDLE: u8 = 0xFF;

/// Advertising handle that is never assigned to a live set.
pub const INVALID_ADV_HANDLE: u8 = 0xFF;

/// Completion carrying only a status byte.
pub type MultiAdvCb = Box<dyn FnOnce(u8) + Send>;
/// Completion of instance registration: `(inst_id, status)`.
pub type RegisterCb = Box<dyn FnOnce(u8, u8) + Send>;
/// Completion of a full set start: `(inst_id, tx_power, status)`.
pub type IdTxPowerStatusCb = Box<dyn FnOnce(u8, i8, u8) + Send>;
/// Completion of a parameters update: `(status, selected_tx_power)`.
pub type ParametersCb = Box<dyn FnOnce(u8, i8) + Send>;
/// Result of an own-address query: `(address_type, address)`.
pub type GetAddressCb = Box<dyn FnOnce(u8, RawAddress) + Send>;
/// BIG creation result: `(adv_inst_id, status, big_handle, data)`.
pub type CreateBigCb = Box<dyn FnOnce(u8, u8, u8, CreateBigCompleteData) + Send>;
/// BIG termination result: `(status, adv_inst_id, big_handle, reason)`.
pub type TerminateBigCb = Box<dyn FnOnce(u8, u8, u8, u8) + Send>;

/// Advertising PHYs selectable for the primary and secondary channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromPrimitive, ToPrimitive, Default)]
#[repr(i32)]
pub enum LePhy {
    Invalid = 0,
    #[default]
    Phy1m = 1,
    Phy2m = 2,
    PhyCoded = 3,
}

impl From<LePhy> for u8 {
    fn from(phy: LePhy) -> Self {
        phy.to_u8().unwrap_or(1)
    }
}

/// Wire-level parameters for LE Set Extended Advertising Parameters.
#[derive(Debug, Clone, Default)]
pub struct AdvertiseParameters {
    /// Bit 0 = connectable, bit 1 = scannable, bits 2-3 = directed,
    /// bit 4 = legacy PDUs, bit 5 = anonymous, bit 6 = include TX power.
    pub advertising_event_properties: u16,
    /// Minimum advertising interval, in 0.625 ms units.
    pub min_interval: u32,
    /// Maximum advertising interval, in 0.625 ms units.
    pub max_interval: u32,
    pub channel_map: u8,
    /// Requested own address type; negative means the stack decides.
    pub own_address_type: i8,
    pub adv_filter_policy: u8,
    pub tx_power: i8,
    pub primary_advertising_phy: u8,
    pub secondary_advertising_phy: u8,
    pub scan_request_notification_enable: u8,
}

/// Wire-level parameters for LE Set Periodic Advertising Parameters.
#[derive(Debug, Clone, Default)]
pub struct PeriodicAdvertisingParameters {
    pub enable: bool,
    pub include_adi: bool,
    /// Minimum periodic interval, in 1.25 ms units.
    pub min_interval: u16,
    /// Maximum periodic interval, in 1.25 ms units.
    pub max_interval: u16,
    pub periodic_advertising_properties: u16,
}

/// One entry of the batched LE Set Extended Advertising Enable command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetEnableData {
    pub handle: u8,
    /// Enable duration, in 10 ms units; 0 means unbounded.
    pub duration: u16,
    pub max_ext_adv_events: u8,
}

/// Parameters for LE Create BIG.
#[derive(Debug, Clone, Default)]
pub struct CreateBigParams {
    pub num_bis: u8,
    /// SDU interval in microseconds.
    pub sdu_int: u32,
    pub max_sdu: u16,
    pub max_transport_latency: u16,
    pub rtn: u8,
    pub phy: u8,
    pub packing: u8,
    pub framing: u8,
    pub encryption: bool,
    pub broadcast_code: [u8; 16],
}

/// Controller-reported outcome of LE Create BIG.
#[derive(Debug, Clone, Default)]
pub struct CreateBigCompleteData {
    pub big_sync_delay: u32,
    pub transport_latency_big: u32,
    pub phy: u8,
    pub nse: u8,
    pub bn: u8,
    pub pto: u8,
    pub irc: u8,
    pub max_pdu: u16,
    pub iso_interval: u16,
    pub num_bis: u8,
    pub conn_handle_list: Vec<u16>,
}

/// Unsolicited advertising events delivered upward from the controller.
#[derive(Debug)]
pub enum AdvertisingCallbacks {
    AdvertisingSetTerminated {
        status: u8,
        advertising_handle: u8,
        connection_handle: u16,
        num_completed_extended_adv_events: u8,
    },
    CreateBigComplete {
        status: u8,
        big_handle: u8,
        data: CreateBigCompleteData,
    },
    TerminateBigComplete {
        status: u8,
        big_handle: u8,
        cmd_status: bool,
        reason: u8,
    },
}

/// Routes unsolicited advertising events into the owning stack.
pub struct AdvertisingCallbacksDispatcher {
    pub dispatch: Box<dyn Fn(AdvertisingCallbacks) + Send>,
}

/// One method per LE advertising HCI opcode used by the manager.
///
/// Data-carrying commands take the fragment operation selected by the caller;
/// implementations append the controller fragment preference (0x01, "do not
/// fragment further") on the wire.
pub trait AdvertiserHciInterface: Send {
    /// LE Read Number of Supported Advertising Sets.
    fn read_instance_count(&mut self, cb: Box<dyn FnOnce(u8) + Send>);

    /// LE Set Extended Advertising Parameters. `own_address_type` and the
    /// addresses are the resolved values, not the caller's request.
    fn set_parameters(
        &mut self,
        handle: u8,
        params: &AdvertiseParameters,
        own_address_type: u8,
        own_address: RawAddress,
        peer_address: RawAddress,
        sid: u8,
        cb: ParametersCb,
    );

    /// LE Set Advertising Set Random Address.
    fn set_random_address(&mut self, handle: u8, addr: RawAddress, cb: MultiAdvCb);

    /// LE Set Extended Advertising Data (one fragment).
    fn set_advertising_data(
        &mut self,
        handle: u8,
        operation: DataOperation,
        data: &[u8],
        cb: MultiAdvCb,
    );

    /// LE Set Extended Scan Response Data (one fragment).
    fn set_scan_response_data(
        &mut self,
        handle: u8,
        operation: DataOperation,
        data: &[u8],
        cb: MultiAdvCb,
    );

    /// LE Set Periodic Advertising Parameters.
    fn set_periodic_advertising_parameters(
        &mut self,
        handle: u8,
        min_interval: u16,
        max_interval: u16,
        properties: u16,
        cb: MultiAdvCb,
    );

    /// LE Set Periodic Advertising Data (one fragment).
    fn set_periodic_advertising_data(
        &mut self,
        handle: u8,
        operation: DataOperation,
        data: &[u8],
        cb: MultiAdvCb,
    );

    /// LE Set Periodic Advertising Enable. `enable` is the raw wire value
    /// (bit 0 = enable, bit 1 = include ADI).
    fn set_periodic_advertising_enable(&mut self, enable: u8, handle: u8, cb: MultiAdvCb);

    /// LE Set Extended Advertising Enable for a single set.
    fn enable(
        &mut self,
        enable: bool,
        handle: u8,
        duration: u16,
        max_ext_adv_events: u8,
        cb: MultiAdvCb,
    );

    /// LE Set Extended Advertising Enable carrying multiple sets atomically.
    fn enable_sets(&mut self, enable: bool, sets: Vec<SetEnableData>, cb: MultiAdvCb);

    /// LE Remove Advertising Set.
    fn remove_advertising_set(&mut self, handle: u8, cb: MultiAdvCb);

    /// LE Rand; yields 8 controller-generated random bytes.
    fn le_rand(&mut self, cb: Box<dyn FnOnce([u8; 8]) + Send>);

    /// LE Create BIG. Completion arrives as `CreateBigComplete`.
    fn create_big(&mut self, big_handle: u8, adv_handle: u8, params: &CreateBigParams);

    /// LE Terminate BIG. Completion arrives as `TerminateBigComplete`.
    fn terminate_big(&mut self, big_handle: u8, reason: u8);

    /// Registers the sink for unsolicited advertising events.
    fn set_callbacks_dispatcher(&mut self, dispatcher: AdvertisingCallbacksDispatcher);
}

/// Shared handle to the HCI interface; held separately from the manager lock
/// so data senders and timers can reach the controller without it.
pub type SharedHci = Arc<Mutex<Box<dyn AdvertiserHciInterface>>>;

pub fn new_shared_hci(hci: Box<dyn AdvertiserHciInterface>) -> SharedHci {
    Arc::new(Mutex::new(hci))
}
