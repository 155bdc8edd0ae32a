//! BLE multi-advertising manager.
//!
//! Coordinates the lifecycle of every extended advertising set on the
//! controller: allocation, parameters, payload loading (with optional
//! AES-CCM sealing), enable/disable with host-side timeout emulation,
//! resolvable-private-address rotation and BIG coordination.
//!
//! Every operation completes through exactly one callback. Callbacks run on
//! the manager's dispatch context and must not call back into the manager
//! synchronously; post to your own executor instead.

use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use lazy_static::lazy_static;
use log::{debug, error, info, warn};
use num_traits::clamp;
use rand::Rng;

use crate::address::{RawAddress, BLE_ADDR_PUBLIC, BLE_ADDR_RANDOM, BLE_ADDR_RANDOM_ID};
use crate::adv_data::{self, has_broadcast_audio_announcement};
use crate::alarm::Alarm;
use crate::controller::{AclAddressTracker, ControllerInterface};
use crate::enc_data::{self, EncKeyMaterialProvider, KeyMaterial, ENC_KEY_MATERIAL_LEN};
use crate::fragment::{divide_and_send_data, DataSender, EXT_ADV_DATA_LEN_MAX, PERIODIC_ADV_DATA_LEN_MAX};
use crate::hci::{
    new_shared_hci, AdvertiserHciInterface, AdvertiseParameters, AdvertisingCallbacks,
    AdvertisingCallbacksDispatcher, CreateBigCb, CreateBigCompleteData, CreateBigParams,
    IdTxPowerStatusCb, GetAddressCb, LePhy, MultiAdvCb, ParametersCb,
    PeriodicAdvertisingParameters, RegisterCb, SetEnableData, SharedHci, TerminateBigCb,
    ADVERTISE_FAILED_FEATURE_UNSUPPORTED, ADVERTISE_FAILED_TOO_MANY_ADVERTISERS,
    HCI_ERR_ADVERTISING_TIMEOUT, HCI_ERR_CONN_CAUSE_LOCAL_HOST, HCI_ERR_ILLEGAL_COMMAND,
    HCI_ERR_LIMIT_REACHED, INVALID_BIG_HANDLE, MULTI_ADV_FAILURE, MULTI_ADV_SUCCESS,
};

/// Repeating callback fired when an advertising timeout elapses.
pub type TimeoutCallback = Arc<dyn Fn(u8) + Send + Sync>;
/// Repeating callback fired with `(inst_id, status)` on set timeout.
pub type IdStatusCallback = Arc<dyn Fn(u8, u8) + Send + Sync>;

// Advertising interval range, in 0.625 ms units.
const INTERVAL_MAX: i32 = 0xff_ffff; // 10485.759375 sec
const INTERVAL_MIN: i32 = 160; // 100 ms
const INTERVAL_DELTA: i32 = 50; // 31.25 ms gap between min and max

// Periodic advertising interval range, in 1.25 ms units.
const PERIODIC_INTERVAL_MAX: i32 = 65519; // 81.89875 sec
const PERIODIC_INTERVAL_MIN: i32 = 80; // 100 ms
const PERIODIC_INTERVAL_DELTA: i32 = 16; // 20 ms gap between min and max

/// Total plain + encrypted payload the controller can store per set.
const ADV_DATA_TOTAL_LEN_MAX: usize = 1650;

/// Rotations suppressed between two RPA updates of a broadcast-audio set.
const BROADCAST_SKIP_RPA_COUNT: u8 = 15;

fn is_connectable(advertising_event_properties: u16) -> bool {
    advertising_event_properties & 0x01 != 0
}

fn is_directed(advertising_event_properties: u16) -> bool {
    advertising_event_properties & 0x0C != 0
}

/// Randomized interval between two RPA rotations of one set.
fn next_private_address_interval() -> Duration {
    Duration::from_millis(rand::thread_rng().gen_range(7 * 60 * 1000..15 * 60 * 1000))
}

/// Runs a deferred callback on the async runtime, off the manager lock.
fn post<F: FnOnce() + Send + 'static>(task: F) {
    tokio::spawn(async move { task() });
}

fn noop_timeout() -> TimeoutCallback {
    Arc::new(|_| {})
}

/// High-level parameters for one BLE advertising set.
#[derive(Debug, Default, Clone)]
pub struct AdvertisingSetParameters {
    /// Whether the advertisement will be connectable.
    pub connectable: bool,
    /// Whether the advertisement will be scannable.
    pub scannable: bool,
    /// Whether legacy advertising PDUs will be used.
    pub is_legacy: bool,
    /// Whether the advertisement will be anonymous.
    pub is_anonymous: bool,
    /// Whether the TX power will be included.
    pub include_tx_power: bool,
    pub primary_phy: LePhy,
    pub secondary_phy: LePhy,
    /// The advertising interval, in 0.625 ms units. The valid range is from
    /// 160 (100 ms) to 16777215 (10485.759375 sec).
    pub interval: i32,
    /// Transmission power in dBm. The valid range is [-127, 1].
    pub tx_power_level: i32,
    /// Own address type; negative lets the stack decide.
    pub own_address_type: i32,
}

impl From<AdvertisingSetParameters> for AdvertiseParameters {
    fn from(params: AdvertisingSetParameters) -> Self {
        let mut props: u16 = 0;
        if params.connectable {
            props |= 0x01;
        }
        if params.scannable {
            props |= 0x02;
        }
        if params.is_legacy {
            props |= 0x10;
        }
        if params.is_anonymous {
            props |= 0x20;
        }
        if params.include_tx_power {
            props |= 0x40;
        }

        let interval = clamp(params.interval, INTERVAL_MIN, INTERVAL_MAX - INTERVAL_DELTA);

        AdvertiseParameters {
            advertising_event_properties: props,
            min_interval: interval as u32,
            max_interval: (interval + INTERVAL_DELTA) as u32,
            channel_map: 0x07, // all channels
            own_address_type: params.own_address_type as i8,
            adv_filter_policy: 0x00,
            tx_power: params.tx_power_level as i8,
            primary_advertising_phy: params.primary_phy.into(),
            secondary_advertising_phy: params.secondary_phy.into(),
            scan_request_notification_enable: 0,
        }
    }
}

/// High-level parameters of the periodic advertising train of a set.
#[derive(Debug, Default, Clone)]
pub struct PeriodicAdvertisingSetParameters {
    /// Whether the TX power will be included.
    pub include_tx_power: bool,
    /// Periodic advertising interval in 1.25 ms units. Valid values are from
    /// 80 (100 ms) to 65519 (81.89875 sec).
    pub interval: i32,
}

impl From<PeriodicAdvertisingSetParameters> for PeriodicAdvertisingParameters {
    fn from(params: PeriodicAdvertisingSetParameters) -> Self {
        let mut p = PeriodicAdvertisingParameters::default();

        let interval = clamp(
            params.interval,
            PERIODIC_INTERVAL_MIN,
            PERIODIC_INTERVAL_MAX - PERIODIC_INTERVAL_DELTA,
        );

        p.enable = true;
        p.include_adi = false;
        p.min_interval = interval as u16;
        p.max_interval = p.min_interval + (PERIODIC_INTERVAL_DELTA as u16);
        if params.include_tx_power {
            p.periodic_advertising_properties |= 0x40;
        }

        p
    }
}

/// Runtime configuration flags of the advertising manager.
#[derive(Debug, Default, Clone)]
pub struct AdvManagerConfig {
    /// Whether the encrypted advertising data feature may be used.
    pub enc_adv_data_enabled: bool,
    /// Whether RPA generation is offloaded to the controller.
    pub rpa_gen_offload_enabled: bool,
    /// Whether key material and payload hex dumps are logged.
    pub enc_adv_data_log_enabled: bool,
}

// State of one hardware advertising set.
struct AdvertisingInstance {
    inst_id: u8,
    in_use: bool,
    advertising_event_properties: u16,
    adv_raddr_timer: Alarm,
    tx_power: i8,
    /// Advertising duration, in 10 ms units; 0 means unbounded.
    duration: u16,
    max_ext_adv_events: u8,
    timeout_timer: Option<Alarm>,
    own_address_type: u8,
    own_address: RawAddress,
    timeout_cb: Option<TimeoutCallback>,
    /// Set when a rotation was skipped because the set runs with a timeout;
    /// the address is refreshed on the next enable instead.
    address_update_required: bool,
    periodic_enabled: bool,
    /// In 0.625 ms units.
    advertising_interval: u32,
    skip_rpa_count: u8,
    skip_rpa: bool,
    /// Last generated encrypted-data randomizer, stored byte-reversed
    /// relative to the controller's LE Rand output.
    randomizer: [u8; 5],
    advertise_data: Vec<u8>,
    scan_response_data: Vec<u8>,
    periodic_data: Vec<u8>,
    advertise_data_enc: Vec<u8>,
    scan_response_data_enc: Vec<u8>,
    periodic_adv_data_enc: Vec<u8>,
    /// Empty, or exactly 24 bytes of user-supplied session key ‖ IV.
    enc_key_value: Vec<u8>,
    /// Reflects the last scheduled enable/disable intent; it may precede the
    /// controller's confirmation. Commands scheduled while true execute with
    /// the set enabled, unless enabling fails.
    enable_status: bool,
    enable_time: Instant,
    big_handle: u8,
}

impl AdvertisingInstance {
    fn new(inst_id: u8) -> Self {
        AdvertisingInstance {
            inst_id,
            in_use: false,
            advertising_event_properties: 0,
            adv_raddr_timer: Alarm::new(),
            tx_power: 0,
            duration: 0,
            max_ext_adv_events: 0,
            timeout_timer: None,
            own_address_type: BLE_ADDR_PUBLIC,
            own_address: RawAddress::empty(),
            timeout_cb: None,
            address_update_required: false,
            periodic_enabled: false,
            advertising_interval: 0,
            skip_rpa_count: 0,
            skip_rpa: false,
            randomizer: [0; 5],
            advertise_data: Vec::new(),
            scan_response_data: Vec::new(),
            periodic_data: Vec::new(),
            advertise_data_enc: Vec::new(),
            scan_response_data_enc: Vec::new(),
            periodic_adv_data_enc: Vec::new(),
            enc_key_value: Vec::new(),
            enable_status: false,
            enable_time: Instant::now(),
            big_handle: INVALID_BIG_HANDLE,
        }
    }

    fn is_connectable(&self) -> bool {
        is_connectable(self.advertising_event_properties)
    }

    fn has_encrypted_payload(&self) -> bool {
        !self.advertise_data_enc.is_empty()
            || !self.scan_response_data_enc.is_empty()
            || !self.periodic_adv_data_enc.is_empty()
    }
}

// State of one Broadcast Isochronous Group slot.
struct IsoBigInstance {
    big_handle: u8,
    in_use: bool,
    bis_handles: Vec<u16>,
    adv_inst_id: u8,
    created: bool,
    create_cb: Option<CreateBigCb>,
    terminate_cb: Option<TerminateBigCb>,
}

impl IsoBigInstance {
    fn new(big_handle: u8) -> Self {
        IsoBigInstance {
            big_handle,
            in_use: false,
            bis_handles: Vec::new(),
            adv_inst_id: 0,
            created: false,
            create_cb: None,
            terminate_cb: None,
        }
    }
}

// All the data carried through the start_advertising_set chain.
struct CreatorParams {
    inst_id: u8,
    cb: IdTxPowerStatusCb,
    scan_response_data: Vec<u8>,
    scan_response_data_enc: Vec<u8>,
    periodic_params: PeriodicAdvertisingParameters,
    periodic_data: Vec<u8>,
    periodic_adv_data_enc: Vec<u8>,
    duration: u16,
    max_ext_adv_events: u8,
    timeout_cb: IdStatusCallback,
}

struct AdvertiseManagerImpl {
    hci: SharedHci,
    controller: Box<dyn ControllerInterface>,
    key_provider: Box<dyn EncKeyMaterialProvider>,
    acl_tracker: Box<dyn AclAddressTracker>,
    config: AdvManagerConfig,
    adv_inst: Vec<AdvertisingInstance>,
    iso_big_inst: Vec<IsoBigInstance>,
    inst_count: u8,
    weak_self: Weak<Mutex<AdvertiseManagerImpl>>,
}

impl AdvertiseManagerImpl {
    fn on_instance_count_read(&mut self, instance_count: u8) {
        debug!("controller supports {} advertising sets", instance_count);
        self.inst_count = instance_count;
        self.adv_inst = (0..instance_count).map(AdvertisingInstance::new).collect();
        self.iso_big_inst = (0..instance_count).map(IsoBigInstance::new).collect();
    }

    fn valid_instance(&self, inst_id: u8) -> bool {
        (inst_id as usize) < self.adv_inst.len() && self.adv_inst[inst_id as usize].in_use
    }

    // Scans for the first free slot, binds the address type and, for host
    // generated random addresses, creates the RPA and its rotation timer.
    fn allocate_instance(&mut self, own_address_type: u8) -> Option<u8> {
        let idx = self.adv_inst.iter().position(|inst| !inst.in_use)?;
        let inst_id = idx as u8;
        self.adv_inst[idx].in_use = true;
        self.adv_inst[idx].own_address_type = own_address_type;

        if own_address_type != BLE_ADDR_PUBLIC {
            if !self.config.rpa_gen_offload_enabled {
                self.adv_inst[idx].own_address = RawAddress::random_resolvable();
                let weak = self.weak_self.clone();
                self.adv_inst[idx].adv_raddr_timer.schedule_periodic(
                    next_private_address_interval(),
                    move || {
                        let Some(m) = weak.upgrade() else { return };
                        let mut mgr = m.lock().unwrap();
                        if mgr.valid_instance(inst_id) {
                            mgr.configure_rpa(inst_id, Box::new(|_| {}));
                        }
                    },
                );
            }
        } else {
            self.adv_inst[idx].own_address = self.controller.read_local_addr();
        }
        Some(inst_id)
    }

    fn resolve_own_address_type(&self, requested: i8) -> u8 {
        if requested >= 0 {
            return requested as u8;
        }
        if self.controller.le_local_privacy_enabled() {
            BLE_ADDR_RANDOM
        } else {
            BLE_ADDR_PUBLIC
        }
    }

    pub fn register_advertiser(&mut self, cb: RegisterCb) {
        let own_address_type = self.resolve_own_address_type(-1);
        self.register_advertiser_impl(own_address_type, cb);
    }

    fn register_advertiser_impl(&mut self, own_address_type: u8, cb: RegisterCb) {
        match self.allocate_instance(own_address_type) {
            Some(inst_id) => post(move || cb(inst_id, MULTI_ADV_SUCCESS)),
            None => {
                info!("no free advertiser instance");
                post(move || cb(0xFF, ADVERTISE_FAILED_TOO_MANY_ADVERTISERS));
            }
        }
    }

    pub fn get_own_address(&mut self, inst_id: u8, cb: GetAddressCb) {
        if (inst_id as usize) >= self.adv_inst.len() {
            error!("bad instance id {}", inst_id);
            return;
        }
        let inst = &self.adv_inst[inst_id as usize];
        let (addr_type, addr) = (inst.own_address_type, inst.own_address);
        post(move || cb(addr_type, addr));
    }

    pub fn get_max_adv_instances(&self) -> u8 {
        self.inst_count
    }

    pub fn update_rpa_gen_offload_status(&mut self, enable: bool) {
        self.config.rpa_gen_offload_enabled = enable;
    }

    pub fn is_rpa_gen_offload_enabled(&self) -> bool {
        self.config.rpa_gen_offload_enabled
    }

    pub fn start_advertising(
        &mut self,
        advertiser_id: u8,
        params: AdvertiseParameters,
        advertise_data: Vec<u8>,
        scan_response_data: Vec<u8>,
        duration: u16,
        timeout_cb: TimeoutCallback,
        cb: MultiAdvCb,
    ) {
        let inst_id = advertiser_id;
        let weak = self.weak_self.clone();
        self.set_parameters(
            inst_id,
            &params,
            Box::new(move |status, tx_power| {
                let Some(m) = weak.upgrade() else {
                    info!("stack was shut down");
                    return;
                };
                let mut mgr = m.lock().unwrap();
                if status != 0 {
                    error!("setting parameters failed, status: {}", status);
                    drop(mgr);
                    cb(status);
                    return;
                }
                if !mgr.valid_instance(inst_id) {
                    return;
                }
                mgr.adv_inst[inst_id as usize].tx_power = tx_power;

                let rpa = mgr.adv_inst[inst_id as usize].own_address;
                let weak = mgr.weak_self.clone();
                mgr.hci.lock().unwrap().set_random_address(
                    inst_id,
                    rpa,
                    Box::new(move |status| {
                        let Some(m) = weak.upgrade() else {
                            info!("stack was shut down");
                            return;
                        };
                        let mut mgr = m.lock().unwrap();
                        if status != 0 {
                            error!("setting random address failed, status: {}", status);
                            drop(mgr);
                            cb(status);
                            return;
                        }

                        let weak = mgr.weak_self.clone();
                        mgr.set_data(
                            inst_id,
                            false,
                            advertise_data,
                            Vec::new(),
                            Box::new(move |status| {
                                let Some(m) = weak.upgrade() else {
                                    info!("stack was shut down");
                                    return;
                                };
                                let mut mgr = m.lock().unwrap();
                                if status != 0 {
                                    error!("setting advertise data failed, status: {}", status);
                                    drop(mgr);
                                    cb(status);
                                    return;
                                }

                                let weak = mgr.weak_self.clone();
                                mgr.set_data(
                                    inst_id,
                                    true,
                                    scan_response_data,
                                    Vec::new(),
                                    Box::new(move |status| {
                                        let Some(m) = weak.upgrade() else {
                                            info!("stack was shut down");
                                            return;
                                        };
                                        let mut mgr = m.lock().unwrap();
                                        if status != 0 {
                                            error!(
                                                "setting scan response data failed, status: {}",
                                                status
                                            );
                                            drop(mgr);
                                            cb(status);
                                            return;
                                        }
                                        mgr.enable(inst_id, true, cb, duration, 0, timeout_cb);
                                    }),
                                );
                            }),
                        );
                    }),
                );
            }),
        );
    }

    pub fn start_advertising_set(
        &mut self,
        params: AdvertiseParameters,
        advertise_data: Vec<u8>,
        advertise_data_enc: Vec<u8>,
        scan_response_data: Vec<u8>,
        scan_response_data_enc: Vec<u8>,
        periodic_params: PeriodicAdvertisingParameters,
        periodic_data: Vec<u8>,
        periodic_adv_data_enc: Vec<u8>,
        duration: u16,
        max_ext_adv_events: u8,
        enc_key_value: Vec<u8>,
        timeout_cb: IdStatusCallback,
        cb: IdTxPowerStatusCb,
    ) {
        if (!advertise_data_enc.is_empty()
            || !scan_response_data_enc.is_empty()
            || !periodic_adv_data_enc.is_empty())
            && !self.config.enc_adv_data_enabled
        {
            error!("encrypted advertising data provided but the feature is not enabled");
            post(move || cb(0, 0, ADVERTISE_FAILED_FEATURE_UNSUPPORTED));
            return;
        }
        if !enc_key_value.is_empty() && enc_key_value.len() != ENC_KEY_MATERIAL_LEN {
            error!("encryption key material must be {} bytes", ENC_KEY_MATERIAL_LEN);
            post(move || cb(0, 0, MULTI_ADV_FAILURE));
            return;
        }

        let own_address_type = self.resolve_own_address_type(params.own_address_type);
        let Some(inst_id) = self.allocate_instance(own_address_type) else {
            info!("no free advertiser instance");
            post(move || cb(0, 0, ADVERTISE_FAILED_TOO_MANY_ADVERTISERS));
            return;
        };
        self.adv_inst[inst_id as usize].enc_key_value = enc_key_value;

        let c = Box::new(CreatorParams {
            inst_id,
            cb,
            scan_response_data,
            scan_response_data_enc,
            periodic_params,
            periodic_data,
            periodic_adv_data_enc,
            duration,
            max_ext_adv_events,
            timeout_cb,
        });

        let weak = self.weak_self.clone();
        let rpa_gen_offload = self.config.rpa_gen_offload_enabled;
        self.set_parameters(
            inst_id,
            &params,
            Box::new(move |status, tx_power| {
                let Some(m) = weak.upgrade() else {
                    info!("stack was shut down");
                    return;
                };
                let mut mgr = m.lock().unwrap();
                if status != 0 {
                    mgr.unregister(inst_id);
                    error!("setting parameters failed, status: {}", status);
                    drop(mgr);
                    (c.cb)(0, 0, status);
                    return;
                }
                if !mgr.valid_instance(inst_id) {
                    return;
                }
                mgr.adv_inst[inst_id as usize].tx_power = tx_power;

                if mgr.adv_inst[inst_id as usize].own_address_type == BLE_ADDR_PUBLIC
                    || rpa_gen_offload
                {
                    mgr.start_advertising_set_after_address(c, advertise_data, advertise_data_enc);
                    return;
                }

                let rpa = mgr.adv_inst[inst_id as usize].own_address;
                let weak = mgr.weak_self.clone();
                mgr.hci.lock().unwrap().set_random_address(
                    inst_id,
                    rpa,
                    Box::new(move |status| {
                        let Some(m) = weak.upgrade() else {
                            info!("stack was shut down");
                            return;
                        };
                        let mut mgr = m.lock().unwrap();
                        if status != 0 {
                            mgr.unregister(inst_id);
                            error!("setting random address failed, status: {}", status);
                            drop(mgr);
                            (c.cb)(0, 0, status);
                            return;
                        }
                        mgr.start_advertising_set_after_address(
                            c,
                            advertise_data,
                            advertise_data_enc,
                        );
                    }),
                );
            }),
        );
    }

    fn start_advertising_set_after_address(
        &mut self,
        c: Box<CreatorParams>,
        advertise_data: Vec<u8>,
        advertise_data_enc: Vec<u8>,
    ) {
        let inst_id = c.inst_id;
        let weak = self.weak_self.clone();
        self.set_data(
            inst_id,
            false,
            advertise_data,
            advertise_data_enc,
            Box::new(move |status| {
                let Some(m) = weak.upgrade() else {
                    info!("stack was shut down");
                    return;
                };
                let mut mgr = m.lock().unwrap();
                if status != 0 {
                    mgr.unregister(inst_id);
                    error!("setting advertise data failed, status: {}", status);
                    drop(mgr);
                    (c.cb)(0, 0, status);
                    return;
                }
                if !mgr.valid_instance(inst_id) {
                    return;
                }

                let mut c = c;
                let scan = std::mem::take(&mut c.scan_response_data);
                let scan_enc = std::mem::take(&mut c.scan_response_data_enc);
                let weak = mgr.weak_self.clone();
                mgr.set_data(
                    inst_id,
                    true,
                    scan,
                    scan_enc,
                    Box::new(move |status| {
                        let Some(m) = weak.upgrade() else {
                            info!("stack was shut down");
                            return;
                        };
                        let mut mgr = m.lock().unwrap();
                        if status != 0 {
                            mgr.unregister(inst_id);
                            error!("setting scan response data failed, status: {}", status);
                            drop(mgr);
                            (c.cb)(0, 0, status);
                            return;
                        }
                        if c.periodic_params.enable {
                            mgr.start_advertising_set_periodic(c);
                        } else {
                            mgr.start_advertising_set_finish(c);
                        }
                    }),
                );
            }),
        );
    }

    fn start_advertising_set_periodic(&mut self, c: Box<CreatorParams>) {
        let inst_id = c.inst_id;
        let params = c.periodic_params.clone();
        let weak = self.weak_self.clone();
        self.set_periodic_advertising_parameters(
            inst_id,
            &params,
            Box::new(move |status| {
                let Some(m) = weak.upgrade() else {
                    info!("stack was shut down");
                    return;
                };
                let mut mgr = m.lock().unwrap();
                if status != 0 {
                    mgr.unregister(inst_id);
                    error!("setting periodic parameters failed, status: {}", status);
                    drop(mgr);
                    (c.cb)(0, 0, status);
                    return;
                }

                let mut c = c;
                let periodic_data = std::mem::take(&mut c.periodic_data);
                let periodic_enc = std::mem::take(&mut c.periodic_adv_data_enc);
                let weak = mgr.weak_self.clone();
                mgr.set_periodic_advertising_data(
                    inst_id,
                    periodic_data,
                    periodic_enc,
                    Box::new(move |status| {
                        let Some(m) = weak.upgrade() else {
                            info!("stack was shut down");
                            return;
                        };
                        let mut mgr = m.lock().unwrap();
                        if status != 0 {
                            mgr.unregister(inst_id);
                            error!("setting periodic data failed, status: {}", status);
                            drop(mgr);
                            (c.cb)(0, 0, status);
                            return;
                        }

                        let include_adi = c.periodic_params.include_adi;
                        let weak = mgr.weak_self.clone();
                        mgr.set_periodic_advertising_enable(
                            inst_id,
                            true,
                            include_adi,
                            Box::new(move |status| {
                                let Some(m) = weak.upgrade() else {
                                    info!("stack was shut down");
                                    return;
                                };
                                let mut mgr = m.lock().unwrap();
                                if status != 0 {
                                    mgr.unregister(inst_id);
                                    error!(
                                        "enabling periodic advertising failed, status: {}",
                                        status
                                    );
                                    drop(mgr);
                                    (c.cb)(0, 0, status);
                                    return;
                                }
                                mgr.start_advertising_set_finish(c);
                            }),
                        );
                    }),
                );
            }),
        );
    }

    fn start_advertising_set_finish(&mut self, c: Box<CreatorParams>) {
        let CreatorParams { inst_id, cb, duration, max_ext_adv_events, timeout_cb, .. } = *c;
        let weak = self.weak_self.clone();
        let enable_cb: MultiAdvCb = Box::new(move |status| {
            let Some(m) = weak.upgrade() else {
                info!("stack was shut down");
                return;
            };
            let mut mgr = m.lock().unwrap();
            if status != 0 {
                mgr.unregister(inst_id);
                error!("enabling advertiser failed, status: {}", status);
                drop(mgr);
                cb(0, 0, status);
                return;
            }
            let tx_power = mgr.adv_inst[inst_id as usize].tx_power;
            drop(mgr);
            cb(inst_id, tx_power, status);
        });
        let timeout: TimeoutCallback = Arc::new(move |status| timeout_cb(inst_id, status));
        self.enable(inst_id, true, enable_cb, duration, max_ext_adv_events, timeout);
    }

    pub fn set_parameters(&mut self, inst_id: u8, params: &AdvertiseParameters, cb: ParametersCb) {
        debug!("set_parameters: inst_id = {}", inst_id);
        if (inst_id as usize) >= self.adv_inst.len() {
            error!("bad instance id {}", inst_id);
            post(move || cb(MULTI_ADV_FAILURE, 0));
            return;
        }
        if !self.adv_inst[inst_id as usize].in_use {
            error!("adv instance not in use: {}", inst_id);
            post(move || cb(MULTI_ADV_FAILURE, 0));
            return;
        }

        let idx = inst_id as usize;
        self.adv_inst[idx].advertising_event_properties = params.advertising_event_properties;
        self.adv_inst[idx].tx_power = params.tx_power;
        self.adv_inst[idx].advertising_interval = params.min_interval;

        let mut peer_address = RawAddress::empty();
        if self.config.rpa_gen_offload_enabled {
            // The controller derives the rotating address from a per-instance
            // pseudo peer address.
            peer_address = RawAddress::from_string(format!("00:00:00:00:00:{:02x}", inst_id))
                .unwrap_or_else(RawAddress::empty);
            self.adv_inst[idx].own_address_type = BLE_ADDR_RANDOM_ID;
        }

        // sid must be in range 0x00 to 0x0F. Since no controller supports
        // more than 16 advertisers, it's safe to make sid equal to inst_id.
        let sid = inst_id % 0x10;

        let own_address_type = self.adv_inst[idx].own_address_type;
        let own_address = self.adv_inst[idx].own_address;
        self.hci.lock().unwrap().set_parameters(
            inst_id,
            params,
            own_address_type,
            own_address,
            peer_address,
            sid,
            cb,
        );
    }

    /// Stores and reloads the advertising (or scan response) payload of a
    /// set. When the new payload no longer fits one fragment of a running
    /// set, the set is disabled first and re-enabled after the reload; the
    /// interface's per-handle ordering makes awaiting the disable
    /// unnecessary.
    pub fn set_data(
        &mut self,
        inst_id: u8,
        is_scan_rsp: bool,
        data: Vec<u8>,
        encr_data: Vec<u8>,
        cb: MultiAdvCb,
    ) {
        if !encr_data.is_empty() && !self.config.enc_adv_data_enabled {
            error!("encrypted advertising data provided but the feature is not enabled");
            post(move || cb(ADVERTISE_FAILED_FEATURE_UNSUPPORTED));
            return;
        }
        debug!("set_data: inst_id = {}, is_scan_rsp = {}", inst_id, is_scan_rsp);
        if !self.valid_instance(inst_id) {
            error!("bad instance id {}", inst_id);
            post(move || cb(MULTI_ADV_FAILURE));
            return;
        }
        if data.len() + encr_data.len() > ADV_DATA_TOTAL_LEN_MAX {
            warn!("advertising data of {} bytes exceeds controller storage", data.len() + encr_data.len());
            post(move || cb(MULTI_ADV_FAILURE));
            return;
        }

        let idx = inst_id as usize;
        let restart =
            data.len() + encr_data.len() > EXT_ADV_DATA_LEN_MAX && self.adv_inst[idx].enable_status;
        if restart {
            let (duration, max_events) =
                (self.adv_inst[idx].duration, self.adv_inst[idx].max_ext_adv_events);
            self.hci.lock().unwrap().enable(false, inst_id, duration, max_events, Box::new(|_| {}));
        }

        {
            let inst = &mut self.adv_inst[idx];
            if is_scan_rsp {
                inst.scan_response_data = data.clone();
                inst.scan_response_data_enc = encr_data.clone();
            } else {
                inst.advertise_data = data.clone();
                inst.advertise_data_enc = encr_data.clone();
            }
        }
        if self.config.enc_adv_data_log_enabled {
            debug!("set_data: data {}", enc_data::hex_encode(&data));
            debug!("set_data: encrypted data {}", enc_data::hex_encode(&encr_data));
        }

        let mut send_data = data;
        let limited = self.adv_inst[idx].duration != 0;
        if !is_scan_rsp && self.adv_inst[idx].is_connectable() {
            let flags = adv_data::flags_ad(limited);
            send_data.splice(0..0, flags.iter().cloned());
        }

        if !encr_data.is_empty() {
            let weak = self.weak_self.clone();
            self.generate_randomizer(
                inst_id,
                Box::new(move |status| {
                    if status != 0 {
                        error!("generating randomizer failed: {}", status);
                        cb(status);
                        return;
                    }
                    let Some(m) = weak.upgrade() else { return };
                    let mut mgr = m.lock().unwrap();
                    if !mgr.valid_instance(inst_id) {
                        return;
                    }
                    let tx_power = mgr.adv_inst[inst_id as usize].tx_power;
                    let mut send_data = send_data;
                    let mut encr_data = encr_data;
                    adv_data::patch_tx_power(&mut send_data, tx_power);
                    adv_data::patch_tx_power(&mut encr_data, tx_power);
                    let ed = match mgr.build_encrypted_ad(inst_id, &encr_data) {
                        Ok(ed) => ed,
                        Err(e) => {
                            error!("sealing advertising data failed: {}", e);
                            drop(mgr);
                            cb(MULTI_ADV_FAILURE);
                            return;
                        }
                    };
                    send_data.extend_from_slice(&ed);
                    if mgr.config.enc_adv_data_log_enabled {
                        debug!("set_data: complete data {}", enc_data::hex_encode(&send_data));
                    }
                    mgr.send_adv_data(inst_id, is_scan_rsp, send_data, restart, cb);
                }),
            );
        } else {
            let tx_power = self.adv_inst[idx].tx_power;
            adv_data::patch_tx_power(&mut send_data, tx_power);
            self.send_adv_data(inst_id, is_scan_rsp, send_data, restart, cb);
        }
    }

    fn send_adv_data(
        &mut self,
        inst_id: u8,
        is_scan_rsp: bool,
        data: Vec<u8>,
        restart: bool,
        cb: MultiAdvCb,
    ) {
        let hci = self.hci.clone();
        let sender: DataSender = Arc::new(move |inst_id, operation, chunk, fragment_cb| {
            if is_scan_rsp {
                hci.lock().unwrap().set_scan_response_data(inst_id, operation, chunk, fragment_cb);
            } else {
                hci.lock().unwrap().set_advertising_data(inst_id, operation, chunk, fragment_cb);
            }
        });
        let done: MultiAdvCb = if restart {
            let weak = self.weak_self.clone();
            Box::new(move |status| {
                if status != 0 {
                    error!("failed to reload advertising data: {}", status);
                    cb(status);
                    return;
                }
                let Some(m) = weak.upgrade() else { return };
                let mgr = m.lock().unwrap();
                let idx = inst_id as usize;
                let (duration, max_events) =
                    (mgr.adv_inst[idx].duration, mgr.adv_inst[idx].max_ext_adv_events);
                mgr.hci.lock().unwrap().enable(true, inst_id, duration, max_events, cb);
            })
        } else {
            cb
        };
        divide_and_send_data(inst_id, data, false, done, sender);
    }

    // Asks the controller for fresh randomness and stores the new per-PDU
    // randomizer on the instance.
    fn generate_randomizer(&mut self, inst_id: u8, cb: MultiAdvCb) {
        let weak = self.weak_self.clone();
        self.hci.lock().unwrap().le_rand(Box::new(move |rand| {
            let Some(m) = weak.upgrade() else { return };
            {
                let mut mgr = m.lock().unwrap();
                if !mgr.valid_instance(inst_id) {
                    return;
                }
                mgr.adv_inst[inst_id as usize].randomizer =
                    enc_data::randomizer_from_le_rand(&rand);
            }
            cb(MULTI_ADV_SUCCESS);
        }));
    }

    fn resolve_key_material(&self, inst_id: u8) -> KeyMaterial {
        let inst = &self.adv_inst[inst_id as usize];
        match KeyMaterial::from_user_blob(&inst.enc_key_value) {
            Some(material) => {
                if self.config.enc_adv_data_log_enabled {
                    debug!("using user supplied key material");
                }
                material
            }
            None => {
                if self.config.enc_adv_data_log_enabled {
                    debug!("using shared key material");
                }
                self.key_provider.read_enc_key_material()
            }
        }
    }

    fn build_encrypted_ad(
        &self,
        inst_id: u8,
        payload: &[u8],
    ) -> Result<Vec<u8>, enc_data::EncDataError> {
        let material = self.resolve_key_material(inst_id);
        let randomizer = self.adv_inst[inst_id as usize].randomizer;
        if self.config.enc_adv_data_log_enabled {
            debug!("key: {}", enc_data::hex_encode(&material.session_key));
            debug!("iv: {}", enc_data::hex_encode(&material.init_vector));
            debug!("randomizer: {}", enc_data::hex_encode(&randomizer));
            debug!("input: {}", enc_data::hex_encode(payload));
        }
        enc_data::build_encrypted_ad(
            &material.session_key,
            &material.init_vector,
            &randomizer,
            payload,
        )
    }

    pub fn set_periodic_advertising_parameters(
        &mut self,
        inst_id: u8,
        params: &PeriodicAdvertisingParameters,
        cb: MultiAdvCb,
    ) {
        debug!("set_periodic_advertising_parameters: inst_id = {}", inst_id);
        self.hci.lock().unwrap().set_periodic_advertising_parameters(
            inst_id,
            params.min_interval,
            params.max_interval,
            params.periodic_advertising_properties,
            cb,
        );
    }

    pub fn set_periodic_advertising_data(
        &mut self,
        inst_id: u8,
        data: Vec<u8>,
        encr_data: Vec<u8>,
        cb: MultiAdvCb,
    ) {
        if !encr_data.is_empty() && !self.config.enc_adv_data_enabled {
            error!("encrypted advertising data provided but the feature is not enabled");
            post(move || cb(ADVERTISE_FAILED_FEATURE_UNSUPPORTED));
            return;
        }
        debug!("set_periodic_advertising_data: inst_id = {}", inst_id);
        if !self.valid_instance(inst_id) {
            error!("bad instance id {}", inst_id);
            post(move || cb(MULTI_ADV_FAILURE));
            return;
        }
        if data.len() + encr_data.len() > ADV_DATA_TOTAL_LEN_MAX {
            warn!("periodic data of {} bytes exceeds controller storage", data.len() + encr_data.len());
            post(move || cb(MULTI_ADV_FAILURE));
            return;
        }

        let idx = inst_id as usize;
        let mut restart_periodic = false;
        if data.len() + encr_data.len() > PERIODIC_ADV_DATA_LEN_MAX
            && self.adv_inst[idx].periodic_enabled
        {
            self.set_periodic_advertising_enable(inst_id, false, false, Box::new(|_| {}));
            restart_periodic = true;
        }

        self.adv_inst[idx].periodic_data = data.clone();
        self.adv_inst[idx].periodic_adv_data_enc = encr_data.clone();
        if self.config.enc_adv_data_log_enabled {
            debug!("periodic data {}", enc_data::hex_encode(&data));
            debug!("periodic encrypted data {}", enc_data::hex_encode(&encr_data));
        }

        if has_broadcast_audio_announcement(&data) || has_broadcast_audio_announcement(&encr_data)
        {
            debug!("broadcast audio announcement, suppressing address rotation");
            self.adv_inst[idx].skip_rpa = true;
            self.adv_inst[idx].skip_rpa_count = BROADCAST_SKIP_RPA_COUNT;
        }

        if !encr_data.is_empty() {
            let weak = self.weak_self.clone();
            self.generate_randomizer(
                inst_id,
                Box::new(move |status| {
                    if status != 0 {
                        error!("generating randomizer failed: {}", status);
                        cb(status);
                        return;
                    }
                    let Some(m) = weak.upgrade() else { return };
                    let mut mgr = m.lock().unwrap();
                    if !mgr.valid_instance(inst_id) {
                        return;
                    }
                    let ed = match mgr.build_encrypted_ad(inst_id, &encr_data) {
                        Ok(ed) => ed,
                        Err(e) => {
                            error!("sealing periodic data failed: {}", e);
                            drop(mgr);
                            cb(MULTI_ADV_FAILURE);
                            return;
                        }
                    };
                    let mut send_data = data;
                    send_data.extend_from_slice(&ed);
                    mgr.send_periodic_adv_data(inst_id, send_data, restart_periodic, cb);
                }),
            );
        } else {
            self.send_periodic_adv_data(inst_id, data, restart_periodic, cb);
        }
    }

    fn send_periodic_adv_data(
        &mut self,
        inst_id: u8,
        data: Vec<u8>,
        restart_periodic: bool,
        cb: MultiAdvCb,
    ) {
        let hci = self.hci.clone();
        let sender: DataSender = Arc::new(move |inst_id, operation, chunk, fragment_cb| {
            hci.lock().unwrap().set_periodic_advertising_data(
                inst_id,
                operation,
                chunk,
                fragment_cb,
            );
        });
        let done: MultiAdvCb = if restart_periodic {
            let weak = self.weak_self.clone();
            Box::new(move |status| {
                if status != 0 {
                    error!("failed to reload periodic data: {}", status);
                    cb(status);
                    return;
                }
                let Some(m) = weak.upgrade() else { return };
                let mut mgr = m.lock().unwrap();
                mgr.set_periodic_advertising_enable(inst_id, true, false, cb);
            })
        } else {
            cb
        };
        divide_and_send_data(inst_id, data, true, done, sender);
    }

    pub fn set_periodic_advertising_enable(
        &mut self,
        inst_id: u8,
        enable: bool,
        include_adi: bool,
        cb: MultiAdvCb,
    ) {
        debug!("set_periodic_advertising_enable: inst_id = {}, enable = {}", inst_id, enable);
        if !self.valid_instance(inst_id) {
            error!("invalid or not active instance {}", inst_id);
            post(move || cb(MULTI_ADV_FAILURE));
            return;
        }

        let wire_enable: u8 = if !enable {
            0x00
        } else if include_adi && self.controller.supports_ble_periodic_advertising_adi() {
            0x03
        } else {
            0x01
        };

        let weak = self.weak_self.clone();
        let enable_cb: MultiAdvCb = Box::new(move |status| {
            debug!(
                "periodic adv enable cb: inst_id: {}, enable: {}, status: {:#x}",
                inst_id, enable, status
            );
            if let Some(m) = weak.upgrade() {
                let mut mgr = m.lock().unwrap();
                if status == 0 {
                    if let Some(inst) = mgr.adv_inst.get_mut(inst_id as usize) {
                        inst.periodic_enabled = enable;
                    }
                }
            }
            cb(status);
        });
        self.hci.lock().unwrap().set_periodic_advertising_enable(wire_enable, inst_id, enable_cb);
    }

    pub fn enable(
        &mut self,
        inst_id: u8,
        enable: bool,
        cb: MultiAdvCb,
        duration: u16,
        max_ext_adv_events: u8,
        timeout_cb: TimeoutCallback,
    ) {
        debug!("enable: inst_id = {}, enable = {}, duration = {}", inst_id, enable, duration);
        if !self.valid_instance(inst_id) {
            error!("invalid or no active instance {}", inst_id);
            post(move || cb(MULTI_ADV_FAILURE));
            return;
        }

        let idx = inst_id as usize;
        if enable && (duration != 0 || max_ext_adv_events != 0) {
            self.adv_inst[idx].timeout_cb = Some(timeout_cb);
        }
        self.adv_inst[idx].duration = duration;
        self.adv_inst[idx].max_ext_adv_events = max_ext_adv_events;

        if !self.config.rpa_gen_offload_enabled
            && enable
            && self.adv_inst[idx].address_update_required
        {
            self.adv_inst[idx].address_update_required = false;
            let weak = self.weak_self.clone();
            self.configure_rpa(
                inst_id,
                Box::new(move |status| {
                    let Some(m) = weak.upgrade() else { return };
                    let mut mgr = m.lock().unwrap();
                    mgr.enable_finish(inst_id, enable, cb, status);
                }),
            );
            return;
        }

        self.enable_finish(inst_id, enable, cb, 0);
    }

    fn enable_finish(&mut self, inst_id: u8, enable: bool, cb: MultiAdvCb, _status: u8) {
        let idx = inst_id as usize;
        if !self.valid_instance(inst_id) {
            post(move || cb(MULTI_ADV_FAILURE));
            return;
        }
        let duration = self.adv_inst[idx].duration;
        let max_ext_adv_events = self.adv_inst[idx].max_ext_adv_events;

        let my_cb: MultiAdvCb = if enable && duration != 0 {
            // The controller may not implement the duration itself; arm a
            // host-side timer that disables the set when it elapses.
            let weak = self.weak_self.clone();
            Box::new(move |status| {
                cb(status);
                let Some(m) = weak.upgrade() else { return };
                let mut mgr = m.lock().unwrap();
                mgr.arm_timeout_timer(inst_id);
            })
        } else {
            if let Some(mut timer) = self.adv_inst[idx].timeout_timer.take() {
                timer.cancel();
            }
            cb
        };

        if enable {
            self.adv_inst[idx].enable_time = Instant::now();
        }
        self.adv_inst[idx].enable_status = enable;
        self.hci.lock().unwrap().enable(enable, inst_id, duration, max_ext_adv_events, my_cb);
    }

    fn arm_timeout_timer(&mut self, inst_id: u8) {
        let idx = inst_id as usize;
        if !self.valid_instance(inst_id) {
            return;
        }
        let duration = self.adv_inst[idx].duration;
        let weak = self.weak_self.clone();
        let mut timer = Alarm::new();
        timer.schedule(Duration::from_millis(duration as u64 * 10), move || {
            let Some(m) = weak.upgrade() else { return };
            let mut mgr = m.lock().unwrap();
            if !mgr.valid_instance(inst_id) {
                return;
            }
            let weak = mgr.weak_self.clone();
            let done: MultiAdvCb = Box::new(move |status| {
                let Some(m) = weak.upgrade() else { return };
                let mgr = m.lock().unwrap();
                let timeout_cb = mgr.adv_inst[inst_id as usize].timeout_cb.clone();
                drop(mgr);
                if let Some(timeout_cb) = timeout_cb {
                    timeout_cb(status);
                }
            });
            mgr.enable(inst_id, false, done, 0, 0, noop_timeout());
        });
        self.adv_inst[idx].timeout_timer = Some(timer);
    }

    fn advertise_restart(&mut self, inst_id: u8, restart: bool, enable: bool) {
        debug!("advertise_restart: enable = {}", enable);
        if !restart {
            return;
        }
        self.adv_inst[inst_id as usize].enable_status = enable;
        self.hci.lock().unwrap().enable(enable, inst_id, 0x00, 0x00, Box::new(|_| {}));
    }

    /// Rotates the resolvable private address of a set and reloads every
    /// encrypted payload with a fresh randomizer. Connectable (and
    /// encrypted) sets are disabled around the update. Rotation is deferred
    /// when the set runs with a timeout, and suppressed for broadcast-audio
    /// sets except on every sixteenth invocation.
    pub fn configure_rpa(&mut self, inst_id: u8, configured_cb: MultiAdvCb) {
        if !self.valid_instance(inst_id) {
            post(move || configured_cb(MULTI_ADV_FAILURE));
            return;
        }
        let idx = inst_id as usize;
        {
            let inst = &mut self.adv_inst[idx];
            if inst.skip_rpa {
                if inst.skip_rpa_count > 0 {
                    inst.skip_rpa_count -= 1;
                    post(move || configured_cb(MULTI_ADV_SUCCESS));
                    return;
                }
                debug!("configure_rpa: rotating broadcast set, resetting skip count");
                inst.skip_rpa_count = BROADCAST_SKIP_RPA_COUNT;
            }
        }

        let enabled = self.adv_inst[idx].enable_status;
        let connectable = self.adv_inst[idx].is_connectable();
        // With a timeout on the set there is no good way to compute the new
        // remaining value; refresh the address when the set stops instead.
        if enabled
            && connectable
            && (self.adv_inst[idx].duration != 0 || self.adv_inst[idx].max_ext_adv_events != 0)
        {
            self.adv_inst[idx].address_update_required = true;
            post(move || configured_cb(MULTI_ADV_FAILURE));
            return;
        }

        // Encrypted payloads pair with the address identity; the reloads
        // below must land while the set is stopped.
        let restart = (enabled && connectable) || self.adv_inst[idx].has_encrypted_payload();

        let bda = RawAddress::random_resolvable();
        self.advertise_restart(inst_id, restart, false);
        self.adv_inst[idx].own_address = bda;
        self.hci.lock().unwrap().set_random_address(
            inst_id,
            bda,
            Box::new(move |status| configured_cb(status)),
        );

        let has_adv_enc = !self.adv_inst[idx].advertise_data_enc.is_empty();
        let has_scan_enc = !self.adv_inst[idx].scan_response_data_enc.is_empty();
        let has_periodic_enc = !self.adv_inst[idx].periodic_adv_data_enc.is_empty()
            && self.adv_inst[idx].periodic_enabled;

        if has_adv_enc {
            let data = self.adv_inst[idx].advertise_data.clone();
            let enc = self.adv_inst[idx].advertise_data_enc.clone();
            let weak = self.weak_self.clone();
            self.set_data(
                inst_id,
                false,
                data,
                enc,
                Box::new(move |status| {
                    if status != 0 {
                        error!("reloading advertise data failed: {}", status);
                        return;
                    }
                    let Some(m) = weak.upgrade() else { return };
                    let mut mgr = m.lock().unwrap();
                    if !mgr.valid_instance(inst_id) {
                        return;
                    }
                    let scan = mgr.adv_inst[inst_id as usize].scan_response_data.clone();
                    let scan_enc = mgr.adv_inst[inst_id as usize].scan_response_data_enc.clone();
                    let weak = mgr.weak_self.clone();
                    mgr.set_data(
                        inst_id,
                        true,
                        scan,
                        scan_enc,
                        Box::new(move |status| {
                            if status != 0 {
                                error!("reloading scan response failed: {}", status);
                                return;
                            }
                            let Some(m) = weak.upgrade() else { return };
                            let mut mgr = m.lock().unwrap();
                            if !mgr.valid_instance(inst_id) {
                                return;
                            }
                            let idx = inst_id as usize;
                            if !mgr.adv_inst[idx].periodic_adv_data_enc.is_empty()
                                && mgr.adv_inst[idx].periodic_enabled
                            {
                                let periodic = mgr.adv_inst[idx].periodic_data.clone();
                                let periodic_enc = mgr.adv_inst[idx].periodic_adv_data_enc.clone();
                                let weak = mgr.weak_self.clone();
                                mgr.set_periodic_advertising_data(
                                    inst_id,
                                    periodic,
                                    periodic_enc,
                                    Box::new(move |status| {
                                        if status != 0 {
                                            error!("reloading periodic data failed: {}", status);
                                            return;
                                        }
                                        let Some(m) = weak.upgrade() else { return };
                                        let mut mgr = m.lock().unwrap();
                                        mgr.advertise_restart(inst_id, restart, true);
                                    }),
                                );
                            } else {
                                mgr.advertise_restart(inst_id, restart, true);
                            }
                        }),
                    );
                }),
            );
        } else if has_scan_enc {
            let scan = self.adv_inst[idx].scan_response_data.clone();
            let scan_enc = self.adv_inst[idx].scan_response_data_enc.clone();
            let weak = self.weak_self.clone();
            self.set_data(
                inst_id,
                true,
                scan,
                scan_enc,
                Box::new(move |status| {
                    if status != 0 {
                        error!("reloading scan response failed: {}", status);
                        return;
                    }
                    let Some(m) = weak.upgrade() else { return };
                    let mut mgr = m.lock().unwrap();
                    mgr.advertise_restart(inst_id, restart, true);
                }),
            );
        } else if has_periodic_enc {
            let periodic = self.adv_inst[idx].periodic_data.clone();
            let periodic_enc = self.adv_inst[idx].periodic_adv_data_enc.clone();
            let weak = self.weak_self.clone();
            self.set_periodic_advertising_data(
                inst_id,
                periodic,
                periodic_enc,
                Box::new(move |status| {
                    if status != 0 {
                        error!("reloading periodic data failed: {}", status);
                        return;
                    }
                    let Some(m) = weak.upgrade() else { return };
                    let mut mgr = m.lock().unwrap();
                    mgr.advertise_restart(inst_id, restart, true);
                }),
            );
        } else {
            self.advertise_restart(inst_id, restart, true);
        }
    }

    pub fn unregister(&mut self, inst_id: u8) {
        debug!("unregister: inst_id = {}", inst_id);
        if (inst_id as usize) >= self.adv_inst.len() {
            error!("bad instance id {}", inst_id);
            return;
        }
        let idx = inst_id as usize;

        if self.controller.supports_ble_iso_broadcaster()
            && self.adv_inst[idx].big_handle != INVALID_BIG_HANDLE
        {
            let big_handle = self.adv_inst[idx].big_handle;
            self.hci.lock().unwrap().terminate_big(big_handle, HCI_ERR_CONN_CAUSE_LOCAL_HOST);
            if let Some(big) = self.iso_big_inst.get_mut(big_handle as usize) {
                big.in_use = false;
                big.bis_handles.clear();
                big.created = false;
                big.big_handle = INVALID_BIG_HANDLE;
            }
            self.adv_inst[idx].big_handle = INVALID_BIG_HANDLE;
        }

        if self.adv_inst[idx].enable_status {
            self.adv_inst[idx].enable_status = false;
            self.hci.lock().unwrap().enable(false, inst_id, 0x00, 0x00, Box::new(|_| {}));
        }

        if self.adv_inst[idx].periodic_enabled {
            self.adv_inst[idx].periodic_enabled = false;
            self.hci.lock().unwrap().set_periodic_advertising_enable(0, inst_id, Box::new(|_| {}));
        }

        let inst = &mut self.adv_inst[idx];
        inst.advertise_data.clear();
        inst.advertise_data_enc.clear();
        inst.scan_response_data.clear();
        inst.scan_response_data_enc.clear();
        inst.periodic_data.clear();
        inst.periodic_adv_data_enc.clear();
        inst.enc_key_value.clear();

        if let Some(mut timer) = inst.timeout_timer.take() {
            debug!("cancelling timeout timer for inst_id: {}", inst_id);
            timer.cancel();
        }
        inst.adv_raddr_timer.cancel();
        inst.timeout_cb = None;
        inst.in_use = false;
        inst.skip_rpa_count = 0;
        inst.skip_rpa = false;
        inst.address_update_required = false;

        self.hci.lock().unwrap().remove_advertising_set(inst_id, Box::new(|_| {}));
    }

    // Charges the elapsed enabled time against the remaining duration and
    // event budget; fires the timeout callback when either is exhausted.
    fn recompute_timeout(inst: &mut AdvertisingInstance, now: Instant) {
        let elapsed_ms = now.duration_since(inst.enable_time).as_millis() as u64;
        let mut cb_fired = false;

        if inst.duration != 0 {
            let duration_done = elapsed_ms / 10;
            if duration_done + 1 >= inst.duration as u64 {
                inst.enable_status = false;
                if let Some(cb) = &inst.timeout_cb {
                    cb(0);
                }
                cb_fired = true;
            } else {
                inst.duration -= duration_done as u16;
            }
        }

        if inst.max_ext_adv_events != 0 && !cb_fired {
            let event_ms = (inst.advertising_interval as u64 * 5 / 8).max(1);
            let events_done = elapsed_ms / event_ms;
            if events_done + 1 >= inst.max_ext_adv_events as u64 {
                inst.enable_status = false;
                if let Some(cb) = &inst.timeout_cb {
                    cb(0);
                }
            } else {
                inst.max_ext_adv_events -= events_done as u8;
            }
        }
    }

    pub fn suspend(&mut self) {
        let now = Instant::now();
        let mut sets = Vec::new();
        for inst in self.adv_inst.iter_mut().filter(|inst| inst.in_use && inst.enable_status) {
            if inst.duration != 0 || inst.max_ext_adv_events != 0 {
                Self::recompute_timeout(inst, now);
            }
            sets.push(SetEnableData { handle: inst.inst_id, ..Default::default() });
        }

        if !sets.is_empty() {
            self.hci.lock().unwrap().enable_sets(false, sets, Box::new(|_| {}));
        }
    }

    pub fn resume(&mut self) {
        let sets: Vec<SetEnableData> = self
            .adv_inst
            .iter()
            .filter(|inst| inst.in_use && inst.enable_status)
            .map(|inst| SetEnableData {
                handle: inst.inst_id,
                duration: inst.duration,
                max_ext_adv_events: inst.max_ext_adv_events,
            })
            .collect();

        if !sets.is_empty() {
            self.hci.lock().unwrap().enable_sets(true, sets, Box::new(|_| {}));
        }
    }

    pub fn create_big(&mut self, inst_id: u8, params: &CreateBigParams, cb: CreateBigCb) {
        debug!("create_big: inst_id = {}", inst_id);
        if !self.controller.supports_ble_iso_broadcaster() {
            debug!("iso broadcaster not supported by the controller");
            post(move || {
                cb(inst_id, HCI_ERR_ILLEGAL_COMMAND, INVALID_BIG_HANDLE, Default::default())
            });
            return;
        }
        if !self.valid_instance(inst_id) {
            error!("bad instance id {}", inst_id);
            post(move || {
                cb(inst_id, HCI_ERR_ILLEGAL_COMMAND, INVALID_BIG_HANDLE, Default::default())
            });
            return;
        }

        let mut cb_opt = Some(cb);
        let mut allocated = None;
        for i in 0..self.iso_big_inst.len() {
            if self.iso_big_inst[i].in_use {
                continue;
            }
            self.iso_big_inst[i].in_use = true;
            self.iso_big_inst[i].big_handle = i as u8;
            self.iso_big_inst[i].adv_inst_id = inst_id;
            self.iso_big_inst[i].create_cb = cb_opt.take();
            debug!("BIG handle allocated: {}", i);
            allocated = Some(i as u8);
            break;
        }
        let Some(big_handle) = allocated else {
            debug!("cannot create BIG, max BIG handle limit reached: {}", self.iso_big_inst.len());
            let cb = cb_opt.take().unwrap();
            post(move || {
                cb(inst_id, HCI_ERR_ILLEGAL_COMMAND, INVALID_BIG_HANDLE, Default::default())
            });
            return;
        };

        self.adv_inst[inst_id as usize].big_handle = big_handle;
        self.hci.lock().unwrap().create_big(big_handle, inst_id, params);
    }

    pub fn terminate_big(&mut self, inst_id: u8, big_handle: u8, reason: u8, cb: TerminateBigCb) {
        debug!("terminate_big: big_handle = {}", big_handle);
        if !self.controller.supports_ble_iso_broadcaster() {
            debug!("iso broadcaster not supported by the controller");
            post(move || cb(HCI_ERR_ILLEGAL_COMMAND, inst_id, big_handle, reason));
            return;
        }
        if (big_handle as usize) >= self.iso_big_inst.len() {
            error!("invalid BIG handle {}", big_handle);
            post(move || cb(HCI_ERR_ILLEGAL_COMMAND, inst_id, big_handle, reason));
            return;
        }

        let created = self.iso_big_inst[big_handle as usize].created;
        self.iso_big_inst[big_handle as usize].adv_inst_id = inst_id;
        if created {
            self.iso_big_inst[big_handle as usize].terminate_cb = Some(cb);
            self.hci.lock().unwrap().terminate_big(big_handle, reason);
        } else {
            error!("terminating BIG which is not created");
            post(move || cb(HCI_ERR_ILLEGAL_COMMAND, inst_id, big_handle, reason));
        }
    }

    fn dispatch_hci_event(&mut self, event: AdvertisingCallbacks) {
        match event {
            AdvertisingCallbacks::AdvertisingSetTerminated {
                status,
                advertising_handle,
                connection_handle,
                num_completed_extended_adv_events,
            } => self.on_advertising_set_terminated(
                status,
                advertising_handle,
                connection_handle,
                num_completed_extended_adv_events,
            ),
            AdvertisingCallbacks::CreateBigComplete { status, big_handle, data } => {
                self.on_big_create_complete(status, big_handle, data)
            }
            AdvertisingCallbacks::TerminateBigComplete { status, big_handle, cmd_status, reason } => {
                self.on_big_terminate_complete(status, big_handle, cmd_status, reason)
            }
        }
    }

    fn on_advertising_set_terminated(
        &mut self,
        status: u8,
        advertising_handle: u8,
        connection_handle: u16,
        _num_completed_extended_adv_events: u8,
    ) {
        debug!(
            "advertising set terminated: status = {:#x}, handle = {}, connection_handle = {:#x}",
            status, advertising_handle, connection_handle
        );
        let idx = advertising_handle as usize;
        if idx >= self.adv_inst.len() {
            warn!("unknown advertising handle {}", advertising_handle);
            return;
        }

        if status == HCI_ERR_LIMIT_REACHED || status == HCI_ERR_ADVERTISING_TIMEOUT {
            // Either the duration elapsed or max_ext_adv_events were sent.
            self.adv_inst[idx].enable_status = false;
            match self.adv_inst[idx].timeout_cb.clone() {
                Some(timeout_cb) => timeout_cb(status),
                None => info!("no timeout callback"),
            }
            return;
        }

        // A connection was formed on this set.
        if !self.config.rpa_gen_offload_enabled && self.controller.le_local_privacy_enabled() {
            let own_address = self.adv_inst[idx].own_address;
            self.acl_tracker.update_conn_addr(connection_handle, own_address);
        }

        if self.adv_inst[idx].in_use {
            if !is_directed(self.adv_inst[idx].advertising_event_properties) {
                debug!("re-enabling advertising");
                Self::recompute_timeout(&mut self.adv_inst[idx], Instant::now());
                if self.adv_inst[idx].enable_status {
                    let duration = self.adv_inst[idx].duration;
                    let max_events = self.adv_inst[idx].max_ext_adv_events;
                    self.hci.lock().unwrap().enable(
                        true,
                        advertising_handle,
                        duration,
                        max_events,
                        Box::new(|_| {}),
                    );
                }
            } else {
                // A directed set does not restart once it stopped.
                self.adv_inst[idx].in_use = false;
            }
        }
    }

    fn on_big_create_complete(&mut self, status: u8, big_handle: u8, data: CreateBigCompleteData) {
        debug!("BIG create complete: big_handle = {}, status = {}", big_handle, status);
        if (big_handle as usize) >= self.iso_big_inst.len() {
            error!("invalid BIG handle {}", big_handle);
            return;
        }

        let adv_inst_id = self.iso_big_inst[big_handle as usize].adv_inst_id;
        if status == MULTI_ADV_SUCCESS {
            let big = &mut self.iso_big_inst[big_handle as usize];
            big.bis_handles = data.conn_handle_list.clone();
            big.created = true;
        } else {
            let big = &mut self.iso_big_inst[big_handle as usize];
            big.in_use = false;
            big.big_handle = INVALID_BIG_HANDLE;
            if let Some(inst) = self.adv_inst.get_mut(adv_inst_id as usize) {
                inst.big_handle = INVALID_BIG_HANDLE;
            }
        }

        if let Some(cb) = self.iso_big_inst[big_handle as usize].create_cb.take() {
            cb(adv_inst_id, status, big_handle, data);
        }
    }

    fn on_big_terminate_complete(
        &mut self,
        status: u8,
        big_handle: u8,
        cmd_status: bool,
        reason: u8,
    ) {
        debug!("BIG terminate complete: big_handle = {}", big_handle);
        if (big_handle as usize) >= self.iso_big_inst.len() {
            error!("invalid BIG handle {}", big_handle);
            return;
        }

        let adv_inst_id = self.iso_big_inst[big_handle as usize].adv_inst_id;
        if !cmd_status {
            let big = &mut self.iso_big_inst[big_handle as usize];
            big.in_use = false;
            big.bis_handles.clear();
            big.created = false;
            big.big_handle = INVALID_BIG_HANDLE;
            if let Some(inst) = self.adv_inst.get_mut(adv_inst_id as usize) {
                inst.big_handle = INVALID_BIG_HANDLE;
            }
        }

        if let Some(cb) = self.iso_big_inst[big_handle as usize].terminate_cb.take() {
            cb(status, adv_inst_id, big_handle, reason);
        }
    }

    fn cancel_adv_alarms(&mut self) {
        for inst in self.adv_inst.iter_mut() {
            if let Some(timer) = inst.timeout_timer.as_mut() {
                timer.cancel();
            }
            inst.adv_raddr_timer.cancel();
        }
    }
}

/// Owner handle of the advertising manager. Cheap to clone; all clones share
/// the same instance table.
#[derive(Clone)]
pub struct AdvertiseManager {
    inner: Arc<Mutex<AdvertiseManagerImpl>>,
}

impl AdvertiseManager {
    pub fn new(
        hci: Box<dyn AdvertiserHciInterface>,
        controller: Box<dyn ControllerInterface>,
        key_provider: Box<dyn EncKeyMaterialProvider>,
        acl_tracker: Box<dyn AclAddressTracker>,
        config: AdvManagerConfig,
    ) -> Self {
        let inner = Arc::new(Mutex::new(AdvertiseManagerImpl {
            hci: new_shared_hci(hci),
            controller,
            key_provider,
            acl_tracker,
            config,
            adv_inst: Vec::new(),
            iso_big_inst: Vec::new(),
            inst_count: 0,
            weak_self: Weak::new(),
        }));
        inner.lock().unwrap().weak_self = Arc::downgrade(&inner);
        AdvertiseManager { inner }
    }

    /// Wires the event dispatcher and sizes the instance table from the
    /// controller's supported set count.
    pub fn initialize(&self) {
        let mgr = self.inner.lock().unwrap();

        let weak = Arc::downgrade(&self.inner);
        mgr.hci.lock().unwrap().set_callbacks_dispatcher(AdvertisingCallbacksDispatcher {
            dispatch: Box::new(move |event| {
                if let Some(m) = weak.upgrade() {
                    m.lock().unwrap().dispatch_hci_event(event);
                }
            }),
        });

        let weak = Arc::downgrade(&self.inner);
        mgr.hci.lock().unwrap().read_instance_count(Box::new(move |count| {
            if let Some(m) = weak.upgrade() {
                m.lock().unwrap().on_instance_count_read(count);
            }
        }));
    }

    pub fn register_advertiser(&self, cb: RegisterCb) {
        self.inner.lock().unwrap().register_advertiser(cb)
    }

    pub fn get_own_address(&self, inst_id: u8, cb: GetAddressCb) {
        self.inner.lock().unwrap().get_own_address(inst_id, cb)
    }

    pub fn get_max_adv_instances(&self) -> u8 {
        self.inner.lock().unwrap().get_max_adv_instances()
    }

    pub fn update_rpa_gen_offload_status(&self, enable: bool) {
        self.inner.lock().unwrap().update_rpa_gen_offload_status(enable)
    }

    pub fn is_rpa_gen_offload_enabled(&self) -> bool {
        self.inner.lock().unwrap().is_rpa_gen_offload_enabled()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start_advertising(
        &self,
        advertiser_id: u8,
        params: AdvertiseParameters,
        advertise_data: Vec<u8>,
        scan_response_data: Vec<u8>,
        duration: u16,
        timeout_cb: TimeoutCallback,
        cb: MultiAdvCb,
    ) {
        self.inner.lock().unwrap().start_advertising(
            advertiser_id,
            params,
            advertise_data,
            scan_response_data,
            duration,
            timeout_cb,
            cb,
        )
    }

    #[allow(clippy::too_many_arguments)]
    pub fn start_advertising_set(
        &self,
        params: AdvertiseParameters,
        advertise_data: Vec<u8>,
        advertise_data_enc: Vec<u8>,
        scan_response_data: Vec<u8>,
        scan_response_data_enc: Vec<u8>,
        periodic_params: PeriodicAdvertisingParameters,
        periodic_data: Vec<u8>,
        periodic_adv_data_enc: Vec<u8>,
        duration: u16,
        max_ext_adv_events: u8,
        enc_key_value: Vec<u8>,
        timeout_cb: IdStatusCallback,
        cb: IdTxPowerStatusCb,
    ) {
        self.inner.lock().unwrap().start_advertising_set(
            params,
            advertise_data,
            advertise_data_enc,
            scan_response_data,
            scan_response_data_enc,
            periodic_params,
            periodic_data,
            periodic_adv_data_enc,
            duration,
            max_ext_adv_events,
            enc_key_value,
            timeout_cb,
            cb,
        )
    }

    pub fn set_parameters(&self, inst_id: u8, params: &AdvertiseParameters, cb: ParametersCb) {
        self.inner.lock().unwrap().set_parameters(inst_id, params, cb)
    }

    pub fn set_data(
        &self,
        inst_id: u8,
        is_scan_rsp: bool,
        data: Vec<u8>,
        encr_data: Vec<u8>,
        cb: MultiAdvCb,
    ) {
        self.inner.lock().unwrap().set_data(inst_id, is_scan_rsp, data, encr_data, cb)
    }

    pub fn set_periodic_advertising_parameters(
        &self,
        inst_id: u8,
        params: &PeriodicAdvertisingParameters,
        cb: MultiAdvCb,
    ) {
        self.inner.lock().unwrap().set_periodic_advertising_parameters(inst_id, params, cb)
    }

    pub fn set_periodic_advertising_data(
        &self,
        inst_id: u8,
        data: Vec<u8>,
        encr_data: Vec<u8>,
        cb: MultiAdvCb,
    ) {
        self.inner.lock().unwrap().set_periodic_advertising_data(inst_id, data, encr_data, cb)
    }

    pub fn set_periodic_advertising_enable(
        &self,
        inst_id: u8,
        enable: bool,
        include_adi: bool,
        cb: MultiAdvCb,
    ) {
        self.inner.lock().unwrap().set_periodic_advertising_enable(inst_id, enable, include_adi, cb)
    }

    pub fn enable(
        &self,
        inst_id: u8,
        enable: bool,
        cb: MultiAdvCb,
        duration: u16,
        max_ext_adv_events: u8,
        timeout_cb: TimeoutCallback,
    ) {
        self.inner.lock().unwrap().enable(
            inst_id,
            enable,
            cb,
            duration,
            max_ext_adv_events,
            timeout_cb,
        )
    }

    pub fn configure_rpa(&self, inst_id: u8, cb: MultiAdvCb) {
        self.inner.lock().unwrap().configure_rpa(inst_id, cb)
    }

    pub fn unregister(&self, inst_id: u8) {
        self.inner.lock().unwrap().unregister(inst_id)
    }

    pub fn suspend(&self) {
        self.inner.lock().unwrap().suspend()
    }

    pub fn resume(&self) {
        self.inner.lock().unwrap().resume()
    }

    pub fn create_big(&self, inst_id: u8, params: &CreateBigParams, cb: CreateBigCb) {
        self.inner.lock().unwrap().create_big(inst_id, params, cb)
    }

    pub fn terminate_big(&self, inst_id: u8, big_handle: u8, reason: u8, cb: TerminateBigCb) {
        self.inner.lock().unwrap().terminate_big(inst_id, big_handle, reason, cb)
    }

    /// Feeds one unsolicited advertising event into the manager. Normally
    /// events arrive through the dispatcher registered at initialize().
    pub fn dispatch(&self, event: AdvertisingCallbacks) {
        self.inner.lock().unwrap().dispatch_hci_event(event)
    }

    pub fn cancel_adv_alarms(&self) {
        self.inner.lock().unwrap().cancel_adv_alarms()
    }
}

lazy_static! {
    static ref INSTANCE: Mutex<Option<AdvertiseManager>> = Mutex::new(None);
}

/// Installs the process-wide manager instance.
pub fn initialize(manager: AdvertiseManager) {
    manager.initialize();
    *INSTANCE.lock().unwrap() = Some(manager);
}

pub fn is_initialized() -> bool {
    INSTANCE.lock().unwrap().is_some()
}

/// The process-wide manager, if initialized.
pub fn get() -> Option<AdvertiseManager> {
    INSTANCE.lock().unwrap().clone()
}

/// Tears down the process-wide instance, cancelling all pending alarms.
pub fn clean_up() {
    if let Some(manager) = INSTANCE.lock().unwrap().take() {
        manager.cancel_adv_alarms();
    }
}
