//! Mocked HCI interface for use in tests.
//!
//! Commands are recorded with their continuations and completed only when the
//! test pumps the queue, which mirrors how real Command Complete events
//! arrive after the issuing call has returned.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use crate::address::RawAddress;
use crate::fragment::DataOperation;
use crate::hci::{
    AdvertiserHciInterface, AdvertiseParameters, AdvertisingCallbacks,
    AdvertisingCallbacksDispatcher, CreateBigParams, MultiAdvCb, ParametersCb, SetEnableData,
};

/// Commands observed by the mock, without their continuations.
#[derive(Debug, Clone)]
pub enum MockHciCall {
    ReadInstanceCount,
    SetParameters {
        handle: u8,
        advertising_event_properties: u16,
        own_address_type: u8,
        own_address: RawAddress,
        peer_address: RawAddress,
        sid: u8,
    },
    SetRandomAddress {
        handle: u8,
        addr: RawAddress,
    },
    SetAdvertisingData {
        handle: u8,
        operation: DataOperation,
        data: Vec<u8>,
    },
    SetScanResponseData {
        handle: u8,
        operation: DataOperation,
        data: Vec<u8>,
    },
    SetPeriodicAdvertisingParameters {
        handle: u8,
        min_interval: u16,
        max_interval: u16,
        properties: u16,
    },
    SetPeriodicAdvertisingData {
        handle: u8,
        operation: DataOperation,
        data: Vec<u8>,
    },
    SetPeriodicAdvertisingEnable {
        enable: u8,
        handle: u8,
    },
    Enable {
        enable: bool,
        sets: Vec<SetEnableData>,
    },
    RemoveAdvertisingSet {
        handle: u8,
    },
    LeRand,
    CreateBig {
        big_handle: u8,
        adv_handle: u8,
        num_bis: u8,
    },
    TerminateBig {
        big_handle: u8,
        reason: u8,
    },
}

enum Pending {
    Status(MultiAdvCb),
    Parameters(ParametersCb),
    InstanceCount(Box<dyn FnOnce(u8) + Send>),
    Rand(Box<dyn FnOnce([u8; 8]) + Send>),
}

struct MockHciState {
    calls: Vec<MockHciCall>,
    pending: VecDeque<Pending>,
    status_overrides: VecDeque<u8>,
    instance_count: u8,
    selected_tx_power: i8,
    rand_value: [u8; 8],
    dispatcher: Option<AdvertisingCallbacksDispatcher>,
}

/// Queue-backed mock of `AdvertiserHciInterface`.
#[derive(Clone)]
pub struct MockAdvertiserHci {
    state: Arc<Mutex<MockHciState>>,
}

impl Default for MockAdvertiserHci {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdvertiserHci {
    pub fn new() -> Self {
        MockAdvertiserHci {
            state: Arc::new(Mutex::new(MockHciState {
                calls: Vec::new(),
                pending: VecDeque::new(),
                status_overrides: VecDeque::new(),
                instance_count: 4,
                selected_tx_power: -7,
                rand_value: [0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88],
                dispatcher: None,
            })),
        }
    }

    /// Snapshot of every command issued so far.
    pub fn calls(&self) -> Vec<MockHciCall> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    /// Queues a status returned by the next status-bearing completion;
    /// unqueued completions report success.
    pub fn push_status(&self, status: u8) {
        self.state.lock().unwrap().status_overrides.push_back(status);
    }

    pub fn set_instance_count(&self, count: u8) {
        self.state.lock().unwrap().instance_count = count;
    }

    pub fn set_selected_tx_power(&self, tx_power: i8) {
        self.state.lock().unwrap().selected_tx_power = tx_power;
    }

    pub fn set_rand_value(&self, rand: [u8; 8]) {
        self.state.lock().unwrap().rand_value = rand;
    }

    pub fn pending_len(&self) -> usize {
        self.state.lock().unwrap().pending.len()
    }

    /// Delivers one queued Command Complete. Returns false when the queue is
    /// empty. Invoked with no locks held so continuations may re-enter.
    pub fn complete_next(&self) -> bool {
        let (item, status, tx_power, count, rand) = {
            let mut state = self.state.lock().unwrap();
            let item = match state.pending.pop_front() {
                Some(item) => item,
                None => return false,
            };
            let status = state.status_overrides.pop_front().unwrap_or(0);
            (item, status, state.selected_tx_power, state.instance_count, state.rand_value)
        };
        match item {
            Pending::Status(cb) => cb(status),
            Pending::Parameters(cb) => cb(status, tx_power),
            Pending::InstanceCount(cb) => cb(count),
            Pending::Rand(cb) => cb(rand),
        }
        true
    }

    /// Completes queued commands until the queue drains, following any chain
    /// of commands the continuations issue.
    pub fn pump(&self) -> usize {
        let mut completed = 0;
        while self.complete_next() {
            completed += 1;
        }
        completed
    }

    /// Fires an unsolicited event through the registered dispatcher. The
    /// dispatcher re-enters the stack, which may issue further commands, so
    /// the state lock must not be held across the call.
    pub fn dispatch(&self, event: AdvertisingCallbacks) {
        let dispatcher = self
            .state
            .lock()
            .unwrap()
            .dispatcher
            .take()
            .expect("no callbacks dispatcher registered");
        (dispatcher.dispatch)(event);
        self.state.lock().unwrap().dispatcher.get_or_insert(dispatcher);
    }

    fn record(&self, call: MockHciCall, pending: Option<Pending>) {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if let Some(p) = pending {
            state.pending.push_back(p);
        }
    }
}

impl AdvertiserHciInterface for MockAdvertiserHci {
    fn read_instance_count(&mut self, cb: Box<dyn FnOnce(u8) + Send>) {
        self.record(MockHciCall::ReadInstanceCount, Some(Pending::InstanceCount(cb)));
    }

    fn set_parameters(
        &mut self,
        handle: u8,
        params: &AdvertiseParameters,
        own_address_type: u8,
        own_address: RawAddress,
        peer_address: RawAddress,
        sid: u8,
        cb: ParametersCb,
    ) {
        self.record(
            MockHciCall::SetParameters {
                handle,
                advertising_event_properties: params.advertising_event_properties,
                own_address_type,
                own_address,
                peer_address,
                sid,
            },
            Some(Pending::Parameters(cb)),
        );
    }

    fn set_random_address(&mut self, handle: u8, addr: RawAddress, cb: MultiAdvCb) {
        self.record(MockHciCall::SetRandomAddress { handle, addr }, Some(Pending::Status(cb)));
    }

    fn set_advertising_data(
        &mut self,
        handle: u8,
        operation: DataOperation,
        data: &[u8],
        cb: MultiAdvCb,
    ) {
        self.record(
            MockHciCall::SetAdvertisingData { handle, operation, data: data.to_vec() },
            Some(Pending::Status(cb)),
        );
    }

    fn set_scan_response_data(
        &mut self,
        handle: u8,
        operation: DataOperation,
        data: &[u8],
        cb: MultiAdvCb,
    ) {
        self.record(
            MockHciCall::SetScanResponseData { handle, operation, data: data.to_vec() },
            Some(Pending::Status(cb)),
        );
    }

    fn set_periodic_advertising_parameters(
        &mut self,
        handle: u8,
        min_interval: u16,
        max_interval: u16,
        properties: u16,
        cb: MultiAdvCb,
    ) {
        self.record(
            MockHciCall::SetPeriodicAdvertisingParameters {
                handle,
                min_interval,
                max_interval,
                properties,
            },
            Some(Pending::Status(cb)),
        );
    }

    fn set_periodic_advertising_data(
        &mut self,
        handle: u8,
        operation: DataOperation,
        data: &[u8],
        cb: MultiAdvCb,
    ) {
        self.record(
            MockHciCall::SetPeriodicAdvertisingData { handle, operation, data: data.to_vec() },
            Some(Pending::Status(cb)),
        );
    }

    fn set_periodic_advertising_enable(&mut self, enable: u8, handle: u8, cb: MultiAdvCb) {
        self.record(
            MockHciCall::SetPeriodicAdvertisingEnable { enable, handle },
            Some(Pending::Status(cb)),
        );
    }

    fn enable(
        &mut self,
        enable: bool,
        handle: u8,
        duration: u16,
        max_ext_adv_events: u8,
        cb: MultiAdvCb,
    ) {
        self.record(
            MockHciCall::Enable {
                enable,
                sets: vec![SetEnableData { handle, duration, max_ext_adv_events }],
            },
            Some(Pending::Status(cb)),
        );
    }

    fn enable_sets(&mut self, enable: bool, sets: Vec<SetEnableData>, cb: MultiAdvCb) {
        self.record(MockHciCall::Enable { enable, sets }, Some(Pending::Status(cb)));
    }

    fn remove_advertising_set(&mut self, handle: u8, cb: MultiAdvCb) {
        self.record(MockHciCall::RemoveAdvertisingSet { handle }, Some(Pending::Status(cb)));
    }

    fn le_rand(&mut self, cb: Box<dyn FnOnce([u8; 8]) + Send>) {
        self.record(MockHciCall::LeRand, Some(Pending::Rand(cb)));
    }

    fn create_big(&mut self, big_handle: u8, adv_handle: u8, params: &CreateBigParams) {
        self.record(
            MockHciCall::CreateBig { big_handle, adv_handle, num_bis: params.num_bis },
            None,
        );
    }

    fn terminate_big(&mut self, big_handle: u8, reason: u8) {
        self.record(MockHciCall::TerminateBig { big_handle, reason }, None);
    }

    fn set_callbacks_dispatcher(&mut self, dispatcher: AdvertisingCallbacksDispatcher) {
        self.state.lock().unwrap().dispatcher = Some(dispatcher);
    }
}
