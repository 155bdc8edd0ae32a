//! Mocked controller, key-material and ACL collaborators for use in tests.

use std::sync::{Arc, Mutex};

use crate::address::RawAddress;
use crate::controller::{AclAddressTracker, ControllerInterface};
use crate::enc_data::{EncKeyMaterialProvider, KeyMaterial};

/// Controller double with directly settable feature bits.
#[derive(Clone)]
pub struct MockController {
    pub local_addr: RawAddress,
    pub periodic_advertising_adi: bool,
    pub iso_broadcaster: bool,
    pub local_privacy: bool,
}

impl Default for MockController {
    fn default() -> Self {
        MockController {
            local_addr: RawAddress::from([0x01, 0x02, 0x03, 0x04, 0x05, 0x06]),
            periodic_advertising_adi: true,
            iso_broadcaster: true,
            local_privacy: true,
        }
    }
}

impl ControllerInterface for MockController {
    fn read_local_addr(&self) -> RawAddress {
        self.local_addr
    }

    fn supports_ble_periodic_advertising_adi(&self) -> bool {
        self.periodic_advertising_adi
    }

    fn supports_ble_iso_broadcaster(&self) -> bool {
        self.iso_broadcaster
    }

    fn le_local_privacy_enabled(&self) -> bool {
        self.local_privacy
    }
}

/// Key provider returning a fixed session key and IV.
#[derive(Clone)]
pub struct MockKeyProvider {
    pub material: KeyMaterial,
}

impl Default for MockKeyProvider {
    fn default() -> Self {
        MockKeyProvider {
            material: KeyMaterial { session_key: [0x5A; 16], init_vector: [0xA5; 8] },
        }
    }
}

impl EncKeyMaterialProvider for MockKeyProvider {
    fn read_enc_key_material(&self) -> KeyMaterial {
        self.material
    }
}

/// Records connection address refreshes.
#[derive(Clone, Default)]
pub struct MockAclTracker {
    pub updates: Arc<Mutex<Vec<(u16, RawAddress)>>>,
}

impl AclAddressTracker for MockAclTracker {
    fn update_conn_addr(&self, conn_handle: u16, address: RawAddress) {
        self.updates.lock().unwrap().push((conn_handle, address));
    }
}
