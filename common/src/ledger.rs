//! Reset-surviving record of which entities are already registered.
//!
//! The flags live in memory that a soft reset leaves alone and a power cycle
//! scrambles. A marker word tells the two apart: unless it matches
//! [`LEDGER_MAGIC`] every flag reads as unset.

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{error::StoreError, hal::CrashStore, types::Entity};

pub const LEDGER_MAGIC: u32 = 478_295;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisioningFlags {
    pub magic: u32,
    pub entities: [bool; Entity::COUNT],
}

impl ProvisioningFlags {
    pub const fn fresh() -> Self {
        Self {
            magic: LEDGER_MAGIC,
            entities: [false; Entity::COUNT],
        }
    }

    pub fn is_valid(&self) -> bool {
        self.magic == LEDGER_MAGIC
    }

    pub fn is_provisioned(&self, entity: Entity) -> bool {
        self.is_valid() && self.entities[entity.index()]
    }

    pub fn temp_initialized(&self) -> bool {
        self.is_provisioned(Entity::Temperature)
    }

    pub fn humid_initialized(&self) -> bool {
        self.is_provisioned(Entity::Humidity)
    }
}

pub struct ProvisioningLedger<S> {
    store: S,
    flags: ProvisioningFlags,
}

impl<S: CrashStore> ProvisioningLedger<S> {
    /// Validates the retained record and resets it when the marker is off.
    pub fn open(mut store: S) -> Self {
        let retained = store.is_valid().then(|| store.read());
        let flags = match retained {
            Some(flags) if flags.is_valid() => {
                info!(
                    "provisioning ledger retained: {}",
                    describe(&flags)
                );
                flags
            }
            _ => {
                warn!("provisioning ledger invalid; treating every entity as unregistered");
                let fresh = ProvisioningFlags::fresh();
                if let Err(err) = store.write(&fresh) {
                    warn!("failed to reinitialize provisioning ledger: {err}");
                }
                fresh
            }
        };
        Self { store, flags }
    }

    pub fn flags(&self) -> &ProvisioningFlags {
        &self.flags
    }

    pub fn is_provisioned(&self, entity: Entity) -> bool {
        self.flags.is_provisioned(entity)
    }

    pub fn temp_initialized(&self) -> bool {
        self.flags.temp_initialized()
    }

    pub fn humid_initialized(&self) -> bool {
        self.flags.humid_initialized()
    }

    /// First entity, in provisioning order, that still needs registering.
    pub fn next_pending(&self) -> Option<Entity> {
        Entity::ALL
            .into_iter()
            .find(|entity| !self.is_provisioned(*entity))
    }

    pub fn mark_provisioned(&mut self, entity: Entity) -> Result<(), StoreError> {
        self.flags.magic = LEDGER_MAGIC;
        self.flags.entities[entity.index()] = true;
        self.store.write(&self.flags)
    }
}

fn describe(flags: &ProvisioningFlags) -> String {
    Entity::ALL
        .iter()
        .map(|entity| {
            let mark = if flags.is_provisioned(*entity) { "done" } else { "pending" };
            format!("{entity}={mark}")
        })
        .collect::<Vec<_>>()
        .join(", ")
}
