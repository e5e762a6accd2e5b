//! Wiring of broker components over one database and clock.

use outpost_core::{BrokerConfig, SharedClock};

use crate::audit::AuditLog;
use crate::commands::CommandQueue;
use crate::enrollment::EnrollmentIssuer;
use crate::nodes::NodeDirectory;
use crate::reaper::Reaper;
use crate::requests::RequestBroker;
use crate::storage::BrokerDatabase;
use crate::tunnel::TunnelSessionManager;
use crate::updates::{PayloadStore, UpdateController};

/// Every broker component, sharing one store and clock.
#[derive(Clone)]
pub struct Broker {
    pub nodes: NodeDirectory,
    pub enrollment: EnrollmentIssuer,
    pub commands: CommandQueue,
    pub updates: UpdateController,
    pub tunnels: TunnelSessionManager,
    pub requests: RequestBroker,
    pub reaper: Reaper,
    pub db: BrokerDatabase,
}

impl Broker {
    pub fn new(db: BrokerDatabase, clock: SharedClock, config: &BrokerConfig) -> Self {
        let audit = AuditLog::new(db.clone(), clock.clone());
        Self {
            nodes: NodeDirectory::new(db.clone(), clock.clone(), audit.clone()),
            enrollment: EnrollmentIssuer::new(
                db.clone(),
                clock.clone(),
                audit.clone(),
                config.nodes.checkin_interval_secs,
            ),
            commands: CommandQueue::new(db.clone(), clock.clone(), audit.clone()),
            updates: UpdateController::new(
                db.clone(),
                clock.clone(),
                audit.clone(),
                PayloadStore::new(config.updates.payload_dir.clone()),
            ),
            tunnels: TunnelSessionManager::new(
                db.clone(),
                clock.clone(),
                audit.clone(),
                config.tunnel.clone(),
            ),
            requests: RequestBroker::new(db.clone(), clock.clone(), audit.clone()),
            reaper: Reaper::new(db.clone(), clock, audit, config.reaper.clone()),
            db,
        }
    }
}
