//! Standalone master wiring
//!
//! Assembles the master endpoint with the in-memory lock manager and
//! transaction manager on the wall clock and the Tokio scheduler.

use std::sync::Arc;

use tandem_common::{Clock, Epoch, StoreId, SystemClock};
use tandem_core::{ConversationManager, DefaultConversationSpi, HaSettings, TokioJobScheduler};
use tandem_lock::MemoryLockManager;
use tandem_master::{MasterError, MasterImpl, MasterServer, MasterSpi, MemoryMasterSpi};
use tracing::info;

pub struct StandaloneMaster {
    pub server: Arc<MasterServer>,
    pub locks: MemoryLockManager,
    pub spi: Arc<MemoryMasterSpi>,
}

impl StandaloneMaster {
    pub fn new(settings: HaSettings, store_id: StoreId) -> Self {
        Self::with_clock(settings, store_id, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: HaSettings, store_id: StoreId, clock: Arc<dyn Clock>) -> Self {
        let locks = MemoryLockManager::new();
        let spi = Arc::new(MemoryMasterSpi::new(settings.server_id, store_id));
        let scheduler = Arc::new(TokioJobScheduler);

        let conversations = Arc::new(ConversationManager::new(
            Arc::new(DefaultConversationSpi::new(Arc::new(locks.clone()))),
            scheduler.clone(),
            settings.clone(),
            clock.clone(),
        ));
        let master = Arc::new(MasterImpl::new(
            spi.clone(),
            conversations,
            scheduler,
            settings,
            clock,
        ));

        Self {
            server: Arc::new(MasterServer::new(master)),
            locks,
            spi,
        }
    }

    pub fn master(&self) -> &Arc<MasterImpl> {
        self.server.master()
    }

    pub fn start(&self) -> Result<Epoch, MasterError> {
        let epoch = self.master().start()?;
        info!(
            epoch = %epoch,
            store_id = %self.spi.store_id(),
            "Standalone master accepting replicas"
        );
        Ok(epoch)
    }

    /// Roll back live transactions and release every conversation
    pub async fn shutdown(&self) {
        self.master().stop().await;

        let stats = self.locks.stats();
        info!(
            total_acquisitions = stats.total_acquisitions,
            deadlocks = stats.deadlocks,
            closed_clients = stats.closed_clients,
            "Standalone master shut down"
        );
    }
}
