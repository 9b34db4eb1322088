//! Standalone master wiring tests

use tandem_common::{BASE_TX_CHECKSUM, BASE_TX_ID, Epoch, RequestContext, StoreId};
use tandem_core::HaSettings;
use tandem_lock::{LockStatus, LockableResource};
use tandem_master::MasterError;
use tandem_server::startup::StandaloneMaster;

fn store_id() -> StoreId {
    StoreId::new(1_700_000_000_000, 42, 1)
}

fn standalone() -> (StandaloneMaster, Epoch) {
    let standalone = StandaloneMaster::new(HaSettings::new(5), store_id());
    let epoch = standalone.start().unwrap();
    (standalone, epoch)
}

// ============== Startup Tests ==============

#[tokio::test]
async fn test_start_stamps_configured_server_id() {
    let (standalone, epoch) = standalone();

    assert_eq!(epoch.server_id(), 5);
    assert!(standalone.master().is_running());
    // Starting again keeps the epoch
    assert_eq!(standalone.start().unwrap(), epoch);

    standalone.shutdown().await;
}

#[tokio::test]
async fn test_handshake_through_server() {
    let (standalone, epoch) = standalone();

    let response = standalone.server.handshake(BASE_TX_ID, store_id()).unwrap();
    assert_eq!(response.value.master_id, 5);
    assert_eq!(response.value.checksum, BASE_TX_CHECKSUM);
    assert_eq!(response.value.epoch, epoch.as_i64());

    let err = standalone
        .server
        .handshake(BASE_TX_ID, StoreId::new(1, 2, 3))
        .unwrap_err();
    assert!(matches!(err, MasterError::StoreIdMismatch { .. }));

    standalone.shutdown().await;
}

// ============== Shutdown Tests ==============

#[tokio::test]
async fn test_shutdown_rolls_back_and_releases_locks() {
    let (standalone, epoch) = standalone();
    let context = RequestContext::new(epoch, 1, 1);
    let resource = LockableResource::node(42);

    standalone.server.initialize_tx(&context).await.unwrap();
    let locked = standalone
        .server
        .acquire_write_lock(&context, std::slice::from_ref(&resource))
        .await
        .unwrap();
    assert_eq!(locked.value.status, LockStatus::OkLocked);
    assert!(standalone.locks.is_locked(&resource));

    standalone.shutdown().await;

    assert!(!standalone.master().is_running());
    assert!(!standalone.locks.is_locked(&resource));
    assert!(standalone.spi.live_transactions().is_empty());
    assert!(standalone.spi.finished().iter().all(|(_, success)| !success));

    let err = standalone.server.initialize_tx(&context).await.unwrap_err();
    assert!(matches!(err, MasterError::NotRunning));
}
