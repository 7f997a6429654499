//! Shared setup for the integration tests.
#![allow(dead_code)]

use std::sync::Once;

use stock_control::{
    Services,
    authz::{AccessPolicy, Capability},
    config::CoreConfig,
    ledger::{Movement, StockLedger, TransactionType},
};
use tempfile::TempDir;

static INIT: Once = Once::new();

/// Initialize tracing for tests (only once).
pub fn init_tracing() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter("info,stock_control=debug")
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Keeps the temp dir alive for as long as the services use it.
pub struct TestEnv {
    pub services: Services,
    _dir: TempDir,
}

pub fn policy() -> AccessPolicy {
    AccessPolicy::new(["admin"])
        .grant("store_keeper", Capability::new("inventory", "issue"))
        .grant("inventory_manager", Capability::new("inventory", "issue"))
}

/// Sled uses file-based locking, so every test gets its own database under a temp dir.
pub fn spawn_with(config: CoreConfig) -> anyhow::Result<TestEnv> {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let config = CoreConfig {
        db_path: dir.path().join("stock_control.db"),
        ..config
    };
    let services = Services::open_with_policy(&config, policy())?;
    Ok(TestEnv {
        services,
        _dir: dir,
    })
}

pub fn spawn() -> anyhow::Result<TestEnv> {
    spawn_with(CoreConfig::default())
}

/// Receives `qty` of `item_id` into `warehouse_id` through a purchase.
pub fn stock(ledger: &StockLedger, item_id: &str, warehouse_id: &str, qty: u64) -> anyhow::Result<()> {
    ledger.post_movement(Movement::inbound(
        item_id,
        warehouse_id,
        qty,
        TransactionType::Purchase,
        "grn",
        "GRN-SEED",
    ))?;
    Ok(())
}
