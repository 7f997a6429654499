//! Reference action handlers showing how a module drives the gate before touching stock.
//!
//! A handler asks the gate first; on `Blocked` it returns [`CoreError::ApprovalRequired`]
//! without any side effect, and the caller retries the identical action once the request has
//! been approved.

use std::sync::Arc;

use tracing::{info, instrument};

use crate::approval::{ApprovalAction, ApprovalGate, Fingerprint};
use crate::authz::{AccessPolicy, Actor, Role};
use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::ledger::{Movement, StockLedger, StockLedgerEntry, TransactionType};
use crate::store::{self, Result};
use crate::transfer::{StockTransfer, TransferService, TransferStatus};

pub const PRODUCTION_MODULE: &str = "production";
pub const WORK_ORDER_ENTITY: &str = "work_order";
pub const POST_ENTRY_ACTION: &str = "post_entry";
pub const PRODUCTION_APPROVER_ROLE: &str = "production_manager";

pub const INVENTORY_MODULE: &str = "inventory";
pub const STOCK_TRANSFER_ENTITY: &str = "stock_transfer";
pub const ISSUE_ACTION: &str = "issue";
pub const INVENTORY_APPROVER_ROLE: &str = "inventory_manager";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ProductionEntry {
    #[n(0)]
    pub work_order_id: String,
    #[n(1)]
    pub item_id: String,
    #[n(2)]
    pub warehouse_id: String,
    #[n(3)]
    pub produced_qty: u64,
    #[n(4)]
    pub wastage_qty: u64,
    #[n(5)]
    pub posted_by: String,
}

impl ProductionEntry {
    /// `wastage / produced > threshold%`, compared without rounding.
    pub fn wastage_exceeds(&self, threshold_percent: u64) -> bool {
        u128::from(self.wastage_qty) * 100
            > u128::from(threshold_percent) * u128::from(self.produced_qty)
    }
}

pub struct ActionHandlers {
    gate: Arc<ApprovalGate>,
    ledger: StockLedger,
    transfers: Arc<TransferService>,
    policy: Arc<AccessPolicy>,
    scrap_threshold_percent: u64,
    dispatch_requires_approval: bool,
}

impl ActionHandlers {
    pub fn new(
        gate: Arc<ApprovalGate>,
        ledger: StockLedger,
        transfers: Arc<TransferService>,
        policy: Arc<AccessPolicy>,
        config: &CoreConfig,
    ) -> Self {
        Self {
            gate,
            ledger,
            transfers,
            policy,
            scrap_threshold_percent: config.scrap_threshold_percent,
            dispatch_requires_approval: config.dispatch_requires_approval,
        }
    }

    /// Posts the produced quantity into stock. Wastage above the scrap threshold needs an
    /// approved request for this work order first.
    #[instrument(skip(self, entry), fields(work_order_id = %entry.work_order_id))]
    pub fn post_production_entry(&self, entry: &ProductionEntry) -> Result<StockLedgerEntry> {
        if entry.produced_qty == 0 {
            return Err(CoreError::validation("produced quantity must not be zero"));
        }
        let movement = Movement::inbound(
            &entry.item_id,
            &entry.warehouse_id,
            entry.produced_qty,
            TransactionType::ProductionIn,
            WORK_ORDER_ENTITY,
            &entry.work_order_id,
        );
        movement.validate()?;

        if entry.wastage_exceeds(self.scrap_threshold_percent) {
            self.gate
                .check_or_request(ApprovalAction {
                    fingerprint: Fingerprint::new(
                        PRODUCTION_MODULE,
                        WORK_ORDER_ENTITY,
                        &entry.work_order_id,
                        POST_ENTRY_ACTION,
                    ),
                    condition: format!(">{}%", self.scrap_threshold_percent),
                    approver_role: Role::new(PRODUCTION_APPROVER_ROLE),
                    requested_by: entry.posted_by.clone(),
                    payload: store::encode(entry)?,
                })?
                .require()?;
        }

        let posted = self.ledger.post_movement(movement)?;
        info!(produced = entry.produced_qty, wastage = entry.wastage_qty, "production entry posted");
        Ok(posted)
    }

    /// Dispatches a transfer on behalf of `actor`, gating the `issue` action when configured.
    #[instrument(skip(self, actor), fields(user_id = %actor.user_id))]
    pub fn dispatch_transfer(&self, transfer_id: &str, actor: &Actor) -> Result<StockTransfer> {
        if !self.policy.allows(&actor.role, INVENTORY_MODULE, ISSUE_ACTION) {
            return Err(CoreError::Forbidden(format!(
                "role `{}` may not issue stock",
                actor.role
            )));
        }

        // a request is only opened for a transfer that can actually be dispatched
        let transfer = self.transfers.get(transfer_id)?;
        if !transfer.status.can_transition_to(TransferStatus::InTransit) {
            return Err(CoreError::InvalidStateTransition {
                transfer_id: transfer.id,
                from: transfer.status.to_string(),
                to: TransferStatus::InTransit.to_string(),
            });
        }

        if self.dispatch_requires_approval {
            self.gate
                .check_or_request(ApprovalAction {
                    fingerprint: Fingerprint::new(
                        INVENTORY_MODULE,
                        STOCK_TRANSFER_ENTITY,
                        transfer_id,
                        ISSUE_ACTION,
                    ),
                    condition: "stock issue".to_string(),
                    approver_role: Role::new(INVENTORY_APPROVER_ROLE),
                    requested_by: actor.user_id.clone(),
                    payload: transfer_id.as_bytes().to_vec(),
                })?
                .require()?;
        }

        self.transfers.dispatch(transfer_id, &actor.user_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(produced: u64, wastage: u64) -> ProductionEntry {
        ProductionEntry {
            work_order_id: "WO-1".into(),
            item_id: "X".into(),
            warehouse_id: "FG".into(),
            produced_qty: produced,
            wastage_qty: wastage,
            posted_by: "op-1".into(),
        }
    }

    fn handlers() -> ActionHandlers {
        let db = Arc::new(sled::Config::new().temporary(true).open().unwrap());
        let policy = Arc::new(AccessPolicy::new(["admin"]));
        let config = CoreConfig {
            dispatch_requires_approval: true,
            ..CoreConfig::temporary()
        };
        let ledger = StockLedger::new(db.clone()).unwrap();
        let sequences = Arc::new(crate::sequence::SequenceGenerator::new(db.clone(), 4).unwrap());
        let transfers =
            Arc::new(TransferService::new(db.clone(), ledger.clone(), sequences, &config).unwrap());
        let gate = Arc::new(ApprovalGate::new(db, policy.clone()).unwrap());
        ActionHandlers::new(gate, ledger, transfers, policy, &config)
    }

    fn open_requests(handlers: &ActionHandlers) -> usize {
        handlers
            .gate
            .list(&Actor::new("root", "admin"), &Default::default())
            .unwrap()
            .len()
    }

    #[test]
    fn malformed_entry_is_rejected_before_asking_for_approval() {
        let handlers = handlers();
        let mut bad = entry(50, 10);
        bad.item_id = String::new();

        let err = handlers.post_production_entry(&bad).unwrap_err();
        assert!(matches!(err, CoreError::Validation(_)));
        assert_eq!(open_requests(&handlers), 0);
    }

    #[test]
    fn wastage_threshold_is_strictly_greater_than() {
        assert!(entry(92, 8).wastage_exceeds(7)); // 8.7%
        assert!(!entry(100, 7).wastage_exceeds(7)); // exactly 7%
        assert!(!entry(100, 0).wastage_exceeds(7));
    }
}
