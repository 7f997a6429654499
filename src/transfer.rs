//! Stock transfer state machine.
//!
//! ```text
//! pending ──dispatch──▶ in_transit ──receive──▶ received
//!    │                      │
//!    └──────cancel──────────┴──────▶ cancelled
//! ```
//!
//! Dispatch and receive post their ledger movements and persist the new status in one sled
//! transaction spanning the ledger trees and the transfer tree: either every line moves and the
//! status changes, or nothing is written.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use sled::Transactional;
use sled::transaction::TransactionalTree;
use tracing::{info, instrument, warn};

use crate::config::CoreConfig;
use crate::error::CoreError;
use crate::ledger::{Movement, StockLedger, TransactionType, post_in_tx};
use crate::sequence::SequenceGenerator;
use crate::store::{self, Result, TxResult, abort};
use crate::time::TimeStamp;
use crate::utils::{new_uuid_to_bech32, validate_key_part};

/// `reference_type` of the ledger entries a transfer posts.
pub const TRANSFER_REFERENCE: &str = "stock_transfer";
/// `reference_type` of the compensating entry posted by [`TransferService::cancel_and_restock`].
pub const TRANSFER_REVERSAL_REFERENCE: &str = "stock_transfer_reversal";

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    InTransit,
    #[n(2)]
    Received,
    #[n(3)]
    Cancelled,
}

impl TransferStatus {
    pub fn can_transition_to(self, next: TransferStatus) -> bool {
        use TransferStatus::*;
        matches!(
            (self, next),
            (Pending, InTransit) | (Pending, Cancelled) | (InTransit, Received) | (InTransit, Cancelled)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TransferStatus::Received | TransferStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::InTransit => "in_transit",
            TransferStatus::Received => "received",
            TransferStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for TransferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct TransferLine {
    #[n(0)]
    pub item_id: String,
    #[n(1)]
    pub quantity: u64,
}

impl TransferLine {
    pub fn new(item_id: impl Into<String>, quantity: u64) -> Self {
        Self {
            item_id: item_id.into(),
            quantity,
        }
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StockTransfer {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub transfer_number: String,
    #[n(2)]
    pub from_warehouse_id: String,
    #[n(3)]
    pub to_warehouse_id: String,
    #[n(4)]
    pub items: Vec<TransferLine>,
    #[n(5)]
    pub status: TransferStatus,
    #[n(6)]
    pub created_at: TimeStamp,
    #[n(7)]
    pub created_by: String,
    #[n(8)]
    pub dispatched_at: Option<TimeStamp>,
    #[n(9)]
    pub dispatched_by: Option<String>,
    #[n(10)]
    pub received_at: Option<TimeStamp>,
    #[n(11)]
    pub received_by: Option<String>,
    #[n(12)]
    pub cancelled_at: Option<TimeStamp>,
    #[n(13)]
    pub cancelled_by: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub from_warehouse_id: String,
    pub to_warehouse_id: String,
    pub items: Vec<TransferLine>,
    pub branch_code: Option<String>,
    pub created_by: String,
}

impl TransferRequest {
    pub fn new(
        from_warehouse_id: impl Into<String>,
        to_warehouse_id: impl Into<String>,
        items: Vec<TransferLine>,
        created_by: impl Into<String>,
    ) -> Self {
        Self {
            from_warehouse_id: from_warehouse_id.into(),
            to_warehouse_id: to_warehouse_id.into(),
            items,
            branch_code: None,
            created_by: created_by.into(),
        }
    }

    pub fn with_branch(mut self, branch_code: impl Into<String>) -> Self {
        self.branch_code = Some(branch_code.into());
        self
    }

    /// Checks the request and returns the requested quantity per item.
    fn validate(&self) -> Result<BTreeMap<&str, u64>> {
        validate_key_part("from_warehouse_id", &self.from_warehouse_id)?;
        validate_key_part("to_warehouse_id", &self.to_warehouse_id)?;
        if self.from_warehouse_id == self.to_warehouse_id {
            return Err(CoreError::validation(format!(
                "source and destination warehouse are both `{}`",
                self.from_warehouse_id
            )));
        }
        if self.items.is_empty() {
            return Err(CoreError::validation("a transfer needs at least one line"));
        }

        let mut requested: BTreeMap<&str, u64> = BTreeMap::new();
        for line in &self.items {
            validate_key_part("item_id", &line.item_id)?;
            if line.quantity == 0 {
                return Err(CoreError::validation(format!(
                    "line for `{}` has zero quantity",
                    line.item_id
                )));
            }
            let total = requested.entry(line.item_id.as_str()).or_default();
            *total = total
                .checked_add(line.quantity)
                .ok_or_else(|| CoreError::validation("transfer quantity overflows"))?;
        }
        Ok(requested)
    }
}

pub struct TransferService {
    transfers: sled::Tree,
    ledger: StockLedger,
    sequences: Arc<SequenceGenerator>,
    document_type: String,
    default_branch_code: String,
}

impl TransferService {
    pub fn new(
        instance: Arc<sled::Db>,
        ledger: StockLedger,
        sequences: Arc<SequenceGenerator>,
        config: &CoreConfig,
    ) -> Result<Self> {
        Ok(Self {
            transfers: instance.open_tree(store::STOCK_TRANSFERS)?,
            ledger,
            sequences,
            document_type: config.transfer_document_type.clone(),
            default_branch_code: config.default_branch_code.clone(),
        })
    }

    /// Creates a `pending` transfer after an advisory availability check at the source.
    /// Stock is only deducted by [`TransferService::dispatch`], which checks again atomically.
    #[instrument(
        skip(self, request),
        fields(from = %request.from_warehouse_id, to = %request.to_warehouse_id)
    )]
    pub fn create(&self, request: TransferRequest) -> Result<StockTransfer> {
        let requested = request.validate()?;

        for (item_id, qty) in &requested {
            let available = match self.ledger.balance(item_id, &request.from_warehouse_id) {
                Ok(balance) => balance.available_qty(),
                Err(CoreError::NotFound { .. }) => 0,
                Err(e) => return Err(e),
            };
            if available < *qty {
                warn!(item_id, available, requested = qty, "transfer rejected at creation");
                return Err(CoreError::InsufficientStock {
                    item_id: item_id.to_string(),
                    warehouse_id: request.from_warehouse_id.clone(),
                    available,
                    requested: *qty,
                });
            }
        }

        let branch_code = request
            .branch_code
            .as_deref()
            .unwrap_or(&self.default_branch_code);
        let transfer_number =
            self.sequences
                .next_formatted(&self.document_type, branch_code, Utc::now().date_naive())?;

        let transfer = StockTransfer {
            id: new_uuid_to_bech32("xfer_")?,
            transfer_number,
            from_warehouse_id: request.from_warehouse_id,
            to_warehouse_id: request.to_warehouse_id,
            items: request.items,
            status: TransferStatus::Pending,
            created_at: TimeStamp::now(),
            created_by: request.created_by,
            dispatched_at: None,
            dispatched_by: None,
            received_at: None,
            received_by: None,
            cancelled_at: None,
            cancelled_by: None,
        };
        self.transfers
            .insert(transfer.id.as_bytes(), store::encode(&transfer)?)?;

        info!(
            transfer_id = %transfer.id,
            transfer_number = %transfer.transfer_number,
            lines = transfer.items.len(),
            "transfer created"
        );
        Ok(transfer)
    }

    pub fn get(&self, transfer_id: &str) -> Result<StockTransfer> {
        let bytes = self
            .transfers
            .get(transfer_id.as_bytes())?
            .ok_or_else(|| CoreError::not_found("stock transfer", transfer_id))?;
        store::decode(&bytes)
    }

    pub fn list(&self, status: Option<TransferStatus>) -> Result<Vec<StockTransfer>> {
        let mut transfers = Vec::new();
        for kv in self.transfers.iter() {
            let (_, bytes) = kv?;
            let transfer: StockTransfer = store::decode(&bytes)?;
            if status.is_none_or(|s| s == transfer.status) {
                transfers.push(transfer);
            }
        }
        transfers.sort_by_key(|t| t.created_at);
        Ok(transfers)
    }

    /// `pending → in_transit`, posting a `transfer_out` per line at the source warehouse.
    /// Any line short of stock fails the whole dispatch and the transfer stays `pending`.
    #[instrument(skip(self))]
    pub fn dispatch(&self, transfer_id: &str, dispatched_by: &str) -> Result<StockTransfer> {
        let transfer = self.transition(
            transfer_id,
            TransferStatus::InTransit,
            dispatched_by,
            |transfer| {
                transfer
                    .items
                    .iter()
                    .map(|line| {
                        Movement::outbound(
                            &line.item_id,
                            &transfer.from_warehouse_id,
                            line.quantity,
                            TransactionType::TransferOut,
                            TRANSFER_REFERENCE,
                            &transfer.id,
                        )
                    })
                    .collect()
            },
        )?;
        info!(transfer_id, "transfer dispatched");
        Ok(transfer)
    }

    /// `in_transit → received`, posting a `transfer_in` per line at the destination.
    #[instrument(skip(self))]
    pub fn receive(&self, transfer_id: &str, received_by: &str) -> Result<StockTransfer> {
        let transfer = self.transition(
            transfer_id,
            TransferStatus::Received,
            received_by,
            |transfer| {
                transfer
                    .items
                    .iter()
                    .map(|line| {
                        Movement::inbound(
                            &line.item_id,
                            &transfer.to_warehouse_id,
                            line.quantity,
                            TransactionType::TransferIn,
                            TRANSFER_REFERENCE,
                            &transfer.id,
                        )
                    })
                    .collect()
            },
        )?;
        info!(transfer_id, "transfer received");
        Ok(transfer)
    }

    /// Cancels from `pending` or `in_transit`. Stock already dispatched stays out of the source
    /// warehouse; use [`TransferService::cancel_and_restock`] to return it in the same step.
    #[instrument(skip(self))]
    pub fn cancel(&self, transfer_id: &str, cancelled_by: &str) -> Result<StockTransfer> {
        let transfer =
            self.transition(transfer_id, TransferStatus::Cancelled, cancelled_by, |_| {
                Vec::new()
            })?;
        info!(transfer_id, "transfer cancelled");
        Ok(transfer)
    }

    /// Cancels and, when the transfer is `in_transit`, posts a compensating `transfer_in` for
    /// every line back at the source warehouse.
    #[instrument(skip(self))]
    pub fn cancel_and_restock(&self, transfer_id: &str, cancelled_by: &str) -> Result<StockTransfer> {
        let transfer = self.transition(
            transfer_id,
            TransferStatus::Cancelled,
            cancelled_by,
            |transfer| {
                if transfer.status != TransferStatus::InTransit {
                    return Vec::new();
                }
                transfer
                    .items
                    .iter()
                    .map(|line| {
                        Movement::inbound(
                            &line.item_id,
                            &transfer.from_warehouse_id,
                            line.quantity,
                            TransactionType::TransferIn,
                            TRANSFER_REVERSAL_REFERENCE,
                            &transfer.id,
                        )
                    })
                    .collect()
            },
        )?;
        info!(transfer_id, "transfer cancelled and restocked");
        Ok(transfer)
    }

    fn transition<F>(
        &self,
        transfer_id: &str,
        target: TransferStatus,
        actor: &str,
        movements: F,
    ) -> Result<StockTransfer>
    where
        F: Fn(&StockTransfer) -> Vec<Movement>,
    {
        let ledger = &self.ledger;
        let result = (&ledger.balances, &ledger.ledger, &ledger.totals, &self.transfers)
            .transaction(|(balances, entries, totals, transfers)| -> TxResult<StockTransfer> {
                let mut transfer = load_in_tx(transfers, transfer_id)?;
                if !transfer.status.can_transition_to(target) {
                    return Err(abort(CoreError::InvalidStateTransition {
                        transfer_id: transfer.id.clone(),
                        from: transfer.status.to_string(),
                        to: target.to_string(),
                    }));
                }

                for movement in movements(&transfer) {
                    post_in_tx(balances, entries, totals, &movement, None)?;
                }

                let now = Some(TimeStamp::now());
                let actor = Some(actor.to_string());
                match target {
                    TransferStatus::InTransit => {
                        transfer.dispatched_at = now;
                        transfer.dispatched_by = actor;
                    }
                    TransferStatus::Received => {
                        transfer.received_at = now;
                        transfer.received_by = actor;
                    }
                    TransferStatus::Cancelled => {
                        transfer.cancelled_at = now;
                        transfer.cancelled_by = actor;
                    }
                    TransferStatus::Pending => {}
                }
                transfer.status = target;

                transfers.insert(transfer.id.as_bytes(), store::encode(&transfer).map_err(abort)?)?;
                Ok(transfer)
            });

        result.map_err(|err| {
            let err = CoreError::from(err);
            if err.is_expected() {
                warn!(transfer_id, to = %target, %err, "transfer transition rejected");
            }
            err
        })
    }
}

fn load_in_tx(transfers: &TransactionalTree, transfer_id: &str) -> TxResult<StockTransfer> {
    let bytes = transfers
        .get(transfer_id.as_bytes())?
        .ok_or_else(|| abort(CoreError::not_found("stock transfer", transfer_id)))?;
    store::decode(&bytes).map_err(abort)
}
