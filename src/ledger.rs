//! Append-only stock ledger with a materialised balance per (item, warehouse).
//!
//! A movement appends one [`StockLedgerEntry`], rewrites the [`StockBalance`] row and bumps the
//! item's denormalised total, all inside one sled transaction. Movements on the same key are
//! therefore serialised, while movements on different keys never touch the same records.
//!
//! Ledger keys are `item \0 warehouse \0 sequence(be)`, so a prefix scan returns a key's
//! history in posting order.

use std::fmt;
use std::sync::Arc;

use sled::Transactional;
use sled::transaction::TransactionalTree;
use tracing::{debug, info, instrument, warn};

use crate::error::CoreError;
use crate::store::{self, Result, TxResult, abort};
use crate::time::TimeStamp;
use crate::utils::{
    KEY_SEPARATOR, composite_key, composite_prefix, new_uuid_to_bech32, u64_from_be, u64_to_be,
    validate_key_part,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Inbound,
    Outbound,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionType {
    #[n(0)]
    Purchase,
    #[n(1)]
    Sale,
    #[n(2)]
    TransferIn,
    #[n(3)]
    TransferOut,
    #[n(4)]
    AdjustmentIn,
    #[n(5)]
    AdjustmentOut,
    #[n(6)]
    ProductionIn,
    #[n(7)]
    ProductionOut, // material consumed by a work order
    #[n(8)]
    SalesReturn,
    #[n(9)]
    PurchaseReturn,
}

impl TransactionType {
    pub fn flow(self) -> Flow {
        match self {
            TransactionType::Purchase
            | TransactionType::TransferIn
            | TransactionType::AdjustmentIn
            | TransactionType::ProductionIn
            | TransactionType::SalesReturn => Flow::Inbound,
            TransactionType::Sale
            | TransactionType::TransferOut
            | TransactionType::AdjustmentOut
            | TransactionType::ProductionOut
            | TransactionType::PurchaseReturn => Flow::Outbound,
        }
    }

    pub fn is_outbound(self) -> bool {
        self.flow() == Flow::Outbound
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransactionType::Purchase => "purchase",
            TransactionType::Sale => "sale",
            TransactionType::TransferIn => "transfer_in",
            TransactionType::TransferOut => "transfer_out",
            TransactionType::AdjustmentIn => "adjustment_in",
            TransactionType::AdjustmentOut => "adjustment_out",
            TransactionType::ProductionIn => "production_in",
            TransactionType::ProductionOut => "production_out",
            TransactionType::SalesReturn => "sales_return",
            TransactionType::PurchaseReturn => "purchase_return",
        }
    }
}

impl fmt::Display for TransactionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to [`StockLedger::post_movement`]. Exactly one of `qty_in` / `qty_out` is non-zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Movement {
    pub item_id: String,
    pub warehouse_id: String,
    pub qty_in: u64,
    pub qty_out: u64,
    pub transaction_type: TransactionType,
    pub reference_type: String,
    pub reference_id: String,
    pub rate: Option<u64>,
    pub batch_number: Option<String>,
}

impl Movement {
    pub fn inbound(
        item_id: impl Into<String>,
        warehouse_id: impl Into<String>,
        qty: u64,
        transaction_type: TransactionType,
        reference_type: impl Into<String>,
        reference_id: impl Into<String>,
    ) -> Self {
        Self {
            item_id: item_id.into(),
            warehouse_id: warehouse_id.into(),
            qty_in: qty,
            qty_out: 0,
            transaction_type,
            reference_type: reference_type.into(),
            reference_id: reference_id.into(),
            rate: None,
            batch_number: None,
        }
    }

    pub fn outbound(
        item_id: impl Into<String>,
        warehouse_id: impl Into<String>,
        qty: u64,
        transaction_type: TransactionType,
        reference_type: impl Into<String>,
        reference_id: impl Into<String>,
    ) -> Self {
        Self {
            qty_in: 0,
            qty_out: qty,
            ..Self::inbound(
                item_id,
                warehouse_id,
                0,
                transaction_type,
                reference_type,
                reference_id,
            )
        }
    }

    pub fn with_rate(mut self, rate: u64) -> Self {
        self.rate = Some(rate);
        self
    }

    pub fn with_batch(mut self, batch_number: impl Into<String>) -> Self {
        self.batch_number = Some(batch_number.into());
        self
    }

    pub fn quantity(&self) -> u64 {
        self.qty_in.max(self.qty_out)
    }

    pub fn validate(&self) -> Result<()> {
        validate_key_part("item_id", &self.item_id)?;
        validate_key_part("warehouse_id", &self.warehouse_id)?;
        validate_key_part("reference_type", &self.reference_type)?;
        validate_key_part("reference_id", &self.reference_id)?;

        let flow = match (self.qty_in, self.qty_out) {
            (0, 0) => return Err(CoreError::validation("movement quantity must not be zero")),
            (_, 0) => Flow::Inbound,
            (0, _) => Flow::Outbound,
            _ => {
                return Err(CoreError::validation(
                    "a movement carries either qty_in or qty_out, not both",
                ));
            }
        };
        if flow != self.transaction_type.flow() {
            return Err(CoreError::validation(format!(
                "{} cannot be posted as an {:?} movement",
                self.transaction_type, flow
            )));
        }
        Ok(())
    }

    fn value(&self) -> Result<Option<u64>> {
        self.rate
            .map(|rate| {
                self.quantity()
                    .checked_mul(rate)
                    .ok_or_else(|| CoreError::validation("movement value overflows"))
            })
            .transpose()
    }
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StockLedgerEntry {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub item_id: String,
    #[n(2)]
    pub warehouse_id: String,
    #[n(3)]
    pub sequence: u64, // 1-based position in this key's history
    #[n(4)]
    pub transaction_date: TimeStamp,
    #[n(5)]
    pub transaction_type: TransactionType,
    #[n(6)]
    pub reference_type: String,
    #[n(7)]
    pub reference_id: String,
    #[n(8)]
    pub qty_in: u64,
    #[n(9)]
    pub qty_out: u64,
    #[n(10)]
    pub balance_qty: u64,
    #[n(11)]
    pub rate: Option<u64>,
    #[n(12)]
    pub value: Option<u64>,
    #[n(13)]
    pub batch_number: Option<String>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct StockBalance {
    #[n(0)]
    pub item_id: String,
    #[n(1)]
    pub warehouse_id: String,
    #[n(2)]
    pub quantity: u64,
    #[n(3)]
    pub reserved_qty: u64,
    #[n(4)]
    pub movements: u64,
    #[n(5)]
    pub updated_at: TimeStamp,
}

impl StockBalance {
    fn empty(item_id: &str, warehouse_id: &str) -> Self {
        Self {
            item_id: item_id.to_string(),
            warehouse_id: warehouse_id.to_string(),
            quantity: 0,
            reserved_qty: 0,
            movements: 0,
            updated_at: TimeStamp::now(),
        }
    }

    /// Never stored; saturates at zero when outbound movements undercut reservations.
    pub fn available_qty(&self) -> u64 {
        self.quantity.saturating_sub(self.reserved_qty)
    }
}

#[derive(Clone)]
pub struct StockLedger {
    pub(crate) balances: sled::Tree,
    pub(crate) ledger: sled::Tree,
    pub(crate) totals: sled::Tree,
}

impl StockLedger {
    pub fn new(instance: Arc<sled::Db>) -> Result<Self> {
        Ok(Self {
            balances: instance.open_tree(store::STOCK_BALANCE)?,
            ledger: instance.open_tree(store::STOCK_LEDGER)?,
            totals: instance.open_tree(store::ITEM_TOTALS)?,
        })
    }

    #[instrument(
        skip(self, movement),
        fields(
            item_id = %movement.item_id,
            warehouse_id = %movement.warehouse_id,
            transaction_type = %movement.transaction_type,
        )
    )]
    pub fn post_movement(&self, movement: Movement) -> Result<StockLedgerEntry> {
        movement.validate()?;
        let value = movement.value()?;

        let result = (&self.balances, &self.ledger, &self.totals).transaction(
            |(balances, ledger, totals)| post_in_tx(balances, ledger, totals, &movement, value),
        );

        match result {
            Ok(entry) => {
                info!(
                    sequence = entry.sequence,
                    qty_in = entry.qty_in,
                    qty_out = entry.qty_out,
                    balance_qty = entry.balance_qty,
                    "posted stock movement"
                );
                Ok(entry)
            }
            Err(err) => {
                let err = CoreError::from(err);
                if let CoreError::InsufficientStock { .. } = err {
                    warn!(%err, "stock movement rejected");
                }
                Err(err)
            }
        }
    }

    /// Current quantity; a key that never saw a movement reads as 0.
    pub fn get_balance(&self, item_id: &str, warehouse_id: &str) -> Result<u64> {
        match self.balances.get(balance_key(item_id, warehouse_id))? {
            Some(bytes) => Ok(store::decode::<StockBalance>(&bytes)?.quantity),
            None => Ok(0),
        }
    }

    pub fn balance(&self, item_id: &str, warehouse_id: &str) -> Result<StockBalance> {
        let key = balance_key(item_id, warehouse_id);
        let bytes = self
            .balances
            .get(&key)?
            .ok_or_else(|| CoreError::not_found("stock balance", format!("{item_id}@{warehouse_id}")))?;
        store::decode(&bytes)
    }

    pub fn balances_for_item(&self, item_id: &str) -> Result<Vec<StockBalance>> {
        self.balances
            .scan_prefix(composite_prefix(&[item_id]))
            .map(|kv| {
                let (_, bytes) = kv?;
                store::decode(&bytes)
            })
            .collect()
    }

    /// Sum of the item's quantity over every warehouse holding a balance row.
    pub fn total_across_warehouses(&self, item_id: &str) -> Result<u64> {
        let total: u64 = self
            .balances_for_item(item_id)?
            .iter()
            .map(|b| b.quantity)
            .sum();
        debug!(item_id, total, "summed warehouse balances");
        Ok(total)
    }

    /// The item's denormalised total-stock field.
    pub fn item_total(&self, item_id: &str) -> Result<u64> {
        match self.totals.get(item_id.as_bytes())? {
            Some(bytes) => u64_from_be(&bytes),
            None => Ok(0),
        }
    }

    /// Ledger history of one key in posting order.
    pub fn entries(&self, item_id: &str, warehouse_id: &str) -> Result<Vec<StockLedgerEntry>> {
        self.ledger
            .scan_prefix(composite_prefix(&[item_id, warehouse_id]))
            .map(|kv| {
                let (_, bytes) = kv?;
                store::decode(&bytes)
            })
            .collect()
    }

    /// Every entry posted on behalf of one originating document.
    pub fn entries_for_reference(
        &self,
        reference_type: &str,
        reference_id: &str,
    ) -> Result<Vec<StockLedgerEntry>> {
        let mut found = Vec::new();
        for kv in self.ledger.iter() {
            let (_, bytes) = kv?;
            let entry: StockLedgerEntry = store::decode(&bytes)?;
            if entry.reference_type == reference_type && entry.reference_id == reference_id {
                found.push(entry);
            }
        }
        Ok(found)
    }

    /// Replays the key's ledger from zero, checking every running balance and the
    /// materialised row. Returns the replayed quantity.
    #[instrument(skip(self))]
    pub fn verify(&self, item_id: &str, warehouse_id: &str) -> Result<u64> {
        let mut running: u64 = 0;
        let entries = self.entries(item_id, warehouse_id)?;
        for (i, entry) in entries.iter().enumerate() {
            let expected_sequence = i as u64 + 1;
            if entry.sequence != expected_sequence {
                return Err(CoreError::CorruptData(format!(
                    "ledger entry `{}` has sequence {}, expected {expected_sequence}",
                    entry.id, entry.sequence
                )));
            }
            running = running
                .checked_add(entry.qty_in)
                .and_then(|q| q.checked_sub(entry.qty_out))
                .ok_or_else(|| {
                    CoreError::CorruptData(format!("ledger entry `{}` underflows", entry.id))
                })?;
            if running != entry.balance_qty {
                return Err(CoreError::CorruptData(format!(
                    "ledger entry `{}` records balance {}, replay gives {running}",
                    entry.id, entry.balance_qty
                )));
            }
        }

        let stored = self.get_balance(item_id, warehouse_id)?;
        if stored != running {
            return Err(CoreError::CorruptData(format!(
                "balance for {item_id}@{warehouse_id} is {stored}, ledger replay gives {running}"
            )));
        }
        Ok(running)
    }

    /// Earmarks stock without a ledger movement.
    #[instrument(skip(self))]
    pub fn reserve(&self, item_id: &str, warehouse_id: &str, qty: u64) -> Result<StockBalance> {
        if qty == 0 {
            return Err(CoreError::validation("reservation quantity must not be zero"));
        }
        let balance = self.update_reservation(item_id, warehouse_id, |balance| {
            if balance.available_qty() < qty {
                return Err(CoreError::InsufficientStock {
                    item_id: item_id.to_string(),
                    warehouse_id: warehouse_id.to_string(),
                    available: balance.available_qty(),
                    requested: qty,
                });
            }
            balance.reserved_qty += qty;
            Ok(())
        })?;
        debug!(reserved_qty = balance.reserved_qty, "reserved stock");
        Ok(balance)
    }

    #[instrument(skip(self))]
    pub fn release(&self, item_id: &str, warehouse_id: &str, qty: u64) -> Result<StockBalance> {
        if qty == 0 {
            return Err(CoreError::validation("release quantity must not be zero"));
        }
        let balance = self.update_reservation(item_id, warehouse_id, |balance| {
            balance.reserved_qty = balance.reserved_qty.checked_sub(qty).ok_or_else(|| {
                CoreError::validation(format!(
                    "cannot release {qty}, only {} reserved",
                    balance.reserved_qty
                ))
            })?;
            Ok(())
        })?;
        debug!(reserved_qty = balance.reserved_qty, "released stock");
        Ok(balance)
    }

    fn update_reservation<F>(&self, item_id: &str, warehouse_id: &str, apply: F) -> Result<StockBalance>
    where
        F: Fn(&mut StockBalance) -> Result<()>,
    {
        let key = balance_key(item_id, warehouse_id);
        let balance = self.balances.transaction(|tx| -> TxResult<StockBalance> {
            let bytes = tx.get(&key)?.ok_or_else(|| {
                abort(CoreError::not_found(
                    "stock balance",
                    format!("{item_id}@{warehouse_id}"),
                ))
            })?;
            let mut balance: StockBalance = store::decode(&bytes).map_err(abort)?;
            apply(&mut balance).map_err(abort)?;
            balance.updated_at = TimeStamp::now();
            tx.insert(key.as_slice(), store::encode(&balance).map_err(abort)?)?;
            Ok(balance)
        })?;
        Ok(balance)
    }
}

pub(crate) fn balance_key(item_id: &str, warehouse_id: &str) -> Vec<u8> {
    composite_key(&[item_id, warehouse_id])
}

fn entry_key(item_id: &str, warehouse_id: &str, sequence: u64) -> Vec<u8> {
    let mut key = balance_key(item_id, warehouse_id);
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(&u64_to_be(sequence));
    key
}

/// Applies one validated movement to the three ledger trees inside a caller's transaction.
pub(crate) fn post_in_tx(
    balances: &TransactionalTree,
    ledger: &TransactionalTree,
    totals: &TransactionalTree,
    movement: &Movement,
    value: Option<u64>,
) -> TxResult<StockLedgerEntry> {
    let key = balance_key(&movement.item_id, &movement.warehouse_id);
    let mut balance = match balances.get(&key)? {
        Some(bytes) => store::decode::<StockBalance>(&bytes).map_err(abort)?,
        None => StockBalance::empty(&movement.item_id, &movement.warehouse_id),
    };

    let inflated = balance
        .quantity
        .checked_add(movement.qty_in)
        .ok_or_else(|| abort(CoreError::validation("stock quantity overflows")))?;
    let new_qty = inflated.checked_sub(movement.qty_out).ok_or_else(|| {
        abort(CoreError::InsufficientStock {
            item_id: movement.item_id.clone(),
            warehouse_id: movement.warehouse_id.clone(),
            available: balance.quantity,
            requested: movement.qty_out,
        })
    })?;

    let now = TimeStamp::now();
    balance.quantity = new_qty;
    balance.movements += 1;
    balance.updated_at = now;

    let id = new_uuid_to_bech32("stk_").map_err(|e| abort(CoreError::Internal(e)))?;
    let entry = StockLedgerEntry {
        id,
        item_id: movement.item_id.clone(),
        warehouse_id: movement.warehouse_id.clone(),
        sequence: balance.movements,
        transaction_date: now,
        transaction_type: movement.transaction_type,
        reference_type: movement.reference_type.clone(),
        reference_id: movement.reference_id.clone(),
        qty_in: movement.qty_in,
        qty_out: movement.qty_out,
        balance_qty: new_qty,
        rate: movement.rate,
        value,
        batch_number: movement.batch_number.clone(),
    };

    let total = match totals.get(movement.item_id.as_bytes())? {
        Some(bytes) => u64_from_be(&bytes).map_err(abort)?,
        None => 0,
    };
    let total = total
        .checked_add(movement.qty_in)
        .and_then(|t| t.checked_sub(movement.qty_out))
        .ok_or_else(|| {
            abort(CoreError::CorruptData(format!(
                "total stock of `{}` disagrees with its balances",
                movement.item_id
            )))
        })?;

    ledger.insert(
        entry_key(&movement.item_id, &movement.warehouse_id, entry.sequence),
        store::encode(&entry).map_err(abort)?,
    )?;
    balances.insert(key, store::encode(&balance).map_err(abort)?)?;
    totals.insert(movement.item_id.as_bytes(), u64_to_be(total).to_vec())?;

    Ok(entry)
}
