//! sled plumbing shared by the services: tree names, CBOR codec helpers and
//! transaction error conversion.
//!
//! Every record is CBOR encoded with minicbor. Multi-record state changes run inside sled
//! transactions, which are serialisable: a conflicting concurrent writer makes sled re-run the
//! closure against fresh data, so a read-modify-write inside one never observes a stale value.

use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, TransactionError};

use crate::config::CoreConfig;
use crate::error::CoreError;

pub type Result<T> = std::result::Result<T, CoreError>;
pub type TxResult<T> = sled::transaction::ConflictableTransactionResult<T, CoreError>;

pub const APPROVAL_REQUESTS: &str = "approval_requests";
pub const APPROVAL_PENDING_INDEX: &str = "approval_pending_index";
pub const APPROVAL_GRANTED_INDEX: &str = "approval_granted_index";
pub const STOCK_LEDGER: &str = "stock_ledger";
pub const STOCK_BALANCE: &str = "stock_balance";
pub const ITEM_TOTALS: &str = "item_totals";
pub const STOCK_TRANSFERS: &str = "stock_transfers";
pub const DOCUMENT_COUNTERS: &str = "document_counters";

pub fn open_db(config: &CoreConfig) -> Result<Arc<sled::Db>> {
    // temporary databases ignore `db_path` and get a fresh generated location
    let db = if config.temporary {
        sled::Config::new().temporary(true).open()?
    } else {
        sled::Config::new().path(&config.db_path).open()?
    };
    Ok(Arc::new(db))
}

pub fn encode<T: minicbor::Encode<()>>(value: &T) -> Result<Vec<u8>> {
    minicbor::to_vec(value).map_err(|e| CoreError::Codec(e.to_string()))
}

pub fn decode<T: for<'b> minicbor::Decode<'b, ()>>(bytes: &[u8]) -> Result<T> {
    minicbor::decode(bytes).map_err(|e| CoreError::Codec(e.to_string()))
}

/// Wraps a [`CoreError`] so it aborts the surrounding sled transaction.
pub fn abort(err: CoreError) -> ConflictableTransactionError<CoreError> {
    ConflictableTransactionError::Abort(err)
}

impl From<TransactionError<CoreError>> for CoreError {
    fn from(err: TransactionError<CoreError>) -> Self {
        match err {
            TransactionError::Abort(e) => e,
            TransactionError::Storage(e) => CoreError::Storage(e),
        }
    }
}
