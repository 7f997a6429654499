//! Composition root: one database, one instance of every service.

use std::sync::Arc;

use tracing::info;

use crate::approval::ApprovalGate;
use crate::authz::AccessPolicy;
use crate::config::CoreConfig;
use crate::handlers::ActionHandlers;
use crate::ledger::StockLedger;
use crate::sequence::SequenceGenerator;
use crate::store::{self, Result};
use crate::transfer::TransferService;

pub struct Services {
    pub db: Arc<sled::Db>,
    pub policy: Arc<AccessPolicy>,
    pub sequences: Arc<SequenceGenerator>,
    pub ledger: StockLedger,
    pub transfers: Arc<TransferService>,
    pub approvals: Arc<ApprovalGate>,
    pub handlers: ActionHandlers,
}

impl Services {
    /// Opens the configured database with a policy holding only the privileged roles.
    pub fn open(config: &CoreConfig) -> Result<Self> {
        let policy = AccessPolicy::new(config.privileged_roles.iter().cloned());
        Self::open_with_policy(config, policy)
    }

    pub fn open_with_policy(config: &CoreConfig, policy: AccessPolicy) -> Result<Self> {
        config.validate()?;
        let db = store::open_db(config)?;
        info!(path = %config.db_path.display(), temporary = config.temporary, "database opened");
        Self::build(db, config, policy)
    }

    pub fn build(db: Arc<sled::Db>, config: &CoreConfig, policy: AccessPolicy) -> Result<Self> {
        let policy = Arc::new(policy);
        let sequences = Arc::new(SequenceGenerator::new(db.clone(), config.sequence_padding)?);
        let ledger = StockLedger::new(db.clone())?;
        let transfers = Arc::new(TransferService::new(
            db.clone(),
            ledger.clone(),
            sequences.clone(),
            config,
        )?);
        let approvals = Arc::new(ApprovalGate::new(db.clone(), policy.clone())?);
        let handlers = ActionHandlers::new(
            approvals.clone(),
            ledger.clone(),
            transfers.clone(),
            policy.clone(),
            config,
        );

        Ok(Self {
            db,
            policy,
            sequences,
            ledger,
            transfers,
            approvals,
            handlers,
        })
    }

    pub fn flush(&self) -> Result<usize> {
        Ok(self.db.flush()?)
    }
}
