//! Generic approval gate.
//!
//! A module action identifies itself by a [`Fingerprint`] and asks the gate whether it may
//! proceed. The gate answers [`Decision::Authorized`] once a request for that fingerprint has
//! been approved, and otherwise records (or reuses) a pending [`ApprovalRequest`] and answers
//! [`Decision::Blocked`]. The gate never replays an action; the caller retries it after the
//! decision.
//!
//! Three trees back the gate:
//! - `approval_requests`: request id -> request, never deleted
//! - `approval_pending_index`: fingerprint hash -> id of the one outstanding request
//! - `approval_granted_index`: fingerprint hash -> id of the approving request
//!
//! Request creation and decisions are sled transactions over all three, so two callers racing
//! on one fingerprint share a single pending request and two deciders racing on one request
//! produce exactly one decision.

use std::fmt;
use std::sync::Arc;

use sled::Transactional;
use sled::transaction::TransactionalTree;
use tracing::{debug, info, instrument, warn};

use crate::authz::{AccessPolicy, Actor, Role};
use crate::error::CoreError;
use crate::store::{self, Result, TxResult, abort};
use crate::time::TimeStamp;
use crate::utils::{new_uuid_to_bech32, validate_key_part};

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalStatus {
    #[n(0)]
    Pending,
    #[n(1)]
    Approved,
    #[n(2)]
    Rejected,
}

impl ApprovalStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ApprovalStatus::Pending => "pending",
            ApprovalStatus::Approved => "approved",
            ApprovalStatus::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ApprovalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identifies one gated action instance.
#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    #[n(0)]
    pub module: String,
    #[n(1)]
    pub entity_type: String,
    #[n(2)]
    pub entity_id: String,
    #[n(3)]
    pub action: String,
}

impl Fingerprint {
    pub fn new(
        module: impl Into<String>,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        action: impl Into<String>,
    ) -> Self {
        Self {
            module: module.into(),
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            action: action.into(),
        }
    }

    fn validate(&self) -> Result<()> {
        validate_key_part("module", &self.module)?;
        validate_key_part("entity_type", &self.entity_type)?;
        validate_key_part("entity_id", &self.entity_id)?;
        validate_key_part("action", &self.action)
    }

    /// sha256 of the CBOR encoding, used as the index key.
    pub fn digest(&self) -> Result<String> {
        Ok(sha256::digest(&store::encode(self)?))
    }
}

/// What a blocked action hands to the gate.
#[derive(Debug, Clone)]
pub struct ApprovalAction {
    pub fingerprint: Fingerprint,
    pub condition: String, // e.g. ">7%"
    pub approver_role: Role,
    pub requested_by: String,
    pub payload: Vec<u8>,
}

#[derive(minicbor::Encode, minicbor::Decode, Debug, Clone, PartialEq, Eq)]
pub struct ApprovalRequest {
    #[n(0)]
    pub id: String,
    #[n(1)]
    pub module: String,
    #[n(2)]
    pub entity_type: String,
    #[n(3)]
    pub entity_id: String,
    #[n(4)]
    pub action: String,
    #[n(5)]
    pub condition: String,
    #[n(6)]
    pub approver_role: String,
    #[n(7)]
    pub status: ApprovalStatus,
    #[n(8)]
    pub requested_by: String,
    #[n(9)]
    pub requested_at: TimeStamp,
    #[n(10)]
    pub decided_by: Option<String>,
    #[n(11)]
    pub decided_at: Option<TimeStamp>,
    #[n(12)]
    pub notes: Option<String>,
    #[n(13)]
    #[cbor(with = "minicbor::bytes")]
    pub payload: Vec<u8>, // snapshot of the blocked action's input
}

impl ApprovalRequest {
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(
            &self.module,
            &self.entity_type,
            &self.entity_id,
            &self.action,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Authorized { request_id: String },
    Blocked { request_id: String },
}

impl Decision {
    pub fn is_authorized(&self) -> bool {
        matches!(self, Decision::Authorized { .. })
    }

    pub fn request_id(&self) -> &str {
        match self {
            Decision::Authorized { request_id } | Decision::Blocked { request_id } => request_id,
        }
    }

    /// Turns `Blocked` into [`CoreError::ApprovalRequired`] for handlers that must stop.
    pub fn require(self) -> Result<String> {
        match self {
            Decision::Authorized { request_id } => Ok(request_id),
            Decision::Blocked { request_id } => Err(CoreError::ApprovalRequired { request_id }),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ApprovalFilter {
    pub status: Option<ApprovalStatus>,
    pub module: Option<String>,
    pub approver_role: Option<Role>,
}

enum Gate {
    Granted(String),
    Outstanding(String),
    Created(String),
}

pub struct ApprovalGate {
    requests: sled::Tree,
    pending: sled::Tree,
    granted: sled::Tree,
    policy: Arc<AccessPolicy>,
}

impl ApprovalGate {
    pub fn new(instance: Arc<sled::Db>, policy: Arc<AccessPolicy>) -> Result<Self> {
        Ok(Self {
            requests: instance.open_tree(store::APPROVAL_REQUESTS)?,
            pending: instance.open_tree(store::APPROVAL_PENDING_INDEX)?,
            granted: instance.open_tree(store::APPROVAL_GRANTED_INDEX)?,
            policy,
        })
    }

    #[instrument(
        skip(self, action),
        fields(
            module = %action.fingerprint.module,
            entity_id = %action.fingerprint.entity_id,
            action = %action.fingerprint.action,
        )
    )]
    pub fn check_or_request(&self, action: ApprovalAction) -> Result<Decision> {
        action.fingerprint.validate()?;
        validate_key_part("approver_role", action.approver_role.as_str())?;
        let digest = action.fingerprint.digest()?;

        if let Some(id) = self.granted.get(digest.as_bytes())? {
            let request_id = id_from_bytes(&id)?;
            debug!(%request_id, "action already approved");
            return Ok(Decision::Authorized { request_id });
        }

        let outcome = (&self.requests, &self.pending, &self.granted).transaction(
            |(requests, pending, granted)| -> TxResult<Gate> {
                if let Some(id) = granted.get(digest.as_bytes())? {
                    return Ok(Gate::Granted(id_from_bytes(&id).map_err(abort)?));
                }
                if let Some(id) = pending.get(digest.as_bytes())? {
                    return Ok(Gate::Outstanding(id_from_bytes(&id).map_err(abort)?));
                }

                let request = ApprovalRequest {
                    id: new_uuid_to_bech32("apr_").map_err(|e| abort(e.into()))?,
                    module: action.fingerprint.module.clone(),
                    entity_type: action.fingerprint.entity_type.clone(),
                    entity_id: action.fingerprint.entity_id.clone(),
                    action: action.fingerprint.action.clone(),
                    condition: action.condition.clone(),
                    approver_role: action.approver_role.as_str().to_string(),
                    status: ApprovalStatus::Pending,
                    requested_by: action.requested_by.clone(),
                    requested_at: TimeStamp::now(),
                    decided_by: None,
                    decided_at: None,
                    notes: None,
                    payload: action.payload.clone(),
                };
                requests.insert(request.id.as_bytes(), store::encode(&request).map_err(abort)?)?;
                pending.insert(digest.as_bytes(), request.id.as_bytes())?;
                Ok(Gate::Created(request.id))
            },
        )?;

        let decision = match outcome {
            Gate::Granted(request_id) => Decision::Authorized { request_id },
            Gate::Outstanding(request_id) => {
                warn!(%request_id, "action blocked, approval still pending");
                Decision::Blocked { request_id }
            }
            Gate::Created(request_id) => {
                info!(
                    %request_id,
                    condition = %action.condition,
                    approver_role = %action.approver_role,
                    "approval request created, action blocked"
                );
                Decision::Blocked { request_id }
            }
        };
        Ok(decision)
    }

    /// Read-only variant of [`ApprovalGate::check_or_request`] that never creates a request.
    pub fn is_authorized(&self, fingerprint: &Fingerprint) -> Result<bool> {
        Ok(self.granted.get(fingerprint.digest()?.as_bytes())?.is_some())
    }

    #[instrument(skip(self, decided_by), fields(user_id = %decided_by.user_id, role = %decided_by.role))]
    pub fn approve(&self, request_id: &str, decided_by: &Actor) -> Result<ApprovalRequest> {
        self.decide(request_id, decided_by, ApprovalStatus::Approved, None)
    }

    #[instrument(skip(self, decided_by, notes), fields(user_id = %decided_by.user_id, role = %decided_by.role))]
    pub fn reject(
        &self,
        request_id: &str,
        decided_by: &Actor,
        notes: Option<String>,
    ) -> Result<ApprovalRequest> {
        self.decide(request_id, decided_by, ApprovalStatus::Rejected, notes)
    }

    pub fn get(&self, request_id: &str) -> Result<ApprovalRequest> {
        let bytes = self
            .requests
            .get(request_id.as_bytes())?
            .ok_or_else(|| CoreError::not_found("approval request", request_id))?;
        store::decode(&bytes)
    }

    /// Requests visible to `viewer`, oldest first. Non-privileged viewers only see requests
    /// addressed to their own role.
    pub fn list(&self, viewer: &Actor, filter: &ApprovalFilter) -> Result<Vec<ApprovalRequest>> {
        let role_scope = if self.policy.is_privileged(&viewer.role) {
            filter.approver_role.as_ref()
        } else {
            match &filter.approver_role {
                Some(role) if role != &viewer.role => return Ok(Vec::new()),
                _ => Some(&viewer.role),
            }
        };

        let mut found = Vec::new();
        for kv in self.requests.iter() {
            let (_, bytes) = kv?;
            let request: ApprovalRequest = store::decode(&bytes)?;
            if filter.status.is_some_and(|s| s != request.status) {
                continue;
            }
            if filter.module.as_ref().is_some_and(|m| m != &request.module) {
                continue;
            }
            if role_scope.is_some_and(|r| r.as_str() != request.approver_role) {
                continue;
            }
            found.push(request);
        }
        found.sort_by_key(|r| r.requested_at);
        Ok(found)
    }

    fn decide(
        &self,
        request_id: &str,
        actor: &Actor,
        status: ApprovalStatus,
        notes: Option<String>,
    ) -> Result<ApprovalRequest> {
        let privileged = self.policy.is_privileged(&actor.role);

        let result = (&self.requests, &self.pending, &self.granted).transaction(
            |(requests, pending, granted)| -> TxResult<ApprovalRequest> {
                let mut request = load_in_tx(requests, request_id)?;
                if request.status != ApprovalStatus::Pending {
                    return Err(abort(CoreError::AlreadyDecided {
                        request_id: request.id.clone(),
                        status: request.status.to_string(),
                    }));
                }
                if !privileged && actor.role.as_str() != request.approver_role {
                    return Err(abort(CoreError::Forbidden(format!(
                        "role `{}` cannot decide requests addressed to `{}`",
                        actor.role, request.approver_role
                    ))));
                }

                request.status = status;
                request.decided_by = Some(actor.user_id.clone());
                request.decided_at = Some(TimeStamp::now());
                request.notes = notes.clone();

                let digest = request.fingerprint().digest().map_err(abort)?;
                if pending
                    .get(digest.as_bytes())?
                    .is_some_and(|id| &*id == request.id.as_bytes())
                {
                    pending.remove(digest.as_bytes())?;
                }
                if status == ApprovalStatus::Approved {
                    granted.insert(digest.as_bytes(), request.id.as_bytes())?;
                }
                requests.insert(request.id.as_bytes(), store::encode(&request).map_err(abort)?)?;
                Ok(request)
            },
        );

        match result {
            Ok(request) => {
                info!(request_id, status = %request.status, "approval request decided");
                Ok(request)
            }
            Err(err) => {
                let err = CoreError::from(err);
                warn!(request_id, %err, "approval decision refused");
                Err(err)
            }
        }
    }
}

fn load_in_tx(requests: &TransactionalTree, request_id: &str) -> TxResult<ApprovalRequest> {
    let bytes = requests
        .get(request_id.as_bytes())?
        .ok_or_else(|| abort(CoreError::not_found("approval request", request_id)))?;
    store::decode(&bytes).map_err(abort)
}

fn id_from_bytes(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .map_err(|e| CoreError::CorruptData(format!("approval index holds a non-utf8 id: {e}")))
}
