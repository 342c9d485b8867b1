use crate::access::AccessControl;
use crate::clock::Clock;
use crate::error::RebalancerError;
use crate::ledger::{AuditEvent, AuditLog};
use crate::locks::KeyedLocks;
use crate::signer::{operation_digest, OperationDigest, SignatureVerifier};
use crate::types::{DelegationSession, Identity, SessionStatus, SignedOperation};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionCounter {
    pub owner: Identity,
    pub issued: u64,
}

/// Signature consumed by `verify_operation` and not yet executed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReservation {
    pub session_id: String,
    pub signature_key: String,
}

/// Serializable image of the session authority.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionAuthoritySnapshot {
    pub sessions: Vec<DelegationSession>,
    pub counters: Vec<SessionCounter>,
    pub used_signatures: Vec<String>,
    pub pending: Vec<PendingReservation>,
}

/// Issues time-boxed, op-capped sessions and gates every signed operation.
///
/// Per session, nonces are strictly sequential. Across all sessions, a
/// digest/signature pair is accepted at most once.
pub struct SessionAuthority {
    sessions: RwLock<HashMap<String, DelegationSession>>,
    owner_sessions: RwLock<HashMap<Identity, Vec<String>>>,
    counters: RwLock<HashMap<Identity, u64>>,
    used_signatures: Mutex<HashSet<String>>,
    pending: RwLock<HashMap<String, String>>,
    locks: KeyedLocks,
    verifier: Arc<dyn SignatureVerifier>,
    access: Arc<AccessControl>,
    clock: Arc<dyn Clock>,
    audit: Arc<AuditLog>,
}

impl SessionAuthority {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        access: Arc<AccessControl>,
        clock: Arc<dyn Clock>,
        audit: Arc<AuditLog>,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            owner_sessions: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            used_signatures: Mutex::new(HashSet::new()),
            pending: RwLock::new(HashMap::new()),
            locks: KeyedLocks::new(),
            verifier,
            access,
            clock,
            audit,
        }
    }

    pub fn create_session(
        &self,
        owner: &Identity,
        delegate: &Identity,
        expiry: DateTime<Utc>,
        policy_hash: &str,
        max_ops: u32,
    ) -> Result<DelegationSession, RebalancerError> {
        if owner.is_empty() {
            return Err(RebalancerError::EmptyIdentity { field: "owner" });
        }
        if delegate.is_empty() {
            return Err(RebalancerError::EmptyIdentity { field: "delegate" });
        }
        if policy_hash.trim().is_empty() {
            return Err(RebalancerError::EmptyIdentity {
                field: "policy_hash",
            });
        }
        if max_ops == 0 {
            return Err(RebalancerError::InvalidInput(
                "max_ops must be positive".to_string(),
            ));
        }

        self.locks.with_lock(owner.as_str(), || {
            let now = self.clock.now();
            if expiry <= now {
                return Err(RebalancerError::InvalidInput(format!(
                    "session expiry {expiry} is not after {now}"
                )));
            }

            let mut counters = self
                .counters
                .write()
                .map_err(|_| RebalancerError::LockPoisoned("session counters"))?;
            let counter = counters.entry(owner.clone()).or_insert(0);
            let id = session_id(owner, delegate, *counter, now);

            let session = DelegationSession {
                id: id.clone(),
                owner: owner.clone(),
                delegate: delegate.clone(),
                nonce: 0,
                expiry,
                policy_hash: policy_hash.to_string(),
                is_active: true,
                max_ops,
                used_ops: 0,
                created_at: now,
            };
            self.write_sessions()?.insert(id.clone(), session.clone());
            self.owner_sessions
                .write()
                .map_err(|_| RebalancerError::LockPoisoned("owner sessions"))?
                .entry(owner.clone())
                .or_default()
                .push(id.clone());
            *counter += 1;
            drop(counters);

            info!(
                session_id = %id,
                owner = %owner,
                delegate = %delegate,
                max_ops,
                expiry = %expiry,
                "Session created"
            );
            self.audit.record(
                &id,
                now,
                AuditEvent::new(
                    "session_created",
                    format!("owner={owner} delegate={delegate} max_ops={max_ops}"),
                ),
            )?;
            Ok(session)
        })
    }

    /// Only the session's owner or an admin may revoke; revocation is terminal.
    pub fn revoke_session(&self, caller: &Identity, id: &str) -> Result<(), RebalancerError> {
        let owner = self.require_session(id)?.owner;
        if caller != &owner && !self.access.is_admin(caller) {
            return Err(RebalancerError::unauthorized(caller, "the session owner or an admin"));
        }

        self.locks.with_lock(owner.as_str(), || {
            let mut sessions = self.write_sessions()?;
            let session = sessions
                .get_mut(id)
                .ok_or_else(|| RebalancerError::SessionNotFound(id.to_string()))?;
            if !session.is_active {
                return Err(RebalancerError::SessionInvalid {
                    id: id.to_string(),
                    reason: SessionStatus::Revoked.name(),
                });
            }
            session.is_active = false;
            drop(sessions);
            self.clear_pending(id)?;

            info!(session_id = %id, by = %caller, "Session revoked");
            self.audit.record(
                id,
                self.clock.now(),
                AuditEvent::new("session_revoked", format!("by={caller}")),
            )?;
            Ok(())
        })
    }

    /// Revoke every still-active session of `owner`; returns how many flipped.
    pub fn revoke_all_sessions(
        &self,
        caller: &Identity,
        owner: &Identity,
    ) -> Result<usize, RebalancerError> {
        if caller != owner && !self.access.is_admin(caller) {
            return Err(RebalancerError::unauthorized(caller, "the owner or an admin"));
        }

        self.locks.with_lock(owner.as_str(), || {
            let ids = self
                .owner_sessions
                .read()
                .map_err(|_| RebalancerError::LockPoisoned("owner sessions"))?
                .get(owner)
                .cloned()
                .unwrap_or_default();

            let mut revoked = Vec::new();
            {
                let mut sessions = self.write_sessions()?;
                for id in ids {
                    if let Some(session) = sessions.get_mut(&id) {
                        if session.is_active {
                            session.is_active = false;
                            revoked.push(id);
                        }
                    }
                }
            }

            let now = self.clock.now();
            for id in &revoked {
                self.clear_pending(id)?;
                self.audit.record(
                    id,
                    now,
                    AuditEvent::new("session_revoked", format!("by={caller} bulk=true")),
                )?;
            }
            info!(owner = %owner, by = %caller, revoked = revoked.len(), "Owner sessions revoked");
            Ok(revoked.len())
        })
    }

    /// Check a signed operation against the session and consume its signature.
    ///
    /// Not idempotent: the digest/signature pair is marked used, so verifying
    /// the identical call again fails with a replay error. The pair stays
    /// reserved for this session until `execute_operation` applies it.
    pub fn verify_operation(
        &self,
        session_id: &str,
        op: &SignedOperation,
    ) -> Result<OperationDigest, RebalancerError> {
        let owner = self.require_session(session_id)?.owner;
        self.locks.with_lock(owner.as_str(), || {
            let session = self.require_session(session_id)?;
            let digest = self.check_operation(&session, op, self.clock.now())?;
            let key = digest.signature_key(&op.signature);

            {
                let mut used = self.lock_used()?;
                if !used.insert(key.clone()) {
                    warn!(session_id = %session_id, nonce = op.nonce, "Replayed signature rejected");
                    return Err(RebalancerError::SignatureReused);
                }
            }
            self.pending
                .write()
                .map_err(|_| RebalancerError::LockPoisoned("pending reservations"))?
                .insert(session_id.to_string(), key);

            debug!(session_id = %session_id, nonce = op.nonce, "Operation verified");
            self.audit.record(
                session_id,
                self.clock.now(),
                AuditEvent::new(
                    "operation_verified",
                    format!("nonce={} digest={}", op.nonce, digest.to_hex()),
                ),
            )?;
            Ok(digest)
        })
    }

    /// Delegate-only. Re-checks the operation, then advances nonce and op count.
    ///
    /// Accepts the signature this session reserved in `verify_operation`, or a
    /// fresh signature that was never accepted anywhere.
    pub fn execute_operation(
        &self,
        caller: &Identity,
        session_id: &str,
        op: &SignedOperation,
        reference: &str,
    ) -> Result<DelegationSession, RebalancerError> {
        let session = self.require_session(session_id)?;
        if caller != &session.delegate {
            return Err(RebalancerError::unauthorized(caller, "the session delegate"));
        }

        self.locks.with_lock(session.owner.as_str(), || {
            let mut session = self.require_session(session_id)?;
            let digest = self.check_operation(&session, op, self.clock.now())?;
            let key = digest.signature_key(&op.signature);

            let reserved = self.pending_for(session_id)?.as_deref() == Some(key.as_str());
            if !reserved && !self.lock_used()?.insert(key) {
                warn!(session_id = %session_id, nonce = op.nonce, "Replayed signature rejected");
                return Err(RebalancerError::SignatureReused);
            }

            session.nonce += 1;
            session.used_ops += 1;
            self.write_sessions()?
                .insert(session_id.to_string(), session.clone());
            self.clear_pending(session_id)?;

            info!(
                session_id = %session_id,
                nonce = op.nonce,
                used_ops = session.used_ops,
                reference = %reference,
                "Operation executed"
            );
            self.audit.record(
                session_id,
                self.clock.now(),
                AuditEvent::new(
                    "operation_executed",
                    format!("nonce={} op={:?} ref={reference}", op.nonce, op.op_type),
                ),
            )?;
            Ok(session)
        })
    }

    /// Apply `ops` in order, all or nothing.
    ///
    /// Nonce and op count are staged on a copy of the session; neither the
    /// session nor the used-signature set changes unless every op validates.
    pub fn batch_execute_operations(
        &self,
        caller: &Identity,
        session_id: &str,
        ops: &[SignedOperation],
        references: &[String],
    ) -> Result<DelegationSession, RebalancerError> {
        if ops.len() != references.len() {
            return Err(RebalancerError::LengthMismatch {
                expected: ops.len(),
                actual: references.len(),
            });
        }
        if ops.is_empty() {
            return Err(RebalancerError::InvalidInput(
                "batch must contain at least one operation".to_string(),
            ));
        }

        let session = self.require_session(session_id)?;
        if caller != &session.delegate {
            return Err(RebalancerError::unauthorized(caller, "the session delegate"));
        }

        self.locks.with_lock(session.owner.as_str(), || {
            let session = self.require_session(session_id)?;
            let now = self.clock.now();
            let status = session.status_at(now);
            if status != SessionStatus::Active {
                return Err(RebalancerError::SessionInvalid {
                    id: session_id.to_string(),
                    reason: status.name(),
                });
            }
            if ops.len() > session.remaining_ops() as usize {
                return Err(RebalancerError::OperationCapExceeded {
                    id: session_id.to_string(),
                    requested: ops.len(),
                    remaining: session.remaining_ops(),
                });
            }

            let reserved = self.pending_for(session_id)?;
            let mut staged = session.clone();
            let mut keys = Vec::with_capacity(ops.len());
            let mut seen = BTreeSet::new();
            for op in ops {
                let digest = self.check_operation(&staged, op, now)?;
                let key = digest.signature_key(&op.signature);
                if !seen.insert(key.clone()) {
                    return Err(RebalancerError::SignatureReused);
                }
                keys.push(key);
                staged.nonce += 1;
                staged.used_ops += 1;
            }

            {
                let mut used = self.lock_used()?;
                let fresh: Vec<&String> = keys
                    .iter()
                    .filter(|key| reserved.as_deref() != Some(key.as_str()))
                    .collect();
                if fresh.iter().any(|key| used.contains(*key)) {
                    warn!(session_id = %session_id, "Batch contains a replayed signature");
                    return Err(RebalancerError::SignatureReused);
                }
                for key in fresh {
                    used.insert(key.clone());
                }
            }

            self.write_sessions()?
                .insert(session_id.to_string(), staged.clone());
            if reserved.is_some_and(|key| keys.contains(&key)) {
                self.clear_pending(session_id)?;
            }

            info!(
                session_id = %session_id,
                ops = ops.len(),
                nonce = staged.nonce,
                "Batch executed"
            );
            self.audit.record(
                session_id,
                now,
                AuditEvent::new(
                    "batch_executed",
                    format!(
                        "ops={} first_nonce={} refs={}",
                        ops.len(),
                        session.nonce,
                        references.join(",")
                    ),
                ),
            )?;
            Ok(staged)
        })
    }

    pub fn is_session_valid(&self, id: &str) -> bool {
        let now = self.clock.now();
        self.get_session(id)
            .ok()
            .flatten()
            .map(|session| session.is_valid_at(now))
            .unwrap_or(false)
    }

    /// Number of sessions ever issued to `owner`.
    pub fn get_nonce(&self, owner: &Identity) -> u64 {
        self.counters
            .read()
            .ok()
            .and_then(|counters| counters.get(owner).copied())
            .unwrap_or(0)
    }

    /// Next expected operation nonce of a session.
    pub fn session_nonce(&self, id: &str) -> Option<u64> {
        self.get_session(id).ok().flatten().map(|s| s.nonce)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<DelegationSession>, RebalancerError> {
        Ok(self
            .sessions
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("sessions"))?
            .get(id)
            .cloned())
    }

    pub fn sessions_for(&self, owner: &Identity) -> Result<Vec<DelegationSession>, RebalancerError> {
        let ids = self
            .owner_sessions
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("owner sessions"))?
            .get(owner)
            .cloned()
            .unwrap_or_default();
        let sessions = self
            .sessions
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("sessions"))?;
        Ok(ids.iter().filter_map(|id| sessions.get(id).cloned()).collect())
    }

    pub fn snapshot(&self) -> Result<SessionAuthoritySnapshot, RebalancerError> {
        let mut sessions: Vec<DelegationSession> = self
            .sessions
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("sessions"))?
            .values()
            .cloned()
            .collect();
        sessions.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));

        let mut counters: Vec<SessionCounter> = self
            .counters
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("session counters"))?
            .iter()
            .map(|(owner, issued)| SessionCounter {
                owner: owner.clone(),
                issued: *issued,
            })
            .collect();
        counters.sort_by(|a, b| a.owner.cmp(&b.owner));

        let mut used_signatures: Vec<String> = self.lock_used()?.iter().cloned().collect();
        used_signatures.sort();

        let mut pending: Vec<PendingReservation> = self
            .pending
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("pending reservations"))?
            .iter()
            .map(|(session_id, signature_key)| PendingReservation {
                session_id: session_id.clone(),
                signature_key: signature_key.clone(),
            })
            .collect();
        pending.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        Ok(SessionAuthoritySnapshot {
            sessions,
            counters,
            used_signatures,
            pending,
        })
    }

    pub fn restore(&self, snapshot: SessionAuthoritySnapshot) -> Result<(), RebalancerError> {
        let mut by_owner: HashMap<Identity, Vec<String>> = HashMap::new();
        for session in &snapshot.sessions {
            by_owner
                .entry(session.owner.clone())
                .or_default()
                .push(session.id.clone());
        }

        *self.write_sessions()? = snapshot
            .sessions
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect();
        *self
            .owner_sessions
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("owner sessions"))? = by_owner;
        *self
            .counters
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("session counters"))? = snapshot
            .counters
            .into_iter()
            .map(|c| (c.owner, c.issued))
            .collect();
        *self.lock_used()? = snapshot.used_signatures.into_iter().collect();
        *self
            .pending
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("pending reservations"))? = snapshot
            .pending
            .into_iter()
            .map(|p| (p.session_id, p.signature_key))
            .collect();
        Ok(())
    }

    /// Every non-replay check shared by verify, execute and batch.
    fn check_operation(
        &self,
        session: &DelegationSession,
        op: &SignedOperation,
        now: DateTime<Utc>,
    ) -> Result<OperationDigest, RebalancerError> {
        let status = session.status_at(now);
        if status != SessionStatus::Active {
            return Err(RebalancerError::SessionInvalid {
                id: session.id.clone(),
                reason: status.name(),
            });
        }
        if op.owner != session.owner {
            return Err(RebalancerError::unauthorized(&op.owner, "the session owner"));
        }
        if op.delegate != session.delegate {
            return Err(RebalancerError::unauthorized(
                &op.delegate,
                "the session delegate",
            ));
        }
        if op.nonce != session.nonce {
            return Err(RebalancerError::NonceMismatch {
                expected: session.nonce,
                actual: op.nonce,
            });
        }

        let digest = operation_digest(op, &session.policy_hash)?;
        if !self.verifier.verify(&digest, &op.signature, &session.owner) {
            return Err(RebalancerError::InvalidSignature {
                owner: session.owner.clone(),
            });
        }
        Ok(digest)
    }

    fn require_session(&self, id: &str) -> Result<DelegationSession, RebalancerError> {
        self.get_session(id)?
            .ok_or_else(|| RebalancerError::SessionNotFound(id.to_string()))
    }

    fn pending_for(&self, session_id: &str) -> Result<Option<String>, RebalancerError> {
        Ok(self
            .pending
            .read()
            .map_err(|_| RebalancerError::LockPoisoned("pending reservations"))?
            .get(session_id)
            .cloned())
    }

    fn clear_pending(&self, session_id: &str) -> Result<(), RebalancerError> {
        self.pending
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("pending reservations"))?
            .remove(session_id);
        Ok(())
    }

    fn lock_used(&self) -> Result<std::sync::MutexGuard<'_, HashSet<String>>, RebalancerError> {
        self.used_signatures
            .lock()
            .map_err(|_| RebalancerError::LockPoisoned("used signatures"))
    }

    fn write_sessions(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, DelegationSession>>, RebalancerError>
    {
        self.sessions
            .write()
            .map_err(|_| RebalancerError::LockPoisoned("sessions"))
    }
}

fn session_id(owner: &Identity, delegate: &Identity, counter: u64, created_at: DateTime<Utc>) -> String {
    let material = serde_json::json!({
        "owner": owner,
        "delegate": delegate,
        "counter": counter,
        "created_at": created_at.to_rfc3339(),
    });
    format!(
        "sess-{}",
        blake3::hash(material.to_string().as_bytes()).to_hex()
    )
}
