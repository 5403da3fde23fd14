//! In-process collaborator doubles for integration testing
//!
//! A loopback deployment: the ledger is a key registry plus an
//! auto-executing transaction log, the compliance policy is a canned
//! decision table, and the channel calls the counterparty's server
//! directly. Production deployments supply their own implementations of
//! the same traits.

use crate::error::{Error, Result};
use crate::protocol::{CompliancePolicy, PolicyDecision};
use crate::settlement::{ExecutionResult, ExecutionStatus, FundingTransaction, LedgerClient};
use crate::transport::{EnvelopeServer, OffchainChannel};
use crate::types::{ActorRole, ActorStatus, PaymentCommand};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Ledger double: a compliance-key registry and a transaction log where
/// every submission executes immediately (unless confirmations are held)
#[derive(Default)]
pub struct MockLedgerClient {
    keys: DashMap<String, [u8; 32]>,
    submissions: Mutex<Vec<FundingTransaction>>,
    by_hash: DashMap<String, ExecutionResult>,
    by_reference: DashMap<String, ExecutionResult>,
    latency: Mutex<Option<Duration>>,
    holding: Mutex<bool>,
    unconfirmed: Mutex<Vec<ExecutionResult>>,
}

impl MockLedgerClient {
    /// New empty ledger
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the compliance public key for an address
    pub fn register_key(&self, address: impl Into<String>, key: [u8; 32]) {
        self.keys.insert(address.into(), key);
    }

    /// Delay every submission and lookup, widening race windows in tests
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Accept submissions but keep their execution invisible to lookups
    /// until [`release_confirmations`](Self::release_confirmations)
    pub fn hold_confirmations(&self) {
        *self.holding.lock() = true;
    }

    /// Make every held execution visible
    pub fn release_confirmations(&self) {
        *self.holding.lock() = false;
        for result in self.unconfirmed.lock().drain(..) {
            if let Some(reference_id) = &result.reference_id {
                self.by_reference.insert(reference_id.clone(), result.clone());
            }
            self.by_hash.insert(result.txn_hash.clone(), result);
        }
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    /// Number of funding transactions submitted through this ledger
    pub fn submission_count(&self) -> usize {
        self.submissions.lock().len()
    }

    /// Copies of every submitted funding transaction, in order
    pub fn submitted_transactions(&self) -> Vec<FundingTransaction> {
        self.submissions.lock().clone()
    }

    /// Make an executed transaction for `reference_id` visible, as if the
    /// counterparty had submitted it out of band
    pub fn inject_executed(&self, reference_id: &str) {
        let result = ExecutionResult {
            txn_hash: format!("txn-{}", uuid::Uuid::new_v4().simple()),
            status: ExecutionStatus::Executed,
            reference_id: Some(reference_id.to_string()),
        };
        self.by_hash.insert(result.txn_hash.clone(), result.clone());
        self.by_reference.insert(reference_id.to_string(), result);
    }
}

#[async_trait]
impl LedgerClient for MockLedgerClient {
    async fn submit_transaction(&self, txn: &FundingTransaction) -> Result<String> {
        self.simulate_latency().await;

        let txn_hash = format!("txn-{}", uuid::Uuid::new_v4().simple());
        self.submissions.lock().push(txn.clone());

        let result = ExecutionResult {
            txn_hash: txn_hash.clone(),
            status: ExecutionStatus::Executed,
            reference_id: Some(txn.reference_id.clone()),
        };
        if *self.holding.lock() {
            self.unconfirmed.lock().push(result);
        } else {
            self.by_hash.insert(txn_hash.clone(), result.clone());
            self.by_reference.insert(txn.reference_id.clone(), result);
        }

        Ok(txn_hash)
    }

    async fn get_transaction(
        &self,
        txn_hash: &str,
        _wait: bool,
        _timeout: Duration,
    ) -> Result<Option<ExecutionResult>> {
        Ok(self.by_hash.get(txn_hash).map(|r| r.clone()))
    }

    async fn find_transaction_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<ExecutionResult>> {
        self.simulate_latency().await;
        Ok(self.by_reference.get(reference_id).map(|r| r.clone()))
    }

    async fn resolve_compliance_key(&self, address: &str) -> Result<[u8; 32]> {
        self.keys
            .get(address)
            .map(|k| *k)
            .ok_or_else(|| Error::Other(format!("no compliance key registered for {address}")))
    }
}

impl std::fmt::Debug for MockLedgerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockLedgerClient")
            .field("submissions", &self.submissions.lock().len())
            .finish_non_exhaustive()
    }
}

/// Review outcome a `StaticPolicy` settles on once the counterparty's
/// KYC payload is in hand
#[derive(Debug, Clone)]
enum ReviewOutcome {
    Approve,
    Reject { code: String },
}

/// Canned compliance policy: always attaches a fixed KYC payload, and
/// once the counterparty's payload arrives, either clears or declines.
#[derive(Debug, Clone)]
pub struct StaticPolicy {
    kyc_data: serde_json::Value,
    outcome: ReviewOutcome,
}

impl StaticPolicy {
    /// Policy that clears every counterparty
    pub fn approving(kyc_data: serde_json::Value) -> Self {
        Self {
            kyc_data,
            outcome: ReviewOutcome::Approve,
        }
    }

    /// Policy that declines every counterparty with the given abort code
    pub fn rejecting(kyc_data: serde_json::Value, code: impl Into<String>) -> Self {
        Self {
            kyc_data,
            outcome: ReviewOutcome::Reject { code: code.into() },
        }
    }
}

impl CompliancePolicy for StaticPolicy {
    fn review(&self, command: &PaymentCommand, local_role: ActorRole) -> PolicyDecision {
        let mut decision = PolicyDecision::default();

        if command.actor(local_role).kyc_data.is_none() {
            decision.kyc_data = Some(self.kyc_data.clone());
        }

        if command.actor(local_role.other()).kyc_data.is_some() {
            decision.status = Some(match &self.outcome {
                ReviewOutcome::Approve => ActorStatus::ReadyForSettlement,
                ReviewOutcome::Reject { code } => ActorStatus::Abort {
                    code: code.clone(),
                    message: Some("compliance review declined".to_string()),
                },
            });
        }

        decision
    }
}

/// Channel that hands the request straight to a counterparty's server
/// running in the same process
pub struct LoopbackChannel {
    servers: DashMap<String, Arc<EnvelopeServer>>,
}

impl LoopbackChannel {
    /// New empty loopback fabric
    pub fn new() -> Self {
        Self {
            servers: DashMap::new(),
        }
    }

    /// Attach a party's server under its address
    pub fn register(&self, address: impl Into<String>, server: Arc<EnvelopeServer>) {
        self.servers.insert(address.into(), server);
    }
}

impl Default for LoopbackChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OffchainChannel for LoopbackChannel {
    async fn call(&self, counterparty_address: &str, request: &[u8]) -> Result<Vec<u8>> {
        let server = self
            .servers
            .get(counterparty_address)
            .map(|s| s.clone())
            .ok_or_else(|| {
                Error::TransportTimeout(format!("no route to {counterparty_address}"))
            })?;
        server.handle(request).await
    }
}

impl std::fmt::Debug for LoopbackChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopbackChannel")
            .field("routes", &self.servers.len())
            .finish_non_exhaustive()
    }
}
