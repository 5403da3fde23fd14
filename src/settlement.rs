//! Ledger submission bridge
//!
//! Fires once per command when negotiation reaches READY. Submission is
//! gated by a reference-id idempotency check against ledger history, so a
//! restart or a second caller never double-funds a transfer. Confirmation
//! is polled with a bounded deadline; an unconfirmed submission leaves the
//! command in `PendingConfirmation` for safe resumption.

use crate::canonical::metadata_signature_message;
use crate::config::SettlementConfig;
use crate::crypto::verify_signature;
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::store::{CommandStore, Disposition};
use crate::types::{ActorRole, CommandState, PaymentCommand, Signature};
use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Funding transaction handed to the external ledger client. The codec
/// for the on-ledger representation is the client's concern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingTransaction {
    /// Settlement idempotency key, embedded in the transaction metadata
    pub reference_id: String,

    /// Debited address
    pub sender_address: String,

    /// Credited address
    pub receiver_address: String,

    /// Transfer amount
    pub amount: Decimal,

    /// ISO 4217 currency code
    pub currency: String,

    /// Metadata bytes binding the transaction to the negotiation
    pub metadata: Vec<u8>,

    /// Receiver's compliance-key signature over the metadata
    pub metadata_signature: Vec<u8>,
}

/// Execution outcome of an on-ledger transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionStatus {
    /// Transaction executed successfully
    Executed,
    /// Transaction executed with an error status
    Failed(String),
}

/// A transaction observed on the ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Transaction hash
    pub txn_hash: String,

    /// Execution outcome
    pub status: ExecutionStatus,

    /// Reference id carried in the transaction metadata, if any
    pub reference_id: Option<String>,
}

/// External ledger collaborator. Consumed, never implemented here.
#[async_trait]
pub trait LedgerClient: Send + Sync {
    /// Submit a funding transaction, returning its hash
    async fn submit_transaction(&self, txn: &FundingTransaction) -> Result<String>;

    /// Fetch a transaction by hash. With `wait`, blocks up to `timeout`
    /// for the transaction to appear and execute.
    async fn get_transaction(
        &self,
        txn_hash: &str,
        wait: bool,
        timeout: Duration,
    ) -> Result<Option<ExecutionResult>>;

    /// Look up a funding transaction by the reference id in its metadata
    async fn find_transaction_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<ExecutionResult>>;

    /// Resolve the registered compliance public key for an address
    async fn resolve_compliance_key(&self, address: &str) -> Result<[u8; 32]>;
}

/// Hands a READY command off to the ledger, exactly once per reference id
pub struct SettlementBridge {
    store: Arc<CommandStore>,
    ledger: Arc<dyn LedgerClient>,
    config: SettlementConfig,
    local_address: String,
    metrics: Metrics,
}

impl SettlementBridge {
    /// Create a new bridge
    pub fn new(
        store: Arc<CommandStore>,
        ledger: Arc<dyn LedgerClient>,
        config: SettlementConfig,
        local_address: impl Into<String>,
        metrics: Metrics,
    ) -> Self {
        Self {
            store,
            ledger,
            config,
            local_address: local_address.into(),
            metrics,
        }
    }

    /// Settle a READY command.
    ///
    /// The sending party submits the funding transaction; the receiving
    /// party only watches for it. Both archive the command once execution
    /// is confirmed. Returns the resulting disposition.
    pub async fn settle(&self, command_id: uuid::Uuid) -> Result<Disposition> {
        let record = self.store.must_get_command(command_id)?;
        let view = record.command.clone();

        if view.state() != CommandState::Ready {
            return Err(Error::InvalidTransition(format!(
                "command {command_id} is not ready for settlement ({:?})",
                view.state()
            )));
        }
        if record.disposition.is_final() {
            return Ok(record.disposition);
        }

        // Idempotency gate: never resubmit a reference id the ledger has
        // already seen.
        if let Some(result) = self
            .ledger
            .find_transaction_by_reference(&view.reference_id)
            .await?
        {
            return self.finalize(command_id, &result);
        }

        // A submission was already claimed for this command; observe its
        // outcome instead of funding again.
        if record.disposition == Disposition::PendingConfirmation {
            return self.resume(command_id).await;
        }

        let local_role = view.role_of(&self.local_address).ok_or_else(|| {
            Error::InvalidTransition(format!(
                "local party {} is not an actor of command {command_id}",
                self.local_address
            ))
        })?;

        if local_role != ActorRole::Sender {
            // The counterparty funds; wait for its transaction to appear.
            self.store
                .set_disposition(command_id, Disposition::PendingConfirmation)?;
            return Ok(Disposition::PendingConfirmation);
        }

        self.verify_receiver_authorization(&view).await?;
        let txn = build_funding_transaction(&view)?;

        // Claim the submission before it happens. The version CAS admits
        // exactly one driver; a loser observes the winner's outcome.
        match self.store.compare_and_put(
            &view,
            Some(record.version),
            Disposition::PendingConfirmation,
        ) {
            Ok(_) => {}
            Err(Error::Conflict(_)) => return self.resume(command_id).await,
            Err(e) => return Err(e),
        }

        let started = Instant::now();
        let txn_hash = match self.ledger.submit_transaction(&txn).await {
            Ok(hash) => hash,
            Err(e) => {
                // Release the claim so a later driver can retry; the
                // reference-id gate still protects against a submission
                // that reached the ledger despite the error.
                self.store.set_disposition(command_id, Disposition::Stalled)?;
                return Err(Error::LedgerSubmissionFailure(e.to_string()));
            }
        };

        tracing::info!(
            command_id = %command_id,
            reference_id = %view.reference_id,
            txn_hash = %txn_hash,
            "Funding transaction submitted"
        );

        match self.await_confirmation(&txn_hash).await? {
            Some(result) => {
                self.metrics
                    .settlement_duration
                    .observe(started.elapsed().as_secs_f64());
                self.finalize(command_id, &result)
            }
            // Confirmation timed out: a later poll or restart resumes
            // without resubmitting (the reference-id gate holds).
            None => Ok(Disposition::PendingConfirmation),
        }
    }

    /// Poll for the submitted transaction's execution until the
    /// confirmation deadline passes
    async fn await_confirmation(&self, txn_hash: &str) -> Result<Option<ExecutionResult>> {
        let deadline = Instant::now() + self.config.confirmation_timeout();
        loop {
            if let Some(result) = self
                .ledger
                .get_transaction(txn_hash, false, self.config.poll_interval())
                .await?
            {
                return Ok(Some(result));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Resume a command left in `PendingConfirmation`, e.g. after restart
    pub async fn resume(&self, command_id: uuid::Uuid) -> Result<Disposition> {
        let record = self.store.must_get_command(command_id)?;
        if record.disposition.is_final() {
            return Ok(record.disposition);
        }

        match self
            .ledger
            .find_transaction_by_reference(&record.command.reference_id)
            .await?
        {
            Some(result) => self.finalize(command_id, &result),
            None => Ok(record.disposition),
        }
    }

    async fn verify_receiver_authorization(&self, view: &PaymentCommand) -> Result<()> {
        let sig_hex = view.receiver.metadata_signature.as_deref().ok_or_else(|| {
            Error::MissingField("receiver.metadata_signature".to_string())
        })?;
        let signature = Signature::from_hex(sig_hex)
            .map_err(|e| Error::InvalidSignature(format!("receiver metadata signature: {e}")))?;

        let key = self
            .ledger
            .resolve_compliance_key(&view.receiver.address)
            .await?;
        let message = metadata_signature_message(view);

        if !verify_signature(&message, &signature, &key) {
            return Err(Error::InvalidSignature(
                "receiver metadata signature does not verify".to_string(),
            ));
        }
        Ok(())
    }

    fn finalize(&self, command_id: uuid::Uuid, result: &ExecutionResult) -> Result<Disposition> {
        match &result.status {
            ExecutionStatus::Executed => {
                self.store
                    .set_disposition(command_id, Disposition::Archived)?;
                self.metrics.commands_settled_total.inc();
                tracing::info!(
                    command_id = %command_id,
                    txn_hash = %result.txn_hash,
                    "Command settled and archived"
                );
                Ok(Disposition::Archived)
            }
            ExecutionStatus::Failed(reason) => {
                self.store.set_disposition(command_id, Disposition::Failed)?;
                Err(Error::LedgerExecutionError(reason.clone()))
            }
        }
    }
}

impl std::fmt::Debug for SettlementBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SettlementBridge")
            .field("local_address", &self.local_address)
            .finish_non_exhaustive()
    }
}

/// Build the funding transaction for a READY command
fn build_funding_transaction(view: &PaymentCommand) -> Result<FundingTransaction> {
    let sig_hex = view
        .receiver
        .metadata_signature
        .as_deref()
        .ok_or_else(|| Error::MissingField("receiver.metadata_signature".to_string()))?;
    let metadata_signature = hex::decode(sig_hex)
        .map_err(|e| Error::Serialization(format!("metadata signature hex: {e}")))?;

    Ok(FundingTransaction {
        reference_id: view.reference_id.clone(),
        sender_address: view.sender.address.clone(),
        receiver_address: view.receiver.address.clone(),
        amount: view.action.amount,
        currency: view.action.currency.clone(),
        metadata: metadata_signature_message(view),
        metadata_signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::crypto::KeyPair;
    use crate::mock::MockLedgerClient;
    use crate::types::ActorStatus;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;

    const SENDER: &str = "dm1sender";
    const RECEIVER: &str = "dm1receiver";

    fn ready_command(receiver_key: &KeyPair) -> PaymentCommand {
        let mut cmd = PaymentCommand::new("ref-settle", SENDER, RECEIVER, dec!(100.00), "USD");
        let sig = receiver_key.sign(&metadata_signature_message(&cmd));
        cmd.attach_metadata_signature(ActorRole::Receiver, sig.to_hex())
            .unwrap();
        cmd.set_status(ActorRole::Sender, ActorStatus::ReadyForSettlement)
            .unwrap();
        cmd.set_status(ActorRole::Receiver, ActorStatus::ReadyForSettlement)
            .unwrap();
        cmd
    }

    fn test_bridge(local_address: &str) -> (SettlementBridge, Arc<MockLedgerClient>, Arc<CommandStore>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let mut config = EngineConfig::default();
        config.data_dir = temp_dir.path().to_path_buf();
        config.settlement.confirmation_timeout_ms = 50;
        config.settlement.poll_interval_ms = 10;

        let store = Arc::new(CommandStore::open(&config).unwrap());
        let ledger = Arc::new(MockLedgerClient::new());
        let bridge = SettlementBridge::new(
            store.clone(),
            ledger.clone(),
            config.settlement.clone(),
            local_address,
            Metrics::new().unwrap(),
        );
        (bridge, ledger, store, temp_dir)
    }

    #[tokio::test]
    async fn test_settle_submits_and_archives() {
        let receiver_key = KeyPair::generate();
        let (bridge, ledger, store, _temp) = test_bridge(SENDER);
        ledger.register_key(RECEIVER, receiver_key.public_key());

        let cmd = ready_command(&receiver_key);
        store
            .compare_and_put(&cmd, None, Disposition::InFlight)
            .unwrap();

        let disposition = bridge.settle(cmd.command_id).await.unwrap();
        assert_eq!(disposition, Disposition::Archived);
        assert_eq!(ledger.submission_count(), 1);

        let submitted = ledger.submitted_transactions();
        assert_eq!(submitted[0].reference_id, "ref-settle");
    }

    #[tokio::test]
    async fn test_settle_is_idempotent_per_reference_id() {
        let receiver_key = KeyPair::generate();
        let (bridge, ledger, store, _temp) = test_bridge(SENDER);
        ledger.register_key(RECEIVER, receiver_key.public_key());

        let cmd = ready_command(&receiver_key);
        store
            .compare_and_put(&cmd, None, Disposition::InFlight)
            .unwrap();

        bridge.settle(cmd.command_id).await.unwrap();
        // Second call must hit the reference-id gate, not resubmit
        let disposition = bridge.settle(cmd.command_id).await.unwrap();
        assert_eq!(disposition, Disposition::Archived);
        assert_eq!(ledger.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_receiver_side_waits_for_sender_submission() {
        let receiver_key = KeyPair::generate();
        let (bridge, _ledger, store, _temp) = test_bridge(RECEIVER);

        let cmd = ready_command(&receiver_key);
        store
            .compare_and_put(&cmd, None, Disposition::InFlight)
            .unwrap();

        let disposition = bridge.settle(cmd.command_id).await.unwrap();
        assert_eq!(disposition, Disposition::PendingConfirmation);
    }

    #[tokio::test]
    async fn test_settle_rejects_non_ready_command() {
        let receiver_key = KeyPair::generate();
        let (bridge, _ledger, store, _temp) = test_bridge(SENDER);

        let cmd = PaymentCommand::new("ref-x", SENDER, RECEIVER, dec!(50.00), "USD");
        store
            .compare_and_put(&cmd, None, Disposition::InFlight)
            .unwrap();

        let result = bridge.settle(cmd.command_id).await;
        assert!(matches!(result, Err(Error::InvalidTransition(_))));
        drop(receiver_key);
    }

    #[tokio::test]
    async fn test_settle_requires_valid_receiver_signature() {
        let receiver_key = KeyPair::generate();
        let wrong_key = KeyPair::generate();
        let (bridge, ledger, store, _temp) = test_bridge(SENDER);
        // Ledger resolves a different key than the one that signed
        ledger.register_key(RECEIVER, wrong_key.public_key());

        let cmd = ready_command(&receiver_key);
        store
            .compare_and_put(&cmd, None, Disposition::InFlight)
            .unwrap();

        let result = bridge.settle(cmd.command_id).await;
        assert!(matches!(result, Err(Error::InvalidSignature(_))));
        assert_eq!(ledger.submission_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_settle_submits_once() {
        let receiver_key = KeyPair::generate();
        let (bridge, ledger, store, _temp) = test_bridge(SENDER);
        ledger.register_key(RECEIVER, receiver_key.public_key());
        // Slow the ledger down so both callers pass the reference-id
        // lookup before either submits
        ledger.set_latency(Duration::from_millis(20));

        let cmd = ready_command(&receiver_key);
        store
            .compare_and_put(&cmd, None, Disposition::InFlight)
            .unwrap();

        let (first, second) =
            tokio::join!(bridge.settle(cmd.command_id), bridge.settle(cmd.command_id));
        let first = first.unwrap();
        let second = second.unwrap();

        assert_eq!(ledger.submission_count(), 1);
        assert!(
            first == Disposition::Archived || second == Disposition::Archived,
            "one caller must drive the command to Archived, got {first:?} / {second:?}"
        );

        // Whoever lost the claim converges on the same outcome
        let disposition = bridge.settle(cmd.command_id).await.unwrap();
        assert_eq!(disposition, Disposition::Archived);
        assert_eq!(ledger.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_confirmation_timeout_resumes_without_resubmission() {
        let receiver_key = KeyPair::generate();
        let (bridge, ledger, store, _temp) = test_bridge(SENDER);
        ledger.register_key(RECEIVER, receiver_key.public_key());
        ledger.hold_confirmations();

        let cmd = ready_command(&receiver_key);
        store
            .compare_and_put(&cmd, None, Disposition::InFlight)
            .unwrap();

        // Submission goes through but confirmation never arrives within
        // the deadline
        let disposition = bridge.settle(cmd.command_id).await.unwrap();
        assert_eq!(disposition, Disposition::PendingConfirmation);
        assert_eq!(ledger.submission_count(), 1);
        assert_eq!(
            store.must_get_command(cmd.command_id).unwrap().disposition,
            Disposition::PendingConfirmation
        );

        // Neither resuming nor re-settling funds a second time while the
        // transaction is still unconfirmed
        assert_eq!(
            bridge.resume(cmd.command_id).await.unwrap(),
            Disposition::PendingConfirmation
        );
        assert_eq!(
            bridge.settle(cmd.command_id).await.unwrap(),
            Disposition::PendingConfirmation
        );
        assert_eq!(ledger.submission_count(), 1);

        // Once the execution becomes visible, resume archives
        ledger.release_confirmations();
        assert_eq!(
            bridge.resume(cmd.command_id).await.unwrap(),
            Disposition::Archived
        );
        assert_eq!(ledger.submission_count(), 1);
    }

    #[tokio::test]
    async fn test_resume_archives_once_confirmed() {
        let receiver_key = KeyPair::generate();
        let (bridge, ledger, store, _temp) = test_bridge(RECEIVER);

        let cmd = ready_command(&receiver_key);
        store
            .compare_and_put(&cmd, None, Disposition::InFlight)
            .unwrap();
        store
            .set_disposition(cmd.command_id, Disposition::PendingConfirmation)
            .unwrap();

        // Nothing on the ledger yet
        assert_eq!(
            bridge.resume(cmd.command_id).await.unwrap(),
            Disposition::PendingConfirmation
        );

        // Counterparty's transaction lands
        ledger.inject_executed("ref-settle");
        assert_eq!(
            bridge.resume(cmd.command_id).await.unwrap(),
            Disposition::Archived
        );
    }
}
