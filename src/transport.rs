//! Envelope transport: server-side processing and client-side negotiation
//!
//! The server turns one verified request envelope into one signed
//! response envelope, with all state changes committed atomically before
//! the response leaves. Duplicate request ids replay the recorded bytes
//! verbatim, so retries are always safe for the caller.
//!
//! The client drives a command to its terminal state: apply local policy,
//! exchange views with the counterparty under an exponential backoff
//! budget, and hand off to the settlement bridge once both parties are
//! ready. Each in-flight command is driven by its own task.

use crate::canonical::metadata_signature_message;
use crate::config::EngineConfig;
use crate::crypto::{verify_signature, KeyPair};
use crate::error::{Error, Result, WireError};
use crate::metrics::Metrics;
use crate::protocol::{
    apply_policy, decide, merge_remote, resolve_roles, validate_structure, CompliancePolicy,
    NextAction,
};
use crate::settlement::{LedgerClient, SettlementBridge};
use crate::store::{CommandStore, Disposition};
use crate::types::{
    ActorObject, ActorRole, ActorStatus, CommandEnvelope, CommandPayload, CommandState,
    PaymentCommand, ResponseEnvelope, ResponseStatus, Signature,
};
use async_trait::async_trait;
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Transport seam: delivers request bytes to a counterparty and returns
/// its response bytes. HTTP, gRPC or in-process, the engine does not care.
#[async_trait]
pub trait OffchainChannel: Send + Sync {
    /// Deliver a request envelope to the counterparty's endpoint
    async fn call(&self, counterparty_address: &str, request: &[u8]) -> Result<Vec<u8>>;
}

/// Processes inbound request envelopes for one party
pub struct EnvelopeServer {
    local_address: String,
    keypair: Arc<KeyPair>,
    store: Arc<CommandStore>,
    ledger: Arc<dyn LedgerClient>,
    policy: Arc<dyn CompliancePolicy>,
    metrics: Metrics,
}

impl EnvelopeServer {
    /// Create a server for the party at `local_address`
    pub fn new(
        local_address: impl Into<String>,
        keypair: Arc<KeyPair>,
        store: Arc<CommandStore>,
        ledger: Arc<dyn LedgerClient>,
        policy: Arc<dyn CompliancePolicy>,
        metrics: Metrics,
    ) -> Self {
        Self {
            local_address: local_address.into(),
            keypair,
            store,
            ledger,
            policy,
            metrics,
        }
    }

    /// Process one inbound request. Always produces signed response bytes;
    /// rejected requests come back as signed failure envelopes. An `Err`
    /// here means local storage failed and nothing can be sent.
    pub async fn handle(&self, request: &[u8]) -> Result<Vec<u8>> {
        self.metrics.envelopes_total.inc();

        let raw: serde_json::Value = match serde_json::from_slice(request) {
            Ok(value) => value,
            Err(e) => {
                return self.failure(
                    Uuid::nil(),
                    WireError::protocol("invalid_request", format!("malformed envelope: {e}")),
                )
            }
        };

        // Best-effort request id for error attribution
        let request_id = raw
            .get("request_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or(Uuid::nil());

        // Closed command set: unknown types are rejected before full decode
        match raw.pointer("/command/command_type").and_then(|v| v.as_str()) {
            Some("PaymentCommand") => {}
            Some(other) => {
                return self.failure(
                    request_id,
                    WireError::protocol(
                        "unknown_command_type",
                        format!("unsupported command_type {other}"),
                    )
                    .with_field("command.command_type"),
                )
            }
            None => {
                return self.failure(
                    request_id,
                    WireError::protocol("invalid_request", "command.command_type is required")
                        .with_field("command.command_type"),
                )
            }
        }

        let envelope: CommandEnvelope = match serde_json::from_value(raw) {
            Ok(envelope) => envelope,
            Err(e) => {
                return self.failure(
                    request_id,
                    WireError::protocol("invalid_request", format!("malformed envelope: {e}")),
                )
            }
        };

        match self.process(&envelope).await {
            Ok(bytes) => Ok(bytes),
            Err(e @ (Error::Storage(_) | Error::Io(_))) => Err(e),
            Err(e) => {
                tracing::warn!(
                    request_id = %envelope.request_id,
                    sender = %envelope.sender_address,
                    error = %e,
                    "Request rejected"
                );
                self.failure(envelope.request_id, e.to_wire())
            }
        }
    }

    async fn process(&self, envelope: &CommandEnvelope) -> Result<Vec<u8>> {
        let public_key = self
            .ledger
            .resolve_compliance_key(&envelope.sender_address)
            .await
            .map_err(|e| {
                Error::InvalidSignature(format!(
                    "no compliance key for {}: {e}",
                    envelope.sender_address
                ))
            })?;
        if !verify_signature(&envelope.signing_bytes(), &envelope.signature, &public_key) {
            return Err(Error::InvalidSignature(format!(
                "envelope from {} does not verify",
                envelope.sender_address
            )));
        }

        let incoming = envelope.command.payment();
        validate_structure(incoming)?;
        let remote_role = resolve_roles(incoming, &envelope.sender_address, &self.local_address)?;
        let local_role = remote_role.other();

        loop {
            // A request id that was already answered replays the recorded
            // bytes; the signed-over content has already been verified.
            if let Some(bytes) = self.store.get_response(envelope.request_id)? {
                self.metrics.replays_total.inc();
                tracing::debug!(
                    request_id = %envelope.request_id,
                    "Replaying recorded response"
                );
                return Ok(bytes);
            }

            let existing = self.store.get_command(incoming.command_id)?;
            let (mut view, expected, disposition) = match &existing {
                Some(record) => {
                    let merged = merge_remote(&record.command, incoming, local_role)?;
                    (merged, Some(record.version), record.disposition)
                }
                None => {
                    ensure_pristine_actor(incoming.actor(local_role))?;
                    (incoming.clone(), None, Disposition::InFlight)
                }
            };

            let decision = self.policy.review(&view, local_role);
            attach_settlement_authorization(&self.keypair, &mut view, local_role, &decision)?;
            apply_policy(&mut view, local_role, decision)?;

            // An abort closes the negotiation on both sides
            let disposition = if view.state() == CommandState::Aborted {
                Disposition::Archived
            } else {
                disposition
            };

            let mut response = ResponseEnvelope {
                request_id: envelope.request_id,
                responder_address: self.local_address.clone(),
                status: ResponseStatus::Success,
                command: Some(view.clone()),
                error: None,
                signature: Signature::from_bytes([0u8; 64]),
            };
            response.signature = self.keypair.sign(&response.signing_bytes());
            let bytes = serde_json::to_vec(&response)?;

            let unchanged = existing
                .as_ref()
                .map(|r| r.command == view && r.disposition == disposition)
                .unwrap_or(false);

            let committed = if unchanged {
                // Nothing to write for the command; record the response so
                // retries of this request id stay byte-identical.
                self.store.record_response(envelope.request_id, &bytes)?;
                self.store
                    .get_response(envelope.request_id)?
                    .unwrap_or(bytes)
            } else {
                match self.store.commit(
                    &view,
                    expected,
                    disposition,
                    Some((envelope.request_id, &bytes)),
                ) {
                    Ok(_) => bytes,
                    Err(Error::Conflict(_)) => {
                        self.metrics.merge_conflicts_total.inc();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            };

            tracing::info!(
                command_id = %view.command_id,
                request_id = %envelope.request_id,
                state = ?view.state(),
                "Envelope processed"
            );
            return Ok(committed);
        }
    }

    fn failure(&self, request_id: Uuid, error: WireError) -> Result<Vec<u8>> {
        let mut response = ResponseEnvelope {
            request_id,
            responder_address: self.local_address.clone(),
            status: ResponseStatus::Failure,
            command: None,
            error: Some(error),
            signature: Signature::from_bytes([0u8; 64]),
        };
        response.signature = self.keypair.sign(&response.signing_bytes());
        Ok(serde_json::to_vec(&response)?)
    }
}

impl std::fmt::Debug for EnvelopeServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvelopeServer")
            .field("local_address", &self.local_address)
            .finish_non_exhaustive()
    }
}

/// The first envelope for a command must not pre-populate the recipient's
/// own actor record.
fn ensure_pristine_actor(actor: &ActorObject) -> Result<()> {
    if actor.kyc_data.is_some()
        || actor.metadata_signature.is_some()
        || actor.status != ActorStatus::NeedsKycData
    {
        return Err(Error::InvalidTransition(
            "initial envelope pre-populates the counterparty actor".to_string(),
        ));
    }
    Ok(())
}

/// Sign and attach the settlement metadata when the receiving party is
/// about to authorize settlement. Must happen before the status moves,
/// since a terminal view rejects further mutation.
fn attach_settlement_authorization(
    keypair: &KeyPair,
    view: &mut PaymentCommand,
    local_role: ActorRole,
    decision: &crate::protocol::PolicyDecision,
) -> Result<()> {
    if local_role == ActorRole::Receiver
        && matches!(decision.status, Some(ActorStatus::ReadyForSettlement))
        && view.receiver.metadata_signature.is_none()
        && !view.is_terminal()
    {
        let signature = keypair.sign(&metadata_signature_message(view));
        view.attach_metadata_signature(ActorRole::Receiver, signature.to_hex())?;
    }
    Ok(())
}

/// Drives outbound negotiations for one party
pub struct NegotiationClient {
    config: EngineConfig,
    keypair: Arc<KeyPair>,
    store: Arc<CommandStore>,
    channel: Arc<dyn OffchainChannel>,
    ledger: Arc<dyn LedgerClient>,
    policy: Arc<dyn CompliancePolicy>,
    bridge: SettlementBridge,
    metrics: Metrics,
    tasks: DashMap<Uuid, JoinHandle<()>>,
}

impl NegotiationClient {
    /// Create a client. The settlement bridge is built from the same
    /// store and ledger handles.
    pub fn new(
        config: EngineConfig,
        keypair: Arc<KeyPair>,
        store: Arc<CommandStore>,
        channel: Arc<dyn OffchainChannel>,
        ledger: Arc<dyn LedgerClient>,
        policy: Arc<dyn CompliancePolicy>,
        metrics: Metrics,
    ) -> Self {
        let bridge = SettlementBridge::new(
            store.clone(),
            ledger.clone(),
            config.settlement.clone(),
            config.local_address.clone(),
            metrics.clone(),
        );
        Self {
            config,
            keypair,
            store,
            channel,
            ledger,
            policy,
            bridge,
            metrics,
            tasks: DashMap::new(),
        }
    }

    /// Settlement bridge for this party, for resuming pending confirmations
    pub fn bridge(&self) -> &SettlementBridge {
        &self.bridge
    }

    /// Create and persist a new command with the local party as sender.
    /// Negotiation starts when the command is driven.
    pub fn create_command(
        &self,
        reference_id: impl Into<String>,
        receiver_address: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Result<PaymentCommand> {
        let command = PaymentCommand::new(
            reference_id,
            self.config.local_address.clone(),
            receiver_address,
            amount,
            currency,
        );
        validate_structure(&command)?;
        self.store
            .compare_and_put(&command, None, Disposition::InFlight)?;

        tracing::info!(
            command_id = %command.command_id,
            reference_id = %command.reference_id,
            "Command created"
        );
        Ok(command)
    }

    /// Drive a command until it terminates or stalls.
    ///
    /// Each iteration applies local policy, exchanges views with the
    /// counterparty when the local view changed, and hands a READY
    /// command to the settlement bridge. Returns the terminal action.
    pub async fn negotiate(&self, command_id: Uuid) -> Result<NextAction> {
        let mut last_sent_version = 0u64;

        loop {
            let record = self.store.must_get_command(command_id)?;
            let mut view = record.command.clone();
            let local_role = view.role_of(&self.config.local_address).ok_or_else(|| {
                Error::InvalidTransition(format!(
                    "local party {} is not an actor of command {command_id}",
                    self.config.local_address
                ))
            })?;

            let decision = self.policy.review(&view, local_role);
            attach_settlement_authorization(&self.keypair, &mut view, local_role, &decision)?;
            let changed = apply_policy(&mut view, local_role, decision)?;

            let mut version = record.version;
            if changed {
                match self
                    .store
                    .compare_and_put(&view, Some(version), record.disposition)
                {
                    Ok(v) => version = v,
                    Err(Error::Conflict(_)) => {
                        self.metrics.merge_conflicts_total.inc();
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }

            match decide(&view, local_role) {
                NextAction::Settle => {
                    // Share the final ready view before funding; losing
                    // this exchange is tolerable, the counterparty recovers
                    // it from the ledger.
                    if version > last_sent_version {
                        if let Err(e) = self.exchange(&view, local_role).await {
                            tracing::warn!(
                                command_id = %command_id,
                                error = %e,
                                "Final view exchange failed, settling anyway"
                            );
                        }
                    }
                    self.bridge.settle(command_id).await?;
                    return Ok(NextAction::Settle);
                }
                halt @ NextAction::Halt { .. } => {
                    self.store
                        .set_disposition(command_id, Disposition::Archived)?;
                    return Ok(halt);
                }
                NextAction::ManualReview => return Ok(NextAction::ManualReview),
                NextAction::SupplyKycData => return Err(Error::KycDataRequired(command_id)),
                NextAction::Send | NextAction::Wait => {
                    if version > last_sent_version {
                        let remote_view = self.exchange(&view, local_role).await?;
                        last_sent_version = version;
                        self.apply_remote_view(command_id, &remote_view, local_role)?;
                        continue;
                    }
                    return Ok(NextAction::Wait);
                }
            }
        }
    }

    /// Drive a command on its own task. At most one task per command id;
    /// the task unregisters itself when the negotiation finishes.
    pub fn spawn_negotiation(self: &Arc<Self>, command_id: Uuid) {
        if self.tasks.contains_key(&command_id) {
            return;
        }
        let client = Arc::clone(self);
        let handle = tokio::spawn(async move {
            match client.negotiate(command_id).await {
                Ok(action) => {
                    tracing::info!(command_id = %command_id, action = ?action, "Negotiation finished")
                }
                Err(e) => {
                    tracing::warn!(command_id = %command_id, error = %e, "Negotiation failed")
                }
            }
            client.tasks.remove(&command_id);
        });
        self.tasks.insert(command_id, handle);
    }

    /// Number of negotiations currently running on their own tasks
    pub fn active_negotiations(&self) -> usize {
        self.tasks.len()
    }

    /// Stop driving a command. Stored state is untouched; a later
    /// `spawn_negotiation` resumes from the durable view.
    pub fn cancel(&self, command_id: Uuid) {
        if let Some((_, handle)) = self.tasks.remove(&command_id) {
            handle.abort();
            tracing::info!(command_id = %command_id, "Negotiation cancelled");
        }
    }

    /// Abort every running negotiation task
    pub fn shutdown(&self) {
        self.tasks.retain(|command_id, handle| {
            handle.abort();
            tracing::debug!(command_id = %command_id, "Negotiation task stopped");
            false
        });
    }

    /// Send the local view and return the counterparty's verified view.
    /// Exhausting the retry budget marks the command stalled.
    async fn exchange(
        &self,
        view: &PaymentCommand,
        local_role: ActorRole,
    ) -> Result<PaymentCommand> {
        let counterparty = view.actor(local_role.other()).address.clone();

        let mut envelope = CommandEnvelope {
            request_id: Uuid::new_v4(),
            sender_address: self.config.local_address.clone(),
            command: CommandPayload::Payment(view.clone()),
            signature: Signature::from_bytes([0u8; 64]),
        };
        envelope.signature = self.keypair.sign(&envelope.signing_bytes());
        let request_bytes = serde_json::to_vec(&envelope)?;

        let sent = backoff::future::retry(self.config.retry.backoff(), || {
            let request_bytes = request_bytes.clone();
            let counterparty = counterparty.clone();
            async move {
                self.channel
                    .call(&counterparty, &request_bytes)
                    .await
                    .map_err(backoff::Error::transient)
            }
        })
        .await;

        let response_bytes = match sent {
            Ok(bytes) => bytes,
            Err(e) => {
                self.store
                    .set_disposition(view.command_id, Disposition::Stalled)?;
                self.metrics.commands_stalled_total.inc();
                tracing::warn!(
                    command_id = %view.command_id,
                    counterparty = %counterparty,
                    "Retry budget exhausted, command stalled"
                );
                return Err(Error::TransportTimeout(e.to_string()));
            }
        };

        self.verify_response(&envelope, &counterparty, &response_bytes)
            .await
    }

    async fn verify_response(
        &self,
        request: &CommandEnvelope,
        counterparty: &str,
        response_bytes: &[u8],
    ) -> Result<PaymentCommand> {
        let response: ResponseEnvelope = serde_json::from_slice(response_bytes)?;

        if response.request_id != request.request_id {
            return Err(Error::InvalidSignature(format!(
                "response echoes request {} instead of {}",
                response.request_id, request.request_id
            )));
        }
        if response.responder_address != counterparty {
            return Err(Error::InvalidSignature(format!(
                "response signed by {} instead of {counterparty}",
                response.responder_address
            )));
        }

        let public_key = self.ledger.resolve_compliance_key(counterparty).await?;
        if !verify_signature(&response.signing_bytes(), &response.signature, &public_key) {
            return Err(Error::InvalidSignature(format!(
                "response from {counterparty} does not verify"
            )));
        }

        match response.status {
            ResponseStatus::Failure => Err(response
                .error
                .map(WireError::into_error)
                .unwrap_or_else(|| {
                    Error::Other("failure response without error object".to_string())
                })),
            ResponseStatus::Success => response
                .command
                .ok_or_else(|| Error::MissingField("command".to_string())),
        }
    }

    /// Merge a counterparty's verified view into the stored record
    fn apply_remote_view(
        &self,
        command_id: Uuid,
        remote_view: &PaymentCommand,
        local_role: ActorRole,
    ) -> Result<()> {
        loop {
            let record = self.store.must_get_command(command_id)?;
            let merged = merge_remote(&record.command, remote_view, local_role)?;
            if merged == record.command {
                return Ok(());
            }
            match self
                .store
                .compare_and_put(&merged, Some(record.version), record.disposition)
            {
                Ok(_) => return Ok(()),
                Err(Error::Conflict(_)) => {
                    self.metrics.merge_conflicts_total.inc();
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl std::fmt::Debug for NegotiationClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NegotiationClient")
            .field("local_address", &self.config.local_address)
            .field("active_negotiations", &self.tasks.len())
            .finish_non_exhaustive()
    }
}
