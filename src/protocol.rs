//! Negotiation state machine
//!
//! The core of the handshake: merging a verified remote view into the
//! local view and deciding the next action. Both operations are pure
//! functions of their inputs, which makes replay deterministic and the
//! merge confluent: out-of-order and duplicate delivery converge to the
//! same final view regardless of arrival order.
//!
//! Ownership rule: each actor record is writable only by that role's
//! party. A remote update may extend the remote-owned actor (set-once
//! fields, monotonically ranked status) and must carry the locally-owned
//! actor as a stale-or-current subset of what we already have.

use crate::error::{Error, Result};
use crate::types::{ActorObject, ActorRole, CommandState, PaymentCommand};

/// What the engine should do next for a command, derived purely from the
/// two actors' current status flags
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    /// Local view changed, transmit it to the counterparty
    Send,

    /// Counterparty requested KYC data the local party has not supplied
    SupplyKycData,

    /// Local compliance check was inconclusive; a human must resolve it
    ManualReview,

    /// Both actors ready, hand off to ledger submission
    Settle,

    /// Negotiation aborted; no further outbound envelopes
    Halt {
        /// Abort code from whichever actor aborted
        code: String,
        /// Optional detail
        message: Option<String>,
    },

    /// Nothing to do until the counterparty acts
    Wait,
}

/// Structural validation of a command payload. Fatal for the envelope on
/// failure; stored state is never touched.
pub fn validate_structure(command: &PaymentCommand) -> Result<()> {
    if command.reference_id.is_empty() {
        return Err(Error::MissingField("reference_id".to_string()));
    }
    if command.sender.address.is_empty() {
        return Err(Error::MissingField("sender.address".to_string()));
    }
    if command.receiver.address.is_empty() {
        return Err(Error::MissingField("receiver.address".to_string()));
    }
    if command.sender.address == command.receiver.address {
        return Err(Error::MissingField(
            "sender and receiver addresses must differ".to_string(),
        ));
    }
    if command.action.amount.is_sign_negative() || command.action.amount.is_zero() {
        return Err(Error::MissingField(
            "action.amount must be positive".to_string(),
        ));
    }
    if command.action.currency.len() != 3
        || !command.action.currency.bytes().all(|b| b.is_ascii_uppercase())
    {
        return Err(Error::MissingField(
            "action.currency must be an ISO 4217 code".to_string(),
        ));
    }
    Ok(())
}

/// Determine which role a verified request sender speaks for, and check
/// that the local party holds the opposite role.
pub fn resolve_roles(
    command: &PaymentCommand,
    request_sender_address: &str,
    local_address: &str,
) -> Result<ActorRole> {
    let remote_role = command.role_of(request_sender_address).ok_or_else(|| {
        Error::InvalidTransition(format!(
            "request sender {request_sender_address} is neither actor"
        ))
    })?;
    match command.role_of(local_address) {
        Some(local_role) if local_role == remote_role.other() => Ok(remote_role),
        _ => Err(Error::InvalidTransition(format!(
            "local party {local_address} does not hold the {} role",
            remote_role.other()
        ))),
    }
}

/// Merge a verified remote view into the local view.
///
/// Returns the converged view. Duplicate delivery is a no-op; conflicting
/// or destructive updates fail without partial application.
pub fn merge_remote(
    local: &PaymentCommand,
    remote: &PaymentCommand,
    local_role: ActorRole,
) -> Result<PaymentCommand> {
    ensure_immutable_header(local, remote)?;

    // Rule 1: the remote copy of the locally-owned actor may be stale but
    // never ahead of or divergent from ours.
    ensure_subset(local.actor(local_role), remote.actor(local_role)).map_err(|e| {
        Error::InvalidTransition(format!("update modifies the {local_role} actor: {e}"))
    })?;

    // Rule 2: join the remote-owned actor with what we already accepted.
    // Stale or duplicate deliveries are absorbed as no-ops; a previously
    // accepted field is never lost; divergent values conflict.
    let remote_role = local_role.other();
    let joined = merge_actor(local.actor(remote_role), remote.actor(remote_role))?;

    let mut merged = local.clone();
    *merged.actor_mut(remote_role) = joined;

    // Terminal states accept only duplicates
    if local.is_terminal() && merged != *local {
        return Err(Error::InvalidTransition(format!(
            "command {} is terminal ({:?})",
            local.command_id,
            local.state()
        )));
    }

    Ok(merged)
}

/// Decide the next action from the converged view. Pure function of the
/// two actors' status flags and KYC presence (rule 6).
pub fn decide(view: &PaymentCommand, local_role: ActorRole) -> NextAction {
    if let Some((code, message)) = view.abort_reason() {
        return NextAction::Halt {
            code: code.to_string(),
            message: message.map(str::to_string),
        };
    }

    if view.state() == CommandState::Ready {
        return NextAction::Settle;
    }

    let me = view.actor(local_role);
    let them = view.actor(local_role.other());

    if matches!(me.status, crate::types::ActorStatus::SoftMatch) {
        return NextAction::ManualReview;
    }

    if matches!(them.status, crate::types::ActorStatus::NeedsKycData) {
        if me.kyc_data.is_none() {
            return NextAction::SupplyKycData;
        }
        // Our payload is in the view; the counterparty learns of it on the
        // next exchange.
        return NextAction::Send;
    }

    NextAction::Wait
}

fn ensure_immutable_header(local: &PaymentCommand, remote: &PaymentCommand) -> Result<()> {
    if local.command_id != remote.command_id {
        return Err(Error::InvalidTransition(format!(
            "command_id mismatch: {} != {}",
            local.command_id, remote.command_id
        )));
    }
    if local.reference_id != remote.reference_id {
        return Err(Error::InvalidTransition(format!(
            "reference_id is immutable: {} != {}",
            local.reference_id, remote.reference_id
        )));
    }
    if local.action != remote.action {
        return Err(Error::InvalidTransition(
            "action fields are fixed at creation".to_string(),
        ));
    }
    Ok(())
}

/// `theirs` must not carry anything `ours` does not already have
fn ensure_subset(ours: &ActorObject, theirs: &ActorObject) -> Result<()> {
    if ours.address != theirs.address {
        return Err(Error::InvalidTransition("address changed".to_string()));
    }
    if theirs.kyc_data.is_some() && theirs.kyc_data != ours.kyc_data {
        return Err(Error::InvalidTransition("kyc_data changed".to_string()));
    }
    if theirs.metadata_signature.is_some() && theirs.metadata_signature != ours.metadata_signature
    {
        return Err(Error::InvalidTransition(
            "metadata_signature changed".to_string(),
        ));
    }
    if theirs.status.rank() > ours.status.rank() {
        return Err(Error::InvalidTransition("status advanced".to_string()));
    }
    if theirs.status.rank() == ours.status.rank() && theirs.status != ours.status {
        return Err(Error::InvalidTransition("status rewritten".to_string()));
    }
    Ok(())
}

/// Least upper bound of two views of the remote-owned actor.
///
/// Set-once fields keep the accepted value (an absent field in `theirs`
/// is stale, not a deletion); status takes the higher rank. Two different
/// values for the same set-once field, or two different statuses at equal
/// rank, cannot be ordered and conflict.
fn merge_actor(ours: &ActorObject, theirs: &ActorObject) -> Result<ActorObject> {
    if ours.address != theirs.address {
        return Err(Error::InvalidTransition(
            "actor address is immutable".to_string(),
        ));
    }

    let kyc_data = match (&ours.kyc_data, &theirs.kyc_data) {
        (Some(a), Some(b)) if a != b => {
            return Err(Error::MergeConflict("kyc_data rewritten".to_string()))
        }
        (Some(a), _) => Some(a.clone()),
        (None, other) => other.clone(),
    };

    let metadata_signature = match (&ours.metadata_signature, &theirs.metadata_signature) {
        (Some(a), Some(b)) if a != b => {
            return Err(Error::MergeConflict(
                "metadata_signature rewritten".to_string(),
            ))
        }
        (Some(a), _) => Some(a.clone()),
        (None, other) => other.clone(),
    };

    let status = match theirs.status.rank().cmp(&ours.status.rank()) {
        std::cmp::Ordering::Greater => theirs.status.clone(),
        std::cmp::Ordering::Less => ours.status.clone(),
        std::cmp::Ordering::Equal if theirs.status == ours.status => ours.status.clone(),
        std::cmp::Ordering::Equal => {
            return Err(Error::MergeConflict(format!(
                "conflicting status at equal rank: {:?} vs {:?}",
                ours.status, theirs.status
            )))
        }
    };

    Ok(ActorObject {
        address: ours.address.clone(),
        kyc_data,
        metadata_signature,
        status,
    })
}

/// Seam for deployment-specific compliance logic. The engine never
/// interprets KYC payloads; it plumbs whatever the policy hands it.
pub trait CompliancePolicy: Send + Sync {
    /// Inspect the converged view and produce updates for the local actor
    fn review(&self, command: &PaymentCommand, local_role: ActorRole) -> PolicyDecision;
}

/// Updates a policy wants applied to the local actor. Every field is
/// optional; the engine applies them monotonically and ignores no-ops.
#[derive(Debug, Clone, Default)]
pub struct PolicyDecision {
    /// Opaque KYC payload to attach, if not already set
    pub kyc_data: Option<serde_json::Value>,

    /// Status to move to (rank must not decrease)
    pub status: Option<crate::types::ActorStatus>,
}

/// Apply a policy decision to the local actor. Returns whether the view
/// changed. A terminal command is left untouched.
pub fn apply_policy(
    command: &mut PaymentCommand,
    local_role: ActorRole,
    decision: PolicyDecision,
) -> Result<bool> {
    if command.is_terminal() {
        return Ok(false);
    }

    let mut changed = false;

    if let Some(payload) = decision.kyc_data {
        if command.actor(local_role).kyc_data.is_none() {
            command.attach_kyc_data(local_role, payload)?;
            changed = true;
        }
    }

    if let Some(status) = decision.status {
        let current = &command.actor(local_role).status;
        if status.rank() > current.rank() {
            command.set_status(local_role, status)?;
            changed = true;
        } else if status != *current && status.rank() == current.rank() {
            return Err(Error::InvalidTransition(format!(
                "policy rewrote {local_role} status at equal rank"
            )));
        }
    }

    Ok(changed)
}
