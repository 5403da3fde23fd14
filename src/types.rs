//! Core types for the off-chain negotiation protocol
//!
//! All types are designed for:
//! - Self-describing wire encoding (serde_json)
//! - Deterministic signing input (see `canonical`)
//! - Exact arithmetic (Decimal for money)

use crate::error::{Error, Result, WireError};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Role of a party within one payment command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActorRole {
    /// Party debiting funds
    Sender,
    /// Party receiving funds
    Receiver,
}

impl ActorRole {
    /// The counterparty role
    pub fn other(&self) -> ActorRole {
        match self {
            ActorRole::Sender => ActorRole::Receiver,
            ActorRole::Receiver => ActorRole::Sender,
        }
    }
}

impl fmt::Display for ActorRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActorRole::Sender => write!(f, "sender"),
            ActorRole::Receiver => write!(f, "receiver"),
        }
    }
}

/// Negotiation status of one actor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ActorStatus {
    /// Actor requires the counterparty's KYC data before proceeding
    NeedsKycData,

    /// Compliance check was inconclusive, manual review required
    SoftMatch,

    /// Actor has authorized settlement
    ReadyForSettlement,

    /// Actor aborted the negotiation
    Abort {
        /// Machine-readable abort code
        code: String,
        /// Optional human-readable detail
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl ActorStatus {
    /// Monotonic rank. Status may only move to an equal or higher rank.
    pub fn rank(&self) -> u8 {
        match self {
            ActorStatus::NeedsKycData => 0,
            ActorStatus::SoftMatch => 1,
            ActorStatus::ReadyForSettlement => 2,
            ActorStatus::Abort { .. } => 3,
        }
    }

    /// True if this status is an abort
    pub fn is_abort(&self) -> bool {
        matches!(self, ActorStatus::Abort { .. })
    }

    /// True if this actor has authorized settlement
    pub fn is_ready(&self) -> bool {
        matches!(self, ActorStatus::ReadyForSettlement)
    }
}

/// One party's view of itself within a payment command.
///
/// The mutable fields of an actor are owned exclusively by that role's
/// party; the counterparty's copy is informational only and is populated
/// solely from verified remote envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorObject {
    /// Registered on-ledger address of this party
    pub address: String,

    /// Opaque policy payload. The engine never inspects its contents,
    /// it only guarantees the payload survives merges intact.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kyc_data: Option<serde_json::Value>,

    /// Hex-encoded compliance-key signature over the settlement metadata,
    /// attached by the receiver once it authorizes settlement
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata_signature: Option<String>,

    /// Negotiation status
    #[serde(flatten)]
    pub status: ActorStatus,
}

impl ActorObject {
    /// New actor at the start of negotiation
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            kyc_data: None,
            metadata_signature: None,
            status: ActorStatus::NeedsKycData,
        }
    }
}

/// Amount, currency and creation time of the transfer under negotiation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAction {
    /// Transfer amount (exact decimal)
    pub amount: Decimal,

    /// ISO 4217 currency code
    pub currency: String,

    /// Creation timestamp
    pub timestamp: DateTime<Utc>,
}

/// Derived lifecycle state of a command. Computed from the two actor
/// statuses, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Neither terminal condition met
    Negotiating,
    /// Both actors ready for settlement
    Ready,
    /// Either actor aborted
    Aborted,
}

impl CommandState {
    /// READY and ABORTED are terminal: no further protocol mutation
    pub fn is_terminal(&self) -> bool {
        matches!(self, CommandState::Ready | CommandState::Aborted)
    }
}

/// The negotiated compliance record for one transfer. Aggregate root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCommand {
    /// Unique command id, assigned at creation, immutable
    pub command_id: Uuid,

    /// Stable cross-party key used for idempotent settlement, immutable
    pub reference_id: String,

    /// Sending party's actor record
    pub sender: ActorObject,

    /// Receiving party's actor record
    pub receiver: ActorObject,

    /// Transfer details, fixed at creation
    pub action: PaymentAction,
}

impl PaymentCommand {
    /// Create a new command at the start of negotiation
    pub fn new(
        reference_id: impl Into<String>,
        sender_address: impl Into<String>,
        receiver_address: impl Into<String>,
        amount: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            reference_id: reference_id.into(),
            sender: ActorObject::new(sender_address),
            receiver: ActorObject::new(receiver_address),
            action: PaymentAction {
                amount,
                currency: currency.into(),
                timestamp: Utc::now(),
            },
        }
    }

    /// Actor record for a role
    pub fn actor(&self, role: ActorRole) -> &ActorObject {
        match role {
            ActorRole::Sender => &self.sender,
            ActorRole::Receiver => &self.receiver,
        }
    }

    /// Mutable actor record for a role
    pub fn actor_mut(&mut self, role: ActorRole) -> &mut ActorObject {
        match role {
            ActorRole::Sender => &mut self.sender,
            ActorRole::Receiver => &mut self.receiver,
        }
    }

    /// Which role an address speaks for, if any
    pub fn role_of(&self, address: &str) -> Option<ActorRole> {
        if self.sender.address == address {
            Some(ActorRole::Sender)
        } else if self.receiver.address == address {
            Some(ActorRole::Receiver)
        } else {
            None
        }
    }

    /// Derived lifecycle state
    pub fn state(&self) -> CommandState {
        if self.sender.status.is_abort() || self.receiver.status.is_abort() {
            CommandState::Aborted
        } else if self.sender.status.is_ready() && self.receiver.status.is_ready() {
            CommandState::Ready
        } else {
            CommandState::Negotiating
        }
    }

    /// True once the command reached READY or ABORTED
    pub fn is_terminal(&self) -> bool {
        self.state().is_terminal()
    }

    /// The abort code and message, if either actor aborted
    pub fn abort_reason(&self) -> Option<(&str, Option<&str>)> {
        for actor in [&self.sender, &self.receiver] {
            if let ActorStatus::Abort { code, message } = &actor.status {
                return Some((code.as_str(), message.as_deref()));
            }
        }
        None
    }

    /// Attach the local role's opaque KYC payload. Set-once.
    pub fn attach_kyc_data(&mut self, role: ActorRole, payload: serde_json::Value) -> Result<()> {
        self.ensure_mutable()?;
        let actor = self.actor_mut(role);
        if actor.kyc_data.is_some() {
            return Err(Error::InvalidTransition(format!(
                "kyc_data already set for {role} actor"
            )));
        }
        actor.kyc_data = Some(payload);
        Ok(())
    }

    /// Attach the local role's metadata signature. Set-once.
    pub fn attach_metadata_signature(&mut self, role: ActorRole, sig_hex: String) -> Result<()> {
        self.ensure_mutable()?;
        let actor = self.actor_mut(role);
        if actor.metadata_signature.is_some() {
            return Err(Error::InvalidTransition(format!(
                "metadata_signature already set for {role} actor"
            )));
        }
        actor.metadata_signature = Some(sig_hex);
        Ok(())
    }

    /// Move the local role's status forward. Rank must not decrease.
    pub fn set_status(&mut self, role: ActorRole, status: ActorStatus) -> Result<()> {
        self.ensure_mutable()?;
        let actor = self.actor_mut(role);
        if status.rank() < actor.status.rank() {
            return Err(Error::InvalidTransition(format!(
                "{role} actor status cannot move from {:?} to {:?}",
                actor.status, status
            )));
        }
        actor.status = status;
        Ok(())
    }

    /// Abort the negotiation from the local role
    pub fn abort(
        &mut self,
        role: ActorRole,
        code: impl Into<String>,
        message: Option<String>,
    ) -> Result<()> {
        self.set_status(
            role,
            ActorStatus::Abort {
                code: code.into(),
                message,
            },
        )
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "command {} is terminal ({:?})",
                self.command_id,
                self.state()
            )));
        }
        Ok(())
    }
}

/// Tagged union of command payloads. Closed set: unknown types fail
/// at decode time rather than being misinterpreted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "command_type")]
pub enum CommandPayload {
    /// Peer-to-peer payment negotiation
    #[serde(rename = "PaymentCommand")]
    Payment(PaymentCommand),
}

impl CommandPayload {
    /// The inner payment command
    pub fn payment(&self) -> &PaymentCommand {
        match self {
            CommandPayload::Payment(cmd) => cmd,
        }
    }
}

/// Ed25519 signature wrapper, hex-encoded on the wire
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Signature([u8; 64]);

impl Signature {
    /// Wrap raw signature bytes
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }

    /// Raw signature bytes
    pub fn as_bytes(&self) -> &[u8; 64] {
        &self.0
    }

    /// Parse from a hex string
    pub fn from_hex(s: &str) -> Result<Self> {
        let raw = hex::decode(s)
            .map_err(|e| Error::Serialization(format!("invalid signature hex: {e}")))?;
        let bytes: [u8; 64] = raw
            .try_into()
            .map_err(|_| Error::Serialization("signature must be 64 bytes".to_string()))?;
        Ok(Self(bytes))
    }

    /// Hex encoding
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Signature({})", self.to_hex())
    }
}

impl Serialize for Signature {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Signature {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Signature::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// Signed request wire unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandEnvelope {
    /// Caller-generated id used for idempotent replay
    pub request_id: Uuid,

    /// Address of the party that signed this envelope
    pub sender_address: String,

    /// Command payload snapshot
    pub command: CommandPayload,

    /// Ed25519 signature over the envelope's canonical bytes
    pub signature: Signature,
}

/// Response outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    /// Request processed, `command` carries the responder's updated view
    Success,
    /// Request rejected, `error` carries the reason
    Failure,
}

/// Signed response wire unit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseEnvelope {
    /// Echoes the request id
    pub request_id: Uuid,

    /// Address of the responding party
    pub responder_address: String,

    /// Outcome
    pub status: ResponseStatus,

    /// Responder's updated view of the command, on success
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<PaymentCommand>,

    /// Structured error, on failure
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,

    /// Ed25519 signature over the envelope's canonical bytes
    pub signature: Signature,
}
