//! Off-chain compliance negotiation engine
//!
//! Two financial institutions negotiate the compliance record for a
//! transfer before any funds move on the ledger. Each party keeps a
//! durable view of every payment command; signed envelopes carry view
//! snapshots between them; a confluent merge makes duplicate and
//! out-of-order delivery harmless; and once both parties authorize
//! settlement, the funding transaction is submitted exactly once per
//! reference id.
//!
//! # Architecture
//!
//! - [`types`] - Payment commands, actors, envelopes
//! - [`canonical`] - Deterministic signing input
//! - [`crypto`] - Ed25519 envelope authentication
//! - [`store`] - RocksDB command store with per-command versioning
//! - [`protocol`] - Merge rules and the next-action decision
//! - [`transport`] - Envelope server and the client drive loop
//! - [`settlement`] - Idempotent ledger submission bridge
//! - [`mock`] - In-process collaborator doubles for testing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod canonical;
pub mod config;
pub mod crypto;
pub mod error;
pub mod metrics;
pub mod mock;
pub mod protocol;
pub mod settlement;
pub mod store;
pub mod transport;
pub mod types;

pub use config::EngineConfig;
pub use crypto::KeyPair;
pub use error::{Error, Result, WireError};
pub use metrics::Metrics;
pub use protocol::{CompliancePolicy, NextAction, PolicyDecision};
pub use settlement::{ExecutionResult, ExecutionStatus, LedgerClient, SettlementBridge};
pub use store::{CommandRecord, CommandStore, Disposition};
pub use transport::{EnvelopeServer, NegotiationClient, OffchainChannel};
pub use types::{
    ActorObject, ActorRole, ActorStatus, CommandEnvelope, CommandPayload, CommandState,
    PaymentCommand, ResponseEnvelope, ResponseStatus, Signature,
};

/// Install the tracing subscriber, filtered through `RUST_LOG`.
/// Embedding binaries and tests call this once; repeated calls are no-ops.
pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();
}
