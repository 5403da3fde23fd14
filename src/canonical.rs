//! Canonical serialization for signing and verification
//!
//! Ensures a deterministic byte representation of envelope contents.
//! Two semantically equal payloads always encode identically: fixed field
//! order, length-prefixed strings, presence markers for optional fields,
//! normalized decimals. Used exclusively as signing input, never as the
//! wire format (the wire format is serde_json).
//!
//! Opaque KYC payloads are encoded through serde_json, whose map type
//! keeps keys sorted, so equal JSON values produce equal bytes.

use crate::error::WireError;
use crate::types::{
    ActorObject, ActorStatus, CommandEnvelope, CommandPayload, PaymentAction, PaymentCommand,
    ResponseEnvelope, ResponseStatus,
};
use rust_decimal::Decimal;

/// Domain tags keep request, response and metadata signing inputs disjoint
const TAG_REQUEST: &str = "offchain-request";
const TAG_RESPONSE: &str = "offchain-response";
const TAG_METADATA: &str = "settlement-metadata";

/// Canonical serializer
pub struct CanonicalSerializer {
    buffer: Vec<u8>,
}

impl CanonicalSerializer {
    /// Create new serializer
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Write raw bytes
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
    }

    /// Write length-prefixed bytes
    fn write_prefixed(&mut self, bytes: &[u8]) {
        self.write_u32(bytes.len() as u32);
        self.write_bytes(bytes);
    }

    /// Write string (length-prefixed)
    fn write_string(&mut self, s: &str) {
        self.write_prefixed(s.as_bytes());
    }

    /// Write u32 (big-endian)
    fn write_u32(&mut self, n: u32) {
        self.write_bytes(&n.to_be_bytes());
    }

    /// Write i64 (big-endian)
    fn write_i64(&mut self, n: i64) {
        self.write_bytes(&n.to_be_bytes());
    }

    /// Write a single marker byte
    fn write_u8(&mut self, n: u8) {
        self.write_bytes(&[n]);
    }

    /// Write decimal, normalized so trailing zeros do not change the bytes
    fn write_decimal(&mut self, d: &Decimal) {
        self.write_string(&d.normalize().to_string());
    }

    /// Write optional string with presence marker
    fn write_option_string(&mut self, opt: &Option<String>) {
        match opt {
            Some(s) => {
                self.write_u8(1);
                self.write_string(s);
            }
            None => self.write_u8(0),
        }
    }

    /// Write optional JSON value with presence marker.
    ///
    /// serde_json maps are BTreeMap-backed, so key order is stable.
    fn write_option_json(&mut self, opt: &Option<serde_json::Value>) {
        match opt {
            Some(value) => {
                self.write_u8(1);
                let bytes = serde_json::to_vec(value).expect("JSON value always serializes");
                self.write_prefixed(&bytes);
            }
            None => self.write_u8(0),
        }
    }

    /// Finalize and return bytes
    pub fn finalize(self) -> Vec<u8> {
        self.buffer
    }
}

impl Default for CanonicalSerializer {
    fn default() -> Self {
        Self::new()
    }
}

// =========================================================================
// CANONICAL SERIALIZATION FOR PROTOCOL TYPES
// =========================================================================

impl ActorStatus {
    fn write_canonical(&self, ser: &mut CanonicalSerializer) {
        ser.write_u8(self.rank());
        if let ActorStatus::Abort { code, message } = self {
            ser.write_string(code);
            ser.write_option_string(message);
        }
    }
}

impl ActorObject {
    fn write_canonical(&self, ser: &mut CanonicalSerializer) {
        ser.write_string(&self.address);
        ser.write_option_json(&self.kyc_data);
        ser.write_option_string(&self.metadata_signature);
        self.status.write_canonical(ser);
    }
}

impl PaymentAction {
    fn write_canonical(&self, ser: &mut CanonicalSerializer) {
        ser.write_decimal(&self.amount);
        ser.write_string(&self.currency);
        ser.write_i64(self.timestamp.timestamp_nanos_opt().unwrap_or(0));
    }
}

impl PaymentCommand {
    /// Serialize to canonical bytes (fixed field order)
    pub fn write_canonical(&self, ser: &mut CanonicalSerializer) {
        ser.write_string(&self.command_id.to_string());
        ser.write_string(&self.reference_id);
        self.action.write_canonical(ser);
        self.sender.write_canonical(ser);
        self.receiver.write_canonical(ser);
    }

    /// Canonical bytes of this command alone
    pub fn canonical_bytes(&self) -> Vec<u8> {
        let mut ser = CanonicalSerializer::new();
        self.write_canonical(&mut ser);
        ser.finalize()
    }
}

impl CommandPayload {
    fn write_canonical(&self, ser: &mut CanonicalSerializer) {
        match self {
            CommandPayload::Payment(cmd) => {
                ser.write_string("PaymentCommand");
                cmd.write_canonical(ser);
            }
        }
    }
}

impl WireError {
    fn write_canonical(&self, ser: &mut CanonicalSerializer) {
        ser.write_string(&self.error_type);
        ser.write_string(&self.code);
        ser.write_option_string(&self.field);
        ser.write_string(&self.message);
    }
}

impl CommandEnvelope {
    /// Signing input for a request envelope. Covers every field except the
    /// signature itself, so any bit flip invalidates the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut ser = CanonicalSerializer::new();
        ser.write_string(TAG_REQUEST);
        ser.write_string(&self.request_id.to_string());
        ser.write_string(&self.sender_address);
        self.command.write_canonical(&mut ser);
        ser.finalize()
    }
}

impl ResponseEnvelope {
    /// Signing input for a response envelope
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut ser = CanonicalSerializer::new();
        ser.write_string(TAG_RESPONSE);
        ser.write_string(&self.request_id.to_string());
        ser.write_string(&self.responder_address);
        ser.write_u8(match self.status {
            ResponseStatus::Success => 1,
            ResponseStatus::Failure => 0,
        });
        match &self.command {
            Some(cmd) => {
                ser.write_u8(1);
                cmd.write_canonical(&mut ser);
            }
            None => ser.write_u8(0),
        }
        match &self.error {
            Some(err) => {
                ser.write_u8(1);
                err.write_canonical(&mut ser);
            }
            None => ser.write_u8(0),
        }
        ser.finalize()
    }
}

/// Signing input for the settlement metadata signature the receiver
/// attaches when it authorizes settlement. Binds the reference id to the
/// negotiated amount.
pub fn metadata_signature_message(command: &PaymentCommand) -> Vec<u8> {
    let mut ser = CanonicalSerializer::new();
    ser.write_string(TAG_METADATA);
    ser.write_string(&command.reference_id);
    ser.write_decimal(&command.action.amount);
    ser.write_string(&command.action.currency);
    ser.finalize()
}
