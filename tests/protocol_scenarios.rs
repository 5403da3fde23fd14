//! End-to-end negotiation scenarios between two in-process parties

use offchain_engine::mock::{LoopbackChannel, MockLedgerClient, StaticPolicy};
use offchain_engine::{
    ActorRole, CommandEnvelope, CommandPayload, CommandState, CompliancePolicy, Disposition,
    EngineConfig, EnvelopeServer, Error, KeyPair, Metrics, NegotiationClient, NextAction,
    OffchainChannel, PaymentCommand, ResponseEnvelope, ResponseStatus, Signature,
};
use rust_decimal_macros::dec;
use std::sync::Arc;
use tempfile::TempDir;
use uuid::Uuid;

const SENDER: &str = "dm1sender";
const RECEIVER: &str = "dm1receiver";

struct Party {
    client: Arc<NegotiationClient>,
    server: Arc<EnvelopeServer>,
    store: Arc<offchain_engine::CommandStore>,
    keypair: Arc<KeyPair>,
    metrics: Metrics,
    _temp: TempDir,
}

fn party(
    address: &str,
    seed: u8,
    policy: Arc<dyn CompliancePolicy>,
    ledger: &Arc<MockLedgerClient>,
    channel: &Arc<LoopbackChannel>,
) -> Party {
    offchain_engine::init_tracing();
    let temp_dir = TempDir::new().unwrap();
    let mut config = EngineConfig::default();
    config.data_dir = temp_dir.path().to_path_buf();
    config.local_address = address.to_string();
    // Keep transport failures short in tests
    config.retry.initial_interval_ms = 10;
    config.retry.max_elapsed_ms = 100;

    let keypair = Arc::new(KeyPair::from_seed(&[seed; 32]));
    ledger.register_key(address, keypair.public_key());

    let store = Arc::new(offchain_engine::CommandStore::open(&config).unwrap());
    let metrics = Metrics::new().unwrap();

    let server = Arc::new(EnvelopeServer::new(
        address,
        keypair.clone(),
        store.clone(),
        ledger.clone() as Arc<dyn offchain_engine::LedgerClient>,
        policy.clone(),
        metrics.clone(),
    ));
    channel.register(address, server.clone());

    let client = Arc::new(NegotiationClient::new(
        config,
        keypair.clone(),
        store.clone(),
        channel.clone() as Arc<dyn OffchainChannel>,
        ledger.clone() as Arc<dyn offchain_engine::LedgerClient>,
        policy,
        metrics.clone(),
    ));

    Party {
        client,
        server,
        store,
        keypair,
        metrics,
        _temp: temp_dir,
    }
}

fn two_parties(
    sender_policy: Arc<dyn CompliancePolicy>,
    receiver_policy: Arc<dyn CompliancePolicy>,
) -> (Party, Party, Arc<MockLedgerClient>) {
    let ledger = Arc::new(MockLedgerClient::new());
    let channel = Arc::new(LoopbackChannel::new());
    let sender = party(SENDER, 1, sender_policy, &ledger, &channel);
    let receiver = party(RECEIVER, 2, receiver_policy, &ledger, &channel);
    (sender, receiver, ledger)
}

fn approving(name: &str) -> Arc<dyn CompliancePolicy> {
    Arc::new(StaticPolicy::approving(serde_json::json!({"name": name})))
}

#[tokio::test]
async fn test_happy_path_settles_and_archives() {
    let (sender, receiver, ledger) = two_parties(approving("Alice"), approving("Bob"));

    let command = sender
        .client
        .create_command("ref-happy", RECEIVER, dec!(150.00), "USD")
        .unwrap();

    let action = sender.client.negotiate(command.command_id).await.unwrap();
    assert_eq!(action, NextAction::Settle);

    // Exactly one funding transaction, carrying the reference id
    assert_eq!(ledger.submission_count(), 1);
    assert_eq!(ledger.submitted_transactions()[0].reference_id, "ref-happy");

    // Sender side: READY view, archived record
    let record = sender.store.must_get_command(command.command_id).unwrap();
    assert_eq!(record.command.state(), CommandState::Ready);
    assert_eq!(record.disposition, Disposition::Archived);
    assert!(record.command.sender.kyc_data.is_some());
    assert!(record.command.receiver.kyc_data.is_some());
    assert!(record.command.receiver.metadata_signature.is_some());

    // Receiver side: same converged view, archived after observing the
    // funding transaction
    let record = receiver.store.must_get_command(command.command_id).unwrap();
    assert_eq!(record.command.state(), CommandState::Ready);
    let disposition = receiver
        .client
        .bridge()
        .resume(command.command_id)
        .await
        .unwrap();
    assert_eq!(disposition, Disposition::Archived);
}

#[tokio::test]
async fn test_both_sides_converge_to_identical_views() {
    let (sender, receiver, _ledger) = two_parties(approving("Alice"), approving("Bob"));

    let command = sender
        .client
        .create_command("ref-converge", RECEIVER, dec!(42.00), "EUR")
        .unwrap();
    sender.client.negotiate(command.command_id).await.unwrap();

    let sender_view = sender
        .store
        .must_get_command(command.command_id)
        .unwrap()
        .command;
    let receiver_view = receiver
        .store
        .must_get_command(command.command_id)
        .unwrap()
        .command;
    assert_eq!(sender_view, receiver_view);
}

#[tokio::test]
async fn test_soft_match_abort_halts_negotiation() {
    let receiver_policy = Arc::new(StaticPolicy::rejecting(
        serde_json::json!({"name": "Bob"}),
        "soft-match",
    ));
    let (sender, receiver, ledger) = two_parties(approving("Alice"), receiver_policy);

    let command = sender
        .client
        .create_command("ref-abort", RECEIVER, dec!(99.00), "USD")
        .unwrap();

    let action = sender.client.negotiate(command.command_id).await.unwrap();
    assert_eq!(
        action,
        NextAction::Halt {
            code: "soft-match".to_string(),
            message: Some("compliance review declined".to_string()),
        }
    );

    // No funds moved, both sides archived the aborted command
    assert_eq!(ledger.submission_count(), 0);
    let record = sender.store.must_get_command(command.command_id).unwrap();
    assert_eq!(record.command.state(), CommandState::Aborted);
    assert_eq!(record.disposition, Disposition::Archived);
    let record = receiver.store.must_get_command(command.command_id).unwrap();
    assert_eq!(record.command.state(), CommandState::Aborted);
    assert_eq!(record.disposition, Disposition::Archived);
}

fn signed_request(keypair: &KeyPair, sender_address: &str, view: PaymentCommand) -> Vec<u8> {
    let mut envelope = CommandEnvelope {
        request_id: Uuid::new_v4(),
        sender_address: sender_address.to_string(),
        command: CommandPayload::Payment(view),
        signature: Signature::from_bytes([0u8; 64]),
    };
    envelope.signature = keypair.sign(&envelope.signing_bytes());
    serde_json::to_vec(&envelope).unwrap()
}

#[tokio::test]
async fn test_aborted_command_replays_identically() {
    let receiver_policy = Arc::new(StaticPolicy::rejecting(
        serde_json::json!({"name": "Bob"}),
        "soft-match",
    ));
    let (sender, receiver, _ledger) = two_parties(approving("Alice"), receiver_policy);

    let mut view = PaymentCommand::new("ref-replay", SENDER, RECEIVER, dec!(10.00), "USD");
    view.attach_kyc_data(ActorRole::Sender, serde_json::json!({"name": "Alice"}))
        .unwrap();
    let request = signed_request(&sender.keypair, SENDER, view);

    let first = receiver.server.handle(&request).await.unwrap();
    let second = receiver.server.handle(&request).await.unwrap();
    let third = receiver.server.handle(&request).await.unwrap();
    assert_eq!(first, second);
    assert_eq!(first, third);

    let response: ResponseEnvelope = serde_json::from_slice(&first).unwrap();
    assert_eq!(response.status, ResponseStatus::Success);
    assert_eq!(
        response.command.unwrap().state(),
        CommandState::Aborted
    );

    // The duplicates never re-ran the state machine
    let record = receiver
        .store
        .get_command_by_reference("ref-replay")
        .unwrap()
        .unwrap();
    assert_eq!(record.version, 1);
    assert_eq!(receiver.metrics.replays_total.get(), 2);
}

#[tokio::test]
async fn test_concurrent_duplicates_process_once() {
    let (sender, receiver, _ledger) = two_parties(approving("Alice"), approving("Bob"));

    let mut view = PaymentCommand::new("ref-race", SENDER, RECEIVER, dec!(10.00), "USD");
    view.attach_kyc_data(ActorRole::Sender, serde_json::json!({"name": "Alice"}))
        .unwrap();
    let command_id = view.command_id;
    let request = Arc::new(signed_request(&sender.keypair, SENDER, view));

    let mut handles = Vec::new();
    for _ in 0..3 {
        let server = receiver.server.clone();
        let request = request.clone();
        handles.push(tokio::spawn(
            async move { server.handle(&request).await },
        ));
    }

    let mut responses = Vec::new();
    for handle in handles {
        responses.push(handle.await.unwrap().unwrap());
    }

    // All three callers observe the same signed bytes, and the command
    // advanced exactly once
    assert_eq!(responses[0], responses[1]);
    assert_eq!(responses[0], responses[2]);
    assert_eq!(
        receiver.store.must_get_command(command_id).unwrap().version,
        1
    );
}

#[tokio::test]
async fn test_unreachable_counterparty_stalls_command() {
    let ledger = Arc::new(MockLedgerClient::new());
    let channel = Arc::new(LoopbackChannel::new());
    // No receiver registered on the channel
    let sender = party(SENDER, 1, approving("Alice"), &ledger, &channel);
    ledger.register_key(RECEIVER, KeyPair::from_seed(&[2u8; 32]).public_key());

    let command = sender
        .client
        .create_command("ref-stall", RECEIVER, dec!(10.00), "USD")
        .unwrap();

    let result = sender.client.negotiate(command.command_id).await;
    assert!(matches!(result, Err(Error::TransportTimeout(_))));

    let record = sender.store.must_get_command(command.command_id).unwrap();
    assert_eq!(record.disposition, Disposition::Stalled);
    assert_eq!(sender.metrics.commands_stalled_total.get(), 1);

    // Stalled is not terminal: once the counterparty comes back, the same
    // command drives to completion
    let receiver = party(RECEIVER, 2, approving("Bob"), &ledger, &channel);
    let action = sender.client.negotiate(command.command_id).await.unwrap();
    assert_eq!(action, NextAction::Settle);
    drop(receiver);
}

#[tokio::test]
async fn test_spawned_negotiation_unregisters_itself() {
    let (sender, _receiver, ledger) = two_parties(approving("Alice"), approving("Bob"));

    let command = sender
        .client
        .create_command("ref-task", RECEIVER, dec!(75.00), "USD")
        .unwrap();

    sender.client.spawn_negotiation(command.command_id);
    assert!(sender.client.active_negotiations() <= 1);

    for _ in 0..100 {
        if sender.client.active_negotiations() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    assert_eq!(sender.client.active_negotiations(), 0);
    assert_eq!(ledger.submission_count(), 1);
    assert_eq!(
        sender
            .store
            .must_get_command(command.command_id)
            .unwrap()
            .disposition,
        Disposition::Archived
    );
}

#[tokio::test]
async fn test_duplicate_reference_id_is_rejected_locally() {
    let (sender, _receiver, _ledger) = two_parties(approving("Alice"), approving("Bob"));

    let first = sender
        .client
        .create_command("ref-once", RECEIVER, dec!(10.00), "USD")
        .unwrap();
    // The reference id is the settlement idempotency key and can only ever
    // belong to one command
    let result = sender
        .client
        .create_command("ref-once", RECEIVER, dec!(10.00), "USD");
    assert!(matches!(result, Err(Error::InvalidTransition(_))));

    let indexed = sender
        .store
        .get_command_by_reference("ref-once")
        .unwrap()
        .unwrap();
    assert_eq!(indexed.command.command_id, first.command_id);
}
