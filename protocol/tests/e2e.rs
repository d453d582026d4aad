//! End-to-end tests for the SAS verification engine.
//!
//! Two kinds of setup are used. Full pairs run two engines against each
//! other over the in-memory network, with the humans simulated by test
//! hooks. Scripted tests drive one engine by hand, playing the peer's side
//! message by message, which is how out-of-order and malicious input is
//! produced.
//!
//! Timeout tests run on paused tokio time, so a ten-minute deadline costs
//! nothing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::SigningKey;
use parking_lot::Mutex;
use rand::rngs::OsRng;
use tokio::sync::{mpsc, watch};

use keytrust_protocol::config::VerificationConfig;
use keytrust_protocol::crypto::{canonical_json, SasKeyAgreement};
use keytrust_protocol::verification::mac;
use keytrust_protocol::verification::{
    AcceptContent, AcceptDecision, CancelCode, CancelContent, DeviceIdentity, Envelope,
    HashMethod, KeyAgreementProtocol, KeyContent, MacContent, MacMethod, MemoryDeviceStore,
    MemoryNetwork, OwnDevice, Phase, RequestContent, SasCode, SasMethod, StartContent,
    TransactionId, UserId, VerificationEngine, VerificationError, VerificationHandler,
    VerificationHooks, VerificationMessage, VerificationMethod,
};

const ALICE: &str = "@alice:example.org";
const ALICE_DEVICE: &str = "ALICEDEVICE";
const BOB: &str = "@bob:example.org";
const BOB_DEVICE: &str = "BOBDEVICE";

const WAIT: Duration = Duration::from_secs(5);

// ---------------------------------------------------------------------------
// Test Hooks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Outcome {
    Pending,
    Verified,
    Cancelled {
        by_us: bool,
        reason: String,
        code: CancelCode,
    },
}

impl Outcome {
    fn cancelled(by_us: bool, reason: &str, code: CancelCode) -> Self {
        Self::Cancelled {
            by_us,
            reason: reason.to_string(),
            code,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Answer {
    Match,
    Mismatch,
    /// The human never answers.
    Hold,
}

/// Simulated human plus a record of everything the engine told the UI.
struct TestHooks {
    methods: Vec<SasMethod>,
    answer: Answer,
    shown: Mutex<Option<SasCode>>,
    outcome: watch::Sender<Outcome>,
    cancels: AtomicUsize,
    successes: AtomicUsize,
}

impl TestHooks {
    fn new(answer: Answer) -> Arc<Self> {
        Self::with_methods(answer, vec![SasMethod::Emoji, SasMethod::Decimal])
    }

    fn with_methods(answer: Answer, methods: Vec<SasMethod>) -> Arc<Self> {
        Arc::new(Self {
            methods,
            answer,
            shown: Mutex::new(None),
            outcome: watch::channel(Outcome::Pending).0,
            cancels: AtomicUsize::new(0),
            successes: AtomicUsize::new(0),
        })
    }

    /// Wait (in real time) until the transaction ended.
    async fn outcome(&self) -> Outcome {
        let mut rx = self.outcome.subscribe();
        let waited = tokio::time::timeout(WAIT, rx.wait_for(|o| *o != Outcome::Pending)).await;
        let outcome = waited.expect("outcome in time").expect("hooks alive").clone();
        outcome
    }

    fn current(&self) -> Outcome {
        self.outcome.borrow().clone()
    }

    fn shown(&self) -> Option<SasCode> {
        self.shown.lock().clone()
    }

    fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    fn successes(&self) -> usize {
        self.successes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VerificationHooks for TestHooks {
    fn supported_methods(&self) -> Vec<SasMethod> {
        self.methods.clone()
    }

    async fn confirm_sas(&self, _peer: &DeviceIdentity, sas: &SasCode) -> bool {
        *self.shown.lock() = Some(sas.clone());
        match self.answer {
            Answer::Match => true,
            Answer::Mismatch => false,
            Answer::Hold => std::future::pending().await,
        }
    }

    async fn on_cancel(&self, cancelled_by_us: bool, reason: &str, code: &CancelCode) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        let ended = Outcome::cancelled(cancelled_by_us, reason, code.clone());
        self.outcome.send_if_modified(|o| {
            if *o != Outcome::Pending {
                return false;
            }
            *o = ended;
            true
        });
    }

    async fn on_success(&self) {
        self.successes.fetch_add(1, Ordering::SeqCst);
        self.outcome.send_if_modified(|o| {
            if *o != Outcome::Pending {
                return false;
            }
            *o = Outcome::Verified;
            true
        });
    }
}

#[derive(Debug, Clone, Copy)]
enum Decision {
    Accept,
    Reject,
    Ignore,
}

struct TestHandler {
    decision: Decision,
    hooks: Arc<TestHooks>,
    calls: AtomicUsize,
}

impl TestHandler {
    fn new(decision: Decision, hooks: Arc<TestHooks>) -> Arc<Self> {
        Arc::new(Self {
            decision,
            hooks,
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VerificationHandler for TestHandler {
    async fn accept_verification_from(
        &self,
        _transaction_id: &TransactionId,
        _device: &DeviceIdentity,
    ) -> AcceptDecision {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.decision {
            Decision::Accept => AcceptDecision::Accept(self.hooks.clone()),
            Decision::Reject => AcceptDecision::Reject,
            Decision::Ignore => AcceptDecision::Ignore,
        }
    }
}

// ---------------------------------------------------------------------------
// Setup Helpers
// ---------------------------------------------------------------------------

/// One engine-backed device.
struct Peer {
    engine: VerificationEngine,
    store: Arc<MemoryDeviceStore>,
    identity: DeviceIdentity,
    handler: Arc<TestHandler>,
}

impl Peer {
    fn new(
        network: &MemoryNetwork,
        user: &str,
        device: &str,
        handler: Arc<TestHandler>,
        config: VerificationConfig,
    ) -> Self {
        let key = SigningKey::generate(&mut OsRng);
        let own = OwnDevice::new(user, device, &key.verifying_key());
        let identity = own.identity();
        let store = Arc::new(MemoryDeviceStore::new());
        let engine = VerificationEngine::with_config(
            own,
            config,
            network.transport(user),
            store.clone(),
            handler.clone(),
        );
        Self {
            engine,
            store,
            identity,
            handler,
        }
    }

    fn user(&self) -> &UserId {
        &self.identity.user_id
    }

    fn hooks(&self) -> &Arc<TestHooks> {
        &self.handler.hooks
    }

    fn trust_writes(&self) -> usize {
        self.store.trust_writes()
    }
}

/// Alice and Bob, each knowing the other's device, both attached to the
/// network.
fn pair(alice_answer: Answer, bob: Arc<TestHandler>) -> (MemoryNetwork, Peer, Peer) {
    let network = MemoryNetwork::new();
    let alice = Peer::new(
        &network,
        ALICE,
        ALICE_DEVICE,
        TestHandler::new(Decision::Accept, TestHooks::new(alice_answer)),
        VerificationConfig::default(),
    );
    let bob = Peer::new(&network, BOB, BOB_DEVICE, bob, VerificationConfig::default());
    alice.store.add_device(bob.identity.clone());
    bob.store.add_device(alice.identity.clone());
    network.attach(alice.engine.clone());
    network.attach(bob.engine.clone());
    (network, alice, bob)
}

/// A peer whose messages the test writes by hand.
struct Scripted {
    user: UserId,
    identity: DeviceIdentity,
    inbox: mpsc::UnboundedReceiver<Envelope>,
    sas: SasKeyAgreement,
}

impl Scripted {
    fn new(network: &MemoryNetwork, user: &str, device: &str) -> Self {
        let key = SigningKey::generate(&mut OsRng);
        Self {
            user: UserId::new(user),
            identity: DeviceIdentity::new(user, device, &key.verifying_key()),
            inbox: network.register(user, device),
            sas: SasKeyAgreement::generate_keypair(),
        }
    }

    async fn next(&mut self) -> VerificationMessage {
        tokio::time::timeout(WAIT, self.inbox.recv())
            .await
            .expect("message in time")
            .expect("network alive")
            .message
    }

    async fn next_start(&mut self) -> StartContent {
        match self.next().await {
            VerificationMessage::Start(start) => start,
            other => panic!("expected start, got {:?}", other),
        }
    }

    async fn next_cancel(&mut self) -> CancelContent {
        match self.next().await {
            VerificationMessage::Cancel(cancel) => cancel,
            other => panic!("expected cancel, got {:?}", other),
        }
    }

    /// Everything already delivered, without waiting.
    fn drain(&mut self) -> Vec<VerificationMessage> {
        let mut messages = Vec::new();
        while let Ok(envelope) = self.inbox.try_recv() {
            messages.push(envelope.message);
        }
        messages
    }

    fn start(&self, transaction_id: &str) -> StartContent {
        StartContent {
            from_device: self.identity.device_id.clone(),
            transaction_id: TransactionId::new(transaction_id),
            method: VerificationMethod::SasV1,
            key_agreement_protocols: vec![KeyAgreementProtocol::Curve25519HkdfSha256],
            hashes: vec![HashMethod::Sha256],
            message_authentication_codes: vec![MacMethod::HkdfHmacSha256],
            short_authentication_string: vec![SasMethod::Decimal],
        }
    }

    fn accept_for(&self, start: &StartContent) -> VerificationMessage {
        let canonical = canonical_json(start).unwrap();
        VerificationMessage::Accept(AcceptContent {
            transaction_id: start.transaction_id.clone(),
            method: VerificationMethod::SasV1,
            key_agreement_protocol: KeyAgreementProtocol::Curve25519HkdfSha256,
            hash: HashMethod::Sha256,
            message_authentication_code: MacMethod::HkdfHmacSha256,
            short_authentication_string: vec![SasMethod::Decimal],
            commitment: mac::commitment(&self.sas.public_key(), &canonical),
        })
    }

    fn key(&self, transaction_id: &TransactionId) -> VerificationMessage {
        VerificationMessage::Key(KeyContent {
            transaction_id: transaction_id.clone(),
            key: self.sas.public_key(),
        })
    }

    /// A correct MAC of our signing key, addressed to `receiver`.
    fn mac_for(&self, transaction_id: &TransactionId, receiver: &DeviceIdentity) -> VerificationMessage {
        let parties = mac::MacParties {
            sender_user: &self.user,
            sender_device: &self.identity.device_id,
            receiver_user: &receiver.user_id,
            receiver_device: &receiver.device_id,
            transaction_id,
        };
        let key_id = self.identity.key_id();
        let macs = mac::key_macs(
            &self.sas,
            &parties,
            &self.identity.signing_key,
            &key_id,
            [key_id.as_str()],
        )
        .unwrap();
        VerificationMessage::Mac(MacContent {
            transaction_id: transaction_id.clone(),
            mac: [(key_id, macs.key_mac)].into_iter().collect(),
            keys: macs.key_list_mac,
        })
    }
}

/// Drive an engine-backed Alice and a scripted Bob up to the SAS comparison.
async fn exchange_keys(alice: &Peer, bob: &mut Scripted) -> TransactionId {
    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    let start = bob.next_start().await;
    let id = start.transaction_id.clone();

    alice.engine.handle_message(&bob.user, bob.accept_for(&start)).await.unwrap();
    match bob.next().await {
        VerificationMessage::Key(key) => bob.sas.set_peer_key(&key.key).unwrap(),
        other => panic!("expected key, got {:?}", other),
    }
    alice.engine.handle_message(&bob.user, bob.key(&id)).await.unwrap();
    assert_eq!(
        alice.engine.phase_of(&bob.user, &id).await,
        Some(Phase::AwaitingSasConfirmation)
    );
    id
}

/// An engine-backed Alice facing a scripted Bob. Alice is not attached: the
/// test hands her Bob's messages directly.
fn alice_vs_scripted(config: VerificationConfig) -> (MemoryNetwork, Peer, Scripted) {
    let network = MemoryNetwork::new();
    let alice = Peer::new(
        &network,
        ALICE,
        ALICE_DEVICE,
        TestHandler::new(Decision::Accept, TestHooks::new(Answer::Hold)),
        config,
    );
    let bob = Scripted::new(&network, BOB, BOB_DEVICE);
    alice.store.add_device(bob.identity.clone());
    (network, alice, bob)
}

/// An engine-backed Bob receiving from a scripted Alice.
fn scripted_vs_bob(decision: Decision) -> (MemoryNetwork, Scripted, Peer) {
    let network = MemoryNetwork::new();
    let alice = Scripted::new(&network, ALICE, ALICE_DEVICE);
    let bob = Peer::new(
        &network,
        BOB,
        BOB_DEVICE,
        TestHandler::new(decision, TestHooks::new(Answer::Hold)),
        VerificationConfig::default(),
    );
    bob.store.add_device(alice.identity.clone());
    (network, alice, bob)
}

fn is_cancel_with(message: &VerificationMessage, code: &CancelCode) -> bool {
    matches!(message, VerificationMessage::Cancel(c) if c.code == *code)
}

// ---------------------------------------------------------------------------
// Full Handshakes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn both_humans_confirm_and_both_devices_are_verified() {
    let (_network, alice, bob) = pair(
        Answer::Match,
        TestHandler::new(Decision::Accept, TestHooks::new(Answer::Match)),
    );

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();

    assert_eq!(alice.hooks().outcome().await, Outcome::Verified);
    assert_eq!(bob.hooks().outcome().await, Outcome::Verified);

    let (alice_sas, bob_sas) = (alice.hooks().shown().unwrap(), bob.hooks().shown().unwrap());
    assert_eq!(alice_sas, bob_sas);
    assert_eq!(alice_sas.method(), SasMethod::Emoji);

    assert_eq!(alice.trust_writes(), 1);
    assert_eq!(bob.trust_writes(), 1);
    assert!(alice.store.is_verified(bob.user(), &bob.identity.device_id));
    assert!(bob.store.is_verified(alice.user(), &alice.identity.device_id));
    assert!(alice.engine.active_transactions().is_empty());
    assert!(bob.engine.active_transactions().is_empty());
    assert_eq!(alice.hooks().successes(), 1);
    assert_eq!(alice.hooks().cancels(), 0);
}

#[tokio::test]
async fn decimal_only_peer_gets_a_decimal_sas() {
    let (_network, alice, bob) = pair(
        Answer::Match,
        TestHandler::new(
            Decision::Accept,
            TestHooks::with_methods(Answer::Match, vec![SasMethod::Decimal]),
        ),
    );

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();

    assert_eq!(alice.hooks().outcome().await, Outcome::Verified);
    assert_eq!(bob.hooks().outcome().await, Outcome::Verified);
    let sas = alice.hooks().shown().unwrap();
    assert_eq!(sas.method(), SasMethod::Decimal);
    assert_eq!(Some(sas), bob.hooks().shown());
}

#[tokio::test]
async fn one_human_says_mismatch_and_both_sides_cancel() {
    let (_network, alice, bob) = pair(
        Answer::Match,
        TestHandler::new(Decision::Accept, TestHooks::new(Answer::Mismatch)),
    );

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();

    assert_eq!(
        bob.hooks().outcome().await,
        Outcome::cancelled(true, "SAS do not match", CancelCode::SasMismatch)
    );
    assert_eq!(
        alice.hooks().outcome().await,
        Outcome::cancelled(false, "SAS do not match", CancelCode::SasMismatch)
    );
    assert_eq!(alice.trust_writes(), 0);
    assert_eq!(bob.trust_writes(), 0);
    assert_eq!(alice.hooks().cancels(), 1);
    assert_eq!(bob.hooks().cancels(), 1);
}

#[tokio::test]
async fn request_then_start_runs_a_full_verification() {
    let (network, alice, bob) = pair(
        Answer::Match,
        TestHandler::new(Decision::Accept, TestHooks::new(Answer::Match)),
    );

    let requester_hooks = TestHooks::new(Answer::Match);
    let transaction_id = alice
        .engine
        .request_verification(&bob.identity, requester_hooks.clone())
        .await
        .unwrap();

    assert_eq!(requester_hooks.outcome().await, Outcome::Verified);
    assert_eq!(bob.hooks().outcome().await, Outcome::Verified);

    // Bob was asked; Alice's Start came back under the request's id and was
    // accepted without asking Alice's handler.
    assert_eq!(bob.handler.calls(), 1);
    assert_eq!(alice.handler.calls(), 0);
    let starts = network.delivered_of("m.key.verification.start");
    assert_eq!(starts.len(), 1);
    assert_eq!(starts[0].message.transaction_id(), &transaction_id);
    assert_eq!(starts[0].from, *bob.user());
}

#[tokio::test]
async fn rejected_start_cancels_with_user_code() {
    let (_network, alice, bob) = pair(
        Answer::Match,
        TestHandler::new(Decision::Reject, TestHooks::new(Answer::Match)),
    );

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();

    assert_eq!(
        alice.hooks().outcome().await,
        Outcome::cancelled(false, "Not accepted by user", CancelCode::User)
    );
    assert!(bob.engine.active_transactions().is_empty());
}

#[tokio::test]
async fn tampered_keys_mac_is_rejected() {
    let (network, alice, bob) = pair(
        Answer::Match,
        TestHandler::new(Decision::Accept, TestHooks::new(Answer::Match)),
    );
    let bob_user = bob.user().clone();
    network.set_interceptor(Some(Arc::new(move |envelope: &mut Envelope| {
        if envelope.from == bob_user {
            if let VerificationMessage::Mac(content) = &mut envelope.message {
                content.keys = "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".to_string();
            }
        }
        true
    })));

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();

    assert_eq!(
        alice.hooks().outcome().await,
        Outcome::cancelled(true, "Mismatched keys MACs", CancelCode::KeyMismatch)
    );
    assert_eq!(alice.trust_writes(), 0);
}

#[tokio::test]
async fn tampered_device_key_mac_is_rejected() {
    let (network, alice, bob) = pair(
        Answer::Match,
        TestHandler::new(Decision::Accept, TestHooks::new(Answer::Match)),
    );
    let bob_user = bob.user().clone();
    network.set_interceptor(Some(Arc::new(move |envelope: &mut Envelope| {
        if envelope.from == bob_user {
            if let VerificationMessage::Mac(content) = &mut envelope.message {
                for value in content.mac.values_mut() {
                    let flipped = if value.starts_with('A') { "B" } else { "A" };
                    value.replace_range(0..1, flipped);
                }
            }
        }
        true
    })));

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();

    assert_eq!(
        alice.hooks().outcome().await,
        Outcome::cancelled(true, "Mismatched PK MACs", CancelCode::KeyMismatch)
    );
    assert_eq!(alice.trust_writes(), 0);
}

#[tokio::test]
async fn shutdown_cancels_live_transactions() {
    let (_network, alice, bob) = pair(
        Answer::Hold,
        TestHandler::new(Decision::Accept, TestHooks::new(Answer::Hold)),
    );

    let transaction_id = alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();

    // Wait until both humans are looking at the SAS.
    tokio::time::timeout(WAIT, async {
        while alice.hooks().shown().is_none() || bob.hooks().shown().is_none() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("SAS shown on both sides");
    assert_eq!(
        alice.engine.phase_of(bob.user(), &transaction_id).await,
        Some(Phase::AwaitingSasConfirmation)
    );

    alice.engine.shutdown().await;

    assert_eq!(
        alice.hooks().outcome().await,
        Outcome::cancelled(true, "Verification engine shutting down", CancelCode::User)
    );
    assert_eq!(
        bob.hooks().outcome().await,
        Outcome::cancelled(false, "Verification engine shutting down", CancelCode::User)
    );
    assert!(alice.engine.active_transactions().is_empty());
}

// ---------------------------------------------------------------------------
// Scripted Peers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unknown_transaction_gets_exactly_one_cancel() {
    let (_network, mut alice, bob) = scripted_vs_bob(Decision::Accept);

    let result = bob
        .engine
        .handle_message(&alice.user, alice.key(&TransactionId::new("nope")))
        .await;
    assert!(matches!(result, Err(VerificationError::UnknownTransaction(id)) if id == "nope"));

    let messages = alice.drain();
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        VerificationMessage::Cancel(cancel) => {
            assert_eq!(cancel.code, CancelCode::UnknownTransaction);
            assert_eq!(cancel.reason, "Unknown transaction: nope");
        }
        other => panic!("expected cancel, got {:?}", other),
    }
    assert!(bob.engine.active_transactions().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn colliding_starts_leave_one_transaction() {
    let (_network, mut alice, bob) = scripted_vs_bob(Decision::Accept);
    let start = alice.start("collide");

    let tasks: Vec<_> = (0..2)
        .map(|_| {
            let engine = bob.engine.clone();
            let sender = alice.user.clone();
            let message = VerificationMessage::Start(start.clone());
            tokio::spawn(async move { engine.handle_message(&sender, message).await })
        })
        .collect();

    let mut ok = 0;
    let mut cancelled = 0;
    for task in tasks {
        match task.await.unwrap() {
            Ok(()) => ok += 1,
            Err(VerificationError::Cancelled { code, reason }) => {
                assert_eq!(code, CancelCode::UnexpectedMessage);
                assert_eq!(reason, "Transaction already exists");
                cancelled += 1;
            }
            Err(other) => panic!("unexpected error {:?}", other),
        }
    }
    assert_eq!((ok, cancelled), (1, 1));
    assert_eq!(bob.engine.active_transactions().len(), 1);

    let messages = alice.drain();
    assert_eq!(messages.len(), 2);
    assert_eq!(
        messages
            .iter()
            .filter(|m| matches!(m, VerificationMessage::Accept(_)))
            .count(),
        1
    );
    assert_eq!(
        messages
            .iter()
            .filter(|m| is_cancel_with(m, &CancelCode::UnexpectedMessage))
            .count(),
        1
    );
}

#[tokio::test]
async fn local_start_with_live_id_is_refused() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());
    let id = TransactionId::new("dup");

    alice
        .engine
        .start_verification(&bob.identity, alice.hooks().clone(), Some(id.clone()), None)
        .await
        .unwrap();
    let again = alice
        .engine
        .start_verification(&bob.identity, alice.hooks().clone(), Some(id), None)
        .await;
    assert!(matches!(again, Err(VerificationError::TransactionExists(_))));
    assert_eq!(bob.drain().len(), 1);
}

#[tokio::test]
async fn second_key_cancels_the_transaction() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    let start = bob.next_start().await;
    let id = start.transaction_id.clone();

    alice.engine.handle_message(&bob.user, bob.accept_for(&start)).await.unwrap();
    match bob.next().await {
        VerificationMessage::Key(key) => bob.sas.set_peer_key(&key.key).unwrap(),
        other => panic!("expected key, got {:?}", other),
    }

    alice.engine.handle_message(&bob.user, bob.key(&id)).await.unwrap();
    assert_eq!(
        alice.engine.phase_of(&bob.user, &id).await,
        Some(Phase::AwaitingSasConfirmation)
    );

    let second = alice.engine.handle_message(&bob.user, bob.key(&id)).await;
    assert!(matches!(
        second,
        Err(VerificationError::Cancelled { code: CancelCode::UnexpectedMessage, .. })
    ));

    let cancel = bob.next_cancel().await;
    assert_eq!(cancel.reason, "Unexpected key message");
    assert_eq!(
        alice.hooks().outcome().await,
        Outcome::cancelled(true, "Unexpected key message", CancelCode::UnexpectedMessage)
    );
    assert!(alice.engine.active_transactions().is_empty());
}

#[tokio::test]
async fn accept_twice_is_unexpected() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    let start = bob.next_start().await;

    alice.engine.handle_message(&bob.user, bob.accept_for(&start)).await.unwrap();
    let again = alice.engine.handle_message(&bob.user, bob.accept_for(&start)).await;
    assert!(matches!(
        again,
        Err(VerificationError::Cancelled { code: CancelCode::UnexpectedMessage, .. })
    ));

    assert!(matches!(bob.next().await, VerificationMessage::Key(_)));
    assert_eq!(bob.next_cancel().await.reason, "Unexpected accept message");
}

#[tokio::test]
async fn accept_with_unknown_hash_is_refused() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    let start = bob.next_start().await;

    let mut accept = bob.accept_for(&start);
    if let VerificationMessage::Accept(content) = &mut accept {
        content.hash = HashMethod::Other("sha512".to_string());
    }
    let result = alice.engine.handle_message(&bob.user, accept).await;
    assert!(matches!(
        result,
        Err(VerificationError::Cancelled { code: CancelCode::UnknownMethod, .. })
    ));
    assert_eq!(bob.next_cancel().await.reason, "Verification uses unknown method");
}

#[tokio::test]
async fn wrong_commitment_is_detected() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    let start = bob.next_start().await;
    let id = start.transaction_id.clone();

    // Commit to one key, then reveal another.
    alice.engine.handle_message(&bob.user, bob.accept_for(&start)).await.unwrap();
    let _ = bob.next().await;
    let impostor = SasKeyAgreement::generate_keypair();
    let reveal = VerificationMessage::Key(KeyContent {
        transaction_id: id,
        key: impostor.public_key(),
    });

    let result = alice.engine.handle_message(&bob.user, reveal).await;
    assert!(matches!(
        result,
        Err(VerificationError::Cancelled { code: CancelCode::CommitmentMismatch, .. })
    ));
    assert_eq!(bob.next_cancel().await.reason, "Commitment mismatch");
}

#[tokio::test]
async fn remote_cancel_is_reported_and_not_answered() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    let start = bob.next_start().await;

    let cancel = VerificationMessage::Cancel(CancelContent {
        transaction_id: start.transaction_id.clone(),
        reason: "Changed my mind".to_string(),
        code: CancelCode::User,
    });
    alice.engine.handle_message(&bob.user, cancel.clone()).await.unwrap();

    assert_eq!(
        alice.hooks().outcome().await,
        Outcome::cancelled(false, "Changed my mind", CancelCode::User)
    );
    assert!(alice.engine.active_transactions().is_empty());

    // A repeated cancel for a finished transaction is silently dropped too.
    alice.engine.handle_message(&bob.user, cancel).await.unwrap();
    assert!(bob.drain().is_empty());
    assert_eq!(alice.hooks().cancels(), 1);
}

#[tokio::test]
async fn start_with_unsupported_hash_creates_no_state() {
    let (_network, mut alice, bob) = scripted_vs_bob(Decision::Accept);
    let mut start = alice.start("hash");
    start.hashes = vec![HashMethod::Other("sha3-256".to_string())];

    let result = bob
        .engine
        .handle_message(&alice.user, VerificationMessage::Start(start))
        .await;
    assert!(matches!(
        result,
        Err(VerificationError::Cancelled { code: CancelCode::UnknownMethod, .. })
    ));

    let cancel = alice.next_cancel().await;
    assert_eq!(cancel.code, CancelCode::UnknownMethod);
    assert_eq!(cancel.reason, "Only SHA256 hashing is supported");
    assert!(bob.engine.active_transactions().is_empty());
    assert_eq!(bob.handler.calls(), 0);
}

#[tokio::test]
async fn start_from_unknown_device_is_dropped() {
    let (network, _alice, bob) = scripted_vs_bob(Decision::Accept);
    let mut stranger = Scripted::new(&network, ALICE, "STRANGER");

    let result = bob
        .engine
        .handle_message(&stranger.user, VerificationMessage::Start(stranger.start("s")))
        .await;
    assert!(matches!(result, Err(VerificationError::UnknownDevice { .. })));
    assert!(stranger.drain().is_empty());
}

#[tokio::test]
async fn ignored_start_gets_no_answer() {
    let (_network, mut alice, bob) = scripted_vs_bob(Decision::Ignore);

    bob.engine
        .handle_message(&alice.user, VerificationMessage::Start(alice.start("quiet")))
        .await
        .unwrap();
    assert_eq!(bob.handler.calls(), 1);
    assert!(alice.drain().is_empty());
    assert!(bob.engine.active_transactions().is_empty());
}

#[tokio::test]
async fn stale_request_is_ignored() {
    let (_network, mut alice, bob) = scripted_vs_bob(Decision::Accept);
    let request = VerificationMessage::Request(RequestContent {
        from_device: alice.identity.device_id.clone(),
        transaction_id: TransactionId::new("old"),
        methods: vec![VerificationMethod::SasV1],
        timestamp: chrono::Utc::now().timestamp_millis() - 60 * 60 * 1000,
    });

    bob.engine.handle_message(&alice.user, request).await.unwrap();
    assert_eq!(bob.handler.calls(), 0);
    assert!(alice.drain().is_empty());
}

#[tokio::test]
async fn request_without_sas_is_refused() {
    let (_network, mut alice, bob) = scripted_vs_bob(Decision::Accept);
    let request = VerificationMessage::Request(RequestContent {
        from_device: alice.identity.device_id.clone(),
        transaction_id: TransactionId::new("qr"),
        methods: vec![VerificationMethod::Other("m.qr_code.show.v1".to_string())],
        timestamp: chrono::Utc::now().timestamp_millis(),
    });

    let result = bob.engine.handle_message(&alice.user, request).await;
    assert!(result.is_err());
    assert_eq!(alice.next_cancel().await.code, CancelCode::UnknownMethod);
}

#[tokio::test]
async fn cancel_verification_for_unknown_id_fails() {
    let (_network, alice, _bob) = alice_vs_scripted(VerificationConfig::default());
    let result = alice
        .engine
        .cancel_verification(&UserId::new(BOB), &TransactionId::new("ghost"), "bye")
        .await;
    assert!(matches!(result, Err(VerificationError::UnknownTransaction(_))));
}

#[tokio::test]
async fn request_with_extreme_timestamp_is_ignored() {
    let (_network, mut alice, bob) = scripted_vs_bob(Decision::Accept);

    for (id, timestamp) in [("past", i64::MIN), ("future", i64::MAX)] {
        let request = VerificationMessage::Request(RequestContent {
            from_device: alice.identity.device_id.clone(),
            transaction_id: TransactionId::new(id),
            methods: vec![VerificationMethod::SasV1],
            timestamp,
        });
        let handled = tokio::spawn({
            let engine = bob.engine.clone();
            let sender = alice.user.clone();
            async move { engine.handle_message(&sender, request).await }
        })
        .await
        .expect("handler does not panic");
        assert!(handled.is_ok());
    }
    assert_eq!(bob.handler.calls(), 0);
    assert!(alice.drain().is_empty());

    // The engine still serves a well-formed request afterwards.
    let request = VerificationMessage::Request(RequestContent {
        from_device: alice.identity.device_id.clone(),
        transaction_id: TransactionId::new("now"),
        methods: vec![VerificationMethod::SasV1],
        timestamp: chrono::Utc::now().timestamp_millis(),
    });
    bob.engine.handle_message(&alice.user, request).await.unwrap();
    assert_eq!(bob.handler.calls(), 1);
    assert_eq!(alice.next_start().await.transaction_id.as_str(), "now");
}

// ---------------------------------------------------------------------------
// Local Answer After The Peer's MAC
// ---------------------------------------------------------------------------

#[tokio::test]
async fn peer_mac_waits_for_the_local_match() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());
    let id = exchange_keys(&alice, &mut bob).await;

    alice
        .engine
        .handle_message(&bob.user, bob.mac_for(&id, &alice.identity))
        .await
        .unwrap();
    assert_eq!(alice.engine.phase_of(&bob.user, &id).await, Some(Phase::MacExchanged));
    assert_eq!(alice.trust_writes(), 0);
    assert_eq!(alice.hooks().current(), Outcome::Pending);

    alice.engine.sas_compared(&bob.user, &id, true).await.unwrap();

    assert_eq!(alice.hooks().outcome().await, Outcome::Verified);
    assert_eq!(alice.trust_writes(), 1);
    assert!(alice.store.is_verified(&bob.user, &bob.identity.device_id));
    assert!(alice.engine.active_transactions().is_empty());
    assert!(matches!(bob.next().await, VerificationMessage::Mac(_)));

    // A second answer finds nothing to apply to.
    assert!(matches!(
        alice.engine.sas_compared(&bob.user, &id, true).await,
        Err(VerificationError::UnknownTransaction(_))
    ));
    assert_eq!(alice.trust_writes(), 1);
}

#[tokio::test]
async fn local_mismatch_after_peer_mac_cancels() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());
    let id = exchange_keys(&alice, &mut bob).await;

    alice
        .engine
        .handle_message(&bob.user, bob.mac_for(&id, &alice.identity))
        .await
        .unwrap();
    assert_eq!(alice.engine.phase_of(&bob.user, &id).await, Some(Phase::MacExchanged));

    let result = alice.engine.sas_compared(&bob.user, &id, false).await;
    assert!(matches!(
        result,
        Err(VerificationError::Cancelled { code: CancelCode::SasMismatch, .. })
    ));

    let cancel = bob.next_cancel().await;
    assert_eq!(cancel.code, CancelCode::SasMismatch);
    assert_eq!(cancel.reason, "SAS do not match");
    assert_eq!(
        alice.hooks().outcome().await,
        Outcome::cancelled(true, "SAS do not match", CancelCode::SasMismatch)
    );
    assert_eq!(alice.trust_writes(), 0);
    assert!(alice.engine.active_transactions().is_empty());
}

#[tokio::test]
async fn unsendable_mac_still_verifies_the_peer() {
    let (network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());
    let id = exchange_keys(&alice, &mut bob).await;

    alice
        .engine
        .handle_message(&bob.user, bob.mac_for(&id, &alice.identity))
        .await
        .unwrap();
    network.set_unreachable(BOB, BOB_DEVICE, true);

    let result = alice.engine.sas_compared(&bob.user, &id, true).await;
    assert!(matches!(result, Err(VerificationError::Transport(_))));

    assert_eq!(alice.hooks().outcome().await, Outcome::Verified);
    assert_eq!(alice.trust_writes(), 1);
    assert_eq!(alice.engine.phase_of(&bob.user, &id).await, None);
    assert!(bob.drain().is_empty());
}

// ---------------------------------------------------------------------------
// Cancellation Reporting
// ---------------------------------------------------------------------------

/// Hooks whose cancel callback never returns.
struct StuckOnCancel;

#[async_trait]
impl VerificationHooks for StuckOnCancel {
    fn supported_methods(&self) -> Vec<SasMethod> {
        vec![SasMethod::Decimal]
    }

    async fn confirm_sas(&self, _peer: &DeviceIdentity, _sas: &SasCode) -> bool {
        std::future::pending().await
    }

    async fn on_cancel(&self, _cancelled_by_us: bool, _reason: &str, _code: &CancelCode) {
        std::future::pending::<()>().await
    }

    async fn on_success(&self) {}
}

#[tokio::test]
async fn slow_cancel_callback_does_not_block_the_engine() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());

    let remote = alice
        .engine
        .start_simple_verification(&bob.identity, Arc::new(StuckOnCancel))
        .await
        .unwrap();
    let local = alice
        .engine
        .start_simple_verification(&bob.identity, Arc::new(StuckOnCancel))
        .await
        .unwrap();
    let _ = bob.drain();

    let cancel = VerificationMessage::Cancel(CancelContent {
        transaction_id: remote.clone(),
        reason: "Changed my mind".to_string(),
        code: CancelCode::User,
    });
    tokio::time::timeout(WAIT, alice.engine.handle_message(&bob.user, cancel))
        .await
        .expect("remote cancel handled without the host")
        .unwrap();
    tokio::time::timeout(WAIT, alice.engine.cancel_verification(&bob.user, &local, "Bye"))
        .await
        .expect("local cancel handled without the host")
        .unwrap();

    assert!(alice.engine.active_transactions().is_empty());
    assert_eq!(bob.next_cancel().await.transaction_id, local);
}

#[tokio::test]
async fn shutdown_withdraws_pending_requests() {
    let (_network, alice, mut bob) = alice_vs_scripted(VerificationConfig::default());

    let id = alice
        .engine
        .request_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    assert!(matches!(bob.next().await, VerificationMessage::Request(_)));

    alice.engine.shutdown().await;

    let cancel = bob.next_cancel().await;
    assert_eq!(cancel.transaction_id, id);
    assert_eq!(cancel.code, CancelCode::User);
    assert_eq!(cancel.reason, "Verification engine shutting down");
    assert_eq!(
        alice.hooks().outcome().await,
        Outcome::cancelled(true, "Verification engine shutting down", CancelCode::User)
    );

    // Nothing is left to cancel.
    assert!(matches!(
        alice.engine.cancel_verification(&bob.user, &id, "again").await,
        Err(VerificationError::UnknownTransaction(_))
    ));
}

// ---------------------------------------------------------------------------
// Timeouts
// ---------------------------------------------------------------------------

const SHORT: Duration = Duration::from_secs(30);

fn short_timeouts() -> VerificationConfig {
    VerificationConfig::default().with_sas_timeout(SHORT)
}

#[tokio::test(start_paused = true)]
async fn silent_peer_times_out_once() {
    let (_network, alice, mut bob) = alice_vs_scripted(short_timeouts());

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();

    tokio::time::sleep(SHORT + Duration::from_secs(1)).await;
    assert_eq!(
        alice.hooks().current(),
        Outcome::cancelled(true, "Timed out", CancelCode::Timeout)
    );

    tokio::time::sleep(SHORT * 10).await;
    assert_eq!(alice.hooks().cancels(), 1);
    assert!(alice.engine.active_transactions().is_empty());

    let messages = bob.drain();
    assert!(matches!(messages[0], VerificationMessage::Start(_)));
    assert_eq!(
        messages
            .iter()
            .filter(|m| is_cancel_with(m, &CancelCode::Timeout))
            .count(),
        1
    );
}

#[tokio::test(start_paused = true)]
async fn activity_extends_the_deadline() {
    let (_network, alice, mut bob) = alice_vs_scripted(short_timeouts());

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    let start = bob.next_start().await;
    let id = start.transaction_id.clone();

    tokio::time::sleep(Duration::from_secs(20)).await;
    alice.engine.handle_message(&bob.user, bob.accept_for(&start)).await.unwrap();

    // 40s after start, 20s after the Accept: still alive.
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(alice.engine.phase_of(&bob.user, &id).await, Some(Phase::Started));
    assert_eq!(alice.hooks().current(), Outcome::Pending);

    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(
        alice.hooks().current(),
        Outcome::cancelled(true, "Timed out", CancelCode::Timeout)
    );
}

#[tokio::test(start_paused = true)]
async fn late_accept_racing_the_timer_cancels_once() {
    let (_network, alice, mut bob) = alice_vs_scripted(short_timeouts());

    alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    let start = bob.next_start().await;

    // Wake exactly at the deadline, together with the timer task.
    tokio::time::sleep(SHORT).await;
    let _ = alice.engine.handle_message(&bob.user, bob.accept_for(&start)).await;

    tokio::time::sleep(SHORT * 3).await;
    assert_eq!(alice.hooks().cancels(), 1);
    assert_eq!(
        alice.hooks().current(),
        Outcome::cancelled(true, "Timed out", CancelCode::Timeout)
    );
    let timeouts = bob
        .drain()
        .iter()
        .filter(|m| is_cancel_with(m, &CancelCode::Timeout))
        .count();
    assert_eq!(timeouts, 1);
    assert!(alice.engine.active_transactions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn host_cancel_racing_the_timer_cancels_once() {
    let (_network, alice, mut bob) = alice_vs_scripted(short_timeouts());

    let id = alice
        .engine
        .start_simple_verification(&bob.identity, alice.hooks().clone())
        .await
        .unwrap();
    let _ = bob.next_start().await;

    tokio::time::sleep(SHORT).await;
    let _ = alice.engine.cancel_verification(&bob.user, &id, "User gave up").await;

    tokio::time::sleep(SHORT * 3).await;
    assert_eq!(alice.hooks().cancels(), 1);
    let cancels = bob
        .drain()
        .iter()
        .filter(|m| matches!(m, VerificationMessage::Cancel(_)))
        .count();
    assert_eq!(cancels, 1);
}
