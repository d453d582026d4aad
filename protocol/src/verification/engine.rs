//! # Verification Engine
//!
//! Dispatches inbound verification messages to their transaction, drives the
//! phase machine, and exposes the local operations a host needs to start,
//! request and cancel verifications.
//!
//! ## Locking
//!
//! - The store is touched only for single map operations.
//! - Each handler holds exactly one transaction lock, for the whole handler,
//!   including the outbound sends of that transaction.
//! - The human comparison runs in a spawned task and re-acquires the lock to
//!   apply its result.
//! - The timer task takes the same lock before deciding to cancel.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use ed25519_dalek::VerifyingKey;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, error, info, warn};

use crate::config::{device_key_id, VerificationConfig};
use crate::crypto::canonical_json;

use super::error::{CancelCode, TransportError, VerificationError, VerificationResult};
use super::hooks::{AcceptDecision, DeviceStore, Transport, VerificationHandler, VerificationHooks};
use super::mac::{self, MacParties};
use super::message::{
    AcceptContent, CancelContent, DeviceId, DeviceIdentity, HashMethod, KeyAgreementProtocol,
    KeyContent, MacContent, MacMethod, RequestContent, SasMethod, StartContent, TransactionId,
    UserId, VerificationMessage, VerificationMethod,
};
use super::methods::{self, SasParty};
use super::store::{Handle, TransactionKey, TransactionStore};
use super::timeout::{self, Deadline};
use super::transaction::{Phase, VerificationTransaction};

type Guard = OwnedMutexGuard<VerificationTransaction>;

// ---------------------------------------------------------------------------
// Own Device
// ---------------------------------------------------------------------------

/// The local device: who we are on the wire and the signing key we MAC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnDevice {
    /// Our user.
    pub user_id: UserId,
    /// Our device.
    pub device_id: DeviceId,
    /// Our Ed25519 signing key, unpadded base64.
    pub signing_key: String,
}

impl OwnDevice {
    /// Describe the local device.
    pub fn new(
        user_id: impl Into<UserId>,
        device_id: impl Into<DeviceId>,
        signing_key: &VerifyingKey,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            signing_key: STANDARD_NO_PAD.encode(signing_key.as_bytes()),
        }
    }

    /// Key id of our signing key.
    pub fn key_id(&self) -> String {
        device_key_id(self.device_id.as_str())
    }

    /// How peers see this device.
    pub fn identity(&self) -> DeviceIdentity {
        DeviceIdentity {
            user_id: self.user_id.clone(),
            device_id: self.device_id.clone(),
            signing_key: self.signing_key.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// A Request we sent and whose Start we will accept without asking.
struct PendingRequest {
    device: DeviceIdentity,
    hooks: Arc<dyn VerificationHooks>,
    sent_at: Instant,
}

struct EngineInner {
    own: OwnDevice,
    config: VerificationConfig,
    transport: Arc<dyn Transport>,
    devices: Arc<dyn DeviceStore>,
    handler: Arc<dyn VerificationHandler>,
    store: TransactionStore,
    pending_requests: DashMap<TransactionKey, PendingRequest>,
}

/// The SAS verification engine of one device.
///
/// Cheap to clone; all clones share the same transactions.
#[derive(Clone)]
pub struct VerificationEngine {
    inner: Arc<EngineInner>,
}

impl VerificationEngine {
    /// Create an engine for `own` with the default configuration.
    pub fn new(
        own: OwnDevice,
        transport: Arc<dyn Transport>,
        devices: Arc<dyn DeviceStore>,
        handler: Arc<dyn VerificationHandler>,
    ) -> Self {
        Self::with_config(own, VerificationConfig::default(), transport, devices, handler)
    }

    /// Create an engine with an explicit configuration.
    pub fn with_config(
        own: OwnDevice,
        config: VerificationConfig,
        transport: Arc<dyn Transport>,
        devices: Arc<dyn DeviceStore>,
        handler: Arc<dyn VerificationHandler>,
    ) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                own,
                config,
                transport,
                devices,
                handler,
                store: TransactionStore::new(),
                pending_requests: DashMap::new(),
            }),
        }
    }

    /// The local device.
    pub fn own_device(&self) -> &OwnDevice {
        &self.inner.own
    }

    /// The engine configuration.
    pub fn config(&self) -> &VerificationConfig {
        &self.inner.config
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    /// Keys of all live transactions.
    pub fn active_transactions(&self) -> Vec<TransactionKey> {
        self.inner.store.keys()
    }

    /// Current phase of a live transaction.
    pub async fn phase_of(&self, user_id: &UserId, transaction_id: &TransactionId) -> Option<Phase> {
        let handle = self
            .inner
            .store
            .load(&TransactionKey::new(user_id.clone(), transaction_id.clone()))?;
        let txn = handle.lock().await;
        Some(txn.phase.clone())
    }

    // -----------------------------------------------------------------------
    // Local Operations
    // -----------------------------------------------------------------------

    /// Start a verification with a generated transaction id and the default
    /// timeout.
    pub async fn start_simple_verification(
        &self,
        device: &DeviceIdentity,
        hooks: Arc<dyn VerificationHooks>,
    ) -> VerificationResult<TransactionId> {
        self.start_verification(device, hooks, None, None).await
    }

    /// Send a Start to `device` and track the new transaction.
    ///
    /// A missing `transaction_id` is generated; a missing `timeout` uses the
    /// configured default.
    pub async fn start_verification(
        &self,
        device: &DeviceIdentity,
        hooks: Arc<dyn VerificationHooks>,
        transaction_id: Option<TransactionId>,
        timeout: Option<Duration>,
    ) -> VerificationResult<TransactionId> {
        let transaction_id = transaction_id.unwrap_or_else(TransactionId::generate);
        let key = TransactionKey::new(device.user_id.clone(), transaction_id.clone());
        let our_methods = self.methods_of(hooks.as_ref());

        let start = StartContent {
            from_device: self.inner.own.device_id.clone(),
            transaction_id: transaction_id.clone(),
            method: VerificationMethod::SasV1,
            key_agreement_protocols: vec![KeyAgreementProtocol::Curve25519HkdfSha256],
            hashes: vec![HashMethod::Sha256],
            message_authentication_codes: vec![MacMethod::HkdfHmacSha256],
            short_authentication_string: our_methods.clone(),
        };
        let canonical = canonical_json(&start)?;

        let deadline = Deadline::new(timeout.unwrap_or(self.inner.config.sas_timeout));
        let (handle, existed) = self.inner.store.load_or_create(key.clone(), || {
            VerificationTransaction::outgoing(
                transaction_id.clone(),
                device.clone(),
                hooks,
                our_methods,
                deadline,
            )
        });
        if existed {
            return Err(VerificationError::TransactionExists(transaction_id.to_string()));
        }

        let mut txn = Arc::clone(&handle).lock_owned().await;
        txn.start_canonical = Some(canonical);
        self.arm(&handle, &mut txn);

        debug!(
            transaction = %transaction_id,
            user = %device.user_id,
            device = %device.device_id,
            "starting verification"
        );

        let message = VerificationMessage::Start(start);
        if let Err(err) = self.send(&device.user_id, &device.device_id, &message).await {
            txn.phase = Phase::Cancelled {
                code: CancelCode::User,
                reason: "Failed to send start".to_string(),
            };
            txn.disarm();
            self.inner.store.delete(&key, &handle);
            return Err(err.into());
        }

        Ok(transaction_id)
    }

    /// Ask `device` to start a verification with us.
    ///
    /// The Start that answers the request is accepted with `hooks` without
    /// consulting the [`VerificationHandler`].
    pub async fn request_verification(
        &self,
        device: &DeviceIdentity,
        hooks: Arc<dyn VerificationHooks>,
    ) -> VerificationResult<TransactionId> {
        let transaction_id = TransactionId::generate();
        let key = TransactionKey::new(device.user_id.clone(), transaction_id.clone());
        self.inner.pending_requests.insert(
            key.clone(),
            PendingRequest {
                device: device.clone(),
                hooks,
                sent_at: Instant::now(),
            },
        );

        let request = VerificationMessage::Request(RequestContent {
            from_device: self.inner.own.device_id.clone(),
            transaction_id: transaction_id.clone(),
            methods: vec![VerificationMethod::SasV1],
            timestamp: chrono::Utc::now().timestamp_millis(),
        });

        debug!(
            transaction = %transaction_id,
            user = %device.user_id,
            device = %device.device_id,
            "requesting verification"
        );

        if let Err(err) = self.send(&device.user_id, &device.device_id, &request).await {
            self.inner.pending_requests.remove(&key);
            return Err(err.into());
        }
        Ok(transaction_id)
    }

    /// Cancel a verification on behalf of the user.
    ///
    /// Also withdraws a Request we sent that has not been answered yet.
    pub async fn cancel_verification(
        &self,
        user_id: &UserId,
        transaction_id: &TransactionId,
        reason: &str,
    ) -> VerificationResult<()> {
        let key = TransactionKey::new(user_id.clone(), transaction_id.clone());

        if let Some(handle) = self.inner.store.load(&key) {
            let mut txn = Arc::clone(&handle).lock_owned().await;
            if !txn.phase.is_terminal() {
                debug!(transaction = %transaction_id, reason, "user cancelled verification");
                self.cancel_locked(&mut txn, &handle, CancelCode::User, reason).await;
                return Ok(());
            }
        }

        if let Some((_, pending)) = self.inner.pending_requests.remove(&key) {
            debug!(transaction = %transaction_id, reason, "withdrawing verification request");
            let cancel = cancel_message(transaction_id, reason, CancelCode::User);
            let _ = self
                .send(&pending.device.user_id, &pending.device.device_id, &cancel)
                .await;
            notify_cancel(pending.hooks, true, reason, CancelCode::User);
            return Ok(());
        }

        Err(VerificationError::UnknownTransaction(transaction_id.to_string()))
    }

    /// Send a Cancel without touching any transaction state.
    pub async fn send_cancel(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        transaction_id: &TransactionId,
        reason: &str,
        code: CancelCode,
    ) -> Result<(), TransportError> {
        let cancel = cancel_message(transaction_id, reason, code);
        self.send(user_id, device_id, &cancel).await
    }

    /// Feed the human's comparison result into a transaction.
    ///
    /// The engine calls this itself with the result of
    /// [`VerificationHooks::confirm_sas`]; an answer that arrives after the
    /// first one is ignored.
    pub async fn sas_compared(
        &self,
        user_id: &UserId,
        transaction_id: &TransactionId,
        matched: bool,
    ) -> VerificationResult<()> {
        let key = TransactionKey::new(user_id.clone(), transaction_id.clone());
        let handle = self
            .inner
            .store
            .load(&key)
            .ok_or_else(|| VerificationError::UnknownTransaction(transaction_id.to_string()))?;
        self.apply_sas_result(&handle, matched).await
    }

    /// Cancel every live transaction and withdraw every pending request.
    pub async fn shutdown(&self) {
        let keys = self.inner.store.keys();
        info!(transactions = keys.len(), "shutting down verification engine");
        for key in keys {
            let Some(handle) = self.inner.store.load(&key) else {
                continue;
            };
            let mut txn = Arc::clone(&handle).lock_owned().await;
            self.cancel_locked(
                &mut txn,
                &handle,
                CancelCode::User,
                "Verification engine shutting down",
            )
            .await;
        }

        let pending: Vec<TransactionKey> = self
            .inner
            .pending_requests
            .iter()
            .map(|slot| slot.key().clone())
            .collect();
        for key in pending {
            let Some((_, request)) = self.inner.pending_requests.remove(&key) else {
                continue;
            };
            let reason = "Verification engine shutting down";
            let cancel = cancel_message(&key.transaction_id, reason, CancelCode::User);
            let _ = self
                .send(&request.device.user_id, &request.device.device_id, &cancel)
                .await;
            notify_cancel(request.hooks, true, reason, CancelCode::User);
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch
    // -----------------------------------------------------------------------

    /// Handle one inbound message from `sender`.
    ///
    /// Protocol violations cancel the transaction and come back as
    /// [`VerificationError::Cancelled`]; callers usually just log them.
    pub async fn handle_message(
        &self,
        sender: &UserId,
        message: VerificationMessage,
    ) -> VerificationResult<()> {
        debug!(
            from = %sender,
            event = message.event_type(),
            transaction = %message.transaction_id(),
            "received verification message"
        );
        match message {
            VerificationMessage::Request(content) => self.on_request(sender, content).await,
            VerificationMessage::Start(content) => self.on_start(sender, content).await,
            VerificationMessage::Accept(content) => self.on_accept(sender, content).await,
            VerificationMessage::Key(content) => self.on_key(sender, content).await,
            VerificationMessage::Mac(content) => self.on_mac(sender, content).await,
            VerificationMessage::Cancel(content) => {
                self.on_cancel(sender, content).await;
                Ok(())
            }
        }
    }

    async fn on_request(&self, sender: &UserId, content: RequestContent) -> VerificationResult<()> {
        let device = self.resolve_device(sender, &content.from_device).await?;
        self.check_device_owner(sender, &device, &content.transaction_id).await?;

        if !content.methods.contains(&VerificationMethod::SasV1) {
            return Err(self
                .reject_unlocked(
                    &device,
                    &content.transaction_id,
                    CancelCode::UnknownMethod,
                    "Only SAS method is supported",
                )
                .await);
        }

        if !self.request_is_fresh(content.timestamp) {
            debug!(
                transaction = %content.transaction_id,
                timestamp = content.timestamp,
                "ignoring stale verification request"
            );
            return Ok(());
        }

        match self
            .inner
            .handler
            .accept_verification_from(&content.transaction_id, &device)
            .await
        {
            AcceptDecision::Accept(hooks) => {
                debug!(transaction = %content.transaction_id, "accepting verification request");
                self.start_verification(&device, hooks, Some(content.transaction_id), None)
                    .await
                    .map(|_| ())
            }
            AcceptDecision::Reject => {
                debug!(transaction = %content.transaction_id, "rejecting verification request");
                let _ = self
                    .send_cancel(
                        &device.user_id,
                        &device.device_id,
                        &content.transaction_id,
                        "Not accepted by user",
                        CancelCode::User,
                    )
                    .await;
                Ok(())
            }
            AcceptDecision::Ignore => {
                debug!(transaction = %content.transaction_id, "ignoring verification request");
                Ok(())
            }
        }
    }

    async fn on_start(&self, sender: &UserId, content: StartContent) -> VerificationResult<()> {
        let device = self.resolve_device(sender, &content.from_device).await?;
        self.check_device_owner(sender, &device, &content.transaction_id).await?;

        if let Some(reason) = unsupported_start(&content) {
            return Err(self
                .reject_unlocked(&device, &content.transaction_id, CancelCode::UnknownMethod, reason)
                .await);
        }

        let key = TransactionKey::new(sender.clone(), content.transaction_id.clone());
        let hooks = match self.answered_request(&key) {
            Some(hooks) => hooks,
            None => match self
                .inner
                .handler
                .accept_verification_from(&content.transaction_id, &device)
                .await
            {
                AcceptDecision::Accept(hooks) => hooks,
                AcceptDecision::Reject => {
                    debug!(transaction = %content.transaction_id, "rejecting verification start");
                    let _ = self
                        .send_cancel(
                            &device.user_id,
                            &device.device_id,
                            &content.transaction_id,
                            "Not accepted by user",
                            CancelCode::User,
                        )
                        .await;
                    return Ok(());
                }
                AcceptDecision::Ignore => {
                    debug!(transaction = %content.transaction_id, "ignoring verification start");
                    return Ok(());
                }
            },
        };

        let our_methods = self.methods_of(hooks.as_ref());
        let common = methods::common_methods(&our_methods, &content.short_authentication_string);
        let Some(chosen) = common.first().cloned() else {
            return Err(self
                .reject_unlocked(
                    &device,
                    &content.transaction_id,
                    CancelCode::UnknownMethod,
                    "No common SAS methods",
                )
                .await);
        };

        let canonical = canonical_json(&content)?;
        let deadline = Deadline::new(self.inner.config.sas_timeout);
        let (handle, existed) = self.inner.store.load_or_create(key, || {
            VerificationTransaction::incoming(
                content.transaction_id.clone(),
                device.clone(),
                hooks,
                our_methods,
                chosen,
                deadline,
            )
        });
        if existed {
            warn!(transaction = %content.transaction_id, "transaction already exists, cancelling start");
            return Err(self
                .reject_unlocked(
                    &device,
                    &content.transaction_id,
                    CancelCode::UnexpectedMessage,
                    "Transaction already exists",
                )
                .await);
        }

        let mut txn = Arc::clone(&handle).lock_owned().await;
        if txn.phase.is_terminal() {
            return Ok(());
        }
        self.arm(&handle, &mut txn);

        let accept = VerificationMessage::Accept(AcceptContent {
            transaction_id: content.transaction_id.clone(),
            method: VerificationMethod::SasV1,
            key_agreement_protocol: KeyAgreementProtocol::Curve25519HkdfSha256,
            hash: HashMethod::Sha256,
            message_authentication_code: MacMethod::HkdfHmacSha256,
            short_authentication_string: common,
            commitment: mac::commitment(&txn.sas.public_key(), &canonical),
        });
        debug!(
            transaction = %content.transaction_id,
            method = ?txn.chosen_method,
            "accepting verification start"
        );
        self.send(&device.user_id, &device.device_id, &accept).await?;
        Ok(())
    }

    async fn on_accept(&self, sender: &UserId, content: AcceptContent) -> VerificationResult<()> {
        let (handle, mut txn) = self.lock_transaction(sender, &content.transaction_id).await?;
        txn.deadline.extend();

        if !txn.initiated_by_us || txn.phase != Phase::AwaitingStart {
            return Err(self
                .cancel_locked(&mut txn, &handle, CancelCode::UnexpectedMessage, "Unexpected accept message")
                .await);
        }

        let common = methods::common_methods(&txn.our_methods, &content.short_authentication_string);
        let chosen = match common.first() {
            Some(chosen)
                if content.method == VerificationMethod::SasV1
                    && content.key_agreement_protocol == KeyAgreementProtocol::Curve25519HkdfSha256
                    && content.hash == HashMethod::Sha256
                    && content.message_authentication_code == MacMethod::HkdfHmacSha256 =>
            {
                chosen.clone()
            }
            _ => {
                return Err(self
                    .cancel_locked(
                        &mut txn,
                        &handle,
                        CancelCode::UnknownMethod,
                        "Verification uses unknown method",
                    )
                    .await)
            }
        };

        txn.commitment = Some(content.commitment);
        txn.chosen_method = Some(chosen);
        txn.advance(Phase::Started);

        let key = VerificationMessage::Key(KeyContent {
            transaction_id: txn.id.clone(),
            key: txn.sas.public_key(),
        });
        self.send(&txn.peer.user_id, &txn.peer.device_id, &key).await?;
        Ok(())
    }

    async fn on_key(&self, sender: &UserId, content: KeyContent) -> VerificationResult<()> {
        let (handle, mut txn) = self.lock_transaction(sender, &content.transaction_id).await?;
        txn.deadline.extend();

        if txn.phase != Phase::Started || txn.sas.has_peer_key() {
            return Err(self
                .cancel_locked(&mut txn, &handle, CancelCode::UnexpectedMessage, "Unexpected key message")
                .await);
        }

        if txn.initiated_by_us {
            let expected = txn
                .start_canonical
                .as_deref()
                .map(|canonical| mac::commitment(&content.key, canonical));
            debug!(
                transaction = %txn.id,
                received = ?txn.commitment,
                expected = ?expected,
                "checking commitment"
            );
            if expected.is_none() || expected != txn.commitment {
                return Err(self
                    .cancel_locked(&mut txn, &handle, CancelCode::CommitmentMismatch, "Commitment mismatch")
                    .await);
            }
        }

        if let Err(err) = txn.sas.set_peer_key(&content.key) {
            warn!(transaction = %txn.id, error = %err, "peer sent an invalid key");
            return Err(self
                .cancel_locked(&mut txn, &handle, CancelCode::InvalidMessage, "Invalid key")
                .await);
        }

        if !txn.initiated_by_us {
            let key = VerificationMessage::Key(KeyContent {
                transaction_id: txn.id.clone(),
                key: txn.sas.public_key(),
            });
            self.send(&txn.peer.user_id, &txn.peer.device_id, &key).await?;
        }
        txn.advance(Phase::KeyExchanged);

        let own = &self.inner.own;
        let our_key = txn.sas.public_key();
        let us = SasParty {
            user_id: &own.user_id,
            device_id: &own.device_id,
            key: &our_key,
        };
        let them = SasParty {
            user_id: &txn.peer.user_id,
            device_id: &txn.peer.device_id,
            key: &content.key,
        };
        let (initiator, responder) = if txn.initiated_by_us { (us, them) } else { (them, us) };
        let method = txn.chosen_method.clone().unwrap_or(SasMethod::Decimal);
        let derived = methods::derive(&method, &initiator, &responder, &txn.id, &txn.sas);
        let code = match derived {
            Ok(code) => code,
            Err(err) => {
                error!(transaction = %txn.id, error = %err, "failed to derive SAS");
                return Err(self
                    .cancel_locked(&mut txn, &handle, CancelCode::InvalidMessage, "Failed to derive SAS")
                    .await);
            }
        };
        debug!(transaction = %txn.id, method = %method, sas = %code, "derived SAS");

        txn.sas_code = Some(code.clone());
        txn.advance(Phase::AwaitingSasConfirmation);

        let engine = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(&handle);
        let hooks = Arc::clone(&txn.hooks);
        let peer = txn.peer.clone();
        let transaction_id = txn.id.clone();
        tokio::spawn(async move {
            let matched = hooks.confirm_sas(&peer, &code).await;
            let (Some(inner), Some(handle)) = (engine.upgrade(), target.upgrade()) else {
                return;
            };
            let engine = VerificationEngine { inner };
            if let Err(err) = engine.apply_sas_result(&handle, matched).await {
                debug!(transaction = %transaction_id, error = %err, "SAS result not applied cleanly");
            }
        });
        Ok(())
    }

    async fn on_mac(&self, sender: &UserId, content: MacContent) -> VerificationResult<()> {
        let (handle, mut txn) = self.lock_transaction(sender, &content.transaction_id).await?;
        txn.deadline.extend();

        debug!(
            transaction = %txn.id,
            macs = ?content.mac,
            keys = %content.keys,
            "received MAC"
        );

        if !txn.phase.keys_exchanged() || !txn.join.record_peer(content) {
            return Err(self
                .cancel_locked(&mut txn, &handle, CancelCode::UnexpectedMessage, "Unexpected MAC message")
                .await);
        }

        if txn.join.local().is_none() {
            txn.advance(Phase::MacExchanged);
            return Ok(());
        }
        self.finish(&mut txn, &handle).await
    }

    async fn on_cancel(&self, sender: &UserId, content: CancelContent) {
        let key = TransactionKey::new(sender.clone(), content.transaction_id.clone());
        warn!(
            transaction = %content.transaction_id,
            by = %sender,
            code = %content.code,
            reason = %content.reason,
            "verification cancelled by peer"
        );

        if let Some((_, pending)) = self.inner.pending_requests.remove(&key) {
            notify_cancel(pending.hooks, false, &content.reason, content.code.clone());
        }

        let Some(handle) = self.inner.store.load(&key) else {
            return;
        };
        let mut txn = Arc::clone(&handle).lock_owned().await;
        let phase = Phase::Cancelled {
            code: content.code.clone(),
            reason: content.reason.clone(),
        };
        if !txn.advance(phase) {
            return;
        }
        txn.disarm();
        self.inner.store.delete(&key, &handle);
        notify_cancel(Arc::clone(&txn.hooks), false, &content.reason, content.code);
    }

    // -----------------------------------------------------------------------
    // SAS result and final verification
    // -----------------------------------------------------------------------

    async fn apply_sas_result(&self, handle: &Handle<VerificationTransaction>, matched: bool) -> VerificationResult<()> {
        let mut txn = Arc::clone(handle).lock_owned().await;
        if txn.phase.is_terminal() {
            debug!(transaction = %txn.id, "SAS result for a finished transaction");
            return Ok(());
        }
        if !txn.phase.keys_exchanged() || !txn.join.record_local(matched) {
            debug!(transaction = %txn.id, phase = %txn.phase, "ignoring SAS result");
            return Ok(());
        }
        txn.deadline.extend();

        if !matched {
            warn!(transaction = %txn.id, "SAS do not match");
            return Err(self
                .cancel_locked(&mut txn, handle, CancelCode::SasMismatch, "SAS do not match")
                .await);
        }

        // Check the peer's MAC even if ours could not be sent.
        let sent = self.send_mac(&txn).await;
        if txn.join.ready().is_some() {
            self.finish(&mut txn, handle).await?;
        }
        sent
    }

    async fn send_mac(&self, txn: &VerificationTransaction) -> VerificationResult<()> {
        let own = &self.inner.own;
        let key_id = own.key_id();
        let parties = MacParties {
            sender_user: &own.user_id,
            sender_device: &own.device_id,
            receiver_user: &txn.peer.user_id,
            receiver_device: &txn.peer.device_id,
            transaction_id: &txn.id,
        };
        let macs = mac::key_macs(&txn.sas, &parties, &own.signing_key, &key_id, [key_id.as_str()])?;
        debug!(transaction = %txn.id, key_mac = %macs.key_mac, keys_mac = %macs.key_list_mac, "sending MAC");

        let message = VerificationMessage::Mac(MacContent {
            transaction_id: txn.id.clone(),
            mac: [(key_id, macs.key_mac)].into_iter().collect(),
            keys: macs.key_list_mac,
        });
        self.send(&txn.peer.user_id, &txn.peer.device_id, &message).await?;
        Ok(())
    }

    /// Both halves of the join are in: check the peer's MAC and trust the
    /// device.
    async fn finish(&self, txn: &mut Guard, handle: &Handle<VerificationTransaction>) -> VerificationResult<()> {
        let Some((matched, peer_mac)) = txn.join.ready() else {
            return Ok(());
        };
        if !matched {
            return Err(self
                .cancel_locked(txn, handle, CancelCode::SasMismatch, "SAS do not match")
                .await);
        }
        let peer_mac = peer_mac.clone();

        let own = &self.inner.own;
        let key_id = txn.peer.key_id();
        let parties = MacParties {
            sender_user: &txn.peer.user_id,
            sender_device: &txn.peer.device_id,
            receiver_user: &own.user_id,
            receiver_device: &own.device_id,
            transaction_id: &txn.id,
        };
        let expected = mac::key_macs(
            &txn.sas,
            &parties,
            &txn.peer.signing_key,
            &key_id,
            peer_mac.mac.keys().map(String::as_str),
        );
        let expected = match expected {
            Ok(expected) => expected,
            Err(err) => {
                error!(transaction = %txn.id, error = %err, "failed to compute expected MAC");
                return Err(self
                    .cancel_locked(txn, handle, CancelCode::InvalidMessage, "Failed to compute MAC")
                    .await);
            }
        };

        debug!(transaction = %txn.id, expected = %expected.key_list_mac, got = %peer_mac.keys, "checking keys MAC");
        if expected.key_list_mac != peer_mac.keys {
            return Err(self
                .cancel_locked(txn, handle, CancelCode::KeyMismatch, "Mismatched keys MACs")
                .await);
        }

        debug!(transaction = %txn.id, expected = %expected.key_mac, got = ?peer_mac.mac.get(&key_id), "checking device key MAC");
        if peer_mac.mac.get(&key_id) != Some(&expected.key_mac) {
            return Err(self
                .cancel_locked(txn, handle, CancelCode::KeyMismatch, "Mismatched PK MACs")
                .await);
        }

        txn.advance(Phase::Verified);
        txn.disarm();
        self.inner.store.delete(&txn.key(), handle);

        if let Err(err) = self.inner.devices.mark_verified(&txn.peer).await {
            warn!(transaction = %txn.id, error = %err, "failed to store device trust");
        }
        info!(
            transaction = %txn.id,
            user = %txn.peer.user_id,
            device = %txn.peer.device_id,
            "device verified"
        );
        txn.hooks.on_success().await;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    /// End a live transaction from our side. Must be called with the lock
    /// held. Returns the error handlers report for the cancellation.
    async fn cancel_locked(
        &self,
        txn: &mut VerificationTransaction,
        handle: &Handle<VerificationTransaction>,
        code: CancelCode,
        reason: &str,
    ) -> VerificationError {
        let cancelled = VerificationError::Cancelled {
            code: code.clone(),
            reason: reason.to_string(),
        };
        let phase = Phase::Cancelled {
            code: code.clone(),
            reason: reason.to_string(),
        };
        if !txn.advance(phase) {
            return cancelled;
        }
        txn.disarm();
        self.inner.store.delete(&txn.key(), handle);

        warn!(transaction = %txn.id, code = %code, reason, "cancelling verification");
        let cancel = cancel_message(&txn.id, reason, code.clone());
        let _ = self.send(&txn.peer.user_id, &txn.peer.device_id, &cancel).await;
        notify_cancel(Arc::clone(&txn.hooks), true, reason, code);
        cancelled
    }

    /// Send a Cancel for a message that created no state.
    async fn reject_unlocked(
        &self,
        device: &DeviceIdentity,
        transaction_id: &TransactionId,
        code: CancelCode,
        reason: &str,
    ) -> VerificationError {
        warn!(transaction = %transaction_id, code = %code, reason, "refusing verification");
        let _ = self
            .send_cancel(&device.user_id, &device.device_id, transaction_id, reason, code.clone())
            .await;
        VerificationError::Cancelled {
            code,
            reason: reason.to_string(),
        }
    }

    /// Load and lock the transaction `(sender, transaction_id)`.
    ///
    /// An unknown id is answered with `m.unknown_transaction` to every device
    /// of the sender.
    async fn lock_transaction(
        &self,
        sender: &UserId,
        transaction_id: &TransactionId,
    ) -> VerificationResult<(Handle<VerificationTransaction>, Guard)> {
        let key = TransactionKey::new(sender.clone(), transaction_id.clone());
        let Some(handle) = self.inner.store.load(&key) else {
            warn!(transaction = %transaction_id, from = %sender, "message for unknown transaction");
            let reason = format!("Unknown transaction: {}", transaction_id);
            let _ = self
                .send_cancel(
                    sender,
                    &DeviceId::wildcard(),
                    transaction_id,
                    &reason,
                    CancelCode::UnknownTransaction,
                )
                .await;
            return Err(VerificationError::UnknownTransaction(transaction_id.to_string()));
        };

        let mut txn = Arc::clone(&handle).lock_owned().await;
        if txn.phase.is_terminal() {
            return Err(VerificationError::UnknownTransaction(transaction_id.to_string()));
        }
        if txn.peer.user_id != *sender {
            let expected = txn.peer.user_id.to_string();
            let reason = format!("Unknown user for transaction {}: {}", transaction_id, sender);
            self.cancel_locked(&mut txn, &handle, CancelCode::UserMismatch, &reason).await;
            return Err(VerificationError::UserMismatch {
                transaction_id: transaction_id.to_string(),
                expected,
                got: sender.to_string(),
            });
        }
        Ok((handle, txn))
    }

    async fn resolve_device(&self, user_id: &UserId, device_id: &DeviceId) -> VerificationResult<DeviceIdentity> {
        match self.inner.devices.get_device(user_id, device_id).await {
            Some(device) => Ok(device),
            None => {
                error!(user = %user_id, device = %device_id, "could not find device");
                Err(VerificationError::UnknownDevice {
                    user_id: user_id.to_string(),
                    device_id: device_id.to_string(),
                })
            }
        }
    }

    /// A device record must belong to the user that sent the message.
    async fn check_device_owner(
        &self,
        sender: &UserId,
        device: &DeviceIdentity,
        transaction_id: &TransactionId,
    ) -> VerificationResult<()> {
        if device.user_id == *sender {
            return Ok(());
        }
        let reason = format!("Unknown user for transaction {}: {}", transaction_id, sender);
        warn!(transaction = %transaction_id, %reason, "device owner mismatch");
        let _ = self
            .send_cancel(sender, &DeviceId::wildcard(), transaction_id, &reason, CancelCode::UserMismatch)
            .await;
        Err(VerificationError::UserMismatch {
            transaction_id: transaction_id.to_string(),
            expected: device.user_id.to_string(),
            got: sender.to_string(),
        })
    }

    /// Hooks of the Request that `key` answers, if we sent one recently.
    fn answered_request(&self, key: &TransactionKey) -> Option<Arc<dyn VerificationHooks>> {
        let (_, pending) = self.inner.pending_requests.remove(key)?;
        if pending.sent_at.elapsed() > self.inner.config.request_max_age {
            debug!(transaction = %key.transaction_id, "verification request expired");
            return None;
        }
        Some(pending.hooks)
    }

    fn request_is_fresh(&self, timestamp_ms: i64) -> bool {
        within_request_window(
            chrono::Utc::now().timestamp_millis(),
            timestamp_ms,
            self.inner.config.request_max_age,
            self.inner.config.request_max_future,
        )
    }

    fn methods_of(&self, hooks: &dyn VerificationHooks) -> Vec<SasMethod> {
        let offered = hooks.supported_methods();
        if !offered.contains(&SasMethod::Decimal) {
            warn!("verification hooks do not offer decimal SAS, adding it");
        }
        methods::with_mandatory_decimal(offered)
    }

    fn arm(&self, handle: &Handle<VerificationTransaction>, txn: &mut VerificationTransaction) {
        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        let target = Arc::downgrade(handle);
        let wake = txn.deadline.expires_at();
        txn.timer = Some(timeout::supervise(
            Arc::downgrade(handle),
            wake,
            move |mut txn: Guard| async move {
                // This is the timer task itself; it must not abort itself.
                txn.timer = None;
                let (Some(inner), Some(handle)) = (engine.upgrade(), target.upgrade()) else {
                    return;
                };
                warn!(transaction = %txn.id, "verification timed out");
                VerificationEngine { inner }
                    .cancel_locked(&mut txn, &handle, CancelCode::Timeout, "Timed out")
                    .await;
            },
        ));
    }

    async fn send(
        &self,
        user_id: &UserId,
        device_id: &DeviceId,
        message: &VerificationMessage,
    ) -> Result<(), TransportError> {
        debug!(
            to_user = %user_id,
            to_device = %device_id,
            event = message.event_type(),
            transaction = %message.transaction_id(),
            "sending verification message"
        );
        self.inner
            .transport
            .send_to_device(user_id, device_id, message)
            .await
            .map_err(|err| {
                error!(
                    to_user = %user_id,
                    to_device = %device_id,
                    event = message.event_type(),
                    error = %err,
                    "failed to send verification message"
                );
                err
            })
    }
}

fn cancel_message(transaction_id: &TransactionId, reason: &str, code: CancelCode) -> VerificationMessage {
    VerificationMessage::Cancel(CancelContent {
        transaction_id: transaction_id.clone(),
        reason: reason.to_string(),
        code,
    })
}

/// Report a cancellation to the host without holding up the caller, which
/// usually owns a transaction lock.
fn notify_cancel(hooks: Arc<dyn VerificationHooks>, cancelled_by_us: bool, reason: &str, code: CancelCode) {
    let reason = reason.to_string();
    tokio::spawn(async move {
        hooks.on_cancel(cancelled_by_us, &reason, &code).await;
    });
}

/// Whether a request stamped `timestamp_ms` is neither older than `max_age`
/// nor further than `max_future` ahead of `now_ms`. The timestamp is peer
/// input and may be any `i64`.
fn within_request_window(now_ms: i64, timestamp_ms: i64, max_age: Duration, max_future: Duration) -> bool {
    now_ms.saturating_sub(timestamp_ms) <= millis(max_age)
        && timestamp_ms.saturating_sub(now_ms) <= millis(max_future)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

/// Reason to refuse a Start we cannot serve, if any.
fn unsupported_start(content: &StartContent) -> Option<&'static str> {
    if content.method != VerificationMethod::SasV1 {
        Some("Only SAS method is supported")
    } else if !content.supports_key_agreement(&KeyAgreementProtocol::Curve25519HkdfSha256) {
        Some("Only curve25519-hkdf-sha256 key agreement protocol is supported")
    } else if !content.supports_hash(&HashMethod::Sha256) {
        Some("Only SHA256 hashing is supported")
    } else if !content.supports_mac(&MacMethod::HkdfHmacSha256) {
        Some("Only hkdf-hmac-sha256 MAC method is supported")
    } else if !content.supports_sas(&SasMethod::Decimal) {
        Some("Decimal SAS method must be supported")
    } else {
        None
    }
}
