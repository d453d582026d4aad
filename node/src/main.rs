// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # keytrust Node
//!
//! Entry point for the `keytrust-node` binary. Parses CLI arguments,
//! initializes logging, and runs the requested subcommand:
//!
//! - `demo`: Verify two in-process devices over the memory network
//! - `version`: Print build version information

mod cli;
mod logging;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD_NO_PAD;
use base64::Engine as _;
use clap::Parser;
use ed25519_dalek::SigningKey;
use rand::rngs::OsRng;
use tokio::signal;
use tokio::sync::watch;

use keytrust_protocol::config::VerificationConfig;
use keytrust_protocol::verification::{
    AcceptDecision, CancelCode, DeviceIdentity, MemoryDeviceStore, MemoryNetwork, SasCode,
    SasMethod, TransactionId, VerificationHandler, VerificationHooks,
};
use keytrust_protocol::{OwnDevice, VerificationEngine};

use cli::{Commands, DemoArgs, FlowChoice, KeytrustCli, MethodChoice};

const ALICE: (&str, &str) = ("@alice:keytrust.local", "ALICEPHONE");
const BOB: (&str, &str) = ("@bob:keytrust.local", "BOBLAPTOP");

/// Extra time granted past the verification timeout before the demo gives up
/// waiting for an outcome.
const OUTCOME_GRACE: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let cli = KeytrustCli::parse();

    match cli.command {
        Commands::Demo(args) => run_demo(args).await,
        Commands::Version => {
            print_version();
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Demo Devices
// ---------------------------------------------------------------------------

/// How a demo device answers the SAS comparison.
#[derive(Debug, Clone, Copy)]
enum Answer {
    Match,
    Mismatch,
    Ask,
}

/// Final state of one side of the demo.
#[derive(Debug, Clone)]
enum Outcome {
    Verified,
    Cancelled {
        by_us: bool,
        code: CancelCode,
        reason: String,
    },
}

/// Prints what a real client would render and records the outcome.
struct DemoHooks {
    label: &'static str,
    methods: Vec<SasMethod>,
    answer: Answer,
    outcome: watch::Sender<Option<Outcome>>,
}

impl DemoHooks {
    fn new(
        label: &'static str,
        methods: Vec<SasMethod>,
        answer: Answer,
    ) -> (Arc<Self>, watch::Receiver<Option<Outcome>>) {
        let (outcome, rx) = watch::channel(None);
        let hooks = Arc::new(Self {
            label,
            methods,
            answer,
            outcome,
        });
        (hooks, rx)
    }
}

#[async_trait]
impl VerificationHooks for DemoHooks {
    fn supported_methods(&self) -> Vec<SasMethod> {
        self.methods.clone()
    }

    async fn confirm_sas(&self, peer: &DeviceIdentity, sas: &SasCode) -> bool {
        println!(
            "[{}] compare with {} ({}): {}",
            self.label,
            peer.device_id,
            sas.method(),
            sas
        );
        match self.answer {
            Answer::Match => true,
            Answer::Mismatch => false,
            Answer::Ask => ask_yes_no(&format!("[{}] do the codes match? [y/N] ", self.label))
                .await
                .unwrap_or_else(|err| {
                    tracing::warn!(error = %err, "could not read answer, treating as mismatch");
                    false
                }),
        }
    }

    async fn on_cancel(&self, cancelled_by_us: bool, reason: &str, code: &CancelCode) {
        self.outcome.send_replace(Some(Outcome::Cancelled {
            by_us: cancelled_by_us,
            code: code.clone(),
            reason: reason.to_string(),
        }));
    }

    async fn on_success(&self) {
        self.outcome.send_replace(Some(Outcome::Verified));
    }
}

/// Accepts every incoming verification with one set of hooks.
struct AutoAccept {
    hooks: Arc<DemoHooks>,
}

#[async_trait]
impl VerificationHandler for AutoAccept {
    async fn accept_verification_from(
        &self,
        transaction_id: &TransactionId,
        device: &DeviceIdentity,
    ) -> AcceptDecision {
        tracing::info!(
            transaction = %transaction_id,
            from = %device.user_id,
            device = %device.device_id,
            "accepting incoming verification"
        );
        AcceptDecision::Accept(Arc::clone(&self.hooks) as Arc<dyn VerificationHooks>)
    }
}

struct Device {
    engine: VerificationEngine,
    hooks: Arc<DemoHooks>,
    store: Arc<MemoryDeviceStore>,
    outcome: watch::Receiver<Option<Outcome>>,
}

fn demo_device(
    network: &MemoryNetwork,
    (user_id, device_id): (&'static str, &'static str),
    config: &VerificationConfig,
    methods: Vec<SasMethod>,
    answer: Answer,
) -> Device {
    let signing_key = SigningKey::generate(&mut OsRng);
    let own = OwnDevice::new(user_id, device_id, &signing_key.verifying_key());
    let (hooks, outcome) = DemoHooks::new(device_id, methods, answer);
    let store = Arc::new(MemoryDeviceStore::new());
    let engine = VerificationEngine::with_config(
        own,
        config.clone(),
        network.transport(user_id),
        Arc::clone(&store) as _,
        Arc::new(AutoAccept {
            hooks: Arc::clone(&hooks),
        }),
    );
    Device {
        engine,
        hooks,
        store,
        outcome,
    }
}

// ---------------------------------------------------------------------------
// Subcommands
// ---------------------------------------------------------------------------

/// Runs one full verification between two in-process devices.
async fn run_demo(args: DemoArgs) -> Result<()> {
    logging::init_logging("keytrust_node=info,keytrust_protocol=info", args.log_format)?;

    if args.timeout_secs == 0 {
        bail!("--timeout-secs must be at least 1");
    }
    let timeout = Duration::from_secs(args.timeout_secs);
    let config = VerificationConfig::default().with_sas_timeout(timeout);
    let methods = match args.method {
        MethodChoice::Decimal => vec![SasMethod::Decimal],
        MethodChoice::Emoji => vec![SasMethod::Emoji, SasMethod::Decimal],
    };
    let (alice_answer, bob_answer) = match (args.interactive, args.mismatch) {
        (true, _) => (Answer::Ask, Answer::Match),
        (false, true) => (Answer::Match, Answer::Mismatch),
        (false, false) => (Answer::Match, Answer::Match),
    };

    tracing::info!(
        timeout_secs = args.timeout_secs,
        method = ?args.method,
        flow = ?args.flow,
        "starting verification demo"
    );

    let network = MemoryNetwork::new();
    let alice = demo_device(&network, ALICE, &config, methods.clone(), alice_answer);
    let bob = demo_device(&network, BOB, &config, methods, bob_answer);

    let alice_identity = alice.engine.own_device().identity();
    let bob_identity = bob.engine.own_device().identity();
    alice.store.add_device(bob_identity.clone());
    bob.store.add_device(alice_identity.clone());

    let pumps = [
        network.attach(alice.engine.clone()),
        network.attach(bob.engine.clone()),
    ];

    let hooks = Arc::clone(&alice.hooks) as Arc<dyn VerificationHooks>;
    let transaction_id = match args.flow {
        FlowChoice::Start => alice.engine.start_simple_verification(&bob_identity, hooks).await,
        FlowChoice::Request => alice.engine.request_verification(&bob_identity, hooks).await,
    }
    .context("failed to open verification")?;
    tracing::info!(transaction = %transaction_id, "verification opened");

    let waited = tokio::select! {
        res = tokio::time::timeout(timeout + OUTCOME_GRACE, async {
            let alice_outcome = wait_for_outcome(alice.outcome.clone()).await?;
            let bob_outcome = wait_for_outcome(bob.outcome.clone()).await?;
            Ok::<_, anyhow::Error>((alice_outcome, bob_outcome))
        }) => Some(res.context("verification did not finish in time")??),
        _ = shutdown_signal() => {
            tracing::info!("shutdown signal received, cancelling verification");
            None
        }
    };

    alice.engine.shutdown().await;
    bob.engine.shutdown().await;
    for pump in pumps {
        pump.abort();
    }

    let Some((alice_outcome, bob_outcome)) = waited else {
        return Ok(());
    };

    println!();
    let alice_trusts = alice
        .store
        .is_verified(&bob_identity.user_id, &bob_identity.device_id);
    let bob_trusts = bob
        .store
        .is_verified(&alice_identity.user_id, &alice_identity.device_id);
    report(ALICE.1, &alice_outcome, &bob_identity, alice_trusts)?;
    report(BOB.1, &bob_outcome, &alice_identity, bob_trusts)?;
    println!("  Messages       : {}", network.delivered().len());

    match (&alice_outcome, &bob_outcome) {
        (Outcome::Verified, Outcome::Verified) => Ok(()),
        _ => Err(anyhow!("verification did not succeed")),
    }
}

/// Prints one side's result and the fingerprint of the key it checked.
fn report(label: &str, outcome: &Outcome, peer: &DeviceIdentity, trusted: bool) -> Result<()> {
    match outcome {
        Outcome::Verified => println!("[{}] verified {} ({})", label, peer.device_id, peer.user_id),
        Outcome::Cancelled { by_us, code, reason } => println!(
            "[{}] cancelled by {}: {} ({})",
            label,
            if *by_us { "us" } else { "peer" },
            reason,
            code
        ),
    }
    println!("  Peer key       : {}", fingerprint(&peer.signing_key)?);
    println!("  Marked trusted : {}", trusted);
    Ok(())
}

/// Hex fingerprint of an unpadded-base64 signing key, in groups of four.
fn fingerprint(signing_key: &str) -> Result<String> {
    let bytes = STANDARD_NO_PAD
        .decode(signing_key)
        .context("signing key is not valid base64")?;
    let hex = hex::encode(bytes);
    let groups: Vec<&str> = hex
        .as_bytes()
        .chunks(4)
        .filter_map(|chunk| std::str::from_utf8(chunk).ok())
        .collect();
    Ok(groups.join(" "))
}

async fn wait_for_outcome(mut rx: watch::Receiver<Option<Outcome>>) -> Result<Outcome> {
    loop {
        if let Some(outcome) = rx.borrow_and_update().clone() {
            return Ok(outcome);
        }
        rx.changed()
            .await
            .context("verification hooks dropped before an outcome")?;
    }
}

/// Reads one answer from stdin without blocking the runtime.
async fn ask_yes_no(prompt: &str) -> Result<bool> {
    use std::io::Write;

    let prompt = prompt.to_string();
    tokio::task::spawn_blocking(move || -> Result<bool> {
        let mut stdout = std::io::stdout();
        stdout.write_all(prompt.as_bytes())?;
        stdout.flush()?;
        let mut line = String::new();
        std::io::stdin()
            .read_line(&mut line)
            .context("failed to read from stdin")?;
        Ok(matches!(line.trim().to_lowercase().as_str(), "y" | "yes"))
    })
    .await
    .context("stdin reader panicked")?
}

/// Prints version information to stdout.
fn print_version() {
    println!("keytrust-node {}", env!("CARGO_PKG_VERSION"));
    println!("protocol      {}", keytrust_protocol::config::PROTOCOL_VERSION);
    println!("sas           {}", keytrust_protocol::config::METHOD_SAS_V1);
}

/// Waits for SIGINT (Ctrl+C) or SIGTERM, whichever comes first.
///
/// On non-Unix platforms, only Ctrl+C is supported. If a handler cannot be
/// installed, that signal is never reported.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
