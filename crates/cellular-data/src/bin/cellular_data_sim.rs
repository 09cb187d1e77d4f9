//! # Cellular data simulator
//!
//! Runs one slot against a loopback modem that answers every setup after a
//! short latency with a fresh context id. Useful for watching the retry and
//! teardown logic without hardware.
//!
//! ## Usage
//!
//! ```bash
//! # Default config, fallback catalog, 5 s run
//! cellular-data-sim
//!
//! # Carrier catalog, first three setups rejected
//! cellular-data-sim --apns apns.toml --fail-first 3 --duration-ms 20000
//!
//! # More detail
//! RUST_LOG=cellular_data=debug cellular-data-sim
//! ```

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use crossbeam_channel::{Receiver, Sender, unbounded};

use cellular_data::apn::catalog::ApnCatalog;
use cellular_data::apn::holder::NetRequest;
use cellular_data::apn::types::{NetCapability, RadioTech};
use cellular_data::config::DataConfig;
use cellular_data::extension::Extension;
use cellular_data::handler::{CellularDataHandler, Collaborators};
use cellular_data::net::{LinkInfo, NetAgent, SupplierId, SupplierInfo};
use cellular_data::props::PropertyStore;
use cellular_data::radio::{
    ActivateRequest, DeactivateRequest, NotificationKind, RadioError, RadioNotification,
    RadioResponse, RadioResponseInfo, RadioTransport, ReplyTo, SetupDataCallResult,
};
use cellular_data::runtime::{SlotCommand, SlotRuntime};

#[derive(Parser, Debug)]
#[command(name = "cellular-data-sim", about = "Drive one data slot against a loopback modem")]
struct Args {
    /// Data config TOML. Defaults apply when omitted.
    #[arg(long)]
    config: Option<PathBuf>,

    /// APN catalog TOML. A default/mms fallback is used when omitted.
    #[arg(long)]
    apns: Option<PathBuf>,

    /// Number of setup requests the modem rejects before succeeding.
    #[arg(long, default_value_t = 0)]
    fail_first: u32,

    #[arg(long, default_value_t = 5000)]
    duration_ms: u64,

    #[arg(long, default_value_t = 0)]
    slot: i32,

    /// Modem answer latency.
    #[arg(long, default_value_t = 50)]
    latency_ms: u64,
}

fn main() -> anyhow::Result<()> {
    // ── Logging ─────────────────────────────────────────────────
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .compact()
        .init();

    let args = Args::parse();

    // ── Configuration ───────────────────────────────────────────
    let config = match &args.config {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            DataConfig::from_toml_str(&text)?
        }
        None => DataConfig::default(),
    };
    let catalog = match &args.apns {
        Some(path) => {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading {}", path.display()))?;
            ApnCatalog::from_toml_str(&text)?
        }
        None => ApnCatalog::fallback(),
    };
    tracing::info!(
        slot = args.slot,
        profiles = catalog.len(),
        fail_first = args.fail_first,
        duration_ms = args.duration_ms,
        "cellular-data-sim starting"
    );

    // ── Slot ────────────────────────────────────────────────────
    let radio = Arc::new(LoopbackRadio::start(
        Duration::from_millis(args.latency_ms),
        args.fail_first,
    )?);
    let handler = CellularDataHandler::new(
        args.slot,
        config,
        catalog,
        Collaborators {
            radio: radio.clone(),
            net: Arc::new(LogNet::default()),
            extension: Extension::none(),
            props: PropertyStore::new(),
        },
    );
    let mut runtime = SlotRuntime::spawn(handler)?;
    runtime.send(SlotCommand::PsRatChanged(RadioTech::Lte))?;
    for capability in [NetCapability::Internet, NetCapability::Mms] {
        runtime.request_net(NetRequest {
            capability,
            ident: format!("simId{}", args.slot + 1),
        })?;
    }

    // ── Graceful shutdown ───────────────────────────────────────
    let running = Arc::new(AtomicBool::new(true));
    {
        let running = running.clone();
        ctrlc::set_handler(move || {
            tracing::info!("shutting down...");
            running.store(false, Ordering::Relaxed);
        })?;
    }

    // ── Main loop ───────────────────────────────────────────────
    let deadline = std::time::Instant::now() + Duration::from_millis(args.duration_ms);
    let mut last_log = std::time::Instant::now();
    while running.load(Ordering::Relaxed) && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(100));
        if last_log.elapsed() >= Duration::from_secs(1) {
            let snapshot = runtime.snapshot();
            tracing::info!(
                overall = ?snapshot.overall,
                cids = ?snapshot.active_cids,
                flow = ?snapshot.flow,
                "slot state"
            );
            last_log = std::time::Instant::now();
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────
    let snapshot = runtime.snapshot();
    runtime.shutdown();
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

// ─── Loopback Modem ─────────────────────────────────────────────────────────

enum Reply {
    Response(RadioResponse),
    Notification(RadioNotification),
}

/// Answers on its own thread, after `latency`, like a real modem.
struct LoopbackRadio {
    tx: Sender<(ReplyTo, Reply)>,
    next_cid: AtomicI32,
    fail_remaining: AtomicU32,
    active: Mutex<BTreeSet<i32>>,
    listeners: Mutex<Vec<ReplyTo>>,
}

impl LoopbackRadio {
    fn start(latency: Duration, fail_first: u32) -> anyhow::Result<Self> {
        let (tx, rx) = unbounded();
        std::thread::Builder::new()
            .name("loopback-modem".into())
            .spawn(move || modem_loop(rx, latency))?;
        Ok(Self {
            tx,
            next_cid: AtomicI32::new(1),
            fail_remaining: AtomicU32::new(fail_first),
            active: Mutex::new(BTreeSet::new()),
            listeners: Mutex::new(Vec::new()),
        })
    }

    fn post(&self, reply_to: ReplyTo, reply: Reply) {
        let _ = self.tx.send((reply_to, reply));
    }

    fn call_list(&self) -> Vec<SetupDataCallResult> {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        active
            .iter()
            .map(|&cid| context(cid))
            .collect()
    }
}

fn context(cid: i32) -> SetupDataCallResult {
    SetupDataCallResult {
        active: 2,
        cid,
        retry_time_ms: -1,
        iface_name: format!("rmnet{}", cid - 1),
        addresses: format!("10.64.{cid}.2/24"),
        dns: "8.8.8.8 8.8.4.4".into(),
        gateway: format!("10.64.{cid}.1"),
        mtu: 1400,
        ..Default::default()
    }
}

fn modem_loop(rx: Receiver<(ReplyTo, Reply)>, latency: Duration) {
    while let Ok((reply_to, reply)) = rx.recv() {
        std::thread::sleep(latency);
        match reply {
            Reply::Response(r) => reply_to.on_response(r),
            Reply::Notification(n) => reply_to.on_notification(n),
        }
    }
}

impl RadioTransport for LoopbackRadio {
    fn activate(&self, request: ActivateRequest, reply: ReplyTo) {
        let rejected = self
            .fail_remaining
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1))
            .is_ok();
        let result = if rejected {
            tracing::info!(apn = %request.attr.apn, "loopback modem rejecting setup");
            Err(RadioResponseInfo {
                flag: request.flag,
                error: Some(RadioError::GenericFailure),
            })
        } else {
            let cid = self.next_cid.fetch_add(1, Ordering::Relaxed);
            self.active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(cid);
            Ok(SetupDataCallResult {
                flag: request.flag,
                ..context(cid)
            })
        };
        self.post(
            reply,
            Reply::Response(RadioResponse::SetupDataCall {
                machine: request.machine,
                result,
            }),
        );
    }

    fn deactivate(&self, request: DeactivateRequest, reply: ReplyTo) {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&request.cid);
        self.post(
            reply,
            Reply::Response(RadioResponse::DeactivateDataCall {
                machine: request.machine,
                info: RadioResponseInfo {
                    flag: request.flag,
                    error: None,
                },
            }),
        );
        // Real modems follow a teardown with a fresh call list.
        let listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for listener in listeners {
            self.post(
                listener,
                Reply::Notification(RadioNotification::DataCallListChanged(self.call_list())),
            );
        }
    }

    fn subscribe(&self, kind: NotificationKind, listener: ReplyTo) {
        if kind == NotificationKind::DataCallListChanged {
            self.listeners
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(listener);
        }
    }

    fn request_data_call_list(&self, _slot: i32, reply: ReplyTo) {
        self.post(
            reply,
            Reply::Notification(RadioNotification::DataCallListChanged(self.call_list())),
        );
    }
}

// ─── Net Agent ──────────────────────────────────────────────────────────────

#[derive(Default)]
struct LogNet {
    next: AtomicU32,
}

impl NetAgent for LogNet {
    fn register_supplier(&self, slot: i32, capability: NetCapability) -> SupplierId {
        let id = self.next.fetch_add(1, Ordering::Relaxed) + 1;
        tracing::info!(slot, ?capability, supplier = id, "supplier registered");
        id
    }

    fn publish_supplier_info(&self, supplier: SupplierId, info: &SupplierInfo) {
        tracing::info!(
            supplier,
            available = info.is_available,
            roaming = info.is_roaming,
            radio_tech = ?info.radio_tech,
            "supplier info"
        );
    }

    fn publish_link_info(&self, supplier: SupplierId, info: &LinkInfo) {
        tracing::info!(
            supplier,
            iface = %info.iface_name,
            addresses = ?info.addresses,
            mtu = info.mtu,
            "link info"
        );
    }
}
