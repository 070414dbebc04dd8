//! `netlinkd`: per-device wireless/wired link management daemon.
//!
//! Wires the core components (device registry, Scan Reconciler, Best-AP
//! Selector, Activation Engine) to their external collaborators (§6 of the
//! design document) and drives a `calloop` event loop the same way `gorm`
//! drives its UI loop: a hot-reloading `configory` config source plus timer
//! sources, with `tokio` running alongside to carry the `zbus`-backed
//! host-bus surface.
//!
//! Device discovery itself (listening for hardware-added/-removed events
//! from the HAL-like property store) is an external collaborator per the
//! design document's scope section; this binary seeds a single synthetic
//! device when `devices.enable_test_devices` is set, and exposes
//! [`State::register_device`] / [`State::remove_device`] as the boundary a
//! real discovery source would call.

mod activation;
mod ap;
mod bus;
mod clock;
mod collab;
mod config;
mod device;
mod error;
mod radio;
mod scan;
mod selector;

use std::rc::Rc;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use calloop::EventLoop;
use calloop::timer::{TimeoutAction, Timer};
use dashmap::DashMap;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

pub use crate::error::{Error, Result};

use crate::activation::Collaborators;
use crate::ap::{ApList, ApListKind};
use crate::bus::{Bus, ChannelBus, KeyResponse, ZbusBus};
use crate::clock::SystemClock;
use crate::collab::stub::{StubAutoIp, StubDhcp, StubHal, StubStaticConfig, StubSystemHelpers};
use crate::config::{Config, ConfigEventHandler};
use crate::device::Device;
use crate::radio::{RadioOps, SyntheticRadio};

/// One managed interface plus the radio backing it. Kept together in the
/// registry since the radio implementation (real WEXT ioctls vs the
/// synthetic stub) is chosen once, at device-added time.
struct ManagedDevice {
    device: Arc<Device>,
    radio: Arc<dyn RadioOps>,
}

/// Shared daemon state threaded through the calloop event loop, mirroring
/// `gorm`'s own `State` (see `catacombing-gorm`'s `window.rs`).
pub struct State {
    config: Rc<Config>,
    devices: Arc<DashMap<String, ManagedDevice>>,
    allowed: Arc<RwLock<ApList>>,
    invalid: Arc<RwLock<ApList>>,
    bus: Arc<dyn Bus>,
    dhcp: Arc<dyn collab::Dhcp>,
    autoip: Arc<dyn collab::AutoIp>,
    static_config: Arc<dyn collab::StaticConfig>,
    system: Arc<dyn collab::SystemHelpers>,
    hal: Arc<dyn collab::Hal>,
}

impl State {
    fn set_config(&mut self, config: Rc<Config>) {
        info!("applied configuration update");
        self.config = config;
    }

    /// Collaborators bundle for one device's activation, sharing every
    /// process-wide collaborator but the device's own radio.
    fn collaborators_for(&self, radio: Arc<dyn RadioOps>) -> Collaborators {
        Collaborators {
            radio,
            bus: self.bus.clone(),
            dhcp: self.dhcp.clone(),
            autoip: self.autoip.clone(),
            static_config: self.static_config.clone(),
            system: self.system.clone(),
            clock: Arc::new(SystemClock),
            association_pause_short: *self.config.devices.association_pause_short,
            association_pause_long: *self.config.devices.association_pause_long,
        }
    }

    /// Boundary a hardware-added event would call (§3 "created on
    /// hardware-added event"): register an already-constructed `Device`
    /// (real or synthetic) alongside the radio backing it, after consulting
    /// the HAL-like property store for its driver-support classification.
    fn register_device(&self, device: Arc<Device>, radio: Arc<dyn RadioOps>) {
        if !device.synthetic {
            device.set_driver_support(self.hal.driver_support(&device.path));
        }
        self.devices.insert(device.path.clone(), ManagedDevice { device, radio });
    }

    /// Boundary a hardware-removed event would call (§3 "destroyed on
    /// hardware-removed event").
    fn remove_device(&self, path: &str) {
        self.devices.remove(path);
    }

    /// Run one tick of the Scan Reconciler / Best-AP Selector / Activation
    /// trigger over every registered device.
    fn tick(&self) {
        let retry_wait = *self.config.scan.retry_wait;
        for entry in self.devices.iter() {
            let ManagedDevice { device, radio } = entry.value();
            if device.wireless().is_some() {
                scan::run_cycle(device, radio.as_ref(), self.bus.as_ref(), retry_wait);
                let changed = selector::recompute(device, radio.as_ref());
                let has_best = device.wireless().and_then(|w| w.best_ap()).is_some();
                if changed && has_best && !device.is_activating() {
                    self.begin_activation(device.clone(), radio.clone(), false);
                }
            }
        }
    }

    fn begin_activation(&self, device: Arc<Device>, radio: Arc<dyn RadioOps>, starting_up: bool) {
        let collab = self.collaborators_for(radio);
        match activation::activate_begin(device.clone(), collab, starting_up) {
            Ok(Some(_)) => info!(iface = %device.iface, "activation started"),
            Ok(None) => {},
            Err(err) => error!(iface = %device.iface, error = %err, "activate_begin rejected"),
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let filter_source = std::env::var("RUST_LOG").unwrap_or_else(|_| "netlinkd=info,warn".into());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(filter_source).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match tokio::task::spawn_blocking(run_event_loop).await {
        Ok(result) => result,
        Err(join_err) => {
            error!("event loop task panicked: {join_err}");
            Ok(())
        },
    }
}

/// Build and run the calloop event loop. Runs on a dedicated blocking
/// thread, since `calloop::EventLoop::run` blocks, while `tokio`'s own
/// worker threads stay free to drive the `zbus` connection and the
/// activation workers' `tokio::sync` channels.
fn run_event_loop() -> Result<()> {
    let mut event_loop: EventLoop<'static, State> =
        EventLoop::try_new().map_err(|err| Error::InvalidArgument(err.to_string()))?;
    let handle = event_loop.handle();

    // `configory::Config::new` reads `config.toml` once up front and spawns
    // its own inotify watcher; `ConfigEventHandler` is the callback it drives
    // on both the initial load and every subsequent file/IPC change. Kept
    // alive for the lifetime of the loop so that watcher keeps running.
    let configory_config = configory::Config::new("netlinkd", ConfigEventHandler::new(&handle))?;
    let config: Config = configory_config.get::<&str, _>(&[]).ok().flatten().unwrap_or_default();
    let config = Rc::new(config);

    let (key_requests_tx, mut key_requests_rx) = tokio::sync::mpsc::unbounded_channel();
    let bus: Arc<dyn Bus> = match ZbusBus::connect(key_requests_tx) {
        Ok(bus) => Arc::new(bus),
        Err(err) => {
            warn!("failed to connect to the session bus, falling back to the in-process bus: {err}");
            Arc::new(ChannelBus::new())
        },
    };

    // Drain inbound key requests. Until a front-end actually attaches to
    // `org.freedesktop.NetworkManager.LinkCore`, every prompt is answered
    // with the cancellation sentinel rather than blocking the activation
    // worker forever.
    std::thread::spawn(move || {
        while let Some(request) = key_requests_rx.blocking_recv() {
            warn!(
                essid = %request.essid,
                attempt = request.attempt,
                "no key front-end attached, cancelling prompt"
            );
            let _ = request.respond.send(KeyResponse::Cancelled);
        }
    });

    let state = State {
        config: config.clone(),
        devices: Arc::new(DashMap::new()),
        allowed: Arc::new(RwLock::new(ApList::new(ApListKind::Allowed))),
        invalid: Arc::new(RwLock::new(ApList::new(ApListKind::Invalid))),
        bus,
        dhcp: Arc::new(StubDhcp::default()),
        autoip: Arc::new(StubAutoIp),
        static_config: Arc::new(StubStaticConfig),
        system: Arc::new(StubSystemHelpers),
        hal: Arc::new(StubHal),
    };

    if config.devices.enable_test_devices {
        let radio: Arc<dyn RadioOps> = Arc::new(SyntheticRadio::default());
        let device = Device::new_synthetic(
            "/devices/wlan-test0",
            "wlan-test0",
            state.allowed.clone(),
            state.invalid.clone(),
        );
        state.register_device(device.clone(), radio);
        info!(iface = %device.iface, "seeded synthetic test device");
        state.tick();
    }

    let scan_interval = *config.scan.interval;
    event_loop
        .handle()
        .insert_source(Timer::from_duration(scan_interval), move |_, _, state: &mut State| {
            state.tick();
            TimeoutAction::ToDuration(scan_interval)
        })
        .map_err(|err| Error::InvalidArgument(err.to_string()))?;

    let mut state = state;
    event_loop
        .run(Duration::from_secs(1), &mut state, |_state| {})
        .map_err(|err| Error::InvalidArgument(err.to_string()))
}
