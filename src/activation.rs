//! C5: Activation Engine — the state machine that drives a device from
//! "candidate" to "usable default route with IP address".
//!
//! One activation runs on its own dedicated OS thread (the design notes
//! call for a parallel OS-thread model, not just async tasks), cooperatively
//! cancellable via [`crate::clock::CancelFlag`]. The worker's multi-level
//! loop is expressed as a single loop over an explicit tagged [`Phase`]
//! value, per the design notes, rather than nested labelled control flow.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use rand::Rng;
use tracing::{info, warn};

use crate::ap::{AccessPoint, AuthMethod, KeyType, Mode};
use crate::bus::{Bus, BusEvent, DevicePhase, KeyResponse};
use crate::clock::{CancelFlag, Clock};
use crate::collab::{AutoIp, Dhcp, DhcpOutcome, StaticConfig, SystemHelpers};
use crate::device::{Device, DeviceKind, IpConfig};
use crate::error::{Error, Result};
use crate::radio::RadioOps;
use crate::selector;

/// Activation phases (§4.5). Transitions only as documented at each match
/// arm in [`run`].
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum Phase {
    Idle = 0,
    Prepare = 1,
    WaitForAp = 2,
    Associate = 3,
    NeedKey = 4,
    VerifyLink = 5,
    ConfigureIp = 6,
    Running = 7,
    Cancelled = 8,
    Failed = 9,
    Done = 10,
}

/// Lock-free phase cell the engine publishes to and callers (tests, status
/// queries) read from.
#[derive(Default)]
pub struct PhaseCell(AtomicU8);

impl PhaseCell {
    pub fn get(&self) -> Phase {
        match self.0.load(Ordering::SeqCst) {
            0 => Phase::Idle,
            1 => Phase::Prepare,
            2 => Phase::WaitForAp,
            3 => Phase::Associate,
            4 => Phase::NeedKey,
            5 => Phase::VerifyLink,
            6 => Phase::ConfigureIp,
            7 => Phase::Running,
            8 => Phase::Cancelled,
            9 => Phase::Failed,
            _ => Phase::Done,
        }
    }

    fn set(&self, phase: Phase) {
        self.0.store(phase as u8, Ordering::SeqCst);
    }
}

/// Duration of the mandatory settle pauses in the radio reset sequence.
const SETTLE_DOWN: Duration = Duration::from_secs(4);
const SETTLE_UP: Duration = Duration::from_secs(2);
/// WAIT_FOR_AP poll interval.
const WAIT_FOR_AP_POLL: Duration = Duration::from_secs(2);
/// Key-wait / cancel-wait poll frequency (2 Hz).
const POLL_2HZ: Duration = Duration::from_millis(500);

/// Transient per-activation record (§3).
pub struct ActivationRequest {
    pub device: Arc<Device>,
    pub cancel: CancelFlag,
    pub phase: PhaseCell,
    attempts: std::sync::Mutex<HashMap<String, u32>>,
}

impl ActivationRequest {
    fn attempt_for(&self, essid: &str) -> u32 {
        let mut attempts = self.attempts.lock().unwrap();
        let counter = attempts.entry(essid.to_string()).or_insert(0);
        *counter += 1;
        *counter
    }

    fn reset_attempts_except(&self, essid: &str) {
        self.attempts.lock().unwrap().retain(|k, _| k == essid);
    }
}

/// Collaborators the engine drives; grouped so `activate_begin` doesn't take
/// an unwieldy parameter list.
pub struct Collaborators {
    pub radio: Arc<dyn RadioOps>,
    pub bus: Arc<dyn Bus>,
    pub dhcp: Arc<dyn Dhcp>,
    pub autoip: Arc<dyn AutoIp>,
    pub static_config: Arc<dyn StaticConfig>,
    pub system: Arc<dyn SystemHelpers>,
    pub clock: Arc<dyn Clock>,
    /// Association pause used for radios with 14 channels or fewer
    /// (`[devices] association_pause_short`, default 5s per §4.5).
    pub association_pause_short: Duration,
    /// Association pause used for radios with more than 14 channels
    /// (`[devices] association_pause_long`, default 10s per §4.5).
    pub association_pause_long: Duration,
}

/// Begin activating `device`. No-op (returns `Ok(None)`) if already
/// activating; fails with [`Error::NoDriverSupport`] if the driver support
/// classification is `Unsupported` — the only error surfaced to the caller.
///
/// `starting_up` implements the boot special case: a wired device that
/// already has an IPv4 address transitions directly PREPARE -> DONE without
/// touching the kernel.
pub fn activate_begin(
    device: Arc<Device>,
    collab: Collaborators,
    starting_up: bool,
) -> Result<Option<Arc<ActivationRequest>>> {
    device.require_supported()?;

    if !device.begin_activating() {
        return Ok(None);
    }

    let request = Arc::new(ActivationRequest {
        device: device.clone(),
        cancel: CancelFlag::new(),
        phase: PhaseCell::default(),
        attempts: std::sync::Mutex::new(HashMap::new()),
    });

    let worker_request = request.clone();
    thread::Builder::new()
        .name(format!("activate-{}", device.iface))
        .spawn(move || run(worker_request, collab, starting_up))
        .map_err(|e| Error::Io { iface: device.iface.clone(), source: e })?;

    Ok(Some(request))
}

/// Cancel an in-flight activation. Synchronously waits until `is_activating`
/// becomes false, polling at 2 Hz. Idempotent.
pub fn activation_cancel(request: &ActivationRequest) {
    request.cancel.cancel();
    while request.device.is_activating() {
        thread::sleep(POLL_2HZ);
    }
}

fn association_pause(collab: &Collaborators, num_channels: u32) -> Duration {
    if num_channels > 14 { collab.association_pause_long } else { collab.association_pause_short }
}

/// The worker entry point. Runs to completion on its own thread.
fn run(request: Arc<ActivationRequest>, collab: Collaborators, starting_up: bool) {
    let device = request.device.clone();
    request.phase.set(Phase::Prepare);

    info!(iface = %device.iface, "activation started");

    let outcome = if starting_up && device.kind == DeviceKind::Wired && device.ipv4().is_some() {
        // Boot special case: only the final success is emitted, no
        // DeviceStatusChanged(Activating).
        Outcome::Success
    } else {
        collab.bus.publish(BusEvent::DeviceStatusChanged {
            device_path: device.path.clone(),
            phase: DevicePhase::Activating,
        });

        match device.kind {
            DeviceKind::Wired => run_wired(&request, &collab),
            DeviceKind::Wireless => run_wireless(&request, &collab),
            DeviceKind::Unknown => Outcome::Failed(Error::InvalidArgument("unknown device kind".into())),
        }
    };

    match &outcome {
        Outcome::Success => {
            request.phase.set(Phase::Done);
            collab.bus.publish(BusEvent::DeviceStatusChanged {
                device_path: device.path.clone(),
                phase: DevicePhase::NowActive,
            });
            info!(iface = %device.iface, "activation succeeded");
        },
        Outcome::Cancelled => {
            request.phase.set(Phase::Done);
            collab.bus.publish(BusEvent::DeviceStatusChanged {
                device_path: device.path.clone(),
                phase: DevicePhase::NoLongerActive,
            });
            info!(iface = %device.iface, "activation cancelled");
        },
        Outcome::Failed(err) => {
            request.phase.set(Phase::Done);
            collab.bus.publish(BusEvent::DeviceStatusChanged {
                device_path: device.path.clone(),
                phase: DevicePhase::NoLongerActive,
            });
            warn!(iface = %device.iface, error = %err, "activation failed");
        },
    }

    device.end_activating();
}

enum Outcome {
    Success,
    Cancelled,
    Failed(Error),
}

fn run_wired(request: &ActivationRequest, collab: &Collaborators) -> Outcome {
    configure_ip(request, collab, None)
}

fn run_wireless(request: &ActivationRequest, collab: &Collaborators) -> Outcome {
    loop {
        if request.cancel.is_cancelled() {
            return unwind_cancelled(request, collab);
        }

        request.phase.set(Phase::WaitForAp);
        let best = match wait_for_ap(request, collab) {
            Some(ap) => ap,
            None => return unwind_cancelled(request, collab),
        };

        if best.flags().user_created && best.mode() == Mode::AdHoc {
            if let Err(err) = create_adhoc(request, collab, &best) {
                return Outcome::Failed(err);
            }
            return configure_ip(request, collab, Some(&best));
        }

        if !best.encrypted() {
            request.phase.set(Phase::Associate);
            match associate_and_verify(request, collab, &best, AuthMethod::None) {
                VerifyResult::LinkUp => return configure_ip(request, collab, Some(&best)),
                VerifyResult::NoLink => {
                    invalidate(request, &best);
                    continue;
                },
                VerifyResult::Cancelled => return unwind_cancelled(request, collab),
            }
        }

        if best.key().is_none() {
            request.phase.set(Phase::NeedKey);
            match request_key(request, collab, &best) {
                KeyOutcome::Received => {
                    // Fall through to the encrypted-with-key branch below by
                    // re-looping: `best` now carries a key.
                },
                KeyOutcome::Cancelled => {
                    invalidate(request, &best);
                    continue;
                },
                KeyOutcome::WorkerCancelled => return unwind_cancelled(request, collab),
            }
        }

        match run_auth_ladder(request, collab, &best) {
            // `run_auth_ladder` already ran `configure_ip` to completion;
            // don't run it a second time for the same AP.
            LadderOutcome::Success => return Outcome::Success,
            LadderOutcome::Invalidate => {
                invalidate(request, &best);
                continue;
            },
            LadderOutcome::NeedKeyAgain => continue,
            LadderOutcome::Cancelled => return unwind_cancelled(request, collab),
        }
    }
}

fn wait_for_ap(request: &ActivationRequest, collab: &Collaborators) -> Option<Arc<AccessPoint>> {
    let device = &request.device;
    let wireless = device.wireless().expect("wireless only");
    loop {
        selector::recompute(device, collab.radio.as_ref());
        if let Some(ap) = wireless.best_ap() {
            return Some(ap);
        }
        if !collab.clock.sleep(WAIT_FOR_AP_POLL, &request.cancel) {
            return None;
        }
    }
}

enum VerifyResult {
    LinkUp,
    NoLink,
    Cancelled,
}

/// Runs the mandatory radio reset sequence, then pushes `auth`/key
/// configuration for `ap`, pauses for the association window, and checks
/// the link.
fn associate_and_verify(
    request: &ActivationRequest,
    collab: &Collaborators,
    ap: &AccessPoint,
    auth: AuthMethod,
) -> VerifyResult {
    if !radio_reset_sequence(request, collab, ap, auth) {
        return VerifyResult::Cancelled;
    }

    request.phase.set(Phase::VerifyLink);
    let pause = association_pause(collab, collab.radio.num_channels().unwrap_or(11));
    if !collab.clock.sleep(pause, &request.cancel) {
        return VerifyResult::Cancelled;
    }

    let link_up = collab.radio.get_associated_bssid().ok().flatten().is_some();
    info!(
        iface = %request.device.iface,
        essid = %ap.essid().unwrap_or_else(|| "(none)".into()),
        auth = ?auth,
        outcome = link_up,
        "association attempt"
    );

    if link_up { VerifyResult::LinkUp } else { VerifyResult::NoLink }
}

/// §4.5's mandatory pre-association sequence: bring down, settle, bring up,
/// settle, force Infrastructure, clear ESSID, set mode, set bitrate auto,
/// set frequency if needed, disable then reconfigure encryption, set target
/// ESSID, association pause.
///
/// Returns `false` if cancelled mid-sequence.
fn radio_reset_sequence(
    request: &ActivationRequest,
    collab: &Collaborators,
    ap: &AccessPoint,
    auth: AuthMethod,
) -> bool {
    let radio = collab.radio.as_ref();
    let _ = radio.bring_down();
    if !collab.clock.sleep(SETTLE_DOWN, &request.cancel) {
        return false;
    }
    let _ = radio.bring_up();
    if !collab.clock.sleep(SETTLE_UP, &request.cancel) {
        return false;
    }

    let _ = radio.set_mode(Mode::Infrastructure);
    let _ = radio.set_essid(" ");
    let _ = radio.set_mode(ap.mode());
    let _ = radio.set_bitrate_auto();
    if ap.frequency() > 0 {
        let _ = radio.set_frequency(ap.frequency());
    }
    let _ = radio.set_encryption_key(&[], auth);
    if let Some(key) = ap.key() {
        let _ = radio.set_encryption_key(&key, auth);
    }
    let _ = radio.set_essid(&ap.essid().unwrap_or_default());

    true
}

enum KeyOutcome {
    Received,
    Cancelled,
    WorkerCancelled,
}

fn request_key(
    request: &ActivationRequest,
    collab: &Collaborators,
    ap: &AccessPoint,
) -> KeyOutcome {
    let essid = ap.essid().unwrap_or_default();
    request.reset_attempts_except(&essid);
    let attempt = request.attempt_for(&essid);

    info!(iface = %request.device.iface, essid = %essid, attempt, "requesting key from front-end");

    // §4.5 specifies this as a poll-2Hz/respect-cancel blocking wait on a
    // user-key-received signal; the synchronous Bus::get_user_key_for_network
    // call already blocks the worker thread (not the event loop) for this,
    // so cancellation is observed by racing it against the cancel flag on a
    // helper thread.
    let (tx, rx) = std::sync::mpsc::channel();
    let bus = collab.bus.clone();
    let device_path = request.device.path.clone();
    thread::spawn(move || {
        let response = bus.get_user_key_for_network(&device_path, &essid, attempt);
        let _ = tx.send(response);
    });

    loop {
        if request.cancel.is_cancelled() {
            return KeyOutcome::WorkerCancelled;
        }
        match rx.recv_timeout(POLL_2HZ) {
            Ok(KeyResponse::Cancelled) => return KeyOutcome::Cancelled,
            Ok(KeyResponse::Key(key)) => {
                ap.set_key(Some(key), KeyType::Unknown);
                return KeyOutcome::Received;
            },
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => continue,
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => return KeyOutcome::Cancelled,
        }
    }
}

enum LadderOutcome {
    Success,
    Invalidate,
    NeedKeyAgain,
    Cancelled,
}

/// Encrypted-with-key authentication fallback ladder: SharedKey, then
/// OpenSystem on no-link, then DHCP-failure handling that drops SharedKey to
/// OpenSystem or returns to NEED_KEY.
fn run_auth_ladder(
    request: &ActivationRequest,
    collab: &Collaborators,
    ap: &AccessPoint,
) -> LadderOutcome {
    request.phase.set(Phase::Associate);

    let mut auth = AuthMethod::SharedKey;
    ap.set_auth(auth);

    // Loops at most twice: SharedKey, then a single drop to OpenSystem. The
    // drop happens in place, on no-link as well as on a DHCP failure under
    // SharedKey, so it never re-enters this function and never resets `auth`
    // back to SharedKey underneath itself.
    loop {
        match associate_and_verify(request, collab, ap, auth) {
            VerifyResult::Cancelled => return LadderOutcome::Cancelled,
            VerifyResult::LinkUp => {},
            VerifyResult::NoLink => {
                if auth == AuthMethod::SharedKey {
                    auth = AuthMethod::OpenSystem;
                    ap.set_auth(auth);
                    continue;
                }
                return LadderOutcome::Invalidate;
            },
        }

        match configure_ip(request, collab, Some(ap)) {
            Outcome::Success => return LadderOutcome::Success,
            Outcome::Cancelled => return LadderOutcome::Cancelled,
            Outcome::Failed(_) if auth == AuthMethod::SharedKey => {
                auth = AuthMethod::OpenSystem;
                ap.set_auth(auth);
            },
            Outcome::Failed(_) => {
                // OpenSystem already failed too: treat the key as wrong and
                // fall back to NEED_KEY instead of looping on this AP.
                ap.set_key(None, KeyType::Unknown);
                return LadderOutcome::NeedKeyAgain;
            },
        }
    }
}

fn invalidate(request: &ActivationRequest, ap: &AccessPoint) {
    ap.set_invalid(true);
    let essid = ap.essid().unwrap_or_default();
    let mut invalid = request.device.invalid.write().unwrap();
    invalid.append(AccessPoint::new(Some(essid), ap.bssid()));
}

fn unwind_cancelled(request: &ActivationRequest, collab: &Collaborators) -> Outcome {
    let _ = collab.radio.set_essid(" ");
    let _ = collab.radio.set_encryption_key(&[], AuthMethod::None);
    let _ = collab.radio.set_mode(Mode::Infrastructure);
    Outcome::Cancelled
}

/// Ad-hoc creation (§4.5): build the set of the radio's supported
/// frequencies, subtract those already claimed by visible APs, pick the
/// lowest remaining 802.11b channel (1-14), or a random one if none remain.
fn create_adhoc(request: &ActivationRequest, collab: &Collaborators, ap: &AccessPoint) -> Result<()> {
    let supported = collab.radio.supported_frequencies().unwrap_or_default();
    let claimed: std::collections::HashSet<u32> = {
        let wireless = request.device.wireless().expect("wireless only");
        wireless.visible.read().unwrap().iter().map(|a| a.frequency()).collect()
    };

    let mut free: Vec<u32> = supported.into_iter().filter(|f| !claimed.contains(f)).collect();
    free.sort_unstable();

    let chosen = match free.first() {
        Some(&f) => f,
        None => {
            let channel = rand::thread_rng().gen_range(1..=14u32);
            channel_to_freq(channel)
        },
    };

    ap.set_frequency(chosen);
    ap.set_mode(Mode::AdHoc);

    let auth = if ap.encrypted() { AuthMethod::SharedKey } else { AuthMethod::None };
    let _ = collab.radio.set_mode(Mode::AdHoc);
    let _ = collab.radio.set_frequency(chosen);
    if let Some(key) = ap.key() {
        let _ = collab.radio.set_encryption_key(&key, auth);
    }
    let _ = collab.radio.set_essid(&ap.essid().unwrap_or_default());

    Ok(())
}

fn channel_to_freq(channel: u32) -> u32 {
    if channel == 14 { 2484 } else { 2407 + channel * 5 }
}

/// CONFIGURE_IP: delete the current default route, then AutoIP / DHCP /
/// static configuration depending on the target and the device's
/// configuration record.
fn configure_ip(
    request: &ActivationRequest,
    collab: &Collaborators,
    ap: Option<&AccessPoint>,
) -> Outcome {
    request.phase.set(Phase::ConfigureIp);
    let device = &request.device;
    collab.system.delete_default_route(device);

    let use_autoip = ap.is_some_and(|ap| ap.mode() == Mode::AdHoc);
    let ip_config = device.ip_config.read().unwrap().clone();

    if use_autoip {
        if collab.autoip.configure(device) {
            request.phase.set(Phase::Running);
            return Outcome::Success;
        }
        return Outcome::Failed(Error::DhcpFailed { iface: device.iface.clone() });
    }

    match ip_config {
        IpConfig::Dhcp => {
            let (outcome, lease) = collab.dhcp.request(device);
            match outcome {
                DhcpOutcome::Bound => {
                    if let Some(lease) = &lease {
                        device.set_ipv4(Some(lease.address));
                        collab.bus.publish(BusEvent::DeviceIp4AddressChanged {
                            device_path: device.path.clone(),
                            addr: Some(lease.address),
                        });
                        collab.dhcp.setup_timeouts(device, lease);
                    }
                    collab.system.flush_arp_cache();
                    collab.system.restart_mdns_responder();
                    request.phase.set(Phase::Running);
                    collab.bus.publish(BusEvent::DeviceStatusChanged {
                        device_path: device.path.clone(),
                        phase: DevicePhase::NowActive,
                    });
                    run_lease_loop(request, collab);
                    // The loop only returns once cancelled; the caller's
                    // final match publishes NoLongerActive for it.
                    Outcome::Cancelled
                },
                DhcpOutcome::Failed => {
                    let _ = collab.radio.set_essid(" ");
                    let _ = collab.radio.set_encryption_key(&[], AuthMethod::None);
                    Outcome::Failed(Error::DhcpFailed { iface: device.iface.clone() })
                },
            }
        },
        IpConfig::Static { address, .. } => {
            if collab.static_config.setup_static_ipv4(device) {
                device.set_ipv4(Some(address));
                collab.bus.publish(BusEvent::DeviceIp4AddressChanged {
                    device_path: device.path.clone(),
                    addr: Some(address),
                });
                request.phase.set(Phase::Running);
                Outcome::Success
            } else {
                Outcome::Failed(Error::InvalidArgument("static IPv4 configuration failed".into()))
            }
        },
    }
}

/// RUNNING: DHCP-leased devices own a lease-maintenance loop. Simplified
/// here to a cancellation-responsive wait, since renew/rebind scheduling is
/// the DHCP collaborator's own contract (§6) and out of scope for this
/// core.
fn run_lease_loop(request: &ActivationRequest, collab: &Collaborators) {
    while !request.cancel.is_cancelled() {
        if !collab.clock.sleep(Duration::from_secs(60), &request.cancel) {
            break;
        }
    }
    if request.cancel.is_cancelled() {
        collab.dhcp.cease(&request.device);
    }
}

/// Directed ESSID selection (§4.6): user override that probes for the
/// network's existence across the auth-method order appropriate to its
/// known encryption state, then freezes it as the best AP.
pub fn find_and_use_essid(
    device: &Arc<Device>,
    collab: &Collaborators,
    essid: &str,
    key: Option<Vec<u8>>,
    key_type: KeyType,
    known_unencrypted: bool,
) -> Result<()> {
    let _ = collab.radio.bring_down();

    let order: [AuthMethod; 3] = if known_unencrypted {
        [AuthMethod::None, AuthMethod::SharedKey, AuthMethod::OpenSystem]
    } else {
        [AuthMethod::SharedKey, AuthMethod::OpenSystem, AuthMethod::None]
    };

    let mut found_bssid = None;
    let mut needed_encryption = false;

    let pause = association_pause(collab, collab.radio.num_channels().unwrap_or(11));
    for auth in order {
        if let Some(key) = &key {
            let _ = collab.radio.set_encryption_key(key, auth);
        }
        let _ = collab.radio.set_mode(Mode::Infrastructure);
        let _ = collab.radio.set_essid(essid);
        thread::sleep(pause);

        if let Ok(Some(bssid)) = collab.radio.get_associated_bssid() {
            found_bssid = Some(bssid);
            needed_encryption = auth != AuthMethod::None;
            break;
        }
    }

    let Some(bssid) = found_bssid else {
        return Err(Error::AssociationFailed { essid: essid.to_string() });
    };

    let wireless = device.wireless().expect("wireless only");
    let existing = wireless.visible.read().unwrap().get_by_essid(essid);

    let ap = match existing {
        Some(ap) => ap,
        None => {
            // Cloaked: not in the device list, create an artificial record.
            let ap = AccessPoint::new(Some(essid.to_string()), Some(bssid));
            ap.set_artificial(true);
            let mut visible = wireless.visible.write().unwrap();
            visible.append(ap.clone());
            ap
        },
    };

    if let Some(allowed_ap) = device.allowed.read().unwrap().get_by_essid(essid) {
        ap.set_key(allowed_ap.key(), allowed_ap.key_type());
    }
    if let Some(key) = key {
        ap.set_key(Some(key), key_type);
    }
    ap.mark_encrypted(needed_encryption);

    selector::freeze(device, ap);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn association_pause_is_10s_over_14_channels_else_5s() {
        let collab = test_collaborators();
        assert_eq!(association_pause(&collab, 15), Duration::from_secs(10));
        assert_eq!(association_pause(&collab, 14), Duration::from_secs(5));
        assert_eq!(association_pause(&collab, 1), Duration::from_secs(5));
    }

    #[test]
    fn attempt_counter_increments_and_resets_on_essid_change() {
        let request = ActivationRequest {
            device: test_device(),
            cancel: CancelFlag::new(),
            phase: PhaseCell::default(),
            attempts: std::sync::Mutex::new(HashMap::new()),
        };

        assert_eq!(request.attempt_for("wifi"), 1);
        assert_eq!(request.attempt_for("wifi"), 2);

        request.reset_attempts_except("other");
        assert_eq!(request.attempt_for("wifi"), 1);
    }

    #[test]
    fn two_consecutive_cancels_are_equivalent_to_one() {
        let device = test_device();
        let request = Arc::new(ActivationRequest {
            device: device.clone(),
            cancel: CancelFlag::new(),
            phase: PhaseCell::default(),
            attempts: std::sync::Mutex::new(HashMap::new()),
        });
        device.begin_activating();
        device.end_activating();

        activation_cancel(&request);
        activation_cancel(&request);
        assert!(request.cancel.is_cancelled());
    }

    fn test_device() -> Arc<Device> {
        use std::sync::RwLock;

        use crate::ap::{ApList, ApListKind};
        use crate::device::DriverSupport;

        let allowed = Arc::new(RwLock::new(ApList::new(ApListKind::Allowed)));
        let invalid = Arc::new(RwLock::new(ApList::new(ApListKind::Invalid)));
        Device::new(
            "/devices/0",
            "wlan0",
            DeviceKind::Wireless,
            DriverSupport::FullySupported,
            allowed,
            invalid,
        )
    }

    fn test_collaborators() -> Collaborators {
        use crate::collab::stub::{StubAutoIp, StubDhcp, StubStaticConfig, StubSystemHelpers};
        use crate::radio::SyntheticRadio;

        Collaborators {
            radio: Arc::new(SyntheticRadio::default()),
            bus: Arc::new(crate::bus::ChannelBus::new()),
            dhcp: Arc::new(StubDhcp::default()),
            autoip: Arc::new(StubAutoIp),
            static_config: Arc::new(StubStaticConfig),
            system: Arc::new(StubSystemHelpers),
            clock: Arc::new(crate::clock::SystemClock),
            association_pause_short: Duration::from_secs(5),
            association_pause_long: Duration::from_secs(10),
        }
    }

    fn test_request() -> ActivationRequest {
        ActivationRequest {
            device: test_device(),
            cancel: CancelFlag::new(),
            phase: PhaseCell::default(),
            attempts: std::sync::Mutex::new(HashMap::new()),
        }
    }

    /// DHCP-bound activation must publish NowActive (and reach RUNNING)
    /// before it enters the lease-maintenance loop, not only at teardown.
    #[test]
    fn configure_ip_publishes_now_active_before_the_lease_loop() {
        use crate::bus::BusEvent;

        let mut collab = test_collaborators();
        let bus = crate::bus::ChannelBus::new();
        let mut events = bus.take_receiver().unwrap();
        collab.bus = Arc::new(bus);
        collab.clock = Arc::new(crate::clock::MockClock::new());

        let request = test_request();
        // Pre-cancel so `run_lease_loop`'s wait exits on its first check
        // instead of actually blocking.
        request.cancel.cancel();

        let outcome = configure_ip(&request, &collab, None);
        assert!(matches!(outcome, Outcome::Cancelled));
        assert_eq!(request.phase.get(), Phase::Running);

        assert!(matches!(events.try_recv(), Ok(BusEvent::DeviceIp4AddressChanged { .. })));
        match events.try_recv() {
            Ok(BusEvent::DeviceStatusChanged { phase, .. }) => {
                assert_eq!(phase, crate::bus::DevicePhase::NowActive);
            },
            other => panic!("expected NowActive, got {other:?}"),
        }
    }

    /// DHCP failure under SharedKey must retry `configure_ip` under
    /// OpenSystem in place, without resetting the AP back to SharedKey.
    #[test]
    fn auth_ladder_retries_open_system_on_dhcp_failure_under_shared_key() {
        use crate::ap::{AccessPoint, KeyType};
        use crate::collab::DhcpOutcome;
        use crate::collab::stub::StubDhcp;
        use crate::radio::SyntheticRadio;

        let mut collab = test_collaborators();
        collab.radio = Arc::new(SyntheticRadio::default());
        collab.clock = Arc::new(crate::clock::MockClock::new());
        collab.dhcp = Arc::new(StubDhcp { outcome: DhcpOutcome::Failed, address: "0.0.0.0".parse().unwrap() });

        let request = test_request();
        let ap = AccessPoint::new(Some("net".into()), None);
        ap.set_key(Some(vec![1, 2, 3, 4]), KeyType::Hex);

        let outcome = run_auth_ladder(&request, &collab, &ap);
        // Both SharedKey and OpenSystem attempts fail DHCP here; the key is
        // treated as wrong and NEED_KEY must be re-entered.
        assert!(matches!(outcome, LadderOutcome::NeedKeyAgain));
        assert_eq!(ap.auth(), AuthMethod::OpenSystem);
        assert!(ap.key().is_none());
    }

}
