//! Host-bus signalling boundary (§6): the four outbound events the engine
//! publishes, and the one inbound call it makes to ask a front-end for a
//! pre-shared key.
//!
//! The teacher (`catacombing-gorm`) is itself a client of this surface: its
//! `dbus.rs` listens for `DeviceStatusChanged`-shaped signals from
//! NetworkManager over `zbus`. This crate sits on the other side of that
//! relationship, so [`ZbusBus`] is a minimal signal *emitter* grounded in
//! the same `zbus`/`tokio` stack, built against a `#[zbus::interface]` impl
//! rather than the teacher's `#[zbus::proxy]` trait. [`ChannelBus`] is the
//! in-process stand-in used by tests and library embedders.

use std::sync::Mutex;

use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use zbus::interface;

/// Exact cancellation marker from the external key-prompt channel contract.
pub const CANCELLED_SENTINEL: &str = "***canceled***";

/// `DeviceStatusChanged` phase values.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DevicePhase {
    Activating,
    NoLongerActive,
    NowActive,
}

/// One outbound host-bus event.
#[derive(Clone, Debug)]
pub enum BusEvent {
    DeviceStatusChanged { device_path: String, phase: DevicePhase },
    DeviceIp4AddressChanged { device_path: String, addr: Option<std::net::Ipv4Addr> },
    WirelessNetworkAppeared { device_path: String, essid: String, bssid: Option<[u8; 6]> },
    WirelessNetworkDisappeared { device_path: String, essid: String, bssid: Option<[u8; 6]> },
}

/// The result of a `GetUserKeyForNetwork` round trip.
#[derive(Clone, Debug)]
pub enum KeyResponse {
    Key(Vec<u8>),
    Cancelled,
}

impl KeyResponse {
    pub fn from_wire(s: &str) -> Self {
        if s == CANCELLED_SENTINEL { KeyResponse::Cancelled } else { KeyResponse::Key(s.into()) }
    }
}

/// Abstraction over the host-bus surface, so the Activation Engine never
/// talks to `zbus` directly.
pub trait Bus: Send + Sync {
    fn publish(&self, event: BusEvent);

    /// Ask the front-end for a pre-shared key. Blocks the calling
    /// (activation worker) thread until the front-end responds; the
    /// Activation Engine is responsible for making this pollable/cancellable
    /// at a higher level (§4.5's "block on the user-key-received signal,
    /// poll 2Hz, respects cancel").
    fn get_user_key_for_network(
        &self,
        device_path: &str,
        essid: &str,
        attempt: u32,
    ) -> KeyResponse;
}

/// In-memory bus for tests and library embedders: events land on an mpsc
/// channel, key requests are served from a pre-seeded queue of responses.
pub struct ChannelBus {
    events_tx: mpsc::UnboundedSender<BusEvent>,
    pub events_rx: Mutex<Option<mpsc::UnboundedReceiver<BusEvent>>>,
    key_responses: Mutex<std::collections::VecDeque<KeyResponse>>,
}

impl ChannelBus {
    pub fn new() -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            events_tx,
            events_rx: Mutex::new(Some(events_rx)),
            key_responses: Mutex::new(std::collections::VecDeque::new()),
        }
    }

    /// Queue a canned response for the next `get_user_key_for_network` call.
    pub fn push_key_response(&self, response: KeyResponse) {
        self.key_responses.lock().unwrap().push_back(response);
    }

    pub fn take_receiver(&self) -> Option<mpsc::UnboundedReceiver<BusEvent>> {
        self.events_rx.lock().unwrap().take()
    }
}

impl Default for ChannelBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Bus for ChannelBus {
    fn publish(&self, event: BusEvent) {
        let _ = self.events_tx.send(event);
    }

    fn get_user_key_for_network(
        &self,
        _device_path: &str,
        _essid: &str,
        _attempt: u32,
    ) -> KeyResponse {
        self.key_responses.lock().unwrap().pop_front().unwrap_or(KeyResponse::Cancelled)
    }
}

/// `zbus`-backed reference implementation. Publishes signals on a
/// `org.freedesktop.NetworkManager`-shaped interface and forwards key
/// requests to a front-end over a oneshot-per-request channel fed by the
/// connection's dispatch task.
///
/// Building a full NetworkManager-compatible server is out of scope — this
/// only wires the four events and one call named in §6.
pub struct ZbusBus {
    connection: zbus::blocking::Connection,
    key_requests_tx: mpsc::UnboundedSender<KeyRequest>,
}

pub struct KeyRequest {
    pub device_path: String,
    pub essid: String,
    pub attempt: u32,
    pub respond: oneshot::Sender<KeyResponse>,
}

struct SignalEmitter;

#[interface(name = "org.freedesktop.NetworkManager.LinkCore")]
impl SignalEmitter {
    #[zbus(signal)]
    async fn device_status_changed(
        ctxt: &zbus::SignalEmitter<'_>,
        device_path: String,
        phase: String,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn device_ip4_address_changed(
        ctxt: &zbus::SignalEmitter<'_>,
        device_path: String,
        addr: String,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn wireless_network_appeared(
        ctxt: &zbus::SignalEmitter<'_>,
        device_path: String,
        essid: String,
        bssid: String,
    ) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn wireless_network_disappeared(
        ctxt: &zbus::SignalEmitter<'_>,
        device_path: String,
        essid: String,
        bssid: String,
    ) -> zbus::Result<()>;
}

impl ZbusBus {
    pub fn connect(key_requests_tx: mpsc::UnboundedSender<KeyRequest>) -> zbus::Result<Self> {
        let connection = zbus::blocking::connection::Builder::session()?
            .name("org.freedesktop.NetworkManager.LinkCore")?
            .serve_at("/org/freedesktop/NetworkManager/LinkCore", SignalEmitter)?
            .build()?;
        Ok(Self { connection, key_requests_tx })
    }

    fn emitter(&self) -> zbus::Result<zbus::SignalEmitter<'_>> {
        zbus::SignalEmitter::new(
            self.connection.inner(),
            "/org/freedesktop/NetworkManager/LinkCore",
        )
    }
}

fn format_bssid(bssid: Option<[u8; 6]>) -> String {
    bssid
        .map(|b| b.iter().map(|byte| format!("{byte:02x}")).collect::<Vec<_>>().join(":"))
        .unwrap_or_default()
}

impl Bus for ZbusBus {
    fn publish(&self, event: BusEvent) {
        let Ok(emitter) = self.emitter() else {
            warn!("failed to build signal emitter for bus event");
            return;
        };

        let executor = self.connection.inner().executor();
        let result = match event {
            BusEvent::DeviceStatusChanged { device_path, phase } => {
                let phase = match phase {
                    DevicePhase::Activating => "Activating",
                    DevicePhase::NoLongerActive => "NoLongerActive",
                    DevicePhase::NowActive => "NowActive",
                };
                info!(device_path, phase, "DeviceStatusChanged");
                executor.block_on(SignalEmitter::device_status_changed(
                    &emitter,
                    device_path,
                    phase.into(),
                ))
            },
            BusEvent::DeviceIp4AddressChanged { device_path, addr } => {
                let addr = addr.map(|a| a.to_string()).unwrap_or_default();
                info!(device_path, addr, "DeviceIp4AddressChanged");
                executor.block_on(SignalEmitter::device_ip4_address_changed(
                    &emitter,
                    device_path,
                    addr,
                ))
            },
            BusEvent::WirelessNetworkAppeared { device_path, essid, bssid } => {
                info!(device_path, essid, "WirelessNetworkAppeared");
                executor.block_on(SignalEmitter::wireless_network_appeared(
                    &emitter,
                    device_path,
                    essid,
                    format_bssid(bssid),
                ))
            },
            BusEvent::WirelessNetworkDisappeared { device_path, essid, bssid } => {
                info!(device_path, essid, "WirelessNetworkDisappeared");
                executor.block_on(SignalEmitter::wireless_network_disappeared(
                    &emitter,
                    device_path,
                    essid,
                    format_bssid(bssid),
                ))
            },
        };

        if let Err(err) = result {
            warn!("failed to publish bus event: {err}");
        }
    }

    fn get_user_key_for_network(
        &self,
        device_path: &str,
        essid: &str,
        attempt: u32,
    ) -> KeyResponse {
        let (respond, rx) = oneshot::channel();
        let request = KeyRequest {
            device_path: device_path.to_string(),
            essid: essid.to_string(),
            attempt,
            respond,
        };
        if self.key_requests_tx.send(request).is_err() {
            return KeyResponse::Cancelled;
        }
        rx.blocking_recv().unwrap_or(KeyResponse::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_bus_serves_queued_key_responses_in_order() {
        let bus = ChannelBus::new();
        bus.push_key_response(KeyResponse::Key(b"deadbeef01".to_vec()));
        bus.push_key_response(KeyResponse::Cancelled);

        match bus.get_user_key_for_network("/devices/0", "wifi", 1) {
            KeyResponse::Key(k) => assert_eq!(k, b"deadbeef01"),
            KeyResponse::Cancelled => panic!("expected key"),
        }
        assert!(matches!(
            bus.get_user_key_for_network("/devices/0", "wifi", 2),
            KeyResponse::Cancelled
        ));
    }

    #[test]
    fn channel_bus_defaults_to_cancelled_when_queue_empty() {
        let bus = ChannelBus::new();
        assert!(matches!(
            bus.get_user_key_for_network("/devices/0", "wifi", 1),
            KeyResponse::Cancelled
        ));
    }

    #[test]
    fn key_response_recognises_cancellation_sentinel() {
        assert!(matches!(KeyResponse::from_wire(CANCELLED_SENTINEL), KeyResponse::Cancelled));
        assert!(matches!(KeyResponse::from_wire("abc123"), KeyResponse::Key(_)));
    }

    #[test]
    fn channel_bus_publishes_events_in_order() {
        let bus = ChannelBus::new();
        let mut rx = bus.take_receiver().unwrap();

        bus.publish(BusEvent::DeviceStatusChanged {
            device_path: "/devices/0".into(),
            phase: DevicePhase::Activating,
        });
        bus.publish(BusEvent::DeviceStatusChanged {
            device_path: "/devices/0".into(),
            phase: DevicePhase::NowActive,
        });

        assert!(matches!(
            rx.try_recv().unwrap(),
            BusEvent::DeviceStatusChanged { phase: DevicePhase::Activating, .. }
        ));
        assert!(matches!(
            rx.try_recv().unwrap(),
            BusEvent::DeviceStatusChanged { phase: DevicePhase::NowActive, .. }
        ));
    }
}
