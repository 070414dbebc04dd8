//! External collaborator contracts (§6): DHCP, AutoIP, static configuration,
//! the hardware-abstraction property store, and misc system helpers.
//!
//! These subsystems are explicitly out of scope for this core — it only
//! needs to call them. Each is a trait so the Activation Engine can be
//! exercised against deterministic stand-ins in tests, the same way the
//! teacher's `dbus.rs` talks to NetworkManager through a generated proxy
//! trait rather than hand-rolled D-Bus calls.

use std::net::Ipv4Addr;

use crate::device::Device;

/// Outcome of a DHCP request.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DhcpOutcome {
    Bound,
    Failed,
}

/// Lease parameters handed back on a successful bind.
#[derive(Clone, Debug)]
pub struct Lease {
    pub address: Ipv4Addr,
    pub renew_after: std::time::Duration,
    pub rebind_after: std::time::Duration,
}

pub trait Dhcp: Send + Sync {
    fn request(&self, device: &Device) -> (DhcpOutcome, Option<Lease>);
    fn cease(&self, device: &Device);
    fn setup_timeouts(&self, device: &Device, lease: &Lease);
    fn free(&self, iface: &str);
}

pub trait AutoIp: Send + Sync {
    fn configure(&self, device: &Device) -> bool;
}

pub trait StaticConfig: Send + Sync {
    fn setup_static_ipv4(&self, device: &Device) -> bool;
}

/// Hardware-abstraction-like property store: driver-support classification
/// and generic boolean property queries, keyed by a HAL-style unique device
/// identifier.
pub trait Hal: Send + Sync {
    fn exists(&self, udi: &str, key: &str) -> bool;
    fn get_bool(&self, udi: &str, key: &str) -> bool;
    fn driver_support(&self, udi: &str) -> crate::device::DriverSupport;
}

pub trait SystemHelpers: Send + Sync {
    fn delete_default_route(&self, device: &Device);
    fn flush_routes(&self, device: &Device);
    fn flush_addresses(&self, device: &Device);
    fn flush_arp_cache(&self);
    fn restart_mdns_responder(&self);
}

/// Deterministic collaborators used by tests and by synthetic devices: DHCP
/// always binds a fixed lease, AutoIP/static configuration always succeed,
/// and system helpers are no-ops that log at `trace` level.
pub mod stub {
    use std::time::Duration;

    use tracing::trace;

    use super::*;

    pub struct StubDhcp {
        pub outcome: DhcpOutcome,
        pub address: Ipv4Addr,
    }

    impl Default for StubDhcp {
        fn default() -> Self {
            Self { outcome: DhcpOutcome::Bound, address: Ipv4Addr::new(10, 0, 0, 42) }
        }
    }

    impl Dhcp for StubDhcp {
        fn request(&self, device: &Device) -> (DhcpOutcome, Option<Lease>) {
            trace!(iface = %device.iface, "stub DHCP request");
            match self.outcome {
                DhcpOutcome::Bound => (
                    DhcpOutcome::Bound,
                    Some(Lease {
                        address: self.address,
                        renew_after: Duration::from_secs(1800),
                        rebind_after: Duration::from_secs(3150),
                    }),
                ),
                DhcpOutcome::Failed => (DhcpOutcome::Failed, None),
            }
        }

        fn cease(&self, device: &Device) {
            trace!(iface = %device.iface, "stub DHCP cease");
        }

        fn setup_timeouts(&self, device: &Device, lease: &Lease) {
            trace!(iface = %device.iface, ?lease.renew_after, "stub DHCP setup_timeouts");
        }

        fn free(&self, iface: &str) {
            trace!(iface, "stub DHCP free");
        }
    }

    #[derive(Default)]
    pub struct StubAutoIp;

    impl AutoIp for StubAutoIp {
        fn configure(&self, device: &Device) -> bool {
            trace!(iface = %device.iface, "stub AutoIP configure");
            true
        }
    }

    #[derive(Default)]
    pub struct StubStaticConfig;

    impl StaticConfig for StubStaticConfig {
        fn setup_static_ipv4(&self, device: &Device) -> bool {
            trace!(iface = %device.iface, "stub static IPv4 configure");
            true
        }
    }

    /// Reports every device fully supported and every property absent;
    /// enough to let a real HAL-less registry exercise the §6 boundary.
    #[derive(Default)]
    pub struct StubHal;

    impl Hal for StubHal {
        fn exists(&self, _udi: &str, _key: &str) -> bool {
            false
        }

        fn get_bool(&self, _udi: &str, _key: &str) -> bool {
            false
        }

        fn driver_support(&self, udi: &str) -> crate::device::DriverSupport {
            trace!(udi, "stub HAL driver_support");
            crate::device::DriverSupport::FullySupported
        }
    }

    #[derive(Default)]
    pub struct StubSystemHelpers;

    impl SystemHelpers for StubSystemHelpers {
        fn delete_default_route(&self, device: &Device) {
            trace!(iface = %device.iface, "stub delete_default_route");
        }

        fn flush_routes(&self, device: &Device) {
            trace!(iface = %device.iface, "stub flush_routes");
        }

        fn flush_addresses(&self, device: &Device) {
            trace!(iface = %device.iface, "stub flush_addresses");
        }

        fn flush_arp_cache(&self) {
            trace!("stub flush_arp_cache");
        }

        fn restart_mdns_responder(&self) {
            trace!("stub restart_mdns_responder");
        }
    }
}
