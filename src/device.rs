//! The `Device` type: one managed network interface, wired or wireless.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, TryLockError};

use crate::ap::{ApList, ApListKind, AccessPoint};
use crate::error::{Error, Result};

/// Interface kind.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DeviceKind {
    Wired,
    Wireless,
    Unknown,
}

/// How much the driver/hardware-abstraction layer supports this device.
///
/// A device classified [`DriverSupport::Unsupported`] must reject every
/// operation except construction and destruction.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum DriverSupport {
    Unsupported,
    SemiSupported,
    FullySupported,
}

/// Static-vs-DHCP IPv4 configuration record for a device.
#[derive(Clone, Debug)]
pub enum IpConfig {
    Dhcp,
    Static { address: Ipv4Addr, netmask: Ipv4Addr, gateway: Option<Ipv4Addr> },
}

impl Default for IpConfig {
    fn default() -> Self {
        IpConfig::Dhcp
    }
}

/// Scan-cycle state belonging exclusively to a wireless device.
pub struct WirelessSubstate {
    pub scan_capable: bool,
    pub essid: RwLock<Option<String>>,
    pub mode: RwLock<crate::ap::Mode>,
    pub num_channels: RwLock<u32>,
    pub max_quality: RwLock<u8>,
    pub signal_percent: RwLock<Option<u8>>,
    pub noise: RwLock<Option<u8>>,

    /// Best-AP handle plus freeze flag, guarded by `device.best_ap_lock`.
    best_ap: RwLock<Option<Arc<AccessPoint>>>,
    frozen: AtomicBool,

    /// Three rolling scan snapshots, newest first.
    pub snapshots: Mutex<[ApList; 3]>,

    /// Visible APs after `combine(S1, S2)`.
    pub visible: RwLock<ApList>,

    /// Non-blocking: held for the duration of a full scan.
    pub scan_lock: Mutex<()>,
}

impl WirelessSubstate {
    pub fn new(scan_capable: bool) -> Self {
        Self {
            scan_capable,
            essid: RwLock::new(None),
            mode: RwLock::new(crate::ap::Mode::Unknown),
            num_channels: RwLock::new(11),
            max_quality: RwLock::new(100),
            signal_percent: RwLock::new(None),
            noise: RwLock::new(None),
            best_ap: RwLock::new(None),
            frozen: AtomicBool::new(false),
            snapshots: Mutex::new([
                ApList::new(ApListKind::DeviceScan),
                ApList::new(ApListKind::DeviceScan),
                ApList::new(ApListKind::DeviceScan),
            ]),
            visible: RwLock::new(ApList::new(ApListKind::DeviceScan)),
            scan_lock: Mutex::new(()),
        }
    }

    pub fn best_ap(&self) -> Option<Arc<AccessPoint>> {
        self.best_ap.read().unwrap().clone()
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Read-modify-write the best-AP handle and freeze flag atomically with
    /// respect to other callers of this method.
    pub fn set_best_ap(&self, ap: Option<Arc<AccessPoint>>, frozen: bool) {
        *self.best_ap.write().unwrap() = ap;
        self.frozen.store(frozen, Ordering::SeqCst);
    }

    pub fn clear_freeze(&self) {
        self.frozen.store(false, Ordering::SeqCst);
    }

    /// Try to acquire the scan lock without blocking. A held lock means a
    /// scan is already in progress; the caller should skip this tick.
    pub fn try_scan_lock(&self) -> Option<std::sync::MutexGuard<'_, ()>> {
        match self.scan_lock.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::WouldBlock) => None,
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
        }
    }
}

/// One managed network interface.
pub struct Device {
    /// Stable external identifier, e.g. the host-bus object path.
    pub path: String,
    /// Kernel interface name, e.g. `wlan0`.
    pub iface: String,
    pub kind: DeviceKind,
    driver_support: RwLock<DriverSupport>,
    link_active: AtomicBool,
    hw_addr: RwLock<Option<[u8; 6]>>,
    ipv4: RwLock<Option<Ipv4Addr>>,
    pub ip_config: RwLock<IpConfig>,

    /// `Some` only for [`DeviceKind::Wireless`].
    pub wireless: Option<WirelessSubstate>,

    /// Process-wide lists, injected at construction (see design notes).
    pub allowed: Arc<RwLock<ApList>>,
    pub invalid: Arc<RwLock<ApList>>,

    /// Synthetic test devices short-circuit every radio primitive.
    pub synthetic: bool,

    activating: AtomicBool,
}

impl Device {
    pub fn new(
        path: impl Into<String>,
        iface: impl Into<String>,
        kind: DeviceKind,
        driver_support: DriverSupport,
        allowed: Arc<RwLock<ApList>>,
        invalid: Arc<RwLock<ApList>>,
    ) -> Arc<Self> {
        let wireless = matches!(kind, DeviceKind::Wireless).then(|| WirelessSubstate::new(true));
        Arc::new(Self {
            path: path.into(),
            iface: iface.into(),
            kind,
            driver_support: RwLock::new(driver_support),
            link_active: AtomicBool::new(false),
            hw_addr: RwLock::new(None),
            ipv4: RwLock::new(None),
            ip_config: RwLock::new(IpConfig::default()),
            wireless,
            allowed,
            invalid,
            synthetic: false,
            activating: AtomicBool::new(false),
        })
    }

    /// Construct a synthetic device. Callers must have already checked the
    /// `enable-test-devices` config flag — this constructor doesn't, to keep
    /// the policy decision in one place (`main`/the device registry).
    pub fn new_synthetic(
        path: impl Into<String>,
        iface: impl Into<String>,
        allowed: Arc<RwLock<ApList>>,
        invalid: Arc<RwLock<ApList>>,
    ) -> Arc<Self> {
        let device = Self::new(
            path,
            iface,
            DeviceKind::Wireless,
            DriverSupport::FullySupported,
            allowed,
            invalid,
        );
        // SAFETY-free: we just built the Arc, uniquely owned here.
        let device = Arc::into_inner(device).expect("freshly constructed Arc is unique");
        Arc::new(Self { synthetic: true, ..device })
    }

    pub fn driver_support(&self) -> DriverSupport {
        *self.driver_support.read().unwrap()
    }

    pub fn set_driver_support(&self, support: DriverSupport) {
        *self.driver_support.write().unwrap() = support;
    }

    /// Every non-lifecycle operation must call this first.
    pub fn require_supported(&self) -> Result<()> {
        if self.driver_support() == DriverSupport::Unsupported {
            return Err(Error::NoDriverSupport(self.iface.clone()));
        }
        Ok(())
    }

    pub fn is_link_active(&self) -> bool {
        self.link_active.load(Ordering::SeqCst)
    }

    pub fn set_link_active(&self, active: bool) {
        self.link_active.store(active, Ordering::SeqCst);
    }

    pub fn hw_addr(&self) -> Option<[u8; 6]> {
        *self.hw_addr.read().unwrap()
    }

    pub fn set_hw_addr(&self, addr: [u8; 6]) {
        *self.hw_addr.write().unwrap() = Some(addr);
    }

    pub fn ipv4(&self) -> Option<Ipv4Addr> {
        *self.ipv4.read().unwrap()
    }

    pub fn set_ipv4(&self, addr: Option<Ipv4Addr>) {
        *self.ipv4.write().unwrap() = addr;
    }

    pub fn wireless(&self) -> Option<&WirelessSubstate> {
        self.wireless.as_ref()
    }

    pub fn is_activating(&self) -> bool {
        self.activating.load(Ordering::SeqCst)
    }

    /// Attempt to transition into the activating state. Returns `false` if
    /// an activation is already in progress for this device — enforces "at
    /// most one activation worker exists for a device at any time".
    pub fn begin_activating(&self) -> bool {
        self.activating.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn end_activating(&self) {
        self.activating.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lists() -> (Arc<RwLock<ApList>>, Arc<RwLock<ApList>>) {
        (
            Arc::new(RwLock::new(ApList::new(ApListKind::Allowed))),
            Arc::new(RwLock::new(ApList::new(ApListKind::Invalid))),
        )
    }

    #[test]
    fn unsupported_device_rejects_operations() {
        let (allowed, invalid) = lists();
        let device = Device::new(
            "/devices/0",
            "eth0",
            DeviceKind::Wired,
            DriverSupport::Unsupported,
            allowed,
            invalid,
        );
        assert!(matches!(device.require_supported(), Err(Error::NoDriverSupport(_))));
    }

    #[test]
    fn only_one_activation_worker_at_a_time() {
        let (allowed, invalid) = lists();
        let device = Device::new(
            "/devices/0",
            "wlan0",
            DeviceKind::Wireless,
            DriverSupport::FullySupported,
            allowed,
            invalid,
        );
        assert!(device.begin_activating());
        assert!(!device.begin_activating());
        device.end_activating();
        assert!(device.begin_activating());
    }

    #[test]
    fn scan_lock_try_lock_skips_when_held() {
        let (allowed, invalid) = lists();
        let device = Device::new(
            "/devices/0",
            "wlan0",
            DeviceKind::Wireless,
            DriverSupport::FullySupported,
            allowed,
            invalid,
        );
        let wireless = device.wireless().unwrap();
        let guard = wireless.try_scan_lock();
        assert!(guard.is_some());
        assert!(wireless.try_scan_lock().is_none());
    }
}
