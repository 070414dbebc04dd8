//! C1: Radio Control — a thin typed wrapper over the Linux Wireless
//! Extensions / socket ioctl surface.
//!
//! Grounded directly in the WEXT ioctl sequence used by embedded Wi-Fi HALs
//! that speak the same `iwreq`/`ioctl(2)` protocol as desktop Linux: socket
//! creation, `#[repr(C)]` request structs, raw `libc::ioctl` calls, and the
//! `EAGAIN`/`E2BIG` scan-readiness convention.

use std::ffi::CString;
use std::net::Ipv4Addr;
use std::{io, mem, ptr};

use tracing::{debug, warn};

use crate::ap::{AuthMethod, Mode};
use crate::error::{Error, Result};

// Wireless Extension ioctl opcodes (linux/wireless.h).
const SIOCGIWNAME: libc::c_ulong = 0x8B01;
const SIOCSIWFREQ: libc::c_ulong = 0x8B04;
const SIOCGIWFREQ: libc::c_ulong = 0x8B05;
const SIOCSIWMODE: libc::c_ulong = 0x8B06;
const SIOCGIWMODE: libc::c_ulong = 0x8B07;
const SIOCSIWAP: libc::c_ulong = 0x8B14;
const SIOCGIWAP: libc::c_ulong = 0x8B15;
const SIOCSIWSCAN: libc::c_ulong = 0x8B18;
const SIOCGIWSCAN: libc::c_ulong = 0x8B19;
const SIOCSIWESSID: libc::c_ulong = 0x8B1A;
const SIOCGIWESSID: libc::c_ulong = 0x8B1B;
const SIOCGIWRATE: libc::c_ulong = 0x8B21;
const SIOCSIWRATE: libc::c_ulong = 0x8B20;
const SIOCGIWRANGE: libc::c_ulong = 0x8B0B;
const SIOCSIWENCODE: libc::c_ulong = 0x8B2A;
const SIOCGIWENCODE: libc::c_ulong = 0x8B2B;
const SIOCGIWSTATS: libc::c_ulong = 0x8B0F;

// Standard socket ioctls.
const SIOCGIFADDR: libc::c_ulong = 0x8915;
const SIOCGIFNETMASK: libc::c_ulong = 0x891B;
const SIOCGIFHWADDR: libc::c_ulong = 0x8927;
const SIOCGIFFLAGS: libc::c_ulong = 0x8913;
const SIOCSIFFLAGS: libc::c_ulong = 0x8914;

// MII ioctls for wired link probing.
const SIOCGMIIPHY: libc::c_ulong = 0x8947;
const SIOCDEVPRIVATE: libc::c_ulong = 0x89F0;

const IW_MODE_AUTO: u32 = 0;
const IW_MODE_ADHOC: u32 = 1;
const IW_MODE_INFRA: u32 = 2;

const IW_ENCODE_DISABLED: u16 = 0x8000;
const IW_ENCODE_NOKEY: u16 = 0x0800;
const IW_ENCODE_OPEN: u16 = 0x2000;
const IW_ENCODE_RESTRICTED: u16 = 0x4000;

const IFF_UP: libc::c_short = 0x1;

const EAGAIN: i32 = libc::EAGAIN;
const E2BIG: i32 = libc::E2BIG;

const IW_SCAN_MAX_DATA: usize = 4096;

#[repr(C)]
#[derive(Copy, Clone)]
struct IwPoint {
    pointer: *mut libc::c_void,
    length: u16,
    flags: u16,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct IwParam {
    value: i32,
    fixed: u8,
    disabled: u8,
    flags: u16,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct IwFreq {
    m: i32,
    e: i16,
    i: u8,
    flags: u8,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct IwQuality {
    qual: u8,
    level: u8,
    noise: u8,
    updated: u8,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct SockAddr {
    sa_family: u16,
    sa_data: [u8; 14],
}

#[repr(C)]
#[derive(Copy, Clone)]
union IwReqData {
    name: [libc::c_char; 16],
    essid: IwPoint,
    freq: IwFreq,
    bitrate: IwParam,
    mode: u32,
    encoding: IwPoint,
    qual: IwQuality,
    ap_addr: SockAddr,
    data: IwPoint,
}

#[repr(C)]
struct IwReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    u: IwReqData,
}

impl IwReq {
    fn new(iface: &str) -> Self {
        let mut req: IwReq = unsafe { mem::zeroed() };
        let name = CString::new(iface).unwrap_or_default();
        let bytes = name.as_bytes_with_nul();
        let len = bytes.len().min(libc::IFNAMSIZ);
        for (dst, &src) in req.ifr_name[..len].iter_mut().zip(bytes) {
            *dst = src as libc::c_char;
        }
        req
    }
}

#[repr(C)]
struct IfReq {
    ifr_name: [libc::c_char; libc::IFNAMSIZ],
    union: IfReqUnion,
}

#[repr(C)]
union IfReqUnion {
    addr_in: SockAddrIn,
    hwaddr: SockAddr,
    flags: libc::c_short,
    mii: MiiIoctlData,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct SockAddrIn {
    sin_family: u16,
    sin_port: u16,
    sin_addr: [u8; 4],
    sin_zero: [u8; 8],
}

/// `struct mii_ioctl_data` (linux/mii.h), mapped directly onto `ifr_ifru`
/// the way `mii-diag`/`ethtool`-style MII probes do for the legacy
/// `SIOCDEVPRIVATE`/`SIOCGMIIPHY` opcodes, rather than through the modern
/// `ifr_data` pointer indirection.
#[repr(C)]
#[derive(Copy, Clone)]
struct MiiIoctlData {
    phy_id: u16,
    reg_num: u16,
    val_in: u16,
    val_out: u16,
    reserved: [u16; 2],
}

impl IfReq {
    fn new(iface: &str) -> Self {
        let mut req: IfReq = unsafe { mem::zeroed() };
        let name = CString::new(iface).unwrap_or_default();
        let bytes = name.as_bytes_with_nul();
        let len = bytes.len().min(libc::IFNAMSIZ);
        for (dst, &src) in req.ifr_name[..len].iter_mut().zip(bytes) {
            *dst = src as libc::c_char;
        }
        req
    }
}

/// Smoothed signal reading produced by [`RadioOps::get_signal_stats`].
#[derive(Copy, Clone, Debug)]
pub struct SignalStats {
    pub percent: Option<u8>,
    pub noise: Option<u8>,
    pub max_quality: u8,
}

/// The primitive operations the Activation Engine and Scan Reconciler drive.
///
/// Every primitive either succeeds or fails with [`Error::Io`]; a driver
/// that silently rejects a command is indistinguishable from one that
/// accepted it, and per the contract both are treated as success.
pub trait RadioOps: Send + Sync {
    fn bring_up(&self) -> Result<()>;
    fn bring_down(&self) -> Result<()>;
    fn is_up(&self) -> Result<bool>;

    fn get_essid(&self) -> Result<Option<String>>;
    fn set_essid(&self, essid: &str) -> Result<()>;

    fn get_mode(&self) -> Result<Mode>;
    fn set_mode(&self, mode: Mode) -> Result<()>;

    fn get_frequency(&self) -> Result<u32>;
    fn set_frequency(&self, freq: u32) -> Result<()>;

    fn get_bitrate(&self) -> Result<u32>;
    fn set_bitrate_auto(&self) -> Result<()>;

    /// Set (or, for an empty key, clear) the encryption key and OR in the
    /// auth-mode-appropriate flag bits. An empty key disables encryption
    /// and sets `disabled | nokey`.
    fn set_encryption_key(&self, key: &[u8], auth: AuthMethod) -> Result<()>;

    fn get_associated_bssid(&self) -> Result<Option<[u8; 6]>>;

    fn get_signal_stats(&self) -> Result<SignalStats>;

    /// MII link probe (wired only): tries opcode `0x8947` first, falls back
    /// to the legacy `SIOCDEVPRIVATE` range; reads MII register 1 twice to
    /// clear sticky bits.
    fn get_mii_link(&self) -> Result<bool>;

    fn get_ip4(&self) -> Result<Option<Ipv4Addr>>;
    fn get_hw_addr(&self) -> Result<[u8; 6]>;

    /// Number of channels the radio's range reports; drives the
    /// association-pause duration choice (>14 ⇒ long pause).
    fn num_channels(&self) -> Result<u32>;

    /// Frequencies the radio claims to support, for ad-hoc channel pick.
    fn supported_frequencies(&self) -> Result<Vec<u32>>;

    /// Start a scan; driver decides cadence/contents.
    fn start_scan(&self) -> Result<()>;

    /// Returns `Some(records)` once results are ready, `None` if the driver
    /// reports "no data yet" (`EAGAIN`).
    fn get_scan_results(&self) -> Result<Option<Vec<ScanRecord>>>;
}

/// One raw scan result as handed back by the driver, before reconciliation.
#[derive(Clone, Debug, Default)]
pub struct ScanRecord {
    pub essid: Option<String>,
    pub bssid: Option<[u8; 6]>,
    pub mode: Option<Mode>,
    pub frequency: u32,
    pub quality: u8,
    pub max_quality: u8,
    pub key_disabled: bool,
}

/// Real Linux implementation, issuing WEXT/standard socket ioctls against a
/// named interface.
pub struct LinuxRadio {
    iface: String,
}

impl LinuxRadio {
    pub fn new(iface: impl Into<String>) -> Self {
        Self { iface: iface.into() }
    }

    fn socket(&self) -> Result<i32> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(Error::last_os_error(self.iface.clone()));
        }
        Ok(fd)
    }

    fn wreq(&self) -> IwReq {
        IwReq::new(&self.iface)
    }

    fn ioctl_iw(&self, fd: i32, request: libc::c_ulong, req: &mut IwReq) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(fd, request as _, req as *mut IwReq) };
        if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    fn ioctl_if(&self, fd: i32, request: libc::c_ulong, req: &mut IfReq) -> io::Result<()> {
        let ret = unsafe { libc::ioctl(fd, request as _, req as *mut IfReq) };
        if ret < 0 { Err(io::Error::last_os_error()) } else { Ok(()) }
    }

    fn close(&self, fd: i32) {
        unsafe {
            libc::close(fd);
        }
    }
}

impl RadioOps for LinuxRadio {
    fn bring_up(&self) -> Result<()> {
        if self.is_up()? {
            return Ok(());
        }
        let fd = self.socket()?;
        let mut req = IfReq::new(&self.iface);
        let current = {
            self.ioctl_if(fd, SIOCGIFFLAGS, &mut req)
                .map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;
            unsafe { req.union.flags }
        };
        req.union.flags = current | IFF_UP;
        let result = self.ioctl_if(fd, SIOCSIFFLAGS, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })
    }

    fn bring_down(&self) -> Result<()> {
        let fd = self.socket()?;
        let mut req = IfReq::new(&self.iface);
        let current = {
            self.ioctl_if(fd, SIOCGIFFLAGS, &mut req)
                .map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;
            unsafe { req.union.flags }
        };
        req.union.flags = current & !IFF_UP;
        let result = self.ioctl_if(fd, SIOCSIFFLAGS, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })
    }

    fn is_up(&self) -> Result<bool> {
        let fd = self.socket()?;
        let mut req = IfReq::new(&self.iface);
        let result = self.ioctl_if(fd, SIOCGIFFLAGS, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;
        Ok(unsafe { req.union.flags } & IFF_UP != 0)
    }

    fn get_essid(&self) -> Result<Option<String>> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        let mut buf = [0u8; 33];
        req.u.essid =
            IwPoint { pointer: buf.as_mut_ptr() as *mut libc::c_void, length: 32, flags: 0 };
        let result = self.ioctl_iw(fd, SIOCGIWESSID, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;

        let len = unsafe { req.u.essid.length } as usize;
        if len == 0 {
            return Ok(None);
        }
        Ok(Some(String::from_utf8_lossy(&buf[..len.min(32)]).into_owned()))
    }

    fn set_essid(&self, essid: &str) -> Result<()> {
        let clamped = crate::ap::clamp_essid(essid);
        let fd = self.socket()?;
        let mut req = self.wreq();
        let mut buf = clamped.as_bytes().to_vec();
        buf.push(0);
        req.u.essid = IwPoint {
            pointer: buf.as_mut_ptr() as *mut libc::c_void,
            length: clamped.len() as u16,
            flags: 1,
        };
        let result = self.ioctl_iw(fd, SIOCSIWESSID, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })
    }

    fn get_mode(&self) -> Result<Mode> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        let result = self.ioctl_iw(fd, SIOCGIWMODE, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;
        Ok(match unsafe { req.u.mode } {
            IW_MODE_ADHOC => Mode::AdHoc,
            IW_MODE_INFRA => Mode::Infrastructure,
            _ => Mode::Unknown,
        })
    }

    fn set_mode(&self, mode: Mode) -> Result<()> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        req.u.mode = match mode {
            Mode::AdHoc => IW_MODE_ADHOC,
            Mode::Infrastructure => IW_MODE_INFRA,
            Mode::Unknown => IW_MODE_AUTO,
        };
        let result = self.ioctl_iw(fd, SIOCSIWMODE, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })
    }

    fn get_frequency(&self) -> Result<u32> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        let result = self.ioctl_iw(fd, SIOCGIWFREQ, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;
        Ok(decode_freq(unsafe { req.u.freq }))
    }

    fn set_frequency(&self, freq: u32) -> Result<()> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        req.u.freq = IwFreq { m: freq as i32, e: 0, i: 0, flags: 0 };
        let result = self.ioctl_iw(fd, SIOCSIWFREQ, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })
    }

    fn get_bitrate(&self) -> Result<u32> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        let result = self.ioctl_iw(fd, SIOCGIWRATE, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;
        Ok(unsafe { req.u.bitrate.value } as u32)
    }

    fn set_bitrate_auto(&self) -> Result<()> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        req.u.bitrate = IwParam { value: -1, fixed: 0, disabled: 0, flags: 0 };
        let result = self.ioctl_iw(fd, SIOCSIWRATE, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })
    }

    fn set_encryption_key(&self, key: &[u8], auth: AuthMethod) -> Result<()> {
        let clamped = crate::ap::clamp_key(key);
        let fd = self.socket()?;
        let mut req = self.wreq();

        let mut buf = clamped.to_vec();
        let flags = if clamped.is_empty() {
            IW_ENCODE_DISABLED | IW_ENCODE_NOKEY
        } else {
            match auth {
                AuthMethod::OpenSystem => IW_ENCODE_OPEN,
                AuthMethod::SharedKey => IW_ENCODE_RESTRICTED,
                // Cards that conflate "open system" with "no WEP" need an
                // explicit mode bit regardless of the nominal auth method.
                AuthMethod::None | AuthMethod::Unknown => IW_ENCODE_OPEN,
            }
        };

        req.u.encoding = IwPoint {
            pointer: buf.as_mut_ptr() as *mut libc::c_void,
            length: clamped.len() as u16,
            flags,
        };
        let result = self.ioctl_iw(fd, SIOCSIWENCODE, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })
    }

    fn get_associated_bssid(&self) -> Result<Option<[u8; 6]>> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        // Correct path: SIOCGIWAP, not a set-opcode on a get-frequency ioctl
        // (see the Open Questions note on the source's copy-paste defect).
        let result = self.ioctl_iw(fd, SIOCGIWAP, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;

        let addr = unsafe { req.u.ap_addr.sa_data };
        let bssid = [addr[0], addr[1], addr[2], addr[3], addr[4], addr[5]];
        let all_zero = bssid.iter().all(|&b| b == 0);
        let all_ones = bssid.iter().all(|&b| b == 0xff);
        Ok((!all_zero && !all_ones).then_some(bssid))
    }

    fn get_signal_stats(&self) -> Result<SignalStats> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        let result = self.ioctl_iw(fd, SIOCGIWSTATS, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;

        let qual = unsafe { req.u.qual };
        let max_quality = 100u8;
        let percent = if qual.updated & 0x1 != 0 {
            Some(((qual.qual as u32 * 100) / max_quality.max(1) as u32) as u8)
        } else {
            None
        };
        Ok(SignalStats { percent, noise: Some(qual.noise), max_quality })
    }

    fn get_mii_link(&self) -> Result<bool> {
        const MII_STATUS_REG: u16 = 1;

        let fd = self.socket()?;
        let mut req = IfReq::new(&self.iface);

        // SIOCGMIIPHY also reports the PHY's id in `phy_id`, which the
        // register read below needs; try the new opcode first, falling back
        // to the legacy SIOCDEVPRIVATE range some drivers still answer.
        let supports_new = self.ioctl_if(fd, SIOCGMIIPHY, &mut req).is_ok();
        let opcode = if supports_new { SIOCGMIIPHY } else { SIOCDEVPRIVATE };

        // Register 1 (status) latches some bits low until read; read it
        // twice and keep the second value so sticky bits reflect the
        // current state rather than a past transition.
        let mut status = 0u16;
        for _ in 0..2 {
            unsafe { req.union.mii.reg_num = MII_STATUS_REG };
            let ret = unsafe { libc::ioctl(fd, opcode as _, &mut req as *mut IfReq) };
            if ret < 0 {
                self.close(fd);
                return Err(Error::last_os_error(self.iface.clone()));
            }
            status = unsafe { req.union.mii.val_out };
        }
        self.close(fd);

        Ok((status & 0x0016) == 0x0004)
    }

    fn get_ip4(&self) -> Result<Option<Ipv4Addr>> {
        let fd = self.socket()?;
        let mut req = IfReq::new(&self.iface);
        let result = self.ioctl_if(fd, SIOCGIFADDR, &mut req);
        self.close(fd);
        match result {
            Ok(()) => {
                let bytes = unsafe { req.union.addr_in.sin_addr };
                Ok(Some(Ipv4Addr::from(bytes)))
            },
            Err(e) if e.raw_os_error() == Some(libc::EADDRNOTAVAIL) => Ok(None),
            Err(e) => Err(Error::Io { iface: self.iface.clone(), source: e }),
        }
    }

    fn get_hw_addr(&self) -> Result<[u8; 6]> {
        let fd = self.socket()?;
        let mut req = IfReq::new(&self.iface);
        let result = self.ioctl_if(fd, SIOCGIFHWADDR, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })?;
        let data = unsafe { req.union.hwaddr.sa_data };
        Ok([data[0], data[1], data[2], data[3], data[4], data[5]])
    }

    fn num_channels(&self) -> Result<u32> {
        // SIOCGIWRANGE's variable-length payload isn't modelled in full;
        // callers needing the real channel table should extend this with an
        // `iwrange` parse. Channel count alone is what the association-pause
        // contract needs, approximated here from the ISM vs U-NII band.
        let freq = self.get_frequency().unwrap_or(2_412_000_000);
        Ok(if freq < 3_000_000_000 { 14 } else { 40 })
    }

    fn supported_frequencies(&self) -> Result<Vec<u32>> {
        Ok((1..=14).map(channel_to_freq_mhz).collect())
    }

    fn start_scan(&self) -> Result<()> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        req.u.data = IwPoint { pointer: ptr::null_mut(), length: 0, flags: 0 };
        let result = self.ioctl_iw(fd, SIOCSIWSCAN, &mut req);
        self.close(fd);
        result.map_err(|e| Error::Io { iface: self.iface.clone(), source: e })
    }

    fn get_scan_results(&self) -> Result<Option<Vec<ScanRecord>>> {
        let fd = self.socket()?;
        let mut req = self.wreq();
        let mut buf = [0u8; IW_SCAN_MAX_DATA];
        req.u.data = IwPoint {
            pointer: buf.as_mut_ptr() as *mut libc::c_void,
            length: buf.len() as u16,
            flags: 0,
        };

        let ret = unsafe { libc::ioctl(fd, SIOCGIWSCAN as _, &mut req as *mut IwReq) };
        let errno = if ret < 0 { io::Error::last_os_error().raw_os_error() } else { None };
        self.close(fd);

        if ret < 0 {
            return match errno {
                Some(EAGAIN) => Ok(None),
                Some(E2BIG) => {
                    warn!(iface = %self.iface, "scan buffer too small, results ready but truncated");
                    Ok(Some(Vec::new()))
                },
                _ => Err(Error::last_os_error(self.iface.clone())),
            };
        }

        let len = unsafe { req.u.data.length } as usize;
        debug!(iface = %self.iface, bytes = len, "scan results ready");
        Ok(Some(parse_scan_events(&buf[..len.min(buf.len())])))
    }
}

fn decode_freq(freq: IwFreq) -> u32 {
    if freq.e == 0 {
        freq.m as u32
    } else {
        let mut value = freq.m as f64;
        for _ in 0..freq.e.unsigned_abs() {
            value *= 10.0;
        }
        (value / 1_000_000.0) as u32
    }
}

fn channel_to_freq_mhz(channel: u32) -> u32 {
    if channel == 14 { 2484 } else { 2407 + channel * 5 }
}

const IWEVQUAL: u16 = 0x8C01;
const SIOCGIWAP_EVENT: u16 = 0x8B15;
const SIOCGIWESSID_EVENT: u16 = 0x8B1B;
const SIOCGIWFREQ_EVENT: u16 = 0x8B05;
const SIOCGIWENCODE_EVENT: u16 = 0x8B2B;

/// Parse a raw `iw_event` stream from `SIOCGIWSCAN` into [`ScanRecord`]s.
fn parse_scan_events(buf: &[u8]) -> Vec<ScanRecord> {
    let mut records = Vec::new();
    let mut current: Option<ScanRecord> = None;
    let mut offset = 0;

    while offset + 4 <= buf.len() {
        let len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        let cmd = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]]);
        if len < 4 || offset + len > buf.len() {
            break;
        }
        let data = &buf[offset + 4..offset + len];

        match cmd {
            SIOCGIWAP_EVENT => {
                if let Some(record) = current.take() {
                    records.push(record);
                }
                let mut record = ScanRecord::default();
                if data.len() >= 8 {
                    record.bssid = Some([data[2], data[3], data[4], data[5], data[6], data[7]]);
                }
                current = Some(record);
            },
            SIOCGIWESSID_EVENT if data.len() >= 8 => {
                let essid_len = u16::from_ne_bytes([data[4], data[5]]) as usize;
                let essid_len = essid_len.min(32);
                if data.len() >= 8 + essid_len {
                    if let Some(record) = current.as_mut() {
                        let raw = &data[8..8 + essid_len];
                        record.essid = Some(String::from_utf8_lossy(raw).into_owned());
                    }
                }
            },
            SIOCGIWFREQ_EVENT if data.len() >= 8 => {
                let freq = IwFreq {
                    m: i32::from_ne_bytes([data[0], data[1], data[2], data[3]]),
                    e: i16::from_ne_bytes([data[4], data[5]]),
                    i: 0,
                    flags: 0,
                };
                if let Some(record) = current.as_mut() {
                    record.frequency = decode_freq(freq);
                }
            },
            IWEVQUAL if data.len() >= 4 => {
                if let Some(record) = current.as_mut() {
                    record.quality = data[0];
                    record.max_quality = 100;
                }
            },
            SIOCGIWENCODE_EVENT if data.len() >= 8 => {
                let flags = u16::from_ne_bytes([data[6], data[7]]);
                if let Some(record) = current.as_mut() {
                    record.key_disabled = flags & IW_ENCODE_DISABLED != 0;
                }
            },
            _ => {},
        }

        offset += len;
    }

    if let Some(record) = current {
        records.push(record);
    }
    records
}

/// Fixed-reply stub used by devices created with the `enable-test-devices`
/// option (§4.1). Every primitive short-circuits to a deterministic value.
pub struct SyntheticRadio {
    up: std::sync::atomic::AtomicBool,
    essid: std::sync::RwLock<Option<String>>,
}

impl Default for SyntheticRadio {
    fn default() -> Self {
        Self {
            up: std::sync::atomic::AtomicBool::new(false),
            essid: std::sync::RwLock::new(None),
        }
    }
}

/// Fixed MAC, IP (`0x07030703`), frequency, bitrate, and signal a synthetic
/// radio reports regardless of what's requested.
pub const SYNTHETIC_MAC: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
pub const SYNTHETIC_IP: Ipv4Addr = Ipv4Addr::new(0x07, 0x03, 0x07, 0x03);
pub const SYNTHETIC_FREQUENCY: u32 = 2_412;
pub const SYNTHETIC_BITRATE: u32 = 11_000_000;
pub const SYNTHETIC_SIGNAL: u8 = 75;

impl RadioOps for SyntheticRadio {
    fn bring_up(&self) -> Result<()> {
        self.up.store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn bring_down(&self) -> Result<()> {
        self.up.store(false, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }

    fn is_up(&self) -> Result<bool> {
        Ok(self.up.load(std::sync::atomic::Ordering::SeqCst))
    }

    fn get_essid(&self) -> Result<Option<String>> {
        Ok(self.essid.read().unwrap().clone())
    }

    fn set_essid(&self, essid: &str) -> Result<()> {
        *self.essid.write().unwrap() = Some(essid.to_string());
        Ok(())
    }

    fn get_mode(&self) -> Result<Mode> {
        Ok(Mode::Infrastructure)
    }

    fn set_mode(&self, _mode: Mode) -> Result<()> {
        Ok(())
    }

    fn get_frequency(&self) -> Result<u32> {
        Ok(SYNTHETIC_FREQUENCY)
    }

    fn set_frequency(&self, _freq: u32) -> Result<()> {
        Ok(())
    }

    fn get_bitrate(&self) -> Result<u32> {
        Ok(SYNTHETIC_BITRATE)
    }

    fn set_bitrate_auto(&self) -> Result<()> {
        Ok(())
    }

    fn set_encryption_key(&self, _key: &[u8], _auth: AuthMethod) -> Result<()> {
        Ok(())
    }

    fn get_associated_bssid(&self) -> Result<Option<[u8; 6]>> {
        Ok(Some(SYNTHETIC_MAC))
    }

    fn get_signal_stats(&self) -> Result<SignalStats> {
        Ok(SignalStats { percent: Some(SYNTHETIC_SIGNAL), noise: Some(0), max_quality: 100 })
    }

    fn get_mii_link(&self) -> Result<bool> {
        Ok(true)
    }

    fn get_ip4(&self) -> Result<Option<Ipv4Addr>> {
        Ok(Some(SYNTHETIC_IP))
    }

    fn get_hw_addr(&self) -> Result<[u8; 6]> {
        Ok(SYNTHETIC_MAC)
    }

    fn num_channels(&self) -> Result<u32> {
        Ok(11)
    }

    fn supported_frequencies(&self) -> Result<Vec<u32>> {
        Ok((1..=11).map(channel_to_freq_mhz).collect())
    }

    fn start_scan(&self) -> Result<()> {
        Ok(())
    }

    fn get_scan_results(&self) -> Result<Option<Vec<ScanRecord>>> {
        Ok(Some(Vec::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mii_link_decision_table() {
        for (status, expect_up) in
            [(0x0004u16, true), (0x0014, true), (0x0024, true), (0x7804, true), (0x0000, false)]
        {
            assert_eq!((status & 0x0016) == 0x0004, expect_up, "status {status:#06x}");
        }
    }

    #[test]
    fn synthetic_radio_reports_fixed_values() {
        let radio = SyntheticRadio::default();
        assert_eq!(radio.get_ip4().unwrap(), Some(SYNTHETIC_IP));
        assert_eq!(radio.get_frequency().unwrap(), SYNTHETIC_FREQUENCY);
        assert_eq!(radio.get_bitrate().unwrap(), SYNTHETIC_BITRATE);
        assert_eq!(radio.get_signal_stats().unwrap().percent, Some(SYNTHETIC_SIGNAL));
    }

    #[test]
    fn synthetic_radio_bring_up_down_roundtrip() {
        let radio = SyntheticRadio::default();
        assert!(!radio.is_up().unwrap());
        radio.bring_up().unwrap();
        assert!(radio.is_up().unwrap());
        radio.bring_down().unwrap();
        assert!(!radio.is_up().unwrap());
    }

    #[test]
    fn empty_key_disables_encryption_flags() {
        // set_encryption_key with an empty key must choose the
        // disabled|nokey path, never an auth-specific flag.
        let flags_for_empty = IW_ENCODE_DISABLED | IW_ENCODE_NOKEY;
        assert_ne!(flags_for_empty & IW_ENCODE_DISABLED, 0);
        assert_ne!(flags_for_empty & IW_ENCODE_NOKEY, 0);
    }

    #[test]
    fn parse_scan_events_extracts_essid_and_bssid() {
        let mut buf = Vec::new();

        // SIOCGIWAP_EVENT: 4-byte header + sockaddr (family + 14 bytes).
        let bssid = [0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF];
        let mut ap_event = vec![0u8; 16];
        ap_event[0..2].copy_from_slice(&(16u16).to_ne_bytes());
        ap_event[2..4].copy_from_slice(&SIOCGIWAP_EVENT.to_ne_bytes());
        ap_event[6..12].copy_from_slice(&bssid);
        buf.extend_from_slice(&ap_event);

        // SIOCGIWESSID_EVENT: header + iw_point (pointer-sized skip via u32
        // placeholder) + essid bytes; simplified to the 8-byte point header
        // used by the parser above (pointer omitted on the wire in a real
        // dump, but the parser only reads the length + payload offset).
        let essid = b"testnet";
        let mut essid_event = vec![0u8; 12 + essid.len()];
        let total_len = essid_event.len() as u16;
        essid_event[0..2].copy_from_slice(&total_len.to_ne_bytes());
        essid_event[2..4].copy_from_slice(&SIOCGIWESSID_EVENT.to_ne_bytes());
        essid_event[8..10].copy_from_slice(&(essid.len() as u16).to_ne_bytes());
        essid_event[12..12 + essid.len()].copy_from_slice(essid);
        buf.extend_from_slice(&essid_event);

        let records = parse_scan_events(&buf);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].bssid, Some(bssid));
        assert_eq!(records[0].essid.as_deref(), Some("testnet"));
    }
}
