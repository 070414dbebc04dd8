//! Access-point records and the AP Store (device-local and process-wide
//! lists of visible/allowed/invalid networks).

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tracing::trace;

/// Wireless topology an [`AccessPoint`] or device operates in.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum Mode {
    #[default]
    Infrastructure,
    AdHoc,
    Unknown,
}

/// Encoding of an AP's stored key material.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum KeyType {
    #[default]
    Unknown,
    Hex,
    Ascii,
    Passphrase128,
}

/// Authentication method currently in use (or last attempted) for an AP.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub enum AuthMethod {
    #[default]
    Unknown,
    None,
    OpenSystem,
    SharedKey,
}

/// Mutable flag bundle carried by every [`AccessPoint`].
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct ApFlags {
    /// The AP failed activation and must not be selected again until
    /// explicitly cleared.
    pub invalid: bool,
    /// Preserved across a scan where the AP was not observed, because the
    /// card is currently associated with it.
    pub artificial: bool,
    /// Asserted into existence by the user (ad-hoc creation), not observed.
    pub user_created: bool,
    /// Present in the Allowed list.
    pub trusted: bool,
}

/// A 32-byte-capped ESSID and 64-byte-capped key, per the wireless-extension
/// contract (`IW_ESSID_MAX_SIZE`, `IW_ENCODING_TOKEN_MAX`).
pub const IW_ESSID_MAX_SIZE: usize = 32;
pub const IW_ENCODING_TOKEN_MAX: usize = 64;

/// A single observed or administrator-known wireless network.
///
/// Reference-counted: accessors on [`ApList`] return `Arc<AccessPoint>` and
/// the handle may outlive the list that produced it. Fields that the engine
/// mutates after construction (key material, timestamp, trusted flag) live
/// behind their own `RwLock` so a shared handle can be updated in place.
pub struct AccessPoint {
    essid: RwLock<Option<String>>,
    bssid: Option<[u8; 6]>,
    mode: RwLock<Mode>,
    frequency: RwLock<u32>,
    strength: RwLock<u8>,
    encrypted: RwLock<bool>,
    key: RwLock<Option<Vec<u8>>>,
    key_type: RwLock<KeyType>,
    auth: RwLock<AuthMethod>,
    flags: RwLock<ApFlags>,
    last_seen: RwLock<Instant>,
}

impl fmt::Debug for AccessPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessPoint")
            .field("essid", &self.essid())
            .field("bssid", &self.bssid.map(format_bssid))
            .field("encrypted", &self.encrypted())
            .field("flags", &self.flags())
            .finish()
    }
}

impl AccessPoint {
    /// Construct a new AP record. Enforces the invariant that an
    /// unencrypted AP carries no key material.
    pub fn new(essid: Option<String>, bssid: Option<[u8; 6]>) -> Arc<Self> {
        debug_assert!(
            essid.as_deref().is_some_and(|s| !s.is_empty()) || bssid.is_some(),
            "an AP with empty ESSID must have a non-zero BSSID"
        );
        Arc::new(Self {
            essid: RwLock::new(essid),
            bssid,
            mode: RwLock::new(Mode::Infrastructure),
            frequency: RwLock::new(0),
            strength: RwLock::new(0),
            encrypted: RwLock::new(false),
            key: RwLock::new(None),
            key_type: RwLock::new(KeyType::Unknown),
            auth: RwLock::new(AuthMethod::Unknown),
            flags: RwLock::new(ApFlags::default()),
            last_seen: RwLock::new(Instant::now()),
        })
    }

    pub fn essid(&self) -> Option<String> {
        self.essid.read().unwrap().clone()
    }

    pub fn set_essid(&self, essid: Option<String>) {
        *self.essid.write().unwrap() = essid;
    }

    pub fn bssid(&self) -> Option<[u8; 6]> {
        self.bssid
    }

    /// Identity key used for set semantics: by BSSID when present, else by
    /// ESSID.
    pub fn identity(&self) -> ApIdentity {
        match self.bssid {
            Some(bssid) => ApIdentity::Bssid(bssid),
            None => ApIdentity::Essid(self.essid().unwrap_or_default()),
        }
    }

    pub fn mode(&self) -> Mode {
        *self.mode.read().unwrap()
    }

    pub fn set_mode(&self, mode: Mode) {
        *self.mode.write().unwrap() = mode;
    }

    pub fn frequency(&self) -> u32 {
        *self.frequency.read().unwrap()
    }

    pub fn set_frequency(&self, frequency: u32) {
        *self.frequency.write().unwrap() = frequency;
    }

    pub fn strength(&self) -> u8 {
        *self.strength.read().unwrap()
    }

    pub fn set_strength(&self, strength: u8) {
        *self.strength.write().unwrap() = strength.min(100);
    }

    pub fn encrypted(&self) -> bool {
        *self.encrypted.read().unwrap()
    }

    pub fn key(&self) -> Option<Vec<u8>> {
        self.key.read().unwrap().clone()
    }

    pub fn key_type(&self) -> KeyType {
        *self.key_type.read().unwrap()
    }

    /// Set encryption state and key material together, keeping the
    /// no-key-when-unencrypted invariant intact.
    ///
    /// An empty key disables encryption, mirroring the radio-level contract
    /// in `radio::set_encryption_key`.
    pub fn set_key(&self, key: Option<Vec<u8>>, key_type: KeyType) {
        let encrypted = key.as_ref().is_some_and(|k| !k.is_empty());
        *self.encrypted.write().unwrap() = encrypted;
        *self.key_type.write().unwrap() = if encrypted { key_type } else { KeyType::Unknown };
        *self.key.write().unwrap() = if encrypted { key } else { None };
    }

    /// Mark the AP as encrypted with no key material known yet (observed via
    /// scan, as opposed to [`AccessPoint::set_key`] which installs a key).
    pub fn mark_encrypted(&self, encrypted: bool) {
        *self.encrypted.write().unwrap() = encrypted;
        if !encrypted {
            *self.key.write().unwrap() = None;
            *self.key_type.write().unwrap() = KeyType::Unknown;
        }
    }

    pub fn auth(&self) -> AuthMethod {
        *self.auth.read().unwrap()
    }

    pub fn set_auth(&self, auth: AuthMethod) {
        *self.auth.write().unwrap() = auth;
    }

    pub fn flags(&self) -> ApFlags {
        *self.flags.read().unwrap()
    }

    pub fn set_invalid(&self, invalid: bool) {
        self.flags.write().unwrap().invalid = invalid;
    }

    pub fn set_artificial(&self, artificial: bool) {
        self.flags.write().unwrap().artificial = artificial;
    }

    pub fn set_user_created(&self, user_created: bool) {
        self.flags.write().unwrap().user_created = user_created;
    }

    pub fn set_trusted(&self, trusted: bool) {
        self.flags.write().unwrap().trusted = trusted;
    }

    pub fn last_seen(&self) -> Instant {
        *self.last_seen.read().unwrap()
    }

    pub fn touch(&self) {
        *self.last_seen.write().unwrap() = Instant::now();
    }

    /// Copy key material, timestamp, and trusted flag from `src` into
    /// `self`, used by [`ApList::copy_properties`].
    fn adopt_properties(&self, src: &AccessPoint) {
        *self.key.write().unwrap() = src.key();
        *self.key_type.write().unwrap() = src.key_type();
        *self.last_seen.write().unwrap() = src.last_seen();
        self.flags.write().unwrap().trusted = src.flags().trusted;
    }
}

fn format_bssid(bssid: [u8; 6]) -> String {
    bssid.iter().map(|b| format!("{b:02x}")).collect::<Vec<_>>().join(":")
}

/// Set-membership key for an [`AccessPoint`].
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub enum ApIdentity {
    Bssid([u8; 6]),
    Essid(String),
}

/// Which role a given [`ApList`] plays; governs its lifecycle policy.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ApListKind {
    /// One device's most recent scan/derived visible list.
    DeviceScan,
    /// Process-wide administrator-allowed networks.
    Allowed,
    /// Process-wide networks that failed activation this cycle. Grows
    /// monotonically until explicitly cleared.
    Invalid,
}

/// A set of [`AccessPoint`] with ESSID and BSSID lookup indices.
///
/// Duplicates collapse at insertion: matching BSSIDs merge preferring the
/// newer timestamp; matching ESSIDs with no BSSID on either side merge in
/// place. Iteration yields a stable snapshot — callers hold `Arc` clones, so
/// concurrent mutation of the list is never observed mid-iteration.
pub struct ApList {
    kind: ApListKind,
    by_bssid: HashMap<[u8; 6], Arc<AccessPoint>>,
    by_essid: HashMap<String, Arc<AccessPoint>>,
}

impl ApList {
    pub fn new(kind: ApListKind) -> Self {
        Self { kind, by_bssid: HashMap::new(), by_essid: HashMap::new() }
    }

    pub fn kind(&self) -> ApListKind {
        self.kind
    }

    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.by_bssid.is_empty() && self.by_essid.is_empty()
    }

    /// Stable snapshot of every AP currently in the list, deduplicated by
    /// identity (an AP indexed by both BSSID and ESSID is yielded once).
    pub fn iter(&self) -> impl Iterator<Item = Arc<AccessPoint>> + '_ {
        let mut seen = std::collections::HashSet::new();
        self.by_bssid
            .values()
            .chain(self.by_essid.values())
            .filter(move |ap| seen.insert(Arc::as_ptr(ap) as usize))
            .cloned()
    }

    pub fn get_by_essid(&self, essid: &str) -> Option<Arc<AccessPoint>> {
        if let Some(ap) = self.by_essid.get(essid) {
            return Some(ap.clone());
        }
        self.by_bssid.values().find(|ap| ap.essid().as_deref() == Some(essid)).cloned()
    }

    pub fn get_by_bssid(&self, bssid: [u8; 6]) -> Option<Arc<AccessPoint>> {
        self.by_bssid.get(&bssid).cloned()
    }

    /// Insert `ap`, merging with any existing entry of the same identity.
    ///
    /// If both BSSIDs match, the newer (by `last_seen`) entry wins and is
    /// re-indexed in place; if only ESSIDs match and neither side has a
    /// BSSID, the existing record absorbs the new one's properties.
    pub fn append(&mut self, ap: Arc<AccessPoint>) {
        if let Some(bssid) = ap.bssid() {
            match self.by_bssid.get(&bssid) {
                Some(existing) if existing.last_seen() >= ap.last_seen() => {
                    trace!(bssid = %format_bssid(bssid), "keeping newer existing AP on append");
                },
                _ => {
                    if let Some(essid) = ap.essid().filter(|e| !e.is_empty()) {
                        self.by_essid.insert(essid, ap.clone());
                    }
                    self.by_bssid.insert(bssid, ap);
                },
            }
            return;
        }

        let essid = ap.essid().unwrap_or_default();
        match self.by_essid.get(&essid) {
            Some(existing) if existing.bssid().is_none() => {
                existing.adopt_properties(&ap);
            },
            _ => {
                self.by_essid.insert(essid, ap);
            },
        }
    }

    pub fn remove(&mut self, identity: &ApIdentity) {
        match identity {
            ApIdentity::Bssid(bssid) => {
                if let Some(ap) = self.by_bssid.remove(bssid) {
                    if let Some(essid) = ap.essid() {
                        self.by_essid.remove(&essid);
                    }
                }
            },
            ApIdentity::Essid(essid) => {
                self.by_essid.remove(essid);
            },
        }
    }

    pub fn clear(&mut self) {
        self.by_bssid.clear();
        self.by_essid.clear();
    }

    /// Diff two snapshots by identity: returns `(added, removed)` relative
    /// to going from `a` to `b`.
    pub fn diff(a: &ApList, b: &ApList) -> (Vec<Arc<AccessPoint>>, Vec<Arc<AccessPoint>>) {
        let a_ids: HashMap<ApIdentity, Arc<AccessPoint>> =
            a.iter().map(|ap| (ap.identity(), ap)).collect();
        let b_ids: HashMap<ApIdentity, Arc<AccessPoint>> =
            b.iter().map(|ap| (ap.identity(), ap)).collect();

        let added = b_ids
            .iter()
            .filter(|(id, _)| !a_ids.contains_key(*id))
            .map(|(_, ap)| ap.clone())
            .collect();
        let removed = a_ids
            .iter()
            .filter(|(id, _)| !b_ids.contains_key(*id))
            .map(|(_, ap)| ap.clone())
            .collect();

        (added, removed)
    }

    /// Union of `a` and `b`, newest-timestamp-wins on identity collision.
    pub fn combine(a: &ApList, b: &ApList, kind: ApListKind) -> ApList {
        let mut combined = ApList::new(kind);
        for ap in a.iter().chain(b.iter()) {
            combined.append(ap);
        }
        combined
    }

    /// Copy key material, timestamps, and the trusted flag from `src` into
    /// entries of `self` with a matching ESSID.
    pub fn copy_properties(&mut self, src: &ApList) {
        for ap in self.iter() {
            let Some(essid) = ap.essid() else { continue };
            if let Some(src_ap) = src.get_by_essid(&essid) {
                ap.adopt_properties(&src_ap);
            }
        }
    }

    /// Fill in blank ESSIDs in `self` when the BSSID matches an entry in
    /// `src`, recovering known names for cloaking APs.
    pub fn copy_essids_by_address(&mut self, src: &ApList) {
        let blanks: Vec<_> =
            self.iter().filter(|ap| ap.essid().is_none_or(|e| e.is_empty())).collect();
        for ap in blanks {
            let Some(bssid) = ap.bssid() else { continue };
            if let Some(src_ap) = src.get_by_bssid(bssid) {
                if let Some(essid) = src_ap.essid().filter(|e| !e.is_empty()) {
                    ap.set_essid(Some(essid.clone()));
                    self.by_essid.insert(essid, ap.clone());
                }
            }
        }
    }
}

/// Caps key length to the wireless-extension's `IW_ENCODING_TOKEN_MAX`.
pub fn clamp_key(key: &[u8]) -> &[u8] {
    &key[..key.len().min(IW_ENCODING_TOKEN_MAX)]
}

/// Caps an ESSID to the wireless-extension's `IW_ESSID_MAX_SIZE`.
pub fn clamp_essid(essid: &str) -> &str {
    let mut end = essid.len().min(IW_ESSID_MAX_SIZE);
    while end > 0 && !essid.is_char_boundary(end) {
        end -= 1;
    }
    &essid[..end]
}

/// Sentinel grace period used by the Scan Reconciler's four-scan diff
/// horizon; not a hard timeout, just documentation of intent.
pub const SCAN_DIFF_HORIZON: Duration = Duration::from_secs(40);

#[cfg(test)]
mod tests {
    use super::*;

    fn bssid(n: u8) -> [u8; 6] {
        [0, 0, 0, 0, 0, n]
    }

    #[test]
    fn get_by_essid_returns_ap_iff_present() {
        let mut list = ApList::new(ApListKind::DeviceScan);
        assert!(list.get_by_essid("home").is_none());

        list.append(AccessPoint::new(Some("home".into()), Some(bssid(1))));
        assert!(list.get_by_essid("home").is_some());
        assert!(list.get_by_essid("office").is_none());
    }

    #[test]
    fn append_merges_matching_bssid_preferring_newer_timestamp() {
        let mut list = ApList::new(ApListKind::DeviceScan);
        let old = AccessPoint::new(Some("home".into()), Some(bssid(1)));
        old.set_strength(10);
        list.append(old.clone());

        std::thread::sleep(Duration::from_millis(2));
        let newer = AccessPoint::new(Some("home".into()), Some(bssid(1)));
        newer.set_strength(90);
        list.append(newer.clone());

        let found = list.get_by_bssid(bssid(1)).unwrap();
        assert_eq!(found.strength(), 90);
    }

    #[test]
    fn diff_is_symmetric_and_empty_for_combined_lists() {
        let mut a = ApList::new(ApListKind::DeviceScan);
        a.append(AccessPoint::new(Some("a".into()), Some(bssid(1))));
        let mut b = ApList::new(ApListKind::DeviceScan);
        b.append(AccessPoint::new(Some("b".into()), Some(bssid(2))));

        let combine_ab = ApList::combine(&a, &b, ApListKind::DeviceScan);
        let combine_ba = ApList::combine(&b, &a, ApListKind::DeviceScan);

        let (added, removed) = ApList::diff(&combine_ab, &combine_ba);
        assert!(added.is_empty());
        assert!(removed.is_empty());
    }

    #[test]
    fn copy_essids_by_address_recovers_cloaked_names() {
        let mut scan = ApList::new(ApListKind::DeviceScan);
        scan.append(AccessPoint::new(None, Some(bssid(5))));

        let mut allowed = ApList::new(ApListKind::Allowed);
        allowed.append(AccessPoint::new(Some("hidden".into()), Some(bssid(5))));

        scan.copy_essids_by_address(&allowed);

        let recovered = scan.get_by_bssid(bssid(5)).unwrap();
        assert_eq!(recovered.essid().as_deref(), Some("hidden"));
    }

    #[test]
    fn unencrypted_ap_carries_no_key_material() {
        let ap = AccessPoint::new(Some("open".into()), Some(bssid(9)));
        ap.set_key(Some(b"irrelevant".to_vec()), KeyType::Ascii);
        ap.set_key(Some(Vec::new()), KeyType::Ascii);
        assert!(!ap.encrypted());
        assert!(ap.key().is_none());
    }

    #[test]
    fn clamp_essid_respects_32_byte_cap() {
        let long = "x".repeat(64);
        assert_eq!(clamp_essid(&long).len(), IW_ESSID_MAX_SIZE);
    }

    #[test]
    fn clamp_key_respects_64_byte_cap() {
        let long = vec![0u8; 200];
        assert_eq!(clamp_key(&long).len(), IW_ENCODING_TOKEN_MAX);
    }
}
