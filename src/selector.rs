//! C4: Best-AP Selector — computes the preferred AP from a device's visible
//! list plus the process-wide Allowed/Invalid lists, honouring a frozen
//! selection made via directed ESSID selection (§4.6).

use std::sync::Arc;

use tracing::{debug, info};

use crate::ap::{AccessPoint, ApList, AuthMethod};
use crate::device::Device;
use crate::radio::RadioOps;

/// Recompute and install the best AP for `device`. Returns `true` if the
/// best-AP handle changed (a new selection, or a transition to/from null).
pub fn recompute(device: &Device, radio: &dyn RadioOps) -> bool {
    let wireless = device.wireless().expect("recompute only called for wireless devices");

    if wireless.is_frozen() {
        if let Some(frozen) = wireless.best_ap() {
            let invalid = device.invalid.read().unwrap();
            let still_eligible = frozen.flags().user_created
                || (is_visible(&wireless.visible.read().unwrap(), &frozen)
                    && invalid.get_by_essid(&frozen.essid().unwrap_or_default()).is_none());
            if still_eligible {
                debug!(iface = %device.iface, "keeping frozen best AP");
                return false;
            }
        }
    }

    let visible = wireless.visible.read().unwrap();
    let invalid = device.invalid.read().unwrap();
    let allowed = device.allowed.read().unwrap();

    let mut best_trusted: Option<Arc<AccessPoint>> = None;
    let mut best_untrusted: Option<Arc<AccessPoint>> = None;

    for ap in visible.iter() {
        let Some(essid) = ap.essid() else { continue };
        if invalid.get_by_essid(&essid).is_some() {
            continue;
        }
        let Some(allowed_ap) = allowed.get_by_essid(&essid) else { continue };

        ap.set_key(allowed_ap.key(), allowed_ap.key_type());

        let trusted = allowed_ap.flags().trusted;
        let slot = if trusted { &mut best_trusted } else { &mut best_untrusted };
        let replace = match slot {
            None => true,
            Some(current) => ap.last_seen() > current.last_seen(),
        };
        if replace {
            ap.set_trusted(trusted);
            *slot = Some(ap.clone());
        }
    }

    let best = best_trusted.or(best_untrusted);
    drop(visible);
    drop(invalid);
    drop(allowed);

    let previous_identity = wireless.best_ap().map(|ap| ap.identity());
    let new_identity = best.as_ref().map(|ap| ap.identity());
    let changed = previous_identity != new_identity;

    if changed {
        info!(iface = %device.iface, essid = ?best.as_ref().and_then(|ap| ap.essid()), "best AP changed");
        wireless.set_best_ap(best.clone(), false);

        if best.is_none() {
            let _ = radio.set_essid(" ");
            let _ = radio.set_encryption_key(&[], AuthMethod::None);
            let _ = radio.bring_up();
        }
    }

    changed
}

fn is_visible(visible: &ApList, ap: &AccessPoint) -> bool {
    visible.iter().any(|candidate| candidate.identity() == ap.identity())
}

/// Explicitly freeze `ap` as the best selection, per §4.6's directed ESSID
/// flow.
pub fn freeze(device: &Device, ap: Arc<AccessPoint>) {
    let wireless = device.wireless().expect("freeze only called for wireless devices");
    wireless.set_best_ap(Some(ap), true);
}

#[cfg(test)]
mod tests {
    use std::sync::RwLock;

    use super::*;
    use crate::ap::ApListKind;
    use crate::device::{DeviceKind, DriverSupport};
    use crate::radio::SyntheticRadio;

    fn device_with_visible(aps: Vec<Arc<AccessPoint>>) -> Arc<Device> {
        let allowed = Arc::new(RwLock::new(ApList::new(ApListKind::Allowed)));
        let invalid = Arc::new(RwLock::new(ApList::new(ApListKind::Invalid)));
        let device = Device::new(
            "/devices/0",
            "wlan0",
            DeviceKind::Wireless,
            DriverSupport::FullySupported,
            allowed,
            invalid,
        );
        let mut visible = ApList::new(ApListKind::DeviceScan);
        for ap in aps {
            visible.append(ap);
        }
        *device.wireless().unwrap().visible.write().unwrap() = visible;
        device
    }

    #[test]
    fn prefers_trusted_over_untrusted() {
        let trusted_ap = AccessPoint::new(Some("trusted".into()), Some([0, 0, 0, 0, 0, 1]));
        let untrusted_ap = AccessPoint::new(Some("untrusted".into()), Some([0, 0, 0, 0, 0, 2]));
        let device = device_with_visible(vec![trusted_ap.clone(), untrusted_ap.clone()]);

        {
            let mut allowed = device.allowed.write().unwrap();
            let trusted_allowed =
                AccessPoint::new(Some("trusted".into()), Some([0, 0, 0, 0, 0, 1]));
            trusted_allowed.set_trusted(true);
            allowed.append(trusted_allowed);
            let untrusted_allowed =
                AccessPoint::new(Some("untrusted".into()), Some([0, 0, 0, 0, 0, 2]));
            allowed.append(untrusted_allowed);
        }

        let radio = SyntheticRadio::default();
        assert!(recompute(&device, &radio));

        let best = device.wireless().unwrap().best_ap().unwrap();
        assert_eq!(best.essid().as_deref(), Some("trusted"));
    }

    #[test]
    fn skips_invalid_aps() {
        let ap = AccessPoint::new(Some("bad".into()), Some([0, 0, 0, 0, 0, 3]));
        let device = device_with_visible(vec![ap]);

        {
            let mut allowed = device.allowed.write().unwrap();
            allowed.append(AccessPoint::new(Some("bad".into()), Some([0, 0, 0, 0, 0, 3])));
        }
        {
            let mut invalid = device.invalid.write().unwrap();
            invalid.append(AccessPoint::new(Some("bad".into()), None));
        }

        let radio = SyntheticRadio::default();
        recompute(&device, &radio);
        assert!(device.wireless().unwrap().best_ap().is_none());
    }

    #[test]
    fn null_result_clears_radio_essid_and_brings_up() {
        let device = device_with_visible(vec![]);
        let radio = SyntheticRadio::default();
        radio.set_essid("stale").unwrap();
        // `SyntheticRadio::set_encryption_key` is a no-op stub; this only
        // confirms the null-result path calls it alongside the ESSID clear
        // without erroring, not that key state actually cleared.
        radio.set_encryption_key(&[1, 2, 3, 4], AuthMethod::SharedKey).unwrap();

        recompute(&device, &radio);

        assert!(device.wireless().unwrap().best_ap().is_none());
        assert!(radio.is_up().unwrap());
        assert_eq!(radio.get_essid().unwrap(), Some(" ".to_string()));
    }

    #[test]
    fn frozen_user_created_ap_survives_even_when_not_visible() {
        let device = device_with_visible(vec![]);
        let adhoc = AccessPoint::new(Some("adhoc".into()), Some([1, 1, 1, 1, 1, 1]));
        adhoc.set_user_created(true);
        freeze(&device, adhoc.clone());

        let radio = SyntheticRadio::default();
        let changed = recompute(&device, &radio);

        assert!(!changed);
        assert_eq!(device.wireless().unwrap().best_ap().unwrap().essid().as_deref(), Some("adhoc"));
    }
}
