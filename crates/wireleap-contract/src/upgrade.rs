//! Client upgrade-channel handling.

use semver::Version;
use wireleap_relay::DirectoryInfo;

/// Outcome of comparing our version against the directory's channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeStatus {
    /// We are current (or the directory said nothing).
    Current,
    /// A newer version exists, but the operator has recorded a skip for
    /// exactly that version; keep running with a warning.
    Skipped(Version),
    /// A newer version exists and no skip covers it; the operator must
    /// upgrade.
    Required(Version),
}

/// Check the directory's upgrade channel for our channel name.
///
/// `skipped` is the persisted skip marker, if any: the version of a
/// previously failed or declined upgrade.
pub fn check_upgrade(
    di: &DirectoryInfo,
    channel: &str,
    current: &Version,
    skipped: Option<&Version>,
) -> UpgradeStatus {
    match di.upgrade_channels.client.get(channel) {
        Some(v) if v > current => match skipped {
            Some(s) if s == v => UpgradeStatus::Skipped(v.clone()),
            _ => UpgradeStatus::Required(v.clone()),
        },
        _ => UpgradeStatus::Current,
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    /// Directory info advertising `v` on the default channel.
    fn dir_with(v: &str) -> DirectoryInfo {
        serde_json::from_str(&format!(
            r#"{{
                "endpoint": "https://dir.example.com",
                "upgrade_channels": {{ "client": {{ "default": "{}" }} }}
            }}"#,
            v
        ))
        .unwrap()
    }

    #[test]
    fn current_when_equal_or_older() {
        let cur = Version::new(0, 8, 0);
        assert_eq!(
            check_upgrade(&dir_with("0.8.0"), "default", &cur, None),
            UpgradeStatus::Current
        );
        assert_eq!(
            check_upgrade(&dir_with("0.7.3"), "default", &cur, None),
            UpgradeStatus::Current
        );
    }

    #[test]
    fn required_when_newer() {
        let cur = Version::new(0, 8, 0);
        assert_eq!(
            check_upgrade(&dir_with("0.9.0"), "default", &cur, None),
            UpgradeStatus::Required(Version::new(0, 9, 0))
        );
    }

    #[test]
    fn skip_marker_downgrades_to_warning() {
        let cur = Version::new(0, 8, 0);
        let skip = Version::new(0, 9, 0);
        assert_eq!(
            check_upgrade(&dir_with("0.9.0"), "default", &cur, Some(&skip)),
            UpgradeStatus::Skipped(skip.clone())
        );
        // A skip for a different version does not help.
        assert_eq!(
            check_upgrade(&dir_with("0.9.1"), "default", &cur, Some(&skip)),
            UpgradeStatus::Required(Version::new(0, 9, 1))
        );
    }

    #[test]
    fn unknown_channel_is_current() {
        let cur = Version::new(0, 8, 0);
        assert_eq!(
            check_upgrade(&dir_with("0.9.0"), "nightly", &cur, None),
            UpgradeStatus::Current
        );
    }
}
