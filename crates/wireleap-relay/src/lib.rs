#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![allow(renamed_and_removed_lints)]
#![allow(unknown_lints)]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
#![allow(clippy::needless_lifetimes)]

mod info;

pub use info::{ContractInfo, DirectoryInfo, DirectoryRef, ServicekeyInfo, UpgradeChannels};

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;
use wireleap_crypto::ed25519::Pubkey;

/// The position a relay is willing to take in a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum RelayRole {
    /// An entry relay: the hop the client connects to directly.
    Fronting,
    /// A middle relay, used to add path entropy on circuits of 3+ hops.
    Entropic,
    /// An exit relay: the hop that dials the final target.
    Backing,
}

/// The protocol versions a relay advertises.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RelayVersions {
    /// Version of the client-relay protocol this relay speaks, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_relay: Option<semver::Version>,
}

/// A single relay as described by the contract directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayEntry {
    /// The address the relay listens on, as a `wireleap://host:port` URL.
    pub addr: Url,
    /// The relay's identity key.
    pub pubkey: Pubkey,
    /// The circuit role this relay takes.
    pub role: RelayRole,
    /// Advertised protocol versions.
    #[serde(default)]
    pub versions: RelayVersions,
}

impl RelayEntry {
    /// Return true if this relay speaks a client-relay protocol we are
    /// compatible with.
    ///
    /// Compatibility is defined as an exact minor-version match; relays
    /// with no advertised version are never eligible.
    pub fn is_eligible(&self, local: &semver::Version) -> bool {
        match &self.versions.client_relay {
            Some(v) => v.minor == local.minor,
            None => false,
        }
    }

    /// Return the hostname part of this relay's address, if there is one.
    pub fn hostname(&self) -> Option<&str> {
        self.addr.host_str()
    }
}

/// A relay directory, keyed by relay address.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelayList(BTreeMap<String, RelayEntry>);

impl RelayList {
    /// Build a relay list from an iterator of entries.
    pub fn from_entries<I: IntoIterator<Item = RelayEntry>>(entries: I) -> Self {
        RelayList(
            entries
                .into_iter()
                .map(|r| (r.addr.to_string(), r))
                .collect(),
        )
    }

    /// Return every relay in the directory, in directory order.
    pub fn all(&self) -> Vec<RelayEntry> {
        self.0.values().cloned().collect()
    }

    /// Look up a relay by its address string.
    pub fn get(&self, addr: &str) -> Option<&RelayEntry> {
        self.0.get(addr)
    }

    /// Return the number of relays in the directory.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Return true if the directory has no relays.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Relays grouped by circuit role.
///
/// Produced by [`partition`]; relays whose protocol version we cannot speak
/// are dropped here, so circuit construction never has to re-check
/// eligibility.
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct Partitioned {
    /// Eligible fronting relays.
    pub fronting: Vec<RelayEntry>,
    /// Eligible entropic relays.
    pub entropic: Vec<RelayEntry>,
    /// Eligible backing relays.
    pub backing: Vec<RelayEntry>,
}

/// Partition `relays` into role groups, dropping relays that do not speak
/// our client-relay protocol version.
pub fn partition<I: IntoIterator<Item = RelayEntry>>(
    relays: I,
    local: &semver::Version,
) -> Partitioned {
    let mut p = Partitioned::default();
    for r in relays {
        if !r.is_eligible(local) {
            continue;
        }
        match r.role {
            RelayRole::Fronting => p.fronting.push(r),
            RelayRole::Entropic => p.entropic.push(r),
            RelayRole::Backing => p.backing.push(r),
        }
    }
    p
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::useless_vec)]
    use super::*;
    use wireleap_crypto::ed25519::gen_keypair;

    /// Construct a relay entry for testing.
    pub(crate) fn entry(addr: &str, role: RelayRole, minor: u64) -> RelayEntry {
        RelayEntry {
            addr: format!("wireleap://{}", addr).parse().unwrap(),
            pubkey: gen_keypair().verifying_key().into(),
            role,
            versions: RelayVersions {
                client_relay: Some(semver::Version::new(0, minor, 0)),
            },
        }
    }

    #[test]
    fn partition_by_role() {
        let local = semver::Version::new(0, 8, 0);
        let relays = vec![
            entry("f1:13490", RelayRole::Fronting, 8),
            entry("e1:13490", RelayRole::Entropic, 8),
            entry("e2:13490", RelayRole::Entropic, 8),
            entry("b1:13490", RelayRole::Backing, 8),
        ];
        let p = partition(relays, &local);
        assert_eq!(p.fronting.len(), 1);
        assert_eq!(p.entropic.len(), 2);
        assert_eq!(p.backing.len(), 1);
    }

    #[test]
    fn partition_drops_version_mismatch() {
        let local = semver::Version::new(0, 8, 0);
        let mut stale = entry("b2:13490", RelayRole::Backing, 7);
        let p = partition(vec![stale.clone()], &local);
        assert!(p.backing.is_empty());

        // No advertised version at all: also dropped.
        stale.versions.client_relay = None;
        let p = partition(vec![stale], &local);
        assert!(p.backing.is_empty());
    }

    #[test]
    fn relaylist_round_trip() {
        let rl = RelayList::from_entries(vec![
            entry("a:1", RelayRole::Backing, 8),
            entry("b:2", RelayRole::Fronting, 8),
        ]);
        let json = serde_json::to_string(&rl).unwrap();
        let rl2: RelayList = serde_json::from_str(&json).unwrap();
        assert_eq!(rl, rl2);
        assert!(rl2.get("wireleap://a:1").is_some());
        assert_eq!(rl2.all().len(), 2);
    }
}
