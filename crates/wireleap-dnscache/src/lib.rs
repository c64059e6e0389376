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

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use tokio::net::lookup_host;
use tokio::sync::Mutex;

/// An error from a cache operation.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The system resolver failed.
    #[error("could not resolve {host}")]
    Lookup {
        /// The hostname we tried to resolve.
        host: String,
        /// The underlying resolver error.
        #[source]
        source: std::io::Error,
    },
    /// Resolution succeeded but produced no addresses.
    #[error("no addresses resolved for {host}")]
    NoAddrs {
        /// The hostname we tried to resolve.
        host: String,
    },
}

/// A snapshot-then-rotate DNS cache.
///
/// The first resolution of a hostname is remembered; later covered dials
/// rotate through the remembered list round-robin instead of re-resolving.
/// [`DnsCache::get`] exposes the snapshot so bypass routes can be derived
/// from exactly the addresses dials will use.
///
/// The single mutex is held across the resolver call in
/// [`covered_lookup`](DnsCache::covered_lookup); concurrent dials usually
/// target distinct hosts, so contention is not a concern here.
#[derive(Debug, Clone, Default)]
pub struct DnsCache {
    /// hostname → resolved addresses, head is the next address to use.
    cache: Arc<Mutex<HashMap<String, Vec<IpAddr>>>>,
}

impl DnsCache {
    /// Create a new, empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve `host` and store the address list, overwriting any previous
    /// entry.
    pub async fn cache(&self, host: &str) -> Result<Vec<IpAddr>, Error> {
        let addrs = resolve(host).await?;
        let mut map = self.cache.lock().await;
        map.insert(host.to_owned(), addrs.clone());
        Ok(addrs)
    }

    /// Return the currently cached addresses of `host` (empty if never
    /// cached).
    pub async fn get(&self, host: &str) -> Vec<IpAddr> {
        let map = self.cache.lock().await;
        map.get(host).cloned().unwrap_or_default()
    }

    /// Drop every cached entry.
    pub async fn flush(&self) {
        let mut map = self.cache.lock().await;
        map.clear();
    }

    /// Resolve `host` for a dial: memoise the first lookup, then rotate the
    /// stored list (head to tail) and return the previous head.
    ///
    /// The rotation is atomic per call, so concurrent dials spread over the
    /// address list without ever leaving the cached snapshot.
    pub async fn covered_lookup(&self, host: &str) -> Result<IpAddr, Error> {
        let mut map = self.cache.lock().await;
        if map.get(host).map_or(true, |a| a.is_empty()) {
            let addrs = resolve(host).await?;
            map.insert(host.to_owned(), addrs);
        }
        let addrs = map.get_mut(host).ok_or_else(|| Error::NoAddrs {
            host: host.to_owned(),
        })?;
        let picked = addrs[0];
        if addrs.len() > 1 {
            addrs.rotate_left(1);
        }
        Ok(picked)
    }
}

/// Resolve `host` through the system resolver.
async fn resolve(host: &str) -> Result<Vec<IpAddr>, Error> {
    // lookup_host wants host:port; the port is irrelevant here.
    let addrs: Vec<IpAddr> = lookup_host((host, 0_u16))
        .await
        .map_err(|e| Error::Lookup {
            host: host.to_owned(),
            source: e,
        })?
        .map(|sa| sa.ip())
        .collect();
    if addrs.is_empty() {
        return Err(Error::NoAddrs {
            host: host.to_owned(),
        });
    }
    Ok(addrs)
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::useless_vec)]
    use super::*;

    /// Put a known list into the cache without resolving.
    async fn seed(c: &DnsCache, host: &str, addrs: Vec<IpAddr>) {
        let mut map = c.cache.lock().await;
        map.insert(host.to_owned(), addrs);
    }

    #[tokio::test]
    async fn covered_lookup_rotates() {
        let c = DnsCache::new();
        let a1: IpAddr = "192.0.2.1".parse().unwrap();
        let a2: IpAddr = "192.0.2.2".parse().unwrap();
        seed(&c, "relay.example", vec![a1, a2]).await;

        assert_eq!(c.covered_lookup("relay.example").await.unwrap(), a1);
        assert_eq!(c.covered_lookup("relay.example").await.unwrap(), a2);
        assert_eq!(c.covered_lookup("relay.example").await.unwrap(), a1);
        // The snapshot itself is unchanged in content.
        let mut got = c.get("relay.example").await;
        got.sort();
        assert_eq!(got, vec![a1, a2]);
    }

    #[tokio::test]
    async fn ip_literals_resolve_to_themselves() {
        let c = DnsCache::new();
        let picked = c.covered_lookup("127.0.0.1").await.unwrap();
        assert_eq!(picked, "127.0.0.1".parse::<IpAddr>().unwrap());
        // And the literal is now pinned like any other host.
        assert_eq!(c.get("127.0.0.1").await.len(), 1);
    }

    #[tokio::test]
    async fn get_unknown_is_empty() {
        let c = DnsCache::new();
        assert!(c.get("nonexistent.invalid").await.is_empty());
        c.flush().await;
    }
}
