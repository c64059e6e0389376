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

mod mgr;

pub use mgr::CircuitMgr;

use rand::seq::SliceRandom as _;
use wireleap_relay::{partition, RelayEntry, RelayList};

/// An ordered, non-empty list of relays for traffic to traverse.
pub type Circuit = Vec<RelayEntry>;

/// An error preventing circuit construction.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// The requested hop count is not positive.
    #[error("invalid number of hops requested: {0}")]
    InvalidHops(usize),
    /// There are fewer relays than hops.
    #[error("not enough relays to construct circuit: need {need} hops, have {have} suitable relays")]
    NotEnoughRelays {
        /// Requested hop count.
        need: usize,
        /// Relays available.
        have: usize,
    },
    /// No backing relay is available.
    #[error("cannot construct circuit: no backing relays")]
    NoBackingRelay,
    /// No fronting relay is available (required for 2+ hops).
    #[error("cannot construct circuit: no fronting relays")]
    NoFrontingRelay,
    /// Not enough entropic relays for the middle of the circuit.
    #[error("cannot construct circuit: not enough entropic relays; need {need} for {hops} hops, have {have}")]
    NotEnoughEntropicRelays {
        /// Entropic relays needed (`hops - 2`).
        need: usize,
        /// Requested hop count.
        hops: usize,
        /// Entropic relays available.
        have: usize,
    },
    /// Construction failed while a relay whitelist was restricting the
    /// candidate set.
    #[error("whitelist is enabled in config: {0}")]
    Whitelisted(Box<Error>),
}

/// Attempt to create a viable circuit of `hops` relays out of `all`.
///
/// Relays speaking an incompatible protocol version are dropped before
/// selection.  Selection is uniform per role; on circuits of three or more
/// hops the entropic list is shuffled unconditionally, so the directory
/// order never shows through in the middle of the circuit.
pub fn make(hops: usize, all: Vec<RelayEntry>, local: &semver::Version) -> Result<Circuit, Error> {
    if hops < 1 {
        return Err(Error::InvalidHops(hops));
    }
    let have = all.len();
    if hops > have {
        return Err(Error::NotEnoughRelays { need: hops, have });
    }
    let p = partition(all, local);
    let mut rng = rand::thread_rng();

    let backing = p
        .backing
        .choose(&mut rng)
        .cloned()
        .ok_or(Error::NoBackingRelay)?;
    if hops == 1 {
        return Ok(vec![backing]);
    }

    let fronting = p
        .fronting
        .choose(&mut rng)
        .cloned()
        .ok_or(Error::NoFrontingRelay)?;
    if hops == 2 {
        return Ok(vec![fronting, backing]);
    }

    // Shuffle to break directory order, even when every entropic relay
    // will be used.
    let mut entropic = p.entropic;
    entropic.shuffle(&mut rng);
    let need = hops - 2;
    if entropic.len() < need {
        return Err(Error::NotEnoughEntropicRelays {
            need,
            hops,
            have: entropic.len(),
        });
    }
    let mut circuit = Vec::with_capacity(hops);
    circuit.push(fronting);
    circuit.extend(entropic.into_iter().take(need));
    circuit.push(backing);
    Ok(circuit)
}

/// Build a circuit from a relay directory, honoring an optional address
/// whitelist.
///
/// An empty whitelist means no restriction.  When a non-empty whitelist is
/// in effect and construction fails, the error is tagged so the operator
/// can tell the restriction was involved.
pub fn make_restricted(
    hops: usize,
    rl: &RelayList,
    whitelist: &[String],
    local: &semver::Version,
) -> Result<Circuit, Error> {
    if whitelist.is_empty() {
        return make(hops, rl.all(), local);
    }
    let candidates: Vec<RelayEntry> = whitelist
        .iter()
        .filter_map(|addr| rl.get(addr).cloned())
        .collect();
    make(hops, candidates, local).map_err(|e| Error::Whitelisted(Box::new(e)))
}
