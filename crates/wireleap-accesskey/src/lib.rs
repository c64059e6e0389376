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

mod import;
mod manager;

pub use import::ImportSummary;
pub use manager::{pick_fresh_pofs, AccesskeyManager};

use url::Url;
use wireleap_crypto::ed25519::Pubkey;

/// An error from accesskey or servicekey handling.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The import URL used plain HTTP.
    #[error("HTTP import URLs are vulnerable to MitM attacks; use HTTPS instead")]
    HttpImportUrl,
    /// The accesskey file could not be read.
    #[error("could not read accesskey file {path}")]
    ReadBundle {
        /// File path or URL that failed.
        path: String,
        /// Underlying read error.
        #[source]
        source: std::io::Error,
    },
    /// The accesskey file was not decodable JSON.
    #[error("could not decode accesskey file")]
    ParseBundle(#[from] serde_json::Error),
    /// The accesskey file decoded but is missing required sections.
    #[error("malformed accesskey file: missing {0}")]
    MalformedBundle(&'static str),
    /// The accesskey file has an incompatible format version.
    #[error("incompatible accesskey version: {got}")]
    BundleVersionMismatch {
        /// The version the bundle declared.
        got: semver::Version,
    },
    /// The bundle belongs to a different contract than this directory.
    #[error(
        "accesskeys are for contract {theirs}, but this directory is set up for {ours}; \
         use a separate wireleap directory for {theirs}"
    )]
    ContractMismatch {
        /// The contract this state directory is bound to.
        ours: Url,
        /// The contract the bundle names.
        theirs: Url,
    },
    /// The bundle's contract public key does not match the live contract.
    #[error("contract public key mismatch: accesskey file says {bundle}, live contract says {live}")]
    ContractPubkeyMismatch {
        /// Key from the bundle.
        bundle: Pubkey,
        /// Key reported by the contract itself.
        live: Pubkey,
    },
    /// No contract has been imported yet.
    #[error("no contract defined; did you run an accesskey import?")]
    NoContract,
    /// There are no unexpired pofs to activate.
    #[error("no fresh pofs available")]
    NoPofsAvailable,
    /// Every activation attempt failed.
    #[error("no servicekey available")]
    NoServicekeyAvailable,
    /// A fresh servicekey was needed but on-demand activation is disabled.
    #[error("no fresh servicekey available and accesskey.use_on_demand is false")]
    NotOnDemand,
    /// A fresh servicekey was needed and the caller forbade fetching one.
    #[error("no activated servicekey available")]
    NoFreshServicekey,
    /// Explicit activation refused because the current servicekey is
    /// still valid.
    #[error("refusing to replace a servicekey that has not expired yet")]
    RefusingReplace,
    /// Explicit activation attempted while on-demand activation is on.
    #[error("explicit activation is not available while accesskey.use_on_demand is enabled")]
    OnDemandEnabled,
    /// A contract request failed.
    #[error("contract request failed")]
    Api(#[from] wireleap_contract::Error),
    /// Persistent state could not be read or written.
    #[error("accesskey state error")]
    State(#[from] wireleap_fsdir::Error),
    /// Capability material was unusable.
    #[error("capability error")]
    Capability(#[from] wireleap_sharetoken::Error),
}
