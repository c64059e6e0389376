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

mod broker;
mod bypass;
mod config;
mod dialer;
mod front;

pub use broker::Broker;
pub use config::BrokerConfig;
pub use front::listen_h2c;

use wireleap_proto::Status;

/// An error from broker operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A required configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(&'static str),
    /// No contract has been imported into this state directory.
    #[error("contract is not defined; import accesskeys first")]
    NoContract,
    /// The directory requires a newer client than this one.
    #[error("upgrade available to {0}; please run an upgrade")]
    UpgradeRequired(semver::Version),
    /// A contract or directory request failed.
    #[error("could not sync with contract")]
    Api(#[from] wireleap_contract::Error),
    /// Capability handling failed.
    #[error("could not obtain fresh servicekey")]
    Accesskey(#[from] wireleap_accesskey::Error),
    /// Circuit construction failed.
    #[error("could not obtain circuit")]
    Circuit(#[from] wireleap_circuit::Error),
    /// A relay (or the path to it) failed during a dial.
    #[error(transparent)]
    Relay(#[from] Status),
    /// Capability material was unusable.
    #[error("capability error")]
    Capability(#[from] wireleap_sharetoken::Error),
    /// Hostname resolution failed.
    #[error("resolver failure")]
    Dns(#[from] wireleap_dnscache::Error),
    /// Persistent state could not be read or written.
    #[error("state directory error")]
    State(#[from] wireleap_fsdir::Error),
    /// Listener or connection-level IO failure.
    #[error("broker IO error")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// If this error carries a relay `Status` frame, return it.
    pub fn as_status(&self) -> Option<&Status> {
        match self {
            Error::Relay(s) => Some(s),
            Error::Api(e) => e.as_status(),
            Error::Accesskey(wireleap_accesskey::Error::Api(e)) => e.as_status(),
            _ => None,
        }
    }
}
