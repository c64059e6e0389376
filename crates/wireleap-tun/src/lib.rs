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

pub mod control;
pub mod netsetup;
pub mod ptable;
pub mod splice;

/// Maximum raw IP packet size read off the TUN device.
pub const MAX_PACKET: usize = 65535;

/// Buffer size for datagrams read back from UDP tunnels.
pub const UDP_BUFSIZE: usize = 4096;

/// Idle timeout on UDP tunnel reads and writes.
pub const UDP_IDLE: std::time::Duration = std::time::Duration::from_secs(10);

/// An error from the TUN helper.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The TUN device could not be created or configured.
    #[error("could not set up tun device: {0}")]
    Device(String),
    /// An `ip(8)` invocation failed.
    #[error("`ip {args}` failed: {output}")]
    IpCommand {
        /// Arguments the command ran with.
        args: String,
        /// What it printed.
        output: String,
    },
    /// No usable default route exists for bypass routing.
    #[error("no default gateway found for bypass routes")]
    NoDefaultRoute,
    /// A tunnel to the broker failed.
    #[error("broker tunnel error")]
    Tunnel(#[from] wireleap_h2conn::Error),
    /// Underlying IO failure.
    #[error("tun IO error")]
    Io(#[from] std::io::Error),
}
