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

pub mod forwarder;
pub mod proto;

/// Buffer size for relayed UDP datagrams.  Change if bigger datagrams are
/// expected.
pub const UDP_BUFSIZE: usize = 4096;

/// Idle timeout after which a UDP tunnel is torn down.
pub const UDP_IDLE: std::time::Duration = std::time::Duration::from_secs(10);

/// A SOCKS protocol violation by the peer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The peer spoke a protocol version other than SOCKSv5.
    #[error("unknown SOCKS version: 0x{0:02x}")]
    BadVersion(u8),
    /// The peer requested an unsupported command.
    #[error("unsupported SOCKS command {0}")]
    BadCommand(u8),
    /// The peer used an unknown address type.
    #[error("unsupported SOCKS address type {0}")]
    BadAddrType(u8),
    /// A relayed UDP message was fragmented.
    #[error("received UDP message is fragmented, fragmentation is not supported")]
    Fragmented,
    /// A relayed UDP message was too short to dissect.
    #[error("truncated SOCKS UDP message")]
    Truncated,
    /// The underlying stream failed.
    #[error("SOCKS IO error")]
    Io(#[from] std::io::Error),
}
