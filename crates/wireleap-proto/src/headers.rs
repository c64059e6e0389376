//! Header names used on the broker's h2c ingress.

/// Protocol to dial the target with (`tcp` or `udp`).
pub const DIAL_PROTOCOL: &str = "wl-dial-protocol";
/// Target address, as `host:port`.
pub const DIAL_TARGET: &str = "wl-dial-target";
/// Identifier of the forwarder originating the tunnel, for logs.
pub const FORWARDER: &str = "wl-forwarder";
/// Forwarder name used when the header is absent.
pub const DEFAULT_FORWARDER: &str = "unnamed_forwarder";
