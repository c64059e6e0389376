//! Status frames: the error type spoken between relays and the client.

use serde::{Deserialize, Serialize};
use wireleap_crypto::ed25519::Pubkey;

/// Description text a contract uses for a replayed proof of funding.
pub const SNEAKY_POF_DESC: &str = "pof has already been used";

/// Status codes that invalidate the active circuit when they arrive from a
/// relay on it.
const CIRCUIT_RESET_CODES: &[u16] = &[502, 504];

/// An error frame as produced by relays and contracts.
///
/// The code space is HTTP's; `origin`, when present, is the identity of the
/// relay where the failure happened, which lets the broker pinpoint the
/// faulty hop of a circuit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// HTTP-ish status code.
    pub code: u16,
    /// Human-readable description.
    pub desc: String,
    /// Public key of the originating relay, if the error came from one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Pubkey>,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.origin {
            Some(o) => write!(f, "status {} from {}: {}", self.code, o, self.desc),
            None => write!(f, "status {}: {}", self.code, self.desc),
        }
    }
}

impl std::error::Error for Status {}

impl Status {
    /// Construct a 502 circuit error originating at `origin`.
    ///
    /// This is the wrapper the circuit dialer applies to every hop-level
    /// failure so upstream code can identify the relay at fault.
    pub fn circuit_error(desc: impl Into<String>, origin: Pubkey) -> Self {
        Status {
            code: 502,
            desc: desc.into(),
            origin: Some(origin),
        }
    }

    /// Construct the status a contract returns for a replayed pof.
    pub fn sneaky_pof() -> Self {
        Status {
            code: 409,
            desc: SNEAKY_POF_DESC.into(),
            origin: None,
        }
    }

    /// Return true if this status reports a replayed pof.
    pub fn is_sneaky_pof(&self) -> bool {
        self.code == 409 && self.desc == SNEAKY_POF_DESC
    }

    /// Return true if this status should invalidate the active circuit.
    ///
    /// Only codes in the circuit-reset set qualify; other relay errors are
    /// per-request failures that leave the circuit standing.
    pub fn is_circuit_error(&self) -> bool {
        CIRCUIT_RESET_CODES.contains(&self.code)
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use wireleap_crypto::ed25519::gen_keypair;

    #[test]
    fn classification() {
        let origin: Pubkey = gen_keypair().verifying_key().into();
        assert!(Status::circuit_error("relay gone", origin).is_circuit_error());
        assert!(Status::sneaky_pof().is_sneaky_pof());
        assert!(!Status::sneaky_pof().is_circuit_error());
        let protocol_err = Status {
            code: 400,
            desc: "bad init".into(),
            origin: Some(origin),
        };
        assert!(!protocol_err.is_circuit_error());
    }

    #[test]
    fn origin_survives_json() {
        let origin: Pubkey = gen_keypair().verifying_key().into();
        let s = Status::circuit_error("x", origin);
        let json = serde_json::to_string(&s).unwrap();
        let s2: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(s, s2);
        assert_eq!(s2.origin, Some(origin));
    }
}
