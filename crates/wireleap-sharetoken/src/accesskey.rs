//! Accesskey bundles: the import format for proofs of funding.

use semver::Version;
use serde::{Deserialize, Serialize};
use url::Url;
use wireleap_crypto::ed25519::Pubkey;

use crate::Pof;

/// The accesskey file format version this client understands.
///
/// Bundles whose minor version differs are rejected on import.
pub const ACCESSKEY_VERSION: Version = Version::new(0, 2, 0);

/// The contract section of an accesskey bundle.
///
/// All fields are optional at the serde level so that a malformed bundle
/// parses and can then be rejected with a precise message, instead of
/// surfacing a serde error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[non_exhaustive]
pub struct AccesskeyContract {
    /// Endpoint of the issuing contract.
    pub endpoint: Option<Url>,
    /// Public key the issuing contract claims.
    pub pubkey: Option<Pubkey>,
}

/// An accesskey bundle, as downloaded from a contract or handed over as a
/// file: a batch of pofs plus the contract they were bought from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[non_exhaustive]
pub struct Accesskey {
    /// Bundle format version.
    pub version: Option<Version>,
    /// Issuing contract.
    pub contract: Option<AccesskeyContract>,
    /// The proofs of funding themselves.
    pub pofs: Option<Vec<Pof>>,
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn partial_bundle_parses() {
        // Envelope validation happens above the serde layer, so a bundle
        // with missing sections must still parse.
        let ak: Accesskey = serde_json::from_str(r#"{ "version": "0.2.0" }"#).unwrap();
        assert_eq!(ak.version, Some(Version::new(0, 2, 0)));
        assert!(ak.contract.is_none());
        assert!(ak.pofs.is_none());
    }
}
