//! Servicekeys and their activation.

use base64ct::{Base64UrlUnpadded, Encoding as _};
use serde::{Deserialize, Serialize};
use wireleap_crypto::ed25519::{gen_keypair, Keypair, Pubkey};

use crate::{Error, Pof};

/// The contract binding attached to an activated servicekey.
///
/// `settlement_open` doubles as the servicekey's expiration: once the
/// settlement window opens, relays stop accepting sharetokens minted from
/// this key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SkContract {
    /// Identity of the binding contract.
    pub pubkey: Pubkey,
    /// When the settlement window opens (Unix seconds).
    pub settlement_open: i64,
    /// When the settlement window closes (Unix seconds).
    pub settlement_close: i64,
}

/// A servicekey: a short-lived Ed25519 keypair activated against a
/// contract, used to mint per-hop sharetokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ServiceKey {
    /// Public half of the keypair.
    pub public_key: Pubkey,
    /// Private half, as unpadded base64url of the 32-byte seed.
    ///
    /// Persisted alongside the public half so the client can keep minting
    /// across restarts within the key's validity window.
    pub private_key: String,
    /// Contract binding.  `None` until the contract has activated this key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<SkContract>,
}

impl ServiceKey {
    /// Create a fresh, not-yet-activated servicekey from a random keypair.
    pub fn new() -> Self {
        let kp = gen_keypair();
        ServiceKey {
            public_key: kp.verifying_key().into(),
            private_key: Base64UrlUnpadded::encode_string(kp.as_bytes()),
            contract: None,
        }
    }

    /// Return true if this servicekey is expired at time `now`
    /// (Unix seconds).
    ///
    /// An unactivated key is never usable, so it counts as expired.
    pub fn is_expired_at(&self, now: i64) -> bool {
        match &self.contract {
            Some(c) => c.settlement_open <= now,
            None => true,
        }
    }

    /// Reconstruct the signing keypair from the persisted seed.
    pub fn keypair(&self) -> Result<Keypair, Error> {
        let seed = Base64UrlUnpadded::decode_vec(&self.private_key)
            .map_err(|_| Error::BadPrivkey)?;
        let seed: [u8; 32] = seed.try_into().map_err(|_| Error::BadPrivkey)?;
        Ok(Keypair::from_bytes(&seed))
    }
}

impl Default for ServiceKey {
    fn default() -> Self {
        Self::new()
    }
}

/// Request body for `POST <contract>/servicekey/activate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub struct SkActivationRequest {
    /// Public key of the servicekey being activated.
    pub pubkey: Pubkey,
    /// The proof of funding spent on the activation.
    pub pof: Pof,
}

impl SkActivationRequest {
    /// Construct a new activation request from its fields.
    pub fn new(pubkey: Pubkey, pof: Pof) -> Self {
        Self { pubkey, pof }
    }
}
