//! Sharetokens: the single-use capability presented at each hop.

use base64ct::{Base64UrlUnpadded, Encoding as _};
use rand::RngCore as _;
use serde::{Deserialize, Serialize};
use wireleap_crypto::ed25519::{Pubkey, Signature, Signer as _, Verifier as _};

use crate::{Error, ServiceKey, SkContract};

/// A single-use capability minted from a servicekey for one specific relay.
///
/// Each hop of a circuit consumes one sharetoken, bound to the public key
/// of the relay that will validate it.  The nonce makes every mint unique;
/// relays reject a token whose signature they have already seen.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct Sharetoken {
    /// Public key of the servicekey this token spends from.
    pub public_key: Pubkey,
    /// Public key of the relay this token is made out to.
    pub relay_pubkey: Pubkey,
    /// Random 16-byte nonce (unpadded base64url).
    pub nonce: String,
    /// Contract binding copied from the servicekey.
    pub contract: SkContract,
    /// Servicekey signature over the binding message.
    pub signature: String,
}

impl Sharetoken {
    /// Mint a new sharetoken from `sk` for the relay identified by
    /// `relay_pubkey`.
    ///
    /// This is a pure function of the servicekey's private component, the
    /// relay key, and fresh randomness; it performs no I/O.
    pub fn new(sk: &ServiceKey, relay_pubkey: Pubkey) -> Result<Self, Error> {
        let contract = sk.contract.clone().ok_or(Error::Unactivated)?;
        let kp = sk.keypair()?;
        let mut nonce = [0_u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce);
        let msg = signing_message(&sk.public_key, &relay_pubkey, &nonce, &contract);
        let sig = kp.sign(&msg);
        Ok(Sharetoken {
            public_key: sk.public_key,
            relay_pubkey,
            nonce: Base64UrlUnpadded::encode_string(&nonce),
            contract,
            signature: Base64UrlUnpadded::encode_string(&sig.to_bytes()),
        })
    }

    /// Check this token's signature.
    ///
    /// Relays do this before honoring a token; the client only needs it in
    /// tests and diagnostics.
    pub fn verify(&self) -> Result<(), Error> {
        let nonce =
            Base64UrlUnpadded::decode_vec(&self.nonce).map_err(|_| Error::BadSignature)?;
        let sig_bytes =
            Base64UrlUnpadded::decode_vec(&self.signature).map_err(|_| Error::BadSignature)?;
        let sig_bytes: [u8; 64] = sig_bytes.try_into().map_err(|_| Error::BadSignature)?;
        let sig = Signature::from_bytes(&sig_bytes);
        let msg = signing_message(&self.public_key, &self.relay_pubkey, &nonce, &self.contract);
        self.public_key
            .as_public_key()?
            .verify(&msg, &sig)
            .map_err(|_| Error::BadSignature)
    }
}

/// Construct the byte string a sharetoken signature covers.
fn signing_message(
    sk_pub: &Pubkey,
    relay_pub: &Pubkey,
    nonce: &[u8],
    contract: &SkContract,
) -> Vec<u8> {
    let mut msg = Vec::with_capacity(32 + 32 + nonce.len() + 32 + 16);
    msg.extend_from_slice(sk_pub.as_bytes());
    msg.extend_from_slice(relay_pub.as_bytes());
    msg.extend_from_slice(nonce);
    msg.extend_from_slice(contract.pubkey.as_bytes());
    msg.extend_from_slice(&contract.settlement_open.to_be_bytes());
    msg.extend_from_slice(&contract.settlement_close.to_be_bytes());
    msg
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use wireleap_crypto::ed25519::gen_keypair;

    /// An activated servicekey for tests.
    fn activated_sk() -> ServiceKey {
        let mut sk = ServiceKey::new();
        sk.contract = Some(SkContract {
            pubkey: gen_keypair().verifying_key().into(),
            settlement_open: 10_000,
            settlement_close: 20_000,
        });
        sk
    }

    #[test]
    fn mint_and_verify() {
        let sk = activated_sk();
        let relay: Pubkey = gen_keypair().verifying_key().into();
        let st = Sharetoken::new(&sk, relay).unwrap();
        assert_eq!(st.relay_pubkey, relay);
        st.verify().unwrap();
    }

    #[test]
    fn every_mint_is_unique() {
        let sk = activated_sk();
        let relay: Pubkey = gen_keypair().verifying_key().into();
        let a = Sharetoken::new(&sk, relay).unwrap();
        let b = Sharetoken::new(&sk, relay).unwrap();
        assert_ne!(a.nonce, b.nonce);
        assert_ne!(a.signature, b.signature);
    }

    #[test]
    fn unactivated_sk_cannot_mint() {
        let sk = ServiceKey::new();
        let relay: Pubkey = gen_keypair().verifying_key().into();
        assert!(matches!(
            Sharetoken::new(&sk, relay),
            Err(Error::Unactivated)
        ));
    }

    #[test]
    fn tampered_token_fails() {
        let sk = activated_sk();
        let relay: Pubkey = gen_keypair().verifying_key().into();
        let mut st = Sharetoken::new(&sk, relay).unwrap();
        st.relay_pubkey = gen_keypair().verifying_key().into();
        assert!(st.verify().is_err());
    }
}
