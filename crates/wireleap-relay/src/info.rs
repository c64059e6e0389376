//! Contract and directory metadata documents.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;
use wireleap_crypto::ed25519::Pubkey;

/// Metadata served by a service contract at `GET <contract>/info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ContractInfo {
    /// Canonical endpoint URL of the contract.
    pub endpoint: Url,
    /// The contract's signing key.
    pub pubkey: Pubkey,
    /// Servicekey issuance parameters.
    pub servicekey: ServicekeyInfo,
    /// Where this contract's relay directory lives.
    pub directory: DirectoryRef,
}

/// Servicekey issuance parameters advertised by a contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct ServicekeyInfo {
    /// Validity duration of an activated servicekey, in seconds.
    pub duration: u64,
}

/// A pointer to a relay directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DirectoryRef {
    /// Endpoint URL of the directory.
    pub endpoint: Url,
}

/// Client upgrade channels advertised by the directory.
///
/// Maps channel name (for example `"default"`) to the newest client version
/// published on that channel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct UpgradeChannels {
    /// Channels applying to client software.
    #[serde(default)]
    pub client: BTreeMap<String, semver::Version>,
}

/// Directory metadata served at `GET <contract>/directory`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub struct DirectoryInfo {
    /// Endpoint URL of the directory itself.
    pub endpoint: Url,
    /// Available software upgrade channels.
    #[serde(default)]
    pub upgrade_channels: UpgradeChannels,
}
