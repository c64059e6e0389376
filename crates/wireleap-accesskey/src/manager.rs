//! The accesskey manager.

use std::future::Future;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;
use wireleap_contract::{
    activate_sk, check_upgrade, contract_info, directory_info, relays, ApiClient, UpgradeStatus,
};
use wireleap_fsdir::{filenames, FsDir};
use wireleap_proto::{CLIENT_VERSION, UPGRADE_CHANNEL};
use wireleap_relay::ContractInfo;
use wireleap_sharetoken::{
    Accesskey, Pof, ServiceKey, SkActivationRequest, ACCESSKEY_VERSION,
};

use crate::import::{merge_pofs, ImportSummary};
use crate::Error;

/// Mutable capability state: what the mutex protects.
#[derive(Debug, Default)]
struct State {
    /// Cached servicekey, lazily loaded from disk.
    sk: Option<ServiceKey>,
    /// In-memory mirror of `pofs.json`.
    pofs: Vec<Pof>,
}

/// Owner of all capability state.
///
/// One instance exists per client; every servicekey mutation goes through
/// its mutex, which is independent of the broker's circuit mutex so that
/// capability refresh never deadlocks against circuit rebuild.
#[derive(Debug)]
pub struct AccesskeyManager {
    /// State directory holding `pofs.json` / `servicekey.json`.
    fd: FsDir,
    /// Client for contract endpoints.
    api: ApiClient,
    /// Whether pofs may be spent automatically when a dial needs a key.
    use_on_demand: bool,
    /// The guarded state.
    state: Mutex<State>,
}

/// Current time as Unix seconds.
fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Return the non-expired subset of `pofs` at time `now`.
pub fn pick_fresh_pofs(pofs: &[Pof], now: i64) -> Vec<Pof> {
    pofs.iter()
        .filter(|p| !p.is_expired_at(now))
        .cloned()
        .collect()
}

impl AccesskeyManager {
    /// Create a manager over the state directory `fd`.
    ///
    /// Previously stored pofs are loaded eagerly; a missing or empty pof
    /// file is fine.
    pub fn new(fd: FsDir, api: ApiClient, use_on_demand: bool) -> Result<Self, Error> {
        let pofs: Vec<Pof> = fd.get(filenames::POFS)?.unwrap_or_default();
        Ok(AccesskeyManager {
            fd,
            api,
            use_on_demand,
            state: Mutex::new(State { sk: None, pofs }),
        })
    }

    /// The endpoint of the contract this state directory is bound to.
    pub fn contract_url(&self) -> Result<Url, Error> {
        let ci: Option<ContractInfo> = self.fd.get(filenames::CONTRACT)?;
        ci.map(|c| c.endpoint).ok_or(Error::NoContract)
    }

    /// Import an accesskey bundle from `source`: an `https://` URL or a
    /// local file path.
    pub async fn import(&self, source: &str) -> Result<ImportSummary, Error> {
        let data = if source.starts_with("http://") {
            return Err(Error::HttpImportUrl);
        } else if source.starts_with("https://") {
            let url: Url = source.parse().map_err(|_| Error::MalformedBundle("url"))?;
            info!("downloading {}...", url);
            self.api.get_bytes(&url).await?
        } else {
            std::fs::read(source).map_err(|e| Error::ReadBundle {
                path: source.to_owned(),
                source: e,
            })?
        };

        let ak: Accesskey = serde_json::from_slice(&data)?;
        let version = ak.version.ok_or(Error::MalformedBundle("version"))?;
        let contract = ak.contract.ok_or(Error::MalformedBundle("contract"))?;
        let bundle_pofs = ak.pofs.ok_or(Error::MalformedBundle("pofs"))?;
        let endpoint = contract
            .endpoint
            .ok_or(Error::MalformedBundle("contract.endpoint"))?;
        let bundle_pubkey = contract
            .pubkey
            .ok_or(Error::MalformedBundle("contract.pubkey"))?;
        if version.minor != ACCESSKEY_VERSION.minor {
            return Err(Error::BundleVersionMismatch { got: version });
        }

        // Refuse to mix accesskeys of two different contracts in one state
        // directory.
        if let Ok(ours) = self.contract_url() {
            if ours != endpoint {
                return Err(Error::ContractMismatch {
                    ours,
                    theirs: endpoint,
                });
            }
        }

        // Verify the bundle's claimed pubkey against the live contract,
        // then persist its metadata and relay list.
        let ci = contract_info(&self.api, &endpoint).await?;
        if ci.pubkey != bundle_pubkey {
            return Err(Error::ContractPubkeyMismatch {
                bundle: bundle_pubkey,
                live: ci.pubkey,
            });
        }
        let rl = relays(&self.api, &endpoint).await?;
        self.fd.set(filenames::CONTRACT, &ci)?;
        self.fd.set(filenames::RELAYS, &rl)?;

        let mut st = self.state.lock().await;
        let (imported, skipped_expired, skipped_duplicate) =
            merge_pofs(&mut st.pofs, bundle_pofs, now_unix());
        self.fd.set(filenames::POFS, &st.pofs)?;
        drop(st);

        // Surface upgrade availability as a warning; enforcement happens
        // on broker sync.
        let di = directory_info(&self.api, &endpoint).await?;
        let upgrade = match check_upgrade(&di, UPGRADE_CHANNEL, &CLIENT_VERSION, None) {
            UpgradeStatus::Required(v) | UpgradeStatus::Skipped(v) => {
                warn!(
                    "upgrade available to {}, current version is {}; please upgrade",
                    v, CLIENT_VERSION
                );
                Some(v)
            }
            UpgradeStatus::Current => None,
        };

        Ok(ImportSummary {
            contract: endpoint,
            imported,
            skipped_expired,
            skipped_duplicate,
            upgrade,
        })
    }

    /// Return the currently held pofs that have not expired.
    pub async fn fresh_pofs(&self) -> Vec<Pof> {
        let st = self.state.lock().await;
        pick_fresh_pofs(&st.pofs, now_unix())
    }

    /// Return the cached servicekey, if any (expired or not).
    pub async fn current_sk(&self) -> Option<ServiceKey> {
        self.state.lock().await.sk.clone()
    }

    /// Return a usable servicekey.
    ///
    /// If a cached (or persisted) key is still valid it is returned as-is.
    /// Otherwise, when on-demand activation is enabled and `fetch` is
    /// true, a pof is spent to obtain a new key.
    pub async fn get_sk(&self, fetch: bool) -> Result<ServiceKey, Error> {
        let mut st = self.state.lock().await;
        if st.sk.is_none() {
            st.sk = self.fd.get(filenames::SERVICEKEY)?;
        }
        if let Some(sk) = &st.sk {
            if sk.contract.is_some() && !sk.is_expired_at(now_unix()) {
                debug!("found existing servicekey {}", sk.public_key);
                return Ok(sk.clone());
            }
        }
        if !self.use_on_demand {
            return Err(Error::NotOnDemand);
        }
        if !fetch {
            return Err(Error::NoFreshServicekey);
        }
        self.refresh_locked_default(&mut st).await
    }

    /// Discard the old servicekey and activate a new one from stored pofs.
    pub async fn refresh_sk(&self) -> Result<ServiceKey, Error> {
        let mut st = self.state.lock().await;
        self.refresh_locked_default(&mut st).await
    }

    /// Explicitly activate a servicekey.
    ///
    /// Only available when on-demand activation is disabled, and only when
    /// the current key is absent or expired: a still-valid key is never
    /// replaced implicitly.
    pub async fn activate(&self) -> Result<ServiceKey, Error> {
        if self.use_on_demand {
            return Err(Error::OnDemandEnabled);
        }
        let mut st = self.state.lock().await;
        if st.sk.is_none() {
            st.sk = self.fd.get(filenames::SERVICEKEY)?;
        }
        if let Some(sk) = &st.sk {
            if sk.contract.is_some() && !sk.is_expired_at(now_unix()) {
                return Err(Error::RefusingReplace);
            }
        }
        self.refresh_locked_default(&mut st).await
    }

    /// Refresh using the real contract activation endpoint.
    async fn refresh_locked_default(&self, st: &mut State) -> Result<ServiceKey, Error> {
        let contract = self.contract_url()?;
        let api = self.api.clone();
        self.refresh_locked(st, move |pof| {
            let api = api.clone();
            let contract = contract.clone();
            async move {
                let mut sk = ServiceKey::new();
                let req = SkActivationRequest::new(sk.public_key, pof);
                let binding = activate_sk(&api, &contract, &req).await?;
                sk.contract = Some(binding);
                Ok(sk)
            }
        })
        .await
    }

    /// Refresh the servicekey using activation function `actf`.
    ///
    /// Pofs are tried in stored order.  A successful activation consumes
    /// its pof; a replay rejection drops the pof; any other failure keeps
    /// the pof for a later attempt.  The pof file and servicekey file are
    /// rewritten before returning.
    pub async fn refresh_sk_with<F, Fut>(&self, actf: F) -> Result<ServiceKey, Error>
    where
        F: FnMut(Pof) -> Fut,
        Fut: Future<Output = Result<ServiceKey, Error>>,
    {
        let mut st = self.state.lock().await;
        self.refresh_locked(&mut st, actf).await
    }

    /// The refresh loop itself; requires the state lock to be held.
    async fn refresh_locked<F, Fut>(&self, st: &mut State, mut actf: F) -> Result<ServiceKey, Error>
    where
        F: FnMut(Pof) -> Fut,
        Fut: Future<Output = Result<ServiceKey, Error>>,
    {
        let stored: Vec<Pof> = self.fd.get(filenames::POFS)?.unwrap_or_default();
        let fresh = pick_fresh_pofs(&stored, now_unix());
        if fresh.is_empty() {
            return Err(Error::NoPofsAvailable);
        }
        let mut sk: Option<ServiceKey> = None;
        let mut retained: Vec<Pof> = Vec::new();
        for p in fresh {
            if sk.is_some() {
                // Keep the rest untouched.
                retained.push(p);
                continue;
            }
            info!("generating new servicekey from pof {}...", p.digest());
            match actf(p.clone()).await {
                Ok(k) => {
                    // Successfully-spent pof is dropped.
                    sk = Some(k);
                }
                Err(e) => {
                    warn!(
                        "failed generating new servicekey from pof {}: {}",
                        p.digest(),
                        e
                    );
                    if !is_replayed_pof(&e) {
                        // Keep the pof unless the contract says it has
                        // already been spent.
                        retained.push(p);
                    }
                }
            }
        }
        self.fd.set(filenames::POFS, &retained)?;
        st.pofs = retained;
        let sk = sk.ok_or(Error::NoServicekeyAvailable)?;
        self.fd.set(filenames::SERVICEKEY, &sk)?;
        st.sk = Some(sk.clone());
        Ok(sk)
    }
}

/// Return true if `e` is the contract's replayed-pof rejection.
fn is_replayed_pof(e: &Error) -> bool {
    match e {
        Error::Api(api) => api.as_status().is_some_and(|s| s.is_sneaky_pof()),
        _ => false,
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::useless_vec)]
    use super::*;
    use std::time::Duration;
    use wireleap_proto::Status;
    use wireleap_sharetoken::SkContract;

    /// A manager over a fresh temp directory.
    fn mgr(dir: &tempfile::TempDir, use_on_demand: bool) -> AccesskeyManager {
        let fd = FsDir::new(dir.path()).unwrap();
        let api = ApiClient::new(Duration::from_secs(1));
        AccesskeyManager::new(fd, api, use_on_demand).unwrap()
    }

    /// A pof expiring far in the future.
    fn pof(nonce: &str) -> Pof {
        Pof {
            pof_type: "sk".into(),
            expiration: now_unix() + 3600,
            nonce: nonce.into(),
            signature: "sig".into(),
        }
    }

    /// An activated servicekey valid for another hour.
    fn valid_sk() -> ServiceKey {
        let mut sk = ServiceKey::new();
        sk.contract = Some(SkContract {
            pubkey: wireleap_crypto::ed25519::gen_keypair().verifying_key().into(),
            settlement_open: now_unix() + 3600,
            settlement_close: now_unix() + 7200,
        });
        sk
    }

    #[tokio::test]
    async fn refresh_handles_replayed_pofs() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mgr(&dir, true);
        let fd = FsDir::new(dir.path()).unwrap();
        fd.set(filenames::POFS, &vec![pof("p1"), pof("p2"), pof("p3")])
            .unwrap();

        // p1 is already spent server-side; p2 activates; p3 is never tried.
        let sk = m
            .refresh_sk_with(|p| async move {
                match p.nonce.as_str() {
                    "p1" => Err(Error::Api(wireleap_contract::Error::Status(
                        Status::sneaky_pof(),
                    ))),
                    _ => Ok(valid_sk()),
                }
            })
            .await
            .unwrap();
        assert!(sk.contract.is_some());

        let left: Vec<Pof> = fd.get(filenames::POFS).unwrap().unwrap();
        let nonces: Vec<_> = left.iter().map(|p| p.nonce.as_str()).collect();
        assert_eq!(nonces, vec!["p3"]);
        let persisted: ServiceKey = fd.get(filenames::SERVICEKEY).unwrap().unwrap();
        assert_eq!(persisted.public_key, sk.public_key);
    }

    #[tokio::test]
    async fn refresh_keeps_pof_on_other_errors() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mgr(&dir, true);
        let fd = FsDir::new(dir.path()).unwrap();
        fd.set(filenames::POFS, &vec![pof("p1"), pof("p2")]).unwrap();

        let sk = m
            .refresh_sk_with(|p| async move {
                match p.nonce.as_str() {
                    "p1" => Err(Error::Api(wireleap_contract::Error::Status(Status {
                        code: 500,
                        desc: "contract hiccup".into(),
                        origin: None,
                    }))),
                    _ => Ok(valid_sk()),
                }
            })
            .await
            .unwrap();
        assert!(sk.contract.is_some());

        // The transient failure keeps p1 around for a later attempt.
        let left: Vec<Pof> = fd.get(filenames::POFS).unwrap().unwrap();
        let nonces: Vec<_> = left.iter().map(|p| p.nonce.as_str()).collect();
        assert_eq!(nonces, vec!["p1"]);
    }

    #[tokio::test]
    async fn refresh_without_pofs_fails() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mgr(&dir, true);
        let r = m.refresh_sk_with(|_| async { Ok(valid_sk()) }).await;
        assert!(matches!(r, Err(Error::NoPofsAvailable)));
    }

    #[tokio::test]
    async fn get_sk_returns_persisted_valid_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let fd = FsDir::new(dir.path()).unwrap();
        let sk = valid_sk();
        fd.set(filenames::SERVICEKEY, &sk).unwrap();

        let m = mgr(&dir, true);
        let got = m.get_sk(true).await.unwrap();
        assert_eq!(got.public_key, sk.public_key);
    }

    #[tokio::test]
    async fn get_sk_respects_on_demand_setting() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mgr(&dir, false);
        assert!(matches!(m.get_sk(true).await, Err(Error::NotOnDemand)));
    }

    #[tokio::test]
    async fn get_sk_respects_fetch_flag() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mgr(&dir, true);
        assert!(matches!(
            m.get_sk(false).await,
            Err(Error::NoFreshServicekey)
        ));
    }

    #[tokio::test]
    async fn activate_refuses_valid_key() {
        let dir = tempfile::TempDir::new().unwrap();
        let fd = FsDir::new(dir.path()).unwrap();
        fd.set(filenames::SERVICEKEY, &valid_sk()).unwrap();
        let m = mgr(&dir, false);
        assert!(matches!(m.activate().await, Err(Error::RefusingReplace)));
    }

    #[tokio::test]
    async fn activate_requires_on_demand_off() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mgr(&dir, true);
        assert!(matches!(m.activate().await, Err(Error::OnDemandEnabled)));
    }

    #[tokio::test]
    async fn import_rejects_http() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mgr(&dir, true);
        let r = m.import("http://example.com/accesskey.json").await;
        assert!(matches!(r, Err(Error::HttpImportUrl)));
    }

    #[tokio::test]
    async fn import_rejects_malformed_bundle() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mgr(&dir, true);
        let path = dir.path().join("ak.json");
        std::fs::write(&path, r#"{ "version": "0.2.0" }"#).unwrap();
        let r = m.import(path.to_str().unwrap()).await;
        assert!(matches!(r, Err(Error::MalformedBundle("contract"))));
    }

    #[tokio::test]
    async fn import_rejects_version_mismatch() {
        let dir = tempfile::TempDir::new().unwrap();
        let m = mgr(&dir, true);
        let path = dir.path().join("ak.json");
        std::fs::write(
            &path,
            r#"{
                "version": "0.1.0",
                "contract": {
                    "endpoint": "https://contract.example.com",
                    "pubkey": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA"
                },
                "pofs": []
            }"#,
        )
        .unwrap();
        let r = m.import(path.to_str().unwrap()).await;
        assert!(matches!(r, Err(Error::BundleVersionMismatch { .. })));
    }
}
