//! The broker object.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use url::Url;
use wireleap_accesskey::AccesskeyManager;
use wireleap_circuit::{make_restricted, Circuit, CircuitMgr};
use wireleap_contract::{
    check_upgrade, contract_info, directory_info, relays, ApiClient, UpgradeStatus,
};
use wireleap_dnscache::DnsCache;
use wireleap_fsdir::{filenames, FsDir};
use wireleap_proto::{CLIENT_VERSION, PROTO_VERSION, UPGRADE_CHANNEL};
use wireleap_relay::{ContractInfo, DirectoryInfo, RelayEntry, RelayList};

use crate::{bypass, dialer, BrokerConfig, Error};

/// Timeout for contract and directory requests.
const API_TIMEOUT: Duration = Duration::from_secs(10);

/// The values WIRELEAP_TARGET_PROTOCOL may take.
const TARGET_PROTOCOLS: &[&str] = &["tcp", "tcp4", "tcp6"];

/// The broker: owner of the circuit cache, the capability store, and the
/// DNS pinning cache.
///
/// One instance serves every forwarder.  The circuit mutex (inside
/// [`CircuitMgr`]) and the capability mutex (inside [`AccesskeyManager`])
/// are deliberately independent locks.
#[derive(Debug)]
pub struct Broker {
    /// Client state directory.
    fd: FsDir,
    /// Current configuration; replaced wholesale on reload.
    cfg: StdMutex<BrokerConfig>,
    /// Contract API client; rebuilt with DNS pins after each sync.
    api: StdMutex<ApiClient>,
    /// Pinned resolver snapshot shared with bypass publication.
    cache: DnsCache,
    /// The single active circuit.
    circuits: CircuitMgr,
    /// Capability store.
    akmgr: AccesskeyManager,
    /// Value of WIRELEAP_TARGET_PROTOCOL, if set and valid.
    forced_protocol: Option<String>,
}

impl Broker {
    /// Create a broker over the state directory `fd`.
    pub fn new(fd: FsDir, cfg: BrokerConfig) -> Result<Self, Error> {
        let api = ApiClient::new(API_TIMEOUT);
        let akmgr = AccesskeyManager::new(fd.clone(), api.clone(), cfg.use_on_demand)?;
        let forced_protocol = match std::env::var("WIRELEAP_TARGET_PROTOCOL") {
            Ok(p) if TARGET_PROTOCOLS.contains(&p.as_str()) => Some(p),
            Ok(p) => {
                warn!("ignoring invalid WIRELEAP_TARGET_PROTOCOL value: {}", p);
                None
            }
            Err(_) => None,
        };
        Ok(Broker {
            fd,
            cfg: StdMutex::new(cfg),
            api: StdMutex::new(api),
            cache: DnsCache::new(),
            circuits: CircuitMgr::new(),
            akmgr,
            forced_protocol,
        })
    }

    /// A snapshot of the current configuration.
    pub fn config(&self) -> BrokerConfig {
        self.cfg
            .lock()
            .map(|c| c.clone())
            .unwrap_or_default()
    }

    /// The current API client.
    fn api(&self) -> ApiClient {
        self.api
            .lock()
            .map(|a| a.clone())
            .unwrap_or_else(|_| ApiClient::new(API_TIMEOUT))
    }

    /// The capability store.
    pub fn accesskeys(&self) -> &AccesskeyManager {
        &self.akmgr
    }

    /// The pinned DNS cache.
    pub fn dns_cache(&self) -> &DnsCache {
        &self.cache
    }

    /// The endpoint of the configured contract.
    pub fn contract_url(&self) -> Result<Url, Error> {
        let ci: Option<ContractInfo> = self.fd.get(filenames::CONTRACT)?;
        ci.map(|c| c.endpoint).ok_or(Error::NoContract)
    }

    /// Fetch and persist contract metadata, directory metadata, and the
    /// relay list; enforce the upgrade channel; refresh DNS pins.
    pub async fn sync(&self) -> Result<(ContractInfo, DirectoryInfo, RelayList), Error> {
        let sc = self.contract_url()?;
        let api = self.api();
        let ci = contract_info(&api, &sc).await?;
        let di = directory_info(&api, &sc).await?;

        let skipped: Option<semver::Version> = self.fd.get(filenames::UPGRADE_SKIP)?;
        match check_upgrade(&di, UPGRADE_CHANNEL, &CLIENT_VERSION, skipped.as_ref()) {
            UpgradeStatus::Required(v) => return Err(Error::UpgradeRequired(v)),
            UpgradeStatus::Skipped(v) => {
                warn!(
                    "upgrade available to {}, current version is {}; \
                     last upgrade attempt to {} failed, keeping current version",
                    v, CLIENT_VERSION, v
                );
            }
            UpgradeStatus::Current => {}
        }

        let rl = relays(&api, &sc).await?;
        self.fd.set(filenames::CONTRACT, &ci)?;
        self.fd.set(filenames::RELAYS, &rl)?;
        self.refresh_dns(&sc, &ci, &rl).await;
        Ok((ci, di, rl))
    }

    /// Re-resolve and pin every hostname circuits and bypass lists depend
    /// on: the contract, the directory, and all relays.
    async fn refresh_dns(&self, sc: &Url, ci: &ContractInfo, rl: &RelayList) {
        let mut hosts: Vec<String> = Vec::new();
        if let Some(h) = sc.host_str() {
            hosts.push(h.to_owned());
        }
        if let Some(h) = ci.directory.endpoint.host_str() {
            hosts.push(h.to_owned());
        }
        for r in rl.all() {
            if let Some(h) = r.hostname() {
                hosts.push(h.to_owned());
            }
        }
        for host in &hosts {
            if let Err(e) = self.cache.cache(host).await {
                warn!("could not cache {}: {}", host, e);
            }
        }
        // Rebuild the API client so every later request dials a pinned
        // (and therefore bypass-routed) address.
        let mut pins: Vec<(String, Vec<std::net::SocketAddr>)> = Vec::new();
        for host in hosts {
            let addrs: Vec<std::net::SocketAddr> = self
                .cache
                .get(&host)
                .await
                .into_iter()
                .map(|ip| (ip, 0_u16).into())
                .collect();
            if !addrs.is_empty() {
                pins.push((host, addrs));
            }
        }
        let pinned = ApiClient::pinned(
            API_TIMEOUT,
            pins.iter().map(|(h, a)| (h.as_str(), a.as_slice())),
        );
        if let Ok(mut api) = self.api.lock() {
            *api = pinned;
        }
    }

    /// Return the active circuit, building one if needed.
    ///
    /// A newly built circuit is announced to the TUN helper so its bypass
    /// routes cover the new fronting relay.
    pub async fn circuit(&self) -> Result<Arc<Circuit>, Error> {
        let had = self.circuits.current().await.is_some();
        let circuit = self
            .circuits
            .get_or_build_with(|| async {
                let (_ci, _di, rl) = self.sync().await?;
                let cfg = self.config();
                let c = make_restricted(cfg.hops, &rl, &cfg.whitelist, &PROTO_VERSION)?;
                info!(
                    "circuit of {} hops selected: {}",
                    c.len(),
                    c.iter()
                        .map(|r| r.addr.to_string())
                        .collect::<Vec<_>>()
                        .join(" -> ")
                );
                Ok::<_, Error>(c)
            })
            .await?;
        if !had {
            if let Err(e) = self.publish_bypass(circuit.first()).await {
                warn!("could not publish bypass list: {}", e);
            }
        }
        Ok(circuit)
    }

    /// Dial `target` over the circuit with the given protocol.
    pub async fn dial(&self, protocol: &str, target: &str) -> Result<TcpStream, Error> {
        let sk = self.akmgr.get_sk(true).await?;
        let circuit = self.circuit().await?;
        let cfg = self.config();
        dialer::circuit_dial(
            &self.cache,
            cfg.timeout,
            &sk,
            &circuit,
            protocol,
            target,
            self.forced_protocol.as_deref(),
        )
        .await
    }

    /// Classify a failed dial or splice.
    ///
    /// Relay-originated circuit errors invalidate the circuit cache; other
    /// relay errors are attributed in the log but keep the circuit.
    pub async fn note_error(&self, err: &Error) {
        if let Some(status) = err.as_status() {
            if let Some(origin) = status.origin {
                if let Some(circuit) = self.circuits.current().await {
                    if let Some(relay) = circuit.iter().find(|r| r.pubkey == origin) {
                        if status.is_circuit_error() {
                            warn!(
                                "relay-originated circuit error from {} ({}): {}; resetting circuit",
                                relay.addr, relay.pubkey, status
                            );
                            self.circuits.reset().await;
                        } else {
                            warn!("error from {} ({}): {}", relay.addr, relay.pubkey, status);
                        }
                        return;
                    }
                }
            }
        }
        warn!("circuit dial error: {}", err);
    }

    /// Whether a circuit is currently cached.
    pub async fn has_circuit(&self) -> bool {
        self.circuits.current().await.is_some()
    }

    /// Publish the bypass list: contract and directory addresses, plus the
    /// fronting relay's when a circuit exists.
    ///
    /// The list is mirrored to `bypass.json` and pushed to the TUN
    /// helper's control socket when one is configured.  An unreachable
    /// helper is tolerated; it will fetch the file-mirrored state when it
    /// starts.
    pub async fn publish_bypass(&self, fronting: Option<&RelayEntry>) -> Result<(), Error> {
        let sc = self.contract_url()?;
        let ci: Option<ContractInfo> = self.fd.get(filenames::CONTRACT)?;
        let mut ips: Vec<IpAddr> = Vec::new();
        if let Some(h) = sc.host_str() {
            ips.extend(self.cache.get(h).await);
        }
        if let Some(h) = ci.as_ref().and_then(|c| c.directory.endpoint.host_str()) {
            ips.extend(self.cache.get(h).await);
        }
        if let Some(r) = fronting {
            if let Some(h) = r.hostname() {
                ips.extend(self.cache.get(h).await);
            }
        }
        ips.sort();
        ips.dedup();
        self.fd.set(filenames::BYPASS, &ips)?;
        if let Some(socket) = self.config().tun_socket {
            if let Err(e) = bypass::post_bypass(&socket, &ips).await {
                warn!("TUN helper bypass update failed (tolerated): {}", e);
            } else {
                debug!("published {} bypass addresses to TUN helper", ips.len());
            }
        }
        Ok(())
    }

    /// Reload: swap in a new configuration, refresh contract state, and
    /// invalidate the circuit.
    ///
    /// On sync failure the old state stays in place and the reload is
    /// aborted, mirroring startup behaviour.
    pub async fn reload(&self, new_cfg: BrokerConfig) -> Result<(), Error> {
        info!("reloading configuration");
        if let Ok(mut cfg) = self.cfg.lock() {
            *cfg = new_cfg;
        }
        self.sync().await?;
        self.circuits.reset().await;
        Ok(())
    }

    /// Graceful shutdown: remove the daemon pid file.
    pub fn shutdown(&self) {
        info!("gracefully shutting down");
        if let Err(e) = self.fd.del(filenames::PID) {
            warn!("could not remove pid file: {}", e);
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::useless_vec)]
    use super::*;
    use wireleap_crypto::ed25519::gen_keypair;
    use wireleap_proto::Status;
    use wireleap_relay::{RelayRole, RelayVersions};

    /// A broker over a fresh temp directory.
    fn broker(dir: &tempfile::TempDir) -> Broker {
        let fd = FsDir::new(dir.path()).unwrap();
        Broker::new(fd, BrokerConfig::default()).unwrap()
    }

    /// A relay entry for classification tests.
    fn relay(addr: &str) -> RelayEntry {
        RelayEntry {
            addr: format!("wireleap://{}", addr).parse().unwrap(),
            pubkey: gen_keypair().verifying_key().into(),
            role: RelayRole::Backing,
            versions: RelayVersions {
                client_relay: Some(PROTO_VERSION),
            },
        }
    }

    #[tokio::test]
    async fn no_contract_is_config_error() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = broker(&dir);
        assert!(matches!(b.contract_url(), Err(Error::NoContract)));
        assert!(matches!(b.sync().await, Err(Error::NoContract)));
    }

    #[tokio::test]
    async fn circuit_errors_reset_the_cache() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = broker(&dir);
        let r = relay("b1:13490");
        let origin = r.pubkey;
        b.circuits
            .get_or_build_with::<Error, _, _>(|| async move { Ok(vec![r]) })
            .await
            .unwrap();
        assert!(b.has_circuit().await);

        // A non-reset-worthy relay error keeps the circuit.
        let protocol_err = Error::Relay(Status {
            code: 400,
            desc: "bad init".into(),
            origin: Some(origin),
        });
        b.note_error(&protocol_err).await;
        assert!(b.has_circuit().await);

        // A circuit error from a relay on the circuit clears it.
        let circuit_err = Error::Relay(Status::circuit_error("link down", origin));
        b.note_error(&circuit_err).await;
        assert!(!b.has_circuit().await);
    }

    #[tokio::test]
    async fn bypass_is_published_to_the_tun_helper() {
        use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};

        let dir = tempfile::TempDir::new().unwrap();
        let fd = FsDir::new(dir.path()).unwrap();
        fd.set(
            filenames::CONTRACT,
            &serde_json::json!({
                "endpoint": "https://127.0.0.10",
                "pubkey": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA",
                "servicekey": { "duration": 86400 },
                "directory": { "endpoint": "https://127.0.0.11" }
            }),
        )
        .unwrap();

        // Stub TUN helper: accept one control request, record it, say ok.
        let socket = dir.path().join("wireleap_tun.sock");
        let listener = tokio::net::UnixListener::bind(&socket).unwrap();
        let stub = tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            let mut req = Vec::new();
            let mut buf = [0_u8; 1024];
            loop {
                let n = conn.read(&mut buf).await.unwrap();
                req.extend_from_slice(&buf[..n]);
                let text = String::from_utf8_lossy(&req);
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let clen: usize = text
                        .lines()
                        .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:").map(|v| v.trim().parse().unwrap()))
                        .unwrap_or(0);
                    if req.len() >= head_end + 4 + clen {
                        break;
                    }
                }
            }
            conn.write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 15\r\n\r\n{\"status\":\"ok\"}")
                .await
                .unwrap();
            String::from_utf8_lossy(&req).into_owned()
        });

        let mut cfg = BrokerConfig::default();
        cfg.tun_socket = Some(socket);
        let b = Broker::new(fd.clone(), cfg).unwrap();
        // Pin the contract and directory hosts (IP literals resolve to
        // themselves).
        b.dns_cache().cache("127.0.0.10").await.unwrap();
        b.dns_cache().cache("127.0.0.11").await.unwrap();

        b.publish_bypass(None).await.unwrap();

        let req = stub.await.unwrap();
        assert!(req.starts_with("POST /bypass"));
        assert!(req.contains("127.0.0.10"));
        assert!(req.contains("127.0.0.11"));
        // And the file mirror matches.
        let mirrored: Vec<IpAddr> = fd.get(filenames::BYPASS).unwrap().unwrap();
        assert_eq!(mirrored.len(), 2);
    }

    #[tokio::test]
    async fn foreign_origin_does_not_reset() {
        let dir = tempfile::TempDir::new().unwrap();
        let b = broker(&dir);
        let r = relay("b1:13490");
        b.circuits
            .get_or_build_with::<Error, _, _>(|| async move { Ok(vec![r]) })
            .await
            .unwrap();

        let stranger: wireleap_crypto::ed25519::Pubkey =
            gen_keypair().verifying_key().into();
        let err = Error::Relay(Status::circuit_error("who is this", stranger));
        b.note_error(&err).await;
        assert!(b.has_circuit().await);
    }
}
