//! The per-connection circuit dialer.

use std::time::Duration;
use tokio::net::TcpStream;
use tracing::debug;
use url::Url;
use wireleap_dnscache::DnsCache;
use wireleap_proto::{Init, Status};
use wireleap_relay::RelayEntry;
use wireleap_sharetoken::{ServiceKey, Sharetoken};

use crate::Error;

/// Progressively build a connection through `circuit` to `target`.
///
/// One TCP connection is opened to the first relay; each subsequent hop is
/// requested with an `Init` frame carrying a freshly minted sharetoken.
/// Hop-level failures are wrapped as 502 `Status` errors tagged with the
/// public key of the relay where they originated.
///
/// `forced` overrides the protocol of the terminal hop (the
/// `WIRELEAP_TARGET_PROTOCOL` mechanism); intermediate hops always speak
/// plain `tcp`.
pub(crate) async fn circuit_dial(
    cache: &DnsCache,
    timeout: Duration,
    sk: &ServiceKey,
    circuit: &[RelayEntry],
    protocol: &str,
    target: &str,
    forced: Option<&str>,
) -> Result<TcpStream, Error> {
    let first = circuit.first().ok_or(Error::Config("empty circuit"))?;
    debug!(
        "connecting to circuit link: {:?} {} {}",
        first.role, first.addr, first.pubkey
    );
    let mut conn = dial_first_hop(cache, timeout, first).await?;

    for i in 1..circuit.len() {
        let link = &circuit[i];
        debug!(
            "connecting to circuit link: {:?} {} {}",
            link.role, link.addr, link.pubkey
        );
        let st = Sharetoken::new(sk, circuit[i - 1].pubkey)?;
        let init = Init::connect("tcp", link.addr.clone(), st);
        if let Err(e) = init.write_to(&mut conn).await {
            return Err(Status::circuit_error(e.to_string(), link.pubkey).into());
        }
    }

    debug!("now connecting to target: {}", target);
    let last = circuit.last().ok_or(Error::Config("empty circuit"))?;
    let st = Sharetoken::new(sk, last.pubkey)?;
    let remote: Url = format!("target://{}", target)
        .parse()
        .map_err(|_| Error::Config("unparseable dial target"))?;
    let target_protocol = forced.unwrap_or(protocol);
    let init = Init::connect(target_protocol, remote, st);
    init.write_to(&mut conn).await?;
    Ok(conn)
}

/// Open the TCP connection to the first relay, resolving its hostname
/// through the pinning cache.
async fn dial_first_hop(
    cache: &DnsCache,
    timeout: Duration,
    first: &RelayEntry,
) -> Result<TcpStream, Error> {
    let fail = |desc: String| Status::circuit_error(desc, first.pubkey);
    let host = first
        .hostname()
        .ok_or_else(|| fail(format!("relay address {} has no host", first.addr)))?;
    let port = first
        .addr
        .port()
        .ok_or_else(|| fail(format!("relay address {} has no port", first.addr)))?;
    let ip = cache
        .covered_lookup(host)
        .await
        .map_err(|e| fail(e.to_string()))?;
    match tokio::time::timeout(timeout, TcpStream::connect((ip, port))).await {
        Ok(Ok(conn)) => Ok(conn),
        Ok(Err(e)) => Err(fail(e.to_string()).into()),
        Err(_) => Err(fail(format!("dial to {} timed out", first.addr)).into()),
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::useless_vec)]
    use super::*;
    use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _, BufReader};
    use wireleap_crypto::ed25519::{gen_keypair, Pubkey};
    use wireleap_relay::{RelayRole, RelayVersions};
    use wireleap_sharetoken::SkContract;

    /// An activated servicekey.
    fn sk() -> ServiceKey {
        let mut sk = ServiceKey::new();
        sk.contract = Some(SkContract {
            pubkey: gen_keypair().verifying_key().into(),
            settlement_open: i64::MAX,
            settlement_close: i64::MAX,
        });
        sk
    }

    /// A relay entry pointing at a local listener.
    fn relay(addr: std::net::SocketAddr, role: RelayRole, pubkey: Pubkey) -> RelayEntry {
        RelayEntry {
            addr: format!("wireleap://{}", addr).parse().unwrap(),
            pubkey,
            role,
            versions: RelayVersions {
                client_relay: Some(wireleap_proto::PROTO_VERSION),
            },
        }
    }

    #[tokio::test]
    async fn single_hop_dial_mints_token_for_backing() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let backing_key: Pubkey = gen_keypair().verifying_key().into();
        let circuit = vec![relay(addr, RelayRole::Backing, backing_key)];

        // Stub relay: read the terminal init frame, then echo one byte.
        let stub = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut rd = BufReader::new(conn);
            let init = Init::read_from(&mut rd).await.unwrap();
            assert_eq!(init.command, "CONNECT");
            assert_eq!(init.protocol, "tcp");
            assert_eq!(init.remote.as_str(), "target://example.com:80");
            assert_eq!(init.token.relay_pubkey, backing_key);
            init.token.verify().unwrap();
            let mut conn = rd.into_inner();
            let mut b = [0_u8; 1];
            conn.read_exact(&mut b).await.unwrap();
            conn.write_all(&b).await.unwrap();
        });

        let cache = DnsCache::new();
        let mut conn = circuit_dial(
            &cache,
            Duration::from_secs(2),
            &sk(),
            &circuit,
            "tcp",
            "example.com:80",
            None,
        )
        .await
        .unwrap();
        conn.write_all(b"x").await.unwrap();
        let mut b = [0_u8; 1];
        conn.read_exact(&mut b).await.unwrap();
        assert_eq!(&b, b"x");
        stub.await.unwrap();
    }

    #[tokio::test]
    async fn two_hop_dial_orders_tokens_and_forces_protocol() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let fronting_key: Pubkey = gen_keypair().verifying_key().into();
        let backing_key: Pubkey = gen_keypair().verifying_key().into();
        let backing_addr: std::net::SocketAddr = "127.0.0.9:13490".parse().unwrap();
        let circuit = vec![
            relay(addr, RelayRole::Fronting, fronting_key),
            relay(backing_addr, RelayRole::Backing, backing_key),
        ];

        let stub = tokio::spawn(async move {
            let (conn, _) = listener.accept().await.unwrap();
            let mut rd = BufReader::new(conn);
            // Hop frame: token for the fronting relay, remote is the
            // backing relay, protocol plain tcp.
            let hop = Init::read_from(&mut rd).await.unwrap();
            assert_eq!(hop.protocol, "tcp");
            assert_eq!(hop.token.relay_pubkey, fronting_key);
            assert_eq!(
                hop.remote.as_str(),
                format!("wireleap://{}", backing_addr)
            );
            // Terminal frame: token for the backing relay, forced family.
            let term = Init::read_from(&mut rd).await.unwrap();
            assert_eq!(term.protocol, "tcp4");
            assert_eq!(term.token.relay_pubkey, backing_key);
            assert_eq!(term.remote.as_str(), "target://v6.example:80");
        });

        let cache = DnsCache::new();
        let _conn = circuit_dial(
            &cache,
            Duration::from_secs(2),
            &sk(),
            &circuit,
            "tcp",
            "v6.example:80",
            Some("tcp4"),
        )
        .await
        .unwrap();
        stub.await.unwrap();
    }

    #[tokio::test]
    async fn unreachable_first_hop_reports_its_pubkey() {
        // A listener we immediately close gives us a dead port.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let key: Pubkey = gen_keypair().verifying_key().into();
        let circuit = vec![relay(addr, RelayRole::Backing, key)];

        let cache = DnsCache::new();
        let err = circuit_dial(
            &cache,
            Duration::from_secs(1),
            &sk(),
            &circuit,
            "tcp",
            "example.com:80",
            None,
        )
        .await
        .unwrap_err();
        let status = err.as_status().expect("expected a status error");
        assert_eq!(status.code, 502);
        assert_eq!(status.origin, Some(key));
    }
}
