//! The SOCKS-to-broker forwarder.

use hyper::client::HttpConnector;
use hyper::Client;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use wireleap_h2conn::H2Conn;
use wireleap_proto::{headers, splice};

use crate::proto::{
    compose_udp, dissect_udp, handshake, write_status, Addr, SocksStatus, CONNECT, UDP_ASSOC,
};
use crate::{UDP_BUFSIZE, UDP_IDLE};

/// Pause after a failed accept, to avoid log spam under fd exhaustion.
const ACCEPT_PAUSE: Duration = Duration::from_secs(1);

/// Open one tunnel to the broker.
async fn dial(
    client: &Client<HttpConnector>,
    h2caddr: &str,
    protocol: &str,
    target: &str,
) -> Result<H2Conn, wireleap_h2conn::Error> {
    H2Conn::connect(
        client,
        h2caddr,
        &[
            (headers::DIAL_PROTOCOL, protocol),
            (headers::DIAL_TARGET, target),
            (headers::FORWARDER, "socks"),
        ],
    )
    .await
}

/// Listen for SOCKSv5 TCP connections and UDP datagrams on `addr`,
/// forwarding everything through the broker at `h2caddr`.
///
/// Runs until the process exits.
pub async fn listen_socks(addr: SocketAddr, h2caddr: String) -> std::io::Result<()> {
    let udp = Arc::new(UdpSocket::bind(addr).await?);
    let tcp = TcpListener::bind(addr).await?;
    let client = wireleap_h2conn::h2c_client();
    info!("listening for SOCKSv5 connections on {}", addr);

    let udp_addr = udp.local_addr()?;
    tokio::spawn(proxy_udp(
        Arc::clone(&udp),
        client.clone(),
        h2caddr.clone(),
    ));
    proxy_tcp(tcp, client, h2caddr, udp_addr).await;
    Ok(())
}

/// Accept loop for the TCP side.
async fn proxy_tcp(
    listener: TcpListener,
    client: Client<HttpConnector>,
    h2caddr: String,
    udp_addr: SocketAddr,
) {
    loop {
        let (conn, peer) = match listener.accept().await {
            Ok(x) => x,
            Err(e) => {
                warn!(
                    "SOCKSv5 tcp socket accept error: {}, pausing for {:?}",
                    e, ACCEPT_PAUSE
                );
                tokio::time::sleep(ACCEPT_PAUSE).await;
                continue;
            }
        };
        debug!("SOCKSv5 tcp socket accepted: {}", peer);
        let client = client.clone();
        let h2caddr = h2caddr.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_tcp(conn, client, h2caddr, udp_addr).await {
                debug!("SOCKSv5 connection from {} ended: {}", peer, e);
            }
        });
    }
}

/// Serve one accepted TCP connection.
async fn handle_tcp(
    mut conn: TcpStream,
    client: Client<HttpConnector>,
    h2caddr: String,
    udp_addr: SocketAddr,
) -> Result<(), crate::Error> {
    let local = conn.local_addr()?;
    let (cmd, target) = handshake(&mut conn, local).await?;
    match cmd {
        CONNECT => {
            let mut tunnel = match dial(&client, &h2caddr, "tcp", &target).await {
                Ok(t) => t,
                Err(e) => {
                    warn!("error dialing tcp through the circuit: {}", e);
                    write_status(
                        &mut conn,
                        SocksStatus::GeneralFailure,
                        Addr::from_socketaddr(local),
                    )
                    .await?;
                    return Ok(());
                }
            };
            write_status(&mut conn, SocksStatus::Ok, Addr::from_socketaddr(local)).await?;
            if let Err(e) = splice(&mut conn, &mut tunnel).await {
                debug!("error splicing connection to {}: {}", target, e);
            }
            Ok(())
        }
        UDP_ASSOC => {
            write_status(&mut conn, SocksStatus::Ok, Addr::from_socketaddr(udp_addr)).await?;
            // The control connection is the association's liveness token;
            // hold it open until the client goes away.
            let mut buf = [0_u8; 64];
            loop {
                match tokio::io::AsyncReadExt::read(&mut conn, &mut buf).await {
                    Ok(0) | Err(_) => return Ok(()),
                    Ok(_) => {}
                }
            }
        }
        other => Err(crate::Error::BadCommand(other)),
    }
}

/// Key identifying one UDP flow: application source and wire destination.
type FlowKey = (SocketAddr, Addr);

/// Relay loop for the UDP side.
///
/// The first datagram of a `(source, destination)` pair provisions a
/// `udp` tunnel through the broker; later datagrams append to it.  Return
/// datagrams are re-wrapped with the original destination as source.
async fn proxy_udp(udp: Arc<UdpSocket>, client: Client<HttpConnector>, h2caddr: String) {
    let flows: Arc<Mutex<HashMap<FlowKey, mpsc::Sender<Vec<u8>>>>> =
        Arc::new(Mutex::new(HashMap::new()));
    let mut buf = [0_u8; UDP_BUFSIZE];
    loop {
        let (n, src) = match udp.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(e) => {
                warn!("error while reading udp packet: {}", e);
                continue;
            }
        };
        let (dst, payload) = match dissect_udp(&buf[..n]) {
            Ok(x) => x,
            Err(e) => {
                warn!("SOCKSv5 failed dissecting UDP packet from {}: {}", src, e);
                continue;
            }
        };
        let key = (src, dst.clone());
        let tx = {
            let mut map = flows.lock().await;
            match map.get(&key) {
                Some(tx) => tx.clone(),
                None => {
                    let (tx, rx) = mpsc::channel(64);
                    map.insert(key.clone(), tx.clone());
                    tokio::spawn(udp_flow(
                        Arc::clone(&udp),
                        client.clone(),
                        h2caddr.clone(),
                        src,
                        dst.clone(),
                        rx,
                        Arc::clone(&flows),
                        key.clone(),
                    ));
                    tx
                }
            }
        };
        if tx.send(payload.to_vec()).await.is_err() {
            // Flow task is gone; drop the stale entry so the next
            // datagram re-provisions.
            flows.lock().await.remove(&key);
        }
    }
}

/// One UDP flow: a tunnel to the broker plus its return path.
#[allow(clippy::too_many_arguments)] // spawn-site plumbing
async fn udp_flow(
    udp: Arc<UdpSocket>,
    client: Client<HttpConnector>,
    h2caddr: String,
    src: SocketAddr,
    dst: Addr,
    mut rx: mpsc::Receiver<Vec<u8>>,
    flows: Arc<Mutex<HashMap<FlowKey, mpsc::Sender<Vec<u8>>>>>,
    key: FlowKey,
) {
    let target = dst.to_target();
    let tunnel = match dial(&client, &h2caddr, "udp", &target).await {
        Ok(t) => t,
        Err(e) => {
            warn!(
                "error dialing udp {}->{} through the circuit: {}",
                src, target, e
            );
            flows.lock().await.remove(&key);
            return;
        }
    };
    let (mut rd, mut wr) = tokio::io::split(tunnel);

    // Writer half: datagrams from the application into the tunnel.
    let writer = tokio::spawn(async move {
        while let Some(payload) = rx.recv().await {
            if let Err(e) = tokio::io::AsyncWriteExt::write_all(&mut wr, &payload).await {
                debug!("error writing udp tunnel: {}", e);
                break;
            }
        }
    });

    // Reader half: tunnel data back to the application, 10 s idle limit.
    let mut obuf = [0_u8; UDP_BUFSIZE];
    loop {
        let n = match tokio::time::timeout(
            UDP_IDLE,
            tokio::io::AsyncReadExt::read(&mut rd, &mut obuf),
        )
        .await
        {
            Ok(Ok(0)) | Err(_) => break, // EOF or idle
            Ok(Ok(n)) => n,
            Ok(Err(e)) => {
                debug!("error reading {}<-{} via udp: {}", src, target, e);
                break;
            }
        };
        let wrapped = compose_udp(&dst, &obuf[..n]);
        if let Err(e) = udp.send_to(&wrapped, src).await {
            debug!("error writing {}<-{} via udp: {}", src, target, e);
            break;
        }
    }
    writer.abort();
    flows.lock().await.remove(&key);
}
