//! The packet mutation loop.
//!
//! Raw IP packets are read off the TUN device and rewritten so that the
//! kernel's own TCP stack terminates every intercepted flow against a
//! local sink listener, while the payload travels through an h2c tunnel
//! to the broker.  UDP flows are relayed entirely in user space.

use hyper::client::HttpConnector;
use hyper::Client;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpAddress, IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Address, Ipv6Packet, Ipv6Repr,
    TcpPacket, UdpPacket, UdpRepr,
};
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt as _, AsyncWriteExt as _};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use wireleap_h2conn::H2Conn;
use wireleap_proto::headers;

use crate::netsetup::TunAddrs;
use crate::ptable::{Family, NatEntry, PortTable};
use crate::{Error, MAX_PACKET, UDP_BUFSIZE, UDP_IDLE};

/// Pause after a failed sink accept.
const ACCEPT_PAUSE: Duration = Duration::from_secs(1);

/// The splice engine.
#[derive(Debug)]
pub struct Engine {
    /// NAT state.
    table: PortTable,
    /// Device address plan.
    addrs: TunAddrs,
    /// Broker tunnel endpoint (`http://host:port/broker`).
    h2caddr: String,
    /// Shared h2c client.
    client: Client<HttpConnector>,
    /// Queue of packets to write back to the device.
    tun_tx: mpsc::Sender<Vec<u8>>,
    /// Senders feeding the per-flow UDP relay tasks, keyed by NAT port.
    udp_flows: Mutex<HashMap<u16, mpsc::Sender<Vec<u8>>>>,
    /// Per-packet debug logging (WIRELEAP_TUN_DEBUG).
    debug: bool,
}

impl Engine {
    /// Create an engine and the receiving end of its device write queue.
    pub fn new(
        addrs: TunAddrs,
        h2caddr: String,
        debug: bool,
    ) -> (Arc<Self>, mpsc::Receiver<Vec<u8>>) {
        let (tun_tx, tun_rx) = mpsc::channel(1024);
        let engine = Arc::new(Engine {
            table: PortTable::new(),
            addrs,
            h2caddr,
            client: wireleap_h2conn::h2c_client(),
            tun_tx,
            udp_flows: Mutex::new(HashMap::new()),
            debug,
        });
        (engine, tun_rx)
    }

    /// Capture packets from `dev` and proxy them until the process exits.
    pub async fn run(
        self: Arc<Self>,
        dev: tun::AsyncDevice,
        mut tun_rx: mpsc::Receiver<Vec<u8>>,
    ) -> Result<(), Error> {
        info!(
            "capturing packets and proxying via h2c://{}",
            self.h2caddr.trim_start_matches("http://")
        );
        let (mut rd, mut wr) = tokio::io::split(dev);

        // Single writer task serialises device writes.
        tokio::spawn(async move {
            while let Some(pkt) = tun_rx.recv().await {
                if let Err(e) = wr.write_all(&pkt).await {
                    warn!("error writing packet data: {}", e);
                }
            }
        });

        // TCP sinks, v4 and v6.
        let l4 = TcpListener::bind((self.addrs.v4, self.addrs.port)).await?;
        info!("listening on tcp4 socket {}", l4.local_addr()?);
        let l6 = TcpListener::bind((self.addrs.v6, self.addrs.port)).await?;
        info!("listening on tcp6 socket {}", l6.local_addr()?);
        tokio::spawn(Arc::clone(&self).tcpfwd(l4));
        tokio::spawn(Arc::clone(&self).tcpfwd(l6));

        // The packet loop proper.  One task, so per-flow ordering holds.
        let mut buf = vec![0_u8; MAX_PACKET];
        loop {
            let n = rd.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::Device("tun device closed".into()));
            }
            if self.process(&mut buf[..n]) {
                if self.tun_tx.send(buf[..n].to_vec()).await.is_err() {
                    return Err(Error::Device("tun writer gone".into()));
                }
            }
        }
    }

    /// Accept loop for one sink listener.
    async fn tcpfwd(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((conn, _)) => {
                    let this = Arc::clone(&self);
                    tokio::spawn(async move { this.spliceconn(conn).await });
                }
                Err(e) => {
                    warn!(
                        "tcp accept failed: {}, pausing for {:?}",
                        e, ACCEPT_PAUSE
                    );
                    tokio::time::sleep(ACCEPT_PAUSE).await;
                }
            }
        }
    }

    /// Copy one accepted sink connection to the tunnel stored for its
    /// port table entry.
    async fn spliceconn(&self, mut conn: TcpStream) {
        let port = match conn.peer_addr() {
            Ok(a) => a.port(),
            Err(_) => return,
        };
        let Some(nat) = self.table.get(Family::Tcp, port) else {
            if self.debug {
                debug!("no destination known for source port {}, ignoring", port);
            }
            return;
        };
        let Some(mut tunnel) = nat.take_conn().await else {
            if self.debug {
                debug!("no connection found for source port {}, ignoring", port);
            }
            return;
        };
        let res = wireleap_proto::splice(&mut conn, &mut tunnel).await;
        if self.debug {
            debug!("tcp splice terminated, result = {:?}", res);
        }
    }

    /// Rewrite one packet in place.  Returns true if the (mutated) packet
    /// should be written back to the device.
    pub fn process(self: &Arc<Self>, data: &mut [u8]) -> bool {
        match data.first().map(|b| b >> 4) {
            Some(4) => self.process_v4(data),
            Some(6) => self.process_v6(data),
            _ => false,
        }
    }

    /// Handle an IPv4 packet.
    fn process_v4(self: &Arc<Self>, data: &mut [u8]) -> bool {
        let Ok(mut ip) = Ipv4Packet::new_checked(data) else {
            debug!("error while decoding v4 packet");
            return false;
        };
        let src = ip4(ip.src_addr());
        let dst = ip4(ip.dst_addr());
        if src != self.addrs.v4 {
            // Only packets sourced from our side of the /31 are of
            // interest.
            return false;
        }
        match ip.next_header() {
            IpProtocol::Tcp => {
                let Some(rw) = self.nat_tcp(IpAddr::V4(src), IpAddr::V4(dst), ip.payload_mut())
                else {
                    return false;
                };
                let (new_src, new_dst) = match rw {
                    (IpAddr::V4(s), IpAddr::V4(d)) => (s, d),
                    (s, d) => {
                        warn!(
                            "IP family mismatch after NAT: src {} dst {}, dropping",
                            s, d
                        );
                        return false;
                    }
                };
                ip.set_src_addr(smol4(new_src));
                ip.set_dst_addr(smol4(new_dst));
                {
                    let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
                    tcp.fill_checksum(
                        &IpAddress::Ipv4(smol4(new_src)),
                        &IpAddress::Ipv4(smol4(new_dst)),
                    );
                }
                ip.fill_checksum();
                true
            }
            IpProtocol::Udp => {
                self.nat_udp(IpAddr::V4(src), IpAddr::V4(dst), ip.payload_mut());
                false
            }
            _ => false,
        }
    }

    /// Handle an IPv6 packet.
    fn process_v6(self: &Arc<Self>, data: &mut [u8]) -> bool {
        let Ok(mut ip) = Ipv6Packet::new_checked(data) else {
            debug!("error while decoding v6 packet");
            return false;
        };
        let src = ip6(ip.src_addr());
        let dst = ip6(ip.dst_addr());
        if src != self.addrs.v6 {
            return false;
        }
        match ip.next_header() {
            IpProtocol::Tcp => {
                let Some(rw) = self.nat_tcp(IpAddr::V6(src), IpAddr::V6(dst), ip.payload_mut())
                else {
                    return false;
                };
                let (new_src, new_dst) = match rw {
                    (IpAddr::V6(s), IpAddr::V6(d)) => (s, d),
                    (s, d) => {
                        warn!(
                            "IP family mismatch after NAT: src {} dst {}, dropping",
                            s, d
                        );
                        return false;
                    }
                };
                ip.set_src_addr(smol6(new_src));
                ip.set_dst_addr(smol6(new_dst));
                {
                    let mut tcp = TcpPacket::new_unchecked(ip.payload_mut());
                    tcp.fill_checksum(
                        &IpAddress::Ipv6(smol6(new_src)),
                        &IpAddress::Ipv6(smol6(new_dst)),
                    );
                }
                true
            }
            IpProtocol::Udp => {
                self.nat_udp(IpAddr::V6(src), IpAddr::V6(dst), ip.payload_mut());
                false
            }
            _ => false,
        }
    }

    /// NAT one TCP segment.
    ///
    /// Mutates the TCP ports in `payload` and returns the new IP address
    /// pair to install, or `None` to drop the packet.  Checksums are the
    /// caller's job (they need the final addresses).
    fn nat_tcp(
        self: &Arc<Self>,
        src: IpAddr,
        dst: IpAddr,
        payload: &mut [u8],
    ) -> Option<(IpAddr, IpAddr)> {
        let tun_ip = src; // == our tun address, by the caller's filter
        let Ok(mut tcp) = TcpPacket::new_checked(payload) else {
            debug!("error while decoding tcp segment");
            return None;
        };
        if tcp.src_port() == self.addrs.port {
            // Response half: sink socket back to the application.
            let nat = self.table.get(Family::Tcp, tcp.dst_port())?;
            tcp.set_src_port(nat.dst_port);
            if tcp.fin() || tcp.rst() {
                // Flow is over; forget it.
                self.table.del(Family::Tcp, tcp.dst_port());
            }
            Some((nat.dst_ip, tun_ip))
        } else {
            // Outbound half: application towards some destination.
            let natport = tcp.src_port();
            if self.table.get(Family::Tcp, natport).is_none() {
                let entry = NatEntry::new(src, dst, natport, tcp.dst_port());
                self.table.set(Family::Tcp, natport, Arc::clone(&entry));
                self.spawn_tcp_dial(entry, natport);
            }
            tcp.set_dst_port(self.addrs.port);
            let peer = match tun_ip {
                IpAddr::V4(_) => IpAddr::V4(self.addrs.peer4),
                IpAddr::V6(_) => IpAddr::V6(self.addrs.peer6),
            };
            Some((peer, tun_ip))
        }
    }

    /// Dial the broker for a new TCP flow in the background; the packet
    /// loop never blocks on it.
    fn spawn_tcp_dial(self: &Arc<Self>, entry: Arc<NatEntry>, natport: u16) {
        let client = self.client.clone();
        let h2caddr = self.h2caddr.clone();
        let target = entry.target();
        let table_entry = Arc::clone(&entry);
        let this = Arc::clone(self);
        tokio::spawn(async move {
            match H2Conn::connect(
                &client,
                &h2caddr,
                &[
                    (headers::DIAL_PROTOCOL, "tcp"),
                    (headers::DIAL_TARGET, &target),
                    (headers::FORWARDER, "tun"),
                ],
            )
            .await
            {
                Ok(conn) => table_entry.publish(conn),
                Err(e) => {
                    warn!("error wireleap-dialing {}: {}", target, e);
                    this.table.del(Family::Tcp, natport);
                    table_entry.fail();
                }
            }
        });
    }

    /// NAT one UDP datagram into its relay flow, creating the flow on
    /// first sight.
    fn nat_udp(self: &Arc<Self>, src: IpAddr, dst: IpAddr, payload: &mut [u8]) {
        let Ok(udp) = UdpPacket::new_checked(&*payload) else {
            debug!("error while decoding udp datagram");
            return;
        };
        let natport = udp.src_port();
        let data = udp.payload().to_vec();

        let tx = {
            let mut flows = match self.udp_flows.lock() {
                Ok(f) => f,
                Err(_) => return,
            };
            match flows.get(&natport) {
                Some(tx) => tx.clone(),
                None => {
                    let entry = NatEntry::new(src, dst, natport, udp.dst_port());
                    self.table.set(Family::Udp, natport, Arc::clone(&entry));
                    let (tx, rx) = mpsc::channel(64);
                    flows.insert(natport, tx.clone());
                    tokio::spawn(Arc::clone(self).udp_flow(entry, rx, natport));
                    tx
                }
            }
        };
        if tx.try_send(data).is_err() && self.debug {
            debug!("udp flow {} backlogged or gone, dropping datagram", natport);
        }
    }

    /// One UDP relay flow: tunnel to the broker, with return datagrams
    /// synthesised back onto the device.
    async fn udp_flow(
        self: Arc<Self>,
        nat: Arc<NatEntry>,
        mut rx: mpsc::Receiver<Vec<u8>>,
        natport: u16,
    ) {
        let target = nat.target();
        let tunnel = match H2Conn::connect(
            &self.client,
            &self.h2caddr,
            &[
                (headers::DIAL_PROTOCOL, "udp"),
                (headers::DIAL_TARGET, &target),
                (headers::FORWARDER, "tun"),
            ],
        )
        .await
        {
            Ok(t) => t,
            Err(e) => {
                warn!("error udp wireleap-dialing {}: {}", target, e);
                self.cleanup_udp(natport);
                return;
            }
        };
        let (mut rd, mut wr) = tokio::io::split(tunnel);

        // Writer: datagrams from the packet loop into the tunnel.
        let writer = tokio::spawn(async move {
            while let Some(data) = rx.recv().await {
                match tokio::time::timeout(UDP_IDLE, wr.write_all(&data)).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        });

        // Reader: tunnel datagrams synthesised into return packets.
        let mut buf = vec![0_u8; UDP_BUFSIZE];
        loop {
            let n = match tokio::time::timeout(UDP_IDLE, rd.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => n,
                Ok(Err(_)) => break,
            };
            let Some(pkt) = build_udp_reply(&nat, &buf[..n]) else {
                warn!("could not serialize udp reply for {}", target);
                break;
            };
            if self.tun_tx.send(pkt).await.is_err() {
                break;
            }
        }
        writer.abort();
        self.cleanup_udp(natport);
    }

    /// Drop all state for a UDP flow.
    fn cleanup_udp(&self, natport: u16) {
        self.table.del(Family::Udp, natport);
        if let Ok(mut flows) = self.udp_flows.lock() {
            flows.remove(&natport);
        }
    }

}

/// Convert smoltcp v4 address to std.
fn ip4(a: Ipv4Address) -> Ipv4Addr {
    let b = a.as_bytes();
    Ipv4Addr::new(b[0], b[1], b[2], b[3])
}

/// Convert std v4 address to smoltcp.
fn smol4(ip: Ipv4Addr) -> Ipv4Address {
    Ipv4Address::from_bytes(&ip.octets())
}

/// Convert smoltcp v6 address to std.
fn ip6(a: Ipv6Address) -> Ipv6Addr {
    let mut o = [0_u8; 16];
    o.copy_from_slice(a.as_bytes());
    Ipv6Addr::from(o)
}

/// Convert std v6 address to smoltcp.
fn smol6(ip: Ipv6Addr) -> Ipv6Address {
    Ipv6Address::from_bytes(&ip.octets())
}

/// Synthesise a return packet for a UDP flow: from the flow's original
/// destination back to its original source.
fn build_udp_reply(nat: &NatEntry, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_repr = UdpRepr {
        src_port: nat.dst_port,
        dst_port: nat.src_port,
    };
    let caps = ChecksumCapabilities::default();
    match (nat.dst_ip, nat.src_ip) {
        (IpAddr::V4(reply_src), IpAddr::V4(reply_dst)) => {
            let ip_repr = Ipv4Repr {
                src_addr: smol4(reply_src),
                dst_addr: smol4(reply_dst),
                next_header: IpProtocol::Udp,
                payload_len: udp_repr.header_len() + payload.len(),
                hop_limit: 64,
            };
            let mut buf = vec![0_u8; ip_repr.buffer_len() + ip_repr.payload_len];
            let mut ip = Ipv4Packet::new_unchecked(&mut buf);
            ip_repr.emit(&mut ip, &caps);
            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp_repr.emit(
                &mut udp,
                &IpAddress::Ipv4(smol4(reply_src)),
                &IpAddress::Ipv4(smol4(reply_dst)),
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            Some(buf)
        }
        (IpAddr::V6(reply_src), IpAddr::V6(reply_dst)) => {
            let ip_repr = Ipv6Repr {
                src_addr: smol6(reply_src),
                dst_addr: smol6(reply_dst),
                next_header: IpProtocol::Udp,
                payload_len: udp_repr.header_len() + payload.len(),
                hop_limit: 64,
            };
            let mut buf = vec![0_u8; ip_repr.buffer_len() + ip_repr.payload_len];
            let mut ip = Ipv6Packet::new_unchecked(&mut buf);
            ip_repr.emit(&mut ip);
            let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
            udp_repr.emit(
                &mut udp,
                &IpAddress::Ipv6(smol6(reply_src)),
                &IpAddress::Ipv6(smol6(reply_dst)),
                payload.len(),
                |b| b.copy_from_slice(payload),
                &caps,
            );
            Some(buf)
        }
        (s, d) => {
            warn!("IP family mismatch in udp reply: src {} dst {}", s, d);
            None
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::useless_vec)]
    use super::*;

    /// TCP flag selection for test packets.
    enum Flag {
        Syn,
        Fin,
    }

    /// An engine over the stock tun address plan.
    fn engine() -> Arc<Engine> {
        let addrs = TunAddrs::from_tunaddr("10.13.49.0:13493").unwrap();
        let (e, _rx) = Engine::new(addrs, "http://127.0.0.1:13492/broker".into(), false);
        e
    }

    /// Build a v4 TCP packet with empty payload.
    fn tcp4(
        src: Ipv4Addr,
        sport: u16,
        dst: Ipv4Addr,
        dport: u16,
        flag: Flag,
    ) -> Vec<u8> {
        let mut buf = vec![0_u8; 20 + 20];
        {
            let mut ip = Ipv4Packet::new_unchecked(&mut buf[..]);
            ip.set_version(4);
            ip.set_header_len(20);
            ip.set_total_len(40);
            ip.set_hop_limit(64);
            ip.set_next_header(IpProtocol::Tcp);
            ip.set_src_addr(smol4(src));
            ip.set_dst_addr(smol4(dst));
            ip.fill_checksum();
        }
        {
            let mut tcp = TcpPacket::new_unchecked(&mut buf[20..]);
            tcp.set_src_port(sport);
            tcp.set_dst_port(dport);
            tcp.set_header_len(20);
            match flag {
                Flag::Syn => tcp.set_syn(true),
                Flag::Fin => tcp.set_fin(true),
            }
            tcp.fill_checksum(&IpAddress::Ipv4(smol4(src)), &IpAddress::Ipv4(smol4(dst)));
        }
        buf
    }

    /// Parse (src, sport, dst, dport) out of a rewritten v4 TCP packet.
    fn dissect4(buf: &[u8]) -> (Ipv4Addr, u16, Ipv4Addr, u16) {
        let ip = Ipv4Packet::new_checked(buf).unwrap();
        let tcp = TcpPacket::new_checked(ip.payload()).unwrap();
        (
            ip4(ip.src_addr()),
            tcp.src_port(),
            ip4(ip.dst_addr()),
            tcp.dst_port(),
        )
    }

    #[tokio::test]
    async fn tcp_nat_lifecycle() {
        let e = engine();
        let tun: Ipv4Addr = "10.13.49.0".parse().unwrap();
        let peer: Ipv4Addr = "10.13.49.1".parse().unwrap();
        let remote: Ipv4Addr = "1.2.3.4".parse().unwrap();

        // Outbound SYN from the application.
        let mut syn = tcp4(tun, 54321, remote, 443, Flag::Syn);
        assert!(e.process(&mut syn));
        let nat = e.table.get(Family::Tcp, 54321).expect("nat entry");
        assert_eq!(nat.dst_ip, IpAddr::V4(remote));
        assert_eq!(nat.dst_port, 443);
        // The packet now heads for the sink with the spoofed peer source.
        assert_eq!(dissect4(&syn), (peer, 54321, tun, 13493));

        // Response half from the sink socket back to the application.
        let mut resp = tcp4(tun, 13493, peer, 54321, Flag::Syn);
        assert!(e.process(&mut resp));
        assert_eq!(dissect4(&resp), (remote, 443, tun, 54321));
        // Still alive until the flow ends.
        assert!(e.table.get(Family::Tcp, 54321).is_some());

        // FIN tears the entry down.
        let mut fin = tcp4(tun, 13493, peer, 54321, Flag::Fin);
        assert!(e.process(&mut fin));
        assert!(e.table.get(Family::Tcp, 54321).is_none());
    }

    #[tokio::test]
    async fn response_without_entry_is_dropped() {
        let e = engine();
        let tun: Ipv4Addr = "10.13.49.0".parse().unwrap();
        let peer: Ipv4Addr = "10.13.49.1".parse().unwrap();
        let mut orphan = tcp4(tun, 13493, peer, 9999, Flag::Syn);
        assert!(!e.process(&mut orphan));
    }

    #[tokio::test]
    async fn foreign_source_is_ignored() {
        let e = engine();
        let other: Ipv4Addr = "192.0.2.5".parse().unwrap();
        let remote: Ipv4Addr = "1.2.3.4".parse().unwrap();
        let mut pkt = tcp4(other, 1234, remote, 80, Flag::Syn);
        assert!(!e.process(&mut pkt));
        assert!(e.table.get(Family::Tcp, 1234).is_none());
    }

    #[tokio::test]
    async fn non_ip_junk_is_dropped() {
        let e = engine();
        let mut junk = vec![0xff_u8; 40];
        assert!(!e.process(&mut junk));
        let mut empty: Vec<u8> = Vec::new();
        assert!(!e.process(&mut empty));
    }

    #[test]
    fn udp_reply_packets_swap_roles() {
        let nat = NatEntry::new(
            "10.13.49.0".parse().unwrap(),
            "9.9.9.9".parse().unwrap(),
            40000,
            53,
        );
        let pkt = build_udp_reply(&nat, b"answer").unwrap();
        let ip = Ipv4Packet::new_checked(&pkt[..]).unwrap();
        assert_eq!(ip4(ip.src_addr()), "9.9.9.9".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip4(ip.dst_addr()), "10.13.49.0".parse::<Ipv4Addr>().unwrap());
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), 53);
        assert_eq!(udp.dst_port(), 40000);
        assert_eq!(udp.payload(), b"answer");
    }

    #[test]
    fn udp_reply_refuses_family_mismatch() {
        let nat = NatEntry::new(
            "10.13.49.0".parse().unwrap(),
            "2001:db8::1".parse().unwrap(),
            40000,
            53,
        );
        assert!(build_udp_reply(&nat, b"x").is_none());
    }
}
