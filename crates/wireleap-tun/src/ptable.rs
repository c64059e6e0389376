//! The NAT port table.
//!
//! Flows are keyed by `(family, source port)`.  The table is a fixed
//! 2 × 65536 array so the packet loop indexes instead of hashing; each
//! cell is individually locked, and the lock is only ever held for the
//! duration of a pointer swap.

use std::net::IpAddr;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;
use wireleap_h2conn::H2Conn;

/// Number of ports per family.
const NPORTS: usize = 65536;

/// Transport family of a NAT entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Family {
    Tcp,
    Udp,
}

/// How long a sink connection waits for the async tunnel dial to land.
const CONN_WAIT: Duration = Duration::from_secs(10);

/// One NATted flow.
#[derive(Debug)]
pub struct NatEntry {
    /// Original source address of the flow.
    pub src_ip: IpAddr,
    /// Original destination address of the flow.
    pub dst_ip: IpAddr,
    /// Original source port (also the NAT key).
    pub src_port: u16,
    /// Original destination port.
    pub dst_port: u16,
    /// The tunnel, once the async dial resolves.  `None` both before the
    /// dial and after a failed dial; `waiters` is notified either way.
    conn: Mutex<Option<H2Conn>>,
    /// Set when the dial has concluded (successfully or not).
    done: Mutex<bool>,
    /// Wakes sink connections parked in [`NatEntry::take_conn`].
    waiters: Notify,
}

impl NatEntry {
    /// Create an entry for a new flow; the tunnel is not yet dialed.
    pub fn new(src_ip: IpAddr, dst_ip: IpAddr, src_port: u16, dst_port: u16) -> Arc<Self> {
        Arc::new(NatEntry {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            conn: Mutex::new(None),
            done: Mutex::new(false),
            waiters: Notify::new(),
        })
    }

    /// The original destination as a dial target.
    pub fn target(&self) -> String {
        format!("{}:{}", self.dst_ip, self.dst_port)
    }

    /// Publish the dialed tunnel and wake waiters.
    pub fn publish(&self, conn: H2Conn) {
        if let (Ok(mut c), Ok(mut d)) = (self.conn.lock(), self.done.lock()) {
            *c = Some(conn);
            *d = true;
        }
        self.waiters.notify_waiters();
    }

    /// Mark the dial as failed and wake waiters.
    pub fn fail(&self) {
        if let Ok(mut d) = self.done.lock() {
            *d = true;
        }
        self.waiters.notify_waiters();
    }

    /// Wait for the tunnel and take ownership of it.
    ///
    /// Returns `None` if the dial failed, the connection was already
    /// claimed, or nothing arrived within the wait budget.
    pub async fn take_conn(&self) -> Option<H2Conn> {
        let deadline = tokio::time::Instant::now() + CONN_WAIT;
        loop {
            let notified = self.waiters.notified();
            {
                let done = self.done.lock().ok()?;
                if *done {
                    return self.conn.lock().ok()?.take();
                }
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                debug!("timed out waiting for tunnel of port {}", self.src_port);
                return None;
            }
        }
    }
}

/// The fixed-size NAT table.
pub struct PortTable {
    /// TCP cells indexed by source port.
    tcp: Vec<RwLock<Option<Arc<NatEntry>>>>,
    /// UDP cells indexed by source port.
    udp: Vec<RwLock<Option<Arc<NatEntry>>>>,
}

impl std::fmt::Debug for PortTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PortTable").finish_non_exhaustive()
    }
}

impl Default for PortTable {
    fn default() -> Self {
        Self::new()
    }
}

impl PortTable {
    /// Create an empty table.
    pub fn new() -> Self {
        let mut tcp = Vec::with_capacity(NPORTS);
        let mut udp = Vec::with_capacity(NPORTS);
        for _ in 0..NPORTS {
            tcp.push(RwLock::new(None));
            udp.push(RwLock::new(None));
        }
        PortTable { tcp, udp }
    }

    /// Select the cell array for `family`.
    fn cells(&self, family: Family) -> &[RwLock<Option<Arc<NatEntry>>>] {
        match family {
            Family::Tcp => &self.tcp,
            Family::Udp => &self.udp,
        }
    }

    /// Look up the entry at `(family, port)`.
    pub fn get(&self, family: Family, port: u16) -> Option<Arc<NatEntry>> {
        self.cells(family)[port as usize]
            .read()
            .ok()
            .and_then(|c| c.clone())
    }

    /// Install an entry at `(family, port)`.
    pub fn set(&self, family: Family, port: u16, entry: Arc<NatEntry>) {
        if let Ok(mut c) = self.cells(family)[port as usize].write() {
            *c = Some(entry);
        }
    }

    /// Remove the entry at `(family, port)`.
    pub fn del(&self, family: Family, port: u16) {
        if let Ok(mut c) = self.cells(family)[port as usize].write() {
            *c = None;
        }
    }
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn lifecycle() {
        let t = PortTable::new();
        assert!(t.get(Family::Tcp, 54321).is_none());
        let e = NatEntry::new(
            "10.13.49.0".parse().unwrap(),
            "1.2.3.4".parse().unwrap(),
            54321,
            443,
        );
        t.set(Family::Tcp, 54321, Arc::clone(&e));
        let got = t.get(Family::Tcp, 54321).unwrap();
        assert_eq!(got.dst_port, 443);
        assert_eq!(got.target(), "1.2.3.4:443");
        // UDP namespace is distinct.
        assert!(t.get(Family::Udp, 54321).is_none());
        t.del(Family::Tcp, 54321);
        assert!(t.get(Family::Tcp, 54321).is_none());
    }

    #[tokio::test]
    async fn waiters_wake_on_failure() {
        let e = NatEntry::new(
            "10.13.49.0".parse().unwrap(),
            "1.2.3.4".parse().unwrap(),
            1,
            2,
        );
        let e2 = Arc::clone(&e);
        let waiter = tokio::spawn(async move { e2.take_conn().await });
        tokio::task::yield_now().await;
        e.fail();
        assert!(waiter.await.unwrap().is_none());
    }

    #[tokio::test]
    async fn waiters_receive_published_conn() {
        let e = NatEntry::new(
            "10.13.49.0".parse().unwrap(),
            "1.2.3.4".parse().unwrap(),
            1,
            2,
        );
        let (tx, body) = hyper::Body::channel();
        let conn = H2Conn::from_parts(tx, body);
        let e2 = Arc::clone(&e);
        let waiter = tokio::spawn(async move { e2.take_conn().await });
        tokio::task::yield_now().await;
        e.publish(conn);
        assert!(waiter.await.unwrap().is_some());
        // A second taker finds the connection already claimed.
        assert!(e.take_conn().await.is_none());
    }
}
