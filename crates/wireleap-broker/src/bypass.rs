//! Client for the TUN helper's control socket.

use std::net::IpAddr;
use std::path::Path;
use tokio::net::UnixStream;
use tracing::debug;

use crate::Error;

/// Push a new bypass IP list to the TUN helper over its Unix socket.
///
/// The helper replaces its kernel bypass routes atomically on receipt.
pub(crate) async fn post_bypass(socket: &Path, ips: &[IpAddr]) -> Result<(), Error> {
    let body = serde_json::to_vec(ips).map_err(|_| Error::Config("unencodable bypass list"))?;
    let resp = roundtrip(socket, request("POST", "/bypass", Some(body))).await?;
    debug!("TUN helper answered bypass update: {}", resp.status());
    if !resp.status().is_success() {
        return Err(Error::Config("TUN helper rejected bypass update"));
    }
    Ok(())
}

/// Fetch the TUN helper's state string (`activating`, `active`, …).
#[allow(dead_code)] // consumed by the status API surface, which is external
pub(crate) async fn get_state(socket: &Path) -> Result<String, Error> {
    let resp = roundtrip(socket, request("GET", "/state", None)).await?;
    let body = hyper::body::to_bytes(resp.into_body())
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))?;
    let v: serde_json::Value =
        serde_json::from_slice(&body).map_err(|_| Error::Config("bad state reply"))?;
    Ok(v.get("state")
        .and_then(|s| s.as_str())
        .unwrap_or("unknown")
        .to_owned())
}

/// Build a request to the helper.  The authority is a placeholder; the
/// transport is the Unix socket.
fn request(
    method: &str,
    path: &str,
    body: Option<Vec<u8>>,
) -> hyper::Request<hyper::Body> {
    let builder = hyper::Request::builder()
        .method(method)
        .uri(format!("http://wireleap_tun{}", path))
        .header(hyper::header::CONTENT_TYPE, "application/json");
    builder
        .body(body.map(hyper::Body::from).unwrap_or_else(hyper::Body::empty))
        .unwrap_or_default()
}

/// Perform one HTTP/1.1 exchange over the Unix socket.
async fn roundtrip(
    socket: &Path,
    req: hyper::Request<hyper::Body>,
) -> Result<hyper::Response<hyper::Body>, Error> {
    let stream = UnixStream::connect(socket).await?;
    let (mut send, conn) = hyper::client::conn::Builder::new()
        .handshake::<_, hyper::Body>(stream)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::ConnectionRefused, e)))?;
    tokio::spawn(async move {
        // The connection task ends when the exchange completes.
        let _ = conn.await;
    });
    send.send_request(req)
        .await
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::BrokenPipe, e)))
}
