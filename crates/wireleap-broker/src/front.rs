//! The h2c tunnel front-end.

use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Method, Request, Response};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use wireleap_h2conn::H2Conn;
use wireleap_proto::{headers, splice, Status};

use crate::{Broker, Error};

/// A running tunnel listener.
#[derive(Debug)]
pub struct H2cListener {
    /// The address actually bound (useful with port 0).
    pub local_addr: SocketAddr,
    /// The serving task.
    handle: tokio::task::JoinHandle<()>,
}

impl H2cListener {
    /// Stop serving.
    pub fn abort(&self) {
        self.handle.abort();
    }
}

/// Listen on `addr` for h2c tunnel requests from forwarders.
pub async fn listen_h2c(broker: Arc<Broker>, addr: SocketAddr) -> Result<H2cListener, Error> {
    let make_svc = make_service_fn(move |_conn| {
        let broker = Arc::clone(&broker);
        async move {
            Ok::<_, Infallible>(service_fn(move |req| handle(Arc::clone(&broker), req)))
        }
    });
    let server = hyper::Server::try_bind(&addr)
        .map_err(|e| Error::Io(std::io::Error::new(std::io::ErrorKind::AddrInUse, e)))?
        .http2_only(true)
        .serve(make_svc);
    let local_addr = server.local_addr();
    info!(
        "listening on h2c://{}, waiting for forwarders to connect",
        local_addr
    );
    let handle = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("h2c listener failed: {}", e);
        }
    });
    Ok(H2cListener { local_addr, handle })
}

/// Handle one tunnel request.
async fn handle(b: Arc<Broker>, req: Request<Body>) -> Result<Response<Body>, Infallible> {
    if req.method() != Method::PUT {
        return Ok(status_response(405, "method not allowed"));
    }
    let protocol = match header_str(&req, headers::DIAL_PROTOCOL) {
        Some(p) => p.to_owned(),
        None => return Ok(status_response(400, "missing dial protocol header")),
    };
    let target = match header_str(&req, headers::DIAL_TARGET) {
        Some(t) => t.to_owned(),
        None => return Ok(status_response(400, "missing dial target header")),
    };
    let forwarder = header_str(&req, headers::FORWARDER)
        .unwrap_or(headers::DEFAULT_FORWARDER)
        .to_owned();
    debug!("{}: tunnel request for {} {}", forwarder, protocol, target);

    // Before the very first dial there is no circuit, hence no bypass
    // routes; publish the minimal contract+directory list so the dial
    // itself cannot leak into the TUN.
    if !b.has_circuit().await {
        if let Err(e) = b.publish_bypass(None).await {
            debug!("minimal bypass publication skipped: {}", e);
        }
    }

    let mut relay_conn = match b.dial(&protocol, &target).await {
        Ok(c) => c,
        Err(e) => {
            b.note_error(&e).await;
            return Ok(status_response(502, &format!("{}", e)));
        }
    };

    let (tx, resp_body) = Body::channel();
    let mut tunnel = H2Conn::from_parts(tx, req.into_body());
    tokio::spawn(async move {
        match splice(&mut tunnel, &mut relay_conn).await {
            Ok((up, down)) => {
                debug!(
                    "{}: tunnel to {} closed ({} bytes up, {} bytes down)",
                    forwarder, target, up, down
                );
            }
            Err(e) => {
                warn!("{}: tunnel to {} splice error: {}", forwarder, target, e);
                b.note_error(&Error::Io(e)).await;
            }
        }
    });
    Ok(Response::builder()
        .status(200)
        .body(resp_body)
        .unwrap_or_default())
}

/// Read a header as UTF-8, if present.
fn header_str<'r>(req: &'r Request<Body>, name: &str) -> Option<&'r str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

/// Construct an error response carrying a JSON `Status` body.
fn status_response(code: u16, desc: &str) -> Response<Body> {
    let status = Status {
        code,
        desc: desc.to_owned(),
        origin: None,
    };
    let body = serde_json::to_vec(&status).unwrap_or_default();
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

#[cfg(test)]
mod test {
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::unwrap_used)]
    use super::*;
    use crate::BrokerConfig;
    use wireleap_fsdir::FsDir;

    /// A served broker over an empty state directory.
    async fn served() -> (tempfile::TempDir, H2cListener) {
        let dir = tempfile::TempDir::new().unwrap();
        let fd = FsDir::new(dir.path()).unwrap();
        let broker = Arc::new(Broker::new(fd, BrokerConfig::default()).unwrap());
        let listener = listen_h2c(broker, "127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        (dir, listener)
    }

    #[tokio::test]
    async fn non_put_is_405() {
        let (_dir, l) = served().await;
        let client = wireleap_h2conn::h2c_client();
        let uri: hyper::Uri = format!("http://{}/broker", l.local_addr).parse().unwrap();
        let resp = client.get(uri).await.unwrap();
        assert_eq!(resp.status(), 405);
        l.abort();
    }

    #[tokio::test]
    async fn missing_headers_are_400() {
        let (_dir, l) = served().await;
        let client = wireleap_h2conn::h2c_client();
        let req = Request::builder()
            .method(Method::PUT)
            .uri(format!("http://{}/broker", l.local_addr))
            .body(Body::empty())
            .unwrap();
        let resp = client.request(req).await.unwrap();
        assert_eq!(resp.status(), 400);
        l.abort();
    }

    #[tokio::test]
    async fn dial_failure_without_contract_is_502() {
        let (_dir, l) = served().await;
        let client = wireleap_h2conn::h2c_client();
        let err = H2Conn::connect(
            &client,
            &format!("http://{}/broker", l.local_addr),
            &[
                (headers::DIAL_PROTOCOL, "tcp"),
                (headers::DIAL_TARGET, "example.com:80"),
                (headers::FORWARDER, "test"),
            ],
        )
        .await
        .unwrap_err();
        assert!(matches!(err, wireleap_h2conn::Error::Status(502)));
        l.abort();
    }
}
