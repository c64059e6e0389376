//! The bypass route control API.
//!
//! Served over a Unix socket in the client home directory.  The broker is
//! the only client: it pushes the set of IP addresses that must reach the
//! network around the tunnel.  Route installation failure is fatal for
//! the whole process; continuing without the exemptions would silently
//! send contract traffic into the tunnel.

use hyper::service::service_fn;
use hyper::{Body, Method, Request, Response};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::netsetup::{routes_up, Routes};
use crate::Error;

/// Lifecycle state reported at `GET /state`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum HelperState {
    /// Coming up: device and routes being configured.
    Activating,
    /// Fully operational.
    Active,
    /// Tearing down.
    Deactivating,
    /// Setup failed.
    Failed,
    /// Not determinable.
    Unknown,
}

/// Holder of the bypass IP set and its kernel routes.
#[derive(Debug)]
pub struct BypassControl {
    /// The active bypass list.
    ips: RwLock<Vec<IpAddr>>,
    /// Routes currently installed for the list.
    routes: Mutex<Option<Routes>>,
    /// Reported helper state.
    state: RwLock<HelperState>,
}

impl BypassControl {
    /// Create a controller with no routes installed.
    pub fn new() -> Arc<Self> {
        Arc::new(BypassControl {
            ips: RwLock::new(Vec::new()),
            routes: Mutex::new(None),
            state: RwLock::new(HelperState::Unknown),
        })
    }

    /// Report the helper state.
    pub async fn state(&self) -> HelperState {
        *self.state.read().await
    }

    /// Update the helper state.
    pub async fn set_state(&self, s: HelperState) {
        *self.state.write().await = s;
    }

    /// The current bypass list.
    pub async fn get(&self) -> Vec<IpAddr> {
        self.ips.read().await.clone()
    }

    /// Atomically replace the bypass list: bring old routes down, then
    /// install host routes to each new IP via the pre-existing default
    /// gateway.
    pub async fn set(&self, new: Vec<IpAddr>) -> Result<(), Error> {
        let mut routes = self.routes.lock().await;
        if let Some(mut old) = routes.take() {
            if let Err(e) = old.down().await {
                warn!("error while bringing down old routes: {}", e);
            }
        }
        *routes = Some(routes_up(&new).await?);
        *self.ips.write().await = new;
        Ok(())
    }

    /// Remove every bypass route and clear the list.
    pub async fn clear(&self) -> Result<(), Error> {
        let mut routes = self.routes.lock().await;
        if let Some(mut old) = routes.take() {
            old.down().await?;
        }
        self.ips.write().await.clear();
        Ok(())
    }
}

/// Serve the control API on `socket` until the process exits.
pub async fn serve_control(socket: PathBuf, ctl: Arc<BypassControl>) -> Result<(), Error> {
    // A stale socket from a crashed run would fail the bind.
    let _ = std::fs::remove_file(&socket);
    let listener = UnixListener::bind(&socket)?;
    info!("control API listening on {}", socket.display());
    loop {
        let (stream, _) = listener.accept().await?;
        let ctl = Arc::clone(&ctl);
        tokio::spawn(async move {
            let svc = service_fn(move |req| handle(Arc::clone(&ctl), req));
            if let Err(e) = hyper::server::conn::Http::new()
                .serve_connection(stream, svc)
                .await
            {
                warn!("control connection error: {}", e);
            }
        });
    }
}

/// Dispatch one control request.
async fn handle(
    ctl: Arc<BypassControl>,
    req: Request<Body>,
) -> Result<Response<Body>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/state") => {
            Ok(json_response(&serde_json::json!({ "state": ctl.state().await })))
        }
        (&Method::GET, "/bypass") => Ok(json_response(&ctl.get().await)),
        (&Method::POST, "/bypass") => {
            let body = match hyper::body::to_bytes(req.into_body()).await {
                Ok(b) => b,
                Err(_) => return Ok(error_response(400, "unreadable body")),
            };
            let ips: Vec<IpAddr> = match serde_json::from_slice(&body) {
                Ok(ips) => ips,
                Err(e) => return Ok(error_response(400, &format!("bad bypass list: {}", e))),
            };
            info!("installing bypass routes for {} addresses", ips.len());
            if let Err(e) = ctl.set(ips).await {
                // Exiting beats leaking: with routes in an unknown state,
                // captured traffic could bypass the tunnel or vice versa.
                error!("could not set new routes: {}", e);
                ctl.set_state(HelperState::Failed).await;
                std::process::exit(1);
            }
            Ok(json_response(&serde_json::json!({ "status": "ok" })))
        }
        (&Method::DELETE, "/bypass") => match ctl.clear().await {
            Ok(()) => Ok(json_response(&serde_json::json!({ "status": "ok" }))),
            Err(e) => {
                error!("could not clear bypass routes: {}", e);
                Ok(error_response(500, &e.to_string()))
            }
        },
        _ => Ok(error_response(404, "not found")),
    }
}

/// A JSON 200 response.
fn json_response<T: Serialize>(val: &T) -> Response<Body> {
    let body = serde_json::to_vec(val).unwrap_or_default();
    Response::builder()
        .status(200)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

/// A JSON error response.
fn error_response(code: u16, desc: &str) -> Response<Body> {
    let body = serde_json::to_vec(&serde_json::json!({ "error": desc })).unwrap_or_default();
    Response::builder()
        .status(code)
        .header(hyper::header::CONTENT_TYPE, "application/json")
        .body(Body::from(body))
        .unwrap_or_default()
}

/// The control socket path within a client home directory.
pub fn socket_path(home: &Path) -> PathBuf {
    home.join(wireleap_fsdir::filenames::TUN_SOCKET)
}

#[cfg(test)]
mod test {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[tokio::test]
    async fn state_round_trip() {
        let ctl = BypassControl::new();
        assert_eq!(ctl.state().await, HelperState::Unknown);
        ctl.set_state(HelperState::Active).await;
        let resp = handle(
            Arc::clone(&ctl),
            Request::builder()
                .method(Method::GET)
                .uri("/state")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], br#"{"state":"active"}"#);
    }

    #[tokio::test]
    async fn get_bypass_starts_empty() {
        let ctl = BypassControl::new();
        let resp = handle(
            ctl,
            Request::builder()
                .method(Method::GET)
                .uri("/bypass")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), 200);
        let body = hyper::body::to_bytes(resp.into_body()).await.unwrap();
        assert_eq!(&body[..], b"[]");
    }

    #[tokio::test]
    async fn bad_bypass_body_is_rejected() {
        let ctl = BypassControl::new();
        let resp = handle(
            ctl,
            Request::builder()
                .method(Method::POST)
                .uri("/bypass")
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), 400);
    }

    #[tokio::test]
    async fn unknown_path_is_404() {
        let ctl = BypassControl::new();
        let resp = handle(
            ctl,
            Request::builder()
                .method(Method::GET)
                .uri("/nonsense")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(resp.status(), 404);
    }
}
