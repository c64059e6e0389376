//! The circuit cache.

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::Circuit;

/// Memoising holder of the single active circuit.
///
/// All flows share one circuit; it is built on demand, returned unchanged
/// until something invalidates it, and replaced atomically.  The mutex is
/// held across a rebuild, so at most one rebuild is ever in flight and
/// concurrent callers wait for its result instead of racing.
#[derive(Debug, Default)]
pub struct CircuitMgr {
    /// The active circuit, if one has been built.
    current: Mutex<Option<Arc<Circuit>>>,
}

impl CircuitMgr {
    /// Create an empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the active circuit without building one.
    pub async fn current(&self) -> Option<Arc<Circuit>> {
        self.current.lock().await.clone()
    }

    /// Return the active circuit, building one with `build` if none
    /// exists.
    ///
    /// A failed build leaves the cache empty, so the next call tries
    /// again.
    pub async fn get_or_build_with<E, F, Fut>(&self, build: F) -> Result<Arc<Circuit>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Circuit, E>>,
    {
        let mut cur = self.current.lock().await;
        if let Some(c) = &*cur {
            return Ok(Arc::clone(c));
        }
        let built = Arc::new(build().await?);
        *cur = Some(Arc::clone(&built));
        Ok(built)
    }

    /// Drop the active circuit so the next request rebuilds.
    pub async fn reset(&self) {
        let mut cur = self.current.lock().await;
        if cur.take().is_some() {
            debug!("circuit cache invalidated");
        }
    }
}
