//! Off-thread geometry computation.
//!
//! The worker owns the EMA cache and runs on its own task; requests and
//! frames cross task boundaries by value, never by shared reference. When
//! requests pile up faster than they can be computed, only the newest one is
//! honored and the rest are discarded unseen (a superseding request wins).

use crate::render::geometry::{EmaCache, GeometryFrame, GeometryRequest, compute_frame};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::debug;

const REQUEST_QUEUE: usize = 32;

/// Handle to the spawned geometry task.
///
/// Frames are published on a `watch` channel, so a consumer always sees the
/// latest computed frame and never a stale intermediate. Dropping the handle
/// closes the request queue and the task exits.
pub struct GeometryWorker {
    request_tx: mpsc::Sender<GeometryRequest>,
    frame_rx: watch::Receiver<Option<GeometryFrame>>,
    handle: JoinHandle<()>,
}

impl GeometryWorker {
    /// Spawn the worker task. Must run inside a tokio runtime.
    pub fn spawn() -> Self {
        let (request_tx, mut request_rx) = mpsc::channel::<GeometryRequest>(REQUEST_QUEUE);
        let (frame_tx, frame_rx) = watch::channel(None);

        let handle = tokio::spawn(async move {
            let mut ema_cache = EmaCache::default();
            while let Some(mut request) = request_rx.recv().await {
                // collapse the queue down to the newest request
                while let Ok(newer) = request_rx.try_recv() {
                    request = newer;
                }
                match compute_frame(&request, &mut ema_cache) {
                    Some(frame) => {
                        if frame_tx.send(Some(frame)).is_err() {
                            // every consumer is gone
                            break;
                        }
                    }
                    None => debug!("skipping frame: degenerate geometry input"),
                }
            }
            debug!("geometry worker stopped");
        });

        Self {
            request_tx,
            frame_rx,
            handle,
        }
    }

    /// Queue a geometry request without blocking the caller.
    ///
    /// A full queue only happens when the worker has fallen far behind the
    /// frame scheduler; dropping this request is safe because a newer one is
    /// already on its way.
    pub fn submit(&self, request: GeometryRequest) {
        if let Err(err) = self.request_tx.try_send(request) {
            debug!(%err, "geometry request dropped");
        }
    }

    /// Receiver for computed frames. Cloneable; `None` until the first frame.
    pub fn frames(&self) -> watch::Receiver<Option<GeometryFrame>> {
        self.frame_rx.clone()
    }

    /// Graceful teardown: close the queue and wait for the task to finish.
    pub async fn shutdown(self) {
        let Self {
            request_tx,
            frame_rx,
            handle,
        } = self;
        drop(request_tx);
        drop(frame_rx);
        if let Err(err) = handle.await {
            if !err.is_cancelled() {
                debug!(%err, "geometry worker join failed");
            }
        }
    }
}
