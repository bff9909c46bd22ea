use rollcall_core::{FacePipeline, MatchDecision, NoMatchReason};
use rollcall_gallery::{
    EnrollPolicy, EnrollReport, EnrollmentError, Gallery, GalleryError, GalleryStore, LoadReport,
};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// The gallery as shared between the engine thread and request handlers.
pub type SharedGallery = Arc<Gallery<Box<dyn GalleryStore>>>;

const QUEUE_DEPTH: usize = 16;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Enrollment(#[from] EnrollmentError),
    #[error(transparent)]
    Gallery(#[from] GalleryError),
    #[error("blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Messages sent from HTTP handlers to the engine thread.
enum EngineRequest {
    ProcessFrame {
        image: Vec<u8>,
        reply: oneshot::Sender<MatchDecision>,
    },
    Enroll {
        label: String,
        images: Vec<Vec<u8>>,
        policy: EnrollPolicy,
        reply: oneshot::Sender<Result<EnrollReport, EnrollmentError>>,
    },
    Refresh {
        reply: oneshot::Sender<Result<LoadReport, GalleryError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
    gallery: SharedGallery,
    match_timeout: Duration,
}

impl EngineHandle {
    pub fn gallery(&self) -> &SharedGallery {
        &self.gallery
    }

    /// Locate, embed and match one image. Never fails: a missed deadline
    /// yields `NoMatch(timeout)` and a dead engine `NoMatch(unavailable)`.
    pub async fn process_frame(&self, image: Vec<u8>) -> MatchDecision {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = EngineRequest::ProcessFrame {
            image,
            reply: reply_tx,
        };
        let round_trip = async {
            self.tx.send(request).await.map_err(|_| EngineError::ChannelClosed)?;
            reply_rx.await.map_err(|_| EngineError::ChannelClosed)
        };

        match tokio::time::timeout(self.match_timeout, round_trip).await {
            Ok(Ok(decision)) => decision,
            Ok(Err(e)) => {
                tracing::error!(error = %e, "frame not processed");
                MatchDecision::no_match(NoMatchReason::Unavailable)
            }
            Err(_) => {
                // The engine finishes the frame and its reply is dropped.
                tracing::warn!(
                    timeout_ms = self.match_timeout.as_millis() as u64,
                    "frame processing timed out"
                );
                MatchDecision::no_match(NoMatchReason::Timeout)
            }
        }
    }

    /// Validate and store new reference photos.
    pub async fn enroll(
        &self,
        label: String,
        images: Vec<Vec<u8>>,
        policy: EnrollPolicy,
    ) -> Result<EnrollReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Enroll {
                label,
                images,
                policy,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Rescan the gallery store.
    pub async fn refresh(&self) -> Result<LoadReport, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Refresh { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        Ok(reply_rx.await.map_err(|_| EngineError::ChannelClosed)??)
    }

    /// Prune an identity. Needs no inference, so it bypasses the engine queue.
    pub async fn remove_identity(&self, label: String) -> Result<usize, EngineError> {
        let gallery = Arc::clone(&self.gallery);
        Ok(tokio::task::spawn_blocking(move || gallery.remove_identity(&label)).await??)
    }
}

/// Spawn the engine on a dedicated OS thread that owns the face pipeline.
pub fn spawn_engine(
    mut pipeline: FacePipeline,
    gallery: SharedGallery,
    match_timeout: Duration,
) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(QUEUE_DEPTH);
    let engine_gallery = Arc::clone(&gallery);

    std::thread::Builder::new()
        .name("rollcall-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::ProcessFrame { image, reply } => {
                        if reply.is_closed() {
                            tracing::debug!("caller gone before processing, dropping frame");
                            continue;
                        }
                        let decision = engine_gallery.process_frame(&mut pipeline, &image);
                        let _ = reply.send(decision);
                    }
                    EngineRequest::Enroll {
                        label,
                        images,
                        policy,
                        reply,
                    } => {
                        let result = engine_gallery.enroll(&mut pipeline, &label, &images, policy);
                        if let Err(e) = &result {
                            tracing::warn!(identity = %label, code = e.code(), error = %e, "enrollment rejected");
                        }
                        let _ = reply.send(result);
                    }
                    EngineRequest::Refresh { reply } => {
                        let _ = reply.send(engine_gallery.refresh(&mut pipeline));
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle {
        tx,
        gallery,
        match_timeout,
    })
}
