use std::future::Future;
use std::time::Duration;

use opencv::core::Mat;
use tokio::runtime::Handle;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use zenoh::prelude::r#async::*;

use crate::config::ZenohArgs;
use crate::pipeline::FrameSource;
use crate::vision::jpeg_to_mat;
use crate::ErrorWrapper;

/// Frames buffered between the subscriber and the render loop.
/// Anything beyond this is dropped so the display stays live.
const FRAME_QUEUE_DEPTH: usize = 2;

/// JPEG frames received from a zenoh publisher.
pub struct ZenohFrameSource {
    frames: mpsc::Receiver<Vec<u8>>,
    subscriber_task: JoinHandle<()>,
    runtime: Handle,
    frame_timeout: Duration,
}

impl ZenohFrameSource {
    /// Must be called from within a tokio runtime. `next_frame` must not.
    pub async fn subscribe(args: &ZenohArgs) -> anyhow::Result<Self> {
        let zenoh_session = zenoh::open(args.zenoh_config())
            .res()
            .await
            .map_err(ErrorWrapper::ZenohError)?;
        let zenoh_session = zenoh_session.into_arc();

        let subscriber = zenoh_session
            .declare_subscriber(args.topic.clone())
            .best_effort()
            .res()
            .await
            .map_err(ErrorWrapper::ZenohError)?;
        tracing::info!(topic = %args.topic, "subscribed to frames");

        let (tx, frames) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let subscriber_task = tokio::spawn(async move {
            // keep the session alive for as long as the subscriber
            let _session = zenoh_session;
            loop {
                let msg = match subscriber.recv_async().await {
                    Ok(msg) => msg,
                    Err(error) => {
                        tracing::warn!(?error, "frame subscriber closed");
                        break;
                    }
                };
                let payload: Vec<u8> = match msg.value.try_into() {
                    Ok(payload) => payload,
                    Err(error) => {
                        tracing::warn!(?error, "ignoring frame with unexpected encoding");
                        continue;
                    }
                };
                if !forward_frame(&tx, payload) {
                    break;
                }
            }
        });

        Ok(Self {
            frames,
            subscriber_task,
            runtime: Handle::current(),
            frame_timeout: args.frame_timeout,
        })
    }
}

/// Queue a received payload for the render loop, dropping it when the queue
/// is full. Returns false once the receiving side is gone.
fn forward_frame(tx: &mpsc::Sender<Vec<u8>>, payload: Vec<u8>) -> bool {
    match tx.try_send(payload) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            tracing::trace!("render loop behind, dropping frame");
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

impl FrameSource for ZenohFrameSource {
    type Frame = Mat;

    fn next_frame(&mut self) -> anyhow::Result<Option<Mat>> {
        loop {
            let received = self
                .runtime
                .block_on(tokio::time::timeout(self.frame_timeout, self.frames.recv()));
            let payload = match received {
                Ok(Some(payload)) => payload,
                Ok(None) => return Ok(None),
                Err(_) => {
                    tracing::warn!(
                        timeout_ms = self.frame_timeout.as_millis() as u64,
                        "no frame received in time, treating stream as ended"
                    );
                    return Ok(None);
                }
            };
            match jpeg_to_mat(&payload) {
                Ok(frame) => return Ok(Some(frame)),
                Err(error) => tracing::warn!(?error, "skipping undecodable frame"),
            }
        }
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.frames.close();
        self.subscriber_task.abort();
        Ok(())
    }
}

/// Pull frames from `source` and hand them to `publish` until the source ends
/// or `publish` returns `Ok(false)`. The source is released on every exit path.
/// Returns the number of frames published.
pub async fn publish_frames<S, F, Fut>(source: &mut S, mut publish: F) -> anyhow::Result<u64>
where
    S: FrameSource,
    F: FnMut(S::Frame) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let result = forward_all(source, &mut publish).await;
    if let Err(error) = source.release() {
        tracing::warn!(?error, "failed to release frame source");
    }
    result
}

async fn forward_all<S, F, Fut>(source: &mut S, publish: &mut F) -> anyhow::Result<u64>
where
    S: FrameSource,
    F: FnMut(S::Frame) -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let mut published: u64 = 0;
    loop {
        let Some(frame) = source.next_frame()? else {
            tracing::error!(published, "can't receive frame from camera, stopping");
            return Ok(published);
        };
        let keep_going = publish(frame).await?;
        published += 1;
        if !keep_going {
            return Ok(published);
        }
    }
}
