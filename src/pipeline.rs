use crate::scheduler::{MatchStatus, VerificationScheduler, Verifier};

/// Face bounding box in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FaceBox {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl FaceBox {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }
}

/// Everything the display needs to annotate one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    pub faces: Vec<FaceBox>,
    pub status: MatchStatus,
    /// Frames processed so far, including this one.
    pub frame_count: u64,
}

pub trait FrameSource {
    type Frame;

    /// `Ok(None)` means the source is gone.
    fn next_frame(&mut self) -> anyhow::Result<Option<Self::Frame>>;

    fn release(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait BoxDetector<F> {
    fn detect(&mut self, frame: &F) -> anyhow::Result<Vec<FaceBox>>;
}

pub trait DisplaySink<F> {
    fn show(&mut self, frame: &mut F, overlay: &Overlay) -> anyhow::Result<()>;

    fn release(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait QuitSignal {
    /// Must not block for longer than a key poll.
    fn poll_quit(&mut self) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    EndOfStream,
    Quit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub frames: u64,
    pub exit: ExitReason,
}

/// Render loop: read, detect, maybe verify, draw.
pub struct Pipeline<S, D, K, Q> {
    source: S,
    detector: D,
    sink: K,
    quit: Q,
}

impl<S, D, K, Q> Pipeline<S, D, K, Q>
where
    S: FrameSource,
    D: BoxDetector<S::Frame>,
    K: DisplaySink<S::Frame>,
    Q: QuitSignal,
{
    pub fn new(source: S, detector: D, sink: K, quit: Q) -> Self {
        Self {
            source,
            detector,
            sink,
            quit,
        }
    }

    /// Run until the source ends or quit is requested. The source and sink
    /// are released on every exit path.
    pub fn run<V>(&mut self, scheduler: &VerificationScheduler<V>) -> anyhow::Result<RunSummary>
    where
        V: Verifier<Frame = S::Frame>,
    {
        let result = self.run_loop(scheduler);

        if let Err(error) = self.source.release() {
            tracing::warn!(?error, "failed to release frame source");
        }
        if let Err(error) = self.sink.release() {
            tracing::warn!(?error, "failed to release display");
        }

        if let Ok(summary) = &result {
            tracing::info!(frames = summary.frames, exit = ?summary.exit, "pipeline stopped");
        }
        result
    }

    fn run_loop<V>(&mut self, scheduler: &VerificationScheduler<V>) -> anyhow::Result<RunSummary>
    where
        V: Verifier<Frame = S::Frame>,
    {
        let mut counter: u64 = 0;
        loop {
            let Some(mut frame) = self.source.next_frame()? else {
                tracing::error!("can't receive frame from source");
                return Ok(RunSummary {
                    frames: counter,
                    exit: ExitReason::EndOfStream,
                });
            };

            let faces = self.detector.detect(&frame)?;
            let status = scheduler.status();

            scheduler.maybe_dispatch(counter, &frame);
            counter += 1;

            let overlay = Overlay {
                faces,
                status,
                frame_count: counter,
            };
            self.sink.show(&mut frame, &overlay)?;

            if self.quit.poll_quit()? {
                return Ok(RunSummary {
                    frames: counter,
                    exit: ExitReason::Quit,
                });
            }
        }
    }
}
