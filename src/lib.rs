pub mod config;
pub mod overlay;
pub mod pipeline;
pub mod remote;
pub mod scheduler;
pub mod verifier;
pub mod vision;

use thiserror::Error;

pub use overlay::Window;
pub use pipeline::{
    BoxDetector, DisplaySink, ExitReason, FaceBox, FrameSource, Overlay, Pipeline, QuitSignal,
    RunSummary,
};
pub use remote::ZenohFrameSource;
pub use scheduler::{Dispatch, MatchStatus, Snapshot, VerificationScheduler, Verifier};
pub use verifier::SFaceVerifier;
pub use vision::{jpeg_to_mat, mat_to_jpeg, CameraSource, FaceDetector, KeyPoller};

#[derive(Error, Debug)]
pub enum VerificationError {
    #[error("no face found in frame")]
    NoFaceDetected,
    #[error("OpenCV error {0:?}")]
    OpenCv(#[from] opencv::Error),
    #[error("verification failed: {0}")]
    Failed(String),
}

#[derive(Error, Debug)]
pub enum ErrorWrapper {
    #[error("Zenoh error {0:?}")]
    ZenohError(#[from] zenoh::Error),
}
