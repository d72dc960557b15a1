use std::num::NonZeroU64;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, ValueEnum};
use zenoh::prelude::r#async::*;

#[derive(Args, Debug, Clone)]
pub struct CameraArgs {
    /// Capture device index.
    #[clap(long = "camera", env = "FACE_VERIFY_CAMERA", default_value_t = 0)]
    pub camera_index: i32,

    /// Requested frame width.
    #[clap(long, env = "FACE_VERIFY_FRAME_WIDTH", default_value_t = 1280)]
    pub frame_width: u32,

    /// Requested frame height.
    #[clap(long, env = "FACE_VERIFY_FRAME_HEIGHT", default_value_t = 720)]
    pub frame_height: u32,

    /// Seconds to wait after opening the camera before reading frames.
    #[clap(
        long = "warmup-secs",
        env = "FACE_VERIFY_WARMUP_SECS",
        default_value = "2",
        value_parser = parse_secs
    )]
    pub warmup: Duration,
}

#[derive(Args, Debug, Clone)]
pub struct VerifyArgs {
    /// Photo of the face to look for.
    #[clap(short, long, env = "FACE_VERIFY_REFERENCE", default_value = "reference.jpg")]
    pub reference: PathBuf,

    /// Run a verification every this many frames.
    #[clap(long, env = "FACE_VERIFY_INTERVAL", default_value = "30")]
    pub interval: NonZeroU64,

    /// Minimum cosine similarity counted as a match.
    #[clap(long, env = "FACE_VERIFY_THRESHOLD", default_value_t = 0.363)]
    pub threshold: f64,

    /// YuNet face detection model.
    #[clap(
        long,
        env = "FACE_VERIFY_DETECTOR_MODEL",
        default_value = "models/face_detection_yunet_2023mar.onnx"
    )]
    pub detector_model: PathBuf,

    /// SFace face recognition model.
    #[clap(
        long,
        env = "FACE_VERIFY_RECOGNIZER_MODEL",
        default_value = "models/face_recognition_sface_2021dec.onnx"
    )]
    pub recognizer_model: PathBuf,

    /// How long to wait for a running verification on exit.
    #[clap(
        long = "shutdown-grace-secs",
        env = "FACE_VERIFY_SHUTDOWN_GRACE_SECS",
        default_value = "2",
        value_parser = parse_secs
    )]
    pub shutdown_grace: Duration,
}

#[derive(Args, Debug, Clone)]
pub struct ZenohArgs {
    /// Endpoints to connect to.
    #[clap(short = 'e', long)]
    pub connect: Vec<zenoh_config::EndPoint>,

    /// Endpoints to listen on.
    #[clap(long)]
    pub listen: Vec<zenoh_config::EndPoint>,

    /// Key expression camera frames are published on.
    #[clap(long, env = "FACE_VERIFY_TOPIC", default_value = "face-tracker/image")]
    pub topic: String,

    /// Treat the stream as ended after this many seconds without a frame.
    #[clap(
        long = "frame-timeout-secs",
        env = "FACE_VERIFY_FRAME_TIMEOUT_SECS",
        default_value = "5",
        value_parser = parse_secs
    )]
    pub frame_timeout: Duration,
}

impl ZenohArgs {
    pub fn zenoh_config(&self) -> Config {
        let mut zenoh_config = Config::default();
        if !self.listen.is_empty() {
            zenoh_config.listen.endpoints = self.listen.clone();
            tracing::info!(
                endpoints = ?zenoh_config.listen.endpoints,
                "configured listening endpoints"
            );
        }
        if !self.connect.is_empty() {
            zenoh_config.connect.endpoints = self.connect.clone();
            tracing::info!(
                endpoints = ?zenoh_config.connect.endpoints,
                "configured connect endpoints"
            );
        }
        zenoh_config
    }
}

/// Non-negative, finite number of seconds.
fn parse_secs(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("`{value}` is not a number of seconds"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("`{value}` seconds: {e}"))
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Local capture device.
    Camera,
    /// JPEG frames received over zenoh.
    Zenoh,
}
