use clap::Parser;
use face_verifier::config::{CameraArgs, SourceKind, VerifyArgs, ZenohArgs};
use face_verifier::overlay::WINDOW_TITLE;
use face_verifier::pipeline::FrameSource;
use face_verifier::vision::read_image;
use face_verifier::{
    CameraSource, FaceDetector, KeyPoller, Pipeline, SFaceVerifier, VerificationScheduler, Window,
    ZenohFrameSource,
};
use opencv::core::Mat;
use tracing_subscriber::EnvFilter;

/// Show the camera feed and periodically check the face against a reference photo.
#[derive(Parser, Debug)]
#[command()]
struct Args {
    /// Where frames come from.
    #[clap(long, value_enum, env = "FACE_VERIFY_SOURCE", default_value = "camera")]
    source: SourceKind,

    #[command(flatten)]
    camera: CameraArgs,

    #[command(flatten)]
    verify: VerifyArgs,

    #[command(flatten)]
    zenoh: ZenohArgs,
}

fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let reference = read_image(&args.verify.reference)?;
    tracing::info!(path = %args.verify.reference.display(), "reference image loaded");

    let verifier = SFaceVerifier::load(
        &args.verify.detector_model,
        &args.verify.recognizer_model,
        &reference,
        args.verify.threshold,
    )?;
    let scheduler = VerificationScheduler::new(verifier, args.verify.interval);

    match args.source {
        SourceKind::Camera => {
            let source = CameraSource::open(&args.camera)?;
            run(source, &scheduler, &args)
        }
        SourceKind::Zenoh => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()?;
            let source = runtime.block_on(ZenohFrameSource::subscribe(&args.zenoh))?;
            run(source, &scheduler, &args)
        }
    }
}

fn run<S>(
    source: S,
    scheduler: &VerificationScheduler<SFaceVerifier>,
    args: &Args,
) -> anyhow::Result<()>
where
    S: FrameSource<Frame = Mat>,
{
    let detector = FaceDetector::new()?;
    let window = Window::new(WINDOW_TITLE)?;

    tracing::info!(interval = scheduler.interval().get(), "starting main loop, press q to quit");
    let mut pipeline = Pipeline::new(source, detector, window, KeyPoller::default());
    let result = pipeline.run(scheduler);

    scheduler.shutdown(args.verify.shutdown_grace);
    result.map(|_| ())
}
