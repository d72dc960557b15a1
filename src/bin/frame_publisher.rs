use clap::Parser;
use face_verifier::config::{CameraArgs, ZenohArgs};
use face_verifier::pipeline::QuitSignal;
use face_verifier::remote::publish_frames;
use face_verifier::{mat_to_jpeg, CameraSource, ErrorWrapper, KeyPoller};
use opencv::core::Mat;
use opencv::highgui;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;
use zenoh::prelude::r#async::*;

/// Publish camera frames as JPEG for a remote `face_verify --source zenoh`.
#[derive(Parser, Debug)]
#[command()]
struct Args {
    #[command(flatten)]
    camera: CameraArgs,

    #[command(flatten)]
    zenoh: ZenohArgs,

    /// Show the captured frames in a local window.
    #[clap(long)]
    preview: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args: Args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let zenoh_session = zenoh::open(args.zenoh.zenoh_config())
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let zenoh_session = zenoh_session.into_arc();

    let publisher = zenoh_session
        .declare_publisher(args.zenoh.topic.clone())
        .congestion_control(CongestionControl::Drop)
        .priority(Priority::InteractiveHigh)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;

    let publisher = Arc::new(publisher);

    let window = "camera preview";
    if args.preview {
        highgui::named_window_def(window)?;
    }
    let mut quit = KeyPoller::default();

    let mut camera = CameraSource::open(&args.camera)?;
    tracing::info!(topic = %args.zenoh.topic, "publishing frames");

    let published = publish_frames(&mut camera, |frame| {
        let encoded = encode_frame(&frame, args.preview.then_some((window, &mut quit)));
        let publisher = publisher.clone();
        async move {
            let (data, keep_going) = encoded?;
            publisher
                .put(data)
                .res()
                .await
                .map_err(ErrorWrapper::ZenohError)?;
            Ok::<bool, anyhow::Error>(keep_going)
        }
    })
    .await?;

    tracing::info!(published, "publisher stopped");
    Ok(())
}

/// JPEG-encode a frame, showing it first when previewing.
/// The flag is false once quit was pressed in the preview window.
fn encode_frame(
    frame: &Mat,
    preview: Option<(&str, &mut KeyPoller)>,
) -> anyhow::Result<(Vec<u8>, bool)> {
    let data = mat_to_jpeg(frame)?;
    let Some((window, quit)) = preview else {
        return Ok((data, true));
    };
    highgui::imshow(window, frame)?;
    Ok((data, !quit.poll_quit()?))
}
