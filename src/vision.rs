use anyhow::Context;
use opencv::core::Vector;
use opencv::prelude::*;
use opencv::{core, highgui, imgcodecs, imgproc, objdetect, videoio};

use crate::config::CameraArgs;
use crate::pipeline::{BoxDetector, FaceBox, FrameSource, QuitSignal};
use crate::scheduler::Snapshot;

impl Snapshot for Mat {
    fn snapshot(&self) -> anyhow::Result<Self> {
        Ok(self.try_clone()?)
    }
}

pub struct CameraSource {
    cam: videoio::VideoCapture,
}

impl CameraSource {
    pub fn new(index: i32) -> anyhow::Result<Self> {
        let cam = videoio::VideoCapture::new(index, videoio::CAP_ANY)?;
        if !videoio::VideoCapture::is_opened(&cam)? {
            anyhow::bail!("Unable to open camera {}", index);
        }
        Ok(Self { cam })
    }

    /// Open the camera, request the configured resolution and let exposure settle.
    pub fn open(args: &CameraArgs) -> anyhow::Result<Self> {
        let mut source = Self::new(args.camera_index)?;
        tracing::info!(index = args.camera_index, "camera opened");

        if !args.warmup.is_zero() {
            std::thread::sleep(args.warmup);
        }

        source
            .cam
            .set(videoio::CAP_PROP_FRAME_WIDTH, args.frame_width as f64)?;
        source
            .cam
            .set(videoio::CAP_PROP_FRAME_HEIGHT, args.frame_height as f64)?;
        tracing::info!(
            width = source.cam.get(videoio::CAP_PROP_FRAME_WIDTH)?,
            height = source.cam.get(videoio::CAP_PROP_FRAME_HEIGHT)?,
            "camera resolution"
        );
        Ok(source)
    }
}

impl FrameSource for CameraSource {
    type Frame = Mat;

    fn next_frame(&mut self) -> anyhow::Result<Option<Mat>> {
        let mut frame = Mat::default();
        let ok = self.cam.read(&mut frame)?;
        if !ok || frame.size()?.width == 0 {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn release(&mut self) -> anyhow::Result<()> {
        self.cam.release()?;
        tracing::debug!("camera released");
        Ok(())
    }
}

pub struct FaceDetector {
    classifier: objdetect::CascadeClassifier,
}

impl FaceDetector {
    pub fn new() -> anyhow::Result<Self> {
        let xml = core::find_file_def("haarcascades/haarcascade_frontalface_default.xml")?;
        let classifier = objdetect::CascadeClassifier::new(&xml)?;
        Ok(Self { classifier })
    }

    pub fn detect_faces(&mut self, image: &Mat) -> anyhow::Result<Vector<core::Rect>> {
        let mut faces = Vector::<core::Rect>::new();

        self.classifier.detect_multi_scale(
            &image,
            &mut faces,
            1.3,
            5,
            objdetect::CASCADE_SCALE_IMAGE,
            core::Size {
                width: 30,
                height: 30,
            },
            core::Size {
                width: 0,
                height: 0,
            },
        )?;
        Ok(faces)
    }
}

impl BoxDetector<Mat> for FaceDetector {
    fn detect(&mut self, frame: &Mat) -> anyhow::Result<Vec<FaceBox>> {
        let gray = convert_to_grayscale(frame)?;
        let faces = self.detect_faces(&gray)?;
        Ok(faces
            .iter()
            .map(|face| FaceBox::new(face.x, face.y, face.width, face.height))
            .collect())
    }
}

/// Quits on `q`, polled from the HighGUI event queue.
pub struct KeyPoller {
    quit_key: char,
}

impl KeyPoller {
    pub fn new(quit_key: char) -> Self {
        Self { quit_key }
    }
}

impl Default for KeyPoller {
    fn default() -> Self {
        Self::new('q')
    }
}

impl QuitSignal for KeyPoller {
    fn poll_quit(&mut self) -> anyhow::Result<bool> {
        let key = highgui::poll_key()?;
        Ok(is_quit_key(key, self.quit_key))
    }
}

/// `poll_key` returns -1 when nothing was pressed and may carry modifier bits.
fn is_quit_key(key: i32, quit_key: char) -> bool {
    key >= 0 && (key & 0xff) as u32 == quit_key as u32
}

pub fn convert_to_grayscale(image: &Mat) -> anyhow::Result<Mat> {
    let mut gray: Mat = Mat::default();
    imgproc::cvt_color_def(&image, &mut gray, imgproc::COLOR_BGR2GRAY)?;
    Ok(gray)
}

pub fn read_image(path: &std::path::Path) -> anyhow::Result<Mat> {
    let path_str = path
        .to_str()
        .with_context(|| format!("image path is not valid UTF-8: {}", path.display()))?;
    let image = imgcodecs::imread(path_str, imgcodecs::IMREAD_COLOR)?;
    if image.size()?.width == 0 {
        anyhow::bail!("Cannot load image {}", path.display());
    }
    Ok(image)
}

pub fn jpeg_to_mat(data: &[u8]) -> anyhow::Result<Mat> {
    let buffer = Vector::<u8>::from_slice(data);
    let image = imgcodecs::imdecode(&buffer, imgcodecs::IMREAD_COLOR)?;
    if image.size()?.width == 0 {
        anyhow::bail!("Failed to decode JPEG frame of {} bytes", data.len());
    }
    Ok(image)
}

pub fn mat_to_jpeg(frame: &Mat) -> anyhow::Result<Vec<u8>> {
    let mut buffer: Vector<u8> = Default::default();
    imgcodecs::imencode_def(".jpg", frame, &mut buffer)?;
    Ok(buffer.to_vec())
}
