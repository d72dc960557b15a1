//! Annotations drawn on top of the camera feed and the HighGUI window showing them.

use opencv::core::{self, Mat, Point, Rect, Scalar};
use opencv::prelude::*;
use opencv::{highgui, imgproc};

use crate::pipeline::{DisplaySink, FaceBox, Overlay};
use crate::scheduler::MatchStatus;

pub const WINDOW_TITLE: &str = "Face Recognition System";

/// BGR
pub type Color = (u8, u8, u8);

const GREEN: Color = (0, 255, 0);
const RED: Color = (0, 0, 255);
const WHITE: Color = (255, 255, 255);
const STATUS_GREY: Color = (100, 100, 100);
const COUNTER_GREY: Color = (200, 200, 200);

const BOX_THICKNESS: i32 = 3;
const CORNER_LENGTH: i32 = 30;
const CORNER_THICKNESS: i32 = 5;
const LABEL_SCALE: f64 = 0.9;
const LABEL_THICKNESS: i32 = 2;
const STATUS_BAR_HEIGHT: i32 = 60;
const STATUS_BAR_OPACITY: f64 = 0.6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoxStyle {
    pub color: Color,
    pub label: &'static str,
}

impl BoxStyle {
    pub fn for_status(status: MatchStatus) -> Self {
        if status.is_match() {
            Self {
                color: GREEN,
                label: "MATCH",
            }
        } else {
            Self {
                color: RED,
                label: "NO MATCH",
            }
        }
    }
}

pub fn status_line(status: MatchStatus) -> (&'static str, Color) {
    if status.is_match() {
        ("AUTHENTICATED", GREEN)
    } else {
        ("SCANNING...", STATUS_GREY)
    }
}

/// Text baseline of the label above a face at `face_y`.
/// Moves below the top edge when the face is near the top of the frame.
fn label_baseline(face_y: i32, text_height: i32) -> i32 {
    (face_y - 10).max(text_height + 10)
}

fn scalar((b, g, r): Color) -> Scalar {
    Scalar::new(b as f64, g as f64, r as f64, 0.0)
}

fn line(frame: &mut Mat, from: (i32, i32), to: (i32, i32), color: Scalar) -> opencv::Result<()> {
    imgproc::line(
        frame,
        Point::new(from.0, from.1),
        Point::new(to.0, to.1),
        color,
        CORNER_THICKNESS,
        imgproc::LINE_8,
        0,
    )
}

pub fn draw_face(frame: &mut Mat, face: &FaceBox, style: BoxStyle) -> opencv::Result<()> {
    let color = scalar(style.color);
    let FaceBox {
        x,
        y,
        width: w,
        height: h,
    } = *face;

    imgproc::rectangle(
        frame,
        Rect::new(x, y, w, h),
        color,
        BOX_THICKNESS,
        imgproc::LINE_8,
        0,
    )?;

    let c = CORNER_LENGTH;
    // top-left
    line(frame, (x, y), (x + c, y), color)?;
    line(frame, (x, y), (x, y + c), color)?;
    // top-right
    line(frame, (x + w, y), (x + w - c, y), color)?;
    line(frame, (x + w, y), (x + w, y + c), color)?;
    // bottom-left
    line(frame, (x, y + h), (x + c, y + h), color)?;
    line(frame, (x, y + h), (x, y + h - c), color)?;
    // bottom-right
    line(frame, (x + w, y + h), (x + w - c, y + h), color)?;
    line(frame, (x + w, y + h), (x + w, y + h - c), color)?;

    let mut baseline = 0;
    let text_size = imgproc::get_text_size(
        style.label,
        imgproc::FONT_HERSHEY_DUPLEX,
        LABEL_SCALE,
        LABEL_THICKNESS,
        &mut baseline,
    )?;
    let label_y = label_baseline(y, text_size.height);

    imgproc::rectangle(
        frame,
        Rect::new(
            x,
            label_y - text_size.height - 10,
            text_size.width + 10,
            text_size.height + 15,
        ),
        color,
        imgproc::FILLED,
        imgproc::LINE_8,
        0,
    )?;
    imgproc::put_text(
        frame,
        style.label,
        Point::new(x + 5, label_y),
        imgproc::FONT_HERSHEY_DUPLEX,
        LABEL_SCALE,
        scalar(WHITE),
        LABEL_THICKNESS,
        imgproc::LINE_8,
        false,
    )
}

pub fn draw_status_bar(frame: &mut Mat, status: MatchStatus, frame_count: u64) -> opencv::Result<()> {
    let width = frame.cols();
    let height = frame.rows();

    let mut shaded = frame.try_clone()?;
    imgproc::rectangle(
        &mut shaded,
        Rect::new(0, height - STATUS_BAR_HEIGHT, width, STATUS_BAR_HEIGHT),
        scalar((0, 0, 0)),
        imgproc::FILLED,
        imgproc::LINE_8,
        0,
    )?;
    let mut blended = Mat::default();
    core::add_weighted(
        &shaded,
        STATUS_BAR_OPACITY,
        &*frame,
        1.0 - STATUS_BAR_OPACITY,
        0.0,
        &mut blended,
        -1,
    )?;
    *frame = blended;

    let (text, color) = status_line(status);
    let color = scalar(color);
    // Hershey fonts are ASCII only, draw the status dot by hand
    imgproc::circle(
        frame,
        Point::new(30, height - 30),
        8,
        color,
        imgproc::FILLED,
        imgproc::LINE_AA,
        0,
    )?;
    imgproc::put_text(
        frame,
        text,
        Point::new(50, height - 20),
        imgproc::FONT_HERSHEY_DUPLEX,
        1.0,
        color,
        2,
        imgproc::LINE_8,
        false,
    )?;

    imgproc::put_text(
        frame,
        &format!("Frame: {}", frame_count),
        Point::new(width - 200, height - 20),
        imgproc::FONT_HERSHEY_DUPLEX,
        0.6,
        scalar(COUNTER_GREY),
        1,
        imgproc::LINE_8,
        false,
    )
}

pub fn annotate(frame: &mut Mat, overlay: &Overlay) -> opencv::Result<()> {
    let style = BoxStyle::for_status(overlay.status);
    for face in &overlay.faces {
        draw_face(frame, face, style)?;
    }
    draw_status_bar(frame, overlay.status, overlay.frame_count)
}

/// HighGUI window that annotates and shows frames.
pub struct Window {
    name: String,
}

impl Window {
    pub fn new(name: &str) -> anyhow::Result<Self> {
        highgui::named_window_def(name)?;
        Ok(Self {
            name: name.to_owned(),
        })
    }
}

impl DisplaySink<Mat> for Window {
    fn show(&mut self, frame: &mut Mat, overlay: &Overlay) -> anyhow::Result<()> {
        annotate(frame, overlay)?;
        highgui::imshow(&self.name, &*frame)?;
        Ok(())
    }

    fn release(&mut self) -> anyhow::Result<()> {
        highgui::destroy_window(&self.name)?;
        Ok(())
    }
}
