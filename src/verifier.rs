use std::path::Path;

use anyhow::Context;
use opencv::core::{self, Mat, Ptr};
use opencv::objdetect::{FaceDetectorYN, FaceRecognizerSF, FaceRecognizerSF_DisType};
use opencv::prelude::*;

use crate::scheduler::Verifier;
use crate::VerificationError;

/// Face verification using YuNet for detection and SFace embeddings.
///
/// The reference photo is reduced to an embedding once at load time.
pub struct SFaceVerifier {
    detector: Ptr<FaceDetectorYN>,
    recognizer: Ptr<FaceRecognizerSF>,
    reference_feature: Mat,
    threshold: f64,
}

impl SFaceVerifier {
    pub fn load(
        detector_model: &Path,
        recognizer_model: &Path,
        reference: &Mat,
        threshold: f64,
    ) -> anyhow::Result<Self> {
        let detector = FaceDetectorYN::create(
            model_path(detector_model)?,
            "",
            core::Size::new(320, 320),
            0.9,
            0.3,
            5000,
            0,
            0,
        )
        .with_context(|| format!("Failed to load detector {}", detector_model.display()))?;
        tracing::info!(path = %detector_model.display(), "YuNet detector loaded");

        let recognizer = FaceRecognizerSF::create(model_path(recognizer_model)?, "", 0, 0)
            .with_context(|| {
                format!("Failed to load recognizer {}", recognizer_model.display())
            })?;
        tracing::info!(path = %recognizer_model.display(), "SFace recognizer loaded");

        let mut verifier = Self {
            detector,
            recognizer,
            reference_feature: Mat::default(),
            threshold,
        };
        verifier.reference_feature = match verifier.extract_feature(reference) {
            Ok(feature) => feature,
            Err(VerificationError::NoFaceDetected) => {
                anyhow::bail!("No face found in reference image")
            }
            Err(error) => return Err(error.into()),
        };
        Ok(verifier)
    }

    fn extract_feature(&mut self, image: &Mat) -> Result<Mat, VerificationError> {
        self.detector.set_input_size(image.size()?)?;

        let mut faces = Mat::default();
        self.detector.detect(image, &mut faces)?;
        if faces.rows() < 1 {
            return Err(VerificationError::NoFaceDetected);
        }

        let mut aligned = Mat::default();
        self.recognizer
            .align_crop(image, &faces.row(0)?, &mut aligned)?;

        let mut feature = Mat::default();
        self.recognizer.feature(&aligned, &mut feature)?;
        // feature may point into the recognizer's buffer
        Ok(feature.try_clone()?)
    }

    pub fn similarity(&mut self, frame: &Mat) -> Result<f64, VerificationError> {
        let feature = self.extract_feature(frame)?;
        let similarity = self.recognizer.match_(
            &self.reference_feature,
            &feature,
            FaceRecognizerSF_DisType::FR_COSINE as i32,
        )?;
        Ok(similarity)
    }
}

impl Verifier for SFaceVerifier {
    type Frame = Mat;

    fn verify(&mut self, frame: &Mat) -> Result<bool, VerificationError> {
        let similarity = self.similarity(frame)?;
        tracing::debug!(similarity, threshold = self.threshold, "face compared");
        Ok(is_match(similarity, self.threshold))
    }
}

fn is_match(similarity: f64, threshold: f64) -> bool {
    similarity >= threshold
}

fn model_path(path: &Path) -> anyhow::Result<&str> {
    if !path.exists() {
        anyhow::bail!("Model file not found: {}", path.display());
    }
    path.to_str()
        .with_context(|| format!("model path is not valid UTF-8: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_threshold_is_inclusive() {
        assert!(is_match(0.363, 0.363));
        assert!(is_match(0.9, 0.363));
        assert!(!is_match(0.2, 0.363));
    }

    #[test]
    fn test_missing_model_rejected() {
        let err = model_path(Path::new("does/not/exist.onnx")).unwrap_err();
        assert!(err.to_string().contains("does/not/exist.onnx"));
    }
}
