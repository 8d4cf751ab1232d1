//! The face-comparison boundary. The gate only ever sees a `MatchResult`.

use crate::common::config::ComparisonConfig;
use crate::common::{DevMode, RegistrationError, Result};
use crate::core::detector::{FaceBox, FaceDetector};
use crate::core::recognizer::{cosine_similarity, FaceRecognizer};
use image::{DynamicImage, Rgb};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;
use std::path::Path;

/// Outcome of comparing a live capture against the reference image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchResult {
    /// A usable face was found in the captured frame.
    pub is_valid_face: bool,
    /// The captured face is the same person as the reference.
    pub is_match: bool,
}

impl MatchResult {
    pub const MATCH: MatchResult = MatchResult { is_valid_face: true, is_match: true };
    pub const NO_MATCH: MatchResult = MatchResult { is_valid_face: true, is_match: false };
    pub const INVALID: MatchResult = MatchResult { is_valid_face: false, is_match: false };
}

pub trait FaceComparator {
    fn compare(&self, captured: &[u8], reference: &[u8]) -> Result<MatchResult>;
}

/// Detector + embedding model, matched by cosine similarity.
pub struct EmbeddingComparator {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
    threshold: f32,
    dev_mode: DevMode,
}

impl EmbeddingComparator {
    pub fn new(config: &ComparisonConfig, models_base: &Path, dev_mode: &DevMode) -> Result<Self> {
        Ok(Self {
            detector: FaceDetector::new(config, models_base)?,
            recognizer: FaceRecognizer::new(config, models_base)?,
            threshold: config.similarity_threshold,
            dev_mode: dev_mode.clone(),
        })
    }

    fn best_face(&self, image: &DynamicImage) -> Result<Option<FaceBox>> {
        Ok(self.detector.detect(image)?.into_iter().next())
    }

    fn save_debug_image(&self, image: &DynamicImage, face: &FaceBox, matched: bool) {
        let Some(path) = self.dev_mode.get_debug_path("compare") else {
            return;
        };

        let mut img = image.to_rgb8();
        let color = if matched { Rgb([0u8, 255, 0]) } else { Rgb([255u8, 0, 0]) };
        let x1 = face.x1.max(0.0) as i32;
        let y1 = face.y1.max(0.0) as i32;
        let rect = Rect::at(x1, y1).of_size(face.width().max(1.0) as u32, face.height().max(1.0) as u32);
        draw_hollow_rect_mut(&mut img, rect, color);

        if let Err(e) = img.save(&path) {
            tracing::warn!("Could not write debug image {:?}: {}", path, e);
        }
    }
}

impl FaceComparator for EmbeddingComparator {
    fn compare(&self, captured: &[u8], reference: &[u8]) -> Result<MatchResult> {
        let captured_img = match image::load_from_memory(captured) {
            Ok(img) => img,
            Err(e) => {
                tracing::warn!("Captured frame could not be decoded: {}", e);
                return Ok(MatchResult::INVALID);
            }
        };
        let Some(captured_face) = self.best_face(&captured_img)? else {
            tracing::info!("No face found in captured frame");
            return Ok(MatchResult::INVALID);
        };

        let reference_img = image::load_from_memory(reference)
            .map_err(|e| RegistrationError::ReferenceUnusable(format!("cannot decode: {}", e)))?;
        let reference_face = self.best_face(&reference_img)?
            .ok_or_else(|| RegistrationError::ReferenceUnusable("no face found".into()))?;

        let live = self.recognizer.get_embedding(&captured_img, &captured_face)?;
        let enrolled = self.recognizer.get_embedding(&reference_img, &reference_face)?;
        let similarity = cosine_similarity(&live, &enrolled);
        let is_match = similarity >= self.threshold;

        tracing::info!("Face similarity {:.3} (threshold {:.3}) -> {}", similarity, self.threshold,
                       if is_match { "match" } else { "no match" });
        self.save_debug_image(&captured_img, &captured_face, is_match);

        Ok(MatchResult { is_valid_face: true, is_match })
    }
}
