use crate::common::config::ComparisonConfig;
use crate::common::{RegistrationError, Result};
use crate::core::model::OnnxModel;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::Value;
use std::cmp::Ordering;
use std::path::Path;

const NMS_IOU_THRESHOLD: f32 = 0.45;
const MIN_BOX_SIDE: f32 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
    pub confidence: f32,
}

impl FaceBox {
    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    fn area(&self) -> f32 {
        self.width().max(0.0) * self.height().max(0.0)
    }
}

/// YOLOv8-style single-class face detector.
pub struct FaceDetector {
    model: OnnxModel,
    input_width: u32,
    input_height: u32,
    confidence: f32,
}

impl FaceDetector {
    pub fn new(config: &ComparisonConfig, models_base: &Path) -> Result<Self> {
        let mut model_path = config.detector_path.clone();
        if model_path.is_relative() {
            model_path = models_base.join(&model_path);
        }

        Ok(Self {
            model: OnnxModel::load("face_detector", &model_path, config.optimization_level)?,
            input_width: config.detector_input_width,
            input_height: config.detector_input_height,
            confidence: config.detection_confidence,
        })
    }

    /// Faces above the confidence threshold, best first, in the coordinates
    /// of `image`.
    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<FaceBox>> {
        let orig_width = image.width() as f32;
        let orig_height = image.height() as f32;

        let resized = image.resize_exact(self.input_width, self.input_height, FilterType::Nearest);
        let input = image_to_array(&resized);
        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.model.session.allocator(), &cow_array)?;
        let outputs = self.model.session.run(vec![input_tensor])?;

        let first = outputs.first()
            .ok_or_else(|| RegistrationError::Model("Detector produced no output".into()))?;
        let output = first.try_extract::<f32>()?.view().to_owned();
        let shape = output.shape().to_vec();
        let data = output.as_slice()
            .ok_or_else(|| RegistrationError::Model("Detector output is not contiguous".into()))?;

        let mut faces = parse_predictions(data, &shape, self.input_width as f32, self.input_height as f32);
        faces = apply_nms(faces, NMS_IOU_THRESHOLD);
        faces.retain(|face| face.confidence >= self.confidence);

        let scale_x = orig_width / self.input_width as f32;
        let scale_y = orig_height / self.input_height as f32;
        for face in &mut faces {
            face.x1 *= scale_x;
            face.x2 *= scale_x;
            face.y1 *= scale_y;
            face.y2 *= scale_y;
        }

        tracing::debug!("Detected {} face(s)", faces.len());
        Ok(faces)
    }
}

fn image_to_array(img: &DynamicImage) -> Array4<f32> {
    let gray = img.to_luma8();
    let width = img.width() as usize;
    let height = img.height() as usize;
    let mut array = Array4::<f32>::zeros((1, 3, height, width));

    let norm_factor = 1.0 / 255.0;
    for (x, y, pixel) in gray.enumerate_pixels() {
        let value = pixel[0] as f32 * norm_factor;
        let (x, y) = (x as usize, y as usize);
        array[[0, 0, y, x]] = value;
        array[[0, 1, y, x]] = value;
        array[[0, 2, y, x]] = value;
    }

    array
}

/// Decode raw `[x_center, y_center, w, h, score]` rows. Accepts both the
/// `[1, N, 5]` layout and the transposed `[1, 5, N]` one.
pub fn parse_predictions(data: &[f32], shape: &[usize], input_width: f32, input_height: f32) -> Vec<FaceBox> {
    let (count, row_len, transposed) = match shape {
        [_, a, b] if (4..=10).contains(a) && b > a => (*b, *a, true),
        [_, a, b] => (*a, *b, false),
        [a, b] => (*a, *b, false),
        _ => {
            tracing::warn!("Unexpected detector output shape: {:?}", shape);
            return Vec::new();
        }
    };
    if row_len < 4 || data.len() < count * row_len {
        tracing::warn!("Detector output too short for shape {:?}", shape);
        return Vec::new();
    }

    let at = |i: usize, field: usize| {
        if transposed { data[field * count + i] } else { data[i * row_len + field] }
    };

    let mut faces = Vec::new();
    for i in 0..count {
        let (cx, cy, w, h) = (at(i, 0), at(i, 1), at(i, 2), at(i, 3));
        let confidence = if row_len > 4 { at(i, 4) } else { 0.0 };
        if confidence <= 0.001 {
            continue;
        }

        // Some exports emit normalized coordinates
        let (scale_x, scale_y) = if cx > 1.0 || cy > 1.0 || w > 1.0 || h > 1.0 {
            (1.0, 1.0)
        } else {
            (input_width, input_height)
        };
        let (cx, cy, w, h) = (cx * scale_x, cy * scale_y, w * scale_x, h * scale_y);

        let face = FaceBox {
            x1: (cx - w / 2.0).max(0.0),
            y1: (cy - h / 2.0).max(0.0),
            x2: (cx + w / 2.0).min(input_width),
            y2: (cy + h / 2.0).min(input_height),
            confidence,
        };
        if face.width() > MIN_BOX_SIDE && face.height() > MIN_BOX_SIDE {
            faces.push(face);
        }
    }
    faces
}

pub fn apply_nms(mut boxes: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    boxes.sort_by(|a, b| b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal));

    let mut keep: Vec<FaceBox> = Vec::new();
    for candidate in boxes {
        if keep.iter().all(|kept| iou(kept, &candidate) < iou_threshold) {
            keep.push(candidate);
        }
    }
    keep
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x1.max(b.x1);
    let y1 = a.y1.max(b.y1);
    let x2 = a.x2.min(b.x2);
    let y2 = a.y2.min(b.y2);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - intersection;
    if union > 0.0 { intersection / union } else { 0.0 }
}
