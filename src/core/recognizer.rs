use crate::common::config::ComparisonConfig;
use crate::common::{RegistrationError, Result};
use crate::core::detector::FaceBox;
use crate::core::model::OnnxModel;
use image::{imageops::FilterType, DynamicImage};
use ndarray::{Array4, CowArray};
use ort::Value;
use std::path::Path;

pub type Embedding = Vec<f32>;

/// Maps a face crop to an embedding vector (single-channel ArcFace export).
pub struct FaceRecognizer {
    model: OnnxModel,
    input_size: u32,
    normalization_value: f32,
}

impl FaceRecognizer {
    pub fn new(config: &ComparisonConfig, models_base: &Path) -> Result<Self> {
        let mut model_path = config.recognizer_path.clone();
        if model_path.is_relative() {
            model_path = models_base.join(&model_path);
        }

        Ok(Self {
            model: OnnxModel::load("face_recognizer", &model_path, config.optimization_level)?,
            input_size: config.recognizer_input_size,
            normalization_value: config.normalization_value,
        })
    }

    pub fn get_embedding(&self, image: &DynamicImage, face: &FaceBox) -> Result<Embedding> {
        let x = face.x1.max(0.0) as u32;
        let y = face.y1.max(0.0) as u32;
        let width = face.width().max(1.0) as u32;
        let height = face.height().max(1.0) as u32;

        let crop = image.crop_imm(x, y, width, height)
            .resize_exact(self.input_size, self.input_size, FilterType::Triangle);

        let input = self.preprocess_face(&crop);
        let cow_array = CowArray::from(input.into_dyn());
        let input_tensor = Value::from_array(self.model.session.allocator(), &cow_array)?;
        let outputs = self.model.session.run(vec![input_tensor])?;

        let first = outputs.first()
            .ok_or_else(|| RegistrationError::Model("Recognizer produced no output".into()))?;
        let embedding = first.try_extract::<f32>()?.view().to_owned().into_raw_vec();
        Ok(embedding)
    }

    fn preprocess_face(&self, img: &DynamicImage) -> Array4<f32> {
        let gray = img.to_luma8();
        let size = self.input_size as usize;
        let norm = self.normalization_value;
        let mut array = Array4::<f32>::zeros((1, 1, size, size));

        for (x, y, pixel) in gray.enumerate_pixels() {
            array[[0, 0, y as usize, x as usize]] = (pixel[0] as f32 - norm) / norm;
        }

        array
    }
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_similarity_bounds() {
        assert!((cosine_similarity(&[1.0, 2.0], &[2.0, 4.0]) - 1.0).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[0.0, 1.0])).abs() < 1e-6);
        assert!((cosine_similarity(&[1.0, 0.0], &[-1.0, 0.0]) + 1.0).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 1.0]), 0.0);
    }
}
