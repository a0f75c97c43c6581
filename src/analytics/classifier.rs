use std::path::Path;
use std::sync::Mutex;

use ndarray::{Array4, ArrayViewD};
use opencv::core::{Mat, Size, Vector};
use opencv::prelude::*;
use opencv::{imgcodecs, imgproc};
use ort::session::Session;
use ort::value::TensorRef;

use crate::config::ClassifierConfig;

use super::onnx::{open_session, rgb_tensor, BoxError};

const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub label: String,
    pub score: f32,
}

/// Species classifier capability. Constructed once and shared by every
/// classification worker.
pub trait Classifier: Send + Sync {
    /// `Ok(None)` means the model produced no usable prediction.
    fn predict(
        &self,
        image_jpeg: &[u8],
    ) -> Result<Option<Classification>, Box<dyn std::error::Error + Send + Sync>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfidenceTier {
    Discard,
    LowConfidence,
    Confirmed,
}

impl ConfidenceTier {
    pub fn from_score(score: f32, floor: f32, confirm: f32) -> Self {
        if score < floor {
            ConfidenceTier::Discard
        } else if score < confirm {
            ConfidenceTier::LowConfidence
        } else {
            ConfidenceTier::Confirmed
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            ConfidenceTier::Discard => "Discarded",
            ConfidenceTier::LowConfidence => "Low confidence match",
            ConfidenceTier::Confirmed => "Visual match confirmed",
        }
    }
}

/// Model labels look like `AMERICAN_GOLDFINCH` or `barn-swallow`; display
/// them as `American Goldfinch` / `Barn Swallow`.
pub fn normalize_label(label: &str) -> String {
    label
        .split(|c: char| c == '_' || c == '-' || c.is_whitespace())
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first
                    .to_uppercase()
                    .chain(chars.flat_map(|c| c.to_lowercase()))
                    .collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

/// Image classifier (e.g. an EfficientNet bird model) served through ONNX
/// Runtime, with class names read from a one-label-per-line file.
pub struct OnnxClassifier {
    session: Mutex<Session>,
    labels: Vec<String>,
    input_size: i32,
    output_name: String,
}

impl OnnxClassifier {
    pub fn new(config: &ClassifierConfig) -> Result<Self, Box<dyn std::error::Error + Send + Sync>> {
        let labels = load_labels(&config.labels)?;

        let session = open_session(&config.model, 2)?;

        tracing::info!(
            model = %config.model,
            labels = labels.len(),
            "bird classifier loaded"
        );

        Ok(Self {
            session: Mutex::new(session),
            labels,
            input_size: config.input_size as i32,
            output_name: config.output_name.clone(),
        })
    }

    fn preprocess(&self, image: &Mat) -> Result<Array4<f32>, BoxError> {
        let side = Size::new(self.input_size, self.input_size);
        let mut resized = Mat::default();
        imgproc::resize(image, &mut resized, side, 0.0, 0.0, imgproc::INTER_LINEAR)?;

        rgb_tensor(&resized, self.input_size as usize, |c, v| {
            (v - IMAGENET_MEAN[c]) / IMAGENET_STD[c]
        })
    }
}

impl Classifier for OnnxClassifier {
    fn predict(
        &self,
        image_jpeg: &[u8],
    ) -> Result<Option<Classification>, Box<dyn std::error::Error + Send + Sync>> {
        let buf = Vector::<u8>::from_slice(image_jpeg);
        let image = imgcodecs::imdecode(&buf, imgcodecs::IMREAD_COLOR)?;
        if image.rows() == 0 || image.cols() == 0 {
            return Err("failed to decode crop".into());
        }

        let input = self.preprocess(&image)?;
        let tensor_ref = TensorRef::from_array_view(input.view())?.into_dyn();

        let logits = {
            let mut session = self.session.lock().map_err(|_| "classifier session poisoned")?;
            let outputs = session.run(ort::inputs![tensor_ref])?;
            let Some(value) = outputs.get(self.output_name.as_str()) else {
                return Err(format!("model has no '{}' output", self.output_name).into());
            };
            let logits = value.try_extract_array::<f32>()?.to_owned();
            logits
        };

        Ok(top_prediction(&logits.view(), &self.labels))
    }
}

fn load_labels(path: &Path) -> Result<Vec<String>, Box<dyn std::error::Error + Send + Sync>> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| format!("failed to read labels {}: {}", path.display(), e))?;
    Ok(content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Softmax over the class axis, then arg-max.
fn top_prediction(logits: &ArrayViewD<f32>, labels: &[String]) -> Option<Classification> {
    let values: Vec<f32> = logits.iter().copied().collect();
    let max_logit = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max_logit.is_finite() {
        return None;
    }

    let exps: Vec<f32> = values.iter().map(|v| (v - max_logit).exp()).collect();
    let sum: f32 = exps.iter().sum();
    let (index, best) = exps
        .iter()
        .enumerate()
        .fold((0usize, f32::MIN), |acc, (i, &e)| if e > acc.1 { (i, e) } else { acc });

    let label = labels
        .get(index)
        .cloned()
        .unwrap_or_else(|| format!("class_{}", index));

    Some(Classification {
        label,
        score: best / sum,
    })
}
