use ndarray::ArrayViewD;
use opencv::core::{self, Mat, Scalar, Size};
use opencv::imgproc;
use opencv::prelude::*;
use ort::session::Session;
use ort::value::TensorRef;

use crate::config::DetectorConfig;

use super::onnx::{open_session, rgb_tensor, BoxError};

const MODEL_SIDE: i32 = 640;
const COCO_CLASSES: [&str; 80] = [
    "person",
    "bicycle",
    "car",
    "motorcycle",
    "airplane",
    "bus",
    "train",
    "truck",
    "boat",
    "traffic light",
    "fire hydrant",
    "stop sign",
    "parking meter",
    "bench",
    "bird",
    "cat",
    "dog",
    "horse",
    "sheep",
    "cow",
    "elephant",
    "bear",
    "zebra",
    "giraffe",
    "backpack",
    "umbrella",
    "handbag",
    "tie",
    "suitcase",
    "frisbee",
    "skis",
    "snowboard",
    "sports ball",
    "kite",
    "baseball bat",
    "baseball glove",
    "skateboard",
    "surfboard",
    "tennis racket",
    "bottle",
    "wine glass",
    "cup",
    "fork",
    "knife",
    "spoon",
    "bowl",
    "banana",
    "apple",
    "sandwich",
    "orange",
    "broccoli",
    "carrot",
    "hot dog",
    "pizza",
    "donut",
    "cake",
    "chair",
    "couch",
    "potted plant",
    "bed",
    "dining table",
    "toilet",
    "tv",
    "laptop",
    "mouse",
    "remote",
    "keyboard",
    "cell phone",
    "microwave",
    "oven",
    "toaster",
    "sink",
    "refrigerator",
    "book",
    "clock",
    "vase",
    "scissors",
    "teddy bear",
    "hair drier",
    "toothbrush",
];

/// Raw detector output. The box is in the coordinates of the image that was
/// passed to [`ObjectDetector::detect`].
#[derive(Debug, Clone)]
pub struct Detection {
    pub class_name: String,
    pub class_id: usize,
    pub confidence: f32,
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

/// Region of interest in original-frame pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CandidateBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
    pub confidence: f32,
}

impl CandidateBox {
    pub fn width(&self) -> i32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> i32 {
        self.y2 - self.y1
    }
}

pub trait ObjectDetector: Send {
    fn detect(
        &mut self,
        image: &Mat,
    ) -> Result<Vec<Detection>, Box<dyn std::error::Error + Send + Sync>>;
}

/// Map a box from working-resolution space to original-frame space. Each
/// axis is scaled independently.
pub fn scale_box(
    (x1, y1, x2, y2): (f32, f32, f32, f32),
    confidence: f32,
    working: Size,
    original: Size,
) -> CandidateBox {
    let scale_x = original.width as f32 / working.width as f32;
    let scale_y = original.height as f32 / working.height as f32;

    CandidateBox {
        x1: (x1 * scale_x) as i32,
        y1: (y1 * scale_y) as i32,
        x2: (x2 * scale_x) as i32,
        y2: (y2 * scale_y) as i32,
        confidence,
    }
}

/// Narrows raw detector output to confident target-class boxes in
/// original-frame coordinates.
pub struct DetectorAdapter {
    detector: Box<dyn ObjectDetector>,
    target_class: String,
    min_confidence: f32,
}

impl DetectorAdapter {
    pub fn new(detector: Box<dyn ObjectDetector>, config: &DetectorConfig) -> Self {
        Self {
            detector,
            target_class: config.target_class.clone(),
            min_confidence: config.min_confidence,
        }
    }

    /// An empty result is normal and means "no target in view". Detector
    /// failures are logged and reported as empty.
    pub fn detect(&mut self, working: &Mat, original: Size) -> Vec<CandidateBox> {
        let working_size = Size::new(working.cols(), working.rows());
        if working_size.width == 0 || working_size.height == 0 {
            return Vec::new();
        }

        let detections = match self.detector.detect(working) {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!(error = %e, "object detection failed");
                return Vec::new();
            }
        };

        detections
            .into_iter()
            .filter(|d| d.class_name == self.target_class && d.confidence > self.min_confidence)
            .map(|d| {
                scale_box(
                    (d.x, d.y, d.x + d.width, d.y + d.height),
                    d.confidence,
                    working_size,
                    original,
                )
            })
            .collect()
    }
}

/// End-to-end YOLO model served through ONNX Runtime. Expects the
/// `logits` / `pred_boxes` output pair, so no NMS pass is needed.
pub struct YoloDetector {
    session: Session,
    confidence_threshold: f32,
}

impl YoloDetector {
    pub fn new(model_path: &str, confidence_threshold: f32) -> Result<Self, BoxError> {
        let session = open_session(model_path, 4)?;
        tracing::info!(model = %model_path, "object detector loaded");

        Ok(Self {
            session,
            confidence_threshold,
        })
    }
}

impl ObjectDetector for YoloDetector {
    fn detect(&mut self, image: &Mat) -> Result<Vec<Detection>, BoxError> {
        if image.rows() == 0 || image.cols() == 0 {
            return Ok(Vec::new());
        }

        let letterbox = Letterbox::fit(Size::new(image.cols(), image.rows()));
        let square = letterbox.apply(image)?;
        let input = rgb_tensor(&square, MODEL_SIDE as usize, |_, v| v)?;

        let (logits, boxes) = {
            let tensor = TensorRef::from_array_view(input.view())?.into_dyn();
            let outputs = self.session.run(ort::inputs![tensor])?;
            let (Some(logits), Some(boxes)) = (outputs.get("logits"), outputs.get("pred_boxes"))
            else {
                return Err("detector must expose 'logits' and 'pred_boxes' outputs".into());
            };
            let logits = logits.try_extract_array::<f32>()?.to_owned();
            let boxes = boxes.try_extract_array::<f32>()?.to_owned();
            (logits, boxes)
        };

        decode_predictions(
            &logits.view(),
            &boxes.view(),
            self.confidence_threshold,
            &letterbox,
        )
    }
}

/// Aspect-preserving fit of an image into the square model input, padded
/// with gray.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
    width: f32,
    height: f32,
}

impl Letterbox {
    fn fit(image: Size) -> Self {
        let (width, height) = (image.width as f32, image.height as f32);
        let side = MODEL_SIDE as f32;
        let scale = (side / width).min(side / height);
        Self {
            scale,
            pad_x: ((side - (width * scale).round()) / 2.0).floor(),
            pad_y: ((side - (height * scale).round()) / 2.0).floor(),
            width,
            height,
        }
    }

    fn apply(&self, image: &Mat) -> opencv::Result<Mat> {
        let fitted = Size::new(
            (self.width * self.scale).round() as i32,
            (self.height * self.scale).round() as i32,
        );
        let mut scaled = Mat::default();
        imgproc::resize(image, &mut scaled, fitted, 0.0, 0.0, imgproc::INTER_LINEAR)?;

        let (left, top) = (self.pad_x as i32, self.pad_y as i32);
        let mut square = Mat::default();
        core::copy_make_border(
            &scaled,
            &mut square,
            top,
            MODEL_SIDE - fitted.height - top,
            left,
            MODEL_SIDE - fitted.width - left,
            core::BORDER_CONSTANT,
            Scalar::all(114.0),
        )?;
        Ok(square)
    }

    /// Normalized (cx, cy, w, h) on the model input to a top-left box in
    /// image pixels, clipped to the image.
    fn unmap(&self, cx: f32, cy: f32, w: f32, h: f32) -> (f32, f32, f32, f32) {
        let side = MODEL_SIDE as f32;
        let (w, h) = (w * side / self.scale, h * side / self.scale);
        let x = ((cx * side - self.pad_x) / self.scale - w / 2.0).clamp(0.0, self.width);
        let y = ((cy * side - self.pad_y) / self.scale - h / 2.0).clamp(0.0, self.height);
        (x, y, w.min(self.width - x), h.min(self.height - y))
    }
}

fn sigmoid(logit: f32) -> f32 {
    1.0 / (1.0 + (-logit).exp())
}

/// Predictions are `[batch?, N, classes]` logits with `[batch?, N, 4]` boxes.
fn decode_predictions(
    logits: &ArrayViewD<f32>,
    boxes: &ArrayViewD<f32>,
    confidence_threshold: f32,
    letterbox: &Letterbox,
) -> Result<Vec<Detection>, BoxError> {
    let shape = logits.shape();
    if shape.len() < 2 || boxes.ndim() < 2 {
        return Ok(Vec::new());
    }
    let classes = shape[shape.len() - 1];
    let predictions = shape[shape.len() - 2];

    let scores = logits.as_slice().ok_or("logits are not contiguous")?;
    let coords = boxes.as_slice().ok_or("boxes are not contiguous")?;
    if classes == 0 || coords.len() < predictions * 4 {
        return Err("box tensor does not match logits".into());
    }

    let detections = scores
        .chunks_exact(classes)
        .zip(coords.chunks_exact(4))
        .filter_map(|(row, b)| {
            let (class_id, confidence) = row
                .iter()
                .copied()
                .map(sigmoid)
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(&b.1))?;
            if confidence < confidence_threshold {
                return None;
            }

            let (x, y, width, height) = letterbox.unmap(b[0], b[1], b[2], b[3]);
            Some(Detection {
                class_name: COCO_CLASSES
                    .get(class_id)
                    .map_or_else(|| format!("class_{class_id}"), |name| name.to_string()),
                class_id,
                confidence,
                x,
                y,
                width,
                height,
            })
        })
        .collect();

    Ok(detections)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use ndarray::Array3;
    use opencv::core::{Scalar, CV_8UC3};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Returns a fixed detection list and counts invocations.
    pub(crate) struct ScriptedDetector {
        pub detections: Vec<Detection>,
        pub calls: Arc<AtomicUsize>,
        pub fail: bool,
    }

    impl ObjectDetector for ScriptedDetector {
        fn detect(
            &mut self,
            _image: &Mat,
        ) -> Result<Vec<Detection>, Box<dyn std::error::Error + Send + Sync>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err("model crashed".into());
            }
            Ok(self.detections.clone())
        }
    }

    pub(crate) fn detection(class_name: &str, confidence: f32, x: f32, y: f32, side: f32) -> Detection {
        Detection {
            class_name: class_name.to_string(),
            class_id: COCO_CLASSES.iter().position(|c| *c == class_name).unwrap_or(0),
            confidence,
            x,
            y,
            width: side,
            height: side,
        }
    }

    fn adapter(detections: Vec<Detection>, fail: bool) -> DetectorAdapter {
        let detector = ScriptedDetector {
            detections,
            calls: Arc::new(AtomicUsize::new(0)),
            fail,
        };
        DetectorAdapter::new(Box::new(detector), &DetectorConfig::default())
    }

    fn working_frame() -> Mat {
        Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    #[test]
    fn test_scale_box_doubles_coordinates() {
        let scaled = scale_box(
            (100.0, 100.0, 200.0, 200.0),
            0.9,
            Size::new(640, 480),
            Size::new(1280, 960),
        );
        assert_eq!((scaled.x1, scaled.y1, scaled.x2, scaled.y2), (200, 200, 400, 400));
        assert_eq!(scaled.confidence, 0.9);
    }

    #[test]
    fn test_scale_box_axes_are_independent() {
        let scaled = scale_box(
            (64.0, 48.0, 128.0, 96.0),
            0.5,
            Size::new(640, 480),
            Size::new(1920, 1080),
        );
        assert_eq!((scaled.x1, scaled.y1, scaled.x2, scaled.y2), (192, 108, 384, 216));
    }

    #[test]
    fn test_adapter_keeps_only_confident_birds() {
        let mut adapter = adapter(
            vec![
                detection("bird", 0.85, 100.0, 100.0, 100.0),
                detection("bird", 0.40, 10.0, 10.0, 20.0),
                detection("cat", 0.95, 300.0, 200.0, 50.0),
                detection("bird", 0.41, 400.0, 50.0, 40.0),
            ],
            false,
        );

        let boxes = adapter.detect(&working_frame(), Size::new(1280, 960));
        assert_eq!(boxes.len(), 2);
        assert_eq!((boxes[0].x1, boxes[0].y1, boxes[0].x2, boxes[0].y2), (200, 200, 400, 400));
        assert_eq!(boxes[1].x1, 800);
    }

    #[test]
    fn test_adapter_reports_empty_on_detector_failure() {
        let mut adapter = adapter(vec![detection("bird", 0.9, 0.0, 0.0, 10.0)], true);
        assert!(adapter.detect(&working_frame(), Size::new(640, 480)).is_empty());
    }

    #[test]
    fn test_letterbox_pads_short_axis_to_model_square() {
        let letterbox = Letterbox::fit(Size::new(1280, 720));
        assert!((letterbox.scale - 0.5).abs() < 1e-6);
        assert_eq!((letterbox.pad_x, letterbox.pad_y), (0.0, 140.0));

        let square = letterbox.apply(&working_frame()).unwrap();
        assert_eq!((square.cols(), square.rows()), (MODEL_SIDE, MODEL_SIDE));

        // A box running off the bottom edge is clipped to the image.
        let (x, y, w, h) = letterbox.unmap(0.5, 0.8, 0.1, 0.2);
        assert!((x - 576.0).abs() < 1e-3);
        assert!((y - 616.0).abs() < 1e-3);
        assert!((w - 128.0).abs() < 1e-3);
        assert!((h - 104.0).abs() < 1e-3);
    }

    #[test]
    fn test_decode_predictions_maps_letterbox_back() {
        // 640x480 image letterboxed into 640x640: scale 1.0, pad_y 80
        let letterbox = Letterbox {
            scale: 1.0,
            pad_x: 0.0,
            pad_y: 80.0,
            width: 640.0,
            height: 480.0,
        };

        let mut logits = Array3::<f32>::from_elem((1, 2, 80), -10.0);
        logits[[0, 0, 14]] = 3.0;
        logits[[0, 1, 0]] = -1.0;

        // cx=320, cy=320 (=> 240 in image space), 64x64 box
        let mut boxes = Array3::<f32>::zeros((1, 2, 4));
        boxes[[0, 0, 0]] = 0.5;
        boxes[[0, 0, 1]] = 0.5;
        boxes[[0, 0, 2]] = 0.1;
        boxes[[0, 0, 3]] = 0.1;

        let logits = logits.into_dyn();
        let boxes = boxes.into_dyn();

        let detections =
            decode_predictions(&logits.view(), &boxes.view(), 0.4, &letterbox).unwrap();
        assert_eq!(detections.len(), 1);
        let d = &detections[0];
        assert_eq!(d.class_name, "bird");
        assert_eq!(d.class_id, 14);
        assert!((d.x - 288.0).abs() < 1e-3);
        assert!((d.y - 208.0).abs() < 1e-3);
        assert!((d.width - 64.0).abs() < 1e-3);
        assert!((d.height - 64.0).abs() < 1e-3);
    }
}
