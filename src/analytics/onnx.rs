use ndarray::Array4;
use opencv::core::Mat;
use opencv::prelude::*;
use ort::session::{builder::GraphOptimizationLevel, Session};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Load an ONNX model from a local path or an http(s) URL.
pub fn open_session(model: &str, intra_threads: usize) -> Result<Session, BoxError> {
    let builder = Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(intra_threads)?;

    if model.starts_with("http://") || model.starts_with("https://") {
        Ok(builder.commit_from_url(model)?)
    } else {
        Ok(builder.commit_from_file(model)?)
    }
}

/// NCHW float tensor in RGB channel order from a square, continuous BGR
/// image. `normalize` receives the RGB channel index and a value in 0..=1.
pub fn rgb_tensor<F>(bgr: &Mat, side: usize, normalize: F) -> Result<Array4<f32>, BoxError>
where
    F: Fn(usize, f32) -> f32,
{
    let pixels = bgr.data_bytes()?;
    if pixels.len() < side * side * 3 {
        return Err(format!("expected a {side}x{side} BGR image").into());
    }

    Ok(Array4::from_shape_fn((1, 3, side, side), |(_, c, y, x)| {
        let bgr_offset = (y * side + x) * 3 + (2 - c);
        normalize(c, pixels[bgr_offset] as f32 / 255.0)
    }))
}
