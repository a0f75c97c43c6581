use opencv::core::{Mat, Point, Rect, Scalar};
use opencv::imgproc;
use opencv::Result as CvResult;

use super::object::CandidateBox;

fn green() -> Scalar {
    Scalar::new(0.0, 255.0, 0.0, 0.0)
}

/// Debug rendering onto the original-resolution frame. Never called on the
/// copy handed to a classification worker.
pub fn draw_overlay(frame: &mut Mat, candidates: &[CandidateBox], triggered: bool) -> CvResult<()> {
    for candidate in candidates {
        imgproc::rectangle(
            frame,
            Rect::new(
                candidate.x1,
                candidate.y1,
                candidate.width(),
                candidate.height(),
            ),
            green(),
            2,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            frame,
            &format!("Bird {:.2}", candidate.confidence),
            Point::new(candidate.x1, (candidate.y1 - 10).max(12)),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            green(),
            2,
            imgproc::LINE_8,
            false,
        )?;
    }

    if triggered {
        imgproc::put_text(
            frame,
            ">>> TRIGGERED <<<",
            Point::new(50, 50),
            imgproc::FONT_HERSHEY_SIMPLEX,
            1.0,
            green(),
            3,
            imgproc::LINE_8,
            false,
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencv::core::{Vec3b, CV_8UC3};
    use opencv::prelude::*;

    fn brightness(frame: &Mat) -> f64 {
        let sum = opencv::core::sum_elems(frame).unwrap();
        sum[0] + sum[1] + sum[2]
    }

    fn blank() -> Mat {
        Mat::new_rows_cols_with_default(480, 640, CV_8UC3, Scalar::all(0.0)).unwrap()
    }

    #[test]
    fn test_draws_box_edges_in_frame_coordinates() {
        let mut frame = blank();
        let candidate = CandidateBox {
            x1: 200,
            y1: 200,
            x2: 400,
            y2: 400,
            confidence: 0.77,
        };
        draw_overlay(&mut frame, &[candidate], false).unwrap();

        let edge = frame.at_2d::<Vec3b>(300, 200).unwrap();
        assert_eq!(edge.0, [0, 255, 0]);
        let inside = frame.at_2d::<Vec3b>(300, 300).unwrap();
        assert_eq!(inside.0, [0, 0, 0]);
    }

    #[test]
    fn test_triggered_marker_only_when_admitted() {
        let mut quiet = blank();
        draw_overlay(&mut quiet, &[], false).unwrap();
        assert_eq!(brightness(&quiet), 0.0);

        let mut triggered = blank();
        draw_overlay(&mut triggered, &[], true).unwrap();
        assert!(brightness(&triggered) > 0.0);
    }
}
