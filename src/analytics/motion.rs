use opencv::{
    core::{self, Mat, Point, Size, Vector},
    imgproc,
    prelude::*,
    Result as CvResult,
};

use crate::config::MotionConfig;

/// Per-session motion history. Owned by the producer loop and threaded
/// through every [`MotionFilter::observe`] call.
#[derive(Default)]
pub struct MotionState {
    reference: Option<Mat>,
    counter: u32,
}

impl MotionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> u32 {
        self.counter
    }

    #[cfg(test)]
    pub fn has_reference(&self) -> bool {
        self.reference.is_some()
    }

    /// Drop the reference image and the counter, e.g. after a source switch.
    pub fn reset(&mut self) {
        self.reference = None;
        self.counter = 0;
    }

    /// Apply one tick of hysteresis and report whether motion is confirmed.
    pub fn advance(&mut self, significant: bool, confirm_frames: u32) -> bool {
        if significant {
            self.counter = self.counter.saturating_add(1);
        } else {
            self.counter = 0;
        }
        self.counter >= confirm_frames
    }
}

pub struct MotionObservation {
    pub confirmed: bool,
    pub significant: bool,
    pub counter: u32,
    /// Frame resized to the working resolution, reused by the object detector.
    pub working: Mat,
}

pub struct MotionFilter {
    working_size: Size,
    blur_size: Size,
    pixel_threshold: f64,
    min_area: f64,
    confirm_frames: u32,
    kernel: Mat,
}

impl MotionFilter {
    pub fn new(config: &MotionConfig) -> CvResult<Self> {
        let kernel = imgproc::get_structuring_element(
            imgproc::MORPH_RECT,
            Size::new(3, 3),
            Point::new(-1, -1),
        )?;

        Ok(Self {
            working_size: Size::new(config.working_width, config.working_height),
            blur_size: Size::new(config.blur_kernel, config.blur_kernel),
            pixel_threshold: config.pixel_threshold,
            min_area: config.min_area,
            confirm_frames: config.confirm_frames,
            kernel,
        })
    }

    pub fn confirm_frames(&self) -> u32 {
        self.confirm_frames
    }

    pub fn observe(&self, state: &mut MotionState, frame: &Mat) -> CvResult<MotionObservation> {
        let mut working = Mat::default();
        imgproc::resize(
            frame,
            &mut working,
            self.working_size,
            0.0,
            0.0,
            imgproc::INTER_LINEAR,
        )?;

        let mut gray = Mat::default();
        imgproc::cvt_color_def(&working, &mut gray, imgproc::COLOR_BGR2GRAY)?;
        let mut blurred = Mat::default();
        imgproc::gaussian_blur_def(&gray, &mut blurred, self.blur_size, 0.0)?;

        // The reference drifts: it is always replaced by the current frame.
        let previous = state.reference.replace(blurred);

        // Nothing to diff against on the first tick.
        let (Some(reference), Some(current)) = (previous.as_ref(), state.reference.as_ref())
        else {
            return Ok(MotionObservation {
                confirmed: false,
                significant: false,
                counter: state.counter,
                working,
            });
        };

        let significant = self.has_significant_motion(reference, current)?;
        let confirmed = state.advance(significant, self.confirm_frames);

        Ok(MotionObservation {
            confirmed,
            significant,
            counter: state.counter,
            working,
        })
    }

    fn has_significant_motion(&self, reference: &Mat, current: &Mat) -> CvResult<bool> {
        let mut delta = Mat::default();
        core::absdiff(reference, current, &mut delta)?;

        let mut mask = Mat::default();
        imgproc::threshold(
            &delta,
            &mut mask,
            self.pixel_threshold,
            255.0,
            imgproc::THRESH_BINARY,
        )?;

        let mut dilated = Mat::default();
        imgproc::dilate(
            &mask,
            &mut dilated,
            &self.kernel,
            Point::new(-1, -1),
            2,
            core::BORDER_CONSTANT,
            imgproc::morphology_default_border_value()?,
        )?;

        let mut contours: Vector<Vector<Point>> = Vector::new();
        imgproc::find_contours(
            &dilated,
            &mut contours,
            imgproc::RETR_EXTERNAL,
            imgproc::CHAIN_APPROX_SIMPLE,
            Point::new(0, 0),
        )?;

        for contour in contours.iter() {
            if imgproc::contour_area(&contour, false)? >= self.min_area {
                return Ok(true);
            }
        }

        Ok(false)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use opencv::core::{Rect, Scalar, CV_8UC3};

    /// Black frame with a white square whose position alternates between two
    /// spots, so consecutive frames always differ by a large region.
    pub(crate) fn moving_frame(tick: usize, width: i32, height: i32) -> Mat {
        let mut frame =
            Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(0.0)).unwrap();
        let x = if tick % 2 == 0 { width / 10 } else { width / 2 };
        let side = width / 6;
        imgproc::rectangle(
            &mut frame,
            Rect::new(x, height / 4, side, side),
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        frame
    }

    pub(crate) fn still_frame(width: i32, height: i32) -> Mat {
        Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(40.0)).unwrap()
    }

    fn filter() -> MotionFilter {
        MotionFilter::new(&MotionConfig::default()).unwrap()
    }

    #[test]
    fn test_advance_counts_and_resets() {
        let mut state = MotionState::new();
        assert!(!state.advance(true, 3));
        assert!(!state.advance(true, 3));
        assert!(state.advance(true, 3));
        assert_eq!(state.counter(), 3);
        assert!(state.advance(true, 3));
        assert_eq!(state.counter(), 4);

        assert!(!state.advance(false, 3));
        assert_eq!(state.counter(), 0);
        assert!(!state.advance(false, 3));
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn test_advance_confirms_exactly_at_threshold() {
        let mut state = MotionState::new();
        let confirmations: Vec<bool> = (0..7).map(|_| state.advance(true, 5)).collect();
        assert_eq!(
            confirmations,
            vec![false, false, false, false, true, true, true]
        );
    }

    #[test]
    fn test_first_tick_stores_reference_without_motion() {
        let filter = filter();
        let mut state = MotionState::new();

        let obs = filter.observe(&mut state, &moving_frame(0, 1280, 960)).unwrap();
        assert!(!obs.confirmed);
        assert!(!obs.significant);
        assert_eq!(obs.counter, 0);
        assert!(state.has_reference());
        assert_eq!(obs.working.cols(), 640);
        assert_eq!(obs.working.rows(), 480);
    }

    #[test]
    fn test_sustained_motion_confirms_on_fifth_qualifying_frame() {
        let filter = filter();
        let mut state = MotionState::new();
        filter.observe(&mut state, &moving_frame(0, 1280, 960)).unwrap();

        let mut previous = 0;
        for tick in 1..=5 {
            let obs = filter.observe(&mut state, &moving_frame(tick, 1280, 960)).unwrap();
            assert!(obs.significant, "tick {tick} should carry motion");
            assert!(obs.counter >= previous);
            previous = obs.counter;
            assert_eq!(obs.confirmed, tick == 5, "tick {tick}");
        }
        assert_eq!(state.counter(), 5);
    }

    #[test]
    fn test_still_frame_resets_counter() {
        let filter = filter();
        let mut state = MotionState::new();
        for tick in 0..4 {
            filter.observe(&mut state, &moving_frame(tick, 640, 480)).unwrap();
        }
        assert_eq!(state.counter(), 3);

        // First still frame differs from the last moving one; the second does not.
        filter.observe(&mut state, &still_frame(640, 480)).unwrap();
        let obs = filter.observe(&mut state, &still_frame(640, 480)).unwrap();
        assert!(!obs.significant);
        assert_eq!(obs.counter, 0);
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn test_small_change_is_not_significant() {
        let filter = filter();
        let mut state = MotionState::new();
        let base = still_frame(640, 480);
        filter.observe(&mut state, &base).unwrap();

        let mut speck = base.try_clone().unwrap();
        imgproc::rectangle(
            &mut speck,
            Rect::new(300, 200, 4, 4),
            Scalar::new(255.0, 255.0, 255.0, 0.0),
            -1,
            imgproc::LINE_8,
            0,
        )
        .unwrap();
        let obs = filter.observe(&mut state, &speck).unwrap();
        assert!(!obs.significant);
        assert_eq!(state.counter(), 0);
    }

    #[test]
    fn test_reset_clears_reference_and_counter() {
        let filter = filter();
        let mut state = MotionState::new();
        for tick in 0..3 {
            filter.observe(&mut state, &moving_frame(tick, 640, 480)).unwrap();
        }
        assert!(state.counter() > 0);

        state.reset();
        assert!(!state.has_reference());
        assert_eq!(state.counter(), 0);

        let obs = filter.observe(&mut state, &moving_frame(7, 640, 480)).unwrap();
        assert!(!obs.significant);
    }
}
