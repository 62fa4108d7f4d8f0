use crate::config::{CameraParams, RoiRect};
use anyhow::{bail, Result};
use opencv::core::{Mat, Rect};
use opencv::prelude::*;

/// Intersect the ROI with the frame. `None` when nothing of it is inside.
pub fn clamp_roi(roi: &RoiRect, frame_width: i32, frame_height: i32) -> Option<Rect> {
    let x1 = roi.x.clamp(0, frame_width);
    let y1 = roi.y.clamp(0, frame_height);
    let x2 = roi.x.saturating_add(roi.width).clamp(0, frame_width);
    let y2 = roi.y.saturating_add(roi.height).clamp(0, frame_height);

    if x2 <= x1 || y2 <= y1 {
        None
    } else {
        Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
    }
}

/// Copy out the ROI. A ROI entirely outside the frame leaves it whole.
pub fn crop_roi(frame: &Mat, roi: &RoiRect) -> Result<Mat> {
    let size = frame.size()?;
    let Some(rect) = clamp_roi(roi, size.width, size.height) else {
        return Ok(frame.clone());
    };

    let cropped = Mat::roi(frame, rect)?;
    let mut out = Mat::default();
    cropped.copy_to(&mut out)?;
    Ok(out)
}

/// Lens undistortion from precomputed intrinsics
pub struct Undistorter {
    camera_matrix: Mat,
    dist_coeffs: Mat,
}

impl Undistorter {
    pub fn new(camera: &CameraParams) -> Result<Self> {
        if !camera.has_intrinsics() {
            bail!("camera intrinsics are not configured");
        }
        let camera_matrix = Mat::from_slice_2d(&[
            [camera.fx, 0.0, camera.cx],
            [0.0, camera.fy, camera.cy],
            [0.0, 0.0, 1.0],
        ])?;
        let dist_coeffs = if camera.distortion.is_empty() {
            Mat::default()
        } else {
            Mat::from_slice_2d(&[camera.distortion.as_slice()])?
        };
        Ok(Self {
            camera_matrix,
            dist_coeffs,
        })
    }

    pub fn apply(&self, frame: &Mat) -> Result<Mat> {
        let mut out = Mat::default();
        opencv::calib3d::undistort_def(frame, &mut out, &self.camera_matrix, &self.dist_coeffs)?;
        Ok(out)
    }
}
