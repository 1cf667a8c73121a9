//! Mask outlines through OpenCV contour extraction and polygon approximation.

use crate::inference::Mask;
use opencv::{
    core::{Mat, Point, Vector},
    imgproc,
    prelude::*,
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GeometryError {
    #[error("Mask of {width}x{height} does not fit an OpenCV matrix")]
    MaskTooLarge { width: u32, height: u32 },
    #[error("OpenCV error: {0}")]
    OpenCvError(#[from] opencv::Error),
}

fn mask_to_mat(mask: &Mask, pixels: &[u8]) -> Result<Mat, GeometryError> {
    let too_large = || GeometryError::MaskTooLarge {
        width: mask.width(),
        height: mask.height(),
    };
    let rows = i32::try_from(mask.height()).map_err(|_| too_large())?;
    let cols = i32::try_from(mask.width()).map_err(|_| too_large())?;

    let view = Mat::new_rows_cols_with_data(rows, cols, pixels)?;
    Ok(view.try_clone()?)
}

/// Outer contour of the mask with the largest enclosed area, every boundary pixel kept.
pub fn largest_contour(mask: &Mask) -> Result<Option<Vector<Point>>, GeometryError> {
    if mask.width() == 0 || mask.height() == 0 {
        return Ok(None);
    }

    let image = mask_to_mat(mask, &mask.to_bytes())?;
    let mut contours = Vector::<Vector<Point>>::new();
    imgproc::find_contours(
        &image,
        &mut contours,
        imgproc::RETR_EXTERNAL,
        imgproc::CHAIN_APPROX_NONE,
        Point::new(0, 0),
    )?;

    let mut largest: Option<(f64, Vector<Point>)> = None;
    for contour in contours.iter() {
        let area = imgproc::contour_area(&contour, false)?;
        match &largest {
            Some((best, _)) if *best >= area => {}
            _ => largest = Some((area, contour)),
        }
    }

    Ok(largest.map(|(_, contour)| contour))
}

/// Simplified outline of a mask, in mask pixels, with an approximation accuracy of
/// `tolerance` times the contour perimeter. `None` when the mask has no foreground.
pub fn mask_polygon(mask: &Mask, tolerance: f64) -> Result<Option<Vec<Point>>, GeometryError> {
    let Some(contour) = largest_contour(mask)? else {
        return Ok(None);
    };

    let epsilon = tolerance * imgproc::arc_length(&contour, true)?;
    let mut approx = Vector::<Point>::new();
    imgproc::approx_poly_dp(&contour, &mut approx, epsilon, true)?;

    Ok(Some(approx.to_vec()))
}
