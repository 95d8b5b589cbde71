//! Conversions between captured frames and model tensors.

use crate::error::Error;
use ndarray::{Array3, Array4, ArrayView3, ArrayViewD, Axis, Ix3};
use opencv::{
    core::{Mat, Scalar, Size, CV_8UC3},
    imgproc::{cvt_color_def, resize, COLOR_BGR2RGB, COLOR_RGB2BGR, INTER_LINEAR},
    prelude::*,
};
use std::convert::TryFrom;

/// Square side length the generator expects.
pub(crate) const MODEL_SIDE: i32 = 256;

/// How 8-bit intensities are mapped onto the model's input range.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub(crate) enum InputScale {
    /// Raw `[0, 255]` intensities.
    Raw,
    /// `[-1, 1]`, the range the generators are trained on.
    Symmetric,
}

impl InputScale {
    #[inline]
    fn apply(self, value: u8) -> f32 {
        match self {
            Self::Raw => f32::from(value),
            Self::Symmetric => f32::from(value) / 127.5 - 1.0,
        }
    }
}

fn dim(value: i32) -> Result<usize, Error> {
    usize::try_from(value).map_err(Error::ConvertDimI32ToUSize)
}

/// View a continuous 8-bit 3-channel Mat as a `(rows, cols, 3)` array.
fn mat_as_hwc(mat: &Mat) -> Result<ArrayView3<'_, u8>, Error> {
    let shape = (dim(mat.rows())?, dim(mat.cols())?, 3);
    ArrayView3::from_shape(shape, mat.data_bytes().map_err(Error::GetMatData)?)
        .map_err(Error::ConstructArrayView)
}

fn check_frame(frame: &Mat) -> Result<(), Error> {
    if frame.empty() {
        Err(Error::EmptyFrame)
    } else if frame.typ() != CV_8UC3 {
        Err(Error::FrameType {
            typ: frame.typ(),
            channels: frame.channels(),
        })
    } else {
        Ok(())
    }
}

/// Prepare a BGR frame for the generator.
///
/// The frame is resized to `MODEL_SIDE` x `MODEL_SIDE`, converted to RGB and
/// laid out as a `[1, 3, H, W]` batch.
pub(crate) fn preprocess(frame: &Mat, scale: InputScale) -> Result<Array4<f32>, Error> {
    check_frame(frame)?;

    let mut resized = Mat::default();
    resize(
        frame,
        &mut resized,
        Size::new(MODEL_SIDE, MODEL_SIDE),
        0.0,
        0.0,
        INTER_LINEAR,
    )
    .map_err(Error::Resize)?;

    let mut rgb = Mat::default();
    cvt_color_def(&resized, &mut rgb, COLOR_BGR2RGB).map_err(Error::CvtColor)?;

    let hwc = mat_as_hwc(&rgb)?;
    let (height, width, channels) = hwc.dim();
    Ok(Array4::from_shape_fn(
        (1, channels, height, width),
        |(_, c, y, x)| scale.apply(hwc[(y, x, c)]),
    ))
}

/// Turn a generator output batch into an 8-bit HWC RGB image.
///
/// Only the first item of the batch is used. Values are mapped from `[-1, 1]`
/// to `[0, 255]` and saturated; single channel outputs are repeated across
/// all three channels.
pub(crate) fn tensor_to_image(output: ArrayViewD<'_, f32>) -> Result<Array3<u8>, Error> {
    let shape = output.shape().to_vec();
    if shape.len() != 4 || shape[0] == 0 {
        return Err(Error::OutputShape(shape));
    }
    let chw = output
        .index_axis(Axis(0), 0)
        .into_dimensionality::<Ix3>()
        .map_err(Error::ConstructArrayView)?;

    let (channels, height, width) = chw.dim();
    if channels != 1 && channels != 3 {
        return Err(Error::OutputShape(shape));
    }

    Ok(Array3::from_shape_fn((height, width, 3), |(y, x, c)| {
        let value = chw[(if channels == 1 { 0 } else { c }, y, x)];
        ((value + 1.0) / 2.0 * 255.0).clamp(0.0, 255.0) as u8
    }))
}

/// Copy an HWC RGB image into a BGR Mat of the same dimensions.
fn image_to_bgr_mat(image: &Array3<u8>) -> Result<Mat, Error> {
    let (height, width, _) = image.dim();
    let rows = i32::try_from(height).map_err(Error::ConvertDimUSizeToI32)?;
    let cols = i32::try_from(width).map_err(Error::ConvertDimUSizeToI32)?;

    let mut rgb = Mat::new_rows_cols_with_default(rows, cols, CV_8UC3, Scalar::all(0.0))
        .map_err(Error::ConstructMat)?;
    let bytes = rgb.data_bytes_mut().map_err(Error::GetMatData)?;
    for (dst, &src) in bytes.iter_mut().zip(image.iter()) {
        *dst = src;
    }

    let mut bgr = Mat::default();
    cvt_color_def(&rgb, &mut bgr, COLOR_RGB2BGR).map_err(Error::CvtColor)?;
    Ok(bgr)
}

/// Convert a generator output batch into a BGR frame of `size`.
pub(crate) fn postprocess(output: ArrayViewD<'_, f32>, size: Size) -> Result<Mat, Error> {
    let bgr = image_to_bgr_mat(&tensor_to_image(output)?)?;
    let mut out = Mat::default();
    resize(&bgr, &mut out, size, 0.0, 0.0, INTER_LINEAR).map_err(Error::Resize)?;
    Ok(out)
}
