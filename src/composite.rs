use opencv::{
    core::{bitwise_and, mean, Mat, Scalar, CV_8UC3},
    prelude::*,
};
use serde::{Deserialize, Serialize};

use crate::{
    decode::RawImage,
    error::{Error, Result},
    refine::RefinedMask,
};

/// Copies `image` wherever `mask` is set; every other pixel is black.
pub fn composite(image: &RawImage, mask: &RefinedMask) -> Result<RawImage> {
    if (image.width(), image.height()) != (mask.width(), mask.height()) {
        return Err(Error::Inference(format!(
            "mask is {}x{} but image is {}x{}",
            mask.width(),
            mask.height(),
            image.width(),
            image.height()
        )));
    }

    // pre-zeroed so pixels outside the mask stay black
    let mut output =
        Mat::new_rows_cols_with_default(image.height(), image.width(), CV_8UC3, Scalar::all(0.0))
            .map_err(Error::inference)?;
    bitwise_and(image.as_mat(), image.as_mat(), &mut output, mask.as_mat())
        .map_err(Error::inference)?;

    RawImage::from_mat(output)
}

/// Per-channel mean colour of an image.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ColorFeatures {
    pub r_mean: f64,
    pub g_mean: f64,
    pub b_mean: f64,
}

impl ColorFeatures {
    /// Arithmetic mean over every pixel of `image`, black ones included.
    pub fn of(image: &RawImage) -> Result<Self> {
        let means = mean(image.as_mat(), &Mat::default()).map_err(Error::inference)?;
        let features = Self {
            r_mean: means[0],
            g_mean: means[1],
            b_mean: means[2],
        };
        if !features.as_array().iter().all(|v| v.is_finite()) {
            return Err(Error::Inference(format!(
                "colour means are not finite: {features:?}"
            )));
        }

        Ok(features)
    }

    pub fn as_array(&self) -> [f64; 3] {
        [self.r_mean, self.g_mean, self.b_mean]
    }
}
