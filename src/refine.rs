use opencv::{
    core::{count_non_zero, Mat, Point, Scalar, Size, BORDER_CONSTANT, CV_32F, CV_8UC1},
    imgproc::{
        get_structuring_element, morphology_default_border_value, morphology_ex, resize,
        INTER_LINEAR, MORPH_CLOSE, MORPH_OPEN, MORPH_RECT,
    },
    prelude::*,
};
use png::{BitDepth, ColorType, Encoder};
use tracing::debug;

use crate::{
    config::{MaskSemantics, RefineConfig},
    error::{Error, Result},
};

/// Strictly binary (`0`/`1`) `CV_8UC1` mask at image resolution.
#[derive(Debug)]
pub struct RefinedMask {
    mask: Mat,
}

impl RefinedMask {
    pub fn as_mat(&self) -> &Mat {
        &self.mask
    }

    pub fn width(&self) -> i32 {
        self.mask.cols()
    }

    pub fn height(&self) -> i32 {
        self.mask.rows()
    }

    pub fn foreground_count(&self) -> Result<usize> {
        let count = count_non_zero(&self.mask).map_err(Error::inference)?;
        Ok(count as usize)
    }

    /// Runs the open/close cleanup again on an already binary mask.
    pub fn clean(&self, config: &RefineConfig) -> Result<RefinedMask> {
        Ok(RefinedMask {
            mask: open_close(&self.mask, config)?,
        })
    }

    /// Greyscale PNG with foreground at 255.
    pub fn to_png(&self) -> Result<Vec<u8>> {
        let pixels: Vec<u8> = self
            .mask
            .data_bytes()
            .map_err(|e| Error::Encode(e.to_string()))?
            .iter()
            .map(|&v| if v != 0 { 255 } else { 0 })
            .collect();

        let mut buf = Vec::new();
        let mut encoder = Encoder::new(&mut buf, self.width() as u32, self.height() as u32);
        encoder.set_color(ColorType::Grayscale);
        encoder.set_depth(BitDepth::Eight);
        let mut writer = encoder
            .write_header()
            .map_err(|e| Error::Encode(e.to_string()))?;
        writer
            .write_image_data(&pixels)
            .map_err(|e| Error::Encode(e.to_string()))?;
        writer.finish().map_err(|e| Error::Encode(e.to_string()))?;

        Ok(buf)
    }
}

fn open_close(mask: &Mat, config: &RefineConfig) -> Result<Mat> {
    let kernel = get_structuring_element(
        MORPH_RECT,
        Size::new(config.kernel_size, config.kernel_size),
        Point::new(-1, -1),
    )
    .map_err(Error::inference)?;
    let border = morphology_default_border_value().map_err(Error::inference)?;

    let mut opened = Mat::default();
    morphology_ex(
        mask,
        &mut opened,
        MORPH_OPEN,
        &kernel,
        Point::new(-1, -1),
        1,
        BORDER_CONSTANT,
        border,
    )
    .map_err(Error::inference)?;
    if !config.close {
        return Ok(opened);
    }

    let mut closed = Mat::default();
    morphology_ex(
        &opened,
        &mut closed,
        MORPH_CLOSE,
        &kernel,
        Point::new(-1, -1),
        1,
        BORDER_CONSTANT,
        border,
    )
    .map_err(Error::inference)?;

    Ok(closed)
}

/// Resizes a candidate mask to `width` x `height`, binarises it, applies the
/// configured semantics and cleans it morphologically.
pub fn refine(
    mask: &Mat,
    width: i32,
    height: i32,
    semantics: MaskSemantics,
    config: &RefineConfig,
) -> Result<RefinedMask> {
    let mut float = Mat::default();
    mask.convert_to(&mut float, CV_32F, 1.0, 0.0)
        .map_err(Error::inference)?;

    let mut resized = Mat::default();
    resize(
        &float,
        &mut resized,
        Size::new(width, height),
        0.0,
        0.0,
        INTER_LINEAR,
    )
    .map_err(Error::inference)?;
    let resized = if resized.is_continuous() {
        resized
    } else {
        resized.try_clone().map_err(Error::inference)?
    };

    let invert = semantics == MaskSemantics::InvertEyelid;
    let mut binary = Mat::new_rows_cols_with_default(height, width, CV_8UC1, Scalar::all(0.0))
        .map_err(Error::inference)?;
    binary
        .data_bytes_mut()
        .map_err(Error::inference)?
        .iter_mut()
        .zip(resized.data_typed::<f32>().map_err(Error::inference)?)
        .for_each(|(out, &v)| *out = ((v > config.threshold) != invert) as u8);

    let refined = RefinedMask {
        mask: open_close(&binary, config)?,
    };
    debug!(
        width,
        height,
        ?semantics,
        foreground = refined.foreground_count()?,
        "refined mask"
    );

    Ok(refined)
}

#[cfg(test)]
mod tests {
    use opencv::core::CV_32FC1;

    use super::*;

    fn float_mask(size: i32, on: impl Fn(i32, i32) -> bool) -> Mat {
        let mut mask =
            Mat::new_rows_cols_with_default(size, size, CV_32FC1, Scalar::all(0.0)).unwrap();
        let values = mask.data_typed_mut::<f32>().unwrap();
        for y in 0..size {
            for x in 0..size {
                if on(x, y) {
                    values[(y * size + x) as usize] = 1.0;
                }
            }
        }
        mask
    }

    fn values(mask: &RefinedMask) -> Vec<u8> {
        mask.as_mat().data_bytes().unwrap().to_vec()
    }

    #[test]
    fn output_is_strictly_binary_at_target_size() {
        let mask = float_mask(8, |x, y| (2..6).contains(&x) && (2..6).contains(&y));
        let refined =
            refine(&mask, 64, 48, MaskSemantics::DirectClassFilter, &RefineConfig::default())
                .unwrap();

        assert_eq!((refined.width(), refined.height()), (64, 48));
        assert!(values(&refined).iter().all(|&v| v == 0 || v == 1));
        assert!(refined.foreground_count().unwrap() > 0);
    }

    #[test]
    fn open_removes_speckle() {
        let mask = float_mask(30, |x, y| x == 15 && y == 15);
        let refined =
            refine(&mask, 30, 30, MaskSemantics::DirectClassFilter, &RefineConfig::default())
                .unwrap();
        assert_eq!(refined.foreground_count().unwrap(), 0);
    }

    #[test]
    fn close_fills_small_hole() {
        let mask = float_mask(40, |x, y| {
            (5..35).contains(&x) && (5..35).contains(&y) && !(x == 20 && y == 20)
        });
        let refined =
            refine(&mask, 40, 40, MaskSemantics::DirectClassFilter, &RefineConfig::default())
                .unwrap();
        assert_eq!(values(&refined)[20 * 40 + 20], 1);

        let no_close = RefineConfig {
            close: false,
            ..RefineConfig::default()
        };
        let opened_only =
            refine(&mask, 40, 40, MaskSemantics::DirectClassFilter, &no_close).unwrap();
        assert_eq!(values(&opened_only)[20 * 40 + 20], 0);
    }

    #[test]
    fn invert_eyelid_keeps_complement() {
        let mask = float_mask(40, |x, _| x < 20);
        let refined =
            refine(&mask, 40, 40, MaskSemantics::InvertEyelid, &RefineConfig::legacy()).unwrap();
        let values = values(&refined);
        assert_eq!(values[10 * 40 + 5], 0);
        assert_eq!(values[10 * 40 + 30], 1);
    }

    #[test]
    fn second_cleanup_never_grows_foreground() {
        let mask = float_mask(50, |x, y| {
            ((x - 25).pow(2) + (y - 25).pow(2) < 200) || (x + y) % 17 == 0
        });
        let config = RefineConfig::default();
        let refined = refine(&mask, 50, 50, MaskSemantics::DirectClassFilter, &config).unwrap();
        let again = refined.clean(&config).unwrap();

        assert!(again.foreground_count().unwrap() <= refined.foreground_count().unwrap());
    }

    #[test]
    fn png_export_decodes_back() {
        let mask = float_mask(20, |x, y| (4..16).contains(&x) && (4..16).contains(&y));
        let refined =
            refine(&mask, 20, 20, MaskSemantics::DirectClassFilter, &RefineConfig::default())
                .unwrap();
        let png = refined.to_png().unwrap();

        let decoder = png::Decoder::new(png.as_slice());
        let mut reader = decoder.read_info().unwrap();
        let mut buf = vec![0; reader.output_buffer_size()];
        let info = reader.next_frame(&mut buf).unwrap();
        let bytes = &buf[..info.buffer_size()];

        assert_eq!((info.width, info.height), (20, 20));
        assert_eq!(bytes[10 * 20 + 10], 255);
        assert_eq!(bytes[0], 0);
    }
}
