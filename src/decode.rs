use base64::{engine::general_purpose::STANDARD, Engine as _};
use opencv::{
    core::{Mat, Scalar, Vector, CV_8UC3},
    imgcodecs::{imdecode, imencode, IMREAD_COLOR, IMREAD_IGNORE_ORIENTATION, IMWRITE_JPEG_QUALITY},
    imgproc::{cvt_color, COLOR_BGR2RGB, COLOR_RGB2BGR},
    prelude::*,
};
use tracing::debug;

use crate::error::{Error, Result};

const JPEG_MAGIC: [u8; 3] = [0xFF, 0xD8, 0xFF];
const JPEG_EOI: u8 = 0xD9;
const JPEG_SOS: u8 = 0xDA;
const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
const PNG_IEND: &[u8] = b"IEND";

/// Decoded 8-bit RGB image, always H x W x 3 with H, W > 0.
#[derive(Debug)]
pub struct RawImage {
    mat: Mat,
}

impl RawImage {
    /// Wraps interleaved RGB bytes.
    pub fn from_rgb(width: i32, height: i32, data: &[u8]) -> Result<Self> {
        if width <= 0 || height <= 0 {
            return Err(Error::Decode(format!(
                "image dimensions must be positive, got {width}x{height}"
            )));
        }
        if data.len() != width as usize * height as usize * 3 {
            return Err(Error::Decode(format!(
                "expected {} RGB bytes for {width}x{height}, got {}",
                width as usize * height as usize * 3,
                data.len()
            )));
        }

        let mut mat = Mat::new_rows_cols_with_default(height, width, CV_8UC3, Scalar::all(0.0))
            .map_err(Error::decode)?;
        mat.data_bytes_mut()
            .map_err(Error::decode)?
            .copy_from_slice(data);

        Ok(Self { mat })
    }

    /// Decodes an encoded container (JPEG, PNG, BMP, TIFF, WebP, ...) of any
    /// colour mode into RGB.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.is_empty() {
            return Err(Error::Decode("image payload is empty".into()));
        }
        check_container(bytes)?;

        let buf = Vector::<u8>::from_slice(bytes);
        let bgr = imdecode(&buf, IMREAD_COLOR | IMREAD_IGNORE_ORIENTATION).map_err(Error::decode)?;
        if bgr.empty() || bgr.rows() <= 0 || bgr.cols() <= 0 {
            return Err(Error::Decode(
                "bytes are not a recognizable image container".into(),
            ));
        }

        let mut rgb = Mat::default();
        cvt_color(&bgr, &mut rgb, COLOR_BGR2RGB, 0).map_err(Error::decode)?;
        debug!(width = rgb.cols(), height = rgb.rows(), "decoded image");

        Self::from_mat(rgb)
    }

    /// Adopts an RGB `CV_8UC3` matrix.
    pub(crate) fn from_mat(mat: Mat) -> Result<Self> {
        if mat.typ() != CV_8UC3 || mat.rows() <= 0 || mat.cols() <= 0 {
            return Err(Error::Decode(format!(
                "expected a non-empty 8-bit 3-channel image, got type {} of {}x{}",
                mat.typ(),
                mat.cols(),
                mat.rows()
            )));
        }
        let mat = if mat.is_continuous() {
            mat
        } else {
            mat.try_clone().map_err(Error::decode)?
        };

        Ok(Self { mat })
    }

    pub fn width(&self) -> i32 {
        self.mat.cols()
    }

    pub fn height(&self) -> i32 {
        self.mat.rows()
    }

    pub fn pixel_count(&self) -> usize {
        self.width() as usize * self.height() as usize
    }

    pub fn as_mat(&self) -> &Mat {
        &self.mat
    }

    /// Interleaved RGB bytes, row-major.
    pub fn data(&self) -> &[u8] {
        // Construction guarantees a continuous CV_8UC3 buffer.
        self.mat.data_bytes().unwrap_or(&[])
    }

    /// RGB value at `(x, y)`, or `None` outside the image.
    pub fn pixel(&self, x: i32, y: i32) -> Option<[u8; 3]> {
        if !(0..self.width()).contains(&x) || !(0..self.height()).contains(&y) {
            return None;
        }
        let offset = (y as usize * self.width() as usize + x as usize) * 3;
        match self.data().get(offset..offset + 3)? {
            &[r, g, b] => Some([r, g, b]),
            _ => None,
        }
    }

    pub fn encode_jpeg(&self, quality: i32) -> Result<Vec<u8>> {
        let mut bgr = Mat::default();
        cvt_color(&self.mat, &mut bgr, COLOR_RGB2BGR, 0)
            .map_err(|e| Error::Encode(e.to_string()))?;

        let params = Vector::<i32>::from_slice(&[IMWRITE_JPEG_QUALITY, quality]);
        let mut buf = Vector::<u8>::new();
        let written = imencode(".jpg", &bgr, &mut buf, &params)
            .map_err(|e| Error::Encode(e.to_string()))?;
        if !written {
            return Err(Error::Encode("JPEG encoder rejected the image".into()));
        }

        Ok(buf.to_vec())
    }

    pub fn to_base64_jpeg(&self, quality: i32) -> Result<String> {
        Ok(STANDARD.encode(self.encode_jpeg(quality)?))
    }
}

/// Drops a `data:<mime>;base64,` style prefix, if any.
pub fn strip_data_uri_header(payload: &str) -> &str {
    match payload.split_once(',') {
        Some((_, body)) => body,
        None => payload,
    }
}

/// Decodes a base64 or data-URI image payload into RGB pixels.
pub fn decode_payload(payload: &str) -> Result<RawImage> {
    let body: String = strip_data_uri_header(payload)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();
    if body.is_empty() {
        return Err(Error::Decode("no image received".into()));
    }

    let bytes = STANDARD
        .decode(body.as_bytes())
        .map_err(|e| Error::Decode(format!("invalid base64: {e}")))?;

    RawImage::from_bytes(&bytes)
}

/// Rejects truncated JPEG and PNG streams, which OpenCV would otherwise
/// decode into a partially grey image.
fn check_container(bytes: &[u8]) -> Result<()> {
    if bytes.starts_with(&JPEG_MAGIC) {
        if jpeg_is_truncated(bytes) {
            return Err(Error::Decode("JPEG stream is truncated".into()));
        }
    } else if bytes.starts_with(&PNG_MAGIC) {
        if !bytes.windows(PNG_IEND.len()).any(|w| w == PNG_IEND) {
            return Err(Error::Decode("PNG stream is truncated".into()));
        }
    }

    Ok(())
}

/// Walks the JPEG marker segments up to the end-of-image marker. Only a
/// stream that runs out before that marker counts as truncated; whatever
/// follows it (motion photo video, vendor trailers) is ignored, and
/// malformed structure is left for the decoder to judge.
fn jpeg_is_truncated(bytes: &[u8]) -> bool {
    let mut pos = 2;
    loop {
        match bytes.get(pos) {
            None => return true,
            Some(0xFF) => {}
            Some(_) => return false,
        }
        // fill bytes may pad any marker
        while bytes.get(pos + 1) == Some(&0xFF) {
            pos += 1;
        }
        let Some(&marker) = bytes.get(pos + 1) else {
            return true;
        };
        match marker {
            JPEG_EOI => return false,
            // standalone markers carry no length
            0x01 | 0xD0..=0xD7 => {
                pos += 2;
                continue;
            }
            _ => {}
        }

        let Some(length) = bytes
            .get(pos + 2..pos + 4)
            .map(|len| u16::from_be_bytes([len[0], len[1]]) as usize)
        else {
            return true;
        };
        pos += 2 + length;

        if marker == JPEG_SOS {
            // entropy-coded data runs until a marker other than a stuffed
            // zero or a restart
            loop {
                match (bytes.get(pos), bytes.get(pos + 1)) {
                    (Some(0xFF), Some(0x00 | 0xD0..=0xD7)) => pos += 2,
                    (Some(0xFF), Some(_)) => break,
                    (Some(_), _) => pos += 1,
                    (None, _) => return true,
                }
            }
        }
    }
}
