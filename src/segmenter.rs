use std::{path::Path, sync::Mutex};

use opencv::{
    core::{copy_make_border, Mat, Scalar, Size, Vector, BORDER_CONSTANT, CV_32F, CV_32FC1},
    dnn::{blob_from_image, read_net_from_onnx, Net},
    imgproc::{resize, INTER_LINEAR},
    prelude::*,
};
use tracing::{debug, info, instrument};

use crate::{
    config::SegmenterConfig,
    decode::RawImage,
    error::{Error, Result},
};

/// Detection head strides of the YOLOv8 family.
const STRIDES: [i32; 3] = [8, 16, 32];
/// Prototype masks are emitted at a quarter of the input resolution.
const PROTO_DOWNSAMPLE: i32 = 4;
const LETTERBOX_FILL: f64 = 114.0;

/// One instance mask proposed by the segmentation model.
#[derive(Debug)]
pub struct Candidate {
    /// `CV_32FC1` mask at the model's native resolution, values in {0, 1}.
    pub mask: Mat,
    pub class_id: i32,
    pub score: f32,
}

impl Candidate {
    /// Pixel-sum area of the mask.
    pub fn area(&self) -> Result<f64> {
        let sum = opencv::core::sum_elems(&self.mask).map_err(Error::inference)?;
        Ok(sum[0])
    }
}

/// Candidates in encounter order (descending confidence).
#[derive(Debug, Default)]
pub struct SegmentationResult {
    pub candidates: Vec<Candidate>,
}

impl SegmentationResult {
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }
}

pub trait RegionSegmenter: Send + Sync {
    fn segment(&self, image: &RawImage) -> Result<SegmentationResult>;
}

/// Geometry of the square letterbox the network sees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub size: i32,
    pub pad_x: i32,
    pub pad_y: i32,
    pub content_width: i32,
    pub content_height: i32,
}

impl Letterbox {
    pub fn fit(width: i32, height: i32, size: i32) -> Self {
        let scale = size as f64 / width.max(height) as f64;
        let content_width = ((width as f64 * scale).round() as i32).clamp(1, size);
        let content_height = ((height as f64 * scale).round() as i32).clamp(1, size);

        Self {
            size,
            pad_x: (size - content_width) / 2,
            pad_y: (size - content_height) / 2,
            content_width,
            content_height,
        }
    }

    fn apply(&self, image: &RawImage) -> Result<Mat> {
        let mut resized = Mat::default();
        resize(
            image.as_mat(),
            &mut resized,
            Size::new(self.content_width, self.content_height),
            0.0,
            0.0,
            INTER_LINEAR,
        )
        .map_err(Error::inference)?;

        let mut padded = Mat::default();
        copy_make_border(
            &resized,
            &mut padded,
            self.pad_y,
            self.size - self.content_height - self.pad_y,
            self.pad_x,
            self.size - self.content_width - self.pad_x,
            BORDER_CONSTANT,
            Scalar::all(LETTERBOX_FILL),
        )
        .map_err(Error::inference)?;

        Ok(padded)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct Detection {
    // x1, y1, x2, y2 in letterbox pixels
    bbox: [f32; 4],
    score: f32,
    class_id: i32,
    coeffs: Vec<f32>,
}

fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let ix1 = a[0].max(b[0]);
    let iy1 = a[1].max(b[1]);
    let ix2 = a[2].min(b[2]);
    let iy2 = a[3].min(b[3]);
    if ix1 >= ix2 || iy1 >= iy2 {
        return 0.0;
    }

    let intersection = (ix2 - ix1) * (iy2 - iy1);
    let area_a = (a[2] - a[0]) * (a[3] - a[1]);
    let area_b = (b[2] - b[0]) * (b[3] - b[1]);
    intersection / (area_a + area_b - intersection)
}

/// Class-aware greedy NMS. Returns kept indices, highest score first.
fn non_max_suppression(detections: &[Detection], iou_threshold: f32, max_keep: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..detections.len()).collect();
    order.sort_by(|&a, &b| detections[b].score.total_cmp(&detections[a].score));

    let mut keep: Vec<usize> = Vec::new();
    for idx in order {
        if keep.len() >= max_keep {
            break;
        }
        let candidate = &detections[idx];
        let suppressed = keep.iter().any(|&k| {
            detections[k].class_id == candidate.class_id
                && iou(&detections[k].bbox, &candidate.bbox) > iou_threshold
        });
        if !suppressed {
            keep.push(idx);
        }
    }

    keep
}

fn anchor_count(size: i32) -> usize {
    STRIDES
        .iter()
        .map(|stride| ((size / stride) * (size / stride)) as usize)
        .sum()
}

/// Turns the raw `[1, 4 + nc + mc, N]` head and `[1, mc, S/4, S/4]`
/// prototypes into per-instance masks cropped to the letterbox content.
fn decode_outputs(
    preds: &[f32],
    protos: &[f32],
    letterbox: &Letterbox,
    config: &SegmenterConfig,
) -> Result<Vec<Candidate>> {
    let anchors = anchor_count(letterbox.size);
    let mask_channels = config.mask_channels;
    if anchors == 0 || preds.len() % anchors != 0 {
        return Err(Error::Inference(format!(
            "detection head has {} values, not a multiple of {anchors} anchors",
            preds.len()
        )));
    }
    let channels = preds.len() / anchors;
    if channels <= 4 + mask_channels {
        return Err(Error::Inference(format!(
            "detection head has {channels} channels, expected more than {}",
            4 + mask_channels
        )));
    }
    let num_classes = channels - 4 - mask_channels;

    let proto_side = (letterbox.size / PROTO_DOWNSAMPLE) as usize;
    if protos.len() != mask_channels * proto_side * proto_side {
        return Err(Error::Inference(format!(
            "mask prototypes have {} values, expected {mask_channels}x{proto_side}x{proto_side}",
            protos.len()
        )));
    }

    let at = |channel: usize, anchor: usize| preds[channel * anchors + anchor];

    let mut detections = Vec::new();
    for anchor in 0..anchors {
        let (class_id, score) = (0..num_classes)
            .map(|c| (c, at(4 + c, anchor)))
            .fold((0, f32::MIN), |best, cur| if cur.1 > best.1 { cur } else { best });
        if score < config.confidence {
            continue;
        }

        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        detections.push(Detection {
            bbox: [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0],
            score,
            class_id: class_id as i32,
            coeffs: (0..mask_channels)
                .map(|k| at(4 + num_classes + k, anchor))
                .collect(),
        });
    }

    let keep = non_max_suppression(&detections, config.iou, config.max_detections);
    debug!(
        above_confidence = detections.len(),
        kept = keep.len(),
        num_classes,
        "decoded detection head"
    );

    let ratio = proto_side as f32 / letterbox.size as f32;
    let x0 = (letterbox.pad_x as f32 * ratio).round() as usize;
    let y0 = (letterbox.pad_y as f32 * ratio).round() as usize;
    let width = ((letterbox.content_width as f32 * ratio).round() as usize)
        .clamp(1, proto_side - x0.min(proto_side - 1));
    let height = ((letterbox.content_height as f32 * ratio).round() as usize)
        .clamp(1, proto_side - y0.min(proto_side - 1));
    let plane = proto_side * proto_side;

    keep.into_iter()
        .map(|idx| {
            let detection = &detections[idx];
            let [bx1, by1, bx2, by2] = detection.bbox.map(|v| v * ratio);

            let mut mask = Mat::new_rows_cols_with_default(
                height as i32,
                width as i32,
                CV_32FC1,
                Scalar::all(0.0),
            )
            .map_err(Error::inference)?;
            let values = mask.data_typed_mut::<f32>().map_err(Error::inference)?;

            for row in 0..height {
                let py = y0 + row;
                if (py as f32) < by1 || (py as f32) >= by2 {
                    continue;
                }
                for col in 0..width {
                    let px = x0 + col;
                    if (px as f32) < bx1 || (px as f32) >= bx2 {
                        continue;
                    }
                    let offset = py * proto_side + px;
                    let logit: f32 = detection
                        .coeffs
                        .iter()
                        .enumerate()
                        .map(|(k, c)| c * protos[k * plane + offset])
                        .sum();
                    // sigmoid(logit) > 0.5
                    if logit > 0.0 {
                        values[row * width + col] = 1.0;
                    }
                }
            }

            Ok(Candidate {
                mask,
                class_id: detection.class_id,
                score: detection.score,
            })
        })
        .collect()
}

/// YOLOv8-seg ONNX export run through OpenCV DNN.
pub struct YoloSegmenter {
    // `Net::forward` mutates internal buffers, so calls are serialised.
    net: Mutex<Net>,
    config: SegmenterConfig,
}

impl YoloSegmenter {
    pub fn load(path: impl AsRef<Path>, config: SegmenterConfig) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_str().ok_or_else(|| {
            Error::Config(format!("model path {} is not valid UTF-8", path.display()))
        })?;
        if !path.exists() {
            return Err(Error::Config(format!(
                "segmentation model not found at {path_str}"
            )));
        }

        let net = read_net_from_onnx(path_str).map_err(Error::inference)?;
        if net.empty().map_err(Error::inference)? {
            return Err(Error::Config(format!(
                "segmentation model at {path_str} has no layers"
            )));
        }
        info!(path = path_str, input_size = config.input_size, "loaded segmentation model");

        Ok(Self {
            net: Mutex::new(net),
            config,
        })
    }

    fn forward(&self, blob: &Mat) -> Result<(Mat, Mat)> {
        let mut net = self
            .net
            .lock()
            .map_err(|_| Error::Inference("segmentation model lock poisoned".into()))?;

        net.set_input(blob, "", 1.0, Scalar::default())
            .map_err(Error::inference)?;
        let names = net
            .get_unconnected_out_layers_names()
            .map_err(Error::inference)?;
        let mut outputs = Vector::<Mat>::new();
        net.forward(&mut outputs, &names)
            .map_err(Error::inference)?;
        drop(net);

        if outputs.len() != 2 {
            return Err(Error::Inference(format!(
                "segmentation model should have 2 outputs, got {}",
                outputs.len()
            )));
        }

        let proto_side = (self.config.input_size / PROTO_DOWNSAMPLE) as usize;
        let proto_len = self.config.mask_channels * proto_side * proto_side;
        let first = outputs.get(0).map_err(Error::inference)?;
        let second = outputs.get(1).map_err(Error::inference)?;
        if first.total() == proto_len {
            Ok((second, first))
        } else {
            Ok((first, second))
        }
    }
}

impl RegionSegmenter for YoloSegmenter {
    #[instrument(skip_all, fields(width = image.width(), height = image.height()))]
    fn segment(&self, image: &RawImage) -> Result<SegmentationResult> {
        let letterbox = Letterbox::fit(image.width(), image.height(), self.config.input_size);
        let padded = letterbox.apply(image)?;

        // input is already RGB, so no channel swap
        let blob = blob_from_image(
            &padded,
            1.0 / 255.0,
            Size::new(letterbox.size, letterbox.size),
            Scalar::default(),
            false,
            false,
            CV_32F,
        )
        .map_err(Error::inference)?;

        let (preds, protos) = self.forward(&blob)?;
        let candidates = decode_outputs(
            preds.data_typed::<f32>().map_err(Error::inference)?,
            protos.data_typed::<f32>().map_err(Error::inference)?,
            &letterbox,
            &self.config,
        )?;
        debug!(candidates = candidates.len(), "segmentation finished");

        Ok(SegmentationResult { candidates })
    }
}
