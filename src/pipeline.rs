use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::{
    bundle::ModelBundle,
    composite::{composite, ColorFeatures},
    config::FeatureStrategy,
    decode::{decode_payload, RawImage},
    error::Result,
    model::{HbBand, PredictionResult},
    refine::{refine, RefinedMask},
    segment::Segment,
    select::select_mask,
};

/// Body of a screening request: an image payload plus who submitted it.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ScreeningRequest {
    pub image: String,
    #[serde(default)]
    pub username: Option<String>,
}

/// The conjunctiva cut out of one image.
#[derive(Debug)]
pub struct SegmentedRegion {
    pub composite: RawImage,
    pub mask: RefinedMask,
    pub class_id: i32,
    pub score: f32,
}

impl SegmentedRegion {
    pub fn to_segment(&self, jpeg_quality: i32) -> Result<Segment> {
        Ok(Segment {
            message: "bottom eyelid isolated".into(),
            class_id: self.class_id,
            score: self.score,
            overlay: self.composite.encode_jpeg(jpeg_quality)?,
            mask: self.mask.to_png()?,
        })
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct Screening {
    #[serde(flatten)]
    pub prediction: PredictionResult,
    pub band: HbBand,
    pub rgb: ColorFeatures,
}

/// Segments, selects, refines and composites an already decoded image.
pub fn isolate_region(bundle: &ModelBundle, image: &RawImage) -> Result<SegmentedRegion> {
    let settings = bundle.settings();

    let segmentation = bundle.segmenter().segment(image)?;
    debug!(candidates = segmentation.len(), "segmentation candidates");
    let chosen = select_mask(&segmentation, settings.selection.target_class)?;

    let mask = refine(
        &chosen.mask,
        image.width(),
        image.height(),
        settings.selection.semantics,
        &settings.refine,
    )?;
    let composite = composite(image, &mask)?;

    Ok(SegmentedRegion {
        composite,
        mask,
        class_id: chosen.class_id,
        score: chosen.score,
    })
}

#[instrument(skip_all, fields(payload_len = payload.len()))]
pub fn segment_conjunctiva(bundle: &ModelBundle, payload: &str) -> Result<SegmentedRegion> {
    let image = decode_payload(payload)?;
    isolate_region(bundle, &image)
}

/// Colour features under the bundle's configured strategy. Always computed
/// from decoded pixels, never from a re-encoded overlay.
pub fn extract_features(bundle: &ModelBundle, image: &RawImage) -> Result<ColorFeatures> {
    match bundle.settings().features {
        FeatureStrategy::CropMean => ColorFeatures::of(image),
        FeatureStrategy::MaskedFrameMean => {
            let region = isolate_region(bundle, image)?;
            ColorFeatures::of(&region.composite)
        }
    }
}

pub fn predict_image(bundle: &ModelBundle, image: &RawImage) -> Result<Screening> {
    let rgb = extract_features(bundle, image)?;
    debug!(r = rgb.r_mean, g = rgb.g_mean, b = rgb.b_mean, "colour features");

    let prediction = bundle.predictor().predict(&rgb)?;

    Ok(Screening {
        band: prediction.band(),
        prediction,
        rgb,
    })
}

#[instrument(skip_all, fields(payload_len = payload.len()))]
pub fn predict(bundle: &ModelBundle, payload: &str) -> Result<Screening> {
    let image = decode_payload(payload)?;
    predict_image(bundle, &image)
}
