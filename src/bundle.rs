use tracing::info;

use crate::{
    config::{PipelineConfig, PipelineSettings},
    error::Result,
    model::{load_regressor, Predictor},
    scaler::Scaler,
    segmenter::{RegionSegmenter, YoloSegmenter},
};

/// Everything a request needs that outlives the request: both models, the
/// fitted scalers and the pipeline settings. Built once, then only read.
pub struct ModelBundle {
    segmenter: Box<dyn RegionSegmenter>,
    predictor: Predictor,
    settings: PipelineSettings,
}

impl ModelBundle {
    pub fn new(
        segmenter: Box<dyn RegionSegmenter>,
        predictor: Predictor,
        settings: PipelineSettings,
    ) -> Self {
        Self {
            segmenter,
            predictor,
            settings,
        }
    }

    pub fn load(config: &PipelineConfig) -> Result<Self> {
        config.validate()?;
        let models = &config.models;

        let segmenter = YoloSegmenter::load(&models.segmenter, config.segmenter.clone())?;
        let regressor = load_regressor(
            &models.regressor,
            config.regressor_class_output.as_deref(),
        )?;
        let predictor = Predictor::new(
            regressor,
            Scaler::from_file(&models.feature_scaler)?,
            Scaler::from_file(&models.hb_scaler)?,
            config.decision_threshold,
        )?;
        info!(
            semantics = ?config.settings.selection.semantics,
            features = ?config.settings.features,
            "model bundle ready"
        );

        Ok(Self::new(
            Box::new(segmenter),
            predictor,
            config.settings.clone(),
        ))
    }

    pub fn segmenter(&self) -> &dyn RegionSegmenter {
        self.segmenter.as_ref()
    }

    pub fn predictor(&self) -> &Predictor {
        &self.predictor
    }

    pub fn settings(&self) -> &PipelineSettings {
        &self.settings
    }
}
