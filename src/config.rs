use std::{
    fs::read_to_string,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::from_str;

use crate::error::{Error, Result};

/// How the segmentation output relates to the conjunctiva.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum MaskSemantics {
    /// The selected instance mask is the conjunctiva itself.
    #[default]
    DirectClassFilter,
    /// The selected mask covers the eyelid; the conjunctiva is its complement.
    InvertEyelid,
}

/// Which pixel population the colour means are taken over.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FeatureStrategy {
    /// Every pixel of the submitted (client-cropped) image, no segmentation.
    #[default]
    CropMean,
    /// Every pixel of the composited frame, zeroed background included.
    MaskedFrameMean,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ModelPaths {
    pub segmenter: PathBuf,
    pub regressor: PathBuf,
    pub feature_scaler: PathBuf,
    pub hb_scaler: PathBuf,
}

impl Default for ModelPaths {
    fn default() -> Self {
        Self {
            segmenter: PathBuf::from("model/conjunctiva-seg.onnx"),
            regressor: PathBuf::from("model/anemia_model.json"),
            feature_scaler: PathBuf::from("model/scaler.json"),
            hb_scaler: PathBuf::from("model/hb_scaler.json"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SegmenterConfig {
    /// Square letterbox side fed to the network.
    pub input_size: i32,
    pub confidence: f32,
    pub iou: f32,
    pub max_detections: usize,
    /// Number of mask prototype channels emitted by the model head.
    pub mask_channels: usize,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            input_size: 1024,
            confidence: 0.25,
            iou: 0.5,
            max_detections: 300,
            mask_channels: 32,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct SelectionConfig {
    pub target_class: i32,
    pub semantics: MaskSemantics,
}

impl Default for SelectionConfig {
    fn default() -> Self {
        Self {
            target_class: 0,
            semantics: MaskSemantics::DirectClassFilter,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RefineConfig {
    pub threshold: f32,
    pub kernel_size: i32,
    pub close: bool,
}

impl Default for RefineConfig {
    fn default() -> Self {
        Self {
            threshold: 0.35,
            kernel_size: 5,
            close: true,
        }
    }
}

impl RefineConfig {
    /// Parameters of the earlier eyelid-inversion pipeline.
    pub fn legacy() -> Self {
        Self {
            threshold: 0.5,
            kernel_size: 7,
            close: false,
        }
    }
}

/// Request-independent settings the pipeline consults on every call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineSettings {
    pub selection: SelectionConfig,
    pub refine: RefineConfig,
    pub features: FeatureStrategy,
    pub jpeg_quality: i32,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            selection: SelectionConfig::default(),
            refine: RefineConfig::default(),
            features: FeatureStrategy::default(),
            jpeg_quality: 75,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PipelineConfig {
    pub models: ModelPaths,
    pub segmenter: SegmenterConfig,
    pub decision_threshold: f64,
    /// Output name of the probability head of an ONNX regressor.
    pub regressor_class_output: Option<String>,
    #[serde(flatten)]
    pub settings: PipelineSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            models: ModelPaths::default(),
            segmenter: SegmenterConfig::default(),
            decision_threshold: 0.5,
            regressor_class_output: None,
            settings: PipelineSettings::default(),
        }
    }
}

impl PipelineConfig {
    /// Reads a JSON config; relative model paths resolve against the file's
    /// directory.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: PipelineConfig =
            from_str(&content).map_err(|e| Error::Config(e.to_string()))?;

        if let Some(base) = path.parent() {
            config.models.resolve_against(base);
        }
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let refine = &self.settings.refine;
        if !(refine.threshold > 0.0 && refine.threshold < 1.0) {
            return Err(Error::Config(format!(
                "refine.threshold must lie in (0, 1), got {}",
                refine.threshold
            )));
        }
        if refine.kernel_size < 1 || refine.kernel_size % 2 == 0 {
            return Err(Error::Config(format!(
                "refine.kernel_size must be a positive odd number, got {}",
                refine.kernel_size
            )));
        }
        if self.segmenter.input_size < 32 || self.segmenter.input_size % 32 != 0 {
            return Err(Error::Config(format!(
                "segmenter.input_size must be a positive multiple of 32, got {}",
                self.segmenter.input_size
            )));
        }
        for (name, value) in [
            ("segmenter.confidence", self.segmenter.confidence),
            ("segmenter.iou", self.segmenter.iou),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(Error::Config(format!(
                    "{name} must lie in [0, 1], got {value}"
                )));
            }
        }
        if !(0.0..1.0).contains(&self.decision_threshold) {
            return Err(Error::Config(format!(
                "decision_threshold must lie in [0, 1), got {}",
                self.decision_threshold
            )));
        }
        if !(1..=100).contains(&self.settings.jpeg_quality) {
            return Err(Error::Config(format!(
                "jpeg_quality must lie in [1, 100], got {}",
                self.settings.jpeg_quality
            )));
        }

        Ok(())
    }
}

impl ModelPaths {
    fn resolve_against(&mut self, base: &Path) {
        for path in [
            &mut self.segmenter,
            &mut self.regressor,
            &mut self.feature_scaler,
            &mut self.hb_scaler,
        ] {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_canonical() {
        let config = PipelineConfig::default();
        assert_eq!(config.settings.refine, RefineConfig::default());
        assert_eq!(config.settings.refine.threshold, 0.35);
        assert_eq!(config.settings.refine.kernel_size, 5);
        assert!(config.settings.refine.close);
        assert_eq!(
            config.settings.selection.semantics,
            MaskSemantics::DirectClassFilter
        );
        assert_eq!(config.settings.features, FeatureStrategy::CropMean);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: PipelineConfig = from_str(
            r#"{
                "selection": { "semantics": "invert-eyelid" },
                "refine": { "kernel_size": 7 },
                "features": "masked-frame-mean"
            }"#,
        )
        .unwrap();

        assert_eq!(
            config.settings.selection.semantics,
            MaskSemantics::InvertEyelid
        );
        assert_eq!(config.settings.selection.target_class, 0);
        assert_eq!(config.settings.refine.kernel_size, 7);
        assert_eq!(config.settings.refine.threshold, 0.35);
        assert_eq!(config.settings.features, FeatureStrategy::MaskedFrameMean);
        assert_eq!(config.segmenter.input_size, 1024);
    }

    #[test]
    fn rejects_even_kernel() {
        let mut config = PipelineConfig::default();
        config.settings.refine.kernel_size = 4;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_unaligned_input_size() {
        let mut config = PipelineConfig::default();
        config.segmenter.input_size = 1000;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn resolves_relative_model_paths() {
        let mut paths = ModelPaths::default();
        paths.resolve_against(Path::new("/srv/screening"));
        assert_eq!(
            paths.segmenter,
            PathBuf::from("/srv/screening/model/conjunctiva-seg.onnx")
        );
    }

    #[test]
    fn sample_config_matches_defaults() {
        let config: PipelineConfig = from_str(include_str!("../pipeline.example.json")).unwrap();
        config.validate().unwrap();

        let defaults = PipelineConfig::default();
        assert_eq!(config.models.regressor, defaults.models.regressor);
        assert_eq!(config.segmenter.input_size, defaults.segmenter.input_size);
        assert_eq!(config.settings.refine, defaults.settings.refine);
        assert_eq!(config.settings.features, defaults.settings.features);
        assert_eq!(
            config.settings.selection.semantics,
            defaults.settings.selection.semantics
        );
        assert_eq!(config.settings.jpeg_quality, defaults.settings.jpeg_quality);
    }
}
