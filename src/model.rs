use std::{fs::read_to_string, path::Path, sync::Mutex};

use opencv::{
    core::{Mat, Scalar, Vector, CV_32FC1},
    dnn::{read_net_from_onnx, Net},
    prelude::*,
};
use serde::{Deserialize, Serialize};
use serde_json::from_str;
use tracing::{debug, info};

use crate::{
    composite::ColorFeatures,
    error::{Error, Result},
    scaler::Scaler,
};

/// Dual-head model: scaled colour features in, `(probability, scaled hb)` out.
pub trait Regressor: Send + Sync {
    fn feature_width(&self) -> usize;
    fn forward(&self, features: &[f64]) -> Result<(f64, f64)>;

    /// Structural check run once when a [`Predictor`] is assembled.
    fn validate(&self) -> Result<()> {
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
    Tanh,
}

impl Activation {
    fn apply(self, x: f64) -> f64 {
        match self {
            Activation::Linear => x,
            Activation::Relu => x.max(0.0),
            Activation::Sigmoid => 1.0 / (1.0 + (-x).exp()),
            Activation::Tanh => x.tanh(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DenseLayer {
    /// `[inputs][outputs]`, the Keras kernel layout.
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
    pub activation: Activation,
}

impl DenseLayer {
    fn input_width(&self) -> usize {
        self.weights.len()
    }

    fn output_width(&self) -> usize {
        self.bias.len()
    }

    fn forward(&self, input: &[f64]) -> Vec<f64> {
        (0..self.output_width())
            .map(|j| {
                let z: f64 = input
                    .iter()
                    .zip(&self.weights)
                    .map(|(x, row)| x * row[j])
                    .sum();
                self.activation.apply(z + self.bias[j])
            })
            .collect()
    }
}

/// Fully connected network with a shared trunk and two single-unit heads,
/// evaluated in f64 from exported layer weights.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DenseRegressor {
    pub input_width: usize,
    pub trunk: Vec<DenseLayer>,
    pub class_head: Vec<DenseLayer>,
    pub hb_head: Vec<DenseLayer>,
}

impl DenseRegressor {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let model: DenseRegressor = from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        model.validate()?;

        Ok(model)
    }

    pub fn validate(&self) -> Result<()> {
        self.check_shapes().map_err(Error::Config)
    }

    fn check_shapes(&self) -> std::result::Result<(), String> {
        let trunk_width = chain_width("trunk", &self.trunk, self.input_width)?;
        for (name, head) in [("class_head", &self.class_head), ("hb_head", &self.hb_head)] {
            if head.is_empty() {
                return Err(format!("{name} has no layers"));
            }
            let width = chain_width(name, head, trunk_width)?;
            if width != 1 {
                return Err(format!("{name} must end in a single unit, got {width}"));
            }
        }

        Ok(())
    }
}

fn chain_width(
    name: &str,
    layers: &[DenseLayer],
    input: usize,
) -> std::result::Result<usize, String> {
    layers.iter().enumerate().try_fold(input, |width, (i, layer)| {
        if layer.input_width() != width
            || layer.weights.iter().any(|row| row.len() != layer.output_width())
        {
            return Err(format!(
                "{name} layer {i} expects {}x{} weights, input width is {width}",
                layer.input_width(),
                layer.output_width()
            ));
        }
        Ok(layer.output_width())
    })
}

fn run(layers: &[DenseLayer], input: Vec<f64>) -> Vec<f64> {
    layers.iter().fold(input, |x, layer| layer.forward(&x))
}

impl Regressor for DenseRegressor {
    fn feature_width(&self) -> usize {
        self.input_width
    }

    fn forward(&self, features: &[f64]) -> Result<(f64, f64)> {
        if features.len() != self.input_width {
            return Err(Error::Inference(format!(
                "model expects {} features, got {}",
                self.input_width,
                features.len()
            )));
        }
        // public fields, so the layer shapes are rechecked before indexing
        self.check_shapes().map_err(Error::Inference)?;

        let hidden = run(&self.trunk, features.to_vec());
        let probability = run(&self.class_head, hidden.clone())[0];
        let hb_scaled = run(&self.hb_head, hidden)[0];

        Ok((probability, hb_scaled))
    }

    fn validate(&self) -> Result<()> {
        DenseRegressor::validate(self)
    }
}

/// ONNX export of the dual-head model run through OpenCV DNN.
pub struct OnnxRegressor {
    // the output names travel with the net they belong to
    session: Mutex<(Net, Vector<String>)>,
    input_width: usize,
    /// Position of the class head among the outputs; the other is the hb head.
    class_index: usize,
}

impl OnnxRegressor {
    /// `class_output` names the probability head when the export's output
    /// order is not class-first.
    pub fn load(path: impl AsRef<Path>, class_output: Option<&str>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.to_str().ok_or_else(|| {
            Error::Config(format!("model path {} is not valid UTF-8", path.display()))
        })?;
        if !path.exists() {
            return Err(Error::Config(format!("regression model not found at {path_str}")));
        }

        let net = read_net_from_onnx(path_str).map_err(Error::inference)?;
        let outputs = net
            .get_unconnected_out_layers_names()
            .map_err(Error::inference)?;
        if outputs.len() != 2 {
            return Err(Error::Config(format!(
                "regression model must expose 2 outputs, found {}",
                outputs.len()
            )));
        }
        let class_index = match class_output {
            Some(name) => outputs.iter().position(|o| o == name).ok_or_else(|| {
                Error::Config(format!("regression model has no output named {name}"))
            })?,
            None => 0,
        };
        info!(path = path_str, class_index, "loaded regression model");

        Ok(Self {
            session: Mutex::new((net, outputs)),
            input_width: 3,
            class_index,
        })
    }
}

fn scalar_output(mat: &Mat) -> Result<f64> {
    let values = mat.data_typed::<f32>().map_err(Error::inference)?;
    match values {
        [value] => Ok(*value as f64),
        _ => Err(Error::Inference(format!(
            "expected a single output value, got {}",
            values.len()
        ))),
    }
}

impl Regressor for OnnxRegressor {
    fn feature_width(&self) -> usize {
        self.input_width
    }

    fn forward(&self, features: &[f64]) -> Result<(f64, f64)> {
        if features.len() != self.input_width {
            return Err(Error::Inference(format!(
                "model expects {} features, got {}",
                self.input_width,
                features.len()
            )));
        }

        let mut blob =
            Mat::new_rows_cols_with_default(1, self.input_width as i32, CV_32FC1, Scalar::all(0.0))
                .map_err(Error::inference)?;
        blob.data_typed_mut::<f32>()
            .map_err(Error::inference)?
            .iter_mut()
            .zip(features)
            .for_each(|(slot, v)| *slot = *v as f32);

        let mut session = self
            .session
            .lock()
            .map_err(|_| Error::Inference("regression model lock poisoned".into()))?;
        let (net, outputs) = &mut *session;
        net.set_input(&blob, "", 1.0, Scalar::default())
            .map_err(Error::inference)?;
        let mut results = Vector::<Mat>::new();
        net.forward(&mut results, outputs)
            .map_err(Error::inference)?;
        drop(session);

        let hb_index = 1 - self.class_index;
        let probability = scalar_output(&results.get(self.class_index).map_err(Error::inference)?)?;
        let hb_scaled = scalar_output(&results.get(hb_index).map_err(Error::inference)?)?;

        Ok((probability, hb_scaled))
    }
}

/// Picks the regressor implementation from the file extension.
pub fn load_regressor(
    path: impl AsRef<Path>,
    class_output: Option<&str>,
) -> Result<Box<dyn Regressor>> {
    let path = path.as_ref();
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Ok(Box::new(DenseRegressor::from_file(path)?)),
        Some("onnx") => Ok(Box::new(OnnxRegressor::load(path, class_output)?)),
        _ => Err(Error::Config(format!(
            "unsupported regression model format: {}",
            path.display()
        ))),
    }
}

/// Interpretation band of a hemoglobin estimate.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HbBand {
    Normal,
    Mild,
    Moderate,
    Severe,
}

impl HbBand {
    pub fn of(hb: f64) -> Self {
        if hb >= 12.0 {
            HbBand::Normal
        } else if hb >= 10.0 {
            HbBand::Mild
        } else if hb >= 8.0 {
            HbBand::Moderate
        } else {
            HbBand::Severe
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq)]
pub struct PredictionResult {
    pub anaemia: bool,
    /// g/dL, unclamped.
    pub hb: f64,
}

impl PredictionResult {
    pub fn band(&self) -> HbBand {
        HbBand::of(self.hb)
    }
}

/// Regressor plus the scalers it was trained with.
pub struct Predictor {
    regressor: Box<dyn Regressor>,
    feature_scaler: Scaler,
    hb_scaler: Scaler,
    decision_threshold: f64,
}

impl Predictor {
    pub fn new(
        regressor: Box<dyn Regressor>,
        feature_scaler: Scaler,
        hb_scaler: Scaler,
        decision_threshold: f64,
    ) -> Result<Self> {
        regressor.validate()?;
        if feature_scaler.width() != regressor.feature_width() {
            return Err(Error::Config(format!(
                "feature scaler has width {} but the model expects {}",
                feature_scaler.width(),
                regressor.feature_width()
            )));
        }
        if hb_scaler.width() != 1 {
            return Err(Error::Config(format!(
                "hemoglobin scaler must have width 1, got {}",
                hb_scaler.width()
            )));
        }

        Ok(Self {
            regressor,
            feature_scaler,
            hb_scaler,
            decision_threshold,
        })
    }

    pub fn predict(&self, features: &ColorFeatures) -> Result<PredictionResult> {
        let scaled = self.feature_scaler.transform(&features.as_array())?;
        if scaled.len() != self.regressor.feature_width() {
            return Err(Error::Inference(format!(
                "model expects {} features, got {}",
                self.regressor.feature_width(),
                scaled.len()
            )));
        }

        let (probability, hb_scaled) = self.regressor.forward(&scaled)?;
        if !probability.is_finite() || !hb_scaled.is_finite() {
            return Err(Error::Inference(format!(
                "model produced non-finite output (probability {probability}, hb {hb_scaled})"
            )));
        }
        let hb = self.hb_scaler.inverse_transform(&[hb_scaled])?[0];
        debug!(probability, hb_scaled, hb, "model output");

        Ok(PredictionResult {
            anaemia: probability > self.decision_threshold,
            hb,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(weights: Vec<Vec<f64>>, bias: Vec<f64>, activation: Activation) -> DenseLayer {
        DenseLayer {
            weights,
            bias,
            activation,
        }
    }

    /// Fixed weights shared by the golden cases.
    fn golden_model() -> DenseRegressor {
        DenseRegressor {
            input_width: 3,
            trunk: vec![layer(
                vec![vec![1.0, -1.0], vec![0.5, 0.5], vec![-0.5, 1.0]],
                vec![0.5, -0.5],
                Activation::Relu,
            )],
            class_head: vec![layer(vec![vec![1.0], vec![2.0]], vec![-1.0], Activation::Sigmoid)],
            hb_head: vec![layer(vec![vec![0.4], vec![-0.2]], vec![0.3], Activation::Linear)],
        }
    }

    fn predictor(model: DenseRegressor) -> Predictor {
        Predictor::new(
            Box::new(model),
            Scaler::Standard {
                mean: vec![150.0, 70.0, 70.0],
                scale: vec![25.0, 15.0, 15.0],
            },
            Scaler::MinMax {
                min: vec![-4.0 / 14.0],
                scale: vec![1.0 / 14.0],
            },
            0.5,
        )
        .unwrap()
    }

    #[test]
    fn zero_scaled_features_are_golden() {
        // hidden = relu([0.5, -0.5]) = [0.5, 0]
        let (probability, hb_scaled) = golden_model().forward(&[0.0, 0.0, 0.0]).unwrap();
        assert!((probability - 1.0 / (1.0 + 0.5f64.exp())).abs() < 1e-12);
        assert!((hb_scaled - 0.5).abs() < 1e-12);

        let features = ColorFeatures {
            r_mean: 150.0,
            g_mean: 70.0,
            b_mean: 70.0,
        };
        let result = predictor(golden_model()).predict(&features).unwrap();
        assert!(!result.anaemia);
        assert!((result.hb - 11.0).abs() < 1e-9);
        assert_eq!(result.band(), HbBand::Mild);
    }

    #[test]
    fn probability_above_half_flags_anaemia() {
        let mut model = golden_model();
        model.class_head[0].bias = vec![1.0];
        let features = ColorFeatures {
            r_mean: 150.0,
            g_mean: 70.0,
            b_mean: 70.0,
        };
        assert!(predictor(model).predict(&features).unwrap().anaemia);
    }

    #[test]
    fn non_finite_output_is_an_error() {
        let mut model = golden_model();
        model.hb_head[0].bias = vec![f64::NAN];
        let features = ColorFeatures {
            r_mean: 150.0,
            g_mean: 70.0,
            b_mean: 70.0,
        };
        assert!(matches!(
            predictor(model).predict(&features),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn wrong_feature_width_is_an_error() {
        assert!(matches!(
            golden_model().forward(&[0.0, 0.0]),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn mismatched_layers_fail_validation() {
        let mut model = golden_model();
        model.class_head[0].weights.push(vec![1.0]);
        assert!(matches!(model.validate(), Err(Error::Config(_))));
        assert!(golden_model().validate().is_ok());
    }

    #[test]
    fn predictor_rejects_model_without_class_head() {
        let mut model = golden_model();
        model.class_head.clear();

        let result = Predictor::new(
            Box::new(model),
            Scaler::Standard {
                mean: vec![0.0; 3],
                scale: vec![1.0; 3],
            },
            Scaler::Standard {
                mean: vec![0.0],
                scale: vec![1.0],
            },
            0.5,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn malformed_layers_fail_forward_instead_of_panicking() {
        let mut empty_head = golden_model();
        empty_head.class_head.clear();
        assert!(matches!(
            empty_head.forward(&[0.0, 0.0, 0.0]),
            Err(Error::Inference(_))
        ));

        let mut short_row = golden_model();
        short_row.hb_head[0].weights[1].clear();
        assert!(matches!(
            short_row.forward(&[0.0, 0.0, 0.0]),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn predictor_rejects_wide_hb_scaler() {
        let result = Predictor::new(
            Box::new(golden_model()),
            Scaler::Standard {
                mean: vec![0.0; 3],
                scale: vec![1.0; 3],
            },
            Scaler::Standard {
                mean: vec![0.0; 2],
                scale: vec![1.0; 2],
            },
            0.5,
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn hb_bands() {
        assert_eq!(HbBand::of(13.1), HbBand::Normal);
        assert_eq!(HbBand::of(12.0), HbBand::Normal);
        assert_eq!(HbBand::of(10.5), HbBand::Mild);
        assert_eq!(HbBand::of(8.0), HbBand::Moderate);
        assert_eq!(HbBand::of(6.2), HbBand::Severe);
    }

    #[test]
    fn unknown_model_format_is_rejected() {
        assert!(matches!(
            load_regressor("model/anemia_model.h5", None),
            Err(Error::Config(_))
        ));
    }
}
