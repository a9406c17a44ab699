use std::{fs::read_to_string, path::Path};

use serde::{Deserialize, Serialize};
use serde_json::from_str;

use crate::error::{Error, Result};

/// Previously fitted per-feature affine transform, as exported from the
/// training environment's `StandardScaler` / `MinMaxScaler` attributes.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Scaler {
    /// `(x - mean) / scale`
    Standard { mean: Vec<f64>, scale: Vec<f64> },
    /// `x * scale + min`
    MinMax { min: Vec<f64>, scale: Vec<f64> },
}

impl Scaler {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = read_to_string(path).map_err(|source| Error::Io {
            path: path.display().to_string(),
            source,
        })?;
        let scaler: Scaler = from_str(&content)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        scaler.validate()?;

        Ok(scaler)
    }

    pub fn validate(&self) -> Result<()> {
        let (offset, scale) = self.parts();
        if offset.is_empty() || offset.len() != scale.len() {
            return Err(Error::Config(format!(
                "scaler has {} offsets and {} scales",
                offset.len(),
                scale.len()
            )));
        }
        if scale.iter().any(|s| *s == 0.0 || !s.is_finite()) || offset.iter().any(|o| !o.is_finite())
        {
            return Err(Error::Config(
                "scaler parameters must be finite with non-zero scales".into(),
            ));
        }

        Ok(())
    }

    pub fn width(&self) -> usize {
        self.parts().0.len()
    }

    fn parts(&self) -> (&[f64], &[f64]) {
        match self {
            Scaler::Standard { mean, scale } => (mean, scale),
            Scaler::MinMax { min, scale } => (min, scale),
        }
    }

    pub fn transform(&self, values: &[f64]) -> Result<Vec<f64>> {
        self.check_width(values)?;
        let out: Vec<f64> = match self {
            Scaler::Standard { mean, scale } => values
                .iter()
                .zip(mean.iter().zip(scale))
                .map(|(x, (m, s))| (x - m) / s)
                .collect(),
            Scaler::MinMax { min, scale } => values
                .iter()
                .zip(min.iter().zip(scale))
                .map(|(x, (m, s))| x * s + m)
                .collect(),
        };

        finite(out)
    }

    pub fn inverse_transform(&self, values: &[f64]) -> Result<Vec<f64>> {
        self.check_width(values)?;
        let out: Vec<f64> = match self {
            Scaler::Standard { mean, scale } => values
                .iter()
                .zip(mean.iter().zip(scale))
                .map(|(x, (m, s))| x * s + m)
                .collect(),
            Scaler::MinMax { min, scale } => values
                .iter()
                .zip(min.iter().zip(scale))
                .map(|(x, (m, s))| (x - m) / s)
                .collect(),
        };

        finite(out)
    }

    fn check_width(&self, values: &[f64]) -> Result<()> {
        if values.len() != self.width() {
            return Err(Error::Inference(format!(
                "scaler expects {} features, got {}",
                self.width(),
                values.len()
            )));
        }
        Ok(())
    }
}

fn finite(values: Vec<f64>) -> Result<Vec<f64>> {
    if values.iter().all(|v| v.is_finite()) {
        Ok(values)
    } else {
        Err(Error::Inference(format!(
            "scaler produced non-finite values {values:?}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn standard_scaler_round_trips() {
        let scaler = Scaler::Standard {
            mean: vec![150.0, 70.0, 70.0],
            scale: vec![20.0, 10.0, 5.0],
        };
        let scaled = scaler.transform(&[170.0, 60.0, 70.0]).unwrap();
        assert_eq!(scaled, vec![1.0, -1.0, 0.0]);
        assert_eq!(
            scaler.inverse_transform(&scaled).unwrap(),
            vec![170.0, 60.0, 70.0]
        );
    }

    #[test]
    fn min_max_inverse_recovers_hemoglobin() {
        // fitted on hb in [4, 18]: scale = 1/14, min = -4/14
        let scaler = Scaler::MinMax {
            min: vec![-4.0 / 14.0],
            scale: vec![1.0 / 14.0],
        };
        let hb = scaler.inverse_transform(&[0.5]).unwrap()[0];
        assert!((hb - 11.0).abs() < 1e-9);
    }

    #[test]
    fn width_mismatch_is_inference_error() {
        let scaler = Scaler::Standard {
            mean: vec![0.0; 3],
            scale: vec![1.0; 3],
        };
        assert!(matches!(
            scaler.transform(&[1.0, 2.0]),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn non_finite_output_is_rejected() {
        let scaler = Scaler::Standard {
            mean: vec![0.0],
            scale: vec![1e-300],
        };
        assert!(matches!(
            scaler.transform(&[1e300]),
            Err(Error::Inference(_))
        ));
    }

    #[test]
    fn parses_tagged_json() {
        let scaler: Scaler =
            from_str(r#"{ "kind": "standard", "mean": [1.0], "scale": [2.0] }"#).unwrap();
        assert_eq!(scaler.width(), 1);
        assert!(scaler.validate().is_ok());

        let zero: Scaler =
            from_str(r#"{ "kind": "min_max", "min": [0.0], "scale": [0.0] }"#).unwrap();
        assert!(matches!(zero.validate(), Err(Error::Config(_))));
    }
}
