use std::path::PathBuf;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{fs::OpenOptions, io::AsyncWriteExt, sync::Mutex};
use tracing::debug;

use crate::pipeline::Screening;

/// What the persistence collaborator receives after a successful prediction.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ScreeningRecord {
    pub identity: String,
    pub anaemia: bool,
    pub hb: f64,
    pub created_at: DateTime<Utc>,
}

impl ScreeningRecord {
    pub fn new(identity: impl Into<String>, screening: &Screening) -> Self {
        Self {
            identity: identity.into(),
            anaemia: screening.prediction.anaemia,
            hb: screening.prediction.hb,
            created_at: Utc::now(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to reach record store: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Record store rejected the record with status {0}")]
    Status(u16),
    #[error("Failed to append record: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// Write-only destination for screening records.
pub enum RecordSink {
    /// POSTs each record as JSON.
    Http { client: Client, url: String },
    /// Appends one JSON object per line.
    JsonLines { path: PathBuf, lock: Mutex<()> },
}

impl RecordSink {
    pub fn http(url: impl Into<String>) -> Self {
        RecordSink::Http {
            client: Client::new(),
            url: url.into(),
        }
    }

    pub fn json_lines(path: impl Into<PathBuf>) -> Self {
        RecordSink::JsonLines {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub async fn store(&self, record: &ScreeningRecord) -> Result<(), SinkError> {
        match self {
            RecordSink::Http { client, url } => {
                let res = client.post(url).json(record).send().await?;
                if !res.status().is_success() {
                    return Err(SinkError::Status(res.status().as_u16()));
                }
            }
            RecordSink::JsonLines { path, lock } => {
                let mut line = serde_json::to_vec(record)?;
                line.push(b'\n');

                let _guard = lock.lock().await;
                let mut file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .await?;
                file.write_all(&line).await?;
                file.flush().await?;
            }
        }
        debug!(identity = %record.identity, "stored screening record");

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        composite::ColorFeatures,
        model::{HbBand, PredictionResult},
    };

    fn screening(anaemia: bool, hb: f64) -> Screening {
        Screening {
            prediction: PredictionResult { anaemia, hb },
            band: HbBand::of(hb),
            rgb: ColorFeatures {
                r_mean: 180.0,
                g_mean: 90.0,
                b_mean: 85.0,
            },
        }
    }

    #[tokio::test]
    async fn json_lines_appends_one_record_per_line() {
        let path = std::env::temp_dir().join(format!(
            "conjunctiva-records-{}-{}.jsonl",
            std::process::id(),
            Utc::now().timestamp_nanos_opt().unwrap_or_default()
        ));
        let sink = RecordSink::json_lines(&path);

        let first = ScreeningRecord::new("alice@example.com", &screening(true, 9.1));
        let second = ScreeningRecord::new("bob@example.com", &screening(false, 13.4));
        sink.store(&first).await.unwrap();
        sink.store(&second).await.unwrap();

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let records: Vec<ScreeningRecord> = content
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records, vec![first, second]);

        tokio::fs::remove_file(&path).await.unwrap();
    }

    #[test]
    fn record_copies_prediction() {
        let record = ScreeningRecord::new("carol", &screening(true, 7.5));
        assert_eq!(record.identity, "carol");
        assert!(record.anaemia);
        assert_eq!(record.hb, 7.5);
    }
}
