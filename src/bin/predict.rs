use std::{
    fs::{read_dir, File},
    future::Future,
    path::PathBuf,
    sync::Arc,
};

use anyhow::{bail, Result};
use clap::Parser;
use conjunctiva::{
    pipeline::predict_image,
    predict,
    record::{RecordSink, ScreeningRecord},
    ModelBundle, PipelineConfig, RawImage, Screening, ScreeningRequest,
};
use futures::{stream, StreamExt};
use serde::Serialize;
use serde_json::{from_slice, to_writer_pretty};
use tokio::{fs::read, task::spawn_blocking};
use tracing::{error, info, warn, Level};

#[derive(Parser, Debug)]
struct Args {
    /// Image file, JSON request file (`{"image": ..., "username": ...}`), or a
    /// directory of either.
    #[arg(short, long)]
    input: PathBuf,

    /// Where to write the JSON results; stdout when omitted.
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Pipeline configuration (JSON). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Identity recorded for plain image inputs.
    #[arg(short, long)]
    username: Option<String>,

    /// POST each successful screening to this URL.
    #[arg(long, conflicts_with = "records_file")]
    records_url: Option<String>,

    /// Append each successful screening to this JSON lines file.
    #[arg(long)]
    records_file: Option<PathBuf>,

    /// Inputs read and screened at the same time.
    #[arg(short, long, default_value_t = 4)]
    jobs: usize,

    #[arg(short, long)]
    verbose: bool,
}

#[derive(Serialize, Debug)]
struct Outcome {
    input: PathBuf,
    #[serde(flatten)]
    screening: Option<Screening>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_correctable: Option<bool>,
}

enum Input {
    Image(Vec<u8>),
    Request(ScreeningRequest),
}

async fn load_input(path: &PathBuf) -> Result<Input> {
    let bytes = read(path).await?;
    if path.extension().is_some_and(|ext| ext == "json") {
        Ok(Input::Request(from_slice(&bytes)?))
    } else {
        Ok(Input::Image(bytes))
    }
}

/// Runs `job` over `inputs` with at most `jobs` futures alive at once.
/// Results come back in input order.
async fn run_bounded<I, T, F, Fut>(inputs: Vec<I>, jobs: usize, job: F) -> Vec<T>
where
    F: FnMut(I) -> Fut,
    Fut: Future<Output = T>,
{
    stream::iter(inputs)
        .map(job)
        .buffered(jobs.max(1))
        .collect()
        .await
}

async fn screen(
    bundle: Arc<ModelBundle>,
    sink: Option<Arc<RecordSink>>,
    default_username: Option<String>,
    path: PathBuf,
) -> Outcome {
    let input = match load_input(&path).await {
        Ok(input) => input,
        Err(e) => {
            return Outcome {
                input: path,
                screening: None,
                error: Some(e.to_string()),
                user_correctable: None,
            }
        }
    };

    let (identity, result) = match input {
        Input::Image(bytes) => {
            let result = spawn_blocking(move || {
                let image = RawImage::from_bytes(&bytes)?;
                predict_image(&bundle, &image)
            })
            .await;
            (default_username, result)
        }
        Input::Request(request) => {
            let identity = request.username.or(default_username);
            let result = spawn_blocking(move || predict(&bundle, &request.image)).await;
            (identity, result)
        }
    };

    let screening = match result {
        Ok(Ok(screening)) => screening,
        Ok(Err(e)) => {
            warn!(input = %path.display(), error = %e, "screening failed");
            return Outcome {
                input: path,
                screening: None,
                user_correctable: Some(e.is_user_correctable()),
                error: Some(e.to_string()),
            };
        }
        Err(join_error) => {
            error!(input = %path.display(), error = %join_error, "screening worker panicked");
            return Outcome {
                input: path,
                screening: None,
                error: Some(join_error.to_string()),
                user_correctable: Some(false),
            };
        }
    };
    info!(
        input = %path.display(),
        anaemia = screening.prediction.anaemia,
        hb = screening.prediction.hb,
        "screening finished"
    );

    if let (Some(sink), Some(identity)) = (sink, identity) {
        let record = ScreeningRecord::new(identity, &screening);
        if let Err(e) = sink.store(&record).await {
            warn!(input = %path.display(), error = %e, "failed to hand off screening record");
        }
    }

    Outcome {
        input: path,
        screening: Some(screening),
        error: None,
        user_correctable: None,
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .with_writer(std::io::stderr)
        .init();

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let bundle = Arc::new(spawn_blocking(move || ModelBundle::load(&config)).await??);

    let sink = match (&args.records_url, &args.records_file) {
        (Some(url), _) => Some(Arc::new(RecordSink::http(url.clone()))),
        (None, Some(path)) => Some(Arc::new(RecordSink::json_lines(path.clone()))),
        (None, None) => None,
    };

    let input_filepaths = match args.input.is_dir() {
        true => {
            let mut paths = Vec::new();
            for entry in read_dir(&args.input)? {
                let path = entry?.path();
                if path.is_file() {
                    paths.push(path);
                }
            }
            paths.sort();
            paths
        }
        false if args.input.exists() => vec![args.input.clone()],
        false => bail!("Input \"{}\" does not exist.", args.input.display()),
    };

    let outcomes = run_bounded(input_filepaths, args.jobs, |path| {
        screen(
            bundle.clone(),
            sink.clone(),
            args.username.clone(),
            path,
        )
    })
    .await;

    match &args.output {
        Some(path) => to_writer_pretty(File::create(path)?, &outcomes)?,
        None => to_writer_pretty(std::io::stdout().lock(), &outcomes)?,
    }

    Ok(())
}
