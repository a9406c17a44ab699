use anyhow::{bail, Context, Result};
use clap::Parser;
use conjunctiva::{pipeline::isolate_region, Error, ModelBundle, PipelineConfig, RawImage};
use serde_json::to_string;
use std::{
    fs::{create_dir, read, read_dir, write},
    path::{Path, PathBuf},
};
use tracing::{info, warn, Level};

#[derive(Parser, Debug)]
struct Args {
    /// Image file or directory of images.
    #[arg(short, long)]
    input: PathBuf,

    /// Overlay JPEG path, or directory when `input` is a directory.
    #[arg(short, long)]
    output: PathBuf,

    /// Pipeline configuration (JSON). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Also write the `Segment` record as JSON next to each overlay.
    #[arg(long)]
    json: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn perform_segmentation(
    bundle: &ModelBundle,
    image_filepath: &Path,
    overlay_filepath: &Path,
    json: bool,
) -> Result<()> {
    let bytes = read(image_filepath)?;
    let image = RawImage::from_bytes(&bytes)?;

    let region = isolate_region(bundle, &image)
        .with_context(|| format!("Segmentation of \"{}\" failed", image_filepath.display()))?;

    let segment = region.to_segment(bundle.settings().jpeg_quality)?;
    write(overlay_filepath, &segment.overlay)?;
    if json {
        write(overlay_filepath.with_extension("json"), to_string(&segment)?)?;
    }
    info!(
        image = %image_filepath.display(),
        overlay = %overlay_filepath.display(),
        class_id = segment.class_id,
        score = segment.score,
        "bottom eyelid isolated"
    );

    Ok(())
}

fn is_no_region(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<Error>(), Some(Error::NoRegionDetected))
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .init();

    let config = match &args.config {
        Some(path) => PipelineConfig::from_file(path)?,
        None => PipelineConfig::default(),
    };
    let bundle = ModelBundle::load(&config)?;

    match (
        args.input.is_dir(),
        args.output.is_dir(),
        args.output.exists(),
    ) {
        (false, false, _) => {
            perform_segmentation(&bundle, &args.input, &args.output, args.json)?;
        }
        (true, true, true) | (true, false, false) => {
            if !args.output.exists() {
                create_dir(&args.output)?;
            }

            let mut image_filepaths = Vec::new();
            for entry in read_dir(&args.input)? {
                let path = entry?.path();
                if path.is_file() {
                    image_filepaths.push(path);
                }
            }
            image_filepaths.sort();

            for image_filepath in image_filepaths.drain(..) {
                let Some(image_stem) = image_filepath.file_stem().and_then(|s| s.to_str()) else {
                    warn!(image = %image_filepath.display(), "skipping file with non UTF-8 name");
                    continue;
                };
                let overlay_filepath = args.output.join(format!("{}.jpg", image_stem));

                // one bad image must not abort the batch
                match perform_segmentation(&bundle, &image_filepath, &overlay_filepath, args.json)
                {
                    Ok(()) => {}
                    Err(e) if is_no_region(&e) => {
                        warn!(image = %image_filepath.display(), "No mask detected");
                    }
                    Err(e) => {
                        warn!(image = %image_filepath.display(), error = %e, "segmentation failed");
                    }
                }
            }
        }
        _ => bail!("Invalid combination of input and output paths."),
    }

    Ok(())
}
