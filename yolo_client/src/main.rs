mod args;
mod client;

use args::Args;
use base64::{prelude::BASE64_STANDARD, Engine};
use clap::Parser;
use client::{annotated_paths, PredictClient};
use serde::Serialize;
use std::{path::Path, time::Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use yolo_schema::{Detection, SpeedLog};

#[derive(Serialize)]
struct ImageReport<'a> {
    file: &'a Path,
    output: &'a Path,
    detections: &'a [Detection],
    speed: SpeedLog,
}

#[derive(Serialize)]
struct Report<'a> {
    round_trip_ms: f64,
    total_images: usize,
    results: Vec<ImageReport<'a>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let client = PredictClient::new(&args.url)?;
    client.wait_until_available(args.wait_retries).await?;

    let start = Instant::now();
    let response = client.predict(&args.images, args.params()).await?;
    let round_trip = start.elapsed();

    let outputs = annotated_paths(&args.output_dir, &args.images);
    let report = Report {
        round_trip_ms: round_trip.as_secs_f64() * 1000.,
        total_images: response.total_images,
        results: args
            .images
            .iter()
            .zip(&outputs)
            .zip(response.data.iter().zip(&response.speed))
            .map(|((file, output), (detections, speed))| ImageReport {
                file,
                output,
                detections,
                speed: *speed,
            })
            .collect(),
    };
    println!("{}", serde_json::to_string_pretty(&report)?);

    tokio::fs::create_dir_all(&args.output_dir).await?;
    for (output, encoded) in outputs.iter().zip(&response.images) {
        let png = BASE64_STANDARD.decode(encoded)?;
        tokio::fs::write(output, png).await?;
        tracing::info!("Saved {}", output.display());
    }

    Ok(())
}
