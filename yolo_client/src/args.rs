use clap::Parser;
use std::path::PathBuf;
use yolo_schema::InferenceParams;

/// Upload images to a detection service and save the annotated results.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Images to upload in a single request
    #[arg(required = true, value_name = "IMAGE")]
    pub images: Vec<PathBuf>,

    /// Base URL of the detection service
    #[arg(long, default_value = "http://localhost:8080", value_name = "URL")]
    pub url: String,

    /// Inference size, 320 to 1280 in steps of 32
    #[arg(long, default_value_t = 640, value_parser = parse_imgsz)]
    pub imgsz: u32,

    /// Confidence threshold (0.0 - 1.0)
    #[arg(long, default_value_t = 0.25, value_parser = parse_threshold)]
    pub conf: f32,

    /// NMS IoU threshold (0.0 - 1.0)
    #[arg(long, default_value_t = 0.45, value_parser = parse_threshold)]
    pub iou: f32,

    /// Directory the annotated PNG files are written to
    #[arg(long, default_value = "annotated", value_name = "DIR")]
    pub output_dir: PathBuf,

    /// Health probes before giving up, 0 skips the probe
    #[arg(long, default_value_t = 10, value_name = "COUNT")]
    pub wait_retries: u32,
}

impl Args {
    pub fn params(&self) -> InferenceParams {
        InferenceParams {
            imgsz: self.imgsz,
            conf: self.conf,
            iou: self.iou,
        }
    }
}

fn parse_imgsz(value: &str) -> Result<u32, String> {
    let imgsz: u32 = value
        .parse()
        .map_err(|_| format!("`{}` is not a number", value))?;

    if !(320..=1280).contains(&imgsz) || imgsz % 32 != 0 {
        return Err(format!(
            "{} must be between 320 and 1280 and a multiple of 32",
            imgsz
        ));
    }
    Ok(imgsz)
}

fn parse_threshold(value: &str) -> Result<f32, String> {
    let threshold: f32 = value
        .parse()
        .map_err(|_| format!("`{}` is not a number", value))?;

    if !(0.0..=1.0).contains(&threshold) {
        return Err(format!("{} must be between 0 and 1", threshold));
    }
    Ok(threshold)
}
