//! JSON contract shared by the detection service and its client.

use serde::{Deserialize, Serialize};

pub const PREDICT_ROUTE: &str = "/predict";
pub const HEALTH_ROUTE: &str = "/health";

pub const IMAGES_FIELD: &str = "images";
pub const IMGSZ_FIELD: &str = "imgsz";
pub const CONF_FIELD: &str = "conf";
pub const IOU_FIELD: &str = "iou";

pub const DEFAULT_IMGSZ: u32 = 640;
/// Largest `imgsz` the service accepts.
pub const MAX_IMGSZ: u32 = 4096;
pub const DEFAULT_CONF: f32 = 0.25;
pub const DEFAULT_IOU: f32 = 0.45;

pub const SUCCESS_MESSAGE: &str = "Inference complete.";

/// One detected object, box in center form and original image pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub class_id: u32,
    pub name: String,
    pub confidence: f32,
    pub xcenter: f32,
    pub ycenter: f32,
    pub width: f32,
    pub height: f32,
}

impl Detection {
    /// Corner form `(x1, y1, x2, y2)`.
    pub fn corners(&self) -> (f32, f32, f32, f32) {
        let half_w = self.width / 2.;
        let half_h = self.height / 2.;
        (
            self.xcenter - half_w,
            self.ycenter - half_h,
            self.xcenter + half_w,
            self.ycenter + half_h,
        )
    }
}

/// Per-stage durations in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedLog {
    pub preprocess: f64,
    pub inference: f64,
    pub postprocess: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct InferenceParams {
    pub imgsz: u32,
    pub conf: f32,
    pub iou: f32,
}

impl Default for InferenceParams {
    fn default() -> Self {
        Self {
            imgsz: DEFAULT_IMGSZ,
            conf: DEFAULT_CONF,
            iou: DEFAULT_IOU,
        }
    }
}

/// Everything produced for a single uploaded image.
#[derive(Debug, Clone)]
pub struct ImageResult {
    pub detections: Vec<Detection>,
    pub speed: SpeedLog,
    pub image: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub success: bool,
    pub message: String,
    pub total_images: usize,
    pub data: Vec<Vec<Detection>>,
    pub speed: Vec<SpeedLog>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl InferenceResponse {
    pub fn completed(results: Vec<ImageResult>) -> Self {
        let total_images = results.len();
        let mut data = Vec::with_capacity(total_images);
        let mut speed = Vec::with_capacity(total_images);
        let mut images = Vec::with_capacity(total_images);

        for result in results {
            data.push(result.detections);
            speed.push(result.speed);
            images.push(result.image);
        }

        Self {
            success: true,
            message: SUCCESS_MESSAGE.to_string(),
            total_images,
            data,
            speed,
            images,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            total_images: 0,
            data: Vec::new(),
            speed: Vec::new(),
            images: Vec::new(),
        }
    }
}
