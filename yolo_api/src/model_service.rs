use async_trait::async_trait;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use yolo_schema::{Detection, InferenceParams, SpeedLog};

#[derive(Error, Debug)]
pub enum ModelServiceError {
    #[error("Failed to load model: {0}")]
    Load(String),
    #[error("Failed to build input tensor: {0}")]
    Tensor(String),
    #[error("Inference failed: {0}")]
    Inference(String),
    #[error("Unexpected model output: {0}")]
    Output(String),
    #[error("Inference task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ort::Error> for ModelServiceError {
    fn from(err: ort::Error) -> Self {
        ModelServiceError::Inference(err.to_string())
    }
}

#[derive(Debug, Clone, Default)]
pub struct Prediction {
    pub detections: Vec<Detection>,
    pub speed: SpeedLog,
}

#[async_trait]
pub trait ModelService: Send + Sync + Clone + 'static {
    async fn predict(
        &self,
        image: Arc<RgbImage>,
        params: InferenceParams,
    ) -> Result<Prediction, ModelServiceError>;
}
