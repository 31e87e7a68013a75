use crate::{
    annotator::{AnnotateError, Annotator},
    model_service::{ModelService, ModelServiceError},
};
use axum::body::Bytes;
use image::RgbImage;
use std::{io::Cursor, sync::Arc};
use thiserror::Error;
use tokio::task::JoinError;
use yolo_schema::{ImageResult, InferenceParams, InferenceResponse};

#[derive(Error, Debug)]
pub enum PredictError {
    #[error("Invalid multipart request: {0}")]
    Multipart(String),
    #[error("Invalid value for `{field}`: {value:?}")]
    InvalidField { field: &'static str, value: String },
    #[error("No images uploaded")]
    NoImages,
    #[error("Failed to decode image {index}: {source}")]
    Decode {
        index: usize,
        source: image::ImageError,
    },
    #[error("Prediction failed: {0}")]
    Model(#[from] ModelServiceError),
    #[error(transparent)]
    Annotate(#[from] AnnotateError),
    #[error("Processing task failed: {0}")]
    Task(#[from] JoinError),
}

fn decode_image(image_data: &[u8]) -> Result<RgbImage, image::ImageError> {
    let image = image::ImageReader::new(Cursor::new(image_data))
        .with_guessed_format()?
        .decode()?;
    Ok(image.to_rgb8())
}

/// Runs decode, detection and annotation over a batch of uploaded images.
#[derive(Clone)]
pub struct InferenceService<M: ModelService> {
    model_service: Arc<M>,
    annotator: Arc<Annotator>,
}

impl<M: ModelService> InferenceService<M> {
    pub fn new(model_service: M, annotator: Annotator) -> Self {
        Self {
            model_service: Arc::new(model_service),
            annotator: Arc::new(annotator),
        }
    }

    /// Images are processed one after the other; the first failure aborts the batch.
    pub async fn predict_images(
        &self,
        images: Vec<Bytes>,
        params: InferenceParams,
    ) -> Result<InferenceResponse, PredictError> {
        if images.is_empty() {
            return Err(PredictError::NoImages);
        }

        let mut results = Vec::with_capacity(images.len());
        for (index, image_data) in images.into_iter().enumerate() {
            results.push(self.process_image(index, image_data, params).await?);
        }

        Ok(InferenceResponse::completed(results))
    }

    async fn process_image(
        &self,
        index: usize,
        image_data: Bytes,
        params: InferenceParams,
    ) -> Result<ImageResult, PredictError> {
        let image = tokio::task::spawn_blocking(move || decode_image(&image_data))
            .await?
            .map_err(|source| PredictError::Decode { index, source })?;
        let image = Arc::new(image);

        let prediction = self.model_service.predict(image.clone(), params).await?;

        tracing::debug!(
            "Image {}: {} detections, speed={:?}",
            index,
            prediction.detections.len(),
            prediction.speed
        );
        for (i, detection) in prediction.detections.iter().enumerate() {
            tracing::debug!(
                "Detection {}: class_id={}, name={}, confidence={:.3}, box=({:.1}, {:.1}, {:.1}, {:.1})",
                i,
                detection.class_id,
                detection.name,
                detection.confidence,
                detection.xcenter,
                detection.ycenter,
                detection.width,
                detection.height
            );
        }

        let annotator = self.annotator.clone();
        let detections = prediction.detections;
        let (detections, encoded) = tokio::task::spawn_blocking(move || {
            let encoded = annotator.annotate(&image, &detections);
            (detections, encoded)
        })
        .await?;

        Ok(ImageResult {
            detections,
            speed: prediction.speed,
            image: encoded?,
        })
    }
}
