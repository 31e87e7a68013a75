use crate::{
    inference_service::PredictError, model_service::ModelService, server::SharedState,
};
use axum::{
    body::Bytes,
    extract::{
        multipart::{Field, MultipartRejection},
        Multipart, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use std::{str::FromStr, time::Instant};
use tracing::instrument;
use yolo_schema::{
    InferenceParams, InferenceResponse, CONF_FIELD, IMAGES_FIELD, IMGSZ_FIELD, IOU_FIELD,
    MAX_IMGSZ, PREDICT_ROUTE,
};

impl IntoResponse for PredictError {
    fn into_response(self) -> Response {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(InferenceResponse::failed(self.to_string())),
        )
            .into_response()
    }
}

struct Upload {
    images: Vec<Bytes>,
    params: InferenceParams,
}

async fn read_upload(mut multipart: Multipart) -> Result<Upload, PredictError> {
    let mut images = Vec::new();
    let mut params = InferenceParams::default();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PredictError::Multipart(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            IMAGES_FIELD => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| PredictError::Multipart(e.body_text()))?;
                images.push(data);
            }
            IMGSZ_FIELD => params.imgsz = parse_imgsz(field).await?,
            CONF_FIELD => params.conf = parse_field(CONF_FIELD, field).await?,
            IOU_FIELD => params.iou = parse_field(IOU_FIELD, field).await?,
            other => tracing::debug!("Ignoring unknown form field {:?}", other),
        }
    }

    Ok(Upload { images, params })
}

async fn parse_field<T: FromStr>(
    field_name: &'static str,
    field: Field<'_>,
) -> Result<T, PredictError> {
    let value = field
        .text()
        .await
        .map_err(|e| PredictError::Multipart(e.body_text()))?;

    value
        .trim()
        .parse()
        .map_err(|_| PredictError::InvalidField {
            field: field_name,
            value,
        })
}

async fn parse_imgsz(field: Field<'_>) -> Result<u32, PredictError> {
    let imgsz: u32 = parse_field(IMGSZ_FIELD, field).await?;
    if imgsz > MAX_IMGSZ {
        return Err(PredictError::InvalidField {
            field: IMGSZ_FIELD,
            value: imgsz.to_string(),
        });
    }
    Ok(imgsz)
}

#[instrument(skip(state, multipart))]
pub async fn predict<M: ModelService>(
    State(state): State<SharedState<M>>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<InferenceResponse>, PredictError> {
    let start = Instant::now();
    state.metrics.record_request(PREDICT_ROUTE);

    let result = async {
        let multipart = multipart.map_err(|e| PredictError::Multipart(e.body_text()))?;
        let upload = read_upload(multipart).await?;
        tracing::info!(
            "Received {} image(s), imgsz={}, conf={}, iou={}",
            upload.images.len(),
            upload.params.imgsz,
            upload.params.conf,
            upload.params.iou
        );
        state
            .inference_service
            .predict_images(upload.images, upload.params)
            .await
    }
    .await;

    state
        .metrics
        .record_prediction_duration(start.elapsed().as_millis() as u64, PREDICT_ROUTE);

    match result {
        Ok(response) => {
            state
                .metrics
                .record_images_processed(response.total_images as u64);
            tracing::info!(
                "Processed {} image(s) in {:?}",
                response.total_images,
                start.elapsed()
            );
            Ok(Json(response))
        }
        Err(e) => {
            state.metrics.record_failure(PREDICT_ROUTE);
            tracing::error!("Prediction request failed: {}", e);
            Err(e)
        }
    }
}
