use image::ImageFormat;
use reqwest::{
    multipart::{Form, Part},
    Client,
};
use std::{
    collections::HashSet,
    path::{Path, PathBuf},
};
use thiserror::Error;
use tokio::time::{sleep, timeout, Duration};
use tracing::instrument;
use yolo_schema::{
    InferenceParams, InferenceResponse, CONF_FIELD, HEALTH_ROUTE, IMAGES_FIELD, IMGSZ_FIELD,
    IOU_FIELD, PREDICT_ROUTE,
};

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Service not available after {0} attempts")]
    MaxRetriesExceeded(u32),
    #[error("Failed to read {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Prediction failed: {0}")]
    Prediction(String),
}

pub struct PredictClient {
    http: Client,
    base_url: String,
}

impl PredictClient {
    pub fn new(base_url: &str) -> Result<Self, ClientError> {
        Ok(Self {
            http: Client::builder().build()?,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, route: &str) -> String {
        format!("{}{}", self.base_url, route)
    }

    pub async fn wait_until_available(&self, max_retries: u32) -> Result<(), ClientError> {
        if max_retries == 0 {
            return Ok(());
        }

        let mut retry_delay = Duration::from_millis(50);
        let max_retry_delay = Duration::from_secs(1);
        let mut retry_count = 0;

        while retry_count < max_retries {
            match timeout(
                Duration::from_secs(1),
                self.http.get(self.url(HEALTH_ROUTE)).send(),
            )
            .await
            {
                Ok(Ok(response)) if response.status().is_success() => return Ok(()),
                Ok(Ok(response)) => {
                    tracing::warn!("Health check returned {}", response.status());
                }
                Ok(Err(e)) => {
                    tracing::warn!("Failed to reach detection service: {}", e);
                }
                Err(_) => {
                    tracing::warn!("Health check timeout");
                }
            }

            retry_count += 1;
            let jitter = rand::random::<f32>() * 0.2 + 0.9;
            sleep(retry_delay.mul_f32(jitter)).await;
            retry_delay = (retry_delay * 2).min(max_retry_delay);
        }

        Err(ClientError::MaxRetriesExceeded(max_retries))
    }

    #[instrument(skip(self))]
    pub async fn predict(
        &self,
        paths: &[PathBuf],
        params: InferenceParams,
    ) -> Result<InferenceResponse, ClientError> {
        let mut form = Form::new()
            .text(IMGSZ_FIELD, params.imgsz.to_string())
            .text(CONF_FIELD, params.conf.to_string())
            .text(IOU_FIELD, params.iou.to_string());

        for path in paths {
            let data = tokio::fs::read(path)
                .await
                .map_err(|source| ClientError::Read {
                    path: path.clone(),
                    source,
                })?;
            let file_name = path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());

            let part = Part::bytes(data)
                .file_name(file_name)
                .mime_str(content_type(path))?;
            form = form.part(IMAGES_FIELD, part);
        }

        let response = self
            .http
            .post(self.url(PREDICT_ROUTE))
            .multipart(form)
            .send()
            .await?;
        tracing::debug!("Detection service answered {}", response.status());

        let body: InferenceResponse = response.json().await?;
        if !body.success {
            return Err(ClientError::Prediction(body.message));
        }

        Ok(body)
    }
}

pub fn content_type(path: &Path) -> &'static str {
    ImageFormat::from_path(path)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream")
}

/// One output file per input: `<output_dir>/<input stem>_annotated.png`, with a
/// `_<n>` suffix on the stem when an earlier input already took that name.
pub fn annotated_paths(output_dir: &Path, inputs: &[PathBuf]) -> Vec<PathBuf> {
    let mut taken = HashSet::new();

    inputs
        .iter()
        .map(|input| {
            let stem = input
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_else(|| "image".to_string());

            let mut name = format!("{}_annotated.png", stem);
            let mut n = 2;
            while !taken.insert(name.clone()) {
                name = format!("{}_{}_annotated.png", stem, n);
                n += 1;
            }
            output_dir.join(name)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotated_paths() {
        let paths = annotated_paths(
            Path::new("out"),
            &[
                PathBuf::from("photos/bus.jpg"),
                PathBuf::from("street.scene.webp"),
            ],
        );

        assert_eq!(
            paths,
            vec![
                PathBuf::from("out/bus_annotated.png"),
                PathBuf::from("out/street.scene_annotated.png"),
            ]
        );
    }

    #[test]
    fn test_same_stem_inputs_get_distinct_outputs() {
        let paths = annotated_paths(
            Path::new("out"),
            &[
                PathBuf::from("day/bus.jpg"),
                PathBuf::from("night/bus.jpg"),
                PathBuf::from("bus.png"),
                PathBuf::from("bus_2.jpg"),
            ],
        );

        assert_eq!(
            paths,
            vec![
                PathBuf::from("out/bus_annotated.png"),
                PathBuf::from("out/bus_2_annotated.png"),
                PathBuf::from("out/bus_3_annotated.png"),
                PathBuf::from("out/bus_2_2_annotated.png"),
            ]
        );
    }

    #[test]
    fn test_content_type() {
        assert_eq!(content_type(Path::new("bus.jpg")), "image/jpeg");
        assert_eq!(content_type(Path::new("bus.png")), "image/png");
        assert_eq!(
            content_type(Path::new("bus.unknown")),
            "application/octet-stream"
        );
    }

    #[test]
    fn test_base_url_is_normalized() {
        let client = PredictClient::new("http://localhost:8080/").unwrap();
        assert_eq!(client.url(PREDICT_ROUTE), "http://localhost:8080/predict");
    }

    #[tokio::test]
    async fn test_zero_retries_skips_the_probe() {
        let client = PredictClient::new("http://127.0.0.1:9").unwrap();
        assert!(client.wait_until_available(0).await.is_ok());
    }

    #[tokio::test]
    async fn test_unreachable_service_exhausts_retries() {
        let client = PredictClient::new("http://127.0.0.1:9").unwrap();
        let err = client.wait_until_available(2).await.unwrap_err();
        assert!(matches!(err, ClientError::MaxRetriesExceeded(2)));
    }

    #[tokio::test]
    async fn test_missing_file_is_reported() {
        let client = PredictClient::new("http://127.0.0.1:9").unwrap();
        let err = client
            .predict(
                &[PathBuf::from("does/not/exist.jpg")],
                InferenceParams::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::Read { .. }));
    }
}
