use crate::annotator::Annotator;
use crate::config::Config;
use crate::inference_service::InferenceService;
use crate::ort_service::OrtModelService;
use crate::server::HttpServer;

use std::error::Error;

pub async fn start_app(config: Config) -> Result<(), Box<dyn Error>> {
    let model_config = config.model.clone();
    let model_service =
        match tokio::task::spawn_blocking(move || OrtModelService::new(&model_config)).await? {
            Ok(service) => service,
            Err(e) => {
                tracing::error!("Failed to initialize model service: {:?}", e);
                return Err(Box::new(e));
            }
        };

    let annotator = match Annotator::new(config.annotation.clone()) {
        Ok(annotator) => annotator,
        Err(e) => {
            tracing::error!("Failed to initialize annotator: {:?}", e);
            return Err(Box::new(e));
        }
    };

    let inference_service = InferenceService::new(model_service, annotator);
    let server = HttpServer::new(inference_service, &config.server).await?;

    server.run().await?;

    Ok(())
}
