mod health;
mod metrics;
mod predict;

use crate::{model_service::ModelService, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};
use yolo_schema::{HEALTH_ROUTE, PREDICT_ROUTE};

pub fn api_routes<M: ModelService>() -> Router<SharedState<M>> {
    Router::new()
        .route(HEALTH_ROUTE, get(health::healthcheck))
        .route("/metrics", get(metrics::metrics_handler::<M>))
        .route(PREDICT_ROUTE, post(predict::predict::<M>))
}
