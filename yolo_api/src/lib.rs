mod annotator;
mod inference_service;
mod labels;
mod model_service;
mod ort_service;
mod routes;
mod server;
mod telemetry;

pub mod app;
pub mod config;

pub use app::start_app;
