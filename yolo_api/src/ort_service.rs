use crate::{
    config::{ExecutionProvider, ModelConfig, Validatable},
    labels::ClassNames,
    model_service::{ModelService, ModelServiceError, Prediction},
};
use async_trait::async_trait;
use image::{imageops::FilterType, RgbImage};
use ndarray::{s, Array, ArrayView3, Axis, Ix4};
use ort::{
    execution_providers::{
        CUDAExecutionProvider, ExecutionProviderDispatch, TensorRTExecutionProvider,
    },
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};
use parking_lot::Mutex;
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};
use yolo_schema::{Detection, InferenceParams, SpeedLog, MAX_IMGSZ};

const STRIDE: u32 = 32;

/// Square input side actually fed to the model: `imgsz` rounded up to the stride.
pub fn inference_size(imgsz: u32) -> Result<u32, ModelServiceError> {
    if imgsz > MAX_IMGSZ {
        return Err(ModelServiceError::Tensor(format!(
            "imgsz {} exceeds the maximum of {}",
            imgsz, MAX_IMGSZ
        )));
    }

    imgsz
        .div_ceil(STRIDE)
        .max(1)
        .checked_mul(STRIDE)
        .ok_or_else(|| ModelServiceError::Tensor(format!("imgsz {} is out of range", imgsz)))
}

fn as_millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}

fn transform_image(image: &RgbImage, size: u32) -> Array<f32, Ix4> {
    let resized = image::imageops::resize(image, size, size, FilterType::CatmullRom);

    let size = size as usize;
    let mut input = Array::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        let x = x as usize;
        let y = y as usize;
        let [r, g, b] = pixel.0;
        input[[0, 0, y, x]] = (r as f32) / 255.;
        input[[0, 1, y, x]] = (g as f32) / 255.;
        input[[0, 2, y, x]] = (b as f32) / 255.;
    }

    input
}

/// Box candidate in corner form, original image pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
struct Candidate {
    class_id: usize,
    confidence: f32,
    x1: f32,
    y1: f32,
    x2: f32,
    y2: f32,
}

impl Candidate {
    fn area(&self) -> f32 {
        (self.x2 - self.x1).max(0.) * (self.y2 - self.y1).max(0.)
    }

    fn intersection(&self, other: &Candidate) -> f32 {
        let width = self.x2.min(other.x2) - self.x1.max(other.x1);
        let height = self.y2.min(other.y2) - self.y1.max(other.y1);
        width.max(0.) * height.max(0.)
    }

    fn iou(&self, other: &Candidate) -> f32 {
        let intersection = self.intersection(other);
        let union = self.area() + other.area() - intersection;
        if union <= 0. {
            0.
        } else {
            intersection / union
        }
    }

    fn into_detection(self, class_names: &ClassNames) -> Detection {
        let width = self.x2 - self.x1;
        let height = self.y2 - self.y1;
        Detection {
            class_id: self.class_id as u32,
            name: class_names.name(self.class_id),
            confidence: self.confidence,
            xcenter: self.x1 + width / 2.,
            ycenter: self.y1 + height / 2.,
            width,
            height,
        }
    }
}

/// Reads a `[1, 4 + classes, candidates]` output, keeping candidates whose best
/// class score exceeds `conf`.
fn decode_output(
    dims: &[usize],
    data: &[f32],
    conf: f32,
    scale_x: f32,
    scale_y: f32,
) -> Result<Vec<Candidate>, ModelServiceError> {
    let &[batch, rows, columns] = dims else {
        return Err(ModelServiceError::Output(format!(
            "expected a 3-dimensional output, got shape {:?}",
            dims
        )));
    };
    if batch != 1 || rows <= 4 {
        return Err(ModelServiceError::Output(format!(
            "expected shape [1, 4 + classes, candidates], got {:?}",
            dims
        )));
    }

    let output = ArrayView3::from_shape((batch, rows, columns), data)
        .map_err(|e| ModelServiceError::Output(format!("invalid tensor shape: {}", e)))?;
    let output = output.index_axis(Axis(0), 0);

    let mut candidates = Vec::new();
    for column in 0..columns {
        let best = output
            .slice(s![4.., column])
            .indexed_iter()
            .max_by(|(_, a), (_, b)| a.total_cmp(b))
            .map(|(class_id, score)| (class_id, *score));

        let Some((class_id, confidence)) = best else {
            continue;
        };
        if confidence.is_nan() || confidence <= conf {
            continue;
        }

        let xc = output[[0, column]] * scale_x;
        let yc = output[[1, column]] * scale_y;
        let w = output[[2, column]] * scale_x;
        let h = output[[3, column]] * scale_y;

        candidates.push(Candidate {
            class_id,
            confidence,
            x1: xc - w / 2.,
            y1: yc - h / 2.,
            x2: xc + w / 2.,
            y2: yc + h / 2.,
        });
    }

    Ok(candidates)
}

/// Class-aware non-maximum suppression. Result is sorted by confidence.
fn non_max_suppression(
    mut candidates: Vec<Candidate>,
    iou_threshold: f32,
    max_detections: usize,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<Candidate> = Vec::new();
    for candidate in candidates {
        if kept.len() >= max_detections {
            break;
        }
        let suppressed = kept
            .iter()
            .any(|k| k.class_id == candidate.class_id && k.iou(&candidate) > iou_threshold);
        if !suppressed {
            kept.push(candidate);
        }
    }

    kept
}

fn execution_providers(provider: ExecutionProvider) -> Vec<ExecutionProviderDispatch> {
    match provider {
        ExecutionProvider::Cpu => Vec::new(),
        ExecutionProvider::Cuda => vec![CUDAExecutionProvider::default().build()],
        ExecutionProvider::Tensorrt => vec![
            TensorRTExecutionProvider::default()
                .with_engine_cache(true)
                .build(),
            CUDAExecutionProvider::default().build(),
        ],
    }
}

#[derive(Clone)]
pub struct OrtModelService {
    sessions: Arc<Vec<Arc<Mutex<Session>>>>,
    counter: Arc<AtomicUsize>,
    class_names: Arc<ClassNames>,
    max_detections: usize,
}

impl OrtModelService {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelServiceError> {
        model_config.validate().map_err(ModelServiceError::Load)?;

        let num_instances = model_config.num_instances;
        let sessions = (0..num_instances)
            .map(|_| {
                let session = Session::builder()?
                    .with_optimization_level(GraphOptimizationLevel::Level3)?
                    .with_execution_providers(execution_providers(
                        model_config.execution_provider,
                    ))?
                    .commit_from_file(model_config.get_path())?;
                Ok(Arc::new(Mutex::new(session)))
            })
            .collect::<Result<Vec<_>, ort::Error>>()
            .map_err(|e| ModelServiceError::Load(e.to_string()))?;

        let class_names = Self::load_class_names(&sessions[0].lock(), model_config)?;

        tracing::info!(
            "Created {} ONNX sessions for {:?} with {} classes",
            num_instances,
            model_config.get_path(),
            class_names.len()
        );

        Ok(Self {
            sessions: Arc::new(sessions),
            counter: Arc::new(AtomicUsize::new(0)),
            class_names: Arc::new(class_names),
            max_detections: model_config.max_detections,
        })
    }

    fn load_class_names(
        session: &Session,
        model_config: &ModelConfig,
    ) -> Result<ClassNames, ModelServiceError> {
        if let Some(labels_path) = model_config.get_labels_path() {
            return ClassNames::from_file(&labels_path).map_err(|e| {
                ModelServiceError::Load(format!("Failed to load labels {:?}: {}", labels_path, e))
            });
        }

        let metadata_names = session
            .metadata()
            .ok()
            .and_then(|metadata| metadata.custom("names").unwrap_or_default())
            .and_then(|names| ClassNames::from_metadata(&names));

        match metadata_names {
            Some(names) => Ok(names),
            None => {
                tracing::warn!("Model carries no class names, falling back to class ids");
                Ok(ClassNames::default())
            }
        }
    }

    fn run_inference(
        &self,
        input: &Array<f32, Ix4>,
    ) -> Result<(Vec<usize>, Vec<f32>), ModelServiceError> {
        let index = self.counter.fetch_add(1, Ordering::SeqCst) % self.sessions.len();
        let mut session = self.sessions[index].lock();

        tracing::debug!("Handling request with session {}", index);

        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ModelServiceError::Tensor(e.to_string()))?;

        let outputs = session.run(ort::inputs![tensor_ref])?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelServiceError::Output(format!("failed to extract tensor: {}", e)))?;

        let dims = shape.iter().map(|&d| d as usize).collect();
        Ok((dims, data.to_vec()))
    }

    fn detect(
        &self,
        image: &RgbImage,
        params: InferenceParams,
    ) -> Result<Prediction, ModelServiceError> {
        let start = Instant::now();
        let size = inference_size(params.imgsz)?;
        let input = transform_image(image, size);
        let preprocess = as_millis(start.elapsed());

        let start = Instant::now();
        let (dims, data) = self.run_inference(&input)?;
        let inference = as_millis(start.elapsed());

        let start = Instant::now();
        let scale_x = image.width() as f32 / size as f32;
        let scale_y = image.height() as f32 / size as f32;
        let candidates = decode_output(&dims, &data, params.conf, scale_x, scale_y)?;
        let detections = non_max_suppression(candidates, params.iou, self.max_detections)
            .into_iter()
            .map(|candidate| candidate.into_detection(&self.class_names))
            .collect();
        let postprocess = as_millis(start.elapsed());

        Ok(Prediction {
            detections,
            speed: SpeedLog {
                preprocess,
                inference,
                postprocess,
            },
        })
    }
}

#[async_trait]
impl ModelService for OrtModelService {
    async fn predict(
        &self,
        image: Arc<RgbImage>,
        params: InferenceParams,
    ) -> Result<Prediction, ModelServiceError> {
        let service = self.clone();
        tokio::task::spawn_blocking(move || service.detect(&image, params)).await?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use std::path::PathBuf;

    fn candidate(class_id: usize, confidence: f32, x1: f32, y1: f32, x2: f32, y2: f32) -> Candidate {
        Candidate {
            class_id,
            confidence,
            x1,
            y1,
            x2,
            y2,
        }
    }

    #[test]
    fn test_inference_size_rounds_up_to_stride() {
        assert_eq!(inference_size(640).unwrap(), 640);
        assert_eq!(inference_size(630).unwrap(), 640);
        assert_eq!(inference_size(641).unwrap(), 672);
        assert_eq!(inference_size(0).unwrap(), 32);
        assert_eq!(inference_size(MAX_IMGSZ).unwrap(), MAX_IMGSZ);
    }

    #[test]
    fn test_inference_size_rejects_oversized_input() {
        assert!(matches!(
            inference_size(MAX_IMGSZ + 1),
            Err(ModelServiceError::Tensor(_))
        ));
        assert!(matches!(
            inference_size(u32::MAX),
            Err(ModelServiceError::Tensor(_))
        ));
    }

    #[test]
    fn test_transform_image() {
        let img = RgbImage::from_pixel(100, 50, Rgb([255, 0, 0]));

        let input = transform_image(&img, 64);

        assert_eq!(input.shape(), &[1, 3, 64, 64]);
        assert!((input[[0, 0, 10, 10]] - 1.0).abs() < 1e-6);
        assert!(input[[0, 1, 10, 10]].abs() < 1e-6);
        assert!(input[[0, 2, 63, 63]].abs() < 1e-6);
    }

    #[test]
    fn test_decode_output() {
        // 2 classes, 3 candidates, laid out [1, 6, 3]
        let data = vec![
            // xc
            32.0, 16.0, 8.0, //
            // yc
            32.0, 16.0, 8.0, //
            // w
            10.0, 4.0, 2.0, //
            // h
            20.0, 4.0, 2.0, //
            // class 0
            0.9, 0.1, 0.2, //
            // class 1
            0.05, 0.6, 0.25,
        ];

        let candidates = decode_output(&[1, 6, 3], &data, 0.25, 2.0, 0.5).unwrap();

        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0], candidate(0, 0.9, 54.0, 11.0, 74.0, 21.0));
        assert_eq!(candidates[1].class_id, 1);
        assert_eq!(candidates[1].confidence, 0.6);
    }

    #[test]
    fn test_decode_output_rejects_bad_shape() {
        let err = decode_output(&[1, 4, 2], &[0.0; 8], 0.25, 1.0, 1.0).unwrap_err();
        assert!(matches!(err, ModelServiceError::Output(_)));

        let err = decode_output(&[6, 3], &[0.0; 18], 0.25, 1.0, 1.0).unwrap_err();
        assert!(matches!(err, ModelServiceError::Output(_)));
    }

    #[test]
    fn test_iou() {
        let a = candidate(0, 0.9, 0.0, 0.0, 10.0, 10.0);
        let b = candidate(0, 0.8, 5.0, 0.0, 15.0, 10.0);
        let far = candidate(0, 0.8, 20.0, 20.0, 30.0, 30.0);

        assert!((a.iou(&b) - 50.0 / 150.0).abs() < 1e-6);
        assert_eq!(a.iou(&far), 0.0);
        assert_eq!(a.iou(&a), 1.0);
    }

    #[test]
    fn test_nms_suppresses_same_class_overlaps() {
        let candidates = vec![
            candidate(0, 0.8, 1.0, 1.0, 11.0, 11.0),
            candidate(0, 0.9, 0.0, 0.0, 10.0, 10.0),
            candidate(1, 0.7, 0.0, 0.0, 10.0, 10.0),
            candidate(0, 0.6, 50.0, 50.0, 60.0, 60.0),
        ];

        let kept = non_max_suppression(candidates, 0.45, 300);

        assert_eq!(kept.len(), 3);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].class_id, 1);
        assert_eq!(kept[2].confidence, 0.6);
    }

    #[test]
    fn test_nms_respects_threshold_and_cap() {
        let candidates = vec![
            candidate(0, 0.9, 0.0, 0.0, 10.0, 10.0),
            candidate(0, 0.8, 5.0, 0.0, 15.0, 10.0),
            candidate(0, 0.7, 40.0, 0.0, 50.0, 10.0),
        ];

        // IoU of the first two is 1/3
        assert_eq!(non_max_suppression(candidates.clone(), 0.5, 300).len(), 3);
        assert_eq!(non_max_suppression(candidates.clone(), 0.3, 300).len(), 2);
        assert_eq!(non_max_suppression(candidates, 0.5, 1).len(), 1);
    }

    #[test]
    fn test_into_detection_uses_center_form() {
        let names = ClassNames::new(vec!["person".to_string()]);

        let detection = candidate(0, 0.5, 10.0, 20.0, 30.0, 60.0).into_detection(&names);

        assert_eq!(detection.name, "person");
        assert_eq!(detection.xcenter, 20.0);
        assert_eq!(detection.ycenter, 40.0);
        assert_eq!(detection.width, 20.0);
        assert_eq!(detection.height, 40.0);
        assert_eq!(detection.corners(), (10.0, 20.0, 30.0, 60.0));
    }

    #[test]
    fn test_missing_model_fails_to_load() {
        let model_config = ModelConfig {
            model_dir: PathBuf::from("./does-not-exist"),
            onnx_file: "yolo11n.onnx".to_string(),
            labels_file: None,
            num_instances: 1,
            execution_provider: ExecutionProvider::Cpu,
            max_detections: 300,
        };

        let result = OrtModelService::new(&model_config);

        assert!(matches!(result, Err(ModelServiceError::Load(_))));
    }
}
