use super::codec::pack_prompt;
use super::types::{
    DecodeRequest, Embeddings, ImageTensor, InferenceEngine, MaskTensor, RawDecodeOutput, RawTensor,
    HIGH_RES_FEAT1_SHAPE, HIGH_RES_FEAT2_SHAPE, IMAGE_EMBED_SHAPE,
};
use crate::error::SegmentError;
use async_trait::async_trait;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::{DynValue, Tensor};
use parking_lot::Mutex;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where to find the two model halves and how to run them.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub encoder_path: PathBuf,
    pub decoder_path: PathBuf,
    pub intra_threads: usize,
}

impl EngineConfig {
    pub fn new<P: AsRef<Path>, Q: AsRef<Path>>(encoder_path: P, decoder_path: Q) -> Self {
        Self {
            encoder_path: encoder_path.as_ref().to_path_buf(),
            decoder_path: decoder_path.as_ref().to_path_buf(),
            intra_threads: 4,
        }
    }

    pub fn with_intra_threads(mut self, threads: usize) -> Self {
        self.intra_threads = threads.max(1);
        self
    }
}

/// SAM2 image encoder + mask decoder exported as two ONNX graphs.
///
/// ONNX Runtime sessions need exclusive access to run, so each one sits behind
/// its own lock; inference runs on the blocking thread pool.
pub struct OnnxEngine {
    config: EngineConfig,
    encoder: Option<Arc<Mutex<Session>>>,
    decoder: Option<Arc<Mutex<Session>>>,
}

impl OnnxEngine {
    /// Create an engine without loading any model. Calls fail with
    /// `EngineUnavailable` until [`OnnxEngine::init`] succeeds.
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            encoder: None,
            decoder: None,
        }
    }

    /// Create and load an engine in one step.
    pub fn load(config: EngineConfig) -> Result<Self, SegmentError> {
        let mut engine = Self::new(config);
        engine.init()?;
        Ok(engine)
    }

    pub fn init(&mut self) -> Result<(), SegmentError> {
        let encoder = load_session(&self.config.encoder_path, self.config.intra_threads)?;
        let decoder = load_session(&self.config.decoder_path, self.config.intra_threads)?;

        self.encoder = Some(Arc::new(Mutex::new(encoder)));
        self.decoder = Some(Arc::new(Mutex::new(decoder)));
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.encoder.is_some() && self.decoder.is_some()
    }

    fn session(
        slot: &Option<Arc<Mutex<Session>>>,
        name: &str,
    ) -> Result<Arc<Mutex<Session>>, SegmentError> {
        slot.as_ref().map(Arc::clone).ok_or_else(|| {
            SegmentError::EngineUnavailable(format!("{} session not initialized", name))
        })
    }
}

fn load_session(path: &Path, intra_threads: usize) -> Result<Session, SegmentError> {
    tracing::info!("Loading model from {}", path.display());

    let session = Session::builder()
        .map_err(load_failed(path))?
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(load_failed(path))?
        .with_intra_threads(intra_threads)
        .map_err(load_failed(path))?
        .commit_from_file(path)
        .map_err(load_failed(path))?;

    tracing::info!("Model loaded from {}", path.display());
    Ok(session)
}

fn load_failed<E: Display>(path: &Path) -> impl Fn(E) -> SegmentError + '_ {
    move |e| SegmentError::EngineUnavailable(format!("failed to load {}: {}", path.display(), e))
}

fn inference<E: Display>(e: E) -> SegmentError {
    SegmentError::Inference(e.to_string())
}

fn shape_i64(shape: &[usize]) -> Vec<i64> {
    shape.iter().map(|&d| d as i64).collect()
}

fn extract_f32(value: &DynValue, name: &str) -> Result<RawTensor<f32>, SegmentError> {
    let (shape, data) = value
        .try_extract_tensor::<f32>()
        .map_err(|e| SegmentError::DecodeFormat(format!("{}: {}", name, e)))?;
    Ok(RawTensor::new(
        shape.iter().map(|&d| d as usize).collect(),
        data.to_vec(),
    ))
}

fn extract_masks(value: &DynValue) -> Result<MaskTensor, SegmentError> {
    if let Ok((shape, data)) = value.try_extract_tensor::<u8>() {
        let shape = shape.iter().map(|&d| d as usize).collect();
        return Ok(MaskTensor::Bytes(RawTensor::new(shape, data.to_vec())));
    }
    if let Ok((shape, data)) = value.try_extract_tensor::<bool>() {
        let shape = shape.iter().map(|&d| d as usize).collect();
        return Ok(MaskTensor::Bools(RawTensor::new(shape, data.to_vec())));
    }
    Ok(MaskTensor::Floats(extract_f32(value, "masks")?))
}

fn extract_embedding(
    value: Option<&DynValue>,
    name: &str,
    expected: [usize; 4],
) -> Result<Vec<f32>, SegmentError> {
    let value =
        value.ok_or_else(|| SegmentError::DecodeFormat(format!("output '{}' is missing", name)))?;
    let tensor = extract_f32(value, name)?;
    if tensor.shape != expected {
        return Err(SegmentError::DecodeFormat(format!(
            "{} has shape {:?}, expected {:?}",
            name, tensor.shape, expected
        )));
    }
    Ok(tensor.data)
}

#[async_trait]
impl InferenceEngine for OnnxEngine {
    async fn encode(&self, image: ImageTensor) -> Result<Embeddings, SegmentError> {
        let session = Self::session(&self.encoder, "encoder")?;

        tokio::task::spawn_blocking(move || -> Result<Embeddings, SegmentError> {
            let _span = tracing::debug_span!("encode", side = image.side).entered();

            let input = Tensor::from_array((shape_i64(&image.shape()), image.data)).map_err(inference)?;

            let mut session = session.lock();
            let outputs = session
                .run(ort::inputs!["image" => input])
                .map_err(inference)?;

            let embeddings = Embeddings {
                image_embed: extract_embedding(
                    outputs.get("image_embed"),
                    "image_embed",
                    IMAGE_EMBED_SHAPE,
                )?,
                high_res_feat1: extract_embedding(
                    outputs.get("high_res_feat1"),
                    "high_res_feat1",
                    HIGH_RES_FEAT1_SHAPE,
                )?,
                high_res_feat2: extract_embedding(
                    outputs.get("high_res_feat2"),
                    "high_res_feat2",
                    HIGH_RES_FEAT2_SHAPE,
                )?,
            };
            Ok(embeddings)
        })
        .await?
    }

    async fn decode(&self, request: DecodeRequest) -> Result<RawDecodeOutput, SegmentError> {
        let session = Self::session(&self.decoder, "decoder")?;

        tokio::task::spawn_blocking(move || -> Result<RawDecodeOutput, SegmentError> {
            let _span = tracing::debug_span!("decode", points = request.points.len()).entered();

            let prompt = pack_prompt(&request);
            let embeddings = &request.embeddings;

            let image_embed = Tensor::from_array((
                shape_i64(&IMAGE_EMBED_SHAPE),
                embeddings.image_embed.clone(),
            ))
            .map_err(inference)?;
            let high_res_feat1 = Tensor::from_array((
                shape_i64(&HIGH_RES_FEAT1_SHAPE),
                embeddings.high_res_feat1.clone(),
            ))
            .map_err(inference)?;
            let high_res_feat2 = Tensor::from_array((
                shape_i64(&HIGH_RES_FEAT2_SHAPE),
                embeddings.high_res_feat2.clone(),
            ))
            .map_err(inference)?;
            let coords_shape = shape_i64(&prompt.point_coords_shape());
            let labels_shape = shape_i64(&prompt.point_labels_shape());
            let mask_shape = shape_i64(&prompt.mask_input_shape());
            let point_coords =
                Tensor::from_array((coords_shape, prompt.point_coords)).map_err(inference)?;
            let point_labels =
                Tensor::from_array((labels_shape, prompt.point_labels)).map_err(inference)?;
            let boxes = Tensor::from_array((vec![1i64, 4], prompt.boxes.to_vec())).map_err(inference)?;
            let mask_input = Tensor::from_array((mask_shape, prompt.mask_input)).map_err(inference)?;

            let mut session = session.lock();
            let outputs = session
                .run(ort::inputs![
                    "image_embed" => image_embed,
                    "high_res_feat1" => high_res_feat1,
                    "high_res_feat2" => high_res_feat2,
                    "point_coords" => point_coords,
                    "point_labels" => point_labels,
                    "boxes" => boxes,
                    "mask_input" => mask_input,
                ])
                .map_err(inference)?;

            // Missing outputs stay None and are rejected by the codec
            let masks = outputs.get("masks").map(extract_masks).transpose()?;
            let iou_predictions = outputs
                .get("iou_predictions")
                .map(|v| extract_f32(v, "iou_predictions"))
                .transpose()?;
            let low_res_masks = outputs
                .get("low_res_masks")
                .map(|v| extract_f32(v, "low_res_masks"))
                .transpose()?;

            Ok(RawDecodeOutput {
                masks,
                iou_predictions,
                low_res_masks,
            })
        })
        .await?
    }
}
