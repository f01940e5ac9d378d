mod codec;
mod letterbox;
mod onnx;
mod session;
pub mod types;

pub use codec::{
    iou_to_percent, pack_image, pack_prompt, rasterize, MaskDecoder, MaskElement, PromptTensors,
    DEFAULT_MASK_COLOR,
};
pub use letterbox::{letterbox, CoordinateTransform, LetterboxedImage, PAD_COLOR};
pub use onnx::{EngineConfig, OnnxEngine};
pub use session::{InteractionSession, Segmentation, SessionConfig, SessionPhase};
pub use types::{
    BoxPrompt, DecodeOutput, DecodeRequest, Embeddings, ImageTensor, InferenceEngine, Label,
    LabeledPoint, LowResMask, Mask, MaskHint, MaskTensor, Point, RawDecodeOutput, RawTensor,
};

use crate::error::SegmentError;
use std::sync::Arc;

/// Load the default ONNX engine from an encoder/decoder model pair.
pub fn create_default_engine(config: EngineConfig) -> Result<Arc<dyn InferenceEngine>, SegmentError> {
    let engine = OnnxEngine::load(config)?;
    Ok(Arc::new(engine))
}
