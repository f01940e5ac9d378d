use crate::error::SegmentError;
use async_trait::async_trait;
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Shape of the `image_embed` encoder output.
pub const IMAGE_EMBED_SHAPE: [usize; 4] = [1, 256, 64, 64];
/// Shape of the `high_res_feat1` encoder output.
pub const HIGH_RES_FEAT1_SHAPE: [usize; 4] = [1, 32, 256, 256];
/// Shape of the `high_res_feat2` encoder output.
pub const HIGH_RES_FEAT2_SHAPE: [usize; 4] = [1, 64, 128, 128];

/// Side length of the low resolution mask fed back into the decoder.
pub const MASK_HINT_SIDE: usize = 256;

/// A point in either original-image or model space. Which one is always
/// given by the API it passes through.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }
}

/// Point label as understood by the mask decoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Label {
    Background = 0,
    Foreground = 1,
}

impl Label {
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

impl TryFrom<i64> for Label {
    type Error = SegmentError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Label::Background),
            1 => Ok(Label::Foreground),
            other => Err(SegmentError::InvalidPrompt(format!(
                "point label must be 0 or 1, got {}",
                other
            ))),
        }
    }
}

/// A prompt point with its foreground/background label.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LabeledPoint {
    pub x: f32,
    pub y: f32,
    pub label: Label,
}

impl LabeledPoint {
    pub fn new(x: f32, y: f32, label: Label) -> Self {
        Self { x, y, label }
    }

    pub fn foreground(x: f32, y: f32) -> Self {
        Self::new(x, y, Label::Foreground)
    }

    pub fn background(x: f32, y: f32) -> Self {
        Self::new(x, y, Label::Background)
    }

    pub fn point(&self) -> Point {
        Point::new(self.x, self.y)
    }
}

/// Box prompt in model space. Equal corners mean "no box".
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BoxPrompt {
    pub top_left: Point,
    pub bottom_right: Point,
}

impl BoxPrompt {
    pub fn new(top_left: Point, bottom_right: Point) -> Self {
        Self {
            top_left,
            bottom_right,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.top_left == self.bottom_right
    }
}

/// 256x256 single channel mask prior. All zeros means "no prior mask".
#[derive(Clone, PartialEq)]
pub struct MaskHint(Vec<f32>);

impl MaskHint {
    pub const LEN: usize = MASK_HINT_SIDE * MASK_HINT_SIDE;

    pub fn zeros() -> Self {
        Self(vec![0.0; Self::LEN])
    }

    pub fn from_vec(data: Vec<f32>) -> Result<Self, SegmentError> {
        if data.len() != Self::LEN {
            return Err(SegmentError::InvalidPrompt(format!(
                "mask hint must hold {} values, got {}",
                Self::LEN,
                data.len()
            )));
        }
        Ok(Self(data))
    }

    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&v| v == 0.0)
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }
}

impl Default for MaskHint {
    fn default() -> Self {
        Self::zeros()
    }
}

impl fmt::Debug for MaskHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MaskHint")
            .field("len", &self.0.len())
            .field("zero", &self.is_zero())
            .finish()
    }
}

/// Image features produced once per image by the encoder.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct Embeddings {
    pub image_embed: Vec<f32>,
    pub high_res_feat1: Vec<f32>,
    pub high_res_feat2: Vec<f32>,
}

impl Embeddings {
    /// Check every buffer against its fixed shape.
    pub fn validate(&self) -> Result<(), SegmentError> {
        let checks = [
            ("image_embed", self.image_embed.len(), IMAGE_EMBED_SHAPE),
            ("high_res_feat1", self.high_res_feat1.len(), HIGH_RES_FEAT1_SHAPE),
            ("high_res_feat2", self.high_res_feat2.len(), HIGH_RES_FEAT2_SHAPE),
        ];
        for (name, len, shape) in checks {
            let expected: usize = shape.iter().product();
            if len != expected {
                return Err(SegmentError::DecodeFormat(format!(
                    "{} holds {} values, expected {} for shape {:?}",
                    name, len, expected, shape
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for Embeddings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Embeddings")
            .field("image_embed", &self.image_embed.len())
            .field("high_res_feat1", &self.high_res_feat1.len())
            .field("high_res_feat2", &self.high_res_feat2.len())
            .finish()
    }
}

/// Planar `[1, 3, side, side]` u8 tensor consumed by the encoder.
#[derive(Clone, PartialEq)]
pub struct ImageTensor {
    pub data: Vec<u8>,
    pub side: usize,
}

impl ImageTensor {
    pub fn shape(&self) -> [usize; 4] {
        [1, 3, self.side, self.side]
    }
}

impl fmt::Debug for ImageTensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageTensor")
            .field("shape", &self.shape())
            .finish()
    }
}

/// Everything one decoder call needs.
#[derive(Debug, Clone)]
pub struct DecodeRequest {
    pub embeddings: Arc<Embeddings>,
    pub points: Vec<LabeledPoint>,
    pub box_prompt: BoxPrompt,
    pub mask_hint: MaskHint,
}

/// Raw tensor as returned by the engine, shape in engine order.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTensor<T> {
    pub shape: Vec<usize>,
    pub data: Vec<T>,
}

impl<T> RawTensor<T> {
    pub fn new(shape: Vec<usize>, data: Vec<T>) -> Self {
        Self { shape, data }
    }
}

/// The `masks` output may come back as bytes, booleans or logits depending on
/// how the decoder was exported.
#[derive(Debug, Clone, PartialEq)]
pub enum MaskTensor {
    Bytes(RawTensor<u8>),
    Bools(RawTensor<bool>),
    Floats(RawTensor<f32>),
}

/// Named decoder outputs. A `None` field is a missing output.
#[derive(Debug, Clone, Default)]
pub struct RawDecodeOutput {
    pub masks: Option<MaskTensor>,
    pub iou_predictions: Option<RawTensor<f32>>,
    pub low_res_masks: Option<RawTensor<f32>>,
}

/// A rendered mask with its confidence in percent.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub image: RgbaImage,
    pub score: f32,
}

/// Low resolution decoder mask kept as the refinement basis.
#[derive(Debug, Clone, PartialEq)]
pub struct LowResMask {
    pub data: MaskHint,
    pub image: RgbaImage,
    pub score: f32,
}

/// Unpacked decoder output in model space, in engine order.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodeOutput {
    pub masks: Vec<Mask>,
    pub scores: Vec<f32>,
    pub low_res_masks: Vec<LowResMask>,
}

/// Two stage segmentation model: expensive image encoding, cheap prompt decoding.
///
/// Implementations must be usable from several sessions at once. Calls cannot
/// be aborted once started; callers that need a deadline should race the call
/// against a timeout and drop the result.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    /// Extract image features from a planar `[1, 3, S, S]` tensor.
    async fn encode(&self, image: ImageTensor) -> Result<Embeddings, SegmentError>;

    /// Run the mask decoder for one prompt.
    async fn decode(&self, request: DecodeRequest) -> Result<RawDecodeOutput, SegmentError>;
}
