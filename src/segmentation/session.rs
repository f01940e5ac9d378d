use super::codec::{pack_image, MaskDecoder, DEFAULT_MASK_COLOR};
use super::letterbox::{letterbox, CoordinateTransform};
use super::types::{
    BoxPrompt, DecodeOutput, DecodeRequest, Embeddings, InferenceEngine, LabeledPoint, Mask, MaskHint,
    Point,
};
use crate::cache::{self, EmbeddingStore};
use crate::error::SegmentError;
use image::{DynamicImage, Rgba};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex as AsyncMutex;

/// Per-session settings.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    /// Side of the square model input.
    pub target_size: u32,
    /// Color used to paint mask pixels.
    pub mask_color: Rgba<u8>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            target_size: 1024,
            mask_color: DEFAULT_MASK_COLOR,
        }
    }
}

/// Where a session is in the encode-once / decode-many protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// No image encoded yet.
    Uninitialized,
    /// Embeddings present, nothing decoded.
    Prepared,
    /// At least one decode result is held as the refinement basis.
    Decoded,
    /// The held result came from a decode seeded with the previous low-res mask.
    Refining,
}

#[derive(Debug, Clone, Default)]
struct PromptState {
    points: Vec<LabeledPoint>,
    box_prompt: BoxPrompt,
    mask_hint: MaskHint,
}

#[derive(Debug, Clone)]
struct Prepared {
    embeddings: Arc<Embeddings>,
    transform: CoordinateTransform,
}

enum SessionState {
    Uninitialized,
    Prepared(Prepared),
    Decoded {
        prepared: Prepared,
        previous: DecodeOutput,
        refined: bool,
    },
}

impl SessionState {
    fn prepared(&self) -> Option<&Prepared> {
        match self {
            SessionState::Uninitialized => None,
            SessionState::Prepared(prepared) | SessionState::Decoded { prepared, .. } => Some(prepared),
        }
    }

    fn phase(&self) -> SessionPhase {
        match self {
            SessionState::Uninitialized => SessionPhase::Uninitialized,
            SessionState::Prepared(_) => SessionPhase::Prepared,
            SessionState::Decoded { refined: false, .. } => SessionPhase::Decoded,
            SessionState::Decoded { refined: true, .. } => SessionPhase::Refining,
        }
    }
}

/// Output of one `decode()` or `refine()` call.
#[derive(Debug, Clone)]
pub struct Segmentation {
    /// Masks cropped and resized onto the original image, in engine order.
    pub masks: Vec<Mask>,
    /// The model space output these masks came from.
    pub output: DecodeOutput,
}

/// Interactive segmentation of one image.
///
/// Encodes the image at most once, then decodes any number of prompts against
/// the cached embeddings. Decode-family calls are serialized per session, so a
/// session can be shared behind an `Arc`; prompt edits never wait on inference.
pub struct InteractionSession {
    engine: Arc<dyn InferenceEngine>,
    store: Option<Arc<dyn EmbeddingStore>>,
    config: SessionConfig,
    decoder: MaskDecoder,
    state: AsyncMutex<SessionState>,
    prompt: Mutex<PromptState>,
}

impl InteractionSession {
    pub fn new(engine: Arc<dyn InferenceEngine>, config: SessionConfig) -> Self {
        Self {
            engine,
            store: None,
            config,
            decoder: MaskDecoder::new(config.mask_color),
            state: AsyncMutex::new(SessionState::Uninitialized),
            prompt: Mutex::new(PromptState::default()),
        }
    }

    /// Back the session with a durable embedding store.
    pub fn with_store(mut self, store: Arc<dyn EmbeddingStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub async fn phase(&self) -> SessionPhase {
        self.state.lock().await.phase()
    }

    /// The image transform, once prepared.
    pub async fn transform(&self) -> Option<CoordinateTransform> {
        self.state.lock().await.prepared().map(|p| p.transform)
    }

    /// Encode `image`, keyed in the store by a content hash of its letterboxed canvas.
    ///
    /// Once embeddings exist this is a no-op returning them.
    pub async fn prepare(&self, image: &DynamicImage) -> Result<Arc<Embeddings>, SegmentError> {
        self.prepare_keyed(image, None).await
    }

    /// Like [`InteractionSession::prepare`] with a caller chosen cache key.
    pub async fn prepare_with_fingerprint(
        &self,
        image: &DynamicImage,
        fingerprint: &str,
    ) -> Result<Arc<Embeddings>, SegmentError> {
        self.prepare_keyed(image, Some(fingerprint.to_string())).await
    }

    async fn prepare_keyed(
        &self,
        image: &DynamicImage,
        fingerprint: Option<String>,
    ) -> Result<Arc<Embeddings>, SegmentError> {
        let mut state = self.state.lock().await;
        if let Some(prepared) = state.prepared() {
            tracing::warn!("Session already prepared, reusing cached embeddings");
            return Ok(Arc::clone(&prepared.embeddings));
        }

        let boxed = letterbox(image, self.config.target_size)?;
        let key = fingerprint.unwrap_or_else(|| cache::fingerprint(&boxed.canvas));

        let cached = match &self.store {
            Some(store) => cache::load_embeddings(store.as_ref(), &key).await,
            None => None,
        };

        let embeddings = match cached {
            Some(embeddings) => embeddings,
            None => {
                let tensor = pack_image(&boxed.canvas)?;
                let start = Instant::now();
                let embeddings = self.engine.encode(tensor).await?;
                embeddings.validate()?;
                tracing::info!(
                    "Encoded {}x{} image in {:.1}ms",
                    boxed.transform.original_width,
                    boxed.transform.original_height,
                    start.elapsed().as_secs_f64() * 1000.0
                );

                if let Some(store) = &self.store {
                    cache::save_embeddings(store.as_ref(), &key, &embeddings).await;
                }
                embeddings
            }
        };

        let embeddings = Arc::new(embeddings);
        *state = SessionState::Prepared(Prepared {
            embeddings: Arc::clone(&embeddings),
            transform: boxed.transform,
        });
        Ok(embeddings)
    }

    /// Install embeddings obtained elsewhere. Any previous decode result is dropped.
    pub async fn seed(
        &self,
        embeddings: Embeddings,
        transform: CoordinateTransform,
    ) -> Result<(), SegmentError> {
        embeddings.validate()?;
        *self.state.lock().await = SessionState::Prepared(Prepared {
            embeddings: Arc::new(embeddings),
            transform,
        });
        Ok(())
    }

    pub fn set_points(&self, points: Vec<LabeledPoint>) {
        self.prompt.lock().points = points;
    }

    pub fn add_point(&self, point: LabeledPoint) {
        self.prompt.lock().points.push(point);
    }

    /// Box in model space. Pass `BoxPrompt::default()` to clear it.
    pub fn set_box(&self, box_prompt: BoxPrompt) {
        self.prompt.lock().box_prompt = box_prompt;
    }

    pub fn set_mask_hint(&self, mask_hint: MaskHint) {
        self.prompt.lock().mask_hint = mask_hint;
    }

    /// Drop all points, the box and the mask hint.
    pub fn clear_prompt(&self) {
        *self.prompt.lock() = PromptState::default();
    }

    pub fn points(&self) -> Vec<LabeledPoint> {
        self.prompt.lock().points.clone()
    }

    pub fn box_prompt(&self) -> BoxPrompt {
        self.prompt.lock().box_prompt
    }

    pub fn mask_hint(&self) -> MaskHint {
        self.prompt.lock().mask_hint.clone()
    }

    /// Map an original image point into model space.
    pub async fn map_to_model(&self, point: Point) -> Result<Point, SegmentError> {
        let state = self.state.lock().await;
        let prepared = state.prepared().ok_or(SegmentError::SessionNotPrepared)?;
        Ok(prepared.transform.to_model(point))
    }

    /// The request the next `decode()` would send.
    pub async fn decode_request(&self) -> Result<DecodeRequest, SegmentError> {
        let state = self.state.lock().await;
        let prepared = state.prepared().ok_or(SegmentError::SessionNotPrepared)?;
        Ok(self.build_request(prepared, None))
    }

    /// The result held as the refinement basis, if any.
    pub async fn previous(&self) -> Option<DecodeOutput> {
        match &*self.state.lock().await {
            SessionState::Decoded { previous, .. } => Some(previous.clone()),
            _ => None,
        }
    }

    /// Decode the current prompt against the cached embeddings.
    pub async fn decode(&self) -> Result<Segmentation, SegmentError> {
        let mut state = self.state.lock().await;
        self.decode_locked(&mut state, None).await
    }

    /// One refinement step: feed the first low-res mask of the previous result
    /// back in as the mask hint and decode again with the same points and box.
    ///
    /// Channel 0 is used regardless of its score. The hint becomes the session's
    /// mask hint only once the decode succeeds.
    pub async fn refine(&self) -> Result<Segmentation, SegmentError> {
        let mut state = self.state.lock().await;
        let hint = match &*state {
            SessionState::Decoded { previous, .. } => previous
                .low_res_masks
                .first()
                .map(|m| m.data.clone())
                .ok_or_else(|| {
                    SegmentError::DecodeFormat("previous result holds no low-res mask".to_string())
                })?,
            _ => return Err(SegmentError::NoPriorDecode),
        };

        self.decode_locked(&mut state, Some(hint)).await
    }

    /// Snapshot the prompt, with `mask_hint` standing in for the stored hint if given.
    fn build_request(&self, prepared: &Prepared, mask_hint: Option<MaskHint>) -> DecodeRequest {
        let prompt = self.prompt.lock().clone();
        DecodeRequest {
            embeddings: Arc::clone(&prepared.embeddings),
            points: prompt.points,
            box_prompt: prompt.box_prompt,
            mask_hint: mask_hint.unwrap_or(prompt.mask_hint),
        }
    }

    async fn decode_locked(
        &self,
        state: &mut SessionState,
        refine_hint: Option<MaskHint>,
    ) -> Result<Segmentation, SegmentError> {
        let prepared = state
            .prepared()
            .cloned()
            .ok_or(SegmentError::SessionNotPrepared)?;

        let refined = refine_hint.is_some();
        let request = self.build_request(&prepared, refine_hint.clone());
        tracing::debug!(
            "Decoding {} points, box={}, hint={}",
            request.points.len(),
            !request.box_prompt.is_empty(),
            !request.mask_hint.is_zero()
        );

        let start = Instant::now();
        let raw = self.engine.decode(request).await?;
        let output = self.decoder.unpack(raw)?;

        let masks = output
            .masks
            .iter()
            .map(|mask| Mask {
                image: prepared.transform.mask_to_original(&mask.image),
                score: mask.score,
            })
            .collect();

        tracing::debug!(
            "Decoded {} masks in {:.1}ms, scores={:?}",
            output.masks.len(),
            start.elapsed().as_secs_f64() * 1000.0,
            output.scores
        );

        // Only a successful refine keeps its hint
        if let Some(hint) = refine_hint {
            self.prompt.lock().mask_hint = hint;
        }
        *state = SessionState::Decoded {
            prepared,
            previous: output.clone(),
            refined,
        };

        Ok(Segmentation { masks, output })
    }
}
