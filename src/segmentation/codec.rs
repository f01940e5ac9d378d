use super::types::{
    DecodeOutput, DecodeRequest, ImageTensor, LowResMask, Mask, MaskHint, MaskTensor, RawDecodeOutput,
    RawTensor, MASK_HINT_SIDE,
};
use crate::error::SegmentError;
use image::{Rgba, RgbaImage};
use ndarray::{s, ArrayView3, Axis};

/// Color used to paint mask pixels.
pub const DEFAULT_MASK_COLOR: Rgba<u8> = Rgba([0, 114, 189, 255]);

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// Pack an interleaved RGBA square canvas into a planar `[1, 3, S, S]` u8 tensor.
///
/// Alpha is dropped; values are passed through without normalization.
pub fn pack_image(canvas: &RgbaImage) -> Result<ImageTensor, SegmentError> {
    let _span = tracing::debug_span!("pack_image").entered();

    let (width, height) = canvas.dimensions();
    if width != height {
        return Err(SegmentError::InvalidImage(format!(
            "encoder input must be square, got {}x{}",
            width, height
        )));
    }
    let side = width as usize;

    // HWC view over the raw buffer, then reorder to CHW without alpha
    let hwc = ArrayView3::from_shape((side, side, 4), canvas.as_raw().as_slice())
        .map_err(|e| SegmentError::InvalidImage(e.to_string()))?;
    let chw = hwc.slice(s![.., .., ..3]).permuted_axes([2, 0, 1]);
    let data: Vec<u8> = chw.iter().copied().collect();

    Ok(ImageTensor { data, side })
}

/// Decoder prompt buffers, rebuilt from session state on every call.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptTensors {
    pub num_points: usize,
    /// `[1, N, 2]` as `x1, y1, x2, y2, ...`
    pub point_coords: Vec<f32>,
    /// `[1, N]`
    pub point_labels: Vec<i64>,
    /// `[1, 4]` as `x1, y1, x2, y2`
    pub boxes: [f32; 4],
    /// `[1, 1, 256, 256]`
    pub mask_input: Vec<f32>,
}

impl PromptTensors {
    pub fn point_coords_shape(&self) -> [usize; 3] {
        [1, self.num_points, 2]
    }

    pub fn point_labels_shape(&self) -> [usize; 2] {
        [1, self.num_points]
    }

    pub fn mask_input_shape(&self) -> [usize; 4] {
        [1, 1, MASK_HINT_SIDE, MASK_HINT_SIDE]
    }
}

/// Build fresh prompt buffers for one decode. Point order is kept.
pub fn pack_prompt(request: &DecodeRequest) -> PromptTensors {
    let point_coords = request.points.iter().flat_map(|p| [p.x, p.y]).collect();
    let point_labels = request.points.iter().map(|p| p.label.as_i64()).collect();
    let b = &request.box_prompt;

    PromptTensors {
        num_points: request.points.len(),
        point_coords,
        point_labels,
        boxes: [b.top_left.x, b.top_left.y, b.bottom_right.x, b.bottom_right.y],
        mask_input: request.mask_hint.as_slice().to_vec(),
    }
}

/// IoU prediction in `[0, 1]` to a percentage rounded to two decimals.
pub fn iou_to_percent(value: f32) -> f32 {
    ((value as f64 * 10_000.0).round() / 100.0) as f32
}

/// Anything that can be thresholded into a mask pixel.
pub trait MaskElement: Copy {
    fn is_set(self) -> bool;
}

impl MaskElement for u8 {
    fn is_set(self) -> bool {
        self > 0
    }
}

impl MaskElement for bool {
    fn is_set(self) -> bool {
        self
    }
}

impl MaskElement for f32 {
    fn is_set(self) -> bool {
        self > 0.0
    }
}

/// Paint every set element with `color`, leaving the rest transparent.
pub fn rasterize<'a, T, I>(values: I, width: u32, height: u32, color: Rgba<u8>) -> RgbaImage
where
    T: MaskElement + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let mut image = RgbaImage::from_pixel(width, height, TRANSPARENT);
    for (pixel, value) in image.pixels_mut().zip(values) {
        if value.is_set() {
            *pixel = color;
        }
    }
    image
}

/// Converts raw decoder outputs into display-ready masks and scores.
#[derive(Debug, Clone, Copy)]
pub struct MaskDecoder {
    color: Rgba<u8>,
}

impl Default for MaskDecoder {
    fn default() -> Self {
        Self::new(DEFAULT_MASK_COLOR)
    }
}

impl MaskDecoder {
    pub fn new(color: Rgba<u8>) -> Self {
        Self { color }
    }

    /// Unpack a full decoder response. Any missing or malformed output fails the
    /// whole call; no partial mask set is returned.
    pub fn unpack(&self, raw: RawDecodeOutput) -> Result<DecodeOutput, SegmentError> {
        let _span = tracing::debug_span!("unpack_masks").entered();

        let iou = raw
            .iou_predictions
            .ok_or_else(|| missing("iou_predictions"))?;
        let masks = raw.masks.ok_or_else(|| missing("masks"))?;
        let low_res = raw.low_res_masks.ok_or_else(|| missing("low_res_masks"))?;

        let scores = unpack_scores(&iou)?;

        let masks = match &masks {
            MaskTensor::Bytes(t) => self.unpack_masks(t, &scores)?,
            MaskTensor::Bools(t) => self.unpack_masks(t, &scores)?,
            MaskTensor::Floats(t) => self.unpack_masks(t, &scores)?,
        };
        let low_res_masks = self.unpack_low_res(&low_res, &scores)?;

        tracing::debug!(
            "Unpacked {} masks, scores={:?}",
            masks.len(),
            scores
        );

        Ok(DecodeOutput {
            masks,
            scores,
            low_res_masks,
        })
    }

    fn unpack_masks<T: MaskElement>(
        &self,
        tensor: &RawTensor<T>,
        scores: &[f32],
    ) -> Result<Vec<Mask>, SegmentError> {
        let channels = channel_view("masks", tensor, scores.len())?;
        let (height, width) = (channels.shape()[1], channels.shape()[2]);

        Ok(channels
            .axis_iter(Axis(0))
            .zip(scores)
            .map(|(channel, &score)| Mask {
                image: rasterize(channel.iter(), width as u32, height as u32, self.color),
                score,
            })
            .collect())
    }

    fn unpack_low_res(
        &self,
        tensor: &RawTensor<f32>,
        scores: &[f32],
    ) -> Result<Vec<LowResMask>, SegmentError> {
        let channels = channel_view("low_res_masks", tensor, scores.len())?;
        let (height, width) = (channels.shape()[1], channels.shape()[2]);
        if (height, width) != (MASK_HINT_SIDE, MASK_HINT_SIDE) {
            return Err(SegmentError::DecodeFormat(format!(
                "low_res_masks must be {}x{}, got {}x{}",
                MASK_HINT_SIDE, MASK_HINT_SIDE, width, height
            )));
        }

        channels
            .axis_iter(Axis(0))
            .zip(scores)
            .map(|(channel, &score)| {
                Ok(LowResMask {
                    data: MaskHint::from_vec(channel.iter().copied().collect())
                        .map_err(|e| SegmentError::DecodeFormat(e.to_string()))?,
                    image: rasterize(channel.iter(), width as u32, height as u32, self.color),
                    score,
                })
            })
            .collect()
    }
}

fn missing(name: &str) -> SegmentError {
    SegmentError::DecodeFormat(format!("decoder output '{}' is missing", name))
}

/// `[1, count]` IoU predictions to percentages, in engine order.
fn unpack_scores(tensor: &RawTensor<f32>) -> Result<Vec<f32>, SegmentError> {
    let count = match tensor.shape.as_slice() {
        [1, count] => *count,
        other => {
            return Err(SegmentError::DecodeFormat(format!(
                "iou_predictions must have shape [1, count], got {:?}",
                other
            )))
        }
    };
    if count == 0 {
        return Err(SegmentError::DecodeFormat(
            "decoder returned no masks".to_string(),
        ));
    }
    if tensor.data.len() != count {
        return Err(SegmentError::DecodeFormat(format!(
            "iou_predictions holds {} values for {} masks",
            tensor.data.len(),
            count
        )));
    }
    Ok(tensor.data.iter().map(|&v| iou_to_percent(v)).collect())
}

/// View a `[1, count, H, W]` tensor as `count` planes of `H x W`.
fn channel_view<'a, T>(
    name: &str,
    tensor: &'a RawTensor<T>,
    count: usize,
) -> Result<ArrayView3<'a, T>, SegmentError> {
    let (channels, height, width) = match tensor.shape.as_slice() {
        [1, c, h, w] => (*c, *h, *w),
        other => {
            return Err(SegmentError::DecodeFormat(format!(
                "{} must have shape [1, count, H, W], got {:?}",
                name, other
            )))
        }
    };
    if channels != count {
        return Err(SegmentError::DecodeFormat(format!(
            "{} has {} channels but {} scores were returned",
            name, channels, count
        )));
    }
    if height == 0 || width == 0 {
        return Err(SegmentError::DecodeFormat(format!("{} has an empty plane", name)));
    }
    Ok(ArrayView3::from_shape((channels, height, width), tensor.data.as_slice())?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segmentation::types::{BoxPrompt, Embeddings, LabeledPoint, Point};
    use std::sync::Arc;

    fn low_res(count: usize, value: f32) -> RawTensor<f32> {
        RawTensor::new(
            vec![1, count, MASK_HINT_SIDE, MASK_HINT_SIDE],
            vec![value; count * MaskHint::LEN],
        )
    }

    #[test]
    fn pack_image_is_planar_and_drops_alpha() {
        let mut canvas = RgbaImage::new(2, 2);
        canvas.put_pixel(0, 0, Rgba([1, 2, 3, 4]));
        canvas.put_pixel(1, 0, Rgba([5, 6, 7, 8]));
        canvas.put_pixel(0, 1, Rgba([9, 10, 11, 12]));
        canvas.put_pixel(1, 1, Rgba([13, 14, 15, 16]));

        let tensor = pack_image(&canvas).unwrap();
        assert_eq!(tensor.shape(), [1, 3, 2, 2]);
        assert_eq!(tensor.data, vec![1, 5, 9, 13, 2, 6, 10, 14, 3, 7, 11, 15]);
    }

    #[test]
    fn pack_image_rejects_non_square() {
        assert!(pack_image(&RgbaImage::new(4, 2)).is_err());
    }

    #[test]
    fn scores_are_percentages_with_two_decimals() {
        assert!((iou_to_percent(0.8734) - 87.34).abs() < 1e-4);
        assert_eq!(iou_to_percent(1.0), 100.0);
        assert_eq!(iou_to_percent(0.0), 0.0);
        assert!((iou_to_percent(0.123456) - 12.35).abs() < 1e-4);
    }

    #[test]
    fn rasterize_paints_only_positive_elements() {
        let image = rasterize(&[0u8, 0, 1, 0], 2, 2, DEFAULT_MASK_COLOR);
        let alphas: Vec<u8> = image.pixels().map(|p| p[3]).collect();
        assert_eq!(alphas, vec![0, 0, 255, 0]);
        assert_eq!(*image.get_pixel(0, 1), DEFAULT_MASK_COLOR);
    }

    #[test]
    fn float_masks_threshold_at_zero() {
        let image = rasterize(&[-0.5f32, 0.0, 0.01, 3.0], 2, 2, DEFAULT_MASK_COLOR);
        let alphas: Vec<u8> = image.pixels().map(|p| p[3]).collect();
        assert_eq!(alphas, vec![0, 0, 255, 255]);
    }

    #[test]
    fn pack_prompt_keeps_point_order() {
        let request = DecodeRequest {
            embeddings: Arc::new(Embeddings {
                image_embed: vec![],
                high_res_feat1: vec![],
                high_res_feat2: vec![],
            }),
            points: vec![
                LabeledPoint::foreground(10.0, 20.0),
                LabeledPoint::background(30.0, 40.0),
                LabeledPoint::foreground(50.0, 60.0),
            ],
            box_prompt: BoxPrompt::new(Point::new(1.0, 2.0), Point::new(3.0, 4.0)),
            mask_hint: MaskHint::zeros(),
        };

        let packed = pack_prompt(&request);
        assert_eq!(packed.num_points, 3);
        assert_eq!(packed.point_coords, vec![10.0, 20.0, 30.0, 40.0, 50.0, 60.0]);
        assert_eq!(packed.point_labels, vec![1, 0, 1]);
        assert_eq!(packed.boxes, [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(packed.mask_input.len(), MaskHint::LEN);
        assert_eq!(packed.point_coords_shape(), [1, 3, 2]);
    }

    #[test]
    fn unpack_preserves_engine_order() {
        let raw = RawDecodeOutput {
            masks: Some(MaskTensor::Bytes(RawTensor::new(
                vec![1, 2, 2, 2],
                vec![0, 0, 1, 0, 1, 1, 1, 1],
            ))),
            iou_predictions: Some(RawTensor::new(vec![1, 2], vec![0.25, 0.9])),
            low_res_masks: Some(low_res(2, -1.0)),
        };

        let out = MaskDecoder::default().unpack(raw).unwrap();
        assert_eq!(out.scores, vec![25.0, 90.0]);
        assert_eq!(out.masks.len(), 2);
        assert_eq!(out.masks[0].score, 25.0);
        assert_eq!(out.masks[1].score, 90.0);
        assert_eq!(out.masks[0].image.pixels().filter(|p| p[3] == 255).count(), 1);
        assert_eq!(out.masks[1].image.pixels().filter(|p| p[3] == 255).count(), 4);
        assert_eq!(out.low_res_masks.len(), 2);
        assert_eq!(out.low_res_masks[1].data.as_slice()[0], -1.0);
        assert!(out.low_res_masks[0].image.pixels().all(|p| p[3] == 0));
    }

    #[test]
    fn missing_output_is_a_format_error() {
        let raw = RawDecodeOutput {
            masks: None,
            iou_predictions: Some(RawTensor::new(vec![1, 1], vec![0.5])),
            low_res_masks: Some(low_res(1, 0.0)),
        };
        assert!(matches!(
            MaskDecoder::default().unpack(raw),
            Err(SegmentError::DecodeFormat(_))
        ));
    }

    #[test]
    fn channel_count_mismatch_is_a_format_error() {
        let raw = RawDecodeOutput {
            masks: Some(MaskTensor::Floats(RawTensor::new(vec![1, 3, 1, 1], vec![1.0; 3]))),
            iou_predictions: Some(RawTensor::new(vec![1, 2], vec![0.5, 0.5])),
            low_res_masks: Some(low_res(2, 0.0)),
        };
        assert!(matches!(
            MaskDecoder::default().unpack(raw),
            Err(SegmentError::DecodeFormat(_))
        ));
    }

    #[test]
    fn wrong_dimension_count_is_a_format_error() {
        let raw = RawDecodeOutput {
            masks: Some(MaskTensor::Bools(RawTensor::new(vec![2, 1, 1], vec![true; 2]))),
            iou_predictions: Some(RawTensor::new(vec![1, 2], vec![0.5, 0.5])),
            low_res_masks: Some(low_res(2, 0.0)),
        };
        assert!(matches!(
            MaskDecoder::default().unpack(raw),
            Err(SegmentError::DecodeFormat(_))
        ));
    }
}
