//! Interactive SAM2 segmentation: encode an image once, then decode and refine
//! masks from point and box prompts.

pub mod cache;
pub mod error;
pub mod segmentation;

pub use error::{SegmentError, StoreError};
