/// Errors surfaced by an interactive segmentation session.
#[derive(thiserror::Error, Debug)]
pub enum SegmentError {
    #[error("Session not prepared: call prepare() before decoding")]
    SessionNotPrepared,

    #[error("No prior decode: call decode() before refine()")]
    NoPriorDecode,

    #[error("Decode Format Error: {0}")]
    DecodeFormat(String),

    #[error("Engine Unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Invalid Image: {0}")]
    InvalidImage(String),

    #[error("Invalid Prompt: {0}")]
    InvalidPrompt(String),

    #[error("Inference Error: {0}")]
    Inference(String),

    #[error("Image Error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Task Error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl From<ndarray::ShapeError> for SegmentError {
    fn from(e: ndarray::ShapeError) -> Self {
        SegmentError::DecodeFormat(e.to_string())
    }
}

/// Errors raised by an embedding store. These never abort a session.
#[derive(thiserror::Error, Debug)]
pub enum StoreError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization Error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Invalid Key: {0}")]
    InvalidKey(String),
}
