use thiserror::Error;
use wasm_bindgen::JsValue;

/// Errors produced by the tile pipeline.
///
/// Malformed compressed input is deliberately absent: decompression recovers
/// locally and hands back the original buffer.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PipelineError {
    #[error("index {index} out of range for ring buffer holding {count} items")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("ring buffer capacity must be at least 1")]
    ZeroCapacity,

    #[error("unsupported compression level {0} (expected 0-9)")]
    InvalidCompressionLevel(u32),

    #[error("compression failed: {0}")]
    Compression(String),

    #[error("property '{0}' is missing")]
    MissingProperty(String),

    #[error("property '{property}' is not numeric: {value}")]
    NonNumericProperty { property: String, value: String },

    #[error("invalid filter: {0}")]
    InvalidFilter(String),

    #[error("triangulation failed: {0}")]
    Triangulation(String),

    #[error("failed to decode vector tile: {0}")]
    TileDecode(String),

    #[error("fetch failed for tile {tile}: {reason}")]
    Fetch { tile: String, reason: String },

    #[error("visualizer '{key}' cannot {operation} while {state}")]
    InvalidState {
        key: String,
        state: String,
        operation: String,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<serde_json::Error> for PipelineError {
    fn from(err: serde_json::Error) -> Self {
        PipelineError::Config(err.to_string())
    }
}

impl From<PipelineError> for JsValue {
    fn from(err: PipelineError) -> Self {
        JsValue::from_str(&err.to_string())
    }
}
