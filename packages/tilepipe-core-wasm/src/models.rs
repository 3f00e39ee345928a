// Shared data structures reported across the wasm boundary
use serde::{Deserialize, Serialize};

/// Counters kept by the tile pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineStats {
    pub requests_issued: usize,
    /// Requests answered by an in-flight fetch for the same tile
    pub requests_coalesced: usize,
    pub cache_hits: usize,
    pub tiles_completed: usize,
    pub tiles_cancelled: usize,
    pub tiles_failed: usize,
    pub decompressed: usize,
    pub passthrough: usize,
    pub in_flight: usize,
    pub recent_tiles: usize,
}

impl PipelineStats {
    pub fn hit_rate(&self) -> f64 {
        let served = self.requests_issued + self.requests_coalesced + self.cache_hits;
        if served == 0 {
            0.0
        } else {
            self.cache_hits as f64 / served as f64
        }
    }
}

/// Per-visualizer meshes for one tile, as handed to JS by `update()`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileMeshOutput {
    pub tile: String,
    pub visualizer: String,
    pub meshes: Vec<crate::mesh::FeatureMesh>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TileSummary {
    pub layers: Vec<LayerSummary>,
    pub feature_count: usize,
    pub was_compressed: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerSummary {
    pub name: String,
    pub extent: u32,
    pub feature_count: usize,
}
