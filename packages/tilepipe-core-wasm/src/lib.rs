use serde::Serialize;
use serde_wasm_bindgen::to_value;
use wasm_bindgen::prelude::*;

// Console logging (browser console on wasm, tracing natively)
pub mod console;
pub mod error;
pub mod models;
mod cache_keys;
// Gzip detection with pass-through fallback
pub mod decompress;
pub mod ring_buffer;
pub mod tile;
mod bbox_filter;
pub mod filters;
pub mod mesh;
pub mod visualizer;
// Request handles, dispatcher and the global request registry
pub mod cancellation;
pub mod fetch;
pub mod pipeline;
mod wasm_pipeline;

pub use cancellation::{RequestDispatcher, RequestHandle, RequestKind};
pub use decompress::{compress, decompress};
pub use error::PipelineError;
pub use filters::{FeatureFilter, FilterChain, FilterConfig};
pub use pipeline::{PipelineConfig, TilePipeline};
pub use ring_buffer::RecencyRingBuffer;
pub use visualizer::{LayerVisualizer, SubLayerProperties};
pub use wasm_pipeline::WasmTilePipeline;

use models::{LayerSummary, TileSummary};
use tile::{decode_tile, TileKey};

#[macro_export]
macro_rules! console_log {
    ($($t:tt)*) => ($crate::console::log(&format!($($t)*)))
}

#[macro_export]
macro_rules! console_warn {
    ($($t:tt)*) => ($crate::console::warn(&format!($($t)*)))
}

use std::sync::Once;
static INIT: Once = Once::new();

#[wasm_bindgen(start)]
pub fn start() {
    INIT.call_once(|| {
        #[cfg(feature = "console_error_panic_hook")]
        console_error_panic_hook::set_once();

        console_log!("tilepipe wasm module initialized");
    });
}

/// Gunzip tile bytes; anything that is not valid gzip comes back unchanged.
#[wasm_bindgen]
pub fn decompress_tile_data(data: &[u8]) -> Vec<u8> {
    decompress(data).into_owned()
}

#[wasm_bindgen]
pub fn compress_tile_data(data: &[u8], level: u32) -> Result<Vec<u8>, JsValue> {
    Ok(compress(data, level)?)
}

/// Layer names and feature counts of a (possibly gzipped) tile.
#[wasm_bindgen]
pub fn decode_tile_summary(data: &[u8], z: u32, x: u32, y: u32) -> Result<JsValue, JsValue> {
    let bytes = decompress(data);
    let tile = decode_tile(&bytes, &TileKey::new(z, x, y))?;

    let mut layers: Vec<LayerSummary> = tile
        .layers
        .values()
        .map(|layer| LayerSummary {
            name: layer.name.clone(),
            extent: layer.extent,
            feature_count: layer.features.len(),
        })
        .collect();
    layers.sort_by(|a, b| a.name.cmp(&b.name));

    let summary = TileSummary {
        feature_count: tile.feature_count(),
        was_compressed: decompress::is_gzipped(data),
        layers,
    };
    Ok(to_value(&summary)?)
}

/// Cancel an in-flight request by the id returned from `requestTile`.
#[wasm_bindgen]
pub fn cancel_request(id: u32) -> bool {
    cancellation::cancel_registered(id)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct PipelineInfo {
    version: &'static str,
    chunk_size: usize,
    max_compression_level: u32,
    default_config: PipelineConfig,
}

#[wasm_bindgen]
pub fn get_pipeline_info() -> Result<JsValue, JsValue> {
    let info = PipelineInfo {
        version: env!("CARGO_PKG_VERSION"),
        chunk_size: decompress::CHUNK_SIZE,
        max_compression_level: decompress::MAX_COMPRESSION_LEVEL,
        default_config: PipelineConfig::default(),
    };
    Ok(to_value(&info)?)
}
