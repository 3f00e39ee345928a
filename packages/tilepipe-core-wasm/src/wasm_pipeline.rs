use std::cell::RefCell;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use serde_wasm_bindgen::{from_value, to_value};
use wasm_bindgen::prelude::*;

use crate::console_log;
use crate::fetch::{JsTileFetcher, UrlTemplate};
use crate::models::TileMeshOutput;
use crate::pipeline::{PipelineConfig, TilePipeline};
use crate::tile::{LngLat, TileKey};
use crate::visualizer::SubLayerProperties;

/// JS handle around a `TilePipeline` fetching through `wasmJsHelpers.fetch`.
///
/// Tiles that finish between two `update()` calls are returned by the
/// second call as an array of `{ tile, visualizer, meshes }`.
#[wasm_bindgen]
pub struct WasmTilePipeline {
    pipeline: TilePipeline,
    outputs: Rc<RefCell<Vec<TileMeshOutput>>>,
}

#[wasm_bindgen]
impl WasmTilePipeline {
    #[wasm_bindgen(constructor)]
    pub fn new(url_template: &str, config: JsValue) -> Result<WasmTilePipeline, JsValue> {
        let config: PipelineConfig = if config.is_undefined() || config.is_null() {
            PipelineConfig::default()
        } else {
            from_value(config)?
        };
        let fetcher = JsTileFetcher::new(UrlTemplate::new(url_template)?);

        let mut pipeline = TilePipeline::new(
            config,
            Rc::new(fetcher),
            Box::new(|driver: LocalBoxFuture<'static, ()>| {
                wasm_bindgen_futures::spawn_local(driver)
            }),
        )?;

        let outputs: Rc<RefCell<Vec<TileMeshOutput>>> = Rc::default();
        let sink = Rc::clone(&outputs);
        pipeline.set_sink(move |tile, visualizer| {
            sink.borrow_mut().push(TileMeshOutput {
                tile: tile.to_string(),
                visualizer: visualizer.key().to_string(),
                meshes: visualizer.tile_meshes(tile).to_vec(),
            });
        });

        console_log!("Tile pipeline created for {}", url_template);
        Ok(WasmTilePipeline { pipeline, outputs })
    }

    /// Register a sub-layer visualizer; returns its index.
    #[wasm_bindgen(js_name = addVisualizer)]
    pub fn add_visualizer(&mut self, properties: JsValue) -> Result<usize, JsValue> {
        let properties: SubLayerProperties = from_value(properties)?;
        Ok(self.pipeline.add_visualizer(properties)?)
    }

    #[wasm_bindgen(js_name = setVisualizerActive)]
    pub fn set_visualizer_active(&mut self, index: usize, active: bool) -> bool {
        match self.pipeline.visualizer_mut(index) {
            Some(visualizer) => {
                visualizer.set_active(active);
                true
            }
            None => false,
        }
    }

    /// Returns the request id, usable with `cancel_request`.
    #[wasm_bindgen(js_name = requestTile)]
    pub fn request_tile(&mut self, z: u32, x: u32, y: u32) -> u32 {
        let handle = self.pipeline.request_tile(TileKey::new(z, x, y));
        handle.id()
    }

    #[wasm_bindgen(js_name = updateLocation)]
    pub fn update_location(&mut self, lng: f64, lat: f64, zoom: u32) -> Result<Vec<u32>, JsValue> {
        let handles = self.pipeline.update_location(LngLat::new(lng, lat), zoom)?;
        Ok(handles.iter().map(|handle| handle.id()).collect())
    }

    #[wasm_bindgen(js_name = cancelTile)]
    pub fn cancel_tile(&mut self, z: u32, x: u32, y: u32) -> bool {
        self.pipeline.cancel_tile(&TileKey::new(z, x, y))
    }

    #[wasm_bindgen(js_name = unregisterTile)]
    pub fn unregister_tile(&mut self, z: u32, x: u32, y: u32) {
        let key = TileKey::new(z, x, y);
        let name = key.to_string();
        self.outputs.borrow_mut().retain(|output| output.tile != name);
        self.pipeline.unregister_tile(&key);
    }

    /// Process finished fetches and hand back the meshes they produced.
    pub fn update(&mut self) -> Result<JsValue, JsValue> {
        let processed = self.pipeline.update();
        let outputs = std::mem::take(&mut *self.outputs.borrow_mut());
        if processed > 0 {
            console_log!("Processed {} tile(s), {} mesh set(s)", processed, outputs.len());
        }
        Ok(to_value(&outputs)?)
    }

    pub fn stats(&self) -> Result<JsValue, JsValue> {
        Ok(to_value(&self.pipeline.stats())?)
    }
}
