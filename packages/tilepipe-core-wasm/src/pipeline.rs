use std::borrow::Cow;
use std::collections::HashMap;
use std::rc::Rc;

use futures::future::LocalBoxFuture;
use serde::{Deserialize, Serialize};

use crate::cache_keys::make_bbox_key;
use crate::cancellation::{RequestDispatcher, RequestHandle, RequestKind};
use crate::decompress::{decompress, is_gzipped};
use crate::error::PipelineError;
use crate::fetch::TileFetcher;
use crate::models::PipelineStats;
use crate::ring_buffer::RecencyRingBuffer;
use crate::tile::{
    check_zoom, decode_tile, tiles_for_bbox, DecodedTile, GeoBbox, LngLat, TileKey, TileLayer,
};
use crate::visualizer::{LayerVisualizer, SubLayerProperties};
use crate::{console_log, console_warn};

fn default_recent_tile_capacity() -> usize {
    64
}
fn default_recent_location_capacity() -> usize {
    16
}
fn default_neighborhood() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineConfig {
    /// Decoded tiles kept for instant re-requests
    #[serde(default = "default_recent_tile_capacity")]
    pub recent_tile_capacity: usize,
    #[serde(default = "default_recent_location_capacity")]
    pub recent_location_capacity: usize,
    /// Tiles around a location fix requested along with it
    #[serde(default = "default_neighborhood")]
    pub neighborhood: u32,
    #[serde(default)]
    pub request_kind: RequestKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            recent_tile_capacity: default_recent_tile_capacity(),
            recent_location_capacity: default_recent_location_capacity(),
            neighborhood: default_neighborhood(),
            request_kind: RequestKind::default(),
        }
    }
}

impl PipelineConfig {
    pub fn from_json(json: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(json)?)
    }
}

pub type TileSink = Box<dyn FnMut(&TileKey, &LayerVisualizer)>;
pub type Spawner = Box<dyn Fn(LocalBoxFuture<'static, ()>)>;

/// Everything completion callbacks touch, borrowed mutably by the
/// dispatcher while it delivers.
pub struct TileStage {
    pending: HashMap<TileKey, RequestHandle>,
    visualizers: Vec<LayerVisualizer>,
    recent_tiles: RecencyRingBuffer<(TileKey, Rc<DecodedTile>)>,
    sink: Option<TileSink>,
    stats: PipelineStats,
}

impl TileStage {
    fn complete(&mut self, key: TileKey, result: Result<Vec<u8>, PipelineError>) {
        self.pending.remove(&key);
        let bytes = match result {
            Ok(bytes) => bytes,
            Err(e) => {
                console_warn!("Tile {} failed: {}", key, e);
                self.stats.tiles_failed += 1;
                return;
            }
        };

        // decompression finishes before any decoding or filtering
        let data = decompress(&bytes);
        if is_gzipped(&bytes) && matches!(data, Cow::Owned(_)) {
            self.stats.decompressed += 1;
        } else {
            self.stats.passthrough += 1;
        }

        let tile = match decode_tile(&data, &key) {
            Ok(tile) => Rc::new(tile),
            Err(e) => {
                console_warn!("Tile {} could not be decoded: {}", key, e);
                self.stats.tiles_failed += 1;
                return;
            }
        };

        self.recent_tiles.push((key, Rc::clone(&tile)));
        self.visualize(&key, &tile);
        self.stats.tiles_completed += 1;
    }

    fn visualize(&mut self, key: &TileKey, tile: &DecodedTile) {
        let Self {
            visualizers, sink, ..
        } = self;
        for visualizer in visualizers.iter_mut() {
            let empty;
            let layer = match tile.layer(visualizer.source_layer()) {
                Some(layer) => layer,
                None => {
                    empty = TileLayer::new(visualizer.source_layer(), Vec::new());
                    &empty
                }
            };
            visualizer.create(layer, key, |key, visualizer| {
                if let Some(sink) = sink.as_mut() {
                    sink(key, visualizer);
                }
            });
        }
    }

    fn recent_tile(&self, key: &TileKey) -> Option<Rc<DecodedTile>> {
        self.recent_tiles
            .find(|(k, _)| k == key)
            .map(|(_, tile)| Rc::clone(tile))
    }
}

/// Coordinates fetching, decoding and visualizing tiles on one owner loop.
///
/// Fetches run on whatever `spawner` drives; their results wait in the
/// dispatcher until `update` is called.
pub struct TilePipeline {
    config: PipelineConfig,
    dispatcher: RequestDispatcher<Vec<u8>, TileStage>,
    stage: TileStage,
    recent_locations: RecencyRingBuffer<LngLat>,
    fetcher: Rc<dyn TileFetcher>,
    spawner: Spawner,
}

impl TilePipeline {
    pub fn new(
        config: PipelineConfig,
        fetcher: Rc<dyn TileFetcher>,
        spawner: Spawner,
    ) -> Result<Self, PipelineError> {
        let stage = TileStage {
            pending: HashMap::new(),
            visualizers: Vec::new(),
            recent_tiles: RecencyRingBuffer::new(config.recent_tile_capacity)?,
            sink: None,
            stats: PipelineStats::default(),
        };
        Ok(Self {
            recent_locations: RecencyRingBuffer::new(config.recent_location_capacity)?,
            config,
            dispatcher: RequestDispatcher::new(),
            stage,
            fetcher,
            spawner,
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Add and initialize a visualizer; returns its index.
    pub fn add_visualizer(&mut self, properties: SubLayerProperties) -> Result<usize, PipelineError> {
        let mut visualizer = LayerVisualizer::new(properties)?;
        visualizer.initialize();
        console_log!("Added visualizer '{}'", visualizer.key());
        self.stage.visualizers.push(visualizer);
        Ok(self.stage.visualizers.len() - 1)
    }

    pub fn visualizers(&self) -> &[LayerVisualizer] {
        &self.stage.visualizers
    }

    pub fn visualizer_mut(&mut self, index: usize) -> Option<&mut LayerVisualizer> {
        self.stage.visualizers.get_mut(index)
    }

    /// Called once per visualizer for every tile that finishes processing.
    pub fn set_sink<F>(&mut self, sink: F)
    where
        F: FnMut(&TileKey, &LayerVisualizer) + 'static,
    {
        self.stage.sink = Some(Box::new(sink));
    }

    /// Request one tile. An in-flight request for the same tile is shared;
    /// a recently decoded tile is visualized right away and the returned
    /// handle is already completed.
    pub fn request_tile(&mut self, key: TileKey) -> RequestHandle {
        let kind = self.config.request_kind;

        if let Some(handle) = self.stage.pending.get(&key) {
            if !handle.is_completed() {
                self.stage.stats.requests_coalesced += 1;
                return handle.clone();
            }
        }

        if let Some(tile) = self.stage.recent_tile(&key) {
            self.stage.stats.cache_hits += 1;
            self.stage.visualize(&key, &tile);
            return RequestHandle::completed(kind);
        }

        let request = self.fetcher.fetch(&key, kind);
        let (handle, driver) = self.dispatcher.issue(
            kind,
            request,
            move |result, stage: &mut TileStage| stage.complete(key, result),
        );
        self.stage.pending.insert(key, handle.clone());
        self.stage.stats.requests_issued += 1;
        (self.spawner)(driver);
        handle
    }

    pub fn request_tiles_for_bbox(
        &mut self,
        bbox: &GeoBbox,
        zoom: u32,
    ) -> Result<Vec<RequestHandle>, PipelineError> {
        check_zoom(zoom)?;
        let tiles = tiles_for_bbox(bbox, zoom);
        console_log!(
            "Requesting {} tile(s) at zoom {} for bbox {}",
            tiles.len(),
            zoom,
            make_bbox_key(bbox.min_lng, bbox.min_lat, bbox.max_lng, bbox.max_lat)
        );
        Ok(tiles
            .into_iter()
            .map(|key| self.request_tile(key))
            .collect())
    }

    /// Record a location fix and request the tiles around it. A zoom past
    /// `MAX_ZOOM` is rejected before the fix is recorded.
    pub fn update_location(
        &mut self,
        position: LngLat,
        zoom: u32,
    ) -> Result<Vec<RequestHandle>, PipelineError> {
        check_zoom(zoom)?;
        self.recent_locations.push(position);
        Ok(TileKey::containing(position, zoom)
            .neighborhood(self.config.neighborhood)
            .into_iter()
            .map(|key| self.request_tile(key))
            .collect())
    }

    /// Newest first.
    pub fn recent_locations(&self) -> &RecencyRingBuffer<LngLat> {
        &self.recent_locations
    }

    pub fn is_pending(&self, key: &TileKey) -> bool {
        self.stage
            .pending
            .get(key)
            .map_or(false, |handle| !handle.is_completed())
    }

    pub fn cancel_tile(&mut self, key: &TileKey) -> bool {
        let cancelled = self
            .stage
            .pending
            .remove(key)
            .map_or(false, |handle| handle.cancel());
        if cancelled {
            console_log!("Cancelled request for tile {}", key);
            self.stage.stats.tiles_cancelled += 1;
        }
        cancelled
    }

    /// Cancel any fetch for the tile and release it from every visualizer.
    pub fn unregister_tile(&mut self, key: &TileKey) {
        self.cancel_tile(key);
        for visualizer in &mut self.stage.visualizers {
            visualizer.unregister_tile(key);
        }
    }

    /// Deliver finished fetches. Returns how many tiles were processed.
    pub fn update(&mut self) -> usize {
        let delivered = self.dispatcher.dispatch_completed(&mut self.stage);

        // handles cancelled by id through the registry
        let stats = &mut self.stage.stats;
        self.stage.pending.retain(|_, handle| {
            if handle.is_cancelled() {
                stats.tiles_cancelled += 1;
                false
            } else {
                true
            }
        });
        delivered
    }

    pub fn stats(&self) -> PipelineStats {
        PipelineStats {
            in_flight: self.dispatcher.pending_count(),
            recent_tiles: self.stage.recent_tiles.len(),
            ..self.stage.stats.clone()
        }
    }
}
