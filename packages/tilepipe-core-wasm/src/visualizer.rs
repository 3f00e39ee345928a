use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache_keys::make_visualizer_key;
use crate::error::PipelineError;
use crate::filters::{FilterChain, FilterConfig};
use crate::mesh::{build_feature_mesh, FeatureMesh, MeshStyle};
use crate::tile::{Feature, TileKey, TileLayer};
use crate::{console_log, console_warn};

fn default_true() -> bool {
    true
}

/// Configuration of one sub-layer: which source layer it reads, how its
/// features are filtered, and how survivors are meshed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubLayerProperties {
    pub source_layer: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub filters: Vec<FilterConfig>,
    #[serde(flatten)]
    pub style: MeshStyle,
}

impl SubLayerProperties {
    pub fn new(source_layer: &str) -> Self {
        Self {
            source_layer: source_layer.to_string(),
            name: None,
            active: true,
            filters: Vec::new(),
            style: MeshStyle::default(),
        }
    }

    pub fn with_filter(mut self, filter: FilterConfig) -> Self {
        self.filters.push(filter);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VisualizerState {
    pub active: bool,
    pub key: String,
    pub properties: SubLayerProperties,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VisualizerPhase {
    Uninitialized,
    Initialized,
    /// `create` has produced output for at least one tile.
    Active,
}

impl fmt::Display for VisualizerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VisualizerPhase::Uninitialized => "uninitialized",
            VisualizerPhase::Initialized => "initialized",
            VisualizerPhase::Active => "active",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChangeKind {
    PropertiesChanged,
    ActiveChanged,
    Cleared,
}

/// Delivered to subscribers after a mutation, carrying the resulting state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub state: VisualizerState,
}

pub type SubscriberId = u64;

/// Observer registry. Delivery is synchronous and in subscription order.
#[derive(Default)]
pub struct ChangeNotifier {
    next_id: SubscriberId,
    subscribers: BTreeMap<SubscriberId, Box<dyn FnMut(&ChangeEvent)>>,
}

impl ChangeNotifier {
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriberId
    where
        F: FnMut(&ChangeEvent) + 'static,
    {
        let id = self.next_id;
        self.next_id += 1;
        self.subscribers.insert(id, Box::new(callback));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn notify(&mut self, event: &ChangeEvent) {
        for callback in self.subscribers.values_mut() {
            callback(event);
        }
    }
}

impl fmt::Debug for ChangeNotifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeNotifier")
            .field("subscribers", &self.subscribers.len())
            .finish()
    }
}

/// Optional overrides for a visualizer. Every method has a default, so an
/// empty impl gives the stock behaviour.
pub trait VisualizerHooks {
    fn on_initialize(&mut self, _state: &VisualizerState) {}

    fn build_mesh(
        &self,
        feature: &Feature,
        style: &MeshStyle,
        tile: &TileKey,
    ) -> Result<Option<FeatureMesh>, PipelineError> {
        build_feature_mesh(feature, style, tile)
    }

    fn on_unregister_tile(&mut self, _tile: &TileKey) {}
}

#[derive(Debug, Default)]
pub struct DefaultHooks;

impl VisualizerHooks for DefaultHooks {}

/// Turns the features of one source layer into per-tile meshes.
///
/// `create` with the active flag off still calls back exactly once, with no
/// meshes, and stores nothing for the tile.
pub struct LayerVisualizer {
    state: VisualizerState,
    phase: VisualizerPhase,
    chain: FilterChain,
    tiles: HashMap<TileKey, Vec<FeatureMesh>>,
    notifier: ChangeNotifier,
    hooks: Box<dyn VisualizerHooks>,
}

impl LayerVisualizer {
    pub fn new(properties: SubLayerProperties) -> Result<Self, PipelineError> {
        Self::with_hooks(properties, Box::new(DefaultHooks))
    }

    pub fn with_hooks(
        properties: SubLayerProperties,
        hooks: Box<dyn VisualizerHooks>,
    ) -> Result<Self, PipelineError> {
        properties.style.validate()?;
        let chain = FilterChain::from_configs(&properties.filters)?;
        Ok(Self {
            state: VisualizerState {
                active: properties.active,
                key: make_visualizer_key(&properties.source_layer, &properties.filters),
                properties,
            },
            phase: VisualizerPhase::Uninitialized,
            chain,
            tiles: HashMap::new(),
            notifier: ChangeNotifier::default(),
            hooks,
        })
    }

    pub fn key(&self) -> &str {
        &self.state.key
    }

    pub fn source_layer(&self) -> &str {
        &self.state.properties.source_layer
    }

    pub fn properties(&self) -> &SubLayerProperties {
        &self.state.properties
    }

    pub fn state(&self) -> &VisualizerState {
        &self.state
    }

    pub fn phase(&self) -> VisualizerPhase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.state.active
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriberId
    where
        F: FnMut(&ChangeEvent) + 'static,
    {
        self.notifier.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriberId) -> bool {
        self.notifier.unsubscribe(id)
    }

    pub fn initialize(&mut self) {
        if self.phase != VisualizerPhase::Uninitialized {
            return;
        }
        self.chain.initialize();
        self.hooks.on_initialize(&self.state);
        self.phase = VisualizerPhase::Initialized;
        console_log!("Visualizer '{}' initialized", self.state.key);
    }

    /// Replace the sub-layer configuration. A filter list that fails to
    /// build, or an invalid style, leaves the previous configuration in place.
    pub fn set_properties(&mut self, properties: SubLayerProperties) -> Result<(), PipelineError> {
        if self.phase == VisualizerPhase::Uninitialized {
            return Err(self.invalid_state("set properties"));
        }

        properties.style.validate()?;
        let mut chain = FilterChain::from_configs(&properties.filters)?;
        chain.initialize();
        self.chain = chain;
        self.state.key = make_visualizer_key(&properties.source_layer, &properties.filters);
        self.state.active = properties.active;
        self.state.properties = properties;
        self.emit(ChangeKind::PropertiesChanged);
        Ok(())
    }

    pub fn set_active(&mut self, active: bool) {
        if self.state.active == active {
            return;
        }
        self.state.active = active;
        self.state.properties.active = active;
        self.emit(ChangeKind::ActiveChanged);
    }

    /// Filter and mesh `layer` for `tile`, then call `callback` exactly once.
    /// Features failing a filter or the mesh builder are skipped, not fatal.
    pub fn create<F>(&mut self, layer: &TileLayer, tile: &TileKey, callback: F)
    where
        F: FnOnce(&TileKey, &LayerVisualizer),
    {
        self.initialize();

        if self.state.active {
            let mut meshes = Vec::new();
            for feature in self.chain.retain(&layer.features) {
                match self
                    .hooks
                    .build_mesh(feature, &self.state.properties.style, tile)
                {
                    Ok(Some(mesh)) => meshes.push(mesh),
                    Ok(None) => {}
                    Err(e) => console_warn!(
                        "Skipping feature {:?} of {} in tile {}: {}",
                        feature.id,
                        layer.name,
                        tile,
                        e
                    ),
                }
            }
            self.tiles.insert(*tile, meshes);
            self.phase = VisualizerPhase::Active;
        }

        callback(tile, self);
    }

    /// Meshes produced for `tile`; empty when none are held.
    pub fn tile_meshes(&self, tile: &TileKey) -> &[FeatureMesh] {
        self.tiles.get(tile).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn has_tile(&self, tile: &TileKey) -> bool {
        self.tiles.contains_key(tile)
    }

    pub fn tile_count(&self) -> usize {
        self.tiles.len()
    }

    pub fn unregister_tile(&mut self, tile: &TileKey) {
        if self.tiles.remove(tile).is_some() {
            self.hooks.on_unregister_tile(tile);
        }
    }

    /// Drop every held tile and return to `Initialized`, from any phase.
    pub fn clear(&mut self) {
        self.tiles.clear();
        self.initialize();
        self.phase = VisualizerPhase::Initialized;
        self.emit(ChangeKind::Cleared);
    }

    fn emit(&mut self, kind: ChangeKind) {
        console_log!("Visualizer '{}': {:?}", self.state.key, kind);
        let event = ChangeEvent {
            kind,
            state: self.state.clone(),
        };
        self.notifier.notify(&event);
    }

    fn invalid_state(&self, operation: &str) -> PipelineError {
        PipelineError::InvalidState {
            key: self.state.key.clone(),
            state: self.phase.to_string(),
            operation: operation.to_string(),
        }
    }
}

impl fmt::Debug for LayerVisualizer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LayerVisualizer")
            .field("key", &self.state.key)
            .field("phase", &self.phase)
            .field("active", &self.state.active)
            .field("tiles", &self.tiles.len())
            .finish()
    }
}
