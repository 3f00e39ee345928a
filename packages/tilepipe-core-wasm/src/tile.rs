use geozero::mvt::tile;
use geozero::mvt::{Message, Tile};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::f64::consts::PI;
use std::fmt;

use crate::console_log;
use crate::error::PipelineError;

/// Extent assumed when a layer does not declare one
pub const DEFAULT_EXTENT: u32 = 4096;

/// Deepest zoom whose tile grid still fits `u32` indices
pub const MAX_ZOOM: u32 = 30;

// MVT geometry command ids
const CMD_MOVE_TO: u32 = 1;
const CMD_LINE_TO: u32 = 2;
const CMD_CLOSE_PATH: u32 = 7;

/// Tile coordinate key: zoom, column, row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TileKey {
    pub z: u32,
    pub x: u32,
    pub y: u32,
}

/// A WGS84 position.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LngLat {
    pub lng: f64,
    pub lat: f64,
}

impl LngLat {
    pub fn new(lng: f64, lat: f64) -> Self {
        Self { lng, lat }
    }
}

/// [minLng, minLat, maxLng, maxLat]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBbox {
    pub min_lng: f64,
    pub min_lat: f64,
    pub max_lng: f64,
    pub max_lat: f64,
}

impl GeoBbox {
    pub fn new(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> Self {
        Self {
            min_lng,
            min_lat,
            max_lng,
            max_lat,
        }
    }

    pub fn from_slice(bbox: &[f64]) -> Result<Self, PipelineError> {
        match bbox {
            [min_lng, min_lat, max_lng, max_lat] => {
                Ok(Self::new(*min_lng, *min_lat, *max_lng, *max_lat))
            }
            _ => Err(PipelineError::Config(
                "bbox must contain [minLng, minLat, maxLng, maxLat]".to_string(),
            )),
        }
    }
}

impl fmt::Display for TileKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.z, self.x, self.y)
    }
}

// Number of tiles along one axis at `zoom`
pub fn check_zoom(zoom: u32) -> Result<(), PipelineError> {
    if zoom > MAX_ZOOM {
        return Err(PipelineError::Config(format!(
            "zoom {} exceeds maximum {}",
            zoom, MAX_ZOOM
        )));
    }
    Ok(())
}

fn tiles_per_axis(zoom: u32) -> f64 {
    2.0_f64.powi(zoom as i32)
}

// Convert longitude to tile X coordinate
pub fn lng_to_tile_x(lng: f64, zoom: u32) -> u32 {
    let n = tiles_per_axis(zoom);
    let x = ((lng + 180.0) / 360.0 * n).floor();
    x.clamp(0.0, n - 1.0) as u32
}

// Convert latitude to tile Y coordinate
pub fn lat_to_tile_y(lat: f64, zoom: u32) -> u32 {
    let lat_rad = lat.to_radians();
    let n = tiles_per_axis(zoom);
    let y = ((1.0 - ((lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI)) / 2.0 * n).floor();
    y.clamp(0.0, n - 1.0) as u32
}

/// Convert a position inside a tile (in extent units) to longitude/latitude.
pub fn tile_to_lng_lat(x: f64, y: f64, extent: u32, tile: &TileKey) -> LngLat {
    let n = tiles_per_axis(tile.z);
    let normalized_x = (tile.x as f64 + x / extent as f64) / n;
    let normalized_y = (tile.y as f64 + y / extent as f64) / n;

    let lng = normalized_x * 360.0 - 180.0;
    let lat = (PI * (1.0 - 2.0 * normalized_y)).sinh().atan().to_degrees();
    LngLat { lng, lat }
}

impl TileKey {
    pub fn new(z: u32, x: u32, y: u32) -> Self {
        Self { z, x, y }
    }

    /// The tile at `zoom` containing `position`.
    pub fn containing(position: LngLat, zoom: u32) -> Self {
        Self {
            z: zoom,
            x: lng_to_tile_x(position.lng, zoom),
            y: lat_to_tile_y(position.lat, zoom),
        }
    }

    /// This tile and every tile within `radius` rows/columns of it, clamped
    /// to the zoom level's grid. Ordered row by row, this tile included.
    pub fn neighborhood(&self, radius: u32) -> Vec<TileKey> {
        let max = 1u64
            .checked_shl(self.z)
            .map_or(u32::MAX, |n| (n - 1).min(u32::MAX as u64) as u32);
        let min_x = self.x.saturating_sub(radius);
        let max_x = self.x.saturating_add(radius).min(max);
        let min_y = self.y.saturating_sub(radius);
        let max_y = self.y.saturating_add(radius).min(max);

        let mut tiles = Vec::new();
        for y in min_y..=max_y {
            for x in min_x..=max_x {
                tiles.push(TileKey { z: self.z, x, y });
            }
        }
        tiles
    }

    /// Project a WGS84 position to this tile's local web-mercator space,
    /// where the tile spans [0, 1] on both axes and y grows southward.
    pub fn to_tile_local(&self, position: LngLat) -> [f64; 2] {
        let n = tiles_per_axis(self.z);
        let lat_rad = position.lat.to_radians();
        let world_x = (position.lng + 180.0) / 360.0 * n;
        let world_y = (1.0 - (lat_rad.tan() + 1.0 / lat_rad.cos()).ln() / PI) / 2.0 * n;
        [world_x - self.x as f64, world_y - self.y as f64]
    }

    pub fn bounds(&self) -> GeoBbox {
        let north_west = tile_to_lng_lat(0.0, 0.0, 1, self);
        let south_east = tile_to_lng_lat(1.0, 1.0, 1, self);
        GeoBbox::new(north_west.lng, south_east.lat, south_east.lng, north_west.lat)
    }
}

// Calculate the tiles needed to cover a bounding box
pub fn tiles_for_bbox(bbox: &GeoBbox, zoom: u32) -> Vec<TileKey> {
    let min_x = lng_to_tile_x(bbox.min_lng, zoom);
    let min_y = lat_to_tile_y(bbox.max_lat, zoom); // y is inverted in tile coordinates
    let max_x = lng_to_tile_x(bbox.max_lng, zoom);
    let max_y = lat_to_tile_y(bbox.min_lat, zoom);

    let mut tiles = Vec::new();
    for y in min_y..=max_y {
        for x in min_x..=max_x {
            tiles.push(TileKey { z: zoom, x, y });
        }
    }
    tiles
}

// Calculate the number of tiles that would be needed
pub fn tile_count_for_bbox(bbox: &GeoBbox, zoom: u32) -> usize {
    let min_x = lng_to_tile_x(bbox.min_lng, zoom);
    let min_y = lat_to_tile_y(bbox.max_lat, zoom);
    let max_x = lng_to_tile_x(bbox.max_lng, zoom);
    let max_y = lat_to_tile_y(bbox.min_lat, zoom);

    // inverted boxes cover nothing, same as tiles_for_bbox
    let columns = max_x.saturating_add(1).saturating_sub(min_x) as usize;
    let rows = max_y.saturating_add(1).saturating_sub(min_y) as usize;
    columns * rows
}

// Feature geometry types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryType {
    Point,
    LineString,
    Polygon,
}

impl GeometryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            GeometryType::Point => "Point",
            GeometryType::LineString => "LineString",
            GeometryType::Polygon => "Polygon",
        }
    }

    fn from_mvt(raw: Option<i32>) -> Option<Self> {
        match raw {
            Some(1) => Some(GeometryType::Point),
            Some(2) => Some(GeometryType::LineString),
            Some(3) => Some(GeometryType::Polygon),
            _ => None,
        }
    }
}

/// One decoded feature. Geometry parts are rings (polygons), lines, or a
/// single list of points, all in longitude/latitude.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: Option<u64>,
    pub geometry_type: GeometryType,
    pub geometry: Vec<Vec<[f64; 2]>>,
    pub properties: HashMap<String, serde_json::Value>,
}

impl Feature {
    pub fn new(geometry_type: GeometryType, geometry: Vec<Vec<[f64; 2]>>) -> Self {
        Self {
            id: None,
            geometry_type,
            geometry,
            properties: HashMap::new(),
        }
    }

    pub fn with_id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_property(mut self, key: &str, value: serde_json::Value) -> Self {
        self.properties.insert(key.to_string(), value);
        self
    }

    pub fn property(&self, key: &str) -> Option<&serde_json::Value> {
        self.properties.get(key)
    }

    pub fn points(&self) -> impl Iterator<Item = &[f64; 2]> {
        self.geometry.iter().flatten()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileLayer {
    pub name: String,
    pub extent: u32,
    pub features: Vec<Feature>,
}

impl TileLayer {
    pub fn new(name: &str, features: Vec<Feature>) -> Self {
        Self {
            name: name.to_string(),
            extent: DEFAULT_EXTENT,
            features,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecodedTile {
    pub key: TileKey,
    pub layers: HashMap<String, TileLayer>,
}

impl DecodedTile {
    pub fn layer(&self, name: &str) -> Option<&TileLayer> {
        self.layers.get(name)
    }

    pub fn feature_count(&self) -> usize {
        self.layers.values().map(|l| l.features.len()).sum()
    }
}

/// Decode an (already decompressed) Mapbox Vector Tile.
pub fn decode_tile(data: &[u8], key: &TileKey) -> Result<DecodedTile, PipelineError> {
    let mvt = Tile::decode(data).map_err(|e| PipelineError::TileDecode(e.to_string()))?;

    let mut layers = HashMap::new();
    for layer in mvt.layers {
        let extent = layer.extent.unwrap_or(DEFAULT_EXTENT);
        let mut features = Vec::with_capacity(layer.features.len());

        for feature in &layer.features {
            let geometry_type = match GeometryType::from_mvt(feature.r#type) {
                Some(t) => t,
                None => continue, // Skip unknown geometries
            };

            let geometry = decode_geometry(&feature.geometry, geometry_type, extent, key);
            if geometry.is_empty() {
                continue;
            }

            features.push(Feature {
                id: feature.id,
                geometry_type,
                geometry,
                properties: decode_properties(&feature.tags, &layer.keys, &layer.values),
            });
        }

        layers.insert(
            layer.name.clone(),
            TileLayer {
                name: layer.name,
                extent,
                features,
            },
        );
    }

    console_log!("Decoded tile {} with {} layers", key, layers.len());
    Ok(DecodedTile { key: *key, layers })
}

fn decode_properties(
    tags: &[u32],
    keys: &[String],
    values: &[tile::Value],
) -> HashMap<String, serde_json::Value> {
    let mut properties = HashMap::new();
    for pair in tags.chunks_exact(2) {
        if let (Some(key), Some(value)) = (keys.get(pair[0] as usize), values.get(pair[1] as usize))
        {
            properties.insert(key.clone(), value_to_json(value));
        }
    }
    properties
}

fn value_to_json(value: &tile::Value) -> serde_json::Value {
    use serde_json::{Number, Value};

    if let Some(s) = &value.string_value {
        Value::String(s.clone())
    } else if let Some(f) = value.float_value {
        Number::from_f64(f as f64).map_or(Value::Null, Value::Number)
    } else if let Some(d) = value.double_value {
        Number::from_f64(d).map_or(Value::Null, Value::Number)
    } else if let Some(i) = value.int_value {
        Value::Number(i.into())
    } else if let Some(u) = value.uint_value {
        Value::Number(u.into())
    } else if let Some(s) = value.sint_value {
        Value::Number(s.into())
    } else if let Some(b) = value.bool_value {
        Value::Bool(b)
    } else {
        Value::Null
    }
}

fn zigzag(param: u32) -> i64 {
    ((param >> 1) as i64) ^ -((param & 1) as i64)
}

// Decode MVT geometry commands to coordinate parts
fn decode_geometry(
    commands: &[u32],
    geometry_type: GeometryType,
    extent: u32,
    tile: &TileKey,
) -> Vec<Vec<[f64; 2]>> {
    let mut parts: Vec<Vec<[f64; 2]>> = Vec::new();
    let mut current: Vec<[f64; 2]> = Vec::new();
    let mut cursor_x: i64 = 0;
    let mut cursor_y: i64 = 0;
    let mut i = 0;

    while i < commands.len() {
        let cmd_id = commands[i] & 0x7;
        let cmd_count = (commands[i] >> 3) as usize;
        i += 1;

        match cmd_id {
            CMD_MOVE_TO | CMD_LINE_TO => {
                // Points collect into one part; lines and rings restart on MoveTo
                if cmd_id == CMD_MOVE_TO
                    && geometry_type != GeometryType::Point
                    && !current.is_empty()
                {
                    parts.push(std::mem::take(&mut current));
                }
                for _ in 0..cmd_count {
                    if i + 1 >= commands.len() {
                        i = commands.len();
                        break;
                    }
                    cursor_x += zigzag(commands[i]);
                    cursor_y += zigzag(commands[i + 1]);
                    i += 2;

                    let position = tile_to_lng_lat(cursor_x as f64, cursor_y as f64, extent, tile);
                    current.push([position.lng, position.lat]);
                }
            }
            CMD_CLOSE_PATH => {
                if let Some(first) = current.first().copied() {
                    current.push(first);
                }
            }
            _ => {
                // Unknown command, skip its parameters
                i += 2 * cmd_count;
            }
        }
    }

    if !current.is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn command(id: u32, count: u32) -> u32 {
        (id & 0x7) | (count << 3)
    }

    pub(crate) fn param(value: i32) -> u32 {
        ((value << 1) ^ (value >> 31)) as u32
    }

    /// Square building in tile space plus a named road, encoded as MVT bytes.
    pub(crate) fn sample_tile_bytes() -> Vec<u8> {
        let square = vec![
            command(CMD_MOVE_TO, 1),
            param(1024),
            param(1024),
            command(CMD_LINE_TO, 3),
            param(1024),
            param(0),
            param(0),
            param(1024),
            param(-1024),
            param(0),
            command(CMD_CLOSE_PATH, 1),
        ];
        let road = vec![
            command(CMD_MOVE_TO, 1),
            param(0),
            param(2048),
            command(CMD_LINE_TO, 1),
            param(4096),
            param(0),
        ];

        let buildings = tile::Layer {
            version: 2,
            name: "building".to_string(),
            features: vec![tile::Feature {
                id: Some(7),
                tags: vec![0, 0, 1, 1],
                r#type: Some(3),
                geometry: square,
                ..Default::default()
            }],
            keys: vec!["height".to_string(), "class".to_string()],
            values: vec![
                tile::Value {
                    double_value: Some(12.5),
                    ..Default::default()
                },
                tile::Value {
                    string_value: Some("house".to_string()),
                    ..Default::default()
                },
            ],
            extent: Some(4096),
            ..Default::default()
        };
        let roads = tile::Layer {
            version: 2,
            name: "transportation".to_string(),
            features: vec![tile::Feature {
                id: Some(8),
                tags: vec![0, 0],
                r#type: Some(2),
                geometry: road,
                ..Default::default()
            }],
            keys: vec!["class".to_string()],
            values: vec![tile::Value {
                string_value: Some("primary".to_string()),
                ..Default::default()
            }],
            extent: Some(4096),
            ..Default::default()
        };

        Tile {
            layers: vec![buildings, roads],
        }
        .encode_to_vec()
    }

    #[test]
    fn tile_key_displays_as_path() {
        assert_eq!(TileKey::new(14, 8800, 5373).to_string(), "14/8800/5373");
    }

    #[test]
    fn containing_tile_round_trips_through_bounds() {
        let position = LngLat::new(13.405, 52.52);
        let key = TileKey::containing(position, 12);
        let bounds = key.bounds();
        assert!(position.lng >= bounds.min_lng && position.lng <= bounds.max_lng);
        assert!(position.lat >= bounds.min_lat && position.lat <= bounds.max_lat);

        let local = key.to_tile_local(position);
        assert!((0.0..=1.0).contains(&local[0]));
        assert!((0.0..=1.0).contains(&local[1]));
    }

    #[test]
    fn zoom_zero_covers_the_world() {
        let world = TileKey::new(0, 0, 0);
        let origin = tile_to_lng_lat(0.0, 0.0, 4096, &world);
        assert!((origin.lng + 180.0).abs() < 1e-9);
        assert!((origin.lat - 85.0511).abs() < 1e-3);
        assert_eq!(TileKey::containing(LngLat::new(179.9, -80.0), 0), world);
    }

    #[test]
    fn neighborhood_clamps_at_grid_edges() {
        let corner = TileKey::new(2, 0, 0);
        let tiles = corner.neighborhood(1);
        assert_eq!(tiles.len(), 4);
        assert!(tiles.contains(&corner));
        assert!(tiles.contains(&TileKey::new(2, 1, 1)));

        let inner = TileKey::new(3, 4, 4).neighborhood(1);
        assert_eq!(inner.len(), 9);
    }

    #[test]
    fn bbox_tiles_match_count() {
        let bbox = GeoBbox::new(13.3, 52.4, 13.5, 52.6);
        let tiles = tiles_for_bbox(&bbox, 12);
        assert_eq!(tiles.len(), tile_count_for_bbox(&bbox, 12));
        assert!(tiles.iter().all(|t| t.z == 12));
        // rows go north to south
        assert!(tiles.first().unwrap().y <= tiles.last().unwrap().y);
    }

    #[test]
    fn neighborhood_survives_out_of_range_zoom() {
        let tiles = TileKey::new(64, 0, 0).neighborhood(1);
        assert_eq!(tiles.len(), 4);

        let edge = TileKey::new(40, u32::MAX, u32::MAX).neighborhood(1);
        assert_eq!(edge.len(), 4);
    }

    #[test]
    fn zoom_above_max_is_rejected() {
        assert!(check_zoom(MAX_ZOOM).is_ok());
        assert!(matches!(check_zoom(MAX_ZOOM + 1), Err(PipelineError::Config(_))));
        assert!(check_zoom(64).is_err());
    }

    #[test]
    fn inverted_bbox_covers_no_tiles() {
        let inverted = GeoBbox::new(13.5, 52.6, 13.3, 52.4);
        assert_eq!(tile_count_for_bbox(&inverted, 12), 0);
        assert!(tiles_for_bbox(&inverted, 12).is_empty());

        let west_of_east = GeoBbox::new(10.0, 52.4, -10.0, 52.6);
        assert_eq!(tile_count_for_bbox(&west_of_east, 5), 0);
        assert!(tiles_for_bbox(&west_of_east, 5).is_empty());
    }

    #[test]
    fn bbox_from_slice_requires_four_values() {
        assert!(GeoBbox::from_slice(&[1.0, 2.0, 3.0]).is_err());
        assert_eq!(
            GeoBbox::from_slice(&[1.0, 2.0, 3.0, 4.0]).unwrap(),
            GeoBbox::new(1.0, 2.0, 3.0, 4.0)
        );
    }

    #[test]
    fn zigzag_decodes_signed_deltas() {
        assert_eq!(zigzag(param(0)), 0);
        assert_eq!(zigzag(param(-1)), -1);
        assert_eq!(zigzag(param(1024)), 1024);
        assert_eq!(zigzag(param(-1024)), -1024);
    }

    #[test]
    fn decodes_layers_properties_and_geometry() {
        let key = TileKey::new(10, 550, 335);
        let decoded = decode_tile(&sample_tile_bytes(), &key).unwrap();

        assert_eq!(decoded.layers.len(), 2);
        assert_eq!(decoded.feature_count(), 2);

        let building = &decoded.layer("building").unwrap().features[0];
        assert_eq!(building.id, Some(7));
        assert_eq!(building.geometry_type, GeometryType::Polygon);
        assert_eq!(building.property("height"), Some(&serde_json::json!(12.5)));
        assert_eq!(building.property("class"), Some(&serde_json::json!("house")));
        // four corners plus the closing point
        assert_eq!(building.geometry.len(), 1);
        assert_eq!(building.geometry[0].len(), 5);
        assert_eq!(building.geometry[0].first(), building.geometry[0].last());

        let road = &decoded.layer("transportation").unwrap().features[0];
        assert_eq!(road.geometry_type, GeometryType::LineString);
        assert_eq!(road.geometry[0].len(), 2);

        let bounds = key.bounds();
        for point in building.points().chain(road.points()) {
            assert!(point[0] >= bounds.min_lng - 1e-9 && point[0] <= bounds.max_lng + 1e-9);
            assert!(point[1] >= bounds.min_lat - 1e-9 && point[1] <= bounds.max_lat + 1e-9);
        }
    }

    #[test]
    fn garbage_is_a_decode_error() {
        let err = decode_tile(&[0xFF, 0xFF, 0xFF], &TileKey::new(0, 0, 0)).unwrap_err();
        assert!(matches!(err, PipelineError::TileDecode(_)));
    }

    #[test]
    fn multipoint_collects_into_one_part() {
        let commands = vec![
            command(CMD_MOVE_TO, 2),
            param(10),
            param(10),
            param(5),
            param(5),
        ];
        let parts = decode_geometry(&commands, GeometryType::Point, 4096, &TileKey::new(0, 0, 0));
        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].len(), 2);
    }
}
