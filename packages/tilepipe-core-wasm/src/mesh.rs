use earcutr::earcut;
use serde::{Deserialize, Serialize};

use crate::error::PipelineError;
use crate::filters::numeric_property;
use crate::tile::{Feature, GeometryType, LngLat, TileKey};

// Building extrusion defaults
const MIN_HEIGHT: f64 = 0.5;
const MAX_HEIGHT: f64 = 500.0;
const TILE_SIZE: f64 = 200.0;
const EPSILON: f64 = 1e-12;

/// Flat buffers ready for upload: xyz positions, xyz normals, rgb colors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshData {
    pub vertices: Vec<f32>,
    pub normals: Vec<f32>,
    pub colors: Vec<f32>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn has_data(&self) -> bool {
        !self.indices.is_empty()
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len() / 3
    }

    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    fn push_vertex(&mut self, position: [f64; 3], normal: [f64; 3], color: [f32; 3]) -> u32 {
        let index = self.vertex_count() as u32;
        self.vertices
            .extend(position.iter().map(|v| *v as f32));
        self.normals.extend(normal.iter().map(|v| *v as f32));
        self.colors.extend_from_slice(&color);
        index
    }

    fn push_quad(&mut self, corners: [[f64; 3]; 4], normal: [f64; 3], color: [f32; 3]) {
        let a = self.push_vertex(corners[0], normal, color);
        let b = self.push_vertex(corners[1], normal, color);
        let c = self.push_vertex(corners[2], normal, color);
        let d = self.push_vertex(corners[3], normal, color);
        self.indices.extend_from_slice(&[a, b, c, a, c, d]);
    }

    /// Append another mesh, rebasing its indices.
    pub fn append(&mut self, other: &MeshData) {
        let offset = self.vertex_count() as u32;
        self.vertices.extend_from_slice(&other.vertices);
        self.normals.extend_from_slice(&other.normals);
        self.colors.extend_from_slice(&other.colors);
        self.indices.extend(other.indices.iter().map(|i| i + offset));
    }
}

/// Mesh output for a single feature that survived filtering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureMesh {
    pub feature_id: Option<u64>,
    pub geometry_type: GeometryType,
    pub mesh: MeshData,
}

fn default_true() -> bool {
    true
}
fn default_height_property() -> String {
    "height".to_string()
}
fn default_min_height_property() -> String {
    "min_height".to_string()
}
fn default_height() -> f64 {
    3.0
}
fn default_min_height() -> f64 {
    MIN_HEIGHT
}
fn default_max_height() -> f64 {
    MAX_HEIGHT
}
fn default_scale() -> f64 {
    1.0
}
fn default_line_width() -> f64 {
    1.0
}
fn default_tile_size() -> f64 {
    TILE_SIZE
}
fn default_color() -> [f32; 3] {
    [0.7, 0.7, 0.7]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtrusionOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_height_property")]
    pub height_property: String,
    #[serde(default = "default_min_height_property")]
    pub min_height_property: String,
    #[serde(default = "default_height")]
    pub default_height: f64,
    #[serde(default = "default_min_height")]
    pub min_height: f64,
    #[serde(default = "default_max_height")]
    pub max_height: f64,
    #[serde(default = "default_scale")]
    pub height_scale: f64,
}

impl ExtrusionOptions {
    /// Reject height bounds no feature could satisfy.
    pub fn validate(&self) -> Result<(), PipelineError> {
        let bounds = [
            ("defaultHeight", self.default_height),
            ("minHeight", self.min_height),
            ("maxHeight", self.max_height),
            ("heightScale", self.height_scale),
        ];
        if let Some((name, value)) = bounds.iter().find(|(_, v)| !v.is_finite()) {
            return Err(PipelineError::Config(format!(
                "extrusion {} must be finite, got {}",
                name, value
            )));
        }
        if self.max_height < 0.0 {
            return Err(PipelineError::Config(format!(
                "extrusion maxHeight must not be negative, got {}",
                self.max_height
            )));
        }
        if self.min_height > self.max_height {
            return Err(PipelineError::Config(format!(
                "extrusion minHeight {} exceeds maxHeight {}",
                self.min_height, self.max_height
            )));
        }
        Ok(())
    }
}

impl Default for ExtrusionOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            height_property: default_height_property(),
            min_height_property: default_min_height_property(),
            default_height: default_height(),
            min_height: MIN_HEIGHT,
            max_height: MAX_HEIGHT,
            height_scale: 1.0,
        }
    }
}

/// How features of a sub-layer turn into geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshStyle {
    #[serde(default)]
    pub extrusion: ExtrusionOptions,
    #[serde(default = "default_line_width")]
    pub line_width: f64,
    #[serde(default = "default_line_width")]
    pub point_size: f64,
    #[serde(default)]
    pub z_offset: f64,
    /// Edge length of one tile in mesh units
    #[serde(default = "default_tile_size")]
    pub tile_size: f64,
    #[serde(default = "default_color")]
    pub color: [f32; 3],
}

impl Default for MeshStyle {
    fn default() -> Self {
        Self {
            extrusion: ExtrusionOptions::default(),
            line_width: default_line_width(),
            point_size: default_line_width(),
            z_offset: 0.0,
            tile_size: TILE_SIZE,
            color: default_color(),
        }
    }
}

impl MeshStyle {
    pub fn validate(&self) -> Result<(), PipelineError> {
        self.extrusion.validate()?;
        let sizes = [
            ("lineWidth", self.line_width),
            ("pointSize", self.point_size),
            ("zOffset", self.z_offset),
            ("tileSize", self.tile_size),
        ];
        match sizes.iter().find(|(_, v)| !v.is_finite()) {
            Some((name, value)) => Err(PipelineError::Config(format!(
                "{} must be finite, got {}",
                name, value
            ))),
            None => Ok(()),
        }
    }
}

/// (base, top) of an extruded feature, in mesh units above `z_offset`.
pub fn feature_heights(feature: &Feature, options: &ExtrusionOptions) -> (f64, f64) {
    if !options.enabled {
        return (0.0, 0.0);
    }
    // max/min rather than clamp: never panics on inverted or NaN bounds
    let height = numeric_property(feature, &options.height_property)
        .or_else(|_| numeric_property(feature, "render_height"))
        .unwrap_or(options.default_height)
        .max(options.min_height)
        .min(options.max_height);
    let base = numeric_property(feature, &options.min_height_property)
        .unwrap_or(0.0)
        .max(0.0)
        .min(height);
    (base * options.height_scale, height * options.height_scale)
}

// Tile-local, y-up mesh coordinates
fn to_mesh_xy(point: &[f64; 2], tile: &TileKey, tile_size: f64) -> [f64; 2] {
    let local = tile.to_tile_local(LngLat::new(point[0], point[1]));
    [local[0] * tile_size, (1.0 - local[1]) * tile_size]
}

fn open_ring(ring: &[[f64; 2]]) -> &[[f64; 2]] {
    match (ring.first(), ring.last()) {
        (Some(first), Some(last)) if ring.len() > 1 && first == last => &ring[..ring.len() - 1],
        _ => ring,
    }
}

fn signed_area(ring: &[[f64; 2]]) -> f64 {
    let n = ring.len();
    (0..n)
        .map(|i| {
            let j = (i + 1) % n;
            ring[i][0] * ring[j][1] - ring[j][0] * ring[i][1]
        })
        .sum::<f64>()
        / 2.0
}

/// Split rings into polygons: rings sharing the first ring's winding start a
/// new polygon, rings wound the other way are holes of the current one.
pub fn group_rings(rings: &[Vec<[f64; 2]>]) -> Vec<Vec<Vec<[f64; 2]>>> {
    let mut polygons: Vec<Vec<Vec<[f64; 2]>>> = Vec::new();
    let mut exterior_sign = 0.0;

    for ring in rings {
        let ring = open_ring(ring);
        if ring.len() < 3 {
            continue;
        }
        let area = signed_area(ring);
        if area.abs() < EPSILON {
            continue;
        }
        if exterior_sign == 0.0 {
            exterior_sign = area.signum();
        }
        if area.signum() == exterior_sign || polygons.is_empty() {
            polygons.push(vec![ring.to_vec()]);
        } else if let Some(current) = polygons.last_mut() {
            current.push(ring.to_vec());
        }
    }
    polygons
}

/// Roof (triangulated with holes) plus walls between `base` and `top`.
pub fn extrude_polygon(
    rings: &[Vec<[f64; 2]>],
    base: f64,
    top: f64,
    color: [f32; 3],
) -> Result<MeshData, PipelineError> {
    let mut mesh = MeshData::default();
    let Some(exterior) = rings.first() else {
        return Ok(mesh);
    };

    let mut data: Vec<f64> = Vec::new();
    let mut hole_indices: Vec<usize> = Vec::new();
    for (i, ring) in rings.iter().enumerate() {
        if i > 0 {
            hole_indices.push(data.len() / 2);
        }
        for point in ring {
            data.extend_from_slice(point);
        }
    }

    let triangles = earcut(&data, &hole_indices, 2)
        .map_err(|e| PipelineError::Triangulation(format!("{:?}", e)))?;

    let roof_start = mesh.vertex_count() as u32;
    for point in rings.iter().flatten() {
        mesh.push_vertex([point[0], point[1], top], [0.0, 0.0, 1.0], color);
    }
    mesh.indices
        .extend(triangles.iter().map(|i| roof_start + *i as u32));

    if top - base > EPSILON {
        let clockwise = signed_area(exterior) < 0.0;
        for ring in rings {
            let n = ring.len();
            for i in 0..n {
                let a = ring[i];
                let b = ring[(i + 1) % n];
                let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
                let length = (dx * dx + dy * dy).sqrt();
                if length < EPSILON {
                    continue;
                }
                // outward for counter-clockwise exteriors
                let mut normal = [dy / length, -dx / length, 0.0];
                if clockwise {
                    normal = [-normal[0], -normal[1], 0.0];
                }
                mesh.push_quad(
                    [
                        [a[0], a[1], base],
                        [b[0], b[1], base],
                        [b[0], b[1], top],
                        [a[0], a[1], top],
                    ],
                    normal,
                    color,
                );
            }
        }
    }

    Ok(mesh)
}

/// Flat ribbon `width` wide along a polyline.
pub fn line_ribbon(line: &[[f64; 2]], width: f64, z: f64, color: [f32; 3]) -> MeshData {
    let mut mesh = MeshData::default();
    let half = width / 2.0;

    for segment in line.windows(2) {
        let (a, b) = (segment[0], segment[1]);
        let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
        let length = (dx * dx + dy * dy).sqrt();
        if length < EPSILON {
            continue;
        }
        let (ox, oy) = (-dy / length * half, dx / length * half);
        mesh.push_quad(
            [
                [a[0] - ox, a[1] - oy, z],
                [b[0] - ox, b[1] - oy, z],
                [b[0] + ox, b[1] + oy, z],
                [a[0] + ox, a[1] + oy, z],
            ],
            [0.0, 0.0, 1.0],
            color,
        );
    }
    mesh
}

/// Flat square of edge `size` centred on a point.
pub fn point_quad(point: [f64; 2], size: f64, z: f64, color: [f32; 3]) -> MeshData {
    let mut mesh = MeshData::default();
    let half = size / 2.0;
    let [x, y] = point;
    mesh.push_quad(
        [
            [x - half, y - half, z],
            [x + half, y - half, z],
            [x + half, y + half, z],
            [x - half, y + half, z],
        ],
        [0.0, 0.0, 1.0],
        color,
    );
    mesh
}

/// Default feature-to-mesh conversion. Returns `None` when the feature
/// produced no triangles.
pub fn build_feature_mesh(
    feature: &Feature,
    style: &MeshStyle,
    tile: &TileKey,
) -> Result<Option<FeatureMesh>, PipelineError> {
    let project = |part: &Vec<[f64; 2]>| -> Vec<[f64; 2]> {
        part.iter()
            .map(|p| to_mesh_xy(p, tile, style.tile_size))
            .collect()
    };

    let mut mesh = MeshData::default();
    match feature.geometry_type {
        GeometryType::Polygon => {
            let (base, top) = feature_heights(feature, &style.extrusion);
            let rings: Vec<Vec<[f64; 2]>> = feature.geometry.iter().map(project).collect();
            for polygon in group_rings(&rings) {
                let part = extrude_polygon(
                    &polygon,
                    style.z_offset + base,
                    style.z_offset + top,
                    style.color,
                )?;
                mesh.append(&part);
            }
        }
        GeometryType::LineString => {
            for line in &feature.geometry {
                mesh.append(&line_ribbon(
                    &project(line),
                    style.line_width,
                    style.z_offset,
                    style.color,
                ));
            }
        }
        GeometryType::Point => {
            for point in feature.points() {
                mesh.append(&point_quad(
                    to_mesh_xy(point, tile, style.tile_size),
                    style.point_size,
                    style.z_offset,
                    style.color,
                ));
            }
        }
    }

    if !mesh.has_data() {
        return Ok(None);
    }
    Ok(Some(FeatureMesh {
        feature_id: feature.id,
        geometry_type: feature.geometry_type,
        mesh,
    }))
}
