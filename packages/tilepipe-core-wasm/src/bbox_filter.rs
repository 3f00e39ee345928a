// Geometry/bounding-box intersection tests used by the bbox feature filter.

use crate::tile::{Feature, GeoBbox, GeometryType};

// Check if a point is inside a bounding box (edges included)
pub fn point_in_bbox(point: &[f64; 2], bbox: &GeoBbox) -> bool {
    point[0] >= bbox.min_lng
        && point[0] <= bbox.max_lng
        && point[1] >= bbox.min_lat
        && point[1] <= bbox.max_lat
}

fn bbox_edges(bbox: &GeoBbox) -> [([f64; 2], [f64; 2]); 4] {
    let (min_lng, min_lat, max_lng, max_lat) = (bbox.min_lng, bbox.min_lat, bbox.max_lng, bbox.max_lat);
    [
        ([min_lng, min_lat], [max_lng, min_lat]), // bottom
        ([max_lng, min_lat], [max_lng, max_lat]), // right
        ([max_lng, max_lat], [min_lng, max_lat]), // top
        ([min_lng, max_lat], [min_lng, min_lat]), // left
    ]
}

fn bbox_corners(bbox: &GeoBbox) -> [[f64; 2]; 4] {
    [
        [bbox.min_lng, bbox.min_lat],
        [bbox.max_lng, bbox.min_lat],
        [bbox.max_lng, bbox.max_lat],
        [bbox.min_lng, bbox.max_lat],
    ]
}

// Bounding box of a set of points; None when empty
fn points_extent(points: &[[f64; 2]]) -> Option<GeoBbox> {
    let first = points.first()?;
    let mut extent = GeoBbox::new(first[0], first[1], first[0], first[1]);
    for point in &points[1..] {
        extent.min_lng = extent.min_lng.min(point[0]);
        extent.min_lat = extent.min_lat.min(point[1]);
        extent.max_lng = extent.max_lng.max(point[0]);
        extent.max_lat = extent.max_lat.max(point[1]);
    }
    Some(extent)
}

fn extents_overlap(a: &GeoBbox, b: &GeoBbox) -> bool {
    !(a.max_lng < b.min_lng || a.min_lng > b.max_lng || a.max_lat < b.min_lat || a.min_lat > b.max_lat)
}

/// Does a polyline touch the bbox?
pub fn line_intersects_bbox(line: &[[f64; 2]], bbox: &GeoBbox) -> bool {
    match points_extent(line) {
        Some(extent) if extents_overlap(&extent, bbox) => {}
        _ => return false,
    }
    if line.iter().any(|point| point_in_bbox(point, bbox)) {
        return true;
    }
    let edges = bbox_edges(bbox);
    line.windows(2).any(|segment| {
        edges
            .iter()
            .any(|(a, b)| line_segments_intersect(&segment[0], &segment[1], a, b))
    })
}

// Check if a polygon ring intersects with a bounding box
pub fn polygon_intersects_bbox(polygon: &[[f64; 2]], bbox: &GeoBbox) -> bool {
    // 1. Quick rejection on the ring's own extent
    match points_extent(polygon) {
        Some(extent) if extents_overlap(&extent, bbox) => {}
        _ => return false,
    }

    // 2. Any vertex inside the bbox
    if polygon.iter().any(|point| point_in_bbox(point, bbox)) {
        return true;
    }

    // 3. Any ring edge crossing a bbox edge
    let edges = bbox_edges(bbox);
    let n = polygon.len();
    for i in 0..n {
        let p1 = &polygon[i];
        let p2 = &polygon[(i + 1) % n];
        if edges
            .iter()
            .any(|(a, b)| line_segments_intersect(p1, p2, a, b))
        {
            return true;
        }
    }

    // 4. The bbox sits entirely inside the ring
    bbox_corners(bbox)
        .iter()
        .any(|corner| is_point_in_polygon(corner, polygon))
}

/// Feature-level test, dispatching on geometry type.
pub fn feature_intersects_bbox(feature: &Feature, bbox: &GeoBbox) -> bool {
    match feature.geometry_type {
        GeometryType::Point => feature.points().any(|p| point_in_bbox(p, bbox)),
        GeometryType::LineString => feature
            .geometry
            .iter()
            .any(|line| line_intersects_bbox(line, bbox)),
        GeometryType::Polygon => feature
            .geometry
            .iter()
            .any(|ring| polygon_intersects_bbox(ring, bbox)),
    }
}

// Check if two line segments intersect
fn line_segments_intersect(p1: &[f64; 2], p2: &[f64; 2], p3: &[f64; 2], p4: &[f64; 2]) -> bool {
    let d1 = direction(p3, p4, p1);
    let d2 = direction(p3, p4, p2);
    let d3 = direction(p1, p2, p3);
    let d4 = direction(p1, p2, p4);

    if ((d1 > 0.0 && d2 < 0.0) || (d1 < 0.0 && d2 > 0.0))
        && ((d3 > 0.0 && d4 < 0.0) || (d3 < 0.0 && d4 > 0.0))
    {
        return true;
    }

    // Colinear cases
    (d1 == 0.0 && is_point_on_segment(p3, p4, p1))
        || (d2 == 0.0 && is_point_on_segment(p3, p4, p2))
        || (d3 == 0.0 && is_point_on_segment(p1, p2, p3))
        || (d4 == 0.0 && is_point_on_segment(p1, p2, p4))
}

fn direction(p1: &[f64; 2], p2: &[f64; 2], p3: &[f64; 2]) -> f64 {
    (p3[0] - p1[0]) * (p2[1] - p1[1]) - (p2[0] - p1[0]) * (p3[1] - p1[1])
}

fn is_point_on_segment(p1: &[f64; 2], p2: &[f64; 2], p: &[f64; 2]) -> bool {
    p[0] >= p1[0].min(p2[0])
        && p[0] <= p1[0].max(p2[0])
        && p[1] >= p1[1].min(p2[1])
        && p[1] <= p1[1].max(p2[1])
}

// Ray casting
fn is_point_in_polygon(point: &[f64; 2], polygon: &[[f64; 2]]) -> bool {
    let mut inside = false;
    let (x, y) = (point[0], point[1]);
    let n = polygon.len();

    for i in 0..n {
        let j = (i + 1) % n;
        let (xi, yi) = (polygon[i][0], polygon[i][1]);
        let (xj, yj) = (polygon[j][0], polygon[j][1]);

        if ((yi > y) != (yj > y)) && (x < (xj - xi) * (y - yi) / (yj - yi) + xi) {
            inside = !inside;
        }
    }

    inside
}
