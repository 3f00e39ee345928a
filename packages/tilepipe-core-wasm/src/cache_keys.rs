// Helpers generating consistent keys across the pipeline.

use crate::filters::FilterConfig;

/// Key for a bounding box request: "minLng_minLat_maxLng_maxLat".
pub fn make_bbox_key(min_lng: f64, min_lat: f64, max_lng: f64, max_lat: f64) -> String {
    format!("{}_{}_{}_{}", min_lng, min_lat, max_lng, max_lat)
}

/// Key of a visualizer: the source layer, suffixed by its serialized
/// filters when it has any ("sourceLayer_filters").
pub fn make_visualizer_key(source_layer: &str, filters: &[FilterConfig]) -> String {
    if filters.is_empty() {
        return source_layer.to_string();
    }
    let filter_str = serde_json::to_string(filters).unwrap_or_default();
    format!("{}_{}", source_layer, filter_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Comparison;

    #[test]
    fn unfiltered_key_is_the_source_layer() {
        assert_eq!(make_visualizer_key("building", &[]), "building");
    }

    #[test]
    fn filters_change_the_key() {
        let filters = vec![FilterConfig::NumericRange {
            property: "height".to_string(),
            comparison: Comparison::Above,
            value: 10.0,
        }];
        let key = make_visualizer_key("building", &filters);
        assert!(key.starts_with("building_"));
        assert!(key.contains("height"));
        assert_ne!(key, make_visualizer_key("water", &filters));
    }

    #[test]
    fn bbox_key_joins_corners() {
        assert_eq!(make_bbox_key(1.0, 2.5, 3.0, 4.0), "1_2.5_3_4");
    }
}
