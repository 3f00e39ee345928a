use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::bbox_filter::feature_intersects_bbox;
use crate::console_warn;
use crate::error::PipelineError;
use crate::tile::{Feature, GeoBbox};

/// A predicate over one decoded feature.
///
/// Both methods have defaults: `initialize` does nothing and `accepts`
/// lets every feature through, so an empty impl is the identity filter.
/// Implementations must not keep mutable state touched by `accepts`; a
/// chain may be evaluated for several tiles at once.
pub trait FeatureFilter: Send + Sync + fmt::Debug {
    /// One-time setup, run before the first `accepts` call.
    fn initialize(&mut self) {}

    fn accepts(&self, _feature: &Feature) -> Result<bool, PipelineError> {
        Ok(true)
    }
}

/// The identity filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl FeatureFilter for AcceptAll {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Comparison {
    Above,
    Below,
    AtLeast,
    AtMost,
}

impl Comparison {
    fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            Comparison::Above => value > threshold,
            Comparison::Below => value < threshold,
            Comparison::AtLeast => value >= threshold,
            Comparison::AtMost => value <= threshold,
        }
    }
}

/// Compares one numeric property against a threshold.
///
/// Numeric strings are converted. A missing or non-numeric property is an
/// error for that feature, never a pass.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericRangeFilter {
    pub property: String,
    pub comparison: Comparison,
    pub threshold: f64,
}

impl NumericRangeFilter {
    pub fn new(property: &str, comparison: Comparison, threshold: f64) -> Self {
        Self {
            property: property.to_string(),
            comparison,
            threshold,
        }
    }
}

pub(crate) fn numeric_property(feature: &Feature, property: &str) -> Result<f64, PipelineError> {
    let value = feature
        .property(property)
        .ok_or_else(|| PipelineError::MissingProperty(property.to_string()))?;

    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };

    number
        .filter(|n| n.is_finite())
        .ok_or_else(|| PipelineError::NonNumericProperty {
            property: property.to_string(),
            value: value.to_string(),
        })
}

impl FeatureFilter for NumericRangeFilter {
    fn accepts(&self, feature: &Feature) -> Result<bool, PipelineError> {
        let value = numeric_property(feature, &self.property)?;
        Ok(self.comparison.holds(value, self.threshold))
    }
}

/// Drops features whose subclass is in the exclusion list.
#[derive(Debug, Clone, PartialEq)]
pub struct SubclassFilter {
    pub property: String,
    pub exclude: Vec<String>,
}

impl FeatureFilter for SubclassFilter {
    fn accepts(&self, feature: &Feature) -> Result<bool, PipelineError> {
        Ok(match feature.property(&self.property).and_then(Value::as_str) {
            Some(subclass) => !self.exclude.iter().any(|s| s == subclass),
            None => true,
        })
    }
}

/// Keeps features touching a geographic box.
#[derive(Debug, Clone, PartialEq)]
pub struct BboxFilter {
    pub bbox: GeoBbox,
}

impl FeatureFilter for BboxFilter {
    fn accepts(&self, feature: &Feature) -> Result<bool, PipelineError> {
        Ok(feature_intersects_bbox(feature, &self.bbox))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(bool),
    All(Vec<Expr>),
    Any(Vec<Expr>),
    None(Vec<Expr>),
    Not(Box<Expr>),
    Compare {
        op: CompareOp,
        key: String,
        value: Value,
    },
    In {
        key: String,
        values: Vec<Value>,
        negate: bool,
    },
    Has {
        key: String,
        negate: bool,
    },
}

/// Legacy Mapbox GL filter expression, e.g. `["all", ["==", "class", "house"], [">", "height", 10]]`.
///
/// `$type` refers to the geometry type and `$id` to the feature id.
#[derive(Debug, Clone, PartialEq)]
pub struct ExpressionFilter {
    expr: Expr,
}

impl ExpressionFilter {
    pub fn parse(expression: &Value) -> Result<Self, PipelineError> {
        Ok(Self {
            expr: parse_expr(expression)?,
        })
    }
}

fn invalid(expression: &Value, reason: &str) -> PipelineError {
    PipelineError::InvalidFilter(format!("{} in {}", reason, expression))
}

fn parse_expr(expression: &Value) -> Result<Expr, PipelineError> {
    if let Value::Bool(b) = expression {
        return Ok(Expr::Literal(*b));
    }

    let items = expression
        .as_array()
        .ok_or_else(|| invalid(expression, "expected an array"))?;
    let (op, args) = items
        .split_first()
        .ok_or_else(|| invalid(expression, "empty expression"))?;
    let op = op
        .as_str()
        .ok_or_else(|| invalid(expression, "operator must be a string"))?;

    let key = || -> Result<String, PipelineError> {
        args.first()
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| invalid(expression, "expected a property key"))
    };
    let children = || -> Result<Vec<Expr>, PipelineError> { args.iter().map(parse_expr).collect() };

    let compare = |op: CompareOp| -> Result<Expr, PipelineError> {
        if args.len() != 2 {
            return Err(invalid(expression, "comparison takes a key and a value"));
        }
        Ok(Expr::Compare {
            op,
            key: key()?,
            value: args[1].clone(),
        })
    };

    match op {
        "all" => Ok(Expr::All(children()?)),
        "any" => Ok(Expr::Any(children()?)),
        "none" => Ok(Expr::None(children()?)),
        "!" => match args {
            [inner] => Ok(Expr::Not(Box::new(parse_expr(inner)?))),
            _ => Err(invalid(expression, "'!' takes one argument")),
        },
        "==" => compare(CompareOp::Eq),
        "!=" => compare(CompareOp::Ne),
        "<" => compare(CompareOp::Lt),
        "<=" => compare(CompareOp::Le),
        ">" => compare(CompareOp::Gt),
        ">=" => compare(CompareOp::Ge),
        "in" | "!in" => Ok(Expr::In {
            key: key()?,
            values: args[1..].to_vec(),
            negate: op == "!in",
        }),
        "has" | "!has" => Ok(Expr::Has {
            key: key()?,
            negate: op == "!has",
        }),
        other => Err(invalid(expression, &format!("unknown operator '{}'", other))),
    }
}

fn lookup(feature: &Feature, key: &str) -> Option<Value> {
    match key {
        "$type" => Some(Value::String(feature.geometry_type.as_str().to_string())),
        "$id" => feature.id.map(Value::from),
        _ => feature.property(key).cloned(),
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) => x == y,
        _ => a == b,
    }
}

fn values_order(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn eval(expr: &Expr, feature: &Feature) -> bool {
    match expr {
        Expr::Literal(b) => *b,
        Expr::All(children) => children.iter().all(|c| eval(c, feature)),
        Expr::Any(children) => children.iter().any(|c| eval(c, feature)),
        Expr::None(children) => !children.iter().any(|c| eval(c, feature)),
        Expr::Not(inner) => !eval(inner, feature),
        Expr::Compare { op, key, value } => {
            let actual = lookup(feature, key);
            match (op, actual) {
                (CompareOp::Eq, Some(a)) => values_equal(&a, value),
                (CompareOp::Eq, None) => false,
                (CompareOp::Ne, Some(a)) => !values_equal(&a, value),
                (CompareOp::Ne, None) => true,
                (_, None) => false,
                (op, Some(a)) => match values_order(&a, value) {
                    Some(ordering) => match op {
                        CompareOp::Lt => ordering.is_lt(),
                        CompareOp::Le => ordering.is_le(),
                        CompareOp::Gt => ordering.is_gt(),
                        CompareOp::Ge => ordering.is_ge(),
                        CompareOp::Eq | CompareOp::Ne => unreachable!(),
                    },
                    None => false,
                },
            }
        }
        Expr::In {
            key,
            values,
            negate,
        } => {
            let found = lookup(feature, key)
                .map(|a| values.iter().any(|v| values_equal(&a, v)))
                .unwrap_or(false);
            found != *negate
        }
        Expr::Has { key, negate } => lookup(feature, key).is_some() != *negate,
    }
}

impl FeatureFilter for ExpressionFilter {
    fn accepts(&self, feature: &Feature) -> Result<bool, PipelineError> {
        Ok(eval(&self.expr, feature))
    }
}

fn default_subclass_property() -> String {
    "subclass".to_string()
}

/// Serializable filter definition, as found in sub-layer properties.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum FilterConfig {
    NumericRange {
        property: String,
        comparison: Comparison,
        value: f64,
    },
    Subclass {
        #[serde(default = "default_subclass_property")]
        property: String,
        exclude: Vec<String>,
    },
    Bbox {
        bbox: [f64; 4],
    },
    Expression {
        expression: Value,
    },
}

impl FilterConfig {
    pub fn build(&self) -> Result<Box<dyn FeatureFilter>, PipelineError> {
        Ok(match self {
            FilterConfig::NumericRange {
                property,
                comparison,
                value,
            } => Box::new(NumericRangeFilter::new(property, *comparison, *value)),
            FilterConfig::Subclass { property, exclude } => Box::new(SubclassFilter {
                property: property.clone(),
                exclude: exclude.clone(),
            }),
            FilterConfig::Bbox { bbox } => Box::new(BboxFilter {
                bbox: GeoBbox::from_slice(bbox)?,
            }),
            FilterConfig::Expression { expression } => {
                Box::new(ExpressionFilter::parse(expression)?)
            }
        })
    }
}

/// Ordered AND of filters. An empty chain accepts everything.
#[derive(Debug, Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn FeatureFilter>>,
    initialized: bool,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_configs(configs: &[FilterConfig]) -> Result<Self, PipelineError> {
        let filters = configs
            .iter()
            .map(FilterConfig::build)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            filters,
            initialized: false,
        })
    }

    pub fn push<F: FeatureFilter + 'static>(&mut self, filter: F) {
        self.push_boxed(Box::new(filter));
    }

    /// Append a filter. Joining an already initialized chain initializes it
    /// on the spot.
    pub fn push_boxed(&mut self, mut filter: Box<dyn FeatureFilter>) {
        if self.initialized {
            filter.initialize();
        }
        self.filters.push(filter);
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Run every filter's setup hook. Only the first call does anything.
    pub fn initialize(&mut self) {
        if self.initialized {
            return;
        }
        for filter in &mut self.filters {
            filter.initialize();
        }
        self.initialized = true;
    }

    /// Left to right, stopping at the first rejection or error.
    pub fn accepts(&self, feature: &Feature) -> Result<bool, PipelineError> {
        for filter in &self.filters {
            if !filter.accepts(feature)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Like `accepts`, but an evaluation error rejects the feature.
    pub fn evaluate(&self, feature: &Feature) -> bool {
        match self.accepts(feature) {
            Ok(accepted) => accepted,
            Err(e) => {
                console_warn!("Rejecting feature {:?}: {}", feature.id, e);
                false
            }
        }
    }

    pub fn retain<'a>(&'a self, features: &'a [Feature]) -> impl Iterator<Item = &'a Feature> + 'a {
        features.iter().filter(move |f| self.evaluate(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tile::GeometryType;
    use proptest::prelude::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn building(height: Value) -> Feature {
        Feature::new(GeometryType::Polygon, vec![vec![[0.0, 0.0], [1.0, 0.0], [1.0, 1.0]]])
            .with_id(1)
            .with_property("height", height)
            .with_property("class", json!("house"))
    }

    #[derive(Debug)]
    struct CountingFilter {
        inits: Arc<AtomicUsize>,
    }

    impl FeatureFilter for CountingFilter {
        fn initialize(&mut self) {
            self.inits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Debug)]
    struct PanicFilter;

    impl FeatureFilter for PanicFilter {
        fn accepts(&self, _feature: &Feature) -> Result<bool, PipelineError> {
            panic!("chain should have stopped earlier");
        }
    }

    #[test]
    fn accept_all_is_default_behaviour() {
        assert_eq!(AcceptAll.accepts(&building(json!(1))), Ok(true));
        assert_eq!(FilterChain::new().accepts(&building(json!(1))), Ok(true));
    }

    #[test]
    fn numeric_range_comparisons() {
        let above = NumericRangeFilter::new("height", Comparison::Above, 10.0);
        assert_eq!(above.accepts(&building(json!(12))), Ok(true));
        assert_eq!(above.accepts(&building(json!(10))), Ok(false));

        let at_most = NumericRangeFilter::new("height", Comparison::AtMost, 10.0);
        assert_eq!(at_most.accepts(&building(json!(10.0))), Ok(true));
        assert_eq!(at_most.accepts(&building(json!("9.5"))), Ok(true));
    }

    #[test]
    fn non_numeric_property_is_a_hard_failure() {
        let filter = NumericRangeFilter::new("height", Comparison::Below, 100.0);
        assert!(matches!(
            filter.accepts(&building(json!("tall"))),
            Err(PipelineError::NonNumericProperty { .. })
        ));
        assert!(matches!(
            filter.accepts(&building(json!(true))),
            Err(PipelineError::NonNumericProperty { .. })
        ));

        let missing = NumericRangeFilter::new("levels", Comparison::Below, 100.0);
        assert_eq!(
            missing.accepts(&building(json!(1))),
            Err(PipelineError::MissingProperty("levels".to_string()))
        );

        let mut chain = FilterChain::new();
        chain.push(filter);
        assert!(!chain.evaluate(&building(json!("tall"))));
    }

    #[test]
    fn chain_short_circuits_on_rejection() {
        let mut chain = FilterChain::new();
        chain.push(NumericRangeFilter::new("height", Comparison::Above, 50.0));
        chain.push(PanicFilter);
        assert_eq!(chain.accepts(&building(json!(1))), Ok(false));
    }

    #[test]
    fn initialize_runs_once_per_filter() {
        let inits = Arc::new(AtomicUsize::new(0));
        let mut chain = FilterChain::new();
        chain.push(CountingFilter { inits: inits.clone() });

        chain.initialize();
        chain.initialize();
        assert_eq!(inits.load(Ordering::SeqCst), 1);

        // late joiners are initialized when added
        chain.push(CountingFilter { inits: inits.clone() });
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        chain.initialize();
        assert_eq!(inits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn subclass_filter_excludes_listed_values() {
        let filter = SubclassFilter {
            property: "subclass".to_string(),
            exclude: vec!["garage".to_string()],
        };
        let garage = building(json!(3)).with_property("subclass", json!("garage"));
        assert_eq!(filter.accepts(&garage), Ok(false));
        assert_eq!(filter.accepts(&building(json!(3))), Ok(true));
    }

    #[test]
    fn expression_filter_semantics() {
        let expr = json!(["all",
            ["==", "$type", "Polygon"],
            ["in", "class", "house", "apartments"],
            [">=", "height", 12],
            ["!has", "underground"]
        ]);
        let filter = ExpressionFilter::parse(&expr).unwrap();
        assert_eq!(filter.accepts(&building(json!(12.0))), Ok(true));
        assert_eq!(filter.accepts(&building(json!(11))), Ok(false));

        let not_house = ExpressionFilter::parse(&json!(["!=", "class", "house"])).unwrap();
        assert_eq!(not_house.accepts(&building(json!(1))), Ok(false));

        let none = ExpressionFilter::parse(&json!(["none", ["has", "missing"], false])).unwrap();
        assert_eq!(none.accepts(&building(json!(1))), Ok(true));

        // ordering against a missing key never matches
        let lt = ExpressionFilter::parse(&json!(["<", "levels", 3])).unwrap();
        assert_eq!(lt.accepts(&building(json!(1))), Ok(false));
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        for bad in [json!([]), json!(["between", "height", 1]), json!(["==", "height"]), json!("x")] {
            assert!(matches!(
                ExpressionFilter::parse(&bad),
                Err(PipelineError::InvalidFilter(_))
            ));
        }
    }

    #[test]
    fn configs_deserialize_and_build() {
        let configs: Vec<FilterConfig> = serde_json::from_value(json!([
            {"type": "numericRange", "property": "height", "comparison": "above", "value": 5},
            {"type": "subclass", "exclude": ["garage"]},
            {"type": "bbox", "bbox": [-1.0, -1.0, 2.0, 2.0]},
            {"type": "expression", "expression": ["==", "class", "house"]}
        ]))
        .unwrap();

        let chain = FilterChain::from_configs(&configs).unwrap();
        assert_eq!(chain.len(), 4);
        assert!(chain.evaluate(&building(json!(6))));
        assert!(!chain.evaluate(&building(json!(4))));
    }

    proptest! {
        #[test]
        fn chain_is_conjunction_of_members(
            height in -100.0f64..100.0,
            thresholds in proptest::collection::vec((-100.0f64..100.0, any::<bool>()), 0..6)
        ) {
            let feature = building(json!(height));
            let mut chain = FilterChain::new();
            let mut expected = true;
            for (threshold, above) in &thresholds {
                let comparison = if *above { Comparison::Above } else { Comparison::Below };
                let filter = NumericRangeFilter::new("height", comparison, *threshold);
                expected &= filter.accepts(&feature).unwrap();
                chain.push(filter);
            }
            prop_assert_eq!(chain.accepts(&feature).unwrap(), expected);
        }
    }
}
