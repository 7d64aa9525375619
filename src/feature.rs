use crate::geometry;
use ahash::AHashSet;
use geo::{Coord, Euclidean, Intersects, Length, LineString, Rect};
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Attributes = serde_json::Map<String, serde_json::Value>;

/// Identifier of a line feature inside a store.
///
/// Ordering is lexicographic and doubles as the deterministic scan order of every pass.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FeatureId(pub String);

impl FeatureId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for FeatureId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for FeatureId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub id: FeatureId,
    pub geometry: LineString<f64>,
    pub attributes: Attributes,
}

impl Feature {
    pub fn new(id: impl Into<String>, geometry: LineString<f64>) -> Self {
        Self {
            id: FeatureId::new(id),
            geometry,
            attributes: Attributes::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: serde_json::Value) -> Self {
        self.attributes.insert(key.to_string(), value);
        self
    }

    pub fn length(&self) -> f64 {
        Euclidean.length(&self.geometry)
    }

    pub fn start(&self) -> Option<Coord> {
        self.geometry.0.first().copied()
    }

    pub fn end(&self) -> Option<Coord> {
        self.geometry.0.last().copied()
    }
}

/// A feature that has not been given an id yet. Passes that split or derive
/// geometries hand these to the store, which assigns the id.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureDraft {
    pub geometry: LineString<f64>,
    pub attributes: Attributes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Projection {
    /// id + geometry only; attributes come back empty
    GeometryOnly,
    #[default]
    Full,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EndpointRole {
    Start,
    End,
}

impl EndpointRole {
    pub fn coord_of(self, line: &LineString<f64>) -> Option<Coord> {
        match self {
            EndpointRole::Start => line.0.first().copied(),
            EndpointRole::End => line.0.last().copied(),
        }
    }
}

/// An endpoint of a line feature. Built per pass and never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Node {
    pub coord: Coord,
    pub owner: FeatureId,
    pub role: EndpointRole,
}

/// Predicate over features understood by every store.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    All,
    Ids(AHashSet<FeatureId>),
    /// Geometry envelope intersects the rectangle.
    Envelope(Rect<f64>),
    /// Geometry passes within `distance` of `point`; 0 means exact intersection.
    NearPoint { point: Coord, distance: f64 },
    LengthAtMost(f64),
    And(Box<Filter>, Box<Filter>),
    Not(Box<Filter>),
}

impl Filter {
    pub fn and(self, other: Filter) -> Filter {
        match (self, other) {
            (Filter::All, f) | (f, Filter::All) => f,
            (a, b) => Filter::And(Box::new(a), Box::new(b)),
        }
    }

    pub fn not(self) -> Filter {
        Filter::Not(Box::new(self))
    }

    pub fn excluding(self, ids: &AHashSet<FeatureId>) -> Filter {
        if ids.is_empty() {
            self
        } else {
            self.and(Filter::Ids(ids.clone()).not())
        }
    }

    /// Search window a spatial index can use to narrow candidates, if any.
    pub fn search_window(&self) -> Option<Rect<f64>> {
        match self {
            Filter::Envelope(rect) => Some(*rect),
            Filter::NearPoint { point, distance } => {
                Some(geometry::square_around(*point, geometry::near_radius(*distance)))
            }
            Filter::And(a, b) => a.search_window().or_else(|| b.search_window()),
            _ => None,
        }
    }

    pub fn matches(&self, feature: &Feature) -> bool {
        match self {
            Filter::All => true,
            Filter::Ids(ids) => ids.contains(&feature.id),
            Filter::Envelope(rect) => geometry::envelope(&feature.geometry)
                .is_some_and(|env| env.intersects(rect)),
            Filter::NearPoint { point, distance } => {
                geometry::within_distance(*point, &feature.geometry, *distance)
            }
            Filter::LengthAtMost(max) => feature.length() <= *max,
            Filter::And(a, b) => a.matches(feature) && b.matches(feature),
            Filter::Not(inner) => !inner.matches(feature),
        }
    }
}
