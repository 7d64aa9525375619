//! GeoJSON adapter for [`InMemoryStore`].

use super::InMemoryStore;
use crate::error::{CleanseError, Result};
use crate::feature::{Attributes, Feature, FeatureId};
use geo::{Coord, LineString};
use geojson::{FeatureCollection, GeoJson, Geometry, Value};
use log::{info, warn};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

fn to_line(points: &[Vec<f64>]) -> Option<LineString<f64>> {
    let coords: Vec<Coord> = points
        .iter()
        .filter(|p| p.len() >= 2)
        .map(|p| Coord { x: p[0], y: p[1] })
        .collect();
    (coords.len() >= 2).then(|| LineString::from(coords))
}

fn feature_id(feature: &geojson::Feature, index: usize) -> String {
    match &feature.id {
        Some(geojson::feature::Id::String(s)) => s.clone(),
        Some(geojson::feature::Id::Number(n)) => n.to_string(),
        None => match feature.property("id") {
            Some(serde_json::Value::String(s)) => s.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => format!("f{index}"),
        },
    }
}

/// Turn a parsed GeoJSON document into line features.
///
/// `MultiLineString` parts become `<id>.<part>`; anything that is not a line is
/// skipped with a warning.
pub fn features_from_geojson(doc: GeoJson) -> Result<Vec<Feature>> {
    let collection = match doc {
        GeoJson::FeatureCollection(fc) => fc,
        GeoJson::Feature(f) => FeatureCollection {
            bbox: None,
            features: vec![f],
            foreign_members: None,
        },
        GeoJson::Geometry(_) => {
            return Err(CleanseError::Store(
                "expected a Feature or FeatureCollection, found a bare geometry".to_string(),
            ));
        }
    };

    let mut out = Vec::with_capacity(collection.features.len());
    let mut skipped = 0usize;

    for (index, feature) in collection.features.iter().enumerate() {
        let id = feature_id(feature, index);
        let attributes: Attributes = feature.properties.clone().unwrap_or_default();
        let Some(geometry) = &feature.geometry else {
            skipped += 1;
            continue;
        };

        match &geometry.value {
            Value::LineString(points) => match to_line(points) {
                Some(line) => out.push(Feature {
                    id: FeatureId(id),
                    geometry: line,
                    attributes,
                }),
                None => skipped += 1,
            },
            Value::MultiLineString(parts) => {
                for (part, points) in parts.iter().enumerate() {
                    match to_line(points) {
                        Some(line) => out.push(Feature {
                            id: FeatureId(format!("{id}.{part}")),
                            geometry: line,
                            attributes: attributes.clone(),
                        }),
                        None => skipped += 1,
                    }
                }
            }
            _ => skipped += 1,
        }
    }

    if skipped > 0 {
        warn!("Skipped {} GeoJSON features without usable line geometry", skipped);
    }
    Ok(out)
}

pub fn read_geojson<R: Read>(reader: R) -> Result<InMemoryStore> {
    let doc = GeoJson::from_reader(reader)?;
    InMemoryStore::from_features(features_from_geojson(doc)?)
}

pub fn load_geojson_file(path: &Path) -> Result<InMemoryStore> {
    let file = File::open(path).map_err(|source| CleanseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let store = read_geojson(BufReader::new(file))?;
    info!("Loaded {} line features from {:?}", store.len(), path);
    Ok(store)
}

pub fn to_feature_collection(store: &InMemoryStore) -> FeatureCollection {
    let features = store
        .features()
        .map(|f| geojson::Feature {
            bbox: None,
            geometry: Some(Geometry::new(Value::LineString(
                f.geometry.0.iter().map(|c| vec![c.x, c.y]).collect(),
            ))),
            id: Some(geojson::feature::Id::String(f.id.0.clone())),
            properties: Some(f.attributes.clone()),
            foreign_members: None,
        })
        .collect();
    FeatureCollection {
        bbox: None,
        features,
        foreign_members: None,
    }
}

pub fn write_geojson<W: Write>(store: &InMemoryStore, writer: W) -> Result<()> {
    serde_json::to_writer(writer, &to_feature_collection(store))?;
    Ok(())
}

pub fn save_geojson_file(store: &InMemoryStore, path: &Path) -> Result<()> {
    let file = File::create(path).map_err(|source| CleanseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let mut writer = BufWriter::new(file);
    write_geojson(store, &mut writer)?;
    writer.flush().map_err(|source| CleanseError::Io {
        path: path.display().to_string(),
        source,
    })?;
    info!("Wrote {} line features to {:?}", store.len(), path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{
        "type": "FeatureCollection",
        "features": [
            {"type": "Feature", "id": "road-1", "properties": {"source": "survey"},
             "geometry": {"type": "LineString", "coordinates": [[0, 0], [10, 0]]}},
            {"type": "Feature", "properties": {"id": 7},
             "geometry": {"type": "MultiLineString", "coordinates": [[[0, 5], [5, 5]], [[6, 5], [9, 5]]]}},
            {"type": "Feature", "properties": {},
             "geometry": {"type": "Point", "coordinates": [1, 1]}}
        ]
    }"#;

    #[test]
    fn reads_lines_and_explodes_multilines() {
        let store = read_geojson(SAMPLE.as_bytes()).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.feature("road-1").unwrap().attributes["source"], "survey");
        assert!(store.feature("7.0").is_some());
        assert!(store.feature("7.1").is_some());
    }

    #[test]
    fn written_collection_keeps_ids_and_properties() {
        let store = read_geojson(SAMPLE.as_bytes()).unwrap();
        let fc = to_feature_collection(&store);
        assert_eq!(fc.features.len(), 3);
        let road = fc
            .features
            .iter()
            .find(|f| f.id == Some(geojson::feature::Id::String("road-1".to_string())))
            .unwrap();
        assert_eq!(road.property("source").unwrap(), "survey");
    }
}
