use anyhow::{Context, Result};
use gdal::spatial_ref::SpatialRef;
use gdal::vector::{FieldValue, LayerAccess, OGRFieldType};
use gdal::Dataset;
use geo::{Geometry as GeoGeometry, MultiPolygon};
use geojson::GeoJson;
use std::path::Path;
use tracing::{debug, info, warn};

use crate::error::PipelineError;
use crate::geo_core::Crs;
use crate::geometric::feature_collection::{AttributeValue, Field, FieldKind, FeatureCollection};

/// Read the first layer of a vector dataset (shapefile, GeoJSON, GPKG...) through GDAL
/// Following geopandas `read_file`: all attribute columns and the native CRS are kept
///
/// Non-polygonal and empty geometries are skipped. The dataset is closed before returning.
pub fn load_vector<P: AsRef<Path>>(path: P) -> Result<FeatureCollection> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(PipelineError::DataSource(format!("{:?} does not exist", path)).into());
    }

    let dataset = Dataset::open(path).map_err(|e| {
        PipelineError::DataSource(format!("failed to open {:?}: {}", path, e))
    })?;

    let mut layer = dataset.layer(0).map_err(|e| {
        PipelineError::DataSource(format!("{:?} has no readable layer: {}", path, e))
    })?;

    let crs = match layer.spatial_ref() {
        Some(srs) => Some(crs_from_spatial_ref(srs).with_context(|| {
            format!("Failed to read spatial reference of {:?}", path)
        })?),
        None => {
            warn!("{:?} declares no spatial reference", path);
            None
        }
    };

    let fields: Vec<Field> = layer
        .defn()
        .fields()
        .map(|f| Field::new(f.name(), field_kind(f.field_type())))
        .collect();

    let mut collection = FeatureCollection::new(crs, fields);
    let mut skipped = 0usize;

    for feature in layer.features() {
        let Some(geometry) = feature.geometry() else {
            skipped += 1;
            continue;
        };

        let wkt = geometry
            .wkt()
            .map_err(|e| PipelineError::DataSource(e.to_string()))
            .context("Failed to get WKT from GDAL geometry")?;

        let Some(polygons) = wkt_to_multipolygon(&wkt)? else {
            skipped += 1;
            continue;
        };

        let attributes: Vec<AttributeValue> = feature
            .fields()
            .map(|(_, value)| attribute_from_gdal(value))
            .collect();

        collection.push(polygons, attributes)?;
    }

    if skipped > 0 {
        warn!("Skipped {} non-polygonal or empty features in {:?}", skipped, path);
    }

    info!(
        "Loaded {} features with {} fields from {:?} (CRS: {})",
        collection.len(),
        collection.fields.len(),
        path,
        collection
            .crs()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "undefined".to_string())
    );

    Ok(collection)
}

/// Load polygon features from GeoJSON bytes
/// GeoJSON coordinates are WGS 84 unless `set_crs` overrides it
pub fn from_geojson(geojson_data: &[u8], set_crs: Option<Crs>) -> Result<FeatureCollection> {
    let geojson_str = std::str::from_utf8(geojson_data)
        .map_err(|e| PipelineError::DataSource(format!("GeoJSON is not valid UTF-8: {}", e)))?;
    let geojson: GeoJson = geojson_str
        .parse()
        .map_err(|e| PipelineError::DataSource(format!("failed to parse GeoJSON: {}", e)))?;

    let features = match geojson {
        GeoJson::FeatureCollection(fc) => fc.features,
        GeoJson::Feature(f) => vec![f],
        GeoJson::Geometry(_) => {
            return Err(PipelineError::DataSource(
                "GeoJSON must be a Feature or FeatureCollection".to_string(),
            )
            .into())
        }
    };

    let fields = infer_fields(&features);
    let mut collection = FeatureCollection::new(Some(set_crs.unwrap_or_else(Crs::wgs84)), fields);

    for feature in features {
        let Some(geometry) = feature.geometry else {
            continue;
        };
        let geo_geom = GeoGeometry::<f64>::try_from(geometry.value)
            .map_err(|e| PipelineError::DataSource(format!("invalid GeoJSON geometry: {}", e)))?;
        let Some(polygons) = as_multipolygon(geo_geom) else {
            continue;
        };

        let attributes = collection
            .fields
            .iter()
            .map(|field| {
                let value = feature
                    .properties
                    .as_ref()
                    .and_then(|props| props.get(&field.name));
                attribute_from_json(value, field.kind)
            })
            .collect();

        collection.push(polygons, attributes)?;
    }

    debug!("Parsed {} GeoJSON features", collection.len());

    Ok(collection)
}

/// Prefer an `EPSG:<code>` tag; fall back to the full WKT
fn crs_from_spatial_ref(mut srs: SpatialRef) -> Result<Crs> {
    // Shapefile .prj files rarely carry an authority; let GDAL look it up
    if srs.auth_code().is_err() {
        let _ = srs.auto_identify_epsg();
    }

    if let (Some(name), Ok(code)) = (srs.auth_name(), srs.auth_code()) {
        if name.eq_ignore_ascii_case("EPSG") {
            return Ok(Crs::epsg(code as u32));
        }
    }

    let wkt = srs
        .to_wkt()
        .map_err(|e| PipelineError::Projection(e.to_string()))?;
    Ok(Crs::from_definition(&wkt))
}

fn field_kind(field_type: u32) -> FieldKind {
    match field_type {
        OGRFieldType::OFTInteger | OGRFieldType::OFTInteger64 => FieldKind::Integer,
        OGRFieldType::OFTReal => FieldKind::Real,
        _ => FieldKind::Text,
    }
}

fn attribute_from_gdal(value: Option<FieldValue>) -> AttributeValue {
    match value {
        None => AttributeValue::Null,
        Some(FieldValue::IntegerValue(v)) => AttributeValue::Integer(v as i64),
        Some(FieldValue::Integer64Value(v)) => AttributeValue::Integer(v),
        Some(FieldValue::RealValue(v)) => AttributeValue::Real(v),
        Some(FieldValue::StringValue(s)) => AttributeValue::Text(s),
        Some(other) => other
            .into_string()
            .map(AttributeValue::Text)
            .unwrap_or(AttributeValue::Null),
    }
}

/// Parse WKT with GEOS and keep polygonal results
fn wkt_to_multipolygon(wkt: &str) -> Result<Option<MultiPolygon<f64>>> {
    use geos::Geometry as GeosGeometry;

    let geos_geom = GeosGeometry::new_from_wkt(wkt)
        .map_err(|e| PipelineError::DataSource(e.to_string()))
        .context("Failed to parse WKT with GEOS")?;

    let geo_geom = GeoGeometry::<f64>::try_from(geos_geom)
        .map_err(|e| PipelineError::DataSource(e.to_string()))
        .context("Failed to convert GEOS geometry to geo")?;

    Ok(as_multipolygon(geo_geom))
}

fn as_multipolygon(geometry: GeoGeometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        GeoGeometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
        GeoGeometry::MultiPolygon(mp) if !mp.0.is_empty() => Some(mp),
        _ => None,
    }
}

/// Schema from the union of property keys, in first-seen order
fn infer_fields(features: &[geojson::Feature]) -> Vec<Field> {
    let mut names: Vec<String> = Vec::new();
    for props in features.iter().filter_map(|f| f.properties.as_ref()) {
        for key in props.keys() {
            if !names.contains(key) {
                names.push(key.clone());
            }
        }
    }

    names
        .into_iter()
        .map(|name| {
            let values: Vec<&serde_json::Value> = features
                .iter()
                .filter_map(|f| f.properties.as_ref()?.get(&name))
                .filter(|v| !v.is_null())
                .collect();
            let kind = if !values.is_empty() && values.iter().all(|v| v.is_i64()) {
                FieldKind::Integer
            } else if !values.is_empty() && values.iter().all(|v| v.is_number()) {
                FieldKind::Real
            } else {
                FieldKind::Text
            };
            Field::new(name, kind)
        })
        .collect()
}

fn attribute_from_json(value: Option<&serde_json::Value>, kind: FieldKind) -> AttributeValue {
    let Some(value) = value else {
        return AttributeValue::Null;
    };
    match (kind, value) {
        (_, serde_json::Value::Null) => AttributeValue::Null,
        (FieldKind::Integer, v) => v.as_i64().map(AttributeValue::Integer).unwrap_or(AttributeValue::Null),
        (FieldKind::Real, v) => v.as_f64().map(AttributeValue::Real).unwrap_or(AttributeValue::Null),
        (FieldKind::Text, serde_json::Value::String(s)) => AttributeValue::Text(s.clone()),
        (FieldKind::Text, v) => AttributeValue::Text(v.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const WARDS_GEOJSON: &str = r#"
    {
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "Ward": "Abbey", "Population": 1000, "Area": 1.5 },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[[-6.0, 54.0], [-5.9, 54.0], [-5.9, 54.1], [-6.0, 54.1], [-6.0, 54.0]]]
                }
            },
            {
                "type": "Feature",
                "properties": { "Ward": "Ballyhenry", "Population": null, "Area": 2 },
                "geometry": {
                    "type": "MultiPolygon",
                    "coordinates": [[[[-5.8, 54.0], [-5.7, 54.0], [-5.7, 54.1], [-5.8, 54.1], [-5.8, 54.0]]]]
                }
            },
            {
                "type": "Feature",
                "properties": { "Ward": "Point", "Population": 5 },
                "geometry": { "type": "Point", "coordinates": [-6.0, 54.0] }
            }
        ]
    }
    "#;

    #[test]
    fn test_from_geojson() {
        let collection = from_geojson(WARDS_GEOJSON.as_bytes(), None).unwrap();
        assert_eq!(collection.len(), 2);
        assert_eq!(collection.crs(), Some(&Crs::wgs84()));
        assert_eq!(collection.fields.len(), 3);
        let kind_of = |name: &str| collection.fields[collection.field_index(name).unwrap()].kind;
        assert_eq!(kind_of("Ward"), FieldKind::Text);
        assert_eq!(kind_of("Population"), FieldKind::Integer);
        assert_eq!(kind_of("Area"), FieldKind::Real);
        assert_eq!(collection.value(0, "Population"), Some(&AttributeValue::Integer(1000)));
        assert_eq!(collection.value(1, "Population"), Some(&AttributeValue::Null));
        assert_eq!(collection.value(1, "Area"), Some(&AttributeValue::Real(2.0)));
    }

    #[test]
    fn test_from_geojson_rejects_bare_geometry() {
        let err = from_geojson(br#"{"type": "Point", "coordinates": [0.0, 0.0]}"#, None).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DataSource(_))
        ));
    }

    #[test]
    fn test_load_missing_file() {
        let err = load_vector("data_files/does_not_exist.shp").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DataSource(_))
        ));
    }

    #[test]
    fn test_load_unreadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("garbage.shp");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"not a shapefile")
            .unwrap();
        let err = load_vector(&path).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DataSource(_))
        ));
    }

    #[test]
    fn test_load_geojson_through_gdal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wards.geojson");
        std::fs::write(&path, WARDS_GEOJSON).unwrap();

        let collection = load_vector(&path).unwrap();
        assert_eq!(collection.len(), 2);
        assert!(collection.field_index("Ward").is_some());
        assert_eq!(
            collection.value(0, "Ward").and_then(|v| v.as_text()),
            Some("Abbey")
        );
        assert_eq!(
            collection.value(0, "Population").and_then(|v| v.as_f64()),
            Some(1000.0)
        );
    }
}
