use anyhow::{Context, Result};
use geo::{BoundingRect, MultiPolygon};
use polars::prelude::*;
use std::fmt;

use crate::error::PipelineError;
use crate::geo_core::{BoundingBox, Crs};

/// Storage type of an attribute column
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Integer,
    Real,
}

/// Attribute column definition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    pub name: String,
    pub kind: FieldKind,
}

impl Field {
    pub fn new(name: impl Into<String>, kind: FieldKind) -> Self {
        Field {
            name: name.into(),
            kind,
        }
    }
}

/// One scalar cell of an attribute row
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    Text(String),
    Integer(i64),
    Real(f64),
    Null,
}

impl AttributeValue {
    /// Numeric view; text is not parsed
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            AttributeValue::Integer(v) => Some(*v as f64),
            AttributeValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            AttributeValue::Integer(v) => Some(*v),
            AttributeValue::Real(v) if v.fract() == 0.0 => Some(*v as i64),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// String rendering of any non-null value
    pub fn to_text(&self) -> Option<String> {
        match self {
            AttributeValue::Null => None,
            AttributeValue::Text(s) => Some(s.clone()),
            other => Some(other.to_string()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, AttributeValue::Null)
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Text(s) => write!(f, "{}", s),
            AttributeValue::Integer(v) => write!(f, "{}", v),
            AttributeValue::Real(v) => write!(f, "{}", v),
            AttributeValue::Null => write!(f, "null"),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<i64> for AttributeValue {
    fn from(value: i64) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<f64> for AttributeValue {
    fn from(value: f64) -> Self {
        AttributeValue::Real(value)
    }
}

/// A record: polygonal geometry plus one value per schema field
#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: MultiPolygon<f64>,
    pub attributes: Vec<AttributeValue>,
}

/// Ordered records sharing one CRS and one attribute schema
/// Equivalent of a GeoDataFrame restricted to polygonal layers
#[derive(Debug, Clone)]
pub struct FeatureCollection {
    /// `None` when the source declared no spatial reference
    pub crs: Option<Crs>,
    pub fields: Vec<Field>,
    pub features: Vec<Feature>,
}

impl FeatureCollection {
    pub fn new(crs: Option<Crs>, fields: Vec<Field>) -> Self {
        FeatureCollection {
            crs,
            fields,
            features: Vec::new(),
        }
    }

    /// Append a record; the row must match the schema width
    pub fn push(
        &mut self,
        geometry: impl Into<MultiPolygon<f64>>,
        attributes: Vec<AttributeValue>,
    ) -> Result<()> {
        if attributes.len() != self.fields.len() {
            return Err(PipelineError::DataSource(format!(
                "record has {} attributes but the schema has {} fields",
                attributes.len(),
                self.fields.len()
            ))
            .into());
        }
        self.features.push(Feature {
            geometry: geometry.into(),
            attributes,
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.features.len()
    }

    pub fn is_empty(&self) -> bool {
        self.features.is_empty()
    }

    pub fn crs(&self) -> Option<&Crs> {
        self.crs.as_ref()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Attribute of record `row` in column `name`
    pub fn value(&self, row: usize, name: &str) -> Option<&AttributeValue> {
        let idx = self.field_index(name)?;
        self.features.get(row)?.attributes.get(idx)
    }

    /// Envelope of all geometries, `None` for an empty collection
    pub fn bounding_box(&self) -> Option<BoundingBox> {
        self.features
            .iter()
            .filter_map(|f| f.geometry.bounding_rect())
            .map(BoundingBox::from_rect)
            .reduce(|a, b| a.union(&b))
    }

    /// Attribute table as a Polars DataFrame, plus a `geometry` summary column
    /// Similar to printing a GeoDataFrame
    pub fn to_polars_df(&self) -> Result<DataFrame> {
        let rows: Vec<&[AttributeValue]> = self
            .features
            .iter()
            .map(|f| f.attributes.as_slice())
            .collect();
        let geometry: Vec<String> = self
            .features
            .iter()
            .map(|f| geometry_summary(&f.geometry))
            .collect();
        attributes_to_polars(&self.fields, &rows, Some(geometry))
    }

    /// First `n` records as a DataFrame
    pub fn head(&self, n: usize) -> Result<DataFrame> {
        Ok(self.to_polars_df()?.head(Some(n)))
    }
}

pub(crate) fn geometry_summary(geometry: &MultiPolygon<f64>) -> String {
    match geometry.0.len() {
        1 => "POLYGON".to_string(),
        n => format!("MULTIPOLYGON ({} parts)", n),
    }
}

/// Build a DataFrame column-by-column from a schema and row slices
pub(crate) fn attributes_to_polars(
    fields: &[Field],
    rows: &[&[AttributeValue]],
    geometry: Option<Vec<String>>,
) -> Result<DataFrame> {
    let mut columns: Vec<Column> = Vec::with_capacity(fields.len() + 1);

    for (idx, field) in fields.iter().enumerate() {
        let name = PlSmallStr::from(field.name.as_str());
        let cells = rows.iter().map(|row| row.get(idx).unwrap_or(&AttributeValue::Null));
        let series = match field.kind {
            FieldKind::Text => {
                let values: Vec<Option<String>> = cells.map(|v| v.to_text()).collect();
                Series::new(name, values)
            }
            FieldKind::Integer => {
                let values: Vec<Option<i64>> = cells.map(|v| v.as_i64()).collect();
                Series::new(name, values)
            }
            FieldKind::Real => {
                let values: Vec<Option<f64>> = cells.map(|v| v.as_f64()).collect();
                Series::new(name, values)
            }
        };
        columns.push(series.into());
    }

    if let Some(geometry) = geometry {
        columns.push(Series::new(PlSmallStr::from("geometry"), geometry).into());
    }

    DataFrame::new(columns).context("Failed to create DataFrame")
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::polygon;

    fn square(x: f64, y: f64, size: f64) -> geo::Polygon<f64> {
        polygon![
            (x: x, y: y),
            (x: x + size, y: y),
            (x: x + size, y: y + size),
            (x: x, y: y + size),
            (x: x, y: y),
        ]
    }

    fn sample_collection() -> FeatureCollection {
        let mut collection = FeatureCollection::new(
            Some(Crs::epsg(2157)),
            vec![
                Field::new("Ward", FieldKind::Text),
                Field::new("Population", FieldKind::Integer),
            ],
        );
        collection
            .push(square(0.0, 0.0, 1.0), vec!["Abbey".into(), 1200i64.into()])
            .unwrap();
        collection
            .push(square(2.0, 0.0, 1.0), vec!["Ballyhenry".into(), AttributeValue::Null])
            .unwrap();
        collection
    }

    #[test]
    fn test_push_rejects_wrong_width() {
        let mut collection = sample_collection();
        let err = collection
            .push(square(0.0, 0.0, 1.0), vec!["Only one".into()])
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DataSource(_))
        ));
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_value_lookup() {
        let collection = sample_collection();
        assert_eq!(
            collection.value(0, "Population"),
            Some(&AttributeValue::Integer(1200))
        );
        assert_eq!(collection.value(1, "Ward").and_then(|v| v.as_text()), Some("Ballyhenry"));
        assert!(collection.value(0, "Missing").is_none());
        assert!(collection.value(5, "Ward").is_none());
    }

    #[test]
    fn test_bounding_box() {
        let collection = sample_collection();
        let bbox = collection.bounding_box().unwrap();
        assert_eq!(bbox.min_x, 0.0);
        assert_eq!(bbox.max_x, 3.0);
        assert_eq!(bbox.max_y, 1.0);

        let empty = FeatureCollection::new(None, vec![]);
        assert!(empty.bounding_box().is_none());
    }

    #[test]
    fn test_to_polars_df() {
        let collection = sample_collection();
        let df = collection.to_polars_df().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 3);
        assert!(df.column("Ward").is_ok());
        assert!(df.column("geometry").is_ok());
        assert_eq!(collection.head(1).unwrap().height(), 1);
    }

    #[test]
    fn test_attribute_conversions() {
        assert_eq!(AttributeValue::Integer(3).as_f64(), Some(3.0));
        assert_eq!(AttributeValue::Real(2.5).as_i64(), None);
        assert_eq!(AttributeValue::Real(4.0).as_i64(), Some(4));
        assert_eq!(AttributeValue::Text("7".into()).as_f64(), None);
        assert_eq!(AttributeValue::Integer(7).to_text(), Some("7".to_string()));
        assert!(AttributeValue::Null.to_text().is_none());
    }
}
