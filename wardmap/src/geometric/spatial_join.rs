use anyhow::Result;
use geo::{BoundingRect, Intersects, MultiPolygon, Relate};
use polars::prelude::DataFrame;
use rstar::primitives::{GeomWithData, Rectangle};
use rstar::{RTree, AABB};
use tracing::info;

use crate::error::PipelineError;
use crate::geo_core::Crs;
use crate::geometric::feature_collection::{
    attributes_to_polars, geometry_summary, AttributeValue, Field, FieldKind, FeatureCollection,
};

/// Name of the column recording which right-hand record matched
pub const INDEX_RIGHT: &str = "index_right";

/// Binary spatial relationship tested between a left and a right geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpatialPredicate {
    /// Geometries share at least one point
    #[default]
    Intersects,
    /// Left lies inside right
    Within,
    /// Left contains right
    Contains,
}

impl SpatialPredicate {
    pub fn evaluate(&self, left: &MultiPolygon<f64>, right: &MultiPolygon<f64>) -> bool {
        match self {
            SpatialPredicate::Intersects => left.intersects(right),
            SpatialPredicate::Within => left.relate(right).is_within(),
            SpatialPredicate::Contains => left.relate(right).is_contains(),
        }
    }
}

/// Join parameters
/// Following geopandas: `sjoin(how="inner", lsuffix="left", rsuffix="right")`
#[derive(Debug, Clone, PartialEq)]
pub struct JoinOptions {
    pub predicate: SpatialPredicate,
    pub lsuffix: String,
    pub rsuffix: String,
}

impl Default for JoinOptions {
    fn default() -> Self {
        use crate::collect::global_variables::{LEFT_SUFFIX, RIGHT_SUFFIX};

        JoinOptions {
            predicate: SpatialPredicate::default(),
            lsuffix: LEFT_SUFFIX.to_string(),
            rsuffix: RIGHT_SUFFIX.to_string(),
        }
    }
}

/// One (left, right) match
#[derive(Debug, Clone, PartialEq)]
pub struct JoinedRecord {
    /// Geometry of the left record
    pub geometry: MultiPolygon<f64>,
    pub attributes: Vec<AttributeValue>,
    pub left_index: usize,
    pub right_index: usize,
}

/// Result of an inner spatial join
/// Schema: left fields, `index_right`, right fields; colliding names suffixed
#[derive(Debug, Clone)]
pub struct JoinedTable {
    pub crs: Crs,
    pub fields: Vec<Field>,
    pub records: Vec<JoinedRecord>,
}

impl JoinedTable {
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn value(&self, row: usize, name: &str) -> Option<&AttributeValue> {
        let idx = self.field_index(name)?;
        self.records.get(row)?.attributes.get(idx)
    }

    pub fn to_polars_df(&self) -> Result<DataFrame> {
        let rows: Vec<&[AttributeValue]> = self
            .records
            .iter()
            .map(|r| r.attributes.as_slice())
            .collect();
        let geometry: Vec<String> = self
            .records
            .iter()
            .map(|r| geometry_summary(&r.geometry))
            .collect();
        attributes_to_polars(&self.fields, &rows, Some(geometry))
    }
}

/// Inner spatial join of `left` against `right`
///
/// Every left record is paired with each right record satisfying the predicate;
/// left records without a match are dropped. Output follows left order, then
/// right order among multiple matches. Both inputs must share a CRS.
pub fn sjoin(
    left: &FeatureCollection,
    right: &FeatureCollection,
    options: &JoinOptions,
) -> Result<JoinedTable> {
    let crs = match (left.crs(), right.crs()) {
        (Some(l), Some(r)) if l == r => l.clone(),
        (l, r) => {
            return Err(PipelineError::CrsMismatch {
                left: describe_crs(l),
                right: describe_crs(r),
            }
            .into())
        }
    };

    let fields = joined_fields(&left.fields, &right.fields, options);

    // Envelope index over the right-hand records
    let entries: Vec<GeomWithData<Rectangle<[f64; 2]>, usize>> = right
        .features
        .iter()
        .enumerate()
        .filter_map(|(idx, feature)| {
            let rect = feature.geometry.bounding_rect()?;
            Some(GeomWithData::new(
                Rectangle::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]),
                idx,
            ))
        })
        .collect();
    let tree = RTree::bulk_load(entries);

    let mut records = Vec::new();
    let mut unmatched = 0usize;

    for (left_index, left_feature) in left.features.iter().enumerate() {
        let Some(rect) = left_feature.geometry.bounding_rect() else {
            unmatched += 1;
            continue;
        };
        let envelope = AABB::from_corners([rect.min().x, rect.min().y], [rect.max().x, rect.max().y]);

        let mut candidates: Vec<usize> = tree
            .locate_in_envelope_intersecting(&envelope)
            .map(|entry| entry.data)
            .collect();
        candidates.sort_unstable();

        let before = records.len();
        for right_index in candidates {
            let right_feature = &right.features[right_index];
            if !options
                .predicate
                .evaluate(&left_feature.geometry, &right_feature.geometry)
            {
                continue;
            }

            let mut attributes =
                Vec::with_capacity(left_feature.attributes.len() + right_feature.attributes.len() + 1);
            attributes.extend(left_feature.attributes.iter().cloned());
            attributes.push(AttributeValue::Integer(right_index as i64));
            attributes.extend(right_feature.attributes.iter().cloned());

            records.push(JoinedRecord {
                geometry: left_feature.geometry.clone(),
                attributes,
                left_index,
                right_index,
            });
        }
        if records.len() == before {
            unmatched += 1;
        }
    }

    info!(
        "Spatial join ({:?}): {} left x {} right -> {} rows, {} left records unmatched",
        options.predicate,
        left.len(),
        right.len(),
        records.len(),
        unmatched
    );

    Ok(JoinedTable {
        crs,
        fields,
        records,
    })
}

fn describe_crs(crs: Option<&Crs>) -> String {
    crs.map(|c| c.to_string())
        .unwrap_or_else(|| "undefined".to_string())
}

/// Left fields, `index_right`, right fields; names present on both sides get suffixes
fn joined_fields(left: &[Field], right: &[Field], options: &JoinOptions) -> Vec<Field> {
    let collides = |name: &str, other: &[Field]| other.iter().any(|f| f.name == name);

    let mut fields: Vec<Field> = left
        .iter()
        .map(|f| {
            if collides(&f.name, right) {
                Field::new(format!("{}_{}", f.name, options.lsuffix), f.kind)
            } else {
                f.clone()
            }
        })
        .collect();

    fields.push(Field::new(INDEX_RIGHT, FieldKind::Integer));

    fields.extend(right.iter().map(|f| {
        if collides(&f.name, left) {
            Field::new(format!("{}_{}", f.name, options.rsuffix), f.kind)
        } else {
            f.clone()
        }
    }));

    fields
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

    fn counties() -> FeatureCollection {
        let mut counties = FeatureCollection::new(
            Some(Crs::epsg(2157)),
            vec![
                Field::new("CountyName", FieldKind::Text),
                Field::new("Area_SqKM", FieldKind::Real),
            ],
        );
        counties
            .push(square(0.0, 0.0, 10.0), vec!["ANTRIM".into(), 100.0f64.into()])
            .unwrap();
        counties
            .push(square(10.0, 0.0, 10.0), vec!["DOWN".into(), 100.0f64.into()])
            .unwrap();
        counties
    }

    fn wards() -> FeatureCollection {
        let mut wards = FeatureCollection::new(
            Some(Crs::epsg(2157)),
            vec![
                Field::new("Ward", FieldKind::Text),
                Field::new("Population", FieldKind::Integer),
                Field::new("Area_SqKM", FieldKind::Real),
            ],
        );
        // inside ANTRIM
        wards
            .push(square(1.0, 1.0, 2.0), vec!["Abbey".into(), 1000i64.into(), 4.0f64.into()])
            .unwrap();
        // outside every county
        wards
            .push(square(50.0, 50.0, 2.0), vec!["Offshore".into(), 10i64.into(), 4.0f64.into()])
            .unwrap();
        // straddles ANTRIM and DOWN
        wards
            .push(square(9.0, 1.0, 2.0), vec!["Border".into(), 3000i64.into(), 4.0f64.into()])
            .unwrap();
        wards
    }

    #[test]
    fn test_inner_join_row_count() {
        let joined = sjoin(&wards(), &counties(), &JoinOptions::default()).unwrap();
        // Abbey x1, Offshore x0, Border x2
        assert_eq!(joined.len(), 3);
        let pairs: Vec<(usize, usize)> = joined
            .records
            .iter()
            .map(|r| (r.left_index, r.right_index))
            .collect();
        assert_eq!(pairs, vec![(0, 0), (2, 0), (2, 1)]);
        assert_eq!(
            joined.value(2, "CountyName").and_then(|v| v.as_text()),
            Some("DOWN")
        );
    }

    #[test]
    fn test_suffixes_on_collisions() {
        let joined = sjoin(&wards(), &counties(), &JoinOptions::default()).unwrap();
        let names: Vec<&str> = joined.fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Ward",
                "Population",
                "Area_SqKM_left",
                INDEX_RIGHT,
                "CountyName",
                "Area_SqKM_right"
            ]
        );
        assert_eq!(joined.value(0, INDEX_RIGHT), Some(&AttributeValue::Integer(0)));
    }

    #[test]
    fn test_within_predicate_drops_straddling_ward() {
        let options = JoinOptions {
            predicate: SpatialPredicate::Within,
            ..JoinOptions::default()
        };
        let joined = sjoin(&wards(), &counties(), &options).unwrap();
        assert_eq!(joined.len(), 1);
        assert_eq!(
            joined.value(0, "Ward").and_then(|v| v.as_text()),
            Some("Abbey")
        );
    }

    #[test]
    fn test_crs_mismatch() {
        let mut counties = counties();
        counties.crs = Some(Crs::wgs84());
        let err = sjoin(&wards(), &counties, &JoinOptions::default()).unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::CrsMismatch {
                left: "EPSG:2157".to_string(),
                right: "EPSG:4326".to_string(),
            })
        );

        counties.crs = None;
        let err = sjoin(&wards(), &counties, &JoinOptions::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::CrsMismatch { .. })
        ));
    }

    #[test]
    fn test_joined_polars_df() {
        let joined = sjoin(&wards(), &counties(), &JoinOptions::default()).unwrap();
        let df = joined.to_polars_df().unwrap();
        assert_eq!(df.height(), 3);
        assert!(df.column("Area_SqKM_right").is_ok());
        assert!(df.column("geometry").is_ok());
    }
}
