use anyhow::{Context, Result};
use polars::prelude::*;
use std::fmt;

use crate::error::PipelineError;
use crate::geometric::feature_collection::FieldKind;
use crate::geometric::spatial_join::JoinedTable;

/// Population statistics over a joined ward/county table
#[derive(Debug, Clone, PartialEq)]
pub struct PopulationSummary {
    /// Sum over every joined row
    pub total: f64,
    /// County name -> sum, first-occurrence order
    pub by_county: Vec<(String, f64)>,
    /// (county, ward) -> sum, first-occurrence order
    pub by_county_and_ward: Vec<((String, String), f64)>,
}

impl PopulationSummary {
    pub fn county_total(&self, county: &str) -> Option<f64> {
        self.by_county
            .iter()
            .find(|(name, _)| name == county)
            .map(|(_, sum)| *sum)
    }
}

impl fmt::Display for PopulationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Total population: {}", self.total)?;
        writeln!(f, "Population by county:")?;
        for (county, sum) in &self.by_county {
            writeln!(f, "  {:<24} {}", county, sum)?;
        }
        writeln!(f, "Population by county and ward:")?;
        for ((county, ward), sum) in &self.by_county_and_ward {
            writeln!(f, "  {:<24} {:<32} {}", county, ward, sum)?;
        }
        Ok(())
    }
}

/// Compute total, per-county and per-(county, ward) population sums
///
/// Null populations are ignored by the sums. Rows whose grouping key is null
/// count toward `total` but not toward the grouped sums (pandas `groupby` default).
pub fn summarise(
    table: &JoinedTable,
    population: &str,
    county: &str,
    ward: &str,
) -> Result<PopulationSummary> {
    for name in [population, county, ward] {
        if table.field_index(name).is_none() {
            return Err(PipelineError::DataSource(format!(
                "joined table has no column '{}'",
                name
            ))
            .into());
        }
    }
    let population_kind = table
        .field_index(population)
        .map(|idx| table.fields[idx].kind);
    if population_kind == Some(FieldKind::Text) {
        return Err(PipelineError::DataSource(format!(
            "column '{}' is not numeric",
            population
        ))
        .into());
    }

    let df = table.to_polars_df()?;

    let total = column_total(&df, population)?;

    let by_county = group_sums(&df, &[county], population)?
        .into_iter()
        .map(|(mut keys, sum)| (keys.remove(0), sum))
        .collect();

    let by_county_and_ward = group_sums(&df, &[county, ward], population)?
        .into_iter()
        .map(|(mut keys, sum)| {
            let ward_name = keys.pop().unwrap_or_default();
            let county_name = keys.pop().unwrap_or_default();
            ((county_name, ward_name), sum)
        })
        .collect();

    Ok(PopulationSummary {
        total,
        by_county,
        by_county_and_ward,
    })
}

fn column_total(df: &DataFrame, value: &str) -> Result<f64> {
    let totals = df
        .clone()
        .lazy()
        .select([col(value).cast(DataType::Float64).sum()])
        .collect()
        .context("Failed to sum population")?;
    Ok(totals.column(value)?.f64()?.get(0).unwrap_or(0.0))
}

/// Stable group-by over `keys` (cast to text) summing `value`
fn group_sums(df: &DataFrame, keys: &[&str], value: &str) -> Result<Vec<(Vec<String>, f64)>> {
    let not_null = keys
        .iter()
        .map(|k| col(*k).is_not_null())
        .reduce(|a, b| a.and(b))
        .unwrap_or_else(|| lit(true));
    let key_exprs: Vec<Expr> = keys
        .iter()
        .map(|k| col(*k).cast(DataType::String))
        .collect();

    let grouped = df
        .clone()
        .lazy()
        .filter(not_null)
        .group_by_stable(key_exprs)
        .agg([col(value).cast(DataType::Float64).sum()])
        .collect()
        .with_context(|| format!("Failed to group population by {:?}", keys))?;

    let key_columns = keys
        .iter()
        .map(|k| grouped.column(k).and_then(|c| c.str()))
        .collect::<PolarsResult<Vec<_>>>()?;
    let sums = grouped.column(value)?.f64()?;

    let rows = (0..grouped.height())
        .map(|row| {
            let key = key_columns
                .iter()
                .map(|ca| ca.get(row).unwrap_or_default().to_string())
                .collect();
            (key, sums.get(row).unwrap_or(0.0))
        })
        .collect();

    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_core::Crs;
    use crate::geometric::feature_collection::{AttributeValue, Field, FeatureCollection};
    use crate::geometric::spatial_join::{sjoin, JoinOptions};
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

    fn counties(names: &[(&str, f64)]) -> FeatureCollection {
        let mut counties = FeatureCollection::new(
            Some(Crs::epsg(2157)),
            vec![Field::new("CountyName", FieldKind::Text)],
        );
        for (name, x) in names {
            counties
                .push(square(*x, 0.0, 10.0), vec![(*name).into()])
                .unwrap();
        }
        counties
    }

    fn wards(rows: &[(&str, Option<i64>, f64)]) -> FeatureCollection {
        let mut wards = FeatureCollection::new(
            Some(Crs::epsg(2157)),
            vec![
                Field::new("Ward", FieldKind::Text),
                Field::new("Population", FieldKind::Integer),
            ],
        );
        for (name, population, x) in rows {
            let population = population
                .map(AttributeValue::Integer)
                .unwrap_or(AttributeValue::Null);
            wards
                .push(square(*x, 1.0, 1.0), vec![(*name).into(), population])
                .unwrap();
        }
        wards
    }

    #[test]
    fn test_two_wards_one_county() {
        let joined = sjoin(
            &wards(&[("W1", Some(1000), 1.0), ("W2", Some(3000), 4.0)]),
            &counties(&[("X", 0.0)]),
            &JoinOptions::default(),
        )
        .unwrap();

        let summary = summarise(&joined, "Population", "CountyName", "Ward").unwrap();
        assert_eq!(summary.total, 4000.0);
        assert_eq!(summary.by_county, vec![("X".to_string(), 4000.0)]);
        assert_eq!(summary.by_county_and_ward.len(), 2);
        let ward_sum: f64 = summary.by_county_and_ward.iter().map(|(_, v)| v).sum();
        assert_eq!(ward_sum, 4000.0);
        assert_eq!(summary.county_total("X"), Some(4000.0));
        assert_eq!(summary.county_total("Y"), None);
    }

    #[test]
    fn test_sums_are_consistent_and_ordered() {
        let joined = sjoin(
            &wards(&[
                ("B1", Some(200), 21.0),
                ("A1", Some(100), 1.0),
                ("B2", None, 23.0),
                ("A2", Some(50), 3.0),
            ]),
            &counties(&[("ARMAGH", 0.0), ("BELFAST", 20.0)]),
            &JoinOptions::default(),
        )
        .unwrap();

        let summary = summarise(&joined, "Population", "CountyName", "Ward").unwrap();
        assert_eq!(summary.total, 350.0);
        // first occurrence in the joined rows
        assert_eq!(
            summary.by_county,
            vec![("BELFAST".to_string(), 200.0), ("ARMAGH".to_string(), 150.0)]
        );
        let county_sum: f64 = summary.by_county.iter().map(|(_, v)| v).sum();
        let pair_sum: f64 = summary.by_county_and_ward.iter().map(|(_, v)| v).sum();
        assert_eq!(county_sum, summary.total);
        assert_eq!(pair_sum, summary.total);
        assert_eq!(
            summary.by_county_and_ward[0].0,
            ("BELFAST".to_string(), "B1".to_string())
        );
    }

    #[test]
    fn test_missing_column() {
        let joined = sjoin(
            &wards(&[("W1", Some(1000), 1.0)]),
            &counties(&[("X", 0.0)]),
            &JoinOptions::default(),
        )
        .unwrap();
        let err = summarise(&joined, "Pop2021", "CountyName", "Ward").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::DataSource(_))
        ));
    }

    #[test]
    fn test_empty_join() {
        let joined = sjoin(
            &wards(&[("Far", Some(10), 100.0)]),
            &counties(&[("X", 0.0)]),
            &JoinOptions::default(),
        )
        .unwrap();
        let summary = summarise(&joined, "Population", "CountyName", "Ward").unwrap();
        assert_eq!(summary.total, 0.0);
        assert!(summary.by_county.is_empty());
        assert!(summary.by_county_and_ward.is_empty());
    }
}
