use anyhow::{Context, Result};
use geo::{MapCoords, MultiPolygon, Point, Rect};
use proj::Proj;
use std::fmt;
use tracing::debug;

use crate::error::PipelineError;
use crate::geometric::feature_collection::{Feature, FeatureCollection};

/// Coordinate Reference System tag
/// Holds a definition PROJ understands: `EPSG:<code>`, a PROJ string or WKT
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Crs {
    definition: String,
}

impl Crs {
    pub fn epsg(code: u32) -> Self {
        Crs {
            definition: format!("EPSG:{}", code),
        }
    }

    /// WGS 84 / UTM zone `zone` north (EPSG:326zz)
    pub fn utm_north(zone: u8) -> Self {
        Crs::epsg(32600 + zone as u32)
    }

    pub fn wgs84() -> Self {
        Crs::epsg(4326)
    }

    /// Authority strings are normalised to `EPSG:<code>`
    pub fn from_definition(definition: &str) -> Self {
        let trimmed = definition.trim();
        if let Some((authority, code)) = trimmed.split_once(':') {
            if authority.eq_ignore_ascii_case("epsg") {
                if let Ok(code) = code.trim().parse::<u32>() {
                    return Crs::epsg(code);
                }
            }
        }
        Crs {
            definition: trimmed.to_string(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.definition
    }

    pub fn epsg_code(&self) -> Option<u32> {
        self.definition
            .strip_prefix("EPSG:")
            .and_then(|code| code.parse().ok())
    }
}

impl fmt::Display for Crs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.definition)
    }
}

/// CRS transformation helpers
pub struct GeoCore;

impl GeoCore {
    /// Build a PROJ pipeline between two CRSs, axis order normalised to (x/lon, y/lat)
    pub fn transformer(from: &Crs, to: &Crs) -> Result<Proj> {
        Proj::new_known_crs(from.as_str(), to.as_str(), None).map_err(|e| {
            PipelineError::Projection(format!(
                "cannot build transformation {} -> {}: {}",
                from, to, e
            ))
            .into()
        })
    }

    /// Transform coordinates from one CRS to another
    pub fn transform_coords(from: &Crs, to: &Crs, x: f64, y: f64) -> Result<(f64, f64)> {
        let proj = Self::transformer(from, to)?;
        let result = proj
            .convert((x, y))
            .map_err(|e| PipelineError::Projection(e.to_string()))
            .context("Failed to transform coordinates")?;
        Ok(result)
    }

    /// Transform a Point from one CRS to another
    pub fn transform_point(from: &Crs, to: &Crs, point: Point<f64>) -> Result<Point<f64>> {
        let (x, y) = Self::transform_coords(from, to, point.x(), point.y())?;
        Ok(Point::new(x, y))
    }

    /// Transform every vertex of a multipolygon with a prepared pipeline
    pub fn transform_multipolygon(
        proj: &Proj,
        geometry: &MultiPolygon<f64>,
    ) -> Result<MultiPolygon<f64>> {
        geometry
            .try_map_coords(|c| {
                proj.convert((c.x, c.y))
                    .map(|(x, y)| geo::coord! { x: x, y: y })
            })
            .map_err(|e| PipelineError::Projection(e.to_string()).into())
    }
}

/// Reproject a collection into `target`
/// Following geopandas `to_crs`: attributes and record order are kept,
/// a collection already in `target` is returned unchanged
pub fn reproject(collection: &FeatureCollection, target: &Crs) -> Result<FeatureCollection> {
    let source = collection.crs().ok_or_else(|| {
        PipelineError::Projection(
            "cannot reproject a collection without a CRS; set one first".to_string(),
        )
    })?;

    if source == target {
        debug!("Collection already in {}, skipping reprojection", target);
        return Ok(collection.clone());
    }

    let proj = GeoCore::transformer(source, target)?;

    let features = collection
        .features
        .iter()
        .enumerate()
        .map(|(idx, feature)| {
            let geometry = GeoCore::transform_multipolygon(&proj, &feature.geometry)
                .with_context(|| format!("Failed to reproject record {}", idx))?;
            Ok(Feature {
                geometry,
                attributes: feature.attributes.clone(),
            })
        })
        .collect::<Result<Vec<_>>>()?;

    debug!(
        "Reprojected {} records from {} to {}",
        features.len(),
        source,
        target
    );

    Ok(FeatureCollection {
        crs: Some(target.clone()),
        fields: collection.fields.clone(),
        features,
    })
}

/// Bounding box structure
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    pub fn from_rect(rect: Rect<f64>) -> Self {
        BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn is_degenerate(&self) -> bool {
        !(self.width() > 0.0 && self.height() > 0.0)
    }

    pub fn union(&self, other: &BoundingBox) -> BoundingBox {
        BoundingBox::new(
            self.min_x.min(other.min_x),
            self.min_y.min(other.min_y),
            self.max_x.max(other.max_x),
            self.max_y.max(other.max_y),
        )
    }

    /// Grow by `fraction` of each side on every edge
    pub fn pad(&self, fraction: f64) -> BoundingBox {
        let dx = self.width() * fraction;
        let dy = self.height() * fraction;
        BoundingBox::new(
            self.min_x - dx,
            self.min_y - dy,
            self.max_x + dx,
            self.max_y + dy,
        )
    }

    /// Widen one axis around the centre so width / height == `aspect`
    /// Used to keep map units square on screen
    pub fn expand_to_aspect(&self, aspect: f64) -> BoundingBox {
        let cx = (self.min_x + self.max_x) / 2.0;
        let cy = (self.min_y + self.max_y) / 2.0;
        let (mut w, mut h) = (self.width(), self.height());
        if w / h < aspect {
            w = h * aspect;
        } else {
            h = w / aspect;
        }
        BoundingBox::new(cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0)
    }

    /// Transform bounding box corners to another CRS
    pub fn transform(&self, from: &Crs, to: &Crs) -> Result<Self> {
        let (min_x, min_y) = GeoCore::transform_coords(from, to, self.min_x, self.min_y)?;
        let (max_x, max_y) = GeoCore::transform_coords(from, to, self.max_x, self.max_y)?;

        Ok(BoundingBox::new(min_x, min_y, max_x, max_y))
    }
}
