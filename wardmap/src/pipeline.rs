use anyhow::{Context, Result};
use std::path::PathBuf;
use tracing::info;

use crate::collect::global_variables::{
    get_counties_path, get_wards_path, ANALYSIS_EPSG, COUNTY_COLUMN, POPULATION_COLUMN,
    WARD_COLUMN,
};
use crate::collect::vector_collect::load_vector;
use crate::commons::aggregate::{summarise, PopulationSummary};
use crate::geo_core::{reproject, Crs};
use crate::geometric::feature_collection::FeatureCollection;
use crate::geometric::spatial_join::{sjoin, JoinOptions, JoinedTable};
use crate::render::map_figure::{finish, render_map, MapFigure, MapStyle, OutputMode};

/// Inputs and settings of one pipeline run
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub counties_path: PathBuf,
    pub wards_path: PathBuf,
    /// Planar CRS both layers are joined in
    pub analysis_crs: Crs,
    pub population_column: String,
    pub county_column: String,
    pub ward_column: String,
    pub join: JoinOptions,
    pub style: MapStyle,
    pub output: OutputMode,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            counties_path: get_counties_path(),
            wards_path: get_wards_path(),
            analysis_crs: Crs::epsg(ANALYSIS_EPSG),
            population_column: POPULATION_COLUMN.to_string(),
            county_column: COUNTY_COLUMN.to_string(),
            ward_column: WARD_COLUMN.to_string(),
            join: JoinOptions::default(),
            style: MapStyle::default(),
            output: OutputMode::default(),
        }
    }
}

/// Everything a run produced, in the analysis CRS
#[derive(Debug, Clone)]
pub struct PipelineReport {
    pub counties: FeatureCollection,
    pub wards: FeatureCollection,
    pub joined: JoinedTable,
    pub summary: PopulationSummary,
    pub figure: MapFigure,
}

/// Load, reproject, join, aggregate and map
pub fn run(config: &PipelineConfig) -> Result<PipelineReport> {
    info!("Loading counties from {:?}", config.counties_path);
    let counties = load_vector(&config.counties_path).context("Failed to load counties")?;
    info!("Loading wards from {:?}", config.wards_path);
    let wards = load_vector(&config.wards_path).context("Failed to load wards")?;

    let (counties, wards) = prepare_layers(&counties, &wards, &config.analysis_crs)?;
    info!("Both layers in {}", config.analysis_crs);

    let (joined, summary) = analyse(&wards, &counties, config)?;
    info!(
        "Joined {} ward/county pairs, total population {}",
        joined.len(),
        summary.total
    );

    // Render at the output resolution when saving
    let mut style = config.style.clone();
    if let Some(dpi) = config.output.dpi() {
        style.dpi = dpi;
    }
    let figure = render_map(&wards, &counties, &style).context("Failed to render map")?;
    let figure = finish(figure, &config.output)?;

    Ok(PipelineReport {
        counties,
        wards,
        joined,
        summary,
        figure,
    })
}

/// Reproject counties and wards into the analysis CRS
pub fn prepare_layers(
    counties: &FeatureCollection,
    wards: &FeatureCollection,
    analysis_crs: &Crs,
) -> Result<(FeatureCollection, FeatureCollection)> {
    let counties = reproject(counties, analysis_crs).context("Failed to reproject counties")?;
    let wards = reproject(wards, analysis_crs).context("Failed to reproject wards")?;
    Ok((counties, wards))
}

/// Join wards against counties and sum population
pub fn analyse(
    wards: &FeatureCollection,
    counties: &FeatureCollection,
    config: &PipelineConfig,
) -> Result<(JoinedTable, PopulationSummary)> {
    let joined = sjoin(wards, counties, &config.join).context("Failed to join wards to counties")?;
    let summary = summarise(
        &joined,
        &config.population_column,
        &config.county_column,
        &config.ward_column,
    )?;
    Ok((joined, summary))
}
