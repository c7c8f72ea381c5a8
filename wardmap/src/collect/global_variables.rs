use std::path::PathBuf;

pub const DATA_PATH: &str = "./data_files";
pub const COUNTIES_FILE: &str = "counties.shp";
pub const WARDS_FILE: &str = "NI_wards.shp";
pub const OUTPUT_FILE: &str = "sample_map.png";

/// Irish Transverse Mercator, planar CRS used for the join
pub const ANALYSIS_EPSG: u32 = 2157;
/// Display projection for the map
pub const DISPLAY_UTM_ZONE: u8 = 29;

pub const POPULATION_COLUMN: &str = "Population";
pub const COUNTY_COLUMN: &str = "CountyName";
pub const WARD_COLUMN: &str = "Ward";

pub const LEFT_SUFFIX: &str = "left";
pub const RIGHT_SUFFIX: &str = "right";

/// Gridline longitudes / latitudes, degrees
pub const MERIDIANS: [f64; 6] = [-8.0, -7.5, -7.0, -6.5, -6.0, -5.5];
pub const PARALLELS: [f64; 4] = [54.0, 54.5, 55.0, 55.5];

pub const POPULATION_VMIN: f64 = 1000.0;
pub const POPULATION_VMAX: f64 = 8000.0;
pub const COLORBAR_LABEL: &str = "Resident Population";
/// Fraction of the axes width
pub const COLORBAR_SIZE: f64 = 0.05;
/// Inches
pub const COLORBAR_PAD: f64 = 0.1;

pub const LEGEND_LABEL: &str = "County Boundaries";
pub const LEGEND_FONT_SIZE: f64 = 12.0;

/// Inches
pub const FIGURE_SIZE: (f64, f64) = (10.0, 10.0);
pub const DISPLAY_DPI: u32 = 100;
pub const SAVE_DPI: u32 = 300;

pub fn get_data_path() -> PathBuf {
    PathBuf::from(DATA_PATH)
}

pub fn get_counties_path() -> PathBuf {
    get_data_path().join(COUNTIES_FILE)
}

pub fn get_wards_path() -> PathBuf {
    get_data_path().join(WARDS_FILE)
}

pub fn get_output_path() -> PathBuf {
    PathBuf::from(OUTPUT_FILE)
}
