// Example: rendering the ward map from in-memory GeoJSON
// Two counties and three wards in WGS84, joined in Irish Transverse Mercator
use anyhow::Result;
use wardmap::collect::vector_collect::from_geojson;
use wardmap::commons::aggregate::summarise;
use wardmap::geo_core::Crs;
use wardmap::geometric::spatial_join::{sjoin, JoinOptions};
use wardmap::pipeline::prepare_layers;
use wardmap::render::map_figure::{finish, render_map, MapStyle, OutputMode};

fn main() -> Result<()> {
    println!("=== Example: ward map from GeoJSON ===\n");

    let counties_geojson = r#"
    {
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "CountyName": "ANTRIM" },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [-6.6, 54.5], [-5.9, 54.5], [-5.9, 55.2], [-6.6, 55.2], [-6.6, 54.5]
                    ]]
                }
            },
            {
                "type": "Feature",
                "properties": { "CountyName": "DOWN" },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [-6.3, 54.1], [-5.5, 54.1], [-5.5, 54.5], [-6.3, 54.5], [-6.3, 54.1]
                    ]]
                }
            }
        ]
    }
    "#;

    let wards_geojson = r#"
    {
        "type": "FeatureCollection",
        "features": [
            {
                "type": "Feature",
                "properties": { "Ward": "Glenariff", "Population": 2100 },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [-6.2, 55.0], [-6.0, 55.0], [-6.0, 55.1], [-6.2, 55.1], [-6.2, 55.0]
                    ]]
                }
            },
            {
                "type": "Feature",
                "properties": { "Ward": "Lisburn North", "Population": 7400 },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [-6.1, 54.45], [-6.0, 54.45], [-6.0, 54.55], [-6.1, 54.55], [-6.1, 54.45]
                    ]]
                }
            },
            {
                "type": "Feature",
                "properties": { "Ward": "Newcastle", "Population": 4600 },
                "geometry": {
                    "type": "Polygon",
                    "coordinates": [[
                        [-5.95, 54.2], [-5.85, 54.2], [-5.85, 54.3], [-5.95, 54.3], [-5.95, 54.2]
                    ]]
                }
            }
        ]
    }
    "#;

    // None uses WGS84
    let counties = from_geojson(counties_geojson.as_bytes(), None)?;
    let wards = from_geojson(wards_geojson.as_bytes(), None)?;
    println!("Counties loaded: {}", counties.len());
    println!("Wards loaded: {}", wards.len());

    let (counties, wards) = prepare_layers(&counties, &wards, &Crs::epsg(2157))?;
    println!("Reprojected to {:?}", wards.crs());

    // Lisburn North straddles the county line and is counted in both
    let joined = sjoin(&wards, &counties, &JoinOptions::default())?;
    println!("\nJoined rows: {}", joined.len());
    println!("{}", joined.to_polars_df()?);

    let summary = summarise(&joined, "Population", "CountyName", "Ward")?;
    println!("\n{}", summary);

    let style = MapStyle::default();
    let figure = render_map(&wards, &counties, &style)?;
    let figure = finish(
        figure,
        &OutputMode::Save {
            path: "synthetic_map.png".into(),
            dpi: style.dpi,
        },
    )?;
    println!(
        "Map written: synthetic_map.png ({}x{} px before cropping)",
        figure.width(),
        figure.height()
    );

    Ok(())
}
