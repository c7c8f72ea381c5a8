use anyhow::Result;
use wardmap::pipeline::{run, PipelineConfig};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    println!("=== Northern Ireland ward population map ===\n");

    let config = PipelineConfig::default();
    let report = run(&config)?;

    println!("Counties ({} records, CRS {}):", report.counties.len(), config.analysis_crs);
    println!("{}", report.counties.head(5)?);
    println!("\nWards ({} records, CRS {}):", report.wards.len(), config.analysis_crs);
    println!("{}", report.wards.head(5)?);

    println!("\nJoined table ({} rows):", report.joined.len());
    println!("{}", report.joined.to_polars_df()?.head(Some(5)));

    println!("\n{}", report.summary);

    println!(
        "Map: {}x{} px at {} dpi in {}",
        report.figure.width(),
        report.figure.height(),
        report.figure.dpi(),
        report.figure.crs()
    );

    Ok(())
}
