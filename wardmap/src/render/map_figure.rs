use anyhow::{Context, Result};
use image::{imageops, RgbImage};
use plotters::coord::Shift;
use plotters::prelude::*;
use plotters::style::text_anchor::{HPos, Pos, VPos};
use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::collect::global_variables::{
    get_output_path, COLORBAR_LABEL, COLORBAR_PAD, COLORBAR_SIZE, DISPLAY_DPI,
    DISPLAY_UTM_ZONE, FIGURE_SIZE, LEGEND_FONT_SIZE, LEGEND_LABEL, MERIDIANS, PARALLELS,
    POPULATION_COLUMN, POPULATION_VMAX, POPULATION_VMIN, SAVE_DPI,
};
use crate::error::PipelineError;
use crate::geo_core::{reproject, BoundingBox, Crs, GeoCore};
use crate::geometric::feature_collection::FeatureCollection;
use crate::render::colormap::{ColorScale, Colormap};
use crate::render::legend::{generate_handles, HandleStyle, Legend, LegendLocation, Paint};

type Area<'a> = DrawingArea<BitMapBackend<'a>, Shift>;

const FONT: &str = "sans-serif";
const BACKGROUND: [u8; 3] = [255, 255, 255];
/// Points sampled along each gridline
const GRID_SAMPLES: usize = 200;
/// Steps in the colorbar gradient
const COLORBAR_STEPS: usize = 256;

/// Sides of the axes that carry gridline labels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridLabels {
    pub left: bool,
    pub right: bool,
    pub top: bool,
    pub bottom: bool,
}

/// Meridians and parallels (degrees) drawn over the map
#[derive(Debug, Clone, PartialEq)]
pub struct Graticule {
    pub meridians: Vec<f64>,
    pub parallels: Vec<f64>,
    pub labels: GridLabels,
}

impl Default for Graticule {
    fn default() -> Self {
        Graticule {
            meridians: MERIDIANS.to_vec(),
            parallels: PARALLELS.to_vec(),
            labels: GridLabels {
                left: true,
                right: false,
                top: true,
                bottom: false,
            },
        }
    }
}

/// Styling of the ward population map
#[derive(Debug, Clone, PartialEq)]
pub struct MapStyle {
    /// Inches
    pub figure_size: (f64, f64),
    pub dpi: u32,
    pub display_crs: Crs,
    pub graticule: Graticule,
    /// Ward attribute driving the fill colour
    pub column: String,
    pub colormap: Colormap,
    pub vmin: f64,
    pub vmax: f64,
    pub colorbar_label: String,
    /// Fraction of the axes width
    pub colorbar_size: f64,
    /// Inches between axes and colorbar
    pub colorbar_pad: f64,
    pub county_edge: Paint,
    pub legend_label: String,
    pub legend_location: LegendLocation,
    /// Points
    pub legend_font_size: f64,
    pub legend_frame_alpha: f64,
    /// Points
    pub tick_font_size: f64,
}

impl Default for MapStyle {
    fn default() -> Self {
        MapStyle {
            figure_size: FIGURE_SIZE,
            dpi: DISPLAY_DPI,
            display_crs: Crs::utm_north(DISPLAY_UTM_ZONE),
            graticule: Graticule::default(),
            column: POPULATION_COLUMN.to_string(),
            colormap: Colormap::Viridis,
            vmin: POPULATION_VMIN,
            vmax: POPULATION_VMAX,
            colorbar_label: COLORBAR_LABEL.to_string(),
            colorbar_size: COLORBAR_SIZE,
            colorbar_pad: COLORBAR_PAD,
            county_edge: Paint::RED,
            legend_label: LEGEND_LABEL.to_string(),
            legend_location: LegendLocation::UpperLeft,
            legend_font_size: LEGEND_FONT_SIZE,
            legend_frame_alpha: 1.0,
            tick_font_size: 10.0,
        }
    }
}

/// What to do with a rendered figure
#[derive(Debug, Clone, PartialEq)]
pub enum OutputMode {
    /// Keep the figure in memory for the caller
    Display,
    /// Write a PNG cropped to its content
    Save { path: PathBuf, dpi: u32 },
}

impl Default for OutputMode {
    fn default() -> Self {
        OutputMode::Save {
            path: get_output_path(),
            dpi: SAVE_DPI,
        }
    }
}

impl OutputMode {
    pub fn dpi(&self) -> Option<u32> {
        match self {
            OutputMode::Display => None,
            OutputMode::Save { dpi, .. } => Some(*dpi),
        }
    }
}

/// A rendered map: RGB raster plus the parameters it was drawn with
#[derive(Debug, Clone)]
pub struct MapFigure {
    width: u32,
    height: u32,
    dpi: u32,
    crs: Crs,
    extent: BoundingBox,
    legend: Legend,
    pixels: Vec<u8>,
}

impl MapFigure {
    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dpi(&self) -> u32 {
        self.dpi
    }

    /// Projection the map axes are drawn in
    pub fn crs(&self) -> &Crs {
        &self.crs
    }

    /// Visible map extent in display coordinates
    pub fn extent(&self) -> &BoundingBox {
        &self.extent
    }

    pub fn legend(&self) -> &Legend {
        &self.legend
    }

    /// Row-major RGB8 buffer
    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    /// Crop window (x, y, width, height) around drawn content, padded by 0.1 in
    pub fn tight_bounds(&self) -> (u32, u32, u32, u32) {
        let Some((x0, y0, x1, y1)) =
            content_bounds(&self.pixels, self.width, self.height, BACKGROUND)
        else {
            return (0, 0, self.width, self.height);
        };
        let pad = (0.1 * self.dpi as f64).round() as u32;
        let x0 = x0.saturating_sub(pad);
        let y0 = y0.saturating_sub(pad);
        let x1 = (x1 + pad).min(self.width - 1);
        let y1 = (y1 + pad).min(self.height - 1);
        (x0, y0, x1 - x0 + 1, y1 - y0 + 1)
    }

    /// Write the figure as a PNG cropped to its content, resolution in the pHYs chunk
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let image = RgbImage::from_raw(self.width, self.height, self.pixels.clone())
            .ok_or_else(|| PipelineError::Rendering("figure buffer has the wrong size".into()))?;
        let (x, y, w, h) = self.tight_bounds();
        let cropped = imageops::crop_imm(&image, x, y, w, h).to_image();
        write_png(path, &cropped, self.dpi)
            .with_context(|| format!("Failed to write map to {}", path.display()))?;
        info!(
            "Map saved to {} ({}x{} px at {} dpi)",
            path.display(),
            w,
            h,
            self.dpi
        );
        Ok(())
    }
}

/// Show or save a rendered figure
///
/// `Display` hands the figure back untouched; there is no window system, the
/// caller owns the raster. `Save` writes a PNG with a tight crop and fails
/// when the figure was not rendered at the requested dpi.
pub fn finish(figure: MapFigure, mode: &OutputMode) -> Result<MapFigure> {
    match mode {
        OutputMode::Display => {
            debug!("Keeping {}x{} figure in memory", figure.width, figure.height);
        }
        OutputMode::Save { path, dpi } => {
            if *dpi != figure.dpi {
                return Err(PipelineError::Rendering(format!(
                    "figure was rendered at {} dpi but {} dpi was requested; render with the save resolution",
                    figure.dpi, dpi
                ))
                .into());
            }
            figure.save(path)?;
        }
    }
    Ok(figure)
}

/// The single "County Boundaries" entry: unfilled, county edge colour
pub(crate) fn build_legend(style: &MapStyle) -> Result<Legend> {
    let handles = generate_handles(
        &[style.legend_label.as_str()],
        &[Paint::None],
        HandleStyle {
            edge: style.county_edge,
            alpha: 1.0,
        },
    )?;
    Ok(Legend {
        handles,
        location: style.legend_location,
        font_size: style.legend_font_size,
        frame_alpha: style.legend_frame_alpha,
    })
}

/// Draw the ward choropleth with county outlines, gridlines, colorbar and legend
///
/// Both layers are reprojected into `style.display_crs` first. Wards with a
/// null value in `style.column` are left unfilled.
pub fn render_map(
    wards: &FeatureCollection,
    counties: &FeatureCollection,
    style: &MapStyle,
) -> Result<MapFigure> {
    if wards.is_empty() {
        return Err(PipelineError::Rendering("ward layer is empty, nothing to draw".into()).into());
    }
    let column = wards.field_index(&style.column).ok_or_else(|| {
        PipelineError::DataSource(format!("ward layer has no column '{}'", style.column))
    })?;
    if !(style.vmax > style.vmin) {
        return Err(PipelineError::Rendering(format!(
            "empty colour range {}..{}",
            style.vmin, style.vmax
        ))
        .into());
    }

    let wards = reproject(wards, &style.display_crs).context("Failed to project wards for display")?;
    let counties =
        reproject(counties, &style.display_crs).context("Failed to project counties for display")?;

    let data_extent = match (wards.bounding_box(), counties.bounding_box()) {
        (Some(w), Some(c)) => w.union(&c),
        (Some(w), None) => w,
        _ => return Err(PipelineError::Rendering("map extent is empty".into()).into()),
    };
    if data_extent.is_degenerate() {
        return Err(PipelineError::Rendering(format!(
            "map extent is empty: {:?}",
            data_extent
        ))
        .into());
    }

    let layout = Layout::new(style);
    let extent = data_extent.pad(0.02).expand_to_aspect(layout.axes_aspect());
    let grid = graticule_lines(style, &extent)?;
    let legend = build_legend(style)?;

    let mut pixels = vec![BACKGROUND[0]; (layout.width * layout.height * 3) as usize];
    let scene = Scene {
        wards: &wards,
        column,
        counties: &counties,
        extent,
        grid: &grid,
        legend: &legend,
    };
    draw_figure(&mut pixels, &layout, &scene, style)?;

    info!(
        "Rendered {} wards and {} counties in {} ({}x{} px)",
        wards.len(),
        counties.len(),
        style.display_crs,
        layout.width,
        layout.height
    );

    Ok(MapFigure {
        width: layout.width,
        height: layout.height,
        dpi: style.dpi,
        crs: style.display_crs.clone(),
        extent,
        legend,
        pixels,
    })
}

/// Pixel geometry of the figure: axes box, gap and colorbar
struct Layout {
    width: u32,
    height: u32,
    left: i32,
    right: i32,
    top: i32,
    bottom: i32,
    axes_width: i32,
    pad: i32,
    colorbar_width: i32,
}

impl Layout {
    fn new(style: &MapStyle) -> Self {
        let dpi = style.dpi as f64;
        let width = (style.figure_size.0 * dpi).round().max(1.0) as u32;
        let height = (style.figure_size.1 * dpi).round().max(1.0) as u32;
        let (w, h) = (width as f64, height as f64);

        let left = (0.125 * w) as i32;
        let right = (0.10 * w) as i32;
        let top = (0.12 * h) as i32;
        let bottom = (0.11 * h) as i32;
        let pad = (style.colorbar_pad * dpi).round() as i32;
        let inner = (width as i32 - left - right - pad).max(2);
        let axes_width = ((inner as f64) / (1.0 + style.colorbar_size)).round() as i32;
        let colorbar_width = ((axes_width as f64) * style.colorbar_size).round().max(1.0) as i32;

        Layout {
            width,
            height,
            left,
            right,
            top,
            bottom,
            axes_width,
            pad,
            colorbar_width,
        }
    }

    fn axes_height(&self) -> i32 {
        (self.height as i32 - self.top - self.bottom).max(1)
    }

    fn axes_aspect(&self) -> f64 {
        self.axes_width.max(1) as f64 / self.axes_height() as f64
    }
}

/// Everything the drawing pass needs, already in display coordinates
struct Scene<'a> {
    wards: &'a FeatureCollection,
    column: usize,
    counties: &'a FeatureCollection,
    extent: BoundingBox,
    grid: &'a [GridLine],
    legend: &'a Legend,
}

fn points_to_pixels(points: f64, dpi: u32) -> f64 {
    points * dpi as f64 / 72.0
}

fn draw_figure(pixels: &mut [u8], layout: &Layout, scene: &Scene, style: &MapStyle) -> Result<()> {
    let root = BitMapBackend::with_buffer(pixels, (layout.width, layout.height)).into_drawing_area();
    root.fill(&WHITE).map_err(PipelineError::rendering)?;

    let inner = root.margin(layout.top, layout.bottom, layout.left, layout.right);
    let (axes, rest) = inner.split_horizontally(layout.axes_width);
    let (_, rest) = rest.split_horizontally(layout.pad);
    let (colorbar, _) = rest.split_horizontally(layout.colorbar_width);

    let extent = &scene.extent;
    let mut chart = ChartBuilder::on(&axes)
        .build_cartesian_2d(extent.min_x..extent.max_x, extent.min_y..extent.max_y)
        .map_err(PipelineError::rendering)?;

    let line_width = (style.dpi / 100).max(1);
    let scale = ColorScale::new(style.colormap, style.vmin, style.vmax);

    // Choropleth; interior rings are not cut out of the fill
    let mut unfilled = 0usize;
    let mut patches = Vec::new();
    for feature in &scene.wards.features {
        let Some(value) = feature.attributes[scene.column].as_f64() else {
            unfilled += 1;
            continue;
        };
        let color = scale.color_for(value);
        for polygon in &feature.geometry.0 {
            let ring: Vec<(f64, f64)> = polygon.exterior().coords().map(|c| (c.x, c.y)).collect();
            patches.push(Polygon::new(ring, color.filled()));
        }
    }
    if unfilled > 0 {
        warn!("{} wards have no '{}' value and are left blank", unfilled, style.column);
    }
    chart.draw_series(patches).map_err(PipelineError::rendering)?;

    if let Some(edge) = style.county_edge.to_rgb() {
        let outlines = scene.counties.features.iter().flat_map(|feature| {
            feature.geometry.0.iter().flat_map(|polygon| {
                std::iter::once(polygon.exterior())
                    .chain(polygon.interiors())
                    .map(|ring| ring.coords().map(|c| (c.x, c.y)).collect::<Vec<_>>())
            })
        });
        chart
            .draw_series(outlines.map(|ring| PathElement::new(ring, edge.stroke_width(line_width))))
            .map_err(PipelineError::rendering)?;
    }

    let grid_style = RGBColor(128, 128, 128).mix(0.5).stroke_width(line_width);
    chart
        .draw_series(scene.grid.iter().flat_map(|line| {
            line.runs
                .iter()
                .map(move |run| PathElement::new(run.clone(), grid_style))
        }))
        .map_err(PipelineError::rendering)?;

    let (ax, ay) = axes.get_pixel_range();
    root.draw(&Rectangle::new(
        [(ax.start, ay.start), (ax.end - 1, ay.end - 1)],
        BLACK.stroke_width(line_width),
    ))
    .map_err(PipelineError::rendering)?;

    // Gridline labels sit outside the axes, in root pixel coordinates
    let tick_px = points_to_pixels(style.tick_font_size, style.dpi);
    let gap = (0.3 * tick_px).round() as i32;
    let labels = &style.graticule.labels;
    for line in scene.grid {
        let sides = [
            (labels.top, Side::Top),
            (labels.bottom, Side::Bottom),
            (labels.left, Side::Left),
            (labels.right, Side::Right),
        ];
        for (enabled, side) in sides {
            if !enabled {
                continue;
            }
            let Some(anchor) = line.label_anchor(side, extent) else {
                continue;
            };
            let (px, py) = chart.backend_coord(&anchor);
            let (pos, at) = match side {
                Side::Top => (Pos::new(HPos::Center, VPos::Bottom), (px, py - gap)),
                Side::Bottom => (Pos::new(HPos::Center, VPos::Top), (px, py + gap)),
                Side::Left => (Pos::new(HPos::Right, VPos::Center), (px - gap, py)),
                Side::Right => (Pos::new(HPos::Left, VPos::Center), (px + gap, py)),
            };
            let text_style = TextStyle::from((FONT, tick_px).into_font()).pos(pos);
            root.draw_text(&line.label(), &text_style, at)
                .map_err(PipelineError::rendering)?;
        }
    }

    draw_colorbar(&root, &colorbar, &scale, style)?;
    draw_legend(&root, &axes, scene.legend, style.dpi)?;

    root.present().map_err(PipelineError::rendering)?;
    Ok(())
}

fn draw_colorbar(root: &Area, area: &Area, scale: &ColorScale, style: &MapStyle) -> Result<()> {
    let mut bar = ChartBuilder::on(area)
        .build_cartesian_2d(0.0..1.0, scale.vmin..scale.vmax)
        .map_err(PipelineError::rendering)?;

    let step = (scale.vmax - scale.vmin) / COLORBAR_STEPS as f64;
    bar.draw_series((0..COLORBAR_STEPS).map(|i| {
        let v0 = scale.vmin + step * i as f64;
        let v1 = v0 + step;
        Rectangle::new([(0.0, v0), (1.0, v1)], scale.color_for(v0 + step / 2.0).filled())
    }))
    .map_err(PipelineError::rendering)?;

    let (bx, by) = area.get_pixel_range();
    root.draw(&Rectangle::new(
        [(bx.start, by.start), (bx.end - 1, by.end - 1)],
        BLACK.stroke_width(1),
    ))
    .map_err(PipelineError::rendering)?;

    let tick_px = points_to_pixels(style.tick_font_size, style.dpi);
    let tick_len = (0.35 * tick_px).round() as i32;
    let gap = (0.3 * tick_px).round() as i32;
    let tick_style =
        TextStyle::from((FONT, tick_px).into_font()).pos(Pos::new(HPos::Left, VPos::Center));

    let mut widest = 0i32;
    for tick in scale.ticks(8) {
        let (px, py) = bar.backend_coord(&(1.0, tick));
        root.draw(&PathElement::new(
            vec![(px, py), (px + tick_len, py)],
            BLACK.stroke_width(1),
        ))
        .map_err(PipelineError::rendering)?;
        let text = format!("{:.0}", tick);
        let (w, _) = root
            .estimate_text_size(&text, &tick_style)
            .map_err(PipelineError::rendering)?;
        widest = widest.max(w as i32);
        root.draw_text(&text, &tick_style, (px + tick_len + gap, py))
            .map_err(PipelineError::rendering)?;
    }

    let label_style = TextStyle::from((FONT, tick_px).into_font().transform(FontTransform::Rotate270))
        .pos(Pos::new(HPos::Center, VPos::Center));
    let label_x = bx.end + tick_len + 2 * gap + widest + (tick_px / 2.0).round() as i32;
    let label_y = (by.start + by.end) / 2;
    root.draw_text(&style.colorbar_label, &label_style, (label_x, label_y))
        .map_err(PipelineError::rendering)?;

    Ok(())
}

fn draw_legend(root: &Area, axes: &Area, legend: &Legend, dpi: u32) -> Result<()> {
    if legend.handles.is_empty() {
        return Ok(());
    }
    let font_px = points_to_pixels(legend.font_size, dpi);
    let text_style =
        TextStyle::from((FONT, font_px).into_font()).pos(Pos::new(HPos::Left, VPos::Center));

    let em = |f: f64| (f * font_px).round() as i32;
    let (pad, swatch_w, swatch_h, gap, row_h, border) =
        (em(0.4), em(2.0), em(0.7), em(0.8), em(1.3), em(0.5));

    let mut text_w = 0i32;
    for handle in &legend.handles {
        let (w, _) = root
            .estimate_text_size(&handle.label, &text_style)
            .map_err(PipelineError::rendering)?;
        text_w = text_w.max(w as i32);
    }
    let box_w = 2 * pad + swatch_w + gap + text_w;
    let box_h = 2 * pad + row_h * legend.handles.len() as i32;

    let (ax, ay) = axes.get_pixel_range();
    let x0 = match legend.location {
        LegendLocation::UpperLeft | LegendLocation::LowerLeft => ax.start + border,
        LegendLocation::UpperRight | LegendLocation::LowerRight => ax.end - border - box_w,
    };
    let y0 = match legend.location {
        LegendLocation::UpperLeft | LegendLocation::UpperRight => ay.start + border,
        LegendLocation::LowerLeft | LegendLocation::LowerRight => ay.end - border - box_h,
    };

    let frame = [(x0, y0), (x0 + box_w, y0 + box_h)];
    root.draw(&Rectangle::new(frame, WHITE.mix(legend.frame_alpha).filled()))
        .map_err(PipelineError::rendering)?;
    root.draw(&Rectangle::new(frame, RGBColor(204, 204, 204).stroke_width(1)))
        .map_err(PipelineError::rendering)?;

    let line_width = (dpi / 100).max(1);
    for (row, handle) in legend.handles.iter().enumerate() {
        let cy = y0 + pad + row_h * row as i32 + row_h / 2;
        let sx = x0 + pad;
        let swatch = [(sx, cy - swatch_h / 2), (sx + swatch_w, cy + swatch_h / 2)];
        if let Some(fill) = handle.fill.to_rgb() {
            root.draw(&Rectangle::new(swatch, fill.mix(handle.alpha).filled()))
                .map_err(PipelineError::rendering)?;
        }
        if let Some(edge) = handle.edge.to_rgb() {
            root.draw(&Rectangle::new(
                swatch,
                edge.mix(handle.alpha).stroke_width(line_width),
            ))
            .map_err(PipelineError::rendering)?;
        }
        root.draw_text(&handle.label, &text_style, (sx + swatch_w + gap, cy))
            .map_err(PipelineError::rendering)?;
    }

    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Side {
    Top,
    Bottom,
    Left,
    Right,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum GridKind {
    Meridian,
    Parallel,
}

/// One meridian or parallel, clipped to the map extent
#[derive(Debug, Clone, PartialEq)]
struct GridLine {
    kind: GridKind,
    /// Degrees
    value: f64,
    /// Consecutive in-extent stretches, display coordinates
    runs: Vec<Vec<(f64, f64)>>,
}

impl GridLine {
    fn label(&self) -> String {
        match self.kind {
            GridKind::Meridian => format_longitude(self.value),
            GridKind::Parallel => format_latitude(self.value),
        }
    }

    /// Where the line meets `side` of the extent, if it gets there
    fn label_anchor(&self, side: Side, extent: &BoundingBox) -> Option<(f64, f64)> {
        let points = self.runs.iter().flatten();
        let tol_x = extent.width() * 0.02;
        let tol_y = extent.height() * 0.02;
        match (self.kind, side) {
            (GridKind::Meridian, Side::Top) => points
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .filter(|p| p.1 >= extent.max_y - tol_y)
                .map(|p| (p.0, extent.max_y)),
            (GridKind::Meridian, Side::Bottom) => points
                .min_by(|a, b| a.1.total_cmp(&b.1))
                .filter(|p| p.1 <= extent.min_y + tol_y)
                .map(|p| (p.0, extent.min_y)),
            (GridKind::Parallel, Side::Left) => points
                .min_by(|a, b| a.0.total_cmp(&b.0))
                .filter(|p| p.0 <= extent.min_x + tol_x)
                .map(|p| (extent.min_x, p.1)),
            (GridKind::Parallel, Side::Right) => points
                .max_by(|a, b| a.0.total_cmp(&b.0))
                .filter(|p| p.0 >= extent.max_x - tol_x)
                .map(|p| (extent.max_x, p.1)),
            _ => None,
        }
    }
}

pub(crate) fn format_longitude(lon: f64) -> String {
    let hemisphere = if lon < 0.0 {
        "W"
    } else if lon > 0.0 {
        "E"
    } else {
        ""
    };
    format!("{}°{}", lon.abs(), hemisphere)
}

pub(crate) fn format_latitude(lat: f64) -> String {
    let hemisphere = if lat < 0.0 {
        "S"
    } else if lat > 0.0 {
        "N"
    } else {
        ""
    };
    format!("{}°{}", lat.abs(), hemisphere)
}

/// Project the graticule into the display CRS and clip it to `extent`
fn graticule_lines(style: &MapStyle, extent: &BoundingBox) -> Result<Vec<GridLine>> {
    let graticule = &style.graticule;
    if graticule.meridians.is_empty() && graticule.parallels.is_empty() {
        return Ok(Vec::new());
    }
    let geographic = Crs::wgs84();
    let to_display = GeoCore::transformer(&geographic, &style.display_crs)?;
    let to_geographic = GeoCore::transformer(&style.display_crs, &geographic)?;

    // Lon/lat window covered by the extent, from its corners and edge midpoints
    let cx = (extent.min_x + extent.max_x) / 2.0;
    let cy = (extent.min_y + extent.max_y) / 2.0;
    let samples = [
        (extent.min_x, extent.min_y),
        (extent.min_x, cy),
        (extent.min_x, extent.max_y),
        (cx, extent.max_y),
        (extent.max_x, extent.max_y),
        (extent.max_x, cy),
        (extent.max_x, extent.min_y),
        (cx, extent.min_y),
    ];
    let mut window = BoundingBox::new(f64::MAX, f64::MAX, f64::MIN, f64::MIN);
    for sample in samples {
        let (lon, lat) = to_geographic
            .convert(sample)
            .map_err(|e| PipelineError::Projection(e.to_string()))?;
        window = window.union(&BoundingBox::new(lon, lat, lon, lat));
    }
    let window = window.pad(0.1);

    let lines = trace_graticule(
        graticule,
        (window.min_x, window.max_x),
        (window.min_y, window.max_y),
        extent,
        |lon, lat| to_display.convert((lon, lat)).ok(),
    );
    debug!("Traced {} gridlines across the map", lines.len());
    Ok(lines)
}

fn trace_graticule<F>(
    graticule: &Graticule,
    lon_range: (f64, f64),
    lat_range: (f64, f64),
    extent: &BoundingBox,
    project: F,
) -> Vec<GridLine>
where
    F: Fn(f64, f64) -> Option<(f64, f64)>,
{
    let inside = |(x, y): (f64, f64)| {
        x >= extent.min_x && x <= extent.max_x && y >= extent.min_y && y <= extent.max_y
    };
    let sample = |from: f64, to: f64, k: usize| from + (to - from) * k as f64 / GRID_SAMPLES as f64;

    let trace = |kind: GridKind, value: f64| {
        let mut runs: Vec<Vec<(f64, f64)>> = Vec::new();
        let mut current = Vec::new();
        for k in 0..=GRID_SAMPLES {
            let (lon, lat) = match kind {
                GridKind::Meridian => (value, sample(lat_range.0, lat_range.1, k)),
                GridKind::Parallel => (sample(lon_range.0, lon_range.1, k), value),
            };
            match project(lon, lat).filter(|p| inside(*p)) {
                Some(point) => current.push(point),
                None if current.len() > 1 => runs.push(std::mem::take(&mut current)),
                None => current.clear(),
            }
        }
        if current.len() > 1 {
            runs.push(current);
        }
        GridLine { kind, value, runs }
    };

    graticule
        .meridians
        .iter()
        .map(|lon| trace(GridKind::Meridian, *lon))
        .chain(
            graticule
                .parallels
                .iter()
                .map(|lat| trace(GridKind::Parallel, *lat)),
        )
        .filter(|line| !line.runs.is_empty())
        .collect()
}

fn write_png(path: &Path, image: &RgbImage, dpi: u32) -> Result<()> {
    let file = File::create(path).map_err(PipelineError::rendering)?;
    let mut encoder = png::Encoder::new(BufWriter::new(file), image.width(), image.height());
    encoder.set_color(png::ColorType::Rgb);
    encoder.set_depth(png::BitDepth::Eight);
    let per_metre = (dpi as f64 / 0.0254).round() as u32;
    encoder.set_pixel_dims(Some(png::PixelDimensions {
        xppu: per_metre,
        yppu: per_metre,
        unit: png::Unit::Meter,
    }));
    let mut writer = encoder.write_header().map_err(PipelineError::rendering)?;
    writer
        .write_image_data(image.as_raw())
        .map_err(PipelineError::rendering)?;
    writer.finish().map_err(PipelineError::rendering)?;
    Ok(())
}

/// Inclusive (x0, y0, x1, y1) of pixels differing from `background`
fn content_bounds(
    pixels: &[u8],
    width: u32,
    height: u32,
    background: [u8; 3],
) -> Option<(u32, u32, u32, u32)> {
    let mut bounds: Option<(u32, u32, u32, u32)> = None;
    for (i, px) in pixels.chunks_exact(3).enumerate() {
        if px == &background[..] {
            continue;
        }
        let (x, y) = ((i as u32) % width, (i as u32) / width);
        if y >= height {
            break;
        }
        bounds = Some(match bounds {
            None => (x, y, x, y),
            Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
        });
    }
    bounds
}
