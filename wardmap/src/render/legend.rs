use anyhow::Result;
use plotters::style::RGBColor;

use crate::error::PipelineError;

/// Fill or stroke colour; `None` draws nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Paint {
    None,
    Rgb(u8, u8, u8),
}

impl Paint {
    pub const BLACK: Paint = Paint::Rgb(0, 0, 0);
    pub const WHITE: Paint = Paint::Rgb(255, 255, 255);
    pub const RED: Paint = Paint::Rgb(255, 0, 0);
    pub const BLUE: Paint = Paint::Rgb(0, 0, 255);

    /// Parse matplotlib-style colour names: single letters (`"r"`, `"k"`),
    /// basic names, `"none"` and `#rrggbb`
    pub fn parse(name: &str) -> Result<Paint> {
        let name = name.trim().to_ascii_lowercase();
        let paint = match name.as_str() {
            "none" | "" => Paint::None,
            "k" | "black" => Paint::BLACK,
            "w" | "white" => Paint::WHITE,
            "r" | "red" => Paint::RED,
            "b" | "blue" => Paint::BLUE,
            "g" | "green" => Paint::Rgb(0, 128, 0),
            "c" | "cyan" => Paint::Rgb(0, 191, 191),
            "m" | "magenta" => Paint::Rgb(191, 0, 191),
            "y" | "yellow" => Paint::Rgb(191, 191, 0),
            "gray" | "grey" => Paint::Rgb(128, 128, 128),
            hex if hex.starts_with('#') && hex.len() == 7 => {
                let channel = |range: std::ops::Range<usize>| {
                    u8::from_str_radix(&hex[range], 16).map_err(|_| {
                        PipelineError::Rendering(format!("invalid colour '{}'", hex))
                    })
                };
                Paint::Rgb(channel(1..3)?, channel(3..5)?, channel(5..7)?)
            }
            other => {
                return Err(PipelineError::Rendering(format!("unknown colour '{}'", other)).into())
            }
        };
        Ok(paint)
    }

    pub fn to_rgb(self) -> Option<RGBColor> {
        match self {
            Paint::None => None,
            Paint::Rgb(r, g, b) => Some(RGBColor(r, g, b)),
        }
    }
}

/// Styling shared by every generated handle
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HandleStyle {
    pub edge: Paint,
    /// Opacity in [0, 1]
    pub alpha: f64,
}

impl Default for HandleStyle {
    fn default() -> Self {
        HandleStyle {
            edge: Paint::BLACK,
            alpha: 1.0,
        }
    }
}

/// Legend swatch: a unit square with fill, edge and opacity
#[derive(Debug, Clone, PartialEq)]
pub struct LegendHandle {
    pub label: String,
    pub fill: Paint,
    pub edge: Paint,
    pub alpha: f64,
}

/// One handle per label; fill colours cycle when there are fewer colours than labels
pub fn generate_handles<S: AsRef<str>>(
    labels: &[S],
    colors: &[Paint],
    style: HandleStyle,
) -> Result<Vec<LegendHandle>> {
    if colors.is_empty() {
        return Err(PipelineError::Rendering(
            "legend handles need at least one colour".to_string(),
        )
        .into());
    }

    let handles = labels
        .iter()
        .enumerate()
        .map(|(i, label)| LegendHandle {
            label: label.as_ref().to_string(),
            fill: colors[i % colors.len()],
            edge: style.edge,
            alpha: style.alpha,
        })
        .collect();

    Ok(handles)
}

/// Legend box anchor inside the axes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LegendLocation {
    UpperLeft,
    UpperRight,
    LowerLeft,
    LowerRight,
}

/// A legend attached to the map axes
#[derive(Debug, Clone, PartialEq)]
pub struct Legend {
    pub handles: Vec<LegendHandle>,
    pub location: LegendLocation,
    /// Font size in points
    pub font_size: f64,
    /// Frame background opacity
    pub frame_alpha: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_colors_cycle() {
        let handles = generate_handles(
            &["a", "b", "c"],
            &[Paint::RED, Paint::BLUE],
            HandleStyle::default(),
        )
        .unwrap();
        assert_eq!(handles.len(), 3);
        assert_eq!(handles[0].fill, Paint::RED);
        assert_eq!(handles[1].fill, Paint::BLUE);
        assert_eq!(handles[2].fill, Paint::RED);
        assert_eq!(handles[2].label, "c");
    }

    #[test]
    fn test_shared_styling() {
        let style = HandleStyle {
            edge: Paint::RED,
            alpha: 0.4,
        };
        let handles = generate_handles(
            &["one", "two", "three", "four"],
            &[Paint::None, Paint::BLUE, Paint::WHITE],
            style,
        )
        .unwrap();
        assert!(handles.iter().all(|h| h.edge == Paint::RED && h.alpha == 0.4));

        let defaults = generate_handles(&["x"], &[Paint::None], HandleStyle::default()).unwrap();
        assert_eq!(defaults[0].edge, Paint::BLACK);
        assert_eq!(defaults[0].alpha, 1.0);
    }

    #[test]
    fn test_empty_colors_fail() {
        let err = generate_handles(&["a"], &[], HandleStyle::default()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PipelineError>(),
            Some(PipelineError::Rendering(_))
        ));
    }

    #[test]
    fn test_no_labels_no_handles() {
        let labels: [&str; 0] = [];
        let handles = generate_handles(&labels, &[Paint::RED], HandleStyle::default()).unwrap();
        assert!(handles.is_empty());
    }

    #[test]
    fn test_parse_paint() {
        assert_eq!(Paint::parse("r").unwrap(), Paint::RED);
        assert_eq!(Paint::parse("k").unwrap(), Paint::BLACK);
        assert_eq!(Paint::parse("none").unwrap(), Paint::None);
        assert_eq!(Paint::parse("#1f77b4").unwrap(), Paint::Rgb(0x1f, 0x77, 0xb4));
        assert!(Paint::parse("#zz0000").is_err());
        assert!(Paint::parse("chartreuse-ish").is_err());
        assert_eq!(Paint::RED.to_rgb(), Some(RGBColor(255, 0, 0)));
        assert_eq!(Paint::None.to_rgb(), None);
    }
}
