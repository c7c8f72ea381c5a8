use plotters::style::RGBColor;

/// Perceptually uniform palettes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Colormap {
    #[default]
    Viridis,
}

// matplotlib viridis sampled at 0.0, 0.1, ..., 1.0
const VIRIDIS: [(u8, u8, u8); 11] = [
    (68, 1, 84),
    (72, 36, 117),
    (65, 68, 135),
    (53, 95, 141),
    (42, 120, 142),
    (33, 145, 140),
    (34, 168, 132),
    (68, 191, 112),
    (122, 209, 81),
    (189, 223, 38),
    (253, 231, 37),
];

impl Colormap {
    /// Colour at position `t` in [0, 1]; out-of-range values clamp to the ends
    pub fn sample(&self, t: f64) -> RGBColor {
        let anchors: &[(u8, u8, u8)] = match self {
            Colormap::Viridis => &VIRIDIS,
        };
        let t = if t.is_nan() { 0.0 } else { t.clamp(0.0, 1.0) };
        let x = t * (anchors.len() - 1) as f64;
        let i = x.floor() as usize;
        if i >= anchors.len() - 1 {
            let (r, g, b) = anchors[anchors.len() - 1];
            return RGBColor(r, g, b);
        }
        let f = x - i as f64;
        let lerp = |a: u8, b: u8| (a as f64 + f * (b as f64 - a as f64)).round() as u8;
        let (r0, g0, b0) = anchors[i];
        let (r1, g1, b1) = anchors[i + 1];
        RGBColor(lerp(r0, r1), lerp(g0, g1), lerp(b0, b1))
    }
}

/// Linear value -> colour mapping over a fixed domain
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColorScale {
    pub colormap: Colormap,
    pub vmin: f64,
    pub vmax: f64,
}

impl ColorScale {
    pub fn new(colormap: Colormap, vmin: f64, vmax: f64) -> Self {
        ColorScale {
            colormap,
            vmin,
            vmax,
        }
    }

    pub fn normalize(&self, value: f64) -> f64 {
        if self.vmax > self.vmin {
            ((value - self.vmin) / (self.vmax - self.vmin)).clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    pub fn color_for(&self, value: f64) -> RGBColor {
        self.colormap.sample(self.normalize(value))
    }

    /// Tick positions at "nice" steps inside [vmin, vmax]
    pub fn ticks(&self, max_ticks: usize) -> Vec<f64> {
        let span = self.vmax - self.vmin;
        if !(span > 0.0) || max_ticks == 0 {
            return vec![self.vmin];
        }
        let raw = span / max_ticks as f64;
        let magnitude = 10f64.powf(raw.log10().floor());
        let step = [1.0, 2.0, 2.5, 5.0, 10.0]
            .iter()
            .map(|m| m * magnitude)
            .find(|s| span / s <= max_ticks as f64)
            .unwrap_or(10.0 * magnitude);
        let first = (self.vmin / step).ceil() * step;
        let mut ticks = Vec::new();
        let mut v = first;
        while v <= self.vmax + step * 1e-9 {
            ticks.push(v);
            v += step;
        }
        ticks
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_viridis_ends() {
        assert_eq!(Colormap::Viridis.sample(0.0), RGBColor(68, 1, 84));
        assert_eq!(Colormap::Viridis.sample(1.0), RGBColor(253, 231, 37));
        assert_eq!(Colormap::Viridis.sample(0.5), RGBColor(33, 145, 140));
        assert_eq!(Colormap::Viridis.sample(-3.0), Colormap::Viridis.sample(0.0));
        assert_eq!(Colormap::Viridis.sample(f64::NAN), Colormap::Viridis.sample(0.0));
    }

    #[test]
    fn test_scale_clamps() {
        let scale = ColorScale::new(Colormap::Viridis, 1000.0, 8000.0);
        assert_eq!(scale.normalize(1000.0), 0.0);
        assert_eq!(scale.normalize(4500.0), 0.5);
        assert_eq!(scale.normalize(20000.0), 1.0);
        assert_eq!(scale.color_for(500.0), scale.color_for(1000.0));
    }

    #[test]
    fn test_ticks() {
        let scale = ColorScale::new(Colormap::Viridis, 1000.0, 8000.0);
        assert_eq!(
            scale.ticks(8),
            vec![1000.0, 2000.0, 3000.0, 4000.0, 5000.0, 6000.0, 7000.0, 8000.0]
        );
    }
}
