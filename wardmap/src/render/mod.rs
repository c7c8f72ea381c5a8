pub mod colormap;
pub mod legend;
pub mod map_figure;
