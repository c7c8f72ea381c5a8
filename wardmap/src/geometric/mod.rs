pub mod feature_collection;
pub mod spatial_join;
