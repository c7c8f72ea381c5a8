use thiserror::Error;

/// Failure kinds surfaced by the pipeline
///
/// Library functions return `anyhow::Result` and raise these variants inside
/// the `anyhow::Error`, so callers can recover the kind with
/// `err.downcast_ref::<PipelineError>()`.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum PipelineError {
    /// Input dataset missing, unreadable or malformed
    #[error("data source error: {0}")]
    DataSource(String),

    /// Undefined or unusable coordinate reference system
    #[error("projection error: {0}")]
    Projection(String),

    /// Spatial operation attempted across two different CRSs
    #[error("CRS mismatch: left is {left}, right is {right}")]
    CrsMismatch { left: String, right: String },

    /// Drawing or figure output failure
    #[error("rendering error: {0}")]
    Rendering(String),
}

impl PipelineError {
    pub(crate) fn rendering<E: std::fmt::Display>(err: E) -> Self {
        PipelineError::Rendering(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downcast_through_context() {
        use anyhow::Context;

        let result: anyhow::Result<()> =
            Err(PipelineError::Projection("no CRS".to_string())).context("Failed to reproject wards");
        let err = result.unwrap_err();
        assert_eq!(
            err.downcast_ref::<PipelineError>(),
            Some(&PipelineError::Projection("no CRS".to_string()))
        );
    }

    #[test]
    fn test_crs_mismatch_message() {
        let err = PipelineError::CrsMismatch {
            left: "EPSG:2157".to_string(),
            right: "EPSG:4326".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "CRS mismatch: left is EPSG:2157, right is EPSG:4326"
        );
    }
}
