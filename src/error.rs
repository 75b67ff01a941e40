use std::error::Error as StdError;

/// Everything that can go wrong while constructing or querying a
/// simplestyle source. Construction errors are fatal to that construction;
/// render errors are local to one tile request.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("only the simple and overlaydata protocols are supported (got {0:?})")]
    UnsupportedProtocol(String),

    #[error("invalid GeoJSON: {0}")]
    InvalidGeoJson(String),

    #[error("invalid marker spec {0:?}")]
    InvalidMarkerSpec(String),

    #[error("failed to generate marker asset {slug}: {message}")]
    AssetGeneration { slug: String, message: String },

    /// Opaque failure reported by the rendering engine, surfaced unchanged.
    #[error("render error: {0}")]
    Render(#[source] Box<dyn StdError + Send + Sync>),

    /// Permanent characteristic of this source type, not a transient error.
    #[error("this source does not provide {0}")]
    UnsupportedCapability(&'static str),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
