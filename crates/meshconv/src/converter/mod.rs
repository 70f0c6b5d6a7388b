//! The seam between the worker pool and the mesh conversion tool.

use std::path::PathBuf;

use crate::error::ConversionError;
use crate::job::{ConversionOptions, ConversionReport};

pub mod external;

pub use external::ExternalConverter;

/// Everything one conversion attempt needs.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionRequest {
    pub job_id: String,
    pub input: PathBuf,
    pub output: PathBuf,
    pub options: ConversionOptions,
    /// 1-based attempt number, for logging.
    pub attempt: u32,
}

/// One blocking, all-or-nothing conversion.
///
/// Implementations must not leave partial state visible on failure and must
/// bound their own running time.
pub trait Converter: Send + Sync {
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionReport, ConversionError>;
}

impl<F> Converter for F
where
    F: Fn(&ConversionRequest) -> Result<ConversionReport, ConversionError> + Send + Sync,
{
    fn convert(&self, request: &ConversionRequest) -> Result<ConversionReport, ConversionError> {
        self(request)
    }
}
