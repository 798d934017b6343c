pub mod extract;
pub mod extractor;

pub use extractor::{ExtractError, Extractor, ExtractionOutcome, SourceKind, EXTRACTION_SCHEMA_NAME};
