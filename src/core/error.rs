//! Error types for Yakka operations.
//!
//! This module defines the canonical error type used throughout Yakka.
//! All subsystems return `Result<T, YakkaError>` for error handling.

use std::io;
use thiserror::Error;

/// Canonical error type for all Yakka operations.
///
/// Uses `thiserror` for automatic `Display` and `Error` trait implementations.
/// Many variants auto-convert from library errors via `#[from]`.
#[derive(Error, Debug)]
pub enum YakkaError {
    /// I/O error (auto-converts from `std::io::Error`)
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    /// JSON encode/decode error
    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    /// YAML encode/decode error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Regular expression compile error
    #[error("Regex error: {0}")]
    RegexError(#[from] regex::Error),

    /// Component manifest parse failure or structural violation
    #[error("Invalid component '{0}': {1}")]
    InvalidComponent(String, String),

    /// Resource not found (component, registry, file, etc.)
    #[error("Not found: {0}")]
    NotFound(String),

    /// Template render failure
    #[error("Template error in '{input}': {reason}")]
    TemplateError { input: String, reason: String },

    /// Manifest merge with incompatible node types
    #[error("Merge error at '{0}': {1}")]
    MergeError(String, String),

    /// Malformed data dependency path
    #[error("Data dependency error: {0}")]
    DataDependencyError(String),

    /// Blueprint process command failure
    #[error("Command error: {0}")]
    CommandError(String),

    /// Workspace or registry configuration error
    #[error("Workspace error: {0}")]
    WorkspaceError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_component_display() {
        let err = YakkaError::InvalidComponent("uart".to_string(), "bad yaml".to_string());
        assert_eq!(format!("{}", err), "Invalid component 'uart': bad yaml");
    }

    #[test]
    fn test_not_found_display() {
        let err = YakkaError::NotFound("component 'spi'".to_string());
        assert_eq!(format!("{}", err), "Not found: component 'spi'");
    }

    #[test]
    fn test_template_error_display() {
        let err = YakkaError::TemplateError {
            input: "{{bad".to_string(),
            reason: "unterminated expression".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Template error in '{{bad': unterminated expression"
        );
    }

    #[test]
    fn test_data_dependency_error_display() {
        let err = YakkaError::DataDependencyError("missing root separator".to_string());
        assert_eq!(
            format!("{}", err),
            "Data dependency error: missing root separator"
        );
    }
}
