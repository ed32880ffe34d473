//! Error types for the extraction pipeline.
//!
//! Each subsystem gets its own error enum:
//! - Parse errors (HTML)
//! - Label errors (gold-label resolution, label-map consistency)
//! - Context errors (root-context merging, freeze protocol)
//! - Visual errors (visual-attribute document drift)
//! - Cache errors (sample/root-context persistence)
//!
//! All errors use the `thiserror` crate and carry enough context (page
//! identity, label key, offending path) to diagnose which page broke a
//! batch run.

use thiserror::Error;

/// Result type alias for pipeline operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error type.
///
/// Each variant wraps a more specific error type for that subsystem.
#[derive(Error, Debug)]
pub enum Error {
  /// HTML parsing error
  #[error("Parse error: {0}")]
  Parse(#[from] ParseError),

  /// Gold-label resolution or label-map error
  #[error("Label error: {0}")]
  Label(#[from] LabelError),

  /// Feature-context error
  #[error("Context error: {0}")]
  Context(#[from] ContextError),

  /// Visual-attribute data error
  #[error("Visual error: {0}")]
  Visual(#[from] VisualError),

  /// Sample or root-context persistence error
  #[error("Cache error: {0}")]
  Cache(#[from] CacheError),

  /// I/O error (file reading/writing)
  #[error("I/O error: {0}")]
  Io(#[from] std::io::Error),

  /// Generic error for miscellaneous issues
  #[error("{0}")]
  Other(String),
}

/// Errors that occur during HTML parsing.
#[derive(Error, Debug, Clone)]
pub enum ParseError {
  /// The underlying parser could not recover from malformed input.
  #[error("Invalid HTML: {message}")]
  InvalidHtml { message: String },

  /// The parsed document has no root element.
  #[error("Document has no root element")]
  MissingRoot,
}

/// Errors raised while attaching gold labels to DOM nodes or while
/// validating label maps across dataset splits.
#[derive(Error, Debug, Clone)]
pub enum LabelError {
  /// A gold index path does not resolve to any current DOM node.
  #[error("Label '{label_key}' on page '{page}' does not resolve: index {index} out of range at depth {depth} of path {path:?}")]
  ResolutionFailed {
    page: String,
    label_key: String,
    path: Vec<usize>,
    depth: usize,
    index: usize,
  },

  /// A split introduces a field name unseen in the first-built label map.
  /// Always fatal; the map is never silently extended, so label ids stay
  /// consistent across train/val/test.
  #[error("Field '{field}' from page '{page}' not found in the label map")]
  MapMismatch { page: String, field: String },
}

/// Errors in the root/page feature-context model.
#[derive(Error, Debug, Clone)]
pub enum ContextError {
  /// Two root contexts built under different cutoff configurations were
  /// merged. Parallel preparation workers must share one configuration.
  #[error("Option `{option}` does not match ({left} vs. {right})")]
  ConfigMismatch {
    option: String,
    left: String,
    right: String,
  },
}

/// Errors raised while loading externally-extracted visual attributes.
///
/// These signal that the visual-extraction tool's output and the current
/// HTML have drifted apart.
#[derive(Error, Debug, Clone)]
pub enum VisualError {
  /// The visual-attributes document is not valid JSON.
  #[error("Invalid visual data in {source_name}: {message}")]
  InvalidDocument { source_name: String, message: String },

  /// No entry exists for a node's path.
  #[error("Cannot find visual attributes for {partial_path} while searching for {xpath} in {source_name}")]
  NotFound {
    xpath: String,
    partial_path: String,
    source_name: String,
  },

  /// The `id` recorded by the extractor differs from the DOM node's own
  /// id attribute.
  #[error("IDs of {xpath} do not match (\"{real}\" vs \"{extracted}\") in {source_name}")]
  IdMismatch {
    xpath: String,
    real: String,
    extracted: String,
    source_name: String,
  },

  /// An element entry in the document was consumed by no DOM node.
  #[error("Unused visual attributes for {xpath} in {source_name}")]
  UnusedAttributes { xpath: String, source_name: String },

  /// A classified node lacks a bounding box although visual features are
  /// required.
  #[error("Node {xpath} on page '{page}' has no bounding box")]
  MissingBox { page: String, xpath: String },
}

/// Errors in sample or root-context persistence.
#[derive(Error, Debug)]
pub enum CacheError {
  /// The serialized blob does not start with the expected magic bytes.
  #[error("Invalid {kind} file '{path}': bad magic")]
  BadMagic { kind: &'static str, path: String },

  /// The serialized blob has an unsupported format version.
  #[error("Invalid {kind} file '{path}': unsupported version {version}")]
  UnsupportedVersion {
    kind: &'static str,
    path: String,
    version: u8,
  },

  /// Postcard (de)serialization failure.
  #[error("Serialization error: {0}")]
  Postcard(#[from] postcard::Error),
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn label_resolution_error_reports_page_and_path() {
    let error = LabelError::ResolutionFailed {
      page: "shop.example/p1".to_string(),
      label_key: "price".to_string(),
      path: vec![1, 0, 3],
      depth: 2,
      index: 3,
    };
    let display = format!("{}", error);
    assert!(display.contains("shop.example/p1"));
    assert!(display.contains("price"));
    assert!(display.contains("[1, 0, 3]"));
  }

  #[test]
  fn map_mismatch_error_reports_field() {
    let error = LabelError::MapMismatch {
      page: "shop.example/p2".to_string(),
      field: "shortDescription".to_string(),
    };
    let display = format!("{}", error);
    assert!(display.contains("shortDescription"));
    assert!(display.contains("not found in the label map"));
  }

  #[test]
  fn config_mismatch_error_reports_both_values() {
    let error = ContextError::ConfigMismatch {
      option: "cutoff_words".to_string(),
      left: "Some(15)".to_string(),
      right: "None".to_string(),
    };
    let display = format!("{}", error);
    assert!(display.contains("cutoff_words"));
    assert!(display.contains("Some(15)"));
    assert!(display.contains("None"));
  }

  #[test]
  fn visual_id_mismatch_reports_both_ids() {
    let error = VisualError::IdMismatch {
      xpath: "/html[1]/body[1]/div[1]".to_string(),
      real: "main".to_string(),
      extracted: "content".to_string(),
      source_name: "visuals.json".to_string(),
    };
    let display = format!("{}", error);
    assert!(display.contains("main"));
    assert!(display.contains("content"));
  }

  #[test]
  fn error_from_parse_error() {
    let parse_error = ParseError::InvalidHtml {
      message: "bad byte sequence".to_string(),
    };
    let error: Error = parse_error.into();
    assert!(matches!(error, Error::Parse(_)));
  }

  #[test]
  fn error_from_io_error() {
    let io_error = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
    let error: Error = io_error.into();
    assert!(matches!(error, Error::Io(_)));
  }

  #[test]
  fn error_trait_implemented() {
    let error = Error::Parse(ParseError::MissingRoot);
    let _: &dyn std::error::Error = &error;
  }
}
