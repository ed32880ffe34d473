//! The page interface implemented by dataset-specific adapters.
//!
//! Adapters (directory datasets, crawler dumps, databases) supply raw HTML,
//! gold-label locations, and optional extractor output through this trait;
//! the pipeline never sees where a page came from.

use crate::error::Result;
use std::path::PathBuf;

/// Root-relative path of child positions among *original* (pre-filter)
/// children, locating one node in a page's DOM.
pub type IndexPath = Vec<usize>;

/// One raw page supplied by a dataset adapter.
pub trait Page: Send + Sync {
  /// Raw HTML of the page.
  fn html_text(&self) -> Result<String>;

  /// Gold field names present on this page.
  fn fields(&self) -> Vec<String>;

  /// Label keys in their fixed page order; the first key attached to a node
  /// becomes the node's scalar label.
  fn label_keys(&self) -> Vec<String> {
    self.fields()
  }

  /// Gold locations for one label key.
  fn labeled_paths(&self, key: &str) -> Vec<IndexPath>;

  /// Locations of text nodes whose value varies across pages of the same
  /// site. Empty when the adapter doesn't track variability.
  fn variable_text_paths(&self) -> Vec<IndexPath> {
    Vec::new()
  }

  /// Stable identifier; used as the cache key and in error messages.
  fn identifier(&self) -> String;

  /// Where this page's sample is persisted; `None` selects the in-memory
  /// cache slot.
  fn data_point_slot(&self) -> Option<PathBuf> {
    None
  }

  /// Raw visual-attributes JSON, when the extractor ran on this page.
  fn visuals_json(&self) -> Result<Option<String>> {
    Ok(None)
  }
}

/// In-memory page, convenient for tests and small fixed datasets.
#[derive(Debug, Clone, Default)]
pub struct StaticPage {
  pub identifier: String,
  pub html: String,
  pub fields: Vec<String>,
  pub labels: Vec<(String, Vec<IndexPath>)>,
  pub variable_paths: Vec<IndexPath>,
  pub slot: Option<PathBuf>,
  pub visuals: Option<String>,
}

impl StaticPage {
  pub fn new(identifier: &str, html: &str) -> StaticPage {
    StaticPage {
      identifier: identifier.to_string(),
      html: html.to_string(),
      ..StaticPage::default()
    }
  }

  pub fn with_label(mut self, key: &str, paths: Vec<IndexPath>) -> StaticPage {
    self.fields.push(key.to_string());
    self.labels.push((key.to_string(), paths));
    self
  }

  pub fn with_slot(mut self, slot: PathBuf) -> StaticPage {
    self.slot = Some(slot);
    self
  }

  pub fn with_visuals(mut self, json: &str) -> StaticPage {
    self.visuals = Some(json.to_string());
    self
  }
}

impl Page for StaticPage {
  fn html_text(&self) -> Result<String> {
    Ok(self.html.clone())
  }

  fn fields(&self) -> Vec<String> {
    self.fields.clone()
  }

  fn labeled_paths(&self, key: &str) -> Vec<IndexPath> {
    self
      .labels
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, paths)| paths.clone())
      .unwrap_or_default()
  }

  fn variable_text_paths(&self) -> Vec<IndexPath> {
    self.variable_paths.clone()
  }

  fn identifier(&self) -> String {
    self.identifier.clone()
  }

  fn data_point_slot(&self) -> Option<PathBuf> {
    self.slot.clone()
  }

  fn visuals_json(&self) -> Result<Option<String>> {
    Ok(self.visuals.clone())
  }
}
