//! Bounding boxes and visual attributes extracted by the external browser
//! tool.
//!
//! The extractor emits one JSON document per page, keyed by XPath-like path
//! segments (`/div[2]`, `/text()[1]`). [`DomData`] loads that document onto
//! the DOM graph and verifies it still matches the current HTML: an `id`
//! recorded for an element must equal the element's own id attribute, and
//! every element entry must be consumed by exactly one DOM node. Either
//! violation means the extractor output and the page have drifted apart and
//! the load fails.

use crate::dom::{DomTree, NodeId};
use crate::error::{Error, Result, VisualError};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Axis-aligned bounding box in page coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub x: f64,
  pub y: f64,
  pub width: f64,
  pub height: f64,
}

impl BoundingBox {
  pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  pub fn center_point(&self) -> [f64; 2] {
    [self.x + self.width / 2.0, self.y + self.height / 2.0]
  }

  /// Corners in top-left, top-right, bottom-left, bottom-right order.
  pub fn corners(&self) -> [[f64; 2]; 4] {
    [
      [self.x, self.y],
      [self.x + self.width, self.y],
      [self.x, self.y + self.height],
      [self.x + self.width, self.y + self.height],
    ]
  }
}

/// One visual attribute the extractor records per element.
pub struct VisualAttribute {
  /// Snake-case name used as the key in `Node::visuals`.
  pub name: &'static str,
  /// Parses the raw JSON value; `None` means unparsable.
  pub parse: fn(&Value) -> Option<f32>,
  pub default: f32,
}

fn parse_px(value: &Value) -> Option<f32> {
  match value {
    Value::Number(n) => n.as_f64().map(|v| v as f32),
    Value::String(s) => s.trim_end_matches("px").trim().parse().ok(),
    _ => None,
  }
}

fn parse_font_weight(value: &Value) -> Option<f32> {
  let raw = match value {
    Value::Number(n) => n.as_f64().map(|v| v as f32),
    Value::String(s) => match s.as_str() {
      "normal" => Some(400.0),
      "bold" => Some(700.0),
      other => other.parse().ok(),
    },
    _ => None,
  }?;
  Some(raw / 100.0)
}

/// Attributes loaded for every element entry, in feature-column order.
pub const VISUAL_ATTRIBUTES: &[VisualAttribute] = &[
  VisualAttribute {
    name: "font_size",
    parse: parse_px,
    default: 0.0,
  },
  VisualAttribute {
    name: "font_weight",
    parse: parse_font_weight,
    default: 4.0,
  },
];

fn to_camel_case(snake: &str) -> String {
  let mut out = String::with_capacity(snake.len());
  let mut upper_next = false;
  for c in snake.chars() {
    if c == '_' {
      upper_next = true;
    } else if upper_next {
      out.extend(c.to_uppercase());
      upper_next = false;
    } else {
      out.push(c);
    }
  }
  out
}

/// Loader for the visual attributes saved by the extractor tool.
pub struct DomData {
  source: String,
  data: Value,
}

impl DomData {
  /// Parses the extractor JSON. `source` names the document (usually its
  /// path) in error messages.
  pub fn from_json(json: &str, source: &str) -> Result<DomData> {
    let data = serde_json::from_str(json).map_err(|e| {
      Error::Visual(VisualError::InvalidDocument {
        source_name: source.to_string(),
        message: e.to_string(),
      })
    })?;
    Ok(DomData {
      source: source.to_string(),
      data,
    })
  }

  /// Finds the entry for an xpath, walking one `/name[i]` segment at a time.
  fn find(&self, xpath: &str) -> Result<&Value> {
    let mut current = &self.data;
    let mut consumed_len = 0;
    for segment in split_segments(xpath) {
      current = current.get(segment).ok_or_else(|| {
        Error::Visual(VisualError::NotFound {
          xpath: xpath.to_string(),
          partial_path: xpath[..consumed_len + segment.len()].to_string(),
          source_name: self.source.clone(),
        })
      })?;
      consumed_len += segment.len();
    }
    Ok(current)
  }

  /// Loads bounding boxes and visual attributes onto `nodes`.
  ///
  /// Call with the tree's surviving node list after filtering. Boxes load
  /// for every node; attribute values only for elements (text fragments
  /// inherit their container's values downstream). After loading, every
  /// element entry in the document must have been consumed.
  pub fn load_all(&self, dom: &mut DomTree, nodes: &[NodeId]) -> Result<()> {
    let mut consumed: FxHashSet<String> = FxHashSet::default();
    for &id in nodes {
      let xpath = dom.xpath(id);
      self.load_one(dom, id, &xpath)?;
      consumed.insert(xpath);
    }
    self.check_all_consumed(&consumed)
  }

  fn load_one(&self, dom: &mut DomTree, id: NodeId, xpath: &str) -> Result<()> {
    let entry = self.find(xpath)?;

    if !dom.is_text(id) {
      let real = dom.get_attribute(id, "id");
      let extracted = entry.get("id").and_then(Value::as_str);
      if real != extracted {
        return Err(Error::Visual(VisualError::IdMismatch {
          xpath: xpath.to_string(),
          real: real.unwrap_or("").to_string(),
          extracted: extracted.unwrap_or("").to_string(),
          source_name: self.source.clone(),
        }));
      }
    }

    if let Some(raw) = entry.get("box") {
      if let Some(bounds) = parse_box(raw) {
        dom.node_mut(id).bounds = Some(bounds);
      } else {
        log::warn!(
          "Cannot parse box={raw} for {xpath} in {}, leaving unset",
          self.source
        );
      }
    }

    if !dom.is_text(id) {
      for attribute in VISUAL_ATTRIBUTES {
        let value = match entry.get(to_camel_case(attribute.name).as_str()) {
          Some(raw) => (attribute.parse)(raw).unwrap_or_else(|| {
            log::warn!(
              "Cannot parse {}={raw} for {xpath} in {}, using default",
              attribute.name,
              self.source
            );
            attribute.default
          }),
          None => attribute.default,
        };
        dom
          .node_mut(id)
          .visuals
          .insert(attribute.name.to_string(), value);
      }
    }
    Ok(())
  }

  /// Walks the whole document and fails on any element entry no DOM node
  /// consumed. Text-fragment entries are exempt: their nodes may have been
  /// whitespace-filtered.
  fn check_all_consumed(&self, consumed: &FxHashSet<String>) -> Result<()> {
    let mut queue: Vec<(String, &Value)> = vec![(String::new(), &self.data)];
    while let Some((prefix, entry)) = queue.pop() {
      let Value::Object(map) = entry else {
        continue;
      };
      for (key, child) in map {
        if !key.starts_with('/') {
          continue;
        }
        let xpath = format!("{prefix}{key}");
        if !key.starts_with("/text()") && !consumed.contains(&xpath) {
          return Err(Error::Visual(VisualError::UnusedAttributes {
            xpath,
            source_name: self.source.clone(),
          }));
        }
        queue.push((xpath, child));
      }
    }
    Ok(())
  }
}

/// Fails when a candidate text node is missing its bounding box. Used when
/// visual features are required.
pub fn require_boxes(dom: &DomTree, nodes: &[NodeId], page: &str) -> Result<()> {
  for &id in nodes {
    if dom.is_text(id) && dom.node(id).bounds.is_none() {
      return Err(Error::Visual(VisualError::MissingBox {
        page: page.to_string(),
        xpath: dom.xpath(id),
      }));
    }
  }
  Ok(())
}

fn parse_box(value: &Value) -> Option<BoundingBox> {
  let parts = value.as_array()?;
  if parts.len() != 4 {
    return None;
  }
  let mut coords = [0.0; 4];
  for (slot, part) in coords.iter_mut().zip(parts) {
    *slot = part.as_f64()?;
  }
  Some(BoundingBox::new(coords[0], coords[1], coords[2], coords[3]))
}

/// Splits `/html[1]/body[1]` into `["/html[1]", "/body[1]"]`.
fn split_segments(xpath: &str) -> Vec<&str> {
  let mut segments = Vec::new();
  let mut start = 0;
  for (i, c) in xpath.char_indices().skip(1) {
    if c == '/' {
      segments.push(&xpath[start..i]);
      start = i;
    }
  }
  if start < xpath.len() {
    segments.push(&xpath[start..]);
  }
  segments
}
