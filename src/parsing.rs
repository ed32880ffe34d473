//! HTML parsing and low-level tree filtering.
//!
//! Raw HTML is parsed with html5ever into [`ParseTree`], an arena of parse
//! nodes rooted at the document element. Structural noise (a fixed denylist
//! of tags, comments, doctypes) is stripped during conversion; whitespace-only
//! text fragments are filtered later via [`ParseTree::filter_whitespace_text`]
//! so that node indices assigned by the DOM graph builder stay stable.

use crate::error::{Error, ParseError, Result};
use html5ever::parse_document;
use html5ever::tendril::TendrilSink;
use html5ever::tree_builder::TreeBuilderOpts;
use html5ever::ParseOpts;
use markup5ever_rcdom::Handle;
use markup5ever_rcdom::NodeData;
use markup5ever_rcdom::RcDom;
use std::io;

/// Tags whose entire subtree is removed during parsing.
pub const IGNORED_TAG_NAMES: &[&str] = &["script", "style", "head", "noscript", "iframe"];

/// Whether `c` counts as whitespace for filtering and normalization.
///
/// Extends the Unicode class with U+200B ZERO WIDTH SPACE, which appears in
/// real pages as an invisible separator.
pub fn is_whitespace_char(c: char) -> bool {
  c.is_whitespace() || c == '\u{200b}'
}

/// Collapses any run of whitespace (including zero-width space) to a single
/// ASCII space.
pub fn collapse_whitespace(text: &str) -> String {
  let mut out = String::with_capacity(text.len());
  let mut in_run = false;
  for c in text.chars() {
    if is_whitespace_char(c) {
      if !in_run {
        out.push(' ');
        in_run = true;
      }
    } else {
      out.push(c);
      in_run = false;
    }
  }
  out
}

/// Collapses whitespace and strips leading/trailing whitespace.
///
/// Used when matching label selectors against text content.
pub fn normalize_text(text: &str) -> String {
  collapse_whitespace(text).trim().to_string()
}

/// Whether `text` is empty or consists only of whitespace.
pub fn is_empty_or_whitespace(text: &str) -> bool {
  text.chars().all(is_whitespace_char)
}

/// Index of a node in the [`ParseTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ParseNodeId(pub(crate) u32);

impl ParseNodeId {
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

/// Kind of a parsed node.
#[derive(Debug, Clone)]
pub enum ParseNodeKind {
  Element {
    tag_name: String,
    attributes: Vec<(String, String)>,
  },
  Text {
    content: String,
  },
}

/// One element or text fragment in the parse tree.
///
/// `children` is the original child list; it is never mutated after parsing
/// so that positional index paths resolve identically before and after
/// filtering. Removal is expressed through the `detached` flag instead.
#[derive(Debug, Clone)]
pub struct ParseNode {
  pub kind: ParseNodeKind,
  pub parent: Option<ParseNodeId>,
  pub children: Vec<ParseNodeId>,
  pub detached: bool,
}

impl ParseNode {
  pub fn is_text(&self) -> bool {
    matches!(self.kind, ParseNodeKind::Text { .. })
  }

  /// Tag name for elements, `None` for text fragments.
  pub fn tag_name(&self) -> Option<&str> {
    match &self.kind {
      ParseNodeKind::Element { tag_name, .. } => Some(tag_name),
      ParseNodeKind::Text { .. } => None,
    }
  }

  /// Shallow text content for text fragments, `None` for elements.
  pub fn text(&self) -> Option<&str> {
    match &self.kind {
      ParseNodeKind::Text { content } => Some(content),
      ParseNodeKind::Element { .. } => None,
    }
  }

  pub fn get_attribute(&self, name: &str) -> Option<&str> {
    match &self.kind {
      ParseNodeKind::Element { attributes, .. } => attributes
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str()),
      ParseNodeKind::Text { .. } => None,
    }
  }
}

/// Arena-owned parse tree for one page, rooted at the document element.
#[derive(Debug, Clone)]
pub struct ParseTree {
  nodes: Vec<ParseNode>,
  root: ParseNodeId,
}

impl ParseTree {
  pub fn root(&self) -> ParseNodeId {
    self.root
  }

  pub fn node(&self, id: ParseNodeId) -> &ParseNode {
    &self.nodes[id.index()]
  }

  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  pub fn is_empty(&self) -> bool {
    self.nodes.is_empty()
  }

  /// Original ordered children of `id`, including detached ones.
  pub fn children(&self, id: ParseNodeId) -> &[ParseNodeId] {
    &self.nodes[id.index()].children
  }

  /// Marks a single node as detached. Children are left in place; detachment
  /// of a subtree is expressed by detaching each node.
  pub fn detach(&mut self, id: ParseNodeId) {
    self.nodes[id.index()].detached = true;
  }

  /// Detaches text fragments whose content is empty or whitespace-only
  /// (including zero-width space). Returns the number of newly detached
  /// nodes; calling this twice detaches nothing new.
  pub fn filter_whitespace_text(&mut self) -> usize {
    let mut detached = 0;
    for node in &mut self.nodes {
      if node.detached {
        continue;
      }
      if let ParseNodeKind::Text { content } = &node.kind {
        if is_empty_or_whitespace(content) {
          node.detached = true;
          detached += 1;
        }
      }
    }
    detached
  }

  /// Normalized (collapsed, trimmed) text of a text fragment.
  pub fn normalized_text(&self, id: ParseNodeId) -> Option<String> {
    self.node(id).text().map(normalize_text)
  }
}

/// Parses HTML into a [`ParseTree`].
///
/// Subtrees rooted at [`IGNORED_TAG_NAMES`] are removed entirely (not
/// unwrapped), as are comments, doctypes, and processing instructions. The
/// returned tree is rooted at the document element.
pub fn parse_html(html: &str) -> Result<ParseTree> {
  let opts = ParseOpts {
    tree_builder: TreeBuilderOpts {
      scripting_enabled: false,
      ..Default::default()
    },
    ..Default::default()
  };

  let mut reader = io::Cursor::new(html.as_bytes());
  let dom = parse_document(RcDom::default(), opts)
    .from_utf8()
    .read_from(&mut reader)
    .map_err(|e| {
      Error::Parse(ParseError::InvalidHtml {
        message: format!("Failed to parse HTML: {}", e),
      })
    })?;

  // The document element is the first element child of the document node.
  let document = &dom.document;
  let root_handle = document
    .children
    .borrow()
    .iter()
    .find(|child| matches!(child.data, NodeData::Element { .. }))
    .cloned()
    .ok_or(Error::Parse(ParseError::MissingRoot))?;

  let mut tree = ParseTree {
    nodes: Vec::new(),
    root: ParseNodeId(0),
  };
  convert_handle(&mut tree, &root_handle, None);
  if tree.nodes.is_empty() {
    return Err(Error::Parse(ParseError::MissingRoot));
  }
  Ok(tree)
}

/// Converts one html5ever node (and its subtree) into the arena. Returns the
/// new node's id, or `None` when the node is stripped.
fn convert_handle(
  tree: &mut ParseTree,
  handle: &Handle,
  parent: Option<ParseNodeId>,
) -> Option<ParseNodeId> {
  let kind = match &handle.data {
    NodeData::Element { name, attrs, .. } => {
      let tag_name = name.local.to_string();
      if IGNORED_TAG_NAMES.contains(&tag_name.as_str()) {
        return None;
      }
      let attributes = attrs
        .borrow()
        .iter()
        .map(|attr| (attr.name.local.to_string(), attr.value.to_string()))
        .collect();
      ParseNodeKind::Element {
        tag_name,
        attributes,
      }
    }
    // html5ever already splits text around elements, so fragments `X`, `Y`,
    // `Z` of `<p>X<br>Y<br>Z</p>` arrive as separate nodes.
    NodeData::Text { contents } => ParseNodeKind::Text {
      content: contents.borrow().to_string(),
    },
    NodeData::Comment { .. }
    | NodeData::Doctype { .. }
    | NodeData::ProcessingInstruction { .. }
    | NodeData::Document => return None,
  };

  let id = ParseNodeId(tree.nodes.len() as u32);
  tree.nodes.push(ParseNode {
    kind,
    parent,
    children: Vec::new(),
    detached: false,
  });

  let child_ids: Vec<ParseNodeId> = handle
    .children
    .borrow()
    .iter()
    .filter_map(|child| convert_handle(tree, child, Some(id)))
    .collect();
  tree.nodes[id.index()].children = child_ids;
  Some(id)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn text_contents(tree: &ParseTree) -> Vec<String> {
    (0..tree.len())
      .map(|i| ParseNodeId(i as u32))
      .filter(|&id| !tree.node(id).detached)
      .filter_map(|id| tree.node(id).text().map(str::to_string))
      .collect()
  }

  #[test]
  fn parse_strips_ignored_tags_entirely() {
    let tree = parse_html(
      "<html><head><title>T</title></head>\
       <body><script>var x = 1;</script><p>keep</p><style>p {}</style></body></html>",
    )
    .unwrap();
    for i in 0..tree.len() {
      let node = tree.node(ParseNodeId(i as u32));
      if let Some(tag) = node.tag_name() {
        assert!(!IGNORED_TAG_NAMES.contains(&tag), "tag {tag} not stripped");
      }
      if let Some(text) = node.text() {
        assert!(!text.contains("var x"), "script content leaked");
        assert!(!text.contains('T'), "head content leaked");
      }
    }
  }

  #[test]
  fn parse_strips_comments() {
    let tree = parse_html("<html><body><!-- hidden --><p>shown</p></body></html>").unwrap();
    assert_eq!(text_contents(&tree), vec!["shown"]);
  }

  #[test]
  fn parse_splits_text_fragments_around_elements() {
    let tree = parse_html("<html><body><p>X<br>Y<br>Z</p></body></html>").unwrap();
    assert_eq!(text_contents(&tree), vec!["X", "Y", "Z"]);
  }

  #[test]
  fn parse_root_is_document_element() {
    let tree = parse_html("<html><body></body></html>").unwrap();
    assert_eq!(tree.node(tree.root()).tag_name(), Some("html"));
    assert!(tree.node(tree.root()).parent.is_none());
  }

  #[test]
  fn filter_detaches_whitespace_only_text() {
    let mut tree = parse_html("<html><body><p>   </p><p>kept</p></body></html>").unwrap();
    let detached = tree.filter_whitespace_text();
    assert!(detached >= 1);
    assert_eq!(text_contents(&tree), vec!["kept"]);
    // Idempotent.
    assert_eq!(tree.filter_whitespace_text(), 0);
  }

  #[test]
  fn filter_treats_zero_width_space_as_whitespace() {
    let mut tree = parse_html("<html><body><p>\u{200b} \u{200b}</p></body></html>").unwrap();
    tree.filter_whitespace_text();
    assert!(text_contents(&tree).is_empty());
  }

  #[test]
  fn filter_preserves_original_children_lists() {
    let mut tree = parse_html("<html><body><div>  <p>a</p></div></body></html>").unwrap();
    let body = tree.children(tree.root())[0];
    let div = tree.children(body)[0];
    let before = tree.children(div).len();
    tree.filter_whitespace_text();
    assert_eq!(tree.children(div).len(), before);
  }

  #[test]
  fn collapse_whitespace_handles_runs_and_zero_width() {
    assert_eq!(collapse_whitespace("a \t\n b\u{200b}c"), "a b c");
  }

  #[test]
  fn normalize_text_trims() {
    assert_eq!(normalize_text("  Hello   world \u{200b}"), "Hello world");
  }

  #[test]
  fn is_empty_or_whitespace_cases() {
    assert!(is_empty_or_whitespace(""));
    assert!(is_empty_or_whitespace(" \t\u{200b}"));
    assert!(!is_empty_or_whitespace(" x "));
  }

  #[test]
  fn attributes_are_preserved() {
    let tree = parse_html("<html><body><div id=\"main\" class=\"a b\"></div></body></html>").unwrap();
    let body = tree.children(tree.root())[0];
    let div = tree.children(body)[0];
    assert_eq!(tree.node(div).get_attribute("id"), Some("main"));
    assert_eq!(tree.node(div).get_attribute("class"), Some("a b"));
    assert_eq!(tree.node(div).get_attribute("missing"), None);
  }
}
