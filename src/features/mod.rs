//! The per-node feature pipeline.
//!
//! Every feature follows the same two-phase contract: `prepare` scans a
//! page's nodes to grow root-context statistics, `compute` turns one node
//! into a fixed-width numeric vector using the *frozen* context. Features
//! form a closed set of kinds registered in an explicit ordered list; the
//! full node vector is the concatenation of every registered feature's
//! output in registration order.

pub mod context;
pub mod text;

pub use context::{
  DatasetIndex, DefaultNodePredicate, LiveContext, NodePredicate, PageContext, PageNodes,
  RootContext,
};

use crate::dom::{DomTree, NodeId};
use crate::error::Result;
use crate::visual::VISUAL_ATTRIBUTES;
use text::{tokenize, truncate_token};

/// One feature in the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureKind {
  /// Relative depth of the node in the DOM tree.
  Depth,
  /// Whether the node is a leaf (text) node.
  IsLeaf,
  /// Counts of dollar signs, letters, and digits in the node's text.
  CharCategories,
  /// Visual attribute values (text nodes inherit their container's).
  Visuals,
  /// Character-identifier grid over the node's first words; needs the
  /// global character dictionary.
  CharIdentifiers,
  /// Word identifiers from the global word dictionary.
  WordIdentifiers,
}

impl FeatureKind {
  pub fn name(&self) -> &'static str {
    match self {
      FeatureKind::Depth => "depth",
      FeatureKind::IsLeaf => "is_leaf",
      FeatureKind::CharCategories => "char_categories",
      FeatureKind::Visuals => "visuals",
      FeatureKind::CharIdentifiers => "char_identifiers",
      FeatureKind::WordIdentifiers => "word_identifiers",
    }
  }

  /// Width of this feature's output under a frozen context.
  pub fn dimension(&self, live: &LiveContext) -> usize {
    match self {
      FeatureKind::Depth | FeatureKind::IsLeaf => 1,
      FeatureKind::CharCategories => 3,
      FeatureKind::Visuals => VISUAL_ATTRIBUTES.len(),
      FeatureKind::CharIdentifiers => {
        live.root.max_num_words as usize * live.root.max_word_len as usize
      }
      FeatureKind::WordIdentifiers => live.root.max_num_words as usize,
    }
  }

  /// Description of each output column.
  pub fn labels(&self, live: &LiveContext) -> Vec<String> {
    match self {
      FeatureKind::Depth => vec!["relative_depth".to_string()],
      FeatureKind::IsLeaf => vec!["is_leaf".to_string()],
      FeatureKind::CharCategories => vec![
        "dollars".to_string(),
        "letters".to_string(),
        "digits".to_string(),
      ],
      FeatureKind::Visuals => VISUAL_ATTRIBUTES
        .iter()
        .map(|a| a.name.to_string())
        .collect(),
      FeatureKind::CharIdentifiers => (0..self.dimension(live))
        .map(|i| format!("char_id_{i}"))
        .collect(),
      FeatureKind::WordIdentifiers => (0..self.dimension(live))
        .map(|i| format!("word_id_{i}"))
        .collect(),
    }
  }

  /// Scans one node, growing root-context statistics. Runs for every node
  /// of every page before any compute call.
  pub fn prepare(&self, dom: &DomTree, id: NodeId, root: &mut RootContext) {
    match self {
      FeatureKind::Depth
      | FeatureKind::IsLeaf
      | FeatureKind::CharCategories
      | FeatureKind::Visuals => {}
      FeatureKind::CharIdentifiers => {
        let Some(text) = dom.text(id) else {
          return;
        };
        let mut counter: u32 = 0;
        for token in tokenize(text) {
          if let Some(cutoff) = root.cutoff_words {
            if counter >= cutoff {
              break;
            }
          }
          counter += 1;
          let truncated = truncate_token(&token, root.cutoff_word_length);
          root.max_word_len = root.max_word_len.max(truncated.chars().count() as u32);
          root.chars.extend(truncated.chars());
        }
        root.max_num_words = root.max_num_words.max(counter);
      }
      FeatureKind::WordIdentifiers => {
        let Some(text) = dom.text(id) else {
          return;
        };
        let mut counter: u32 = 0;
        for token in tokenize(text) {
          if let Some(cutoff) = root.cutoff_words {
            if counter >= cutoff {
              break;
            }
          }
          counter += 1;
          root.words.insert(token);
        }
        root.max_num_words = root.max_num_words.max(counter);
      }
    }
  }

  /// Computes this feature's vector for one node. Pure in the frozen
  /// context; the output length always equals [`Self::dimension`].
  pub fn compute(&self, ctx: &PageContext, id: NodeId) -> Result<Vec<f32>> {
    let dom = ctx.dom();
    let out = match self {
      FeatureKind::Depth => {
        let max_depth = ctx.max_depth();
        let ratio = if max_depth == 0 {
          0.0
        } else {
          dom.node(id).depth() as f32 / max_depth as f32
        };
        vec![ratio]
      }
      FeatureKind::IsLeaf => vec![if dom.is_text(id) { 1.0 } else { 0.0 }],
      FeatureKind::CharCategories => match dom.text(id) {
        Some(text) => {
          let mut dollars = 0u32;
          let mut letters = 0u32;
          let mut digits = 0u32;
          for c in text.chars() {
            if c == '$' {
              dollars += 1;
            } else if c.is_ascii_alphabetic() {
              letters += 1;
            } else if c.is_ascii_digit() {
              digits += 1;
            }
          }
          vec![dollars as f32, letters as f32, digits as f32]
        }
        None => vec![0.0, 0.0, 0.0],
      },
      FeatureKind::Visuals => {
        // Text fragments don't carry their own visual attributes; they
        // inherit the container element's.
        let source = if dom.is_text(id) {
          dom.node(id).parent.unwrap_or(id)
        } else {
          id
        };
        VISUAL_ATTRIBUTES
          .iter()
          .map(|attribute| {
            dom
              .node(source)
              .visuals
              .get(attribute.name)
              .copied()
              .unwrap_or(attribute.default)
          })
          .collect()
      }
      FeatureKind::CharIdentifiers => {
        let live = ctx.live();
        let max_words = live.root.max_num_words as usize;
        let max_len = live.root.max_word_len as usize;
        let mut out = vec![0.0; max_words * max_len];
        if let Some(text) = dom.text(id) {
          for (w, token) in tokenize(text).into_iter().take(max_words).enumerate() {
            for (c, ch) in token.chars().take(max_len).enumerate() {
              out[w * max_len + c] = live.char_id(ch) as f32;
            }
          }
        }
        out
      }
      FeatureKind::WordIdentifiers => {
        let live = ctx.live();
        let max_words = live.root.max_num_words as usize;
        let mut out = vec![0.0; max_words];
        if let Some(text) = dom.text(id) {
          for (w, token) in tokenize(text).into_iter().take(max_words).enumerate() {
            out[w] = live.word_id(&token) as f32;
          }
        }
        out
      }
    };
    Ok(out)
  }
}

/// Explicit ordered feature registration list.
#[derive(Debug, Clone)]
pub struct FeatureSet {
  features: Vec<FeatureKind>,
}

impl FeatureSet {
  pub fn new(features: Vec<FeatureKind>) -> FeatureSet {
    FeatureSet { features }
  }

  /// The default structural feature stack, without visual or identifier
  /// features.
  pub fn structural() -> FeatureSet {
    FeatureSet::new(vec![
      FeatureKind::Depth,
      FeatureKind::IsLeaf,
      FeatureKind::CharCategories,
    ])
  }

  pub fn kinds(&self) -> &[FeatureKind] {
    &self.features
  }

  /// Total feature vector width.
  pub fn dimension(&self, live: &LiveContext) -> usize {
    self.features.iter().map(|f| f.dimension(live)).sum()
  }

  /// Description of each feature vector column, in registration order.
  pub fn labels(&self, live: &LiveContext) -> Vec<String> {
    self.features.iter().flat_map(|f| f.labels(live)).collect()
  }

  /// Runs every feature's `prepare` over every node of a page.
  pub fn prepare_page(&self, dom: &DomTree, nodes: &PageNodes, root: &mut RootContext) {
    for feature in &self.features {
      for &id in nodes.nodes() {
        feature.prepare(dom, id, root);
      }
    }
  }

  /// Concatenates every feature's output for one node, in registration
  /// order.
  pub fn compute_row(&self, ctx: &PageContext, id: NodeId) -> Result<Vec<f32>> {
    let mut row = Vec::with_capacity(self.dimension(ctx.live()));
    for feature in &self.features {
      row.extend(feature.compute(ctx, id)?);
    }
    Ok(row)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::dom::DomTree;

  fn dom(html: &str) -> DomTree {
    let mut dom = DomTree::from_html(html).unwrap();
    dom.filter_nodes();
    dom
  }

  fn text_node(dom: &DomTree) -> NodeId {
    dom
      .nodes()
      .iter()
      .copied()
      .find(|&id| dom.is_text(id))
      .unwrap()
  }

  #[test]
  fn depth_is_relative_to_page_maximum() {
    let dom = dom("<html><body><div><p>deep</p></div></body></html>");
    let live = RootContext::default().freeze();
    let ctx = PageContext::new(&live, &dom, &DefaultNodePredicate);
    let root_row = FeatureKind::Depth.compute(&ctx, dom.root()).unwrap();
    assert_eq!(root_row, vec![0.0]);
    let text = text_node(&dom);
    let text_row = FeatureKind::Depth.compute(&ctx, text).unwrap();
    assert_eq!(text_row, vec![1.0]);
  }

  #[test]
  fn is_leaf_marks_text_nodes() {
    let dom = dom("<html><body><p>t</p></body></html>");
    let live = RootContext::default().freeze();
    let ctx = PageContext::new(&live, &dom, &DefaultNodePredicate);
    let text = text_node(&dom);
    assert_eq!(FeatureKind::IsLeaf.compute(&ctx, text).unwrap(), vec![1.0]);
    assert_eq!(
      FeatureKind::IsLeaf.compute(&ctx, dom.root()).unwrap(),
      vec![0.0]
    );
  }

  #[test]
  fn char_categories_count_dollars_letters_digits() {
    let dom = dom("<html><body><p>$5 World</p></body></html>");
    let live = RootContext::default().freeze();
    let ctx = PageContext::new(&live, &dom, &DefaultNodePredicate);
    let text = text_node(&dom);
    assert_eq!(
      FeatureKind::CharCategories.compute(&ctx, text).unwrap(),
      vec![1.0, 5.0, 1.0]
    );
  }

  #[test]
  fn char_identifiers_prepare_respects_cutoffs() {
    let dom = dom("<html><body><p>alpha beta gamma delta</p></body></html>");
    let mut root = RootContext::new(Some(2), Some(3));
    let text = text_node(&dom);
    FeatureKind::CharIdentifiers.prepare(&dom, text, &mut root);
    // Only two tokens counted, each truncated to three characters.
    assert_eq!(root.max_num_words, 2);
    assert_eq!(root.max_word_len, 3);
    let expected: std::collections::BTreeSet<char> = "alpbet".chars().collect();
    assert_eq!(root.chars, expected);
  }

  #[test]
  fn char_identifiers_compute_uses_frozen_dictionary() {
    let dom = dom("<html><body><p>ab ba</p></body></html>");
    let mut root = RootContext::default();
    let text = text_node(&dom);
    FeatureKind::CharIdentifiers.prepare(&dom, text, &mut root);
    assert_eq!(root.max_num_words, 2);
    assert_eq!(root.max_word_len, 2);
    let live = root.freeze();
    let ctx = PageContext::new(&live, &dom, &DefaultNodePredicate);
    let row = FeatureKind::CharIdentifiers.compute(&ctx, text).unwrap();
    let a = live.char_id('a') as f32;
    let b = live.char_id('b') as f32;
    assert_eq!(row, vec![a, b, b, a]);
  }

  #[test]
  fn word_identifiers_compute_pads_unknown() {
    let seen = dom("<html><body><p>hello there</p></body></html>");
    let mut root = RootContext::default();
    let text = text_node(&seen);
    FeatureKind::WordIdentifiers.prepare(&seen, text, &mut root);
    let live = root.freeze();
    let ctx = PageContext::new(&live, &seen, &DefaultNodePredicate);
    let row = FeatureKind::WordIdentifiers.compute(&ctx, text).unwrap();
    assert_eq!(row.len(), 2);
    assert!(row.iter().all(|&id| id > 0.0));

    let other = dom("<html><body><p>unseen words</p></body></html>");
    let other_ctx = PageContext::new(&live, &other, &DefaultNodePredicate);
    let other_text = text_node(&other);
    let other_row = FeatureKind::WordIdentifiers
      .compute(&other_ctx, other_text)
      .unwrap();
    assert_eq!(other_row, vec![0.0, 0.0]);
  }

  #[test]
  fn visuals_inherit_from_container() {
    let mut dom = dom("<html><body><p>t</p></body></html>");
    let p = dom
      .nodes()
      .iter()
      .copied()
      .find(|&id| dom.html_tag(id) == Some("p"))
      .unwrap();
    dom.node_mut(p).visuals.insert("font_size".to_string(), 16.0);
    dom.node_mut(p).visuals.insert("font_weight".to_string(), 7.0);
    let live = RootContext::default().freeze();
    let ctx = PageContext::new(&live, &dom, &DefaultNodePredicate);
    let text = dom.node(p).children()[0];
    assert_eq!(
      FeatureKind::Visuals.compute(&ctx, text).unwrap(),
      vec![16.0, 7.0]
    );
  }

  #[test]
  fn feature_set_concatenates_in_registration_order() {
    let dom = dom("<html><body><p>$9</p></body></html>");
    let live = RootContext::default().freeze();
    let set = FeatureSet::new(vec![FeatureKind::IsLeaf, FeatureKind::CharCategories]);
    let ctx = PageContext::new(&live, &dom, &DefaultNodePredicate);
    let text = text_node(&dom);
    let row = set.compute_row(&ctx, text).unwrap();
    assert_eq!(row, vec![1.0, 1.0, 0.0, 1.0]);
    assert_eq!(set.dimension(&live), 4);
    assert_eq!(
      set.labels(&live),
      vec!["is_leaf", "dollars", "letters", "digits"]
    );
  }
}
