//! Two-tier feature contexts.
//!
//! [`RootContext`] aggregates statistics across every page ever prepared and
//! persists between runs; it is mutated only during the prepare phase.
//! [`RootContext::freeze`] turns it into a [`LiveContext`] carrying the
//! finalized dictionaries. Compute-phase APIs accept only [`LiveContext`],
//! so a compute call against an accumulating context cannot be expressed.
//! [`PageContext`] is ephemeral, one per page per access, and holds the
//! predicate-filtered node list plus page-local caches.

use crate::dom::{DomTree, NodeId};
use crate::error::{CacheError, ContextError, Error, Result};
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::cell::{Cell, OnceCell};
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

const ROOT_CONTEXT_MAGIC: &[u8; 4] = b"DGRC";
const ROOT_CONTEXT_VERSION: u8 = 1;

/// Statistics scoped to all pages, persisted across runs.
///
/// Mutated only while preparing features; the page-identifier set guards
/// against preparing the same page twice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootContext {
  /// Identifiers of pages already used for feature preparation.
  pub pages: BTreeSet<String>,

  /// All characters present in processed nodes.
  pub chars: BTreeSet<char>,

  /// All word tokens present in processed nodes.
  pub words: BTreeSet<String>,

  /// Length of the longest (cut-off) word, in characters.
  pub max_word_len: u32,

  /// Number of words in the longest node, up to `cutoff_words`.
  pub max_num_words: u32,

  /// Maximum number of words preserved per node, or `None` for all.
  pub cutoff_words: Option<u32>,

  /// Maximum number of characters preserved per token, or `None` for all.
  pub cutoff_word_length: Option<u32>,
}

impl RootContext {
  pub fn new(cutoff_words: Option<u32>, cutoff_word_length: Option<u32>) -> RootContext {
    RootContext {
      cutoff_words,
      cutoff_word_length,
      ..RootContext::default()
    }
  }

  fn check_options(&self, other: &RootContext) -> Result<()> {
    if self.cutoff_words != other.cutoff_words {
      return Err(Error::Context(ContextError::ConfigMismatch {
        option: "cutoff_words".to_string(),
        left: format!("{:?}", self.cutoff_words),
        right: format!("{:?}", other.cutoff_words),
      }));
    }
    if self.cutoff_word_length != other.cutoff_word_length {
      return Err(Error::Context(ContextError::ConfigMismatch {
        option: "cutoff_word_length".to_string(),
        left: format!("{:?}", self.cutoff_word_length),
        right: format!("{:?}", other.cutoff_word_length),
      }));
    }
    Ok(())
  }

  /// Merges a parallel worker's partial context into this one: set union
  /// plus element-wise max. Fails hard when the two contexts were built
  /// under different cutoff configurations.
  pub fn merge_with(&mut self, other: &RootContext) -> Result<()> {
    self.check_options(other)?;
    self.pages.extend(other.pages.iter().cloned());
    self.chars.extend(other.chars.iter().copied());
    self.words.extend(other.words.iter().cloned());
    self.max_word_len = self.max_word_len.max(other.max_word_len);
    self.max_num_words = self.max_num_words.max(other.max_num_words);
    Ok(())
  }

  /// One-line summary for progress output.
  pub fn describe(&self) -> String {
    format!(
      "pages={} chars={} words={} max_num_words={} max_word_len={}",
      self.pages.len(),
      self.chars.len(),
      self.words.len(),
      self.max_num_words,
      self.max_word_len
    )
  }

  /// Loads the persisted context, or starts an empty one when the file does
  /// not exist. An existing context must echo the requested cutoffs.
  pub fn load_or_new(
    path: &Path,
    cutoff_words: Option<u32>,
    cutoff_word_length: Option<u32>,
  ) -> Result<RootContext> {
    if !path.exists() {
      return Ok(RootContext::new(cutoff_words, cutoff_word_length));
    }
    let bytes = fs::read(path)?;
    let context = RootContext::from_bytes(&bytes, &path.display().to_string())?;
    context.check_options(&RootContext::new(cutoff_words, cutoff_word_length))?;
    Ok(context)
  }

  pub fn save(&self, path: &Path) -> Result<()> {
    fs::write(path, self.to_bytes()?)?;
    Ok(())
  }

  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(ROOT_CONTEXT_MAGIC);
    out.push(ROOT_CONTEXT_VERSION);
    let body = postcard::to_allocvec(self).map_err(CacheError::Postcard)?;
    out.extend_from_slice(&body);
    Ok(out)
  }

  pub fn from_bytes(bytes: &[u8], path: &str) -> Result<RootContext> {
    if bytes.len() < 5 || &bytes[..4] != ROOT_CONTEXT_MAGIC {
      return Err(Error::Cache(CacheError::BadMagic {
        kind: "root context",
        path: path.to_string(),
      }));
    }
    if bytes[4] != ROOT_CONTEXT_VERSION {
      return Err(Error::Cache(CacheError::UnsupportedVersion {
        kind: "root context",
        path: path.to_string(),
        version: bytes[4],
      }));
    }
    Ok(postcard::from_bytes(&bytes[5..]).map_err(CacheError::Postcard)?)
  }

  /// Finalizes the accumulated statistics into dictionaries.
  ///
  /// Compute-phase APIs take [`LiveContext`], so freezing is the only path
  /// from preparation to computation.
  pub fn freeze(&self) -> LiveContext {
    let char_dict = self
      .chars
      .iter()
      .enumerate()
      .map(|(i, &c)| (c, i as u32 + 1))
      .collect();
    let word_dict = self
      .words
      .iter()
      .enumerate()
      .map(|(i, w)| (w.clone(), i as u32 + 1))
      .collect();
    LiveContext {
      root: self.clone(),
      char_dict,
      word_dict,
    }
  }
}

/// Frozen root context plus the dictionaries derived from it.
///
/// Identifier 0 is reserved for unknown/padding in both dictionaries.
pub struct LiveContext {
  pub root: RootContext,
  pub char_dict: FxHashMap<char, u32>,
  pub word_dict: FxHashMap<String, u32>,
}

impl LiveContext {
  pub fn char_id(&self, c: char) -> u32 {
    self.char_dict.get(&c).copied().unwrap_or(0)
  }

  pub fn word_id(&self, word: &str) -> u32 {
    self.word_dict.get(word).copied().unwrap_or(0)
  }
}

/// Decides which nodes belong to a feature context.
///
/// Node inclusion and descendant traversal are independent so callers can
/// express both "exclude the subtree" and "exclude the node but keep its
/// children".
pub trait NodePredicate: Sync {
  fn include_node(&self, dom: &DomTree, id: NodeId) -> bool {
    let _ = (dom, id);
    true
  }

  fn include_descendants(&self, dom: &DomTree, id: NodeId) -> bool {
    let _ = (dom, id);
    true
  }
}

/// Includes every surviving node.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultNodePredicate;

impl NodePredicate for DefaultNodePredicate {}

/// Secondary index into a feature context's filtered node list.
///
/// Distinct namespace from `deep_index`: this one is recomputed per context
/// and is what edge construction uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DatasetIndex(pub u32);

/// Predicate-filtered node list with per-context dataset indices.
pub struct PageNodes {
  nodes: Vec<NodeId>,
  dataset_index: Vec<Option<DatasetIndex>>,
}

impl PageNodes {
  /// Traverses the filtered tree in pre-order, collecting included nodes
  /// and assigning [`DatasetIndex`] in iteration order.
  pub fn collect(dom: &DomTree, predicate: &dyn NodePredicate) -> PageNodes {
    let mut nodes = Vec::new();
    let mut stack = vec![dom.root()];
    while let Some(id) = stack.pop() {
      if predicate.include_node(dom, id) {
        nodes.push(id);
      }
      if predicate.include_descendants(dom, id) {
        stack.extend(dom.node(id).children().iter().rev().copied());
      }
    }

    let arena_len = dom
      .nodes()
      .iter()
      .map(|&id| id.index() + 1)
      .max()
      .unwrap_or(0);
    let mut dataset_index = vec![None; arena_len];
    for (index, &id) in nodes.iter().enumerate() {
      dataset_index[id.index()] = Some(DatasetIndex(index as u32));
    }
    PageNodes {
      nodes,
      dataset_index,
    }
  }

  pub fn nodes(&self) -> &[NodeId] {
    &self.nodes
  }

  pub fn dataset_index(&self, id: NodeId) -> Option<DatasetIndex> {
    self.dataset_index.get(id.index()).copied().flatten()
  }
}

/// Everything needed to compute one page's features. Ephemeral; destroyed
/// after the page's sample is assembled.
pub struct PageContext<'a> {
  live: &'a LiveContext,
  dom: &'a DomTree,
  predicate: &'a dyn NodePredicate,
  nodes: OnceCell<PageNodes>,
  max_depth: Cell<Option<u32>>,
}

impl<'a> PageContext<'a> {
  pub fn new(live: &'a LiveContext, dom: &'a DomTree, predicate: &'a dyn NodePredicate) -> Self {
    PageContext {
      live,
      dom,
      predicate,
      nodes: OnceCell::new(),
      max_depth: Cell::new(None),
    }
  }

  pub fn live(&self) -> &LiveContext {
    self.live
  }

  pub fn root(&self) -> &RootContext {
    &self.live.root
  }

  pub fn dom(&self) -> &DomTree {
    self.dom
  }

  /// Lazily computed, memoized filtered node list.
  pub fn page_nodes(&self) -> &PageNodes {
    self
      .nodes
      .get_or_init(|| PageNodes::collect(self.dom, self.predicate))
  }

  pub fn nodes(&self) -> &[NodeId] {
    self.page_nodes().nodes()
  }

  /// Maximum DOM depth over the context's nodes; memoized per page.
  pub fn max_depth(&self) -> usize {
    if let Some(depth) = self.max_depth.get() {
      return depth as usize;
    }
    let depth = self
      .nodes()
      .iter()
      .map(|&id| self.dom.node(id).depth())
      .max()
      .unwrap_or(0) as u32;
    self.max_depth.set(Some(depth));
    depth as usize
  }
}
