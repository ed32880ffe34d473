//! Dataset orchestration: label maps, the two-phase feature lifecycle, and
//! the per-page sample cache.
//!
//! Preparation mutates the shared [`RootContext`] and is therefore
//! sequential by construction (`prepare_features` takes `&mut self`; no
//! parallel variant exists). Computation runs against a frozen
//! [`LiveContext`] and parallelizes across pages with rayon: workers share
//! nothing mutable and each writes its own cache slot, so no locking beyond
//! the in-memory slot map is needed. A page either computes fully and is
//! recorded, or fails and surfaces; samples are written through a temp file
//! and renamed so a failed run never leaves a half-written cache entry.

use crate::dom::{DomTree, LabelSelector, NodeId};
use crate::error::{CacheError, Error, LabelError, Result};
use crate::features::{
  DefaultNodePredicate, FeatureSet, LiveContext, NodePredicate, PageContext, PageNodes,
  RootContext,
};
use crate::page::Page;
use crate::visual::{self, DomData};
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

const SAMPLE_MAGIC: &[u8; 4] = b"DGSM";
const SAMPLE_VERSION: u8 = 1;

/// Which distance the visual-neighbor computation uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NeighborDistance {
  CenterPoint,
  Rect,
}

/// Knobs controlling graph construction and feature extraction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExtractionParams {
  /// Maximum number of words preserved per node (`None` = all).
  pub cutoff_words: Option<u32>,
  /// Maximum number of characters preserved per token (`None` = all).
  pub cutoff_word_length: Option<u32>,

  // Friend cycles
  pub friend_cycles: bool,
  pub max_ancestor_distance: usize,
  pub max_friends: usize,
  pub only_variable_nodes: bool,

  // Visual neighbors
  pub visual_neighbors: bool,
  pub n_neighbors: usize,
  pub neighbor_distance: NeighborDistance,

  /// Expand gold locations to their leaf descendants before labeling.
  pub propagate_labels_to_leaves: bool,
  /// Load the extractor's visual-attributes JSON onto the graph.
  pub load_visuals: bool,
  /// Emit a classification-target mask marking text nodes.
  pub classify_only_text_nodes: bool,
}

impl Default for ExtractionParams {
  fn default() -> Self {
    Self {
      cutoff_words: None,
      cutoff_word_length: None,
      friend_cycles: false,
      max_ancestor_distance: 5,
      max_friends: 10,
      only_variable_nodes: false,
      visual_neighbors: false,
      n_neighbors: 4,
      neighbor_distance: NeighborDistance::Rect,
      propagate_labels_to_leaves: false,
      load_visuals: false,
      classify_only_text_nodes: false,
    }
  }
}

/// Bidirectional gold-field-name <-> dense-id table shared by every split
/// of a collection. Id 0 is the unlabeled slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LabelMap {
  ids: FxHashMap<String, i64>,
  names: Vec<Option<String>>,
}

impl LabelMap {
  pub fn new() -> LabelMap {
    LabelMap {
      ids: FxHashMap::default(),
      names: vec![None],
    }
  }

  pub const UNLABELED: i64 = 0;

  pub fn get_or_insert(&mut self, field: &str) -> i64 {
    if let Some(&id) = self.ids.get(field) {
      return id;
    }
    let id = self.names.len() as i64;
    self.ids.insert(field.to_string(), id);
    self.names.push(Some(field.to_string()));
    id
  }

  pub fn id_of(&self, field: &str) -> Option<i64> {
    self.ids.get(field).copied()
  }

  /// Field name for an id; `Some(None)` is the unlabeled slot.
  pub fn name_of(&self, id: i64) -> Option<Option<&str>> {
    self.names.get(id as usize).map(Option::as_deref)
  }

  /// Number of ids, including the unlabeled slot.
  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.len() <= 1
  }
}

/// Dense nodes-by-features matrix in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureMatrix {
  pub rows: usize,
  pub cols: usize,
  pub data: Vec<f32>,
}

impl FeatureMatrix {
  pub fn row(&self, index: usize) -> &[f32] {
    &self.data[index * self.cols..(index + 1) * self.cols]
  }
}

/// Directed edges as parallel source/target columns, child edges first,
/// then parent edges. Indices are dataset indices, never deep indices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EdgeList {
  pub sources: Vec<u32>,
  pub targets: Vec<u32>,
}

impl EdgeList {
  pub fn len(&self) -> usize {
    self.sources.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sources.is_empty()
  }
}

/// One page's persisted graph sample.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
  pub features: FeatureMatrix,
  pub labels: Vec<i64>,
  pub edges: EdgeList,
  pub target_mask: Option<Vec<bool>>,
}

impl Sample {
  pub fn to_bytes(&self) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend_from_slice(SAMPLE_MAGIC);
    out.push(SAMPLE_VERSION);
    let body = postcard::to_allocvec(self).map_err(CacheError::Postcard)?;
    out.extend_from_slice(&body);
    Ok(out)
  }

  pub fn from_bytes(bytes: &[u8], path: &str) -> Result<Sample> {
    if bytes.len() < 5 || &bytes[..4] != SAMPLE_MAGIC {
      return Err(Error::Cache(CacheError::BadMagic {
        kind: "sample",
        path: path.to_string(),
      }));
    }
    if bytes[4] != SAMPLE_VERSION {
      return Err(Error::Cache(CacheError::UnsupportedVersion {
        kind: "sample",
        path: path.to_string(),
        version: bytes[4],
      }));
    }
    Ok(postcard::from_bytes(&bytes[5..]).map_err(CacheError::Postcard)?)
  }

  /// Writes through a sibling temp file and renames, so readers never see
  /// a partially written sample.
  pub fn write_to(&self, path: &Path) -> Result<()> {
    let tmp = temp_path(path);
    fs::write(&tmp, self.to_bytes()?)?;
    fs::rename(&tmp, path)?;
    Ok(())
  }

  pub fn read_from(path: &Path) -> Result<Sample> {
    let bytes = fs::read(path)?;
    Sample::from_bytes(&bytes, &path.display().to_string())
  }
}

fn temp_path(path: &Path) -> PathBuf {
  let mut name = path.file_name().unwrap_or_default().to_os_string();
  name.push(".tmp");
  path.with_file_name(name)
}

fn backup_path(path: &Path) -> PathBuf {
  let mut name = path.file_name().unwrap_or_default().to_os_string();
  name.push(".bak");
  path.with_file_name(name)
}

/// How [`Dataset::delete_saved`] invalidates cached samples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteMode {
  Remove,
  Backup,
}

/// One split (train/val/test) of a collection.
pub struct Dataset {
  name: String,
  pages: Vec<Arc<dyn Page>>,
  memory: Mutex<FxHashMap<String, Arc<Sample>>>,
}

impl Dataset {
  fn new(name: &str, pages: Vec<Arc<dyn Page>>) -> Dataset {
    Dataset {
      name: name.to_string(),
      pages,
      memory: Mutex::new(FxHashMap::default()),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn pages(&self) -> &[Arc<dyn Page>] {
    &self.pages
  }

  /// Whether a sample exists at the page's cache slot.
  pub fn has_cached(&self, page: &dyn Page) -> bool {
    match page.data_point_slot() {
      Some(path) => path.exists(),
      None => self
        .memory
        .lock()
        .expect("sample cache mutex poisoned")
        .contains_key(&page.identifier()),
    }
  }

  /// True iff the page still needs computation under skip-existing
  /// semantics.
  pub fn will_compute(&self, page: &dyn Page) -> bool {
    !self.has_cached(page)
  }

  /// Reads the page's cached sample, if any.
  pub fn cached_sample(&self, page: &dyn Page) -> Result<Option<Arc<Sample>>> {
    match page.data_point_slot() {
      Some(path) => {
        if !path.exists() {
          return Ok(None);
        }
        Ok(Some(Arc::new(Sample::read_from(&path)?)))
      }
      None => Ok(
        self
          .memory
          .lock()
          .expect("sample cache mutex poisoned")
          .get(&page.identifier())
          .cloned(),
      ),
    }
  }

  fn store(&self, page: &dyn Page, sample: Sample) -> Result<()> {
    match page.data_point_slot() {
      Some(path) => sample.write_to(&path),
      None => {
        self
          .memory
          .lock()
          .expect("sample cache mutex poisoned")
          .insert(page.identifier(), Arc::new(sample));
        Ok(())
      }
    }
  }

  /// Invalidates every cached sample of this split. Idempotent; returns the
  /// number of samples affected.
  pub fn delete_saved(&self, mode: DeleteMode) -> Result<usize> {
    let mut count = 0;
    for page in &self.pages {
      match page.data_point_slot() {
        Some(path) => {
          if path.exists() {
            match mode {
              DeleteMode::Remove => fs::remove_file(&path)?,
              DeleteMode::Backup => fs::rename(&path, backup_path(&path))?,
            }
            count += 1;
          }
        }
        None => {
          let mut memory = self.memory.lock().expect("sample cache mutex poisoned");
          if memory.remove(&page.identifier()).is_some() {
            count += 1;
          }
        }
      }
    }
    Ok(count)
  }
}

/// A set of splits sharing one label map, feature set, and root context.
pub struct DatasetCollection {
  params: ExtractionParams,
  features: FeatureSet,
  predicate: Box<dyn NodePredicate + Send>,
  root: RootContext,
  label_map: Option<LabelMap>,
  splits: Vec<Dataset>,
}

impl DatasetCollection {
  pub fn new(params: ExtractionParams, features: FeatureSet) -> DatasetCollection {
    let root = RootContext::new(params.cutoff_words, params.cutoff_word_length);
    DatasetCollection {
      params,
      features,
      predicate: Box::new(DefaultNodePredicate),
      root,
      label_map: None,
      splits: Vec::new(),
    }
  }

  pub fn with_predicate(mut self, predicate: Box<dyn NodePredicate + Send>) -> DatasetCollection {
    self.predicate = predicate;
    self
  }

  /// Replaces the root context with one restored from disk. The restored
  /// context must echo this collection's cutoff configuration.
  pub fn set_root_context(&mut self, root: RootContext) -> Result<()> {
    let mut expected = RootContext::new(self.params.cutoff_words, self.params.cutoff_word_length);
    expected.merge_with(&root)?;
    self.root = root;
    Ok(())
  }

  pub fn root_context(&self) -> &RootContext {
    &self.root
  }

  pub fn params(&self) -> &ExtractionParams {
    &self.params
  }

  pub fn features(&self) -> &FeatureSet {
    &self.features
  }

  pub fn label_map(&self) -> Option<&LabelMap> {
    self.label_map.as_ref()
  }

  pub fn split(&self, name: &str) -> Option<&Dataset> {
    self.splits.iter().find(|s| s.name == name)
  }

  fn split_named(&self, name: &str) -> Result<&Dataset> {
    self
      .split(name)
      .ok_or_else(|| Error::Other(format!("Unknown dataset split '{name}'")))
  }

  /// Adds a split. The first split builds the shared label map from its
  /// pages' fields; every later split must only use fields already present.
  pub fn add_split(&mut self, name: &str, pages: Vec<Arc<dyn Page>>) -> Result<()> {
    match &self.label_map {
      None => {
        let mut map = LabelMap::new();
        for page in &pages {
          for field in page.fields() {
            map.get_or_insert(&field);
          }
        }
        self.label_map = Some(map);
      }
      Some(map) => {
        for page in &pages {
          for field in page.fields() {
            if map.id_of(&field).is_none() {
              return Err(Error::Label(LabelError::MapMismatch {
                page: page.identifier(),
                field,
              }));
            }
          }
        }
      }
    }
    self.splits.push(Dataset::new(name, pages));
    Ok(())
  }

  /// Parses, labels, filters, and enriches one page's DOM graph according
  /// to the collection's params.
  pub fn build_page_graph(&self, page: &dyn Page) -> Result<DomTree> {
    let html = page.html_text()?;
    let mut dom = DomTree::from_html(&html)?;

    let keys = page.label_keys();
    let selectors: Vec<LabelSelector> = keys
      .iter()
      .map(|key| LabelSelector {
        key: key.clone(),
        paths: page.labeled_paths(key),
      })
      .collect();
    dom.assign_labels(
      &page.identifier(),
      &selectors,
      self.params.propagate_labels_to_leaves,
    )?;
    dom.mark_variable_text(&page.variable_text_paths());
    dom.filter_nodes();

    if self.params.load_visuals {
      if let Some(json) = page.visuals_json()? {
        let data = DomData::from_json(&json, &format!("{}:visuals", page.identifier()))?;
        let nodes = dom.nodes().to_vec();
        data.load_all(&mut dom, &nodes)?;
      }
      let labeled: Vec<NodeId> = keys
        .iter()
        .flat_map(|key| dom.labeled_nodes(key).to_vec())
        .collect();
      visual::require_boxes(&dom, &labeled, &page.identifier())?;
    }

    if self.params.friend_cycles {
      dom.compute_friend_cycles(
        self.params.max_ancestor_distance,
        self.params.max_friends,
        self.params.only_variable_nodes,
      );
    }
    if self.params.visual_neighbors {
      match self.params.neighbor_distance {
        NeighborDistance::CenterPoint => dom.compute_visual_neighbors(self.params.n_neighbors),
        NeighborDistance::Rect => dom.compute_visual_neighbors_rect(self.params.n_neighbors),
      }
    }
    Ok(dom)
  }

  /// True iff the page's identifier is absent from the root context's page
  /// set (skip-existing semantics).
  pub fn will_prepare(&self, page: &dyn Page) -> bool {
    !self.root.pages.contains(&page.identifier())
  }

  /// Runs every feature's `prepare` over every node of every page still
  /// needing preparation, then records the page identifiers.
  ///
  /// The only phase mutating the shared root context; runs sequentially
  /// and no parallel variant is exposed.
  pub fn prepare_features(&mut self, split: &str, force: bool) -> Result<usize> {
    let pages: Vec<Arc<dyn Page>> = self.split_named(split)?.pages.to_vec();
    let mut processed = 0;
    for page in pages {
      if !force && !self.will_prepare(&*page) {
        continue;
      }
      let dom = self.build_page_graph(&*page)?;
      let nodes = PageNodes::collect(&dom, &*self.predicate);
      self.features.prepare_page(&dom, &nodes, &mut self.root);
      self.root.pages.insert(page.identifier());
      processed += 1;
    }
    Ok(processed)
  }

  /// Freezes the root context and computes samples for every page still
  /// needing one, in parallel across pages. Returns the number of pages
  /// processed; a second run with skip-existing semantics processes zero.
  pub fn compute_features(
    &self,
    split: &str,
    parallelism: Option<usize>,
    force: bool,
  ) -> Result<usize> {
    let dataset = self.split_named(split)?;
    let live = self.root.freeze();
    let pending: Vec<Arc<dyn Page>> = dataset
      .pages
      .iter()
      .filter(|page| force || dataset.will_compute(&***page))
      .cloned()
      .collect();

    let pool = rayon::ThreadPoolBuilder::new()
      .num_threads(parallelism.unwrap_or(0))
      .build()
      .map_err(|e| Error::Other(format!("Failed to build worker pool: {e}")))?;
    pool.install(|| {
      pending
        .par_iter()
        .try_for_each(|page| self.compute_page(dataset, &**page, &live))
    })?;
    Ok(pending.len())
  }

  fn compute_page(&self, dataset: &Dataset, page: &dyn Page, live: &LiveContext) -> Result<()> {
    let label_map = self
      .label_map
      .as_ref()
      .ok_or_else(|| Error::Other("No splits added to the collection".to_string()))?;

    let dom = self.build_page_graph(page)?;
    let ctx = PageContext::new(live, &dom, &*self.predicate);
    let nodes = ctx.nodes().to_vec();

    let cols = self.features.dimension(live);
    let mut data = Vec::with_capacity(nodes.len() * cols);
    for &id in &nodes {
      data.extend(self.features.compute_row(&ctx, id)?);
    }
    let features = FeatureMatrix {
      rows: nodes.len(),
      cols,
      data,
    };

    let mut labels = Vec::with_capacity(nodes.len());
    for &id in &nodes {
      let id_value = match dom.node(id).label_keys.first() {
        None => LabelMap::UNLABELED,
        Some(key) => label_map.id_of(key).ok_or_else(|| {
          Error::Label(LabelError::MapMismatch {
            page: page.identifier(),
            field: key.clone(),
          })
        })?,
      };
      labels.push(id_value);
    }

    let edges = build_edges(&dom, ctx.page_nodes(), &nodes);

    let target_mask = self
      .params
      .classify_only_text_nodes
      .then(|| nodes.iter().map(|&id| dom.is_text(id)).collect());

    let sample = Sample {
      features,
      labels,
      edges,
      target_mask,
    };
    dataset.store(page, sample)
  }
}

/// Builds the bidirectional parent/child edge list over dataset indices:
/// first an edge from each node to each surviving child, then an edge from
/// each node to its parent, in that fixed order. Endpoints without a
/// dataset index (filtered or predicate-excluded) contribute no edge.
fn build_edges(dom: &DomTree, page_nodes: &PageNodes, nodes: &[NodeId]) -> EdgeList {
  let mut edges = EdgeList::default();
  for &id in nodes {
    let Some(source) = page_nodes.dataset_index(id) else {
      continue;
    };
    for &child in dom.node(id).children() {
      if let Some(target) = page_nodes.dataset_index(child) {
        edges.sources.push(source.0);
        edges.targets.push(target.0);
      }
    }
  }
  for &id in nodes {
    let Some(source) = page_nodes.dataset_index(id) else {
      continue;
    };
    if let Some(parent) = dom.node(id).parent {
      if let Some(target) = page_nodes.dataset_index(parent) {
        edges.sources.push(source.0);
        edges.targets.push(target.0);
      }
    }
  }
  edges
}
