//! In-memory DOM graph built over a [`ParseTree`].
//!
//! [`DomTree`] owns the parse tree and an arena of [`Node`]s; children lists
//! are the only ownership edges, parent/tree links are plain ids, so ancestor
//! walks are O(1) per step and there are no reference cycles.
//!
//! Two distinct index namespaces exist and must never be conflated:
//! - `deep_index`: pre-order position assigned once at build time, stable
//!   across filtering. Equal to the node's arena position.
//! - `dataset_index`: position within a feature context's filtered node list,
//!   assigned per context (see [`crate::features::PageContext`]) and used only
//!   for edge/tensor construction.

use crate::error::{Error, LabelError, Result};
use crate::page::IndexPath;
use crate::parsing::{normalize_text, ParseNodeId, ParseTree};
use crate::visual::BoundingBox;
use rstar::primitives::GeomWithData;
use rstar::RTree;
use rustc_hash::{FxHashMap, FxHashSet};

/// Index of a node in the [`DomTree`] arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
  pub fn index(self) -> usize {
    self.0 as usize
  }
}

/// A visually close node, with signed per-axis center distances
/// (neighbor minus node).
#[derive(Debug, Clone, PartialEq)]
pub struct VisualNeighbor {
  pub distance: f64,
  pub distance_x: f64,
  pub distance_y: f64,
  pub neighbor: NodeId,
}

/// One DOM node surviving the parse-time tag stripping.
#[derive(Debug, Clone)]
pub struct Node {
  parse: ParseNodeId,
  pub parent: Option<NodeId>,
  children: Vec<NodeId>,
  depth: u32,

  /// Pre-order position assigned at build time; stable across filtering.
  pub deep_index: usize,

  /// Label keys of the node, `[]` if unlabeled. Ordered by the page's
  /// label-key order, so the first entry is the node's scalar label.
  pub label_keys: Vec<String>,

  /// Text nodes within bounded ancestor distance. `None` until
  /// [`DomTree::compute_friend_cycles`] runs.
  pub friends: Option<Vec<NodeId>>,

  /// The other text node under an ancestor with exactly two text
  /// descendants in range. Always a member of `friends` when set.
  pub partner: Option<NodeId>,

  /// Whether this text node's value varies across pages of the same site.
  /// Supplied externally by dataset adapters.
  pub is_variable_text: bool,

  /// Bounding box from the visual extractor, when loaded.
  pub bounds: Option<BoundingBox>,

  /// Visual attribute name -> parsed value.
  pub visuals: FxHashMap<String, f32>,

  /// Closest nodes visually, sorted by distance ascending. `None` until a
  /// neighbor computation runs.
  pub visual_neighbors: Option<Vec<VisualNeighbor>>,
}

impl Node {
  pub fn parse_id(&self) -> ParseNodeId {
    self.parse
  }

  /// Children surviving so far. Before [`DomTree::filter_nodes`] this is the
  /// original child list; afterwards detached children are pruned.
  pub fn children(&self) -> &[NodeId] {
    &self.children
  }

  pub fn depth(&self) -> usize {
    self.depth as usize
  }
}

/// Per-page owner of the parse tree and the derived node graph.
pub struct DomTree {
  parse: ParseTree,
  arena: Vec<Node>,
  nodes: Vec<NodeId>,
  parse_to_node: Vec<Option<NodeId>>,
  labeled_nodes: FxHashMap<String, Vec<NodeId>>,
  friend_cycles_computed: bool,
}

/// Gold locations for one label key, as root-relative index paths into the
/// original (pre-filter) tree.
#[derive(Debug, Clone)]
pub struct LabelSelector {
  pub key: String,
  pub paths: Vec<IndexPath>,
}

impl DomTree {
  /// Builds the node graph in one pre-order traversal, assigning
  /// `deep_index` in traversal order. Runs before any filtering.
  pub fn build(parse: ParseTree) -> DomTree {
    let mut arena: Vec<Node> = Vec::with_capacity(parse.len());
    let mut parse_to_node: Vec<Option<NodeId>> = vec![None; parse.len()];

    let mut stack: Vec<(ParseNodeId, Option<NodeId>, u32)> = vec![(parse.root(), None, 0)];
    while let Some((parse_id, parent, depth)) = stack.pop() {
      let id = NodeId(arena.len() as u32);
      arena.push(Node {
        parse: parse_id,
        parent,
        children: Vec::new(),
        depth,
        deep_index: id.index(),
        label_keys: Vec::new(),
        friends: None,
        partner: None,
        is_variable_text: false,
        bounds: None,
        visuals: FxHashMap::default(),
        visual_neighbors: None,
      });
      parse_to_node[parse_id.index()] = Some(id);
      if let Some(parent) = parent {
        arena[parent.index()].children.push(id);
      }
      for &child in parse.children(parse_id).iter().rev() {
        stack.push((child, Some(id), depth + 1));
      }
    }

    let nodes = (0..arena.len()).map(|i| NodeId(i as u32)).collect();
    DomTree {
      parse,
      arena,
      nodes,
      parse_to_node,
      labeled_nodes: FxHashMap::default(),
      friend_cycles_computed: false,
    }
  }

  /// Parses and builds in one go.
  pub fn from_html(html: &str) -> Result<DomTree> {
    Ok(DomTree::build(crate::parsing::parse_html(html)?))
  }

  pub fn root(&self) -> NodeId {
    NodeId(0)
  }

  pub fn node(&self, id: NodeId) -> &Node {
    &self.arena[id.index()]
  }

  pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
    &mut self.arena[id.index()]
  }

  /// Flat node list in pre-order; after [`Self::filter_nodes`] it contains
  /// only non-detached nodes.
  pub fn nodes(&self) -> &[NodeId] {
    &self.nodes
  }

  pub fn parse_tree(&self) -> &ParseTree {
    &self.parse
  }

  pub fn labeled_nodes(&self, key: &str) -> &[NodeId] {
    self.labeled_nodes.get(key).map(Vec::as_slice).unwrap_or(&[])
  }

  pub fn friend_cycles_computed(&self) -> bool {
    self.friend_cycles_computed
  }

  pub fn is_detached(&self, id: NodeId) -> bool {
    self.parse.node(self.node(id).parse).detached
  }

  pub fn is_text(&self, id: NodeId) -> bool {
    self.parse.node(self.node(id).parse).is_text()
  }

  /// Shallow text content of a text node.
  pub fn text(&self, id: NodeId) -> Option<&str> {
    self.parse.node(self.node(id).parse).text()
  }

  pub fn normalized_text(&self, id: NodeId) -> Option<String> {
    self.text(id).map(normalize_text)
  }

  pub fn html_tag(&self, id: NodeId) -> Option<&str> {
    self.parse.node(self.node(id).parse).tag_name()
  }

  pub fn get_attribute(&self, id: NodeId, name: &str) -> Option<&str> {
    self.parse.node(self.node(id).parse).get_attribute(name)
  }

  /// Ancestors of `id`, nearest first, up to `max_distance` of them.
  pub fn ancestors(&self, id: NodeId, max_distance: usize) -> Vec<NodeId> {
    let mut out = Vec::new();
    let mut current = self.node(id).parent;
    while let Some(parent) = current {
      if out.len() >= max_distance {
        break;
      }
      out.push(parent);
      current = self.node(parent).parent;
    }
    out
  }

  /// Absolute `deep_index` distance between two nodes.
  pub fn index_distance(&self, a: NodeId, b: NodeId) -> usize {
    self.node(a).deep_index.abs_diff(self.node(b).deep_index)
  }

  /// Re-derives the flat node list to exclude detached nodes and prunes
  /// surviving nodes' children lists. Idempotent; `deep_index` values are
  /// untouched.
  pub fn filter_nodes(&mut self) {
    self.parse.filter_whitespace_text();
    let parse = &self.parse;
    let arena = &self.arena;
    let detached = |id: NodeId| parse.node(arena[id.index()].parse).detached;

    self.nodes.retain(|&id| !detached(id));
    let surviving: Vec<NodeId> = self.nodes.clone();
    for id in surviving {
      let kept: Vec<NodeId> = self.arena[id.index()]
        .children
        .iter()
        .copied()
        .filter(|&c| !self.parse.node(self.arena[c.index()].parse).detached)
        .collect();
      self.arena[id.index()].children = kept;
    }
  }

  /// Resolves a node from a root-relative path of child positions among
  /// *original* (pre-filter) children.
  pub fn find_by_index_path(&self, indices: &[usize]) -> Option<NodeId> {
    self.resolve_index_path(indices).ok()
  }

  fn resolve_index_path(&self, indices: &[usize]) -> std::result::Result<NodeId, (usize, usize)> {
    let mut parse_id = self.parse.root();
    for (depth, &index) in indices.iter().enumerate() {
      let children = self.parse.children(parse_id);
      parse_id = *children.get(index).ok_or((depth, index))?;
    }
    Ok(
      self.parse_to_node[parse_id.index()]
        .expect("every parse node has a DOM node by construction"),
    )
  }

  /// Root-relative index path of `id` among original children; inverse of
  /// [`Self::find_by_index_path`].
  pub fn index_path(&self, id: NodeId) -> IndexPath {
    let mut path = Vec::new();
    let mut parse_id = self.node(id).parse;
    while let Some(parent) = self.parse.node(parse_id).parent {
      let position = self
        .parse
        .children(parent)
        .iter()
        .position(|&c| c == parse_id)
        .expect("child is present in its parent's child list");
      path.push(position);
      parse_id = parent;
    }
    path.reverse();
    path
  }

  /// Leaf descendants of `id` (nodes without children), or `id` itself when
  /// it is already a leaf.
  fn expand_leaves(&self, id: NodeId) -> Vec<NodeId> {
    if self.node(id).children.is_empty() {
      return vec![id];
    }
    let mut out = Vec::new();
    let mut stack = vec![id];
    while let Some(current) = stack.pop() {
      let children = &self.node(current).children;
      if children.is_empty() {
        out.push(current);
      } else {
        stack.extend(children.iter().rev().copied());
      }
    }
    out
  }

  /// Resolves each label key's gold locations and appends the key to every
  /// resolved node. The inverse key -> nodes map is retained for evaluation.
  ///
  /// With `propagate_to_leaves`, each resolved location expands to its leaf
  /// descendants before labeling. Must run before [`Self::filter_nodes`]
  /// so the original tree positions still resolve.
  pub fn assign_labels(
    &mut self,
    page: &str,
    selectors: &[LabelSelector],
    propagate_to_leaves: bool,
  ) -> Result<()> {
    self.labeled_nodes.clear();
    for node in &mut self.arena {
      node.label_keys.clear();
    }

    for selector in selectors {
      let mut resolved = Vec::new();
      for path in &selector.paths {
        let id = self.resolve_index_path(path).map_err(|(depth, index)| {
          Error::Label(LabelError::ResolutionFailed {
            page: page.to_string(),
            label_key: selector.key.clone(),
            path: path.clone(),
            depth,
            index,
          })
        })?;
        if propagate_to_leaves {
          resolved.extend(self.expand_leaves(id));
        } else {
          resolved.push(id);
        }
      }
      for &id in &resolved {
        self.arena[id.index()].label_keys.push(selector.key.clone());
      }
      self.labeled_nodes.insert(selector.key.clone(), resolved);
    }
    Ok(())
  }

  /// Marks externally-determined variable text nodes. Paths that no longer
  /// resolve are skipped.
  pub fn mark_variable_text(&mut self, paths: &[IndexPath]) {
    for path in paths {
      if let Some(id) = self.find_by_index_path(path) {
        self.arena[id.index()].is_variable_text = true;
      }
    }
  }

  /// Finds friends and partner for each text node.
  ///
  /// For every candidate text node, ancestors within `max_ancestor_distance`
  /// are indexed; a candidate's friends are all candidates sharing one of
  /// those ancestors. When an ancestor has exactly two candidate descendants
  /// in range, the other one becomes the partner; ancestors are visited
  /// nearest to farthest and later matches overwrite, so the farthest
  /// qualifying ancestor wins. Friend lists are truncated to the
  /// `max_friends` closest by `deep_index` distance (partner always kept)
  /// and stored in DOM order.
  pub fn compute_friend_cycles(
    &mut self,
    max_ancestor_distance: usize,
    max_friends: usize,
    only_variable_nodes: bool,
  ) {
    let targets: Vec<NodeId> = self
      .nodes
      .iter()
      .copied()
      .filter(|&id| {
        self.is_text(id) && (!only_variable_nodes || self.node(id).is_variable_text)
      })
      .collect();

    let mut descendants: FxHashMap<NodeId, Vec<NodeId>> = FxHashMap::default();
    for &id in &targets {
      for ancestor in self.ancestors(id, max_ancestor_distance) {
        descendants.entry(ancestor).or_default().push(id);
      }
    }

    let mut results: Vec<(NodeId, Vec<NodeId>, Option<NodeId>)> = Vec::with_capacity(targets.len());
    for &id in &targets {
      let ancestors = self.ancestors(id, max_ancestor_distance);
      let mut friends: FxHashSet<NodeId> = FxHashSet::default();
      let mut partner = None;
      for &ancestor in &ancestors {
        let desc = &descendants[&ancestor];
        if desc.len() == 2 {
          partner = desc.iter().copied().find(|&other| other != id);
        }
        friends.extend(desc.iter().copied());
      }
      // The node itself is a descendant of its own ancestors.
      friends.remove(&id);

      let mut kept: Vec<NodeId> = friends.into_iter().collect();
      kept.sort_by_key(|&f| (self.index_distance(f, id), self.node(f).deep_index));
      if kept.len() > max_friends {
        kept.truncate(max_friends);
        if let Some(partner) = partner {
          if !kept.contains(&partner) {
            kept.pop();
            kept.push(partner);
          }
        }
      }
      kept.sort_by_key(|&f| self.node(f).deep_index);
      results.push((id, kept, partner));
    }

    for (id, friends, partner) in results {
      let node = &mut self.arena[id.index()];
      node.friends = Some(friends);
      node.partner = partner;
    }
    self.friend_cycles_computed = true;
  }

  fn neighbor_targets(&self) -> Vec<NodeId> {
    self
      .nodes
      .iter()
      .copied()
      .filter(|&id| self.is_text(id) && self.node(id).bounds.is_some())
      .collect()
  }

  fn bounds_of(&self, id: NodeId) -> &BoundingBox {
    self
      .node(id)
      .bounds
      .as_ref()
      .expect("neighbor candidates have bounding boxes")
  }

  fn make_neighbor(&self, node: NodeId, neighbor: NodeId, distance: f64) -> VisualNeighbor {
    let node_center = self.bounds_of(node).center_point();
    let neighbor_center = self.bounds_of(neighbor).center_point();
    VisualNeighbor {
      distance,
      distance_x: neighbor_center[0] - node_center[0],
      distance_y: neighbor_center[1] - node_center[1],
      neighbor,
    }
  }

  /// Computes the `n_neighbors` nearest text nodes by box-center distance.
  ///
  /// Candidates are text nodes with a resolved bounding box. Results never
  /// include the node itself, are sorted by distance ascending, and may be
  /// shorter than `n_neighbors` when fewer candidates exist.
  pub fn compute_visual_neighbors(&mut self, n_neighbors: usize) {
    let targets = self.neighbor_targets();
    let centers: Vec<[f64; 2]> = targets
      .iter()
      .map(|&id| self.bounds_of(id).center_point())
      .collect();

    let tree: RTree<GeomWithData<[f64; 2], usize>> = RTree::bulk_load(
      centers
        .iter()
        .enumerate()
        .map(|(i, &point)| GeomWithData::new(point, i))
        .collect(),
    );

    let mut results: Vec<(NodeId, Vec<VisualNeighbor>)> = Vec::with_capacity(targets.len());
    for (i, &id) in targets.iter().enumerate() {
      let center = centers[i];
      let mut neighbors = Vec::with_capacity(n_neighbors);
      for point in tree.nearest_neighbor_iter(&center) {
        if point.data == i {
          continue;
        }
        let [x, y] = *point.geom();
        let distance = ((x - center[0]).powi(2) + (y - center[1]).powi(2)).sqrt();
        neighbors.push(self.make_neighbor(id, targets[point.data], distance));
        if neighbors.len() == n_neighbors {
          break;
        }
      }
      results.push((id, neighbors));
    }
    for (id, neighbors) in results {
      self.arena[id.index()].visual_neighbors = Some(neighbors);
    }
  }

  /// Corner-based variant of [`Self::compute_visual_neighbors`].
  ///
  /// Each candidate contributes its four box corners to the search space.
  /// Per candidate, the four per-corner result lists are merged, sorted by
  /// distance, de-duplicated by target node (closest occurrence wins), the
  /// self-entry dropped, and the closest `n_neighbors` kept. The stored
  /// distance is the closest corner-to-corner distance; the signed per-axis
  /// distances remain center-to-center.
  pub fn compute_visual_neighbors_rect(&mut self, n_neighbors: usize) {
    let targets = self.neighbor_targets();
    let per_corner = 4 * (n_neighbors + 1);

    let mut corner_points: Vec<GeomWithData<[f64; 2], usize>> = Vec::with_capacity(targets.len() * 4);
    for (i, &id) in targets.iter().enumerate() {
      for corner in self.bounds_of(id).corners() {
        corner_points.push(GeomWithData::new(corner, i));
      }
    }
    let tree = RTree::bulk_load(corner_points);

    let mut results: Vec<(NodeId, Vec<VisualNeighbor>)> = Vec::with_capacity(targets.len());
    for (i, &id) in targets.iter().enumerate() {
      let mut merged: Vec<(f64, usize)> = Vec::with_capacity(4 * per_corner);
      for corner in self.bounds_of(id).corners() {
        for point in tree.nearest_neighbor_iter(&corner).take(per_corner) {
          let [x, y] = *point.geom();
          let distance = ((x - corner[0]).powi(2) + (y - corner[1]).powi(2)).sqrt();
          merged.push((distance, point.data));
        }
      }
      merged.sort_by(|a, b| a.0.total_cmp(&b.0));

      let mut seen: FxHashSet<usize> = FxHashSet::default();
      let mut neighbors = Vec::with_capacity(n_neighbors);
      for (distance, target_index) in merged {
        if !seen.insert(target_index) {
          continue;
        }
        if target_index == i {
          continue;
        }
        neighbors.push(self.make_neighbor(id, targets[target_index], distance));
        if neighbors.len() == n_neighbors {
          break;
        }
      }
      results.push((id, neighbors));
    }
    for (id, neighbors) in results {
      self.arena[id.index()].visual_neighbors = Some(neighbors);
    }
  }

  /// XPath-style location of `id`, with 1-based positions among same-name
  /// siblings: `/html[1]/body[1]/div[2]/text()[1]`. Positions count original
  /// (pre-filter) siblings, matching what the visual extractor saw.
  pub fn xpath(&self, id: NodeId) -> String {
    let mut segments = Vec::new();
    let mut parse_id = self.node(id).parse;
    loop {
      let node = self.parse.node(parse_id);
      let name = match node.tag_name() {
        Some(tag) => tag.to_string(),
        None => "text()".to_string(),
      };
      let position = match node.parent {
        Some(parent) => {
          self
            .parse
            .children(parent)
            .iter()
            .take_while(|&&sibling| sibling != parse_id)
            .filter(|&&sibling| segment_name(self.parse.node(sibling)) == name)
            .count()
            + 1
        }
        None => 1,
      };
      segments.push(format!("/{}[{}]", name, position));
      match node.parent {
        Some(parent) => parse_id = parent,
        None => break,
      }
    }
    segments.reverse();
    segments.concat()
  }
}

fn segment_name(node: &crate::parsing::ParseNode) -> String {
  match node.tag_name() {
    Some(tag) => tag.to_string(),
    None => "text()".to_string(),
  }
}
