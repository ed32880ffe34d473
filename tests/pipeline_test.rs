//! End-to-end pipeline scenarios: page in, cached graph sample out.

use domglean::dataset::{DatasetCollection, DeleteMode, ExtractionParams};
use domglean::error::Error;
use domglean::features::{FeatureKind, FeatureSet, RootContext};
use domglean::page::{Page, StaticPage};
use std::sync::Arc;

fn as_pages(pages: Vec<StaticPage>) -> Vec<Arc<dyn Page>> {
  pages
    .into_iter()
    .map(|p| Arc::new(p) as Arc<dyn Page>)
    .collect()
}

fn structural_collection() -> DatasetCollection {
  DatasetCollection::new(ExtractionParams::default(), FeatureSet::structural())
}

#[test]
fn price_page_end_to_end() {
  let html = "<html><body><div><p>Hello</p><p>$5 World</p></div></body></html>";
  // Path to the second <p>: body -> div -> second child.
  let page = StaticPage::new("shop/p1", html).with_label("price", vec![vec![0, 0, 1]]);

  let mut collection = structural_collection();
  collection.add_split("train", as_pages(vec![page])).unwrap();
  collection.prepare_features("train", false).unwrap();
  collection.compute_features("train", Some(1), false).unwrap();

  let dataset = collection.split("train").unwrap();
  let page = &dataset.pages()[0];
  let sample = dataset.cached_sample(&**page).unwrap().unwrap();

  // Deterministic node count: html, body, div, p, "Hello", p, "$5 World".
  assert_eq!(sample.features.rows, 7);
  assert_eq!(sample.labels.len(), 7);

  // Exactly one node carries the price label.
  let price_id = collection.label_map().unwrap().id_of("price").unwrap();
  let labeled: Vec<usize> = sample
    .labels
    .iter()
    .enumerate()
    .filter(|(_, &l)| l == price_id)
    .map(|(i, _)| i)
    .collect();
  assert_eq!(labeled.len(), 1);
  // In dataset-index order the second <p> is node 5.
  assert_eq!(labeled, vec![5]);

  // Child edges from the div to each p, and from each p to its text child.
  let edges: Vec<(u32, u32)> = sample
    .edges
    .sources
    .iter()
    .zip(&sample.edges.targets)
    .map(|(&s, &t)| (s, t))
    .collect();
  for expected in [(2, 3), (2, 5), (3, 4), (5, 6)] {
    assert!(edges.contains(&expected), "missing child edge {expected:?}");
  }
  // Reciprocal parent edges exist too.
  for expected in [(3, 2), (5, 2), (4, 3), (6, 5)] {
    assert!(edges.contains(&expected), "missing parent edge {expected:?}");
  }
  // Child edges come first, parent edges after.
  let child_count = edges.iter().filter(|&&(s, t)| s < t).count();
  assert!(edges[..child_count].iter().all(|&(s, t)| s < t));
}

#[test]
fn whitespace_only_text_is_absent_from_sample() {
  let page = StaticPage::new("p1", "<html><body><p>   </p><p>kept</p></body></html>");
  let mut collection = structural_collection();
  collection.add_split("train", as_pages(vec![page])).unwrap();
  collection.prepare_features("train", false).unwrap();
  collection.compute_features("train", Some(1), false).unwrap();

  let dataset = collection.split("train").unwrap();
  let sample = dataset
    .cached_sample(&*dataset.pages()[0])
    .unwrap()
    .unwrap();
  // html, body, p, p, "kept"; the whitespace fragment is gone entirely.
  assert_eq!(sample.features.rows, 5);
}

#[test]
fn identical_html_different_labels_share_features() {
  let html = "<html><body><div><p>Alpha</p><p>Beta</p></div></body></html>";
  let first = StaticPage::new("p1", html)
    .with_label("name", vec![vec![0, 0, 0]])
    .with_label("price", vec![]);
  let second = StaticPage::new("p2", html)
    .with_label("name", vec![])
    .with_label("price", vec![vec![0, 0, 1]]);

  let mut collection = structural_collection();
  collection
    .add_split("train", as_pages(vec![first, second]))
    .unwrap();
  collection.prepare_features("train", false).unwrap();
  collection.compute_features("train", Some(2), false).unwrap();

  let dataset = collection.split("train").unwrap();
  let sample_a = dataset
    .cached_sample(&*dataset.pages()[0])
    .unwrap()
    .unwrap();
  let sample_b = dataset
    .cached_sample(&*dataset.pages()[1])
    .unwrap()
    .unwrap();

  assert_eq!(sample_a.features, sample_b.features);
  assert_eq!(sample_a.edges, sample_b.edges);
  assert_ne!(sample_a.labels, sample_b.labels);
}

#[test]
fn label_map_is_not_extended_by_later_splits() {
  let mut collection = structural_collection();
  collection
    .add_split(
      "train",
      as_pages(vec![StaticPage::new("t1", "<html><body></body></html>")
        .with_label("name", vec![])
        .with_label("price", vec![])]),
    )
    .unwrap();
  let err = collection
    .add_split(
      "test",
      as_pages(vec![StaticPage::new("x1", "<html><body></body></html>")
        .with_label("shortDescription", vec![])]),
    )
    .unwrap_err();
  assert!(matches!(err, Error::Label(_)));
}

#[test]
fn disk_cache_skips_and_invalidates() {
  let dir = tempfile::tempdir().unwrap();
  let page = StaticPage::new("p1", "<html><body><p>cached</p></body></html>")
    .with_slot(dir.path().join("p1.sample"));

  let mut collection = structural_collection();
  collection.add_split("train", as_pages(vec![page])).unwrap();
  collection.prepare_features("train", false).unwrap();

  assert_eq!(collection.compute_features("train", Some(1), false).unwrap(), 1);
  assert!(dir.path().join("p1.sample").exists());
  // Skip-existing semantics: nothing left to compute.
  assert_eq!(collection.compute_features("train", Some(1), false).unwrap(), 0);

  let dataset = collection.split("train").unwrap();
  assert_eq!(dataset.delete_saved(DeleteMode::Backup).unwrap(), 1);
  assert!(!dir.path().join("p1.sample").exists());
  assert!(dir.path().join("p1.sample.bak").exists());
  assert_eq!(dataset.delete_saved(DeleteMode::Backup).unwrap(), 0);

  // The slot is free again, so the page recomputes.
  assert_eq!(collection.compute_features("train", Some(1), false).unwrap(), 1);
}

#[test]
fn root_context_persists_between_collections() {
  let dir = tempfile::tempdir().unwrap();
  let context_path = dir.path().join("root.ctx");
  let html = "<html><body><p>alpha beta</p></body></html>";

  let params = ExtractionParams {
    cutoff_words: Some(8),
    ..ExtractionParams::default()
  };
  let features = FeatureSet::new(vec![FeatureKind::WordIdentifiers]);

  let mut first = DatasetCollection::new(params.clone(), features.clone());
  first
    .add_split("train", as_pages(vec![StaticPage::new("p1", html)]))
    .unwrap();
  first.prepare_features("train", false).unwrap();
  first.root_context().save(&context_path).unwrap();

  // A second run restores the context and skips the already-prepared page.
  let restored = RootContext::load_or_new(&context_path, Some(8), None).unwrap();
  let mut second = DatasetCollection::new(params, features);
  second.set_root_context(restored).unwrap();
  second
    .add_split("train", as_pages(vec![StaticPage::new("p1", html)]))
    .unwrap();
  assert_eq!(second.prepare_features("train", false).unwrap(), 0);

  // Restoring under different cutoffs is a configuration error.
  let err = RootContext::load_or_new(&context_path, Some(4), None).unwrap_err();
  assert!(matches!(err, Error::Context(_)));
}

#[test]
fn enrichment_flags_flow_through_graph_construction() {
  let params = ExtractionParams {
    friend_cycles: true,
    ..ExtractionParams::default()
  };
  let collection = DatasetCollection::new(params, FeatureSet::structural());
  let page = StaticPage::new(
    "p1",
    "<html><body><div><b>key</b><i>value</i></div></body></html>",
  );
  let dom = collection.build_page_graph(&page).unwrap();
  assert!(dom.friend_cycles_computed());
  let texts: Vec<_> = dom
    .nodes()
    .iter()
    .copied()
    .filter(|&id| dom.is_text(id))
    .collect();
  assert_eq!(dom.node(texts[0]).partner, Some(texts[1]));
}

#[test]
fn visual_pipeline_end_to_end() {
  let html = "<html><body><p>first</p><p>second</p></body></html>";
  let visuals = r#"{"/html[1]": {"box": [0, 0, 800, 600],
      "/body[1]": {"box": [0, 0, 800, 600],
        "/p[1]": {"box": [0, 0, 100, 20], "fontSize": 14, "fontWeight": 400,
          "/text()[1]": {"box": [0, 0, 90, 20]}},
        "/p[2]": {"box": [0, 30, 100, 20], "fontSize": 14, "fontWeight": 700,
          "/text()[1]": {"box": [0, 30, 90, 20]}}}}}"#;
  let page = StaticPage::new("p1", html)
    .with_label("name", vec![vec![0, 0]])
    .with_visuals(visuals);

  let params = ExtractionParams {
    load_visuals: true,
    visual_neighbors: true,
    n_neighbors: 2,
    propagate_labels_to_leaves: true,
    ..ExtractionParams::default()
  };
  let features = FeatureSet::new(vec![FeatureKind::IsLeaf, FeatureKind::Visuals]);
  let mut collection = DatasetCollection::new(params, features);
  collection.add_split("train", as_pages(vec![page])).unwrap();
  collection.prepare_features("train", false).unwrap();
  collection.compute_features("train", Some(1), false).unwrap();

  let dataset = collection.split("train").unwrap();
  let sample = dataset
    .cached_sample(&*dataset.pages()[0])
    .unwrap()
    .unwrap();
  assert_eq!(sample.features.cols, 3);
  // Nodes in dataset order: html, body, p, text, p, text.
  assert_eq!(sample.features.rows, 6);
  // Text of the bold second paragraph inherits its container's weight.
  let second_text_row = sample.features.row(5);
  assert_eq!(second_text_row, &[1.0, 14.0, 7.0]);
}

#[test]
fn classification_mask_marks_text_nodes() {
  let params = ExtractionParams {
    classify_only_text_nodes: true,
    ..ExtractionParams::default()
  };
  let mut collection = DatasetCollection::new(params, FeatureSet::structural());
  let page = StaticPage::new("p1", "<html><body><p>leaf</p></body></html>");
  collection.add_split("train", as_pages(vec![page])).unwrap();
  collection.prepare_features("train", false).unwrap();
  collection.compute_features("train", Some(1), false).unwrap();

  let dataset = collection.split("train").unwrap();
  let sample = dataset
    .cached_sample(&*dataset.pages()[0])
    .unwrap()
    .unwrap();
  // html, body, p, text: only the text node is a classification target.
  assert_eq!(sample.target_mask, Some(vec![false, false, false, true]));
}
