//! Prepare and compute graph samples for a directory dataset.
//!
//! Expects one `<stem>.html` per page, a `<stem>.labels.json` sidecar
//! mapping field names to index paths, and an optional `<stem>.visuals.json`
//! from the visual extractor. Samples land in the output directory as
//! `<stem>.sample`; the root context persists at `<out>/root.ctx`.

use clap::Parser;
use domglean::dataset::{DatasetCollection, DeleteMode, ExtractionParams, NeighborDistance};
use domglean::error::Result;
use domglean::features::{FeatureKind, FeatureSet, RootContext};
use domglean::page::{IndexPath, Page};
use rustc_hash::FxHashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Prepare and compute graph samples for a directory dataset
#[derive(Parser, Debug)]
#[command(name = "prepare_samples", version, about)]
struct Args {
  /// Directory of page HTML and label sidecars
  input: PathBuf,

  /// Directory for computed samples and the root context
  #[arg(long, short, default_value = "samples")]
  out: PathBuf,

  /// Number of parallel compute workers
  #[arg(long, short, default_value_t = num_cpus::get())]
  jobs: usize,

  /// Recompute pages even if cached
  #[arg(long)]
  force: bool,

  /// Delete cached samples instead of computing (renames to .bak)
  #[arg(long)]
  delete_saved: bool,

  /// Compute friend cycles
  #[arg(long)]
  friend_cycles: bool,

  /// Compute visual neighbors (requires visuals sidecars)
  #[arg(long)]
  visual_neighbors: bool,

  /// Use box-center distance instead of corner distance for neighbors
  #[arg(long)]
  center_distance: bool,

  /// Maximum number of words preserved per node
  #[arg(long)]
  cutoff_words: Option<u32>,

  /// Maximum number of characters preserved per token
  #[arg(long)]
  cutoff_word_length: Option<u32>,

  /// Propagate labels to leaf descendants
  #[arg(long)]
  propagate_labels: bool,
}

/// One page backed by files in the input directory.
struct DirectoryPage {
  stem: String,
  html_path: PathBuf,
  visuals_path: Option<PathBuf>,
  labels: Vec<(String, Vec<IndexPath>)>,
  slot: PathBuf,
}

impl Page for DirectoryPage {
  fn html_text(&self) -> Result<String> {
    Ok(fs::read_to_string(&self.html_path)?)
  }

  fn fields(&self) -> Vec<String> {
    self.labels.iter().map(|(key, _)| key.clone()).collect()
  }

  fn labeled_paths(&self, key: &str) -> Vec<IndexPath> {
    self
      .labels
      .iter()
      .find(|(k, _)| k == key)
      .map(|(_, paths)| paths.clone())
      .unwrap_or_default()
  }

  fn identifier(&self) -> String {
    self.stem.clone()
  }

  fn data_point_slot(&self) -> Option<PathBuf> {
    Some(self.slot.clone())
  }

  fn visuals_json(&self) -> Result<Option<String>> {
    match &self.visuals_path {
      Some(path) => Ok(Some(fs::read_to_string(path)?)),
      None => Ok(None),
    }
  }
}

fn load_pages(input: &Path, out: &Path) -> std::io::Result<Vec<Arc<dyn Page>>> {
  let mut pages: Vec<Arc<dyn Page>> = Vec::new();
  let mut stems: Vec<String> = fs::read_dir(input)?
    .filter_map(|entry| {
      let path = entry.ok()?.path();
      if path.extension()? != "html" {
        return None;
      }
      Some(path.file_stem()?.to_string_lossy().into_owned())
    })
    .collect();
  stems.sort();

  for stem in stems {
    let labels_path = input.join(format!("{stem}.labels.json"));
    let labels: Vec<(String, Vec<IndexPath>)> = if labels_path.exists() {
      let raw: FxHashMap<String, Vec<IndexPath>> =
        serde_json::from_str(&fs::read_to_string(&labels_path)?).map_err(|e| {
          std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{}: {e}", labels_path.display()),
          )
        })?;
      let mut sorted: Vec<_> = raw.into_iter().collect();
      sorted.sort_by(|a, b| a.0.cmp(&b.0));
      sorted
    } else {
      Vec::new()
    };

    let visuals_path = input.join(format!("{stem}.visuals.json"));
    pages.push(Arc::new(DirectoryPage {
      html_path: input.join(format!("{stem}.html")),
      visuals_path: visuals_path.exists().then_some(visuals_path),
      labels,
      slot: out.join(format!("{stem}.sample")),
      stem,
    }));
  }
  Ok(pages)
}

fn main() {
  let args = Args::parse();

  let pages = match load_pages(&args.input, &args.out) {
    Ok(pages) => pages,
    Err(err) => {
      eprintln!("Failed to read {}: {err}", args.input.display());
      std::process::exit(1);
    }
  };
  if pages.is_empty() {
    eprintln!("No pages found in {}", args.input.display());
    std::process::exit(1);
  }

  if let Err(err) = fs::create_dir_all(&args.out) {
    eprintln!("Failed to create {}: {err}", args.out.display());
    std::process::exit(1);
  }

  let params = ExtractionParams {
    cutoff_words: args.cutoff_words,
    cutoff_word_length: args.cutoff_word_length,
    friend_cycles: args.friend_cycles,
    visual_neighbors: args.visual_neighbors,
    neighbor_distance: if args.center_distance {
      NeighborDistance::CenterPoint
    } else {
      NeighborDistance::Rect
    },
    propagate_labels_to_leaves: args.propagate_labels,
    load_visuals: args.visual_neighbors,
    classify_only_text_nodes: true,
    ..ExtractionParams::default()
  };

  let mut features = vec![
    FeatureKind::Depth,
    FeatureKind::IsLeaf,
    FeatureKind::CharCategories,
    FeatureKind::CharIdentifiers,
    FeatureKind::WordIdentifiers,
  ];
  if args.visual_neighbors {
    features.push(FeatureKind::Visuals);
  }

  let mut collection = DatasetCollection::new(params, FeatureSet::new(features));

  let context_path = args.out.join("root.ctx");
  match RootContext::load_or_new(&context_path, args.cutoff_words, args.cutoff_word_length) {
    Ok(root) => {
      if !root.pages.is_empty() {
        eprintln!("Restored root context: {}", root.describe());
      }
      if let Err(err) = collection.set_root_context(root) {
        eprintln!("{err}");
        std::process::exit(1);
      }
    }
    Err(err) => {
      eprintln!("Failed to load {}: {err}", context_path.display());
      std::process::exit(1);
    }
  }

  let page_count = pages.len();
  if let Err(err) = collection.add_split("all", pages) {
    eprintln!("{err}");
    std::process::exit(1);
  }

  if args.delete_saved {
    let dataset = collection.split("all").expect("split was just added");
    match dataset.delete_saved(DeleteMode::Backup) {
      Ok(count) => {
        eprintln!("Backed up {count} cached sample(s)");
        return;
      }
      Err(err) => {
        eprintln!("{err}");
        std::process::exit(1);
      }
    }
  }

  eprintln!("Preparing features over {page_count} page(s)...");
  match collection.prepare_features("all", args.force) {
    Ok(prepared) => eprintln!(
      "Prepared {prepared} page(s); root context: {}",
      collection.root_context().describe()
    ),
    Err(err) => {
      eprintln!("{err}");
      std::process::exit(1);
    }
  }

  if let Err(err) = collection.root_context().save(&context_path) {
    eprintln!("Failed to save {}: {err}", context_path.display());
    std::process::exit(1);
  }

  eprintln!("Computing samples ({} parallel)...", args.jobs);
  match collection.compute_features("all", Some(args.jobs), args.force) {
    Ok(computed) => eprintln!(
      "Computed {computed} sample(s) into {} ({} skipped as cached)",
      args.out.display(),
      page_count - computed
    ),
    Err(err) => {
      eprintln!("{err}");
      std::process::exit(1);
    }
  }
}
