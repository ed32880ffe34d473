pub mod dataset;
pub mod dom;
pub mod error;
pub mod features;
pub mod page;
pub mod parsing;
pub mod visual;

pub use dataset::{Dataset, DatasetCollection, ExtractionParams, LabelMap, Sample};
pub use dom::{DomTree, Node, NodeId};
pub use error::{Error, Result};
pub use features::{FeatureKind, FeatureSet, LiveContext, PageContext, RootContext};
pub use page::{IndexPath, Page};
pub use parsing::ParseTree;
pub use visual::{BoundingBox, DomData};
