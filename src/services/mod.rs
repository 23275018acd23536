pub mod batch;
pub mod clustering;
pub mod prescreen;
pub mod registry;
pub mod search;

pub use batch::BatchOrchestrator;
pub use clustering::{ClusteringEngine, ClusteringService};
pub use prescreen::PrescreenService;
pub use registry::TaskRegistry;
pub use search::SearchService;
