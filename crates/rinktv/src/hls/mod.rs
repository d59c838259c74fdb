pub mod plan;
pub mod variant;

pub use plan::{build_plan, DownloadItem, DownloadManifest, SegmentPlan, SegmentPlanEntry};
pub use variant::{ManifestResolver, QualityVariant, ResolvedPlaylist};
