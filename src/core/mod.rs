//! Core pipeline modules

pub mod retry;
pub mod season;
pub mod dn_offset;
pub mod translate;
pub mod workflow;

// Re-export main types
pub use retry::RetryPolicy;
pub use season::{SeasonWindow, expand, merge_windows, query_windows};
pub use dn_offset::{BaselineOffsetTable, build_offset_vrt, baseline_from_path};
pub use translate::{RasterTranslator, TranslateInput, TranslateOptions, Compression};
pub use workflow::{SeasonalDownloader, SeasonalRequest, SeasonalReport, SceneReport};
