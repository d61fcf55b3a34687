//! s2pipe: Sentinel-2 seasonal acquisition and correction pipeline
//!
//! Builds an area of interest, searches the Copernicus Data Space catalogue
//! over seasonal date windows, downloads the selected band files, corrects
//! the processing-baseline DN offset through GDAL VRTs and materializes the
//! result as tiled GeoTIFFs.

pub mod types;
pub mod config;
pub mod io;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    AreaOfInterest, BoundingBox, Geometry, QueryWindow, ProductRecord, DownloadTask,
    TaskStatus, DownloadSummary, OffsetVrt, OutputRaster, PixelType, S2Error, S2Result,
};

pub use config::PipelineConfig;
pub use io::{AoiBuilder, CatalogueClient, DownloadManager};
pub use core::{RasterTranslator, RetryPolicy};
