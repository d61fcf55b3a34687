//! Input/output: AOI files, CDSE catalogue and download access

pub mod aoi;
pub mod auth;
pub mod session;
pub mod catalogue;
pub mod nodes;
pub mod download;

pub use aoi::{overlay_latlon_grid, write_grid, AoiBuilder, GridCell, GridOptions};
pub use auth::{Authenticator, Credentials};
pub use session::{CdseSession, HttpTransport};
pub use catalogue::{CatalogueClient, CatalogueSearch, SearchCursor};
pub use nodes::{SceneNavigator, SceneTargets};
pub use download::{CancelFlag, DownloadManager};
