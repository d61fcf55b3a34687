use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::PathBuf;

/// Geographic bounding box (degrees or CRS units)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl BoundingBox {
    pub fn new(min_lon: f64, min_lat: f64, max_lon: f64, max_lat: f64) -> Self {
        Self { min_lon, min_lat, max_lon, max_lat }
    }

    /// Closed exterior ring, counter-clockwise from the lower-left corner
    pub fn to_ring(&self) -> Vec<[f64; 2]> {
        vec![
            [self.min_lon, self.min_lat],
            [self.max_lon, self.min_lat],
            [self.max_lon, self.max_lat],
            [self.min_lon, self.max_lat],
            [self.min_lon, self.min_lat],
        ]
    }
}

/// A linear ring of (x, y) positions; first and last positions are equal
pub type Ring = Vec<[f64; 2]>;

/// Polygonal geometry accepted as an area of interest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Geometry {
    /// Exterior ring followed by interior rings
    Polygon(Vec<Ring>),
    MultiPolygon(Vec<Vec<Ring>>),
}

impl Geometry {
    /// Render as Well-Known Text, the form the OData `Intersects` filter expects
    pub fn to_wkt(&self) -> String {
        fn ring_wkt(ring: &Ring) -> String {
            let coords: Vec<String> = ring
                .iter()
                .map(|p| format!("{} {}", p[0], p[1]))
                .collect();
            format!("({})", coords.join(", "))
        }
        fn polygon_wkt(rings: &[Ring]) -> String {
            let parts: Vec<String> = rings.iter().map(ring_wkt).collect();
            format!("({})", parts.join(", "))
        }

        match self {
            Geometry::Polygon(rings) => format!("POLYGON {}", polygon_wkt(rings)),
            Geometry::MultiPolygon(polys) => {
                let parts: Vec<String> = polys.iter().map(|p| polygon_wkt(p)).collect();
                format!("MULTIPOLYGON ({})", parts.join(", "))
            }
        }
    }

    /// Envelope of every position in the geometry
    pub fn bounds(&self) -> Option<BoundingBox> {
        let positions: Vec<&[f64; 2]> = match self {
            Geometry::Polygon(rings) => rings.iter().flatten().collect(),
            Geometry::MultiPolygon(polys) => polys.iter().flatten().flatten().collect(),
        };
        let first = positions.first()?;
        let mut bbox = BoundingBox::new(first[0], first[1], first[0], first[1]);
        for p in positions {
            bbox.min_lon = bbox.min_lon.min(p[0]);
            bbox.min_lat = bbox.min_lat.min(p[1]);
            bbox.max_lon = bbox.max_lon.max(p[0]);
            bbox.max_lat = bbox.max_lat.max(p[1]);
        }
        Some(bbox)
    }
}

/// Area of interest: polygonal geometry plus the CRS it is expressed in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AreaOfInterest {
    pub geometry: Geometry,
    pub crs: String,
}

impl AreaOfInterest {
    pub fn to_wkt(&self) -> String {
        self.geometry.to_wkt()
    }

    pub fn bounds(&self) -> Option<BoundingBox> {
        self.geometry.bounds()
    }
}

/// One catalogue query over a closed date range
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub collection_name: String,
    pub product_type: String,
    pub bands: BTreeSet<String>,
    pub target_resolution_m: u32,
}

impl QueryWindow {
    pub fn new(
        start: NaiveDate,
        end: NaiveDate,
        collection_name: impl Into<String>,
        product_type: impl Into<String>,
        bands: impl IntoIterator<Item = String>,
        target_resolution_m: u32,
    ) -> S2Result<Self> {
        if start > end {
            return Err(S2Error::InvalidRange(format!(
                "window start {} is after window end {}",
                start, end
            )));
        }
        if target_resolution_m == 0 {
            return Err(S2Error::Configuration(
                "target resolution must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            start,
            end,
            collection_name: collection_name.into(),
            product_type: product_type.into(),
            bands: bands.into_iter().collect(),
            target_resolution_m,
        })
    }

    /// Inclusive start bound in the catalogue's timestamp format
    pub fn start_iso(&self) -> String {
        format!("{}T00:00:00.000Z", self.start.format("%Y-%m-%d"))
    }

    /// Inclusive end bound in the catalogue's timestamp format
    pub fn end_iso(&self) -> String {
        format!("{}T23:59:59.999Z", self.end.format("%Y-%m-%d"))
    }

    /// True when both windows ask for the same product selection
    pub fn same_selection(&self, other: &QueryWindow) -> bool {
        self.collection_name == other.collection_name
            && self.product_type == other.product_type
            && self.bands == other.bands
            && self.target_resolution_m == other.target_resolution_m
    }
}

/// Catalogue entry for one Sentinel-2 product
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub id: String,
    pub name: String,
    pub acquisition_datetime: DateTime<Utc>,
    /// Footprint as WKT, without the SRID prefix
    pub footprint: Option<String>,
    pub available_bands: Vec<String>,
    /// Processing baseline in `MM.mm` form, e.g. `05.09`
    pub processing_baseline: Option<String>,
    pub content_length: Option<u64>,
}

/// Lifecycle of a single band transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskStatus {
    Pending,
    InProgress,
    Complete,
    Failed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::InProgress => write!(f, "in-progress"),
            TaskStatus::Complete => write!(f, "complete"),
            TaskStatus::Failed => write!(f, "failed"),
        }
    }
}

/// One file to fetch for one (product, band) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DownloadTask {
    pub product_id: String,
    pub band: String,
    pub source_url: String,
    pub destination_path: PathBuf,
    pub expected_size: Option<u64>,
    /// Lower-case hex MD5 of the complete file
    pub expected_md5: Option<String>,
    pub status: TaskStatus,
}

impl DownloadTask {
    pub fn new(
        product_id: impl Into<String>,
        band: impl Into<String>,
        source_url: impl Into<String>,
        destination_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            product_id: product_id.into(),
            band: band.into(),
            source_url: source_url.into(),
            destination_path: destination_path.into(),
            expected_size: None,
            expected_md5: None,
            status: TaskStatus::Pending,
        }
    }

    pub fn with_expected_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn with_expected_md5(mut self, md5: impl Into<String>) -> Self {
        self.expected_md5 = Some(md5.into().to_lowercase());
        self
    }

    pub fn key(&self) -> (String, String) {
        (self.product_id.clone(), self.band.clone())
    }

    /// Move to `next`, rejecting anything but forward moves and failed -> pending
    pub fn transition(&mut self, next: TaskStatus) -> S2Result<()> {
        use TaskStatus::*;
        let allowed = matches!(
            (self.status, next),
            (Pending, InProgress)
                | (InProgress, Complete)
                | (InProgress, Failed)
                | (Failed, Pending)
                | (Pending, Complete)
        );
        if !allowed {
            return Err(S2Error::Configuration(format!(
                "illegal task transition {} -> {} for {}/{}",
                self.status, next, self.product_id, self.band
            )));
        }
        self.status = next;
        Ok(())
    }
}

/// A task that exhausted its retries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskFailure {
    pub product_id: String,
    pub band: String,
    pub destination: PathBuf,
    pub cause: String,
}

impl std::fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} -> {}: {}",
            self.product_id,
            self.band,
            self.destination.display(),
            self.cause
        )
    }
}

/// Outcome counts for one download batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DownloadSummary {
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
    pub cancelled: usize,
    pub failures: Vec<TaskFailure>,
}

impl DownloadSummary {
    pub fn total(&self) -> usize {
        self.succeeded + self.failed + self.skipped + self.cancelled
    }

    pub fn merge(&mut self, other: DownloadSummary) {
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.cancelled += other.cancelled;
        self.failures.extend(other.failures);
    }
}

/// Pixel data types the VRT and translator understand
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PixelType {
    Byte,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl PixelType {
    /// Parse a GDAL data type name such as `UInt16`
    pub fn from_gdal_name(name: &str) -> Option<Self> {
        match name {
            "Byte" => Some(PixelType::Byte),
            "UInt16" => Some(PixelType::UInt16),
            "Int16" => Some(PixelType::Int16),
            "UInt32" => Some(PixelType::UInt32),
            "Int32" => Some(PixelType::Int32),
            "Float32" => Some(PixelType::Float32),
            "Float64" => Some(PixelType::Float64),
            _ => None,
        }
    }

    pub fn gdal_name(&self) -> &'static str {
        match self {
            PixelType::Byte => "Byte",
            PixelType::UInt16 => "UInt16",
            PixelType::Int16 => "Int16",
            PixelType::UInt32 => "UInt32",
            PixelType::Int32 => "Int32",
            PixelType::Float32 => "Float32",
            PixelType::Float64 => "Float64",
        }
    }

    /// Representable value range
    pub fn range(&self) -> (f64, f64) {
        match self {
            PixelType::Byte => (0.0, u8::MAX as f64),
            PixelType::UInt16 => (0.0, u16::MAX as f64),
            PixelType::Int16 => (i16::MIN as f64, i16::MAX as f64),
            PixelType::UInt32 => (0.0, u32::MAX as f64),
            PixelType::Int32 => (i32::MIN as f64, i32::MAX as f64),
            PixelType::Float32 => (f32::MIN as f64, f32::MAX as f64),
            PixelType::Float64 => (f64::MIN, f64::MAX),
        }
    }

    pub fn is_integer(&self) -> bool {
        !matches!(self, PixelType::Float32 | PixelType::Float64)
    }

    /// Clamp (and round, for integer types) a value into this type's range
    pub fn clamp(&self, value: f64) -> f64 {
        let (lo, hi) = self.range();
        let v = if self.is_integer() { value.round() } else { value };
        v.clamp(lo, hi)
    }
}

impl std::fmt::Display for PixelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.gdal_name())
    }
}

/// Virtual raster applying an additive DN offset to one band
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OffsetVrt {
    pub path: PathBuf,
    pub band: String,
    pub offset: f64,
    pub sources: Vec<PathBuf>,
    pub width: usize,
    pub height: usize,
    pub pixel_type: PixelType,
}

/// A raster materialized on disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRaster {
    pub path: PathBuf,
    pub width: usize,
    pub height: usize,
    pub bands: usize,
    pub pixel_type: PixelType,
}

/// Error types for the acquisition and correction pipeline
#[derive(Debug, thiserror::Error)]
pub enum S2Error {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Catalogue query failed{}: {message}", .status.map(|s| format!(" (HTTP {})", s)).unwrap_or_default())]
    CatalogueQuery { status: Option<u16>, message: String },

    #[error("HTTP error{} for {url}: {message}", .status.map(|s| format!(" {}", s)).unwrap_or_default())]
    Http {
        status: Option<u16>,
        url: String,
        message: String,
    },

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Invalid geometry: {0}")]
    InvalidGeometry(String),

    #[error("Unknown CRS: {0}")]
    UnknownCrs(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Download of {product_id}/{band} failed: {cause}")]
    DownloadTask {
        product_id: String,
        band: String,
        cause: String,
    },

    #[error("Band {band} not exposed by {}", .path.display())]
    BandMismatch { band: String, path: PathBuf },

    #[error("Unknown processing baseline {baseline} for {product_type}")]
    UnknownBaseline {
        product_type: String,
        baseline: String,
    },

    #[error("Failed to write {}: {message}", .path.display())]
    IoWrite { path: PathBuf, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("GDAL error: {0}")]
    Gdal(#[from] gdal::errors::GdalError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("XML error: {0}")]
    Xml(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl S2Error {
    /// Connection failures, timeouts, throttling and server errors may succeed on retry
    pub fn is_transient(&self) -> bool {
        match self {
            S2Error::Http { status: None, .. } => true,
            S2Error::Http { status: Some(code), .. } => *code == 429 || (500..600).contains(code),
            S2Error::Io(_) => true,
            _ => false,
        }
    }

    /// 4xx other than 429: the request itself is wrong and repeating it cannot succeed
    pub fn is_client_error(&self) -> bool {
        matches!(self.http_status(), Some(code) if (400..500).contains(&code) && code != 429)
    }

    pub fn http_status(&self) -> Option<u16> {
        match self {
            S2Error::Http { status, .. } | S2Error::CatalogueQuery { status, .. } => *status,
            _ => None,
        }
    }
}

/// Result type for pipeline operations
pub type S2Result<T> = Result<T, S2Error>;
