use crate::types::{OffsetVrt, PixelType, S2Error, S2Result};
use gdal::{Dataset, Metadata};
use quick_xml::events::{BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

/// Pixel-size agreement required between mosaicked sources
const PIXEL_SIZE_TOLERANCE: f64 = 1e-9;

/// Offset applied to products of processing baseline 04.00 and later
pub const NEW_BASELINE_OFFSET: f64 = -1000.0;

/// Known `(product_type, baseline) -> offset` pairs
#[derive(Debug, Clone, PartialEq)]
pub struct BaselineOffsetTable {
    entries: HashMap<(String, String), f64>,
}

#[derive(Debug, Deserialize)]
struct TableFile {
    #[serde(default)]
    offsets: Vec<TableEntry>,
}

#[derive(Debug, Deserialize)]
struct TableEntry {
    product_type: String,
    baseline: String,
    offset: f64,
}

impl Default for BaselineOffsetTable {
    fn default() -> Self {
        let old = [
            "02.00", "02.01", "02.02", "02.03", "02.04", "02.05", "02.06", "02.07", "02.08",
            "02.09", "02.10", "02.11", "02.12", "02.13", "02.14", "03.00", "03.01",
        ];
        let new = ["04.00", "05.00", "05.09", "05.10", "05.11"];

        let mut entries = HashMap::new();
        for product_type in ["S2MSI1C", "S2MSI2A"] {
            for baseline in old {
                entries.insert((product_type.to_string(), baseline.to_string()), 0.0);
            }
            for baseline in new {
                entries.insert((product_type.to_string(), baseline.to_string()), NEW_BASELINE_OFFSET);
            }
        }
        Self { entries }
    }
}

impl BaselineOffsetTable {
    pub fn empty() -> Self {
        Self { entries: HashMap::new() }
    }

    pub fn insert(&mut self, product_type: &str, baseline: &str, offset: f64) {
        self.entries
            .insert((product_type.to_string(), baseline.to_string()), offset);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Parse a table from TOML:
    ///
    /// ```toml
    /// [[offsets]]
    /// product_type = "S2MSI2A"
    /// baseline = "05.12"
    /// offset = -1000
    /// ```
    pub fn from_toml_str(text: &str) -> S2Result<Self> {
        let file: TableFile = toml::from_str(text)
            .map_err(|e| S2Error::Configuration(format!("Invalid baseline table: {}", e)))?;
        let mut table = Self::empty();
        for entry in file.offsets {
            table.insert(&entry.product_type, &entry.baseline, entry.offset);
        }
        Ok(table)
    }

    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> S2Result<Self> {
        let path = path.as_ref();
        log::debug!("Loading baseline offset table from {}", path.display());
        Self::from_toml_str(&fs::read_to_string(path)?)
    }

    /// Offset for a product type and baseline, failing for anything not in the table
    pub fn offset_for(&self, product_type: &str, baseline: &str) -> S2Result<f64> {
        self.entries
            .get(&(product_type.to_string(), baseline.to_string()))
            .copied()
            .ok_or_else(|| S2Error::UnknownBaseline {
                product_type: product_type.to_string(),
                baseline: baseline.to_string(),
            })
    }
}

fn baseline_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_N(\d{2})(\d{2})_").expect("static regex"))
}

fn product_type_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^S2[ABCD]_(MSIL1C|MSIL2A)_").expect("static regex"))
}

/// Find the enclosing `*.SAFE` directory name of a band file
fn safe_name(path: &Path) -> Option<String> {
    path.ancestors()
        .filter_map(|p| p.file_name().and_then(|n| n.to_str()))
        .find(|n| n.ends_with(".SAFE"))
        .map(str::to_string)
}

/// Processing baseline ("05.09") of the SAFE product containing `path`
pub fn baseline_from_path(path: &Path) -> Option<String> {
    let name = safe_name(path)?;
    let caps = baseline_regex().captures(&name)?;
    Some(format!("{}.{}", &caps[1], &caps[2]))
}

/// Product type (`S2MSI1C`/`S2MSI2A`) of the SAFE product containing `path`
pub fn product_type_from_path(path: &Path) -> Option<String> {
    let name = safe_name(path)?;
    let caps = product_type_regex().captures(&name)?;
    Some(match &caps[1] {
        "MSIL1C" => "S2MSI1C".to_string(),
        _ => "S2MSI2A".to_string(),
    })
}

/// Where offset VRTs go when the caller does not say
pub fn default_vrt_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("s2pipe")
        .join("vrt")
}

/// True when the file name carries `_{band}_` or `_{band}.`
pub fn name_matches_band(path: &Path, band: &str) -> bool {
    let name = match path.file_name().and_then(|n| n.to_str()) {
        Some(name) => name,
        None => return false,
    };
    name.contains(&format!("_{}_", band)) || name.contains(&format!("_{}.", band))
}

/// Metadata of one source raster, read without touching pixel data
#[derive(Debug, Clone)]
struct SourceInfo {
    path: PathBuf,
    band_index: isize,
    width: usize,
    height: usize,
    geo_transform: [f64; 6],
    projection: String,
    pixel_type: PixelType,
    block_size: (usize, usize),
    no_data: Option<f64>,
}

fn inspect_source(path: &Path, band: &str) -> S2Result<SourceInfo> {
    let path = fs::canonicalize(path).map_err(|e| {
        S2Error::Configuration(format!("Cannot resolve source {}: {}", path.display(), e))
    })?;
    let dataset = Dataset::open(&path)?;
    let count = dataset.raster_count();

    let mut band_index = None;
    for i in 1..=count {
        let description = dataset.rasterband(i)?.description().unwrap_or_default();
        if description == band {
            band_index = Some(i);
            break;
        }
    }
    if band_index.is_none() && name_matches_band(&path, band) {
        band_index = Some(1);
    }
    let band_index = band_index.ok_or_else(|| S2Error::BandMismatch {
        band: band.to_string(),
        path: path.clone(),
    })?;

    let raster_band = dataset.rasterband(band_index)?;
    let type_name = raster_band.band_type().name();
    let pixel_type = PixelType::from_gdal_name(&type_name).ok_or_else(|| {
        S2Error::Configuration(format!(
            "Unsupported data type {} in {}",
            type_name,
            path.display()
        ))
    })?;
    let (width, height) = dataset.raster_size();
    let geo_transform = dataset.geo_transform()?;

    Ok(SourceInfo {
        band_index,
        width,
        height,
        geo_transform,
        projection: dataset.projection(),
        pixel_type,
        block_size: raster_band.block_size(),
        no_data: raster_band.no_data_value(),
        path,
    })
}

/// Union grid of the sources: origin, pixel size and dimensions
#[derive(Debug, Clone, Copy, PartialEq)]
struct MosaicGrid {
    min_x: f64,
    max_y: f64,
    pixel_x: f64,
    pixel_y: f64,
    width: usize,
    height: usize,
}

impl MosaicGrid {
    fn geo_transform(&self) -> [f64; 6] {
        [self.min_x, self.pixel_x, 0.0, self.max_y, 0.0, self.pixel_y]
    }

    /// Destination window `(x_off, y_off)` of a source on this grid
    fn offset_of(&self, gt: &[f64; 6]) -> (usize, usize) {
        let x = ((gt[0] - self.min_x) / self.pixel_x).round();
        let y = ((self.max_y - gt[3]) / self.pixel_y.abs()).round();
        (x.max(0.0) as usize, y.max(0.0) as usize)
    }
}

fn mosaic_grid(band: &str, sources: &[SourceInfo]) -> S2Result<MosaicGrid> {
    let first = &sources[0];
    let gt0 = first.geo_transform;
    for s in sources {
        let gt = s.geo_transform;
        if gt[2] != 0.0 || gt[4] != 0.0 {
            return Err(S2Error::Configuration(format!(
                "{} is rotated; only north-up rasters can be mosaicked",
                s.path.display()
            )));
        }
        if s.projection != first.projection {
            return Err(S2Error::Configuration(format!(
                "{}: CRS differs from {}",
                s.path.display(),
                first.path.display()
            )));
        }
        if (gt[1] - gt0[1]).abs() > PIXEL_SIZE_TOLERANCE || (gt[5] - gt0[5]).abs() > PIXEL_SIZE_TOLERANCE {
            return Err(S2Error::Configuration(format!(
                "{}: pixel size ({}, {}) differs from ({}, {})",
                s.path.display(),
                gt[1],
                gt[5],
                gt0[1],
                gt0[5]
            )));
        }
        if s.pixel_type != first.pixel_type {
            return Err(S2Error::Configuration(format!(
                "{}: band {} is {}, expected {}",
                s.path.display(),
                band,
                s.pixel_type,
                first.pixel_type
            )));
        }
    }

    let pixel_x = gt0[1];
    let pixel_y = gt0[5];
    let mut min_x = f64::INFINITY;
    let mut max_x = f64::NEG_INFINITY;
    let mut min_y = f64::INFINITY;
    let mut max_y = f64::NEG_INFINITY;
    for s in sources {
        let gt = s.geo_transform;
        let x1 = gt[0] + s.width as f64 * gt[1];
        let y1 = gt[3] + s.height as f64 * gt[5];
        min_x = min_x.min(gt[0].min(x1));
        max_x = max_x.max(gt[0].max(x1));
        min_y = min_y.min(gt[3].min(y1));
        max_y = max_y.max(gt[3].max(y1));
    }

    Ok(MosaicGrid {
        min_x,
        max_y,
        pixel_x,
        pixel_y,
        width: ((max_x - min_x) / pixel_x.abs()).round() as usize,
        height: ((max_y - min_y) / pixel_y.abs()).round() as usize,
    })
}

fn format_number(value: f64) -> String {
    if value.fract() == 0.0 && value.abs() < 1e15 {
        format!("{}", value as i64)
    } else {
        format!("{}", value)
    }
}

type XmlWriter = Writer<Cursor<Vec<u8>>>;

fn xml_err(e: quick_xml::Error) -> S2Error {
    S2Error::Xml(e.to_string())
}

fn start(w: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> S2Result<()> {
    let elem = BytesStart::new(name).with_attributes(attrs.iter().copied());
    w.write_event(Event::Start(elem)).map_err(xml_err)
}

fn end(w: &mut XmlWriter, name: &str) -> S2Result<()> {
    w.write_event(Event::End(BytesEnd::new(name))).map_err(xml_err)
}

fn empty(w: &mut XmlWriter, name: &str, attrs: &[(&str, &str)]) -> S2Result<()> {
    let elem = BytesStart::new(name).with_attributes(attrs.iter().copied());
    w.write_event(Event::Empty(elem)).map_err(xml_err)
}

fn text_element(w: &mut XmlWriter, name: &str, attrs: &[(&str, &str)], text: &str) -> S2Result<()> {
    start(w, name, attrs)?;
    w.write_event(Event::Text(BytesText::new(text))).map_err(xml_err)?;
    end(w, name)
}

fn render_vrt(band: &str, offset: f64, grid: &MosaicGrid, sources: &[SourceInfo]) -> S2Result<Vec<u8>> {
    let first = &sources[0];
    let mut w = Writer::new_with_indent(Cursor::new(Vec::new()), b' ', 2);

    let width = grid.width.to_string();
    let height = grid.height.to_string();
    start(&mut w, "VRTDataset", &[("rasterXSize", width.as_str()), ("rasterYSize", height.as_str())])?;
    if !first.projection.is_empty() {
        text_element(&mut w, "SRS", &[], &first.projection)?;
    }
    let gt = grid
        .geo_transform()
        .iter()
        .map(|v| format!("{:.16e}", v))
        .collect::<Vec<_>>()
        .join(", ");
    text_element(&mut w, "GeoTransform", &[], &gt)?;

    start(
        &mut w,
        "VRTRasterBand",
        &[("dataType", first.pixel_type.gdal_name()), ("band", "1")],
    )?;
    text_element(&mut w, "Description", &[], band)?;
    if let Some(nodata) = first.no_data {
        text_element(&mut w, "NoDataValue", &[], &format_number(nodata))?;
    }

    for s in sources {
        let (x_off, y_off) = grid.offset_of(&s.geo_transform);
        let src_w = s.width.to_string();
        let src_h = s.height.to_string();
        let block_x = s.block_size.0.to_string();
        let block_y = s.block_size.1.to_string();
        let x_off = x_off.to_string();
        let y_off = y_off.to_string();

        start(&mut w, "ComplexSource", &[])?;
        text_element(
            &mut w,
            "SourceFilename",
            &[("relativeToVRT", "0")],
            &s.path.to_string_lossy(),
        )?;
        text_element(&mut w, "SourceBand", &[], &s.band_index.to_string())?;
        empty(
            &mut w,
            "SourceProperties",
            &[
                ("RasterXSize", src_w.as_str()),
                ("RasterYSize", src_h.as_str()),
                ("DataType", s.pixel_type.gdal_name()),
                ("BlockXSize", block_x.as_str()),
                ("BlockYSize", block_y.as_str()),
            ],
        )?;
        empty(
            &mut w,
            "SrcRect",
            &[("xOff", "0"), ("yOff", "0"), ("xSize", src_w.as_str()), ("ySize", src_h.as_str())],
        )?;
        empty(
            &mut w,
            "DstRect",
            &[("xOff", x_off.as_str()), ("yOff", y_off.as_str()), ("xSize", src_w.as_str()), ("ySize", src_h.as_str())],
        )?;
        text_element(&mut w, "ScaleOffset", &[], &format_number(offset))?;
        text_element(&mut w, "ScaleRatio", &[], "1")?;
        if let Some(nodata) = s.no_data {
            text_element(&mut w, "NODATA", &[], &format_number(nodata))?;
        }
        end(&mut w, "ComplexSource")?;
    }

    end(&mut w, "VRTRasterBand")?;
    end(&mut w, "VRTDataset")?;
    Ok(w.into_inner().into_inner())
}

/// Write a VRT that presents `band` of `sources` with `offset` added to every DN.
///
/// Pixels are not rewritten: each source becomes a `ComplexSource` whose
/// `ScaleOffset` GDAL applies when the VRT is read.
///
/// Only raster metadata is read. Sources must share CRS, pixel size and data
/// type; several sources are mosaicked onto their union grid.
pub fn build_offset_vrt<P: AsRef<Path>>(
    sources: &[PathBuf],
    band: &str,
    offset: f64,
    out_path: P,
) -> S2Result<OffsetVrt> {
    let out_path = out_path.as_ref();
    if sources.is_empty() {
        return Err(S2Error::Configuration("no source rasters given".to_string()));
    }
    if !offset.is_finite() {
        return Err(S2Error::Configuration(format!("offset must be finite (got {})", offset)));
    }

    let infos = sources
        .iter()
        .map(|p| inspect_source(p, band))
        .collect::<S2Result<Vec<_>>>()?;
    let grid = mosaic_grid(band, &infos)?;
    let pixel_type = infos[0].pixel_type;
    let xml = render_vrt(band, offset, &grid, &infos)?;

    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(out_path, xml).map_err(|e| S2Error::IoWrite {
        path: out_path.to_path_buf(),
        message: e.to_string(),
    })?;
    log::info!(
        "🧮 Offset VRT for {} ({} source(s), offset {:+}) written to {}",
        band,
        infos.len(),
        offset,
        out_path.display()
    );

    Ok(OffsetVrt {
        path: out_path.to_path_buf(),
        band: band.to_string(),
        offset,
        sources: infos.into_iter().map(|s| s.path).collect(),
        width: grid.width,
        height: grid.height,
        pixel_type,
    })
}

/// Resolve the offset for the SAFE product containing `path` from `table`
pub fn offset_for_path(table: &BaselineOffsetTable, path: &Path) -> S2Result<f64> {
    let product_type = product_type_from_path(path).unwrap_or_else(|| "S2MSI2A".to_string());
    let baseline = baseline_from_path(path).ok_or_else(|| {
        S2Error::Configuration(format!(
            "Cannot determine processing baseline of {} (no *_Nxxxx_*.SAFE ancestor)",
            path.display()
        ))
    })?;
    table.offset_for(&product_type, &baseline)
}
