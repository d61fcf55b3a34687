use crate::types::{AreaOfInterest, BoundingBox, Geometry, Ring, S2Error, S2Result};
use gdal::spatial_ref::{CoordTransform, SpatialRef};
use gdal::vector::Geometry as OgrGeometry;
use gdal_sys::OSRAxisMappingStrategy;
use serde_json::{json, Value};
use std::fs;
use std::path::Path;

/// CRS assumed for GeoJSON files that do not name one
pub const DEFAULT_CRS: &str = "EPSG:4326";

fn is_wgs84(crs: &str) -> bool {
    crs.trim().eq_ignore_ascii_case(DEFAULT_CRS) || crs.contains("CRS84")
}

/// Builds and loads single-feature AOI files
pub struct AoiBuilder;

impl AoiBuilder {
    /// Check that the box has positive extent on both axes
    pub fn validate_bbox(bbox: &BoundingBox) -> S2Result<()> {
        let coords = [bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat];
        if coords.iter().any(|c| !c.is_finite()) {
            return Err(S2Error::InvalidGeometry(format!("non-finite coordinate in {:?}", bbox)));
        }
        if bbox.min_lon >= bbox.max_lon {
            return Err(S2Error::InvalidGeometry(format!(
                "xmin ({}) must be less than xmax ({})",
                bbox.min_lon, bbox.max_lon
            )));
        }
        if bbox.min_lat >= bbox.max_lat {
            return Err(S2Error::InvalidGeometry(format!(
                "ymin ({}) must be less than ymax ({})",
                bbox.min_lat, bbox.max_lat
            )));
        }
        Ok(())
    }

    /// Resolve a CRS identifier such as `EPSG:4326` through GDAL/PROJ
    pub fn resolve_crs(crs: &str) -> S2Result<SpatialRef> {
        if crs.trim().is_empty() {
            return Err(S2Error::UnknownCrs("empty CRS identifier".to_string()));
        }
        SpatialRef::from_definition(crs).map_err(|e| S2Error::UnknownCrs(format!("{}: {}", crs, e)))
    }

    /// Build the AOI polygon for `bbox` and write it to `out_path`.
    ///
    /// An existing file at `out_path` is overwritten.
    pub fn create<P: AsRef<Path>>(bbox: &BoundingBox, crs: &str, out_path: P) -> S2Result<AreaOfInterest> {
        let out_path = out_path.as_ref();
        Self::validate_bbox(bbox)?;
        Self::resolve_crs(crs)?;

        let aoi = AreaOfInterest {
            geometry: Geometry::Polygon(vec![bbox.to_ring()]),
            crs: crs.to_string(),
        };
        Self::write(&aoi, out_path)?;
        log::info!("🗺️  Wrote AOI {:?} ({}) to {}", bbox, crs, out_path.display());
        Ok(aoi)
    }

    /// Reproject to EPSG:4326 in longitude/latitude order.
    ///
    /// AOIs already in EPSG:4326 (or OGC CRS84) are returned unchanged.
    pub fn to_wgs84(aoi: &AreaOfInterest) -> S2Result<AreaOfInterest> {
        if is_wgs84(&aoi.crs) {
            return Ok(aoi.clone());
        }
        let source = Self::resolve_crs(&aoi.crs)?;
        let target = SpatialRef::from_epsg(4326)?;
        source.set_axis_mapping_strategy(OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        target.set_axis_mapping_strategy(OSRAxisMappingStrategy::OAMS_TRADITIONAL_GIS_ORDER);
        let transform = CoordTransform::new(&source, &target)?;

        let reproject = |ring: &Ring| -> S2Result<Ring> {
            let mut xs: Vec<f64> = ring.iter().map(|p| p[0]).collect();
            let mut ys: Vec<f64> = ring.iter().map(|p| p[1]).collect();
            let mut zs = vec![0.0; ring.len()];
            transform.transform_coords(&mut xs, &mut ys, &mut zs)?;
            Ok(xs.into_iter().zip(ys).map(|(x, y)| [x, y]).collect())
        };
        let geometry = match &aoi.geometry {
            Geometry::Polygon(rings) => Geometry::Polygon(rings.iter().map(&reproject).collect::<S2Result<_>>()?),
            Geometry::MultiPolygon(polys) => Geometry::MultiPolygon(
                polys
                    .iter()
                    .map(|rings| rings.iter().map(&reproject).collect::<S2Result<Vec<_>>>())
                    .collect::<S2Result<_>>()?,
            ),
        };
        log::debug!("Reprojected AOI from {} to {}", aoi.crs, DEFAULT_CRS);
        Ok(AreaOfInterest {
            geometry,
            crs: DEFAULT_CRS.to_string(),
        })
    }

    /// Serialize as a one-feature GeoJSON FeatureCollection
    pub fn to_geojson(aoi: &AreaOfInterest) -> Value {
        json!({
            "type": "FeatureCollection",
            "name": "aoi",
            "crs": { "type": "name", "properties": { "name": crs_urn(&aoi.crs) } },
            "features": [{
                "type": "Feature",
                "properties": { "name": "AOI" },
                "geometry": geometry_json(&aoi.geometry),
            }]
        })
    }

    pub fn write<P: AsRef<Path>>(aoi: &AreaOfInterest, out_path: P) -> S2Result<()> {
        let out_path = out_path.as_ref();
        if let Some(parent) = out_path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let text = serde_json::to_string_pretty(&Self::to_geojson(aoi))?;
        fs::write(out_path, text).map_err(|e| S2Error::IoWrite {
            path: out_path.to_path_buf(),
            message: e.to_string(),
        })
    }

    /// Read an AOI from a GeoJSON file (FeatureCollection, Feature or bare geometry).
    ///
    /// Several polygonal features are combined into one MultiPolygon.
    pub fn load<P: AsRef<Path>>(path: P) -> S2Result<AreaOfInterest> {
        let path = path.as_ref();
        log::debug!("Loading AOI from {}", path.display());
        let doc: Value = serde_json::from_str(&fs::read_to_string(path)?)?;
        let crs = doc
            .get("crs")
            .and_then(|c| c.get("properties"))
            .and_then(|p| p.get("name"))
            .and_then(Value::as_str)
            .map(crs_from_urn)
            .unwrap_or_else(|| DEFAULT_CRS.to_string());

        let geometries: Vec<&Value> = match doc.get("type").and_then(Value::as_str) {
            Some("FeatureCollection") => doc
                .get("features")
                .and_then(Value::as_array)
                .map(|fs| fs.iter().filter_map(|f| f.get("geometry")).collect())
                .unwrap_or_default(),
            Some("Feature") => doc.get("geometry").into_iter().collect(),
            Some(_) => vec![&doc],
            None => Vec::new(),
        };

        let mut polygons: Vec<Vec<Ring>> = Vec::new();
        for g in geometries {
            polygons.extend(parse_polygons(g)?);
        }
        let geometry = match polygons.len() {
            0 => {
                return Err(S2Error::InvalidGeometry(format!(
                    "no polygon features found in {}",
                    path.display()
                )))
            }
            1 => Geometry::Polygon(polygons.remove(0)),
            _ => Geometry::MultiPolygon(polygons),
        };
        Ok(AreaOfInterest { geometry, crs })
    }
}

fn geometry_json(geometry: &Geometry) -> Value {
    match geometry {
        Geometry::Polygon(rings) => json!({ "type": "Polygon", "coordinates": rings }),
        Geometry::MultiPolygon(polys) => json!({ "type": "MultiPolygon", "coordinates": polys }),
    }
}

fn crs_urn(crs: &str) -> String {
    match crs.split_once(':') {
        Some((auth, code)) if auth.eq_ignore_ascii_case("EPSG") => format!("urn:ogc:def:crs:EPSG::{}", code),
        _ => crs.to_string(),
    }
}

fn crs_from_urn(name: &str) -> String {
    if name.contains("CRS84") {
        return DEFAULT_CRS.to_string();
    }
    match name.strip_prefix("urn:ogc:def:crs:") {
        Some(rest) => {
            let parts: Vec<&str> = rest.split(':').filter(|p| !p.is_empty()).collect();
            match (parts.first(), parts.last()) {
                (Some(auth), Some(code)) if parts.len() >= 2 => format!("{}:{}", auth, code),
                _ => name.to_string(),
            }
        }
        None => name.to_string(),
    }
}

fn parse_ring(value: &Value) -> S2Result<Ring> {
    let positions = value
        .as_array()
        .ok_or_else(|| S2Error::InvalidGeometry("ring is not an array".to_string()))?;
    let ring: Ring = positions
        .iter()
        .map(|p| {
            let x = p.get(0).and_then(Value::as_f64);
            let y = p.get(1).and_then(Value::as_f64);
            match (x, y) {
                (Some(x), Some(y)) => Ok([x, y]),
                _ => Err(S2Error::InvalidGeometry(format!("bad position {}", p))),
            }
        })
        .collect::<S2Result<_>>()?;
    if ring.len() < 4 || ring.first() != ring.last() {
        return Err(S2Error::InvalidGeometry(
            "polygon rings need at least 4 positions and must be closed".to_string(),
        ));
    }
    Ok(ring)
}

fn parse_polygon(value: &Value) -> S2Result<Vec<Ring>> {
    value
        .as_array()
        .ok_or_else(|| S2Error::InvalidGeometry("polygon coordinates are not an array".to_string()))?
        .iter()
        .map(parse_ring)
        .collect()
}

fn parse_polygons(geometry: &Value) -> S2Result<Vec<Vec<Ring>>> {
    let coords = geometry
        .get("coordinates")
        .ok_or_else(|| S2Error::InvalidGeometry("geometry has no coordinates".to_string()))?;
    match geometry.get("type").and_then(Value::as_str) {
        Some("Polygon") => Ok(vec![parse_polygon(coords)?]),
        Some("MultiPolygon") => coords
            .as_array()
            .ok_or_else(|| S2Error::InvalidGeometry("multipolygon coordinates are not an array".to_string()))?
            .iter()
            .map(parse_polygon)
            .collect(),
        other => Err(S2Error::InvalidGeometry(format!(
            "unsupported AOI geometry type {:?}",
            other
        ))),
    }
}

/// Settings for [`overlay_latlon_grid`]
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridOptions {
    /// Cell width in degrees of longitude
    pub dx_deg: f64,
    /// Cell height in degrees of latitude
    pub dy_deg: f64,
    /// Cut cells to the AOI outline; otherwise whole cells touching the AOI are kept
    pub clip_to_aoi: bool,
    pub fill_aoi_holes: bool,
    pub fill_cell_holes: bool,
}

impl GridOptions {
    pub fn new(dx_deg: f64, dy_deg: f64) -> Self {
        Self {
            dx_deg,
            dy_deg,
            clip_to_aoi: true,
            fill_aoi_holes: true,
            fill_cell_holes: true,
        }
    }
}

/// One cell of a lat/lon grid laid over an AOI
#[derive(Debug, Clone, PartialEq)]
pub struct GridCell {
    pub row: usize,
    pub col: usize,
    /// Lower-left corner of the uncut cell
    pub minx: f64,
    pub miny: f64,
    pub geometry: Geometry,
}

fn without_holes(polygons: Vec<Vec<Ring>>) -> Vec<Vec<Ring>> {
    polygons
        .into_iter()
        .filter_map(|rings| rings.into_iter().next().map(|exterior| vec![exterior]))
        .collect()
}

fn polygons_of(geometry: &Geometry) -> Vec<Vec<Ring>> {
    match geometry {
        Geometry::Polygon(rings) => vec![rings.clone()],
        Geometry::MultiPolygon(polys) => polys.clone(),
    }
}

fn from_polygons(mut polygons: Vec<Vec<Ring>>) -> Option<Geometry> {
    match polygons.len() {
        0 => None,
        1 => Some(Geometry::Polygon(polygons.remove(0))),
        _ => Some(Geometry::MultiPolygon(polygons)),
    }
}

fn to_ogr(geometry: &Geometry) -> S2Result<OgrGeometry> {
    Ok(OgrGeometry::from_wkt(&geometry.to_wkt())?)
}

/// Polygonal parts of an OGR geometry; lines and points left by an overlay are dropped
fn ogr_polygons(geometry: &OgrGeometry) -> S2Result<Vec<Vec<Ring>>> {
    let value: Value = serde_json::from_str(&geometry.json()?)?;
    collect_polygons(&value)
}

fn collect_polygons(value: &Value) -> S2Result<Vec<Vec<Ring>>> {
    match value.get("type").and_then(Value::as_str) {
        Some("Polygon") | Some("MultiPolygon") => parse_polygons(value),
        Some("GeometryCollection") => {
            let mut polygons = Vec::new();
            for member in value.get("geometries").and_then(Value::as_array).into_iter().flatten() {
                polygons.extend(collect_polygons(member)?);
            }
            Ok(polygons)
        }
        _ => Ok(Vec::new()),
    }
}

/// Lay a regular lon/lat grid over `aoi` and keep the cells that intersect it.
///
/// The AOI is reprojected to EPSG:4326 and its parts dissolved into one
/// outline. Columns start at the western edge of the AOI envelope and rows at
/// its southern edge; cells are returned row by row.
pub fn overlay_latlon_grid(aoi: &AreaOfInterest, options: &GridOptions) -> S2Result<Vec<GridCell>> {
    let (dx, dy) = (options.dx_deg, options.dy_deg);
    if !(dx.is_finite() && dx > 0.0 && dy.is_finite() && dy > 0.0) {
        return Err(S2Error::Configuration(format!(
            "grid cell size must be positive (got dx={}, dy={})",
            dx, dy
        )));
    }

    let wgs84 = AoiBuilder::to_wgs84(aoi)?;
    let mut polygons = polygons_of(&wgs84.geometry);
    if options.fill_aoi_holes {
        polygons = without_holes(polygons);
    }
    let mut outline: Option<OgrGeometry> = None;
    for rings in polygons {
        let part = to_ogr(&Geometry::Polygon(rings))?;
        outline = Some(match outline {
            None => part,
            Some(acc) => acc
                .union(&part)
                .ok_or_else(|| S2Error::InvalidGeometry("failed to dissolve AOI parts".to_string()))?,
        });
    }
    let outline = match outline {
        Some(g) if !g.is_empty() => g,
        _ => return Err(S2Error::InvalidGeometry("AOI is empty".to_string())),
    };
    let bounds = wgs84
        .bounds()
        .ok_or_else(|| S2Error::InvalidGeometry("AOI has no coordinates".to_string()))?;

    let n_cols = ((bounds.max_lon - bounds.min_lon) / dx).ceil().max(0.0) as usize;
    let n_rows = ((bounds.max_lat - bounds.min_lat) / dy).ceil().max(0.0) as usize;
    log::info!(
        "🌐 Overlaying {}x{} grid ({}° x {}°) on AOI {:?}",
        n_cols,
        n_rows,
        dx,
        dy,
        bounds
    );

    let mut cells = Vec::new();
    for row in 0..n_rows {
        let y = bounds.min_lat + row as f64 * dy;
        for col in 0..n_cols {
            let x = bounds.min_lon + col as f64 * dx;
            let square = Geometry::Polygon(vec![BoundingBox::new(x, y, x + dx, y + dy).to_ring()]);
            let cell = to_ogr(&square)?;
            if !cell.intersects(&outline) {
                continue;
            }

            let mut parts = if options.clip_to_aoi {
                match cell.intersection(&outline) {
                    Some(cut) if !cut.is_empty() => ogr_polygons(&cut)?,
                    _ => continue,
                }
            } else {
                polygons_of(&square)
            };
            if options.fill_cell_holes {
                parts = without_holes(parts);
            }
            if let Some(geometry) = from_polygons(parts) {
                cells.push(GridCell { row, col, minx: x, miny: y, geometry });
            }
        }
    }
    log::info!("Grid has {} cell(s) over the AOI", cells.len());
    Ok(cells)
}

/// Write grid cells as a GeoJSON FeatureCollection in EPSG:4326
pub fn write_grid<P: AsRef<Path>>(cells: &[GridCell], out_path: P) -> S2Result<()> {
    let out_path = out_path.as_ref();
    let features: Vec<Value> = cells
        .iter()
        .map(|c| {
            json!({
                "type": "Feature",
                "properties": { "row": c.row, "col": c.col, "minx": c.minx, "miny": c.miny },
                "geometry": geometry_json(&c.geometry),
            })
        })
        .collect();
    let doc = json!({
        "type": "FeatureCollection",
        "name": "grid",
        "crs": { "type": "name", "properties": { "name": crs_urn(DEFAULT_CRS) } },
        "features": features,
    });
    if let Some(parent) = out_path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    fs::write(out_path, serde_json::to_string_pretty(&doc)?).map_err(|e| S2Error::IoWrite {
        path: out_path.to_path_buf(),
        message: e.to_string(),
    })?;
    log::info!("Wrote {} grid cell(s) to {}", cells.len(), out_path.display());
    Ok(())
}
