use crate::types::{OffsetVrt, OutputRaster, PixelType, S2Error, S2Result};
use gdal::raster::{Buffer, GdalType, RasterCreationOption};
use gdal::{Dataset, DriverManager};
use num_traits::NumCast;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_BLOCK_SIZE: usize = 256;

/// GeoTIFF compression codecs accepted by `COMPRESS=`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Deflate,
    Lzw,
    Zstd,
}

impl Compression {
    fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_uppercase().as_str() {
            "NONE" => Some(Compression::None),
            "DEFLATE" => Some(Compression::Deflate),
            "LZW" => Some(Compression::Lzw),
            "ZSTD" => Some(Compression::Zstd),
            _ => None,
        }
    }

    pub fn gdal_name(&self) -> &'static str {
        match self {
            Compression::None => "NONE",
            Compression::Deflate => "DEFLATE",
            Compression::Lzw => "LZW",
            Compression::Zstd => "ZSTD",
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.gdal_name())
    }
}

/// Output creation settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranslateOptions {
    pub compress: Compression,
    /// Tile edge in pixels, also the streaming window
    pub block_size: usize,
    pub predictor: Option<u8>,
}

impl Default for TranslateOptions {
    fn default() -> Self {
        Self {
            compress: Compression::Deflate,
            block_size: DEFAULT_BLOCK_SIZE,
            predictor: None,
        }
    }
}

impl TranslateOptions {
    /// Parse `KEY=VALUE` strings.
    ///
    /// Unrecognised keys, malformed items and unsupported codecs are logged
    /// and ignored. Bad BLOCKSIZE or PREDICTOR values are errors.
    pub fn parse<S: AsRef<str>>(items: &[S]) -> S2Result<Self> {
        let mut options = Self::default();
        for item in items {
            let item = item.as_ref();
            let Some((key, value)) = item.split_once('=') else {
                log::warn!("Ignoring translate option {:?}: not KEY=VALUE", item);
                continue;
            };
            let value = value.trim();
            match key.trim().to_ascii_uppercase().as_str() {
                "COMPRESS" => match Compression::parse(value) {
                    Some(codec) => options.compress = codec,
                    None => log::warn!(
                        "Ignoring unsupported COMPRESS={}; keeping {}",
                        value,
                        options.compress
                    ),
                },
                "BLOCKSIZE" => {
                    options.block_size = value.parse().map_err(|_| {
                        S2Error::Configuration(format!("BLOCKSIZE must be an integer, got {}", value))
                    })?
                }
                "PREDICTOR" => {
                    let predictor: u8 = value.parse().map_err(|_| {
                        S2Error::Configuration(format!("PREDICTOR must be 1, 2 or 3, got {}", value))
                    })?;
                    if !(1..=3).contains(&predictor) {
                        return Err(S2Error::Configuration(format!(
                            "PREDICTOR must be 1, 2 or 3, got {}",
                            predictor
                        )));
                    }
                    options.predictor = Some(predictor);
                }
                other => log::warn!("Ignoring unknown translate option {}", other),
            }
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> S2Result<()> {
        // GeoTIFF tiles must be multiples of 16
        if self.block_size == 0 || self.block_size % 16 != 0 {
            return Err(S2Error::Configuration(format!(
                "BLOCKSIZE must be a positive multiple of 16, got {}",
                self.block_size
            )));
        }
        Ok(())
    }

    fn creation_options(&self) -> Vec<(&'static str, String)> {
        let mut opts = vec![
            ("TILED", "YES".to_string()),
            ("BLOCKXSIZE", self.block_size.to_string()),
            ("BLOCKYSIZE", self.block_size.to_string()),
            ("COMPRESS", self.compress.gdal_name().to_string()),
        ];
        if let Some(predictor) = self.predictor {
            if self.compress != Compression::None {
                opts.push(("PREDICTOR", predictor.to_string()));
            }
        }
        opts
    }
}

/// What to materialize
#[derive(Debug, Clone)]
pub enum TranslateInput {
    Vrt(OffsetVrt),
    Raster(PathBuf),
}

impl TranslateInput {
    pub fn path(&self) -> &Path {
        match self {
            TranslateInput::Vrt(vrt) => &vrt.path,
            TranslateInput::Raster(path) => path,
        }
    }
}

impl From<OffsetVrt> for TranslateInput {
    fn from(vrt: OffsetVrt) -> Self {
        TranslateInput::Vrt(vrt)
    }
}

impl From<PathBuf> for TranslateInput {
    fn from(path: PathBuf) -> Self {
        TranslateInput::Raster(path)
    }
}

fn temp_path(dest: &Path) -> PathBuf {
    let name = dest
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "output.tif".to_string());
    dest.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

/// Writes GDAL-readable inputs out as tiled GeoTIFFs, one block at a time
pub struct RasterTranslator;

impl RasterTranslator {
    /// Copy `input` to a tiled GeoTIFF at `destination`.
    ///
    /// Data goes to a temporary file next to `destination` which is renamed
    /// into place once complete.
    pub fn materialize<P: AsRef<Path>>(
        input: &TranslateInput,
        destination: P,
        options: &TranslateOptions,
    ) -> S2Result<OutputRaster> {
        let destination = destination.as_ref();
        options.validate()?;

        let source = Dataset::open(input.path())?;
        let bands = source.raster_count();
        if bands < 1 {
            return Err(S2Error::Configuration(format!(
                "{} has no raster bands",
                input.path().display()
            )));
        }
        let pixel_type = match input {
            TranslateInput::Vrt(vrt) => vrt.pixel_type,
            TranslateInput::Raster(path) => {
                let name = source.rasterband(1)?.band_type().name();
                PixelType::from_gdal_name(&name).ok_or_else(|| {
                    S2Error::Configuration(format!("Unsupported data type {} in {}", name, path.display()))
                })?
            }
        };
        let (width, height) = source.raster_size();

        log::info!(
            "💾 Translating {} ({}x{}, {} band(s), {}) to {} [{}, {}px tiles]",
            input.path().display(),
            width,
            height,
            bands,
            pixel_type,
            destination.display(),
            options.compress,
            options.block_size
        );

        if let Some(parent) = destination.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| S2Error::IoWrite {
                    path: destination.to_path_buf(),
                    message: e.to_string(),
                })?;
            }
        }
        let tmp = temp_path(destination);

        let written = match pixel_type {
            PixelType::Byte => Self::copy::<u8>(&source, &tmp, pixel_type, options),
            PixelType::UInt16 => Self::copy::<u16>(&source, &tmp, pixel_type, options),
            PixelType::Int16 => Self::copy::<i16>(&source, &tmp, pixel_type, options),
            PixelType::UInt32 => Self::copy::<u32>(&source, &tmp, pixel_type, options),
            PixelType::Int32 => Self::copy::<i32>(&source, &tmp, pixel_type, options),
            PixelType::Float32 => Self::copy::<f32>(&source, &tmp, pixel_type, options),
            PixelType::Float64 => Self::copy::<f64>(&source, &tmp, pixel_type, options),
        }
        .and_then(|_| fs::rename(&tmp, destination).map_err(S2Error::from));

        if let Err(e) = written {
            if tmp.exists() {
                let _ = fs::remove_file(&tmp);
            }
            return Err(S2Error::IoWrite {
                path: destination.to_path_buf(),
                message: e.to_string(),
            });
        }

        log::info!("✅ Wrote {}", destination.display());
        Ok(OutputRaster {
            path: destination.to_path_buf(),
            width,
            height,
            bands: bands as usize,
            pixel_type,
        })
    }

    /// Stream every band of `source` into a new GeoTIFF at `path`
    fn copy<T: GdalType + NumCast + Copy>(
        source: &Dataset,
        path: &Path,
        pixel_type: PixelType,
        options: &TranslateOptions,
    ) -> S2Result<()> {
        let (width, height) = source.raster_size();
        let bands = source.raster_count();

        let owned = options.creation_options();
        let creation: Vec<RasterCreationOption> = owned
            .iter()
            .map(|(key, value)| RasterCreationOption { key: *key, value: value.as_str() })
            .collect();

        let driver = DriverManager::get_driver_by_name("GTiff")?;
        let mut target = driver.create_with_band_type_with_options::<T, _>(
            path,
            width as isize,
            height as isize,
            bands,
            &creation,
        )?;

        if let Ok(gt) = source.geo_transform() {
            target.set_geo_transform(&gt)?;
        }
        let projection = source.projection();
        if !projection.is_empty() {
            target.set_projection(&projection)?;
        }

        let block = options.block_size;
        for b in 1..=bands {
            let in_band = source.rasterband(b)?;
            let mut out_band = target.rasterband(b)?;
            if let Some(nodata) = in_band.no_data_value() {
                out_band.set_no_data_value(Some(nodata))?;
            }

            for y in (0..height).step_by(block) {
                let rows = block.min(height - y);
                for x in (0..width).step_by(block) {
                    let cols = block.min(width - x);
                    let window = in_band.read_as::<f64>((x as isize, y as isize), (cols, rows), (cols, rows), None)?;
                    let data = window
                        .data
                        .iter()
                        .map(|&v| to_pixel::<T>(pixel_type, v))
                        .collect::<S2Result<Vec<T>>>()?;
                    out_band.write((x as isize, y as isize), (cols, rows), &Buffer::new((cols, rows), data))?;
                }
            }
            log::debug!("Band {} of {} copied", b, bands);
        }
        Ok(())
    }
}

/// Clamp into the output type's range and convert
fn to_pixel<T: NumCast>(pixel_type: PixelType, value: f64) -> S2Result<T> {
    let value = if value.is_nan() && pixel_type.is_integer() {
        0.0
    } else {
        pixel_type.clamp(value)
    };
    num_traits::cast::<f64, T>(value).ok_or_else(|| {
        S2Error::Configuration(format!("Value {} does not fit {}", value, pixel_type))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_options() {
        let opts = TranslateOptions::parse(&["COMPRESS=lzw", "BLOCKSIZE=512", "PREDICTOR=2"]).unwrap();
        assert_eq!(opts.compress, Compression::Lzw);
        assert_eq!(opts.block_size, 512);
        assert_eq!(opts.predictor, Some(2));

        let defaults = TranslateOptions::parse::<&str>(&[]).unwrap();
        assert_eq!(defaults, TranslateOptions::default());
        assert_eq!(defaults.block_size, DEFAULT_BLOCK_SIZE);
    }

    #[test]
    fn test_parse_ignores_unknown_keys() {
        let opts = TranslateOptions::parse(&["NUM_THREADS=4", "COMPRESS=ZSTD"]).unwrap();
        assert_eq!(opts.compress, Compression::Zstd);
    }

    #[test]
    fn test_parse_rejects_bad_values() {
        assert!(TranslateOptions::parse(&["BLOCKSIZE=100"]).is_err());
        assert!(TranslateOptions::parse(&["BLOCKSIZE=abc"]).is_err());
        assert!(TranslateOptions::parse(&["PREDICTOR=7"]).is_err());
    }

    #[test]
    fn test_parse_skips_malformed_items_and_unknown_codecs() {
        let opts = TranslateOptions::parse(&["COMPRESS", "COMPRESS=JPEG", "BLOCKSIZE=512"]).unwrap();
        assert_eq!(opts.compress, Compression::Deflate);
        assert_eq!(opts.block_size, 512);

        let opts = TranslateOptions::parse(&["COMPRESS=LZW", "COMPRESS=WEBP"]).unwrap();
        assert_eq!(opts.compress, Compression::Lzw);
    }

    #[test]
    fn test_creation_options() {
        let opts = TranslateOptions { predictor: Some(2), ..Default::default() };
        let co = opts.creation_options();
        assert!(co.contains(&("TILED", "YES".to_string())));
        assert!(co.contains(&("BLOCKXSIZE", "256".to_string())));
        assert!(co.contains(&("PREDICTOR", "2".to_string())));

        let none = TranslateOptions { compress: Compression::None, predictor: Some(2), ..Default::default() };
        assert!(!none.creation_options().iter().any(|(k, _)| *k == "PREDICTOR"));
    }

    #[test]
    fn test_to_pixel_clamps() {
        assert_eq!(to_pixel::<u16>(PixelType::UInt16, 70000.0).unwrap(), 65535);
        assert_eq!(to_pixel::<u16>(PixelType::UInt16, -5.0).unwrap(), 0);
        assert_eq!(to_pixel::<u8>(PixelType::Byte, 12.6).unwrap(), 13);
        assert_eq!(to_pixel::<i16>(PixelType::Int16, f64::NAN).unwrap(), 0);
        assert!(to_pixel::<f32>(PixelType::Float32, f64::NAN).unwrap().is_nan());
    }

    #[test]
    fn test_temp_path_is_hidden_sibling() {
        let tmp = temp_path(Path::new("/out/B04.tif"));
        assert_eq!(tmp.parent(), Some(Path::new("/out")));
        assert!(tmp.file_name().unwrap().to_string_lossy().starts_with(".B04.tif."));
    }
}
