mod common;

use gdal::raster::Buffer;
use gdal::spatial_ref::SpatialRef;
use gdal::{Dataset, DriverManager};
use s2pipe::core::dn_offset::build_offset_vrt;
use s2pipe::core::translate::{RasterTranslator, TranslateInput, TranslateOptions};
use s2pipe::{PixelType, S2Error};
use std::path::{Path, PathBuf};

const WIDTH: usize = 6;
const HEIGHT: usize = 4;

/// Write a single-band UInt16 GeoTIFF in UTM 5N
fn write_tile(path: &Path, origin_x: f64, values: &[u16], nodata: Option<f64>) {
    let driver = DriverManager::get_driver_by_name("GTiff").unwrap();
    let mut ds = driver
        .create_with_band_type::<u16, _>(path, WIDTH as isize, HEIGHT as isize, 1)
        .unwrap();
    ds.set_geo_transform(&[origin_x, 20.0, 0.0, 7_500_000.0, 0.0, -20.0]).unwrap();
    ds.set_spatial_ref(&SpatialRef::from_epsg(32605).unwrap()).unwrap();
    let mut band = ds.rasterband(1).unwrap();
    if nodata.is_some() {
        band.set_no_data_value(nodata).unwrap();
    }
    band.write((0, 0), (WIDTH, HEIGHT), &Buffer::new((WIDTH, HEIGHT), values.to_vec()))
        .unwrap();
}

fn read_all(path: &Path) -> (usize, usize, Vec<u16>) {
    let ds = Dataset::open(path).unwrap();
    let (w, h) = ds.raster_size();
    let band = ds.rasterband(1).unwrap();
    let buf = band.read_as::<u16>((0, 0), (w, h), (w, h), None).unwrap();
    (w, h, buf.data)
}

fn ramp() -> Vec<u16> {
    let mut values: Vec<u16> = (0..(WIDTH * HEIGHT) as u16).map(|v| 1000 + v * 10).collect();
    values[0] = 65500;
    values[1] = 300;
    values
}

fn tile(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

#[test]
fn test_offset_vrt_materializes_as_source_plus_offset() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let src = tile(dir.path(), "T05WPS_20230701T213531_B04_20m.tif");
    write_tile(&src, 500_000.0, &ramp(), None);

    let vrt = build_offset_vrt(&[src.clone()], "B04", 100.0, dir.path().join("vrt/B04.vrt")).unwrap();
    assert_eq!((vrt.width, vrt.height), (WIDTH, HEIGHT));
    assert_eq!(vrt.pixel_type, PixelType::UInt16);
    assert_eq!(vrt.offset, 100.0);

    let out = dir.path().join("out/B04.tif");
    let raster = RasterTranslator::materialize(&TranslateInput::Vrt(vrt), &out, &TranslateOptions::default()).unwrap();
    assert_eq!(raster.bands, 1);

    let (_, _, source) = read_all(&src);
    let (w, h, result) = read_all(&out);
    assert_eq!((w, h), (WIDTH, HEIGHT));
    for (s, r) in source.iter().zip(&result) {
        assert_eq!(*r as u32, (*s as u32 + 100).min(u16::MAX as u32));
    }
    assert_eq!(result[0], u16::MAX);

    let ds = Dataset::open(&out).unwrap();
    let gt = ds.geo_transform().unwrap();
    approx::assert_abs_diff_eq!(gt[0], 500_000.0, epsilon = 1e-6);
    approx::assert_abs_diff_eq!(gt[5], -20.0, epsilon = 1e-9);
}

#[test]
fn test_negative_offset_clips_at_zero_and_keeps_nodata() {
    let dir = tempfile::tempdir().unwrap();
    let src = tile(dir.path(), "T05WPS_20230701T213531_B03_20m.tif");
    let mut values = ramp();
    values[2] = 0;
    write_tile(&src, 500_000.0, &values, Some(0.0));

    let vrt = build_offset_vrt(&[src], "B03", -1000.0, dir.path().join("B03.vrt")).unwrap();
    let out = dir.path().join("B03.tif");
    RasterTranslator::materialize(&TranslateInput::Vrt(vrt), &out, &TranslateOptions::default()).unwrap();

    let (_, _, result) = read_all(&out);
    assert_eq!(result[0], 64500);
    // 300 - 1000 clips to the type minimum
    assert_eq!(result[1], 0);
    assert_eq!(result[2], 0);
    assert_eq!(result[3], 1030 - 1000);
    let nodata = Dataset::open(&out).unwrap().rasterband(1).unwrap().no_data_value();
    assert_eq!(nodata, Some(0.0));
}

#[test]
fn test_translation_is_deterministic() {
    let dir = tempfile::tempdir().unwrap();
    let src = tile(dir.path(), "T05WPS_20230701T213531_B08_20m.tif");
    write_tile(&src, 500_000.0, &ramp(), None);
    let vrt = build_offset_vrt(&[src], "B08", -1000.0, dir.path().join("B08.vrt")).unwrap();

    let options = TranslateOptions::parse(&["COMPRESS=DEFLATE", "BLOCKSIZE=16", "PREDICTOR=2"]).unwrap();
    let input = TranslateInput::Vrt(vrt);
    let a = dir.path().join("a.tif");
    let b = dir.path().join("b.tif");
    RasterTranslator::materialize(&input, &a, &options).unwrap();
    RasterTranslator::materialize(&input, &b, &options).unwrap();
    assert_eq!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
}

#[test]
fn test_adjacent_tiles_are_mosaicked() {
    let dir = tempfile::tempdir().unwrap();
    let left = tile(dir.path(), "left_B04_20m.tif");
    let right = tile(dir.path(), "right_B04_20m.tif");
    write_tile(&left, 500_000.0, &vec![10; WIDTH * HEIGHT], None);
    write_tile(&right, 500_000.0 + 20.0 * WIDTH as f64, &vec![20; WIDTH * HEIGHT], None);

    let vrt = build_offset_vrt(&[left, right], "B04", 5.0, dir.path().join("mosaic.vrt")).unwrap();
    assert_eq!((vrt.width, vrt.height), (2 * WIDTH, HEIGHT));

    let out = dir.path().join("mosaic.tif");
    RasterTranslator::materialize(&TranslateInput::Vrt(vrt), &out, &TranslateOptions::default()).unwrap();
    let (w, _, result) = read_all(&out);
    assert_eq!(w, 2 * WIDTH);
    assert_eq!(result[0], 15);
    assert_eq!(result[WIDTH - 1], 15);
    assert_eq!(result[WIDTH], 25);
    assert_eq!(result[2 * WIDTH - 1], 25);
}

#[test]
fn test_source_without_band_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let src = tile(dir.path(), "T05WPS_20230701T213531_B03_20m.tif");
    write_tile(&src, 500_000.0, &ramp(), None);

    let out = dir.path().join("B04.vrt");
    match build_offset_vrt(&[src], "B04", -1000.0, &out) {
        Err(S2Error::BandMismatch { band, .. }) => assert_eq!(band, "B04"),
        other => panic!("expected BandMismatch, got {:?}", other),
    }
    assert!(!out.exists());
}

#[test]
fn test_plain_raster_copy_and_write_failure() {
    let dir = tempfile::tempdir().unwrap();
    let src = tile(dir.path(), "scene_B02.tif");
    write_tile(&src, 500_000.0, &ramp(), None);

    let copy = dir.path().join("copy.tif");
    RasterTranslator::materialize(&TranslateInput::Raster(src.clone()), &copy, &TranslateOptions::default()).unwrap();
    assert_eq!(read_all(&copy).2, read_all(&src).2);

    // parent "directory" is a regular file
    let blocker = dir.path().join("blocker");
    std::fs::write(&blocker, b"x").unwrap();
    let result = RasterTranslator::materialize(
        &TranslateInput::Raster(src),
        blocker.join("out.tif"),
        &TranslateOptions::default(),
    );
    assert!(matches!(result, Err(S2Error::IoWrite { .. })));
}
