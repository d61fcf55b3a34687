mod common;

use chrono::NaiveDate;
use common::{page, product, MockTransport, Reply};
use s2pipe::core::RetryPolicy;
use s2pipe::io::{AoiBuilder, CatalogueClient};
use s2pipe::{AreaOfInterest, BoundingBox, Geometry, PipelineConfig, QueryWindow, S2Error};
use std::collections::HashSet;
use std::sync::Arc;

const NAME_0615: &str = "S2A_MSIL2A_20200615T213531_N0214_R086_T05WPS_20200615T233003.SAFE";
const NAME_0705: &str = "S2B_MSIL2A_20200705T213529_N0214_R086_T05WPS_20200705T233501.SAFE";
const NAME_0801: &str = "S2A_MSIL2A_20200801T213531_N0214_R086_T05WPS_20200801T232959.SAFE";

fn config() -> PipelineConfig {
    PipelineConfig {
        catalogue_url: "https://cat.test/odata/v1".to_string(),
        catalogue_retry: RetryPolicy::immediate(3),
        page_size: 2,
        ..PipelineConfig::default()
    }
}

fn aoi() -> AreaOfInterest {
    AreaOfInterest {
        geometry: Geometry::Polygon(vec![BoundingBox::new(-150.0, 67.0, -148.0, 69.0).to_ring()]),
        crs: "EPSG:4326".to_string(),
    }
}

fn window(start: (i32, u32, u32), end: (i32, u32, u32)) -> QueryWindow {
    QueryWindow::new(
        NaiveDate::from_ymd_opt(start.0, start.1, start.2).unwrap(),
        NaiveDate::from_ymd_opt(end.0, end.1, end.2).unwrap(),
        "SENTINEL-2",
        "S2MSI2A",
        vec!["B04".to_string()],
        20,
    )
    .unwrap()
}

fn client(transport: &Arc<MockTransport>) -> CatalogueClient {
    CatalogueClient::new(transport.clone(), &config())
}

#[test]
fn test_overlapping_windows_yield_each_product_once() {
    common::init_logging();
    let transport = Arc::new(
        MockTransport::new()
            .on_contains(
                "gt 2020-06-01T",
                vec![Reply::Json(page(
                    vec![
                        product("p2", NAME_0705, "2020-07-05T21:35:29.024Z"),
                        product("p1", NAME_0615, "2020-06-15T21:35:31.024Z"),
                    ],
                    None,
                ))],
            )
            .on_contains(
                "gt 2020-07-01T",
                vec![Reply::Json(page(
                    vec![
                        product("p2", NAME_0705, "2020-07-05T21:35:29.024Z"),
                        product("p3", NAME_0801, "2020-08-01T21:35:31.024Z"),
                    ],
                    None,
                ))],
            ),
    );

    let windows = vec![window((2020, 6, 1), (2020, 7, 15)), window((2020, 7, 1), (2020, 8, 31))];
    let ids: Vec<String> = client(&transport)
        .search(&aoi(), windows)
        .unwrap()
        .map(|r| r.unwrap().id)
        .collect();
    assert_eq!(ids, vec!["p1", "p2", "p3"]);
}

#[test]
fn test_follows_next_links() {
    let transport = Arc::new(
        MockTransport::new()
            .on_contains(
                "$filter=",
                vec![Reply::Json(page(
                    vec![
                        product("p1", NAME_0615, "2020-06-15T21:35:31.024Z"),
                        product("p2", NAME_0705, "2020-07-05T21:35:29.024Z"),
                    ],
                    Some("https://cat.test/odata/v1/Products?page=2"),
                ))],
            )
            .on_exact(
                "https://cat.test/odata/v1/Products?page=2",
                vec![Reply::Json(page(vec![product("p3", NAME_0801, "2020-08-01T21:35:31.024Z")], None))],
            ),
    );

    let records: Vec<_> = client(&transport)
        .search(&aoi(), vec![window((2020, 6, 1), (2020, 8, 31))])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(transport.calls().len(), 2);
}

#[test]
fn test_client_error_is_fatal_for_the_window_only() {
    let transport = Arc::new(
        MockTransport::new()
            .on_contains("gt 2020-06-01T", vec![Reply::Status(400)])
            .on_contains(
                "gt 2021-06-01T",
                vec![Reply::Json(page(vec![product("p1", NAME_0615, "2021-06-15T21:35:31.024Z")], None))],
            ),
    );

    let mut search = client(&transport).search(
        &aoi(),
        vec![window((2020, 6, 1), (2020, 8, 31)), window((2021, 6, 1), (2021, 8, 31))],
    )
    .unwrap();
    match search.next() {
        Some(Err(S2Error::CatalogueQuery { status, .. })) => assert_eq!(status, Some(400)),
        other => panic!("expected CatalogueQuery error, got {:?}", other),
    }
    assert_eq!(search.next().unwrap().unwrap().id, "p1");
    assert!(search.next().is_none());
    assert_eq!(search.failed_windows(), vec![0]);
    assert_eq!(search.rejected_windows(), &[0]);
    // 4xx is not retried, now or on a second pass
    assert_eq!(search.retry_failed(), 0);
    assert!(search.next().is_none());
    assert_eq!(transport.calls_matching("gt 2020-06-01T"), 1);
}

#[test]
fn test_server_errors_are_retried() {
    let transport = Arc::new(MockTransport::new().on_contains(
        "$filter=",
        vec![
            Reply::Status(503),
            Reply::Status(429),
            Reply::Json(page(vec![product("p1", NAME_0615, "2020-06-15T21:35:31.024Z")], None)),
        ],
    ));

    let records: Vec<_> = client(&transport)
        .search(&aoi(), vec![window((2020, 6, 1), (2020, 8, 31))])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(transport.calls().len(), 3);
}

#[test]
fn test_retry_failed_requeues_window() {
    // three attempts per query, all answered 503 the first time round
    let transport = Arc::new(MockTransport::new().on_contains(
        "$filter=",
        vec![
            Reply::Status(503),
            Reply::Status(503),
            Reply::Status(503),
            Reply::Json(page(vec![product("p1", NAME_0615, "2020-06-15T21:35:31.024Z")], None)),
        ],
    ));

    let mut search = client(&transport)
        .search(&aoi(), vec![window((2020, 6, 1), (2020, 8, 31))])
        .unwrap();
    match search.next() {
        Some(Err(S2Error::CatalogueQuery { status, .. })) => assert_eq!(status, Some(503)),
        other => panic!("expected CatalogueQuery error, got {:?}", other),
    }
    assert!(search.next().is_none());
    assert_eq!(search.retry_failed(), 1);
    assert_eq!(search.next().unwrap().unwrap().id, "p1");
    assert!(search.next().is_none());
    assert!(search.failed_windows().is_empty());
}

#[test]
fn test_resume_from_continuation() {
    let transport = Arc::new(
        MockTransport::new()
            .on_contains(
                "$filter=",
                vec![Reply::Json(page(
                    vec![
                        product("p1", NAME_0615, "2020-06-15T21:35:31.024Z"),
                        product("p2", NAME_0705, "2020-07-05T21:35:29.024Z"),
                    ],
                    Some("https://cat.test/odata/v1/Products?page=2"),
                ))],
            )
            .on_exact(
                "https://cat.test/odata/v1/Products?page=2",
                vec![Reply::Json(page(vec![product("p3", NAME_0801, "2020-08-01T21:35:31.024Z")], None))],
            ),
    );
    let windows = vec![window((2020, 6, 1), (2020, 8, 31))];
    let catalogue = client(&transport);

    let mut search = catalogue.search(&aoi(), windows.clone()).unwrap();
    assert_eq!(search.next().unwrap().unwrap().id, "p1");
    assert_eq!(search.next().unwrap().unwrap().id, "p2");
    let cursor = search.continuation();
    assert_eq!(cursor.window, 0);
    assert_eq!(cursor.next_url.as_deref(), Some("https://cat.test/odata/v1/Products?page=2"));
    drop(search);

    let rest: Vec<String> = catalogue
        .resume(&aoi(), windows, cursor)
        .unwrap()
        .map(|r| r.unwrap().id)
        .collect();
    assert_eq!(rest, vec!["p3"]);
}

#[test]
fn test_max_scenes_limits_results() {
    let transport = Arc::new(MockTransport::new().on_contains(
        "$filter=",
        vec![Reply::Json(page(
            vec![
                product("p1", NAME_0615, "2020-06-15T21:35:31.024Z"),
                product("p2", NAME_0705, "2020-07-05T21:35:29.024Z"),
                product("p3", NAME_0801, "2020-08-01T21:35:31.024Z"),
            ],
            None,
        ))],
    ));
    let search = client(&transport)
        .with_max_scenes(Some(2))
        .search(&aoi(), vec![window((2020, 6, 1), (2020, 8, 31))])
        .unwrap();
    assert_eq!(search.count(), 2);
}

#[test]
fn test_end_to_end_arctic_summer_search() {
    common::init_logging();
    let dir = tempfile::tempdir().unwrap();
    let aoi_path = dir.path().join("aoi").join("latlon_aoi.geojson");
    let created = AoiBuilder::create(&BoundingBox::new(-150.0, 67.0, -148.0, 69.0), "EPSG:4326", &aoi_path).unwrap();
    let loaded = AoiBuilder::load(&aoi_path).unwrap();
    assert_eq!(created, loaded);

    let transport = Arc::new(
        MockTransport::new()
            .on_contains(
                "$filter=",
                vec![Reply::Json(page(
                    vec![
                        product("p3", NAME_0801, "2020-08-01T21:35:31.024Z"),
                        product("p1", NAME_0615, "2020-06-15T21:35:31.024Z"),
                    ],
                    Some("https://cat.test/odata/v1/Products?page=2"),
                ))],
            )
            .on_exact(
                "https://cat.test/odata/v1/Products?page=2",
                vec![Reply::Json(page(
                    vec![
                        product("p4", NAME_0801, "2020-08-20T21:35:31.024Z"),
                        product("p3", NAME_0801, "2020-08-01T21:35:31.024Z"),
                    ],
                    None,
                ))],
            ),
    );

    let records: Vec<_> = client(&transport)
        .search(&loaded, vec![window((2020, 6, 1), (2020, 8, 31))])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();

    let ids: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids.len(), records.len());
    assert_eq!(records.len(), 3);
    assert!(records
        .windows(2)
        .all(|w| w[0].acquisition_datetime <= w[1].acquisition_datetime));
    assert!(transport.calls()[0].contains("POLYGON ((-150 67"));
}

#[test]
fn test_projected_aoi_is_queried_in_lon_lat() {
    let transport = Arc::new(MockTransport::new().on_contains(
        "$filter=",
        vec![Reply::Json(page(vec![product("p1", NAME_0615, "2020-06-15T21:35:31.024Z")], None))],
    ));
    // UTM zone 5N, roughly 66.7N-67.6N and 153W-155.3W
    let utm = AreaOfInterest {
        geometry: Geometry::Polygon(vec![BoundingBox::new(400_000.0, 7_400_000.0, 500_000.0, 7_500_000.0).to_ring()]),
        crs: "EPSG:32605".to_string(),
    };

    let records: Vec<_> = client(&transport)
        .search(&utm, vec![window((2020, 6, 1), (2020, 8, 31))])
        .unwrap()
        .collect::<Result<_, _>>()
        .unwrap();
    assert_eq!(records.len(), 1);

    let query = &transport.calls()[0];
    assert!(query.contains("SRID=4326;POLYGON ((-15"), "{}", query);
    assert!(!query.contains("400000"), "{}", query);
}

#[test]
fn test_unknown_aoi_crs_fails_before_querying() {
    let transport = Arc::new(MockTransport::new());
    let bogus = AreaOfInterest { crs: "EPSG:999999".to_string(), ..aoi() };
    assert!(matches!(
        client(&transport).search(&bogus, vec![window((2020, 6, 1), (2020, 8, 31))]),
        Err(S2Error::UnknownCrs(_))
    ));
    assert!(transport.calls().is_empty());
}
