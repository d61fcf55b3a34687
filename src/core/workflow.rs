use crate::core::season::{self, SeasonWindow};
use crate::io::catalogue::{CatalogueClient, CatalogueSearch};
use crate::io::download::DownloadManager;
use crate::io::nodes::SceneNavigator;
use crate::types::{AreaOfInterest, DownloadSummary, ProductRecord, QueryWindow, S2Error, S2Result};
use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Report written next to the downloaded SAFE trees
pub const REPORT_FILE: &str = "download_report.json";

/// Parameters of one seasonal download run
#[derive(Debug, Clone)]
pub struct SeasonalRequest {
    pub aoi: AreaOfInterest,
    pub output_root: PathBuf,
    /// (year, month, day) of the first day
    pub start: (i32, u32, u32),
    /// (year, month, day) of the last day
    pub end: (i32, u32, u32),
    /// Product selection shared by every window (its dates are ignored)
    pub template: QueryWindow,
    pub include_scl: bool,
    pub max_workers: usize,
}

/// What happened to one scene
#[derive(Debug, Clone, Serialize)]
pub struct SceneReport {
    pub scene_id: String,
    pub scene_name: String,
    pub acquired: String,
    pub processing_baseline: Option<String>,
    pub window_start: Option<NaiveDate>,
    pub window_end: Option<NaiveDate>,
    pub safe_root: Option<String>,
    pub granule_dir: Option<String>,
    pub band_resolutions: BTreeMap<String, Option<u32>>,
    pub n_targets: usize,
    pub n_failures: usize,
    pub error: Option<String>,
}

/// Outcome of a seasonal run
#[derive(Debug, Clone, Default, Serialize)]
pub struct SeasonalReport {
    pub scenes: Vec<SceneReport>,
    /// Windows (as `start..end`) whose catalogue query never succeeded
    pub failed_windows: Vec<String>,
    #[serde(skip)]
    pub summary: DownloadSummary,
    pub cancelled: bool,
}

impl SeasonalReport {
    /// True when every scene and window went through
    pub fn is_clean(&self) -> bool {
        self.failed_windows.is_empty()
            && self.summary.failed == 0
            && !self.cancelled
            && self.scenes.iter().all(|s| s.error.is_none())
    }

    pub fn write_json(&self, path: &Path) -> S2Result<()> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|e| S2Error::IoWrite {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

/// Runs catalogue search, SAFE navigation and downloads for a seasonal request
pub struct SeasonalDownloader<'a> {
    catalogue: &'a CatalogueClient,
    navigator: &'a SceneNavigator,
    downloads: &'a DownloadManager,
}

impl<'a> SeasonalDownloader<'a> {
    pub fn new(catalogue: &'a CatalogueClient, navigator: &'a SceneNavigator, downloads: &'a DownloadManager) -> Self {
        Self { catalogue, navigator, downloads }
    }

    /// Expand the request's seasons into catalogue query windows
    pub fn plan_windows(request: &SeasonalRequest) -> S2Result<(Vec<SeasonWindow>, Vec<QueryWindow>)> {
        let (sy, sm, sd) = request.start;
        let (ey, em, ed) = request.end;
        let seasons = season::expand(sy, sm, sd, ey, em, ed)?;
        let windows = season::merge_windows(season::query_windows(&seasons, &request.template)?);
        Ok((seasons, windows))
    }

    /// Search the catalogue, retrying transiently failed windows once at the end.
    ///
    /// A window rejected with a client error (bad query, refused credentials)
    /// aborts the search with that error.
    pub fn find_products(
        &self,
        aoi: &AreaOfInterest,
        windows: &[QueryWindow],
    ) -> S2Result<(Vec<ProductRecord>, Vec<usize>)> {
        let mut search = self.catalogue.search(aoi, windows.to_vec())?;
        let mut products = Vec::new();
        drain(&mut search, &mut products)?;
        if search.retry_failed() > 0 {
            drain(&mut search, &mut products)?;
        }
        Ok((products, search.failed_windows()))
    }

    /// Run the full request. Per-scene and per-file failures are reported, not returned.
    pub fn run(&self, request: &SeasonalRequest) -> S2Result<SeasonalReport> {
        if request.max_workers < 1 {
            return Err(S2Error::Configuration(format!(
                "max_workers must be at least 1 (got {})",
                request.max_workers
            )));
        }
        let (seasons, windows) = Self::plan_windows(request)?;
        log::info!(
            "🛰️  Seasonal download: {} year(s), {} query window(s), product type {}",
            seasons.len(),
            windows.len(),
            request.template.product_type
        );

        let (products, failed) = self.find_products(&request.aoi, &windows)?;
        log::info!("Total products fetched: {}", products.len());
        if products.is_empty() {
            log::warn!("No products found for the given AOI and date windows");
        }

        let mut report = SeasonalReport {
            failed_windows: failed
                .iter()
                .map(|&i| format!("{}..{}", windows[i].start, windows[i].end))
                .collect(),
            ..Default::default()
        };

        let bands: Vec<String> = request.template.bands.iter().cloned().collect();
        let cancel = self.downloads.cancel_flag();
        for product in &products {
            if cancel.is_cancelled() {
                log::warn!("Cancelled; {} scene(s) not started", products.len() - report.scenes.len());
                report.cancelled = true;
                break;
            }
            let scene = self.process_scene(product, &windows, &bands, request, &mut report.summary)?;
            report.scenes.push(scene);
        }
        if report.summary.cancelled > 0 {
            report.cancelled = true;
        }

        fs::create_dir_all(&request.output_root)?;
        report.write_json(&request.output_root.join(REPORT_FILE))?;
        log::info!(
            "Finished seasonal download: {} scene(s) processed, {} file(s) downloaded, {} skipped, {} failed",
            report.scenes.len(),
            report.summary.succeeded,
            report.summary.skipped,
            report.summary.failed
        );
        Ok(report)
    }

    fn process_scene(
        &self,
        product: &ProductRecord,
        windows: &[QueryWindow],
        bands: &[String],
        request: &SeasonalRequest,
        summary: &mut DownloadSummary,
    ) -> S2Result<SceneReport> {
        let acquired = product.acquisition_datetime.date_naive();
        let window = windows.iter().find(|w| w.start <= acquired && acquired <= w.end);
        let mut scene = SceneReport {
            scene_id: product.id.clone(),
            scene_name: product.name.clone(),
            acquired: product.acquisition_datetime.to_rfc3339(),
            processing_baseline: product.processing_baseline.clone(),
            window_start: window.map(|w| w.start),
            window_end: window.map(|w| w.end),
            safe_root: None,
            granule_dir: None,
            band_resolutions: BTreeMap::new(),
            n_targets: 0,
            n_failures: 0,
            error: None,
        };

        let targets = match self.navigator.select_targets(
            &product.id,
            &product.name,
            bands,
            request.template.target_resolution_m,
            request.include_scl,
        ) {
            Ok(targets) => targets,
            Err(e) => {
                log::warn!("Scene {} ({}): target selection failed: {}", product.name, product.id, e);
                scene.error = Some(e.to_string());
                return Ok(scene);
            }
        };

        let tasks = self.navigator.plan_tasks(&targets, &request.output_root);
        scene.safe_root = Some(targets.safe_root.clone());
        scene.granule_dir = targets.granule_dir.clone();
        scene.band_resolutions = targets.band_resolutions.clone();
        scene.n_targets = tasks.len();

        // Configuration errors here abort the whole run
        let result = self.downloads.download(tasks, request.max_workers)?;
        scene.n_failures = result.failed;
        if result.failed > 0 {
            log::warn!(
                "Scene {} ({}): {} target(s) failed to download",
                product.name,
                product.id,
                result.failed
            );
        }
        summary.merge(result);
        Ok(scene)
    }
}

fn drain(search: &mut CatalogueSearch, products: &mut Vec<ProductRecord>) -> S2Result<()> {
    for item in search.by_ref() {
        match item {
            Ok(record) => products.push(record),
            Err(e) if e.is_client_error() => {
                log::error!("❌ Catalogue rejected the query: {}", e);
                return Err(e);
            }
            Err(e) => log::warn!("⚠️  Catalogue window failed: {}", e),
        }
    }
    Ok(())
}
