use crate::config::PipelineConfig;
use crate::core::retry::RetryPolicy;
use crate::io::aoi::AoiBuilder;
use crate::io::session::HttpTransport;
use crate::types::{AreaOfInterest, ProductRecord, QueryWindow, S2Error, S2Result};
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, OnceLock};

const L2A_BANDS: [&str; 16] = [
    "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B11", "B12", "SCL",
    "AOT", "WVP", "TCI",
];
const L1C_BANDS: [&str; 14] = [
    "B01", "B02", "B03", "B04", "B05", "B06", "B07", "B08", "B8A", "B09", "B10", "B11", "B12",
    "TCI",
];

fn baseline_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"_N(\d{2})(\d{2})_").expect("static regex"))
}

/// Processing baseline (`05.09`) from a product or SAFE name (`..._N0509_...`)
pub fn baseline_from_name(name: &str) -> Option<String> {
    baseline_regex()
        .captures(name)
        .map(|c| format!("{}.{}", &c[1], &c[2]))
}

/// Band files a product type ships with
pub fn bands_for_product_type(product_type: &str) -> Vec<String> {
    let bands: &[&str] = match product_type {
        "S2MSI1C" => &L1C_BANDS,
        _ => &L2A_BANDS,
    };
    bands.iter().map(|b| b.to_string()).collect()
}

/// Build the first-page query URL for one window
pub fn build_search_url(catalogue_url: &str, aoi_wkt: &str, window: &QueryWindow, page_size: usize) -> String {
    let filter = format!(
        "Collection/Name eq '{}' \
         and Attributes/OData.CSC.StringAttribute/any(att:att/Name eq 'productType' \
         and att/OData.CSC.StringAttribute/Value eq '{}') \
         and OData.CSC.Intersects(area=geography'SRID=4326;{}') \
         and ContentDate/Start gt {} and ContentDate/Start lt {}",
        window.collection_name,
        window.product_type,
        aoi_wkt,
        window.start_iso(),
        window.end_iso()
    );
    format!(
        "{}/Products?$filter={}&$orderby=ContentDate/Start asc&$top={}&$expand=Attributes",
        catalogue_url.trim_end_matches('/'),
        filter,
        page_size
    )
}

/// Strip the `geography'SRID=4326;...'` wrapper from an OData footprint
fn footprint_wkt(raw: &str) -> String {
    let inner = raw
        .strip_prefix("geography'")
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(raw);
    match inner.split_once(';') {
        Some((srid, wkt)) if srid.starts_with("SRID=") => wkt.to_string(),
        _ => inner.to_string(),
    }
}

fn attribute_baseline(item: &Value) -> Option<String> {
    item.get("Attributes")?
        .as_array()?
        .iter()
        .find(|a| a.get("Name").and_then(Value::as_str) == Some("processingBaseline"))
        .and_then(|a| a.get("Value"))
        .and_then(|v| match v {
            Value::Number(n) => n.as_f64().map(|f| format!("{:05.2}", f)),
            Value::String(s) => Some(s.clone()),
            _ => None,
        })
}

/// Decode one entry of an OData `value` array
pub fn parse_product(item: &Value, product_type: &str) -> S2Result<ProductRecord> {
    let field = |name: &str| -> S2Result<&str> {
        item.get(name).and_then(Value::as_str).ok_or_else(|| S2Error::CatalogueQuery {
            status: None,
            message: format!("catalogue entry missing '{}'", name),
        })
    };

    let id = field("Id")?.to_string();
    let name = field("Name")?.to_string();
    let start = item
        .get("ContentDate")
        .and_then(|c| c.get("Start"))
        .and_then(Value::as_str)
        .ok_or_else(|| S2Error::CatalogueQuery {
            status: None,
            message: format!("catalogue entry {} missing ContentDate/Start", id),
        })?;
    let acquisition_datetime = DateTime::parse_from_rfc3339(start)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| S2Error::CatalogueQuery {
            status: None,
            message: format!("bad acquisition time '{}' for {}: {}", start, id, e),
        })?;

    Ok(ProductRecord {
        processing_baseline: baseline_from_name(&name).or_else(|| attribute_baseline(item)),
        footprint: item.get("Footprint").and_then(Value::as_str).map(footprint_wkt),
        content_length: item.get("ContentLength").and_then(Value::as_u64),
        available_bands: bands_for_product_type(product_type),
        id,
        name,
        acquisition_datetime,
    })
}

/// Position in a search from which it can be resumed
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SearchCursor {
    /// Index of the window being (or next to be) queried
    pub window: usize,
    /// Page to fetch next within that window; `None` starts the window from its first page
    pub next_url: Option<String>,
    /// Ids already yielded, so a resumed search does not repeat them
    pub seen_ids: Vec<String>,
}

/// Queries the catalogue, one window at a time
#[derive(Clone)]
pub struct CatalogueClient {
    transport: Arc<dyn HttpTransport>,
    catalogue_url: String,
    page_size: usize,
    retry: RetryPolicy,
    max_scenes: Option<usize>,
}

impl CatalogueClient {
    pub fn new(transport: Arc<dyn HttpTransport>, config: &PipelineConfig) -> Self {
        Self {
            transport,
            catalogue_url: config.catalogue_url().to_string(),
            page_size: config.page_size,
            retry: config.catalogue_retry,
            max_scenes: None,
        }
    }

    /// Stop after this many distinct products
    pub fn with_max_scenes(mut self, max_scenes: Option<usize>) -> Self {
        self.max_scenes = max_scenes;
        self
    }

    /// Lazily search every window; records are deduplicated by id.
    ///
    /// The AOI is reprojected to EPSG:4326 first, the only frame the
    /// catalogue's `Intersects` filter accepts.
    pub fn search(&self, aoi: &AreaOfInterest, windows: Vec<QueryWindow>) -> S2Result<CatalogueSearch> {
        self.resume(aoi, windows, SearchCursor::default())
    }

    /// Continue a search from a cursor taken with [`CatalogueSearch::continuation`]
    pub fn resume(
        &self,
        aoi: &AreaOfInterest,
        windows: Vec<QueryWindow>,
        cursor: SearchCursor,
    ) -> S2Result<CatalogueSearch> {
        let aoi_wkt = AoiBuilder::to_wgs84(aoi)?.to_wkt();
        let mut queue: VecDeque<usize> = (cursor.window..windows.len()).collect();
        let current = match cursor.next_url {
            Some(url) if cursor.window < windows.len() => {
                queue.pop_front();
                Some((cursor.window, Some(url)))
            }
            _ => None,
        };
        log::info!(
            "Searching catalogue over {} window(s) starting at window {}",
            windows.len(),
            cursor.window
        );
        Ok(CatalogueSearch {
            client: self.clone(),
            aoi_wkt,
            windows,
            queue,
            current,
            buffer: VecDeque::new(),
            seen: cursor.seen_ids.into_iter().collect(),
            failed: Vec::new(),
            rejected: Vec::new(),
            yielded: 0,
        })
    }

    fn fetch_page(&self, url: &str) -> S2Result<Value> {
        self.retry
            .run("catalogue query", |_| self.transport.get_json(url), S2Error::is_transient)
            .map_err(|e| match e {
                S2Error::Http { status, message, .. } => S2Error::CatalogueQuery { status, message },
                S2Error::CatalogueQuery { .. } => e,
                other => S2Error::CatalogueQuery { status: None, message: other.to_string() },
            })
    }
}

/// Lazy, finite sequence of products for a set of windows.
///
/// A failed window yields one `Err` and is remembered; the search moves on to
/// the next window. [`CatalogueSearch::retry_failed`] queues windows that
/// failed transiently again from their first page. Windows the catalogue
/// rejected with a client error are never re-queued.
pub struct CatalogueSearch {
    client: CatalogueClient,
    aoi_wkt: String,
    windows: Vec<QueryWindow>,
    queue: VecDeque<usize>,
    /// Window in progress and the next page URL (None once its last page is fetched)
    current: Option<(usize, Option<String>)>,
    buffer: VecDeque<ProductRecord>,
    seen: HashSet<String>,
    failed: Vec<usize>,
    rejected: Vec<usize>,
    yielded: usize,
}

impl CatalogueSearch {
    /// Indices of windows whose query failed, for any reason
    pub fn failed_windows(&self) -> Vec<usize> {
        let mut all: Vec<usize> = self.failed.iter().chain(&self.rejected).copied().collect();
        all.sort_unstable();
        all
    }

    /// Windows rejected with a 4xx status; retrying them cannot help
    pub fn rejected_windows(&self) -> &[usize] {
        &self.rejected
    }

    /// Re-queue transiently failed windows; returns how many were queued
    pub fn retry_failed(&mut self) -> usize {
        let failed = std::mem::take(&mut self.failed);
        for &w in failed.iter().rev() {
            self.queue.push_front(w);
        }
        if !failed.is_empty() {
            log::info!("Re-issuing {} failed catalogue window(s)", failed.len());
        }
        failed.len()
    }

    /// Where to resume if this search is abandoned now.
    ///
    /// Records already buffered but not yet yielded are re-fetched on resume.
    pub fn continuation(&self) -> SearchCursor {
        let seen_ids = self.seen.iter().cloned().collect();
        match &self.current {
            Some((window, next_url)) if self.buffer.is_empty() => SearchCursor {
                window: *window,
                next_url: next_url.clone(),
                seen_ids,
            },
            Some((window, _)) => SearchCursor { window: *window, next_url: None, seen_ids },
            None => SearchCursor {
                window: self.queue.front().copied().unwrap_or(self.windows.len()),
                next_url: None,
                seen_ids,
            },
        }
    }

    /// Number of distinct products yielded so far
    pub fn yielded(&self) -> usize {
        self.yielded
    }

    fn limit_reached(&self) -> bool {
        self.client.max_scenes.map(|m| self.yielded >= m).unwrap_or(false)
    }
}

impl Iterator for CatalogueSearch {
    type Item = S2Result<ProductRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if self.limit_reached() {
                return None;
            }

            if let Some(record) = self.buffer.pop_front() {
                if self.seen.insert(record.id.clone()) {
                    self.yielded += 1;
                    return Some(Ok(record));
                }
                log::debug!("Skipping duplicate product {}", record.id);
                continue;
            }

            let (window_idx, next_url) = match self.current.take() {
                Some(state) => state,
                None => {
                    let idx = self.queue.pop_front()?;
                    let url = build_search_url(
                        &self.client.catalogue_url,
                        &self.aoi_wkt,
                        &self.windows[idx],
                        self.client.page_size,
                    );
                    let w = &self.windows[idx];
                    log::info!("Querying catalogue window {} ({} .. {})", idx, w.start, w.end);
                    (idx, Some(url))
                }
            };

            let Some(url) = next_url else {
                // window exhausted
                continue;
            };

            let page = match self.client.fetch_page(&url) {
                Ok(page) => page,
                Err(e) => {
                    log::warn!("Catalogue window {} failed: {}", window_idx, e);
                    if e.is_client_error() {
                        self.rejected.push(window_idx);
                    } else {
                        self.failed.push(window_idx);
                    }
                    return Some(Err(e));
                }
            };

            let product_type = self.windows[window_idx].product_type.clone();
            let items = page.get("value").and_then(Value::as_array).cloned().unwrap_or_default();
            let mut records = Vec::with_capacity(items.len());
            for item in &items {
                match parse_product(item, &product_type) {
                    Ok(record) => records.push(record),
                    Err(e) => log::warn!("Skipping malformed catalogue entry: {}", e),
                }
            }
            records.sort_by(|a, b| a.acquisition_datetime.cmp(&b.acquisition_datetime));
            if records.is_empty() {
                log::debug!("Catalogue window {} page returned no products", window_idx);
            }
            self.buffer.extend(records);

            let next = page
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
            self.current = Some((window_idx, next));
        }
    }
}
