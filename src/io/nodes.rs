use crate::core::retry::RetryPolicy;
use crate::io::session::HttpTransport;
use crate::types::{DownloadTask, S2Error, S2Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

/// Resolutions (metres) Sentinel-2 L2A products are published at
pub const S2_RESOLUTIONS: [u32; 3] = [10, 20, 60];

/// One child entry of a node listing
#[derive(Debug, Clone, PartialEq)]
pub struct NodeEntry {
    pub name: String,
    pub content_length: Option<u64>,
}

/// One file inside the SAFE tree selected for download
#[derive(Debug, Clone, PartialEq)]
pub struct NodeTarget {
    /// Band id, or the metadata file stem (`MTD_TL`, `MTD_MSIL2A`)
    pub band: String,
    pub segments: Vec<String>,
    pub size: Option<u64>,
}

/// Files selected for one scene
#[derive(Debug, Clone, PartialEq)]
pub struct SceneTargets {
    pub scene_id: String,
    pub safe_root: String,
    pub granule_dir: Option<String>,
    pub targets: Vec<NodeTarget>,
    /// Chosen resolution per requested band, `None` when the band was not found
    pub band_resolutions: BTreeMap<String, Option<u32>>,
}

fn encode_segment(segment: &str) -> String {
    let mut out = String::with_capacity(segment.len());
    for b in segment.bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'~') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02X}", b));
        }
    }
    out
}

/// URL of a node inside a scene: its child listing, or its content (`$value`)
pub fn scene_node_url(download_url: &str, scene_id: &str, segments: &[&str], list_children: bool) -> String {
    let mut url = format!("{}/odata/v1/Products({})", download_url.trim_end_matches('/'), scene_id);
    for seg in segments {
        url.push_str(&format!("/Nodes({})", encode_segment(seg)));
    }
    url.push_str(if list_children { "/Nodes" } else { "/$value" });
    url
}

/// MGRS tile id (e.g. `T10VFU`) embedded in a scene name
pub fn extract_tile(scene_name: &str) -> Option<String> {
    scene_name
        .split('_')
        .find(|part| part.starts_with('T') && part.len() == 6)
        .map(str::to_string)
}

/// Pick the resolution to download for a target.
///
/// An exact match wins; otherwise the coarsest resolution finer than the
/// target; otherwise the finest available.
pub fn choose_best_resolution(target_res: u32, available: &[u32]) -> Option<u32> {
    let mut avail: Vec<u32> = available.to_vec();
    avail.sort_unstable();
    avail.dedup();
    if avail.is_empty() {
        return None;
    }
    if avail.contains(&target_res) {
        return Some(target_res);
    }
    avail
        .iter()
        .copied()
        .filter(|&r| r <= target_res)
        .max()
        .or_else(|| avail.first().copied())
}

/// Walks SAFE trees for scenes found in the catalogue
pub struct SceneNavigator {
    transport: Arc<dyn HttpTransport>,
    download_url: String,
    retry: RetryPolicy,
}

impl SceneNavigator {
    pub fn new(transport: Arc<dyn HttpTransport>, download_url: impl Into<String>, retry: RetryPolicy) -> Self {
        Self {
            transport,
            download_url: download_url.into(),
            retry,
        }
    }

    pub fn node_url(&self, scene_id: &str, segments: &[&str], list_children: bool) -> String {
        scene_node_url(&self.download_url, scene_id, segments, list_children)
    }

    /// Child nodes below `segments` within a scene
    pub fn list_children(&self, scene_id: &str, segments: &[&str]) -> S2Result<Vec<NodeEntry>> {
        let url = self.node_url(scene_id, segments, true);
        let body = self
            .retry
            .run("node listing", |_| self.transport.get_json(&url), S2Error::is_transient)?;
        let entries = body
            .get("result")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| {
                        let name = item.get("Name").and_then(Value::as_str)?;
                        Some(NodeEntry {
                            name: name.to_string(),
                            content_length: item.get("ContentLength").and_then(Value::as_u64),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();
        Ok(entries)
    }

    /// Name of the `<scene>.SAFE` root directory
    pub fn find_safe_root(&self, scene_id: &str) -> S2Result<String> {
        let children = self.list_children(scene_id, &[])?;
        if children.is_empty() {
            return Err(S2Error::DownloadTask {
                product_id: scene_id.to_string(),
                band: "SAFE".to_string(),
                cause: "no child nodes; is the scene id correct and the product online?".to_string(),
            });
        }
        Ok(children
            .iter()
            .find(|c| c.name.ends_with(".SAFE"))
            .unwrap_or(&children[0])
            .name
            .clone())
    }

    /// Granule directory under `SAFE/GRANULE`, preferring one for `tile`
    pub fn find_granule_dir(&self, scene_id: &str, safe_root: &str, tile: Option<&str>) -> S2Result<Option<String>> {
        let root_children = self.list_children(scene_id, &[safe_root])?;
        if !root_children.iter().any(|c| c.name == "GRANULE") {
            return Ok(None);
        }
        let granules = self.list_children(scene_id, &[safe_root, "GRANULE"])?;
        let is_granule = |name: &str| name.starts_with("L2A_") || name.starts_with("L1C_");

        if let Some(tile) = tile {
            if let Some(g) = granules.iter().find(|g| is_granule(&g.name) && g.name.contains(tile)) {
                return Ok(Some(g.name.clone()));
            }
        }
        Ok(granules
            .iter()
            .find(|g| is_granule(&g.name))
            .or_else(|| granules.first())
            .map(|g| g.name.clone()))
    }

    /// Choose band files (and metadata) to fetch for one scene
    pub fn select_targets(
        &self,
        scene_id: &str,
        scene_name: &str,
        bands: &[String],
        target_res_m: u32,
        include_scl: bool,
    ) -> S2Result<SceneTargets> {
        let safe_root = self.find_safe_root(scene_id)?;
        let tile = extract_tile(scene_name);
        let granule_dir = self.find_granule_dir(scene_id, &safe_root, tile.as_deref())?;

        let mut targets = Vec::new();
        let mut band_resolutions = BTreeMap::new();

        if let Some(granule) = &granule_dir {
            let mut nodes_by_res: BTreeMap<u32, Vec<NodeEntry>> = BTreeMap::new();
            for res in S2_RESOLUTIONS {
                let res_dir = format!("R{}m", res);
                let listing = self
                    .list_children(scene_id, &[safe_root.as_str(), "GRANULE", granule.as_str(), "IMG_DATA", res_dir.as_str()])
                    .unwrap_or_else(|e| {
                        log::debug!("No {} listing for {}: {}", res_dir, scene_id, e);
                        Vec::new()
                    });
                nodes_by_res.insert(res, listing);
            }

            let mut wanted: Vec<String> = bands.to_vec();
            if include_scl && !wanted.iter().any(|b| b == "SCL") {
                wanted.push("SCL".to_string());
            }
            for band in &wanted {
                let chosen = select_band_file(band, target_res_m, &nodes_by_res, &safe_root, granule, &mut targets);
                if chosen.is_none() {
                    log::warn!("Band {} not found in scene {}", band, scene_name);
                }
                band_resolutions.insert(band.clone(), chosen);
            }

            match self.list_children(scene_id, &[safe_root.as_str(), "GRANULE", granule.as_str()]) {
                Ok(children) => {
                    if let Some(mtd) = children.iter().find(|c| c.name == "MTD_TL.xml") {
                        targets.push(NodeTarget {
                            band: "MTD_TL".to_string(),
                            segments: vec![safe_root.clone(), "GRANULE".into(), granule.clone(), mtd.name.clone()],
                            size: mtd.content_length,
                        });
                    }
                }
                Err(e) => log::debug!("No granule listing for {}: {}", scene_id, e),
            }
        }

        let scene_mtd = if safe_root.contains("MSIL1C") { "MTD_MSIL1C.xml" } else { "MTD_MSIL2A.xml" };
        targets.push(NodeTarget {
            band: scene_mtd.trim_end_matches(".xml").to_string(),
            segments: vec![safe_root.clone(), scene_mtd.to_string()],
            size: None,
        });

        log::info!("Scene {} ({}): selected {} target(s)", scene_name, scene_id, targets.len());
        Ok(SceneTargets {
            scene_id: scene_id.to_string(),
            safe_root,
            granule_dir,
            targets,
            band_resolutions,
        })
    }

    /// Turn selected targets into download tasks rooted at `output_root`
    pub fn plan_tasks(&self, scene: &SceneTargets, output_root: &Path) -> Vec<DownloadTask> {
        scene
            .targets
            .iter()
            .map(|t| {
                let segs: Vec<&str> = t.segments.iter().map(String::as_str).collect();
                let destination = t.segments.iter().fold(output_root.to_path_buf(), |p, s| p.join(s));
                let task = DownloadTask::new(
                    scene.scene_id.clone(),
                    t.band.clone(),
                    self.node_url(&scene.scene_id, &segs, false),
                    destination,
                );
                match t.size {
                    Some(size) => task.with_expected_size(size),
                    None => task,
                }
            })
            .collect()
    }
}

/// Find `band` at the best available resolution and append it to `targets`
fn select_band_file(
    band: &str,
    target_res_m: u32,
    nodes_by_res: &BTreeMap<u32, Vec<NodeEntry>>,
    safe_root: &str,
    granule: &str,
    targets: &mut Vec<NodeTarget>,
) -> Option<u32> {
    let available: Vec<u32> = nodes_by_res
        .iter()
        .filter(|(res, nodes)| {
            let suffix = format!("_{}_{}m.jp2", band, res);
            nodes.iter().any(|n| n.name.ends_with(&suffix))
        })
        .map(|(res, _)| *res)
        .collect();

    let chosen = choose_best_resolution(target_res_m, &available)?;
    let suffix = format!("_{}_{}m.jp2", band, chosen);
    let hit = nodes_by_res.get(&chosen)?.iter().find(|n| n.name.ends_with(&suffix))?;
    targets.push(NodeTarget {
        band: band.to_string(),
        segments: vec![
            safe_root.to_string(),
            "GRANULE".to_string(),
            granule.to_string(),
            "IMG_DATA".to_string(),
            format!("R{}m", chosen),
            hit.name.clone(),
        ],
        size: hit.content_length,
    });
    Some(chosen)
}
