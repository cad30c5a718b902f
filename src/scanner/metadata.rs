//! Metadata extraction coordinator.
//!
//! Dispatches files to the tag tool and the container probe, then folds
//! their answers into one quality-tagged [`Extraction`]. The raw payload
//! is what the metadata cache stores; every derived field can be rebuilt
//! from it with [`Extraction::from_payload`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::kinds::FileKind;
use super::tools::{
    ExifTool, FallbackTool, FfprobeTool, MetadataTool, NativeExifReader, ToolFailureKind, ToolMap, ToolResult,
};
use super::workflow;
use crate::config::ToolsConfig;
use crate::error::Result;

/// How completely extraction succeeded. Ordered: a stored tier is only
/// replaced by one that ranks at or above it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    #[default]
    None,
    Degraded,
    Partial,
    Full,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::None => "none",
            Quality::Degraded => "degraded",
            Quality::Partial => "partial",
            Quality::Full => "full",
        }
    }

    pub fn parse(value: &str) -> Self {
        match value {
            "degraded" => Quality::Degraded,
            "partial" => Quality::Partial,
            "full" => Quality::Full,
            _ => Quality::None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Extraction {
    pub quality: Quality,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub duration: Option<f64>,
    pub has_workflow: bool,
    pub has_generation_data: bool,
    pub rating: Option<u8>,
    pub tags: Vec<String>,
    pub raw: Value,
}

impl Extraction {
    /// No extraction attempted.
    pub fn none() -> Self {
        Self::from_raw(Quality::None, json!({}))
    }

    /// Derive every field from a raw payload.
    pub fn from_raw(quality: Quality, raw: Value) -> Self {
        let tag_map = raw.get("tags").and_then(Value::as_object);
        let probe = raw.get("probe");

        let (width, height) = resolve_dimensions(&raw);
        let duration = resolve_duration(&raw);

        let mut flags = workflow::WorkflowFlags::default();
        if let Some(tags) = tag_map {
            flags = workflow::inspect(tags);
        }
        if let Some(format_tags) = probe
            .and_then(|p| p.get("format"))
            .and_then(|f| f.get("tags"))
            .and_then(Value::as_object)
        {
            let probe_flags = workflow::inspect(format_tags);
            flags.has_workflow |= probe_flags.has_workflow;
            flags.has_generation_data |= probe_flags.has_generation_data;
        }

        Self {
            quality,
            width,
            height,
            duration,
            has_workflow: flags.has_workflow,
            has_generation_data: flags.has_generation_data,
            rating: tag_map.and_then(rating_from_tags),
            tags: tag_map.map(keywords_from_tags).unwrap_or_default(),
            raw,
        }
    }

    /// Rebuild from a cached payload. The tier travels inside the payload.
    pub fn from_payload(payload: &str) -> Result<Self> {
        let raw: Value = serde_json::from_str(payload)?;
        let quality = raw
            .get("quality")
            .and_then(Value::as_str)
            .map(Quality::parse)
            .unwrap_or_default();
        Ok(Self::from_raw(quality, raw))
    }

    pub fn raw_json(&self) -> String {
        self.raw.to_string()
    }

    /// Worth caching and worth protecting from a cache-miss rescan.
    pub fn is_rich(&self) -> bool {
        self.quality >= Quality::Partial
    }
}

fn as_u32(value: &Value) -> Option<u32> {
    let number = match value {
        Value::Number(n) => n.as_u64().or_else(|| n.as_f64().map(|f| f as u64)),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    number.filter(|&v| v > 0 && v <= u32::MAX as u64).map(|v| v as u32)
}

fn as_f64(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    number.filter(|v| v.is_finite() && *v >= 0.0)
}

fn pair(width: Option<&Value>, height: Option<&Value>) -> Option<(u32, u32)> {
    Some((as_u32(width?)?, as_u32(height?)?))
}

/// "640x480", "640 480" or `[640, 480]`.
fn parse_resolution(value: &Value) -> Option<(u32, u32)> {
    match value {
        Value::String(s) => {
            let mut parts = s.split(|c: char| c == 'x' || c == 'X' || c.is_whitespace()).filter(|p| !p.is_empty());
            let w = parts.next()?.parse().ok()?;
            let h = parts.next()?.parse().ok()?;
            (w > 0 && h > 0).then_some((w, h))
        }
        Value::Array(items) if items.len() >= 2 => pair(items.first(), items.get(1)),
        _ => None,
    }
}

fn probe_streams(raw: &Value) -> impl Iterator<Item = &Value> {
    raw.get("probe")
        .and_then(|p| p.get("streams"))
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
}

/// First source that yields both values wins: explicit fields, resolution
/// tuple, probe stream, tag-tool fields.
pub fn resolve_dimensions(raw: &Value) -> (Option<u32>, Option<u32>) {
    let tags = raw.get("tags");
    let tag = |key: &str| tags.and_then(|t| t.get(key));

    let resolved = pair(raw.get("width"), raw.get("height"))
        .or_else(|| raw.get("resolution").and_then(parse_resolution))
        .or_else(|| tag("ImageSize").and_then(parse_resolution))
        .or_else(|| probe_streams(raw).find_map(|s| pair(s.get("width"), s.get("height"))))
        .or_else(|| pair(tag("ImageWidth"), tag("ImageHeight")))
        .or_else(|| pair(tag("ExifImageWidth"), tag("ExifImageHeight")))
        .or_else(|| pair(tag("PixelXDimension"), tag("PixelYDimension")));

    match resolved {
        Some((w, h)) => (Some(w), Some(h)),
        None => (None, None),
    }
}

pub fn resolve_duration(raw: &Value) -> Option<f64> {
    raw.get("duration")
        .and_then(as_f64)
        .or_else(|| {
            raw.get("probe")
                .and_then(|p| p.get("format"))
                .and_then(|f| f.get("duration"))
                .and_then(as_f64)
        })
        .or_else(|| probe_streams(raw).find_map(|s| s.get("duration").and_then(as_f64)))
        .or_else(|| raw.get("tags").and_then(|t| t.get("Duration")).and_then(as_f64))
}

fn rating_from_tags(tags: &Map<String, Value>) -> Option<u8> {
    let rating = tags.get("Rating").and_then(as_f64)?;
    (0.0..=5.0).contains(&rating).then_some(rating.round() as u8)
}

fn keywords_from_tags(tags: &Map<String, Value>) -> Vec<String> {
    let mut out = Vec::new();
    for key in ["Keywords", "Subject"] {
        match tags.get(key) {
            Some(Value::Array(items)) => {
                out.extend(items.iter().filter_map(|v| match v {
                    Value::String(s) => Some(s.trim().to_string()),
                    Value::Number(n) => Some(n.to_string()),
                    _ => None,
                }));
            }
            Some(Value::String(s)) => out.extend(s.split(',').map(|t| t.trim().to_string())),
            _ => {}
        }
    }
    let mut unique: Vec<String> = Vec::with_capacity(out.len());
    for tag in out {
        if !tag.is_empty() && !unique.contains(&tag) {
            unique.push(tag);
        }
    }
    unique
}

fn usable(result: &ToolResult) -> Option<&ToolMap> {
    match result {
        Ok(map) if !map.is_empty() => Some(map),
        _ => None,
    }
}

fn error_entry(tool: &str, result: &ToolResult) -> Option<Value> {
    match result {
        Ok(map) if map.is_empty() => Some(json!({"tool": tool, "kind": "empty", "message": "no fields returned"})),
        Ok(_) => None,
        Err(f) => Some(json!({"tool": tool, "kind": f.kind.as_str(), "message": f.message})),
    }
}

fn unreadable(result: &ToolResult) -> bool {
    matches!(result, Err(f) if f.kind == ToolFailureKind::Unreadable)
}

/// Fold tool answers into one extraction. `None` means the tool does not
/// apply to the file's kind.
///
/// Full when every applicable tool returned data that agrees; Partial when
/// only some did, or they disagree on dimensions; Degraded when tools ran
/// and all failed; None when nothing applied or the file was unreadable.
pub fn normalize(tag: Option<&ToolResult>, probe: Option<&ToolResult>) -> Extraction {
    let applicable: Vec<(&str, &ToolResult)> = [("tags", tag), ("probe", probe)]
        .into_iter()
        .filter_map(|(name, r)| r.map(|r| (name, r)))
        .collect();

    if applicable.is_empty() {
        return Extraction::none();
    }

    let mut raw = Map::new();
    let mut errors = Vec::new();
    let mut succeeded = 0;
    for (name, result) in &applicable {
        if let Some(map) = usable(result) {
            raw.insert((*name).to_string(), Value::Object(map.clone()));
            succeeded += 1;
        }
        if let Some(entry) = error_entry(name, result) {
            errors.push(entry);
        }
    }

    let quality = if succeeded == 0 {
        if applicable.iter().all(|(_, r)| unreadable(r)) {
            Quality::None
        } else {
            Quality::Degraded
        }
    } else if succeeded < applicable.len() || !sources_agree(&raw) {
        Quality::Partial
    } else {
        Quality::Full
    };

    if !errors.is_empty() {
        raw.insert("errors".to_string(), Value::Array(errors));
    }
    raw.insert("quality".to_string(), Value::String(quality.as_str().to_string()));
    Extraction::from_raw(quality, Value::Object(raw))
}

/// Tag and probe dimensions, when both are present, must match.
fn sources_agree(raw: &Map<String, Value>) -> bool {
    let (Some(tags), Some(probe)) = (raw.get("tags"), raw.get("probe")) else {
        return true;
    };
    let tag_dims = pair(tags.get("ImageWidth"), tags.get("ImageHeight"));
    let probe_dims = probe
        .get("streams")
        .and_then(Value::as_array)
        .and_then(|streams| streams.iter().find_map(|s| pair(s.get("width"), s.get("height"))));
    match (tag_dims, probe_dims) {
        (Some(t), Some(p)) => t == p,
        _ => true,
    }
}

/// Routes files to the configured tools and normalizes the answers.
pub struct MetadataExtractor {
    tag_tool: Option<Arc<dyn MetadataTool>>,
    probe_tool: Option<Arc<dyn MetadataTool>>,
}

impl MetadataExtractor {
    pub fn new(tag_tool: Option<Arc<dyn MetadataTool>>, probe_tool: Option<Arc<dyn MetadataTool>>) -> Self {
        Self { tag_tool, probe_tool }
    }

    pub fn from_config(config: &ToolsConfig) -> Self {
        let exiftool: Arc<dyn MetadataTool> = Arc::new(ExifTool::new(config));
        let tag_tool: Arc<dyn MetadataTool> = if config.native_exif_fallback {
            Arc::new(FallbackTool::new(exiftool, Arc::new(NativeExifReader)))
        } else {
            exiftool
        };
        Self::new(Some(tag_tool), Some(Arc::new(FfprobeTool::new(config))))
    }

    fn applicable(tool: &Option<Arc<dyn MetadataTool>>, kind: FileKind) -> Option<&Arc<dyn MetadataTool>> {
        tool.as_ref().filter(|t| t.supports(kind))
    }

    pub fn extract(&self, path: &Path, kind: FileKind) -> Extraction {
        let tag = Self::applicable(&self.tag_tool, kind).map(|t| t.read(path, None));
        let probe = Self::applicable(&self.probe_tool, kind).map(|t| t.read(path, None));
        normalize(tag.as_ref(), probe.as_ref())
    }

    /// Extract many files, batching calls per tool.
    pub fn extract_batch(&self, items: &[(PathBuf, FileKind)]) -> HashMap<PathBuf, Extraction> {
        let batch_for = |tool: &Option<Arc<dyn MetadataTool>>| -> HashMap<PathBuf, ToolResult> {
            let Some(tool) = tool else {
                return HashMap::new();
            };
            let paths: Vec<PathBuf> = items
                .iter()
                .filter(|(_, kind)| tool.supports(*kind))
                .map(|(path, _)| path.clone())
                .collect();
            if paths.is_empty() {
                HashMap::new()
            } else {
                tool.read_batch(&paths, None)
            }
        };

        let tags = batch_for(&self.tag_tool);
        let probes = batch_for(&self.probe_tool);

        items
            .iter()
            .map(|(path, kind)| {
                let tag = Self::applicable(&self.tag_tool, *kind).and_then(|_| tags.get(path));
                let probe = Self::applicable(&self.probe_tool, *kind).and_then(|_| probes.get(path));
                (path.clone(), normalize(tag, probe))
            })
            .collect()
    }

    /// [`Self::extract_batch`] on the blocking pool.
    pub async fn extract_batch_blocking(
        self: &Arc<Self>,
        items: Vec<(PathBuf, FileKind)>,
    ) -> Result<HashMap<PathBuf, Extraction>> {
        let extractor = Arc::clone(self);
        Ok(tokio::task::spawn_blocking(move || extractor.extract_batch(&items)).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::tools::ToolFailure;

    fn ok(value: Value) -> ToolResult {
        Ok(value.as_object().cloned().unwrap())
    }

    fn fail(kind: ToolFailureKind) -> ToolResult {
        Err(ToolFailure::new(kind, "boom"))
    }

    #[test]
    fn test_quality_ordering() {
        assert!(Quality::None < Quality::Degraded);
        assert!(Quality::Degraded < Quality::Partial);
        assert!(Quality::Partial < Quality::Full);
        assert_eq!(Quality::parse("bogus"), Quality::None);
    }

    #[test]
    fn test_both_sources_full() {
        let tag = ok(json!({"ImageWidth": 1920, "ImageHeight": 1080}));
        let probe = ok(json!({"streams": [{"width": 1920, "height": 1080}], "format": {"duration": "12.5"}}));
        let e = normalize(Some(&tag), Some(&probe));
        assert_eq!(e.quality, Quality::Full);
        assert_eq!((e.width, e.height), (Some(1920), Some(1080)));
        assert_eq!(e.duration, Some(12.5));
    }

    #[test]
    fn test_disagreeing_sources_partial() {
        let tag = ok(json!({"ImageWidth": 100, "ImageHeight": 100}));
        let probe = ok(json!({"streams": [{"width": 1920, "height": 1080}]}));
        let e = normalize(Some(&tag), Some(&probe));
        assert_eq!(e.quality, Quality::Partial);
        // Probe stream ranks above tag fields.
        assert_eq!(e.width, Some(1920));
    }

    #[test]
    fn test_one_source_partial_all_failed_degraded() {
        let tag = ok(json!({"ImageWidth": 10, "ImageHeight": 20}));
        let probe = fail(ToolFailureKind::Timeout);
        let e = normalize(Some(&tag), Some(&probe));
        assert_eq!(e.quality, Quality::Partial);
        assert_eq!(e.raw["errors"][0]["kind"], "timeout");

        let e = normalize(Some(&fail(ToolFailureKind::Failed)), Some(&probe));
        assert_eq!(e.quality, Quality::Degraded);
        assert_eq!(e.raw["errors"].as_array().unwrap().len(), 2);
    }

    #[test]
    fn test_unreadable_and_not_applicable_are_none() {
        let e = normalize(Some(&fail(ToolFailureKind::Unreadable)), None);
        assert_eq!(e.quality, Quality::None);
        assert_eq!(normalize(None, None).quality, Quality::None);
    }

    #[test]
    fn test_single_applicable_tool_success_is_full() {
        let tag = ok(json!({"ImageSize": "640x480", "Rating": 3, "Keywords": ["cat", "cat", "sun"]}));
        let e = normalize(Some(&tag), None);
        assert_eq!(e.quality, Quality::Full);
        assert_eq!((e.width, e.height), (Some(640), Some(480)));
        assert_eq!(e.rating, Some(3));
        assert_eq!(e.tags, vec!["cat", "sun"]);
    }

    #[test]
    fn test_resolver_order() {
        let raw = json!({
            "width": 1, "height": 2,
            "tags": {"ImageWidth": 5, "ImageHeight": 6}
        });
        assert_eq!(resolve_dimensions(&raw), (Some(1), Some(2)));

        let raw = json!({"resolution": [3, 4], "tags": {"ImageWidth": 5, "ImageHeight": 6}});
        assert_eq!(resolve_dimensions(&raw), (Some(3), Some(4)));

        let raw = json!({"tags": {"ExifImageWidth": 7, "ExifImageHeight": 8}});
        assert_eq!(resolve_dimensions(&raw), (Some(7), Some(8)));

        let raw = json!({"tags": {"ImageWidth": 5}});
        assert_eq!(resolve_dimensions(&raw), (None, None));

        let raw = json!({"tags": {"Duration": 3.0}, "probe": {"streams": [{"duration": "9.0"}]}});
        assert_eq!(resolve_duration(&raw), Some(9.0));
    }

    #[test]
    fn test_payload_round_trip_keeps_quality_and_flags() {
        let tag = ok(json!({"ImageWidth": 512, "ImageHeight": 512,
            "Prompt": "{\"3\":{\"class_type\":\"KSampler\",\"inputs\":{\"steps\":20}}}"}));
        let e = normalize(Some(&tag), None);
        assert!(e.has_workflow && e.has_generation_data);

        let back = Extraction::from_payload(&e.raw_json()).unwrap();
        assert_eq!(back, e);
    }

    #[test]
    fn test_extract_skips_inapplicable_kinds() {
        let extractor = MetadataExtractor::new(None, None);
        let e = extractor.extract(Path::new("/m/a.glb"), FileKind::Model3d);
        assert_eq!(e.quality, Quality::None);
    }
}
