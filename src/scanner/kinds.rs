use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Broad category of a catalogued file, decided by extension alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Image,
    Video,
    Audio,
    Model3d,
}

impl FileKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileKind::Image => "image",
            FileKind::Video => "video",
            FileKind::Audio => "audio",
            FileKind::Model3d => "model3d",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "image" => Some(FileKind::Image),
            "video" => Some(FileKind::Video),
            "audio" => Some(FileKind::Audio),
            "model3d" => Some(FileKind::Model3d),
            _ => None,
        }
    }
}

const EXTENSIONS: &[(&str, FileKind)] = &[
    ("png", FileKind::Image),
    ("jpg", FileKind::Image),
    ("jpeg", FileKind::Image),
    ("webp", FileKind::Image),
    ("gif", FileKind::Image),
    ("bmp", FileKind::Image),
    ("tif", FileKind::Image),
    ("tiff", FileKind::Image),
    ("heic", FileKind::Image),
    ("heif", FileKind::Image),
    ("avif", FileKind::Image),
    ("mp4", FileKind::Video),
    ("webm", FileKind::Video),
    ("mov", FileKind::Video),
    ("mkv", FileKind::Video),
    ("avi", FileKind::Video),
    ("m4v", FileKind::Video),
    ("mp3", FileKind::Audio),
    ("wav", FileKind::Audio),
    ("flac", FileKind::Audio),
    ("ogg", FileKind::Audio),
    ("m4a", FileKind::Audio),
    ("aac", FileKind::Audio),
    ("opus", FileKind::Audio),
    ("glb", FileKind::Model3d),
    ("gltf", FileKind::Model3d),
    ("obj", FileKind::Model3d),
    ("fbx", FileKind::Model3d),
    ("stl", FileKind::Model3d),
];

/// Extension → kind lookup: the built-in table plus configured overrides.
#[derive(Debug, Clone)]
pub struct KindTable {
    map: HashMap<String, FileKind>,
}

impl Default for KindTable {
    fn default() -> Self {
        Self {
            map: EXTENSIONS
                .iter()
                .map(|(ext, kind)| (ext.to_string(), *kind))
                .collect(),
        }
    }
}

impl KindTable {
    /// Built-in table extended with `extra` (extension → kind name).
    /// Unknown kind names are ignored with a warning.
    pub fn with_overrides(extra: &HashMap<String, String>) -> Self {
        let mut table = Self::default();
        for (ext, kind) in extra {
            match FileKind::parse(&kind.to_lowercase()) {
                Some(kind) => {
                    table
                        .map
                        .insert(ext.trim_start_matches('.').to_lowercase(), kind);
                }
                None => tracing::warn!(extension = %ext, kind = %kind, "Ignoring unknown file kind"),
            }
        }
        table
    }

    pub fn kind_for_extension(&self, ext: &str) -> Option<FileKind> {
        self.map.get(&ext.to_lowercase()).copied()
    }

    pub fn kind_for_path(&self, path: &Path) -> Option<FileKind> {
        path.extension()
            .map(|e| e.to_string_lossy())
            .and_then(|e| self.kind_for_extension(&e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_is_case_insensitive() {
        let table = KindTable::default();
        assert_eq!(table.kind_for_path(Path::new("/a/B.PNG")), Some(FileKind::Image));
        assert_eq!(table.kind_for_path(Path::new("/a/clip.webm")), Some(FileKind::Video));
        assert_eq!(table.kind_for_path(Path::new("/a/notes.txt")), None);
        assert_eq!(table.kind_for_path(Path::new("/a/noext")), None);
    }

    #[test]
    fn test_overrides() {
        let mut extra = HashMap::new();
        extra.insert(".JXL".to_string(), "image".to_string());
        extra.insert("xyz".to_string(), "spreadsheet".to_string());
        let table = KindTable::with_overrides(&extra);
        assert_eq!(table.kind_for_extension("jxl"), Some(FileKind::Image));
        assert_eq!(table.kind_for_extension("xyz"), None);
    }
}
