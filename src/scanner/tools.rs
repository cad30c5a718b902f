//! Metadata tool collaborators.
//!
//! A tool never raises: every call returns a [`ToolResult`] per path. The
//! subprocess-backed tools run synchronously and are driven from the
//! blocking pool by the extraction coordinator.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Output, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use super::kinds::FileKind;
use crate::config::ToolsConfig;

pub type ToolMap = Map<String, Value>;
pub type ToolResult = Result<ToolMap, ToolFailure>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolFailureKind {
    /// The tool binary is missing or could not be started.
    Unavailable,
    Timeout,
    /// The tool ran and reported an error.
    Failed,
    /// The tool ran but its output could not be parsed.
    Unparseable,
    /// The tool skipped the file as unreadable.
    Unreadable,
}

impl ToolFailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolFailureKind::Unavailable => "unavailable",
            ToolFailureKind::Timeout => "timeout",
            ToolFailureKind::Failed => "failed",
            ToolFailureKind::Unparseable => "unparseable",
            ToolFailureKind::Unreadable => "unreadable",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub kind: ToolFailureKind,
    pub message: String,
}

impl ToolFailure {
    pub fn new(kind: ToolFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for ToolFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// An external metadata source.
///
/// `fields` optionally narrows the keys requested from the tool; `None`
/// asks for everything it can report.
pub trait MetadataTool: Send + Sync {
    fn name(&self) -> &str;

    fn supports(&self, kind: FileKind) -> bool;

    fn read(&self, path: &Path, fields: Option<&[&str]>) -> ToolResult;

    /// Read many paths in one call. The result holds exactly one entry per
    /// input path.
    fn read_batch(&self, paths: &[PathBuf], fields: Option<&[&str]>) -> HashMap<PathBuf, ToolResult> {
        paths
            .iter()
            .map(|path| (path.clone(), self.read(path, fields)))
            .collect()
    }
}

/// Normalized form of a tool-reported source path, used to correlate batch
/// output with inputs.
pub fn canonical_source(path: &str) -> String {
    let unified = path.replace('\\', "/");
    let trimmed = unified.trim_end_matches('/');
    trimmed.to_lowercase()
}

/// Match tool records to the requested paths by their reported source
/// path. Paths the tool did not report come back as `Unreadable`.
pub fn correlate(
    paths: &[PathBuf],
    records: Vec<(String, ToolResult)>,
    tool: &str,
) -> HashMap<PathBuf, ToolResult> {
    let exact: HashMap<String, &PathBuf> = paths
        .iter()
        .map(|p| (p.to_string_lossy().into_owned(), p))
        .collect();
    let canonical: HashMap<String, &PathBuf> = paths
        .iter()
        .map(|p| (canonical_source(&p.to_string_lossy()), p))
        .collect();

    let mut results = HashMap::with_capacity(paths.len());
    for (source, result) in records {
        let matched = exact
            .get(&source)
            .or_else(|| canonical.get(&canonical_source(&source)));
        match matched {
            Some(path) => {
                results.insert((*path).clone(), result);
            }
            None => tracing::debug!(tool, source = %source, "Tool reported an unrequested file"),
        }
    }

    for path in paths {
        results.entry(path.clone()).or_insert_with(|| {
            Err(ToolFailure::new(
                ToolFailureKind::Unreadable,
                format!("{tool} skipped the file"),
            ))
        });
    }
    results
}

const POLL_INTERVAL: Duration = Duration::from_millis(10);

fn drain<R: Read + Send + 'static>(source: Option<R>) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        buf
    })
}

fn kill(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Run `command` to completion or kill it once `timeout` elapses.
pub fn run_with_timeout(mut command: Command, timeout: Duration) -> Result<Output, ToolFailure> {
    command.stdin(Stdio::null()).stdout(Stdio::piped()).stderr(Stdio::piped());

    let program = command.get_program().to_string_lossy().into_owned();
    let mut child = command.spawn().map_err(|e| {
        let kind = if e.kind() == io::ErrorKind::NotFound {
            ToolFailureKind::Unavailable
        } else {
            ToolFailureKind::Failed
        };
        ToolFailure::new(kind, format!("{program}: {e}"))
    })?;

    let stdout = drain(child.stdout.take());
    let stderr = drain(child.stderr.take());
    let deadline = Instant::now() + timeout;

    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                kill(&mut child);
                return Err(ToolFailure::new(
                    ToolFailureKind::Timeout,
                    format!("{program} exceeded {}ms", timeout.as_millis()),
                ));
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                kill(&mut child);
                return Err(ToolFailure::new(ToolFailureKind::Failed, format!("{program}: {e}")));
            }
        }
    };

    Ok(Output {
        status,
        stdout: stdout.join().unwrap_or_default(),
        stderr: stderr.join().unwrap_or_default(),
    })
}

fn stderr_line(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr)
        .lines()
        .next()
        .unwrap_or("no diagnostic output")
        .to_string()
}

/// `exiftool -json -n`, one process per batch.
pub struct ExifTool {
    program: PathBuf,
    config: ToolsConfig,
}

impl ExifTool {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            program: config.exiftool_path.clone(),
            config: config.clone(),
        }
    }

    fn parse_records(stdout: &[u8]) -> Result<Vec<(String, ToolResult)>, ToolFailure> {
        let parsed: Value = serde_json::from_slice(stdout)
            .map_err(|e| ToolFailure::new(ToolFailureKind::Unparseable, e.to_string()))?;
        let Value::Array(items) = parsed else {
            return Err(ToolFailure::new(ToolFailureKind::Unparseable, "expected a JSON array"));
        };

        let mut records = Vec::with_capacity(items.len());
        for item in items {
            let Value::Object(mut map) = item else { continue };
            let Some(Value::String(source)) = map.remove("SourceFile") else {
                continue;
            };
            let result = match map.get("Error").and_then(Value::as_str) {
                Some(error) => Err(ToolFailure::new(ToolFailureKind::Unreadable, error)),
                None => Ok(map),
            };
            records.push((source, result));
        }
        Ok(records)
    }
}

impl MetadataTool for ExifTool {
    fn name(&self) -> &str {
        "exiftool"
    }

    fn supports(&self, kind: FileKind) -> bool {
        !matches!(kind, FileKind::Model3d)
    }

    fn read(&self, path: &Path, fields: Option<&[&str]>) -> ToolResult {
        let mut batch = self.read_batch(&[path.to_path_buf()], fields);
        batch.remove(path).unwrap_or_else(|| {
            Err(ToolFailure::new(ToolFailureKind::Unreadable, "exiftool skipped the file"))
        })
    }

    fn read_batch(&self, paths: &[PathBuf], fields: Option<&[&str]>) -> HashMap<PathBuf, ToolResult> {
        if paths.is_empty() {
            return HashMap::new();
        }

        let mut command = Command::new(&self.program);
        command.args(["-json", "-n", "-q", "-q"]);
        if let Some(fields) = fields {
            command.args(fields.iter().map(|f| format!("-{f}")));
        }
        command.arg("--").args(paths);

        let failure = match run_with_timeout(command, self.config.timeout_for(paths.len())) {
            Ok(output) if output.stdout.iter().all(u8::is_ascii_whitespace) => ToolFailure::new(
                if output.status.success() {
                    ToolFailureKind::Unparseable
                } else {
                    ToolFailureKind::Failed
                },
                stderr_line(&output),
            ),
            // exiftool exits non-zero when any single file fails; the
            // JSON still covers the rest.
            Ok(output) => match Self::parse_records(&output.stdout) {
                Ok(records) => return correlate(paths, records, self.name()),
                Err(failure) => failure,
            },
            Err(failure) => failure,
        };

        paths
            .iter()
            .map(|path| (path.clone(), Err(failure.clone())))
            .collect()
    }
}

/// `ffprobe` container/stream probe, one process per file.
pub struct FfprobeTool {
    program: PathBuf,
    timeout: Duration,
}

impl FfprobeTool {
    pub fn new(config: &ToolsConfig) -> Self {
        Self {
            program: config.ffprobe_path.clone(),
            timeout: Duration::from_secs(config.timeout_secs),
        }
    }
}

impl MetadataTool for FfprobeTool {
    fn name(&self) -> &str {
        "ffprobe"
    }

    fn supports(&self, kind: FileKind) -> bool {
        matches!(kind, FileKind::Video | FileKind::Audio)
    }

    fn read(&self, path: &Path, fields: Option<&[&str]>) -> ToolResult {
        let mut command = Command::new(&self.program);
        command.args(["-v", "error", "-print_format", "json", "-show_format", "-show_streams"]);
        if let Some(fields) = fields {
            command.args(["-show_entries", &fields.join(",")]);
        }
        command.arg(path);

        let output = run_with_timeout(command, self.timeout)?;
        if !output.status.success() {
            return Err(ToolFailure::new(ToolFailureKind::Failed, stderr_line(&output)));
        }

        match serde_json::from_slice::<Value>(&output.stdout) {
            Ok(Value::Object(map)) if !map.is_empty() => Ok(map),
            Ok(_) => Err(ToolFailure::new(ToolFailureKind::Unparseable, "empty probe output")),
            Err(e) => Err(ToolFailure::new(ToolFailureKind::Unparseable, e.to_string())),
        }
    }
}

/// In-process tag reader: image header dimensions, EXIF fields and PNG
/// text chunks. Serves as the tag source when exiftool is not installed.
pub struct NativeExifReader;

const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
const MAX_TEXT_CHUNK: u32 = 16 * 1024 * 1024;

impl NativeExifReader {
    fn read_exif(path: &Path, map: &mut ToolMap) {
        let Ok(file) = File::open(path) else { return };
        let mut bufreader = BufReader::new(file);
        let Ok(exif) = exif::Reader::new().read_from_container(&mut bufreader) else {
            return;
        };

        for field in exif.fields() {
            if field.ifd_num != exif::In::PRIMARY {
                continue;
            }
            let value = match field.value {
                exif::Value::Short(ref v) if v.len() == 1 => Value::from(v[0]),
                exif::Value::Long(ref v) if v.len() == 1 => Value::from(v[0]),
                exif::Value::Rational(ref v) if v.len() == 1 && v[0].denom != 0 => {
                    Value::from(v[0].num as f64 / v[0].denom as f64)
                }
                _ => Value::String(field.display_value().to_string().trim_matches('"').to_string()),
            };
            map.insert(field.tag.to_string(), value);
        }
    }

    /// tEXt and uncompressed iTXt chunks, keyword → text.
    fn read_png_text(path: &Path) -> io::Result<Vec<(String, String)>> {
        let mut reader = BufReader::new(File::open(path)?);
        let mut signature = [0u8; 8];
        reader.read_exact(&mut signature)?;
        if signature != PNG_SIGNATURE {
            return Ok(Vec::new());
        }

        let mut texts = Vec::new();
        let mut header = [0u8; 8];
        while reader.read_exact(&mut header).is_ok() {
            let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
            let chunk_type = [header[4], header[5], header[6], header[7]];
            match &chunk_type {
                b"IEND" => break,
                b"tEXt" | b"iTXt" if len <= MAX_TEXT_CHUNK => {
                    let mut data = vec![0u8; len as usize];
                    reader.read_exact(&mut data)?;
                    reader.seek(SeekFrom::Current(4))?;
                    let parsed = if &chunk_type == b"tEXt" {
                        parse_text_chunk(&data)
                    } else {
                        parse_itxt_chunk(&data)
                    };
                    if let Some(entry) = parsed {
                        texts.push(entry);
                    }
                }
                _ => {
                    reader.seek(SeekFrom::Current(len as i64 + 4))?;
                }
            }
        }
        Ok(texts)
    }
}

fn parse_text_chunk(data: &[u8]) -> Option<(String, String)> {
    let nul = data.iter().position(|&b| b == 0)?;
    let keyword = String::from_utf8_lossy(&data[..nul]).into_owned();
    // Latin-1: every byte maps to the code point of the same value.
    let text = data[nul + 1..].iter().map(|&b| b as char).collect();
    Some((keyword, text))
}

fn parse_itxt_chunk(data: &[u8]) -> Option<(String, String)> {
    let nul = data.iter().position(|&b| b == 0)?;
    let keyword = String::from_utf8_lossy(&data[..nul]).into_owned();
    let rest = data.get(nul + 1..)?;
    let (&compressed, rest) = rest.split_first()?;
    if compressed != 0 {
        return None;
    }
    let rest = rest.get(1..)?;
    let lang_end = rest.iter().position(|&b| b == 0)?;
    let rest = &rest[lang_end + 1..];
    let translated_end = rest.iter().position(|&b| b == 0)?;
    let text = String::from_utf8_lossy(&rest[translated_end + 1..]).into_owned();
    Some((keyword, text))
}

impl MetadataTool for NativeExifReader {
    fn name(&self) -> &str {
        "native-exif"
    }

    fn supports(&self, kind: FileKind) -> bool {
        matches!(kind, FileKind::Image)
    }

    fn read(&self, path: &Path, _fields: Option<&[&str]>) -> ToolResult {
        if !path.is_file() {
            return Err(ToolFailure::new(ToolFailureKind::Unreadable, "not a readable file"));
        }

        let mut map = ToolMap::new();
        if let Ok(reader) = image::ImageReader::open(path) {
            if let Ok(reader) = reader.with_guessed_format() {
                if let Some(format) = reader.format() {
                    map.insert("FileType".into(), Value::String(format!("{format:?}").to_uppercase()));
                }
                if let Ok((width, height)) = reader.into_dimensions() {
                    map.insert("ImageWidth".into(), Value::from(width));
                    map.insert("ImageHeight".into(), Value::from(height));
                }
            }
        }

        Self::read_exif(path, &mut map);

        match Self::read_png_text(path) {
            Ok(texts) => {
                for (keyword, text) in texts {
                    map.insert(keyword, Value::String(text));
                }
            }
            Err(e) => tracing::debug!(path = %path.display(), error = %e, "PNG text chunks unreadable"),
        }

        if map.is_empty() {
            Err(ToolFailure::new(ToolFailureKind::Failed, "no readable image metadata"))
        } else {
            Ok(map)
        }
    }
}

/// Uses `primary` unless it reports itself unavailable, then `fallback`.
pub struct FallbackTool {
    primary: Arc<dyn MetadataTool>,
    fallback: Arc<dyn MetadataTool>,
}

impl FallbackTool {
    pub fn new(primary: Arc<dyn MetadataTool>, fallback: Arc<dyn MetadataTool>) -> Self {
        Self { primary, fallback }
    }

    fn unavailable(result: &ToolResult) -> bool {
        matches!(result, Err(f) if f.kind == ToolFailureKind::Unavailable)
    }
}

impl MetadataTool for FallbackTool {
    fn name(&self) -> &str {
        self.primary.name()
    }

    fn supports(&self, kind: FileKind) -> bool {
        self.primary.supports(kind)
    }

    fn read(&self, path: &Path, fields: Option<&[&str]>) -> ToolResult {
        let result = self.primary.read(path, fields);
        if Self::unavailable(&result) {
            return self.fallback.read(path, fields);
        }
        result
    }

    fn read_batch(&self, paths: &[PathBuf], fields: Option<&[&str]>) -> HashMap<PathBuf, ToolResult> {
        let mut results = self.primary.read_batch(paths, fields);
        let retry: Vec<PathBuf> = results
            .iter()
            .filter(|(_, r)| Self::unavailable(r))
            .map(|(p, _)| p.clone())
            .collect();
        if !retry.is_empty() {
            results.extend(self.fallback.read_batch(&retry, fields));
        }
        results
    }
}
