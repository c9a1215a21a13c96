//! Octree conversion through an external tool.
//!
//! The tool is a black box: it gets the raw artifact, an output directory and
//! optionally a crop window, and prints progress as free text on stdout or
//! stderr. Success means exit code zero *and* the descriptor file present in
//! the output directory.

use async_trait::async_trait;
use regex::Regex;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, trace};

use crate::config::ConverterConfig;
use crate::errors::{AppError, AppResult, PipelineError, PipelineResult};
use crate::progress::ProgressSink;
use crate::tiles::{ProjectedBounds, Tile};

/// Output lines kept for the failure message.
const OUTPUT_TAIL_LINES: usize = 20;

#[async_trait]
pub trait Converter: Send + Sync {
    /// Convert `raw_artifact` into `output_dir` and return `output_dir`.
    async fn convert(
        &self,
        tile: &Tile,
        raw_artifact: &Path,
        output_dir: &Path,
        on_progress: &dyn ProgressSink,
        crop_bbox: Option<&ProjectedBounds>,
    ) -> PipelineResult<PathBuf>;
}

/// Extracts a 0 to 100 percentage from one line of tool output.
pub trait ProgressParser: Send + Sync + std::fmt::Debug {
    fn parse(&self, line: &str) -> Option<f64>;
}

/// Tries each pattern in order; the first capture group of the first match
/// is the percentage.
#[derive(Debug, Clone)]
pub struct RegexProgressParser {
    patterns: Vec<Regex>,
}

impl RegexProgressParser {
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> AppResult<Self> {
        let patterns = patterns
            .iter()
            .map(|pattern| {
                Regex::new(pattern.as_ref()).map_err(|e| {
                    AppError::configuration(format!(
                        "Invalid progress pattern '{}': {}",
                        pattern.as_ref(),
                        e
                    ))
                })
            })
            .collect::<AppResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }
}

impl ProgressParser for RegexProgressParser {
    fn parse(&self, line: &str) -> Option<f64> {
        self.patterns.iter().find_map(|pattern| {
            pattern
                .captures(line)
                .and_then(|caps| caps.get(1))
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .filter(|value| value.is_finite())
                .map(|value| value.clamp(0.0, 100.0))
        })
    }
}

/// The crop window handed to the tool: the request grown by the buffer
/// margin and clipped to the tile.
pub fn effective_crop(
    tile: &Tile,
    crop: &ProjectedBounds,
    buffer_m: f64,
) -> PipelineResult<ProjectedBounds> {
    if !crop.is_valid() {
        return Err(PipelineError::invalid_input("crop bounds are not a valid box"));
    }
    if !crop.intersects(&tile.bounds) {
        return Err(PipelineError::CropOutsideTile {
            tile_id: tile.tile_id.to_string(),
        });
    }
    crop.expand(buffer_m.max(0.0))
        .intersection(&tile.bounds)
        .ok_or_else(|| PipelineError::CropOutsideTile {
            tile_id: tile.tile_id.to_string(),
        })
}

#[derive(Debug, Clone)]
pub struct SubprocessConverter {
    command: String,
    extra_args: Vec<String>,
    crop_flag: String,
    crop_buffer_m: f64,
    descriptor_file: String,
    parser: RegexProgressParser,
}

impl SubprocessConverter {
    pub fn new(config: &ConverterConfig) -> AppResult<Self> {
        Ok(Self {
            command: config.command.clone(),
            extra_args: config.extra_args.clone(),
            crop_flag: config.crop_flag.clone(),
            crop_buffer_m: config.crop_buffer_m,
            descriptor_file: config.descriptor_file.clone(),
            parser: RegexProgressParser::new(config.progress_patterns.as_slice())?,
        })
    }

    fn arguments(
        &self,
        raw_artifact: &Path,
        output_dir: &Path,
        crop: Option<&ProjectedBounds>,
    ) -> Vec<String> {
        let mut args = self.extra_args.clone();
        args.push(raw_artifact.to_string_lossy().into_owned());
        args.push("-o".to_string());
        args.push(output_dir.to_string_lossy().into_owned());
        if let Some(crop) = crop {
            args.push(self.crop_flag.clone());
            args.push(format!(
                "{:.3},{:.3},{:.3},{:.3}",
                crop.min_e, crop.min_n, crop.max_e, crop.max_n
            ));
        }
        args
    }
}

#[async_trait]
impl Converter for SubprocessConverter {
    async fn convert(
        &self,
        tile: &Tile,
        raw_artifact: &Path,
        output_dir: &Path,
        on_progress: &dyn ProgressSink,
        crop_bbox: Option<&ProjectedBounds>,
    ) -> PipelineResult<PathBuf> {
        let descriptor = output_dir.join(&self.descriptor_file);
        if tokio::fs::try_exists(&descriptor).await.unwrap_or(false) {
            debug!("Converted output for {} already present", tile.tile_id);
            on_progress.report(100.0, "Conversion already cached").await;
            return Ok(output_dir.to_path_buf());
        }

        let crop = crop_bbox
            .map(|crop| effective_crop(tile, crop, self.crop_buffer_m))
            .transpose()?;
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(|e| PipelineError::io("creating conversion directory", e, output_dir))?;

        let args = self.arguments(raw_artifact, output_dir, crop.as_ref());
        info!("Converting tile {} with {} {:?}", tile.tile_id, self.command, args);
        on_progress.report(0.0, "Converting point cloud").await;

        let mut child = Command::new(&self.command)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound | std::io::ErrorKind::PermissionDenied => {
                    PipelineError::ConverterMissing {
                        command: self.command.clone(),
                    }
                }
                _ => PipelineError::io("starting converter", e, output_dir),
            })?;

        let (tx, mut rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(stdout, tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(stderr, tx.clone()));
        }
        drop(tx);

        let mut tail = VecDeque::with_capacity(OUTPUT_TAIL_LINES);
        while let Some(line) = rx.recv().await {
            trace!(tile_id = %tile.tile_id, "converter: {}", line);
            if let Some(percent) = self.parser.parse(&line) {
                on_progress.report(percent, "Converting point cloud").await;
            }
            if tail.len() == OUTPUT_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }

        let status = child
            .wait()
            .await
            .map_err(|e| PipelineError::io("waiting for converter", e, output_dir))?;
        if !status.success() {
            return Err(PipelineError::ConverterFailed {
                exit_code: status.code(),
                output: tail.into_iter().collect::<Vec<_>>().join("\n"),
            });
        }
        if !tokio::fs::try_exists(&descriptor).await.unwrap_or(false) {
            return Err(PipelineError::MissingDescriptor { path: descriptor });
        }

        info!("Converted tile {}", tile.tile_id);
        on_progress.report(100.0, "Conversion complete").await;
        Ok(output_dir.to_path_buf())
    }
}

/// Forward output line by line; carriage returns end a line as well, since
/// progress bars redraw with them.
async fn forward_lines<R: AsyncRead + Unpin>(mut reader: R, tx: mpsc::UnboundedSender<String>) {
    let mut buf = [0u8; 4096];
    let mut line = Vec::new();
    loop {
        let read = match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(read) => read,
        };
        for &byte in &buf[..read] {
            if byte == b'\n' || byte == b'\r' {
                if !line.is_empty() {
                    let _ = tx.send(String::from_utf8_lossy(&line).into_owned());
                    line.clear();
                }
            } else {
                line.push(byte);
            }
        }
    }
    if !line.is_empty() {
        let _ = tx.send(String::from_utf8_lossy(&line).into_owned());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::defaults::DEFAULT_PROGRESS_PATTERNS;
    use crate::progress::sink::tests::RecordingSink;
    use crate::tiles::{GeoPoint, TileId};
    use rstest::rstest;
    use tempfile::TempDir;

    fn tile() -> Tile {
        Tile {
            tile_id: TileId::new(42, 17),
            grid_x: 42,
            grid_y: 17,
            bounds: ProjectedBounds::from_corners(42_000.0, 17_000.0, 43_000.0, 18_000.0),
            center: GeoPoint { lat: 0.0, lon: 0.0 },
        }
    }

    /// A converter that runs `sh <script>` so no freshly written file is executed.
    fn shell_converter(dir: &TempDir, script: &str) -> SubprocessConverter {
        let path = dir.path().join("convert.sh");
        std::fs::write(&path, script).unwrap();
        SubprocessConverter::new(&ConverterConfig {
            command: "sh".to_string(),
            extra_args: vec![path.to_string_lossy().into_owned()],
            crop_flag: "--crop".to_string(),
            crop_buffer_m: 50.0,
            descriptor_file: "metadata.json".to_string(),
            progress_patterns: DEFAULT_PROGRESS_PATTERNS.iter().map(|s| s.to_string()).collect(),
        })
        .unwrap()
    }

    #[rstest]
    #[case("INDEXING: 42.5 %", Some(42.5))]
    #[case("[ 17%, 3s]", Some(17.0))]
    #[case("done 250%", Some(100.0))]
    #[case("reading header", None)]
    fn test_progress_parsing(#[case] line: &str, #[case] expected: Option<f64>) {
        let parser = RegexProgressParser::new(DEFAULT_PROGRESS_PATTERNS).unwrap();
        assert_eq!(parser.parse(line), expected);
    }

    #[test]
    fn test_invalid_pattern_is_a_configuration_error() {
        assert!(matches!(
            RegexProgressParser::new(&["(unclosed"]),
            Err(AppError::Configuration { .. })
        ));
    }

    #[test]
    fn test_effective_crop_is_buffered_and_clamped() {
        let crop = ProjectedBounds::from_corners(42_100.0, 17_100.0, 42_200.0, 17_990.0);
        let effective = effective_crop(&tile(), &crop, 50.0).unwrap();
        assert_eq!(
            effective,
            ProjectedBounds::from_corners(42_050.0, 17_050.0, 42_250.0, 18_000.0)
        );

        let outside = ProjectedBounds::from_corners(50_000.0, 17_000.0, 51_000.0, 18_000.0);
        assert!(matches!(
            effective_crop(&tile(), &outside, 50.0),
            Err(PipelineError::CropOutsideTile { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_conversion_reports_parsed_progress() {
        let dir = TempDir::new().unwrap();
        let converter = shell_converter(
            &dir,
            r#"out="$3"
echo "[ 10%, 1s]"
echo "INDEXING: 55 %" 1>&2
printf '[ 80%%, 2s]\r'
echo "$@" > "$out/args.txt"
echo '{}' > "$out/metadata.json"
"#,
        );
        let out = dir.path().join("converted");
        let sink = RecordingSink::default();
        let crop = ProjectedBounds::from_corners(42_100.0, 17_100.0, 42_200.0, 17_200.0);

        let result = converter
            .convert(&tile(), Path::new("/data/raw.laz"), &out, &sink, Some(&crop))
            .await
            .unwrap();
        assert_eq!(result, out);

        let percents = sink.percents();
        assert_eq!(percents.first(), Some(&0.0));
        assert_eq!(percents.last(), Some(&100.0));
        assert!(percents.contains(&10.0));
        assert!(percents.contains(&55.0));
        assert!(percents.contains(&80.0));

        let args = std::fs::read_to_string(out.join("args.txt")).unwrap();
        assert!(args.contains("/data/raw.laz -o"));
        assert!(args.contains("--crop 42050.000,17050.000,42250.000,17250.000"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_exit_zero_without_descriptor_fails() {
        let dir = TempDir::new().unwrap();
        let converter = shell_converter(&dir, "echo '[ 100%, 1s]'\nexit 0\n");
        let err = converter
            .convert(
                &tile(),
                Path::new("raw.laz"),
                &dir.path().join("out"),
                &RecordingSink::default(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::MissingDescriptor { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_zero_exit_keeps_output_tail() {
        let dir = TempDir::new().unwrap();
        let converter = shell_converter(
            &dir,
            "i=0\nwhile [ $i -lt 30 ]; do echo \"line $i\"; i=$((i+1)); done\necho 'ERROR: bad header'\nexit 3\n",
        );
        let err = converter
            .convert(
                &tile(),
                Path::new("raw.laz"),
                &dir.path().join("out"),
                &RecordingSink::default(),
                None,
            )
            .await
            .unwrap_err();
        match err {
            PipelineError::ConverterFailed { exit_code, output } => {
                assert_eq!(exit_code, Some(3));
                assert_eq!(output.lines().count(), OUTPUT_TAIL_LINES);
                assert!(output.contains("ERROR: bad header"));
                assert!(!output.contains("line 0\n"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_executable_is_distinct() {
        let dir = TempDir::new().unwrap();
        let converter = SubprocessConverter::new(&ConverterConfig {
            command: "definitely-not-a-converter-binary".to_string(),
            ..ConverterConfig::default()
        })
        .unwrap();
        let err = converter
            .convert(
                &tile(),
                Path::new("raw.laz"),
                &dir.path().join("out"),
                &RecordingSink::default(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::ConverterMissing { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_existing_descriptor_short_circuits() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        std::fs::create_dir_all(&out).unwrap();
        std::fs::write(out.join("metadata.json"), "{}").unwrap();
        let converter = SubprocessConverter::new(&ConverterConfig {
            command: "definitely-not-a-converter-binary".to_string(),
            ..ConverterConfig::default()
        })
        .unwrap();
        let sink = RecordingSink::default();

        converter
            .convert(&tile(), Path::new("raw.laz"), &out, &sink, None)
            .await
            .unwrap();
        assert_eq!(sink.percents(), vec![100.0]);
    }
}
