//! Subprocess format converter.
//!
//! - LibreOffice (`soffice --headless --convert-to`) for documents and spreadsheets
//! - ImageMagick (`convert`) for raster images
//! - `ffmpeg` for animated GIF to MP4
//!
//! Every call runs in its own scratch directory with a private LibreOffice
//! profile, so concurrent conversions do not fight over the user profile lock.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::domain::candidate::{extension_of, file_name_of};

use super::{ConversionError, FormatConverter, SheetCsv};

/// Converter tool locations and limits
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConverterConfig {
    #[serde(default = "default_soffice")]
    pub soffice_binary: String,

    #[serde(default = "default_imagemagick")]
    pub imagemagick_binary: String,

    #[serde(default = "default_ffmpeg")]
    pub ffmpeg_binary: String,

    #[serde(default = "default_unrar")]
    pub unrar_binary: String,

    /// Wall-clock limit per tool run
    #[serde(default = "default_converter_timeout")]
    pub timeout_secs: u64,
}

fn default_soffice() -> String {
    "soffice".to_string()
}
fn default_imagemagick() -> String {
    "convert".to_string()
}
fn default_ffmpeg() -> String {
    "ffmpeg".to_string()
}
fn default_unrar() -> String {
    "unrar".to_string()
}
fn default_converter_timeout() -> u64 {
    120
}

impl Default for ConverterConfig {
    fn default() -> Self {
        Self {
            soffice_binary: default_soffice(),
            imagemagick_binary: default_imagemagick(),
            ffmpeg_binary: default_ffmpeg(),
            unrar_binary: default_unrar(),
            timeout_secs: default_converter_timeout(),
        }
    }
}

const RASTER_EXTENSIONS: &[&str] = &[".bmp", ".gif", ".tif", ".tiff", ".webp", ".jpg", ".jpeg", ".png"];

/// LibreOffice CSV filter: comma, double quote, UTF-8, every sheet to its own file
const CSV_ALL_SHEETS_FILTER: &str = "csv:Text - txt - csv (StarCalc):44,34,76,1,,0,false,true,false,false,false,-1";

/// Tool chosen for one conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tool {
    Office,
    ImageMagick,
    Ffmpeg,
}

fn tool_for(source_ext: &str, target: &str) -> Tool {
    match target {
        ".mp4" => Tool::Ffmpeg,
        ".png" if RASTER_EXTENSIONS.contains(&source_ext) => Tool::ImageMagick,
        _ => Tool::Office,
    }
}

/// LibreOffice `--convert-to` argument for a target extension
fn office_filter(target: &str) -> String {
    match target {
        ".txt" => "txt:Text (encoded):UTF8".to_string(),
        other => other.trim_start_matches('.').to_string(),
    }
}

/// File name safe to place in the scratch directory
fn scratch_name(file_name: &str) -> String {
    let name: String = file_name_of(file_name)
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    let name = name.trim_start_matches('.');
    if name.is_empty() {
        "input".to_string()
    } else {
        name.to_string()
    }
}

pub struct OfficeConverter {
    config: ConverterConfig,
}

impl OfficeConverter {
    pub fn new(config: ConverterConfig) -> Self {
        Self { config }
    }

    async fn run(&self, binary: &str, args: &[String], workdir: &Path) -> Result<(), ConversionError> {
        let limit = Duration::from_secs(self.config.timeout_secs);
        let child = Command::new(binary)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConversionError::ToolFailed {
                tool: binary.to_string(),
                message: format!("failed to spawn: {}", e),
            })?;

        let output = timeout(limit, child.wait_with_output())
            .await
            .map_err(|_| ConversionError::Timeout(self.config.timeout_secs))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ConversionError::ToolFailed {
                tool: binary.to_string(),
                message: format!(
                    "exit code {}: {}",
                    output.status.code().unwrap_or(-1),
                    stderr.trim()
                ),
            });
        }
        Ok(())
    }

    fn office_args(&self, scratch: &Path, convert_to: &str, input: &Path, outdir: &Path) -> Vec<String> {
        vec![
            format!("-env:UserInstallation=file://{}", scratch.join("profile").display()),
            "--headless".to_string(),
            "--convert-to".to_string(),
            convert_to.to_string(),
            "--outdir".to_string(),
            outdir.display().to_string(),
            input.display().to_string(),
        ]
    }

    /// Write the input into a fresh scratch directory
    async fn stage(&self, file_name: &str, content: &[u8]) -> Result<(TempDir, PathBuf, PathBuf), ConversionError> {
        let scratch = TempDir::new()?;
        let input = scratch.path().join(scratch_name(file_name));
        let outdir = scratch.path().join("out");
        tokio::fs::create_dir_all(&outdir).await?;
        tokio::fs::write(&input, content).await?;
        Ok((scratch, input, outdir))
    }
}

/// Files in `dir` with extension `ext`, sorted by name
async fn outputs_with_extension(dir: &Path, ext: &str) -> Result<Vec<PathBuf>, ConversionError> {
    let mut found = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if extension_of(&path.to_string_lossy()) == ext {
            found.push(path);
        }
    }
    found.sort();
    Ok(found)
}

#[async_trait]
impl FormatConverter for OfficeConverter {
    async fn convert(&self, file_name: &str, content: &[u8], target: &str) -> Result<Vec<u8>, ConversionError> {
        let (scratch, input, outdir) = self.stage(file_name, content).await?;
        let source_ext = extension_of(file_name);
        let tool = tool_for(&source_ext, target);
        let output = outdir.join(format!("converted{}", target));

        match tool {
            Tool::Ffmpeg => {
                let args = vec![
                    "-y".to_string(),
                    "-i".to_string(),
                    input.display().to_string(),
                    "-movflags".to_string(),
                    "faststart".to_string(),
                    "-pix_fmt".to_string(),
                    "yuv420p".to_string(),
                    "-vf".to_string(),
                    "scale=trunc(iw/2)*2:trunc(ih/2)*2".to_string(),
                    output.display().to_string(),
                ];
                self.run(&self.config.ffmpeg_binary, &args, scratch.path()).await?;
            }
            Tool::ImageMagick => {
                // first frame only for multi-frame inputs
                let args = vec![format!("{}[0]", input.display()), output.display().to_string()];
                self.run(&self.config.imagemagick_binary, &args, scratch.path()).await?;
            }
            Tool::Office => {
                let args = self.office_args(scratch.path(), &office_filter(target), &input, &outdir);
                self.run(&self.config.soffice_binary, &args, scratch.path()).await?;
            }
        }

        let produced = outputs_with_extension(&outdir, target).await?;
        let Some(path) = produced.first() else {
            return Err(ConversionError::ToolFailed {
                tool: format!("{:?}", tool),
                message: format!("no {} output for {}", target, file_name),
            });
        };
        let bytes = tokio::fs::read(path).await?;
        if bytes.is_empty() {
            return Err(ConversionError::EmptyOutput);
        }
        debug!(file = file_name, target, bytes = bytes.len(), "Converted");
        Ok(bytes)
    }

    async fn spreadsheet_to_csv(&self, file_name: &str, content: &[u8]) -> Result<Vec<SheetCsv>, ConversionError> {
        let (scratch, input, outdir) = self.stage(file_name, content).await?;
        let args = self.office_args(scratch.path(), CSV_ALL_SHEETS_FILTER, &input, &outdir);
        self.run(&self.config.soffice_binary, &args, scratch.path()).await?;

        // LibreOffice names per-sheet exports "{stem}-{sheet}.csv"
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mut sheets = Vec::new();
        for path in outputs_with_extension(&outdir, ".csv").await? {
            let out_stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let sheet_name = out_stem
                .strip_prefix(&format!("{}-", stem))
                .unwrap_or(&out_stem)
                .to_string();
            let csv = tokio::fs::read(&path).await?;
            sheets.push(SheetCsv { sheet_name, csv });
        }

        if sheets.is_empty() {
            return Err(ConversionError::EmptyOutput);
        }
        Ok(sheets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_selection() {
        assert_eq!(tool_for(".gif", ".mp4"), Tool::Ffmpeg);
        assert_eq!(tool_for(".bmp", ".png"), Tool::ImageMagick);
        assert_eq!(tool_for(".docx", ".png"), Tool::Office);
        assert_eq!(tool_for(".docx", ".html"), Tool::Office);
        assert_eq!(office_filter(".txt"), "txt:Text (encoded):UTF8");
        assert_eq!(office_filter(".pdf"), "pdf");
    }

    #[test]
    fn test_scratch_name_is_flat() {
        assert_eq!(scratch_name("a.zip/../Edital Nº 1.docx"), "Edital_Nº_1.docx");
        assert_eq!(scratch_name(".hidden"), "hidden");
        assert_eq!(scratch_name(""), "input");
    }

    #[tokio::test]
    async fn test_missing_binary_is_tool_failure() {
        let converter = OfficeConverter::new(ConverterConfig {
            soffice_binary: "/nonexistent/soffice".to_string(),
            ..Default::default()
        });
        let err = converter.convert("a.docx", b"x", ".html").await.unwrap_err();
        assert!(matches!(err, ConversionError::ToolFailed { .. }));
    }
}
