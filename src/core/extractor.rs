//! Archive extraction.
//!
//! Downloads are frequently archives, sometimes archives of archives. The
//! extractor flattens them into leaf files with a composite path
//! (`outer.zip/inner.rar/edital.pdf`), classifying each blob by its
//! signature and expanding it with an explicit worklist.
//!
//! Extraction never fails as a whole. An archive that cannot be opened,
//! or that would break an [`ExtractionLimits`] cap, is emitted unchanged
//! as a single leaf flagged `extraction_failed`; its siblings are
//! unaffected.

use std::fs::File;
use std::io::{Cursor, Read};
use std::path::Path;
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use bzip2::read::BzDecoder;
use flate2::read::GzDecoder;
use xz2::read::XzDecoder;
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::candidate::extension_of;

use super::limits::{ExtractionLimits, ExtractionTracker, LimitViolation};

const ZIP_LOCAL_HEADER: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY_ARCHIVE: &[u8] = b"PK\x05\x06";
const RAR_SIGNATURE: &[u8] = b"Rar!\x1a\x07";
const SEVEN_ZIP_SIGNATURE: &[u8] = &[0x37, 0x7a, 0xbc, 0xaf, 0x27, 0x1c];
const GZIP_SIGNATURE: &[u8] = &[0x1f, 0x8b];
const BZIP2_SIGNATURE: &[u8] = b"BZh";
const XZ_SIGNATURE: &[u8] = &[0xfd, b'7', b'z', b'X', b'Z', 0x00];
const TAR_MAGIC_OFFSET: usize = 257;

/// Zip-based document formats that must stay whole
const ZIP_DOCUMENT_EXTENSIONS: &[&str] = &[
    ".docx", ".docm", ".xlsx", ".xlsm", ".xlsb", ".pptx", ".odt", ".ods", ".odp", ".epub",
];

/// Container classification of a blob
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Rar,
    SevenZip,
    Tar(TarCompression),
    /// Not a container: emitted as a leaf
    Opaque,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TarCompression {
    None,
    Gzip,
    Bzip2,
    Xz,
}

impl TarCompression {
    fn decoder<'a>(self, content: &'a [u8]) -> Box<dyn Read + 'a> {
        match self {
            TarCompression::None => Box::new(Cursor::new(content)),
            TarCompression::Gzip => Box::new(GzDecoder::new(content)),
            TarCompression::Bzip2 => Box::new(BzDecoder::new(content)),
            TarCompression::Xz => Box::new(XzDecoder::new(content)),
        }
    }
}

/// A flat file produced by extraction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedFile {
    /// Composite path, archive names joined with '/'
    pub path: String,

    /// File bytes
    pub content: Vec<u8>,

    /// Number of archives this file sits inside
    pub nesting_level: u32,

    /// Blob looked like an archive but could not be expanded
    pub extraction_failed: bool,
}

/// Reasons an archive could not be expanded
#[derive(Debug, Error)]
enum ExpandError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("{0}")]
    Archive(String),

    #[error("{tool} did not finish within {secs}s")]
    Timeout { tool: String, secs: u64 },

    #[error(transparent)]
    Limit(#[from] LimitViolation),
}

/// A blob waiting on the worklist
struct Pending {
    path: String,
    content: Vec<u8>,
    depth: u32,
}

/// Classify-then-dispatch archive extractor
#[derive(Debug, Clone)]
pub struct Extractor {
    limits: ExtractionLimits,

    /// External `unrar` binary used for RAR containers
    rar_binary: String,
}

impl Default for Extractor {
    fn default() -> Self {
        Self::new(ExtractionLimits::default())
    }
}

impl Extractor {
    pub fn new(limits: ExtractionLimits) -> Self {
        Self {
            limits,
            rar_binary: "unrar".to_string(),
        }
    }

    /// Use a custom RAR extraction binary
    pub fn with_rar_binary(mut self, binary: impl Into<String>) -> Self {
        self.rar_binary = binary.into();
        self
    }

    /// Flatten a downloaded blob into leaf files.
    ///
    /// Leaves come out in archive order, depth first.
    pub fn extract(&self, name: &str, content: Vec<u8>) -> Vec<ExtractedFile> {
        let mut tracker = ExtractionTracker::new();
        let mut leaves = Vec::new();
        let mut worklist = vec![Pending {
            path: name.to_string(),
            content,
            depth: 0,
        }];
        let mut overflow_logged = false;

        while let Some(item) = worklist.pop() {
            let kind = classify(&item.path, &item.content);

            let outcome = match kind {
                ArchiveKind::Opaque => None,
                _ => Some(
                    self.limits
                        .check_depth(item.depth)
                        .map_err(ExpandError::from)
                        .and_then(|_| self.expand(kind, &item.content, &tracker)),
                ),
            };

            match outcome {
                None => self.emit(&mut leaves, &mut tracker, &mut overflow_logged, item, false),
                Some(Ok(entries)) => {
                    let produced: u64 = entries.iter().map(|(_, c)| c.len() as u64).sum();
                    tracker.record_bytes(produced);
                    tracker.archives_opened += 1;
                    debug!(
                        path = %item.path,
                        ?kind,
                        entries = entries.len(),
                        bytes = produced,
                        "Expanded archive"
                    );

                    // Reverse so the worklist pops entries in archive order
                    for (entry_name, entry_content) in entries.into_iter().rev() {
                        worklist.push(Pending {
                            path: format!("{}/{}", item.path, entry_name),
                            content: entry_content,
                            depth: item.depth + 1,
                        });
                    }
                }
                Some(Err(e)) => {
                    warn!(
                        path = %item.path,
                        ?kind,
                        error = %e,
                        "Could not expand archive, treating as a single file"
                    );
                    self.emit(&mut leaves, &mut tracker, &mut overflow_logged, item, true);
                }
            }
        }

        leaves
    }

    fn emit(
        &self,
        leaves: &mut Vec<ExtractedFile>,
        tracker: &mut ExtractionTracker,
        overflow_logged: &mut bool,
        item: Pending,
        extraction_failed: bool,
    ) {
        if tracker.entries_emitted >= self.limits.max_entries {
            if !*overflow_logged {
                warn!(
                    limit = self.limits.max_entries,
                    "Leaf file limit reached, dropping remaining entries"
                );
                *overflow_logged = true;
            }
            return;
        }

        tracker.entries_emitted += 1;
        leaves.push(ExtractedFile {
            path: item.path,
            content: item.content,
            nesting_level: item.depth,
            extraction_failed,
        });
    }

    fn expand(
        &self,
        kind: ArchiveKind,
        content: &[u8],
        tracker: &ExtractionTracker,
    ) -> Result<Vec<(String, Vec<u8>)>, ExpandError> {
        let mut budget = ReadBudget::new(&self.limits, tracker);

        match kind {
            ArchiveKind::Zip => expand_zip(content, &mut budget),
            ArchiveKind::Tar(compression) => expand_tar(content, compression, &mut budget),
            ArchiveKind::SevenZip => expand_seven_zip(content, &mut budget),
            ArchiveKind::Rar => self.expand_rar(content, &mut budget),
            ArchiveKind::Opaque => Ok(Vec::new()),
        }
    }

    /// RAR has no maintained pure-Rust decoder; hand it to `unrar` in a scratch dir.
    ///
    /// The archive is listed first so declared sizes are checked against the
    /// caps before anything is written to disk.
    fn expand_rar(
        &self,
        content: &[u8],
        budget: &mut ReadBudget<'_>,
    ) -> Result<Vec<(String, Vec<u8>)>, ExpandError> {
        let scratch = tempfile::TempDir::new()?;
        let archive_path = scratch.path().join("archive.rar");
        let out_dir = scratch.path().join("out");
        std::fs::write(&archive_path, content)?;
        std::fs::create_dir_all(&out_dir)?;
        let archive_arg = archive_path.to_string_lossy().into_owned();

        let listing = self.run_rar(scratch.path(), "list", &["lt", "-p-", archive_arg.as_str()])?;
        let mut declared_total = 0u64;
        for (name, size) in parse_rar_listing(&listing) {
            budget.admit(&name, size)?;
            declared_total = declared_total.saturating_add(size);
            budget.check_total(declared_total)?;
        }

        let out_arg = format!("{}/", out_dir.display());
        self.run_rar(
            scratch.path(),
            "extract",
            &["x", "-y", "-p-", "-idq", archive_arg.as_str(), out_arg.as_str()],
        )?;

        let mut entries = Vec::new();
        for path in walk_files(&out_dir)? {
            let relative = path
                .strip_prefix(&out_dir)
                .map(|p| p.to_string_lossy().replace('\\', "/"))
                .unwrap_or_default();
            let Some(name) = clean_entry_name(&relative) else {
                continue;
            };
            let size = std::fs::metadata(&path)?.len();
            budget.admit(&name, size)?;
            let data = std::fs::read(&path)?;
            budget.consume(&name, data.len() as u64)?;
            entries.push((name, data));
        }

        Ok(entries)
    }

    /// Run the RAR tool with its output captured to files, killing it at the deadline
    fn run_rar(&self, scratch: &Path, step: &str, args: &[&str]) -> Result<String, ExpandError> {
        let stdout_path = scratch.join(format!("{}.out", step));
        let stderr_path = scratch.join(format!("{}.err", step));

        let mut child = Command::new(&self.rar_binary)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(File::create(&stdout_path)?))
            .stderr(Stdio::from(File::create(&stderr_path)?))
            .spawn()
            .map_err(|e| ExpandError::Archive(format!("failed to run {}: {}", self.rar_binary, e)))?;

        let secs = self.limits.tool_timeout_secs;
        let deadline = Instant::now() + Duration::from_secs(secs);
        let status = loop {
            if let Some(status) = child.try_wait()? {
                break status;
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    warn!(error = %e, "Failed to kill {}", self.rar_binary);
                }
                child.wait()?;
                return Err(ExpandError::Timeout {
                    tool: format!("{} ({})", self.rar_binary, step),
                    secs,
                });
            }
            std::thread::sleep(Duration::from_millis(20));
        };

        if !status.success() {
            let stderr = String::from_utf8_lossy(&std::fs::read(&stderr_path)?).into_owned();
            return Err(ExpandError::Archive(format!(
                "{} {} exited with {}: {}",
                self.rar_binary,
                step,
                status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&std::fs::read(&stdout_path)?).into_owned())
    }
}

/// Declared (name, size) of every member in `unrar lt` output
fn parse_rar_listing(listing: &str) -> Vec<(String, u64)> {
    let mut entries = Vec::new();
    let mut name: Option<String> = None;
    for line in listing.lines().map(str::trim) {
        if let Some(value) = line.strip_prefix("Name:") {
            name = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("Size:") {
            if let (Some(member), Ok(size)) = (name.take(), value.trim().parse::<u64>()) {
                entries.push((member, size));
            }
        }
    }
    entries
}

/// Classify a blob by signature, falling back to its declared extension.
///
/// Zip-based document formats (docx, xlsx, odt, ...) are opaque: they are
/// files to convert, not folders to open.
pub fn classify(name: &str, content: &[u8]) -> ArchiveKind {
    let ext = extension_of(name);

    if content.starts_with(ZIP_LOCAL_HEADER) || content.starts_with(ZIP_EMPTY_ARCHIVE) {
        if ZIP_DOCUMENT_EXTENSIONS.contains(&ext.as_str()) || is_zip_document(content) {
            return ArchiveKind::Opaque;
        }
        return ArchiveKind::Zip;
    }
    if content.starts_with(RAR_SIGNATURE) {
        return ArchiveKind::Rar;
    }
    if content.starts_with(SEVEN_ZIP_SIGNATURE) {
        return ArchiveKind::SevenZip;
    }
    for (signature, compression) in [
        (GZIP_SIGNATURE, TarCompression::Gzip),
        (BZIP2_SIGNATURE, TarCompression::Bzip2),
        (XZ_SIGNATURE, TarCompression::Xz),
    ] {
        // a stream holding no tarball falls through to the extension check
        if content.starts_with(signature) && wraps_tar(content, compression) {
            return ArchiveKind::Tar(compression);
        }
    }
    if has_tar_magic(content) {
        return ArchiveKind::Tar(TarCompression::None);
    }

    // No usable signature: a declared archive extension means a damaged
    // archive, which must surface as an extraction failure, not a plain file
    let lower = name.to_lowercase();
    match ext.as_str() {
        ".zip" => ArchiveKind::Zip,
        ".rar" => ArchiveKind::Rar,
        ".7z" => ArchiveKind::SevenZip,
        ".tar" => ArchiveKind::Tar(TarCompression::None),
        ".tgz" => ArchiveKind::Tar(TarCompression::Gzip),
        ".tbz" | ".tbz2" => ArchiveKind::Tar(TarCompression::Bzip2),
        ".txz" => ArchiveKind::Tar(TarCompression::Xz),
        ".gz" if lower.ends_with(".tar.gz") => ArchiveKind::Tar(TarCompression::Gzip),
        ".bz2" if lower.ends_with(".tar.bz2") => ArchiveKind::Tar(TarCompression::Bzip2),
        ".xz" if lower.ends_with(".tar.xz") => ArchiveKind::Tar(TarCompression::Xz),
        _ => ArchiveKind::Opaque,
    }
}

fn has_tar_magic(content: &[u8]) -> bool {
    content.len() >= TAR_MAGIC_OFFSET + 5
        && &content[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + 5] == b"ustar"
}

fn wraps_tar(content: &[u8], compression: TarCompression) -> bool {
    let mut head = Vec::with_capacity(TAR_MAGIC_OFFSET + 8);
    let mut decoder = compression.decoder(content).take((TAR_MAGIC_OFFSET + 8) as u64);
    if decoder.read_to_end(&mut head).is_err() {
        return false;
    }
    has_tar_magic(&head)
}

fn is_zip_document(content: &[u8]) -> bool {
    match zip::ZipArchive::new(Cursor::new(content)) {
        Ok(archive) => archive
            .file_names()
            .any(|n| n == "[Content_Types].xml" || n == "mimetype"),
        Err(_) => false,
    }
}

/// Byte accounting for one archive expansion, committed only on success
struct ReadBudget<'a> {
    limits: &'a ExtractionLimits,
    already_extracted: u64,
    consumed: u64,
}

impl<'a> ReadBudget<'a> {
    fn new(limits: &'a ExtractionLimits, tracker: &ExtractionTracker) -> Self {
        Self {
            limits,
            already_extracted: tracker.bytes_extracted,
            consumed: 0,
        }
    }

    /// Reject an entry up front from its declared size
    fn admit(&self, name: &str, declared: u64) -> Result<(), LimitViolation> {
        self.limits.check_entry(name, declared)?;
        self.check_total(declared)
    }

    fn consume(&mut self, name: &str, actual: u64) -> Result<(), LimitViolation> {
        self.limits.check_entry(name, actual)?;
        self.check_total(actual)?;
        self.consumed += actual;
        Ok(())
    }

    fn check_total(&self, additional: u64) -> Result<(), LimitViolation> {
        let total = self.already_extracted + self.consumed + additional;
        if total > self.limits.max_total_bytes {
            return Err(LimitViolation::MaxTotalBytes {
                actual: total,
                limit: self.limits.max_total_bytes,
            });
        }
        Ok(())
    }

    /// Most bytes the next read may produce
    fn allowance(&self) -> u64 {
        let remaining = self
            .limits
            .max_total_bytes
            .saturating_sub(self.already_extracted + self.consumed);
        self.limits.max_entry_bytes.min(remaining)
    }

    /// Read an entry, never buffering more than one byte past the allowance
    fn read_entry<R: Read + ?Sized>(&mut self, name: &str, reader: &mut R) -> Result<Vec<u8>, ExpandError> {
        let allowance = self.allowance();
        let mut data = Vec::new();
        reader.take(allowance + 1).read_to_end(&mut data)?;
        self.consume(name, data.len() as u64)?;
        Ok(data)
    }
}

fn expand_zip(content: &[u8], budget: &mut ReadBudget<'_>) -> Result<Vec<(String, Vec<u8>)>, ExpandError> {
    let mut archive = zip::ZipArchive::new(Cursor::new(content))?;
    let mut entries = Vec::with_capacity(archive.len());

    for index in 0..archive.len() {
        let mut file = archive.by_index(index)?;
        if file.is_dir() {
            continue;
        }
        let Some(name) = clean_entry_name(file.name()) else {
            continue;
        };
        budget.admit(&name, file.size())?;
        let data = budget.read_entry(&name, &mut file)?;
        entries.push((name, data));
    }

    Ok(entries)
}

fn expand_tar(
    content: &[u8],
    compression: TarCompression,
    budget: &mut ReadBudget<'_>,
) -> Result<Vec<(String, Vec<u8>)>, ExpandError> {
    let mut archive = tar::Archive::new(compression.decoder(content));
    let mut entries = Vec::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let raw_name = entry.path()?.to_string_lossy().into_owned();
        let Some(name) = clean_entry_name(&raw_name) else {
            continue;
        };
        budget.admit(&name, entry.size())?;
        let data = budget.read_entry(&name, &mut entry)?;
        entries.push((name, data));
    }

    Ok(entries)
}

fn expand_seven_zip(
    content: &[u8],
    budget: &mut ReadBudget<'_>,
) -> Result<Vec<(String, Vec<u8>)>, ExpandError> {
    let mut archive = sevenz_rust::SevenZReader::new(
        Cursor::new(content),
        content.len() as u64,
        sevenz_rust::Password::empty(),
    )
    .map_err(|e| ExpandError::Archive(format!("7z error: {}", e)))?;

    let mut entries = Vec::new();
    let mut failure: Option<ExpandError> = None;

    archive
        .for_each_entries(|entry, reader| {
            if entry.is_directory() {
                return Ok(true);
            }
            let Some(name) = clean_entry_name(entry.name()) else {
                // Drain so the next entry of a solid block starts aligned
                std::io::copy(reader, &mut std::io::sink())?;
                return Ok(true);
            };
            match budget.read_entry(&name, reader) {
                Ok(data) => {
                    entries.push((name, data));
                    Ok(true)
                }
                Err(e) => {
                    failure = Some(e);
                    Ok(false)
                }
            }
        })
        .map_err(|e| ExpandError::Archive(format!("7z error: {}", e)))?;

    match failure {
        Some(e) => Err(e),
        None => Ok(entries),
    }
}

/// Normalize an archive member name; `None` for names that carry no file
fn clean_entry_name(raw: &str) -> Option<String> {
    let normalized = raw.replace('\\', "/");
    let parts: Vec<&str> = normalized
        .split('/')
        .filter(|p| !p.is_empty() && *p != "." && *p != "..")
        .collect();

    if parts.is_empty() || parts[0] == "__MACOSX" {
        return None;
    }
    Some(parts.join("/"))
}

/// Regular files below `root`, sorted by path
fn walk_files(root: &Path) -> std::io::Result<Vec<std::path::PathBuf>> {
    let mut files = Vec::new();
    let mut dirs = vec![root.to_path_buf()];

    while let Some(dir) = dirs.pop() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                dirs.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = zip::write::FileOptions::default();
        for (name, data) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, data) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(data.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder.append_data(&mut header, name, *data).unwrap();
        }
        builder.into_inner().unwrap()
    }

    fn tar_gz_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(&tar_bytes(files)).unwrap();
        encoder.finish().unwrap()
    }

    /// Stand-in `unrar` answering `lt` with `listing` and `x` by running `extract`
    #[cfg(unix)]
    fn fake_unrar(dir: &Path, listing: &str, extract: &str) -> String {
        use std::os::unix::fs::PermissionsExt;

        let script = dir.join("unrar");
        let body = format!(
            "#!/bin/sh\nif [ \"$1\" = \"lt\" ]; then\n{}\nexit 0\nfi\n{}\n",
            listing, extract
        );
        std::fs::write(&script, body).unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        script.to_string_lossy().into_owned()
    }

    const RAR_BYTES: &[u8] = b"Rar!\x1a\x07\x00 archive body";

    #[test]
    fn test_plain_file_is_single_leaf() {
        let extractor = Extractor::default();
        let leaves = extractor.extract("edital.pdf", b"%PDF-1.7 body".to_vec());

        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].path, "edital.pdf");
        assert_eq!(leaves[0].nesting_level, 0);
        assert!(!leaves[0].extraction_failed);
    }

    #[test]
    fn test_nested_zip_in_tar_gz() {
        let inner = zip_bytes(&[("anexo/planilha.csv", b"a,b\n1,2\n"), ("termo.txt", b"termo")]);
        let outer = tar_gz_bytes(&[("inner.zip", &inner), ("edital.pdf", b"%PDF-1.4")]);

        let leaves = Extractor::default().extract("docs.tar.gz", outer);
        let paths: Vec<&str> = leaves.iter().map(|l| l.path.as_str()).collect();

        assert_eq!(
            paths,
            vec![
                "docs.tar.gz/inner.zip/anexo/planilha.csv",
                "docs.tar.gz/inner.zip/termo.txt",
                "docs.tar.gz/edital.pdf",
            ]
        );
        assert_eq!(leaves[0].nesting_level, 2);
        assert_eq!(leaves[0].content, b"a,b\n1,2\n");
        assert_eq!(leaves[2].nesting_level, 1);
        assert!(leaves.iter().all(|l| !l.extraction_failed));
    }

    #[test]
    fn test_bzip2_and_xz_tarballs_expand() {
        let tar = tar_bytes(&[("edital.pdf", b"%PDF-1.4"), ("anexo/termo.txt", b"termo")]);

        let mut bz = bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
        bz.write_all(&tar).unwrap();
        let bz = bz.finish().unwrap();
        let mut xz = xz2::write::XzEncoder::new(Vec::new(), 6);
        xz.write_all(&tar).unwrap();
        let xz = xz.finish().unwrap();

        // signature wins over a misleading name
        assert_eq!(classify("pacote.bin", &bz), ArchiveKind::Tar(TarCompression::Bzip2));
        assert_eq!(classify("pacote.bin", &xz), ArchiveKind::Tar(TarCompression::Xz));

        for (name, bytes) in [("docs.tar.bz2", bz), ("docs.txz", xz)] {
            let leaves = Extractor::default().extract(name, bytes);
            let paths: Vec<&str> = leaves.iter().map(|l| l.path.as_str()).collect();
            assert_eq!(
                paths,
                vec![format!("{}/edital.pdf", name), format!("{}/anexo/termo.txt", name)]
            );
            assert_eq!(leaves[1].content, b"termo");
            assert!(leaves.iter().all(|l| !l.extraction_failed && l.nesting_level == 1));
        }
    }

    #[test]
    fn test_compressed_tar_extensions_without_signature() {
        assert_eq!(classify("a.tbz2", b"junk"), ArchiveKind::Tar(TarCompression::Bzip2));
        assert_eq!(classify("a.tar.bz2", b"junk"), ArchiveKind::Tar(TarCompression::Bzip2));
        assert_eq!(classify("a.txz", b"junk"), ArchiveKind::Tar(TarCompression::Xz));
        assert_eq!(classify("a.tar.xz", b"junk"), ArchiveKind::Tar(TarCompression::Xz));
        assert_eq!(classify("notas.xz", b"junk"), ArchiveKind::Opaque);
    }

    #[test]
    fn test_damaged_gzip_tarball_is_flagged() {
        // valid gzip header, then a deflate block of reserved type
        let damaged = b"\x1f\x8b\x08\x00\x00\x00\x00\x00\x00\x03\x07\x07\x07 rest".to_vec();
        assert_eq!(classify("docs.tar.gz", &damaged), ArchiveKind::Tar(TarCompression::Gzip));

        let leaves = Extractor::default().extract("docs.tgz", damaged.clone());
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].content, damaged);
        assert!(leaves[0].extraction_failed);

        // a gzipped file that is not a tarball stays a plain leaf
        let mut gz = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        gz.write_all(b"plain notes").unwrap();
        let gz = gz.finish().unwrap();
        assert_eq!(classify("notas.txt.gz", &gz), ArchiveKind::Opaque);
        assert!(!Extractor::default().extract("notas.txt.gz", gz)[0].extraction_failed);
    }

    #[cfg(unix)]
    #[test]
    fn test_rar_members_are_extracted_with_tool() {
        let dir = tempfile::TempDir::new().unwrap();
        let unrar = fake_unrar(
            dir.path(),
            "echo '        Name: edital.txt'\necho '        Type: File'\necho '        Size: 5'",
            "printf 'hello' > \"$6/edital.txt\"",
        );

        let leaves = Extractor::default()
            .with_rar_binary(unrar)
            .extract("docs.rar", RAR_BYTES.to_vec());
        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].path, "docs.rar/edital.txt");
        assert_eq!(leaves[0].content, b"hello");
        assert!(!leaves[0].extraction_failed);
    }

    #[cfg(unix)]
    #[test]
    fn test_oversized_rar_listing_stops_before_extraction() {
        let dir = tempfile::TempDir::new().unwrap();
        let marker = dir.path().join("extracted");
        let unrar = fake_unrar(
            dir.path(),
            "echo '        Name: bomb.bin'\necho '        Size: 999999999'",
            &format!("touch '{}'", marker.display()),
        );
        let limits = ExtractionLimits {
            max_entry_bytes: 1024,
            ..Default::default()
        };

        let leaves = Extractor::new(limits)
            .with_rar_binary(unrar)
            .extract("bomb.rar", RAR_BYTES.to_vec());
        assert_eq!(leaves.len(), 1);
        assert!(leaves[0].extraction_failed);
        assert_eq!(leaves[0].content, RAR_BYTES);
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_hung_rar_tool_is_killed() {
        let dir = tempfile::TempDir::new().unwrap();
        let unrar = fake_unrar(dir.path(), "sleep 30", "true");
        let limits = ExtractionLimits {
            tool_timeout_secs: 1,
            ..Default::default()
        };

        let started = Instant::now();
        let leaves = Extractor::new(limits)
            .with_rar_binary(unrar)
            .extract("slow.rar", RAR_BYTES.to_vec());
        assert!(leaves[0].extraction_failed);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_rar_listing_is_parsed() {
        let listing = "Archive: /tmp/archive.rar\nDetails: RAR 5\n\n        Name: a/edital.pdf\n        Type: File\n        Size: 1200\n Packed size: 900\n\n        Name: a\n        Type: Directory\n        Size: 0\n";
        assert_eq!(
            parse_rar_listing(listing),
            vec![("a/edital.pdf".to_string(), 1200), ("a".to_string(), 0)]
        );
    }

    #[test]
    fn test_corrupt_archive_degrades_to_original_bytes() {
        let garbage = b"PK\x03\x04 this is not really a zip".to_vec();
        let leaves = Extractor::default().extract("anexos.zip", garbage.clone());

        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].content, garbage);
        assert!(leaves[0].extraction_failed);
    }

    #[test]
    fn test_archive_extension_without_signature_is_failed_leaf() {
        let leaves = Extractor::default().extract("anexos.rar", b"plain text".to_vec());
        assert_eq!(leaves.len(), 1);
        assert!(leaves[0].extraction_failed);
    }

    #[test]
    fn test_office_documents_are_not_opened() {
        let docx = zip_bytes(&[("[Content_Types].xml", b"<Types/>"), ("word/document.xml", b"<w/>")]);
        assert_eq!(classify("relatorio.docx", &docx), ArchiveKind::Opaque);
        // Same bytes under a misleading name are still recognized
        assert_eq!(classify("relatorio.bin", &docx), ArchiveKind::Opaque);

        let leaves = Extractor::default().extract("relatorio.docx", docx);
        assert_eq!(leaves.len(), 1);
        assert!(!leaves[0].extraction_failed);
    }

    #[test]
    fn test_depth_cap_degrades_innermost_archive() {
        let level2 = zip_bytes(&[("deep.txt", b"deep")]);
        let level1 = zip_bytes(&[("level2.zip", &level2)]);
        let level0 = zip_bytes(&[("level1.zip", &level1)]);

        let limits = ExtractionLimits {
            max_depth: 2,
            ..Default::default()
        };
        let leaves = Extractor::new(limits).extract("root.zip", level0);

        assert_eq!(leaves.len(), 1);
        assert_eq!(leaves[0].path, "root.zip/level1.zip/level2.zip");
        assert!(leaves[0].extraction_failed);
        assert_eq!(leaves[0].content, level2);
    }

    #[test]
    fn test_total_bytes_cap_degrades_archive() {
        let big = vec![b'x'; 4096];
        let archive = zip_bytes(&[("a.txt", &big), ("b.txt", &big)]);
        let limits = ExtractionLimits {
            max_total_bytes: 5000,
            ..Default::default()
        };

        let leaves = Extractor::new(limits).extract("bomb.zip", archive.clone());
        assert_eq!(leaves.len(), 1);
        assert!(leaves[0].extraction_failed);
        assert_eq!(leaves[0].content, archive);
    }

    #[test]
    fn test_entry_cap_drops_excess_leaves() {
        let archive = zip_bytes(&[("1.txt", b"1"), ("2.txt", b"2"), ("3.txt", b"3")]);
        let limits = ExtractionLimits {
            max_entries: 2,
            ..Default::default()
        };
        let leaves = Extractor::new(limits).extract("many.zip", archive);
        assert_eq!(leaves.len(), 2);
    }

    #[test]
    fn test_entry_names_are_cleaned() {
        assert_eq!(clean_entry_name("./a/../b\\c.txt"), Some("a/b/c.txt".to_string()));
        assert_eq!(clean_entry_name("__MACOSX/._edital.pdf"), None);
        assert_eq!(clean_entry_name("/"), None);
    }
}
