//! Archive packaging for file transfers.
//!
//! Outgoing entries are written into a gzip-compressed tar stream that is
//! cut into fixed-size parts (`name.0`, `name.1`, ...) while it is produced,
//! so memory use does not depend on the archive size. The receiver chains
//! the parts back in numeric order and unpacks them.

use crate::error::{PipelineError, PipelineResult};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

/// `Write` sink that spreads its input over numbered part files.
pub struct SplitWriter {
    dir: PathBuf,
    name: String,
    chunk_size: usize,
    current: Option<File>,
    written: usize,
    parts: Vec<String>,
}

impl SplitWriter {
    pub fn new(dir: impl Into<PathBuf>, name: impl Into<String>, chunk_size: usize) -> Self {
        Self {
            dir: dir.into(),
            name: name.into(),
            chunk_size: chunk_size.max(1),
            current: None,
            written: 0,
            parts: Vec::new(),
        }
    }

    fn next_part(&mut self) -> io::Result<()> {
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }
        let part = format!("{}.{}", self.name, self.parts.len());
        self.current = Some(File::create(self.dir.join(&part))?);
        self.parts.push(part);
        self.written = 0;
        Ok(())
    }

    /// Flush the last part and return the part names in order.
    pub fn finish(mut self) -> io::Result<Vec<String>> {
        if self.parts.is_empty() {
            self.next_part()?;
        }
        if let Some(mut file) = self.current.take() {
            file.flush()?;
        }
        Ok(self.parts)
    }
}

impl Write for SplitWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.current.is_none() || self.written >= self.chunk_size {
            self.next_part()?;
        }
        let room = self.chunk_size - self.written;
        let Some(file) = self.current.as_mut() else {
            return Err(io::Error::other("no open archive part"));
        };
        let n = file.write(&buf[..buf.len().min(room)])?;
        self.written += n;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.current.as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

/// Numeric suffix of a part name, `archive.tar.gz.12` → 12.
pub fn part_index(name: &str) -> Option<u64> {
    name.rsplit_once('.').and_then(|(_, suffix)| suffix.parse().ok())
}

/// Sort part names by numeric suffix. Names without one keep their
/// relative order at the end.
pub fn sort_parts(parts: &mut [String]) {
    parts.sort_by_key(|name| part_index(name).unwrap_or(u64::MAX));
}

/// Options of one archive.
#[derive(Debug, Clone)]
pub struct ArchiveOptions {
    /// Directory the entries are read from.
    pub source: PathBuf,
    /// Top-level files and directories to include.
    pub entries: Vec<String>,
    /// Directory the parts are written to.
    pub destination: PathBuf,
    pub name: String,
    pub chunk_size: usize,
    pub compression_level: u32,
}

/// Build a chunked `.tar.gz` and return its part names.
///
/// # Errors
///
/// Returns `PipelineError::NetworkTransfer` if the archive cannot be written.
pub async fn create_archive(options: ArchiveOptions) -> PipelineResult<Vec<String>> {
    let name = options.name.clone();
    tokio::task::spawn_blocking(move || write_archive(&options))
        .await
        .map_err(|e| PipelineError::NetworkTransfer(format!("Archive task for {name} failed: {e}")))?
        .map_err(|e| PipelineError::NetworkTransfer(format!("Failed to archive {name}: {e}")))
}

fn write_archive(options: &ArchiveOptions) -> io::Result<Vec<String>> {
    let writer = SplitWriter::new(&options.destination, &options.name, options.chunk_size);
    let encoder = GzEncoder::new(writer, Compression::new(options.compression_level.min(9)));
    let mut builder = tar::Builder::new(encoder);

    for entry in &options.entries {
        let path = options.source.join(entry);
        if path.is_dir() {
            builder.append_dir_all(entry, &path)?;
        } else {
            builder.append_path_with_name(&path, entry)?;
        }
    }

    let encoder = builder.into_inner()?;
    encoder.finish()?.finish()
}

struct PartReader {
    files: std::vec::IntoIter<PathBuf>,
    current: Option<BufReader<File>>,
}

impl Read for PartReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                let n = reader.read(buf)?;
                if n > 0 || buf.is_empty() {
                    return Ok(n);
                }
            }
            match self.files.next() {
                Some(path) => self.current = Some(BufReader::new(File::open(path)?)),
                None => return Ok(0),
            }
        }
    }
}

/// Reassemble `parts` found in `dir`, unpack them into `destination` and
/// delete the parts.
///
/// # Errors
///
/// Returns `PipelineError::NetworkTransfer` if a part is missing or the
/// archive is corrupt.
pub async fn extract_parts(
    dir: &Path,
    parts: &[String],
    destination: &Path,
) -> PipelineResult<()> {
    let mut parts = parts.to_vec();
    sort_parts(&mut parts);
    let paths: Vec<PathBuf> = parts.iter().map(|part| dir.join(part)).collect();
    let destination = destination.to_path_buf();

    let to_remove = paths.clone();
    tokio::task::spawn_blocking(move || -> io::Result<()> {
        std::fs::create_dir_all(&destination)?;
        let reader = PartReader {
            files: paths.into_iter(),
            current: None,
        };
        tar::Archive::new(GzDecoder::new(reader)).unpack(&destination)
    })
    .await
    .map_err(|e| PipelineError::NetworkTransfer(format!("Extraction task failed: {e}")))?
    .map_err(|e| PipelineError::NetworkTransfer(format!("Failed to extract files: {e}")))?;

    for path in to_remove {
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(PipelineError::io(&path, e)),
        }
    }
    Ok(())
}

/// Move everything in `transfer` into `system` and return the moved names.
pub async fn stage_transfer(transfer: &Path, system: &Path) -> PipelineResult<Vec<String>> {
    let mut entries = match tokio::fs::read_dir(transfer).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(PipelineError::io(transfer, e)),
    };

    tokio::fs::create_dir_all(system)
        .await
        .map_err(|e| PipelineError::io(system, e))?;

    let mut staged = Vec::new();
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| PipelineError::io(transfer, e))?
    {
        let name = entry.file_name().to_string_lossy().into_owned();
        let target = system.join(&name);
        tokio::fs::rename(entry.path(), &target)
            .await
            .map_err(|e| PipelineError::io(&target, e))?;
        staged.push(name);
    }
    staged.sort();
    Ok(staged)
}
