//! Record-aware CSV chunking that never corrupts records.
//!
//! Uses the `csv` crate to properly handle embedded commas and newlines within
//! quoted fields. Splits large CSV files into upload fragments no larger than
//! a byte limit, with every fragment carrying the header row. Fragments are
//! always UTF-8 regardless of the source encoding.

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use csv::{ByteRecord, ReaderBuilder, Terminator, WriterBuilder};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::InputEncoding;
use crate::datacloud::BULK_API_MAX_PAYLOAD_SIZE;
use crate::error::AppError;

const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

/// Configuration for CSV chunking.
#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Maximum bytes per fragment, header included.
    pub max_bytes: u64,
    /// Encoding of the source file.
    pub encoding: InputEncoding,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_bytes: BULK_API_MAX_PAYLOAD_SIZE,
            encoding: InputEncoding::Utf8,
        }
    }
}

impl ChunkConfig {
    /// Sets the max_bytes limit.
    pub fn max_bytes(mut self, bytes: u64) -> Self {
        self.max_bytes = bytes;
        self
    }

    /// Sets the source encoding.
    pub fn encoding(mut self, encoding: InputEncoding) -> Self {
        self.encoding = encoding;
        self
    }
}

/// Result of splitting a CSV file into fragments.
#[derive(Debug, Clone)]
pub struct ChunkResult {
    /// Paths to the generated fragment files, in source order.
    pub chunk_paths: Vec<PathBuf>,
    /// Total data rows processed (excluding headers).
    pub total_rows: u64,
    /// Number of data rows in each fragment (parallel to chunk_paths).
    pub rows_per_chunk: Vec<u64>,
}

/// A fragment that has been written and closed, awaiting its consumer.
///
/// The splitter does not cut the next fragment until this one is released
/// or dropped, so at most one fragment is on disk at a time.
#[derive(Debug)]
pub struct Fragment {
    /// Path of the fragment file.
    pub path: PathBuf,
    /// Number of data rows in the fragment.
    pub rows: u64,
    resume: oneshot::Sender<()>,
}

impl Fragment {
    /// Lets the splitter continue with the next fragment.
    ///
    /// Dropping a fragment without releasing it stops the split instead.
    pub fn release(self) {
        let _ = self.resume.send(());
    }
}

/// Fragments of one source file, produced one at a time on a blocking thread.
pub struct FragmentStream {
    fragments: mpsc::Receiver<Fragment>,
    task: JoinHandle<Result<u64, AppError>>,
}

impl FragmentStream {
    /// Waits for the next fragment. `None` once the splitter has stopped.
    pub async fn next(&mut self) -> Option<Fragment> {
        self.fragments.recv().await
    }

    /// Waits for the splitter to stop and returns the number of data rows
    /// it wrote, or the error that stopped it.
    pub async fn finish(self) -> Result<u64, AppError> {
        drop(self.fragments);
        self.task
            .await
            .map_err(|e| AppError::CsvChunkError(format!("Task join error: {}", e)))?
    }
}

/// Splits a CSV file into fragments handed over as each one is finished.
///
/// Same fragment layout as [`split_file`]. The caller consumes each
/// [`Fragment`] and releases it before the next one is written.
///
/// # Arguments
///
/// * `source` - Path to the source CSV file
/// * `temp_dir` - Directory where fragment files will be created
/// * `config` - Byte limit and source encoding
///
/// Errors from reading or writing surface through [`FragmentStream::finish`].
pub fn stream_fragments(source: &Path, temp_dir: &Path, config: ChunkConfig) -> FragmentStream {
    let (sender, fragments) = mpsc::channel(1);
    let source = source.to_owned();
    let temp_dir = temp_dir.to_owned();

    let task = tokio::task::spawn_blocking(move || {
        split_file_blocking(&source, &temp_dir, config, |path, rows| {
            let (resume, resumed) = oneshot::channel();
            sender
                .blocking_send(Fragment { path, rows, resume })
                .map_err(|_| consumer_stopped())?;
            resumed.blocking_recv().map_err(|_| consumer_stopped())
        })
    });

    FragmentStream { fragments, task }
}

fn consumer_stopped() -> AppError {
    AppError::CsvChunkError("Fragment consumer stopped before the split finished".to_string())
}

/// Splits a CSV file into multiple fragment files.
///
/// Each fragment includes the original header row and stays within
/// `config.max_bytes`, except when a single record is larger than the limit;
/// such a record is written alone rather than split.
///
/// # Arguments
///
/// * `source` - Path to the source CSV file
/// * `temp_dir` - Directory where fragment files will be created
/// * `config` - Byte limit and source encoding
///
/// # Errors
///
/// Returns `AppError::CsvChunkError` if the source file cannot be read,
/// has no header, or if fragment files cannot be written, and
/// `AppError::NotUtf8` when a UTF-8 source contains invalid bytes.
pub async fn split_file(
    source: &Path,
    temp_dir: &Path,
    config: ChunkConfig,
) -> Result<ChunkResult, AppError> {
    let source = source.to_owned();
    let temp_dir = temp_dir.to_owned();

    tokio::task::spawn_blocking(move || {
        let mut chunk_paths = Vec::new();
        let mut rows_per_chunk = Vec::new();
        let total_rows = split_file_blocking(&source, &temp_dir, config, |path, rows| {
            chunk_paths.push(path);
            rows_per_chunk.push(rows);
            Ok(())
        })?;

        Ok(ChunkResult {
            chunk_paths,
            total_rows,
            rows_per_chunk,
        })
    })
    .await
    .map_err(|e| AppError::CsvChunkError(format!("Task join error: {}", e)))?
}

/// Blocking implementation of CSV file splitting.
///
/// `on_fragment` receives each fragment after its file is flushed and
/// closed, and must return before the next fragment is created.
fn split_file_blocking<F>(
    source: &Path,
    temp_dir: &Path,
    config: ChunkConfig,
    mut on_fragment: F,
) -> Result<u64, AppError>
where
    F: FnMut(PathBuf, u64) -> Result<(), AppError>,
{
    std::fs::create_dir_all(temp_dir)
        .map_err(|e| AppError::CsvChunkError(format!("Failed to create temp directory: {}", e)))?;

    let file = File::open(source)
        .map_err(|e| AppError::CsvChunkError(format!("Failed to open source file: {}", e)))?;

    let mut reader = ReaderBuilder::new()
        .has_headers(true)
        .flexible(false)
        .from_reader(BufReader::new(file));

    let raw_headers = reader
        .byte_headers()
        .map_err(|e| AppError::CsvChunkError(format!("Failed to read CSV headers: {}", e)))?
        .clone();

    if raw_headers.is_empty() {
        return Err(AppError::CsvChunkError(
            "CSV file has no header row".to_string(),
        ));
    }

    let headers = strip_bom(transcode_record(&raw_headers, config.encoding)?);
    let header_bytes = serialize_record(&headers)?;
    let header_size = header_bytes.len() as u64;

    let stem = source
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("chunk")
        .to_string();

    #[cfg(debug_assertions)]
    tracing::debug!(
        source = %source.display(),
        header_size,
        max_bytes = config.max_bytes,
        "Starting CSV chunking"
    );

    let mut chunk_count: usize = 0;
    let mut total_rows: u64 = 0;

    let mut current: Option<(ChunkWriter, PathBuf)> = None;
    let mut current_chunk_bytes: u64 = 0;
    let mut current_chunk_rows: u64 = 0;

    // Reusable buffer for measuring record sizes
    let mut measure_buf: Vec<u8> = Vec::with_capacity(4096);

    for result in reader.byte_records() {
        let raw = result
            .map_err(|e| AppError::CsvChunkError(format!("Failed to read CSV record: {}", e)))?;
        let record = transcode_record(&raw, config.encoding)?;

        measure_buf.clear();
        serialize_record_into(&record, &mut measure_buf)?;
        let record_size = measure_buf.len() as u64;

        let need_new_chunk = current.is_none()
            || would_exceed_limit(current_chunk_bytes, current_chunk_rows, record_size, &config);

        if need_new_chunk {
            if let Some((writer, path)) = current.take() {
                writer.close()?;

                #[cfg(debug_assertions)]
                tracing::debug!(
                    chunk_index = chunk_count - 1,
                    rows = current_chunk_rows,
                    bytes = current_chunk_bytes,
                    "Completed chunk"
                );

                on_fragment(path, current_chunk_rows)?;
            }

            let chunk_path = temp_dir.join(format!("{}_{:04}.csv", stem, chunk_count));
            let mut writer = ChunkWriter::new(&chunk_path)?;
            writer.write_bytes(&header_bytes)?;

            chunk_count += 1;
            current_chunk_bytes = header_size;
            current_chunk_rows = 0;
            current = Some((writer, chunk_path));
        }

        if let Some((ref mut writer, _)) = current {
            writer.write_bytes(&measure_buf)?;
            current_chunk_bytes += record_size;
            current_chunk_rows += 1;
            total_rows += 1;
        }
    }

    if let Some((writer, path)) = current.take() {
        writer.close()?;
        on_fragment(path, current_chunk_rows)?;
    }

    #[cfg(debug_assertions)]
    tracing::debug!(total_rows, chunk_count, "CSV chunking complete");

    Ok(total_rows)
}

/// Checks if adding a record would push the fragment over the byte limit.
fn would_exceed_limit(
    current_bytes: u64,
    current_rows: u64,
    record_size: u64,
    config: &ChunkConfig,
) -> bool {
    // The first record after the header is always accepted, so a record
    // larger than max_bytes still gets a fragment of its own.
    if current_rows == 0 {
        return false;
    }

    current_bytes + record_size > config.max_bytes
}

/// Converts a record from the source encoding to UTF-8.
fn transcode_record(record: &ByteRecord, encoding: InputEncoding) -> Result<ByteRecord, AppError> {
    match encoding {
        InputEncoding::Utf8 => {
            if record.iter().any(|field| std::str::from_utf8(field).is_err()) {
                return Err(AppError::NotUtf8);
            }
            Ok(record.clone())
        }
        InputEncoding::Latin1 => Ok(record
            .iter()
            .map(|field| field.iter().map(|&b| b as char).collect::<String>())
            .collect::<Vec<String>>()
            .iter()
            .map(|field| field.as_bytes())
            .collect()),
    }
}

/// Removes a UTF-8 byte order mark from the first header field.
fn strip_bom(headers: ByteRecord) -> ByteRecord {
    match headers.get(0) {
        Some(first) if first.starts_with(UTF8_BOM) => {
            let mut stripped = ByteRecord::new();
            stripped.push_field(&first[UTF8_BOM.len()..]);
            for field in headers.iter().skip(1) {
                stripped.push_field(field);
            }
            stripped
        }
        _ => headers,
    }
}

/// Serializes a ByteRecord to bytes using CRLF terminator.
fn serialize_record(record: &ByteRecord) -> Result<Vec<u8>, AppError> {
    let mut buf = Vec::with_capacity(record.len() * 32);
    serialize_record_into(record, &mut buf)?;
    Ok(buf)
}

/// Serializes a ByteRecord into an existing buffer using CRLF terminator.
fn serialize_record_into(record: &ByteRecord, buf: &mut Vec<u8>) -> Result<(), AppError> {
    let mut writer = WriterBuilder::new()
        .has_headers(false)
        .terminator(Terminator::CRLF)
        .from_writer(buf);

    writer
        .write_byte_record(record)
        .map_err(|e| AppError::CsvChunkError(format!("Failed to serialize record: {}", e)))?;

    writer
        .flush()
        .map_err(|e| AppError::CsvChunkError(format!("Failed to flush writer: {}", e)))?;

    Ok(())
}

/// Wrapper for writing to a fragment file.
struct ChunkWriter {
    writer: BufWriter<File>,
}

impl ChunkWriter {
    fn new(path: &Path) -> Result<Self, AppError> {
        let file = File::create(path)
            .map_err(|e| AppError::CsvChunkError(format!("Failed to create chunk file: {}", e)))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<(), AppError> {
        self.writer
            .write_all(bytes)
            .map_err(|e| AppError::CsvChunkError(format!("Failed to write to chunk: {}", e)))
    }

    /// Flushes and closes the file.
    fn close(mut self) -> Result<(), AppError> {
        self.writer
            .flush()
            .map_err(|e| AppError::CsvChunkError(format!("Failed to flush chunk: {}", e)))
    }
}
