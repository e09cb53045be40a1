//! On-disk embeddings snapshot.
//!
//! The offline embedding job writes three files into one directory: an
//! `N x D` float32 matrix of image embeddings, an index-aligned array of
//! filenames, and a provenance record. Both arrays use the NumPy `.npy`
//! container; this module parses the header directly and memory-maps the
//! matrix payload so large corpora are not materialized before first use.

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

pub const EMBEDDINGS_FILE: &str = "image_embeddings.npy";
pub const FILENAMES_FILE: &str = "image_filenames.npy";
pub const METADATA_FILE: &str = "metadata.json";

const NPY_MAGIC: &[u8] = b"\x93NUMPY";

/// Provenance record written by the embedding job alongside the arrays.
/// Informational only; never read on the query path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMetadata {
    pub timestamp: DateTime<Utc>,
    pub model: String,
    pub pretrained: String,
    pub device: String,
    pub images_processed: usize,
    pub images_failed: usize,
    pub failed_images: Vec<String>,
    pub embedding_dimension: usize,
    pub total_time_seconds: f64,
    pub avg_time_per_image_seconds: f64,
    pub memory_used_mb: f64,
}

#[derive(Debug)]
struct NpyHeader {
    descr: String,
    fortran_order: bool,
    shape: Vec<usize>,
    data_offset: usize,
}

fn parse_npy_header(bytes: &[u8]) -> Result<NpyHeader> {
    if bytes.len() < 10 || &bytes[..6] != NPY_MAGIC {
        bail!("not a .npy file (bad magic)");
    }
    let major = bytes[6];

    let (header_len, header_start) = match major {
        1 => {
            let len = u16::from_le_bytes([bytes[8], bytes[9]]) as usize;
            (len, 10)
        }
        2 | 3 => {
            if bytes.len() < 12 {
                bail!("truncated .npy header");
            }
            let len = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
            (len, 12)
        }
        v => bail!("unsupported .npy version: {}", v),
    };

    let data_offset = header_start + header_len;
    if bytes.len() < data_offset {
        bail!("truncated .npy header");
    }
    let header = std::str::from_utf8(&bytes[header_start..data_offset])
        .context("non-utf8 .npy header")?;

    let descr = extract_quoted(header, "descr").context("missing 'descr' in .npy header")?;
    let fortran_order = extract_after(header, "fortran_order")
        .map(|rest| rest.starts_with("True"))
        .context("missing 'fortran_order' in .npy header")?;
    let shape = parse_shape(header).context("missing 'shape' in .npy header")?;

    Ok(NpyHeader {
        descr,
        fortran_order,
        shape,
        data_offset,
    })
}

/// Value of `'key': '<value>'` in the header dict.
fn extract_quoted(header: &str, key: &str) -> Option<String> {
    let rest = extract_after(header, key)?;
    let open = rest.find('\'')?;
    let rest = &rest[open + 1..];
    let close = rest.find('\'')?;
    Some(rest[..close].to_string())
}

/// Everything after `'key':` in the header dict.
fn extract_after<'a>(header: &'a str, key: &str) -> Option<&'a str> {
    let pattern = format!("'{}':", key);
    let pos = header.find(&pattern)?;
    Some(header[pos + pattern.len()..].trim_start())
}

fn parse_shape(header: &str) -> Option<Vec<usize>> {
    let rest = extract_after(header, "shape")?;
    let open = rest.find('(')?;
    let close = rest.find(')')?;
    let inner = &rest[open + 1..close];
    let mut dims = Vec::new();
    for part in inner.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        dims.push(part.parse().ok()?);
    }
    Some(dims)
}

/// Lazy, memory-mapped view of the `N x D` float32 embeddings array.
///
/// Rows are decoded on demand; nothing is materialized until
/// [`crate::store::EmbeddingStore::to_scoring_matrix`] builds the dense
/// scoring copy. The mapped file must not be mutated by the process.
#[derive(Debug)]
pub struct EmbeddingsFile {
    mmap: Mmap,
    rows: usize,
    dim: usize,
    data_offset: usize,
}

impl EmbeddingsFile {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("failed to mmap {}", path.display()))?;

        let header = parse_npy_header(&mmap)?;
        if header.descr != "<f4" {
            bail!(
                "embeddings array must be little-endian float32, got dtype '{}'",
                header.descr
            );
        }
        if header.fortran_order {
            bail!("embeddings array must be C-contiguous");
        }
        if header.shape.len() != 2 {
            bail!(
                "embeddings array must be 2-dimensional, got shape {:?}",
                header.shape
            );
        }
        let (rows, dim) = (header.shape[0], header.shape[1]);
        if dim == 0 {
            bail!("embeddings array has zero dimension");
        }

        let expected = header.data_offset + rows * dim * 4;
        if mmap.len() < expected {
            bail!(
                "embeddings payload truncated: expected {} bytes, file has {}",
                expected,
                mmap.len()
            );
        }

        Ok(Self {
            mmap,
            rows,
            dim,
            data_offset: header.data_offset,
        })
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Decode row `i` into `out`. Panics if `i >= rows` or `out` has the
    /// wrong length; callers index within bounds by construction.
    pub fn read_row(&self, i: usize, out: &mut [f32]) {
        assert!(i < self.rows, "row index out of bounds");
        assert_eq!(out.len(), self.dim, "output slice has wrong length");
        let start = self.data_offset + i * self.dim * 4;
        let bytes = &self.mmap[start..start + self.dim * 4];
        for (dst, chunk) in out.iter_mut().zip(bytes.chunks_exact(4)) {
            *dst = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }
}

/// Eagerly read the filenames array (fixed-width little-endian UCS-4).
///
/// Pickled object arrays are rejected: the snapshot contract is a plain
/// unicode array, and unpickling foreign bytes is not something this side
/// of the boundary will ever do.
pub fn read_filenames(path: &Path) -> Result<Vec<String>> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let header = parse_npy_header(&bytes)?;

    if header.descr.starts_with("|O") {
        bail!("filenames array is a pickled object array; re-export it as a unicode array");
    }
    let width: usize = header
        .descr
        .strip_prefix("<U")
        .and_then(|w| w.parse().ok())
        .ok_or_else(|| {
            anyhow!(
                "filenames array must be little-endian unicode ('<U*'), got dtype '{}'",
                header.descr
            )
        })?;
    if header.shape.len() != 1 {
        bail!(
            "filenames array must be 1-dimensional, got shape {:?}",
            header.shape
        );
    }

    let count = header.shape[0];
    let item_bytes = width * 4;
    let expected = header.data_offset + count * item_bytes;
    if bytes.len() < expected {
        bail!("filenames payload truncated");
    }

    let mut names = Vec::with_capacity(count);
    for i in 0..count {
        let start = header.data_offset + i * item_bytes;
        let item = &bytes[start..start + item_bytes];
        let mut name = String::with_capacity(width);
        for chunk in item.chunks_exact(4) {
            let code = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
            if code == 0 {
                break; // NUL padding marks end of element
            }
            let c = char::from_u32(code)
                .ok_or_else(|| anyhow!("invalid codepoint {:#x} in filename {}", code, i))?;
            name.push(c);
        }
        names.push(name);
    }
    Ok(names)
}

fn npy_header_bytes(descr: &str, shape: &str) -> Vec<u8> {
    let mut dict = format!(
        "{{'descr': '{}', 'fortran_order': False, 'shape': {}, }}",
        descr, shape
    );
    // Pad so the payload starts on a 64-byte boundary, newline-terminated.
    let unpadded = NPY_MAGIC.len() + 4 + dict.len() + 1;
    let padding = (64 - unpadded % 64) % 64;
    dict.push_str(&" ".repeat(padding));
    dict.push('\n');

    let mut out = Vec::with_capacity(NPY_MAGIC.len() + 4 + dict.len());
    out.extend_from_slice(NPY_MAGIC);
    out.push(1);
    out.push(0);
    out.extend_from_slice(&(dict.len() as u16).to_le_bytes());
    out.extend_from_slice(dict.as_bytes());
    out
}

/// Write a float32 matrix in `.npy` v1 format. Used by producer-side tooling
/// and test fixtures; the engine itself only reads.
pub fn write_embeddings(path: &Path, rows: usize, dim: usize, data: &[f32]) -> Result<()> {
    if data.len() != rows * dim {
        bail!(
            "data length {} does not match shape ({}, {})",
            data.len(),
            rows,
            dim
        );
    }
    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&npy_header_bytes("<f4", &format!("({}, {})", rows, dim)))?;
    for value in data {
        writer.write_all(&value.to_le_bytes())?;
    }
    writer.flush()?;
    Ok(())
}

/// Write a filenames array in `.npy` v1 format (fixed-width unicode).
pub fn write_filenames(path: &Path, names: &[String]) -> Result<()> {
    let width = names
        .iter()
        .map(|n| n.chars().count())
        .max()
        .unwrap_or(0)
        .max(1);

    let file = File::create(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&npy_header_bytes(
        &format!("<U{}", width),
        &format!("({},)", names.len()),
    ))?;
    for name in names {
        let mut written = 0;
        for c in name.chars() {
            writer.write_all(&(c as u32).to_le_bytes())?;
            written += 1;
        }
        for _ in written..width {
            writer.write_all(&0u32.to_le_bytes())?;
        }
    }
    writer.flush()?;
    Ok(())
}

/// Result of a model-free snapshot sanity check.
#[derive(Debug, Clone, Serialize)]
pub struct SnapshotReport {
    pub embeddings_present: bool,
    pub filenames_present: bool,
    pub metadata_present: bool,
    pub rows: Option<usize>,
    pub dimension: Option<usize>,
    pub filename_count: Option<usize>,
    pub consistent: bool,
}

/// Inspect a snapshot directory without loading any model: file presence,
/// shape, and row/filename-count consistency.
pub fn inspect(dir: &Path) -> SnapshotReport {
    let embeddings_path = dir.join(EMBEDDINGS_FILE);
    let filenames_path = dir.join(FILENAMES_FILE);

    let mut report = SnapshotReport {
        embeddings_present: embeddings_path.exists(),
        filenames_present: filenames_path.exists(),
        metadata_present: dir.join(METADATA_FILE).exists(),
        rows: None,
        dimension: None,
        filename_count: None,
        consistent: false,
    };

    if report.embeddings_present {
        match EmbeddingsFile::open(&embeddings_path) {
            Ok(emb) => {
                report.rows = Some(emb.rows());
                report.dimension = Some(emb.dim());
            }
            Err(e) => tracing::warn!(error = %e, "embeddings file unreadable"),
        }
    }
    if report.filenames_present {
        match read_filenames(&filenames_path) {
            Ok(names) => report.filename_count = Some(names.len()),
            Err(e) => tracing::warn!(error = %e, "filenames file unreadable"),
        }
    }

    report.consistent = match (report.rows, report.filename_count) {
        (Some(rows), Some(count)) => rows == count,
        _ => false,
    };
    report
}
