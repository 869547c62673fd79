//! Selective tar archive reading.
//!
//! Streams a tar archive (optionally gzip-compressed) and either extracts
//! entries matching a caller predicate - to memory or to individual files -
//! or fully unpacks the archive into a directory. Compression is sniffed
//! from the stream, so callers never need to know whether a layer tar was
//! gzipped.

use std::collections::HashMap;
use std::fs;
use std::io::{self, BufRead, BufReader, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use layersift_core::error::{Result, ScanError};
use tar::Archive;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Wrap a raw stream, transparently decoding gzip when the magic matches.
fn maybe_gzip<'a, R: Read + 'a>(reader: R) -> io::Result<Box<dyn Read + 'a>> {
    let mut buffered = BufReader::new(reader);
    let head = buffered.fill_buf()?;
    if head.len() >= 2 && head[..2] == GZIP_MAGIC {
        Ok(Box::new(GzDecoder::new(buffered)))
    } else {
        Ok(Box::new(buffered))
    }
}

/// Extract every regular file accepted by `selected` into memory.
///
/// Entries larger than `max_size` (when positive) are skipped silently.
/// Returns the in-archive pathname mapped to the full file contents.
pub fn extract_to_memory<R, F>(
    reader: R,
    selected: F,
    max_size: i64,
) -> Result<HashMap<String, Vec<u8>>>
where
    R: Read,
    F: Fn(&str) -> bool,
{
    let mut archive = Archive::new(maybe_gzip(reader)?);
    let mut files = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        if !selected(&name) {
            continue;
        }
        if max_size > 0 && entry.size() as i64 > max_size {
            continue;
        }
        let mut data = Vec::with_capacity(entry.size() as usize);
        entry.read_to_end(&mut data)?;
        files.insert(name, data);
    }

    Ok(files)
}

/// Extract every regular file accepted by `selected` as an individual file
/// under `dest_dir`, flattening the in-archive path (`/` becomes `_`).
///
/// Returns the in-archive pathname mapped to the on-disk path.
pub fn extract_to_disk<R, F>(
    reader: R,
    selected: F,
    dest_dir: &Path,
) -> Result<HashMap<String, PathBuf>>
where
    R: Read,
    F: Fn(&str) -> bool,
{
    fs::create_dir_all(dest_dir)?;

    let mut archive = Archive::new(maybe_gzip(reader)?);
    let mut files = HashMap::new();

    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path()?.to_string_lossy().into_owned();
        if !selected(&name) {
            continue;
        }
        let out_path = dest_dir.join(name.replace('/', "_"));
        let mut out = fs::File::create(&out_path)?;
        io::copy(&mut entry, &mut out)?;
        files.insert(name, out_path);
    }

    Ok(files)
}

/// Fully unpack a tar (or gzipped tar) stream into `dest_dir`, honoring
/// regular files, directories, symlinks and hardlinks.
///
/// Returns the decompressed payload byte count. A non-negative `limit`
/// makes the call fail once more than `limit` bytes have been written.
pub fn extract_all<R: Read>(reader: R, dest_dir: &Path, limit: i64) -> Result<u64> {
    fs::create_dir_all(dest_dir)?;

    let mut archive = Archive::new(maybe_gzip(reader)?);
    let mut written: u64 = 0;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let size = entry.size();
        // unpack_in rejects entries that would escape dest_dir
        if entry.unpack_in(dest_dir)? && entry.header().entry_type().is_file() {
            written += size;
        }
        if limit >= 0 && written as i64 > limit {
            return Err(ScanError::FileSystem(format!(
                "archive exceeds size limit of {} bytes",
                limit
            )));
        }
    }

    Ok(written)
}
