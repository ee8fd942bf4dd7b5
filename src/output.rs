//! Output handling: path preflight, bitmap normalization, PNG encoding and
//! the final write.

use crate::{Bitmap, Error, Result};
use image::{ImageFormat, Rgba};
use sha2::{Digest, Sha256};
use std::fs;
use std::io::{Cursor, Write};
use std::path::Path;

const BACKGROUND: Rgba<u8> = Rgba([255, 255, 255, 255]);

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    }
}

/// Check that `path` can be written without creating it.
///
/// Probes the parent directory with a temporary file that is removed again.
pub fn preflight(path: &Path) -> Result<()> {
    if path.is_dir() {
        return Err(Error::EncodeOrWriteFailure(format!(
            "{} is a directory",
            path.display()
        )));
    }
    if let Ok(meta) = fs::metadata(path) {
        if meta.permissions().readonly() {
            return Err(Error::EncodeOrWriteFailure(format!(
                "{} is read-only",
                path.display()
            )));
        }
    }

    let dir = parent_dir(path);
    if !dir.is_dir() {
        return Err(Error::EncodeOrWriteFailure(format!(
            "directory {} does not exist",
            dir.display()
        )));
    }

    tempfile::Builder::new()
        .prefix(".uri2png-")
        .tempfile_in(dir)
        .map(drop)
        .map_err(|e| {
            Error::EncodeOrWriteFailure(format!("{} is not writable: {}", dir.display(), e))
        })
}

/// Crop or pad `bitmap` to exactly `width x height`.
///
/// Pixels beyond the target are dropped; missing area is filled with an
/// opaque white background.
pub fn normalize(bitmap: Bitmap, width: u32, height: u32) -> Bitmap {
    if bitmap.dimensions() == (width, height) {
        return bitmap;
    }
    let mut canvas = Bitmap::from_pixel(width, height, BACKGROUND);
    image::imageops::replace(&mut canvas, &bitmap, 0, 0);
    canvas
}

/// Encode a bitmap as PNG.
pub fn encode_png(bitmap: &Bitmap) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    bitmap.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
    Ok(buf)
}

/// Decode PNG bytes produced by an engine into a bitmap.
pub fn decode_png(bytes: &[u8]) -> Result<Bitmap> {
    image::load_from_memory_with_format(bytes, ImageFormat::Png)
        .map(|img| img.to_rgba8())
        .map_err(|e| Error::CaptureFailure(format!("Engine returned an undecodable image: {}", e)))
}

/// Write `bytes` to `path`, replacing any existing file.
///
/// The data goes to a temporary file next to the target which is then renamed
/// over it, so a failed write never leaves a truncated image behind.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let write_err =
        |e: std::io::Error| Error::EncodeOrWriteFailure(format!("{}: {}", path.display(), e));

    let mut tmp = tempfile::Builder::new()
        .prefix(".uri2png-")
        .tempfile_in(parent_dir(path))
        .map_err(write_err)?;
    tmp.write_all(bytes).map_err(write_err)?;
    tmp.as_file().sync_all().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}
