//! Persisted artifacts
//!
//! Dense little-endian dumps with no header. Readers must know the shape from
//! configuration (class count, feature dimension).

use std::fs;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::utils::error::{OpenSetError, Result};

/// Derive an artifact path from a weights path: `run/model.mpk` + `_centroids.bin`
/// gives `run/model_centroids.bin`.
pub fn sibling_path(weights_path: &Path, suffix: &str) -> PathBuf {
    let stem = weights_path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    weights_path.with_file_name(format!("{}{}", stem, suffix))
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    Ok(())
}

/// Write a flat f32 array
pub fn write_f32(path: &Path, values: &[f32]) -> Result<()> {
    ensure_parent(path)?;
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(path, bytes)?;
    debug!("Wrote {} f32 values to {:?}", values.len(), path);
    Ok(())
}

/// Read a flat f32 array, checking the element count
pub fn read_f32(path: &Path, expected_len: usize) -> Result<Vec<f32>> {
    let bytes = fs::read(path)?;
    if bytes.len() != expected_len * 4 {
        return Err(OpenSetError::shape(
            format!("f32 artifact {:?}", path),
            vec![expected_len],
            vec![bytes.len() / 4],
        ));
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// Write a flat i64 array (predicted-or-unknown class ids)
pub fn write_i64(path: &Path, values: &[i64]) -> Result<()> {
    ensure_parent(path)?;
    let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
    fs::write(path, bytes)?;
    debug!("Wrote {} i64 values to {:?}", values.len(), path);
    Ok(())
}

/// Read a flat i64 array of whatever length the file holds
pub fn read_i64(path: &Path) -> Result<Vec<i64>> {
    let bytes = fs::read(path)?;
    if bytes.len() % 8 != 0 {
        return Err(OpenSetError::shape(
            format!("i64 artifact {:?}", path),
            vec![bytes.len() / 8 * 8],
            vec![bytes.len()],
        ));
    }
    Ok(bytes
        .chunks_exact(8)
        .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sibling_path() {
        let path = sibling_path(Path::new("runs/stage1/model.mpk"), "_centroids.bin");
        assert_eq!(path, PathBuf::from("runs/stage1/model_centroids.bin"));
    }

    #[test]
    fn test_f32_layout_is_row_major_le() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.bin");
        write_f32(&path, &[1.0, 2.0, 3.0]).unwrap();

        let bytes = fs::read(&path).unwrap();
        assert_eq!(bytes.len(), 12);
        assert_eq!(&bytes[4..8], &2.0f32.to_le_bytes());
        assert_eq!(read_f32(&path, 3).unwrap(), vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn test_f32_wrong_length_is_shape_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("c.bin");
        write_f32(&path, &[1.0, 2.0]).unwrap();
        assert!(matches!(
            read_f32(&path, 4),
            Err(OpenSetError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_i64_keeps_unknown_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/preds.bin");
        write_i64(&path, &[2, -1, 0]).unwrap();
        assert_eq!(read_i64(&path).unwrap(), vec![2, -1, 0]);
    }
}
