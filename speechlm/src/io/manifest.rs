use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Manifests filtered by default.
pub const DEFAULT_MANIFESTS: &[&str] = &[
    "spk2utt",
    "text",
    "utt2spk",
    "wav.scp",
    "text.ctc",
    "text.prev",
    "utt2num_samples",
];

/// Split a manifest line into its key and the rest of the fields.
fn split_entry(line: &str) -> Option<(&str, Vec<&str>)> {
    let mut fields = line.split_whitespace();
    let key = fields.next()?;
    Some((key, fields.collect()))
}

/// Load the keys of a reference manifest, in file order.
pub fn load_reference_keys(path: &Path) -> Result<Vec<String>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read reference file: {:?}", path))?;
    Ok(content
        .lines()
        .filter_map(split_entry)
        .map(|(key, _)| key.to_string())
        .collect())
}

/// Keep only the entries of `path` whose key is in `keys`.
///
/// Entries are written in the order of `keys` to `save_dir` under the same
/// file name, with the value fields re-joined by single spaces. Returns the
/// number of entries kept.
pub fn filter_manifest(path: &Path, keys: &[String], save_dir: &Path) -> Result<usize> {
    fs::create_dir_all(save_dir)
        .with_context(|| format!("Failed to create directory: {:?}", save_dir))?;

    let content =
        fs::read_to_string(path).with_context(|| format!("Failed to read manifest: {:?}", path))?;
    let entries: HashMap<&str, String> = content
        .lines()
        .filter_map(split_entry)
        .map(|(key, value)| (key, value.join(" ")))
        .collect();

    let mut filtered = String::new();
    let mut kept = 0;
    for key in keys {
        if let Some(value) = entries.get(key.as_str()) {
            filtered.push_str(key);
            filtered.push(' ');
            filtered.push_str(value);
            filtered.push('\n');
            kept += 1;
        }
    }

    let save_path = manifest_save_path(path, save_dir)?;
    fs::write(&save_path, filtered)
        .with_context(|| format!("Failed to write manifest: {:?}", save_path))?;

    tracing::debug!(path = ?path, save_path = ?save_path, kept, "Filtered manifest");
    Ok(kept)
}

fn manifest_save_path(path: &Path, save_dir: &Path) -> Result<PathBuf> {
    let name = path
        .file_name()
        .with_context(|| format!("Manifest path has no file name: {:?}", path))?;
    Ok(save_dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_reference_keys_skips_blank_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("clip_feature");
        fs::write(&path, "utt2 a.npy\n\n   \nutt1 b.npy\n")?;

        assert_eq!(load_reference_keys(&path)?, vec!["utt2", "utt1"]);
        Ok(())
    }

    #[test]
    fn test_filter_manifest_orders_by_keys() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("text");
        fs::write(&path, "utt1 hello   world\nutt2 foo\nutt3 bar baz\n\n")?;

        let save_dir = dir.path().join("filtered");
        let keys = vec!["utt3".to_string(), "missing".to_string(), "utt1".to_string()];
        let kept = filter_manifest(&path, &keys, &save_dir)?;

        assert_eq!(kept, 2);
        let written = fs::read_to_string(save_dir.join("text"))?;
        assert_eq!(written, "utt3 bar baz\nutt1 hello world\n");
        Ok(())
    }

    #[test]
    fn test_filter_manifest_in_place() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("utt2spk");
        fs::write(&path, "a spk1\nb spk2\n")?;

        let kept = filter_manifest(&path, &["b".to_string()], dir.path())?;
        assert_eq!(kept, 1);
        assert_eq!(fs::read_to_string(&path)?, "b spk2\n");
        Ok(())
    }

    #[test]
    fn test_filter_manifest_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = filter_manifest(&dir.path().join("wav.scp"), &[], dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to read manifest"));
    }
}
