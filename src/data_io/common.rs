/// Output paths shared by the training loop and the CLI
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Create the output directory (and parents) if needed
pub fn ensure_output_dir(dir: impl AsRef<Path>) -> io::Result<PathBuf> {
    let dir = dir.as_ref();
    if !dir.is_dir() {
        fs::create_dir_all(dir)?;
    }
    Ok(dir.to_path_buf())
}

/// Reconstruction exported after `epoch`
pub fn export_filename(outdir: &Path, epoch: usize) -> PathBuf {
    outdir.join(format!("data-{:05}.nc", epoch))
}

/// Model parameters saved after `epoch`
pub fn checkpoint_filename(outdir: &Path, epoch: usize) -> PathBuf {
    outdir.join(format!("model-{:05}.safetensors", epoch))
}

/// Configuration snapshot written next to the outputs
pub fn config_filename(outdir: &Path) -> PathBuf {
    outdir.join("config.json")
}

/// Most recent export in `outdir`, by epoch number
pub fn latest_export(outdir: &Path) -> io::Result<Option<PathBuf>> {
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in fs::read_dir(outdir)? {
        let path = entry?.path();
        let epoch = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.strip_prefix("data-"))
            .and_then(|n| n.strip_suffix(".nc"))
            .and_then(|n| n.parse::<usize>().ok());
        if let Some(epoch) = epoch {
            if best.as_ref().map_or(true, |(e, _)| epoch > *e) {
                best = Some((epoch, path));
            }
        }
    }
    Ok(best.map(|(_, p)| p))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filenames() {
        let dir = Path::new("/out");
        assert_eq!(export_filename(dir, 10), PathBuf::from("/out/data-00010.nc"));
        assert_eq!(
            checkpoint_filename(dir, 500),
            PathBuf::from("/out/model-00500.safetensors")
        );
    }

    #[test]
    fn test_latest_export() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = ensure_output_dir(tmp.path().join("run")).unwrap();
        assert_eq!(latest_export(&dir).unwrap(), None);

        for epoch in [5, 20, 10] {
            fs::write(export_filename(&dir, epoch), b"").unwrap();
        }
        fs::write(dir.join("notes.txt"), b"").unwrap();

        assert_eq!(latest_export(&dir).unwrap(), Some(export_filename(&dir, 20)));
    }
}
