//! Output-directory lifecycle.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DistilError {
    #[error("Output directory ({0}) already exists. Use --overwrite-output-dir to overcome.")]
    OutputDirExists(PathBuf),

    #[error("Output directory is required while --do-train is set.")]
    OutputDirRequiredForTraining,

    #[error("Output directory or output file is required.")]
    OutputPathRequired,

    #[error("Training diverged: non-finite loss {loss} at step {step}")]
    NonFiniteLoss { step: usize, loss: f32 },

    #[error("Student and teacher batches disagree at batch {index}: {student:?} vs {teacher:?}")]
    BatchMismatch { index: usize, student: Vec<String>, teacher: Vec<String> },

    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Create, reuse-by-overwrite, or reject the output directory.
///
/// With no directory, training is refused and evaluation requires an
/// output file to write predictions to.
pub fn prepare_output_dir(
    output_dir: Option<&Path>,
    overwrite: bool,
    do_train: bool,
    output_file: Option<&Path>,
) -> Result<(), DistilError> {
    let io = |path: &Path| {
        let path = path.to_path_buf();
        move |source| DistilError::Io { path, source }
    };

    match output_dir {
        Some(dir) => {
            if dir.exists() {
                if !overwrite {
                    return Err(DistilError::OutputDirExists(dir.to_path_buf()));
                }
                std::fs::remove_dir_all(dir).map_err(io(dir))?;
                info!(
                    output_dir = %dir.display(),
                    "--overwrite-output-dir used, directory deleted"
                );
            }
            std::fs::create_dir_all(dir).map_err(io(dir))?;
            Ok(())
        }
        None if do_train => Err(DistilError::OutputDirRequiredForTraining),
        None if output_file.is_none() => Err(DistilError::OutputPathRequired),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_missing_directory() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("run");
        prepare_output_dir(Some(&out), false, true, None).unwrap();
        assert!(out.is_dir());
    }

    #[test]
    fn existing_directory_without_overwrite_fails() {
        let tmp = TempDir::new().unwrap();
        let err = prepare_output_dir(Some(tmp.path()), false, false, None).unwrap_err();
        assert!(matches!(err, DistilError::OutputDirExists(_)));
        assert!(err.to_string().contains("--overwrite-output-dir"));
    }

    #[test]
    fn overwrite_clears_previous_contents() {
        let tmp = TempDir::new().unwrap();
        let out = tmp.path().join("run");
        std::fs::create_dir_all(out.join("nested")).unwrap();
        std::fs::write(out.join("stale.txt"), "old").unwrap();
        prepare_output_dir(Some(&out), true, true, None).unwrap();
        assert!(out.is_dir());
        assert_eq!(std::fs::read_dir(&out).unwrap().count(), 0);
    }

    #[test]
    fn training_requires_output_dir() {
        let err =
            prepare_output_dir(None, false, true, Some(Path::new("preds.jsonl"))).unwrap_err();
        assert!(matches!(err, DistilError::OutputDirRequiredForTraining));
    }

    #[test]
    fn evaluation_requires_some_output() {
        let err = prepare_output_dir(None, false, false, None).unwrap_err();
        assert!(matches!(err, DistilError::OutputPathRequired));
        assert!(prepare_output_dir(None, false, false, Some(Path::new("preds.jsonl"))).is_ok());
    }
}
