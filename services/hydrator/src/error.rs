//! Service-specific error types

use std::path::PathBuf;

use thiserror::Error;

/// Run-level errors. Every variant aborts the run.
///
/// Per-entity problems never surface here: the fetcher turns them into a
/// failure status line and the run continues.
#[derive(Error, Debug)]
pub enum Error {
    #[error("input file not found: {}", .0.display())]
    InputMissing(PathBuf),

    #[error("failed to read input file {}: {source}", path.display())]
    Input {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {}: {source}", path.display())]
    Output {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn output(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Error::Output { path, source }
    }
}

/// Result alias using service Error
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_names_the_path() {
        assert_eq!(
            Error::InputMissing(PathBuf::from("/data/in.ndjson")).to_string(),
            "input file not found: /data/in.ndjson"
        );
        let err = Error::output("/out/log.txt")(std::io::Error::other("disk full"));
        assert_eq!(err.to_string(), "failed to write /out/log.txt: disk full");
    }

    #[test]
    fn error_source_is_preserved() {
        use std::error::Error as _;
        let err = Error::Input {
            path: PathBuf::from("in.ndjson"),
            source: std::io::Error::other("bad sector"),
        };
        assert!(err.source().is_some());
    }
}
