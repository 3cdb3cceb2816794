//! Input identifier stream
//!
//! One JSON object per line with an `id` field. Blank lines are skipped;
//! lines that do not parse are logged, counted and skipped.

use std::path::{Path, PathBuf};

use remote::EntityId;
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::warn;

use crate::error::{Error, Result};

#[derive(Deserialize)]
struct InputLine {
    id: EntityId,
}

/// Line-by-line reader over the input file.
pub struct InputReader {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: usize,
    malformed: usize,
}

impl InputReader {
    pub async fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).await.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                Error::InputMissing(path.to_path_buf())
            } else {
                Error::Input {
                    path: path.to_path_buf(),
                    source,
                }
            }
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            lines: BufReader::new(file).lines(),
            line_no: 0,
            malformed: 0,
        })
    }

    /// Next identifier, or `None` at end of input.
    pub async fn next_entity(&mut self) -> Result<Option<EntityId>> {
        loop {
            let line = self.lines.next_line().await.map_err(|source| Error::Input {
                path: self.path.clone(),
                source,
            })?;
            let Some(line) = line else {
                return Ok(None);
            };
            self.line_no += 1;

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<InputLine>(trimmed) {
                Ok(parsed) => return Ok(Some(parsed.id)),
                Err(e) => {
                    self.malformed += 1;
                    crate::metrics::record_malformed_input();
                    warn!(line = self.line_no, error = %e, "skipping malformed input line");
                }
            }
        }
    }

    /// Lines skipped because they did not parse.
    pub fn malformed(&self) -> usize {
        self.malformed
    }
}
