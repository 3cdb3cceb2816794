//! Incremental result persistence
//!
//! Every outcome appends one `<identifier>,<status>` line to `log.txt`,
//! flushed before any data record is written. Successful outcomes then
//! produce data in the configured aggregation:
//!
//! - complete: the raw profile appended to `users.ndjson`, the timeline
//!   written to `timelines/<identifier>.ndjson` (temp file + rename)
//! - compact: one reduced record appended to the compact file
//!
//! Each output file is opened once and guarded by its own mutex. Entities
//! already present in the data file (from an earlier run or earlier in this
//! one) get a status line but no second data record.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Mutex as StdMutex, PoisonError};

use remote::{EntityId, Post, Profile};
use serde::{Deserialize, Serialize};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, SeekFrom};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::Aggregation;
use crate::error::{Error, Result};
use crate::fetch::{FetchOutcome, FetchStatus};

pub const STATUS_LOG: &str = "log.txt";
pub const USERS_FILE: &str = "users.ndjson";
pub const TIMELINES_DIR: &str = "timelines";

/// Read size when scanning backwards for the last newline.
const TAIL_CHUNK: usize = 8 * 1024;

/// Reduced per-entity record written in compact mode.
///
/// Field order is the serialized order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactRecord {
    pub id: EntityId,
    pub statuses_count: u64,
    pub screen_name: String,
    pub lang: Option<String>,
    pub followers_count: u64,
    pub name: String,
    pub timeline: Vec<String>,
}

impl CompactRecord {
    pub fn new(entity: &EntityId, profile: &Profile, timeline: &[Post]) -> Self {
        Self {
            id: entity.clone(),
            statuses_count: profile.statuses_count,
            screen_name: profile.screen_name.clone(),
            lang: profile.lang.clone(),
            followers_count: profile.followers_count,
            name: profile.name.clone(),
            timeline: timeline.iter().map(|post| post.full_text.clone()).collect(),
        }
    }
}

/// An append-only output file.
struct AppendFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl AppendFile {
    /// Open for appending. A last line left without its newline by an
    /// interrupted run is cut off first.
    async fn open(path: PathBuf) -> Result<Self> {
        let mut existing = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(Error::output(&path))?;
        let dropped = trim_torn_tail(&mut existing)
            .await
            .map_err(Error::output(&path))?;
        drop(existing);
        if dropped > 0 {
            warn!(path = %path.display(), bytes = dropped, "dropped incomplete last line");
        }

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(Error::output(&path))?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    async fn append_line(&self, line: &str) -> Result<()> {
        let mut file = self.file.lock().await;
        let mut buf = String::with_capacity(line.len() + 1);
        buf.push_str(line);
        buf.push('\n');
        file.write_all(buf.as_bytes())
            .await
            .map_err(Error::output(&self.path))?;
        file.flush().await.map_err(Error::output(&self.path))
    }
}

enum Sink {
    Complete {
        users: AppendFile,
        timelines: PathBuf,
    },
    Compact {
        records: AppendFile,
    },
}

/// Owner of every output file for one run.
pub struct Writer {
    status_log: AppendFile,
    sink: Sink,
    written: StdMutex<HashSet<String>>,
}

impl Writer {
    /// Create the output layout under `output_dir` and open every file.
    pub async fn open(output_dir: &Path, aggregation: Aggregation, compact_file: &str) -> Result<Self> {
        tokio::fs::create_dir_all(output_dir)
            .await
            .map_err(Error::output(output_dir))?;

        let (sink, data_path) = match aggregation {
            Aggregation::Complete => {
                let timelines = output_dir.join(TIMELINES_DIR);
                tokio::fs::create_dir_all(&timelines)
                    .await
                    .map_err(Error::output(&timelines))?;
                let users_path = output_dir.join(USERS_FILE);
                let users = AppendFile::open(users_path.clone()).await?;
                (Sink::Complete { users, timelines }, users_path)
            }
            Aggregation::Compact => {
                let records_path = output_dir.join(compact_file);
                let records = AppendFile::open(records_path.clone()).await?;
                (Sink::Compact { records }, records_path)
            }
        };

        let written = load_written_ids(&data_path).await?;
        info!(
            output = %output_dir.display(),
            aggregation = %aggregation,
            already_written = written.len(),
            "output opened"
        );

        Ok(Self {
            status_log: AppendFile::open(output_dir.join(STATUS_LOG)).await?,
            sink,
            written: StdMutex::new(written),
        })
    }

    /// Persist one outcome: status line first, then the data record.
    pub async fn record(&self, outcome: &FetchOutcome) -> Result<()> {
        let status = outcome.status.label().replace(['\r', '\n'], " ");
        self.status_log
            .append_line(&format!("{},{status}", outcome.entity))
            .await?;

        let (FetchStatus::Success, Some(profile), Some(timeline)) =
            (&outcome.status, &outcome.profile, &outcome.timeline)
        else {
            return Ok(());
        };

        if !self.claim(&outcome.entity, profile) {
            debug!(entity = %outcome.entity, "data already written, skipping");
            return Ok(());
        }

        match &self.sink {
            Sink::Complete { users, timelines } => {
                let mut body = String::new();
                for post in timeline {
                    body.push_str(&serde_json::to_string(post)?);
                    body.push('\n');
                }
                let path = timelines.join(format!("{}.ndjson", file_stem(&outcome.entity)));
                write_atomic(&path, body.as_bytes()).await?;
                users.append_line(&serde_json::to_string(profile)?).await
            }
            Sink::Compact { records } => {
                let record = CompactRecord::new(&outcome.entity, profile, timeline);
                records.append_line(&serde_json::to_string(&record)?).await
            }
        }
    }

    /// Reserve the entity for a data write; false if already written.
    fn claim(&self, entity: &EntityId, profile: &Profile) -> bool {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        let profile_key = profile.id.to_string();
        if written.contains(&entity.to_string()) || written.contains(&profile_key) {
            return false;
        }
        written.insert(entity.to_string());
        written.insert(profile_key);
        true
    }
}

/// Cut `file` back to just after its last newline. Returns the number of
/// bytes removed.
async fn trim_torn_tail(file: &mut File) -> std::io::Result<u64> {
    let len = file.metadata().await?.len();
    let mut buf = vec![0u8; TAIL_CHUNK];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(TAIL_CHUNK as u64);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start)).await?;
        file.read_exact(chunk).await?;
        if end == len && chunk.last() == Some(&b'\n') {
            return Ok(0);
        }
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            let keep = start + pos as u64 + 1;
            file.set_len(keep).await?;
            return Ok(len - keep);
        }
        end = start;
    }
    if len > 0 {
        file.set_len(0).await?;
    }
    Ok(len)
}

#[derive(Deserialize)]
struct RecordId {
    id: EntityId,
}

/// Ids already present in an existing data file (its records' `id` field).
async fn load_written_ids(path: &Path) -> Result<HashSet<String>> {
    let input_error = |source| Error::Input {
        path: path.to_path_buf(),
        source,
    };
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(HashSet::new()),
        Err(source) => return Err(input_error(source)),
    };

    let mut ids = HashSet::new();
    let mut lines = BufReader::new(file).lines();
    while let Some(line) = lines.next_line().await.map_err(input_error)? {
        if let Ok(record) = serde_json::from_str::<RecordId>(&line) {
            ids.insert(record.id.to_string());
        }
    }
    Ok(ids)
}

/// Timeline file name for an entity; path separators are not allowed.
fn file_stem(entity: &EntityId) -> String {
    entity
        .to_string()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect()
}

/// Write `data` to `path` via a temp file in the same directory + rename.
async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp_path = dir.join(format!(".{name}.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, data)
        .await
        .map_err(Error::output(&tmp_path))?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(Error::output(path))?;

    debug!(path = %path.display(), "timeline written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use remote::testing::{post, profile};
    use serde_json::json;

    fn example_profile() -> Profile {
        serde_json::from_value(json!({
            "id": 42,
            "screen_name": "x",
            "lang": "en",
            "followers_count": 5,
            "statuses_count": 2,
            "name": "X"
        }))
        .unwrap()
    }

    fn example_outcome() -> FetchOutcome {
        FetchOutcome::success(
            EntityId::Numeric(42),
            example_profile(),
            vec![post(2, "hi"), post(1, "bye")],
        )
    }

    fn not_found(id: u64) -> FetchOutcome {
        FetchOutcome::failure(
            EntityId::Numeric(id),
            FetchStatus::Failure("User not found.".into()),
        )
    }

    fn read(path: &Path) -> String {
        std::fs::read_to_string(path).unwrap_or_default()
    }

    #[tokio::test]
    async fn compact_record_matches_example() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path(), Aggregation::Compact, "hydrated.ndjson")
            .await
            .unwrap();

        writer.record(&example_outcome()).await.unwrap();

        assert_eq!(read(&dir.path().join(STATUS_LOG)), "42,Done\n");
        assert_eq!(
            read(&dir.path().join("hydrated.ndjson")),
            "{\"id\":42,\"statuses_count\":2,\"screen_name\":\"x\",\"lang\":\"en\",\"followers_count\":5,\"name\":\"X\",\"timeline\":[\"hi\",\"bye\"]}\n"
        );
    }

    #[tokio::test]
    async fn failure_writes_status_only() {
        let dir = tempfile::tempdir().unwrap();
        for aggregation in [Aggregation::Compact, Aggregation::Complete] {
            let out = dir.path().join(aggregation.to_string());
            let writer = Writer::open(&out, aggregation, "hydrated.ndjson")
                .await
                .unwrap();

            writer.record(&not_found(99)).await.unwrap();

            assert_eq!(read(&out.join(STATUS_LOG)), "99,User not found.\n");
            assert_eq!(read(&out.join("hydrated.ndjson")), "");
            assert_eq!(read(&out.join(USERS_FILE)), "");
            assert!(!out.join(TIMELINES_DIR).join("99.ndjson").exists());
        }
    }

    #[tokio::test]
    async fn complete_mode_writes_profile_and_timeline_file() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path(), Aggregation::Complete, "unused.ndjson")
            .await
            .unwrap();

        writer.record(&example_outcome()).await.unwrap();

        let users = read(&dir.path().join(USERS_FILE));
        let stored: Profile = serde_json::from_str(users.trim_end()).unwrap();
        assert_eq!(stored, example_profile());

        let timeline = read(&dir.path().join(TIMELINES_DIR).join("42.ndjson"));
        let texts: Vec<String> = timeline
            .lines()
            .map(|l| serde_json::from_str::<Post>(l).unwrap().full_text)
            .collect();
        assert_eq!(texts, vec!["hi", "bye"]);
        assert!(!dir.path().join("unused.ndjson").exists());
    }

    #[tokio::test]
    async fn complete_output_reaggregates_to_compact_record() {
        let outcome = FetchOutcome::success(
            EntityId::Numeric(7),
            profile(7, "seven"),
            vec![post(30, "third"), post(20, "second"), post(10, "first")],
        );

        let complete_dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(complete_dir.path(), Aggregation::Complete, "c.ndjson")
            .await
            .unwrap();
        writer.record(&outcome).await.unwrap();

        let compact_dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(compact_dir.path(), Aggregation::Compact, "c.ndjson")
            .await
            .unwrap();
        writer.record(&outcome).await.unwrap();

        let stored_profile: Profile =
            serde_json::from_str(read(&complete_dir.path().join(USERS_FILE)).trim_end()).unwrap();
        let stored_posts: Vec<Post> = read(&complete_dir.path().join(TIMELINES_DIR).join("7.ndjson"))
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        let reaggregated = CompactRecord::new(&outcome.entity, &stored_profile, &stored_posts);

        let direct: CompactRecord =
            serde_json::from_str(read(&compact_dir.path().join("c.ndjson")).trim_end()).unwrap();
        assert_eq!(reaggregated, direct);
    }

    #[tokio::test]
    async fn duplicate_entities_get_one_data_record() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path(), Aggregation::Compact, "hydrated.ndjson")
            .await
            .unwrap();

        writer.record(&example_outcome()).await.unwrap();
        writer.record(&example_outcome()).await.unwrap();

        assert_eq!(read(&dir.path().join(STATUS_LOG)), "42,Done\n42,Done\n");
        assert_eq!(read(&dir.path().join("hydrated.ndjson")).lines().count(), 1);
    }

    #[tokio::test]
    async fn existing_records_are_not_written_again_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        for aggregation in [Aggregation::Compact, Aggregation::Complete] {
            let out = dir.path().join(aggregation.to_string());
            {
                let writer = Writer::open(&out, aggregation, "hydrated.ndjson")
                    .await
                    .unwrap();
                writer.record(&example_outcome()).await.unwrap();
            }

            let writer = Writer::open(&out, aggregation, "hydrated.ndjson")
                .await
                .unwrap();
            writer.record(&example_outcome()).await.unwrap();

            let data = match aggregation {
                Aggregation::Compact => out.join("hydrated.ndjson"),
                Aggregation::Complete => out.join(USERS_FILE),
            };
            assert_eq!(read(&data).lines().count(), 1, "{aggregation}");
            assert_eq!(read(&out.join(STATUS_LOG)).lines().count(), 2);
        }
    }

    #[tokio::test]
    async fn text_ids_keep_their_json_type() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path(), Aggregation::Compact, "hydrated.ndjson")
            .await
            .unwrap();
        let outcome = FetchOutcome::success(
            EntityId::Text("42".into()),
            example_profile(),
            vec![post(1, "hi")],
        );

        writer.record(&outcome).await.unwrap();

        let line = read(&dir.path().join("hydrated.ndjson"));
        assert!(line.starts_with("{\"id\":\"42\","), "got: {line}");
    }

    #[tokio::test]
    async fn multiline_failure_reasons_stay_on_one_line() {
        let dir = tempfile::tempdir().unwrap();
        let writer = Writer::open(dir.path(), Aggregation::Compact, "hydrated.ndjson")
            .await
            .unwrap();
        let outcome = FetchOutcome::failure(
            EntityId::Numeric(5),
            FetchStatus::Failure("bad\ngateway".into()),
        );

        writer.record(&outcome).await.unwrap();

        assert_eq!(read(&dir.path().join(STATUS_LOG)), "5,bad gateway\n");
    }

    #[tokio::test]
    async fn timeline_rewrite_replaces_previous_file() {
        let dir = tempfile::tempdir().unwrap();
        let timelines = dir.path().join(TIMELINES_DIR);
        std::fs::create_dir_all(&timelines).unwrap();
        std::fs::write(timelines.join("42.ndjson"), "stale\n").unwrap();

        let writer = Writer::open(dir.path(), Aggregation::Complete, "unused.ndjson")
            .await
            .unwrap();
        writer.record(&example_outcome()).await.unwrap();

        let timeline = read(&timelines.join("42.ndjson"));
        assert!(!timeline.contains("stale"));
        assert_eq!(timeline.lines().count(), 2);
        let leftovers: Vec<_> = std::fs::read_dir(&timelines)
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1, "no temp files left: {leftovers:?}");
    }

    #[tokio::test]
    async fn torn_last_line_is_dropped_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        for aggregation in [Aggregation::Compact, Aggregation::Complete] {
            let out = dir.path().join(aggregation.to_string());
            std::fs::create_dir_all(&out).unwrap();
            let data = match aggregation {
                Aggregation::Compact => out.join("hydrated.ndjson"),
                Aggregation::Complete => out.join(USERS_FILE),
            };
            std::fs::write(&data, "{\"id\":7,\"name\":\"Seven\"}\n{\"id\":41,\"statuses_cou").unwrap();
            std::fs::write(out.join(STATUS_LOG), "7,Done\n41,Do").unwrap();

            let writer = Writer::open(&out, aggregation, "hydrated.ndjson")
                .await
                .unwrap();
            writer.record(&example_outcome()).await.unwrap();

            assert_eq!(read(&out.join(STATUS_LOG)), "7,Done\n42,Done\n", "{aggregation}");
            let contents = read(&data);
            let ids: Vec<u64> = contents
                .lines()
                .map(|l| serde_json::from_str::<serde_json::Value>(l).unwrap()["id"].as_u64().unwrap())
                .collect();
            assert_eq!(ids, vec![7, 42], "{aggregation}");
        }
    }

    #[tokio::test]
    async fn file_without_any_newline_is_emptied() {
        let dir = tempfile::tempdir().unwrap();
        let records = dir.path().join("hydrated.ndjson");
        std::fs::write(&records, "{\"id\":4").unwrap();

        let writer = Writer::open(dir.path(), Aggregation::Compact, "hydrated.ndjson")
            .await
            .unwrap();
        writer.record(&example_outcome()).await.unwrap();

        let contents = read(&records);
        assert_eq!(contents.lines().count(), 1);
        assert!(contents.starts_with("{\"id\":42,"), "got: {contents}");
    }

    #[tokio::test]
    async fn torn_tail_longer_than_one_read_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join(STATUS_LOG);
        let torn = format!("1,Done\n2,{}", "x".repeat(TAIL_CHUNK * 2 + 17));
        std::fs::write(&log, torn).unwrap();

        let writer = Writer::open(dir.path(), Aggregation::Compact, "hydrated.ndjson")
            .await
            .unwrap();
        writer.record(&not_found(3)).await.unwrap();

        assert_eq!(read(&log), "1,Done\n3,User not found.\n");
    }

    #[tokio::test]
    async fn restart_ignores_records_without_id() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("hydrated.ndjson"),
            "{\"id\":\"42\",\"timeline\":[]}\nnot json\n{\"name\":\"no id\"}\n",
        )
        .unwrap();

        let writer = Writer::open(dir.path(), Aggregation::Compact, "hydrated.ndjson")
            .await
            .unwrap();
        writer.record(&example_outcome()).await.unwrap();

        // "42" as text and 42 as a number are the same entity
        assert_eq!(read(&dir.path().join("hydrated.ndjson")).lines().count(), 3);
    }

    #[test]
    fn file_stem_strips_path_separators() {
        assert_eq!(file_stem(&EntityId::Text("a/b".into())), "a_b");
        assert_eq!(file_stem(&EntityId::Numeric(42)), "42");
    }
}
