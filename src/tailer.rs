use crate::checkpoint::OffsetStore;
use crate::debounce::Debouncer;
use crate::metrics::{
    ACTIVE_WORKERS, LINES_READ_TOTAL, LINES_UNMATCHED_TOTAL, ROTATIONS_TOTAL, TAIL_PASS_DURATION,
    TRUNCATIONS_TOTAL,
};
use crate::parsers::{line_preview, LineParser};
use crate::processor::Processor;
use crate::rotation::Rotator;
use crate::{ExtensionData, Record};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::Mutex;
use tokio::task;
use tracing::{debug, info, warn};

const READ_BUFFER_BYTES: usize = 64 * 1024;
const LINE_PREVIEW_CHARS: usize = 256;

/// Collaborators shared by every tailer of one input.
#[derive(Clone)]
pub struct TailerConfig {
    pub parser: Arc<dyn LineParser>,
    pub processor: Arc<dyn Processor>,
    pub offsets: Arc<dyn OffsetStore>,
    pub rotator: Option<Arc<dyn Rotator>>,
    pub debounce_interval: Duration,
}

/// What one tail pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub lines_read: usize,
    pub records_written: usize,
    pub truncated: bool,
    pub rotated: bool,
}

/// Progress of one tailed file.
///
/// The file is opened at the start of each pass and closed at its end; only the offset
/// survives between passes.
pub struct TailState {
    path: PathBuf,
    extension: ExtensionData,
    offset: u64,
    config: TailerConfig,
}

impl TailState {
    /// Build the state for `path`, resuming from its stored offset.
    pub async fn load(path: PathBuf, extension: ExtensionData, config: TailerConfig) -> Self {
        let offset = match config.offsets.get_offset(&path).await {
            Ok(offset) => offset,
            Err(err) => {
                warn!(
                    error = %err,
                    path = %path.display(),
                    "failed to load stored offset; starting from 0"
                );
                0
            }
        };

        Self {
            path,
            extension,
            offset,
            config,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Read every complete line appended since the last pass.
    ///
    /// Returns `None` when the file could not be opened or positioned; the stored offset is
    /// left untouched so the next trigger retries from the same place.
    pub async fn tail_pass(&mut self) -> Option<PassSummary> {
        let started = Instant::now();

        let mut file = match File::open(&self.path).await {
            Ok(file) => file,
            Err(err) => {
                debug!(
                    error = %err,
                    path = %self.path.display(),
                    "file unavailable; skipping tail pass"
                );
                return None;
            }
        };

        let file_size = match file.metadata().await {
            Ok(meta) => meta.len(),
            Err(err) => {
                debug!(
                    error = %err,
                    path = %self.path.display(),
                    "metadata unavailable; skipping tail pass"
                );
                return None;
            }
        };

        let mut summary = PassSummary::default();

        if file_size == 0 {
            if self.offset != 0 {
                debug!(path = %self.path.display(), "file is empty; resetting offset");
            }
            self.persist_offset(0).await;
            return Some(summary);
        }

        let mut offset = self.offset;
        if offset > file_size {
            warn!(
                path = %self.path.display(),
                previous_offset = offset,
                current_size = file_size,
                "file truncated or rotated; reading from start"
            );
            TRUNCATIONS_TOTAL.inc();
            summary.truncated = true;
            offset = 0;
        }

        if let Err(err) = file.seek(SeekFrom::Start(offset)).await {
            debug!(
                error = %err,
                path = %self.path.display(),
                offset,
                "failed to seek; skipping tail pass"
            );
            return None;
        }

        let mut reader = BufReader::with_capacity(READ_BUFFER_BYTES, file);
        let mut line = Vec::new();
        loop {
            line.clear();
            let bytes_read = match reader.read_until(b'\n', &mut line).await {
                Ok(bytes_read) => bytes_read,
                Err(err) => {
                    warn!(
                        error = %err,
                        path = %self.path.display(),
                        offset,
                        "read failed; ending tail pass early"
                    );
                    break;
                }
            };

            // A line without its terminator may still be in the middle of being written.
            if bytes_read == 0 || line.last() != Some(&b'\n') {
                break;
            }

            offset += bytes_read as u64;
            summary.lines_read += 1;
            if self.process_line(&line).await {
                summary.records_written += 1;
            }
        }
        LINES_READ_TOTAL.inc_by(summary.lines_read as u64);

        self.persist_offset(offset).await;

        if let Some(rotator) = self.config.rotator.clone() {
            if rotator.check_size(file_size) {
                summary.rotated = self.rotate(rotator, file_size).await;
            }
        }

        TAIL_PASS_DURATION.observe(started.elapsed().as_secs_f64());
        debug!(
            path = %self.path.display(),
            offset = self.offset,
            lines_read = summary.lines_read,
            records_written = summary.records_written,
            truncated = summary.truncated,
            rotated = summary.rotated,
            "tail pass complete"
        );

        Some(summary)
    }

    /// Parse one terminated line and forward the result. Returns whether a row was written.
    async fn process_line(&self, raw: &[u8]) -> bool {
        let mut line = raw.strip_suffix(b"\n").unwrap_or(raw);
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        if line.is_empty() {
            return false;
        }

        let text = String::from_utf8_lossy(line);
        let Some(mut record) = self.config.parser.parse(&text) else {
            LINES_UNMATCHED_TOTAL.inc();
            debug!(
                path = %self.path.display(),
                line = %line_preview(&text, LINE_PREVIEW_CHARS),
                "line did not match parser"
            );
            return false;
        };

        merge_extension(&mut record, &self.extension);

        match self.config.processor.serialize(record) {
            Some(row) => {
                self.config.processor.write(row).await;
                true
            }
            None => false,
        }
    }

    async fn rotate(&mut self, rotator: Arc<dyn Rotator>, file_size: u64) -> bool {
        let path = self.path.clone();
        let result = task::spawn_blocking(move || rotator.rotate(&path)).await;

        match result {
            Ok(Ok(())) => {
                ROTATIONS_TOTAL.with_label_values(&["ok"]).inc();
                info!(path = %self.path.display(), file_size, "rotated file; resetting offset");
                self.persist_offset(0).await;
                true
            }
            Ok(Err(err)) => {
                ROTATIONS_TOTAL.with_label_values(&["error"]).inc();
                warn!(
                    error = %err,
                    path = %self.path.display(),
                    "failed to rotate log file; keeping offset"
                );
                false
            }
            Err(err) => {
                ROTATIONS_TOTAL.with_label_values(&["error"]).inc();
                warn!(
                    error = %err,
                    path = %self.path.display(),
                    "rotation task failed; keeping offset"
                );
                false
            }
        }
    }

    async fn persist_offset(&mut self, offset: u64) {
        self.offset = offset;
        if let Err(err) = self.config.offsets.set_offset(&self.path, offset).await {
            warn!(
                error = %err,
                path = %self.path.display(),
                offset,
                "failed to persist offset"
            );
        }
    }
}

/// Add the file's extension fields to `record` without replacing fields the parser produced.
pub fn merge_extension(record: &mut Record, extension: &ExtensionData) {
    for (key, value) in extension {
        record
            .entry(key.clone())
            .or_insert_with(|| value.clone());
    }
}

/// A running tailer for one file.
///
/// Write notifications go through [`FileWorker::handle`], which only signals the debouncer;
/// tail passes run on the debouncer's task, one at a time.
pub struct FileWorker {
    path: PathBuf,
    state: Arc<Mutex<TailState>>,
    debouncer: Debouncer,
}

impl FileWorker {
    pub async fn start(path: PathBuf, extension: ExtensionData, config: TailerConfig) -> Self {
        let interval = config.debounce_interval;
        let state = TailState::load(path.clone(), extension, config).await;
        info!(path = %path.display(), offset = state.offset(), "starting tailer");

        let state = Arc::new(Mutex::new(state));
        let pass_state = state.clone();
        let debouncer = Debouncer::start(
            move || {
                let state = pass_state.clone();
                async move {
                    state.lock().await.tail_pass().await;
                }
            },
            interval,
            true,
        );
        ACTIVE_WORKERS.inc();

        Self {
            path,
            state,
            debouncer,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Note that the file changed; a tail pass follows within the debounce interval.
    pub fn handle(&self) {
        self.debouncer.signal();
    }

    pub fn stop(&self) {
        if !self.debouncer.is_stopped() {
            info!(path = %self.path.display(), "stopping tailer");
            self.debouncer.stop();
        }
    }

    /// Stop tailing a file that is gone and reset its stored offset, so a file later created
    /// under the same path is read from its first byte.
    ///
    /// Waits for a pass already in progress before resetting.
    pub async fn forget(self) {
        self.stop();
        let mut state = self.state.lock().await;
        debug!(path = %self.path.display(), offset = state.offset(), "clearing stored offset");
        state.persist_offset(0).await;
    }
}

impl Drop for FileWorker {
    fn drop(&mut self) {
        self.debouncer.stop();
        ACTIVE_WORKERS.dec();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::checkpoint::MemoryOffsetStore;
    use crate::parsers::RegexParser;
    use crate::storage::{FieldValue, Row};
    use anyhow::{anyhow, Result};
    use async_trait::async_trait;
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use std::sync::Mutex as StdMutex;

    /// Records everything it is given; rows are the record's fields as text.
    #[derive(Default)]
    pub(crate) struct CollectingProcessor {
        pub(crate) serialized: StdMutex<Vec<Record>>,
        pub(crate) written: StdMutex<Vec<Row>>,
    }

    impl CollectingProcessor {
        pub(crate) fn records(&self) -> Vec<Record> {
            self.serialized.lock().expect("serialized lock").clone()
        }

        pub(crate) fn written_count(&self) -> usize {
            self.written.lock().expect("written lock").len()
        }
    }

    #[async_trait]
    impl Processor for CollectingProcessor {
        fn serialize(&self, record: Record) -> Option<Row> {
            self.serialized
                .lock()
                .expect("serialized lock")
                .push(record.clone());
            if record.get("message").map(String::as_str) == Some("filtered") {
                return None;
            }
            Some(
                record
                    .into_iter()
                    .map(|(k, v)| (k, FieldValue::Text(v)))
                    .collect(),
            )
        }

        async fn write(&self, row: Row) {
            self.written.lock().expect("written lock").push(row);
        }
    }

    struct FixedRotator {
        threshold: u64,
        fail: bool,
    }

    impl Rotator for FixedRotator {
        fn check_size(&self, size: u64) -> bool {
            size >= self.threshold
        }

        fn rotate(&self, path: &Path) -> Result<()> {
            if self.fail {
                return Err(anyhow!("disk full"));
            }
            OpenOptions::new().write(true).open(path)?.set_len(0)?;
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        path: PathBuf,
        offsets: Arc<MemoryOffsetStore>,
        processor: Arc<CollectingProcessor>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().expect("tempdir");
            let path = dir.path().join("app-web01.log");
            Self {
                _dir: dir,
                path,
                offsets: Arc::new(MemoryOffsetStore::new()),
                processor: Arc::new(CollectingProcessor::default()),
            }
        }

        fn config(&self, rotator: Option<Arc<dyn Rotator>>) -> TailerConfig {
            TailerConfig {
                parser: Arc::new(
                    RegexParser::new(r"^(?P<level>[A-Z]+) (?P<message>.*)$").expect("parser"),
                ),
                processor: self.processor.clone(),
                offsets: self.offsets.clone(),
                rotator,
                debounce_interval: Duration::from_millis(10),
            }
        }

        async fn state(&self, extension: ExtensionData) -> TailState {
            TailState::load(self.path.clone(), extension, self.config(None)).await
        }

        fn append(&self, content: &str) {
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .expect("open log");
            file.write_all(content.as_bytes()).expect("append");
        }

        async fn stored_offset(&self) -> u64 {
            self.offsets.get_offset(&self.path).await.expect("offset")
        }
    }

    fn messages(records: &[Record]) -> Vec<String> {
        records.iter().map(|r| r["message"].clone()).collect()
    }

    #[tokio::test]
    async fn reads_complete_lines_and_persists_offset() {
        let fx = Fixture::new();
        fx.append("INFO one\nWARN two\n");
        let mut state = fx.state(ExtensionData::new()).await;

        let summary = state.tail_pass().await.expect("pass ran");
        assert_eq!(summary.lines_read, 2);
        assert_eq!(summary.records_written, 2);
        assert_eq!(messages(&fx.processor.records()), vec!["one", "two"]);
        assert_eq!(state.offset(), 18);
        assert_eq!(fx.stored_offset().await, 18);

        let summary = state.tail_pass().await.expect("pass ran");
        assert_eq!(summary, PassSummary::default());
        assert_eq!(fx.stored_offset().await, 18);
    }

    #[tokio::test]
    async fn partial_line_waits_for_terminator() {
        let fx = Fixture::new();
        fx.append("INFO done\nINFO part");
        let mut state = fx.state(ExtensionData::new()).await;

        state.tail_pass().await.expect("pass ran");
        assert_eq!(messages(&fx.processor.records()), vec!["done"]);
        assert_eq!(fx.stored_offset().await, 10);

        fx.append("ial\n");
        state.tail_pass().await.expect("pass ran");
        assert_eq!(messages(&fx.processor.records()), vec!["done", "partial"]);
        assert_eq!(fx.stored_offset().await, 23);
    }

    #[tokio::test]
    async fn empty_file_resets_offset() {
        let fx = Fixture::new();
        fx.append("");
        fx.offsets.set_offset(&fx.path, 100).await.expect("seed");
        let mut state = fx.state(ExtensionData::new()).await;
        assert_eq!(state.offset(), 100);

        let summary = state.tail_pass().await.expect("pass ran");
        assert_eq!(summary.lines_read, 0);
        assert_eq!(state.offset(), 0);
        assert_eq!(fx.stored_offset().await, 0);
        assert!(fx.processor.records().is_empty());
    }

    #[tokio::test]
    async fn offset_past_end_rereads_from_start() {
        let fx = Fixture::new();
        fx.append("INFO after truncate\n");
        fx.offsets.set_offset(&fx.path, 4096).await.expect("seed");
        let mut state = fx.state(ExtensionData::new()).await;

        let summary = state.tail_pass().await.expect("pass ran");
        assert!(summary.truncated);
        assert_eq!(messages(&fx.processor.records()), vec!["after truncate"]);
        assert_eq!(fx.stored_offset().await, 20);
    }

    #[tokio::test]
    async fn resumes_from_stored_offset() {
        let fx = Fixture::new();
        fx.append("INFO old\n");
        fx.offsets.set_offset(&fx.path, 9).await.expect("seed");
        fx.append("INFO new\n");

        let mut state = fx.state(ExtensionData::new()).await;
        state.tail_pass().await.expect("pass ran");
        assert_eq!(messages(&fx.processor.records()), vec!["new"]);
    }

    #[tokio::test]
    async fn extension_fields_fill_missing_keys_only() {
        let fx = Fixture::new();
        fx.append("INFO hello\n");
        let extension: ExtensionData = [("host", "web01"), ("level", "from-name")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let mut state = fx.state(extension).await;

        state.tail_pass().await.expect("pass ran");
        let records = fx.processor.records();
        assert_eq!(records.len(), 1);
        let expected: Record = [("level", "INFO"), ("message", "hello"), ("host", "web01")]
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        assert_eq!(records[0], expected);
    }

    #[tokio::test]
    async fn skips_blank_unmatched_and_filtered_lines() {
        let fx = Fixture::new();
        fx.append("INFO first\r\n\n\r\nnot a match\nINFO filtered\nERROR last\n");
        let mut state = fx.state(ExtensionData::new()).await;

        let summary = state.tail_pass().await.expect("pass ran");
        assert_eq!(summary.lines_read, 6);
        assert_eq!(summary.records_written, 2);
        assert_eq!(
            messages(&fx.processor.records()),
            vec!["first", "filtered", "last"]
        );
        assert_eq!(fx.processor.written_count(), 2);
        let size = fs::metadata(&fx.path).expect("metadata").len();
        assert_eq!(fx.stored_offset().await, size);
    }

    #[tokio::test]
    async fn missing_file_aborts_without_touching_offset() {
        let fx = Fixture::new();
        fx.offsets.set_offset(&fx.path, 42).await.expect("seed");
        let mut state = fx.state(ExtensionData::new()).await;

        assert_eq!(state.tail_pass().await, None);
        assert_eq!(fx.stored_offset().await, 42);
    }

    #[tokio::test]
    async fn successful_rotation_resets_offset() {
        let fx = Fixture::new();
        fx.append("INFO one\nINFO two\n");
        let rotator: Arc<dyn Rotator> = Arc::new(FixedRotator {
            threshold: 10,
            fail: false,
        });
        let mut state = TailState::load(
            fx.path.clone(),
            ExtensionData::new(),
            fx.config(Some(rotator)),
        )
        .await;

        let summary = state.tail_pass().await.expect("pass ran");
        assert!(summary.rotated);
        assert_eq!(summary.records_written, 2);
        assert_eq!(fx.stored_offset().await, 0);
        assert_eq!(fs::metadata(&fx.path).expect("metadata").len(), 0);
    }

    #[tokio::test]
    async fn failed_rotation_keeps_offset() {
        let fx = Fixture::new();
        fx.append("INFO one\nINFO two\n");
        let rotator: Arc<dyn Rotator> = Arc::new(FixedRotator {
            threshold: 10,
            fail: true,
        });
        let mut state = TailState::load(
            fx.path.clone(),
            ExtensionData::new(),
            fx.config(Some(rotator)),
        )
        .await;

        let summary = state.tail_pass().await.expect("pass ran");
        assert!(!summary.rotated);
        assert_eq!(fx.stored_offset().await, 18);
    }

    #[tokio::test]
    async fn worker_tails_after_handle() {
        let fx = Fixture::new();
        fx.append("INFO before start\n");
        let worker = FileWorker::start(fx.path.clone(), ExtensionData::new(), fx.config(None)).await;
        assert_eq!(worker.path(), fx.path.as_path());

        fx.append("INFO after start\n");
        worker.handle();

        for _ in 0..200 {
            if fx.processor.records().len() >= 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            messages(&fx.processor.records()),
            vec!["before start", "after start"]
        );

        worker.stop();
        fx.append("INFO after stop\n");
        worker.handle();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(fx.processor.records().len(), 2);
    }

    #[tokio::test]
    async fn forgotten_worker_clears_stored_offset() {
        let fx = Fixture::new();
        fx.append("INFO one\n");
        let worker = FileWorker::start(fx.path.clone(), ExtensionData::new(), fx.config(None)).await;
        worker.handle();

        for _ in 0..200 {
            if fx.stored_offset().await == 9 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(fx.stored_offset().await, 9);

        worker.forget().await;
        assert_eq!(fx.stored_offset().await, 0);

        fx.append("INFO two\n");
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(fx.stored_offset().await, 0);
        assert_eq!(messages(&fx.processor.records()), vec!["one"]);
    }
}
