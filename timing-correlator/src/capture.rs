//! Capture adapters: where decoded packet records come from.
//!
//! The correlation engine never touches a NIC.  It consumes a
//! [`CaptureSource`], a lazy and restartable stream of [`PacketRecord`]s:
//!
//! | Source            | Backing                                        | `restart()`          |
//! |-------------------|------------------------------------------------|----------------------|
//! | [`ReplaySource`]  | JSON-lines file recorded earlier                | rewinds to line 1    |
//! | [`MemorySource`]  | in-memory records (tests, simulator output)     | rewinds to index 0   |
//! | [`CommandSource`] | external capture tool printing JSON-lines       | re-spawns the tool   |
//!
//! A line that fails to decode yields `Some(Err(CaptureError::Decode { .. }))`
//! for that line only; the next call continues with the following line.
//! All `next_record` implementations here are cancel safe, so the ingestion
//! loop may race them against its control channel.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

use crate::error::CaptureError;
use crate::record::PacketRecord;

/// A restartable stream of decoded packet records.
pub trait CaptureSource {
    /// Next record, `Some(Err(..))` for a bad record or a failed source,
    /// `None` once a finite source is exhausted.
    fn next_record(
        &mut self,
    ) -> impl Future<Output = Option<Result<PacketRecord, CaptureError>>> + Send;

    /// Start over from the beginning (or re-attach to a live capture).
    fn restart(&mut self) -> impl Future<Output = Result<(), CaptureError>> + Send;
}

fn decode_line(line: &str, line_no: u64) -> Option<Result<PacketRecord, CaptureError>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    Some(
        PacketRecord::from_json(line)
            .map_err(|source| CaptureError::Decode { line: line_no, source }),
    )
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum MemoryItem {
    Record(PacketRecord),
    Raw(String),
}

/// Records held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    items: Vec<MemoryItem>,
    pos: usize,
}

impl MemorySource {
    pub fn new(records: Vec<PacketRecord>) -> Self {
        Self {
            items: records.into_iter().map(MemoryItem::Record).collect(),
            pos: 0,
        }
    }

    /// Build from JSON-lines text; lines are decoded lazily so that bad
    /// lines surface as per-record errors.
    pub fn from_json_lines(text: &str) -> Self {
        Self {
            items: text
                .lines()
                .filter(|l| !l.trim().is_empty())
                .map(|l| MemoryItem::Raw(l.to_string()))
                .collect(),
            pos: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl CaptureSource for MemorySource {
    async fn next_record(&mut self) -> Option<Result<PacketRecord, CaptureError>> {
        let item = self.items.get(self.pos)?;
        self.pos += 1;
        match item {
            MemoryItem::Record(rec) => Some(Ok(rec.clone())),
            MemoryItem::Raw(line) => decode_line(line, self.pos as u64),
        }
    }

    async fn restart(&mut self) -> Result<(), CaptureError> {
        self.pos = 0;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ReplaySource
// ---------------------------------------------------------------------------

/// A JSON-lines record file replayed from disk.
#[derive(Debug)]
pub struct ReplaySource {
    path: PathBuf,
    lines: Lines<BufReader<File>>,
    line_no: u64,
}

impl ReplaySource {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let path = path.as_ref().to_path_buf();
        let lines = BufReader::new(File::open(&path).await?).lines();
        Ok(Self { path, lines, line_no: 0 })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CaptureSource for ReplaySource {
    async fn next_record(&mut self) -> Option<Result<PacketRecord, CaptureError>> {
        loop {
            let line = match self.lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => return None,
                Err(e) => return Some(Err(e.into())),
            };
            self.line_no += 1;
            if let Some(decoded) = decode_line(&line, self.line_no) {
                return Some(decoded);
            }
        }
    }

    async fn restart(&mut self) -> Result<(), CaptureError> {
        self.lines = BufReader::new(File::open(&self.path).await?).lines();
        self.line_no = 0;
        log::debug!("[capture] rewound {}", self.path.display());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// CommandSource
// ---------------------------------------------------------------------------

/// An external capture tool that prints one JSON record per line on stdout.
///
/// A live capture never ends on its own, so the child exiting is reported as
/// a source failure (`CaptureError::Command`) rather than as exhaustion.
#[derive(Debug)]
pub struct CommandSource {
    program: String,
    args: Vec<String>,
    child: Option<Child>,
    lines: Option<Lines<BufReader<ChildStdout>>>,
    line_no: u64,
}

impl CommandSource {
    pub fn spawn(program: impl Into<String>, args: Vec<String>) -> Result<Self, CaptureError> {
        let mut source = Self {
            program: program.into(),
            args,
            child: None,
            lines: None,
            line_no: 0,
        };
        source.launch()?;
        Ok(source)
    }

    fn launch(&mut self) -> Result<(), CaptureError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| CaptureError::Command("capture command has no stdout".into()))?;
        log::info!(
            "[capture] started `{} {}` (pid {:?})",
            self.program,
            self.args.join(" "),
            child.id()
        );
        self.lines = Some(BufReader::new(stdout).lines());
        self.child = Some(child);
        self.line_no = 0;
        Ok(())
    }

    async fn reap(&mut self) -> String {
        self.lines = None;
        match self.child.take() {
            Some(mut child) => match child.wait().await {
                Ok(status) => status.to_string(),
                Err(e) => e.to_string(),
            },
            None => "not running".to_string(),
        }
    }
}

impl CaptureSource for CommandSource {
    async fn next_record(&mut self) -> Option<Result<PacketRecord, CaptureError>> {
        loop {
            let Some(lines) = self.lines.as_mut() else {
                return Some(Err(CaptureError::Command(format!(
                    "`{}` is not running",
                    self.program
                ))));
            };
            match lines.next_line().await {
                Ok(Some(line)) => {
                    self.line_no += 1;
                    if let Some(decoded) = decode_line(&line, self.line_no) {
                        return Some(decoded);
                    }
                }
                Ok(None) => {
                    let status = self.reap().await;
                    return Some(Err(CaptureError::Command(format!(
                        "`{}` exited ({status})",
                        self.program
                    ))));
                }
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn restart(&mut self) -> Result<(), CaptureError> {
        if let Some(child) = self.child.as_mut() {
            let _ = child.start_kill();
        }
        self.reap().await;
        self.launch()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD: &str = r#"{"sniff_timestamp":"1.0","http":{"request_target":"/set-byte/1"}}"#;

    #[tokio::test]
    async fn memory_source_yields_then_ends() {
        let mut src = MemorySource::new(vec![PacketRecord::default(), PacketRecord::default()]);
        assert!(src.next_record().await.unwrap().is_ok());
        assert!(src.next_record().await.unwrap().is_ok());
        assert!(src.next_record().await.is_none());

        src.restart().await.unwrap();
        assert!(src.next_record().await.is_some());
    }

    #[tokio::test]
    async fn bad_line_is_record_local() {
        let text = format!("{GOOD}\nnot json\n\n{GOOD}\n");
        let mut src = MemorySource::from_json_lines(&text);
        assert_eq!(src.len(), 3);

        assert!(src.next_record().await.unwrap().is_ok());
        let err = src.next_record().await.unwrap().unwrap_err();
        assert!(err.is_record_local());
        assert!(matches!(err, CaptureError::Decode { line: 2, .. }));
        assert!(src.next_record().await.unwrap().is_ok());
        assert!(src.next_record().await.is_none());
    }

    #[tokio::test]
    async fn replay_source_reads_and_rewinds() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.jsonl");
        std::fs::write(&path, format!("{GOOD}\n\n{GOOD}\n")).unwrap();

        let mut src = ReplaySource::open(&path).await.unwrap();
        let mut n = 0;
        while let Some(rec) = src.next_record().await {
            let rec = rec.unwrap();
            assert_eq!(rec.request_target(), Some("/set-byte/1"));
            n += 1;
        }
        assert_eq!(n, 2);

        src.restart().await.unwrap();
        assert!(src.next_record().await.is_some());
    }

    #[tokio::test]
    async fn replay_source_missing_file_is_io_error() {
        let err = ReplaySource::open("/definitely/not/here.jsonl").await.unwrap_err();
        assert!(matches!(err, CaptureError::Io(_)));
        assert!(!err.is_record_local());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_source_exit_is_a_source_failure() {
        let mut src =
            CommandSource::spawn("sh", vec!["-c".into(), format!("echo '{GOOD}'")]).unwrap();
        assert!(src.next_record().await.unwrap().is_ok());

        let err = src.next_record().await.unwrap().unwrap_err();
        assert!(matches!(err, CaptureError::Command(_)));

        src.restart().await.unwrap();
        assert!(src.next_record().await.unwrap().is_ok());
    }
}
