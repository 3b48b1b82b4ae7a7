//! Newline-delimited-JSON file back-end for the event journal.
//!
//! One JSON object per line, append order == file order. A single
//! `tokio::sync::Mutex` serializes appends within this process; an
//! advisory `flock` on the file additionally guards against a second
//! process appending to the same file

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::event::{Event, NewEvent};
use crate::journal::{Journal, JournalError, Result};

pub struct NdjsonJournal {
    path: PathBuf,
    /// In-process serialization point; also caches the last hash so
    /// `append` need not re-read the whole file on every call.
    state: Mutex<Option<String>>,
}

impl NdjsonJournal {
    /// Open (creating if absent) the journal file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let path_for_blocking = path.clone();
        let last_hash = tokio::task::spawn_blocking(move || read_last_hash(&path_for_blocking))
            .await
            .expect("blocking read task panicked")?;
        Ok(Self {
            path,
            state: Mutex::new(last_hash),
        })
    }
}

fn read_last_hash(path: &Path) -> Result<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    let file = std::fs::File::open(path)?;
    let reader = BufReader::new(file);
    let mut last: Option<String> = None;
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = serde_json::from_str(&line)?;
        last = Some(event.hash);
    }
    Ok(last)
}

#[async_trait]
impl Journal for NdjsonJournal {
    async fn append(&self, new: NewEvent) -> Result<Event> {
        let mut guard = self.state.lock().await;
        let event = Event::chain(new, guard.clone());
        let line = serde_json::to_string(&event)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || append_line(&path, &line))
            .await
            .expect("blocking write task panicked")?;
        *guard = Some(event.hash.clone());
        Ok(event)
    }

    async fn scan(&self, since: Option<&str>, limit: Option<usize>) -> Result<Vec<Event>> {
        let path = self.path.clone();
        let since = since.map(str::to_owned);
        tokio::task::spawn_blocking(move || {
            if !path.exists() {
                return Ok(Vec::new());
            }
            let file = std::fs::File::open(&path)?;
            let reader = BufReader::new(file);
            let mut events = Vec::new();
            let mut seen_since = since.is_none();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                let event: Event = serde_json::from_str(&line)?;
                if !seen_since {
                    if since.as_deref() == Some(event.event_id.as_str()) {
                        seen_since = true;
                    }
                    continue;
                }
                events.push(event);
                if let Some(limit) = limit {
                    if events.len() >= limit {
                        break;
                    }
                }
            }
            Ok(events)
        })
        .await
        .expect("blocking scan task panicked")
    }

    async fn last_hash(&self) -> Result<Option<String>> {
        Ok(self.state.lock().await.clone())
    }
}

/// Append one line to the file, taking an exclusive advisory lock for
/// the duration of the write, then fsync before returning (durability).
fn append_line(path: &Path, line: &str) -> Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    lock_exclusive(&file)?;
    let result = (|| -> std::io::Result<()> {
        writeln!(file, "{line}")?;
        file.sync_all()?;
        Ok(())
    })();
    let _ = unlock(&file);
    result.map_err(JournalError::Io)
}

fn lock_exclusive(file: &std::fs::File) -> std::io::Result<()> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

fn unlock(file: &std::fs::File) -> std::io::Result<()> {
    let ret = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_UN) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventType;
    use chrono::Utc;

    fn new_event(id: &str) -> NewEvent {
        NewEvent {
            event_id: id.to_owned(),
            event_type: EventType::TaskCreated,
            timestamp: Utc::now(),
            actor_id: "scheduler".to_owned(),
            payload: serde_json::json!({"id": id}),
        }
    }

    #[tokio::test]
    async fn append_and_scan_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let journal = NdjsonJournal::open(dir.path().join("journal.ndjson"))
            .await
            .unwrap();

        let e1 = journal.append(new_event("e1")).await.unwrap();
        let e2 = journal.append(new_event("e2")).await.unwrap();

        assert!(e1.prev_hash.is_none());
        assert_eq!(e2.prev_hash, Some(e1.hash.clone()));

        let scanned = journal.scan(None, None).await.unwrap();
        assert_eq!(scanned.len(), 2);
        assert_eq!(scanned[0].event_id, "e1");
        assert_eq!(scanned[1].event_id, "e2");
    }

    #[tokio::test]
    async fn scan_since_excludes_the_marker_event() {
        let dir = tempfile::tempdir().unwrap();
        let journal = NdjsonJournal::open(dir.path().join("journal.ndjson"))
            .await
            .unwrap();
        journal.append(new_event("e1")).await.unwrap();
        journal.append(new_event("e2")).await.unwrap();
        journal.append(new_event("e3")).await.unwrap();

        let scanned = journal.scan(Some("e1"), None).await.unwrap();
        assert_eq!(
            scanned.iter().map(|e| e.event_id.as_str()).collect::<Vec<_>>(),
            vec!["e2", "e3"]
        );
    }

    #[tokio::test]
    async fn scan_respects_limit() {
        let dir = tempfile::tempdir().unwrap();
        let journal = NdjsonJournal::open(dir.path().join("journal.ndjson"))
            .await
            .unwrap();
        for i in 0..5 {
            journal.append(new_event(&format!("e{i}"))).await.unwrap();
        }
        let scanned = journal.scan(None, Some(2)).await.unwrap();
        assert_eq!(scanned.len(), 2);
    }

    #[tokio::test]
    async fn verify_succeeds_on_untampered_journal() {
        let dir = tempfile::tempdir().unwrap();
        let journal = NdjsonJournal::open(dir.path().join("journal.ndjson"))
            .await
            .unwrap();
        for i in 0..3 {
            journal.append(new_event(&format!("e{i}"))).await.unwrap();
        }
        assert_eq!(journal.verify().await.unwrap(), crate::journal::VerifyOutcome::Ok);
    }

    #[tokio::test]
    async fn verify_detects_tampered_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.ndjson");
        let journal = NdjsonJournal::open(&path).await.unwrap();
        journal.append(new_event("e0")).await.unwrap();
        journal.append(new_event("e1")).await.unwrap();
        journal.append(new_event("e2")).await.unwrap();

        // Tamper with the middle event's payload without touching its hash.
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        let mut lines: Vec<String> = contents.lines().map(str::to_owned).collect();
        let mut middle: Event = serde_json::from_str(&lines[1]).unwrap();
        middle.payload = serde_json::json!({"id": "tampered"});
        lines[1] = serde_json::to_string(&middle).unwrap();
        tokio::fs::write(&path, lines.join("\n") + "\n").await.unwrap();

        let reopened = NdjsonJournal::open(&path).await.unwrap();
        match reopened.verify().await.unwrap() {
            crate::journal::VerifyOutcome::Tampered { event_id, .. } => {
                assert_eq!(event_id, "e1");
            }
            crate::journal::VerifyOutcome::Ok => panic!("expected tamper detection"),
        }
    }

    #[tokio::test]
    async fn reopening_resumes_the_chain() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.ndjson");
        let first = NdjsonJournal::open(&path).await.unwrap();
        let e1 = first.append(new_event("e1")).await.unwrap();

        let reopened = NdjsonJournal::open(&path).await.unwrap();
        let e2 = reopened.append(new_event("e2")).await.unwrap();
        assert_eq!(e2.prev_hash, Some(e1.hash));
    }
}
