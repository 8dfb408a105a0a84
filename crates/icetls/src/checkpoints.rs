use std::collections::BTreeMap;
use std::fs;
use std::io::Write as _;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::fsutil::{atomic_write, ensure_dir};

const CHECKPOINT_DOC: &str = "checkpoint.json";
const FILES_DIR: &str = "files";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckpointKind {
    // Survives until finalized into the permanent history.
    Durable,
    // An in-flight trial change; recovery rolls it back unconditionally.
    Ephemeral,
}

impl CheckpointKind {
    fn as_str(self) -> &'static str {
        match self {
            CheckpointKind::Durable => "durable",
            CheckpointKind::Ephemeral => "ephemeral",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct FileSnapshot {
    original: PathBuf,
    backup_rel: String,
    sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointDoc {
    version: u32,
    kind: CheckpointKind,
    created_at: String,
    title: Option<String>,
    finalized_at: Option<String>,
    notes: Vec<String>,
    files: Vec<FileSnapshot>,
}

impl CheckpointDoc {
    fn open(kind: CheckpointKind) -> Self {
        Self {
            version: 1,
            kind,
            created_at: now_rfc3339(),
            title: None,
            finalized_at: None,
            notes: Vec::new(),
            files: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexDoc {
    version: u32,
    next_id: u64,
    // Oldest to newest; rollback pops from the back.
    entries: Vec<IndexEntry>,
}

impl Default for IndexDoc {
    fn default() -> Self {
        Self {
            version: 1,
            next_id: 1,
            entries: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    id: String,
    title: String,
    finalized_at: String,
    file_count: usize,
}

#[derive(Debug, Clone)]
pub struct CheckpointSummary {
    pub id: String,
    pub title: String,
    pub finalized_at: String,
    pub file_count: usize,
}

#[derive(Debug, Clone)]
pub struct RollbackEntry {
    pub id: String,
    pub title: String,
    pub restored: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RecoveryReport {
    pub kind: CheckpointKind,
    pub restored: Vec<PathBuf>,
    pub notes: Vec<String>,
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

// File-backed checkpoint store rooted at an explicit directory. No ambient
// state: construct, optionally run `recover`, use, drop.
pub struct CheckpointStore {
    root: PathBuf,
}

impl CheckpointStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        ensure_dir(&root)?;
        ensure_dir(&root.join("finalized"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn temp_dir(&self) -> PathBuf {
        self.root.join("temp")
    }

    fn finalized_root(&self) -> PathBuf {
        self.root.join("finalized")
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    fn load_index(&self) -> Result<IndexDoc> {
        load_json_or_default(&self.index_path(), "checkpoint index")
    }

    fn save_index(&self, idx: &IndexDoc) -> Result<()> {
        save_json(&self.index_path(), idx, "checkpoint index")
    }

    fn load_temp(&self) -> Result<Option<CheckpointDoc>> {
        let p = self.temp_dir().join(CHECKPOINT_DOC);
        if !p.is_file() {
            return Ok(None);
        }
        Ok(Some(load_json(&p, "temporary checkpoint")?))
    }

    fn save_temp(&self, doc: &CheckpointDoc) -> Result<()> {
        save_json(&self.temp_dir().join(CHECKPOINT_DOC), doc, "temporary checkpoint")
    }

    // Back the given files up (once each) into the open durable checkpoint,
    // opening one if needed, and record the note.
    pub fn add_to_checkpoint(&self, files: &[PathBuf], note: &str) -> Result<()> {
        self.add(files, note, CheckpointKind::Durable)
    }

    // Same, but the checkpoint is ephemeral: it never survives a restart and
    // can never be finalized.
    pub fn add_to_temp_checkpoint(&self, files: &[PathBuf], note: &str) -> Result<()> {
        self.add(files, note, CheckpointKind::Ephemeral)
    }

    fn add(&self, files: &[PathBuf], note: &str, kind: CheckpointKind) -> Result<()> {
        let mut doc = match self.load_temp()? {
            Some(doc) => {
                if doc.kind != kind {
                    return Err(Error::msg(format!(
                        "a {} checkpoint is already open; finalize or discard it first",
                        doc.kind.as_str()
                    )));
                }
                doc
            }
            None => CheckpointDoc::open(kind),
        };

        let files_dir = self.temp_dir().join(FILES_DIR);
        ensure_dir(&files_dir)?;
        for path in files {
            let abs = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
            if doc.files.iter().any(|f| f.original == abs) {
                continue;
            }
            let data = fs::read(&abs)
                .map_err(|e| Error::Backup(format!("failed to read {}: {e}", abs.display())))?;
            let ordinal = doc.files.len();
            let backup_rel = format!("{FILES_DIR}/{ordinal}");
            fs::write(files_dir.join(ordinal.to_string()), &data).map_err(|e| {
                Error::Backup(format!(
                    "failed to copy {} into {}: {e}",
                    abs.display(),
                    files_dir.display()
                ))
            })?;
            doc.files.push(FileSnapshot {
                original: abs,
                backup_rel,
                sha256: sha256_hex(&data),
            });
        }

        let note = note.trim();
        if !note.is_empty() {
            doc.notes.push(note.to_string());
        }
        self.save_temp(&doc)
    }

    // Promote the open durable checkpoint into the permanent history under
    // the next ordinal id.
    pub fn finalize_checkpoint(&self, title: &str) -> Result<String> {
        let Some(mut doc) = self.load_temp()? else {
            return Err(Error::NoChangesToFinalize);
        };
        if doc.kind == CheckpointKind::Ephemeral {
            return Err(Error::msg(
                "the open checkpoint is ephemeral and cannot be finalized",
            ));
        }
        if doc.files.is_empty() {
            return Err(Error::NoChangesToFinalize);
        }

        let mut idx = self.load_index()?;
        let id = format!("{:04}", idx.next_id);
        doc.title = Some(title.to_string());
        doc.finalized_at = Some(now_rfc3339());
        // The manifest carries the title before the rename so an interrupted
        // promotion can be adopted by recovery.
        self.save_temp(&doc)?;

        let dest = self.finalized_root().join(&id);
        fs::rename(self.temp_dir(), &dest).map_err(|e| {
            Error::msg(format!(
                "failed to promote checkpoint to {}: {e}",
                dest.display()
            ))
        })?;

        idx.next_id += 1;
        idx.entries.push(IndexEntry {
            id: id.clone(),
            title: title.to_string(),
            finalized_at: doc.finalized_at.clone().unwrap_or_default(),
            file_count: doc.files.len(),
        });
        self.save_index(&idx)?;
        Ok(id)
    }

    // Drop the open temporary checkpoint without touching the originals.
    // Used when a deploy is abandoned before anything was rewritten.
    pub fn discard_temp_checkpoint(&self) -> Result<()> {
        let dir = self.temp_dir();
        if dir.exists() {
            fs::remove_dir_all(&dir).map_err(|e| {
                Error::msg(format!("failed to discard {}: {e}", dir.display()))
            })?;
        }
        Ok(())
    }

    // Undo the `n` most recent finalized checkpoints, newest first.
    // All-or-nothing: every restoration is staged and verified before any
    // target file is replaced.
    pub fn rollback(&self, n: usize) -> Result<Vec<RollbackEntry>> {
        if n == 0 {
            return Ok(Vec::new());
        }
        let mut idx = self.load_index()?;
        let available = idx.entries.len();
        if n > available {
            return Err(Error::InsufficientCheckpoints {
                requested: n,
                available,
            });
        }

        let selected: Vec<IndexEntry> =
            idx.entries[available - n..].iter().rev().cloned().collect();

        // Walk newest-first; for a file touched by several of the selected
        // checkpoints the oldest backup ends up staged, which is the
        // pre-state of the whole span.
        let mut staged: BTreeMap<PathBuf, Vec<u8>> = BTreeMap::new();
        let mut entries_out = Vec::new();
        for entry in &selected {
            let dir = self.finalized_root().join(&entry.id);
            let doc: CheckpointDoc =
                load_json(&dir.join(CHECKPOINT_DOC), "finalized checkpoint")?;
            let mut restored = Vec::new();
            for snap in &doc.files {
                staged.insert(snap.original.clone(), read_backup(&dir, snap)?);
                restored.push(snap.original.clone());
            }
            entries_out.push(RollbackEntry {
                id: entry.id.clone(),
                title: doc.title.unwrap_or_default(),
                restored,
            });
        }

        restore_staged(&staged)?;

        for entry in &selected {
            let dir = self.finalized_root().join(&entry.id);
            fs::remove_dir_all(&dir).map_err(|e| {
                Error::msg(format!("failed to delete {}: {e}", dir.display()))
            })?;
        }
        idx.entries.truncate(available - n);
        self.save_index(&idx)?;
        Ok(entries_out)
    }

    // Startup routine. Repairs the aftermath of an interrupted run:
    //  - index entries whose directories are gone (interrupted rollback)
    //  - finalized directories missing from the index (interrupted finalize)
    //  - a leftover temporary checkpoint, which is rolled back and deleted
    pub fn recover(&self) -> Result<Option<RecoveryReport>> {
        self.reconcile_index()?;

        let Some(doc) = self.load_temp()? else {
            return Ok(None);
        };
        let dir = self.temp_dir();
        let mut staged: BTreeMap<PathBuf, Vec<u8>> = BTreeMap::new();
        let mut restored = Vec::new();
        for snap in &doc.files {
            staged.insert(snap.original.clone(), read_backup(&dir, snap)?);
            restored.push(snap.original.clone());
        }
        restore_staged(&staged)?;
        fs::remove_dir_all(&dir)
            .map_err(|e| Error::msg(format!("failed to delete {}: {e}", dir.display())))?;
        Ok(Some(RecoveryReport {
            kind: doc.kind,
            restored,
            notes: doc.notes,
        }))
    }

    fn reconcile_index(&self) -> Result<()> {
        let mut idx = self.load_index()?;
        let mut dirty = false;

        let before = idx.entries.len();
        idx.entries
            .retain(|e| self.finalized_root().join(&e.id).join(CHECKPOINT_DOC).is_file());
        dirty |= idx.entries.len() != before;

        for (id, ordinal) in self.finalized_dir_ids()? {
            if idx.entries.iter().any(|e| e.id == id) {
                continue;
            }
            let doc: CheckpointDoc = load_json(
                &self.finalized_root().join(&id).join(CHECKPOINT_DOC),
                "finalized checkpoint",
            )?;
            let Some(finalized_at) = doc.finalized_at else {
                continue;
            };
            idx.entries.push(IndexEntry {
                id,
                title: doc.title.unwrap_or_default(),
                finalized_at,
                file_count: doc.files.len(),
            });
            idx.next_id = idx.next_id.max(ordinal + 1);
            dirty = true;
        }

        if dirty {
            idx.entries
                .sort_by_key(|e| e.id.parse::<u64>().unwrap_or(u64::MAX));
            self.save_index(&idx)?;
        }
        Ok(())
    }

    fn finalized_dir_ids(&self) -> Result<Vec<(String, u64)>> {
        let root = self.finalized_root();
        let mut out = Vec::new();
        let entries = fs::read_dir(&root)
            .map_err(|e| Error::msg(format!("failed to list {}: {e}", root.display())))?;
        for entry in entries {
            let entry =
                entry.map_err(|e| Error::msg(format!("failed to list {}: {e}", root.display())))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if let Ok(ordinal) = name.parse::<u64>() {
                out.push((name, ordinal));
            }
        }
        out.sort_by_key(|(_, ordinal)| *ordinal);
        Ok(out)
    }

    // Human-readable view of the open temporary checkpoint: its notes plus
    // each tracked file with a changed/unchanged marker against its backup.
    pub fn list_pending_changes(&self) -> Result<String> {
        let Some(doc) = self.load_temp()? else {
            return Ok("no changes pending".to_string());
        };
        let mut out = format!(
            "pending {} checkpoint opened {}\n",
            doc.kind.as_str(),
            doc.created_at
        );
        if !doc.notes.is_empty() {
            out.push_str("notes:\n");
            for note in &doc.notes {
                out.push_str(&format!("  - {note}\n"));
            }
        }
        out.push_str("files:\n");
        for snap in &doc.files {
            let marker = match fs::read(&snap.original) {
                Ok(current) if sha256_hex(&current) == snap.sha256 => "unchanged",
                Ok(_) => "changed",
                Err(_) => "missing",
            };
            out.push_str(&format!("  {} [{marker}]\n", snap.original.display()));
        }
        Ok(out)
    }

    // Finalized history, oldest first.
    pub fn history(&self) -> Result<Vec<CheckpointSummary>> {
        Ok(self
            .load_index()?
            .entries
            .iter()
            .map(|e| CheckpointSummary {
                id: e.id.clone(),
                title: e.title.clone(),
                finalized_at: e.finalized_at.clone(),
                file_count: e.file_count,
            })
            .collect())
    }
}

fn read_backup(checkpoint_dir: &Path, snap: &FileSnapshot) -> Result<Vec<u8>> {
    let backup = checkpoint_dir.join(&snap.backup_rel);
    let data = fs::read(&backup)
        .map_err(|e| Error::Backup(format!("failed to read {}: {e}", backup.display())))?;
    if sha256_hex(&data) != snap.sha256 {
        return Err(Error::Backup(format!(
            "backup for {} is corrupt (checksum mismatch)",
            snap.original.display()
        )));
    }
    Ok(data)
}

// Stage every restoration next to its target, then rename-swap them in.
// A failure while staging deletes the staged files and leaves every target
// exactly as it was.
fn restore_staged(staged: &BTreeMap<PathBuf, Vec<u8>>) -> Result<()> {
    let mut pending: Vec<(tempfile::NamedTempFile, &Path)> = Vec::new();
    for (target, data) in staged {
        let parent = target.parent().ok_or_else(|| {
            Error::Write(format!("{} has no parent directory", target.display()))
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent).map_err(|e| {
            Error::Write(format!(
                "failed to stage restore for {}: {e}",
                target.display()
            ))
        })?;
        tmp.write_all(data).map_err(|e| {
            Error::Write(format!(
                "failed to stage restore for {}: {e}",
                target.display()
            ))
        })?;
        pending.push((tmp, target.as_path()));
    }
    for (tmp, target) in pending {
        tmp.persist(target).map_err(|e| {
            Error::Write(format!("failed to replace {}: {}", target.display(), e.error))
        })?;
    }
    Ok(())
}

fn load_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let raw = fs::read_to_string(path)
        .map_err(|e| Error::msg(format!("failed to read {what} {}: {e}", path.display())))?;
    serde_json::from_str(&raw)
        .map_err(|e| Error::msg(format!("failed to parse {what} {}: {e}", path.display())))
}

fn load_json_or_default<T: serde::de::DeserializeOwned + Default>(
    path: &Path,
    what: &str,
) -> Result<T> {
    if !path.is_file() {
        return Ok(T::default());
    }
    load_json(path, what)
}

fn save_json<T: Serialize>(path: &Path, value: &T, what: &str) -> Result<()> {
    let body = serde_json::to_string_pretty(value)
        .map_err(|e| Error::msg(format!("failed to encode {what}: {e}")))?;
    atomic_write(path, body.as_bytes())
}
