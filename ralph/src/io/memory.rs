//! The three memory files and the write-if-unchanged enforcer.
//!
//! Each file is hashed before the iteration and again after validation. A file
//! whose hash did not move gets a synthetic entry appended, so every file
//! changes every iteration regardless of what the agent did.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use crate::core::memory::{FallbackContext, MemoryTier, render_fallback};
use crate::core::text::tail_lines;
use crate::io::config::LoopPaths;

/// Content hashes of the three files at one checkpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryHashes {
    hashes: BTreeMap<MemoryTier, String>,
}

impl MemoryHashes {
    pub fn get(&self, tier: MemoryTier) -> &str {
        self.hashes.get(&tier).map(String::as_str).unwrap_or_default()
    }

    /// Tiers whose hash differs between `self` and `later`.
    pub fn changed(&self, later: &MemoryHashes) -> Vec<MemoryTier> {
        MemoryTier::ALL
            .into_iter()
            .filter(|tier| self.get(*tier) != later.get(*tier))
            .collect()
    }
}

/// Trailing windows of the three files, for the prompt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryTails {
    pub guardrails: String,
    pub style: String,
    pub recent: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryFiles {
    guardrails: PathBuf,
    style: PathBuf,
    recent: PathBuf,
}

impl MemoryFiles {
    pub fn new(guardrails: PathBuf, style: PathBuf, recent: PathBuf) -> Self {
        Self {
            guardrails,
            style,
            recent,
        }
    }

    pub fn from_paths(paths: &LoopPaths) -> Self {
        Self::new(
            paths.guardrails.clone(),
            paths.style.clone(),
            paths.recent.clone(),
        )
    }

    pub fn path(&self, tier: MemoryTier) -> &Path {
        match tier {
            MemoryTier::Guardrails => &self.guardrails,
            MemoryTier::Style => &self.style,
            MemoryTier::Recent => &self.recent,
        }
    }

    /// Create missing files with their header. Returns the tiers created.
    pub fn ensure_headers(&self) -> Result<Vec<MemoryTier>> {
        let mut created = Vec::new();
        for tier in MemoryTier::ALL {
            let path = self.path(tier);
            if path.exists() {
                continue;
            }
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("create memory dir {}", parent.display()))?;
            }
            fs::write(path, tier.header())
                .with_context(|| format!("write memory header {}", path.display()))?;
            debug!(tier = tier.as_str(), path = %path.display(), "memory file created");
            created.push(tier);
        }
        Ok(created)
    }

    pub fn snapshot(&self) -> Result<MemoryHashes> {
        let mut hashes = BTreeMap::new();
        for tier in MemoryTier::ALL {
            hashes.insert(tier, file_sha256(self.path(tier))?);
        }
        Ok(MemoryHashes { hashes })
    }

    pub fn tails(&self, lines: usize) -> Result<MemoryTails> {
        let tail = |tier: MemoryTier| -> Result<String> {
            Ok(tail_lines(&read_or_empty(self.path(tier))?, lines))
        };
        Ok(MemoryTails {
            guardrails: tail(MemoryTier::Guardrails)?,
            style: tail(MemoryTier::Style)?,
            recent: tail(MemoryTier::Recent)?,
        })
    }

    /// Append a fallback entry to every file whose hash still equals `before`.
    ///
    /// Each tier is checked on its own. Returns the tiers that received an entry.
    #[instrument(skip_all, fields(iteration = ctx.iteration, reason = ctx.reason.as_str()))]
    pub fn enforce(
        &self,
        before: &MemoryHashes,
        ctx: &FallbackContext<'_>,
    ) -> Result<Vec<MemoryTier>> {
        let now = self.snapshot()?;
        let mut appended = Vec::new();
        for tier in MemoryTier::ALL {
            if before.get(tier) != now.get(tier) {
                debug!(tier = tier.as_str(), "memory file changed by agent");
                continue;
            }
            let path = self.path(tier);
            append(path, &render_fallback(tier, ctx))?;
            info!(tier = tier.as_str(), path = %path.display(), "fallback entry appended");
            appended.push(tier);
        }
        Ok(appended)
    }
}

/// Hex SHA-256 of the file; a missing file hashes as empty content.
pub fn file_sha256(path: &Path) -> Result<String> {
    let contents = match fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => Vec::new(),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let mut hasher = Sha256::new();
    hasher.update(contents);
    Ok(hex::encode(hasher.finalize()))
}

fn read_or_empty(path: &Path) -> Result<String> {
    match fs::read(path) {
        Ok(bytes) => Ok(String::from_utf8_lossy(&bytes).into_owned()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(err) => Err(err).with_context(|| format!("read {}", path.display())),
    }
}

fn append(path: &Path, entry: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(entry.as_bytes())
        .with_context(|| format!("append {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{ReasonCode, WorkMode};

    fn files(dir: &Path) -> MemoryFiles {
        MemoryFiles::new(
            dir.join(".agent/GUARDRAILS.md"),
            dir.join(".agent/STYLE.md"),
            dir.join(".agent/RECENT.md"),
        )
    }

    fn ctx(reason: ReasonCode) -> FallbackContext<'static> {
        FallbackContext {
            timestamp: "2026-01-01T00:00:00Z",
            iteration: 1,
            item_id: "A",
            item_title: "First",
            work_mode: WorkMode::Feature,
            agent_exit: 0,
            validation_exit: Some(0),
            reason,
            validation_cmd: None,
            failure_excerpt: &[],
            artifact_dir: "runtime/iterations/run/1",
        }
    }

    #[test]
    fn headers_are_written_once() {
        let temp = tempfile::tempdir().expect("tempdir");
        let memory = files(temp.path());
        assert_eq!(memory.ensure_headers().expect("ensure"), MemoryTier::ALL.to_vec());
        fs::write(memory.path(MemoryTier::Style), "custom\n").expect("write");
        assert!(memory.ensure_headers().expect("ensure").is_empty());
        assert_eq!(
            fs::read_to_string(memory.path(MemoryTier::Style)).expect("read"),
            "custom\n"
        );
    }

    #[test]
    fn missing_file_hashes_as_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        let empty = temp.path().join("empty.md");
        fs::write(&empty, "").expect("write");
        assert_eq!(
            file_sha256(&temp.path().join("missing.md")).expect("hash"),
            file_sha256(&empty).expect("hash")
        );
    }

    #[test]
    fn every_untouched_file_gets_an_entry() {
        let temp = tempfile::tempdir().expect("tempdir");
        let memory = files(temp.path());
        memory.ensure_headers().expect("ensure");
        let before = memory.snapshot().expect("snapshot");

        let appended = memory
            .enforce(&before, &ctx(ReasonCode::Progressed))
            .expect("enforce");
        assert_eq!(appended, MemoryTier::ALL.to_vec());
        let after = memory.snapshot().expect("snapshot");
        assert_eq!(before.changed(&after), MemoryTier::ALL.to_vec());
    }

    /// Files the agent already edited are left alone; the rest are still enforced.
    #[test]
    fn agent_edits_are_respected_per_file() {
        let temp = tempfile::tempdir().expect("tempdir");
        let memory = files(temp.path());
        memory.ensure_headers().expect("ensure");
        let before = memory.snapshot().expect("snapshot");
        append(memory.path(MemoryTier::Guardrails), "- agent note\n").expect("append");
        append(memory.path(MemoryTier::Recent), "- agent note\n").expect("append");

        let appended = memory
            .enforce(&before, &ctx(ReasonCode::Progressed))
            .expect("enforce");
        assert_eq!(appended, vec![MemoryTier::Style]);
        let guardrails =
            fs::read_to_string(memory.path(MemoryTier::Guardrails)).expect("guardrails");
        assert!(!guardrails.contains("Reason:"));
    }

    #[test]
    fn tails_are_bounded() {
        let temp = tempfile::tempdir().expect("tempdir");
        let memory = files(temp.path());
        memory.ensure_headers().expect("ensure");
        let tails = memory.tails(1).expect("tails");
        assert_eq!(tails.guardrails, "Rules and warnings learned during development.");
        assert_eq!(tails.recent, "Recent development activity summaries.");
    }
}
