use std::path::{Path, PathBuf};

use anyhow::Result;

/// Two-layer memory: MEMORY.md (long-term facts) plus HISTORY.md
/// (append-only, grep-searchable event log), with optional daily notes.
#[derive(Clone)]
pub struct MemoryStore {
    memory_dir: PathBuf,
}

impl MemoryStore {
    pub fn new(workspace: &Path) -> Self {
        Self {
            memory_dir: workspace.join("memory"),
        }
    }

    pub fn memory_path(&self) -> PathBuf {
        self.memory_dir.join("MEMORY.md")
    }

    pub fn history_path(&self) -> PathBuf {
        self.memory_dir.join("HISTORY.md")
    }

    fn today_notes_path(&self) -> PathBuf {
        let today = chrono::Local::now().format("%Y-%m-%d");
        self.memory_dir.join(format!("{today}.md"))
    }

    pub fn read_long_term(&self) -> Result<String> {
        read_if_exists(&self.memory_path())
    }

    pub fn write_long_term(&self, content: &str) -> Result<()> {
        std::fs::create_dir_all(&self.memory_dir)?;
        Ok(std::fs::write(self.memory_path(), content)?)
    }

    pub fn append_history(&self, entry: &str) -> Result<()> {
        use std::io::Write;
        std::fs::create_dir_all(&self.memory_dir)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())?;
        writeln!(file, "\n{entry}")?;
        Ok(())
    }

    /// Long-term memory plus today's notes, for the system prompt.
    pub fn memory_context(&self) -> String {
        let mut parts = Vec::new();

        if let Ok(memory) = self.read_long_term() {
            if !memory.is_empty() {
                parts.push(memory);
            }
        }
        if let Ok(notes) = read_if_exists(&self.today_notes_path()) {
            if !notes.is_empty() {
                parts.push(format!("## Today's Notes\n\n{notes}"));
            }
        }

        parts.join("\n\n")
    }
}

fn read_if_exists(path: &Path) -> Result<String> {
    if path.exists() {
        Ok(std::fs::read_to_string(path)?)
    } else {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_files_read_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        assert_eq!(store.read_long_term().unwrap(), "");
        assert_eq!(store.memory_context(), "");
    }

    #[test]
    fn write_creates_directories_and_overwrites() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        assert!(!dir.path().join("memory").exists());

        store.write_long_term("old").unwrap();
        store.write_long_term("new").unwrap();
        assert_eq!(store.read_long_term().unwrap(), "new");
        assert!(dir.path().join("memory/MEMORY.md").exists());
    }

    #[test]
    fn history_is_append_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());

        store.append_history("[2026-01-01] First entry").unwrap();
        store.append_history("[2026-01-02] Second entry").unwrap();

        let content = std::fs::read_to_string(store.history_path()).unwrap();
        let first = content.find("First entry").unwrap();
        let second = content.find("Second entry").unwrap();
        assert!(first < second);
    }

    #[test]
    fn context_includes_todays_notes() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.write_long_term("User likes Rust").unwrap();

        let today = chrono::Local::now().format("%Y-%m-%d");
        std::fs::write(
            dir.path().join("memory").join(format!("{today}.md")),
            "Buy milk",
        )
        .unwrap();

        let ctx = store.memory_context();
        assert!(ctx.contains("User likes Rust"));
        assert!(ctx.contains("Today's Notes"));
        assert!(ctx.contains("Buy milk"));
    }

    #[test]
    fn unicode_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        let text = "User speaks 中文 and русский 🦀";
        store.write_long_term(text).unwrap();
        assert_eq!(store.read_long_term().unwrap(), text);
    }
}
