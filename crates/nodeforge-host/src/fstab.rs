//! `/etc/fstab` editing
//!
//! Only whole lines are added, removed, commented or uncommented; every other
//! line (comments, blank lines, unrelated entries) is written back verbatim.

use crate::error::{HostError, Result};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// One mount entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FstabEntry {
    pub spec: String,
    pub file: String,
    pub vfstype: String,
    pub options: String,
    pub dump: u32,
    pub pass: u32,
}

impl FstabEntry {
    /// A bind mount of `source` onto `target`
    pub fn bind(source: &Path, target: &Path) -> Self {
        Self {
            spec: source.display().to_string(),
            file: target.display().to_string(),
            vfstype: "none".to_string(),
            options: "bind".to_string(),
            dump: 0,
            pass: 0,
        }
    }

    /// Parse an uncommented fstab line
    pub fn parse(line: &str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let mut fields = trimmed.split_whitespace();
        Some(Self {
            spec: fields.next()?.to_string(),
            file: fields.next()?.to_string(),
            vfstype: fields.next()?.to_string(),
            options: fields.next().unwrap_or("defaults").to_string(),
            dump: fields.next().and_then(|f| f.parse().ok()).unwrap_or(0),
            pass: fields.next().and_then(|f| f.parse().ok()).unwrap_or(0),
        })
    }

    pub fn is_swap(&self) -> bool {
        self.vfstype == "swap"
    }
}

impl fmt::Display for FstabEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} {} {} {} {}",
            self.spec, self.file, self.vfstype, self.options, self.dump, self.pass
        )
    }
}

/// An fstab file on disk
#[derive(Debug, Clone)]
pub struct Fstab {
    path: PathBuf,
}

impl Fstab {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_lines(&self) -> Result<Vec<String>> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => Ok(content.lines().map(str::to_string).collect()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(HostError::io(&self.path, e)),
        }
    }

    async fn write_lines(&self, lines: &[String]) -> Result<()> {
        let mut content = lines.join("\n");
        if !content.is_empty() {
            content.push('\n');
        }
        tokio::fs::write(&self.path, content)
            .await
            .map_err(|e| HostError::io(&self.path, e))
    }

    pub async fn entries(&self) -> Result<Vec<FstabEntry>> {
        Ok(self
            .read_lines()
            .await?
            .iter()
            .filter_map(|line| FstabEntry::parse(line))
            .collect())
    }

    /// Whether an active entry mounts onto `mount_point`
    pub async fn has_mount_point(&self, mount_point: &Path) -> Result<bool> {
        Ok(self
            .entries()
            .await?
            .iter()
            .any(|entry| Path::new(&entry.file) == mount_point))
    }

    pub async fn add_entry(&self, entry: &FstabEntry) -> Result<()> {
        let mut lines = self.read_lines().await?;
        lines.push(entry.to_string());
        debug!(path = %self.path.display(), entry = %entry, "Adding fstab entry");
        self.write_lines(&lines).await
    }

    /// Remove every active entry for `mount_point`; returns how many
    pub async fn remove_mount_point(&self, mount_point: &Path) -> Result<usize> {
        let lines = self.read_lines().await?;
        let before = lines.len();
        let kept: Vec<String> = lines
            .into_iter()
            .filter(|line| {
                FstabEntry::parse(line)
                    .map(|entry| Path::new(&entry.file) != mount_point)
                    .unwrap_or(true)
            })
            .collect();
        let removed = before - kept.len();
        if removed > 0 {
            self.write_lines(&kept).await?;
        }
        Ok(removed)
    }

    pub async fn has_active_swap(&self) -> Result<bool> {
        Ok(self.entries().await?.iter().any(FstabEntry::is_swap))
    }

    /// Comment out every active swap entry; returns the original lines
    pub async fn comment_swap(&self) -> Result<Vec<String>> {
        let mut lines = self.read_lines().await?;
        let mut commented = Vec::new();
        for line in lines.iter_mut() {
            if FstabEntry::parse(line).is_some_and(|entry| entry.is_swap()) {
                commented.push(line.clone());
                *line = format!("#{}", line);
            }
        }
        if !commented.is_empty() {
            self.write_lines(&lines).await?;
        }
        Ok(commented)
    }

    /// Uncomment lines previously returned by [`Fstab::comment_swap`];
    /// returns how many were restored
    pub async fn uncomment(&self, originals: &[String]) -> Result<usize> {
        let mut lines = self.read_lines().await?;
        let mut restored = 0;
        for original in originals {
            let commented = format!("#{}", original);
            if let Some(line) = lines.iter_mut().find(|line| **line == commented) {
                *line = original.clone();
                restored += 1;
            }
        }
        if restored > 0 {
            self.write_lines(&lines).await?;
        }
        Ok(restored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const FSTAB: &str = "# /etc/fstab: static file system information.\n\
UUID=3f1c / ext4 errors=remount-ro 0 1\n\
/swap.img none swap sw 0 0\n";

    #[test]
    fn test_parse() {
        let entry = FstabEntry::parse("/swap.img\tnone  swap sw 0 0").unwrap();
        assert!(entry.is_swap());
        assert_eq!(entry.file, "none");

        assert!(FstabEntry::parse("# /swap.img none swap sw 0 0").is_none());
        assert!(FstabEntry::parse("   ").is_none());
        assert!(FstabEntry::parse("only-two fields").is_none());
    }

    #[tokio::test]
    async fn test_bind_entry_lifecycle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fstab");
        std::fs::write(&path, FSTAB).unwrap();
        let fstab = Fstab::new(&path);
        let target = Path::new("/etc/kubernetes");

        assert!(!fstab.has_mount_point(target).await.unwrap());
        fstab
            .add_entry(&FstabEntry::bind(
                Path::new("/var/lib/nodeforge/mounts/etc/kubernetes"),
                target,
            ))
            .await
            .unwrap();
        assert!(fstab.has_mount_point(target).await.unwrap());

        assert_eq!(fstab.remove_mount_point(target).await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), FSTAB);
    }

    #[tokio::test]
    async fn test_swap_comment_and_restore() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fstab");
        std::fs::write(&path, FSTAB).unwrap();
        let fstab = Fstab::new(&path);

        assert!(fstab.has_active_swap().await.unwrap());
        let originals = fstab.comment_swap().await.unwrap();
        assert_eq!(originals, vec!["/swap.img none swap sw 0 0"]);
        assert!(!fstab.has_active_swap().await.unwrap());
        assert!(std::fs::read_to_string(&path)
            .unwrap()
            .contains("#/swap.img none swap sw 0 0"));

        assert_eq!(fstab.uncomment(&originals).await.unwrap(), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), FSTAB);
    }

    #[tokio::test]
    async fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let fstab = Fstab::new(dir.path().join("absent"));
        assert!(fstab.entries().await.unwrap().is_empty());
        assert!(fstab.comment_swap().await.unwrap().is_empty());
        assert!(!dir.path().join("absent").exists());
    }
}
