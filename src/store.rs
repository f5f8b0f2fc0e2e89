use std::fs::{self, File};
use std::io::{self, BufRead, BufReader, BufWriter, Seek, SeekFrom, Write};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, NamedTempFile};

use crate::error::KiraError;

/// Maps stage artifacts to files under one data directory.
///
/// An artifact is complete exactly when its final path exists: writers go to a
/// temporary file in the same directory and are renamed into place on commit.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: Utf8PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<Utf8PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    pub fn path(&self, artifact: &str) -> Utf8PathBuf {
        self.root.join(artifact)
    }

    pub fn ensure_root(&self) -> Result<(), KiraError> {
        fs::create_dir_all(self.root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn exists(&self, artifact: &str) -> bool {
        self.path(artifact).as_std_path().is_file()
    }

    pub fn open_for_write(&self, artifact: &str) -> Result<ArtifactWriter, KiraError> {
        if self.exists(artifact) {
            return Err(KiraError::ArtifactExists(artifact.to_string()));
        }
        self.ensure_root()?;
        let temp = Builder::new()
            .prefix(&format!(".{artifact}."))
            .suffix(".partial")
            .tempfile_in(self.root.as_std_path())
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        Ok(ArtifactWriter {
            name: artifact.to_string(),
            target: self.path(artifact),
            inner: BufWriter::new(temp),
        })
    }

    pub fn open_for_read(&self, artifact: &str) -> Result<BufReader<File>, KiraError> {
        let path = self.path(artifact);
        let file = File::open(path.as_std_path()).map_err(|err| match err.kind() {
            io::ErrorKind::NotFound => KiraError::ArtifactNotFound(artifact.to_string()),
            _ => KiraError::Filesystem(format!("open {path}: {err}")),
        })?;
        Ok(BufReader::new(file))
    }

    /// Non-empty lines of a text artifact.
    pub fn read_lines(&self, artifact: &str) -> Result<Vec<String>, KiraError> {
        let mut lines = Vec::new();
        self.for_each_line(artifact, |line| {
            lines.push(line.to_string());
            Ok(())
        })?;
        Ok(lines)
    }

    /// Streams the non-empty lines of a text artifact without buffering the file.
    pub fn for_each_line<F>(&self, artifact: &str, mut visit: F) -> Result<(), KiraError>
    where
        F: FnMut(&str) -> Result<(), KiraError>,
    {
        let reader = self.open_for_read(artifact)?;
        for line in reader.lines() {
            let line = line.map_err(|err| KiraError::Filesystem(err.to_string()))?;
            let trimmed = line.trim_end_matches('\r');
            if !trimmed.is_empty() {
                visit(trimmed)?;
            }
        }
        Ok(())
    }

    pub fn read_json<T: serde::de::DeserializeOwned>(&self, artifact: &str) -> Result<T, KiraError> {
        let reader = self.open_for_read(artifact)?;
        serde_json::from_reader(reader)
            .map_err(|err| KiraError::Filesystem(format!("parse {artifact}: {err}")))
    }

    pub fn write_lines<I, S>(&self, artifact: &str, lines: I) -> Result<(), KiraError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut writer = self.open_for_write(artifact)?;
        for line in lines {
            writer.write_line(line.as_ref())?;
        }
        writer.commit()
    }
}

/// Write handle for one artifact. Dropping it without [`ArtifactWriter::commit`]
/// deletes the partial file and leaves no artifact behind.
pub struct ArtifactWriter {
    name: String,
    target: Utf8PathBuf,
    inner: BufWriter<NamedTempFile>,
}

impl ArtifactWriter {
    pub fn write_line(&mut self, line: &str) -> Result<(), KiraError> {
        self.inner
            .write_all(line.as_bytes())
            .and_then(|_| self.inner.write_all(b"\n"))
            .map_err(|err| KiraError::Filesystem(err.to_string()))
    }

    pub fn write_json<T: serde::Serialize>(&mut self, value: &T) -> Result<(), KiraError> {
        serde_json::to_writer_pretty(&mut self.inner, value)
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        self.write_line("")
    }

    pub fn commit(self) -> Result<(), KiraError> {
        let temp = self
            .inner
            .into_inner()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.as_file()
            .sync_all()
            .map_err(|err| KiraError::Filesystem(err.to_string()))?;
        temp.persist_noclobber(self.target.as_std_path())
            .map_err(|err| KiraError::Filesystem(format!("persist {}: {}", self.target, err.error)))?;
        tracing::debug!(artifact = %self.name, path = %self.target, "artifact committed");
        Ok(())
    }
}

impl Write for ArtifactWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for ArtifactWriter {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn temp_store() -> (tempfile::TempDir, ArtifactStore) {
        let temp = tempfile::tempdir().unwrap();
        let root = Utf8PathBuf::from_path_buf(temp.path().join("data")).unwrap();
        (temp, ArtifactStore::new(root))
    }

    #[test]
    fn commit_makes_artifact_visible() {
        let (_temp, store) = temp_store();
        let mut writer = store.open_for_write("ids.txt").unwrap();
        writer.write_line("1").unwrap();
        assert!(!store.exists("ids.txt"));
        writer.commit().unwrap();
        assert!(store.exists("ids.txt"));
        assert_eq!(store.read_lines("ids.txt").unwrap(), vec!["1"]);
    }

    #[test]
    fn dropped_writer_leaves_nothing() {
        let (_temp, store) = temp_store();
        {
            let mut writer = store.open_for_write("ids.txt").unwrap();
            writer.write_line("partial").unwrap();
        }
        assert!(!store.exists("ids.txt"));
        let leftovers = fs::read_dir(store.root().as_std_path()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn refuses_to_overwrite_complete_artifact() {
        let (_temp, store) = temp_store();
        store.write_lines("ids.txt", ["a"]).unwrap();
        let err = store.open_for_write("ids.txt").err().unwrap();
        assert_matches!(err, KiraError::ArtifactExists(_));
    }

    #[test]
    fn missing_artifact_is_not_found() {
        let (_temp, store) = temp_store();
        let err = store.open_for_read("absent.txt").err().unwrap();
        assert_matches!(err, KiraError::ArtifactNotFound(_));
    }
}
