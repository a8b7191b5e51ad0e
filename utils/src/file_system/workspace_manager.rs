use std::{
    io::{self, ErrorKind},
    path::PathBuf,
};

/// Directory holding the per-stack state files of the provisioner.
pub struct WorkspaceManager {
    root_dir: PathBuf,
}

impl WorkspaceManager {
    pub async fn new(path: PathBuf) -> Result<Self, io::Error> {
        tokio::fs::create_dir_all(&path).await?;
        Ok(Self { root_dir: path })
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.root_dir.join(name)
    }

    /// Removes a file of the workspace. A missing file is not an error.
    pub async fn remove_file(&self, name: &str) -> Result<(), io::Error> {
        match tokio::fs::remove_file(self.file_path(name)).await {
            Err(err) if err.kind() != ErrorKind::NotFound => Err(err),
            _ => Ok(()),
        }
    }

    pub async fn read_files_with_prefix(&self, prefix: &str) -> Result<Vec<PathBuf>, io::Error> {
        let mut files = vec![];
        let mut read_dir = tokio::fs::read_dir(&self.root_dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_file() && entry.file_name().to_string_lossy().starts_with(prefix) {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }
}
