use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio::{
    fs::File,
    io::{AsyncReadExt, AsyncWriteExt},
};

#[derive(Debug, Error)]
pub enum FileRepositoryError {
    #[error("Failed to create file: {0}")]
    CreationFail(#[source] std::io::Error),
    #[error("Failed to save file: {0}")]
    SaveFail(String),
    #[error("Failed to read file: {0}")]
    ReadFail(String),
}

/// Value persisted as a YAML document. Every save goes through a sibling
/// temporary file which is renamed over the target.
pub struct FileRepository<Struct: Serialize + DeserializeOwned> {
    data: Struct,
    path: PathBuf,
}

impl<Struct: Serialize + DeserializeOwned> FileRepository<Struct> {
    pub async fn new(data: Struct, path: &Path) -> Result<Self, FileRepositoryError> {
        let mut repository = Self {
            data,
            path: path.to_path_buf(),
        };
        repository.save().await?;
        Ok(repository)
    }

    pub async fn from_file_path(path: &Path) -> Result<Self, FileRepositoryError> {
        let data = Self::read_file(path).await?;
        Ok(Self {
            data,
            path: path.to_path_buf(),
        })
    }

    pub async fn from_file_path_or(data: Struct, path: &Path) -> Result<Self, FileRepositoryError> {
        match tokio::fs::try_exists(path).await {
            Ok(true) => Self::from_file_path(path).await,
            Ok(false) => Self::new(data, path).await,
            Err(err) => Err(FileRepositoryError::ReadFail(err.to_string())),
        }
    }

    pub async fn save(&mut self) -> Result<(), FileRepositoryError> {
        let yaml_data = serde_yaml::to_string(&self.data)
            .map_err(|err| FileRepositoryError::SaveFail(err.to_string()))?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(FileRepositoryError::CreationFail)?;
        }
        let staging_path = self.staging_path();
        let mut file = File::create(&staging_path)
            .await
            .map_err(FileRepositoryError::CreationFail)?;
        file.write_all(yaml_data.as_bytes())
            .await
            .map_err(|err| FileRepositoryError::SaveFail(err.to_string()))?;
        file.flush()
            .await
            .map_err(|err| FileRepositoryError::SaveFail(err.to_string()))?;
        tokio::fs::rename(&staging_path, &self.path)
            .await
            .map_err(|err| FileRepositoryError::SaveFail(err.to_string()))
    }

    pub fn get_mut(&mut self) -> &mut Struct {
        &mut self.data
    }

    pub fn get(&self) -> &Struct {
        &self.data
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn staging_path(&self) -> PathBuf {
        let mut file_name = self.path.file_name().unwrap_or_default().to_os_string();
        file_name.push(".staging");
        self.path.with_file_name(file_name)
    }

    async fn read_file(path: &Path) -> Result<Struct, FileRepositoryError> {
        let mut file = File::open(path)
            .await
            .map_err(|err| FileRepositoryError::ReadFail(err.to_string()))?;
        let mut buf = String::new();
        file.read_to_string(&mut buf)
            .await
            .map_err(|err| FileRepositoryError::ReadFail(err.to_string()))?;
        serde_yaml::from_str(&buf).map_err(|err| FileRepositoryError::ReadFail(err.to_string()))
    }
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::FileRepository;

    #[tokio::test]
    async fn save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("journal.yaml");
        let mut repository =
            FileRepository::<BTreeMap<String, u32>>::new(BTreeMap::new(), &path)
                .await
                .unwrap();
        repository.get_mut().insert(String::from("pool"), 1);
        repository.save().await.unwrap();

        let repository = FileRepository::<BTreeMap<String, u32>>::from_file_path(&path)
            .await
            .unwrap();
        assert_eq!(repository.get().get("pool"), Some(&1));
        assert!(!path.with_file_name("journal.yaml.staging").exists());
    }

    #[tokio::test]
    async fn from_file_path_or_keeps_existing_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs.yaml");
        FileRepository::<u32>::new(7, &path).await.unwrap();
        let repository = FileRepository::<u32>::from_file_path_or(0, &path)
            .await
            .unwrap();
        assert_eq!(*repository.get(), 7);
    }
}
