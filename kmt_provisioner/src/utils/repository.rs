use std::{io::ErrorKind, path::Path};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use utils::file_system::fs_repository::FileRepository;

#[derive(Error, Debug, PartialEq, PartialOrd, Clone, Serialize, Deserialize)]
pub enum RepositoryError {
    #[error("Can't create a repository: {0}")]
    CreationFail(String),
    #[error("Can't save inner value: {0}")]
    SaveFail(String),
    #[error("Can't remove repository: {0}")]
    RemoveFail(String),
}

#[async_trait]
pub trait Repository {
    type Data;

    fn get(&self) -> &Self::Data;
    fn get_mut(&mut self) -> &mut Self::Data;
    async fn save(&mut self) -> Result<(), RepositoryError>;
    async fn discard(&mut self) -> Result<(), RepositoryError>;
}

pub struct YamlRepository<Data: Serialize + DeserializeOwned> {
    file: FileRepository<Data>,
}

impl<Data: Serialize + DeserializeOwned + Send + Sync> YamlRepository<Data> {
    pub async fn new(data: Data, path: &Path) -> Result<Self, RepositoryError> {
        Ok(Self {
            file: FileRepository::<Data>::new(data, path)
                .await
                .map_err(|err| RepositoryError::CreationFail(err.to_string()))?,
        })
    }

    pub async fn from(path: &Path) -> Result<Self, RepositoryError> {
        Ok(Self {
            file: FileRepository::<Data>::from_file_path(path)
                .await
                .map_err(|err| RepositoryError::CreationFail(err.to_string()))?,
        })
    }

    pub async fn open_or(data: Data, path: &Path) -> Result<Self, RepositoryError> {
        Ok(Self {
            file: FileRepository::<Data>::from_file_path_or(data, path)
                .await
                .map_err(|err| RepositoryError::CreationFail(err.to_string()))?,
        })
    }
}

#[async_trait]
impl<Data: Serialize + DeserializeOwned + Send + Sync> Repository for YamlRepository<Data> {
    type Data = Data;

    fn get(&self) -> &Self::Data {
        self.file.get()
    }

    fn get_mut(&mut self) -> &mut Self::Data {
        self.file.get_mut()
    }

    async fn save(&mut self) -> Result<(), RepositoryError> {
        self.file
            .save()
            .await
            .map_err(|err| RepositoryError::SaveFail(err.to_string()))
    }

    async fn discard(&mut self) -> Result<(), RepositoryError> {
        match tokio::fs::remove_file(self.file.path()).await {
            Err(err) if err.kind() != ErrorKind::NotFound => {
                Err(RepositoryError::RemoveFail(err.to_string()))
            }
            _ => Ok(()),
        }
    }
}
