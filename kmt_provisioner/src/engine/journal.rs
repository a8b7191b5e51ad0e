use std::sync::Arc;

use async_trait::async_trait;
use log::{debug, info};
use ring::digest::{digest, SHA256};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::{EngineError, ResourceArgs, ResourceEngine, ResourceHandle};
use crate::runner::{CommandArgs, CommandRunner, RunnerError};
use crate::utils::repository::Repository;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum JournalAction {
    Resource,
    Command { teardown: Option<CommandArgs> },
    /// Undone for a replacement that has not been recreated yet.
    Vacant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalEntry {
    pub name: String,
    pub fingerprint: String,
    pub depends_on: Vec<String>,
    pub action: JournalAction,
    pub handle: ResourceHandle,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalData {
    pub entries: Vec<JournalEntry>,
}

enum Lookup {
    Unchanged(ResourceHandle),
    Changed(JournalEntry),
    Missing,
}

pub fn fingerprint(parts: &[&str]) -> String {
    let joined = parts.join("\u{0}");
    digest(&SHA256, joined.as_bytes())
        .as_ref()
        .iter()
        .map(|byte| format!("{:02x}", byte))
        .collect()
}

/// Creation log of one instance, kept in creation order.
pub struct Journal {
    repository: Mutex<Box<dyn Repository<Data = JournalData> + Send + Sync>>,
}

impl Journal {
    pub fn new(repository: Box<dyn Repository<Data = JournalData> + Send + Sync>) -> Self {
        Self {
            repository: Mutex::new(repository),
        }
    }

    pub async fn entries(&self) -> Vec<JournalEntry> {
        self.repository.lock().await.get().entries.clone()
    }

    async fn lookup(&self, name: &str, fingerprint: &str) -> Lookup {
        let repository = self.repository.lock().await;
        match repository
            .get()
            .entries
            .iter()
            .find(|entry| entry.name == name)
        {
            Some(entry) if entry.fingerprint == fingerprint => {
                Lookup::Unchanged(entry.handle.clone())
            }
            Some(entry) => Lookup::Changed(entry.clone()),
            None => Lookup::Missing,
        }
    }

    async fn record(&self, entry: JournalEntry) -> Result<(), EngineError> {
        let mut repository = self.repository.lock().await;
        let entries = &mut repository.get_mut().entries;
        match entries.iter().position(|existing| existing.name == entry.name) {
            Some(index) => entries[index] = entry,
            None => entries.push(entry),
        }
        repository
            .save()
            .await
            .map_err(|err| EngineError::Journal(err.to_string()))
    }

    /// Keeps the slot of an undone entry so its replacement is torn down
    /// at the same point as the original.
    async fn vacate(&self, name: &str) -> Result<(), EngineError> {
        let mut repository = self.repository.lock().await;
        if let Some(entry) = repository
            .get_mut()
            .entries
            .iter_mut()
            .find(|existing| existing.name == name)
        {
            entry.fingerprint.clear();
            entry.action = JournalAction::Vacant;
        }
        repository
            .save()
            .await
            .map_err(|err| EngineError::Journal(err.to_string()))
    }

    async fn forget(&self, name: &str) -> Result<(), EngineError> {
        let mut repository = self.repository.lock().await;
        repository
            .get_mut()
            .entries
            .retain(|existing| existing.name != name);
        repository
            .save()
            .await
            .map_err(|err| EngineError::Journal(err.to_string()))
    }

    /// Undoes every recorded step, newest first. Entries are dropped as
    /// they are undone so an interrupted teardown can be resumed.
    pub async fn teardown(
        &self,
        runner: &(dyn CommandRunner + Send + Sync),
        engine: &(dyn ResourceEngine + Send + Sync),
    ) -> Result<(), EngineError> {
        let entries = self.entries().await;
        info!("Tearing down {} recorded resources", entries.len());
        for entry in entries.iter().rev() {
            match &entry.action {
                JournalAction::Resource => engine.destroy(&entry.handle).await?,
                JournalAction::Command {
                    teardown: Some(teardown),
                } => {
                    runner
                        .command(&format!("{}-delete", entry.name), teardown.clone(), &[])
                        .await
                        .map_err(|err| EngineError::Destroy {
                            kind: entry.handle.kind,
                            name: entry.name.clone(),
                            message: err.to_string(),
                        })?;
                }
                JournalAction::Command { teardown: None } | JournalAction::Vacant => {}
            }
            self.forget(&entry.name).await?;
        }
        self.repository
            .lock()
            .await
            .discard()
            .await
            .map_err(|err| EngineError::Journal(err.to_string()))
    }
}

fn dependency_names(deps: &[ResourceHandle]) -> Vec<String> {
    deps.iter().map(|dep| dep.name.clone()).collect()
}

/// Runner that skips commands already applied with identical inputs.
pub struct JournaledRunner {
    inner: Arc<dyn CommandRunner + Send + Sync>,
    journal: Arc<Journal>,
}

impl JournaledRunner {
    pub fn new(inner: Arc<dyn CommandRunner + Send + Sync>, journal: Arc<Journal>) -> Self {
        Self { inner, journal }
    }
}

#[async_trait]
impl CommandRunner for JournaledRunner {
    async fn command(
        &self,
        name: &str,
        args: CommandArgs,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError> {
        if args.transient {
            return self.inner.command(name, args, deps).await;
        }
        let journal_error = |err: EngineError| RunnerError::Journal {
            name: name.to_string(),
            message: err.to_string(),
        };
        let sudo = args.sudo.to_string();
        let fingerprint = fingerprint(&[
            &args.create,
            args.delete.as_deref().unwrap_or_default(),
            &sudo,
            args.stdin.as_deref().unwrap_or_default(),
        ]);

        match self.journal.lookup(name, &fingerprint).await {
            Lookup::Unchanged(handle) => {
                debug!("Command {} is unchanged, skipping", name);
                return Ok(handle);
            }
            Lookup::Changed(entry) => {
                debug!("Command {} changed, replacing", name);
                if let JournalAction::Command {
                    teardown: Some(teardown),
                } = entry.action
                {
                    self.inner
                        .command(&format!("{}-replace", name), teardown, &[])
                        .await?;
                }
                self.journal.vacate(name).await.map_err(journal_error)?;
            }
            Lookup::Missing => {}
        }

        let teardown = args.teardown();
        let handle = self.inner.command(name, args, deps).await?;
        self.journal
            .record(JournalEntry {
                name: name.to_string(),
                fingerprint,
                depends_on: dependency_names(deps),
                action: JournalAction::Command { teardown },
                handle: handle.clone(),
            })
            .await
            .map_err(journal_error)?;
        Ok(handle)
    }
}

/// Engine that only recreates resources whose inputs changed.
pub struct JournaledEngine {
    inner: Arc<dyn ResourceEngine + Send + Sync>,
    journal: Arc<Journal>,
}

impl JournaledEngine {
    pub fn new(inner: Arc<dyn ResourceEngine + Send + Sync>, journal: Arc<Journal>) -> Self {
        Self { inner, journal }
    }
}

#[async_trait]
impl ResourceEngine for JournaledEngine {
    async fn create(
        &self,
        name: &str,
        args: ResourceArgs,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, EngineError> {
        let serialized =
            serde_json::to_string(&args).map_err(|err| EngineError::Journal(err.to_string()))?;
        let fingerprint = fingerprint(&[&serialized]);

        match self.journal.lookup(name, &fingerprint).await {
            Lookup::Unchanged(handle) => {
                debug!("{} {} is unchanged, skipping", args.kind(), name);
                return Ok(handle);
            }
            Lookup::Changed(entry) => {
                debug!("{} {} changed, replacing", args.kind(), name);
                if entry.action == JournalAction::Resource {
                    self.inner.destroy(&entry.handle).await?;
                }
                self.journal.vacate(name).await?;
            }
            Lookup::Missing => {}
        }

        let handle = self.inner.create(name, args, deps).await?;
        self.journal
            .record(JournalEntry {
                name: name.to_string(),
                fingerprint,
                depends_on: dependency_names(deps),
                action: JournalAction::Resource,
                handle: handle.clone(),
            })
            .await?;
        Ok(handle)
    }

    async fn destroy(&self, handle: &ResourceHandle) -> Result<(), EngineError> {
        self.inner.destroy(handle).await?;
        self.journal.forget(&handle.name).await
    }
}
