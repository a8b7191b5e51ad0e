use std::process::{Output, Stdio};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::{io::AsyncWriteExt, process::Command};

use crate::engine::{ResourceHandle, ResourceKind};

pub mod local;
pub mod ssh;

#[derive(Error, Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum RunnerError {
    #[error("Failed to spawn command {name}: {message}")]
    Spawn { name: String, message: String },
    #[error("Command {name} failed with status {status}: {stderr}")]
    Failed {
        name: String,
        status: String,
        stderr: String,
    },
    #[error("Failed to connect to {host} after {attempts} attempts")]
    DialExhausted { host: String, attempts: u32 },
    #[error("Failed to record command {name}: {message}")]
    Journal { name: String, message: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandArgs {
    pub create: String,
    pub delete: Option<String>,
    pub sudo: bool,
    #[serde(skip)]
    pub stdin: Option<String>,
    #[serde(skip)]
    pub transient: bool,
}

impl CommandArgs {
    pub fn new(create: impl Into<String>) -> Self {
        Self {
            create: create.into(),
            ..Default::default()
        }
    }

    pub fn with_delete(mut self, delete: impl Into<String>) -> Self {
        self.delete = Some(delete.into());
        self
    }

    pub fn with_sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// Marks a command that is run on every apply and never recorded.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Arguments running the delete action of this command, if there is one.
    pub fn teardown(&self) -> Option<CommandArgs> {
        self.delete.as_ref().map(|delete| CommandArgs {
            create: delete.clone(),
            delete: None,
            sudo: self.sudo,
            stdin: None,
            transient: false,
        })
    }
}

#[async_trait]
pub trait CommandRunner {
    async fn command(
        &self,
        name: &str,
        args: CommandArgs,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError>;
}

pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "'\\''"))
}

pub(crate) fn command_handle(name: &str, stdout: String) -> ResourceHandle {
    ResourceHandle::new(ResourceKind::Command, name, name)
        .with_output(ResourceHandle::STDOUT, stdout)
}

pub(crate) async fn execute(
    name: &str,
    mut command: Command,
    stdin: Option<String>,
) -> Result<Output, RunnerError> {
    command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = command.spawn().map_err(|err| RunnerError::Spawn {
        name: name.to_string(),
        message: err.to_string(),
    })?;

    if let Some(mut child_stdin) = child.stdin.take() {
        if let Some(input) = stdin {
            child_stdin
                .write_all(input.as_bytes())
                .await
                .map_err(|err| RunnerError::Spawn {
                    name: name.to_string(),
                    message: err.to_string(),
                })?;
        }
    }

    child
        .wait_with_output()
        .await
        .map_err(|err| RunnerError::Spawn {
            name: name.to_string(),
            message: err.to_string(),
        })
}

pub(crate) fn check_output(name: &str, output: Output) -> Result<String, RunnerError> {
    if !output.status.success() {
        return Err(RunnerError::Failed {
            name: name.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout)
        .trim_end_matches('\n')
        .to_string())
}

pub(crate) fn stdin_with_password(password: Option<&str>, args: &CommandArgs) -> Option<String> {
    match (args.sudo.then_some(password).flatten(), args.stdin.as_ref()) {
        (Some(password), Some(input)) => Some(format!("{}\n{}", password, input)),
        (Some(password), None) => Some(format!("{}\n", password)),
        (None, input) => input.cloned(),
    }
}

#[cfg(test)]
mod test {
    use super::{shell_quote, stdin_with_password, CommandArgs};

    #[test]
    fn quote_escapes_single_quotes() {
        assert_eq!(shell_quote("echo 'a'"), "'echo '\\''a'\\'''");
        assert_eq!(shell_quote("ls"), "'ls'");
    }

    #[test]
    fn teardown_keeps_sudo() {
        let args = CommandArgs::new("mount")
            .with_delete("umount")
            .with_sudo()
            .with_stdin("data");
        let teardown = args.teardown().unwrap();
        assert_eq!(teardown.create, "umount");
        assert!(teardown.sudo);
        assert_eq!(teardown.stdin, None);
        assert_eq!(CommandArgs::new("true").teardown(), None);
    }

    #[test]
    fn password_goes_first_on_stdin() {
        let args = CommandArgs::new("cat").with_sudo().with_stdin("payload");
        assert_eq!(
            stdin_with_password(Some("secret"), &args),
            Some(String::from("secret\npayload"))
        );
        let args = CommandArgs::new("cat").with_stdin("payload");
        assert_eq!(
            stdin_with_password(Some("secret"), &args),
            Some(String::from("payload"))
        );
    }
}
