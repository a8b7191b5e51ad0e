use async_trait::async_trait;
use log::debug;
use tokio::process::Command;

use super::{
    check_output, command_handle, execute, stdin_with_password, CommandArgs, CommandRunner,
    RunnerError,
};
use crate::engine::ResourceHandle;

/// Runs commands through `sh -c` on the orchestrator host.
#[derive(Debug, Clone, Default)]
pub struct LocalRunner {
    sudo_password: Option<String>,
}

impl LocalRunner {
    pub fn new(sudo_password: Option<String>) -> Self {
        Self { sudo_password }
    }

    fn prepare_command(&self, args: &CommandArgs) -> Command {
        if args.sudo {
            let mut command = Command::new("sudo");
            if self.sudo_password.is_some() {
                command.args(["-S", "-p", ""]);
            } else {
                command.arg("-n");
            }
            command.args(["sh", "-c", &args.create]);
            command
        } else {
            let mut command = Command::new("sh");
            command.args(["-c", &args.create]);
            command
        }
    }
}

#[async_trait]
impl CommandRunner for LocalRunner {
    async fn command(
        &self,
        name: &str,
        args: CommandArgs,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError> {
        let command = self.prepare_command(&args);
        debug!(
            "Running local command {} after {:?}: {:?}",
            name,
            deps.iter().map(|dep| dep.name.as_str()).collect::<Vec<_>>(),
            command
        );
        let output = execute(
            name,
            command,
            stdin_with_password(self.sudo_password.as_deref(), &args),
        )
        .await?;
        let stdout = check_output(name, output)?;
        Ok(command_handle(name, stdout))
    }
}

#[cfg(test)]
mod test {
    use super::LocalRunner;
    use crate::engine::ResourceHandle;
    use crate::runner::{CommandArgs, CommandRunner, RunnerError};

    #[tokio::test]
    async fn captures_stdout() {
        let runner = LocalRunner::default();
        let handle = runner
            .command("echo", CommandArgs::new("echo hello"), &[])
            .await
            .unwrap();
        assert_eq!(handle.output(ResourceHandle::STDOUT), Some("hello"));
        assert_eq!(handle.name, "echo");
    }

    #[tokio::test]
    async fn passes_stdin() {
        let runner = LocalRunner::default();
        let handle = runner
            .command("cat", CommandArgs::new("cat").with_stdin("<pool/>"), &[])
            .await
            .unwrap();
        assert_eq!(handle.output(ResourceHandle::STDOUT), Some("<pool/>"));
    }

    #[tokio::test]
    async fn failure_reports_stderr() {
        let runner = LocalRunner::default();
        let result = runner
            .command("fail", CommandArgs::new("echo broken >&2; exit 3"), &[])
            .await;
        assert!(matches!(
            result,
            Err(RunnerError::Failed { ref stderr, .. }) if stderr == "broken"
        ));
    }
}
