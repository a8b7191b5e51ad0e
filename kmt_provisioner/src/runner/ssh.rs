use std::{path::PathBuf, time::Duration};

use async_trait::async_trait;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use super::{
    check_output, command_handle, execute, shell_quote, stdin_with_password, CommandArgs,
    CommandRunner, RunnerError,
};
use crate::engine::ResourceHandle;

const SSH_DIAL_FAILURE: i32 = 255;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub host: String,
    pub user: String,
    pub port: u16,
    pub private_key: PathBuf,
    pub per_dial_timeout: Duration,
    pub dial_error_limit: u32,
}

impl Connection {
    pub const DEFAULT_PORT: u16 = 22;

    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    fn options(&self) -> Vec<String> {
        vec![
            String::from("-i"),
            self.private_key.to_string_lossy().to_string(),
            String::from("-p"),
            self.port.to_string(),
            String::from("-o"),
            String::from("BatchMode=yes"),
            String::from("-o"),
            String::from("StrictHostKeyChecking=no"),
            String::from("-o"),
            String::from("UserKnownHostsFile=/dev/null"),
            String::from("-o"),
            String::from("LogLevel=ERROR"),
            String::from("-o"),
            format!("ConnectTimeout={}", self.per_dial_timeout.as_secs().max(1)),
        ]
    }
}

/// Address of a remote shell. A proxied transport reaches `inner` through
/// a jump over the already established `outer` connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Transport {
    Direct(Connection),
    Proxied { outer: Connection, inner: Connection },
}

impl Transport {
    pub fn through(outer: &Connection, host: String, user: String, private_key: PathBuf) -> Self {
        Transport::Proxied {
            outer: outer.clone(),
            inner: Connection {
                host,
                user,
                port: Connection::DEFAULT_PORT,
                private_key,
                per_dial_timeout: outer.per_dial_timeout,
                dial_error_limit: outer.dial_error_limit,
            },
        }
    }

    pub fn target(&self) -> &Connection {
        match self {
            Transport::Direct(connection) => connection,
            Transport::Proxied { inner, .. } => inner,
        }
    }

    pub fn ssh_args(&self, remote_command: &str) -> Vec<String> {
        let mut args = match self {
            Transport::Direct(connection) => connection.options(),
            Transport::Proxied { outer, inner } => {
                let mut args = inner.options();
                let proxy = format!(
                    "ssh {} -W %h:%p {}",
                    outer.options().join(" "),
                    outer.destination()
                );
                args.push(String::from("-o"));
                args.push(format!("ProxyCommand={}", proxy));
                args
            }
        };
        args.push(self.target().destination());
        args.push(remote_command.to_string());
        args
    }
}

pub struct SshRunner {
    transport: Transport,
    sudo_password: Option<String>,
}

impl SshRunner {
    pub fn new(transport: Transport, sudo_password: Option<String>) -> Self {
        Self {
            transport,
            sudo_password,
        }
    }

    fn remote_command(&self, args: &CommandArgs) -> String {
        if !args.sudo {
            return args.create.clone();
        }
        let sudo = if self.sudo_password.is_some() {
            "sudo -S -p ''"
        } else {
            "sudo -n"
        };
        format!("{} sh -c {}", sudo, shell_quote(&args.create))
    }
}

#[async_trait]
impl CommandRunner for SshRunner {
    async fn command(
        &self,
        name: &str,
        args: CommandArgs,
        deps: &[ResourceHandle],
    ) -> Result<ResourceHandle, RunnerError> {
        let target = self.transport.target();
        let ssh_args = self.transport.ssh_args(&self.remote_command(&args));
        debug!(
            "Running command {} on {} after {:?}: {}",
            name,
            target.destination(),
            deps.iter().map(|dep| dep.name.as_str()).collect::<Vec<_>>(),
            args.create
        );

        let attempts = target.dial_error_limit.max(1);
        for attempt in 1..=attempts {
            let mut command = Command::new("ssh");
            command.args(&ssh_args);
            let output = execute(
                name,
                command,
                stdin_with_password(self.sudo_password.as_deref(), &args),
            )
            .await?;
            if output.status.code() == Some(SSH_DIAL_FAILURE) {
                warn!(
                    "Failed to reach {} for command {} (attempt {}/{})",
                    target.destination(),
                    name,
                    attempt,
                    attempts
                );
                tokio::time::sleep(target.per_dial_timeout).await;
                continue;
            }
            let stdout = check_output(name, output)?;
            return Ok(command_handle(name, stdout));
        }

        Err(RunnerError::DialExhausted {
            host: target.host.clone(),
            attempts,
        })
    }
}
