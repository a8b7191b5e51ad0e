use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::virtualization::domain::ConsoleKind;

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Create or update every resource of the stack
    Provision,
    /// Tear down every resource recorded for the stack
    Destroy,
    /// Print identities, storage and downloads without touching any host
    Plan,
}

#[derive(Parser, Debug)]
#[command(version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub action: Action,
    #[arg(short, long)]
    pub stack: String,
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,
    #[arg(long, global = true, default_value = "/tmp/kmt-provisioner")]
    pub state_dir: PathBuf,
    #[arg(long, global = true)]
    pub x86_metal_host: Option<String>,
    #[arg(long, global = true)]
    pub arm64_metal_host: Option<String>,
    #[arg(long, global = true, default_value_t = String::from("ubuntu"))]
    pub metal_user: String,
    #[arg(long, global = true)]
    pub metal_key: Option<PathBuf>,
    #[arg(long, global = true, default_value = "/tmp/libvirt_rsa-x86")]
    pub libvirt_key_x86: PathBuf,
    #[arg(long, global = true, default_value = "/tmp/libvirt_rsa-arm")]
    pub libvirt_key_arm: PathBuf,
    #[arg(long, global = true, default_value_t = 360)]
    pub shutdown_period: u32,
    #[arg(long, global = true, default_value_t = 0)]
    pub host_cpus: usize,
    #[arg(long, global = true, env = "KMT_SUDO_PASSWORD", hide_env_values = true)]
    pub sudo_password: Option<String>,
    #[arg(long, global = true)]
    pub skip_shared_disk: bool,
    #[arg(long, global = true, value_enum, default_value_t = ConsoleKind::Pty)]
    pub console: ConsoleKind,
    #[arg(long, global = true, default_value_t = 5)]
    pub dial_timeout_secs: u64,
    #[arg(long, global = true, value_parser=clap::value_parser!(u32).range(1..), default_value_t = 60)]
    pub dial_error_limit: u32,
}

#[cfg(test)]
mod test {
    use std::path::PathBuf;

    use clap::Parser;

    use super::{Action, Cli};
    use crate::virtualization::domain::ConsoleKind;

    #[test]
    fn defaults() {
        let cli = Cli::parse_from(["kmt_provisioner", "--stack", "dev", "plan"]);
        assert_eq!(cli.action, Action::Plan);
        assert_eq!(cli.state_dir, PathBuf::from("/tmp/kmt-provisioner"));
        assert_eq!(cli.metal_user, "ubuntu");
        assert_eq!(cli.libvirt_key_arm, PathBuf::from("/tmp/libvirt_rsa-arm"));
        assert_eq!(cli.shutdown_period, 360);
        assert_eq!(cli.console, ConsoleKind::Pty);
        assert_eq!(cli.dial_error_limit, 60);
        assert!(!cli.skip_shared_disk);
    }

    #[test]
    fn options_after_action() {
        let cli = Cli::parse_from([
            "kmt_provisioner",
            "--stack",
            "dev",
            "provision",
            "--config",
            "/etc/vmsets.json",
            "--console",
            "file",
            "--host-cpus",
            "8",
        ]);
        assert_eq!(cli.action, Action::Provision);
        assert_eq!(cli.config, Some(PathBuf::from("/etc/vmsets.json")));
        assert_eq!(cli.console, ConsoleKind::File);
        assert_eq!(cli.host_cpus, 8);
    }

    #[test]
    fn zero_dial_limit_rejected() {
        assert!(Cli::try_parse_from([
            "kmt_provisioner",
            "--stack",
            "dev",
            "--dial-error-limit",
            "0",
            "destroy"
        ])
        .is_err());
    }
}
