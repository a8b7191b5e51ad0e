use anyhow::Error;
use clap::Parser;
use kmt_provisioner::{cli::Cli, provisioner::ProvisionerBuilder};
use log::error;

#[tokio::main(flavor = "multi_thread")]
async fn main() -> anyhow::Result<(), Error> {
    env_logger::init();
    let cli = Cli::parse();

    let result = match ProvisionerBuilder::build(cli).await {
        Ok(provisioner) => provisioner.run().await,
        Err(err) => Err(err),
    };
    if let Err(err) = &result {
        error!("{:#}", err);
    }
    result
}
