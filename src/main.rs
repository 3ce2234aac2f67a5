use kube::Client;
use log::info;
use shardwise::{config::OperatorConfig, errors::*, manager::Manager};

#[tokio::main]
async fn main() {
    env_logger::init();
    if let Err(e) = run().await {
        log::error!("{}", e);
        for cause in e.iter().skip(1) {
            log::error!("caused by: {}", cause);
        }
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let config = OperatorConfig::load()?;

    // Read the environment to find config for kube client.
    // Note that this tries an in-cluster configuration first,
    // then falls back on a kubeconfig file.
    let client = Client::try_default().await?;

    let (_manager, drainer) = Manager::new(client, config).await?;
    info!("watching SearchClusters");
    drainer.await;
    Ok(())
}
