use gateway::config::Config;

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    gateway::init_tracing();

    tracing::info!("Starting Gateway service");
    let config = Config::from_env()?;

    gateway::run(config).await
}
