use docket_server::config::ServerConfig;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    docket_server::init_tracing()?;
    let config = ServerConfig::from_env()?;
    docket_server::serve(config).await
}
