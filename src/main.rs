use rmcp::{ServiceExt, transport::stdio};

use playbook::config::Config;
use playbook::server::PlaybookServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    // MCP hosts may start the server with any CWD: prefer a .env next to the
    // binary, then fall back to dotenvy's CWD search.
    match std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(".env")))
    {
        Some(env_path) if env_path.exists() => {
            dotenvy::from_path(&env_path).ok();
        }
        _ => {
            dotenvy::dotenv().ok();
        }
    }

    let root = match std::env::var_os("PLAYBOOK_ROOT") {
        Some(root) => root.into(),
        None => std::env::current_dir()?,
    };
    tracing::info!(root = %root.display(), "playbook starting");

    let config = Config::load(root)?;
    let server = PlaybookServer::new(config);

    let service = server
        .serve(stdio())
        .await
        .inspect_err(|e| tracing::error!("serving error: {e:?}"))?;

    service.waiting().await?;

    tracing::info!("playbook shutting down");
    Ok(())
}
