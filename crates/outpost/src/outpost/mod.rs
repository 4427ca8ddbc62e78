pub mod admin;
pub mod app;
pub mod auth;
pub mod config;
pub mod gateway;
pub mod logging;
pub mod net;
pub mod quota;
pub mod telemetry;
pub mod tunnel;

#[cfg(test)]
mod e2e;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}

pub async fn run_http(opts: tunnel::client::ClientOptions) -> anyhow::Result<()> {
    app::run_http_client(opts).await
}
