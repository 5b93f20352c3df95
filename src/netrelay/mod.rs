pub mod agent;
pub mod app;
pub mod config;
pub mod control;
pub mod error;
pub mod logging;
pub mod net;
pub mod protocol;
pub mod relay;
pub mod status;

pub async fn run(
    config_path: Option<std::path::PathBuf>,
    overrides: app::Overrides,
) -> anyhow::Result<()> {
    app::run(config_path, overrides).await
}
