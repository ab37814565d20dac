//! HTTP API server command — `fieldops serve`.

use anyhow::Result;
use fieldops::config::FieldOpsToml;

pub async fn cmd_serve(
    settings: &FieldOpsToml,
    port: Option<u16>,
    host: Option<String>,
    dev: bool,
) -> Result<()> {
    let mut config = settings.server_config();
    if let Some(port) = port {
        config.port = port;
    }
    if let Some(host) = host {
        config.host = host;
    }
    config.dev_mode |= dev;

    for warning in settings.validate() {
        tracing::warn!("{}", warning);
    }

    fieldops::office::server::start_server(config).await
}
