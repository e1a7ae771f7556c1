use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::info;

use tacmesh_radio::{spawn_node, MediumConfig, RadioConfig, RadioMedium};

const DEFAULT_SOCKET: &str = "/tmp/tacmesh.sock";

fn load_config() -> Result<RadioConfig> {
    match std::env::var("TACMESH_CONFIG") {
        Ok(path) => {
            let raw = std::fs::read_to_string(&path).with_context(|| format!("reading config {}", path))?;
            let config = serde_json::from_str(&raw).with_context(|| format!("parsing config {}", path))?;
            info!("Loaded config from {}", path);
            Ok(config)
        }
        Err(_) => Ok(RadioConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let config = load_config()?;
    let socket = std::env::var("TACMESH_SOCKET")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(DEFAULT_SOCKET));

    let medium = RadioMedium::new(MediumConfig::default());
    let port = medium.join(config.node_id).await;
    info!(
        "Node {} on the local medium, payload max {} bytes",
        config.node_id, config.payload_max
    );
    let node = spawn_node(config, Arc::new(port));

    tacmesh_gateway::serve(&socket, node).await?;
    Ok(())
}
