use std::sync::Arc;

use cord::config::Config;
use cord::discord::gateway::GatewayClient;
use cord::discord::DiscordClient;
use cord::telemetry::try_init_tracing;
use serde_json::Value;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = try_init_tracing(config.log_level) {
        eprintln!("Warning: Failed to initialize tracing: {e}");
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "gateway client failed");
        std::process::exit(1);
    }
}

async fn run(config: Config) -> cord::Result<()> {
    let mut rest = DiscordClient::new(config.token.as_str());
    if let Some(user_agent) = config.user_agent {
        rest = rest.with_user_agent(user_agent);
    }
    let rest = Arc::new(rest);

    let me = rest.get_basic_bot_info().await?;
    info!(user = %me["username"], "authenticated");

    let client = Arc::new(
        GatewayClient::new(config.token.as_str(), rest.clone())
            .with_prefix(config.command_prefix.as_str()),
    );

    let weak = Arc::downgrade(&client);
    client.register_command("ping", move |d| {
        let Some(channel_id) = d.get("channel_id").and_then(Value::as_str) else {
            return;
        };
        let Some(client) = weak.upgrade() else {
            return;
        };
        let channel_id = channel_id.to_owned();
        tokio::spawn(async move {
            if let Err(e) = client.send_message(&channel_id, "pong").await {
                warn!(error = %e, "ping reply failed");
            }
        });
    });

    client.connect().await?;
    client.wait().await;
    Ok(())
}
