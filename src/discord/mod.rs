use async_trait::async_trait;
use const_format::formatcp;
use reqwest::header::{AUTHORIZATION, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{Error, Result};

pub mod commands;
mod dispatch;
pub mod gateway;
pub mod heartbeat;
pub mod payload;
pub mod session;

pub const API: &str = "https://discordapp.com/api";
pub const GATEWAY_VERSION: u8 = 5;

pub const DEFAULT_USER_AGENT: &str = formatcp!(
    "Pycord (github.com/Celeo/Pycord, {})",
    env!("CARGO_PKG_VERSION")
);

/// The request/response side of the API the gateway client depends on.
#[async_trait]
pub trait ControlChannel: Send + Sync {
    /// Address of the websocket gateway, without query parameters.
    async fn gateway_url(&self) -> Result<Box<str>>;

    async fn send_message(&self, channel_id: &str, content: &str) -> Result<Value>;
}

/// HTTP control channel authenticated with a bot token.
#[derive(Debug, Clone)]
pub struct DiscordClient {
    http: Client,
    token: Box<str>,
    user_agent: Box<str>,
    base_url: Box<str>,
}

impl DiscordClient {
    pub fn new(token: impl Into<Box<str>>) -> Self {
        DiscordClient {
            http: Client::new(),
            token: token.into(),
            user_agent: DEFAULT_USER_AGENT.into(),
            base_url: API.into(),
        }
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<Box<str>>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<Box<str>>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    pub async fn get_basic_bot_info(&self) -> Result<Value> {
        self.query("users/@me").await
    }

    pub async fn get_connected_guilds(&self) -> Result<Value> {
        self.query("users/@me/guilds").await
    }

    pub async fn get_guild_info(&self, id: &str) -> Result<Value> {
        self.query(&format!("guilds/{id}")).await
    }

    pub async fn get_channels_in(&self, guild_id: &str) -> Result<Value> {
        self.query(&format!("guilds/{guild_id}/channels")).await
    }

    pub async fn get_channel_info(&self, id: &str) -> Result<Value> {
        self.query(&format!("channels/{id}")).await
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}/{path}", self.base_url);
        debug!(%method, %url, "control channel request");
        self.http
            .request(method, url)
            .header(AUTHORIZATION, format!("Bot {}", self.token))
            .header(USER_AGENT, &*self.user_agent)
    }

    async fn query(&self, path: &str) -> Result<Value> {
        let response = self.request(Method::GET, path).send().await?;
        Ok(check(response).await?.json().await?)
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> Result<Value> {
        let response = self.request(Method::POST, path).json(body).send().await?;
        Ok(check(response).await?.json().await?)
    }
}

async fn check(response: Response) -> Result<Response> {
    let status = response.status();
    debug!(url = %response.url(), %status, "control channel response");
    if status != StatusCode::OK {
        return Err(Error::ControlChannel {
            status: status.as_u16(),
            body: response.text().await.unwrap_or_default(),
        });
    }
    Ok(response)
}

#[async_trait]
impl ControlChannel for DiscordClient {
    async fn gateway_url(&self) -> Result<Box<str>> {
        #[derive(Deserialize)]
        struct Gateway {
            url: Box<str>,
        }

        let response = self.request(Method::GET, "gateway").send().await?;
        Ok(check(response).await?.json::<Gateway>().await?.url)
    }

    async fn send_message(&self, channel_id: &str, content: &str) -> Result<Value> {
        #[derive(Serialize)]
        struct NewMessage<'a> {
            content: &'a str,
        }

        self.post(
            &format!("channels/{channel_id}/messages"),
            &NewMessage { content },
        )
        .await
    }
}
