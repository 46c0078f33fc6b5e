#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use tracing::info;
use url::Url;

use super::chat::{DEFAULT_IRC_WS_URL, TwitchChat, TwitchChatConfig};
use super::helix::{DEFAULT_HELIX_BASE_URL, HelixClient, revoke_user_token, validate_user_token};
use crate::{ChatConnection, Credential, HelixApi, PlatformConnector, SecretString};

#[derive(Clone, Debug)]
pub struct TwitchConfig {
	pub helix_base_url: Url,
	pub irc_ws_url: Url,
	pub follow_poll_interval: Duration,
}

impl TwitchConfig {
	pub fn new() -> anyhow::Result<Self> {
		Ok(Self {
			helix_base_url: Url::parse(DEFAULT_HELIX_BASE_URL).context("parse helix base url")?,
			irc_ws_url: Url::parse(DEFAULT_IRC_WS_URL).context("parse irc ws url")?,
			follow_poll_interval: Duration::from_secs(30),
		})
	}
}

/// Builds Twitch handles from a validated user token.
#[derive(Clone, Debug)]
pub struct TwitchConnector {
	cfg: TwitchConfig,
}

impl TwitchConnector {
	pub fn new(cfg: TwitchConfig) -> Self {
		Self { cfg }
	}

	fn chat_config(&self, credential: &Credential) -> anyhow::Result<TwitchChatConfig> {
		let mut cfg = TwitchChatConfig::new(credential.login.clone(), credential.token.clone())?;
		cfg.ws_url = self.cfg.irc_ws_url.clone();
		Ok(cfg)
	}
}

#[async_trait]
impl PlatformConnector for TwitchConnector {
	async fn authenticate(&self, token: &SecretString) -> anyhow::Result<Credential> {
		anyhow::ensure!(!token.is_blank(), "twitch token is empty");
		let validation = validate_user_token(token.expose()).await?;
		info!(login = %validation.login, scopes = validation.scopes.len(), "twitch token validated");

		Ok(Credential {
			token: token.clone(),
			client_id: validation.client_id,
			login: validation.login,
			user_id: validation.user_id,
			scopes: validation.scopes,
			expires_in: (validation.expires_in > 0).then(|| Duration::from_secs(validation.expires_in)),
		})
	}

	fn api(&self, credential: &Credential) -> anyhow::Result<Arc<dyn HelixApi>> {
		let client = HelixClient::new(
			self.cfg.helix_base_url.clone(),
			credential.client_id.clone(),
			credential.token.expose().to_string(),
			credential.user_id.clone(),
		)?;
		Ok(Arc::new(client))
	}

	fn listener(&self, credential: &Credential, api: Arc<dyn HelixApi>) -> anyhow::Result<Arc<dyn ChatConnection>> {
		let chat = TwitchChat::with_follows(self.chat_config(credential)?, api, self.cfg.follow_poll_interval);
		Ok(Arc::new(chat))
	}

	fn sender(&self, credential: &Credential) -> anyhow::Result<Arc<dyn ChatConnection>> {
		Ok(Arc::new(TwitchChat::new(self.chat_config(credential)?)))
	}

	async fn revoke(&self, token: &SecretString) -> anyhow::Result<()> {
		anyhow::ensure!(!token.is_blank(), "twitch token is empty");
		let validation = validate_user_token(token.expose())
			.await
			.context("resolve client id for revoke")?;
		revoke_user_token(&validation.client_id, token.expose()).await?;
		info!(login = %validation.login, "twitch token revoked");
		Ok(())
	}
}
