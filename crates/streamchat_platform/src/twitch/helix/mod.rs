#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use streamchat_domain::ChannelName;
use url::Url;

use crate::{
	BadgeSet, Category, Chatters, Clip, CreatedClip, Emote, Follower, HelixApi, StreamInfo, StreamMarker, User, UserQuery,
};

pub const DEFAULT_HELIX_BASE_URL: &str = "https://api.twitch.tv";

const GAMES_PATH: &str = "/helix/games";
const CLIPS_PATH: &str = "/helix/clips";
const USERS_PATH: &str = "/helix/users";
const CHATTERS_PATH: &str = "/helix/chat/chatters";
const STREAMS_PATH: &str = "/helix/streams";
const STREAM_MARKERS_PATH: &str = "/helix/streams/markers";
const GLOBAL_EMOTES_PATH: &str = "/helix/chat/emotes/global";
const CHANNEL_EMOTES_PATH: &str = "/helix/chat/emotes";
const GLOBAL_BADGES_PATH: &str = "/helix/chat/badges/global";
const CHANNEL_BADGES_PATH: &str = "/helix/chat/badges";
const CHANNEL_FOLLOWERS_PATH: &str = "/helix/channels/followers";
const TOKEN_VALIDATE_URL: &str = "https://id.twitch.tv/oauth2/validate";
const TOKEN_REVOKE_URL: &str = "https://id.twitch.tv/oauth2/revoke";

/// Helix caps `first` at 100 for list endpoints.
const MAX_PAGE_SIZE: u32 = 100;

fn retry_delay_from_headers(headers: &HeaderMap) -> Option<Duration> {
	if let Some(v) = headers.get(RETRY_AFTER)
		&& let Ok(s) = v.to_str()
		&& let Ok(secs) = s.trim().parse::<u64>()
	{
		return Some(Duration::from_secs(secs));
	}

	if let Some(v) = headers.get("Ratelimit-Reset")
		&& let Ok(s) = v.to_str()
		&& let Ok(reset_unix) = s.trim().parse::<u64>()
	{
		let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
		if reset_unix > now {
			return Some(Duration::from_secs(reset_unix - now));
		}
	}

	None
}

async fn send_with_retry(req: reqwest::RequestBuilder, label: &'static str) -> anyhow::Result<reqwest::Response> {
	let retry_builder = req.try_clone();
	let resp = req.send().await.with_context(|| format!("helix {label} send"))?;
	let status = resp.status();

	if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("helix auth failed (status={status}) body={body}");
	}

	if status == StatusCode::TOO_MANY_REQUESTS
		&& let Some(delay) = retry_delay_from_headers(resp.headers())
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(delay).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	if status.is_server_error()
		&& let Some(retry) = retry_builder
	{
		tokio::time::sleep(Duration::from_millis(250)).await;
		let retry_resp = retry.send().await.with_context(|| format!("helix {label} retry send"))?;
		return Ok(retry_resp);
	}

	Ok(resp)
}

/// Response of the OAuth validate endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct TwitchTokenValidation {
	pub client_id: String,
	pub login: String,
	pub user_id: String,
	pub expires_in: u64,
	#[serde(default)]
	pub scopes: Vec<String>,
}

/// Helix REST client bound to one user token.
#[derive(Clone, Debug)]
pub struct HelixClient {
	http: reqwest::Client,
	base_url: Url,
	client_id: String,
	bearer_token: String,
	token_user_id: String,
}

#[derive(Debug, Deserialize)]
struct HelixData<T> {
	data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct HelixChattersResponse {
	data: Vec<HelixChatter>,
	#[serde(default)]
	total: u64,
}

#[derive(Debug, Deserialize)]
struct HelixChatter {
	user_login: String,
}

#[derive(Debug, Serialize)]
struct HelixCreateMarker<'a> {
	user_id: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	description: Option<&'a str>,
}

impl HelixClient {
	pub fn new(base_url: Url, client_id: String, bearer_token: String, token_user_id: String) -> anyhow::Result<Self> {
		let http = reqwest::Client::builder()
			.user_agent("streamchat/0.x (helix)")
			.build()
			.context("build reqwest client")?;

		Ok(Self {
			http,
			base_url,
			client_id,
			bearer_token,
			token_user_id,
		})
	}

	fn authed(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		req.header("Client-Id", &self.client_id)
			.header("Authorization", format!("Bearer {}", self.bearer_token))
	}

	fn url(&self, path: &str, query: &[(&str, &str)]) -> anyhow::Result<Url> {
		let mut url = self.base_url.join(path).context("join helix url")?;
		if !query.is_empty() {
			let mut pairs = url.query_pairs_mut();
			for (k, v) in query {
				pairs.append_pair(k, v);
			}
		}
		Ok(url)
	}

	async fn read_data<T: DeserializeOwned>(resp: reqwest::Response, label: &'static str) -> anyhow::Result<Vec<T>> {
		let status = resp.status();
		let body = resp.text().await.with_context(|| format!("helix {label} read body"))?;

		if !status.is_success() {
			anyhow::bail!("helix {label} failed: status={status} body={body}");
		}

		let parsed: HelixData<T> = serde_json::from_str(&body).with_context(|| format!("helix {label} parse json"))?;
		Ok(parsed.data)
	}

	async fn get_data<T: DeserializeOwned>(&self, url: Url, label: &'static str) -> anyhow::Result<Vec<T>> {
		let resp = send_with_retry(self.authed(self.http.get(url)), label).await?;
		Self::read_data(resp, label).await
	}

	async fn list_by<T: DeserializeOwned>(
		&self,
		path: &str,
		key: &str,
		values: &[String],
		label: &'static str,
	) -> anyhow::Result<Vec<T>> {
		if values.is_empty() {
			return Ok(Vec::new());
		}
		let pairs: Vec<(&str, &str)> = values.iter().map(|v| (key, v.as_str())).collect();
		self.get_data(self.url(path, &pairs)?, label).await
	}

	async fn user_id_for_login(&self, login: &str) -> anyhow::Result<Option<String>> {
		let users: Vec<User> = self
			.list_by(USERS_PATH, "login", &[login.to_string()], "GET /helix/users")
			.await?;
		Ok(users.into_iter().next().map(|u| u.id))
	}
}

#[async_trait]
impl HelixApi for HelixClient {
	async fn get_games(&self, ids: &[String]) -> anyhow::Result<Vec<Category>> {
		self.list_by(GAMES_PATH, "id", ids, "GET /helix/games").await
	}

	async fn get_clips_by_id(&self, ids: &[String]) -> anyhow::Result<Vec<Clip>> {
		self.list_by(CLIPS_PATH, "id", ids, "GET /helix/clips").await
	}

	async fn get_clips_by_broadcaster(&self, broadcaster_id: &str, first: u32) -> anyhow::Result<Vec<Clip>> {
		let first = first.clamp(1, MAX_PAGE_SIZE).to_string();
		let url = self.url(CLIPS_PATH, &[("broadcaster_id", broadcaster_id), ("first", &first)])?;
		self.get_data(url, "GET /helix/clips").await
	}

	async fn create_clip(&self, broadcaster_id: &str, has_delay: bool) -> anyhow::Result<Vec<CreatedClip>> {
		let has_delay = if has_delay { "true" } else { "false" };
		let url = self.url(CLIPS_PATH, &[("broadcaster_id", broadcaster_id), ("has_delay", has_delay)])?;
		let resp = send_with_retry(self.authed(self.http.post(url)), "POST /helix/clips").await?;
		Self::read_data(resp, "POST /helix/clips").await
	}

	async fn get_users(&self, query: &UserQuery) -> anyhow::Result<Vec<User>> {
		match query {
			UserQuery::Ids(ids) => self.list_by(USERS_PATH, "id", ids, "GET /helix/users").await,
			UserQuery::Logins(logins) => self.list_by(USERS_PATH, "login", logins, "GET /helix/users").await,
		}
	}

	async fn get_chatters(&self, channel: &ChannelName) -> anyhow::Result<Chatters> {
		let broadcaster_id = self
			.user_id_for_login(channel.as_str())
			.await?
			.with_context(|| format!("helix chatters: unknown channel {channel}"))?;

		let first = MAX_PAGE_SIZE.to_string();
		let url = self.url(
			CHATTERS_PATH,
			&[
				("broadcaster_id", broadcaster_id.as_str()),
				("moderator_id", self.token_user_id.as_str()),
				("first", first.as_str()),
			],
		)?;

		let resp = send_with_retry(self.authed(self.http.get(url)), "GET /helix/chat/chatters").await?;
		let status = resp.status();
		let body = resp.text().await.context("helix GET /helix/chat/chatters read body")?;
		if !status.is_success() {
			anyhow::bail!("helix GET /helix/chat/chatters failed: status={status} body={body}");
		}

		let parsed: HelixChattersResponse = serde_json::from_str(&body).context("helix chatters parse json")?;
		Ok(Chatters {
			channel: channel.clone(),
			total: parsed.total,
			logins: parsed.data.into_iter().map(|c| c.user_login).collect(),
		})
	}

	async fn get_streams(&self, logins: &[String]) -> anyhow::Result<Vec<StreamInfo>> {
		self.list_by(STREAMS_PATH, "user_login", logins, "GET /helix/streams").await
	}

	async fn create_stream_marker(&self, broadcaster_id: &str, description: Option<&str>) -> anyhow::Result<StreamMarker> {
		let url = self.url(STREAM_MARKERS_PATH, &[])?;
		let req = HelixCreateMarker {
			user_id: broadcaster_id,
			description,
		};
		let resp = send_with_retry(
			self.authed(self.http.post(url)).json(&req),
			"POST /helix/streams/markers",
		)
		.await?;
		let markers: Vec<StreamMarker> = Self::read_data(resp, "POST /helix/streams/markers").await?;
		markers.into_iter().next().context("helix create marker returned empty data")
	}

	async fn get_global_emotes(&self) -> anyhow::Result<Vec<Emote>> {
		self.get_data(self.url(GLOBAL_EMOTES_PATH, &[])?, "GET /helix/chat/emotes/global")
			.await
	}

	async fn get_channel_emotes(&self, broadcaster_id: &str) -> anyhow::Result<Vec<Emote>> {
		let url = self.url(CHANNEL_EMOTES_PATH, &[("broadcaster_id", broadcaster_id)])?;
		self.get_data(url, "GET /helix/chat/emotes").await
	}

	async fn get_global_badges(&self) -> anyhow::Result<Vec<BadgeSet>> {
		self.get_data(self.url(GLOBAL_BADGES_PATH, &[])?, "GET /helix/chat/badges/global")
			.await
	}

	async fn get_channel_badges(&self, broadcaster_id: &str) -> anyhow::Result<Vec<BadgeSet>> {
		let url = self.url(CHANNEL_BADGES_PATH, &[("broadcaster_id", broadcaster_id)])?;
		self.get_data(url, "GET /helix/chat/badges").await
	}

	async fn get_channel_followers(&self, broadcaster_id: &str, first: u32) -> anyhow::Result<Vec<Follower>> {
		let first = first.clamp(1, MAX_PAGE_SIZE).to_string();
		let url = self.url(
			CHANNEL_FOLLOWERS_PATH,
			&[("broadcaster_id", broadcaster_id), ("first", first.as_str())],
		)?;
		self.get_data(url, "GET /helix/channels/followers").await
	}
}

pub async fn validate_user_token(access_token: &str) -> anyhow::Result<TwitchTokenValidation> {
	let http = reqwest::Client::builder()
		.user_agent("streamchat/0.x (oauth-validate)")
		.build()
		.context("build reqwest client")?;

	let resp = http
		.get(TOKEN_VALIDATE_URL)
		.header("Authorization", format!("OAuth {}", access_token))
		.send()
		.await
		.context("twitch validate token request")?;

	let status = resp.status();
	let body = resp.text().await.context("twitch validate token read body")?;

	if !status.is_success() {
		anyhow::bail!("twitch validate token failed: status={status} body={body}");
	}

	serde_json::from_str(&body).context("twitch validate token parse json")
}

pub async fn revoke_user_token(client_id: &str, access_token: &str) -> anyhow::Result<()> {
	let http = reqwest::Client::builder()
		.user_agent("streamchat/0.x (oauth-revoke)")
		.build()
		.context("build reqwest client")?;

	let resp = http
		.post(TOKEN_REVOKE_URL)
		.form(&[("client_id", client_id), ("token", access_token)])
		.send()
		.await
		.context("twitch revoke token request")?;

	let status = resp.status();
	if !status.is_success() {
		let body = resp.text().await.unwrap_or_default();
		anyhow::bail!("twitch revoke token failed: status={status} body={body}");
	}

	Ok(())
}

#[cfg(test)]
mod tests {
	use reqwest::header::HeaderValue;

	use super::*;

	#[test]
	fn retry_after_header_wins() {
		let mut headers = HeaderMap::new();
		headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
		headers.insert("Ratelimit-Reset", HeaderValue::from_static("1"));
		assert_eq!(retry_delay_from_headers(&headers), Some(Duration::from_secs(7)));
	}

	#[test]
	fn past_ratelimit_reset_yields_no_delay() {
		let mut headers = HeaderMap::new();
		headers.insert("Ratelimit-Reset", HeaderValue::from_static("1"));
		assert_eq!(retry_delay_from_headers(&headers), None);
	}

	#[test]
	fn url_appends_repeated_query_pairs() {
		let client = HelixClient::new(
			Url::parse(DEFAULT_HELIX_BASE_URL).unwrap(),
			"cid".to_string(),
			"tok".to_string(),
			"42".to_string(),
		)
		.unwrap();
		let url = client.url(USERS_PATH, &[("login", "a b"), ("login", "c")]).unwrap();
		assert_eq!(url.as_str(), "https://api.twitch.tv/helix/users?login=a+b&login=c");
	}

	#[test]
	fn stream_records_parse_from_helix_json() {
		let body = r#"{"data":[{"user_id":"1","user_login":"a","user_name":"A","game_name":"Chess","title":"t","viewer_count":5,"started_at":"2024-01-01T00:00:00Z","type":"live"}]}"#;
		let parsed: HelixData<StreamInfo> = serde_json::from_str(body).unwrap();
		assert_eq!(parsed.data[0].viewer_count, 5);
		assert_eq!(parsed.data[0].game_name, "Chess");
	}
}
