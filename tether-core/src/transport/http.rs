// ABOUTME: Homeserver implementation over the Matrix Client-Server HTTP API (v3).
// ABOUTME: Classifies HTTP status and Matrix errcodes into TransportError.

use super::{Homeserver, LoginResponse, SyncRequest};
use crate::error::TransportError;
use crate::event::SyncBatch;
use async_trait::async_trait;
use matrix_sdk::ruma::{OwnedEventId, OwnedRoomId, RoomAliasId, RoomId};
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Extra time allowed on top of the server-side long-poll timeout
const SYNC_TIMEOUT_MARGIN: Duration = Duration::from_secs(10);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Client-Server API transport backed by reqwest.
#[derive(Clone)]
pub struct HttpHomeserver {
    base: Url,
    http_client: Client,
}

#[derive(Debug, Default, Deserialize)]
struct MatrixErrorBody {
    #[serde(default)]
    errcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    retry_after_ms: Option<u64>,
    #[serde(default)]
    soft_logout: bool,
}

#[derive(Debug, Deserialize)]
struct RawLoginResponse {
    user_id: String,
    access_token: String,
    device_id: String,
}

#[derive(Debug, Deserialize)]
struct RoomIdResponse {
    room_id: String,
}

#[derive(Debug, Deserialize)]
struct SendResponse {
    event_id: String,
}

impl HttpHomeserver {
    pub fn new(homeserver: &str) -> anyhow::Result<Self> {
        let base = Url::parse(homeserver.trim_end_matches('/'))
            .map_err(|e| anyhow::anyhow!("Invalid homeserver URL '{}': {}", homeserver, e))?;
        if base.cannot_be_a_base() {
            anyhow::bail!("Homeserver URL '{}' cannot carry a path", homeserver);
        }
        let http_client = Client::builder()
            .user_agent(concat!("tether/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { base, http_client })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Build `{base}/_matrix/client/v3/{segments...}` with each segment percent-encoded
    fn endpoint(&self, segments: &[&str]) -> Result<Url, TransportError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| TransportError::Protocol("homeserver URL cannot be a base".into()))?
            .pop_if_empty()
            .extend(["_matrix", "client", "v3"])
            .extend(segments);
        Ok(url)
    }

    fn authed(&self, builder: RequestBuilder, token: &str) -> RequestBuilder {
        builder.bearer_auth(token)
    }

    async fn execute(&self, builder: RequestBuilder) -> Result<Value, TransportError> {
        let resp = builder.send().await.map_err(classify_reqwest)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(classify_reqwest)?;

        if status.is_success() {
            return serde_json::from_slice(&body)
                .map_err(|e| TransportError::Protocol(format!("invalid JSON body: {}", e)));
        }

        let error: MatrixErrorBody = serde_json::from_slice(&body).unwrap_or_default();
        Err(classify_status(status, error))
    }
}

/// Map a non-2xx response to a TransportError
fn classify_status(status: StatusCode, body: MatrixErrorBody) -> TransportError {
    let errcode = body.errcode.as_deref().unwrap_or("");
    let message = match (&body.errcode, &body.error) {
        (Some(code), Some(msg)) => format!("{}: {}", code, msg),
        (Some(code), None) => code.clone(),
        (None, Some(msg)) => msg.clone(),
        (None, None) => format!("HTTP {}", status.as_u16()),
    };

    if status == StatusCode::UNAUTHORIZED
        || matches!(errcode, "M_UNKNOWN_TOKEN" | "M_MISSING_TOKEN")
    {
        return TransportError::Unauthorized {
            message,
            soft_logout: body.soft_logout,
        };
    }
    if status == StatusCode::TOO_MANY_REQUESTS || errcode == "M_LIMIT_EXCEEDED" {
        return TransportError::RateLimited {
            retry_after: body.retry_after_ms.map(Duration::from_millis),
        };
    }
    if status == StatusCode::FORBIDDEN {
        return TransportError::Forbidden(message);
    }
    if status == StatusCode::NOT_FOUND {
        return TransportError::NotFound(message);
    }
    if status.is_server_error() {
        return TransportError::Network(message);
    }
    TransportError::Rejected(message)
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_decode() {
        TransportError::Protocol(err.to_string())
    } else {
        TransportError::Network(err.to_string())
    }
}

fn parse_field<T: std::str::FromStr>(value: &str, what: &str) -> Result<T, TransportError>
where
    T::Err: std::fmt::Display,
{
    value
        .parse()
        .map_err(|e| TransportError::Protocol(format!("invalid {} '{}': {}", what, value, e)))
}

fn decode<T: serde::de::DeserializeOwned>(value: Value) -> Result<T, TransportError> {
    serde_json::from_value(value).map_err(|e| TransportError::Protocol(e.to_string()))
}

#[async_trait]
impl Homeserver for HttpHomeserver {
    async fn login(
        &self,
        user: &str,
        password: &str,
        device_name: &str,
        device_id: Option<&str>,
    ) -> Result<LoginResponse, TransportError> {
        let mut body = json!({
            "type": "m.login.password",
            "identifier": {"type": "m.id.user", "user": user},
            "password": password,
            "initial_device_display_name": device_name,
        });
        if let Some(device_id) = device_id {
            body["device_id"] = json!(device_id);
        }

        let url = self.endpoint(&["login"])?;
        let value = self
            .execute(
                self.http_client
                    .post(url)
                    .timeout(REQUEST_TIMEOUT)
                    .json(&body),
            )
            .await?;
        let raw: RawLoginResponse = decode(value)?;

        Ok(LoginResponse {
            user_id: parse_field(&raw.user_id, "user id")?,
            access_token: raw.access_token,
            device_id: raw.device_id,
        })
    }

    async fn logout(&self, token: &str) -> Result<(), TransportError> {
        let url = self.endpoint(&["logout"])?;
        self.execute(
            self.authed(self.http_client.post(url), token)
                .timeout(REQUEST_TIMEOUT)
                .json(&json!({})),
        )
        .await?;
        Ok(())
    }

    async fn sync(
        &self,
        token: &str,
        request: &SyncRequest,
    ) -> Result<SyncBatch, TransportError> {
        let mut url = self.endpoint(&["sync"])?;
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("timeout", &request.timeout.as_millis().to_string());
            if let Some(since) = &request.since {
                query.append_pair("since", since);
            }
            if let Some(limit) = request.timeline_limit {
                let filter = json!({"room": {"timeline": {"limit": limit.max(1)}}});
                query.append_pair("filter", &filter.to_string());
            }
        }

        let value = self
            .execute(
                self.authed(self.http_client.get(url), token)
                    .timeout(request.timeout + SYNC_TIMEOUT_MARGIN),
            )
            .await?;

        SyncBatch::parse(value).map_err(|e| TransportError::Protocol(e.to_string()))
    }

    async fn resolve_alias(
        &self,
        token: &str,
        alias: &RoomAliasId,
    ) -> Result<OwnedRoomId, TransportError> {
        let url = self.endpoint(&["directory", "room", alias.as_str()])?;
        let value = self
            .execute(
                self.authed(self.http_client.get(url), token)
                    .timeout(REQUEST_TIMEOUT),
            )
            .await?;
        let resolved: RoomIdResponse = decode(value)?;
        parse_field(&resolved.room_id, "room id")
    }

    async fn join(&self, token: &str, room_id: &RoomId) -> Result<OwnedRoomId, TransportError> {
        let url = self.endpoint(&["rooms", room_id.as_str(), "join"])?;
        let value = self
            .execute(
                self.authed(self.http_client.post(url), token)
                    .timeout(REQUEST_TIMEOUT)
                    .json(&json!({})),
            )
            .await?;
        let joined: RoomIdResponse = decode(value)?;
        parse_field(&joined.room_id, "room id")
    }

    async fn send_text(
        &self,
        token: &str,
        room_id: &RoomId,
        txn_id: &str,
        body: &str,
    ) -> Result<OwnedEventId, TransportError> {
        let url = self.endpoint(&[
            "rooms",
            room_id.as_str(),
            "send",
            "m.room.message",
            txn_id,
        ])?;
        let value = self
            .execute(
                self.authed(self.http_client.put(url), token)
                    .timeout(REQUEST_TIMEOUT)
                    .json(&json!({"msgtype": "m.text", "body": body})),
            )
            .await?;
        let sent: SendResponse = decode(value)?;
        parse_field(&sent.event_id, "event id")
    }
}
