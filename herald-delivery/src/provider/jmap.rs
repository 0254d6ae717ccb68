//! Submission through a JMAP server (RFC 8620, RFC 8621).

use std::time::Duration;

use async_trait::async_trait;
use herald_common::outgoing;
use parking_lot::Mutex;
use reqwest::{StatusCode, header::CONTENT_TYPE};
use serde::Deserialize;
use serde_json::{Value, json};

use super::Provider;
use crate::{
    error::{ConfigurationError, DeliveryError, PermanentError, TemporaryError},
    settings::Settings,
};

const COMPONENT: &str = "jmap";
const USING: [&str; 3] = [
    "urn:ietf:params:jmap:core",
    "urn:ietf:params:jmap:mail",
    "urn:ietf:params:jmap:submission",
];
/// Mailboxes tried, in order, when no `mailbox` setting is given.
const MAILBOX_ROLES: [&str; 4] = ["outbox", "sent", "drafts", "inbox"];

#[derive(Debug, Deserialize)]
struct Upload {
    #[serde(rename = "blobId")]
    blob_id: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(rename = "methodResponses")]
    method_responses: Vec<(String, Value, String)>,
}

#[derive(Debug)]
pub struct JmapProvider {
    endpoint: String,
    account: String,
    identity: String,
    username: String,
    password: String,
    /// Envelope sender; without it the server derives the envelope from the headers.
    from: Option<String>,
    client: reqwest::Client,
    /// Configured or discovered mailbox the message is imported into.
    mailbox: Mutex<Option<String>>,
}

impl JmapProvider {
    /// # Errors
    /// Every setting except `from`, `mailbox` and `timeout_secs` is required.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigurationError> {
        let timeout = settings.parse_or(COMPONENT, "timeout_secs", 30u64)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout))
            .build()
            .map_err(|e| ConfigurationError::InvalidSetting {
                component: COMPONENT.to_string(),
                key: "endpoint".to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            endpoint: settings
                .require(COMPONENT, "endpoint")?
                .trim_end_matches('/')
                .to_string(),
            account: settings.require(COMPONENT, "account")?.to_string(),
            identity: settings.require(COMPONENT, "identity")?.to_string(),
            username: settings.require(COMPONENT, "username")?.to_string(),
            password: settings.require(COMPONENT, "password")?.to_string(),
            from: settings.get("from").map(ToString::to_string),
            client,
            mailbox: Mutex::new(settings.get("mailbox").map(ToString::to_string)),
        })
    }

    async fn upload(&self, body: &str) -> Result<String, DeliveryError> {
        let url = format!("{}/upload/{}", self.endpoint, self.account);
        let response = self
            .client
            .post(url)
            .basic_auth(&self.username, Some(&self.password))
            .header(CONTENT_TYPE, "message/rfc822")
            .body(body.to_string())
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response, "upload").await?;
        let upload: Upload = response.json().await.map_err(|e| {
            TemporaryError::Protocol(format!("Unreadable upload response: {e}"))
        })?;
        Ok(upload.blob_id)
    }

    async fn call(&self, method_calls: Value) -> Result<ApiResponse, DeliveryError> {
        let response = self
            .client
            .post(&self.endpoint)
            .basic_auth(&self.username, Some(&self.password))
            .json(&json!({ "using": USING, "methodCalls": method_calls }))
            .send()
            .await
            .map_err(transport_error)?;

        let response = check_status(response, "api call").await?;
        response
            .json()
            .await
            .map_err(|e| TemporaryError::Protocol(format!("Unreadable API response: {e}")).into())
    }

    async fn query_mailbox(&self, filter: Value) -> Result<Option<String>, DeliveryError> {
        let response = self
            .call(json!([[
                "Mailbox/query",
                { "accountId": self.account, "filter": filter, "limit": 1 },
                "q"
            ]]))
            .await?;

        Ok(response
            .method_responses
            .iter()
            .find(|(name, _, _)| name == "Mailbox/query")
            .and_then(|(_, args, _)| args.get("ids")?.get(0)?.as_str().map(ToString::to_string)))
    }

    async fn mailbox(&self) -> Result<String, DeliveryError> {
        let cached = self.mailbox.lock().clone();
        if let Some(mailbox) = cached {
            return Ok(mailbox);
        }

        let mut found = None;
        for role in MAILBOX_ROLES {
            if let Some(id) = self.query_mailbox(json!({ "role": role })).await? {
                found = Some(id);
                break;
            }
        }
        if found.is_none() {
            found = self.query_mailbox(json!({})).await?;
        }

        let mailbox = found.ok_or_else(|| {
            PermanentError::NotAuthorised(format!("No mailbox available in account {}", self.account))
        })?;
        *self.mailbox.lock() = Some(mailbox.clone());
        Ok(mailbox)
    }
}

fn transport_error(error: reqwest::Error) -> DeliveryError {
    if error.is_timeout() {
        TemporaryError::Timeout(error.to_string()).into()
    } else {
        TemporaryError::ConnectionFailed(error.to_string()).into()
    }
}

/// 408, 429 and 5xx are worth retrying, any other 4xx never succeeds.
fn classify_status(status: StatusCode, stage: &str, detail: &str) -> DeliveryError {
    let message = format!("{stage} failed with {status}: {detail}");
    match status {
        StatusCode::TOO_MANY_REQUESTS => TemporaryError::RateLimited(message).into(),
        StatusCode::REQUEST_TIMEOUT => TemporaryError::Timeout(message).into(),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => PermanentError::NotAuthorised(message).into(),
        status if status.is_server_error() => TemporaryError::ServerBusy(message).into(),
        status if status.is_client_error() => PermanentError::MessageRejected(message).into(),
        _ => TemporaryError::Protocol(message).into(),
    }
}

async fn check_status(
    response: reqwest::Response,
    stage: &str,
) -> Result<reqwest::Response, DeliveryError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let detail = response.text().await.unwrap_or_default();
    Err(classify_status(status, stage, detail.trim()))
}

/// Look for `notCreated` entries in the import and submission responses.
fn find_rejection(response: &ApiResponse) -> Option<DeliveryError> {
    for (name, args, _) in &response.method_responses {
        if name == "error" {
            let kind = args.get("type").and_then(Value::as_str).unwrap_or("unknown");
            return Some(match kind {
                "serverFail" | "serverUnavailable" | "tooManyRequests" => {
                    TemporaryError::ServerBusy(format!("JMAP method error: {kind}")).into()
                }
                _ => PermanentError::MessageRejected(format!("JMAP method error: {kind}")).into(),
            });
        }

        for key in ["notCreated", "notImported"] {
            if let Some(failures) = args.get(key).and_then(Value::as_object)
                && let Some((_, reason)) = failures.iter().next()
            {
                let kind = reason.get("type").and_then(Value::as_str).unwrap_or("unknown");
                let description = reason
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let message = format!("{name} {key}: {kind} {description}").trim().to_string();
                return Some(match kind {
                    "invalidEmail" | "noRecipients" | "invalidRecipients" => {
                        PermanentError::InvalidRecipient(message).into()
                    }
                    "forbiddenFrom" | "forbiddenToSend" | "forbidden" => {
                        PermanentError::NotAuthorised(message).into()
                    }
                    "rateLimit" | "overQuota" => TemporaryError::RateLimited(message).into(),
                    _ => PermanentError::MessageRejected(message).into(),
                });
            }
        }
    }

    None
}

#[async_trait]
impl Provider for JmapProvider {
    fn name(&self) -> &str {
        COMPONENT
    }

    #[tracing::instrument(skip(self, body), fields(endpoint = %self.endpoint))]
    async fn send(&self, address: &str, body: &str) -> Result<(), DeliveryError> {
        let blob_id = self.upload(body).await?;
        let mailbox = self.mailbox().await?;
        outgoing!(blob_id = %blob_id, mailbox = %mailbox, "Uploaded message blob");

        let mut submission = json!({ "emailId": "#msg", "identityId": self.identity });
        if let Some(from) = &self.from {
            submission["envelope"] = json!({
                "mailFrom": { "email": from },
                "rcptTo": [{ "email": address }]
            });
        }

        let response = self
            .call(json!([
                [
                    "Email/import",
                    {
                        "accountId": self.account,
                        "emails": { "msg": { "blobId": blob_id, "mailboxIds": { mailbox: true } } }
                    },
                    "c1"
                ],
                [
                    "EmailSubmission/set",
                    {
                        "accountId": self.account,
                        "create": { "sub": submission }
                    },
                    "c2"
                ]
            ]))
            .await?;

        find_rejection(&response).map_or(Ok(()), Err)
    }
}
