//! Notification delivery for alerts

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use lettre::message::header::ContentType;
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::{Credentials, Mechanism};
use lettre::transport::smtp::client::{Tls, TlsParameters};
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use reqwest::{Client, Method, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Characters Telegram's MarkdownV2 treats as markup
const MARKDOWN_V2_RESERVED: [char; 18] = [
    '_', '*', '[', ']', '(', ')', '~', '`', '>', '#', '+', '-', '=', '|', '{', '}', '.', '!',
];

/// Notification errors
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    /// The channel's configuration payload could not be used
    #[error("invalid {channel_type} channel config: {reason}")]
    ConfigParse {
        /// Declared channel type
        channel_type: String,
        /// Parser message
        reason: String,
    },

    /// No notifier exists for the declared channel type
    #[error("unknown channel type: {0}")]
    UnknownChannelType(String),

    /// Network, timeout or non-success response
    #[error("{channel} delivery failed: {message}")]
    Transport {
        /// Channel type that failed
        channel: &'static str,
        /// Transport error text
        message: String,
    },

    /// The HTTP client could not be built
    #[error("HTTP client error: {0}")]
    Client(String),
}

impl NotifyError {
    pub(crate) fn config(channel_type: impl Into<String>, reason: impl ToString) -> Self {
        Self::ConfigParse {
            channel_type: channel_type.into(),
            reason: reason.to_string(),
        }
    }

    fn transport(channel: &'static str, message: impl Into<String>) -> Self {
        Self::Transport {
            channel,
            message: message.into(),
        }
    }

    fn smtp_stage(stage: &str, err: impl std::fmt::Display) -> Self {
        Self::transport("smtp", format!("{stage} failed: {err}"))
    }

    /// Whether the channel was never attempted because it is misconfigured
    pub fn is_config(&self) -> bool {
        matches!(self, Self::ConfigParse { .. } | Self::UnknownChannelType(_))
    }
}

/// A channel-specific sender of title/body pairs
#[derive(Debug, Clone)]
pub enum Notifier {
    /// Telegram Bot API
    Telegram(TelegramNotifier),
    /// Generic JSON webhook
    Webhook(WebhookNotifier),
    /// SMTP mail
    Smtp(SmtpNotifier),
}

impl Notifier {
    /// Channel type name
    pub fn channel_type(&self) -> &'static str {
        match self {
            Notifier::Telegram(_) => "telegram",
            Notifier::Webhook(_) => "webhook",
            Notifier::Smtp(_) => "smtp",
        }
    }

    /// Deliver one notification
    pub async fn send(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        match self {
            Notifier::Telegram(n) => n.send(title, body).await,
            Notifier::Webhook(n) => n.send(title, body).await,
            Notifier::Smtp(n) => n.send(title, body).await,
        }
    }
}

// --- Telegram ---

/// Telegram chat identifier, numeric or `@channelname`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatId {
    /// Numeric chat id
    Id(i64),
    /// Public username
    Name(String),
}

/// Telegram channel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    /// Bot token issued by BotFather
    pub bot_token: String,
    /// Target chat
    pub chat_id: ChatId,
}

/// Sends MarkdownV2 messages through the Bot API
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: Client,
    api_base: String,
    bot_token: String,
    chat_id: ChatId,
}

#[derive(Debug, Serialize)]
struct TelegramPayload<'a> {
    chat_id: &'a ChatId,
    text: String,
    parse_mode: &'static str,
}

impl TelegramNotifier {
    /// Create a Telegram notifier
    pub fn new(client: Client, api_base: impl Into<String>, config: TelegramConfig) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            bot_token: config.bot_token,
            chat_id: config.chat_id,
        }
    }

    async fn send(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        let url = format!(
            "{}/bot{}/sendMessage",
            self.api_base.trim_end_matches('/'),
            self.bot_token
        );

        let payload = TelegramPayload {
            chat_id: &self.chat_id,
            text: format!(
                "*{}*\n\n{}",
                escape_markdown_v2(title),
                escape_markdown_v2(body)
            ),
            parse_mode: "MarkdownV2",
        };

        // The URL embeds the bot token, keep it out of error text.
        let response = self
            .client
            .post(&url)
            .json(&payload)
            .send()
            .await
            .map_err(|e| NotifyError::transport("telegram", e.without_url().to_string()))?;

        if response.status() != StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::transport(
                "telegram",
                format!("API returned {status}: {body}"),
            ));
        }

        info!(chat_id = ?self.chat_id, "Telegram notification sent");
        Ok(())
    }
}

/// Escape every MarkdownV2 reserved character with a backslash
pub fn escape_markdown_v2(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if MARKDOWN_V2_RESERVED.contains(&c) {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

// --- Webhook ---

/// Webhook channel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    /// Target URL
    pub url: String,
    /// HTTP method, POST when empty
    #[serde(default)]
    pub method: String,
    /// Extra request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Sends a JSON document to an arbitrary endpoint
#[derive(Debug, Clone)]
pub struct WebhookNotifier {
    client: Client,
    url: String,
    method: Method,
    headers: HashMap<String, String>,
}

#[derive(Debug, Serialize)]
struct WebhookPayload<'a> {
    title: &'a str,
    message: &'a str,
    timestamp: i64,
}

impl WebhookNotifier {
    /// Create a webhook notifier, validating the configured method
    pub fn new(client: Client, config: WebhookConfig) -> Result<Self, NotifyError> {
        let method = if config.method.trim().is_empty() {
            Method::POST
        } else {
            Method::from_bytes(config.method.trim().to_uppercase().as_bytes())
                .map_err(|e| NotifyError::config("webhook", e))?
        };

        if config.url.trim().is_empty() {
            return Err(NotifyError::config("webhook", "url is empty"));
        }

        Ok(Self {
            client,
            url: config.url,
            method,
            headers: config.headers,
        })
    }

    async fn send(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        let payload = WebhookPayload {
            title,
            message: body,
            timestamp: Utc::now().timestamp(),
        };

        let mut request = self
            .client
            .request(self.method.clone(), &self.url)
            .json(&payload);

        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::transport("webhook", e.to_string()))?;

        let status = response.status();
        if status.as_u16() >= 400 {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::transport(
                "webhook",
                format!("endpoint returned {status}: {body}"),
            ));
        }

        info!(url = %self.url, status = %status, "Webhook notification sent");
        Ok(())
    }
}

// --- SMTP ---

/// SMTP channel configuration
#[derive(Debug, Clone, Deserialize)]
pub struct SmtpConfig {
    /// Server host name
    pub host: String,
    /// Server port
    pub port: u16,
    /// Login user, no authentication when empty
    #[serde(default)]
    pub username: String,
    /// Login password
    #[serde(default)]
    pub password: String,
    /// Sender address
    pub from: String,
    /// Comma-separated recipient addresses
    pub to: String,
    /// Connect over implicit TLS instead of plaintext with opportunistic STARTTLS
    #[serde(default)]
    pub use_tls: bool,
}

/// Sends plain-text mail
#[derive(Debug, Clone)]
pub struct SmtpNotifier {
    host: String,
    port: u16,
    username: String,
    password: String,
    from: String,
    to: Vec<String>,
    use_tls: bool,
    timeout: Duration,
    subject_prefix: String,
}

impl SmtpNotifier {
    /// Create an SMTP notifier
    pub fn new(config: SmtpConfig, timeout: Duration, subject_prefix: impl Into<String>) -> Self {
        let to = config
            .to
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect();

        Self {
            host: config.host,
            port: config.port,
            username: config.username,
            password: config.password,
            from: config.from,
            to,
            use_tls: config.use_tls,
            timeout,
            subject_prefix: subject_prefix.into(),
        }
    }

    /// Build the RFC 822 message for a title/body pair
    pub fn build_message(&self, title: &str, body: &str) -> Result<Message, NotifyError> {
        if self.to.is_empty() {
            return Err(NotifyError::smtp_stage("recipients", "no recipients configured"));
        }

        let from: Mailbox = self
            .from
            .parse()
            .map_err(|e| NotifyError::smtp_stage("sender address", e))?;

        let mut builder = Message::builder()
            .from(from)
            .subject(format!("[{}] {}", self.subject_prefix, title))
            .header(ContentType::TEXT_PLAIN);

        for recipient in &self.to {
            let mailbox: Mailbox = recipient
                .parse()
                .map_err(|e| NotifyError::smtp_stage("recipient address", e))?;
            builder = builder.to(mailbox);
        }

        builder
            .body(body.to_string())
            .map_err(|e| NotifyError::smtp_stage("message build", e))
    }

    fn transport(&self) -> Result<AsyncSmtpTransport<Tokio1Executor>, NotifyError> {
        let parameters = TlsParameters::new(self.host.clone())
            .map_err(|e| NotifyError::smtp_stage("tls setup", e))?;

        let tls = if self.use_tls {
            Tls::Wrapper(parameters)
        } else {
            Tls::Opportunistic(parameters)
        };

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&self.host)
            .port(self.port)
            .tls(tls)
            .timeout(Some(self.timeout));

        if !self.username.is_empty() {
            builder = builder
                .credentials(Credentials::new(
                    self.username.clone(),
                    self.password.clone(),
                ))
                .authentication(vec![Mechanism::Plain]);
        }

        Ok(builder.build())
    }

    async fn send(&self, title: &str, body: &str) -> Result<(), NotifyError> {
        let message = self.build_message(title, body)?;
        let transport = self.transport()?;

        debug!(host = %self.host, port = self.port, tls = self.use_tls, "Sending SMTP notification");

        transport
            .send(message)
            .await
            .map_err(|e| NotifyError::smtp_stage(delivery_stage(&e), e))?;

        info!(host = %self.host, recipients = self.to.len(), "Email notification sent");
        Ok(())
    }
}

fn delivery_stage(err: &lettre::transport::smtp::Error) -> &'static str {
    if err.is_timeout() {
        "smtp timeout"
    } else if err.is_permanent() || err.is_transient() {
        "smtp command"
    } else {
        "smtp connection"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use wiremock::matchers::{body_json, body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client() -> Client {
        Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[test]
    fn test_escape_markdown_v2() {
        assert_eq!(
            escape_markdown_v2("[Quota Warning] edge-1 (85.0%)!"),
            r"\[Quota Warning\] edge\-1 \(85\.0%\)\!"
        );
        assert_eq!(escape_markdown_v2("plain text"), "plain text");
        let all: String = MARKDOWN_V2_RESERVED.iter().collect();
        assert_eq!(escape_markdown_v2(&all).len(), all.len() * 2);
    }

    #[tokio::test]
    async fn test_telegram_send() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_json(json!({
                "chat_id": -100200,
                "text": "*\\[Node Offline\\] edge\\-1*\n\nNode edge\\-1 went offline",
                "parse_mode": "MarkdownV2",
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(
            client(),
            server.uri(),
            TelegramConfig {
                bot_token: "123:abc".to_string(),
                chat_id: ChatId::Id(-100200),
            },
        );

        notifier
            .send("[Node Offline] edge-1", "Node edge-1 went offline")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_telegram_error_carries_response_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("chat not found"))
            .mount(&server)
            .await;

        let notifier = TelegramNotifier::new(
            client(),
            server.uri(),
            TelegramConfig {
                bot_token: "t".to_string(),
                chat_id: ChatId::Name("@ops".to_string()),
            },
        );

        let err = notifier.send("title", "body").await.unwrap_err();
        assert!(matches!(err, NotifyError::Transport { channel: "telegram", .. }));
        assert!(err.to_string().contains("chat not found"));
    }

    #[tokio::test]
    async fn test_webhook_send_with_method_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/hooks/alerts"))
            .and(header("x-api-key", "secret"))
            .and(body_partial_json(json!({
                "title": "[Quota Exceeded] alice",
                "message": "over quota",
            })))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            client(),
            WebhookConfig {
                url: format!("{}/hooks/alerts", server.uri()),
                method: "put".to_string(),
                headers: HashMap::from([("x-api-key".to_string(), "secret".to_string())]),
            },
        )
        .unwrap();

        notifier
            .send("[Quota Exceeded] alice", "over quota")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let notifier = WebhookNotifier::new(
            client(),
            WebhookConfig {
                url: server.uri(),
                method: String::new(),
                headers: HashMap::new(),
            },
        )
        .unwrap();

        let err = notifier.send("t", "b").await.unwrap_err();
        assert!(err.to_string().contains("503"));
        assert!(err.to_string().contains("maintenance"));
    }

    #[test]
    fn test_webhook_rejects_bad_method() {
        let result = WebhookNotifier::new(
            client(),
            WebhookConfig {
                url: "http://localhost/hook".to_string(),
                method: "NOT A METHOD".to_string(),
                headers: HashMap::new(),
            },
        );
        assert!(matches!(result, Err(NotifyError::ConfigParse { .. })));
    }

    fn smtp_config(port: u16, to: &str) -> SmtpConfig {
        SmtpConfig {
            host: "127.0.0.1".to_string(),
            port,
            username: String::new(),
            password: String::new(),
            from: "alerts@example.com".to_string(),
            to: to.to_string(),
            use_tls: false,
        }
    }

    #[test]
    fn test_smtp_message_headers() {
        let notifier = SmtpNotifier::new(
            smtp_config(25, "ops@example.com, oncall@example.com"),
            Duration::from_secs(10),
            "Quota Watch",
        );

        let message = notifier
            .build_message("[Quota Warning] edge-1", "usage at 85%")
            .unwrap();
        let raw = String::from_utf8(message.formatted()).unwrap();

        assert!(raw.contains("Subject: [Quota Watch] [Quota Warning] edge-1"));
        assert!(raw.contains("ops@example.com"));
        assert!(raw.contains("oncall@example.com"));
        assert!(raw.contains("Content-Type: text/plain"));
        assert!(raw.contains("usage at 85%"));
    }

    #[test]
    fn test_smtp_requires_recipients() {
        let notifier = SmtpNotifier::new(smtp_config(25, " , "), Duration::from_secs(10), "QW");
        let err = notifier.build_message("t", "b").unwrap_err();
        assert!(err.to_string().contains("recipients"));
    }

    #[tokio::test]
    async fn test_smtp_connection_failure_names_stage() {
        // Reserve a port, then close it so the connection is refused.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let notifier = SmtpNotifier::new(
            smtp_config(port, "ops@example.com"),
            Duration::from_secs(2),
            "QW",
        );

        let err = notifier.send("t", "b").await.unwrap_err();
        assert!(matches!(err, NotifyError::Transport { channel: "smtp", .. }));
        assert!(err.to_string().contains("failed"));
    }
}
