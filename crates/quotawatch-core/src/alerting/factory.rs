//! Builds notifiers from persisted channel definitions

use std::time::Duration;

use reqwest::Client;
use serde::de::DeserializeOwned;

use crate::config::AlertingConfig;
use crate::models::NotifyChannel;

use super::notifier::{
    Notifier, NotifyError, SmtpConfig, SmtpNotifier, TelegramConfig, TelegramNotifier,
    WebhookConfig, WebhookNotifier,
};

/// Maps a channel's declared type and config payload to a [`Notifier`]
#[derive(Debug, Clone)]
pub struct NotifierFactory {
    client: Client,
    timeout: Duration,
    telegram_api_base: String,
    email_subject_prefix: String,
}

impl NotifierFactory {
    /// Create a factory whose notifiers share one HTTP client
    pub fn new(config: &AlertingConfig) -> Result<Self, NotifyError> {
        let client = Client::builder()
            .timeout(config.notify_timeout)
            .build()
            .map_err(|e| NotifyError::Client(e.to_string()))?;

        Ok(Self {
            client,
            timeout: config.notify_timeout,
            telegram_api_base: config.telegram_api_base.clone(),
            email_subject_prefix: config.email_subject_prefix.clone(),
        })
    }

    /// Build the notifier for a channel
    pub fn create(&self, channel: &NotifyChannel) -> Result<Notifier, NotifyError> {
        match channel.channel_type.as_str() {
            "telegram" => {
                let config: TelegramConfig = parse_config(channel)?;
                Ok(Notifier::Telegram(TelegramNotifier::new(
                    self.client.clone(),
                    self.telegram_api_base.clone(),
                    config,
                )))
            }
            "webhook" => {
                let config: WebhookConfig = parse_config(channel)?;
                Ok(Notifier::Webhook(WebhookNotifier::new(
                    self.client.clone(),
                    config,
                )?))
            }
            "smtp" => {
                let config: SmtpConfig = parse_config(channel)?;
                Ok(Notifier::Smtp(SmtpNotifier::new(
                    config,
                    self.timeout,
                    self.email_subject_prefix.clone(),
                )))
            }
            other => Err(NotifyError::UnknownChannelType(other.to_string())),
        }
    }
}

fn parse_config<T: DeserializeOwned>(channel: &NotifyChannel) -> Result<T, NotifyError> {
    serde_json::from_str(&channel.config)
        .map_err(|e| NotifyError::config(channel.channel_type.as_str(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rstest::rstest;

    fn channel(channel_type: &str, config: &str) -> NotifyChannel {
        NotifyChannel {
            id: 1,
            name: "test".to_string(),
            channel_type: channel_type.to_string(),
            config: config.to_string(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[rstest]
    #[case("telegram", r#"{"bot_token": "123:abc", "chat_id": "-1001"}"#, "telegram")]
    #[case("telegram", r#"{"bot_token": "123:abc", "chat_id": 42}"#, "telegram")]
    #[case("webhook", r#"{"url": "https://example.com/hook"}"#, "webhook")]
    #[case(
        "smtp",
        r#"{"host": "smtp.example.com", "port": 465, "from": "a@example.com", "to": "b@example.com", "use_tls": true}"#,
        "smtp"
    )]
    fn test_create_known_types(
        #[case] channel_type: &str,
        #[case] config: &str,
        #[case] expected: &str,
    ) {
        let factory = NotifierFactory::new(&AlertingConfig::default()).unwrap();
        let notifier = factory.create(&channel(channel_type, config)).unwrap();
        assert_eq!(notifier.channel_type(), expected);
    }

    #[test]
    fn test_unknown_type() {
        let factory = NotifierFactory::new(&AlertingConfig::default()).unwrap();
        let err = factory.create(&channel("pigeon", "{}")).unwrap_err();
        assert!(matches!(err, NotifyError::UnknownChannelType(ref t) if t == "pigeon"));
        assert!(err.is_config());
    }

    #[rstest]
    #[case("telegram", r#"{"chat_id": 1}"#)]
    #[case("webhook", "not json")]
    #[case("smtp", r#"{"host": "smtp.example.com", "port": "abc"}"#)]
    fn test_malformed_config(#[case] channel_type: &str, #[case] config: &str) {
        let factory = NotifierFactory::new(&AlertingConfig::default()).unwrap();
        let err = factory.create(&channel(channel_type, config)).unwrap_err();
        assert!(matches!(err, NotifyError::ConfigParse { .. }));
        assert!(err.is_config());
    }
}
