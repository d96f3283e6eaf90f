use super::Config;
use crate::http::{self, HttpClientError};
use crate::prelude::*;
use crate::recipient::RecipientId;
use crate::Result;
use async_trait::async_trait;
use url::Url;

/// Delivers a text message to a single recipient
#[async_trait]
pub(crate) trait Notifier: Send + Sync {
    async fn send(&self, text: &str, recipient: &RecipientId) -> Result;
}

pub(crate) struct TgNotifier {
    http: http::Client,

    /// Contains the bot token, must never be logged
    send_message_url: Url,
}

impl TgNotifier {
    pub(crate) fn new(cfg: &Config, http: http::Client) -> Result<Self> {
        let mut send_message_url = cfg.api_url.clone();

        // The token has a colon in it, so `Url::join()` would parse its
        // prefix as a URL scheme
        send_message_url
            .path_segments_mut()
            .ok()
            .fatal_ctx(|| "Telegram Bot API URL can't be a base")?
            .pop_if_empty()
            .push(&format!("bot{}", cfg.token))
            .push("sendMessage");

        Ok(Self {
            http,
            send_message_url,
        })
    }
}

#[async_trait]
impl Notifier for TgNotifier {
    #[instrument(skip(self, text))]
    async fn send(&self, text: &str, recipient: &RecipientId) -> Result {
        let mut url = self.send_message_url.clone();

        url.query_pairs_mut()
            .append_pair("text", text)
            .append_pair("chat_id", &recipient.0);

        // The status code is already logged by the HTTP client middleware
        self.http
            .get(url)
            .send()
            .await
            .map_err(err_ctx!(HttpClientError::Request))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notifier(server: &MockServer) -> TgNotifier {
        let cfg = Config {
            token: "123:secret".to_owned(),
            api_url: server.uri().parse().unwrap(),
            webhook_url: None,
            webhook_secret: None,
        };
        TgNotifier::new(&cfg, http::create_client()).unwrap()
    }

    #[test_log::test(tokio::test)]
    async fn sends_message_via_bot_api() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/bot123:secret/sendMessage"))
            .and(query_param("text", "Honor thy error as a hidden intention"))
            .and(query_param("chat_id", "-1001"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server)
            .send("Honor thy error as a hidden intention", &"-1001".into())
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn error_status_is_not_inspected() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(400))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server)
            .send("Emphasize the flaws", &"42".into())
            .await
            .unwrap();
    }

    #[test_log::test(tokio::test)]
    async fn transport_error_hides_the_token() {
        let server = MockServer::start().await;
        let notifier = notifier(&server);

        // Nothing listens on the address anymore
        drop(server);

        let err = notifier
            .send("Look closely at the most embarrassing details", &"42".into())
            .await
            .unwrap_err();

        let message = format!("{err:?}");
        assert!(!message.contains("secret"), "{message}");
    }
}
