use serde::Deserialize;
use url::Url;

#[derive(Deserialize)]
pub(crate) struct Config {
    pub(crate) token: String,

    #[serde(default = "default_api_url")]
    pub(crate) api_url: Url,

    /// Public URL of the `/webhook` endpoint of this server
    pub(crate) webhook_url: Option<Url>,

    /// Telegram sends it back in the `X-Telegram-Bot-Api-Secret-Token` header
    pub(crate) webhook_secret: Option<String>,
}

fn default_api_url() -> Url {
    "https://api.telegram.org"
        .parse()
        .expect("BUG: invalid default Telegram API URL")
}
