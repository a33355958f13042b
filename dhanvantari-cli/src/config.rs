use anyhow::{bail, Result};
use clap::Args;
use dhanvantari_shared::language_name;

const CHAT_FUNCTION_PATH: &str = "/functions/v1/dhanvantari-chat";

/// Endpoint settings, read from flags or the environment (`.env` included).
#[derive(Debug, Clone, Args)]
pub struct EndpointArgs {
    /// Full URL of the chat function
    #[arg(long, env = "DHANVANTARI_CHAT_URL", global = true)]
    pub chat_url: Option<String>,

    /// Project URL the chat function is served from
    #[arg(long, env = "SUPABASE_URL", global = true)]
    pub supabase_url: Option<String>,

    /// Publishable key sent as the bearer token
    #[arg(long, env = "SUPABASE_PUBLISHABLE_KEY", hide_env_values = true, global = true)]
    pub api_key: Option<String>,

    /// Wellness backend serving the scan and diagnosis endpoints
    #[arg(
        long,
        env = "BACKEND_URL",
        default_value = "http://localhost:8000",
        global = true
    )]
    pub backend_url: String,

    /// Reply language code (en, hi, ta, te, bn, mr, gu, kn, ml, pa)
    #[arg(short, long, env = "DHANVANTARI_LANGUAGE", default_value = "en", global = true)]
    pub language: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatConfig {
    pub chat_url: String,
    pub api_key: String,
    /// Language name, already resolved from the code.
    pub language: String,
}

impl EndpointArgs {
    pub fn chat_config(&self) -> Result<ChatConfig> {
        let chat_url = match (&self.chat_url, &self.supabase_url) {
            (Some(url), _) => url.clone(),
            (None, Some(base)) => format!("{}{}", base.trim_end_matches('/'), CHAT_FUNCTION_PATH),
            (None, None) => bail!("no chat endpoint configured; set DHANVANTARI_CHAT_URL or SUPABASE_URL"),
        };

        let api_key = match &self.api_key {
            Some(key) if !key.trim().is_empty() => key.clone(),
            _ => bail!("SUPABASE_PUBLISHABLE_KEY must be set to talk to the chat endpoint"),
        };

        Ok(ChatConfig {
            chat_url,
            api_key,
            language: language_name(&self.language).to_string(),
        })
    }
}
