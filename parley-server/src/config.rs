use parley_shared::models;
use std::collections::HashMap;
use std::fmt::Display;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

pub const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant. \
    Follow the user's instructions carefully. Respond using markdown.";
pub const DEFAULT_API_HOST: &str = "https://api.openai.com";
pub const DEFAULT_API_VERSION: &str = "2023-05-15";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiFlavor {
    OpenAi,
    Azure,
}

impl FromStr for ApiFlavor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(ApiFlavor::OpenAi),
            "azure" => Ok(ApiFlavor::Azure),
            other => Err(format!("expected 'openai' or 'azure', got '{other}'")),
        }
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("{name} has an invalid value '{value}': {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

impl ConfigError {
    fn invalid(name: &'static str, value: &str, reason: impl Display) -> Self {
        ConfigError::Invalid {
            name,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: SocketAddr,
    pub api_host: String,
    pub api_flavor: ApiFlavor,
    pub api_version: String,
    pub organization: Option<String>,
    /// Used when a request does not carry its own key.
    pub api_key: Option<String>,
    /// model id -> Azure deployment id
    pub azure_deployments: HashMap<String, String>,
    pub azure_default_deployment: Option<String>,
    pub default_system_prompt: String,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
    pub default_model: String,
    /// Upper bound for the wait on each chunk of the provider stream.
    pub stream_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 3000)),
            api_host: DEFAULT_API_HOST.to_string(),
            api_flavor: ApiFlavor::OpenAi,
            api_version: DEFAULT_API_VERSION.to_string(),
            organization: None,
            api_key: None,
            azure_deployments: HashMap::new(),
            azure_default_deployment: None,
            default_system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            default_temperature: 1.0,
            default_max_tokens: 1000,
            default_model: "gpt-3.5-turbo".to_string(),
            stream_timeout: Duration::from_secs(60),
        }
    }
}

fn parse<T>(name: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.trim()
        .parse()
        .map_err(|e| ConfigError::invalid(name, raw, e))
}

fn parse_deployments(raw: &str) -> Result<HashMap<String, String>, ConfigError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('=') {
            Some((model, deployment)) if !model.trim().is_empty() && !deployment.trim().is_empty() => {
                Ok((model.trim().to_string(), deployment.trim().to_string()))
            }
            _ => Err(ConfigError::invalid(
                "AZURE_DEPLOYMENTS",
                raw,
                format!("entry '{entry}' is not model=deployment"),
            )),
        })
        .collect()
}

impl ServerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from a variable lookup; empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let mut config = ServerConfig::default();

        if let Some(raw) = get("PARLEY_BIND_ADDR") {
            config.bind_addr = parse("PARLEY_BIND_ADDR", &raw)?;
        }
        if let Some(raw) = get("OPENAI_API_HOST") {
            config.api_host = raw.trim().trim_end_matches('/').to_string();
        }
        if let Some(raw) = get("OPENAI_API_TYPE") {
            config.api_flavor = parse("OPENAI_API_TYPE", &raw)?;
        }
        if let Some(raw) = get("OPENAI_API_VERSION") {
            config.api_version = raw.trim().to_string();
        }
        config.organization = get("OPENAI_ORGANIZATION");
        config.api_key = get("OPENAI_API_KEY");
        if let Some(raw) = get("AZURE_DEPLOYMENTS") {
            config.azure_deployments = parse_deployments(&raw)?;
        }
        config.azure_default_deployment = get("AZURE_DEPLOYMENT_ID");
        if let Some(raw) = get("DEFAULT_SYSTEM_PROMPT") {
            config.default_system_prompt = raw;
        }
        if let Some(raw) = get("DEFAULT_TEMPERATURE") {
            let temperature: f32 = parse("DEFAULT_TEMPERATURE", &raw)?;
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ConfigError::invalid(
                    "DEFAULT_TEMPERATURE",
                    &raw,
                    "must be between 0 and 2",
                ));
            }
            config.default_temperature = temperature;
        }
        if let Some(raw) = get("DEFAULT_MAX_TOKENS") {
            let max_tokens: u32 = parse("DEFAULT_MAX_TOKENS", &raw)?;
            if max_tokens == 0 {
                return Err(ConfigError::invalid(
                    "DEFAULT_MAX_TOKENS",
                    &raw,
                    "must be greater than 0",
                ));
            }
            config.default_max_tokens = max_tokens;
        }
        if let Some(raw) = get("DEFAULT_MODEL") {
            let model = raw.trim().to_string();
            if models::find_model(&model).is_none() {
                return Err(ConfigError::invalid(
                    "DEFAULT_MODEL",
                    &raw,
                    "not a supported model",
                ));
            }
            config.default_model = model;
        }
        if let Some(raw) = get("STREAM_TIMEOUT_SECS") {
            let secs: u64 = parse("STREAM_TIMEOUT_SECS", &raw)?;
            if secs == 0 {
                return Err(ConfigError::invalid(
                    "STREAM_TIMEOUT_SECS",
                    &raw,
                    "must be greater than 0",
                ));
            }
            config.stream_timeout = Duration::from_secs(secs);
        }

        if config.api_flavor == ApiFlavor::OpenAi {
            if let Some(key) = &config.api_key {
                if !key.starts_with("sk-") {
                    warn!("OPENAI_API_KEY does not start with 'sk-', check your .env file");
                }
            }
        }

        Ok(config)
    }

    /// Azure deployment serving `model_id`: explicit mapping, then
    /// `AZURE_DEPLOYMENT_ID`, then the model id itself.
    pub fn deployment_for(&self, model_id: &str) -> String {
        self.azure_deployments
            .get(model_id)
            .or(self.azure_default_deployment.as_ref())
            .cloned()
            .unwrap_or_else(|| model_id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_nothing_is_set() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.api_flavor, ApiFlavor::OpenAi);
        assert_eq!(config.api_host, DEFAULT_API_HOST);
        assert_eq!(config.default_model, "gpt-3.5-turbo");
        assert_eq!(config.default_max_tokens, 1000);
        assert!(config.api_key.is_none());
    }

    #[test]
    fn azure_settings_are_read() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("OPENAI_API_TYPE", "Azure"),
            ("OPENAI_API_HOST", "https://example.openai.azure.com/"),
            ("OPENAI_API_VERSION", "2024-02-01"),
            ("AZURE_DEPLOYMENTS", "gpt-4=prod-gpt4, gpt-35-turbo=chat"),
            ("AZURE_DEPLOYMENT_ID", "fallback"),
        ]))
        .unwrap();
        assert_eq!(config.api_flavor, ApiFlavor::Azure);
        assert_eq!(config.api_host, "https://example.openai.azure.com");
        assert_eq!(config.api_version, "2024-02-01");
        assert_eq!(config.deployment_for("gpt-4"), "prod-gpt4");
        assert_eq!(config.deployment_for("gpt-35-turbo"), "chat");
        assert_eq!(config.deployment_for("gpt-4-32k"), "fallback");
    }

    #[test]
    fn deployment_defaults_to_model_id() {
        let config = ServerConfig::default();
        assert_eq!(config.deployment_for("gpt-4"), "gpt-4");
    }

    #[test]
    fn empty_values_are_unset() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("OPENAI_API_KEY", "  "),
            ("OPENAI_ORGANIZATION", ""),
        ]))
        .unwrap();
        assert!(config.api_key.is_none());
        assert!(config.organization.is_none());
    }

    #[test]
    fn rejects_invalid_values() {
        let err = ServerConfig::from_lookup(lookup(&[("DEFAULT_TEMPERATURE", "3.5")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "DEFAULT_TEMPERATURE", .. }));

        let err = ServerConfig::from_lookup(lookup(&[("DEFAULT_MODEL", "llama")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "DEFAULT_MODEL", .. }));

        let err = ServerConfig::from_lookup(lookup(&[("OPENAI_API_TYPE", "anthropic")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "OPENAI_API_TYPE", .. }));

        let err = ServerConfig::from_lookup(lookup(&[("AZURE_DEPLOYMENTS", "gpt-4")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "AZURE_DEPLOYMENTS", .. }));

        let err = ServerConfig::from_lookup(lookup(&[("STREAM_TIMEOUT_SECS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { name: "STREAM_TIMEOUT_SECS", .. }));
    }

    #[test]
    fn overrides_defaults() {
        let config = ServerConfig::from_lookup(lookup(&[
            ("PARLEY_BIND_ADDR", "0.0.0.0:8080"),
            ("DEFAULT_SYSTEM_PROMPT", "Be terse."),
            ("DEFAULT_TEMPERATURE", "0.2"),
            ("DEFAULT_MAX_TOKENS", "512"),
            ("DEFAULT_MODEL", "gpt-4"),
            ("STREAM_TIMEOUT_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr.port(), 8080);
        assert_eq!(config.default_system_prompt, "Be terse.");
        assert_eq!(config.default_temperature, 0.2);
        assert_eq!(config.default_max_tokens, 512);
        assert_eq!(config.default_model, "gpt-4");
        assert_eq!(config.stream_timeout, Duration::from_secs(5));
    }
}
