use axum::http::HeaderValue;
use secrecy::Secret;
use service_core::config as core_config;
use service_core::error::AppError;
use std::env;
use std::path::Path;
use std::time::Duration;

use crate::services::providers::gemini::GEMINI_API_BASE;

/// Persona attached to streaming requests unless `RELAY_PERSONA_PATH` points elsewhere.
pub const DEFAULT_PERSONA: &str = include_str!("../../persona/academic_tutor.txt");

const DEFAULT_TEXT_MODEL: &str = "gemini-2.0-flash";
const DEFAULT_UPSTREAM_TIMEOUT_SECS: u64 = 60;
const DEFAULT_UPSTREAM_IDLE_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub common: core_config::Config,
    pub google: GoogleConfig,
    pub models: ModelConfig,
    pub upstream: UpstreamConfig,
    pub persona: PersonaConfig,
    pub http: HttpConfig,
}

#[derive(Debug, Clone)]
pub struct GoogleConfig {
    pub api_key: Secret<String>,
    pub api_base: String,
}

#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Model used by every route (e.g., gemini-2.0-flash)
    pub text_model: String,
}

#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    pub request_timeout: Duration,
    pub idle_timeout: Duration,
}

/// Opaque system instruction for the streaming route. Never parsed by the relay.
#[derive(Debug, Clone)]
pub struct PersonaConfig {
    pub system_instruction: String,
}

impl Default for PersonaConfig {
    fn default() -> Self {
        Self {
            system_instruction: DEFAULT_PERSONA.trim().to_string(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HttpConfig {
    /// Single allowed cross-origin caller; any origin when unset.
    pub cors_origin: Option<String>,
    /// Mount the `/api/chat-stream/pending` diagnostics route.
    pub diagnostics_routes: bool,
}

impl RelayConfig {
    pub fn load() -> Result<Self, AppError> {
        let common_config = core_config::Config::load()?;
        Self::from_lookup(common_config, |key| env::var(key).ok())
    }

    /// Build the relay settings from any key lookup (the process environment in production).
    pub fn from_lookup<F>(common: core_config::Config, lookup: F) -> Result<Self, AppError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let is_prod = lookup("ENVIRONMENT").unwrap_or_else(|| "dev".to_string()) == "prod";
        let get = |key: &str, default: Option<&str>| get_env(&lookup, key, default, is_prod);

        let api_key = get("GEMINI_API_KEY", None)?;
        if api_key.trim().is_empty() {
            return Err(config_error("GEMINI_API_KEY is set but empty"));
        }

        let cors_origin = lookup("CORS_ORIGIN").filter(|o| !o.trim().is_empty());
        if let Some(origin) = &cors_origin {
            HeaderValue::from_str(origin).map_err(|e| {
                config_error(format!("CORS_ORIGIN '{}' is not a valid origin: {}", origin, e))
            })?;
        }

        let persona = match lookup("RELAY_PERSONA_PATH") {
            Some(path) => PersonaConfig::from_file(Path::new(&path))?,
            None => PersonaConfig::default(),
        };

        Ok(RelayConfig {
            common,
            google: GoogleConfig {
                api_key: Secret::new(api_key),
                api_base: get("GEMINI_API_BASE", Some(GEMINI_API_BASE))?,
            },
            models: ModelConfig {
                text_model: get("GEMINI_MODEL", Some(DEFAULT_TEXT_MODEL))?,
            },
            upstream: UpstreamConfig {
                request_timeout: parse_secs(
                    "RELAY_UPSTREAM_TIMEOUT_SECS",
                    &get(
                        "RELAY_UPSTREAM_TIMEOUT_SECS",
                        Some(&DEFAULT_UPSTREAM_TIMEOUT_SECS.to_string()),
                    )?,
                )?,
                idle_timeout: parse_secs(
                    "RELAY_UPSTREAM_IDLE_TIMEOUT_SECS",
                    &get(
                        "RELAY_UPSTREAM_IDLE_TIMEOUT_SECS",
                        Some(&DEFAULT_UPSTREAM_IDLE_TIMEOUT_SECS.to_string()),
                    )?,
                )?,
            },
            persona,
            http: HttpConfig {
                cors_origin,
                diagnostics_routes: lookup("RELAY_DIAGNOSTICS_ROUTES")
                    .map(|v| parse_flag(&v))
                    .unwrap_or(false),
            },
        })
    }
}

impl PersonaConfig {
    pub fn from_file(path: &Path) -> Result<Self, AppError> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            config_error(format!(
                "Failed to read persona file {}: {}",
                path.display(),
                e
            ))
        })?;

        let text = text.trim();
        if text.is_empty() {
            return Err(config_error(format!(
                "Persona file {} is empty",
                path.display()
            )));
        }

        Ok(Self {
            system_instruction: text.to_string(),
        })
    }
}

fn config_error(message: impl std::fmt::Display) -> AppError {
    AppError::ConfigError(anyhow::anyhow!("{}", message))
}

fn parse_secs(key: &str, value: &str) -> Result<Duration, AppError> {
    match value.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(config_error(format!(
            "{} must be a positive number of seconds, got '{}'",
            key, value
        ))),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn get_env<F>(lookup: &F, key: &str, default: Option<&str>, is_prod: bool) -> Result<String, AppError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(val) => Ok(val),
        None => {
            if is_prod {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required in production but not set",
                    key
                )))
            } else if let Some(def) = default {
                Ok(def.to_string())
            } else {
                Err(AppError::ConfigError(anyhow::anyhow!(
                    "{} is required but not set",
                    key
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<RelayConfig, AppError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        RelayConfig::from_lookup(core_config::Config::default(), |key| vars.get(key).cloned())
    }

    #[test]
    fn missing_api_key_is_a_configuration_error() {
        let err = load(&[]).unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
        assert!(err.to_string().contains("GEMINI_API_KEY"));
    }

    #[test]
    fn empty_api_key_is_rejected() {
        assert!(matches!(
            load(&[("GEMINI_API_KEY", "  ")]),
            Err(AppError::ConfigError(_))
        ));
    }

    #[test]
    fn defaults_apply_in_dev() {
        let config = load(&[("GEMINI_API_KEY", "k")]).unwrap();
        assert_eq!(config.models.text_model, "gemini-2.0-flash");
        assert_eq!(config.google.api_base, GEMINI_API_BASE);
        assert_eq!(config.upstream.request_timeout, Duration::from_secs(60));
        assert_eq!(config.upstream.idle_timeout, Duration::from_secs(30));
        assert!(config.http.cors_origin.is_none());
        assert!(!config.http.diagnostics_routes);
        assert!(config.persona.system_instruction.contains("academic"));
        assert_eq!(config.google.api_key.expose_secret(), "k");
    }

    #[test]
    fn prod_requires_explicit_values() {
        let err = load(&[("GEMINI_API_KEY", "k"), ("ENVIRONMENT", "prod")]).unwrap_err();
        assert!(err.to_string().contains("required in production"));
    }

    #[test]
    fn reads_overrides() {
        let config = load(&[
            ("GEMINI_API_KEY", "k"),
            ("GEMINI_MODEL", "gemini-1.5-pro"),
            ("CORS_ORIGIN", "http://localhost:5173"),
            ("RELAY_UPSTREAM_TIMEOUT_SECS", "5"),
            ("RELAY_DIAGNOSTICS_ROUTES", "true"),
        ])
        .unwrap();

        assert_eq!(config.models.text_model, "gemini-1.5-pro");
        assert_eq!(
            config.http.cors_origin.as_deref(),
            Some("http://localhost:5173")
        );
        assert_eq!(config.upstream.request_timeout, Duration::from_secs(5));
        assert!(config.http.diagnostics_routes);
    }

    #[test]
    fn rejects_bad_timeout() {
        for value in ["0", "soon"] {
            let err = load(&[("GEMINI_API_KEY", "k"), ("RELAY_UPSTREAM_IDLE_TIMEOUT_SECS", value)])
                .unwrap_err();
            assert!(matches!(err, AppError::ConfigError(_)));
        }
    }

    #[test]
    fn accepts_wildcard_cors_origin() {
        let config = load(&[("GEMINI_API_KEY", "k"), ("CORS_ORIGIN", "*")]).unwrap();
        assert_eq!(config.http.cors_origin.as_deref(), Some("*"));
    }

    #[test]
    fn rejects_invalid_cors_origin() {
        let err = load(&[("GEMINI_API_KEY", "k"), ("CORS_ORIGIN", "http://bad\norigin")]).unwrap_err();
        assert!(err.to_string().contains("CORS_ORIGIN"));
    }

    #[test]
    fn unreadable_persona_file_is_fatal() {
        let err = load(&[
            ("GEMINI_API_KEY", "k"),
            ("RELAY_PERSONA_PATH", "/nonexistent/persona.txt"),
        ])
        .unwrap_err();
        assert!(matches!(err, AppError::ConfigError(_)));
    }

    #[test]
    fn persona_file_overrides_default() {
        let path = std::env::temp_dir().join(format!("persona-{}.txt", std::process::id()));
        std::fs::write(&path, "  You are a chemistry tutor.\n").unwrap();

        let config = load(&[
            ("GEMINI_API_KEY", "k"),
            ("RELAY_PERSONA_PATH", path.to_str().unwrap()),
        ])
        .unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!(config.persona.system_instruction, "You are a chemistry tutor.");
    }

    #[test]
    fn flag_parsing() {
        assert!(parse_flag("TRUE"));
        assert!(parse_flag("1"));
        assert!(!parse_flag("false"));
        assert!(!parse_flag("nope"));
    }
}
