use crate::ConfigError;

/// Operator hint for which encoder family to prefer; the system probe may
/// still override this if the hinted hardware isn't actually present.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderHint {
    Hardware,
    Cpu,
}

impl EncoderHint {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw {
            "hardware" => Ok(Self::Hardware),
            "cpu" => Ok(Self::Cpu),
            other => Err(ConfigError::InvalidValue {
                var: "ENCODER",
                value: other.to_string(),
            }),
        }
    }
}

/// The environment-variable-driven configuration read once at startup
/// (spec.md's "CLI surface: None" — there is no flag parser, only env
/// vars).
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub base_url: String,
    pub bootstrap_token: String,
    pub hostname: String,
    pub encoder_hint: Option<EncoderHint>,
    pub debug_logging: bool,
}

impl EnvConfig {
    /// Reads the five recognized environment variables. `BASE_URL`,
    /// `token` and `HOSTNAME` are required; `ENCODER` and `NODE_ENV` are
    /// optional.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_reader(|key| std::env::var(key).ok())
    }

    /// Testable indirection over `std::env::var` so tests don't depend on
    /// process-global environment state.
    pub fn from_reader(get: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let base_url = required(&get, "BASE_URL")?;
        let bootstrap_token = required(&get, "token")?;
        let hostname = required(&get, "HOSTNAME")?;
        let encoder_hint = get("ENCODER")
            .map(|raw| EncoderHint::parse(&raw))
            .transpose()?;
        let debug_logging = get("NODE_ENV").map(|v| v != "production").unwrap_or(true);

        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            bootstrap_token,
            hostname,
            encoder_hint,
            debug_logging,
        })
    }
}

fn required(get: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<String, ConfigError> {
    get(var)
        .filter(|v| !v.is_empty())
        .ok_or(ConfigError::MissingVar { var })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn reads_required_and_optional_vars() {
        let cfg = EnvConfig::from_reader(env_from(&[
            ("BASE_URL", "https://control.example.com/"),
            ("token", "bootstrap-secret"),
            ("HOSTNAME", "runner-01"),
            ("ENCODER", "hardware"),
            ("NODE_ENV", "production"),
        ]))
        .unwrap();

        assert_eq!(cfg.base_url, "https://control.example.com");
        assert_eq!(cfg.bootstrap_token, "bootstrap-secret");
        assert_eq!(cfg.hostname, "runner-01");
        assert_eq!(cfg.encoder_hint, Some(EncoderHint::Hardware));
        assert!(!cfg.debug_logging);
    }

    #[test]
    fn missing_required_var_is_an_error() {
        let err = EnvConfig::from_reader(env_from(&[
            ("token", "x"),
            ("HOSTNAME", "h"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar { var: "BASE_URL" }));
    }

    #[test]
    fn missing_node_env_defaults_to_debug_logging() {
        let cfg = EnvConfig::from_reader(env_from(&[
            ("BASE_URL", "https://x"),
            ("token", "t"),
            ("HOSTNAME", "h"),
        ]))
        .unwrap();
        assert!(cfg.debug_logging);
    }

    #[test]
    fn invalid_encoder_hint_is_an_error() {
        let err = EnvConfig::from_reader(env_from(&[
            ("BASE_URL", "https://x"),
            ("token", "t"),
            ("HOSTNAME", "h"),
            ("ENCODER", "potato"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { var: "ENCODER", .. }));
    }
}
