//! Configuration loading

use crate::{ConfigFormat, ServiceConfig};
use once_cell::sync::Lazy;
use regex::Regex;
use std::env;
use std::fs;
use std::path::Path;
use superservice_core::{Error, Result};

static ENV_VAR: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(:-([^}]*))?\}").expect("env var pattern compiles")
});

/// Load configuration from a file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<ServiceConfig> {
    let path = path.as_ref();

    let content = fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

    let format = ConfigFormat::from_path(path)?;

    load_from_str(&content, format)
}

/// Expand environment variables in configuration string
/// Supports syntax: ${VAR} and ${VAR:-default}
fn expand_env_vars(content: &str) -> Result<String> {
    let mut result = String::with_capacity(content.len());
    let mut last_match = 0;

    for cap in ENV_VAR.captures_iter(content) {
        let (Some(full_match), Some(var_name)) = (cap.get(0), cap.get(1)) else {
            continue;
        };
        let var_name = var_name.as_str();
        let default_value = cap.get(3).map(|m| m.as_str());

        let value = match env::var(var_name) {
            Ok(val) => val,
            Err(_) => match default_value {
                Some(default) => default.to_string(),
                None => {
                    return Err(Error::Config(format!(
                        "Environment variable '{var_name}' not set and no default provided"
                    )));
                }
            },
        };

        result.push_str(&content[last_match..full_match.start()]);
        result.push_str(&value);
        last_match = full_match.end();
    }

    result.push_str(&content[last_match..]);

    Ok(result)
}

/// Load configuration from a string
pub fn load_from_str(content: &str, format: ConfigFormat) -> Result<ServiceConfig> {
    let expanded_content = expand_env_vars(content)?;

    let config = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse YAML: {e}")))?,
        ConfigFormat::Toml => toml::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse TOML: {e}")))?,
        ConfigFormat::Json => serde_json::from_str(&expanded_content)
            .map_err(|e| Error::Config(format!("Failed to parse JSON: {e}")))?,
    };

    Ok(config)
}

/// Load and validate configuration
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<ServiceConfig> {
    let config = load_from_file(path)?;
    crate::validator::validate_config(&config)?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::time::Duration;

    const YAML_CONFIG: &str = r#"
service:
  name: "orders:blue"
  port: 9000

registry:
  enabled: true
  address: "10.0.0.2:8500"
  timeout: "3s"

runtime:
  grace_period: "2s"
  pprof: true
  debug_ui: true

gateway:
  incoming_headers:
    x-user-id: user-id

log:
  level: "debug"
  format: "json"
"#;

    #[test]
    fn test_load_yaml() {
        let config = load_from_str(YAML_CONFIG, ConfigFormat::Yaml).unwrap();

        assert_eq!(config.service.name, "orders:blue");
        assert_eq!(config.service.port, 9000);
        assert!(config.registry.enabled);
        assert_eq!(config.registry.address, "10.0.0.2:8500");
        assert_eq!(config.registry.timeout, Duration::from_secs(3));
        assert_eq!(config.runtime.grace_period, Duration::from_secs(2));
        assert!(config.runtime.http_cors);
        assert!(config.runtime.pprof);
        assert_eq!(
            config.gateway.incoming_headers.get("x-user-id").map(String::as_str),
            Some("user-id")
        );
        assert_eq!(config.log.format, crate::LogFormat::Json);
    }

    #[test]
    fn test_load_toml() {
        let toml = r#"
[service]
name = "billing"
port = 7000

[runtime]
grace_period = "1s"
http_cors = false
"#;
        let config = load_from_str(toml, ConfigFormat::Toml).unwrap();
        assert_eq!(config.service.name, "billing");
        assert!(!config.runtime.http_cors);
        assert_eq!(config.runtime.grace_period, Duration::from_secs(1));
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = load_from_str("{}", ConfigFormat::Json).unwrap();
        assert_eq!(config, ServiceConfig::default());
    }

    #[test]
    fn test_invalid_yaml() {
        let result = load_from_str("service: [yaml", ConfigFormat::Yaml);
        assert!(result.is_err());
    }

    #[test]
    fn test_env_var_with_default() {
        env::remove_var("SUPERSERVICE_UNDEFINED_NAME");

        let config = load_from_str(
            "service:\n  name: \"${SUPERSERVICE_UNDEFINED_NAME:-fallback}\"\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.service.name, "fallback");
    }

    #[test]
    fn test_mixed_references_expand_in_place() {
        env::set_var("SUPERSERVICE_TEST_HOST", "consul.internal");
        env::remove_var("SUPERSERVICE_TEST_PORT");

        let content = "address: ${SUPERSERVICE_TEST_HOST}:${SUPERSERVICE_TEST_PORT:-8500}, $HOME, ${}";
        let expanded = expand_env_vars(content).unwrap();
        assert_eq!(expanded, "address: consul.internal:8500, $HOME, ${}");
        assert_eq!(expand_env_vars(content).unwrap(), expanded);
        assert_eq!(expand_env_vars("plain").unwrap(), "plain");

        env::remove_var("SUPERSERVICE_TEST_HOST");
    }

    #[test]
    fn test_env_var_substitution() {
        env::set_var("SUPERSERVICE_TEST_REGISTRY", "consul.internal:8500");

        let config = load_from_str(
            "registry:\n  address: \"${SUPERSERVICE_TEST_REGISTRY}\"\n",
            ConfigFormat::Yaml,
        )
        .unwrap();
        assert_eq!(config.registry.address, "consul.internal:8500");

        env::remove_var("SUPERSERVICE_TEST_REGISTRY");
    }

    #[test]
    fn test_missing_env_var_no_default() {
        env::remove_var("SUPERSERVICE_MISSING_VAR");

        let result = load_from_str(
            "service:\n  name: \"${SUPERSERVICE_MISSING_VAR}\"\n",
            ConfigFormat::Yaml,
        );
        assert!(result
            .unwrap_err()
            .to_string()
            .contains("SUPERSERVICE_MISSING_VAR"));
    }

    #[test]
    fn test_load_config_from_file_validates() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "service:\n  name: \"bad_name\"").unwrap();

        let result = load_config(file.path());
        assert!(result.is_err());

        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(file, "service:\n  name: \"good-name:canary\"").unwrap();
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.service.name, "good-name:canary");
    }
}
