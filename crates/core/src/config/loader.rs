// Configuration file loading (TOML, YAML or JSON, chosen by extension)

use super::{Config, ConfigError};
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load a configuration file, or the defaults when no path is given.
    /// Sections and fields absent from the file keep their defaults.
    pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
        let Some(path) = path else {
            tracing::info!("No configuration file given, using defaults");
            return Ok(Config::default());
        };

        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }

        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(str::to_ascii_lowercase)
            .unwrap_or_default();

        let config = Self::parse(&content, &extension)?;
        tracing::debug!(path = %path.display(), "Loaded configuration file");
        Ok(config)
    }

    pub fn parse(content: &str, format: &str) -> Result<Config, ConfigError> {
        match format {
            "toml" => toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string())),
            "yaml" | "yml" => {
                // An empty YAML document is a null, not an empty mapping.
                if content.trim().is_empty() {
                    return Ok(Config::default());
                }
                serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
            }
            "json" => serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string())),
            other => Err(ConfigError::UnsupportedFormat(format!(".{}", other))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AuthType, LogFormat, TransportKind};
    use crate::forwarding::DirectiveValue;
    use std::io::Write;
    use std::time::Duration;

    fn write_config(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_load_defaults_without_path() {
        let config = ConfigLoader::load(None).unwrap();
        assert_eq!(config.server.transport, TransportKind::Stdio);
    }

    #[test]
    fn test_missing_file() {
        let err = ConfigLoader::load(Some(Path::new("/nonexistent/toolgate.yaml"))).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }

    #[test]
    fn test_unsupported_extension() {
        let file = write_config(".ini", "[server]\n");
        let err = ConfigLoader::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::UnsupportedFormat(ext) if ext == ".ini"));
    }

    #[test]
    fn test_load_yaml_merges_defaults() {
        let file = write_config(
            ".yaml",
            r#"
server:
  transport: http
  http:
    port: 9090
    session_timeout: 10m
    max_request_size: 2MB
openapi:
  spec_path: ./petstore.yaml
  base_url: https://api.example.com
  auth:
    type: bearer
    token: secret
    headers:
      - name: X-Api-Key
        valueFrom: request.headers['x-provider-data'].apikey
  headers:
    X-Client: toolgate
"#,
        );

        let config = ConfigLoader::load(Some(file.path())).unwrap();
        assert_eq!(config.server.transport, TransportKind::Http);
        assert_eq!(config.server.http.port, 9090);
        assert_eq!(config.server.http.host, "127.0.0.1");
        assert_eq!(config.server.http.session_timeout, Duration::from_secs(600));
        assert_eq!(config.server.http.max_request_size, 2 * 1024 * 1024);
        assert_eq!(config.server.http.max_sessions, 100);
        assert_eq!(config.openapi.timeout, Duration::from_secs(30));
        assert_eq!(config.openapi.auth.auth_type, AuthType::Bearer);
        assert!(matches!(
            config.openapi.auth.headers.directives()[0].value,
            DirectiveValue::Expression(_)
        ));
        assert_eq!(config.openapi.headers.directives()[0].name, "X-Client");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_toml() {
        let file = write_config(
            ".toml",
            r#"
[logging]
format = "pretty"

[openapi]
spec_path = "https://api.example.com/openapi.json"
timeout = "45s"

[[openapi.headers]]
name = "X-Tenant"
valueFrom = "request.query['tenant']"
"#,
        );

        let config = ConfigLoader::load(Some(file.path())).unwrap();
        assert_eq!(config.logging.format, LogFormat::Pretty);
        assert_eq!(config.openapi.timeout, Duration::from_secs(45));
        assert!(config.openapi.is_remote_spec());
        assert_eq!(config.openapi.headers.len(), 1);
    }

    #[test]
    fn test_load_json() {
        let file = write_config(
            ".json",
            r#"{"server": {"http": {"cors": {"enabled": false}}}, "openapi": {"spec_path": "a.json"}}"#,
        );
        let config = ConfigLoader::load(Some(file.path())).unwrap();
        assert!(!config.server.http.cors.enabled);
        assert_eq!(config.server.http.cors.origins.len(), 2);
    }

    #[test]
    fn test_malformed_auth_expression_still_loads() {
        let file = write_config(
            ".yaml",
            r#"
openapi:
  spec_path: ./petstore.yaml
  auth:
    headers:
      - name: X-Key
        valueFrom: request.headers['x
"#,
        );
        let config = ConfigLoader::load(Some(file.path())).unwrap();
        assert_eq!(
            config.openapi.auth.headers.directives()[0].value,
            DirectiveValue::Expression("request.headers['x".to_string())
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_conflicting_header_values_fail_load() {
        let file = write_config(
            ".yaml",
            "openapi:\n  headers:\n    - name: X-A\n      value: a\n      valueFrom: request.headers['a']\n",
        );
        let err = ConfigLoader::load(Some(file.path())).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(msg) if msg.contains("both")));
    }
}
