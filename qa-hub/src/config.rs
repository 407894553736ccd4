use serde::Deserialize;
use sonar_ingest::config::Config as SonarIngestConfig;
use std::fs::File;
use std::path::Path;

#[derive(Deserialize, Debug, PartialEq)]
pub struct MetricsConfig {
    pub statsd_host: String,
    pub statsd_port: u16,
}

#[derive(Deserialize, Debug, PartialEq)]
pub struct LoggingConfig {
    pub sentry_dsn: String,
}

#[derive(Deserialize, Debug, Default)]
pub struct CommonConfig {
    pub metrics: Option<MetricsConfig>,
    pub logging: Option<LoggingConfig>,
}

#[derive(Deserialize, Debug)]
pub struct Config {
    #[serde(flatten)]
    pub common: CommonConfig,
    pub sonar_ingest: Option<SonarIngestConfig>,
}

impl Config {
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let file = File::open(path)?;
        let data = serde_yaml::from_reader(file)?;

        Ok(data)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("could not load config from file: {0}")]
    LoadError(#[from] std::io::Error),
    #[error("could not parse config: {0}")]
    ParseError(#[from] serde_yaml::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use sonar_ingest::config::ScanStoreConfig;
    use std::io::Write;

    fn write_tmp_file(s: &str) -> tempfile::NamedTempFile {
        let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
        write!(tmp, "{}", s).expect("write yaml");

        tmp
    }

    #[test]
    fn sonar_ingest_config() {
        let yaml = r#"
            metrics:
                statsd_host: 127.0.0.1
                statsd_port: 8125
            logging:
                sentry_dsn: "https://key@sentry.example.com/1"
            sonar_ingest:
                listener:
                    host: 0.0.0.0
                    port: 8080
                admin_listener:
                    host: 127.0.0.1
                    port: 8081
                store:
                    type: filesystem
                    path: /var/lib/qa-hub/scans.json
                tickets:
                    type: http
                    url: "http://tickets.internal:9000"
                test_records:
                    type: memory
                collector:
                    type: memory
                directory:
                    type: memory
                credential:
                    cluster_name: dev
                    addr: sonar:9000
                    public_url: "https://sonar.example.com"
                    admin_token: secret
            "#;
        let tmp = write_tmp_file(yaml);
        let config = Config::from_file(tmp.path()).expect("load config");

        assert_eq!(
            config.common.metrics,
            Some(MetricsConfig {
                statsd_host: "127.0.0.1".into(),
                statsd_port: 8125,
            })
        );
        assert!(config.common.logging.is_some());

        let sonar = config.sonar_ingest.expect("sonar_ingest config");
        assert_eq!(sonar.listener.port, 8080);
        assert_eq!(
            sonar.store,
            ScanStoreConfig::Filesystem {
                path: "/var/lib/qa-hub/scans.json".into()
            }
        );
        assert!(sonar.validate().is_ok());
    }

    #[test]
    fn common_sections_are_optional() {
        let tmp = write_tmp_file("sonar_ingest: null\n");
        let config = Config::from_file(tmp.path()).expect("load config");
        assert!(config.common.metrics.is_none());
        assert!(config.common.logging.is_none());
        assert!(config.sonar_ingest.is_none());
    }

    #[test]
    fn missing_file_is_a_load_error() {
        let dir = tempfile::tempdir().expect("create temp dir");
        assert!(matches!(
            Config::from_file(&dir.path().join("absent.yaml")),
            Err(ConfigError::LoadError(_))
        ));
    }
}
