use crate::err::ConfigErr;
use bollard::auth::DockerCredentials;
use serde::{Deserialize, Serialize};
use std::{
    net::{SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf},
    time::Duration,
};

/// Environment variable naming the directory shared with the docker daemon.
pub const SHARED_DATA_DIR_ENV: &str = "SHARED_DATA_DIR";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Registry credentials used for every image pull. When absent, the local
    /// docker client configuration is consulted instead.
    #[serde(alias = "DockerUsername")]
    pub docker_username: Option<String>,
    #[serde(alias = "DockerPassword")]
    pub docker_password: Option<String>,
    /// Directory containing the docker client's `config.json`, defaults to
    /// `$DOCKER_CONFIG` or `~/.docker`.
    pub docker_config_dir: Option<PathBuf>,

    /// Queue-read endpoint. Setting this selects poll mode.
    #[serde(alias = "MqReadServiceAddr")]
    pub mq_read_service_addr: Option<String>,
    /// Seconds without any job before a poller gives up. `0` means forever.
    #[serde(alias = "MaxIdleTime")]
    pub max_idle_time: u64,
    /// Delay between two polls that returned no job, in milliseconds.
    pub poll_interval_ms: u64,

    #[serde(alias = "ServerHost")]
    pub server_host: String,
    /// Admission listener port. Setting this (without a queue-read endpoint)
    /// selects push mode. `0` picks a free port.
    #[serde(alias = "ServerPort")]
    pub server_port: Option<u16>,
    pub queue_capacity: usize,
    /// Seconds the admission listener gets to finish in-flight requests.
    pub shutdown_grace_secs: u64,

    /// Where job volumes are created. Must be visible to the docker daemon
    /// under the same path.
    pub volume_root: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        ServiceConfig {
            docker_username: None,
            docker_password: None,
            docker_config_dir: None,
            mq_read_service_addr: None,
            max_idle_time: 0,
            poll_interval_ms: 1000,
            server_host: "0.0.0.0".into(),
            server_port: None,
            queue_capacity: 100,
            shutdown_grace_secs: 10,
            volume_root: None,
        }
    }
}

/// How jobs reach this service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceMode {
    /// Jobs are pushed to `POST /test` on this address.
    Push { listen: SocketAddr },
    /// Jobs are pulled from this endpoint.
    Poll { endpoint: String },
}

impl ServiceConfig {
    /// Read a config file. `.json` files are parsed as JSON, everything else
    /// as TOML.
    pub fn load(path: &Path) -> Result<ServiceConfig, ConfigErr> {
        let content = std::fs::read(path).map_err(|source| ConfigErr::Read {
            path: path.display().to_string(),
            source,
        })?;
        let is_json = path
            .extension()
            .map_or(false, |ext| ext.eq_ignore_ascii_case("json"));
        if is_json {
            Ok(serde_json::from_slice(&content)?)
        } else {
            Ok(toml::from_slice(&content)?)
        }
    }

    pub fn source_mode(&self) -> Result<SourceMode, ConfigErr> {
        if let Some(endpoint) = self.mq_read_service_addr.as_ref().filter(|x| !x.is_empty()) {
            return Ok(SourceMode::Poll {
                endpoint: with_scheme(endpoint),
            });
        }
        match self.server_port {
            Some(port) => {
                let host = self.server_host.as_str();
                let listen_err = |e| ConfigErr::ListenAddr(format!("{}:{}", host, port), e);
                let listen = (host, port)
                    .to_socket_addrs()
                    .map_err(listen_err)?
                    .next()
                    .ok_or_else(|| {
                        listen_err(std::io::Error::new(
                            std::io::ErrorKind::NotFound,
                            "host resolves to no address",
                        ))
                    })?;
                Ok(SourceMode::Push { listen })
            }
            None => Err(ConfigErr::NoJobSource),
        }
    }

    pub fn volume_root(&self) -> PathBuf {
        self.volume_root
            .clone()
            .or_else(|| std::env::var_os(SHARED_DATA_DIR_ENV).map(PathBuf::from))
            .unwrap_or_else(std::env::temp_dir)
    }

    pub fn docker_config_dir(&self) -> Option<PathBuf> {
        self.docker_config_dir
            .clone()
            .or_else(|| std::env::var_os("DOCKER_CONFIG").map(PathBuf::from))
            .or_else(|| dirs::home_dir().map(|home| home.join(".docker")))
    }

    /// Registry credentials given explicitly in the config file.
    pub fn credentials(&self) -> Option<DockerCredentials> {
        match (&self.docker_username, &self.docker_password) {
            (Some(username), Some(password)) if !username.is_empty() => Some(DockerCredentials {
                username: Some(username.clone()),
                password: Some(password.clone()),
                ..Default::default()
            }),
            _ => None,
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        if self.max_idle_time == 0 {
            None
        } else {
            Some(Duration::from_secs(self.max_idle_time))
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Prefix `http://` to addresses given as bare `host:port`.
pub fn with_scheme(addr: &str) -> String {
    if addr.contains("://") {
        addr.to_owned()
    } else {
        format!("http://{}", addr)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    #[test]
    fn test_load_camel_case_json_keys() {
        let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        write!(
            file,
            r#"{{"DockerUsername": "bot", "DockerPassword": "hunter2", "MqReadServiceAddr": "mq:8080/read", "MaxIdleTime": 600}}"#
        )
        .unwrap();

        let cfg = ServiceConfig::load(file.path()).unwrap();
        assert_eq!(cfg.docker_username.as_deref(), Some("bot"));
        assert_eq!(cfg.docker_password.as_deref(), Some("hunter2"));
        assert_eq!(
            cfg.credentials().and_then(|c| c.username).as_deref(),
            Some("bot")
        );
        assert_eq!(cfg.max_idle_time(), Some(Duration::from_secs(600)));
        assert_eq!(cfg.queue_capacity, 100);
        assert_eq!(
            cfg.source_mode().unwrap(),
            SourceMode::Poll {
                endpoint: "http://mq:8080/read".into()
            }
        );
    }

    #[test]
    fn test_load_toml_push_mode() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "server_host = \"127.0.0.1\"").unwrap();
        writeln!(file, "server_port = 10009").unwrap();
        writeln!(file, "queue_capacity = 3").unwrap();

        let cfg = ServiceConfig::load(file.path()).unwrap();
        assert_eq!(cfg.queue_capacity, 3);
        assert_eq!(cfg.max_idle_time(), None);
        assert!(cfg.credentials().is_none());
        assert_eq!(
            cfg.source_mode().unwrap(),
            SourceMode::Push {
                listen: "127.0.0.1:10009".parse().unwrap()
            }
        );
    }

    #[test]
    fn test_listen_host_names() {
        for host in ["localhost", "::1", "127.0.0.1"] {
            let cfg = ServiceConfig {
                server_host: host.into(),
                server_port: Some(10009),
                ..Default::default()
            };
            match cfg.source_mode().unwrap() {
                SourceMode::Push { listen } => {
                    assert!(listen.ip().is_loopback(), "{} resolved to {}", host, listen);
                    assert_eq!(listen.port(), 10009);
                }
                other => panic!("Expected push mode, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_missing_job_source() {
        let cfg = ServiceConfig::default();
        assert!(matches!(cfg.source_mode(), Err(ConfigErr::NoJobSource)));
    }

    #[test]
    fn test_missing_file() {
        let res = ServiceConfig::load(Path::new("/definitely/not/here.toml"));
        assert!(matches!(res, Err(ConfigErr::Read { .. })));
    }

    #[test]
    fn test_with_scheme() {
        assert_eq!(with_scheme("caller:80"), "http://caller:80");
        assert_eq!(with_scheme("https://caller"), "https://caller");
    }
}
