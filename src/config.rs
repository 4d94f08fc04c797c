use std::fs::File;
use std::io::{self, BufReader, ErrorKind};
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use pgwire::tokio::TlsAcceptor;
use pgwire::tokio::tokio_rustls::rustls::ServerConfig;

use crate::identity::{IdentityError, IdentityResolver, SharedSecret, UserTable};
use crate::model::OccupancyPolicy;

/// Server settings, read from `STAYBNB_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bind: String,
    pub data_dir: PathBuf,
    pub password: String,
    /// `user:secret,...`; when set, only these users may log in.
    pub users: Option<String>,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls: Option<TlsPaths>,
    pub policy: OccupancyPolicy,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
}

#[derive(Debug)]
pub enum ConfigError {
    Invalid { var: &'static str, value: String },
    TlsPair,
    Users(IdentityError),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { var, value } => write!(f, "invalid value for {var}: {value:?}"),
            ConfigError::TlsPair => {
                write!(f, "both STAYBNB_TLS_CERT and STAYBNB_TLS_KEY must be set, or neither")
            }
            ConfigError::Users(e) => write!(f, "STAYBNB_USERS: {e}"),
        }
    }
}

impl std::error::Error for ConfigError {}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Build from any variable source. Unset variables take their defaults;
    /// set but unparseable ones are errors.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = OccupancyPolicy::default();
        let tls = match (lookup("STAYBNB_TLS_CERT"), lookup("STAYBNB_TLS_KEY")) {
            (None, None) => None,
            (Some(cert), Some(key)) => Some(TlsPaths {
                cert: cert.into(),
                key: key.into(),
            }),
            _ => return Err(ConfigError::TlsPair),
        };

        Ok(Self {
            port: parsed(&lookup, "STAYBNB_PORT")?.unwrap_or(5433),
            bind: lookup("STAYBNB_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            data_dir: lookup("STAYBNB_DATA_DIR").unwrap_or_else(|| "./data".into()).into(),
            password: lookup("STAYBNB_PASSWORD").unwrap_or_else(|| "staybnb".into()),
            users: lookup("STAYBNB_USERS").filter(|u| !u.trim().is_empty()),
            max_connections: parsed(&lookup, "STAYBNB_MAX_CONNECTIONS")?.unwrap_or(256),
            compact_threshold: parsed(&lookup, "STAYBNB_COMPACT_THRESHOLD")?.unwrap_or(1000),
            metrics_port: parsed(&lookup, "STAYBNB_METRICS_PORT")?,
            tls,
            policy: OccupancyPolicy {
                pending_blocks: flag(&lookup, "STAYBNB_PENDING_BLOCKS")?
                    .unwrap_or(defaults.pending_blocks),
                checkout_day_blocked: flag(&lookup, "STAYBNB_CHECKOUT_DAY_BLOCKED")?
                    .unwrap_or(defaults.checkout_day_blocked),
            },
        })
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("staybnb.wal")
    }

    pub fn identity(&self) -> Result<Arc<dyn IdentityResolver>, ConfigError> {
        match &self.users {
            Some(users) => {
                let table = UserTable::parse(users).map_err(ConfigError::Users)?;
                if table.is_empty() {
                    return Err(ConfigError::Users(IdentityError::NoUsers));
                }
                tracing::info!("{} users configured", table.len());
                Ok(Arc::new(table))
            }
            None => Ok(Arc::new(SharedSecret::new(self.password.clone()))),
        }
    }

    pub fn tls_acceptor(&self) -> io::Result<Option<TlsAcceptor>> {
        self.tls.as_ref().map(TlsPaths::acceptor).transpose()
    }
}

impl TlsPaths {
    pub fn acceptor(&self) -> io::Result<TlsAcceptor> {
        let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(File::open(&self.cert)?))
            .collect::<Result<_, _>>()?;

        let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(&self.key)?))?
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "no private key found in key file"))?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| io::Error::new(ErrorKind::InvalidInput, e))?;

        config.alpn_protocols = vec![b"postgresql".to_vec()];

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

fn parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(var)
        .map(|value| {
            value
                .trim()
                .parse()
                .map_err(|_| ConfigError::Invalid { var, value })
        })
        .transpose()
}

fn flag(lookup: &impl Fn(&str) -> Option<String>, var: &'static str) -> Result<Option<bool>, ConfigError> {
    lookup(var)
        .map(|value| match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { var, value }),
        })
        .transpose()
}
