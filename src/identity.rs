//! Caller identity. The wire layer only ever asks "who is this login and what
//! secret proves it"; where the answer comes from stays behind
//! [`IdentityResolver`].

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use pgwire::api::auth::{AuthSource, LoginInfo, Password};
use pgwire::error::{ErrorInfo, PgWireError, PgWireResult};

use crate::observability;

/// A resolved caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user: String,
    pub secret: String,
}

#[derive(Debug, PartialEq, Eq)]
pub enum IdentityError {
    UnknownUser(String),
    MissingUser,
    /// Malformed `user:secret` list.
    BadEntry(String),
    /// A user list with no entries would refuse every login.
    NoUsers,
}

impl std::fmt::Display for IdentityError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IdentityError::UnknownUser(u) => write!(f, "unknown user: {u}"),
            IdentityError::MissingUser => write!(f, "no user name in startup message"),
            IdentityError::BadEntry(e) => write!(f, "bad user entry {e:?}, expected user:secret"),
            IdentityError::NoUsers => write!(f, "user list has no entries"),
        }
    }
}

impl std::error::Error for IdentityError {}

pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, user: &str) -> Result<Identity, IdentityError>;
}

/// Every user name shares one secret.
#[derive(Debug)]
pub struct SharedSecret {
    secret: String,
}

impl SharedSecret {
    pub fn new(secret: String) -> Self {
        Self { secret }
    }
}

impl IdentityResolver for SharedSecret {
    fn resolve(&self, user: &str) -> Result<Identity, IdentityError> {
        Ok(Identity {
            user: user.to_string(),
            secret: self.secret.clone(),
        })
    }
}

/// Fixed table of users, each with its own secret.
#[derive(Debug, Default)]
pub struct UserTable {
    users: HashMap<String, String>,
}

impl UserTable {
    /// Parse `alice:s3cret,bob:hunter2`. Whitespace around entries is ignored.
    pub fn parse(spec: &str) -> Result<Self, IdentityError> {
        let mut users = HashMap::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            match entry.split_once(':') {
                Some((user, secret)) if !user.is_empty() && !secret.is_empty() => {
                    users.insert(user.to_string(), secret.to_string());
                }
                _ => return Err(IdentityError::BadEntry(entry.to_string())),
            }
        }
        Ok(Self { users })
    }

    pub fn len(&self) -> usize {
        self.users.len()
    }

    pub fn is_empty(&self) -> bool {
        self.users.is_empty()
    }
}

impl IdentityResolver for UserTable {
    fn resolve(&self, user: &str) -> Result<Identity, IdentityError> {
        self.users
            .get(user)
            .map(|secret| Identity {
                user: user.to_string(),
                secret: secret.clone(),
            })
            .ok_or_else(|| IdentityError::UnknownUser(user.to_string()))
    }
}

/// Cleartext-password source for the pgwire startup handshake.
pub struct ResolverAuthSource {
    resolver: Arc<dyn IdentityResolver>,
}

impl std::fmt::Debug for ResolverAuthSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResolverAuthSource").finish_non_exhaustive()
    }
}

impl ResolverAuthSource {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { resolver }
    }
}

#[async_trait]
impl AuthSource for ResolverAuthSource {
    async fn get_password(&self, login: &LoginInfo) -> PgWireResult<Password> {
        let user = login.user().map(|u| u.to_string()).unwrap_or_default();
        let resolved = if user.is_empty() {
            Err(IdentityError::MissingUser)
        } else {
            self.resolver.resolve(&user)
        };
        match resolved {
            Ok(identity) => Ok(Password::new(None, identity.secret.into_bytes())),
            Err(e) => {
                metrics::counter!(observability::AUTH_FAILURES_TOTAL).increment(1);
                tracing::warn!("authentication refused: {e}");
                Err(PgWireError::UserError(Box::new(ErrorInfo::new(
                    "FATAL".into(),
                    "28P01".into(),
                    format!("password authentication failed for user \"{user}\""),
                ))))
            }
        }
    }
}
