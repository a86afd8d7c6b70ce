//! Connection configuration and connection string parsing
//!
//! Connection strings have the form:
//! - `host:port/database`
//! - `host/database`
//! - `//host:port/database` (leading slashes are ignored)

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::agent::AgentSettings;
use crate::constants::secmec;
use crate::error::{Error, Result};
use crate::trace::mask;

/// Default DRDA port
pub const DEFAULT_PORT: u16 = 1527;

/// Default locale passed to the message formatting procedure
pub const DEFAULT_LOCALE: &str = "en_US";

/// How credentials are presented to the server
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMechanism {
    /// Clear-text user id and password (`USRIDPWD`)
    UserIdPassword,
    /// User id only (`USRIDONL`)
    UserIdOnly,
    /// User id with a DES-encrypted password (`USRENCPWD`)
    EncryptedPassword,
    /// User id with a strong password substitute (`USRSSBPWD`)
    StrongPasswordSubstitute,
    /// DES-encrypted user id and password (`EUSRIDPWD`)
    EncryptedUserIdPassword,
}

impl SecurityMechanism {
    /// DRDA SECMEC code
    pub fn code(self) -> u16 {
        match self {
            SecurityMechanism::UserIdPassword => secmec::USRIDPWD,
            SecurityMechanism::UserIdOnly => secmec::USRIDONL,
            SecurityMechanism::EncryptedPassword => secmec::USRENCPWD,
            SecurityMechanism::StrongPasswordSubstitute => secmec::USRSSBPWD,
            SecurityMechanism::EncryptedUserIdPassword => secmec::EUSRIDPWD,
        }
    }

    /// Mechanism for a SECMEC code
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            secmec::USRIDPWD => Some(SecurityMechanism::UserIdPassword),
            secmec::USRIDONL => Some(SecurityMechanism::UserIdOnly),
            secmec::USRENCPWD => Some(SecurityMechanism::EncryptedPassword),
            secmec::USRSSBPWD => Some(SecurityMechanism::StrongPasswordSubstitute),
            secmec::EUSRIDPWD => Some(SecurityMechanism::EncryptedUserIdPassword),
            _ => None,
        }
    }

    /// Whether the mechanism needs a Diffie-Hellman exchange
    pub fn uses_encryption(self) -> bool {
        matches!(
            self,
            SecurityMechanism::EncryptedPassword | SecurityMechanism::EncryptedUserIdPassword
        )
    }
}

/// Connection configuration
///
/// # Examples
///
/// ```rust
/// use drda_client::{Config, SecurityMechanism};
/// use std::time::Duration;
///
/// let config = Config::new("localhost", 1527, "sample", "app", "secret")
///     .security_mechanism(SecurityMechanism::EncryptedUserIdPassword)
///     .connect_timeout(Duration::from_secs(5))
///     .retrieve_message_text(false);
/// assert_eq!(config.to_string(), "localhost:1527/sample");
/// ```
#[derive(Clone)]
pub struct Config {
    /// Host to connect to
    pub host: String,
    /// Port to connect to
    pub port: u16,
    /// Relational database name
    pub database: String,
    /// User id
    pub username: String,
    /// Password (never printed)
    password: String,
    /// Security mechanism; derived from the password when unset
    pub security_mechanism: Option<SecurityMechanism>,
    /// Ask the server to format diagnostic messages
    pub retrieve_message_text: bool,
    /// Locale for formatted messages
    pub locale: String,
    /// Connection timeout
    pub connect_timeout: Duration,
}

impl Config {
    /// Create a new configuration
    pub fn new(
        host: impl Into<String>,
        port: u16,
        database: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            database: database.into(),
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    /// Set the security mechanism
    pub fn security_mechanism(mut self, mechanism: SecurityMechanism) -> Self {
        self.security_mechanism = Some(mechanism);
        self
    }

    /// Enable or disable server-side message formatting
    pub fn retrieve_message_text(mut self, retrieve: bool) -> Self {
        self.retrieve_message_text = retrieve;
        self
    }

    /// Set the message locale
    pub fn locale(mut self, locale: impl Into<String>) -> Self {
        self.locale = locale.into();
        self
    }

    /// Set connection timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Get the password (for authentication)
    pub(crate) fn password(&self) -> &str {
        &self.password
    }

    /// Set the password
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    /// Set the username
    pub fn set_username(&mut self, username: impl Into<String>) {
        self.username = username.into();
    }

    /// Mechanism that will be used to authenticate
    ///
    /// Without an explicit choice, a password selects clear-text user id
    /// and password, and no password selects user id only.
    pub fn effective_security_mechanism(&self) -> SecurityMechanism {
        self.security_mechanism.unwrap_or(if self.password.is_empty() {
            SecurityMechanism::UserIdOnly
        } else {
            SecurityMechanism::UserIdPassword
        })
    }

    pub(crate) fn agent_settings(&self) -> AgentSettings {
        AgentSettings {
            retrieve_message_text: self.retrieve_message_text,
            locale: self.locale.clone(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: DEFAULT_PORT,
            database: String::new(),
            username: String::new(),
            password: String::new(),
            security_mechanism: None,
            retrieve_message_text: true,
            locale: DEFAULT_LOCALE.to_string(),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &mask(&self.password))
            .field("security_mechanism", &self.security_mechanism)
            .field("retrieve_message_text", &self.retrieve_message_text)
            .field("locale", &self.locale)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Parse a `[//]host[:port]/database` connection string
impl FromStr for Config {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().trim_start_matches('/');
        if s.is_empty() {
            return Err(Error::InvalidConnectionString(
                "empty connection string".to_string(),
            ));
        }

        let (host_port, database) = s.split_once('/').ok_or_else(|| {
            Error::InvalidConnectionString("missing database name after /".to_string())
        })?;
        if database.is_empty() {
            return Err(Error::InvalidConnectionString(
                "missing database name after /".to_string(),
            ));
        }

        let mut config = Config {
            database: database.to_string(),
            ..Config::default()
        };
        match host_port.split_once(':') {
            Some((host, port)) => {
                config.host = host.to_string();
                config.port = port
                    .parse()
                    .map_err(|_| Error::InvalidConnectionString("invalid port number".to_string()))?;
            }
            None => config.host = host_port.to_string(),
        }

        if config.host.is_empty() {
            return Err(Error::InvalidConnectionString("missing host".to_string()));
        }
        Ok(config)
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.database)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full() {
        let config: Config = "dbhost:1600/sample".parse().unwrap();
        assert_eq!(config.host, "dbhost");
        assert_eq!(config.port, 1600);
        assert_eq!(config.database, "sample");
    }

    #[test]
    fn test_parse_default_port() {
        let config: Config = "//dbhost/sample".parse().unwrap();
        assert_eq!(config.host, "dbhost");
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_parse_errors() {
        for bad in ["", "dbhost", "dbhost:1527/", ":1527/db", "dbhost:port/db"] {
            let result: Result<Config> = bad.parse();
            assert!(
                matches!(result, Err(Error::InvalidConnectionString(_))),
                "{:?} should fail",
                bad
            );
        }
    }

    #[test]
    fn test_debug_hides_password() {
        let config = Config::new("h", 1527, "db", "app", "hunter2");
        let debug = format!("{:?}", config);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("*******"));
        assert_eq!(config.to_string(), "h:1527/db");
    }

    #[test]
    fn test_effective_mechanism() {
        let mut config = Config::new("h", 1527, "db", "app", "");
        assert_eq!(
            config.effective_security_mechanism(),
            SecurityMechanism::UserIdOnly
        );
        config.set_password("pw");
        assert_eq!(
            config.effective_security_mechanism(),
            SecurityMechanism::UserIdPassword
        );
        let config = config.security_mechanism(SecurityMechanism::StrongPasswordSubstitute);
        assert_eq!(config.effective_security_mechanism().code(), 8);
        assert_eq!(
            SecurityMechanism::from_code(9),
            Some(SecurityMechanism::EncryptedUserIdPassword)
        );
        assert!(SecurityMechanism::EncryptedPassword.uses_encryption());
    }
}
