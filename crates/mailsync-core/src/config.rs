//! Account configuration

use std::path::Path;
use std::time::Duration;

use mailsync_imap::{Security, ServerEndpoint};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::special_use::SpecialUseMap;

/// IMAP protocol variant
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Plain IMAP, upgraded with STARTTLS when enabled
    Imap,
    /// IMAP over implicit TLS
    Imaps,
}

/// How to reach one account
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionProperties {
    pub protocol: Protocol,
    pub host: String,
    pub port: u16,
    /// Usually the email address; selects provider defaults by domain
    pub account_identity: String,
    pub login: String,
    /// Ciphertext, decrypted at connect time
    pub encrypted_secret: String,
}

impl std::fmt::Debug for ConnectionProperties {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionProperties")
            .field("protocol", &self.protocol)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("account_identity", &self.account_identity)
            .field("login", &self.login)
            .finish_non_exhaustive()
    }
}

impl ConnectionProperties {
    /// Domain part of the account identity, lowercased
    pub fn domain(&self) -> Option<String> {
        self.account_identity
            .rsplit_once('@')
            .map(|(_, domain)| domain.to_lowercase())
    }

    /// Transport endpoint with the trust/STARTTLS options applied
    pub fn endpoint(&self, config: &SyncConfig) -> ServerEndpoint {
        let security = match self.protocol {
            Protocol::Imaps => Security::Tls,
            Protocol::Imap if config.opportunistic_starttls => Security::StartTls,
            Protocol::Imap => Security::Plain,
        };

        ServerEndpoint {
            host: self.host.clone(),
            port: self.port,
            security,
            accept_invalid_certs: config.trust_all_certificates,
        }
    }
}

mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_secs)
    }
}

/// Watch and connection tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    /// Poll period for folders whose server cannot IDLE
    #[serde(with = "secs")]
    pub check_frequency_if_idle_not_supported: Duration,
    /// IDLE is re-issued after this long without news
    #[serde(with = "secs")]
    pub idle_keepalive: Duration,
    /// Accept any server certificate
    pub trust_all_certificates: bool,
    /// Upgrade plain IMAP connections with STARTTLS when offered
    pub opportunistic_starttls: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            check_frequency_if_idle_not_supported: Duration::from_secs(15),
            idle_keepalive: Duration::from_secs(28 * 60),
            trust_all_certificates: true,
            opportunistic_starttls: true,
        }
    }
}

/// Everything needed to run one account
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountConfig {
    pub connection: ConnectionProperties,
    #[serde(default)]
    pub sync: SyncConfig,
    /// Special-use role → folder path, winning over provider defaults
    #[serde(default)]
    pub overrides: SpecialUseMap,
}

impl AccountConfig {
    pub fn from_json(json: &str) -> CoreResult<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn load(path: impl AsRef<Path>) -> CoreResult<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mailsync_imap::SpecialUse;

    const CONFIG: &str = r#"{
        "connection": {
            "protocol": "imap",
            "host": "mail.example.com",
            "port": 143,
            "accountIdentity": "Jane@Example.COM",
            "login": "jane",
            "encryptedSecret": "c2VjcmV0"
        },
        "sync": { "checkFrequencyIfIdleNotSupported": 30 },
        "overrides": { "TRASH": "Deleted Items" }
    }"#;

    #[test]
    fn test_parse_account_config() {
        let config = AccountConfig::from_json(CONFIG).unwrap();
        assert_eq!(config.connection.protocol, Protocol::Imap);
        assert_eq!(config.connection.domain().as_deref(), Some("example.com"));
        assert_eq!(
            config.sync.check_frequency_if_idle_not_supported,
            Duration::from_secs(30)
        );
        assert_eq!(config.sync.idle_keepalive, Duration::from_secs(28 * 60));
        assert!(config.sync.trust_all_certificates);
        assert_eq!(config.overrides.path(SpecialUse::Trash), Some("Deleted Items"));
    }

    #[test]
    fn test_sync_defaults() {
        let config = SyncConfig::default();
        assert_eq!(
            config.check_frequency_if_idle_not_supported,
            Duration::from_secs(15)
        );
        assert!(config.opportunistic_starttls);
    }

    #[test]
    fn test_endpoint_security() {
        let mut props = AccountConfig::from_json(CONFIG).unwrap().connection;
        let mut sync = SyncConfig::default();
        assert_eq!(props.endpoint(&sync).security, Security::StartTls);
        assert!(props.endpoint(&sync).accept_invalid_certs);

        sync.opportunistic_starttls = false;
        assert_eq!(props.endpoint(&sync).security, Security::Plain);

        props.protocol = Protocol::Imaps;
        assert_eq!(props.endpoint(&sync).security, Security::Tls);
    }

    #[test]
    fn test_debug_hides_secret() {
        let props = AccountConfig::from_json(CONFIG).unwrap().connection;
        assert!(!format!("{:?}", props).contains("c2VjcmV0"));
    }

    #[test]
    fn test_invalid_json() {
        assert!(matches!(
            AccountConfig::from_json("{"),
            Err(CoreError::Config(_))
        ));
    }
}
