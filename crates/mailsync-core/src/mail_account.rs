//! Connection aggregate: properties plus the live account, if connected

use std::sync::Arc;

use mailsync_imap::{Connector, SpecialUse};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::account::Account;
use crate::config::{AccountConfig, ConnectionProperties};
use crate::error::{CoreError, CoreResult};
use crate::folder::Folder;
use crate::session::{SecretDecryptor, SessionEstablisher};
use crate::special_use::SpecialUseMap;

/// A configured account that may or may not be connected
pub struct MailAccount {
    properties: ConnectionProperties,
    establisher: SessionEstablisher,
    overrides: SpecialUseMap,
    account: RwLock<Option<Arc<Account>>>,
}

impl MailAccount {
    pub fn new(properties: ConnectionProperties, establisher: SessionEstablisher) -> Self {
        Self {
            properties,
            establisher,
            overrides: SpecialUseMap::new(),
            account: RwLock::new(None),
        }
    }

    /// Build from a loaded configuration file
    pub fn from_config(
        config: AccountConfig,
        connector: Arc<dyn Connector>,
        decryptor: Arc<dyn SecretDecryptor>,
    ) -> Self {
        let establisher = SessionEstablisher::new(connector, decryptor).with_config(config.sync);
        Self::new(config.connection, establisher).with_overrides(config.overrides)
    }

    pub fn with_overrides(mut self, overrides: SpecialUseMap) -> Self {
        self.overrides = overrides;
        self
    }

    pub fn properties(&self) -> &ConnectionProperties {
        &self.properties
    }

    /// Establish a session and build the account, replacing any previous one
    pub async fn connect(&self, decryption_password: &str) -> CoreResult<Arc<Account>> {
        let mut slot = self.account.write().await;
        if let Some(previous) = slot.take() {
            info!("Reconnecting {}", self.properties.account_identity);
            if let Err(e) = previous.close().await {
                warn!("Closing previous session failed: {}", e);
            }
        }

        let context = self
            .establisher
            .establish(&self.properties, decryption_password)
            .await?;
        let account = Account::for_account(context, self.overrides.clone());
        *slot = Some(account.clone());
        Ok(account)
    }

    pub async fn is_connected(&self) -> bool {
        self.account
            .read()
            .await
            .as_ref()
            .is_some_and(|account| !account.is_closed())
    }

    pub async fn account(&self) -> CoreResult<Arc<Account>> {
        self.account
            .read()
            .await
            .clone()
            .ok_or(CoreError::NoConnectionEstablished)
    }

    pub async fn folder(&self, path: &str) -> CoreResult<Arc<Folder>> {
        self.account().await?.folder(path)
    }

    pub async fn folders(&self) -> CoreResult<Vec<Arc<Folder>>> {
        self.account().await?.folders().await
    }

    pub async fn special_folder(&self, role: SpecialUse) -> CoreResult<Arc<Folder>> {
        self.account().await?.special_folder(role)
    }

    /// Close the account if connected
    pub async fn close(&self) -> CoreResult<()> {
        let account = self.account.write().await.take();
        match account {
            Some(account) => account.close().await,
            None => Ok(()),
        }
    }
}
