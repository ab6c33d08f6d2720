//! Session establishment: decrypt, connect, authenticate

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use mailsync_imap::{Connector, ImapError, MailStore};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::{ConnectionProperties, SyncConfig};
use crate::error::{CoreError, CoreResult};
use crate::scheduler::{Scheduler, TokioScheduler};
use crate::watch::WatchManager;

/// Failure reported by a [`SecretDecryptor`]
#[derive(Debug, Error)]
#[error("{0}")]
pub struct DecryptError(pub String);

/// Turns the stored ciphertext into the login secret
pub trait SecretDecryptor: Send + Sync {
    fn decrypt(&self, ciphertext: &str, password: &str) -> Result<String, DecryptError>;
}

impl<F> SecretDecryptor for F
where
    F: Fn(&str, &str) -> Result<String, DecryptError> + Send + Sync,
{
    fn decrypt(&self, ciphertext: &str, password: &str) -> Result<String, DecryptError> {
        self(ciphertext, password)
    }
}

/// Per-account state shared by every folder of the account
pub struct AccountContext {
    account_identity: String,
    store: Arc<dyn MailStore>,
    watch_manager: Arc<WatchManager>,
    scheduler: Arc<dyn Scheduler>,
    closed: AtomicBool,
}

impl AccountContext {
    pub fn new(
        account_identity: impl Into<String>,
        store: Arc<dyn MailStore>,
        watch_manager: Arc<WatchManager>,
        scheduler: Arc<dyn Scheduler>,
    ) -> Self {
        Self {
            account_identity: account_identity.into(),
            store,
            watch_manager,
            scheduler,
            closed: AtomicBool::new(false),
        }
    }

    pub fn account_identity(&self) -> &str {
        &self.account_identity
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    pub fn watch_manager(&self) -> &Arc<WatchManager> {
        &self.watch_manager
    }

    pub fn scheduler(&self) -> &Arc<dyn Scheduler> {
        &self.scheduler
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop watching and close the session; later calls do nothing
    pub async fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.watch_manager.stop().await;
        self.store.close().await?;
        info!("Session for {} closed", self.account_identity);
        Ok(())
    }
}

/// Opens authenticated sessions for accounts
pub struct SessionEstablisher {
    connector: Arc<dyn Connector>,
    decryptor: Arc<dyn SecretDecryptor>,
    scheduler: Arc<dyn Scheduler>,
    config: SyncConfig,
}

impl SessionEstablisher {
    /// An establisher on the tokio scheduler with default settings
    pub fn new(connector: Arc<dyn Connector>, decryptor: Arc<dyn SecretDecryptor>) -> Self {
        Self {
            connector,
            decryptor,
            scheduler: Arc::new(TokioScheduler::new()),
            config: SyncConfig::default(),
        }
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.scheduler = scheduler;
        self
    }

    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Decrypt the secret, connect and log in
    ///
    /// A secret that does not decrypt fails with
    /// [`CoreError::InvalidCredentials`] before any connection is attempted.
    pub async fn establish(
        &self,
        props: &ConnectionProperties,
        decryption_password: &str,
    ) -> CoreResult<Arc<AccountContext>> {
        let secret = self
            .decryptor
            .decrypt(&props.encrypted_secret, decryption_password)
            .map_err(|e| {
                warn!("Could not decrypt secret for {}: {}", props.account_identity, e);
                CoreError::InvalidCredentials(format!(
                    "secret for {} could not be decrypted",
                    props.account_identity
                ))
            })?;

        let endpoint = props.endpoint(&self.config);
        let store = self
            .connector
            .connect(&endpoint, &props.login, &secret)
            .await
            .map_err(|e| match e {
                ImapError::AuthenticationFailed(msg) => {
                    warn!("Login rejected for {}", props.account_identity);
                    CoreError::InvalidCredentials(msg)
                }
                other => {
                    warn!("Connecting {} failed: {}", props.account_identity, other);
                    CoreError::ConnectionFailed(other.to_string())
                }
            })?;

        info!(
            "Session established for {} at {}",
            props.account_identity,
            endpoint.address()
        );

        let watch_manager = WatchManager::new(
            self.scheduler.clone(),
            self.config.check_frequency_if_idle_not_supported,
            self.config.idle_keepalive,
        );

        Ok(Arc::new(AccountContext::new(
            props.account_identity.clone(),
            store,
            watch_manager,
            self.scheduler.clone(),
        )))
    }
}
