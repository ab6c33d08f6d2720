//! Account registry: special-use resolution and the folder cache

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use mailsync_imap::SpecialUse;
use tracing::{debug, info, warn};

use crate::error::{CoreError, CoreResult};
use crate::folder::Folder;
use crate::session::AccountContext;
use crate::special_use::{provider_defaults, SpecialUseMap};

/// Path of the inbox; every IMAP server has one
pub const INBOX: &str = "INBOX";

/// One authenticated account and its cached folders
pub struct Account {
    context: Arc<AccountContext>,
    special_uses: RwLock<SpecialUseMap>,
    folders: Mutex<HashMap<String, Arc<Folder>>>,
    closed: AtomicBool,
    this: Weak<Account>,
}

impl std::fmt::Debug for Account {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Account")
            .field("account_identity", &self.context.account_identity())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

fn domain_of(identity: &str) -> Option<String> {
    identity
        .rsplit_once('@')
        .map(|(_, domain)| domain.to_lowercase())
}

impl Account {
    /// Build the registry for `context`
    ///
    /// Provider defaults for the identity's domain fill roles that
    /// `overrides` leaves unmapped.
    pub fn for_account(context: Arc<AccountContext>, overrides: SpecialUseMap) -> Arc<Self> {
        let mut special_uses = overrides;
        if let Some(domain) = domain_of(context.account_identity()) {
            let defaults = provider_defaults(&domain);
            if !defaults.is_empty() {
                debug!("Applying {} provider defaults for {}", defaults.len(), domain);
            }
            special_uses.merge_defaults(&defaults);
        }

        Arc::new_cyclic(|this| Self {
            context,
            special_uses: RwLock::new(special_uses),
            folders: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            this: this.clone(),
        })
    }

    pub fn account_identity(&self) -> &str {
        self.context.account_identity()
    }

    pub fn context(&self) -> &Arc<AccountContext> {
        &self.context
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.is_closed() {
            return Err(CoreError::NoConnectionEstablished);
        }
        Ok(())
    }

    /// Current role → path map
    pub fn special_uses(&self) -> SpecialUseMap {
        self.special_uses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn role_of(&self, path: &str) -> SpecialUse {
        let mapped = self
            .special_uses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .role(path);
        match mapped {
            Some(role) => role,
            None if path.eq_ignore_ascii_case(INBOX) => SpecialUse::Inbox,
            None => SpecialUse::None,
        }
    }

    /// Fill unmapped roles from the server's special-use attributes
    ///
    /// Returns how many roles were added.
    pub async fn discover(&self) -> CoreResult<usize> {
        self.check_open()?;
        let folders = self.context.store().list_folders().await?;

        let mut special_uses = self
            .special_uses
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let mut added = 0;
        for info in &folders {
            if let Some(role) = info.special_use() {
                if special_uses.insert_if_absent(role, &info.path) {
                    debug!("Discovered {:?} at {}", role, info.path);
                    added += 1;
                }
            }
        }
        info!(
            "Discovered {} special-use folders for {}",
            added,
            self.account_identity()
        );
        Ok(added)
    }

    /// The cached folder for `path`, created on first request
    pub fn folder(&self, path: &str) -> CoreResult<Arc<Folder>> {
        self.check_open()?;
        let mut folders = self.folders.lock().unwrap_or_else(PoisonError::into_inner);
        let folder = folders
            .entry(path.to_string())
            .or_insert_with(|| {
                debug!("Creating folder {}", path);
                Arc::new(Folder::new(path, self.context.clone(), self.this.clone()))
            })
            .clone();
        Ok(folder)
    }

    /// Every selectable folder of the default namespace
    pub async fn folders(&self) -> CoreResult<Vec<Arc<Folder>>> {
        self.check_open()?;
        let infos = self.context.store().list_folders().await?;
        infos
            .iter()
            .filter(|info| info.is_selectable())
            .map(|info| self.folder(&info.path))
            .collect()
    }

    /// The folder mapped to `role`
    pub fn special_folder(&self, role: SpecialUse) -> CoreResult<Arc<Folder>> {
        let path = self
            .special_uses
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .path(role)
            .map(str::to_string);

        match (path, role) {
            (Some(path), _) => self.folder(&path),
            (None, SpecialUse::Inbox) => self.folder(INBOX),
            (None, _) => Err(CoreError::FolderNotFound(format!(
                "{:?}: Folder not found",
                role
            ))),
        }
    }

    /// Close every cached folder, then the session. Idempotent.
    pub async fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let folders: Vec<Arc<Folder>> = self
            .folders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, folder)| folder)
            .collect();
        for folder in folders {
            if let Err(e) = folder.close().await {
                warn!("Closing folder {} failed: {}", folder.path(), e);
            }
        }

        self.context.close().await?;
        info!("Account {} closed", self.account_identity());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_domain_of() {
        assert_eq!(domain_of("Jane@GMail.com").as_deref(), Some("gmail.com"));
        assert_eq!(domain_of("no-domain"), None);
    }
}
