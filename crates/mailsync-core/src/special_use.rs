//! Bidirectional special-use role ↔ folder path mapping

use std::collections::HashMap;

use mailsync_imap::SpecialUse;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// At most one path per role and one role per path, looked up either way
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "HashMap<SpecialUse, String>",
    into = "HashMap<SpecialUse, String>"
)]
pub struct SpecialUseMap {
    by_role: HashMap<SpecialUse, String>,
    by_path: HashMap<String, SpecialUse>,
}

impl SpecialUseMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Map `role` to `path`, replacing the role's previous path
    pub fn insert(&mut self, role: SpecialUse, path: impl Into<String>) -> CoreResult<()> {
        let path = path.into();
        if role == SpecialUse::None {
            return Err(CoreError::InvalidSpecialUse {
                role,
                reason: "NONE cannot be mapped".to_string(),
            });
        }
        if let Some(existing) = self.by_path.get(&path) {
            if *existing != role {
                return Err(CoreError::InvalidSpecialUse {
                    role,
                    reason: format!("{} is already mapped to {:?}", path, existing),
                });
            }
        }

        if let Some(old_path) = self.by_role.insert(role, path.clone()) {
            self.by_path.remove(&old_path);
        }
        self.by_path.insert(path, role);
        Ok(())
    }

    /// Map `role` to `path` unless either side is already taken
    pub fn insert_if_absent(&mut self, role: SpecialUse, path: &str) -> bool {
        if role == SpecialUse::None
            || self.by_role.contains_key(&role)
            || self.by_path.contains_key(path)
        {
            return false;
        }
        self.by_role.insert(role, path.to_string());
        self.by_path.insert(path.to_string(), role);
        true
    }

    /// Fill unmapped roles from `defaults`; existing entries win
    pub fn merge_defaults(&mut self, defaults: &SpecialUseMap) {
        for (role, path) in defaults.iter() {
            self.insert_if_absent(role, path);
        }
    }

    pub fn path(&self, role: SpecialUse) -> Option<&str> {
        self.by_role.get(&role).map(String::as_str)
    }

    pub fn role(&self, path: &str) -> Option<SpecialUse> {
        self.by_path.get(path).copied()
    }

    pub fn remove(&mut self, role: SpecialUse) -> Option<String> {
        let path = self.by_role.remove(&role)?;
        self.by_path.remove(&path);
        Some(path)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SpecialUse, &str)> {
        self.by_role.iter().map(|(role, path)| (*role, path.as_str()))
    }

    pub fn len(&self) -> usize {
        self.by_role.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_role.is_empty()
    }
}

impl TryFrom<HashMap<SpecialUse, String>> for SpecialUseMap {
    type Error = CoreError;

    fn try_from(entries: HashMap<SpecialUse, String>) -> CoreResult<Self> {
        let mut map = SpecialUseMap::new();
        for (role, path) in entries {
            map.insert(role, path)?;
        }
        Ok(map)
    }
}

impl From<SpecialUseMap> for HashMap<SpecialUse, String> {
    fn from(map: SpecialUseMap) -> Self {
        map.by_role
    }
}

/// Provider defaults, keyed by the domain of the account identity
pub fn provider_defaults(domain: &str) -> SpecialUseMap {
    let mut map = SpecialUseMap::new();
    match domain {
        "gmail.com" | "googlemail.com" => {
            for (role, path) in [
                (SpecialUse::Trash, "[Gmail]/Trash"),
                (SpecialUse::Sent, "[Gmail]/Sent Mail"),
                (SpecialUse::Drafts, "[Gmail]/Drafts"),
                (SpecialUse::Junk, "[Gmail]/Spam"),
                (SpecialUse::AllMail, "[Gmail]/All Mail"),
                (SpecialUse::Flagged, "[Gmail]/Starred"),
                (SpecialUse::Important, "[Gmail]/Important"),
            ] {
                map.insert_if_absent(role, path);
            }
        }
        _ => {}
    }
    map
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_both_ways() {
        let mut map = SpecialUseMap::new();
        map.insert(SpecialUse::Trash, "Deleted Items").unwrap();
        assert_eq!(map.path(SpecialUse::Trash), Some("Deleted Items"));
        assert_eq!(map.role("Deleted Items"), Some(SpecialUse::Trash));
        assert_eq!(map.path(SpecialUse::Sent), None);
    }

    #[test]
    fn test_replacing_a_role_frees_the_old_path() {
        let mut map = SpecialUseMap::new();
        map.insert(SpecialUse::Trash, "Trash").unwrap();
        map.insert(SpecialUse::Trash, "Bin").unwrap();
        assert_eq!(map.role("Trash"), None);
        assert_eq!(map.role("Bin"), Some(SpecialUse::Trash));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn test_rejects_conflicts() {
        let mut map = SpecialUseMap::new();
        map.insert(SpecialUse::Trash, "Bin").unwrap();
        assert!(map.insert(SpecialUse::Junk, "Bin").is_err());
        assert!(map.insert(SpecialUse::None, "Other").is_err());
    }

    #[test]
    fn test_caller_wins_over_provider() {
        let mut overrides = SpecialUseMap::new();
        overrides.insert(SpecialUse::Trash, "My Trash").unwrap();
        overrides.merge_defaults(&provider_defaults("gmail.com"));

        assert_eq!(overrides.path(SpecialUse::Trash), Some("My Trash"));
        assert_eq!(overrides.path(SpecialUse::Junk), Some("[Gmail]/Spam"));
        assert!(provider_defaults("example.org").is_empty());
    }

    #[test]
    fn test_serde_round_trip() {
        let map: SpecialUseMap =
            serde_json::from_str(r#"{"TRASH": "Bin", "ALL_MAIL": "Archive/All"}"#).unwrap();
        assert_eq!(map.path(SpecialUse::AllMail), Some("Archive/All"));

        let json = serde_json::to_string(&map).unwrap();
        let back: SpecialUseMap = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);

        assert!(serde_json::from_str::<SpecialUseMap>(r#"{"TRASH": "X", "JUNK": "X"}"#).is_err());
    }
}
