//! Accounts bind a provider to credentials.
//!
//! An [`Account`] carries the API key, an optional list of organizations with
//! one active at a time, and an optional custom base URL for OpenAI-compatible
//! self-hosted deployments.  The [`AccountManager`] discovers accounts from
//! per-provider environment variables at startup (skippable with
//! `--no-env-account`) and holds the configured default.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::basilisk::error::BasiliskError;
use crate::basilisk::provider::{get_provider, Provider, PROVIDERS};

/// Where an account came from.  Environment-sourced accounts are never
/// written back to configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountSource {
    EnvVar,
    #[default]
    Config,
}

/// An organization usable with a provider account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountOrganization {
    pub id: Uuid,
    pub name: String,
    pub key: String,
    #[serde(skip, default)]
    pub source: AccountSource,
}

/// A provider plus credentials, optionally scoped to an organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    pub id: Uuid,
    pub name: String,
    pub provider_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub organizations: Vec<AccountOrganization>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_organization_id: Option<Uuid>,
    /// Overrides the provider's default base URL when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_base_url: Option<String>,
    #[serde(skip, default)]
    pub source: AccountSource,
}

impl Account {
    pub fn new(name: impl Into<String>, provider_id: impl Into<String>, api_key: Option<String>) -> Self {
        Account {
            id: Uuid::new_v4(),
            name: name.into(),
            provider_id: provider_id.into(),
            api_key,
            organizations: Vec::new(),
            active_organization_id: None,
            custom_base_url: None,
            source: AccountSource::Config,
        }
    }

    /// The static provider descriptor, if the id is known.
    pub fn provider(&self) -> Option<&'static Provider> {
        get_provider(&self.provider_id)
    }

    /// The organization selected by `active_organization_id`, if any.
    pub fn active_organization(&self) -> Option<&AccountOrganization> {
        let active = self.active_organization_id?;
        self.organizations.iter().find(|org| org.id == active)
    }

    /// Validate credential and organization constraints against the provider
    /// descriptor.
    pub fn validate(&self) -> Result<(), BasiliskError> {
        let provider = self.provider().ok_or_else(|| {
            BasiliskError::Config(format!("unknown provider '{}'", self.provider_id))
        })?;
        if provider.require_api_key && self.api_key.as_deref().unwrap_or("").is_empty() {
            return Err(BasiliskError::Credential(format!(
                "API key for {} is required",
                provider.name
            )));
        }
        if self.active_organization_id.is_some() {
            if !provider.organization_mode_available {
                return Err(BasiliskError::Config(format!(
                    "organization mode is not available for {}",
                    provider.name
                )));
            }
            if self.active_organization().is_none() {
                return Err(BasiliskError::Config(format!(
                    "active organization not found for {} account",
                    provider.name
                )));
            }
        }
        Ok(())
    }

    /// Effective base URL: the account override, else the provider default.
    pub fn base_url(&self) -> Option<&str> {
        self.custom_base_url
            .as_deref()
            .or_else(|| self.provider().and_then(|p| p.base_url))
    }
}

/// All known accounts, env-sourced and configured.
#[derive(Debug, Default)]
pub struct AccountManager {
    accounts: Vec<Account>,
    default_account_id: Option<Uuid>,
}

impl AccountManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a manager, discovering one account per provider whose API-key
    /// environment variable is set.  `load_env` is false when the user passed
    /// `--no-env-account`.
    pub fn from_env(load_env: bool) -> Self {
        let mut manager = Self::new();
        if !load_env {
            return manager;
        }
        for provider in PROVIDERS {
            let Some(var) = provider.env_var_api_key else {
                continue;
            };
            let Ok(api_key) = std::env::var(var) else {
                continue;
            };
            if api_key.is_empty() {
                continue;
            }
            let mut account = Account::new(
                format!("{} account", provider.name),
                provider.id,
                Some(api_key),
            );
            account.source = AccountSource::EnvVar;
            if provider.organization_mode_available {
                if let Some(org_var) = provider.env_var_organization_key {
                    if let Ok(org_key) = std::env::var(org_var) {
                        if !org_key.is_empty() {
                            let organization = AccountOrganization {
                                id: Uuid::new_v4(),
                                name: "From environment variable".to_string(),
                                key: org_key,
                                source: AccountSource::EnvVar,
                            };
                            account.active_organization_id = Some(organization.id);
                            account.organizations.push(organization);
                        }
                    }
                }
            }
            log::debug!(
                "discovered {} account from environment variable {}",
                provider.name,
                var
            );
            manager.accounts.push(account);
        }
        manager
    }

    /// Add an account after validating it.
    pub fn add(&mut self, account: Account) -> Result<(), BasiliskError> {
        account.validate()?;
        log::debug!(
            "added account for {} ({}, source: {:?})",
            account.provider_id,
            account.name,
            account.source
        );
        self.accounts.push(account);
        Ok(())
    }

    pub fn remove(&mut self, id: Uuid) -> Option<Account> {
        if self.default_account_id == Some(id) {
            self.default_account_id = None;
        }
        let position = self.accounts.iter().position(|account| account.id == id)?;
        Some(self.accounts.remove(position))
    }

    pub fn get(&self, id: Uuid) -> Option<&Account> {
        self.accounts.iter().find(|account| account.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Account> {
        self.accounts.iter()
    }

    pub fn len(&self) -> usize {
        self.accounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.accounts.is_empty()
    }

    /// Accounts bound to the given provider id, in insertion order.
    pub fn accounts_by_provider<'a>(
        &'a self,
        provider_id: &'a str,
    ) -> impl Iterator<Item = &'a Account> {
        self.accounts
            .iter()
            .filter(move |account| account.provider_id == provider_id)
    }

    /// The configured default account, else the first known account.
    pub fn default_account(&self) -> Option<&Account> {
        self.default_account_id
            .and_then(|id| self.get(id))
            .or_else(|| self.accounts.first())
    }

    /// Point the default at an existing account.
    pub fn set_default(&mut self, id: Uuid) -> Result<(), BasiliskError> {
        if self.get(id).is_none() {
            return Err(BasiliskError::Config(format!("no account with id {}", id)));
        }
        self.default_account_id = Some(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_requires_api_key() {
        let account = Account::new("test", "openai", None);
        assert!(matches!(
            account.validate(),
            Err(BasiliskError::Credential(_))
        ));
    }

    #[test]
    fn validate_rejects_org_on_orgless_provider() {
        let mut account = Account::new("test", "mistralai", Some("key".to_string()));
        account.active_organization_id = Some(Uuid::new_v4());
        assert!(matches!(account.validate(), Err(BasiliskError::Config(_))));
    }

    #[test]
    fn custom_base_url_wins() {
        let mut account = Account::new("test", "openai", Some("key".to_string()));
        assert_eq!(account.base_url(), Some("https://api.openai.com/v1"));
        account.custom_base_url = Some("http://localhost:8080/v1".to_string());
        assert_eq!(account.base_url(), Some("http://localhost:8080/v1"));
    }

    #[test]
    fn default_account_falls_back_to_first() {
        let mut manager = AccountManager::new();
        let first = Account::new("a", "openai", Some("k".to_string()));
        let second = Account::new("b", "anthropic", Some("k".to_string()));
        let second_id = second.id;
        manager.add(first).unwrap();
        manager.add(second).unwrap();
        assert_eq!(manager.default_account().unwrap().name, "a");
        manager.set_default(second_id).unwrap();
        assert_eq!(manager.default_account().unwrap().name, "b");
        manager.remove(second_id);
        assert_eq!(manager.default_account().unwrap().name, "a");
    }
}
