//! Account/model resolution and the engine cache.
//!
//! Maps a conversation profile (or the configured defaults) to a concrete
//! `(account, model_id)` pair, and hands out engine instances cached by
//! account id — `get_engine` is lazy and idempotent, so two calls for the
//! same account return the same `Arc`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::basilisk::account::{Account, AccountManager};
use crate::basilisk::engine::ProviderEngine;
use crate::basilisk::engines::anthropic::AnthropicEngine;
use crate::basilisk::engines::mistral::MistralEngine;
use crate::basilisk::engines::openai::OpenAiEngine;
use crate::basilisk::engines::openrouter::OpenRouterEngine;
use crate::basilisk::error::BasiliskError;
use crate::basilisk::profile::ConversationProfile;
use crate::basilisk::provider::{get_provider, EngineKind};

/// Construct the adapter matching the account's provider.
fn build_engine(account: &Account) -> Result<Arc<dyn ProviderEngine>, BasiliskError> {
    let provider = account.provider().ok_or_else(|| {
        BasiliskError::Config(format!("unknown provider '{}'", account.provider_id))
    })?;
    Ok(match provider.engine_kind {
        EngineKind::OpenAi => Arc::new(OpenAiEngine::from_account(account)?),
        EngineKind::Anthropic => Arc::new(AnthropicEngine::from_account(account)?),
        EngineKind::Mistral => Arc::new(MistralEngine::from_account(account)?),
        EngineKind::OpenRouter => Arc::new(OpenRouterEngine::from_account(account)?),
    })
}

/// Resolution and caching service; one per application process.
#[derive(Default)]
pub struct AccountModelService {
    engines: Mutex<HashMap<Uuid, Arc<dyn ProviderEngine>>>,
}

impl AccountModelService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine for `account`, created on first access and cached.
    pub fn get_engine(&self, account: &Account) -> Result<Arc<dyn ProviderEngine>, BasiliskError> {
        let mut cache = self.engines.lock().expect("engine cache lock");
        if let Some(engine) = cache.get(&account.id) {
            return Ok(Arc::clone(engine));
        }
        let engine = build_engine(account)?;
        cache.insert(account.id, Arc::clone(&engine));
        Ok(engine)
    }

    /// Drop the cached engine when its account is removed.
    pub fn remove_engine(&self, account_id: Uuid) {
        self.engines
            .lock()
            .expect("engine cache lock")
            .remove(&account_id);
    }

    /// Resolve `(account, model_id)` from a profile.
    ///
    /// 1. A profile naming both wins outright.
    /// 2. A profile naming only a model picks the first account whose
    ///    provider serves that model.
    /// 3. A profile naming neither falls back — when requested — to the
    ///    default account and its engine's first model.
    pub fn resolve_account_and_model<'a>(
        &self,
        profile: Option<&ConversationProfile>,
        accounts: &'a AccountManager,
        fall_back_default_account: bool,
    ) -> (Option<&'a Account>, Option<String>) {
        let (account_id, model) = match profile {
            Some(profile) => (profile.account_id, profile.ai_model.clone()),
            None => (None, None),
        };

        if account_id.is_none() && model.is_none() {
            if !fall_back_default_account {
                return (None, None);
            }
            log::debug!("no account or model in profile, using default account");
            let account = accounts.default_account();
            let model_id = account.and_then(|account| {
                let engine = self.get_engine(account).ok()?;
                engine.models().first().map(|descriptor| descriptor.id.clone())
            });
            return (account, model_id);
        }

        let account = match account_id {
            Some(id) => accounts.get(id),
            None => {
                // Match the model's provider against the known accounts.
                log::debug!("no account in profile, trying to find account by provider");
                model.as_ref().and_then(|model| {
                    get_provider(&model.provider_id)
                        .and_then(|provider| accounts.accounts_by_provider(provider.id).next())
                })
            }
        };
        (account, model.map(|m| m.model_id))
    }
}
