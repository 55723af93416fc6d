//! Conversation profiles.
//!
//! A profile is a preset applied when creating a new conversation: system
//! prompt, optional account/model pins, and sampling parameters.  The manager
//! enforces unique names and keeps the default-profile reference valid —
//! an orphaned default is auto-corrected to `None` rather than failing.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::basilisk::conversation::AiModelRef;
use crate::basilisk::error::BasiliskError;

/// Preset applied to new conversations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationProfile {
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    /// Pinned account, if the profile names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<Uuid>,
    /// Pinned model, if the profile names one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_model: Option<AiModelRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_stream_mode")]
    pub stream_mode: bool,
}

fn default_stream_mode() -> bool {
    true
}

impl ConversationProfile {
    pub fn new(name: impl Into<String>) -> Self {
        ConversationProfile {
            name: name.into(),
            system_prompt: String::new(),
            account_id: None,
            ai_model: None,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stream_mode: true,
        }
    }
}

/// Named profiles plus the default selection.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct ConversationProfileManager {
    #[serde(default)]
    pub profiles: Vec<ConversationProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_profile_name: Option<String>,
}

impl ConversationProfileManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, profile: ConversationProfile) -> Result<(), BasiliskError> {
        if self.get(&profile.name).is_some() {
            return Err(BasiliskError::Config(format!(
                "duplicate profile name: {}",
                profile.name
            )));
        }
        self.profiles.push(profile);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Option<ConversationProfile> {
        let position = self.profiles.iter().position(|p| p.name == name)?;
        if self.default_profile_name.as_deref() == Some(name) {
            self.default_profile_name = None;
        }
        Some(self.profiles.remove(position))
    }

    pub fn get(&self, name: &str) -> Option<&ConversationProfile> {
        self.profiles.iter().find(|p| p.name == name)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// The default profile, when one is set and still exists.
    pub fn default_profile(&self) -> Option<&ConversationProfile> {
        self.default_profile_name
            .as_deref()
            .and_then(|name| self.get(name))
    }

    /// Repair invariants after load: a default pointing at a profile that no
    /// longer exists is reset to `None`.  Never fails; the profile list is
    /// left untouched.
    pub fn normalize(&mut self) {
        if let Some(name) = self.default_profile_name.clone() {
            if self.get(&name).is_none() {
                log::warn!("default profile '{}' not found; resetting to none", name);
                self.default_profile_name = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_names_are_rejected() {
        let mut manager = ConversationProfileManager::new();
        manager.add(ConversationProfile::new("work")).unwrap();
        assert!(manager.add(ConversationProfile::new("work")).is_err());
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn orphaned_default_is_reset_not_fatal() {
        let mut manager = ConversationProfileManager::new();
        manager.add(ConversationProfile::new("work")).unwrap();
        manager.default_profile_name = Some("gone".to_string());
        manager.normalize();
        assert_eq!(manager.default_profile_name, None);
        assert_eq!(manager.len(), 1);
    }

    #[test]
    fn removing_default_profile_clears_reference() {
        let mut manager = ConversationProfileManager::new();
        manager.add(ConversationProfile::new("work")).unwrap();
        manager.default_profile_name = Some("work".to_string());
        manager.remove("work");
        assert!(manager.default_profile().is_none());
    }
}
