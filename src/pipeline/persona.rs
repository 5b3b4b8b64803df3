//! Persona table: role id → system prompt, offline template, voice.

use crate::config::PersonaConfig;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Placeholder in offline templates replaced by the user's text.
pub const TEXT_PLACEHOLDER: &str = "{text}";

#[derive(Debug, Clone, PartialEq)]
pub struct Persona {
    pub id: String,
    pub display_name: String,
    pub system_prompt: String,
    pub template: String,
    pub voice: Option<String>,
}

impl Persona {
    /// Offline reply for `text`.
    pub fn render_template(&self, text: &str) -> String {
        self.template.replace(TEXT_PLACEHOLDER, text.trim())
    }
}

impl From<&PersonaConfig> for Persona {
    fn from(config: &PersonaConfig) -> Self {
        Self {
            id: config.id.clone(),
            display_name: config.name.clone(),
            system_prompt: config.prompt.clone(),
            template: config.template.clone(),
            voice: config.voice.clone().filter(|v| !v.trim().is_empty()),
        }
    }
}

/// Immutable lookup table built once at startup and shared by every session.
///
/// Unknown or missing role ids resolve to the default persona; lookup never fails.
#[derive(Debug)]
pub struct PersonaCatalog {
    personas: HashMap<String, Arc<Persona>>,
    default: Arc<Persona>,
}

impl PersonaCatalog {
    pub fn from_config(personas: &[PersonaConfig], default_id: &str) -> Result<Self> {
        let personas: HashMap<String, Arc<Persona>> = personas
            .iter()
            .map(|p| (p.id.clone(), Arc::new(Persona::from(p))))
            .collect();

        let default = personas
            .get(default_id)
            .cloned()
            .ok_or_else(|| anyhow!("default persona '{}' is not configured", default_id))?;

        Ok(Self { personas, default })
    }

    pub fn resolve(&self, role: Option<&str>) -> Arc<Persona> {
        match role.map(str::trim).filter(|r| !r.is_empty()) {
            Some(id) => match self.personas.get(id) {
                Some(persona) => Arc::clone(persona),
                None => {
                    debug!(role = id, fallback = %self.default.id, "Unknown persona, using default");
                    Arc::clone(&self.default)
                }
            },
            None => Arc::clone(&self.default),
        }
    }

    pub fn default_persona(&self) -> Arc<Persona> {
        Arc::clone(&self.default)
    }

    /// Sorted persona ids, for health output.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.personas.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Every persona, ordered by id.
    pub fn all(&self) -> Vec<Arc<Persona>> {
        let mut personas: Vec<Arc<Persona>> = self.personas.values().cloned().collect();
        personas.sort_by(|a, b| a.id.cmp(&b.id));
        personas
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    fn catalog() -> PersonaCatalog {
        let config = AppConfig::default();
        PersonaCatalog::from_config(&config.personas, &config.session.default_persona).unwrap()
    }

    #[test]
    fn test_known_persona_resolves_to_itself() {
        let catalog = catalog();
        assert_eq!(catalog.resolve(Some("einstein")).id, "einstein");
        assert_eq!(catalog.resolve(Some(" sherlock ")).id, "sherlock");
    }

    #[test]
    fn test_unknown_or_missing_persona_uses_default() {
        let catalog = catalog();
        let default = catalog.default_persona();
        assert_eq!(default.id, "socrates");
        assert_eq!(*catalog.resolve(Some("gandalf")), *default);
        assert_eq!(*catalog.resolve(Some("")), *default);
        assert_eq!(*catalog.resolve(None), *default);
    }

    #[test]
    fn test_template_substitutes_user_text() {
        let persona = catalog().resolve(Some("einstein"));
        let reply = persona.render_template("  What is time? ");
        assert!(reply.contains("What is time?"));
        assert!(!reply.contains(TEXT_PLACEHOLDER));
    }

    #[test]
    fn test_missing_default_is_rejected() {
        let config = AppConfig::default();
        assert!(PersonaCatalog::from_config(&config.personas, "nobody").is_err());
    }
}
