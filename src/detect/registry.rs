use std::collections::HashMap;
use std::path::PathBuf;

use anyhow::{anyhow, Result};

use super::replay::{ReplayConfig, ReplaySource};
use super::source::DetectionSource;
use super::stub::StubSource;

/// Builds a source from the part of the locator after the scheme.
pub type SourceFactory = Box<dyn Fn(&str) -> Result<Box<dyn DetectionSource>> + Send + Sync>;

/// Scheme-keyed registry of detection source factories.
///
/// Locators look like `stub://tankA`, `replay:///data/tank_a.jsonl`,
/// `replay:tank_a.jsonl` or a plain path. A plain path goes to the fallback
/// scheme (`replay` by default).
pub struct SourceRegistry {
    factories: HashMap<String, SourceFactory>,
    fallback: Option<String>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
            fallback: None,
        }
    }

    /// `stub`, `replay` and `replay-loop`, with plain paths treated as `replay`.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("stub", |name| Ok(Box::new(StubSource::new(name))));
        registry.register("replay", |path| replay(path, false));
        registry.register("replay-loop", |path| replay(path, true));
        registry.fallback = Some("replay".to_string());
        registry
    }

    /// Register a factory. A later registration for the same scheme replaces it.
    pub fn register<F>(&mut self, scheme: &str, factory: F)
    where
        F: Fn(&str) -> Result<Box<dyn DetectionSource>> + Send + Sync + 'static,
    {
        self.factories
            .insert(scheme.to_ascii_lowercase(), Box::new(factory));
    }

    /// Scheme used for locators without one.
    pub fn set_fallback(&mut self, scheme: &str) -> Result<()> {
        if !self.factories.contains_key(scheme) {
            return Err(anyhow!("source scheme '{}' not registered", scheme));
        }
        self.fallback = Some(scheme.to_string());
        Ok(())
    }

    /// List registered schemes.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.factories.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    /// Build (but do not connect) the source for `locator`.
    pub fn open(&self, locator: &str) -> Result<Box<dyn DetectionSource>> {
        let (scheme, rest) = split_locator(locator);
        let scheme = match scheme {
            Some(scheme) => scheme.to_ascii_lowercase(),
            None => self
                .fallback
                .clone()
                .ok_or_else(|| anyhow!("source locator has no scheme: {}", locator))?,
        };
        let factory = self
            .factories
            .get(&scheme)
            .ok_or_else(|| anyhow!("no detection source registered for scheme '{}'", scheme))?;
        factory(rest)
    }
}

impl Default for SourceRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

fn replay(path: &str, loop_playback: bool) -> Result<Box<dyn DetectionSource>> {
    Ok(Box::new(ReplaySource::new(ReplayConfig {
        path: PathBuf::from(path),
        loop_playback,
    })?))
}

/// Splits `scheme://rest` or `scheme:rest` into its parts.
///
/// Anything without a scheme of at least two characters is returned whole, so
/// relative paths and `C:\...` style paths are not mistaken for schemes.
pub fn split_locator(locator: &str) -> (Option<&str>, &str) {
    let locator = locator.trim();
    if let Some((scheme, rest)) = locator.split_once("://") {
        if is_scheme(scheme) {
            return (Some(scheme), rest);
        }
    }
    if let Some((scheme, rest)) = locator.split_once(':') {
        if scheme.len() > 1 && is_scheme(scheme) {
            return (Some(scheme), rest);
        }
    }
    (None, locator)
}

fn is_scheme(candidate: &str) -> bool {
    let mut chars = candidate.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}
