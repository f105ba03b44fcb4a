use crate::secrets::string::SecretString;
use crate::secrets::SecretManager;
use sdk::errors::EngineError;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// In-memory cache of resolved credentials.
///
/// Endpoints and tool backends resolve their credential once at startup;
/// the cache keeps repeated keychain lookups off the request path.
/// Misses are cached too, so an absent credential is not looked up again.
#[derive(Clone)]
pub struct SecretCache {
    manager: Arc<SecretManager>,
    cache: Arc<RwLock<HashMap<String, Option<SecretString>>>>,
}

impl SecretCache {
    pub fn new(manager: Arc<SecretManager>) -> Self {
        Self {
            manager,
            cache: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Resolve a credential, consulting the cache first.
    pub fn get(&self, name: &str) -> Result<Option<SecretString>, EngineError> {
        {
            let cache = self.cache.read().unwrap_or_else(|p| p.into_inner());
            if let Some(secret) = cache.get(name) {
                return Ok(secret.clone());
            }
        }

        let secret = self.manager.resolve(name)?;

        {
            let mut cache = self.cache.write().unwrap_or_else(|p| p.into_inner());
            cache.insert(name.to_string(), secret.clone());
        }

        Ok(secret)
    }

    /// Resolve an optional credential name, as found in config
    pub fn get_opt(&self, name: Option<&str>) -> Result<Option<SecretString>, EngineError> {
        match name {
            Some(name) => self.get(name),
            None => Ok(None),
        }
    }
}
