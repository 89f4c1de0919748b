//! URL normalization and artifact naming

use crate::error::CacheError;
use md5::{Digest, Md5};
use std::fmt;
use url::Url;

/// Normalized identity of a resource
///
/// Parsing through `url` lowercases scheme and host and drops default ports;
/// the fragment is stripped since it never reaches the server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey(Url);

impl ResourceKey {
    pub fn parse(input: &str) -> Result<Self, CacheError> {
        let url = Url::parse(input.trim()).map_err(|_| CacheError::InvalidUrl(input.to_string()))?;
        Ok(Self::from_url(url))
    }

    pub fn from_url(mut url: Url) -> Self {
        url.set_fragment(None);
        Self(url)
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn url(&self) -> &Url {
        &self.0
    }

    pub fn scheme(&self) -> &str {
        self.0.scheme()
    }

    /// Stable file name for this key's artifact
    pub fn artifact_name(&self) -> String {
        format!("{:x}", Md5::digest(self.0.as_str().as_bytes()))
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0.as_str())
    }
}

impl std::str::FromStr for ResourceKey {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// Anything a caller may identify a resource by
pub trait IntoResourceKey {
    fn into_resource_key(self) -> Result<ResourceKey, CacheError>;
}

impl IntoResourceKey for ResourceKey {
    fn into_resource_key(self) -> Result<ResourceKey, CacheError> {
        Ok(self)
    }
}

impl IntoResourceKey for &ResourceKey {
    fn into_resource_key(self) -> Result<ResourceKey, CacheError> {
        Ok(self.clone())
    }
}

impl IntoResourceKey for &str {
    fn into_resource_key(self) -> Result<ResourceKey, CacheError> {
        ResourceKey::parse(self)
    }
}

impl IntoResourceKey for &String {
    fn into_resource_key(self) -> Result<ResourceKey, CacheError> {
        ResourceKey::parse(self)
    }
}

impl IntoResourceKey for String {
    fn into_resource_key(self) -> Result<ResourceKey, CacheError> {
        ResourceKey::parse(&self)
    }
}

impl IntoResourceKey for Url {
    fn into_resource_key(self) -> Result<ResourceKey, CacheError> {
        Ok(ResourceKey::from_url(self))
    }
}

impl IntoResourceKey for &Url {
    fn into_resource_key(self) -> Result<ResourceKey, CacheError> {
        Ok(ResourceKey::from_url(self.clone()))
    }
}
