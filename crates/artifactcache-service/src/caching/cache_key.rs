use std::fmt::{self, Write};
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use sha2::{Digest, Sha256};
use url::Url;

use super::CacheKeyError;
use crate::types::ModuleMetadata;

/// The maximum length of the free-form compiler flags that can be part of a [`CacheKey`].
pub const MAX_EXTRA_FLAGS_LEN: usize = 512;

/// A deterministic key identifying a compiled artifact.
///
/// Two keys compare equal iff their hashes do, the human-readable metadata only exists for
/// debugging and logging purposes.
#[derive(Debug, Clone, Eq)]
pub struct CacheKey {
    metadata: Arc<str>,
    hash: [u8; 32],
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cache_path())
    }
}

impl PartialEq for CacheKey {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl std::hash::Hash for CacheKey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.hash.hash(state);
    }
}

impl CacheKey {
    /// Derives the [`CacheKey`] of the artifact compiled from the described module.
    ///
    /// Only inputs that influence the compiled output contribute to the key. The `no_store`
    /// marker does not, as it only decides whether the artifact may be stored at all.
    pub fn for_module(module: &ModuleMetadata) -> Result<Self, CacheKeyError> {
        let mut url = Url::parse(&module.url)?;
        if url.cannot_be_a_base() {
            return Err(CacheKeyError::CannotBeABase);
        }
        if module.abi_version < 0 {
            return Err(CacheKeyError::NegativeAbiVersion(module.abi_version));
        }
        if module.opt_level < 0 {
            return Err(CacheKeyError::NegativeOptLevel(module.opt_level));
        }
        if module.extra_flags.len() > MAX_EXTRA_FLAGS_LEN {
            return Err(CacheKeyError::ExtraFlagsTooLong(module.extra_flags.len()));
        }

        // Credentials and fragments do not change what is being served.
        let _ = url.set_username("");
        let _ = url.set_password(None);
        url.set_fragment(None);

        let mut builder = CacheKeyBuilder {
            metadata: String::new(),
        };
        builder.write_module_meta(module, &url).unwrap();
        Ok(builder.build())
    }

    /// Returns the human-readable metadata that forms the basis of the [`CacheKey`].
    pub fn metadata(&self) -> &str {
        &self.metadata
    }

    /// Returns the relative path for this cache key.
    ///
    /// The relative path is a sha-256 hash hex-formatted like so:
    /// `aa/bbccdd/eeff...`
    pub fn cache_path(&self) -> String {
        let mut path = format!("{:02x}/", self.hash[0]);
        for b in &self.hash[1..4] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path.push('/');
        for b in &self.hash[4..] {
            path.write_fmt(format_args!("{b:02x}")).unwrap();
        }
        path
    }

    #[cfg(test)]
    pub fn for_testing(key: impl Into<String>) -> Self {
        CacheKeyBuilder {
            metadata: key.into(),
        }
        .build()
    }
}

/// A builder for [`CacheKey`]s.
///
/// This builder implements the [`Write`](std::fmt::Write) trait, and the intention of it is to
/// accept human readable, but most importantly **stable**, input.
/// This input in then being hashed to form the [`CacheKey`].
pub struct CacheKeyBuilder {
    metadata: String,
}

impl CacheKeyBuilder {
    /// Writes the compilation-relevant parts of the module into the [`CacheKey`].
    fn write_module_meta(&mut self, module: &ModuleMetadata, url: &Url) -> fmt::Result {
        writeln!(self, "abi: {}", module.abi_version)?;
        write!(self, "opt: {}", module.opt_level)?;
        if module.use_subzero {
            self.write_str(" subzero")?;
        }
        writeln!(self, "\nurl: {url}")?;
        match module.last_modified {
            Some(modified) if modified >= UNIX_EPOCH => writeln!(
                self,
                "modified: {}",
                humantime::format_rfc3339_seconds(modified)
            )?,
            _ => self.write_str("modified: unknown\n")?,
        }
        writeln!(self, "etag: {}", module.etag)?;
        writeln!(self, "sandbox: {}", module.sandbox_isa)?;
        writeln!(self, "extra_flags: {}", module.extra_flags)
    }

    /// Finalize the [`CacheKey`].
    pub fn build(self) -> CacheKey {
        let hash = Sha256::digest(&self.metadata);
        let hash = <[u8; 32]>::from(hash);

        CacheKey {
            metadata: self.metadata.into(),
            hash,
        }
    }
}

impl fmt::Write for CacheKeyBuilder {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.metadata.write_str(s)
    }
}
