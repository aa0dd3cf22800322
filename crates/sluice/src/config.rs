//! Process-wide defaults for handles and mailboxes.
//!
//! Handles and state tasks created without an explicit policy read their
//! defaults from the installed [`Config`]. Nothing is installed until
//! [`Config::install`] is called; until then [`Config::default`] applies.
//!
//! ```ignore
//! use sluice::{BufferPolicy, Config, LeakPolicy};
//!
//! Config::builder()
//!     .leak_policy(LeakPolicy::LogAndCancel)
//!     .mailbox_policy(BufferPolicy::BufferingNewest(64))
//!     .build()
//!     .install();
//! ```

use std::sync::{PoisonError, RwLock};

use anyhow::{bail, Context, Result};

use crate::channel::BufferPolicy;
use crate::leak::LeakPolicy;

/// Environment variable selecting the default leak policy.
pub const LEAK_POLICY_ENV: &str = "SLUICE_LEAK_POLICY";

/// Environment variable selecting the default mailbox policy.
pub const MAILBOX_POLICY_ENV: &str = "SLUICE_MAILBOX_POLICY";

static INSTALLED: RwLock<Option<Config>> = RwLock::new(None);

/// Runtime defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    leak_policy: LeakPolicy,
    mailbox_policy: BufferPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            leak_policy: LeakPolicy::default(),
            mailbox_policy: BufferPolicy::Unbounded,
        }
    }
}

impl Config {
    /// Start building a config from the defaults.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Read overrides from `SLUICE_LEAK_POLICY` and `SLUICE_MAILBOX_POLICY`.
    ///
    /// Unset variables keep their defaults; malformed values are errors.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        if let Ok(raw) = std::env::var(LEAK_POLICY_ENV) {
            config.leak_policy = parse_leak_policy(&raw)
                .with_context(|| format!("invalid {LEAK_POLICY_ENV}"))?;
        }
        if let Ok(raw) = std::env::var(MAILBOX_POLICY_ENV) {
            config.mailbox_policy = parse_mailbox_policy(&raw)
                .with_context(|| format!("invalid {MAILBOX_POLICY_ENV}"))?;
        }
        Ok(config)
    }

    /// Make this the process-wide default.
    pub fn install(self) {
        *INSTALLED.write().unwrap_or_else(PoisonError::into_inner) = Some(self);
    }

    /// The installed config, or the defaults if none was installed.
    pub fn current() -> Self {
        let installed = *INSTALLED.read().unwrap_or_else(PoisonError::into_inner);
        installed.unwrap_or_default()
    }

    pub fn leak_policy(&self) -> LeakPolicy {
        self.leak_policy
    }

    pub fn mailbox_policy(&self) -> BufferPolicy {
        self.mailbox_policy
    }
}

/// Builder for [`Config`].
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Policy applied to handles dropped before completion.
    pub fn leak_policy(mut self, policy: LeakPolicy) -> Self {
        self.config.leak_policy = policy;
        self
    }

    /// Buffering used by state tasks spawned without an explicit channel.
    pub fn mailbox_policy(mut self, policy: BufferPolicy) -> Self {
        self.config.mailbox_policy = policy;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

fn parse_leak_policy(raw: &str) -> Result<LeakPolicy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "assert" => Ok(LeakPolicy::Assert),
        "log" | "log_and_cancel" => Ok(LeakPolicy::LogAndCancel),
        "silent" | "silent_cancel" => Ok(LeakPolicy::SilentCancel),
        other => bail!("unknown leak policy `{other}`"),
    }
}

fn parse_mailbox_policy(raw: &str) -> Result<BufferPolicy> {
    let raw = raw.trim().to_ascii_lowercase();
    if raw == "unbounded" {
        return Ok(BufferPolicy::Unbounded);
    }
    let Some((kind, size)) = raw.split_once(':') else {
        bail!("expected `unbounded`, `oldest:N` or `newest:N`, got `{raw}`");
    };
    let size: usize = size
        .parse()
        .with_context(|| format!("invalid buffer size `{size}`"))?;
    match kind {
        "oldest" => Ok(BufferPolicy::BufferingOldest(size)),
        "newest" => Ok(BufferPolicy::BufferingNewest(size)),
        other => bail!("unknown buffering kind `{other}`"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_overrides_defaults() {
        let config = Config::builder()
            .leak_policy(LeakPolicy::SilentCancel)
            .mailbox_policy(BufferPolicy::BufferingOldest(8))
            .build();

        assert_eq!(config.leak_policy(), LeakPolicy::SilentCancel);
        assert_eq!(config.mailbox_policy(), BufferPolicy::BufferingOldest(8));
    }

    #[test]
    fn test_parse_leak_policy() {
        assert_eq!(parse_leak_policy("assert").unwrap(), LeakPolicy::Assert);
        assert_eq!(parse_leak_policy(" LOG ").unwrap(), LeakPolicy::LogAndCancel);
        assert_eq!(
            parse_leak_policy("silent_cancel").unwrap(),
            LeakPolicy::SilentCancel
        );
        assert!(parse_leak_policy("explode").is_err());
    }

    #[test]
    fn test_parse_mailbox_policy() {
        assert_eq!(
            parse_mailbox_policy("unbounded").unwrap(),
            BufferPolicy::Unbounded
        );
        assert_eq!(
            parse_mailbox_policy("oldest:4").unwrap(),
            BufferPolicy::BufferingOldest(4)
        );
        assert_eq!(
            parse_mailbox_policy("newest:16").unwrap(),
            BufferPolicy::BufferingNewest(16)
        );
        assert!(parse_mailbox_policy("newest").is_err());
        assert!(parse_mailbox_policy("latest:3").is_err());
        assert!(parse_mailbox_policy("oldest:many").is_err());
    }
}
