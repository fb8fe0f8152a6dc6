//! The two ways of getting a build to the backend.
//!
//! [`DirectHttpTransport`] streams the artifact itself; [`SubprocessTransport`]
//! hands it to the prebuilt Waldo CLI. Both return the backend's build id.

use enum_iterator::IntoEnumIterator;
use serde::{
    Deserialize,
    Serialize,
};
use std::str::FromStr;

use crate::error::UploadError;
use crate::resolver::{
    Platform,
    UploadRequest,
};

pub mod direct;
pub mod subprocess;

pub use direct::DirectHttpTransport;
pub use subprocess::SubprocessTransport;

/// Identifier the backend assigns to an uploaded build.
#[derive(Debug, Clone, PartialEq, Eq, Hash, derive_more::Display, derive_more::From)]
pub struct BuildId(String);

impl BuildId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SymbolsOutcome {
    Uploaded,
    /// Requested, but there was nothing to send.
    NothingFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub build_id: BuildId,
    pub symbols: Option<SymbolsOutcome>,
}

/// Who is calling, as reported to the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperInfo {
    pub name: String,
    pub version: String,
}

impl Default for WrapperInfo {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_owned(),
            version: env!("CARGO_PKG_VERSION").to_owned(),
        }
    }
}

impl WrapperInfo {
    pub const NAME_OVERRIDE: &'static str = "WALDO_WRAPPER_NAME_OVERRIDE";
    pub const VERSION_OVERRIDE: &'static str = "WALDO_WRAPPER_VERSION_OVERRIDE";

    /// Defaults, replaced by the override variables when set.
    pub fn from_env(env: crate::metadata::EnvLookup<'_>) -> Self {
        let default = Self::default();
        let pick = |key: &str, fallback: String| {
            env(key)
                .filter(|value| !value.trim().is_empty())
                .unwrap_or(fallback)
        };
        Self {
            name: pick(Self::NAME_OVERRIDE, default.name),
            version: pick(Self::VERSION_OVERRIDE, default.version),
        }
    }

    pub fn user_agent(&self, platform: Platform) -> String {
        format!("Waldo {}/{} v{}", self.name, platform.flavor(), self.version)
    }
}

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, IntoEnumIterator,
)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    Cli,
}

impl FromStr for TransportKind {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        matched_variant!(Self, s)
    }
}

#[async_trait::async_trait]
pub trait ArtifactTransport: Send + Sync {
    /// Uploads the build and, when requested, its symbols.
    async fn upload(&self, request: &UploadRequest) -> Result<UploadReport, UploadError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn user_agent_names_wrapper_flavor_and_version() {
        let wrapper = WrapperInfo {
            name: "fastlane".into(),
            version: "2.1.0".into(),
        };
        assert_eq!(
            wrapper.user_agent(Platform::Ios),
            "Waldo fastlane/iOS v2.1.0"
        );
        assert_eq!(
            wrapper.user_agent(Platform::Android),
            "Waldo fastlane/Android v2.1.0"
        );
    }

    #[test]
    fn overrides_replace_defaults() {
        let env = |key: &str| match key {
            WrapperInfo::NAME_OVERRIDE => Some("bitrise".to_string()),
            WrapperInfo::VERSION_OVERRIDE => Some(" ".to_string()),
            _ => None,
        };
        let wrapper = WrapperInfo::from_env(&env);
        assert_eq!(wrapper.name, "bitrise");
        assert_eq!(wrapper.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn transport_kind_parses() -> eyre::Result<()> {
        assert_eq!("http".parse::<TransportKind>()?, TransportKind::Http);
        assert_eq!("cli".parse::<TransportKind>()?, TransportKind::Cli);
        assert!("ftp".parse::<TransportKind>().is_err());
        Ok(())
    }
}
