use crate::error::{Result, TenantError};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::fmt;
use url::Url;

/// Internal numeric account identifier. Zero means "unset".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccountId(pub i64);

/// Identifies an external application (integration) registered with the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppId(pub i64);

/// Identifies one installation of an external application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstallId(pub i64);

macro_rules! impl_id {
    ($($ty:ident),*) => {$(
        impl $ty {
            pub fn is_set(&self) -> bool {
                self.0 != 0
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    )*};
}

impl_id!(AccountId, AppId, InstallId);

/// The secondary identification mode: an application plus one of its installations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct InstallPair {
    pub app_id: AppId,
    pub install_id: InstallId,
}

/// Identifies a lookup request or its result.
///
/// Either the primary mode (`account_id`) or the secondary mode (`app_id` + `install_id`)
/// may be set; both converge on the same account once resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct InstallationKey {
    #[serde(default)]
    pub account_id: AccountId,
    #[serde(default)]
    pub app_id: AppId,
    #[serde(default)]
    pub install_id: InstallId,
}

impl InstallationKey {
    pub fn by_account(account_id: i64) -> Self {
        Self {
            account_id: AccountId(account_id),
            ..Self::default()
        }
    }

    pub fn by_installation(app_id: i64, install_id: i64) -> Self {
        Self {
            app_id: AppId(app_id),
            install_id: InstallId(install_id),
            ..Self::default()
        }
    }

    pub fn account(&self) -> Option<AccountId> {
        self.account_id.is_set().then_some(self.account_id)
    }

    /// Returns the installation pair only when both halves are set.
    pub fn installation(&self) -> Option<InstallPair> {
        (self.app_id.is_set() && self.install_id.is_set()).then_some(InstallPair {
            app_id: self.app_id,
            install_id: self.install_id,
        })
    }

    pub fn validate(&self) -> Result<()> {
        if self.account().is_none() && self.installation().is_none() {
            return Err(TenantError::InvalidKey(format!(
                "neither account id nor installation pair is set: {self}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for InstallationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "account={} app={} install={}",
            self.account_id, self.app_id, self.install_id
        )
    }
}

/// A feature flag enabled for an account.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Feature(Cow<'static, str>);

impl Feature {
    /// Account lives on an enterprise instance rather than github.com.
    pub const GHE: Feature = Feature::from_static("athenian.github.ghe");
    /// Disables consistency checks for the account.
    pub const NO_CONSISTENCY: Feature = Feature::from_static("athenian.github.no_consistency");
    pub const NO_CI_CHECK_RUN: Feature = Feature::from_static("athenian.github.drop_node_type.CheckRun");
    pub const NO_CI_CHECK_SUITE: Feature =
        Feature::from_static("athenian.github.drop_node_type.CheckSuite");
    pub const NO_CI_STATUS: Feature = Feature::from_static("athenian.github.drop_node_type.Status");
    pub const NO_CI_STATUS_CHECK_ROLLUP: Feature =
        Feature::from_static("athenian.github.drop_node_type.StatusCheckRollup");
    pub const NO_CI_STATUS_CONTEXT: Feature =
        Feature::from_static("athenian.github.drop_node_type.StatusContext");

    pub const fn from_static(name: &'static str) -> Self {
        Self(Cow::Borrowed(name))
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self(Cow::Owned(name.into()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A deduplicated set of feature flags.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Features(BTreeSet<Feature>);

impl Features {
    pub fn is_set(&self, feature: &Feature) -> bool {
        self.0.contains(feature)
    }

    pub fn insert(&mut self, feature: Feature) -> bool {
        self.0.insert(feature)
    }

    /// Combines two sets into a new one; neither input is modified.
    pub fn merge(&self, other: &Features) -> Features {
        self.0.union(&other.0).cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Feature> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Feature> for Features {
    fn from_iter<I: IntoIterator<Item = Feature>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// The canonical resolved account.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct AccountRecord {
    pub key: InstallationKey,
    /// Installation used to fetch data for this account, if it differs from `key`.
    #[serde(default)]
    pub fetch_with: InstallId,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub features: Features,
}

impl AccountRecord {
    pub fn new(key: InstallationKey) -> Self {
        Self {
            key,
            active: true,
            ..Self::default()
        }
    }

    pub fn account_id(&self) -> AccountId {
        self.key.account_id
    }

    pub fn has_feature(&self, feature: &Feature) -> bool {
        self.features.is_set(feature)
    }

    /// Short account name, derived from the installation URL when `name` is empty.
    pub fn display_name(&self) -> String {
        if !self.name.is_empty() {
            return self.name.clone();
        }
        account_name_from_url(&self.url, "")
    }
}

/// Derives a short account name from an installation URL.
///
/// Personal installations yield `owner`. Organization installations yield the
/// organization, prefixed with the host for anything other than github.com.
/// Unparseable URLs yield an empty name.
pub fn account_name_from_url(addr: &str, owner: &str) -> String {
    const GITHUB: &str = "github.com";

    if addr.is_empty() {
        return owner.to_string();
    }
    let Ok(url) = Url::parse(addr) else {
        return String::new();
    };
    let host = match (url.host_str().unwrap_or_default(), url.port()) {
        (host, Some(port)) => format!("{host}:{port}"),
        (host, None) => host.to_string(),
    };
    let segments: Vec<&str> = url.path_segments().map(Iterator::collect).unwrap_or_default();

    if segments.len() < 2 {
        if host != GITHUB {
            return format!("{host}/{owner}").trim_end_matches('/').to_string();
        }
        return owner.to_string();
    }
    if segments[0] != "organizations" {
        return owner.to_string();
    }
    if host != GITHUB {
        return format!("{host}/{}", segments[1]);
    }
    segments[1].to_string()
}
