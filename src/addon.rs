//! The addon resource and the identities derived from it.

use std::{fmt, str::FromStr};

use kube::CustomResource;
use kube_core::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::{subscriber::QualifiedName, Error};

/// A managed addon instance on a cluster.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "addon.open-cluster-management.io",
    version = "v1alpha1",
    kind = "ManagedClusterAddOn",
    namespaced,
    status = "ManagedClusterAddOnStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnSpec {
    /// Namespace on the managed cluster the addon agent is installed into.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub install_namespace: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedClusterAddOnStatus {
    /// The configuration object the addon follows, once discovered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_reference: Option<ConfigReference>,
}

/// Points at a single configuration object of an arbitrary type.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConfigReference {
    /// API group, empty for the core group.
    #[serde(default)]
    pub group: String,
    /// API version. Empty until the reference has been discovered.
    #[serde(default)]
    pub version: String,
    /// Plural resource name.
    pub resource: String,
    /// Namespace of the object, empty when cluster scoped.
    #[serde(default)]
    pub namespace: String,
    pub name: String,
    /// The config object's generation as last seen by the config watcher.
    #[serde(default)]
    pub last_observed_generation: i64,
}

impl ConfigReference {
    /// Whether the type coordinates have been resolved.
    pub fn is_discovered(&self) -> bool {
        !self.version.is_empty()
    }

    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(format!(
            "{}/{}/{}/{}/{}",
            self.group, self.version, self.resource, self.namespace, self.name
        ))
    }
}

/// Canonical identity of the object a [`ConfigReference`] points at.
///
/// Two references share a fingerprint iff group, version, resource, namespace and name
/// are literally equal. The observed generation is not part of it.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl ManagedClusterAddOn {
    pub fn key(&self) -> AddonKey {
        AddonKey {
            namespace: self.namespace().unwrap_or_default(),
            name: self.name_any(),
        }
    }

    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    pub fn config_reference(&self) -> Option<&ConfigReference> {
        self.status.as_ref()?.config_reference.as_ref()
    }

    /// The reference a config watcher should currently follow, if any.
    ///
    /// `None` while the addon is being deleted or the reference is absent or undiscovered.
    pub fn desired_reference(&self) -> Option<&ConfigReference> {
        if self.is_deleting() {
            return None;
        }
        self.config_reference()
            .filter(|reference| reference.is_discovered())
    }
}

/// Work queue key of an addon, rendered as `namespace/name`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddonKey {
    pub namespace: String,
    pub name: String,
}

impl AddonKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for AddonKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl FromStr for AddonKey {
    type Err = Error;

    fn from_str(key: &str) -> Result<Self, Self::Err> {
        match key.split_once('/') {
            Some((namespace, name))
                if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
            {
                Ok(Self::new(namespace, name))
            }
            _ => Err(Error::InvalidKey(key.to_owned())),
        }
    }
}

impl From<AddonKey> for QualifiedName {
    fn from(key: AddonKey) -> Self {
        QualifiedName {
            namespace: Some(key.namespace),
            name: key.name,
        }
    }
}

impl From<&AddonKey> for QualifiedName {
    fn from(key: &AddonKey) -> Self {
        key.clone().into()
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    use super::*;

    fn reference(name: &str) -> ConfigReference {
        ConfigReference {
            group: "cfg.test".into(),
            version: "v1".into(),
            resource: "tests".into(),
            namespace: "ns1".into(),
            name: name.into(),
            last_observed_generation: 0,
        }
    }

    #[test]
    fn fingerprint_ignores_observed_generation() {
        let mut observed = reference("t");
        observed.last_observed_generation = 7;
        assert_eq!(reference("t").fingerprint(), observed.fingerprint());
        assert_eq!(reference("t").fingerprint().as_str(), "cfg.test/v1/tests/ns1/t");
    }

    #[test]
    fn fingerprint_tracks_every_coordinate() {
        let base = reference("t");
        let mut other_version = base.clone();
        other_version.version = "v2".into();
        let mut other_namespace = base.clone();
        other_namespace.namespace = "ns2".into();

        assert_ne!(base.fingerprint(), reference("u").fingerprint());
        assert_ne!(base.fingerprint(), other_version.fingerprint());
        assert_ne!(base.fingerprint(), other_namespace.fingerprint());
    }

    #[test]
    fn addon_key_parsing() {
        assert_eq!(
            "ns1/a1".parse::<AddonKey>().unwrap(),
            AddonKey::new("ns1", "a1")
        );
        assert_eq!(AddonKey::new("ns1", "a1").to_string(), "ns1/a1");

        for invalid in ["", "a1", "/a1", "ns1/", "ns1/a1/extra"] {
            let err = invalid.parse::<AddonKey>().unwrap_err();
            assert!(matches!(err, Error::InvalidKey(_)), "{invalid:?}");
            assert!(!err.is_retryable());
        }
    }

    #[test]
    fn desired_reference_requires_discovered_live_addon() {
        let mut addon = ManagedClusterAddOn::new("a1", ManagedClusterAddOnSpec::default());
        assert!(addon.desired_reference().is_none());

        let mut undiscovered = reference("t");
        undiscovered.version.clear();
        addon.status = Some(ManagedClusterAddOnStatus {
            config_reference: Some(undiscovered),
        });
        assert!(addon.desired_reference().is_none());

        addon.status = Some(ManagedClusterAddOnStatus {
            config_reference: Some(reference("t")),
        });
        assert_eq!(addon.desired_reference(), Some(&reference("t")));

        addon.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        assert!(addon.desired_reference().is_none());
    }
}
