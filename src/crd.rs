use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub const CERT_MANAGER_GROUP: &str = "cert-manager.io";
pub const CERT_MANAGER_NAMESPACE: &str = "cert-manager";

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
pub struct ObjectReference {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
pub struct CertificateRequestCondition {
    #[serde(rename = "type")]
    pub type__: String,
    pub status: String,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(rename = "lastTransitionTime", default)]
    pub last_transition_time: Option<String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
pub struct CertificateRequestStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<CertificateRequestCondition>,
    /// base64 PEM of the signed certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate: Option<String>,
    /// base64 PEM of the signing CA
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca: Option<String>,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema)]
#[kube(group = "cert-manager.io", version = "v1", kind = "CertificateRequest")]
#[kube(namespaced)]
#[kube(status = "CertificateRequestStatus")]
#[serde(rename_all = "camelCase")]
pub struct CertificateRequestSpec {
    /// base64 PEM encoded CSR
    pub request: String,
    #[serde(rename = "isCA", default)]
    pub is_ca: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,
    pub issuer_ref: ObjectReference,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,
}

impl CertificateRequest {
    /// The issuer has written a certificate back
    pub fn is_signed(&self) -> bool {
        self.signed_certificate().is_some()
    }

    pub fn signed_certificate(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.certificate.as_deref())
            .filter(|c| !c.is_empty())
    }

    pub fn ca_certificate(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.ca.as_deref())
            .filter(|c| !c.is_empty())
    }
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct CaIssuer {
    pub secret_name: String,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema)]
#[kube(group = "cert-manager.io", version = "v1", kind = "ClusterIssuer")]
pub struct ClusterIssuerSpec {
    pub ca: CaIssuer,
}

#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema)]
#[kube(group = "networking.istio.io", version = "v1beta1", kind = "ProxyConfig")]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfigSpec {
    #[serde(default)]
    pub environment_variables: BTreeMap<String, String>,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
pub struct PatchTarget {
    pub name: String,
    pub namespace: String,
    #[serde(rename = "type")]
    pub type__: String,
}

#[derive(Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema, Default)]
pub struct PatchEntry {
    pub key: String,
    /// YAML document merged into `key`
    pub value: String,
}

/// Configuration patch applied by the cluster's config agent
#[derive(CustomResource, Serialize, Deserialize, Clone, PartialEq, Debug, JsonSchema)]
#[kube(group = "k8s.plugin.opnfv.org", version = "v1alpha1", kind = "Config")]
#[kube(namespaced)]
pub struct ConfigSpec {
    pub resources: PatchTarget,
    #[serde(default)]
    pub patch: Vec<PatchEntry>,
}

/// The plugin's `Config` kind, named for what it carries
pub type ConfigPatch = Config;
