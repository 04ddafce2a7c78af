//! Request data model
//!
//! The three request kinds the service accepts, plus the canonical build
//! fingerprint used by callers as a cache key.

use crate::platform::Platform;
use serde::{Deserialize, Serialize};

/// A source plugin to build into the core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Plugin {
    /// Fully qualified package import path
    pub package: String,

    /// Commit, tag, or branch to check out
    pub version: String,

    /// Display name; used for logging and fingerprints, never for builds
    #[serde(skip)]
    pub name: String,

    /// Stable identifier assigned by the caller's catalog; not used here
    #[serde(skip)]
    pub id: String,
}

/// A core version plus the plugins to build into it
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Core version; the tracking branch "master" when empty
    #[serde(default)]
    pub core_version: String,

    #[serde(default)]
    pub plugins: Vec<Plugin>,
}

/// A request for one build of the core
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildRequest {
    #[serde(flatten)]
    pub platform: Platform,

    #[serde(flatten)]
    pub config: BuildConfig,
}

impl BuildRequest {
    /// Deterministic string form of this request: like a hash, but
    /// reversible and conveniently sortable.
    ///
    /// Plugin names are lowercased and sorted, so two requests with the
    /// same plugin set serialize identically regardless of order or
    /// case. Plugin versions are intentionally omitted — a documented
    /// limitation of the format.
    pub fn serialize(&self) -> String {
        let mut names: Vec<String> = self
            .config
            .plugins
            .iter()
            .map(|p| p.name.to_lowercase())
            .collect();
        names.sort();
        format!(
            "{}:{}.{}.{}:{}",
            self.config.core_version,
            self.platform.os,
            self.platform.arch,
            self.platform.arm,
            names.join(",")
        )
    }
}

/// A request to promote a new core or plugin version into the master
/// cache. A core deploy carries only `core_version`; a plugin deploy
/// names the plugin package and version and the platforms it must build
/// on.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    /// The version of the core to verify against
    #[serde(default)]
    pub core_version: String,

    #[serde(default)]
    pub plugin_package: String,

    #[serde(default)]
    pub plugin_version: String,

    #[serde(default)]
    pub required_platforms: Vec<Platform>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plugin(name: &str) -> Plugin {
        Plugin {
            package: format!("example.com/{}", name.to_lowercase()),
            version: "v1.0.0".to_string(),
            name: name.to_string(),
            id: String::new(),
        }
    }

    fn request(core: &str, os: &str, arch: &str, arm: &str, plugins: Vec<Plugin>) -> BuildRequest {
        BuildRequest {
            platform: Platform {
                os: os.to_string(),
                arch: arch.to_string(),
                arm: arm.to_string(),
                cgo: false,
            },
            config: BuildConfig {
                core_version: core.to_string(),
                plugins,
            },
        }
    }

    #[test]
    fn serialize_layout() {
        let req = request("master", "linux", "arm", "7", vec![plugin("alpha")]);
        assert_eq!(req.serialize(), "master:linux.arm.7:alpha");
    }

    #[test]
    fn serialize_sorts_and_lowercases_names() {
        let a = request("v1", "linux", "amd64", "", vec![plugin("Beta"), plugin("alpha")]);
        let b = request("v1", "linux", "amd64", "", vec![plugin("ALPHA"), plugin("beta")]);
        assert_eq!(a.serialize(), b.serialize());
        assert_eq!(a.serialize(), "v1:linux.amd64.:alpha,beta");
    }

    #[test]
    fn serialize_ignores_versions() {
        let mut a = request("v1", "linux", "amd64", "", vec![plugin("alpha")]);
        let mut b = request("v1", "linux", "amd64", "", vec![plugin("alpha")]);
        a.config.plugins[0].version = "v1.0.0".to_string();
        b.config.plugins[0].version = "v2.0.0".to_string();
        assert_eq!(a.serialize(), b.serialize());
    }

    #[test]
    fn serialize_distinguishes_platforms_and_versions() {
        let a = request("v1", "linux", "amd64", "", vec![]);
        let b = request("v1", "darwin", "amd64", "", vec![]);
        let c = request("v2", "linux", "amd64", "", vec![]);
        assert_ne!(a.serialize(), b.serialize());
        assert_ne!(a.serialize(), c.serialize());
        assert_eq!(a.serialize(), "v1:linux.amd64.:");
    }

    #[test]
    fn build_request_json_is_flat() {
        let req: BuildRequest = serde_json::from_str(
            r#"{
                "GOOS": "linux",
                "GOARCH": "amd64",
                "core_version": "master",
                "plugins": [{"package": "example.com/x", "version": "v1"}]
            }"#,
        )
        .unwrap();
        assert_eq!(req.platform.os, "linux");
        assert_eq!(req.config.core_version, "master");
        assert_eq!(req.config.plugins[0].package, "example.com/x");
    }

    #[test]
    fn deploy_request_defaults() {
        let req: DeployRequest = serde_json::from_str(r#"{"core_version": "master"}"#).unwrap();
        assert!(req.plugin_package.is_empty());
        assert!(req.required_platforms.is_empty());
    }
}
