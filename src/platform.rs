//! Build-target platform catalog
//!
//! The toolchain enumerates the `{os, arch}` pairs it can cross-compile
//! for; this module expands ARM into its sub-revisions, removes the
//! combinations known to be broken, and serves the result to clients.

use crate::error::{SmithError, SmithResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A build target. Field names match `go tool dist list -json` output,
/// and the values are what GOOS/GOARCH/GOARM are set to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Platform {
    #[serde(rename = "GOOS", default)]
    pub os: String,

    #[serde(rename = "GOARCH", default)]
    pub arch: String,

    /// ARM sub-revision ("5", "6", or "7"); meaningful only when
    /// `arch == "arm"`. Not emitted by the toolchain; filled in by
    /// [`supported_platforms`].
    #[serde(rename = "GOARM", default)]
    pub arm: String,

    #[serde(rename = "CgoSupported", default)]
    pub cgo: bool,
}

impl Platform {
    /// True when both required fields are present
    pub fn is_complete(&self) -> bool {
        !self.os.is_empty() && !self.arch.is_empty()
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}{}", self.os, self.arch, self.arm)
    }
}

/// Platforms we do not build for. A denylist entry matches a candidate
/// when every non-empty field equals the candidate's corresponding
/// field. Treated as configuration; revisit as toolchains improve.
pub fn unsupported_platforms() -> Vec<Platform> {
    let entry = |os: &str, arch: &str| Platform {
        os: os.to_string(),
        arch: arch.to_string(),
        ..Platform::default()
    };
    vec![
        entry("android", ""),      // linker errors
        entry("darwin", "arm"),    // runtime TLS fallback undefined; ARM7 clang flag errors
        entry("darwin", "arm64"),  // linker errors
        entry("linux", "s390x"),   // crypto dependency fails to compile
        entry("nacl", ""),         // syscall-related compile errors in the core
        entry("plan9", ""),        // syscall-related compile errors in the core
    ]
}

/// Enumerate the platforms the toolchain can target, minus the denylist.
///
/// Runs `go tool dist list -json`, expands every bare `arm` entry into
/// ARM 5/6/7, then drops entries matching `skip` and ARMv5 on any OS
/// other than linux (a known toolchain limitation).
pub async fn supported_platforms(skip: &[Platform]) -> SmithResult<Vec<Platform>> {
    let output = tokio::process::Command::new("go")
        .args(["tool", "dist", "list", "-json"])
        .output()
        .await
        .map_err(|e| SmithError::CommandSpawn {
            command: "go tool dist list -json".to_string(),
            source: e,
        })?;
    if !output.status.success() {
        return Err(SmithError::CommandFailed {
            command: "go tool dist list -json".to_string(),
            workdir: String::new(),
            status: output.status.code().unwrap_or(-1),
        });
    }

    let platforms: Vec<Platform> = serde_json::from_slice(&output.stdout)?;
    Ok(filter_platforms(expand_arm(platforms), skip))
}

/// Replace each bare `arm` entry with the three ARM sub-revisions
pub fn expand_arm(platforms: Vec<Platform>) -> Vec<Platform> {
    let mut expanded = Vec::with_capacity(platforms.len() + 4);
    for p in platforms {
        if p.arch == "arm" && p.arm.is_empty() {
            for revision in ["5", "6", "7"] {
                expanded.push(Platform {
                    arm: revision.to_string(),
                    ..p.clone()
                });
            }
        } else {
            expanded.push(p);
        }
    }
    expanded
}

/// Remove every platform matching a denylist entry, plus ARMv5 anywhere
/// but linux
pub fn filter_platforms(platforms: Vec<Platform>, skip: &[Platform]) -> Vec<Platform> {
    platforms
        .into_iter()
        .filter(|p| {
            if p.arm == "5" && p.os != "linux" {
                return false;
            }
            !skip.iter().any(|unsup| {
                (unsup.os.is_empty() || unsup.os == p.os)
                    && (unsup.arch.is_empty() || unsup.arch == p.arch)
                    && (unsup.arm.is_empty() || unsup.arm == p.arm)
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn plat(os: &str, arch: &str, arm: &str, cgo: bool) -> Platform {
        Platform {
            os: os.to_string(),
            arch: arch.to_string(),
            arm: arm.to_string(),
            cgo,
        }
    }

    #[test]
    fn parses_dist_list_json() {
        let raw = r#"[
            {"GOOS":"linux","GOARCH":"amd64","CgoSupported":true},
            {"GOOS":"linux","GOARCH":"arm","CgoSupported":true,"FirstClass":false}
        ]"#;
        let platforms: Vec<Platform> = serde_json::from_str(raw).unwrap();
        assert_eq!(platforms[0], plat("linux", "amd64", "", true));
        assert_eq!(platforms[1].arch, "arm");
        assert!(platforms[1].arm.is_empty());
    }

    #[test]
    fn arm_expands_to_three_revisions() {
        let expanded = expand_arm(vec![
            plat("linux", "amd64", "", true),
            plat("linux", "arm", "", true),
        ]);
        assert_eq!(expanded.len(), 4);
        assert_eq!(expanded[1], plat("linux", "arm", "5", true));
        assert_eq!(expanded[2], plat("linux", "arm", "6", true));
        assert_eq!(expanded[3], plat("linux", "arm", "7", true));
    }

    #[test]
    fn arm_with_revision_is_untouched() {
        let expanded = expand_arm(vec![plat("linux", "arm", "7", true)]);
        assert_eq!(expanded, vec![plat("linux", "arm", "7", true)]);
    }

    #[test]
    fn denylist_matches_on_nonempty_fields() {
        let kept = filter_platforms(
            vec![
                plat("linux", "amd64", "", true),
                plat("android", "arm64", "", true),
                plat("darwin", "arm64", "", true),
                plat("darwin", "amd64", "", true),
                plat("plan9", "386", "", false),
            ],
            &unsupported_platforms(),
        );
        assert_eq!(
            kept,
            vec![plat("linux", "amd64", "", true), plat("darwin", "amd64", "", true)]
        );
    }

    #[test]
    fn armv5_survives_only_on_linux() {
        let kept = filter_platforms(
            vec![
                plat("linux", "arm", "5", true),
                plat("freebsd", "arm", "5", true),
                plat("freebsd", "arm", "6", true),
            ],
            &[],
        );
        assert_eq!(
            kept,
            vec![plat("linux", "arm", "5", true), plat("freebsd", "arm", "6", true)]
        );
    }

    #[test]
    fn no_catalog_entry_matches_the_denylist() {
        let catalog = filter_platforms(
            expand_arm(vec![
                plat("linux", "amd64", "", true),
                plat("linux", "arm", "", true),
                plat("darwin", "arm", "", false),
                plat("nacl", "amd64p32", "", false),
            ]),
            &unsupported_platforms(),
        );
        for p in &catalog {
            for unsup in unsupported_platforms() {
                let all_match = (unsup.os.is_empty() || unsup.os == p.os)
                    && (unsup.arch.is_empty() || unsup.arch == p.arch)
                    && (unsup.arm.is_empty() || unsup.arm == p.arm);
                assert!(!all_match, "{p} matches denylist entry {unsup}");
            }
        }
    }

    #[test]
    fn display_format() {
        assert_eq!(plat("linux", "arm", "7", true).to_string(), "linux/arm7");
        assert_eq!(plat("darwin", "amd64", "", true).to_string(), "darwin/amd64");
    }
}
