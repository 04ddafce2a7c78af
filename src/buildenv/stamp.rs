//! Version stamping for release binaries
//!
//! The core exposes string variables that record exactly what was built;
//! this module collects them from the VCS checkout and renders the
//! `-ldflags` argument that injects them. Six fields: build timestamp,
//! exact tag on HEAD (if any), nearest reachable tag, short commit hash,
//! uncommitted-change summary, and the list of modified files.

use crate::config::core;
use crate::error::{SmithError, SmithResult};
use std::path::Path;
use tokio::process::Command;

/// Timestamp layout embedded in binaries, e.g. `Wed Nov 02 15:04:05 UTC 2016`
const BUILD_DATE_FORMAT: &str = "%a %b %d %H:%M:%S UTC %Y";

/// Compose the `-ldflags` value for a build of the checkout at
/// `repo_path`, injecting the six version-stamp variables into the
/// core's version package.
pub async fn make_ldflags(repo_path: &Path) -> SmithResult<String> {
    let mut flags = Vec::with_capacity(6);

    let build_date = chrono::Utc::now().format(BUILD_DATE_FORMAT).to_string();
    flags.push(ldflag("buildDate", &build_date));

    // HEAD may not be at a tag; absence is not an error
    let git_tag = git(repo_path, &["describe", "--exact-match", "HEAD"], true).await?;
    flags.push(ldflag("gitTag", &git_tag));

    let nearest = git(repo_path, &["describe", "--abbrev=0", "--tags", "HEAD"], false).await?;
    flags.push(ldflag("gitNearestTag", &nearest));

    let commit = git(repo_path, &["rev-parse", "--short", "HEAD"], false).await?;
    flags.push(ldflag("gitCommit", &commit));

    let shortstat = git(repo_path, &["diff-index", "--shortstat", "HEAD"], false).await?;
    flags.push(ldflag("gitShortStat", &shortstat));

    let modified = git(repo_path, &["diff-index", "--name-only", "HEAD"], false).await?;
    flags.push(ldflag("gitFilesModified", &modified));

    Ok(flags.join(" "))
}

fn ldflag(name: &str, value: &str) -> String {
    format!("-X \"{}.{}={}\"", core::VERSION_PACKAGE, name, value)
}

/// Run git in `repo_path` capturing trimmed stdout. With `ignore_error`,
/// a failing command yields an empty value instead of an error.
async fn git(repo_path: &Path, args: &[&str], ignore_error: bool) -> SmithResult<String> {
    let command_line = format!("git {}", args.join(" "));
    let output = Command::new("git")
        .args(args)
        .current_dir(repo_path)
        .output()
        .await
        .map_err(|e| SmithError::CommandSpawn {
            command: command_line.clone(),
            source: e,
        })?;

    if !output.status.success() && !ignore_error {
        return Err(SmithError::CommandFailed {
            command: command_line,
            workdir: repo_path.display().to_string(),
            status: output.status.code().unwrap_or(-1),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ldflag_shape() {
        let flag = ldflag("gitCommit", "abc1234");
        assert_eq!(
            flag,
            format!("-X \"{}.gitCommit=abc1234\"", core::VERSION_PACKAGE)
        );
    }

    #[test]
    fn build_date_format_matches_layout() {
        let rendered = chrono::Utc::now().format(BUILD_DATE_FORMAT).to_string();
        // e.g. "Wed Nov 02 15:04:05 UTC 2016"
        assert_eq!(rendered.split(' ').count(), 6);
        assert!(rendered.contains("UTC"));
    }
}
