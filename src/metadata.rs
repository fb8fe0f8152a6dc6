//! Git metadata attached to an upload: branch, commit and recent history.
//!
//! CI providers export the branch and commit through environment variables, so
//! those are consulted before falling back to the `git` executable.

use std::path::Path;
use std::process::Command;

use eyre::{
    Result,
    WrapErr,
};
use serde::Serialize;
use tracing::instrument;

#[allow(unused_imports)]
use tracing::{
    debug,
    trace,
    warn,
};

/// How many commits are sent as build history.
pub const HISTORY_DEPTH: usize = 50;

const BRANCH_VARIABLES: &[&str] = &[
    "GITHUB_HEAD_REF",
    "GITHUB_REF_NAME",
    "BITRISE_GIT_BRANCH",
    "CIRCLE_BRANCH",
    "CI_COMMIT_REF_NAME",
];

const COMMIT_VARIABLES: &[&str] = &[
    "GITHUB_SHA",
    "BITRISE_GIT_COMMIT",
    "CIRCLE_SHA1",
    "CI_COMMIT_SHA",
];

/// Environment lookup, injectable so tests don't depend on the process environment.
pub type EnvLookup<'a> = &'a dyn Fn(&str) -> Option<String>;

pub fn process_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn fix_newlines(val: &str) -> String {
    val.trim_end_matches("\r\n")
        .trim_end_matches("\n\r")
        .trim_end_matches('\r')
        .trim_end_matches('\n')
        .trim_end_matches('\r')
        .trim_end_matches('\n')
        .to_string()
        .replace('\r', "")
}

#[cfg(target_os = "windows")]
pub fn decode_command_output(bytes: &[u8]) -> Result<String> {
    use encoding::Encoding;
    match encoding::all::WINDOWS_1252.decode(bytes, encoding::DecoderTrap::Ignore) {
        Ok(v) => Ok(fix_newlines(&v)),
        Err(e) => Err(eyre::eyre!("failed to decode windows output :: {:?}", e)),
    }
}

#[cfg(not(target_os = "windows"))]
pub fn decode_command_output(bytes: &[u8]) -> Result<String> {
    String::from_utf8(bytes.to_vec())
        .wrap_err("failed to decode command output")
        .map(|s| fix_newlines(&s))
}

/// Reason the commit history could not be collected, sent as `historyError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HistoryError {
    NoGitCommandFound,
    NotGitRepository,
    GitLogFailed,
}

impl HistoryError {
    pub fn code(&self) -> &'static str {
        serde_variant::to_variant_name(self).unwrap_or("gitLogFailed")
    }
}

fn first_non_empty(env: EnvLookup<'_>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| env(key))
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
}

fn git(dir: &Path, args: &[&str]) -> Result<String> {
    let out = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .wrap_err_with(|| format!("running git {}", args.join(" ")))?;
    if !out.status.success() {
        eyre::bail!(
            "git {} failed: {}",
            args.join(" "),
            decode_command_output(&out.stderr).unwrap_or_default()
        );
    }
    decode_command_output(&out.stdout)
}

#[instrument(ret, level = "debug", skip(env))]
pub fn current_branch(dir: &Path, env: EnvLookup<'_>) -> Option<String> {
    if let Some(branch) = first_non_empty(env, BRANCH_VARIABLES) {
        return Some(branch);
    }
    match git(dir, &["rev-parse", "--abbrev-ref", "HEAD"]) {
        // detached checkouts report the literal "HEAD"
        Ok(branch) if branch.is_empty() || branch == "HEAD" => None,
        Ok(branch) => Some(branch),
        Err(e) => {
            debug!("no branch from git: {e:?}");
            None
        }
    }
}

#[instrument(ret, level = "debug", skip(env))]
pub fn current_commit(dir: &Path, env: EnvLookup<'_>) -> Option<String> {
    if let Some(commit) = first_non_empty(env, COMMIT_VARIABLES) {
        return Some(commit);
    }
    match git(dir, &["rev-parse", "HEAD"]) {
        Ok(commit) if commit.is_empty() => None,
        Ok(commit) => Some(commit),
        Err(e) => {
            debug!("no commit from git: {e:?}");
            None
        }
    }
}

#[instrument(level = "debug")]
pub fn commit_history(dir: &Path) -> std::result::Result<Vec<String>, HistoryError> {
    let depth = format!("-{HISTORY_DEPTH}");
    let out = match Command::new("git")
        .args(["log", "--format=%H", depth.as_str()])
        .current_dir(dir)
        .output()
    {
        Ok(out) => out,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(HistoryError::NoGitCommandFound)
        }
        Err(e) => {
            warn!("git log could not be started: {e}");
            return Err(HistoryError::GitLogFailed);
        }
    };
    if !out.status.success() {
        let stderr = decode_command_output(&out.stderr).unwrap_or_default();
        trace!(%stderr, "git log failed");
        return Err(if stderr.contains("not a git repository") {
            HistoryError::NotGitRepository
        } else {
            HistoryError::GitLogFailed
        });
    }
    let text = decode_command_output(&out.stdout).map_err(|_| HistoryError::GitLogFailed)?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_owned)
        .collect())
}

/// Base64 of the JSON array of commit SHAs, as carried by the `history` query parameter.
pub fn encode_history(history: &[String]) -> Result<String> {
    let json = serde_json::to_vec(history).wrap_err("serializing history")?;
    Ok(data_encoding::BASE64.encode(&json))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn command_output_loses_trailing_newlines() -> Result<()> {
        assert_eq!(decode_command_output(b"main\r\n")?, "main");
        assert_eq!(decode_command_output(b"a\nb\n")?, "a\nb");
        Ok(())
    }

    #[test]
    fn branch_prefers_first_non_empty_ci_variable() {
        let env = env_of(&[
            ("GITHUB_HEAD_REF", ""),
            ("GITHUB_REF_NAME", "feature/login"),
            ("CIRCLE_BRANCH", "other"),
        ]);
        assert_eq!(
            current_branch(Path::new("."), &env),
            Some("feature/login".to_string())
        );
    }

    #[test]
    fn commit_comes_from_ci_variable() {
        let env = env_of(&[("BITRISE_GIT_COMMIT", " 0123abcd ")]);
        assert_eq!(
            current_commit(Path::new("."), &env),
            Some("0123abcd".to_string())
        );
    }

    #[test]
    fn history_error_codes() {
        assert_eq!(HistoryError::NoGitCommandFound.code(), "noGitCommandFound");
        assert_eq!(HistoryError::NotGitRepository.code(), "notGitRepository");
        assert_eq!(HistoryError::GitLogFailed.code(), "gitLogFailed");
    }

    #[test]
    fn history_outside_repository_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let err = commit_history(dir.path()).expect_err("temp dir is not a repository");
        assert!(matches!(
            err,
            HistoryError::NotGitRepository | HistoryError::NoGitCommandFound
        ));
        Ok(())
    }

    #[test]
    fn history_is_base64_json() -> Result<()> {
        let encoded = encode_history(&["abc".to_string(), "def".to_string()])?;
        let decoded = data_encoding::BASE64.decode(encoded.as_bytes())?;
        assert_eq!(String::from_utf8(decoded)?, r#"["abc","def"]"#);
        Ok(())
    }
}
