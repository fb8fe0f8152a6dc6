//! Turns loosely collected parameters into one validated [`UploadRequest`].

use std::fmt;
use std::fs;
use std::path::{
    Path,
    PathBuf,
};
use std::str::FromStr;
use std::time::SystemTime;

use enum_iterator::IntoEnumIterator;
use itertools::Itertools;
use serde::{
    Deserialize,
    Serialize,
};
use walkdir::WalkDir;

#[allow(unused_imports)]
use tracing::{
    debug,
    info,
    trace,
    warn,
};

use crate::error::ValidationError;
use crate::metadata::{
    self,
    EnvLookup,
    HistoryError,
};

/// Where gradle drops assembled APKs, relative to the project root.
pub const GRADLE_APK_OUTPUT_DIR: &str = "app/build/outputs/apk";

#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, IntoEnumIterator,
)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Android,
    Ios,
}

impl FromStr for Platform {
    type Err = eyre::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        matched_variant!(Self, s)
    }
}

impl Platform {
    /// Platform name as it appears in the user agent.
    pub fn flavor(&self) -> &'static str {
        match self {
            Platform::Android => "Android",
            Platform::Ios => "iOS",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactKind {
    Apk,
    AppBundle,
    Ipa,
}

impl ArtifactKind {
    fn describe(&self) -> &'static str {
        match self {
            ArtifactKind::Apk => "APK",
            ArtifactKind::AppBundle => "app bundle",
            ArtifactKind::Ipa => "IPA",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Symbols {
    /// An explicit dSYM directory or zip.
    Path(PathBuf),
    /// Whatever dSYMs sit next to the app bundle.
    Bundled,
}

/// The upload token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct UploadToken(String);

impl UploadToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for UploadToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("UploadToken(***)")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum History {
    Commits(Vec<String>),
    Unavailable(HistoryError),
    Skipped,
}

/// Everything one invocation needs, resolved once and passed by reference afterwards.
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub platform: Platform,
    pub artifact: Artifact,
    pub token: UploadToken,
    pub variant_name: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
    pub application_id: Option<String>,
    pub package_name: Option<String>,
    pub symbols: Option<Symbols>,
    pub history: History,
}

/// Parameters as collected from flags, environment and config file.
#[derive(Debug, Clone, Default)]
pub struct RawParams {
    pub apk_path: Option<String>,
    pub app_path: Option<String>,
    pub ipa_path: Option<String>,
    pub dsym_path: Option<String>,
    pub include_symbols: bool,
    pub upload_token: Option<String>,
    /// Older credential, used when no upload token is given.
    pub api_key: Option<String>,
    pub application_id: Option<String>,
    pub package_name: Option<String>,
    pub variant_name: Option<String>,
    pub git_branch: Option<String>,
    pub git_commit: Option<String>,
}

pub struct ResolveContext<'a> {
    pub working_dir: PathBuf,
    pub platform: Option<Platform>,
    pub env: EnvLookup<'a>,
    /// Collect git history for the `history` query parameter.
    pub collect_history: bool,
}

/// Shells hand us `My\ App.ipa` verbatim when paths are quoted twice.
pub fn unescape_path(raw: &str) -> String {
    raw.replace("\\ ", " ")
}

fn modified(path: &Path) -> Option<SystemTime> {
    fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn display_time(t: Option<SystemTime>) -> String {
    t.and_then(|t| {
        time::OffsetDateTime::from(t)
            .format(&time::format_description::well_known::Rfc3339)
            .ok()
    })
    .unwrap_or_else(|| "unknown".to_owned())
}

/// Existence first, then recency: the newer of the two wins, ties go to the app bundle.
pub fn pick_app_or_ipa(app: PathBuf, ipa: PathBuf) -> Artifact {
    let app_artifact = |path| Artifact {
        kind: ArtifactKind::AppBundle,
        path,
    };
    let ipa_artifact = |path| Artifact {
        kind: ArtifactKind::Ipa,
        path,
    };
    if !app.exists() {
        debug!("{} does not exist, using IPA", app.display());
        return ipa_artifact(ipa);
    }
    if !ipa.exists() {
        debug!("{} does not exist, using app bundle", ipa.display());
        return app_artifact(app);
    }
    let (app_time, ipa_time) = (modified(&app), modified(&ipa));
    debug!(
        "app modified {} / ipa modified {}",
        display_time(app_time),
        display_time(ipa_time)
    );
    match (app_time, ipa_time) {
        (Some(a), Some(i)) if a < i => {
            info!("IPA is newer than app bundle, ignoring {}", app.display());
            ipa_artifact(ipa)
        }
        _ => {
            info!("app bundle is newer than IPA, ignoring {}", ipa.display());
            app_artifact(app)
        }
    }
}

fn has_extension(path: &Path, ext: &str) -> bool {
    path.extension()
        .map(|e| e.to_string_lossy().eq_ignore_ascii_case(ext))
        .unwrap_or(false)
}

/// Most recently modified `*.ipa` / `*.apk` in the conventional places.
pub fn discover(platform: Platform, dir: &Path) -> Option<PathBuf> {
    let (ext, roots): (&str, Vec<(PathBuf, usize)>) = match platform {
        Platform::Ios => ("ipa", vec![(dir.to_path_buf(), 1)]),
        Platform::Android => (
            "apk",
            vec![
                (dir.to_path_buf(), 1),
                (dir.join(GRADLE_APK_OUTPUT_DIR), usize::MAX),
            ],
        ),
    };
    let candidates = roots
        .into_iter()
        .filter(|(root, _)| root.is_dir())
        .flat_map(|(root, depth)| {
            WalkDir::new(root)
                .max_depth(depth)
                .into_iter()
                .filter_map(|entry| entry.ok())
                .filter(|entry| entry.file_type().is_file())
                .map(|entry| entry.into_path())
                .filter(|path| has_extension(path, ext))
                .collect_vec()
        })
        .unique()
        .collect_vec();
    debug!(
        "discovered {} candidates: [{}]",
        candidates.len(),
        candidates.iter().map(|p| p.display()).join(", ")
    );
    candidates
        .into_iter()
        .filter_map(|path| modified(&path).map(|t| (t, path)))
        .max_by_key(|(t, _)| *t)
        .map(|(_, path)| path)
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn check_readable(artifact: &Artifact) -> Result<(), ValidationError> {
    let unreadable = |reason: String| ValidationError::UnreadableFile {
        path: artifact.path.clone(),
        reason,
    };
    let meta = fs::metadata(&artifact.path).map_err(|e| unreadable(e.to_string()))?;
    match artifact.kind {
        ArtifactKind::AppBundle if !meta.is_dir() => {
            Err(unreadable("app bundle must be a directory".to_owned()))
        }
        ArtifactKind::Apk | ArtifactKind::Ipa if !meta.is_file() => Err(unreadable(format!(
            "{} must be a regular file",
            artifact.kind.describe()
        ))),
        ArtifactKind::Apk | ArtifactKind::Ipa => fs::File::open(&artifact.path)
            .map(drop)
            .map_err(|e| unreadable(e.to_string())),
        ArtifactKind::AppBundle => Ok(()),
    }
}

fn select_artifact(
    platform: Platform,
    apk: Option<PathBuf>,
    app: Option<PathBuf>,
    ipa: Option<PathBuf>,
    working_dir: &Path,
) -> Result<Artifact, ValidationError> {
    match platform {
        Platform::Android => {
            if app.is_some() || ipa.is_some() {
                warn!("ignoring iOS artifact paths for an Android upload");
            }
            match apk.or_else(|| discover(platform, working_dir)) {
                Some(path) => Ok(Artifact {
                    kind: ArtifactKind::Apk,
                    path,
                }),
                None => Err(ValidationError::MissingArtifact {
                    platform,
                    expected: "APK",
                }),
            }
        }
        Platform::Ios => {
            if apk.is_some() {
                warn!("ignoring APK path for an iOS upload");
            }
            match (app, ipa) {
                (Some(app), Some(ipa)) => Ok(pick_app_or_ipa(app, ipa)),
                (Some(path), None) => Ok(Artifact {
                    kind: ArtifactKind::AppBundle,
                    path,
                }),
                (None, Some(path)) => Ok(Artifact {
                    kind: ArtifactKind::Ipa,
                    path,
                }),
                (None, None) => discover(platform, working_dir)
                    .map(|path| Artifact {
                        kind: ArtifactKind::Ipa,
                        path,
                    })
                    .ok_or(ValidationError::MissingArtifact {
                        platform,
                        expected: "app bundle or IPA",
                    }),
            }
        }
    }
}

fn resolve_symbols(
    artifact: &Artifact,
    dsym: Option<PathBuf>,
    include_symbols: bool,
) -> Result<Option<Symbols>, ValidationError> {
    match artifact.kind {
        ArtifactKind::Apk => {
            if dsym.is_some() || include_symbols {
                warn!("symbols are only uploaded for iOS builds, ignoring");
            }
            Ok(None)
        }
        ArtifactKind::AppBundle | ArtifactKind::Ipa => match dsym {
            Some(path) => {
                if include_symbols {
                    warn!(
                        "--include-symbols is ignored, uploading {} instead",
                        path.display()
                    );
                }
                fs::metadata(&path).map_err(|e| ValidationError::UnreadableFile {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
                Ok(Some(Symbols::Path(path)))
            }
            None if include_symbols && artifact.kind == ArtifactKind::AppBundle => {
                Ok(Some(Symbols::Bundled))
            }
            None => {
                if include_symbols {
                    warn!("--include-symbols only applies to app bundles, ignoring");
                }
                Ok(None)
            }
        },
    }
}

/// Validates and resolves the parameters of one upload. Touches the filesystem
/// (and `git`), never the network.
pub fn resolve(raw: RawParams, ctx: &ResolveContext<'_>) -> Result<UploadRequest, ValidationError> {
    let token = match (non_blank(raw.upload_token), non_blank(raw.api_key)) {
        (Some(token), _) => UploadToken::new(token),
        (None, Some(api_key)) => {
            debug!("no upload token, authenticating with the API key");
            UploadToken::new(api_key)
        }
        (None, None) => return Err(ValidationError::MissingCredential),
    };

    let variant_name = match raw.variant_name {
        Some(v) if v.trim().is_empty() => return Err(ValidationError::EmptyVariantName),
        Some(v) => Some(v.trim().to_string()),
        None => non_blank((ctx.env)("GRADLE_BUILD_TYPE")),
    };

    // blank means absent, but a real path keeps its surrounding spaces
    let path_of = |raw: Option<String>| -> Option<PathBuf> {
        raw.filter(|p| !p.trim().is_empty())
            .map(|p| ctx.working_dir.join(unescape_path(&p)))
    };
    let apk = path_of(raw.apk_path);
    let app = path_of(raw.app_path);
    let ipa = path_of(raw.ipa_path);
    let dsym = path_of(raw.dsym_path);

    let platform = ctx.platform.unwrap_or(if apk.is_some() {
        Platform::Android
    } else {
        Platform::Ios
    });
    let artifact = select_artifact(platform, apk, app, ipa, &ctx.working_dir)?;
    check_readable(&artifact)?;
    info!(
        "uploading {} {}",
        artifact.kind.describe(),
        artifact.path.display()
    );
    let symbols = resolve_symbols(&artifact, dsym, raw.include_symbols)?;

    let git_branch =
        non_blank(raw.git_branch).or_else(|| metadata::current_branch(&ctx.working_dir, ctx.env));
    let git_commit =
        non_blank(raw.git_commit).or_else(|| metadata::current_commit(&ctx.working_dir, ctx.env));
    let history = if ctx.collect_history {
        match metadata::commit_history(&ctx.working_dir) {
            Ok(commits) => History::Commits(commits),
            Err(e) => {
                warn!("no git history: {}", e.code());
                History::Unavailable(e)
            }
        }
    } else {
        History::Skipped
    };

    Ok(UploadRequest {
        platform,
        artifact,
        token,
        variant_name,
        git_branch,
        git_commit,
        application_id: non_blank(raw.application_id),
        package_name: non_blank(raw.package_name),
        symbols,
        history,
    })
}
