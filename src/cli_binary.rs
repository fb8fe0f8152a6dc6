//! Locating or downloading the prebuilt Waldo CLI for the host.

use std::path::{
    Path,
    PathBuf,
};
use std::time::Duration;

use enum_iterator::IntoEnumIterator;
use tempfile::TempDir;

#[allow(unused_imports)]
use tracing::{
    debug,
    info,
    warn,
};

use crate::error::UploadError;
use crate::http::{
    HttpClient,
    HttpRequest,
    Method,
    ResponseClass,
};

pub const RELEASE_URL: &str = "https://github.com/waldoapp/waldo-go-cli/releases/latest/download";
pub const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoEnumIterator)]
pub enum HostOs {
    Linux,
    Macos,
    Windows,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoEnumIterator)]
pub enum HostArch {
    Arm64,
    X86_64,
}

/// One of the released `waldo-<os>-<arch>[.exe]` executables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BinaryAsset {
    pub os: HostOs,
    pub arch: HostArch,
}

impl BinaryAsset {
    /// Maps `std::env::consts` style names onto a released asset.
    pub fn for_target(os: &str, arch: &str) -> Option<Self> {
        let os = match os {
            "linux" => HostOs::Linux,
            "macos" => HostOs::Macos,
            "windows" => HostOs::Windows,
            _ => return None,
        };
        let arch = match arch {
            "aarch64" | "arm64" => HostArch::Arm64,
            "x86_64" => HostArch::X86_64,
            _ => return None,
        };
        Some(Self { os, arch })
    }

    pub fn detect() -> Result<Self, UploadError> {
        use std::env::consts::{
            ARCH,
            OS,
        };
        Self::for_target(OS, ARCH)
            .ok_or_else(|| UploadError::Provision(format!("unsupported platform: {OS}-{ARCH}")))
    }

    pub fn file_name(&self) -> String {
        let os = match self.os {
            HostOs::Linux => "linux",
            HostOs::Macos => "macos",
            HostOs::Windows => "windows",
        };
        let arch = match self.arch {
            HostArch::Arm64 => "arm64",
            HostArch::X86_64 => "x86_64",
        };
        let ext = if self.os == HostOs::Windows { ".exe" } else { "" };
        format!("waldo-{os}-{arch}{ext}")
    }

    pub fn url(&self, release_url: &str) -> String {
        format!("{}/{}", release_url.trim_end_matches('/'), self.file_name())
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 2,
            delay: Duration::from_secs(1),
        }
    }
}

/// GETs `url`, retrying only transport failures and retryable statuses.
pub async fn download<C: HttpClient>(
    client: &C,
    url: &str,
    policy: &RetryPolicy,
) -> Result<Vec<u8>, UploadError> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        debug!(attempt, %url, "downloading");
        let reason = match client
            .send(HttpRequest::new(Method::Get, url, DOWNLOAD_TIMEOUT))
            .await
        {
            Ok(response) => match response.class() {
                ResponseClass::Success => return Ok(response.body),
                ResponseClass::RetryableFailure => format!("HTTP {}", response.status),
                ResponseClass::AuthFailure | ResponseClass::PermanentFailure => {
                    return Err(UploadError::Provision(format!(
                        "download of {url} failed with HTTP {}",
                        response.status
                    )))
                }
            },
            Err(e) => e.to_string(),
        };
        if attempt >= policy.max_attempts {
            return Err(UploadError::Provision(format!(
                "download of {url} failed after {attempt} attempts: {reason}"
            )));
        }
        warn!("download attempt {attempt} failed ({reason}), retrying");
        tokio::time::sleep(policy.delay).await;
    }
}

/// Path to a usable binary. A downloaded one lives as long as this value.
#[derive(Debug)]
pub struct Installed {
    pub path: PathBuf,
    _dir: Option<TempDir>,
}

#[cfg(unix)]
fn make_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

/// Uses `known_path` when it exists, otherwise downloads the host asset into
/// `dest` (or a temporary directory removed when the result is dropped).
pub async fn provision<C: HttpClient>(
    client: &C,
    known_path: Option<&Path>,
    dest: Option<&Path>,
    release_url: &str,
    policy: &RetryPolicy,
) -> Result<Installed, UploadError> {
    if let Some(path) = known_path {
        if path.is_file() {
            debug!("using waldo CLI at {}", path.display());
            return Ok(Installed {
                path: path.to_path_buf(),
                _dir: None,
            });
        }
        warn!("{} not found, downloading waldo CLI", path.display());
    }
    let asset = BinaryAsset::detect()?;
    let bytes = download(client, &asset.url(release_url), policy).await?;
    let (dir, temp) = match dest {
        Some(dest) => (dest.to_path_buf(), None),
        None => {
            let temp = tempfile::Builder::new().prefix("waldo-cli-").tempdir()?;
            (temp.path().to_path_buf(), Some(temp))
        }
    };
    tokio::fs::create_dir_all(&dir).await?;
    let path = dir.join(asset.file_name());
    tokio::fs::write(&path, &bytes).await?;
    make_executable(&path)?;
    info!("installed waldo CLI ({} bytes) at {}", bytes.len(), path.display());
    Ok(Installed { path, _dir: temp })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::http::testing::{
        ok,
        FakeClient,
    };
    use eyre::Result;
    use pretty_assertions::assert_eq;

    fn no_delay() -> RetryPolicy {
        RetryPolicy {
            delay: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn asset_names_per_host() {
        let name = |os, arch| BinaryAsset::for_target(os, arch).map(|a| a.file_name());
        assert_eq!(name("linux", "aarch64").as_deref(), Some("waldo-linux-arm64"));
        assert_eq!(name("macos", "x86_64").as_deref(), Some("waldo-macos-x86_64"));
        assert_eq!(
            name("windows", "x86_64").as_deref(),
            Some("waldo-windows-x86_64.exe")
        );
        assert_eq!(name("freebsd", "x86_64"), None);
        assert_eq!(name("linux", "riscv64"), None);
    }

    #[test]
    fn every_asset_name_is_distinct() {
        let mut names = HostOs::into_enum_iter()
            .flat_map(|os| HostArch::into_enum_iter().map(move |arch| BinaryAsset { os, arch }))
            .map(|asset| asset.file_name())
            .collect::<Vec<_>>();
        names.sort();
        names.dedup();
        assert_eq!(names.len(), 6);
    }

    #[test]
    fn asset_url_joins_release_base() {
        let asset = BinaryAsset {
            os: HostOs::Macos,
            arch: HostArch::Arm64,
        };
        assert_eq!(
            asset.url("https://example.com/download/"),
            "https://example.com/download/waldo-macos-arm64"
        );
    }

    #[tokio::test]
    async fn retryable_status_then_success_makes_two_attempts() -> Result<()> {
        let fake = FakeClient::replying([ok(503, ""), ok(200, "binary")]);
        let bytes = download(&fake, "https://dl.test/waldo", &no_delay()).await?;
        assert_eq!(bytes, b"binary");
        assert_eq!(fake.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn two_retryable_failures_stop_after_second_attempt() {
        let fake = FakeClient::replying([ok(503, ""), ok(503, ""), ok(200, "binary")]);
        let err = download(&fake, "https://dl.test/waldo", &no_delay())
            .await
            .expect_err("both attempts fail");
        assert!(matches!(err, UploadError::Provision(_)));
        assert_eq!(fake.calls(), 2);
    }

    #[tokio::test]
    async fn transport_failure_is_retried() -> Result<()> {
        let fake = FakeClient::replying([
            Err(TransportError::Connect("reset".into())),
            ok(200, "binary"),
        ]);
        download(&fake, "https://dl.test/waldo", &no_delay()).await?;
        assert_eq!(fake.calls(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        for status in [401, 403, 404] {
            let fake = FakeClient::replying([ok(status, ""), ok(200, "binary")]);
            download(&fake, "https://dl.test/waldo", &no_delay())
                .await
                .expect_err("not retryable");
            assert_eq!(fake.calls(), 1, "{status}");
        }
    }

    #[tokio::test]
    async fn known_path_skips_download() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let existing = dir.path().join("waldo");
        std::fs::write(&existing, b"#!/bin/sh\n")?;
        let fake = FakeClient::default();
        let installed =
            provision(&fake, Some(existing.as_path()), None, RELEASE_URL, &no_delay()).await?;
        assert_eq!(installed.path, existing);
        assert_eq!(fake.calls(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn download_installs_into_destination() -> Result<()> {
        if BinaryAsset::detect().is_err() {
            return Ok(());
        }
        let dir = tempfile::tempdir()?;
        let fake = FakeClient::replying([ok(200, "binary")]);
        let installed = provision(
            &fake,
            Some(dir.path().join("missing").as_path()),
            Some(dir.path()),
            "https://dl.test",
            &no_delay(),
        )
        .await?;
        assert_eq!(std::fs::read(&installed.path)?, b"binary");
        assert!(installed.path.starts_with(dir.path()));
        let sent = fake.recorded();
        assert_eq!(sent[0].method, Method::Get);
        assert!(sent[0].url.starts_with("https://dl.test/waldo-"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            assert_eq!(
                std::fs::metadata(&installed.path)?.permissions().mode() & 0o777,
                0o755
            );
        }
        Ok(())
    }
}
