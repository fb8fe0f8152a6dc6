//! Delegates the upload to the prebuilt Waldo CLI.

use std::collections::VecDeque;
use std::ffi::OsString;
use std::io;
use std::path::PathBuf;
use std::process::Stdio;

use itertools::Itertools;
use serde::Deserialize;
use tokio::io::{
    AsyncBufRead,
    AsyncBufReadExt,
    BufReader,
};

#[allow(unused_imports)]
use tracing::{
    debug,
    info,
    warn,
};

use super::{
    ArtifactTransport,
    BuildId,
    SymbolsOutcome,
    UploadReport,
    WrapperInfo,
};
use crate::cli_binary::{
    self,
    RetryPolicy,
};
use crate::error::UploadError;
use crate::http::HttpClient;
use crate::metadata::decode_command_output;
use crate::resolver::{
    Symbols,
    UploadRequest,
};

/// Lines of stderr kept in the error when the CLI fails.
const STDERR_TAIL: usize = 10;

#[derive(Debug, Deserialize)]
struct CliResult {
    #[serde(rename = "appVersionID")]
    app_version_id: String,
}

/// The build id from the last JSON line of the CLI's output.
pub fn parse_build_id(stdout: &str) -> Option<BuildId> {
    stdout
        .lines()
        .rev()
        .map(str::trim)
        .filter(|line| line.starts_with('{'))
        .find_map(|line| serde_json::from_str::<CliResult>(line).ok())
        .map(|result| BuildId::from(result.app_version_id))
}

/// One decoded line, or `None` at end of output.
async fn next_line<R: AsyncBufRead + Unpin>(
    reader: &mut R,
    buf: &mut Vec<u8>,
) -> io::Result<Option<String>> {
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(None);
    }
    let line = decode_command_output(buf)
        .unwrap_or_else(|_| String::from_utf8_lossy(buf).trim_end().to_owned());
    Ok(Some(line))
}

/// `upload [flags] <artifact> [<symbols>]`
pub fn command_args(request: &UploadRequest, verbose: bool) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec!["upload".into()];
    let mut flag = |name: &str, value: &Option<String>| {
        if let Some(value) = value {
            args.push(name.into());
            args.push(value.into());
        }
    };
    flag("--git_branch", &request.git_branch);
    flag("--git_commit", &request.git_commit);
    flag("--upload_token", &Some(request.token.expose().to_owned()));
    flag("--variant_name", &request.variant_name);
    if request.symbols == Some(Symbols::Bundled) {
        args.push("--include_symbols".into());
    }
    if verbose {
        args.push("--verbose".into());
    }
    args.push(request.artifact.path.clone().into());
    if let Some(Symbols::Path(path)) = &request.symbols {
        args.push(path.clone().into());
    }
    args
}

pub struct SubprocessTransport<C> {
    client: C,
    cli_path: Option<PathBuf>,
    release_url: String,
    policy: RetryPolicy,
    wrapper: WrapperInfo,
    verbose: bool,
}

impl<C: HttpClient> SubprocessTransport<C> {
    pub fn new(client: C, wrapper: WrapperInfo) -> Self {
        Self {
            client,
            cli_path: None,
            release_url: cli_binary::RELEASE_URL.to_owned(),
            policy: RetryPolicy::default(),
            wrapper,
            verbose: false,
        }
    }

    /// An already installed CLI, used instead of downloading when it exists.
    pub fn cli_path(mut self, path: Option<PathBuf>) -> Self {
        self.cli_path = path;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }
}

#[async_trait::async_trait]
impl<C: HttpClient> ArtifactTransport for SubprocessTransport<C> {
    async fn upload(&self, request: &UploadRequest) -> Result<UploadReport, UploadError> {
        let installed = cli_binary::provision(
            &self.client,
            self.cli_path.as_deref(),
            None,
            &self.release_url,
            &self.policy,
        )
        .await?;
        if request.application_id.is_some() || request.package_name.is_some() {
            warn!("the waldo CLI takes no application id or package name, not forwarding them");
        }
        let args = command_args(request, self.verbose);
        info!("uploading build with {} - this could take a while", installed.path.display());
        let mut child = tokio::process::Command::new(&installed.path)
            .args(&args)
            .env(WrapperInfo::NAME_OVERRIDE, &self.wrapper.name)
            .env(WrapperInfo::VERSION_OVERRIDE, &self.wrapper.version)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(stdout), Some(stderr)) => (stdout, stderr),
            _ => {
                return Err(UploadError::Io(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "waldo CLI output is not piped",
                )))
            }
        };

        let forward_stdout = async {
            let mut reader = BufReader::new(stdout);
            let mut build_id = None;
            let mut buf = Vec::new();
            while let Some(line) = next_line(&mut reader, &mut buf).await? {
                info!("{line}");
                if let Some(id) = parse_build_id(&line) {
                    build_id = Some(id);
                }
            }
            Ok::<_, io::Error>(build_id)
        };
        let collect_stderr = async {
            let mut reader = BufReader::new(stderr);
            let mut tail = VecDeque::with_capacity(STDERR_TAIL);
            let mut buf = Vec::new();
            while let Some(line) = next_line(&mut reader, &mut buf).await? {
                debug!("{line}");
                if tail.len() == STDERR_TAIL {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
            Ok::<_, io::Error>(tail)
        };
        let (build_id, tail, status) = tokio::try_join!(forward_stdout, collect_stderr, child.wait())?;

        if !status.success() {
            let tail = tail.into_iter().join("\n");
            return Err(UploadError::Tool {
                code: status.code(),
                message: if tail.trim().is_empty() {
                    "no error output".to_owned()
                } else {
                    tail
                },
            });
        }
        let build_id = build_id.ok_or_else(|| {
            UploadError::InvalidResponse("waldo CLI output carried no appVersionID".to_owned())
        })?;
        let symbols = request.symbols.as_ref().map(|_| SymbolsOutcome::Uploaded);
        Ok(UploadReport { build_id, symbols })
    }
}
