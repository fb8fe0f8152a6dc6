//! Uploads straight to the backend API with chunked POSTs.

use std::path::{
    Path,
    PathBuf,
};
use std::time::Duration;

use serde::Deserialize;

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
use crate::archive::{
    self,
    TempArchive,
};
use crate::error::UploadError;
use crate::http::{
    Body,
    HttpClient,
    HttpRequest,
    HttpResponse,
    Method,
    ResponseClass,
    StreamBody,
    APPLICATION_OCTET_STREAM,
    APPLICATION_ZIP,
};
use crate::metadata;
use crate::resolver::{
    Artifact,
    ArtifactKind,
    History,
    Symbols,
    UploadRequest,
};

pub const DEFAULT_API_URL: &str = "https://api.waldo.com";
pub const UPLOAD_TIMEOUT: Duration = Duration::from_secs(120);
pub const ERROR_REPORT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct VersionCreated {
    id: String,
}

#[derive(Debug, Deserialize)]
struct BackendMessage {
    message: String,
}

/// A file ready to stream, plus the archive it may live in.
#[derive(Debug)]
struct Payload {
    path: PathBuf,
    content_type: &'static str,
    _archive: Option<TempArchive>,
}

impl Payload {
    fn raw(path: &Path, content_type: &'static str) -> Self {
        Self {
            path: path.to_path_buf(),
            content_type,
            _archive: None,
        }
    }

    fn zipped(dirs: &[PathBuf]) -> Result<Self, UploadError> {
        let archive = archive::zip_directories(dirs)?;
        Ok(Self {
            path: archive.path().to_path_buf(),
            content_type: APPLICATION_ZIP,
            _archive: Some(archive),
        })
    }

    fn for_artifact(artifact: &Artifact) -> Result<Self, UploadError> {
        match artifact.kind {
            ArtifactKind::AppBundle => Self::zipped(&[artifact.path.clone()]),
            ArtifactKind::Apk | ArtifactKind::Ipa => {
                Ok(Self::raw(&artifact.path, APPLICATION_OCTET_STREAM))
            }
        }
    }

    fn for_symbols(symbols: &Symbols, artifact: &Artifact) -> Result<Option<Self>, UploadError> {
        match symbols {
            Symbols::Path(path) if path.is_dir() => Self::zipped(&[path.clone()]).map(Some),
            Symbols::Path(path) => {
                let is_zip = path
                    .extension()
                    .map(|e| e.eq_ignore_ascii_case("zip"))
                    .unwrap_or(false);
                let content_type = if is_zip {
                    APPLICATION_ZIP
                } else {
                    APPLICATION_OCTET_STREAM
                };
                Ok(Some(Self::raw(path, content_type)))
            }
            Symbols::Bundled => {
                let found = archive::dsyms_next_to(&artifact.path);
                if found.is_empty() {
                    return Ok(None);
                }
                Self::zipped(&found).map(Some)
            }
        }
    }

    async fn open(&self) -> Result<StreamBody, UploadError> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(StreamBody {
            reader: Box::new(file),
            content_type: self.content_type,
        })
    }
}

fn backend_message(response: &HttpResponse) -> String {
    if let Ok(parsed) = serde_json::from_slice::<BackendMessage>(&response.body) {
        return parsed.message;
    }
    let text = response.text();
    let text = text.trim();
    if text.is_empty() {
        "no response body".to_owned()
    } else {
        text.to_owned()
    }
}

pub struct DirectHttpTransport<C> {
    client: C,
    base_url: String,
    wrapper: WrapperInfo,
    report_errors: bool,
}

impl<C: HttpClient> DirectHttpTransport<C> {
    pub fn new(client: C, base_url: impl Into<String>, wrapper: WrapperInfo) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            wrapper,
            report_errors: true,
        }
    }

    /// Whether a rejected token is also reported to the diagnostic endpoint.
    pub fn report_errors(mut self, enabled: bool) -> Self {
        self.report_errors = enabled;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }

    fn authorized(&self, request: &UploadRequest, http: HttpRequest) -> HttpRequest {
        http.header(
            "authorization",
            format!("Upload-Token {}", request.token.expose()),
        )
        .header("user-agent", self.wrapper.user_agent(request.platform))
    }

    async fn check(
        &self,
        request: &UploadRequest,
        response: HttpResponse,
    ) -> Result<HttpResponse, UploadError> {
        match response.class() {
            ResponseClass::Success => Ok(response),
            ResponseClass::AuthFailure => {
                let err = UploadError::auth();
                if self.report_errors {
                    self.report_error(request, &err.to_string()).await;
                }
                Err(err)
            }
            ResponseClass::RetryableFailure | ResponseClass::PermanentFailure => {
                Err(UploadError::Backend {
                    status: response.status,
                    message: backend_message(&response),
                })
            }
        }
    }

    /// Best effort: failures are logged and dropped.
    pub async fn report_error(&self, request: &UploadRequest, message: &str) {
        let http = self
            .authorized(
                request,
                HttpRequest::new(Method::Post, self.url("uploadError"), ERROR_REPORT_TIMEOUT),
            )
            .body(Body::Json(serde_json::json!({ "message": message })));
        match self.client.send(http).await {
            Ok(response) if response.class() == ResponseClass::Success => {
                debug!("error reported to backend")
            }
            Ok(response) => debug!("error report rejected with {}", response.status),
            Err(e) => debug!("error report failed: {e}"),
        }
    }

    pub async fn upload_build(&self, request: &UploadRequest) -> Result<BuildId, UploadError> {
        let payload = Payload::for_artifact(&request.artifact)?;
        let body = payload.open().await?;
        self.post_build(request, body).await
    }

    pub(crate) async fn post_build(
        &self,
        request: &UploadRequest,
        body: StreamBody,
    ) -> Result<BuildId, UploadError> {
        let (history, history_error) = match &request.history {
            History::Commits(commits) => (
                Some(
                    metadata::encode_history(commits)
                        .map_err(|e| UploadError::InvalidResponse(format!("{e:#}")))?,
                ),
                None,
            ),
            History::Unavailable(e) => (None, Some(e.code())),
            History::Skipped => (None, None),
        };
        let http = self
            .authorized(
                request,
                HttpRequest::new(Method::Post, self.url("versions"), UPLOAD_TIMEOUT),
            )
            .query("variantName", request.variant_name.clone())
            .query("gitBranch", request.git_branch.clone())
            .query("gitCommit", request.git_commit.clone())
            .query("applicationId", request.application_id.clone())
            .query("packageName", request.package_name.clone())
            .query("history", history)
            .query("historyError", history_error)
            .body(Body::Stream(body));
        let response = self.client.send(http).await?;
        let response = self.check(request, response).await?;
        let created: VersionCreated = serde_json::from_slice(&response.body).map_err(|e| {
            UploadError::InvalidResponse(format!("{e}: {}", response.text()))
        })?;
        Ok(BuildId::from(created.id))
    }

    pub async fn upload_symbols(
        &self,
        request: &UploadRequest,
        symbols: &Symbols,
        build_id: &BuildId,
    ) -> Result<SymbolsOutcome, UploadError> {
        let Some(payload) = Payload::for_symbols(symbols, &request.artifact)? else {
            warn!(
                "no dSYM found next to {}, skipping symbols",
                request.artifact.path.display()
            );
            return Ok(SymbolsOutcome::NothingFound);
        };
        let body = payload.open().await?;
        let http = self
            .authorized(
                request,
                HttpRequest::new(
                    Method::Post,
                    self.url(&format!("versions/{}/symbols", build_id)),
                    UPLOAD_TIMEOUT,
                ),
            )
            .body(Body::Stream(body));
        let response = self.client.send(http).await?;
        self.check(request, response).await?;
        Ok(SymbolsOutcome::Uploaded)
    }
}

#[async_trait::async_trait]
impl<C: HttpClient> ArtifactTransport for DirectHttpTransport<C> {
    async fn upload(&self, request: &UploadRequest) -> Result<UploadReport, UploadError> {
        info!("uploading build to Waldo backend - this could take a while");
        let build_id = self.upload_build(request).await?;
        info!("build uploaded :: {build_id}");
        let symbols = match &request.symbols {
            Some(symbols) => {
                info!("uploading symbols for {build_id}");
                Some(self.upload_symbols(request, symbols, &build_id).await?)
            }
            None => None,
        };
        Ok(UploadReport { build_id, symbols })
    }
}
