use clap::{
    Parser,
    Subcommand,
};
use eyre::{
    Result,
    WrapErr,
};
use std::ffi::OsString;
use std::path::PathBuf;

#[allow(unused_imports)]
use tracing::{
    debug,
    error,
    info,
    trace,
    warn,
};

macro_rules! matched_variant {
    ($Self:ty, $v:expr) => {{
        Self::into_enum_iter()
            .find(|v| {
                serde_variant::to_variant_name(v)
                    .map(|name| name == $v)
                    .unwrap_or(false)
            })
            .ok_or(eyre::eyre!(
                "{} hasn't matched any variant of {}",
                $v,
                std::any::type_name::<$Self>()
            ))
    }};
}

mod archive;
mod cli_binary;
mod error;
mod http;
mod metadata;
mod resolver;
mod transport;

use crate::cli_binary::RetryPolicy;
use crate::error::{
    TerminalState,
    UploadError,
};
use crate::http::ReqwestClient;
use crate::resolver::{
    Platform,
    RawParams,
    ResolveContext,
};
use crate::transport::direct::DEFAULT_API_URL;
use crate::transport::{
    ArtifactTransport,
    DirectHttpTransport,
    SubprocessTransport,
    SymbolsOutcome,
    TransportKind,
    UploadReport,
    WrapperInfo,
};

#[derive(clap::Args, Debug)]
struct UploadArgs {
    #[clap(long, env = "WALDO_PLATFORM")]
    /// android or ios; inferred from the artifact paths when omitted
    platform: Option<Platform>,
    #[clap(long, env = "WALDO_APK_PATH", value_name = "FILE")]
    /// path to the APK (defaults to the newest *.apk, gradle outputs included)
    apk_path: Option<String>,
    #[clap(long, env = "WALDO_APP_PATH", value_name = "DIR")]
    /// path to the simulator .app bundle
    app_path: Option<String>,
    #[clap(long, env = "WALDO_IPA_PATH", value_name = "FILE")]
    /// path to the IPA (defaults to the newest *.ipa in the working directory)
    ipa_path: Option<String>,
    #[clap(long, env = "WALDO_DSYM_PATH", value_name = "PATH")]
    /// dSYM directory or zip uploaded after the build
    dsym_path: Option<String>,
    #[clap(long, env = "WALDO_INCLUDE_SYMBOLS")]
    /// upload the dSYMs found next to the app bundle
    include_symbols: bool,
    #[clap(long, env = "WALDO_UPLOAD_TOKEN", hide_env_values = true)]
    upload_token: Option<String>,
    #[clap(long, env = "WALDO_API_KEY", hide_env_values = true)]
    /// credential used when no upload token is given
    api_key: Option<String>,
    #[clap(long, env = "WALDO_APPLICATION_ID")]
    application_id: Option<String>,
    #[clap(long, env = "WALDO_PACKAGE_NAME")]
    /// bundle identifier or application package of the build
    package_name: Option<String>,
    #[clap(long, env = "WALDO_VARIANT_NAME")]
    variant_name: Option<String>,
    #[clap(long, env = "WALDO_GIT_BRANCH")]
    /// branch of the originating commit (inferred from CI or git when omitted)
    git_branch: Option<String>,
    #[clap(long, env = "WALDO_GIT_COMMIT")]
    /// hash of the originating commit (inferred from CI or git when omitted)
    git_commit: Option<String>,
    #[clap(long, env = "WALDO_TRANSPORT", default_value = "http")]
    /// http uploads directly, cli shells out to the waldo CLI
    transport: TransportKind,
    #[clap(long, env = "WALDO_CLI_PATH", value_name = "FILE")]
    /// installed waldo CLI; downloaded when missing
    cli_path: Option<PathBuf>,
    #[clap(long)]
    /// don't report a rejected token to the backend
    no_error_report: bool,
    #[clap(long, env = "WALDO_API_URL", default_value_t = String::from(DEFAULT_API_URL), hide = true)]
    api_url: String,
}

impl UploadArgs {
    fn raw_params(&self) -> RawParams {
        RawParams {
            apk_path: self.apk_path.clone(),
            app_path: self.app_path.clone(),
            ipa_path: self.ipa_path.clone(),
            dsym_path: self.dsym_path.clone(),
            include_symbols: self.include_symbols,
            upload_token: self.upload_token.clone(),
            api_key: self.api_key.clone(),
            application_id: self.application_id.clone(),
            package_name: self.package_name.clone(),
            variant_name: self.variant_name.clone(),
            git_branch: self.git_branch.clone(),
            git_commit: self.git_commit.clone(),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// uploads a build, and its symbols when given, to Waldo
    Upload(UploadArgs),
    /// downloads the waldo CLI for this host and prints its path
    FetchCli {
        #[clap(long, value_name = "DIR", default_value = ".")]
        dest: PathBuf,
    },
}

/// CI helper for uploading mobile builds to Waldo
#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
#[clap(propagate_version = true)]
struct Args {
    #[clap(long, env = "WALDO_CONFIG", value_name = "FILE", global = true)]
    /// dotenv-style file with WALDO_* settings, never overriding the environment
    config: Option<PathBuf>,
    #[clap(short, long, env = "WALDO_VERBOSE", global = true)]
    /// debug logging, also passed on to the waldo CLI
    verbose: bool,
    #[clap(long, env = "WALDO_TRACE", global = true, hide = true)]
    trace: bool,
    #[clap(subcommand)]
    command: Command,
}

impl Args {
    fn verbose(&self) -> bool {
        self.verbose || self.trace
    }
}

/// `.env` first, then `--config`; the second parse sees what the file added.
fn load_args<I, T>(argv: I) -> Result<Args>
where
    I: IntoIterator<Item = T> + Clone,
    T: Into<OsString> + Clone,
{
    dotenv::dotenv().ok();
    let args = Args::parse_from(argv.clone());
    match &args.config {
        Some(path) => {
            dotenv::from_path(path)
                .wrap_err_with(|| format!("loading config file {}", path.display()))?;
            Ok(Args::parse_from(argv))
        }
        None => Ok(args),
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

async fn run_upload(
    raw: RawParams,
    ctx: &ResolveContext<'_>,
    transport: &dyn ArtifactTransport,
) -> std::result::Result<UploadReport, UploadError> {
    let request = resolver::resolve(raw, ctx)?;
    info!(
        " :: summary for {} v{} ::\n{:#?}",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        request
    );
    transport.upload(&request).await
}

async fn upload(args: UploadArgs, verbose: bool) -> Result<()> {
    let env = metadata::process_env;
    let ctx = ResolveContext {
        working_dir: std::env::current_dir().wrap_err("reading working directory")?,
        platform: args.platform,
        env: &env,
        collect_history: args.transport == TransportKind::Http,
    };
    let wrapper = WrapperInfo::from_env(&env);
    let client = ReqwestClient::new()?;
    let transport: Box<dyn ArtifactTransport> = match args.transport {
        TransportKind::Http => Box::new(
            DirectHttpTransport::new(client, args.api_url.clone(), wrapper)
                .report_errors(!args.no_error_report),
        ),
        TransportKind::Cli => Box::new(
            SubprocessTransport::new(client, wrapper)
                .cli_path(args.cli_path.clone())
                .verbose(verbose),
        ),
    };
    match run_upload(args.raw_params(), &ctx, transport.as_ref()).await {
        Ok(report) => {
            match report.symbols {
                Some(SymbolsOutcome::Uploaded) => info!("symbols uploaded"),
                Some(SymbolsOutcome::NothingFound) => warn!("no symbols were uploaded"),
                None => {}
            }
            info!(
                state = ?TerminalState::Succeeded,
                " ::: build {} successfully uploaded to Waldo :::",
                report.build_id
            );
            // stdout carries only the id so pipelines can capture it
            println!("{}", report.build_id);
            Ok(())
        }
        Err(e) => Err(failure_report(e)),
    }
}

/// color-eyre prints the report on exit, so failures are not logged here.
fn failure_report(e: UploadError) -> eyre::Report {
    let state = e.terminal_state();
    eyre::Report::new(e).wrap_err(format!("upload to Waldo failed ({state:?})"))
}

async fn fetch_cli(dest: PathBuf) -> Result<()> {
    let client = ReqwestClient::new()?;
    let installed = cli_binary::provision(
        &client,
        None,
        Some(dest.as_path()),
        cli_binary::RELEASE_URL,
        &RetryPolicy::default(),
    )
    .await
    .wrap_err("fetching waldo CLI")?;
    println!("{}", installed.path.display());
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    color_eyre::install().ok();
    let args = load_args(std::env::args_os().collect::<Vec<_>>())?;
    let verbose = args.verbose();
    init_tracing(verbose);
    debug!(?args.command);
    match args.command {
        Command::Upload(upload_args) => upload(upload_args, verbose).await,
        Command::FetchCli { dest } => fetch_cli(dest).await,
    }
}
