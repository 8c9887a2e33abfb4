use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::Parser;
use tracing::{info, warn};

use scanforge::catalog::{StaticCatalog, TemplateCatalog, TemplateFilter};
use scanforge::{
    EngineError, Outcome, ProbeContext, ProbeExecutor, ResultSink, ScanConfig, ScanEngine,
    StandardWriter, Target, Template,
};

#[derive(Parser)]
#[command(name = "scanforge")]
#[command(author, version, about = "template-driven scan orchestration engine")]
pub struct Cli {
    /// Target to scan (repeatable)
    #[arg(short = 'u', long = "target")]
    pub targets: Vec<String>,

    /// File with one target per line
    #[arg(short = 'l', long)]
    pub list: Option<PathBuf>,

    /// Template catalog file (JSON array of templates)
    #[arg(short = 't', long)]
    pub templates: PathBuf,

    /// Only run templates carrying one of these tags
    #[arg(long, value_delimiter = ',')]
    pub tags: Vec<String>,

    /// Skip templates carrying any of these tags
    #[arg(long, value_delimiter = ',')]
    pub exclude_tags: Vec<String>,

    /// Maximum requests per second (0 = unlimited)
    #[arg(long, default_value_t = 150)]
    pub rate_limit: u32,

    /// Maximum requests per minute; takes precedence over --rate-limit
    #[arg(long, default_value_t = 0)]
    pub rate_limit_minute: u32,

    /// Concurrent probe workers (0 = derive from CPU count)
    #[arg(short = 'c', long, default_value_t = 0)]
    pub concurrency: usize,

    /// Checkpoint file: loaded if present, written on interrupt
    #[arg(long)]
    pub resume: Option<PathBuf>,

    /// Write JSONL results to this file instead of stdout
    #[arg(short = 'o', long)]
    pub output: Option<PathBuf>,

    /// Fingerprint each target first and run only tag-matching templates
    #[arg(long)]
    pub automatic_scan: bool,

    /// Execute every template separately even when requests are identical
    #[arg(long)]
    pub no_clustering: bool,

    /// Stop scheduling new units after the first match
    #[arg(long)]
    pub stop_at_first_match: bool,

    /// Consecutive probe failures before a target's remaining units are
    /// skipped (0 = never skip)
    #[arg(long, default_value_t = 30)]
    pub max_host_errors: u32,

    /// Out-of-band interaction server base URL ($VAR values are expanded
    /// from the environment)
    #[arg(long)]
    pub interactions_server: Option<String>,

    /// Authorization token for the interaction server
    #[arg(long)]
    pub interactions_token: Option<String>,

    /// Seconds between interaction server polls
    #[arg(long, default_value_t = 5)]
    pub interactions_poll_interval: u64,

    /// Validate the template catalog and exit
    #[arg(long)]
    pub validate: bool,

    /// Exit with status 1 when the scan completes without findings
    #[arg(long)]
    pub fail_no_match: bool,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,
}

impl Cli {
    fn scan_config(&self) -> ScanConfig {
        let mut config = ScanConfig::default();
        config.workers = self.concurrency;
        config.rate.per_second = self.rate_limit;
        config.rate.per_minute = self.rate_limit_minute;
        config.resume_path = self.resume.clone();
        config.automatic_scan = self.automatic_scan;
        config.no_clustering = self.no_clustering;
        config.stop_at_first_match = self.stop_at_first_match;
        config.max_host_errors = self.max_host_errors;
        if let Some(server) = &self.interactions_server {
            config.interactions.enabled = true;
            config.interactions.server_url = server.clone();
            config.interactions.token = self.interactions_token.clone().unwrap_or_default();
            config.interactions.poll_interval_secs = self.interactions_poll_interval;
        }
        config
    }

    fn template_filter(&self) -> TemplateFilter {
        TemplateFilter {
            tags: self.tags.clone(),
            exclude_tags: self.exclude_tags.clone(),
            protocols: Vec::new(),
        }
    }
}

pub async fn run_command(cli: Cli) -> Result<bool> {
    let catalog = load_catalog(&cli.templates)?;

    if cli.validate {
        let issues = catalog.validate();
        if issues.is_empty() {
            info!("template catalog is valid");
            return Ok(true);
        }
        for issue in &issues {
            warn!(template = %issue.template, "{}", issue.message);
        }
        bail!("{} template(s) failed validation", issues.len());
    }

    let targets = collect_targets(&cli)?;
    let sink: Arc<dyn ResultSink> = match &cli.output {
        Some(path) => Arc::new(
            StandardWriter::file(path)
                .with_context(|| format!("opening output file {}", path.display()))?,
        ),
        None => Arc::new(StandardWriter::stdout()),
    };
    let executor = Arc::new(HttpProbe::new()?);

    let engine = ScanEngine::new(
        cli.scan_config(),
        targets,
        &catalog,
        &cli.template_filter(),
        executor,
        sink,
    )?;

    // First interrupt cancels the run; in-flight units finish or abort and
    // the checkpoint is saved if a resume path is configured.
    let cancel = engine.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, stopping scan");
            cancel.cancel();
        }
    });

    let run = engine.run().await;
    let found = engine.close().await;
    match run {
        Ok(_) => Ok(found),
        Err(e) if e.is_cancelled() => {
            info!("scan interrupted, partial results kept");
            Ok(found)
        }
        Err(e) => Err(e.into()),
    }
}

fn load_catalog(path: &Path) -> Result<StaticCatalog> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading template catalog {}", path.display()))?;
    let templates: Vec<Template> = serde_json::from_str(&raw)
        .with_context(|| format!("parsing template catalog {}", path.display()))?;
    Ok(StaticCatalog::new(templates))
}

fn collect_targets(cli: &Cli) -> Result<Vec<Target>> {
    let mut targets: Vec<Target> = cli.targets.iter().map(|t| Target::new(t.as_str())).collect();
    if let Some(path) = &cli.list {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading target list {}", path.display()))?;
        targets.extend(
            raw.lines()
                .map(str::trim)
                .filter(|line| !line.is_empty() && !line.starts_with('#'))
                .map(Target::new),
        );
    }
    Ok(targets)
}

/// Default probe wiring for the binary: sends each template request over
/// HTTP and matches on a 2xx response. Library consumers plug in real
/// protocol executors instead.
struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .user_agent(concat!("scanforge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    fn base_url(target: &Target) -> String {
        if target.is_url() {
            target.input.trim_end_matches('/').to_string()
        } else {
            format!("http://{}", target.input)
        }
    }
}

#[async_trait]
impl ProbeExecutor for HttpProbe {
    async fn execute(
        &self,
        target: &Target,
        template: &Template,
        ctx: &ProbeContext,
    ) -> scanforge::Result<Outcome> {
        let base = Self::base_url(target);
        for request in &template.requests {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let method = reqwest::Method::from_bytes(request.method.as_bytes())
                .unwrap_or(reqwest::Method::GET);
            let url = format!("{}{}", base, request.path);

            // Payloads may ask for an out-of-band marker
            let mut body = request.payload.clone();
            if body.contains("{{marker}}") {
                if let Some(marker) = ctx.register_marker() {
                    body = body.replace("{{marker}}", &marker);
                }
            }

            let response = self.client.request(method, &url).body(body).send().await?;
            if response.status().is_success() {
                return Ok(Outcome::matched());
            }
        }
        Ok(Outcome::no_match())
    }

    async fn identify(&self, target: &Target, ctx: &ProbeContext) -> scanforge::Result<Vec<String>> {
        if ctx.is_cancelled() {
            return Err(EngineError::Cancelled);
        }
        let response = self.client.get(Self::base_url(target)).send().await?;
        let mut tags = Vec::new();
        for header in ["server", "x-powered-by"] {
            if let Some(value) = response.headers().get(header).and_then(|v| v.to_str().ok()) {
                tags.extend(
                    value
                        .split(|c: char| !c.is_ascii_alphanumeric())
                        .filter(|part| part.len() > 1)
                        .map(str::to_ascii_lowercase),
                );
            }
        }
        Ok(tags)
    }
}
