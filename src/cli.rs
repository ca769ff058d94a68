use crate::{
    AnalysisPlugins, AnalysisTimeouts, ClientConfig, DisconnectPolicy, Endpoint, FileConfig, JobId, Metrics, MetricsCollector,
    ProcessingServer, ProcessorConfig, PrometheusExporter, ScrapeClient, ScrapePlugins, ScrapeResponse,
    ScraperConfig, ScrapeStatus, ScrapingServer, ScreenshotBackend, StatusResponse,
};
use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::sync::broadcast;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "page-analyzer")]
#[command(about = "Two-tier web page analyzer: scraping server, processing server and client")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(long, global = true, help = "Configuration file path (JSON)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Serve Prometheus metrics on this port")]
    pub metrics_port: Option<u16>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the processing server
    Processor {
        #[arg(short, long, help = "Listen address")]
        ip: Option<String>,

        #[arg(short, long, help = "Listen port")]
        port: Option<u16>,

        #[arg(short = 'n', long, help = "Analyses running at the same time")]
        max_workers: Option<usize>,

        #[arg(long, help = "Requests allowed to wait for a worker")]
        max_queue: Option<usize>,

        #[arg(long, value_enum, help = "Screenshot renderer")]
        screenshot_backend: Option<ScreenshotBackend>,

        #[arg(long, help = "Chrome executable path")]
        chrome_path: Option<String>,

        #[arg(long, help = "Deadline for every analysis kind in seconds")]
        analysis_timeout: Option<u64>,
    },

    /// Run the scraping server
    Scraper {
        #[arg(short, long, help = "Listen address")]
        ip: Option<String>,

        #[arg(short, long, help = "Listen port")]
        port: Option<u16>,

        #[arg(long, help = "Processing server address")]
        proc_ip: Option<String>,

        #[arg(long, help = "Processing server port")]
        proc_port: Option<u16>,

        #[arg(long, help = "Requests per domain per minute (0 = unlimited)")]
        rate_limit: Option<u32>,

        #[arg(long, help = "Cache OK results for this many seconds (0 = disabled)")]
        cache_ttl: Option<u64>,

        #[arg(long, help = "Processing deadline per job in seconds")]
        forward_timeout: Option<u64>,

        #[arg(long, help = "Page fetch deadline in seconds")]
        fetch_timeout: Option<u64>,

        #[arg(long, value_enum, help = "What happens to running jobs when their client disconnects")]
        on_disconnect: Option<DisconnectPolicy>,

        #[arg(long, help = "Keep finished results for status lookups this many seconds")]
        result_ttl: Option<u64>,
    },

    /// Analyze one URL through a scraping server
    Client {
        #[arg(short, long, help = "Scraping server address")]
        ip: Option<String>,

        #[arg(short, long, help = "Scraping server port")]
        port: Option<u16>,

        #[arg(short, long, help = "URL to analyze")]
        url: String,

        #[arg(long, help = "Give up after this many seconds")]
        timeout: Option<u64>,

        #[arg(long, help = "Print the full response as JSON")]
        json: bool,

        #[arg(long, help = "Write the screenshot PNG to this path")]
        screenshot_out: Option<PathBuf>,

        #[arg(long, help = "Print the job id and return without waiting for the result")]
        no_wait: bool,
    },

    /// Look up a job started with `client --no-wait`
    Status {
        #[arg(short, long, help = "Scraping server address")]
        ip: Option<String>,

        #[arg(short, long, help = "Scraping server port")]
        port: Option<u16>,

        #[arg(help = "Job id printed by `client --no-wait`")]
        job_id: String,

        #[arg(long, help = "Poll until the result is available")]
        wait: bool,

        #[arg(long, default_value_t = 1.0, help = "Seconds between polls with --wait")]
        interval: f64,

        #[arg(long, help = "Give up after this many seconds")]
        timeout: Option<u64>,

        #[arg(long, help = "Print the full response as JSON")]
        json: bool,
    },
}

pub struct CliRunner {
    pub config: FileConfig,
    pub metrics_port: Option<u16>,
}

impl CliRunner {
    pub async fn new(args: &Cli) -> anyhow::Result<Self> {
        let config = match &args.config {
            Some(path) => {
                let config = FileConfig::load(path)
                    .with_context(|| format!("cannot load configuration from {}", path.display()))?;
                info!("Configuration loaded from {}", path.display());
                config
            }
            None => FileConfig::default(),
        };

        Ok(Self {
            config,
            metrics_port: args.metrics_port,
        })
    }

    pub async fn run(&self, command: Commands, shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        match command {
            Commands::Processor { .. } => {
                let config = self.processor_config(&command)?;
                self.run_processor(config, shutdown).await
            }
            Commands::Scraper { .. } => {
                let config = self.scraper_config(&command)?;
                self.run_scraper(config, shutdown).await
            }
            Commands::Client {
                ref url,
                json,
                ref screenshot_out,
                no_wait,
                ..
            } => {
                let config = self.client_config(&command)?;
                if no_wait {
                    let job_id = ScrapeClient::new(config)
                        .submit(url)
                        .await
                        .with_context(|| format!("cannot submit {url}"))?;
                    println!("{job_id}");
                    return Ok(());
                }
                self.run_client(config, url, json, screenshot_out.as_ref()).await
            }
            Commands::Status {
                ref job_id,
                wait,
                interval,
                json,
                ..
            } => {
                let config = self.client_config(&command)?;
                let interval = Duration::try_from_secs_f64(interval)
                    .ok()
                    .filter(|interval| !interval.is_zero())
                    .context("--interval must be a positive number of seconds")?;
                self.run_status(config, JobId::from(job_id.as_str()), wait, interval, json)
                    .await
            }
        }
    }

    /// File configuration with the subcommand's flags applied on top.
    pub fn processor_config(&self, command: &Commands) -> anyhow::Result<ProcessorConfig> {
        let mut config = self.config.processor.clone();
        if let Commands::Processor {
            ip,
            port,
            max_workers,
            max_queue,
            screenshot_backend,
            chrome_path,
            analysis_timeout,
        } = command
        {
            override_endpoint(&mut config.listen, ip, port);
            if let Some(max_workers) = max_workers {
                config.max_workers = *max_workers;
            }
            if let Some(max_queue) = max_queue {
                config.max_queue = *max_queue;
            }
            if let Some(backend) = screenshot_backend {
                config.screenshot.backend = *backend;
            }
            if let Some(chrome_path) = chrome_path {
                config.screenshot.chrome_path = Some(chrome_path.clone());
            }
            if let Some(analysis_timeout) = analysis_timeout {
                config.timeouts = AnalysisTimeouts::uniform(Duration::from_secs(*analysis_timeout));
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn scraper_config(&self, command: &Commands) -> anyhow::Result<ScraperConfig> {
        let mut config = self.config.scraper.clone();
        if let Commands::Scraper {
            ip,
            port,
            proc_ip,
            proc_port,
            rate_limit,
            cache_ttl,
            forward_timeout,
            fetch_timeout,
            on_disconnect,
            result_ttl,
        } = command
        {
            override_endpoint(&mut config.listen, ip, port);
            override_endpoint(&mut config.processor, proc_ip, proc_port);
            if let Some(rate_limit) = rate_limit {
                config.rate_limit_per_minute = *rate_limit;
            }
            if let Some(cache_ttl) = cache_ttl {
                config.cache_ttl = Duration::from_secs(*cache_ttl);
            }
            if let Some(forward_timeout) = forward_timeout {
                config.forward_timeout = Duration::from_secs(*forward_timeout);
            }
            if let Some(fetch_timeout) = fetch_timeout {
                config.fetch_timeout = Duration::from_secs(*fetch_timeout);
            }
            if let Some(policy) = on_disconnect {
                config.on_disconnect = *policy;
            }
            if let Some(result_ttl) = result_ttl {
                config.result_ttl = Duration::from_secs(*result_ttl);
            }
        }
        config.validate()?;
        Ok(config)
    }

    pub fn client_config(&self, command: &Commands) -> anyhow::Result<ClientConfig> {
        let mut config = self.config.client.clone();
        if let Commands::Client { ip, port, timeout, .. } | Commands::Status { ip, port, timeout, .. } = command {
            override_endpoint(&mut config.server, ip, port);
            if let Some(timeout) = timeout {
                config.timeout = Duration::from_secs(*timeout);
            }
        }
        config.validate()?;
        Ok(config)
    }

    fn metrics(&self) -> anyhow::Result<Arc<Metrics>> {
        // The recorder must be installed before any handle is registered.
        if let Some(port) = self.metrics_port {
            PrometheusExporter::new(port).start()?;
        }
        Ok(Arc::new(Metrics::new()))
    }

    pub async fn run_processor(&self, config: ProcessorConfig, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let metrics = self.metrics()?;
        let collector = MetricsCollector::new(Arc::clone(&metrics));
        let collection = collector.start_collection();

        let plugins = AnalysisPlugins::from_settings(&config.screenshot);
        info!("Screenshot backend: {:?}", config.screenshot.backend);
        let server = ProcessingServer::bind(config, plugins, metrics).await?;
        let result = server
            .run(async move {
                let _ = shutdown.recv().await;
            })
            .await;

        collection.abort();
        info!("Processing server up for {:?}", collector.get_uptime());
        Ok(result?)
    }

    pub async fn run_scraper(&self, config: ScraperConfig, mut shutdown: broadcast::Receiver<()>) -> anyhow::Result<()> {
        let metrics = self.metrics()?;
        let collector = MetricsCollector::new(Arc::clone(&metrics));
        let collection = collector.start_collection();

        let plugins = ScrapePlugins::from_config(&config)?;
        let server = ScrapingServer::bind(config, plugins, metrics).await?;
        let result = server
            .run(async move {
                let _ = shutdown.recv().await;
            })
            .await;

        collection.abort();
        info!("Scraping server up for {:?}", collector.get_uptime());
        Ok(result?)
    }

    pub async fn run_client(
        &self,
        config: ClientConfig,
        url: &str,
        json: bool,
        screenshot_out: Option<&PathBuf>,
    ) -> anyhow::Result<()> {
        let client = ScrapeClient::new(config);
        let response = client
            .scrape(url)
            .await
            .with_context(|| format!("analysis of {url} failed"))?;
        report(&response, json, screenshot_out).await
    }

    pub async fn run_status(
        &self,
        config: ClientConfig,
        job_id: JobId,
        wait: bool,
        interval: Duration,
        json: bool,
    ) -> anyhow::Result<()> {
        let client = ScrapeClient::new(config);
        if wait {
            let response = client
                .wait_for(&job_id, interval)
                .await
                .with_context(|| format!("no result for job {job_id}"))?;
            return report(&response, json, None).await;
        }

        let status = client
            .status(&job_id, true)
            .await
            .with_context(|| format!("cannot look up job {job_id}"))?;
        if json {
            println!("{}", serde_json::to_string_pretty(&status)?);
        } else {
            print_status(&status);
        }
        if status.state.is_none() {
            bail!("job {job_id} is unknown or its result expired");
        }
        Ok(())
    }
}

async fn report(response: &ScrapeResponse, json: bool, screenshot_out: Option<&PathBuf>) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(response)?);
    } else {
        print_summary(response);
    }

    if let Some(path) = screenshot_out {
        match &response.screenshot {
            Some(Ok(blob)) => {
                if let Some(parent) = path.parent() {
                    fs::create_dir_all(parent).await?;
                }
                fs::write(path, &blob.data).await?;
                info!("Screenshot saved to: {}", path.display());
            }
            Some(Err(e)) => warn!("No screenshot to save: {}", e),
            None => warn!("No screenshot to save: not in response"),
        }
    }

    if response.status == ScrapeStatus::Failed {
        bail!("job {} failed", response.job_id);
    }
    Ok(())
}

fn override_endpoint(endpoint: &mut Endpoint, host: &Option<String>, port: &Option<u16>) {
    if let Some(host) = host {
        endpoint.host = host.clone();
    }
    if let Some(port) = port {
        endpoint.port = *port;
    }
}

pub fn print_status(status: &StatusResponse) {
    match (&status.state, &status.result) {
        (_, Some(result)) => print_summary(result),
        (Some(state), None) => println!("Job {}: {}", status.job_id, state),
        (None, None) => println!("Job {}: unknown or expired", status.job_id),
    }
}

pub fn print_summary(response: &ScrapeResponse) {
    println!("Analysis of {}:", response.url);
    println!("  Job: {}", response.job_id);
    println!("  Status: {}", response.status);
    println!("  Duration: {}ms", response.elapsed_ms);

    if let Some(metadata) = &response.metadata {
        if let Some(title) = &metadata.title {
            println!("  Title: {title}");
        }
        if let Some(description) = &metadata.description {
            println!("  Description: {description}");
        }
        println!("  Links: {}", metadata.links.len());
        println!("  Images: {}", metadata.images_count);
    }

    match &response.screenshot {
        Some(Ok(blob)) => println!(
            "  Screenshot: {}x{} {} ({} bytes)",
            blob.width,
            blob.height,
            blob.format.extension(),
            blob.data.len()
        ),
        Some(Err(e)) => println!("  Screenshot: {e}"),
        None => {}
    }
    match &response.performance {
        Some(Ok(perf)) => println!(
            "  Performance: score {} ({}ms, {:.1} KB, {} requests)",
            perf.score, perf.load_time_ms, perf.total_size_kb, perf.num_requests
        ),
        Some(Err(e)) => println!("  Performance: {e}"),
        None => {}
    }
    match &response.image_analysis {
        Some(Ok(image)) => println!(
            "  Image: {}x{}, brightness {:.0}, dominant #{:02x}{:02x}{:02x}",
            image.width,
            image.height,
            image.mean_brightness,
            image.dominant_color[0],
            image.dominant_color[1],
            image.dominant_color[2]
        ),
        Some(Err(e)) => println!("  Image: {e}"),
        None => {}
    }
    match &response.seo {
        Some(Ok(seo)) => println!("  SEO score: {}", seo.score),
        Some(Err(e)) => println!("  SEO: {e}"),
        None => {}
    }
    match &response.tech_stack {
        Some(Ok(stack)) if stack.is_empty() => println!("  Technologies: none detected"),
        Some(Ok(stack)) => println!("  Technologies: {}", stack.join(", ")),
        Some(Err(e)) => println!("  Technologies: {e}"),
        None => {}
    }
    match &response.structured_data {
        Some(Ok(items)) => println!("  Structured data: {} JSON-LD objects", items.len()),
        Some(Err(e)) => println!("  Structured data: {e}"),
        None => {}
    }
    match &response.accessibility {
        Some(Ok(report)) => println!(
            "  Accessibility: score {} ({} images without alt, {} empty links, {} empty buttons)",
            report.score,
            report.images_missing_alt.len(),
            report.links_without_text.len(),
            report.buttons_without_text.len()
        ),
        Some(Err(e)) => println!("  Accessibility: {e}"),
        None => {}
    }

    for error in &response.errors {
        println!("  Error: {error}");
    }
}

pub fn setup_logging(verbose: bool) -> anyhow::Result<()> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .init();

    Ok(())
}
