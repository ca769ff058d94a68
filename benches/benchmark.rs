use chrono::Utc;
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use page_analyzer::plugins::audit::audit_seo;
use page_analyzer::plugins::extract::extract_metadata;
use page_analyzer::{
    AnalysisKind, AnalysisRequest, Codec, Heartbeat, ImageBlob, ImageFormat, JobId, Message, PageData,
    ScrapeResponse, ScrapeStatus,
};
use scraper::Html;
use std::sync::Arc;
use std::time::Duration;

#[cfg(feature = "integration_benchmarks")]
use tokio::runtime::Runtime;

// Fast settings for all benchmarks
fn configure_fast_group(group: &mut criterion::BenchmarkGroup<criterion::measurement::WallTime>) {
    group.warm_up_time(Duration::from_millis(500));
    group.measurement_time(Duration::from_millis(500));
    group.sample_size(20);
}

fn sample_html(paragraphs: usize) -> String {
    let mut html = String::from(
        "<html><head><title>Benchmark page title</title>\
         <meta name=\"description\" content=\"A page generated for codec and extraction benchmarks.\">\
         <link rel=\"canonical\" href=\"https://example.com/\"></head><body><h1>Bench</h1>",
    );
    for i in 0..paragraphs {
        html.push_str(&format!(
            "<p>Paragraph {i} with a <a href=\"/page/{i}\">link</a> and <img src=\"/img/{i}.png\"></p>"
        ));
    }
    html.push_str("</body></html>");
    html
}

fn sample_page(body_len: usize) -> PageData {
    let mut body = sample_html(body_len / 80).into_bytes();
    body.truncate(body_len.max(1));
    PageData {
        url: "https://example.com/".to_string(),
        final_url: "https://example.com/".to_string(),
        status: 200,
        content_type: Some("text/html".to_string()),
        body,
        fetched_at: Utc::now(),
        elapsed_ms: 120,
    }
}

// === UNIT BENCHMARKS ===

fn benchmark_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    configure_fast_group(&mut group);
    let codec = Codec::default();

    let heartbeat = Message::Heartbeat(Heartbeat::request(1));
    group.bench_function("heartbeat_encode", |b| {
        b.iter(|| black_box(codec.encode(&heartbeat).unwrap()));
    });

    let request = Message::AnalysisRequest(AnalysisRequest {
        job_id: JobId::generate(),
        page_data: Arc::new(sample_page(64 * 1024)),
        requested_analyses: AnalysisKind::all(),
    });
    let frame = codec.encode(&request).unwrap();
    group.bench_function("analysis_request_64k_encode", |b| {
        b.iter(|| black_box(codec.encode(&request).unwrap()));
    });
    group.bench_function("analysis_request_64k_decode", |b| {
        b.iter(|| black_box(codec.decode(&frame).unwrap()));
    });

    let mut response = ScrapeResponse::new(JobId::generate(), Some("bench".to_string()), "https://example.com/");
    response.status = ScrapeStatus::Ok;
    response.screenshot = Some(Ok(ImageBlob {
        format: ImageFormat::Png,
        width: 1280,
        height: 800,
        data: (0..256 * 1024).map(|i| (i % 251) as u8).collect(),
    }));
    let response = Message::ScrapeResponse(response);
    let frame = codec.encode(&response).unwrap();
    group.bench_function("scrape_response_256k_image_decode", |b| {
        b.iter(|| black_box(codec.decode(&frame).unwrap()));
    });

    group.finish();
}

fn benchmark_html_analysis(c: &mut Criterion) {
    let mut group = c.benchmark_group("html_analysis");
    configure_fast_group(&mut group);

    let html = sample_html(200);
    let base = url::Url::parse("https://example.com/").ok();
    group.bench_function("extract_metadata", |b| {
        b.iter(|| {
            let document = Html::parse_document(&html);
            black_box(extract_metadata(&document, base.as_ref()))
        });
    });
    group.bench_function("audit_seo", |b| {
        b.iter(|| {
            let document = Html::parse_document(&html);
            black_box(audit_seo(&document))
        });
    });

    group.finish();
}

fn benchmark_format_utilities(c: &mut Criterion) {
    let mut group = c.benchmark_group("format_utilities");
    configure_fast_group(&mut group);

    let test_durations = vec![Duration::from_millis(100), Duration::from_secs(5)];
    let test_byte_sizes = vec![1024, 1048576];

    group.bench_function("format_duration", |b| {
        b.iter(|| {
            for duration in &test_durations {
                black_box(page_analyzer::format_duration(*duration));
            }
        });
    });
    group.bench_function("format_bytes", |b| {
        b.iter(|| {
            for size in &test_byte_sizes {
                black_box(page_analyzer::format_bytes(*size));
            }
        });
    });
    group.bench_function("validate_url", |b| {
        b.iter(|| {
            for url in ["https://example.com", "http://example.com/path", "invalid-url"] {
                let _ = black_box(page_analyzer::validate_url(url));
            }
        });
    });

    group.finish();
}

// === INTEGRATION BENCHMARKS (loopback servers, no browser) ===

#[cfg(feature = "integration_benchmarks")]
fn benchmark_loopback_scrape(c: &mut Criterion) {
    use page_analyzer::plugins::HtmlExtractor;
    use page_analyzer::{
        AnalysisPlugins, ClientConfig, Endpoint, FetchError, Fetcher, Metrics, ProcessingServer, ProcessorConfig,
        ScrapeClient, ScrapePlugins, ScraperConfig, ScrapingServer,
    };

    struct StaticFetcher;

    #[async_trait::async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, _url: &str, _timeout: Duration) -> Result<PageData, FetchError> {
            Ok(sample_page(16 * 1024))
        }
    }

    let rt = Runtime::new().unwrap();
    let client = rt.block_on(async {
        let processor = ProcessingServer::bind(
            ProcessorConfig {
                listen: Endpoint::new("127.0.0.1", 0),
                ..Default::default()
            },
            AnalysisPlugins::placeholder(),
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap();
        let processor_port = processor.local_addr().unwrap().port();
        tokio::spawn(processor.run(std::future::pending()));

        let scraper = ScrapingServer::bind(
            ScraperConfig {
                listen: Endpoint::new("127.0.0.1", 0),
                processor: Endpoint::new("127.0.0.1", processor_port),
                ..Default::default()
            },
            ScrapePlugins {
                fetcher: Arc::new(StaticFetcher),
                extractor: Arc::new(HtmlExtractor),
            },
            Arc::new(Metrics::new()),
        )
        .await
        .unwrap();
        let scraper_port = scraper.local_addr().unwrap().port();
        tokio::spawn(scraper.run(std::future::pending()));

        ScrapeClient::new(ClientConfig {
            server: Endpoint::new("127.0.0.1", scraper_port),
            ..Default::default()
        })
    });

    let mut group = c.benchmark_group("loopback_scrape");
    configure_fast_group(&mut group);
    group.bench_function("all_analyses", |b| {
        b.iter(|| {
            rt.block_on(async {
                let response = client.scrape("https://example.com/").await.unwrap();
                black_box(response.status);
            })
        });
    });
    group.finish();
}

#[cfg(not(feature = "integration_benchmarks"))]
criterion_group!(
    benches,
    benchmark_codec,
    benchmark_html_analysis,
    benchmark_format_utilities
);

#[cfg(feature = "integration_benchmarks")]
criterion_group!(
    benches,
    benchmark_codec,
    benchmark_html_analysis,
    benchmark_format_utilities,
    benchmark_loopback_scrape
);

criterion_main!(benches);
