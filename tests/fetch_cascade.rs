//! Fetch cascade scenarios against in-process stub servers.

mod common;

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use sandbox_harness::fetch::Fetcher;
use sandbox_harness::models::MarkdownSource;
use sandbox_harness::project::ProjectPaths;
use sandbox_harness::store::{KnowledgeStore, SearchMode};

use common::{sample_markdown, spawn_origin, test_config, OriginBehavior};

struct Fixture {
    _tmp: tempfile::TempDir,
    store: Arc<KnowledgeStore>,
    fetcher: Arc<Fetcher>,
}

async fn fixture(origin_proxy: Option<String>, blocklist: Vec<String>) -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.fetcher.blocked_domains = blocklist;
    if let Some(proxy) = origin_proxy {
        cfg.fetcher.proxy_base = proxy;
    }
    let config = Arc::new(cfg);

    let paths = ProjectPaths::new(&config, "fetch-test");
    let http = reqwest::Client::new();
    let store = Arc::new(
        KnowledgeStore::open(config.clone(), "fetch-test", paths, http.clone())
            .await
            .unwrap(),
    );
    let fetcher = Arc::new(Fetcher::new(config, http));
    Fixture {
        _tmp: tmp,
        store,
        fetcher,
    }
}

#[tokio::test]
async fn test_cascade_negotiated() {
    let markdown = sample_markdown("harness");
    let (origin, state) = spawn_origin(HashMap::from([(
        "guide".to_string(),
        OriginBehavior::NegotiatesMarkdown(markdown),
    )]))
    .await;

    let fix = fixture(None, vec![]).await;
    let outcome = fix
        .fetcher
        .fetch(&fix.store, &format!("{origin}/guide"), false)
        .await
        .unwrap();

    assert!(!outcome.from_cache);
    assert_eq!(outcome.markdown_source, MarkdownSource::Negotiated);
    assert_eq!(outcome.markdown_tokens, Some(321));
    assert_eq!(state.requests.load(Ordering::SeqCst), 1);
    assert!(outcome.chunks >= 1);

    // Raw file and sidecar were written.
    let raw_dir = &fix.store.paths().raw_dir;
    let raw_files: Vec<_> = walkdir::WalkDir::new(raw_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.path().display().to_string())
        .collect();
    assert!(raw_files.iter().any(|p| p.ends_with(".md")));
    assert!(raw_files.iter().any(|p| p.ends_with(".meta.json")));

    // The document is searchable by a heading from the body.
    let hits = fix
        .store
        .search("harness guide", 5, SearchMode::Lexical, None, None)
        .await
        .unwrap();
    assert!(!hits.is_empty());
    assert!(hits[0].title.contains("/guide"));
}

#[tokio::test]
async fn test_cascade_proxy_fallback() {
    // The origin refuses to negotiate; the proxy answers markdown for any
    // path, so tier 2 wins after exactly two outbound requests.
    let (proxy, proxy_state) = spawn_origin(HashMap::new()).await;
    let markdown = sample_markdown("proxied");
    proxy_state
        .routes
        .lock()
        .unwrap()
        .extend([("fallback".to_string(), OriginBehavior::PlainMarkdown(markdown))]);

    let (origin, origin_state) = spawn_origin(HashMap::from([(
        "page".to_string(),
        OriginBehavior::HtmlOnly("<html><body><p>not markdown</p></body></html>".to_string()),
    )]))
    .await;

    // The proxy stub serves every path the same way; point the base at the
    // markdown route and let the target URL trail it.
    let fix = fixture(Some(format!("{proxy}/fallback?u=")), vec![]).await;
    let outcome = fix
        .fetcher
        .fetch(&fix.store, &format!("{origin}/page"), false)
        .await
        .unwrap();

    assert_eq!(outcome.markdown_source, MarkdownSource::MarkdownNew);
    assert_eq!(origin_state.requests.load(Ordering::SeqCst), 1);
    assert_eq!(proxy_state.requests.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_cascade_html_conversion() {
    // Negotiation and proxy both yield HTML; local conversion takes over.
    let (proxy, _proxy_state) = spawn_origin(HashMap::new()).await;
    let html = "<html><body><h1>Converted Title</h1>\
                <p>Paragraph one about conversion.</p>\
                <ul><li>alpha</li><li>beta</li></ul></body></html>";
    let (origin, origin_state) = spawn_origin(HashMap::from([(
        "page".to_string(),
        OriginBehavior::HtmlOnly(html.to_string()),
    )]))
    .await;

    let fix = fixture(Some(format!("{proxy}/nowhere?u=")), vec![]).await;
    let outcome = fix
        .fetcher
        .fetch(&fix.store, &format!("{origin}/page"), false)
        .await
        .unwrap();

    assert_eq!(outcome.markdown_source, MarkdownSource::Html2text);
    // Negotiated attempt + raw attempt hit the origin twice.
    assert_eq!(origin_state.requests.load(Ordering::SeqCst), 2);

    // The conversion produced a markdown heading.
    let raw_dir = &fix.store.paths().raw_dir;
    let raw = walkdir::WalkDir::new(raw_dir)
        .into_iter()
        .filter_map(|e| e.ok())
        .find(|e| e.path().extension().is_some_and(|x| x == "md"))
        .map(|e| std::fs::read_to_string(e.path()).unwrap())
        .expect("raw markdown written");
    assert!(raw.contains("# Converted Title"));
}

#[tokio::test]
async fn test_freshness_window_serves_cache_without_requests() {
    let markdown = sample_markdown("cached");
    let (origin, state) = spawn_origin(HashMap::from([(
        "doc".to_string(),
        OriginBehavior::NegotiatesMarkdown(markdown),
    )]))
    .await;

    let fix = fixture(None, vec![]).await;
    let url = format!("{origin}/doc");

    let first = fix.fetcher.fetch(&fix.store, &url, false).await.unwrap();
    assert!(!first.from_cache);
    let after_first = state.requests.load(Ordering::SeqCst);

    let second = fix.fetcher.fetch(&fix.store, &url, false).await.unwrap();
    assert!(second.from_cache);
    assert_eq!(second.markdown_source, MarkdownSource::Negotiated);
    assert_eq!(
        state.requests.load(Ordering::SeqCst),
        after_first,
        "a cache hit must perform zero outbound requests"
    );

    // `force` bypasses the window.
    let third = fix.fetcher.fetch(&fix.store, &url, true).await.unwrap();
    assert!(!third.from_cache);
    assert!(state.requests.load(Ordering::SeqCst) > after_first);
}

#[tokio::test]
async fn test_blocked_host_never_reaches_network() {
    let (origin, state) = spawn_origin(HashMap::new()).await;
    let fix = fixture(None, vec!["127.0.0.1".to_string()]).await;

    let err = fix
        .fetcher
        .fetch(&fix.store, &format!("{origin}/anything"), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind, sandbox_harness::error::ErrorKind::Blocked);
    assert_eq!(
        state.requests.load(Ordering::SeqCst),
        0,
        "blocked URLs must not be fetched or proxied"
    );
}

#[tokio::test]
async fn test_http_error_is_structured_transport() {
    let (origin, _state) = spawn_origin(HashMap::from([(
        "gone".to_string(),
        OriginBehavior::Failing,
    )]))
    .await;
    // Proxy base pointing at the same failing origin keeps the whole
    // cascade failing.
    let fix = fixture(Some(format!("{origin}/gone?u=")), vec![]).await;

    let err = fix
        .fetcher
        .fetch(&fix.store, &format!("{origin}/gone"), false)
        .await
        .unwrap_err();
    assert_eq!(err.kind, sandbox_harness::error::ErrorKind::Transport);
    assert!(err.message.contains("HTTP"));
}

#[tokio::test]
async fn test_sitemap_expansion() {
    let page_a = sample_markdown("alpha");
    let page_b = sample_markdown("beta");
    let (origin, state) = spawn_origin(HashMap::new()).await;
    let sitemap = format!(
        r#"<?xml version="1.0"?>
<urlset>
  <url><loc>{origin}/a</loc></url>
  <url><loc>{origin}/b</loc></url>
  <url><loc>{origin}/missing</loc></url>
</urlset>"#
    );
    state.routes.lock().unwrap().extend([
        ("sitemap.xml".to_string(), OriginBehavior::Sitemap(sitemap)),
        ("a".to_string(), OriginBehavior::NegotiatesMarkdown(page_a)),
        ("b".to_string(), OriginBehavior::NegotiatesMarkdown(page_b)),
    ]);

    let fix = fixture(None, vec![]).await;
    let report = fix
        .fetcher
        .fetch_sitemap(fix.store.clone(), &format!("{origin}/sitemap.xml"))
        .await
        .unwrap();

    assert_eq!(report.discovered, 3);
    assert_eq!(report.fetched, 2);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].url.ends_with("/missing"));
    assert_eq!(fix.store.status().await.unwrap().doc_count, 2);
}

#[tokio::test]
async fn test_research_resolves_and_fetches() {
    use sandbox_harness::research::{ResearchOrchestrator, TemplateResolver};

    let guide = sample_markdown("signals");
    let extra = sample_markdown("timers");
    let (origin, _state) = spawn_origin(HashMap::from([
        ("guide-signals".to_string(), OriginBehavior::NegotiatesMarkdown(guide)),
        ("extra".to_string(), OriginBehavior::NegotiatesMarkdown(extra)),
    ]))
    .await;

    let tmp = tempfile::tempdir().unwrap();
    let mut cfg = test_config(tmp.path());
    cfg.research.root_templates = vec![format!("{origin}/guide-{{topic}}")];
    let config = Arc::new(cfg);

    let paths = ProjectPaths::new(&config, "signals");
    let http = reqwest::Client::new();
    let store = Arc::new(
        KnowledgeStore::open(config.clone(), "signals", paths, http.clone())
            .await
            .unwrap(),
    );
    let fetcher = Arc::new(Fetcher::new(config.clone(), http));
    let orchestrator = ResearchOrchestrator::new(
        config.clone(),
        fetcher,
        Arc::new(TemplateResolver::from_config(&config)),
    );

    let seeds = vec![format!("{origin}/extra"), format!("{origin}/guide-signals")];
    let report = orchestrator
        .research(store.clone(), "signals", &seeds)
        .await
        .unwrap();

    // Resolver URL + two seeds, deduplicated to two distinct fetches.
    assert_eq!(report.candidates, 2);
    assert_eq!(report.fetched, 2);
    assert!(report.indexed_chunks >= 2);
    assert!(report.failures.is_empty());

    let status = orchestrator.knowledge_status(&store).await.unwrap();
    assert_eq!(status.doc_count, 2);

    orchestrator.knowledge_clear(&store).await.unwrap();
    assert!(!store.paths().index_file.exists());
}

#[tokio::test]
async fn test_load_dir_ingests_matching_files() {
    let tmp = tempfile::tempdir().unwrap();
    let docs_dir = tmp.path().join("docs");
    std::fs::create_dir_all(docs_dir.join("nested")).unwrap();
    std::fs::write(docs_dir.join("one.md"), "# One\n\nFirst local file about anchors.").unwrap();
    std::fs::write(
        docs_dir.join("nested/two.md"),
        "# Two\n\nSecond local file about bollards.",
    )
    .unwrap();
    std::fs::write(docs_dir.join("skip.txt"), "not matched").unwrap();

    let fix = fixture(None, vec![]).await;
    let pattern = format!("{}/**/*.md", docs_dir.display());
    let report = fix.fetcher.load_dir(&fix.store, &pattern).await.unwrap();
    assert_eq!(report.loaded, 2);

    let hits = fix
        .store
        .search("bollards", 5, SearchMode::Lexical, None, None)
        .await
        .unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].label, "local");
    assert!(hits[0].title.ends_with("two.md"));
}
