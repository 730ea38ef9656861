//! Route Crawler.
//!
//! Routes are rendered one at a time in discovery order, starting from `/`
//! and the configured extra routes. Same-origin links returned by each
//! render are queued once; a route is marked seen when it is queued, not
//! when it is visited, so several pages linking to it cannot queue it twice.

use std::collections::{HashSet, VecDeque};
use std::rc::Rc;

use url::Url;

use crate::error::{PrerenderError, Result};
use crate::locate::ErrorLocator;
use crate::route::{normalize_pathname, same_origin_pathname, Route};
use crate::sandbox::{PrerenderFn, PrerenderResult, RenderArgs, SandboxEnvironment};

/// FIFO queue of routes plus the set of pathnames already queued.
#[derive(Debug)]
pub struct Crawler {
    queue: VecDeque<Rc<Route>>,
    seen: HashSet<String>,
    origin: Url,
    max_routes: Option<usize>,
}

impl Crawler {
    /// Seed the queue with `/` followed by `additional` routes.
    pub fn new(origin: Url, additional: &[String], max_routes: Option<usize>) -> Result<Self> {
        let mut crawler = Self {
            queue: VecDeque::new(),
            seen: HashSet::new(),
            origin,
            max_routes,
        };
        // Empty seeds name no route and do not count against the limit.
        let seeds = std::iter::once("/")
            .chain(additional.iter().map(String::as_str))
            .filter(|url| !url.is_empty());
        for url in seeds {
            crawler.push(Route::new(normalize_pathname(url)))?;
        }
        Ok(crawler)
    }

    fn push(&mut self, route: Route) -> Result<bool> {
        if !self.seen.insert(route.url.clone()) {
            return Ok(false);
        }
        if let Some(limit) = self.max_routes {
            if self.seen.len() > limit {
                return Err(PrerenderError::RouteLimit(limit));
            }
        }
        self.queue.push_back(Rc::new(route));
        Ok(true)
    }

    pub fn next_route(&mut self) -> Option<Rc<Route>> {
        self.queue.pop_front()
    }

    /// Queue the unseen same-origin `links` discovered while rendering `from`.
    pub fn enqueue_links(&mut self, from: &Rc<Route>, links: &[String]) -> Result<usize> {
        let mut added = 0;
        for link in links {
            let Some(pathname) = same_origin_pathname(link, &self.origin) else {
                continue;
            };
            if self.push(Route::discovered(pathname.clone(), Rc::clone(from)))? {
                tracing::debug!(route = %pathname, from = %from.url, "queued discovered route");
                added += 1;
            }
        }
        Ok(added)
    }

    pub fn has_seen(&self, url: &str) -> bool {
        self.seen.contains(url)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }
}

/// Routes visited by a crawl.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrawlSummary {
    pub rendered: Vec<String>,
    pub skipped: Vec<String>,
}

/// Render every route reachable from the crawler's seeds.
///
/// `on_result` receives each non-null result in visit order. A null result
/// is logged and skipped; any error from rendering goes through `locator`
/// and aborts the crawl.
pub async fn crawl<P, F>(
    prerender: &mut P,
    env: &mut SandboxEnvironment,
    crawler: &mut Crawler,
    locator: &ErrorLocator,
    mut on_result: F,
) -> Result<CrawlSummary>
where
    P: PrerenderFn,
    F: FnMut(&Route, &PrerenderResult) -> Result<()>,
{
    let mut summary = CrawlSummary::default();

    while let Some(route) = crawler.next_route() {
        tracing::debug!(route = %route.url, pending = crawler.pending(), "rendering route");

        env.set_location(&route.url)?;
        let args = RenderArgs::new(&route);
        let result = prerender
            .call(env, &args)
            .await
            .map_err(|e| locator.locate(e))?;

        let Some(result) = result else {
            tracing::warn!(
                route = %route.url,
                via = %route.provenance().join(" -> "),
                "prerender returned nothing; skipping route"
            );
            summary.skipped.push(route.url.clone());
            continue;
        };

        crawler.enqueue_links(&route, &result.links)?;
        on_result(route.as_ref(), &result)?;
        summary.rendered.push(route.url.clone());
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bundle::Bundle;
    use crate::config::BuildOptions;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use tempfile::tempdir;

    /// Canned results keyed by route, recording every call.
    struct FakePrerender {
        pages: HashMap<&'static str, Option<PrerenderResult>>,
        calls: Vec<(String, String)>,
    }

    impl FakePrerender {
        fn new(pages: Vec<(&'static str, Option<PrerenderResult>)>) -> Self {
            Self {
                pages: pages.into_iter().collect(),
                calls: Vec::new(),
            }
        }
    }

    #[async_trait(?Send)]
    impl PrerenderFn for FakePrerender {
        async fn call(
            &mut self,
            env: &SandboxEnvironment,
            args: &RenderArgs,
        ) -> anyhow::Result<Option<PrerenderResult>> {
            self.calls
                .push((args.url.clone(), env.location().pathname.clone()));
            match self.pages.get(args.url.as_str()) {
                Some(result) => Ok(result.clone()),
                None => Err(anyhow::anyhow!("no page for {}", args.url)),
            }
        }
    }

    fn page(html: &str, links: &[&str]) -> Option<PrerenderResult> {
        Some(PrerenderResult {
            html: Some(html.to_string()),
            links: links.iter().map(|l| l.to_string()).collect(),
            ..PrerenderResult::default()
        })
    }

    fn origin() -> Url {
        Url::parse("http://localhost").unwrap()
    }

    fn setup() -> (tempfile::TempDir, SandboxEnvironment, ErrorLocator) {
        let project = tempdir().unwrap();
        let build = BuildOptions::new(project.path(), "dist");
        let env = SandboxEnvironment::create(&build, "http://localhost").unwrap();
        let locator = ErrorLocator::new(env.dir(), project.path(), &build.out_dir, &Bundle::new());
        (project, env, locator)
    }

    #[test]
    fn test_seeds_are_normalized_and_deduplicated() {
        let mut crawler = Crawler::new(
            origin(),
            &["/404/".to_string(), "/".to_string(), String::new()],
            None,
        )
        .unwrap();
        let urls: Vec<String> = std::iter::from_fn(|| crawler.next_route())
            .map(|r| r.url.clone())
            .collect();
        assert_eq!(urls, vec!["/", "/404"]);
    }

    #[test]
    fn test_empty_seeds_do_not_count_toward_limit() {
        let crawler = Crawler::new(
            origin(),
            &[String::new(), "/404".to_string(), String::new()],
            Some(2),
        )
        .unwrap();
        assert_eq!(crawler.pending(), 2);
        assert!(!crawler.has_seen(""));
    }

    #[test]
    fn test_only_same_origin_links_are_queued() {
        let mut crawler = Crawler::new(origin(), &[], None).unwrap();
        let root = crawler.next_route().unwrap();
        let added = crawler
            .enqueue_links(
                &root,
                &[
                    "/about".to_string(),
                    "https://external.com/x".to_string(),
                    "/about/".to_string(),
                    "/".to_string(),
                ],
            )
            .unwrap();
        assert_eq!(added, 1);
        let about = crawler.next_route().unwrap();
        assert_eq!(about.url, "/about");
        assert_eq!(about.provenance(), vec!["/", "/about"]);
        assert!(crawler.next_route().is_none());
    }

    #[test]
    fn test_route_limit() {
        let mut crawler = Crawler::new(origin(), &[], Some(2)).unwrap();
        let root = crawler.next_route().unwrap();
        let err = crawler
            .enqueue_links(&root, &["/a".to_string(), "/b".to_string()])
            .unwrap_err();
        assert!(matches!(err, PrerenderError::RouteLimit(2)));
    }

    #[tokio::test]
    async fn test_crawl_visits_each_route_once_breadth_first() {
        let (_project, mut env, locator) = setup();
        let mut prerender = FakePrerender::new(vec![
            ("/", page("home", &["/a", "/b", "https://external.com/x"])),
            ("/a", page("a", &["/b", "/a/deep", "/"])),
            ("/b", page("b", &["/a"])),
            ("/a/deep", page("deep", &[])),
        ]);
        let mut crawler = Crawler::new(origin(), &[], None).unwrap();
        let mut seen_results = Vec::new();

        let summary = crawl(&mut prerender, &mut env, &mut crawler, &locator, |route, result| {
            seen_results.push((route.url.clone(), result.html.clone().unwrap_or_default()));
            Ok(())
        })
        .await
        .unwrap();

        assert_eq!(summary.rendered, vec!["/", "/a", "/b", "/a/deep"]);
        assert!(summary.skipped.is_empty());
        assert_eq!(seen_results[3], ("/a/deep".to_string(), "deep".to_string()));
        // `location` tracks the route being rendered.
        for (url, pathname) in &prerender.calls {
            assert_eq!(url, pathname);
        }
        assert_eq!(prerender.calls.len(), 4);
    }

    #[tokio::test]
    async fn test_null_result_is_skipped_and_crawl_continues() {
        let (_project, mut env, locator) = setup();
        let mut prerender = FakePrerender::new(vec![
            ("/", page("home", &["/gone", "/kept"])),
            ("/gone", None),
            ("/kept", page("kept", &[])),
        ]);
        let mut crawler = Crawler::new(origin(), &[], None).unwrap();

        let summary = crawl(&mut prerender, &mut env, &mut crawler, &locator, |_, _| Ok(()))
            .await
            .unwrap();
        assert_eq!(summary.rendered, vec!["/", "/kept"]);
        assert_eq!(summary.skipped, vec!["/gone"]);
    }

    #[tokio::test]
    async fn test_additional_routes_are_rendered_without_links() {
        let (_project, mut env, locator) = setup();
        let mut prerender = FakePrerender::new(vec![
            ("/", page("home", &[])),
            ("/404", page("missing", &[])),
        ]);
        let mut crawler = Crawler::new(origin(), &["/404".to_string()], None).unwrap();

        let summary = crawl(&mut prerender, &mut env, &mut crawler, &locator, |_, _| Ok(()))
            .await
            .unwrap();
        assert_eq!(summary.rendered, vec!["/", "/404"]);
    }

    #[tokio::test]
    async fn test_render_errors_abort() {
        let (_project, mut env, locator) = setup();
        let mut prerender = FakePrerender::new(vec![("/", page("home", &["/broken"]))]);
        let mut crawler = Crawler::new(origin(), &[], None).unwrap();

        let err = crawl(&mut prerender, &mut env, &mut crawler, &locator, |_, _| Ok(()))
            .await
            .unwrap_err();
        assert!(matches!(err, PrerenderError::SandboxLoad { located: false, .. }));
        assert!(err.to_string().contains("no page for /broken"));
    }
}
