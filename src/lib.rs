//! # headless-prerender
//!
//! Build-time prerendering for single-page apps. After the bundler has run,
//! the chunk exporting `prerender` is loaded in a `deno_core` sandbox and
//! called once per route. Each result is merged into `index.html` and written
//! as a static page; links it returns are crawled until no new routes remain.
//!
//! ## Sandbox
//!
//! - Modules can only be imported from the temporary sandbox directory
//! - `location`, `self` and `__VITE_PRELOAD__` are shimmed for browser code
//! - `fetch("/path")` reads from the build output; other URLs hit the network,
//!   optionally limited to an allowlist
//! - Routes render one at a time since the shims are shared
//!
//! ## Usage
//!
//! ```rust,ignore
//! use headless_prerender::{prerender_output_dir, BuildOptions, PrerenderConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = PrerenderConfig {
//!         additional_prerender_routes: vec!["/404".into()],
//!         ..Default::default()
//!     };
//!     let build = BuildOptions::new(".", "dist");
//!     let report = prerender_output_dir(&config, &build).await.unwrap();
//!     println!("{:?}", report.emitted);
//! }
//! ```

pub mod bundle;
pub mod compose;
pub mod config;
pub mod crawl;
pub mod discover;
pub mod error;
pub mod exports;
mod fetch;
pub mod head;
mod loader;
pub mod locate;
mod ops;
pub mod patch;
pub mod prerender;
pub mod route;
pub mod runtime;
pub mod sandbox;
mod sanitize;

pub use bundle::{Bundle, OutputAsset, OutputChunk, OutputItem};
pub use config::{BuildOptions, InputOption, PrerenderConfig, PreserveEntrySignatures};
pub use error::{PrerenderError, Result};
pub use fetch::FetchState;
pub use loader::SandboxedLoader;
pub use ops::ConsoleOutput;
pub use prerender::{prerender, prerender_output_dir, PrerenderReport};
pub use route::Route;
pub use runtime::{DenoLoader, SandboxConfig};
pub use sandbox::{EntryLoader, PrerenderFn, PrerenderResult, RenderArgs, SandboxEnvironment};
