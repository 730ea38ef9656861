//! headless-prerender CLI
//!
//!   headless-prerender discover --root . --input index.html
//!   headless-prerender patch <module.js> --id vite/preload-helper.js
//!   headless-prerender render --root . --out-dir dist [--route /404]
//!
//! Options for `render` are read from `--config <file.toml>` first; flags
//! override the file.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use headless_prerender::{
    discover::prepare_build_input, patch, prerender_output_dir, BuildOptions, InputOption,
    PrerenderConfig,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "headless-prerender", version, about = "Prerender a built single-page app to static HTML")]
struct Cli {
    /// TOML file with prerender options
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Find the script that exports `prerender` and print the augmented build input
    Discover {
        /// Project root
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Bundler input(s); the HTML document among them is scanned
        #[arg(long, required = true)]
        input: Vec<PathBuf>,
    },

    /// Apply the browser-guard patches to a bundler runtime helper
    Patch {
        /// Module source to patch
        file: PathBuf,

        /// Module id as the bundler sees it (defaults to the file path)
        #[arg(long)]
        id: Option<String>,

        /// Write patched code here (and its map to `<out>.map`) instead of stdout
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Prerender every reachable route of a build output directory in place
    Render {
        /// Project root
        #[arg(long, default_value = ".")]
        root: PathBuf,

        /// Build output directory, relative to the root
        #[arg(long, default_value = "dist")]
        out_dir: PathBuf,

        /// Script exporting `prerender` (skips chunk auto-detection ties)
        #[arg(long)]
        prerender_script: Option<PathBuf>,

        /// CSS selector receiving the rendered markup
        #[arg(long)]
        render_target: Option<String>,

        /// Extra routes to render even if nothing links to them
        #[arg(long = "route")]
        routes: Vec<String>,

        /// Abort when more than this many routes are discovered
        #[arg(long)]
        max_routes: Option<usize>,

        /// Per-route render timeout in milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Fake origin used for `location` and link filtering
        #[arg(long)]
        origin: Option<String>,

        /// Keep source maps in the output
        #[arg(long)]
        sourcemap: bool,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<PrerenderConfig> {
    match path {
        Some(path) => PrerenderConfig::from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(PrerenderConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "headless_prerender=info,sandbox=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    match cli.command {
        Command::Discover { root, input } => {
            let config = load_config(cli.config.as_ref())?;
            let input = match <[PathBuf; 1]>::try_from(input) {
                Ok([single]) => InputOption::Single(single),
                Err(list) => InputOption::List(list),
            };
            let mut build = BuildOptions::new(root, "dist").with_input(input);
            let script = prepare_build_input(&mut build, config.prerender_script.as_deref())?;
            println!("{}", script.display());
            println!("{}", serde_json::to_string_pretty(&build)?);
        }

        Command::Patch { file, id, out } => {
            let code = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let id = id.unwrap_or_else(|| file.to_string_lossy().into_owned());
            let Some(patched) = patch::transform(&code, &id) else {
                tracing::info!(module = %id, "nothing to patch");
                print!("{code}");
                return Ok(());
            };
            tracing::info!(module = %id, rules = ?patched.applied, "patched module");
            match out {
                Some(out) => {
                    std::fs::write(&out, &patched.code)
                        .with_context(|| format!("Failed to write {}", out.display()))?;
                    let map_path = PathBuf::from(format!("{}.map", out.display()));
                    std::fs::write(&map_path, patched.map.to_json_string())
                        .with_context(|| format!("Failed to write {}", map_path.display()))?;
                }
                None => print!("{}", patched.code),
            }
        }

        Command::Render {
            root,
            out_dir,
            prerender_script,
            render_target,
            routes,
            max_routes,
            timeout_ms,
            origin,
            sourcemap,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            if prerender_script.is_some() {
                config.prerender_script = prerender_script;
            }
            if let Some(target) = render_target {
                config.render_target = target;
            }
            config.additional_prerender_routes.extend(routes);
            if max_routes.is_some() {
                config.max_routes = max_routes;
            }
            if timeout_ms.is_some() {
                config.timeout_ms = timeout_ms;
            }
            if let Some(origin) = origin {
                config.origin = origin;
            }
            config.sourcemap |= sourcemap;

            let build = BuildOptions::new(root, out_dir);
            let report = prerender_output_dir(&config, &build).await?;
            for name in &report.emitted {
                println!("{}", build.out_dir.join(name).display());
            }
            if !report.skipped.is_empty() {
                tracing::warn!(routes = ?report.skipped, "routes skipped");
            }
        }
    }

    Ok(())
}
