//! `deno_core` implementation of the sandbox loader.
//!
//! One `JsRuntime` is created per build. It can only import modules from the
//! sandbox directory (see [`SandboxedLoader`]) and exposes the shims from
//! `bootstrap.js`: `console`, `self`, `location`, `__VITE_PRELOAD__` and a
//! `fetch` that reads root-relative paths from the output directory.
//!
//! Calls into JS go through `__prerender_internal__`, which always settles to
//! a JSON envelope, so exceptions come back as data with their stack intact.

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use deno_core::{v8, JsRuntime, ModuleSpecifier, PollEventLoopOptions, RuntimeOptions};
use serde::Deserialize;
use std::path::Path;
use std::rc::Rc;

use crate::config::PrerenderConfig;
use crate::error::PrerenderError;
use crate::fetch::FetchState;
use crate::loader::SandboxedLoader;
use crate::locate::JsFailure;
use crate::ops::{prerender_runtime, ConsoleOutput};
use crate::sandbox::{EntryLoader, PrerenderFn, PrerenderResult, RenderArgs, SandboxEnvironment};

/// Settings for the JS runtime.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Maximum V8 heap size in bytes (None = unlimited)
    pub max_heap_size: Option<usize>,
    /// Maximum time for loading the entry or rendering one route
    pub timeout_ms: Option<u64>,
    /// Network origins `fetch` may reach (empty = any)
    pub allowed_origins: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            max_heap_size: Some(512 * 1024 * 1024),
            timeout_ms: None,
            allowed_origins: vec![],
        }
    }
}

impl From<&PrerenderConfig> for SandboxConfig {
    fn from(config: &PrerenderConfig) -> Self {
        Self {
            timeout_ms: config.timeout_ms,
            allowed_origins: config.fetch_allowed_origins.clone(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
enum Envelope {
    Ok {
        #[serde(default)]
        value: Option<serde_json::Value>,
    },
    Invalid,
    Error {
        error: JsFailure,
    },
}

/// Create a JS runtime confined to the sandbox directory.
pub fn create_runtime(env: &SandboxEnvironment, config: &SandboxConfig) -> Result<JsRuntime, Error> {
    let loader = SandboxedLoader::new(env.dir())?;

    let create_params = config
        .max_heap_size
        .map(|max_bytes| v8::Isolate::create_params().heap_limits(0, max_bytes));

    let mut runtime = JsRuntime::new(RuntimeOptions {
        module_loader: Some(Rc::new(loader)),
        extensions: vec![prerender_runtime::init_ops_and_esm()],
        create_params,
        ..Default::default()
    });

    if config.max_heap_size.is_some() {
        runtime.add_near_heap_limit_callback(|current, initial| {
            // Keep the limit so V8 fails with an OOM error instead of growing.
            tracing::warn!(
                current_mb = current / (1024 * 1024),
                initial_mb = initial / (1024 * 1024),
                "sandbox near heap limit"
            );
            current
        });
    }

    {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        state.put(ConsoleOutput::default());
        state.put(FetchState {
            out_dir: env.out_dir().to_path_buf(),
            allowed_origins: config.allowed_origins.clone(),
        });
    }

    Ok(runtime)
}

/// Forward console output captured since the last call.
fn flush_console(runtime: &mut JsRuntime, route: &str) {
    let output = {
        let op_state = runtime.op_state();
        let mut state = op_state.borrow_mut();
        std::mem::take(state.borrow_mut::<ConsoleOutput>())
    };
    if !output.is_empty() {
        output.emit(route);
    }
}

/// Evaluate `code`, drive the event loop and return the string its promise
/// resolved to. Execution is terminated after `timeout_ms`.
async fn settle(
    runtime: &mut JsRuntime,
    name: &'static str,
    code: String,
    timeout_ms: Option<u64>,
) -> Result<String, Error> {
    let Some(ms) = timeout_ms else {
        return settle_inner(runtime, name, code).await;
    };

    let isolate_handle = runtime.v8_isolate().thread_safe_handle();
    let timeout_handle = tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(ms)).await;
        isolate_handle.terminate_execution();
    });

    let result = settle_inner(runtime, name, code).await;
    let timed_out = timeout_handle.is_finished();
    timeout_handle.abort();

    match result {
        Err(e) if timed_out || e.to_string().contains("execution terminated") => {
            Err(PrerenderError::Js(format!("render timed out after {ms}ms")).into())
        }
        other => other,
    }
}

async fn settle_inner(runtime: &mut JsRuntime, name: &'static str, code: String) -> Result<String, Error> {
    let global = runtime.execute_script(name, code)?;

    runtime
        .run_event_loop(PollEventLoopOptions::default())
        .await?;

    let scope = &mut runtime.handle_scope();
    let local = v8::Local::new(scope, &global);
    let promise = v8::Local::<v8::Promise>::try_from(local)
        .map_err(|_| anyhow!("{name} did not return a promise"))?;
    match promise.state() {
        v8::PromiseState::Fulfilled => Ok(promise.result(scope).to_rust_string_lossy(scope)),
        v8::PromiseState::Rejected => {
            let exception = promise.result(scope);
            Err(anyhow!("{name} rejected: {}", exception.to_rust_string_lossy(scope)))
        }
        v8::PromiseState::Pending => Err(anyhow!("{name} never settled")),
    }
}

fn parse_envelope(raw: &str) -> Result<Envelope, Error> {
    serde_json::from_str(raw).map_err(|e| anyhow!("malformed sandbox response: {e}"))
}

/// Loads the prerender entry into a fresh `deno_core` runtime.
#[derive(Debug, Clone, Default)]
pub struct DenoLoader {
    config: SandboxConfig,
}

impl DenoLoader {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }
}

#[async_trait(?Send)]
impl EntryLoader for DenoLoader {
    type Prerender = DenoPrerender;

    async fn load_entry_point(
        &mut self,
        env: &SandboxEnvironment,
        path: &Path,
    ) -> Result<DenoPrerender, Error> {
        let mut runtime = create_runtime(env, &self.config)?;
        let specifier = ModuleSpecifier::from_file_path(path)
            .map_err(|_| anyhow!("Invalid entry point '{}'", path.display()))?;
        let code = format!(
            "globalThis.__prerender_internal__.load({})",
            serde_json::to_string(specifier.as_str())?
        );

        let raw = settle(&mut runtime, "<prerender:load>", code, self.config.timeout_ms).await;
        flush_console(&mut runtime, "<load>");
        match parse_envelope(&raw?)? {
            Envelope::Ok { .. } => {
                tracing::debug!(entry = %specifier, "loaded prerender entry");
                Ok(DenoPrerender {
                    runtime,
                    timeout_ms: self.config.timeout_ms,
                })
            }
            Envelope::Invalid => Err(PrerenderError::NotAFunction.into()),
            Envelope::Error { error } => Err(error.into()),
        }
    }
}

/// The `prerender` export of a loaded entry.
pub struct DenoPrerender {
    runtime: JsRuntime,
    timeout_ms: Option<u64>,
}

#[async_trait(?Send)]
impl PrerenderFn for DenoPrerender {
    async fn call(
        &mut self,
        env: &SandboxEnvironment,
        args: &RenderArgs,
    ) -> Result<Option<PrerenderResult>, Error> {
        let code = format!(
            "globalThis.__prerender_internal__.render({}, {})",
            serde_json::to_string(env.location())?,
            serde_json::to_string(args)?
        );

        let raw = settle(&mut self.runtime, "<prerender:render>", code, self.timeout_ms).await;
        flush_console(&mut self.runtime, &args.url);
        match parse_envelope(&raw?)? {
            Envelope::Ok { value: None } => Ok(None),
            Envelope::Ok { value: Some(value) } => serde_json::from_value(value)
                .map(Some)
                .map_err(|e| {
                    PrerenderError::Js(format!(
                        "prerender returned an unusable result for {}: {e}",
                        args.url
                    ))
                    .into()
                }),
            Envelope::Invalid => Err(PrerenderError::NotAFunction.into()),
            Envelope::Error { error } => Err(error.into()),
        }
    }
}
