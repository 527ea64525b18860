mod crd;
mod crossns;
mod error;
mod expansion;
mod jsonpath;
mod prelude;
mod reconcile;
mod render;
mod resolver;
mod satoken;
mod tracker;
mod watches;

use prelude::*;

use crd::SecretTemplate;
use crossns::CrossNamespaceConfig;
use futures::stream::{self, StreamExt};
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::{watcher, Controller};
use reconcile::{error_policy, reconcile, Context};
use satoken::TokenManager;
use std::collections::HashSet;
use tracker::Tracker;
use watches::WatchManager;

#[tokio::main]
async fn main() -> Result<()> {
  let args = argwerk::args! {
    "templated-secret-controller [options]" {
      help: bool,
      crd: bool,
      watch_namespaces: Option<String>,
      reconciliation_interval_secs: u64 = 3600,
      max_secret_age_secs: u64 = 86400,
      enable_cross_namespace: bool,
      warn_on_unwatched: bool = true,
      log_level: String = "info".to_string(),
    }

    /// Minimum tracing level (error, warn, info, debug, trace) unless
    /// overridden by the RUST_LOG environment variable. Default "info".
    ["--log-level", level] => {
      log_level = level;
    }

    /// Print the CRD manifest (YAML) and exit.
    ["--crd"] => {
      crd = true;
    }

    /// Comma-separated list of namespaces to watch. Omitted or empty means
    /// cluster-wide.
    ["--watch-namespaces", ns] => {
      watch_namespaces = Some(ns);
    }

    /// Seconds between drift-detection reconciles of an otherwise-healthy
    /// template. Default 3600 (1h).
    ["--reconciliation-interval", secs] => {
      reconciliation_interval_secs = str::parse(&secs)?;
    }

    /// Maximum age, in seconds, of an output Secret before it is
    /// force-regenerated even with an unchanged input fingerprint. Default
    /// 86400 (24h).
    ["--max-secret-age", secs] => {
      max_secret_age_secs = str::parse(&secs)?;
    }

    /// Allow input references whose namespace differs from the owning
    /// template's own namespace (subject to the source object's
    /// allow-namespaces annotation).
    ["--enable-cross-namespace-secret-inputs"] => {
      enable_cross_namespace = true;
    }

    /// Suppress the diagnostic event normally emitted when a cross-namespace
    /// input reaches outside the watched namespace set.
    ["--no-warn-on-unwatched-cross-namespaces"] => {
      warn_on_unwatched = false;
    }

    /// Print this help.
    ["-h" | "--help"] => {
      println!("{}", HELP);
      help = true;
    }
  }?;

  if args.help {
    return Ok(());
  }

  setup_logging(&args.log_level)?;

  if args.crd {
    let crd = SecretTemplate::crd();
    let yaml = serde_yaml::to_string(&crd)?;
    println!("{yaml}");
    return Ok(());
  }

  let watch_namespaces: Vec<String> = args
    .watch_namespaces
    .as_deref()
    .unwrap_or("")
    .split(',')
    .map(str::trim)
    .filter(|s| !s.is_empty())
    .map(str::to_string)
    .collect();

  let kube_config = kube::Config::infer().await?;
  let client = Client::try_from(kube_config.clone())?;

  let cross_namespace = CrossNamespaceConfig {
    enabled: args.enable_cross_namespace,
    warn_on_unwatched: args.warn_on_unwatched,
    watched_namespaces: watch_namespaces.iter().cloned().collect::<HashSet<_>>(),
  };

  let tracker = Arc::new(Tracker::new());
  let watch_manager = WatchManager::new(client.clone(), Arc::clone(&tracker));

  let ctx = Arc::new(Context {
    client: client.clone(),
    config: kube_config,
    token_manager: Arc::new(TokenManager::new()),
    tracker: Arc::clone(&tracker),
    cross_namespace,
    reconciliation_interval: Duration::from_secs(args.reconciliation_interval_secs),
    max_secret_age: Duration::from_secs(args.max_secret_age_secs),
    failure_streaks: Arc::new(std::sync::Mutex::new(HashMap::new())),
  });

  info!("starting templated-secret-controller");
  info!(namespaces = ?watch_namespaces, "watch scope");

  tokio::spawn(Arc::clone(&watch_manager).run());

  let reconciler_streams = if watch_namespaces.is_empty() {
    vec![run_controller(Api::all(client.clone()), Api::all(client.clone()), &watch_manager, Arc::clone(&ctx))]
  } else {
    watch_namespaces
      .iter()
      .map(|ns| {
        run_controller(
          Api::namespaced(client.clone(), ns),
          Api::namespaced(client.clone(), ns),
          &watch_manager,
          Arc::clone(&ctx),
        )
      })
      .collect()
  };

  let mut merged = stream::select_all(reconciler_streams);
  while let Some(result) = merged.next().await {
    log_reconcile_result(result);
  }

  info!("controller terminated");
  Ok(())
}

fn run_controller(
  templates: Api<SecretTemplate>,
  secrets: Api<Secret>,
  watch_manager: &Arc<WatchManager>,
  ctx: Arc<Context>,
) -> std::pin::Pin<Box<dyn futures::Stream<Item = ReconcileResult> + Send>> {
  Box::pin(
    Controller::new(templates, watcher::Config::default())
      .owns(secrets, watcher::Config::default())
      .reconcile_all_on(watch_manager.subscribe())
      .shutdown_on_signal()
      .run(reconcile, error_policy, ctx),
  )
}

type ReconcileResult = Result<
  (kube::runtime::reflector::ObjectRef<SecretTemplate>, Action),
  kube::runtime::controller::Error<ControllerError, kube::runtime::watcher::Error>,
>;

fn log_reconcile_result(res: ReconcileResult) {
  match res {
    Ok((o, _)) => info!(namespace = o.namespace.as_deref().unwrap_or("NIL"), name = %o.name, "reconciled"),
    Err(e) => warn!(error = %e, "reconcile failed"),
  }
}

const HELP: &str = "\
templated-secret-controller

Reconciles SecretTemplate.templatedsecret.starstreak.dev/v1alpha1 custom
resources into derived Secret objects by resolving declared input resources
and rendering a JSONPath/$(...) template against them.

USAGE:
  templated-secret-controller [OPTIONS]

OPTIONS:
  --crd                                     Print the CRD manifest and exit
  --watch-namespaces <NS,NS,...>             Namespaces to watch (default: cluster-wide)
  --reconciliation-interval <SECS>           Drift-detection interval (default: 3600)
  --max-secret-age <SECS>                    Force-regenerate age threshold (default: 86400)
  --enable-cross-namespace-secret-inputs     Allow cross-namespace input references
  --no-warn-on-unwatched-cross-namespaces    Suppress the unwatched-namespace diagnostic
  --log-level <LEVEL>                       Tracing level unless RUST_LOG is set (default: info)
  -h, --help                                Print this help
";
