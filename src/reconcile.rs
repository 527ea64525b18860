//! The outer reconcile loop (spec.md §4.7): fetch -> resolve -> render ->
//! diff -> write -> status -> requeue.

use crate::crd::{ConditionType, SecretRef, SecretTemplate, SecretTemplateStatus};
use crate::crossns::CrossNamespaceConfig;
use crate::error::ControllerError;
use crate::render;
use crate::resolver;
use crate::satoken::TokenManager;
use crate::tracker::{ObjectKey, Tracker};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{self, Event as FinalizerEvent};
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::Value;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

pub const GENERATE_INPUTS_ANNOTATION: &str = "templatedsecret.starstreak.dev/generate-inputs";
pub const LAST_GENERATED_ANNOTATION: &str = "templatedsecret.starstreak.dev/last-generated";
pub const SECRETTEMPLATE_LABEL: &str = "templatedsecret.starstreak.dev/secrettemplate";

const FIELD_MANAGER: &str = "templated-secret-controller";
const RECONCILE_DEADLINE: Duration = Duration::from_secs(5 * 60);
const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(120);

/// Same `<plural>.<group>` naming the pack's own operators use for their
/// finalizers (e.g. `quay-clair-operator`'s `clairs.clairproject.org`).
const TEMPLATE_FINALIZER: &str = "secrettemplates.templatedsecret.starstreak.dev";

#[derive(Clone)]
pub struct Context {
  pub client: Client,
  pub config: kube::Config,
  pub token_manager: Arc<TokenManager>,
  pub tracker: Arc<Tracker>,
  pub cross_namespace: CrossNamespaceConfig,
  pub reconciliation_interval: Duration,
  pub max_secret_age: Duration,
  /// Per-key consecutive-failure streak driving `error_policy`'s
  /// exponential backoff; reset to 0 on every successful reconcile.
  pub failure_streaks: Arc<Mutex<HashMap<(String, String), u32>>>,
}

/// Entry point wired onto the `Controller`. Wraps the reconcile/cleanup
/// pair in a `kube::runtime::finalizer` so a deleted `SecretTemplate` gets
/// exactly one more reconcile (the `Cleanup` event) to prune its tracker
/// entries before the finalizer is removed and the object actually goes
/// away (spec.md §4.7 step 1) -- mirrors the pack's own
/// `quay-clair-operator` controller, which finalizes `Clair` for the same
/// reason. Also the outer panic-recovery boundary (spec.md §7): a panic
/// anywhere below is caught here rather than taking down the whole merged
/// controller stream in `main.rs`.
pub async fn reconcile(template: Arc<SecretTemplate>, ctx: Arc<Context>) -> Result<Action, ControllerError> {
  let namespace = template.namespace().unwrap_or_default();
  let templates: Api<SecretTemplate> = Api::namespaced(ctx.client.clone(), &namespace);
  let template_for_panic = Arc::clone(&template);
  let templates_for_panic = templates.clone();

  let fut = AssertUnwindSafe(async move {
    finalizer::finalizer(&templates, TEMPLATE_FINALIZER, template, |event| {
      let ctx = Arc::clone(&ctx);
      async move {
        match event {
          FinalizerEvent::Apply(template) => reconcile_with_deadline(&template, &ctx).await,
          FinalizerEvent::Cleanup(template) => cleanup(&template, &ctx).await,
        }
      }
    })
    .await
  });

  match fut.catch_unwind().await {
    Ok(Ok(action)) => Ok(action),
    Ok(Err(e)) => Err(finalizer_error(e)),
    Err(panic) => {
      let message = panic_message(&panic);
      error!(panic = %message, "reconcile panicked");
      let err = ControllerError::InternalError(format!("panic: {message}"));
      let _ = fail(&templates_for_panic, &template_for_panic, &err).await;
      Err(err)
    }
  }
}

async fn reconcile_with_deadline(template: &SecretTemplate, ctx: &Context) -> Result<Action, ControllerError> {
  match tokio::time::timeout(RECONCILE_DEADLINE, reconcile_inner(template, ctx)).await {
    Ok(result) => result,
    Err(_) => {
      warn!("reconcile exceeded its deadline");
      Err(ControllerError::Timeout)
    }
  }
}

/// Runs once for a `SecretTemplate` whose deletion timestamp is set, before
/// the finalizer is removed. Clears its tracker entries so `watches.rs`
/// stops enqueuing it and the forward/reverse maps don't grow unbounded.
async fn cleanup(template: &SecretTemplate, ctx: &Context) -> Result<Action, ControllerError> {
  let namespace = template.namespace().unwrap_or_default();
  let template_key = ObjectKey::new("templatedsecret.starstreak.dev", "SecretTemplate", namespace, template.name_any());
  ctx.tracker.untrack(&template_key);
  Ok(Action::await_change())
}

fn finalizer_error(e: finalizer::Error<ControllerError>) -> ControllerError {
  match e {
    finalizer::Error::ApplyFailed(err) | finalizer::Error::CleanupFailed(err) => err,
    other => ControllerError::InternalError(format!("finalizer error: {other}")),
  }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    (*s).to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

async fn reconcile_inner(template: &SecretTemplate, ctx: &Context) -> Result<Action, ControllerError> {
  let name = template.name_any();
  let namespace = template.namespace().unwrap_or_default();
  let secrets: Api<Secret> = Api::namespaced(ctx.client.clone(), &namespace);

  let existing_secret = secrets.get_opt(&name).await.map_err(ControllerError::SecretGetFailed)?;

  let templates: Api<SecretTemplate> = Api::namespaced(ctx.client.clone(), &namespace);

  // Inputs must be resolved (and the fingerprint recomputed) *before* any
  // short-circuit decision -- a tracked input can change without bumping
  // `spec.generation` or touching the output `Secret`, and the only way to
  // notice that is to compare the freshly-resolved fingerprint against the
  // one stored on the output (spec.md §1, §8).
  let (values, resolution) = resolver::resolve_inputs(
    &ctx.client,
    &ctx.config,
    &ctx.token_manager,
    &ctx.tracker,
    &ctx.cross_namespace,
    template,
  )
  .await;

  if let Err(e) = resolution {
    fail(&templates, template, &e).await?;
    return Err(e);
  }

  let fingerprint = fingerprint(&values)?;

  if should_short_circuit(template, existing_secret.as_ref(), &fingerprint, ctx.max_secret_age) {
    info!(%namespace, %name, "no input changes and output is fresh; skipping");
    return Ok(Action::requeue(ctx.reconciliation_interval));
  }

  let owner_ref = template
    .controller_owner_ref(&())
    .ok_or_else(|| ControllerError::InternalError("SecretTemplate is missing name/uid for owner reference".to_string()))?;

  let rendered = render::render(&values, &template.spec.json_path_template, &template.metadata, &name);
  let mut desired = match rendered {
    Ok(secret) => secret,
    Err(e) => {
      fail(&templates, template, &e).await?;
      return Err(e);
    }
  };

  let now = Utc::now();

  desired.metadata.name = Some(name.clone());
  desired.metadata.namespace = Some(namespace.clone());
  desired.metadata.owner_references = Some(vec![owner_ref]);
  desired
    .metadata
    .annotations
    .get_or_insert_with(Default::default)
    .insert(GENERATE_INPUTS_ANNOTATION.to_string(), fingerprint.clone());
  desired
    .metadata
    .annotations
    .get_or_insert_with(Default::default)
    .insert(LAST_GENERATED_ANNOTATION.to_string(), now.to_rfc3339());

  let written = match &existing_secret {
    None => true,
    Some(existing) => needs_write(existing, &desired, ctx.max_secret_age, now),
  };

  if written {
    if let Some(existing) = &existing_secret {
      desired.metadata.uid = existing.metadata.uid.clone();
      desired.metadata.resource_version = existing.metadata.resource_version.clone();
    }

    let applied = apply_secret(&secrets, &name, &existing_secret, &desired).await?;

    succeed(ctx, &templates, template, &name, applied.metadata.resource_version.as_deref().unwrap_or_default()).await?;
  } else if let Some(existing) = &existing_secret {
    succeed(ctx, &templates, template, &name, existing.metadata.resource_version.as_deref().unwrap_or_default()).await?;
  }

  Ok(Action::requeue(ctx.reconciliation_interval))
}

/// Called only after inputs have been freshly resolved and fingerprinted
/// this reconcile -- `fingerprint` is always the *current* state of the
/// inputs, never a value trusted from a prior reconcile, so a tracked input
/// that changed without bumping `spec.generation` or touching the output
/// always fails this check and falls through to render/write (spec.md §1,
/// §8).
fn should_short_circuit(template: &SecretTemplate, existing_secret: Option<&Secret>, fingerprint: &str, max_secret_age: Duration) -> bool {
  let Some(status) = &template.status else { return false };
  let Some(observed) = status.observed_generation else { return false };
  if Some(observed) != template.metadata.generation {
    return false;
  }

  let Some(existing) = existing_secret else { return false };

  // A drifted/manually-edited output has a live resourceVersion that no
  // longer matches what the last successful reconcile observed -- treat
  // that as unconverged even though the template itself hasn't changed
  // (spec.md §8 concrete scenario 6).
  let Some(observed_rv) = &status.observed_secret_resource_version else { return false };
  if Some(observed_rv.as_str()) != existing.metadata.resource_version.as_deref() {
    return false;
  }

  let annotations = existing.metadata.annotations.clone().unwrap_or_default();
  let Some(existing_fingerprint) = annotations.get(GENERATE_INPUTS_ANNOTATION) else {
    return false;
  };
  if existing_fingerprint != fingerprint {
    return false;
  }

  let Some(status_name) = status.secret.as_ref().map(|s| s.name.as_str()) else {
    return false;
  };
  if status_name != existing.name_any() {
    return false;
  }

  !is_stale(existing, max_secret_age, Utc::now())
}

/// A secret with no `last-generated` annotation (e.g. pre-existing before
/// this controller managed it) is treated as infinitely old and always
/// regenerated (spec.md §9 Open Question).
fn is_stale(secret: &Secret, max_secret_age: Duration, now: DateTime<Utc>) -> bool {
  let Some(annotations) = &secret.metadata.annotations else {
    return true;
  };
  let Some(last_generated) = annotations.get(LAST_GENERATED_ANNOTATION) else {
    return true;
  };
  let Ok(parsed) = DateTime::parse_from_rfc3339(last_generated) else {
    return true;
  };

  now.signed_duration_since(parsed.with_timezone(&Utc)) > chrono::Duration::from_std(max_secret_age).unwrap_or(chrono::Duration::MAX)
}

fn needs_write(existing: &Secret, desired: &Secret, max_secret_age: Duration, now: DateTime<Utc>) -> bool {
  let existing_fingerprint = existing
    .metadata
    .annotations
    .as_ref()
    .and_then(|a| a.get(GENERATE_INPUTS_ANNOTATION));
  let desired_fingerprint = desired.metadata.annotations.as_ref().and_then(|a| a.get(GENERATE_INPUTS_ANNOTATION));

  existing_fingerprint != desired_fingerprint || existing.type_ != desired.type_ || existing.data != desired.data || is_stale(existing, max_secret_age, now)
}

async fn apply_secret(api: &Api<Secret>, name: &str, existing: &Option<Secret>, desired: &Secret) -> Result<Secret, ControllerError> {
  match existing {
    Some(_) => api
      .patch(
        name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(desired),
      )
      .await
      .map_err(ControllerError::OutputWriteFailed),
    None => api.create(&PostParams::default(), desired).await.map_err(ControllerError::OutputWriteFailed),
  }
}

/// Canonical JSON of the resolved input map with keys sorted — `Value`'s
/// object map is a `BTreeMap` by default (the `preserve_order` feature of
/// `serde_json` is not enabled), so plain serialization is already
/// canonical.
fn fingerprint(values: &Value) -> Result<String, ControllerError> {
  serde_json::to_string(values).map_err(|e| ControllerError::InternalError(format!("failed to fingerprint inputs: {e}")))
}

async fn fail(templates: &Api<SecretTemplate>, template: &SecretTemplate, error: &ControllerError) -> Result<(), ControllerError> {
  let mut status = template.status.clone().unwrap_or_default();
  status.observed_generation = template.metadata.generation;
  // A bad template (InvalidTemplate) is a user-correctable spec problem,
  // not a transient reconcile failure -- it gets its own condition type so
  // it isn't retried with the same backoff as e.g. a flaky API call.
  let condition = match error {
    ControllerError::InvalidTemplate { .. } => ConditionType::Invalid,
    _ => ConditionType::ReconcileFailed,
  };
  status.set_condition(condition, Some(error.reason().to_string()), Some(error.to_string()), &Utc::now().to_rfc3339());
  patch_status(templates, template, status).await
}

async fn succeed(ctx: &Context, templates: &Api<SecretTemplate>, template: &SecretTemplate, secret_name: &str, resource_version: &str) -> Result<(), ControllerError> {
  reset_failure_streak(ctx, template);
  let mut status = template.status.clone().unwrap_or_default();
  status.observed_generation = template.metadata.generation;
  status.observed_secret_resource_version = Some(resource_version.to_string());
  status.secret = Some(SecretRef { name: secret_name.to_string() });
  status.set_condition(ConditionType::ReconcileSucceeded, None, None, &Utc::now().to_rfc3339());
  patch_status(templates, template, status).await
}

fn streak_key(template: &SecretTemplate) -> (String, String) {
  (template.namespace().unwrap_or_default(), template.name_any())
}

fn reset_failure_streak(ctx: &Context, template: &SecretTemplate) {
  ctx.failure_streaks.lock().expect("failure-streak lock poisoned").remove(&streak_key(template));
}

async fn patch_status(templates: &Api<SecretTemplate>, template: &SecretTemplate, status: SecretTemplateStatus) -> Result<(), ControllerError> {
  let name = template.name_any();
  let patch = serde_json::json!({ "status": status });

  templates
    .patch_status(&name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(patch))
    .await
    .map_err(ControllerError::OutputWriteFailed)?;

  Ok(())
}

/// `error_policy`: per-key exponential backoff, base 100ms cap 120s. The
/// runtime calls this exactly once per failed reconcile (including a
/// `Timeout`), so the streak is bumped here; `succeed` resets it to 0 on the
/// next clean reconcile.
pub fn error_policy(template: Arc<SecretTemplate>, error: &ControllerError, ctx: Arc<Context>) -> Action {
  warn!(error = %error, "reconcile failed");

  let failure_count = {
    let mut streaks = ctx.failure_streaks.lock().expect("failure-streak lock poisoned");
    let count = streaks.entry(streak_key(&template)).or_insert(0);
    *count = count.saturating_add(1);
    *count
  };

  Action::requeue(backoff_for(failure_count))
}

/// `failure_count` is the number of consecutive failures including this
/// one (so the first failure gets the base delay, not an instant retry).
fn backoff_for(failure_count: u32) -> Duration {
  INITIAL_BACKOFF.saturating_mul(1 << (failure_count - 1).min(10)).min(MAX_BACKOFF)
}

/// Enqueue key derived from a tracked-object change: every tracking
/// template currently watching `object` gets exactly one enqueue.
pub fn templates_tracking(tracker: &Tracker, object: &ObjectKey) -> Vec<ObjectKey> {
  tracker.tracking(object).into_iter().collect()
}
