//! Dynamic watch wiring for tracked input resources (spec.md §5, §9 Design
//! Notes: "model as a tracker of `(tracked, tracking)` edges and a single
//! dispatch function that, on any object notification, looks up the reverse
//! index and enqueues owners. Avoid per-template subscription threads.").
//!
//! `SecretTemplate` primary events and owned-`Secret` events are wired
//! directly onto the `Controller` in `main` via `Controller::new` /
//! `.owns(...)`, the way the teacher wires its single owned `Secret` watch.
//! This module covers the third source: one shared watcher per distinct
//! `(group, kind)` that any template currently references as an input,
//! translating add/update/delete notifications into `tracker.tracking(...)`
//! lookups and forwarding the owning templates into a queue the controller
//! merges in via `reconcile_all_on`.

use crate::crd::SecretTemplate;
use crate::reconcile;
use crate::tracker::{ObjectKey, Tracker};
use futures::{Stream, StreamExt};
use kube::api::DynamicObject;
use kube::core::ApiResource;
use kube::runtime::{reflector::ObjectRef, watcher, WatchStreamExt};
use kube::{discovery, Api, Client};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::warn;

/// How often `WatchManager::run` rescans the tracker for newly-referenced
/// kinds that don't have a watcher yet. A template's first reconcile after
/// referencing a brand-new kind may therefore wait up to this long before
/// its tracked-input watch comes online; subsequent changes to that input
/// are caught immediately once the watcher is running.
const SCAN_INTERVAL: Duration = Duration::from_secs(5);

const BROADCAST_CAPACITY: usize = 1024;

/// Spawns and remembers one long-lived `watcher` task per distinct
/// `(group, kind)` that any `SecretTemplate`'s resolved inputs currently
/// reference. Watchers are never torn down once started -- a template
/// whose last reference to a kind disappears just leaves that watcher
/// idling, which is simpler than coordinating shutdown against concurrent
/// reconciles that might re-add the same kind moments later.
pub struct WatchManager {
  client: Client,
  tracker: Arc<Tracker>,
  sender: broadcast::Sender<ObjectRef<SecretTemplate>>,
  spawned: Mutex<HashSet<(String, String)>>,
}

impl WatchManager {
  pub fn new(client: Client, tracker: Arc<Tracker>) -> Arc<Self> {
    let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
    Arc::new(WatchManager {
      client,
      tracker,
      sender,
      spawned: Mutex::new(HashSet::new()),
    })
  }

  /// A fresh stream of tracked-input change notifications. Every controller
  /// (one per watched namespace, or a single cluster-wide one) subscribes
  /// its own copy via `reconcile_all_on`, so a notification reaches every
  /// namespace's controller regardless of which one owns the affected
  /// template.
  pub fn subscribe(&self) -> impl Stream<Item = ObjectRef<SecretTemplate>> {
    BroadcastStream::new(self.sender.subscribe()).filter_map(|item| async move { item.ok() })
  }

  /// Rescans `tracker.known_kinds()` and spawns a watcher for any kind that
  /// doesn't have one yet.
  fn ensure_watches(self: &Arc<Self>) {
    for (group, kind) in self.tracker.known_kinds() {
      let is_new = {
        let mut spawned = self.spawned.lock().expect("watch-manager lock poisoned");
        spawned.insert((group.clone(), kind.clone()))
      };

      if is_new {
        let this = Arc::clone(self);
        tokio::spawn(async move {
          if let Err(e) = this.watch_kind(group.clone(), kind.clone()).await {
            warn!(%group, %kind, error = %e, "tracked-input watcher exited");
          }
        });
      }
    }
  }

  /// Runs `ensure_watches` on a fixed interval for the controller's
  /// lifetime, picking up kinds referenced by templates reconciled after
  /// startup.
  pub async fn run(self: Arc<Self>) {
    let mut interval = tokio::time::interval(SCAN_INTERVAL);
    loop {
      interval.tick().await;
      self.ensure_watches();
    }
  }

  async fn watch_kind(&self, group: String, kind: String) -> Result<(), kube::Error> {
    let ar = discover_resource(&self.client, &group, &kind).await?;
    let api: Api<DynamicObject> = Api::all_with(self.client.clone(), &ar);

    let mut stream = Box::pin(watcher(api, watcher::Config::default()).touched_objects());

    while let Some(event) = stream.next().await {
      let obj = match event {
        Ok(obj) => obj,
        Err(e) => {
          warn!(%group, %kind, error = %e, "tracked-input watch stream error");
          continue;
        }
      };

      let Some(name) = obj.metadata.name.clone() else { continue };
      let namespace = obj.metadata.namespace.clone().unwrap_or_default();
      let tracked_key = ObjectKey::new(group.clone(), kind.clone(), namespace, name);

      for tracking in reconcile::templates_tracking(&self.tracker, &tracked_key) {
        let object_ref = ObjectRef::<SecretTemplate>::new(&tracking.name).within(&tracking.namespace);
        // No subscribers yet is fine -- the controller(s) subscribe before
        // this watcher's first tick; a send error here only means every
        // receiver has been dropped, which happens during shutdown.
        let _ = self.sender.send(object_ref);
      }
    }

    Ok(())
  }
}

/// Looks up the `ApiResource` the apiserver actually serves for a bare
/// `(group, kind)` pair via dynamic discovery -- templates declare
/// `apiVersion` but the watcher only keys tracked objects by `(group,
/// kind)`, so we re-resolve the version the cluster currently recommends
/// rather than trusting a single template's declared version.
async fn discover_resource(client: &Client, group: &str, kind: &str) -> Result<ApiResource, kube::Error> {
  let discovered = discovery::Discovery::new(client.clone()).run().await?;

  for group_info in discovered.groups() {
    if group_info.name() == group {
      if let Some((ar, _caps)) = group_info.recommended_kind(kind) {
        return Ok(ar);
      }
    }
  }

  Err(kube::Error::Api(kube::core::ErrorResponse {
    status: "Failure".to_string(),
    message: format!("no discovered version serves {group}/{kind}"),
    reason: "NotFound".to_string(),
    code: 404,
  }))
}
