//! Bidirectional many-to-many index: tracked object <-> tracking templates
//! (spec.md §4.4). Translates an input-resource change event into the set
//! of templates that must be re-reconciled.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

/// Identifies an object by its `{group, kind, namespace, name}` coordinates.
/// The same key type serves both as a tracked key and a tracking key — the
/// relationship is symmetric.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
  pub group: String,
  pub kind: String,
  pub namespace: String,
  pub name: String,
}

impl ObjectKey {
  pub fn new(group: impl Into<String>, kind: impl Into<String>, namespace: impl Into<String>, name: impl Into<String>) -> Self {
    ObjectKey {
      group: group.into(),
      kind: kind.into(),
      namespace: namespace.into(),
      name: name.into(),
    }
  }
}

#[derive(Debug, Default)]
struct TrackerState {
  // tracked -> { tracking keys watching it }
  forward: HashMap<ObjectKey, HashSet<ObjectKey>>,
  // tracking -> { tracked keys it watches }
  reverse: HashMap<ObjectKey, HashSet<ObjectKey>>,
}

/// All operations are atomic under a single write lock; `tracking` reads
/// may proceed under a read lock. `track` replaces the prior tracked set
/// for a tracking key in one critical section.
#[derive(Debug, Default)]
pub struct Tracker {
  state: RwLock<TrackerState>,
}

impl Tracker {
  pub fn new() -> Self {
    Tracker::default()
  }

  /// Atomically sets the tracked set for `tracking`, replacing whatever was
  /// there before.
  pub fn track(&self, tracking: ObjectKey, tracked: HashSet<ObjectKey>) {
    let mut state = self.state.write().expect("tracker lock poisoned");

    if let Some(previous) = state.reverse.remove(&tracking) {
      for old in &previous {
        if let Some(trackers) = state.forward.get_mut(old) {
          trackers.remove(&tracking);
          if trackers.is_empty() {
            state.forward.remove(old);
          }
        }
      }
    }

    for t in &tracked {
      state.forward.entry(t.clone()).or_default().insert(tracking.clone());
    }

    if !tracked.is_empty() {
      state.reverse.insert(tracking, tracked);
    }
  }

  /// Returns the set of tracking keys currently watching `tracked`.
  pub fn tracking(&self, tracked: &ObjectKey) -> HashSet<ObjectKey> {
    let state = self.state.read().expect("tracker lock poisoned");
    state.forward.get(tracked).cloned().unwrap_or_default()
  }

  /// Drops all associations for `tracking`.
  pub fn untrack(&self, tracking: &ObjectKey) {
    let mut state = self.state.write().expect("tracker lock poisoned");

    if let Some(previous) = state.reverse.remove(tracking) {
      for old in &previous {
        if let Some(trackers) = state.forward.get_mut(old) {
          trackers.remove(tracking);
          if trackers.is_empty() {
            state.forward.remove(old);
          }
        }
      }
    }
  }

  /// Distinct `(group, kind)` pairs currently referenced by any tracked
  /// object, used by the dynamic watch wiring to decide which kinds need a
  /// watcher at all.
  pub fn known_kinds(&self) -> HashSet<(String, String)> {
    let state = self.state.read().expect("tracker lock poisoned");
    state.forward.keys().map(|k| (k.group.clone(), k.kind.clone())).collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn key(name: &str) -> ObjectKey {
    ObjectKey::new("", "Secret", "ns", name)
  }

  #[test]
  fn track_then_tracking_agrees() {
    let tracker = Tracker::new();
    let t = key("template-a");
    let u = key("input-1");
    tracker.track(t.clone(), HashSet::from([u.clone()]));

    assert_eq!(tracker.tracking(&u), HashSet::from([t]));
  }

  #[test]
  fn track_replaces_prior_set_wholesale() {
    let tracker = Tracker::new();
    let t = key("template-a");
    let u1 = key("input-1");
    let u2 = key("input-2");

    tracker.track(t.clone(), HashSet::from([u1.clone()]));
    tracker.track(t.clone(), HashSet::from([u2.clone()]));

    assert!(tracker.tracking(&u1).is_empty());
    assert_eq!(tracker.tracking(&u2), HashSet::from([t]));
  }

  #[test]
  fn many_to_many() {
    let tracker = Tracker::new();
    let t1 = key("template-a");
    let t2 = key("template-b");
    let shared = key("shared-secret");

    tracker.track(t1.clone(), HashSet::from([shared.clone()]));
    tracker.track(t2.clone(), HashSet::from([shared.clone()]));

    let watchers = tracker.tracking(&shared);
    assert_eq!(watchers, HashSet::from([t1, t2]));
  }

  #[test]
  fn untrack_drops_all_associations() {
    let tracker = Tracker::new();
    let t = key("template-a");
    let u = key("input-1");
    tracker.track(t.clone(), HashSet::from([u.clone()]));

    tracker.untrack(&t);

    assert!(tracker.tracking(&u).is_empty());
  }

  #[test]
  fn forward_reverse_invariant_holds_across_updates() {
    let tracker = Tracker::new();
    let t = key("template-a");
    let u1 = key("input-1");
    let u2 = key("input-2");

    tracker.track(t.clone(), HashSet::from([u1.clone(), u2.clone()]));
    assert!(tracker.tracking(&u1).contains(&t));
    assert!(tracker.tracking(&u2).contains(&t));

    tracker.track(t.clone(), HashSet::from([u2.clone()]));
    assert!(!tracker.tracking(&u1).contains(&t));
    assert!(tracker.tracking(&u2).contains(&t));
  }

  #[test]
  fn known_kinds_reflects_currently_tracked_objects() {
    let tracker = Tracker::new();
    let t = key("template-a");
    let secret_input = ObjectKey::new("", "Secret", "ns", "raw");
    let sa_input = ObjectKey::new("", "ServiceAccount", "ns", "robot");

    tracker.track(t.clone(), HashSet::from([secret_input, sa_input]));
    assert_eq!(
      tracker.known_kinds(),
      HashSet::from([("".to_string(), "Secret".to_string()), ("".to_string(), "ServiceAccount".to_string())])
    );

    tracker.untrack(&t);
    assert!(tracker.known_kinds().is_empty());
  }
}
