use super::model::*;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// Queue depth per subscriber; a consumer that falls further behind than
/// this is lagged and gets disconnected by its connection task.
const EVENT_QUEUE_DEPTH: usize = 256;

#[derive(Copy, Clone)]
enum LabelKind {
    Input,
    Output,
    Level,
}

struct Inner {
    config: MatrixConfig,
    input_labels: Vec<String>,
    output_labels: Vec<String>,
    level_names: Vec<String>,
    routes: Vec<Vec<u16>>,
    locks: HashMap<u16, PeerId>,
}

impl Inner {
    fn new(config: MatrixConfig) -> Self {
        let routes = (0..config.levels)
            .map(|_| {
                (0..config.outputs)
                    .map(|d| if d < config.inputs { d } else { 0 })
                    .collect()
            })
            .collect();
        Self {
            input_labels: (0..config.inputs).map(|i| format!("Input {}", i + 1)).collect(),
            output_labels: (0..config.outputs).map(|o| format!("Output {}", o + 1)).collect(),
            level_names: (0..config.levels).map(default_level_name).collect(),
            routes,
            locks: HashMap::new(),
            config,
        }
    }
}

/// The routing model: levels × destinations → source, labels, and lock
/// ownership, behind one mutex.
///
/// Change events are broadcast while the mutex is still held, so the
/// event order is a linearization of the mutation order. `broadcast::send`
/// never blocks; slow subscribers lag instead.
pub struct RoutingMatrix {
    inner: Mutex<Inner>,
    events: broadcast::Sender<MatrixEvent>,
    next_peer: AtomicU64,
}

impl RoutingMatrix {
    pub fn new(config: MatrixConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_QUEUE_DEPTH);
        Self {
            inner: Mutex::new(Inner::new(config)),
            events,
            next_peer: AtomicU64::new(1),
        }
    }

    /// Hand out a connection handle; never reused, never `LOCAL`.
    pub fn allocate_peer(&self) -> PeerId {
        PeerId(self.next_peer.fetch_add(1, Ordering::Relaxed))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<MatrixEvent> {
        self.events.subscribe()
    }

    pub fn config(&self) -> MatrixConfig {
        self.inner.lock().unwrap().config.clone()
    }

    /// Re-shape the matrix; routing, labels and locks are re-initialized.
    pub fn reconfigure(&self, config: MatrixConfig) {
        let mut inner = self.inner.lock().unwrap();
        *inner = Inner::new(config);
    }

    pub fn snapshot(&self, viewer: PeerId) -> MatrixSnapshot {
        let inner = self.inner.lock().unwrap();
        let locks = (0..inner.config.outputs)
            .map(|d| LockView::relative_to(inner.locks.get(&d).copied(), viewer))
            .collect();
        MatrixSnapshot {
            config: inner.config.clone(),
            input_labels: inner.input_labels.clone(),
            output_labels: inner.output_labels.clone(),
            level_names: inner.level_names.clone(),
            routes: inner.routes.clone(),
            locks,
        }
    }

    pub fn route(&self, level: u16, dest: u16) -> Option<u16> {
        let inner = self.inner.lock().unwrap();
        inner
            .routes
            .get(level as usize)
            .and_then(|l| l.get(dest as usize))
            .copied()
    }

    pub fn lock_owner(&self, dest: u16) -> Option<PeerId> {
        self.inner.lock().unwrap().locks.get(&dest).copied()
    }

    /// Apply a batch of crosspoint writes. An entry is rejected when out
    /// of bounds or when its destination is locked by a different peer.
    pub fn set_routes(&self, changes: &[RouteChange], caller: PeerId) -> Outcome<RouteChange> {
        let mut inner = self.inner.lock().unwrap();
        let mut outcome = Outcome::default();
        for change in changes {
            let in_bounds = change.level < inner.config.levels
                && change.dest < inner.config.outputs
                && change.src < inner.config.inputs;
            let foreign_lock = inner
                .locks
                .get(&change.dest)
                .is_some_and(|owner| *owner != caller);
            if !in_bounds || foreign_lock {
                outcome.rejected += 1;
                continue;
            }
            outcome.accepted += 1;
            let slot = &mut inner.routes[change.level as usize][change.dest as usize];
            if *slot != change.src {
                *slot = change.src;
                outcome.applied.push(*change);
            }
        }
        if !outcome.applied.is_empty() {
            let _ = self.events.send(MatrixEvent::Routed(outcome.applied.clone()));
        }
        outcome
    }

    /// Apply a batch of lock operations for one peer.
    pub fn set_locks(&self, ops: &[(u16, LockOp)], caller: PeerId) -> Outcome<LockChange> {
        let mut inner = self.inner.lock().unwrap();
        let mut outcome = Outcome::default();
        for (dest, op) in ops {
            if *dest >= inner.config.outputs {
                outcome.rejected += 1;
                continue;
            }
            let owner = inner.locks.get(dest).copied();
            let next = match op {
                // ownership transfers even when held elsewhere, matching
                // observed hub firmware
                LockOp::Own => Some(caller),
                LockOp::Unlock => match owner {
                    Some(p) if p != caller => {
                        outcome.rejected += 1;
                        continue;
                    }
                    _ => None,
                },
                LockOp::Force => None,
            };
            outcome.accepted += 1;
            if next != owner {
                match next {
                    Some(p) => inner.locks.insert(*dest, p),
                    None => inner.locks.remove(dest),
                };
                outcome.applied.push(LockChange {
                    dest: *dest,
                    owner: next,
                });
            }
        }
        if !outcome.applied.is_empty() {
            let _ = self
                .events
                .send(MatrixEvent::LocksChanged(outcome.applied.clone()));
        }
        outcome
    }

    pub fn set_input_labels(&self, changes: &[LabelChange]) -> Outcome<LabelChange> {
        self.set_labels(changes, LabelKind::Input)
    }

    pub fn set_output_labels(&self, changes: &[LabelChange]) -> Outcome<LabelChange> {
        self.set_labels(changes, LabelKind::Output)
    }

    pub fn set_level_names(&self, changes: &[LabelChange]) -> Outcome<LabelChange> {
        self.set_labels(changes, LabelKind::Level)
    }

    fn set_labels(&self, changes: &[LabelChange], kind: LabelKind) -> Outcome<LabelChange> {
        let mut inner = self.inner.lock().unwrap();
        let (bound, labels) = match kind {
            LabelKind::Input => (inner.config.inputs, &mut inner.input_labels),
            LabelKind::Output => (inner.config.outputs, &mut inner.output_labels),
            LabelKind::Level => (inner.config.levels, &mut inner.level_names),
        };
        let mut outcome: Outcome<LabelChange> = Outcome::default();
        for change in changes {
            if change.index >= bound {
                outcome.rejected += 1;
                continue;
            }
            outcome.accepted += 1;
            let slot = &mut labels[change.index as usize];
            if *slot != change.text {
                slot.clone_from(&change.text);
                outcome.applied.push(change.clone());
            }
        }
        if !outcome.applied.is_empty() {
            let event = match kind {
                LabelKind::Input => MatrixEvent::InputLabelsChanged(outcome.applied.clone()),
                LabelKind::Output => MatrixEvent::OutputLabelsChanged(outcome.applied.clone()),
                LabelKind::Level => MatrixEvent::LevelNamesChanged(outcome.applied.clone()),
            };
            let _ = self.events.send(event);
        }
        outcome
    }

    /// Disconnect hook: drop every lock `caller` holds and broadcast the
    /// unlock delta. Returns the freed destinations.
    pub fn release_locks_of(&self, caller: PeerId) -> Vec<u16> {
        let mut inner = self.inner.lock().unwrap();
        let mut freed: Vec<u16> = inner
            .locks
            .iter()
            .filter(|(_, owner)| **owner == caller)
            .map(|(dest, _)| *dest)
            .collect();
        freed.sort_unstable();
        for dest in &freed {
            inner.locks.remove(dest);
        }
        if !freed.is_empty() {
            let changes = freed
                .iter()
                .map(|dest| LockChange {
                    dest: *dest,
                    owner: None,
                })
                .collect();
            let _ = self.events.send(MatrixEvent::LocksChanged(changes));
        }
        freed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn matrix() -> RoutingMatrix {
        RoutingMatrix::new(MatrixConfig::default())
    }

    #[test]
    fn identity_initialization() {
        let m = RoutingMatrix::new(MatrixConfig {
            levels: 2,
            inputs: 4,
            outputs: 6,
            ..MatrixConfig::default()
        });
        let snap = m.snapshot(PeerId::LOCAL);
        for level in 0..2 {
            for dest in 0..6u16 {
                let want = if dest < 4 { dest } else { 0 };
                assert_eq!(snap.route(level, dest), Some(want));
            }
        }
        assert_eq!(snap.level_names, vec!["Video", "Audio 1"]);
    }

    #[test]
    fn route_bounds_and_events() {
        let m = matrix();
        let mut events = m.subscribe();

        let ok = RouteChange {
            level: 0,
            dest: 3,
            src: 7,
        };
        let outcome = m.set_routes(&[ok], PeerId::LOCAL);
        assert_eq!(outcome.applied, vec![ok]);
        assert_eq!(outcome.accepted, 1);
        assert_eq!(m.route(0, 3), Some(7));
        assert_eq!(events.try_recv().unwrap(), MatrixEvent::Routed(vec![ok]));

        let bad = RouteChange {
            level: 0,
            dest: 3,
            src: 99,
        };
        let outcome = m.set_routes(&[bad], PeerId::LOCAL);
        assert_eq!(outcome.rejected, 1);
        assert!(!outcome.any_accepted());
        assert_eq!(m.route(0, 3), Some(7));
        assert!(events.try_recv().is_err(), "rejected write must not broadcast");
    }

    #[test]
    fn noop_route_is_accepted_but_not_broadcast() {
        let m = matrix();
        let mut events = m.subscribe();
        let noop = RouteChange {
            level: 0,
            dest: 5,
            src: 5,
        };
        let outcome = m.set_routes(&[noop], PeerId::LOCAL);
        assert!(outcome.any_accepted());
        assert!(outcome.applied.is_empty());
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn lock_scoping() {
        let m = matrix();
        let a = m.allocate_peer();
        let b = m.allocate_peer();

        assert!(m.set_locks(&[(0, LockOp::Own)], a).any_accepted());
        assert_eq!(m.lock_owner(0), Some(a));

        // foreign peer cannot route through the lock
        let blocked = m.set_routes(
            &[RouteChange {
                level: 0,
                dest: 0,
                src: 5,
            }],
            b,
        );
        assert_eq!(blocked.rejected, 1);
        assert_eq!(m.route(0, 0), Some(0));

        // the owner can
        let allowed = m.set_routes(
            &[RouteChange {
                level: 0,
                dest: 0,
                src: 5,
            }],
            a,
        );
        assert_eq!(allowed.accepted, 1);

        // foreign unlock is rejected, force is not
        assert_eq!(m.set_locks(&[(0, LockOp::Unlock)], b).rejected, 1);
        assert!(m.set_locks(&[(0, LockOp::Force)], b).any_accepted());
        assert_eq!(m.lock_owner(0), None);
    }

    #[test]
    fn own_transfers_foreign_locks() {
        let m = matrix();
        let a = m.allocate_peer();
        let b = m.allocate_peer();
        m.set_locks(&[(2, LockOp::Own)], a);
        let outcome = m.set_locks(&[(2, LockOp::Own)], b);
        assert_eq!(
            outcome.applied,
            vec![LockChange {
                dest: 2,
                owner: Some(b)
            }]
        );
        assert_eq!(m.lock_owner(2), Some(b));
    }

    #[test]
    fn per_peer_lock_view() {
        let m = matrix();
        let a = m.allocate_peer();
        let b = m.allocate_peer();
        m.set_locks(&[(1, LockOp::Own)], a);

        assert_eq!(m.snapshot(a).locks[1], LockView::Owned);
        assert_eq!(m.snapshot(b).locks[1], LockView::Locked);
        assert_eq!(m.snapshot(a).locks[0], LockView::Unlocked);
    }

    #[test]
    fn disconnect_releases_all_locks() {
        let m = matrix();
        let a = m.allocate_peer();
        m.set_locks(&[(0, LockOp::Own), (4, LockOp::Own)], a);
        let mut events = m.subscribe();

        assert_eq!(m.release_locks_of(a), vec![0, 4]);
        assert_eq!(m.lock_owner(0), None);
        assert_eq!(m.lock_owner(4), None);
        match events.try_recv().unwrap() {
            MatrixEvent::LocksChanged(changes) => {
                assert!(changes.iter().all(|c| c.owner.is_none()));
                assert_eq!(changes.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }

        // idempotent
        assert!(m.release_locks_of(a).is_empty());
    }

    #[test]
    fn label_bounds() {
        let m = matrix();
        let outcome = m.set_input_labels(&[
            LabelChange {
                index: 1,
                text: "Camera".into(),
            },
            LabelChange {
                index: 99,
                text: "Nope".into(),
            },
        ]);
        assert_eq!(outcome.accepted, 1);
        assert_eq!(outcome.rejected, 1);
        assert_eq!(m.snapshot(PeerId::LOCAL).input_labels[1], "Camera");
    }

    #[test]
    fn concurrent_writers_agree_with_the_event_order() {
        let m = Arc::new(matrix());
        let mut events = m.subscribe();

        let writers: Vec<_> = [3u16, 7]
            .into_iter()
            .map(|src| {
                let m = Arc::clone(&m);
                std::thread::spawn(move || {
                    let caller = m.allocate_peer();
                    for _ in 0..50 {
                        m.set_routes(
                            &[RouteChange {
                                level: 0,
                                dest: 0,
                                src,
                            }],
                            caller,
                        );
                    }
                })
            })
            .collect();
        for w in writers {
            w.join().unwrap();
        }

        // the last broadcast and the model agree on the final value
        let mut last = None;
        while let Ok(ev) = events.try_recv() {
            if let MatrixEvent::Routed(changes) = ev {
                last = changes.last().copied();
            }
        }
        let final_src = m.route(0, 0).unwrap();
        assert!(final_src == 3 || final_src == 7);
        assert_eq!(last.unwrap().src, final_src);
    }

    #[test]
    fn reconfigure_resets_shape() {
        let m = matrix();
        m.set_routes(
            &[RouteChange {
                level: 0,
                dest: 0,
                src: 3,
            }],
            PeerId::LOCAL,
        );
        m.reconfigure(MatrixConfig {
            levels: 3,
            inputs: 2,
            outputs: 2,
            ..MatrixConfig::default()
        });
        let snap = m.snapshot(PeerId::LOCAL);
        assert_eq!(snap.routes.len(), 3);
        assert_eq!(snap.route(2, 1), Some(1));
        assert_eq!(snap.input_labels.len(), 2);
    }
}
