//! The action scheduler: a named, resource-excluding, dependency-ordered,
//! priority-scheduled set of callbacks run against a host's event loop
//! (spec.md §4.3).
//!
//! An `ActionList` is shared (`Rc<RefCell<_>>`) between the scheduler and
//! whatever `go` callbacks it invokes, the same ownership shape as
//! [`rsbackup_tools::event_loop`]'s reactors: a `go` callback typically
//! spawns a subprocess and, in its completion callback, calls back into the
//! list via [`ActionHandle::completed`].

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;
use std::time::Instant;

use glob::Pattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct Predecessor {
    pub name: String,
    pub is_glob: bool,
    /// If true, a Failed predecessor blocks this action (transitioning it
    /// to Failed too); if false, any terminal state unblocks it.
    pub require_success: bool,
}

impl Predecessor {
    pub fn exact(name: impl Into<String>, require_success: bool) -> Self {
        Predecessor {
            name: name.into(),
            is_glob: false,
            require_success,
        }
    }

    pub fn glob(pattern: impl Into<String>, require_success: bool) -> Self {
        Predecessor {
            name: pattern.into(),
            is_glob: true,
            require_success,
        }
    }
}

/// Handed to a `go` callback so it can report completion without holding a
/// borrow of the list across the asynchronous work it kicks off.
pub struct ActionHandle {
    name: String,
    inner: Rc<RefCell<Inner>>,
}

impl ActionHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Spec.md §4.3: "An action signals completion by calling
    /// `completed(self, succeeded)`, which releases its resources, records
    /// its outcome, removes it from the pending set, invokes its `done`
    /// hook, and recurses."
    pub fn completed(self, succeeded: bool) {
        let done_hook = {
            let mut inner = self.inner.borrow_mut();
            inner.running.remove(&self.name);
            inner.running_killers.remove(&self.name);
            let state = if succeeded {
                ActionState::Succeeded
            } else {
                ActionState::Failed
            };
            inner.states.insert(self.name.clone(), state);
            inner
                .done_hooks
                .remove(&self.name)
                .flatten()
        };
        if let Some(done) = done_hook {
            done(succeeded);
        }
        ActionList::trigger_inner(&self.inner);
    }

    /// Registers a callback that forcibly terminates this action's live
    /// subprocess. Invoked by the list's deadline handling (spec.md §4.3,
    /// §4.8) once a running action outlives the list's deadline; the
    /// action itself still reports its outcome through `completed` once
    /// the kill causes its subprocess to actually exit.
    pub fn set_killer(&self, killer: impl Fn() + 'static) {
        self.inner
            .borrow_mut()
            .running_killers
            .insert(self.name.clone(), Box::new(killer));
    }
}

struct PendingAction {
    resources: BTreeSet<String>,
    predecessors: Vec<Predecessor>,
    priority: i64,
    go: Option<Box<dyn FnOnce(ActionHandle)>>,
}

struct Inner {
    pending: BTreeMap<String, PendingAction>,
    running: BTreeMap<String, BTreeSet<String>>,
    states: BTreeMap<String, ActionState>,
    done_hooks: BTreeMap<String, Option<Box<dyn FnOnce(bool)>>>,
    deadline: Option<Instant>,
    /// Per-running-action termination callbacks, invoked once when the
    /// list's deadline is first found to be exceeded (spec.md §4.3,
    /// §4.8: a cancellation reactor that terminates live subprocesses).
    running_killers: BTreeMap<String, Box<dyn Fn()>>,
    deadline_enforced: bool,
}

/// A named set of actions run concurrently under resource exclusion,
/// dependency ordering, and priority (spec.md §4.3).
#[derive(Clone)]
pub struct ActionList {
    inner: Rc<RefCell<Inner>>,
}

impl Default for ActionList {
    fn default() -> Self {
        ActionList::new()
    }
}

impl ActionList {
    pub fn new() -> Self {
        ActionList {
            inner: Rc::new(RefCell::new(Inner {
                pending: BTreeMap::new(),
                running: BTreeMap::new(),
                states: BTreeMap::new(),
                done_hooks: BTreeMap::new(),
                deadline: None,
                running_killers: BTreeMap::new(),
                deadline_enforced: false,
            })),
        }
    }

    pub fn set_deadline(&self, deadline: Instant) {
        self.inner.borrow_mut().deadline = Some(deadline);
    }

    /// Registers a new action. `name` must be unique across the list's
    /// lifetime (spec.md: "Duplicate names are a programming error").
    #[allow(clippy::too_many_arguments)]
    pub fn add(
        &self,
        name: impl Into<String>,
        resources: impl IntoIterator<Item = String>,
        predecessors: Vec<Predecessor>,
        priority: i64,
        go: impl FnOnce(ActionHandle) + 'static,
        done: Option<Box<dyn FnOnce(bool)>>,
    ) {
        let name = name.into();
        let mut inner = self.inner.borrow_mut();
        if inner.pending.contains_key(&name) || inner.states.contains_key(&name) {
            panic!("duplicate action name '{}'", name);
        }
        inner.pending.insert(
            name.clone(),
            PendingAction {
                resources: resources.into_iter().collect(),
                predecessors,
                priority,
                go: Some(Box::new(go)),
            },
        );
        inner.done_hooks.insert(name, done);
    }

    pub fn state(&self, name: &str) -> Option<ActionState> {
        self.inner.borrow().states.get(name).copied()
    }

    pub fn has_pending_or_running(&self) -> bool {
        let inner = self.inner.borrow();
        !inner.pending.is_empty() || !inner.running.is_empty()
    }

    /// Drives as much of the list forward as current resource/dependency
    /// constraints allow (spec.md §4.3 "Core loop (trigger)").
    pub fn trigger(&self) {
        Self::trigger_inner(&self.inner);
    }

    fn trigger_inner(inner_rc: &Rc<RefCell<Inner>>) {
        loop {
            {
                let deadline_exceeded = {
                    let inner = inner_rc.borrow();
                    inner.deadline.map_or(false, |deadline| Instant::now() >= deadline)
                };
                if deadline_exceeded {
                    let mut inner = inner_rc.borrow_mut();
                    if !inner.pending.is_empty() {
                        let names: Vec<String> = inner.pending.keys().cloned().collect();
                        for name in names {
                            inner.pending.remove(&name);
                            inner.states.insert(name, ActionState::Failed);
                        }
                        // Cancelled actions never ran; no done hooks fire.
                    }
                    let first_time = !inner.deadline_enforced;
                    inner.deadline_enforced = true;
                    drop(inner);
                    if first_time {
                        // Running actions still report their outcome through
                        // `completed` once the kill takes effect; we only
                        // trigger the termination here, not the state change.
                        let mut inner = inner_rc.borrow_mut();
                        let killers: Vec<Box<dyn Fn()>> = inner.running_killers.drain().map(|(_, k)| k).collect();
                        drop(inner);
                        for killer in killers {
                            killer();
                        }
                    }
                    return;
                }
            }

            // Step 3: fail-fast any Pending action whose required-success
            // predecessor already failed.
            let failed_now = {
                let inner = inner_rc.borrow();
                inner
                    .pending
                    .iter()
                    .filter(|(_, action)| {
                        action.predecessors.iter().any(|pred| {
                            pred.require_success && Self::predecessor_failed(&inner, pred)
                        })
                    })
                    .map(|(name, _)| name.clone())
                    .collect::<Vec<_>>()
            };
            if !failed_now.is_empty() {
                let mut inner = inner_rc.borrow_mut();
                for name in &failed_now {
                    inner.pending.remove(name);
                    inner.states.insert(name.clone(), ActionState::Failed);
                }
                drop(inner);
                for name in failed_now {
                    let hook = inner_rc.borrow_mut().done_hooks.remove(&name).flatten();
                    if let Some(done) = hook {
                        done(false);
                    }
                }
                continue;
            }

            let next_name = {
                let inner = inner_rc.borrow();
                inner
                    .pending
                    .iter()
                    .filter(|(_, action)| Self::is_ready(&inner, action))
                    .max_by_key(|(_, action)| action.priority)
                    .map(|(name, _)| name.clone())
            };

            let Some(name) = next_name else {
                return;
            };

            let mut inner = inner_rc.borrow_mut();
            let mut action = inner.pending.remove(&name).expect("just looked up");
            inner.running.insert(name.clone(), action.resources.clone());
            inner.states.insert(name.clone(), ActionState::Running);
            let go = action.go.take().expect("go callback set exactly once");
            drop(inner);

            go(ActionHandle {
                name,
                inner: inner_rc.clone(),
            });
        }
    }

    fn predecessor_failed(inner: &Inner, pred: &Predecessor) -> bool {
        if pred.is_glob {
            let pattern = Pattern::new(&pred.name).expect("valid glob pattern");
            inner
                .states
                .iter()
                .any(|(name, state)| pattern.matches(name) && *state == ActionState::Failed)
        } else {
            inner.states.get(&pred.name) == Some(&ActionState::Failed)
        }
    }

    fn is_ready(inner: &Inner, action: &PendingAction) -> bool {
        let resource_blocked = inner
            .running
            .values()
            .any(|claimed| claimed.intersection(&action.resources).next().is_some());
        if resource_blocked {
            return false;
        }

        for pred in &action.predecessors {
            if pred.is_glob {
                let pattern = Pattern::new(&pred.name).expect("valid glob pattern");
                let any_pending_or_running = inner
                    .pending
                    .keys()
                    .chain(inner.running.keys())
                    .any(|name| pattern.matches(name));
                if any_pending_or_running {
                    return false;
                }
            } else if inner.pending.contains_key(&pred.name) || inner.running.contains_key(&pred.name) {
                return false;
            } else if !inner.states.contains_key(&pred.name) {
                panic!(
                    "action predecessor '{}' matches neither a pending action nor a known state",
                    pred.name
                );
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn mutually_exclusive_resources_serialise() {
        let list = ActionList::new();
        let order = Rc::new(RefCell::new(Vec::new()));

        let order1 = order.clone();
        list.add(
            "a",
            vec!["dev1".to_string()],
            vec![],
            0,
            move |handle| {
                order1.borrow_mut().push("a-start");
                handle.completed(true);
            },
            None,
        );
        let order2 = order.clone();
        list.add(
            "b",
            vec!["dev1".to_string()],
            vec![],
            0,
            move |handle| {
                order2.borrow_mut().push("b-start");
                handle.completed(true);
            },
            None,
        );

        list.trigger();
        assert_eq!(list.state("a"), Some(ActionState::Succeeded));
        assert_eq!(list.state("b"), Some(ActionState::Succeeded));
        // Both ran (sequentially, since go() completes synchronously here),
        // but never held "dev1" at the same instant.
        assert_eq!(order.borrow().len(), 2);
    }

    #[test]
    fn dependency_blocks_until_predecessor_done() {
        let list = ActionList::new();
        let ran = Rc::new(Cell::new(false));
        list.add(
            "first",
            vec![],
            vec![],
            0,
            |handle| handle.completed(true),
            None,
        );
        let ran2 = ran.clone();
        list.add(
            "second",
            vec![],
            vec![Predecessor::exact("first", true)],
            0,
            move |handle| {
                ran2.set(true);
                handle.completed(true);
            },
            None,
        );
        list.trigger();
        assert!(ran.get());
        assert_eq!(list.state("second"), Some(ActionState::Succeeded));
    }

    #[test]
    fn failed_required_predecessor_propagates_failure() {
        let list = ActionList::new();
        list.add(
            "first",
            vec![],
            vec![],
            0,
            |handle| handle.completed(false),
            None,
        );
        list.add(
            "second",
            vec![],
            vec![Predecessor::exact("first", true)],
            0,
            |handle| handle.completed(true),
            None,
        );
        list.trigger();
        assert_eq!(list.state("first"), Some(ActionState::Failed));
        assert_eq!(list.state("second"), Some(ActionState::Failed));
    }

    #[test]
    fn glob_predecessor_matches_multiple() {
        let list = ActionList::new();
        list.add("rm-dev1", vec![], vec![], 0, |h| h.completed(true), None);
        list.add("rm-dev2", vec![], vec![], 0, |h| h.completed(true), None);
        list.add(
            "sweep",
            vec![],
            vec![Predecessor::glob("rm-*", false)],
            0,
            |h| h.completed(true),
            None,
        );
        list.trigger();
        assert_eq!(list.state("sweep"), Some(ActionState::Succeeded));
    }

    #[test]
    fn higher_priority_runs_first_when_resources_conflict() {
        let list = ActionList::new();
        let order = Rc::new(RefCell::new(Vec::new()));
        let order1 = order.clone();
        list.add(
            "low",
            vec!["dev".to_string()],
            vec![],
            0,
            move |h| {
                order1.borrow_mut().push("low");
                h.completed(true);
            },
            None,
        );
        let order2 = order.clone();
        list.add(
            "high",
            vec!["dev".to_string()],
            vec![],
            10,
            move |h| {
                order2.borrow_mut().push("high");
                h.completed(true);
            },
            None,
        );
        list.trigger();
        assert_eq!(order.borrow()[0], "high");
    }

    #[test]
    #[should_panic(expected = "matches neither")]
    fn unresolvable_exact_predecessor_is_a_programming_error() {
        let list = ActionList::new();
        list.add(
            "only",
            vec![],
            vec![Predecessor::exact("nonexistent", true)],
            0,
            |h| h.completed(true),
            None,
        );
        list.trigger();
    }
}
