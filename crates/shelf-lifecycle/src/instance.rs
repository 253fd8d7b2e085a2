//! Per-object lifecycle state.
//!
//! Each managed object owns one [`ObjectLifecycle`]: its current state, a
//! fixed-size condition bitset sized from the class registry, timer
//! deadlines, and the bookkeeping for the pass that is running or pending.
//! Everything class-wide lives in the registry, which callers pass in.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use shelf_core::{DeathReason, LifecycleState, ObjectId};

use crate::condition::{ConditionId, LifecycleStatus};
use crate::error::{LifecycleError, Result};
use crate::registry::ClassRegistry;

/// Asks the scheduler to run another pass for an object after a delay.
pub type RescheduleHook = Arc<dyn Fn(ObjectId, Duration) + Send + Sync>;

/// Fixed-size condition bitset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionSet {
    words: Box<[u64]>,
    len: usize,
}

impl ConditionSet {
    /// An empty set able to hold `len` conditions.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(64)].into_boxed_slice(),
            len,
        }
    }

    /// Capacity in conditions.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// True if the set cannot hold anything.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Mark `id`. Returns true if it was not already marked.
    pub fn insert(&mut self, id: ConditionId) -> bool {
        let (word, bit) = (id.index() / 64, id.index() % 64);
        let Some(w) = self.words.get_mut(word) else {
            return false;
        };
        let was = *w & (1 << bit) != 0;
        *w |= 1 << bit;
        !was
    }

    /// Unmark `id`. Returns true if it was marked.
    pub fn remove(&mut self, id: ConditionId) -> bool {
        let (word, bit) = (id.index() / 64, id.index() % 64);
        let Some(w) = self.words.get_mut(word) else {
            return false;
        };
        let was = *w & (1 << bit) != 0;
        *w &= !(1 << bit);
        was
    }

    /// True if `id` is marked.
    #[must_use]
    pub fn contains(&self, id: ConditionId) -> bool {
        let (word, bit) = (id.index() / 64, id.index() % 64);
        self.words.get(word).is_some_and(|w| w & (1 << bit) != 0)
    }

    /// Unmark everything.
    pub fn clear(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Marked ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ConditionId> + '_ {
        (0..self.len)
            .filter_map(|i| u16::try_from(i).ok().map(ConditionId::new))
            .filter(|id| self.contains(*id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PassState {
    Idle,
    Running {
        current: Option<ConditionId>,
        resumed: bool,
    },
    Pending {
        current: ConditionId,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Transition(LifecycleState),
    Run(ConditionId),
    Idle,
}

#[derive(Debug)]
pub(crate) struct LifecycleInner {
    pub(crate) state: LifecycleState,
    pub(crate) conditions: ConditionSet,
    pub(crate) pass: PassState,
    timers: Vec<Option<Instant>>,
    pending_delay: Option<Duration>,
    death_reason: DeathReason,
}

impl LifecycleInner {
    fn enter<O>(&mut self, registry: &ClassRegistry<O>, now: Instant) {
        for entry in registry.rotary(self.state) {
            if entry.is_preset() {
                self.conditions.insert(entry.condition);
            }
            let interval = registry
                .condition(entry.condition)
                .and_then(crate::condition::Condition::interval);
            if let (Some(interval), Some(slot)) =
                (interval, self.timers.get_mut(entry.condition.index()))
            {
                *slot = Some(now + interval);
            }
        }
    }

    pub(crate) fn fire_due_timers<O>(&mut self, registry: &ClassRegistry<O>, now: Instant) {
        for entry in registry.rotary(self.state) {
            let id = entry.condition;
            let Some(interval) = registry.condition(id).and_then(|c| c.interval()) else {
                continue;
            };
            let Some(slot) = self.timers.get_mut(id.index()) else {
                continue;
            };
            if slot.is_some_and(|deadline| deadline <= now) {
                *slot = Some(now + interval);
                self.conditions.insert(id);
            }
        }
    }

    pub(crate) fn urgent_request<O>(&self, registry: &ClassRegistry<O>) -> Option<LifecycleState> {
        let mut urgent = None;
        for id in self.conditions.iter() {
            let Some(condition) = registry.condition(id) else {
                continue;
            };
            match condition.transitions().target(self.state) {
                target if target == self.state => {}
                LifecycleState::Destroy => return Some(LifecycleState::Destroy),
                LifecycleState::Fail => urgent = Some(LifecycleState::Fail),
                _ => {}
            }
        }
        urgent
    }

    fn resolve_request<O>(&self, registry: &ClassRegistry<O>) -> Option<LifecycleState> {
        let state = self.state;
        let rotary_order = registry.rotary(state).iter().map(|e| e.condition);
        let catalogue_order = registry
            .conditions()
            .iter()
            .map(crate::condition::Condition::id)
            .filter(|id| !registry.in_rotary(state, *id));

        let mut first = None;
        for id in rotary_order.chain(catalogue_order) {
            if !self.conditions.contains(id) {
                continue;
            }
            let Some(condition) = registry.condition(id) else {
                continue;
            };
            let target = condition.transitions().target(state);
            if target == state {
                continue;
            }
            if target == LifecycleState::Offline {
                return Some(target);
            }
            first.get_or_insert(target);
        }
        first
    }

    pub(crate) fn next_step<O>(&self, registry: &ClassRegistry<O>, ran: &ConditionSet) -> Step {
        if let Some(target) = self.urgent_request(registry) {
            return Step::Transition(target);
        }

        let mut blocked = false;
        for entry in registry.rotary(self.state) {
            let id = entry.condition;
            if !self.conditions.contains(id) {
                continue;
            }
            let Some(condition) = registry.condition(id) else {
                continue;
            };
            if condition.transitions().is_request_in(self.state) {
                continue;
            }
            if ran.contains(id) {
                blocked = true;
                continue;
            }
            return Step::Run(id);
        }
        if blocked {
            return Step::Idle;
        }

        self.resolve_request(registry)
            .map_or(Step::Idle, Step::Transition)
    }

    pub(crate) fn transition<O>(
        &mut self,
        registry: &ClassRegistry<O>,
        to: LifecycleState,
        now: Instant,
    ) -> LifecycleState {
        let from = self.state;

        for entry in registry.rotary(from) {
            let id = entry.condition;
            if registry.condition(id).is_some_and(|c| c.interval().is_some()) {
                self.conditions.remove(id);
                if let Some(slot) = self.timers.get_mut(id.index()) {
                    *slot = None;
                }
            }
        }

        let satisfied: Vec<ConditionId> = self
            .conditions
            .iter()
            .filter(|id| {
                registry.condition(*id).is_some_and(|c| {
                    c.is_placeholder() && c.transitions().is_request_in(from)
                })
            })
            .collect();
        for id in satisfied {
            self.conditions.remove(id);
        }

        self.state = to;
        self.enter(registry, now);
        from
    }

    pub(crate) fn request_delay(&mut self, delay: Duration) {
        self.pending_delay = Some(self.pending_delay.map_or(delay, |d| d.min(delay)));
    }

    pub(crate) fn finish_pass(&mut self) -> LifecycleStatus {
        self.pass = PassState::Idle;
        self.pending_delay
            .take()
            .map_or(LifecycleStatus::Done, LifecycleStatus::Reschedule)
    }
}

/// Lifecycle state of one managed object.
pub struct ObjectLifecycle {
    object_id: ObjectId,
    hook: RescheduleHook,
    inner: Mutex<LifecycleInner>,
}

impl ObjectLifecycle {
    /// Create the lifecycle of a new object in SPECIALIZE with its presets
    /// active.
    #[must_use]
    pub fn new<O>(object_id: ObjectId, registry: &ClassRegistry<O>, hook: RescheduleHook) -> Self {
        Self::new_at(object_id, registry, hook, Instant::now())
    }

    /// Like [`ObjectLifecycle::new`] with an explicit clock reading.
    #[must_use]
    pub fn new_at<O>(
        object_id: ObjectId,
        registry: &ClassRegistry<O>,
        hook: RescheduleHook,
        now: Instant,
    ) -> Self {
        let count = registry.condition_count();
        let mut inner = LifecycleInner {
            state: LifecycleState::Specialize,
            conditions: ConditionSet::new(count),
            pass: PassState::Idle,
            timers: vec![None; count],
            pending_delay: None,
            death_reason: DeathReason::None,
        };
        inner.enter(registry, now);
        Self {
            object_id,
            hook,
            inner: Mutex::new(inner),
        }
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, LifecycleInner> {
        self.inner.lock()
    }

    /// Object this lifecycle belongs to.
    #[must_use]
    pub const fn object_id(&self) -> ObjectId {
        self.object_id
    }

    // ========================================================================
    // Condition control
    // ========================================================================

    /// Mark a condition active.
    ///
    /// It is picked up on the next pass through a rotary that contains it.
    /// Setting an already active condition is a no-op. Once the object is in
    /// DESTROY, conditions outside the DESTROY rotary are ignored.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCondition` if `id` is not registered.
    pub fn set<O>(&self, registry: &ClassRegistry<O>, id: ConditionId) -> Result<()> {
        let condition = registry.require(id)?;
        let wake = {
            let mut inner = self.lock();
            if inner.state == LifecycleState::Destroy
                && !registry.in_rotary(LifecycleState::Destroy, id)
            {
                tracing::debug!(
                    object_id = %self.object_id,
                    condition = condition.name(),
                    "ignoring condition set while in DESTROY"
                );
                return Ok(());
            }
            let newly = inner.conditions.insert(id);
            newly && !matches!(inner.pass, PassState::Running { .. })
        };
        if wake {
            tracing::debug!(object_id = %self.object_id, condition = condition.name(), "condition set");
            (self.hook)(self.object_id, Duration::ZERO);
        }
        Ok(())
    }

    /// Deactivate a condition whether or not its action ran.
    ///
    /// # Errors
    ///
    /// Returns `UnknownCondition` if `id` is not registered.
    pub fn force_clear<O>(&self, registry: &ClassRegistry<O>, id: ConditionId) -> Result<()> {
        registry.require(id)?;
        self.lock().conditions.remove(id);
        Ok(())
    }

    /// Deactivate the condition that is currently executing.
    ///
    /// Only legal from a condition's action or from the completion of the
    /// work it handed off.
    ///
    /// # Errors
    ///
    /// Returns `NoCurrentCondition` when no condition is executing.
    pub fn clear_current(&self) -> Result<ConditionId> {
        let mut inner = self.lock();
        let current = match inner.pass {
            PassState::Running {
                current: Some(id), ..
            }
            | PassState::Pending { current: id } => id,
            PassState::Running { current: None, .. } | PassState::Idle => {
                drop(inner);
                tracing::error!(object_id = %self.object_id, "clear_current outside a condition");
                return Err(LifecycleError::NoCurrentCondition);
            }
        };
        inner.conditions.remove(current);
        Ok(current)
    }

    /// Ask for another pass after `delay`.
    ///
    /// During a pass the shortest requested delay is returned by the pass
    /// itself. While a pass is pending it is kept until the pass resumes.
    /// Otherwise the scheduler hook is called directly.
    pub fn reschedule(&self, delay: Duration) {
        {
            let mut inner = self.lock();
            if matches!(
                inner.pass,
                PassState::Running { .. } | PassState::Pending { .. }
            ) {
                inner.request_delay(delay);
                return;
            }
        }
        (self.hook)(self.object_id, delay);
    }

    /// Resume after the monitor packet of `id` completed.
    ///
    /// A pending pass wakes the scheduler after the shortest delay asked
    /// for while it was pending, or at once.
    pub(crate) fn resume(&self, id: ConditionId) {
        let wake = {
            let mut inner = self.lock();
            match inner.pass {
                PassState::Running {
                    current: Some(current),
                    ..
                } if current == id => {
                    inner.pass = PassState::Running {
                        current: Some(current),
                        resumed: true,
                    };
                    None
                }
                PassState::Pending { current } if current == id => {
                    inner.pass = PassState::Idle;
                    Some(inner.pending_delay.take().unwrap_or(Duration::ZERO))
                }
                other => {
                    tracing::warn!(
                        object_id = %self.object_id,
                        condition = %id,
                        pass = ?other,
                        "stale lifecycle resume"
                    );
                    None
                }
            }
        };
        if let Some(delay) = wake {
            (self.hook)(self.object_id, delay);
        }
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        self.lock().state
    }

    /// True if `id` is active.
    #[must_use]
    pub fn is_set(&self, id: ConditionId) -> bool {
        self.lock().conditions.contains(id)
    }

    /// Active conditions in id order.
    #[must_use]
    pub fn active_conditions(&self) -> Vec<ConditionId> {
        self.lock().conditions.iter().collect()
    }

    /// True while a condition's handed-off work is outstanding.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        matches!(self.lock().pass, PassState::Pending { .. })
    }

    /// Why the object failed.
    #[must_use]
    pub fn death_reason(&self) -> DeathReason {
        self.lock().death_reason
    }

    /// Record why the object is failing.
    pub fn set_death_reason(&self, reason: DeathReason) {
        self.lock().death_reason = reason;
    }

    /// Earliest armed timer deadline.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.lock().timers.iter().flatten().min().copied()
    }

    /// True once DESTROY is current, no pass is running, and no destroy
    /// work is left.
    #[must_use]
    pub fn is_destroyed<O>(&self, registry: &ClassRegistry<O>) -> bool {
        let inner = self.lock();
        inner.state == LifecycleState::Destroy
            && inner.pass == PassState::Idle
            && !registry
                .rotary(LifecycleState::Destroy)
                .iter()
                .any(|e| inner.conditions.contains(e.condition))
    }
}

impl std::fmt::Debug for ObjectLifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("ObjectLifecycle")
            .field("object_id", &self.object_id)
            .field("state", &inner.state)
            .field("pass", &inner.pass)
            .finish_non_exhaustive()
    }
}
