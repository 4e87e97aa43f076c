//! In-flight claims
//!
//! At most one pipeline run per fingerprint: the first caller becomes the
//! owner, everyone else waits on the owner's published result. The owner
//! also reports which phase it is in, so waiters can show progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::fingerprint::Fingerprint;
use crate::types::PipelinePhase;

#[derive(Debug, Clone)]
enum ClaimState<T> {
    Pending,
    /// `step` counts reports, so a repeated phase is still news
    Running { phase: PipelinePhase, step: usize },
    Ready(T),
    /// The owner went away without publishing
    Abandoned,
}

struct ClaimSlot<T> {
    started_at: Instant,
    sender: watch::Sender<ClaimState<T>>,
    waiters: AtomicUsize,
    steps: AtomicUsize,
}

type Slots<T> = Mutex<HashMap<Fingerprint, Arc<ClaimSlot<T>>>>;

/// Registry of fingerprints with a pipeline run in progress
pub struct InFlightRegistry<T> {
    slots: Arc<Slots<T>>,
}

impl<T> Default for InFlightRegistry<T> {
    fn default() -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

/// A claim in progress, for health reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightClaim {
    pub fingerprint: Fingerprint,
    pub age: Duration,
    pub waiters: usize,
}

/// What a waiter learns about the owner's run
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimUpdate<T> {
    /// The owner entered a new phase
    Running(PipelinePhase),
    Ready(T),
    /// The owner went away without publishing
    Abandoned,
}

/// The result of [`InFlightRegistry::claim_or_join`]
pub enum Claim<T> {
    /// Run the pipeline and publish through the guard
    Owner(ClaimGuard<T>),
    /// Someone else is running it; wait for their result
    Waiter(ClaimWaiter<T>),
}

impl<T> Claim<T> {
    pub fn is_owner(&self) -> bool {
        matches!(self, Claim::Owner(_))
    }
}

fn lock<T>(slots: &Slots<T>) -> MutexGuard<'_, HashMap<Fingerprint, Arc<ClaimSlot<T>>>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T: Clone + Send + Sync + 'static> InFlightRegistry<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Become the owner of `fingerprint`, or join the current owner
    pub fn claim_or_join(&self, fingerprint: &Fingerprint) -> Claim<T> {
        let mut slots = lock(&self.slots);

        if let Some(slot) = slots.get(fingerprint) {
            slot.waiters.fetch_add(1, Ordering::SeqCst);
            return Claim::Waiter(ClaimWaiter::new(slot));
        }

        let (sender, _) = watch::channel(ClaimState::Pending);
        let slot = Arc::new(ClaimSlot {
            started_at: Instant::now(),
            sender,
            waiters: AtomicUsize::new(0),
            steps: AtomicUsize::new(0),
        });
        slots.insert(fingerprint.clone(), Arc::clone(&slot));

        Claim::Owner(ClaimGuard {
            slots: Arc::clone(&self.slots),
            fingerprint: fingerprint.clone(),
            slot,
            published: false,
        })
    }

    /// Number of fingerprints currently being generated
    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every claim in progress
    pub fn claims(&self) -> Vec<InFlightClaim> {
        let now = Instant::now();
        lock(&self.slots)
            .iter()
            .map(|(fingerprint, slot)| InFlightClaim {
                fingerprint: fingerprint.clone(),
                age: now.saturating_duration_since(slot.started_at),
                waiters: slot.waiters.load(Ordering::SeqCst),
            })
            .collect()
    }
}

/// Ownership of one fingerprint's pipeline run.
///
/// Dropping the guard without publishing releases the claim and tells the
/// waiters to claim again.
pub struct ClaimGuard<T> {
    slots: Arc<Slots<T>>,
    fingerprint: Fingerprint,
    slot: Arc<ClaimSlot<T>>,
    published: bool,
}

impl<T: Clone> ClaimGuard<T> {
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// A waiter on this guard's own result
    pub fn subscribe(&self) -> ClaimWaiter<T> {
        ClaimWaiter::new(&self.slot)
    }

    /// Tell the waiters which phase the run is in
    pub fn report(&self, phase: PipelinePhase) {
        let step = self.slot.steps.fetch_add(1, Ordering::SeqCst);
        self.slot.sender.send_replace(ClaimState::Running { phase, step });
    }

    /// Requests that joined this claim so far
    pub fn waiters(&self) -> usize {
        self.slot.waiters.load(Ordering::SeqCst)
    }

    /// Hand the result to every waiter and release the claim
    pub fn publish(mut self, value: T) {
        // Released first: a waiter that claims again on wake-up must not
        // land back on this finished slot
        self.release();
        self.slot.sender.send_replace(ClaimState::Ready(value));
        self.published = true;
    }

    fn release(&self) {
        let mut slots = lock(&self.slots);
        // A newer claim for the same fingerprint is not ours to remove
        if slots
            .get(&self.fingerprint)
            .map_or(false, |current| Arc::ptr_eq(current, &self.slot))
        {
            slots.remove(&self.fingerprint);
        }
    }
}

impl<T> Drop for ClaimGuard<T> {
    fn drop(&mut self) {
        if self.published {
            return;
        }
        self.slot.sender.send_replace(ClaimState::Abandoned);

        let mut slots = lock(&self.slots);
        if slots
            .get(&self.fingerprint)
            .map_or(false, |current| Arc::ptr_eq(current, &self.slot))
        {
            slots.remove(&self.fingerprint);
        }
    }
}

/// A request waiting on another request's pipeline run
pub struct ClaimWaiter<T> {
    receiver: watch::Receiver<ClaimState<T>>,
    started_at: Instant,
    last_step: Option<usize>,
}

impl<T: Clone> ClaimWaiter<T> {
    fn new(slot: &ClaimSlot<T>) -> Self {
        Self {
            receiver: slot.sender.subscribe(),
            started_at: slot.started_at,
            last_step: None,
        }
    }

    /// When the owner started
    pub fn started_at(&self) -> Instant {
        self.started_at
    }

    /// The next phase change, or how the run ended.
    ///
    /// A waiter that joins mid-run first sees the phase in progress. Phases
    /// reported faster than the waiter polls are skipped.
    pub async fn next_update(&mut self) -> ClaimUpdate<T> {
        loop {
            let update = match &*self.receiver.borrow_and_update() {
                ClaimState::Pending => None,
                ClaimState::Running { phase, step } if self.last_step != Some(*step) => {
                    self.last_step = Some(*step);
                    Some(ClaimUpdate::Running(*phase))
                }
                ClaimState::Running { .. } => None,
                ClaimState::Ready(value) => Some(ClaimUpdate::Ready(value.clone())),
                ClaimState::Abandoned => Some(ClaimUpdate::Abandoned),
            };
            if let Some(update) = update {
                return update;
            }

            if self.receiver.changed().await.is_err() {
                // Sender gone; its last value is still readable
                return match &*self.receiver.borrow() {
                    ClaimState::Ready(value) => ClaimUpdate::Ready(value.clone()),
                    _ => ClaimUpdate::Abandoned,
                };
            }
        }
    }

    /// The owner's result, or `None` when the owner gave up
    pub async fn wait(mut self) -> Option<T> {
        loop {
            match self.next_update().await {
                ClaimUpdate::Running(_) => {}
                ClaimUpdate::Ready(value) => return Some(value),
                ClaimUpdate::Abandoned => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ImageRef, SuggestionRequest};

    fn fingerprint(id: &str) -> Fingerprint {
        Fingerprint::of(&SuggestionRequest::new(ImageRef::id_only(id)))
    }

    #[tokio::test]
    async fn first_caller_owns_and_others_wait() {
        let registry = InFlightRegistry::<u32>::new();
        let fp = fingerprint("a");

        let Claim::Owner(guard) = registry.claim_or_join(&fp) else {
            panic!("first caller must own the claim");
        };
        let Claim::Waiter(waiter) = registry.claim_or_join(&fp) else {
            panic!("second caller must wait");
        };
        assert!(registry.claim_or_join(&fingerprint("b")).is_owner());
        assert_eq!(guard.waiters(), 1);

        let own = guard.subscribe();
        let handle = tokio::spawn(waiter.wait());
        guard.publish(7);

        assert_eq!(handle.await.unwrap(), Some(7));
        assert_eq!(own.wait().await, Some(7));
        assert!(registry.claim_or_join(&fp).is_owner());
    }

    #[tokio::test]
    async fn dropped_owner_abandons_waiters() {
        let registry = InFlightRegistry::<u32>::new();
        let fp = fingerprint("a");

        let guard = registry.claim_or_join(&fp);
        let Claim::Waiter(waiter) = registry.claim_or_join(&fp) else {
            panic!("second caller must wait");
        };
        drop(guard);

        assert_eq!(waiter.wait().await, None);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn waiters_follow_the_owners_phases() {
        let registry = InFlightRegistry::<u32>::new();
        let fp = fingerprint("a");

        let Claim::Owner(guard) = registry.claim_or_join(&fp) else {
            panic!("first caller must own the claim");
        };
        guard.report(PipelinePhase::ImageAnalysis);

        let Claim::Waiter(mut late) = registry.claim_or_join(&fp) else {
            panic!("second caller must wait");
        };
        assert_eq!(late.next_update().await, ClaimUpdate::Running(PipelinePhase::ImageAnalysis));

        guard.report(PipelinePhase::SuggestionGeneration);
        assert_eq!(
            late.next_update().await,
            ClaimUpdate::Running(PipelinePhase::SuggestionGeneration)
        );

        // A retry starts over; the repeated phase is reported again
        guard.report(PipelinePhase::ImageAnalysis);
        assert_eq!(late.next_update().await, ClaimUpdate::Running(PipelinePhase::ImageAnalysis));

        guard.publish(3);
        assert_eq!(late.next_update().await, ClaimUpdate::Ready(3));
    }

    #[tokio::test]
    async fn claims_are_reported() {
        let registry = InFlightRegistry::<u32>::new();
        let fp = fingerprint("a");
        let _guard = registry.claim_or_join(&fp);
        let _waiter = registry.claim_or_join(&fp);

        let claims = registry.claims();
        assert_eq!(claims.len(), 1);
        assert_eq!(claims[0].fingerprint, fp);
        assert_eq!(claims[0].waiters, 1);
    }
}
