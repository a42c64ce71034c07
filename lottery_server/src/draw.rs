// Draw coordination: the one-shot N-way rendezvous and the winners query.
//
// Every agency session that receives `ASK` calls `DrawCoordinator::rendezvous`
// and blocks there. When the `capacity`-th caller arrives the barrier trips
// and releases all of them at once; each gets a distinct arrival ordinal in
// `0..capacity`. The barrier never resets: callers arriving after the trip
// stay parked until `abort()` (server shutdown) releases them with
// `RendezvousError::Aborted`.
//
// The state lives behind a `Mutex` with a `Condvar`. Every session stores its
// bets before it calls `rendezvous`, and every released waiter re-acquires the
// same mutex before it returns, so all bet writes happen-before any winners
// read that follows a successful rendezvous.
//
// Winners are computed by `winners_for`: the stored bets of one agency that
// satisfy a `WinPredicate`, in store order.

use std::num::NonZeroUsize;
use std::sync::{Condvar, Mutex, MutexGuard};

use lottery_protocol::{AgencyId, Bet};

/// Winning number used when none is configured.
pub const DEFAULT_WINNING_NUMBER: u32 = 7574;

/// Why a rendezvous did not complete.
#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RendezvousError {
    #[error("draw aborted before all agencies arrived")]
    Aborted,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    tripped: bool,
    aborted: bool,
}

/// One-shot barrier shared by every agency session.
#[derive(Debug)]
pub struct DrawCoordinator {
    capacity: NonZeroUsize,
    state: Mutex<BarrierState>,
    released: Condvar,
}

impl DrawCoordinator {
    /// A coordinator that trips once `capacity` agencies have asked for
    /// winners.
    pub fn new(capacity: NonZeroUsize) -> Self {
        Self {
            capacity,
            state: Mutex::new(BarrierState::default()),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity.get()
    }

    /// Number of callers that have arrived at the barrier so far, including
    /// those already released.
    pub fn arrived(&self) -> usize {
        self.lock().arrived
    }

    pub fn is_tripped(&self) -> bool {
        self.lock().tripped
    }

    pub fn is_aborted(&self) -> bool {
        self.lock().aborted
    }

    /// Block until `capacity` callers are waiting, then return this caller's
    /// arrival ordinal. Fails with `Aborted` if the coordinator is aborted
    /// first, or if the barrier already tripped for somebody else.
    pub fn rendezvous(&self) -> Result<usize, RendezvousError> {
        let mut state = self.lock();
        if state.aborted {
            return Err(RendezvousError::Aborted);
        }

        if state.tripped {
            // Late arrival: the draw already happened. Park until shutdown.
            while !state.aborted {
                state = self.wait(state);
            }
            return Err(RendezvousError::Aborted);
        }

        let ordinal = state.arrived;
        state.arrived += 1;
        if state.arrived == self.capacity.get() {
            state.tripped = true;
            self.released.notify_all();
            return Ok(ordinal);
        }

        loop {
            state = self.wait(state);
            // Checked first: a trip that precedes an abort still counts.
            if state.tripped {
                return Ok(ordinal);
            }
            if state.aborted {
                return Err(RendezvousError::Aborted);
            }
        }
    }

    /// Release every current and future waiter with `Aborted`. Waiters that
    /// were already released by a trip keep their result. Idempotent.
    pub fn abort(&self) {
        let mut state = self.lock();
        state.aborted = true;
        self.released.notify_all();
    }

    // A panic while holding this lock can only come from a bug in this
    // module; the state itself is three plain fields and stays consistent.
    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, BarrierState>) -> MutexGuard<'a, BarrierState> {
        self.released
            .wait(guard)
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Decides whether a bet wins the draw.
pub trait WinPredicate: Send + Sync {
    fn is_winner(&self, bet: &Bet) -> bool;
}

/// A bet wins when it played exactly this number.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WinningNumber(pub u32);

impl Default for WinningNumber {
    fn default() -> Self {
        Self(DEFAULT_WINNING_NUMBER)
    }
}

impl WinPredicate for WinningNumber {
    fn is_winner(&self, bet: &Bet) -> bool {
        bet.number == self.0
    }
}

impl<F> WinPredicate for F
where
    F: Fn(&Bet) -> bool + Send + Sync,
{
    fn is_winner(&self, bet: &Bet) -> bool {
        self(bet)
    }
}

/// Documents of `agency`'s winning bets, in the order the bets were stored.
pub fn winners_for(agency: AgencyId, bets: &[Bet], predicate: &dyn WinPredicate) -> Vec<String> {
    bets.iter()
        .filter(|bet| bet.agency == agency && predicate.is_winner(bet))
        .map(|bet| bet.document.clone())
        .collect()
}
