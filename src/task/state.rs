use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle of a task. States only ever advance along
/// `New -> Blocked -> Ready -> Running -> Aggregating -> Done`;
/// any other transition is a scheduler bug and trips an assertion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum State {
    /// Created, not yet handed to the runtime.
    New = 0,
    /// Released, still waiting on dependencies.
    Blocked = 1,
    /// All dependencies met, sitting in (or headed for) a work queue.
    Ready = 2,
    /// A worker has committed to executing this task.
    Running = 3,
    /// Collecting results from children or a substitute.
    Aggregating = 4,
    /// Completed, value (if any) published.
    Done = 5,
}

impl State {
    fn from_u8(raw: u8) -> State {
        match raw {
            0 => State::New,
            1 => State::Blocked,
            2 => State::Ready,
            3 => State::Running,
            4 => State::Aggregating,
            5 => State::Done,
            _ => unreachable!("corrupt task state: {}", raw),
        }
    }

    /// Whether `self -> next` is one of the permitted transitions.
    pub(crate) fn can_advance_to(self, next: State) -> bool {
        next as u8 == self as u8 + 1
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::New => "New",
            State::Blocked => "Blocked",
            State::Ready => "Ready",
            State::Running => "Running",
            State::Aggregating => "Aggregating",
            State::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Atomically shared task state.
///
/// The split/substitute protocol guarantees a single transitioning thread per
/// step, so `advance` uses a plain swap and validates the observed
/// predecessor afterwards. Store is release, load is acquire, which is what
/// publishes a task's side effects to anybody observing `Done`.
pub(crate) struct AtomicState(AtomicU8);

impl AtomicState {
    pub(crate) fn new(state: State) -> Self {
        AtomicState(AtomicU8::new(state as u8))
    }

    pub(crate) fn load(&self) -> State {
        State::from_u8(self.0.load(Ordering::Acquire))
    }

    /// Moves to `next`, asserting the transition was legal.
    pub(crate) fn advance(&self, next: State) {
        let prev = State::from_u8(self.0.swap(next as u8, Ordering::AcqRel));
        assert!(
            prev.can_advance_to(next),
            "illegal task state transition from {} to {}",
            prev,
            next
        );
    }
}

impl fmt::Debug for AtomicState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.load(), f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permitted_transitions() {
        let order = [
            State::New,
            State::Blocked,
            State::Ready,
            State::Running,
            State::Aggregating,
            State::Done,
        ];
        for w in order.windows(2) {
            assert!(w[0].can_advance_to(w[1]), "{} -> {}", w[0], w[1]);
        }
        assert!(!State::New.can_advance_to(State::Ready));
        assert!(!State::Running.can_advance_to(State::Ready));
        assert!(!State::Done.can_advance_to(State::New));
    }

    #[test]
    fn test_advance_happy_path() {
        let state = AtomicState::new(State::New);
        state.advance(State::Blocked);
        state.advance(State::Ready);
        state.advance(State::Running);
        state.advance(State::Aggregating);
        state.advance(State::Done);
        assert_eq!(state.load(), State::Done);
    }

    #[test]
    #[should_panic(expected = "illegal task state transition")]
    fn test_advance_rejects_skips() {
        let state = AtomicState::new(State::New);
        state.advance(State::Ready);
    }
}
