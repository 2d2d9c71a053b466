use std::fmt;

/// Lifecycle state of a [`PieceDatabase`](super::PieceDatabase).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum State {
    /// A verification pass is running.
    Checking,
    /// Verified and serving reads and writes.
    Available,
    /// Waiting for a cancelled verification pass to wind down.
    Stopping,
    /// Idle. The initial state.
    Stopped,
    /// An I/O fault discarded all verification state.
    Error,
    /// Waiting for the verifier before shutting down.
    Terminating,
    /// Shut down for good.
    Terminated,
}

impl State {
    /// Returns true if no verification pass can be running.
    pub fn is_idle(&self) -> bool {
        matches!(self, State::Available | State::Stopped | State::Error)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Checking => "checking",
            State::Available => "available",
            State::Stopping => "stopping",
            State::Stopped => "stopped",
            State::Error => "error",
            State::Terminating => "terminating",
            State::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Input {
    Start,
    Stop,
    Terminate,
    VerificationComplete,
    VerificationCancelled,
    Error,
}

impl Input {
    /// Inputs only the verifier produces. Any of these arriving where the
    /// table has no entry means the verifier and the state machine disagree.
    fn from_verifier(self) -> bool {
        matches!(
            self,
            Input::VerificationComplete | Input::VerificationCancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    SpawnVerifier,
    CancelVerifier,
    NotifyAvailable,
    NotifyStopped,
    EnterError,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Outcome {
    Move { next: State, action: Action },
    Ignore,
    Invalid,
}

fn move_to(next: State, action: Action) -> Outcome {
    Outcome::Move { next, action }
}

/// The transition table.
pub(crate) fn transition(state: State, input: Input) -> Outcome {
    use Input as I;
    use State as S;

    match (state, input) {
        (S::Stopped | S::Error, I::Start) => move_to(S::Checking, Action::SpawnVerifier),

        (S::Checking, I::Stop) => move_to(S::Stopping, Action::CancelVerifier),
        (S::Available, I::Stop) => move_to(S::Stopped, Action::NotifyStopped),

        (S::Checking, I::VerificationComplete) => move_to(S::Available, Action::NotifyAvailable),
        (S::Stopping, I::VerificationComplete | I::VerificationCancelled) => {
            move_to(S::Stopped, Action::NotifyStopped)
        }

        (S::Terminating, I::VerificationComplete | I::VerificationCancelled | I::Error) => {
            move_to(S::Terminated, Action::Shutdown)
        }

        (S::Checking | S::Available | S::Stopping, I::Error) => {
            move_to(S::Error, Action::EnterError)
        }
        // A pass cut short by a fault still reports once it winds down.
        (S::Error, I::VerificationComplete | I::VerificationCancelled) => Outcome::Ignore,

        (S::Checking | S::Stopping, I::Terminate) => {
            move_to(S::Terminating, Action::CancelVerifier)
        }
        (S::Stopped | S::Available | S::Error, I::Terminate) => {
            move_to(S::Terminated, Action::Shutdown)
        }

        (_, input) if input.from_verifier() => Outcome::Invalid,
        _ => Outcome::Ignore,
    }
}
