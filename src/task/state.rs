//! Transition legality for the task lifecycle.

use super::State;

/// True when a task may move from `src` to `dst`. The self-loops on
/// `Scheduled` and `Running` are retries and refreshes, not violations;
/// `Completed` and `Failed` accept nothing.
pub fn valid_state_transition(src: State, dst: State) -> bool {
    match src {
        State::Pending => matches!(dst, State::Scheduled),
        State::Scheduled => matches!(dst, State::Scheduled | State::Running | State::Failed),
        State::Running => matches!(dst, State::Running | State::Completed | State::Failed),
        State::Completed | State::Failed => false,
    }
}
