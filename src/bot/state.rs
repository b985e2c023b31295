//! User dialogue state

use serde::{Deserialize, Serialize};

/// Represents the current state of the operator dialogue
#[derive(Clone, Serialize, Deserialize, Default)]
pub enum State {
    /// Initial state, commands only
    #[default]
    Idle,
    /// `/login` was issued; the next message is the phone number
    AwaitingPhone,
    /// First login step passed; the next message is the second-factor code
    AwaitingSecondFactor,
}
