//! # Display Hysteresis
//!
//! Gates the categorical state shown to users. The smoothed flag may still wobble, so
//! the displayed state only changes after `threshold` consecutive frames disagree with
//! it. The very first observation is committed immediately.

use serde::Serialize;

/// Categorical state shown to the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    /// Nothing observed yet
    Unset,
    Speech,
    NoSpeech,
}

impl DisplayState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisplayState::Unset => "unset",
            DisplayState::Speech => "speech",
            DisplayState::NoSpeech => "no_speech",
        }
    }

    fn from_smoothed(smoothed_is_noisy: bool) -> Self {
        if smoothed_is_noisy {
            DisplayState::NoSpeech
        } else {
            DisplayState::Speech
        }
    }
}

/// Emitted when the displayed state commits to a new value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StateChange {
    pub from: DisplayState,
    pub to: DisplayState,
}

/// Consecutive-frame gate over the smoothed flag.
#[derive(Debug, Clone)]
pub struct Hysteresis {
    state: DisplayState,
    consecutive_count: u32,
    threshold: u32,
}

impl Hysteresis {
    pub fn new(threshold: u32) -> Self {
        Self {
            state: DisplayState::Unset,
            consecutive_count: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn state(&self) -> DisplayState {
        self.state
    }

    pub fn consecutive_count(&self) -> u32 {
        self.consecutive_count
    }

    /// Feed one smoothed flag and return a change event when the display flips.
    ///
    /// ## State Transitions:
    /// - Unset → Speech/NoSpeech on the first observation
    /// - agreeing frame → counter reset, no change
    /// - disagreeing frame → counter + 1; commit once it reaches the threshold
    pub fn observe(&mut self, smoothed_is_noisy: bool) -> Option<StateChange> {
        let desired = DisplayState::from_smoothed(smoothed_is_noisy);

        if self.state == DisplayState::Unset {
            return Some(self.commit(desired));
        }

        if desired == self.state {
            self.consecutive_count = 0;
            return None;
        }

        self.consecutive_count += 1;
        if self.consecutive_count >= self.threshold {
            Some(self.commit(desired))
        } else {
            None
        }
    }

    fn commit(&mut self, to: DisplayState) -> StateChange {
        let change = StateChange {
            from: self.state,
            to,
        };
        self.state = to;
        self.consecutive_count = 0;
        change
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_observation_commits_immediately() {
        let mut gate = Hysteresis::new(3);
        let change = gate.observe(false).unwrap();
        assert_eq!(change.from, DisplayState::Unset);
        assert_eq!(change.to, DisplayState::Speech);
        assert_eq!(gate.state(), DisplayState::Speech);
    }

    #[test]
    fn test_single_disagreeing_frame_does_not_flip() {
        let mut gate = Hysteresis::new(3);
        gate.observe(false);

        assert!(gate.observe(true).is_none());
        assert_eq!(gate.state(), DisplayState::Speech);
        assert_eq!(gate.consecutive_count(), 1);

        // An agreeing frame resets the pending transition
        assert!(gate.observe(false).is_none());
        assert_eq!(gate.consecutive_count(), 0);
    }

    #[test]
    fn test_three_disagreeing_frames_flip() {
        let mut gate = Hysteresis::new(3);
        gate.observe(false);

        assert!(gate.observe(true).is_none());
        assert!(gate.observe(true).is_none());
        let change = gate.observe(true).unwrap();

        assert_eq!(change.from, DisplayState::Speech);
        assert_eq!(change.to, DisplayState::NoSpeech);
        assert_eq!(gate.state(), DisplayState::NoSpeech);
        assert_eq!(gate.consecutive_count(), 0);
    }

    #[test]
    fn test_interrupted_run_starts_over() {
        let mut gate = Hysteresis::new(3);
        gate.observe(true);

        gate.observe(false);
        gate.observe(false);
        gate.observe(true); // reset
        gate.observe(false);
        assert!(gate.observe(false).is_none());
        assert_eq!(gate.state(), DisplayState::NoSpeech);
        assert!(gate.observe(false).is_some());
    }

    #[test]
    fn test_display_state_serialization() {
        assert_eq!(serde_json::to_string(&DisplayState::NoSpeech).unwrap(), "\"no_speech\"");
        assert_eq!(DisplayState::Speech.as_str(), "speech");
    }
}
