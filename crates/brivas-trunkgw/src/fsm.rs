//! Channel state machine: states and the direction-aware transition table

use crate::types::Direction;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

/// Channel call state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelState {
    Down,
    Restart,
    /// Network offered a call (inbound only)
    Ring,
    /// Local origination before acceptance (outbound only)
    Dialing,
    Progress,
    ProgressMedia,
    Up,
    /// Call setup rejected
    Cancel,
    /// Network initiated hangup in progress
    Terminating,
    /// Local hangup in progress
    Hangup,
    HangupComplete,
}

impl ChannelState {
    pub const ALL: [ChannelState; 11] = [
        Self::Down,
        Self::Restart,
        Self::Ring,
        Self::Dialing,
        Self::Progress,
        Self::ProgressMedia,
        Self::Up,
        Self::Cancel,
        Self::Terminating,
        Self::Hangup,
        Self::HangupComplete,
    ];
}

type TransitionMap = HashMap<(Direction, ChannelState), HashSet<ChannelState>>;

static TRANSITIONS: OnceLock<TransitionMap> = OnceLock::new();

fn allow(map: &mut TransitionMap, direction: Direction, from: &[ChannelState], to: &[ChannelState]) {
    for f in from {
        map.entry((direction, *f)).or_default().extend(to.iter().copied());
    }
}

fn build_table() -> TransitionMap {
    use ChannelState::*;
    use Direction::*;

    let mut map = TransitionMap::new();

    for direction in [Inbound, Outbound] {
        allow(&mut map, direction, &ChannelState::ALL, &[Restart]);
        allow(&mut map, direction, &[Restart], &[Down]);
        allow(&mut map, direction, &[Up], &[Hangup, Terminating]);
        allow(&mut map, direction, &[Hangup, Terminating], &[HangupComplete, Hangup]);
        allow(&mut map, direction, &[Cancel, HangupComplete, Terminating], &[Down]);
        allow(
            &mut map,
            direction,
            &[Progress, ProgressMedia],
            &[Hangup, Terminating, Up, ProgressMedia],
        );
    }

    allow(&mut map, Outbound, &[Down], &[Dialing, Progress, ProgressMedia]);
    allow(
        &mut map,
        Outbound,
        &[Dialing],
        &[Progress, ProgressMedia, Up, Hangup, Terminating, Cancel],
    );
    allow(&mut map, Outbound, &[Progress, ProgressMedia], &[Cancel]);

    allow(&mut map, Inbound, &[Down], &[Ring]);
    allow(
        &mut map,
        Inbound,
        &[Ring],
        &[Hangup, Terminating, Cancel, Progress, ProgressMedia],
    );

    map
}

/// Whether `from -> to` is legal for a channel of `direction`
pub fn is_legal(direction: Direction, from: ChannelState, to: ChannelState) -> bool {
    TRANSITIONS
        .get_or_init(build_table)
        .get(&(direction, from))
        .map(|allowed| allowed.contains(&to))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ChannelState::*;
    use Direction::*;

    #[test]
    fn test_any_state_can_restart() {
        for from in ChannelState::ALL {
            assert!(is_legal(Inbound, from, Restart), "{:?}", from);
            assert!(is_legal(Outbound, from, Restart), "{:?}", from);
        }
    }

    #[test]
    fn test_direction_specific_entries() {
        assert!(is_legal(Inbound, Down, Ring));
        assert!(!is_legal(Outbound, Down, Ring));
        assert!(is_legal(Outbound, Down, ProgressMedia));
        assert!(!is_legal(Inbound, Down, ProgressMedia));
        assert!(is_legal(Inbound, Ring, Cancel));
        assert!(!is_legal(Outbound, Ring, Cancel));
    }

    #[test]
    fn test_teardown_paths() {
        for direction in [Inbound, Outbound] {
            assert!(is_legal(direction, Up, Terminating));
            assert!(is_legal(direction, Hangup, HangupComplete));
            assert!(is_legal(direction, Terminating, HangupComplete));
            assert!(is_legal(direction, HangupComplete, Down));
            assert!(is_legal(direction, Cancel, Down));
            assert!(!is_legal(direction, Up, Down));
            assert!(!is_legal(direction, Hangup, Down));
        }
    }

    #[test]
    fn test_down_only_reached_from_terminal_states() {
        for direction in [Inbound, Outbound] {
            let sources: HashSet<_> = ChannelState::ALL
                .into_iter()
                .filter(|from| is_legal(direction, *from, Down))
                .collect();
            let expected: HashSet<_> = [Restart, Cancel, HangupComplete, Terminating].into();
            assert_eq!(sources, expected);
        }
    }
}
