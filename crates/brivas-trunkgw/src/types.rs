//! Common types used across the signaling engine

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Correlation id carried by call-setup events (0 = none)
pub type RequestId = u16;

/// Logical span identifier assigned by the switch
pub type SpanId = u32;

/// Release causes (Q.850) used by the engine itself
pub mod cause {
    pub const NORMAL_CLEARING: u8 = 16;
    pub const USER_BUSY: u8 = 17;
    pub const DESTINATION_OUT_OF_ORDER: u8 = 27;
    pub const NORMAL_UNSPECIFIED: u8 = 31;

    /// Gateway specific: every circuit of the trunk group is busy
    pub const SETUP_NACK_ALL_CKTS_BUSY: u8 = 117;
    /// Gateway specific: the call-setup id is already in use on the gateway
    pub const SETUP_NACK_CSUPID_DBL_USE: u8 = 200;
}

/// Physical trunk position as carried on the wire (zero-based)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Position {
    pub trunk: u8,
    pub slot: u8,
}

impl Position {
    pub const fn new(trunk: u8, slot: u8) -> Self {
        Self { trunk, slot }
    }

    /// One-based (trunk, slot) as configured on the switch side
    pub fn physical(&self) -> (u32, u32) {
        (self.trunk as u32 + 1, self.slot as u32 + 1)
    }

    /// Wire position for a one-based physical (trunk, slot)
    pub fn from_physical(trunk: u32, slot: u32) -> Option<Self> {
        let trunk = u8::try_from(trunk.checked_sub(1)?).ok()?;
        let slot = u8::try_from(slot.checked_sub(1)?).ok()?;
        Some(Self { trunk, slot })
    }
}

impl std::fmt::Display for Position {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (trunk, slot) = self.physical();
        write!(f, "s{}c{}", trunk, slot)
    }
}

/// Call direction of a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// Network originated
    Inbound,
    /// Locally originated
    Outbound,
}

/// Hunting strategy requested from the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum HuntGroup {
    SequentialAscending = 0x00,
    SequentialDescending = 0x01,
    RoundRobinAscending = 0x02,
    RoundRobinDescending = 0x03,
}

impl HuntGroup {
    fn from_letter(letter: char) -> Option<Self> {
        match letter {
            'g' => Some(Self::SequentialAscending),
            'G' => Some(Self::SequentialDescending),
            'r' => Some(Self::RoundRobinAscending),
            'R' => Some(Self::RoundRobinDescending),
            _ => None,
        }
    }
}

/// Called number split from its optional `@<hunt><group>` suffix
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialTarget {
    pub digits: String,
    /// Zero-based trunk group
    pub trunk_group: u8,
    pub hunt_group: HuntGroup,
}

impl DialTarget {
    /// Parse a dial string such as `18005551234@g2`
    pub fn parse(dial: &str) -> Self {
        let (digits, suffix) = match dial.split_once('@') {
            Some((digits, suffix)) => (digits, Some(suffix)),
            None => (dial, None),
        };

        let mut target = Self {
            digits: digits.to_string(),
            trunk_group: 0,
            hunt_group: HuntGroup::SequentialAscending,
        };

        let Some(suffix) = suffix else {
            return target;
        };
        let mut chars = suffix.chars();
        let Some(letter) = chars.next() else {
            return target;
        };
        let group: String = chars.collect();
        if group.is_empty() {
            return target;
        }

        target.hunt_group = HuntGroup::from_letter(letter).unwrap_or_else(|| {
            warn!(suffix, "Failed to determine hunt group");
            HuntGroup::SequentialAscending
        });
        target.trunk_group = group
            .parse::<u8>()
            .ok()
            .map(|tg| tg.saturating_sub(1))
            .unwrap_or(0);
        target
    }
}

/// Caller information exchanged with the switch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerData {
    pub cid_num: String,
    pub cid_name: String,
    pub ani: String,
    pub ani2: String,
    pub dnis: String,
    pub rdnis: String,
    pub screen: u8,
    pub pres: u8,
    pub hangup_cause: u8,
}

impl CallerData {
    /// Apply the gateway's redirecting string.
    ///
    /// Understands a plain numeric RDNIS as well as the tagged
    /// `PRI001-ANI2-<n>` and `RDNIS-<digits>` forms.
    pub fn apply_redirecting(&mut self, raw: &str) {
        if raw.is_empty() {
            return;
        }

        if raw.chars().all(|c| c.is_ascii_digit()) {
            self.rdnis = raw.to_string();
        }

        if let Some(rest) = raw.split("PRI001-ANI2-").nth(1) {
            let digits: String = rest.chars().take_while(|c| c.is_ascii_digit()).collect();
            if let Ok(ani2) = digits.parse::<u32>() {
                self.ani2 = format!("{:02}", ani2 % 100);
            }
        }

        if let Some(rest) = raw.split("RDNIS-").nth(1) {
            let digits: String = rest.chars().take_while(|c| !c.is_whitespace()).collect();
            if !digits.is_empty() {
                self.rdnis = digits;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_position_offsets() {
        let pos = Position::new(1, 4);
        assert_eq!(pos.physical(), (2, 5));
        assert_eq!(Position::from_physical(2, 5), Some(pos));
        assert_eq!(Position::from_physical(0, 5), None);
        assert_eq!(pos.to_string(), "s2c5");
    }

    #[test]
    fn test_dial_target_plain() {
        let target = DialTarget::parse("18005551234");
        assert_eq!(target.digits, "18005551234");
        assert_eq!(target.trunk_group, 0);
        assert_eq!(target.hunt_group, HuntGroup::SequentialAscending);
    }

    #[test]
    fn test_dial_target_with_group() {
        let target = DialTarget::parse("5551234@R3");
        assert_eq!(target.digits, "5551234");
        assert_eq!(target.trunk_group, 2);
        assert_eq!(target.hunt_group, HuntGroup::RoundRobinDescending);

        let target = DialTarget::parse("5551234@x2");
        assert_eq!(target.hunt_group, HuntGroup::SequentialAscending);
        assert_eq!(target.trunk_group, 1);
    }

    #[test]
    fn test_redirecting_forms() {
        let mut caller = CallerData::default();
        caller.apply_redirecting("4165551234");
        assert_eq!(caller.rdnis, "4165551234");

        let mut caller = CallerData::default();
        caller.apply_redirecting("PRI001-ANI2-7 RDNIS-9051112222");
        assert_eq!(caller.ani2, "07");
        assert_eq!(caller.rdnis, "9051112222");
    }
}
