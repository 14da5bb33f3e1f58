//! Outbound commands.
//!
//! Every command carries the state the device should end up in, never a
//! toggle. Callers that want to flip a switch read the cached value, decide the
//! target state and send that.

use std::fmt;

use super::topics::RoomTopics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SwitchState {
    Off,
    On,
}

impl SwitchState {
    /// Relay topics report `"1"` / `"0"`.
    pub fn from_relay_payload(payload: &str) -> Option<Self> {
        match payload.trim() {
            "1" => Some(SwitchState::On),
            "0" => Some(SwitchState::Off),
            _ => None,
        }
    }

    /// Pump topics report `"ON"` / `"OFF"`.
    pub fn from_pump_payload(payload: &str) -> Option<Self> {
        let payload = payload.trim();
        if payload.eq_ignore_ascii_case("on") {
            Some(SwitchState::On)
        } else if payload.eq_ignore_ascii_case("off") {
            Some(SwitchState::Off)
        } else {
            None
        }
    }

    pub fn is_on(self) -> bool {
        self == SwitchState::On
    }

    pub fn inverted(self) -> Self {
        match self {
            SwitchState::On => SwitchState::Off,
            SwitchState::Off => SwitchState::On,
        }
    }

    fn relay_token(self) -> &'static str {
        match self {
            SwitchState::On => "1",
            SwitchState::Off => "0",
        }
    }

    fn pump_token(self) -> &'static str {
        match self {
            SwitchState::On => "ON",
            SwitchState::Off => "OFF",
        }
    }
}

impl From<bool> for SwitchState {
    fn from(on: bool) -> Self {
        if on {
            SwitchState::On
        } else {
            SwitchState::Off
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    Paid,
    Unpaid,
    Other(String),
}

impl PaymentStatus {
    pub fn from_payload(payload: &str) -> Self {
        match payload.trim() {
            "paid" => PaymentStatus::Paid,
            "unpaid" | "" => PaymentStatus::Unpaid,
            other => PaymentStatus::Other(other.to_string()),
        }
    }

    pub fn is_paid(&self) -> bool {
        matches!(self, PaymentStatus::Paid)
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            PaymentStatus::Paid => write!(f, "paid"),
            PaymentStatus::Unpaid => write!(f, "unpaid"),
            PaymentStatus::Other(status) => write!(f, "{status}"),
        }
    }
}

/// A command with its target topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Single relay, payload `"1"` / `"0"`
    Relay { topic: String, state: SwitchState },
    /// Water pump, payload `"ON"` / `"OFF"`
    Pump { topic: String, state: SwitchState },
    /// One channel of a multi-relay board, payload `"<channel>:<0|1>"`
    RelayChannel {
        topic: String,
        channel: u8,
        state: SwitchState,
    },
    Payment {
        topic: String,
        status: PaymentStatus,
    },
}

impl Command {
    pub fn room_power(room: &RoomTopics, state: SwitchState) -> Self {
        Command::Relay {
            topic: room.relay_control.clone(),
            state,
        }
    }

    pub fn room_paid(room: &RoomTopics) -> Self {
        Command::Payment {
            topic: room.payment_status.clone(),
            status: PaymentStatus::Paid,
        }
    }

    pub fn topic(&self) -> &str {
        match self {
            Command::Relay { topic, .. }
            | Command::Pump { topic, .. }
            | Command::RelayChannel { topic, .. }
            | Command::Payment { topic, .. } => topic,
        }
    }

    pub fn payload(&self) -> String {
        match self {
            Command::Relay { state, .. } => state.relay_token().to_string(),
            Command::Pump { state, .. } => state.pump_token().to_string(),
            Command::RelayChannel { channel, state, .. } => {
                format!("{}:{}", channel, state.relay_token())
            }
            Command::Payment { status, .. } => status.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payloads_encode_absolute_state() {
        let relay = Command::Relay {
            topic: "relay/1".into(),
            state: SwitchState::On,
        };
        assert_eq!(relay.payload(), "1");

        let pump = Command::Pump {
            topic: "relay/control".into(),
            state: SwitchState::Off,
        };
        assert_eq!(pump.payload(), "OFF");

        let channel = Command::RelayChannel {
            topic: "relay/control".into(),
            channel: 2,
            state: SwitchState::On,
        };
        assert_eq!(channel.payload(), "2:1");
        assert_eq!(channel.topic(), "relay/control");
    }

    #[test]
    fn room_commands_target_room_topics() {
        let room = RoomTopics::for_room(4);
        let power = Command::room_power(&room, SwitchState::Off);
        assert_eq!(power.topic(), "kost/kamar04/relay/control");
        assert_eq!(power.payload(), "0");

        let paid = Command::room_paid(&room);
        assert_eq!(paid.topic(), "kost/kamar04/payment/status");
        assert_eq!(paid.payload(), "paid");
    }

    #[test]
    fn cached_payloads_parse_into_states() {
        assert_eq!(SwitchState::from_relay_payload("1"), Some(SwitchState::On));
        assert_eq!(SwitchState::from_relay_payload(" 0 "), Some(SwitchState::Off));
        assert_eq!(SwitchState::from_relay_payload("ON"), None);
        assert_eq!(SwitchState::from_pump_payload("on"), Some(SwitchState::On));
        assert_eq!(SwitchState::from_pump_payload("OFF"), Some(SwitchState::Off));
        assert_eq!(SwitchState::On.inverted(), SwitchState::Off);

        assert!(PaymentStatus::from_payload("paid").is_paid());
        assert_eq!(PaymentStatus::from_payload(""), PaymentStatus::Unpaid);
        assert_eq!(
            PaymentStatus::from_payload("overdue"),
            PaymentStatus::Other("overdue".into())
        );
    }
}
