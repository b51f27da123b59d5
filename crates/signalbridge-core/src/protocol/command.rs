//! Protocol commands
//!
//! Defines the outbound command lines understood by the signal controller
//! and the best-effort parse of its inbound responses.

use serde::{Deserialize, Serialize};

/// Commands sent to the signal controller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutboundCommand {
    /// Start the signal-timing program
    Start,

    /// Halt the signal-timing program
    Stop,

    /// Request a status report
    Status,

    /// Update the observed traffic state for one road
    Update {
        /// Road identifier as configured in the controller firmware
        road_id: u32,
        /// Number of vehicles currently detected on the road
        vehicle_count: u32,
        /// Whether an emergency vehicle was detected
        has_emergency: bool,
    },
}

impl OutboundCommand {
    /// Format the command as a newline-terminated wire line.
    ///
    /// The controller tokenizes on `:` and terminates on `\n`, so the field
    /// order here is part of the firmware contract.
    pub fn to_line(&self) -> String {
        match self {
            OutboundCommand::Start => "START\n".to_string(),
            OutboundCommand::Stop => "STOP\n".to_string(),
            OutboundCommand::Status => "STATUS\n".to_string(),
            OutboundCommand::Update {
                road_id,
                vehicle_count,
                has_emergency,
            } => format!("UPDATE:{}:{}:{}\n", road_id, vehicle_count, has_emergency),
        }
    }
}

/// A line received from the controller.
///
/// The firmware usually emits JSON objects with at least a `message` field,
/// but diagnostics from the bootloader and early setup are bare strings.
/// A failed parse never invalidates a line; it is kept verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum DeviceMessage {
    /// A JSON object containing a `message` field
    Structured {
        /// The controller's human-readable message
        message: String,
        /// Remaining fields of the JSON object
        fields: serde_json::Map<String, serde_json::Value>,
    },
    /// Anything that did not parse as a structured message
    Raw(String),
}

impl DeviceMessage {
    /// Best-effort parse of one inbound line
    pub fn parse(line: &str) -> Self {
        let trimmed = line.trim();
        if let Ok(serde_json::Value::Object(mut map)) = serde_json::from_str(trimmed) {
            if let Some(serde_json::Value::String(message)) = map.remove("message") {
                return DeviceMessage::Structured {
                    message,
                    fields: map,
                };
            }
        }
        DeviceMessage::Raw(trimmed.to_string())
    }

    /// The message text, regardless of framing
    pub fn text(&self) -> &str {
        match self {
            DeviceMessage::Structured { message, .. } => message,
            DeviceMessage::Raw(line) => line,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_command_lines() {
        assert_eq!(OutboundCommand::Start.to_line(), "START\n");
        assert_eq!(OutboundCommand::Stop.to_line(), "STOP\n");
        assert_eq!(OutboundCommand::Status.to_line(), "STATUS\n");
    }

    #[test]
    fn test_update_command_field_order() {
        let cmd = OutboundCommand::Update {
            road_id: 7,
            vehicle_count: 3,
            has_emergency: true,
        };
        assert_eq!(cmd.to_line(), "UPDATE:7:3:true\n");

        let cmd = OutboundCommand::Update {
            road_id: 2,
            vehicle_count: 0,
            has_emergency: false,
        };
        assert_eq!(cmd.to_line(), "UPDATE:2:0:false\n");
    }

    #[test]
    fn test_parse_structured_message() {
        let msg = DeviceMessage::parse(r#"{"message": "phase change", "road": 2}"#);
        match msg {
            DeviceMessage::Structured { message, fields } => {
                assert_eq!(message, "phase change");
                assert_eq!(fields.get("road"), Some(&serde_json::json!(2)));
            }
            other => panic!("expected structured message, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_raw_diagnostic() {
        let msg = DeviceMessage::parse("watchdog reset\r\n");
        assert_eq!(msg, DeviceMessage::Raw("watchdog reset".to_string()));
        assert_eq!(msg.text(), "watchdog reset");
    }

    #[test]
    fn test_parse_json_without_message_field_is_raw() {
        let msg = DeviceMessage::parse(r#"{"road": 2}"#);
        assert_eq!(msg, DeviceMessage::Raw(r#"{"road": 2}"#.to_string()));
    }
}
