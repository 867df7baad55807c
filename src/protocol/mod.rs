pub mod codec;

use std::collections::HashMap;

use serde_json::Value;

/// TCP port every CozyLife device listens on.
pub const PORT: u16 = 5555;

/// Protocol version carried in every frame's `pv` field.
pub const PROTOCOL_VERSION: u8 = 0;

/// Command codes for the line-JSON protocol.
///
/// `Info`, `Query`, and `Set` are the outgoing kinds; `Push` is only ever
/// received (unsolicited state report from the device).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Info = 0,
    Query = 2,
    Set = 3,
    Push = 10,
}

impl Command {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Info),
            2 => Some(Self::Query),
            3 => Some(Self::Set),
            10 => Some(Self::Push),
            _ => None,
        }
    }
}

/// One decoded protocol frame: a single CRLF-terminated JSON object.
#[derive(Debug, Clone)]
pub struct Frame {
    pub cmd: u8,
    pub pv: u8,
    pub sn: String,
    pub msg: Value,
    pub res: Option<i64>,
}

impl Frame {
    /// Extracts `msg.data` as a DPID → integer map, the payload of query
    /// replies, set acks, and pushes. `None` when the frame carries no
    /// well-formed data object. Non-integer values are skipped.
    pub fn data(&self) -> Option<HashMap<String, i64>> {
        let data = self.msg.get("data")?.as_object()?;
        let mut out = HashMap::with_capacity(data.len());
        for (key, value) in data {
            match value.as_i64() {
                Some(n) => {
                    out.insert(key.clone(), n);
                }
                None => {
                    tracing::debug!("skipping non-integer value for dpid {key}: {value}");
                }
            }
        }
        Some(out)
    }
}

/// Well-known DPIDs and related constants, per the vendor's data-point map.
/// Carried as string keys on the wire.
pub mod dpid {
    // Lights and switches
    pub const SWITCH: &str = "1";
    pub const WORK_MODE: &str = "2";
    pub const TEMP: &str = "3";
    pub const BRIGHT: &str = "4";
    pub const HUE: &str = "5";
    pub const SAT: &str = "6";

    // Energy-storage units. DPID 1 is a bitmask of output switches.
    pub const ENERGY_CONTROL: &str = "1";
    pub const ENERGY_BATTERY_PERCENT: &str = "3";
    pub const ENERGY_OUTPUT_POWER: &str = "4";
    pub const ENERGY_TIME_REMAINING: &str = "30";
    pub const ENERGY_INPUT_POWER: &str = "32";
    pub const ENERGY_LED_MODE: &str = "33";
    pub const ENERGY_MAX_OUTPUT: &str = "40";
    pub const ENERGY_CAPACITY: &str = "41";

    // Bit positions within ENERGY_CONTROL.
    pub const ENERGY_BIT_AC: i64 = 1;
    pub const ENERGY_BIT_LED: i64 = 2;
    pub const ENERGY_BIT_DC: i64 = 4;

    // ENERGY_LED_MODE values.
    pub const ENERGY_LED_MODE_HIGH: i64 = 0;
    pub const ENERGY_LED_MODE_LOW: i64 = 1;
    pub const ENERGY_LED_MODE_SOS: i64 = 5;
    pub const ENERGY_LED_MODE_AUTO: i64 = 8;
}
