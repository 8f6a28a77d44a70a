// ============================================================================
// COMMANDS.RS - MQTT COMMAND VARIANTS
// Typed bulb commands, turned into the [{dn, type, value, time}] wire array
// only when they are published
// ============================================================================

use serde::Serialize;
use serde_json::{json, Value};

/// Commands for a single bulb
#[derive(Debug, Clone, PartialEq)]
pub enum BulbCommand {
    Switch(bool),
    /// Percent 0-100
    Brightness(u8),
    Color { r: u8, g: u8, b: u8 },
    /// Percent 0-100; the bulb is switched on with it
    ColorTemperature(u8),
    /// 0 off, 7 audio sync, 100 video sync, 101 game sync
    EffectStatus(u32),
    Reset,
    /// Firmware URL the bulb should download
    Update(String),
}

impl BulbCommand {
    pub fn brightness(percent: i64) -> Self {
        BulbCommand::Brightness(clamp_percent(percent))
    }

    pub fn color_temperature(percent: i64) -> Self {
        BulbCommand::ColorTemperature(clamp_percent(percent))
    }

    pub fn color(r: i64, g: i64, b: i64) -> Self {
        let channel = |v: i64| v.clamp(0, 255) as u8;
        BulbCommand::Color { r: channel(r), g: channel(g), b: channel(b) }
    }

    /// Wire entries for this command, addressed to `mac`
    pub fn entries(&self, mac: &str, time: i64) -> Vec<CommandEntry> {
        let entry = |kind: &str, value: String| CommandEntry {
            dn: mac.to_string(),
            kind: kind.to_string(),
            value: Value::String(value),
            time,
        };
        match self {
            BulbCommand::Switch(on) => vec![entry("switch", switch_value(*on))],
            BulbCommand::Brightness(p) => vec![entry("brightness", p.to_string())],
            BulbCommand::Color { r, g, b } => vec![entry("color", format!("{}:{}:{}", r, g, b))],
            BulbCommand::ColorTemperature(p) => vec![
                entry("colorTemperature", p.to_string()),
                entry("switch", switch_value(true)),
            ],
            BulbCommand::EffectStatus(s) => vec![entry("effectStatus", s.to_string())],
            BulbCommand::Reset => vec![entry("reset", "1".to_string())],
            BulbCommand::Update(url) => vec![entry("update", url.clone())],
        }
    }
}

/// Commands fanned out by the first bulb of a group
#[derive(Debug, Clone, PartialEq)]
pub enum GroupCommand {
    Switch(bool),
    Brightness(u8),
    ColorTemperature(u8),
}

impl GroupCommand {
    pub fn brightness(percent: i64) -> Self {
        GroupCommand::Brightness(clamp_percent(percent))
    }

    pub fn color_temperature(percent: i64) -> Self {
        GroupCommand::ColorTemperature(clamp_percent(percent))
    }

    /// The group id is the first MAC, like the vendor app does it
    pub fn entries(&self, macs: &[String], gradient_time: u32, time: i64) -> Vec<CommandEntry> {
        let group_id = macs.first().cloned().unwrap_or_default();
        let (kind, mut value) = match self {
            GroupCommand::Switch(on) => ("groupSwitch", json!({"switch": switch_value(*on)})),
            GroupCommand::Brightness(p) => ("groupBrightness", json!({"brightness": p.to_string()})),
            GroupCommand::ColorTemperature(p) => {
                ("groupColorTemperature", json!({"colorTemperature": p.to_string()}))
            }
        };
        value["gradientTime"] = json!(gradient_time);
        value["deviceUuidList"] = json!(macs);
        vec![CommandEntry {
            dn: group_id,
            kind: kind.to_string(),
            value,
            time,
        }]
    }
}

/// One element of the update topic's JSON array
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandEntry {
    pub dn: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub value: Value,
    pub time: i64,
}

/// Encode entries for the update topic
pub fn encode_entries(entries: &[CommandEntry]) -> String {
    serde_json::to_string(entries).unwrap_or_else(|_| "[]".to_string())
}

fn clamp_percent(percent: i64) -> u8 {
    percent.clamp(0, 100) as u8
}

fn switch_value(on: bool) -> String {
    if on { "1" } else { "0" }.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAC: &str = "AA:BB:CC:DD:EE:FF";

    #[test]
    fn switch_entry_wire_shape() {
        let entries = BulbCommand::Switch(true).entries(MAC, 1700000000000);
        let wire: Value = serde_json::from_str(&encode_entries(&entries)).unwrap();
        assert_eq!(
            wire,
            json!([{"dn": MAC, "type": "switch", "value": "1", "time": 1700000000000i64}])
        );
    }

    #[test]
    fn color_temperature_also_switches_on() {
        let entries = BulbCommand::color_temperature(140).entries(MAC, 1);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].kind, "colorTemperature");
        assert_eq!(entries[0].value, json!("100"));
        assert_eq!(entries[1].kind, "switch");
    }

    #[test]
    fn color_is_colon_separated_and_clamped() {
        let entries = BulbCommand::color(255, 300, -4).entries(MAC, 1);
        assert_eq!(entries[0].value, json!("255:255:0"));
    }

    #[test]
    fn group_entries_carry_members_and_gradient() {
        let macs = vec![MAC.to_string(), "11:22:33:44:55:66".to_string()];
        let entries = GroupCommand::brightness(55).entries(&macs, 10, 5);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].dn, MAC);
        assert_eq!(entries[0].kind, "groupBrightness");
        assert_eq!(entries[0].value["brightness"], "55");
        assert_eq!(entries[0].value["gradientTime"], 10);
        assert_eq!(entries[0].value["deviceUuidList"][1], "11:22:33:44:55:66");
    }

    #[test]
    fn update_carries_firmware_url() {
        let entries = BulbCommand::Update("http://10.0.0.2:8080/shim.bin".into()).entries(MAC, 1);
        assert_eq!(entries[0].kind, "update");
        assert_eq!(entries[0].value, json!("http://10.0.0.2:8080/shim.bin"));
    }
}
