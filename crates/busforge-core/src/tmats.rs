//! TMATS Builder
//!
//! Builds the minimal Telemetry Attributes Transfer Standard record that
//! opens every Chapter 10 file: general information, recorder identity,
//! the time channel, the 1553 bus channel(s) and summary comments derived
//! from the ICD. Attributes are emitted in sorted order so the record is
//! byte-deterministic.

use crate::icd::{BusId, Icd};
use chrono::{DateTime, Datelike, Utc};
use std::collections::BTreeMap;

/// Minimal TMATS attribute builder.
#[derive(Debug, Clone, Default)]
pub struct TmatsBuilder {
    attributes: BTreeMap<String, String>,
    channels: usize,
    buses: usize,
    comments: usize,
}

impl TmatsBuilder {
    /// Start a record with the mandatory general-information attributes.
    pub fn new(origin_date: DateTime<Utc>) -> Self {
        let mut builder = Self::default();
        builder.set("G\\DSI\\N", "busforge");
        builder.set("G\\106", "11");
        builder.set(
            "G\\OD",
            format!(
                "{:02}/{:02}/{:04}",
                origin_date.month(),
                origin_date.day(),
                origin_date.year()
            ),
        );
        builder.set("G\\DST", "SYNTHESIZED");
        builder
    }

    /// Set a raw attribute.
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.attributes.insert(key.to_string(), value.into());
    }

    /// Program name.
    pub fn with_program_name(mut self, name: &str) -> Self {
        self.set("G\\PN", name);
        self
    }

    /// Test / scenario name.
    pub fn with_test_name(mut self, name: &str) -> Self {
        self.set("G\\TA", name);
        self
    }

    /// Recorder identity.
    pub fn with_recorder(mut self, manufacturer: &str, model: &str, serial: &str) -> Self {
        self.set("R\\ID", manufacturer);
        self.set("R\\MN", model);
        self.set("R\\SN", serial);
        self
    }

    /// Add the time data channel.
    pub fn add_time_channel(&mut self, channel_id: u16) {
        self.channels += 1;
        let n = self.channels;
        self.set(&format!("R-{}\\ID", n), format!("{:03X}", channel_id));
        self.set(&format!("R-{}\\CDT", n), "TIM");
        self.set(&format!("R-{}\\TF1", n), "IRIG-B");
        self.set(&format!("R-{}\\TIMEFMT", n), "1");
    }

    /// Add a 1553 data channel.
    pub fn add_1553_channel(&mut self, channel_id: u16, bus_name: &str, description: &str) {
        self.channels += 1;
        let n = self.channels;
        self.set(&format!("R-{}\\ID", n), format!("{:03X}", channel_id));
        self.set(&format!("R-{}\\CDT", n), "1553IN");
        self.set(&format!("R-{}\\TK1", n), bus_name);
        self.set(&format!("R-{}\\DSI", n), description);
        self.set(&format!("R-{}\\BTF", n), "M");
    }

    /// Add bus-level attributes.
    pub fn add_bus(&mut self, bus_name: &str, message_count: usize, word_rate: f64) {
        self.buses += 1;
        let n = self.buses;
        self.set(&format!("B-{}\\ID", n), bus_name);
        self.set(&format!("B-{}\\NM", n), message_count.to_string());
        if word_rate > 0.0 {
            self.set(&format!("B-{}\\WR", n), format!("{:.1}", word_rate));
        }
    }

    /// Add a free-form comment.
    pub fn add_comment(&mut self, comment: &str) {
        self.comments += 1;
        self.set(&format!("G\\COM-{}", self.comments), comment);
    }

    /// Render the record: `key:value;` lines joined with CRLF.
    pub fn build(&self) -> String {
        let mut lines = vec!["TMATS\\1.0;".to_string()];
        for (key, value) in &self.attributes {
            lines.push(format!("{}:{};", key, value));
        }
        lines.push("G\\SHA:0000;".to_string());
        lines.join("\r\n") + "\r\n"
    }
}

/// Build the standard record for a recording of the given ICD.
pub fn tmats_for_recording(
    icd: &Icd,
    scenario_name: &str,
    start_time: DateTime<Utc>,
    time_channel_id: u16,
    bus_channel_id: u16,
    duration_s: f64,
    total_messages: u64,
) -> String {
    let mut builder = TmatsBuilder::new(start_time)
        .with_program_name("BUSFORGE")
        .with_test_name(scenario_name)
        .with_recorder("SYNTHETIC", "BUSFORGE", "000001");

    builder.add_time_channel(time_channel_id);
    let bus_name = match icd.bus {
        BusId::A => "BUS-A",
        BusId::B => "BUS-B",
    };
    builder.add_1553_channel(
        bus_channel_id,
        bus_name,
        &format!("MIL-STD-1553 Bus {:?}", icd.bus),
    );
    builder.add_bus(bus_name, icd.messages.len(), icd.total_word_rate());

    let names: Vec<&str> = icd.messages.iter().map(|m| m.name.as_str()).collect();
    builder.add_comment(&format!("ICD Messages: {}", names.join(", ")));
    builder.add_comment(&format!("Recording Duration: {:.1} seconds", duration_s));
    builder.add_comment(&format!("Total 1553 Messages: {}", total_messages));
    builder.add_comment("Synthetic MIL-STD-1553 bus traffic");

    builder.build()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 15, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_mandatory_attributes() {
        let tmats = TmatsBuilder::new(origin()).build();
        assert!(tmats.starts_with("TMATS\\1.0;\r\n"));
        assert!(tmats.contains("G\\106:11;"));
        assert!(tmats.contains("G\\DSI\\N:busforge;"));
        assert!(tmats.contains("G\\OD:06/15/2024;"));
        assert!(tmats.ends_with(";\r\n"));
    }

    #[test]
    fn test_channel_indices_increment() {
        let mut builder = TmatsBuilder::new(origin());
        builder.add_time_channel(0x001);
        builder.add_1553_channel(0x002, "BUS-A", "primary bus");
        let tmats = builder.build();
        assert!(tmats.contains("R-1\\ID:001;"));
        assert!(tmats.contains("R-1\\CDT:TIM;"));
        assert!(tmats.contains("R-2\\ID:002;"));
        assert!(tmats.contains("R-2\\CDT:1553IN;"));
        assert!(tmats.contains("R-2\\TK1:BUS-A;"));
    }

    #[test]
    fn test_deterministic_output() {
        let mut a = TmatsBuilder::new(origin());
        a.add_comment("one");
        a.add_bus("BUS-A", 3, 120.0);
        let mut b = TmatsBuilder::new(origin());
        b.add_comment("one");
        b.add_bus("BUS-A", 3, 120.0);
        assert_eq!(a.build(), b.build());
    }
}
