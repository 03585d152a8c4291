//! `ipmitool sdr` table parsing
//!
//! Rows look like `CPU Temp | 45 degrees C | ok`. Values come in several
//! encodings; rows that fit none of them are skipped.

#[derive(Debug, Clone, PartialEq)]
pub struct SensorReading {
    pub name: String,
    pub value: f64,
    pub unit: Option<String>,
    pub status: String,
}

fn parse_value(field: &str) -> Option<(f64, Option<String>)> {
    let field = field.trim();
    if field.is_empty() || field.to_ascii_lowercase().contains("no reading") {
        return None;
    }

    // Discrete sensors report a hex state mask
    if let Some(hex) = field.strip_prefix("0x") {
        let mask = u64::from_str_radix(hex.trim(), 16).ok()?;
        return Some((if mask == 0 { 0.0 } else { 1.0 }, None));
    }

    let mut parts = field.split_whitespace();
    let value = parts.next()?.parse::<f64>().ok()?;
    let unit = parts.collect::<Vec<_>>().join(" ");
    Some((value, (!unit.is_empty()).then_some(unit)))
}

/// Parse the whole table; unparsable rows are dropped
pub fn parse_sensor_table(output: &str) -> Vec<SensorReading> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.split('|');
            let name = fields.next()?.trim();
            let (value, unit) = parse_value(fields.next()?)?;
            let status = fields.next().map(str::trim).unwrap_or_default();
            if name.is_empty() {
                return None;
            }
            Some(SensorReading {
                name: name.to_string(),
                value,
                unit,
                status: status.to_string(),
            })
        })
        .collect()
}
