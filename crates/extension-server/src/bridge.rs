//! Stdin event lines
//!
//! One JSON object per line: `module` picks the module (optional when only
//! one is configured), `extension` and `event` are required, every other
//! member becomes an event field.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use chart_core::Event;
use serde_json::Value;

const MODULE_FIELD: &str = "module";

/// Parse one input line into the module it is addressed to and its event.
pub fn parse_line(line: &str, default_module: Option<&str>) -> anyhow::Result<(String, Event)> {
    let value: Value = serde_json::from_str(line).context("invalid JSON")?;
    let Value::Object(object) = value else {
        return Err(anyhow!("event line must be a JSON object"));
    };

    let mut module = None;
    let mut fields = BTreeMap::new();
    for (key, value) in object {
        let text = match value {
            Value::String(text) => text,
            other => other.to_string(),
        };
        if key == MODULE_FIELD {
            module = Some(text);
        } else {
            fields.insert(key, text);
        }
    }

    let module = module
        .or_else(|| default_module.map(str::to_string))
        .ok_or_else(|| anyhow!("'module' is required when several modules are configured"))?;
    let event = Event::from_fields(fields)?;
    Ok((module, event))
}
