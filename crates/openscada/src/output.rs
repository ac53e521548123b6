//! Output formatting: plain, JSON, YAML.

use std::io::{self, Write};

use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

use openscada_core::Variant;

use crate::cli::OutputFormat;
use crate::error::CliError;

/// One observed item value.
#[derive(Debug, Serialize)]
pub struct ValueRecord<'a> {
    pub item: &'a str,
    pub value: &'a Variant,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

pub fn render_value(format: OutputFormat, record: &ValueRecord<'_>) -> Result<String, CliError> {
    Ok(match format {
        OutputFormat::Plain => match record.timestamp {
            Some(ts) => format!(
                "{} {} = {}",
                ts.to_rfc3339_opts(SecondsFormat::Millis, true),
                record.item,
                record.value
            ),
            None => format!("{} = {}", record.item, record.value),
        },
        OutputFormat::Json => serde_json::to_string_pretty(record)?,
        OutputFormat::JsonCompact => serde_json::to_string(record)?,
        OutputFormat::Yaml => serde_yaml::to_string(record)?,
    })
}

/// Print to stdout, ignoring a closed pipe.
pub fn print_output(output: &str) {
    if output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{}", output.trim_end());
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn record(value: &Variant) -> ValueRecord<'_> {
        ValueRecord {
            item: "tank.level",
            value,
            timestamp: None,
        }
    }

    #[test]
    fn plain_output_is_item_equals_value() {
        let value = Variant::Float64(0.5);
        insta::assert_snapshot!(render_value(OutputFormat::Plain, &record(&value)).unwrap(), @"tank.level = 0.5");

        let at = DateTime::from_timestamp_millis(1_700_000_000_123).unwrap();
        let with_time = ValueRecord {
            timestamp: Some(at),
            ..record(&value)
        };
        insta::assert_snapshot!(
            render_value(OutputFormat::Plain, &with_time).unwrap(),
            @"2023-11-14T22:13:20.123Z tank.level = 0.5"
        );
    }

    #[test]
    fn json_output_keeps_the_value_type() {
        let value = Variant::Int32(7);
        insta::assert_snapshot!(
            render_value(OutputFormat::JsonCompact, &record(&value)).unwrap(),
            @r#"{"item":"tank.level","value":{"type":"int32","value":7}}"#
        );
    }
}
