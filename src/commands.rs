//! Command execution.

use crate::Commands;
use colored::Colorize;
use serde_json::{Map, Value};
use statebound_core::{DispatchOutcome, EventEnvelope, RecordKey};
use statebound_storage::{CheckReport, CheckStatus, Runtime};

/// Executes a command and returns the formatted output.
pub fn execute(
    runtime: &Runtime,
    cmd: Commands,
    json: bool,
) -> Result<String, Box<dyn std::error::Error>> {
    match cmd {
        Commands::PutStatechart {
            record_type,
            source,
            create,
        } => {
            let source = read_text_arg(&source)?;
            let existed = runtime.registry().get(&record_type).is_some();
            let stored = if create {
                runtime.registry().create(&record_type, &source)?
            } else {
                runtime.registry().put(&record_type, &source)?
            };

            if json {
                return Ok(format_json(&serde_json::to_value(&stored)?));
            }
            let verb = if existed {
                "Updated".yellow()
            } else {
                "Created".green()
            };
            Ok(format!(
                "{} statechart for {} (checksum: {})",
                verb,
                record_type.cyan(),
                stored.checksum
            ))
        }

        Commands::GetStatechart { record_type } => {
            let stored = runtime
                .registry()
                .get(&record_type)
                .ok_or_else(|| format!("no statechart registered for {}", record_type))?;
            if json {
                return Ok(format_json(&serde_json::to_value(&stored)?));
            }
            Ok(format!(
                "{}\n{}",
                format!("Statechart {} ({})", record_type.cyan(), stored.checksum).bold(),
                stored.source.trim_end()
            ))
        }

        Commands::DeleteStatechart { record_type } => {
            runtime.registry().unlink(&record_type)?;
            Ok(format!("{} statechart for {}", "Deleted".green(), record_type.cyan()))
        }

        Commands::ListStatecharts => {
            let all = runtime.registry().list();
            if json {
                return Ok(format_json(&serde_json::to_value(&all)?));
            }
            if all.is_empty() {
                return Ok("No statecharts registered".yellow().to_string());
            }

            let mut output = String::new();
            for stored in all {
                let records = runtime.records().list(&stored.record_type).len();
                output.push_str(&format!(
                    "  {} {} ({} record(s))\n",
                    stored.record_type.cyan(),
                    stored.checksum.dimmed(),
                    records
                ));
            }
            Ok(output.trim_end().to_string())
        }

        Commands::CreateRecord {
            record_type,
            id,
            attrs,
        } => {
            let attributes = match attrs {
                Some(arg) => parse_object_arg(&arg)?,
                None => Map::new(),
            };
            let record = runtime
                .records()
                .create(&record_type, id.as_deref(), attributes)?;
            if json {
                return Ok(format_json(&serde_json::to_value(&record)?));
            }
            Ok(format!("{} record {}", "Created".green(), record.key().to_string().cyan()))
        }

        Commands::ShowRecord { record_type, id } => {
            let key = RecordKey::new(record_type, id);
            let record = runtime
                .records()
                .get(&key)
                .ok_or_else(|| format!("record not found: {}", key))?;
            if json {
                return Ok(format_json(&serde_json::to_value(&record)?));
            }

            let configuration = record
                .configuration
                .as_deref()
                .unwrap_or("(not started)");
            Ok(format!(
                "{}\n  {}: {}\n  {}\n{}",
                format!("Record {}", key.to_string().cyan()).bold(),
                "configuration".dimmed(),
                configuration.yellow(),
                "attributes:".dimmed(),
                format_json(&Value::Object(record.attributes))
            ))
        }

        Commands::Send {
            record_type,
            id,
            event,
            method,
            args,
            kwargs,
        } => {
            let key = RecordKey::new(record_type, id);
            let method = method.unwrap_or_else(|| event.clone());
            let mut envelope = EventEnvelope::new(event, method);
            if let Some(arg) = args {
                envelope = envelope.with_args(parse_array_arg(&arg)?);
            }
            if let Some(arg) = kwargs {
                envelope = envelope.with_kwargs(parse_object_arg(&arg)?);
            }

            let outcome = runtime.send(&key, envelope)?;
            if json {
                return Ok(format_json(&serde_json::to_value(&outcome)?));
            }
            Ok(format_outcome(&key, &outcome))
        }

        Commands::Check { record_type } => {
            let reports = runtime.check(record_type.as_deref())?;
            let broken = reports.iter().filter(|r| r.is_broken()).count();

            let output = if json {
                format_json(&serde_json::to_value(&reports)?)
            } else {
                format_reports(&reports)
            };
            if broken > 0 {
                println!("{}", output);
                return Err(format!("{} record(s) cannot be restored", broken).into());
            }
            Ok(output)
        }

        Commands::ResetRecord { record_type, id } => {
            let key = RecordKey::new(record_type, id);
            runtime.reset(&key)?;
            Ok(format!(
                "{} configuration of {}; the next event restarts it from the initial state",
                "Cleared".green(),
                key.to_string().cyan()
            ))
        }
    }
}

fn format_outcome(key: &RecordKey, outcome: &DispatchOutcome) -> String {
    let target = outcome.target.as_deref().unwrap_or("(internal)");
    let mut output = format!(
        "{} {} on {}: {} -> {}\n  {}: {}",
        "Handled".green(),
        outcome.event.cyan(),
        key,
        outcome.source,
        target,
        "configuration".dimmed(),
        outcome.configuration.to_string().yellow()
    );
    if let Some(value) = &outcome.return_value {
        output.push_str(&format!("\n  {}: {}", "returned".dimmed(), value));
    }
    output
}

fn format_reports(reports: &[CheckReport]) -> String {
    if reports.is_empty() {
        return "No records".yellow().to_string();
    }

    let mut output = String::new();
    for report in reports {
        let line = match &report.status {
            CheckStatus::Unset => format!("{} {}", "unset ".dimmed(), report.key),
            CheckStatus::Restorable { configuration } => {
                format!("{} {} {}", "ok    ".green(), report.key, configuration)
            }
            CheckStatus::NoDefinition => {
                format!("{} {} (no statechart)", "skip  ".yellow(), report.key)
            }
            CheckStatus::Broken { code, error } => {
                format!("{} {} [{}] {}", "BROKEN".red(), report.key, code, error)
            }
        };
        output.push_str(&line);
        output.push('\n');
    }
    output.trim_end().to_string()
}

/// Returns the argument text, or the content of the file for `@path`.
fn read_text_arg(arg: &str) -> Result<String, Box<dyn std::error::Error>> {
    match arg.strip_prefix('@') {
        Some(path) => Ok(std::fs::read_to_string(path)?),
        None => Ok(arg.to_string()),
    }
}

/// Parses a JSON argument (or @file.json).
fn parse_json_arg(arg: &str) -> Result<Value, Box<dyn std::error::Error>> {
    Ok(serde_json::from_str(&read_text_arg(arg)?)?)
}

fn parse_object_arg(arg: &str) -> Result<Map<String, Value>, Box<dyn std::error::Error>> {
    match parse_json_arg(arg)? {
        Value::Object(map) => Ok(map),
        other => Err(format!("expected a JSON object, got {}", other).into()),
    }
}

fn parse_array_arg(arg: &str) -> Result<Vec<Value>, Box<dyn std::error::Error>> {
    match parse_json_arg(arg)? {
        Value::Array(items) => Ok(items),
        other => Err(format!("expected a JSON array, got {}", other).into()),
    }
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
