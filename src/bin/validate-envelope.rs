use anyhow::{Context, Result};
use clap::Parser;
use jsonschema::JSONSchema;
use serde_json::Value;
use std::{fs, path::PathBuf};

use ingestion_gateway::validator;

/// Validate an envelope JSON file the way the ingest endpoint does, and
/// optionally against the Envelope v1 JSON Schema.
#[derive(Parser, Debug)]
#[command(name = "validate-envelope", version, about = "Validate an event envelope JSON file")]
struct Cli {
    /// Path to the envelope JSON file to validate
    path: PathBuf,

    /// Also check against a JSON Schema (schemas/envelope.v1.json if no path is given)
    #[arg(long, num_args = 0..=1, default_missing_value = "schemas/envelope.v1.json")]
    schema: Option<PathBuf>,
}

fn load_json(path: &PathBuf) -> Result<Value> {
    let data = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let json: Value = serde_json::from_str(&data)
        .with_context(|| format!("Failed to parse JSON in {}", path.display()))?;
    Ok(json)
}

fn main() -> Result<()> {
    let args = Cli::parse();
    let raw = fs::read(&args.path).with_context(|| format!("Failed to read {}", args.path.display()))?;

    let mut problems = Vec::new();
    match validator::validate(&raw) {
        Ok(env) => println!(
            "envelope ok: eventId={} workspace={} idempotencyKey={}",
            env.event_id,
            env.workspace_slug,
            env.idempotency_key()
        ),
        Err(e) => problems.push(e.to_string()),
    }

    if let Some(schema_path) = args.schema {
        let schema_json = load_json(&schema_path)?;
        let instance = load_json(&args.path)?;

        // jsonschema 0.17 expects a schema with 'static lifetime; leak the parsed schema for CLI lifetime
        let schema_static: &'static Value = Box::leak(Box::new(schema_json));
        let compiled = JSONSchema::options()
            .compile(schema_static)
            .context("Failed to compile JSON Schema")?;

        let result = compiled.validate(&instance);
        if let Err(errors) = result {
            for error in errors {
                problems.push(format!("{} at {}", error, error.instance_path));
            }
        }
    }

    if problems.is_empty() {
        println!("valid");
        return Ok(());
    }
    eprintln!("invalid:");
    for p in &problems {
        eprintln!("- {p}");
    }
    std::process::exit(1)
}
