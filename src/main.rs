use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use surveystore::{Fields, RecordStore, StoreConfig, StoreError};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

/// Inspect and edit the survey record sheet.
#[derive(Parser, Debug)]
#[command(name = "surveystore", version)]
struct Args {
    /// YAML store config
    #[arg(long, short, env = "SURVEYSTORE_CONFIG", default_value = "surveystore.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print every record
    List,
    /// Print one record
    Get { id: String },
    /// Append a record; `--field id=...` is required
    Append {
        #[arg(long = "field", short, value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Change fields of an existing record
    Update {
        id: String,
        #[arg(long = "field", short, value_parser = parse_field)]
        fields: Vec<(String, String)>,
    },
    /// Remove a record
    Delete { id: String },
    /// Clear all records, keeping the header
    Reset {
        #[arg(long)]
        yes: bool,
    },
    /// Digest of the latest records
    Fingerprint,
    /// Check (and repair) the header row
    EnsureSchema,
}

fn parse_field(s: &str) -> Result<(String, String), String> {
    let (k, v) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", s))?;
    if k.trim().is_empty() {
        return Err(format!("empty field name in {:?}", s));
    }
    Ok((k.trim().to_string(), v.to_string()))
}

fn to_fields(pairs: Vec<(String, String)>) -> Fields {
    pairs.into_iter().collect()
}

fn run(store: &RecordStore, command: Command) -> Result<serde_json::Value, StoreError> {
    Ok(match command {
        Command::List => serde_json::to_value(store.load_all()?)?,
        Command::Get { id } => match store.find_by_id(&id)? {
            Some(r) => serde_json::to_value(r)?,
            None => json!(null),
        },
        Command::Append { fields } => {
            store.append(&to_fields(fields))?;
            json!({ "ok": true })
        }
        Command::Update { id, fields } => {
            json!({ "ok": store.update_by_id(&id, &to_fields(fields))? })
        }
        Command::Delete { id } => json!({ "ok": store.delete_by_id(&id)? }),
        Command::Reset { .. } => {
            store.reset()?;
            json!({ "ok": true })
        }
        Command::Fingerprint => json!({ "fingerprint": store.fingerprint()? }),
        Command::EnsureSchema => json!({ "status": format!("{:?}", store.ensure_schema()?) }),
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    // ─── 1) init logging ─────────────────────────────────────────────
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt::Subscriber::builder()
        .with_env_filter(env)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();

    // ─── 2) load config ──────────────────────────────────────────────
    let args = Args::parse();
    if let Command::Reset { yes: false } = args.command {
        bail!("reset deletes every record; pass --yes to confirm");
    }
    let cfg = StoreConfig::load(&args.config)?;
    info!(
        spreadsheet = %cfg.spreadsheet_id,
        worksheet = %cfg.worksheet,
        columns = cfg.schema.len(),
        "config loaded"
    );

    // ─── 3) run the command on the blocking pool ─────────────────────
    let command = args.command;
    let outcome = tokio::task::spawn_blocking(move || -> Result<serde_json::Value, StoreError> {
        let store = RecordStore::open(&cfg)?;
        run(&store, command)
    })
    .await
    .context("store task panicked")?;

    match outcome {
        Ok(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
            Ok(())
        }
        Err(e) => {
            error!("{}", e);
            eprintln!("{}", e.user_message());
            Err(anyhow!(e))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_flags_split_on_first_equals() {
        assert_eq!(
            parse_field("reasons=A|B=C").unwrap(),
            ("reasons".to_string(), "A|B=C".to_string())
        );
        assert_eq!(
            parse_field("comment=").unwrap(),
            ("comment".to_string(), String::new())
        );
        assert!(parse_field("nokey").is_err());
        assert!(parse_field("=x").is_err());
    }

    #[test]
    fn cli_parses_update() {
        let args = Args::try_parse_from([
            "surveystore",
            "--config",
            "c.yaml",
            "update",
            "abc",
            "--field",
            "event_name=Conf",
            "-f",
            "reasons=A|B",
        ])
        .unwrap();
        match args.command {
            Command::Update { id, fields } => {
                assert_eq!(id, "abc");
                assert_eq!(fields.len(), 2);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
