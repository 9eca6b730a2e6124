use clap::{Parser, Subcommand, ValueEnum};
use nestdb::{FindOptions, Projection, SortSpec, Store};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process;

/// NestDB CLI: query and edit a NestDB data directory from the command line
#[derive(Parser)]
#[command(name = "nestdb", version, about)]
struct Cli {
    /// Path to the data directory
    #[arg(long, env = "NESTDB_DATA_DIR", default_value = ".")]
    data_dir: PathBuf,

    /// Output format
    #[arg(long, default_value = "yaml")]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, ValueEnum)]
enum OutputFormat {
    Yaml,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Find documents matching a filter
    Find {
        /// Collection name
        collection: String,
        /// Filter as JSON (e.g. '{"score": {"$gte": 15}}')
        #[arg(long, default_value = "{}")]
        filter: String,
        /// Sort as JSON (e.g. '{"score": -1}')
        #[arg(long)]
        sort: Option<String>,
        #[arg(long)]
        skip: Option<usize>,
        #[arg(long)]
        limit: Option<usize>,
        /// Projection as JSON (e.g. '{"name": 1}')
        #[arg(long)]
        projection: Option<String>,
    },

    /// Insert a document
    Insert {
        /// Collection name
        collection: String,
        /// Whole document as JSON
        #[arg(long)]
        json: Option<String>,
        /// Field values (e.g. --field name="Alice Chen" --field age=30)
        #[arg(long = "field", value_parser = parse_key_value)]
        fields: Vec<(String, String)>,
    },

    /// Update documents matching a filter
    Update {
        /// Collection name
        collection: String,
        /// Filter as JSON
        #[arg(long)]
        filter: String,
        /// Update description as JSON (e.g. '{"$inc": {"score": 5}}')
        #[arg(long)]
        update: String,
        /// Update every match instead of the first
        #[arg(long)]
        many: bool,
    },

    /// Delete documents matching a filter
    Delete {
        /// Collection name
        collection: String,
        /// Filter as JSON
        #[arg(long)]
        filter: String,
        /// Delete every match instead of the first
        #[arg(long)]
        many: bool,
    },

    /// Count documents matching a filter
    Count {
        collection: String,
        #[arg(long, default_value = "{}")]
        filter: String,
    },

    /// Distinct values of a field
    Distinct {
        collection: String,
        field: String,
        #[arg(long, default_value = "{}")]
        filter: String,
    },

    /// Run an aggregation pipeline
    Aggregate {
        collection: String,
        /// Pipeline as a JSON array of stages
        pipeline: String,
    },

    /// Show per-collection document counts, file sizes and indexes
    Stats,

    /// Copy every collection file into a backup directory
    Backup {
        /// Target directory (default: <data-dir>/_backups/<timestamp>)
        #[arg(long)]
        output: Option<PathBuf>,
    },
}

fn parse_key_value(s: &str) -> Result<(String, String), String> {
    let pos = s.find('=').ok_or_else(|| {
        format!("Invalid key=value pair: no '=' found in '{s}'")
    })?;
    Ok((s[..pos].to_string(), s[pos + 1..].to_string()))
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let cli = Cli::parse();

    if let Err(e) = run(cli) {
        eprintln!("ERROR:{e}");
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&cli.data_dir)?;
    log::debug!("Using data directory {}", cli.data_dir.display());

    let output = match cli.command {
        Command::Find {
            collection,
            filter,
            sort,
            skip,
            limit,
            projection,
        } => {
            let mut options = FindOptions::new();
            if let Some(sort) = sort {
                options = options.sort(SortSpec::parse(&parse_json("sort", &sort)?)?);
            }
            if let Some(skip) = skip {
                options = options.skip(skip);
            }
            if let Some(limit) = limit {
                options = options.limit(limit);
            }
            if let Some(projection) = projection {
                options = options.projection(Projection::parse(&parse_json("projection", &projection)?)?);
            }
            let docs = store
                .collection(&collection)?
                .find(&parse_json("filter", &filter)?, &options)?;
            serde_json::to_value(docs)?
        }

        Command::Insert {
            collection,
            json,
            fields,
        } => {
            let mut data = match json {
                Some(text) => parse_json("json", &text)?,
                None => Value::Object(serde_json::Map::new()),
            };
            if let (Value::Object(map), Value::Object(extra)) = (&mut data, fields_to_value(&fields)) {
                map.extend(extra);
            }
            let doc = store.collection(&collection)?.insert_one(data)?;
            Value::Object(doc)
        }

        Command::Update {
            collection,
            filter,
            update,
            many,
        } => {
            let coll = store.collection(&collection)?;
            let filter = parse_json("filter", &filter)?;
            let update = parse_json("update", &update)?;
            let result = if many {
                coll.update_many(&filter, &update)?
            } else {
                coll.update_one(&filter, &update)?
            };
            serde_json::to_value(result)?
        }

        Command::Delete {
            collection,
            filter,
            many,
        } => {
            let coll = store.collection(&collection)?;
            let filter = parse_json("filter", &filter)?;
            let deleted = if many {
                coll.delete_many(&filter)?
            } else {
                coll.delete_one(&filter)?
            };
            json!({ "ok": true, "deleted": deleted })
        }

        Command::Count { collection, filter } => {
            let count = store
                .collection(&collection)?
                .count_documents(&parse_json("filter", &filter)?)?;
            json!({ "count": count })
        }

        Command::Distinct {
            collection,
            field,
            filter,
        } => {
            let values = store
                .collection(&collection)?
                .distinct(&field, &parse_json("filter", &filter)?)?;
            Value::Array(values)
        }

        Command::Aggregate {
            collection,
            pipeline,
        } => {
            let docs = store
                .collection(&collection)?
                .aggregate(&parse_json("pipeline", &pipeline)?)?;
            serde_json::to_value(docs)?
        }

        Command::Stats => serde_json::to_value(store.stats()?)?,

        Command::Backup { output } => {
            let dir = store.backup(output.as_deref())?;
            json!({ "ok": true, "backup": dir.display().to_string() })
        }
    };

    store.shutdown()?;
    print_output(&output, &cli.format)?;
    Ok(())
}

fn parse_json(what: &str, text: &str) -> Result<Value, Box<dyn std::error::Error>> {
    serde_json::from_str(text).map_err(|e| format!("Invalid {what} JSON: {e}").into())
}

fn print_output(value: &Value, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(value)?),
        OutputFormat::Yaml => print!("{}", serde_yaml::to_string(value)?),
    }
    Ok(())
}

fn fields_to_value(fields: &[(String, String)]) -> Value {
    let mut map = serde_json::Map::new();
    for (key, val) in fields {
        // Numbers, booleans, arrays and objects parse as JSON; anything else is a string
        let json_val = serde_json::from_str(val).unwrap_or(Value::String(val.clone()));
        map.insert(key.clone(), json_val);
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("name=Alice=Chen").unwrap(),
            ("name".to_string(), "Alice=Chen".to_string())
        );
        assert!(parse_key_value("name").is_err());
    }

    #[test]
    fn test_fields_to_value() {
        let value = fields_to_value(&[
            ("name".into(), "Alice".into()),
            ("age".into(), "30".into()),
            ("tags".into(), "[\"a\"]".into()),
        ]);
        assert_eq!(value, json!({ "name": "Alice", "age": 30, "tags": ["a"] }));
    }

    #[test]
    fn test_cli_parses_find() {
        let cli = Cli::try_parse_from([
            "nestdb", "--data-dir", "/tmp/x", "--format", "json", "find", "users",
            "--filter", "{\"a\": 1}", "--limit", "2",
        ])
        .unwrap();
        assert!(matches!(cli.command, Command::Find { limit: Some(2), .. }));
        assert!(matches!(cli.format, OutputFormat::Json));
    }

    #[test]
    fn test_run_insert_then_count() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = tmp.path().to_str().unwrap();
        let insert = Cli::try_parse_from([
            "nestdb", "--data-dir", dir, "insert", "users", "--field", "name=A",
        ])
        .unwrap();
        run(insert).unwrap();

        let store = Store::open(tmp.path()).unwrap();
        assert_eq!(
            store.collection("users").unwrap().count_documents(&Value::Null).unwrap(),
            1
        );
    }
}
