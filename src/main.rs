use dq_engine::api::DqService;
use dq_engine::llm::{LanguageModel, LlmClient};
use dq_engine::rule_store::RuleStore;
use dq_engine::store::SqliteStore;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "dq-engine")]
#[command(about = "Data quality rule assistant over a SQL database")]
#[command(version)]
struct Args {
    /// Path to the source SQLite database (or set DQ_SOURCE_DB)
    #[arg(long)]
    source_db: Option<PathBuf>,

    /// Path to the rule storage database (or set DQ_RULES_DB, default: rules.db)
    #[arg(long)]
    rules_db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List tables in the source database
    Tables,

    /// Show the schema of a table
    Schema {
        table: String,
    },

    /// Show the most frequent values of a column
    Sample {
        table: String,
        column: String,

        /// Number of distinct values to show
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Ask the model to suggest a new rule for a column
    Suggest {
        table: String,
        column: String,
    },

    /// Compile a natural language rule into SQL and report match statistics
    Compile {
        table: String,
        column: String,

        /// The rule in natural language
        rule: String,

        /// Store the rule after a successful compilation
        #[arg(long)]
        save: bool,

        /// Category recorded with a saved rule
        #[arg(long, default_value = "general")]
        category: String,
    },

    /// Validate a compiled rule query against the data
    Validate {
        table: String,
        column: String,
        query: String,
    },

    /// List stored rules for a table
    Rules {
        table: String,
    },

    /// Store a rule together with an already-compiled query
    AddRule {
        table: String,
        column: String,
        rule: String,
        query: String,

        #[arg(long, default_value = "general")]
        category: String,
    },

    /// Delete a stored rule by id
    DeleteRule {
        rule_id: String,
    },

    /// Chat about a column; pass --thread to continue a conversation
    Chat {
        table: String,
        column: String,
        message: String,

        #[arg(long)]
        thread: Option<String>,
    },
}

fn needs_model(command: &Commands) -> bool {
    matches!(
        command,
        Commands::Suggest { .. } | Commands::Compile { .. } | Commands::Chat { .. }
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let source_db = args
        .source_db
        .or_else(|| std::env::var("DQ_SOURCE_DB").ok().map(PathBuf::from))
        .context("source database not set; pass --source-db or set DQ_SOURCE_DB")?;
    let rules_db = args
        .rules_db
        .or_else(|| std::env::var("DQ_RULES_DB").ok().map(PathBuf::from))
        .unwrap_or_else(|| PathBuf::from("rules.db"));

    let store = Arc::new(SqliteStore::open(&source_db)?);
    let rules = RuleStore::open(&rules_db)?;

    let llm: Arc<dyn LanguageModel> = if needs_model(&args.command) {
        Arc::new(LlmClient::from_env().map_err(|e| anyhow!("{}", e))?)
    } else {
        // Placeholder; commands that reach the model are matched above.
        Arc::new(LlmClient::new(
            "unset".to_string(),
            "gpt-4o".to_string(),
            "https://api.openai.com/v1".to_string(),
        ))
    };

    let service = DqService::new(store, rules, llm);

    match args.command {
        Commands::Tables => {
            for table in service.list_tables().await? {
                println!("{}", table);
            }
        }

        Commands::Schema { table } => {
            println!("{}", service.table_schema(&table).await?);
        }

        Commands::Sample {
            table,
            column,
            limit,
        } => {
            let sample = service.sample_values(&table, &column, limit).await?;
            println!("{}", sample.render());
        }

        Commands::Suggest { table, column } => {
            match service.suggest_rule(&table, &column, &[]).await? {
                Some(rule) => println!("Suggested rule: {}", rule),
                None => println!("No new rule to suggest."),
            }
        }

        Commands::Compile {
            table,
            column,
            rule,
            save,
            category,
        } => {
            let conversion = service.convert_rule(&rule, &table, &column).await?;
            if let Some(question) = conversion.question {
                println!("Clarification needed: {}", question);
                println!("(re-run with a more specific rule)");
                return Ok(());
            }

            let query = conversion
                .sql_query
                .ok_or_else(|| anyhow!("compiler returned no query"))?;
            println!("Query: {}", query);

            if let Some(report) = &conversion.report {
                print_report(report);
            }

            if save {
                let record = service
                    .add_rule(&rule, &table, &column, &category, &query)
                    .await?;
                println!("Saved rule {}", record.rule_id);
            }
        }

        Commands::Validate {
            table,
            column,
            query,
        } => {
            let report = service.validate_query(&query, &table, &column).await?;
            print_report(&report);
        }

        Commands::Rules { table } => {
            let rules = service.rules_of_table(&table).await?;
            if rules.is_empty() {
                println!("No rules stored for {}.", table);
            }
            for record in rules {
                println!(
                    "{}  [{}] {}.{}: {}",
                    record.rule_id,
                    record.rule_category,
                    record.table_name,
                    record.column_name,
                    record.rule
                );
            }
        }

        Commands::AddRule {
            table,
            column,
            rule,
            query,
            category,
        } => {
            let record = service
                .add_rule(&rule, &table, &column, &category, &query)
                .await?;
            println!("Saved rule {}", record.rule_id);
        }

        Commands::DeleteRule { rule_id } => {
            if service.delete_rule(&rule_id).await? {
                println!("Deleted rule {}", rule_id);
            } else {
                println!("No rule with id {}", rule_id);
            }
        }

        Commands::Chat {
            table,
            column,
            message,
            thread,
        } => {
            let reply = service
                .chat(&message, &table, &column, thread.as_deref())
                .await?;
            println!("{}", reply.answer);
            println!("\n(thread: {})", reply.thread_id);
        }
    }

    Ok(())
}

fn print_report(report: &dq_engine::validator::ValidationReport) {
    println!("Total rows: {}", report.total_rows);
    println!("Rows satisfying the rule: {}", report.total_good_rows);
    match report.percentage_bad_rows {
        Some(pct) => println!("Percentage violating: {:.2}%", pct),
        None => println!("Percentage violating: n/a (no countable values)"),
    }
}
