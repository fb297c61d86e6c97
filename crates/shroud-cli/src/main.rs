use clap::{Parser, Subcommand};
use std::net::IpAddr;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::{check, explain, introspect, serve};

#[derive(Parser, Debug)]
#[command(name = "shroud", version, about = "Shroud: a Postgres proxy that masks sensitive columns")]
struct Cli {
    /// Log filter, e.g. "info" or "shroud_proxy=debug". RUST_LOG takes precedence.
    #[arg(long, global = true)]
    log_filter: Option<String>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the proxy.
    Serve {
        /// Proxy settings file.
        #[arg(long, short, default_value = "shroud.yaml", env = "SHROUD_CONFIG")]
        config: PathBuf,

        /// Override the configuration directory named in the settings file.
        #[arg(long)]
        config_dir: Option<PathBuf>,
    },

    /// Load and verify a configuration directory.
    Check {
        /// Configuration directory.
        dir: PathBuf,
    },

    /// Show the lineage and the rewritten SQL of one statement.
    Explain {
        /// Configuration directory.
        dir: PathBuf,

        #[arg(long)]
        namespace: String,

        /// Logical database selected by the session.
        #[arg(long)]
        database: Option<String>,

        #[arg(long)]
        user: String,

        /// Client address, for IP-scoped whitelist records.
        #[arg(long)]
        client_ip: Option<IpAddr>,

        /// Evaluate whitelists at this local time ("YYYY-MM-DD HH:MM:SS").
        #[arg(long)]
        at: Option<String>,

        /// Print JSON instead of text.
        #[arg(long, default_value_t = false)]
        json: bool,

        sql: String,
    },

    /// Write the column lists of a Postgres schema into tables.yaml.
    Introspect {
        #[arg(long, env = "DATABASE_URL")]
        database_url: String,

        /// Logical database the tables are registered under.
        #[arg(long)]
        database: String,

        /// Postgres schema to read. Defaults to the logical database name.
        #[arg(long)]
        schema: Option<String>,

        /// Catalog file to update.
        #[arg(long, short, default_value = "tables.yaml")]
        output: PathBuf,
    },
}

fn init_tracing(filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let log_filter = cli.log_filter;

    match cli.cmd {
        Command::Serve { config, config_dir } => {
            let settings = serve::load_settings(&config, config_dir)?;
            init_tracing(log_filter.as_deref().unwrap_or(&settings.log_filter));
            serve::serve(settings).await?;
        }
        Command::Check { dir } => {
            init_tracing(log_filter.as_deref().unwrap_or("warn"));
            check::run_check(&dir)?;
        }
        Command::Explain {
            dir,
            namespace,
            database,
            user,
            client_ip,
            at,
            json,
            sql,
        } => {
            init_tracing(log_filter.as_deref().unwrap_or("warn"));
            let request = explain::ExplainRequest {
                namespace,
                database,
                user,
                client_ip,
                at,
                sql,
            };
            explain::run_explain(&dir, &request, json)?;
        }
        Command::Introspect {
            database_url,
            database,
            schema,
            output,
        } => {
            init_tracing(log_filter.as_deref().unwrap_or("info"));
            let schema = schema.unwrap_or_else(|| database.clone());
            introspect::run_introspect(&database_url, &database, &schema, &output).await?;
        }
    }

    Ok(())
}
