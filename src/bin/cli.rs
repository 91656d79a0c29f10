use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use quiver_store::engine::{CipherProvider, Database};
use quiver_store::{DatabaseConfig, StringEncoding};

#[derive(Parser)]
#[command(author, version, about = "Inspect and edit a Quiver Store database file", long_about = None)]
struct Cli {
    /// Database file. Falls back to QUIVER_PATH.
    #[arg(short, long)]
    path: Option<PathBuf>,

    /// Whole-file encryption passphrase. Falls back to QUIVER_ENCRYPTION_KEY.
    #[arg(short, long)]
    key: Option<String>,

    #[arg(long)]
    ignore_case: bool,

    /// Key encoding inside the file: utf8 or utf16.
    #[arg(long)]
    encoding: Option<StringEncoding>,

    /// Fail instead of starting empty when the file cannot be decrypted.
    #[arg(long)]
    strict: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Clone)]
enum Commands {
    Get {
        key: String,
        /// Per-value decryption key.
        #[arg(long)]
        value_key: Option<String>,
        /// Print the value as hex instead of text.
        #[arg(long)]
        hex: bool,
    },
    Set {
        key: String,
        value: String,
        #[arg(long)]
        value_key: Option<String>,
        /// Treat VALUE as hex-encoded bytes.
        #[arg(long)]
        hex: bool,
    },
    Del { key: String },
    Keys,
    Count,
    Clear,
    HashPassword {
        password: String,
        #[arg(long, default_value_t = quiver_store::engine::cipher::DEFAULT_HASH_ITERATIONS)]
        iterations: u32,
    },
    VerifyPassword { password: String, hash: String },
}

impl Cli {
    fn config(&self) -> anyhow::Result<DatabaseConfig> {
        let mut config = DatabaseConfig::from_env();
        if let Some(path) = &self.path {
            config.path = Some(path.clone());
        }
        if let Some(key) = &self.key {
            config.encryption_key = Some(key.clone());
        }
        if let Some(encoding) = self.encoding {
            config.string_encoding = encoding;
        }
        config.ignore_case |= self.ignore_case;
        config.strict_decryption |= self.strict;
        if config.is_in_memory() {
            anyhow::bail!("no database file given (use --path or QUIVER_PATH)");
        }
        Ok(config)
    }
}

fn open(cli: &Cli) -> anyhow::Result<Database> {
    let config = cli.config()?;
    let path = config.path.clone();
    Database::create_or_load(config).with_context(|| format!("failed to open {:?}", path))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match &cli.command {
        Commands::Get { key, value_key, hex } => {
            let db = open(&cli)?;
            match db.try_get(key, value_key.as_deref()) {
                Some(value) if *hex => println!("{}", hex::encode(value)),
                Some(value) => match String::from_utf8(value) {
                    Ok(text) => println!("{}", text),
                    Err(e) => println!("{}", hex::encode(e.into_bytes())),
                },
                None => anyhow::bail!("key '{}' not found", key),
            }
        }
        Commands::Set { key, value, value_key, hex } => {
            let bytes = if *hex {
                hex::decode(value).context("VALUE is not valid hex")?
            } else {
                value.as_bytes().to_vec()
            };
            let db = open(&cli)?;
            db.upsert(key, &bytes, value_key.as_deref())?;
            db.serialize_async().await?;
            println!("OK");
        }
        Commands::Del { key } => {
            let db = open(&cli)?;
            if db.remove(key)? {
                db.serialize_async().await?;
                println!("OK");
            } else {
                println!("Not found");
            }
        }
        Commands::Keys => {
            let db = open(&cli)?;
            let mut keys = db.keys();
            keys.sort();
            println!("{}", serde_json::to_string_pretty(&keys)?);
        }
        Commands::Count => {
            let db = open(&cli)?;
            println!("{}", db.len());
        }
        Commands::Clear => {
            let db = open(&cli)?;
            db.clear()?;
            db.serialize_async().await?;
            println!("OK");
        }
        Commands::HashPassword { password, iterations } => {
            println!("{}", CipherProvider::generate_password_hash(password, *iterations)?);
        }
        Commands::VerifyPassword { password, hash } => {
            if CipherProvider::verify_password(password, hash) {
                println!("OK");
            } else {
                anyhow::bail!("password does not match");
            }
        }
    }

    Ok(())
}
