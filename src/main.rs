use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use futures::StreamExt;
use health_bot::{AppConfig, ChatBackend, ChatSession, DocumentStore};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "health-bot", version, about = "Health assistant grounded in your PDF documents")]
struct Cli {
    /// Configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "health-bot.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive chat with streamed replies
    Chat {
        /// PDF documents to load before chatting
        #[arg(long = "pdf")]
        pdfs: Vec<PathBuf>,
    },
    /// Ask a single question and print the reply
    Ask {
        #[arg(long = "pdf")]
        pdfs: Vec<PathBuf>,

        question: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        AppConfig::default()
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut store = config.document_store();
    let mut session = config.chat_session().context("failed to set up chat backend")?;

    match cli.command {
        Command::Chat { pdfs } => {
            load_documents(&mut store, &pdfs);
            chat_loop(&mut store, &mut session).await
        }
        Command::Ask { pdfs, question } => {
            load_documents(&mut store, &pdfs);
            let reply = session.chat(&store, &question).await?;
            println!("{}", reply);
            Ok(())
        }
    }
}

/// Load each file independently; a bad upload is reported and skipped.
fn load_documents(store: &mut DocumentStore, paths: &[PathBuf]) {
    for path in paths {
        match load_document(store, path) {
            Ok(id) => info!(document = %id, "loaded {}", path.display()),
            Err(e) => warn!("skipping {}: {:#}", path.display(), e),
        }
    }
}

fn load_document(store: &mut DocumentStore, path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("cannot read {}", path.display()))?;
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("unknown.pdf");
    Ok(store.add(name, &bytes)?)
}

async fn chat_loop<B: ChatBackend>(
    store: &mut DocumentStore,
    session: &mut ChatSession<B>,
) -> Result<()> {
    println!("Ask a health question. Commands: :docs, :load <file>, :remove <id>, :clear, :reset, :quit");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next_line().await? else {
            break;
        };
        let line = line.trim();

        match line.split_once(' ').unwrap_or((line, "")) {
            ("", _) => continue,
            (":quit", _) | (":q", _) => break,
            (":docs", _) => {
                let docs = store.list();
                if docs.is_empty() {
                    println!("No documents uploaded");
                }
                for doc in docs {
                    println!(
                        "{}  {}  chunks: {}  uploaded: {}",
                        doc.id,
                        doc.name,
                        doc.chunk_count,
                        doc.upload_time.format("%H:%M:%S")
                    );
                }
            }
            (":load", path) => load_documents(store, &[PathBuf::from(path.trim())]),
            (":remove", id) => {
                if !store.remove(id.trim()) {
                    println!("No document with id {}", id.trim());
                }
            }
            (":clear", _) => {
                store.clear();
                println!("All documents cleared");
            }
            (":reset", _) => {
                session.clear_history();
                println!("Conversation cleared");
            }
            _ => {
                let mut reply = match session.stream_chat(store, line).await {
                    Ok(reply) => reply,
                    Err(e) => {
                        eprintln!("error: {}", e);
                        continue;
                    }
                };
                while let Some(fragment) = reply.next().await {
                    match fragment {
                        Ok(text) => {
                            print!("{}", text);
                            std::io::stdout().flush()?;
                        }
                        Err(e) => {
                            eprintln!("\nerror: {}", e);
                            break;
                        }
                    }
                }
                println!();
            }
        }
    }
    Ok(())
}
