//! lattice-ctl — operator CLI for the hub's HTTP surface.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "lattice-ctl", version, about = "control the lattice hub")]
struct Args {
    /// Hub base address.
    #[arg(long, default_value = "http://127.0.0.1:1234")]
    addr: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Push a full replacement config document.
    ConfigPush {
        /// JSON file mapping store names to store records.
        file: PathBuf,
    },
    /// Upload a new lib bundle zip.
    LibPush { file: PathBuf },
    /// Download the current lib bundle zip.
    LibPull {
        /// Output path.
        #[arg(default_value = "lib.zip")]
        out: PathBuf,
    },
    /// Upload a new assets bundle zip.
    AssetsPush { file: PathBuf },
    /// Print the hub's JWT public key.
    PublicKey,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let http = reqwest::Client::new();

    match args.command {
        Command::ConfigPush { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            let document: serde_json::Value = serde_json::from_str(&text)
                .with_context(|| format!("{} is not valid JSON", file.display()))?;
            if !document.is_object() {
                bail!("config document must be an object of store records");
            }

            let response = http
                .post(format!("{}/config", args.addr))
                .json(&document)
                .send()
                .await
                .context("failed to connect to latticed — is it running?")?;
            check(&response)?;
            let stores = document.as_object().map(|o| o.len()).unwrap_or(0);
            println!("pushed {stores} store records");
        }

        Command::LibPush { file } => {
            push_bundle(&http, &args.addr, "/lib/", &file).await?;
            println!("lib bundle replaced");
        }

        Command::LibPull { out } => {
            let response = http
                .get(format!("{}/lib/", args.addr))
                .send()
                .await
                .context("failed to connect to latticed — is it running?")?;
            check(&response)?;
            let raw = response.bytes().await?;
            std::fs::write(&out, &raw)
                .with_context(|| format!("failed to write {}", out.display()))?;
            println!("wrote {} bytes to {}", raw.len(), out.display());
        }

        Command::AssetsPush { file } => {
            push_bundle(&http, &args.addr, "/assets/", &file).await?;
            println!("assets bundle replaced");
        }

        Command::PublicKey => {
            let response = http
                .get(format!("{}/public-key", args.addr))
                .send()
                .await
                .context("failed to connect to latticed — is it running?")?;
            check(&response)?;
            let raw = response.bytes().await?;
            if raw.is_empty() {
                bail!("hub has no public key loaded");
            }
            match std::str::from_utf8(&raw) {
                Ok(text) => println!("{text}"),
                Err(_) => println!("{}", hex_string(&raw)),
            }
        }
    }

    Ok(())
}

async fn push_bundle(
    http: &reqwest::Client,
    addr: &str,
    path: &str,
    file: &PathBuf,
) -> Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let response = http
        .post(format!("{addr}{path}"))
        .body(raw)
        .send()
        .await
        .context("failed to connect to latticed — is it running?")?;
    check(&response)
}

fn check(response: &reqwest::Response) -> Result<()> {
    if !response.status().is_success() {
        bail!("hub answered {}", response.status());
    }
    Ok(())
}

fn hex_string(raw: &[u8]) -> String {
    raw.iter().map(|b| format!("{b:02x}")).collect()
}
