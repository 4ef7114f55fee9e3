use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::mpsc;

use oplogtail_engine::{OplogPayload, OplogTail, Signal, TailEvent};
use oplogtail_store::MongoConnector;

mod config;

use config::{FileConfig, Settings};

/// oplogtail - Follow a MongoDB oplog as a stream of JSON lines
#[derive(Parser, Debug)]
#[command(name = "oplogtail")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Database hosts (default: localhost)
    #[arg(value_name = "HOST")]
    pub hosts: Vec<String>,

    /// Namespace filter (`db.coll`, `*.coll`, `db.*`)
    #[arg(long)]
    pub namespace: Option<String>,

    /// Print presentation-formatted entries
    #[arg(long)]
    pub pretty: bool,

    /// Replica set name
    #[arg(long, value_name = "NAME")]
    pub repl_set: Option<String>,

    /// Start after a date (`2024-01-31`, RFC 3339), epoch seconds, or `last`
    #[arg(long)]
    pub since: Option<String>,

    /// Oplog collection name
    #[arg(long)]
    pub collection: Option<String>,

    /// Raw query document (JSON), used instead of the namespace filter
    #[arg(long, value_name = "JSON")]
    pub filter: Option<String>,

    /// Connect using TLS
    #[arg(long)]
    pub ssl: bool,

    /// Certificate authority file
    #[arg(long, value_name = "FILE")]
    pub ssl_ca_file: Option<PathBuf>,

    /// Client certificate file
    #[arg(long, value_name = "FILE")]
    pub ssl_cert_file: Option<PathBuf>,

    /// Client PEM key file
    #[arg(long, value_name = "FILE")]
    pub ssl_pem_key_file: Option<PathBuf>,

    /// Password for the PEM key file
    #[arg(long, value_name = "PASSWORD")]
    pub ssl_pem_key_password: Option<String>,

    /// Config file (default: ~/.oplogtail/config.toml)
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

/// What the listeners hand to the printer
enum Output {
    Entry(Arc<OplogPayload>),
    Error(String),
    End,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let result = run(args).await;

    if let Err(e) = &result {
        eprintln!("Error: {:#}", e);
    }

    result
}

async fn run(args: Args) -> Result<()> {
    let file = FileConfig::load(args.config.as_deref())?;
    let settings = Settings::resolve(args, file)?;
    tracing::debug!(uri = %settings.uri, connect = ?settings.connect, "resolved settings");

    let connector = Arc::new(MongoConnector::new(&settings.uri, settings.connect));
    let tail = OplogTail::new(connector, settings.tail).context("invalid tail options")?;

    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Output>();
    forward(&tail, Signal::Op, &out_tx, |event| match event {
        TailEvent::Op(payload) => Some(Output::Entry(Arc::clone(payload))),
        _ => None,
    });
    forward(&tail, Signal::Error, &out_tx, |event| {
        event.error().map(|e| Output::Error(e.to_string()))
    });
    forward(&tail, Signal::End, &out_tx, |_| Some(Output::End));
    drop(out_tx);

    if tail.start().await.is_none() {
        // The failure itself was queued by the error listener
        print_pending(&mut out_rx);
        tail.destroy().await;
        anyhow::bail!("could not start tailing {}", settings.uri);
    }

    let stdout = std::io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            output = out_rx.recv() => match output {
                Some(Output::Entry(payload)) => print_entry(&mut stdout.lock(), &payload)?,
                Some(Output::Error(message)) => {
                    eprintln!("oplog error: {}", message);
                    break;
                }
                Some(Output::End) | None => break,
            },
        }
    }

    tail.destroy().await;
    Ok(())
}

fn forward<F>(tail: &OplogTail, signal: Signal, tx: &mpsc::UnboundedSender<Output>, map: F)
where
    F: Fn(&TailEvent) -> Option<Output> + Send + Sync + 'static,
{
    let tx = tx.clone();
    tail.on(signal, move |event| {
        if let Some(output) = map(event) {
            let _ = tx.send(output);
        }
    });
}

fn print_entry(out: &mut impl Write, payload: &OplogPayload) -> Result<()> {
    serde_json::to_writer(&mut *out, payload)?;
    writeln!(out)?;
    out.flush()?;
    Ok(())
}

fn print_pending(rx: &mut mpsc::UnboundedReceiver<Output>) {
    while let Ok(output) = rx.try_recv() {
        if let Output::Error(message) = output {
            eprintln!("oplog error: {}", message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oplogtail_engine::{LogEntry, LogPosition};
    use serde_json::json;

    #[test]
    fn test_entry_is_one_json_line() {
        let entry = LogEntry::new(LogPosition::new(1_700_000_000, 1), "i", "optest.a")
            .with_document(json!({"_id": 1, "n": "JB"}));
        let mut out = Vec::new();
        print_entry(&mut out, &OplogPayload::new(entry, false)).unwrap();

        let text = String::from_utf8(out).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(text.lines().count(), 1);
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["ns"], "optest.a");
        assert_eq!(value["o"]["n"], "JB");
    }
}
