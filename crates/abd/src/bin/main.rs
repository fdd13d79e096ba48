use abd::{Config, Register, RegisterOptions, TcpTransport};
use bytes::Bytes;
use clap::Parser;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run one ABD register replica over TCP", long_about = None)]
struct Args {
    /// Path to the node configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,
}

/// One line typed on the console
#[derive(Debug, PartialEq, Eq)]
enum ConsoleCommand {
    Read,
    Write(String),
    Status,
    Quit,
    Empty,
    Unknown(String),
}

fn parse_command(line: &str) -> ConsoleCommand {
    let line = line.trim();
    let (cmd, rest) = match line.split_once(char::is_whitespace) {
        Some((cmd, rest)) => (cmd, rest.trim()),
        None => (line, ""),
    };

    match cmd.to_lowercase().as_str() {
        "" => ConsoleCommand::Empty,
        "read" | "get" => ConsoleCommand::Read,
        "write" | "set" if !rest.is_empty() => ConsoleCommand::Write(rest.to_string()),
        "status" => ConsoleCommand::Status,
        "quit" | "exit" => ConsoleCommand::Quit,
        _ => ConsoleCommand::Unknown(line.to_string()),
    }
}

fn render(value: &Option<Bytes>) -> String {
    match value {
        Some(bytes) => String::from_utf8_lossy(bytes).to_string(),
        None => "(nil)".to_string(),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();
    let config = Config::from_file(&args.config)?;
    info!("Starting ABD replica");
    info!("Process ID: {}", config.node.process_id());

    let transport = Arc::new(TcpTransport::from_config(&config));
    let register = Register::init(
        &config.register.name,
        transport,
        RegisterOptions::from(&config),
    )
    .await?;
    info!(
        "Register '{}' ready (writable={})",
        register.name(),
        register.is_writable()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        match parse_command(&line) {
            ConsoleCommand::Empty => {}
            ConsoleCommand::Read => match register.read_labeled().await {
                Ok((value, label)) => println!("{} (label {})", render(&value), label),
                Err(e) => println!("ERR {}", e),
            },
            ConsoleCommand::Write(value) => match register.write(Bytes::from(value)).await {
                Ok(label) => println!("OK (label {})", label),
                Err(e) => println!("ERR {}", e),
            },
            ConsoleCommand::Status => {
                let (value, label) = register.snapshot().await;
                println!(
                    "{} local={} (label {}) {}",
                    register.id(),
                    render(&value),
                    label,
                    register.view()
                );
            }
            ConsoleCommand::Quit => break,
            ConsoleCommand::Unknown(line) => {
                println!("ERR unknown command '{}' (read | write <value> | status | quit)", line)
            }
        }
    }

    if let Err(e) = register.close().await {
        error!("Failed to close register: {}", e);
    }
    info!("Replica stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_command() {
        assert_eq!(parse_command("read"), ConsoleCommand::Read);
        assert_eq!(parse_command("  GET "), ConsoleCommand::Read);
        assert_eq!(
            parse_command("write hello world"),
            ConsoleCommand::Write("hello world".to_string())
        );
        assert_eq!(parse_command("status"), ConsoleCommand::Status);
        assert_eq!(parse_command("exit"), ConsoleCommand::Quit);
        assert_eq!(parse_command(""), ConsoleCommand::Empty);
        assert_eq!(
            parse_command("write"),
            ConsoleCommand::Unknown("write".to_string())
        );
        assert_eq!(
            parse_command("frobnicate"),
            ConsoleCommand::Unknown("frobnicate".to_string())
        );
    }

    #[test]
    fn test_render() {
        assert_eq!(render(&None), "(nil)");
        assert_eq!(render(&Some(Bytes::from("v"))), "v");
    }
}
