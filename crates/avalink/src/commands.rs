//! One-shot CLI commands: send, discover, listen, config.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use avaconf::{BridgeConfig, ConfigSources};
use avaproto::{Message, OscValue};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::discovery::DiscoveryClient;
use crate::events::EventBus;
use crate::transport::{OscTransport, Outbound, TransportOptions};

/// Parse a CLI argument: `true`/`false`, then integer, then float, else string.
pub fn parse_arg(raw: &str) -> OscValue {
    match raw {
        "true" => return OscValue::Bool(true),
        "false" => return OscValue::Bool(false),
        _ => {}
    }
    if let Ok(i) = raw.parse::<i32>() {
        return OscValue::Int(i);
    }
    if let Ok(f) = raw.parse::<f32>() {
        if f.is_finite() {
            return OscValue::Float(f);
        }
    }
    OscValue::Str(raw.to_string())
}

pub async fn send(config: &BridgeConfig, address: &str, args: &[String]) -> Result<()> {
    avaproto::validate_address(address).context("Invalid address")?;

    let mut opts = TransportOptions::from_config(config);
    opts.receive_port = 0;
    let transport = OscTransport::open(&opts)
        .await
        .context("Failed to open UDP socket")?;

    let message = Message::new(address, args.iter().map(|a| parse_arg(a)).collect());
    if !transport.send_message(&message).await {
        bail!("Send to {} failed", transport.target());
    }
    println!("→ {} {:?} ({})", message.address, message.args, transport.target());
    transport.close();
    Ok(())
}

pub async fn discover(config: &BridgeConfig, pattern: Option<&str>, tree: bool) -> Result<()> {
    let client = DiscoveryClient::new(&config.discovery, EventBus::new(), CancellationToken::new())
        .context("Failed to build discovery client")?;
    let count = client
        .discover()
        .await
        .with_context(|| format!("Discovery against {} failed", client.base_url()))?;

    if tree {
        println!("{}", serde_json::to_string_pretty(&client.get_parameter_tree().await)?);
        return Ok(());
    }

    let params = match pattern {
        Some(pattern) => client.get_parameters_by_pattern(pattern).await?,
        None => client.get_all_parameters().await,
    };
    for p in &params {
        let ty = p
            .value_type
            .map(|t| format!("{:?}", t).to_lowercase())
            .unwrap_or_else(|| "?".into());
        match &p.value {
            Some(v) => println!("{:<48} {:<6} {:?}", p.address, ty, v),
            None => println!("{:<48} {:<6}", p.address, ty),
        }
    }
    println!("{} of {} parameters", params.len(), count);
    Ok(())
}

/// Print inbound messages until ctrl-c, or until `limit` messages arrive.
pub async fn listen(config: &BridgeConfig, limit: Option<usize>) -> Result<()> {
    let opts = TransportOptions::from_config(config);
    let transport = OscTransport::open(&opts)
        .await
        .context("Failed to open UDP socket")?;
    println!("Listening on UDP {}", transport.local_port());

    let cancel = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel(256);
    let receiver = transport.spawn_receiver(tx, cancel.clone());

    let mut seen = 0usize;
    loop {
        let packet = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };
        for msg in packet.messages {
            println!("← {} {:?} ({})", msg.address, msg.args, packet.origin);
            seen += 1;
        }
        if limit.is_some_and(|limit| seen >= limit) {
            break;
        }
    }

    cancel.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), receiver).await;
    transport.close();
    let stats = transport.stats();
    println!(
        "{} received, {} dropped, {} errors",
        stats.received, stats.dropped, stats.errors
    );
    Ok(())
}

pub fn config_show(config: &BridgeConfig) -> Result<()> {
    print!("{}", config.to_toml()?);
    Ok(())
}

pub fn config_paths(sources: &ConfigSources) {
    if sources.files.is_empty() {
        println!("No config files found; using defaults");
    }
    for file in &sources.files {
        println!("file: {}", file.display());
    }
    for var in &sources.env_overrides {
        println!("env:  {}", var);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_arguments_pick_the_narrowest_type() {
        assert_eq!(parse_arg("true"), OscValue::Bool(true));
        assert_eq!(parse_arg("42"), OscValue::Int(42));
        assert_eq!(parse_arg("0.5"), OscValue::Float(0.5));
        assert_eq!(parse_arg("hello"), OscValue::Str("hello".into()));
        assert_eq!(parse_arg("NaN"), OscValue::Str("NaN".into()));
    }
}
