// NetCore peer daemon: one end of an emulator <-> controller link.

use log::{debug, info};
use netcore_core::{Inbound, Role, Value};
use netcore_peer::{config, Connector};

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut role_override = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("netcore-peer {}", VERSION);
                return Ok(());
            }
            "--role" => {
                let role = args
                    .next()
                    .ok_or_else(|| anyhow::anyhow!("--role needs server|client"))?;
                role_override = Some(role.parse::<Role>()?);
            }
            other => anyhow::bail!("unknown argument {other:?}"),
        }
    }

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut cfg = config::load();
    if let Some(role) = role_override {
        cfg.role = role;
    }
    let spec = cfg.to_link_spec()?;
    let connector = Connector::with_handler(spec, handle)?;

    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()?;
    rt.block_on(shutdown_signal())?;
    info!("shutting down");
    connector.kill();
    Ok(())
}

/// Log traffic; answer PING with PONG and ECHO with the request value.
fn handle(msg: &mut Inbound) {
    match msg {
        Inbound::Notification(n) => info!("notification {:?}", n.type_tag),
        Inbound::Payload { type_tag, value } => info!(
            "payload {:?} ({} bytes)",
            type_tag,
            value.as_ref().map_or(0, |v| v.as_bytes().len())
        ),
        Inbound::SyncedRequest(req) => {
            debug!("synced request {:?} ({})", req.type_tag(), req.correlation_id());
            let reply = match req.type_tag() {
                "PING" => Value::encode("PONG").ok(),
                "ECHO" => req.value().cloned(),
                _ => None,
            };
            if let Some(v) = reply {
                let _ = req.set_return_value(v);
            }
        }
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
