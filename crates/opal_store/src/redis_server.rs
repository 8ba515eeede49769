//! Redis-protocol frontend.
//!
//! Serves the small data surface (PING/SET/GET/DEL) plus the `CLUSTERX`
//! control commands that drive slot migration. Writes are routed by slot:
//! unowned slots and the forbidden (mid-cutover) slot answer with a MOVED
//! redirect instead of touching storage.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use redis_protocol::codec::Resp2;
use redis_protocol::resp2::types::{BytesFrame, Resp2Frame};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;

use crate::cluster::{format_moved, ClusterRouter};
use crate::engine::SlotEngine;
use crate::slot::{key_slot, SlotId, MAX_SLOT};
use crate::slot_migrate::{SlotMigrator, SyncMigrateContext};

pub struct NodeContext {
    pub engine: Arc<SlotEngine>,
    pub cluster: Arc<ClusterRouter>,
    pub migrator: Arc<SlotMigrator>,
}

pub async fn run(addr: SocketAddr, ctx: Arc<NodeContext>) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(%addr, "redis frontend listening");
    loop {
        let (socket, _) = listener.accept().await?;
        let ctx = Arc::clone(&ctx);
        tokio::spawn(async move {
            if let Err(err) = handle_conn(socket, ctx).await {
                tracing::debug!(error = ?err, "redis connection closed");
            }
        });
    }
}

async fn handle_conn(socket: TcpStream, ctx: Arc<NodeContext>) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, Resp2::default());
    while let Some(frame) = framed.next().await {
        let frame = frame?;
        let reply = match parse_args(frame) {
            Ok(args) if args.is_empty() => continue,
            Ok(args) => dispatch(&args, &ctx).await,
            Err(err) => BytesFrame::Error(format!("ERR {err}").into()),
        };
        framed.send(reply).await?;
    }
    Ok(())
}

async fn dispatch(args: &[Vec<u8>], ctx: &Arc<NodeContext>) -> BytesFrame {
    let command = String::from_utf8_lossy(&args[0]).to_ascii_uppercase();
    let result = match command.as_str() {
        "PING" => Ok(BytesFrame::SimpleString("PONG".into())),
        "SET" => cmd_set(args, ctx),
        "GET" => cmd_get(args, ctx),
        "DEL" => cmd_del(args, ctx),
        "CLUSTERX" => cmd_clusterx(args, ctx).await,
        other => Err(format!("ERR unknown command {other}")),
    };
    result.unwrap_or_else(|err| BytesFrame::Error(err.into()))
}

/// Routing check for writes: the forbidden slot redirects to the migration
/// destination, unowned slots redirect to their owner.
fn check_write_route(slot: SlotId, ctx: &NodeContext) -> Result<(), String> {
    if ctx.migrator.forbidden_slot() == Some(slot) {
        let endpoint = ctx
            .migrator
            .dst_endpoint()
            .map(|(host, port)| format!("{host}:{port}"))
            .unwrap_or_else(|| ctx.cluster.owner(slot).endpoint.clone());
        return Err(format_moved(slot, &endpoint));
    }
    if !ctx.cluster.owns_slot(slot) {
        return Err(format_moved(slot, &ctx.cluster.owner(slot).endpoint));
    }
    Ok(())
}

fn check_read_route(slot: SlotId, ctx: &NodeContext) -> Result<(), String> {
    if !ctx.cluster.owns_slot(slot) {
        return Err(format_moved(slot, &ctx.cluster.owner(slot).endpoint));
    }
    Ok(())
}

fn cmd_set(args: &[Vec<u8>], ctx: &NodeContext) -> Result<BytesFrame, String> {
    if args.len() != 3 {
        return Err("ERR wrong number of arguments for 'set' command".to_string());
    }
    let slot = key_slot(&args[1]);
    check_write_route(slot, ctx)?;
    ctx.engine
        .put_string(&args[1], &args[2], 0)
        .map_err(|err| format!("ERR {err}"))?;
    Ok(BytesFrame::SimpleString("OK".into()))
}

fn cmd_get(args: &[Vec<u8>], ctx: &NodeContext) -> Result<BytesFrame, String> {
    if args.len() != 2 {
        return Err("ERR wrong number of arguments for 'get' command".to_string());
    }
    let slot = key_slot(&args[1]);
    check_read_route(slot, ctx)?;
    match ctx.engine.get_string(&args[1]) {
        Ok(Some(value)) => Ok(BytesFrame::BulkString(bytes::Bytes::from(value))),
        Ok(None) => Ok(BytesFrame::Null),
        Err(err) => Err(format!("WRONGTYPE {err}")),
    }
}

fn cmd_del(args: &[Vec<u8>], ctx: &NodeContext) -> Result<BytesFrame, String> {
    if args.len() != 2 {
        return Err("ERR wrong number of arguments for 'del' command".to_string());
    }
    let slot = key_slot(&args[1]);
    check_write_route(slot, ctx)?;
    let removed = ctx
        .engine
        .delete_key(&args[1])
        .map_err(|err| format!("ERR {err}"))?;
    Ok(BytesFrame::Integer(i64::from(removed)))
}

async fn cmd_clusterx(args: &[Vec<u8>], ctx: &Arc<NodeContext>) -> Result<BytesFrame, String> {
    if args.len() < 2 {
        return Err("ERR CLUSTERX expects a subcommand".to_string());
    }
    let sub = String::from_utf8_lossy(&args[1]).to_ascii_uppercase();
    match sub.as_str() {
        "STATE" => {
            let json = ctx.cluster.state_json().map_err(|err| format!("ERR {err}"))?;
            Ok(BytesFrame::BulkString(bytes::Bytes::from(json.into_bytes())))
        }
        "MIGRATE" => cmd_clusterx_migrate(args, ctx).await,
        other => Err(format!("ERR unknown CLUSTERX subcommand {other}")),
    }
}

async fn cmd_clusterx_migrate(
    args: &[Vec<u8>],
    ctx: &Arc<NodeContext>,
) -> Result<BytesFrame, String> {
    if args.len() >= 3 && args[2].eq_ignore_ascii_case(b"status") {
        let info = ctx.migrator.get_migration_info().to_string();
        return Ok(BytesFrame::BulkString(bytes::Bytes::from(info.into_bytes())));
    }
    if args.len() < 4 {
        return Err(
            "ERR CLUSTERX MIGRATE expects <slot> <node> [sync] or status".to_string(),
        );
    }

    let slot: SlotId = std::str::from_utf8(&args[2])
        .ok()
        .and_then(|s| s.parse().ok())
        .filter(|slot| *slot <= MAX_SLOT)
        .ok_or_else(|| "ERR invalid slot id".to_string())?;

    let node = String::from_utf8_lossy(&args[3]).to_string();
    let (host, port) = parse_endpoint(&node)
        .ok_or_else(|| "ERR destination node must be host:port".to_string())?;

    let sync = args.len() >= 5 && args[4].eq_ignore_ascii_case(b"sync");
    if sync {
        let waiter = SyncMigrateContext::new();
        ctx.migrator
            .perform_slot_migration(&node, &host, port, slot, Some(Arc::clone(&waiter)))
            .map_err(|err| format!("ERR {err}"))?;
        tokio::task::spawn_blocking(move || waiter.wait())
            .await
            .map_err(|err| format!("ERR migration wait failed: {err}"))?
            .map_err(|err| format!("ERR {err:#}"))?;
    } else {
        ctx.migrator
            .perform_slot_migration(&node, &host, port, slot, None)
            .map_err(|err| format!("ERR {err}"))?;
    }
    Ok(BytesFrame::SimpleString("OK".into()))
}

fn parse_endpoint(node: &str) -> Option<(String, u16)> {
    let (host, port) = node.rsplit_once(':')?;
    let port = port.parse().ok()?;
    if host.is_empty() {
        return None;
    }
    Some((host.to_string(), port))
}

fn parse_args(frame: BytesFrame) -> anyhow::Result<Vec<Vec<u8>>> {
    let BytesFrame::Array(parts) = frame else {
        anyhow::bail!("expected array frame");
    };
    let mut args = Vec::with_capacity(parts.len());
    for part in &parts {
        match part {
            BytesFrame::BulkString(b) | BytesFrame::SimpleString(b) => args.push(b.to_vec()),
            other => {
                let text = other.as_str().unwrap_or_default().to_string();
                anyhow::ensure!(!text.is_empty(), "invalid argument frame");
                args.push(text.into_bytes());
            }
        }
    }
    Ok(args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_parsing() {
        assert_eq!(
            parse_endpoint("127.0.0.1:7002"),
            Some(("127.0.0.1".to_string(), 7002))
        );
        assert_eq!(parse_endpoint("no-port"), None);
        assert_eq!(parse_endpoint(":7002"), None);
    }
}
