//! Cablegram - Real-time messaging delivery core
//!
//! Binary host: wires the core components together and serves the framed
//! TCP gateway protocol. Clients open with HELLO (bearer token), receive
//! WELCOME, then exchange COMMAND/EVENT frames until either side closes.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use cablegram::activity::{self, ActivityMonitor};
use cablegram::auth::TokenVerifier;
use cablegram::config::Config;
use cablegram::delivery::DeliveryCoordinator;
use cablegram::framing::{self, Close, FrameType, HEADER_LEN, Hello, Welcome};
use cablegram::gateway::SessionGateway;
use cablegram::membership::ChatMembershipIndex;
use cablegram::model::{ConnId, NewMessage};
use cablegram::presence::PresenceRegistry;
use cablegram::protocol::{self, ClientCommand, ServerEvent};
use cablegram::store::ChatStore;

#[cfg(feature = "postgres")]
use cablegram::store::PostgresStore;

#[cfg(feature = "memory")]
use cablegram::store::MemoryStore;

/// Time a new connection gets to present its HELLO frame
const AUTH_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(name = "cablegram")]
#[command(about = "Real-time messaging delivery core")]
#[command(version)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[cfg(feature = "memory")]
async fn init_store(_config: &Config) -> anyhow::Result<Arc<dyn ChatStore>> {
    info!("Memory store initialized (single-node only)");
    Ok(Arc::new(MemoryStore::new()))
}

#[cfg(all(not(feature = "memory"), feature = "postgres"))]
async fn init_store(config: &Config) -> anyhow::Result<Arc<dyn ChatStore>> {
    let url = config.database_url.as_deref().ok_or_else(|| {
        anyhow::anyhow!("CABLEGRAM_DATABASE_URL is required for the postgres store")
    })?;
    let store = PostgresStore::new(url).await?;
    info!("PostgreSQL store connected");
    Ok(Arc::new(store))
}

/// Everything a connection task needs to serve one client
#[derive(Clone)]
struct SessionContext {
    store: Arc<dyn ChatStore>,
    presence: Arc<PresenceRegistry>,
    membership: Arc<ChatMembershipIndex>,
    gateway: Arc<SessionGateway>,
    delivery: Arc<DeliveryCoordinator>,
    monitor: Arc<ActivityMonitor>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // JSON logging with structured fields
    tracing_subscriber::fmt()
        .json()
        .with_env_filter(args.log_level.as_str())
        .init();

    info!("Cablegram v{}", env!("CARGO_PKG_VERSION"));

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load config: {}", e);
            error!("Required env vars: CABLEGRAM_AUTH_SECRET");
            std::process::exit(1);
        }
    };

    let store = init_store(&config).await?;

    let presence = Arc::new(PresenceRegistry::new());
    let membership = Arc::new(ChatMembershipIndex::new(store.clone()));
    let gateway = Arc::new(SessionGateway::new(
        TokenVerifier::new(&config.auth_secret),
        presence.clone(),
        membership.clone(),
    ));
    let delivery = Arc::new(DeliveryCoordinator::new(
        store.clone(),
        gateway.clone(),
        membership.clone(),
    ));
    let monitor = Arc::new(ActivityMonitor::new(
        presence.clone(),
        delivery.clone(),
        config.idle_after_secs,
    ));

    // Periodic idle sweep
    activity::spawn_sweep_task(monitor.clone(), Duration::from_secs(config.sweep_interval_secs));

    // Heartbeat to all connections
    let ping_gateway = gateway.clone();
    let ping_interval = config.ping_interval;
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(ping_interval));
        loop {
            interval.tick().await;
            let timestamp = chrono::Utc::now().timestamp();
            ping_gateway.broadcast_all(&ServerEvent::Ping { timestamp });
            debug!(
                timestamp,
                connections = ping_gateway.connection_count(),
                "Ping sent"
            );
        }
    });

    let context = SessionContext {
        store,
        presence,
        membership,
        gateway,
        delivery,
        monitor,
    };

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!(addr = %config.bind_addr, "Listening for gateway connections");

    loop {
        let (stream, remote) = listener.accept().await?;
        let ctx = context.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, remote, ctx).await {
                debug!(remote = %remote, error = %e, "connection task ended with error");
            }
        });
    }
}

/// Incremental frame reader over one connection's read half
struct FrameReader {
    reader: OwnedReadHalf,
    buf: Vec<u8>,
    pending: Vec<u8>,
}

impl FrameReader {
    fn new(reader: OwnedReadHalf) -> Self {
        Self {
            reader,
            buf: vec![0u8; 64 * 1024],
            pending: Vec::new(),
        }
    }

    /// Next complete frame, or `None` once the peer closed the stream.
    async fn next(&mut self) -> anyhow::Result<Option<(FrameType, Vec<u8>)>> {
        loop {
            if self.pending.len() >= HEADER_LEN {
                let (frame_type, payload_len) = framing::decode_header(&self.pending)?;
                let total_len = HEADER_LEN + payload_len;

                if self.pending.len() >= total_len {
                    let payload = self.pending[HEADER_LEN..total_len].to_vec();
                    self.pending.drain(..total_len);
                    return Ok(Some((frame_type, payload)));
                }
            }

            let n = self.reader.read(&mut self.buf).await?;
            if n == 0 {
                return Ok(None);
            }
            self.pending.extend_from_slice(&self.buf[..n]);
        }
    }
}

async fn write_close(write_half: &mut OwnedWriteHalf, code: u16, reason: &str) {
    let frame = framing::encode_json(
        FrameType::Close,
        &Close {
            code,
            reason: reason.to_string(),
        },
    );
    if let Err(e) = write_half.write_all(&frame).await {
        debug!(error = %e, "failed to write close frame");
    }
}

async fn handle_connection(
    stream: TcpStream,
    remote: SocketAddr,
    ctx: SessionContext,
) -> anyhow::Result<()> {
    let (read_half, mut write_half) = stream.into_split();
    let mut frames = FrameReader::new(read_half);

    // First frame must be HELLO, within the auth window
    let first = match tokio::time::timeout(AUTH_TIMEOUT, frames.next()).await {
        Ok(result) => result?,
        Err(_) => {
            write_close(&mut write_half, 4408, "authentication timeout").await;
            return Ok(());
        }
    };
    let Some((frame_type, payload)) = first else {
        return Ok(());
    };
    if frame_type != FrameType::Hello {
        write_close(&mut write_half, 4400, "expected hello").await;
        return Ok(());
    }
    let hello: Hello = match serde_json::from_slice(&payload) {
        Ok(hello) => hello,
        Err(e) => {
            debug!(remote = %remote, error = %e, "malformed hello");
            write_close(&mut write_half, 4400, "malformed hello").await;
            return Ok(());
        }
    };

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel();
    let (conn_id, user_id, change) = match ctx.gateway.connect(&hello.token, outbound_tx) {
        Ok(admitted) => admitted,
        Err(e) => {
            debug!(remote = %remote, error = %e, "connection rejected");
            write_close(&mut write_half, 4401, "unauthorized").await;
            return Ok(());
        }
    };
    info!(conn_id, user_id = %user_id, remote = %remote, "user connected");

    if let Err(e) = ctx.store.upsert_user(&user_id).await {
        warn!(conn_id, error = %e, "user upsert failed");
    }

    let result = async {
        let welcome = framing::encode_json(
            FrameType::Welcome,
            &Welcome {
                conn_id,
                user_id: user_id.clone(),
            },
        );
        write_half.write_all(&welcome).await?;

        if let Some(ref change) = change {
            ctx.delivery.deliver_status_change(change);
        }

        // Writer task drains outbound events into EVENT frames. It ends on
        // its own once the gateway drops the connection's sender.
        tokio::spawn(async move {
            while let Some(payload) = outbound_rx.recv().await {
                let frame = framing::encode_frame(FrameType::Event, &payload);
                if write_half.write_all(&frame).await.is_err() {
                    break;
                }
            }
        });

        read_commands(&mut frames, conn_id, &user_id, &ctx).await
    }
    .await;

    // Runs on clean close and abrupt transport loss alike
    if let Some(change) = ctx.gateway.disconnect(conn_id) {
        ctx.delivery.deliver_status_change(&change);
    }
    info!(conn_id, user_id = %user_id, "user disconnected");

    result
}

async fn read_commands(
    frames: &mut FrameReader,
    conn_id: ConnId,
    user_id: &str,
    ctx: &SessionContext,
) -> anyhow::Result<()> {
    while let Some((frame_type, payload)) = frames.next().await? {
        match frame_type {
            FrameType::Command => {
                let command = match protocol::parse_command(&payload) {
                    Ok(command) => command,
                    Err(e) => {
                        warn!(conn_id, error = %e, "invalid command");
                        ctx.gateway.send_to_conn(
                            conn_id,
                            &ServerEvent::Error {
                                code: "validation_failed",
                                message: e.to_string(),
                            },
                        );
                        continue;
                    }
                };

                // Every authenticated command counts as activity
                ctx.monitor.record_activity(user_id);
                handle_command(command, conn_id, user_id, ctx).await;
            }
            FrameType::Close => {
                debug!(conn_id, "client requested close");
                break;
            }
            other => {
                warn!(conn_id, frame_type = ?other, "unexpected frame type");
            }
        }
    }

    Ok(())
}

async fn handle_command(
    command: ClientCommand,
    conn_id: ConnId,
    user_id: &str,
    ctx: &SessionContext,
) {
    match command {
        ClientCommand::SendMessage {
            chat_id,
            content,
            kind,
            file_url,
            file_name,
            file_size,
        } => {
            let new = NewMessage {
                chat_id,
                sender_id: user_id.to_string(),
                content,
                kind,
                file_url,
                file_name,
                file_size,
            };
            match ctx.delivery.send_message(new).await {
                Ok(message) => {
                    debug!(conn_id, chat_id, message_id = message.id, "message sent");
                }
                Err(err) => {
                    warn!(conn_id, chat_id, error = %err, "send failed");
                    ctx.gateway.send_to_conn(
                        conn_id,
                        &ServerEvent::Error {
                            code: err.code(),
                            message: err.to_string(),
                        },
                    );
                }
            }
        }

        ClientCommand::JoinChat { chat_id } => {
            match ctx.membership.join_group(conn_id, user_id, chat_id).await {
                Ok(true) => debug!(conn_id, chat_id, "joined chat group"),
                // Non-member joins fail silently by contract
                Ok(false) => debug!(conn_id, chat_id, "join ignored"),
                Err(err) => warn!(conn_id, chat_id, error = %err, "join failed"),
            }
        }

        ClientCommand::LeaveChat { chat_id } => {
            ctx.membership.leave_group(conn_id, chat_id);
        }

        ClientCommand::UpdateStatus { status } => {
            if let Some(change) = ctx.presence.set_status(user_id, status) {
                ctx.delivery.deliver_status_change(&change);
            }
        }

        ClientCommand::MarkRead {
            chat_id,
            message_id,
        } => {
            if let Err(err) = ctx
                .delivery
                .mark_message_read(user_id, chat_id, message_id)
                .await
            {
                warn!(conn_id, message_id, error = %err, "mark read failed");
                ctx.gateway.send_to_conn(
                    conn_id,
                    &ServerEvent::Error {
                        code: err.code(),
                        message: err.to_string(),
                    },
                );
            }
        }

        ClientCommand::Typing { chat_id, is_typing } => {
            ctx.delivery.deliver_typing(user_id, chat_id, is_typing);
        }

        ClientCommand::GetStatuses { user_ids } => {
            let statuses = ctx.presence.batch_get_status(&user_ids);
            ctx.gateway
                .send_to_conn(conn_id, &ServerEvent::UserStatuses { statuses });
        }

        // Already recorded above; nothing else to do
        ClientCommand::UpdateActivity => {}
    }
}
