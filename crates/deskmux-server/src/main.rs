//! Worked example wiring `deskmux-core`'s channel/client fan-out core to
//! real TCP sockets and the crate's own WebSocket transport.
//!
//! This binary is demonstration/integration-test surface only — the event
//! loop, per-channel business logic, and the application-layer message
//! parser are all external collaborators the core declares out of scope
//! (spec.md §1); this file plays all three roles in the simplest way that
//! still exercises every public operation of the library.
//!
//! One thread is spawned per accepted connection. That thread is both the
//! channel's owner thread (captured at `Channel::new`) and the client's
//! owning thread, so the owner-thread discipline in §5 is trivially
//! satisfied without a cross-thread dispatcher.
//!
//! Configuration is two environment variables, matching how the teacher's
//! own binary reads `PORT`/`STATIC_DIR`/`RUST_LOG`:
//! - `DESKMUX_LISTEN`: address to bind (default `127.0.0.1:7890`)
//! - `RUST_LOG`: tracing filter (default `info`)

use std::io;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use deskmux_core::{
    Channel, ChannelCallbacks, ChannelClient, Client, ClientCallbacks, EmptyItem, PipeItem,
    WebSocketTransport,
};

/// The one channel type this demo registers. A real server would have one
/// of these per logical stream (main/display/inputs/cursor); this demo
/// collapses them into a single echo channel so the whole fan-out/pipe path
/// can be exercised with one connection.
const ECHO_CHANNEL_TYPE: u32 = 1;

/// Pipe-item type tag pushed back to the peer after every echoed message, to
/// exercise `pipe_add_push`/`send_item` alongside the direct raw-write path.
const ACK_MSG_TYPE: u32 = 100;

struct EchoChannelCallbacks;

impl ChannelCallbacks for EchoChannelCallbacks {
    fn config_socket(&self, _cc: &Arc<ChannelClient>) -> bool {
        true
    }

    fn on_disconnect(&self, _cc: &Arc<ChannelClient>) {
        tracing::info!("echo channel-client disconnected");
    }

    fn alloc_recv_buf(&self, _cc: &Arc<ChannelClient>, _msg_type: u32, size: usize) -> Vec<u8> {
        vec![0; size]
    }

    fn release_recv_buf(&self, _cc: &Arc<ChannelClient>, _msg_type: u32, _buf: Vec<u8>) {}

    fn send_item(&self, cc: &Arc<ChannelClient>, item: &dyn PipeItem) {
        let tag = item.kind() as u8;
        match cc.write_raw(&[tag]) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => cc.set_blocked(true),
            Err(e) => tracing::warn!(error = %e, "echo channel: ack write failed"),
        }
    }

    fn handle_message(&self, cc: &Arc<ChannelClient>, _msg_type: u32, buf: &[u8]) -> bool {
        tracing::debug!(bytes = buf.len(), "echo channel received message");
        match cc.write_raw(buf) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                cc.set_blocked(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "echo channel: echo write failed");
                return false;
            }
        }
        cc.pipe_add_push(Box::new(EmptyItem::new(ACK_MSG_TYPE)));
        true
    }
}

struct EchoClientCallbacks;
impl ClientCallbacks for EchoClientCallbacks {}

/// Handles one accepted connection end-to-end: WebSocket handshake, core
/// object construction, and a blocking receive loop until disconnect.
fn serve_connection(stream: TcpStream, channel_id: u32) -> Result<(), Box<dyn std::error::Error>> {
    stream.set_nodelay(true).ok();

    let ws = WebSocketTransport::new(&[], stream)?;

    let channel = Channel::new(
        ECHO_CHANNEL_TYPE,
        channel_id,
        false,
        0,
        Box::new(EchoChannelCallbacks),
        Box::new(EchoClientCallbacks),
        None,
    );
    let client = Client::new(false, None);
    let cc = ChannelClient::new(channel.clone(), client.clone(), Box::new(ws));

    channel.add_client(cc.clone());
    client.add_channel(cc.clone());

    loop {
        match cc.receive() {
            Ok(0) => break,
            Ok(_) => continue,
            Err(e) => {
                tracing::warn!(error = %e, "echo channel-client read failed");
                break;
            }
        }
    }

    cc.disconnect();
    Ok(())
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let listen_addr = std::env::var("DESKMUX_LISTEN").unwrap_or_else(|_| "127.0.0.1:7890".to_string());
    let listener = TcpListener::bind(&listen_addr).expect("failed to bind listen address");
    tracing::info!(addr = %listen_addr, "deskmux echo server listening");

    let next_channel_id = Arc::new(AtomicU32::new(0));

    for stream in listener.incoming() {
        let stream = match stream {
            Ok(stream) => stream,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                continue;
            }
        };
        let channel_id = next_channel_id.fetch_add(1, Ordering::SeqCst);
        std::thread::spawn(move || {
            if let Err(e) = serve_connection(stream, channel_id) {
                tracing::warn!(error = %e, channel_id, "connection ended with an error");
            }
        });
    }
}
