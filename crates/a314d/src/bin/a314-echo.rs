//! Minimal echo service for the a314 bridge.
//!
//! Accepts every connect, echoes DATA back on the same stream, and mirrors
//! EOS. Runs in two modes:
//!
//! - `a314-echo -ondemand <fd>` — spawned by the daemon, speaking the
//!   client protocol over the inherited socketpair end;
//! - `a314-echo --register <name> [addr]` — connects to a running daemon
//!   (default `127.0.0.1:7110`) and registers `<name>` itself.

use std::collections::HashSet;
use std::os::fd::{FromRawFd, RawFd};
use std::os::unix::net::UnixStream as StdUnixStream;
use std::process::ExitCode;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tracing_subscriber::EnvFilter;

use a314_wire::{CONNECT_OK, DAEMON_PORT, MSG_SUCCESS, MsgType};
use a314d::Framed;

async fn serve<S>(stream: S) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream);
    let mut open_streams: HashSet<u32> = HashSet::new();

    while let Some(msg) = framed.recv().await? {
        let stream_id = msg.header.stream_id;
        match MsgType::from_wire(msg.header.msg_type) {
            Some(MsgType::Connect) => {
                tracing::info!(
                    stream_id,
                    service = %String::from_utf8_lossy(&msg.payload),
                    "accepting stream"
                );
                open_streams.insert(stream_id);
                framed
                    .send(MsgType::ConnectResponse.wire(), stream_id, &[CONNECT_OK])
                    .await?;
            }
            Some(MsgType::Data) => {
                if open_streams.contains(&stream_id) {
                    framed
                        .send(MsgType::Data.wire(), stream_id, &msg.payload)
                        .await?;
                }
            }
            Some(MsgType::Eos) => {
                if open_streams.remove(&stream_id) {
                    framed.send(MsgType::Eos.wire(), stream_id, &[]).await?;
                }
            }
            Some(MsgType::Reset) => {
                open_streams.remove(&stream_id);
            }
            other => {
                tracing::debug!(msg_type = msg.header.msg_type, ?other, "ignoring message");
            }
        }
    }
    Ok(())
}

async fn run_ondemand(fd: RawFd) -> std::io::Result<()> {
    // Safety: the daemon handed us this fd for exclusive use.
    let stream = unsafe { StdUnixStream::from_raw_fd(fd) };
    stream.set_nonblocking(true)?;
    serve(UnixStream::from_std(stream)?).await
}

async fn run_registered(name: &str, addr: &str) -> std::io::Result<()> {
    let stream = TcpStream::connect(addr).await?;
    stream.set_nodelay(true)?;
    let mut framed = Framed::new(stream);

    framed
        .send(MsgType::RegisterReq.wire(), 0, name.as_bytes())
        .await?;
    let Some(res) = framed.recv().await? else {
        return Err(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            "daemon closed the connection during registration",
        ));
    };
    if res.payload.first() != Some(&MSG_SUCCESS) {
        return Err(std::io::Error::other(format!(
            "registration of {name:?} refused"
        )));
    }
    tracing::info!(name, addr, "registered");
    serve(framed.into_inner()).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let result = match args.get(1).map(String::as_str) {
        Some("-ondemand") => match args.get(2).and_then(|s| s.parse::<RawFd>().ok()) {
            Some(fd) => run_ondemand(fd).await,
            None => {
                eprintln!("usage: a314-echo -ondemand <fd>");
                return ExitCode::FAILURE;
            }
        },
        Some("--register") => match args.get(2) {
            Some(name) => {
                let default_addr = format!("127.0.0.1:{DAEMON_PORT}");
                let addr = args.get(3).cloned().unwrap_or(default_addr);
                run_registered(name, &addr).await
            }
            None => {
                eprintln!("usage: a314-echo --register <name> [addr]");
                return ExitCode::FAILURE;
            }
        },
        _ => {
            eprintln!("usage: a314-echo -ondemand <fd> | --register <name> [addr]");
            return ExitCode::FAILURE;
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::error!(%error, "echo service failed");
            ExitCode::FAILURE
        }
    }
}
