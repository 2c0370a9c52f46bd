//! Worker process entry point.
//!
//! This runs when the broker starts `rustica worker <index>`. The worker
//! announces itself on the local channel, then serves one dispatched client
//! connection at a time, re-announcing itself after each.

use crate::broker::handoff;
use crate::broker::hello;
use crate::error::Result;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Serves a client connection handed over by the broker.
///
/// Request execution proper lives outside this crate; implementations own
/// the stream and close it when done.
pub trait ConnectionHandler {
    fn handle(&mut self, conn: TcpStream) -> io::Result<()>;
}

/// Largest request head [`StatusHandler`] reads before answering.
const MAX_REQUEST_HEAD: usize = 8 * 1024;

/// Answers every request with a short plain-text status naming the worker.
#[derive(Debug, Clone)]
pub struct StatusHandler {
    index: usize,
}

impl StatusHandler {
    pub fn new(index: usize) -> Self {
        Self { index }
    }
}

impl ConnectionHandler for StatusHandler {
    fn handle(&mut self, mut conn: TcpStream) -> io::Result<()> {
        conn.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut head = Vec::with_capacity(1024);
        let mut buf = [0u8; 1024];
        while head.len() < MAX_REQUEST_HEAD && !head.windows(4).any(|w| w == b"\r\n\r\n") {
            match conn.read(&mut buf)? {
                0 => break,
                n => head.extend_from_slice(&buf[..n]),
            }
        }

        let body = format!("rustica worker {} (pid {})\n", self.index, std::process::id());
        write!(
            conn,
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            body.len(),
            body
        )?;
        conn.flush()
    }
}

/// Connect to the broker and send the hello for this process.
pub fn announce(channel: &mut UnixStream) -> io::Result<()> {
    channel.write_all(&hello::encode(std::process::id()))
}

/// Serve dispatched connections until the broker goes away or no work
/// arrives for `idle_timeout`.
pub fn serve<H: ConnectionHandler>(
    mut channel: UnixStream,
    idle_timeout: Option<Duration>,
    handler: &mut H,
) -> Result<()> {
    channel.set_read_timeout(idle_timeout)?;
    loop {
        announce(&mut channel)?;
        let fd = match handoff::recv_connection(&channel) {
            Ok(Some(fd)) => fd,
            Ok(None) => {
                info!("broker closed the worker channel");
                return Ok(());
            }
            Err(crate::error::BrokerError::Io(e))
                if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) =>
            {
                info!("idle timeout reached, exiting");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        debug!("received client connection");
        if let Err(e) = handler.handle(TcpStream::from(fd)) {
            warn!(error = %e, "client connection failed");
        }
    }
}

/// Run a worker process: connect to the broker at `ipc_path` and serve.
pub fn run_worker(index: usize, ipc_path: &Path, idle_timeout: Option<Duration>) -> Result<()> {
    // A client hanging up mid-response must not kill the worker.
    // Safety: installing SIG_IGN has no handler code to race with.
    unsafe {
        nix::sys::signal::signal(
            nix::sys::signal::Signal::SIGPIPE,
            nix::sys::signal::SigHandler::SigIgn,
        )?;
    }

    let channel = UnixStream::connect(ipc_path)?;
    info!(index, pid = std::process::id(), "worker connected to broker");
    serve(channel, idle_timeout, &mut StatusHandler::new(index))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::hello::{HELLO_LEN, HelloReader, HelloStep};
    use std::net::TcpListener;
    use std::thread;

    #[test]
    fn test_status_handler_answers() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = thread::spawn(move || {
            let mut conn = TcpStream::connect(addr).unwrap();
            conn.write_all(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n").unwrap();
            let mut response = String::new();
            conn.read_to_string(&mut response).unwrap();
            response
        });

        let (conn, _) = listener.accept().unwrap();
        StatusHandler::new(4).handle(conn).unwrap();

        let response = client.join().unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("rustica worker 4"));
    }

    #[test]
    fn test_serve_announces_and_exits_on_broker_close() {
        let (mut broker_end, worker_end) = UnixStream::pair().unwrap();
        let worker = thread::spawn(move || {
            serve(worker_end, None, &mut StatusHandler::new(0)).unwrap();
        });

        let mut buf = [0u8; HELLO_LEN];
        broker_end.read_exact(&mut buf).unwrap();
        let mut reader = HelloReader::new();
        assert_eq!(reader.feed(&buf), HelloStep::Complete(std::process::id()));

        drop(broker_end);
        worker.join().unwrap();
    }

    #[test]
    fn test_serve_idle_timeout() {
        let (_broker_end, worker_end) = UnixStream::pair().unwrap();
        serve(
            worker_end,
            Some(Duration::from_millis(50)),
            &mut StatusHandler::new(0),
        )
        .unwrap();
    }
}
