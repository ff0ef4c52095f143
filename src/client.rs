//! The message client: a full-duplex request/response driver over a
//! loopback connection (C4).

use std::net::TcpStream;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::debug;

use crate::error::Result;
use crate::message::{id_name, Message};
use crate::wire;

const SEND_RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// A join handle standing in for the reference implementation's
/// `std::future<bool>`. This crate's concurrency model is plain OS
/// threads with blocking I/O (§5) — there is no executor to poll, so the
/// "future" is just a thread you can wait on.
pub struct SendFuture {
    handle: JoinHandle<bool>,
}

impl SendFuture {
    /// Blocks until the send loop finishes and returns its overall
    /// success flag.
    pub fn join(self) -> bool {
        self.handle.join().unwrap_or(false)
    }

    /// Non-blocking check of whether the send loop has finished.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// Connects to the broker's loopback port and drives request/response
/// exchanges over that one connection.
///
/// Holds nothing but the port, so it is cheap to copy into the closures
/// each [`send`](Self::send)/[`send_fixed`](Self::send_fixed) call hands
/// off to its own worker thread.
#[derive(Clone, Copy, Debug)]
pub struct MessageClient {
    port: u16,
}

impl MessageClient {
    pub fn new(port: u16) -> Self {
        MessageClient { port }
    }

    /// Bare `connect`+`close` probe: `true` if something is listening on
    /// `port`.
    pub fn is_up(port: u16) -> bool {
        TcpStream::connect(("127.0.0.1", port)).is_ok()
    }

    fn connect(&self) -> Result<TcpStream> {
        let stream = TcpStream::connect(("127.0.0.1", self.port))?;
        stream.set_read_timeout(Some(SEND_RECV_TIMEOUT))?;
        stream.set_write_timeout(Some(SEND_RECV_TIMEOUT))?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// One round trip: send `message`, return the decoded response.
    pub fn send_one(&self, message: &Message) -> Result<Message> {
        let mut stream = self.connect()?;
        write_frame(&mut stream, message)?;
        read_frame(&mut stream)
    }

    /// Sends `message` and does not wait for (or read) a response.
    /// Used for the bridge's fire-and-forget multicasts.
    pub fn send_fire_and_forget(&self, message: &Message) -> Result<()> {
        let mut stream = self.connect()?;
        write_frame(&mut stream, message)
    }

    /// The full producer/consumer driver loop (§4.4): on each iteration
    /// `producer` populates the outbound message (returning `false` to
    /// stop before sending), the frame is written and a response read,
    /// then `consumer` processes it (returning `false` to stop after this
    /// round). Runs on a dedicated thread; the returned [`SendFuture`]
    /// resolves to whether the loop ran to a clean stop rather than an
    /// I/O failure.
    pub fn send(
        &self,
        mut producer: impl FnMut(&mut Message) -> bool + Send + 'static,
        mut consumer: impl FnMut(Message) -> bool + Send + 'static,
    ) -> SendFuture {
        let port = self.port;
        let handle = thread::spawn(move || -> bool {
            let client = MessageClient::new(port);
            let mut stream = match client.connect() {
                Ok(s) => s,
                Err(e) => {
                    debug!("message client failed to connect: {e}");
                    return false;
                }
            };

            loop {
                let mut out_message = Message::default();
                if !producer(&mut out_message) {
                    return true;
                }

                if write_frame(&mut stream, &out_message).is_err() {
                    return false;
                }

                let in_message = match read_frame(&mut stream) {
                    Ok(m) => m,
                    Err(_) => return false,
                };

                if !consumer(in_message) {
                    return true;
                }
            }
        });

        SendFuture { handle }
    }

    /// Convenience form of [`send`](Self::send) whose producer always
    /// sends the same fixed message (e.g. a repeated `LISTEN`), paired
    /// with a caller-supplied consumer.
    pub fn send_fixed(
        &self,
        message: Message,
        mut consumer: impl FnMut(Message) -> bool + Send + 'static,
    ) -> SendFuture {
        self.send(
            move |out| {
                *out = message.clone();
                true
            },
            move |in_message| consumer(in_message),
        )
    }
}

fn write_frame(stream: &mut TcpStream, message: &Message) -> Result<()> {
    wire::write_i32(stream, message.id)?;
    wire::write_u64(stream, message.query_id)?;
    wire::write_length_prefixed(stream, &message.data)?;
    Ok(())
}

fn read_frame(stream: &mut TcpStream) -> Result<Message> {
    let id = wire::read_i32(stream)?;
    let query_id = wire::read_u64(stream)?;
    let data = wire::read_length_prefixed(stream)?;
    debug!("received message: id={} query={query_id} size={}", id_name(id), data.len());
    Ok(Message::new(id, query_id, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_up_reports_false_for_unbound_port() {
        // Port 1 is a privileged port that is essentially never bound in
        // a test environment; this just exercises the probe path.
        assert!(!MessageClient::is_up(1));
    }
}
