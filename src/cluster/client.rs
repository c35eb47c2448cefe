use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex};

use crate::cluster::protocol::{PROTOCOL_VERSION, RemoteOutcome, Request, Response, read_frame, write_frame};
use crate::cluster::{ConnectionLostListener, TaskInvoker};
use crate::codec::Snapshot;
use crate::core::lock;
use crate::environment::EnvironmentProperties;
use crate::error::ClusterError;

/// Client end of a cluster connection.
///
/// Calls are multiplexed over one stream. A reader thread routes responses to
/// the waiting callers by call id; when the stream ends every waiting caller
/// gets [`ClusterError::ConnectionLost`] and the loss listeners are notified.
/// Calls dropped by [`TaskInvoker::cancel_all`] get [`ClusterError::Cancelled`]
/// instead.
pub struct ClusterConnection {
    name: String,
    environment: EnvironmentProperties,
    capacity: usize,
    writer: Mutex<Box<dyn Write + Send>>,
    shared: Arc<Shared>,
    next_call: AtomicU64,
}

struct Shared {
    name: String,
    connected: AtomicBool,
    pending: Mutex<HashMap<u64, Sender<Result<Response, ClusterError>>>>,
    listeners: Mutex<Vec<ConnectionLostListener>>,
    notified: AtomicBool,
}

impl Shared {
    fn lose(&self) {
        {
            let mut pending = lock(&self.pending);
            self.connected.store(false, Ordering::SeqCst);
            pending.clear();
        }

        let listeners = lock(&self.listeners);
        if !self.notified.swap(true, Ordering::SeqCst) {
            tracing::warn!(remote = %self.name, "Connection lost");
            for listener in listeners.iter() {
                listener(&self.name);
            }
        }
    }

    fn route(&self, call: u64, response: Response) {
        match lock(&self.pending).remove(&call) {
            Some(sender) => {
                let _ = sender.send(Ok(response));
            }
            None => tracing::trace!(call, "Dropping response to a call nobody waits for"),
        }
    }
}

impl ClusterConnection {
    /// Connects to a [`ClusterServer`](crate::cluster::ClusterServer) over TCP.
    pub fn connect(address: impl ToSocketAddrs) -> Result<Self, ClusterError> {
        let stream = TcpStream::connect(address)?;
        stream.set_nodelay(true)?;
        let reader = stream.try_clone()?;
        Self::over(reader, stream)
    }

    /// Performs the handshake over an established stream pair.
    pub fn over<R, W>(mut reader: R, mut writer: W) -> Result<Self, ClusterError>
    where
        R: Read + Send + 'static,
        W: Write + Send + 'static,
    {
        write_frame(&mut writer, &Request::Hello { version: PROTOCOL_VERSION })?;

        let (name, environment, capacity) = match read_frame::<_, Response>(&mut reader)? {
            Some(Response::Welcome {
                version,
                name,
                environment,
                capacity,
            }) => {
                if version != PROTOCOL_VERSION {
                    return Err(ClusterError::Incompatible {
                        expected: PROTOCOL_VERSION,
                        found: version,
                    });
                }
                (name, environment, capacity)
            }
            Some(Response::Error { message, .. }) => {
                return Err(ClusterError::Remote {
                    remote: "<handshake>".into(),
                    message,
                });
            }
            Some(other) => return Err(ClusterError::Protocol(format!("expected a welcome, got {other:?}"))),
            None => return Err(ClusterError::ConnectionLost("<handshake>".into())),
        };

        tracing::info!(remote = %name, capacity, "Connected to cluster environment");

        let shared = Arc::new(Shared {
            name: name.clone(),
            connected: AtomicBool::new(true),
            pending: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
            notified: AtomicBool::new(false),
        });

        let reading = shared.clone();
        std::thread::Builder::new()
            .name(format!("tsumiki-cluster-{name}"))
            .spawn(move || read_responses(reader, &reading))?;

        Ok(Self {
            name,
            environment,
            capacity,
            writer: Mutex::new(Box::new(writer)),
            shared,
            next_call: AtomicU64::new(1),
        })
    }

    /// Concurrent duplicates the remote announced in its welcome.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lost(&self) -> ClusterError {
        ClusterError::ConnectionLost(self.name.clone())
    }

    fn send(&self, request: &Request) -> Result<(), ClusterError> {
        let mut writer = lock(&self.writer);
        write_frame(&mut *writer, request)
    }

    fn call(&self, request: impl FnOnce(u64) -> Request) -> Result<Response, ClusterError> {
        let call = self.next_call.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = channel();
        {
            let mut pending = lock(&self.shared.pending);
            if !self.shared.connected.load(Ordering::SeqCst) {
                return Err(self.lost());
            }
            pending.insert(call, sender);
        }

        if let Err(e) = self.send(&request(call)) {
            tracing::debug!(remote = %self.name, "Couldn't send request: {e}");
            self.shared.lose();
            return Err(self.lost());
        }

        match receiver.recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(self.lost()),
        }
    }
}

fn read_responses<R: Read>(mut reader: R, shared: &Shared) {
    loop {
        match read_frame::<_, Response>(&mut reader) {
            Ok(Some(Response::Negotiated { call, accepted })) => {
                shared.route(call, Response::Negotiated { call, accepted });
            }
            Ok(Some(Response::Result { call, outcome })) => {
                shared.route(call, Response::Result { call, outcome });
            }
            Ok(Some(Response::Error {
                call: Some(call),
                message,
            })) => {
                shared.route(
                    call,
                    Response::Error {
                        call: Some(call),
                        message,
                    },
                );
            }
            Ok(Some(Response::Error { call: None, message })) => {
                tracing::error!(remote = %shared.name, "Remote reported a fatal error: {message}");
                break;
            }
            Ok(Some(other)) => tracing::warn!(remote = %shared.name, "Unexpected response {other:?}"),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(remote = %shared.name, "Reading from remote failed: {e}");
                break;
            }
        }
    }
    shared.lose();
}

impl TaskInvoker for ClusterConnection {
    fn name(&self) -> &str {
        &self.name
    }

    fn environment(&self) -> &EnvironmentProperties {
        &self.environment
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn negotiate_duplicates(&self, requested: usize) -> Result<usize, ClusterError> {
        match self.call(|call| Request::Negotiate { call, requested })? {
            Response::Negotiated { accepted, .. } => Ok(accepted.min(requested)),
            Response::Error { message, .. } => Err(ClusterError::Remote {
                remote: self.name.clone(),
                message,
            }),
            other => Err(ClusterError::Protocol(format!("unexpected response {other:?}"))),
        }
    }

    fn invoke(&self, factory: &Snapshot, index: usize) -> Result<RemoteOutcome, ClusterError> {
        let response = self.call(|call| Request::Run {
            call,
            factory: factory.clone(),
            index,
        })?;

        match response {
            Response::Result { outcome, .. } => Ok(outcome),
            Response::Error { message, .. } => Err(ClusterError::Remote {
                remote: self.name.clone(),
                message,
            }),
            other => Err(ClusterError::Protocol(format!("unexpected response {other:?}"))),
        }
    }

    fn on_connection_lost(&self, listener: ConnectionLostListener) {
        let mut listeners = lock(&self.shared.listeners);
        if self.shared.notified.load(Ordering::SeqCst) {
            listener(&self.name);
        } else {
            listeners.push(listener);
        }
    }

    fn cancel_all(&self) {
        let calls: Vec<u64> = lock(&self.shared.pending)
            .drain()
            .map(|(call, sender)| {
                let _ = sender.send(Err(ClusterError::Cancelled(self.name.clone())));
                call
            })
            .collect();
        for call in calls {
            if let Err(e) = self.send(&Request::Cancel { call }) {
                tracing::debug!(remote = %self.name, "Couldn't send cancel: {e}");
                break;
            }
        }
    }
}

impl Drop for ClusterConnection {
    fn drop(&mut self) {
        if self.is_connected() {
            let _ = self.send(&Request::Goodbye);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{SocketAddr, TcpListener};
    use std::thread;
    use std::time::Duration;

    use super::*;

    /// Completes the handshake, then reads requests without answering any.
    fn silent_remote() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap();

        thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut reader = stream.try_clone().unwrap();
            let mut writer = stream;

            read_frame::<_, Request>(&mut reader).unwrap();
            let welcome = Response::Welcome {
                version: PROTOCOL_VERSION,
                name: "silent".into(),
                environment: EnvironmentProperties::new(),
                capacity: 1,
            };
            write_frame(&mut writer, &welcome).unwrap();
            while let Ok(Some(_)) = read_frame::<_, Request>(&mut reader) {}
        });

        address
    }

    #[test]
    fn test_cancel_all_reports_cancellation() {
        let connection = Arc::new(ClusterConnection::connect(silent_remote()).unwrap());

        let calling = connection.clone();
        let pending = thread::spawn(move || calling.negotiate_duplicates(1));
        while lock(&connection.shared.pending).is_empty() {
            thread::sleep(Duration::from_millis(5));
        }
        connection.cancel_all();

        let result = pending.join().unwrap();
        assert!(matches!(result, Err(ClusterError::Cancelled(ref name)) if name == "silent"));
        assert!(connection.is_connected());
    }

    #[test]
    fn test_closed_stream_reports_loss() {
        let connection = Arc::new(ClusterConnection::connect(silent_remote()).unwrap());
        connection.shared.lose();

        let result = connection.negotiate_duplicates(1);
        assert!(matches!(result, Err(ClusterError::ConnectionLost(ref name)) if name == "silent"));
        assert!(!connection.is_connected());
    }
}
