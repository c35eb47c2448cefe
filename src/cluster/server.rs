use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crate::cluster::protocol::{PROTOCOL_VERSION, RemoteOutcome, Request, Response, read_frame, write_frame};
use crate::codec::{CodecRegistry, Snapshot};
use crate::core::lock;
use crate::engine::{InnerTaskContext, TokenPool, run_inner};
use crate::environment::EnvironmentProperties;
use crate::error::ClusterError;

/// Remote end of a cluster connection. Runs inner task duplicates sent by
/// [`ClusterConnection`](crate::cluster::ClusterConnection)s.
pub struct ClusterServer {
    name: String,
    environment: Arc<EnvironmentProperties>,
    registry: Arc<CodecRegistry>,
    tokens: Arc<TokenPool>,
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

impl ClusterServer {
    /// `capacity` bounds both the duplicates accepted per negotiation and the
    /// computation tokens available to them.
    pub fn new(
        name: impl Into<String>,
        environment: EnvironmentProperties,
        registry: CodecRegistry,
        capacity: usize,
    ) -> Self {
        Self {
            name: name.into(),
            environment: Arc::new(environment),
            registry: Arc::new(registry),
            tokens: TokenPool::new(capacity.max(1)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> usize {
        self.tokens.capacity()
    }

    /// Accepts connections on a background thread, one thread per client.
    pub fn serve(self: Arc<Self>, listener: TcpListener) -> JoinHandle<()> {
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        tracing::warn!(server = %self.name, "Couldn't accept a connection: {e}");
                        continue;
                    }
                };

                let server = self.clone();
                std::thread::spawn(move || {
                    if let Err(e) = server.serve_tcp(stream) {
                        tracing::warn!(server = %server.name, "Connection ended with an error: {e}");
                    }
                });
            }
        })
    }

    fn serve_tcp(&self, stream: TcpStream) -> Result<(), ClusterError> {
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?;
        let span = tracing::info_span!("client", %peer);
        let _enter = span.enter();
        self.serve_connection(stream.try_clone()?, stream)
    }

    /// Serves one client until it says goodbye or the stream ends.
    pub fn serve_connection<R, W>(&self, mut reader: R, writer: W) -> Result<(), ClusterError>
    where
        R: Read,
        W: Write + Send + 'static,
    {
        let writer: SharedWriter = Arc::new(Mutex::new(Box::new(writer)));

        match read_frame::<_, Request>(&mut reader)? {
            Some(Request::Hello { version }) => {
                if version != PROTOCOL_VERSION {
                    tracing::warn!(version, "Client speaks another protocol version");
                }
                reply(
                    &writer,
                    &Response::Welcome {
                        version: PROTOCOL_VERSION,
                        name: self.name.clone(),
                        environment: (*self.environment).clone(),
                        capacity: self.capacity(),
                    },
                )?;
            }
            Some(other) => {
                let message = format!("expected a hello, got {other:?}");
                reply(
                    &writer,
                    &Response::Error {
                        call: None,
                        message: message.clone(),
                    },
                )?;
                return Err(ClusterError::Protocol(message));
            }
            None => return Ok(()),
        }

        tracing::debug!("Client connected");
        let running: Arc<Mutex<HashMap<u64, Arc<AtomicBool>>>> = Arc::default();

        let result = loop {
            let request = match read_frame::<_, Request>(&mut reader) {
                Ok(Some(request)) => request,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            };

            match request {
                Request::Negotiate { call, requested } => {
                    let accepted = requested.min(self.capacity());
                    reply(&writer, &Response::Negotiated { call, accepted })?;
                }
                Request::Run { call, factory, index } => {
                    let cancelled = Arc::new(AtomicBool::new(false));
                    lock(&running).insert(call, cancelled.clone());
                    self.run(call, factory, index, cancelled, writer.clone(), running.clone());
                }
                Request::Cancel { call } => {
                    if let Some(flag) = lock(&running).get(&call) {
                        flag.store(true, Ordering::SeqCst);
                    }
                    self.tokens.wake_all();
                }
                Request::Goodbye => break Ok(()),
                Request::Hello { .. } => {
                    reply(
                        &writer,
                        &Response::Error {
                            call: None,
                            message: "handshake repeated".into(),
                        },
                    )?;
                }
            }
        };

        for flag in lock(&running).values() {
            flag.store(true, Ordering::SeqCst);
        }
        self.tokens.wake_all();
        tracing::debug!("Client disconnected");

        result
    }

    fn run(
        &self,
        call: u64,
        snapshot: Snapshot,
        index: usize,
        cancelled: Arc<AtomicBool>,
        writer: SharedWriter,
        running: Arc<Mutex<HashMap<u64, Arc<AtomicBool>>>>,
    ) {
        let factory = match self.registry.decode_inner_factory(&snapshot) {
            Ok(factory) => factory,
            Err(e) => {
                lock(&running).remove(&call);
                let response = Response::Error {
                    call: Some(call),
                    message: e.to_string(),
                };
                if let Err(e) = reply(&writer, &response) {
                    tracing::debug!(call, "Couldn't reply: {e}");
                }
                return;
            }
        };

        let name = self.name.clone();
        let environment = self.environment.clone();
        let tokens = self.tokens.clone();

        std::thread::spawn(move || {
            let requested = factory.requested_tokens().min(tokens.capacity());
            let outcome = match tokens.acquire(tokens.holder(), requested, &cancelled) {
                Some(_token) => {
                    let ctx = InnerTaskContext::new(index, name, environment, cancelled);
                    match run_inner(factory.as_ref(), &ctx) {
                        Ok(value) => RemoteOutcome::Success(value),
                        Err(e) => RemoteOutcome::Failed(format!("{e:#}")),
                    }
                }
                None => RemoteOutcome::Failed("cancelled".into()),
            };

            lock(&running).remove(&call);
            if let Err(e) = reply(&writer, &Response::Result { call, outcome }) {
                tracing::debug!(call, "Couldn't reply: {e}");
            }
        });
    }
}

fn reply(writer: &SharedWriter, response: &Response) -> Result<(), ClusterError> {
    let mut writer = lock(writer);
    write_frame(&mut *writer, response)
}
