//! Engine side of the provider RPC protocol
//!
//! One [`RpcClient`] owns one stream connection to a provider. Calls are
//! serialised by `&mut self`: a request is written, then responses are read
//! until the one carrying the request id arrives. Every call runs under the
//! caller's [`CallContext`]; a call interrupted half way leaves the stream in
//! an unknown state, so the client refuses further calls afterwards.

use harvest_sdk::errors::EngineError;
use harvest_sdk::manifest::{Endpoint, Transport};
use harvest_sdk::protocol::{
    encode_line, FailureCode, Request, RequestEnvelope, Response, ResponseEnvelope, RpcFailure,
};
use harvest_sdk::types::{
    ConfigureRequest, FetchProgress, FetchSummary, ProviderConfiguration, ProviderSchema,
};
use std::io;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tracing::{debug, warn};

use crate::context::CallContext;

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Event read from a running fetch
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchEvent {
    Progress(FetchProgress),
    Complete(FetchSummary),
}

/// Connection to one provider process
pub struct RpcClient {
    provider: String,
    reader: Lines<BufReader<BoxedReader>>,
    writer: BoxedWriter,
    next_id: u64,
    abandoned: bool,
}

impl RpcClient {
    /// Connect to a provider endpoint
    pub async fn connect(provider: &str, endpoint: &Endpoint) -> io::Result<Self> {
        let (reader, writer): (BoxedReader, BoxedWriter) = match endpoint.transport {
            Transport::Tcp => {
                let stream = tokio::net::TcpStream::connect(&endpoint.address).await?;
                stream.set_nodelay(true)?;
                let (read, write) = stream.into_split();
                (Box::new(read), Box::new(write))
            }
            #[cfg(unix)]
            Transport::Unix => {
                let stream = tokio::net::UnixStream::connect(&endpoint.address).await?;
                let (read, write) = stream.into_split();
                (Box::new(read), Box::new(write))
            }
            #[cfg(not(unix))]
            Transport::Unix => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "unix sockets are not supported on this platform",
                ))
            }
        };

        debug!(
            "Connected to provider '{}' at {} {}",
            provider, endpoint.transport, endpoint.address
        );

        Ok(Self {
            provider: provider.to_string(),
            reader: BufReader::new(reader).lines(),
            writer,
            next_id: 1,
            abandoned: false,
        })
    }

    pub fn provider(&self) -> &str {
        &self.provider
    }

    /// Query the provider's table schema
    pub async fn get_schema(&mut self, ctx: &CallContext) -> Result<ProviderSchema, EngineError> {
        match self.call(ctx, Request::GetSchema).await? {
            Response::Schema { schema } => Ok(schema),
            other => Err(self.unexpected("get_schema", &other)),
        }
    }

    /// Query the provider's rendered sample configuration
    pub async fn get_configuration(
        &mut self,
        ctx: &CallContext,
    ) -> Result<ProviderConfiguration, EngineError> {
        match self.call(ctx, Request::GetConfiguration).await? {
            Response::Configuration { configuration } => Ok(configuration),
            other => Err(self.unexpected("get_configuration", &other)),
        }
    }

    /// Hand the provider the store DSN and its configuration block
    pub async fn configure(
        &mut self,
        ctx: &CallContext,
        request: ConfigureRequest,
    ) -> Result<(), EngineError> {
        match self.call(ctx, Request::Configure { request }).await? {
            Response::Configured => Ok(()),
            other => Err(self.unexpected("configure", &other)),
        }
    }

    /// Start fetching `resources`
    ///
    /// The remaining time of `ctx` is forwarded so the provider stops working
    /// once the caller has given up.
    pub async fn fetch(
        &mut self,
        ctx: &CallContext,
        resources: Vec<String>,
    ) -> Result<FetchStream<'_>, EngineError> {
        let deadline_ms = ctx
            .remaining()
            .map(|remaining| remaining.as_millis().min(u128::from(u64::MAX)) as u64);
        let request = Request::Fetch {
            resources,
            deadline_ms,
        };

        let id = self.send(ctx, &request).await?;
        Ok(FetchStream {
            client: self,
            ctx: ctx.clone(),
            id,
            finished: false,
        })
    }

    async fn call(&mut self, ctx: &CallContext, request: Request) -> Result<Response, EngineError> {
        let operation = request.method();
        let id = self.send(ctx, &request).await?;
        let response = self.receive(ctx, id, operation).await?;
        self.check_failure(operation, ctx, response)
    }

    async fn send(&mut self, ctx: &CallContext, request: &Request) -> Result<u64, EngineError> {
        let operation = request.method();
        if self.abandoned {
            return Err(EngineError::Protocol {
                provider: self.provider.clone(),
                message: format!("connection unusable after an interrupted call, cannot {}", operation),
            });
        }

        let id = self.next_id;
        self.next_id += 1;

        let line = encode_line(&RequestEnvelope {
            id,
            request: request.clone(),
        })
        .map_err(|e| EngineError::Protocol {
            provider: self.provider.clone(),
            message: format!("failed to encode {}: {}", operation, e),
        })?;

        let write = async {
            self.writer.write_all(&line).await?;
            self.writer.flush().await
        };

        match ctx.run(write).await {
            Ok(Ok(())) => Ok(id),
            Ok(Err(e)) => Err(self.connection_lost(operation, e)),
            Err(interrupted) => {
                self.abandoned = true;
                Err(interrupted.into_error(&self.provider, operation))
            }
        }
    }

    async fn receive(
        &mut self,
        ctx: &CallContext,
        id: u64,
        operation: &str,
    ) -> Result<Response, EngineError> {
        loop {
            let line = match ctx.run(self.reader.next_line()).await {
                Ok(Ok(Some(line))) => line,
                Ok(Ok(None)) => {
                    self.abandoned = true;
                    return Err(EngineError::PluginUnavailable {
                        provider: self.provider.clone(),
                        reason: format!("connection closed during {}", operation),
                    });
                }
                Ok(Err(e)) => return Err(self.connection_lost(operation, e)),
                Err(interrupted) => {
                    self.abandoned = true;
                    return Err(interrupted.into_error(&self.provider, operation));
                }
            };

            if line.trim().is_empty() {
                continue;
            }

            let envelope: ResponseEnvelope =
                serde_json::from_str(&line).map_err(|e| EngineError::Protocol {
                    provider: self.provider.clone(),
                    message: format!("malformed response to {}: {}", operation, e),
                })?;

            if envelope.id == id {
                return Ok(envelope.response);
            }

            warn!(
                "Skipping response {} from '{}' while waiting for {}",
                envelope.id, self.provider, id
            );
        }
    }

    fn check_failure(
        &self,
        operation: &str,
        ctx: &CallContext,
        response: Response,
    ) -> Result<Response, EngineError> {
        match response {
            Response::Error { error } => Err(self.failure_to_error(operation, ctx, error)),
            response => Ok(response),
        }
    }

    fn failure_to_error(&self, operation: &str, ctx: &CallContext, failure: RpcFailure) -> EngineError {
        match failure.code {
            FailureCode::DeadlineExceeded => EngineError::DeadlineExceeded {
                provider: self.provider.clone(),
                operation: operation.to_string(),
                elapsed: ctx.elapsed(),
            },
            FailureCode::FetchFailed => EngineError::ProviderFetchFailed {
                provider: self.provider.clone(),
                message: failure.message,
            },
            FailureCode::InvalidRequest | FailureCode::NotConfigured | FailureCode::Internal => {
                EngineError::ProviderRequestFailed {
                    provider: self.provider.clone(),
                    operation: operation.to_string(),
                    message: failure.message,
                }
            }
        }
    }

    fn connection_lost(&mut self, operation: &str, error: io::Error) -> EngineError {
        self.abandoned = true;
        EngineError::PluginUnavailable {
            provider: self.provider.clone(),
            reason: format!("connection lost during {}: {}", operation, error),
        }
    }

    fn unexpected(&self, operation: &str, response: &Response) -> EngineError {
        EngineError::Protocol {
            provider: self.provider.clone(),
            message: format!("unexpected reply to {}: {:?}", operation, response),
        }
    }
}

/// Responses of one running fetch
///
/// Holds the client exclusively until the fetch finishes, so no other call
/// can interleave with it.
pub struct FetchStream<'a> {
    client: &'a mut RpcClient,
    ctx: CallContext,
    id: u64,
    finished: bool,
}

impl FetchStream<'_> {
    /// Next event, `None` once the completion summary has been returned
    pub async fn next_event(&mut self) -> Result<Option<FetchEvent>, EngineError> {
        if self.finished {
            return Ok(None);
        }

        let response = self.client.receive(&self.ctx, self.id, "fetch").await;
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.finished = true;
                return Err(e);
            }
        };

        match response {
            Response::Progress { progress } => Ok(Some(FetchEvent::Progress(progress))),
            Response::FetchComplete { summary } => {
                self.finished = true;
                Ok(Some(FetchEvent::Complete(summary)))
            }
            Response::Error { error } => {
                self.finished = true;
                Err(self.client.failure_to_error("fetch", &self.ctx, error))
            }
            other => {
                self.finished = true;
                Err(self.client.unexpected("fetch", &other))
            }
        }
    }

    /// Drain the stream, reporting progress to `on_progress`
    pub async fn finish<F>(mut self, mut on_progress: F) -> Result<FetchSummary, EngineError>
    where
        F: FnMut(&FetchProgress),
    {
        while let Some(event) = self.next_event().await? {
            match event {
                FetchEvent::Progress(progress) => on_progress(&progress),
                FetchEvent::Complete(summary) => return Ok(summary),
            }
        }

        Err(EngineError::Protocol {
            provider: self.client.provider.clone(),
            message: "fetch ended without a summary".to_string(),
        })
    }
}
