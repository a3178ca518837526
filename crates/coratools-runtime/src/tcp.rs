//! TCP transport task
//!
//! Connects to the server, performs the logon handshake on session 0 and then
//! shuttles frames: inbound frames are decoded and posted to the router as
//! [`TransportEvent::Message`], outbound messages from the router's channel are
//! framed and written. Every way the connection can end is reported to the
//! router exactly once as [`TransportEvent::Failed`].

use std::io;

use coratools_core::protocol::codes::{HELLO_ACK, HELLO_CMD};
use coratools_core::protocol::{encode_frame, FrameDecoder, Message, MessageWriter};
use coratools_core::{
    ComponentId, ConnectionConfig, CoraError, Event, EventSender, InterfaceVersion, MessageError,
    Result, SessionFailure, SessionNo, TransportEvent, TransportTask,
};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const READ_BUFFER_LEN: usize = 8 * 1024;

// ----------------------------------------------------------------------------
// Link Errors
// ----------------------------------------------------------------------------

/// Ways the connection can end, before they are reported to the router
#[derive(Debug, thiserror::Error)]
enum LinkError {
    #[error("Could not connect to {address}: {source}")]
    Connect { address: String, source: io::Error },
    #[error("Timed out {0}")]
    Timeout(&'static str),
    #[error("Logon refused: {0}")]
    Refused(SessionFailure),
    #[error("Connection closed by server")]
    Closed,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Frame error: {0}")]
    Frame(#[from] MessageError),
}

impl LinkError {
    fn failure(&self) -> SessionFailure {
        match self {
            LinkError::Connect { .. } | LinkError::Timeout(_) => SessionFailure::ConnectionFailed,
            LinkError::Refused(failure) => *failure,
            LinkError::Closed | LinkError::Io(_) | LinkError::Frame(_) => {
                SessionFailure::SessionBroken
            }
        }
    }
}

// ----------------------------------------------------------------------------
// Handshake
// ----------------------------------------------------------------------------

/// Logon command carried on session 0
pub fn hello_message(config: &ConnectionConfig) -> Message {
    let mut body = MessageWriter::new();
    body.add_string(&config.application_name)
        .add_string(&config.logon_name)
        .add_string(&config.logon_password);
    body.finish(SessionNo::new(0), HELLO_CMD)
}

/// Interpret a logon acknowledgement
pub fn parse_hello_ack(message: &Message) -> core::result::Result<InterfaceVersion, SessionFailure> {
    let mut reader = message.reader();
    let code = reader.read_u4().map_err(|_| SessionFailure::Unknown)?;
    if let Some(failure) = SessionFailure::from_hello_code(code) {
        return Err(failure);
    }
    let mut parts = [0u16; 4];
    for part in parts.iter_mut() {
        *part = reader.read_u2().map_err(|_| SessionFailure::Unknown)?;
    }
    Ok(InterfaceVersion::new(parts[0], parts[1], parts[2], parts[3]))
}

// ----------------------------------------------------------------------------
// TCP Transport Task
// ----------------------------------------------------------------------------

pub struct TcpTransport {
    config: ConnectionConfig,
    events: Option<EventSender>,
    router: Option<ComponentId>,
    outbound: Option<mpsc::UnboundedReceiver<Message>>,
}

impl TcpTransport {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            config,
            events: None,
            router: None,
            outbound: None,
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn connect(&self) -> core::result::Result<TcpStream, LinkError> {
        let address = self.config.address.clone();
        debug!(%address, "Connecting");
        let stream = timeout(self.config.connect_timeout(), TcpStream::connect(&address))
            .await
            .map_err(|_| LinkError::Timeout("connecting"))?
            .map_err(|source| LinkError::Connect {
                address: address.clone(),
                source,
            })?;
        stream.set_nodelay(true)?;
        Ok(stream)
    }

    /// Send the logon and wait for its acknowledgement
    async fn handshake(
        &self,
        stream: &mut TcpStream,
        decoder: &mut FrameDecoder,
    ) -> core::result::Result<InterfaceVersion, LinkError> {
        stream.write_all(&encode_frame(&hello_message(&self.config))?).await?;
        let wait = async {
            loop {
                let message = read_message(stream, decoder).await?;
                if message.session_no.value() == 0 && message.message_type == HELLO_ACK {
                    return parse_hello_ack(&message).map_err(LinkError::Refused);
                }
                debug!(message_type = message.message_type, "Ignoring message before logon");
            }
        };
        timeout(self.config.connect_timeout(), wait)
            .await
            .map_err(|_| LinkError::Timeout("waiting for logon"))?
    }

    /// Pump frames both ways until the link ends or the router goes away
    async fn relay(
        &self,
        stream: TcpStream,
        mut decoder: FrameDecoder,
        events: &EventSender,
        router: ComponentId,
        outbound: &mut mpsc::UnboundedReceiver<Message>,
    ) -> core::result::Result<(), LinkError> {
        let (mut reader, mut writer) = stream.into_split();
        let mut buffer = vec![0u8; READ_BUFFER_LEN];
        loop {
            // Drain frames already buffered (the logon read may have overrun)
            while let Some(message) = decoder.next_message()? {
                trace!(
                    session_no = message.session_no.value(),
                    message_type = message.message_type,
                    "Inbound message"
                );
                if post(events, router, TransportEvent::Message(message)).is_err() {
                    return Ok(());
                }
            }

            tokio::select! {
                read = reader.read(&mut buffer) => {
                    let count = read?;
                    if count == 0 {
                        return Err(LinkError::Closed);
                    }
                    decoder.extend(&buffer[..count]);
                }
                next = outbound.recv() => {
                    let Some(message) = next else {
                        debug!("Outbound channel closed");
                        return Ok(());
                    };
                    let frame = encode_frame(&message)?;
                    trace!(
                        session_no = message.session_no.value(),
                        message_type = message.message_type,
                        frame = %hex::encode(&frame[..frame.len().min(32)]),
                        "Outbound message"
                    );
                    writer.write_all(&frame).await?;
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl TransportTask for TcpTransport {
    fn attach_channels(
        &mut self,
        events: EventSender,
        router: ComponentId,
        outbound: mpsc::UnboundedReceiver<Message>,
    ) -> Result<()> {
        if self.events.is_some() || self.outbound.is_some() {
            return Err(CoraError::config_error("TCP transport channels already attached"));
        }
        self.events = Some(events);
        self.router = Some(router);
        self.outbound = Some(outbound);
        Ok(())
    }

    async fn run(&mut self) -> Result<()> {
        let (Some(events), Some(router), Some(mut outbound)) =
            (self.events.take(), self.router, self.outbound.take())
        else {
            return Err(CoraError::config_error(
                "TCP transport started without attached channels",
            ));
        };

        let mut decoder = FrameDecoder::new();
        let mut stream = match self.connect().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(address = %self.config.address, "{err}");
                let _ = post(&events, router, TransportEvent::Failed(err.failure()));
                return Ok(());
            }
        };

        let version = match self.handshake(&mut stream, &mut decoder).await {
            Ok(version) => version,
            Err(err) => {
                warn!(address = %self.config.address, "Logon failed: {err}");
                let _ = post(&events, router, TransportEvent::Failed(err.failure()));
                return Ok(());
            }
        };
        info!(address = %self.config.address, %version, "Connected");
        if post(&events, router, TransportEvent::Connected { interface_version: version }).is_err() {
            return Ok(());
        }

        match self
            .relay(stream, decoder, &events, router, &mut outbound)
            .await
        {
            Ok(()) => debug!("TCP transport stopped"),
            Err(err) => {
                warn!(address = %self.config.address, "Connection lost: {err}");
                let _ = post(&events, router, TransportEvent::Failed(err.failure()));
            }
        }
        Ok(())
    }

    fn transport_name(&self) -> &'static str {
        "tcp"
    }
}

// ----------------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------------

fn post(
    events: &EventSender,
    router: ComponentId,
    event: TransportEvent,
) -> core::result::Result<(), ()> {
    events.post(router, Event::Transport(event)).map_err(|_| {
        debug!("Event queue closed, transport stopping");
    })
}

/// Read until the decoder yields one complete message
async fn read_message<R>(
    stream: &mut R,
    decoder: &mut FrameDecoder,
) -> core::result::Result<Message, LinkError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; READ_BUFFER_LEN];
    loop {
        if let Some(message) = decoder.next_message()? {
            return Ok(message);
        }
        let count = stream.read(&mut buffer).await?;
        if count == 0 {
            return Err(LinkError::Closed);
        }
        decoder.extend(&buffer[..count]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coratools_core::protocol::codes::hello;

    fn ack(code: u32, version: [u16; 4]) -> Message {
        let mut body = MessageWriter::new();
        body.add_u4(code);
        for part in version {
            body.add_u2(part);
        }
        body.finish(SessionNo::new(0), HELLO_ACK)
    }

    #[test]
    fn test_hello_carries_credentials() {
        let config = ConnectionConfig {
            logon_name: "admin".to_string(),
            logon_password: "secret".to_string(),
            ..ConnectionConfig::default()
        };
        let message = hello_message(&config);
        assert_eq!(message.session_no.value(), 0);
        let mut reader = message.reader();
        assert_eq!(reader.read_string().unwrap(), "coratools");
        assert_eq!(reader.read_string().unwrap(), "admin");
        assert_eq!(reader.read_string().unwrap(), "secret");
        assert!(reader.is_exhausted());
    }

    #[test]
    fn test_hello_ack_codes() {
        assert_eq!(
            parse_hello_ack(&ack(hello::OK, [1, 3, 6, 0])),
            Ok(InterfaceVersion::new(1, 3, 6, 0))
        );
        assert_eq!(
            parse_hello_ack(&ack(hello::INVALID_LOGON, [0; 4])),
            Err(SessionFailure::InvalidLogon)
        );
        assert_eq!(parse_hello_ack(&ack(99, [0; 4])), Err(SessionFailure::Unknown));
        let truncated = Message::new(SessionNo::new(0), HELLO_ACK, 1u32.to_be_bytes().to_vec());
        assert_eq!(parse_hello_ack(&truncated), Err(SessionFailure::Unknown));
    }

    #[test]
    fn test_link_errors_map_to_session_failures() {
        assert_eq!(LinkError::Timeout("connecting").failure(), SessionFailure::ConnectionFailed);
        assert_eq!(LinkError::Closed.failure(), SessionFailure::SessionBroken);
        assert_eq!(
            LinkError::Refused(SessionFailure::SecurityBlocked).failure(),
            SessionFailure::SecurityBlocked
        );
    }

    #[tokio::test]
    async fn test_read_message_spans_reads() {
        let frame = encode_frame(&ack(hello::OK, [1, 4, 1, 0])).unwrap();
        let mut stream = tokio_test::io::Builder::new()
            .read(&frame[..5])
            .read(&frame[5..])
            .build();
        let mut decoder = FrameDecoder::new();
        let message = read_message(&mut stream, &mut decoder).await.unwrap();
        assert_eq!(message.message_type, HELLO_ACK);
    }
}
