use std::fmt;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use vbus_common::clock::TimeSource;
use vbus_common::header::Header;

use crate::error::ConnectionError;

const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConnectionState::Connecting => write!(f, "CONNECTING"),
            ConnectionState::Connected => write!(f, "CONNECTED"),
            ConnectionState::Disconnected => write!(f, "DISCONNECTED"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SourceEvent {
    ConnectionState(ConnectionState),
    Packet(Header),
}

/// One line of the record feed. The header is stamped on receipt.
#[derive(Debug, Deserialize)]
struct FeedFrame {
    channel: u8,
    destination_address: u16,
    source_address: u16,
    protocol_version: u8,
    command: u16,
    #[serde(default)]
    frame_data: Vec<u8>,
}

/// Reads headers from a TCP feed of newline-delimited JSON frames.
///
/// Events are delivered in the order they are read. The stream ends with a
/// `Disconnected` state once the peer closes the connection or a read fails.
pub struct TcpFeedSource {
    address: String,
    clock: Arc<dyn TimeSource>,
}

impl TcpFeedSource {
    pub fn new(address: &str, clock: Arc<dyn TimeSource>) -> Self {
        Self {
            address: address.to_owned(),
            clock,
        }
    }

    pub async fn connect(&self) -> Result<mpsc::Receiver<SourceEvent>, ConnectionError> {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        send_state(&tx, ConnectionState::Connecting).await;

        let stream = TcpStream::connect(&self.address)
            .await
            .map_err(|error| ConnectionError::Stream {
                address: self.address.clone(),
                error,
            })?;

        send_state(&tx, ConnectionState::Connected).await;
        tokio::spawn(read_frames(stream, tx, self.clock.clone()));

        Ok(rx)
    }
}

async fn send_state(tx: &mpsc::Sender<SourceEvent>, state: ConnectionState) {
    if tx.send(SourceEvent::ConnectionState(state)).await.is_err() {
        debug!("record stream receiver dropped");
    }
}

/// Forwards every well-formed frame until EOF, then reports the disconnect.
async fn read_frames<R>(reader: R, tx: mpsc::Sender<SourceEvent>, clock: Arc<dyn TimeSource>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                warn!("record stream read failed: {}", err);
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let frame: FeedFrame = match serde_json::from_str(&line) {
            Ok(frame) => frame,
            Err(err) => {
                warn!("skipping malformed record: {}", err);
                metrics::counter!("vbus_records_malformed_total").increment(1);
                continue;
            }
        };

        let header = Header {
            channel: frame.channel,
            destination_address: frame.destination_address,
            source_address: frame.source_address,
            protocol_version: frame.protocol_version,
            command: frame.command,
            timestamp: clock.now(),
            frame_data: frame.frame_data,
        };
        if tx.send(SourceEvent::Packet(header)).await.is_err() {
            debug!("record stream receiver dropped, closing feed");
            return;
        }
    }

    send_state(&tx, ConnectionState::Disconnected).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use vbus_common::clock::ManualTime;

    fn clock() -> Arc<dyn TimeSource> {
        Arc::new(ManualTime::new(datetime!(2024-03-01 12:00 UTC)))
    }

    #[tokio::test]
    async fn reads_frames_in_order_and_skips_garbage() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let feed = concat!(
                r#"{"channel":0,"destination_address":16,"source_address":17016,"protocol_version":16,"command":256,"frame_data":[215,0]}"#,
                "\n",
                "not json\n",
                "\n",
                r#"{"channel":1,"destination_address":16,"source_address":32273,"protocol_version":16,"command":256}"#,
                "\n",
            );
            socket.write_all(feed.as_bytes()).await.unwrap();
        });

        let source = TcpFeedSource::new(&address, clock());
        let mut rx = source.connect().await.expect("failed to connect");

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }

        assert_eq!(events.len(), 5);
        assert_eq!(
            events[0],
            SourceEvent::ConnectionState(ConnectionState::Connecting)
        );
        assert_eq!(
            events[1],
            SourceEvent::ConnectionState(ConnectionState::Connected)
        );
        match (&events[2], &events[3]) {
            (SourceEvent::Packet(first), SourceEvent::Packet(second)) => {
                assert_eq!(first.id(), "00_0010_4278_10_0100");
                assert_eq!(first.frame_data, vec![215, 0]);
                assert_eq!(first.timestamp, datetime!(2024-03-01 12:00 UTC));
                assert_eq!(second.id(), "01_0010_7E11_10_0100");
                assert!(second.frame_data.is_empty());
            }
            other => panic!("expected two packets, got {:?}", other),
        }
        assert_eq!(
            events[4],
            SourceEvent::ConnectionState(ConnectionState::Disconnected)
        );
    }

    #[tokio::test]
    async fn refused_connection_is_a_connection_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let source = TcpFeedSource::new(&address, clock());
        match source.connect().await {
            Err(ConnectionError::Stream { address: failed, .. }) => assert_eq!(failed, address),
            other => panic!("expected a stream connection error, got {:?}", other.map(|_| ())),
        }
    }
}
