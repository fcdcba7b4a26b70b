//! The session engine: handshake, history retrieval, teardown.
//!
//! The protocol is strictly half duplex. Every operation sends, then awaits
//! exactly one reassembled response under a per-message timeout; there is
//! never more than one request in flight, and nothing is retried here.

use crate::constants::{HISTORY_PAGES, PAGE_PART_SIZE, PAGE_PARTS, PAGE_SIZE, RECEIVE_TIMEOUT};
use crate::error::LinkError;
use crate::message::{CompletionMode, IngestOutcome, MessageBuffer};
use crate::packet::{
    Command, ControlCode, Framer, GET_END, GET_MAGIC, GET_QUERY, GET_WRITE, PROBE, READ_HISTORY,
    Response, control_packet,
};
use crate::records::{Page, PumpModel};
use bytes::Bytes;
use num_enum::FromPrimitive;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

const ACK_ERROR: &str = "Expected ACK during connect:";

/// The byte-stream transport below the engine.
///
/// `receive` may resolve to an empty buffer to signal "no data yet"; the
/// engine keeps waiting. Implementations wrap the actual HID handle.
pub trait Transport {
    async fn send(&mut self, frame: &[u8]) -> Result<(), LinkError>;
    async fn receive(&mut self) -> Result<Bytes, LinkError>;
}

/// A session against one pump through a Contour Next Link bridge.
pub struct ContourLink<T: Transport> {
    transport: T,
    framer: Framer,
    model: Option<PumpModel>,
}

impl<T: Transport> ContourLink<T> {
    pub fn new(transport: T, serial: &str) -> Result<Self, LinkError> {
        Ok(Self {
            transport,
            framer: Framer::new(serial)?,
            model: None,
        })
    }

    /// The model identified by [`ContourLink::connect`], if any.
    pub fn model(&self) -> Option<&PumpModel> {
        self.model.as_ref()
    }

    /// Await one logical message under the given completion policy.
    async fn read_message(&mut self, mode: CompletionMode) -> Result<Bytes, LinkError> {
        let assembled = timeout(RECEIVE_TIMEOUT, async {
            let mut message = MessageBuffer::new();
            loop {
                let frame = self.transport.receive().await?;
                if frame.is_empty() {
                    continue;
                }
                trace!(frame = %hex::encode(&frame), "frame received");
                if message.ingest(&frame, mode)? == IngestOutcome::Complete {
                    return Ok::<_, LinkError>(message.into_message());
                }
            }
        })
        .await??;
        Ok(assembled)
    }

    /// Send one frame and await its decoded response.
    async fn execute<R>(
        &mut self,
        command: &Command<R>,
        mode: CompletionMode,
    ) -> Result<Response<R>, LinkError> {
        self.transport.send(&command.frame).await?;
        let message = self.read_message(mode).await?;
        let record_type = *message.first().ok_or(LinkError::InsufficientData {
            expected: 1,
            actual: 0,
        })?;
        let value = (command.parse)(&message)?;
        Ok(Response {
            record_type: ControlCode::from_primitive(record_type),
            value,
        })
    }

    /// Send a bare control frame and return the response record type.
    async fn execute_control(
        &mut self,
        bytes: &[u8],
        mode: CompletionMode,
    ) -> Result<ControlCode, LinkError> {
        self.transport.send(&control_packet(bytes)).await?;
        let message = self.read_message(mode).await?;
        let record_type = *message.first().ok_or(LinkError::InsufficientData {
            expected: 1,
            actual: 0,
        })?;
        Ok(ControlCode::from_primitive(record_type))
    }

    fn expect_ack(record: ControlCode, step: &str) -> Result<(), LinkError> {
        if record == ControlCode::Ack {
            Ok(())
        } else {
            Err(LinkError::Protocol(format!("{ACK_ERROR}{step}")))
        }
    }

    /// Establish remote-command mode on the bridge, open the pump session and
    /// identify the model. Steps run strictly in order; the first failure
    /// aborts the handshake.
    pub async fn connect(&mut self) -> Result<PumpModel, LinkError> {
        debug!("probing meter interface");
        self.execute_control(&[PROBE], CompletionMode::WaitForEnq)
            .await?;

        let record = self
            .execute_control(&[u8::from(ControlCode::Nak)], CompletionMode::Standard)
            .await?;
        if record != ControlCode::Eot {
            return Err(LinkError::Protocol("Expected EOT.".into()));
        }

        let record = self
            .execute_control(&[u8::from(ControlCode::Enq)], CompletionMode::Standard)
            .await?;
        Self::expect_ack(record, "ENQ")?;

        let record = self
            .execute_control(&GET_WRITE, CompletionMode::Standard)
            .await?;
        Self::expect_ack(record, "WRITE")?;

        let record = self
            .execute_control(&GET_QUERY, CompletionMode::Standard)
            .await?;
        Self::expect_ack(record, "QUERY")?;

        let record = self
            .execute_control(&GET_MAGIC, CompletionMode::Standard)
            .await?;
        Self::expect_ack(record, "MAGIC")?;
        debug!("bridge in remote-command mode");

        let open = self.framer.open_connection()?;
        self.execute(&open, CompletionMode::Standard).await?;

        let query = self.framer.read_model()?;
        let response = self.execute(&query, CompletionMode::Standard).await?;
        let model = PumpModel::new(response.value);
        info!(model = %model, "pump identified");
        self.model = Some(model.clone());
        Ok(model)
    }

    /// Read one 1024-byte history page as 4 consecutive 256-byte parts.
    /// All-or-nothing: any failed part aborts the whole page.
    pub async fn read_history_page(&mut self, page: u8) -> Result<Page, LinkError> {
        let paged = self.framer.read_page(READ_HISTORY, page)?;
        self.transport.send(&paged.command).await?;
        self.transport.send(&paged.padding).await?;

        let mut buffer = [0u8; PAGE_SIZE];
        for part in 0..PAGE_PARTS {
            let message = self.read_message(CompletionMode::RemoteCommand).await?;
            let slice = (paged.parse)(&message)?;
            buffer[part * PAGE_PART_SIZE..(part + 1) * PAGE_PART_SIZE].copy_from_slice(&slice);
            debug!(page, part, "page part received");
        }
        Ok(Page::new(buffer))
    }

    /// Retrieve the session's history pages, most recent first.
    pub async fn fetch_history(&mut self) -> Result<Vec<Page>, LinkError> {
        let trigger = self.framer.send_message(READ_HISTORY)?;
        let mut pages = Vec::with_capacity(HISTORY_PAGES as usize);
        for page in 0..HISTORY_PAGES {
            self.execute(&trigger, CompletionMode::WaitForEnq).await?;
            pages.push(self.read_history_page(page).await?);
        }
        info!(pages = pages.len(), "history retrieved");
        Ok(pages)
    }

    /// Leave remote-command mode so the bridge accepts a future session.
    /// Teardown is best effort; failed steps are logged and skipped.
    pub async fn close(&mut self) -> Result<(), LinkError> {
        let eot = [u8::from(ControlCode::Eot)];
        let steps: [(&str, &[u8]); 4] = [
            ("WRITE", &GET_WRITE),
            ("QUERY", &GET_QUERY),
            ("END", &GET_END),
            ("EOT", &eot),
        ];
        for (step, bytes) in steps {
            if let Err(error) = self.execute_control(bytes, CompletionMode::Standard).await {
                warn!(step, %error, "teardown step failed");
            }
        }
        debug!("session closed");
        Ok(())
    }
}
