//! Newline-delimited JSON protocol. One request object per line, one reply
//! line per request, in order.

use std::io;
use std::sync::Arc;
use std::time::Instant;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Decoder, Encoder, Framed, LinesCodec, LinesCodecError};
use tracing::debug;
use ulid::Ulid;

use crate::auth::decode_api_token;
use crate::engine::{BookingError, BookingService, parse_timestamp};
use crate::limits::{MAX_LINE_LEN, MAX_VALID_TIMESTAMP_MS, MIN_VALID_TIMESTAMP_MS};
use crate::model::*;
use crate::observability;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Request {
    Hold {
        api_token: String,
        host_email: String,
        start_time: String,
        end_time: String,
        #[serde(default = "default_expiration")]
        expiration: u32,
    },
    Confirm {
        api_token: String,
        hold_id: Ulid,
        host_email: String,
        schedule_token: String,
    },
    Release {
        api_token: String,
        hold_id: Ulid,
    },
    CancelSlot {
        api_token: String,
        slot_id: SlotId,
        host_email: String,
        schedule_token: String,
    },
    Slots {
        api_token: String,
        host_email: String,
        schedule_token: String,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
        #[serde(default)]
        limit: Option<usize>,
    },
}

fn default_expiration() -> u32 {
    DEFAULT_HOLD_MINUTES
}

impl Request {
    pub fn op(&self) -> &'static str {
        match self {
            Request::Hold { .. } => "hold",
            Request::Confirm { .. } => "confirm",
            Request::Release { .. } => "release",
            Request::CancelSlot { .. } => "cancel_slot",
            Request::Slots { .. } => "slots",
        }
    }

    fn api_token(&self) -> &str {
        match self {
            Request::Hold { api_token, .. }
            | Request::Confirm { api_token, .. }
            | Request::Release { api_token, .. }
            | Request::CancelSlot { api_token, .. }
            | Request::Slots { api_token, .. } => api_token,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HoldView {
    pub hold_id: Ulid,
    pub host_email: String,
    pub start_time: String,
    pub end_time: String,
    pub deadline: String,
}

impl From<&Hold> for HoldView {
    fn from(hold: &Hold) -> Self {
        Self {
            hold_id: hold.id,
            host_email: hold.host_email.clone(),
            start_time: format_instant(hold.span.start),
            end_time: format_instant(hold.span.end),
            deadline: format_instant(hold.deadline),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hold: Option<HoldView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<SlotRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<Vec<SlotRecord>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

impl Reply {
    fn ok() -> Self {
        Self {
            status: Status::Ok,
            hold: None,
            slot: None,
            slots: None,
            error: None,
        }
    }

    pub fn error(e: &BookingError) -> Self {
        Self {
            status: Status::Error,
            error: Some(ErrorBody {
                kind: e.kind().to_string(),
                message: e.to_string(),
            }),
            ..Self::ok()
        }
    }
}

async fn execute(service: &BookingService, req: Request) -> Result<Reply, BookingError> {
    let api_token =
        decode_api_token(req.api_token()).ok_or(BookingError::Unauthorized("api token"))?;
    match req {
        Request::Hold {
            host_email,
            start_time,
            end_time,
            expiration,
            ..
        } => {
            let msg = HoldRequest {
                host_email,
                start_time,
                end_time,
                expiration,
            };
            let hold = service.request_hold_message(&msg, &api_token).await?;
            Ok(Reply {
                hold: Some(HoldView::from(&hold)),
                ..Reply::ok()
            })
        }
        Request::Confirm {
            hold_id,
            host_email,
            schedule_token,
            ..
        } => {
            let slot = service
                .confirm(hold_id, &host_email, &schedule_token, &api_token)
                .await?;
            Ok(Reply {
                slot: Some(SlotRecord::from(&slot)),
                ..Reply::ok()
            })
        }
        Request::Release { hold_id, .. } => {
            service.release(hold_id, &api_token).await?;
            Ok(Reply::ok())
        }
        Request::CancelSlot {
            slot_id,
            host_email,
            schedule_token,
            ..
        } => {
            let slot = service
                .cancel_slot(slot_id, &host_email, &schedule_token, &api_token)
                .await?;
            Ok(Reply {
                slot: Some(SlotRecord::from(&slot)),
                ..Reply::ok()
            })
        }
        Request::Slots {
            host_email,
            schedule_token,
            from,
            to,
            limit,
            ..
        } => {
            let window = match (from, to) {
                (None, None) => None,
                (from, to) => {
                    let start = match from {
                        Some(s) => parse_timestamp("from", &s)?,
                        None => MIN_VALID_TIMESTAMP_MS,
                    };
                    let end = match to {
                        Some(s) => parse_timestamp("to", &s)?,
                        None => MAX_VALID_TIMESTAMP_MS,
                    };
                    Some((start, end))
                }
            };
            let slots = service
                .list_slots(&host_email, &schedule_token, &api_token, window, limit)
                .await?;
            Ok(Reply {
                slots: Some(slots.iter().map(SlotRecord::from).collect()),
                ..Reply::ok()
            })
        }
    }
}

/// Handle one request line. Never fails: every problem becomes an error reply.
pub async fn handle_line(service: &BookingService, line: &str) -> Reply {
    let req: Request = match serde_json::from_str(line) {
        Ok(req) => req,
        Err(e) => {
            metrics::counter!(
                observability::REQUESTS_TOTAL,
                "op" => "unknown",
                "status" => "Malformed"
            )
            .increment(1);
            return Reply::error(&BookingError::Malformed(e.to_string()));
        }
    };
    let op = req.op();
    let start = Instant::now();
    let result = execute(service, req).await;
    metrics::histogram!(observability::REQUEST_DURATION_SECONDS, "op" => op)
        .record(start.elapsed().as_secs_f64());
    match result {
        Ok(reply) => {
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => "ok")
                .increment(1);
            reply
        }
        Err(e) => {
            debug!("{op} failed: {e}");
            metrics::counter!(observability::REQUESTS_TOTAL, "op" => op, "status" => e.kind())
                .increment(1);
            Reply::error(&e)
        }
    }
}

fn codec_err(e: LinesCodecError) -> io::Error {
    match e {
        LinesCodecError::Io(e) => e,
        other => io::Error::other(other),
    }
}

enum Inbound {
    Line(String),
    /// A line longer than `MAX_LINE_LEN`. Its bytes are skipped up to the
    /// next newline.
    TooLong,
}

/// `LinesCodec` that yields an oversized line as an item rather than an
/// error, because `Framed` stops reading after the first decode error.
struct RequestCodec(LinesCodec);

impl RequestCodec {
    fn new() -> Self {
        Self(LinesCodec::new_with_max_length(MAX_LINE_LEN))
    }

    fn classify(decoded: Result<Option<String>, LinesCodecError>) -> io::Result<Option<Inbound>> {
        match decoded {
            Ok(line) => Ok(line.map(Inbound::Line)),
            Err(LinesCodecError::MaxLineLengthExceeded) => Ok(Some(Inbound::TooLong)),
            Err(e) => Err(codec_err(e)),
        }
    }
}

impl Decoder for RequestCodec {
    type Item = Inbound;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Inbound>> {
        Self::classify(self.0.decode(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Inbound>> {
        Self::classify(self.0.decode_eof(src))
    }
}

impl Encoder<String> for RequestCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> io::Result<()> {
        self.0.encode(line, dst).map_err(codec_err)
    }
}

/// Serve one client until it disconnects.
pub async fn process_connection<S>(stream: S, service: Arc<BookingService>) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut framed = Framed::new(stream, RequestCodec::new());
    while let Some(inbound) = framed.next().await {
        let reply = match inbound? {
            Inbound::Line(line) if line.trim().is_empty() => continue,
            Inbound::Line(line) => handle_line(&service, &line).await,
            Inbound::TooLong => {
                metrics::counter!(
                    observability::REQUESTS_TOTAL,
                    "op" => "unknown",
                    "status" => "LimitExceeded"
                )
                .increment(1);
                Reply::error(&BookingError::LimitExceeded("request line too long"))
            }
        };
        let json = serde_json::to_string(&reply).map_err(io::Error::other)?;
        framed.send(json).await?;
    }
    Ok(())
}
