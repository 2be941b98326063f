use chrono::{DateTime, NaiveDateTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{ExecError, Result};
use crate::protocol::command::{ParamType, ParamValue};
use crate::protocol::ACK;

/// Upper bound on a single frame, so a corrupt length prefix cannot make us
/// allocate without limit.
pub const MAX_FRAME_LEN: usize = 256 * 1024 * 1024;

/// Framing over a raw byte stream.
///
/// Strings and arrays travel as frames: a little-endian `u32` byte length
/// followed by the payload. Fixed-width scalars are written raw in
/// little-endian order. The same encoding is used over every transport.
#[derive(Debug)]
pub struct MessageStream<S> {
    stream: S,
}

fn map_read_error(e: std::io::Error) -> ExecError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        ExecError::ConnectionClosed
    } else {
        ExecError::Io(e)
    }
}

impl<S> MessageStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }

    pub async fn send_frame(&mut self, payload: &[u8]) -> Result<()> {
        if payload.len() > MAX_FRAME_LEN {
            return Err(ExecError::Protocol(format!(
                "frame of {} bytes exceeds the {} byte limit",
                payload.len(),
                MAX_FRAME_LEN
            )));
        }
        self.stream.write_u32_le(payload.len() as u32).await?;
        self.stream.write_all(payload).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv_frame(&mut self) -> Result<Vec<u8>> {
        let len = self.stream.read_u32_le().await.map_err(map_read_error)? as usize;
        if len > MAX_FRAME_LEN {
            return Err(ExecError::Protocol(format!(
                "frame length {} exceeds the {} byte limit",
                len, MAX_FRAME_LEN
            )));
        }
        let mut payload = vec![0u8; len];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(map_read_error)?;
        Ok(payload)
    }

    pub async fn send_str(&mut self, message: &str) -> Result<()> {
        tracing::trace!(message, "send");
        self.send_frame(message.as_bytes()).await
    }

    pub async fn recv_str(&mut self) -> Result<String> {
        let payload = self.recv_frame().await?;
        let message = String::from_utf8(payload)
            .map_err(|_| ExecError::Protocol("message is not valid UTF-8".to_string()))?;
        tracing::trace!(message = %message, "recv");
        Ok(message)
    }

    /// Read one message and fail unless it is exactly `expected`.
    pub async fn expect(&mut self, expected: &str) -> Result<()> {
        let message = self.recv_str().await?;
        if message == expected {
            Ok(())
        } else {
            Err(ExecError::Protocol(format!(
                "expected {} but received '{}'",
                expected, message
            )))
        }
    }

    pub async fn expect_ack(&mut self) -> Result<()> {
        self.expect(ACK).await
    }

    pub async fn send_i32(&mut self, value: i32) -> Result<()> {
        self.stream.write_i32_le(value).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv_i32(&mut self) -> Result<i32> {
        self.stream.read_i32_le().await.map_err(map_read_error)
    }

    pub async fn send_f64(&mut self, value: f64) -> Result<()> {
        self.stream.write_f64_le(value).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv_f64(&mut self) -> Result<f64> {
        self.stream.read_f64_le().await.map_err(map_read_error)
    }

    pub async fn send_bool(&mut self, value: bool) -> Result<()> {
        self.stream.write_u8(u8::from(value)).await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv_bool(&mut self) -> Result<bool> {
        Ok(self.stream.read_u8().await.map_err(map_read_error)? != 0)
    }

    pub async fn send_date(&mut self, value: NaiveDateTime) -> Result<()> {
        self.stream
            .write_i64_le(value.and_utc().timestamp_millis())
            .await?;
        self.stream.flush().await?;
        Ok(())
    }

    pub async fn recv_date(&mut self) -> Result<NaiveDateTime> {
        let millis = self.stream.read_i64_le().await.map_err(map_read_error)?;
        date_from_millis(millis)
    }

    /// Write a parameter value using its type's encoding.
    pub async fn send_value(&mut self, value: &ParamValue) -> Result<()> {
        match value {
            ParamValue::Integer(v) => self.send_i32(*v).await,
            ParamValue::Double(v) => self.send_f64(*v).await,
            ParamValue::Boolean(v) => self.send_bool(*v).await,
            ParamValue::Date(v) => self.send_date(*v).await,
            ParamValue::String(v) => self.send_str(v).await,
            ParamValue::IntArray(values) => {
                let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                self.send_frame(&payload).await
            }
            ParamValue::DoubleArray(values) => {
                let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
                self.send_frame(&payload).await
            }
        }
    }

    /// Read a parameter value of the given type.
    pub async fn recv_value(&mut self, param_type: ParamType) -> Result<ParamValue> {
        Ok(match param_type {
            ParamType::Integer => ParamValue::Integer(self.recv_i32().await?),
            ParamType::Double => ParamValue::Double(self.recv_f64().await?),
            ParamType::Boolean => ParamValue::Boolean(self.recv_bool().await?),
            ParamType::Date => ParamValue::Date(self.recv_date().await?),
            ParamType::String => ParamValue::String(self.recv_str().await?),
            ParamType::IntArray => {
                let payload = self.recv_frame().await?;
                ParamValue::IntArray(unpack(&payload, i32::from_le_bytes)?)
            }
            ParamType::DoubleArray => {
                let payload = self.recv_frame().await?;
                ParamValue::DoubleArray(unpack(&payload, f64::from_le_bytes)?)
            }
        })
    }

    /// Shut down the write half of the underlying stream.
    pub async fn shutdown(&mut self) -> Result<()> {
        self.stream.shutdown().await?;
        Ok(())
    }
}

pub(crate) fn date_from_millis(millis: i64) -> Result<NaiveDateTime> {
    DateTime::from_timestamp_millis(millis)
        .map(|d| d.naive_utc())
        .ok_or_else(|| ExecError::Protocol(format!("date out of range: {} ms", millis)))
}

/// Split a packed little-endian payload into fixed-width values.
pub(crate) fn unpack<T, const N: usize>(payload: &[u8], decode: fn([u8; N]) -> T) -> Result<Vec<T>> {
    if payload.len() % N != 0 {
        return Err(ExecError::Protocol(format!(
            "array payload of {} bytes is not a multiple of {}",
            payload.len(),
            N
        )));
    }
    Ok(payload
        .chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            decode(bytes)
        })
        .collect())
}
