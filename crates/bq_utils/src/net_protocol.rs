//! Read/write protocol for messages exchanged with the bucket queue.
//! The first 4 bytes of any message are its size in big-endian order; the rest is the
//! serde-serialized JSON body.

pub mod entity;
pub mod queue;
pub mod resources;
pub mod results;
pub mod workers;

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

/// Messages larger than this are refused rather than buffered.
pub const MAX_MESSAGE_SIZE: u32 = 64 * 1024 * 1024;

pub mod health {
    use serde_derive::{Deserialize, Serialize};

    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct Health {
        pub healthy: bool,
        pub version: String,
    }

    pub fn healthy() -> Health {
        Health {
            healthy: true,
            version: crate::VERSION.to_string(),
        }
    }
}

/// Reads one message from an async stream.
pub async fn async_read<R, T>(reader: &mut R) -> Result<T, io::Error>
where
    R: tokio::io::AsyncRead + Unpin,
    T: serde::de::DeserializeOwned,
{
    let mut msg_size_buf = [0; 4];
    reader.read_exact(&mut msg_size_buf).await?;
    let msg_size = u32::from_be_bytes(msg_size_buf);

    if msg_size > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("message of {msg_size} bytes exceeds the maximum of {MAX_MESSAGE_SIZE}"),
        ));
    }

    let mut msg_buf = vec![0; msg_size as usize];
    reader.read_exact(&mut msg_buf).await?;

    let msg = serde_json::from_slice(&msg_buf)?;
    Ok(msg)
}

/// Writes one message to an async stream.
pub async fn async_write<W, T>(writer: &mut W, msg: &T) -> Result<(), io::Error>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: serde::Serialize,
{
    let msg_json = serde_json::to_vec(msg)?;

    let msg_size = u32::try_from(msg_json.len())
        .ok()
        .filter(|size| *size <= MAX_MESSAGE_SIZE)
        .ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("message of {} bytes is too large", msg_json.len()),
            )
        })?;

    let mut msg_buf = Vec::with_capacity(4 + msg_json.len());
    msg_buf.extend_from_slice(&msg_size.to_be_bytes());
    msg_buf.extend_from_slice(&msg_json);
    writer.write_all(&msg_buf).await?;
    writer.flush().await?;
    Ok(())
}
