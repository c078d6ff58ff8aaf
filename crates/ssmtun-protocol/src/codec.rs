//! Framing for the control socket
//!
//! Every message is one JSON document behind a 4-byte big-endian length.
//! Framing is delegated to [`LengthDelimitedCodec`]; this layer only adds
//! the JSON step and the frame cap.

use std::io;
use std::marker::PhantomData;

use bytes::{Bytes, BytesMut};
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec, LengthDelimitedCodecError};

/// Upper bound on one control message
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("Frame exceeds {MAX_FRAME_SIZE} bytes")]
    FrameTooLarge,

    #[error("IO error: {0}")]
    Io(io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<io::Error> for CodecError {
    fn from(e: io::Error) -> Self {
        let oversized = e
            .get_ref()
            .is_some_and(|inner| inner.is::<LengthDelimitedCodecError>());
        if oversized {
            CodecError::FrameTooLarge
        } else {
            CodecError::Io(e)
        }
    }
}

/// JSON messages of type `T` over length-prefixed frames
pub struct TunnelCodec<T> {
    frames: LengthDelimitedCodec,
    _message: PhantomData<fn() -> T>,
}

impl<T> TunnelCodec<T> {
    pub fn new() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_SIZE)
                .new_codec(),
            _message: PhantomData,
        }
    }
}

impl<T> Default for TunnelCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for TunnelCodec<T> {
    type Item = T;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, CodecError> {
        match self.frames.decode(src)? {
            Some(frame) => Ok(Some(serde_json::from_slice(&frame)?)),
            None => Ok(None),
        }
    }
}

impl<T: Serialize> Encoder<T> for TunnelCodec<T> {
    type Error = CodecError;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), CodecError> {
        let json = serde_json::to_vec(&item)?;
        self.frames.encode(Bytes::from(json), dst)?;
        Ok(())
    }
}
