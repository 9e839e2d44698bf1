//! Newline-delimited JSON framing for the controller<->worker control
//! channel — not a raw pickling protocol. Wraps
//! `tokio_util`'s `LinesCodec` rather than reimplementing line splitting.
//! Lives in `core` so the controller and the worker frame the exact same
//! way on either end of the inherited stdin/stdout pipe.

use bytes::BytesMut;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::marker::PhantomData;
use tokio_util::codec::{Decoder, Encoder, LinesCodec};

pub struct JsonLineCodec<T> {
    lines: LinesCodec,
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonLineCodec<T> {
    pub fn new() -> Self {
        Self {
            lines: LinesCodec::new(),
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonLineCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: DeserializeOwned> Decoder for JsonLineCodec<T> {
    type Item = T;
    type Error = anyhow::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<T>, Self::Error> {
        match self.lines.decode(src) {
            Ok(Some(line)) => Ok(Some(serde_json::from_str(&line)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }
}

impl<T: Serialize> Encoder<T> for JsonLineCodec<T> {
    type Error = anyhow::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let line = serde_json::to_string(&item)?;
        self.lines.encode(line, dst).map_err(|e| anyhow::anyhow!(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        n: u32,
    }

    #[test]
    fn round_trips_one_value_per_line() {
        let mut codec = JsonLineCodec::<Ping>::new();
        let mut buf = BytesMut::new();
        codec.encode(Ping { n: 1 }, &mut buf).unwrap();
        codec.encode(Ping { n: 2 }, &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ping { n: 1 }));
        assert_eq!(codec.decode(&mut buf).unwrap(), Some(Ping { n: 2 }));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
    }
}
