// SPDX-License-Identifier: AGPL-3.0-or-later
//! Helpers for building and consuming [`ByteStream`]s

use bytes::{Bytes, BytesMut};
use futures::{future, stream, StreamExt};

use crate::backend::ByteStream;
use crate::error::StowResult;

/// A stream yielding a single chunk (or none, for empty input)
pub fn once(data: impl Into<Bytes>) -> ByteStream {
    let data = data.into();
    if data.is_empty() {
        Box::pin(stream::empty())
    } else {
        Box::pin(stream::once(future::ready(Ok(data))))
    }
}

/// Drop the first `offset` bytes of a stream.
///
/// Used by drivers that cannot seek: the prefix is still transferred, only
/// never handed to the caller.
pub fn skip_prefix(stream: ByteStream, offset: u64) -> ByteStream {
    if offset == 0 {
        return stream;
    }
    let mut remaining = offset;
    Box::pin(stream.filter_map(move |item| {
        let out = match item {
            Ok(chunk) if remaining == 0 => Some(Ok(chunk)),
            Ok(mut chunk) => {
                let len = chunk.len() as u64;
                if len <= remaining {
                    remaining -= len;
                    None
                } else {
                    let tail = chunk.split_off(remaining as usize);
                    remaining = 0;
                    Some(Ok(tail))
                }
            }
            Err(e) => Some(Err(e)),
        };
        future::ready(out)
    }))
}

/// Read a whole stream into memory
pub async fn collect(mut stream: ByteStream) -> StowResult<Bytes> {
    let mut buf = BytesMut::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(buf.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StowError;

    fn chunks(parts: &[&'static [u8]]) -> ByteStream {
        let items: Vec<StowResult<Bytes>> =
            parts.iter().map(|p| Ok(Bytes::from_static(p))).collect();
        Box::pin(stream::iter(items))
    }

    #[tokio::test]
    async fn test_skip_prefix_across_chunks() {
        let out = collect(skip_prefix(chunks(&[b"abc", b"defg", b"hi"]), 5)).await.unwrap();
        assert_eq!(&out[..], b"fghi");
    }

    #[tokio::test]
    async fn test_skip_prefix_on_chunk_boundary() {
        let out = collect(skip_prefix(chunks(&[b"abc", b"def"]), 3)).await.unwrap();
        assert_eq!(&out[..], b"def");
    }

    #[tokio::test]
    async fn test_skip_past_end_is_empty() {
        let out = collect(skip_prefix(chunks(&[b"abc"]), 10)).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn test_errors_pass_through() {
        let items: Vec<StowResult<Bytes>> = vec![
            Ok(Bytes::from_static(b"ab")),
            Err(StowError::Network("reset".into())),
        ];
        let result = collect(skip_prefix(Box::pin(stream::iter(items)), 1)).await;
        assert!(matches!(result, Err(StowError::Network(_))));
    }

    #[tokio::test]
    async fn test_once_empty() {
        assert!(collect(once(Bytes::new())).await.unwrap().is_empty());
        assert_eq!(&collect(once("xyz")).await.unwrap()[..], b"xyz");
    }
}
