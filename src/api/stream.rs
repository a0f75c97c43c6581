use std::convert::Infallible;

use axum::body::Bytes;
use futures::stream::{self, Stream};
use tokio::sync::watch;

use crate::analytics::EncodedFrame;

pub const BOUNDARY: &str = "frame";

pub fn content_type() -> String {
    format!("multipart/x-mixed-replace; boundary={BOUNDARY}")
}

/// One multipart part carrying a single JPEG.
pub fn multipart_part(jpeg: &[u8]) -> Bytes {
    let header = format!("--{BOUNDARY}\r\nContent-Type: image/jpeg\r\n\r\n");
    let mut part = Vec::with_capacity(header.len() + jpeg.len() + 4);
    part.extend_from_slice(header.as_bytes());
    part.extend_from_slice(jpeg);
    part.extend_from_slice(b"\r\n\r\n");
    Bytes::from(part)
}

/// Follows the session's latest frame. Frames published while the client is
/// slow are skipped, never queued.
pub fn mjpeg_stream(
    mut frames: watch::Receiver<EncodedFrame>,
) -> impl Stream<Item = Result<Bytes, Infallible>> + Send + 'static {
    frames.mark_changed();
    stream::unfold(frames, |mut frames| async move {
        loop {
            if frames.changed().await.is_err() {
                return None;
            }
            let latest = frames.borrow_and_update().clone();
            if let Some(jpeg) = latest {
                return Some((Ok(multipart_part(&jpeg)), frames));
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_multipart_part_layout() {
        let part = multipart_part(&[0xFF, 0xD8, 0xFF, 0xD9]);
        assert!(part.starts_with(b"--frame\r\nContent-Type: image/jpeg\r\n\r\n"));
        assert!(part.ends_with(&[0xFF, 0xD9, b'\r', b'\n', b'\r', b'\n']));
    }

    #[tokio::test]
    async fn test_stream_skips_empty_and_yields_latest() {
        let (tx, rx) = watch::channel::<EncodedFrame>(None);
        let mut parts = Box::pin(mjpeg_stream(rx));

        tx.send_replace(Some(Arc::new(vec![1, 2, 3])));
        tx.send_replace(Some(Arc::new(vec![4, 5, 6])));

        let part = tokio::time::timeout(Duration::from_secs(1), parts.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(part, multipart_part(&[4, 5, 6]));
    }

    #[tokio::test]
    async fn test_stream_ends_when_session_is_gone() {
        let (tx, rx) = watch::channel::<EncodedFrame>(None);
        let mut parts = Box::pin(mjpeg_stream(rx));
        drop(tx);
        assert!(parts.next().await.is_none());
    }
}
