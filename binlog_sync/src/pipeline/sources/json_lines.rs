use std::{
    pin::Pin,
    task::{Context, Poll},
};

use async_trait::async_trait;
use futures::{ready, Stream};
use pin_project_lite::pin_project;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};
use tracing::{debug, error};

use crate::{
    conversions::change_event::SourceEvent,
    offset::{OffsetScheme, ReplicationOffset, StartPosition},
};

use super::{already_applied, CdcStream, Source, SourceError};

/// Reads newline-delimited JSON [`SourceEvent`]s, e.g. the output of an
/// external decoder piped into stdin. Lines that do not parse are logged and
/// skipped.
pub struct JsonLinesSource<R> {
    reader: Option<R>,
    scheme: OffsetScheme,
}

impl<R> JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    pub fn new(reader: R, scheme: OffsetScheme) -> Self {
        JsonLinesSource {
            reader: Some(reader),
            scheme,
        }
    }
}

#[async_trait]
impl<R> Source for JsonLinesSource<R>
where
    R: AsyncBufRead + Unpin + Send + 'static,
{
    async fn connect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn get_cdc_stream(&mut self, start: &StartPosition) -> Result<CdcStream, SourceError> {
        let reader = self.reader.take().ok_or(SourceError::StreamAlreadyStarted)?;
        Ok(Box::pin(JsonLinesStream::new(
            reader.lines(),
            start.offset().cloned(),
            self.scheme,
        )))
    }
}

pin_project! {
    #[must_use = "streams do nothing unless polled"]
    pub struct JsonLinesStream<R> {
        #[pin]
        lines: Lines<R>,
        line_number: u64,
        resume: Option<ReplicationOffset>,
        scheme: OffsetScheme,
    }
}

impl<R: AsyncBufRead> JsonLinesStream<R> {
    pub fn new(
        lines: Lines<R>,
        resume: Option<ReplicationOffset>,
        scheme: OffsetScheme,
    ) -> JsonLinesStream<R> {
        JsonLinesStream {
            lines,
            line_number: 0,
            resume,
            scheme,
        }
    }
}

impl<R: AsyncBufRead> Stream for JsonLinesStream<R> {
    type Item = Result<SourceEvent, SourceError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            let line = match ready!(this.lines.as_mut().poll_next_line(cx)) {
                Ok(Some(line)) => line,
                Ok(None) => return Poll::Ready(None),
                Err(e) => return Poll::Ready(Some(Err(e.into()))),
            };
            *this.line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            let event: SourceEvent = match serde_json::from_str(&line) {
                Ok(event) => event,
                Err(e) => {
                    error!(line = *this.line_number, error = %e, "skipping malformed event");
                    continue;
                }
            };
            if already_applied(this.resume.as_ref(), *this.scheme, &event) {
                debug!(offset = %event.offset_token, "skipping event before resume offset");
                continue;
            }
            return Poll::Ready(Some(Ok(event)));
        }
    }
}
